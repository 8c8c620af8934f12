//! Request-admission HTTP API.
//!
//! Every route sits behind a bearer-token middleware that runs the same
//! [`TokenVerifier`] as the WebSocket handshake. Requests that fail never
//! reach a handler; requests that pass carry the verified [`Identity`] as a
//! request extension.

use crate::auth::TokenVerifier;
use crate::relay::ConnectionRegistry;
use crate::services::{ServiceRecord, ServiceRegistry};
use axum::extract::{Path, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Extension, Json, Router};
use lobby_core::{bearer_token, Identity, LobbyResult, PeerInfo};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

const NO_TOKEN: &str = "Access denied. No token";
const WRONG_TOKEN: &str = "Access denied. Wrong token";

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct ApiState {
    pub verifier: Arc<TokenVerifier>,
    pub registry: Arc<ConnectionRegistry>,
    pub services: Arc<ServiceRegistry>,
}

#[derive(Debug, Serialize)]
struct Denied {
    error: &'static str,
    reason: &'static str,
}

#[derive(Debug, Serialize)]
struct Me {
    identity: Identity,
}

fn deny(error: &'static str, reason: &'static str) -> Response {
    (StatusCode::UNAUTHORIZED, Json(Denied { error, reason })).into_response()
}

/// Build the API router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/me", get(me))
        .route("/api/clients", get(clients))
        .route("/api/servers/{type}", get(servers))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_bearer))
        .with_state(state)
}

/// Serve the API on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: ApiState, shutdown: F) -> LobbyResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "HTTP API listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn require_bearer(State(state): State<ApiState>, mut request: Request, next: Next) -> Response {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
        .map(str::to_string);

    let Some(token) = token else {
        debug!(path = %request.uri().path(), "request without bearer token");
        return deny(NO_TOKEN, "token_missing");
    };

    match state.verifier.verify(&token).await {
        Ok(identity) => {
            debug!(identity = %identity, path = %request.uri().path(), "request admitted");
            request.extensions_mut().insert(identity);
            next.run(request).await
        }
        Err(e) => {
            warn!(path = %request.uri().path(), reason = e.reason(), error = %e, "request rejected");
            deny(WRONG_TOKEN, e.reason())
        }
    }
}

async fn me(Extension(identity): Extension<Identity>) -> Json<Me> {
    Json(Me { identity })
}

/// Connected peers, minus the caller.
async fn clients(
    State(state): State<ApiState>,
    Extension(identity): Extension<Identity>,
) -> Json<Vec<PeerInfo>> {
    let peers = state
        .registry
        .peers()
        .await
        .into_iter()
        .filter(|p| p.identity != identity)
        .collect();
    Json(peers)
}

async fn servers(
    State(state): State<ApiState>,
    Path(resource_type): Path<String>,
) -> Json<Vec<ServiceRecord>> {
    Json(state.services.list(&resource_type).await)
}
