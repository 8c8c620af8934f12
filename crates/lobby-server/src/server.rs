//! Core server: owns the shared registries and runs both listeners.
//!
//! The WebSocket listener feeds accepted connections to the
//! [`ConnectionGateway`]; the HTTP API runs alongside on its own port. Both
//! share one [`TokenVerifier`], so its key cache serves either path.

use crate::auth::{HttpKeySource, KeySource, StaticKeySource, TokenVerifier};
use crate::config::ServerConfig;
use crate::gateway::{ConnectionGateway, SessionSettings};
use crate::http::{self, ApiState};
use crate::relay::ConnectionRegistry;
use crate::services::ServiceRegistry;
use crate::transport::websocket;
use lobby_core::{LobbyError, LobbyResult};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// The lobby server instance.
pub struct LobbyServer {
    config: ServerConfig,
    verifier: Arc<TokenVerifier>,
    registry: Arc<ConnectionRegistry>,
    services: Arc<ServiceRegistry>,
    gateway: Arc<ConnectionGateway>,
}

impl LobbyServer {
    /// Create a server around an already-built verifier.
    pub fn new(config: ServerConfig, verifier: Arc<TokenVerifier>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let services = Arc::new(ServiceRegistry::new());
        let gateway = Arc::new(ConnectionGateway::new(
            verifier.clone(),
            registry.clone(),
            services.clone(),
            SessionSettings::from_config(&config),
        ));
        Self {
            config,
            verifier,
            registry,
            services,
            gateway,
        }
    }

    /// Create a server whose verifier resolves keys as configured: from the
    /// local JWKS file when one is set, otherwise from the issuer over HTTP.
    pub fn from_config(config: ServerConfig) -> LobbyResult<Self> {
        let fetch_timeout = Duration::from_secs(config.fetch_timeout);
        let source: Arc<dyn KeySource> = match &config.jwks_file {
            Some(path) => Arc::new(StaticKeySource::from_file(path)?),
            None => Arc::new(HttpKeySource::new(fetch_timeout)?),
        };
        let verifier = Arc::new(
            TokenVerifier::new(
                config.issuer.clone(),
                source,
                Duration::from_secs(config.jwks_ttl),
                fetch_timeout,
                config.leeway,
            )
            .with_min_refetch(Duration::from_secs(config.min_refetch)),
        );
        info!(issuer = %config.issuer, "token verifier ready");
        Ok(Self::new(config, verifier))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn verifier(&self) -> &Arc<TokenVerifier> {
        &self.verifier
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.services
    }

    /// Bind the configured addresses and serve until `shutdown` resolves.
    pub async fn run<F>(&self, shutdown: F) -> LobbyResult<()>
    where
        F: Future<Output = ()>,
    {
        let ws_addr = self.config.ws_addr();
        let ws_listener = TcpListener::bind(ws_addr)
            .await
            .map_err(|e| LobbyError::Transport(format!("WS bind {ws_addr} failed: {e}")))?;
        let http_addr = self.config.http_addr();
        let http_listener = TcpListener::bind(http_addr)
            .await
            .map_err(|e| LobbyError::Transport(format!("HTTP bind {http_addr} failed: {e}")))?;
        self.run_with_shutdown(ws_listener, http_listener, shutdown)
            .await
    }

    /// Serve on pre-bound listeners until `shutdown` resolves.
    pub async fn run_with_shutdown<F>(
        &self,
        ws_listener: TcpListener,
        http_listener: TcpListener,
        shutdown: F,
    ) -> LobbyResult<()>
    where
        F: Future<Output = ()>,
    {
        let (stop_tx, mut stop_rx) = broadcast::channel::<()>(1);
        let api_state = ApiState {
            verifier: self.verifier.clone(),
            registry: self.registry.clone(),
            services: self.services.clone(),
        };
        let api = tokio::spawn(http::serve(http_listener, api_state, async move {
            let _ = stop_rx.recv().await;
        }));

        let mut ws_rx = websocket::start_listener(
            ws_listener,
            self.config.ws_path.clone(),
            Duration::from_secs(self.config.admit_timeout),
        );

        info!(
            issuer = %self.config.issuer,
            ws_path = %self.config.ws_path,
            "lobby-server ready"
        );

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                conn = ws_rx.recv() => {
                    match conn {
                        Some(conn) => {
                            let gateway = self.gateway.clone();
                            tokio::spawn(async move { gateway.handle(conn).await });
                        }
                        None => {
                            warn!("WebSocket listener closed");
                            break;
                        }
                    }
                }
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
            }
        }

        // Stops the accept loop.
        drop(ws_rx);
        let sessions = self.gateway.shutdown();
        info!(sessions, "closing active sessions");
        let _ = stop_tx.send(());

        match api.await {
            Ok(result) => result,
            Err(e) => Err(LobbyError::Other(format!("HTTP API task failed: {e}"))),
        }
    }
}
