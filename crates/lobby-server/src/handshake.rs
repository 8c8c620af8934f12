//! Connection handshake.
//!
//! Two phases:
//! 1. During the HTTP upgrade, check the request path and pull `token` and
//!    `username` out of the query string. Failures reject the upgrade.
//! 2. After the upgrade, verify the token under the admission timeout.
//!    Failures are reported with a `connect_error` event.

use crate::auth::{AdmissionError, TokenVerifier};
use lobby_core::messages::ConnectErrorPayload;
use lobby_core::{Identity, ServerEvent};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Message carried by every `connect_error` event.
pub const AUTH_ERROR_MESSAGE: &str = "Authentication error";

/// Credentials presented in the upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub token: String,
    pub username: String,
}

/// Why an upgrade request was refused before the WebSocket opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRejection {
    /// Request path is not the configured WebSocket path.
    NotFound,
    /// `token` or `username` is absent or empty.
    MissingCredentials,
}

impl HandshakeRejection {
    pub fn status(&self) -> u16 {
        match self {
            HandshakeRejection::NotFound => 404,
            HandshakeRejection::MissingCredentials => 401,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            HandshakeRejection::NotFound => "Not found",
            HandshakeRejection::MissingCredentials => AUTH_ERROR_MESSAGE,
        }
    }
}

/// Extract credentials from a raw query string. Empty values count as absent.
pub fn parse_credentials(query: &str) -> Option<Credentials> {
    let mut token = None;
    let mut username = None;
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "token" if !value.is_empty() => token = Some(value.into_owned()),
            "username" if !value.is_empty() => username = Some(value.into_owned()),
            _ => {}
        }
    }
    Some(Credentials {
        token: token?,
        username: username?,
    })
}

/// Compare request paths ignoring a trailing slash.
fn same_path(path: &str, ws_path: &str) -> bool {
    let trim = |p: &str| p.trim_end_matches('/').to_string();
    trim(path) == trim(ws_path)
}

/// Validate an upgrade request's path and query.
pub fn check_upgrade(
    path: &str,
    query: Option<&str>,
    ws_path: &str,
) -> Result<Credentials, HandshakeRejection> {
    if !same_path(path, ws_path) {
        debug!(path, "upgrade request for unknown path");
        return Err(HandshakeRejection::NotFound);
    }
    parse_credentials(query.unwrap_or("")).ok_or_else(|| {
        debug!(path, "upgrade request without token or username");
        HandshakeRejection::MissingCredentials
    })
}

/// Verify the presented token, bounded by `admit_timeout`.
pub async fn authenticate(
    verifier: &TokenVerifier,
    credentials: &Credentials,
    admit_timeout: Duration,
) -> Result<Identity, AdmissionError> {
    let result = tokio::time::timeout(admit_timeout, verifier.verify(&credentials.token)).await;
    match result {
        Ok(Ok(identity)) => {
            info!(identity = %identity, username = %credentials.username, "token verified");
            Ok(identity)
        }
        Ok(Err(e)) => {
            warn!(username = %credentials.username, reason = e.reason(), error = %e, "token rejected");
            Err(e)
        }
        Err(_) => {
            warn!(
                username = %credentials.username,
                timeout_secs = admit_timeout.as_secs(),
                "token verification timed out"
            );
            Err(AdmissionError::KeyResolutionFailure(format!(
                "verification did not finish within {}s",
                admit_timeout.as_secs()
            )))
        }
    }
}

/// The event sent to a connection whose credentials were refused.
pub fn build_connect_error(error: &AdmissionError) -> ServerEvent {
    ServerEvent::ConnectError(ConnectErrorPayload {
        message: AUTH_ERROR_MESSAGE.to_string(),
        reason: error.reason().to_string(),
    })
}
