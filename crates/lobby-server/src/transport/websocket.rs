//! WebSocket listener using tokio-tungstenite.
//!
//! The upgrade request is checked while the HTTP handshake is still in
//! progress: a wrong path answers 404, missing credentials answer 401, and
//! neither ever becomes a WebSocket.

use crate::handshake::{self, Credentials, HandshakeRejection};
use futures_util::{Sink, SinkExt};
use lobby_core::{LobbyError, LobbyResult, ServerEvent, MAX_FRAME_SIZE};
use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
    /// Credentials captured from the upgrade request.
    pub credentials: Credentials,
}

/// Accept connections on `listener` until the returned receiver is dropped.
///
/// A peer that has not completed the upgrade within `handshake_timeout` is
/// disconnected.
pub fn start_listener(
    listener: TcpListener,
    ws_path: String,
    handshake_timeout: Duration,
) -> mpsc::Receiver<WebSocketConnection> {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, path = %ws_path, "WebSocket listener started");
    }

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);
    let ws_path = Arc::new(ws_path);

    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = tx.closed() => {
                    debug!("connection receiver dropped, listener stopping");
                    break;
                }
            };
            match accepted {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    let ws_path = ws_path.clone();
                    tokio::spawn(async move {
                        let upgraded =
                            tokio::time::timeout(handshake_timeout, upgrade(stream, addr, &ws_path))
                                .await;
                        match upgraded {
                            Ok(Ok(conn)) => {
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Ok(Err(e)) => {
                                debug!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                            Err(_) => {
                                debug!(remote = %addr, "WebSocket handshake timed out");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    });

    rx
}

/// Run the HTTP upgrade, capturing the credentials from the request URI.
async fn upgrade(
    stream: TcpStream,
    remote_addr: SocketAddr,
    ws_path: &str,
) -> LobbyResult<WebSocketConnection> {
    let captured: Arc<OnceLock<Credentials>> = Arc::new(OnceLock::new());
    let cell = captured.clone();
    let ws_config = WebSocketConfig {
        max_message_size: Some(MAX_FRAME_SIZE),
        max_frame_size: Some(MAX_FRAME_SIZE),
        ..WebSocketConfig::default()
    };

    let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        let uri = req.uri();
        match handshake::check_upgrade(uri.path(), uri.query(), ws_path) {
            Ok(credentials) => {
                let _ = cell.set(credentials);
                Ok(resp)
            }
            Err(rejection) => {
                info!(remote = %remote_addr, path = uri.path(), status = rejection.status(), "upgrade rejected");
                Err(rejection_response(rejection))
            }
        }
    };

    let ws_stream = tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ws_config))
        .await
        .map_err(|e| LobbyError::Transport(format!("WS upgrade failed: {e}")))?;

    let credentials = captured
        .get()
        .cloned()
        .ok_or_else(|| LobbyError::Transport("upgrade completed without credentials".into()))?;

    debug!(remote = %remote_addr, username = %credentials.username, "WebSocket connection accepted");
    Ok(WebSocketConnection {
        ws_stream,
        remote_addr,
        credentials,
    })
}

fn rejection_response(rejection: HandshakeRejection) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(rejection.message().to_string()));
    *response.status_mut() =
        StatusCode::from_u16(rejection.status()).unwrap_or(StatusCode::BAD_REQUEST);
    response
}

/// Helper: encode and send one event as a text frame.
pub async fn ws_send_event<S>(sink: &mut S, event: &ServerEvent) -> LobbyResult<()>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let text = event.encode()?;
    sink.send(Message::Text(text.into()))
        .await
        .map_err(|e| LobbyError::Transport(format!("WS send failed: {e}")))
}

/// Helper: send a close frame. Errors are ignored; the peer may be gone.
pub async fn ws_close<S>(sink: &mut S, code: CloseCode, reason: &str)
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let frame = CloseFrame {
        code,
        reason: reason.to_string().into(),
    };
    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
        debug!(error = %e, "close frame not sent");
    }
}
