#![allow(dead_code)]

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use lobby_core::{ClientEvent, ServerEvent};
use lobby_server::auth::{StaticKeySource, TokenVerifier};
use lobby_server::config::ServerConfig;
use lobby_server::LobbyServer;
use serde_json::{json, Value};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub const ISSUER: &str = "https://issuer.test/";
pub const KID: &str = "test-key-1";
pub const JWKS: &str = include_str!("../fixtures/jwks.json");
const PRIVATE_KEY: &str = include_str!("../fixtures/rsa_private.pem");
const OTHER_KEY: &str = include_str!("../fixtures/rsa_other.pem");

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

// ── Tokens ───────────────────────────────────────────────────────────

pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

fn sign_with(claims: &Value, pem: &str) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(KID.to_string());
    let key = EncodingKey::from_rsa_pem(pem.as_bytes()).unwrap();
    encode(&header, claims, &key).unwrap()
}

/// A valid token for `subject` from the trusted issuer.
pub fn token_for(subject: &str) -> String {
    sign_with(
        &json!({"iss": ISSUER, "sub": subject, "exp": now() + 3600}),
        PRIVATE_KEY,
    )
}

/// A token whose signature does not match the published key.
pub fn forged_token_for(subject: &str) -> String {
    sign_with(
        &json!({"iss": ISSUER, "sub": subject, "exp": now() + 3600}),
        OTHER_KEY,
    )
}

/// A correctly signed token from some other issuer.
pub fn foreign_token_for(subject: &str) -> String {
    sign_with(
        &json!({"iss": "https://elsewhere.test/", "sub": subject, "exp": now() + 3600}),
        PRIVATE_KEY,
    )
}

// ── Server ───────────────────────────────────────────────────────────

pub struct TestServer {
    pub ws_addr: SocketAddr,
    pub http_addr: SocketAddr,
    pub server: Arc<LobbyServer>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    pub fn ws_url(&self, token: &str, username: &str) -> String {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("token", token)
            .append_pair("username", username)
            .finish();
        format!("ws://{}/api/ws/?{query}", self.ws_addr)
    }

    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}{path}", self.http_addr)
    }

    /// Trigger shutdown and wait for the server to stop.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            tokio::time::timeout(RECV_TIMEOUT, handle)
                .await
                .expect("server did not stop")
                .unwrap();
        }
    }
}

/// Configuration every test server starts from.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        issuer: ISSUER.to_string(),
        admit_timeout: 5,
        leeway: 0,
        ..ServerConfig::default()
    }
}

pub async fn start_server() -> TestServer {
    start_server_with(test_config()).await
}

pub async fn start_server_with(config: ServerConfig) -> TestServer {
    let source = Arc::new(StaticKeySource::from_json(JWKS).unwrap());
    let verifier = Arc::new(TokenVerifier::new(
        ISSUER,
        source,
        Duration::from_secs(600),
        Duration::from_secs(5),
        config.leeway,
    ));
    let server = Arc::new(LobbyServer::new(config, verifier));

    let ws_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let http_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ws_addr = ws_listener.local_addr().unwrap();
    let http_addr = http_listener.local_addr().unwrap();

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let running = server.clone();
    let handle = tokio::spawn(async move {
        running
            .run_with_shutdown(ws_listener, http_listener, async {
                let _ = shutdown_rx.await;
            })
            .await
            .unwrap();
    });

    TestServer {
        ws_addr,
        http_addr,
        server,
        shutdown_tx: Some(shutdown_tx),
        handle: Some(handle),
    }
}

/// Poll `check` until it holds or the receive timeout elapses.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

// ── Client ───────────────────────────────────────────────────────────

type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestClient {
    pub ws_tx: SplitSink<ClientStream, Message>,
    pub ws_rx: SplitStream<ClientStream>,
}

impl TestClient {
    /// Open the WebSocket without waiting for admission.
    pub async fn connect(url: &str) -> Self {
        let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        let (ws_tx, ws_rx) = ws.split();
        Self { ws_tx, ws_rx }
    }

    /// Connect as `subject` and wait for the first presence update.
    ///
    /// Returns the client and the identities it was told about.
    pub async fn join(server: &TestServer, subject: &str, username: &str) -> (Self, Vec<String>) {
        let mut client = Self::connect(&server.ws_url(&token_for(subject), username)).await;
        let peers = client.recv_clients().await;
        (client, peers)
    }

    pub async fn send_text(&mut self, text: &str) {
        self.ws_tx.send(Message::Text(text.into())).await.unwrap();
    }

    pub async fn send_event(&mut self, event: &ClientEvent) {
        let text = event.encode().unwrap();
        self.send_text(&text).await;
    }

    pub async fn close(mut self) {
        self.ws_tx.send(Message::Close(None)).await.unwrap();
        // Drain until the server acknowledges.
        while let Ok(Some(Ok(_))) = tokio::time::timeout(RECV_TIMEOUT, self.ws_rx.next()).await {}
    }

    /// Next event from the server, skipping control frames.
    pub async fn recv_event(&mut self) -> ServerEvent {
        loop {
            let msg = tokio::time::timeout(RECV_TIMEOUT, self.ws_rx.next())
                .await
                .expect("timeout waiting for event")
                .expect("connection closed")
                .unwrap();
            match msg {
                Message::Text(text) => {
                    if let Some(event) = ServerEvent::decode(&text).unwrap() {
                        return event;
                    }
                }
                Message::Ping(_) | Message::Pong(_) => {}
                other => panic!("expected text frame, got {other:?}"),
            }
        }
    }

    /// Next `clients` event, as a list of identities.
    pub async fn recv_clients(&mut self) -> Vec<String> {
        loop {
            if let ServerEvent::Clients(peers) = self.recv_event().await {
                return peers.into_iter().map(|p| p.identity.to_string()).collect();
            }
        }
    }

    /// Read `clients` events until the view equals `expected`.
    ///
    /// Presence updates coalesce, so intermediate views may be skipped.
    pub async fn wait_for_clients(&mut self, expected: &[&str]) {
        loop {
            if self.recv_clients().await == expected {
                return;
            }
        }
    }

    /// Read until the server's close frame, skipping any events before it.
    pub async fn recv_close(&mut self) -> Option<CloseFrame<'static>> {
        loop {
            let msg = tokio::time::timeout(RECV_TIMEOUT, self.ws_rx.next())
                .await
                .expect("timeout waiting for close");
            match msg {
                Some(Ok(Message::Close(frame))) => return frame.map(CloseFrame::into_owned),
                Some(Ok(_)) => {}
                Some(Err(_)) | None => return None,
            }
        }
    }

    /// Assert nothing but control frames arrives for `wait`.
    pub async fn expect_silence(&mut self, wait: Duration) {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            match tokio::time::timeout_at(deadline, self.ws_rx.next()).await {
                Err(_) => return,
                Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => {}
                Ok(other) => panic!("expected silence, got {other:?}"),
            }
        }
    }
}
