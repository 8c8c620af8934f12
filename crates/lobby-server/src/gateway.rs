//! Per-connection lifecycle: authenticate, admit, relay, evict.
//!
//! ```text
//! Connecting -> Authenticating -> Active -> Disconnected
//!                     |                         ^
//!                     +-------------------------+
//! ```
//!
//! A client is only constructed once verification succeeds, so nothing is
//! ever visible in the registry for a connection still authenticating.

use crate::auth::TokenVerifier;
use crate::config::ServerConfig;
use crate::handshake;
use crate::relay::{Client, ConnectionId, ConnectionRegistry, Inbox, MessageRouter};
use crate::services::{Registration, ServiceRegistry};
use crate::transport::{ws_close, ws_send_event, WebSocketConnection};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use lobby_core::messages::{CreateServerPayload, MessagePayload, RemoveServerPayload};
use lobby_core::{ClientEvent, Identity, LobbyError, LobbyResult, ServerEvent};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsRecv = SplitStream<WebSocketStream<TcpStream>>;

/// Lifecycle of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport accepted, credentials captured.
    Connecting,
    /// Token under verification.
    Authenticating,
    /// Admitted into the registry; events are dispatched.
    Active,
    Disconnected,
}

impl ConnectionState {
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Authenticating)
                | (Authenticating, Active)
                | (Authenticating, Disconnected)
                | (Active, Disconnected)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Disconnected)
    }
}

/// Tracks the state of one connection for logging.
struct Lifecycle {
    remote: SocketAddr,
    state: ConnectionState,
}

impl Lifecycle {
    fn new(remote: SocketAddr) -> Self {
        Self {
            remote,
            state: ConnectionState::Connecting,
        }
    }

    fn advance(&mut self, next: ConnectionState) {
        if !self.state.can_transition_to(next) {
            warn!(remote = %self.remote, from = ?self.state, to = ?next, "illegal connection state transition");
            return;
        }
        debug!(remote = %self.remote, from = ?self.state, to = ?next, "connection state");
        self.state = next;
    }
}

/// How an active session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// Client closed or the transport went away.
    Closed,
    /// A newer connection took over this identity.
    Replaced,
    /// The server is stopping.
    Shutdown,
    /// Nothing arrived from the peer within the idle timeout.
    Idle,
}

/// Timing and queue limits applied to every connection.
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    /// Bound on token verification.
    pub admit_timeout: Duration,
    /// Capacity of each client's routed-event queue.
    pub outbound_queue: usize,
    pub ping_interval: Duration,
    /// Longest silence from the peer before the session is dropped. Also
    /// bounds a single frame write.
    pub idle_timeout: Duration,
}

impl SessionSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            admit_timeout: Duration::from_secs(config.admit_timeout),
            outbound_queue: config.outbound_queue,
            ping_interval: Duration::from_secs(config.ping_interval),
            idle_timeout: Duration::from_secs(config.idle_timeout),
        }
    }
}

/// Ties a connection to the verifier, registries and router.
pub struct ConnectionGateway {
    verifier: Arc<TokenVerifier>,
    registry: Arc<ConnectionRegistry>,
    services: Arc<ServiceRegistry>,
    router: MessageRouter,
    settings: SessionSettings,
    shutdown_tx: broadcast::Sender<()>,
}

impl ConnectionGateway {
    pub fn new(
        verifier: Arc<TokenVerifier>,
        registry: Arc<ConnectionRegistry>,
        services: Arc<ServiceRegistry>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            router: MessageRouter::new(registry.clone()),
            verifier,
            registry,
            services,
            settings,
            shutdown_tx: broadcast::channel(1).0,
        }
    }

    /// Tell every active session to close. Returns how many were listening.
    pub fn shutdown(&self) -> usize {
        self.shutdown_tx.send(()).unwrap_or(0)
    }

    /// Drive one connection from handshake to disconnect.
    pub async fn handle(&self, conn: WebSocketConnection) {
        let WebSocketConnection {
            ws_stream,
            remote_addr,
            credentials,
        } = conn;
        let mut lifecycle = Lifecycle::new(remote_addr);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        lifecycle.advance(ConnectionState::Authenticating);
        let identity =
            match handshake::authenticate(&self.verifier, &credentials, self.settings.admit_timeout)
                .await
            {
                Ok(identity) => identity,
                Err(e) => {
                    let event = handshake::build_connect_error(&e);
                    if let Err(send_err) = ws_send_event(&mut ws_tx, &event).await {
                        debug!(remote = %remote_addr, error = %send_err, "connect_error not sent");
                    }
                    ws_close(&mut ws_tx, CloseCode::Policy, handshake::AUTH_ERROR_MESSAGE).await;
                    lifecycle.advance(ConnectionState::Disconnected);
                    return;
                }
            };

        let connection_id = self.registry.next_connection_id();
        let (client, mut inbox) = Client::new(
            identity.clone(),
            credentials.username.clone(),
            connection_id,
            self.settings.outbound_queue,
        );
        self.registry.admit(client).await;
        lifecycle.advance(ConnectionState::Active);

        let result = self
            .run_session(&identity, &mut ws_tx, &mut ws_rx, &mut inbox, &mut shutdown_rx)
            .await;
        match result {
            Ok(SessionEnd::Closed) => {
                info!(identity = %identity, remote = %remote_addr, "client disconnected");
            }
            Ok(SessionEnd::Replaced) => {
                info!(identity = %identity, remote = %remote_addr, "session replaced by newer connection");
                ws_close(&mut ws_tx, CloseCode::Normal, "replaced by a newer connection").await;
            }
            Ok(SessionEnd::Shutdown) => {
                ws_close(&mut ws_tx, CloseCode::Away, "server shutting down").await;
            }
            Ok(SessionEnd::Idle) => {
                // The peer is presumed gone; dropping the stream closes the socket.
                info!(identity = %identity, remote = %remote_addr, "idle timeout, dropping session");
            }
            Err(e) => {
                warn!(identity = %identity, remote = %remote_addr, error = %e, "session ended with error");
            }
        }

        self.disconnect(&identity, connection_id).await;
        lifecycle.advance(ConnectionState::Disconnected);
    }

    /// Evict the connection and, if it still held the identity, drop the
    /// identity's advertised services before any successor can be admitted.
    async fn disconnect(&self, identity: &Identity, connection_id: ConnectionId) {
        self.registry
            .evict_connection_then(identity, connection_id, move || async move {
                self.services.remove_owner(identity).await;
            })
            .await;
    }

    async fn run_session(
        &self,
        identity: &Identity,
        ws_tx: &mut WsSink,
        ws_rx: &mut WsRecv,
        inbox: &mut Inbox,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> LobbyResult<SessionEnd> {
        let period = self.settings.ping_interval;
        let mut ping_interval = interval_at(Instant::now() + period, period);
        ping_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_inbound = Instant::now();

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => return Ok(SessionEnd::Shutdown),
                changed = inbox.presence.changed() => {
                    if changed.is_err() {
                        // The registry dropped our handle.
                        return Ok(SessionEnd::Replaced);
                    }
                    let peers = inbox.presence.borrow_and_update().clone();
                    self.send(ws_tx, &ServerEvent::Clients(peers)).await?;
                }
                event = inbox.events.recv() => {
                    match event {
                        Some(event) => self.send(ws_tx, &event).await?,
                        None => return Ok(SessionEnd::Replaced),
                    }
                }
                msg = ws_rx.next() => {
                    last_inbound = Instant::now();
                    match msg {
                        Some(Ok(Message::Text(text))) => self.handle_text(identity, &text).await,
                        Some(Ok(Message::Binary(data))) => {
                            debug!(identity = %identity, len = data.len(), "ignoring binary frame");
                        }
                        Some(Ok(Message::Close(_))) | None => return Ok(SessionEnd::Closed),
                        // Pings are answered by the protocol layer.
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            return Err(LobbyError::Transport(format!("WS recv failed: {e}")));
                        }
                    }
                }
                _ = ping_interval.tick() => {
                    if last_inbound.elapsed() >= self.settings.idle_timeout {
                        return Ok(SessionEnd::Idle);
                    }
                    let ping = ws_tx.send(Message::Ping(Vec::new()));
                    match tokio::time::timeout(self.settings.idle_timeout, ping).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => debug!(identity = %identity, error = %e, "failed to send ping"),
                        Err(_) => return Ok(SessionEnd::Idle),
                    }
                }
            }
        }
    }

    /// Send one event, giving up once the idle timeout passes.
    async fn send(&self, ws_tx: &mut WsSink, event: &ServerEvent) -> LobbyResult<()> {
        tokio::time::timeout(self.settings.idle_timeout, ws_send_event(ws_tx, event))
            .await
            .map_err(|_| LobbyError::Transport("WS send timed out".into()))?
    }

    async fn handle_text(&self, identity: &Identity, text: &str) {
        match ClientEvent::decode(text) {
            Ok(Some(event)) => self.dispatch(identity, event).await,
            Ok(None) => debug!(identity = %identity, "ignoring unrecognized event"),
            Err(e) => warn!(identity = %identity, error = %e, "ignoring undecodable frame"),
        }
    }

    async fn dispatch(&self, identity: &Identity, event: ClientEvent) {
        match event {
            ClientEvent::Message(MessagePayload { to, kind, data }) => {
                self.router.route(identity, &to, kind, data).await;
            }
            ClientEvent::CreateServer(CreateServerPayload { kind, data }) => {
                if self.services.register(identity.clone(), kind, data).await
                    == Registration::AlreadyExists
                {
                    debug!(identity = %identity, "duplicate create_server ignored");
                }
            }
            ClientEvent::RemoveServer(RemoveServerPayload { kind }) => {
                self.services.unregister(identity, &kind).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::verifier::test_support::{self, ISSUER};
    use crate::auth::StaticKeySource;
    use serde_json::json;

    fn gateway() -> ConnectionGateway {
        let source = Arc::new(StaticKeySource::from_json(test_support::JWKS).unwrap());
        let verifier = Arc::new(TokenVerifier::new(
            ISSUER,
            source,
            Duration::from_secs(600),
            Duration::from_secs(5),
            0,
        ));
        ConnectionGateway::new(
            verifier,
            Arc::new(ConnectionRegistry::new()),
            Arc::new(ServiceRegistry::new()),
            SessionSettings::from_config(&ServerConfig::default()),
        )
    }

    async fn admit(gw: &ConnectionGateway, id: &str) -> (ConnectionId, Inbox) {
        let connection_id = gw.registry.next_connection_id();
        let (client, inbox) = Client::new(Identity::from(id), id.to_string(), connection_id, 16);
        gw.registry.admit(client).await;
        (connection_id, inbox)
    }

    fn drain(inbox: &mut Inbox) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = inbox.events.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn state_transitions() {
        use ConnectionState::*;
        assert!(Connecting.can_transition_to(Authenticating));
        assert!(Authenticating.can_transition_to(Active));
        assert!(Authenticating.can_transition_to(Disconnected));
        assert!(Active.can_transition_to(Disconnected));

        assert!(!Connecting.can_transition_to(Active));
        assert!(!Active.can_transition_to(Authenticating));
        assert!(!Disconnected.can_transition_to(Active));
        assert!(Disconnected.is_terminal());
        assert!(!Active.is_terminal());
    }

    #[tokio::test]
    async fn message_frame_is_routed() {
        let gw = gateway();
        let (_, _inbox1) = admit(&gw, "u1").await;
        let (_, mut inbox2) = admit(&gw, "u2").await;

        gw.handle_text(
            &Identity::from("u1"),
            r#"{"event":"message","data":{"to":"u2","type":"TEXT","data":"hi"}}"#,
        )
        .await;

        let events = drain(&mut inbox2);
        assert_eq!(events.len(), 1);
        match &events[0] {
            ServerEvent::Message(msg) => {
                assert_eq!(msg.from.as_str(), "u1");
                assert_eq!(msg.kind, "TEXT");
                assert_eq!(msg.data, json!("hi"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn create_and_remove_server_frames() {
        let gw = gateway();
        let owner = Identity::from("u1");
        let create = r#"{"event":"create_server","data":{"type":"game","data":{"slots":4}}}"#;

        gw.handle_text(&owner, create).await;
        gw.handle_text(&owner, create).await;
        assert_eq!(gw.services.len().await, 1);

        gw.handle_text(&owner, r#"{"event":"remove_server","data":{"type":"game"}}"#)
            .await;
        assert!(gw.services.is_empty().await);
    }

    #[tokio::test]
    async fn unknown_and_malformed_frames_are_ignored() {
        let gw = gateway();
        let (_, mut inbox) = admit(&gw, "u1").await;

        let owner = Identity::from("u1");
        gw.handle_text(&owner, r#"{"event":"dance","data":{}}"#).await;
        gw.handle_text(&owner, "not json").await;
        gw.handle_text(&owner, r#"{"event":"message","data":{"type":"x"}}"#).await;

        assert!(drain(&mut inbox).is_empty());
        assert_eq!(gw.registry.len().await, 1);
    }

    #[tokio::test]
    async fn disconnect_cascades_to_services() {
        let gw = gateway();
        let owner = Identity::from("u1");
        let (connection_id, _inbox) = admit(&gw, "u1").await;
        gw.services.register(owner.clone(), "game".into(), json!(null)).await;

        gw.disconnect(&owner, connection_id).await;
        assert!(gw.registry.is_empty().await);
        assert!(gw.services.is_empty().await);
    }

    #[tokio::test]
    async fn stale_disconnect_keeps_successor_services() {
        let gw = gateway();
        let owner = Identity::from("u1");
        let (old_id, _old_inbox) = admit(&gw, "u1").await;
        let (_new_id, _new_inbox) = admit(&gw, "u1").await;
        gw.services.register(owner.clone(), "game".into(), json!(null)).await;

        gw.disconnect(&owner, old_id).await;
        assert_eq!(gw.registry.len().await, 1);
        assert_eq!(gw.services.len().await, 1);
    }

    #[tokio::test]
    async fn successor_registration_survives_predecessor_disconnect() {
        let gw = Arc::new(gateway());
        let owner = Identity::from("u1");
        let (old_id, _old_inbox) = admit(&gw, "u1").await;
        gw.services.register(owner.clone(), "game".into(), json!(1)).await;

        // Whichever order the registry lock allows, the live session ends up
        // owning a record.
        let leaving = {
            let gw = gw.clone();
            let owner = owner.clone();
            tokio::spawn(async move { gw.disconnect(&owner, old_id).await })
        };
        let joining = {
            let gw = gw.clone();
            let owner = owner.clone();
            tokio::spawn(async move {
                let (_, inbox) = admit(&gw, "u1").await;
                gw.handle_text(
                    &owner,
                    r#"{"event":"create_server","data":{"type":"game","data":2}}"#,
                )
                .await;
                inbox
            })
        };
        leaving.await.unwrap();
        let _inbox = joining.await.unwrap();

        assert_eq!(gw.registry.len().await, 1);
        assert!(gw.services.find("game", &owner).await.is_some());
    }
}
