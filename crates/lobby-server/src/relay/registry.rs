//! Registry of connected, authenticated clients.
//!
//! Keyed by identity. Every membership change publishes a fresh peer view to
//! everyone still connected, each view excluding its recipient.

use lobby_core::{Identity, PeerInfo, ServerEvent};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, warn};

/// Monotonic id distinguishing successive connections of one identity.
pub type ConnectionId = u64;

/// An admitted connection.
///
/// Both senders stay inside the registry. Dropping the client closes them,
/// which is how its session learns it was replaced.
#[derive(Debug)]
pub struct Client {
    pub identity: Identity,
    pub username: String,
    pub connection_id: ConnectionId,
    outbound: mpsc::Sender<ServerEvent>,
    presence: watch::Sender<Vec<PeerInfo>>,
}

/// Receiving side of a client's queues, owned by its session.
///
/// Routed events queue up to a bound. Presence is a single slot: a newer
/// peer view overwrites one the session has not sent yet.
#[derive(Debug)]
pub struct Inbox {
    pub events: mpsc::Receiver<ServerEvent>,
    pub presence: watch::Receiver<Vec<PeerInfo>>,
}

impl Client {
    pub fn new(
        identity: Identity,
        username: String,
        connection_id: ConnectionId,
        queue: usize,
    ) -> (Self, Inbox) {
        let (outbound, events) = mpsc::channel(queue);
        let (presence, presence_rx) = watch::channel(Vec::new());
        let client = Self {
            identity,
            username,
            connection_id,
            outbound,
            presence,
        };
        let inbox = Inbox {
            events,
            presence: presence_rx,
        };
        (client, inbox)
    }

    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            identity: self.identity.clone(),
            username: self.username.clone(),
        }
    }

    /// Queue an event for this connection without waiting.
    pub(crate) fn push(&self, event: ServerEvent) -> bool {
        match self.outbound.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                warn!(
                    identity = %self.identity,
                    event = event.tag(),
                    "outbound queue full, dropping event"
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(identity = %self.identity, "outbound queue closed");
                false
            }
        }
    }

    /// Replace this connection's peer view.
    fn publish_presence(&self, peers: Vec<PeerInfo>) {
        self.presence.send_replace(peers);
    }
}

/// Authoritative set of connected identities.
pub struct ConnectionRegistry {
    clients: RwLock<HashMap<Identity, Client>>,
    next_connection_id: AtomicU64,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            next_connection_id: AtomicU64::new(1),
        }
    }

    /// Allocate the id for a connection about to be admitted.
    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Add a client and broadcast presence to everyone.
    ///
    /// A client already registered under the same identity is replaced and
    /// dropped, which closes its outbound queue. Returns `true` if a previous
    /// session was replaced.
    pub async fn admit(&self, client: Client) -> bool {
        let mut clients = self.clients.write().await;
        let identity = client.identity.clone();
        let connection_id = client.connection_id;

        let replaced = clients.insert(identity.clone(), client);
        if let Some(old) = &replaced {
            info!(
                identity = %identity,
                old_connection = old.connection_id,
                new_connection = connection_id,
                "identity reconnected, replacing previous session"
            );
        }
        info!(identity = %identity, connection_id, peers = clients.len(), "client admitted");

        broadcast_presence(&clients);
        replaced.is_some()
    }

    /// Remove the client registered under `identity` and rebroadcast.
    ///
    /// Absent identities are a no-op; returns whether anything was removed.
    pub async fn evict(&self, identity: &Identity) -> bool {
        let mut clients = self.clients.write().await;
        if clients.remove(identity).is_none() {
            return false;
        }
        info!(identity = %identity, peers = clients.len(), "client evicted");
        broadcast_presence(&clients);
        true
    }

    /// Evict only if `identity` is still held by `connection_id`.
    ///
    /// A session replaced by a newer connection must not evict its successor
    /// when it finally disconnects.
    pub async fn evict_connection(&self, identity: &Identity, connection_id: ConnectionId) -> bool {
        self.evict_connection_then(identity, connection_id, || async {})
            .await
    }

    /// Like [`evict_connection`](Self::evict_connection), running `cleanup`
    /// after an actual eviction while the registry is still locked.
    ///
    /// No new session for `identity` can be admitted until `cleanup` is done,
    /// so cleanup never touches state belonging to a successor.
    pub async fn evict_connection_then<F, Fut>(
        &self,
        identity: &Identity,
        connection_id: ConnectionId,
        cleanup: F,
    ) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut clients = self.clients.write().await;
        match clients.get(identity) {
            Some(client) if client.connection_id == connection_id => {}
            _ => {
                debug!(identity = %identity, connection_id, "stale connection, nothing to evict");
                return false;
            }
        }
        clients.remove(identity);
        info!(identity = %identity, connection_id, peers = clients.len(), "client evicted");
        broadcast_presence(&clients);
        cleanup().await;
        true
    }

    /// Look up a connected identity.
    pub async fn find(&self, identity: &Identity) -> Option<PeerInfo> {
        self.clients.read().await.get(identity).map(Client::info)
    }

    /// Run `f` against a connected client (holds read lock).
    pub async fn with_client<F, R>(&self, identity: &Identity, f: F) -> Option<R>
    where
        F: FnOnce(&Client) -> R,
    {
        let clients = self.clients.read().await;
        clients.get(identity).map(f)
    }

    /// Snapshot of every connected peer, in admission order.
    pub async fn peers(&self) -> Vec<PeerInfo> {
        let clients = self.clients.read().await;
        snapshot(&clients).into_iter().map(Client::info).collect()
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }
}

/// Clients ordered by connection id, so every broadcast lists peers in
/// admission order.
fn snapshot(clients: &HashMap<Identity, Client>) -> Vec<&Client> {
    let mut snapshot: Vec<&Client> = clients.values().collect();
    snapshot.sort_by_key(|c| c.connection_id);
    snapshot
}

/// Publish to each client the peer list minus itself.
///
/// Called with the write lock held: the snapshot cannot change underneath
/// the broadcast, and each client's slot always ends up holding the view
/// of the latest membership change.
fn broadcast_presence(clients: &HashMap<Identity, Client>) {
    let snapshot = snapshot(clients);
    for recipient in &snapshot {
        let peers: Vec<PeerInfo> = snapshot
            .iter()
            .filter(|c| c.identity != recipient.identity)
            .map(|c| c.info())
            .collect();
        recipient.publish_presence(peers);
    }
    debug!(recipients = snapshot.len(), "presence broadcast");
}
