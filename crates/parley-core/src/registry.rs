//! Connection registry for the relay.
//!
//! The registry is the single owner of all live connection records. Each
//! entry holds the connection's outbound handle; removing the entry drops the
//! handle, which closes the connection's delivery queue. Removal is therefore
//! atomic with endpoint release: no dangling identifiers, no double-close.

use crate::message::{unix_millis, ConnectionId, Message};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Maximum display name length.
pub const MAX_PEER_NAME_LENGTH: usize = 32;

/// Validate a peer display name.
///
/// # Errors
///
/// Returns an error message if the name is invalid.
pub fn validate_peer_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Name cannot be empty");
    }
    if name.len() > MAX_PEER_NAME_LENGTH {
        return Err("Name too long");
    }
    if name.starts_with('$') {
        return Err("Names starting with '$' are reserved");
    }
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Name contains invalid characters");
    }
    Ok(())
}

/// Registry errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The registry is at its connection limit.
    #[error("Connection limit reached")]
    ResourceExhausted,
}

/// Liveness state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Accepted, handshake not yet complete.
    Connecting,
    /// Registered and receiving fan-out.
    Active,
    /// Removed; pending writes drain before the endpoint closes.
    Closing,
    /// Endpoint released.
    Closed,
}

/// Outbound delivery handle: the sending half of a connection's queue.
///
/// The receiving half is drained by the connection's writer task. Sends never
/// block; a send to a peer whose writer is gone fails immediately, which is
/// how dead peers are detected during fan-out.
pub type Outbox = mpsc::UnboundedSender<Arc<Message>>;

/// One registered connection.
#[derive(Debug, Clone)]
pub struct Connection {
    /// Registry-assigned identifier.
    pub id: ConnectionId,
    /// Display label (client-chosen name or the id's string form).
    pub label: String,
    /// Liveness state.
    pub state: PeerState,
    /// When the connection was registered, milliseconds since the epoch.
    pub joined_at: u64,
    outbox: Outbox,
}

impl Connection {
    /// Enqueue a message for delivery to this connection.
    ///
    /// # Errors
    ///
    /// Fails if the connection's writer has gone away.
    pub fn enqueue(&self, message: Arc<Message>) -> Result<(), Arc<Message>> {
        self.outbox.send(message).map_err(|e| e.0)
    }
}

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum number of simultaneous connections.
    pub max_connections: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_connections: 1024,
        }
    }
}

/// The set of currently connected peers, keyed by connection id.
///
/// All mutation goes through [`add`](Registry::add) and
/// [`remove`](Registry::remove); reads hand out clones or id snapshots, never
/// references that could outlive a concurrent removal.
pub struct Registry {
    peers: DashMap<ConnectionId, Connection>,
    next_id: AtomicU64,
    config: RegistryConfig,
}

impl Registry {
    /// Create a registry with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Create a registry with custom configuration.
    #[must_use]
    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            peers: DashMap::new(),
            next_id: AtomicU64::new(1),
            config,
        }
    }

    /// Register a new connection in Active state.
    ///
    /// A connection without a client-chosen name is labeled with its id's
    /// string form.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::ResourceExhausted`] at the connection limit;
    /// existing connections are unaffected.
    pub fn add(
        &self,
        name: Option<String>,
        outbox: Outbox,
    ) -> Result<ConnectionId, RegistryError> {
        if self.peers.len() >= self.config.max_connections {
            return Err(RegistryError::ResourceExhausted);
        }

        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let label = name.unwrap_or_else(|| id.to_string());
        let conn = Connection {
            id,
            label: label.clone(),
            state: PeerState::Active,
            joined_at: unix_millis(),
            outbox,
        };

        self.peers.insert(id, conn);
        debug!(peer = %id, label = %label, "Connection registered");

        Ok(id)
    }

    /// Remove a connection, releasing its outbound handle.
    ///
    /// Idempotent: removing an unknown or already-removed id is a no-op that
    /// returns `None`, so racing disconnect paths cannot fault.
    pub fn remove(&self, id: ConnectionId) -> Option<Connection> {
        let (_, mut conn) = self.peers.remove(&id)?;
        conn.state = PeerState::Closing;
        debug!(peer = %id, "Connection removed");
        Some(conn)
    }

    /// Look up a connection by id.
    #[must_use]
    pub fn get(&self, id: ConnectionId) -> Option<Connection> {
        self.peers.get(&id).map(|c| c.clone())
    }

    /// Check whether an id is registered.
    #[must_use]
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.peers.contains_key(&id)
    }

    /// Number of registered connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Check whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Snapshot of every registered id except `id`, in ascending id order.
    ///
    /// Ascending id order is join order, which keeps fan-out sequencing
    /// deterministic. The returned vector is a copy: registry mutations after
    /// the call are never observed through it.
    #[must_use]
    pub fn all_except(&self, id: ConnectionId) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self
            .peers
            .iter()
            .map(|entry| *entry.key())
            .filter(|other| *other != id)
            .collect();
        ids.sort_unstable();
        trace!(excluded = %id, targets = ids.len(), "Fan-out snapshot");
        ids
    }

    /// Snapshot of every registered id, in ascending id order.
    #[must_use]
    pub fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self.peers.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Remove and return every connection, in ascending id order.
    ///
    /// Used for graceful shutdown: dropping the returned records closes each
    /// outbound handle after its queued messages drain.
    pub fn drain(&self) -> Vec<Connection> {
        let mut drained: Vec<Connection> = self
            .ids()
            .into_iter()
            .filter_map(|id| self.remove(id))
            .collect();
        drained.sort_unstable_by_key(|c| c.id);
        drained
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn outbox() -> (Outbox, mpsc::UnboundedReceiver<Arc<Message>>) {
        mpsc::unbounded_channel()
    }

    fn named(name: &str) -> Option<String> {
        Some(name.to_string())
    }

    #[test]
    fn test_add_assigns_fresh_ids() {
        let registry = Registry::new();
        let (tx1, _rx1) = outbox();
        let (tx2, _rx2) = outbox();

        let a = registry.add(named("alice"), tx1).unwrap();
        let b = registry.add(named("bob"), tx2).unwrap();

        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(a).unwrap().state, PeerState::Active);
        assert_eq!(registry.get(b).unwrap().label, "bob");
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = Registry::new();
        let (tx, _rx) = outbox();
        let id = registry.add(named("alice"), tx).unwrap();

        let removed = registry.remove(id).unwrap();
        assert_eq!(removed.state, PeerState::Closing);
        assert!(!registry.contains(id));

        // Second removal is a no-op, not an error.
        assert!(registry.remove(id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_replay_equivalence() {
        // The live set equals the set of ids whose last event was `add`.
        let registry = Registry::new();
        let mut rxs = Vec::new();

        let mut live = Vec::new();
        for name in ["a", "b", "c", "d"] {
            let (tx, rx) = outbox();
            live.push(registry.add(named(name), tx).unwrap());
            rxs.push(rx);
        }

        registry.remove(live[1]);
        registry.remove(live[3]);
        registry.remove(live[3]);

        assert_eq!(registry.ids(), vec![live[0], live[2]]);
    }

    #[test]
    fn test_all_except_order_and_exclusion() {
        let registry = Registry::new();
        let mut ids = Vec::new();
        let mut rxs = Vec::new();
        for name in ["a", "b", "c"] {
            let (tx, rx) = outbox();
            ids.push(registry.add(named(name), tx).unwrap());
            rxs.push(rx);
        }

        let targets = registry.all_except(ids[1]);
        assert_eq!(targets, vec![ids[0], ids[2]]);

        // The snapshot is a copy; later mutations are not observed.
        registry.remove(ids[2]);
        assert_eq!(targets, vec![ids[0], ids[2]]);
        assert_eq!(registry.all_except(ids[1]), vec![ids[0]]);
    }

    #[test]
    fn test_capacity_rejection_leaves_existing_untouched() {
        let registry = Registry::with_config(RegistryConfig { max_connections: 2 });
        let (tx1, mut rx1) = outbox();
        let (tx2, _rx2) = outbox();
        let (tx3, _rx3) = outbox();

        let a = registry.add(named("a"), tx1).unwrap();
        registry.add(named("b"), tx2).unwrap();

        assert_eq!(registry.add(named("c"), tx3), Err(RegistryError::ResourceExhausted));
        assert_eq!(registry.len(), 2);

        // Existing connections still deliver.
        let msg = Arc::new(Message::chat(a, "a", bytes::Bytes::from_static(b"ok")));
        registry.get(a).unwrap().enqueue(msg).unwrap();
        assert!(rx1.try_recv().is_ok());

        // Capacity freed by removal can be reused.
        registry.remove(a);
        let (tx4, _rx4) = outbox();
        assert!(registry.add(named("d"), tx4).is_ok());
    }

    #[test]
    fn test_drain_empties_registry() {
        let registry = Registry::new();
        let (tx1, _rx1) = outbox();
        let (tx2, _rx2) = outbox();
        let a = registry.add(named("a"), tx1).unwrap();
        let b = registry.add(named("b"), tx2).unwrap();

        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].id, a);
        assert_eq!(drained[1].id, b);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_peer_name_validation() {
        assert!(validate_peer_name("alice").is_ok());
        assert!(validate_peer_name("").is_err());
        assert!(validate_peer_name("$broker").is_err());
        assert!(validate_peer_name(&"x".repeat(MAX_PEER_NAME_LENGTH + 1)).is_err());
        assert!(validate_peer_name("tab\tname").is_err());
    }
}
