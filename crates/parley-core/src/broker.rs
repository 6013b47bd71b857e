//! Message fan-out engine.
//!
//! The broker owns the registry and a dispatch policy and turns one inbound
//! message into deliveries to every routed target. It performs no I/O: the
//! event loop that feeds it lives in the server crate, which keeps the engine
//! testable without sockets and lets several brokers coexist in one process.

use crate::message::{ConnectionId, Message, MessageKind};
use crate::policy::{BroadcastPolicy, RoutePolicy};
use crate::registry::{Connection, Registry, RegistryConfig, RegistryError};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Delivery errors for a single target.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliverError {
    /// No such connection id.
    #[error("Connection not found")]
    NotFound,

    /// The target's endpoint has gone away.
    #[error("Peer closed")]
    PeerClosed,
}

/// Outcome of one dispatch call.
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// Number of targets the message was handed to.
    pub delivered: usize,
    /// Targets whose endpoint failed mid-fan-out. Each has already been
    /// removed from the registry.
    pub failed: Vec<Connection>,
}

/// The central fan-out engine.
pub struct Broker {
    registry: Arc<Registry>,
    policy: Box<dyn RoutePolicy>,
}

impl Broker {
    /// Create a broker with default limits and broadcast routing.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Create a broker with custom registry limits and broadcast routing.
    #[must_use]
    pub fn with_config(config: RegistryConfig) -> Self {
        Self::with_policy(config, Box::new(BroadcastPolicy))
    }

    /// Create a broker with a custom dispatch policy.
    #[must_use]
    pub fn with_policy(config: RegistryConfig, policy: Box<dyn RoutePolicy>) -> Self {
        debug!(policy = policy.name(), "Creating broker");
        Self {
            registry: Arc::new(Registry::with_config(config)),
            policy,
        }
    }

    /// The connection registry.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Register a named connection and hand back its delivery queue.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::ResourceExhausted`] at the connection limit.
    pub fn join(
        &self,
        label: impl Into<String>,
    ) -> Result<(ConnectionId, mpsc::UnboundedReceiver<Arc<Message>>), RegistryError> {
        self.join_with(Some(label.into()))
    }

    /// Register a connection, labeling it with its id when `name` is absent.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::ResourceExhausted`] at the connection limit.
    pub fn join_with(
        &self,
        name: Option<String>,
    ) -> Result<(ConnectionId, mpsc::UnboundedReceiver<Arc<Message>>), RegistryError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.registry.add(name, tx)?;
        Ok((id, rx))
    }

    /// Remove a connection. Idempotent; returns the record on first removal.
    pub fn part(&self, id: ConnectionId) -> Option<Connection> {
        self.registry.remove(id)
    }

    /// Deliver a message to one target.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown ids, `PeerClosed` when the target's writer has
    /// gone away. The caller decides whether to remove the target.
    pub fn deliver(&self, id: ConnectionId, message: Arc<Message>) -> Result<(), DeliverError> {
        let conn = self.registry.get(id).ok_or(DeliverError::NotFound)?;
        conn.enqueue(message).map_err(|_| DeliverError::PeerClosed)
    }

    /// Fan one message out to every routed target.
    ///
    /// A failed target is removed from the registry and reported, and never
    /// aborts delivery to the remaining targets. A target that vanished
    /// between routing and delivery is skipped; its own disconnect path is
    /// already running.
    pub fn dispatch(&self, message: Message) -> DispatchReport {
        let targets = self.policy.route(&self.registry, &message);
        let message = Arc::new(message);
        let mut report = DispatchReport::default();

        for target in targets {
            match self.deliver(target, Arc::clone(&message)) {
                Ok(()) => report.delivered += 1,
                Err(DeliverError::PeerClosed) => {
                    if let Some(conn) = self.registry.remove(target) {
                        debug!(peer = %target, "Dropped dead target during fan-out");
                        report.failed.push(conn);
                    }
                }
                Err(DeliverError::NotFound) => {}
            }
        }

        trace!(
            id = message.id,
            delivered = report.delivered,
            failed = report.failed.len(),
            "Dispatched message"
        );
        report
    }

    /// Fan a broker-originated notice out to every registered peer.
    pub fn announce(&self, kind: MessageKind, peer: impl Into<String>) -> DispatchReport {
        self.dispatch(Message::notice(kind, peer))
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}
