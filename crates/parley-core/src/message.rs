//! Internal message types for the relay.
//!
//! A [`Message`] is one discrete unit read from a peer (or generated by the
//! broker itself), ready for routing. The payload is [`Bytes`] so fan-out to
//! many recipients never copies it.

use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A unique message identifier.
pub type MessageId = u64;

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a process-unique, monotonically increasing message ID.
#[must_use]
pub fn next_message_id() -> MessageId {
    NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A stable identifier for one connection, assigned at accept time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    /// Get the raw counter value.
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// What a message means to its recipients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// An ordinary chat message from a peer.
    Chat,
    /// A peer joined the relay (broker-originated).
    PeerJoined,
    /// A peer left the relay (broker-originated).
    PeerLeft,
    /// The broker is shutting down (broker-originated).
    Shutdown,
}

/// An immutable routed message.
///
/// Notices are broker-generated; their `sender` is only used for routing
/// exclusion (a join notice should not echo back to the peer who joined),
/// never as an origin claim.
#[derive(Debug, Clone)]
pub struct Message {
    /// Unique message identifier.
    pub id: MessageId,
    /// Connection the routing policy treats as the origin; `None` for
    /// notices addressed to every peer.
    pub sender: Option<ConnectionId>,
    /// Display label of the subject: the sender for chat messages, the
    /// affected peer for join/leave notices.
    pub label: String,
    /// Message kind.
    pub kind: MessageKind,
    /// Payload; empty for notices.
    pub body: Bytes,
    /// Broker receive time, milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl Message {
    /// Create a chat message from a peer.
    #[must_use]
    pub fn chat(sender: ConnectionId, label: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            id: next_message_id(),
            sender: Some(sender),
            label: label.into(),
            kind: MessageKind::Chat,
            body: body.into(),
            timestamp: unix_millis(),
        }
    }

    /// Create a broker-originated notice addressed to every peer.
    #[must_use]
    pub fn notice(kind: MessageKind, label: impl Into<String>) -> Self {
        Self {
            id: next_message_id(),
            sender: None,
            label: label.into(),
            kind,
            body: Bytes::new(),
            timestamp: unix_millis(),
        }
    }

    /// Create a broker-originated notice about `peer`, routed so it is not
    /// echoed back to that peer.
    #[must_use]
    pub fn peer_notice(kind: MessageKind, peer: ConnectionId, label: impl Into<String>) -> Self {
        Self {
            id: next_message_id(),
            sender: Some(peer),
            label: label.into(),
            kind,
            body: Bytes::new(),
            timestamp: unix_millis(),
        }
    }

    /// Check whether this message came from the broker itself.
    #[must_use]
    pub fn is_system(&self) -> bool {
        self.kind != MessageKind::Chat
    }

    /// Get the payload size in bytes.
    #[must_use]
    pub fn payload_size(&self) -> usize {
        self.body.len()
    }
}
