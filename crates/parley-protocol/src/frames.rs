//! Frame types for the Parley protocol.
//!
//! Frames are the discrete units exchanged between a client and the broker.
//! Each frame is serialized with MessagePack; framing preserves message
//! boundaries, so one frame is always one application-level message.

use serde::{Deserialize, Serialize};

/// Current protocol version. Clients announcing a different version in
/// `Hello` are rejected with [`ERR_UNSUPPORTED_VERSION`].
pub const PROTOCOL_VERSION: u8 = 1;

/// Error code: the client's protocol version is not supported.
pub const ERR_UNSUPPORTED_VERSION: u16 = 1001;
/// Error code: the broker is at its connection limit.
pub const ERR_SERVER_FULL: u16 = 1002;
/// Error code: malformed or unexpected frame.
pub const ERR_BAD_FRAME: u16 = 1003;
/// Error code: the requested display name is invalid.
pub const ERR_INVALID_NAME: u16 = 1004;

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum FrameType {
    Hello = 0x01,
    Welcome = 0x02,
    Chat = 0x03,
    Relay = 0x04,
    System = 0x05,
    Error = 0x06,
    Ping = 0x07,
    Pong = 0x08,
    Bye = 0x09,
}

impl From<FrameType> for u8 {
    fn from(ft: FrameType) -> u8 {
        ft as u8
    }
}

impl TryFrom<u8> for FrameType {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(FrameType::Hello),
            0x02 => Ok(FrameType::Welcome),
            0x03 => Ok(FrameType::Chat),
            0x04 => Ok(FrameType::Relay),
            0x05 => Ok(FrameType::System),
            0x06 => Ok(FrameType::Error),
            0x07 => Ok(FrameType::Ping),
            0x08 => Ok(FrameType::Pong),
            0x09 => Ok(FrameType::Bye),
            _ => Err("Invalid frame type"),
        }
    }
}

/// Broker-originated notice kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum SystemEvent {
    /// A peer joined the relay.
    Joined = 0,
    /// A peer left the relay.
    Left = 1,
    /// The broker is shutting down.
    Shutdown = 2,
}

impl From<SystemEvent> for u8 {
    fn from(ev: SystemEvent) -> u8 {
        ev as u8
    }
}

impl TryFrom<u8> for SystemEvent {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SystemEvent::Joined),
            1 => Ok(SystemEvent::Left),
            2 => Ok(SystemEvent::Shutdown),
            _ => Err("Invalid system event"),
        }
    }
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Client handshake. Must be the first frame on a connection.
    #[serde(rename = "hello")]
    Hello {
        /// Protocol version the client speaks.
        version: u8,
        /// Optional display name; the broker falls back to the
        /// connection id when absent.
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },

    /// Broker handshake reply; the connection is live once received.
    #[serde(rename = "welcome")]
    Welcome {
        /// Identifier the broker assigned to this connection.
        connection_id: String,
        /// Negotiated protocol version.
        version: u8,
        /// Recommended keepalive ping interval in milliseconds.
        heartbeat_ms: u32,
    },

    /// One outbound chat message from a client.
    #[serde(rename = "chat")]
    Chat {
        /// Message payload.
        #[serde(with = "serde_bytes")]
        body: Vec<u8>,
    },

    /// A peer's chat message relayed by the broker.
    #[serde(rename = "relay")]
    Relay {
        /// Label of the sending peer (display name or connection id).
        sender: String,
        /// Message payload.
        #[serde(with = "serde_bytes")]
        body: Vec<u8>,
        /// Broker receive time, milliseconds since the Unix epoch.
        timestamp: u64,
    },

    /// Broker-originated notice.
    #[serde(rename = "system")]
    System {
        /// What happened.
        event: SystemEvent,
        /// The peer the notice is about, if any.
        #[serde(skip_serializing_if = "Option::is_none")]
        peer: Option<String>,
    },

    /// Error response; fatal to the connection when sent during handshake.
    #[serde(rename = "error")]
    Error {
        /// Error code.
        code: u16,
        /// Human-readable error message.
        message: String,
    },

    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping {
        /// Optional timestamp echoed back in the pong.
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Keepalive pong.
    #[serde(rename = "pong")]
    Pong {
        /// Echoed timestamp from the ping.
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Explicit leave; the broker treats this like end-of-stream.
    #[serde(rename = "bye")]
    Bye,
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Hello { .. } => FrameType::Hello,
            Frame::Welcome { .. } => FrameType::Welcome,
            Frame::Chat { .. } => FrameType::Chat,
            Frame::Relay { .. } => FrameType::Relay,
            Frame::System { .. } => FrameType::System,
            Frame::Error { .. } => FrameType::Error,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
            Frame::Bye => FrameType::Bye,
        }
    }

    /// Create a Hello frame for the current protocol version.
    #[must_use]
    pub fn hello(name: Option<String>) -> Self {
        Frame::Hello {
            version: PROTOCOL_VERSION,
            name,
        }
    }

    /// Create a Welcome frame.
    #[must_use]
    pub fn welcome(connection_id: impl Into<String>, heartbeat_ms: u32) -> Self {
        Frame::Welcome {
            connection_id: connection_id.into(),
            version: PROTOCOL_VERSION,
            heartbeat_ms,
        }
    }

    /// Create a Chat frame.
    #[must_use]
    pub fn chat(body: impl Into<Vec<u8>>) -> Self {
        Frame::Chat { body: body.into() }
    }

    /// Create a Relay frame.
    #[must_use]
    pub fn relay(sender: impl Into<String>, body: impl Into<Vec<u8>>, timestamp: u64) -> Self {
        Frame::Relay {
            sender: sender.into(),
            body: body.into(),
            timestamp,
        }
    }

    /// Create a System frame about a peer.
    #[must_use]
    pub fn system(event: SystemEvent, peer: impl Into<String>) -> Self {
        Frame::System {
            event,
            peer: Some(peer.into()),
        }
    }

    /// Create an Error frame.
    #[must_use]
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            code,
            message: message.into(),
        }
    }

    /// Create a Ping frame carrying a timestamp.
    #[must_use]
    pub fn ping(timestamp: Option<u64>) -> Self {
        Frame::Ping { timestamp }
    }

    /// Create a Pong frame echoing a ping timestamp.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }

    /// Check whether a client version can talk to this broker.
    #[must_use]
    pub fn version_compatible(version: u8) -> bool {
        version == PROTOCOL_VERSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type() {
        let hello = Frame::hello(Some("alice".into()));
        assert_eq!(hello.frame_type(), FrameType::Hello);

        let chat = Frame::chat(b"hi".to_vec());
        assert_eq!(chat.frame_type(), FrameType::Chat);

        assert_eq!(Frame::Bye.frame_type(), FrameType::Bye);
    }

    #[test]
    fn test_system_event_conversion() {
        assert_eq!(SystemEvent::try_from(0), Ok(SystemEvent::Joined));
        assert_eq!(SystemEvent::try_from(1), Ok(SystemEvent::Left));
        assert_eq!(SystemEvent::try_from(2), Ok(SystemEvent::Shutdown));
        assert!(SystemEvent::try_from(3).is_err());
    }

    #[test]
    fn test_version_compatibility() {
        assert!(Frame::version_compatible(PROTOCOL_VERSION));
        assert!(!Frame::version_compatible(PROTOCOL_VERSION + 1));
        assert!(!Frame::version_compatible(0));
    }
}
