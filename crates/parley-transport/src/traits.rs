//! Transport abstraction traits for Parley.
//!
//! The broker consumes these traits and never sees the underlying protocol.
//! An [`Endpoint`] exchanges discrete frames; the transport is responsible
//! for preserving frame boundaries on the wire. Readiness is expressed
//! through `.await`: a receive that would block suspends the task instead of
//! spinning, and a clean close surfaces as `Ok(None)` rather than an error.

use async_trait::async_trait;
use parley_protocol::{Frame, WireError};
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    Closed,

    /// Failed to send a frame.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive a frame.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Wire protocol error.
    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    /// I/O error. From the accept path this is fatal to the listener.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// A transport that can accept connections.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Accept the next connection.
    ///
    /// Blocks until a connection is available or an error occurs. An
    /// [`TransportError::Io`] from this method means the listening socket
    /// itself failed; any other error is specific to the one connection
    /// being accepted.
    async fn accept(&self) -> Result<Box<dyn Endpoint>, TransportError>;

    /// The address the listener is bound to, if it has one.
    fn local_addr(&self) -> Option<String>;

    /// Transport name (e.g. "websocket", "mem").
    fn name(&self) -> &'static str;
}

/// The receiving half of a split endpoint.
#[async_trait]
pub trait FrameSource: Send {
    /// Receive the next frame. `None` means the peer closed cleanly.
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError>;
}

/// The sending half of a split endpoint.
#[async_trait]
pub trait FrameSink: Send {
    /// Send one frame.
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Flush pending writes and close the connection.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// One side of a logical bidirectional connection.
///
/// `recv`/`send` borrow the whole endpoint and suit sequential exchanges
/// like a handshake; [`split`](Endpoint::split) yields independent halves so
/// reading and writing can proceed concurrently afterwards.
#[async_trait]
pub trait Endpoint: Send {
    /// Receive the next frame. `None` means the peer closed cleanly.
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError>;

    /// Send one frame.
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Split into independently owned read and write halves.
    fn split(self: Box<Self>) -> (Box<dyn FrameSource>, Box<dyn FrameSink>);

    /// Remote address, if the transport knows one.
    fn peer_addr(&self) -> Option<String> {
        None
    }
}
