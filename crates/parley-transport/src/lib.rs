//! # parley-transport
//!
//! Transport abstraction layer for the Parley chat relay.
//!
//! The broker consumes the [`Listener`] and [`Endpoint`] traits and knows
//! nothing about how bytes reach the network. Two implementations ship here:
//!
//! - **ws** - WebSocket over tokio-tungstenite (the wire transport)
//! - **mem** - In-process loopback channels (tests and embedding)
//!
//! ```rust,ignore
//! use parley_transport::{Endpoint, Listener};
//!
//! async fn serve(listener: &dyn Listener) {
//!     while let Ok(endpoint) = listener.accept().await {
//!         // hand the endpoint to the relay
//!     }
//! }
//! ```

pub mod mem;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod ws;

pub use traits::{Endpoint, FrameSink, FrameSource, Listener, TransportError};

#[cfg(feature = "websocket")]
pub use ws::{WsConfig, WsListener};
