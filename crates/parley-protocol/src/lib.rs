//! # parley-protocol
//!
//! Wire protocol definitions for the Parley chat relay.
//!
//! This crate defines the binary protocol spoken between Parley clients and
//! the broker: frame types, the streaming codec, and version negotiation.
//!
//! ## Frame Types
//!
//! - `Hello` / `Welcome` - Connection handshake
//! - `Chat` - One outbound message from a client
//! - `Relay` - A peer's message fanned out by the broker
//! - `System` - Broker notices (peer joined/left, shutdown)
//! - `Ping` / `Pong` - Keepalive
//! - `Error` / `Bye` - Rejections and explicit leave
//!
//! ## Example
//!
//! ```rust
//! use bytes::BytesMut;
//! use parley_protocol::{codec, Frame};
//!
//! let frame = Frame::chat(b"Hello, world!".to_vec());
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let mut buf = BytesMut::from(&encoded[..]);
//! let decoded = codec::decode_from(&mut buf).unwrap().unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frames;

pub use codec::{WireCodec, WireError, DEFAULT_MAX_FRAME};
pub use frames::{Frame, FrameType, SystemEvent, PROTOCOL_VERSION};
