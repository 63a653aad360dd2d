//! Z-Wave Serial API link layer
//!
//! This crate provides the byte-level protocol between a host and a Z-Wave
//! controller on a serial line: the frame envelope, the control bytes, and
//! the outbound message builder used by everything above it.
//!
//! # Protocol Overview
//!
//! Traffic on the wire is either a single control byte or a framed message:
//!
//! - **Control bytes** (either direction): `ACK`, `NAK`, `CAN`
//! - **Framed messages**: `SOF` + length + payload + checksum
//!
//! A framed payload starts with a message type byte (`REQUEST` or
//! `RESPONSE`) followed by the Serial API function id, so the first thing a
//! receiver learns about a frame is which operation it belongs to.
//!
//! # Example
//!
//! ```rust,ignore
//! use zwave_frame::{FrameCodec, LinkInput, Message};
//!
//! // Build an outbound message
//! let mut msg = Message::request_node_info(5);
//! msg.finalize();
//!
//! // Feed received bytes
//! let mut codec = FrameCodec::new();
//! codec.push(&received);
//! while let Some(input) = codec.decode() {
//!     match input {
//!         LinkInput::Control(c) => { /* ... */ }
//!         LinkInput::Frame(payload) => { /* ... */ }
//!         _ => {}
//!     }
//! }
//! ```

mod constants;
mod error;
mod frame;
mod message;

pub use constants::*;
pub use error::*;
pub use frame::*;
pub use message::*;
