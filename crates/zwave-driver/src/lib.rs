//! Z-Wave host driver core
//!
//! This crate turns a stream of bytes on a serial link into addressed
//! command exchanges with remote devices, and back again:
//!
//! - the [`TransactionEngine`] owns the outbound send queue and the single
//!   in-flight transaction, with ACK/NAK/CAN handling and bounded retry;
//! - wake-up redirection parks messages for sleeping battery devices on a
//!   per-node queue and flushes them in order at wake;
//! - the poll scheduler re-requests dynamic state from a round-robin list
//!   of devices, spreading a fixed interval evenly across them;
//! - security sessions (from `zwave-security`) are wired into the inbound
//!   and outbound paths for encapsulated traffic.
//!
//! The [`Driver`] runs it all on three threads (reader, sender, poller)
//! over a [`SerialTransport`] the platform layer provides. Decoded,
//! decrypted payloads leave the core through the [`CommandDispatcher`]
//! contract.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use zwave_driver::{Driver, DriverConfig, MockTransport, NullDispatcher};
//! use zwave_frame::Message;
//!
//! let (transport, _handle) = MockTransport::new();
//! let mut driver = Driver::new(
//!     Box::new(transport),
//!     Arc::new(NullDispatcher),
//!     DriverConfig::default(),
//! );
//! driver.start()?;
//! driver.add_node(5, true, false);
//! driver.send_message(Message::send_data("BasicCmd_Set", 5, &[0x20, 0x01, 0xFF], None, None)?)?;
//! ```

mod config;
mod dispatch;
mod driver;
mod error;
mod node;
mod poll;
mod stats;
mod transaction;
mod transport;

pub use config::*;
pub use dispatch::*;
pub use driver::*;
pub use error::*;
pub use node::*;
pub use poll::*;
pub use stats::*;
pub use transaction::*;
pub use transport::*;
