//! Command dispatcher contract.
//!
//! Once a frame has been unwrapped (and decrypted where applicable), the
//! resulting application payload is handed to the command dispatcher, which
//! resolves it to a device + instance + command-class handler. The driver
//! core never inspects payload contents beyond this point; the dispatcher
//! and everything behind it belong to the device/value model.

use thiserror::Error;

/// Errors a dispatcher may report back to the driver.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// No handler is registered for this command class on this node.
    #[error("no handler for command class 0x{command_class:02X} on node {node_id}")]
    NoHandler {
        /// Source node id.
        node_id: u8,
        /// Command class id with no handler.
        command_class: u8,
    },

    /// The payload did not parse as the command class expects.
    #[error("malformed command payload: {0}")]
    Malformed(String),
}

/// Resolves decoded, decrypted payloads to command-class handlers.
pub trait CommandDispatcher: Send + Sync {
    /// Deliver a command payload (command byte onward) received from
    /// `node_id` for `command_class_id`.
    fn dispatch(
        &self,
        node_id: u8,
        instance: u8,
        command_class_id: u8,
        payload: &[u8],
    ) -> Result<(), DispatchError>;
}

/// A dispatcher that drops everything; useful as a default and in tests
/// that only exercise the transport side.
#[derive(Debug, Default)]
pub struct NullDispatcher;

impl CommandDispatcher for NullDispatcher {
    fn dispatch(
        &self,
        node_id: u8,
        _instance: u8,
        command_class_id: u8,
        _payload: &[u8],
    ) -> Result<(), DispatchError> {
        log::trace!(
            "discarding command class 0x{:02X} from node {}",
            command_class_id,
            node_id
        );
        Ok(())
    }
}
