//! Driver error types.

use thiserror::Error;

use zwave_frame::FrameError;
use zwave_security::SecurityError;

/// Errors surfaced by the driver core.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// Link-layer error.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// Security layer error.
    #[error(transparent)]
    Security(#[from] SecurityError),

    /// Configuration could not be parsed.
    #[error("configuration error: {0}")]
    Config(String),

    /// The driver threads are already running.
    #[error("driver already started")]
    AlreadyStarted,

    /// A secure operation was requested for a device with no session.
    #[error("no security session for node {0}")]
    NoSecuritySession(u8),

    /// A secure operation needs a network key that has not been set.
    #[error("network key not set")]
    NoNetworkKey,

    /// A message marked secure carries no application payload to wrap.
    #[error("message has no application payload to encapsulate")]
    NotEncapsulatable,
}
