//! Link-layer error types.

use thiserror::Error;

/// Errors that can occur when working with the serial frame layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Frame is too short to be valid.
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    FrameTooShort {
        /// Expected minimum length.
        expected: usize,
        /// Actual length received.
        actual: usize,
    },

    /// Frame payload exceeds the protocol maximum.
    #[error("frame too long: maximum {max} bytes, got {actual}")]
    FrameTooLong {
        /// Maximum allowed length.
        max: usize,
        /// Actual length.
        actual: usize,
    },

    /// Message buffer operations after finalization, or malformed builds.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}
