//! Security layer error types.

use thiserror::Error;

/// Errors that can occur in the security encapsulation layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SecurityError {
    /// Payload exceeds what two fragments can carry.
    #[error("payload too long for encapsulation: maximum {max} bytes, got {actual}")]
    PayloadTooLong {
        /// Maximum encapsulatable payload size.
        max: usize,
        /// Actual payload size.
        actual: usize,
    },

    /// Encapsulation command payload shorter than the fixed envelope.
    #[error("encapsulation too short: expected at least {expected} bytes, got {actual}")]
    EncapTooShort {
        /// Expected minimum length.
        expected: usize,
        /// Actual length.
        actual: usize,
    },

    /// Payload byte 0 is not an encapsulation command.
    #[error("not an encapsulation command: 0x{0:02X}")]
    NotAnEncapCommand(u8),

    /// The authentication tag did not verify.
    #[error("authentication tag mismatch")]
    AuthenticationFailed,

    /// The nonce id in the frame does not identify the nonce we reported.
    #[error("nonce id mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    NonceIdMismatch {
        /// First byte of the nonce we reported.
        expected: u8,
        /// Nonce id carried by the frame.
        actual: u8,
    },

    /// An encapsulated frame arrived with no outstanding reported nonce.
    #[error("no nonce outstanding for inbound encapsulation")]
    NoNonceReported,

    /// More than the nonce validity window elapsed since we reported it.
    #[error("nonce validity window expired")]
    NonceWindowExpired,

    /// A second fragment arrived whose sequence does not match the first.
    #[error("fragment sequence mismatch: expected {expected}, got {actual}")]
    FragmentSequenceMismatch {
        /// Sequence nibble of the stored first fragment.
        expected: u8,
        /// Sequence nibble of the arriving second fragment.
        actual: u8,
    },

    /// A second fragment arrived with no first fragment stored.
    #[error("second fragment without a first")]
    UnexpectedSecondFragment,
}
