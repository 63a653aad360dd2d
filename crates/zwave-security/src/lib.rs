//! Z-Wave security (S0) encapsulation
//!
//! This crate implements the security layer that wraps arbitrary command
//! payloads in a nonce-based encryption envelope with message
//! authentication:
//!
//! - a per-device [`SecuritySession`] owning the key schedule, the outgoing
//!   fragment queue, and the nonce windows on both directions;
//! - the [`encap`](crate::encap) codec that builds and parses the
//!   encapsulation command payload (`[command][IV half][ciphertext]
//!   [nonce id][MAC]`);
//! - the [`crypto`](crate::crypto) primitives: AES-128 key derivation, the
//!   OFB payload cipher, and the truncated CBC-MAC authentication tag;
//! - the [`Bootstrap`] state machine that walks a freshly included device
//!   through scheme agreement and network key delivery.
//!
//! Payloads larger than [`MAX_FRAGMENT_PAYLOAD`] bytes are transparently
//! split into exactly two fragments sharing a session sequence number, and
//! reassembled on the receiving side.

mod bootstrap;
mod crypto;
mod encap;
mod error;
mod session;

pub use bootstrap::*;
pub use crypto::*;
pub use encap::*;
pub use error::*;
pub use session::*;

/// Largest payload slice a single encapsulated fragment can carry.
pub const MAX_FRAGMENT_PAYLOAD: usize = 28;

/// Bytes of overhead an encapsulation command adds around its fragment:
/// command, 8-byte IV half, sequence byte, nonce id, 8-byte tag.
pub const ENCAP_OVERHEAD: usize = 19;

/// The 16-byte network key shared with securely included devices.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct NetworkKey(pub [u8; 16]);

impl std::fmt::Debug for NetworkKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        write!(f, "NetworkKey(..)")
    }
}

/// Position of a fragment within its original payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentPart {
    /// The payload fits in one fragment.
    Whole,
    /// First half of a split payload.
    First,
    /// Second half of a split payload.
    Second,
}

/// A slice of an outgoing payload awaiting encapsulation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Whether this is a whole payload or one half of a split.
    pub part: FragmentPart,
    /// Session sequence nibble; meaningful only for split fragments.
    pub sequence: u8,
    /// The raw payload bytes, at most [`MAX_FRAGMENT_PAYLOAD`] of them.
    pub data: Vec<u8>,
}
