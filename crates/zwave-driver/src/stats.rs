//! Driver statistics.
//!
//! Counters are plain atomics updated from whichever thread observes the
//! event; [`DriverStatistics::snapshot`] takes a consistent-enough copy for
//! display or assertions.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters shared across the driver threads.
#[derive(Debug, Default)]
pub struct DriverStatistics {
    /// Complete frames received with a valid checksum.
    pub(crate) frames_received: AtomicU64,
    /// Frames rejected for a checksum mismatch.
    pub(crate) bad_checksums: AtomicU64,
    /// ACK control bytes received.
    pub(crate) acks_received: AtomicU64,
    /// NAK control bytes received.
    pub(crate) naks_received: AtomicU64,
    /// CAN control bytes received.
    pub(crate) cans_received: AtomicU64,
    /// Bytes received outside any frame.
    pub(crate) out_of_frame: AtomicU64,
    /// Partial frame reads abandoned after stalling.
    pub(crate) read_aborts: AtomicU64,
    /// Frames written to the wire (first attempts and retries).
    pub(crate) writes: AtomicU64,
    /// Retransmissions of the in-flight message.
    pub(crate) retries: AtomicU64,
    /// Messages dropped after exhausting their attempts.
    pub(crate) dropped_messages: AtomicU64,
    /// Inbound encapsulations dropped for failed authentication or an
    /// expired nonce window.
    pub(crate) secure_drops: AtomicU64,
    /// Nonce requests sent.
    pub(crate) nonce_requests: AtomicU64,
}

/// A point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Complete frames received with a valid checksum.
    pub frames_received: u64,
    /// Frames rejected for a checksum mismatch.
    pub bad_checksums: u64,
    /// ACK control bytes received.
    pub acks_received: u64,
    /// NAK control bytes received.
    pub naks_received: u64,
    /// CAN control bytes received.
    pub cans_received: u64,
    /// Bytes received outside any frame.
    pub out_of_frame: u64,
    /// Partial frame reads abandoned after stalling.
    pub read_aborts: u64,
    /// Frames written to the wire.
    pub writes: u64,
    /// Retransmissions of the in-flight message.
    pub retries: u64,
    /// Messages dropped after exhausting their attempts.
    pub dropped_messages: u64,
    /// Inbound encapsulations dropped by the security layer.
    pub secure_drops: u64,
    /// Nonce requests sent.
    pub nonce_requests: u64,
}

impl DriverStatistics {
    pub(crate) fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the current counter values.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bad_checksums: self.bad_checksums.load(Ordering::Relaxed),
            acks_received: self.acks_received.load(Ordering::Relaxed),
            naks_received: self.naks_received.load(Ordering::Relaxed),
            cans_received: self.cans_received.load(Ordering::Relaxed),
            out_of_frame: self.out_of_frame.load(Ordering::Relaxed),
            read_aborts: self.read_aborts.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            dropped_messages: self.dropped_messages.load(Ordering::Relaxed),
            secure_drops: self.secure_drops.load(Ordering::Relaxed),
            nonce_requests: self.nonce_requests.load(Ordering::Relaxed),
        }
    }
}
