//! Per-device security session state.
//!
//! A [`SecuritySession`] owns everything the driver needs to exchange
//! encapsulated messages with one device: the key schedule, the outgoing
//! fragment queue, the outstanding nonce request, the nonce we last
//! reported to the device, and the reassembly slot for a split inbound
//! payload.
//!
//! The session itself performs no I/O. The driver asks it what to do
//! (request a nonce, send an encapsulated payload, mark the device
//! degraded) and puts the resulting bytes on the wire.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use zwave_frame::{SECURITY_CMD_MESSAGE_ENCAP, SECURITY_CMD_MESSAGE_ENCAP_NONCE_GET};

use crate::{
    decode_encap, derive_auth_key, derive_encrypt_key, encode_encap, generate_iv_half,
    generate_nonce, sequence_byte, verify_and_decrypt, Fragment, FragmentPart, NetworkKey,
    SecurityError, MAX_FRAGMENT_PAYLOAD,
};

/// How long a nonce stays valid after it is requested or reported.
pub const NONCE_TIMEOUT: Duration = Duration::from_secs(10);

/// Consecutive nonce failures tolerated before the device is declared
/// degraded.
pub const DEFAULT_NONCE_RETRY_CAP: u8 = 3;

/// What the driver should do after handing a received nonce to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NonceOutcome {
    /// Nothing queued; the nonce is ignored.
    Idle,
    /// The nonce arrived too late. `degraded` is set when the retry cap is
    /// exhausted; otherwise the driver should issue a fresh nonce request.
    Expired {
        /// Retry cap reached - stop re-requesting and surface the condition.
        degraded: bool,
    },
    /// An encapsulation payload is ready to send. `more` indicates further
    /// fragments are queued and the command used asks the far end for the
    /// next nonce automatically.
    Encapsulated {
        /// The application payload starting at the encapsulation command
        /// byte (the command class byte is prepended by the caller).
        payload: Vec<u8>,
        /// Whether more fragments remain queued behind this one.
        more: bool,
    },
}

/// A nonce we reported to the device, with its report time.
#[derive(Debug, Clone, Copy)]
struct ReportedNonce {
    nonce: [u8; 8],
    at: Instant,
}

/// Security session for a single remote device.
#[derive(Debug)]
pub struct SecuritySession {
    auth_key: [u8; 16],
    encrypt_key: [u8; 16],
    /// Low nibble shared by the two fragments of a split payload.
    sequence_counter: u8,
    /// Fragments awaiting a nonce.
    queue: VecDeque<Fragment>,
    /// Whether a nonce request is outstanding.
    waiting_for_nonce: bool,
    /// When the outstanding nonce request expires.
    nonce_deadline: Option<Instant>,
    /// Consecutive nonce failures.
    nonce_failures: u8,
    /// Retry cap before the device is declared degraded.
    nonce_retry_cap: u8,
    /// The nonce we last reported, for decrypting inbound traffic.
    reported: Option<ReportedNonce>,
    /// Stored first fragment of a split inbound payload.
    partial: Option<(u8, Vec<u8>)>,
    /// Nonce validity window.
    nonce_timeout: Duration,
}

impl SecuritySession {
    /// Create a session keyed with the given network key.
    pub fn new(network_key: &NetworkKey) -> Self {
        SecuritySession {
            auth_key: derive_auth_key(network_key),
            encrypt_key: derive_encrypt_key(network_key),
            sequence_counter: 0,
            queue: VecDeque::new(),
            waiting_for_nonce: false,
            nonce_deadline: None,
            nonce_failures: 0,
            nonce_retry_cap: DEFAULT_NONCE_RETRY_CAP,
            reported: None,
            partial: None,
            nonce_timeout: NONCE_TIMEOUT,
        }
    }

    /// Override the nonce validity window and retry cap.
    pub fn with_limits(mut self, nonce_timeout: Duration, retry_cap: u8) -> Self {
        self.nonce_timeout = nonce_timeout;
        self.nonce_retry_cap = retry_cap;
        self
    }

    /// Number of fragments waiting for a nonce.
    pub fn pending_fragments(&self) -> usize {
        self.queue.len()
    }

    /// Whether a nonce request should be issued for queued work.
    pub fn needs_nonce_request(&self) -> bool {
        !self.queue.is_empty() && !self.waiting_for_nonce
    }

    /// Split a payload into fragments and queue them for encapsulation.
    ///
    /// Payloads up to [`MAX_FRAGMENT_PAYLOAD`] bytes queue as a single
    /// `Whole` fragment; longer payloads split into exactly two fragments
    /// sharing a sequence nibble.
    pub fn queue_payload(&mut self, payload: &[u8]) -> Result<(), SecurityError> {
        if payload.len() > MAX_FRAGMENT_PAYLOAD * 2 {
            return Err(SecurityError::PayloadTooLong {
                max: MAX_FRAGMENT_PAYLOAD * 2,
                actual: payload.len(),
            });
        }

        if payload.len() <= MAX_FRAGMENT_PAYLOAD {
            self.queue.push_back(Fragment {
                part: FragmentPart::Whole,
                sequence: 0,
                data: payload.to_vec(),
            });
        } else {
            self.sequence_counter = self.sequence_counter.wrapping_add(1);
            let sequence = self.sequence_counter & 0x0F;
            self.queue.push_back(Fragment {
                part: FragmentPart::First,
                sequence,
                data: payload[..MAX_FRAGMENT_PAYLOAD].to_vec(),
            });
            self.queue.push_back(Fragment {
                part: FragmentPart::Second,
                sequence,
                data: payload[MAX_FRAGMENT_PAYLOAD..].to_vec(),
            });
        }
        Ok(())
    }

    /// Record that a nonce request went out now.
    pub fn note_nonce_requested(&mut self, now: Instant) {
        self.waiting_for_nonce = true;
        self.nonce_deadline = Some(now + self.nonce_timeout);
    }

    /// Handle a nonce report from the device.
    ///
    /// On time and with work queued, encrypts the queue head and returns
    /// the encapsulation payload to send. When more fragments remain, the
    /// command code asks the far end for the next nonce, so the session
    /// stays in the waiting state with a fresh deadline.
    pub fn on_nonce_received(
        &mut self,
        peer_nonce: &[u8; 8],
        now: Instant,
        sending_node: u8,
        receiving_node: u8,
    ) -> NonceOutcome {
        self.waiting_for_nonce = false;

        if let Some(deadline) = self.nonce_deadline.take() {
            if now > deadline {
                self.nonce_failures = self.nonce_failures.saturating_add(1);
                let degraded = self.nonce_failures >= self.nonce_retry_cap;
                log::warn!(
                    "nonce arrived after the validity window (failure {}/{})",
                    self.nonce_failures,
                    self.nonce_retry_cap
                );
                return NonceOutcome::Expired { degraded };
            }
        }

        let fragment = match self.queue.pop_front() {
            Some(fragment) => fragment,
            None => return NonceOutcome::Idle,
        };

        let more = !self.queue.is_empty();
        let command = if more {
            SECURITY_CMD_MESSAGE_ENCAP_NONCE_GET
        } else {
            SECURITY_CMD_MESSAGE_ENCAP
        };

        let iv_half = generate_iv_half();
        let payload = encode_encap(
            command,
            &self.encrypt_key,
            &self.auth_key,
            &iv_half,
            peer_nonce,
            sequence_byte(fragment.part, fragment.sequence),
            &fragment.data,
            sending_node,
            receiving_node,
        );

        self.nonce_failures = 0;
        if more {
            // The encap-nonce-get command doubles as the next nonce request.
            self.note_nonce_requested(now);
        }

        NonceOutcome::Encapsulated { payload, more }
    }

    /// Record a nonce failure from the driver side (request timed out with
    /// no report at all). Returns true when the retry cap is reached.
    pub fn record_nonce_failure(&mut self) -> bool {
        self.waiting_for_nonce = false;
        self.nonce_deadline = None;
        self.nonce_failures = self.nonce_failures.saturating_add(1);
        self.nonce_failures >= self.nonce_retry_cap
    }

    /// Whether the outstanding nonce request has passed its deadline.
    pub fn nonce_request_expired(&self, now: Instant) -> bool {
        matches!(self.nonce_deadline, Some(deadline) if self.waiting_for_nonce && now > deadline)
    }

    /// Generate a nonce to report to the device, remembering it for the
    /// decryption of the message it will protect.
    pub fn generate_report(&mut self, now: Instant) -> [u8; 8] {
        let nonce = generate_nonce();
        self.reported = Some(ReportedNonce { nonce, at: now });
        nonce
    }

    /// Decrypt and authenticate an inbound encapsulation command payload
    /// (starting at the encapsulation command byte).
    ///
    /// Returns `Ok(Some(plaintext))` for a complete payload, `Ok(None)`
    /// when a first fragment was stored awaiting its second half.
    pub fn decrypt(
        &mut self,
        raw: &[u8],
        now: Instant,
        sending_node: u8,
        receiving_node: u8,
    ) -> Result<Option<Vec<u8>>, SecurityError> {
        let reported = self.reported.ok_or(SecurityError::NoNonceReported)?;
        if now.duration_since(reported.at) > self.nonce_timeout {
            self.reported = None;
            self.partial = None;
            return Err(SecurityError::NonceWindowExpired);
        }

        let parsed = decode_encap(raw)?;
        let fragment = verify_and_decrypt(
            &parsed,
            &self.encrypt_key,
            &self.auth_key,
            &reported.nonce,
            sending_node,
            receiving_node,
        )?;

        // The nonce is single-use; a successful decryption consumes it.
        self.reported = None;

        match fragment.part {
            FragmentPart::Whole => {
                log::trace!("decrypted payload: {}", hex::encode(&fragment.data));
                Ok(Some(fragment.data))
            }
            FragmentPart::First => {
                self.partial = Some((fragment.sequence, fragment.data));
                Ok(None)
            }
            FragmentPart::Second => match self.partial.take() {
                Some((sequence, mut data)) if sequence == fragment.sequence => {
                    data.extend_from_slice(&fragment.data);
                    log::trace!("reassembled payload: {}", hex::encode(&data));
                    Ok(Some(data))
                }
                Some((sequence, _)) => Err(SecurityError::FragmentSequenceMismatch {
                    expected: sequence,
                    actual: fragment.sequence,
                }),
                None => Err(SecurityError::UnexpectedSecondFragment),
            },
        }
    }
}
