//! Frame encoding/decoding utilities.
//!
//! The link layer wraps every message in a checksummed envelope. Control
//! bytes travel bare, outside any envelope.
//!
//! ```text
//! +-----+--------+-------------------+----------+
//! | SOF | LENGTH | payload[0..n]     | CHECKSUM |
//! +-----+--------+-------------------+----------+
//! ```
//!
//! LENGTH counts everything after itself through the checksum byte, and the
//! checksum is `0xFF` XORed with every byte from the LENGTH field through the
//! last payload byte.

use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};

use crate::{FrameError, ACK, CAN, MAX_FRAME_SIZE, NAK, SOF};

/// A bare control byte on the serial line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlByte {
    /// Frame acknowledged.
    Ack,
    /// Frame rejected - retransmit.
    Nak,
    /// Exchange cancelled by the controller - retransmit.
    Can,
}

impl ControlByte {
    /// Map a raw byte to a control signal, if it is one.
    pub fn from_byte(byte: u8) -> Option<ControlByte> {
        match byte {
            ACK => Some(ControlByte::Ack),
            NAK => Some(ControlByte::Nak),
            CAN => Some(ControlByte::Can),
            _ => None,
        }
    }

    /// The wire value of this control signal.
    pub fn to_byte(self) -> u8 {
        match self {
            ControlByte::Ack => ACK,
            ControlByte::Nak => NAK,
            ControlByte::Can => CAN,
        }
    }
}

/// One decoded unit of inbound serial traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkInput {
    /// A bare ACK/NAK/CAN byte.
    Control(ControlByte),
    /// A complete, checksum-verified frame payload (LENGTH and checksum
    /// stripped). The caller should answer with ACK.
    Frame(Vec<u8>),
    /// A complete frame whose checksum did not verify. The caller should
    /// answer with NAK; the frame bytes have been discarded.
    BadChecksum {
        /// Checksum computed over the received bytes.
        expected: u8,
        /// Checksum byte the frame carried.
        actual: u8,
    },
    /// A byte that is neither a control byte nor SOF. The caller should
    /// answer with NAK and may purge its receive state.
    OutOfFrame(u8),
}

/// Compute the envelope checksum over `bytes`, which must span the LENGTH
/// field through the last payload byte.
pub fn checksum(bytes: &[u8]) -> u8 {
    let mut checksum = 0xFFu8;
    for byte in bytes {
        checksum ^= byte;
    }
    checksum
}

/// Encode a payload into a complete frame (SOF through checksum).
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.is_empty() {
        return Err(FrameError::FrameTooShort {
            expected: 1,
            actual: 0,
        });
    }
    if payload.len() + 3 > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLong {
            max: MAX_FRAME_SIZE - 3,
            actual: payload.len(),
        });
    }

    let mut buf = Vec::with_capacity(payload.len() + 3);
    buf.push(SOF);
    buf.push((payload.len() + 1) as u8); // payload + checksum
    buf.extend_from_slice(payload);
    buf.push(checksum(&buf[1..]));
    Ok(buf)
}

/// A codec for reading framed messages and control bytes off a serial line.
///
/// Bytes are accumulated with [`push`](FrameCodec::push) and pulled back out
/// with [`decode`](FrameCodec::decode), which yields one [`LinkInput`] at a
/// time until more data is needed.
#[derive(Debug, Default)]
pub struct FrameCodec {
    /// Buffer for accumulating incoming data.
    buffer: BytesMut,
    /// When the currently buffered partial frame started arriving.
    partial_since: Option<Instant>,
}

impl FrameCodec {
    /// Create a new frame codec.
    pub fn new() -> Self {
        FrameCodec {
            buffer: BytesMut::with_capacity(MAX_FRAME_SIZE),
            partial_since: None,
        }
    }

    /// Add received data to the buffer.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to decode the next control byte or frame from the buffer.
    ///
    /// Returns `None` when more data is needed to make progress.
    pub fn decode(&mut self) -> Option<LinkInput> {
        if self.buffer.is_empty() {
            return None;
        }

        let lead = self.buffer[0];
        if let Some(control) = ControlByte::from_byte(lead) {
            self.buffer.advance(1);
            self.partial_since = None;
            return Some(LinkInput::Control(control));
        }

        if lead != SOF {
            self.buffer.advance(1);
            return Some(LinkInput::OutOfFrame(lead));
        }

        // Need the length byte before anything else.
        if self.buffer.len() < 2 {
            self.mark_partial();
            return None;
        }

        let length = self.buffer[1] as usize;
        if length < 2 {
            // A frame must carry at least one payload byte plus checksum.
            // Resynchronize past the corrupt header.
            log::warn!("frame with impossible length {}, discarding header", length);
            self.buffer.advance(2);
            self.partial_since = None;
            return Some(LinkInput::OutOfFrame(lead));
        }

        // Complete frame is SOF + LENGTH byte + LENGTH further bytes.
        if self.buffer.len() < 2 + length {
            self.mark_partial();
            return None;
        }

        let expected = checksum(&self.buffer[1..1 + length]);
        let actual = self.buffer[1 + length];
        self.partial_since = None;

        if expected != actual {
            self.buffer.advance(2 + length);
            return Some(LinkInput::BadChecksum { expected, actual });
        }

        self.buffer.advance(2);
        let payload = self.buffer.split_to(length - 1).to_vec();
        self.buffer.advance(1); // checksum byte
        Some(LinkInput::Frame(payload))
    }

    /// Whether the buffer currently holds an incomplete frame.
    pub fn has_partial_frame(&self) -> bool {
        self.partial_since.is_some()
    }

    /// Discard a partial frame that has been stalled for longer than
    /// `timeout`. Returns true if anything was purged.
    pub fn purge_stalled(&mut self, timeout: Duration) -> bool {
        match self.partial_since {
            Some(since) if since.elapsed() >= timeout => {
                log::warn!(
                    "aborting stalled frame read ({} bytes buffered)",
                    self.buffer.len()
                );
                self.clear();
                true
            }
            _ => false,
        }
    }

    /// Get the number of buffered bytes.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Clear the buffer and any partial-frame state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.partial_since = None;
    }

    fn mark_partial(&mut self) {
        if self.partial_since.is_none() {
            self.partial_since = Some(Instant::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let payload = vec![0x00, 0x13, 0x05, 0x02, 0x25, 0x01];
        let encoded = encode_frame(&payload).unwrap();

        assert_eq!(encoded[0], SOF);
        assert_eq!(encoded[1] as usize, payload.len() + 1);

        let mut codec = FrameCodec::new();
        codec.push(&encoded);
        let decoded = codec.decode().expect("should decode frame");
        assert_eq!(decoded, LinkInput::Frame(payload));
        assert!(codec.decode().is_none());
    }

    #[test]
    fn test_roundtrip_all_lengths() {
        for len in 1..=250usize {
            let payload: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let encoded = encode_frame(&payload).unwrap();
            let mut codec = FrameCodec::new();
            codec.push(&encoded);
            assert_eq!(codec.decode(), Some(LinkInput::Frame(payload)));
        }
    }

    #[test]
    fn test_corrupting_any_byte_fails_checksum() {
        let payload = vec![0x00, 0x04, 0x00, 0x05, 0x02, 0x98, 0x40];
        let encoded = encode_frame(&payload).unwrap();

        // Corrupt every byte after SOF in turn; each must fail to decode as
        // the original frame.
        for i in 1..encoded.len() {
            let mut corrupted = encoded.clone();
            corrupted[i] ^= 0x01;
            let mut codec = FrameCodec::new();
            codec.push(&corrupted);
            match codec.decode() {
                Some(LinkInput::Frame(decoded)) => {
                    assert_ne!(decoded, payload, "corruption at byte {} undetected", i)
                }
                Some(LinkInput::BadChecksum { .. }) | Some(LinkInput::OutOfFrame(_)) | None => {}
                other => panic!("unexpected outcome {:?}", other),
            }
        }
    }

    #[test]
    fn test_control_bytes() {
        let mut codec = FrameCodec::new();
        codec.push(&[ACK, NAK, CAN]);
        assert_eq!(codec.decode(), Some(LinkInput::Control(ControlByte::Ack)));
        assert_eq!(codec.decode(), Some(LinkInput::Control(ControlByte::Nak)));
        assert_eq!(codec.decode(), Some(LinkInput::Control(ControlByte::Can)));
        assert!(codec.decode().is_none());
    }

    #[test]
    fn test_partial_frame() {
        let payload = vec![0x01, 0x02, 0x03, 0x04];
        let encoded = encode_frame(&payload).unwrap();

        let mut codec = FrameCodec::new();
        codec.push(&encoded[..3]);
        assert!(codec.decode().is_none());
        assert!(codec.has_partial_frame());

        codec.push(&encoded[3..]);
        assert_eq!(codec.decode(), Some(LinkInput::Frame(payload)));
        assert!(!codec.has_partial_frame());
    }

    #[test]
    fn test_control_byte_then_frame() {
        let payload = vec![0x00, 0x13];
        let encoded = encode_frame(&payload).unwrap();

        let mut codec = FrameCodec::new();
        codec.push(&[ACK]);
        codec.push(&encoded);
        assert_eq!(codec.decode(), Some(LinkInput::Control(ControlByte::Ack)));
        assert_eq!(codec.decode(), Some(LinkInput::Frame(payload)));
    }

    #[test]
    fn test_out_of_frame_byte() {
        let mut codec = FrameCodec::new();
        codec.push(&[0x55]);
        assert_eq!(codec.decode(), Some(LinkInput::OutOfFrame(0x55)));
    }

    #[test]
    fn test_bad_checksum_reports_values() {
        let payload = vec![0x00, 0x13, 0x05];
        let mut encoded = encode_frame(&payload).unwrap();
        let good = *encoded.last().unwrap();
        *encoded.last_mut().unwrap() = good ^ 0xFF;

        let mut codec = FrameCodec::new();
        codec.push(&encoded);
        assert_eq!(
            codec.decode(),
            Some(LinkInput::BadChecksum {
                expected: good,
                actual: good ^ 0xFF,
            })
        );
        // The bad frame is consumed; the codec resynchronizes.
        assert_eq!(codec.buffered_len(), 0);
    }

    #[test]
    fn test_stalled_partial_purge() {
        let payload = vec![0x00, 0x13, 0x05];
        let encoded = encode_frame(&payload).unwrap();

        let mut codec = FrameCodec::new();
        codec.push(&encoded[..2]);
        assert!(codec.decode().is_none());
        assert!(codec.has_partial_frame());

        // Zero timeout expires immediately.
        assert!(codec.purge_stalled(Duration::from_millis(0)));
        assert_eq!(codec.buffered_len(), 0);
        assert!(!codec.has_partial_frame());
    }

    #[test]
    fn test_empty_payload_rejected() {
        assert!(matches!(
            encode_frame(&[]),
            Err(FrameError::FrameTooShort { .. })
        ));
    }
}
