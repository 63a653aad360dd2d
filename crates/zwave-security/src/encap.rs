//! Encapsulation command encoding and decoding.
//!
//! An encapsulation command payload (the bytes after the command class id)
//! is laid out as:
//!
//! | Field      | Size (bytes) | Description                                  |
//! |------------|--------------|----------------------------------------------|
//! | command    | 1            | `MessageEncap` or `MessageEncapNonceGet`     |
//! | IV half    | 8            | Sender's random half of the 16-byte IV       |
//! | ciphertext | 2..=29       | OFB(sequence byte + fragment bytes)          |
//! | nonce id   | 1            | First byte of the receiver nonce in use      |
//! | MAC        | 8            | Truncated CBC-MAC over header + ciphertext   |
//!
//! The remaining 8 bytes of the IV are the receiver's nonce, known to both
//! ends and never put on the wire.

use zwave_frame::{SECURITY_CMD_MESSAGE_ENCAP, SECURITY_CMD_MESSAGE_ENCAP_NONCE_GET};

use crate::{
    assemble_iv, compute_authentication, ofb_apply, FragmentPart, SecurityError, ENCAP_OVERHEAD,
    MAX_FRAGMENT_PAYLOAD,
};

/// Sequence byte bit: this fragment is part of a split payload.
const SEQUENCE_FLAG_SEQUENCED: u8 = 0x10;
/// Sequence byte bit: this is the second fragment of a split payload.
const SEQUENCE_FLAG_SECOND: u8 = 0x20;

/// Build the sequence/flags byte for a fragment.
pub fn sequence_byte(part: FragmentPart, sequence: u8) -> u8 {
    match part {
        FragmentPart::Whole => 0,
        FragmentPart::First => (sequence & 0x0F) | SEQUENCE_FLAG_SEQUENCED,
        FragmentPart::Second => {
            (sequence & 0x0F) | SEQUENCE_FLAG_SEQUENCED | SEQUENCE_FLAG_SECOND
        }
    }
}

/// A parsed but not yet decrypted encapsulation command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedEncap {
    /// The encapsulation command byte.
    pub command: u8,
    /// Sender's random IV half.
    pub sender_iv_half: [u8; 8],
    /// Encrypted sequence byte + fragment bytes.
    pub ciphertext: Vec<u8>,
    /// Identifier of the receiver nonce the sender used.
    pub nonce_id: u8,
    /// Authentication tag.
    pub mac: [u8; 8],
}

/// A decrypted, authenticated fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedFragment {
    /// Position of this fragment in its payload.
    pub part: FragmentPart,
    /// Sequence nibble; meaningful only for split fragments.
    pub sequence: u8,
    /// The plaintext fragment bytes.
    pub data: Vec<u8>,
}

/// Encrypt a fragment and build the full encapsulation command payload
/// starting at the command byte.
pub fn encode_encap(
    command: u8,
    encrypt_key: &[u8; 16],
    auth_key: &[u8; 16],
    sender_iv_half: &[u8; 8],
    receiver_nonce: &[u8; 8],
    seq_byte: u8,
    fragment: &[u8],
    sending_node: u8,
    receiving_node: u8,
) -> Vec<u8> {
    debug_assert!(fragment.len() <= MAX_FRAGMENT_PAYLOAD);

    let iv = assemble_iv(sender_iv_half, receiver_nonce);

    let mut ciphertext = Vec::with_capacity(1 + fragment.len());
    ciphertext.push(seq_byte);
    ciphertext.extend_from_slice(fragment);
    ofb_apply(encrypt_key, &iv, &mut ciphertext);

    let mac = compute_authentication(
        auth_key,
        &iv,
        command,
        sending_node,
        receiving_node,
        &ciphertext,
    );

    let mut payload = Vec::with_capacity(fragment.len() + ENCAP_OVERHEAD);
    payload.push(command);
    payload.extend_from_slice(sender_iv_half);
    payload.extend_from_slice(&ciphertext);
    payload.push(receiver_nonce[0]);
    payload.extend_from_slice(&mac);
    payload
}

/// Parse an encapsulation command payload into its fields.
pub fn decode_encap(raw: &[u8]) -> Result<ParsedEncap, SecurityError> {
    // command + IV half + sequence byte + one data byte + nonce id + MAC
    if raw.len() < ENCAP_OVERHEAD + 1 {
        return Err(SecurityError::EncapTooShort {
            expected: ENCAP_OVERHEAD + 1,
            actual: raw.len(),
        });
    }

    let command = raw[0];
    if command != SECURITY_CMD_MESSAGE_ENCAP && command != SECURITY_CMD_MESSAGE_ENCAP_NONCE_GET {
        return Err(SecurityError::NotAnEncapCommand(command));
    }

    let mut sender_iv_half = [0u8; 8];
    sender_iv_half.copy_from_slice(&raw[1..9]);

    let mac_start = raw.len() - 8;
    let nonce_id = raw[mac_start - 1];
    let ciphertext = raw[9..mac_start - 1].to_vec();

    let mut mac = [0u8; 8];
    mac.copy_from_slice(&raw[mac_start..]);

    Ok(ParsedEncap {
        command,
        sender_iv_half,
        ciphertext,
        nonce_id,
        mac,
    })
}

/// Verify the authentication tag and decrypt the fragment.
///
/// Returns [`SecurityError::AuthenticationFailed`] on tag mismatch without
/// revealing which bytes disagreed.
pub fn verify_and_decrypt(
    parsed: &ParsedEncap,
    encrypt_key: &[u8; 16],
    auth_key: &[u8; 16],
    receiver_nonce: &[u8; 8],
    sending_node: u8,
    receiving_node: u8,
) -> Result<DecryptedFragment, SecurityError> {
    if parsed.nonce_id != receiver_nonce[0] {
        return Err(SecurityError::NonceIdMismatch {
            expected: receiver_nonce[0],
            actual: parsed.nonce_id,
        });
    }

    let iv = assemble_iv(&parsed.sender_iv_half, receiver_nonce);

    let expected = compute_authentication(
        auth_key,
        &iv,
        parsed.command,
        sending_node,
        receiving_node,
        &parsed.ciphertext,
    );
    if expected != parsed.mac {
        return Err(SecurityError::AuthenticationFailed);
    }

    let mut plaintext = parsed.ciphertext.clone();
    ofb_apply(encrypt_key, &iv, &mut plaintext);

    let seq = plaintext[0];
    let part = if seq & SEQUENCE_FLAG_SEQUENCED == 0 {
        FragmentPart::Whole
    } else if seq & SEQUENCE_FLAG_SECOND != 0 {
        FragmentPart::Second
    } else {
        FragmentPart::First
    };

    Ok(DecryptedFragment {
        part,
        sequence: seq & 0x0F,
        data: plaintext[1..].to_vec(),
    })
}
