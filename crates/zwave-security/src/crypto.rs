//! Cryptographic primitives for the security layer.
//!
//! Everything is built on a single AES-128 block operation: the two working
//! keys are derived by encrypting fixed fill blocks under the network key,
//! payload confidentiality uses AES in OFB mode, and the authentication tag
//! is a truncated CBC-MAC chained across the ciphertext. Both ends of the
//! link compute these byte-for-byte identically.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use rand::Rng;

use crate::NetworkKey;

// ============================================================================
// Block primitive and key schedule
// ============================================================================

/// Encrypt a single 16-byte block with AES-128.
pub fn encrypt_block(key: &[u8; 16], block: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut out = GenericArray::clone_from_slice(block);
    cipher.encrypt_block(&mut out);
    out.into()
}

/// Derive the authentication key from the network key.
pub fn derive_auth_key(network_key: &NetworkKey) -> [u8; 16] {
    encrypt_block(&network_key.0, &[0x55; 16])
}

/// Derive the encryption key from the network key.
pub fn derive_encrypt_key(network_key: &NetworkKey) -> [u8; 16] {
    encrypt_block(&network_key.0, &[0xAA; 16])
}

// ============================================================================
// Payload cipher (AES-OFB)
// ============================================================================

/// Apply the OFB keystream for `key`/`iv` to `data` in place.
///
/// OFB is symmetric: applying it twice restores the original bytes, so this
/// one function both encrypts and decrypts.
pub fn ofb_apply(key: &[u8; 16], iv: &[u8; 16], data: &mut [u8]) {
    let mut feedback = *iv;
    for chunk in data.chunks_mut(16) {
        feedback = encrypt_block(key, &feedback);
        for (byte, ks) in chunk.iter_mut().zip(feedback.iter()) {
            *byte ^= ks;
        }
    }
}

// ============================================================================
// Authentication tag (truncated CBC-MAC)
// ============================================================================

/// Compute the 8-byte authentication tag for an encapsulated message.
///
/// The MAC input is a 4-byte header (`command`, sending node, receiving
/// node, ciphertext length) followed by the ciphertext, zero-padded to a
/// 16-byte boundary. The accumulator is seeded by block-encrypting the full
/// initialization vector, then each block is XORed in and the accumulator
/// re-encrypted; the tag is the first 8 bytes of the final accumulator.
pub fn compute_authentication(
    auth_key: &[u8; 16],
    iv: &[u8; 16],
    command: u8,
    sending_node: u8,
    receiving_node: u8,
    ciphertext: &[u8],
) -> [u8; 8] {
    let mut buffer = Vec::with_capacity(4 + ciphertext.len() + 15);
    buffer.push(command);
    buffer.push(sending_node);
    buffer.push(receiving_node);
    buffer.push(ciphertext.len() as u8);
    buffer.extend_from_slice(ciphertext);
    while buffer.len() % 16 != 0 {
        buffer.push(0);
    }

    let mut accumulator = encrypt_block(auth_key, iv);
    for block in buffer.chunks(16) {
        for (acc, byte) in accumulator.iter_mut().zip(block.iter()) {
            *acc ^= byte;
        }
        accumulator = encrypt_block(auth_key, &accumulator);
    }

    let mut tag = [0u8; 8];
    tag.copy_from_slice(&accumulator[..8]);
    tag
}

// ============================================================================
// Nonce and IV generation
// ============================================================================

/// Generate an 8-byte nonce of non-zero random bytes.
pub fn generate_nonce() -> [u8; 8] {
    let mut rng = rand::thread_rng();
    let mut nonce = [0u8; 8];
    for byte in nonce.iter_mut() {
        *byte = rng.gen_range(1..=u8::MAX);
    }
    nonce
}

/// Generate the random half of an initialization vector.
pub fn generate_iv_half() -> [u8; 8] {
    let mut half = [0u8; 8];
    rand::thread_rng().fill(&mut half);
    half
}

/// Assemble a full 16-byte IV from our random half and the peer's nonce.
pub fn assemble_iv(our_half: &[u8; 8], peer_nonce: &[u8; 8]) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[..8].copy_from_slice(our_half);
    iv[8..].copy_from_slice(peer_nonce);
    iv
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: NetworkKey = NetworkKey([0x0F; 16]);

    #[test]
    fn test_key_derivation_deterministic() {
        assert_eq!(derive_auth_key(&KEY), derive_auth_key(&KEY));
        assert_eq!(derive_encrypt_key(&KEY), derive_encrypt_key(&KEY));
        assert_ne!(derive_auth_key(&KEY), derive_encrypt_key(&KEY));
    }

    #[test]
    fn test_ofb_roundtrip() {
        let key = derive_encrypt_key(&KEY);
        let iv = assemble_iv(&[0x11; 8], &[0x22; 8]);

        let original: Vec<u8> = (0..45).collect();
        let mut data = original.clone();
        ofb_apply(&key, &iv, &mut data);
        assert_ne!(data, original);
        ofb_apply(&key, &iv, &mut data);
        assert_eq!(data, original);
    }

    #[test]
    fn test_ofb_iv_sensitivity() {
        let key = derive_encrypt_key(&KEY);
        let mut a = vec![0u8; 16];
        let mut b = vec![0u8; 16];
        ofb_apply(&key, &assemble_iv(&[1; 8], &[2; 8]), &mut a);
        ofb_apply(&key, &assemble_iv(&[1; 8], &[3; 8]), &mut b);
        assert_ne!(a, b);
    }

    #[test]
    fn test_mac_deterministic_and_input_sensitive() {
        let auth = derive_auth_key(&KEY);
        let iv = assemble_iv(&[0xAB; 8], &[0xCD; 8]);
        let ciphertext = [0x10, 0x20, 0x30, 0x40];

        let tag = compute_authentication(&auth, &iv, 0x81, 1, 5, &ciphertext);
        assert_eq!(tag, compute_authentication(&auth, &iv, 0x81, 1, 5, &ciphertext));

        // Every header field participates.
        assert_ne!(tag, compute_authentication(&auth, &iv, 0xC1, 1, 5, &ciphertext));
        assert_ne!(tag, compute_authentication(&auth, &iv, 0x81, 2, 5, &ciphertext));
        assert_ne!(tag, compute_authentication(&auth, &iv, 0x81, 1, 6, &ciphertext));

        // So does the ciphertext.
        let mut tampered = ciphertext;
        tampered[2] ^= 0x80;
        assert_ne!(tag, compute_authentication(&auth, &iv, 0x81, 1, 5, &tampered));
    }

    #[test]
    fn test_mac_covers_multiple_blocks() {
        let auth = derive_auth_key(&KEY);
        let iv = assemble_iv(&[0; 8], &[1; 8]);
        let long: Vec<u8> = (0..29).collect();

        let tag = compute_authentication(&auth, &iv, 0x81, 1, 5, &long);
        let mut tampered = long.clone();
        // Flip a bit in the second 16-byte block.
        tampered[20] ^= 0x01;
        assert_ne!(tag, compute_authentication(&auth, &iv, 0x81, 1, 5, &tampered));
    }

    #[test]
    fn test_generated_nonce_has_no_zero_bytes() {
        for _ in 0..50 {
            let nonce = generate_nonce();
            assert!(nonce.iter().all(|&b| b != 0));
        }
    }
}
