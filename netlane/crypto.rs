//! ChaCha20-Poly1305 (IETF) helpers shared by tokens and packets

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key as AeadKey, Nonce};
use rand::RngCore;

use crate::error::{NetError, Result};

/// Symmetric key size
pub const KEY_BYTES: usize = 32;
/// Poly1305 tag size
pub const MAC_BYTES: usize = 16;

/// 256-bit symmetric key
pub type Key = [u8; KEY_BYTES];

/// Fresh random key from the thread RNG
pub fn generate_key() -> Key {
    let mut key = [0u8; KEY_BYTES];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

/// 96-bit nonce: four zero bytes then the little-endian sequence
pub fn nonce_for(sequence: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&sequence.to_le_bytes());
    nonce
}

/// Encrypt `message`, returning ciphertext with the tag appended
pub fn encrypt(message: &[u8], aad: &[u8], sequence: u64, key: &Key) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(AeadKey::from_slice(key));
    let nonce = nonce_for(sequence);
    cipher
        .encrypt(Nonce::from_slice(&nonce), Payload { msg: message, aad })
        .map_err(|_| NetError::crypto("encryption failed"))
}

/// Verify the tag and decrypt. Fails on any tampering or a wrong key.
pub fn decrypt(ciphertext: &[u8], aad: &[u8], sequence: u64, key: &Key) -> Result<Vec<u8>> {
    if ciphertext.len() < MAC_BYTES {
        return Err(NetError::crypto("ciphertext shorter than tag"));
    }
    let cipher = ChaCha20Poly1305::new(AeadKey::from_slice(key));
    let nonce = nonce_for(sequence);
    cipher
        .decrypt(Nonce::from_slice(&nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| NetError::crypto("authentication failed"))
}

/// Constant-time comparison for tags and keys
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    constant_time_eq::constant_time_eq(a, b)
}
