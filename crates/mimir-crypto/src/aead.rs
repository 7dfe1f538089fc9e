//! Authenticated encryption with a 32-byte shared key (Section 4.2).
//!
//! The scheme is fixed: ChaCha20-Poly1305 (RFC 8439) with a random
//! 12-byte nonce prepended to the ciphertext. This is the "compatibility
//! constant" the spec leaves abstract — group message bodies and member
//! profile blobs are encrypted this way, and decryption fails with
//! [`crate::CryptoError::AeadDecryption`] on any MAC mismatch.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};

use crate::{CryptoError, Result};

const NONCE_LEN: usize = 12;

/// Encrypt `plaintext` under `shared_key`, returning `nonce || ciphertext`.
pub fn encrypt(plaintext: &[u8], shared_key: &[u8; 32]) -> Vec<u8> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(shared_key));
    let nonce_bytes = crate::random_bytes(NONCE_LEN);
    let nonce = Nonce::from_slice(&nonce_bytes);
    // Only fails if the plaintext exceeds the scheme's length limit
    // (~256 GiB), which never happens for chat payloads.
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .expect("chacha20poly1305 encryption of a bounded message cannot fail");
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    out
}

/// Decrypt an envelope produced by [`encrypt`]. Fails with
/// [`CryptoError::AeadDecryption`] if the envelope is too short to hold a
/// nonce, or if the authentication tag does not verify.
pub fn decrypt(envelope: &[u8], shared_key: &[u8; 32]) -> Result<Vec<u8>> {
    if envelope.len() < NONCE_LEN {
        return Err(CryptoError::AeadDecryption);
    }
    let (nonce_bytes, ciphertext) = envelope.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(shared_key));
    let nonce = Nonce::from_slice(nonce_bytes);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::AeadDecryption)
}
