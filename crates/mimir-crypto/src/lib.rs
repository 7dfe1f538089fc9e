//! # mimir-crypto
//!
//! The cryptographic façade for the Mimir protocol stack (Section 4.2).
//!
//! Two operations only: Ed25519 sign/verify (every handshake challenge,
//! tracker announce, and create-chat proof-of-work signature goes through
//! [`ed25519`]), and authenticated encryption/decryption with a 32-byte
//! shared key (group message bodies and member profiles, through
//! [`aead`]). No key derivation is performed here — shared keys arrive
//! already established (out-of-band, via invite).
//!
//! No algorithm negotiation is permitted: the suite is fixed.

pub mod aead;
pub mod ed25519;

use rand_core::RngCore;

/// Error types for cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Ed25519 signature verification failed.
    #[error("signature verification failed")]
    SignatureVerification,

    /// AEAD decryption failed (authentication tag mismatch, or a
    /// ciphertext shorter than the nonce envelope).
    #[error("AEAD decryption failed")]
    AeadDecryption,

    /// Invalid key or signature length.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, CryptoError>;

/// Fill a freshly allocated buffer of `n` bytes with CSPRNG output.
///
/// Listed as a `Crypto` collaborator method alongside sign/verify/
/// encrypt/decrypt (Section 6).
pub fn random_bytes(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    buf
}
