//! Cryptographic primitives shared by secret unwrapping and payload encryption.
//!
//! Uses:
//! - AES-GCM and ChaCha20-Poly1305 for authenticated encryption
//! - OS randomness for nonces, salts and content-encryption keys

use aes_gcm::aead::{
    generic_array::typenum::Unsigned, Aead, AeadCore, KeyInit, Nonce, Payload,
};
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid base64 encoding: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid nonce length")]
    InvalidNonce,

    #[error("Unsupported key-encryption method: {0}")]
    UnsupportedKem(String),

    #[error("Key-encryption method mismatch: expected {expected}, payload uses {found}")]
    KemMismatch { expected: String, found: String },

    #[error("No private key for fingerprint {0}")]
    UnknownFingerprint(String),

    #[error("Ciphertext truncated")]
    Truncated,

    #[error("Decryption failed - invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Message authentication failed")]
    AuthenticationFailed,

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),
}

/// Result type for crypto operations
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Fill a fresh buffer from the OS RNG.
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// Nonce length in bytes for an AEAD cipher.
pub(crate) fn nonce_len<C: AeadCore>() -> usize {
    <C as AeadCore>::NonceSize::USIZE
}

/// Encrypt with any AEAD cipher. The tag is appended to the returned ciphertext.
pub(crate) fn aead_seal<C>(key: &[u8], nonce: &[u8], aad: &[u8], plaintext: &[u8]) -> CryptoResult<Vec<u8>>
where
    C: Aead + KeyInit,
{
    if nonce.len() != nonce_len::<C>() {
        return Err(CryptoError::InvalidNonce);
    }
    let cipher = C::new_from_slice(key)
        .map_err(|_| CryptoError::InvalidKey(format!("unexpected key length {}", key.len())))?;

    cipher
        .encrypt(Nonce::<C>::from_slice(nonce), Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::EncryptionFailed("AEAD seal".to_string()))
}

/// Decrypt with any AEAD cipher. Nothing is returned unless the tag verifies.
pub(crate) fn aead_open<C>(key: &[u8], nonce: &[u8], aad: &[u8], ciphertext: &[u8]) -> CryptoResult<Vec<u8>>
where
    C: Aead + KeyInit,
{
    if nonce.len() != nonce_len::<C>() {
        return Err(CryptoError::InvalidNonce);
    }
    let cipher = C::new_from_slice(key)
        .map_err(|_| CryptoError::InvalidKey(format!("unexpected key length {}", key.len())))?;

    cipher
        .decrypt(Nonce::<C>::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes_gcm::Aes256Gcm;
    use chacha20poly1305::ChaCha20Poly1305;

    #[test]
    fn test_random_bytes_are_fresh() {
        let a = random_bytes(32);
        let b = random_bytes(32);
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
        assert!(random_bytes(0).is_empty());
    }

    #[test]
    fn test_aead_seal_and_open() {
        let key = random_bytes(32);
        let nonce = random_bytes(12);

        let ciphertext = aead_seal::<Aes256Gcm>(&key, &nonce, b"header", b"Hello, World!").unwrap();
        let plaintext = aead_open::<Aes256Gcm>(&key, &nonce, b"header", &ciphertext).unwrap();
        assert_eq!(plaintext, b"Hello, World!");

        let ciphertext = aead_seal::<ChaCha20Poly1305>(&key, &nonce, b"", b"payload").unwrap();
        let plaintext = aead_open::<ChaCha20Poly1305>(&key, &nonce, b"", &ciphertext).unwrap();
        assert_eq!(plaintext, b"payload");
    }

    #[test]
    fn test_aead_rejects_wrong_aad_and_key() {
        let key = random_bytes(32);
        let nonce = random_bytes(12);
        let ciphertext = aead_seal::<Aes256Gcm>(&key, &nonce, b"v1", b"secret").unwrap();

        assert!(matches!(
            aead_open::<Aes256Gcm>(&key, &nonce, b"v2", &ciphertext),
            Err(CryptoError::DecryptionFailed)
        ));

        let other = random_bytes(32);
        assert!(matches!(
            aead_open::<Aes256Gcm>(&other, &nonce, b"v1", &ciphertext),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_aead_rejects_bad_lengths() {
        let key = random_bytes(32);
        assert!(matches!(
            aead_seal::<Aes256Gcm>(&key, &[0u8; 8], b"", b"x"),
            Err(CryptoError::InvalidNonce)
        ));
        assert!(matches!(
            aead_seal::<Aes256Gcm>(&key[..10], &[0u8; 12], b"", b"x"),
            Err(CryptoError::InvalidKey(_))
        ));
    }
}
