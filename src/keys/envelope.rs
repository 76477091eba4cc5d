//! Wire format of a secret wrapped to one device key.
//!
//! ```text
//! | kem: u16 BE | wrapped_len: u16 BE | RSA-OAEP(cek) | nonce[12] | AES-256-GCM(value) || tag[16] |
//! ```
//!
//! The content-encryption key is random per secret. The 4-byte header is
//! authenticated as associated data, so a payload cannot be relabelled with a
//! different method.

use aes_gcm::Aes256Gcm;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::rngs::OsRng;
use rsa::{pkcs8::DecodePublicKey, RsaPrivateKey, RsaPublicKey};
use zeroize::Zeroizing;

use super::{DeviceKey, Kem};
use crate::crypto::{aead_open, aead_seal, random_bytes, CryptoError, CryptoResult};

const HEADER_LEN: usize = 4;
const CEK_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Seal `plaintext` to an RSA public key given as DER SubjectPublicKeyInfo.
pub fn seal(public_key_der: &[u8], kem: Kem, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
    let public = RsaPublicKey::from_public_key_der(public_key_der)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    seal_to(&public, kem, plaintext)
}

/// Seal `plaintext` to a base64 DER public key, returning base64 as served by the config server.
pub fn seal_base64(public_key_base64: &str, kem: Kem, plaintext: &[u8]) -> CryptoResult<String> {
    let der = BASE64.decode(public_key_base64.trim())?;
    Ok(BASE64.encode(seal(&der, kem, plaintext)?))
}

fn seal_to(public: &RsaPublicKey, kem: Kem, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
    let cek = Zeroizing::new(random_bytes(CEK_LEN));
    let wrapped = public
        .encrypt(&mut OsRng, kem.padding(), &cek)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
    let wrapped_len = u16::try_from(wrapped.len())
        .map_err(|_| CryptoError::InvalidKey("modulus too large".to_string()))?;

    let mut header = [0u8; HEADER_LEN];
    header[..2].copy_from_slice(&kem.code().to_be_bytes());
    header[2..].copy_from_slice(&wrapped_len.to_be_bytes());

    let nonce = random_bytes(NONCE_LEN);
    let body = aead_seal::<Aes256Gcm>(&cek, &nonce, &header, plaintext)?;

    let mut out = Vec::with_capacity(HEADER_LEN + wrapped.len() + NONCE_LEN + body.len());
    out.extend_from_slice(&header);
    out.extend_from_slice(&wrapped);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Open a payload, refusing any method other than `expected`.
pub(crate) fn open(private: &RsaPrivateKey, expected: Kem, payload: &[u8]) -> CryptoResult<Zeroizing<Vec<u8>>> {
    let (kem, wrapped, nonce, body, header) = split(payload)?;
    if kem != expected {
        return Err(CryptoError::KemMismatch {
            expected: expected.to_string(),
            found: kem.to_string(),
        });
    }

    let cek = Zeroizing::new(
        private
            .decrypt(kem.padding(), wrapped)
            .map_err(|_| CryptoError::DecryptionFailed)?,
    );
    if cek.len() != CEK_LEN {
        return Err(CryptoError::DecryptionFailed);
    }

    aead_open::<Aes256Gcm>(&cek, nonce, header, body).map(Zeroizing::new)
}

type Parts<'a> = (Kem, &'a [u8], &'a [u8], &'a [u8], &'a [u8]);

fn split(payload: &[u8]) -> CryptoResult<Parts<'_>> {
    if payload.len() < HEADER_LEN {
        return Err(CryptoError::Truncated);
    }
    let kem = Kem::from_code(u16::from_be_bytes([payload[0], payload[1]]))?;
    let wrapped_len = u16::from_be_bytes([payload[2], payload[3]]) as usize;

    let rest = &payload[HEADER_LEN..];
    if rest.len() < wrapped_len + NONCE_LEN + TAG_LEN {
        return Err(CryptoError::Truncated);
    }
    let (wrapped, rest) = rest.split_at(wrapped_len);
    let (nonce, body) = rest.split_at(NONCE_LEN);
    Ok((kem, wrapped, nonce, body, &payload[..HEADER_LEN]))
}

impl DeviceKey {
    /// Seal `plaintext` to this key's public half.
    pub fn seal(&self, kem: Kem, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        seal(self.public_key_der(), kem, plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::testing::test_key;

    #[test]
    fn test_seal_and_unwrap_each_kem() {
        let key = test_key(0);
        for kem in [Kem::RsaOaepSha1, Kem::RsaOaepSha256, Kem::RsaOaepSha512] {
            let sealed = key.seal(kem, b"mqtt-password").unwrap();
            assert_eq!(u16::from_be_bytes([sealed[0], sealed[1]]), kem.code());
            let opened = key.unwrap(&sealed, kem).unwrap();
            assert_eq!(opened.as_slice(), b"mqtt-password");
        }
    }

    #[test]
    fn test_large_value_roundtrip() {
        // TLS material is far larger than one RSA block
        let key = test_key(0);
        let pem = vec![b'A'; 8 * 1024];
        let sealed = key.seal(Kem::RsaOaepSha256, &pem).unwrap();
        assert_eq!(key.unwrap(&sealed, Kem::RsaOaepSha256).unwrap().as_slice(), pem.as_slice());
    }

    #[test]
    fn test_no_downgrade_to_declared_method() {
        let key = test_key(0);
        let sealed = key.seal(Kem::RsaOaepSha1, b"value").unwrap();
        assert!(matches!(
            key.unwrap(&sealed, Kem::RsaOaepSha256),
            Err(CryptoError::KemMismatch { .. })
        ));
    }

    #[test]
    fn test_relabelled_header_fails() {
        let key = test_key(0);
        let mut sealed = key.seal(Kem::RsaOaepSha256, b"value").unwrap();
        sealed[1] = Kem::RsaOaepSha1.code() as u8;
        assert!(matches!(
            key.unwrap(&sealed, Kem::RsaOaepSha1),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = test_key(0).seal(Kem::RsaOaepSha1, b"value").unwrap();
        assert!(matches!(
            test_key(1).unwrap(&sealed, Kem::RsaOaepSha1),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_corrupt_and_truncated_payloads() {
        let key = test_key(0);
        let sealed = key.seal(Kem::RsaOaepSha1, b"value").unwrap();

        let mut corrupt = sealed.clone();
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0x01;
        assert!(matches!(
            key.unwrap(&corrupt, Kem::RsaOaepSha1),
            Err(CryptoError::DecryptionFailed)
        ));

        assert!(matches!(key.unwrap(&sealed[..3], Kem::RsaOaepSha1), Err(CryptoError::Truncated)));
        assert!(matches!(key.unwrap(&sealed[..40], Kem::RsaOaepSha1), Err(CryptoError::Truncated)));
        assert!(matches!(
            key.unwrap(&[0, 9, 0, 0], Kem::RsaOaepSha1),
            Err(CryptoError::UnsupportedKem(_))
        ));
    }

    #[test]
    fn test_seal_base64_matches_registry_encoding() {
        let key = test_key(0);
        let sealed = seal_base64(&key.public_key_base64(), Kem::RsaOaepSha512, b"s3cr3t").unwrap();
        let raw = BASE64.decode(sealed).unwrap();
        assert_eq!(key.unwrap(&raw, Kem::RsaOaepSha512).unwrap().as_slice(), b"s3cr3t");
    }
}
