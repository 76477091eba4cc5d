//! Symmetric payload encryption.
//!
//! Ciphertext layout:
//!
//! ```text
//! salt | nonce or IV | body | tag
//! ```
//!
//! AEAD modes (AES-GCM, ChaCha20-Poly1305) authenticate the salt as
//! associated data and carry their own 16-byte tag. CBC and CTR are
//! encrypt-then-MAC: the key derivation yields a second 32-byte key and an
//! HMAC-SHA256 over `salt | IV | body` is appended.

use aes::cipher::{
    block_padding::{NoPadding, Pkcs7},
    BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher,
};
use aes_gcm::aead::consts::U12;
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm};
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use std::fmt;
use tracing::debug;
use zeroize::Zeroizing;

use crate::assembly::MergedConfiguration;
use crate::crypto::{aead_open, aead_seal, random_bytes, CryptoError, CryptoResult};
use crate::error::{Error, Result};
use crate::value::ConfigValue;

type Aes192Gcm = AesGcm<aes::Aes192, U12>;
type HmacSha256 = Hmac<Sha256>;

pub const DEFAULT_ITERATIONS: u32 = 10_000;
pub const DEFAULT_SALT_BYTES: usize = 8;
pub const DEFAULT_AES_KEY_BITS: u16 = 128;

const MAX_SALT_BYTES: usize = 64;
const MAX_ITERATIONS: u64 = 10_000_000;
const AEAD_NONCE_LEN: usize = 12;
const AEAD_TAG_LEN: usize = 16;
const BLOCK_LEN: usize = 16;
const MAC_LEN: usize = 32;
const HKDF_INFO: &[u8] = b"sinetstream payload key";

macro_rules! with_aes {
    ($bits:expr, |$cipher:ident| $body:expr) => {
        match $bits {
            128 => {
                type $cipher = aes::Aes128;
                $body
            }
            192 => {
                type $cipher = aes::Aes192;
                $body
            }
            _ => {
                type $cipher = aes::Aes256;
                $body
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Padding {
    None,
    Pkcs7,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AesMode {
    Gcm,
    Cbc(Padding),
    Ctr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cipher {
    Aes { key_bits: u16, mode: AesMode },
    ChaCha20Poly1305,
}

impl Cipher {
    pub fn aes(key_bits: u16, mode: AesMode) -> Result<Self> {
        if !matches!(key_bits, 128 | 192 | 256) {
            return Err(Error::invalid_config(format!(
                "AES key length must be 128, 192 or 256 bits, got {}",
                key_bits
            )));
        }
        Ok(Cipher::Aes { key_bits, mode })
    }

    /// Encryption key length in bytes
    pub fn key_len(self) -> usize {
        match self {
            Cipher::Aes { key_bits, .. } => key_bits as usize / 8,
            Cipher::ChaCha20Poly1305 => 32,
        }
    }

    fn has_mac(self) -> bool {
        matches!(
            self,
            Cipher::Aes {
                mode: AesMode::Cbc(_) | AesMode::Ctr,
                ..
            }
        )
    }

    fn key_material_len(self) -> usize {
        self.key_len() + if self.has_mac() { MAC_LEN } else { 0 }
    }

    /// Shortest ciphertext for an empty plaintext, excluding the salt
    fn min_overhead(self) -> usize {
        match self {
            Cipher::ChaCha20Poly1305 | Cipher::Aes { mode: AesMode::Gcm, .. } => AEAD_NONCE_LEN + AEAD_TAG_LEN,
            Cipher::Aes { .. } => BLOCK_LEN + MAC_LEN,
        }
    }
}

impl fmt::Display for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cipher::Aes { key_bits, mode } => match mode {
                AesMode::Gcm => write!(f, "AES-{}-GCM", key_bits),
                AesMode::Cbc(Padding::Pkcs7) => write!(f, "AES-{}-CBC/PKCS7", key_bits),
                AesMode::Cbc(Padding::None) => write!(f, "AES-{}-CBC/NoPadding", key_bits),
                AesMode::Ctr => write!(f, "AES-{}-CTR", key_bits),
            },
            Cipher::ChaCha20Poly1305 => f.write_str("ChaCha20-Poly1305"),
        }
    }
}

/// HMAC hash for PBKDF2
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Prf {
    Sha1,
    #[default]
    Sha256,
    Sha512,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyDerivation {
    Pbkdf2 { prf: Prf, iterations: u32 },
    HkdfSha256,
}

impl Default for KeyDerivation {
    fn default() -> Self {
        KeyDerivation::Pbkdf2 {
            prf: Prf::default(),
            iterations: DEFAULT_ITERATIONS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Salt {
    /// Same salt for every message
    Fixed(Vec<u8>),
    /// Fresh salt of this many bytes per message
    Random(usize),
}

impl Salt {
    fn len(&self) -> usize {
        match self {
            Salt::Fixed(salt) => salt.len(),
            Salt::Random(len) => *len,
        }
    }

    fn generate(&self) -> Vec<u8> {
        match self {
            Salt::Fixed(salt) => salt.clone(),
            Salt::Random(len) => random_bytes(*len),
        }
    }
}

impl Default for Salt {
    fn default() -> Self {
        Salt::Random(DEFAULT_SALT_BYTES)
    }
}

/// Cipher, key derivation and password for one service
#[derive(Clone)]
pub struct EncryptionSpec {
    pub cipher: Cipher,
    pub kdf: KeyDerivation,
    pub salt: Salt,
    password: Zeroizing<Vec<u8>>,
}

impl EncryptionSpec {
    pub fn new(cipher: Cipher, password: impl AsRef<[u8]>) -> Self {
        Self {
            cipher,
            kdf: KeyDerivation::default(),
            salt: Salt::default(),
            password: Zeroizing::new(password.as_ref().to_vec()),
        }
    }

    pub fn with_kdf(mut self, kdf: KeyDerivation) -> Self {
        self.kdf = kdf;
        self
    }

    pub fn with_salt(mut self, salt: Salt) -> Self {
        self.salt = salt;
        self
    }

    /// Read `<service>.crypto.*` from a merged configuration.
    ///
    /// Returns `None` unless `<service>.data_encryption` is true.
    pub fn from_config(merged: &MergedConfiguration, service: &str) -> Result<Option<Self>> {
        let section = Section { merged, service };

        let enabled = match section.value("data_encryption") {
            None => false,
            Some(value) => value.as_bool().ok_or_else(|| section.invalid("data_encryption", "a boolean", value))?,
        };
        if !enabled {
            return Ok(None);
        }

        let algorithm = section.text("crypto.algorithm")?.unwrap_or_else(|| "AES".to_string());
        let key_bits = section.number("crypto.key_length")?;
        let mode = section.text("crypto.mode")?;
        let padding = section.text("crypto.padding")?.map(|p| parse_padding(&p)).transpose()?;

        let cipher = match algorithm.as_str() {
            "AES" => {
                let key_bits = match key_bits {
                    Some(bits) => u16::try_from(bits)
                        .map_err(|_| Error::invalid_config(format!("AES key length {} is out of range", bits)))?,
                    None => DEFAULT_AES_KEY_BITS,
                };
                let mode = match mode.as_deref().unwrap_or("GCM") {
                    "GCM" => AesMode::Gcm,
                    "CBC" => AesMode::Cbc(padding.unwrap_or(Padding::Pkcs7)),
                    "CTR" => AesMode::Ctr,
                    other => return Err(Error::invalid_config(format!("unsupported AES mode {}", other))),
                };
                if mode != AesMode::Cbc(Padding::Pkcs7) && padding == Some(Padding::Pkcs7) {
                    return Err(Error::invalid_config("PKCS7 padding requires CBC mode"));
                }
                Cipher::aes(key_bits, mode)?
            }
            "CHACHA20" | "CHACHA20-POLY1305" | "CHACHA20_POLY1305" => {
                if key_bits.is_some_and(|bits| bits != 256) {
                    return Err(Error::invalid_config("ChaCha20-Poly1305 keys are 256 bits"));
                }
                if mode.as_deref().is_some_and(|m| m != "POLY1305") || padding == Some(Padding::Pkcs7) {
                    return Err(Error::invalid_config("ChaCha20-Poly1305 takes no mode or padding"));
                }
                Cipher::ChaCha20Poly1305
            }
            other => return Err(Error::invalid_config(format!("unsupported cipher {}", other))),
        };

        let password = section
            .bytes("crypto.password")?
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Error::invalid_config(format!("{}.crypto.password is required", service)))?;

        let kdf = match section
            .text("crypto.key_derivation.algorithm")?
            .as_deref()
            .unwrap_or("PBKDF2")
        {
            "PBKDF2" => {
                let iterations = section
                    .number("crypto.key_derivation.iteration")?
                    .unwrap_or(DEFAULT_ITERATIONS as u64);
                if iterations == 0 || iterations > MAX_ITERATIONS {
                    return Err(Error::invalid_config(format!(
                        "PBKDF2 iteration count {} is out of range",
                        iterations
                    )));
                }
                let prf = section
                    .text("crypto.key_derivation.prf")?
                    .map(|p| parse_prf(&p))
                    .transpose()?
                    .unwrap_or_default();
                KeyDerivation::Pbkdf2 {
                    prf,
                    iterations: iterations as u32,
                }
            }
            "HKDF" | "HKDF-SHA256" => KeyDerivation::HkdfSha256,
            other => return Err(Error::invalid_config(format!("unsupported key derivation {}", other))),
        };

        let salt = match section.bytes("crypto.key_derivation.salt")? {
            Some(salt) if !salt.is_empty() => Salt::Fixed(salt.to_vec()),
            _ => {
                let len = section
                    .number("crypto.key_derivation.salt_bytes")?
                    .unwrap_or(DEFAULT_SALT_BYTES as u64);
                if len == 0 || len > MAX_SALT_BYTES as u64 {
                    return Err(Error::invalid_config(format!("salt_bytes {} is out of range", len)));
                }
                Salt::Random(len as usize)
            }
        };

        let spec = Self::new(cipher, password).with_kdf(kdf).with_salt(salt);
        debug!("Payload encryption for {}: {}", service, spec.cipher);
        Ok(Some(spec))
    }

    fn derive(&self, salt: &[u8]) -> CryptoResult<Zeroizing<Vec<u8>>> {
        let mut key = Zeroizing::new(vec![0u8; self.cipher.key_material_len()]);
        match self.kdf {
            KeyDerivation::Pbkdf2 { prf, iterations } => match prf {
                Prf::Sha1 => pbkdf2_hmac::<Sha1>(&self.password, salt, iterations, &mut key),
                Prf::Sha256 => pbkdf2_hmac::<Sha256>(&self.password, salt, iterations, &mut key),
                Prf::Sha512 => pbkdf2_hmac::<Sha512>(&self.password, salt, iterations, &mut key),
            },
            KeyDerivation::HkdfSha256 => Hkdf::<Sha256>::new(Some(salt), &self.password)
                .expand(HKDF_INFO, &mut key)
                .map_err(|_| CryptoError::InvalidKey("HKDF output too long".to_string()))?,
        }
        Ok(key)
    }
}

impl fmt::Debug for EncryptionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionSpec")
            .field("cipher", &self.cipher)
            .field("kdf", &self.kdf)
            .field("salt", &self.salt)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// One service's parameters inside the merged configuration
struct Section<'a> {
    merged: &'a MergedConfiguration,
    service: &'a str,
}

impl<'a> Section<'a> {
    fn value(&self, key: &str) -> Option<&'a ConfigValue> {
        self.merged
            .get(&format!("{}.{}", self.service, key))
            .filter(|v| !matches!(v, ConfigValue::Null))
    }

    fn invalid(&self, key: &str, expected: &str, found: &ConfigValue) -> Error {
        Error::invalid_config(format!(
            "{}.{} must be {}, got {}",
            self.service,
            key,
            expected,
            found.type_name()
        ))
    }

    /// Upper-cased text value
    fn text(&self, key: &str) -> Result<Option<String>> {
        self.value(key)
            .map(|v| {
                v.as_str()
                    .map(|s| s.trim().to_ascii_uppercase())
                    .ok_or_else(|| self.invalid(key, "a string", v))
            })
            .transpose()
    }

    fn number(&self, key: &str) -> Result<Option<u64>> {
        self.value(key)
            .map(|v| v.as_u64().ok_or_else(|| self.invalid(key, "a non-negative integer", v)))
            .transpose()
    }

    fn bytes(&self, key: &str) -> Result<Option<&'a [u8]>> {
        self.value(key)
            .map(|v| v.as_bytes().ok_or_else(|| self.invalid(key, "a string", v)))
            .transpose()
    }
}

fn parse_padding(value: &str) -> Result<Padding> {
    match value {
        "NONE" | "NOPADDING" => Ok(Padding::None),
        "PKCS7" | "PKCS5" | "PKCS7PADDING" | "PKCS5PADDING" => Ok(Padding::Pkcs7),
        other => Err(Error::invalid_config(format!("unsupported padding {}", other))),
    }
}

fn parse_prf(value: &str) -> Result<Prf> {
    let digest = value
        .trim_start_matches("HMAC")
        .trim_start_matches(['-', '_'])
        .replace('-', "");
    match digest.as_str() {
        "SHA1" => Ok(Prf::Sha1),
        "SHA256" => Ok(Prf::Sha256),
        "SHA512" => Ok(Prf::Sha512),
        _ => Err(Error::invalid_config(format!("unsupported PBKDF2 PRF {}", value))),
    }
}

fn mac_over(key: &[u8], data: &[u8]) -> CryptoResult<HmacSha256> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|_| CryptoError::InvalidKey("MAC key".to_string()))?;
    mac.update(data);
    Ok(mac)
}

fn invalid_key(_: impl fmt::Debug) -> CryptoError {
    CryptoError::InvalidKey("cipher key or IV length".to_string())
}

fn cbc_encrypt(key_bits: u16, key: &[u8], iv: &[u8], padding: Padding, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
    if padding == Padding::None && plaintext.len() % BLOCK_LEN != 0 {
        return Err(CryptoError::EncryptionFailed(format!(
            "{} bytes is not a whole number of blocks and padding is disabled",
            plaintext.len()
        )));
    }
    with_aes!(key_bits, |A| {
        let encryptor = cbc::Encryptor::<A>::new_from_slices(key, iv).map_err(invalid_key)?;
        Ok(match padding {
            Padding::Pkcs7 => encryptor.encrypt_padded_vec_mut::<Pkcs7>(plaintext),
            Padding::None => encryptor.encrypt_padded_vec_mut::<NoPadding>(plaintext),
        })
    })
}

fn cbc_decrypt(key_bits: u16, key: &[u8], iv: &[u8], padding: Padding, body: &[u8]) -> CryptoResult<Vec<u8>> {
    if body.len() % BLOCK_LEN != 0 {
        return Err(CryptoError::DecryptionFailed);
    }
    with_aes!(key_bits, |A| {
        let decryptor = cbc::Decryptor::<A>::new_from_slices(key, iv).map_err(invalid_key)?;
        match padding {
            Padding::Pkcs7 => decryptor.decrypt_padded_vec_mut::<Pkcs7>(body),
            Padding::None => decryptor.decrypt_padded_vec_mut::<NoPadding>(body),
        }
        .map_err(|_| CryptoError::DecryptionFailed)
    })
}

fn ctr_apply(key_bits: u16, key: &[u8], iv: &[u8], data: &[u8]) -> CryptoResult<Vec<u8>> {
    let mut buf = data.to_vec();
    with_aes!(key_bits, |A| {
        let mut cipher = ctr::Ctr128BE::<A>::new_from_slices(key, iv).map_err(invalid_key)?;
        cipher.apply_keystream(&mut buf);
    });
    Ok(buf)
}

/// Encrypts and decrypts message payloads; a pass-through when no [`EncryptionSpec`] is set.
///
/// Safe to share across threads. With a fixed salt the key is derived once.
#[derive(Clone, Default)]
pub struct PayloadCryptor {
    spec: Option<EncryptionSpec>,
    cached_key: Option<Zeroizing<Vec<u8>>>,
}

impl PayloadCryptor {
    pub fn passthrough() -> Self {
        Self::default()
    }

    pub fn new(spec: EncryptionSpec) -> Result<Self> {
        let cached_key = match &spec.salt {
            Salt::Fixed(salt) => Some(spec.derive(salt)?),
            Salt::Random(_) => None,
        };
        Ok(Self {
            spec: Some(spec),
            cached_key,
        })
    }

    /// Cryptor for `service`, pass-through unless encryption is switched on
    pub fn from_config(merged: &MergedConfiguration, service: &str) -> Result<Self> {
        match EncryptionSpec::from_config(merged, service)? {
            Some(spec) => Self::new(spec),
            None => Ok(Self::passthrough()),
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.spec.is_none()
    }

    pub fn spec(&self) -> Option<&EncryptionSpec> {
        self.spec.as_ref()
    }

    fn key_for(&self, spec: &EncryptionSpec, salt: &[u8]) -> CryptoResult<Zeroizing<Vec<u8>>> {
        match (&self.cached_key, &spec.salt) {
            (Some(key), Salt::Fixed(fixed)) if fixed.as_slice() == salt => Ok(key.clone()),
            _ => spec.derive(salt),
        }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let Some(spec) = &self.spec else {
            return Ok(plaintext.to_vec());
        };

        let salt = spec.salt.generate();
        let key = self.key_for(spec, &salt)?;
        let (enc_key, mac_key) = key.split_at(spec.cipher.key_len());
        let mut out = salt;

        match spec.cipher {
            Cipher::ChaCha20Poly1305 => {
                let nonce = random_bytes(AEAD_NONCE_LEN);
                let body = aead_seal::<ChaCha20Poly1305>(enc_key, &nonce, &out, plaintext)?;
                out.extend_from_slice(&nonce);
                out.extend_from_slice(&body);
            }
            Cipher::Aes { key_bits, mode: AesMode::Gcm } => {
                let nonce = random_bytes(AEAD_NONCE_LEN);
                let body = match key_bits {
                    128 => aead_seal::<Aes128Gcm>(enc_key, &nonce, &out, plaintext)?,
                    192 => aead_seal::<Aes192Gcm>(enc_key, &nonce, &out, plaintext)?,
                    _ => aead_seal::<Aes256Gcm>(enc_key, &nonce, &out, plaintext)?,
                };
                out.extend_from_slice(&nonce);
                out.extend_from_slice(&body);
            }
            Cipher::Aes { key_bits, mode } => {
                let iv = random_bytes(BLOCK_LEN);
                let body = match mode {
                    AesMode::Cbc(padding) => cbc_encrypt(key_bits, enc_key, &iv, padding, plaintext)?,
                    _ => ctr_apply(key_bits, enc_key, &iv, plaintext)?,
                };
                out.extend_from_slice(&iv);
                out.extend_from_slice(&body);
                let tag = mac_over(mac_key, &out)?.finalize().into_bytes();
                out.extend_from_slice(&tag);
            }
        }
        Ok(out)
    }

    /// Exact inverse of [`encrypt`](Self::encrypt). Returns nothing unless
    /// the whole ciphertext authenticates.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let Some(spec) = &self.spec else {
            return Ok(ciphertext.to_vec());
        };

        let salt_len = spec.salt.len();
        if ciphertext.len() < salt_len + spec.cipher.min_overhead() {
            return Err(CryptoError::Truncated.into());
        }
        let (salt, rest) = ciphertext.split_at(salt_len);
        let key = self.key_for(spec, salt)?;
        let (enc_key, mac_key) = key.split_at(spec.cipher.key_len());

        let plaintext = match spec.cipher {
            Cipher::ChaCha20Poly1305 => {
                let (nonce, body) = rest.split_at(AEAD_NONCE_LEN);
                aead_open::<ChaCha20Poly1305>(enc_key, nonce, salt, body)?
            }
            Cipher::Aes { key_bits, mode: AesMode::Gcm } => {
                let (nonce, body) = rest.split_at(AEAD_NONCE_LEN);
                match key_bits {
                    128 => aead_open::<Aes128Gcm>(enc_key, nonce, salt, body)?,
                    192 => aead_open::<Aes192Gcm>(enc_key, nonce, salt, body)?,
                    _ => aead_open::<Aes256Gcm>(enc_key, nonce, salt, body)?,
                }
            }
            Cipher::Aes { key_bits, mode } => {
                let (authenticated, tag) = ciphertext.split_at(ciphertext.len() - MAC_LEN);
                mac_over(mac_key, authenticated)?
                    .verify_slice(tag)
                    .map_err(|_| CryptoError::AuthenticationFailed)?;

                let (iv, body) = authenticated[salt_len..].split_at(BLOCK_LEN);
                match mode {
                    AesMode::Cbc(padding) => cbc_decrypt(key_bits, enc_key, iv, padding, body)?,
                    _ => ctr_apply(key_bits, enc_key, iv, body)?,
                }
            }
        };
        Ok(plaintext)
    }
}

impl fmt::Debug for PayloadCryptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadCryptor")
            .field("spec", &self.spec)
            .field("key_cached", &self.cached_key.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Cheap derivation so the combination grid stays fast
    fn spec(cipher: Cipher) -> EncryptionSpec {
        EncryptionSpec::new(cipher, "correct horse").with_kdf(KeyDerivation::Pbkdf2 {
            prf: Prf::Sha256,
            iterations: 2,
        })
    }

    fn all_ciphers() -> Vec<Cipher> {
        let mut ciphers = vec![Cipher::ChaCha20Poly1305];
        for bits in [128, 192, 256] {
            for mode in [
                AesMode::Gcm,
                AesMode::Cbc(Padding::Pkcs7),
                AesMode::Cbc(Padding::None),
                AesMode::Ctr,
            ] {
                ciphers.push(Cipher::aes(bits, mode).unwrap());
            }
        }
        ciphers
    }

    fn sizes_for(cipher: Cipher) -> Vec<usize> {
        if matches!(cipher, Cipher::Aes { mode: AesMode::Cbc(Padding::None), .. }) {
            vec![0, 16, 48]
        } else {
            vec![0, 1, 15, 16, 17, 1000]
        }
    }

    fn merged(entries: serde_json::Value) -> MergedConfiguration {
        let mut merged = MergedConfiguration::new("service-1");
        for (key, value) in entries.as_object().unwrap() {
            merged.insert(key, ConfigValue::from(value.clone()));
        }
        merged
    }

    #[test]
    fn test_roundtrip_every_cipher_and_size() {
        for cipher in all_ciphers() {
            let cryptor = PayloadCryptor::new(spec(cipher)).unwrap();
            for size in sizes_for(cipher) {
                let plaintext: Vec<u8> = (0..size).map(|i| i as u8).collect();
                let ciphertext = cryptor.encrypt(&plaintext).unwrap();
                assert_ne!(ciphertext, plaintext, "{} / {}", cipher, size);
                assert_eq!(cryptor.decrypt(&ciphertext).unwrap(), plaintext, "{} / {}", cipher, size);
            }
        }
    }

    #[test]
    fn test_every_byte_is_tamper_evident() {
        for cipher in all_ciphers() {
            let cryptor = PayloadCryptor::new(spec(cipher)).unwrap();
            let ciphertext = cryptor.encrypt(&[0x5a; 32]).unwrap();
            for i in 0..ciphertext.len() {
                let mut corrupt = ciphertext.clone();
                corrupt[i] ^= 0x80;
                assert!(cryptor.decrypt(&corrupt).is_err(), "{} byte {}", cipher, i);
            }
            assert!(cryptor.decrypt(&ciphertext[..ciphertext.len() - 1]).is_err());
        }
    }

    #[test]
    fn test_wrong_password_fails() {
        let cipher = Cipher::aes(256, AesMode::Ctr).unwrap();
        let ours = PayloadCryptor::new(spec(cipher)).unwrap();
        let theirs = PayloadCryptor::new(
            EncryptionSpec::new(cipher, "battery staple").with_kdf(KeyDerivation::HkdfSha256),
        )
        .unwrap();
        let ciphertext = ours.encrypt(b"hello").unwrap();
        assert!(matches!(
            theirs.decrypt(&ciphertext),
            Err(Error::Crypto(CryptoError::AuthenticationFailed))
        ));
    }

    #[test]
    fn test_fixed_salt_and_fresh_nonces() {
        let cryptor = PayloadCryptor::new(
            spec(Cipher::aes(128, AesMode::Gcm).unwrap()).with_salt(Salt::Fixed(b"pepper".to_vec())),
        )
        .unwrap();
        let a = cryptor.encrypt(b"same").unwrap();
        let b = cryptor.encrypt(b"same").unwrap();
        assert_eq!(&a[..6], b"pepper");
        assert_ne!(a, b);
        assert_eq!(cryptor.decrypt(&b).unwrap(), b"same");
    }

    #[test]
    fn test_no_padding_rejects_partial_blocks() {
        let cryptor = PayloadCryptor::new(spec(Cipher::aes(128, AesMode::Cbc(Padding::None)).unwrap())).unwrap();
        assert!(matches!(
            cryptor.encrypt(b"not sixteen"),
            Err(Error::Crypto(CryptoError::EncryptionFailed(_)))
        ));
    }

    #[test]
    fn test_passthrough() {
        let cryptor = PayloadCryptor::passthrough();
        assert!(cryptor.is_passthrough());
        assert_eq!(cryptor.encrypt(b"plain").unwrap(), b"plain");
        assert_eq!(cryptor.decrypt(b"plain").unwrap(), b"plain");
    }

    #[test]
    fn test_from_config_defaults() {
        let config = merged(json!({
            "service-1.data_encryption": true,
            "service-1.crypto.password": "secret-000003"
        }));
        let spec = EncryptionSpec::from_config(&config, "service-1").unwrap().unwrap();
        assert_eq!(spec.cipher, Cipher::Aes { key_bits: 128, mode: AesMode::Gcm });
        assert_eq!(spec.kdf, KeyDerivation::default());
        assert_eq!(spec.salt, Salt::Random(DEFAULT_SALT_BYTES));
        assert!(!format!("{:?}", spec).contains("secret-000003"));
    }

    #[test]
    fn test_from_config_full() {
        let config = merged(json!({
            "service-1.data_encryption": "yes",
            "service-1.crypto.algorithm": "aes",
            "service-1.crypto.key_length": 256,
            "service-1.crypto.mode": "cbc",
            "service-1.crypto.padding": "pkcs5",
            "service-1.crypto.password": "pw",
            "service-1.crypto.key_derivation.algorithm": "pbkdf2",
            "service-1.crypto.key_derivation.iteration": 1000,
            "service-1.crypto.key_derivation.prf": "HMAC-SHA512",
            "service-1.crypto.key_derivation.salt": "fixedsalt"
        }));
        let spec = EncryptionSpec::from_config(&config, "service-1").unwrap().unwrap();
        assert_eq!(spec.cipher, Cipher::Aes { key_bits: 256, mode: AesMode::Cbc(Padding::Pkcs7) });
        assert_eq!(
            spec.kdf,
            KeyDerivation::Pbkdf2 {
                prf: Prf::Sha512,
                iterations: 1000
            }
        );
        assert_eq!(spec.salt, Salt::Fixed(b"fixedsalt".to_vec()));
    }

    #[test]
    fn test_from_config_disabled_or_absent() {
        let off = merged(json!({"service-1.data_encryption": false, "service-1.crypto.password": "pw"}));
        assert!(EncryptionSpec::from_config(&off, "service-1").unwrap().is_none());
        assert!(PayloadCryptor::from_config(&off, "service-1").unwrap().is_passthrough());

        let absent = merged(json!({"service-1.type": "mqtt"}));
        assert!(EncryptionSpec::from_config(&absent, "service-1").unwrap().is_none());
    }

    #[test]
    fn test_from_config_rejects_out_of_range_values() {
        let cases = [
            json!({"service-1.crypto.key_length": 100}),
            json!({"service-1.crypto.mode": "ECB"}),
            json!({"service-1.crypto.mode": "GCM", "service-1.crypto.padding": "pkcs7"}),
            json!({"service-1.crypto.algorithm": "DES"}),
            json!({"service-1.crypto.algorithm": "chacha20", "service-1.crypto.key_length": 128}),
            json!({"service-1.crypto.key_derivation.iteration": 0}),
            json!({"service-1.crypto.key_derivation.salt_bytes": 1000}),
            json!({"service-1.crypto.key_derivation.prf": "md5"}),
            json!({"service-1.crypto.password": null}),
        ];
        for case in cases {
            let mut entries = json!({
                "service-1.data_encryption": true,
                "service-1.crypto.password": "pw"
            });
            for (key, value) in case.as_object().unwrap() {
                entries[key] = value.clone();
            }
            let err = EncryptionSpec::from_config(&merged(entries), "service-1").unwrap_err();
            assert!(matches!(err, Error::InvalidConfiguration(_)), "{}: {:?}", case, err);
        }

        let bad_switch = merged(json!({"service-1.data_encryption": "maybe"}));
        assert!(EncryptionSpec::from_config(&bad_switch, "service-1").is_err());
    }

    #[test]
    fn test_secret_password_bytes_are_used() {
        let mut config = merged(json!({"service-1.data_encryption": true}));
        config.insert("service-1.crypto.password", ConfigValue::Bytes(b"from-secret".to_vec()));
        let cryptor = PayloadCryptor::from_config(&config, "service-1").unwrap();
        let twin = PayloadCryptor::new(EncryptionSpec::new(
            Cipher::aes(128, AesMode::Gcm).unwrap(),
            "from-secret",
        ))
        .unwrap();
        assert_eq!(twin.decrypt(&cryptor.encrypt(b"x").unwrap()).unwrap(), b"x");
    }
}
