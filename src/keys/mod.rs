//! Device key pairs and secret unwrapping.
//!
//! The config server never sees a private key. A device generates (or loads) an
//! RSA key pair, registers the public half, and the server wraps every secret
//! to the fingerprint of one registered key. The [`Keyring`] maps those
//! fingerprints back to the private key able to unwrap them.
//!
//! ## Key-encryption methods
//!
//! | code  | method           |
//! |-------|------------------|
//! | `0x1` | RSA-OAEP/SHA-1 (default, kept for interop) |
//! | `0x2` | RSA-OAEP/SHA-256 |
//! | `0x3` | RSA-OAEP/SHA-512 |
//!
//! A payload is only ever opened with the method it declares *and* the caller
//! asked for; there is no downgrade path.

pub mod envelope;

use base64::{
    engine::general_purpose::{STANDARD as BASE64, STANDARD_NO_PAD},
    Engine,
};
use rand::rngs::OsRng;
use rsa::{
    pkcs1::DecodeRsaPrivateKey,
    pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding},
    Oaep, RsaPrivateKey, RsaPublicKey,
};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::crypto::{CryptoError, CryptoResult};
use crate::error::Result;

/// Default modulus size for generated device keys.
pub const DEFAULT_KEY_BITS: usize = 2048;

/// Key-encryption method used to wrap a secret for one device key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Kem {
    #[default]
    RsaOaepSha1,
    RsaOaepSha256,
    RsaOaepSha512,
}

impl Kem {
    pub const fn code(self) -> u16 {
        match self {
            Kem::RsaOaepSha1 => 0x1,
            Kem::RsaOaepSha256 => 0x2,
            Kem::RsaOaepSha512 => 0x3,
        }
    }

    pub fn from_code(code: u16) -> CryptoResult<Self> {
        match code {
            0x1 => Ok(Kem::RsaOaepSha1),
            0x2 => Ok(Kem::RsaOaepSha256),
            0x3 => Ok(Kem::RsaOaepSha512),
            other => Err(CryptoError::UnsupportedKem(format!("0x{:x}", other))),
        }
    }

    /// Value of the `kem` query parameter, e.g. `0x1`.
    pub fn query_value(self) -> String {
        format!("0x{:x}", self.code())
    }

    pub const fn name(self) -> &'static str {
        match self {
            Kem::RsaOaepSha1 => "RSA-OAEP-SHA1",
            Kem::RsaOaepSha256 => "RSA-OAEP-SHA256",
            Kem::RsaOaepSha512 => "RSA-OAEP-SHA512",
        }
    }

    fn padding(self) -> Oaep {
        match self {
            Kem::RsaOaepSha1 => Oaep::new::<Sha1>(),
            Kem::RsaOaepSha256 => Oaep::new::<Sha256>(),
            Kem::RsaOaepSha512 => Oaep::new::<Sha512>(),
        }
    }
}

impl fmt::Display for Kem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Kem {
    type Err = CryptoError;

    fn from_str(s: &str) -> CryptoResult<Self> {
        let normalized = s.trim().to_ascii_uppercase().replace('_', "-");
        if let Some(hex) = normalized.strip_prefix("0X") {
            let code = u16::from_str_radix(hex, 16)
                .map_err(|_| CryptoError::UnsupportedKem(s.to_string()))?;
            return Kem::from_code(code);
        }
        match normalized.as_str() {
            "RSA-OAEP" | "RSA-OAEP-SHA1" | "RSA-OAEP-SHA-1" => Ok(Kem::RsaOaepSha1),
            "RSA-OAEP-256" | "RSA-OAEP-SHA256" | "RSA-OAEP-SHA-256" => Ok(Kem::RsaOaepSha256),
            "RSA-OAEP-512" | "RSA-OAEP-SHA512" | "RSA-OAEP-SHA-512" => Ok(Kem::RsaOaepSha512),
            _ => Err(CryptoError::UnsupportedKem(s.to_string())),
        }
    }
}

/// Content fingerprint of a DER-encoded SubjectPublicKeyInfo.
pub fn fingerprint_of(public_key_der: &[u8]) -> String {
    format!("SHA256:{}", STANDARD_NO_PAD.encode(Sha256::digest(public_key_der)))
}

/// Parse a base64 DER SubjectPublicKeyInfo as sent to the registry.
pub fn parse_public_key_base64(public_key_base64: &str) -> CryptoResult<RsaPublicKey> {
    let der = BASE64.decode(public_key_base64.trim())?;
    RsaPublicKey::from_public_key_der(&der)
        .map_err(|e| CryptoError::InvalidKey(format!("not an RSA SubjectPublicKeyInfo: {}", e)))
}

/// RSA key pair held by the device.
///
/// The private key is zeroized on drop by the `rsa` crate.
#[derive(Clone)]
pub struct DeviceKey {
    private: RsaPrivateKey,
    public_der: Vec<u8>,
    fingerprint: String,
}

impl DeviceKey {
    /// Generate a new key pair.
    pub fn generate(bits: usize) -> CryptoResult<Self> {
        let private = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        info!("Generated {}-bit RSA device key", bits);
        Self::from_private(private)
    }

    fn from_private(private: RsaPrivateKey) -> CryptoResult<Self> {
        let public_der = private
            .to_public_key()
            .to_public_key_der()
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?
            .as_bytes()
            .to_vec();
        let fingerprint = fingerprint_of(&public_der);
        Ok(Self {
            private,
            public_der,
            fingerprint,
        })
    }

    /// Parse a PEM private key. PKCS#8 is preferred; PKCS#1 is accepted.
    pub fn from_pem(pem: &str) -> CryptoResult<Self> {
        let private = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Self::from_private(private)
    }

    /// Load a PEM private key from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let pem = Zeroizing::new(std::fs::read_to_string(path.as_ref())?);
        let key = Self::from_pem(&pem)?;
        debug!("Loaded device key {} from {}", key.fingerprint, path.as_ref().display());
        Ok(key)
    }

    /// Write the private key as PKCS#8 PEM, readable by the owner only.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let pem = self.to_pkcs8_pem()?;
        std::fs::write(path.as_ref(), pem.as_bytes())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path.as_ref(), std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    pub fn to_pkcs8_pem(&self) -> CryptoResult<Zeroizing<String>> {
        self.private
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }

    /// DER SubjectPublicKeyInfo of the public half.
    pub fn public_key_der(&self) -> &[u8] {
        &self.public_der
    }

    /// Public key in the form the registry expects.
    pub fn public_key_base64(&self) -> String {
        BASE64.encode(&self.public_der)
    }

    /// Locally computed fingerprint.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Unwrap a secret payload sealed to this key with `kem`.
    pub fn unwrap(&self, payload: &[u8], kem: Kem) -> CryptoResult<Zeroizing<Vec<u8>>> {
        envelope::open(&self.private, kem, payload)
    }
}

impl fmt::Debug for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceKey")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

/// Set of device keys addressable by fingerprint.
///
/// Each key is indexed by its local fingerprint. Fingerprints assigned by the
/// server at registration can be bound as aliases, since servers are free to
/// use a different fingerprint format. Aliases are held in memory only and
/// are not written by [`DeviceKey::save`].
#[derive(Debug, Clone, Default)]
pub struct Keyring {
    keys: Vec<DeviceKey>,
    index: HashMap<String, usize>,
    default: Option<usize>,
}

impl Keyring {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keyring holding a single default key.
    pub fn with_key(key: DeviceKey) -> Self {
        let mut keyring = Self::new();
        keyring.insert(key, true);
        keyring
    }

    /// Add a key. The first key added becomes the default.
    pub fn insert(&mut self, key: DeviceKey, make_default: bool) -> &DeviceKey {
        let position = self.keys.len();
        self.index.insert(key.fingerprint.clone(), position);
        self.keys.push(key);
        if make_default || self.default.is_none() {
            self.default = Some(position);
        }
        &self.keys[position]
    }

    /// Alias a server-assigned fingerprint to a key already in the ring.
    pub fn bind_fingerprint(&mut self, local: &str, remote: &str) -> CryptoResult<()> {
        let position = *self
            .index
            .get(local)
            .ok_or_else(|| CryptoError::UnknownFingerprint(local.to_string()))?;
        if local != remote {
            debug!("Binding server fingerprint {} to device key {}", remote, local);
        }
        self.index.insert(remote.to_string(), position);
        Ok(())
    }

    pub fn default_key(&self) -> Option<&DeviceKey> {
        self.default.map(|i| &self.keys[i])
    }

    /// Resolve the key for a fingerprint; `None` selects the default key.
    pub fn get(&self, fingerprint: Option<&str>) -> CryptoResult<&DeviceKey> {
        match fingerprint {
            Some(fp) => self
                .index
                .get(fp)
                .map(|&i| &self.keys[i])
                .ok_or_else(|| CryptoError::UnknownFingerprint(fp.to_string())),
            None => self
                .default_key()
                .ok_or_else(|| CryptoError::InvalidKey("keyring is empty".to_string())),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceKey> {
        self.keys.iter()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::OnceLock;

    static KEY_PEMS: OnceLock<Vec<String>> = OnceLock::new();

    /// Fixed set of generated test keys. Generation is slow, so it happens once per test binary.
    pub(crate) fn test_key(n: usize) -> DeviceKey {
        let pems = KEY_PEMS.get_or_init(|| {
            (0..2)
                .map(|_| {
                    DeviceKey::generate(DEFAULT_KEY_BITS)
                        .unwrap()
                        .to_pkcs8_pem()
                        .unwrap()
                        .to_string()
                })
                .collect()
        });
        DeviceKey::from_pem(&pems[n]).unwrap()
    }
}
