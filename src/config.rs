use chrono::{DateTime, NaiveDate, Utc};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};
use crate::keys::Kem;

/// Config-server connection settings
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Permit plain `http://` servers. Only meant for local stub servers.
    #[serde(default)]
    pub allow_insecure_http: bool,
    /// Verbose HTTP connection logging
    #[serde(default)]
    pub debug: bool,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_user_agent() -> String {
    format!("sinetstream-client/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
            allow_insecure_http: false,
            debug: false,
        }
    }
}

/// Caller-supplied trust material for self-signed or client-certificate deployments
#[derive(Debug, Deserialize, Clone, Default)]
pub struct TrustSettings {
    /// PEM bundle of additional root certificates
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
    /// PEM client certificate chain
    #[serde(default)]
    pub client_cert: Option<PathBuf>,
    /// PKCS#8 PEM key for `client_cert`
    #[serde(default)]
    pub client_key: Option<PathBuf>,
}

/// Device key settings
#[derive(Debug, Deserialize, Clone)]
pub struct KeySettings {
    /// PEM private key used to unwrap secrets
    #[serde(default)]
    pub private_key: Option<PathBuf>,
    /// Key-encryption method requested for secrets
    #[serde(default = "default_kem")]
    pub kem: String,
    /// Append `?kem=` to secret requests
    #[serde(default)]
    pub send_kem: bool,
}

fn default_kem() -> String {
    Kem::default().name().to_string()
}

impl Default for KeySettings {
    fn default() -> Self {
        Self {
            private_key: None,
            kem: default_kem(),
            send_kem: false,
        }
    }
}

impl KeySettings {
    pub fn kem(&self) -> Result<Kem> {
        self.kem
            .parse()
            .map_err(|e| Error::invalid_config(format!("keys.kem: {}", e)))
    }
}

/// Root client settings
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ClientSettings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub trust: TrustSettings,
    #[serde(default)]
    pub keys: KeySettings,
    /// Location of the credential bundle (`auth.json`)
    #[serde(default)]
    pub credential_path: Option<PathBuf>,
}

impl ClientSettings {
    /// Load settings from files and environment variables
    pub fn load() -> Result<Self> {
        Self::load_from(None::<&Path>)
    }

    /// Like [`ClientSettings::load`], with an extra file layered on top of the defaults
    pub fn load_from(path: Option<impl AsRef<Path>>) -> Result<Self> {
        let mut builder = Config::builder()
            // Start with default config file
            .add_source(File::with_name("config/default").required(false))
            // Override with local config if present
            .add_source(File::with_name("config/local").required(false));

        if let Some(path) = path {
            builder = builder.add_source(File::from(path.as_ref()).required(true));
        }

        let config = builder
            // Override with environment variables (prefix: SINETSTREAM_)
            // e.g., SINETSTREAM_SERVER__TIMEOUT_SECS, SINETSTREAM_KEYS__KEM
            .add_source(
                Environment::with_prefix("SINETSTREAM")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Credential bundle path, falling back to the per-user default
    pub fn credential_path(&self) -> Option<PathBuf> {
        self.credential_path.clone().or_else(Credential::default_path)
    }
}

#[derive(Deserialize)]
struct CredentialFile {
    #[serde(rename = "config-server")]
    config_server: CredentialEntry,
}

#[derive(Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "kebab-case")]
struct CredentialEntry {
    address: String,
    user: String,
    secret_key: String,
    #[serde(default)]
    expiration_date: Option<String>,
}

/// Long-lived API credential for the config server.
///
/// This is the only state expected to persist on the device; it is imported
/// once and exchanged for short-lived access tokens.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Credential {
    pub address: String,
    pub user: String,
    secret_key: String,
    #[zeroize(skip)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn new(address: impl Into<String>, user: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            user: user.into(),
            secret_key: secret_key.into(),
            expires_at: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Parse an `auth.json` document
    pub fn from_json(json: &str) -> Result<Self> {
        let file: CredentialFile = serde_json::from_str(json)
            .map_err(|e| Error::invalid_config(format!("credential bundle: {}", e)))?;
        let entry = file.config_server;

        let expires_at = entry
            .expiration_date
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .map(parse_expiration)
            .transpose()?;

        let mut credential = Self::new(entry.address.as_str(), entry.user.as_str(), entry.secret_key.as_str());
        credential.expires_at = expires_at;
        Ok(credential)
    }

    /// Load an `auth.json` file from disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = zeroize::Zeroizing::new(std::fs::read_to_string(path)?);
        Self::from_json(&json)
    }

    /// `<config dir>/sinetstream/auth.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("sinetstream").join("auth.json"))
    }

    pub fn secret_key(&self) -> &str {
        &self.secret_key
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }

    /// Fail with the distinct expired signal so the caller can prompt for renewal
    pub fn ensure_valid(&self) -> Result<()> {
        match self.expires_at {
            Some(at) if self.is_expired_at(Utc::now()) => Err(Error::CredentialExpired(at)),
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("address", &self.address)
            .field("user", &self.user)
            .field("secret_key", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// RFC 3339 timestamp or a bare date (expiring at the end of that day, UTC)
fn parse_expiration(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Ok(at.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(23, 59, 59))
        .map(|at| at.and_utc())
        .ok_or_else(|| Error::invalid_config(format!("unrecognised expiration-date {:?}", raw)))
}

/// Join a base URL and an API path with exactly one slash
pub(crate) fn endpoint(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    format!("{}/{}", base, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_endpoint() {
        assert_eq!(endpoint("https://cs.example.org/", "/api/v1/auth"), "https://cs.example.org/api/v1/auth");
        assert_eq!(endpoint("https://cs.example.org", "api/v1/auth"), "https://cs.example.org/api/v1/auth");
    }

    #[test]
    fn test_credential_from_json() {
        let credential = Credential::from_json(
            r#"{"config-server": {
                "address": "https://cs.example.org",
                "user": "mqtt",
                "secret-key": "s3cr3t",
                "expiration-date": "2030-01-31T00:00:00Z"
            }}"#,
        )
        .unwrap();

        assert_eq!(credential.address, "https://cs.example.org");
        assert_eq!(credential.user, "mqtt");
        assert_eq!(credential.secret_key(), "s3cr3t");
        assert_eq!(
            credential.expires_at,
            Some(Utc.with_ymd_and_hms(2030, 1, 31, 0, 0, 0).unwrap())
        );
        assert!(!format!("{:?}", credential).contains("s3cr3t"));
    }

    #[test]
    fn test_credential_bare_date_and_missing_expiry() {
        let dated = Credential::from_json(
            r#"{"config-server": {"address": "a", "user": "u", "secret-key": "k", "expiration-date": "2020-05-01"}}"#,
        )
        .unwrap();
        assert_eq!(
            dated.expires_at,
            Some(Utc.with_ymd_and_hms(2020, 5, 1, 23, 59, 59).unwrap())
        );

        let open = Credential::from_json(r#"{"config-server": {"address": "a", "user": "u", "secret-key": "k"}}"#)
            .unwrap();
        assert!(open.expires_at.is_none());
        assert!(open.ensure_valid().is_ok());
    }

    #[test]
    fn test_credential_rejects_bad_bundle() {
        assert!(matches!(
            Credential::from_json(r#"{"config-server": {"address": "a"}}"#),
            Err(Error::InvalidConfiguration(_))
        ));
        assert!(matches!(
            Credential::from_json(
                r#"{"config-server": {"address": "a", "user": "u", "secret-key": "k", "expiration-date": "soon"}}"#
            ),
            Err(Error::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_expired_credential_is_distinct() {
        let expired = Credential::new("a", "u", "k").with_expiry(Utc::now() - Duration::days(1));
        let err = expired.ensure_valid().unwrap_err();
        assert!(matches!(err, Error::CredentialExpired(_)));
        assert!(err.is_expired());

        let fresh = Credential::new("a", "u", "k").with_expiry(Utc::now() + Duration::days(1));
        assert!(fresh.ensure_valid().is_ok());
    }

    #[test]
    fn test_settings_defaults() {
        let settings = ClientSettings::default();
        assert_eq!(settings.server.timeout_secs, 30);
        assert!(!settings.server.allow_insecure_http);
        assert_eq!(settings.keys.kem().unwrap(), Kem::RsaOaepSha1);
        assert!(!settings.keys.send_kem);
    }

    #[test]
    fn test_invalid_kem_setting() {
        let keys = KeySettings {
            kem: "RSA-PKCS1".to_string(),
            ..KeySettings::default()
        };
        assert!(matches!(keys.kem(), Err(Error::InvalidConfiguration(_))));
    }
}
