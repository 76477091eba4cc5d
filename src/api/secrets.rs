use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::Deserialize;
use tracing::debug;

use super::{read_json, string_or_number, AccessToken, ConfigServerClient, SecretRef};
use crate::assembly::SecretSource;
use crate::error::{Error, Result};

/// Header telling the server which public key to wrap the secret for
pub const PUBLIC_KEY_HEADER: &str = "SINETStream-config-publickey";

/// One secret as served: ciphertext wrapped to a single public key
#[derive(Debug, Clone, Deserialize)]
pub struct SecretEnvelope {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    /// Base64 of the wrapped payload
    pub value: String,
    /// Fingerprint of the key the payload is wrapped to
    #[serde(default)]
    pub fingerprint: Option<String>,
}

impl SecretEnvelope {
    pub fn new(id: impl Into<String>, value: impl Into<String>, fingerprint: Option<String>) -> Self {
        Self {
            id: id.into(),
            value: value.into(),
            fingerprint,
        }
    }

    /// Decoded wrapped payload
    pub fn ciphertext(&self) -> Result<Vec<u8>> {
        BASE64
            .decode(self.value.trim())
            .map_err(|e| Error::malformed(format!("secret {}: {}", self.id, e)))
    }
}

impl ConfigServerClient {
    /// Fetch one secret wrapped to `fingerprint`, or to the default key when `None`
    pub async fn get_secret(
        &self,
        token: &AccessToken,
        secret_id: &str,
        fingerprint: Option<&str>,
    ) -> Result<SecretEnvelope> {
        let mut url = self.resource_url("secrets", Some(secret_id))?;
        if self.send_kem {
            url.query_pairs_mut().append_pair("kem", &self.kem.query_value());
        }

        let mut builder = self.http.get(url);
        if let Some(fingerprint) = fingerprint {
            builder = builder.header(PUBLIC_KEY_HEADER, fingerprint);
        }
        let builder = self.authorized(builder, token)?;
        let response = self.execute(builder, "secret retrieval").await?;
        let envelope: SecretEnvelope = read_json(response, "secret").await?;

        debug!(
            "Retrieved secret {} wrapped for {}",
            envelope.id,
            envelope.fingerprint.as_deref().or(fingerprint).unwrap_or("default key")
        );
        Ok(envelope)
    }
}

/// Secret source backed by the config server, bound to one access token
#[derive(Debug, Clone, Copy)]
pub struct SecretRetriever<'a> {
    client: &'a ConfigServerClient,
    token: &'a AccessToken,
}

impl<'a> SecretRetriever<'a> {
    pub fn new(client: &'a ConfigServerClient, token: &'a AccessToken) -> Self {
        Self { client, token }
    }
}

#[async_trait]
impl SecretSource for SecretRetriever<'_> {
    async fn fetch_secret(&self, reference: &SecretRef) -> Result<SecretEnvelope> {
        self.client
            .get_secret(self.token, &reference.id, reference.fingerprint.as_deref())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_decodes_value() {
        let envelope: SecretEnvelope =
            serde_json::from_str(r#"{"id": 7, "value": "AAEC", "fingerprint": "SHA256:x"}"#).unwrap();
        assert_eq!(envelope.id, "7");
        assert_eq!(envelope.ciphertext().unwrap(), vec![0, 1, 2]);
        assert_eq!(envelope.fingerprint.as_deref(), Some("SHA256:x"));
    }

    #[test]
    fn test_envelope_bad_base64_is_malformed() {
        let envelope = SecretEnvelope::new("s1", "***", None);
        assert!(matches!(envelope.ciphertext(), Err(Error::MalformedResponse(_))));
    }

    #[test]
    fn test_envelope_requires_value() {
        assert!(serde_json::from_str::<SecretEnvelope>(r#"{"id": "s1"}"#).is_err());
    }
}
