//! Data-stream configurations (`/api/v1/configs`).

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info};

use super::{read_json, string_or_number, AccessToken, ConfigServerClient, SecretRetriever};
use crate::assembly::{self, MergedConfiguration};
use crate::error::{Error, Result};
use crate::keys::Keyring;
use crate::value::ConfigValue;

const REQUIRED_FIELDS: [&str; 4] = ["name", "config", "attachments", "secrets"];

/// Binary value placed at `target` in the merged configuration
#[derive(Clone, PartialEq, Eq)]
pub struct Attachment {
    pub target: String,
    pub value: Vec<u8>,
}

impl fmt::Debug for Attachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attachment")
            .field("target", &self.target)
            .field("value", &format_args!("<{} bytes>", self.value.len()))
            .finish()
    }
}

/// Reference to a secret that must be fetched and unwrapped separately
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SecretRef {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub target: String,
    #[serde(default)]
    pub fingerprint: Option<String>,
}

/// Configuration as served, before secrets are merged in
#[derive(Debug, Clone)]
pub struct ConfigRecord {
    pub name: String,
    pub config: BTreeMap<String, ConfigValue>,
    pub attachments: Vec<Attachment>,
    pub secrets: Vec<SecretRef>,
}

#[derive(Deserialize)]
struct WireAttachment {
    target: String,
    value: String,
}

#[derive(Deserialize)]
struct WireConfigRecord {
    name: String,
    config: serde_json::Value,
    attachments: Vec<WireAttachment>,
    secrets: Vec<SecretRef>,
}

impl ConfigRecord {
    /// Validate a response body against the fixed field list.
    ///
    /// A missing field is an invalid configuration, never a partial record.
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| Error::invalid_config("config record is not a JSON object"))?;
        if let Some(missing) = REQUIRED_FIELDS.iter().find(|field| !object.contains_key(**field)) {
            return Err(Error::invalid_config(format!("config record is missing `{}`", missing)));
        }

        let wire: WireConfigRecord =
            serde_json::from_value(value).map_err(|e| Error::malformed(format!("config record: {}", e)))?;

        let config = match ConfigValue::from(wire.config) {
            ConfigValue::Object(map) => map,
            other => {
                return Err(Error::invalid_config(format!(
                    "config record `config` must be an object, got {}",
                    other.type_name()
                )))
            }
        };

        let attachments = wire
            .attachments
            .into_iter()
            .map(|a| {
                let value = BASE64
                    .decode(a.value.trim())
                    .map_err(|e| Error::malformed(format!("attachment {}: {}", a.target, e)))?;
                Ok(Attachment { target: a.target, value })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            name: wire.name,
            config,
            attachments,
            secrets: wire.secrets,
        })
    }
}

/// Listing entries are bare names or objects carrying a name
#[derive(Deserialize)]
#[serde(untagged)]
enum ConfigName {
    Bare(String),
    Entry { name: String },
}

impl ConfigServerClient {
    /// Names of the data streams visible to the account
    pub async fn list_configs(&self, token: &AccessToken) -> Result<Vec<String>> {
        let url = self.resource_url("configs", None)?;
        let builder = self.authorized(self.http.get(url), token)?;
        let response = self.execute(builder, "config listing").await?;
        let names: Vec<ConfigName> = read_json(response, "config listing").await?;

        Ok(names
            .into_iter()
            .map(|n| match n {
                ConfigName::Bare(name) | ConfigName::Entry { name } => name,
            })
            .collect())
    }

    /// Fetch one configuration record without resolving its secrets
    pub async fn get_config(&self, token: &AccessToken, name: &str) -> Result<ConfigRecord> {
        let url = self.resource_url("configs", Some(name))?;
        let builder = self.authorized(self.http.get(url), token)?;
        let response = self.execute(builder, "config retrieval").await?;
        let body: serde_json::Value = read_json(response, "config record").await?;

        let record = ConfigRecord::from_json(body)?;
        debug!(
            "Config {} has {} parameters, {} attachments, {} secrets",
            record.name,
            record.config.len(),
            record.attachments.len(),
            record.secrets.len()
        );
        Ok(record)
    }

    /// Fetch a configuration and merge its attachments and unwrapped secrets
    pub async fn fetch_configuration(
        &self,
        token: &AccessToken,
        name: &str,
        keyring: &Keyring,
    ) -> Result<MergedConfiguration> {
        let record = self.get_config(token, name).await?;
        let retriever = SecretRetriever::new(self, token);
        let merged = assembly::assemble(&record, &retriever, keyring, self.kem).await?;
        info!("Assembled configuration {} ({} entries)", name, merged.len());
        Ok(merged)
    }
}
