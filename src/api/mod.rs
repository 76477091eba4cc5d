//! REST client for the config server.
//!
//! Every call is a single request: nothing here retries, so the caller decides
//! whether to retry, prompt for re-authentication, or abort. Long-running use
//! from UI-adjacent code goes through [`ConfigServerClient::begin`], which runs
//! the call on a background task and hands back a cancellable
//! [`Operation`](crate::operation::Operation).

pub mod auth;
pub mod configs;
pub mod public_keys;
pub mod secrets;

pub use auth::{AccessToken, Authentication, TokenGrant};
pub use configs::{Attachment, ConfigRecord, SecretRef};
pub use public_keys::RemotePublicKey;
pub use secrets::{SecretEnvelope, SecretRetriever, PUBLIC_KEY_HEADER};

use reqwest::{Certificate, Client, Identity, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::config::{self, ClientSettings, Credential};
use crate::error::{Error, Result};
use crate::keys::Kem;
use crate::operation::Operation;

/// Client for one config server.
///
/// Cloning is cheap; clones share the connection pool.
#[derive(Clone)]
pub struct ConfigServerClient {
    http: Client,
    base_url: String,
    kem: Kem,
    send_kem: bool,
}

impl std::fmt::Debug for ConfigServerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigServerClient")
            .field("base_url", &self.base_url)
            .field("kem", &self.kem)
            .field("send_kem", &self.send_kem)
            .finish_non_exhaustive()
    }
}

impl ConfigServerClient {
    /// Create a client for `address` using the given settings
    pub fn new(address: &str, settings: &ClientSettings) -> Result<Self> {
        let base_url = address.trim().trim_end_matches('/').to_string();
        let parsed = Url::parse(&base_url)
            .map_err(|e| Error::invalid_config(format!("config server address {:?}: {}", address, e)))?;
        if parsed.scheme() != "https" && !settings.server.allow_insecure_http {
            return Err(Error::invalid_config(format!(
                "config server address {:?} is not https",
                address
            )));
        }

        let mut builder = Client::builder()
            .timeout(Duration::from_secs(settings.server.timeout_secs))
            .user_agent(settings.server.user_agent.as_str())
            .https_only(!settings.server.allow_insecure_http)
            .connection_verbose(settings.server.debug);

        if let Some(ca_file) = &settings.trust.ca_file {
            let pem = std::fs::read(ca_file)?;
            for certificate in Certificate::from_pem_bundle(&pem)? {
                builder = builder.add_root_certificate(certificate);
            }
            debug!("Added trust anchors from {}", ca_file.display());
        }

        match (&settings.trust.client_cert, &settings.trust.client_key) {
            (Some(cert), Some(key)) => {
                let cert = std::fs::read(cert)?;
                let key = zeroize::Zeroizing::new(std::fs::read(key)?);
                builder = builder.identity(Identity::from_pkcs8_pem(&cert, &key)?);
            }
            (None, None) => {}
            _ => {
                return Err(Error::invalid_config(
                    "trust.client_cert and trust.client_key must be set together",
                ))
            }
        }

        Ok(Self {
            http: builder.build()?,
            base_url,
            kem: settings.keys.kem()?,
            send_kem: settings.keys.send_kem,
        })
    }

    /// Create a client for the server named in a credential bundle
    pub fn for_credential(credential: &Credential, settings: &ClientSettings) -> Result<Self> {
        Self::new(&credential.address, settings)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Key-encryption method requested for secrets
    pub fn kem(&self) -> Kem {
        self.kem
    }

    /// Run a call on a background task.
    ///
    /// Starting never fails; every error arrives through the returned operation.
    pub fn begin<T, F, Fut>(&self, call: F) -> Operation<T>
    where
        F: FnOnce(ConfigServerClient) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        Operation::spawn(call(self.clone()))
    }

    pub(crate) fn url(&self, path: &str) -> String {
        config::endpoint(&self.base_url, path)
    }

    /// `{base}/api/v1/{collection}[/{id}]` with `id` escaped as one path segment
    pub(crate) fn resource_url(&self, collection: &str, id: Option<&str>) -> Result<Url> {
        let mut url = Url::parse(&self.url(&format!("/api/v1/{}", collection)))
            .map_err(|e| Error::InvalidRequest(e.to_string()))?;
        if let Some(id) = id {
            url.path_segments_mut()
                .map_err(|_| Error::InvalidRequest(format!("cannot address {}", collection)))?
                .push(id);
        }
        Ok(url)
    }

    /// Attach the bearer token, refusing tokens already known to be expired
    pub(crate) fn authorized(&self, request: RequestBuilder, token: &AccessToken) -> Result<RequestBuilder> {
        if token.is_expired() {
            return Err(Error::TokenExpired);
        }
        Ok(request.bearer_auth(token.as_str()))
    }

    /// Send a request and map non-2xx replies to the error taxonomy
    pub(crate) async fn execute(&self, request: RequestBuilder, what: &str) -> Result<Response> {
        let response = request.send().await.map_err(|e| {
            error!("{} request failed: {}", what, e);
            Error::Transport(e)
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        warn!("{} failed with status {}", what, status);
        Err(error_for_status(status, &body, what))
    }
}

/// Decode a JSON body, reporting schema violations as malformed responses
pub(crate) async fn read_json<T: DeserializeOwned>(response: Response, what: &str) -> Result<T> {
    let body = response.bytes().await?;
    serde_json::from_slice(&body).map_err(|e| Error::malformed(format!("{}: {}", what, e)))
}

/// Error body produced by the config server
#[derive(Deserialize, Default)]
struct ServerErrorBody {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

impl ServerErrorBody {
    fn token_expired(&self) -> bool {
        let data_name = self
            .data
            .as_ref()
            .and_then(|d| d.get("name"))
            .and_then(|n| n.as_str());
        data_name == Some("TokenExpiredError")
            || self.name.as_deref() == Some("TokenExpiredError")
            || self
                .message
                .as_deref()
                .map(|m| m.to_ascii_lowercase().contains("jwt expired"))
                .unwrap_or(false)
    }
}

fn error_for_status(status: StatusCode, body: &str, what: &str) -> Error {
    let parsed: ServerErrorBody = serde_json::from_str(body).unwrap_or_default();
    let detail = parsed
        .message
        .clone()
        .filter(|m| !m.is_empty())
        .or_else(|| {
            let trimmed = body.trim();
            (!trimmed.is_empty()).then(|| trimmed.chars().take(200).collect())
        })
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("no detail").to_string());

    match status {
        StatusCode::UNAUTHORIZED if parsed.token_expired() => Error::TokenExpired,
        StatusCode::UNAUTHORIZED => Error::Authentication(detail),
        StatusCode::NOT_FOUND => Error::NotFound(format!("{}: {}", what, detail)),
        s if s.is_client_error() => Error::Rejected {
            status: s.as_u16(),
            message: detail,
        },
        s => Error::Server {
            status: s.as_u16(),
            message: detail,
        },
    }
}

/// Ids arrive as JSON strings or numbers depending on the server's storage
pub(crate) fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Number(serde_json::Number),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Text(s) => s,
        Id::Number(n) => n.to_string(),
    })
}
