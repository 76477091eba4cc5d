//! Token exchange: long-lived API credential → short-lived bearer token.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::{read_json, ConfigServerClient};
use crate::config::Credential;
use crate::error::{Error, Result};
use crate::value::ConfigValue;

/// Authentication strategy the config server uses for API credentials
pub const AUTH_STRATEGY: &str = "api-access";

#[derive(Serialize)]
struct AuthRequest<'a> {
    strategy: &'a str,
    user: &'a str,
    #[serde(rename = "secret-key")]
    secret_key: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthResponse {
    access_token: String,
    authentication: serde_json::Value,
    user: serde_json::Value,
}

/// Bearer token attached to every authenticated call.
///
/// Held in memory only and zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct AccessToken {
    token: String,
    #[zeroize(skip)]
    expires_at: Option<DateTime<Utc>>,
}

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            expires_at: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn as_str(&self) -> &str {
        &self.token
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// What the server reported about the authentication it performed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Authentication {
    pub strategy: Option<String>,
    pub issued_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Authentication {
    fn from_json(value: &serde_json::Value) -> Result<Self> {
        if !value.is_object() {
            return Err(Error::malformed("token response: `authentication` is not an object"));
        }
        let payload = value.get("payload");
        let epoch = |field: &str| {
            payload
                .and_then(|p| p.get(field))
                .and_then(|v| v.as_i64())
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        };

        Ok(Self {
            strategy: value
                .get("strategy")
                .and_then(|s| s.as_str())
                .map(str::to_string),
            issued_at: epoch("iat"),
            expires_at: epoch("exp"),
        })
    }
}

/// Successful token exchange
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: AccessToken,
    pub authentication: Authentication,
    pub user: ConfigValue,
}

impl ConfigServerClient {
    /// Exchange the credential for an access token (`POST /api/v1/auth`)
    pub async fn get_access_token(&self, credential: &Credential) -> Result<TokenGrant> {
        credential.ensure_valid()?;

        let url = self.url("/api/v1/auth");
        debug!("Requesting access token for user {} at {}", credential.user, url);

        let request = AuthRequest {
            strategy: AUTH_STRATEGY,
            user: &credential.user,
            secret_key: credential.secret_key(),
        };
        let response = self
            .execute(self.http.post(&url).json(&request), "token exchange")
            .await?;
        let body: AuthResponse = read_json(response, "token response").await?;

        if body.access_token.is_empty() {
            return Err(Error::malformed("token response: empty `accessToken`"));
        }
        let authentication = Authentication::from_json(&body.authentication)?;

        let mut access_token = AccessToken::new(body.access_token);
        if let Some(at) = authentication.expires_at {
            access_token = access_token.with_expiry(at);
        }
        info!(
            "Obtained access token for {} (expires: {})",
            credential.user,
            access_token
                .expires_at()
                .map(|at| at.to_rfc3339())
                .unwrap_or_else(|| "unspecified".to_string())
        );

        Ok(TokenGrant {
            access_token,
            authentication,
            user: ConfigValue::from(body.user),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn test_auth_request_serialization() {
        let request = AuthRequest {
            strategy: AUTH_STRATEGY,
            user: "mqtt",
            secret_key: "s3cr3t",
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            json!({"strategy": "api-access", "user": "mqtt", "secret-key": "s3cr3t"})
        );
    }

    #[test]
    fn test_authentication_payload_times() {
        let auth = Authentication::from_json(&json!({
            "strategy": "api-access",
            "accessToken": "abc",
            "payload": {"iat": 1_700_000_000, "exp": 1_700_086_400}
        }))
        .unwrap();
        assert_eq!(auth.strategy.as_deref(), Some("api-access"));
        assert_eq!(auth.issued_at.unwrap().timestamp(), 1_700_000_000);
        assert_eq!(auth.expires_at.unwrap().timestamp(), 1_700_086_400);

        let empty = Authentication::from_json(&json!({})).unwrap();
        assert_eq!(empty, Authentication::default());

        assert!(Authentication::from_json(&json!("nope")).is_err());
    }

    #[test]
    fn test_access_token_expiry_and_redaction() {
        let token = AccessToken::new("abc");
        assert!(!token.is_expired());
        assert_eq!(token.as_str(), "abc");
        assert!(!format!("{:?}", token).contains("abc"));

        let stale = AccessToken::new("abc").with_expiry(Utc::now() - Duration::seconds(1));
        assert!(stale.is_expired());
    }
}
