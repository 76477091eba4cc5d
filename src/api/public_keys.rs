//! Registry of device public keys (`/api/v1/public-keys`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{read_json, AccessToken, ConfigServerClient};
use crate::error::{Error, Result};
use crate::keys;

/// Public key as registered on the server
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemotePublicKey {
    pub id: i64,
    pub fingerprint: String,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(rename = "defaultKey", default)]
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterRequest<'a> {
    public_key: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    comment: Option<&'a str>,
    default_key: bool,
}

/// Listing bodies come back bare or paginated depending on server settings
#[derive(Deserialize)]
#[serde(untagged)]
enum KeyList {
    Plain(Vec<RemotePublicKey>),
    Paged { data: Vec<RemotePublicKey> },
}

impl From<KeyList> for Vec<RemotePublicKey> {
    fn from(list: KeyList) -> Self {
        match list {
            KeyList::Plain(keys) | KeyList::Paged { data: keys } => keys,
        }
    }
}

impl ConfigServerClient {
    /// Register a base64 DER public key
    pub async fn register_public_key(
        &self,
        token: &AccessToken,
        public_key_base64: &str,
        comment: Option<&str>,
        is_default: bool,
    ) -> Result<RemotePublicKey> {
        keys::parse_public_key_base64(public_key_base64)
            .map_err(|e| Error::InvalidRequest(format!("public key: {}", e)))?;

        let url = self.resource_url("public-keys", None)?;
        let request = RegisterRequest {
            public_key: public_key_base64.trim(),
            comment,
            default_key: is_default,
        };
        let builder = self.authorized(self.http.post(url).json(&request), token)?;
        let response = self.execute(builder, "public key registration").await?;
        let key: RemotePublicKey = read_json(response, "public key record").await?;

        info!("Registered public key {} ({})", key.id, key.fingerprint);
        Ok(key)
    }

    /// Every key registered for the account
    pub async fn list_public_keys(&self, token: &AccessToken) -> Result<Vec<RemotePublicKey>> {
        let url = self.resource_url("public-keys", None)?;
        let builder = self.authorized(self.http.get(url), token)?;
        let response = self.execute(builder, "public key listing").await?;
        let list: KeyList = read_json(response, "public key listing").await?;

        let keys: Vec<RemotePublicKey> = list.into();
        debug!("Server holds {} public keys", keys.len());
        Ok(keys)
    }

    /// One key by server-assigned id
    pub async fn get_public_key(&self, token: &AccessToken, id: i64) -> Result<RemotePublicKey> {
        let url = self.resource_url("public-keys", Some(&id.to_string()))?;
        let builder = self.authorized(self.http.get(url), token)?;
        let response = self.execute(builder, "public key lookup").await?;
        read_json(response, "public key record").await
    }

    /// Delete one key, or every key for the account when `id` is `None`
    pub async fn delete_public_keys(&self, token: &AccessToken, id: Option<i64>) -> Result<()> {
        let id = id.map(|id| id.to_string());
        let url = self.resource_url("public-keys", id.as_deref())?;
        let builder = self.authorized(self.http.delete(url), token)?;
        self.execute(builder, "public key deletion").await?;

        match id {
            Some(id) => info!("Deleted public key {}", id),
            None => info!("Deleted all public keys"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: i64) -> serde_json::Value {
        json!({
            "id": id,
            "fingerprint": format!("SHA256:key{}", id),
            "comment": null,
            "defaultKey": id == 1,
            "createdAt": "2024-04-01T09:00:00.000Z",
            "updatedAt": "2024-04-01T09:00:00.000Z"
        })
    }

    #[test]
    fn test_remote_key_deserialization() {
        let key: RemotePublicKey = serde_json::from_value(record(1)).unwrap();
        assert_eq!(key.id, 1);
        assert!(key.is_default);
        assert!(key.comment.is_none());
        assert_eq!(key.created_at.timestamp(), 1_711_962_000);
    }

    #[test]
    fn test_key_list_shapes() {
        let plain: KeyList = serde_json::from_value(json!([record(1), record(2)])).unwrap();
        assert_eq!(Vec::<RemotePublicKey>::from(plain).len(), 2);

        let paged: KeyList =
            serde_json::from_value(json!({"total": 1, "limit": 10, "skip": 0, "data": [record(3)]})).unwrap();
        let keys: Vec<RemotePublicKey> = paged.into();
        assert_eq!(keys[0].id, 3);
    }

    #[test]
    fn test_register_request_omits_empty_comment() {
        let request = RegisterRequest {
            public_key: "AAAA",
            comment: None,
            default_key: true,
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"publicKey": "AAAA", "defaultKey": true})
        );
    }
}
