//! One provisioning session: credential → access token → merged configuration.
//!
//! The session exclusively owns the token and the configuration it downloads.
//! Neither is persisted; closing or dropping the session wipes them.

use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::api::{AccessToken, ConfigServerClient, RemotePublicKey, TokenGrant};
use crate::assembly::MergedConfiguration;
use crate::config::{ClientSettings, Credential};
use crate::error::{Error, Result};
use crate::keys::{DeviceKey, Keyring};
use crate::message::{EncryptionSpec, Marshaller, Unmarshaller};
use crate::operation::Operation;

pub struct Session {
    client: ConfigServerClient,
    credential: Credential,
    keyring: Arc<Keyring>,
    token: Option<AccessToken>,
    configuration: Option<MergedConfiguration>,
}

impl Session {
    pub fn new(client: ConfigServerClient, credential: Credential, keyring: Keyring) -> Self {
        Self {
            client,
            credential,
            keyring: Arc::new(keyring),
            token: None,
            configuration: None,
        }
    }

    /// Build a session from settings: credential bundle, device key and server address
    pub fn open(settings: &ClientSettings) -> Result<Self> {
        let path = settings
            .credential_path()
            .ok_or_else(|| Error::invalid_config("no credential bundle location configured"))?;
        let credential = Credential::load(&path)?;
        debug!("Loaded credential for {} from {}", credential.user, path.display());

        let mut keyring = Keyring::new();
        match &settings.keys.private_key {
            Some(key_path) => {
                keyring.insert(DeviceKey::load(key_path)?, true);
            }
            None => warn!("No device key configured; secrets cannot be unwrapped"),
        }

        let client = ConfigServerClient::for_credential(&credential, settings)?;
        Ok(Self::new(client, credential, keyring))
    }

    pub fn client(&self) -> &ConfigServerClient {
        &self.client
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn keyring(&self) -> &Keyring {
        &self.keyring
    }

    pub fn add_key(&mut self, key: DeviceKey, make_default: bool) {
        Arc::make_mut(&mut self.keyring).insert(key, make_default);
    }

    pub fn token(&self) -> Option<&AccessToken> {
        self.token.as_ref()
    }

    pub fn set_token(&mut self, token: AccessToken) {
        self.token = Some(token);
    }

    fn current_token(&self) -> Result<&AccessToken> {
        match &self.token {
            Some(token) if token.is_expired() => Err(Error::TokenExpired),
            Some(token) => Ok(token),
            None => Err(Error::Authentication("not logged in".to_string())),
        }
    }

    /// Exchange the credential for a fresh access token
    pub async fn login(&mut self) -> Result<&AccessToken> {
        let grant = self.client.get_access_token(&self.credential).await?;
        Ok(self.token.insert(grant.access_token))
    }

    /// Register the default device key and bind the server's fingerprint to it.
    ///
    /// The binding lives in this session's keyring only. A later process that
    /// loads the same key resolves secrets by the local `SHA256:` fingerprint,
    /// so against a server using another fingerprint format the registration
    /// has to be repeated (or [`Keyring::bind_fingerprint`] called) before
    /// downloading.
    pub async fn register_device_key(&mut self, comment: Option<&str>, is_default: bool) -> Result<RemotePublicKey> {
        let key = self
            .keyring
            .default_key()
            .ok_or_else(|| Error::invalid_config("no device key to register"))?;
        let local = key.fingerprint().to_string();
        let public_key = key.public_key_base64();

        let token = self.current_token()?;
        let remote = self
            .client
            .register_public_key(token, &public_key, comment, is_default)
            .await?;

        Arc::make_mut(&mut self.keyring).bind_fingerprint(&local, &remote.fingerprint)?;
        Ok(remote)
    }

    /// Download and assemble a configuration, replacing any held one
    pub async fn download(&mut self, name: &str) -> Result<&MergedConfiguration> {
        let token = self.current_token()?;
        let merged = self
            .client
            .fetch_configuration(token, name, &self.keyring)
            .await?;
        Ok(self.install_configuration(merged))
    }

    /// Token exchange on a background task
    pub fn begin_login(&self) -> Operation<TokenGrant> {
        let credential = self.credential.clone();
        self.client
            .begin(move |client| async move { client.get_access_token(&credential).await })
    }

    /// Configuration download on a background task.
    ///
    /// Install the result with [`Session::install_configuration`].
    pub fn begin_download(&self, name: &str) -> Operation<MergedConfiguration> {
        let token = self.current_token().cloned();
        let keyring = Arc::clone(&self.keyring);
        let name = name.to_string();
        self.client.begin(move |client| async move {
            let token = token?;
            client.fetch_configuration(&token, &name, &keyring).await
        })
    }

    pub fn install_configuration(&mut self, merged: MergedConfiguration) -> &MergedConfiguration {
        if let Some(previous) = &self.configuration {
            debug!("Replacing configuration {}", previous.name());
        }
        info!("Session holds configuration {}", merged.name());
        self.configuration.insert(merged)
    }

    pub fn configuration(&self) -> Option<&MergedConfiguration> {
        self.configuration.as_ref()
    }

    fn require_configuration(&self) -> Result<&MergedConfiguration> {
        self.configuration
            .as_ref()
            .ok_or_else(|| Error::invalid_config("no configuration downloaded"))
    }

    /// Payload encryption parameters for `service`, if it enables encryption
    pub fn encryption_spec(&self, service: &str) -> Result<Option<EncryptionSpec>> {
        EncryptionSpec::from_config(self.require_configuration()?, service)
    }

    pub fn marshaller(&self, service: &str) -> Result<Marshaller> {
        Marshaller::from_config(self.require_configuration()?, service)
    }

    pub fn unmarshaller(&self, service: &str) -> Result<Unmarshaller> {
        Unmarshaller::from_config(self.require_configuration()?, service)
    }

    /// Forget the token and wipe the configuration
    pub fn close(&mut self) {
        self.token = None;
        self.configuration = None;
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("server", &self.client.base_url())
            .field("user", &self.credential.user)
            .field("keys", &self.keyring.len())
            .field("logged_in", &self.token.is_some())
            .field("configuration", &self.configuration.as_ref().map(|c| c.name()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::testing::test_key;
    use crate::value::ConfigValue;
    use chrono::{Duration, Utc};

    fn session() -> Session {
        let mut settings = ClientSettings::default();
        settings.server.allow_insecure_http = true;
        let credential = Credential::new("http://127.0.0.1:9", "mqtt", "s3cr3t");
        let client = ConfigServerClient::for_credential(&credential, &settings).unwrap();
        Session::new(client, credential, Keyring::with_key(test_key(0)))
    }

    #[tokio::test]
    async fn test_calls_require_login() {
        let mut session = session();
        assert!(matches!(session.download("service-1").await, Err(Error::Authentication(_))));

        session.set_token(AccessToken::new("abc").with_expiry(Utc::now() - Duration::seconds(5)));
        assert!(matches!(session.download("service-1").await, Err(Error::TokenExpired)));
        assert!(matches!(
            session.begin_download("service-1").await.into_result(),
            Err(Error::TokenExpired)
        ));
    }

    #[test]
    fn test_message_helpers_need_configuration() {
        let mut session = session();
        assert!(matches!(session.marshaller("service-1"), Err(Error::InvalidConfiguration(_))));

        let mut merged = MergedConfiguration::new("service-1");
        merged.insert("service-1.type", ConfigValue::from("mqtt"));
        session.install_configuration(merged);
        assert!(session.encryption_spec("service-1").unwrap().is_none());
        assert!(session.marshaller("service-1").unwrap().marshal(&b"x".to_vec()).is_ok());

        session.close();
        assert!(session.configuration().is_none());
        assert!(session.token().is_none());
    }

    #[test]
    fn test_begin_calls_without_runtime_fail_through_outcome() {
        let mut session = session();
        session.set_token(AccessToken::new("abc"));

        let login = session.begin_login();
        let download = session.begin_download("service-1");
        assert!(login.is_finished());
        assert!(download.is_finished());

        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        assert!(matches!(
            runtime.block_on(login.wait()),
            crate::operation::Outcome::Failed(Error::Internal(_))
        ));
        assert!(matches!(
            runtime.block_on(download.wait()).into_result(),
            Err(Error::Internal(_))
        ));
    }

    #[test]
    fn test_debug_hides_credential() {
        let rendered = format!("{:?}", session());
        assert!(rendered.contains("mqtt"));
        assert!(!rendered.contains("s3cr3t"));
    }
}
