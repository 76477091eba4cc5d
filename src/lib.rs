pub mod api;
pub mod assembly;
pub mod config;
pub mod crypto;
pub mod error;
pub mod keys;
pub mod message;
pub mod operation;
pub mod session;
pub mod value;

pub use api::{AccessToken, ConfigServerClient, RemotePublicKey};
pub use assembly::{MergedConfiguration, SecretSource};
pub use config::{ClientSettings, Credential};
pub use error::{Error, Result};
pub use keys::{DeviceKey, Kem, Keyring};
pub use message::{Marshaller, Message, MessageFramer, MessageValue, PayloadCryptor, Unmarshaller};
pub use operation::{CancelHandle, Operation, Outcome};
pub use session::Session;
pub use value::ConfigValue;
