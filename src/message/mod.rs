//! Application messages on the wire.
//!
//! Write path: value → serialize → [`PayloadCryptor::encrypt`] →
//! [`MessageFramer::encode`]. The read path mirrors it. Both ends are
//! stateless per call and can be shared across threads.

pub mod cryptor;
pub mod framer;

pub use cryptor::{AesMode, Cipher, EncryptionSpec, KeyDerivation, Padding, PayloadCryptor, Prf, Salt};
pub use framer::{MessageFrame, MessageFramer};

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};

use crate::assembly::MergedConfiguration;
use crate::error::{Error, Result};

/// Conversion between an application value and payload bytes
pub trait MessageValue: Sized {
    fn to_payload(&self) -> Result<Vec<u8>>;
    fn from_payload(payload: Vec<u8>) -> Result<Self>;
}

impl MessageValue for Vec<u8> {
    fn to_payload(&self) -> Result<Vec<u8>> {
        Ok(self.clone())
    }

    fn from_payload(payload: Vec<u8>) -> Result<Self> {
        Ok(payload)
    }
}

impl MessageValue for Bytes {
    fn to_payload(&self) -> Result<Vec<u8>> {
        Ok(self.to_vec())
    }

    fn from_payload(payload: Vec<u8>) -> Result<Self> {
        Ok(Bytes::from(payload))
    }
}

impl MessageValue for String {
    fn to_payload(&self) -> Result<Vec<u8>> {
        Ok(self.as_bytes().to_vec())
    }

    fn from_payload(payload: Vec<u8>) -> Result<Self> {
        String::from_utf8(payload).map_err(|e| Error::invalid_message(format!("payload is not UTF-8: {}", e)))
    }
}

impl MessageValue for serde_json::Value {
    fn to_payload(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::invalid_message(format!("JSON payload: {}", e)))
    }

    fn from_payload(payload: Vec<u8>) -> Result<Self> {
        serde_json::from_slice(&payload).map_err(|e| Error::invalid_message(format!("JSON payload: {}", e)))
    }
}

/// A decoded message with its send time
#[derive(Debug, Clone, PartialEq)]
pub struct Message<T> {
    pub value: T,
    /// Epoch milliseconds as stamped by the sender
    pub timestamp: i64,
}

impl<T> Message<T> {
    pub fn new(value: T) -> Self {
        Self::at(value, now_millis())
    }

    pub fn at(value: T, timestamp: i64) -> Self {
        Self { value, timestamp }
    }

    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.timestamp).single()
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Serializes, encrypts and frames outgoing values
#[derive(Debug, Clone, Default)]
pub struct Marshaller {
    framer: MessageFramer,
    cryptor: PayloadCryptor,
}

impl Marshaller {
    pub fn new(cryptor: PayloadCryptor) -> Self {
        Self {
            framer: MessageFramer::new(),
            cryptor,
        }
    }

    /// Marshaller for `service` in a merged configuration
    pub fn from_config(merged: &MergedConfiguration, service: &str) -> Result<Self> {
        Ok(Self::new(PayloadCryptor::from_config(merged, service)?))
    }

    pub fn with_framer(mut self, framer: MessageFramer) -> Self {
        self.framer = framer;
        self
    }

    /// Frame `value` stamped with the current time
    pub fn marshal<T: MessageValue>(&self, value: &T) -> Result<Bytes> {
        self.marshal_message(value, now_millis())
    }

    pub fn marshal_message<T: MessageValue>(&self, value: &T, timestamp: i64) -> Result<Bytes> {
        let payload = value.to_payload()?;
        let payload = self.cryptor.encrypt(&payload)?;
        Ok(self.framer.encode(timestamp, &payload))
    }
}

/// Unframes, decrypts and deserializes incoming frames
#[derive(Debug, Clone, Default)]
pub struct Unmarshaller {
    framer: MessageFramer,
    cryptor: PayloadCryptor,
}

impl Unmarshaller {
    pub fn new(cryptor: PayloadCryptor) -> Self {
        Self {
            framer: MessageFramer::new(),
            cryptor,
        }
    }

    pub fn from_config(merged: &MergedConfiguration, service: &str) -> Result<Self> {
        Ok(Self::new(PayloadCryptor::from_config(merged, service)?))
    }

    pub fn with_framer(mut self, framer: MessageFramer) -> Self {
        self.framer = framer;
        self
    }

    pub fn unmarshal<T: MessageValue>(&self, frame: &[u8]) -> Result<Message<T>> {
        let frame = self.framer.decode(frame)?;
        let payload = self.cryptor.decrypt(&frame.payload)?;
        Ok(Message::at(T::from_payload(payload)?, frame.timestamp))
    }
}
