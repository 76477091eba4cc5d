use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::crypto::CryptoError;

/// Client-wide error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Credential expired at {0}")]
    CredentialExpired(DateTime<Utc>),

    #[error("Access token expired")]
    TokenExpired,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Cryptographic failure: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn malformed<S: Into<String>>(msg: S) -> Self {
        Self::MalformedResponse(msg.into())
    }

    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    pub fn invalid_message<S: Into<String>>(msg: S) -> Self {
        Self::InvalidMessage(msg.into())
    }

    /// True when the caller should renew a credential or token rather than retry.
    pub fn is_expired(&self) -> bool {
        matches!(self, Self::CredentialExpired(_) | Self::TokenExpired)
    }

    /// Transport failures and 5xx replies may succeed on a later attempt.
    /// Nothing in this crate retries on its own.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect(),
            Self::Io(_) => true,
            Self::Server { .. } => true,
            _ => false,
        }
    }
}

/// Result type alias using Error
pub type Result<T> = std::result::Result<T, Error>;
