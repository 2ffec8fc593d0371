//! Error types for the key store and relay

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::KeyId;

#[derive(Error, Debug)]
pub enum KeyStoreError {
    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("No key available: {0}")]
    Exhausted(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),

    /// Both ends produced a key under the same id but the bytes differ
    #[error("Key {key_id} does not match the peer's copy")]
    KeyMismatch { key_id: KeyId },

    #[error("Backing store error: {0}")]
    BackingStore(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Config error: {0}")]
    ConfigError(#[from] toml::de::Error),

    #[cfg(feature = "sqlite")]
    #[error("SQLite error: {0}")]
    SqliteError(#[from] rusqlite::Error),
}

/// Transport-neutral status carried alongside a failed remote call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    NotFound,
    ResourceExhausted,
    AlreadyExists,
    InvalidArgument,
    Unavailable,
    Internal,
    Aborted,
}

impl KeyStoreError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            KeyStoreError::NotFound(_) => StatusCode::NotFound,
            KeyStoreError::Exhausted(_) => StatusCode::ResourceExhausted,
            KeyStoreError::AlreadyExists(_) => StatusCode::AlreadyExists,
            KeyStoreError::InvalidArgument(_) | KeyStoreError::ConfigError(_) => {
                StatusCode::InvalidArgument
            }
            KeyStoreError::Unavailable(_) => StatusCode::Unavailable,
            KeyStoreError::KeyMismatch { .. } => StatusCode::Aborted,
            _ => StatusCode::Internal,
        }
    }

    /// Rebuild an error on the receiving side of a transport
    pub fn from_status(code: StatusCode, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            StatusCode::NotFound => KeyStoreError::NotFound(message),
            StatusCode::ResourceExhausted => KeyStoreError::Exhausted(message),
            StatusCode::AlreadyExists => KeyStoreError::AlreadyExists(message),
            StatusCode::InvalidArgument => KeyStoreError::InvalidArgument(message),
            StatusCode::Unavailable => KeyStoreError::Unavailable(message),
            StatusCode::Internal | StatusCode::Aborted => KeyStoreError::Internal(message),
        }
    }
}

pub type Result<T> = std::result::Result<T, KeyStoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            KeyStoreError::Exhausted("none".into()).status_code(),
            StatusCode::ResourceExhausted
        );
        assert_eq!(
            KeyStoreError::KeyMismatch { key_id: 4 }.status_code(),
            StatusCode::Aborted
        );

        let rebuilt = KeyStoreError::from_status(StatusCode::AlreadyExists, "slot 7");
        assert!(matches!(rebuilt, KeyStoreError::AlreadyExists(msg) if msg == "slot 7"));
    }
}
