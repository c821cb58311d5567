//! Error types for the broadcast engine.

use crate::types::Sequence;
use thiserror::Error;

/// Main error type for broadcaster and service operations.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Message not found: {0}")]
    NotFound(Sequence),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Subscriber dropped: pending queue overflowed")]
    SlowConsumer,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Invalid log format: {0}")]
    InvalidFormat(String),

    #[error("Message log is locked by another process")]
    Locked,
}

impl ChatError {
    /// Whether a caller may reasonably retry the same call later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ChatError::BackendUnavailable(_) | ChatError::Io(_))
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(e: serde_json::Error) -> Self {
        ChatError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for ChatError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        ChatError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ChatError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        ChatError::Deserialization(e.to_string())
    }
}

/// Result type for broadcaster operations.
pub type Result<T> = std::result::Result<T, ChatError>;
