//! Broadcaster configuration.

use crate::error::{ChatError, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Longest liveness interval accepted; disconnects must be noticed promptly.
const MAX_LIVENESS_INTERVAL_MS: u64 = 5_000;

/// Which message store backs the broadcaster.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Volatile in-process history.
    #[default]
    Memory,

    /// Append-only file log in `path`, replayed on open.
    Durable {
        path: PathBuf,
        /// Sync every N writes (0 or 1 = every write).
        #[serde(default = "default_sync_interval")]
        sync_interval: u64,
    },
}

fn default_sync_interval() -> u64 {
    100
}

/// Broadcaster configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct BroadcasterConfig {
    /// Messages retained in history before the oldest is evicted.
    /// Default: 100
    pub history_capacity: usize,

    /// Max pending live messages per subscriber before it is dropped.
    /// Default: 1000
    pub queue_capacity: usize,

    /// Max messages replayed to a new subscriber.
    /// Default: 100
    pub catch_up_limit: usize,

    /// How long a consumer waits for a message before re-checking liveness.
    /// Default: 1000ms
    pub liveness_interval_ms: u64,

    /// Longest accepted message content, in bytes.
    /// Default: 4096
    pub max_content_len: usize,

    /// Longest accepted sender name, in bytes.
    /// Default: 256
    pub max_sender_len: usize,

    /// Storage backend.
    pub backend: BackendConfig,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            history_capacity: 100,
            queue_capacity: 1000,
            catch_up_limit: 100,
            liveness_interval_ms: 1000,
            max_content_len: 4096,
            max_sender_len: 256,
            backend: BackendConfig::Memory,
        }
    }
}

impl BroadcasterConfig {
    /// In-memory config with the given history capacity.
    pub fn in_memory(history_capacity: usize) -> Self {
        Self {
            history_capacity,
            ..Default::default()
        }
    }

    /// Durable config rooted at `path`.
    pub fn durable(path: impl Into<PathBuf>) -> Self {
        Self {
            backend: BackendConfig::Durable {
                path: path.into(),
                sync_interval: default_sync_interval(),
            },
            ..Default::default()
        }
    }

    /// Parse from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ChatError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the broadcaster cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.history_capacity == 0 {
            return Err(ChatError::InvalidConfig(
                "history_capacity must be at least 1".into(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(ChatError::InvalidConfig(
                "queue_capacity must be at least 1".into(),
            ));
        }
        if self.max_content_len == 0 {
            return Err(ChatError::InvalidConfig(
                "max_content_len must be at least 1".into(),
            ));
        }
        if self.max_sender_len == 0 {
            return Err(ChatError::InvalidConfig(
                "max_sender_len must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Liveness re-check interval, clamped to a few seconds.
    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms.min(MAX_LIVENESS_INTERVAL_MS))
    }
}
