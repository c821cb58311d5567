//! The four operations a transport calls: send, stream, history, delete.

use crate::broadcaster::{Broadcaster, BroadcasterStats};
use crate::error::{ChatError, Result};
use crate::subscriptions::{Liveness, MessageStream};
use crate::types::{Message, Sequence, Timestamp};
use serde::{Deserialize, Serialize};

/// Outcome of a delete, in the shape transports return to clients.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub success: bool,
    pub detail: String,
}

/// Chat service over an injected broadcaster.
#[derive(Clone)]
pub struct ChatService {
    broadcaster: Broadcaster,
    max_content_len: usize,
    max_sender_len: usize,
}

impl ChatService {
    pub fn new(broadcaster: Broadcaster) -> Self {
        let config = broadcaster.config();
        let max_content_len = config.max_content_len;
        let max_sender_len = config.max_sender_len;
        Self {
            broadcaster,
            max_content_len,
            max_sender_len,
        }
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    /// Validate and append a message stamped with the current time.
    /// Returns its sequence, which is also its id for `delete`.
    pub fn send(&self, sender: &str, content: &str) -> Result<Sequence> {
        self.validate(sender, content)?;

        let message = self
            .broadcaster
            .append(sender, content, Timestamp::now())?;

        tracing::debug!(
            sequence = message.sequence.0,
            sender = %message.sender,
            "message accepted"
        );
        Ok(message.sequence)
    }

    /// Open a stream: recent history, then live messages until `liveness`
    /// reports the client gone or the session is closed.
    pub fn stream<L: Liveness>(&self, liveness: L) -> Result<MessageStream<L>> {
        Ok(self.broadcaster.subscribe()?.into_stream(liveness))
    }

    /// Reopen a stream after `cursor`, e.g. following an overflow close.
    pub fn stream_from<L: Liveness>(
        &self,
        cursor: Sequence,
        liveness: L,
    ) -> Result<MessageStream<L>> {
        Ok(self.broadcaster.subscribe_from(cursor)?.into_stream(liveness))
    }

    /// Up to `limit` most recent messages, oldest-first. Non-positive limits
    /// yield an empty list.
    pub fn get_history(&self, limit: i64) -> Result<Vec<Message>> {
        if limit <= 0 {
            return Ok(Vec::new());
        }
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        self.broadcaster.history(limit)
    }

    /// Delete a message by sequence. A missing id is not an error: it comes
    /// back as `success = false`.
    pub fn delete(&self, id: Sequence) -> Result<DeleteResponse> {
        match self.broadcaster.delete(id) {
            Ok(message) => {
                tracing::info!(sequence = id.0, sender = %message.sender, "message deleted");
                Ok(DeleteResponse {
                    success: true,
                    detail: format!("Deleted message {} from '{}'", id, message.sender),
                })
            }
            Err(ChatError::NotFound(_)) => Ok(DeleteResponse {
                success: false,
                detail: format!("No message found with id {}", id),
            }),
            Err(e) => Err(e),
        }
    }

    /// Broadcaster statistics, for health endpoints.
    pub fn health(&self) -> BroadcasterStats {
        self.broadcaster.stats()
    }

    /// Shut the broadcaster down.
    pub fn shutdown(&self) -> Result<()> {
        self.broadcaster.shutdown()
    }

    fn validate(&self, sender: &str, content: &str) -> Result<()> {
        if sender.trim().is_empty() {
            return Err(ChatError::Validation("sender must not be empty".into()));
        }
        if sender.len() > self.max_sender_len {
            return Err(ChatError::Validation(format!(
                "sender is {} bytes, limit is {}",
                sender.len(),
                self.max_sender_len
            )));
        }
        if content.trim().is_empty() {
            return Err(ChatError::Validation("content must not be empty".into()));
        }
        if content.len() > self.max_content_len {
            return Err(ChatError::Validation(format!(
                "content is {} bytes, limit is {}",
                content.len(),
                self.max_content_len
            )));
        }
        Ok(())
    }
}
