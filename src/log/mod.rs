//! Message log implementations.
//!
//! Messages live in a bounded, append-only window. Two backends implement
//! [`MessageStore`]:
//! - [`MemoryLog`]: volatile, in-process
//! - [`DurableLog`]: the same window, backed by a checksummed append-only file

mod durable;
mod memory;

pub use durable::DurableLog;
pub use memory::MemoryLog;

use crate::error::Result;
use crate::types::{Message, Sequence, Timestamp};

/// Storage behind the broadcaster.
///
/// All methods are called with the broadcaster's exclusive lock held, so
/// implementations need no internal synchronization.
pub trait MessageStore: Send {
    /// Assign the next sequence, store the message, evict beyond capacity.
    fn append(&mut self, sender: String, content: String, timestamp: Timestamp) -> Result<Message>;

    /// Up to `limit` retained messages with sequence > `after`, oldest-first.
    fn range(&self, after: Sequence, limit: usize) -> Vec<Message>;

    /// Last `limit` retained messages, oldest-first.
    fn tail(&self, limit: usize) -> Vec<Message>;

    /// Remove the message with exactly this sequence. Never renumbers.
    fn remove(&mut self, sequence: Sequence) -> Result<Option<Message>>;

    /// Number of retained messages.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Max retained messages.
    fn capacity(&self) -> usize;

    /// Last assigned sequence (`Sequence::ZERO` before the first append).
    fn latest(&self) -> Sequence;

    /// Lowest sequence not lost to eviction. Cursors below `oldest_retained - 1`
    /// have missed messages.
    fn oldest_retained(&self) -> Sequence;

    /// Flush pending writes.
    fn sync(&mut self) -> Result<()> {
        Ok(())
    }

    /// Drop storage for evicted and deleted messages.
    fn compact(&mut self) -> Result<()> {
        Ok(())
    }

    /// Short backend name for stats and logs.
    fn backend_name(&self) -> &'static str;
}
