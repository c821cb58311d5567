//! Bounded in-memory message window.

use super::MessageStore;
use crate::error::Result;
use crate::types::{Message, Sequence, Timestamp};
use std::collections::VecDeque;

/// Bounded, append-only message window with monotonic sequence numbers.
pub struct MemoryLog {
    /// Retained messages, ordered by sequence.
    messages: VecDeque<Message>,

    /// Max retained messages.
    capacity: usize,

    /// Next sequence to assign.
    next_sequence: Sequence,

    /// Lowest sequence not lost to eviction.
    window_start: Sequence,
}

impl MemoryLog {
    /// Create an empty log. A zero capacity is treated as 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            messages: VecDeque::with_capacity(capacity),
            capacity,
            next_sequence: Sequence(1),
            window_start: Sequence(1),
        }
    }

    /// Sequence the next append will receive.
    pub fn next_sequence(&self) -> Sequence {
        self.next_sequence
    }

    /// Whether a message with this sequence is retained.
    pub fn contains(&self, sequence: Sequence) -> bool {
        self.position(sequence).is_some()
    }

    /// Insert an already-numbered message (used when replaying storage).
    ///
    /// Messages must arrive in increasing sequence order.
    pub(crate) fn push_existing(&mut self, message: Message) {
        if message.sequence >= self.next_sequence {
            self.next_sequence = message.sequence.next();
        }
        self.messages.push_back(message);
        self.evict();
    }

    /// Restore counters recorded by a compaction checkpoint.
    pub(crate) fn restore_counters(&mut self, next_sequence: Sequence, window_start: Sequence) {
        self.next_sequence = self.next_sequence.max(next_sequence);
        self.window_start = self.window_start.max(window_start);
    }

    fn evict(&mut self) {
        while self.messages.len() > self.capacity {
            if let Some(evicted) = self.messages.pop_front() {
                self.window_start = evicted.sequence.next();
            }
        }
    }

    fn position(&self, sequence: Sequence) -> Option<usize> {
        self.messages
            .binary_search_by_key(&sequence, |m| m.sequence)
            .ok()
    }
}

impl MessageStore for MemoryLog {
    fn append(&mut self, sender: String, content: String, timestamp: Timestamp) -> Result<Message> {
        let message = Message {
            sequence: self.next_sequence,
            sender,
            content,
            timestamp,
        };
        self.next_sequence = self.next_sequence.next();
        self.messages.push_back(message.clone());
        self.evict();
        Ok(message)
    }

    fn range(&self, after: Sequence, limit: usize) -> Vec<Message> {
        let start = self.messages.partition_point(|m| m.sequence <= after);
        self.messages
            .iter()
            .skip(start)
            .take(limit)
            .cloned()
            .collect()
    }

    fn tail(&self, limit: usize) -> Vec<Message> {
        let skip = self.messages.len().saturating_sub(limit);
        self.messages.iter().skip(skip).cloned().collect()
    }

    fn remove(&mut self, sequence: Sequence) -> Result<Option<Message>> {
        Ok(self
            .position(sequence)
            .and_then(|idx| self.messages.remove(idx)))
    }

    fn len(&self) -> usize {
        self.messages.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn latest(&self) -> Sequence {
        self.next_sequence.prev().unwrap_or(Sequence::ZERO)
    }

    fn oldest_retained(&self) -> Sequence {
        self.window_start
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
