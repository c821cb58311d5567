//! Subscription types for live message delivery.

use crate::types::{Message, Sequence, SessionId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

/// Events yielded to a subscriber's transport.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Messages between the resume cursor and the retained window were
    /// evicted before this subscriber could see them.
    Gap { gap: Gap },

    /// A message, from catch-up or live.
    Message { message: Message },

    /// Finished catch-up, now streaming live.
    CaughtUp,

    /// No message arrived within the liveness interval and the transport is
    /// still connected.
    Heartbeat,

    /// Stream ended. Always the last event.
    Closed { reason: CloseReason },
}

/// Why a session was closed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Pending queue overflowed (slow consumer). Messages may have been lost.
    Overflow,
    /// Transport reported the client gone.
    Disconnected,
    /// Explicitly closed by the consumer.
    Unsubscribed,
    /// Delivering to the transport failed.
    DeliveryFailed(String),
    /// Broadcaster shut down.
    Shutdown,
}

impl CloseReason {
    /// Whether the session may have lost messages and should resume from its
    /// cursor rather than start fresh.
    pub fn is_lossy(&self) -> bool {
        matches!(self, CloseReason::Overflow | CloseReason::DeliveryFailed(_))
    }
}

/// Range of sequences a resuming subscriber missed (inclusive).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gap {
    pub first_missed: Sequence,
    pub last_missed: Sequence,
}

impl Gap {
    /// Number of sequences missed.
    pub fn missed(&self) -> u64 {
        self.last_missed.0 - self.first_missed.0 + 1
    }
}

/// Session lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SessionState {
    Active = 0,
    Closing = 1,
    Closed = 2,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Active,
            1 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

/// State shared between the broadcaster's registry entry and the consumer.
pub(crate) struct SessionShared {
    pub(crate) id: SessionId,
    state: AtomicU8,
    reason: Mutex<Option<CloseReason>>,
}

impl SessionShared {
    pub(crate) fn new(id: SessionId) -> Self {
        Self {
            id,
            state: AtomicU8::new(SessionState::Active as u8),
            reason: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Move `Active -> Closing`. The first caller's reason wins; returns
    /// false if the session was already closing.
    pub(crate) fn begin_close(&self, reason: CloseReason) -> bool {
        // Reason is written before the state flips, under the same lock, so
        // anyone who sees `Closing` also sees the reason.
        let mut slot = self.reason.lock();
        if self.state() != SessionState::Active {
            return false;
        }
        *slot = Some(reason);
        self.state
            .store(SessionState::Closing as u8, Ordering::Release);
        true
    }

    /// Move to the terminal state.
    pub(crate) fn mark_closed(&self) {
        self.state
            .store(SessionState::Closed as u8, Ordering::Release);
    }

    pub(crate) fn reason(&self) -> Option<CloseReason> {
        self.reason.lock().clone()
    }
}

/// The transport's authoritative "still connected" signal.
pub trait Liveness {
    fn is_connected(&self) -> bool;
}

impl<F> Liveness for F
where
    F: Fn() -> bool,
{
    fn is_connected(&self) -> bool {
        self()
    }
}

/// Liveness for consumers that never disconnect on their own (tests, in-process readers).
#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysConnected;

impl Liveness for AlwaysConnected {
    fn is_connected(&self) -> bool {
        true
    }
}

/// Cloneable connected flag a transport flips when its client goes away.
#[derive(Clone, Debug)]
pub struct ConnectionFlag(Arc<AtomicBool>);

impl ConnectionFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    /// Mark the connection as gone.
    pub fn disconnect(&self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Default for ConnectionFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl Liveness for ConnectionFlag {
    fn is_connected(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_close_reason_wins() {
        let shared = SessionShared::new(SessionId(1));
        assert!(shared.is_active());

        assert!(shared.begin_close(CloseReason::Overflow));
        assert!(!shared.begin_close(CloseReason::Unsubscribed));

        assert_eq!(shared.state(), SessionState::Closing);
        assert_eq!(shared.reason(), Some(CloseReason::Overflow));

        shared.mark_closed();
        assert_eq!(shared.state(), SessionState::Closed);
    }

    #[test]
    fn test_connection_flag() {
        let flag = ConnectionFlag::new();
        let clone = flag.clone();
        assert!(clone.is_connected());

        flag.disconnect();
        assert!(!clone.is_connected());
    }

    #[test]
    fn test_event_json_tags() {
        let event = StreamEvent::Closed {
            reason: CloseReason::Overflow,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "closed");
        assert_eq!(json["reason"], "overflow");
    }

    #[test]
    fn test_gap_len() {
        let gap = Gap {
            first_missed: Sequence(3),
            last_missed: Sequence(7),
        };
        assert_eq!(gap.missed(), 5);
        assert!(CloseReason::Overflow.is_lossy());
        assert!(!CloseReason::Unsubscribed.is_lossy());
    }
}
