//! Consumer side of a subscriber session.

use super::types::{CloseReason, Gap, Liveness, SessionShared, SessionState, StreamEvent};
use crate::broadcaster::Shared;
use crate::error::{ChatError, Result};
use crate::types::{Message, Sequence, SessionId};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::collections::VecDeque;
use std::fmt::Display;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// A registered subscriber: catch-up batch, live queue and delivery cursor.
///
/// Dropping a subscription unregisters it from the broadcaster.
pub struct Subscription {
    shared: Arc<SessionShared>,
    receiver: Receiver<Message>,
    catch_up: VecDeque<Message>,
    gap: Option<Gap>,
    /// Last delivered sequence.
    cursor: Sequence,
    /// Last sequence covered by the catch-up snapshot.
    snapshot_end: Sequence,
    liveness_interval: Duration,
    broadcaster: Weak<Shared>,
    gap_sent: bool,
    caught_up_sent: bool,
    finished: bool,
}

impl Subscription {
    pub(crate) fn new(
        shared: Arc<SessionShared>,
        receiver: Receiver<Message>,
        catch_up: Vec<Message>,
        gap: Option<Gap>,
        cursor: Sequence,
        snapshot_end: Sequence,
        liveness_interval: Duration,
        broadcaster: Weak<Shared>,
    ) -> Self {
        Self {
            shared,
            receiver,
            catch_up: catch_up.into(),
            gap,
            cursor,
            snapshot_end,
            liveness_interval,
            broadcaster,
            gap_sent: false,
            caught_up_sent: false,
            finished: false,
        }
    }

    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    /// Sequence of the last message handed to the consumer (0 if none).
    ///
    /// Before catch-up is consumed this sits just before the first catch-up
    /// message, not at [`snapshot_end`](Self::snapshot_end). After a lossy
    /// close, pass this (never `snapshot_end`) to `subscribe_from` to resume
    /// without skipping undelivered catch-up.
    pub fn cursor(&self) -> Sequence {
        self.cursor
    }

    /// Last sequence in the catch-up snapshot taken at registration. Every
    /// later message arrives through the live queue.
    pub fn snapshot_end(&self) -> Sequence {
        self.snapshot_end
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Why the session closed, once it has.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.reason()
    }

    /// Messages evicted between the resume cursor and the retained window.
    pub fn gap(&self) -> Option<Gap> {
        self.gap
    }

    /// Catch-up messages not yet consumed.
    pub fn pending_catch_up(&self) -> usize {
        self.catch_up.len()
    }

    /// Live messages queued but not yet consumed.
    pub fn pending_live(&self) -> usize {
        self.receiver.len()
    }

    /// Ok while the session is active; otherwise the matching error.
    pub fn check_open(&self) -> Result<()> {
        match self.shared.state() {
            SessionState::Active => Ok(()),
            _ => match self.shared.reason() {
                Some(CloseReason::Overflow) => Err(ChatError::SlowConsumer),
                Some(CloseReason::Shutdown) => Err(ChatError::BackendUnavailable(
                    "broadcaster shut down".into(),
                )),
                other => Err(ChatError::BackendUnavailable(format!(
                    "session closed: {:?}",
                    other
                ))),
            },
        }
    }

    /// Produce the next event, blocking up to the liveness interval.
    ///
    /// Order: an optional `Gap`, the catch-up messages, `CaughtUp`, then live
    /// messages interleaved with `Heartbeat`s, and finally one `Closed`.
    /// Returns `None` after `Closed`.
    pub fn next_event(&mut self, liveness: &dyn Liveness) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }

        if !liveness.is_connected() {
            return Some(self.finish(CloseReason::Disconnected));
        }

        // A closing session drains no further.
        if !self.shared.is_active() {
            return Some(self.finish(CloseReason::Disconnected));
        }

        if !self.gap_sent {
            self.gap_sent = true;
            if let Some(gap) = self.gap {
                return Some(StreamEvent::Gap { gap });
            }
        }

        if let Some(message) = self.catch_up.pop_front() {
            self.cursor = message.sequence;
            return Some(StreamEvent::Message { message });
        }

        if !self.caught_up_sent {
            self.caught_up_sent = true;
            return Some(StreamEvent::CaughtUp);
        }

        match self.receiver.recv_timeout(self.liveness_interval) {
            Ok(message) => {
                if !self.shared.is_active() {
                    return Some(self.finish(CloseReason::Disconnected));
                }
                self.cursor = message.sequence;
                Some(StreamEvent::Message { message })
            }
            Err(RecvTimeoutError::Timeout) => {
                if liveness.is_connected() {
                    Some(StreamEvent::Heartbeat)
                } else {
                    Some(self.finish(CloseReason::Disconnected))
                }
            }
            // Registry dropped our sender: overflow or shutdown already set a reason.
            Err(RecvTimeoutError::Disconnected) => Some(self.finish(CloseReason::Shutdown)),
        }
    }

    /// Drive the consumer loop, handing every event to `deliver`.
    ///
    /// A delivery error closes the session with `DeliveryFailed`. Returns the
    /// close reason.
    pub fn run<L, F, E>(&mut self, liveness: &L, mut deliver: F) -> CloseReason
    where
        L: Liveness,
        F: FnMut(StreamEvent) -> std::result::Result<(), E>,
        E: Display,
    {
        while let Some(event) = self.next_event(liveness) {
            match event {
                StreamEvent::Closed { reason } => {
                    // Best effort; the transport may already be gone.
                    let _ = deliver(StreamEvent::Closed {
                        reason: reason.clone(),
                    });
                    return reason;
                }
                event => {
                    if let Err(e) = deliver(event) {
                        tracing::warn!(session = %self.shared.id, error = %e, "delivery to transport failed");
                        self.finish(CloseReason::DeliveryFailed(e.to_string()));
                        break;
                    }
                }
            }
        }

        self.close_reason().unwrap_or(CloseReason::Unsubscribed)
    }

    /// Close gracefully. Idempotent.
    pub fn close(&mut self) {
        if !self.finished {
            self.finish(CloseReason::Unsubscribed);
        }
    }

    /// Adapt into an iterator bound to a liveness signal.
    pub fn into_stream<L: Liveness>(self, liveness: L) -> MessageStream<L> {
        MessageStream {
            subscription: self,
            liveness,
        }
    }

    /// `Closing -> Closed`: record `reason` unless another one won, leave the
    /// registry and release the queue.
    fn finish(&mut self, reason: CloseReason) -> StreamEvent {
        self.shared.begin_close(reason.clone());
        let reason = self.shared.reason().unwrap_or(reason);

        if let Some(broadcaster) = self.broadcaster.upgrade() {
            broadcaster.unregister(self.shared.id);
        }
        self.catch_up.clear();
        while self.receiver.try_recv().is_ok() {}

        self.shared.mark_closed();
        self.finished = true;

        tracing::debug!(
            session = %self.shared.id,
            cursor = self.cursor.0,
            reason = ?reason,
            "subscriber session closed"
        );

        StreamEvent::Closed { reason }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.finished {
            self.finish(CloseReason::Disconnected);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.shared.id)
            .field("cursor", &self.cursor)
            .field("state", &self.shared.state())
            .finish()
    }
}

/// Iterator over a subscription's events, ending after `Closed`.
pub struct MessageStream<L: Liveness> {
    subscription: Subscription,
    liveness: L,
}

impl<L: Liveness> MessageStream<L> {
    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    pub fn cursor(&self) -> Sequence {
        self.subscription.cursor()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.subscription.close_reason()
    }

    pub fn close(&mut self) {
        self.subscription.close();
    }

    /// Skip heartbeats and lifecycle markers, yielding only messages.
    pub fn messages(self) -> impl Iterator<Item = Message> {
        self.filter_map(|event| match event {
            StreamEvent::Message { message } => Some(message),
            _ => None,
        })
    }

    pub fn into_inner(self) -> Subscription {
        self.subscription
    }
}

impl<L: Liveness> Iterator for MessageStream<L> {
    type Item = StreamEvent;

    fn next(&mut self) -> Option<Self::Item> {
        self.subscription.next_event(&self.liveness)
    }
}
