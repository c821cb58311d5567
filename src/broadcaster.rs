//! Broadcaster: the message log plus the registry of live subscribers.

use crate::config::{BackendConfig, BroadcasterConfig};
use crate::error::{ChatError, Result};
use crate::log::{DurableLog, MemoryLog, MessageStore};
use crate::subscriptions::{CloseReason, Gap, SessionShared, Subscription};
use crate::types::{Message, Sequence, SessionId, Timestamp};
use crossbeam_channel::{bounded, Sender, TrySendError};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Registry entry for one session.
struct SessionEntry {
    shared: Arc<SessionShared>,
    sender: Sender<Message>,
}

/// Everything guarded by the single exclusive lock.
struct Inner {
    log: Box<dyn MessageStore>,
    sessions: HashMap<SessionId, SessionEntry>,
    open: bool,
}

pub(crate) struct Shared {
    inner: Mutex<Inner>,
    config: BroadcasterConfig,
    next_session: AtomicU64,
    dropped_sessions: AtomicU64,
}

impl Shared {
    /// Remove a session from the registry. Idempotent.
    pub(crate) fn unregister(&self, id: SessionId) {
        if self.inner.lock().sessions.remove(&id).is_some() {
            tracing::debug!(session = %id, "session unregistered");
        }
    }
}

/// Point-in-time broadcaster statistics.
#[derive(Clone, Debug, Serialize)]
pub struct BroadcasterStats {
    /// Registered sessions.
    pub sessions: usize,
    /// Retained messages.
    pub retained: usize,
    pub capacity: usize,
    /// Last assigned sequence.
    pub latest: Sequence,
    pub oldest_retained: Sequence,
    /// Sessions dropped for overflow since startup.
    pub dropped_sessions: u64,
    pub backend: &'static str,
    pub open: bool,
}

/// Owns the message log and fans appends out to every subscriber.
///
/// Appends, registration with catch-up snapshot, fan-out, unregistration and
/// deletes all happen under one lock, giving a single total order. Cheap to
/// clone; clones share the same log and registry.
#[derive(Clone)]
pub struct Broadcaster {
    shared: Arc<Shared>,
}

impl Broadcaster {
    /// Create a broadcaster with the backend named in `config`.
    pub fn new(config: BroadcasterConfig) -> Result<Self> {
        config.validate()?;

        let log: Box<dyn MessageStore> = match &config.backend {
            BackendConfig::Memory => Box::new(MemoryLog::new(config.history_capacity)),
            BackendConfig::Durable {
                path,
                sync_interval,
            } => Box::new(DurableLog::open_with_sync_interval(
                path,
                config.history_capacity,
                *sync_interval,
            )?),
        };

        Self::with_store(config, log)
    }

    /// Create a broadcaster over a caller-supplied store.
    pub fn with_store(config: BroadcasterConfig, log: Box<dyn MessageStore>) -> Result<Self> {
        config.validate()?;

        tracing::info!(
            backend = log.backend_name(),
            capacity = log.capacity(),
            retained = log.len(),
            queue_capacity = config.queue_capacity,
            "broadcaster started"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    log,
                    sessions: HashMap::new(),
                    open: true,
                }),
                config,
                next_session: AtomicU64::new(1),
                dropped_sessions: AtomicU64::new(0),
            }),
        })
    }

    pub fn config(&self) -> &BroadcasterConfig {
        &self.shared.config
    }

    // --- Producers ---

    /// Append a message and push it to every active session.
    ///
    /// Never blocks on consumers: a session whose queue is full is closed
    /// with `CloseReason::Overflow` and removed.
    pub fn append(
        &self,
        sender: impl Into<String>,
        content: impl Into<String>,
        timestamp: Timestamp,
    ) -> Result<Message> {
        let mut inner = self.shared.inner.lock();
        Self::ensure_open(&inner)?;

        let message = inner.log.append(sender.into(), content.into(), timestamp)?;

        let mut to_remove = Vec::new();
        for (id, entry) in inner.sessions.iter() {
            if !entry.shared.is_active() {
                continue;
            }
            match entry.sender.try_send(message.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    entry.shared.begin_close(CloseReason::Overflow);
                    to_remove.push(*id);
                }
                Err(TrySendError::Disconnected(_)) => {
                    entry.shared.begin_close(CloseReason::Disconnected);
                    to_remove.push(*id);
                }
            }
        }

        for id in to_remove {
            if let Some(entry) = inner.sessions.remove(&id) {
                if entry.shared.reason() == Some(CloseReason::Overflow) {
                    self.shared.dropped_sessions.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        session = %id,
                        sequence = message.sequence.0,
                        queue_capacity = self.shared.config.queue_capacity,
                        "dropping slow subscriber"
                    );
                }
            }
        }

        Ok(message)
    }

    // --- Subscribers ---

    /// Register a new session. Catch-up is the most recent `catch_up_limit`
    /// messages.
    pub fn subscribe(&self) -> Result<Subscription> {
        self.register(None)
    }

    /// Register a session resuming after `cursor`.
    ///
    /// Catch-up is every retained message after `cursor`. If some of them were
    /// already evicted the subscription reports a [`Gap`].
    pub fn subscribe_from(&self, cursor: Sequence) -> Result<Subscription> {
        self.register(Some(cursor))
    }

    fn register(&self, from: Option<Sequence>) -> Result<Subscription> {
        let config = &self.shared.config;
        let mut inner = self.shared.inner.lock();
        Self::ensure_open(&inner)?;

        let latest = inner.log.latest();
        let (catch_up, gap, start) = match from {
            None => (inner.log.tail(config.catch_up_limit), None, latest),
            Some(cursor) => {
                if cursor > latest {
                    return Err(ChatError::Validation(format!(
                        "cursor {} is ahead of the log (latest {})",
                        cursor, latest
                    )));
                }
                let oldest = inner.log.oldest_retained();
                let gap = if cursor.next() < oldest {
                    Some(Gap {
                        first_missed: cursor.next(),
                        last_missed: oldest.prev().unwrap_or(Sequence::ZERO),
                    })
                } else {
                    None
                };
                // Whole remainder of the window: capping it would lose messages silently.
                (inner.log.range(cursor, usize::MAX), gap, cursor)
            }
        };

        let snapshot_end = catch_up.last().map(|m| m.sequence).unwrap_or(start);
        let cursor = if from.is_some() {
            start
        } else {
            // Before catch-up is consumed nothing has been delivered yet.
            catch_up
                .first()
                .and_then(|m| m.sequence.prev())
                .unwrap_or(start)
        };

        let id = SessionId(self.shared.next_session.fetch_add(1, Ordering::SeqCst));
        let shared = Arc::new(SessionShared::new(id));
        let (sender, receiver) = bounded(config.queue_capacity);

        inner.sessions.insert(
            id,
            SessionEntry {
                shared: Arc::clone(&shared),
                sender,
            },
        );

        tracing::debug!(
            session = %id,
            catch_up = catch_up.len(),
            gap = ?gap,
            "session registered"
        );

        Ok(Subscription::new(
            shared,
            receiver,
            catch_up,
            gap,
            cursor,
            snapshot_end,
            config.liveness_interval(),
            Arc::downgrade(&self.shared),
        ))
    }

    /// Remove a session from the registry. Idempotent.
    pub fn unsubscribe(&self, id: SessionId) {
        let entry = self.shared.inner.lock().sessions.remove(&id);
        if let Some(entry) = entry {
            entry.shared.begin_close(CloseReason::Unsubscribed);
            tracing::debug!(session = %id, "session unsubscribed");
        }
    }

    /// Registered session count.
    pub fn session_count(&self) -> usize {
        self.shared.inner.lock().sessions.len()
    }

    // --- Reads ---

    /// Up to `limit` most recent messages, oldest-first.
    pub fn history(&self, limit: usize) -> Result<Vec<Message>> {
        let inner = self.shared.inner.lock();
        Self::ensure_open(&inner)?;
        Ok(inner.log.tail(limit))
    }

    /// Up to `limit` retained messages after `after`, oldest-first.
    pub fn range(&self, after: Sequence, limit: usize) -> Result<Vec<Message>> {
        let inner = self.shared.inner.lock();
        Self::ensure_open(&inner)?;
        Ok(inner.log.range(after, limit))
    }

    // --- Deletes ---

    /// Delete the message with this sequence.
    pub fn delete(&self, sequence: Sequence) -> Result<Message> {
        let mut inner = self.shared.inner.lock();
        Self::ensure_open(&inner)?;
        inner
            .log
            .remove(sequence)?
            .ok_or(ChatError::NotFound(sequence))
    }

    // --- Maintenance ---

    pub fn stats(&self) -> BroadcasterStats {
        let inner = self.shared.inner.lock();
        BroadcasterStats {
            sessions: inner.sessions.len(),
            retained: inner.log.len(),
            capacity: inner.log.capacity(),
            latest: inner.log.latest(),
            oldest_retained: inner.log.oldest_retained(),
            dropped_sessions: self.shared.dropped_sessions.load(Ordering::Relaxed),
            backend: inner.log.backend_name(),
            open: inner.open,
        }
    }

    /// Flush the backend.
    pub fn sync(&self) -> Result<()> {
        self.shared.inner.lock().log.sync()
    }

    /// Reclaim backend storage held by evicted or deleted messages.
    pub fn compact(&self) -> Result<()> {
        let mut inner = self.shared.inner.lock();
        Self::ensure_open(&inner)?;
        inner.log.compact()
    }

    pub fn is_open(&self) -> bool {
        self.shared.inner.lock().open
    }

    /// Close every session with `CloseReason::Shutdown`, refuse further
    /// operations with `BackendUnavailable` and sync the backend.
    ///
    /// Closing is idempotent; the sync runs on every call, so a failed sync
    /// can be retried.
    pub fn shutdown(&self) -> Result<()> {
        let mut inner = self.shared.inner.lock();
        if inner.open {
            inner.open = false;

            let sessions = inner.sessions.len();
            for (_, entry) in inner.sessions.drain() {
                entry.shared.begin_close(CloseReason::Shutdown);
            }
            tracing::info!(sessions, "broadcaster shut down");
        }

        inner.log.sync()
    }

    fn ensure_open(inner: &Inner) -> Result<()> {
        if inner.open {
            Ok(())
        } else {
            Err(ChatError::BackendUnavailable(
                "broadcaster is shut down".into(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriptions::{AlwaysConnected, SessionState, StreamEvent};
    use std::time::Duration;

    fn broadcaster(capacity: usize, queue_capacity: usize) -> Broadcaster {
        Broadcaster::new(BroadcasterConfig {
            history_capacity: capacity,
            queue_capacity,
            liveness_interval_ms: 20,
            ..Default::default()
        })
        .unwrap()
    }

    fn send(b: &Broadcaster, content: &str) -> Message {
        b.append("tester", content, Timestamp(1)).unwrap()
    }

    fn next_message(sub: &mut Subscription) -> Message {
        loop {
            match sub.next_event(&AlwaysConnected) {
                Some(StreamEvent::Message { message }) => return message,
                Some(StreamEvent::Closed { reason }) => panic!("closed: {:?}", reason),
                Some(_) => continue,
                None => panic!("stream ended"),
            }
        }
    }

    #[test]
    fn test_subscribe_unsubscribe() {
        let b = broadcaster(10, 10);

        let sub = b.subscribe().unwrap();
        assert_eq!(b.session_count(), 1);

        b.unsubscribe(sub.id());
        assert_eq!(b.session_count(), 0);
        assert_eq!(sub.state(), SessionState::Closing);

        // Idempotent
        b.unsubscribe(sub.id());
        assert_eq!(b.session_count(), 0);
    }

    #[test]
    fn test_drop_unregisters() {
        let b = broadcaster(10, 10);
        {
            let _sub = b.subscribe().unwrap();
            assert_eq!(b.session_count(), 1);
        }
        assert_eq!(b.session_count(), 0);
    }

    #[test]
    fn test_catch_up_then_live() {
        let b = broadcaster(10, 10);
        send(&b, "one");
        send(&b, "two");

        let mut sub = b.subscribe().unwrap();
        assert_eq!(sub.pending_catch_up(), 2);
        assert_eq!(sub.cursor(), Sequence::ZERO);
        assert_eq!(sub.snapshot_end(), Sequence(2));

        send(&b, "three");

        let contents: Vec<_> = (0..3).map(|_| next_message(&mut sub).content).collect();
        assert_eq!(contents, vec!["one", "two", "three"]);
        assert_eq!(sub.cursor(), Sequence(3));
    }

    #[test]
    fn test_catch_up_limit() {
        let b = Broadcaster::new(BroadcasterConfig {
            history_capacity: 10,
            catch_up_limit: 3,
            ..Default::default()
        })
        .unwrap();
        for i in 1..=8 {
            send(&b, &format!("m{}", i));
        }

        let mut sub = b.subscribe().unwrap();
        assert_eq!(sub.cursor(), Sequence(5));
        assert_eq!(next_message(&mut sub).sequence, Sequence(6));
    }

    #[test]
    fn test_drop_slow_subscriber() {
        let b = broadcaster(100, 2);
        let mut sub = b.subscribe().unwrap();

        for i in 0..3 {
            send(&b, &format!("m{}", i));
        }

        // Subscriber should be dropped, not holding 3 pending entries
        assert_eq!(b.session_count(), 0);
        assert_eq!(sub.close_reason(), Some(CloseReason::Overflow));
        assert!(matches!(sub.check_open(), Err(ChatError::SlowConsumer)));
        assert_eq!(b.stats().dropped_sessions, 1);

        // Closing drains no further
        let events: Vec<_> = std::iter::from_fn(|| sub.next_event(&AlwaysConnected)).collect();
        assert_eq!(
            events,
            vec![StreamEvent::Closed {
                reason: CloseReason::Overflow
            }]
        );
        assert_eq!(sub.state(), SessionState::Closed);
    }

    #[test]
    fn test_overflow_only_drops_slow_session() {
        let b = broadcaster(100, 2);
        let _slow = b.subscribe().unwrap();
        let mut fast = b.subscribe().unwrap();

        for i in 0..5 {
            send(&b, &format!("m{}", i));
            next_message(&mut fast);
        }

        assert_eq!(b.session_count(), 1);
        assert!(fast.check_open().is_ok());
    }

    #[test]
    fn test_subscribe_from_resumes() {
        let b = broadcaster(10, 10);
        for i in 1..=5 {
            send(&b, &format!("m{}", i));
        }

        let mut sub = b.subscribe_from(Sequence(3)).unwrap();
        assert!(sub.gap().is_none());
        assert_eq!(sub.cursor(), Sequence(3));
        assert_eq!(next_message(&mut sub).sequence, Sequence(4));
        assert_eq!(next_message(&mut sub).sequence, Sequence(5));
    }

    #[test]
    fn test_subscribe_from_reports_gap() {
        let b = broadcaster(3, 10);
        for i in 1..=10 {
            send(&b, &format!("m{}", i));
        }

        let mut sub = b.subscribe_from(Sequence(2)).unwrap();
        let gap = sub.gap().unwrap();
        assert_eq!(gap.first_missed, Sequence(3));
        assert_eq!(gap.last_missed, Sequence(7));

        assert_eq!(
            sub.next_event(&AlwaysConnected),
            Some(StreamEvent::Gap { gap })
        );
        assert_eq!(next_message(&mut sub).sequence, Sequence(8));
    }

    #[test]
    fn test_subscribe_from_future_cursor() {
        let b = broadcaster(10, 10);
        send(&b, "one");

        let result = b.subscribe_from(Sequence(5));
        assert!(matches!(result, Err(ChatError::Validation(_))));
    }

    #[test]
    fn test_delete() {
        let b = broadcaster(10, 10);
        let first = send(&b, "one");
        send(&b, "two");

        let deleted = b.delete(first.sequence).unwrap();
        assert_eq!(deleted.content, "one");
        assert!(matches!(
            b.delete(first.sequence),
            Err(ChatError::NotFound(Sequence(1)))
        ));
        assert_eq!(b.history(10).unwrap().len(), 1);
    }

    #[test]
    fn test_heartbeat_when_idle() {
        let b = broadcaster(10, 10);
        let mut sub = b.subscribe().unwrap();

        assert_eq!(sub.next_event(&AlwaysConnected), Some(StreamEvent::CaughtUp));
        assert_eq!(sub.next_event(&AlwaysConnected), Some(StreamEvent::Heartbeat));
    }

    #[test]
    fn test_shutdown_closes_sessions() {
        let b = broadcaster(10, 10);
        let mut sub = b.subscribe().unwrap();
        assert_eq!(sub.next_event(&AlwaysConnected), Some(StreamEvent::CaughtUp));

        b.shutdown().unwrap();
        assert_eq!(b.session_count(), 0);
        assert_eq!(
            sub.next_event(&AlwaysConnected),
            Some(StreamEvent::Closed {
                reason: CloseReason::Shutdown
            })
        );

        assert!(matches!(
            b.append("a", "b", Timestamp(1)),
            Err(ChatError::BackendUnavailable(_))
        ));
        assert!(matches!(b.subscribe(), Err(ChatError::BackendUnavailable(_))));
        // Idempotent
        b.shutdown().unwrap();
    }

    /// Memory store whose `sync` fails a set number of times.
    struct FlakySync {
        log: MemoryLog,
        failures: usize,
        calls: Arc<AtomicU64>,
    }

    impl MessageStore for FlakySync {
        fn append(&mut self, sender: String, content: String, timestamp: Timestamp) -> Result<Message> {
            self.log.append(sender, content, timestamp)
        }
        fn range(&self, after: Sequence, limit: usize) -> Vec<Message> {
            self.log.range(after, limit)
        }
        fn tail(&self, limit: usize) -> Vec<Message> {
            self.log.tail(limit)
        }
        fn remove(&mut self, sequence: Sequence) -> Result<Option<Message>> {
            self.log.remove(sequence)
        }
        fn len(&self) -> usize {
            self.log.len()
        }
        fn capacity(&self) -> usize {
            self.log.capacity()
        }
        fn latest(&self) -> Sequence {
            self.log.latest()
        }
        fn oldest_retained(&self) -> Sequence {
            self.log.oldest_retained()
        }
        fn sync(&mut self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures > 0 {
                self.failures -= 1;
                return Err(ChatError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disk full",
                )));
            }
            Ok(())
        }
        fn backend_name(&self) -> &'static str {
            "flaky"
        }
    }

    #[test]
    fn test_shutdown_retries_failed_sync() {
        let calls = Arc::new(AtomicU64::new(0));
        let store = FlakySync {
            log: MemoryLog::new(10),
            failures: 1,
            calls: Arc::clone(&calls),
        };
        let b = Broadcaster::with_store(BroadcasterConfig::default(), Box::new(store)).unwrap();
        let sub = b.subscribe().unwrap();

        assert!(matches!(b.shutdown(), Err(ChatError::Io(_))));
        assert!(!b.is_open());
        assert_eq!(sub.close_reason(), Some(CloseReason::Shutdown));

        // The retry syncs again instead of reporting a stale success
        b.shutdown().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_stats() {
        let b = broadcaster(2, 10);
        for i in 0..3 {
            send(&b, &format!("m{}", i));
        }
        let _sub = b.subscribe().unwrap();

        let stats = b.stats();
        assert_eq!(stats.sessions, 1);
        assert_eq!(stats.retained, 2);
        assert_eq!(stats.latest, Sequence(3));
        assert_eq!(stats.oldest_retained, Sequence(2));
        assert_eq!(stats.backend, "memory");
        assert!(stats.open);
    }

    #[test]
    fn test_live_wakes_blocked_consumer() {
        let b = Broadcaster::new(BroadcasterConfig {
            liveness_interval_ms: 2_000,
            ..Default::default()
        })
        .unwrap();
        let mut sub = b.subscribe().unwrap();
        assert_eq!(sub.next_event(&AlwaysConnected), Some(StreamEvent::CaughtUp));

        let producer = b.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            producer.append("p", "wake", Timestamp(1)).unwrap();
        });

        let started = std::time::Instant::now();
        let message = next_message(&mut sub);
        assert_eq!(message.content, "wake");
        assert!(started.elapsed() < Duration::from_millis(1_500));
        handle.join().unwrap();
    }
}
