//! Fire-and-forget audit log. Producers push onto a bounded queue that
//! drops its oldest entry when full; a writer task drains it into SQLite in
//! batches so logging never blocks or fails the control path.

use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::db::Db;

pub const EVENT_QUEUE_CAPACITY: usize = 5000;
const BATCH_SIZE: usize = 50;
const FLUSH_INTERVAL: Duration = Duration::from_millis(250);

// ---------------------------------------------------------------------------
// Bounded drop-oldest queue
// ---------------------------------------------------------------------------

/// Multi-producer queue with a fixed capacity. A push into a full queue
/// evicts the oldest item instead of waiting.
pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    ready: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            ready: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueue `item`. Returns `false` when an older item was evicted to
    /// make room or the queue is closed.
    pub fn push(&self, item: T) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let evicted = {
            let mut items = self.lock();
            let evicted = if items.len() >= self.capacity {
                items.pop_front();
                true
            } else {
                false
            };
            items.push_back(item);
            evicted
        };
        if evicted {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.ready.notify_one();
        !evicted
    }

    /// Remove up to `max` items from the front.
    pub fn drain(&self, max: usize) -> Vec<T> {
        let mut items = self.lock();
        let n = items.len().min(max);
        items.drain(..n).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Wait until at least one item is queued or the queue is closed.
    pub async fn wait(&self) {
        loop {
            if !self.is_empty() || self.is_closed() {
                return;
            }
            self.ready.notified().await;
        }
    }

    /// Refuse further pushes and wake the consumer so it can drain and exit.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.ready.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// Audit events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: String,
    pub message: String,
    pub reason_code: Option<String>,
    pub profile_id: Option<String>,
    pub actor: Option<String>,
    pub payload: Option<Value>,
}

impl AuditEvent {
    pub fn new(kind: &str, message: impl Into<String>) -> Self {
        Self {
            ts: OffsetDateTime::now_utc(),
            kind: kind.to_string(),
            message: message.into(),
            reason_code: None,
            profile_id: None,
            actor: None,
            payload: None,
        }
    }

    pub fn reason(mut self, code: impl Into<String>) -> Self {
        self.reason_code = Some(code.into());
        self
    }

    pub fn profile(mut self, profile_id: Option<&str>) -> Self {
        self.profile_id = profile_id.map(str::to_string);
        self
    }

    pub fn actor(mut self, actor: &str) -> Self {
        self.actor = Some(actor.to_string());
        self
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Cloneable handle used by every producer of audit records.
#[derive(Clone)]
pub struct EventLog {
    queue: Arc<BoundedQueue<AuditEvent>>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::with_capacity(EVENT_QUEUE_CAPACITY)
    }
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            queue: Arc::new(BoundedQueue::new(capacity)),
        }
    }

    pub fn log(&self, event: AuditEvent) {
        debug!(kind = %event.kind, reason = ?event.reason_code, "{}", event.message);
        if !self.queue.push(event) && !self.queue.is_closed() {
            let dropped = self.queue.dropped();
            if dropped.is_power_of_two() {
                warn!(dropped, "audit queue full, dropping oldest events");
            }
        }
    }

    pub fn close(&self) {
        self.queue.close();
    }

    /// Events still waiting for the writer.
    #[cfg(test)]
    pub fn pending(&self) -> Vec<AuditEvent> {
        self.queue.lock().iter().cloned().collect()
    }

    /// Drain the queue into `db` until the log is closed and empty.
    pub async fn run_writer(self, db: Db) {
        loop {
            self.queue.wait().await;
            if self.queue.is_closed() && self.queue.is_empty() {
                break;
            }
            // Let a burst accumulate into one transaction.
            if self.queue.len() < BATCH_SIZE && !self.queue.is_closed() {
                tokio::time::sleep(FLUSH_INTERVAL).await;
            }
            let batch = self.queue.drain(BATCH_SIZE);
            if batch.is_empty() {
                continue;
            }
            if let Err(e) = db.insert_events(&batch).await {
                warn!(count = batch.len(), "audit batch lost: {e:#}");
            }
        }
        debug!("audit writer stopped");
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- BoundedQueue -------------------------------------------------------

    #[test]
    fn queue_drops_oldest_when_full() {
        let q = BoundedQueue::new(3);
        for i in 0..5 {
            q.push(i);
        }
        assert_eq!(q.drain(10), vec![2, 3, 4]);
        assert_eq!(q.dropped(), 2);
    }

    #[test]
    fn queue_push_reports_eviction() {
        let q = BoundedQueue::new(1);
        assert!(q.push("a"));
        assert!(!q.push("b"));
        assert_eq!(q.drain(1), vec!["b"]);
    }

    #[test]
    fn closed_queue_refuses_pushes() {
        let q = BoundedQueue::new(4);
        q.close();
        assert!(!q.push(1));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn wait_returns_after_close() {
        let q = Arc::new(BoundedQueue::<u8>::new(4));
        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.wait().await })
        };
        q.close();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    // -- EventLog -----------------------------------------------------------

    #[test]
    fn builder_fills_optional_columns() {
        let ev = AuditEvent::new("alert", "too hot")
            .reason("temp_hard_high:breach")
            .actor("safety")
            .profile(Some("basil"))
            .payload(serde_json::json!({"temp_c": 41.0}));
        assert_eq!(ev.reason_code.as_deref(), Some("temp_hard_high:breach"));
        assert_eq!(ev.actor.as_deref(), Some("safety"));
        assert_eq!(ev.profile_id.as_deref(), Some("basil"));
        assert_eq!(ev.payload.unwrap()["temp_c"], 41.0);
    }

    #[tokio::test]
    async fn writer_persists_and_exits_on_close() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();

        let log = EventLog::new();
        let writer = tokio::spawn(log.clone().run_writer(db.clone()));

        log.log(AuditEvent::new("profile_lifecycle", "start").reason("start"));
        log.log(AuditEvent::new("profile_lifecycle", "stop").reason("stop"));
        log.close();

        tokio::time::timeout(Duration::from_secs(5), writer)
            .await
            .unwrap()
            .unwrap();

        let rows = db.recent_events(10).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].message, "stop");
    }
}
