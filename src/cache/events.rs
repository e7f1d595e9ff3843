//! Invalidation event queue.
//!
//! Push events from the content source land here and are drained in batches
//! by the [`PurgeConsumer`](super::consumer::PurgeConsumer).

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::{counter, gauge};
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use super::lock::mutex_lock;

const SOURCE: &str = "cache::events";
const METRIC_EVENT_QUEUE_LEN: &str = "quire_cache_event_queue_len";
const METRIC_EVENT_DROPPED_TOTAL: &str = "quire_cache_event_dropped_total";

/// Monotonic epoch for ordering events within this process.
pub type Epoch = u64;

/// One upstream content change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationEvent {
    /// Upstream event id, or a generated UUIDv4 when none was sent.
    pub id: String,
    pub epoch: Epoch,
    /// Sync tags whose content changed.
    pub tags: Vec<String>,
    pub received_at: OffsetDateTime,
}

impl InvalidationEvent {
    pub fn new(tags: Vec<String>, id: Option<String>, epoch: Epoch) -> Self {
        Self {
            id: id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            epoch,
            tags,
            received_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Bounded in-memory FIFO of invalidation events.
///
/// Contention is low (one listener, one consumer), so a mutex is enough.
pub struct EventQueue {
    queue: Mutex<VecDeque<InvalidationEvent>>,
    epoch_counter: AtomicU64,
    limit: usize,
}

impl EventQueue {
    /// Queue holding at most `limit` pending events.
    pub fn new(limit: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            epoch_counter: AtomicU64::new(0),
            limit: limit.max(1),
        }
    }

    pub fn next_epoch(&self) -> Epoch {
        self.epoch_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Enqueue an event; returns false when the queue is full and it was dropped.
    pub fn publish(&self, tags: Vec<String>, id: Option<String>) -> bool {
        let event = InvalidationEvent::new(tags, id, self.next_epoch());
        let mut queue = mutex_lock(&self.queue, SOURCE, "publish");

        if queue.len() >= self.limit {
            counter!(METRIC_EVENT_DROPPED_TOTAL).increment(1);
            warn!(
                event_id = %event.id,
                limit = self.limit,
                "Invalidation queue full, dropping event"
            );
            return false;
        }

        info!(
            event_id = %event.id,
            event_epoch = event.epoch,
            tag_count = event.tags.len(),
            "Invalidation event enqueued"
        );
        queue.push_back(event);
        gauge!(METRIC_EVENT_QUEUE_LEN).set(queue.len() as f64);
        true
    }

    /// Drain up to `limit` events in FIFO order.
    pub fn drain(&self, limit: usize) -> Vec<InvalidationEvent> {
        let mut queue = mutex_lock(&self.queue, SOURCE, "drain");
        let count = limit.min(queue.len());
        let events = queue.drain(..count).collect();
        gauge!(METRIC_EVENT_QUEUE_LEN).set(queue.len() as f64);
        events
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.queue, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
