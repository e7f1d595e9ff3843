//! Invalidation consumer.
//!
//! Drains the event queue and runs the resulting purge.

use std::sync::Arc;
use std::time::Instant;

use metrics::histogram;
use time::OffsetDateTime;
use tracing::{debug, info, instrument};

use super::events::EventQueue;
use super::planner::PurgePlan;
use super::purge::{PurgeCoordinator, PurgeReport};

const METRIC_CACHE_CONSUME_MS: &str = "quire_cache_consume_ms";
const METRIC_EVENT_LAG_MS: &str = "quire_cache_event_lag_ms";

/// Consumer turning queued events into tag purges.
///
/// Each call:
/// 1. Drains up to `batch_limit` events
/// 2. Merges them into a [`PurgePlan`]
/// 3. Purges the plan's tags from both indexes
#[derive(Clone)]
pub struct PurgeConsumer {
    queue: Arc<EventQueue>,
    coordinator: PurgeCoordinator,
    batch_limit: usize,
}

impl PurgeConsumer {
    pub fn new(queue: Arc<EventQueue>, coordinator: PurgeCoordinator, batch_limit: usize) -> Self {
        Self {
            queue,
            coordinator,
            batch_limit: batch_limit.max(1),
        }
    }

    /// Consume one batch. Returns the report, or `None` when nothing was queued.
    #[instrument(skip(self))]
    pub async fn consume(&self) -> Option<PurgeReport> {
        let started = Instant::now();
        let events = self.queue.drain(self.batch_limit);
        if events.is_empty() {
            return None;
        }

        let event_count = events.len();
        // Time the oldest event in the batch spent queued.
        let lag_ms = events
            .iter()
            .map(|event| event.received_at)
            .min()
            .map(|oldest| {
                let waited = OffsetDateTime::now_utc() - oldest;
                waited.whole_milliseconds().max(0) as f64
            });
        if let Some(lag_ms) = lag_ms {
            histogram!(METRIC_EVENT_LAG_MS).record(lag_ms);
        }
        let plan = PurgePlan::from_events(events);
        info!(
            event_count,
            lag_ms = lag_ms.unwrap_or_default(),
            event_ids = ?plan.event_ids,
            plan = %plan,
            "Invalidation consumption starting"
        );

        let report = if plan.is_empty() {
            debug!("No tags to purge in batch");
            PurgeReport::default()
        } else {
            self.coordinator.purge_by_tags(&plan.tags).await
        };

        histogram!(METRIC_CACHE_CONSUME_MS).record(started.elapsed().as_secs_f64() * 1000.0);
        info!(
            event_count,
            purged_tags = report.purged_tags.len(),
            "Invalidation consumption complete"
        );
        Some(report)
    }

    /// Consume batches until the queue is empty; returns how many ran.
    pub async fn consume_all(&self) -> usize {
        let mut batches = 0;
        while self.consume().await.is_some() {
            batches += 1;
        }
        batches
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }
}
