//! Tracked fire-and-forget tasks.
//!
//! Work spawned here never blocks the response that scheduled it. The owner
//! of the request joins the whole set once the response is finalized, so a
//! write is only lost if the runtime itself shuts down first.

use std::future::Future;
use std::sync::{Arc, Mutex};

use metrics::counter;
use tokio::task::JoinHandle;
use tracing::warn;

use super::lock::mutex_lock;

const SOURCE: &str = "cache::background";
const METRIC_BACKGROUND_FAILED_TOTAL: &str = "quire_cache_background_failed_total";

/// Set of background tasks scheduled during one request.
#[derive(Clone, Default)]
pub struct BackgroundTasks {
    handles: Arc<Mutex<Vec<(&'static str, JoinHandle<()>)>>>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `task` without awaiting it.
    pub fn spawn<F>(&self, label: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        mutex_lock(&self.handles, SOURCE, "spawn").push((label, handle));
    }

    /// Number of tasks not yet joined.
    pub fn pending(&self) -> usize {
        mutex_lock(&self.handles, SOURCE, "pending").len()
    }

    /// Await every task spawned so far, including ones spawned while joining.
    ///
    /// Returns how many tasks were joined. Panicked or cancelled tasks are
    /// logged and counted, never propagated.
    pub async fn join_all(&self) -> usize {
        let mut joined = 0;
        loop {
            let batch = std::mem::take(&mut *mutex_lock(&self.handles, SOURCE, "join_all"));
            if batch.is_empty() {
                return joined;
            }
            for (label, handle) in batch {
                joined += 1;
                if let Err(err) = handle.await {
                    counter!(METRIC_BACKGROUND_FAILED_TOTAL, "task" => label).increment(1);
                    warn!(task = label, error = %err, "Background cache task failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn join_all_waits_for_spawned_tasks() {
        let tasks = BackgroundTasks::new();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let counter = counter.clone();
            tasks.spawn("increment", async move {
                tokio::task::yield_now().await;
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert_eq!(tasks.pending(), 3);
        assert_eq!(tasks.join_all().await, 3);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(tasks.pending(), 0);
    }

    #[tokio::test]
    async fn join_all_absorbs_panics() {
        let tasks = BackgroundTasks::new();
        tasks.spawn("boom", async {
            panic!("background failure");
        });
        assert_eq!(tasks.join_all().await, 1);
    }

    #[tokio::test]
    async fn join_all_picks_up_nested_spawns() {
        let tasks = BackgroundTasks::new();
        let nested = tasks.clone();
        let counter = Arc::new(AtomicUsize::new(0));
        let inner_counter = counter.clone();

        tasks.spawn("outer", async move {
            nested.spawn("inner", async move {
                inner_counter.fetch_add(1, Ordering::SeqCst);
            });
        });

        assert_eq!(tasks.join_all().await, 2);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_set_joins_immediately() {
        assert_eq!(BackgroundTasks::new().join_all().await, 0);
    }
}
