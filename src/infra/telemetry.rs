use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "quire_query_cache_hit_total",
            Unit::Count,
            "Total number of query cache hits served fresh."
        );
        describe_counter!(
            "quire_query_cache_stale_total",
            Unit::Count,
            "Total number of stale query results served while revalidating."
        );
        describe_counter!(
            "quire_query_cache_miss_total",
            Unit::Count,
            "Total number of query cache misses fetched from the content source."
        );
        describe_counter!(
            "quire_query_cache_bypass_total",
            Unit::Count,
            "Total number of queries that skipped the cache entirely."
        );
        describe_counter!(
            "quire_query_cache_revalidate_failed_total",
            Unit::Count,
            "Total number of background revalidations that failed upstream."
        );
        describe_counter!(
            "quire_cache_store_error_total",
            Unit::Count,
            "Total number of cache store operations that failed and degraded to a miss."
        );
        describe_counter!(
            "quire_cache_store_evict_total",
            Unit::Count,
            "Total number of in-memory store evictions due to capacity."
        );
        describe_counter!(
            "quire_cache_background_failed_total",
            Unit::Count,
            "Total number of request background tasks that panicked or were cancelled."
        );
        describe_counter!(
            "quire_cache_purged_keys_total",
            Unit::Count,
            "Total number of cache keys and page URLs removed by tag purges."
        );
        describe_histogram!(
            "quire_cache_purge_ms",
            Unit::Milliseconds,
            "Tag purge latency in milliseconds."
        );
        describe_gauge!(
            "quire_cache_event_queue_len",
            Unit::Count,
            "Current number of pending invalidation events in the queue."
        );
        describe_counter!(
            "quire_cache_event_dropped_total",
            Unit::Count,
            "Total number of invalidation events dropped due to queue overflow."
        );
        describe_histogram!(
            "quire_cache_consume_ms",
            Unit::Milliseconds,
            "Invalidation consumption latency in milliseconds."
        );
        describe_counter!(
            "quire_events_stream_reconnect_total",
            Unit::Count,
            "Total number of push-event stream reconnects."
        );
    });
}
