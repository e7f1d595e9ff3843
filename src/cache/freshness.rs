//! Stale-while-revalidate freshness classification.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Classification of a stored entry at read time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// `age <= max_age`: serve as a hit.
    Fresh,
    /// `max_age < age <= max_age + swr`: serve, then revalidate in the background.
    Stale,
    /// Past the stale window: treat as a miss.
    Expired,
}

/// Classify an entry of `age` seconds. Both window bounds are inclusive.
pub fn classify(age: u64, max_age: u64, stale_while_revalidate: u64) -> Freshness {
    if age <= max_age {
        Freshness::Fresh
    } else if age <= max_age.saturating_add(stale_while_revalidate) {
        Freshness::Stale
    } else {
        Freshness::Expired
    }
}

/// Out-of-band timing metadata stored next to every entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryTiming {
    /// Unix timestamp of the write, in milliseconds.
    pub stored_at_ms: i64,
    pub max_age: u64,
    pub stale_while_revalidate: u64,
}

impl EntryTiming {
    pub fn new(stored_at: OffsetDateTime, max_age: u64, stale_while_revalidate: u64) -> Self {
        Self {
            stored_at_ms: unix_millis(stored_at),
            max_age,
            stale_while_revalidate,
        }
    }

    /// Whole seconds elapsed since the write, or `None` when the timestamp is
    /// unusable.
    pub fn age_secs(&self, now: OffsetDateTime) -> Option<u64> {
        if self.stored_at_ms <= 0 {
            return None;
        }
        let elapsed_ms = unix_millis(now).saturating_sub(self.stored_at_ms).max(0);
        Some((elapsed_ms / 1000) as u64)
    }

    /// Classify against `now`, returning the age alongside. `None` reads as a miss.
    pub fn evaluate(&self, now: OffsetDateTime) -> Option<(Freshness, u64)> {
        let age = self.age_secs(now)?;
        Some((
            classify(age, self.max_age, self.stale_while_revalidate),
            age,
        ))
    }

    /// How long the store needs to keep the entry around.
    ///
    /// Ages are floored to whole seconds, so an entry still classifies as
    /// stale until a full second past `max_age + swr`.
    pub fn ttl_hint(&self) -> Duration {
        Duration::from_secs(
            self.max_age
                .saturating_add(self.stale_while_revalidate)
                .saturating_add(1),
        )
    }
}

fn unix_millis(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}
