//! Purge plan generation.
//!
//! Merges a batch of invalidation events into one tag set so a burst of
//! upstream changes costs a single purge.

use std::collections::HashSet;
use std::fmt;

use super::events::InvalidationEvent;

/// Tags to purge for one drained batch.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PurgePlan {
    /// Distinct non-empty tags, in first-seen order.
    pub tags: Vec<String>,
    /// Ids of the events folded into this plan, duplicates removed.
    pub event_ids: Vec<String>,
}

impl fmt::Display for PurgePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PurgePlan {{ events: {}, tags: {} }}",
            self.event_ids.len(),
            self.tags.len()
        )
    }
}

impl PurgePlan {
    /// Merge events, skipping repeated deliveries of the same event id.
    pub fn from_events(events: Vec<InvalidationEvent>) -> Self {
        let mut plan = Self::default();
        let mut seen_ids = HashSet::new();
        let mut seen_tags = HashSet::new();

        for event in events {
            if !seen_ids.insert(event.id.clone()) {
                continue;
            }
            plan.event_ids.push(event.id);
            for tag in event.tags {
                if !tag.is_empty() && seen_tags.insert(tag.clone()) {
                    plan.tags.push(tag);
                }
            }
        }

        plan
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str, tags: &[&str], epoch: u64) -> InvalidationEvent {
        InvalidationEvent::new(
            tags.iter().map(|t| t.to_string()).collect(),
            Some(id.to_string()),
            epoch,
        )
    }

    #[test]
    fn empty_events_empty_plan() {
        let plan = PurgePlan::from_events(vec![]);
        assert!(plan.is_empty());
        assert!(plan.event_ids.is_empty());
    }

    #[test]
    fn unions_tags_in_first_seen_order() {
        let plan = PurgePlan::from_events(vec![
            event("1", &["b", "a"], 0),
            event("2", &["a", "c", ""], 1),
        ]);
        assert_eq!(plan.tags, vec!["b", "a", "c"]);
        assert_eq!(plan.event_ids, vec!["1", "2"]);
    }

    #[test]
    fn dedupes_by_event_id() {
        let plan = PurgePlan::from_events(vec![
            event("1", &["a"], 0),
            event("1", &["ignored"], 1),
        ]);
        assert_eq!(plan.tags, vec!["a"]);
        assert_eq!(plan.event_ids, vec!["1"]);
    }

    #[test]
    fn events_without_tags_make_an_empty_plan() {
        let plan = PurgePlan::from_events(vec![event("1", &[""], 0)]);
        assert!(plan.is_empty());
        assert_eq!(plan.to_string(), "PurgePlan { events: 1, tags: 0 }");
    }
}
