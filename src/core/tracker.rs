use crate::database::models::ScanState;
use crate::source::SourceItem;
use chrono::DateTime;
use std::collections::HashMap;

/// The subset of the current listing that needs (re)processing this run.
#[derive(Debug)]
pub struct WorkPlan {
    /// Items to fetch and hash, ascending by id so runs are reproducible.
    pub pending: Vec<SourceItem>,
    /// Items already processed and unchanged since.
    pub unchanged: usize,
}

/// Decides, per item, whether persisted state is still good or the item must
/// be fetched and hashed again.
pub struct ScanTracker;

impl ScanTracker {
    /// An item is pending when the store has no fingerprints for it (never
    /// processed, or a crash interrupted persistence) or when the source
    /// marker moved past the one recorded at last successful processing.
    pub fn plan(listing: Vec<SourceItem>, states: &HashMap<String, ScanState>) -> WorkPlan {
        let mut pending = Vec::new();
        let mut unchanged = 0;

        for item in listing {
            match states.get(&item.id) {
                None => pending.push(item),
                Some(state) if !state.fingerprinted => pending.push(item),
                Some(state) => {
                    if Self::marker_moved(state.modified_at.as_deref(), &item) {
                        pending.push(item);
                    } else {
                        unchanged += 1;
                    }
                }
            }
        }

        pending.sort_by(|a, b| a.id.cmp(&b.id));
        WorkPlan { pending, unchanged }
    }

    fn marker_moved(recorded: Option<&str>, item: &SourceItem) -> bool {
        let Some(recorded) = recorded else {
            return true;
        };
        match DateTime::parse_from_rfc3339(recorded) {
            Ok(at) => item.modified_at > at,
            Err(err) => {
                log::warn!(
                    "unparseable stored marker {:?} for {}: {}; reprocessing",
                    recorded,
                    item.id,
                    err
                );
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn item(id: &str, modified_minute: u32) -> SourceItem {
        SourceItem {
            id: id.to_string(),
            filename: format!("{}.jpg", id),
            mime_type: "image/jpeg".to_string(),
            capture_time: Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap(),
            modified_at: Utc
                .with_ymd_and_hms(2024, 1, 1, 10, modified_minute, 0)
                .unwrap(),
            thumbnail_ref: format!("thumb://{}", id),
        }
    }

    fn state(fingerprinted: bool, modified_at: Option<&str>) -> ScanState {
        ScanState {
            fingerprinted,
            modified_at: modified_at.map(|s| s.to_string()),
        }
    }

    #[test]
    fn test_unknown_items_are_pending() {
        let plan = ScanTracker::plan(vec![item("a", 0)], &HashMap::new());
        assert_eq!(plan.pending.len(), 1);
        assert_eq!(plan.unchanged, 0);
    }

    #[test]
    fn test_unchanged_items_are_skipped() {
        let mut states = HashMap::new();
        states.insert(
            "a".to_string(),
            state(true, Some("2024-01-01T10:00:00+00:00")),
        );

        let plan = ScanTracker::plan(vec![item("a", 0)], &states);
        assert!(plan.pending.is_empty());
        assert_eq!(plan.unchanged, 1);
    }

    #[test]
    fn test_newer_marker_forces_reprocessing() {
        let mut states = HashMap::new();
        states.insert(
            "a".to_string(),
            state(true, Some("2024-01-01T10:00:00+00:00")),
        );

        let plan = ScanTracker::plan(vec![item("a", 30)], &states);
        assert_eq!(plan.pending.len(), 1);
    }

    #[test]
    fn test_record_without_fingerprints_is_pending() {
        // A crash between hashing and persistence leaves metadata without
        // fingerprints; the item must come back.
        let mut states = HashMap::new();
        states.insert("a".to_string(), state(false, None));

        let plan = ScanTracker::plan(vec![item("a", 0)], &states);
        assert_eq!(plan.pending.len(), 1);
    }

    #[test]
    fn test_garbled_marker_is_reprocessed() {
        let mut states = HashMap::new();
        states.insert("a".to_string(), state(true, Some("not-a-timestamp")));

        let plan = ScanTracker::plan(vec![item("a", 0)], &states);
        assert_eq!(plan.pending.len(), 1);
    }

    #[test]
    fn test_pending_order_is_deterministic() {
        let plan = ScanTracker::plan(
            vec![item("c", 0), item("a", 0), item("b", 0)],
            &HashMap::new(),
        );
        let ids: Vec<_> = plan.pending.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }
}
