//! Snapshot diffing and synthetic modification times.
//!
//! # Responsibility
//! - Classify a freshly fetched snapshot against the stored one, keyed by
//!   `source_local_id`.
//! - Assign approximate modification times for sources without them.
//!
//! # Invariants
//! - `synthetic_modified_at` moves to `now` only on Added/Changed; Unchanged
//!   items keep their prior value.
//! - `last_seen_at` moves to `now` for every observed item.
//! - Only name and completion participate in Changed; a native timestamp
//!   bump alone is stored silently.
//! - A tombstoned item still listed by its source stays dormant until its
//!   payload changes; then it is Added again.
//! - A listed item with a blank id is rejected, never classified.
//!
//! # Operator note
//! Synthetic times record when a change was *observed*, not when it was
//! made. Two edits to one item inside a single poll interval cannot be
//! ordered, and an observed edit always looks at least as recent as any
//! native edit made during the same interval. Ties fall back to the
//! configured authority side. Shorten the poll interval to narrow the window.

use crate::model::item::{RemoteItem, Side, SourceItem};
use log::warn;
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Added,
    Changed,
    Removed,
    Unchanged,
}

/// Derives "last observed change" markers from cycle-over-cycle diffing.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyntheticClock;

impl SyntheticClock {
    /// Returns the synthetic time an item carries after this cycle.
    pub fn stamp(previous: Option<&SourceItem>, kind: ChangeKind, now: i64) -> i64 {
        match (kind, previous) {
            (ChangeKind::Unchanged | ChangeKind::Removed, Some(prev)) => prev.synthetic_modified_at,
            _ => now,
        }
    }
}

/// Result of diffing one side.
#[derive(Debug, Clone, Default)]
pub struct SnapshotDiff {
    pub added: Vec<SourceItem>,
    /// `(stored, observed)` pairs.
    pub changed: Vec<(SourceItem, SourceItem)>,
    /// Stored items absent from the fetch, as last stored.
    pub removed: Vec<SourceItem>,
    pub unchanged: Vec<SourceItem>,
    /// Tombstoned items still listed unchanged (soft-completed in place).
    pub dormant: Vec<SourceItem>,
    /// Listed items without a usable id; never planned or stored.
    pub rejected: Vec<RemoteItem>,
    kinds: HashMap<String, ChangeKind>,
}

impl SnapshotDiff {
    pub fn kind_of(&self, source_local_id: &str) -> Option<ChangeKind> {
        self.kinds.get(source_local_id).copied()
    }

    /// Returns whether the item was Added or Changed this cycle.
    pub fn touched(&self, source_local_id: &str) -> bool {
        matches!(
            self.kind_of(source_local_id),
            Some(ChangeKind::Added | ChangeKind::Changed)
        )
    }

    /// Items currently present on the source, with this cycle's times applied.
    pub fn observed(&self) -> impl Iterator<Item = &SourceItem> {
        self.added
            .iter()
            .chain(self.changed.iter().map(|(_, next)| next))
            .chain(self.unchanged.iter())
    }

    pub fn has_changes(&self) -> bool {
        !(self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty())
    }
}

/// Per-side change detector.
#[derive(Debug, Clone)]
pub struct ChangeDetector {
    side: Side,
    list_ref: String,
}

impl ChangeDetector {
    pub fn new(side: Side, list_ref: impl Into<String>) -> Self {
        Self {
            side,
            list_ref: list_ref.into(),
        }
    }

    /// Diffs `fetched` against `stored` (every stored item of this side,
    /// tombstones included).
    ///
    /// Output vectors are sorted by `source_local_id` for deterministic
    /// downstream processing.
    pub fn detect(&self, stored: &[SourceItem], fetched: &[RemoteItem], now: i64) -> SnapshotDiff {
        let stored_by_id: BTreeMap<&str, &SourceItem> = stored
            .iter()
            .filter(|item| item.side == self.side)
            .map(|item| (item.source_local_id.as_str(), item))
            .collect();

        let mut seen: HashSet<&str> = HashSet::new();
        let mut diff = SnapshotDiff::default();

        for remote in fetched {
            if remote.source_local_id.trim().is_empty() {
                warn!(
                    "event=malformed_remote_item module=sync status=warn side={} display_name={:?} reason=blank_source_local_id",
                    self.side, remote.display_name
                );
                diff.rejected.push(remote.clone());
                continue;
            }
            if !seen.insert(remote.source_local_id.as_str()) {
                warn!(
                    "event=duplicate_remote_id module=sync status=warn side={} source_local_id={}",
                    self.side, remote.source_local_id
                );
                continue;
            }

            match stored_by_id.get(remote.source_local_id.as_str()) {
                Some(previous) if !previous.is_active() && !previous.payload_differs(remote) => {
                    let mut item = (*previous).clone();
                    item.native_modified_at = remote.native_modified_at;
                    item.last_seen_at = now;
                    diff.dormant.push(item);
                }
                Some(previous) if !previous.is_active() => {
                    let mut item =
                        SourceItem::observed(self.side, self.list_ref.as_str(), remote, now);
                    item.ever_linked = previous.ever_linked;
                    diff.kinds
                        .insert(item.source_local_id.clone(), ChangeKind::Added);
                    diff.added.push(item);
                }
                None => {
                    let item = SourceItem::observed(self.side, self.list_ref.as_str(), remote, now);
                    diff.kinds
                        .insert(item.source_local_id.clone(), ChangeKind::Added);
                    diff.added.push(item);
                }
                Some(previous) => {
                    let kind = if previous.payload_differs(remote) {
                        ChangeKind::Changed
                    } else {
                        ChangeKind::Unchanged
                    };
                    let next = SourceItem {
                        side: self.side,
                        source_local_id: remote.source_local_id.clone(),
                        list_ref: self.list_ref.clone(),
                        display_name: remote.display_name.clone(),
                        checked: remote.checked,
                        native_modified_at: remote.native_modified_at,
                        synthetic_modified_at: SyntheticClock::stamp(Some(previous), kind, now),
                        last_seen_at: now,
                        deleted: false,
                        ever_linked: previous.ever_linked,
                    };
                    diff.kinds.insert(next.source_local_id.clone(), kind);
                    if kind == ChangeKind::Changed {
                        diff.changed.push(((*previous).clone(), next));
                    } else {
                        diff.unchanged.push(next);
                    }
                }
            }
        }

        for (id, previous) in &stored_by_id {
            if previous.is_active() && !seen.contains(id) {
                diff.kinds.insert((*id).to_string(), ChangeKind::Removed);
                diff.removed.push((*previous).clone());
            }
        }

        diff.added
            .sort_by(|left, right| left.source_local_id.cmp(&right.source_local_id));
        diff.changed
            .sort_by(|left, right| left.1.source_local_id.cmp(&right.1.source_local_id));
        diff.unchanged
            .sort_by(|left, right| left.source_local_id.cmp(&right.source_local_id));
        diff.dormant
            .sort_by(|left, right| left.source_local_id.cmp(&right.source_local_id));
        diff
    }
}

#[cfg(test)]
mod tests {
    use super::{ChangeDetector, ChangeKind, SyntheticClock};
    use crate::model::item::{RemoteItem, Side, SourceItem};

    fn stored(id: &str, name: &str, checked: bool, synthetic: i64) -> SourceItem {
        let mut item =
            SourceItem::observed(Side::A, "groceries", &RemoteItem::new(id, name, checked), synthetic);
        item.last_seen_at = synthetic;
        item
    }

    #[test]
    fn classifies_added_changed_removed_unchanged() {
        let detector = ChangeDetector::new(Side::A, "groceries");
        let stored = vec![
            stored("1", "Milk", false, 100),
            stored("2", "Eggs", false, 100),
            stored("3", "Bread", false, 100),
        ];
        let fetched = vec![
            RemoteItem::new("1", "Milk", false),
            RemoteItem::new("2", "Eggs", true),
            RemoteItem::new("4", "Butter", false),
        ];

        let diff = detector.detect(&stored, &fetched, 500);

        assert_eq!(diff.kind_of("1"), Some(ChangeKind::Unchanged));
        assert_eq!(diff.kind_of("2"), Some(ChangeKind::Changed));
        assert_eq!(diff.kind_of("3"), Some(ChangeKind::Removed));
        assert_eq!(diff.kind_of("4"), Some(ChangeKind::Added));
        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.changed.len(), 1);
        assert_eq!(diff.removed[0].source_local_id, "3");
        assert_eq!(diff.observed().count(), 3);
    }

    #[test]
    fn synthetic_time_moves_only_on_change() {
        let detector = ChangeDetector::new(Side::A, "groceries");
        let stored = vec![stored("1", "Milk", false, 100), stored("2", "Eggs", false, 100)];
        let fetched = vec![
            RemoteItem::new("1", "Milk", false),
            RemoteItem::new("2", "Eggs", true),
        ];

        let diff = detector.detect(&stored, &fetched, 900);

        let unchanged = &diff.unchanged[0];
        assert_eq!(unchanged.synthetic_modified_at, 100);
        assert_eq!(unchanged.last_seen_at, 900);

        let (_, changed) = &diff.changed[0];
        assert_eq!(changed.synthetic_modified_at, 900);
        assert_eq!(changed.last_seen_at, 900);
    }

    #[test]
    fn native_timestamp_bump_alone_is_unchanged() {
        let detector = ChangeDetector::new(Side::A, "groceries");
        let mut previous = stored("1", "Milk", false, 100);
        previous.native_modified_at = Some(10);
        let fetched = vec![RemoteItem::new("1", "Milk", false).with_native_modified_at(20)];

        let diff = detector.detect(&[previous], &fetched, 900);

        assert_eq!(diff.kind_of("1"), Some(ChangeKind::Unchanged));
        assert_eq!(diff.unchanged[0].native_modified_at, Some(20));
        assert!(!diff.has_changes());
    }

    #[test]
    fn tombstoned_item_that_reappears_changed_is_added() {
        let detector = ChangeDetector::new(Side::A, "groceries");
        let mut previous = stored("1", "Milk", true, 100);
        previous.deleted = true;

        let diff = detector.detect(&[previous], &[RemoteItem::new("1", "Milk", false)], 900);

        assert_eq!(diff.kind_of("1"), Some(ChangeKind::Added));
        assert!(!diff.added[0].deleted);
        assert_eq!(diff.added[0].synthetic_modified_at, 900);
    }

    #[test]
    fn soft_completed_item_stays_dormant() {
        let detector = ChangeDetector::new(Side::B, "groceries");
        let mut previous =
            SourceItem::observed(Side::B, "groceries", &RemoteItem::new("9", "Milk", true), 100);
        previous.deleted = true;

        let diff = detector.detect(&[previous], &[RemoteItem::new("9", "Milk", true)], 900);

        assert_eq!(diff.kind_of("9"), None);
        assert!(!diff.has_changes());
        assert_eq!(diff.observed().count(), 0);
        assert_eq!(diff.dormant.len(), 1);
        assert!(diff.dormant[0].deleted);
        assert_eq!(diff.dormant[0].last_seen_at, 900);
    }

    #[test]
    fn tombstoned_item_still_absent_is_not_removed_again() {
        let detector = ChangeDetector::new(Side::A, "groceries");
        let mut previous = stored("1", "Milk", false, 100);
        previous.deleted = true;

        let diff = detector.detect(&[previous], &[], 900);

        assert!(diff.removed.is_empty());
        assert!(!diff.has_changes());
    }

    #[test]
    fn duplicate_remote_ids_keep_first_occurrence() {
        let detector = ChangeDetector::new(Side::A, "groceries");
        let fetched = vec![
            RemoteItem::new("1", "Milk", false),
            RemoteItem::new("1", "Oat milk", true),
        ];

        let diff = detector.detect(&[], &fetched, 5);

        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.added[0].display_name, "Milk");
    }

    #[test]
    fn blank_remote_id_is_rejected_not_added() {
        let detector = ChangeDetector::new(Side::B, "shopping");
        let fetched = vec![
            RemoteItem::new(" ", "Bread", false),
            RemoteItem::new("", "Jam", false),
            RemoteItem::new("7", "Milk", false),
        ];

        let diff = detector.detect(&[], &fetched, 5);

        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.added[0].source_local_id, "7");
        assert_eq!(diff.rejected.len(), 2);
        assert_eq!(diff.rejected[0].display_name, "Bread");
        assert_eq!(diff.kind_of(" "), None);
        assert!(diff.observed().all(|item| item.validate().is_ok()));
    }

    #[test]
    fn link_history_survives_detection() {
        let detector = ChangeDetector::new(Side::A, "groceries");
        let mut linked = stored("1", "Milk", false, 100);
        linked.ever_linked = true;
        let mut gone = stored("2", "Eggs", false, 100);
        gone.ever_linked = true;
        gone.deleted = true;
        let fetched = vec![
            RemoteItem::new("1", "Milk", true),
            RemoteItem::new("2", "Eggs", true),
            RemoteItem::new("3", "Bread", false),
        ];

        let diff = detector.detect(&[linked, gone], &fetched, 900);

        assert!(diff.changed[0].1.ever_linked);
        let readded = diff.added.iter().find(|item| item.source_local_id == "2").unwrap();
        assert!(readded.ever_linked);
        let fresh = diff.added.iter().find(|item| item.source_local_id == "3").unwrap();
        assert!(!fresh.ever_linked);
    }

    #[test]
    fn stamp_keeps_prior_value_for_unchanged() {
        let previous = stored("1", "Milk", false, 77);
        assert_eq!(
            SyntheticClock::stamp(Some(&previous), ChangeKind::Unchanged, 1_000),
            77
        );
        assert_eq!(
            SyntheticClock::stamp(Some(&previous), ChangeKind::Changed, 1_000),
            1_000
        );
        assert_eq!(SyntheticClock::stamp(None, ChangeKind::Added, 1_000), 1_000);
    }
}
