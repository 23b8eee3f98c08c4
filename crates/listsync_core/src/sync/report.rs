//! Cycle outcome and persisted status views.
//!
//! # Responsibility
//! - Describe what a cycle did (or would do, under dry-run).
//! - Carry enough per-failure context for manual remediation.
//! - Summarise persisted state for status queries.

use crate::model::item::{ItemPatch, RemoteItem, Side};
use crate::repo::cycle_repo::{CycleRepository, SqliteCycleRepository};
use crate::repo::item_repo::{RepoResult, SourceItemRepository, SqliteSourceItemRepository};
use crate::repo::link_repo::{LinkRepository, SqliteLinkRepository};
use crate::sync::resolver::ResolutionClass;
use crate::sync::source::{SourceError, SourceErrorKind};
use rusqlite::Connection;

/// Failure class reported per item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleErrorKind {
    /// Network or timeout failure that outlived its retries.
    TransientNetwork,
    /// Credentials rejected; external re-auth required.
    Authentication,
    /// Remote refused the mutation for this item.
    PartialApply,
    /// Remote does not offer the operation.
    Unsupported,
    /// Listed item could not be identified and was left out of the cycle.
    MalformedItem,
}

impl CycleErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TransientNetwork => "transient_network",
            Self::Authentication => "authentication",
            Self::PartialApply => "partial_apply",
            Self::Unsupported => "unsupported",
            Self::MalformedItem => "malformed_item",
        }
    }
}

impl From<SourceErrorKind> for CycleErrorKind {
    fn from(value: SourceErrorKind) -> Self {
        match value {
            SourceErrorKind::Transient | SourceErrorKind::Timeout => Self::TransientNetwork,
            SourceErrorKind::Authentication => Self::Authentication,
            SourceErrorKind::Rejected => Self::PartialApply,
            SourceErrorKind::Unsupported => Self::Unsupported,
        }
    }
}

/// One failed Apply step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleError {
    /// Side whose remote call failed.
    pub side: Side,
    pub source_id: String,
    pub source_local_id: Option<String>,
    pub display_name: Option<String>,
    pub kind: CycleErrorKind,
    pub operation: &'static str,
    pub message: String,
}

impl CycleError {
    pub fn from_source(
        side: Side,
        operation: &'static str,
        source_local_id: Option<&str>,
        display_name: Option<&str>,
        error: &SourceError,
    ) -> Self {
        Self {
            side,
            source_id: error.source_id.clone(),
            source_local_id: source_local_id.map(str::to_string),
            display_name: display_name.map(str::to_string),
            kind: error.kind.into(),
            operation,
            message: error.message.clone(),
        }
    }

    /// A listed item the detector refused; it is skipped every cycle until
    /// the source fixes it.
    pub fn malformed(side: Side, source_id: &str, item: &RemoteItem) -> Self {
        Self {
            side,
            source_id: source_id.to_string(),
            source_local_id: None,
            display_name: Some(item.display_name.clone()),
            kind: CycleErrorKind::MalformedItem,
            operation: "list_items",
            message: "listed item has a blank source_local_id".to_string(),
        }
    }
}

/// One remote mutation a cycle performs, or would perform under dry-run.
#[derive(Debug, Clone, PartialEq)]
pub enum PlannedMutation {
    /// Copy an unmatched item to the other side.
    Create {
        target: Side,
        origin_item_id: String,
        display_name: String,
        checked: bool,
    },
    /// Bring a linked item in line with its counterpart.
    Update {
        target: Side,
        item_id: String,
        patch: ItemPatch,
        class: ResolutionClass,
    },
    /// Hard delete the counterpart of a removed item.
    Delete { target: Side, item_id: String },
    /// Fallback for a counterpart that cannot hard delete.
    Complete { target: Side, item_id: String },
    /// Counterpart is left alone; only the link goes.
    DropLinkOnly {
        removed_side: Side,
        removed_item_id: String,
        counterpart_item_id: String,
    },
}

impl PlannedMutation {
    pub fn operation(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create_item",
            Self::Update { .. } => "update_item",
            Self::Delete { .. } => "delete_item",
            Self::Complete { .. } => "complete_item",
            Self::DropLinkOnly { .. } => "drop_link",
        }
    }

    /// Side receiving a remote call, if any.
    pub fn target(&self) -> Option<Side> {
        match self {
            Self::Create { target, .. }
            | Self::Update { target, .. }
            | Self::Delete { target, .. }
            | Self::Complete { target, .. } => Some(*target),
            Self::DropLinkOnly { .. } => None,
        }
    }
}

/// Outcome of one `run_cycle` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub cycle_id: String,
    /// List pair the cycle reconciled.
    pub pair_id: String,
    pub dry_run: bool,
    pub started_at: i64,
    pub finished_at: i64,
    /// Items created on the counterpart side.
    pub added: u32,
    /// One-sided changes propagated.
    pub updated: u32,
    pub conflicts_resolved: u32,
    /// Removals propagated to the counterpart side.
    pub removed: u32,
    pub links_created: u32,
    /// Deferred matches reported this cycle.
    pub ambiguous: u32,
    /// Every mutation attempted, or planned under dry-run.
    pub planned: Vec<PlannedMutation>,
    pub errors: Vec<CycleError>,
    /// Apply steps not attempted after cancellation or an auth failure.
    pub skipped: u32,
    pub cancelled: bool,
    pub aborted: bool,
}

impl CycleReport {
    /// True when the cycle found nothing to do.
    pub fn is_empty(&self) -> bool {
        self.added == 0
            && self.updated == 0
            && self.conflicts_resolved == 0
            && self.removed == 0
            && self.links_created == 0
            && self.ambiguous == 0
            && self.planned.is_empty()
            && self.errors.is_empty()
            && self.skipped == 0
    }

    pub fn error_count(&self) -> u32 {
        u32::try_from(self.errors.len()).unwrap_or(u32::MAX)
    }
}

/// Health summary for the surrounding daemon or CLI.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncStatus {
    /// Finish time of the last committed live cycle.
    pub last_cycle_at: Option<i64>,
    /// Errors reported by the last committed live cycle.
    pub pending_error_count: u32,
    /// Share of active items that are linked, in `[0.0, 1.0]`.
    pub link_coverage_ratio: f64,
    /// Cycles aborted in a row since the last success.
    pub consecutive_failures: u32,
    /// Earliest time the next attempt should run after a failure.
    pub next_retry_at: Option<i64>,
}

impl SyncStatus {
    /// Reads the persisted status of one list pair from a store.
    pub fn load(conn: &Connection, pair_id: &str) -> RepoResult<Self> {
        let latest = SqliteCycleRepository::for_pair(conn, pair_id).latest_cycle()?;
        let links = SqliteLinkRepository::for_pair(conn, pair_id).count_links()?;
        let active = SqliteSourceItemRepository::for_pair(conn, pair_id).count_active_items()?;

        Ok(Self {
            last_cycle_at: latest.as_ref().map(|cycle| cycle.finished_at),
            pending_error_count: latest.map_or(0, |cycle| cycle.error_count),
            link_coverage_ratio: coverage_ratio(links, active),
            consecutive_failures: 0,
            next_retry_at: None,
        })
    }
}

fn coverage_ratio(links: u64, active_items: u64) -> f64 {
    if active_items == 0 {
        return 0.0;
    }
    ((2 * links) as f64 / active_items as f64).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::{coverage_ratio, CycleErrorKind, CycleReport, PlannedMutation};
    use crate::model::item::Side;
    use crate::sync::source::SourceErrorKind;

    #[test]
    fn default_report_is_empty() {
        assert!(CycleReport::default().is_empty());
    }

    #[test]
    fn planned_mutation_makes_report_non_empty() {
        let report = CycleReport {
            planned: vec![PlannedMutation::Delete {
                target: Side::B,
                item_id: "b1".to_string(),
            }],
            ..CycleReport::default()
        };
        assert!(!report.is_empty());
    }

    #[test]
    fn source_kinds_map_to_report_taxonomy() {
        assert_eq!(
            CycleErrorKind::from(SourceErrorKind::Timeout),
            CycleErrorKind::TransientNetwork
        );
        assert_eq!(
            CycleErrorKind::from(SourceErrorKind::Rejected),
            CycleErrorKind::PartialApply
        );
        assert_eq!(
            CycleErrorKind::from(SourceErrorKind::Authentication),
            CycleErrorKind::Authentication
        );
    }

    #[test]
    fn coverage_ratio_counts_both_ends_of_a_link() {
        assert!((coverage_ratio(0, 0) - 0.0).abs() < f64::EPSILON);
        assert!((coverage_ratio(2, 4) - 1.0).abs() < f64::EPSILON);
        assert!((coverage_ratio(1, 4) - 0.5).abs() < f64::EPSILON);
    }
}
