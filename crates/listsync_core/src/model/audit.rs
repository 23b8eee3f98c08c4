//! Append-only audit records.
//!
//! # Invariants
//! - Records are never mutated after append.
//! - `before`/`after` carry item payloads, not whole rows.

use crate::model::item::{ItemState, Side};
use serde::{Deserialize, Serialize};

/// Operation recorded in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    Added,
    Updated,
    ConflictResolved,
    Removed,
    AmbiguousMatch,
    Linked,
}

impl AuditKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Updated => "updated",
            Self::ConflictResolved => "conflict_resolved",
            Self::Removed => "removed",
            Self::AmbiguousMatch => "ambiguous_match",
            Self::Linked => "linked",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "added" => Some(Self::Added),
            "updated" => Some(Self::Updated),
            "conflict_resolved" => Some(Self::ConflictResolved),
            "removed" => Some(Self::Removed),
            "ambiguous_match" => Some(Self::AmbiguousMatch),
            "linked" => Some(Self::Linked),
            _ => None,
        }
    }
}

/// Payload snapshot stored in `before`/`after`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AuditPayload {
    /// One item's synced state.
    Item(ItemState),
    /// Both sides of a link, captured before a resolution.
    Pair { a: ItemState, b: ItemState },
    /// Candidate ids of an ambiguous match.
    Candidates { candidate_ids: Vec<String>, score: f64 },
}

/// One audit row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub cycle_id: String,
    pub kind: AuditKind,
    pub side: Option<Side>,
    pub item_id: Option<String>,
    pub counterpart_item_id: Option<String>,
    pub link_id: Option<String>,
    pub before: Option<AuditPayload>,
    pub after: Option<AuditPayload>,
    pub created_at: i64,
}

impl AuditRecord {
    pub fn new(cycle_id: impl Into<String>, kind: AuditKind, created_at: i64) -> Self {
        Self {
            cycle_id: cycle_id.into(),
            kind,
            side: None,
            item_id: None,
            counterpart_item_id: None,
            link_id: None,
            before: None,
            after: None,
            created_at,
        }
    }

    pub fn for_item(mut self, side: Side, item_id: impl Into<String>) -> Self {
        self.side = Some(side);
        self.item_id = Some(item_id.into());
        self
    }

    pub fn with_counterpart(mut self, item_id: impl Into<String>) -> Self {
        self.counterpart_item_id = Some(item_id.into());
        self
    }

    pub fn with_link(mut self, link_id: impl Into<String>) -> Self {
        self.link_id = Some(link_id.into());
        self
    }

    pub fn with_before(mut self, payload: AuditPayload) -> Self {
        self.before = Some(payload);
        self
    }

    pub fn with_after(mut self, payload: AuditPayload) -> Self {
        self.after = Some(payload);
        self
    }
}
