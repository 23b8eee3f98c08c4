//! Source item model.
//!
//! # Responsibility
//! - Mirror one item as last observed from one source.
//! - Carry both native and synthetic modification times.
//!
//! # Invariants
//! - `source_local_id` and `list_ref` are non-empty.
//! - `synthetic_modified_at` only moves when the payload changed.
//! - `last_seen_at` is bumped on every observation.
//! - `ever_linked` never goes back to false once set.

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// One of the two reconciled sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    A,
    B,
}

impl Side {
    /// Stable value used in storage and config.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::A => "a",
            Self::B => "b",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "a" | "A" => Some(Self::A),
            "b" | "B" => Some(Self::B),
            _ => None,
        }
    }

    /// Returns the counterpart side.
    pub fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }
}

impl Display for Side {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Item as reported by a collaborator's `list_items` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteItem {
    pub source_local_id: String,
    pub display_name: String,
    pub checked: bool,
    /// Unix epoch milliseconds, only when the source tracks it.
    pub native_modified_at: Option<i64>,
}

impl RemoteItem {
    pub fn new(
        source_local_id: impl Into<String>,
        display_name: impl Into<String>,
        checked: bool,
    ) -> Self {
        Self {
            source_local_id: source_local_id.into(),
            display_name: display_name.into(),
            checked,
            native_modified_at: None,
        }
    }

    pub fn with_native_modified_at(mut self, modified_at: i64) -> Self {
        self.native_modified_at = Some(modified_at);
        self
    }
}

/// The synced payload of an item: name plus completion flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemState {
    pub display_name: String,
    pub checked: bool,
}

/// Partial update sent to a collaborator. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemPatch {
    pub display_name: Option<String>,
    pub checked: Option<bool>,
}

impl ItemPatch {
    pub fn checked(checked: bool) -> Self {
        Self {
            display_name: None,
            checked: Some(checked),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.display_name.is_none() && self.checked.is_none()
    }

    /// Applies this patch on top of `state`.
    pub fn apply_to(&self, state: &ItemState) -> ItemState {
        ItemState {
            display_name: self
                .display_name
                .clone()
                .unwrap_or_else(|| state.display_name.clone()),
            checked: self.checked.unwrap_or(state.checked),
        }
    }
}

/// Local mirror of one item as last observed from one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceItem {
    pub side: Side,
    pub source_local_id: String,
    pub list_ref: String,
    pub display_name: String,
    pub checked: bool,
    pub native_modified_at: Option<i64>,
    /// Locally assigned change marker; see `sync::detector`.
    pub synthetic_modified_at: i64,
    pub last_seen_at: i64,
    /// Tombstone: gone from the source, or soft-completed in its place.
    pub deleted: bool,
    /// Set once the item joins a link. An unlinked item with this flag lost
    /// its link on purpose and is not copied across again.
    pub ever_linked: bool,
}

impl SourceItem {
    /// Builds the first observation of a remote item.
    pub fn observed(side: Side, list_ref: impl Into<String>, remote: &RemoteItem, now: i64) -> Self {
        Self {
            side,
            source_local_id: remote.source_local_id.clone(),
            list_ref: list_ref.into(),
            display_name: remote.display_name.clone(),
            checked: remote.checked,
            native_modified_at: remote.native_modified_at,
            synthetic_modified_at: now,
            last_seen_at: now,
            deleted: false,
            ever_linked: false,
        }
    }

    pub fn state(&self) -> ItemState {
        ItemState {
            display_name: self.display_name.clone(),
            checked: self.checked,
        }
    }

    /// Best available modification time: native when the source has one.
    pub fn effective_modified_at(&self) -> i64 {
        self.native_modified_at.unwrap_or(self.synthetic_modified_at)
    }

    /// Returns whether name or completion differ from `remote`.
    pub fn payload_differs(&self, remote: &RemoteItem) -> bool {
        self.display_name != remote.display_name || self.checked != remote.checked
    }

    pub fn is_active(&self) -> bool {
        !self.deleted
    }

    pub fn validate(&self) -> Result<(), ItemValidationError> {
        if self.source_local_id.trim().is_empty() {
            return Err(ItemValidationError::EmptySourceLocalId);
        }
        if self.list_ref.trim().is_empty() {
            return Err(ItemValidationError::EmptyListRef {
                source_local_id: self.source_local_id.clone(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemValidationError {
    EmptySourceLocalId,
    EmptyListRef { source_local_id: String },
}

impl Display for ItemValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptySourceLocalId => write!(f, "source_local_id must not be empty"),
            Self::EmptyListRef { source_local_id } => {
                write!(f, "list_ref must not be empty for item {source_local_id}")
            }
        }
    }
}

impl Error for ItemValidationError {}
