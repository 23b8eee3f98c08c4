//! Source collaborator contract consumed by the reconciliation core.
//!
//! # Responsibility
//! - Describe the four remote operations the core needs from each source.
//! - Let each source declare whether it can hard delete.
//!
//! # Invariants
//! - Collaborators own authentication, HTTP, and session lifecycles.
//! - `list_items` returns every live item of the list; absence means removal.
//! - A collaborator without hard delete reports `DeleteCapability::Unsupported`
//!   and the core picks the configured fallback instead of calling
//!   `delete_item`.

use crate::model::item::{ItemPatch, RemoteItem};
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type SourceResult<T> = Result<T, SourceError>;

/// Failure class of a remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceErrorKind {
    /// Network-level failure; worth retrying.
    Transient,
    /// Call exceeded the configured timeout; its outcome is unknown, so only
    /// idempotent calls are retried.
    Timeout,
    /// Credentials rejected; needs external re-auth.
    Authentication,
    /// The remote refused this specific request.
    Rejected,
    /// Operation not offered by this source.
    Unsupported,
}

impl SourceErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Timeout => "timeout",
            Self::Authentication => "authentication",
            Self::Rejected => "rejected",
            Self::Unsupported => "unsupported",
        }
    }
}

/// Error envelope returned by collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceError {
    pub source_id: String,
    pub kind: SourceErrorKind,
    pub message: String,
}

impl SourceError {
    pub fn new(
        source_id: impl Into<String>,
        kind: SourceErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            kind,
            message: message.into(),
        }
    }

    pub fn transient(source_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(source_id, SourceErrorKind::Transient, message)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            SourceErrorKind::Transient | SourceErrorKind::Timeout
        )
    }
}

impl Display for SourceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} error from source `{}`: {}",
            self.kind.as_str(),
            self.source_id,
            self.message
        )
    }
}

impl Error for SourceError {}

/// Whether a source can remove items outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteCapability {
    HardDelete,
    Unsupported,
}

/// Outcome of a `delete_item` call that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    Unsupported,
}

/// Remote operations required from each source.
///
/// Implementations must be shareable across threads: the engine runs each
/// call on a worker thread to bound it with a timeout.
pub trait SourceCollaborator: Send + Sync {
    /// Stable lowercase id used in logs and errors.
    fn source_id(&self) -> &str;

    fn delete_capability(&self) -> DeleteCapability;

    fn list_items(&self, list_ref: &str) -> SourceResult<Vec<RemoteItem>>;

    /// Creates an item and returns the id the source issued for it.
    fn create_item(&self, list_ref: &str, display_name: &str, checked: bool)
        -> SourceResult<String>;

    fn update_item(&self, source_local_id: &str, patch: &ItemPatch) -> SourceResult<()>;

    fn delete_item(&self, source_local_id: &str) -> SourceResult<DeleteOutcome>;

    /// Fallback used in place of a hard delete. Defaults to marking the item
    /// checked; sources whose contract differs override it.
    fn complete_item(&self, source_local_id: &str) -> SourceResult<()> {
        self.update_item(source_local_id, &ItemPatch::checked(true))
    }
}
