//! Core reconciliation logic for keeping two grocery lists in step.
//! This crate is the single source of truth for sync invariants; source
//! collaborators and schedulers live outside it.

pub mod config;
pub mod db;
pub mod logging;
pub mod model;
pub mod repo;
pub mod sync;

pub use config::{ConfigError, PairsConfig, SyncConfig};
pub use db::{open_db, open_db_in_memory, DbError, DbResult};
pub use logging::{default_log_level, init_logging, init_logging_for, logging_status, LoggingError};
pub use model::audit::{AuditKind, AuditPayload, AuditRecord};
pub use model::item::{ItemPatch, ItemState, RemoteItem, Side, SourceItem};
pub use model::link::{Link, LinkId};
pub use repo::item_repo::{RepoError, RepoResult};
pub use sync::clock::{Clock, ManualClock, SystemClock};
pub use sync::engine::{SharedStore, StopHandle, SyncEngine, SyncError};
pub use sync::pairs::{PairOutcome, PairRunner, PassReport};
pub use sync::report::{CycleError, CycleErrorKind, CycleReport, PlannedMutation, SyncStatus};
pub use sync::source::{
    DeleteCapability, DeleteOutcome, SourceCollaborator, SourceError, SourceErrorKind,
    SourceResult,
};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
