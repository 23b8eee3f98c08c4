//! Persistent store: repository contracts and SQLite implementations.
//!
//! # Responsibility
//! - Define use-case oriented data access contracts for sync state.
//! - Isolate SQLite query details from the sync engine.
//!
//! # Invariants
//! - Repository APIs return semantic errors (`NotFound`, `AlreadyLinked`,
//!   `InvalidData`) in addition to transport errors.
//! - A cycle's writes go through `store::commit_cycle` as one transaction.
//! - Every repository is scoped to one list pair; rows of other pairs are
//!   never read or written through it.

pub mod audit_repo;
pub mod cycle_repo;
pub mod item_repo;
pub mod link_repo;
pub mod store;

/// Pair scope used when a store serves a single list pair.
pub const DEFAULT_PAIR_ID: &str = "default";
