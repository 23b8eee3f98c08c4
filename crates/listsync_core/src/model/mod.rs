//! Domain model for reconciling two independently-authored grocery lists.
//!
//! # Responsibility
//! - Define the local mirror of remote items (`SourceItem`).
//! - Define cross-source correlation (`Link`) and audit records.
//!
//! # Invariants
//! - An item is identified by `(Side, source_local_id)`; ids of different
//!   sides never share a namespace.
//! - Display names are not unique on either side and are never used as keys.
//!
//! # See also
//! - DESIGN.md

pub mod audit;
pub mod item;
pub mod link;
