//! Cycle-scoped atomic commit over all sync repositories.
//!
//! # Responsibility
//! - Apply one cycle's staged store updates for one list pair in a single
//!   transaction.
//!
//! # Invariants
//! - Either every write of `CycleWrites` lands, or none does.
//! - Write order inside the transaction: items, tombstones, dropped links,
//!   new links, audit, cycle record. Links reference items by id only, so
//!   this order never violates a constraint mid-transaction.

use crate::model::audit::AuditRecord;
use crate::model::item::{Side, SourceItem};
use crate::model::link::{Link, LinkId};
use crate::repo::audit_repo::{AuditRepository, SqliteAuditRepository};
use crate::repo::cycle_repo::{CycleRecord, CycleRepository, SqliteCycleRepository};
use crate::repo::item_repo::{RepoResult, SourceItemRepository, SqliteSourceItemRepository};
use crate::repo::link_repo::{LinkRepository, SqliteLinkRepository};
use log::{error, info};
use rusqlite::Connection;
use std::time::Instant;

/// Store updates staged by one cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleWrites {
    pub upserts: Vec<SourceItem>,
    pub deletions: Vec<(Side, String)>,
    pub dropped_links: Vec<LinkId>,
    pub new_links: Vec<Link>,
    pub audit: Vec<AuditRecord>,
    pub cycle: Option<CycleRecord>,
}

impl CycleWrites {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty()
            && self.deletions.is_empty()
            && self.dropped_links.is_empty()
            && self.new_links.is_empty()
            && self.audit.is_empty()
            && self.cycle.is_none()
    }
}

/// Commits all staged writes of `pair_id` atomically.
///
/// # Errors
/// - Any repository error rolls back the whole transaction and is returned.
pub fn commit_cycle(
    conn: &mut Connection,
    pair_id: &str,
    writes: &CycleWrites,
) -> RepoResult<()> {
    let started_at = Instant::now();
    let tx = conn.transaction()?;

    let result = (|| -> RepoResult<()> {
        let items = SqliteSourceItemRepository::for_pair(&tx, pair_id);
        for item in &writes.upserts {
            items.upsert_source_item(item)?;
        }
        for (side, item_id) in &writes.deletions {
            items.mark_deleted(*side, item_id)?;
        }

        let links = SqliteLinkRepository::for_pair(&tx, pair_id);
        for link_id in &writes.dropped_links {
            links.delete_link(link_id)?;
        }
        for link in &writes.new_links {
            links.create_link(link)?;
        }

        let audit = SqliteAuditRepository::for_pair(&tx, pair_id);
        for record in &writes.audit {
            audit.append_audit(record)?;
        }

        if let Some(cycle) = &writes.cycle {
            SqliteCycleRepository::for_pair(&tx, pair_id).record_cycle(cycle)?;
        }
        Ok(())
    })();

    match result {
        Ok(()) => {
            tx.commit()?;
            info!(
                "event=store_commit module=repo status=ok pair_id={pair_id} upserts={} deletions={} new_links={} dropped_links={} audit={} duration_ms={}",
                writes.upserts.len(),
                writes.deletions.len(),
                writes.new_links.len(),
                writes.dropped_links.len(),
                writes.audit.len(),
                started_at.elapsed().as_millis()
            );
            Ok(())
        }
        Err(err) => {
            // Dropping `tx` rolls back.
            error!(
                "event=store_commit module=repo status=error pair_id={pair_id} duration_ms={} error={}",
                started_at.elapsed().as_millis(),
                err
            );
            Err(err)
        }
    }
}
