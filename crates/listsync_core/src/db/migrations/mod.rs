//! Ordered schema steps for the sync store.
//!
//! # Invariants
//! - Step versions start at 1 and increase by exactly 1.
//! - Each step records its version in `PRAGMA user_version` as it lands.
//! - Pending steps run inside one transaction: an upgrade is all or nothing.

use crate::db::{DbError, DbResult};
use log::info;
use rusqlite::{Connection, Transaction};

#[derive(Debug, Clone, Copy)]
struct SchemaStep {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

const STEPS: &[SchemaStep] = &[
    SchemaStep {
        version: 1,
        name: "source_items",
        sql: include_str!("0001_source_items.sql"),
    },
    SchemaStep {
        version: 2,
        name: "links_audit",
        sql: include_str!("0002_links_audit.sql"),
    },
    SchemaStep {
        version: 3,
        name: "sync_cycles",
        sql: include_str!("0003_sync_cycles.sql"),
    },
    SchemaStep {
        version: 4,
        name: "item_link_history",
        sql: include_str!("0004_item_link_history.sql"),
    },
    SchemaStep {
        version: 5,
        name: "list_pairs",
        sql: include_str!("0005_list_pairs.sql"),
    },
];

/// Highest schema version this build can read and write.
pub fn latest_version() -> u32 {
    STEPS.last().map_or(0, |step| step.version)
}

/// Schema version currently recorded in the store.
pub fn schema_version(conn: &Connection) -> DbResult<u32> {
    Ok(conn.query_row("PRAGMA user_version;", [], |row| row.get::<_, u32>(0))?)
}

/// Upgrades the store to `latest_version()`.
///
/// # Errors
/// - `UnsupportedSchemaVersion` when the store is newer than this build.
/// - `Migration` naming the step that failed; earlier steps roll back too.
pub fn apply_migrations(conn: &mut Connection) -> DbResult<()> {
    let found = schema_version(conn)?;
    let supported = latest_version();
    if found > supported {
        return Err(DbError::UnsupportedSchemaVersion { found, supported });
    }

    let pending: Vec<&SchemaStep> = STEPS.iter().filter(|step| step.version > found).collect();
    if pending.is_empty() {
        return Ok(());
    }

    let tx = conn.transaction()?;
    for step in &pending {
        run_step(&tx, step)?;
    }
    tx.commit()?;

    info!(
        "event=store_migrate module=db status=ok from_version={found} to_version={supported} steps={}",
        pending.len()
    );
    Ok(())
}

fn run_step(tx: &Transaction<'_>, step: &SchemaStep) -> DbResult<()> {
    tx.execute_batch(step.sql)
        .and_then(|()| tx.pragma_update(None, "user_version", step.version))
        .map_err(|source| DbError::Migration {
            version: step.version,
            name: step.name,
            source,
        })
}
