//! Committed cycle history, read back by status queries.

use crate::repo::item_repo::{bool_to_int, int_to_bool, RepoResult};
use crate::repo::DEFAULT_PAIR_ID;
use rusqlite::{params, Connection, OptionalExtension};

/// Summary row written once per committed live cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleRecord {
    pub cycle_id: String,
    pub started_at: i64,
    pub finished_at: i64,
    pub added: u32,
    pub updated: u32,
    pub conflicts_resolved: u32,
    pub removed: u32,
    pub error_count: u32,
    pub cancelled: bool,
}

pub trait CycleRepository {
    fn record_cycle(&self, record: &CycleRecord) -> RepoResult<()>;
    fn latest_cycle(&self) -> RepoResult<Option<CycleRecord>>;
}

pub struct SqliteCycleRepository<'conn> {
    conn: &'conn Connection,
    pair_id: &'conn str,
}

impl<'conn> SqliteCycleRepository<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self::for_pair(conn, DEFAULT_PAIR_ID)
    }

    pub fn for_pair(conn: &'conn Connection, pair_id: &'conn str) -> Self {
        Self { conn, pair_id }
    }
}

impl CycleRepository for SqliteCycleRepository<'_> {
    fn record_cycle(&self, record: &CycleRecord) -> RepoResult<()> {
        self.conn.execute(
            "INSERT INTO sync_cycles (
                pair_id,
                cycle_id,
                started_at,
                finished_at,
                added_count,
                updated_count,
                conflicts_count,
                removed_count,
                error_count,
                cancelled
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10);",
            params![
                self.pair_id,
                record.cycle_id.as_str(),
                record.started_at,
                record.finished_at,
                record.added,
                record.updated,
                record.conflicts_resolved,
                record.removed,
                record.error_count,
                bool_to_int(record.cancelled),
            ],
        )?;
        Ok(())
    }

    fn latest_cycle(&self) -> RepoResult<Option<CycleRecord>> {
        let row = self
            .conn
            .query_row(
                "SELECT
                    cycle_id,
                    started_at,
                    finished_at,
                    added_count,
                    updated_count,
                    conflicts_count,
                    removed_count,
                    error_count,
                    cancelled
                 FROM sync_cycles
                 WHERE pair_id = ?1
                 ORDER BY finished_at DESC, rowid DESC
                 LIMIT 1;",
                [self.pair_id],
                |row| {
                    Ok((
                        CycleRecord {
                            cycle_id: row.get(0)?,
                            started_at: row.get(1)?,
                            finished_at: row.get(2)?,
                            added: row.get(3)?,
                            updated: row.get(4)?,
                            conflicts_resolved: row.get(5)?,
                            removed: row.get(6)?,
                            error_count: row.get(7)?,
                            cancelled: false,
                        },
                        row.get::<_, i64>(8)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((mut record, cancelled)) => {
                record.cancelled = int_to_bool(cancelled, "sync_cycles.cancelled")?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }
}
