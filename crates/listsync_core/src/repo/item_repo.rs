//! Source item repository contracts and SQLite implementation.
//!
//! # Responsibility
//! - Keep the last observed state of every item, per list pair and side.
//! - Keep SQL details inside the store boundary.
//!
//! # Invariants
//! - Writes are keyed by `(pair_id, side, source_local_id)`; upsert is
//!   idempotent.
//! - Write paths call `SourceItem::validate()` before SQL mutations.
//! - Read paths reject invalid persisted state instead of masking it.

use crate::db::DbError;
use crate::model::item::{ItemValidationError, Side, SourceItem};
use crate::repo::DEFAULT_PAIR_ID;
use rusqlite::{params, Connection, Row};
use std::error::Error;
use std::fmt::{Display, Formatter};

const ITEM_SELECT_SQL: &str = "SELECT
    side,
    source_local_id,
    list_ref,
    display_name,
    is_checked,
    native_modified_at,
    synthetic_modified_at,
    last_seen_at,
    is_deleted,
    ever_linked
FROM source_items";

pub type RepoResult<T> = Result<T, RepoError>;

/// Store error shared by all sync repositories.
#[derive(Debug)]
pub enum RepoError {
    Validation(ItemValidationError),
    Db(DbError),
    NotFound(String),
    /// Persisted row violates model invariants. Needs manual intervention.
    InvalidData(String),
    /// Item already participates in an active link.
    AlreadyLinked { side: Side, item_id: String },
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(err) => write!(f, "{err}"),
            Self::Db(err) => write!(f, "{err}"),
            Self::NotFound(what) => write!(f, "not found: {what}"),
            Self::InvalidData(message) => write!(f, "invalid persisted sync data: {message}"),
            Self::AlreadyLinked { side, item_id } => {
                write!(f, "item {side}:{item_id} is already linked")
            }
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Validation(err) => Some(err),
            Self::Db(err) => Some(err),
            Self::NotFound(_) | Self::InvalidData(_) | Self::AlreadyLinked { .. } => None,
        }
    }
}

impl From<ItemValidationError> for RepoError {
    fn from(value: ItemValidationError) -> Self {
        Self::Validation(value)
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// Repository interface for mirrored source items.
pub trait SourceItemRepository {
    fn upsert_source_item(&self, item: &SourceItem) -> RepoResult<()>;
    fn get_source_item(&self, side: Side, source_local_id: &str)
        -> RepoResult<Option<SourceItem>>;
    fn list_source_items(&self, side: Side, include_deleted: bool) -> RepoResult<Vec<SourceItem>>;
    /// Active items of `side` not referenced by any link, ascending by id.
    fn list_unlinked_items(&self, side: Side) -> RepoResult<Vec<SourceItem>>;
    fn mark_deleted(&self, side: Side, source_local_id: &str) -> RepoResult<()>;
    fn count_active_items(&self) -> RepoResult<u64>;
}

/// SQLite-backed source item repository.
///
/// Accepts a plain connection or a transaction (via deref).
pub struct SqliteSourceItemRepository<'conn> {
    conn: &'conn Connection,
    pair_id: &'conn str,
}

impl<'conn> SqliteSourceItemRepository<'conn> {
    /// Repository over the default list pair.
    pub fn new(conn: &'conn Connection) -> Self {
        Self::for_pair(conn, DEFAULT_PAIR_ID)
    }

    pub fn for_pair(conn: &'conn Connection, pair_id: &'conn str) -> Self {
        Self { conn, pair_id }
    }
}

impl SourceItemRepository for SqliteSourceItemRepository<'_> {
    fn upsert_source_item(&self, item: &SourceItem) -> RepoResult<()> {
        item.validate()?;

        self.conn.execute(
            "INSERT INTO source_items (
                pair_id,
                side,
                source_local_id,
                list_ref,
                display_name,
                is_checked,
                native_modified_at,
                synthetic_modified_at,
                last_seen_at,
                is_deleted,
                ever_linked
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(pair_id, side, source_local_id) DO UPDATE SET
                list_ref = excluded.list_ref,
                display_name = excluded.display_name,
                is_checked = excluded.is_checked,
                native_modified_at = excluded.native_modified_at,
                synthetic_modified_at = excluded.synthetic_modified_at,
                last_seen_at = excluded.last_seen_at,
                is_deleted = excluded.is_deleted,
                ever_linked = MAX(source_items.ever_linked, excluded.ever_linked);",
            params![
                self.pair_id,
                item.side.as_str(),
                item.source_local_id.as_str(),
                item.list_ref.as_str(),
                item.display_name.as_str(),
                bool_to_int(item.checked),
                item.native_modified_at,
                item.synthetic_modified_at,
                item.last_seen_at,
                bool_to_int(item.deleted),
                bool_to_int(item.ever_linked),
            ],
        )?;

        Ok(())
    }

    fn get_source_item(
        &self,
        side: Side,
        source_local_id: &str,
    ) -> RepoResult<Option<SourceItem>> {
        let mut stmt = self.conn.prepare(&format!(
            "{ITEM_SELECT_SQL}
             WHERE pair_id = ?1 AND side = ?2 AND source_local_id = ?3;"
        ))?;

        let mut rows = stmt.query(params![self.pair_id, side.as_str(), source_local_id])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_item_row(row)?));
        }

        Ok(None)
    }

    fn list_source_items(&self, side: Side, include_deleted: bool) -> RepoResult<Vec<SourceItem>> {
        let mut stmt = self.conn.prepare(&format!(
            "{ITEM_SELECT_SQL}
             WHERE pair_id = ?1
               AND side = ?2
               AND (?3 = 1 OR is_deleted = 0)
             ORDER BY source_local_id ASC;"
        ))?;

        let mut rows = stmt.query(params![
            self.pair_id,
            side.as_str(),
            bool_to_int(include_deleted)
        ])?;
        let mut items = Vec::new();
        while let Some(row) = rows.next()? {
            items.push(parse_item_row(row)?);
        }

        Ok(items)
    }

    fn list_unlinked_items(&self, side: Side) -> RepoResult<Vec<SourceItem>> {
        let mut stmt = self.conn.prepare(&format!(
            "{ITEM_SELECT_SQL}
             WHERE pair_id = ?1
               AND side = ?2
               AND is_deleted = 0
               AND NOT EXISTS (
                   SELECT 1
                   FROM item_links l
                   WHERE l.pair_id = source_items.pair_id
                     AND ((source_items.side = 'a' AND l.a_item_id = source_items.source_local_id)
                       OR (source_items.side = 'b' AND l.b_item_id = source_items.source_local_id))
               )
             ORDER BY source_local_id ASC;"
        ))?;

        let mut rows = stmt.query(params![self.pair_id, side.as_str()])?;
        let mut items = Vec::new();
        while let Some(row) = rows.next()? {
            items.push(parse_item_row(row)?);
        }

        Ok(items)
    }

    fn mark_deleted(&self, side: Side, source_local_id: &str) -> RepoResult<()> {
        let changed = self.conn.execute(
            "UPDATE source_items
             SET is_deleted = 1
             WHERE pair_id = ?1 AND side = ?2 AND source_local_id = ?3;",
            params![self.pair_id, side.as_str(), source_local_id],
        )?;

        if changed == 0 {
            return Err(RepoError::NotFound(format!(
                "source item {side}:{source_local_id}"
            )));
        }

        Ok(())
    }

    fn count_active_items(&self) -> RepoResult<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM source_items WHERE pair_id = ?1 AND is_deleted = 0;",
            [self.pair_id],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

fn parse_item_row(row: &Row<'_>) -> RepoResult<SourceItem> {
    let side_text: String = row.get("side")?;
    let side = Side::parse(&side_text).ok_or_else(|| {
        RepoError::InvalidData(format!("invalid side `{side_text}` in source_items.side"))
    })?;

    let item = SourceItem {
        side,
        source_local_id: row.get("source_local_id")?,
        list_ref: row.get("list_ref")?,
        display_name: row.get("display_name")?,
        checked: int_to_bool(row.get("is_checked")?, "source_items.is_checked")?,
        native_modified_at: row.get("native_modified_at")?,
        synthetic_modified_at: row.get("synthetic_modified_at")?,
        last_seen_at: row.get("last_seen_at")?,
        deleted: int_to_bool(row.get("is_deleted")?, "source_items.is_deleted")?,
        ever_linked: int_to_bool(row.get("ever_linked")?, "source_items.ever_linked")?,
    };
    item.validate()
        .map_err(|err| RepoError::InvalidData(format!("{err} in source_items")))?;
    Ok(item)
}

pub(crate) fn int_to_bool(value: i64, column: &str) -> RepoResult<bool> {
    match value {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(RepoError::InvalidData(format!(
            "invalid boolean value `{other}` in {column}"
        ))),
    }
}

pub(crate) fn bool_to_int(value: bool) -> i64 {
    if value {
        1
    } else {
        0
    }
}
