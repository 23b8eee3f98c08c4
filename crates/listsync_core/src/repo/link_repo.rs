//! Link repository contracts and SQLite implementation.
//!
//! # Invariants
//! - Within a list pair, an item participates in at most one active link
//!   (unique columns plus an explicit pre-check that reports
//!   `AlreadyLinked`).
//! - Links are destroyed, never tombstoned.

use crate::model::item::Side;
use crate::model::link::Link;
use crate::repo::item_repo::{RepoError, RepoResult};
use crate::repo::DEFAULT_PAIR_ID;
use rusqlite::{params, Connection, Row};

const LINK_SELECT_SQL: &str = "SELECT
    link_id,
    a_item_id,
    b_item_id,
    confidence_score,
    linked_at
FROM item_links";

pub trait LinkRepository {
    fn create_link(&self, link: &Link) -> RepoResult<()>;
    fn get_link(&self, link_id: &str) -> RepoResult<Option<Link>>;
    fn find_link_for_item(&self, side: Side, item_id: &str) -> RepoResult<Option<Link>>;
    fn list_links(&self) -> RepoResult<Vec<Link>>;
    fn delete_link(&self, link_id: &str) -> RepoResult<()>;
    fn count_links(&self) -> RepoResult<u64>;
}

pub struct SqliteLinkRepository<'conn> {
    conn: &'conn Connection,
    pair_id: &'conn str,
}

impl<'conn> SqliteLinkRepository<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self::for_pair(conn, DEFAULT_PAIR_ID)
    }

    pub fn for_pair(conn: &'conn Connection, pair_id: &'conn str) -> Self {
        Self { conn, pair_id }
    }
}

impl LinkRepository for SqliteLinkRepository<'_> {
    fn create_link(&self, link: &Link) -> RepoResult<()> {
        if !(0.0..=1.0).contains(&link.confidence) {
            return Err(RepoError::InvalidData(format!(
                "confidence {} out of range for link {}",
                link.confidence, link.link_id
            )));
        }
        for side in [Side::A, Side::B] {
            if self.find_link_for_item(side, link.item_id(side))?.is_some() {
                return Err(RepoError::AlreadyLinked {
                    side,
                    item_id: link.item_id(side).to_string(),
                });
            }
        }

        self.conn.execute(
            "INSERT INTO item_links (
                link_id,
                pair_id,
                a_item_id,
                b_item_id,
                confidence_score,
                linked_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6);",
            params![
                link.link_id.as_str(),
                self.pair_id,
                link.a_item_id.as_str(),
                link.b_item_id.as_str(),
                link.confidence,
                link.linked_at,
            ],
        )?;

        Ok(())
    }

    fn get_link(&self, link_id: &str) -> RepoResult<Option<Link>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{LINK_SELECT_SQL} WHERE pair_id = ?1 AND link_id = ?2;"))?;
        let mut rows = stmt.query([self.pair_id, link_id])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_link_row(row)?));
        }
        Ok(None)
    }

    fn find_link_for_item(&self, side: Side, item_id: &str) -> RepoResult<Option<Link>> {
        let column = match side {
            Side::A => "a_item_id",
            Side::B => "b_item_id",
        };
        let mut stmt = self
            .conn
            .prepare(&format!("{LINK_SELECT_SQL} WHERE pair_id = ?1 AND {column} = ?2;"))?;
        let mut rows = stmt.query([self.pair_id, item_id])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_link_row(row)?));
        }
        Ok(None)
    }

    fn list_links(&self) -> RepoResult<Vec<Link>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{LINK_SELECT_SQL} WHERE pair_id = ?1 ORDER BY a_item_id ASC;"))?;
        let mut rows = stmt.query([self.pair_id])?;
        let mut links = Vec::new();
        while let Some(row) = rows.next()? {
            links.push(parse_link_row(row)?);
        }
        Ok(links)
    }

    fn delete_link(&self, link_id: &str) -> RepoResult<()> {
        let changed = self.conn.execute(
            "DELETE FROM item_links WHERE pair_id = ?1 AND link_id = ?2;",
            [self.pair_id, link_id],
        )?;
        if changed == 0 {
            return Err(RepoError::NotFound(format!("link {link_id}")));
        }
        Ok(())
    }

    fn count_links(&self) -> RepoResult<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM item_links WHERE pair_id = ?1;",
            [self.pair_id],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

fn parse_link_row(row: &Row<'_>) -> RepoResult<Link> {
    let link = Link {
        link_id: row.get("link_id")?,
        a_item_id: row.get("a_item_id")?,
        b_item_id: row.get("b_item_id")?,
        confidence: row.get("confidence_score")?,
        linked_at: row.get("linked_at")?,
    };
    if !(0.0..=1.0).contains(&link.confidence) {
        return Err(RepoError::InvalidData(format!(
            "invalid confidence `{}` in item_links.confidence_score",
            link.confidence
        )));
    }
    Ok(link)
}
