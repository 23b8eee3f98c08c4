//! Append-only audit log storage.

use crate::model::audit::{AuditKind, AuditPayload, AuditRecord};
use crate::model::item::Side;
use crate::repo::item_repo::{RepoError, RepoResult};
use crate::repo::DEFAULT_PAIR_ID;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, Row};

/// Filter for reading back audit rows, newest first.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub kind: Option<AuditKind>,
    pub cycle_id: Option<String>,
    pub limit: Option<u32>,
}

pub trait AuditRepository {
    fn append_audit(&self, record: &AuditRecord) -> RepoResult<i64>;
    fn list_audit(&self, query: &AuditQuery) -> RepoResult<Vec<AuditRecord>>;
}

pub struct SqliteAuditRepository<'conn> {
    conn: &'conn Connection,
    pair_id: &'conn str,
}

impl<'conn> SqliteAuditRepository<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self::for_pair(conn, DEFAULT_PAIR_ID)
    }

    pub fn for_pair(conn: &'conn Connection, pair_id: &'conn str) -> Self {
        Self { conn, pair_id }
    }
}

impl AuditRepository for SqliteAuditRepository<'_> {
    fn append_audit(&self, record: &AuditRecord) -> RepoResult<i64> {
        self.conn.execute(
            "INSERT INTO audit_log (
                pair_id,
                cycle_id,
                kind,
                side,
                item_id,
                counterpart_item_id,
                link_id,
                before_json,
                after_json,
                created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10);",
            params![
                self.pair_id,
                record.cycle_id.as_str(),
                record.kind.as_str(),
                record.side.map(Side::as_str),
                record.item_id.as_deref(),
                record.counterpart_item_id.as_deref(),
                record.link_id.as_deref(),
                encode_payload(record.before.as_ref())?,
                encode_payload(record.after.as_ref())?,
                record.created_at,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn list_audit(&self, query: &AuditQuery) -> RepoResult<Vec<AuditRecord>> {
        let mut sql = String::from(
            "SELECT
                cycle_id,
                kind,
                side,
                item_id,
                counterpart_item_id,
                link_id,
                before_json,
                after_json,
                created_at
             FROM audit_log WHERE pair_id = ?",
        );
        let mut bind_values: Vec<Value> = vec![Value::Text(self.pair_id.to_string())];

        if let Some(kind) = query.kind {
            sql.push_str(" AND kind = ?");
            bind_values.push(Value::Text(kind.as_str().to_string()));
        }
        if let Some(cycle_id) = &query.cycle_id {
            sql.push_str(" AND cycle_id = ?");
            bind_values.push(Value::Text(cycle_id.clone()));
        }

        sql.push_str(" ORDER BY id DESC");

        if let Some(limit) = query.limit {
            sql.push_str(" LIMIT ?");
            bind_values.push(Value::Integer(i64::from(limit)));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(bind_values))?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(parse_audit_row(row)?);
        }
        Ok(records)
    }
}

fn encode_payload(payload: Option<&AuditPayload>) -> RepoResult<Option<String>> {
    payload
        .map(|value| {
            serde_json::to_string(value)
                .map_err(|err| RepoError::InvalidData(format!("unencodable audit payload: {err}")))
        })
        .transpose()
}

fn decode_payload(value: Option<String>, column: &str) -> RepoResult<Option<AuditPayload>> {
    value
        .map(|text| {
            serde_json::from_str(&text)
                .map_err(|err| RepoError::InvalidData(format!("invalid json in {column}: {err}")))
        })
        .transpose()
}

fn parse_audit_row(row: &Row<'_>) -> RepoResult<AuditRecord> {
    let kind_text: String = row.get("kind")?;
    let kind = AuditKind::parse(&kind_text).ok_or_else(|| {
        RepoError::InvalidData(format!("invalid audit kind `{kind_text}` in audit_log.kind"))
    })?;

    let side = match row.get::<_, Option<String>>("side")? {
        Some(value) => Some(Side::parse(&value).ok_or_else(|| {
            RepoError::InvalidData(format!("invalid side `{value}` in audit_log.side"))
        })?),
        None => None,
    };

    Ok(AuditRecord {
        cycle_id: row.get("cycle_id")?,
        kind,
        side,
        item_id: row.get("item_id")?,
        counterpart_item_id: row.get("counterpart_item_id")?,
        link_id: row.get("link_id")?,
        before: decode_payload(row.get("before_json")?, "audit_log.before_json")?,
        after: decode_payload(row.get("after_json")?, "audit_log.after_json")?,
        created_at: row.get("created_at")?,
    })
}
