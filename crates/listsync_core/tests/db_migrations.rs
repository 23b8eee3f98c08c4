use listsync_core::db::migrations::{latest_version, schema_version};
use listsync_core::db::{open_db, open_db_in_memory, DbError};
use rusqlite::Connection;

#[test]
fn open_db_in_memory_applies_all_migrations() {
    let conn = open_db_in_memory().unwrap();

    assert_eq!(schema_version(&conn).unwrap(), latest_version());
    assert_table_exists(&conn, "source_items");
    assert_table_exists(&conn, "item_links");
    assert_table_exists(&conn, "audit_log");
    assert_table_exists(&conn, "sync_cycles");
}

#[test]
fn open_db_enables_foreign_keys() {
    let conn = open_db_in_memory().unwrap();
    let enabled: i64 = conn
        .query_row("PRAGMA foreign_keys;", [], |row| row.get(0))
        .unwrap();
    assert_eq!(enabled, 1);
}

#[test]
fn reopening_same_store_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("listsync.db");

    let first = open_db(&path).unwrap();
    first
        .execute(
            "INSERT INTO sync_cycles (cycle_id, started_at, finished_at) VALUES ('c1', 1, 2);",
            [],
        )
        .unwrap();
    drop(first);

    let second = open_db(&path).unwrap();
    assert_eq!(schema_version(&second).unwrap(), latest_version());
    let cycles: i64 = second
        .query_row("SELECT COUNT(*) FROM sync_cycles;", [], |row| row.get(0))
        .unwrap();
    assert_eq!(cycles, 1);
}

#[test]
fn store_from_newer_binary_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("future.db");

    let conn = Connection::open(&path).unwrap();
    conn.execute_batch("PRAGMA user_version = 999;").unwrap();
    drop(conn);

    let err = open_db(&path).unwrap_err();
    match err {
        DbError::UnsupportedSchemaVersion { found, supported } => {
            assert_eq!(found, 999);
            assert_eq!(supported, latest_version());
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn missing_store_directories_are_created() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state").join("pairs").join("groceries.db");

    let conn = open_db(&path).unwrap();

    assert!(path.exists());
    let journal: String = conn
        .query_row("PRAGMA journal_mode;", [], |row| row.get(0))
        .unwrap();
    assert_eq!(journal.to_ascii_lowercase(), "wal");
}

#[test]
fn link_columns_are_unique_per_side_within_a_pair() {
    let conn = open_db_in_memory().unwrap();
    conn.execute(
        "INSERT INTO item_links (link_id, pair_id, a_item_id, b_item_id, confidence_score, linked_at)
         VALUES ('l1', 'default', 'a1', 'b1', 1.0, 0);",
        [],
    )
    .unwrap();

    let duplicate = conn.execute(
        "INSERT INTO item_links (link_id, pair_id, a_item_id, b_item_id, confidence_score, linked_at)
         VALUES ('l2', 'default', 'a1', 'b2', 1.0, 0);",
        [],
    );
    assert!(duplicate.is_err());

    conn.execute(
        "INSERT INTO item_links (link_id, pair_id, a_item_id, b_item_id, confidence_score, linked_at)
         VALUES ('l3', 'pantry', 'a1', 'b1', 1.0, 0);",
        [],
    )
    .unwrap();
}

fn assert_table_exists(conn: &Connection, table_name: &str) {
    let exists: i64 = conn
        .query_row(
            "SELECT EXISTS(
                SELECT 1
                FROM sqlite_master
                WHERE type = 'table' AND name = ?1
            );",
            [table_name],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(exists, 1, "table {table_name} does not exist");
}
