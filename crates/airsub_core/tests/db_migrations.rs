use airsub_core::db::migrations::latest_version;
use airsub_core::db::{open_db, open_db_in_memory, open_db_with_config, DbError, StoreConfig};
use rusqlite::Connection;
use std::time::Duration;

#[test]
fn open_db_in_memory_applies_all_migrations() {
    let conn = open_db_in_memory().unwrap();

    assert_eq!(schema_version(&conn), latest_version());
    assert_table_exists(&conn, "subscriptions");
    assert_table_exists(&conn, "subscription_cells");
    assert_table_exists(&conn, "version_clock");
}

#[test]
fn opening_same_database_twice_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("airsub.db");

    let conn_first = open_db(&path).unwrap();
    assert_eq!(schema_version(&conn_first), latest_version());
    drop(conn_first);

    let conn_second = open_db(&path).unwrap();
    assert_eq!(schema_version(&conn_second), latest_version());
    assert_table_exists(&conn_second, "subscriptions");
}

#[test]
fn file_databases_use_wal_unless_disabled() {
    let dir = tempfile::tempdir().unwrap();

    let wal = open_db(dir.path().join("wal.db")).unwrap();
    assert_eq!(journal_mode(&wal), "wal");

    let config = StoreConfig {
        busy_timeout: Duration::from_millis(100),
        wal: false,
    };
    let rollback = open_db_with_config(dir.path().join("rollback.db"), &config).unwrap();
    assert_eq!(journal_mode(&rollback), "delete");
}

#[test]
fn opening_database_with_newer_schema_version_returns_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("future.db");

    let conn = Connection::open(&path).unwrap();
    conn.execute_batch("PRAGMA user_version = 999;").unwrap();
    drop(conn);

    let err = open_db(&path).unwrap_err();
    match err {
        DbError::UnsupportedSchemaVersion {
            db_version,
            latest_supported,
        } => {
            assert_eq!(db_version, 999);
            assert_eq!(latest_supported, latest_version());
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn cell_index_follows_subscription_writes() {
    let conn = open_db_in_memory().unwrap();
    conn.execute(
        "INSERT INTO subscriptions (id, owner, url, cells, updated_at)
         VALUES ('a', 'uss1', 'https://example.com', '[1,2,2]', 1);",
        [],
    )
    .unwrap();
    assert_eq!(indexed_cells(&conn, "a"), vec![1, 2]);

    conn.execute("UPDATE subscriptions SET cells = '[7]' WHERE id = 'a';", [])
        .unwrap();
    assert_eq!(indexed_cells(&conn, "a"), vec![7]);

    conn.execute("DELETE FROM subscriptions WHERE id = 'a';", [])
        .unwrap();
    assert!(indexed_cells(&conn, "a").is_empty());
}

#[test]
fn version_clock_tracks_highest_written_version() {
    let conn = open_db_in_memory().unwrap();
    assert_eq!(last_version(&conn), 0);

    conn.execute(
        "INSERT INTO subscriptions (id, owner, url, cells, updated_at)
         VALUES ('a', 'uss1', 'https://example.com', '[1]', 40);",
        [],
    )
    .unwrap();
    assert_eq!(last_version(&conn), 40);

    // Deleting the row keeps the mark, lower writes never move it back.
    conn.execute("DELETE FROM subscriptions WHERE id = 'a';", [])
        .unwrap();
    conn.execute(
        "INSERT INTO subscriptions (id, owner, url, cells, updated_at)
         VALUES ('b', 'uss1', 'https://example.com', '[1]', 7);",
        [],
    )
    .unwrap();
    assert_eq!(last_version(&conn), 40);

    conn.execute("UPDATE subscriptions SET updated_at = 90 WHERE id = 'b';", [])
        .unwrap();
    assert_eq!(last_version(&conn), 90);
}

#[test]
fn version_clock_is_seeded_from_existing_rows() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("upgrade.db");

    // A database left at schema version 1 with data in it.
    let conn = Connection::open(&path).unwrap();
    conn.execute_batch(include_str!("../src/db/migrations/0001_subscriptions.sql"))
        .unwrap();
    conn.execute_batch(
        "INSERT INTO subscriptions (id, owner, url, cells, updated_at)
         VALUES ('a', 'uss1', 'https://example.com', '[1]', 1234);
         PRAGMA user_version = 1;",
    )
    .unwrap();
    drop(conn);

    let upgraded = open_db(&path).unwrap();
    assert_eq!(schema_version(&upgraded), latest_version());
    assert_eq!(last_version(&upgraded), 1234);
}

#[test]
fn cells_column_rejects_non_arrays() {
    let conn = open_db_in_memory().unwrap();
    let result = conn.execute(
        "INSERT INTO subscriptions (id, owner, url, cells, updated_at)
         VALUES ('a', 'uss1', 'https://example.com', '{\"x\":1}', 1);",
        [],
    );
    assert!(result.is_err());
}

fn schema_version(conn: &Connection) -> u32 {
    conn.query_row("PRAGMA user_version;", [], |row| row.get(0))
        .unwrap()
}

fn last_version(conn: &Connection) -> i64 {
    conn.query_row("SELECT last_version FROM version_clock WHERE id = 1;", [], |row| {
        row.get(0)
    })
    .unwrap()
}

fn journal_mode(conn: &Connection) -> String {
    conn.query_row("PRAGMA journal_mode;", [], |row| row.get(0))
        .unwrap()
}

fn indexed_cells(conn: &Connection, id: &str) -> Vec<i64> {
    let mut stmt = conn
        .prepare(
            "SELECT cell_id FROM subscription_cells
             WHERE subscription_id = ?1
             ORDER BY cell_id;",
        )
        .unwrap();
    let cells = stmt
        .query_map([id], |row| row.get(0))
        .unwrap()
        .collect::<Result<Vec<i64>, _>>()
        .unwrap();
    cells
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
