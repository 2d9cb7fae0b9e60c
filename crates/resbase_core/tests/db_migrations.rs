use resbase_core::db::migrations::latest_version;
use resbase_core::db::{open_db, open_db_in_memory, open_with_config, DbError};
use resbase_core::RepositoryConfig;
use rusqlite::Connection;

#[test]
fn open_db_in_memory_applies_all_migrations() {
    let conn = open_db_in_memory().unwrap();

    assert_eq!(schema_version(&conn), latest_version());
    for table in [
        "resource_classes",
        "class_parents",
        "attribute_types",
        "attribute_definitions",
        "schema_counters",
        "resources",
        "resource_attributes",
        "av_boolean",
        "av_string",
        "av_resource_list_items",
        "parameter_sets",
        "parameters",
    ] {
        assert_table_exists(&conn, table);
    }
}

#[test]
fn attribute_index_counter_starts_at_zero() {
    let conn = open_db_in_memory().unwrap();
    let value: i64 = conn
        .query_row(
            "SELECT value FROM schema_counters WHERE name = 'attribute_index';",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(value, 0);
}

#[test]
fn opening_same_database_twice_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("resbase.db");

    let conn_first = open_db(&path).unwrap();
    assert_eq!(schema_version(&conn_first), latest_version());
    drop(conn_first);

    let conn_second = open_db(&path).unwrap();
    assert_eq!(schema_version(&conn_second), latest_version());
    assert_table_exists(&conn_second, "resources");
}

#[test]
fn open_with_config_uses_file_location() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("configured.db");
    let config = RepositoryConfig::file(&path);

    let conn = open_with_config(&config).unwrap();
    assert_eq!(schema_version(&conn), latest_version());
    let foreign_keys: i64 = conn
        .query_row("PRAGMA foreign_keys;", [], |row| row.get(0))
        .unwrap();
    assert_eq!(foreign_keys, 1);
    assert!(path.exists());
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

fn schema_version(conn: &Connection) -> u32 {
    conn.query_row("PRAGMA user_version;", [], |row| row.get(0))
        .unwrap()
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
    assert_eq!(exists, 1, "expected table `{table_name}` to exist");
}
