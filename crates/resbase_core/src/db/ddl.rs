//! DDL primitives used by schema evolution.
//!
//! # Responsibility
//! - Validate and quote dynamic table/column identifiers.
//! - Inspect and alter per-class table layout.
//!
//! # Invariants
//! - Every identifier passed to SQL text goes through `validate_identifier`.
//! - DDL statements run on the caller's connection/transaction; nothing here
//!   commits on its own.

use crate::db::{DbError, DbResult};
use log::info;
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::Connection;

static IDENTIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("identifier pattern is valid")
});

/// Column description for `create_table` / `add_column`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: String,
    /// Native SQLite column type (`INTEGER`, `TEXT`, `REAL`).
    pub sql_type: &'static str,
    /// Referenced table for foreign-key-like columns.
    pub references: Option<&'static str>,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, sql_type: &'static str) -> Self {
        Self {
            name: name.into(),
            sql_type,
            references: None,
        }
    }

    pub fn referencing(mut self, table: &'static str) -> Self {
        self.references = Some(table);
        self
    }

    fn definition(&self) -> DbResult<String> {
        let mut sql = format!("{} {}", quote_identifier(&self.name)?, self.sql_type);
        if let Some(table) = self.references {
            sql.push_str(&format!(
                " REFERENCES {}(id) ON DELETE SET NULL",
                quote_identifier(table)?
            ));
        }
        Ok(sql)
    }
}

/// Rejects anything that is not a plain identifier.
pub fn validate_identifier(name: &str) -> DbResult<()> {
    if IDENTIFIER.is_match(name) && !name.to_ascii_lowercase().starts_with("sqlite_") {
        Ok(())
    } else {
        Err(DbError::InvalidIdentifier(name.to_string()))
    }
}

/// Returns the identifier double-quoted for SQL text.
pub fn quote_identifier(name: &str) -> DbResult<String> {
    validate_identifier(name)?;
    Ok(format!("\"{name}\""))
}

pub fn table_exists(conn: &Connection, table: &str) -> DbResult<bool> {
    let exists: i64 = conn.query_row(
        "SELECT EXISTS(
            SELECT 1
            FROM sqlite_master
            WHERE type = 'table' AND name = ?1
        );",
        [table],
        |row| row.get(0),
    )?;
    Ok(exists == 1)
}

pub fn table_columns(conn: &Connection, table: &str) -> DbResult<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({});", quote_identifier(table)?))?;
    let mut rows = stmt.query([])?;
    let mut columns = Vec::new();
    while let Some(row) = rows.next()? {
        columns.push(row.get::<_, String>(1)?);
    }
    Ok(columns)
}

pub fn table_has_column(conn: &Connection, table: &str, column: &str) -> DbResult<bool> {
    Ok(table_columns(conn, table)?
        .iter()
        .any(|current| current == column))
}

/// Creates a per-class table keyed by `resource_id`.
pub fn create_class_table(conn: &Connection, table: &str, columns: &[ColumnSpec]) -> DbResult<()> {
    let mut definitions = vec![
        "\"resource_id\" INTEGER PRIMARY KEY REFERENCES \"resources\"(id) ON DELETE CASCADE"
            .to_string(),
    ];
    for column in columns {
        definitions.push(column.definition()?);
    }
    conn.execute_batch(&format!(
        "CREATE TABLE {} ({});",
        quote_identifier(table)?,
        definitions.join(", ")
    ))?;
    info!(
        "event=ddl module=db op=create_table table={} columns={}",
        table,
        columns.len()
    );
    Ok(())
}

pub fn add_column(conn: &Connection, table: &str, column: &ColumnSpec) -> DbResult<()> {
    conn.execute_batch(&format!(
        "ALTER TABLE {} ADD COLUMN {};",
        quote_identifier(table)?,
        column.definition()?
    ))?;
    info!(
        "event=ddl module=db op=add_column table={} column={}",
        table, column.name
    );
    Ok(())
}

/// Drops `column`. Columns that carry a foreign key cannot be dropped in
/// place; their table is rebuilt without them.
pub fn drop_column(conn: &Connection, table: &str, column: &str) -> DbResult<()> {
    if foreign_keys(conn, table)?.iter().any(|(from, _)| from == column) {
        return rebuild_without(conn, table, column);
    }
    conn.execute_batch(&format!(
        "ALTER TABLE {} DROP COLUMN {};",
        quote_identifier(table)?,
        quote_identifier(column)?
    ))?;
    info!("event=ddl module=db op=drop_column table={table} column={column}");
    Ok(())
}

/// `(column, referenced table)` pairs of `table`.
fn foreign_keys(conn: &Connection, table: &str) -> DbResult<Vec<(String, String)>> {
    let mut stmt = conn.prepare(&format!(
        "PRAGMA foreign_key_list({});",
        quote_identifier(table)?
    ))?;
    let mut rows = stmt.query([])?;
    let mut keys = Vec::new();
    while let Some(row) = rows.next()? {
        keys.push((row.get::<_, String>(3)?, row.get::<_, String>(2)?));
    }
    Ok(keys)
}

fn rebuild_without(conn: &Connection, table: &str, column: &str) -> DbResult<()> {
    let references = foreign_keys(conn, table)?;
    let mut definitions = Vec::new();
    let mut kept = Vec::new();
    {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({});", quote_identifier(table)?))?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let name: String = row.get(1)?;
            if name == column || name == "resource_id" {
                continue;
            }
            let sql_type: String = row.get(2)?;
            let mut definition = format!("{} {sql_type}", quote_identifier(&name)?);
            if let Some((_, target)) = references.iter().find(|(from, _)| *from == name) {
                definition.push_str(&format!(
                    " REFERENCES {}(id) ON DELETE SET NULL",
                    quote_identifier(target)?
                ));
            }
            definitions.push(definition);
            kept.push(quote_identifier(&name)?);
        }
    }

    let staging = format!("{table}_rebuild");
    let mut columns = vec![
        "\"resource_id\" INTEGER PRIMARY KEY REFERENCES \"resources\"(id) ON DELETE CASCADE"
            .to_string(),
    ];
    columns.extend(definitions);
    let mut copied = vec!["\"resource_id\"".to_string()];
    copied.extend(kept);
    let copied = copied.join(", ");
    conn.execute_batch(&format!(
        "CREATE TABLE {staging_q} ({columns});
         INSERT INTO {staging_q} ({copied}) SELECT {copied} FROM {table_q};
         DROP TABLE {table_q};
         ALTER TABLE {staging_q} RENAME TO {table_q};",
        staging_q = quote_identifier(&staging)?,
        table_q = quote_identifier(table)?,
        columns = columns.join(", "),
    ))?;
    info!("event=ddl module=db op=rebuild_table table={table} dropped={column}");
    Ok(())
}

pub fn drop_table(conn: &Connection, table: &str) -> DbResult<()> {
    conn.execute_batch(&format!("DROP TABLE {};", quote_identifier(table)?))?;
    info!("event=ddl module=db op=drop_table table={table}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{
        add_column, create_class_table, drop_column, drop_table, quote_identifier,
        table_columns, table_exists, table_has_column, validate_identifier, ColumnSpec,
    };
    use rusqlite::Connection;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE resources (id INTEGER PRIMARY KEY);")
            .unwrap();
        conn
    }

    #[test]
    fn identifiers_are_validated() {
        assert!(validate_identifier("rc_task").is_ok());
        assert!(validate_identifier("_x1").is_ok());
        assert!(validate_identifier("1abc").is_err());
        assert!(validate_identifier("a b").is_err());
        assert!(validate_identifier("x\"; DROP TABLE y; --").is_err());
        assert!(validate_identifier("sqlite_master").is_err());
        assert_eq!(quote_identifier("title").unwrap(), "\"title\"");
    }

    #[test]
    fn class_table_lifecycle() {
        let conn = setup();
        create_class_table(&conn, "rc_doc", &[ColumnSpec::new("title", "TEXT")]).unwrap();
        assert!(table_exists(&conn, "rc_doc").unwrap());
        assert_eq!(
            table_columns(&conn, "rc_doc").unwrap(),
            vec!["resource_id".to_string(), "title".to_string()]
        );

        add_column(
            &conn,
            "rc_doc",
            &ColumnSpec::new("author", "INTEGER").referencing("resources"),
        )
        .unwrap();
        assert!(table_has_column(&conn, "rc_doc", "author").unwrap());

        drop_column(&conn, "rc_doc", "title").unwrap();
        assert!(!table_has_column(&conn, "rc_doc", "title").unwrap());

        drop_table(&conn, "rc_doc").unwrap();
        assert!(!table_exists(&conn, "rc_doc").unwrap());
    }

    #[test]
    fn dropping_a_foreign_key_column_rebuilds_the_table() {
        let conn = setup();
        conn.execute_batch("INSERT INTO resources (id) VALUES (1), (2);")
            .unwrap();
        create_class_table(
            &conn,
            "rc_doc",
            &[
                ColumnSpec::new("title", "TEXT"),
                ColumnSpec::new("author", "INTEGER").referencing("resources"),
                ColumnSpec::new("reviewer", "INTEGER").referencing("resources"),
            ],
        )
        .unwrap();
        conn.execute_batch(
            "INSERT INTO rc_doc (resource_id, title, author, reviewer) VALUES (1, 'a', 2, 2);",
        )
        .unwrap();

        drop_column(&conn, "rc_doc", "author").unwrap();

        assert_eq!(
            table_columns(&conn, "rc_doc").unwrap(),
            vec![
                "resource_id".to_string(),
                "title".to_string(),
                "reviewer".to_string()
            ]
        );
        let (title, reviewer): (String, i64) = conn
            .query_row(
                "SELECT title, reviewer FROM rc_doc WHERE resource_id = 1;",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(title, "a");
        assert_eq!(reviewer, 2);
        assert!(!table_exists(&conn, "rc_doc_rebuild").unwrap());

        drop_table(&conn, "rc_doc").unwrap();
        assert!(!table_exists(&conn, "rc_doc").unwrap());
    }
}
