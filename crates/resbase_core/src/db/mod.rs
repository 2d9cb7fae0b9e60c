//! SQLite storage bootstrap, schema migration and DDL entry points.
//!
//! # Responsibility
//! - Open and configure SQLite connections for the repository core.
//! - Apply the fixed catalog/value-table migrations in deterministic order.
//! - Provide the DDL primitives used by schema evolution.
//!
//! # Invariants
//! - Migration version is tracked via `PRAGMA user_version`.
//! - Core code must not read/write repository data before migrations succeed.
//! - Dynamic identifiers reach SQL only after `ddl::validate_identifier`.

use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod ddl;
pub mod migrations;
mod open;
mod tx;

pub use open::{open_db, open_db_in_memory, open_with_config};
pub use tx::with_transaction;

pub type DbResult<T> = Result<T, DbError>;

#[derive(Debug)]
pub enum DbError {
    Sqlite(rusqlite::Error),
    UnsupportedSchemaVersion {
        db_version: u32,
        latest_supported: u32,
    },
    /// A table or column name is not a plain SQL identifier.
    InvalidIdentifier(String),
}

impl Display for DbError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(err) => write!(f, "{err}"),
            Self::UnsupportedSchemaVersion {
                db_version,
                latest_supported,
            } => write!(
                f,
                "database schema version {db_version} is newer than supported {latest_supported}"
            ),
            Self::InvalidIdentifier(name) => write!(f, "invalid SQL identifier `{name}`"),
        }
    }
}

impl Error for DbError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Sqlite(err) => Some(err),
            Self::UnsupportedSchemaVersion { .. } => None,
            Self::InvalidIdentifier(_) => None,
        }
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}
