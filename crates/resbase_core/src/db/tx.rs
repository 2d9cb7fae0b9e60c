//! Transaction scoping shared by services.
//!
//! A service call opens an immediate transaction when the connection is in
//! autocommit mode and otherwise joins the caller's open transaction, so a
//! caller can group several service calls into one unit of work.

use rusqlite::{Connection, Transaction, TransactionBehavior};

/// Runs `body` inside a transaction on `conn`.
///
/// The transaction is committed when `body` succeeds and rolled back (on drop)
/// when it fails. When a transaction is already open the body runs inside it
/// and the caller keeps commit/rollback responsibility.
pub fn with_transaction<T, E>(
    conn: &Connection,
    body: impl FnOnce(&Connection) -> Result<T, E>,
) -> Result<T, E>
where
    E: From<rusqlite::Error>,
{
    if !conn.is_autocommit() {
        return body(conn);
    }

    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let value = body(&tx)?;
    tx.commit()?;
    Ok(value)
}
