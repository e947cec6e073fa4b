//! Shared SQLite helpers for the bundle stores

use crate::error::{PipelineError, Result};
use crate::types::Sid;
use rusqlite::Connection;

/// SQLite's default limit on host parameters is 999; stay below it
pub const MAX_SQL_PARAMS: usize = 900;

/// Maximum number of result columns produced by one pivot query
pub const DEFAULT_MAX_COLUMNS: usize = 500;

/// `?,?,?` with `n` placeholders
pub fn placeholders(n: usize) -> String {
    let mut s = String::with_capacity(n * 2);
    for i in 0..n {
        if i > 0 {
            s.push(',');
        }
        s.push('?');
    }
    s
}

/// Validate and quote a table name taken from user input.
///
/// Only `[A-Za-z0-9_]` is allowed; the result is double-quoted so that
/// names which collide with keywords still work.
pub fn quote_identifier(name: &str) -> Result<String> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(PipelineError::InvalidIdentifier(name.to_string()));
    }
    Ok(format!("\"{}\"", name))
}

/// Split a sid list into chunks no larger than `size`
pub fn sid_chunks(sids: &[Sid], size: usize) -> impl Iterator<Item = &[Sid]> {
    sids.chunks(size.max(1))
}

/// Whether `table` exists in the connected database
pub fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Pragmas applied to every store connection
pub fn configure_connection(conn: &Connection) -> Result<()> {
    // journal_mode answers with the resulting mode ("memory" for in-memory dbs)
    let _mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders() {
        assert_eq!(placeholders(0), "");
        assert_eq!(placeholders(1), "?");
        assert_eq!(placeholders(3), "?,?,?");
    }

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("sp500_liquid").unwrap(), "\"sp500_liquid\"");
        assert!(quote_identifier("drop table; --").is_err());
        assert!(quote_identifier("").is_err());
        assert!(quote_identifier("a\"b").is_err());
    }

    #[test]
    fn test_sid_chunks() {
        let sids: Vec<Sid> = (0..7).collect();
        let chunks: Vec<_> = sid_chunks(&sids, 3).collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2], &[6]);
    }

    #[test]
    fn test_table_exists() {
        let conn = Connection::open_in_memory().unwrap();
        assert!(!table_exists(&conn, "prices").unwrap());
        conn.execute("CREATE TABLE prices (x INTEGER)", []).unwrap();
        assert!(table_exists(&conn, "prices").unwrap());
    }
}
