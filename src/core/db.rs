use crate::core::error;
use rusqlite::Connection;
use std::path::Path;

pub fn db_connect(db_path: &Path) -> Result<Connection, error::FormlinkError> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .map_err(error::FormlinkError::RusqliteError)?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))
        .map_err(error::FormlinkError::RusqliteError)?;
    Ok(conn)
}

/// Reads `PRAGMA user_version`; 0 means the file was never initialized.
pub fn schema_version(conn: &Connection) -> Result<i64, error::FormlinkError> {
    let version = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
    Ok(version)
}

pub fn set_schema_version(conn: &Connection, version: i64) -> Result<(), error::FormlinkError> {
    // PRAGMA does not accept bound parameters.
    conn.execute_batch(&format!("PRAGMA user_version = {};", version))?;
    Ok(())
}
