use crate::core::db;
use crate::core::error;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Mutex;

/// The DB Broker is the single door to the SQLite files.
///
/// Every call acquires the broker lock, opens a fresh connection, runs the
/// closure and drops the connection before returning. Nothing holds a
/// connection across calls, so each closure is its own unit of atomicity.
#[derive(Debug, Default)]
pub struct DbBroker {
    lock: Mutex<()>,
}

impl DbBroker {
    pub fn new() -> Self {
        Self {
            lock: Mutex::new(()),
        }
    }

    /// Execute a closure with a serialized connection to the specified DB.
    pub fn with_conn<F, R>(&self, db_path: &Path, op_name: &str, f: F) -> Result<R, error::FormlinkError>
    where
        F: FnOnce(&Connection) -> Result<R, error::FormlinkError>,
    {
        let _lock = self.lock.lock().map_err(|_| {
            error::FormlinkError::ValidationError("DbBroker lock poisoned".to_string())
        })?;

        let db_id = db_path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();
        let conn = db::db_connect(db_path)?;

        let result = f(&conn);
        drop(conn);

        match &result {
            Ok(_) => tracing::trace!(db = %db_id, op = op_name, "broker op ok"),
            Err(e) => tracing::debug!(db = %db_id, op = op_name, error = %e, "broker op failed"),
        }

        result
    }
}
