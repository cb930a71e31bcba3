//! Instance and form-template storage.
//!
//! The linking engine only sees the `InstanceStore` and `FormStore` traits.
//! `Catalog` is the SQLite implementation used by the CLI and tests.

use crate::core::broker::DbBroker;
use crate::core::error::FormlinkError;
use crate::core::schemas;
use crate::core::time;
use crate::subforms::relations::InstanceId;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InstanceStatus {
    #[serde(rename = "incomplete")]
    Incomplete,
    #[serde(rename = "complete")]
    Complete,
    #[serde(rename = "submitted")]
    Submitted,
    #[serde(rename = "submissionFailed")]
    SubmissionFailed,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Incomplete => "incomplete",
            Self::Complete => "complete",
            Self::Submitted => "submitted",
            Self::SubmissionFailed => "submissionFailed",
        }
    }
}

impl FromStr for InstanceStatus {
    type Err = FormlinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "incomplete" => Ok(Self::Incomplete),
            "complete" => Ok(Self::Complete),
            "submitted" => Ok(Self::Submitted),
            "submissionFailed" => Ok(Self::SubmissionFailed),
            other => Err(FormlinkError::ValidationError(format!(
                "unknown instance status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceRecord {
    pub id: InstanceId,
    pub form_id: String,
    pub instance_path: PathBuf,
    pub display_name: String,
    pub status: InstanceStatus,
    pub last_status_change: String,
}

/// Storage of filled form instances.
pub trait InstanceStore: Send + Sync {
    /// Register an instance file under `incomplete`.
    fn create(&self, form_id: &str, instance_path: &Path, title: &str)
    -> Result<InstanceId, FormlinkError>;
    fn set_status(&self, id: InstanceId, status: InstanceStatus) -> Result<(), FormlinkError>;
    fn set_title(&self, id: InstanceId, title: &str) -> Result<(), FormlinkError>;
    fn path_of(&self, id: InstanceId) -> Result<Option<PathBuf>, FormlinkError>;
    fn id_from_path(&self, path: &Path) -> Result<Option<InstanceId>, FormlinkError>;
    /// Oldest or newest instance of a form template.
    fn id_from_form_id(
        &self,
        form_id: &str,
        newest_first: bool,
    ) -> Result<Option<InstanceId>, FormlinkError>;
    fn form_id_of(&self, id: InstanceId) -> Result<Option<String>, FormlinkError>;
    fn get(&self, id: InstanceId) -> Result<Option<InstanceRecord>, FormlinkError>;
    /// Remove the instance's files and its record. `false` if it did not exist.
    /// A file that cannot be removed is logged; the record still goes.
    fn delete(&self, id: InstanceId) -> Result<bool, FormlinkError>;
}

/// Lookup of form templates by form id.
pub trait FormStore: Send + Sync {
    fn form_path(&self, form_id: &str) -> Result<Option<PathBuf>, FormlinkError>;
}

pub struct Catalog {
    broker: DbBroker,
    db_path: PathBuf,
}

impl Catalog {
    pub fn open(db_path: &Path) -> Result<Self, FormlinkError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let catalog = Self {
            broker: DbBroker::new(),
            db_path: db_path.to_path_buf(),
        };
        catalog
            .broker
            .with_conn(&catalog.db_path, "catalog.init", |conn| {
                conn.execute(schemas::CATALOG_DB_SCHEMA_FORMS, [])?;
                conn.execute(schemas::CATALOG_DB_SCHEMA_INSTANCES, [])?;
                conn.execute(schemas::CATALOG_DB_SCHEMA_INDEX_FORM, [])?;
                Ok(())
            })?;
        Ok(catalog)
    }

    /// Register a template file. Later registrations of the same form id win.
    pub fn register_form(
        &self,
        form_id: &str,
        version: Option<&str>,
        display_name: &str,
        form_path: &Path,
    ) -> Result<i64, FormlinkError> {
        self.broker
            .with_conn(&self.db_path, "catalog.register_form", |conn| {
                conn.execute(
                    "INSERT INTO forms (form_id, version, display_name, form_path, registered_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(form_path) DO UPDATE SET
                        form_id = excluded.form_id,
                        version = excluded.version,
                        display_name = excluded.display_name,
                        registered_at = excluded.registered_at",
                    params![
                        form_id,
                        version,
                        display_name,
                        form_path.to_string_lossy().to_string(),
                        time::now_epoch_z()
                    ],
                )?;
                let id = conn.query_row(
                    "SELECT id FROM forms WHERE form_path = ?1",
                    [form_path.to_string_lossy().to_string()],
                    |row| row.get(0),
                )?;
                Ok(id)
            })
    }

    pub fn list_instances(&self) -> Result<Vec<InstanceRecord>, FormlinkError> {
        self.broker
            .with_conn(&self.db_path, "catalog.list_instances", |conn| {
                let mut stmt = conn.prepare(&format!("{} ORDER BY id", SELECT_INSTANCE))?;
                let rows = stmt.query_map([], row_to_raw)?;
                let raw = rows.collect::<Result<Vec<_>, _>>()?;
                raw.into_iter().map(into_record).collect()
            })
    }
}

const SELECT_INSTANCE: &str = "SELECT id, form_id, instance_path, display_name, status, last_status_change FROM instances";

type RawInstance = (InstanceId, String, String, String, String, String);

fn row_to_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawInstance> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn into_record(raw: RawInstance) -> Result<InstanceRecord, FormlinkError> {
    let (id, form_id, path, display_name, status, last_status_change) = raw;
    Ok(InstanceRecord {
        id,
        form_id,
        instance_path: PathBuf::from(path),
        display_name,
        status: status.parse()?,
        last_status_change,
    })
}

fn fetch_instance(conn: &Connection, id: InstanceId) -> Result<Option<InstanceRecord>, FormlinkError> {
    let raw = conn
        .query_row(&format!("{} WHERE id = ?1", SELECT_INSTANCE), [id], row_to_raw)
        .optional()?;
    raw.map(into_record).transpose()
}

/// Instances created by formlink live alone in a folder named after the
/// file stem; that folder (with its attachments) goes with the instance.
fn remove_instance_files(path: &Path) -> Result<(), FormlinkError> {
    let dedicated_dir = path.parent().filter(|dir| {
        dir.file_name().is_some() && dir.file_name() == path.file_stem()
    });
    match dedicated_dir {
        Some(dir) if dir.exists() => fs::remove_dir_all(dir)?,
        _ if path.exists() => fs::remove_file(path)?,
        _ => {}
    }
    Ok(())
}

impl InstanceStore for Catalog {
    fn create(
        &self,
        form_id: &str,
        instance_path: &Path,
        title: &str,
    ) -> Result<InstanceId, FormlinkError> {
        self.broker.with_conn(&self.db_path, "catalog.create", |conn| {
            conn.execute(
                "INSERT INTO instances (form_id, instance_path, display_name, status, last_status_change)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    form_id,
                    instance_path.to_string_lossy().to_string(),
                    title,
                    InstanceStatus::Incomplete.as_str(),
                    time::now_epoch_z()
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    fn set_status(&self, id: InstanceId, status: InstanceStatus) -> Result<(), FormlinkError> {
        self.broker.with_conn(&self.db_path, "catalog.set_status", |conn| {
            let changed = conn.execute(
                "UPDATE instances SET status = ?1, last_status_change = ?2 WHERE id = ?3",
                params![status.as_str(), time::now_epoch_z(), id],
            )?;
            if changed == 0 {
                return Err(FormlinkError::NotFound(format!("instance {}", id)));
            }
            Ok(())
        })
    }

    fn set_title(&self, id: InstanceId, title: &str) -> Result<(), FormlinkError> {
        self.broker.with_conn(&self.db_path, "catalog.set_title", |conn| {
            let changed = conn.execute(
                "UPDATE instances SET display_name = ?1 WHERE id = ?2",
                params![title, id],
            )?;
            if changed == 0 {
                return Err(FormlinkError::NotFound(format!("instance {}", id)));
            }
            Ok(())
        })
    }

    fn path_of(&self, id: InstanceId) -> Result<Option<PathBuf>, FormlinkError> {
        self.broker.with_conn(&self.db_path, "catalog.path_of", |conn| {
            let path: Option<String> = conn
                .query_row(
                    "SELECT instance_path FROM instances WHERE id = ?1",
                    [id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(path.map(PathBuf::from))
        })
    }

    fn id_from_path(&self, path: &Path) -> Result<Option<InstanceId>, FormlinkError> {
        self.broker.with_conn(&self.db_path, "catalog.id_from_path", |conn| {
            let id = conn
                .query_row(
                    "SELECT id FROM instances WHERE instance_path = ?1",
                    [path.to_string_lossy().to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(id)
        })
    }

    fn id_from_form_id(
        &self,
        form_id: &str,
        newest_first: bool,
    ) -> Result<Option<InstanceId>, FormlinkError> {
        let order = if newest_first { "DESC" } else { "ASC" };
        self.broker
            .with_conn(&self.db_path, "catalog.id_from_form_id", |conn| {
                let id = conn
                    .query_row(
                        &format!(
                            "SELECT id FROM instances WHERE form_id = ?1 ORDER BY id {} LIMIT 1",
                            order
                        ),
                        [form_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(id)
            })
    }

    fn form_id_of(&self, id: InstanceId) -> Result<Option<String>, FormlinkError> {
        self.broker.with_conn(&self.db_path, "catalog.form_id_of", |conn| {
            let form_id = conn
                .query_row("SELECT form_id FROM instances WHERE id = ?1", [id], |row| {
                    row.get(0)
                })
                .optional()?;
            Ok(form_id)
        })
    }

    fn get(&self, id: InstanceId) -> Result<Option<InstanceRecord>, FormlinkError> {
        self.broker
            .with_conn(&self.db_path, "catalog.get", |conn| fetch_instance(conn, id))
    }

    fn delete(&self, id: InstanceId) -> Result<bool, FormlinkError> {
        self.broker.with_conn(&self.db_path, "catalog.delete", |conn| {
            let Some(record) = fetch_instance(conn, id)? else {
                return Ok(false);
            };
            if let Err(err) = remove_instance_files(&record.instance_path) {
                tracing::warn!(
                    instance_id = id,
                    path = %record.instance_path.display(),
                    error = %err,
                    "instance files not removed"
                );
            }
            conn.execute("DELETE FROM instances WHERE id = ?1", [id])?;
            Ok(true)
        })
    }
}

impl FormStore for Catalog {
    fn form_path(&self, form_id: &str) -> Result<Option<PathBuf>, FormlinkError> {
        self.broker.with_conn(&self.db_path, "catalog.form_path", |conn| {
            let path: Option<String> = conn
                .query_row(
                    "SELECT form_path FROM forms WHERE form_id = ?1 ORDER BY id DESC LIMIT 1",
                    [form_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(path.map(PathBuf::from))
        })
    }
}
