//! Persistent parent-node ↔ child-node links.
//!
//! Each row says: node `parent_node` of instance `parent_id` feeds node
//! `child_node` of instance `child_id`. `(parent_id, parent_node)` is unique.
//! The save-form node of a link is stored with an empty `child_node`; it ties
//! the child to its repeat position without mapping any value.
//!
//! Every method opens and closes its own connection through the broker, so a
//! management pass issues many short transactions rather than one.

use crate::core::broker::DbBroker;
use crate::core::db;
use crate::core::error::FormlinkError;
use crate::core::schemas;
use crate::subforms::paths;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::Serialize;
use std::path::{Path, PathBuf};

pub type InstanceId = i64;

/// `child_node` value of the row anchoring a child at its save-form node.
pub const FORM_LINK_NODE: &str = "";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelationshipRecord {
    pub parent_id: InstanceId,
    pub parent_node: String,
    pub repeatable_root: Option<String>,
    pub repeat_index: Option<i64>,
    pub child_id: InstanceId,
    pub child_node: String,
}

impl RelationshipRecord {
    /// `repeat_index` of -1 (not in a repeat) is stored as NULL.
    pub fn new(
        parent_id: InstanceId,
        parent_node: &str,
        repeatable_root: Option<&str>,
        repeat_index: i64,
        child_id: InstanceId,
        child_node: &str,
    ) -> Self {
        Self {
            parent_id,
            parent_node: parent_node.to_string(),
            repeatable_root: repeatable_root.map(str::to_string),
            repeat_index: stored_index(repeat_index),
            child_id,
            child_node: child_node.to_string(),
        }
    }
}

fn stored_index(repeat_index: i64) -> Option<i64> {
    (repeat_index >= 0).then_some(repeat_index)
}

pub struct RelationStore {
    broker: DbBroker,
    db_path: PathBuf,
}

impl RelationStore {
    /// Open the store, creating the table or rebuilding it when the stored
    /// schema version differs. Rebuilding discards every link.
    pub fn open(db_path: &Path) -> Result<Self, FormlinkError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let store = Self {
            broker: DbBroker::new(),
            db_path: db_path.to_path_buf(),
        };
        store
            .broker
            .with_conn(&store.db_path, "relations.init", ensure_schema)?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Insert one link. On a `(parent_id, parent_node)` conflict either fail
    /// with `DuplicateLink` or, with `ignore_conflict`, return `Ok(None)`.
    pub fn insert(
        &self,
        record: &RelationshipRecord,
        ignore_conflict: bool,
    ) -> Result<Option<i64>, FormlinkError> {
        self.broker
            .with_conn(&self.db_path, "relations.insert", |conn| {
                let inserted = conn.execute(
                    "INSERT INTO relations
                        (parent_id, parent_node, repeatable_root, repeat_index, child_id, child_node)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        record.parent_id,
                        record.parent_node,
                        record.repeatable_root,
                        record.repeat_index,
                        record.child_id,
                        record.child_node,
                    ],
                );
                match inserted {
                    Ok(_) => Ok(Some(conn.last_insert_rowid())),
                    Err(rusqlite::Error::SqliteFailure(e, _))
                        if e.code == ErrorCode::ConstraintViolation =>
                    {
                        if ignore_conflict {
                            tracing::debug!(
                                parent_id = record.parent_id,
                                parent_node = %record.parent_node,
                                "link already present"
                            );
                            Ok(None)
                        } else {
                            Err(FormlinkError::DuplicateLink {
                                parent_id: record.parent_id,
                                parent_node: record.parent_node.clone(),
                            })
                        }
                    }
                    Err(e) => Err(e.into()),
                }
            })
    }

    /// Child linked to `parent` at `repeat_index` (-1 for no repeat).
    pub fn child_for(
        &self,
        parent: InstanceId,
        repeat_index: i64,
    ) -> Result<Option<InstanceId>, FormlinkError> {
        self.broker
            .with_conn(&self.db_path, "relations.child_for", |conn| {
                let child = conn
                    .query_row(
                        "SELECT child_id FROM relations
                         WHERE parent_id = ?1 AND repeat_index IS ?2
                         ORDER BY id LIMIT 1",
                        params![parent, stored_index(repeat_index)],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(child)
            })
    }

    /// Distinct children of `parent`, ascending.
    pub fn children_of(&self, parent: InstanceId) -> Result<Vec<InstanceId>, FormlinkError> {
        self.broker
            .with_conn(&self.db_path, "relations.children_of", |conn| {
                let mut stmt = conn.prepare(
                    "SELECT DISTINCT child_id FROM relations WHERE parent_id = ?1 ORDER BY child_id",
                )?;
                let rows = stmt.query_map([parent], |row| row.get(0))?;
                Ok(rows.collect::<Result<Vec<InstanceId>, _>>()?)
            })
    }

    pub fn parent_of(&self, child: InstanceId) -> Result<Option<InstanceId>, FormlinkError> {
        self.broker
            .with_conn(&self.db_path, "relations.parent_of", |conn| {
                let parent = conn
                    .query_row(
                        "SELECT parent_id FROM relations WHERE child_id = ?1 ORDER BY id LIMIT 1",
                        [child],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(parent)
            })
    }

    /// `(parent_node, child_node)` pairs used to push child values back to the parent.
    pub fn mappings_to_parent(
        &self,
        child: InstanceId,
    ) -> Result<Vec<(String, String)>, FormlinkError> {
        self.broker
            .with_conn(&self.db_path, "relations.mappings_to_parent", |conn| {
                let mut stmt = conn.prepare(
                    "SELECT parent_node, child_node FROM relations
                     WHERE child_id = ?1 AND child_node <> ?2
                     ORDER BY id",
                )?;
                let rows = stmt.query_map(params![child, FORM_LINK_NODE], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?;
                Ok(rows.collect::<Result<Vec<(String, String)>, _>>()?)
            })
    }

    /// All rows where `parent` is the parent side, ordered by repeat index.
    pub fn records_for_parent(
        &self,
        parent: InstanceId,
    ) -> Result<Vec<RelationshipRecord>, FormlinkError> {
        self.broker
            .with_conn(&self.db_path, "relations.records_for_parent", |conn| {
                let mut stmt = conn.prepare(
                    "SELECT parent_id, parent_node, repeatable_root, repeat_index, child_id, child_node
                     FROM relations WHERE parent_id = ?1
                     ORDER BY repeat_index, id",
                )?;
                let rows = stmt.query_map([parent], |row| {
                    Ok(RelationshipRecord {
                        parent_id: row.get(0)?,
                        parent_node: row.get(1)?,
                        repeatable_root: row.get(2)?,
                        repeat_index: row.get(3)?,
                        child_id: row.get(4)?,
                        child_node: row.get(5)?,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
    }

    pub fn delete_where_parent(&self, parent: InstanceId) -> Result<usize, FormlinkError> {
        self.broker
            .with_conn(&self.db_path, "relations.delete_where_parent", |conn| {
                Ok(conn.execute("DELETE FROM relations WHERE parent_id = ?1", [parent])?)
            })
    }

    pub fn delete_where_child(&self, child: InstanceId) -> Result<usize, FormlinkError> {
        self.broker
            .with_conn(&self.db_path, "relations.delete_where_child", |conn| {
                Ok(conn.execute("DELETE FROM relations WHERE child_id = ?1", [child])?)
            })
    }

    /// Shift every link of `parent` above `deleted_index` down by one,
    /// rewriting the bracket selector in `parent_node` and `repeatable_root`.
    ///
    /// `deleted_index` must be a repeat position (1 or greater); non-repeat
    /// links are never touched. Returns the number of rows renumbered.
    pub fn renumber_after_deletion(
        &self,
        parent: InstanceId,
        deleted_index: i64,
    ) -> Result<usize, FormlinkError> {
        if deleted_index < 1 {
            return Err(FormlinkError::ValidationError(format!(
                "repeat index must be 1 or greater, got {}",
                deleted_index
            )));
        }
        self.broker
            .with_conn(&self.db_path, "relations.renumber", |conn| {
                let tx = conn.unchecked_transaction()?;
                let rows: Vec<(i64, String, Option<String>, i64)> = {
                    let mut stmt = tx.prepare(
                        "SELECT id, parent_node, repeatable_root, repeat_index FROM relations
                         WHERE parent_id = ?1 AND repeat_index > ?2
                         ORDER BY repeat_index ASC, id ASC",
                    )?;
                    let mapped = stmt.query_map(params![parent, deleted_index], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                    })?;
                    mapped.collect::<Result<Vec<_>, _>>()?
                };

                let mut renumbered = 0;
                for (id, parent_node, repeatable_root, index) in rows {
                    debug_assert!(index > deleted_index && deleted_index >= 1);
                    let new_index = index - 1;
                    let new_node = paths::rewrite_repeat_index(&parent_node, index, new_index);
                    let new_root = repeatable_root
                        .as_deref()
                        .map(|r| paths::rewrite_repeat_index(r, index, new_index));
                    tx.execute(
                        "UPDATE relations SET parent_node = ?1, repeatable_root = ?2, repeat_index = ?3
                         WHERE id = ?4",
                        params![new_node, new_root, new_index, id],
                    )?;
                    renumbered += 1;
                }
                tx.commit()?;
                Ok(renumbered)
            })
    }
}

fn ensure_schema(conn: &Connection) -> Result<(), FormlinkError> {
    let version = db::schema_version(conn)?;
    if version != 0 && version != schemas::RELATIONS_SCHEMA_VERSION {
        tracing::warn!(
            found = version,
            expected = schemas::RELATIONS_SCHEMA_VERSION,
            "relations schema version changed; dropping existing links"
        );
        conn.execute(schemas::RELATIONS_DB_DROP, [])?;
    }
    conn.execute(schemas::RELATIONS_DB_SCHEMA, [])?;
    conn.execute(schemas::RELATIONS_DB_SCHEMA_INDEX_PARENT, [])?;
    conn.execute(schemas::RELATIONS_DB_SCHEMA_INDEX_CHILD, [])?;
    db::set_schema_version(conn, schemas::RELATIONS_SCHEMA_VERSION)?;
    Ok(())
}
