//! Centralized database schema definitions for the formlink stores.
//!
//! formlink keeps two SQLite files:
//! 1. relations.db: parent/child subform links.
//! 2. catalog.db: form templates and form instances (the external storage
//!    the linking engine consumes through traits).

// --- 1. Relations ---
pub const RELATIONS_DB_NAME: &str = "relations.db";

/// Bumping this drops and recreates the `relations` table on next open.
pub const RELATIONS_SCHEMA_VERSION: i64 = 2;

pub const RELATIONS_DB_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS relations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        parent_id INTEGER NOT NULL,
        parent_node TEXT NOT NULL,
        repeatable_root TEXT,
        repeat_index INTEGER,
        child_id INTEGER NOT NULL,
        child_node TEXT NOT NULL,
        UNIQUE(parent_id, parent_node)
    )
";
pub const RELATIONS_DB_SCHEMA_INDEX_PARENT: &str =
    "CREATE INDEX IF NOT EXISTS idx_relations_parent ON relations(parent_id, repeat_index)";
pub const RELATIONS_DB_SCHEMA_INDEX_CHILD: &str =
    "CREATE INDEX IF NOT EXISTS idx_relations_child ON relations(child_id)";
pub const RELATIONS_DB_DROP: &str = "DROP TABLE IF EXISTS relations";

// --- 2. Catalog ---
pub const CATALOG_DB_NAME: &str = "catalog.db";

pub const CATALOG_DB_SCHEMA_FORMS: &str = "
    CREATE TABLE IF NOT EXISTS forms (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        form_id TEXT NOT NULL,
        version TEXT,
        display_name TEXT NOT NULL,
        form_path TEXT NOT NULL UNIQUE,
        registered_at TEXT NOT NULL
    )
";
pub const CATALOG_DB_SCHEMA_INSTANCES: &str = "
    CREATE TABLE IF NOT EXISTS instances (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        form_id TEXT NOT NULL,
        instance_path TEXT NOT NULL UNIQUE,
        display_name TEXT NOT NULL,
        status TEXT NOT NULL,
        last_status_change TEXT NOT NULL
    )
";
pub const CATALOG_DB_SCHEMA_INDEX_FORM: &str =
    "CREATE INDEX IF NOT EXISTS idx_instances_form ON instances(form_id)";
