use rusqlite;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FormlinkError {
    #[error("SQLite error: {0}")]
    RusqliteError(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("XML error: {0}")]
    XmlError(String),
    #[error("Config error: {0}")]
    ConfigError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("save-form id not found: {0}")]
    FormNotFound(String),
    #[error("Relationship already exists for instance {parent_id} at {parent_node}")]
    DuplicateLink { parent_id: i64, parent_node: String },
}
