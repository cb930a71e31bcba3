//! Workspace handle: the directory holding formlink's databases, form
//! templates and instance folders.

use crate::core::config::{self, Config};
use crate::core::error::FormlinkError;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct Workspace {
    /// Absolute path to the workspace root directory
    pub root: PathBuf,
    pub config: Config,
}

impl Workspace {
    /// Open a workspace, reading `formlink.toml` when present.
    pub fn open(root: &Path) -> Result<Self, FormlinkError> {
        let config = config::load_config(root)?;
        Ok(Self::with_config(root, config))
    }

    pub fn with_config(root: &Path, config: Config) -> Self {
        Self {
            root: root.to_path_buf(),
            config,
        }
    }

    pub fn relations_db_path(&self) -> PathBuf {
        self.root.join(&self.config.storage.relations_db)
    }

    pub fn catalog_db_path(&self) -> PathBuf {
        self.root.join(&self.config.storage.catalog_db)
    }

    pub fn instances_dir(&self) -> PathBuf {
        self.root.join(&self.config.storage.instances_dir)
    }

    pub fn forms_dir(&self) -> PathBuf {
        self.root.join(&self.config.storage.forms_dir)
    }

    /// Create the directory layout. Databases are created by their stores.
    pub fn ensure_layout(&self) -> Result<(), FormlinkError> {
        fs::create_dir_all(&self.root)?;
        fs::create_dir_all(self.instances_dir())?;
        fs::create_dir_all(self.forms_dir())?;
        Ok(())
    }
}
