//! `formlink.toml` loading.
//!
//! A missing file is not an error: every key has a default.

use crate::core::error::FormlinkError;
use crate::core::schemas;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const CONFIG_FILE_NAME: &str = "formlink.toml";

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct StorageConfig {
    #[serde(default = "StorageConfig::default_relations_db")]
    pub relations_db: String,
    #[serde(default = "StorageConfig::default_catalog_db")]
    pub catalog_db: String,
    #[serde(default = "StorageConfig::default_instances_dir")]
    pub instances_dir: String,
    #[serde(default = "StorageConfig::default_forms_dir")]
    pub forms_dir: String,
}

impl StorageConfig {
    fn default_relations_db() -> String {
        schemas::RELATIONS_DB_NAME.to_string()
    }

    fn default_catalog_db() -> String {
        schemas::CATALOG_DB_NAME.to_string()
    }

    fn default_instances_dir() -> String {
        "instances".to_string()
    }

    fn default_forms_dir() -> String {
        "forms".to_string()
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            relations_db: Self::default_relations_db(),
            catalog_db: Self::default_catalog_db(),
            instances_dir: Self::default_instances_dir(),
            forms_dir: Self::default_forms_dir(),
        }
    }
}

/// Binary attachments travel with a copied value when the value ends in one
/// of these suffixes.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct MediaConfig {
    #[serde(default = "MediaConfig::default_extensions")]
    pub extensions: Vec<String>,
}

impl MediaConfig {
    fn default_extensions() -> Vec<String> {
        [
            "jpg", "jpeg", "png", "gif", "bmp", "webp", "3gp", "3gpp", "mp4", "m4a", "amr", "wav",
            "mp3", "ogg", "aac", "webm", "pdf",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            extensions: Self::default_extensions(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default = "LoggingConfig::default_filter")]
    pub filter: String,
}

impl LoggingConfig {
    fn default_filter() -> String {
        "info".to_string()
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: Self::default_filter(),
        }
    }
}

/// Load `formlink.toml` from the workspace root.
pub fn load_config(root: &Path) -> Result<Config, FormlinkError> {
    let config_path = root.join(CONFIG_FILE_NAME);
    if !config_path.exists() {
        tracing::debug!(path = %config_path.display(), "no config file, using defaults");
        return Ok(Config::default());
    }
    let content = fs::read_to_string(&config_path).map_err(FormlinkError::IoError)?;
    let config: Config = toml::from_str(&content)
        .map_err(|e| FormlinkError::ConfigError(format!("{}: {}", config_path.display(), e)))?;
    Ok(config)
}
