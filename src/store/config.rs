//! # Store Configuration
//!
//! The `[database]` section of the configuration file selects the certificate store backend.
use std::path::PathBuf;

use anyhow::Result;
use serde::Deserialize;

use crate::config::InsertConfigRoot;

/// Which backend keeps the certificate records.
#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DatabaseConfig {
    /// Records live in process memory and are lost on exit.
    #[default]
    Mem,
    /// Records live in a SQLite database file.
    Sqlite { path: PathBuf },
}

impl InsertConfigRoot for DatabaseConfig {
    /// Resolves a relative database path against the directory of the configuration file.
    fn insert_config_path(&mut self, config_root: &PathBuf) -> Result<()> {
        if let DatabaseConfig::Sqlite { path } = self {
            if !path.has_root() {
                let mut db_path = config_root.clone();
                db_path.push(&*path);
                *path = db_path;
            }
        }
        Ok(())
    }

    /// The database file and its directory are created on first use.
    fn check_paths(&self) -> Result<()> {
        if let DatabaseConfig::Sqlite { path } = self {
            if path.as_os_str().is_empty() || path.is_dir() {
                anyhow::bail!("database path {:?} is not a file", path);
            }
        }
        Ok(())
    }
}
