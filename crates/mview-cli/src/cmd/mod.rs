pub mod control;
pub mod init;
pub mod record;
pub mod status;
pub mod update;

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Result;
use mview_core::config::{CONFIG_FILE_NAME, MviewConfig, load_config};
use mview_core::db;
use rusqlite::Connection;

/// The data directory holds no database yet.
#[derive(Debug)]
pub struct NotInitialized {
    pub path: PathBuf,
}

impl fmt::Display for NotInitialized {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no mview database at {}", self.path.display())
    }
}

impl std::error::Error for NotInitialized {}

/// Resolved paths under `--data-dir`.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
    config_override: Option<PathBuf>,
}

impl DataDir {
    pub const fn new(root: PathBuf, config_override: Option<PathBuf>) -> Self {
        Self {
            root,
            config_override,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn db_path(&self) -> PathBuf {
        self.root.join(db::DB_FILE_NAME)
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_override
            .clone()
            .unwrap_or_else(|| self.root.join(CONFIG_FILE_NAME))
    }

    /// Load `config.toml` (or `--config`), falling back to defaults.
    pub fn load_config(&self) -> Result<MviewConfig> {
        load_config(&self.config_path())
    }

    /// Open the database, creating the directory and schema if needed.
    pub fn create_database(&self) -> Result<Connection> {
        db::open_database(&self.db_path())
    }

    /// Open the database of an initialized data directory.
    pub fn open_database(&self) -> Result<Connection> {
        let path = self.db_path();
        db::open_existing(&path)?.ok_or_else(|| NotInitialized { path }.into())
    }
}
