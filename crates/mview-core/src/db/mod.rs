//! SQLite database holding view state and per-view changelog tables.
//!
//! Runtime defaults:
//! - `journal_mode = WAL` so an operator tool can read or flip the suspend
//!   flag while a pass holds a write transaction
//! - `synchronous = NORMAL`, which under WAL still survives process crashes
//! - `busy_timeout = 5s` to ride out short lock contention

pub mod migrations;
pub mod schema;

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::{path::Path, time::Duration};

/// Busy timeout used for state DB connections.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// File name of the database inside the data directory.
pub const DB_FILE_NAME: &str = "mview.db";

/// Open (or create) the state database, apply runtime pragmas, and migrate
/// the schema to the latest version.
///
/// # Errors
///
/// Returns an error if opening/configuring/migrating the database fails.
pub fn open_database(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create database directory {}", parent.display()))?;
    }

    let mut conn = Connection::open(path)
        .with_context(|| format!("open state database {}", path.display()))?;

    configure_connection(&conn).context("configure sqlite pragmas")?;
    migrations::migrate(&mut conn).context("apply state migrations")?;

    Ok(conn)
}

/// Open the database only if it already exists.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be opened or migrated.
pub fn open_existing(path: &Path) -> Result<Option<Connection>> {
    if !path.exists() {
        return Ok(None);
    }
    open_database(path).map(Some)
}

fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    let _journal_mode: String =
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{DEFAULT_BUSY_TIMEOUT, open_database, open_existing};
    use crate::db::migrations;
    use tempfile::TempDir;

    fn temp_db_path() -> (TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("nested/mview.db");
        (dir, path)
    }

    #[test]
    fn open_database_sets_wal_and_busy_timeout() {
        let (_dir, path) = temp_db_path();
        let conn = open_database(&path).expect("open state db");

        let journal_mode: String = conn
            .pragma_query_value(None, "journal_mode", |row| row.get(0))
            .expect("query journal_mode");
        assert_eq!(journal_mode.to_ascii_lowercase(), "wal");

        let busy_timeout_ms: u64 = conn
            .pragma_query_value(None, "busy_timeout", |row| row.get(0))
            .expect("query busy_timeout");
        assert_eq!(
            u128::from(busy_timeout_ms),
            DEFAULT_BUSY_TIMEOUT.as_millis()
        );
    }

    #[test]
    fn open_database_runs_migrations() {
        let (_dir, path) = temp_db_path();
        let conn = open_database(&path).expect("open state db");

        let version = migrations::current_schema_version(&conn).expect("schema version query");
        assert_eq!(version, migrations::LATEST_SCHEMA_VERSION);
    }

    #[test]
    fn open_existing_skips_missing_file() {
        let (_dir, path) = temp_db_path();
        assert!(open_existing(&path).expect("no io error").is_none());

        drop(open_database(&path).expect("create"));
        assert!(open_existing(&path).expect("reopen").is_some());
    }
}
