use std::io::Write;

use anyhow::{Context as _, Result};
use clap::Args;
use mview_core::{SqliteChangelog, SqliteStateStore, StateStore, ViewStatus};
use serde::Serialize;

use super::DataDir;
use crate::output::{OutputMode, pretty_kv, render};

#[derive(Args, Debug)]
pub struct InitArgs {
    /// View id (`[A-Za-z0-9_]`, at most 64 characters).
    pub view: String,
}

#[derive(Debug, Serialize)]
struct InitOutput {
    view: String,
    changelog_table: String,
    status: ViewStatus,
    last_processed_version: u64,
    database: String,
}

/// Execute `mview init`. Creates the database if needed, the view's
/// changelog table, and an idle state row. Running it again is harmless and
/// leaves an existing state row untouched.
///
/// # Errors
///
/// Returns an error for an invalid view id or if the database cannot be
/// created.
pub fn run_init(args: &InitArgs, data_dir: &DataDir, output: OutputMode) -> Result<()> {
    let conn = data_dir.create_database()?;
    let changelog = SqliteChangelog::new(&conn, &args.view)?;
    changelog
        .create()
        .with_context(|| format!("initialize view {}", args.view))?;

    let store = SqliteStateStore::new(&conn);
    let state = store.load(&args.view)?;
    store.save(&state)?;
    tracing::info!(view = %args.view, table = changelog.table_name(), "view initialized");

    let result = InitOutput {
        view: args.view.clone(),
        changelog_table: changelog.table_name().to_string(),
        status: state.status,
        last_processed_version: state.last_processed_version,
        database: data_dir.db_path().display().to_string(),
    };
    render(output, &result, |r, w| {
        writeln!(w, "✓ Initialized view {}", r.view)?;
        pretty_kv(w, "Changelog", &r.changelog_table)?;
        pretty_kv(w, "Status", r.status.as_str())?;
        pretty_kv(w, "Checkpoint", r.last_processed_version.to_string())?;
        pretty_kv(w, "Database", &r.database)
    })
}
