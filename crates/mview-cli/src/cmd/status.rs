//! `mview status`: state, head version and lag of one or all views.

use std::io::Write;

use anyhow::Result;
use clap::Args;
use mview_core::{Changelog, SqliteChangelog, SqliteStateStore, StateStore, UpdateError, ViewState};
use rusqlite::Connection;
use serde::Serialize;

use super::DataDir;
use crate::output::{OutputMode, render};

/// Arguments for `mview status`.
#[derive(Args, Debug, Default)]
pub struct StatusArgs {
    /// Show only this view.
    pub view: Option<String>,
}

#[derive(Debug, Serialize)]
struct ViewSummary {
    view: String,
    status: String,
    last_processed_version: u64,
    /// `None` when the changelog table is missing.
    head_version: Option<u64>,
    lag: u64,
    updated_at_us: i64,
}

fn summarize(conn: &Connection, state: ViewState) -> Result<ViewSummary> {
    let changelog = SqliteChangelog::new(conn, &state.view_id)?;
    let head_version = match changelog.head_version() {
        Ok(head) => Some(head),
        Err(UpdateError::ChangelogUnavailable { .. }) => None,
        Err(err) => return Err(err.into()),
    };
    Ok(ViewSummary {
        lag: head_version.map_or(0, |head| head.saturating_sub(state.last_processed_version)),
        status: state.status.to_string(),
        last_processed_version: state.last_processed_version,
        head_version,
        updated_at_us: state.updated_at_us,
        view: state.view_id,
    })
}

/// Execute `mview status`.
///
/// # Errors
///
/// Returns an error if the data directory is not initialized or the database
/// cannot be read.
pub fn run_status(args: &StatusArgs, data_dir: &DataDir, output: OutputMode) -> Result<()> {
    let conn = data_dir.open_database()?;
    let store = SqliteStateStore::new(&conn);

    let states = match &args.view {
        Some(view) => vec![store.load(view)?],
        None => store.list()?,
    };
    let views = states
        .into_iter()
        .map(|state| summarize(&conn, state))
        .collect::<Result<Vec<_>>>()?;

    render(output, &views, |views, w| {
        if views.is_empty() {
            return writeln!(w, "No views. Create one with `mview init <view>`.");
        }
        writeln!(
            w,
            "{:<24} {:<10} {:>12} {:>12} {:>8}",
            "VIEW", "STATUS", "CHECKPOINT", "HEAD", "LAG"
        )?;
        for v in views {
            let head = v
                .head_version
                .map_or_else(|| "-".to_string(), |head| head.to_string());
            writeln!(
                w,
                "{:<24} {:<10} {:>12} {:>12} {:>8}",
                v.view, v.status, v.last_processed_version, head, v.lag
            )?;
        }
        Ok(())
    })
}
