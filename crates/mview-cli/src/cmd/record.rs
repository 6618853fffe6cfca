use std::io::Write;

use anyhow::{Context as _, Result};
use clap::Args;
use mview_core::{EntityId, SqliteChangelog};
use serde::Serialize;

use super::DataDir;
use crate::output::{OutputMode, render};

#[derive(Args, Debug)]
pub struct RecordArgs {
    /// View whose changelog receives the records.
    pub view: String,

    /// Changed entity ids, one changelog version each.
    #[arg(required = true, num_args = 1..)]
    pub ids: Vec<EntityId>,
}

#[derive(Debug, Serialize)]
struct RecordOutput {
    view: String,
    recorded: usize,
    head_version: u64,
}

/// Execute `mview record`: append one change record per id, standing in for
/// the upstream hooks that normally populate a changelog.
///
/// # Errors
///
/// Returns an error if the data directory or the view's changelog does not
/// exist.
pub fn run_record(args: &RecordArgs, data_dir: &DataDir, output: OutputMode) -> Result<()> {
    let conn = data_dir.open_database()?;
    let changelog = SqliteChangelog::new(&conn, &args.view)?;
    let head = changelog
        .append(&args.ids)
        .with_context(|| format!("record changes for view {}", args.view))?;
    tracing::debug!(view = %args.view, count = args.ids.len(), head, "changes recorded");

    let result = RecordOutput {
        view: args.view.clone(),
        recorded: args.ids.len(),
        head_version: head,
    };
    render(output, &result, |r, w| {
        writeln!(
            w,
            "✓ Recorded {} change(s) for {} (head version {})",
            r.recorded, r.view, r.head_version
        )
    })
}
