//! `mview update`: run one incremental pass, or with `--full` a full
//! reindex, for a view.

use std::io::{self, Write};
use std::process::{Command, ExitCode, Stdio};
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use clap::Args;
use mview_core::changelog::validate_view_id;
use mview_core::lock::ViewLock;
use mview_core::{
    Action, CancelToken, EntityId, PassMode, SqliteChangelog, SqliteStateStore,
    UpdateCoordinator, UpdateOutcome, UpdateReport,
};
use serde::Serialize;

use super::DataDir;
use crate::output::{OutputMode, render};
use crate::signals;

/// Exit status of a pass stopped by a signal (`EX_TEMPFAIL`): the view is
/// restored and the next run resumes from the checkpoint.
pub const EXIT_INTERRUPTED: u8 = 75;

#[derive(Args, Debug)]
pub struct UpdateArgs {
    /// View to update.
    pub view: String,

    /// Re-apply every id in the changelog instead of those past the
    /// checkpoint.
    #[arg(long)]
    pub full: bool,

    /// Run PROGRAM [ARGS...] once per chunk with the chunk's ids appended as
    /// arguments. Must be the last option on the command line.
    #[arg(long, num_args = 1.., allow_hyphen_values = true, value_name = "PROGRAM")]
    pub exec: Option<Vec<String>>,

    /// Seconds to wait for another `mview update` on the same view.
    #[arg(long, default_value_t = 0)]
    pub wait: u64,
}

/// Runs an external program per chunk. A non-zero exit fails the pass.
#[derive(Debug)]
pub struct ExecAction {
    program: String,
    args: Vec<String>,
    view: String,
    quiet_stdout: bool,
}

impl ExecAction {
    pub fn new(command: &[String], view: &str, output: OutputMode) -> Result<Self> {
        let Some((program, args)) = command.split_first() else {
            bail!("--exec requires a program");
        };
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            view: view.to_string(),
            quiet_stdout: output.is_json(),
        })
    }
}

impl Action for ExecAction {
    fn apply(&mut self, ids: &[EntityId]) -> Result<()> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .args(ids.iter().map(ToString::to_string))
            .env("MVIEW_VIEW", &self.view);
        if self.quiet_stdout {
            // Keep stdout a single JSON document.
            command.stdout(Stdio::from(io::stderr()));
        }

        let status = command
            .status()
            .with_context(|| format!("spawn `{}`", self.program))?;
        if !status.success() {
            bail!("`{}` exited with {status}", self.program);
        }
        Ok(())
    }
}

/// Dry action: one line per chunk, ids separated by spaces.
#[derive(Debug)]
pub struct PrintAction<W> {
    out: W,
}

impl<W: Write> PrintAction<W> {
    pub const fn new(out: W) -> Self {
        Self { out }
    }
}

impl<W: Write> Action for PrintAction<W> {
    fn apply(&mut self, ids: &[EntityId]) -> Result<()> {
        writeln!(self.out, "{}", format_chunk(ids))?;
        self.out.flush()?;
        Ok(())
    }
}

fn format_chunk(ids: &[EntityId]) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Serialize)]
struct UpdateOutput {
    #[serde(flatten)]
    report: UpdateReport,
    elapsed_ms: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    chunks: Option<Vec<Vec<EntityId>>>,
}

/// Execute `mview update`.
///
/// # Errors
///
/// Returns an error if another process holds the view's lock, the data
/// directory is not initialized, or the pass fails. An interrupted pass is
/// not an error but exits with [`EXIT_INTERRUPTED`].
pub fn run_update(args: &UpdateArgs, data_dir: &DataDir, output: OutputMode) -> Result<ExitCode> {
    validate_view_id(&args.view)?;
    let config = data_dir.load_config()?;
    let conn = data_dir.open_database()?;

    let _lock = ViewLock::acquire(data_dir.root(), &args.view, Duration::from_secs(args.wait))
        .with_context(|| format!("lock view {}", args.view))?;

    let cancel = CancelToken::new();
    signals::install(&cancel)?;

    let coordinator = UpdateCoordinator::new(SqliteStateStore::new(&conn), &config)
        .with_cancel_token(cancel);
    let changelog = SqliteChangelog::new(&conn, &args.view)?;
    let mode = if args.full {
        PassMode::Full
    } else {
        PassMode::Incremental
    };
    let pass = |action: &mut dyn Action| match mode {
        PassMode::Incremental => coordinator.update(&changelog, action),
        PassMode::Full => coordinator.reindex_all(&changelog, action),
    };

    let mut chunks = None;
    let result = match (&args.exec, output) {
        (Some(command), _) => {
            let mut action = ExecAction::new(command, &args.view, output)?;
            pass(&mut action)
        }
        (None, OutputMode::Json) => {
            let collected = chunks.insert(Vec::new());
            let mut action = |ids: &[EntityId]| -> Result<()> {
                collected.push(ids.to_vec());
                Ok(())
            };
            pass(&mut action)
        }
        (None, OutputMode::Human) => {
            let mut action = PrintAction::new(io::stdout());
            pass(&mut action)
        }
    };
    let report = result.with_context(|| format!("update view {}", args.view))?;

    let exit = if report.outcome == UpdateOutcome::Interrupted {
        ExitCode::from(EXIT_INTERRUPTED)
    } else {
        ExitCode::SUCCESS
    };
    let result = UpdateOutput {
        elapsed_ms: report.elapsed.as_millis(),
        report,
        chunks,
    };
    render(output, &result, |r, w| writeln!(w, "{}", summarize(&r.report)))?;
    Ok(exit)
}

fn summarize(report: &UpdateReport) -> String {
    let view = &report.view_id;
    match report.outcome {
        UpdateOutcome::Skipped { status } => format!("- {view}: skipped, view is {status}"),
        UpdateOutcome::NoChangelog => format!("- {view}: no changelog, nothing to do"),
        UpdateOutcome::UpToDate => {
            format!("✓ {view}: up to date at version {}", report.checkpoint_version)
        }
        UpdateOutcome::Completed { final_status } => format!(
            "✓ {view}: {} {} id(s) in {} chunk(s), versions {}..{}, now {final_status}",
            match report.mode {
                PassMode::Incremental => "applied",
                PassMode::Full => "reindexed",
            },
            report.ids_applied,
            report.chunks_applied,
            report.from_version,
            report.to_version
        ),
        UpdateOutcome::Interrupted => format!(
            "! {view}: interrupted, checkpoint at version {} of {}",
            report.checkpoint_version, report.to_version
        ),
    }
}
