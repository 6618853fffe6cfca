//! Operator commands that change a view's persisted state:
//! `suspend`, `resume`, `restore` and `reset`.

use std::io::Write;

use anyhow::{Context as _, Result};
use clap::Args;
use mview_core::{
    MviewConfig, SqliteChangelog, SqliteStateStore, UpdateCoordinator, ViewState, ViewStatus,
};
use serde::Serialize;

use super::DataDir;
use crate::output::{OutputMode, render};

#[derive(Args, Debug)]
pub struct ViewArgs {
    /// View id.
    pub view: String,
}

#[derive(Args, Debug)]
pub struct ResetArgs {
    /// View id.
    pub view: String,

    /// New checkpoint, at most the changelog head. 0 re-materializes the
    /// whole changelog.
    #[arg(long, default_value_t = 0)]
    pub version: u64,
}

/// Which state change to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Suspend,
    Resume,
    Restore,
    Reset(u64),
}

impl Control {
    const fn verb(self) -> &'static str {
        match self {
            Self::Suspend => "Suspended",
            Self::Resume => "Resumed",
            Self::Restore => "Restored",
            Self::Reset(_) => "Reset",
        }
    }
}

#[derive(Debug, Serialize)]
struct ControlOutput {
    view: String,
    status: ViewStatus,
    last_processed_version: u64,
}

impl From<ViewState> for ControlOutput {
    fn from(state: ViewState) -> Self {
        Self {
            view: state.view_id,
            status: state.status,
            last_processed_version: state.last_processed_version,
        }
    }
}

/// Execute one of the state-changing operator commands.
///
/// # Errors
///
/// Returns an error if the data directory is not initialized or the
/// transition is not allowed from the view's current status. `reset` also
/// fails for a version past the changelog head.
pub fn run_control(
    control: Control,
    view: &str,
    data_dir: &DataDir,
    output: OutputMode,
) -> Result<()> {
    let conn = data_dir.open_database()?;
    // Operator commands never run a pass, so defaults are enough here.
    let coordinator = UpdateCoordinator::new(SqliteStateStore::new(&conn), &MviewConfig::default());

    let state = match control {
        Control::Suspend => coordinator.suspend(view),
        Control::Resume => coordinator.resume(view),
        Control::Restore => coordinator.restore(view),
        Control::Reset(version) => {
            let changelog = SqliteChangelog::new(&conn, view)?;
            coordinator.reset(&changelog, version)
        }
    }
    .with_context(|| format!("{} {view}", control.verb().to_lowercase()))?;

    let result = ControlOutput::from(state);
    render(output, &result, |r, w| {
        writeln!(
            w,
            "✓ {} {}: {} at version {}",
            control.verb(),
            r.view,
            r.status,
            r.last_processed_version
        )
    })
}
