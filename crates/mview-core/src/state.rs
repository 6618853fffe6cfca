//! Persisted per-view status and checkpoint, with the transition rules that
//! keep a view out of `working` whenever no pass is running.
//!
//! ```text
//!            begin_pass            restore
//!   idle ─────────────────▶ working ───────▶ idle | suspended
//!    ▲                         │
//!    │ resume                  │ suspend (operator, any state)
//!    └──────── suspended ◀─────┘
//! ```
//!
//! [`ViewState::restore`] is the single recovery path: it maps every status
//! to `idle`, except `suspended`, which is preserved. Applying it twice is the
//! same as applying it once.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::UpdateError;

/// Changelog version identifier.
pub type Version = u64;

/// Lifecycle status of a view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewStatus {
    /// Safe to start a new pass.
    Idle,
    /// A pass is running.
    Working,
    /// Administratively paused.
    Suspended,
}

impl ViewStatus {
    /// Stable lowercase name used for persistence and output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Working => "working",
            Self::Suspended => "suspended",
        }
    }

    /// Whether the state machine permits moving from `self` to `next`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Working)
                | (Self::Working | Self::Idle, Self::Idle)
                | (_, Self::Suspended)
                | (Self::Suspended, Self::Idle)
        )
    }
}

impl fmt::Display for ViewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ViewStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "idle" => Ok(Self::Idle),
            "working" => Ok(Self::Working),
            "suspended" => Ok(Self::Suspended),
            other => Err(format!("unknown view status `{other}`")),
        }
    }
}

/// Durable record for one view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewState {
    pub view_id: String,
    pub status: ViewStatus,
    /// Highest changelog version whose changes have been applied.
    pub last_processed_version: Version,
    /// Wall-clock time of the last save, in microseconds. Set by the store.
    pub updated_at_us: i64,
}

impl ViewState {
    /// Fresh state for a view that has never been updated.
    #[must_use]
    pub fn new(view_id: impl Into<String>) -> Self {
        Self {
            view_id: view_id.into(),
            status: ViewStatus::Idle,
            last_processed_version: 0,
            updated_at_us: 0,
        }
    }

    /// Move `idle` to `working` at the start of a pass.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::InvalidTransition`] when the view is not idle.
    pub fn begin_pass(&mut self) -> Result<(), UpdateError> {
        self.transition(ViewStatus::Working)
    }

    /// Operator suspend. Allowed from every status, including `working`,
    /// where the running pass observes it at restore time.
    pub fn suspend(&mut self) {
        self.status = ViewStatus::Suspended;
    }

    /// Operator resume.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::InvalidTransition`] unless the view is suspended.
    pub fn resume(&mut self) -> Result<(), UpdateError> {
        if self.status != ViewStatus::Suspended {
            return Err(self.rejected(ViewStatus::Idle));
        }
        self.status = ViewStatus::Idle;
        Ok(())
    }

    /// Restore to a safe status: `suspended` stays, everything else becomes
    /// `idle`. Idempotent.
    pub fn restore(&mut self) -> ViewStatus {
        self.status = restored_status(self.status);
        self.status
    }

    /// Advance the checkpoint. A lower version is ignored so the checkpoint
    /// never moves backwards.
    pub fn checkpoint(&mut self, version: Version) {
        self.last_processed_version = self.last_processed_version.max(version);
    }

    /// Operator reset of the checkpoint, e.g. to re-materialize from zero.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::InvalidTransition`] unless the view is idle.
    pub fn reset_to(&mut self, version: Version) -> Result<(), UpdateError> {
        if self.status != ViewStatus::Idle {
            return Err(self.rejected(ViewStatus::Idle));
        }
        self.last_processed_version = version;
        Ok(())
    }

    fn transition(&mut self, next: ViewStatus) -> Result<(), UpdateError> {
        if !self.status.can_transition_to(next) {
            return Err(self.rejected(next));
        }
        self.status = next;
        Ok(())
    }

    fn rejected(&self, to: ViewStatus) -> UpdateError {
        UpdateError::InvalidTransition {
            view_id: self.view_id.clone(),
            from: self.status,
            to,
        }
    }
}

/// Status a view lands in after restore.
#[must_use]
pub const fn restored_status(current: ViewStatus) -> ViewStatus {
    match current {
        ViewStatus::Suspended => ViewStatus::Suspended,
        ViewStatus::Idle | ViewStatus::Working => ViewStatus::Idle,
    }
}
