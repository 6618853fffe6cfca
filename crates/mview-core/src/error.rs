use std::fmt;

use crate::state::{Version, ViewStatus};

/// Machine-readable error codes for operators and scripted callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NotInitialized,
    ConfigParseError,
    InvalidViewId,
    InvalidStateTransition,
    CheckpointBeyondHead,
    ChangelogUnavailable,
    ChangelogFailure,
    ResourceExhausted,
    ActionFailed,
    StateStoreFailure,
    LockContention,
    InternalUnexpected,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::NotInitialized => "E1001",
            Self::ConfigParseError => "E1002",
            Self::InvalidViewId => "E2001",
            Self::InvalidStateTransition => "E2002",
            Self::CheckpointBeyondHead => "E2003",
            Self::ChangelogUnavailable => "E3001",
            Self::ChangelogFailure => "E3002",
            Self::ResourceExhausted => "E4001",
            Self::ActionFailed => "E4002",
            Self::StateStoreFailure => "E5001",
            Self::LockContention => "E5002",
            Self::InternalUnexpected => "E9001",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::NotInitialized => "Data directory not initialized",
            Self::ConfigParseError => "Config file parse error",
            Self::InvalidViewId => "Invalid view id",
            Self::InvalidStateTransition => "Invalid view state transition",
            Self::CheckpointBeyondHead => "Checkpoint past changelog head",
            Self::ChangelogUnavailable => "Changelog not initialized",
            Self::ChangelogFailure => "Changelog access failed",
            Self::ResourceExhausted => "Memory threshold reached",
            Self::ActionFailed => "View action failed",
            Self::StateStoreFailure => "View state could not be persisted",
            Self::LockContention => "Lock contention",
            Self::InternalUnexpected => "Internal unexpected error",
        }
    }

    /// Optional remediation hint that can be surfaced to operators.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::NotInitialized => Some("Run `mview init <view>` to create the view."),
            Self::ConfigParseError => Some("Fix syntax in the mview config.toml and retry."),
            Self::InvalidViewId => Some("View ids may only contain ASCII letters, digits and `_`."),
            Self::InvalidStateTransition => {
                Some("Follow valid transitions: idle -> working -> idle|suspended.")
            }
            Self::CheckpointBeyondHead => Some(
                "Pick a version at or below the head shown by `mview status`; \
                 changes recorded later would otherwise never be applied.",
            ),
            Self::ChangelogUnavailable => None,
            Self::ChangelogFailure => Some("Check the database file and the recorded ids, then retry."),
            Self::ResourceExhausted => Some(
                "Lower the chunk size for this view or raise memory.limit; \
                 the next update resumes from the last checkpoint.",
            ),
            Self::ActionFailed => {
                Some("Fix the action and rerun; completed sub-ranges are not reapplied.")
            }
            Self::StateStoreFailure => Some(
                "The view may be stuck in `working`. Run `mview restore <view>` once the \
                 database is writable again.",
            ),
            Self::LockContention => Some("Retry after the other `mview` process releases its lock."),
            Self::InternalUnexpected => Some("Retry once. If persistent, report a bug with logs."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Errors raised by the update engine and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    /// The changelog for a view was never created. Absorbed by the
    /// coordinator as "nothing to do".
    #[error("changelog for view `{view_id}` does not exist")]
    ChangelogUnavailable { view_id: String },

    /// Any other changelog read or write failure.
    #[error("changelog failure: {0}")]
    Changelog(#[source] anyhow::Error),

    /// The memory guard tripped between chunks.
    #[error(
        "memory usage {usage} bytes reached {threshold_percent}% of the {limit} byte limit"
    )]
    ResourceExhausted {
        usage: u64,
        limit: u64,
        threshold_percent: u8,
    },

    /// The domain action rejected a chunk.
    #[error("action failed on a chunk of {chunk_len} ids: {source}")]
    ActionFailure {
        chunk_len: usize,
        #[source]
        source: anyhow::Error,
    },

    /// Loading or saving view state failed.
    #[error("state store failure: {0}")]
    StateStore(#[source] anyhow::Error),

    /// A status change that the view state machine does not allow.
    #[error("view `{view_id}` cannot move from {from} to {to}")]
    InvalidTransition {
        view_id: String,
        from: ViewStatus,
        to: ViewStatus,
    },

    /// A reset asked for a checkpoint the changelog has not reached.
    #[error("view `{view_id}` cannot be reset to version {version}: changelog head is {head}")]
    CheckpointBeyondHead {
        view_id: String,
        version: Version,
        head: Version,
    },

    #[error("invalid view id `{0}`")]
    InvalidViewId(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// Cancellation was requested while chunks were being applied.
    #[error("update interrupted")]
    Interrupted,
}

impl UpdateError {
    /// Machine-readable code associated with this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::ChangelogUnavailable { .. } => ErrorCode::ChangelogUnavailable,
            Self::Changelog(_) => ErrorCode::ChangelogFailure,
            Self::ResourceExhausted { .. } => ErrorCode::ResourceExhausted,
            Self::ActionFailure { .. } => ErrorCode::ActionFailed,
            Self::StateStore(_) => ErrorCode::StateStoreFailure,
            Self::InvalidTransition { .. } => ErrorCode::InvalidStateTransition,
            Self::CheckpointBeyondHead { .. } => ErrorCode::CheckpointBeyondHead,
            Self::InvalidViewId(_) => ErrorCode::InvalidViewId,
            Self::Config(_) => ErrorCode::ConfigParseError,
            Self::Interrupted => ErrorCode::InternalUnexpected,
        }
    }

    /// Optional remediation hint for operators.
    #[must_use]
    pub const fn hint(&self) -> Option<&'static str> {
        self.code().hint()
    }

    /// Whether the error aborts the pass. Only a missing changelog is
    /// treated as "no work".
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(self, Self::ChangelogUnavailable { .. })
    }
}
