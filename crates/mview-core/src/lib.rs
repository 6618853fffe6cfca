//! mview-core library: incremental materialized-view updates driven by a
//! versioned changelog.
//!
//! The entry points are [`UpdateCoordinator::update`] and
//! [`UpdateCoordinator::reindex_all`]. It reads the change
//! window from a [`Changelog`], feeds changed entity ids to an [`Action`] in
//! chunks under a [`MemoryGuard`], and checkpoints progress in a
//! [`StateStore`]. SQLite-backed implementations of both storage traits live
//! in [`changelog`] and [`store`].

pub mod batch;
pub mod cancel;
pub mod changelog;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod lock;
pub mod memory;
pub mod plan;
pub mod state;
pub mod store;

// Conventions
//
// - Errors: engine operations return `UpdateError`; setup and I/O helpers use
//   `anyhow::Result` with context.
// - Logging: `tracing` macros only. The library never installs a subscriber.

pub use batch::{Action, BatchExecutor, BatchReport};
pub use cancel::CancelToken;
pub use changelog::{Changelog, EntityId, SqliteChangelog};
pub use config::{MviewConfig, load_config};
pub use coordinator::{UpdateCoordinator, UpdateOutcome, UpdateReport};
pub use error::{ErrorCode, UpdateError};
pub use memory::{MemoryGuard, ProcessMemory};
pub use plan::PassMode;
pub use state::{Version, ViewState, ViewStatus};
pub use store::{SqliteStateStore, StateStore};
