//! Per-view exclusive lock held by `mview update` for the length of a pass.
//!
//! The `idle` check on the state row is advisory: two processes that load the
//! row at the same moment can both begin a pass. Holding this lock around the
//! whole pass closes that window for processes on one host. The holder writes
//! its pid into the lock file so a waiter can report who is blocking it.

use crate::error::ErrorCode;
use fs2::FileExt;
use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Failure to take a view lock.
#[derive(Debug)]
pub enum LockError {
    /// Another process kept the lock for the whole wait.
    Busy {
        view_id: String,
        holder_pid: Option<u32>,
        waited: Duration,
    },
    /// The lock file could not be created or locked.
    Io { path: PathBuf, source: io::Error },
}

impl LockError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Busy { .. } => ErrorCode::LockContention,
            Self::Io { .. } => ErrorCode::InternalUnexpected,
        }
    }

    #[must_use]
    pub const fn hint(&self) -> Option<&'static str> {
        self.code().hint()
    }
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let code = self.code().code();
        match self {
            Self::Busy {
                view_id,
                holder_pid: Some(pid),
                waited,
            } => write!(
                f,
                "{code}: view {view_id} is being updated by pid {pid} (waited {waited:?})"
            ),
            Self::Busy {
                view_id, waited, ..
            } => write!(
                f,
                "{code}: view {view_id} is being updated by another process (waited {waited:?})"
            ),
            Self::Io { path, source } => {
                write!(f, "{code}: lock file {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for LockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Busy { .. } => None,
        }
    }
}

/// Exclusive advisory lock on `<data_dir>/locks/<view>.lock`, released on
/// drop.
#[derive(Debug)]
pub struct ViewLock {
    file: File,
    path: PathBuf,
    view_id: String,
}

impl ViewLock {
    /// Lock file path for `view_id` under `data_dir`.
    #[must_use]
    pub fn path_for(data_dir: &Path, view_id: &str) -> PathBuf {
        data_dir.join("locks").join(format!("{view_id}.lock"))
    }

    /// Take the lock for `view_id`, polling until `wait` elapses. A zero
    /// `wait` tries exactly once.
    ///
    /// # Errors
    ///
    /// [`LockError::Busy`] if another holder keeps the lock, or
    /// [`LockError::Io`] if the lock file cannot be opened.
    pub fn acquire(data_dir: &Path, view_id: &str, wait: Duration) -> Result<Self, LockError> {
        let path = Self::path_for(data_dir, view_id);
        let io_err = |source| LockError::Io {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(io_err)?;

        let start = Instant::now();
        while file.try_lock_exclusive().is_err() {
            if start.elapsed() >= wait {
                let holder_pid = read_pid(&mut file);
                tracing::debug!(view = view_id, ?holder_pid, "view lock busy");
                return Err(LockError::Busy {
                    view_id: view_id.to_string(),
                    holder_pid,
                    waited: start.elapsed(),
                });
            }
            thread::sleep(POLL_INTERVAL);
        }

        write_pid(&mut file).map_err(io_err)?;
        tracing::debug!(view = view_id, path = %path.display(), "view lock acquired");
        Ok(Self {
            file,
            path,
            view_id: view_id.to_string(),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn view_id(&self) -> &str {
        &self.view_id
    }
}

impl Drop for ViewLock {
    fn drop(&mut self) {
        // Clear the pid first so a stale file never names a live process.
        let _ = self.file.set_len(0);
        let _ = self.file.unlock();
        tracing::debug!(view = %self.view_id, "view lock released");
    }
}

fn write_pid(file: &mut File) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    write!(file, "{}", std::process::id())?;
    file.flush()
}

fn read_pid(file: &mut File) -> Option<u32> {
    let mut raw = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut raw).ok()?;
    raw.trim().parse().ok()
}
