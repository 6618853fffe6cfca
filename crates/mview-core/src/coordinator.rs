//! One update pass over a view, plus the operator operations that act on its
//! persisted state.
//!
//! A pass moves the view `idle -> working`, walks the version window captured
//! at start in sub-ranges, checkpoints after every sub-range, and finally
//! writes the restore (`idle`, or `suspended` if an operator asked for it).
//! Every exit path performs the restore exactly once: the normal end writes it
//! explicitly, errors and interruption go through [`RestoreGuard`], and a
//! panic unwinding through the pass hits the guard's `Drop`.
//!
//! Incremental passes start at the checkpoint. A full reindex
//! ([`UpdateCoordinator::reindex_all`]) walks the whole changelog instead;
//! since checkpoints never move backwards, an interrupted full reindex leaves
//! the previous checkpoint in place.

use std::backtrace::Backtrace;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::batch::{Action, BatchExecutor, BatchReport};
use crate::cancel::CancelToken;
use crate::changelog::{Changelog, validate_view_id};
use crate::config::{MviewConfig, UpdateConfig};
use crate::error::UpdateError;
use crate::memory::MemoryGuard;
use crate::plan::{PassMode, UpdatePlan};
use crate::state::{Version, ViewState, ViewStatus};
use crate::store::StateStore;

/// How a call to [`UpdateCoordinator::update`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UpdateOutcome {
    /// The view was not idle; nothing was touched.
    Skipped { status: ViewStatus },
    /// The changelog was never created.
    NoChangelog,
    /// The checkpoint already equals the head.
    UpToDate,
    /// Every sub-range was applied.
    Completed { final_status: ViewStatus },
    /// Cancellation stopped the pass; the checkpoint reflects the last
    /// completed sub-range.
    Interrupted,
}

/// Summary of one pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateReport {
    pub view_id: String,
    pub mode: PassMode,
    pub outcome: UpdateOutcome,
    pub from_version: Version,
    pub to_version: Version,
    /// Persisted checkpoint when the pass returned.
    pub checkpoint_version: Version,
    /// Sub-ranges applied and checkpointed.
    pub sub_ranges: usize,
    pub chunks_applied: usize,
    pub ids_applied: usize,
    pub elapsed: Duration,
}

impl UpdateReport {
    fn new(view_id: &str, mode: PassMode, version: Version) -> Self {
        Self {
            view_id: view_id.to_string(),
            mode,
            outcome: UpdateOutcome::UpToDate,
            from_version: version,
            to_version: version,
            checkpoint_version: version,
            sub_ranges: 0,
            chunks_applied: 0,
            ids_applied: 0,
            elapsed: Duration::ZERO,
        }
    }

    fn record_plan(&mut self, plan: UpdatePlan, checkpoint: Version) {
        self.from_version = plan.from_version;
        self.to_version = plan.to_version;
        self.checkpoint_version = checkpoint;
    }

    fn record_applied(&mut self, applied: BatchReport, checkpoint: Version) {
        self.sub_ranges += 1;
        self.chunks_applied = applied.chunks_applied;
        self.ids_applied = applied.ids_applied;
        self.checkpoint_version = checkpoint;
    }

    fn finish(mut self, outcome: UpdateOutcome, started: Instant) -> Self {
        self.outcome = outcome;
        self.elapsed = started.elapsed();
        self
    }
}

/// Where [`UpdateCoordinator::run_pass`] stopped, before the restore write.
enum PassEnd {
    Skipped(ViewStatus),
    NoChangelog,
    UpToDate,
    Completed,
    Interrupted,
}

/// Drives update passes and operator state changes for views stored in `S`.
#[derive(Debug)]
pub struct UpdateCoordinator<S> {
    store: S,
    guard: MemoryGuard,
    settings: UpdateConfig,
    cancel: CancelToken,
    trace_passes: bool,
}

impl<S: StateStore> UpdateCoordinator<S> {
    /// Build a coordinator from loaded configuration.
    #[must_use]
    pub fn new(store: S, config: &MviewConfig) -> Self {
        Self {
            store,
            guard: config.memory.guard(),
            settings: config.update.clone(),
            cancel: CancelToken::new(),
            trace_passes: config.logging.trace_passes,
        }
    }

    /// Replace the memory guard built from configuration.
    #[must_use]
    pub fn with_memory_guard(mut self, guard: MemoryGuard) -> Self {
        self.guard = guard;
        self
    }

    /// Share a cancellation token with the caller, typically one wired to
    /// signal handlers.
    #[must_use]
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    #[must_use]
    pub const fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Run one incremental pass for the view behind `changelog`.
    ///
    /// A view that is not idle is skipped. A missing changelog and an empty
    /// window return without writing state.
    ///
    /// # Errors
    ///
    /// Any fatal [`UpdateError`] from the changelog, the action, the memory
    /// guard or the state store. The view has been restored (or the restore
    /// failure logged) before the error is returned.
    pub fn update<C, A>(&self, changelog: &C, action: &mut A) -> Result<UpdateReport, UpdateError>
    where
        C: Changelog + ?Sized,
        A: Action + ?Sized,
    {
        self.run(changelog, action, PassMode::Incremental)
    }

    /// Re-apply every entity in the changelog, ignoring the checkpoint, and
    /// leave the checkpoint at the head. Same gate, restore and
    /// cancellation rules as [`update`](Self::update).
    ///
    /// # Errors
    ///
    /// As for [`update`](Self::update).
    pub fn reindex_all<C, A>(
        &self,
        changelog: &C,
        action: &mut A,
    ) -> Result<UpdateReport, UpdateError>
    where
        C: Changelog + ?Sized,
        A: Action + ?Sized,
    {
        self.run(changelog, action, PassMode::Full)
    }

    fn run<C, A>(
        &self,
        changelog: &C,
        action: &mut A,
        mode: PassMode,
    ) -> Result<UpdateReport, UpdateError>
    where
        C: Changelog + ?Sized,
        A: Action + ?Sized,
    {
        let view_id = changelog.view_id();
        validate_view_id(view_id)?;

        let pid = std::process::id();
        let span = tracing::info_span!("update", view = view_id, pid, mode = mode.as_str());
        let _entered = span.enter();
        let started = Instant::now();

        let state = self.store.load(view_id)?;
        let mut report = UpdateReport::new(view_id, mode, state.last_processed_version);
        if state.status != ViewStatus::Idle {
            tracing::info!(status = %state.status, "view is not idle, skipping update");
            return Ok(report.finish(
                UpdateOutcome::Skipped {
                    status: state.status,
                },
                started,
            ));
        }

        let mut restore = RestoreGuard::arm(&self.store, view_id);
        let outcome = match self.run_pass(changelog, action, mode, &mut report) {
            Ok(PassEnd::Skipped(status)) => {
                restore.disarm();
                tracing::info!(%status, "view left idle before the pass began, skipping");
                UpdateOutcome::Skipped { status }
            }
            Ok(PassEnd::NoChangelog) => {
                restore.disarm();
                tracing::info!("changelog does not exist, nothing to update");
                UpdateOutcome::NoChangelog
            }
            Ok(PassEnd::UpToDate) => {
                restore.disarm();
                tracing::debug!(version = report.to_version, "view is up to date");
                UpdateOutcome::UpToDate
            }
            Ok(PassEnd::Completed) => {
                let state = restore.complete(report.to_version)?;
                report.checkpoint_version = state.last_processed_version;
                UpdateOutcome::Completed {
                    final_status: state.status,
                }
            }
            Ok(PassEnd::Interrupted) => {
                let state = restore.restore_now()?;
                report.checkpoint_version = state.last_processed_version;
                UpdateOutcome::Interrupted
            }
            Err(err) => {
                tracing::error!(
                    view = view_id,
                    pid,
                    mode = mode.as_str(),
                    error = %err,
                    code = %err.code(),
                    "update pass failed"
                );
                // The guard restores the view on drop.
                return Err(err);
            }
        };

        let report = report.finish(outcome, started);
        tracing::info!(
            view = view_id,
            pid,
            mode = mode.as_str(),
            outcome = ?report.outcome,
            from = report.from_version,
            to = report.to_version,
            checkpoint = report.checkpoint_version,
            sub_ranges = report.sub_ranges,
            chunks = report.chunks_applied,
            ids = report.ids_applied,
            elapsed_ms = u64::try_from(report.elapsed.as_millis()).unwrap_or(u64::MAX),
            "update pass finished"
        );
        Ok(report)
    }

    fn run_pass<C, A>(
        &self,
        changelog: &C,
        action: &mut A,
        mode: PassMode,
        report: &mut UpdateReport,
    ) -> Result<PassEnd, UpdateError>
    where
        C: Changelog + ?Sized,
        A: Action + ?Sized,
    {
        let view_id = changelog.view_id();
        let head = match changelog.head_version() {
            Ok(head) => head,
            Err(err) if !err.is_fatal() => return Ok(PassEnd::NoChangelog),
            Err(err) => return Err(err),
        };

        let state = self.store.load(view_id)?;
        let plan = UpdatePlan::for_mode(mode, state.last_processed_version, head);
        report.record_plan(plan, state.last_processed_version);
        if plan.is_empty() {
            return Ok(PassEnd::UpToDate);
        }
        if state.status != ViewStatus::Idle {
            return Ok(PassEnd::Skipped(state.status));
        }

        // Check-and-set under the store's lock: only one caller wins the gate.
        let begun = match self
            .store
            .modify(view_id, &mut |state: &mut ViewState| state.begin_pass())
        {
            Ok(begun) => begun,
            Err(UpdateError::InvalidTransition { from, .. }) => return Ok(PassEnd::Skipped(from)),
            Err(err) => return Err(err),
        };
        let plan = UpdatePlan::for_mode(mode, begun.last_processed_version, head);
        report.record_plan(plan, begun.last_processed_version);

        if self.trace_passes {
            tracing::info!(
                view = view_id,
                mode = mode.as_str(),
                backtrace = %Backtrace::force_capture(),
                "update pass caller"
            );
        }
        tracing::info!(
            view = view_id,
            pid = std::process::id(),
            mode = mode.as_str(),
            from = plan.from_version,
            to = plan.to_version,
            version_batch_size = self.settings.version_batch_size,
            "update pass started"
        );

        let executor = BatchExecutor::new(&self.guard, &self.cancel);
        let chunk_size = self.settings.chunk_size_for(view_id);
        let mut applied = BatchReport::default();
        for range in plan.sub_ranges(self.settings.version_batch_size) {
            if self.cancel.is_cancelled() {
                tracing::info!(next_from = range.from, "cancellation requested, stopping");
                return Ok(PassEnd::Interrupted);
            }

            let ids = changelog.list_changed_ids(range.from, range.to)?;
            let batch = match executor.run(&ids, chunk_size, action) {
                Ok(batch) => batch,
                Err(UpdateError::Interrupted) => return Ok(PassEnd::Interrupted),
                Err(err) => return Err(err),
            };

            // Keeps an operator suspend made during the batch.
            let saved = self.store.modify(view_id, &mut |state: &mut ViewState| {
                state.checkpoint(range.to);
                Ok(())
            })?;

            applied.absorb(batch);
            report.record_applied(applied, saved.last_processed_version);
            tracing::info!(
                from = range.from,
                to = range.to,
                ids = batch.ids_applied,
                chunks = batch.chunks_applied,
                "sub-range applied"
            );
        }

        Ok(PassEnd::Completed)
    }

    /// Current persisted state of a view.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::StateStore`] if the record cannot be read.
    pub fn state(&self, view_id: &str) -> Result<ViewState, UpdateError> {
        validate_view_id(view_id)?;
        self.store.load(view_id)
    }

    /// Mark a view suspended. A running pass keeps going and lands in
    /// `suspended` when it restores.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::StateStore`] if the state cannot be persisted.
    pub fn suspend(&self, view_id: &str) -> Result<ViewState, UpdateError> {
        validate_view_id(view_id)?;
        let state = self.store.modify(view_id, &mut |state: &mut ViewState| {
            state.suspend();
            Ok(())
        })?;
        tracing::info!(view = view_id, "view suspended");
        Ok(state)
    }

    /// Return a suspended view to `idle`.
    ///
    /// # Errors
    ///
    /// [`UpdateError::InvalidTransition`] unless the view is suspended.
    pub fn resume(&self, view_id: &str) -> Result<ViewState, UpdateError> {
        validate_view_id(view_id)?;
        let state = self
            .store
            .modify(view_id, &mut |state: &mut ViewState| state.resume())?;
        tracing::info!(view = view_id, "view resumed");
        Ok(state)
    }

    /// Idempotent recovery after a process died mid-pass.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::StateStore`] if the state cannot be persisted.
    pub fn restore(&self, view_id: &str) -> Result<ViewState, UpdateError> {
        validate_view_id(view_id)?;
        restore_view(&self.store, view_id)
    }

    /// Move the checkpoint of an idle view, e.g. to 0 for a full rebuild.
    /// The target may not pass the changelog head; a missing changelog
    /// counts as head 0.
    ///
    /// # Errors
    ///
    /// [`UpdateError::CheckpointBeyondHead`] for a version past the head,
    /// [`UpdateError::InvalidTransition`] unless the view is idle.
    pub fn reset<C: Changelog + ?Sized>(
        &self,
        changelog: &C,
        version: Version,
    ) -> Result<ViewState, UpdateError> {
        let view_id = changelog.view_id();
        validate_view_id(view_id)?;
        let head = match changelog.head_version() {
            Ok(head) => head,
            Err(err) if !err.is_fatal() => 0,
            Err(err) => return Err(err),
        };
        if version > head {
            return Err(UpdateError::CheckpointBeyondHead {
                view_id: view_id.to_string(),
                version,
                head,
            });
        }

        let mut previous = 0;
        let state = self.store.modify(view_id, &mut |state: &mut ViewState| {
            previous = state.last_processed_version;
            state.reset_to(version)
        })?;
        tracing::warn!(view = view_id, previous, version, head, "view checkpoint reset");
        Ok(state)
    }

    /// Versions recorded but not yet applied. A missing changelog has no lag.
    ///
    /// # Errors
    ///
    /// Changelog read or state store failures.
    pub fn lag<C: Changelog + ?Sized>(&self, changelog: &C) -> Result<Version, UpdateError> {
        let state = self.state(changelog.view_id())?;
        match changelog.head_version() {
            Ok(head) => Ok(head.saturating_sub(state.last_processed_version)),
            Err(err) if !err.is_fatal() => Ok(0),
            Err(err) => Err(err),
        }
    }
}

/// Load, restore and save. The status write of every recovery path.
fn restore_view<S: StateStore + ?Sized>(store: &S, view_id: &str) -> Result<ViewState, UpdateError> {
    store.modify(view_id, &mut |state: &mut ViewState| {
        state.restore();
        Ok(())
    })
}

/// Restores the view once when the pass ends, whichever way it ends.
struct RestoreGuard<'a, S: StateStore + ?Sized> {
    store: &'a S,
    view_id: &'a str,
    armed: bool,
}

impl<'a, S: StateStore + ?Sized> RestoreGuard<'a, S> {
    const fn arm(store: &'a S, view_id: &'a str) -> Self {
        Self {
            store,
            view_id,
            armed: true,
        }
    }

    const fn disarm(&mut self) {
        self.armed = false;
    }

    /// Final write of a completed pass: restore and advance to `to_version`.
    fn complete(&mut self, to_version: Version) -> Result<ViewState, UpdateError> {
        self.disarm();
        let result = self.store.modify(self.view_id, &mut |state: &mut ViewState| {
            state.restore();
            state.checkpoint(to_version);
            Ok(())
        });
        self.log_failure(result)
    }

    fn restore_now(&mut self) -> Result<ViewState, UpdateError> {
        self.disarm();
        let result = restore_view(self.store, self.view_id);
        self.log_failure(result)
    }

    fn log_failure(&self, result: Result<ViewState, UpdateError>) -> Result<ViewState, UpdateError> {
        match &result {
            Ok(state) => {
                tracing::debug!(status = %state.status, version = state.last_processed_version, "view restored");
            }
            Err(err) => {
                tracing::error!(
                    view = self.view_id,
                    error = %err,
                    hint = err.hint().unwrap_or_default(),
                    "failed to restore view state"
                );
            }
        }
        result
    }
}

impl<S: StateStore + ?Sized> Drop for RestoreGuard<'_, S> {
    fn drop(&mut self) {
        if self.armed {
            if std::thread::panicking() {
                tracing::error!(view = self.view_id, "update pass panicked, restoring view");
            }
            let _ = self.restore_now();
        }
    }
}
