//! Chunked application of entity ids to the view action.

use crate::cancel::CancelToken;
use crate::changelog::EntityId;
use crate::error::UpdateError;
use crate::memory::MemoryGuard;

/// Domain action that brings the view up to date for a set of entities.
pub trait Action {
    /// Re-materialize the view rows for `ids`.
    ///
    /// # Errors
    ///
    /// Any error aborts the current pass.
    fn apply(&mut self, ids: &[EntityId]) -> anyhow::Result<()>;
}

impl<F> Action for F
where
    F: FnMut(&[EntityId]) -> anyhow::Result<()>,
{
    fn apply(&mut self, ids: &[EntityId]) -> anyhow::Result<()> {
        self(ids)
    }
}

/// Counts from one [`BatchExecutor::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub chunks_applied: usize,
    pub ids_applied: usize,
}

impl BatchReport {
    /// Fold another report into this one.
    pub const fn absorb(&mut self, other: Self) {
        self.chunks_applied += other.chunks_applied;
        self.ids_applied += other.ids_applied;
    }
}

/// Applies ids chunk by chunk, checking memory after each chunk.
#[derive(Debug, Clone, Copy)]
pub struct BatchExecutor<'a> {
    guard: &'a MemoryGuard,
    cancel: &'a CancelToken,
}

impl<'a> BatchExecutor<'a> {
    #[must_use]
    pub const fn new(guard: &'a MemoryGuard, cancel: &'a CancelToken) -> Self {
        Self { guard, cancel }
    }

    /// Apply `ids` in consecutive chunks of at most `chunk_size`.
    ///
    /// The caller passes the full id set of a sub-range; splitting happens
    /// here so an id never lands in two chunks.
    ///
    /// # Errors
    ///
    /// - [`UpdateError::Config`] if `chunk_size` is 0.
    /// - [`UpdateError::ActionFailure`] when the action rejects a chunk.
    /// - [`UpdateError::ResourceExhausted`] when the memory guard trips after
    ///   a chunk. That chunk has been fully applied.
    /// - [`UpdateError::Interrupted`] if cancellation is requested before a
    ///   chunk starts.
    pub fn run<A: Action + ?Sized>(
        &self,
        ids: &[EntityId],
        chunk_size: usize,
        action: &mut A,
    ) -> Result<BatchReport, UpdateError> {
        if chunk_size == 0 {
            return Err(UpdateError::Config("chunk size must be positive".into()));
        }

        let mut report = BatchReport::default();
        for chunk in ids.chunks(chunk_size) {
            if self.cancel.is_cancelled() {
                tracing::info!(
                    chunks_applied = report.chunks_applied,
                    "cancellation requested, stopping before next chunk"
                );
                return Err(UpdateError::Interrupted);
            }

            action
                .apply(chunk)
                .map_err(|source| UpdateError::ActionFailure {
                    chunk_len: chunk.len(),
                    source,
                })?;
            report.chunks_applied += 1;
            report.ids_applied += chunk.len();
            tracing::trace!(chunk_len = chunk.len(), "chunk applied");

            if let Some(reading) = self.guard.check().filter(|r| r.exceeded()) {
                tracing::warn!(
                    usage = reading.usage,
                    limit = reading.limit,
                    threshold_percent = reading.threshold_percent,
                    percent_used = reading.percent_used(),
                    chunks_applied = report.chunks_applied,
                    "memory usage too high, aborting update"
                );
                return Err(UpdateError::ResourceExhausted {
                    usage: reading.usage,
                    limit: reading.limit,
                    threshold_percent: reading.threshold_percent,
                });
            }
        }

        Ok(report)
    }
}
