//! Durable storage for [`ViewState`] records.
//!
//! Every load goes to the database and every save writes the whole record.
//! An operator may flip a view to `suspended` while a pass runs, so every
//! status or checkpoint change goes through [`StateStore::modify`], which
//! reads and writes the record as one step.

use anyhow::{Context, anyhow};
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};

use crate::changelog::validate_view_id;
use crate::error::UpdateError;
use crate::state::{ViewState, ViewStatus};

/// Persistence for per-view state.
pub trait StateStore {
    /// Load the current record for `view_id`. A view that was never saved
    /// loads as a fresh idle state at version 0.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::StateStore`] if the record cannot be read.
    fn load(&self, view_id: &str) -> Result<ViewState, UpdateError>;

    /// Persist the whole record.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::StateStore`] if the write fails.
    fn save(&self, state: &ViewState) -> Result<(), UpdateError>;

    /// Load `view_id`, apply `change`, and save the result. Nothing is saved
    /// when `change` fails.
    ///
    /// The default is a plain load then save. Stores that can lock the record
    /// override it so a concurrent write cannot land in between.
    ///
    /// # Errors
    ///
    /// The error from `change`, or [`UpdateError::StateStore`].
    fn modify(
        &self,
        view_id: &str,
        change: &mut dyn FnMut(&mut ViewState) -> Result<(), UpdateError>,
    ) -> Result<ViewState, UpdateError> {
        let mut state = self.load(view_id)?;
        change(&mut state)?;
        self.save(&state)?;
        Ok(state)
    }

    /// All persisted records, ordered by view id.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::StateStore`] if the records cannot be read.
    fn list(&self) -> Result<Vec<ViewState>, UpdateError>;
}

impl<T: StateStore + ?Sized> StateStore for &T {
    fn load(&self, view_id: &str) -> Result<ViewState, UpdateError> {
        (**self).load(view_id)
    }

    fn save(&self, state: &ViewState) -> Result<(), UpdateError> {
        (**self).save(state)
    }

    fn modify(
        &self,
        view_id: &str,
        change: &mut dyn FnMut(&mut ViewState) -> Result<(), UpdateError>,
    ) -> Result<ViewState, UpdateError> {
        (**self).modify(view_id, change)
    }

    fn list(&self) -> Result<Vec<ViewState>, UpdateError> {
        (**self).list()
    }
}

/// State store backed by the `mview_state` table.
#[derive(Debug, Clone, Copy)]
pub struct SqliteStateStore<'c> {
    conn: &'c Connection,
}

impl<'c> SqliteStateStore<'c> {
    /// Wrap a migrated connection.
    #[must_use]
    pub const fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }
}

impl StateStore for SqliteStateStore<'_> {
    fn load(&self, view_id: &str) -> Result<ViewState, UpdateError> {
        let row = self
            .conn
            .query_row(
                "SELECT view_id, status, version_id, updated_at_us \
                 FROM mview_state WHERE view_id = ?1",
                params![view_id],
                row_to_parts,
            )
            .optional()
            .with_context(|| format!("load state for view {view_id}"))
            .map_err(UpdateError::StateStore)?;

        match row {
            Some(parts) => parts_to_state(parts),
            None => Ok(ViewState::new(view_id)),
        }
    }

    fn save(&self, state: &ViewState) -> Result<(), UpdateError> {
        validate_view_id(&state.view_id)?;
        let version = i64::try_from(state.last_processed_version)
            .context("version does not fit in a SQLite integer")
            .map_err(UpdateError::StateStore)?;
        let now_us = chrono::Utc::now().timestamp_micros();

        self.conn
            .execute(
                "INSERT INTO mview_state (view_id, status, version_id, updated_at_us) \
                 VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(view_id) DO UPDATE SET \
                     status = excluded.status, \
                     version_id = excluded.version_id, \
                     updated_at_us = excluded.updated_at_us",
                params![state.view_id, state.status.as_str(), version, now_us],
            )
            .with_context(|| format!("save state for view {}", state.view_id))
            .map_err(UpdateError::StateStore)?;
        Ok(())
    }

    /// Runs inside `BEGIN IMMEDIATE`, so the write lock is held from the read
    /// to the commit and other connections wait on `busy_timeout`.
    fn modify(
        &self,
        view_id: &str,
        change: &mut dyn FnMut(&mut ViewState) -> Result<(), UpdateError>,
    ) -> Result<ViewState, UpdateError> {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)
            .with_context(|| format!("lock state of view {view_id}"))
            .map_err(UpdateError::StateStore)?;
        let mut state = self.load(view_id)?;
        change(&mut state)?;
        self.save(&state)?;
        tx.commit()
            .with_context(|| format!("commit state of view {view_id}"))
            .map_err(UpdateError::StateStore)?;
        Ok(state)
    }

    fn list(&self) -> Result<Vec<ViewState>, UpdateError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT view_id, status, version_id, updated_at_us \
                 FROM mview_state ORDER BY view_id",
            )
            .context("prepare state listing")
            .map_err(UpdateError::StateStore)?;
        let rows = stmt
            .query_map([], row_to_parts)
            .context("list view states")
            .map_err(UpdateError::StateStore)?;

        let mut states = Vec::new();
        for row in rows {
            let parts = row
                .context("read view state row")
                .map_err(UpdateError::StateStore)?;
            states.push(parts_to_state(parts)?);
        }
        Ok(states)
    }
}

type StateParts = (String, String, i64, i64);

fn row_to_parts(row: &rusqlite::Row<'_>) -> rusqlite::Result<StateParts> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn parts_to_state((view_id, status, version, updated_at_us): StateParts) -> Result<ViewState, UpdateError> {
    let status = status
        .parse::<ViewStatus>()
        .map_err(|e| UpdateError::StateStore(anyhow!("view {view_id}: {e}")))?;
    let last_processed_version = u64::try_from(version).map_err(|_| {
        UpdateError::StateStore(anyhow!("view {view_id}: negative version {version}"))
    })?;
    Ok(ViewState {
        view_id,
        status,
        last_processed_version,
        updated_at_us,
    })
}
