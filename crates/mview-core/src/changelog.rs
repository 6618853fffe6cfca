//! Changelog reader: which entities changed inside a version window.
//!
//! A changelog is an append-only list of `(version_id, entity_id)` rows
//! written by upstream mutation hooks. The reader never deletes rows. For a
//! window `(from, to]` it reports every entity whose *latest* change falls in
//! the window, so an entity touched in two consecutive windows is only
//! reported by the later one.

use anyhow::Context;
use rusqlite::{Connection, params};

use crate::db::schema;
use crate::error::UpdateError;
use crate::state::Version;

/// Identifier of an entity in the derived view.
pub type EntityId = u64;

/// Largest entity id a SQLite `INTEGER` column can hold.
pub const MAX_ENTITY_ID: EntityId = i64::MAX.unsigned_abs();

/// Longest view id accepted (keeps table names well under SQLite limits).
pub const MAX_VIEW_ID_LEN: usize = 64;

/// Read side of a view's changelog.
pub trait Changelog {
    /// View this changelog belongs to.
    fn view_id(&self) -> &str;

    /// Highest version recorded, `0` for an empty changelog.
    ///
    /// # Errors
    ///
    /// [`UpdateError::ChangelogUnavailable`] when the changelog was never
    /// created, [`UpdateError::Changelog`] for other storage failures.
    fn head_version(&self) -> Result<Version, UpdateError>;

    /// Distinct entity ids whose latest version `v` satisfies
    /// `from < v <= to`, in ascending order.
    ///
    /// # Errors
    ///
    /// Same as [`Changelog::head_version`].
    fn list_changed_ids(&self, from: Version, to: Version) -> Result<Vec<EntityId>, UpdateError>;
}

impl<T: Changelog + ?Sized> Changelog for &T {
    fn view_id(&self) -> &str {
        (**self).view_id()
    }

    fn head_version(&self) -> Result<Version, UpdateError> {
        (**self).head_version()
    }

    fn list_changed_ids(&self, from: Version, to: Version) -> Result<Vec<EntityId>, UpdateError> {
        (**self).list_changed_ids(from, to)
    }
}

/// Check that a view id is usable as part of a table name.
///
/// # Errors
///
/// Returns [`UpdateError::InvalidViewId`] for empty, overlong, or non
/// `[A-Za-z0-9_]` ids.
pub fn validate_view_id(view_id: &str) -> Result<(), UpdateError> {
    let valid = !view_id.is_empty()
        && view_id.len() <= MAX_VIEW_ID_LEN
        && view_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(UpdateError::InvalidViewId(view_id.to_string()))
    }
}

/// Changelog stored in a per-view SQLite table (`mview_cl_<view_id>`).
#[derive(Debug)]
pub struct SqliteChangelog<'c> {
    conn: &'c Connection,
    view_id: String,
    table: String,
}

impl<'c> SqliteChangelog<'c> {
    /// Bind to the changelog table of `view_id`. The table need not exist.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::InvalidViewId`] if the id is not a valid table
    /// name fragment.
    pub fn new(conn: &'c Connection, view_id: &str) -> Result<Self, UpdateError> {
        validate_view_id(view_id)?;
        Ok(Self {
            conn,
            view_id: view_id.to_string(),
            table: schema::changelog_table(view_id),
        })
    }

    /// Name of the backing table.
    #[must_use]
    pub fn table_name(&self) -> &str {
        &self.table
    }

    /// Create the changelog table. Safe to call repeatedly.
    ///
    /// # Errors
    ///
    /// Returns an error if the DDL fails.
    pub fn create(&self) -> Result<(), UpdateError> {
        self.conn
            .execute_batch(&schema::changelog_ddl(&self.table))
            .with_context(|| format!("create changelog table {}", self.table))
            .map_err(UpdateError::Changelog)
    }

    /// Whether the changelog table exists.
    ///
    /// # Errors
    ///
    /// Returns an error if `sqlite_master` cannot be queried.
    pub fn exists(&self) -> Result<bool, UpdateError> {
        self.conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
                [&self.table],
                |row| row.get(0),
            )
            .context("check changelog table exists")
            .map_err(UpdateError::Changelog)
    }

    /// Drop the changelog table.
    ///
    /// # Errors
    ///
    /// Returns an error if the DDL fails.
    pub fn drop_table(&self) -> Result<(), UpdateError> {
        self.conn
            .execute_batch(&format!("DROP TABLE IF EXISTS {}", self.table))
            .with_context(|| format!("drop changelog table {}", self.table))
            .map_err(UpdateError::Changelog)
    }

    /// Record one change per id, in order, inside a single transaction.
    /// Returns the new head version.
    ///
    /// # Errors
    ///
    /// [`UpdateError::ChangelogUnavailable`] if the table does not exist,
    /// [`UpdateError::Changelog`] if an id exceeds [`MAX_ENTITY_ID`] or the
    /// insert fails. Nothing is recorded when any id is rejected.
    pub fn append(&self, entity_ids: &[EntityId]) -> Result<Version, UpdateError> {
        self.ensure_exists()?;
        let rows = entity_ids
            .iter()
            .map(|&id| entity_to_sql(id))
            .collect::<Result<Vec<_>, _>>()?;

        let tx = self
            .conn
            .unchecked_transaction()
            .context("begin changelog append")
            .map_err(UpdateError::Changelog)?;
        {
            let mut stmt = tx
                .prepare_cached(&format!("INSERT INTO {} (entity_id) VALUES (?1)", self.table))
                .context("prepare changelog insert")
                .map_err(UpdateError::Changelog)?;
            for id in rows {
                stmt.execute(params![id])
                    .with_context(|| format!("append entity {id} to {}", self.table))
                    .map_err(UpdateError::Changelog)?;
            }
        }
        tx.commit()
            .context("commit changelog append")
            .map_err(UpdateError::Changelog)?;

        self.head_version()
    }

    fn ensure_exists(&self) -> Result<(), UpdateError> {
        if self.exists()? {
            Ok(())
        } else {
            Err(UpdateError::ChangelogUnavailable {
                view_id: self.view_id.clone(),
            })
        }
    }
}

impl Changelog for SqliteChangelog<'_> {
    fn view_id(&self) -> &str {
        &self.view_id
    }

    fn head_version(&self) -> Result<Version, UpdateError> {
        self.ensure_exists()?;
        let head: i64 = self
            .conn
            .query_row(
                &format!("SELECT COALESCE(MAX(version_id), 0) FROM {}", self.table),
                [],
                |row| row.get(0),
            )
            .with_context(|| format!("read head version of {}", self.table))
            .map_err(UpdateError::Changelog)?;
        from_sql_int(head, "head version")
    }

    fn list_changed_ids(&self, from: Version, to: Version) -> Result<Vec<EntityId>, UpdateError> {
        self.ensure_exists()?;
        if to <= from {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT entity_id FROM {} \
             GROUP BY entity_id \
             HAVING MAX(version_id) > ?1 AND MAX(version_id) <= ?2 \
             ORDER BY entity_id",
            self.table
        );
        let mut stmt = self
            .conn
            .prepare_cached(&sql)
            .context("prepare changed id query")
            .map_err(UpdateError::Changelog)?;
        let rows = stmt
            .query_map(params![version_bound(from), version_bound(to)], |row| {
                row.get::<_, i64>(0)
            })
            .context("query changed ids")
            .map_err(UpdateError::Changelog)?;

        let mut ids = Vec::new();
        for row in rows {
            let id = row.context("read changed id").map_err(UpdateError::Changelog)?;
            ids.push(from_sql_int(id, "entity id")?);
        }
        Ok(ids)
    }
}

fn entity_to_sql(id: EntityId) -> Result<i64, UpdateError> {
    i64::try_from(id).map_err(|_| {
        UpdateError::Changelog(anyhow::anyhow!(
            "entity id {id} exceeds the largest storable id {MAX_ENTITY_ID}"
        ))
    })
}

// Stored versions never exceed i64::MAX, so clamping a window bound keeps
// the same rows in range.
fn version_bound(version: Version) -> i64 {
    i64::try_from(version).unwrap_or(i64::MAX)
}

fn from_sql_int(value: i64, what: &str) -> Result<u64, UpdateError> {
    u64::try_from(value)
        .map_err(|_| UpdateError::Changelog(anyhow::anyhow!("negative {what} {value} in changelog")))
}
