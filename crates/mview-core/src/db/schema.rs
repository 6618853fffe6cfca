//! SQLite schema for view state.
//!
//! Changelog tables are created per view by
//! [`SqliteChangelog::create`](crate::changelog::SqliteChangelog::create), so
//! only the shared `mview_state` table lives in the migrations.

/// Migration v1: one durable state row per view.
pub const MIGRATION_V1_SQL: &str = r"
CREATE TABLE IF NOT EXISTS mview_state (
    view_id TEXT PRIMARY KEY CHECK (length(trim(view_id)) > 0),
    status TEXT NOT NULL DEFAULT 'idle' CHECK (status IN ('idle', 'working', 'suspended')),
    version_id INTEGER NOT NULL DEFAULT 0 CHECK (version_id >= 0),
    updated_at_us INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_mview_state_status ON mview_state(status);
";

/// Indexes that must exist after migrating to the latest schema.
pub const REQUIRED_INDEXES: &[&str] = &["idx_mview_state_status"];

/// Prefix of every per-view changelog table.
pub const CHANGELOG_TABLE_PREFIX: &str = "mview_cl_";

/// Name of the changelog table backing `view_id`. The id must already be
/// validated.
#[must_use]
pub fn changelog_table(view_id: &str) -> String {
    format!("{CHANGELOG_TABLE_PREFIX}{view_id}")
}

/// DDL for a changelog table. `AUTOINCREMENT` keeps versions strictly
/// increasing even if rows are ever removed by an outside tool.
#[must_use]
pub fn changelog_ddl(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            version_id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_id INTEGER NOT NULL CHECK (entity_id >= 0)
        );
        CREATE INDEX IF NOT EXISTS idx_{table}_entity ON {table}(entity_id, version_id);"
    )
}
