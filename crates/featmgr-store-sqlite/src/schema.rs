use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection};
use time::OffsetDateTime;

pub const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS hive_keys (
  path TEXT PRIMARY KEY,
  parent TEXT,
  name TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_hive_keys_parent ON hive_keys(parent);

INSERT OR IGNORE INTO hive_keys(path, parent, name) VALUES ('', NULL, '');

CREATE TABLE IF NOT EXISTS hive_values (
  key_path TEXT NOT NULL REFERENCES hive_keys(path) ON DELETE CASCADE,
  name TEXT NOT NULL,
  kind TEXT NOT NULL CHECK (kind IN ('dword', 'qword', 'binary', 'string')),
  data BLOB NOT NULL,
  PRIMARY KEY (key_path, name)
);

CREATE TABLE IF NOT EXISTS kernel_state (
  key TEXT PRIMARY KEY,
  value INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS feature_configurations (
  section TEXT NOT NULL CHECK (section IN ('boot', 'runtime')),
  feature_id INTEGER NOT NULL,
  priority INTEGER NOT NULL,
  compact_state INTEGER NOT NULL,
  variant_payload INTEGER NOT NULL,
  PRIMARY KEY (section, feature_id, priority)
);

CREATE TABLE IF NOT EXISTS usage_subscriptions (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  feature_id INTEGER NOT NULL,
  reporting_kind INTEGER NOT NULL,
  reporting_options INTEGER NOT NULL,
  reporting_target INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS usage_reports (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  feature_id INTEGER NOT NULL,
  reporting_kind INTEGER NOT NULL,
  reporting_options INTEGER NOT NULL,
  reported_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS boot_status (
  item INTEGER PRIMARY KEY,
  value INTEGER NOT NULL
);
";

/// Open a database file, configure pragmas and bring the schema up to date.
///
/// # Errors
/// Returns an error when the database cannot be opened, configured or
/// migrated.
pub fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )
    .context("failed to configure sqlite pragmas")?;

    migrate(&conn)?;
    Ok(conn)
}

/// Apply all forward migrations.
///
/// # Errors
/// Returns an error when a migration fails or the database is newer than
/// this build understands.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
        .context("failed to apply schema_migrations table")?;

    let version = current_schema_version(conn)?;
    if version == 0 {
        conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
        record_schema_version(conn, 1)?;
        tracing::debug!(version = 1, "applied sqlite migration");
    }

    let version = current_schema_version(conn)?;
    if version != LATEST_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
        ));
    }
    Ok(())
}

/// # Errors
/// Returns an error when the migrations table cannot be read.
pub fn current_schema_version(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
        row.get::<_, i64>(0)
    })
    .context("failed to read current schema version")
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

pub(crate) fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrate_is_idempotent() -> Result<()> {
        let conn = open_connection(Path::new(":memory:"))?;
        migrate(&conn)?;
        assert_eq!(current_schema_version(&conn)?, LATEST_SCHEMA_VERSION);

        let applied_at: String = conn.query_row(
            "SELECT applied_at FROM schema_migrations WHERE version = 1",
            [],
            |row| row.get(0),
        )?;
        assert!(OffsetDateTime::parse(&applied_at, &time::format_description::well_known::Rfc3339).is_ok());
        Ok(())
    }

    #[test]
    fn newer_schema_is_rejected() -> Result<()> {
        let conn = open_connection(Path::new(":memory:"))?;
        record_schema_version(&conn, LATEST_SCHEMA_VERSION + 1)?;
        let err = match migrate(&conn) {
            Ok(()) => panic!("expected newer schema to be rejected"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("unsupported schema version"));
        Ok(())
    }
}
