use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::timestamp;

pub const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS identifiers (
  id TEXT PRIMARY KEY,
  chain_id TEXT NOT NULL,
  contract_address TEXT NOT NULL,
  token_id TEXT NOT NULL,
  title TEXT,
  description TEXT,
  created_at TEXT NOT NULL,
  processed_at TEXT,
  attestation_count INTEGER NOT NULL DEFAULT 0 CHECK (attestation_count >= 0),
  archived_content_count INTEGER NOT NULL DEFAULT 0 CHECK (archived_content_count >= 0)
);

CREATE TABLE IF NOT EXISTS attestations (
  uid TEXT PRIMARY KEY,
  identifier_id TEXT NOT NULL,
  attester TEXT NOT NULL,
  creation_timestamp INTEGER,
  payload_json TEXT NOT NULL,
  sources_count INTEGER NOT NULL DEFAULT 0 CHECK (sources_count >= 0),
  created_at TEXT NOT NULL,
  FOREIGN KEY (identifier_id) REFERENCES identifiers(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS archive_records (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  identifier_id TEXT NOT NULL,
  attestation_uid TEXT NOT NULL,
  original_url TEXT NOT NULL,
  content_type TEXT,
  file_extension TEXT,
  content_identifier TEXT,
  gateway_url TEXT,
  file_size INTEGER CHECK (file_size IS NULL OR file_size >= 0),
  content_hash TEXT,
  status TEXT NOT NULL DEFAULT 'pending'
    CHECK (status IN ('pending','downloading','uploading','completed','failed')),
  error_message TEXT,
  retry_count INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
  last_retry_at TEXT,
  archived_at TEXT NOT NULL,
  FOREIGN KEY (identifier_id) REFERENCES identifiers(id) ON DELETE CASCADE,
  FOREIGN KEY (attestation_uid) REFERENCES attestations(uid) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_attestations_identifier ON attestations(identifier_id);
CREATE INDEX IF NOT EXISTS idx_archive_records_identifier ON archive_records(identifier_id);
CREATE INDEX IF NOT EXISTS idx_archive_records_status ON archive_records(status);
CREATE INDEX IF NOT EXISTS idx_archive_records_retry
  ON archive_records(status, retry_count, last_retry_at);

CREATE VIEW IF NOT EXISTS identifier_archive_summary AS
SELECT
  i.id AS identifier_id,
  i.title AS title,
  i.processed_at AS processed_at,
  i.attestation_count AS attestation_count,
  i.archived_content_count AS archived_content_count,
  COALESCE(SUM(CASE WHEN r.status = 'completed' THEN 1 ELSE 0 END), 0) AS completed_count,
  COALESCE(SUM(CASE WHEN r.status = 'failed' THEN 1 ELSE 0 END), 0) AS failed_count
FROM identifiers i
LEFT JOIN archive_records r ON r.identifier_id = i.id
GROUP BY i.id;
";

const DROP_ALL_SQL: &str = r"
DROP VIEW IF EXISTS identifier_archive_summary;
DROP TABLE IF EXISTS archive_records;
DROP TABLE IF EXISTS attestations;
DROP TABLE IF EXISTS identifiers;
DROP TABLE IF EXISTS schema_migrations;
";

const MIGRATIONS: &[(i64, &str)] = &[(1, MIGRATION_001_SQL)];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

impl SchemaStatus {
    #[must_use]
    pub fn is_current(&self) -> bool {
        self.pending_versions.is_empty()
    }
}

pub(crate) fn status(conn: &Connection) -> Result<SchemaStatus, StoreError> {
    conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
        .map_err(|err| {
            StoreError::Migration(format!("failed to create schema_migrations: {err}"))
        })?;
    let current_version = current_version(conn)?;
    let pending_versions = MIGRATIONS
        .iter()
        .map(|(version, _)| *version)
        .filter(|version| *version > current_version)
        .collect();

    Ok(SchemaStatus {
        current_version,
        target_version: LATEST_SCHEMA_VERSION,
        pending_versions,
    })
}

/// Apply every pending migration, each in its own transaction.
pub(crate) fn migrate(conn: &mut Connection) -> Result<SchemaStatus, StoreError> {
    let before = status(conn)?;
    if before.current_version > LATEST_SCHEMA_VERSION {
        return Err(StoreError::Migration(format!(
            "database schema version {} is newer than supported version {LATEST_SCHEMA_VERSION}",
            before.current_version
        )));
    }

    let pending = MIGRATIONS
        .iter()
        .filter(|(version, _)| before.pending_versions.contains(version));
    for (version, sql) in pending {
        let tx = conn.transaction().map_err(|err| {
            StoreError::Migration(format!("failed to start migration {version}: {err}"))
        })?;
        tx.execute_batch(sql)
            .map_err(|err| StoreError::Migration(format!("migration {version} failed: {err}")))?;
        tx.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![version, timestamp::now()?],
        )
        .map_err(|err| {
            StoreError::Migration(format!("failed to record migration {version}: {err}"))
        })?;
        tx.commit().map_err(|err| {
            StoreError::Migration(format!("failed to commit migration {version}: {err}"))
        })?;
        tracing::info!(version, "applied schema migration");
    }

    status(conn)
}

/// Drop every table and view, then migrate from scratch.
pub(crate) fn reset(conn: &mut Connection) -> Result<SchemaStatus, StoreError> {
    conn.execute_batch(DROP_ALL_SQL)
        .map_err(|err| StoreError::Migration(format!("failed to drop schema: {err}")))?;
    tracing::warn!("archive database reset");
    migrate(conn)
}

fn current_version(conn: &Connection) -> Result<i64, StoreError> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get::<_, i64>(0),
    )
    .map_err(StoreError::query("current schema version"))
}
