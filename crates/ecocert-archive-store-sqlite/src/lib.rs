//! SQLite record store for identifiers, attestations and archive records.
//!
//! [`SqliteStore`] is the synchronous store; every mutation that touches more
//! than one row runs in a transaction so the identifier counters never drift
//! from their child rows. [`ArchiveStore`] moves a `SqliteStore` onto a
//! dedicated thread and exposes the same operations to async callers.

mod error;
mod executor;
mod schema;

use std::path::Path;

use ecocert_archive_core::{
    ArchiveRecord, ArchiveStatistics, ArchiveStatus, AttestationRecord, CompletedArchive,
    EcocertId, IdentifierRecord, IdentifierSummary, NewArchiveRecord, NewAttestation,
    NewIdentifier, StatisticsCounts,
};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

pub use error::{Entity, StoreError};
pub use executor::ArchiveStore;
pub use schema::{SchemaStatus, LATEST_SCHEMA_VERSION};

/// Hard ceiling on a single retry-eligibility query
pub const MAX_RETRY_BATCH: usize = 200;

/// Which failed records may be picked up again, and when
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub cooldown: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            cooldown: Duration::minutes(5),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreHealth {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub schema: SchemaStatus,
}

impl StoreHealth {
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.quick_check_ok && self.schema.is_current()
    }
}

const ARCHIVE_RECORD_COLUMNS: &str = "id, identifier_id, attestation_uid, original_url, \
     content_type, file_extension, content_identifier, gateway_url, file_size, content_hash, \
     status, error_message, retry_count, last_retry_at, archived_at";

const IDENTIFIER_COLUMNS: &str = "id, chain_id, contract_address, token_id, title, description, \
     created_at, processed_at, attestation_count, archived_content_count";

pub struct SqliteStore {
    conn: Connection,
    retry_policy: RetryPolicy,
}

impl SqliteStore {
    /// Open a SQLite database file and configure the runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let open_err = |source| StoreError::Open {
            path: path.display().to_string(),
            source,
        };
        let conn = Connection::open(path).map_err(open_err)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(open_err)?;

        Ok(Self {
            conn,
            retry_policy: RetryPolicy::default(),
        })
    }

    /// Open a private in-memory database. Used by tests and dry runs.
    ///
    /// # Errors
    /// Returns an error when SQLite cannot allocate the database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::open(Path::new(":memory:"))
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy
    }

    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus, StoreError> {
        schema::status(&self.conn)
    }

    /// Apply all forward migrations up to [`LATEST_SCHEMA_VERSION`].
    ///
    /// # Errors
    /// Returns an error when any migration step fails.
    pub fn migrate(&mut self) -> Result<SchemaStatus, StoreError> {
        schema::migrate(&mut self.conn)
    }

    /// Drop all archive data and recreate an empty schema.
    ///
    /// # Errors
    /// Returns an error when the schema cannot be dropped or rebuilt.
    pub fn reset(&mut self) -> Result<SchemaStatus, StoreError> {
        schema::reset(&mut self.conn)
    }

    /// # Errors
    /// Returns an error when the integrity check itself cannot run.
    pub fn health_check(&self) -> Result<StoreHealth, StoreError> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get(0))
            .map_err(StoreError::query("quick_check"))?;
        Ok(StoreHealth {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            schema: self.schema_status()?,
        })
    }

    /// Insert the identifier unless a row with the same id already exists.
    /// Returns whether a row was created.
    ///
    /// # Errors
    /// Returns `IDENTIFIER_INSERT_FAILED` on storage failure.
    pub fn upsert_identifier(
        &mut self,
        identifier: &NewIdentifier,
        now: OffsetDateTime,
    ) -> Result<bool, StoreError> {
        let inserted = self
            .conn
            .execute(
                "INSERT INTO identifiers(
                     id, chain_id, contract_address, token_id, title, description, created_at
                 )
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO NOTHING",
                params![
                    identifier.id.full_id,
                    identifier.id.chain_id,
                    identifier.id.contract_address,
                    identifier.id.token_id,
                    identifier.title,
                    identifier.description,
                    timestamp::format(now)?,
                ],
            )
            .map_err(StoreError::insert(Entity::Identifier))?;
        Ok(inserted == 1)
    }

    /// # Errors
    /// Returns `STORE_QUERY_FAILED` on storage failure.
    pub fn get_identifier(&self, full_id: &str) -> Result<Option<IdentifierRecord>, StoreError> {
        self.conn
            .query_row(
                &format!("SELECT {IDENTIFIER_COLUMNS} FROM identifiers WHERE id = ?1"),
                params![full_id],
                identifier_from_row,
            )
            .optional()
            .map_err(StoreError::query("get identifier"))
    }

    /// Insert an attestation and bump the parent's attestation counter.
    /// A duplicate `uid` under the same identifier is ignored and leaves the
    /// counter untouched.
    ///
    /// # Errors
    /// Returns `IDENTIFIER_NOT_FOUND` when the parent is missing,
    /// `ATTESTATION_CONFLICT` when the `uid` is already stored under another
    /// identifier, or `ATTESTATION_INSERT_FAILED` on storage failure.
    pub fn insert_attestation(
        &mut self,
        attestation: &NewAttestation,
        now: OffsetDateTime,
    ) -> Result<bool, StoreError> {
        let payload_json = serde_json::to_string(&attestation.payload).map_err(|err| {
            StoreError::InsertFailed {
                entity: Entity::Attestation,
                source: json_error(err),
            }
        })?;
        let created_at = timestamp::format(now)?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::insert(Entity::Attestation))?;
        ensure_identifier(&tx, &attestation.identifier_id)?;

        let inserted = tx
            .execute(
                "INSERT INTO attestations(
                     uid, identifier_id, attester, creation_timestamp, payload_json,
                     sources_count, created_at
                 )
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(uid) DO NOTHING",
                params![
                    attestation.uid,
                    attestation.identifier_id,
                    attestation.attester,
                    attestation.creation_timestamp,
                    payload_json,
                    attestation.sources_count,
                    created_at,
                ],
            )
            .map_err(StoreError::insert(Entity::Attestation))?;

        if inserted == 0 {
            let owner: String = tx
                .query_row(
                    "SELECT identifier_id FROM attestations WHERE uid = ?1",
                    params![attestation.uid],
                    |row| row.get(0),
                )
                .map_err(StoreError::query("attestation owner"))?;
            if owner != attestation.identifier_id {
                return Err(StoreError::AttestationConflict {
                    uid: attestation.uid.clone(),
                    owner,
                });
            }
            return Ok(false);
        }

        tx.execute(
            "UPDATE identifiers SET attestation_count = attestation_count + 1 WHERE id = ?1",
            params![attestation.identifier_id],
        )
        .map_err(StoreError::update(Entity::Identifier))?;
        tx.commit()
            .map_err(StoreError::insert(Entity::Attestation))?;
        Ok(true)
    }

    /// # Errors
    /// Returns `STORE_QUERY_FAILED` on storage failure.
    pub fn list_attestations(
        &self,
        identifier_id: &str,
    ) -> Result<Vec<AttestationRecord>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT uid, identifier_id, attester, creation_timestamp, payload_json,
                        sources_count, created_at
                 FROM attestations WHERE identifier_id = ?1
                 ORDER BY created_at ASC, uid ASC",
            )
            .map_err(StoreError::query("list attestations"))?;
        let rows = stmt
            .query_map(params![identifier_id], |row| {
                let payload_json: String = row.get(4)?;
                let payload = serde_json::from_str(&payload_json).map_err(|err| {
                    rusqlite::Error::FromSqlConversionFailure(
                        4,
                        rusqlite::types::Type::Text,
                        Box::new(err),
                    )
                })?;
                Ok(AttestationRecord {
                    uid: row.get(0)?,
                    identifier_id: row.get(1)?,
                    attester: row.get(2)?,
                    creation_timestamp: row.get(3)?,
                    payload,
                    sources_count: row.get(5)?,
                    created_at: timestamp::column(row, 6)?,
                })
            })
            .map_err(StoreError::query("list attestations"))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::query("list attestations"))
    }

    /// Create a `pending` archive record and bump the parent's content counter.
    ///
    /// # Errors
    /// Returns `IDENTIFIER_NOT_FOUND` when the parent is missing, or
    /// `ARCHIVE_RECORD_INSERT_FAILED` on storage failure.
    pub fn create_archive_record(
        &mut self,
        record: &NewArchiveRecord,
        now: OffsetDateTime,
    ) -> Result<i64, StoreError> {
        let archived_at = timestamp::format(now)?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::insert(Entity::ArchiveRecord))?;
        ensure_identifier(&tx, &record.identifier_id)?;

        tx.execute(
            "INSERT INTO archive_records(
                 identifier_id, attestation_uid, original_url, status, retry_count, archived_at
             )
             VALUES (?1, ?2, ?3, 'pending', 0, ?4)",
            params![
                record.identifier_id,
                record.attestation_uid,
                record.original_url,
                archived_at
            ],
        )
        .map_err(StoreError::insert(Entity::ArchiveRecord))?;
        let id = tx.last_insert_rowid();

        tx.execute(
            "UPDATE identifiers SET archived_content_count = archived_content_count + 1
             WHERE id = ?1",
            params![record.identifier_id],
        )
        .map_err(StoreError::update(Entity::Identifier))?;
        tx.commit()
            .map_err(StoreError::insert(Entity::ArchiveRecord))?;
        Ok(id)
    }

    /// Move a record to `status`.
    ///
    /// Entering `failed` with a message records it, stamps `last_retry_at`
    /// and increments `retry_count`. Entering `completed` clears the message.
    ///
    /// # Errors
    /// Returns `RECORD_NOT_FOUND` for an unknown id, `INVALID_STATUS_TRANSITION`
    /// when the lifecycle forbids the move, or `ARCHIVE_RECORD_UPDATE_FAILED`.
    pub fn transition_status(
        &mut self,
        id: i64,
        status: ArchiveStatus,
        error_message: Option<&str>,
        now: OffsetDateTime,
    ) -> Result<(), StoreError> {
        let stamped_at = timestamp::format(now)?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::update(Entity::ArchiveRecord))?;
        check_transition(&tx, id, status)?;

        let affected = match (status, error_message) {
            (ArchiveStatus::Failed, Some(message)) => tx.execute(
                "UPDATE archive_records
                 SET status = ?2, error_message = ?3, retry_count = retry_count + 1,
                     last_retry_at = ?4
                 WHERE id = ?1",
                params![id, status.as_str(), message, stamped_at],
            ),
            (ArchiveStatus::Completed, _) => tx.execute(
                "UPDATE archive_records SET status = ?2, error_message = NULL WHERE id = ?1",
                params![id, status.as_str()],
            ),
            _ => tx.execute(
                "UPDATE archive_records SET status = ?2 WHERE id = ?1",
                params![id, status.as_str()],
            ),
        }
        .map_err(StoreError::update(Entity::ArchiveRecord))?;

        if affected == 0 {
            return Err(StoreError::RecordNotFound(id));
        }
        tx.commit()
            .map_err(StoreError::update(Entity::ArchiveRecord))?;
        Ok(())
    }

    /// Persist the final content metadata and mark the record `completed`.
    ///
    /// # Errors
    /// Same failure modes as [`Self::transition_status`].
    pub fn complete_archive_record(
        &mut self,
        id: i64,
        archive: &CompletedArchive,
    ) -> Result<(), StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::update(Entity::ArchiveRecord))?;
        check_transition(&tx, id, ArchiveStatus::Completed)?;

        let affected = tx
            .execute(
                "UPDATE archive_records
                 SET content_type = ?2, file_extension = ?3, content_identifier = ?4,
                     gateway_url = ?5, file_size = ?6, content_hash = ?7,
                     status = 'completed', error_message = NULL
                 WHERE id = ?1",
                params![
                    id,
                    archive.content_type,
                    archive.file_extension,
                    archive.content_identifier,
                    archive.gateway_url,
                    archive.file_size,
                    archive.content_hash,
                ],
            )
            .map_err(StoreError::update(Entity::ArchiveRecord))?;
        if affected == 0 {
            return Err(StoreError::RecordNotFound(id));
        }
        tx.commit()
            .map_err(StoreError::update(Entity::ArchiveRecord))?;
        Ok(())
    }

    /// # Errors
    /// Returns `IDENTIFIER_NOT_FOUND` when no such identifier exists.
    pub fn mark_identifier_processed(
        &mut self,
        full_id: &str,
        now: OffsetDateTime,
    ) -> Result<(), StoreError> {
        let affected = self
            .conn
            .execute(
                "UPDATE identifiers SET processed_at = ?2 WHERE id = ?1",
                params![full_id, timestamp::format(now)?],
            )
            .map_err(StoreError::update(Entity::Identifier))?;
        if affected == 0 {
            return Err(StoreError::IdentifierNotFound(full_id.to_string()));
        }
        Ok(())
    }

    /// Failed records under the attempt cap whose cooldown has elapsed,
    /// oldest retry first (never-retried rows lead), capped at
    /// `min(limit, MAX_RETRY_BATCH)`.
    ///
    /// # Errors
    /// Returns `STORE_QUERY_FAILED` on storage failure.
    pub fn query_retry_eligible(
        &self,
        limit: usize,
        now: OffsetDateTime,
    ) -> Result<Vec<ArchiveRecord>, StoreError> {
        let limit = limit.min(MAX_RETRY_BATCH);
        if limit == 0 {
            return Ok(Vec::new());
        }
        let cutoff = timestamp::format(now - self.retry_policy.cooldown)?;

        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {ARCHIVE_RECORD_COLUMNS} FROM archive_records
                 WHERE status = 'failed'
                   AND retry_count < ?1
                   AND (last_retry_at IS NULL OR julianday(last_retry_at) <= julianday(?2))
                 ORDER BY julianday(last_retry_at) ASC, id ASC
                 LIMIT ?3"
            ))
            .map_err(StoreError::query("retry eligible"))?;
        let rows = stmt
            .query_map(
                params![self.retry_policy.max_attempts, cutoff, limit],
                archive_record_from_row,
            )
            .map_err(StoreError::query("retry eligible"))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::query("retry eligible"))
    }

    /// # Errors
    /// Returns `STORE_QUERY_FAILED` on storage failure.
    pub fn get_archive_record(&self, id: i64) -> Result<Option<ArchiveRecord>, StoreError> {
        self.conn
            .query_row(
                &format!("SELECT {ARCHIVE_RECORD_COLUMNS} FROM archive_records WHERE id = ?1"),
                params![id],
                archive_record_from_row,
            )
            .optional()
            .map_err(StoreError::query("get archive record"))
    }

    /// # Errors
    /// Returns `STORE_QUERY_FAILED` on storage failure.
    pub fn list_archive_records(
        &self,
        identifier_id: &str,
    ) -> Result<Vec<ArchiveRecord>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {ARCHIVE_RECORD_COLUMNS} FROM archive_records
                 WHERE identifier_id = ?1 ORDER BY id ASC"
            ))
            .map_err(StoreError::query("list archive records"))?;
        let rows = stmt
            .query_map(params![identifier_id], archive_record_from_row)
            .map_err(StoreError::query("list archive records"))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::query("list archive records"))
    }

    /// # Errors
    /// Returns `STORE_QUERY_FAILED` on storage failure.
    pub fn list_identifier_summaries(&self) -> Result<Vec<IdentifierSummary>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT identifier_id, title, processed_at, attestation_count,
                        archived_content_count, completed_count, failed_count
                 FROM identifier_archive_summary ORDER BY identifier_id ASC",
            )
            .map_err(StoreError::query("identifier summaries"))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(IdentifierSummary {
                    identifier_id: row.get(0)?,
                    title: row.get(1)?,
                    processed_at: timestamp::optional_column(row, 2)?,
                    attestation_count: row.get(3)?,
                    archived_content_count: row.get(4)?,
                    completed_count: row.get(5)?,
                    failed_count: row.get(6)?,
                })
            })
            .map_err(StoreError::query("identifier summaries"))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::query("identifier summaries"))
    }

    /// Delete an identifier; attestations and archive records cascade.
    ///
    /// # Errors
    /// Returns `IDENTIFIER_UPDATE_FAILED` on storage failure.
    pub fn delete_identifier(&mut self, full_id: &str) -> Result<bool, StoreError> {
        let deleted = self
            .conn
            .execute("DELETE FROM identifiers WHERE id = ?1", params![full_id])
            .map_err(StoreError::update(Entity::Identifier))?;
        Ok(deleted == 1)
    }

    /// # Errors
    /// Returns `STORE_QUERY_FAILED` on storage failure.
    pub fn compute_statistics(&self) -> Result<ArchiveStatistics, StoreError> {
        let mut counts = self
            .conn
            .query_row(
                "SELECT
                    (SELECT COUNT(*) FROM identifiers),
                    (SELECT COUNT(*) FROM identifiers WHERE processed_at IS NOT NULL),
                    (SELECT COUNT(*) FROM attestations)",
                [],
                |row| {
                    Ok(StatisticsCounts {
                        total_identifiers: row.get(0)?,
                        processed_identifiers: row.get(1)?,
                        total_attestations: row.get(2)?,
                        ..StatisticsCounts::default()
                    })
                },
            )
            .map_err(StoreError::query("statistics totals"))?;

        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM archive_records GROUP BY status")
            .map_err(StoreError::query("statistics by status"))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
            })
            .map_err(StoreError::query("statistics by status"))?;
        for row in rows {
            let (status, count) = row.map_err(StoreError::query("statistics by status"))?;
            match ArchiveStatus::parse(&status) {
                Some(ArchiveStatus::Pending) => counts.pending = count,
                Some(ArchiveStatus::Downloading) => counts.downloading = count,
                Some(ArchiveStatus::Uploading) => counts.uploading = count,
                Some(ArchiveStatus::Completed) => counts.completed = count,
                Some(ArchiveStatus::Failed) => counts.failed = count,
                None => tracing::warn!(status, "ignoring unknown archive status in statistics"),
            }
        }

        Ok(ArchiveStatistics::derive(counts))
    }
}

fn ensure_identifier(conn: &Connection, full_id: &str) -> Result<(), StoreError> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM identifiers WHERE id = ?1)",
            params![full_id],
            |row| row.get::<_, bool>(0),
        )
        .map_err(StoreError::query("identifier exists"))?;
    if exists {
        Ok(())
    } else {
        Err(StoreError::IdentifierNotFound(full_id.to_string()))
    }
}

fn check_transition(conn: &Connection, id: i64, next: ArchiveStatus) -> Result<(), StoreError> {
    let current: Option<String> = conn
        .query_row(
            "SELECT status FROM archive_records WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()
        .map_err(StoreError::query("archive record status"))?;
    let Some(current) = current else {
        return Err(StoreError::RecordNotFound(id));
    };
    let current = ArchiveStatus::parse(&current).ok_or_else(|| StoreError::QueryFailed {
        what: "archive record status",
        source: invalid_status(0),
    })?;
    if current.can_transition_to(next) {
        Ok(())
    } else {
        Err(StoreError::InvalidTransition {
            id,
            from: current,
            to: next,
        })
    }
}

fn invalid_status(idx: usize) -> rusqlite::Error {
    rusqlite::Error::InvalidColumnType(idx, "status".into(), rusqlite::types::Type::Text)
}

fn identifier_from_row(row: &Row<'_>) -> rusqlite::Result<IdentifierRecord> {
    Ok(IdentifierRecord {
        id: EcocertId {
            full_id: row.get(0)?,
            chain_id: row.get(1)?,
            contract_address: row.get(2)?,
            token_id: row.get(3)?,
        },
        title: row.get(4)?,
        description: row.get(5)?,
        created_at: timestamp::column(row, 6)?,
        processed_at: timestamp::optional_column(row, 7)?,
        attestation_count: row.get(8)?,
        archived_content_count: row.get(9)?,
    })
}

fn archive_record_from_row(row: &Row<'_>) -> rusqlite::Result<ArchiveRecord> {
    let status: String = row.get(10)?;
    let status = ArchiveStatus::parse(&status).ok_or_else(|| invalid_status(10))?;
    Ok(ArchiveRecord {
        id: row.get(0)?,
        identifier_id: row.get(1)?,
        attestation_uid: row.get(2)?,
        original_url: row.get(3)?,
        content_type: row.get(4)?,
        file_extension: row.get(5)?,
        content_identifier: row.get(6)?,
        gateway_url: row.get(7)?,
        file_size: row.get(8)?,
        content_hash: row.get(9)?,
        status,
        error_message: row.get(11)?,
        retry_count: row.get(12)?,
        last_retry_at: timestamp::optional_column(row, 13)?,
        archived_at: timestamp::column(row, 14)?,
    })
}

fn json_error(err: serde_json::Error) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(err))
}

mod timestamp {
    use rusqlite::types::Type;
    use rusqlite::Row;
    use time::format_description::well_known::Rfc3339;
    use time::OffsetDateTime;

    use crate::error::StoreError;

    pub(crate) fn format(value: OffsetDateTime) -> Result<String, StoreError> {
        value
            .format(&Rfc3339)
            .map_err(|err| StoreError::Timestamp(err.to_string()))
    }

    pub(crate) fn now() -> Result<String, StoreError> {
        format(OffsetDateTime::now_utc())
    }

    fn parse(idx: usize, raw: &str) -> rusqlite::Result<OffsetDateTime> {
        OffsetDateTime::parse(raw, &Rfc3339).map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
        })
    }

    pub(crate) fn column(row: &Row<'_>, idx: usize) -> rusqlite::Result<OffsetDateTime> {
        let raw: String = row.get(idx)?;
        parse(idx, &raw)
    }

    pub(crate) fn optional_column(
        row: &Row<'_>,
        idx: usize,
    ) -> rusqlite::Result<Option<OffsetDateTime>> {
        let raw: Option<String> = row.get(idx)?;
        raw.map(|raw| parse(idx, &raw)).transpose()
    }
}

#[cfg(test)]
mod tests {
    use anyhow::{anyhow, Result};
    use ecocert_archive_core::ArchiveError;
    use serde_json::json;
    use time::macros::datetime;

    use super::*;

    const ID: &str = "42220-0x16bA53B74c234C870c61EFC04cD418B8f2865959-1";
    const OTHER_ID: &str = "10-0x8f2a42ba4c7c4c18e1f6b7c2c0d3d0e5a6b7c8d9-7";
    const T0: OffsetDateTime = datetime!(2026-01-01 12:00:00 UTC);

    fn mk_store() -> Result<SqliteStore> {
        let mut store = SqliteStore::open_in_memory()?;
        store.migrate()?;
        Ok(store)
    }

    fn seed_identifier(store: &mut SqliteStore, raw: &str) -> Result<EcocertId> {
        let id = EcocertId::parse(raw)?;
        store.upsert_identifier(&NewIdentifier::new(id.clone()), T0)?;
        Ok(id)
    }

    fn mk_attestation(identifier: &str, uid: &str) -> NewAttestation {
        NewAttestation {
            uid: uid.to_string(),
            identifier_id: identifier.to_string(),
            attester: "0x0000000000000000000000000000000000000001".to_string(),
            creation_timestamp: Some(1_735_689_600),
            payload: json!({
                "title": "Evidence",
                "sources": [{ "type": "url", "src": "https://example.org/a.pdf" }]
            }),
            sources_count: 1,
        }
    }

    fn seed_record(store: &mut SqliteStore, identifier: &str, uid: &str, url: &str) -> Result<i64> {
        store.insert_attestation(&mk_attestation(identifier, uid), T0)?;
        let id = store.create_archive_record(
            &NewArchiveRecord {
                identifier_id: identifier.to_string(),
                attestation_uid: uid.to_string(),
                original_url: url.to_string(),
            },
            T0,
        )?;
        Ok(id)
    }

    fn fail_record(store: &mut SqliteStore, id: i64, at: OffsetDateTime) -> Result<()> {
        let current = store.get_archive_record(id)?.map(|r| r.status);
        if current == Some(ArchiveStatus::Failed) {
            store.transition_status(id, ArchiveStatus::Downloading, None, at)?;
        }
        store.transition_status(id, ArchiveStatus::Failed, Some("HTTP 503"), at)?;
        Ok(())
    }

    fn identifier(store: &SqliteStore, full_id: &str) -> Result<IdentifierRecord> {
        store
            .get_identifier(full_id)?
            .ok_or_else(|| anyhow!("identifier {full_id} missing"))
    }

    fn record(store: &SqliteStore, id: i64) -> Result<ArchiveRecord> {
        store
            .get_archive_record(id)?
            .ok_or_else(|| anyhow!("record {id} missing"))
    }

    fn completed_archive() -> CompletedArchive {
        CompletedArchive {
            content_type: "application/pdf".to_string(),
            file_extension: Some("pdf".to_string()),
            content_identifier: "bafkreigh2akiscaildc".to_string(),
            gateway_url: "https://gateway.pinata.cloud/ipfs/bafkreigh2akiscaildc".to_string(),
            file_size: 2048,
            content_hash: "ab".repeat(32),
        }
    }

    fn ids(records: Vec<ArchiveRecord>) -> Vec<i64> {
        records.into_iter().map(|r| r.id).collect()
    }

    #[test]
    fn migrate_is_idempotent_and_reports_current_version() -> Result<()> {
        let mut store = SqliteStore::open_in_memory()?;
        let before = store.schema_status()?;
        assert_eq!(before.current_version, 0);
        assert_eq!(before.pending_versions, vec![1]);

        store.migrate()?;
        let after = store.migrate()?;
        assert_eq!(after.current_version, LATEST_SCHEMA_VERSION);
        assert!(after.is_current());
        Ok(())
    }

    #[test]
    fn schema_enforces_status_check_and_foreign_keys() -> Result<()> {
        let mut store = mk_store()?;
        seed_identifier(&mut store, ID)?;

        let bad_status = store.conn.execute(
            "INSERT INTO archive_records(
                 identifier_id, attestation_uid, original_url, status, archived_at
             )
             VALUES (?1, 'uid', 'https://example.org', 'archived', '2026-01-01T00:00:00Z')",
            params![ID],
        );
        assert!(bad_status.is_err());

        let orphan = store.conn.execute(
            "INSERT INTO attestations(uid, identifier_id, attester, payload_json, created_at)
             VALUES ('orphan', 'missing-id', '0x0', '{}', '2026-01-01T00:00:00Z')",
            [],
        );
        assert!(orphan.is_err());
        Ok(())
    }

    #[test]
    fn upserting_twice_keeps_a_single_row() -> Result<()> {
        let mut store = mk_store()?;
        let id = EcocertId::parse(ID)?;
        let created = store.upsert_identifier(&NewIdentifier::new(id.clone()), T0)?;
        assert!(created);
        assert!(!store.upsert_identifier(&NewIdentifier::new(id), T0)?);

        assert_eq!(store.compute_statistics()?.total_identifiers, 1);
        let record = identifier(&store, ID)?;
        assert_eq!(record.id.compose(), ID);
        assert_eq!(record.created_at, T0);
        assert!(record.processed_at.is_none());
        Ok(())
    }

    #[test]
    fn attestation_insert_requires_parent() -> Result<()> {
        let mut store = mk_store()?;
        let err = store
            .insert_attestation(&mk_attestation(ID, "uid-1"), T0)
            .err();
        assert_eq!(err.map(|e| e.code()), Some("IDENTIFIER_NOT_FOUND"));
        Ok(())
    }

    #[test]
    fn duplicate_attestation_does_not_inflate_counter() -> Result<()> {
        let mut store = mk_store()?;
        seed_identifier(&mut store, ID)?;

        assert!(store.insert_attestation(&mk_attestation(ID, "uid-1"), T0)?);
        assert!(!store.insert_attestation(&mk_attestation(ID, "uid-1"), T0)?);
        assert!(store.insert_attestation(&mk_attestation(ID, "uid-2"), T0)?);

        assert_eq!(identifier(&store, ID)?.attestation_count, 2);
        let attestations = store.list_attestations(ID)?;
        assert_eq!(attestations.len(), 2);
        assert_eq!(attestations[0].payload["title"], "Evidence");
        assert_eq!(attestations[0].sources_count, 1);
        Ok(())
    }

    #[test]
    fn attestation_uid_stays_with_its_first_identifier() -> Result<()> {
        let mut store = mk_store()?;
        seed_identifier(&mut store, ID)?;
        seed_identifier(&mut store, OTHER_ID)?;
        store.insert_attestation(&mk_attestation(ID, "uid-1"), T0)?;

        let err = store
            .insert_attestation(&mk_attestation(OTHER_ID, "uid-1"), T0)
            .err();
        assert_eq!(
            err.as_ref().map(StoreError::code),
            Some("ATTESTATION_CONFLICT")
        );
        let converted: Option<ArchiveError> = err.map(Into::into);
        assert_eq!(
            converted.and_then(|e| e.context.get("identifier").cloned()),
            Some(ID.to_string())
        );

        assert_eq!(identifier(&store, OTHER_ID)?.attestation_count, 0);
        assert!(store.list_attestations(OTHER_ID)?.is_empty());
        assert_eq!(store.list_attestations(ID)?.len(), 1);
        Ok(())
    }

    #[test]
    fn new_archive_record_starts_pending_and_counts() -> Result<()> {
        let mut store = mk_store()?;
        seed_identifier(&mut store, ID)?;
        let id = seed_record(&mut store, ID, "uid-1", "https://example.org/a.pdf")?;

        let record = record(&store, id)?;
        assert_eq!(record.status, ArchiveStatus::Pending);
        assert_eq!(record.retry_count, 0);
        assert!(record.content_identifier.is_none());
        assert!(record.gateway_url.is_none());
        assert_eq!(record.archived_at, T0);

        assert_eq!(identifier(&store, ID)?.archived_content_count, 1);
        Ok(())
    }

    #[test]
    fn archive_record_requires_parent() -> Result<()> {
        let mut store = mk_store()?;
        let err = store
            .create_archive_record(
                &NewArchiveRecord {
                    identifier_id: ID.to_string(),
                    attestation_uid: "uid-1".to_string(),
                    original_url: "https://example.org".to_string(),
                },
                T0,
            )
            .err();
        assert_eq!(err.map(|e| e.code()), Some("IDENTIFIER_NOT_FOUND"));
        Ok(())
    }

    #[test]
    fn successful_lifecycle_completes_and_clears_error() -> Result<()> {
        let mut store = mk_store()?;
        seed_identifier(&mut store, ID)?;
        let id = seed_record(&mut store, ID, "uid-1", "https://example.org/a.pdf")?;

        // fail once, then retry through the happy path
        store.transition_status(id, ArchiveStatus::Failed, Some("timeout"), T0)?;
        store.transition_status(id, ArchiveStatus::Downloading, None, T0)?;
        store.transition_status(id, ArchiveStatus::Uploading, None, T0)?;
        store.complete_archive_record(id, &completed_archive())?;

        let record = record(&store, id)?;
        assert_eq!(record.status, ArchiveStatus::Completed);
        assert!(record.error_message.is_none());
        assert_eq!(record.file_size, Some(2048));
        assert_eq!(
            record.content_identifier.as_deref(),
            Some("bafkreigh2akiscaildc")
        );
        assert_eq!(record.retry_count, 1);
        Ok(())
    }

    #[test]
    fn failing_increments_retry_count_by_one_and_stamps_time() -> Result<()> {
        let mut store = mk_store()?;
        seed_identifier(&mut store, ID)?;
        let id = seed_record(&mut store, ID, "uid-1", "https://example.org/a.pdf")?;
        let failed_at = datetime!(2026-01-01 12:30:00 UTC);

        store.transition_status(id, ArchiveStatus::Downloading, None, T0)?;
        store.transition_status(id, ArchiveStatus::Failed, Some("HTTP 404"), failed_at)?;

        let record = record(&store, id)?;
        assert_eq!(record.status, ArchiveStatus::Failed);
        assert_eq!(record.retry_count, 1);
        assert_eq!(record.last_retry_at, Some(failed_at));
        assert_eq!(record.error_message.as_deref(), Some("HTTP 404"));
        Ok(())
    }

    #[test]
    fn forbidden_transitions_are_rejected() -> Result<()> {
        let mut store = mk_store()?;
        seed_identifier(&mut store, ID)?;
        let id = seed_record(&mut store, ID, "uid-1", "https://example.org/a.pdf")?;

        let skip = store
            .transition_status(id, ArchiveStatus::Completed, None, T0)
            .err();
        assert_eq!(skip.map(|e| e.code()), Some("INVALID_STATUS_TRANSITION"));

        let early = store
            .complete_archive_record(id, &completed_archive())
            .err();
        assert_eq!(early.map(|e| e.code()), Some("INVALID_STATUS_TRANSITION"));

        store.transition_status(id, ArchiveStatus::Downloading, None, T0)?;
        store.transition_status(id, ArchiveStatus::Uploading, None, T0)?;
        store.complete_archive_record(id, &completed_archive())?;
        let reopen = store
            .transition_status(id, ArchiveStatus::Failed, Some("late"), T0)
            .err();
        assert_eq!(reopen.map(|e| e.code()), Some("INVALID_STATUS_TRANSITION"));
        Ok(())
    }

    #[test]
    fn unknown_records_and_identifiers_are_not_found() -> Result<()> {
        let mut store = mk_store()?;
        let missing = store
            .transition_status(404, ArchiveStatus::Downloading, None, T0)
            .err();
        assert_eq!(missing.map(|e| e.code()), Some("RECORD_NOT_FOUND"));

        let err: Option<ArchiveError> = store
            .mark_identifier_processed(ID, T0)
            .err()
            .map(Into::into);
        assert_eq!(
            err.map(|e| e.code),
            Some("IDENTIFIER_NOT_FOUND".to_string())
        );
        Ok(())
    }

    #[test]
    fn mark_processed_stamps_timestamp() -> Result<()> {
        let mut store = mk_store()?;
        seed_identifier(&mut store, ID)?;
        let at = datetime!(2026-01-02 08:00:00 UTC);
        store.mark_identifier_processed(ID, at)?;

        assert_eq!(identifier(&store, ID)?.processed_at, Some(at));
        assert_eq!(store.compute_statistics()?.processed_identifiers, 1);
        Ok(())
    }

    #[test]
    fn retry_eligibility_respects_cap_and_cooldown() -> Result<()> {
        let mut store = mk_store()?;
        seed_identifier(&mut store, ID)?;
        let now = datetime!(2026-01-01 13:00:00 UTC);

        let exhausted = seed_record(&mut store, ID, "uid-1", "https://example.org/1")?;
        for _ in 0..3 {
            fail_record(&mut store, exhausted, datetime!(2026-01-01 10:00:00 UTC))?;
        }
        let cooling = seed_record(&mut store, ID, "uid-2", "https://example.org/2")?;
        fail_record(&mut store, cooling, datetime!(2026-01-01 12:58:00 UTC))?;
        let ready = seed_record(&mut store, ID, "uid-3", "https://example.org/3")?;
        fail_record(&mut store, ready, datetime!(2026-01-01 12:50:00 UTC))?;
        let still_pending = seed_record(&mut store, ID, "uid-4", "https://example.org/4")?;

        assert_eq!(record(&store, exhausted)?.retry_count, 3);

        let eligible = ids(store.query_retry_eligible(10, now)?);
        assert_eq!(eligible, vec![ready]);
        assert!(!eligible.contains(&still_pending));

        // once the cooldown passes, the recent failure becomes eligible too
        let after_cooldown = datetime!(2026-01-01 13:10:00 UTC);
        let later = ids(store.query_retry_eligible(10, after_cooldown)?);
        assert_eq!(later, vec![ready, cooling]);
        Ok(())
    }

    #[test]
    fn retry_eligibility_puts_never_retried_first() -> Result<()> {
        let mut store = mk_store()?;
        seed_identifier(&mut store, ID)?;

        let stamped = seed_record(&mut store, ID, "uid-1", "https://example.org/1")?;
        fail_record(&mut store, stamped, T0)?;
        let unstamped = seed_record(&mut store, ID, "uid-2", "https://example.org/2")?;
        store.transition_status(unstamped, ArchiveStatus::Failed, None, T0)?;

        let next_day = datetime!(2026-01-02 00:00:00 UTC);
        let eligible = ids(store.query_retry_eligible(10, next_day)?);
        assert_eq!(eligible, vec![unstamped, stamped]);
        Ok(())
    }

    #[test]
    fn retry_eligibility_caps_limit() -> Result<()> {
        let mut store = mk_store()?;
        seed_identifier(&mut store, ID)?;
        for n in 0..3 {
            let url = format!("https://example.org/{n}");
            let id = seed_record(&mut store, ID, &format!("uid-{n}"), &url)?;
            fail_record(&mut store, id, T0)?;
        }
        let later = datetime!(2026-01-02 00:00:00 UTC);
        assert_eq!(store.query_retry_eligible(2, later)?.len(), 2);
        assert!(store.query_retry_eligible(0, later)?.is_empty());
        assert_eq!(store.query_retry_eligible(10_000, later)?.len(), 3);
        Ok(())
    }

    #[test]
    fn custom_retry_policy_changes_cap() -> Result<()> {
        let mut store = mk_store()?.with_retry_policy(RetryPolicy {
            max_attempts: 1,
            cooldown: Duration::ZERO,
        });
        seed_identifier(&mut store, ID)?;
        let id = seed_record(&mut store, ID, "uid-1", "https://example.org/1")?;
        fail_record(&mut store, id, T0)?;
        assert!(store.query_retry_eligible(10, T0)?.is_empty());
        Ok(())
    }

    #[test]
    fn statistics_aggregate_by_status() -> Result<()> {
        let mut store = mk_store()?;
        seed_identifier(&mut store, ID)?;
        seed_identifier(&mut store, OTHER_ID)?;

        let done = seed_record(&mut store, ID, "uid-1", "https://example.org/1")?;
        store.transition_status(done, ArchiveStatus::Downloading, None, T0)?;
        store.transition_status(done, ArchiveStatus::Uploading, None, T0)?;
        store.complete_archive_record(done, &completed_archive())?;
        let failed = seed_record(&mut store, OTHER_ID, "uid-2", "https://example.org/2")?;
        fail_record(&mut store, failed, T0)?;
        seed_record(&mut store, OTHER_ID, "uid-3", "https://example.org/3")?;

        let stats = store.compute_statistics()?;
        assert_eq!(stats.total_identifiers, 2);
        assert_eq!(stats.total_attestations, 3);
        assert_eq!(stats.total_urls, 3);
        assert_eq!((stats.completed, stats.failed, stats.pending), (1, 1, 1));
        assert!(
            (stats.average_urls_per_identifier - 1.5).abs() < f64::EPSILON
        );

        let summaries = store.list_identifier_summaries()?;
        let other = summaries
            .iter()
            .find(|s| s.identifier_id == OTHER_ID)
            .ok_or_else(|| anyhow!("summary missing"))?;
        assert_eq!(
            (
                other.archived_content_count,
                other.completed_count,
                other.failed_count
            ),
            (2, 0, 1)
        );
        Ok(())
    }

    #[test]
    fn deleting_identifier_cascades_to_children() -> Result<()> {
        let mut store = mk_store()?;
        seed_identifier(&mut store, ID)?;
        let id = seed_record(&mut store, ID, "uid-1", "https://example.org/1")?;

        assert!(store.delete_identifier(ID)?);
        assert!(store.get_archive_record(id)?.is_none());
        assert!(store.list_attestations(ID)?.is_empty());
        assert!(!store.delete_identifier(ID)?);
        Ok(())
    }

    #[test]
    fn reset_drops_all_rows() -> Result<()> {
        let mut store = mk_store()?;
        seed_identifier(&mut store, ID)?;
        let status = store.reset()?;
        assert!(status.is_current());
        assert_eq!(store.compute_statistics()?.total_identifiers, 0);
        Ok(())
    }

    #[test]
    fn health_check_reports_clean_database() -> Result<()> {
        let store = mk_store()?;
        let health = store.health_check()?;
        assert!(health.is_healthy());
        assert_eq!(health.quick_check_message, "ok");
        Ok(())
    }

    #[test]
    fn file_backed_store_survives_reopen() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("archive.sqlite3");
        {
            let mut store = SqliteStore::open(&path)?;
            store.migrate()?;
            seed_identifier(&mut store, ID)?;
        }
        let store = SqliteStore::open(&path)?;
        assert!(store.schema_status()?.is_current());
        assert!(store.get_identifier(ID)?.is_some());
        Ok(())
    }
}
