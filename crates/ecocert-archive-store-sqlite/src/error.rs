use ecocert_archive_core::{ArchiveError, ArchiveStatus, ErrorCategory};
use rusqlite::ErrorCode;

/// Table a failed write was aimed at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Identifier,
    Attestation,
    ArchiveRecord,
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Identifier => write!(f, "identifier"),
            Self::Attestation => write!(f, "attestation"),
            Self::ArchiveRecord => write!(f, "archive record"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to open database at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("schema migration failed: {0}")]
    Migration(String),

    #[error("identifier not found: {0}")]
    IdentifierNotFound(String),

    #[error("archive record not found: {0}")]
    RecordNotFound(i64),

    #[error("archive record {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: i64,
        from: ArchiveStatus,
        to: ArchiveStatus,
    },

    #[error("attestation {uid} already belongs to identifier {owner}")]
    AttestationConflict { uid: String, owner: String },

    #[error("failed to insert {entity}: {source}")]
    InsertFailed {
        entity: Entity,
        #[source]
        source: rusqlite::Error,
    },

    #[error("failed to update {entity}: {source}")]
    UpdateFailed {
        entity: Entity,
        #[source]
        source: rusqlite::Error,
    },

    #[error("query failed ({what}): {source}")]
    QueryFailed {
        what: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("invalid timestamp: {0}")]
    Timestamp(String),

    #[error("store executor unavailable: {0}")]
    Executor(#[from] std::io::Error),

    #[error("store executor has shut down")]
    Closed,
}

impl StoreError {
    pub(crate) fn query(what: &'static str) -> impl FnOnce(rusqlite::Error) -> Self {
        move |source| Self::QueryFailed { what, source }
    }

    pub(crate) fn insert(entity: Entity) -> impl FnOnce(rusqlite::Error) -> Self {
        move |source| Self::InsertFailed { entity, source }
    }

    pub(crate) fn update(entity: Entity) -> impl FnOnce(rusqlite::Error) -> Self {
        move |source| Self::UpdateFailed { entity, source }
    }

    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Open { .. } => "STORE_OPEN_FAILED",
            Self::Migration(_) => "MIGRATION_FAILED",
            Self::IdentifierNotFound(_) => "IDENTIFIER_NOT_FOUND",
            Self::RecordNotFound(_) => "RECORD_NOT_FOUND",
            Self::InvalidTransition { .. } => "INVALID_STATUS_TRANSITION",
            Self::AttestationConflict { .. } => "ATTESTATION_CONFLICT",
            Self::InsertFailed { entity, .. } => match entity {
                Entity::Identifier => "IDENTIFIER_INSERT_FAILED",
                Entity::Attestation => "ATTESTATION_INSERT_FAILED",
                Entity::ArchiveRecord => "ARCHIVE_RECORD_INSERT_FAILED",
            },
            Self::UpdateFailed { entity, .. } => match entity {
                Entity::Identifier => "IDENTIFIER_UPDATE_FAILED",
                Entity::Attestation => "ATTESTATION_UPDATE_FAILED",
                Entity::ArchiveRecord => "ARCHIVE_RECORD_UPDATE_FAILED",
            },
            Self::QueryFailed { .. } => "STORE_QUERY_FAILED",
            Self::Timestamp(_) => "INVALID_TIMESTAMP",
            Self::Executor(_) | Self::Closed => "STORE_CLOSED",
        }
    }

    /// Lock contention is the only storage failure worth retrying.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        let source = match self {
            Self::InsertFailed { source, .. }
            | Self::UpdateFailed { source, .. }
            | Self::QueryFailed { source, .. } => source,
            _ => return false,
        };
        matches!(
            source.sqlite_error_code(),
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
        )
    }
}

impl From<StoreError> for ArchiveError {
    fn from(err: StoreError) -> Self {
        let category = match err {
            StoreError::IdentifierNotFound(_)
            | StoreError::InvalidTransition { .. }
            | StoreError::AttestationConflict { .. } => ErrorCategory::Validation,
            _ => ErrorCategory::Storage,
        };
        let mut converted = ArchiveError::new(err.code(), err.to_string(), category);
        match &err {
            StoreError::IdentifierNotFound(id) => {
                converted = converted.with_context("identifier", id.clone());
            }
            StoreError::AttestationConflict { owner, .. } => {
                converted = converted.with_context("identifier", owner.clone());
            }
            StoreError::RecordNotFound(id) | StoreError::InvalidTransition { id, .. } => {
                converted = converted.with_context("record_id", id.to_string());
            }
            _ => {}
        }
        if err.is_retryable() {
            converted = converted.retryable();
        }
        converted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_errors_convert_with_context() {
        let err: ArchiveError = StoreError::InvalidTransition {
            id: 7,
            from: ArchiveStatus::Completed,
            to: ArchiveStatus::Failed,
        }
        .into();
        assert_eq!(err.code, "INVALID_STATUS_TRANSITION");
        assert_eq!(err.context.get("record_id").map(String::as_str), Some("7"));
        assert!(!err.retryable);
    }

    #[test]
    fn busy_database_is_retryable() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".into()),
        );
        let err = StoreError::insert(Entity::Attestation)(busy);
        assert_eq!(err.code(), "ATTESTATION_INSERT_FAILED");
        assert!(err.is_retryable());
        assert!(!StoreError::Closed.is_retryable());
    }
}
