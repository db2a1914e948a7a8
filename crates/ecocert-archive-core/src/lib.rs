//! Domain types for the ecocert content archive.

pub mod config;
pub mod error;
pub mod ids;
pub mod model;

pub use config::ArchiveConfig;
pub use error::{ArchiveError, ErrorCategory, ErrorCode};
pub use ids::EcocertId;
pub use model::{
    extract_urls, ArchiveRecord, ArchiveStatistics, ArchiveStatus, AttestationPayload,
    AttestationRecord, CompletedArchive, ContentSource, IdentifierOutcome, IdentifierRecord,
    IdentifierSummary, NewArchiveRecord, NewAttestation, NewIdentifier, ProcessingError,
    ProcessingStatus, RetrySummary, SourceAttestation, SourceKind, StatisticsCounts,
};
