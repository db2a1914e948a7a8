use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use url::Url;

use crate::error::ArchiveError;
use crate::ids::EcocertId;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Url,
    Ipfs,
    Arweave,
}

impl SourceKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Url => "url",
            Self::Ipfs => "ipfs",
            Self::Arweave => "arweave",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "url" => Some(Self::Url),
            "ipfs" => Some(Self::Ipfs),
            "arweave" => Some(Self::Arweave),
            _ => None,
        }
    }
}

/// Reference to external content cited by an attestation
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ContentSource {
    #[serde(rename = "type")]
    pub kind: SourceKind,
    pub src: String,
}

impl ContentSource {
    #[must_use]
    pub fn url(src: impl Into<String>) -> Self {
        Self {
            kind: SourceKind::Url,
            src: src.into(),
        }
    }

    #[must_use]
    pub fn ipfs(src: impl Into<String>) -> Self {
        Self {
            kind: SourceKind::Ipfs,
            src: src.into(),
        }
    }

    /// The source as an archivable URL, if it is `url`-tagged and parses as
    /// an absolute http(s) URL with a host.
    #[must_use]
    pub fn archivable_url(&self) -> Option<String> {
        if self.kind != SourceKind::Url {
            return None;
        }
        let candidate = self.src.trim();
        let parsed = Url::parse(candidate).ok()?;
        if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
            return None;
        }
        Some(candidate.to_string())
    }
}

/// Validated view over an attestation payload.
///
/// The raw payload stays opaque in storage; this is what the pipeline reads.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct AttestationPayload {
    pub title: Option<String>,
    pub description: Option<String>,
    pub sources: Vec<ContentSource>,
}

impl AttestationPayload {
    /// Validate a raw payload against the attestation schema.
    ///
    /// # Errors
    /// Returns `ATTESTATION_SCHEMA_INVALID` when the payload is not an object,
    /// when `title`/`description` are present but not strings, or when any
    /// `sources` entry is not `{type: url|ipfs|arweave, src: non-empty string}`.
    pub fn from_value(value: &Value) -> Result<Self, ArchiveError> {
        let Some(object) = value.as_object() else {
            return Err(ArchiveError::attestation_schema("payload must be a JSON object"));
        };

        let title = optional_string(object.get("title"), "title")?;
        let description = optional_string(object.get("description"), "description")?;

        let sources = match object.get("sources") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(entries)) => entries
                .iter()
                .enumerate()
                .map(|(index, entry)| parse_source(index, entry))
                .collect::<Result<Vec<_>, _>>()?,
            Some(_) => {
                return Err(ArchiveError::attestation_schema("sources must be an array"));
            }
        };

        Ok(Self {
            title,
            description,
            sources,
        })
    }
}

fn optional_string(value: Option<&Value>, field: &str) -> Result<Option<String>, ArchiveError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) => Ok(Some(text.clone())),
        Some(_) => Err(ArchiveError::attestation_schema(format!("{field} must be a string"))),
    }
}

fn parse_source(index: usize, entry: &Value) -> Result<ContentSource, ArchiveError> {
    let kind = entry
        .get("type")
        .and_then(Value::as_str)
        .and_then(SourceKind::parse)
        .ok_or_else(|| {
            ArchiveError::attestation_schema(format!(
                "sources[{index}].type must be one of url, ipfs, arweave"
            ))
        })?;
    let src = entry
        .get("src")
        .and_then(Value::as_str)
        .filter(|src| !src.trim().is_empty())
        .ok_or_else(|| {
            ArchiveError::attestation_schema(format!(
                "sources[{index}].src must be a non-empty string"
            ))
        })?;
    Ok(ContentSource {
        kind,
        src: src.to_string(),
    })
}

/// De-duplicated union of archivable URLs across payloads, in first-seen order.
#[must_use]
pub fn extract_urls<'a>(payloads: impl IntoIterator<Item = &'a AttestationPayload>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut urls = Vec::new();
    for payload in payloads {
        let archivable = payload
            .sources
            .iter()
            .filter_map(ContentSource::archivable_url);
        for url in archivable {
            if seen.insert(url.clone()) {
                urls.push(url);
            }
        }
    }
    urls
}

/// Attestation as delivered by the upstream source, before validation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceAttestation {
    pub uid: String,
    pub attester: String,
    pub creation_timestamp: Option<i64>,
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewAttestation {
    pub uid: String,
    pub identifier_id: String,
    pub attester: String,
    pub creation_timestamp: Option<i64>,
    pub payload: Value,
    pub sources_count: usize,
}

impl NewAttestation {
    #[must_use]
    pub fn from_source(
        identifier: &EcocertId,
        attestation: &SourceAttestation,
        payload: &AttestationPayload,
    ) -> Self {
        Self {
            uid: attestation.uid.clone(),
            identifier_id: identifier.full_id.clone(),
            attester: attestation.attester.clone(),
            creation_timestamp: attestation.creation_timestamp,
            payload: attestation.payload.clone(),
            sources_count: payload.sources.len(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttestationRecord {
    pub uid: String,
    pub identifier_id: String,
    pub attester: String,
    pub creation_timestamp: Option<i64>,
    pub payload: Value,
    pub sources_count: usize,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewIdentifier {
    pub id: EcocertId,
    pub title: Option<String>,
    pub description: Option<String>,
}

impl NewIdentifier {
    #[must_use]
    pub fn new(id: EcocertId) -> Self {
        Self {
            id,
            title: None,
            description: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentifierRecord {
    pub id: EcocertId,
    pub title: Option<String>,
    pub description: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub processed_at: Option<OffsetDateTime>,
    pub attestation_count: u64,
    pub archived_content_count: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveStatus {
    Pending,
    Downloading,
    Uploading,
    Completed,
    Failed,
}

impl ArchiveStatus {
    pub const ALL: [Self; 5] =
        [Self::Pending, Self::Downloading, Self::Uploading, Self::Completed, Self::Failed];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Uploading => "uploading",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "downloading" => Some(Self::Downloading),
            "uploading" => Some(Self::Uploading),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Pending, downloading and uploading records still have work in flight.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Downloading | Self::Uploading)
    }

    /// Happy path is pending -> downloading -> uploading -> completed; any
    /// active state may fail; failed -> downloading is a retry.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Pending, Self::Downloading)
            | (Self::Downloading, Self::Uploading)
            | (Self::Uploading, Self::Completed)
            | (Self::Failed, Self::Downloading) => true,
            (from, Self::Failed) => from.is_active(),
            _ => false,
        }
    }
}

impl std::fmt::Display for ArchiveStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewArchiveRecord {
    pub identifier_id: String,
    pub attestation_uid: String,
    pub original_url: String,
}

/// Final metadata persisted when a record completes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompletedArchive {
    pub content_type: String,
    pub file_extension: Option<String>,
    pub content_identifier: String,
    pub gateway_url: String,
    pub file_size: u64,
    pub content_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchiveRecord {
    pub id: i64,
    pub identifier_id: String,
    pub attestation_uid: String,
    pub original_url: String,
    pub content_type: Option<String>,
    pub file_extension: Option<String>,
    pub content_identifier: Option<String>,
    pub gateway_url: Option<String>,
    pub file_size: Option<u64>,
    pub content_hash: Option<String>,
    pub status: ArchiveStatus,
    pub error_message: Option<String>,
    pub retry_count: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_retry_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub archived_at: OffsetDateTime,
}

/// Raw aggregate counts read from the store
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatisticsCounts {
    pub total_identifiers: u64,
    pub processed_identifiers: u64,
    pub total_attestations: u64,
    pub pending: u64,
    pub downloading: u64,
    pub uploading: u64,
    pub completed: u64,
    pub failed: u64,
}

impl StatisticsCounts {
    #[must_use]
    pub fn total_urls(&self) -> u64 {
        self.pending + self.downloading + self.uploading + self.completed + self.failed
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ArchiveStatistics {
    pub total_identifiers: u64,
    pub processed_identifiers: u64,
    pub total_attestations: u64,
    pub total_urls: u64,
    pub pending: u64,
    pub downloading: u64,
    pub uploading: u64,
    pub completed: u64,
    pub failed: u64,
    pub average_urls_per_identifier: f64,
    pub success_rate: f64,
}

impl ArchiveStatistics {
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn derive(counts: StatisticsCounts) -> Self {
        let total_urls = counts.total_urls();
        let average_urls_per_identifier = if counts.total_identifiers == 0 {
            0.0
        } else {
            total_urls as f64 / counts.total_identifiers as f64
        };
        let success_rate =
            if total_urls == 0 { 0.0 } else { counts.completed as f64 / total_urls as f64 * 100.0 };

        Self {
            total_identifiers: counts.total_identifiers,
            processed_identifiers: counts.processed_identifiers,
            total_attestations: counts.total_attestations,
            total_urls,
            pending: counts.pending,
            downloading: counts.downloading,
            uploading: counts.uploading,
            completed: counts.completed,
            failed: counts.failed,
            average_urls_per_identifier,
            success_rate,
        }
    }
}

/// One row of the aggregate reporting view
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentifierSummary {
    pub identifier_id: String,
    pub title: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub processed_at: Option<OffsetDateTime>,
    pub attestation_count: u64,
    pub archived_content_count: u64,
    pub completed_count: u64,
    pub failed_count: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Completed,
    Failed,
}

/// Soft error captured while processing one identifier
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessingError {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attestation_uid: Option<String>,
    pub error: ArchiveError,
}

/// Result of one `process_identifier` run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentifierOutcome {
    pub identifier: String,
    pub status: ProcessingStatus,
    pub attestations_found: usize,
    pub attestations_saved: usize,
    pub urls_extracted: usize,
    pub urls_archived: usize,
    pub errors: Vec<ProcessingError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub duration_ms: u64,
}

impl IdentifierOutcome {
    #[must_use]
    pub fn empty(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            status: ProcessingStatus::Completed,
            attestations_found: 0,
            attestations_saved: 0,
            urls_extracted: 0,
            urls_archived: 0,
            errors: Vec::new(),
            note: None,
            duration_ms: 0,
        }
    }

    /// Failed outcome for input that never reached the pipeline
    #[must_use]
    pub fn rejected(identifier: impl Into<String>, error: ArchiveError) -> Self {
        let mut outcome = Self::empty(identifier);
        outcome.status = ProcessingStatus::Failed;
        outcome.errors.push(ProcessingError {
            url: None,
            attestation_uid: None,
            error,
        });
        outcome
    }

    /// Completed unless there were errors and nothing was archived.
    #[must_use]
    pub fn classify(errors: usize, urls_archived: usize) -> ProcessingStatus {
        if errors == 0 || urls_archived > 0 {
            ProcessingStatus::Completed
        } else {
            ProcessingStatus::Failed
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetrySummary {
    pub attempted: usize,
    pub successful: usize,
    pub still_failed: usize,
}
