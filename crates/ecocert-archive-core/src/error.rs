//! Shared error model for the archival pipeline.
//!
//! Every layer has its own `thiserror` enum (content, pinning, storage) and
//! converts into [`ArchiveError`] at the point where the failure is captured
//! into a processing result. An `ArchiveError` carries:
//! - a stable machine-readable code
//! - a human readable message
//! - optional internal detail and structured context
//! - whether the operation may be retried

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Error categories for grouping and reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Invalid or missing configuration
    Configuration,
    /// Network and content retrieval failures
    Content,
    /// Record store failures
    Storage,
    /// Input validation failures (identifiers, payloads)
    Validation,
    /// Pinning service failures
    Pinning,
    /// Unexpected state
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::Content => write!(f, "content"),
            Self::Storage => write!(f, "storage"),
            Self::Validation => write!(f, "validation"),
            Self::Pinning => write!(f, "pinning"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// Stable error codes shared across crates.
///
/// Layer-specific codes (for example `PRIVATE_ADDRESS_BLOCKED` or
/// `RECORD_NOT_FOUND`) live next to the enum that produces them.
pub struct ErrorCode;

impl ErrorCode {
    pub const INVALID_IDENTIFIER: &'static str = "INVALID_IDENTIFIER";
    pub const ATTESTATION_SCHEMA_INVALID: &'static str = "ATTESTATION_SCHEMA_INVALID";
    pub const INVALID_CONFIGURATION: &'static str = "INVALID_CONFIGURATION";
    pub const SOURCE_UNAVAILABLE: &'static str = "SOURCE_UNAVAILABLE";
    pub const INTERNAL_ERROR: &'static str = "INTERNAL_ERROR";
}

/// Classified failure captured by the pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub context: BTreeMap<String, String>,
    pub retryable: bool,
    pub category: ErrorCategory,
}

impl ArchiveError {
    pub fn new(
        code: impl Into<String>,
        message: impl Into<String>,
        category: ErrorCategory,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            detail: None,
            context: BTreeMap::new(),
            retryable: false,
            category,
        }
    }

    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Attach a structured key/value pair (url, record id, ...)
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }

    pub fn invalid_identifier(message: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::INVALID_IDENTIFIER,
            message,
            ErrorCategory::Validation,
        )
    }

    pub fn attestation_schema(message: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::ATTESTATION_SCHEMA_INVALID,
            message,
            ErrorCategory::Validation,
        )
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::INVALID_CONFIGURATION,
            message,
            ErrorCategory::Configuration,
        )
    }

    /// The upstream attestation source could not be queried
    pub fn source_unavailable(detail: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::SOURCE_UNAVAILABLE,
            "Attestation source unavailable",
            ErrorCategory::Content,
        )
        .with_detail(detail)
        .retryable()
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::INTERNAL_ERROR,
            "An internal error occurred",
            ErrorCategory::Internal,
        )
        .with_detail(detail)
    }
}

impl fmt::Display for ArchiveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(detail) = &self.detail {
            write!(f, ": {detail}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ArchiveError {}
