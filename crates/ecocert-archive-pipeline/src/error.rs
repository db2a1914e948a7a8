use ecocert_archive_core::{ArchiveError, ErrorCategory};

/// Failure while validating or downloading a source URL
#[derive(Debug, thiserror::Error)]
pub enum ContentError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("unsupported protocol '{0}', only http and https are allowed")]
    InvalidProtocol(String),

    #[error("blocked request to {host}: {reason}")]
    PrivateAddressBlocked { host: String, reason: String },

    #[error("https is required, refusing {0}")]
    HttpsRequired(String),

    #[error("declared size {declared} bytes exceeds limit of {max} bytes")]
    FileTooLarge { declared: u64, max: u64 },

    #[error("content exceeded limit of {max} bytes")]
    ContentTooLarge { max: u64 },

    #[error("stream interrupted: {0}")]
    Stream(String),

    #[error("failed to write staged content: {0}")]
    Write(#[source] std::io::Error),

    #[error("failed to read staged content: {0}")]
    Read(#[source] std::io::Error),

    #[error("download failed: {message}")]
    DownloadFailed {
        status: Option<u16>,
        message: String,
    },

    #[error("gave up on {url} after {max} redirects")]
    TooManyRedirects { url: String, max: usize },
}

impl ContentError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidUrl(_) => "INVALID_URL",
            Self::InvalidProtocol(_) => "INVALID_PROTOCOL",
            Self::PrivateAddressBlocked { .. } => "PRIVATE_ADDRESS_BLOCKED",
            Self::HttpsRequired(_) => "HTTPS_REQUIRED",
            Self::FileTooLarge { .. } => "FILE_TOO_LARGE",
            Self::ContentTooLarge { .. } => "CONTENT_TOO_LARGE",
            Self::Stream(_) => "STREAM_ERROR",
            Self::Write(_) => "WRITE_ERROR",
            Self::Read(_) => "READ_ERROR",
            Self::DownloadFailed { .. } => "DOWNLOAD_FAILED",
            Self::TooManyRedirects { .. } => "TOO_MANY_REDIRECTS",
        }
    }

    /// Validation and size failures will fail the same way next time.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Stream(_) | Self::Write(_) | Self::Read(_) | Self::DownloadFailed { .. }
        )
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidUrl(_)
            | Self::InvalidProtocol(_)
            | Self::PrivateAddressBlocked { .. }
            | Self::HttpsRequired(_) => ErrorCategory::Validation,
            _ => ErrorCategory::Content,
        }
    }
}

impl From<ContentError> for ArchiveError {
    fn from(err: ContentError) -> Self {
        let mut converted = ArchiveError::new(err.code(), err.to_string(), err.category());
        if let ContentError::DownloadFailed {
            status: Some(status),
            ..
        } = &err
        {
            converted = converted.with_context("http_status", status.to_string());
        }
        if err.is_retryable() {
            converted = converted.retryable();
        }
        converted
    }
}

/// Failure reported by the pinning service or its pre-flight validation
#[derive(Debug, thiserror::Error)]
pub enum PinError {
    #[error("content is empty")]
    EmptyContent,

    #[error("content is {size} bytes, limit is {max} bytes")]
    FileTooLarge { size: u64, max: u64 },

    #[error("file type '{0}' is not allowed")]
    UnsupportedFileType(String),

    #[error("MIME type '{0}' is not allowed")]
    UnsupportedMimeType(String),

    #[error("suspicious content detected: {}", .0.join(", "))]
    SuspiciousContent(Vec<String>),

    #[error("pinning service credentials are not configured")]
    MissingCredentials,

    #[error("pinning service rejected credentials (HTTP {0})")]
    AuthenticationFailed(u16),

    #[error("pinning service rate limit reached")]
    RateLimited,

    #[error("pinning request failed with HTTP {status}: {body}")]
    RequestFailed { status: u16, body: String },

    #[error("network error talking to pinning service: {0}")]
    Network(#[from] reqwest::Error),

    #[error("unexpected pinning service response: {0}")]
    InvalidResponse(String),

    #[error("pin not found: {0}")]
    PinNotFound(String),

    #[error("all {failed} uploads in batch failed; first error: {first}")]
    BatchFailed { failed: usize, first: String },

    #[error("upload slots are closed")]
    SlotsClosed,
}

impl PinError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::EmptyContent => "EMPTY_CONTENT",
            Self::FileTooLarge { .. } => "FILE_TOO_LARGE",
            Self::UnsupportedFileType(_) => "UNSUPPORTED_FILE_TYPE",
            Self::UnsupportedMimeType(_) => "UNSUPPORTED_MIME_TYPE",
            Self::SuspiciousContent(_) => "SUSPICIOUS_CONTENT",
            Self::MissingCredentials => "MISSING_CREDENTIALS",
            Self::AuthenticationFailed(_) => "AUTHENTICATION_FAILED",
            Self::RateLimited => "RATE_LIMITED",
            Self::RequestFailed { .. } => "UPLOAD_FAILED",
            Self::Network(_) => "NETWORK_ERROR",
            Self::InvalidResponse(_) => "INVALID_RESPONSE",
            Self::PinNotFound(_) => "PIN_NOT_FOUND",
            Self::BatchFailed { .. } => "BATCH_UPLOAD_FAILED",
            Self::SlotsClosed => "UPLOAD_SLOTS_CLOSED",
        }
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited | Self::Network(_) => true,
            Self::RequestFailed { status, .. } => *status >= 500,
            _ => false,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::EmptyContent
            | Self::FileTooLarge { .. }
            | Self::UnsupportedFileType(_)
            | Self::UnsupportedMimeType(_)
            | Self::SuspiciousContent(_) => ErrorCategory::Validation,
            Self::MissingCredentials => ErrorCategory::Configuration,
            _ => ErrorCategory::Pinning,
        }
    }
}

impl From<PinError> for ArchiveError {
    fn from(err: PinError) -> Self {
        let mut converted = ArchiveError::new(err.code(), err.to_string(), err.category());
        if err.is_retryable() {
            converted = converted.retryable();
        }
        converted
    }
}
