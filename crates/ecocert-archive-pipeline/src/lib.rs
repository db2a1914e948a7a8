//! Content archival pipeline.
//!
//! A [`ContentFetcher`] turns source URLs into bytes, a [`ContentUploader`]
//! pins them to a content-addressed store, and the [`Orchestrator`] drives
//! both per identifier while the record store tracks each URL's status.
//! Failed records are picked up again by the [`RetryScheduler`].

mod attempt;
pub mod content_validation;
pub mod error;
pub mod fetcher;
pub mod mime;
pub mod network;
pub mod orchestrator;
pub mod retry;
pub mod shutdown;
pub mod source;
pub mod staging;
pub mod uploader;

pub use content_validation::{validate_content, ValidationPolicy, ValidationReport};
pub use error::{ContentError, PinError};
pub use fetcher::{
    content_hash, download_batch, ContentFetcher, ContentMetadata, DownloadedContent,
    FetcherConfig, HttpFetcher, DEFAULT_FETCH_CONCURRENCY, MAX_REDIRECTS,
};
pub use network::{validate_url, UrlPolicy};
pub use orchestrator::{
    Orchestrator, PipelineEvent, DEFAULT_IDENTIFIER_CONCURRENCY, DEFAULT_URL_CONCURRENCY,
};
pub use retry::RetryScheduler;
pub use shutdown::{GracefulShutdown, ShutdownOutcome, DEFAULT_GRACE_PERIOD};
pub use source::{AttestationSource, MockAttestationSource};
pub use staging::{StagedFile, StagingArea, STALE_AFTER};
pub use uploader::{
    upload_batch, ContentUploader, PinInfo, PinJob, PinStatus, PinataClient, PinataConfig,
    UploadItem, UploadMetadata, UploadResult, UsageStats, DEFAULT_UPLOAD_CONCURRENCY,
};
