use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ArchiveError;

pub const DEFAULT_DATABASE_PATH: &str = "./ecocert_archive.sqlite3";
pub const DEFAULT_PINATA_API_URL: &str = "https://api.pinata.cloud";
pub const DEFAULT_GATEWAY_URL: &str = "https://gateway.pinata.cloud";

/// Runtime options for the archival pipeline
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchiveConfig {
    pub database_path: PathBuf,
    pub staging_dir: PathBuf,
    pub max_file_size_mb: u64,
    pub request_timeout_ms: u64,
    pub fetch_concurrency: usize,
    pub upload_concurrency: usize,
    pub identifier_concurrency: usize,
    pub max_retry_attempts: u32,
    #[serde(skip_serializing)]
    pub pinata_jwt: Option<String>,
    pub pinata_api_url: String,
    pub gateway_url: String,
    pub require_https: bool,
    pub production: bool,
    pub allowed_hosts: Vec<String>,
    pub enforce_mime_allowlist: bool,
    pub block_suspicious_content: bool,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(DEFAULT_DATABASE_PATH),
            staging_dir: std::env::temp_dir().join("ecocert-archive-staging"),
            max_file_size_mb: 100,
            request_timeout_ms: 30_000,
            fetch_concurrency: 5,
            upload_concurrency: 3,
            identifier_concurrency: 2,
            max_retry_attempts: 3,
            pinata_jwt: None,
            pinata_api_url: DEFAULT_PINATA_API_URL.to_string(),
            gateway_url: DEFAULT_GATEWAY_URL.to_string(),
            require_https: false,
            production: false,
            allowed_hosts: Vec::new(),
            enforce_mime_allowlist: true,
            block_suspicious_content: false,
        }
    }
}

impl ArchiveConfig {
    #[must_use]
    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb.saturating_mul(1024 * 1024)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Source URLs must be https in production or when explicitly required.
    #[must_use]
    pub fn https_only(&self) -> bool {
        self.production || self.require_https
    }

    /// Check the options for values the pipeline cannot run with.
    ///
    /// # Errors
    /// Returns an `INVALID_CONFIGURATION` error naming the first offending option.
    pub fn validate(&self) -> Result<(), ArchiveError> {
        let counts = [
            ("fetch_concurrency", self.fetch_concurrency),
            ("upload_concurrency", self.upload_concurrency),
            ("identifier_concurrency", self.identifier_concurrency),
        ];
        for (name, value) in counts {
            if value == 0 {
                return Err(ArchiveError::configuration(format!("{name} must be at least 1")));
            }
        }
        if self.max_file_size_mb == 0 {
            return Err(ArchiveError::configuration("max_file_size_mb must be at least 1"));
        }
        if self.request_timeout_ms == 0 {
            return Err(ArchiveError::configuration("request_timeout_ms must be at least 1"));
        }
        if self.max_retry_attempts == 0 {
            return Err(ArchiveError::configuration("max_retry_attempts must be at least 1"));
        }

        check_http_base("gateway_url", &self.gateway_url, false)?;
        check_http_base("pinata_api_url", &self.pinata_api_url, self.require_https)?;

        let blank_jwt = self
            .pinata_jwt
            .as_deref()
            .is_some_and(|jwt| jwt.trim().is_empty());
        if blank_jwt {
            return Err(ArchiveError::configuration("pinata_jwt is set but empty"));
        }
        Ok(())
    }
}

fn check_http_base(name: &str, value: &str, https_only: bool) -> Result<(), ArchiveError> {
    let parsed = Url::parse(value).map_err(|err| {
        ArchiveError::configuration(format!("{name} is not a valid URL"))
            .with_detail(err.to_string())
    })?;
    match parsed.scheme() {
        "https" => Ok(()),
        "http" if !https_only => Ok(()),
        "http" => Err(ArchiveError::configuration(format!("{name} must use https"))),
        other => Err(ArchiveError::configuration(format!(
            "{name} has unsupported scheme '{other}'"
        ))),
    }
}
