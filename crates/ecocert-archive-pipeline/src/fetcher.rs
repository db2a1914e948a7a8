//! Bounded streaming download of source content.
//!
//! Bytes are hashed and staged to disk as they arrive. A transfer is cut off
//! as soon as it is known to exceed the size limit, and an aborted download
//! never returns partial content. Redirects are followed by hand so every hop
//! passes the same URL policy as the original request.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use futures::future::join_all;
use futures::StreamExt;
use reqwest::header::{CONTENT_TYPE, LOCATION};
use serde::Serialize;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tokio::io::AsyncWriteExt;
use url::Url;

use crate::error::ContentError;
use crate::mime;
use crate::network::{validate_url, UrlPolicy};
use crate::staging::StagingArea;

pub const MAX_REDIRECTS: usize = 10;
pub const DEFAULT_FETCH_CONCURRENCY: usize = 5;

/// Hex SHA-256 of `bytes`.
#[must_use]
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ContentMetadata {
    pub url: String,
    pub content_type: String,
    pub file_extension: Option<String>,
    pub size: u64,
    pub content_hash: String,
    #[serde(with = "time::serde::rfc3339")]
    pub downloaded_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedContent {
    pub content: Vec<u8>,
    pub metadata: ContentMetadata,
    pub http_status: u16,
    pub headers: BTreeMap<String, String>,
}

/// Anything that can turn a URL into bytes plus metadata
pub trait ContentFetcher: Send + Sync {
    fn download(
        &self,
        url: &str,
    ) -> impl Future<Output = Result<DownloadedContent, ContentError>> + Send;
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub max_size: u64,
    pub timeout: Duration,
    pub policy: UrlPolicy,
    /// Group size used by [`HttpFetcher::download_all`]
    pub concurrency: usize,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            max_size: 100 * 1024 * 1024,
            timeout: Duration::from_secs(30),
            policy: UrlPolicy::default(),
            concurrency: DEFAULT_FETCH_CONCURRENCY,
        }
    }
}

fn request_failed(err: &reqwest::Error) -> ContentError {
    ContentError::DownloadFailed {
        status: None,
        message: err.to_string(),
    }
}

pub struct HttpFetcher {
    client: reqwest::Client,
    staging: StagingArea,
    config: FetcherConfig,
}

impl HttpFetcher {
    /// # Errors
    /// Returns an error when the HTTP client cannot be built.
    pub fn new(staging: StagingArea, config: FetcherConfig) -> Result<Self, ContentError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("ecocert-archive/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| request_failed(&err))?;
        Ok(Self {
            client,
            staging,
            config,
        })
    }

    #[must_use]
    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }

    /// Download every URL in groups of the configured concurrency.
    pub async fn download_all(
        &self,
        urls: &[String],
    ) -> Vec<(String, Result<DownloadedContent, ContentError>)> {
        download_batch(self, urls, self.config.concurrency).await
    }

    /// Send a GET and follow redirects, validating each `Location` target.
    async fn send(&self, mut url: Url) -> Result<(Url, reqwest::Response), ContentError> {
        for _ in 0..=MAX_REDIRECTS {
            let response = self
                .client
                .get(url.clone())
                .send()
                .await
                .map_err(|err| request_failed(&err))?;

            if !response.status().is_redirection() {
                return Ok((url, response));
            }
            let Some(location) = response.headers().get(LOCATION) else {
                return Ok((url, response));
            };
            let location = location.to_str().map_err(|_| {
                ContentError::InvalidUrl(format!("redirect from {url} has an unreadable location"))
            })?;
            let next = url
                .join(location)
                .map_err(|err| ContentError::InvalidUrl(format!("{location}: {err}")))?;

            tracing::debug!(from = %url, to = %next, "following redirect");
            url = validate_url(next.as_str(), &self.config.policy)?;
        }

        Err(ContentError::TooManyRedirects {
            url: url.to_string(),
            max: MAX_REDIRECTS,
        })
    }

    async fn fetch(&self, raw_url: &str) -> Result<DownloadedContent, ContentError> {
        let url = validate_url(raw_url, &self.config.policy)?;
        let max = self.config.max_size;

        let (url, response) = self.send(url).await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ContentError::DownloadFailed {
                status: Some(status.as_u16()),
                message: format!("HTTP {status} from {url}"),
            });
        }

        if let Some(declared) = response.content_length() {
            if declared > max {
                return Err(ContentError::FileTooLarge { declared, max });
            }
        }

        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                let value = value.to_str().ok()?;
                Some((name.as_str().to_string(), value.to_string()))
            })
            .collect();
        let header_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        let staged = self.staging.reserve();
        let mut file = tokio::fs::File::create(staged.path())
            .await
            .map_err(ContentError::Write)?;
        let mut hasher = Sha256::new();
        let mut size: u64 = 0;

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|err| ContentError::Stream(err.to_string()))?;
            size += chunk.len() as u64;
            if size > max {
                tracing::warn!(url = %url, max, "download exceeded size limit, aborting");
                return Err(ContentError::ContentTooLarge { max });
            }
            hasher.update(&chunk);
            file.write_all(&chunk).await.map_err(ContentError::Write)?;
        }
        file.flush().await.map_err(ContentError::Write)?;
        drop(file);

        let content = tokio::fs::read(staged.path())
            .await
            .map_err(ContentError::Read)?;
        staged.remove().await;

        let content_type = mime::resolve_content_type(header_type.as_deref(), &url);
        let file_extension = mime::resolve_extension(&url, &content_type);
        let metadata = ContentMetadata {
            url: raw_url.to_string(),
            content_type,
            file_extension,
            size,
            content_hash: hex::encode(hasher.finalize()),
            downloaded_at: OffsetDateTime::now_utc(),
        };

        Ok(DownloadedContent {
            content,
            metadata,
            http_status: status.as_u16(),
            headers,
        })
    }
}

impl ContentFetcher for HttpFetcher {
    async fn download(&self, url: &str) -> Result<DownloadedContent, ContentError> {
        let result = self.fetch(url).await;
        match &result {
            Ok(downloaded) => tracing::debug!(
                url,
                size = downloaded.metadata.size,
                content_type = %downloaded.metadata.content_type,
                "downloaded content"
            ),
            Err(err) => tracing::debug!(url, code = err.code(), error = %err, "download failed"),
        }
        result
    }
}

/// Download `urls` in sequential groups of `group_size`, concurrently within
/// a group. Each URL gets its own result; one failure never aborts the rest.
pub async fn download_batch<F: ContentFetcher>(
    fetcher: &F,
    urls: &[String],
    group_size: usize,
) -> Vec<(String, Result<DownloadedContent, ContentError>)> {
    let mut results = Vec::with_capacity(urls.len());
    for group in urls.chunks(group_size.max(1)) {
        let downloads = join_all(group.iter().map(|url| fetcher.download(url))).await;
        results.extend(group.iter().cloned().zip(downloads));
    }
    results
}
