//! Content-addressed upload to a Pinata-compatible pinning service.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use futures::future::join_all;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::multipart::{Form, Part};
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::Semaphore;

use crate::content_validation::{validate_content, ValidationPolicy};
use crate::error::PinError;
use crate::fetcher::content_hash;

/// Regions every artifact is replicated to, one copy each
pub const REPLICATION_REGIONS: &[&str] = &["FRA1", "NYC1"];
pub const DEFAULT_UPLOAD_CONCURRENCY: usize = 3;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct UploadResult {
    pub content_identifier: String,
    pub size: u64,
    pub gateway_url: String,
    #[serde(with = "time::serde::rfc3339")]
    pub uploaded_at: OffsetDateTime,
}

/// Optional caller-provided metadata for an upload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadMetadata {
    pub content_type: Option<String>,
    pub keyvalues: BTreeMap<String, String>,
}

impl UploadMetadata {
    #[must_use]
    pub fn with_content_type(content_type: impl Into<String>) -> Self {
        Self {
            content_type: Some(content_type.into()),
            keyvalues: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_keyvalue(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.keyvalues.insert(key.into(), value.into());
        self
    }
}

/// A content-addressed store the pipeline can push bytes into
pub trait ContentUploader: Send + Sync {
    fn upload(
        &self,
        content: Vec<u8>,
        filename: &str,
        metadata: &UploadMetadata,
    ) -> impl Future<Output = Result<UploadResult, PinError>> + Send;

    /// Whether the service accepts our credentials right now.
    fn health_check(&self) -> impl Future<Output = bool> + Send;
}

#[derive(Debug, Clone)]
pub struct PinataConfig {
    pub api_url: String,
    pub gateway_url: String,
    pub jwt: String,
    pub timeout: Duration,
    pub validation: ValidationPolicy,
    /// Pins allowed in flight at once, and the group size of
    /// [`PinataClient::upload_all`]
    pub concurrency: usize,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct PinJob {
    pub id: String,
    #[serde(rename = "ipfsHash")]
    pub content_identifier: String,
    pub status: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct PinRegion {
    #[serde(rename = "regionId")]
    pub region_id: String,
    #[serde(rename = "currentReplicationCount", default)]
    pub current_replication_count: u32,
    #[serde(rename = "desiredReplicationCount", default)]
    pub desired_replication_count: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct PinInfo {
    pub id: String,
    #[serde(rename = "ipfs_pin_hash")]
    pub content_identifier: String,
    pub size: u64,
    pub date_pinned: Option<String>,
    pub date_unpinned: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub regions: Vec<PinRegion>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PinStatus {
    Pinned,
    Unpinned,
    NotFound,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct UsageStats {
    pub pin_count: u64,
    pub pin_size_total: u64,
    pub pin_size_with_replications_total: u64,
}

#[derive(Debug, Deserialize)]
struct PinFileResponse {
    #[serde(rename = "IpfsHash")]
    ipfs_hash: String,
    #[serde(rename = "PinSize")]
    pin_size: u64,
}

#[derive(Debug, Deserialize)]
struct PinListResponse {
    #[serde(default)]
    rows: Vec<PinInfo>,
}

pub struct PinataClient {
    client: reqwest::Client,
    config: PinataConfig,
    slots: Semaphore,
}

impl PinataClient {
    /// # Errors
    /// Returns `MISSING_CREDENTIALS` for an empty token, or a network error
    /// when the HTTP client cannot be built.
    pub fn new(config: PinataConfig) -> Result<Self, PinError> {
        let jwt = config.jwt.trim();
        if jwt.is_empty() {
            return Err(PinError::MissingCredentials);
        }
        let mut bearer = HeaderValue::from_str(&format!("Bearer {jwt}"))
            .map_err(|_| PinError::MissingCredentials)?;
        bearer.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, bearer);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()?;
        let slots = Semaphore::new(config.concurrency.max(1));
        Ok(Self {
            client,
            config,
            slots,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.config.api_url.trim_end_matches('/'))
    }

    #[must_use]
    pub fn gateway_url_for(&self, content_identifier: &str) -> String {
        format!(
            "{}/ipfs/{content_identifier}",
            self.config.gateway_url.trim_end_matches('/')
        )
    }

    /// Upload every item in groups of the configured concurrency.
    ///
    /// # Errors
    /// Returns `BATCH_UPLOAD_FAILED` when a non-empty batch produced no success at all.
    pub async fn upload_all(
        &self,
        items: Vec<UploadItem>,
    ) -> Result<Vec<(String, Result<UploadResult, PinError>)>, PinError> {
        upload_batch(self, items, self.config.concurrency).await
    }

    async fn pin_file(
        &self,
        content: Vec<u8>,
        filename: &str,
        metadata: &UploadMetadata,
    ) -> Result<UploadResult, PinError> {
        let report = validate_content(
            &content,
            filename,
            metadata.content_type.as_deref(),
            &self.config.validation,
        )?;
        let size = content.len() as u64;
        let uploaded_at = OffsetDateTime::now_utc();
        let uploaded_at_text = uploaded_at
            .format(&Rfc3339)
            .map_err(|err| PinError::InvalidResponse(err.to_string()))?;

        let mut keyvalues = metadata.keyvalues.clone();
        keyvalues.insert("originalFilename".into(), filename.to_string());
        keyvalues.insert("contentHash".into(), content_hash(&content));
        keyvalues.insert("uploadedAt".into(), uploaded_at_text);
        keyvalues.insert("size".into(), size.to_string());
        keyvalues.insert("contentType".into(), report.mime_type.clone());

        let pinata_metadata = json!({ "name": filename, "keyvalues": keyvalues });
        let regions: Vec<_> = REPLICATION_REGIONS
            .iter()
            .map(|id| json!({ "id": id, "desiredReplicationCount": 1 }))
            .collect();
        let pinata_options = json!({ "cidVersion": 1, "customPinPolicy": { "regions": regions } });

        let file = Part::bytes(content)
            .file_name(filename.to_string())
            .mime_str(&report.mime_type)?;
        let form = Form::new()
            .part("file", file)
            .text("pinataMetadata", pinata_metadata.to_string())
            .text("pinataOptions", pinata_options.to_string());

        let response = self
            .client
            .post(self.endpoint("/pinning/pinFileToIPFS"))
            .multipart(form)
            .send()
            .await?;
        let pinned: PinFileResponse = parse_json(response).await?;

        Ok(UploadResult {
            gateway_url: self.gateway_url_for(&pinned.ipfs_hash),
            content_identifier: pinned.ipfs_hash,
            size: if pinned.pin_size == 0 {
                size
            } else {
                pinned.pin_size
            },
            uploaded_at,
        })
    }

    /// Ask the service to pin content that already exists on the network.
    ///
    /// # Errors
    /// Returns a `PinError` when the request fails or is rejected.
    pub async fn pin_by_hash(
        &self,
        content_identifier: &str,
        name: Option<&str>,
    ) -> Result<PinJob, PinError> {
        let mut body = json!({ "hashToPin": content_identifier });
        if let Some(name) = name {
            body["pinataMetadata"] = json!({ "name": name });
        }
        let response = self
            .client
            .post(self.endpoint("/pinning/pinByHash"))
            .json(&body)
            .send()
            .await?;
        parse_json(response).await
    }

    /// Pin details for `content_identifier`, if the account has ever pinned it.
    ///
    /// # Errors
    /// Returns a `PinError` when the request fails or is rejected.
    pub async fn pin_info(&self, content_identifier: &str) -> Result<Option<PinInfo>, PinError> {
        let response = self
            .client
            .get(self.endpoint("/data/pinList"))
            .query(&[("hashContains", content_identifier)])
            .send()
            .await?;
        let list: PinListResponse = parse_json(response).await?;
        Ok(list
            .rows
            .into_iter()
            .find(|row| row.content_identifier == content_identifier))
    }

    /// # Errors
    /// Returns a `PinError` when the request fails or is rejected.
    pub async fn pin_status(&self, content_identifier: &str) -> Result<PinStatus, PinError> {
        Ok(match self.pin_info(content_identifier).await? {
            None => PinStatus::NotFound,
            Some(info) if info.date_unpinned.is_some() => PinStatus::Unpinned,
            Some(_) => PinStatus::Pinned,
        })
    }

    /// # Errors
    /// Returns `PIN_NOT_FOUND` when the service does not know the hash.
    pub async fn unpin(&self, content_identifier: &str) -> Result<(), PinError> {
        let response = self
            .client
            .delete(self.endpoint(&format!("/pinning/unpin/{content_identifier}")))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(PinError::PinNotFound(content_identifier.to_string()));
        }
        check_status(response).await.map(|_| ())
    }

    /// # Errors
    /// Returns a `PinError` when the request fails or is rejected.
    pub async fn usage_stats(&self) -> Result<UsageStats, PinError> {
        let response = self
            .client
            .get(self.endpoint("/data/userPinnedDataTotal"))
            .send()
            .await?;
        parse_json(response).await
    }
}

impl ContentUploader for PinataClient {
    async fn upload(
        &self,
        content: Vec<u8>,
        filename: &str,
        metadata: &UploadMetadata,
    ) -> Result<UploadResult, PinError> {
        let _slot = self
            .slots
            .acquire()
            .await
            .map_err(|_| PinError::SlotsClosed)?;
        let result = self.pin_file(content, filename, metadata).await;
        match &result {
            Ok(uploaded) => tracing::info!(
                filename,
                content_identifier = %uploaded.content_identifier,
                size = uploaded.size,
                "pinned content"
            ),
            Err(err) => {
                tracing::warn!(filename, code = err.code(), error = %err, "pinning failed");
            }
        }
        result
    }

    async fn health_check(&self) -> bool {
        let response = match self
            .client
            .get(self.endpoint("/data/testAuthentication"))
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(error = %err, "pinning service unreachable");
                return false;
            }
        };
        match check_status(response).await {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!(
                    code = err.code(),
                    error = %err,
                    "pinning service health check failed"
                );
                false
            }
        }
    }
}

async fn check_status(response: Response) -> Result<Response, PinError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(PinError::AuthenticationFailed(status.as_u16()))
        }
        StatusCode::TOO_MANY_REQUESTS => Err(PinError::RateLimited),
        _ => {
            let body = response.text().await.unwrap_or_default();
            Err(PinError::RequestFailed {
                status: status.as_u16(),
                body: body.chars().take(512).collect(),
            })
        }
    }
}

async fn parse_json<T: for<'de> Deserialize<'de>>(response: Response) -> Result<T, PinError> {
    let response = check_status(response).await?;
    let body = response.text().await?;
    serde_json::from_str(&body).map_err(|err| PinError::InvalidResponse(err.to_string()))
}

/// One item of an upload batch
#[derive(Debug, Clone)]
pub struct UploadItem {
    pub content: Vec<u8>,
    pub filename: String,
    pub metadata: UploadMetadata,
}

/// Upload `items` in sequential groups of `group_size`.
///
/// Per-item failures are returned alongside successes.
///
/// # Errors
/// Returns `BATCH_UPLOAD_FAILED` when a non-empty batch produced no success at all.
pub async fn upload_batch<U: ContentUploader>(
    uploader: &U,
    items: Vec<UploadItem>,
    group_size: usize,
) -> Result<Vec<(String, Result<UploadResult, PinError>)>, PinError> {
    let total = items.len();
    let mut results = Vec::with_capacity(total);
    let mut pending = items.into_iter().peekable();

    while pending.peek().is_some() {
        let group: Vec<UploadItem> = pending.by_ref().take(group_size.max(1)).collect();
        let uploads = join_all(group.into_iter().map(|item| async move {
            let result = uploader
                .upload(item.content, &item.filename, &item.metadata)
                .await;
            (item.filename, result)
        }))
        .await;
        results.extend(uploads);
    }

    if total > 0 && results.iter().all(|(_, result)| result.is_err()) {
        let first = results
            .iter()
            .find_map(|(_, result)| result.as_ref().err().map(ToString::to_string))
            .unwrap_or_default();
        return Err(PinError::BatchFailed {
            failed: total,
            first,
        });
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct FlakyUploader {
        calls: AtomicUsize,
        fail_all: bool,
    }

    impl FlakyUploader {
        fn new(fail_all: bool) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_all,
            }
        }
    }

    impl ContentUploader for FlakyUploader {
        async fn upload(
            &self,
            content: Vec<u8>,
            filename: &str,
            _: &UploadMetadata,
        ) -> Result<UploadResult, PinError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_all || call % 2 == 1 {
                return Err(PinError::RequestFailed {
                    status: 500,
                    body: format!("{filename} failed"),
                });
            }
            Ok(UploadResult {
                content_identifier: format!("bafy{call}"),
                size: content.len() as u64,
                gateway_url: format!("https://gateway.example/ipfs/bafy{call}"),
                uploaded_at: OffsetDateTime::now_utc(),
            })
        }

        async fn health_check(&self) -> bool {
            true
        }
    }

    fn items(count: usize) -> Vec<UploadItem> {
        (0..count)
            .map(|n| UploadItem {
                content: vec![b'x'; 8],
                filename: format!("file-{n}.txt"),
                metadata: UploadMetadata::default(),
            })
            .collect()
    }

    #[tokio::test]
    async fn batch_returns_partial_failures() -> Result<(), PinError> {
        let uploader = FlakyUploader::new(false);
        let results = upload_batch(&uploader, items(4), 3).await?;
        assert_eq!(results.len(), 4);
        assert_eq!(results.iter().filter(|(_, r)| r.is_ok()).count(), 2);
        assert_eq!(results[0].0, "file-0.txt");
        Ok(())
    }

    #[tokio::test]
    async fn batch_with_no_success_fails_as_a_whole() {
        let uploader = FlakyUploader::new(true);
        let err = upload_batch(&uploader, items(2), 3).await.err();
        assert_eq!(
            err.as_ref().map(PinError::code),
            Some("BATCH_UPLOAD_FAILED")
        );
        assert!(matches!(err, Some(PinError::BatchFailed { failed: 2, .. })));
    }

    #[tokio::test]
    async fn empty_batch_is_not_a_failure() -> Result<(), PinError> {
        let uploader = FlakyUploader::new(true);
        assert!(upload_batch(&uploader, Vec::new(), 3).await?.is_empty());
        Ok(())
    }

    #[test]
    fn client_requires_credentials() {
        let config = PinataConfig {
            api_url: "https://api.pinata.cloud".into(),
            gateway_url: "https://gateway.pinata.cloud/".into(),
            jwt: "  ".into(),
            timeout: Duration::from_secs(5),
            validation: ValidationPolicy::default(),
            concurrency: DEFAULT_UPLOAD_CONCURRENCY,
        };
        assert!(matches!(
            PinataClient::new(config),
            Err(PinError::MissingCredentials)
        ));
    }
}
