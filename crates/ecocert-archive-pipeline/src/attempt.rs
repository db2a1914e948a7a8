//! One fetch, upload and persist pass over a single archive record.
//!
//! Shared by the orchestrator (fresh records) and the retry scheduler
//! (records picked up from `failed`).

use ecocert_archive_core::{ArchiveError, ArchiveStatus, CompletedArchive};
use ecocert_archive_store_sqlite::ArchiveStore;
use url::Url;

use crate::fetcher::ContentFetcher;
use crate::mime;
use crate::uploader::{ContentUploader, UploadMetadata};

/// Identity of the record being archived
#[derive(Debug, Clone, Copy)]
pub(crate) struct Attempt<'a> {
    pub record_id: i64,
    pub identifier_id: &'a str,
    pub attestation_uid: &'a str,
    pub url: &'a str,
}

/// Drive `attempt` to `completed`, or to `failed` with the captured message.
pub(crate) async fn run<F, U>(
    fetcher: &F,
    uploader: &U,
    store: &ArchiveStore,
    attempt: Attempt<'_>,
) -> Result<CompletedArchive, ArchiveError>
where
    F: ContentFetcher,
    U: ContentUploader,
{
    match archive(fetcher, uploader, store, attempt).await {
        Ok(completed) => Ok(completed),
        Err(err) => {
            let err = err
                .with_context("url", attempt.url)
                .with_context("record_id", attempt.record_id.to_string());
            let marked = store
                .transition_status(
                    attempt.record_id,
                    ArchiveStatus::Failed,
                    Some(err.to_string()),
                )
                .await;
            if let Err(store_err) = marked {
                tracing::error!(
                    record_id = attempt.record_id,
                    code = store_err.code(),
                    error = %store_err,
                    "could not mark archive record failed"
                );
            }
            Err(err)
        }
    }
}

async fn archive<F, U>(
    fetcher: &F,
    uploader: &U,
    store: &ArchiveStore,
    attempt: Attempt<'_>,
) -> Result<CompletedArchive, ArchiveError>
where
    F: ContentFetcher,
    U: ContentUploader,
{
    store
        .transition_status(attempt.record_id, ArchiveStatus::Downloading, None)
        .await?;
    let downloaded = fetcher.download(attempt.url).await?;
    let metadata = downloaded.metadata;

    store
        .transition_status(attempt.record_id, ArchiveStatus::Uploading, None)
        .await?;
    let filename = Url::parse(attempt.url).map_or_else(
        |_| "content".to_string(),
        |url| mime::upload_filename(&url, metadata.file_extension.as_deref()),
    );
    let upload_metadata = UploadMetadata::with_content_type(metadata.content_type.clone())
        .with_keyvalue("identifier", attempt.identifier_id)
        .with_keyvalue("attestationUid", attempt.attestation_uid)
        .with_keyvalue("sourceUrl", attempt.url);
    let uploaded = uploader
        .upload(downloaded.content, &filename, &upload_metadata)
        .await?;

    let completed = CompletedArchive {
        content_type: metadata.content_type,
        file_extension: metadata.file_extension,
        content_identifier: uploaded.content_identifier,
        gateway_url: uploaded.gateway_url,
        file_size: metadata.size,
        content_hash: metadata.content_hash,
    };
    store
        .complete_archive_record(attempt.record_id, completed.clone())
        .await?;
    Ok(completed)
}
