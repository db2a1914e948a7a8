//! On-demand re-processing of failed archive records.

use std::collections::BTreeMap;
use std::sync::Arc;

use ecocert_archive_core::{ArchiveError, ArchiveRecord, RetrySummary};
use ecocert_archive_store_sqlite::ArchiveStore;

use crate::attempt::{self, Attempt};
use crate::fetcher::ContentFetcher;
use crate::uploader::ContentUploader;

pub struct RetryScheduler<F, U> {
    fetcher: Arc<F>,
    uploader: Arc<U>,
    store: ArchiveStore,
}

impl<F, U> RetryScheduler<F, U>
where
    F: ContentFetcher,
    U: ContentUploader,
{
    pub fn new(fetcher: Arc<F>, uploader: Arc<U>, store: ArchiveStore) -> Self {
        Self {
            fetcher,
            uploader,
            store,
        }
    }

    /// Re-run up to `limit` retry-eligible records, one at a time.
    ///
    /// # Errors
    /// Returns an error only when the eligible records cannot be queried;
    /// individual retry failures are counted in the summary.
    pub async fn retry_failed(&self, limit: usize) -> Result<RetrySummary, ArchiveError> {
        let records = self.store.query_retry_eligible(limit).await?;
        let mut summary = RetrySummary::default();
        if records.is_empty() {
            tracing::info!("no failed records eligible for retry");
            return Ok(summary);
        }

        let mut by_identifier: BTreeMap<&str, Vec<&ArchiveRecord>> = BTreeMap::new();
        for record in &records {
            by_identifier
                .entry(record.identifier_id.as_str())
                .or_default()
                .push(record);
        }
        tracing::info!(
            records = records.len(),
            identifiers = by_identifier.len(),
            "retrying failed records"
        );

        for (identifier, group) in by_identifier {
            tracing::debug!(identifier, records = group.len(), "retrying identifier");
            for record in group {
                summary.attempted += 1;
                let attempt = Attempt {
                    record_id: record.id,
                    identifier_id: identifier,
                    attestation_uid: &record.attestation_uid,
                    url: &record.original_url,
                };
                let fetcher = self.fetcher.as_ref();
                let uploader = self.uploader.as_ref();
                match attempt::run(fetcher, uploader, &self.store, attempt).await {
                    Ok(completed) => {
                        summary.successful += 1;
                        tracing::info!(
                            identifier,
                            record_id = record.id,
                            url = %record.original_url,
                            content_identifier = %completed.content_identifier,
                            "retry succeeded"
                        );
                    }
                    Err(err) => {
                        summary.still_failed += 1;
                        tracing::warn!(
                            identifier,
                            record_id = record.id,
                            url = %record.original_url,
                            attempt = record.retry_count + 1,
                            code = %err.code,
                            error = %err,
                            "retry failed"
                        );
                    }
                }
            }
        }

        tracing::info!(
            attempted = summary.attempted,
            successful = summary.successful,
            still_failed = summary.still_failed,
            "retry pass finished"
        );
        Ok(summary)
    }
}
