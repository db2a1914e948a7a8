//! Per-identifier archival pipeline and the chunked batch runner.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use ecocert_archive_core::{
    extract_urls, ArchiveError, AttestationPayload, EcocertId, IdentifierOutcome,
    NewArchiveRecord, NewAttestation, NewIdentifier, ProcessingError, ProcessingStatus,
};
use ecocert_archive_store_sqlite::ArchiveStore;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::attempt::{self, Attempt};
use crate::fetcher::{ContentFetcher, DEFAULT_FETCH_CONCURRENCY};
use crate::retry::RetryScheduler;
use crate::source::AttestationSource;
use crate::uploader::ContentUploader;

/// Default number of identifiers processed concurrently in one chunk
pub const DEFAULT_IDENTIFIER_CONCURRENCY: usize = 2;
/// Default number of one identifier's URLs archived concurrently
pub const DEFAULT_URL_CONCURRENCY: usize = DEFAULT_FETCH_CONCURRENCY;

/// Lifecycle event published while the pipeline runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    IdentifierStarted {
        identifier: String,
    },
    UrlArchived {
        identifier: String,
        url: String,
        record_id: i64,
        content_identifier: String,
    },
    UrlFailed {
        identifier: String,
        url: String,
        record_id: Option<i64>,
        code: String,
        message: String,
    },
    IdentifierFinished {
        identifier: String,
        status: ProcessingStatus,
        urls_archived: usize,
        errors: usize,
    },
    ChunkFinished {
        chunk: usize,
        identifiers: usize,
    },
}

pub struct Orchestrator<S, F, U> {
    source: Arc<S>,
    fetcher: Arc<F>,
    uploader: Arc<U>,
    store: ArchiveStore,
    identifier_concurrency: usize,
    url_concurrency: usize,
    events: Option<mpsc::Sender<PipelineEvent>>,
}

impl<S, F, U> Clone for Orchestrator<S, F, U> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            fetcher: Arc::clone(&self.fetcher),
            uploader: Arc::clone(&self.uploader),
            store: self.store.clone(),
            identifier_concurrency: self.identifier_concurrency,
            url_concurrency: self.url_concurrency,
            events: self.events.clone(),
        }
    }
}

impl<S, F, U> Orchestrator<S, F, U>
where
    S: AttestationSource,
    F: ContentFetcher,
    U: ContentUploader,
{
    pub fn new(source: Arc<S>, fetcher: Arc<F>, uploader: Arc<U>, store: ArchiveStore) -> Self {
        Self {
            source,
            fetcher,
            uploader,
            store,
            identifier_concurrency: DEFAULT_IDENTIFIER_CONCURRENCY,
            url_concurrency: DEFAULT_URL_CONCURRENCY,
            events: None,
        }
    }

    #[must_use]
    pub fn with_identifier_concurrency(mut self, identifier_concurrency: usize) -> Self {
        self.identifier_concurrency = identifier_concurrency.max(1);
        self
    }

    /// Size of the groups an identifier's URLs are archived in.
    #[must_use]
    pub fn with_url_concurrency(mut self, url_concurrency: usize) -> Self {
        self.url_concurrency = url_concurrency.max(1);
        self
    }

    /// Publish lifecycle events on `events`. A closed receiver is ignored.
    #[must_use]
    pub fn with_events(mut self, events: mpsc::Sender<PipelineEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn store(&self) -> &ArchiveStore {
        &self.store
    }

    /// Retry scheduler sharing this pipeline's fetcher, uploader and store.
    pub fn retry_scheduler(&self) -> RetryScheduler<F, U> {
        RetryScheduler::new(
            Arc::clone(&self.fetcher),
            Arc::clone(&self.uploader),
            self.store.clone(),
        )
    }

    async fn emit(&self, event: PipelineEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event).await;
        }
    }

    /// Archive every URL cited by the attestations of `raw_id`.
    ///
    /// Per-attestation and per-URL failures are collected into the outcome.
    /// Once the identifier is stored it is always marked processed, even
    /// when its attestations cannot be fetched.
    ///
    /// # Errors
    /// Returns `INVALID_IDENTIFIER` for malformed input, or the underlying
    /// error when the identifier cannot be stored or its attestations cannot
    /// be fetched.
    pub async fn process_identifier(
        &self,
        raw_id: &str,
    ) -> Result<IdentifierOutcome, ArchiveError> {
        let started = Instant::now();
        let id = EcocertId::parse(raw_id)?;
        let identifier = id.full_id.clone();

        tracing::info!(identifier = %identifier, "processing identifier");
        self.emit(PipelineEvent::IdentifierStarted {
            identifier: identifier.clone(),
        })
        .await;

        self.store
            .upsert_identifier(NewIdentifier::new(id.clone()))
            .await?;
        let attestations = match self.source.attestations_for(&id).await {
            Ok(attestations) => attestations,
            Err(err) => {
                let marked = self
                    .store
                    .mark_identifier_processed(identifier.clone())
                    .await;
                if let Err(mark_err) = marked {
                    tracing::warn!(
                        identifier = %identifier,
                        code = mark_err.code(),
                        error = %mark_err,
                        "could not mark identifier processed"
                    );
                }
                return Err(err);
            }
        };

        let mut outcome = IdentifierOutcome::empty(identifier.clone());
        outcome.attestations_found = attestations.len();

        if attestations.is_empty() {
            outcome.note = Some("no attestations found".to_string());
            return self.finish(outcome, started).await;
        }

        let mut mined: Vec<(String, AttestationPayload)> = Vec::with_capacity(attestations.len());
        for attestation in &attestations {
            let saved = match AttestationPayload::from_value(&attestation.payload) {
                Ok(payload) => self
                    .store
                    .insert_attestation(NewAttestation::from_source(&id, attestation, &payload))
                    .await
                    .map(|_| payload)
                    .map_err(ArchiveError::from),
                Err(err) => Err(err),
            };
            match saved {
                Ok(payload) => {
                    outcome.attestations_saved += 1;
                    mined.push((attestation.uid.clone(), payload));
                }
                Err(err) => {
                    tracing::warn!(
                        identifier = %identifier,
                        attestation = %attestation.uid,
                        code = %err.code,
                        error = %err,
                        "skipping attestation"
                    );
                    outcome.errors.push(ProcessingError {
                        url: None,
                        attestation_uid: Some(attestation.uid.clone()),
                        error: err,
                    });
                }
            }
        }

        let mut seen = HashSet::new();
        let targets: Vec<(String, String)> = mined
            .iter()
            .flat_map(|(uid, payload)| {
                extract_urls([payload])
                    .into_iter()
                    .map(move |url| (uid.clone(), url))
            })
            .filter(|(_, url)| seen.insert(url.clone()))
            .collect();
        outcome.urls_extracted = targets.len();

        if targets.is_empty() {
            outcome.note = Some("no archivable URLs found".to_string());
            return self.finish(outcome, started).await;
        }

        for group in targets.chunks(self.url_concurrency) {
            let archived = join_all(group.iter().map(|(attestation_uid, url)| {
                self.archive_url(&identifier, attestation_uid, url)
            }))
            .await;
            for result in archived {
                match result {
                    Ok(()) => outcome.urls_archived += 1,
                    Err(failure) => outcome.errors.push(failure),
                }
            }
        }

        self.finish(outcome, started).await
    }

    async fn archive_url(
        &self,
        identifier: &str,
        attestation_uid: &str,
        url: &str,
    ) -> Result<(), ProcessingError> {
        let record = NewArchiveRecord {
            identifier_id: identifier.to_string(),
            attestation_uid: attestation_uid.to_string(),
            original_url: url.to_string(),
        };
        let record_id = match self.store.create_archive_record(record).await {
            Ok(record_id) => record_id,
            Err(err) => {
                return Err(self
                    .url_failed(identifier, attestation_uid, url, None, err.into())
                    .await);
            }
        };

        let attempt = Attempt {
            record_id,
            identifier_id: identifier,
            attestation_uid,
            url,
        };
        let result = attempt::run(
            self.fetcher.as_ref(),
            self.uploader.as_ref(),
            &self.store,
            attempt,
        )
        .await;
        match result {
            Ok(completed) => {
                tracing::info!(
                    identifier,
                    url,
                    record_id,
                    content_identifier = %completed.content_identifier,
                    "archived url"
                );
                self.emit(PipelineEvent::UrlArchived {
                    identifier: identifier.to_string(),
                    url: url.to_string(),
                    record_id,
                    content_identifier: completed.content_identifier,
                })
                .await;
                Ok(())
            }
            Err(err) => Err(self
                .url_failed(identifier, attestation_uid, url, Some(record_id), err)
                .await),
        }
    }

    async fn url_failed(
        &self,
        identifier: &str,
        attestation_uid: &str,
        url: &str,
        record_id: Option<i64>,
        error: ArchiveError,
    ) -> ProcessingError {
        tracing::warn!(
            identifier,
            url,
            record_id,
            code = %error.code,
            error = %error,
            "failed to archive url"
        );
        self.emit(PipelineEvent::UrlFailed {
            identifier: identifier.to_string(),
            url: url.to_string(),
            record_id,
            code: error.code.clone(),
            message: error.to_string(),
        })
        .await;
        ProcessingError {
            url: Some(url.to_string()),
            attestation_uid: Some(attestation_uid.to_string()),
            error,
        }
    }

    async fn finish(
        &self,
        mut outcome: IdentifierOutcome,
        started: Instant,
    ) -> Result<IdentifierOutcome, ArchiveError> {
        let marked = self
            .store
            .mark_identifier_processed(outcome.identifier.clone())
            .await;
        if let Err(err) = marked {
            tracing::error!(
                identifier = %outcome.identifier,
                code = err.code(),
                error = %err,
                "could not mark identifier processed"
            );
            outcome.errors.push(ProcessingError {
                url: None,
                attestation_uid: None,
                error: err.into(),
            });
        }

        outcome.status = IdentifierOutcome::classify(outcome.errors.len(), outcome.urls_archived);
        outcome.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        tracing::info!(
            identifier = %outcome.identifier,
            status = ?outcome.status,
            urls_extracted = outcome.urls_extracted,
            urls_archived = outcome.urls_archived,
            errors = outcome.errors.len(),
            duration_ms = outcome.duration_ms,
            "finished identifier"
        );
        self.emit(PipelineEvent::IdentifierFinished {
            identifier: outcome.identifier.clone(),
            status: outcome.status,
            urls_archived: outcome.urls_archived,
            errors: outcome.errors.len(),
        })
        .await;
        Ok(outcome)
    }

    async fn process_slot(&self, raw_id: &str) -> IdentifierOutcome {
        match self.process_identifier(raw_id).await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(
                    identifier = raw_id,
                    code = %err.code,
                    error = %err,
                    "identifier failed"
                );
                self.emit(PipelineEvent::IdentifierFinished {
                    identifier: raw_id.to_string(),
                    status: ProcessingStatus::Failed,
                    urls_archived: 0,
                    errors: 1,
                })
                .await;
                IdentifierOutcome::rejected(raw_id, err)
            }
        }
    }

    /// Process `ids` in sequential chunks, concurrently within a chunk.
    ///
    /// Outcomes are returned in input order; an identifier that fails
    /// outright becomes a `failed` outcome in its slot.
    pub async fn process_batch(&self, ids: &[String]) -> Vec<IdentifierOutcome> {
        let mut outcomes = Vec::with_capacity(ids.len());
        for (chunk, group) in ids.chunks(self.identifier_concurrency.max(1)).enumerate() {
            let results = join_all(group.iter().map(|id| self.process_slot(id))).await;
            outcomes.extend(results);

            tracing::debug!(chunk, identifiers = group.len(), "finished chunk");
            self.emit(PipelineEvent::ChunkFinished {
                chunk,
                identifiers: group.len(),
            })
            .await;
        }
        outcomes
    }

    /// Process every identifier the source knows about.
    ///
    /// # Errors
    /// Returns an error when the source cannot list its identifiers.
    pub async fn process_all(&self) -> Result<Vec<IdentifierOutcome>, ArchiveError> {
        let ids = self.source.known_identifiers().await?;
        tracing::info!(count = ids.len(), "processing all known identifiers");
        Ok(self.process_batch(&ids).await)
    }
}
