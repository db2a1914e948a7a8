//! Async handle over a [`SqliteStore`] owned by a dedicated thread.
//!
//! `rusqlite::Connection` is not `Sync`, so the store never leaves its thread.
//! Callers submit closures over a channel and await the reply on a oneshot,
//! which keeps database work off the async workers without holding a lock
//! across await points.

use std::path::Path;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use ecocert_archive_core::{
    ArchiveRecord, ArchiveStatistics, ArchiveStatus, AttestationRecord, CompletedArchive,
    IdentifierRecord, IdentifierSummary, NewArchiveRecord, NewAttestation, NewIdentifier,
};
use time::OffsetDateTime;
use tokio::sync::oneshot;

use crate::{SchemaStatus, SqliteStore, StoreError, StoreHealth};

type StoreJob = Box<dyn FnOnce(&mut SqliteStore) + Send + 'static>;

enum StoreMessage {
    Run(StoreJob),
    Shutdown,
}

struct StoreWorker {
    sender: mpsc::Sender<StoreMessage>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

/// Cloneable handle to the record store
#[derive(Clone)]
pub struct ArchiveStore {
    worker: Arc<StoreWorker>,
}

impl ArchiveStore {
    /// Move `store` onto its own thread.
    ///
    /// # Errors
    /// Returns an error when the thread cannot be spawned.
    pub fn spawn(mut store: SqliteStore) -> Result<Self, StoreError> {
        let (sender, receiver) = mpsc::channel::<StoreMessage>();

        let handle = thread::Builder::new()
            .name("archive-store".into())
            .spawn(move || {
                while let Ok(message) = receiver.recv() {
                    match message {
                        StoreMessage::Run(job) => job(&mut store),
                        StoreMessage::Shutdown => break,
                    }
                }
                tracing::debug!("archive store executor stopped");
            })?;

        Ok(Self {
            worker: Arc::new(StoreWorker {
                sender,
                handle: Mutex::new(Some(handle)),
            }),
        })
    }

    /// Open the database at `path`, apply migrations and spawn the executor.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or migrated.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let mut store = SqliteStore::open(path)?;
        store.migrate()?;
        Self::spawn(store)
    }

    /// In-memory store with the schema applied.
    ///
    /// # Errors
    /// Returns an error when SQLite cannot allocate or migrate the database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let mut store = SqliteStore::open_in_memory()?;
        store.migrate()?;
        Self::spawn(store)
    }

    /// Run `op` on the store thread and return its result.
    ///
    /// # Errors
    /// Returns `STORE_CLOSED` once the executor has shut down, or whatever
    /// `op` returns.
    pub async fn with_store<F, T>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut SqliteStore) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let (reply, response) = oneshot::channel();
        let job: StoreJob = Box::new(move |store| {
            let _ = reply.send(op(store));
        });
        self.worker
            .sender
            .send(StoreMessage::Run(job))
            .map_err(|_| StoreError::Closed)?;
        response.await.map_err(|_| StoreError::Closed)?
    }

    /// Stop the executor after already queued work drains and wait for the
    /// thread to exit. Later calls on any clone fail with `STORE_CLOSED`.
    pub async fn close(&self) {
        let _ = self.worker.sender.send(StoreMessage::Shutdown);
        let handle = self
            .worker
            .handle
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        if let Some(handle) = handle {
            if tokio::task::spawn_blocking(move || handle.join()).await.is_err() {
                tracing::warn!("archive store executor did not stop cleanly");
            }
        }
    }

    pub async fn schema_status(&self) -> Result<SchemaStatus, StoreError> {
        self.with_store(|store| store.schema_status()).await
    }

    pub async fn migrate(&self) -> Result<SchemaStatus, StoreError> {
        self.with_store(SqliteStore::migrate).await
    }

    pub async fn reset(&self) -> Result<SchemaStatus, StoreError> {
        self.with_store(SqliteStore::reset).await
    }

    pub async fn health_check(&self) -> Result<StoreHealth, StoreError> {
        self.with_store(|store| store.health_check()).await
    }

    pub async fn upsert_identifier(&self, identifier: NewIdentifier) -> Result<bool, StoreError> {
        self.with_store(move |store| {
            store.upsert_identifier(&identifier, OffsetDateTime::now_utc())
        })
        .await
    }

    pub async fn get_identifier(
        &self,
        full_id: impl Into<String>,
    ) -> Result<Option<IdentifierRecord>, StoreError> {
        let full_id = full_id.into();
        self.with_store(move |store| store.get_identifier(&full_id))
            .await
    }

    pub async fn insert_attestation(
        &self,
        attestation: NewAttestation,
    ) -> Result<bool, StoreError> {
        self.with_store(move |store| {
            store.insert_attestation(&attestation, OffsetDateTime::now_utc())
        })
        .await
    }

    pub async fn list_attestations(
        &self,
        identifier_id: impl Into<String>,
    ) -> Result<Vec<AttestationRecord>, StoreError> {
        let identifier_id = identifier_id.into();
        self.with_store(move |store| store.list_attestations(&identifier_id))
            .await
    }

    pub async fn create_archive_record(&self, record: NewArchiveRecord) -> Result<i64, StoreError> {
        self.with_store(move |store| {
            store.create_archive_record(&record, OffsetDateTime::now_utc())
        })
        .await
    }

    pub async fn transition_status(
        &self,
        id: i64,
        status: ArchiveStatus,
        error_message: Option<String>,
    ) -> Result<(), StoreError> {
        self.with_store(move |store| {
            store.transition_status(
                id,
                status,
                error_message.as_deref(),
                OffsetDateTime::now_utc(),
            )
        })
        .await
    }

    pub async fn complete_archive_record(
        &self,
        id: i64,
        archive: CompletedArchive,
    ) -> Result<(), StoreError> {
        self.with_store(move |store| store.complete_archive_record(id, &archive))
            .await
    }

    pub async fn mark_identifier_processed(
        &self,
        full_id: impl Into<String>,
    ) -> Result<(), StoreError> {
        let full_id = full_id.into();
        self.with_store(move |store| {
            store.mark_identifier_processed(&full_id, OffsetDateTime::now_utc())
        })
        .await
    }

    pub async fn query_retry_eligible(
        &self,
        limit: usize,
    ) -> Result<Vec<ArchiveRecord>, StoreError> {
        self.with_store(move |store| {
            store.query_retry_eligible(limit, OffsetDateTime::now_utc())
        })
        .await
    }

    pub async fn get_archive_record(&self, id: i64) -> Result<Option<ArchiveRecord>, StoreError> {
        self.with_store(move |store| store.get_archive_record(id))
            .await
    }

    pub async fn list_archive_records(
        &self,
        identifier_id: impl Into<String>,
    ) -> Result<Vec<ArchiveRecord>, StoreError> {
        let identifier_id = identifier_id.into();
        self.with_store(move |store| store.list_archive_records(&identifier_id))
            .await
    }

    pub async fn list_identifier_summaries(&self) -> Result<Vec<IdentifierSummary>, StoreError> {
        self.with_store(|store| store.list_identifier_summaries())
            .await
    }

    pub async fn delete_identifier(&self, full_id: impl Into<String>) -> Result<bool, StoreError> {
        let full_id = full_id.into();
        self.with_store(move |store| store.delete_identifier(&full_id))
            .await
    }

    pub async fn compute_statistics(&self) -> Result<ArchiveStatistics, StoreError> {
        self.with_store(|store| store.compute_statistics()).await
    }
}
