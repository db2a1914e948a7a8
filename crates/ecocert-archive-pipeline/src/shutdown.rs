//! Graceful shutdown around a unit of pipeline work.

use std::future::Future;
use std::time::Duration;

use ecocert_archive_store_sqlite::ArchiveStore;

use crate::staging::StagingArea;

/// How long in-flight work may keep running after a shutdown signal
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30);

#[derive(Debug, PartialEq, Eq)]
pub enum ShutdownOutcome<T> {
    /// The work finished before any signal arrived
    Completed(T),
    /// A signal arrived and the work finished within the grace period
    Drained(T),
    /// The grace period ran out; the work was dropped
    Abandoned,
}

impl<T> ShutdownOutcome<T> {
    pub fn into_inner(self) -> Option<T> {
        match self {
            Self::Completed(value) | Self::Drained(value) => Some(value),
            Self::Abandoned => None,
        }
    }
}

/// Resources released once the work is done or abandoned
pub struct GracefulShutdown {
    staging: StagingArea,
    store: ArchiveStore,
    grace: Duration,
}

impl GracefulShutdown {
    pub fn new(staging: StagingArea, store: ArchiveStore) -> Self {
        Self {
            staging,
            store,
            grace: DEFAULT_GRACE_PERIOD,
        }
    }

    #[must_use]
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Drive `work` until it completes or `signal` fires, then tear down the
    /// staging area and close the store no matter how the work ended.
    pub async fn run<W, S, T>(self, work: W, signal: S) -> ShutdownOutcome<T>
    where
        W: Future<Output = T>,
        S: Future<Output = ()>,
    {
        tokio::pin!(work);

        let outcome = tokio::select! {
            value = &mut work => ShutdownOutcome::Completed(value),
            () = signal => {
                tracing::info!(
                    grace_secs = self.grace.as_secs(),
                    "shutdown requested, waiting for in-flight work"
                );
                match tokio::time::timeout(self.grace, &mut work).await {
                    Ok(value) => ShutdownOutcome::Drained(value),
                    Err(_) => {
                        tracing::warn!(
                            grace_secs = self.grace.as_secs(),
                            "grace period elapsed with work still outstanding"
                        );
                        ShutdownOutcome::Abandoned
                    }
                }
            }
        };

        if let Err(err) = self.staging.teardown().await {
            tracing::warn!(
                dir = %self.staging.path().display(),
                error = %err,
                "failed to remove staging area"
            );
        }
        self.store.close().await;
        outcome
    }
}
