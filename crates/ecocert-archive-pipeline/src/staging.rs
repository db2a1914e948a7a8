//! On-disk staging area for in-flight downloads.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::task::JoinHandle;
use ulid::Ulid;

/// Staged files older than this are treated as crash leftovers
pub const STALE_AFTER: Duration = Duration::from_secs(60 * 60);

const STAGED_SUFFIX: &str = "part";

#[derive(Debug, Clone)]
pub struct StagingArea {
    dir: PathBuf,
}

impl StagingArea {
    /// Create the staging directory if needed.
    ///
    /// # Errors
    /// Returns an error when the directory cannot be created.
    pub async fn create(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Reserve a fresh, uniquely named file path. The file is removed when
    /// the returned guard drops unless [`StagedFile::remove`] ran first.
    #[must_use]
    pub fn reserve(&self) -> StagedFile {
        StagedFile {
            path: self.dir.join(format!("{}.{STAGED_SUFFIX}", Ulid::new())),
            removed: false,
        }
    }

    /// Delete staged files whose modification time is older than `max_age`.
    ///
    /// # Errors
    /// Returns an error when the directory cannot be listed.
    pub async fn sweep_stale(&self, max_age: Duration) -> io::Result<usize> {
        let now = SystemTime::now();
        let mut removed = 0;
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(STAGED_SUFFIX) {
                continue;
            }
            let Ok(modified) = entry.metadata().await.and_then(|meta| meta.modified()) else {
                continue;
            };
            let age = now.duration_since(modified).unwrap_or_default();
            if age > max_age {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => removed += 1,
                    Err(err) => tracing::warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to remove stale staged file"
                    ),
                }
            }
        }

        if removed > 0 {
            tracing::info!(removed, dir = %self.dir.display(), "swept stale staged files");
        }
        Ok(removed)
    }

    /// Run [`Self::sweep_stale`] every `interval` until the task is aborted.
    #[must_use]
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let staging = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(err) = staging.sweep_stale(STALE_AFTER).await {
                    tracing::warn!(error = %err, "staging sweep failed");
                }
            }
        })
    }

    /// Remove the staging directory and everything in it.
    ///
    /// # Errors
    /// Returns an error when the directory exists but cannot be removed.
    pub async fn teardown(&self) -> io::Result<()> {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }
}

/// Path of one staged download
#[derive(Debug)]
pub struct StagedFile {
    path: PathBuf,
    removed: bool,
}

impl StagedFile {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the file now.
    pub async fn remove(mut self) {
        self.removed = true;
        if let Err(err) = tokio::fs::remove_file(&self.path).await {
            if err.kind() != io::ErrorKind::NotFound {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %err,
                    "failed to remove staged file"
                );
            }
        }
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if !self.removed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}
