use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    Unchanged,
}

/// Writes generated documents under the mirror root.
///
/// When a limit is configured every write holds a permit for the duration of
/// the file I/O only, so rendering never waits on the limiter.
#[derive(Debug, Clone)]
pub struct MirrorWriter {
    root: PathBuf,
    limiter: Option<Arc<Semaphore>>,
}

impl MirrorWriter {
    pub fn new(root: impl Into<PathBuf>, write_concurrency: Option<usize>) -> Self {
        Self {
            root: root.into(),
            limiter: write_concurrency.map(|permits| Arc::new(Semaphore::new(permits.max(1)))),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn absolute(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    /// Writes through a sibling temp file and a rename. Content whose digest
    /// matches the file on disk is left alone.
    pub async fn write(&self, path: &Path, document: &str) -> Result<WriteOutcome> {
        self.write_bytes(path, document.as_bytes()).await
    }

    /// Same as [`MirrorWriter::write`] for content that is not text, such as copied assets.
    pub async fn write_bytes(&self, path: &Path, document: &[u8]) -> Result<WriteOutcome> {
        let target = self.absolute(path);
        let _permit = match &self.limiter {
            Some(limiter) => Some(limiter.acquire().await.context("write limiter closed")?),
            None => None,
        };

        if let Ok(existing) = tokio::fs::read(&target).await
            && compute_digest(&existing) == compute_digest(document)
        {
            debug!(path = %target.display(), "unchanged");
            return Ok(WriteOutcome::Unchanged);
        }

        let parent = target
            .parent()
            .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", target.display()))?;
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;

        let file_name = target
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        let staging = parent.join(format!(".{file_name}.tmp"));
        tokio::fs::write(&staging, document)
            .await
            .with_context(|| format!("failed to write {}", staging.display()))?;
        tokio::fs::rename(&staging, &target)
            .await
            .with_context(|| format!("failed to move {} into place", target.display()))?;
        debug!(path = %target.display(), bytes = document.len(), "written");
        Ok(WriteOutcome::Written)
    }

    pub async fn read(&self, path: &Path) -> Result<String> {
        let target = self.absolute(path);
        tokio::fs::read_to_string(&target)
            .await
            .with_context(|| format!("failed to read {}", target.display()))
    }

    /// Returns whether a file was actually removed.
    pub async fn remove(&self, path: &Path) -> Result<bool> {
        let target = self.absolute(path);
        let _permit = match &self.limiter {
            Some(limiter) => Some(limiter.acquire().await.context("write limiter closed")?),
            None => None,
        };
        match tokio::fs::remove_file(&target).await {
            Ok(()) => {
                debug!(path = %target.display(), "removed");
                Ok(true)
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(error) => {
                Err(error).with_context(|| format!("failed to remove {}", target.display()))
            }
        }
    }
}

pub fn compute_digest(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    let digest = hasher.finalize();
    format!("{digest:x}")
}
