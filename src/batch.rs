use std::num::NonZeroUsize;

use blob_lease_utils::ConcurrencyLimiter;
use blob_store::DirectoryEntry;
use tracing::info;

use crate::{
    client::{Blob, BlobClient},
    error::{Error, Result},
};

pub const DEFAULT_MAX_KEYS: usize = 5;
pub const DEFAULT_CONCURRENCY: usize = 5;

const INBOX_SEGMENT: &str = "inbox";
const ARCHIVE_SEGMENT: &str = "archive";

fn limiter(concurrency: usize) -> Result<ConcurrencyLimiter> {
    NonZeroUsize::new(concurrency)
        .map(ConcurrencyLimiter::new)
        .ok_or_else(|| Error::InvalidArgument("concurrency must be greater than zero".to_string()))
}

/// Multi-object operations fanned out over a [`BlobClient`].
///
/// All fan-out goes through [`ConcurrencyLimiter`], so a failing item stops
/// new items from starting but lets the ones already running finish. The
/// first failure is returned and there is no per-item report of which other
/// items completed.
#[derive(Debug, Clone)]
pub struct BatchOperations {
    client: BlobClient,
}

impl BatchOperations {
    pub fn new(client: BlobClient) -> Self {
        Self { client }
    }

    /// Lists at most `max_keys` entries. Not paginated.
    pub async fn list_prefix(&self, prefix: &str, max_keys: usize) -> Result<Vec<DirectoryEntry>> {
        self.client
            .store()
            .list(prefix, max_keys)
            .await
            .map_err(|e| Error::from_store(prefix, e))
    }

    /// Reads every object the listing of `prefix` returns, in listing order.
    pub async fn read_prefix(
        &self,
        prefix: &str,
        max_keys: usize,
        concurrency: usize,
    ) -> Result<Vec<Blob>> {
        let limiter = limiter(concurrency)?;
        let entries = self.list_prefix(prefix, max_keys).await?;
        info!(prefix, count = entries.len(), "found files with prefix");
        let client = &self.client;
        limiter
            .run(entries, |entry| async move { client.read(&entry.path).await })
            .await
    }

    pub async fn delete_many<S: AsRef<str>>(
        &self,
        paths: &[S],
        concurrency: usize,
    ) -> Result<usize> {
        let limiter = limiter(concurrency)?;
        info!(count = paths.len(), "delete files");
        let client = &self.client;
        limiter
            .run(paths, |path| async move { client.delete(path.as_ref()).await })
            .await
            .map(|done| done.len())
    }

    /// Moves an object from an `inbox` path to the matching `archive` path
    /// and returns the new path.
    ///
    /// The copy completes before the original is deleted, so a failure part
    /// way leaves the original in place and the call can be retried.
    pub async fn archive_one(&self, path: &str) -> Result<String> {
        if path.is_empty() {
            return Err(Error::InvalidArgument("path missing".to_string()));
        }
        let Some(new_path) = archive_path(path) else {
            return Err(Error::PolicyViolation(format!(
                "can only archive files from the inbox ({path})"
            )));
        };
        info!(path, new_path = %new_path, "archive file");
        self.client.copy(path, &new_path).await?;
        self.client.delete(path).await?;
        Ok(new_path)
    }

    pub async fn archive_many<S: AsRef<str>>(
        &self,
        paths: &[S],
        concurrency: usize,
    ) -> Result<Vec<String>> {
        let limiter = limiter(concurrency)?;
        info!(count = paths.len(), "archive files");
        limiter
            .run(paths, |path| async move { self.archive_one(path.as_ref()).await })
            .await
    }
}

/// Replaces the first `inbox` in `path` with `archive`.
pub fn archive_path(path: &str) -> Option<String> {
    path.contains(INBOX_SEGMENT)
        .then(|| path.replacen(INBOX_SEGMENT, ARCHIVE_SEGMENT, 1))
}
