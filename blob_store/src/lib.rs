use std::{fmt, sync::Arc};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use object_store::{
    aws::{AmazonS3, AmazonS3Builder},
    local::LocalFileSystem,
    memory::InMemory,
    path::Path,
    Attribute,
    AttributeValue,
    Attributes,
    ObjectStore,
    PutMode,
    PutOptions,
    PutPayload,
    UpdateVersion,
};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub mod codec;

pub use codec::{Codec, GzipCodec, GZIP_ENCODING};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    #[serde(default)]
    pub region: Option<String>,
    // For supporting localstack/minio
    #[serde(default)]
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskStorageConfig {
    pub path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlobStorageConfig {
    #[serde(default)]
    pub s3: Option<S3Config>,
    #[serde(default)]
    pub disk: Option<DiskStorageConfig>,
}

/// Classified failures of the backing object store.
///
/// Callers branch on these variants; the backend's error text is never
/// inspected to decide what happened.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error("object not found: {path}")]
    NotFound { path: String },

    #[error("object already exists: {path}")]
    AlreadyExists { path: String },

    #[error("precondition failed for {path}")]
    Precondition { path: String },

    #[error("operation not supported by the object store: {source}")]
    NotImplemented { source: object_store::Error },

    #[error(transparent)]
    Backend {
        #[from]
        source: object_store::Error,
    },
}

impl StoreError {
    fn classify(path: &str, err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { .. } => Self::NotFound {
                path: path.to_string(),
            },
            object_store::Error::AlreadyExists { .. } => Self::AlreadyExists {
                path: path.to_string(),
            },
            object_store::Error::Precondition { .. } => Self::Precondition {
                path: path.to_string(),
            },
            err @ object_store::Error::NotImplemented { .. } => {
                Self::NotImplemented { source: err }
            }
            err => Self::Backend { source: err },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// A conditional write lost against a concurrent writer.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. } | Self::Precondition { .. })
    }
}

/// Identifies one revision of an object, as reported by the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectVersion {
    pub e_tag: Option<String>,
    pub version: Option<String>,
}

impl ObjectVersion {
    pub fn is_known(&self) -> bool {
        self.e_tag.is_some() || self.version.is_some()
    }
}

#[derive(Debug, Clone)]
pub enum WriteMode {
    Overwrite,
    /// Fail with [`StoreError::AlreadyExists`] if the key is present.
    Create,
    /// Fail with [`StoreError::Precondition`] unless the stored object is
    /// still at the given version.
    Update(ObjectVersion),
}

impl From<WriteMode> for PutMode {
    fn from(mode: WriteMode) -> Self {
        match mode {
            WriteMode::Overwrite => PutMode::Overwrite,
            WriteMode::Create => PutMode::Create,
            WriteMode::Update(v) => PutMode::Update(UpdateVersion {
                e_tag: v.e_tag,
                version: v.version,
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub body: Bytes,
    pub content_encoding: Option<String>,
    pub version: ObjectVersion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub path: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// Raw access to an object store, with no knowledge of compression.
#[async_trait]
pub trait ObjectStoreAdapter: Send + Sync {
    async fn get(&self, key: &str) -> Result<StoredObject, StoreError>;

    async fn put(
        &self,
        key: &str,
        body: Bytes,
        content_encoding: Option<&str>,
        mode: WriteMode,
    ) -> Result<(), StoreError>;

    /// Deleting a key that does not exist succeeds.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    async fn copy(&self, from: &str, to: &str) -> Result<(), StoreError>;

    /// Returns at most `max_keys` entries whose key starts with `prefix`,
    /// matched as a plain string so `inbox/2024-` selects `inbox/2024-01.json`.
    /// There is no continuation; callers that need more must narrow the
    /// prefix. Returned paths can be passed back to the other operations.
    async fn list(&self, prefix: &str, max_keys: usize) -> Result<Vec<DirectoryEntry>, StoreError>;

    /// Whether `put` can persist a content encoding tag.
    fn supports_content_encoding(&self) -> bool {
        true
    }
}

#[derive(Clone)]
pub struct BlobStorage {
    object_store: Arc<dyn ObjectStore>,
    supports_attributes: bool,
}

impl fmt::Debug for BlobStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobStorage")
            .field("object_store", &self.object_store.to_string())
            .field("supports_attributes", &self.supports_attributes)
            .finish()
    }
}

fn s3_storage(s3: &S3Config) -> Result<AmazonS3> {
    let mut builder = AmazonS3Builder::from_env().with_bucket_name(s3.bucket.clone());
    if let Some(region) = &s3.region {
        builder = builder.with_region(region.clone());
    }
    if let Some(endpoint) = &s3.endpoint {
        builder = builder
            .with_endpoint(endpoint.clone())
            .with_allow_http(endpoint.starts_with("http://"));
    }
    builder.build().context("unable to build S3 builder")
}

fn file_storage(disk: &DiskStorageConfig) -> Result<LocalFileSystem> {
    std::fs::create_dir_all(&disk.path)
        .with_context(|| format!("unable to create blob directory {}", disk.path))?;
    let s = LocalFileSystem::new_with_prefix(&disk.path)?;
    Ok(s)
}

impl BlobStorage {
    pub fn new(config: &BlobStorageConfig) -> Result<Self> {
        if let Some(s3) = config.s3.as_ref() {
            info!(bucket = %s3.bucket, "using s3 blob storage");
            return Ok(Self {
                object_store: Arc::new(s3_storage(s3)?),
                supports_attributes: true,
            });
        }
        // If it's not S3, assume it's a file
        let disk = config.disk.clone().unwrap_or_else(|| DiskStorageConfig {
            path: "blobs".to_string(),
        });
        info!(path = %disk.path, "using disk blob storage");
        Ok(Self {
            object_store: Arc::new(file_storage(&disk)?),
            // The local filesystem has nowhere to keep object attributes.
            supports_attributes: false,
        })
    }

    pub fn in_memory() -> Self {
        Self {
            object_store: Arc::new(InMemory::new()),
            supports_attributes: true,
        }
    }
}

/// Inverse of `Path::from(&str)`, which percent-encodes characters such as
/// `#` and `%` in each segment.
fn decode_key(location: &Path) -> String {
    location
        .parts()
        .map(|part| percent_decode_str(part.as_ref()).decode_utf8_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[async_trait]
impl ObjectStoreAdapter for BlobStorage {
    async fn get(&self, key: &str) -> Result<StoredObject, StoreError> {
        let result = self
            .object_store
            .get(&Path::from(key))
            .await
            .map_err(|e| StoreError::classify(key, e))?;
        let content_encoding = result
            .attributes
            .get(&Attribute::ContentEncoding)
            .map(|v| v.to_string());
        let version = ObjectVersion {
            e_tag: result.meta.e_tag.clone(),
            version: result.meta.version.clone(),
        };
        let body = result
            .bytes()
            .await
            .map_err(|e| StoreError::classify(key, e))?;
        debug!(key, size = body.len(), ?content_encoding, "read object");
        Ok(StoredObject {
            body,
            content_encoding,
            version,
        })
    }

    async fn put(
        &self,
        key: &str,
        body: Bytes,
        content_encoding: Option<&str>,
        mode: WriteMode,
    ) -> Result<(), StoreError> {
        let mut attributes = Attributes::new();
        if let Some(encoding) = content_encoding {
            attributes.insert(
                Attribute::ContentEncoding,
                AttributeValue::from(encoding.to_string()),
            );
        }
        let opts = PutOptions {
            mode: mode.into(),
            attributes,
            ..Default::default()
        };
        let size = body.len();
        self.object_store
            .put_opts(&Path::from(key), PutPayload::from(body), opts)
            .await
            .map_err(|e| StoreError::classify(key, e))?;
        debug!(key, size, ?content_encoding, "wrote object");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        match self.object_store.delete(&Path::from(key)).await {
            Ok(()) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => {
                debug!(key, "delete of missing object");
                Ok(())
            }
            Err(e) => Err(StoreError::classify(key, e)),
        }
    }

    async fn copy(&self, from: &str, to: &str) -> Result<(), StoreError> {
        self.object_store
            .copy(&Path::from(from), &Path::from(to))
            .await
            .map_err(|e| StoreError::classify(from, e))
    }

    async fn list(&self, prefix: &str, max_keys: usize) -> Result<Vec<DirectoryEntry>, StoreError> {
        // object_store only matches whole segments, so list from the last
        // complete segment and filter on the raw key
        let dir = prefix.rsplit_once('/').map_or("", |(dir, _)| dir);
        let dir_path = (!dir.is_empty()).then(|| Path::from(dir));
        let mut listing = self.object_store.list(dir_path.as_ref());
        let mut entries = Vec::new();
        while entries.len() < max_keys {
            let Some(meta) = listing.next().await else {
                break;
            };
            let meta = meta.map_err(|e| StoreError::classify(prefix, e))?;
            let key = decode_key(&meta.location);
            if !key.starts_with(prefix) {
                continue;
            }
            entries.push(DirectoryEntry {
                path: key,
                size: meta.size as u64,
                last_modified: meta.last_modified,
            });
        }
        Ok(entries)
    }

    fn supports_content_encoding(&self) -> bool {
        self.supports_attributes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_keeps_content_encoding() {
        let store = BlobStorage::in_memory();
        store
            .put(
                "a/b.txt",
                Bytes::from_static(b"hello"),
                Some(GZIP_ENCODING),
                WriteMode::Overwrite,
            )
            .await
            .unwrap();
        let object = store.get("a/b.txt").await.unwrap();
        assert_eq!(object.body, Bytes::from_static(b"hello"));
        assert_eq!(object.content_encoding.as_deref(), Some(GZIP_ENCODING));
        assert!(object.version.is_known());

        store
            .put("plain", Bytes::from_static(b"x"), None, WriteMode::Overwrite)
            .await
            .unwrap();
        assert_eq!(store.get("plain").await.unwrap().content_encoding, None);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store = BlobStorage::in_memory();
        let err = store.get("nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_delete_missing_twice() {
        let store = BlobStorage::in_memory();
        store.delete("missing").await.unwrap();
        store.delete("missing").await.unwrap();
    }

    #[tokio::test]
    async fn test_copy() {
        let store = BlobStorage::in_memory();
        let err = store.copy("inbox/x", "archive/x").await.unwrap_err();
        assert!(err.is_not_found());

        store
            .put(
                "inbox/x",
                Bytes::from_static(b"zz"),
                Some(GZIP_ENCODING),
                WriteMode::Overwrite,
            )
            .await
            .unwrap();
        store.copy("inbox/x", "archive/x").await.unwrap();
        let copied = store.get("archive/x").await.unwrap();
        assert_eq!(copied.body, Bytes::from_static(b"zz"));
        assert_eq!(copied.content_encoding.as_deref(), Some(GZIP_ENCODING));
        assert!(store.get("inbox/x").await.is_ok());
    }

    #[tokio::test]
    async fn test_list_is_capped() {
        let store = BlobStorage::in_memory();
        for i in 0..8 {
            store
                .put(
                    &format!("inbox/{i}.json"),
                    Bytes::from(vec![b'x'; i + 1]),
                    None,
                    WriteMode::Overwrite,
                )
                .await
                .unwrap();
        }
        store
            .put("other/1.json", Bytes::from_static(b"1"), None, WriteMode::Overwrite)
            .await
            .unwrap();

        let entries = store.list("inbox", 5).await.unwrap();
        assert_eq!(entries.len(), 5);
        assert!(entries.iter().all(|e| e.path.starts_with("inbox/")));

        let entries = store.list("inbox", 100).await.unwrap();
        assert_eq!(entries.len(), 8);
        let first = entries.iter().find(|e| e.path == "inbox/0.json").unwrap();
        assert_eq!(first.size, 1);

        assert_eq!(store.list("", 100).await.unwrap().len(), 9);
    }

    #[tokio::test]
    async fn test_listed_keys_with_reserved_characters_round_trip() {
        let store = BlobStorage::in_memory();
        let key = "inbox/report#1 50%.txt";
        store
            .put(key, Bytes::from_static(b"r"), None, WriteMode::Overwrite)
            .await
            .unwrap();

        let entries = store.list("inbox", 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, key);
        assert_eq!(
            store.get(&entries[0].path).await.unwrap().body,
            Bytes::from_static(b"r")
        );
        store.delete(&entries[0].path).await.unwrap();
        assert!(store.get(key).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_list_matches_partial_segment() {
        let store = BlobStorage::in_memory();
        for key in [
            "inbox/2024-01.json",
            "inbox/2024-02.json",
            "inbox/2023-12.json",
            "inboxes/x",
        ] {
            store
                .put(key, Bytes::from_static(b"{}"), None, WriteMode::Overwrite)
                .await
                .unwrap();
        }

        let paths: Vec<String> = store
            .list("inbox/2024-", 10)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.path)
            .collect();
        assert_eq!(paths, vec!["inbox/2024-01.json", "inbox/2024-02.json"]);

        assert_eq!(store.list("inbox/", 10).await.unwrap().len(), 3);
        assert_eq!(store.list("inbox", 10).await.unwrap().len(), 4);
        assert_eq!(store.list("inbox/2024-", 1).await.unwrap().len(), 1);
        assert!(store.list("inbox/2025", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_conditional_writes() {
        let store = BlobStorage::in_memory();
        store
            .put("job.lock", Bytes::from_static(b"1"), None, WriteMode::Create)
            .await
            .unwrap();
        let err = store
            .put("job.lock", Bytes::from_static(b"2"), None, WriteMode::Create)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));

        let v1 = store.get("job.lock").await.unwrap().version;
        store
            .put(
                "job.lock",
                Bytes::from_static(b"3"),
                None,
                WriteMode::Update(v1.clone()),
            )
            .await
            .unwrap();
        let err = store
            .put("job.lock", Bytes::from_static(b"4"), None, WriteMode::Update(v1))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(
            store.get("job.lock").await.unwrap().body,
            Bytes::from_static(b"3")
        );
    }

    #[tokio::test]
    async fn test_disk_storage() {
        let dir = tempfile::tempdir().unwrap();
        let config = BlobStorageConfig {
            s3: None,
            disk: Some(DiskStorageConfig {
                path: dir.path().join("blobs").to_str().unwrap().to_string(),
            }),
        };
        let store = BlobStorage::new(&config).unwrap();
        assert!(!store.supports_content_encoding());

        store
            .put("inbox/a.txt", Bytes::from_static(b"abc"), None, WriteMode::Overwrite)
            .await
            .unwrap();
        assert_eq!(
            store.get("inbox/a.txt").await.unwrap().body,
            Bytes::from_static(b"abc")
        );
        store.delete("inbox/a.txt").await.unwrap();
        store.delete("inbox/a.txt").await.unwrap();
        assert!(store.get("inbox/a.txt").await.unwrap_err().is_not_found());
    }
}
