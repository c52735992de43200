use std::{fmt, io, sync::Arc};

use anyhow::Context;
use blob_store::{
    BlobStorage,
    BlobStorageConfig,
    Codec,
    GzipCodec,
    ObjectStoreAdapter,
    ObjectVersion,
    WriteMode,
};
use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// How a blob's body was stored. Callers always receive decoded bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    None,
    Compressed,
}

#[derive(Debug, Clone)]
pub struct Blob {
    pub path: String,
    pub body: Bytes,
    pub encoding: Encoding,
    pub version: ObjectVersion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteResult {
    pub encoding: Encoding,
    /// Bytes actually stored, after compression.
    pub size_bytes: u64,
}

/// Compression-transparent access to single objects.
///
/// Writes are compressed when that makes the stored body strictly smaller,
/// and the object's content encoding records which branch was taken, so
/// reads decode correctly either way.
#[derive(Clone)]
pub struct BlobClient {
    store: Arc<dyn ObjectStoreAdapter>,
    codec: Arc<dyn Codec>,
}

impl fmt::Debug for BlobClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobClient")
            .field("store", &"<hidden>")
            .field("codec", &self.codec.content_encoding())
            .finish()
    }
}

impl BlobClient {
    pub fn new(store: Arc<dyn ObjectStoreAdapter>) -> Self {
        Self::with_codec(store, Arc::new(GzipCodec::default()))
    }

    pub fn with_codec(store: Arc<dyn ObjectStoreAdapter>, codec: Arc<dyn Codec>) -> Self {
        Self { store, codec }
    }

    /// Builds a client over the configured backend, compressing writes at
    /// the given gzip level (0-9).
    pub fn from_config(
        config: &BlobStorageConfig,
        compression_level: u32,
    ) -> anyhow::Result<Self> {
        let storage = BlobStorage::new(config).context("unable to create blob storage")?;
        Ok(Self::with_codec(
            Arc::new(storage),
            Arc::new(GzipCodec::new(compression_level)),
        ))
    }

    pub async fn read(&self, path: &str) -> Result<Blob> {
        let object = self
            .store
            .get(path)
            .await
            .map_err(|e| Error::from_store(path, e))?;
        let (body, encoding) = match object.content_encoding.as_deref() {
            None | Some("") | Some("identity") => (object.body, Encoding::None),
            Some(tag) if tag == self.codec.content_encoding() => {
                let decoded =
                    self.codec
                        .decompress(&object.body)
                        .map_err(|source| Error::DecodeError {
                            path: path.to_string(),
                            source,
                        })?;
                (Bytes::from(decoded), Encoding::Compressed)
            }
            Some(tag) => {
                return Err(Error::DecodeError {
                    path: path.to_string(),
                    source: io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("unsupported content encoding {tag}"),
                    ),
                });
            }
        };
        debug!(path, size = body.len(), ?encoding, "read blob");
        Ok(Blob {
            path: path.to_string(),
            body,
            encoding,
            version: object.version,
        })
    }

    pub async fn write(&self, path: &str, data: impl Into<Bytes>) -> Result<WriteResult> {
        self.write_with_mode(path, data, WriteMode::Overwrite).await
    }

    pub async fn write_with_mode(
        &self,
        path: &str,
        data: impl Into<Bytes>,
        mode: WriteMode,
    ) -> Result<WriteResult> {
        let data = data.into();
        if path.is_empty() {
            return Err(Error::InvalidArgument("path missing".to_string()));
        }
        if data.is_empty() {
            return Err(Error::InvalidArgument(format!("contents missing for {path}")));
        }
        let (body, encoding) = self.encode(path, data);
        let size_bytes = body.len() as u64;
        let tag = match encoding {
            Encoding::Compressed => Some(self.codec.content_encoding()),
            Encoding::None => None,
        };
        debug!(path, size_bytes, ?encoding, "write blob");
        self.store
            .put(path, body, tag, mode)
            .await
            .map_err(|e| Error::from_store(path, e))?;
        Ok(WriteResult {
            encoding,
            size_bytes,
        })
    }

    fn encode(&self, path: &str, data: Bytes) -> (Bytes, Encoding) {
        if !self.store.supports_content_encoding() {
            return (data, Encoding::None);
        }
        match self.codec.compress(&data) {
            Ok(compressed) if compressed.len() < data.len() => {
                (Bytes::from(compressed), Encoding::Compressed)
            }
            Ok(_) => (data, Encoding::None),
            Err(err) => {
                warn!(path, %err, "compression failed, storing uncompressed");
                (data, Encoding::None)
            }
        }
    }

    /// Deleting an object that does not exist succeeds.
    pub async fn delete(&self, path: &str) -> Result<()> {
        debug!(path, "delete blob");
        self.store
            .delete(path)
            .await
            .map_err(|e| Error::from_store(path, e))
    }

    pub async fn copy(&self, source: &str, dest: &str) -> Result<()> {
        debug!(source, dest, "copy blob");
        self.store
            .copy(source, dest)
            .await
            .map_err(|e| Error::from_store(source, e))
    }

    /// Returns `None` when the object does not exist.
    pub async fn read_json<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let blob = match self.read(path).await {
            Ok(blob) => blob,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err),
        };
        serde_json::from_slice(&blob.body)
            .map(Some)
            .map_err(|source| Error::ParseError {
                path: path.to_string(),
                source,
            })
    }

    pub async fn write_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        value: &T,
    ) -> Result<WriteResult> {
        self.write_json_with_mode(path, value, WriteMode::Overwrite)
            .await
    }

    pub async fn write_json_with_mode<T: Serialize + ?Sized>(
        &self,
        path: &str,
        value: &T,
        mode: WriteMode,
    ) -> Result<WriteResult> {
        let body = serde_json::to_vec_pretty(value)
            .map_err(|err| Error::InvalidArgument(format!("cannot serialize {path}: {err}")))?;
        self.write_with_mode(path, body, mode).await
    }

    pub(crate) fn store(&self) -> &Arc<dyn ObjectStoreAdapter> {
        &self.store
    }
}
