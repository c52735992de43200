//! Compression-transparent object store access, bounded-concurrency batch
//! operations over listed prefixes, and a lease lock kept as a JSON record in
//! the same store.

pub mod batch;
pub mod client;
pub mod config;
pub mod error;
pub mod lock;

#[cfg(test)]
mod testing;

pub use batch::BatchOperations;
pub use blob_store::{BlobStorageConfig, DirectoryEntry};
pub use client::{Blob, BlobClient, Encoding, WriteResult};
pub use config::ClientConfig;
pub use error::{Error, Result};
pub use lock::{Lease, LeaseLock, LockRecord, DEFAULT_LOCK_EXPIRY};
