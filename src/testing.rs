use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use blob_store::{
    BlobStorage,
    DirectoryEntry,
    ObjectStoreAdapter,
    StoreError,
    StoredObject,
    WriteMode,
};
use bytes::Bytes;

use crate::client::BlobClient;

/// In-memory store that records how many reads are in flight at once and
/// can be told to fail specific keys.
#[derive(Debug)]
pub struct InstrumentedStore {
    inner: BlobStorage,
    read_delay: Duration,
    reads_in_flight: AtomicUsize,
    peak_reads_in_flight: AtomicUsize,
    reads: AtomicUsize,
    failing_gets: Mutex<HashSet<String>>,
    failing_deletes: Mutex<HashSet<String>>,
}

impl InstrumentedStore {
    pub fn new(read_delay: Duration) -> Self {
        Self {
            inner: BlobStorage::in_memory(),
            read_delay,
            reads_in_flight: AtomicUsize::new(0),
            peak_reads_in_flight: AtomicUsize::new(0),
            reads: AtomicUsize::new(0),
            failing_gets: Mutex::new(HashSet::new()),
            failing_deletes: Mutex::new(HashSet::new()),
        }
    }

    pub fn peak_reads_in_flight(&self) -> usize {
        self.peak_reads_in_flight.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn fail_gets_for(&self, key: &str) {
        self.failing_gets.lock().unwrap().insert(key.to_string());
    }

    pub fn fail_deletes_for(&self, key: &str) {
        self.failing_deletes.lock().unwrap().insert(key.to_string());
    }

    fn injected(key: &str) -> StoreError {
        StoreError::Backend {
            source: object_store::Error::Generic {
                store: "instrumented",
                source: format!("injected failure for {key}").into(),
            },
        }
    }
}

#[async_trait]
impl ObjectStoreAdapter for InstrumentedStore {
    async fn get(&self, key: &str) -> Result<StoredObject, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let now = self.reads_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_reads_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.read_delay.is_zero() {
            tokio::time::sleep(self.read_delay).await;
        }
        let fail = self.failing_gets.lock().unwrap().contains(key);
        let res = if fail {
            Err(Self::injected(key))
        } else {
            self.inner.get(key).await
        };
        self.reads_in_flight.fetch_sub(1, Ordering::SeqCst);
        res
    }

    async fn put(
        &self,
        key: &str,
        body: Bytes,
        content_encoding: Option<&str>,
        mode: WriteMode,
    ) -> Result<(), StoreError> {
        self.inner.put(key, body, content_encoding, mode).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let fail = self.failing_deletes.lock().unwrap().contains(key);
        if fail {
            return Err(Self::injected(key));
        }
        self.inner.delete(key).await
    }

    async fn copy(&self, from: &str, to: &str) -> Result<(), StoreError> {
        self.inner.copy(from, to).await
    }

    async fn list(&self, prefix: &str, max_keys: usize) -> Result<Vec<DirectoryEntry>, StoreError> {
        self.inner.list(prefix, max_keys).await
    }
}

pub fn test_client() -> (BlobClient, Arc<InstrumentedStore>) {
    test_client_with_delay(Duration::ZERO)
}

pub fn test_client_with_delay(read_delay: Duration) -> (BlobClient, Arc<InstrumentedStore>) {
    let store = Arc::new(InstrumentedStore::new(read_delay));
    (BlobClient::new(store.clone()), store)
}

/// Deterministic bytes that gzip cannot shrink.
pub fn pseudo_random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 24) as u8
        })
        .collect()
}
