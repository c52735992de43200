use std::time::Duration;

use blob_store::{StoreError, WriteMode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    client::BlobClient,
    error::{Error, Result},
};

pub const DEFAULT_LOCK_EXPIRY: Duration = Duration::from_secs(3 * 60);

const LOCK_SUFFIX: &str = ".lock";

pub fn lock_key(name: &str) -> String {
    format!("{name}{LOCK_SUFFIX}")
}

/// Body of `<name>.lock`. Records written by other clients may carry only
/// the date.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    pub date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

/// A best-effort lease lock kept as a record in the object store.
///
/// A lock is held while a parseable record younger than the expiry exists.
/// Acquisition writes the record with a conditional put when the store
/// supports one, so two acquirers racing on the same record cannot both
/// win. Stores without conditional writes fall back to a plain overwrite
/// and the read-then-write race remains. This is not a linearizable lock
/// service and there are no fencing tokens for downstream resources.
#[derive(Debug, Clone)]
pub struct LeaseLock {
    client: BlobClient,
}

enum LockState {
    Free,
    Expired(WriteMode),
}

impl LeaseLock {
    pub fn new(client: BlobClient) -> Self {
        Self { client }
    }

    pub async fn acquire(&self, name: &str, expiry: Duration) -> Result<Lease> {
        if name.is_empty() {
            return Err(Error::InvalidArgument("lock name missing".to_string()));
        }
        let key = lock_key(name);
        let now = Utc::now();
        let mode = match self.inspect(name, &key, now, expiry).await? {
            LockState::Free => WriteMode::Create,
            LockState::Expired(mode) => mode,
        };

        let owner = Uuid::new_v4().to_string();
        let record = LockRecord {
            date: now,
            owner: Some(owner.clone()),
        };
        match self.client.write_json_with_mode(&key, &record, mode).await {
            Ok(_) => {}
            Err(Error::Backend { source, .. }) if source.is_conflict() => {
                info!(key = %key, "lost race for lock");
                return Err(Error::LockHeld {
                    name: name.to_string(),
                    delta_ms: 0,
                });
            }
            Err(Error::Backend {
                source: StoreError::NotImplemented { .. },
                ..
            }) => {
                warn!(key = %key, "store has no conditional writes, overwriting lock");
                self.client.write_json(&key, &record).await?;
            }
            Err(err) => return Err(err),
        }
        info!(key = %key, owner = %owner, "lock acquired");

        Ok(Lease {
            client: self.client.clone(),
            name: name.to_string(),
            key,
            owner,
            acquired_at: now,
        })
    }

    async fn inspect(
        &self,
        name: &str,
        key: &str,
        now: DateTime<Utc>,
        expiry: Duration,
    ) -> Result<LockState> {
        let blob = match self.client.read(key).await {
            Ok(blob) => blob,
            Err(err) if err.is_not_found() => {
                debug!(key, "lock free");
                return Ok(LockState::Free);
            }
            Err(Error::DecodeError { source, .. }) => {
                warn!(key, %source, "lock record undecodable, deleting");
                self.client.delete(key).await?;
                return Ok(LockState::Free);
            }
            Err(err) => return Err(err),
        };

        let value: serde_json::Value = match serde_json::from_slice(&blob.body) {
            Ok(value) => value,
            Err(err) => {
                warn!(key, %err, "lock had invalid json, deleting");
                self.client.delete(key).await?;
                return Ok(LockState::Free);
            }
        };

        match serde_json::from_value::<LockRecord>(value) {
            Ok(record) => {
                let delta_ms = (now - record.date).num_milliseconds();
                let expiry_ms = i64::try_from(expiry.as_millis()).unwrap_or(i64::MAX);
                if delta_ms < expiry_ms {
                    return Err(Error::LockHeld {
                        name: name.to_string(),
                        delta_ms,
                    });
                }
                info!(key, delta_ms, "lock expired, overwrite");
            }
            Err(err) => warn!(key, %err, "lock record has no usable date, overwrite"),
        }

        if blob.version.is_known() {
            Ok(LockState::Expired(WriteMode::Update(blob.version)))
        } else {
            Ok(LockState::Expired(WriteMode::Overwrite))
        }
    }
}

/// Proof of a successful [`LeaseLock::acquire`].
///
/// Dropping a lease does not release it; the record stays until
/// [`Lease::release`] is called or it expires.
#[derive(Debug)]
pub struct Lease {
    client: BlobClient,
    name: String,
    key: String,
    owner: String,
    acquired_at: DateTime<Utc>,
}

impl Lease {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// Deletes the lock record if it is still ours. Releasing a lease whose
    /// record is already gone succeeds, so this can be called more than once.
    ///
    /// If another acquirer has taken the lock over since (after expiry) the
    /// record is left alone and [`Error::LeaseLost`] is returned. The check
    /// and the delete are two requests, so a takeover landing between them
    /// is still deleted.
    pub async fn release(&self) -> Result<()> {
        match self.client.read_json::<LockRecord>(&self.key).await {
            Ok(None) => {
                debug!(key = %self.key, "lock already released");
                Ok(())
            }
            Ok(Some(record)) if record.owner.as_deref() == Some(self.owner.as_str()) => {
                self.client.delete(&self.key).await?;
                info!(key = %self.key, "lock released");
                Ok(())
            }
            Ok(Some(_)) | Err(Error::ParseError { .. }) | Err(Error::DecodeError { .. }) => {
                warn!(key = %self.key, "lock record belongs to someone else, not releasing");
                Err(Error::LeaseLost {
                    name: self.name.clone(),
                })
            }
            Err(err) => Err(err),
        }
    }
}
