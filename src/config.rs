use std::{path::Path, time::Duration};

use anyhow::{Context, Result};
use blob_store::BlobStorageConfig;
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::{
    batch::{DEFAULT_CONCURRENCY, DEFAULT_MAX_KEYS},
    client::BlobClient,
    lock::DEFAULT_LOCK_EXPIRY,
};

pub const ENV_PREFIX: &str = "BLOB_LEASE_";

const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub blob_storage: BlobStorageConfig,
    pub concurrency: usize,
    pub list_max_keys: usize,
    pub lock_expiry_ms: u64,
    /// gzip level used when compressing writes, 0-9.
    pub compression_level: u32,
    pub structured_logging: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            blob_storage: Default::default(),
            concurrency: DEFAULT_CONCURRENCY,
            list_max_keys: DEFAULT_MAX_KEYS,
            lock_expiry_ms: DEFAULT_LOCK_EXPIRY.as_millis() as u64,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            structured_logging: false,
        }
    }
}

impl ClientConfig {
    /// Defaults, then the YAML file at `path` if given, then `BLOB_LEASE_*`
    /// environment variables (nested keys separated by `__`).
    pub fn load(path: Option<&Path>) -> Result<ClientConfig> {
        let mut figment = Figment::from(Serialized::defaults(ClientConfig::default()));
        if let Some(path) = path {
            let config_str = std::fs::read_to_string(path)
                .with_context(|| format!("unable to read config file {}", path.display()))?;
            figment = figment.merge(Yaml::string(&config_str));
        }
        let config: ClientConfig = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(config_str: &str) -> Result<ClientConfig> {
        let config: ClientConfig = Figment::from(Serialized::defaults(ClientConfig::default()))
            .merge(Yaml::string(config_str))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.blob_storage.s3.is_some() && self.blob_storage.disk.is_some() {
            return Err(anyhow::anyhow!(
                "cannot specify both s3 and disk blob storage"
            ));
        }
        if let Some(s3) = &self.blob_storage.s3 {
            if s3.bucket.is_empty() {
                return Err(anyhow::anyhow!("s3 blob storage requires a bucket"));
            }
        }
        if self.concurrency == 0 {
            return Err(anyhow::anyhow!("concurrency must be greater than zero"));
        }
        if self.list_max_keys == 0 {
            return Err(anyhow::anyhow!("list_max_keys must be greater than zero"));
        }
        if self.compression_level > 9 {
            return Err(anyhow::anyhow!(
                "compression_level must be between 0 and 9, got {}",
                self.compression_level
            ));
        }
        Ok(())
    }

    pub fn lock_expiry(&self) -> Duration {
        Duration::from_millis(self.lock_expiry_ms)
    }

    pub fn build_client(&self) -> Result<BlobClient> {
        BlobClient::from_config(&self.blob_storage, self.compression_level)
    }
}
