use blob_store::StoreError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("object not found: {path}")]
    NotFound { path: String },

    #[error("failed to decode {path}: {source}")]
    DecodeError {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid json at {path}: {source}")]
    ParseError {
        path: String,
        source: serde_json::Error,
    },

    #[error("{0}")]
    PolicyViolation(String),

    #[error("lock {name} already acquired ({delta_ms}ms ago)")]
    LockHeld { name: String, delta_ms: i64 },

    #[error("lease on {name} was taken over by another owner")]
    LeaseLost { name: String },

    #[error("object store failure on {path}: {source}")]
    Backend { path: String, source: StoreError },
}

impl Error {
    /// Maps a store failure on `path` into the client taxonomy. Only a
    /// definitive absence becomes [`Error::NotFound`].
    pub(crate) fn from_store(path: &str, err: StoreError) -> Self {
        match err {
            StoreError::NotFound { .. } => Self::NotFound {
                path: path.to_string(),
            },
            source => Self::Backend {
                path: path.to_string(),
                source,
            },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_lock_held(&self) -> bool {
        matches!(self, Self::LockHeld { .. })
    }
}
