use std::time::Duration;

use thiserror::Error;

/// Index store access failure. The whole resolve task group is discarded; the engine
/// recovers by sampling fresh indices.
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("unknown partition {0:?}")]
    UnknownPartition(String),
    #[error("invalid partition name {0:?}")]
    InvalidPartition(String),
    #[error("index store corrupt: {0}")]
    Corrupt(String),
    #[error("index store lookup timed out after {0:?}")]
    Timeout(Duration),
    #[error("resolver worker failed: {0}")]
    Worker(String),
    #[error("index store io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Label store access failure. Fatal to the fetch group that needed the lookup.
#[derive(Debug, Error)]
pub enum LabelStoreError {
    #[error("label store corrupt: {0}")]
    Corrupt(String),
    #[error("label store io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Single-item fetch failure; the item is dropped from its batch.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("http GET failed: status={status} url={url}")]
    Status { status: u16, url: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("resize failed: {0}")]
    Resize(String),
    #[error("fetch worker failed: {0}")]
    Worker(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("batch_size must be > 0")]
    ZeroBatchSize,
    #[error("num_classes must be > 0")]
    ZeroClasses,
    #[error("total_samples must be > 0")]
    ZeroSamples,
    #[error("pool_size must be > 0")]
    ZeroPoolSize,
    #[error("download_chunks must be > 0")]
    ZeroDownloadChunks,
    #[error("partition must be non-empty")]
    EmptyPartition,
    #[error("backoff_ms must be > 0")]
    ZeroBackoff,
    #[error("store_timeout_ms must be > 0")]
    ZeroStoreTimeout,
    #[error("image size must be non-zero (got {height}x{width})")]
    ZeroImageSize { height: u32, width: u32 },
}
