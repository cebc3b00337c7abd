use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_PARTITION: &str = "train_images";

/// Construction parameters for a batch sequence.
///
/// `batch_size`, `num_classes` and `total_samples` are fixed for the lifetime of the
/// sequence built from this config. The defaults leave `num_classes` and `total_samples`
/// at zero, so a config must name its dataset before it validates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    pub batch_size: usize,
    pub num_classes: usize,
    /// Declared sequence length reported to the training loop.
    pub length: usize,
    pub total_samples: u64,
    pub partition: String,
    /// Concurrently running task groups.
    pub pool_size: usize,
    /// Resolve rounds submitted at construction.
    pub lookahead_rounds: usize,
    /// Fetch task groups a resolved URL batch is split into.
    pub download_chunks: usize,
    /// Outstanding fetch groups below which extra rounds are dispatched.
    pub low_water_fetch_tasks: usize,
    pub refill_rounds: usize,
    /// `get` dispatches an extra round when fewer than this many batches are ready.
    pub ready_margin_batches: usize,
    pub backoff_ms: u64,
    pub store_timeout_ms: u64,
    pub image_height: u32,
    pub image_width: u32,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            num_classes: 0,
            length: 1000,
            total_samples: 0,
            partition: DEFAULT_PARTITION.to_string(),
            pool_size: 10,
            lookahead_rounds: 5,
            download_chunks: 10,
            low_water_fetch_tasks: 3,
            refill_rounds: 3,
            ready_margin_batches: 5,
            backoff_ms: 3000,
            store_timeout_ms: 1_000_000,
            image_height: 224,
            image_width: 224,
        }
    }
}

impl LoaderConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if self.num_classes == 0 {
            return Err(ConfigError::ZeroClasses);
        }
        if self.total_samples == 0 {
            return Err(ConfigError::ZeroSamples);
        }
        if self.pool_size == 0 {
            return Err(ConfigError::ZeroPoolSize);
        }
        if self.download_chunks == 0 {
            return Err(ConfigError::ZeroDownloadChunks);
        }
        if self.partition.trim().is_empty() {
            return Err(ConfigError::EmptyPartition);
        }
        if self.backoff_ms == 0 {
            return Err(ConfigError::ZeroBackoff);
        }
        if self.store_timeout_ms == 0 {
            return Err(ConfigError::ZeroStoreTimeout);
        }
        if self.image_height == 0 || self.image_width == 0 {
            return Err(ConfigError::ZeroImageSize {
                height: self.image_height,
                width: self.image_width,
            });
        }
        Ok(())
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// Items per fetch group for a resolved batch of `len` records (at least 1).
    pub fn chunk_len(&self, len: usize) -> usize {
        len.div_ceil(self.download_chunks.max(1)).max(1)
    }

    pub fn ready_margin_slots(&self) -> usize {
        self.batch_size.saturating_mul(self.ready_margin_batches)
    }
}
