use std::sync::Arc;

use thiserror::Error;

use imgstream_core::config::LoaderConfig;
use imgstream_core::error::ConfigError;
use imgstream_core::types::Batch;

use crate::engine::{LoaderMetrics, PrefetchEngine, Sources};
use crate::pool::PoolError;
use crate::sampler::IndexSampler;

#[derive(Debug, Error)]
pub enum SequenceError {
    #[error("batch index {index} out of range for sequence of length {length}")]
    IndexOutOfRange { index: usize, length: usize },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Fixed-length, pull-based sequence of training batches.
///
/// Every `get` returns a freshly sampled batch; the index only bounds the sequence and
/// does not select data. Construction starts prefetching immediately.
///
/// `get` blocks the calling thread while the pipeline is starved, so it must not be
/// called from inside an async runtime.
pub struct BatchSequence {
    engine: PrefetchEngine,
    length: usize,
}

impl BatchSequence {
    pub fn new(cfg: LoaderConfig, sources: Sources) -> Result<Self, SequenceError> {
        Self::with_sampler(cfg, sources, IndexSampler::from_os_rng())
    }

    pub fn with_sampler(
        cfg: LoaderConfig,
        sources: Sources,
        sampler: IndexSampler,
    ) -> Result<Self, SequenceError> {
        cfg.validate()?;
        let length = cfg.length;
        tracing::info!(
            target: "imgstream_pipeline",
            event = "sequence_start",
            batch_size = cfg.batch_size as u64,
            num_classes = cfg.num_classes as u64,
            total_samples = cfg.total_samples,
            length = length as u64,
            partition = %cfg.partition,
            pool_size = cfg.pool_size as u64,
            "starting batch sequence"
        );

        let mut engine = PrefetchEngine::new(cfg, sampler, sources)?;
        engine.prime()?;
        Ok(Self { engine, length })
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn batch_size(&self) -> usize {
        self.engine.config().batch_size
    }

    pub fn metrics(&self) -> Arc<LoaderMetrics> {
        self.engine.metrics()
    }

    /// Slots currently buffered, including dropped ones.
    pub fn ready_slots(&self) -> usize {
        self.engine.ready_slots()
    }

    pub fn get(&mut self, index: usize) -> Result<Batch, SequenceError> {
        if index >= self.length {
            return Err(SequenceError::IndexOutOfRange {
                index,
                length: self.length,
            });
        }

        self.engine.ensure_next_batch_ready()?;
        self.engine.schedule_lookahead()?;

        let batch = self.engine.take_batch();
        tracing::debug!(
            target: "imgstream_pipeline",
            event = "batch_delivered",
            index = index as u64,
            samples = batch.len() as u64,
            ready_slots = self.engine.ready_slots() as u64,
            pending_fetch_tasks = self.engine.pending_fetch_tasks() as u64,
            "delivered batch"
        );
        Ok(batch)
    }

    /// Stops the pipeline, aborting outstanding work. Dropping the sequence does the same.
    pub fn close(mut self) {
        self.engine.shutdown();
    }
}
