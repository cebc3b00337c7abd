use std::collections::{HashMap, HashSet, VecDeque};
use std::convert::Infallible;
use std::sync::Arc;

use imgstream_core::config::LoaderConfig;
use imgstream_core::error::{LabelStoreError, ResolutionError};
use imgstream_core::types::{Batch, FetchResult, LabelSet, ReadyItem, RecordRef, SampleIndex};
use imgstream_observe::metrics::{Counter, DurationAgg, Gauge, ScopedTimer};
use imgstream_store::{LabelResolver, RecordResolver};

use crate::fetch::ImageFetcher;
use crate::pool::{PoolError, TaskHandle, TaskPoll, WorkerPool};
use crate::sampler::IndexSampler;

type ResolveHandle = TaskHandle<Vec<RecordRef>, ResolutionError>;
type FetchHandle = TaskHandle<Vec<FetchResult>, Infallible>;

#[derive(Debug, Default)]
pub struct LoaderMetrics {
    pub resolve_rounds_submitted: Counter,
    pub resolve_rounds_failed: Counter,
    pub url_batches_resolved: Counter,
    pub fetch_groups_submitted: Counter,
    pub fetch_groups_lost: Counter,
    pub items_fetched: Counter,
    pub items_failed: Counter,
    pub label_groups_failed: Counter,
    pub dropped_windows_discarded: Counter,
    pub batches_delivered: Counter,
    pub samples_delivered: Counter,
    pub ready_slots: Gauge,
    pub ready_slots_high_water: Gauge,
    pub pending_fetch_groups: Gauge,
    pub fetch_group_latency: DurationAgg,
}

/// One position in the ready buffer. A failed fetch keeps its position as `Dropped`, so it
/// shrinks the batch it lands in instead of being silently backfilled.
#[derive(Debug)]
enum Slot {
    Item(ReadyItem),
    Dropped,
}

/// The resolvers and fetcher a pipeline pulls from.
#[derive(Clone)]
pub struct Sources {
    pub records: Arc<dyn RecordResolver>,
    pub labels: Arc<dyn LabelResolver>,
    pub fetcher: Arc<dyn ImageFetcher>,
}

/// Orchestrates resolve and fetch task groups against the ready buffer.
///
/// All queues are owned and mutated by the thread driving the engine; workers only
/// report through task handles.
pub struct PrefetchEngine {
    cfg: LoaderConfig,
    pool: WorkerPool,
    sampler: IndexSampler,
    sources: Sources,
    pending_resolve: Vec<ResolveHandle>,
    pending_fetch: Vec<FetchHandle>,
    url_batches: VecDeque<Vec<RecordRef>>,
    ready: VecDeque<Slot>,
    metrics: Arc<LoaderMetrics>,
}

impl PrefetchEngine {
    pub fn new(
        cfg: LoaderConfig,
        sampler: IndexSampler,
        sources: Sources,
    ) -> Result<Self, PoolError> {
        let pool = WorkerPool::new(cfg.pool_size)?;
        Ok(Self {
            cfg,
            pool,
            sampler,
            sources,
            pending_resolve: Vec::new(),
            pending_fetch: Vec::new(),
            url_batches: VecDeque::new(),
            ready: VecDeque::new(),
            metrics: Arc::new(LoaderMetrics::default()),
        })
    }

    pub fn metrics(&self) -> Arc<LoaderMetrics> {
        self.metrics.clone()
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.cfg
    }

    pub fn ready_slots(&self) -> usize {
        self.ready.len()
    }

    pub fn pending_resolve_tasks(&self) -> usize {
        self.pending_resolve.len()
    }

    pub fn pending_fetch_tasks(&self) -> usize {
        self.pending_fetch.len()
    }

    pub fn url_batches_ready(&self) -> usize {
        self.url_batches.len()
    }

    /// Queues `lookahead_rounds` resolve rounds and dispatches the first download round.
    pub fn prime(&mut self) -> Result<(), PoolError> {
        for _ in 0..self.cfg.lookahead_rounds {
            self.sample_round()?;
        }
        self.prefetch(1)
    }

    /// Samples one batch worth of indices and submits a resolve task group for them.
    pub fn sample_round(&mut self) -> Result<(), PoolError> {
        let indices = self
            .sampler
            .sample(self.cfg.total_samples, self.cfg.batch_size);
        let group = resolve_group(
            self.sources.records.clone(),
            indices,
            self.cfg.partition.clone(),
            self.cfg.store_timeout(),
        );
        let handle = self.pool.submit(group)?;
        self.metrics.resolve_rounds_submitted.inc();
        tracing::trace!(
            target: "imgstream_pipeline",
            event = "resolve_submitted",
            task_id = handle.id(),
            partition = %self.cfg.partition,
            "submitted resolve round"
        );
        self.pending_resolve.push(handle);
        Ok(())
    }

    /// Runs `rounds` download rounds, each on a freshly resolved URL batch.
    pub fn prefetch(&mut self, rounds: usize) -> Result<(), PoolError> {
        for _ in 0..rounds {
            self.ensure_next_url_batch()?;
            self.dispatch_downloads()?;
        }
        Ok(())
    }

    /// Returns once at least one resolved URL batch is queued.
    ///
    /// Blocks (with backoff) for as long as the index store keeps failing.
    pub fn ensure_next_url_batch(&mut self) -> Result<(), PoolError> {
        while self.url_batches.is_empty() {
            if self.pending_resolve.is_empty() {
                self.sample_round()?;
            }
            if self.drain_resolved() == 0 {
                self.backoff()?;
            }
        }
        Ok(())
    }

    /// Fills the ready buffer until the next batch window holds at least one item, keeping
    /// fetch work in flight.
    ///
    /// Windows made only of dropped slots are discarded, so sustained fetch failure blocks
    /// here in the backoff loop instead of yielding empty batches.
    pub fn ensure_next_batch_ready(&mut self) -> Result<(), PoolError> {
        self.ensure_next_url_batch()?;

        loop {
            self.discard_dropped_windows();
            if self.ready.len() >= self.cfg.batch_size {
                break;
            }
            if self.pending_fetch.is_empty() {
                self.prefetch(1)?;
            }
            if self.drain_fetched() == 0 {
                self.backoff()?;
                continue;
            }
            if self.pending_fetch.len() < self.cfg.low_water_fetch_tasks {
                self.prefetch(self.cfg.refill_rounds)?;
            }
        }
        Ok(())
    }

    /// Pops leading `batch_size` windows that contain no item.
    fn discard_dropped_windows(&mut self) {
        let window = self.cfg.batch_size;
        while self.ready.len() >= window
            && self
                .ready
                .iter()
                .take(window)
                .all(|slot| matches!(slot, Slot::Dropped))
        {
            self.ready.drain(..window);
            self.metrics.dropped_windows_discarded.inc();
            tracing::warn!(
                target: "imgstream_pipeline",
                event = "batch_window_discarded",
                batch_size = window as u64,
                "every fetch in a batch window failed; discarding it"
            );
        }
        self.metrics.ready_slots.set(self.ready.len() as u64);
    }

    /// Dispatches the lookahead that follows a delivery: one resolve round, one download
    /// round, and one extra download round while fewer than `ready_margin_slots` are
    /// buffered. Returns the number of download rounds dispatched.
    pub fn schedule_lookahead(&mut self) -> Result<usize, PoolError> {
        self.sample_round()?;
        self.prefetch(1)?;
        if self.ready.len() < self.cfg.ready_margin_slots() {
            self.prefetch(1)?;
            return Ok(2);
        }
        Ok(1)
    }

    /// Removes up to `batch_size` slots from the front of the ready buffer.
    pub fn take_batch(&mut self) -> Batch {
        let n = self.cfg.batch_size.min(self.ready.len());
        let items: Vec<ReadyItem> = self
            .ready
            .drain(..n)
            .filter_map(|slot| match slot {
                Slot::Item(item) => Some(item),
                Slot::Dropped => None,
            })
            .collect();
        self.metrics.ready_slots.set(self.ready.len() as u64);

        let batch = Batch::from_items(items, self.cfg.num_classes);
        self.metrics.batches_delivered.inc();
        self.metrics.samples_delivered.inc_by(batch.len() as u64);
        if batch.len() < self.cfg.batch_size {
            tracing::debug!(
                target: "imgstream_pipeline",
                event = "short_batch",
                samples = batch.len() as u64,
                batch_size = self.cfg.batch_size as u64,
                "batch shrank after fetch failures"
            );
        }
        batch
    }

    /// Aborts outstanding task groups, drops every queue and stops the pool. Idempotent.
    pub fn shutdown(&mut self) {
        if self.pool.is_closed() {
            return;
        }
        let resolve = self.pending_resolve.len();
        let fetch = self.pending_fetch.len();
        for handle in self.pending_resolve.drain(..) {
            handle.abort();
        }
        for handle in self.pending_fetch.drain(..) {
            handle.abort();
        }
        self.url_batches.clear();
        self.ready.clear();
        self.metrics.ready_slots.set(0);
        self.metrics.pending_fetch_groups.set(0);
        self.pool.shutdown();
        tracing::info!(
            target: "imgstream_pipeline",
            event = "engine_shutdown",
            aborted_resolve_tasks = resolve as u64,
            aborted_fetch_tasks = fetch as u64,
            "prefetch engine shut down"
        );
    }

    fn backoff(&self) -> Result<(), PoolError> {
        if self.pool.is_closed() {
            return Err(PoolError::Closed);
        }
        self.pool.wait_for_completion(self.cfg.backoff());
        Ok(())
    }

    /// Pops one URL batch and submits one fetch group per chunk.
    fn dispatch_downloads(&mut self) -> Result<(), PoolError> {
        let Some(records) = self.url_batches.pop_front() else {
            return Ok(());
        };
        let chunk_len = self.cfg.chunk_len(records.len());
        let mut records = records.into_iter().peekable();
        while records.peek().is_some() {
            let chunk: Vec<RecordRef> = records.by_ref().take(chunk_len).collect();
            let group = fetch_group(self.sources.fetcher.clone(), chunk, self.metrics.clone());
            let handle = self.pool.submit(group)?;
            self.metrics.fetch_groups_submitted.inc();
            self.pending_fetch.push(handle);
        }
        self.metrics
            .pending_fetch_groups
            .set(self.pending_fetch.len() as u64);
        Ok(())
    }

    /// Moves every finished resolve group into `url_batches`; returns how many were usable.
    fn drain_resolved(&mut self) -> usize {
        let mut usable = 0usize;
        let mut still_pending = Vec::with_capacity(self.pending_resolve.len());
        for mut handle in self.pending_resolve.drain(..) {
            match handle.poll() {
                TaskPoll::Pending => still_pending.push(handle),
                TaskPoll::Ready(records) if records.is_empty() => {
                    tracing::debug!(
                        target: "imgstream_pipeline",
                        event = "resolve_empty",
                        task_id = handle.id(),
                        partition = %self.cfg.partition,
                        "resolve round matched no records"
                    );
                }
                TaskPoll::Ready(records) => {
                    self.metrics.url_batches_resolved.inc();
                    self.url_batches.push_back(records);
                    usable += 1;
                }
                TaskPoll::Failed(err) => {
                    self.metrics.resolve_rounds_failed.inc();
                    tracing::warn!(
                        target: "imgstream_pipeline",
                        event = "resolve_failed",
                        task_id = handle.id(),
                        partition = %self.cfg.partition,
                        error = %err,
                        "resolve round failed; will resample"
                    );
                }
                TaskPoll::Lost => {
                    self.metrics.resolve_rounds_failed.inc();
                    tracing::warn!(
                        target: "imgstream_pipeline",
                        event = "resolve_lost",
                        task_id = handle.id(),
                        "resolve round ended without a result"
                    );
                }
            }
        }
        self.pending_resolve = still_pending;
        usable
    }

    /// Joins every finished fetch group with its labels and appends the resulting slots;
    /// returns how many groups contributed slots.
    fn drain_fetched(&mut self) -> usize {
        let mut contributed = 0usize;
        let mut still_pending = Vec::with_capacity(self.pending_fetch.len());
        let handles: Vec<FetchHandle> = self.pending_fetch.drain(..).collect();
        for mut handle in handles {
            match handle.poll() {
                TaskPoll::Pending => still_pending.push(handle),
                TaskPoll::Ready(results) => {
                    let task_id = handle.id();
                    match self.join_labels(results) {
                        Ok(slots) if slots.is_empty() => {}
                        Ok(slots) => {
                            self.ready.extend(slots);
                            contributed += 1;
                        }
                        Err(err) => {
                            self.metrics.label_groups_failed.inc();
                            tracing::warn!(
                                target: "imgstream_pipeline",
                                event = "label_join_failed",
                                task_id = task_id,
                                error = %err,
                                "label lookup failed; dropping fetch group"
                            );
                        }
                    }
                }
                TaskPoll::Failed(never) => match never {},
                TaskPoll::Lost => {
                    self.metrics.fetch_groups_lost.inc();
                    tracing::warn!(
                        target: "imgstream_pipeline",
                        event = "fetch_group_lost",
                        task_id = handle.id(),
                        "fetch group ended without a result"
                    );
                }
            }
        }
        self.pending_fetch = still_pending;

        let ready = self.ready.len() as u64;
        self.metrics.ready_slots.set(ready);
        self.metrics.ready_slots_high_water.max(ready);
        self.metrics
            .pending_fetch_groups
            .set(self.pending_fetch.len() as u64);
        contributed
    }

    fn join_labels(&self, results: Vec<FetchResult>) -> Result<Vec<Slot>, LabelStoreError> {
        let mut seen = HashSet::new();
        let ids: Vec<String> = results
            .iter()
            .filter(|r| r.is_fetched())
            .map(|r| r.original_id().to_string())
            .filter(|id| seen.insert(id.clone()))
            .collect();

        let labels: HashMap<String, LabelSet> = if ids.is_empty() {
            HashMap::new()
        } else {
            self.sources.labels.positive_labels(&ids)?
        };

        let slots = results
            .into_iter()
            .map(|result| match result {
                FetchResult::Fetched { image, original_id } => {
                    self.metrics.items_fetched.inc();
                    let labels = labels.get(&original_id).cloned().unwrap_or_default();
                    Slot::Item(ReadyItem {
                        image,
                        original_id,
                        labels,
                    })
                }
                FetchResult::Failed {
                    original_id,
                    url,
                    error,
                } => {
                    self.metrics.items_failed.inc();
                    tracing::debug!(
                        target: "imgstream_pipeline",
                        event = "item_dropped",
                        original_id = %original_id,
                        url = %url,
                        error = %error,
                        "dropping failed fetch"
                    );
                    Slot::Dropped
                }
            })
            .collect();
        Ok(slots)
    }
}

impl Drop for PrefetchEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Runs one blocking index lookup under the store timeout.
async fn resolve_group(
    records: Arc<dyn RecordResolver>,
    indices: Vec<SampleIndex>,
    partition: String,
    timeout: std::time::Duration,
) -> Result<Vec<RecordRef>, ResolutionError> {
    let lookup = tokio::task::spawn_blocking(move || records.resolve(&indices, &partition));
    match tokio::time::timeout(timeout, lookup).await {
        Ok(Ok(res)) => res,
        Ok(Err(join)) => Err(ResolutionError::Worker(join.to_string())),
        Err(_) => Err(ResolutionError::Timeout(timeout)),
    }
}

/// Fetches one chunk concurrently; output order matches `chunk` order.
async fn fetch_group(
    fetcher: Arc<dyn ImageFetcher>,
    chunk: Vec<RecordRef>,
    metrics: Arc<LoaderMetrics>,
) -> Result<Vec<FetchResult>, Infallible> {
    let _timer = ScopedTimer::new(&metrics.fetch_group_latency);
    let fetches = chunk.into_iter().map(|record| fetcher.fetch(record));
    Ok(futures::future::join_all(fetches).await)
}
