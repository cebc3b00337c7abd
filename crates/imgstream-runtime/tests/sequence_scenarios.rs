use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;

use imgstream_core::config::LoaderConfig;
use imgstream_core::error::{FetchError, LabelStoreError, ResolutionError};
use imgstream_core::types::{FetchResult, Image, LabelSet, RecordRef, SampleIndex};
use imgstream_runtime::engine::Sources;
use imgstream_runtime::fetch::ImageFetcher;
use imgstream_runtime::sampler::IndexSampler;
use imgstream_runtime::sequence::{BatchSequence, SequenceError};
use imgstream_store::{LabelResolver, RecordResolver};

const IDS: [&str; 4] = ["A", "B", "C", "D"];

fn record(i: u64) -> RecordRef {
    let id = IDS[i as usize % IDS.len()];
    RecordRef {
        record_id: i,
        url: format!("mock://{id}"),
        original_id: id.to_string(),
    }
}

fn test_config() -> LoaderConfig {
    LoaderConfig {
        batch_size: 4,
        num_classes: 3,
        length: 10,
        total_samples: 4,
        pool_size: 2,
        lookahead_rounds: 2,
        download_chunks: 1,
        low_water_fetch_tasks: 1,
        refill_rounds: 1,
        ready_margin_batches: 2,
        backoff_ms: 10,
        store_timeout_ms: 5_000,
        image_height: 2,
        image_width: 2,
        ..LoaderConfig::default()
    }
}

/// Resolves every round to the same four records, in order, after `fail_first` failures.
/// `empty_first` rounds after that resolve to nothing.
#[derive(Default)]
struct FixedResolver {
    fail_first: usize,
    empty_first: usize,
    calls: AtomicUsize,
}

impl RecordResolver for FixedResolver {
    fn resolve(
        &self,
        _indices: &[SampleIndex],
        partition: &str,
    ) -> Result<Vec<RecordRef>, ResolutionError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first {
            return Err(ResolutionError::UnknownPartition(partition.to_string()));
        }
        if call < self.fail_first + self.empty_first {
            return Ok(Vec::new());
        }
        Ok((0..4).map(record).collect())
    }
}

/// Resolves each sampled index to its own record, keeping duplicates.
struct IndexedResolver;

impl RecordResolver for IndexedResolver {
    fn resolve(
        &self,
        indices: &[SampleIndex],
        _partition: &str,
    ) -> Result<Vec<RecordRef>, ResolutionError> {
        Ok(indices.iter().map(|&i| record(i)).collect())
    }
}

#[derive(Default)]
struct MapLabels {
    positives: HashMap<String, LabelSet>,
    fail_first: usize,
    calls: AtomicUsize,
}

impl MapLabels {
    fn scenario() -> Self {
        let mut positives = HashMap::new();
        positives.insert("A".to_string(), BTreeSet::from([1, 2]));
        positives.insert("C".to_string(), BTreeSet::from([3]));
        Self {
            positives,
            ..Self::default()
        }
    }
}

impl LabelResolver for MapLabels {
    fn positive_labels(
        &self,
        original_ids: &[String],
    ) -> Result<HashMap<String, LabelSet>, LabelStoreError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first {
            return Err(LabelStoreError::Corrupt("label table unavailable".to_string()));
        }
        Ok(original_ids
            .iter()
            .filter_map(|id| self.positives.get(id).map(|s| (id.clone(), s.clone())))
            .collect())
    }
}

/// Produces a 2x2 image whose pixels all equal the record id; fails listed urls and the
/// first `fail_first` fetches.
#[derive(Default)]
struct MockFetcher {
    failing_urls: HashSet<String>,
    fail_first: usize,
    hang: bool,
    calls: AtomicUsize,
}

#[async_trait]
impl ImageFetcher for MockFetcher {
    async fn fetch(&self, record: RecordRef) -> FetchResult {
        if self.hang {
            std::future::pending::<()>().await;
        }
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first || self.failing_urls.contains(&record.url) {
            return FetchResult::Failed {
                original_id: record.original_id,
                url: record.url.clone(),
                error: FetchError::Status {
                    status: 404,
                    url: record.url,
                },
            };
        }
        match Image::from_rgb(2, 2, vec![record.record_id as u8; 12]) {
            Ok(image) => FetchResult::Fetched {
                image,
                original_id: record.original_id,
            },
            Err(e) => FetchResult::Failed {
                original_id: record.original_id,
                url: record.url,
                error: FetchError::Resize(e.to_string()),
            },
        }
    }
}

fn sources(
    records: impl RecordResolver,
    labels: impl LabelResolver,
    fetcher: impl ImageFetcher,
) -> Sources {
    Sources {
        records: Arc::new(records),
        labels: Arc::new(labels),
        fetcher: Arc::new(fetcher),
    }
}

fn open(cfg: LoaderConfig, sources: Sources) -> Result<BatchSequence> {
    let _ = imgstream_observe::logging::try_init_tracing();
    Ok(BatchSequence::with_sampler(
        cfg,
        sources,
        IndexSampler::seeded(7),
    )?)
}

#[test]
fn full_batch_carries_one_indexed_labels() -> Result<()> {
    let mut seq = open(
        test_config(),
        sources(
            FixedResolver::default(),
            MapLabels::scenario(),
            MockFetcher::default(),
        ),
    )?;

    let batch = seq.get(0)?;
    assert_eq!(batch.len(), 4);
    assert_eq!(batch.original_ids, vec!["A", "B", "C", "D"]);
    let y: Vec<Vec<u8>> = batch.y.iter().map(|v| v.as_slice().to_vec()).collect();
    assert_eq!(y, vec![vec![1, 1, 0], vec![0, 0, 0], vec![0, 0, 1], vec![0, 0, 0]]);
    assert!(batch.x.iter().all(|img| (img.height, img.width) == (2, 2)));
    assert_eq!(batch.x_nhwc_u8().len(), 4 * 2 * 2 * 3);
    assert_eq!(batch.y_u8().len(), 4 * 3);

    seq.close();
    Ok(())
}

#[test]
fn failed_fetch_shrinks_the_batch() -> Result<()> {
    let fetcher = MockFetcher {
        failing_urls: HashSet::from(["mock://B".to_string()]),
        ..MockFetcher::default()
    };
    let mut seq = open(
        test_config(),
        sources(FixedResolver::default(), MapLabels::scenario(), fetcher),
    )?;
    let metrics = seq.metrics();

    for i in 0..3 {
        let batch = seq.get(i)?;
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.original_ids, vec!["A", "C", "D"]);
        assert_eq!(batch.y[0].as_slice(), &[1, 1, 0]);
        assert_eq!(batch.y[1].as_slice(), &[0, 0, 1]);
    }
    assert!(metrics.items_failed.get() >= 3);
    assert_eq!(metrics.samples_delivered.get(), 9);
    Ok(())
}

#[test]
fn fully_failed_windows_never_become_empty_batches() -> Result<()> {
    // One running group at a time, so the first two groups fail end to end.
    let cfg = LoaderConfig {
        pool_size: 1,
        ..test_config()
    };
    let fetcher = MockFetcher {
        fail_first: 8,
        ..MockFetcher::default()
    };
    let mut seq = open(
        cfg,
        sources(FixedResolver::default(), MapLabels::scenario(), fetcher),
    )?;
    let metrics = seq.metrics();

    for i in 0..3 {
        let batch = seq.get(i)?;
        assert_eq!(batch.len(), 4, "get({i}) returned a short batch");
        assert_eq!(batch.original_ids, vec!["A", "B", "C", "D"]);
    }
    assert_eq!(metrics.dropped_windows_discarded.get(), 2);
    assert_eq!(metrics.items_failed.get(), 8);
    Ok(())
}

#[test]
fn get_blocks_while_every_fetch_fails() -> Result<()> {
    let fetcher = MockFetcher {
        failing_urls: IDS.iter().map(|id| format!("mock://{id}")).collect(),
        ..MockFetcher::default()
    };
    let mut seq = open(
        test_config(),
        sources(FixedResolver::default(), MapLabels::scenario(), fetcher),
    )?;
    let metrics = seq.metrics();

    // The worker thread stays parked in the backoff loop; it is left behind on purpose.
    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(seq.get(0).map(|b| b.len()));
    });
    match rx.recv_timeout(Duration::from_millis(500)) {
        Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
        Ok(res) => panic!("get returned while every fetch fails: {res:?}"),
        Err(e) => panic!("worker thread ended unexpectedly: {e}"),
    }
    assert_eq!(metrics.batches_delivered.get(), 0);
    assert!(metrics.dropped_windows_discarded.get() >= 1);
    Ok(())
}

#[test]
fn label_store_failure_drops_group_but_later_gets_succeed() -> Result<()> {
    let labels = MapLabels {
        fail_first: 1,
        ..MapLabels::scenario()
    };
    let mut seq = open(
        test_config(),
        sources(FixedResolver::default(), labels, MockFetcher::default()),
    )?;
    let metrics = seq.metrics();

    for i in 0..3 {
        let batch = seq.get(i)?;
        assert_eq!(batch.len(), 4);
        assert_eq!(batch.y[0].as_slice(), &[1, 1, 0]);
    }
    assert!(metrics.label_groups_failed.get() >= 1);
    Ok(())
}

#[test]
fn resolver_outage_blocks_until_recovery() -> Result<()> {
    let cfg = LoaderConfig {
        pool_size: 1,
        lookahead_rounds: 1,
        ..test_config()
    };
    let resolver = Arc::new(FixedResolver {
        fail_first: 3,
        ..FixedResolver::default()
    });
    let sources = Sources {
        records: resolver.clone(),
        labels: Arc::new(MapLabels::scenario()),
        fetcher: Arc::new(MockFetcher::default()),
    };
    let mut seq = open(cfg, sources)?;
    let metrics = seq.metrics();

    let batch = seq.get(0)?;
    assert_eq!(batch.len(), 4);
    assert_eq!(metrics.resolve_rounds_failed.get(), 3);
    assert!(resolver.calls.load(Ordering::SeqCst) > 3);
    assert!(metrics.url_batches_resolved.get() >= 1);
    Ok(())
}

#[test]
fn empty_resolve_rounds_are_skipped() -> Result<()> {
    let resolver = FixedResolver {
        empty_first: 3,
        ..FixedResolver::default()
    };
    let mut seq = open(
        test_config(),
        sources(resolver, MapLabels::scenario(), MockFetcher::default()),
    )?;
    let batch = seq.get(0)?;
    assert_eq!(batch.original_ids, vec!["A", "B", "C", "D"]);
    Ok(())
}

#[test]
fn labels_stay_aligned_with_images() -> Result<()> {
    let cfg = LoaderConfig {
        download_chunks: 3,
        ..test_config()
    };
    let mut seq = open(
        cfg,
        sources(IndexedResolver, MapLabels::scenario(), MockFetcher::default()),
    )?;

    let expected_y: HashMap<&str, [u8; 3]> = HashMap::from([
        ("A", [1, 1, 0]),
        ("B", [0, 0, 0]),
        ("C", [0, 0, 1]),
        ("D", [0, 0, 0]),
    ]);
    for i in 0..5 {
        let batch = seq.get(i)?;
        assert_eq!(batch.len(), 4);
        assert_eq!(batch.x.len(), batch.y.len());
        for ((img, y), id) in batch.x.iter().zip(&batch.y).zip(&batch.original_ids) {
            let pixel_id = IDS[img.pixels[0] as usize];
            assert_eq!(pixel_id, id, "image and original id disagree");
            assert_eq!(y.as_slice(), &expected_y[id.as_str()][..]);
        }
    }
    Ok(())
}

#[test]
fn length_is_fixed_and_bounds_get() -> Result<()> {
    let mut seq = open(
        test_config(),
        sources(
            FixedResolver::default(),
            MapLabels::scenario(),
            MockFetcher::default(),
        ),
    )?;
    let metrics = seq.metrics();
    assert_eq!(seq.length(), 10);

    let err = seq.get(10).unwrap_err();
    assert!(matches!(
        err,
        SequenceError::IndexOutOfRange {
            index: 10,
            length: 10
        }
    ));
    assert_eq!(metrics.batches_delivered.get(), 0);

    // The index bounds the sequence but does not select data.
    let a = seq.get(9)?;
    let b = seq.get(9)?;
    assert_eq!(a.len(), b.len());
    assert_eq!(seq.length(), 10);
    assert_eq!(metrics.batches_delivered.get(), 2);
    Ok(())
}

#[test]
fn invalid_config_is_rejected() {
    let cfg = LoaderConfig {
        num_classes: 0,
        ..test_config()
    };
    let res = open(
        cfg,
        sources(
            FixedResolver::default(),
            MapLabels::scenario(),
            MockFetcher::default(),
        ),
    );
    assert!(res.is_err());
}

#[test]
fn close_does_not_wait_for_stuck_fetches() -> Result<()> {
    let fetcher = MockFetcher {
        hang: true,
        ..MockFetcher::default()
    };
    let seq = open(
        test_config(),
        sources(FixedResolver::default(), MapLabels::scenario(), fetcher),
    )?;
    let metrics = seq.metrics();
    assert!(metrics.fetch_groups_submitted.get() >= 1);
    assert_eq!(seq.ready_slots(), 0);

    let started = Instant::now();
    seq.close();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(metrics.pending_fetch_groups.get(), 0);
    Ok(())
}

#[test]
fn drop_tears_down_like_close() -> Result<()> {
    let fetcher = MockFetcher {
        hang: true,
        ..MockFetcher::default()
    };
    let seq = open(
        test_config(),
        sources(FixedResolver::default(), MapLabels::scenario(), fetcher),
    )?;
    let started = Instant::now();
    drop(seq);
    assert!(started.elapsed() < Duration::from_secs(2));
    Ok(())
}
