use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use imgstream_core::error::{LabelStoreError, ResolutionError};
use imgstream_core::types::{LabelSet, RecordRef, SampleIndex};

use crate::{
    parse_index_tsv, parse_labels_tsv, validate_table_name, LabelResolver, RecordResolver,
    LABELS_TABLE,
};

type PartitionIndex = HashMap<u64, RecordRef>;

/// Index store with one `<partition>.tsv` table per partition under `root`.
///
/// Tables are loaded on first use and cached. A failed load is not cached, so a store
/// that becomes readable later is picked up by the next lookup.
#[derive(Debug)]
pub struct FsIndexStore {
    root: PathBuf,
    partitions: Mutex<HashMap<String, Arc<PartitionIndex>>>,
}

impl FsIndexStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            partitions: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn partition_path(&self, partition: &str) -> Result<PathBuf, ResolutionError> {
        if !validate_table_name(partition) {
            return Err(ResolutionError::InvalidPartition(partition.to_string()));
        }
        Ok(self.root.join(format!("{partition}.tsv")))
    }

    fn partition(&self, partition: &str) -> Result<Arc<PartitionIndex>, ResolutionError> {
        {
            let cache = self
                .partitions
                .lock()
                .map_err(|_| ResolutionError::Worker("index cache mutex poisoned".to_string()))?;
            if let Some(index) = cache.get(partition) {
                return Ok(index.clone());
            }
        }

        let path = self.partition_path(partition)?;
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(ResolutionError::UnknownPartition(partition.to_string()));
            }
            Err(err) => return Err(ResolutionError::Io(err)),
        };
        let records = parse_index_tsv(&bytes)
            .map_err(|e| ResolutionError::Corrupt(format!("{}: {e}", path.display())))?;

        let mut index = PartitionIndex::with_capacity(records.len());
        for record in records {
            let id = record.record_id;
            if index.insert(id, record).is_some() {
                return Err(ResolutionError::Corrupt(format!(
                    "{}: duplicate id {id}",
                    path.display()
                )));
            }
        }
        let index = Arc::new(index);

        tracing::debug!(
            target: "imgstream_pipeline",
            event = "partition_loaded",
            partition = %partition,
            rows = index.len() as u64,
            "loaded index partition"
        );

        let mut cache = self
            .partitions
            .lock()
            .map_err(|_| ResolutionError::Worker("index cache mutex poisoned".to_string()))?;
        Ok(cache
            .entry(partition.to_string())
            .or_insert(index)
            .clone())
    }
}

impl RecordResolver for FsIndexStore {
    fn resolve(
        &self,
        indices: &[SampleIndex],
        partition: &str,
    ) -> Result<Vec<RecordRef>, ResolutionError> {
        if indices.is_empty() {
            return Ok(Vec::new());
        }
        let index = self.partition(partition)?;

        let mut seen = HashSet::with_capacity(indices.len());
        let mut out = Vec::with_capacity(indices.len());
        for id in indices {
            if !seen.insert(*id) {
                continue;
            }
            if let Some(record) = index.get(id) {
                out.push(record.clone());
            }
        }
        Ok(out)
    }
}

/// Label store backed by `<root>/image_labels.tsv`.
///
/// Only confirmed positives are kept in memory; the table is loaded on first use.
#[derive(Debug)]
pub struct FsLabelStore {
    root: PathBuf,
    positives: Mutex<Option<Arc<HashMap<String, LabelSet>>>>,
}

impl FsLabelStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            positives: Mutex::new(None),
        }
    }

    pub fn table_path(&self) -> PathBuf {
        self.root.join(format!("{LABELS_TABLE}.tsv"))
    }

    fn positives(&self) -> Result<Arc<HashMap<String, LabelSet>>, LabelStoreError> {
        {
            let cached = self
                .positives
                .lock()
                .map_err(|_| LabelStoreError::Corrupt("label cache mutex poisoned".to_string()))?;
            if let Some(map) = cached.as_ref() {
                return Ok(map.clone());
            }
        }

        let path = self.table_path();
        let bytes = std::fs::read(&path)?;
        let rows = parse_labels_tsv(&bytes)
            .map_err(|e| LabelStoreError::Corrupt(format!("{}: {e}", path.display())))?;

        let mut map: HashMap<String, LabelSet> = HashMap::new();
        let mut kept: u64 = 0;
        for row in rows.into_iter().filter(|r| r.is_confirmed_positive()) {
            map.entry(row.original_id).or_default().insert(row.label_id);
            kept += 1;
        }
        let map = Arc::new(map);

        tracing::debug!(
            target: "imgstream_pipeline",
            event = "labels_loaded",
            positive_rows = kept,
            images = map.len() as u64,
            "loaded label table"
        );

        let mut cached = self
            .positives
            .lock()
            .map_err(|_| LabelStoreError::Corrupt("label cache mutex poisoned".to_string()))?;
        Ok(cached.get_or_insert(map).clone())
    }
}

impl LabelResolver for FsLabelStore {
    fn positive_labels(
        &self,
        original_ids: &[String],
    ) -> Result<HashMap<String, LabelSet>, LabelStoreError> {
        if original_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let positives = self.positives()?;
        Ok(original_ids
            .iter()
            .filter_map(|id| positives.get(id).map(|set| (id.clone(), set.clone())))
            .collect())
    }
}
