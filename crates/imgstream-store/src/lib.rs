#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod fs;

use std::collections::HashMap;

use imgstream_core::error::{LabelStoreError, ResolutionError};
use imgstream_core::types::{LabelSet, RecordRef, SampleIndex};

/// v0 on-disk schema version for index and label TSV files.
pub const STORE_SCHEMA_VERSION: u32 = 0;

/// Table holding `(id, original_image_id, label_id, confidence)` rows.
pub const LABELS_TABLE: &str = "image_labels";

/// Resolves sampled indices of a partition to fetchable records. Pure local lookup.
///
/// - Empty `indices` resolve to an empty vector.
/// - Indices with no row are skipped; repeated indices resolve once.
/// - Any store access failure fails the whole call; no partial results.
pub trait RecordResolver: Send + Sync + 'static {
    fn resolve(
        &self,
        indices: &[SampleIndex],
        partition: &str,
    ) -> Result<Vec<RecordRef>, ResolutionError>;
}

/// Looks up confirmed-positive labels (confidence exactly 1.0) per original image id.
///
/// Ids without a qualifying row are absent from the returned map and mean "no labels".
pub trait LabelResolver: Send + Sync + 'static {
    fn positive_labels(
        &self,
        original_ids: &[String],
    ) -> Result<HashMap<String, LabelSet>, LabelStoreError>;
}

fn validate_table_name(value: &str) -> bool {
    if value.trim().is_empty() {
        return false;
    }
    if value.contains('/') || value.contains('\\') {
        return false;
    }
    if value.contains("..") {
        return false;
    }
    true
}

/// Strips the `schema_version=<n>` header and returns the remaining lines with their
/// 1-based line numbers.
fn body_lines(s: &str) -> Result<Vec<(usize, &str)>, String> {
    let mut lines = s.lines().enumerate();
    let first = lines
        .by_ref()
        .find(|(_, l)| !l.trim().is_empty())
        .map(|(_, l)| l)
        .ok_or_else(|| "empty table".to_string())?;

    let Some((k, v)) = first.split_once('=') else {
        return Err("header missing schema_version".to_string());
    };
    if k.trim() != "schema_version" {
        return Err("header must be schema_version=<n>".to_string());
    }
    let schema_version: u32 = v
        .trim()
        .parse()
        .map_err(|_| "invalid schema_version".to_string())?;
    if schema_version != STORE_SCHEMA_VERSION {
        return Err(format!("unsupported schema_version {schema_version}"));
    }

    Ok(lines
        .map(|(i, l)| (i + 1, l.trim()))
        .filter(|(_, l)| !l.is_empty() && !l.starts_with('#'))
        .collect())
}

/// Parses a partition table: `id<TAB>url<TAB>original_image_id`.
pub fn parse_index_tsv(bytes: &[u8]) -> Result<Vec<RecordRef>, String> {
    let s = std::str::from_utf8(bytes).map_err(|e| format!("index table not utf-8: {e}"))?;
    let mut records = Vec::new();
    for (line_no, line) in body_lines(s)? {
        let cols: Vec<&str> = line.split('\t').collect();
        if cols.len() != 3 {
            return Err(format!("line {line_no}: expected 3 columns"));
        }
        let record_id: u64 = cols[0]
            .trim()
            .parse()
            .map_err(|_| format!("line {line_no}: bad id"))?;
        let record = RecordRef {
            record_id,
            url: cols[1].trim().to_string(),
            original_id: cols[2].trim().to_string(),
        };
        record
            .validate()
            .map_err(|e| format!("line {line_no}: {e}"))?;
        records.push(record);
    }
    Ok(records)
}

/// One row of the labels table.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelRow {
    pub id: u64,
    pub original_id: String,
    pub label_id: u32,
    pub confidence: f64,
}

impl LabelRow {
    pub fn is_confirmed_positive(&self) -> bool {
        self.confidence == 1.0
    }
}

/// Parses the labels table: `id<TAB>original_image_id<TAB>label_id<TAB>confidence`.
pub fn parse_labels_tsv(bytes: &[u8]) -> Result<Vec<LabelRow>, String> {
    let s = std::str::from_utf8(bytes).map_err(|e| format!("labels table not utf-8: {e}"))?;
    let mut rows = Vec::new();
    for (line_no, line) in body_lines(s)? {
        let cols: Vec<&str> = line.split('\t').collect();
        if cols.len() != 4 {
            return Err(format!("line {line_no}: expected 4 columns"));
        }
        let id: u64 = cols[0]
            .trim()
            .parse()
            .map_err(|_| format!("line {line_no}: bad id"))?;
        let original_id = cols[1].trim().to_string();
        if original_id.is_empty() {
            return Err(format!("line {line_no}: empty original_image_id"));
        }
        let label_id: u32 = cols[2]
            .trim()
            .parse()
            .map_err(|_| format!("line {line_no}: bad label_id"))?;
        let confidence: f64 = cols[3]
            .trim()
            .parse()
            .map_err(|_| format!("line {line_no}: bad confidence"))?;
        rows.push(LabelRow {
            id,
            original_id,
            label_id,
            confidence,
        });
    }
    Ok(rows)
}
