use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::FetchError;

/// Position in `[0, total_samples)` of a partition. Generated per sampling round.
pub type SampleIndex = u64;

/// Positive label ids (1-indexed) for one image.
pub type LabelSet = BTreeSet<u32>;

/// Decoded images are always packed RGB.
pub const IMAGE_CHANNELS: usize = 3;

/// One row of a partition in the index store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordRef {
    pub record_id: u64,
    pub url: String,
    pub original_id: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordRefError {
    #[error("url must be non-empty")]
    EmptyUrl,
    #[error("original_id must be non-empty")]
    EmptyOriginalId,
}

impl RecordRef {
    pub fn validate(&self) -> Result<(), RecordRefError> {
        if self.url.trim().is_empty() {
            return Err(RecordRefError::EmptyUrl);
        }
        if self.original_id.trim().is_empty() {
            return Err(RecordRefError::EmptyOriginalId);
        }
        Ok(())
    }
}

/// A fixed-size `height x width x 3` RGB image, row-major (HWC).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub height: u32,
    pub width: u32,
    pub pixels: Arc<[u8]>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("rgb buffer of {len} bytes does not match {height}x{width}x3")]
pub struct ImageShapeError {
    pub height: u32,
    pub width: u32,
    pub len: usize,
}

impl Image {
    pub fn from_rgb(height: u32, width: u32, pixels: Vec<u8>) -> Result<Self, ImageShapeError> {
        let expected = (height as usize)
            .checked_mul(width as usize)
            .and_then(|px| px.checked_mul(IMAGE_CHANNELS));
        if expected != Some(pixels.len()) {
            return Err(ImageShapeError {
                height,
                width,
                len: pixels.len(),
            });
        }
        Ok(Self {
            height,
            width,
            pixels: Arc::from(pixels),
        })
    }

    pub fn byte_len(&self) -> usize {
        self.pixels.len()
    }
}

/// Outcome of fetching one record. Failures never abort sibling fetches.
#[derive(Debug, Clone)]
pub enum FetchResult {
    Fetched {
        image: Image,
        original_id: String,
    },
    Failed {
        original_id: String,
        url: String,
        error: FetchError,
    },
}

impl FetchResult {
    pub fn original_id(&self) -> &str {
        match self {
            FetchResult::Fetched { original_id, .. } | FetchResult::Failed { original_id, .. } => {
                original_id
            }
        }
    }

    pub fn is_fetched(&self) -> bool {
        matches!(self, FetchResult::Fetched { .. })
    }
}

/// A decoded image joined with its positive labels, waiting in the ready buffer.
#[derive(Debug, Clone)]
pub struct ReadyItem {
    pub image: Image,
    pub original_id: String,
    pub labels: LabelSet,
}

/// Binary multi-label target of `num_classes` entries.
///
/// Entry `k` is 1 iff label id `k + 1` is in the positive set; ids outside
/// `1..=num_classes` are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelVector(Vec<u8>);

impl LabelVector {
    pub fn from_labels(labels: &LabelSet, num_classes: usize) -> Self {
        let mut v = vec![0u8; num_classes];
        for &label in labels {
            let Some(pos) = (label as usize).checked_sub(1) else {
                continue;
            };
            if let Some(slot) = v.get_mut(pos) {
                *slot = 1;
            }
        }
        Self(v)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn positives(&self) -> usize {
        self.0.iter().filter(|&&b| b == 1).count()
    }
}

impl From<LabelVector> for Vec<u8> {
    fn from(v: LabelVector) -> Self {
        v.0
    }
}

/// The unit of delivery to the training loop.
///
/// Invariant: `x`, `y` and `original_ids` have equal length and `x[i]`, `y[i]` describe
/// the same fetched image.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub x: Vec<Image>,
    pub y: Vec<LabelVector>,
    pub original_ids: Vec<String>,
}

impl Batch {
    pub fn from_items(items: Vec<ReadyItem>, num_classes: usize) -> Self {
        let mut batch = Batch {
            x: Vec::with_capacity(items.len()),
            y: Vec::with_capacity(items.len()),
            original_ids: Vec::with_capacity(items.len()),
        };
        for item in items {
            batch.y.push(LabelVector::from_labels(&item.labels, num_classes));
            batch.x.push(item.image);
            batch.original_ids.push(item.original_id);
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    /// Concatenates `x` into one NHWC u8 buffer.
    pub fn x_nhwc_u8(&self) -> Vec<u8> {
        let total = self.x.iter().map(Image::byte_len).sum();
        let mut out = Vec::with_capacity(total);
        for image in &self.x {
            out.extend_from_slice(&image.pixels);
        }
        out
    }

    /// Concatenates `y` into one row-major `len x num_classes` buffer.
    pub fn y_u8(&self) -> Vec<u8> {
        self.y
            .iter()
            .flat_map(|v| v.as_slice().iter().copied())
            .collect()
    }
}
