//! Byte/numeric helpers shared across the engine.
//!
//! Feature values are opaque little-endian byte strings; everything here
//! converts between those bytes and typed scalars (via bytemuck, so no copies
//! where alignment allows), reshapes batched values, and runs the bounded
//! top-N selections used by the search path.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use bytes::{BufMut, Bytes, BytesMut};
use half::f16;

use crate::error::{Error, Result};
use crate::feature::{Feature, FeatureValue, SearchResult};

/// Concatenate feature values into one contiguous byte string, in order.
pub fn pack_features(features: &[Feature]) -> FeatureValue {
    let total = features.iter().map(|f| f.value.len()).sum();
    let mut packed = BytesMut::with_capacity(total);
    for feature in features {
        packed.put_slice(&feature.value);
    }
    packed.freeze()
}

/// Concatenate raw values into one contiguous byte string, in order.
pub fn pack_values(values: &[FeatureValue]) -> FeatureValue {
    let total = values.iter().map(|v| v.len()).sum();
    let mut packed = BytesMut::with_capacity(total);
    for value in values {
        packed.put_slice(value);
    }
    packed.freeze()
}

/// Transpose a batch of equal-length values from row-major (one value per
/// row) to column-major (scalar i of every value, then scalar i+1, ...),
/// preserving `precision`-byte scalars intact.
///
/// The search path never calls this: its SGEMM consumes queries as a d x b
/// column-major matrix, which plain concatenation already produces (see
/// `Manager::search`). Kept crate-private as the building block the
/// alternative row-major (b x d, opB=Trans) query layout would need.
#[allow(dead_code)]
pub(crate) fn transpose_values(precision: usize, values: &[FeatureValue]) -> Result<FeatureValue> {
    if values.is_empty() {
        return Ok(Bytes::new());
    }
    if precision == 0 || values[0].len() % precision != 0 {
        return Err(Error::BadTransposeValue);
    }
    let cols = values[0].len() / precision;
    let rows = values.len();
    if values.iter().any(|v| v.len() != cols * precision) {
        return Err(Error::BadTransposeValue);
    }

    let mut out = vec![0u8; cols * rows * precision];
    for (row, value) in values.iter().enumerate() {
        for col in 0..cols {
            let dst = (col * rows + row) * precision;
            let src = col * precision;
            out[dst..dst + precision].copy_from_slice(&value[src..src + precision]);
        }
    }
    Ok(Bytes::from(out))
}

/// Reinterpret float32 scalars as a little-endian feature value.
pub fn value_of_f32(components: &[f32]) -> FeatureValue {
    Bytes::copy_from_slice(bytemuck::cast_slice(components))
}

/// Reinterpret float16 scalars as a little-endian feature value.
pub fn value_of_f16(components: &[f16]) -> FeatureValue {
    Bytes::copy_from_slice(bytemuck::cast_slice(components))
}

/// Reinterpret float64 scalars as a little-endian feature value.
pub fn value_of_f64(components: &[f64]) -> FeatureValue {
    Bytes::copy_from_slice(bytemuck::cast_slice(components))
}

/// Read a feature value back as float32 scalars.
pub fn f32_of_value(value: &[u8]) -> Result<Vec<f32>> {
    if value.len() % 4 != 0 {
        return Err(Error::InvalidBufferData { precision: 4 });
    }
    Ok(bytemuck::pod_collect_to_vec(value))
}

#[derive(PartialEq)]
struct ScoredIndex {
    score: f32,
    index: usize,
}

impl Eq for ScoredIndex {}

impl PartialOrd for ScoredIndex {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScoredIndex {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.index.cmp(&self.index))
    }
}

/// Select the `limit` highest scores, returning `(index, score)` pairs in
/// descending score order. A bounded min-heap: a candidate only displaces the
/// current minimum once the heap is full.
pub fn top_n_scores(scores: &[f32], limit: usize) -> Vec<(usize, f32)> {
    if limit == 0 {
        return Vec::new();
    }
    let mut heap: BinaryHeap<Reverse<ScoredIndex>> =
        BinaryHeap::with_capacity(limit.min(scores.len()));
    for (index, &score) in scores.iter().enumerate() {
        if heap.len() < limit {
            heap.push(Reverse(ScoredIndex { score, index }));
        } else if heap.peek().is_some_and(|min| score > min.0.score) {
            heap.pop();
            heap.push(Reverse(ScoredIndex { score, index }));
        }
    }
    let mut top: Vec<(usize, f32)> = heap
        .into_iter()
        .map(|Reverse(entry)| (entry.index, entry.score))
        .collect();
    top.sort_by(|a, b| b.1.total_cmp(&a.1));
    top
}

/// Select the `limit` best results by descending score.
pub fn top_n_results(results: Vec<SearchResult>, limit: usize) -> Vec<SearchResult> {
    let scores: Vec<f32> = results.iter().map(|r| r.score).collect();
    top_n_scores(&scores, limit)
        .into_iter()
        .map(|(index, _)| results[index].clone())
        .collect()
}

/// L2-normalize a vector. The zero vector normalizes to zeros.
pub fn normalize(components: &[f32]) -> Vec<f32> {
    let norm = components.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm == 0.0 {
        return vec![0.0; components.len()];
    }
    components.iter().map(|v| v / norm).collect()
}
