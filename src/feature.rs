//! Feature vector types.
//!
//! A feature is an opaque little-endian byte value of `dims * precision`
//! bytes plus a string ID unique within its set. The empty ID is reserved:
//! block slot arrays use it as the tombstone marker, so it is rejected at
//! the API boundary.

use bytes::Bytes;

/// Unique (per set) feature identifier. The empty string is reserved as the
/// block-slot tombstone.
pub type FeatureId = String;

/// Similarity score, the raw SGEMM dot product.
pub type FeatureScore = f32;

/// Feature vector bytes, little-endian, `dims * precision` long.
pub type FeatureValue = Bytes;

/// A vector with its identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    /// Unique index of the feature within its set.
    pub id: FeatureId,

    /// Vector bytes, `dims * precision` long.
    pub value: FeatureValue,
}

impl Feature {
    pub fn new(id: impl Into<FeatureId>, value: FeatureValue) -> Self {
        Self {
            id: id.into(),
            value,
        }
    }

    /// Build a float32 feature from scalar components.
    pub fn from_f32(id: impl Into<FeatureId>, components: &[f32]) -> Self {
        Self::new(id, crate::util::value_of_f32(components))
    }
}

/// One search hit: score and matched feature ID.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    /// Confidence of the match.
    pub score: FeatureScore,

    /// Matched feature ID.
    pub id: FeatureId,
}
