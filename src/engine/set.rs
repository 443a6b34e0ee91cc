//! Named feature sets: ordered lists of owned blocks.
//!
//! A set routes feature operations across the blocks it leases from the
//! cache, acquiring more only when the summed margin cannot absorb an add.
//! Structural changes (growing or releasing the block list) are single-writer
//! under the set mutex; a search takes a snapshot of the list at entry and
//! makes no guarantee about blocks appended while it is in flight.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::engine::block::Block;
use crate::engine::cache::Cache;
use crate::error::{Error, Result};
use crate::feature::{Feature, FeatureId};

pub struct Set {
    name: String,
    dims: usize,
    precision: usize,
    batch: AtomicUsize,
    /// Vectors per block at this set's shape.
    block_feature_num: usize,
    cache: Arc<Cache>,
    blocks: Mutex<Vec<Arc<Block>>>,
}

impl Set {
    pub fn new(
        name: impl Into<String>,
        dims: usize,
        precision: usize,
        batch: usize,
        cache: Arc<Cache>,
    ) -> Self {
        let block_feature_num = cache.block_size() / (dims * precision);
        Self {
            name: name.into(),
            dims,
            precision,
            batch: AtomicUsize::new(batch),
            block_feature_num,
            cache,
            blocks: Mutex::new(Vec::new()),
        }
    }

    fn lock_blocks(&self) -> MutexGuard<'_, Vec<Arc<Block>>> {
        self.blocks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn precision(&self) -> usize {
        self.precision
    }

    pub fn batch(&self) -> usize {
        self.batch.load(Ordering::Relaxed)
    }

    pub fn set_batch(&self, batch: usize) {
        self.batch.store(batch, Ordering::Relaxed);
    }

    /// The block list as of now; searches fan out over this snapshot.
    pub fn blocks_snapshot(&self) -> Vec<Arc<Block>> {
        self.lock_blocks().clone()
    }

    fn expected_value_len(&self) -> usize {
        self.dims * self.precision
    }

    fn validate(&self, features: &[Feature]) -> Result<()> {
        for feature in features {
            if feature.id.is_empty() {
                return Err(Error::InvalidFeatures(
                    "feature id must not be empty".to_string(),
                ));
            }
            if feature.value.len() != self.expected_value_len() {
                return Err(Error::MismatchDimension {
                    got: feature.value.len(),
                    expected: self.expected_value_len(),
                });
            }
        }
        Ok(())
    }

    /// Add features, growing the block list from the cache when the summed
    /// margin of the current blocks cannot hold them all.
    pub fn add(&self, features: &[Feature]) -> Result<()> {
        self.validate(features)?;

        let mut blocks = self.lock_blocks();
        let margin: usize = blocks.iter().map(|b| b.margin()).sum();

        if features.len() > margin {
            let remain = features.len() - margin;
            let needed = remain.div_ceil(self.block_feature_num);
            let fresh = self.cache.get_empty_blocks(needed)?;
            for block in &fresh {
                block.acquire(
                    &self.name,
                    self.dims,
                    self.precision,
                    self.batch(),
                )?;
            }
            debug!(
                set = %self.name,
                acquired = fresh.len(),
                total = blocks.len() + fresh.len(),
                "set grew"
            );
            blocks.extend(fresh);
        }

        let mut offset = 0;
        for block in blocks.iter() {
            if offset == features.len() {
                break;
            }
            let take = block.margin().min(features.len() - offset);
            if take > 0 {
                block.insert(&features[offset..offset + take])?;
                offset += take;
            }
        }
        Ok(())
    }

    /// Delete features by ID across the blocks, in block order, stopping as
    /// soon as everything requested has been found. Returns the IDs actually
    /// deleted; unknown IDs are silently skipped.
    pub fn delete(&self, ids: &[FeatureId]) -> Result<Vec<FeatureId>> {
        let blocks = self.blocks_snapshot();
        let mut pending: Vec<FeatureId> = ids.to_vec();
        let mut deleted = Vec::new();
        for block in blocks {
            if pending.is_empty() {
                break;
            }
            let removed = block.delete(&pending)?;
            if removed.is_empty() {
                continue;
            }
            pending.retain(|id| !removed.contains(id));
            deleted.extend(removed);
        }
        Ok(deleted)
    }

    /// Rewrite existing features in place. Returns the IDs actually updated;
    /// unknown IDs are silently skipped.
    pub fn update(&self, features: &[Feature]) -> Result<Vec<FeatureId>> {
        self.validate(features)?;

        let blocks = self.blocks_snapshot();
        let mut pending: Vec<Feature> = features.to_vec();
        let mut updated = Vec::new();
        for block in blocks {
            if pending.is_empty() {
                break;
            }
            let done = block.update(&pending)?;
            if done.is_empty() {
                continue;
            }
            pending.retain(|f| !done.contains(&f.id));
            updated.extend(done);
        }
        Ok(updated)
    }

    /// Read stored features back by ID. Unknown IDs are silently skipped.
    pub fn read(&self, ids: &[FeatureId]) -> Result<Vec<Feature>> {
        let blocks = self.blocks_snapshot();
        let mut pending: Vec<FeatureId> = ids.to_vec();
        let mut features = Vec::new();
        for block in blocks {
            if pending.is_empty() {
                break;
            }
            let found = block.read(&pending)?;
            if found.is_empty() {
                continue;
            }
            pending.retain(|id| !found.iter().any(|f| &f.id == id));
            features.extend(found);
        }
        Ok(features)
    }

    /// Release every owned block back to the pool.
    pub fn destroy(&self) -> Result<()> {
        let mut blocks = self.lock_blocks();
        for block in blocks.iter() {
            block.release()?;
        }
        let released = blocks.len();
        blocks.clear();
        debug!(set = %self.name, released, "set destroyed");
        Ok(())
    }
}
