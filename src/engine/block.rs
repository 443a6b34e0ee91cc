//! Feature blocks: the CPU-resident unit of storage and GPU residency.
//!
//! A block holds up to `block_size / (dims * precision)` vectors of one set,
//! packed row-major in a host buffer, with a parallel ID array. Deleted slots
//! become tombstones (empty ID, zeroed bytes) and are reused by later inserts
//! before the high-water mark advances.
//!
//! Every mutation happens under the block's state mutex and bumps the atomic
//! version with release ordering; cores read the version with acquire
//! ordering to decide whether their resident device mirror is stale. A core
//! that copies the host buffer mid-mutation reads a self-consistent byte
//! image (buffer windows share an inner lock) and the version bump that
//! follows forces a refresh on the next search.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tracing::debug;

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::feature::{Feature, FeatureId};
use crate::util;

/// CPU-side authoritative storage for one slice of a set.
pub struct Block {
    index: usize,
    block_size: usize,
    version: AtomicU64,
    buffer: Buffer,
    state: Mutex<BlockState>,
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("index", &self.index)
            .field("block_size", &self.block_size)
            .field("version", &self.version.load(Ordering::Relaxed))
            .finish()
    }
}

#[derive(Default)]
struct BlockState {
    owner: Option<String>,
    dims: usize,
    precision: usize,
    batch: usize,
    ids: Vec<FeatureId>,
    empty: Vec<usize>,
    next_index: usize,
}

impl BlockState {
    fn slot_bytes(&self) -> usize {
        self.dims * self.precision
    }

    fn capacity(&self, block_size: usize) -> usize {
        let slot = self.slot_bytes();
        if slot == 0 {
            return 0;
        }
        block_size / slot
    }

    fn margin(&self, block_size: usize) -> usize {
        self.empty.len() + (self.capacity(block_size) - self.next_index)
    }
}

impl Block {
    pub fn new(index: usize, block_size: usize) -> Self {
        Self {
            index,
            block_size,
            version: AtomicU64::new(0),
            buffer: Buffer::host(block_size),
            state: Mutex::new(BlockState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BlockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stable ordinal of this block in the cache pool.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Fixed byte capacity of the host buffer.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// The host buffer holding the packed vectors. Cores copy from it during
    /// residency refresh; its windows share an inner lock, so the copy is a
    /// consistent snapshot even against a concurrent mutation.
    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    /// Current mutation counter (acquire ordering).
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn is_owned(&self) -> bool {
        self.lock().owner.is_some()
    }

    /// Name of the owning set, if any.
    pub fn owner(&self) -> Option<String> {
        self.lock().owner.clone()
    }

    /// Max number of vectors this block can hold; zero while free.
    pub fn capacity(&self) -> usize {
        self.lock().capacity(self.block_size)
    }

    /// Number of vectors that can still be inserted: reusable tombstones plus
    /// the untouched tail.
    pub fn margin(&self) -> usize {
        self.lock().margin(self.block_size)
    }

    /// Row count and vector shape for the search kernel: (next_index, dims,
    /// precision).
    pub fn shape(&self) -> (usize, usize, usize) {
        let state = self.lock();
        (state.next_index, state.dims, state.precision)
    }

    /// Feature IDs at the given slots; out-of-range slots yield the empty
    /// (tombstone) ID.
    pub fn ids_at(&self, indices: &[usize]) -> Vec<FeatureId> {
        let state = self.lock();
        indices
            .iter()
            .map(|&slot| {
                if slot < state.next_index {
                    state.ids[slot].clone()
                } else {
                    FeatureId::new()
                }
            })
            .collect()
    }

    /// Lease a free block to a set. The buffer is already zeroed from the
    /// previous release, so only the bookkeeping is initialized.
    pub fn acquire(&self, owner: &str, dims: usize, precision: usize, batch: usize) -> Result<()> {
        let mut state = self.lock();
        if let Some(current) = &state.owner {
            return Err(Error::BlockAlreadyUsed {
                index: self.index,
                owner: current.clone(),
            });
        }
        state.owner = Some(owner.to_string());
        state.dims = dims;
        state.precision = precision;
        state.batch = batch;
        state.ids = vec![FeatureId::new(); self.block_size / (dims * precision)];
        state.empty.clear();
        state.next_index = 0;
        self.version.store(0, Ordering::Release);
        debug!(
            block = self.index,
            owner, dims, precision, batch, "block acquired"
        );
        Ok(())
    }

    /// Insert features, filling reusable tombstone slots in stored order
    /// before appending at the high-water mark. One version bump covers the
    /// whole batch.
    pub fn insert(&self, features: &[Feature]) -> Result<()> {
        let mut state = self.lock();
        if features.len() > state.margin(self.block_size) {
            return Err(Error::BlockFull);
        }
        let slot_bytes = state.slot_bytes();

        let reuse = state.empty.len().min(features.len());
        for (feature, &slot) in features.iter().zip(state.empty.iter()) {
            let window = self
                .buffer
                .slice(slot * slot_bytes, (slot + 1) * slot_bytes)?;
            window.write(&feature.value)?;
        }
        for i in 0..reuse {
            let slot = state.empty[i];
            state.ids[slot] = features[i].id.clone();
        }

        if features.len() > reuse {
            let tail = util::pack_features(&features[reuse..]);
            let start = state.next_index * slot_bytes;
            let window = self.buffer.slice(start, start + tail.len())?;
            window.write(&tail)?;
            let base = state.next_index;
            for (i, feature) in features[reuse..].iter().enumerate() {
                state.ids[base + i] = feature.id.clone();
            }
            state.next_index += features.len() - reuse;
        }

        state.empty.drain(..reuse);
        self.version.fetch_add(1, Ordering::Release);
        Ok(())
    }

    /// Delete features by ID, returning the IDs actually removed. Unknown IDs
    /// are skipped. The version advances only when at least one slot was
    /// tombstoned.
    pub fn delete(&self, ids: &[FeatureId]) -> Result<Vec<FeatureId>> {
        let mut state = self.lock();
        let mut targets: HashMap<&str, Option<usize>> = ids
            .iter()
            .filter(|id| !id.is_empty())
            .map(|id| (id.as_str(), None))
            .collect();
        for (slot, id) in state.ids[..state.next_index].iter().enumerate() {
            if let Some(found) = targets.get_mut(id.as_str()) {
                *found = Some(slot);
            }
        }

        let found: Vec<(FeatureId, usize)> = targets
            .iter()
            .filter_map(|(id, slot)| slot.map(|s| (id.to_string(), s)))
            .collect();

        let slot_bytes = state.slot_bytes();
        let mut deleted = Vec::with_capacity(found.len());
        for (id, slot) in found {
            let window = self
                .buffer
                .slice(slot * slot_bytes, (slot + 1) * slot_bytes)?;
            window.reset()?;
            state.ids[slot] = FeatureId::new();
            state.empty.push(slot);
            deleted.push(id);
        }

        if !deleted.is_empty() {
            self.version.fetch_add(1, Ordering::Release);
        }
        Ok(deleted)
    }

    /// Rewrite the stored bytes of features whose ID is present, returning
    /// the IDs actually updated. Unknown IDs are skipped.
    pub fn update(&self, features: &[Feature]) -> Result<Vec<FeatureId>> {
        let state = self.lock();
        let slot_bytes = state.slot_bytes();
        let mut updated = Vec::new();
        for feature in features {
            let Some(slot) = state.ids[..state.next_index]
                .iter()
                .position(|id| *id == feature.id)
            else {
                continue;
            };
            let window = self
                .buffer
                .slice(slot * slot_bytes, (slot + 1) * slot_bytes)?;
            window.write(&feature.value)?;
            updated.push(feature.id.clone());
        }
        if !updated.is_empty() {
            self.version.fetch_add(1, Ordering::Release);
        }
        Ok(updated)
    }

    /// Read stored features by ID. Unknown IDs are skipped.
    pub fn read(&self, ids: &[FeatureId]) -> Result<Vec<Feature>> {
        let state = self.lock();
        let slot_bytes = state.slot_bytes();
        let mut features = Vec::new();
        for id in ids {
            let Some(slot) = state.ids[..state.next_index]
                .iter()
                .position(|stored| stored == id)
            else {
                continue;
            };
            let window = self
                .buffer
                .slice(slot * slot_bytes, (slot + 1) * slot_bytes)?;
            features.push(Feature::new(id.clone(), Bytes::from(window.read()?)));
        }
        Ok(features)
    }

    /// Return the block to the free pool: zero the buffer, drop all
    /// bookkeeping, reset the version.
    pub fn release(&self) -> Result<()> {
        let mut state = self.lock();
        self.buffer
            .reset()
            .map_err(|e| Error::ClearCudaBuffer(e.to_string()))?;
        let owner = state.owner.take();
        state.dims = 0;
        state.precision = 0;
        state.batch = 0;
        state.ids.clear();
        state.empty.clear();
        state.next_index = 0;
        self.version.store(0, Ordering::Release);
        debug!(block = self.index, owner = ?owner, "block released");
        Ok(())
    }
}
