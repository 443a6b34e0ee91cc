//! The block pool: every host block a manager owns, constructed up front.
//!
//! The cache hands out free blocks in index order and otherwise stays out of
//! the way: ownership lives on the blocks themselves, so the pool needs no
//! per-set bookkeeping. The scan lock only serializes concurrent free-block
//! scans; a set that loses the follow-up acquire race gets `BlockAlreadyUsed`
//! from the block itself.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::info;

use crate::engine::block::Block;
use crate::error::{Error, Result};

pub struct Cache {
    blocks: Vec<Arc<Block>>,
    block_size: usize,
    scan: Mutex<()>,
}

impl Cache {
    pub fn new(block_num: usize, block_size: usize) -> Self {
        let blocks = (0..block_num)
            .map(|index| Arc::new(Block::new(index, block_size)))
            .collect();
        info!(
            blocks = block_num,
            block_size,
            total_bytes = block_num * block_size,
            "block cache initialized"
        );
        Self {
            blocks,
            block_size,
            scan: Mutex::new(()),
        }
    }

    /// Byte capacity of every block in the pool.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// All blocks, in index order.
    pub fn blocks(&self) -> &[Arc<Block>] {
        &self.blocks
    }

    /// Number of currently unowned blocks.
    pub fn free_blocks(&self) -> usize {
        self.blocks.iter().filter(|b| !b.is_owned()).count()
    }

    /// The first `n` unowned blocks in index order. The returned blocks are
    /// not yet owned; the caller must acquire each one.
    pub fn get_empty_blocks(&self, n: usize) -> Result<Vec<Arc<Block>>> {
        let _scan = self.scan.lock().unwrap_or_else(PoisonError::into_inner);
        let free: Vec<Arc<Block>> = self
            .blocks
            .iter()
            .filter(|block| !block.is_owned())
            .cloned()
            .collect();
        if free.len() < n {
            return Err(Error::NotEnoughBlocks {
                requested: n,
                free: free.len(),
            });
        }
        Ok(free.into_iter().take(n).collect())
    }
}
