//! Block allocation service.
//!
//! The compactor never touches physical blocks directly; it goes through the
//! [`BlockAllocator`] trait. [`PagedBlockAllocator`] is a free-list reference
//! implementation with O(1) per-block alloc/free.

use std::collections::{HashMap, VecDeque};

use thiserror::Error;
use tracing::debug;

use crate::cache::block::{BlockTable, PhysicalBlockId, Sequence, SequenceId};
use crate::cache::slot_mapping::blocks_needed;
use crate::config::CacheConfig;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocatorError {
    #[error("Out of KV blocks: need {needed}, {free} free")]
    OutOfBlocks { needed: usize, free: usize },

    #[error("Block {0} does not belong to this allocator")]
    InvalidBlock(PhysicalBlockId),

    #[error("Unsupported allocation: {0}")]
    Unsupported(&'static str),
}

/// The block-allocation service consumed by the compactor.
pub trait BlockAllocator {
    /// Tokens per block. Must match the compactor's configured block size.
    fn block_size(&self) -> usize;

    /// Current block table for a sequence, if it has one.
    fn get_block_table(&self, seq_id: SequenceId) -> Option<BlockTable>;

    /// Return every block of `table` to the free pool.
    fn free_block_table(&mut self, table: &BlockTable) -> Result<(), AllocatorError>;

    /// Allocate a fresh table sized to the sequence's current logical length.
    fn allocate_block_table(
        &mut self,
        seq: &Sequence,
        is_multi_output: bool,
        is_encoder_decoder: bool,
    ) -> Result<BlockTable, AllocatorError>;

    /// Install `table` as the sequence's block table.
    fn set_block_table(&mut self, seq_id: SequenceId, table: BlockTable);
}

/// Free-list allocator over a fixed pool of physical blocks.
#[derive(Debug)]
pub struct PagedBlockAllocator {
    /// Tokens per block.
    block_size: usize,

    /// Total number of physical blocks.
    total_blocks: usize,

    /// Free block IDs.
    free_list: VecDeque<PhysicalBlockId>,

    /// Installed block tables by sequence.
    tables: HashMap<SequenceId, BlockTable>,
}

impl PagedBlockAllocator {
    pub fn new(block_size: usize, total_blocks: usize) -> Self {
        let free_list = (0..total_blocks as PhysicalBlockId).collect();

        Self {
            block_size,
            total_blocks,
            free_list,
            tables: HashMap::new(),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.block_size, config.num_blocks)
    }

    /// Allocate and install a table for a new sequence.
    pub fn allocate_sequence(&mut self, seq: &Sequence) -> Result<BlockTable, AllocatorError> {
        let table = self.allocate_block_table(seq, false, false)?;
        self.set_block_table(seq.seq_id, table.clone());
        Ok(table)
    }

    /// Grow a sequence's table so it covers `seq.len()` tokens.
    pub fn append_slots(&mut self, seq: &Sequence) -> Result<(), AllocatorError> {
        let needed = blocks_needed(seq.len(), self.block_size);
        let have = self.tables.get(&seq.seq_id).map(|t| t.len()).unwrap_or(0);
        if needed <= have {
            return Ok(());
        }
        let extra = self.take_blocks(needed - have)?;
        let block_size = self.block_size;
        let table = self
            .tables
            .entry(seq.seq_id)
            .or_insert_with(|| BlockTable::new(seq.seq_id, block_size));
        table.blocks.extend(extra);
        Ok(())
    }

    fn take_blocks(&mut self, count: usize) -> Result<Vec<PhysicalBlockId>, AllocatorError> {
        if self.free_list.len() < count {
            return Err(AllocatorError::OutOfBlocks {
                needed: count,
                free: self.free_list.len(),
            });
        }
        Ok(self.free_list.drain(..count).collect())
    }

    /// Number of free blocks.
    pub fn num_free_blocks(&self) -> usize {
        self.free_list.len()
    }

    /// Number of allocated blocks.
    pub fn num_allocated_blocks(&self) -> usize {
        self.total_blocks - self.free_list.len()
    }

    /// Fraction of the pool in use.
    pub fn utilization(&self) -> f64 {
        if self.total_blocks == 0 {
            return 0.0;
        }
        self.num_allocated_blocks() as f64 / self.total_blocks as f64
    }
}

impl BlockAllocator for PagedBlockAllocator {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn get_block_table(&self, seq_id: SequenceId) -> Option<BlockTable> {
        self.tables.get(&seq_id).cloned()
    }

    fn free_block_table(&mut self, table: &BlockTable) -> Result<(), AllocatorError> {
        if let Some(bad) = table
            .blocks
            .iter()
            .find(|&&id| id >= self.total_blocks as PhysicalBlockId)
        {
            return Err(AllocatorError::InvalidBlock(*bad));
        }

        self.free_list.extend(table.blocks.iter().copied());
        if self
            .tables
            .get(&table.sequence_id)
            .is_some_and(|installed| installed.blocks == table.blocks)
        {
            self.tables.remove(&table.sequence_id);
        }

        debug!(
            seq_id = table.sequence_id,
            blocks = table.len(),
            free = self.free_list.len(),
            "Freed block table"
        );
        Ok(())
    }

    fn allocate_block_table(
        &mut self,
        seq: &Sequence,
        is_multi_output: bool,
        is_encoder_decoder: bool,
    ) -> Result<BlockTable, AllocatorError> {
        if is_encoder_decoder {
            return Err(AllocatorError::Unsupported("encoder-decoder cross-attention tables"));
        }

        let needed = blocks_needed(seq.len(), self.block_size);
        let blocks = self.take_blocks(needed)?;

        debug!(
            seq_id = seq.seq_id,
            tokens = seq.len(),
            blocks = needed,
            is_multi_output,
            "Allocated block table"
        );

        Ok(BlockTable {
            sequence_id: seq.seq_id,
            blocks,
            block_size: self.block_size,
        })
    }

    fn set_block_table(&mut self, seq_id: SequenceId, table: BlockTable) {
        self.tables.insert(seq_id, table);
    }
}
