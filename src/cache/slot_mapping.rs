//! Slot mapping: per-token physical slot indices derived from a block table.
//!
//! ```text
//! slot[i] = block_table[i / block_size] * block_size + (i % block_size)
//! ```

use thiserror::Error;

use crate::cache::block::{PhysicalBlockId, SlotMapping};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SlotMappingError {
    #[error("invalid argument: block size must be at least 1")]
    ZeroBlockSize,

    #[error("invalid argument: block table has {have} blocks, {needed} needed for {seq_len} tokens")]
    TableTooShort {
        have: usize,
        needed: usize,
        seq_len: usize,
    },
}

/// Number of blocks needed to hold `num_tokens` tokens.
pub fn blocks_needed(num_tokens: usize, block_size: usize) -> usize {
    if block_size == 0 {
        return 0;
    }
    num_tokens.div_ceil(block_size)
}

/// Build the slot mapping for the first `seq_len` tokens of a sequence.
pub fn build_slot_mapping(
    block_table: &[PhysicalBlockId],
    seq_len: usize,
    block_size: usize,
) -> Result<SlotMapping, SlotMappingError> {
    if block_size == 0 {
        return Err(SlotMappingError::ZeroBlockSize);
    }

    let needed = blocks_needed(seq_len, block_size);
    if block_table.len() < needed {
        return Err(SlotMappingError::TableTooShort {
            have: block_table.len(),
            needed,
            seq_len,
        });
    }

    let bs = block_size as u64;
    let slots = (0..seq_len)
        .map(|i| block_table[i / block_size] * bs + (i % block_size) as u64)
        .collect();
    Ok(slots)
}
