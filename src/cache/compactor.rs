//! Slot-table compaction.
//!
//! Drops token positions from a running sequence and rebuilds its block table
//! and slot mapping so the paged layout stays consistent:
//!
//! ```text
//! old table -> original slot mapping -> free old table
//!           -> keep retained tokens (+ re-attach newest token)
//!           -> allocate new table -> compacted slot mapping -> dst[seq_id]
//! ```
//!
//! The most recently generated token never has a slot yet (the scheduler
//! appends one on the next step), so both mappings cover `len - 1` tokens.

use std::collections::HashMap;

use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::allocator::{AllocatorError, BlockAllocator};
use crate::cache::block::{Sequence, SequenceGroup, SequenceId, SlotMapping, TokenId};
use crate::cache::slot_mapping::{blocks_needed, build_slot_mapping, SlotMappingError};
use crate::config::CacheConfig;

/// Index of the layer whose retained set drives the structural rewrite.
pub const REPRESENTATIVE_LAYER: usize = 0;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompactionError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("sequence {0} has no block table")]
    UnknownSequence(SequenceId),

    #[error("compaction plan for sequence {0} retains no tokens")]
    EmptyCompactionSet(SequenceId),

    #[error("block size mismatch: compactor uses {compactor}, allocator uses {allocator}")]
    BlockSizeMismatch { compactor: usize, allocator: usize },

    #[error(transparent)]
    SlotMapping(#[from] SlotMappingError),

    #[error("block allocation failed: {0}")]
    Allocation(#[from] AllocatorError),
}

/// Retained token indices proposed per layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionPlan {
    pub layers: Vec<Vec<usize>>,
}

impl CompactionPlan {
    /// A plan with a single (representative) layer.
    pub fn from_indices(indices: Vec<usize>) -> Self {
        Self {
            layers: vec![indices],
        }
    }

    pub fn from_layers(layers: Vec<Vec<usize>>) -> Self {
        Self { layers }
    }

    /// The retained indices of the representative layer.
    pub fn representative(&self) -> &[usize] {
        self.layers
            .get(REPRESENTATIVE_LAYER)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Compacted slot mappings produced during one scheduling step.
#[derive(Debug, Default)]
pub struct DstSlotMappings {
    mappings: HashMap<SequenceId, SlotMapping>,
}

impl DstSlotMappings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the previous step's mappings.
    pub fn begin_step(&mut self) {
        self.mappings.clear();
    }

    pub fn insert(&mut self, seq_id: SequenceId, mapping: SlotMapping) {
        self.mappings.insert(seq_id, mapping);
    }

    pub fn get(&self, seq_id: SequenceId) -> Option<&SlotMapping> {
        self.mappings.get(&seq_id)
    }

    pub fn contains(&self, seq_id: SequenceId) -> bool {
        self.mappings.contains_key(&seq_id)
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SequenceId, &SlotMapping)> {
        self.mappings.iter()
    }
}

/// Allocation hints forwarded to the block allocator.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocationHints {
    pub is_multi_output: bool,
    pub is_encoder_decoder: bool,
}

/// What one compaction did, for diagnostics and rollback by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionRecord {
    pub seq_id: SequenceId,

    /// Slot mapping before compaction (covers `old_len - 1` tokens).
    pub original_slot_mapping: SlotMapping,

    /// Logical length before compaction.
    pub old_len: usize,

    /// Logical length after compaction (`retained + 1`).
    pub new_len: usize,

    /// Prompt positions that were dropped.
    pub dropped_prompt_tokens: usize,
}

/// Rewrites sequences' token buffers and block tables per compaction plans.
#[derive(Debug, Clone)]
pub struct SlotCompactor {
    block_size: usize,
}

impl SlotCompactor {
    /// Create a compactor, checking its block size against the allocator's.
    pub fn new<A: BlockAllocator + ?Sized>(
        block_size: usize,
        allocator: &A,
    ) -> Result<Self, CompactionError> {
        if block_size == 0 {
            return Err(SlotMappingError::ZeroBlockSize.into());
        }
        if allocator.block_size() != block_size {
            return Err(CompactionError::BlockSizeMismatch {
                compactor: block_size,
                allocator: allocator.block_size(),
            });
        }
        Ok(Self { block_size })
    }

    pub fn from_config<A: BlockAllocator + ?Sized>(
        config: &CacheConfig,
        allocator: &A,
    ) -> Result<Self, CompactionError> {
        Self::new(config.block_size, allocator)
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Compact every sequence of `group` that has a plan; others are left untouched.
    pub fn compact_group<A: BlockAllocator + ?Sized>(
        &self,
        group: &mut SequenceGroup,
        allocator: &mut A,
        plans: &HashMap<SequenceId, CompactionPlan>,
        dst: &mut DstSlotMappings,
    ) -> Result<Vec<CompactionRecord>, CompactionError> {
        let hints = AllocationHints {
            is_multi_output: group.num_seqs() > 1,
            is_encoder_decoder: group.is_encoder_decoder,
        };

        let mut records = Vec::new();
        for seq in group.seqs.iter_mut() {
            let Some(plan) = plans.get(&seq.seq_id) else {
                continue;
            };
            debug!(
                request_id = %group.request_id,
                seq_id = seq.seq_id,
                "Compacting sequence"
            );
            records.push(self.compact_sequence(seq, allocator, plan, hints, dst)?);
        }
        Ok(records)
    }

    /// Compact one sequence to the representative layer of `plan`.
    pub fn compact_sequence<A: BlockAllocator + ?Sized>(
        &self,
        seq: &mut Sequence,
        allocator: &mut A,
        plan: &CompactionPlan,
        hints: AllocationHints,
        dst: &mut DstSlotMappings,
    ) -> Result<CompactionRecord, CompactionError> {
        let seq_id = seq.seq_id;
        let indices = plan.representative();

        let old_table = allocator
            .get_block_table(seq_id)
            .ok_or(CompactionError::UnknownSequence(seq_id))?;
        if indices.is_empty() {
            return Err(CompactionError::EmptyCompactionSet(seq_id));
        }

        // The newest token has no slot yet.
        let old_len = seq.len();
        let seq_len = old_len.saturating_sub(1);
        validate_indices(indices, seq_len)?;

        let original_slot_mapping = build_slot_mapping(&old_table.blocks, seq_len, self.block_size)?;

        let last_token = seq.output_token_ids().last().copied().ok_or_else(|| {
            CompactionError::InvalidArgument(format!("sequence {seq_id} has no generated tokens"))
        })?;
        let (prompt, mut output) = partition_retained(seq, indices);
        let dropped_prompt_tokens = seq.prompt_len() - prompt.len();
        if dropped_prompt_tokens > 0 {
            warn!(
                seq_id,
                dropped = dropped_prompt_tokens,
                "Compaction drops prompt tokens"
            );
        }
        output.push(last_token);

        let mut staged = seq.clone();
        staged.replace_token_ids(prompt, output);
        staged.num_computed_tokens = indices.len();
        let new_len = staged.len();

        allocator.free_block_table(&old_table)?;
        let new_table =
            allocator.allocate_block_table(&staged, hints.is_multi_output, hints.is_encoder_decoder)?;
        if new_table.len() < blocks_needed(new_len, self.block_size) {
            allocator.free_block_table(&new_table)?;
            return Err(CompactionError::InvalidArgument(format!(
                "allocator returned {} blocks for {} tokens",
                new_table.len(),
                new_len
            )));
        }

        let compacted_slot_mapping =
            build_slot_mapping(&new_table.blocks, new_len - 1, self.block_size)?;
        allocator.set_block_table(seq_id, new_table);
        *seq = staged;
        dst.insert(seq_id, compacted_slot_mapping);

        debug!(
            seq_id,
            old_len,
            new_len,
            num_computed_tokens = seq.num_computed_tokens,
            "Sequence compacted"
        );

        Ok(CompactionRecord {
            seq_id,
            original_slot_mapping,
            old_len,
            new_len,
            dropped_prompt_tokens,
        })
    }
}

/// Retained indices must be strictly ascending and address slotted tokens only.
fn validate_indices(indices: &[usize], seq_len: usize) -> Result<(), CompactionError> {
    if let Some(w) = indices.windows(2).find(|w| w[0] >= w[1]) {
        return Err(CompactionError::InvalidArgument(format!(
            "retained indices must be strictly ascending, got {} then {}",
            w[0], w[1]
        )));
    }
    match indices.last() {
        Some(&last) if last >= seq_len => Err(CompactionError::InvalidArgument(format!(
            "retained index {last} out of range for {seq_len} slotted tokens"
        ))),
        _ => Ok(()),
    }
}

fn partition_retained(seq: &Sequence, indices: &[usize]) -> (Vec<TokenId>, Vec<TokenId>) {
    let prompt_len = seq.prompt_len();
    let mut prompt = Vec::new();
    let mut output = Vec::with_capacity(indices.len() + 1);
    for &i in indices {
        if i < prompt_len {
            prompt.push(seq.prompt_token_ids()[i]);
        } else {
            output.push(seq.output_token_ids()[i - prompt_len]);
        }
    }
    (prompt, output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::allocator::PagedBlockAllocator;

    fn setup(prompt: Vec<TokenId>, output: Vec<TokenId>) -> (Sequence, PagedBlockAllocator) {
        let seq = Sequence::with_output(1, prompt, output);
        let mut alloc = PagedBlockAllocator::new(4, 16);
        alloc.allocate_sequence(&seq).unwrap();
        (seq, alloc)
    }

    #[test]
    fn test_partition_and_reattach() {
        let (mut seq, mut alloc) = setup(vec![1, 2, 3, 4], vec![10, 11, 12, 13, 14]);
        let compactor = SlotCompactor::new(4, &alloc).unwrap();
        let mut dst = DstSlotMappings::new();

        let record = compactor
            .compact_sequence(
                &mut seq,
                &mut alloc,
                &CompactionPlan::from_indices(vec![1, 3, 5, 7]),
                AllocationHints::default(),
                &mut dst,
            )
            .unwrap();

        assert_eq!(seq.prompt_token_ids(), &[2, 4]);
        assert_eq!(seq.output_token_ids(), &[11, 13, 14]);
        assert_eq!(seq.len(), 5);
        assert_eq!(seq.num_computed_tokens, 4);
        assert_eq!(record.old_len, 9);
        assert_eq!(record.new_len, 5);
        assert_eq!(record.original_slot_mapping.len(), 8);
        assert_eq!(record.dropped_prompt_tokens, 2);
        assert_eq!(dst.get(1).unwrap().len(), 4);
    }

    #[test]
    fn test_only_representative_layer_used() {
        let (mut seq, mut alloc) = setup(vec![1, 2, 3], vec![10, 11]);
        let compactor = SlotCompactor::new(4, &alloc).unwrap();
        let mut dst = DstSlotMappings::new();
        let plan = CompactionPlan::from_layers(vec![vec![0, 3], vec![0, 1, 2, 3]]);

        compactor
            .compact_sequence(&mut seq, &mut alloc, &plan, AllocationHints::default(), &mut dst)
            .unwrap();
        assert_eq!(seq.token_ids(), vec![1, 10, 11]);
    }

    #[test]
    fn test_empty_plan_leaves_sequence_untouched() {
        let (mut seq, mut alloc) = setup(vec![1, 2, 3], vec![10, 11]);
        let before_table = alloc.get_block_table(1).unwrap();
        let compactor = SlotCompactor::new(4, &alloc).unwrap();
        let mut dst = DstSlotMappings::new();

        let err = compactor
            .compact_sequence(
                &mut seq,
                &mut alloc,
                &CompactionPlan::from_indices(vec![]),
                AllocationHints::default(),
                &mut dst,
            )
            .unwrap_err();
        assert_eq!(err, CompactionError::EmptyCompactionSet(1));
        assert_eq!(seq.token_ids(), vec![1, 2, 3, 10, 11]);
        assert_eq!(alloc.get_block_table(1), Some(before_table));
        assert!(dst.is_empty());
    }

    #[test]
    fn test_unsorted_and_out_of_range_indices() {
        let (mut seq, mut alloc) = setup(vec![1, 2, 3], vec![10, 11]);
        let compactor = SlotCompactor::new(4, &alloc).unwrap();
        let mut dst = DstSlotMappings::new();

        for indices in [vec![2, 1], vec![1, 1], vec![0, 4]] {
            let err = compactor
                .compact_sequence(
                    &mut seq,
                    &mut alloc,
                    &CompactionPlan::from_indices(indices),
                    AllocationHints::default(),
                    &mut dst,
                )
                .unwrap_err();
            assert!(matches!(err, CompactionError::InvalidArgument(_)));
        }
        assert_eq!(seq.len(), 5);
    }

    #[test]
    fn test_prompt_only_sequence_rejected() {
        let (mut seq, mut alloc) = setup(vec![1, 2, 3, 4], vec![]);
        let before_table = alloc.get_block_table(1).unwrap();
        let compactor = SlotCompactor::new(4, &alloc).unwrap();
        let mut dst = DstSlotMappings::new();

        let err = compactor
            .compact_sequence(
                &mut seq,
                &mut alloc,
                &CompactionPlan::from_indices(vec![0, 1]),
                AllocationHints::default(),
                &mut dst,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            CompactionError::InvalidArgument(ref msg) if msg.contains("no generated tokens")
        ));
        assert_eq!(seq.token_ids(), vec![1, 2, 3, 4]);
        assert_eq!(alloc.get_block_table(1), Some(before_table));
        assert!(dst.is_empty());
    }

    #[test]
    fn test_block_size_mismatch() {
        let alloc = PagedBlockAllocator::new(16, 4);
        assert_eq!(
            SlotCompactor::new(8, &alloc).unwrap_err(),
            CompactionError::BlockSizeMismatch {
                compactor: 8,
                allocator: 16
            }
        );
    }
}
