//! Sequence and block table types.
//!
//! A sequence is split into fixed-size logical blocks of `block_size` tokens.
//! The block table maps each logical block to a physical block id owned by the
//! block allocator.

use serde::{Deserialize, Serialize};

/// Physical block identifier handed out by the block allocator.
pub type PhysicalBlockId = u64;

/// Scheduler-assigned sequence identifier.
pub type SequenceId = u64;

/// Token ID type.
pub type TokenId = i32;

/// Per-token physical slot indices.
pub type SlotMapping = Vec<u64>;

/// A single running sequence as seen by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sequence {
    /// Sequence ID.
    pub seq_id: SequenceId,

    /// Prompt tokens, fixed at creation (only rewritten by compaction).
    prompt_token_ids: Vec<TokenId>,

    /// Generated tokens, one appended per decode step.
    output_token_ids: Vec<TokenId>,

    /// Number of tokens that have confirmed cache entries.
    pub num_computed_tokens: usize,
}

impl Sequence {
    /// Create a sequence from its prompt.
    pub fn new(seq_id: SequenceId, prompt_token_ids: Vec<TokenId>) -> Self {
        Self {
            seq_id,
            prompt_token_ids,
            output_token_ids: Vec::new(),
            num_computed_tokens: 0,
        }
    }

    /// Create a sequence that has already generated some tokens.
    pub fn with_output(
        seq_id: SequenceId,
        prompt_token_ids: Vec<TokenId>,
        output_token_ids: Vec<TokenId>,
    ) -> Self {
        Self {
            seq_id,
            prompt_token_ids,
            output_token_ids,
            num_computed_tokens: 0,
        }
    }

    /// Logical length: prompt plus generated tokens.
    pub fn len(&self) -> usize {
        self.prompt_token_ids.len() + self.output_token_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn prompt_len(&self) -> usize {
        self.prompt_token_ids.len()
    }

    pub fn prompt_token_ids(&self) -> &[TokenId] {
        &self.prompt_token_ids
    }

    pub fn output_token_ids(&self) -> &[TokenId] {
        &self.output_token_ids
    }

    /// All token ids in logical order.
    pub fn token_ids(&self) -> Vec<TokenId> {
        let mut ids = Vec::with_capacity(self.len());
        ids.extend_from_slice(&self.prompt_token_ids);
        ids.extend_from_slice(&self.output_token_ids);
        ids
    }

    /// Token at a logical position.
    pub fn token_at(&self, pos: usize) -> Option<TokenId> {
        let prompt_len = self.prompt_len();
        if pos < prompt_len {
            self.prompt_token_ids.get(pos).copied()
        } else {
            self.output_token_ids.get(pos - prompt_len).copied()
        }
    }

    /// The most recently generated token, falling back to the last prompt token.
    pub fn last_token_id(&self) -> Option<TokenId> {
        self.output_token_ids
            .last()
            .or_else(|| self.prompt_token_ids.last())
            .copied()
    }

    /// Append one generated token.
    pub fn append_token_id(&mut self, token_id: TokenId) {
        self.output_token_ids.push(token_id);
    }

    /// Replace both token buffers after compaction.
    pub(crate) fn replace_token_ids(&mut self, prompt: Vec<TokenId>, output: Vec<TokenId>) {
        self.prompt_token_ids = prompt;
        self.output_token_ids = output;
    }
}

/// A group of sequences sampled from the same request.
#[derive(Debug, Clone)]
pub struct SequenceGroup {
    /// Request ID.
    pub request_id: String,

    /// Sequences in this group (more than one for parallel sampling / beam search).
    pub seqs: Vec<Sequence>,

    /// Whether the model is an encoder-decoder (has cross-attention block tables).
    pub is_encoder_decoder: bool,
}

impl SequenceGroup {
    pub fn new(request_id: impl Into<String>, seqs: Vec<Sequence>) -> Self {
        Self {
            request_id: request_id.into(),
            seqs,
            is_encoder_decoder: false,
        }
    }

    pub fn num_seqs(&self) -> usize {
        self.seqs.len()
    }

    pub fn get_seq_mut(&mut self, seq_id: SequenceId) -> Option<&mut Sequence> {
        self.seqs.iter_mut().find(|s| s.seq_id == seq_id)
    }
}

/// The block table maps logical blocks of one sequence to physical blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockTable {
    /// Sequence ID.
    pub sequence_id: SequenceId,

    /// Physical block IDs covering logical blocks [0..n).
    pub blocks: Vec<PhysicalBlockId>,

    /// Block size (tokens per block).
    pub block_size: usize,
}

impl BlockTable {
    /// Create a new empty block table.
    pub fn new(sequence_id: SequenceId, block_size: usize) -> Self {
        Self {
            sequence_id,
            blocks: Vec::new(),
            block_size,
        }
    }

    /// Add a block to the end of the table.
    pub fn push(&mut self, block_id: PhysicalBlockId) {
        self.blocks.push(block_id);
    }

    /// Get the physical block that holds a given token position.
    pub fn block_for_token(&self, token_pos: usize) -> Option<PhysicalBlockId> {
        if self.block_size == 0 {
            return None;
        }
        self.blocks.get(token_pos / self.block_size).copied()
    }

    /// Number of blocks in this table.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether the block table is empty.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Number of token slots the table can address.
    pub fn capacity_tokens(&self) -> usize {
        self.blocks.len() * self.block_size
    }
}
