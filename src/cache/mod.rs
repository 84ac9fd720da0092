//! Paged KV cache layout management.
//!
//! - [`block`]: Sequence, SequenceGroup, BlockTable and id types
//! - [`slot_mapping`]: Block table → per-token slot indices
//! - [`allocator`]: Block allocation service trait and free-list allocator
//! - [`compactor`]: Drops token positions and rebuilds the paged layout

pub mod allocator;
pub mod block;
pub mod compactor;
pub mod slot_mapping;
