//! Paged KV-cache core for LLM serving.
//!
//! The cache is carved into fixed-size blocks. Each sequence maps its logical
//! token positions onto physical blocks through a block table; blocks are
//! reference counted so forked sequences share their prefix copy-on-write.
//! The block engine hands out and reclaims block references, the cache engine
//! owns the actual per-layer K/V pools and executes swaps and copies, and the
//! paged attention dispatch reads the logically contiguous but physically
//! scattered cache during prefill and decode.
//!
//! The scheduler, tokenizer, sampler and model definitions live outside this
//! crate; it exposes exactly the block/table/event seam they need.

/// CPU implementations of the cache kernels (scatter-write, block copy/swap,
/// prefill and decode attention).
mod backend;
/// The higher-level manager of the blocks allocated. Operations performed by
/// the block engine do not directly change memory.
mod block_engine;
mod block_engine_sequence;
/// The lower-level manager of the cache. It allocates the K/V pools for the
/// device and host tiers and executes the operations issued by the scheduler.
mod cache_engine;
mod config;
mod error;
mod events;
mod layers;

pub use backend::{
    context_attention, copy_blocks, paged_attention, reshape_and_cache, swap_blocks,
};
pub use block_engine::{
    AllocStatus, BlockEngine, BlockTable, BlockTables, LogicalTokenBlock, PhysicalTokenBlock,
};
pub use block_engine_sequence::{BlockEngineSequence, Sequence};
pub use cache_engine::{CacheEngine, KVCache};
pub use config::{CacheConfig, ModelConfigLike, ModelConfigMetadata};
pub use error::{Error, Result};
pub use events::{CacheEvent, CacheEventSender};
pub use layers::{InputMetadata, PagedAttention};
