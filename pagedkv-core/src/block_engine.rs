use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use tracing::info;

use crate::block_engine_sequence::BlockEngineSequence;
use crate::error::{Error, Result};

/// A sequence's view of one block worth of its own tokens. Logical blocks
/// track token contents; physical blocks track cache storage.
#[derive(Debug, Clone)]
pub struct LogicalTokenBlock {
    tokens: Vec<usize>,
    block_size: usize,
    num_tokens: usize,
}

impl LogicalTokenBlock {
    pub fn new(block_size: usize) -> Self {
        Self {
            tokens: vec![0; block_size],
            block_size,
            num_tokens: 0,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_tokens(&self) -> usize {
        self.num_tokens
    }

    pub fn is_full(&self) -> bool {
        self.num_tokens == self.block_size
    }

    pub fn is_empty(&self) -> bool {
        self.num_tokens == 0
    }

    pub fn append_token_id(&mut self, token: usize) {
        assert!(!self.is_full());
        self.tokens[self.num_tokens] = token;
        self.num_tokens += 1;
    }

    pub fn toks(&self) -> &[usize] {
        &self.tokens[..self.num_tokens]
    }
}

pub struct _PhysicalTokenBlock {
    pub block_id: usize,
    block_size: usize,
    refcount: usize,
    on_device: bool,
}

impl _PhysicalTokenBlock {
    pub fn refcount(&self) -> usize {
        self.refcount
    }
    pub fn increment_refcount(&mut self) {
        self.refcount += 1;
    }
}

/// A physical cache block. Stable arena index (`block_id`) into the per-layer
/// K/V pools; shared across forked sequences via its refcount.
pub struct PhysicalTokenBlock(pub Mutex<_PhysicalTokenBlock>);

impl PhysicalTokenBlock {
    pub fn deref_mut(&self) -> MutexGuard<'_, _PhysicalTokenBlock> {
        loop {
            if let Ok(v) = self.0.try_lock() {
                return v;
            }
        }
    }
}

impl std::fmt::Debug for PhysicalTokenBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0.lock() {
            Ok(inner) => f
                .debug_struct("PhysicalTokenBlock")
                .field("block_id", &inner.block_id)
                .field("block_size", &inner.block_size)
                .field("refcount", &inner.refcount)
                .field("on_device", &inner.on_device)
                .finish(),
            Err(_) => write!(f, "PhysicalTokenBlock(<locked>)"),
        }
    }
}

pub type BlockTable = Vec<Arc<PhysicalTokenBlock>>;
pub type BlockTables = HashMap<usize, BlockTable>;

/// O(1) allocation off a free-index stack.
struct Allocator {
    free_blocks: BlockTable,
}

impl Allocator {
    fn new(block_size: usize, num_blocks: usize) -> Self {
        let mut free_blocks = Vec::new();
        for id in 0..num_blocks {
            free_blocks.push(Arc::new(PhysicalTokenBlock(Mutex::new(
                _PhysicalTokenBlock {
                    block_id: id,
                    block_size,
                    refcount: 0,
                    on_device: true,
                },
            ))));
        }
        Allocator { free_blocks }
    }

    fn allocate(&mut self) -> Result<Arc<PhysicalTokenBlock>> {
        let block = self.free_blocks.pop().ok_or(Error::OutOfMemory)?;
        block.deref_mut().refcount = 1;
        Ok(block)
    }

    fn free_block(&mut self, block: Arc<PhysicalTokenBlock>) {
        if block.deref_mut().refcount == 0 {
            panic!(
                "PhysicalTokenBlock with id {} experienced a double free!",
                block.deref_mut().block_id
            );
        }
        block.deref_mut().refcount -= 1;
        if block.deref_mut().refcount == 0 {
            self.free_blocks.push(block);
        }
    }

    fn num_free_blocks(&self) -> usize {
        self.free_blocks.len()
    }
}

#[derive(Debug)]
pub enum AllocStatus {
    Ok,
    Later { waitlisted_count: usize },
    Impossible,
}

type SeqID = usize;

/// Maps each sequence (by its id) to physical token blocks. The block engine
/// hands out and reclaims block references; it never touches cache memory
/// itself — the [`CacheEngine`](crate::CacheEngine) executes the copies the
/// engine's COW decisions imply.
pub struct BlockEngine {
    num_device_blocks: usize,
    block_size: usize,
    allocator: Allocator,
    pub block_tables: BlockTables,
}

impl BlockEngine {
    #[must_use]
    pub fn new(block_size: usize, num_device_blocks: usize) -> Self {
        info!(
            block_size,
            num_device_blocks, "initializing block engine"
        );
        Self {
            num_device_blocks,
            block_size,
            allocator: Allocator::new(block_size, num_device_blocks),
            block_tables: HashMap::new(),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_free_blocks(&self) -> usize {
        self.allocator.num_free_blocks()
    }

    pub fn can_allocate(&self, seq: &mut impl BlockEngineSequence) -> AllocStatus {
        let num_required_blocks = seq.logical_token_blocks().len();
        let num_free_blocks = self.allocator.num_free_blocks();

        if self.num_device_blocks < num_required_blocks {
            AllocStatus::Impossible
        } else if num_free_blocks < num_required_blocks {
            AllocStatus::Later {
                waitlisted_count: seq.increment_waitlist_count(),
            }
        } else {
            AllocStatus::Ok
        }
    }

    /// Allocate one physical block per logical block of `seq`. On
    /// out-of-memory, nothing is retained: blocks grabbed so far go back to
    /// the free pool and the error propagates to the scheduler.
    pub fn allocate(&mut self, seq: &impl BlockEngineSequence) -> Result<()> {
        let num_blocks_needed = seq.logical_token_blocks().len();
        let seq_id = seq.get_id();

        let mut block_table = Vec::with_capacity(num_blocks_needed);
        for _ in 0..num_blocks_needed {
            match self.allocator.allocate() {
                Ok(block) => block_table.push(block),
                Err(e) => {
                    for block in block_table {
                        self.allocator.free_block(block);
                    }
                    return Err(e);
                }
            }
        }
        self.block_tables.insert(seq_id, block_table);
        Ok(())
    }

    pub fn can_append_token_to_seq(&self, seq: &impl BlockEngineSequence) -> bool {
        seq.blocks_to_add_new_tok() <= self.allocator.num_free_blocks()
    }

    /// Make room for the next token of `seq`.
    ///
    /// If the tail logical block is full, a fresh physical block is appended
    /// to the table. Otherwise the token lands in the tail block in place —
    /// unless that block is shared with a forked sequence, in which case a
    /// private block is allocated and the `(src, dst)` block ids of the
    /// required content copy are returned for the cache engine to execute.
    pub fn append_token_slot_to_seq(
        &mut self,
        sequence: &impl BlockEngineSequence,
    ) -> Result<Option<(usize, usize)>> {
        let seq_id = sequence.get_id();
        if !self.block_tables.contains_key(&seq_id) {
            return Ok(None);
        }

        match sequence.blocks_to_add_new_tok() {
            1 => {
                // Allocate first so the table is untouched on OOM.
                let new_block = self.allocator.allocate()?;
                self.block_tables.get_mut(&seq_id).unwrap().push(new_block);
                Ok(None)
            }
            0 => {
                let table = self.block_tables.get(&seq_id).unwrap();
                let last_block = table.last().unwrap().clone();
                let on_device = last_block.deref_mut().on_device;
                let refcount = last_block.deref_mut().refcount;

                assert!(on_device);

                if refcount == 1 {
                    Ok(None)
                } else {
                    // Writing into shared storage: copy-on-write.
                    let old_number = last_block.deref_mut().block_id;
                    let new_block = self.allocator.allocate()?;
                    let new_number = new_block.deref_mut().block_id;

                    self.allocator.free_block(last_block);

                    let table = self.block_tables.get_mut(&seq_id).unwrap();
                    *table.last_mut().unwrap() = new_block;

                    Ok(Some((old_number, new_number)))
                }
            }
            _ => {
                unreachable!()
            }
        }
    }

    /// Share `src_id`'s blocks with a new sequence `dst_id` (beam-search style
    /// branching). All blocks are reference-shared; the first divergent write
    /// to the tail block triggers COW in [`Self::append_token_slot_to_seq`].
    ///
    /// Panics if `src_id` is unknown or `dst_id` already has a table: both are
    /// caller bugs, not recoverable conditions.
    pub fn fork_sequence(&mut self, src_id: SeqID, dst_id: SeqID) {
        let Some(src_table) = self.block_tables.get(&src_id) else {
            panic!("fork requested for unknown sequence {src_id}");
        };
        assert!(
            !self.block_tables.contains_key(&dst_id),
            "fork target sequence {dst_id} already has a block table"
        );

        let forked: BlockTable = src_table.to_vec();
        for block in &forked {
            block.deref_mut().increment_refcount();
        }
        self.block_tables.insert(dst_id, forked);
    }

    /// Release all of a sequence's block references, e.g. on completion or
    /// client disconnect. Blocks whose refcount hits zero return to the free
    /// pool; blocks still shared with a fork stay live.
    pub fn free_sequence(&mut self, id: SeqID) {
        if let Some(block_table) = self.block_tables.remove(&id) {
            for block in block_table {
                self.allocator.free_block(block);
            }
        }
    }

    /// Resolve a logical token position to `(physical_block_id, offset)`.
    pub fn get_physical_location(
        &self,
        seq_id: SeqID,
        logical_pos: usize,
    ) -> Option<(usize, usize)> {
        let table = self.block_tables.get(&seq_id)?;
        let block = table.get(logical_pos / self.block_size)?;
        Some((block.deref_mut().block_id, logical_pos % self.block_size))
    }

    /// Flat cache slot indices (`block_id * block_size + offset`) for the
    /// token positions `start..start + len` of a sequence. This is what the
    /// input processor feeds to `reshape_and_cache` as the slot mapping.
    pub fn slot_mapping(&self, seq_id: SeqID, start: usize, len: usize) -> Option<Vec<usize>> {
        (start..start + len)
            .map(|pos| {
                self.get_physical_location(seq_id, pos)
                    .map(|(block_id, offset)| block_id * self.block_size + offset)
            })
            .collect()
    }

    /// The sequence's block table as raw physical ids, in logical order.
    pub fn block_table_ids(&self, seq_id: SeqID) -> Option<Vec<u32>> {
        let table = self.block_tables.get(&seq_id)?;
        Some(
            table
                .iter()
                .map(|block| block.deref_mut().block_id as u32)
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_engine_sequence::Sequence;

    fn refcount_of(engine: &BlockEngine, seq_id: usize, idx: usize) -> usize {
        engine.block_tables[&seq_id][idx].deref_mut().refcount()
    }

    #[test]
    fn allocate_covers_all_tokens() {
        let mut engine = BlockEngine::new(4, 16);
        let mut seq = Sequence::from_tokens(0, 4, &[1, 2, 3, 4, 5]);

        assert!(matches!(engine.can_allocate(&mut seq), AllocStatus::Ok));
        engine.allocate(&seq).unwrap();

        let table_len = engine.block_tables[&0].len();
        assert_eq!(table_len, 2);
        assert!(table_len * engine.block_size() >= seq.len());
        // 5th token sits at offset 0 of the second block.
        let (block_id, offset) = engine.get_physical_location(0, 4).unwrap();
        assert_eq!(offset, 0);
        assert_eq!(
            block_id,
            engine.block_tables[&0][1].deref_mut().block_id
        );
    }

    #[test]
    fn append_grows_table_at_block_boundary() {
        let mut engine = BlockEngine::new(4, 16);
        let mut seq = Sequence::from_tokens(0, 4, &[0, 1, 2, 3]);
        engine.allocate(&seq).unwrap();
        assert_eq!(engine.block_tables[&0].len(), 1);

        // Crossing the boundary: slot first, then the token itself.
        assert_eq!(seq.blocks_to_add_new_tok(), 1);
        let cow = engine.append_token_slot_to_seq(&seq).unwrap();
        assert!(cow.is_none());
        seq.append_token(4);

        assert_eq!(engine.block_tables[&0].len(), 2);
        assert!(engine.block_tables[&0].len() * engine.block_size() >= seq.len());

        // Within the block no new physical block is taken.
        let free_before = engine.num_free_blocks();
        engine.append_token_slot_to_seq(&seq).unwrap();
        seq.append_token(5);
        assert_eq!(engine.num_free_blocks(), free_before);
    }

    #[test]
    fn exhausted_pool_reports_out_of_memory() {
        let mut engine = BlockEngine::new(4, 2);
        let seq_a = Sequence::from_tokens(0, 4, &[0, 1, 2, 3, 4]);
        engine.allocate(&seq_a).unwrap();
        assert_eq!(engine.num_free_blocks(), 0);

        let mut seq_b = Sequence::from_tokens(1, 4, &[7]);
        assert!(matches!(
            engine.can_allocate(&mut seq_b),
            AllocStatus::Later { .. }
        ));
        assert!(matches!(engine.allocate(&seq_b), Err(Error::OutOfMemory)));
        // The failed allocation must not leak state.
        assert!(!engine.block_tables.contains_key(&1));
        assert_eq!(engine.num_free_blocks(), 0);
    }

    #[test]
    fn oversized_sequence_is_impossible() {
        let engine = BlockEngine::new(4, 2);
        let mut seq = Sequence::from_tokens(0, 4, &(0..12).collect::<Vec<_>>());
        assert!(matches!(
            engine.can_allocate(&mut seq),
            AllocStatus::Impossible
        ));
    }

    #[test]
    fn append_at_boundary_propagates_out_of_memory() {
        let mut engine = BlockEngine::new(4, 1);
        let seq = Sequence::from_tokens(0, 4, &[0, 1, 2, 3]);
        engine.allocate(&seq).unwrap();

        // Tail is full and the pool is empty.
        assert!(!engine.can_append_token_to_seq(&seq));
        assert!(matches!(
            engine.append_token_slot_to_seq(&seq),
            Err(Error::OutOfMemory)
        ));
        // Table unchanged after the failed growth.
        assert_eq!(engine.block_tables[&0].len(), 1);
    }

    #[test]
    fn refcounts_balance_across_forks() {
        let mut engine = BlockEngine::new(4, 1);
        let seq = Sequence::from_tokens(0, 4, &[1, 2]);
        engine.allocate(&seq).unwrap();

        let reused_id = engine.block_tables[&0][0].deref_mut().block_id;

        // N = 2 forks.
        engine.fork_sequence(0, 1);
        engine.fork_sequence(0, 2);
        assert_eq!(refcount_of(&engine, 0, 0), 3);

        // N frees alone do not release the block.
        engine.free_sequence(1);
        engine.free_sequence(2);
        assert_eq!(engine.num_free_blocks(), 0);
        assert_eq!(refcount_of(&engine, 0, 0), 1);

        // The N+1-th free does, and the physical index is reusable.
        engine.free_sequence(0);
        assert_eq!(engine.num_free_blocks(), 1);

        let seq_b = Sequence::from_tokens(5, 4, &[9]);
        engine.allocate(&seq_b).unwrap();
        assert_eq!(engine.block_tables[&5][0].deref_mut().block_id, reused_id);
    }

    #[test]
    fn shared_tail_write_triggers_cow() {
        let mut engine = BlockEngine::new(2, 4);
        // One partially filled block, then fork.
        let mut seq_a = Sequence::from_tokens(0, 2, &[1]);
        engine.allocate(&seq_a).unwrap();
        engine.fork_sequence(0, 1);
        let mut seq_b = Sequence::from_tokens(1, 2, &[1]);

        let shared_id = engine.block_tables[&0][0].deref_mut().block_id;
        assert_eq!(refcount_of(&engine, 0, 0), 2);

        // First write into the shared tail must COW.
        let cow = engine.append_token_slot_to_seq(&seq_a).unwrap();
        seq_a.append_token(2);
        let (src, dst) = cow.expect("write to shared block must produce a COW mapping");
        assert_eq!(src, shared_id);
        assert_ne!(dst, shared_id);

        // Each side now owns its tail privately; the other fork's view is intact.
        assert_eq!(refcount_of(&engine, 0, 0), 1);
        assert_eq!(refcount_of(&engine, 1, 0), 1);
        assert_eq!(engine.block_tables[&1][0].deref_mut().block_id, shared_id);

        // The unforked side writes in place, no further COW.
        let cow_b = engine.append_token_slot_to_seq(&seq_b).unwrap();
        seq_b.append_token(3);
        assert!(cow_b.is_none());
    }

    #[test]
    fn full_shared_block_needs_no_cow() {
        let mut engine = BlockEngine::new(2, 4);
        let mut seq_a = Sequence::from_tokens(0, 2, &[1, 2]);
        engine.allocate(&seq_a).unwrap();
        engine.fork_sequence(0, 1);

        // Tail is full, so the next token goes to a fresh private block; the
        // shared full block stays shared untouched.
        let cow = engine.append_token_slot_to_seq(&seq_a).unwrap();
        seq_a.append_token(3);
        assert!(cow.is_none());
        assert_eq!(engine.block_tables[&0].len(), 2);
        assert_eq!(engine.block_tables[&1].len(), 1);
        assert_eq!(refcount_of(&engine, 1, 0), 2);
    }

    #[test]
    #[should_panic(expected = "unknown sequence")]
    fn fork_of_unknown_sequence_panics() {
        let mut engine = BlockEngine::new(4, 2);
        engine.fork_sequence(42, 43);
    }

    #[test]
    fn slot_mapping_is_block_strided() {
        let mut engine = BlockEngine::new(4, 8);
        let seq = Sequence::from_tokens(0, 4, &[0; 6]);
        engine.allocate(&seq).unwrap();

        let ids = engine.block_table_ids(0).unwrap();
        let slots = engine.slot_mapping(0, 0, 6).unwrap();
        for (pos, slot) in slots.iter().enumerate() {
            let expected = ids[pos / 4] as usize * 4 + pos % 4;
            assert_eq!(*slot, expected);
        }
    }
}
