use crate::block_engine::LogicalTokenBlock;

/// The sequence-shaped view the block engine schedules against. The serving
/// layer's sequence type implements this; a minimal [`Sequence`] is provided
/// for schedulers that do not need anything richer.
pub trait BlockEngineSequence {
    /// Number of fresh physical blocks needed before the next token can be
    /// written: 1 when the tail logical block is full (or absent), else 0.
    fn blocks_to_add_new_tok(&self) -> usize;
    fn get_id(&self) -> usize;
    fn logical_token_blocks(&self) -> &[LogicalTokenBlock];
    /// Returns the previous count.
    fn increment_waitlist_count(&mut self) -> usize;
}

pub struct Sequence {
    id: usize,
    block_size: usize,
    logical_token_blocks: Vec<LogicalTokenBlock>,
    waitlist_count: usize,
}

impl Sequence {
    pub fn new(id: usize, block_size: usize) -> Self {
        Self {
            id,
            block_size,
            logical_token_blocks: Vec::new(),
            waitlist_count: 0,
        }
    }

    pub fn from_tokens(id: usize, block_size: usize, tokens: &[usize]) -> Self {
        let mut this = Self::new(id, block_size);
        for &token in tokens {
            this.append_token(token);
        }
        this
    }

    pub fn append_token(&mut self, token: usize) {
        match self.logical_token_blocks.last_mut() {
            Some(block) if !block.is_full() => block.append_token_id(token),
            _ => {
                let mut block = LogicalTokenBlock::new(self.block_size);
                block.append_token_id(token);
                self.logical_token_blocks.push(block);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.logical_token_blocks
            .iter()
            .map(LogicalTokenBlock::num_tokens)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.logical_token_blocks.is_empty()
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }
}

impl BlockEngineSequence for Sequence {
    fn blocks_to_add_new_tok(&self) -> usize {
        match self.logical_token_blocks.last() {
            Some(block) if !block.is_full() => 0,
            _ => 1,
        }
    }

    fn get_id(&self) -> usize {
        self.id
    }

    fn logical_token_blocks(&self) -> &[LogicalTokenBlock] {
        &self.logical_token_blocks
    }

    fn increment_waitlist_count(&mut self) -> usize {
        let prev = self.waitlist_count;
        self.waitlist_count += 1;
        prev
    }
}
