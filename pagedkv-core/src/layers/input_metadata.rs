/// Per-forward-pass batch descriptor, built fresh each step by the scheduler
/// side and read-only to the attention dispatch.
pub struct InputMetadata {
    /// Lengths of the prompt chunks, one per sequence; empty in decode mode.
    pub prompt_lens: Vec<usize>,
    pub max_context_len: Option<usize>,
    /// Per-sequence physical block ids, in logical order.
    pub block_tables: Option<Vec<Vec<u32>>>,
    /// Tokens attended per sequence, current token included.
    pub context_lens: Option<Vec<usize>>,
    /// Flat cache slot to write each new token's K/V to.
    pub slot_mapping: Vec<usize>,
    pub is_prompt: bool,
}

impl InputMetadata {
    pub fn new(
        prompt_lens: Vec<usize>,
        max_context_len: Option<usize>,
        block_tables: Option<Vec<Vec<u32>>>,
        context_lens: Option<Vec<usize>>,
        slot_mapping: Vec<usize>,
    ) -> Self {
        let is_prompt = !prompt_lens.is_empty();
        Self {
            prompt_lens,
            max_context_len,
            block_tables,
            context_lens,
            slot_mapping,
            is_prompt,
        }
    }
}
