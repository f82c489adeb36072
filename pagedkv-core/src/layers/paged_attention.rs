use candle_core::Tensor;

use crate::backend::{context_attention, paged_attention, reshape_and_cache};
use crate::error::{Error, Result};
use crate::events::CacheEvent;
use crate::layers::InputMetadata;

/// Per-layer paged attention dispatch.
///
/// One instance per decoder layer; the model layer calls [`Self::forward`]
/// with that layer's K/V pool pair. Mode is decided once per batch from the
/// input metadata: prefill runs causal chunk attention, decode runs one query
/// per sequence against everything its block table reaches.
pub struct PagedAttention {
    num_attn_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    softmax_scale: f32,
    sliding_window: Option<usize>,
}

impl PagedAttention {
    pub fn new(
        num_attn_heads: usize,
        num_kv_heads: usize,
        head_dim: usize,
        sliding_window: Option<usize>,
    ) -> Self {
        assert_eq!(num_attn_heads % num_kv_heads, 0);
        Self {
            num_attn_heads,
            num_kv_heads,
            head_dim,
            softmax_scale: 1.0 / (head_dim as f32).sqrt(),
            sliding_window,
        }
    }

    /// Compute attention for a batch, writing the new K/V into the cache
    /// first so causal self-visibility holds: a query at the current position
    /// reads back its own freshly written K/V.
    ///
    /// If `cache_event` is set, an async swap-in is in flight for this
    /// layer's blocks and the dispatch blocks until it signals.
    ///
    /// * `query` - `[num_tokens, num_attn_heads, head_dim]`
    /// * `key`/`value` - `[num_tokens, num_kv_heads, head_dim]`
    /// * `key_cache`/`value_cache` - this layer's block pools
    pub fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        key_cache: &mut Tensor,
        value_cache: &mut Tensor,
        input_metadata: &InputMetadata,
        cache_event: Option<CacheEvent>,
    ) -> Result<Tensor> {
        let (num_tokens, num_attn_heads, head_dim) = query.dims3()?;
        let (_, num_kv_heads, _) = key.dims3()?;
        debug_assert_eq!(num_attn_heads, self.num_attn_heads);
        debug_assert_eq!(num_kv_heads, self.num_kv_heads);
        debug_assert_eq!(head_dim, self.head_dim);
        assert_eq!(input_metadata.slot_mapping.len(), num_tokens);

        if let Some(event) = cache_event {
            event.wait();
        }

        reshape_and_cache(
            key,
            value,
            key_cache,
            value_cache,
            &input_metadata.slot_mapping,
        )?;

        if input_metadata.is_prompt {
            let query_lens = &input_metadata.prompt_lens;
            let zero_context = vec![0; query_lens.len()];
            let context_lens = input_metadata
                .context_lens
                .as_deref()
                .unwrap_or(&zero_context);
            let no_tables = vec![Vec::new(); query_lens.len()];
            let block_tables = input_metadata
                .block_tables
                .as_deref()
                .unwrap_or(&no_tables);
            context_attention(
                query,
                key,
                value,
                key_cache,
                value_cache,
                block_tables,
                context_lens,
                query_lens,
                self.softmax_scale,
                self.sliding_window,
            )
        } else {
            let block_tables = input_metadata
                .block_tables
                .as_deref()
                .ok_or(Error::InvalidMetadata("block_tables"))?;
            let context_lens = input_metadata
                .context_lens
                .as_deref()
                .ok_or(Error::InvalidMetadata("context_lens"))?;
            paged_attention(
                query,
                key_cache,
                value_cache,
                block_tables,
                context_lens,
                self.softmax_scale,
            )
        }
    }
}
