//! CPU implementations of the cache kernels.
//!
//! Unfused candle tensor ops throughout: gathers go through `index_select`
//! over a flattened slot view of the pool, block copies through
//! `slice_assign`. Correctness over speed.
//!
//! Cache layout matches the packed layout the fused kernels use:
//! key blocks are `[num_blocks, num_kv_heads, head_dim/x, block_size, x]`
//! with `x = 16 / dtype_size`, value blocks are
//! `[num_blocks, num_kv_heads, head_dim, block_size]`.

use std::collections::HashMap;
use std::ops::Range;

use candle_core::{Device, Tensor};

use crate::error::Result;

/// Ranges selecting a single block row of a pool tensor.
fn block_row(dims: &[usize], block: usize) -> Vec<Range<usize>> {
    let mut ranges: Vec<Range<usize>> = dims.iter().map(|&d| 0..d).collect();
    ranges[0] = block..block + 1;
    ranges
}

/// Copy whole blocks from `src` into `dst` (different pools, e.g. host to
/// device). `mapping` is src block id -> dst block id. Returns the updated
/// destination pool.
pub fn swap_blocks(
    src: &Tensor,
    dst: &Tensor,
    mapping: &HashMap<usize, usize>,
) -> Result<Tensor> {
    let mut out = dst.clone();
    for (&src_block, &dst_block) in mapping {
        let row = src.narrow(0, src_block, 1)?;
        out = out.slice_assign(&block_row(dst.dims(), dst_block), &row)?;
    }
    Ok(out)
}

/// Duplicate blocks within each layer's pools, src block id -> dst block ids.
/// This executes the copies the block engine's COW decisions imply.
pub fn copy_blocks(
    key_caches: Vec<&mut Tensor>,
    value_caches: Vec<&mut Tensor>,
    mapping: &HashMap<usize, Vec<usize>>,
) -> Result<()> {
    for (key_cache, value_cache) in key_caches.into_iter().zip(value_caches) {
        let mut new_k = key_cache.clone();
        let mut new_v = value_cache.clone();
        for (&src, dsts) in mapping {
            let k_row = new_k.narrow(0, src, 1)?;
            let v_row = new_v.narrow(0, src, 1)?;
            for &dst in dsts {
                new_k = new_k.slice_assign(&block_row(new_k.dims(), dst), &k_row)?;
                new_v = new_v.slice_assign(&block_row(new_v.dims(), dst), &v_row)?;
            }
        }
        *key_cache = new_k;
        *value_cache = new_v;
    }
    Ok(())
}

/// Scatter new K/V vectors into their cache slots.
///
/// * `key`/`value` - `[num_tokens, num_kv_heads, head_dim]`
/// * `slot_mapping` - flat slot (`block_id * block_size + offset`) per token
pub fn reshape_and_cache(
    key: &Tensor,
    value: &Tensor,
    key_cache: &mut Tensor,
    value_cache: &mut Tensor,
    slot_mapping: &[usize],
) -> Result<()> {
    let (num_tokens, num_kv_heads, head_dim) = key.dims3()?;
    assert_eq!(slot_mapping.len(), num_tokens);
    let (_, _, hd_x, block_size, x) = key_cache.dims5()?;
    debug_assert_eq!(hd_x * x, head_dim);

    let mut new_k = key_cache.clone();
    let mut new_v = value_cache.clone();
    for (token, &slot) in slot_mapping.iter().enumerate() {
        let block = slot / block_size;
        let offset = slot % block_size;

        // [1, h, d] -> [1, h, d/x, 1, x], landing at [block, :, :, offset, :].
        let k_src = key
            .narrow(0, token, 1)?
            .reshape((1, num_kv_heads, hd_x, 1, x))?;
        let mut k_ranges = block_row(new_k.dims(), block);
        k_ranges[3] = offset..offset + 1;
        new_k = new_k.slice_assign(&k_ranges, &k_src)?;

        // [1, h, d] -> [1, h, d, 1], landing at [block, :, :, offset].
        let v_src = value
            .narrow(0, token, 1)?
            .reshape((1, num_kv_heads, head_dim, 1))?;
        let mut v_ranges = block_row(new_v.dims(), block);
        v_ranges[3] = offset..offset + 1;
        new_v = new_v.slice_assign(&v_ranges, &v_src)?;
    }
    *key_cache = new_k;
    *value_cache = new_v;
    Ok(())
}

/// Flatten the packed pools into `[num_blocks * block_size, num_kv_heads,
/// head_dim]` so cached tokens can be gathered by flat slot index.
fn flatten_pools(key_cache: &Tensor, value_cache: &Tensor) -> Result<(Tensor, Tensor, usize)> {
    let (num_blocks, num_kv_heads, hd_x, block_size, x) = key_cache.dims5()?;
    let flat_k = key_cache
        .permute((0, 3, 1, 2, 4))?
        .reshape((num_blocks * block_size, num_kv_heads, hd_x * x))?
        .contiguous()?;

    let (_, _, head_dim, _) = value_cache.dims4()?;
    let flat_v = value_cache
        .permute((0, 3, 1, 2))?
        .reshape((num_blocks * block_size, num_kv_heads, head_dim))?
        .contiguous()?;
    Ok((flat_k, flat_v, block_size))
}

/// Gather one sequence's first `context_len` cached tokens via its block table.
fn gather_context(
    flat_k: &Tensor,
    flat_v: &Tensor,
    block_table: &[u32],
    context_len: usize,
    block_size: usize,
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    let mut slots = Vec::with_capacity(context_len);
    for pos in 0..context_len {
        let physical_block = block_table[pos / block_size];
        slots.push(physical_block * block_size as u32 + (pos % block_size) as u32);
    }
    let slots = Tensor::new(slots.as_slice(), device)?;
    Ok((
        flat_k.index_select(&slots, 0)?,
        flat_v.index_select(&slots, 0)?,
    ))
}

/// Expand grouped KV heads to one per attention head.
fn expand_kv_groups(kv: Tensor, n_groups: usize) -> Result<Tensor> {
    if n_groups == 1 {
        return Ok(kv);
    }
    let (total_kv, num_kv_heads, head_dim) = kv.dims3()?;
    Ok(kv
        .unsqueeze(2)?
        .expand((total_kv, num_kv_heads, n_groups, head_dim))?
        .reshape((total_kv, num_kv_heads * n_groups, head_dim))?
        .contiguous()?)
}

/// softmax(QK^T * scale + mask)V for one sequence. `q` is
/// `[q_len, num_heads, head_dim]`, `k`/`v` are `[total_kv, num_heads,
/// head_dim]`; heads are independent.
fn attention_single_seq(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    mask: Option<&Tensor>,
    softmax_scale: f32,
) -> Result<Tensor> {
    let q_t = q.transpose(0, 1)?.contiguous()?; // [heads, q_len, d]
    let k_t = k.transpose(0, 1)?.contiguous()?; // [heads, total_kv, d]
    let v_t = v.transpose(0, 1)?.contiguous()?;

    let scores = (q_t.matmul(&k_t.transpose(1, 2)?)? * softmax_scale as f64)?;
    let scores = match mask {
        Some(mask) => scores.broadcast_add(mask)?,
        None => scores,
    };
    let weights = candle_nn::ops::softmax_last_dim(&scores)?;
    Ok(weights.matmul(&v_t)?.transpose(0, 1)?.contiguous()?)
}

/// Causal mask for a chunk of new tokens appended after `context_len` cached
/// ones: `[q_len, total_kv]`, 0.0 where visible, -inf where masked. Query at
/// local position `q` sees all of the context plus new tokens up to itself,
/// optionally restricted to a sliding window over its global position.
fn causal_chunk_mask(
    q_len: usize,
    total_kv: usize,
    context_len: usize,
    sliding_window: Option<usize>,
    device: &Device,
) -> Result<Tensor> {
    let mut mask = vec![0.0f32; q_len * total_kv];
    for q in 0..q_len {
        let q_global = context_len + q;
        let causal_limit = context_len + q + 1;
        for kv in 0..total_kv {
            let idx = q * total_kv + kv;
            if kv >= causal_limit {
                mask[idx] = f32::NEG_INFINITY;
            } else if let Some(window) = sliding_window {
                if q_global.saturating_sub(kv) >= window {
                    mask[idx] = f32::NEG_INFINITY;
                }
            }
        }
    }
    Ok(Tensor::from_vec(mask, (q_len, total_kv), device)?)
}

/// Prefill-mode attention: each sequence contributes a causal chunk of new
/// tokens, attending over its cached context (gathered through the block
/// table) plus the chunk itself.
///
/// * `query` - `[total_new_tokens, num_heads, head_dim]`
/// * `key`/`value` - `[total_new_tokens, num_kv_heads, head_dim]`
/// * `context_lens`/`query_lens` - per sequence; `block_tables` may be empty
///   for sequences with `context_len == 0`
#[allow(clippy::too_many_arguments)]
pub fn context_attention(
    query: &Tensor,
    key: &Tensor,
    value: &Tensor,
    key_cache: &Tensor,
    value_cache: &Tensor,
    block_tables: &[Vec<u32>],
    context_lens: &[usize],
    query_lens: &[usize],
    softmax_scale: f32,
    sliding_window: Option<usize>,
) -> Result<Tensor> {
    let device = query.device();
    let dtype = query.dtype();
    let (_, num_heads, _) = query.dims3()?;
    let (_, num_kv_heads, _) = key.dims3()?;
    let n_groups = num_heads / num_kv_heads;

    let (flat_k, flat_v, block_size) = flatten_pools(key_cache, value_cache)?;

    let mut outputs = Vec::with_capacity(context_lens.len());
    let mut q_offset = 0usize;
    for (seq_idx, (&context_len, &q_len)) in context_lens.iter().zip(query_lens).enumerate() {
        let total_kv = context_len + q_len;

        let q_i = query.narrow(0, q_offset, q_len)?;
        let new_k = key.narrow(0, q_offset, q_len)?;
        let new_v = value.narrow(0, q_offset, q_len)?;

        let (full_k, full_v) = if context_len > 0 {
            let (cached_k, cached_v) = gather_context(
                &flat_k,
                &flat_v,
                &block_tables[seq_idx],
                context_len,
                block_size,
                device,
            )?;
            (
                Tensor::cat(&[&cached_k, &new_k], 0)?,
                Tensor::cat(&[&cached_v, &new_v], 0)?,
            )
        } else {
            (new_k, new_v)
        };

        let full_k = expand_kv_groups(full_k, n_groups)?;
        let full_v = expand_kv_groups(full_v, n_groups)?;

        let mask = causal_chunk_mask(q_len, total_kv, context_len, sliding_window, device)?
            .to_dtype(dtype)?;
        outputs.push(attention_single_seq(
            &q_i,
            &full_k,
            &full_v,
            Some(&mask),
            softmax_scale,
        )?);

        q_offset += q_len;
    }

    Ok(Tensor::cat(&outputs, 0)?)
}

/// Decode-mode attention: one query per sequence against all of its cached
/// tokens. The current token's K/V must already be in the cache (the dispatch
/// writes before it reads), so `context_lens` includes the current token and
/// no mask is needed.
///
/// * `query` - `[num_seqs, num_heads, head_dim]`
pub fn paged_attention(
    query: &Tensor,
    key_cache: &Tensor,
    value_cache: &Tensor,
    block_tables: &[Vec<u32>],
    context_lens: &[usize],
    softmax_scale: f32,
) -> Result<Tensor> {
    let device = query.device();
    let (num_seqs, num_heads, _) = query.dims3()?;
    let (_, num_kv_heads, _, _) = value_cache.dims4()?;
    let n_groups = num_heads / num_kv_heads;
    assert_eq!(num_seqs, context_lens.len());

    let (flat_k, flat_v, block_size) = flatten_pools(key_cache, value_cache)?;

    let mut outputs = Vec::with_capacity(num_seqs);
    for (seq_idx, &context_len) in context_lens.iter().enumerate() {
        let q_i = query.narrow(0, seq_idx, 1)?;
        let (k_i, v_i) = gather_context(
            &flat_k,
            &flat_v,
            &block_tables[seq_idx],
            context_len,
            block_size,
            device,
        )?;
        let k_i = expand_kv_groups(k_i, n_groups)?;
        let v_i = expand_kv_groups(v_i, n_groups)?;
        outputs.push(attention_single_seq(&q_i, &k_i, &v_i, None, softmax_scale)?);
    }

    Ok(Tensor::cat(&outputs, 0)?)
}
