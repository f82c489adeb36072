use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    thread,
};

use candle_core::{DType, Device, Tensor};
use tracing::{error, info};

use crate::backend::{copy_blocks, swap_blocks};
use crate::config::{CacheConfig, ModelConfigLike};
use crate::error::Result;
use crate::events::CacheEvent;

pub type KVCache = (Tensor, Tensor);

/// Owns the physical K/V block pools and executes the block-level operations
/// the scheduler issues: swaps between the host and device tiers and the
/// block duplications implied by copy-on-write. The block engine decides
/// *which* blocks move; this engine moves the bytes.
pub struct CacheEngine {
    device_cache: Arc<Mutex<Vec<KVCache>>>,
    host_cache: Arc<Mutex<Vec<KVCache>>>,
    num_layers: usize,
}

impl CacheEngine {
    pub fn new(
        model_config: &dyn ModelConfigLike,
        cache_config: &CacheConfig,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        info!(
            block_size = cache_config.block_size,
            num_device_blocks = cache_config.num_device_blocks,
            num_host_blocks = cache_config.num_host_blocks,
            num_layers = model_config.num_layers(),
            "allocating KV cache pools"
        );
        Ok(Self {
            device_cache: Arc::new(Mutex::new(Self::allocate_cache(
                model_config,
                cache_config.num_device_blocks,
                cache_config.block_size,
                dtype,
                device,
            )?)),
            host_cache: Arc::new(Mutex::new(Self::allocate_cache(
                model_config,
                cache_config.num_host_blocks,
                cache_config.block_size,
                dtype,
                device,
            )?)),
            num_layers: model_config.num_layers(),
        })
    }

    /// The per-layer device pools the attention dispatch reads and writes.
    pub fn get_kv_cache(&self) -> MutexGuard<'_, Vec<KVCache>> {
        loop {
            if let Ok(v) = self.device_cache.try_lock() {
                return v;
            }
        }
    }

    pub fn get_host_cache(&self) -> MutexGuard<'_, Vec<KVCache>> {
        loop {
            if let Ok(v) = self.host_cache.try_lock() {
                return v;
            }
        }
    }

    pub fn num_layers(&self) -> usize {
        self.num_layers
    }

    fn allocate_cache(
        model_config: &dyn ModelConfigLike,
        num_blocks: usize,
        block_size: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Vec<KVCache>> {
        let (kvh, hd_x, bs, x) = Self::key_block_shape(model_config, dtype, block_size);
        let mut cache = Vec::with_capacity(model_config.num_layers());
        for _ in 0..model_config.num_layers() {
            // Zero-initialized; freed blocks are not re-zeroed on reuse, the
            // attention gather never reads past a sequence's context length.
            let key_blocks = Tensor::zeros((num_blocks, kvh, hd_x, bs, x), dtype, device)?;
            let value_blocks = Tensor::zeros(
                (num_blocks, kvh, model_config.head_dim(), bs),
                dtype,
                device,
            )?;
            cache.push((key_blocks, value_blocks));
        }
        Ok(cache)
    }

    /// Key blocks are packed `[num_kv_heads, head_dim/x, block_size, x]` with
    /// `x = 16 / dtype_size`, matching the layout fused kernels expect.
    fn key_block_shape(
        model_config: &dyn ModelConfigLike,
        dtype: DType,
        block_size: usize,
    ) -> (usize, usize, usize, usize) {
        let x = 16 / dtype.size_in_bytes();
        assert_eq!(model_config.head_dim() % x, 0);
        (
            model_config.num_kv_heads(),
            model_config.head_dim() / x,
            block_size,
            x,
        )
    }
}

impl CacheEngine {
    pub fn execute_scheduler_ops(
        &self,
        blocks_to_swap_in: &HashMap<usize, usize>,
        blocks_to_swap_out: &HashMap<usize, usize>,
        blocks_to_copy: &HashMap<usize, Vec<usize>>,
    ) -> Result<()> {
        if !blocks_to_swap_in.is_empty() {
            self.swap_in(blocks_to_swap_in)?;
        }
        if !blocks_to_swap_out.is_empty() {
            self.swap_out(blocks_to_swap_out)?;
        }
        if !blocks_to_copy.is_empty() {
            self.copy(blocks_to_copy)?;
        }
        Ok(())
    }

    pub fn swap_in(&self, src_to_dst: &HashMap<usize, usize>) -> Result<()> {
        for layer in 0..self.num_layers {
            Self::swap_layer(&self.host_cache, &self.device_cache, layer, src_to_dst)?;
        }
        Ok(())
    }

    pub fn swap_out(&self, src_to_dst: &HashMap<usize, usize>) -> Result<()> {
        for layer in 0..self.num_layers {
            Self::swap_layer(&self.device_cache, &self.host_cache, layer, src_to_dst)?;
        }
        Ok(())
    }

    /// Swap in asynchronously, overlapping the copy with compute. Returns one
    /// [`CacheEvent`] per layer, signaled as soon as that layer's blocks are
    /// fully resident; the attention dispatch for the layer waits on it
    /// before reading. Layers are copied in order, so early layers unblock
    /// while later ones are still in flight.
    pub fn swap_in_async(&self, src_to_dst: HashMap<usize, usize>) -> Vec<CacheEvent> {
        let (senders, events): (Vec<_>, Vec<_>) =
            (0..self.num_layers).map(|_| CacheEvent::channel()).unzip();

        let host_cache = Arc::clone(&self.host_cache);
        let device_cache = Arc::clone(&self.device_cache);
        thread::spawn(move || {
            for (layer, sender) in senders.into_iter().enumerate() {
                match Self::swap_layer(&host_cache, &device_cache, layer, &src_to_dst) {
                    Ok(()) => sender.signal(),
                    Err(e) => {
                        // Dropping the sender makes the waiter panic instead
                        // of reading a partially copied block.
                        error!(layer, "async swap-in failed: {e}");
                        return;
                    }
                }
            }
        });

        events
    }

    fn swap_layer(
        src_cache: &Arc<Mutex<Vec<KVCache>>>,
        dst_cache: &Arc<Mutex<Vec<KVCache>>>,
        layer: usize,
        src_to_dst: &HashMap<usize, usize>,
    ) -> Result<()> {
        let (src_key, src_value) = {
            let src = src_cache.lock().unwrap_or_else(|e| e.into_inner());
            src[layer].clone()
        };
        let (new_key, new_value) = {
            let dst = dst_cache.lock().unwrap_or_else(|e| e.into_inner());
            let (dst_key, dst_value) = &dst[layer];
            (
                swap_blocks(&src_key, dst_key, src_to_dst)?,
                swap_blocks(&src_value, dst_value, src_to_dst)?,
            )
        };
        let mut dst = dst_cache.lock().unwrap_or_else(|e| e.into_inner());
        dst[layer] = (new_key, new_value);
        Ok(())
    }

    /// Execute COW block duplications on every layer's device pools.
    pub fn copy(&self, src_to_dst: &HashMap<usize, Vec<usize>>) -> Result<()> {
        let mut device_cache = self.get_kv_cache();
        let caches: (Vec<&mut Tensor>, Vec<&mut Tensor>) =
            device_cache.iter_mut().map(|(a, b)| (a, b)).unzip();
        let (key_caches, value_caches) = caches;
        copy_blocks(key_caches, value_caches, src_to_dst)?;
        Ok(())
    }
}
