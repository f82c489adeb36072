use serde::{Deserialize, Serialize};

pub trait ModelConfigLike {
    fn num_layers(&self) -> usize;
    fn num_kv_heads(&self) -> usize;
    fn num_attn_heads(&self) -> usize;
    fn head_dim(&self) -> usize;
}

pub struct ModelConfigMetadata {
    pub num_layers: usize,
    pub num_kv_heads: usize,
    pub num_attn_heads: usize,
    pub head_dim: usize,
}

impl ModelConfigLike for ModelConfigMetadata {
    fn num_layers(&self) -> usize {
        self.num_layers
    }
    fn num_kv_heads(&self) -> usize {
        self.num_kv_heads
    }
    fn num_attn_heads(&self) -> usize {
        self.num_attn_heads
    }
    fn head_dim(&self) -> usize {
        self.head_dim
    }
}

/// Geometry of the paged KV cache: how many tokens one block holds and how
/// many physical blocks exist on the device and host tiers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    pub block_size: usize,
    pub num_device_blocks: usize,
    pub num_host_blocks: usize,
}
