mod input_metadata;
mod paged_attention;

pub use input_metadata::InputMetadata;
pub use paged_attention::PagedAttention;
