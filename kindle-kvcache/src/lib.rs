//! Kindle KV cache: a bounded, contiguous attention cache with prefix eviction.

pub mod contiguous;

pub use contiguous::{append_allowed, ContiguousKvCache};
