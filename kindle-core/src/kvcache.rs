use serde::{Deserialize, Serialize};

use crate::types::DType;
use crate::Result;

/// Dimensions of a KV cache, laid out position-major as
/// `[capacity][n_layer][n_head][head_dim]` for keys and values alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvCacheShape {
    pub capacity: usize,
    pub n_layer: usize,
    pub n_head: usize,
    pub head_dim: usize,
}

impl KvCacheShape {
    /// Elements stored per position (one of keys or values).
    pub fn row_size(&self) -> usize {
        self.n_layer * self.n_head * self.head_dim
    }

    /// Elements stored per position and layer.
    pub fn layer_size(&self) -> usize {
        self.n_head * self.head_dim
    }

    pub fn numel(&self) -> usize {
        self.capacity * self.row_size()
    }
}

pub struct CacheUsage {
    pub capacity: usize,
    pub used: usize,
}

impl CacheUsage {
    pub fn free(&self) -> usize {
        self.capacity.saturating_sub(self.used)
    }

    pub fn usage_ratio(&self) -> f32 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.used as f32 / self.capacity as f32
    }
}

/// The valid prefix of a cache as raw little-endian bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct KvSnapshot {
    pub shape: KvCacheShape,
    pub dtype: DType,
    pub n: usize,
    pub keys: Vec<u8>,
    pub values: Vec<u8>,
}

impl KvSnapshot {
    pub fn expected_bytes(&self) -> usize {
        self.n * self.shape.row_size() * self.dtype.size_in_bytes()
    }
}

/// Fixed-capacity attention cache. Positions `[0, len)` hold valid data.
pub trait KvCache: Send {
    fn shape(&self) -> KvCacheShape;

    fn dtype(&self) -> DType;

    fn capacity(&self) -> usize {
        self.shape().capacity
    }

    /// Number of valid positions.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `incoming` more positions fit.
    fn append_allowed(&self, incoming: usize) -> bool;

    /// Append `n_tokens` positions whose rows are `keys`/`values`
    /// (`n_tokens * row_size` elements each). Fails without mutation if they
    /// do not fit.
    fn append(&mut self, n_tokens: usize, keys: &[f32], values: &[f32]) -> Result<()>;

    /// Drop the oldest `n_discard` positions and move the rest to the front.
    /// Fails without mutation if `n_discard > len`.
    fn shift(&mut self, n_discard: usize) -> Result<()>;

    fn clear(&mut self);

    /// Key vector `[n_head][head_dim]` of one layer at one position.
    fn read_key(&self, pos: usize, layer: usize) -> Result<Vec<f32>>;

    /// Value vector `[n_head][head_dim]` of one layer at one position.
    fn read_value(&self, pos: usize, layer: usize) -> Result<Vec<f32>>;

    fn usage(&self) -> CacheUsage {
        CacheUsage {
            capacity: self.capacity(),
            used: self.len(),
        }
    }

    fn snapshot(&self) -> KvSnapshot;

    /// Replace the contents with a snapshot of the same shape and dtype.
    fn restore(&mut self, snapshot: &KvSnapshot) -> Result<()>;
}
