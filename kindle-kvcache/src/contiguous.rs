//! Contiguous KV cache: one pre-allocated, position-major buffer per tensor.
//!
//! Keys and values are stored as `[capacity][n_layer][n_head][head_dim]`, so
//! every position is one contiguous row and evicting a prefix is a single
//! `copy_within` of the surviving rows.

use half::f16;
use tracing::debug;

use kindle_core::{DType, KindleError, KvCache, KvCacheShape, KvSnapshot, Result};

/// Pure capacity predicate: `current_n + incoming_count <= capacity`.
pub fn append_allowed(current_n: usize, incoming_count: usize, capacity: usize) -> bool {
    current_n
        .checked_add(incoming_count)
        .is_some_and(|total| total <= capacity)
}

#[derive(Debug, Clone)]
enum Storage {
    F32(Vec<f32>),
    F16(Vec<f16>),
}

impl Storage {
    fn zeros(dtype: DType, numel: usize) -> Self {
        match dtype {
            DType::F32 => Storage::F32(vec![0.0; numel]),
            DType::F16 => Storage::F16(vec![f16::ZERO; numel]),
        }
    }

    fn write(&mut self, offset: usize, src: &[f32]) {
        match self {
            Storage::F32(buf) => buf[offset..offset + src.len()].copy_from_slice(src),
            Storage::F16(buf) => {
                for (dst, &x) in buf[offset..offset + src.len()].iter_mut().zip(src) {
                    *dst = f16::from_f32(x);
                }
            }
        }
    }

    fn read(&self, offset: usize, len: usize) -> Vec<f32> {
        match self {
            Storage::F32(buf) => buf[offset..offset + len].to_vec(),
            Storage::F16(buf) => buf[offset..offset + len].iter().map(|x| x.to_f32()).collect(),
        }
    }

    fn move_down(&mut self, from: usize, to: usize, len: usize) {
        match self {
            Storage::F32(buf) => buf.copy_within(from..from + len, to),
            Storage::F16(buf) => buf.copy_within(from..from + len, to),
        }
    }

    fn prefix_bytes(&self, len: usize) -> Vec<u8> {
        match self {
            Storage::F32(buf) => buf[..len].iter().flat_map(|x| x.to_le_bytes()).collect(),
            Storage::F16(buf) => buf[..len].iter().flat_map(|x| x.to_le_bytes()).collect(),
        }
    }

    fn load_prefix(&mut self, bytes: &[u8]) {
        match self {
            Storage::F32(buf) => {
                for (dst, chunk) in buf.iter_mut().zip(bytes.chunks_exact(4)) {
                    *dst = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                }
            }
            Storage::F16(buf) => {
                for (dst, chunk) in buf.iter_mut().zip(bytes.chunks_exact(2)) {
                    *dst = f16::from_le_bytes([chunk[0], chunk[1]]);
                }
            }
        }
    }
}

/// Fixed-capacity KV cache with an explicit valid-length counter.
pub struct ContiguousKvCache {
    shape: KvCacheShape,
    dtype: DType,
    keys: Storage,
    values: Storage,
    /// Positions `[0, n)` are valid.
    n: usize,
}

impl ContiguousKvCache {
    /// Allocate the whole buffer once. There is no resizing afterwards.
    pub fn new(shape: KvCacheShape, dtype: DType) -> Self {
        let numel = shape.numel();
        debug!(
            capacity = shape.capacity,
            n_layer = shape.n_layer,
            n_head = shape.n_head,
            head_dim = shape.head_dim,
            ?dtype,
            "allocating KV cache"
        );
        Self {
            shape,
            dtype,
            keys: Storage::zeros(dtype, numel),
            values: Storage::zeros(dtype, numel),
            n: 0,
        }
    }

    /// Bytes held by the key and value buffers together.
    pub fn size_bytes(&self) -> usize {
        2 * self.shape.numel() * self.dtype.size_in_bytes()
    }

    fn offset(&self, pos: usize, layer: usize) -> Result<usize> {
        if pos >= self.n {
            return Err(KindleError::InvalidArgument(format!(
                "position {pos} outside valid range 0..{}",
                self.n
            )));
        }
        if layer >= self.shape.n_layer {
            return Err(KindleError::InvalidArgument(format!(
                "layer {layer} exceeds n_layer {}",
                self.shape.n_layer
            )));
        }
        Ok(pos * self.shape.row_size() + layer * self.shape.layer_size())
    }
}

impl KvCache for ContiguousKvCache {
    fn shape(&self) -> KvCacheShape {
        self.shape
    }

    fn dtype(&self) -> DType {
        self.dtype
    }

    fn len(&self) -> usize {
        self.n
    }

    fn append_allowed(&self, incoming: usize) -> bool {
        append_allowed(self.n, incoming, self.shape.capacity)
    }

    fn append(&mut self, n_tokens: usize, keys: &[f32], values: &[f32]) -> Result<()> {
        let expected = n_tokens * self.shape.row_size();
        if keys.len() != expected || values.len() != expected {
            return Err(KindleError::ShapeMismatch {
                expected: vec![expected, expected],
                got: vec![keys.len(), values.len()],
            });
        }
        if !self.append_allowed(n_tokens) {
            return Err(KindleError::CapacityExceeded {
                current: self.n,
                incoming: n_tokens,
                capacity: self.shape.capacity,
            });
        }
        let offset = self.n * self.shape.row_size();
        self.keys.write(offset, keys);
        self.values.write(offset, values);
        self.n += n_tokens;
        Ok(())
    }

    fn shift(&mut self, n_discard: usize) -> Result<()> {
        if n_discard > self.n {
            return Err(KindleError::ShiftOutOfRange {
                n_discard,
                n: self.n,
            });
        }
        if n_discard == 0 {
            return Ok(());
        }
        let row = self.shape.row_size();
        let keep = self.n - n_discard;
        self.keys.move_down(n_discard * row, 0, keep * row);
        self.values.move_down(n_discard * row, 0, keep * row);
        self.n = keep;
        debug!(n_discard, remaining = keep, "shifted KV cache");
        Ok(())
    }

    fn clear(&mut self) {
        self.n = 0;
    }

    fn read_key(&self, pos: usize, layer: usize) -> Result<Vec<f32>> {
        let offset = self.offset(pos, layer)?;
        Ok(self.keys.read(offset, self.shape.layer_size()))
    }

    fn read_value(&self, pos: usize, layer: usize) -> Result<Vec<f32>> {
        let offset = self.offset(pos, layer)?;
        Ok(self.values.read(offset, self.shape.layer_size()))
    }

    fn snapshot(&self) -> KvSnapshot {
        let len = self.n * self.shape.row_size();
        KvSnapshot {
            shape: self.shape,
            dtype: self.dtype,
            n: self.n,
            keys: self.keys.prefix_bytes(len),
            values: self.values.prefix_bytes(len),
        }
    }

    fn restore(&mut self, snapshot: &KvSnapshot) -> Result<()> {
        if snapshot.shape != self.shape {
            return Err(KindleError::StateLoad(format!(
                "cache shape {:?} does not match {:?}",
                snapshot.shape, self.shape
            )));
        }
        if snapshot.dtype != self.dtype {
            return Err(KindleError::StateLoad(format!(
                "cache dtype {:?} does not match {:?}",
                snapshot.dtype, self.dtype
            )));
        }
        if snapshot.n > self.shape.capacity {
            return Err(KindleError::StateLoad(format!(
                "snapshot holds {} positions, capacity is {}",
                snapshot.n, self.shape.capacity
            )));
        }
        let expected = snapshot.expected_bytes();
        if snapshot.keys.len() != expected || snapshot.values.len() != expected {
            return Err(KindleError::StateLoad(format!(
                "snapshot payload is {}/{} bytes, expected {expected}",
                snapshot.keys.len(),
                snapshot.values.len()
            )));
        }
        self.keys.load_prefix(&snapshot.keys);
        self.values.load_prefix(&snapshot.values);
        self.n = snapshot.n;
        Ok(())
    }
}
