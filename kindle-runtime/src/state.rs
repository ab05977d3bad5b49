//! Saved context state.
//!
//! Layout, all integers little-endian:
//!
//! ```text
//! magic "KNDL" | version u32 | n_vocab u32 | n_embd u32
//! rng: seed [u8; 32] | stream u64 | word_pos u128
//! counters: t_load_us t_sample_us t_eval_us t_p_eval_us n_sample n_eval n_p_eval (u64 each)
//! tokens:    count u64 | u32 * count
//! logits:    count u64 | f32 * count
//! embedding: count u64 | f32 * count
//! kv: capacity n_layer n_head head_dim (u64 each) | dtype u8 | n u64
//!     keys: len u64 | bytes | values: len u64 | bytes
//! ```

use std::io::{Cursor, Read};
use std::path::Path;

use kindle_core::{DType, KindleError, KvCacheShape, KvSnapshot, Result, TokenId};

use crate::rng::RngPosition;
use crate::timings::Timings;

const STATE_MAGIC: u32 = 0x4C44_4E4B; // "KNDL" in little-endian
pub const STATE_VERSION: u32 = 1;

/// Timing counters as persisted. The start instant is not saved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Counters {
    pub t_load_us: u64,
    pub t_sample_us: u64,
    pub t_eval_us: u64,
    pub t_p_eval_us: u64,
    pub n_sample: u64,
    pub n_eval: u64,
    pub n_p_eval: u64,
}

impl From<&Timings> for Counters {
    fn from(t: &Timings) -> Self {
        Self {
            t_load_us: t.t_load_us,
            t_sample_us: t.t_sample_us,
            t_eval_us: t.t_eval_us,
            t_p_eval_us: t.t_p_eval_us,
            n_sample: t.n_sample,
            n_eval: t.n_eval,
            n_p_eval: t.n_p_eval,
        }
    }
}

impl Counters {
    pub fn apply_to(&self, t: &mut Timings) {
        t.t_load_us = self.t_load_us;
        t.t_sample_us = self.t_sample_us;
        t.t_eval_us = self.t_eval_us;
        t.t_p_eval_us = self.t_p_eval_us;
        t.n_sample = self.n_sample;
        t.n_eval = self.n_eval;
        t.n_p_eval = self.n_p_eval;
    }
}

/// Everything needed to resume a context exactly where it was saved.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextState {
    pub n_vocab: u32,
    pub n_embd: u32,
    pub rng: RngPosition,
    pub counters: Counters,
    pub tokens: Vec<TokenId>,
    pub logits: Vec<f32>,
    pub embedding: Vec<f32>,
    pub kv: KvSnapshot,
}

impl ContextState {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            128 + 4 * (self.tokens.len() + self.logits.len() + self.embedding.len())
                + self.kv.keys.len()
                + self.kv.values.len(),
        );
        buf.extend_from_slice(&STATE_MAGIC.to_le_bytes());
        buf.extend_from_slice(&STATE_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.n_vocab.to_le_bytes());
        buf.extend_from_slice(&self.n_embd.to_le_bytes());

        buf.extend_from_slice(&self.rng.seed);
        buf.extend_from_slice(&self.rng.stream.to_le_bytes());
        buf.extend_from_slice(&self.rng.word_pos.to_le_bytes());

        let c = &self.counters;
        for v in [
            c.t_load_us,
            c.t_sample_us,
            c.t_eval_us,
            c.t_p_eval_us,
            c.n_sample,
            c.n_eval,
            c.n_p_eval,
        ] {
            buf.extend_from_slice(&v.to_le_bytes());
        }

        write_len(&mut buf, self.tokens.len());
        for t in &self.tokens {
            buf.extend_from_slice(&t.to_le_bytes());
        }
        for values in [&self.logits, &self.embedding] {
            write_len(&mut buf, values.len());
            for v in values.iter() {
                buf.extend_from_slice(&v.to_le_bytes());
            }
        }

        let shape = &self.kv.shape;
        for dim in [shape.capacity, shape.n_layer, shape.n_head, shape.head_dim] {
            write_len(&mut buf, dim);
        }
        buf.push(self.kv.dtype.tag());
        write_len(&mut buf, self.kv.n);
        for bytes in [&self.kv.keys, &self.kv.values] {
            write_len(&mut buf, bytes.len());
            buf.extend_from_slice(bytes);
        }
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);

        let magic = read_u32(&mut cursor)?;
        if magic != STATE_MAGIC {
            return Err(KindleError::StateLoad(format!(
                "not a state file (magic: 0x{magic:08x}, expected 0x{STATE_MAGIC:08x})"
            )));
        }
        let version = read_u32(&mut cursor)?;
        if version != STATE_VERSION {
            return Err(KindleError::StateLoad(format!(
                "unsupported state version {version}"
            )));
        }
        let n_vocab = read_u32(&mut cursor)?;
        let n_embd = read_u32(&mut cursor)?;

        let mut seed = [0u8; 32];
        read_exact(&mut cursor, &mut seed)?;
        let rng = RngPosition {
            seed,
            stream: read_u64(&mut cursor)?,
            word_pos: read_u128(&mut cursor)?,
        };

        let counters = Counters {
            t_load_us: read_u64(&mut cursor)?,
            t_sample_us: read_u64(&mut cursor)?,
            t_eval_us: read_u64(&mut cursor)?,
            t_p_eval_us: read_u64(&mut cursor)?,
            n_sample: read_u64(&mut cursor)?,
            n_eval: read_u64(&mut cursor)?,
            n_p_eval: read_u64(&mut cursor)?,
        };

        let n_tokens = read_len(&mut cursor, 4)?;
        let tokens = (0..n_tokens)
            .map(|_| read_u32(&mut cursor))
            .collect::<Result<Vec<_>>>()?;
        let logits = read_f32_vec(&mut cursor)?;
        let embedding = read_f32_vec(&mut cursor)?;

        let shape = KvCacheShape {
            capacity: read_usize(&mut cursor)?,
            n_layer: read_usize(&mut cursor)?,
            n_head: read_usize(&mut cursor)?,
            head_dim: read_usize(&mut cursor)?,
        };
        let tag = read_u8(&mut cursor)?;
        let dtype = DType::from_tag(tag)
            .ok_or_else(|| KindleError::StateLoad(format!("unknown cache dtype tag {tag}")))?;
        let n = read_usize(&mut cursor)?;
        let keys = read_bytes(&mut cursor)?;
        let values = read_bytes(&mut cursor)?;

        if (cursor.position() as usize) != data.len() {
            return Err(KindleError::StateLoad(format!(
                "{} trailing bytes",
                data.len() - cursor.position() as usize
            )));
        }

        Ok(Self {
            n_vocab,
            n_embd,
            rng,
            counters,
            tokens,
            logits,
            embedding,
            kv: KvSnapshot {
                shape,
                dtype,
                n,
                keys,
                values,
            },
        })
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_bytes())?;
        Ok(())
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        let data = std::fs::read(path).map_err(|e| {
            KindleError::StateLoad(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_bytes(&data)
    }
}

fn write_len(buf: &mut Vec<u8>, len: usize) {
    buf.extend_from_slice(&(len as u64).to_le_bytes());
}

// --- readers ---

fn read_exact(cursor: &mut Cursor<&[u8]>, buf: &mut [u8]) -> Result<()> {
    cursor
        .read_exact(buf)
        .map_err(|_| KindleError::StateLoad("unexpected end of state file".into()))
}

fn read_u8(cursor: &mut Cursor<&[u8]>) -> Result<u8> {
    let mut buf = [0u8; 1];
    read_exact(cursor, &mut buf)?;
    Ok(buf[0])
}

fn read_u32(cursor: &mut Cursor<&[u8]>) -> Result<u32> {
    let mut buf = [0u8; 4];
    read_exact(cursor, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(cursor: &mut Cursor<&[u8]>) -> Result<u64> {
    let mut buf = [0u8; 8];
    read_exact(cursor, &mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_u128(cursor: &mut Cursor<&[u8]>) -> Result<u128> {
    let mut buf = [0u8; 16];
    read_exact(cursor, &mut buf)?;
    Ok(u128::from_le_bytes(buf))
}

fn read_f32(cursor: &mut Cursor<&[u8]>) -> Result<f32> {
    let mut buf = [0u8; 4];
    read_exact(cursor, &mut buf)?;
    Ok(f32::from_le_bytes(buf))
}

fn read_usize(cursor: &mut Cursor<&[u8]>) -> Result<usize> {
    let v = read_u64(cursor)?;
    usize::try_from(v).map_err(|_| KindleError::StateLoad(format!("value {v} out of range")))
}

/// A count of `elem_size`-byte elements that must fit in the remaining input.
fn read_len(cursor: &mut Cursor<&[u8]>, elem_size: usize) -> Result<usize> {
    let len = read_usize(cursor)?;
    let remaining = cursor.get_ref().len() - cursor.position() as usize;
    if len.checked_mul(elem_size).map_or(true, |bytes| bytes > remaining) {
        return Err(KindleError::StateLoad(format!(
            "length {len} runs past the end of the file"
        )));
    }
    Ok(len)
}

fn read_f32_vec(cursor: &mut Cursor<&[u8]>) -> Result<Vec<f32>> {
    let len = read_len(cursor, 4)?;
    (0..len).map(|_| read_f32(cursor)).collect()
}

fn read_bytes(cursor: &mut Cursor<&[u8]>) -> Result<Vec<u8>> {
    let len = read_len(cursor, 1)?;
    let mut buf = vec![0u8; len];
    read_exact(cursor, &mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> ContextState {
        ContextState {
            n_vocab: 3,
            n_embd: 2,
            rng: RngPosition {
                seed: [7; 32],
                stream: 1,
                word_pos: 1 << 70,
            },
            counters: Counters {
                n_sample: 4,
                ..Counters::default()
            },
            tokens: vec![2, 0],
            logits: vec![0.5, -1.0, 2.0],
            embedding: vec![],
            kv: KvSnapshot {
                shape: KvCacheShape {
                    capacity: 4,
                    n_layer: 1,
                    n_head: 1,
                    head_dim: 1,
                },
                dtype: DType::F32,
                n: 2,
                keys: vec![1; 8],
                values: vec![2; 8],
            },
        }
    }

    #[test]
    fn test_bytes_roundtrip() {
        let state = sample_state();
        let parsed = ContextState::from_bytes(&state.to_bytes()).unwrap();
        assert_eq!(parsed, state);
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = sample_state().to_bytes();
        bytes[0] = b'X';
        let err = ContextState::from_bytes(&bytes).unwrap_err();
        assert!(err.to_string().contains("not a state file"));
    }

    #[test]
    fn test_truncated_and_trailing() {
        let bytes = sample_state().to_bytes();
        assert!(ContextState::from_bytes(&bytes[..bytes.len() - 1]).is_err());
        let mut longer = bytes.clone();
        longer.push(0);
        assert!(ContextState::from_bytes(&longer).is_err());
    }

    #[test]
    fn test_huge_length_rejected_without_allocating() {
        let mut bytes = sample_state().to_bytes();
        // token count sits right after the fixed-size header
        let at = 16 + 32 + 8 + 16 + 7 * 8;
        bytes[at..at + 8].copy_from_slice(&u64::MAX.to_le_bytes());
        assert!(ContextState::from_bytes(&bytes).is_err());
    }
}
