use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::kvcache::KvCacheShape;
use crate::Result;

/// Vocabulary index of a token.
pub type TokenId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F32,
    F16,
}

impl DType {
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 => 2,
        }
    }

    pub fn tag(&self) -> u8 {
        match self {
            DType::F32 => 0,
            DType::F16 => 1,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(DType::F32),
            1 => Some(DType::F16),
            _ => None,
        }
    }
}

/// Model architectures a context can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelArch {
    GptNeoX,
    Gpt2,
    GptJ,
    Llama,
    Rwkv,
}

impl ModelArch {
    /// Recurrent models carry their history in a fixed-size state instead of
    /// per-position attention tensors.
    pub fn is_recurrent(&self) -> bool {
        matches!(self, ModelArch::Rwkv)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ModelArch::GptNeoX => "gpt-neox",
            ModelArch::Gpt2 => "gpt-2",
            ModelArch::GptJ => "gpt-j",
            ModelArch::Llama => "llama",
            ModelArch::Rwkv => "rwkv",
        }
    }
}

/// Hyperparameters the context needs from a loaded model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub arch: ModelArch,
    pub n_vocab: usize,
    /// Context length the model was trained with.
    pub n_ctx_train: usize,
    pub n_embd: usize,
    pub n_head: usize,
    pub n_layer: usize,
}

impl ModelConfig {
    pub fn head_dim(&self) -> usize {
        if self.n_head == 0 {
            0
        } else {
            self.n_embd / self.n_head
        }
    }

    /// Shape of the KV cache a context of `capacity` positions needs.
    ///
    /// Recurrent models still count positions but store zero-width rows.
    pub fn kv_shape(&self, capacity: usize) -> KvCacheShape {
        let head_dim = if self.arch.is_recurrent() {
            0
        } else {
            self.head_dim()
        };
        KvCacheShape {
            capacity,
            n_layer: self.n_layer,
            n_head: self.n_head,
            head_dim,
        }
    }
}

/// What to do when an eval would overflow the KV cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShiftPolicy {
    /// Fail with `CapacityExceeded`.
    Disabled,
    /// Drop the older half of the cache (or more, if the batch needs it).
    DiscardHalf,
    /// Drop at least this many of the oldest positions.
    Discard(usize),
}

/// Parameters accepted at context creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextParams {
    /// Text context length; the KV cache holds this many positions.
    pub n_ctx: usize,
    /// Number of model file parts, -1 to detect.
    pub n_parts: i32,
    /// Worker threads the tensor engine may use.
    pub n_threads: usize,
    /// RNG seed, 0 for a non-deterministic seed.
    pub seed: u32,
    /// Maximum tokens handed to one forward pass.
    pub n_batch: usize,
    /// Store the KV cache in half precision.
    pub f16_kv: bool,
    /// Keep logits for every evaluated position, not just the last one.
    pub logits_all: bool,
    /// Load only the vocabulary, no weights.
    pub vocab_only: bool,
    pub use_mmap: bool,
    /// Ask the OS to keep the weights resident.
    pub use_mlock: bool,
    /// Embedding extraction mode.
    pub embedding: bool,
    pub shift: ShiftPolicy,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            n_ctx: 512,
            n_parts: -1,
            n_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            seed: 0,
            n_batch: 512,
            f16_kv: true,
            logits_all: false,
            vocab_only: false,
            use_mmap: true,
            use_mlock: false,
            embedding: false,
            shift: ShiftPolicy::DiscardHalf,
        }
    }
}

impl ContextParams {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn kv_dtype(&self) -> DType {
        if self.f16_kv {
            DType::F16
        } else {
            DType::F32
        }
    }
}
