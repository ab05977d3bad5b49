use crate::kvcache::KvCache;
use crate::types::{ContextParams, ModelArch, ModelConfig, TokenId};
use crate::Result;

/// One forward pass worth of input.
#[derive(Debug, Clone)]
pub struct ModelInput {
    pub token_ids: Vec<TokenId>,
    /// Absolute cache position of each token.
    pub positions: Vec<u32>,
    /// Return logits for every token instead of only the last one.
    pub logits_all: bool,
    pub want_embedding: bool,
}

impl ModelInput {
    pub fn n_tokens(&self) -> usize {
        self.token_ids.len()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ModelOutput {
    /// Row-major `[n_rows][n_vocab]`, `n_rows` being `n_tokens` with
    /// `logits_all` and 1 otherwise.
    pub logits: Vec<f32>,
    /// `[n_embd]`, present when an embedding was requested.
    pub embedding: Option<Vec<f32>>,
    /// New key rows, `[n_tokens][n_layer][n_head][head_dim]`.
    pub keys: Vec<f32>,
    /// New value rows, same layout as `keys`.
    pub values: Vec<f32>,
}

/// A loaded model of some architecture, driven by an inference context.
pub trait Model: Send {
    fn arch(&self) -> ModelArch;

    fn config(&self) -> &ModelConfig;

    /// Run the external tensor engine over `input`, reading attention history
    /// from `cache`. The caller appends the returned key/value rows.
    fn forward(&mut self, input: &ModelInput, cache: &dyn KvCache) -> Result<ModelOutput>;
}

/// Load-time options forwarded to a [`ModelSource`].
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub n_ctx: usize,
    pub n_parts: i32,
    pub n_threads: usize,
    pub vocab_only: bool,
    pub use_mmap: bool,
    pub use_mlock: bool,
}

impl From<&ContextParams> for LoadRequest {
    fn from(params: &ContextParams) -> Self {
        Self {
            n_ctx: params.n_ctx,
            n_parts: params.n_parts,
            n_threads: params.n_threads,
            vocab_only: params.vocab_only,
            use_mmap: params.use_mmap,
            use_mlock: params.use_mlock,
        }
    }
}

/// Something that can produce a [`Model`], reporting progress in `[0, 1]`.
pub trait ModelSource {
    fn load(&self, request: &LoadRequest, progress: &mut dyn FnMut(f32)) -> Result<Box<dyn Model>>;
}
