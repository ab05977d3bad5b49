//! Deterministic stand-ins for the external tensor engine.

#![allow(dead_code)]

use std::sync::Arc;

use kindle_core::{
    ContextParams, KindleError, KvCache, LoadRequest, Model, ModelArch, ModelConfig, ModelInput,
    ModelOutput, ModelSource, Result, TokenId, Vocabulary,
};
use kindle_runtime::{InferenceContext, KindleTokenizer};
use serde_json::{json, Map, Value};

pub const N_VOCAB: usize = 8;
pub const N_EMBD: usize = 4;

pub fn vocab() -> Arc<dyn Vocabulary> {
    Arc::new(bpe_tokenizer(
        &["<s>", "</s>", "a", "b", "c", " ", "\n", "ab"],
        &["a b"],
    ))
}

/// In-memory BPE `tokenizer.json` with `tokens[i]` at id `i`. Empty entries
/// leave their id unassigned; `<s>` and `</s>` are special tokens.
pub fn bpe_tokenizer(tokens: &[&str], merges: &[&str]) -> KindleTokenizer {
    let vocab: Map<String, Value> = tokens
        .iter()
        .enumerate()
        .filter(|(_, text)| !text.is_empty())
        .map(|(id, text)| (text.to_string(), json!(id)))
        .collect();
    let added: Vec<Value> = tokens
        .iter()
        .enumerate()
        .filter(|(_, text)| matches!(**text, "<s>" | "</s>"))
        .map(|(id, text)| {
            json!({
                "id": id, "content": text, "single_word": false, "lstrip": false,
                "rstrip": false, "normalized": false, "special": true
            })
        })
        .collect();
    let file = json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": added,
        "normalizer": null,
        "pre_tokenizer": null,
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "BPE",
            "dropout": null,
            "unk_token": null,
            "continuing_subword_prefix": null,
            "end_of_word_suffix": null,
            "fuse_unk": false,
            "byte_fallback": false,
            "vocab": vocab,
            "merges": merges
        }
    });
    KindleTokenizer::from_bytes(file.to_string()).unwrap()
}

pub fn config(arch: ModelArch) -> ModelConfig {
    ModelConfig {
        arch,
        n_vocab: N_VOCAB,
        n_ctx_train: 64,
        n_embd: N_EMBD,
        n_head: 2,
        n_layer: 2,
    }
}

/// Logits depend only on the token and its position; every key/value
/// element of a token equals its id.
pub struct ToyModel {
    pub config: ModelConfig,
    /// Return key rows one element short.
    pub broken: bool,
    /// Fail the forward pass with this 1-based call number.
    pub fail_at: Option<usize>,
    pub calls: usize,
}

impl ToyModel {
    pub fn new(arch: ModelArch) -> Self {
        Self {
            config: config(arch),
            broken: false,
            fail_at: None,
            calls: 0,
        }
    }
}

pub fn toy_logits(token: TokenId, pos: u32) -> Vec<f32> {
    (0..N_VOCAB)
        .map(|v| ((token as f32) * 1.3 + (v as f32) * 0.7 + (pos as f32) * 0.11).sin() * 2.0)
        .collect()
}

impl Model for ToyModel {
    fn arch(&self) -> ModelArch {
        self.config.arch
    }

    fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn forward(&mut self, input: &ModelInput, cache: &dyn KvCache) -> Result<ModelOutput> {
        self.calls += 1;
        if self.fail_at == Some(self.calls) {
            return Err(KindleError::Internal("engine failure".into()));
        }
        if input.positions.len() != input.n_tokens()
            || input.positions.first().copied() != Some(cache.len() as u32)
        {
            return Err(KindleError::Internal("positions do not follow the cache".into()));
        }
        let row = cache.shape().row_size();
        let mut logits = Vec::new();
        let mut keys = Vec::new();
        for (&token, &pos) in input.token_ids.iter().zip(&input.positions) {
            logits.extend(toy_logits(token, pos));
            keys.extend(std::iter::repeat(token as f32).take(row));
        }
        if !input.logits_all {
            logits.drain(..logits.len() - N_VOCAB);
        }
        if self.broken {
            keys.pop();
        }
        let values = keys.iter().map(|k| -k).collect();
        let last = input.token_ids.last().copied().unwrap_or(0) as f32;
        Ok(ModelOutput {
            logits,
            embedding: input.want_embedding.then(|| vec![last; N_EMBD]),
            keys,
            values,
        })
    }
}

/// Reports a fixed, misbehaving progress sequence while "loading".
pub struct ToySource {
    pub reports: Vec<f32>,
    pub fail: bool,
}

impl ModelSource for ToySource {
    fn load(&self, _request: &LoadRequest, progress: &mut dyn FnMut(f32)) -> Result<Box<dyn Model>> {
        for &p in &self.reports {
            progress(p);
        }
        if self.fail {
            return Err(KindleError::ModelLoad("weights missing".into()));
        }
        Ok(Box::new(ToyModel::new(ModelArch::Llama)))
    }
}

pub fn params(n_ctx: usize) -> ContextParams {
    ContextParams {
        n_ctx,
        seed: 42,
        ..ContextParams::default()
    }
}

pub fn context(params: ContextParams) -> InferenceContext {
    context_with(ToyModel::new(ModelArch::GptNeoX), params)
}

pub fn context_with(model: ToyModel, params: ContextParams) -> InferenceContext {
    InferenceContext::new(Box::new(model), vocab(), params).unwrap()
}
