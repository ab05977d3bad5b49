//! Inference context: one model, one KV cache, one RNG stream, and the
//! buffers of the last forward pass.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use kindle_core::{
    ContextParams, KindleError, KvCache, KvSnapshot, LoadRequest, Model, ModelInput, ModelOutput,
    ModelSource, Result, SampleResult, SamplingParams, ShiftPolicy, TokenId, Vocabulary,
};
use kindle_kvcache::ContiguousKvCache;

use crate::rng::ContextRng;
use crate::sampling::{CpuSampler, SamplingContext};
use crate::state::ContextState;
use crate::timings::Timings;

/// Cache and history as they were before a multi-step eval.
struct Checkpoint {
    kv: KvSnapshot,
    tokens: Vec<TokenId>,
    embedding: Vec<f32>,
}

pub struct InferenceContext {
    model: Box<dyn Model>,
    vocab: Arc<dyn Vocabulary>,
    params: ContextParams,
    kv_cache: Box<dyn KvCache>,
    rng: ContextRng,
    sampler: CpuSampler,
    timings: Timings,
    /// Tokens whose keys/values are in the cache, oldest first.
    tokens: Vec<TokenId>,
    /// `[n_rows][n_vocab]` from the last eval.
    logits: Vec<f32>,
    embedding: Vec<f32>,
}

impl InferenceContext {
    /// Wrap an already loaded model.
    pub fn new(
        model: Box<dyn Model>,
        vocab: Arc<dyn Vocabulary>,
        params: ContextParams,
    ) -> Result<Self> {
        if params.n_ctx == 0 || params.n_batch == 0 {
            return Err(KindleError::InvalidArgument(format!(
                "n_ctx ({}) and n_batch ({}) must be positive",
                params.n_ctx, params.n_batch
            )));
        }
        let config = model.config().clone();
        if config.n_vocab != vocab.n_vocab() {
            return Err(KindleError::InvalidArgument(format!(
                "model expects {} tokens, vocabulary has {}",
                config.n_vocab,
                vocab.n_vocab()
            )));
        }
        if params.n_ctx > config.n_ctx_train {
            warn!(
                n_ctx = params.n_ctx,
                n_ctx_train = config.n_ctx_train,
                "context is longer than the model was trained on"
            );
        }

        let kv_cache = ContiguousKvCache::new(config.kv_shape(params.n_ctx), params.kv_dtype());
        info!(
            arch = config.arch.name(),
            n_vocab = config.n_vocab,
            n_ctx = params.n_ctx,
            n_embd = config.n_embd,
            kv_mib = kv_cache.size_bytes() as f64 / (1024.0 * 1024.0),
            vocab_only = params.vocab_only,
            "created inference context"
        );

        Ok(Self {
            model,
            vocab,
            rng: ContextRng::new(params.seed),
            params,
            kv_cache: Box::new(kv_cache),
            sampler: CpuSampler,
            timings: Timings::default(),
            tokens: Vec::new(),
            logits: Vec::new(),
            embedding: Vec::new(),
        })
    }

    /// Load a model through `source` and wrap it.
    ///
    /// `progress` sees values clamped to `[0, 1]`, never decreasing, and
    /// always ends with `1.0` on success.
    pub fn load(
        source: &dyn ModelSource,
        vocab: Arc<dyn Vocabulary>,
        params: ContextParams,
        mut progress: impl FnMut(f32),
    ) -> Result<Self> {
        let start = Instant::now();
        let mut last = 0.0f32;
        let mut report = |fraction: f32| {
            let clamped = if fraction.is_nan() {
                last
            } else {
                fraction.clamp(0.0, 1.0)
            };
            if clamped < last {
                warn!(reported = fraction, last, "load progress went backwards");
            }
            last = last.max(clamped);
            progress(last);
        };
        let model = source.load(&LoadRequest::from(&params), &mut report)?;
        if last < 1.0 {
            progress(1.0);
        }

        let mut ctx = Self::new(model, vocab, params)?;
        ctx.timings.record_load(start.elapsed());
        info!(
            load_ms = ctx.timings.t_load_us as f64 / 1000.0,
            "model loaded"
        );
        Ok(ctx)
    }

    pub fn n_vocab(&self) -> usize {
        self.model.config().n_vocab
    }

    pub fn n_ctx(&self) -> usize {
        self.params.n_ctx
    }

    pub fn n_embd(&self) -> usize {
        self.model.config().n_embd
    }

    /// Positions currently held in the KV cache.
    pub fn n_past(&self) -> usize {
        self.kv_cache.len()
    }

    pub fn params(&self) -> &ContextParams {
        &self.params
    }

    pub fn model(&self) -> &dyn Model {
        self.model.as_ref()
    }

    pub fn vocab(&self) -> &dyn Vocabulary {
        self.vocab.as_ref()
    }

    pub fn kv_cache(&self) -> &dyn KvCache {
        self.kv_cache.as_ref()
    }

    /// Tokens currently held in the KV cache, oldest first.
    pub fn tokens(&self) -> &[TokenId] {
        &self.tokens
    }

    /// Logits of the last eval: one row, or one per evaluated token with
    /// `logits_all`.
    pub fn logits(&self) -> &[f32] {
        &self.logits
    }

    /// Embedding of the last eval. Only available in embedding mode.
    pub fn embedding(&self) -> Result<&[f32]> {
        if !self.params.embedding {
            return Err(KindleError::InvalidArgument(
                "context was not created in embedding mode".into(),
            ));
        }
        Ok(&self.embedding)
    }

    pub fn timings(&self) -> &Timings {
        &self.timings
    }

    // --- vocabulary ---

    pub fn token_to_str(&self, id: TokenId) -> Result<&str> {
        self.vocab.token_to_str(id)
    }

    pub fn str_to_token(&self, text: &str) -> Result<TokenId> {
        self.vocab.str_to_token(text)
    }

    /// Tokenize `text`, failing if it needs more than `n_max_tokens` tokens.
    pub fn tokenize(&self, text: &str, add_bos: bool, n_max_tokens: usize) -> Result<Vec<TokenId>> {
        let tokens = self.vocab.tokenize(text, add_bos)?;
        if tokens.len() > n_max_tokens {
            return Err(KindleError::TokenizeOverflow {
                needed: tokens.len(),
                capacity: n_max_tokens,
            });
        }
        Ok(tokens)
    }

    /// Tokenize into `out`, returning the token count. `out` is untouched
    /// when the tokens do not fit.
    pub fn tokenize_into(&self, text: &str, add_bos: bool, out: &mut [TokenId]) -> Result<usize> {
        let tokens = self.tokenize(text, add_bos, out.len())?;
        out[..tokens.len()].copy_from_slice(&tokens);
        Ok(tokens.len())
    }

    pub fn token_bos(&self) -> TokenId {
        self.vocab.bos()
    }

    pub fn token_eos(&self) -> TokenId {
        self.vocab.eos()
    }

    // --- evaluation ---

    /// Run the model over `tokens`, `n_batch` at a time, appending to the
    /// cache and shifting it first when the policy allows.
    pub fn eval(&mut self, tokens: &[TokenId]) -> Result<()> {
        if self.params.vocab_only {
            return Err(KindleError::InvalidArgument(
                "cannot eval in a vocab-only context".into(),
            ));
        }
        if tokens.is_empty() {
            return Err(KindleError::InvalidArgument("no tokens to eval".into()));
        }
        let n_vocab = self.n_vocab();
        if let Some(&bad) = tokens.iter().find(|&&t| t as usize >= n_vocab) {
            return Err(KindleError::TokenNotFound(format!("id {bad}")));
        }

        let capacity = self.kv_cache.capacity();
        let largest_chunk = tokens.len().min(self.params.n_batch);
        if largest_chunk > capacity {
            return Err(KindleError::CapacityExceeded {
                current: self.kv_cache.len(),
                incoming: largest_chunk,
                capacity,
            });
        }
        if self.params.shift == ShiftPolicy::Disabled && !self.kv_cache.append_allowed(tokens.len()) {
            return Err(KindleError::CapacityExceeded {
                current: self.kv_cache.len(),
                incoming: tokens.len(),
                capacity,
            });
        }

        // A single chunk that fits is all-or-nothing on its own; anything
        // that shifts or spans chunks is undone from a checkpoint on failure.
        let checkpoint = (tokens.len() > self.params.n_batch
            || !self.kv_cache.append_allowed(tokens.len()))
        .then(|| self.checkpoint());

        match self.eval_chunks(tokens) {
            Ok(logits) => {
                self.logits = logits;
                Ok(())
            }
            Err(err) => {
                if let Some(checkpoint) = checkpoint {
                    self.rollback(checkpoint)?;
                    debug!(error = %err, n_past = self.tokens.len(), "eval rolled back");
                }
                Err(err)
            }
        }
    }

    fn eval_chunks(&mut self, tokens: &[TokenId]) -> Result<Vec<f32>> {
        let mut all_logits = Vec::new();
        for chunk in tokens.chunks(self.params.n_batch) {
            let output = self.eval_chunk(chunk)?;
            if self.params.logits_all {
                all_logits.extend_from_slice(&output.logits);
            } else {
                all_logits = output.logits;
            }
        }
        Ok(all_logits)
    }

    fn eval_chunk(&mut self, chunk: &[TokenId]) -> Result<ModelOutput> {
        if !self.kv_cache.append_allowed(chunk.len()) {
            self.make_room(chunk.len())?;
        }

        let n_past = self.kv_cache.len();
        let input = ModelInput {
            token_ids: chunk.to_vec(),
            positions: (n_past..n_past + chunk.len()).map(|p| p as u32).collect(),
            logits_all: self.params.logits_all,
            want_embedding: self.params.embedding,
        };
        let n_tokens = input.n_tokens();

        let start = Instant::now();
        let mut output = self.model.forward(&input, self.kv_cache.as_ref())?;
        self.check_output(&output, n_tokens)?;

        self.kv_cache.append(n_tokens, &output.keys, &output.values)?;
        self.tokens.extend_from_slice(chunk);
        if let Some(embedding) = output.embedding.take() {
            if self.params.embedding {
                self.embedding = embedding;
            }
        }
        if !self.params.logits_all {
            let n_vocab = self.n_vocab();
            output.logits.drain(..output.logits.len() - n_vocab);
        }
        self.timings.record_eval(n_tokens, start.elapsed());
        debug!(
            n_tokens,
            cache_usage = self.kv_cache.usage().usage_ratio(),
            "evaluated chunk"
        );
        Ok(output)
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            kv: self.kv_cache.snapshot(),
            tokens: self.tokens.clone(),
            embedding: self.embedding.clone(),
        }
    }

    fn rollback(&mut self, checkpoint: Checkpoint) -> Result<()> {
        self.kv_cache.restore(&checkpoint.kv)?;
        self.tokens = checkpoint.tokens;
        self.embedding = checkpoint.embedding;
        Ok(())
    }

    /// Reject malformed engine output before anything is appended.
    fn check_output(&self, output: &ModelOutput, n_tokens: usize) -> Result<()> {
        let n_vocab = self.n_vocab();
        let row = self.kv_cache.shape().row_size();
        let n_rows = if self.params.logits_all { n_tokens } else { 1 };

        // a model may return every row even when only the last is wanted
        let logits_ok = output.logits.len() == n_rows * n_vocab
            || output.logits.len() == n_tokens * n_vocab;
        if !logits_ok {
            return Err(KindleError::ShapeMismatch {
                expected: vec![n_rows, n_vocab],
                got: vec![output.logits.len()],
            });
        }
        if output.keys.len() != n_tokens * row || output.values.len() != n_tokens * row {
            return Err(KindleError::ShapeMismatch {
                expected: vec![n_tokens, row],
                got: vec![output.keys.len(), output.values.len()],
            });
        }
        if self.params.embedding {
            let got = output.embedding.as_ref().map_or(0, Vec::len);
            if got != self.n_embd() {
                return Err(KindleError::ShapeMismatch {
                    expected: vec![self.n_embd()],
                    got: vec![got],
                });
            }
        }
        Ok(())
    }

    /// Free room for `incoming` positions according to the shift policy.
    fn make_room(&mut self, incoming: usize) -> Result<()> {
        let n = self.kv_cache.len();
        let capacity = self.kv_cache.capacity();
        let required = (n + incoming).saturating_sub(capacity);
        let n_discard = match self.params.shift {
            ShiftPolicy::Disabled => {
                return Err(KindleError::CapacityExceeded {
                    current: n,
                    incoming,
                    capacity,
                })
            }
            ShiftPolicy::DiscardHalf => (n / 2).max(required),
            ShiftPolicy::Discard(amount) => amount.max(required),
        };
        self.shift_kv_cache(n_discard.min(n))
    }

    /// Drop the oldest `n_discard` positions from the cache and the token
    /// history alike.
    pub fn shift_kv_cache(&mut self, n_discard: usize) -> Result<()> {
        self.kv_cache.shift(n_discard)?;
        self.tokens.drain(..n_discard);
        debug!(n_discard, n_past = self.tokens.len(), "shifted context");
        Ok(())
    }

    /// Sample one token from the last logits row.
    pub fn sample(
        &mut self,
        params: &SamplingParams,
        sctx: &mut SamplingContext<'_>,
    ) -> Result<SampleResult> {
        let n_vocab = self.n_vocab();
        if self.logits.len() < n_vocab {
            return Err(KindleError::InvalidArgument("no logits yet, eval first".into()));
        }
        let row = &self.logits[self.logits.len() - n_vocab..];

        let start = Instant::now();
        let result = self.sampler.sample(row, params, sctx, &mut self.rng)?;
        self.timings.record_sample(start.elapsed());
        debug!(token = result.token_id, logprob = result.logprob, "sampled");
        Ok(result)
    }

    /// `eval` then `sample`.
    pub fn decode_step(
        &mut self,
        tokens: &[TokenId],
        params: &SamplingParams,
        sctx: &mut SamplingContext<'_>,
    ) -> Result<SampleResult> {
        self.eval(tokens)?;
        self.sample(params, sctx)
    }

    // --- state ---

    pub fn save_state(&self, path: impl AsRef<Path>) -> Result<()> {
        let state = ContextState {
            n_vocab: self.n_vocab() as u32,
            n_embd: self.n_embd() as u32,
            rng: self.rng.position(),
            counters: (&self.timings).into(),
            tokens: self.tokens.clone(),
            logits: self.logits.clone(),
            embedding: self.embedding.clone(),
            kv: self.kv_cache.snapshot(),
        };
        state.write_to(path.as_ref())?;
        debug!(path = %path.as_ref().display(), n_past = self.tokens.len(), "saved state");
        Ok(())
    }

    /// Restore a state written by `save_state`. The context is unchanged
    /// unless the whole file is valid for it.
    pub fn load_state(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let state = ContextState::read_from(path.as_ref())?;
        self.check_state(&state)?;

        self.kv_cache.restore(&state.kv)?;
        self.rng = ContextRng::from_position(&state.rng);
        state.counters.apply_to(&mut self.timings);
        self.tokens = state.tokens;
        self.logits = state.logits;
        self.embedding = state.embedding;
        debug!(path = %path.as_ref().display(), n_past = self.tokens.len(), "loaded state");
        Ok(())
    }

    fn check_state(&self, state: &ContextState) -> Result<()> {
        let fail = |msg: String| Err(KindleError::StateLoad(msg));
        let n_vocab = self.n_vocab();
        if state.n_vocab as usize != n_vocab || state.n_embd as usize != self.n_embd() {
            return fail(format!(
                "state is for n_vocab {} / n_embd {}, context has {} / {}",
                state.n_vocab,
                state.n_embd,
                n_vocab,
                self.n_embd()
            ));
        }
        if state.kv.shape != self.kv_cache.shape() || state.kv.dtype != self.kv_cache.dtype() {
            return fail(format!(
                "state cache {:?}/{:?} does not match {:?}/{:?}",
                state.kv.shape,
                state.kv.dtype,
                self.kv_cache.shape(),
                self.kv_cache.dtype()
            ));
        }
        let expected = state.kv.expected_bytes();
        if state.kv.n > state.kv.shape.capacity
            || state.kv.keys.len() != expected
            || state.kv.values.len() != expected
        {
            return fail("cache payload does not match its header".into());
        }
        if state.tokens.len() != state.kv.n {
            return fail(format!(
                "{} tokens for {} cached positions",
                state.tokens.len(),
                state.kv.n
            ));
        }
        if state.tokens.iter().any(|&t| t as usize >= n_vocab) {
            return fail("token id outside the vocabulary".into());
        }
        if state.logits.len() % n_vocab != 0 {
            return fail(format!(
                "{} logits is not a whole number of rows",
                state.logits.len()
            ));
        }
        if !state.embedding.is_empty() && state.embedding.len() != self.n_embd() {
            return fail(format!("embedding of length {}", state.embedding.len()));
        }
        Ok(())
    }

    pub fn reset_timings(&mut self) {
        self.timings.reset();
    }

    pub fn print_timings(&self) {
        self.timings.print();
    }
}
