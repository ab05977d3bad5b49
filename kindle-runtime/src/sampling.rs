use std::collections::HashMap;

use rand::Rng;
use tracing::debug;

use kindle_core::{KindleError, MirostatState, Result, SampleResult, SamplingParams, Strategy, TokenId};

use crate::candidates::{Candidate, CandidateSet};
use crate::constraints::GrammarState;
use crate::mirostat::{self, surprise};

/// Per-call inputs the sampler reads or advances besides the logits.
#[derive(Default)]
pub struct SamplingContext<'a> {
    /// Recent token history, oldest first.
    pub last_tokens: &'a [TokenId],
    /// Token whose logit is restored after the penalties unless
    /// `penalize_nl` is set.
    pub newline_token: Option<TokenId>,
    /// Required by the Mirostat strategies, updated in place.
    pub mirostat: Option<&'a mut MirostatState>,
    /// Required by the grammar strategy, advanced by the chosen token.
    pub grammar: Option<&'a mut GrammarState>,
}

/// Logit processor pipeline: the history penalties, applied in the logit
/// domain before any strategy runs.
pub struct LogitProcessorPipeline {
    repeat_penalty: f32,
    repeat_last_n: i32,
    presence_penalty: f32,
    frequency_penalty: f32,
    penalize_nl: bool,
}

impl LogitProcessorPipeline {
    pub fn from_params(params: &SamplingParams) -> Self {
        Self {
            repeat_penalty: params.repeat_penalty,
            repeat_last_n: params.repeat_last_n,
            presence_penalty: params.presence_penalty,
            frequency_penalty: params.frequency_penalty,
            penalize_nl: params.penalize_nl,
        }
    }

    /// Apply all processors in order. Modifies `candidates` in place.
    pub fn apply(&self, candidates: &mut CandidateSet, ctx: &SamplingContext<'_>) {
        let window = self.window(ctx.last_tokens);
        if window.is_empty() {
            return;
        }
        let saved_nl = if self.penalize_nl {
            None
        } else {
            ctx.newline_token
                .and_then(|id| candidates.logit_mut(id).map(|logit| (id, *logit)))
        };

        self.apply_repetition_penalty(candidates, window);
        self.apply_presence_frequency_penalty(candidates, window);

        if let Some((id, logit)) = saved_nl {
            if let Some(slot) = candidates.logit_mut(id) {
                *slot = logit;
            }
        }
    }

    /// The most recent `repeat_last_n` tokens. Empty when disabled.
    fn window<'t>(&self, history: &'t [TokenId]) -> &'t [TokenId] {
        if self.repeat_last_n <= 0 {
            return &[];
        }
        let n = (self.repeat_last_n as usize).min(history.len());
        &history[history.len() - n..]
    }

    fn apply_repetition_penalty(&self, candidates: &mut CandidateSet, window: &[TokenId]) {
        if (self.repeat_penalty - 1.0).abs() < f32::EPSILON {
            return;
        }
        // Each distinct token is penalized exactly once.
        let mut seen = std::collections::HashSet::new();
        for &token_id in window {
            if !seen.insert(token_id) {
                continue;
            }
            if let Some(logit) = candidates.logit_mut(token_id) {
                if *logit > 0.0 {
                    *logit /= self.repeat_penalty;
                } else {
                    *logit *= self.repeat_penalty;
                }
            }
        }
    }

    fn apply_presence_frequency_penalty(&self, candidates: &mut CandidateSet, window: &[TokenId]) {
        if self.presence_penalty.abs() < f32::EPSILON
            && self.frequency_penalty.abs() < f32::EPSILON
        {
            return;
        }
        for (token_id, count) in count_tokens(window) {
            if let Some(logit) = candidates.logit_mut(token_id) {
                *logit -= count as f32 * self.frequency_penalty + self.presence_penalty;
            }
        }
    }
}

/// CPU sampler: penalties, grammar mask, temperature, one strategy, one draw.
pub struct CpuSampler;

impl CpuSampler {
    /// Choose one token from a row of logits.
    ///
    /// Greedy selection (`temperature <= 0`) draws nothing from `rng`; every
    /// other path draws exactly one `f32`.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        logits: &[f32],
        params: &SamplingParams,
        ctx: &mut SamplingContext<'_>,
        rng: &mut R,
    ) -> Result<SampleResult> {
        if logits.is_empty() {
            return Err(KindleError::InvalidArgument("empty logits".into()));
        }
        self.check_context(params, ctx)?;

        let mut candidates = CandidateSet::from_logits(logits);
        LogitProcessorPipeline::from_params(params).apply(&mut candidates, ctx);

        if let Some(grammar) = ctx.grammar.as_deref() {
            grammar.apply(&mut candidates)?;
            candidates.prune_masked();
        }

        let result = if params.is_greedy() {
            self.greedy(&candidates)?
        } else {
            candidates.apply_temperature(params.temperature);
            self.truncate(&mut candidates, params, ctx);
            self.draw(&candidates, rng)?
        };

        if !params.is_greedy() {
            match (params.strategy, ctx.mirostat.as_deref_mut()) {
                (Strategy::Mirostat { tau, eta, .. }, Some(state))
                | (Strategy::MirostatV2 { tau, eta }, Some(state)) => {
                    let observed = surprise(result.logprob.exp());
                    let delta = state.update(tau, eta, observed);
                    debug!(observed, delta, mu = state.mu, "mirostat update");
                }
                _ => {}
            }
        }

        if let Some(grammar) = ctx.grammar.as_deref_mut() {
            grammar.accept(result.token_id)?;
        }

        Ok(result)
    }

    fn check_context(&self, params: &SamplingParams, ctx: &SamplingContext<'_>) -> Result<()> {
        match params.strategy {
            Strategy::Mirostat { .. } | Strategy::MirostatV2 { .. } if ctx.mirostat.is_none() => {
                Err(KindleError::InvalidArgument(
                    "mirostat sampling needs a MirostatState".into(),
                ))
            }
            Strategy::Grammar if ctx.grammar.is_none() => Err(KindleError::InvalidArgument(
                "grammar sampling needs a GrammarState".into(),
            )),
            Strategy::Grammar => Ok(()),
            _ if ctx.grammar.is_some() => Err(KindleError::InvalidArgument(format!(
                "a grammar cannot be combined with {:?}",
                params.strategy
            ))),
            _ => Ok(()),
        }
    }

    fn truncate(&self, candidates: &mut CandidateSet, params: &SamplingParams, ctx: &SamplingContext<'_>) {
        match params.strategy {
            Strategy::Plain | Strategy::Grammar => candidates.softmax(),
            Strategy::TopK { k } => candidates.top_k(k),
            Strategy::TopP { p } => candidates.top_p(p),
            Strategy::Chain {
                top_k,
                tfs_z,
                typical_p,
                top_p,
            } => {
                candidates.top_k(top_k);
                candidates.tail_free(tfs_z);
                candidates.typical(typical_p);
                candidates.top_p(top_p);
            }
            Strategy::Mirostat { m, tau, .. } => {
                let mu = ctx.mirostat.as_deref().map_or(2.0 * tau, |s| s.mu);
                mirostat::truncate_v1(candidates, mu, m);
            }
            Strategy::MirostatV2 { tau, .. } => {
                let mu = ctx.mirostat.as_deref().map_or(2.0 * tau, |s| s.mu);
                mirostat::truncate_v2(candidates, mu);
            }
        }
        // filters that returned early left probabilities unset
        candidates.normalize();
    }

    fn greedy(&self, candidates: &CandidateSet) -> Result<SampleResult> {
        let best = candidates
            .greedy()
            .ok_or_else(|| KindleError::InvalidArgument("empty candidate set".into()))?;
        Ok(SampleResult {
            token_id: best.token_id,
            logprob: candidates.log_prob_of(&best),
        })
    }

    fn draw<R: Rng + ?Sized>(&self, candidates: &CandidateSet, rng: &mut R) -> Result<SampleResult> {
        let r: f32 = rng.gen();
        let chosen: Candidate = candidates
            .sample_index(r)
            .and_then(|i| candidates.get(i).copied())
            .ok_or_else(|| KindleError::Internal("no candidate carries probability mass".into()))?;
        Ok(SampleResult {
            token_id: chosen.token_id,
            logprob: chosen.p.ln(),
        })
    }
}

fn count_tokens(tokens: &[TokenId]) -> HashMap<TokenId, usize> {
    let mut counts = HashMap::new();
    for &t in tokens {
        *counts.entry(t).or_insert(0) += 1;
    }
    counts
}
