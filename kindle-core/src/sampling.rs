use serde::{Deserialize, Serialize};

use crate::types::TokenId;
use crate::Result;

/// Truncation/selection strategy. Exactly one applies per sampling call;
/// penalties and temperature compose with any of them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Strategy {
    /// Draw from the full softmax distribution.
    Plain,
    /// Keep the `k` most probable candidates. `k <= 0` keeps all.
    TopK { k: i32 },
    /// Keep the smallest prefix whose cumulative probability exceeds `p`.
    TopP { p: f32 },
    /// top-k, tail-free, locally typical, then top-p, in that order.
    Chain {
        top_k: i32,
        tfs_z: f32,
        typical_p: f32,
        top_p: f32,
    },
    /// Mirostat v1: derive k from the running surprise estimate.
    Mirostat { tau: f32, eta: f32, m: usize },
    /// Mirostat v2: drop every candidate more surprising than `mu`.
    MirostatV2 { tau: f32, eta: f32 },
    /// Mask candidates with the grammar automaton, then draw.
    Grammar,
}

impl Strategy {
    pub fn is_mirostat(&self) -> bool {
        matches!(self, Strategy::Mirostat { .. } | Strategy::MirostatV2 { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    /// Divides every logit before softmax. `<= 0` selects greedily.
    pub temperature: f32,
    pub strategy: Strategy,
    pub repeat_penalty: f32,
    /// Size of the history window the penalties look at. `<= 0` disables them.
    pub repeat_last_n: i32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    /// Whether the newline token is subject to the penalties.
    pub penalize_nl: bool,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.5,
            strategy: Strategy::Chain {
                top_k: 40,
                tfs_z: 1.0,
                typical_p: 1.0,
                top_p: 0.95,
            },
            repeat_penalty: 1.1,
            repeat_last_n: 64,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            penalize_nl: false,
        }
    }
}

impl SamplingParams {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature <= 0.0
    }
}

/// Running surprise target for Mirostat, owned by the caller across calls.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MirostatState {
    pub mu: f32,
}

impl MirostatState {
    /// Starts at twice the target surprise.
    pub fn new(tau: f32) -> Self {
        Self { mu: 2.0 * tau }
    }

    /// `mu += eta * (tau - observed)`; returns the applied delta.
    pub fn update(&mut self, tau: f32, eta: f32, observed_surprise: f32) -> f32 {
        let delta = eta * (tau - observed_surprise);
        self.mu += delta;
        delta
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleResult {
    pub token_id: TokenId,
    pub logprob: f32,
}
