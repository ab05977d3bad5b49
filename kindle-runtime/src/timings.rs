//! Advisory timing counters. They never influence control flow.

use std::time::{Duration, Instant};

use tracing::info;

#[derive(Debug, Clone)]
pub struct Timings {
    pub t_start: Instant,
    pub t_load_us: u64,
    pub t_sample_us: u64,
    /// Single-token evals.
    pub t_eval_us: u64,
    /// Multi-token (prompt) evals.
    pub t_p_eval_us: u64,
    pub n_sample: u64,
    pub n_eval: u64,
    pub n_p_eval: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            t_start: Instant::now(),
            t_load_us: 0,
            t_sample_us: 0,
            t_eval_us: 0,
            t_p_eval_us: 0,
            n_sample: 0,
            n_eval: 0,
            n_p_eval: 0,
        }
    }
}

fn micros(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX)
}

fn per_call_ms(total_us: u64, calls: u64) -> f64 {
    if calls == 0 {
        0.0
    } else {
        total_us as f64 / 1000.0 / calls as f64
    }
}

impl Timings {
    pub fn record_load(&mut self, elapsed: Duration) {
        self.t_load_us = self.t_load_us.saturating_add(micros(elapsed));
    }

    pub fn record_sample(&mut self, elapsed: Duration) {
        self.t_sample_us = self.t_sample_us.saturating_add(micros(elapsed));
        self.n_sample += 1;
    }

    /// One forward pass over `n_tokens` tokens.
    pub fn record_eval(&mut self, n_tokens: usize, elapsed: Duration) {
        if n_tokens > 1 {
            self.t_p_eval_us = self.t_p_eval_us.saturating_add(micros(elapsed));
            self.n_p_eval += n_tokens as u64;
        } else {
            self.t_eval_us = self.t_eval_us.saturating_add(micros(elapsed));
            self.n_eval += 1;
        }
    }

    /// Zero the sample and eval counters. Load time is kept.
    pub fn reset(&mut self) {
        *self = Self {
            t_load_us: self.t_load_us,
            ..Self::default()
        };
    }

    /// Emit the counters as one `info` event.
    pub fn print(&self) {
        info!(
            load_ms = self.t_load_us as f64 / 1000.0,
            sample_ms = self.t_sample_us as f64 / 1000.0,
            n_sample = self.n_sample,
            sample_ms_per_token = per_call_ms(self.t_sample_us, self.n_sample),
            prompt_eval_ms = self.t_p_eval_us as f64 / 1000.0,
            n_prompt_tokens = self.n_p_eval,
            prompt_ms_per_token = per_call_ms(self.t_p_eval_us, self.n_p_eval),
            eval_ms = self.t_eval_us as f64 / 1000.0,
            n_eval = self.n_eval,
            eval_ms_per_token = per_call_ms(self.t_eval_us, self.n_eval),
            total_ms = self.t_start.elapsed().as_secs_f64() * 1000.0,
            "timings"
        );
    }
}
