//! Candidate set: the (token, logit, probability) triples every sampling
//! strategy reads and truncates.

use std::cmp::Ordering;

use kindle_core::TokenId;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub token_id: TokenId,
    pub logit: f32,
    /// Only meaningful after `normalize` or `softmax`.
    pub p: f32,
}

/// Candidates for one position. `sorted` records descending-probability order.
#[derive(Debug, Clone)]
pub struct CandidateSet {
    data: Vec<Candidate>,
    sorted: bool,
}

/// Descending by probability, ties by ascending token id.
fn by_probability(a: &Candidate, b: &Candidate) -> Ordering {
    b.p.total_cmp(&a.p).then(a.token_id.cmp(&b.token_id))
}

impl CandidateSet {
    /// One candidate per vocabulary entry, in vocabulary order.
    pub fn from_logits(logits: &[f32]) -> Self {
        let data = logits
            .iter()
            .enumerate()
            .map(|(i, &logit)| Candidate {
                token_id: i as TokenId,
                logit,
                p: 0.0,
            })
            .collect();
        Self {
            data,
            sorted: false,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_sorted(&self) -> bool {
        self.sorted
    }

    pub fn as_slice(&self) -> &[Candidate] {
        &self.data
    }

    pub fn iter(&self) -> impl Iterator<Item = &Candidate> {
        self.data.iter()
    }

    /// Mutable logit of `token_id`, if it is still in the set.
    pub fn logit_mut(&mut self, token_id: TokenId) -> Option<&mut f32> {
        self.sorted = false;
        let idx = token_id as usize;
        // untouched sets are indexed by token id
        if self.data.get(idx).is_some_and(|c| c.token_id == token_id) {
            return Some(&mut self.data[idx].logit);
        }
        self.data
            .iter_mut()
            .find(|c| c.token_id == token_id)
            .map(|c| &mut c.logit)
    }

    pub fn apply_temperature(&mut self, temperature: f32) {
        if temperature <= 0.0 || (temperature - 1.0).abs() < f32::EPSILON {
            return;
        }
        for c in &mut self.data {
            c.logit /= temperature;
        }
    }

    /// Numerically stable softmax over the current logits. Order is kept.
    pub fn normalize(&mut self) {
        let max = self
            .data
            .iter()
            .map(|c| c.logit)
            .fold(f32::NEG_INFINITY, f32::max);
        if max == f32::NEG_INFINITY {
            for c in &mut self.data {
                c.p = 0.0;
            }
            return;
        }
        let mut sum = 0.0f32;
        for c in &mut self.data {
            c.p = (c.logit - max).exp();
            sum += c.p;
        }
        for c in &mut self.data {
            c.p /= sum;
        }
    }

    /// `normalize`, then a stable descending sort by probability.
    pub fn softmax(&mut self) {
        self.normalize();
        if !self.sorted {
            self.data.sort_by(by_probability);
            self.sorted = true;
        }
    }

    /// Keep the first `len` candidates, never fewer than one.
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len.max(1));
    }

    /// Drop candidates masked to negative infinity.
    pub fn prune_masked(&mut self) {
        if self.data.iter().any(|c| c.logit > f32::NEG_INFINITY) {
            self.data.retain(|c| c.logit > f32::NEG_INFINITY);
        }
    }

    /// Keep the `k` most probable candidates. `k <= 0` or `k >= len` is a no-op.
    pub fn top_k(&mut self, k: i32) {
        if k <= 0 || k as usize >= self.data.len() {
            return;
        }
        self.softmax();
        self.truncate(k as usize);
        self.normalize();
    }

    /// Keep the shortest prefix whose cumulative probability exceeds `p`.
    pub fn top_p(&mut self, p: f32) {
        if p >= 1.0 {
            return;
        }
        self.softmax();
        let mut cum = 0.0;
        let mut keep = self.data.len();
        for (i, c) in self.data.iter().enumerate() {
            cum += c.p;
            if cum > p {
                keep = i + 1;
                break;
            }
        }
        self.truncate(keep);
        self.normalize();
    }

    /// Tail-free sampling: cut where the curvature of the sorted
    /// distribution has accumulated `z` of its total mass.
    pub fn tail_free(&mut self, z: f32) {
        if z >= 1.0 || self.data.len() <= 2 {
            return;
        }
        self.softmax();

        let first: Vec<f32> = self.data.windows(2).map(|w| w[0].p - w[1].p).collect();
        let mut second: Vec<f32> = first.windows(2).map(|w| (w[0] - w[1]).abs()).collect();
        let total: f32 = second.iter().sum();
        if total > 0.0 {
            for d in &mut second {
                *d /= total;
            }
        }

        let mut keep = self.data.len();
        let mut cum = 0.0;
        for (i, d) in second.iter().enumerate() {
            cum += d;
            if cum > z && i >= 1 {
                keep = i;
                break;
            }
        }
        self.truncate(keep);
        self.normalize();
    }

    /// Locally typical sampling: keep the candidates whose surprise is
    /// closest to the entropy until their mass exceeds `p`.
    pub fn typical(&mut self, p: f32) {
        if p >= 1.0 {
            return;
        }
        self.softmax();

        let entropy: f32 = self
            .data
            .iter()
            .filter(|c| c.p > 0.0)
            .map(|c| -c.p * c.p.ln())
            .sum();

        let mut order: Vec<(f32, usize)> = self
            .data
            .iter()
            .enumerate()
            .map(|(i, c)| ((-c.p.ln() - entropy).abs(), i))
            .collect();
        order.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        let mut keep = order.len();
        let mut cum = 0.0;
        for (i, &(_, idx)) in order.iter().enumerate() {
            cum += self.data[idx].p;
            if cum > p {
                keep = i + 1;
                break;
            }
        }

        self.data = order[..keep].iter().map(|&(_, idx)| self.data[idx]).collect();
        self.sorted = false;
        self.normalize();
    }

    /// Set the logit of every candidate `allow` rejects to negative infinity.
    /// Returns how many candidates survive.
    pub fn mask(&mut self, mut allow: impl FnMut(TokenId) -> bool) -> usize {
        let mut survivors = 0;
        for c in &mut self.data {
            if allow(c.token_id) {
                survivors += 1;
            } else {
                c.logit = f32::NEG_INFINITY;
                c.p = 0.0;
            }
        }
        if survivors < self.data.len() {
            self.sorted = false;
        }
        survivors
    }

    /// Highest-logit candidate, ties by lowest token id. Needs no softmax.
    pub fn greedy(&self) -> Option<Candidate> {
        self.data.iter().copied().reduce(|best, c| {
            match c.logit.total_cmp(&best.logit) {
                Ordering::Greater => c,
                Ordering::Equal if c.token_id < best.token_id => c,
                _ => best,
            }
        })
    }

    /// Natural log of `candidate`'s softmax probability within this set.
    pub fn log_prob_of(&self, candidate: &Candidate) -> f32 {
        let max = self
            .data
            .iter()
            .map(|c| c.logit)
            .fold(f32::NEG_INFINITY, f32::max);
        if max == f32::NEG_INFINITY {
            return f32::NEG_INFINITY;
        }
        let sum: f32 = self.data.iter().map(|c| (c.logit - max).exp()).sum();
        candidate.logit - max - sum.ln()
    }

    /// Inverse-CDF lookup of a uniform draw `r` in `[0, 1)`.
    /// Requires normalized probabilities.
    pub fn sample_index(&self, r: f32) -> Option<usize> {
        let mut cum = 0.0;
        for (i, c) in self.data.iter().enumerate() {
            cum += c.p;
            if cum > r {
                return Some(i);
            }
        }
        // rounding left the draw past the last bucket
        self.data.iter().rposition(|c| c.p > 0.0)
    }

    pub fn get(&self, index: usize) -> Option<&Candidate> {
        self.data.get(index)
    }
}
