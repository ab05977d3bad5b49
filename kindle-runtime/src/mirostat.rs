//! Mirostat v1 and v2 truncation.
//!
//! Both variants truncate the candidate set around the running target `mu`;
//! the caller draws from what is left and then feeds the observed surprise
//! back through [`MirostatState::update`](kindle_core::MirostatState::update).

use tracing::debug;

use crate::candidates::CandidateSet;

/// Surprise of a probability, in bits.
pub fn surprise(p: f32) -> f32 {
    -p.log2()
}

/// Least-squares estimate of the Zipf exponent over the first `m` sorted
/// probabilities. Requires a sorted, normalized set.
pub fn estimate_zipf_exponent(candidates: &CandidateSet, m: usize) -> Option<f32> {
    let probs = candidates.as_slice();
    let pairs = m.min(probs.len()).saturating_sub(1);
    let mut sum_ti_bi = 0.0f32;
    let mut sum_ti_sq = 0.0f32;
    for i in 0..pairs {
        let (p, next) = (probs[i].p, probs[i + 1].p);
        if p <= 0.0 || next <= 0.0 {
            break;
        }
        let t_i = ((i + 2) as f32 / (i + 1) as f32).ln();
        let b_i = (p / next).ln();
        sum_ti_bi += t_i * b_i;
        sum_ti_sq += t_i * t_i;
    }
    if sum_ti_sq == 0.0 {
        return None;
    }
    Some(sum_ti_bi / sum_ti_sq)
}

/// Number of candidates Mirostat v1 keeps for target `mu` over `n` candidates.
pub fn derive_k(s_hat: f32, mu: f32, n: usize) -> usize {
    if n <= 1 || s_hat <= 0.0 {
        return n.max(1);
    }
    let n_f = n as f32;
    let epsilon = s_hat - 1.0;
    let base = if epsilon.abs() < 1e-6 {
        // limit of eps / (1 - n^-eps) as eps -> 0
        mu.exp2() / n_f.ln()
    } else {
        epsilon * mu.exp2() / (1.0 - n_f.powf(-epsilon))
    };
    let k = base.powf(1.0 / s_hat);
    if !k.is_finite() {
        return n;
    }
    (k as usize).clamp(1, n)
}

/// Mirostat v1: derive `k` from the estimated Zipf exponent and keep the
/// top `k` candidates.
pub fn truncate_v1(candidates: &mut CandidateSet, mu: f32, m: usize) {
    candidates.softmax();
    let n = candidates.len();
    let k = match estimate_zipf_exponent(candidates, m) {
        Some(s_hat) => derive_k(s_hat, mu, n),
        None => 1,
    };
    debug!(mu, k, n, "mirostat v1 truncation");
    candidates.truncate(k);
    candidates.normalize();
}

/// Mirostat v2: drop every candidate whose surprise exceeds `mu`, keeping
/// at least one.
pub fn truncate_v2(candidates: &mut CandidateSet, mu: f32) {
    candidates.softmax();
    let keep = candidates
        .iter()
        .take_while(|c| surprise(c.p) <= mu)
        .count();
    debug!(mu, keep, n = candidates.len(), "mirostat v2 truncation");
    candidates.truncate(keep);
    candidates.normalize();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_top_two_gap_for_m_two() {
        let mut set = CandidateSet::from_logits(&[2.0, 1.0, 0.0]);
        set.softmax();
        let s_hat = estimate_zipf_exponent(&set, 2).unwrap();
        // ln(p0 / p1) / ln 2 with a logit gap of 1
        assert!((s_hat - 1.0 / 2f32.ln()).abs() < 1e-4);
    }

    #[test]
    fn test_derive_k_clamps() {
        assert_eq!(derive_k(1.5, -100.0, 50), 1);
        assert_eq!(derive_k(1.5, 100.0, 50), 50);
        assert_eq!(derive_k(1.0, 3.0, 50), (8.0 / 50f32.ln()) as usize);
        assert_eq!(derive_k(2.0, 3.0, 1), 1);
    }

    #[test]
    fn test_v2_keeps_at_least_one() {
        let mut set = CandidateSet::from_logits(&[0.0; 8]);
        truncate_v2(&mut set, 0.5);
        assert_eq!(set.len(), 1);
        assert!((set.as_slice()[0].p - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_v2_threshold() {
        // probabilities 1/2, 1/4, 1/8, 1/8 have surprises 1, 2, 3, 3 bits
        let logits: Vec<f32> = [0.5f32, 0.25, 0.125, 0.125].iter().map(|p| p.ln()).collect();
        let mut set = CandidateSet::from_logits(&logits);
        truncate_v2(&mut set, 2.5);
        assert_eq!(set.len(), 2);
        assert!((set.as_slice()[0].p - 2.0 / 3.0).abs() < 1e-5);
    }
}
