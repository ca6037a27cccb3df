//! Partial-credit model computations.
//!
//! An item with maximum score `m` has step parameters `δ_1..δ_m`, and
//! `P(X = k | θ) ∝ exp(Σ_{h≤k} (θ - δ_h))`. With one step this is the
//! dichotomous Rasch model.

use crate::utils::logsumexp;

/// Log category probabilities `log P(X = k | θ)` for `k = 0..=steps.len()`.
pub fn pcm_log_probabilities(theta: f64, steps: &[f64]) -> Vec<f64> {
    let mut numerators = Vec::with_capacity(steps.len() + 1);
    numerators.push(0.0);
    let mut acc = 0.0;
    for &delta in steps {
        acc += theta - delta;
        numerators.push(acc);
    }
    let log_denom = logsumexp(&numerators);
    numerators.iter().map(|&n| n - log_denom).collect()
}

pub fn pcm_probabilities(theta: f64, steps: &[f64]) -> Vec<f64> {
    pcm_log_probabilities(theta, steps)
        .into_iter()
        .map(f64::exp)
        .collect()
}

/// `P(X ≥ h | θ)` for `h = 1..=m`, from category probabilities.
pub fn exceedance_probabilities(probs: &[f64]) -> Vec<f64> {
    let m = probs.len().saturating_sub(1);
    let mut out = vec![0.0; m];
    let mut tail = 0.0;
    for h in (1..=m).rev() {
        tail += probs[h];
        out[h - 1] = tail;
    }
    out
}

/// Model-implied mean and variance of the item score at `theta`.
pub fn expected_score_and_variance(theta: f64, steps: &[f64]) -> (f64, f64) {
    let probs = pcm_probabilities(theta, steps);
    let mean: f64 = probs.iter().enumerate().map(|(k, p)| k as f64 * p).sum();
    let var: f64 = probs
        .iter()
        .enumerate()
        .map(|(k, p)| (k as f64 - mean).powi(2) * p)
        .sum();
    (mean, var)
}
