//! Particle weight bookkeeping: log-weight normalization, resampling and point estimates.
//!
//! Particle sets are stored as `state_size × num_particles` matrices (one column per
//! particle) and their weights as a vector of the same length. Weights travel through the
//! engine in the log domain and are only exponentiated here, after the maximum has been
//! subtracted.
//!
//! # Resampling
//!
//! All resampling functions share the signature
//! `fn(weights: &[f64], n: usize, rng: &mut R) -> Vec<usize>` and return `n` ancestor
//! indices into `weights`. They accept weights that are non-negative and sum to a positive
//! finite value; the weights do not need to be normalized exactly. The engine default is
//! [`ParticleResamplingStrategy::Systematic`]: a single uniform draw per call, lowest
//! variance of the four, and sorted output.

use nalgebra::{DMatrix, DVector};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::linalg::log_sum_exp;

/// Method used to draw ancestor indices from normalized weights.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticleResamplingStrategy {
    /// One uniform offset, N evenly spaced positions.
    #[default]
    Systematic,
    /// N independent categorical draws.
    Multinomial,
    /// One uniform draw inside each of N equal strata.
    Stratified,
    /// Deterministic floor(N·w) copies, remainder drawn systematically from the residuals.
    Residual,
}

impl ParticleResamplingStrategy {
    /// Draw `n` ancestor indices from `weights` with this strategy.
    pub fn resample<R: Rng + ?Sized>(&self, weights: &[f64], n: usize, rng: &mut R) -> Vec<usize> {
        match self {
            ParticleResamplingStrategy::Systematic => systematic_resample(weights, n, rng),
            ParticleResamplingStrategy::Multinomial => multinomial_resample(weights, n, rng),
            ParticleResamplingStrategy::Stratified => stratified_resample(weights, n, rng),
            ParticleResamplingStrategy::Residual => residual_resample(weights, n, rng),
        }
    }
}

/// Normalized cumulative sum; the last entry is forced to exactly 1.0.
fn cumulative_weights(weights: &[f64]) -> Vec<f64> {
    let total: f64 = weights.iter().sum();
    let mut cumsum = Vec::with_capacity(weights.len());
    let mut acc = 0.0;
    for w in weights {
        acc += w / total;
        cumsum.push(acc);
    }
    if let Some(last) = cumsum.last_mut() {
        *last = 1.0;
    }
    cumsum
}

/// First index whose cumulative weight exceeds `u`.
fn search_cumulative(cumsum: &[f64], u: f64) -> usize {
    let idx = cumsum.partition_point(|&c| c <= u);
    idx.min(cumsum.len() - 1)
}

/// Walk a sorted list of positions in `[0, 1)` through the cumulative weights.
fn walk_sorted_positions(cumsum: &[f64], positions: impl Iterator<Item = f64>) -> Vec<usize> {
    let last = cumsum.len() - 1;
    let mut indices = Vec::new();
    let mut i = 0;
    for u in positions {
        while i < last && u >= cumsum[i] {
            i += 1;
        }
        indices.push(i);
    }
    indices
}

/// Systematic resampling: one uniform offset `u ~ U[0, 1/n)` and positions `u + k/n`.
///
/// # Arguments
/// * `weights` - non-negative weights with a positive finite sum
/// * `n` - number of indices to draw
/// * `rng` - random source, consumed once
///
/// # Returns
/// `n` sorted ancestor indices; each index `i` appears `floor(n w_i)` or `ceil(n w_i)` times.
pub fn systematic_resample<R: Rng + ?Sized>(weights: &[f64], n: usize, rng: &mut R) -> Vec<usize> {
    if n == 0 || weights.is_empty() {
        return Vec::new();
    }
    let cumsum = cumulative_weights(weights);
    let step = 1.0 / n as f64;
    let offset = rng.random::<f64>() * step;
    walk_sorted_positions(&cumsum, (0..n).map(|k| offset + k as f64 * step))
}

/// Stratified resampling: one uniform inside each stratum `[k/n, (k+1)/n)`, sorted output.
pub fn stratified_resample<R: Rng + ?Sized>(weights: &[f64], n: usize, rng: &mut R) -> Vec<usize> {
    if n == 0 || weights.is_empty() {
        return Vec::new();
    }
    let cumsum = cumulative_weights(weights);
    let step = 1.0 / n as f64;
    let positions: Vec<f64> = (0..n)
        .map(|k| (k as f64 + rng.random::<f64>()) * step)
        .collect();
    walk_sorted_positions(&cumsum, positions.into_iter())
}

/// Multinomial resampling: `n` independent categorical draws.
pub fn multinomial_resample<R: Rng + ?Sized>(
    weights: &[f64],
    n: usize,
    rng: &mut R,
) -> Vec<usize> {
    if n == 0 || weights.is_empty() {
        return Vec::new();
    }
    let cumsum = cumulative_weights(weights);
    (0..n)
        .map(|_| search_cumulative(&cumsum, rng.random::<f64>()))
        .collect()
}

/// Residual resampling: `floor(n w_i)` copies of each index, the rest drawn systematically
/// from the leftover fractional weights.
pub fn residual_resample<R: Rng + ?Sized>(weights: &[f64], n: usize, rng: &mut R) -> Vec<usize> {
    if n == 0 || weights.is_empty() {
        return Vec::new();
    }
    let total: f64 = weights.iter().sum();
    let mut indices = Vec::with_capacity(n);
    let mut residual = Vec::with_capacity(weights.len());
    for (i, w) in weights.iter().enumerate() {
        let expected = w / total * n as f64;
        let copies = expected.floor() as usize;
        indices.extend(std::iter::repeat_n(i, copies));
        residual.push(expected - copies as f64);
    }
    indices.truncate(n);
    let remaining = n - indices.len();
    if remaining > 0 {
        indices.extend(systematic_resample(&residual, remaining, rng));
    }
    indices
}

/// Draw a single index from a categorical distribution (one uniform draw).
pub fn sample_categorical<R: Rng + ?Sized>(weights: &[f64], rng: &mut R) -> usize {
    let cumsum = cumulative_weights(weights);
    search_cumulative(&cumsum, rng.random::<f64>())
}

/// Shift log-weights so that their exponentials sum to one.
///
/// Returns `None` if the weights are degenerate: any NaN, or no entry with a finite value
/// (every particle has zero likelihood, or a `+inf` swamps the rest).
pub fn normalize_log_weights(log_weights: &DVector<f64>) -> Option<DVector<f64>> {
    if log_weights.is_empty() || log_weights.iter().any(|w| w.is_nan()) {
        return None;
    }
    let log_total = log_sum_exp(log_weights.as_slice());
    if !log_total.is_finite() {
        return None;
    }
    Some(log_weights.map(|w| w - log_total))
}

/// Uniform log-weights, `-ln n` each.
pub fn uniform_log_weights(n: usize) -> DVector<f64> {
    DVector::from_element(n, -(n as f64).ln())
}

/// Exponentiate normalized log-weights.
pub fn weights_from_log(log_weights: &DVector<f64>) -> DVector<f64> {
    log_weights.map(f64::exp)
}

/// N_eff = 1 / Σ w_i², for normalized weights.
pub fn effective_sample_size(weights: &DVector<f64>) -> f64 {
    let sum_of_squares: f64 = weights.iter().map(|w| w * w).sum();
    if sum_of_squares > 0.0 {
        1.0 / sum_of_squares
    } else {
        0.0
    }
}

/// How a point estimate is extracted from a weighted particle set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticleAveragingStrategy {
    /// Importance-weighted mean and covariance.
    #[default]
    WeightedMean,
    /// Plain sample mean and covariance, ignoring weights.
    UnweightedMean,
    /// The highest-weight particle, with zero covariance.
    HighestWeight,
}

impl ParticleAveragingStrategy {
    /// Mean and covariance of `particles` (one column per particle) under `weights`.
    pub fn estimate(
        &self,
        particles: &DMatrix<f64>,
        weights: &DVector<f64>,
    ) -> (DVector<f64>, DMatrix<f64>) {
        match self {
            ParticleAveragingStrategy::WeightedMean => weighted_moments(particles, weights),
            ParticleAveragingStrategy::UnweightedMean => {
                let n = particles.ncols();
                let uniform = DVector::from_element(n, 1.0 / n as f64);
                weighted_moments(particles, &uniform)
            }
            ParticleAveragingStrategy::HighestWeight => {
                let state_size = particles.nrows();
                let best = weights
                    .iter()
                    .enumerate()
                    .fold((0, f64::NEG_INFINITY), |(bi, bw), (i, &w)| {
                        if w > bw { (i, w) } else { (bi, bw) }
                    })
                    .0;
                (
                    particles.column(best).clone_owned(),
                    DMatrix::zeros(state_size, state_size),
                )
            }
        }
    }
}

fn weighted_moments(particles: &DMatrix<f64>, weights: &DVector<f64>) -> (DVector<f64>, DMatrix<f64>) {
    let state_size = particles.nrows();
    let mean = particles * weights;
    let mut cov = DMatrix::<f64>::zeros(state_size, state_size);
    for (column, &w) in particles.column_iter().zip(weights.iter()) {
        let diff = column - &mean;
        cov += w * &diff * diff.transpose();
    }
    (mean, cov)
}
