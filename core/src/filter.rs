//! Forward Sequential Importance Resampling (SIR) particle filter.
//!
//! Each step draws parents from the previous step's weights, samples process noise,
//! propagates the parents through the model and weights the proposals by the measurement
//! likelihood. The weights recorded for a step are the importance weights *before* the
//! resampling that feeds the next step, which is what both the filtered point estimates and
//! the smoother need.
//!
//! By default every step resamples (SIR). [`ResamplingSchedule::EffectiveSampleSize`] is an
//! opt-in adaptive alternative: when the effective sample size is still above the threshold
//! the parents are the particles themselves (identity ancestors) and their log-weights carry
//! over into the next step.

use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{StateSpaceModel, check_inputs, check_measurements};
use crate::error::{Result, SmcError};
use crate::history::ParticleHistory;
use crate::linalg::log_sum_exp;
use crate::particle::{
    ParticleAveragingStrategy, ParticleResamplingStrategy, effective_sample_size,
    normalize_log_weights, uniform_log_weights, weights_from_log,
};

/// When the filter resamples.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum ResamplingSchedule {
    /// Resample before every propagation step.
    #[default]
    EveryStep,
    /// Resample only when N_eff < `threshold` · N, with `threshold` in (0, 1].
    EffectiveSampleSize { threshold: f64 },
}

impl ResamplingSchedule {
    /// Whether a particle set with the given effective sample size should be resampled.
    pub fn should_resample(&self, effective_sample_size: f64, num_particles: usize) -> bool {
        match self {
            ResamplingSchedule::EveryStep => true,
            ResamplingSchedule::EffectiveSampleSize { threshold } => {
                effective_sample_size < threshold * num_particles as f64
            }
        }
    }
}

/// What to do when every candidate weight underflows at some step.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DegeneracyPolicy {
    /// Abort with `DegenerateWeights` / `DegenerateSmoothingWeights`.
    #[default]
    Fail,
    /// Replace the step's weights with uniform weights, log a warning and continue.
    UniformFallback,
}

/// Particle filter configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    pub num_particles: usize,
    pub resampling_strategy: ParticleResamplingStrategy,
    pub resampling_schedule: ResamplingSchedule,
    pub averaging_strategy: ParticleAveragingStrategy,
    pub degeneracy_policy: DegeneracyPolicy,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            num_particles: 100,
            resampling_strategy: ParticleResamplingStrategy::Systematic,
            resampling_schedule: ResamplingSchedule::EveryStep,
            averaging_strategy: ParticleAveragingStrategy::WeightedMean,
            degeneracy_policy: DegeneracyPolicy::Fail,
        }
    }
}

impl FilterConfig {
    /// Default configuration with `num_particles` particles.
    pub fn with_particles(num_particles: usize) -> Self {
        Self {
            num_particles,
            ..Self::default()
        }
    }
    /// Reject zero particles and an effective sample size threshold outside (0, 1].
    pub fn validate(&self) -> Result<()> {
        if self.num_particles < 1 {
            return Err(SmcError::config("num_particles must be at least 1"));
        }
        if let ResamplingSchedule::EffectiveSampleSize { threshold } = self.resampling_schedule {
            if !(threshold > 0.0 && threshold <= 1.0) {
                return Err(SmcError::config(format!(
                    "effective sample size threshold must be in (0, 1], got {threshold}"
                )));
            }
        }
        Ok(())
    }
}

/// Per-step point estimates computed from the pre-resampling importance weights.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FilteredEstimates {
    pub means: Vec<DVector<f64>>,
    pub covariances: Vec<DMatrix<f64>>,
}

impl FilteredEstimates {
    /// Number of steps, `T + 1`.
    pub fn len(&self) -> usize {
        self.means.len()
    }
    /// True only for an estimate set that was never filled.
    pub fn is_empty(&self) -> bool {
        self.means.is_empty()
    }
    /// Filtered mean at step `t`.
    pub fn mean(&self, t: usize) -> &DVector<f64> {
        &self.means[t]
    }
    /// Filtered covariance at step `t`.
    pub fn covariance(&self, t: usize) -> &DMatrix<f64> {
        &self.covariances[t]
    }
}

/// Per-step health of the run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FilterDiagnostics {
    /// N_eff of each step's importance weights.
    pub effective_sample_sizes: Vec<f64>,
    /// Whether the parents of step `t` were drawn by resampling (always false for step 0).
    pub resampled: Vec<bool>,
    /// Steps whose weights were replaced by the uniform fallback.
    pub fallback_steps: Vec<usize>,
    /// SMC estimate of `ln p(y_1..y_T)`; `-inf` if any step fell back to uniform weights.
    pub log_likelihood: f64,
}

/// Everything a filter run produces.
#[derive(Clone, Debug)]
pub struct FilterOutput {
    pub history: ParticleHistory,
    pub estimates: FilteredEstimates,
    pub diagnostics: FilterDiagnostics,
}

/// SIR particle filter bound to a model.
#[derive(Clone, Debug)]
pub struct ParticleFilter<'m, M> {
    model: &'m M,
    config: FilterConfig,
}

impl<'m, M: StateSpaceModel> ParticleFilter<'m, M> {
    /// Create a filter for `model`.
    ///
    /// # Arguments
    /// * `model` - the state-space model to filter
    /// * `config` - particle count, resampling and degeneracy settings
    ///
    /// # Returns
    /// `InvalidConfiguration` if `config` is invalid or the model has no state dimension.
    pub fn new(model: &'m M, config: FilterConfig) -> Result<Self> {
        config.validate()?;
        if model.state_dimension() == 0 {
            return Err(SmcError::config("model state dimension must be positive"));
        }
        Ok(ParticleFilter { model, config })
    }
    /// The configuration this filter runs with.
    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    /// Run the filter over `measurements` (`T` entries, possibly zero).
    ///
    /// `inputs`, when given, must hold one input per measurement; `inputs[t - 1]` drives the
    /// transition into step `t`.
    pub fn run<R: Rng + ?Sized>(
        &self,
        measurements: &[M::Measurement],
        inputs: Option<&[M::Input]>,
        rng: &mut R,
    ) -> Result<FilterOutput> {
        let n = self.config.num_particles;
        let num_steps = measurements.len();
        check_measurements(self.model, measurements)?;
        check_inputs(self.model, inputs, num_steps)?;
        info!(
            "Running particle filter: {n} particles, {num_steps} measurements, {:?} resampling",
            self.config.resampling_strategy
        );

        let initial = self.model.sample_initial(n, rng);
        self.check_particles(&initial, "sample_initial")?;
        let initial_log_weights = uniform_log_weights(n);

        let mut estimates = FilteredEstimates::default();
        let mut diagnostics = FilterDiagnostics::default();
        self.record_estimate(&initial, &initial_log_weights, &mut estimates, &mut diagnostics);
        diagnostics.resampled.push(false);
        let mut history = ParticleHistory::new(initial, initial_log_weights)?;

        for (k, measurement) in measurements.iter().enumerate() {
            let t = k + 1;
            let input = inputs.map(|u| &u[k]);
            let previous = history.step(k);
            let previous_weights = weights_from_log(&previous.log_weights);
            let resample = self
                .config
                .resampling_schedule
                .should_resample(diagnostics.effective_sample_sizes[k], n);

            let (ancestors, carried_log_weights) = if resample {
                let ancestors =
                    self.config
                        .resampling_strategy
                        .resample(previous_weights.as_slice(), n, rng);
                (ancestors, uniform_log_weights(n))
            } else {
                ((0..n).collect(), previous.log_weights.clone())
            };
            let parents = previous.particles.select_columns(&ancestors);

            let noise = self.model.sample_process_noise(&parents, input, k, rng);
            if noise.ncols() != n {
                return Err(SmcError::config(format!(
                    "sample_process_noise returned {} columns for {n} particles",
                    noise.ncols()
                )));
            }
            let proposed = self.model.propagate(&parents, input, k, &noise);
            self.check_particles(&proposed, "propagate")?;

            let log_likelihood = self
                .model
                .measurement_log_likelihood(&proposed, measurement, t);
            if log_likelihood.len() != n {
                return Err(SmcError::config(format!(
                    "measurement_log_likelihood returned {} values for {n} particles",
                    log_likelihood.len()
                )));
            }
            let unnormalized = carried_log_weights + log_likelihood;
            diagnostics.log_likelihood += log_sum_exp(unnormalized.as_slice());

            let log_weights = match normalize_log_weights(&unnormalized) {
                Some(log_weights) => log_weights,
                None => match self.config.degeneracy_policy {
                    DegeneracyPolicy::Fail => return Err(SmcError::DegenerateWeights { step: t }),
                    DegeneracyPolicy::UniformFallback => {
                        warn!(
                            "All particle weights degenerate at step {t}; falling back to uniform weights"
                        );
                        diagnostics.fallback_steps.push(t);
                        diagnostics.log_likelihood = f64::NEG_INFINITY;
                        uniform_log_weights(n)
                    }
                },
            };

            self.record_estimate(&proposed, &log_weights, &mut estimates, &mut diagnostics);
            diagnostics.resampled.push(resample);
            debug!(
                "step {t}: resampled={resample}, effective sample size {:.2}",
                diagnostics.effective_sample_sizes[t]
            );
            history.push(proposed, log_weights, ancestors)?;
        }

        info!(
            "Particle filter finished: {} steps, log-likelihood {:.4}",
            history.len(),
            diagnostics.log_likelihood
        );
        Ok(FilterOutput {
            history,
            estimates,
            diagnostics,
        })
    }

    fn check_particles(&self, particles: &DMatrix<f64>, source: &str) -> Result<()> {
        let expected = (self.model.state_dimension(), self.config.num_particles);
        if particles.shape() != expected {
            return Err(SmcError::config(format!(
                "{source} returned a {:?} particle matrix, expected {expected:?}",
                particles.shape()
            )));
        }
        Ok(())
    }

    fn record_estimate(
        &self,
        particles: &DMatrix<f64>,
        log_weights: &DVector<f64>,
        estimates: &mut FilteredEstimates,
        diagnostics: &mut FilterDiagnostics,
    ) {
        let weights = weights_from_log(log_weights);
        let (mean, covariance) = self.config.averaging_strategy.estimate(particles, &weights);
        estimates.means.push(mean);
        estimates.covariances.push(covariance);
        diagnostics
            .effective_sample_sizes
            .push(effective_sample_size(&weights));
    }
}
