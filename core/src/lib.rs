//! Sequential Monte Carlo state estimation toolbox
//!
//! This crate estimates the hidden state of a discrete-time stochastic process from noisy
//! measurements. Forward inference is a Sequential Importance Resampling (SIR) particle
//! filter; smoothing is done by backward simulation, re-drawing each trajectory's ancestor
//! at every step from weights that combine the forward filter weight with the model's
//! transition density to the already fixed later state.
//!
//! The engine knows nothing about the process being estimated. A model plugs in by
//! implementing [`StateSpaceModel`]: five capabilities covering initial sampling, process
//! noise sampling, propagation, measurement likelihood and transition density. The
//! [`models`] module provides a linear-Gaussian model (including the one-dimensional
//! random walk) and [`kalman`] its closed-form Kalman/RTS solution, used to cross-check the
//! particle methods.
//!
//! This crate is primarily built off of:
//! - [`nalgebra`](https://crates.io/crates/nalgebra): state vectors, particle matrices and covariances.
//! - [`rand`](https://crates.io/crates/rand) and [`rand_distr`](https://crates.io/crates/rand_distr): every
//!   random draw goes through an injected generator, so runs are reproducible from a seed.
//! - [`rayon`](https://crates.io/crates/rayon): trajectories are smoothed in parallel.
//!
//! ## Crate overview
//!
//! - [error]: the [`SmcError`] taxonomy.
//! - [linalg]: Cholesky-based square roots, Gaussian densities and sampling, `log_sum_exp`.
//! - [particle]: log-weight normalization, resampling strategies and point estimates.
//! - [history]: the [`ParticleHistory`] arena recorded by the filter and read by the smoother.
//! - [filter]: the forward SIR particle filter.
//! - [smoother]: the backward-simulation (ancestor sampling) smoother.
//! - [estimator]: `run_filter`/`run_smoother` and the [`Simulator`] front end.
//! - [models]: linear-Gaussian example model.
//! - [kalman]: reference Kalman filter and Rauch–Tung–Striebel smoother.
//! - [sim]: synthetic dataset generation for evaluation.
//!
//! ## Data layout
//!
//! A particle set is a `state_size × num_particles` [`DMatrix`], one column per particle.
//! Weights are kept as normalized log-weights (their exponentials sum to one). The history
//! is a flat sequence of steps indexed by time, each holding the particle matrix, the
//! importance log-weights before resampling and, for every step after the first, the index
//! of each particle's parent in the previous step.
//!
//! ## Random-draw order
//!
//! Reproducibility depends on a fixed draw order:
//! 1. `sample_initial` for the N initial particles.
//! 2. For each step `t = 1..=T`: the resampling draw from the step `t-1` weights (skipped
//!    when an adaptive schedule decides not to resample), then `sample_process_noise` for
//!    the N resampled parents.
//! 3. Smoothing: one `u64` seed per trajectory, in trajectory order; each trajectory then
//!    draws from its own generator, so serial and parallel runs agree exactly.
//!
//! ## Example
//!
//! ```rust
//! use rand::SeedableRng;
//! use rand::rngs::StdRng;
//! use seqmc::estimator::Simulator;
//! use seqmc::models::LinearGaussianModel;
//! use seqmc::sim::generate_dataset;
//! use nalgebra::DVector;
//!
//! let model = LinearGaussianModel::random_walk(1.0, 1.0, 1.0);
//! let mut rng = StdRng::seed_from_u64(1);
//! let (_truth, measurements) =
//!     generate_dataset(&model, 20, &DVector::from_element(1, 2.0), None, &mut rng).unwrap();
//!
//! let mut sim = Simulator::new(model, measurements, None).unwrap();
//! sim.simulate(50, 50, &mut rng).unwrap();
//! let filtered = sim.get_filtered_estimates().unwrap();
//! let smoothed = sim.get_smoothed_mean().unwrap();
//! assert_eq!(filtered.len(), 21);
//! assert_eq!(smoothed.len(), 21);
//! ```

pub mod error;
pub mod estimator;
pub mod filter;
pub mod history;
pub mod kalman;
pub mod linalg;
pub mod models;
pub mod particle;
pub mod sim;
pub mod smoother;

pub use error::{Result, SmcError};
pub use estimator::{Simulator, run_filter, run_smoother};
pub use filter::{
    DegeneracyPolicy, FilterConfig, FilterDiagnostics, FilterOutput, FilteredEstimates,
    ParticleFilter, ResamplingSchedule,
};
pub use history::{HistoryStep, ParticleHistory};
pub use particle::{ParticleAveragingStrategy, ParticleResamplingStrategy};
pub use smoother::{
    AncestorSamplingSmoother, SmoothedTrajectories, SmootherConfig, SmoothingMethod,
};

use nalgebra::{DMatrix, DVector};
use rand::Rng;

/// Capabilities a model must supply to drive the particle filter and smoother.
///
/// Particle sets are passed as `state_size × N` matrices, one column per particle. The
/// time index handed to the sampling, propagation and transition methods is the step the
/// particles are *leaving* (`t - 1` while producing step `t`); the measurement likelihood
/// receives the step the measurement belongs to (`1..=T`). The exogenous input for the
/// transition out of step `s` is `inputs[s]`, or `None` when the run has no inputs.
///
/// Nothing else about the model is assumed: the engine treats it as an opaque sampler and
/// evaluator, so any distribution family works as long as these five operations do.
pub trait StateSpaceModel {
    /// A single measurement `y_t`.
    type Measurement;
    /// A single exogenous input `u_t`.
    type Input;

    /// Length of a state vector.
    fn state_dimension(&self) -> usize;

    /// Draw `num_particles` i.i.d. samples from the initial-state distribution.
    fn sample_initial<R: Rng + ?Sized>(&self, num_particles: usize, rng: &mut R) -> DMatrix<f64>;

    /// Draw process noise for every column of `particles`.
    fn sample_process_noise<R: Rng + ?Sized>(
        &self,
        particles: &DMatrix<f64>,
        input: Option<&Self::Input>,
        t: usize,
        rng: &mut R,
    ) -> DMatrix<f64>;

    /// Deterministically combine each particle, the input and its noise into the next state.
    fn propagate(
        &self,
        particles: &DMatrix<f64>,
        input: Option<&Self::Input>,
        t: usize,
        noise: &DMatrix<f64>,
    ) -> DMatrix<f64>;

    /// `ln p(y_t | x_t^i)` for every column `i` of `particles`.
    fn measurement_log_likelihood(
        &self,
        particles: &DMatrix<f64>,
        measurement: &Self::Measurement,
        t: usize,
    ) -> DVector<f64>;

    /// `ln p(x_{t+1} = to_state | x_t^j)` for every column `j` of `from_particles`.
    ///
    /// Only the smoother calls this.
    fn transition_log_density(
        &self,
        from_particles: &DMatrix<f64>,
        to_state: &DVector<f64>,
        input: Option<&Self::Input>,
        t: usize,
    ) -> DVector<f64>;

    /// Reject a measurement the model cannot evaluate, such as one of the wrong length.
    ///
    /// Called for every measurement before a run draws anything. The default accepts all.
    fn validate_measurement(&self, _measurement: &Self::Measurement, _t: usize) -> Result<()> {
        Ok(())
    }

    /// Reject an input the model cannot apply on the transition out of step `t`.
    fn validate_input(&self, _input: &Self::Input, _t: usize) -> Result<()> {
        Ok(())
    }
}

/// Check a measurement sequence against the model.
pub(crate) fn check_measurements<M: StateSpaceModel>(
    model: &M,
    measurements: &[M::Measurement],
) -> Result<()> {
    measurements
        .iter()
        .enumerate()
        .try_for_each(|(k, y)| model.validate_measurement(y, k + 1))
}

/// Check that `inputs`, when present, holds `num_steps` inputs the model accepts.
pub(crate) fn check_inputs<M: StateSpaceModel>(
    model: &M,
    inputs: Option<&[M::Input]>,
    num_steps: usize,
) -> Result<()> {
    let Some(inputs) = inputs else {
        return Ok(());
    };
    if inputs.len() != num_steps {
        return Err(SmcError::config(format!(
            "expected {num_steps} inputs, got {}",
            inputs.len()
        )));
    }
    inputs
        .iter()
        .enumerate()
        .try_for_each(|(s, u)| model.validate_input(u, s))
}
