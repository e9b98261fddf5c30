//! Backward-simulation (ancestor sampling) smoother.
//!
//! Each smoothed trajectory starts from a particle drawn with the filter's final importance
//! weights and walks backwards through the [`ParticleHistory`]. At step `t` the candidate
//! parents `j` are re-weighted by
//!
//! $$
//! \ln \tilde{w}_t^j = \ln w_t^j + \ln p(x_{t+1}^\star \mid x_t^j)
//! $$
//!
//! where $x_{t+1}^\star$ is the state the trajectory already holds at `t + 1`, and one parent
//! is drawn from the normalized result. The cost is O(T · M · N) transition-density
//! evaluations.
//!
//! Trajectories are independent of each other, so they run in parallel with `rayon`. Every
//! trajectory owns a [`StdRng`] seeded from the caller's generator before any work starts,
//! which makes the output identical with and without parallelism.

use log::{info, warn};
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{StateSpaceModel, check_inputs};
use crate::error::{Result, SmcError};
use crate::filter::DegeneracyPolicy;
use crate::history::ParticleHistory;
use crate::particle::{normalize_log_weights, sample_categorical, weights_from_log};

/// How smoothed trajectories are built from the filter history.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SmoothingMethod {
    /// Re-draw the ancestor at every step using filter weight × transition density.
    #[default]
    BackwardSimulation,
    /// Follow the ancestor indices recorded by the filter from a sampled final particle.
    AncestralPaths,
}

/// Smoother configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SmootherConfig {
    pub num_trajectories: usize,
    pub method: SmoothingMethod,
    pub degeneracy_policy: DegeneracyPolicy,
    pub parallel: bool,
}

impl Default for SmootherConfig {
    fn default() -> Self {
        Self {
            num_trajectories: 100,
            method: SmoothingMethod::BackwardSimulation,
            degeneracy_policy: DegeneracyPolicy::Fail,
            parallel: true,
        }
    }
}

impl SmootherConfig {
    /// Default configuration drawing `num_trajectories` trajectories.
    pub fn with_trajectories(num_trajectories: usize) -> Self {
        Self {
            num_trajectories,
            ..Self::default()
        }
    }
    /// Reject a request for zero trajectories.
    pub fn validate(&self) -> Result<()> {
        if self.num_trajectories < 1 {
            return Err(SmcError::config("num_trajectories must be at least 1"));
        }
        Ok(())
    }
}

/// `M` smoothed trajectories of `T + 1` states each.
///
/// Stored per step: `states[t]` is a `state_size × M` matrix whose column `m` is trajectory
/// `m` at step `t`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SmoothedTrajectories {
    states: Vec<DMatrix<f64>>,
}

impl SmoothedTrajectories {
    /// Number of steps, `T + 1`.
    pub fn len(&self) -> usize {
        self.states.len()
    }
    /// True only for a result that was never filled.
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
    /// Number of trajectories, `M`.
    pub fn num_trajectories(&self) -> usize {
        self.states.first().map_or(0, |s| s.ncols())
    }
    /// Length of a state vector.
    pub fn state_size(&self) -> usize {
        self.states.first().map_or(0, |s| s.nrows())
    }
    /// All trajectories at step `t`, one column each.
    pub fn step(&self, t: usize) -> &DMatrix<f64> {
        &self.states[t]
    }
    /// Trajectory `m` as a `state_size × (T + 1)` matrix.
    pub fn trajectory(&self, m: usize) -> DMatrix<f64> {
        let mut path = DMatrix::zeros(self.state_size(), self.len());
        for (t, states) in self.states.iter().enumerate() {
            path.set_column(t, &states.column(m));
        }
        path
    }
    /// Per-step mean over trajectories.
    pub fn mean(&self) -> Vec<DVector<f64>> {
        self.states.iter().map(|s| s.column_mean()).collect()
    }
    /// Per-step sample covariance over trajectories (normalized by M).
    pub fn covariance(&self) -> Vec<DMatrix<f64>> {
        self.states
            .iter()
            .map(|s| {
                let mean = s.column_mean();
                let mut cov = DMatrix::zeros(s.nrows(), s.nrows());
                for column in s.column_iter() {
                    let diff = column - &mean;
                    cov += &diff * diff.transpose();
                }
                cov / s.ncols() as f64
            })
            .collect()
    }
}

/// Backward-simulation smoother bound to a model.
#[derive(Clone, Debug)]
pub struct AncestorSamplingSmoother<'m, M> {
    model: &'m M,
    config: SmootherConfig,
}

impl<'m, M> AncestorSamplingSmoother<'m, M>
where
    M: StateSpaceModel + Sync,
    M::Input: Sync,
{
    /// Create a smoother for `model`. Fails with `InvalidConfiguration` for zero trajectories.
    pub fn new(model: &'m M, config: SmootherConfig) -> Result<Self> {
        config.validate()?;
        Ok(AncestorSamplingSmoother { model, config })
    }
    /// The configuration this smoother runs with.
    pub fn config(&self) -> &SmootherConfig {
        &self.config
    }

    /// Smooth a completed filter history.
    ///
    /// `inputs` must be the same inputs the filter ran with (`T` entries) or `None`.
    pub fn smooth<R: Rng + ?Sized>(
        &self,
        history: &ParticleHistory,
        inputs: Option<&[M::Input]>,
        rng: &mut R,
    ) -> Result<SmoothedTrajectories> {
        history.validate()?;
        if history.state_size() != self.model.state_dimension() {
            return Err(SmcError::config(format!(
                "history state size {} does not match model dimension {}",
                history.state_size(),
                self.model.state_dimension()
            )));
        }
        check_inputs(self.model, inputs, history.len() - 1)?;
        let m = self.config.num_trajectories;
        info!(
            "Smoothing {m} trajectories over {} steps ({:?})",
            history.len(),
            self.config.method
        );

        let seeds: Vec<u64> = (0..m).map(|_| rng.random::<u64>()).collect();
        let run = |(trajectory, seed): (usize, &u64)| {
            let mut trajectory_rng = StdRng::seed_from_u64(*seed);
            self.sample_indices(history, inputs, trajectory, &mut trajectory_rng)
        };
        let indices: Vec<Vec<usize>> = if self.config.parallel {
            seeds.par_iter().enumerate().map(run).collect::<Result<_>>()?
        } else {
            seeds.iter().enumerate().map(run).collect::<Result<_>>()?
        };

        let states = (0..history.len())
            .map(|t| {
                let particles = history.particles(t);
                DMatrix::from_fn(history.state_size(), m, |d, j| {
                    particles[(d, indices[j][t])]
                })
            })
            .collect();
        Ok(SmoothedTrajectories { states })
    }

    /// Particle index chosen at every step, 0 to `T`, for one trajectory.
    fn sample_indices(
        &self,
        history: &ParticleHistory,
        inputs: Option<&[M::Input]>,
        trajectory: usize,
        rng: &mut StdRng,
    ) -> Result<Vec<usize>> {
        let final_step = history.len() - 1;
        let mut indices = vec![0; history.len()];
        indices[final_step] = sample_categorical(history.weights(final_step).as_slice(), rng);

        for t in (0..final_step).rev() {
            indices[t] = match self.config.method {
                SmoothingMethod::AncestralPaths => match history.ancestors(t + 1) {
                    Some(ancestors) => ancestors[indices[t + 1]],
                    None => {
                        return Err(SmcError::config(format!(
                            "step {} is missing ancestor indices",
                            t + 1
                        )));
                    }
                },
                SmoothingMethod::BackwardSimulation => {
                    let target = history.state(t + 1, indices[t + 1]);
                    let input = inputs.map(|u| &u[t]);
                    self.backward_draw(history, &target, input, t, trajectory, rng)?
                }
            };
        }
        Ok(indices)
    }

    fn backward_draw(
        &self,
        history: &ParticleHistory,
        target: &DVector<f64>,
        input: Option<&M::Input>,
        t: usize,
        trajectory: usize,
        rng: &mut StdRng,
    ) -> Result<usize> {
        let candidates = history.particles(t);
        let transition = self
            .model
            .transition_log_density(candidates, target, input, t);
        if transition.len() != candidates.ncols() {
            return Err(SmcError::config(format!(
                "transition_log_density returned {} values for {} particles",
                transition.len(),
                candidates.ncols()
            )));
        }
        let combined = history.log_weights(t) + transition;
        match normalize_log_weights(&combined) {
            Some(log_weights) => Ok(sample_categorical(
                weights_from_log(&log_weights).as_slice(),
                rng,
            )),
            None => match self.config.degeneracy_policy {
                DegeneracyPolicy::Fail => {
                    Err(SmcError::DegenerateSmoothingWeights { step: t, trajectory })
                }
                DegeneracyPolicy::UniformFallback => {
                    warn!(
                        "Smoothing weights degenerate at step {t} for trajectory {trajectory}; \
                         drawing the ancestor uniformly"
                    );
                    Ok(rng.random_range(0..candidates.ncols()))
                }
            },
        }
    }
}
