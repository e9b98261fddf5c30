//! Particle history recorded by the filter.
//!
//! The history is an arena indexed by `(step, particle)`: one [`HistoryStep`] per time step,
//! each storing the particle matrix, the normalized importance log-weights *before*
//! resampling, and (after the first step) the parent index of every particle. Lineage is
//! reconstructed by following indices, never pointers, so the smoother gets O(1) access to
//! any particle at any step.

use nalgebra::{DMatrix, DVector};

use crate::error::{Result, SmcError};
use crate::particle::weights_from_log;

/// Tolerance on `Σ exp(log_weight) == 1` when validating a step.
const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

/// One time step of the filter output.
#[derive(Clone, Debug, PartialEq)]
pub struct HistoryStep {
    /// `state_size × N`, one column per particle.
    pub particles: DMatrix<f64>,
    /// Normalized importance log-weights, before resampling.
    pub log_weights: DVector<f64>,
    /// Parent index in the previous step for each particle; `None` for the initial step.
    pub ancestors: Option<Vec<usize>>,
}

/// Complete filter output: `T + 1` steps of `N` particles each.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParticleHistory {
    steps: Vec<HistoryStep>,
}

impl ParticleHistory {
    /// Start a history from the initial particle set.
    pub fn new(initial_particles: DMatrix<f64>, initial_log_weights: DVector<f64>) -> Result<Self> {
        let history = ParticleHistory {
            steps: vec![HistoryStep {
                particles: initial_particles,
                log_weights: initial_log_weights,
                ancestors: None,
            }],
        };
        history.validate_step(0)?;
        Ok(history)
    }

    /// Wrap raw steps without checking them; call [`ParticleHistory::validate`] before use.
    pub fn from_steps(steps: Vec<HistoryStep>) -> Self {
        ParticleHistory { steps }
    }

    /// Append the next step. The history is append-only.
    pub fn push(
        &mut self,
        particles: DMatrix<f64>,
        log_weights: DVector<f64>,
        ancestors: Vec<usize>,
    ) -> Result<()> {
        if self.steps.is_empty() {
            return Err(SmcError::config(
                "cannot append to a history without an initial step",
            ));
        }
        self.steps.push(HistoryStep {
            particles,
            log_weights,
            ancestors: Some(ancestors),
        });
        let t = self.steps.len() - 1;
        if let Err(err) = self.validate_step(t) {
            self.steps.pop();
            return Err(err);
        }
        Ok(())
    }

    /// Number of recorded steps, `T + 1` for a complete run over `T` measurements.
    pub fn len(&self) -> usize {
        self.steps.len()
    }
    /// True for a history with no steps, which no filter run produces.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
    /// Index of the last step, `T`.
    pub fn final_step(&self) -> Option<usize> {
        self.steps.len().checked_sub(1)
    }
    /// Particles per step, `N`.
    pub fn num_particles(&self) -> usize {
        self.steps.first().map_or(0, |s| s.particles.ncols())
    }
    /// Length of a state vector, `D`.
    pub fn state_size(&self) -> usize {
        self.steps.first().map_or(0, |s| s.particles.nrows())
    }
    /// All recorded steps in time order.
    pub fn steps(&self) -> &[HistoryStep] {
        &self.steps
    }
    /// Step `t`.
    ///
    /// # Panics
    /// If `t` is past the final step.
    pub fn step(&self, t: usize) -> &HistoryStep {
        &self.steps[t]
    }
    /// Particle matrix of step `t`, `D × N`.
    pub fn particles(&self, t: usize) -> &DMatrix<f64> {
        &self.steps[t].particles
    }
    /// Normalized pre-resampling log-weights of step `t`.
    pub fn log_weights(&self, t: usize) -> &DVector<f64> {
        &self.steps[t].log_weights
    }
    /// Normalized pre-resampling weights of step `t`, summing to one.
    pub fn weights(&self, t: usize) -> DVector<f64> {
        weights_from_log(&self.steps[t].log_weights)
    }
    /// Parent indices of step `t`, `None` for step 0.
    pub fn ancestors(&self, t: usize) -> Option<&[usize]> {
        self.steps[t].ancestors.as_deref()
    }
    /// State of particle `i` at step `t`.
    pub fn state(&self, t: usize, i: usize) -> DVector<f64> {
        self.steps[t].particles.column(i).clone_owned()
    }

    /// Particle indices, step 0 to `T`, on the lineage of final particle `index`.
    pub fn ancestral_indices(&self, index: usize) -> Result<Vec<usize>> {
        let final_step = self
            .final_step()
            .ok_or_else(|| SmcError::config("history is empty"))?;
        if index >= self.num_particles() {
            return Err(SmcError::config(format!(
                "particle index {index} out of range for {} particles",
                self.num_particles()
            )));
        }
        let mut indices = vec![0; final_step + 1];
        indices[final_step] = index;
        for t in (1..=final_step).rev() {
            let ancestors = self
                .ancestors(t)
                .ok_or_else(|| SmcError::config(format!("step {t} has no ancestor indices")))?;
            indices[t - 1] = ancestors[indices[t]];
        }
        Ok(indices)
    }

    /// The filtered trajectory of final particle `index`, as a `state_size × (T + 1)` matrix.
    pub fn ancestral_path(&self, index: usize) -> Result<DMatrix<f64>> {
        let indices = self.ancestral_indices(index)?;
        let mut path = DMatrix::zeros(self.state_size(), indices.len());
        for (t, &i) in indices.iter().enumerate() {
            path.set_column(t, &self.steps[t].particles.column(i));
        }
        Ok(path)
    }

    /// Check every step: consistent shapes, weights that form a distribution, no ancestors
    /// on the initial step and in-range ancestors on every later step.
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(SmcError::config("history is empty"));
        }
        (0..self.steps.len()).try_for_each(|t| self.validate_step(t))
    }

    fn validate_step(&self, t: usize) -> Result<()> {
        let step = &self.steps[t];
        let n = step.particles.ncols();
        if n == 0 {
            return Err(SmcError::config(format!("step {t} has no particles")));
        }
        if t > 0 {
            let first = &self.steps[0].particles;
            if step.particles.shape() != first.shape() {
                return Err(SmcError::config(format!(
                    "step {t} particle matrix is {:?}, expected {:?}",
                    step.particles.shape(),
                    first.shape()
                )));
            }
        }
        if step.log_weights.len() != n {
            return Err(SmcError::config(format!(
                "step {t} has {} weights for {n} particles",
                step.log_weights.len()
            )));
        }
        if step
            .log_weights
            .iter()
            .any(|w| w.is_nan() || *w == f64::INFINITY)
        {
            return Err(SmcError::config(format!(
                "step {t} has non-finite weights"
            )));
        }
        let weight_sum: f64 = step.log_weights.iter().map(|w| w.exp()).sum();
        if (weight_sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(SmcError::config(format!(
                "step {t} weights sum to {weight_sum}, expected 1"
            )));
        }
        match (&step.ancestors, t) {
            (Some(_), 0) => Err(SmcError::config("initial step must not have ancestors")),
            (None, t) if t > 0 => Err(SmcError::config(format!(
                "step {t} is missing ancestor indices"
            ))),
            (Some(ancestors), t) => {
                if ancestors.len() != n {
                    return Err(SmcError::config(format!(
                        "step {t} has {} ancestors for {n} particles",
                        ancestors.len()
                    )));
                }
                let parents = self.steps[t - 1].particles.ncols();
                match ancestors.iter().find(|&&a| a >= parents) {
                    Some(a) => Err(SmcError::config(format!(
                        "step {t} ancestor index {a} out of range for {parents} particles"
                    ))),
                    None => Ok(()),
                }
            }
            (None, _) => Ok(()),
        }
    }
}
