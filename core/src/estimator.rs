//! Orchestration surface over the filter and smoother.
//!
//! [`run_filter`] and [`run_smoother`] are pure functions of their inputs and the injected
//! random source. [`Simulator`] bundles a model with its measurement sequence and caches the
//! outputs of the last run so that estimates can be queried afterwards.

use log::info;
use nalgebra::{DMatrix, DVector};
use rand::Rng;

use crate::{StateSpaceModel, check_inputs, check_measurements};
use crate::error::{Result, SmcError};
use crate::filter::{
    FilterConfig, FilterDiagnostics, FilterOutput, FilteredEstimates, ParticleFilter,
};
use crate::history::ParticleHistory;
use crate::smoother::{AncestorSamplingSmoother, SmoothedTrajectories, SmootherConfig};

/// Run the particle filter once.
pub fn run_filter<M, R>(
    config: &FilterConfig,
    measurements: &[M::Measurement],
    inputs: Option<&[M::Input]>,
    model: &M,
    rng: &mut R,
) -> Result<FilterOutput>
where
    M: StateSpaceModel,
    R: Rng + ?Sized,
{
    ParticleFilter::new(model, config.clone())?.run(measurements, inputs, rng)
}

/// Draw smoothed trajectories from a completed filter history.
pub fn run_smoother<M, R>(
    history: &ParticleHistory,
    config: &SmootherConfig,
    inputs: Option<&[M::Input]>,
    model: &M,
    rng: &mut R,
) -> Result<SmoothedTrajectories>
where
    M: StateSpaceModel + Sync,
    M::Input: Sync,
    R: Rng + ?Sized,
{
    AncestorSamplingSmoother::new(model, config.clone())?.smooth(history, inputs, rng)
}

/// A model, its data and the results of the last run.
pub struct Simulator<M: StateSpaceModel> {
    model: M,
    measurements: Vec<M::Measurement>,
    inputs: Option<Vec<M::Input>>,
    filter_config: FilterConfig,
    smoother_config: SmootherConfig,
    filtered: Option<FilterOutput>,
    smoothed: Option<SmoothedTrajectories>,
}

impl<M> Simulator<M>
where
    M: StateSpaceModel + Sync,
    M::Input: Sync,
{
    /// Bundle a model with its measurement sequence.
    ///
    /// # Arguments
    /// * `model` - the state-space model driving the filter and smoother
    /// * `measurements` - `y_1..y_T`, possibly empty
    /// * `inputs` - one input per measurement, or `None`
    ///
    /// # Returns
    /// `InvalidConfiguration` if the input count differs from the measurement count or the
    /// model rejects a measurement or input.
    pub fn new(
        model: M,
        measurements: Vec<M::Measurement>,
        inputs: Option<Vec<M::Input>>,
    ) -> Result<Self> {
        check_measurements(&model, &measurements)?;
        check_inputs(&model, inputs.as_deref(), measurements.len())?;
        Ok(Simulator {
            model,
            measurements,
            inputs,
            filter_config: FilterConfig::default(),
            smoother_config: SmootherConfig::default(),
            filtered: None,
            smoothed: None,
        })
    }

    /// Replace the filter settings. `num_particles` is overridden by [`Simulator::simulate`].
    pub fn with_filter_config(mut self, config: FilterConfig) -> Self {
        self.filter_config = config;
        self
    }
    /// Replace the smoother settings. `num_trajectories` is overridden by [`Simulator::simulate`].
    pub fn with_smoother_config(mut self, config: SmootherConfig) -> Self {
        self.smoother_config = config;
        self
    }

    /// The model the simulator was built with.
    pub fn model(&self) -> &M {
        &self.model
    }
    /// The measurement sequence `y_1..y_T`.
    pub fn measurements(&self) -> &[M::Measurement] {
        &self.measurements
    }
    /// The exogenous inputs, if any.
    pub fn inputs(&self) -> Option<&[M::Input]> {
        self.inputs.as_deref()
    }

    /// Run only the forward filter with `num_particles` particles. Clears any previous
    /// smoothing result.
    pub fn filter<R: Rng + ?Sized>(&mut self, num_particles: usize, rng: &mut R) -> Result<()> {
        self.filtered = None;
        self.smoothed = None;
        self.filter_config.num_particles = num_particles;
        let output = run_filter(
            &self.filter_config,
            &self.measurements,
            self.inputs.as_deref(),
            &self.model,
            rng,
        )?;
        info!(
            "Filter finished: log-likelihood {:.4}, {} fallback steps",
            output.diagnostics.log_likelihood,
            output.diagnostics.fallback_steps.len()
        );
        self.filtered = Some(output);
        Ok(())
    }

    /// Filter with `num_particles` particles, then draw `num_trajectories` smoothed
    /// trajectories from the resulting history.
    pub fn simulate<R: Rng + ?Sized>(
        &mut self,
        num_particles: usize,
        num_trajectories: usize,
        rng: &mut R,
    ) -> Result<()> {
        self.filter(num_particles, rng)?;
        self.smoother_config.num_trajectories = num_trajectories;
        let history = &self.filtered.as_ref().ok_or(SmcError::NotRun("filter"))?.history;
        let smoothed = run_smoother(
            history,
            &self.smoother_config,
            self.inputs.as_deref(),
            &self.model,
            rng,
        )?;
        info!(
            "Smoother finished: {} trajectories over {} steps ({:?})",
            smoothed.num_trajectories(),
            smoothed.len(),
            self.smoother_config.method
        );
        self.smoothed = Some(smoothed);
        Ok(())
    }

    fn filter_output(&self) -> Result<&FilterOutput> {
        self.filtered.as_ref().ok_or(SmcError::NotRun("filter"))
    }

    /// Per-step filtered means and covariances, `T + 1` entries.
    ///
    /// Returns `NotRun` before the filter has run.
    pub fn get_filtered_estimates(&self) -> Result<&FilteredEstimates> {
        Ok(&self.filter_output()?.estimates)
    }

    /// Particle values and normalized weights of every step, before resampling.
    pub fn get_filtered_particles(&self) -> Result<Vec<(DMatrix<f64>, DVector<f64>)>> {
        let history = &self.filter_output()?.history;
        Ok((0..history.len())
            .map(|t| (history.particles(t).clone(), history.weights(t)))
            .collect())
    }

    /// The particle history recorded by the last filter run.
    pub fn history(&self) -> Result<&ParticleHistory> {
        Ok(&self.filter_output()?.history)
    }

    /// Effective sample sizes, resampling flags, fallback steps and log-likelihood of the last run.
    pub fn diagnostics(&self) -> Result<&FilterDiagnostics> {
        Ok(&self.filter_output()?.diagnostics)
    }

    /// Smoothed trajectories from the last [`Simulator::simulate`].
    ///
    /// Returns `NotRun` if only the filter has run.
    pub fn get_smoothed_estimates(&self) -> Result<&SmoothedTrajectories> {
        self.smoothed.as_ref().ok_or(SmcError::NotRun("smoother"))
    }

    /// Mean over the smoothed trajectories at each step.
    pub fn get_smoothed_mean(&self) -> Result<Vec<DVector<f64>>> {
        Ok(self.get_smoothed_estimates()?.mean())
    }
}
