//! Synthetic dataset generation for evaluating the filter and smoother.
//!
//! A dataset is a true state sequence `x_0..x_T` and a measurement sequence `y_1..y_T`
//! drawn from the same noise model the estimator will assume:
//!
//! - `x_0` is given by the caller (the estimator still starts from the model's own prior);
//! - `x_k = propagate(x_{k-1}, u_{k-1}, noise)` for `k = 1..=T`;
//! - `y_k` is measured from `x_k`.

use nalgebra::{DMatrix, DVector};
use rand::Rng;

use crate::{StateSpaceModel, check_inputs};
use crate::error::{Result, SmcError};

/// A model that can also simulate measurements, needed only to generate datasets.
pub trait GenerativeModel: StateSpaceModel {
    /// Draw a measurement of `state` at step `t`.
    fn sample_measurement<R: Rng + ?Sized>(
        &self,
        state: &DVector<f64>,
        t: usize,
        rng: &mut R,
    ) -> Self::Measurement;
}

/// Simulate `steps` transitions from `initial_state`.
///
/// Returns the `T + 1` true states (as a `state_size × (T + 1)` matrix) and the `T`
/// measurements. Draw order per step: process noise, then measurement noise.
pub fn generate_dataset<M, R>(
    model: &M,
    steps: usize,
    initial_state: &DVector<f64>,
    inputs: Option<&[M::Input]>,
    rng: &mut R,
) -> Result<(DMatrix<f64>, Vec<M::Measurement>)>
where
    M: GenerativeModel,
    R: Rng + ?Sized,
{
    let state_size = model.state_dimension();
    if initial_state.len() != state_size {
        return Err(SmcError::config(format!(
            "initial state has {} entries, model dimension is {state_size}",
            initial_state.len()
        )));
    }
    check_inputs(model, inputs, steps)?;
    let mut states = DMatrix::zeros(state_size, steps + 1);
    states.set_column(0, initial_state);
    let mut measurements = Vec::with_capacity(steps);
    for k in 1..=steps {
        let input = inputs.map(|u| &u[k - 1]);
        let previous = states.columns(k - 1, 1).clone_owned();
        let noise = model.sample_process_noise(&previous, input, k - 1, rng);
        let next = model.propagate(&previous, input, k - 1, &noise);
        let next = next.column(0).clone_owned();
        measurements.push(model.sample_measurement(&next, k, rng));
        states.set_column(k, &next);
    }
    Ok((states, measurements))
}
