//! Closed-form Kalman filter and Rauch–Tung–Striebel smoother for [`LinearGaussianModel`].
//!
//! The linear-Gaussian case is the one state-space model whose filtering and smoothing
//! distributions are known exactly, so these routines serve as the reference the particle
//! filter and smoother are validated against. Step indexing matches the particle engine:
//! step 0 is the prior, step `t` has seen measurements `1..=t`.

use nalgebra::{DMatrix, DVector};

use crate::{check_inputs, check_measurements};
use crate::error::{Result, SmcError};
use crate::linalg::{robust_spd_solve, symmetrize};
use crate::models::LinearGaussianModel;

/// Mean and covariance of a Gaussian marginal.
#[derive(Clone, Debug, PartialEq)]
pub struct GaussianEstimate {
    pub mean: DVector<f64>,
    pub covariance: DMatrix<f64>,
}

/// Kalman filter output: predicted (`t | t-1`) and filtered (`t | t`) marginals.
#[derive(Clone, Debug, Default)]
pub struct KalmanOutput {
    /// `predicted[0]` is the prior.
    pub predicted: Vec<GaussianEstimate>,
    pub filtered: Vec<GaussianEstimate>,
}

/// Exact filter and smoother for a [`LinearGaussianModel`].
pub struct KalmanFilter<'m> {
    model: &'m LinearGaussianModel,
}

impl<'m> KalmanFilter<'m> {
    /// Borrow `model` for filtering and smoothing.
    pub fn new(model: &'m LinearGaussianModel) -> Self {
        KalmanFilter { model }
    }

    /// Filter `measurements`, returning `T + 1` predicted and filtered marginals.
    pub fn filter(
        &self,
        measurements: &[DVector<f64>],
        inputs: Option<&[DVector<f64>]>,
    ) -> Result<KalmanOutput> {
        check_measurements(self.model, measurements)?;
        check_inputs(self.model, inputs, measurements.len())?;
        let a = self.model.transition();
        let c = self.model.observation();
        let q = self.model.process_noise();
        let r = self.model.measurement_noise();

        let prior = GaussianEstimate {
            mean: self.model.initial_mean().clone(),
            covariance: self.model.initial_covariance().clone(),
        };
        let mut output = KalmanOutput {
            predicted: vec![prior.clone()],
            filtered: vec![prior],
        };
        for (k, y) in measurements.iter().enumerate() {
            let previous = &output.filtered[k];
            let mut mean = a * &previous.mean;
            if let Some(bu) = self.model.control_term(inputs.map(|u| &u[k])) {
                mean += bu;
            }
            let covariance = symmetrize(&(a * &previous.covariance * a.transpose() + q));
            let predicted = GaussianEstimate { mean, covariance };

            let innovation = y - c * &predicted.mean;
            let innovation_cov = c * &predicted.covariance * c.transpose() + r;
            // K = P Cᵀ S⁻¹, solved as S Kᵀ = C P
            let gain_t = robust_spd_solve(&innovation_cov, &(c * &predicted.covariance))
                .ok_or_else(|| {
                    SmcError::config(format!("singular innovation covariance at step {}", k + 1))
                })?;
            let gain = gain_t.transpose();
            let n = predicted.mean.len();
            let identity = DMatrix::<f64>::identity(n, n);
            let filtered = GaussianEstimate {
                mean: &predicted.mean + &gain * innovation,
                covariance: symmetrize(&((identity - &gain * c) * &predicted.covariance)),
            };
            output.predicted.push(predicted);
            output.filtered.push(filtered);
        }
        Ok(output)
    }

    /// Rauch–Tung–Striebel backward pass over a filter output.
    pub fn smooth(&self, output: &KalmanOutput) -> Result<Vec<GaussianEstimate>> {
        let Some(last) = output.filtered.last() else {
            return Ok(Vec::new());
        };
        let a = self.model.transition();
        let num_steps = output.filtered.len();
        let mut smoothed = vec![last.clone(); num_steps];
        for t in (0..num_steps - 1).rev() {
            let filtered = &output.filtered[t];
            let predicted = &output.predicted[t + 1];
            // G = P_t Aᵀ P_{t+1|t}⁻¹, solved as P_{t+1|t} Gᵀ = A P_t
            let gain_t = robust_spd_solve(&predicted.covariance, &(a * &filtered.covariance))
                .ok_or_else(|| {
                    SmcError::config(format!("singular predicted covariance at step {}", t + 1))
                })?;
            let gain = gain_t.transpose();
            let next = &smoothed[t + 1];
            let mean = &filtered.mean + &gain * (&next.mean - &predicted.mean);
            let covariance = symmetrize(
                &(&filtered.covariance
                    + &gain * (&next.covariance - &predicted.covariance) * gain.transpose()),
            );
            smoothed[t] = GaussianEstimate { mean, covariance };
        }
        Ok(smoothed)
    }
}
