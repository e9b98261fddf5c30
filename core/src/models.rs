//! Linear-Gaussian state-space model.
//!
//! $$
//! x_{t+1} = A x_t + B u_t + v_t, \quad v_t \sim N(0, Q)
//! $$
//! $$
//! y_t = C x_t + e_t, \quad e_t \sim N(0, R)
//! $$
//! $$
//! x_0 \sim N(m_0, P_0)
//! $$
//!
//! The one-dimensional random walk (`A = C = 1`, no input) is the canonical test case for
//! the particle engine because [`crate::kalman`] gives its exact filtering and smoothing
//! distributions.

use nalgebra::{DMatrix, DVector};
use rand::Rng;

use crate::StateSpaceModel;
use crate::error::{Result, SmcError};
use crate::linalg::GaussianDensity;
use crate::sim::GenerativeModel;

#[derive(Clone, Debug)]
pub struct LinearGaussianModel {
    transition: DMatrix<f64>,
    control: Option<DMatrix<f64>>,
    observation: DMatrix<f64>,
    initial_mean: DVector<f64>,
    initial: GaussianDensity,
    process_noise: GaussianDensity,
    measurement_noise: GaussianDensity,
}

impl LinearGaussianModel {
    /// Build a model from its matrices.
    ///
    /// # Arguments
    /// * `transition` - state transition matrix `A` (n × n)
    /// * `observation` - measurement matrix `C` (p × n)
    /// * `process_noise` - process noise covariance `Q` (n × n)
    /// * `measurement_noise` - measurement noise covariance `R` (p × p)
    /// * `initial_mean` - initial state mean `m0` (n)
    /// * `initial_covariance` - initial state covariance `P0` (n × n)
    pub fn new(
        transition: DMatrix<f64>,
        observation: DMatrix<f64>,
        process_noise: DMatrix<f64>,
        measurement_noise: DMatrix<f64>,
        initial_mean: DVector<f64>,
        initial_covariance: DMatrix<f64>,
    ) -> Result<Self> {
        let n = initial_mean.len();
        let p = observation.nrows();
        if n == 0 {
            return Err(SmcError::config("state dimension must be positive"));
        }
        check_shape("transition", &transition, (n, n))?;
        check_shape("observation", &observation, (p, n))?;
        check_shape("process_noise", &process_noise, (n, n))?;
        check_shape("measurement_noise", &measurement_noise, (p, p))?;
        check_shape("initial_covariance", &initial_covariance, (n, n))?;
        Ok(LinearGaussianModel {
            transition,
            control: None,
            observation,
            initial_mean,
            initial: GaussianDensity::new(initial_covariance),
            process_noise: GaussianDensity::new(process_noise),
            measurement_noise: GaussianDensity::new(measurement_noise),
        })
    }

    /// One-dimensional random walk observed directly: `x_{t+1} = x_t + v`, `y_t = x_t + e`,
    /// `x_0 ~ N(0, p0)`. All three parameters are variances.
    pub fn random_walk(p0: f64, q: f64, r: f64) -> Self {
        let scalar = |v: f64| DMatrix::from_element(1, 1, v);
        LinearGaussianModel {
            transition: scalar(1.0),
            control: None,
            observation: scalar(1.0),
            initial_mean: DVector::zeros(1),
            initial: GaussianDensity::new(scalar(p0)),
            process_noise: GaussianDensity::new(scalar(q)),
            measurement_noise: GaussianDensity::new(scalar(r)),
        }
    }

    /// Add an input matrix `B` (n × k); inputs must then be k-vectors.
    pub fn with_control(mut self, control: DMatrix<f64>) -> Result<Self> {
        check_shape(
            "control",
            &control,
            (self.state_dimension(), control.ncols()),
        )?;
        self.control = Some(control);
        Ok(self)
    }

    /// State transition matrix `A`.
    pub fn transition(&self) -> &DMatrix<f64> {
        &self.transition
    }
    /// Input matrix `B`, if the model takes inputs.
    pub fn control(&self) -> Option<&DMatrix<f64>> {
        self.control.as_ref()
    }
    /// Measurement matrix `C`.
    pub fn observation(&self) -> &DMatrix<f64> {
        &self.observation
    }
    /// Length of a measurement vector.
    pub fn measurement_dimension(&self) -> usize {
        self.observation.nrows()
    }
    /// Initial state mean `m0`.
    pub fn initial_mean(&self) -> &DVector<f64> {
        &self.initial_mean
    }
    /// Initial state covariance `P0`.
    pub fn initial_covariance(&self) -> &DMatrix<f64> {
        self.initial.covariance()
    }
    /// Process noise covariance `Q`.
    pub fn process_noise(&self) -> &DMatrix<f64> {
        self.process_noise.covariance()
    }
    /// Measurement noise covariance `R`.
    pub fn measurement_noise(&self) -> &DMatrix<f64> {
        self.measurement_noise.covariance()
    }

    /// `B u`, or `None` when there is no input to apply.
    pub fn control_term(&self, input: Option<&DVector<f64>>) -> Option<DVector<f64>> {
        match (&self.control, input) {
            (Some(b), Some(u)) => Some(b * u),
            _ => None,
        }
    }

    /// Noise-free prediction `A x + B u` for every column.
    fn predict_mean(&self, particles: &DMatrix<f64>, input: Option<&DVector<f64>>) -> DMatrix<f64> {
        let mut predicted = &self.transition * particles;
        if let Some(bu) = self.control_term(input) {
            for mut column in predicted.column_iter_mut() {
                column += &bu;
            }
        }
        predicted
    }
}

fn check_shape(name: &str, matrix: &DMatrix<f64>, expected: (usize, usize)) -> Result<()> {
    if matrix.shape() != expected {
        return Err(SmcError::config(format!(
            "{name} is {:?}, expected {expected:?}",
            matrix.shape()
        )));
    }
    Ok(())
}

impl StateSpaceModel for LinearGaussianModel {
    type Measurement = DVector<f64>;
    type Input = DVector<f64>;

    fn state_dimension(&self) -> usize {
        self.initial_mean.len()
    }

    fn sample_initial<R: Rng + ?Sized>(&self, num_particles: usize, rng: &mut R) -> DMatrix<f64> {
        let mut particles = self.initial.sample(num_particles, rng);
        for mut column in particles.column_iter_mut() {
            column += &self.initial_mean;
        }
        particles
    }

    fn sample_process_noise<R: Rng + ?Sized>(
        &self,
        particles: &DMatrix<f64>,
        _input: Option<&DVector<f64>>,
        _t: usize,
        rng: &mut R,
    ) -> DMatrix<f64> {
        self.process_noise.sample(particles.ncols(), rng)
    }

    fn propagate(
        &self,
        particles: &DMatrix<f64>,
        input: Option<&DVector<f64>>,
        _t: usize,
        noise: &DMatrix<f64>,
    ) -> DMatrix<f64> {
        self.predict_mean(particles, input) + noise
    }

    fn measurement_log_likelihood(
        &self,
        particles: &DMatrix<f64>,
        measurement: &DVector<f64>,
        _t: usize,
    ) -> DVector<f64> {
        let predicted = &self.observation * particles;
        DVector::from_iterator(
            particles.ncols(),
            predicted
                .column_iter()
                .map(|z| self.measurement_noise.log_density(&(measurement - z))),
        )
    }

    fn transition_log_density(
        &self,
        from_particles: &DMatrix<f64>,
        to_state: &DVector<f64>,
        input: Option<&DVector<f64>>,
        _t: usize,
    ) -> DVector<f64> {
        let predicted = self.predict_mean(from_particles, input);
        DVector::from_iterator(
            from_particles.ncols(),
            predicted
                .column_iter()
                .map(|x| self.process_noise.log_density(&(to_state - x))),
        )
    }

    fn validate_measurement(&self, measurement: &DVector<f64>, t: usize) -> Result<()> {
        if measurement.len() != self.measurement_dimension() {
            return Err(SmcError::config(format!(
                "measurement {t} has {} entries, expected {}",
                measurement.len(),
                self.measurement_dimension()
            )));
        }
        Ok(())
    }

    fn validate_input(&self, input: &DVector<f64>, t: usize) -> Result<()> {
        match &self.control {
            Some(b) if input.len() != b.ncols() => Err(SmcError::config(format!(
                "input {t} has {} entries, expected {}",
                input.len(),
                b.ncols()
            ))),
            _ => Ok(()),
        }
    }
}

impl GenerativeModel for LinearGaussianModel {
    fn sample_measurement<R: Rng + ?Sized>(
        &self,
        state: &DVector<f64>,
        _t: usize,
        rng: &mut R,
    ) -> DVector<f64> {
        let noise = self.measurement_noise.sample(1, rng);
        &self.observation * state + noise.column(0)
    }
}
