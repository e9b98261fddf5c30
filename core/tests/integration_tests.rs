//! End-to-end tests of the particle filter and backward-simulation smoother.
//!
//! The one-dimensional random walk is the reference scenario: its filtering and smoothing
//! distributions are known exactly from the Kalman filter and the Rauch–Tung–Striebel
//! smoother, so the particle estimates can be checked against them. Tolerances are expressed
//! in units of the exact posterior standard deviation and are loose enough that Monte Carlo
//! error at the particle counts used here stays well inside them.
//!
//! The remaining tests cover the resampling schemes' sampling distributions, seed
//! reproducibility, degenerate-weight handling and the smallest valid problem sizes.
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use seqmc::estimator::{Simulator, run_filter, run_smoother};
use seqmc::kalman::KalmanFilter;
use seqmc::models::LinearGaussianModel;
use seqmc::particle::{
    multinomial_resample, residual_resample, stratified_resample, systematic_resample,
};
use seqmc::sim::generate_dataset;
use seqmc::{
    DegeneracyPolicy, FilterConfig, SmcError, SmootherConfig, SmoothingMethod, StateSpaceModel,
};

/// Random walk with P0 = Q = R = 1 and a simulated track of `steps` measurements.
fn random_walk_dataset(steps: usize, seed: u64) -> (LinearGaussianModel, Vec<DVector<f64>>) {
    let model = LinearGaussianModel::random_walk(1.0, 1.0, 1.0);
    let mut rng = StdRng::seed_from_u64(seed);
    let (_truth, measurements) =
        generate_dataset(&model, steps, &DVector::from_element(1, 0.0), None, &mut rng).unwrap();
    (model, measurements)
}

/// Exact `ln p(y_1..y_T)` for a scalar linear-Gaussian model from its Kalman predictions.
fn kalman_log_likelihood(model: &LinearGaussianModel, measurements: &[DVector<f64>]) -> f64 {
    let output = KalmanFilter::new(model).filter(measurements, None).unwrap();
    let r = model.measurement_noise()[(0, 0)];
    measurements
        .iter()
        .enumerate()
        .map(|(k, y)| {
            let predicted = &output.predicted[k + 1];
            let s = predicted.covariance[(0, 0)] + r;
            let residual = y[0] - predicted.mean[0];
            -0.5 * ((2.0 * std::f64::consts::PI * s).ln() + residual * residual / s)
        })
        .sum()
}

fn chi_square(counts: &[usize], probabilities: &[f64]) -> f64 {
    let total: usize = counts.iter().sum();
    counts
        .iter()
        .zip(probabilities)
        .map(|(&c, &p)| {
            let expected = p * total as f64;
            (c as f64 - expected).powi(2) / expected
        })
        .sum()
}

fn counts(indices: &[usize], categories: usize) -> Vec<usize> {
    let mut counts = vec![0; categories];
    for &i in indices {
        counts[i] += 1;
    }
    counts
}

/// Wraps a model so that every particle has zero likelihood at one step.
struct BlindAt {
    inner: LinearGaussianModel,
    step: usize,
}

impl StateSpaceModel for BlindAt {
    type Measurement = DVector<f64>;
    type Input = DVector<f64>;

    fn state_dimension(&self) -> usize {
        self.inner.state_dimension()
    }
    fn sample_initial<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> DMatrix<f64> {
        self.inner.sample_initial(n, rng)
    }
    fn sample_process_noise<R: Rng + ?Sized>(
        &self,
        particles: &DMatrix<f64>,
        input: Option<&DVector<f64>>,
        t: usize,
        rng: &mut R,
    ) -> DMatrix<f64> {
        self.inner.sample_process_noise(particles, input, t, rng)
    }
    fn propagate(
        &self,
        particles: &DMatrix<f64>,
        input: Option<&DVector<f64>>,
        t: usize,
        noise: &DMatrix<f64>,
    ) -> DMatrix<f64> {
        self.inner.propagate(particles, input, t, noise)
    }
    fn measurement_log_likelihood(
        &self,
        particles: &DMatrix<f64>,
        measurement: &DVector<f64>,
        t: usize,
    ) -> DVector<f64> {
        if t == self.step {
            DVector::from_element(particles.ncols(), f64::NEG_INFINITY)
        } else {
            self.inner.measurement_log_likelihood(particles, measurement, t)
        }
    }
    fn transition_log_density(
        &self,
        from_particles: &DMatrix<f64>,
        to_state: &DVector<f64>,
        input: Option<&DVector<f64>>,
        t: usize,
    ) -> DVector<f64> {
        self.inner.transition_log_density(from_particles, to_state, input, t)
    }
}

#[test]
fn test_filtered_estimates_track_kalman_filter() {
    let (model, ys) = random_walk_dataset(50, 42);
    let exact = KalmanFilter::new(&model).filter(&ys, None).unwrap();
    let output = run_filter(
        &FilterConfig::with_particles(1000),
        &ys,
        None,
        &model,
        &mut StdRng::seed_from_u64(7),
    )
    .unwrap();

    assert_eq!(output.estimates.len(), 51);
    for t in 0..=50 {
        let sd = exact.filtered[t].covariance[(0, 0)].sqrt();
        let error = (output.estimates.mean(t)[0] - exact.filtered[t].mean[0]).abs();
        assert!(error < sd, "step {t}: filtered mean off by {error}, posterior sd {sd}");
    }
    let final_sd = exact.filtered[50].covariance[(0, 0)].sqrt();
    assert!((output.estimates.mean(50)[0] - exact.filtered[50].mean[0]).abs() < 4.0 * final_sd);

    let ratio = output.estimates.covariance(50)[(0, 0)] / exact.filtered[50].covariance[(0, 0)];
    assert!(ratio > 0.6 && ratio < 1.6, "filtered variance ratio {ratio}");
}

#[test]
fn test_final_filtered_mean_within_kalman_bounds_at_small_particle_count() {
    // P0 = Q = R = 1, T = 50, N = 100.
    for seed in [42, 7, 1234] {
        let (model, ys) = random_walk_dataset(50, seed);
        let exact = KalmanFilter::new(&model).filter(&ys, None).unwrap();
        let output = run_filter(
            &FilterConfig::with_particles(100),
            &ys,
            None,
            &model,
            &mut StdRng::seed_from_u64(seed + 1),
        )
        .unwrap();
        for t in 0..=50 {
            let sd = exact.filtered[t].covariance[(0, 0)].sqrt();
            let error = (output.estimates.mean(t)[0] - exact.filtered[t].mean[0]).abs();
            assert!(error < 3.0 * sd, "seed {seed}, step {t}: off by {error}, sd {sd}");
        }
        let final_sd = exact.filtered[50].covariance[(0, 0)].sqrt();
        let final_error = (output.estimates.mean(50)[0] - exact.filtered[50].mean[0]).abs();
        assert!(final_error < 4.0 * final_sd);
    }
}

#[test]
fn test_wrong_measurement_dimension_is_a_configuration_error() {
    let model = LinearGaussianModel::random_walk(1.0, 1.0, 1.0);
    let ys = vec![DVector::from_element(2, 0.5)];
    let mut rng = StdRng::seed_from_u64(0);
    let particle = run_filter(&FilterConfig::with_particles(10), &ys, None, &model, &mut rng);
    assert!(matches!(particle, Err(SmcError::InvalidConfiguration(_))));
    let exact = KalmanFilter::new(&model).filter(&ys, None);
    assert!(matches!(exact, Err(SmcError::InvalidConfiguration(_))));
    assert!(Simulator::new(model, ys, None).is_err());
}

#[test]
fn test_log_likelihood_matches_kalman() {
    let (model, ys) = random_walk_dataset(50, 3);
    let exact = kalman_log_likelihood(&model, &ys);
    let output = run_filter(
        &FilterConfig::with_particles(1000),
        &ys,
        None,
        &model,
        &mut StdRng::seed_from_u64(11),
    )
    .unwrap();
    let estimate = output.diagnostics.log_likelihood;
    assert!(estimate.is_finite());
    assert!(
        (estimate - exact).abs() < 1.5,
        "SMC log-likelihood {estimate}, exact {exact}"
    );
}

#[test]
fn test_smoothed_means_track_rts_smoother() {
    let (model, ys) = random_walk_dataset(50, 42);
    let kf = KalmanFilter::new(&model);
    let exact = kf.smooth(&kf.filter(&ys, None).unwrap()).unwrap();

    let mut sim = Simulator::new(model.clone(), ys, None).unwrap();
    let mut rng = StdRng::seed_from_u64(2024);
    sim.simulate(500, 300, &mut rng).unwrap();
    let smoothed = sim.get_smoothed_estimates().unwrap();
    let means = sim.get_smoothed_mean().unwrap();
    assert_eq!(means.len(), 51);
    assert_eq!(smoothed.num_trajectories(), 300);

    for t in 0..=50 {
        let sd = exact[t].covariance[(0, 0)].sqrt();
        let error = (means[t][0] - exact[t].mean[0]).abs();
        assert!(error < 0.5 * sd, "step {t}: smoothed mean off by {error}, posterior sd {sd}");
    }
    let covariances = smoothed.covariance();
    let ratio = covariances[25][(0, 0)] / exact[25].covariance[(0, 0)];
    assert!(ratio > 0.5 && ratio < 2.0, "smoothed variance ratio {ratio}");
}

#[test]
fn test_ancestral_paths_are_consistent_with_history() {
    let (model, ys) = random_walk_dataset(20, 8);
    let mut sim = Simulator::new(model, ys, None)
        .unwrap()
        .with_smoother_config(SmootherConfig {
            method: SmoothingMethod::AncestralPaths,
            ..SmootherConfig::default()
        });
    sim.simulate(64, 16, &mut StdRng::seed_from_u64(4)).unwrap();
    let history = sim.history().unwrap();
    let smoothed = sim.get_smoothed_estimates().unwrap();
    // Every trajectory must be some particle's recorded lineage.
    for m in 0..16 {
        let trajectory = smoothed.trajectory(m);
        let found = (0..64).any(|i| history.ancestral_path(i).unwrap() == trajectory);
        assert!(found, "trajectory {m} is not an ancestral path");
    }
}

#[test]
fn test_same_seed_same_output() {
    let (model, ys) = random_walk_dataset(30, 1);
    let run = |parallel: bool| {
        let mut sim = Simulator::new(model.clone(), ys.clone(), None)
            .unwrap()
            .with_smoother_config(SmootherConfig {
                parallel,
                ..SmootherConfig::default()
            });
        sim.simulate(100, 40, &mut StdRng::seed_from_u64(99)).unwrap();
        (
            sim.history().unwrap().clone(),
            sim.get_smoothed_estimates().unwrap().clone(),
        )
    };
    let (history_a, smoothed_a) = run(true);
    let (history_b, smoothed_b) = run(true);
    let (history_c, smoothed_c) = run(false);
    assert_eq!(history_a, history_b);
    assert_eq!(smoothed_a, smoothed_b);
    assert_eq!(history_a, history_c);
    assert_eq!(smoothed_a, smoothed_c);
}

#[test]
fn test_filter_and_smoother_free_functions() {
    let (model, ys) = random_walk_dataset(10, 5);
    let mut rng = StdRng::seed_from_u64(6);
    let output = run_filter(&FilterConfig::with_particles(50), &ys, None, &model, &mut rng).unwrap();
    output.history.validate().unwrap();
    let smoothed = run_smoother(
        &output.history,
        &SmootherConfig::with_trajectories(12),
        None,
        &model,
        &mut rng,
    )
    .unwrap();
    assert_eq!(smoothed.len(), 11);
    assert_eq!(smoothed.step(4).shape(), (1, 12));
}

#[test]
fn test_multinomial_resampling_is_unbiased() {
    let mut rng = StdRng::seed_from_u64(17);
    let uniform = vec![0.1; 10];
    let mut draws = Vec::new();
    for _ in 0..20 {
        draws.extend(multinomial_resample(&uniform, 5000, &mut rng));
    }
    // 9 degrees of freedom, p = 0.001 critical value is 27.88
    let statistic = chi_square(&counts(&draws, 10), &uniform);
    assert!(statistic < 27.88, "chi-square {statistic}");

    let skewed = [0.1, 0.2, 0.3, 0.4];
    let draws = multinomial_resample(&skewed, 100_000, &mut rng);
    // 3 degrees of freedom, p = 0.001 critical value is 16.27
    let statistic = chi_square(&counts(&draws, 4), &skewed);
    assert!(statistic < 16.27, "chi-square {statistic}");
}

#[test]
fn test_low_variance_resampling_offspring_counts() {
    let weights = [0.05, 0.15, 0.3, 0.5];
    let n = 37;
    let mut rng = StdRng::seed_from_u64(23);
    for _ in 0..200 {
        let systematic = counts(&systematic_resample(&weights, n, &mut rng), 4);
        let stratified = counts(&stratified_resample(&weights, n, &mut rng), 4);
        let residual = counts(&residual_resample(&weights, n, &mut rng), 4);
        assert_eq!(systematic.iter().sum::<usize>(), n);
        assert_eq!(stratified.iter().sum::<usize>(), n);
        assert_eq!(residual.iter().sum::<usize>(), n);
        for (i, w) in weights.iter().enumerate() {
            let expected = w * n as f64;
            let c = systematic[i] as f64;
            assert!(c == expected.floor() || c == expected.ceil());
            assert!((stratified[i] as f64 - expected).abs() < 2.0);
            assert!(residual[i] as f64 >= expected.floor());
        }
    }
}

#[test]
fn test_degenerate_step_is_reported() {
    let (inner, ys) = random_walk_dataset(6, 9);
    let model = BlindAt { inner, step: 3 };
    let mut rng = StdRng::seed_from_u64(0);
    let err = run_filter(&FilterConfig::with_particles(20), &ys, None, &model, &mut rng).unwrap_err();
    assert_eq!(err, SmcError::DegenerateWeights { step: 3 });
    assert!(err.is_degenerate());

    let config = FilterConfig {
        degeneracy_policy: DegeneracyPolicy::UniformFallback,
        ..FilterConfig::with_particles(20)
    };
    let output = run_filter(&config, &ys, None, &model, &mut rng).unwrap();
    assert_eq!(output.diagnostics.fallback_steps, vec![3]);
    assert_eq!(output.diagnostics.log_likelihood, f64::NEG_INFINITY);
    assert_eq!(output.history.len(), 7);
    output.history.validate().unwrap();
}

#[test]
fn test_no_measurements() {
    let model = LinearGaussianModel::random_walk(1.0, 1.0, 1.0);
    let mut sim = Simulator::new(model, Vec::new(), None).unwrap();
    sim.simulate(10, 4, &mut StdRng::seed_from_u64(31)).unwrap();
    assert_eq!(sim.get_filtered_estimates().unwrap().len(), 1);
    let history = sim.history().unwrap();
    assert_eq!(history.len(), 1);
    assert!(history.ancestors(0).is_none());
    let smoothed = sim.get_smoothed_estimates().unwrap();
    assert_eq!(smoothed.len(), 1);
    // Each smoothed state at step 0 is one of the initial particles.
    for value in smoothed.step(0).iter() {
        assert!(history.particles(0).iter().any(|p| p == value));
    }
}

#[test]
fn test_single_particle_and_single_trajectory() {
    let (model, ys) = random_walk_dataset(8, 13);
    let mut sim = Simulator::new(model, ys, None).unwrap();
    sim.simulate(1, 1, &mut StdRng::seed_from_u64(2)).unwrap();
    let history = sim.history().unwrap();
    for t in 0..history.len() {
        assert_eq!(history.log_weights(t)[0], 0.0);
        if t > 0 {
            assert_eq!(history.ancestors(t), Some(&[0usize][..]));
        }
    }
    // With one particle the only trajectory is its lineage.
    let smoothed = sim.get_smoothed_estimates().unwrap();
    assert_eq!(smoothed.trajectory(0), history.ancestral_path(0).unwrap());
}

#[test]
fn test_inputs_drive_the_dynamics() {
    let model = LinearGaussianModel::random_walk(0.01, 0.01, 0.01)
        .with_control(DMatrix::from_element(1, 1, 1.0))
        .unwrap();
    let inputs = vec![DVector::from_element(1, 1.0); 10];
    let mut rng = StdRng::seed_from_u64(77);
    let (truth, ys) = generate_dataset(
        &model,
        10,
        &DVector::from_element(1, 0.0),
        Some(inputs.as_slice()),
        &mut rng,
    )
    .unwrap();
    let mut sim = Simulator::new(model, ys, Some(inputs)).unwrap();
    sim.simulate(200, 50, &mut rng).unwrap();
    let filtered = sim.get_filtered_estimates().unwrap();
    let smoothed = sim.get_smoothed_mean().unwrap();
    assert!((filtered.mean(10)[0] - truth[(0, 10)]).abs() < 0.5);
    assert!((smoothed[5][0] - truth[(0, 5)]).abs() < 0.5);
}
