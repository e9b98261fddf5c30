//! Linear algebra and Gaussian helpers shared by the models and the engine.
//!
//! Public API:
//!     pub fn matrix_square_root(matrix: &DMatrix<f64>) -> DMatrix<f64>
//!     pub fn robust_spd_solve(a: &DMatrix<f64>, b: &DMatrix<f64>) -> Option<DMatrix<f64>>
//!     pub fn log_sum_exp(values: &[f64]) -> f64
//!     pub struct GaussianDensity
//!
//! Square-root strategy:
//! 1) Symmetrize P ← 0.5 (P + Pᵀ)
//! 2) Cholesky
//! 3) Jittered Cholesky (geometric ramp)
//! 4) Symmetric EVD with eigenvalue floor → S = U * sqrt(Λ⁺) * Uᵀ

use nalgebra::linalg::{Cholesky, SymmetricEigen};
use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand_distr::StandardNormal;

const LN_2PI: f64 = 1.837_877_066_409_345_5;

const INITIAL_JITTER: f64 = 1e-12;
const MAX_JITTER: f64 = 1e-6;
const MAX_TRIES: usize = 6;
const EIGEN_FLOOR: f64 = 1e-12;

/// Compute a robust square root `S` such that approximately `matrix ≈ S * Sᵀ`.
///
/// Attempts Cholesky decomposition first (yielding lower triangular L). If that fails
/// even after a small diagonal jitter, falls back to a symmetric eigen decomposition with
/// negative eigenvalues floored, which handles positive semi-definite input such as a zero
/// process noise covariance.
///
/// # Panics
/// If `matrix` is not square.
pub fn matrix_square_root(matrix: &DMatrix<f64>) -> DMatrix<f64> {
    assert!(
        matrix.is_square(),
        "matrix_square_root: matrix must be square"
    );
    let p = symmetrize(matrix);
    if let Some(s) = chol_sqrt(&p) {
        return s;
    }
    if let Some(s) = chol_sqrt_with_jitter(&p, INITIAL_JITTER, MAX_JITTER, MAX_TRIES) {
        return s;
    }
    evd_symmetric_sqrt_with_floor(&p, EIGEN_FLOOR)
}

/// Symmetrize a matrix: P ← 0.5 (P + Pᵀ)
#[inline]
pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64> {
    0.5 * (m + m.transpose())
}

fn chol_sqrt(p: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    Cholesky::new(p.clone()).map(|ch| ch.l().into_owned())
}

/// Cholesky with diagonal jitter (geometric ramp). Returns None if all tries fail.
fn chol_sqrt_with_jitter(
    p: &DMatrix<f64>,
    initial_jitter: f64,
    max_jitter: f64,
    max_tries: usize,
) -> Option<DMatrix<f64>> {
    jittered_cholesky(p, initial_jitter, max_jitter, max_tries).map(|ch| ch.l().into_owned())
}

fn jittered_cholesky(
    p: &DMatrix<f64>,
    initial_jitter: f64,
    max_jitter: f64,
    max_tries: usize,
) -> Option<Cholesky<f64, nalgebra::Dyn>> {
    let n = p.nrows();
    let mut jitter = initial_jitter;
    for _ in 0..max_tries {
        let mut pj = p.clone();
        for i in 0..n {
            pj[(i, i)] += jitter;
        }
        if let Some(ch) = Cholesky::new(pj) {
            return Some(ch);
        }
        jitter *= 10.0;
        if jitter > max_jitter {
            break;
        }
    }
    None
}

/// S = U * sqrt(max(λ, floor)) * Uᵀ
fn evd_symmetric_sqrt_with_floor(p: &DMatrix<f64>, floor: f64) -> DMatrix<f64> {
    let se = SymmetricEigen::new(p.clone());
    let lambdas = se.eigenvalues.map(|l| l.max(floor).sqrt());
    let u = se.eigenvectors;
    &u * DMatrix::<f64>::from_diagonal(&lambdas) * u.transpose()
}

/// Solve A X = B for SPD-ish A via Cholesky with jitter retries, falling back to an
/// explicit inverse. Returns None if A is singular.
pub fn robust_spd_solve(a: &DMatrix<f64>, b: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    assert!(a.is_square(), "robust_spd_solve: A must be square");
    assert_eq!(a.nrows(), b.nrows(), "robust_spd_solve: A and B incompatible");
    let a_sym = symmetrize(a);
    if let Some(ch) = Cholesky::new(a_sym.clone()) {
        return Some(ch.solve(b));
    }
    if let Some(ch) = jittered_cholesky(&a_sym, INITIAL_JITTER, MAX_JITTER, MAX_TRIES) {
        return Some(ch.solve(b));
    }
    a_sym.try_inverse().map(|inv| inv * b)
}

/// Numerically stable `ln Σ exp(v_i)`.
///
/// Returns `-inf` for an empty slice or when every value is `-inf`, and NaN if any value
/// is NaN.
pub fn log_sum_exp(values: &[f64]) -> f64 {
    if values.iter().any(|v| v.is_nan()) {
        return f64::NAN;
    }
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    if max == f64::INFINITY {
        return f64::INFINITY;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

/// Zero-mean multivariate Gaussian with a pre-factored covariance.
///
/// Factoring once and evaluating many residuals is what the particle models need: the
/// measurement likelihood and transition density are evaluated N (or M·N) times per step
/// against the same covariance.
#[derive(Clone, Debug)]
pub struct GaussianDensity {
    covariance: DMatrix<f64>,
    /// Lower triangular factor, `covariance ≈ L Lᵀ`.
    sqrt_covariance: DMatrix<f64>,
    /// `-0.5 (d ln 2π + ln |Σ|)`, or `None` when Σ is singular (density undefined).
    log_normalizer: Option<f64>,
}

impl GaussianDensity {
    /// Factor `covariance`. Singular covariances are accepted for sampling; their
    /// density evaluates to `-inf` everywhere.
    ///
    /// # Panics
    /// If `covariance` is not square.
    pub fn new(covariance: DMatrix<f64>) -> Self {
        assert!(
            covariance.is_square(),
            "GaussianDensity: covariance must be square"
        );
        let p = symmetrize(&covariance);
        let dim = p.nrows() as f64;
        let (sqrt_covariance, log_normalizer) = match Cholesky::new(p.clone()) {
            Some(ch) => {
                let l = ch.l().into_owned();
                let log_det: f64 = 2.0 * l.diagonal().iter().map(|d| d.ln()).sum::<f64>();
                (l, Some(-0.5 * (dim * LN_2PI + log_det)))
            }
            None => (matrix_square_root(&p), None),
        };
        GaussianDensity {
            covariance: p,
            sqrt_covariance,
            log_normalizer,
        }
    }
    /// Dimension of the distribution.
    pub fn dimension(&self) -> usize {
        self.covariance.nrows()
    }
    /// The (symmetrized) covariance.
    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.covariance
    }
    /// Square-root factor used for sampling.
    pub fn sqrt_covariance(&self) -> &DMatrix<f64> {
        &self.sqrt_covariance
    }
    /// Log-density of a residual (value minus mean).
    pub fn log_density(&self, residual: &DVector<f64>) -> f64 {
        let Some(log_normalizer) = self.log_normalizer else {
            return f64::NEG_INFINITY;
        };
        if residual.iter().any(|v| v.is_nan()) {
            return f64::NAN;
        }
        if residual.iter().any(|v| v.is_infinite()) {
            return f64::NEG_INFINITY;
        }
        let z = match self.sqrt_covariance.solve_lower_triangular(residual) {
            Some(z) => z,
            None => return f64::NEG_INFINITY,
        };
        let mahalanobis = z.norm_squared();
        if !mahalanobis.is_finite() {
            return f64::NEG_INFINITY;
        }
        log_normalizer - 0.5 * mahalanobis
    }
    /// Draw `n` zero-mean samples as the columns of a `dim × n` matrix.
    pub fn sample<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> DMatrix<f64> {
        let standard = standard_normal_matrix(self.dimension(), n, rng);
        &self.sqrt_covariance * standard
    }
}

/// Column-major standard normal draws; column `j` is filled before column `j + 1`.
fn standard_normal_matrix<R: Rng + ?Sized>(rows: usize, cols: usize, rng: &mut R) -> DMatrix<f64> {
    DMatrix::from_fn(rows, cols, |_, _| rng.sample::<f64, _>(StandardNormal))
}

/* =============================== Tests ==================================== */
