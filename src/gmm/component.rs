//! Single Gaussian mixture component with cached derived values.

use crate::error::{HablarError, Result};
use crate::primitives::{Matrix, Vector};
use serde::{Deserialize, Serialize};

/// Smallest variance any covariance diagonal entry may take.
///
/// Flooring happens inside [`GaussianComponent::set_covariance`], so
/// downstream density evaluation never sees an ill-conditioned diagonal.
pub const MIN_VARIANCE: f64 = 1e-5;

/// Covariance matrix shape for a Gaussian component.
///
/// The shape is an explicit tag rather than being inferred from the stored
/// matrix dimensions, so a 1x1 full covariance and a 1-dimensional diagonal
/// covariance can never be confused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CovarianceKind {
    /// Per-dimension variance vector, zero off-diagonal entries.
    Diagonal,
    /// Full covariance matrix.
    Full,
}

/// One multivariate Gaussian: mean, covariance, and cached derived values
/// (inverse, determinant, normalizing constants).
///
/// The covariance is only ever replaced through [`set_covariance`], which
/// atomically recomputes every cached value. Diagonal covariances store a
/// 1 x d matrix of variances; full covariances store d x d.
///
/// [`set_covariance`]: GaussianComponent::set_covariance
///
/// # Examples
///
/// ```
/// use hablar::gmm::GaussianComponent;
/// use hablar::primitives::Vector;
///
/// let c = GaussianComponent::diagonal(
///     Vector::from_slice(&[0.0, 0.0]),
///     Vector::from_slice(&[1.0, 1.0]),
/// ).unwrap();
///
/// let at_mean = c.probability(&[0.0, 0.0]).unwrap();
/// let away = c.probability(&[3.0, 3.0]).unwrap();
/// assert!(at_mean > away);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianComponent {
    mean: Vector<f64>,
    covariance: Matrix<f64>,
    kind: CovarianceKind,
    inverse: Option<Matrix<f64>>,
    determinant: f64,
    constant: f64,
    log_constant: f64,
}

impl GaussianComponent {
    /// Creates a component from a mean and a covariance matrix.
    ///
    /// For [`CovarianceKind::Diagonal`] the covariance must be 1 x d; for
    /// [`CovarianceKind::Full`] it must be d x d.
    ///
    /// # Errors
    ///
    /// Returns an error on a zero feature dimension, a mean/covariance shape
    /// mismatch, or a singular full covariance.
    pub fn new(mean: Vector<f64>, covariance: Matrix<f64>, kind: CovarianceKind) -> Result<Self> {
        if mean.is_empty() {
            return Err(HablarError::DimensionMismatch {
                expected: "non-empty mean vector".to_string(),
                actual: "0 dimensions".to_string(),
            });
        }
        let mut component = Self {
            mean,
            covariance: Matrix::zeros(0, 0),
            kind,
            inverse: None,
            determinant: 0.0,
            constant: 0.0,
            log_constant: 0.0,
        };
        component.set_covariance(covariance)?;
        Ok(component)
    }

    /// Creates a diagonal-covariance component from a variance vector.
    ///
    /// # Errors
    ///
    /// Returns an error on empty or mismatched dimensions.
    pub fn diagonal(mean: Vector<f64>, variances: Vector<f64>) -> Result<Self> {
        let d = variances.len();
        let covariance = Matrix::from_vec(1, d, variances.as_slice().to_vec())?;
        Self::new(mean, covariance, CovarianceKind::Diagonal)
    }

    /// Creates a full-covariance component.
    ///
    /// # Errors
    ///
    /// Returns an error on mismatched dimensions or a singular covariance.
    pub fn full(mean: Vector<f64>, covariance: Matrix<f64>) -> Result<Self> {
        Self::new(mean, covariance, CovarianceKind::Full)
    }

    /// Replaces the covariance and recomputes the cached inverse,
    /// determinant, and normalizing constants as one unit.
    ///
    /// Diagonal entries are floored at [`MIN_VARIANCE`] before any derived
    /// value is computed. On error the component is left unchanged.
    ///
    /// # Errors
    ///
    /// Returns an error on a covariance shape mismatch or a singular full
    /// covariance.
    pub fn set_covariance(&mut self, covariance: Matrix<f64>) -> Result<()> {
        let d = self.mean.len();
        let expected = match self.kind {
            CovarianceKind::Diagonal => (1, d),
            CovarianceKind::Full => (d, d),
        };
        if covariance.shape() != expected {
            return Err(HablarError::DimensionMismatch {
                expected: format!("{}x{} covariance", expected.0, expected.1),
                actual: format!("{}x{}", covariance.shape().0, covariance.shape().1),
            });
        }

        let mut floored = covariance;
        match self.kind {
            CovarianceKind::Diagonal => {
                for j in 0..d {
                    let v = floored.get(0, j);
                    floored.set(0, j, v.max(MIN_VARIANCE));
                }
            }
            CovarianceKind::Full => {
                for j in 0..d {
                    let v = floored.get(j, j);
                    floored.set(j, j, v.max(MIN_VARIANCE));
                }
            }
        }

        let (inverse, determinant, log_determinant) = match self.kind {
            CovarianceKind::Diagonal => {
                let mut det = 1.0;
                let mut log_det = 0.0;
                for j in 0..d {
                    let v = floored.get(0, j);
                    det *= v;
                    log_det += v.ln();
                }
                (None, det, log_det)
            }
            CovarianceKind::Full => {
                let (inv, det) = floored.inverse()?;
                if det <= 0.0 || !det.is_finite() {
                    return Err(HablarError::SingularMatrix { det });
                }
                (Some(inv), det, det.ln())
            }
        };

        let log_constant =
            -0.5 * (d as f64 * (2.0 * std::f64::consts::PI).ln() + log_determinant);

        self.covariance = floored;
        self.inverse = inverse;
        self.determinant = determinant;
        self.log_constant = log_constant;
        self.constant = log_constant.exp();
        Ok(())
    }

    /// Replaces the mean vector.
    ///
    /// # Errors
    ///
    /// Returns an error if the new mean changes the feature dimension.
    pub fn set_mean(&mut self, mean: Vector<f64>) -> Result<()> {
        if mean.len() != self.mean.len() {
            return Err(HablarError::dimension_mismatch(
                "mean dimension",
                self.mean.len(),
                mean.len(),
            ));
        }
        self.mean = mean;
        Ok(())
    }

    /// Evaluates the Gaussian density N(x; mean, covariance) at `x`.
    ///
    /// The diagonal case is O(d); the full case uses the cached inverse and
    /// is O(d^2). The result is always non-negative.
    ///
    /// # Errors
    ///
    /// Returns an error if `x` is empty or its dimension doesn't match the
    /// component's.
    pub fn probability(&self, x: &[f64]) -> Result<f64> {
        if x.is_empty() {
            return Err(HablarError::DimensionMismatch {
                expected: format!("{}-dimensional vector", self.mean.len()),
                actual: "empty vector".to_string(),
            });
        }
        if x.len() != self.mean.len() {
            return Err(HablarError::dimension_mismatch(
                "feature dimension",
                self.mean.len(),
                x.len(),
            ));
        }
        Ok(self.density(x))
    }

    /// Density evaluation without dimension checks; callers validate once
    /// before entering hot loops.
    pub(crate) fn density(&self, x: &[f64]) -> f64 {
        debug_assert_eq!(x.len(), self.mean.len());
        let mean = self.mean.as_slice();
        let mahalanobis = match self.kind {
            CovarianceKind::Diagonal => {
                let variances = self.covariance.row_slice(0);
                let mut sum = 0.0;
                for j in 0..x.len() {
                    let diff = x[j] - mean[j];
                    sum += diff * diff / variances[j];
                }
                sum
            }
            CovarianceKind::Full => {
                let inv = self
                    .inverse
                    .as_ref()
                    .expect("full covariance always caches its inverse");
                let d = x.len();
                let mut diff = vec![0.0; d];
                for j in 0..d {
                    diff[j] = x[j] - mean[j];
                }
                let mut sum = 0.0;
                for i in 0..d {
                    let mut row_dot = 0.0;
                    let inv_row = inv.row_slice(i);
                    for j in 0..d {
                        row_dot += inv_row[j] * diff[j];
                    }
                    sum += diff[i] * row_dot;
                }
                sum
            }
        };
        (self.log_constant - 0.5 * mahalanobis).exp()
    }

    /// Feature dimension.
    #[must_use]
    pub fn dimension(&self) -> usize {
        self.mean.len()
    }

    /// The mean vector.
    #[must_use]
    pub fn mean(&self) -> &Vector<f64> {
        &self.mean
    }

    /// The raw covariance (1 x d variances for diagonal, d x d for full).
    #[must_use]
    pub fn covariance(&self) -> &Matrix<f64> {
        &self.covariance
    }

    /// The covariance shape tag.
    #[must_use]
    pub fn kind(&self) -> CovarianceKind {
        self.kind
    }

    /// Cached covariance determinant.
    #[must_use]
    pub fn determinant(&self) -> f64 {
        self.determinant
    }

    /// Cached linear normalizing constant 1 / ((2 pi)^(d/2) |cov|^(1/2)).
    #[must_use]
    pub fn constant(&self) -> f64 {
        self.constant
    }

    /// Cached log of the normalizing constant.
    #[must_use]
    pub fn log_constant(&self) -> f64 {
        self.log_constant
    }
}
