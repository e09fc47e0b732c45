//! Gaussian Mixture Model: a weighted sum of multivariate Gaussians.
//!
//! A [`Gmm`] is produced by [`crate::trainer::GmmTrainer`] (or assembled from
//! a finished k-means clustering) and is immutable afterwards, exposing
//! density evaluation and serialization only.

mod component;

pub use component::{CovarianceKind, GaussianComponent, MIN_VARIANCE};

use crate::error::{HablarError, Result};
use crate::kmeans::Cluster;
use crate::primitives::Matrix;

/// Maximum tolerated deviation of the mixture weight sum from 1.0.
pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

/// Gaussian Mixture Model over fixed-dimension feature vectors.
///
/// Invariants:
/// - all components share one feature dimension and one covariance shape,
/// - the weight vector matches the component count and sums to 1.0 within
///   [`WEIGHT_SUM_TOLERANCE`].
///
/// # Examples
///
/// ```
/// use hablar::gmm::{GaussianComponent, Gmm};
/// use hablar::primitives::Vector;
///
/// let components = vec![
///     GaussianComponent::diagonal(Vector::from_slice(&[0.0]), Vector::ones(1)).unwrap(),
///     GaussianComponent::diagonal(Vector::from_slice(&[10.0]), Vector::ones(1)).unwrap(),
/// ];
/// let gmm = Gmm::new(components, vec![0.5, 0.5]).unwrap();
///
/// let near_first = gmm.component_probabilities(&[0.1]).unwrap();
/// assert!(near_first[0] > 0.99);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Gmm {
    components: Vec<GaussianComponent>,
    weights: Vec<f64>,
    kind: CovarianceKind,
    dimension: usize,
}

impl Gmm {
    /// Creates a GMM from components and weights.
    ///
    /// # Errors
    ///
    /// Returns an error if the mixture is empty, weights don't match the
    /// component count or don't sum to 1.0, or components disagree on
    /// dimension or covariance shape.
    pub fn new(components: Vec<GaussianComponent>, weights: Vec<f64>) -> Result<Self> {
        if components.is_empty() {
            return Err(HablarError::InvalidHyperparameter {
                param: "components".to_string(),
                value: "0".to_string(),
                constraint: "at least one mixture component".to_string(),
            });
        }
        if weights.len() != components.len() {
            return Err(HablarError::dimension_mismatch(
                "weight count",
                components.len(),
                weights.len(),
            ));
        }
        let weight_sum: f64 = weights.iter().sum();
        if (weight_sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(HablarError::InvalidHyperparameter {
                param: "weights".to_string(),
                value: format!("sum = {weight_sum}"),
                constraint: "sum to 1.0".to_string(),
            });
        }
        let dimension = components[0].dimension();
        let kind = components[0].kind();
        for (k, c) in components.iter().enumerate() {
            if c.dimension() != dimension {
                return Err(HablarError::DimensionMismatch {
                    expected: format!("all components {dimension}-dimensional"),
                    actual: format!("component {k} is {}-dimensional", c.dimension()),
                });
            }
            if c.kind() != kind {
                return Err(HablarError::DimensionMismatch {
                    expected: format!("all components {kind:?}"),
                    actual: format!("component {k} is {:?}", c.kind()),
                });
            }
        }
        Ok(Self {
            components,
            weights,
            kind,
            dimension,
        })
    }

    /// Builds an initial GMM from a finished k-means clustering: cluster
    /// means and diagonal covariances become component parameters, with
    /// uniform weights.
    ///
    /// For [`CovarianceKind::Full`], cluster variances populate the diagonal
    /// of a full covariance matrix.
    ///
    /// # Errors
    ///
    /// Returns an error if `clusters` is empty or inconsistent.
    pub fn from_clusters(clusters: &[Cluster], kind: CovarianceKind) -> Result<Self> {
        if clusters.is_empty() {
            return Err(HablarError::InvalidHyperparameter {
                param: "clusters".to_string(),
                value: "0".to_string(),
                constraint: "at least one cluster".to_string(),
            });
        }
        let k = clusters.len();
        let mut components = Vec::with_capacity(k);
        for cluster in clusters {
            let component = match kind {
                CovarianceKind::Diagonal => {
                    GaussianComponent::diagonal(cluster.mean.clone(), cluster.variances.clone())?
                }
                CovarianceKind::Full => {
                    let d = cluster.mean.len();
                    let mut cov = Matrix::zeros(d, d);
                    for j in 0..d {
                        cov.set(j, j, cluster.variances.get(j));
                    }
                    GaussianComponent::full(cluster.mean.clone(), cov)?
                }
            };
            components.push(component);
        }
        Self::new(components, vec![1.0 / k as f64; k])
    }

    /// Evaluates the mixture density: sum of weight_k * N(x; mean_k, cov_k).
    ///
    /// # Errors
    ///
    /// Returns an error if `x` is empty or its dimension doesn't match.
    pub fn probability(&self, x: &[f64]) -> Result<f64> {
        self.check_input(x)?;
        Ok(self.density(x))
    }

    /// Normalized responsibility vector: P(component k | x) for every k.
    ///
    /// When the total mixture density underflows to zero the responsibilities
    /// are uniform, so inference-time callers always receive a valid
    /// distribution.
    ///
    /// # Errors
    ///
    /// Returns an error if `x` is empty or its dimension doesn't match.
    pub fn component_probabilities(&self, x: &[f64]) -> Result<Vec<f64>> {
        self.check_input(x)?;
        let k = self.components.len();
        let mut probs = vec![0.0; k];
        let mut total = 0.0;
        for (i, c) in self.components.iter().enumerate() {
            probs[i] = self.weights[i] * c.density(x);
            total += probs[i];
        }
        if total > 0.0 {
            for p in &mut probs {
                *p /= total;
            }
        } else {
            probs.fill(1.0 / k as f64);
        }
        Ok(probs)
    }

    /// Unchecked mixture density for hot loops.
    pub(crate) fn density(&self, x: &[f64]) -> f64 {
        self.components
            .iter()
            .zip(self.weights.iter())
            .map(|(c, w)| w * c.density(x))
            .sum()
    }

    fn check_input(&self, x: &[f64]) -> Result<()> {
        if x.is_empty() {
            return Err(HablarError::DimensionMismatch {
                expected: format!("{}-dimensional vector", self.dimension),
                actual: "empty vector".to_string(),
            });
        }
        if x.len() != self.dimension {
            return Err(HablarError::dimension_mismatch(
                "feature dimension",
                self.dimension,
                x.len(),
            ));
        }
        Ok(())
    }

    /// Number of mixture components.
    #[must_use]
    pub fn n_components(&self) -> usize {
        self.components.len()
    }

    /// Feature dimension.
    #[must_use]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Covariance shape shared by all components.
    #[must_use]
    pub fn kind(&self) -> CovarianceKind {
        self.kind
    }

    /// The mixture components.
    #[must_use]
    pub fn components(&self) -> &[GaussianComponent] {
        &self.components
    }

    /// Component `k`.
    ///
    /// # Panics
    ///
    /// Panics if `k` is out of bounds.
    #[must_use]
    pub fn component(&self, k: usize) -> &GaussianComponent {
        &self.components[k]
    }

    /// The mixture weights.
    #[must_use]
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Mutable component access for the EM engine.
    pub(crate) fn components_mut(&mut self) -> &mut [GaussianComponent] {
        &mut self.components
    }

    /// Weight update path for the EM engine.
    pub(crate) fn set_weight(&mut self, k: usize, weight: f64) {
        self.weights[k] = weight;
    }
}
