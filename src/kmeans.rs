//! K-means clustering used to initialize GMM training.
//!
//! Seeds the first center at the dataset mean and every later center at the
//! unassigned point with the largest *average* normalized distance to the
//! centers chosen so far, favoring spread-out coverage. Distances can be
//! normalized by a per-dimension global-variance vector so high-magnitude
//! dimensions don't dominate.

use crate::error::{HablarError, Result};
use crate::gmm::MIN_VARIANCE;
use crate::primitives::{Matrix, Vector};
use crate::traits::UnsupervisedEstimator;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Iterations stop once fewer than this percentage of points change cluster.
const MIN_ASSIGNMENT_CHANGE_PERCENT: f64 = 0.1;

/// Reseeded centers are perturbed by at most this fraction per dimension.
const RESEED_PERTURBATION: f64 = 0.01;

/// K-means configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KMeansParams {
    /// Number of clusters to produce.
    pub n_clusters: usize,
    /// Maximum assignment/update passes.
    pub max_iterations: usize,
    /// Clusters holding fewer than this percentage of all samples are
    /// reseeded near the largest cluster instead of being averaged.
    pub min_cluster_percent: f64,
}

impl Default for KMeansParams {
    fn default() -> Self {
        Self {
            n_clusters: 8,
            max_iterations: 200,
            min_cluster_percent: 0.1,
        }
    }
}

/// One cluster: mean, diagonal covariance, and member count.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    /// Cluster center.
    pub mean: Vector<f64>,
    /// Per-dimension variances (floored at [`MIN_VARIANCE`]).
    pub variances: Vector<f64>,
    /// Number of assigned samples.
    pub count: usize,
}

/// K-means clusterer with farthest-average-point seeding.
///
/// # Examples
///
/// ```
/// use hablar::kmeans::{KMeansClusterer, KMeansParams};
/// use hablar::primitives::Matrix;
/// use hablar::traits::UnsupervisedEstimator;
///
/// let data = Matrix::from_vec(6, 1, vec![0.0, 0.1, 0.2, 10.0, 10.1, 10.2]).unwrap();
/// let mut km = KMeansClusterer::new(KMeansParams {
///     n_clusters: 2,
///     ..KMeansParams::default()
/// });
/// km.fit(&data).unwrap();
/// assert_eq!(km.clusters().len(), 2);
/// ```
#[derive(Debug)]
pub struct KMeansClusterer {
    params: KMeansParams,
    global_variances: Option<Vector<f64>>,
    random_state: Option<u64>,
    clusters: Option<Vec<Cluster>>,
    labels: Option<Vec<usize>>,
    n_iter: usize,
}

impl KMeansClusterer {
    /// Creates a clusterer with the given configuration.
    #[must_use]
    pub fn new(params: KMeansParams) -> Self {
        Self {
            params,
            global_variances: None,
            random_state: None,
            clusters: None,
            labels: None,
            n_iter: 0,
        }
    }

    /// Sets a per-dimension global-variance vector; distances become
    /// normalized Euclidean.
    #[must_use]
    pub fn with_global_variances(mut self, variances: Vector<f64>) -> Self {
        self.global_variances = Some(variances);
        self
    }

    /// Sets the seed driving the tiny-cluster reseeding perturbation.
    #[must_use]
    pub fn with_random_state(mut self, seed: u64) -> Self {
        self.random_state = Some(seed);
        self
    }

    /// The final clusters.
    ///
    /// # Panics
    ///
    /// Panics if the model is not fitted.
    #[must_use]
    pub fn clusters(&self) -> &[Cluster] {
        self.clusters
            .as_ref()
            .expect("Model not fitted. Call fit() first.")
    }

    /// Per-sample cluster assignments for the training data.
    ///
    /// # Panics
    ///
    /// Panics if the model is not fitted.
    #[must_use]
    pub fn labels(&self) -> &[usize] {
        self.labels
            .as_ref()
            .expect("Model not fitted. Call fit() first.")
    }

    /// Number of passes run.
    #[must_use]
    pub fn n_iter(&self) -> usize {
        self.n_iter
    }

    /// Returns true if the model has been fitted.
    #[must_use]
    pub fn is_fitted(&self) -> bool {
        self.clusters.is_some()
    }

    fn validate(&self, x: &Matrix<f64>) -> Result<()> {
        let (n, d) = x.shape();
        if n == 0 || d == 0 {
            return Err(HablarError::DimensionMismatch {
                expected: "non-empty dataset".to_string(),
                actual: format!("{n}x{d}"),
            });
        }
        if self.params.n_clusters == 0 {
            return Err(HablarError::InvalidHyperparameter {
                param: "n_clusters".to_string(),
                value: "0".to_string(),
                constraint: ">0".to_string(),
            });
        }
        if self.params.n_clusters > n {
            return Err(HablarError::InvalidHyperparameter {
                param: "n_clusters".to_string(),
                value: self.params.n_clusters.to_string(),
                constraint: format!("<= number of samples ({n})"),
            });
        }
        if let Some(gv) = &self.global_variances {
            if gv.len() != d {
                return Err(HablarError::dimension_mismatch(
                    "global variance dimension",
                    d,
                    gv.len(),
                ));
            }
        }
        Ok(())
    }

    /// Seed centers: the dataset mean first, then repeatedly the point with
    /// the largest average normalized distance to all chosen centers.
    fn seed_centers(&self, x: &Matrix<f64>, inv_var: &[f64]) -> Vec<Vec<f64>> {
        let (n, d) = x.shape();
        let k = self.params.n_clusters;

        let mut mean = vec![0.0; d];
        for i in 0..n {
            let row = x.row_slice(i);
            for j in 0..d {
                mean[j] += row[j];
            }
        }
        for m in &mut mean {
            *m /= n as f64;
        }

        let mut centers = Vec::with_capacity(k);
        centers.push(mean);
        let mut taken = vec![false; n];

        for _ in 1..k {
            let mut best_idx = 0;
            let mut best_avg = -1.0;
            for i in 0..n {
                if taken[i] {
                    continue;
                }
                let row = x.row_slice(i);
                let total: f64 = centers
                    .iter()
                    .map(|c| normalized_distance_sq(row, c, inv_var).sqrt())
                    .sum();
                let avg = total / centers.len() as f64;
                if avg > best_avg {
                    best_avg = avg;
                    best_idx = i;
                }
            }
            taken[best_idx] = true;
            centers.push(x.row_slice(best_idx).to_vec());
        }

        centers
    }

    fn assign(
        x: &Matrix<f64>,
        centers: &[Vec<f64>],
        inv_var: &[f64],
        labels: &mut [usize],
    ) -> usize {
        let n = x.n_rows();
        let mut changed = 0;
        for i in 0..n {
            let row = x.row_slice(i);
            let mut best = 0;
            let mut best_dist = f64::INFINITY;
            for (c, center) in centers.iter().enumerate() {
                let dist = normalized_distance_sq(row, center, inv_var);
                if dist < best_dist {
                    best_dist = dist;
                    best = c;
                }
            }
            if labels[i] != best {
                changed += 1;
                labels[i] = best;
            }
        }
        changed
    }
}

impl UnsupervisedEstimator for KMeansClusterer {
    type Labels = Vec<usize>;

    /// Partitions the dataset into `n_clusters` clusters.
    ///
    /// # Errors
    ///
    /// Returns an error if the dataset is empty, `n_clusters` is zero or
    /// exceeds the sample count, or a supplied global-variance vector has
    /// the wrong dimension.
    fn fit(&mut self, x: &Matrix<f64>) -> Result<()> {
        self.validate(x)?;
        let (n, d) = x.shape();
        let k = self.params.n_clusters;

        let inv_var: Vec<f64> = match &self.global_variances {
            Some(gv) => gv.iter().map(|v| 1.0 / v.max(MIN_VARIANCE)).collect(),
            None => vec![1.0; d],
        };

        let mut rng = match self.random_state {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let mut centers = self.seed_centers(x, &inv_var);
        let mut labels = vec![usize::MAX; n];
        let min_count = (self.params.min_cluster_percent / 100.0 * n as f64).ceil() as usize;

        self.n_iter = 0;
        for iter in 0..self.params.max_iterations {
            let changed = Self::assign(x, &centers, &inv_var, &mut labels);
            self.n_iter = iter + 1;

            // Recompute centers as member means; reseed tiny clusters near
            // the largest cluster's center with a small perturbation.
            let mut counts = vec![0usize; k];
            let mut sums = vec![vec![0.0; d]; k];
            for i in 0..n {
                let c = labels[i];
                counts[c] += 1;
                let row = x.row_slice(i);
                for j in 0..d {
                    sums[c][j] += row[j];
                }
            }
            let largest = counts
                .iter()
                .enumerate()
                .max_by_key(|(_, &count)| count)
                .map(|(c, _)| c)
                .unwrap_or(0);

            for c in 0..k {
                if counts[c] >= min_count.max(1) {
                    for j in 0..d {
                        centers[c][j] = sums[c][j] / counts[c] as f64;
                    }
                } else if c != largest {
                    for j in 0..d {
                        let base = centers[largest][j];
                        let jitter =
                            base * RESEED_PERTURBATION * rng.gen_range(-1.0..=1.0);
                        centers[c][j] = base + jitter;
                    }
                }
            }

            if iter > 0 && (changed as f64) * 100.0 / (n as f64) < MIN_ASSIGNMENT_CHANGE_PERCENT {
                break;
            }
        }

        // Final assignment against the settled centers.
        Self::assign(x, &centers, &inv_var, &mut labels);

        let mut counts = vec![0usize; k];
        let mut sums = vec![vec![0.0; d]; k];
        for i in 0..n {
            let c = labels[i];
            counts[c] += 1;
            let row = x.row_slice(i);
            for j in 0..d {
                sums[c][j] += row[j];
            }
        }

        let mut clusters = Vec::with_capacity(k);
        for c in 0..k {
            let mean: Vec<f64> = if counts[c] > 0 {
                (0..d).map(|j| sums[c][j] / counts[c] as f64).collect()
            } else {
                centers[c].clone()
            };

            // Membership-dependent variance estimate: unbiased for >=10
            // members, biased for 5-9, unit for fewer.
            let variances: Vec<f64> = if counts[c] >= 5 {
                let denom = if counts[c] >= 10 {
                    (counts[c] - 1) as f64
                } else {
                    counts[c] as f64
                };
                let mut acc = vec![0.0; d];
                for i in 0..n {
                    if labels[i] != c {
                        continue;
                    }
                    let row = x.row_slice(i);
                    for j in 0..d {
                        let diff = row[j] - mean[j];
                        acc[j] += diff * diff;
                    }
                }
                acc.iter().map(|s| (s / denom).max(MIN_VARIANCE)).collect()
            } else {
                vec![1.0; d]
            };

            clusters.push(Cluster {
                mean: Vector::from_vec(mean),
                variances: Vector::from_vec(variances),
                count: counts[c],
            });
        }

        self.clusters = Some(clusters);
        self.labels = Some(labels);
        Ok(())
    }

    /// Assigns each sample of `x` to its nearest cluster.
    ///
    /// # Panics
    ///
    /// Panics if the model is not fitted.
    fn predict(&self, x: &Matrix<f64>) -> Vec<usize> {
        let clusters = self
            .clusters
            .as_ref()
            .expect("Model not fitted. Call fit() first.");
        let d = x.n_cols();
        let inv_var: Vec<f64> = match &self.global_variances {
            Some(gv) => gv.iter().map(|v| 1.0 / v.max(MIN_VARIANCE)).collect(),
            None => vec![1.0; d],
        };
        let centers: Vec<Vec<f64>> = clusters
            .iter()
            .map(|c| c.mean.as_slice().to_vec())
            .collect();
        let mut labels = vec![0; x.n_rows()];
        Self::assign(x, &centers, &inv_var, &mut labels);
        labels
    }
}

/// Squared Euclidean distance with per-dimension inverse-variance weights.
fn normalized_distance_sq(a: &[f64], b: &[f64], inv_var: &[f64]) -> f64 {
    let mut sum = 0.0;
    for j in 0..a.len() {
        let diff = a[j] - b[j];
        sum += diff * diff * inv_var[j];
    }
    sum
}
