//! Expectation-Maximization training of Gaussian mixture models.
//!
//! Training runs in two steps: k-means clustering initializes the mixture,
//! then EM iterations raise the total log-likelihood of the model given the
//! data until it settles.
//!
//! Reference: A. P. Dempster, N. M. Laird, and D. B. Rubin. Maximum
//! likelihood from incomplete data via the EM algorithm. Journal of the
//! Royal Statistical Society: Series B, 39(1):1-38, 1977.

use crate::error::{HablarError, Result};
use crate::gmm::{CovarianceKind, Gmm, MIN_VARIANCE};
use crate::kmeans::{KMeansClusterer, KMeansParams};
use crate::primitives::{Matrix, Vector};
use crate::traits::UnsupervisedEstimator;
use log::debug;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A component whose responsibility mass drops to this level has effectively
/// stopped explaining any sample.
const MIN_RESPONSIBILITY_MASS: f64 = f64::MIN_POSITIVE;

/// EM training configuration.
///
/// `min_covariance` keeps re-estimated covariances away from
/// ill-conditioning; every covariance entry is floored at it during the
/// M-step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GmmTrainerParams {
    /// Number of mixture components.
    pub total_components: usize,
    /// Diagonal (true) or full (false) covariance matrices.
    pub is_diagonal_covariance: bool,
    /// Maximum k-means passes during initialization.
    pub kmeans_max_iterations: usize,
    /// K-means tiny-cluster threshold, as a percentage of all samples.
    pub kmeans_min_cluster_percent: f64,
    /// EM keeps iterating at least this many times even when the likelihood
    /// has already settled.
    pub em_min_iterations: usize,
    /// EM stops unconditionally after this many iterations.
    pub em_max_iterations: usize,
    /// Re-estimate covariances during the M-step (means and weights are
    /// always updated).
    pub update_covariances: bool,
    /// Stop once the log-likelihood gain falls below this percentage of the
    /// current log-likelihood magnitude.
    pub tiny_log_likelihood_change_percent: f64,
    /// Per-entry covariance floor applied during re-estimation.
    pub min_covariance: f64,
}

impl Default for GmmTrainerParams {
    fn default() -> Self {
        Self {
            total_components: 8,
            is_diagonal_covariance: true,
            kmeans_max_iterations: 200,
            kmeans_min_cluster_percent: 0.1,
            em_min_iterations: 20,
            em_max_iterations: 200,
            update_covariances: true,
            tiny_log_likelihood_change_percent: 0.001,
            min_covariance: 1e-5,
        }
    }
}

/// Per-component M-step result, applied after all components are computed so
/// the model never holds a half-updated iteration.
struct ComponentUpdate {
    weight: f64,
    mean: Vec<f64>,
    covariance: Option<Matrix<f64>>,
}

/// EM-based GMM trainer.
///
/// A trainer instance exclusively owns its working mixture for the duration
/// of one training call. Progress is reported through an observer callback
/// rather than any global output stream, and a cooperative cancellation flag
/// is checked once per iteration.
///
/// # Examples
///
/// ```
/// use hablar::trainer::{GmmTrainer, GmmTrainerParams};
/// use hablar::primitives::Matrix;
///
/// let mut data = Vec::new();
/// for i in 0..50 {
///     data.push(0.01 * i as f64);
///     data.push(10.0 + 0.01 * i as f64);
/// }
/// let x = Matrix::from_vec(100, 1, data).unwrap();
///
/// let mut trainer = GmmTrainer::new(GmmTrainerParams {
///     total_components: 2,
///     ..GmmTrainerParams::default()
/// })
/// .with_random_state(42);
///
/// let gmm = trainer.train(&x).unwrap();
/// assert_eq!(gmm.n_components(), 2);
/// assert!((gmm.weights().iter().sum::<f64>() - 1.0).abs() < 1e-6);
/// ```
pub struct GmmTrainer {
    params: GmmTrainerParams,
    random_state: Option<u64>,
    observer: Option<Box<dyn FnMut(usize, f64)>>,
    cancel: Option<Arc<AtomicBool>>,
    log_likelihoods: Vec<f64>,
}

impl GmmTrainer {
    /// Creates a trainer with the given configuration.
    #[must_use]
    pub fn new(params: GmmTrainerParams) -> Self {
        Self {
            params,
            random_state: None,
            observer: None,
            cancel: None,
            log_likelihoods: Vec::new(),
        }
    }

    /// Sets the seed for the k-means initialization.
    #[must_use]
    pub fn with_random_state(mut self, seed: u64) -> Self {
        self.random_state = Some(seed);
        self
    }

    /// Registers a callback invoked after every EM iteration with the
    /// iteration number (1-based) and the total log-likelihood.
    #[must_use]
    pub fn with_observer<F>(mut self, observer: F) -> Self
    where
        F: FnMut(usize, f64) + 'static,
    {
        self.observer = Some(Box::new(observer));
        self
    }

    /// Registers a cancellation flag, checked once per EM iteration. When
    /// set, training stops at the next iteration boundary and returns the
    /// model as trained so far.
    #[must_use]
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Per-iteration total log-likelihoods of the most recent training run.
    #[must_use]
    pub fn log_likelihoods(&self) -> &[f64] {
        &self.log_likelihoods
    }

    /// Fits a GMM to the observations in `x` (one feature vector per row):
    /// k-means initialization followed by EM refinement.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid configuration, an empty or undersized
    /// dataset, or a numerical degeneracy during EM.
    pub fn train(&mut self, x: &Matrix<f64>) -> Result<Gmm> {
        self.validate_params()?;
        let (n, d) = x.shape();
        if n == 0 || d == 0 {
            return Err(HablarError::DimensionMismatch {
                expected: "non-empty dataset".to_string(),
                actual: format!("{n}x{d}"),
            });
        }

        // Normalize k-means distances by the per-dimension data variance so
        // high-magnitude dimensions don't dominate the seeding.
        let global_variances = column_variances(x);

        let mut kmeans = KMeansClusterer::new(KMeansParams {
            n_clusters: self.params.total_components,
            max_iterations: self.params.kmeans_max_iterations,
            min_cluster_percent: self.params.kmeans_min_cluster_percent,
        })
        .with_global_variances(global_variances);
        if let Some(seed) = self.random_state {
            kmeans = kmeans.with_random_state(seed);
        }
        kmeans.fit(x)?;
        debug!(
            "k-means initialization finished in {} passes",
            kmeans.n_iter()
        );

        let kind = if self.params.is_diagonal_covariance {
            CovarianceKind::Diagonal
        } else {
            CovarianceKind::Full
        };
        let initial = Gmm::from_clusters(kmeans.clusters(), kind)?;

        self.expectation_maximization(x, initial)
    }

    /// Runs EM iterations on an already-initialized mixture.
    ///
    /// # Errors
    ///
    /// Returns [`HablarError::DegenerateTraining`] when a sample's mixture
    /// density or a component's responsibility mass collapses to zero, and
    /// propagates singular-covariance failures from re-estimation.
    pub fn expectation_maximization(&mut self, x: &Matrix<f64>, initial: Gmm) -> Result<Gmm> {
        let (n, d) = x.shape();
        if d != initial.dimension() {
            return Err(HablarError::dimension_mismatch(
                "feature dimension",
                initial.dimension(),
                d,
            ));
        }
        if n == 0 {
            return Err(HablarError::DimensionMismatch {
                expected: "at least one observation".to_string(),
                actual: "0".to_string(),
            });
        }

        let mut gmm = initial;
        let n_components = gmm.n_components();
        for k in 0..n_components {
            gmm.set_weight(k, 1.0 / n_components as f64);
        }

        self.log_likelihoods.clear();
        let mut iteration = 1usize;

        loop {
            if let Some(flag) = &self.cancel {
                if flag.load(Ordering::Relaxed) {
                    debug!("EM training cancelled at iteration {iteration}");
                    break;
                }
            }

            // E-step: per-sample responsibilities. Samples are independent,
            // so this parallelizes across rows; collect preserves row order.
            let responsibilities = e_step(x, &gmm, iteration)?;

            // M-step: per-component re-estimation. Each component task scans
            // samples in index order, keeping reductions deterministic.
            let updates = m_step(x, &gmm, &responsibilities, &self.params, iteration)?;
            for (k, update) in updates.into_iter().enumerate() {
                gmm.set_weight(k, update.weight);
                let component = &mut gmm.components_mut()[k];
                component.set_mean(Vector::from_vec(update.mean))?;
                if let Some(covariance) = update.covariance {
                    component.set_covariance(covariance)?;
                }
            }

            // Total log-likelihood under the updated parameters.
            let per_sample: Vec<f64> = (0..n)
                .into_par_iter()
                .map(|j| gmm.density(x.row_slice(j)).ln())
                .collect();
            let log_likelihood: f64 = per_sample.iter().sum();

            self.log_likelihoods.push(log_likelihood);
            debug!(
                "EM iteration {iteration}: {} components, log-likelihood = {log_likelihood}",
                n_components
            );
            if let Some(observer) = &mut self.observer {
                observer(iteration, log_likelihood);
            }

            if iteration >= self.params.em_max_iterations {
                break;
            }
            // The improvement check needs a previous iteration to compare
            // against, so it never fires before iteration 2.
            if iteration > self.params.em_min_iterations.max(1) {
                let previous = self.log_likelihoods[iteration - 2];
                let threshold = (log_likelihood / 100.0
                    * self.params.tiny_log_likelihood_change_percent)
                    .abs();
                if log_likelihood - previous < threshold {
                    break;
                }
            }
            iteration += 1;
        }

        Ok(gmm)
    }

    fn validate_params(&self) -> Result<()> {
        if self.params.total_components == 0 {
            return Err(HablarError::InvalidHyperparameter {
                param: "total_components".to_string(),
                value: "0".to_string(),
                constraint: ">0".to_string(),
            });
        }
        if self.params.em_max_iterations == 0 {
            return Err(HablarError::InvalidHyperparameter {
                param: "em_max_iterations".to_string(),
                value: "0".to_string(),
                constraint: ">0".to_string(),
            });
        }
        if self.params.min_covariance <= 0.0 {
            return Err(HablarError::InvalidHyperparameter {
                param: "min_covariance".to_string(),
                value: self.params.min_covariance.to_string(),
                constraint: ">0".to_string(),
            });
        }
        if self.params.tiny_log_likelihood_change_percent < 0.0 {
            return Err(HablarError::InvalidHyperparameter {
                param: "tiny_log_likelihood_change_percent".to_string(),
                value: self.params.tiny_log_likelihood_change_percent.to_string(),
                constraint: ">=0".to_string(),
            });
        }
        Ok(())
    }
}

/// E-step: responsibility z[j][k] = w_k p_k(x_j) / sum_k' w_k' p_k'(x_j).
fn e_step(x: &Matrix<f64>, gmm: &Gmm, iteration: usize) -> Result<Vec<Vec<f64>>> {
    let n = x.n_rows();
    (0..n)
        .into_par_iter()
        .map(|j| {
            let row = x.row_slice(j);
            let mut numerators = vec![0.0; gmm.n_components()];
            let mut denominator = 0.0;
            for (k, (component, weight)) in
                gmm.components().iter().zip(gmm.weights().iter()).enumerate()
            {
                numerators[k] = weight * component.density(row);
                denominator += numerators[k];
            }
            if denominator <= 0.0 || !denominator.is_finite() {
                return Err(HablarError::DegenerateTraining {
                    iteration,
                    message: format!("mixture density vanished for sample {j}"),
                });
            }
            for z in &mut numerators {
                *z /= denominator;
            }
            Ok(numerators)
        })
        .collect()
}

/// M-step: new weights, means, and (optionally) covariances from the
/// responsibility-weighted statistics. Covariances are the scatter about the
/// *new* mean, floored per entry at `min_covariance`.
fn m_step(
    x: &Matrix<f64>,
    gmm: &Gmm,
    responsibilities: &[Vec<f64>],
    params: &GmmTrainerParams,
    iteration: usize,
) -> Result<Vec<ComponentUpdate>> {
    let (n, d) = x.shape();
    (0..gmm.n_components())
        .into_par_iter()
        .map(|k| {
            let mut mass = 0.0;
            let mut mean = vec![0.0; d];
            for j in 0..n {
                let z = responsibilities[j][k];
                mass += z;
                let row = x.row_slice(j);
                for d1 in 0..d {
                    mean[d1] += z * row[d1];
                }
            }
            if mass <= MIN_RESPONSIBILITY_MASS {
                return Err(HablarError::DegenerateTraining {
                    iteration,
                    message: format!("component {k} responsibility mass is zero"),
                });
            }
            for m in &mut mean {
                *m /= mass;
            }

            let covariance = if params.update_covariances {
                Some(match gmm.kind() {
                    CovarianceKind::Diagonal => {
                        let mut scatter = vec![0.0; d];
                        for j in 0..n {
                            let z = responsibilities[j][k];
                            let row = x.row_slice(j);
                            for d1 in 0..d {
                                let diff = row[d1] - mean[d1];
                                scatter[d1] += z * diff * diff;
                            }
                        }
                        let variances: Vec<f64> = scatter
                            .iter()
                            .map(|s| (s / mass).max(params.min_covariance))
                            .collect();
                        Matrix::from_vec(1, d, variances)?
                    }
                    CovarianceKind::Full => {
                        let mut scatter = Matrix::zeros(d, d);
                        for j in 0..n {
                            let z = responsibilities[j][k];
                            let row = x.row_slice(j);
                            for d1 in 0..d {
                                let diff1 = z * (row[d1] - mean[d1]);
                                for d2 in 0..d {
                                    let value =
                                        scatter.get(d1, d2) + diff1 * (row[d2] - mean[d2]);
                                    scatter.set(d1, d2, value);
                                }
                            }
                        }
                        let mut covariance = Matrix::zeros(d, d);
                        for d1 in 0..d {
                            for d2 in 0..d {
                                covariance.set(
                                    d1,
                                    d2,
                                    (scatter.get(d1, d2) / mass).max(params.min_covariance),
                                );
                            }
                        }
                        covariance
                    }
                })
            } else {
                None
            };

            Ok(ComponentUpdate {
                weight: mass / n as f64,
                mean,
                covariance,
            })
        })
        .collect()
}

/// Per-column (biased) variance of the observation matrix.
fn column_variances(x: &Matrix<f64>) -> Vector<f64> {
    let (n, d) = x.shape();
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
    let mut var = vec![0.0; d];
    for i in 0..n {
        let row = x.row_slice(i);
        for j in 0..d {
            let diff = row[j] - mean[j];
            var[j] += diff * diff;
        }
    }
    for v in &mut var {
        *v = (*v / n as f64).max(MIN_VARIANCE);
    }
    Vector::from_vec(var)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gmm::GaussianComponent;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn gaussian_samples(rng: &mut StdRng, n: usize, mean: f64, std_dev: f64) -> Vec<f64> {
        (0..n)
            .map(|_| {
                let u1: f64 = rng.gen_range(1e-12..1.0);
                let u2: f64 = rng.gen();
                let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
                mean + std_dev * z
            })
            .collect()
    }

    fn two_gaussian_data(per_component: usize) -> Matrix<f64> {
        let mut rng = StdRng::seed_from_u64(7);
        let mut data = gaussian_samples(&mut rng, per_component, 0.0, 1.0);
        data.extend(gaussian_samples(&mut rng, per_component, 10.0, 1.0));
        Matrix::from_vec(2 * per_component, 1, data).unwrap()
    }

    fn two_component_params() -> GmmTrainerParams {
        GmmTrainerParams {
            total_components: 2,
            em_min_iterations: 5,
            em_max_iterations: 100,
            ..GmmTrainerParams::default()
        }
    }

    #[test]
    fn test_weights_sum_to_one() {
        let x = two_gaussian_data(150);
        let mut trainer = GmmTrainer::new(two_component_params()).with_random_state(42);
        let gmm = trainer.train(&x).unwrap();
        assert!((gmm.weights().iter().sum::<f64>() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_log_likelihood_non_decreasing() {
        let x = two_gaussian_data(150);
        let mut trainer = GmmTrainer::new(two_component_params()).with_random_state(42);
        trainer.train(&x).unwrap();

        let history = trainer.log_likelihoods();
        assert!(!history.is_empty());
        for pair in history.windows(2) {
            assert!(
                pair[1] >= pair[0] - 1e-6,
                "likelihood dropped: {} -> {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_recovers_separated_components() {
        let x = two_gaussian_data(300);
        let mut trainer = GmmTrainer::new(two_component_params()).with_random_state(42);
        let gmm = trainer.train(&x).unwrap();

        let mut means: Vec<f64> = gmm.components().iter().map(|c| c.mean().get(0)).collect();
        means.sort_by(f64::total_cmp);
        assert!((means[0] - 0.0).abs() < 0.5);
        assert!((means[1] - 10.0).abs() < 0.5);
        for &w in gmm.weights() {
            assert!((w - 0.5).abs() < 0.05);
        }
    }

    #[test]
    fn test_reproducible_with_seed() {
        let x = two_gaussian_data(100);
        let mut a = GmmTrainer::new(two_component_params()).with_random_state(42);
        let mut b = GmmTrainer::new(two_component_params()).with_random_state(42);
        let ga = a.train(&x).unwrap();
        let gb = b.train(&x).unwrap();

        assert_eq!(ga.weights(), gb.weights());
        for (ca, cb) in ga.components().iter().zip(gb.components().iter()) {
            assert_eq!(ca.mean(), cb.mean());
            assert_eq!(ca.covariance(), cb.covariance());
        }
        assert_eq!(a.log_likelihoods(), b.log_likelihoods());
    }

    #[test]
    fn test_observer_called_per_iteration() {
        let x = two_gaussian_data(50);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let mut trainer = GmmTrainer::new(two_component_params())
            .with_random_state(1)
            .with_observer(move |iteration, ll| sink.borrow_mut().push((iteration, ll)));
        trainer.train(&x).unwrap();

        let seen = seen.borrow();
        assert_eq!(seen.len(), trainer.log_likelihoods().len());
        for (i, (iteration, ll)) in seen.iter().enumerate() {
            assert_eq!(*iteration, i + 1);
            assert!((ll - trainer.log_likelihoods()[i]).abs() < 1e-12);
        }
    }

    #[test]
    fn test_cancellation_before_first_iteration() {
        let x = two_gaussian_data(50);
        let flag = Arc::new(AtomicBool::new(true));
        let mut trainer = GmmTrainer::new(two_component_params())
            .with_random_state(1)
            .with_cancel_flag(Arc::clone(&flag));
        let gmm = trainer.train(&x).unwrap();

        // No iterations ran; the model is the uniform-weighted initial mixture.
        assert!(trainer.log_likelihoods().is_empty());
        assert!((gmm.weights()[0] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_zero_components_rejected() {
        let x = two_gaussian_data(10);
        let mut trainer = GmmTrainer::new(GmmTrainerParams {
            total_components: 0,
            ..GmmTrainerParams::default()
        });
        assert!(trainer.train(&x).is_err());
    }

    #[test]
    fn test_nonpositive_min_covariance_rejected() {
        let x = two_gaussian_data(10);
        let mut trainer = GmmTrainer::new(GmmTrainerParams {
            min_covariance: 0.0,
            ..two_component_params()
        });
        assert!(trainer.train(&x).is_err());
    }

    #[test]
    fn test_dimension_mismatch_fails_before_iterating() {
        let x = two_gaussian_data(10);
        let initial = Gmm::new(
            vec![
                GaussianComponent::diagonal(Vector::zeros(2), Vector::ones(2)).unwrap(),
                GaussianComponent::diagonal(Vector::ones(2), Vector::ones(2)).unwrap(),
            ],
            vec![0.5, 0.5],
        )
        .unwrap();
        let mut trainer = GmmTrainer::new(two_component_params());
        let result = trainer.expectation_maximization(&x, initial);
        assert!(result.is_err());
        assert!(trainer.log_likelihoods().is_empty());
    }

    #[test]
    fn test_degenerate_sample_reported() {
        // A sample so far from both components that every density underflows
        // to zero: the E-step must fail loudly instead of dividing by zero.
        let x = Matrix::from_vec(3, 1, vec![0.0, 1.0, 1.0e6]).unwrap();
        let initial = Gmm::new(
            vec![
                GaussianComponent::diagonal(Vector::zeros(1), Vector::ones(1)).unwrap(),
                GaussianComponent::diagonal(Vector::ones(1), Vector::ones(1)).unwrap(),
            ],
            vec![0.5, 0.5],
        )
        .unwrap();
        let mut trainer = GmmTrainer::new(two_component_params());
        let result = trainer.expectation_maximization(&x, initial);
        assert!(matches!(
            result,
            Err(HablarError::DegenerateTraining { iteration: 1, .. })
        ));
    }

    #[test]
    fn test_frozen_covariances() {
        let x = two_gaussian_data(100);
        let mut trainer = GmmTrainer::new(GmmTrainerParams {
            update_covariances: false,
            ..two_component_params()
        })
        .with_random_state(42);
        let gmm = trainer.train(&x).unwrap();
        // Covariances stay at the floored k-means estimates; training still
        // converges and produces a valid mixture.
        assert!((gmm.weights().iter().sum::<f64>() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_full_covariance_training() {
        let mut rng = StdRng::seed_from_u64(13);
        let mut data = Vec::with_capacity(400);
        for _ in 0..100 {
            data.push(gaussian_samples(&mut rng, 1, 0.0, 1.0)[0]);
            data.push(gaussian_samples(&mut rng, 1, 0.0, 1.0)[0]);
        }
        for _ in 0..100 {
            data.push(gaussian_samples(&mut rng, 1, 8.0, 1.0)[0]);
            data.push(gaussian_samples(&mut rng, 1, 8.0, 1.0)[0]);
        }
        let x = Matrix::from_vec(200, 2, data).unwrap();

        let mut trainer = GmmTrainer::new(GmmTrainerParams {
            is_diagonal_covariance: false,
            ..two_component_params()
        })
        .with_random_state(42);
        let gmm = trainer.train(&x).unwrap();

        assert_eq!(gmm.kind(), CovarianceKind::Full);
        assert!((gmm.weights().iter().sum::<f64>() - 1.0).abs() < 1e-6);
        for pair in trainer.log_likelihoods().windows(2) {
            assert!(pair[1] >= pair[0] - 1e-6);
        }
    }

    #[test]
    fn test_max_iterations_respected() {
        let x = two_gaussian_data(50);
        let mut trainer = GmmTrainer::new(GmmTrainerParams {
            em_min_iterations: 1,
            em_max_iterations: 3,
            ..two_component_params()
        })
        .with_random_state(42);
        trainer.train(&x).unwrap();
        assert_eq!(trainer.log_likelihoods().len(), 3);
    }
}
