//! Core trait for estimators that learn from unlabeled data.

use crate::error::Result;
use crate::primitives::Matrix;

/// Trait for unsupervised learning models.
///
/// # Examples
///
/// ```
/// use hablar::prelude::*;
///
/// // Two clear clusters.
/// let data = Matrix::from_vec(6, 2, vec![
///     0.0, 0.0, 0.1, 0.1, 0.2, 0.0,
///     10.0, 10.0, 10.1, 10.1, 10.0, 10.2,
/// ]).unwrap();
///
/// let mut kmeans = KMeansClusterer::new(KMeansParams {
///     n_clusters: 2,
///     ..KMeansParams::default()
/// })
/// .with_random_state(42);
/// kmeans.fit(&data).unwrap();
/// let labels = kmeans.predict(&data);
/// assert_eq!(labels.len(), 6);
/// ```
pub trait UnsupervisedEstimator {
    /// The type of labels/clusters produced.
    type Labels;

    /// Fits the model to data.
    ///
    /// # Errors
    ///
    /// Returns an error if fitting fails (empty data, invalid parameters,
    /// etc.).
    fn fit(&mut self, x: &Matrix<f64>) -> Result<()>;

    /// Predicts cluster assignments for input data.
    fn predict(&self, x: &Matrix<f64>) -> Self::Labels;
}
