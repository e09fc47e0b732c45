//! Convenience re-exports for common usage.
//!
//! # Usage
//!
//! ```
//! use hablar::prelude::*;
//! ```

pub use crate::context::{ContextScheme, ContextualGmmParams, Phone};
pub use crate::error::{HablarError, Result};
pub use crate::gmm::{CovarianceKind, GaussianComponent, Gmm};
pub use crate::joint::{FeatureDescriptor, FeatureKind, JointGmm, JointGmmSet};
pub use crate::kmeans::{KMeansClusterer, KMeansParams};
pub use crate::primitives::{Matrix, Vector};
pub use crate::trainer::{GmmTrainer, GmmTrainerParams};
pub use crate::traits::UnsupervisedEstimator;
