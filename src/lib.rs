//! Hablar: statistical acoustic modeling for speech synthesis and voice
//! conversion pipelines.
//!
//! Hablar provides the model-training core of a voice-conversion system:
//! Gaussian mixture models fit with Expectation-Maximization, k-means
//! initialization, contextual per-phone-class training, joint source/target
//! mixtures, and binary model persistence. Feature extraction, frame
//! alignment, and resynthesis live in upstream and downstream collaborators.
//!
//! # Quick Start
//!
//! ```
//! use hablar::prelude::*;
//!
//! // Samples from two well-separated regions.
//! let mut data = Vec::new();
//! for i in 0..50 {
//!     data.push(0.01 * i as f64);
//!     data.push(10.0 + 0.01 * i as f64);
//! }
//! let x = Matrix::from_vec(100, 1, data).unwrap();
//!
//! let mut trainer = GmmTrainer::new(GmmTrainerParams {
//!     total_components: 2,
//!     ..GmmTrainerParams::default()
//! })
//! .with_random_state(42);
//!
//! let gmm = trainer.train(&x).unwrap();
//! let responsibilities = gmm.component_probabilities(&[0.1]).unwrap();
//! assert!((responsibilities.iter().sum::<f64>() - 1.0).abs() < 1e-9);
//! ```
//!
//! # Modules
//!
//! - [`primitives`]: Core Vector and Matrix types
//! - [`gmm`]: Gaussian components and mixtures
//! - [`kmeans`]: K-means clustering for mixture initialization
//! - [`trainer`]: The EM training engine
//! - [`context`]: Phonetic-context partitioning of the phone inventory
//! - [`joint`]: Joint source/target mixtures for conversion
//! - [`serialization`]: Binary model persistence

pub mod context;
pub mod error;
pub mod gmm;
pub mod joint;
pub mod kmeans;
pub mod prelude;
pub mod primitives;
pub mod serialization;
pub mod trainer;
pub mod traits;

pub use error::{HablarError, Result};
