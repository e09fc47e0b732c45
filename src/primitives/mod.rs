//! Core compute primitives (Vector, Matrix).
//!
//! These types provide the foundation for all acoustic-model math. Feature
//! vectors and observation matrices use 64-bit floats throughout.

mod matrix;
mod vector;

pub use matrix::Matrix;
pub use vector::Vector;
