//! Joint source/target mixtures for feature-space conversion.
//!
//! A joint GMM is fit over the concatenation of time-aligned source and
//! target feature vectors (alignment happens upstream). The mixture itself
//! sees only raw numbers; [`FeatureDescriptor`] metadata records how each
//! half of a joint vector is to be reinterpreted downstream, and the stored
//! split point recovers the two halves.

use crate::context::ContextualGmmParams;
use crate::error::{HablarError, Result};
use crate::gmm::Gmm;
use crate::primitives::Matrix;
use crate::trainer::GmmTrainer;
use serde::{Deserialize, Serialize};

/// The parameterization of a feature space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureKind {
    LineSpectralFrequencies,
    MelFrequencyCepstral,
}

impl FeatureKind {
    /// Stable numeric tag used by the binary model format.
    pub(crate) fn code(self) -> u32 {
        match self {
            Self::LineSpectralFrequencies => 0,
            Self::MelFrequencyCepstral => 1,
        }
    }

    pub(crate) fn from_code(code: u32) -> Result<Self> {
        match code {
            0 => Ok(Self::LineSpectralFrequencies),
            1 => Ok(Self::MelFrequencyCepstral),
            other => Err(HablarError::FormatError {
                message: format!("unknown feature kind tag {other}"),
            }),
        }
    }
}

/// What one half of a joint vector contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureDescriptor {
    pub kind: FeatureKind,
    pub dimension: usize,
}

/// Concatenates paired source/target observations row-wise: row `i` of the
/// result is `[source_i ‖ target_i]`.
///
/// # Errors
///
/// Returns an error if the matrices disagree on row count or either is
/// empty.
pub fn concatenate_paired(source: &Matrix<f64>, target: &Matrix<f64>) -> Result<Matrix<f64>> {
    let (n, ds) = source.shape();
    let (nt, dt) = target.shape();
    if n != nt {
        return Err(HablarError::dimension_mismatch("paired row count", n, nt));
    }
    if n == 0 || ds == 0 || dt == 0 {
        return Err(HablarError::DimensionMismatch {
            expected: "non-empty source and target matrices".to_string(),
            actual: format!("{n}x{ds} and {nt}x{dt}"),
        });
    }
    let mut data = Vec::with_capacity(n * (ds + dt));
    for i in 0..n {
        data.extend_from_slice(source.row_slice(i));
        data.extend_from_slice(target.row_slice(i));
    }
    Matrix::from_vec(n, ds + dt, data)
}

/// A GMM over joint `[source ‖ target]` vectors, plus the metadata needed to
/// split and reinterpret them.
#[derive(Debug, Clone, PartialEq)]
pub struct JointGmm {
    gmm: Gmm,
    source: FeatureDescriptor,
    target: FeatureDescriptor,
}

impl JointGmm {
    /// Wraps a trained mixture with its feature metadata.
    ///
    /// # Errors
    ///
    /// Returns an error if the mixture dimension is not the sum of the
    /// source and target dimensions.
    pub fn new(gmm: Gmm, source: FeatureDescriptor, target: FeatureDescriptor) -> Result<Self> {
        let joint = source.dimension + target.dimension;
        if gmm.dimension() != joint {
            return Err(HablarError::dimension_mismatch(
                "joint feature dimension",
                joint,
                gmm.dimension(),
            ));
        }
        Ok(Self {
            gmm,
            source,
            target,
        })
    }

    /// The underlying mixture over joint vectors.
    #[must_use]
    pub fn gmm(&self) -> &Gmm {
        &self.gmm
    }

    /// Source-half metadata.
    #[must_use]
    pub fn source(&self) -> FeatureDescriptor {
        self.source
    }

    /// Target-half metadata.
    #[must_use]
    pub fn target(&self) -> FeatureDescriptor {
        self.target
    }

    /// Index where the target half of a joint vector begins.
    #[must_use]
    pub fn split_point(&self) -> usize {
        self.source.dimension
    }
}

/// One joint GMM per context class, plus the partition that produced them.
/// This is the unit that gets persisted and reloaded for conversion.
#[derive(Debug, Clone, PartialEq)]
pub struct JointGmmSet {
    gmms: Vec<JointGmm>,
    context: ContextualGmmParams,
}

impl JointGmmSet {
    /// Assembles a set from per-class mixtures and their partition.
    ///
    /// # Errors
    ///
    /// Returns an error if the mixture count doesn't match the class count.
    pub fn new(gmms: Vec<JointGmm>, context: ContextualGmmParams) -> Result<Self> {
        if gmms.len() != context.n_classes() {
            return Err(HablarError::dimension_mismatch(
                "per-class mixture count",
                context.n_classes(),
                gmms.len(),
            ));
        }
        Ok(Self { gmms, context })
    }

    /// Trains one joint GMM per context class from phone-labeled, time-aligned
    /// paired features. `labels[i]` names the phone of frame `i`; frames whose
    /// phone belongs to no class are ignored.
    ///
    /// Each class trains with its own configuration from the partition.
    ///
    /// # Errors
    ///
    /// Returns an error if the inputs disagree on frame count, a class ends
    /// up with no frames, or per-class training fails.
    pub fn train(
        context: ContextualGmmParams,
        source: &Matrix<f64>,
        target: &Matrix<f64>,
        labels: &[&str],
        source_features: FeatureDescriptor,
        target_features: FeatureDescriptor,
        random_state: Option<u64>,
    ) -> Result<Self> {
        let joint = concatenate_paired(source, target)?;
        if labels.len() != joint.n_rows() {
            return Err(HablarError::dimension_mismatch(
                "label count",
                joint.n_rows(),
                labels.len(),
            ));
        }
        if source.n_cols() != source_features.dimension {
            return Err(HablarError::dimension_mismatch(
                "source feature dimension",
                source_features.dimension,
                source.n_cols(),
            ));
        }
        if target.n_cols() != target_features.dimension {
            return Err(HablarError::dimension_mismatch(
                "target feature dimension",
                target_features.dimension,
                target.n_cols(),
            ));
        }

        // Class-bucketed frame indices.
        let mut members: Vec<Vec<usize>> = vec![Vec::new(); context.n_classes()];
        for (i, label) in labels.iter().enumerate() {
            if let Some(class) = context.class_index(label) {
                members[class].push(i);
            }
        }

        let d = joint.n_cols();
        let mut gmms = Vec::with_capacity(context.n_classes());
        for (class, frames) in members.iter().enumerate() {
            if frames.is_empty() {
                return Err(HablarError::DimensionMismatch {
                    expected: format!(
                        "at least one frame for context class '{}'",
                        context.classes()[class].name
                    ),
                    actual: "0 frames".to_string(),
                });
            }
            let mut data = Vec::with_capacity(frames.len() * d);
            for &i in frames {
                data.extend_from_slice(joint.row_slice(i));
            }
            let class_data = Matrix::from_vec(frames.len(), d, data)?;

            let mut trainer = GmmTrainer::new(context.classes()[class].trainer_params.clone());
            if let Some(seed) = random_state {
                trainer = trainer.with_random_state(seed);
            }
            let gmm = trainer.train(&class_data)?;
            gmms.push(JointGmm::new(gmm, source_features, target_features)?);
        }

        Self::new(gmms, context)
    }

    /// The per-class mixtures, in class order.
    #[must_use]
    pub fn gmms(&self) -> &[JointGmm] {
        &self.gmms
    }

    /// The mixture of class `i`.
    ///
    /// # Panics
    ///
    /// Panics if `i` is out of bounds.
    #[must_use]
    pub fn gmm(&self, i: usize) -> &JointGmm {
        &self.gmms[i]
    }

    /// The context partition that produced this set.
    #[must_use]
    pub fn context(&self) -> &ContextualGmmParams {
        &self.context
    }

    /// The mixture owning `phone`, resolved through the partition index.
    #[must_use]
    pub fn gmm_for_phone(&self, phone: &str) -> Option<&JointGmm> {
        self.context.class_index(phone).map(|i| &self.gmms[i])
    }
}
