// src/error.rs

use thiserror::Error;

/// Errors reported by the PSF subtraction core.
///
/// Every error is raised before any output is produced; a failed call never
/// returns partial images.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum KlipError {
    /// Target and reference stack disagree on (H, W), the stack holds no
    /// references, or the images have no pixels.
    #[error("target shape {target:?} is incompatible with reference stack shape {references:?}")]
    ShapeMismatch {
        target: (usize, usize),
        references: (usize, usize, usize),
    },

    /// One image of a slice-of-images reference library differs in shape
    /// from the first image.
    #[error("reference image {index} has shape {found:?}, expected {expected:?}")]
    ReferenceShapeMismatch {
        index: usize,
        expected: (usize, usize),
        found: (usize, usize),
    },

    /// A flat vector whose length does not match the image it should be reshaped into.
    #[error("vector of length {found} cannot be reshaped to image shape {shape:?}")]
    Reshape { shape: (usize, usize), found: usize },

    /// Truncation rank outside `1..=N`.
    #[error("truncation rank {requested} is outside 1..={available}")]
    InvalidTruncation { requested: usize, available: usize },

    /// A kept KL basis vector is numerically zero and normalization was requested.
    #[error("KL basis vector {index} has numerically zero norm and cannot be normalized")]
    DegenerateBasisVector { index: usize },

    /// The eigensolver backend failed.
    #[error("eigendecomposition of the reference covariance failed: {reason}")]
    Eigendecomposition { reason: String },
}
