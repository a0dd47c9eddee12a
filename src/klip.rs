// src/klip.rs

//! PSF subtraction by Karhunen-Loeve image projection.
//!
//! A target image is modeled as a truncated linear combination of the KL
//! basis of a reference library; the model is subtracted and the spread of
//! the references' own fitting residuals is reported as the per-pixel error.

use crate::diagnostics::{captured_variance_fraction, KlipDiagnostics};
#[cfg(feature = "enable-klip-diagnostics")]
use crate::diagnostics::{compute_frob_norm_f64, compute_row_orthogonality_error_f64};
use crate::error::KlipError;
use crate::karhunen_loeve::{
    karhunen_loeve_transform_with_backend, normalize_rows, numerical_rank, KarhunenLoeveTransform,
};
use crate::linalg_backends::{BackendEigh, LinAlgBackendProvider};
use crate::vectorize::{
    check_shapes, flatten_target, unflatten, vector_mean, vectorize_references, ImageShape,
};
use log::{debug, info, warn};
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, ArrayView3, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

// --- Configuration ---

/// What to do with a truncation rank larger than the number of references.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TruncationPolicy {
    /// `K > N` is an `InvalidTruncation` error.
    #[default]
    Reject,
    /// `K > N` uses all `N` components. With normalization on, `K` is also
    /// lowered to the numerical rank of the library instead of failing on a
    /// degenerate component.
    ClampToRank,
}

impl TruncationPolicy {
    /// Resolves a requested rank against the `available` number of components.
    /// A request of zero is rejected under every policy.
    pub fn resolve(self, requested: usize, available: usize) -> Result<usize, KlipError> {
        if requested == 0 || available == 0 {
            return Err(KlipError::InvalidTruncation { requested, available });
        }
        match self {
            TruncationPolicy::Reject if requested > available => {
                Err(KlipError::InvalidTruncation { requested, available })
            }
            TruncationPolicy::Reject => Ok(requested),
            TruncationPolicy::ClampToRank => Ok(requested.min(available)),
        }
    }
}

/// Parameters of one PSF subtraction. Missing fields deserialize to their defaults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KlipConfig {
    /// Number of highest-variance KL components kept for the fit (K).
    pub truncate: usize,
    /// Scale every KL basis vector to unit L2 norm.
    pub normalize: bool,
    /// Handling of `truncate` larger than the reference count.
    pub truncation_policy: TruncationPolicy,
}

impl Default for KlipConfig {
    fn default() -> Self {
        KlipConfig {
            truncate: 1,
            normalize: true,
            truncation_policy: TruncationPolicy::Reject,
        }
    }
}

impl KlipConfig {
    /// Default configuration keeping `truncate` components.
    pub fn with_truncate(truncate: usize) -> Self {
        Self { truncate, ..Self::default() }
    }
}

// --- Truncated basis, reconstruction, error estimate ---

/// The first K KL vectors, one per row.
#[derive(Debug, Clone)]
pub struct TruncatedBasis {
    /// Shape: `(rank, num_pixels)`
    vectors: Array2<f64>,
}

impl TruncatedBasis {
    /// Keeps the `rank` highest-variance vectors of `transform`, scaling them
    /// to unit norm when `normalize` is set and the transform is not already
    /// normalized. Components past `rank` are never inspected.
    ///
    /// # Errors
    /// - `InvalidTruncation` unless `1 <= rank <= N`.
    /// - `DegenerateBasisVector` if a kept vector is numerically zero and must be normalized.
    pub fn from_transform(
        transform: &KarhunenLoeveTransform,
        rank: usize,
        normalize: bool,
    ) -> Result<Self, KlipError> {
        let available = transform.num_components();
        if rank == 0 || rank > available {
            return Err(KlipError::InvalidTruncation { requested: rank, available });
        }
        let mut vectors = transform.kl_vectors.slice(s![..rank, ..]).to_owned();
        if normalize && !transform.normalized {
            normalize_rows(&mut vectors, transform.raw_norms.slice(s![..rank]))?;
        }
        Ok(Self { vectors })
    }

    pub fn rank(&self) -> usize { self.vectors.nrows() }
    pub fn num_pixels(&self) -> usize { self.vectors.ncols() }
    pub fn vectors(&self) -> ArrayView2<'_, f64> { self.vectors.view() }

    /// Inner products of a vector with every basis vector.
    pub fn coefficients(&self, vector: ArrayView1<f64>) -> Array1<f64> {
        self.vectors.dot(&vector)
    }

    /// Linear combination of the basis vectors weighted by their projection
    /// coefficients onto `vector`.
    pub fn reconstruct(&self, vector: ArrayView1<f64>) -> Array1<f64> {
        self.vectors.t().dot(&self.coefficients(vector))
    }

    /// Reconstructs every row of `rows` at once.
    /// Shape: `(num_rows, num_pixels)` in and out.
    pub fn reconstruct_rows(&self, rows: ArrayView2<f64>) -> Array2<f64> {
        rows.dot(&self.vectors.t()).dot(&self.vectors)
    }
}

/// Fitted PSF model and residual for one flattened target.
#[derive(Debug, Clone)]
pub struct Reconstruction {
    /// Shape: `(num_pixels)`
    pub psf_model: Array1<f64>,
    /// Mean-centered target minus `psf_model`.
    /// Shape: `(num_pixels)`
    pub residual: Array1<f64>,
    /// Mean removed from the target before the fit.
    pub target_mean: f64,
}

/// Removes the target's own mean, projects it onto `basis` and subtracts
/// the reconstruction.
pub fn reconstruct_target(target_vector: ArrayView1<f64>, basis: &TruncatedBasis) -> Reconstruction {
    let target_mean = vector_mean(target_vector);
    let centered_target = target_vector.mapv(|x| x - target_mean);
    let psf_model = basis.reconstruct(centered_target.view());
    let residual = centered_target - &psf_model;
    Reconstruction { psf_model, residual, target_mean }
}

/// Residual of every mean-centered reference row when fitted with `basis`.
/// Shape: `(num_references, num_pixels)`
pub fn reference_self_residuals(reference_matrix: ArrayView2<f64>, basis: &TruncatedBasis) -> Array2<f64> {
    let reconstructions = basis.reconstruct_rows(reference_matrix);
    &reference_matrix - &reconstructions
}

/// Per-pixel population standard deviation of the reference self-residuals.
/// Every element is non-negative for finite input.
/// Shape: `(num_pixels)`
pub fn estimate_error_map(reference_matrix: ArrayView2<f64>, basis: &TruncatedBasis) -> Array1<f64> {
    let residuals = reference_self_residuals(reference_matrix, basis);
    residual_std(&residuals)
}

fn residual_std(residuals: &Array2<f64>) -> Array1<f64> {
    if residuals.nrows() == 0 {
        return Array1::zeros(residuals.ncols());
    }
    residuals.std_axis(Axis(0), 0.0)
}

// --- Output ---

/// Images produced by one PSF subtraction, all shaped `(H, W)`.
#[derive(Debug, Clone)]
pub struct KlipOutput {
    /// Mean-centered target with the PSF model removed.
    pub residual_image: Array2<f64>,
    /// Fitted PSF model.
    pub psf_model_image: Array2<f64>,
    /// Per-pixel uncertainty of `residual_image`, non-negative.
    pub error_map: Array2<f64>,
    /// Mean removed from the target before fitting.
    pub target_mean: f64,
    pub diagnostics: KlipDiagnostics,
}

// --- Reusable subtractor ---

/// A truncated KL basis built once from a reference library and applied to
/// any number of targets of the same shape.
///
/// Holds no interior mutability; a `&PsfSubtractor` can be shared freely
/// across threads.
#[derive(Debug, Clone)]
pub struct PsfSubtractor {
    image_shape: ImageShape,
    basis: TruncatedBasis,
    error_map: Array2<f64>,
    diagnostics: KlipDiagnostics,
}

impl PsfSubtractor {
    /// Builds the truncated basis and error map of an `(N, H, W)` reference stack.
    ///
    /// # Errors
    /// - `ShapeMismatch` for an empty stack or zero-area images.
    /// - `InvalidTruncation` per `config.truncation_policy`.
    /// - `DegenerateBasisVector` if normalization meets a numerically zero KL
    ///   vector among the kept ones (under `ClampToRank`, only when the
    ///   library has no usable component at all).
    /// - `Eigendecomposition` if the eigensolver fails.
    pub fn new<T: Copy + Into<f64>>(references: ArrayView3<T>, config: &KlipConfig) -> Result<Self, KlipError> {
        let backend = LinAlgBackendProvider::<f64>::new();
        Self::with_backend(references, config, &backend)
    }

    /// As [`PsfSubtractor::new`], with an explicit eigensolver.
    pub fn with_backend<T: Copy + Into<f64>, B: BackendEigh<f64>>(
        references: ArrayView3<T>,
        config: &KlipConfig,
        backend: &B,
    ) -> Result<Self, KlipError> {
        let (num_references, height, width) = references.dim();
        if num_references == 0 {
            return Err(KlipError::ShapeMismatch { target: (height, width), references: references.dim() });
        }
        let rank = config.truncation_policy.resolve(config.truncate, num_references)?;
        if rank != config.truncate {
            warn!(
                "Truncation rank {} exceeds the {} available references; clamped to {}.",
                config.truncate, num_references, rank
            );
        }

        let reference_matrix = vectorize_references(references)?;
        let image_shape = reference_matrix.image_shape;
        info!(
            "Building KL basis from {} references of {}x{} pixels, keeping {} components.",
            num_references, image_shape.height, image_shape.width, rank
        );

        // Normalization applies to the kept components only.
        let transform = karhunen_loeve_transform_with_backend(reference_matrix.data.view(), false, backend)?;
        let rank = if config.normalize && config.truncation_policy == TruncationPolicy::ClampToRank {
            let independent = numerical_rank(transform.raw_norms.view(), image_shape.num_pixels());
            if independent == 0 {
                return Err(KlipError::DegenerateBasisVector { index: 0 });
            }
            if rank > independent {
                warn!(
                    "Only {} of {} KL components are numerically independent; truncation clamped from {} to {}.",
                    independent, num_references, rank, independent
                );
            }
            rank.min(independent)
        } else {
            rank
        };
        let basis = TruncatedBasis::from_transform(&transform, rank, config.normalize)?;

        let residuals = reference_self_residuals(reference_matrix.data.view(), &basis);
        let error_map = unflatten(residual_std(&residuals), image_shape)?;

        #[allow(unused_mut)]
        let mut diagnostics = KlipDiagnostics {
            num_references,
            num_pixels: image_shape.num_pixels(),
            components_used: rank,
            components_requested: config.truncate,
            eigenvalues: transform.eigenvalues.to_vec(),
            captured_variance_fraction: captured_variance_fraction(transform.eigenvalues.view(), rank),
            kept_basis_norms: transform.raw_norms.iter().take(rank).copied().collect(),
            ..KlipDiagnostics::default()
        };
        #[cfg(feature = "enable-klip-diagnostics")]
        {
            if config.normalize {
                diagnostics.basis_orthogonality_error = compute_row_orthogonality_error_f64(&basis.vectors());
            }
            diagnostics.reference_fro_norm = Some(compute_frob_norm_f64(&reference_matrix.data.view()));
            diagnostics.reference_residual_fro_norm = Some(compute_frob_norm_f64(&residuals.view()));
        }
        debug!(
            "Kept components capture {:?} of the reference variance.",
            diagnostics.captured_variance_fraction
        );

        Ok(Self { image_shape, basis, error_map, diagnostics })
    }

    pub fn image_shape(&self) -> ImageShape { self.image_shape }
    pub fn rank(&self) -> usize { self.basis.rank() }
    pub fn basis(&self) -> &TruncatedBasis { &self.basis }
    pub fn error_map(&self) -> ArrayView2<'_, f64> { self.error_map.view() }
    pub fn diagnostics(&self) -> &KlipDiagnostics { &self.diagnostics }

    /// Fits and removes the PSF model from one `(H, W)` target.
    ///
    /// # Errors
    /// `ShapeMismatch` if the target shape differs from the reference images.
    pub fn subtract<T: Copy + Into<f64>>(&self, target: ArrayView2<T>) -> Result<KlipOutput, KlipError> {
        if target.dim() != self.image_shape.dims() {
            return Err(KlipError::ShapeMismatch {
                target: target.dim(),
                references: (self.diagnostics.num_references, self.image_shape.height, self.image_shape.width),
            });
        }
        let target_vector = flatten_target(target);
        let reconstruction = reconstruct_target(target_vector.view(), &self.basis);
        debug!(
            "Subtracted PSF model from target (mean {:e}) using {} components.",
            reconstruction.target_mean,
            self.basis.rank()
        );

        Ok(KlipOutput {
            residual_image: unflatten(reconstruction.residual, self.image_shape)?,
            psf_model_image: unflatten(reconstruction.psf_model, self.image_shape)?,
            error_map: self.error_map.clone(),
            target_mean: reconstruction.target_mean,
            diagnostics: self.diagnostics.clone(),
        })
    }
}

// --- Entry points ---

/// Removes the PSF from `target` using a KL basis of `references`.
///
/// * `target` - `(H, W)` image, any precision convertible to `f64`.
/// * `references` - `(N, H, W)` reference library.
/// * `config` - truncation rank, normalization and truncation policy.
///
/// # Errors
/// See [`PsfSubtractor::new`]; shapes are checked before any computation.
///
/// # Examples
///
/// ```
/// use ndarray::{Array2, Array3};
/// use klip_psf::{subtract_psf, KlipConfig};
///
/// let base = Array2::from_shape_fn((4, 4), |(r, c)| ((r * 4 + c) as f64).sin());
/// let references = Array3::from_shape_fn((3, 4, 4), |(k, r, c)| (k + 1) as f64 * base[[r, c]]);
/// let target = base.mapv(|v| 2.5 * v);
///
/// let output = subtract_psf(target.view(), references.view(), &KlipConfig::with_truncate(1)).unwrap();
/// assert!(output.residual_image.iter().all(|v| v.abs() < 1e-9));
/// ```
pub fn subtract_psf<T: Copy + Into<f64>>(
    target: ArrayView2<T>,
    references: ArrayView3<T>,
    config: &KlipConfig,
) -> Result<KlipOutput, KlipError> {
    check_shapes(target.dim(), references.dim())?;
    PsfSubtractor::new(references, config)?.subtract(target)
}

/// Removes the PSF from each of `M` targets `(M, H, W)` against one reference
/// library. The basis is built once and targets are processed in parallel;
/// each result equals a separate [`subtract_psf`] call.
pub fn subtract_psf_batch<T: Copy + Into<f64> + Send + Sync>(
    targets: ArrayView3<T>,
    references: ArrayView3<T>,
    config: &KlipConfig,
) -> Result<Vec<KlipOutput>, KlipError> {
    let (num_targets, height, width) = targets.dim();
    check_shapes((height, width), references.dim())?;
    if num_targets == 0 {
        warn!("Empty target batch; nothing to subtract.");
        return Ok(Vec::new());
    }

    let subtractor = PsfSubtractor::new(references, config)?;
    info!("Subtracting PSF from {} targets in parallel.", num_targets);
    targets
        .axis_iter(Axis(0))
        .into_par_iter()
        .map(|target| subtractor.subtract(target))
        .collect()
}
