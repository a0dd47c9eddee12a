// src/diagnostics.rs

use ndarray::{Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};

/// Diagnostics returned alongside every PSF subtraction.
///
/// The cheap fields are always filled. The `Option` metrics need extra
/// matrix products and are only computed with the `enable-klip-diagnostics`
/// feature.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KlipDiagnostics {
    pub num_references: usize,
    pub num_pixels: usize,
    /// Truncation rank actually used (after any clamping).
    pub components_used: usize,
    /// Truncation rank requested by the caller.
    pub components_requested: usize,
    /// Full covariance spectrum, descending.
    pub eigenvalues: Vec<f64>,
    /// Share of the (non-negative) spectrum held by the kept components.
    /// `None` when the spectrum sums to zero.
    pub captured_variance_fraction: Option<f64>,
    /// L2 norms of the kept KL vectors before normalization.
    pub kept_basis_norms: Vec<f64>,

    // --- Feature-gated metrics ---
    /// ||I - B Bᵀ||_F of the kept basis rows (normalized bases only).
    pub basis_orthogonality_error: Option<f64>,
    /// Frobenius norm of the mean-centered reference matrix.
    pub reference_fro_norm: Option<f64>,
    /// Frobenius norm of the reference self-residuals.
    pub reference_residual_fro_norm: Option<f64>,
}

/// Fraction of the spectrum captured by the first `kept` eigenvalues.
/// Negative eigenvalues from solver rounding count as zero.
pub fn captured_variance_fraction(eigenvalues: ArrayView1<f64>, kept: usize) -> Option<f64> {
    let total: f64 = eigenvalues.iter().map(|&v| v.max(0.0)).sum();
    if total.is_nan() || total <= 0.0 {
        return None;
    }
    let captured: f64 = eigenvalues.iter().take(kept).map(|&v| v.max(0.0)).sum();
    Some((captured / total).clamp(0.0, 1.0))
}

// --- Utility Functions for Metrics ---

/// Computes Frobenius norm for an f64 matrix.
pub fn compute_frob_norm_f64(matrix: &ArrayView2<f64>) -> f64 {
    if matrix.is_empty() {
        return 0.0;
    }
    matrix.iter().map(|&x| x * x).sum::<f64>().sqrt()
}

/// Computes orthogonality error ||I - B Bᵀ||_F for a matrix whose rows are
/// expected to be orthonormal.
pub fn compute_row_orthogonality_error_f64(basis_rows: &ArrayView2<f64>) -> Option<f64> {
    if basis_rows.nrows() == 0 || basis_rows.ncols() == 0 {
        return None;
    }
    let gram = basis_rows.dot(&basis_rows.t());
    let identity = Array2::<f64>::eye(gram.nrows());
    let diff = identity - gram;

    Some(compute_frob_norm_f64(&diff.view()))
}
