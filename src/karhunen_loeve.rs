// src/karhunen_loeve.rs

//! Karhunen-Loeve transform of a mean-centered reference library.
//!
//! The reference stack is short and wide (`N` references, `P >> N` pixels),
//! so the eigenproblem is solved on the `N x N` covariance between references
//! rather than the `P x P` pixel covariance, then mapped back into pixel space.

use crate::error::KlipError;
use crate::linalg_backends::{BackendEigh, LinAlgBackendProvider};
use log::{debug, trace, warn};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

/// Result of a Karhunen-Loeve transform.
///
/// The spectral members share one ordering: component `i` has eigenvalue
/// `eigenvalues[i]`, eigenvector `eigenvectors.column(i)` and pixel-space
/// basis vector `kl_vectors.row(i)`, with eigenvalues non-increasing.
#[derive(Debug, Clone)]
pub struct KarhunenLoeveTransform {
    /// Pixel-space KL basis vectors, one per row.
    /// Shape: `(num_references, num_pixels)`
    pub kl_vectors: Array2<f64>,
    /// Covariance eigenvalues in descending order.
    /// Shape: `(num_references)`
    pub eigenvalues: Array1<f64>,
    /// Covariance eigenvectors as columns, reordered to match `eigenvalues`.
    /// Shape: `(num_references, num_references)`
    pub eigenvectors: Array2<f64>,
    /// L2 norm of each KL vector before any normalization.
    /// Shape: `(num_references)`
    pub raw_norms: Array1<f64>,
    /// Whether `kl_vectors` were scaled to unit L2 norm.
    pub normalized: bool,
}

impl KarhunenLoeveTransform {
    pub fn num_components(&self) -> usize { self.kl_vectors.nrows() }
    pub fn num_pixels(&self) -> usize { self.kl_vectors.ncols() }
}

/// Covariance between the rows of `matrix`, treating each row as a variable
/// observed over the columns.
///
/// Rows are re-centered before the product, so the result is `X Xᵀ / (P - 1)`
/// for centered `X`. With a single column the divisor is 1.
pub fn covariance_of_rows(matrix: ArrayView2<f64>) -> Array2<f64> {
    let (num_rows, num_cols) = matrix.dim();
    if num_rows == 0 || num_cols == 0 {
        return Array2::zeros((num_rows, num_rows));
    }
    let row_means = matrix.sum_axis(Axis(1)) / num_cols as f64;
    let centered = &matrix - &row_means.insert_axis(Axis(1));

    let divisor = if num_cols > 1 { (num_cols - 1) as f64 } else { 1.0 };
    let mut covariance = centered.dot(&centered.t());
    covariance /= divisor;
    covariance
}

/// Reorders the columns of a matrix by `order`.
pub fn reorder_columns_owned(matrix: &Array2<f64>, order: &[usize]) -> Array2<f64> {
    if order.is_empty() {
        return Array2::zeros((matrix.nrows(), 0));
    }
    matrix.select(Axis(1), order)
}

/// Reorders the elements of a vector by `order`.
pub fn reorder_array_owned(array: &Array1<f64>, order: &[usize]) -> Array1<f64> {
    if order.is_empty() {
        return Array1::zeros(0);
    }
    array.select(Axis(0), order)
}

/// Indices that sort `values` in descending order.
///
/// The sort is stable and uses `total_cmp`, so NaN never panics; tied values
/// keep the order the solver produced them in.
pub fn descending_order(values: &Array1<f64>) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[b].total_cmp(&values[a]));
    order
}

/// Norm below which a KL vector is numerically zero: `max_norm * max(N, P) * EPSILON`,
/// the singular-value cutoff used for numerical rank.
pub fn degeneracy_tolerance(norms: ArrayView1<f64>, num_pixels: usize) -> f64 {
    let max_norm = norms.iter().fold(0.0_f64, |acc, &norm| acc.max(norm));
    max_norm * norms.len().max(num_pixels) as f64 * f64::EPSILON
}

/// Number of leading KL vectors whose norm clears [`degeneracy_tolerance`].
///
/// Norms follow the descending eigenvalue order, so the first degenerate
/// vector ends the numerically independent part of the basis.
pub fn numerical_rank(norms: ArrayView1<f64>, num_pixels: usize) -> usize {
    let tolerance = degeneracy_tolerance(norms, num_pixels);
    norms.iter().position(|&norm| norm <= tolerance).unwrap_or(norms.len())
}

/// Divides each row of `rows` by the matching entry of `norms`.
///
/// A row is degenerate when its norm is at or below [`degeneracy_tolerance`]
/// of `norms`. Such a row is rounding noise of a rank-deficient library;
/// scaled to unit length it would not be orthogonal to the others.
///
/// # Errors
/// `DegenerateBasisVector` naming the first degenerate row; `rows` is left
/// untouched in that case.
pub fn normalize_rows(rows: &mut Array2<f64>, norms: ArrayView1<f64>) -> Result<(), KlipError> {
    let tolerance = degeneracy_tolerance(norms, rows.ncols());
    if let Some(index) = norms.iter().position(|&norm| norm <= tolerance) {
        debug!(
            "KL vector {} has norm {:e}, at or below the tolerance {:e}.",
            index, norms[index], tolerance
        );
        return Err(KlipError::DegenerateBasisVector { index });
    }
    for (mut row, &norm) in rows.axis_iter_mut(Axis(0)).zip(norms.iter()) {
        row /= norm;
    }
    Ok(())
}

/// Computes the KL transform of a mean-centered `N x P` reference matrix
/// with the compile-time selected eigensolver.
///
/// # Errors
/// - `DegenerateBasisVector` if `normalize` is set and a KL vector is numerically zero.
/// - `Eigendecomposition` if the backend fails.
pub fn karhunen_loeve_transform(
    reference_matrix: ArrayView2<f64>,
    normalize: bool,
) -> Result<KarhunenLoeveTransform, KlipError> {
    let backend = LinAlgBackendProvider::<f64>::new();
    karhunen_loeve_transform_with_backend(reference_matrix, normalize, &backend)
}

/// As [`karhunen_loeve_transform`], with an explicit eigensolver.
pub fn karhunen_loeve_transform_with_backend<B: BackendEigh<f64>>(
    reference_matrix: ArrayView2<f64>,
    normalize: bool,
    backend: &B,
) -> Result<KarhunenLoeveTransform, KlipError> {
    let (num_references, num_pixels) = reference_matrix.dim();
    debug!(
        "Computing KL transform of {} references over {} pixels (normalize = {}).",
        num_references, num_pixels, normalize
    );

    // 1) N x N covariance between references
    let covariance = covariance_of_rows(reference_matrix);

    // 2) Symmetric eigendecomposition, resorted descending
    let eigh = backend
        .eigh_upper(&covariance)
        .map_err(|e| KlipError::Eigendecomposition { reason: e.to_string() })?;
    let order = descending_order(&eigh.eigenvalues);
    let eigenvalues = reorder_array_owned(&eigh.eigenvalues, &order);
    let eigenvectors = reorder_columns_owned(&eigh.eigenvectors, &order);
    debug!("Covariance eigenvalues (descending): {:?}", eigenvalues);

    if num_references > 0 {
        let largest = eigenvalues[0];
        let smallest = eigenvalues[num_references - 1];
        if smallest < -(largest.abs() * 1e-9) {
            warn!(
                "Smallest covariance eigenvalue {:e} is negative beyond rounding (largest {:e}).",
                smallest, largest
            );
        }
    }

    // 3) Project eigenvectors back into pixel space
    let mut kl_vectors = eigenvectors.t().dot(&reference_matrix);
    let raw_norms = kl_vectors.map_axis(Axis(1), |row| row.dot(&row).sqrt());
    trace!("Raw KL vector norms: {:?}", raw_norms);

    // 4) Optional unit normalization
    if normalize {
        normalize_rows(&mut kl_vectors, raw_norms.view())?;
    }

    Ok(KarhunenLoeveTransform {
        kl_vectors,
        eigenvalues,
        eigenvectors,
        raw_norms,
        normalized: normalize,
    })
}
