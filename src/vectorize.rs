// src/vectorize.rs

//! Conversions between image space and vector space.
//!
//! Images are flattened in row-major (C) order: pixel `(row, col)` of an
//! `(H, W)` image lands at index `row * W + col` of its length `P = H * W`
//! vector. The reference stack `(N, H, W)` becomes an `N x P` matrix with one
//! reference per row. `unflatten` applies the inverse mapping.

use crate::error::KlipError;
use log::{debug, trace};
use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, ArrayView3, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Height and width of the images handled by one invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageShape {
    pub height: usize,
    pub width: usize,
}

impl ImageShape {
    pub fn new(height: usize, width: usize) -> Self {
        Self { height, width }
    }

    /// Number of pixels `P = H * W`.
    pub fn num_pixels(&self) -> usize {
        self.height * self.width
    }

    pub fn dims(&self) -> (usize, usize) {
        (self.height, self.width)
    }
}

/// The reference stack flattened to `N x P` with each row mean-centered.
///
/// Invariant: every row of `data` sums to zero within floating-point tolerance.
#[derive(Debug, Clone)]
pub struct ReferenceMatrix {
    /// Mean-centered reference vectors, one per row.
    /// Shape: `(num_references, num_pixels)`
    pub data: Array2<f64>,
    /// Mean removed from each reference, accumulated in `f64`.
    /// Shape: `(num_references)`
    pub row_means: Array1<f64>,
    /// Shape of the images the rows were flattened from.
    pub image_shape: ImageShape,
}

impl ReferenceMatrix {
    pub fn num_references(&self) -> usize { self.data.nrows() }
    pub fn num_pixels(&self) -> usize { self.data.ncols() }
}

/// Validates that the target `(H, W)` matches every image of an `(N, H, W)`
/// reference stack, that the stack is non-empty, and that the images have pixels.
pub fn check_shapes(
    target_dim: (usize, usize),
    references_dim: (usize, usize, usize),
) -> Result<ImageShape, KlipError> {
    let (num_references, ref_height, ref_width) = references_dim;
    if num_references == 0
        || target_dim != (ref_height, ref_width)
        || target_dim.0 == 0
        || target_dim.1 == 0
    {
        return Err(KlipError::ShapeMismatch {
            target: target_dim,
            references: references_dim,
        });
    }
    Ok(ImageShape::new(target_dim.0, target_dim.1))
}

/// Flattens a 2-D target image to a length-`P` `f64` vector. No mean is removed.
pub fn flatten_target<T: Copy + Into<f64>>(target: ArrayView2<T>) -> Array1<f64> {
    // `iter()` walks in logical row-major order whatever the memory layout.
    target.iter().map(|&pixel| pixel.into()).collect()
}

/// Flattens an `(N, H, W)` reference stack to an `N x P` matrix and removes
/// each row's own mean.
///
/// # Errors
/// `ShapeMismatch` if the stack holds no references or the images have no pixels.
pub fn vectorize_references<T: Copy + Into<f64>>(
    references: ArrayView3<T>,
) -> Result<ReferenceMatrix, KlipError> {
    let (num_references, height, width) = references.dim();
    if num_references == 0 || height == 0 || width == 0 {
        return Err(KlipError::ShapeMismatch {
            target: (height, width),
            references: references.dim(),
        });
    }
    let image_shape = ImageShape::new(height, width);
    let num_pixels = image_shape.num_pixels();

    let flat: Vec<f64> = references.iter().map(|&pixel| pixel.into()).collect();
    let mut data = Array2::from_shape_vec((num_references, num_pixels), flat).map_err(|_| {
        KlipError::ShapeMismatch { target: (height, width), references: references.dim() }
    })?;

    let row_means: Vec<f64> = data
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .map(|mut reference_row| {
            let mean = reference_row.iter().sum::<f64>() / num_pixels as f64;
            reference_row.mapv_inplace(|x| x - mean);
            mean
        })
        .collect();

    debug!(
        "Vectorized {} references of {}x{} pixels into a {}x{} matrix.",
        num_references, height, width, num_references, num_pixels
    );
    trace!("Reference row means: {:?}", row_means);

    Ok(ReferenceMatrix {
        data,
        row_means: Array1::from_vec(row_means),
        image_shape,
    })
}

/// Builds an `(N, H, W)` stack from individual images.
///
/// # Errors
/// `ShapeMismatch` for an empty slice, `ReferenceShapeMismatch` naming the
/// first image whose shape differs from image 0.
pub fn stack_references<T: Copy>(images: &[ArrayView2<T>]) -> Result<Array3<T>, KlipError> {
    let first = images.first().ok_or(KlipError::ShapeMismatch {
        target: (0, 0),
        references: (0, 0, 0),
    })?;
    let expected = first.dim();
    if let Some((index, image)) = images.iter().enumerate().find(|(_, image)| image.dim() != expected) {
        return Err(KlipError::ReferenceShapeMismatch {
            index,
            expected,
            found: image.dim(),
        });
    }
    ndarray::stack(Axis(0), images).map_err(|_| KlipError::ShapeMismatch {
        target: expected,
        references: (images.len(), expected.0, expected.1),
    })
}

/// Reshapes a length-`P` vector back to an `(H, W)` image (row-major).
pub fn unflatten(vector: Array1<f64>, shape: ImageShape) -> Result<Array2<f64>, KlipError> {
    let found = vector.len();
    vector
        .into_shape_with_order(shape.dims())
        .map_err(|_| KlipError::Reshape { shape: shape.dims(), found })
}

/// Arithmetic mean of a vector accumulated in `f64`; zero for an empty vector.
pub fn vector_mean(vector: ArrayView1<f64>) -> f64 {
    if vector.is_empty() {
        return 0.0;
    }
    vector.sum() / vector.len() as f64
}
