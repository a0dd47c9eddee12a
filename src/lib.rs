// PSF subtraction by Karhunen-Loeve image projection (KLIP)

#![doc = include_str!("../README.md")]

pub mod diagnostics;
pub mod error;
pub mod karhunen_loeve;
pub mod klip;
pub mod linalg_backends;
pub mod vectorize;

pub use diagnostics::KlipDiagnostics;
pub use error::KlipError;
pub use karhunen_loeve::{karhunen_loeve_transform, KarhunenLoeveTransform};
pub use klip::{
    subtract_psf, subtract_psf_batch, KlipConfig, KlipOutput, PsfSubtractor, TruncatedBasis,
    TruncationPolicy,
};
pub use vectorize::ImageShape;
