// In tests/klip_tests.rs

use approx::assert_abs_diff_eq;
use float_cmp::approx_eq;
use klip_psf::vectorize::stack_references;
use klip_psf::{
    karhunen_loeve_transform, subtract_psf, subtract_psf_batch, KlipConfig, KlipError, PsfSubtractor,
    TruncationPolicy,
};
use ndarray::{Array2, Array3, ArrayView1, ArrayView2, Axis};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

const DEFAULT_FLOAT_TOLERANCE_F64: f64 = 1e-9;

#[ctor::ctor]
unsafe fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Gaussian PSF core of the given side length.
fn psf_core(size: usize, sigma: f64) -> Array2<f64> {
    let center = (size as f64 - 1.0) / 2.0;
    Array2::from_shape_fn((size, size), |(r, c)| {
        let d2 = (r as f64 - center).powi(2) + (c as f64 - center).powi(2);
        (-d2 / (2.0 * sigma * sigma)).exp()
    })
}

/// Reference library: scaled PSF cores with a small amount of seeded noise.
fn reference_library(n_refs: usize, size: usize, seed: u64) -> Array3<f64> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let core = psf_core(size, size as f64 / 6.0);
    let noise = Array3::random_using((n_refs, size, size), Uniform::new(-0.01, 0.01), &mut rng);
    Array3::from_shape_fn((n_refs, size, size), |(k, r, c)| {
        (1.0 + 0.1 * k as f64) * core[[r, c]] + noise[[k, r, c]]
    })
}

/// Absolute Pearson correlation, invariant to the sign of eigenvectors.
fn abs_pearson_correlation_f64(vec_a: &ArrayView1<f64>, vec_b: &ArrayView1<f64>) -> Option<f64> {
    let n = vec_a.len();
    if n != vec_b.len() || n < 2 {
        return None;
    }
    let mean_a = vec_a.mean()?;
    let mean_b = vec_b.mean()?;
    let (mut cov_ab, mut var_a, mut var_b) = (0.0, 0.0, 0.0);
    for (&a, &b) in vec_a.iter().zip(vec_b.iter()) {
        cov_ab += (a - mean_a) * (b - mean_b);
        var_a += (a - mean_a).powi(2);
        var_b += (b - mean_b).powi(2);
    }
    if var_a < 1e-12 || var_b < 1e-12 {
        return None;
    }
    Some((cov_ab / (var_a.sqrt() * var_b.sqrt())).abs().clamp(0.0, 1.0))
}

fn assert_images_are_close(left: ArrayView2<f64>, right: ArrayView2<f64>, tolerance: f64, context: &str) {
    assert_eq!(left.dim(), right.dim(), "Image dimensions differ for {}", context);
    for ((idx, a), b) in left.indexed_iter().zip(right.iter()) {
        assert!(
            (a - b).abs() < tolerance,
            "Mismatch at {:?} for {}: {} vs {} (diff: {})",
            idx,
            context,
            a,
            b,
            (a - b).abs()
        );
    }
}

#[test]
fn test_planet_survives_psf_subtraction() {
    let size = 16;
    let references = reference_library(12, size, 2025);
    let core = psf_core(size, size as f64 / 6.0);

    // Target: brighter PSF plus a faint point source away from the core.
    let mut target = core.mapv(|v| 1.37 * v);
    let planet = (3, 12);
    target[planet] += 0.2;

    let output = subtract_psf(target.view(), references.view(), &KlipConfig::with_truncate(3)).unwrap();

    let peak_idx = output
        .residual_image
        .indexed_iter()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(idx, _)| idx)
        .unwrap();
    assert_eq!(peak_idx, planet, "brightest residual pixel should be the injected source");

    let target_energy: f64 = target.iter().map(|v| v * v).sum();
    let residual_energy: f64 = output.residual_image.iter().map(|v| v * v).sum();
    assert!(residual_energy < 0.1 * target_energy);
    assert!(output.error_map.iter().all(|&e| e >= 0.0));
}

#[test]
fn test_batch_matches_individual_calls() {
    let references = reference_library(8, 10, 7);
    let targets = reference_library(5, 10, 8).mapv(|v| 2.0 * v + 0.5);
    let config = KlipConfig::with_truncate(4);

    let batch = subtract_psf_batch(targets.view(), references.view(), &config).unwrap();
    assert_eq!(batch.len(), 5);
    for (i, batch_output) in batch.iter().enumerate() {
        let single = subtract_psf(targets.index_axis(Axis(0), i), references.view(), &config).unwrap();
        let context = format!("target {}", i);
        assert_images_are_close(batch_output.residual_image.view(), single.residual_image.view(), 1e-12, &context);
        assert_images_are_close(batch_output.psf_model_image.view(), single.psf_model_image.view(), 1e-12, &context);
        assert_images_are_close(batch_output.error_map.view(), single.error_map.view(), 1e-12, &context);
        assert_abs_diff_eq!(batch_output.target_mean, single.target_mean, epsilon = 1e-12);
    }

    let empty = Array3::<f64>::zeros((0, 10, 10));
    assert!(subtract_psf_batch(empty.view(), references.view(), &config).unwrap().is_empty());

    let wrong = Array3::<f64>::zeros((2, 10, 11));
    assert!(matches!(
        subtract_psf_batch(wrong.view(), references.view(), &config),
        Err(KlipError::ShapeMismatch { .. })
    ));
}

#[test]
fn test_concurrent_invocations_are_independent() {
    let libraries: Vec<Array3<f64>> = (0..4).map(|seed| reference_library(6, 8, 100 + seed)).collect();
    let sequential: Vec<Array2<f64>> = libraries
        .iter()
        .map(|refs| {
            subtract_psf(refs.index_axis(Axis(0), 0), refs.view(), &KlipConfig::with_truncate(2))
                .unwrap()
                .residual_image
        })
        .collect();

    let handles: Vec<_> = libraries
        .into_iter()
        .map(|refs| {
            std::thread::spawn(move || {
                subtract_psf(refs.index_axis(Axis(0), 0), refs.view(), &KlipConfig::with_truncate(2))
                    .unwrap()
                    .residual_image
            })
        })
        .collect();

    for (handle, expected) in handles.into_iter().zip(sequential.iter()) {
        let parallel = handle.join().expect("worker thread panicked");
        assert_images_are_close(parallel.view(), expected.view(), 1e-12, "threaded call");
    }
}

#[test]
fn test_single_precision_input_is_upcast() {
    let references_f64 = reference_library(6, 8, 55);
    let references_f32 = references_f64.mapv(|v| v as f32);
    let target_f32 = references_f32.index_axis(Axis(0), 2).mapv(|v| v * 1.5);

    let from_f32 = subtract_psf(target_f32.view(), references_f32.view(), &KlipConfig::with_truncate(3)).unwrap();
    let from_upcast = subtract_psf(
        target_f32.mapv(f64::from).view(),
        references_f32.mapv(f64::from).view(),
        &KlipConfig::with_truncate(3),
    )
    .unwrap();
    assert_images_are_close(
        from_f32.residual_image.view(),
        from_upcast.residual_image.view(),
        DEFAULT_FLOAT_TOLERANCE_F64,
        "f32 vs upcast residual",
    );
    assert!(approx_eq!(f64, from_f32.target_mean, from_upcast.target_mean, ulps = 2));
}

#[test]
fn test_integer_pixels_are_accepted() {
    let references = Array3::from_shape_fn((3, 4, 4), |(k, r, c)| ((k + 1) * (r * 4 + c + 1)) as u16);
    let target = Array2::from_shape_fn((4, 4), |(r, c)| (2 * (r * 4 + c + 1)) as u16);
    let output = subtract_psf(target.view(), references.view(), &KlipConfig::with_truncate(1)).unwrap();
    assert!(output.residual_image.iter().all(|v| v.abs() < 1e-9));
}

#[test]
fn test_subtractor_reuses_basis_across_targets() {
    let references = reference_library(10, 12, 77);
    let subtractor = PsfSubtractor::new(references.view(), &KlipConfig::with_truncate(5)).unwrap();
    assert_eq!(subtractor.rank(), 5);
    assert_eq!(subtractor.basis().num_pixels(), 144);

    for i in 0..3 {
        let target = references.index_axis(Axis(0), i);
        let reused = subtractor.subtract(target).unwrap();
        let fresh = subtract_psf(target, references.view(), &KlipConfig::with_truncate(5)).unwrap();
        assert_images_are_close(reused.residual_image.view(), fresh.residual_image.view(), 1e-12, "reused basis");
        assert_images_are_close(subtractor.error_map(), fresh.error_map.view(), 1e-12, "error map");
    }
}

#[test]
fn test_more_components_fit_references_better() {
    let references = reference_library(9, 10, 3);
    let target = references.index_axis(Axis(0), 4);
    let mut previous = f64::INFINITY;
    for k in 1..=9 {
        let output = subtract_psf(target, references.view(), &KlipConfig::with_truncate(k)).unwrap();
        let ssq: f64 = output.residual_image.iter().map(|v| v * v).sum();
        assert!(ssq <= previous + 1e-12, "K={} increased the residual: {} > {}", k, ssq, previous);
        previous = ssq;
    }
    assert!(previous < 1e-20, "full-rank fit of a reference should vanish, got {}", previous);
}

#[test]
fn test_kl_vectors_are_sign_invariant_matches_of_leading_pattern() {
    let references = reference_library(6, 12, 64);
    let stacked = references.view().into_shape_with_order((6, 144)).unwrap();
    let centered = &stacked - &stacked.mean_axis(Axis(1)).unwrap().insert_axis(Axis(1));

    let transform = karhunen_loeve_transform(centered.view(), true).unwrap();
    let core = psf_core(12, 2.0);
    let core_flat = core.view().into_shape_with_order(144).unwrap();

    // The dominant component is the PSF core, whatever its sign.
    let corr = abs_pearson_correlation_f64(&transform.kl_vectors.row(0), &core_flat).unwrap();
    assert!(corr > 0.99, "leading KL vector correlation with PSF core is {}", corr);
    for pair in transform.eigenvalues.windows(2) {
        assert!(pair[0] >= pair[1]);
    }
}

#[test]
fn test_slice_of_images_reference_library() {
    let a = psf_core(6, 1.5);
    let b = a.mapv(|v| 2.0 * v);
    let c = Array2::<f64>::zeros((6, 7));

    let stack = stack_references(&[a.view(), b.view()]).unwrap();
    let output = subtract_psf(a.view(), stack.view(), &KlipConfig::with_truncate(1)).unwrap();
    assert!(output.residual_image.iter().all(|v| v.abs() < 1e-9));

    let err = stack_references(&[a.view(), b.view(), c.view()]).unwrap_err();
    assert_eq!(err, KlipError::ReferenceShapeMismatch { index: 2, expected: (6, 6), found: (6, 7) });
}

#[test]
fn test_shape_mismatch_is_reported_before_computation() {
    let references = reference_library(3, 8, 1);
    let target = Array2::<f64>::zeros((8, 9));
    assert_eq!(
        subtract_psf(target.view(), references.view(), &KlipConfig::with_truncate(9)).unwrap_err(),
        KlipError::ShapeMismatch { target: (8, 9), references: (3, 8, 8) }
    );

    let no_refs = Array3::<f64>::zeros((0, 8, 8));
    let target = Array2::<f64>::zeros((8, 8));
    assert!(matches!(
        subtract_psf(target.view(), no_refs.view(), &KlipConfig::default()),
        Err(KlipError::ShapeMismatch { .. })
    ));
}

#[test]
fn test_config_loads_from_partial_json() {
    let config: KlipConfig = serde_json::from_str(r#"{ "truncate": 4 }"#).unwrap();
    assert_eq!(config, KlipConfig::with_truncate(4));
    assert!(config.normalize);
    assert_eq!(config.truncation_policy, TruncationPolicy::Reject);

    let config: KlipConfig =
        serde_json::from_str(r#"{ "truncate": 50, "normalize": false, "truncation_policy": "ClampToRank" }"#).unwrap();
    let references = reference_library(4, 6, 12);
    let output = subtract_psf(references.index_axis(Axis(0), 0), references.view(), &config).unwrap();
    assert_eq!(output.diagnostics.components_used, 4);

    let json = serde_json::to_string(&output.diagnostics).unwrap();
    assert!(json.contains("\"components_used\":4"));
}

#[test]
fn test_error_message_names_the_problem() {
    let err = KlipError::InvalidTruncation { requested: 7, available: 5 };
    assert_eq!(err.to_string(), "truncation rank 7 is outside 1..=5");
    let err = KlipError::DegenerateBasisVector { index: 2 };
    assert!(err.to_string().contains("zero norm"));
}

#[test]
fn test_rank_deficient_library_round_trip_with_clamping() {
    // Five references spanning two independent patterns.
    let a = psf_core(10, 1.5);
    let b = Array2::from_shape_fn((10, 10), |(r, c)| (r as f64 - 4.5) * 0.1 + (c as f64) * 0.01);
    let coefficients = [(1.0, 0.0), (0.0, 1.0), (1.0, 1.0), (2.0, -1.0), (0.5, 3.0)];
    let references = Array3::from_shape_fn((5, 10, 10), |(k, r, c)| {
        coefficients[k].0 * a[[r, c]] + coefficients[k].1 * b[[r, c]]
    });
    let target = a.mapv(|v| 1.7 * v) - &b.mapv(|v| 0.4 * v);

    assert!(matches!(
        subtract_psf(target.view(), references.view(), &KlipConfig::with_truncate(5)),
        Err(KlipError::DegenerateBasisVector { .. })
    ));

    let config = KlipConfig { truncate: 5, truncation_policy: TruncationPolicy::ClampToRank, ..KlipConfig::default() };
    let output = subtract_psf(target.view(), references.view(), &config).unwrap();
    assert_eq!(output.diagnostics.components_used, 2);
    let zeros = Array2::<f64>::zeros((10, 10));
    assert_images_are_close(output.residual_image.view(), zeros.view(), 1e-9, "clamped full-rank residual");
}
