mod common;

use approx::assert_abs_diff_eq;
use ndarray::{Array1, Array2, Array3};
use rst_core::config::ReferenceConfig;
use rst_core::data::{Sampling, SpeckleData};
use rst_core::error::RstError;
use rst_core::reference::{
    kernel_regression, local_weighted_regression, update_reference, ReferenceBounds,
    ReferenceMethod,
};

use common::{identity_map, ramp};

/// Three identical frames of `pattern` with a flat whitefield, identity map
/// and zero translations.
fn still_scan(pattern: &Array2<f64>) -> (Array3<f64>, Array2<f64>, Array3<f64>, Array1<f64>) {
    let (h, w) = pattern.dim();
    let frames = Array3::from_shape_fn((3, h, w), |(_, j, k)| pattern[[j, k]]);
    (
        frames,
        Array2::ones((h, w)),
        identity_map(h, w),
        Array1::zeros(3),
    )
}

// ---------------------------------------------------------------------------
// Bounds
// ---------------------------------------------------------------------------

#[test]
fn test_bounds_follow_translations() {
    let frames = Array3::<f64>::ones((3, 5, 5));
    let wf = Array2::<f64>::ones((5, 5));
    let map = identity_map(5, 5);
    let di = Array1::from(vec![0.0, 1.0, 2.0]);
    let dj = Array1::zeros(3);
    let data = SpeckleData::new(frames.view(), wf.view(), map.view(), di.view(), dj.view())
        .unwrap();

    let bounds = ReferenceBounds::from_data(&data, &Sampling::default());
    assert_eq!(bounds.n0, 2);
    assert_eq!(bounds.m0, 0);
    assert_eq!(bounds.height, 7);
    assert_eq!(bounds.width, 5);

    let coarse = ReferenceBounds::from_data(&data, &Sampling::new(2.0, 1.0).unwrap());
    assert_eq!(coarse.height, 4);
    assert_eq!(coarse.width, 5);
}

#[test]
fn test_reference_shape_matches_bounds() {
    let pattern = ramp(6, 9);
    let (frames, wf, map, d) = still_scan(&pattern);
    let dj = Array1::from(vec![0.0, 0.5, 1.0]);
    let data = SpeckleData::new(frames.view(), wf.view(), map.view(), d.view(), dj.view())
        .unwrap();

    let sampling = Sampling::new(1.0, 0.5).unwrap();
    let bounds = ReferenceBounds::from_data(&data, &sampling);
    let kr = kernel_regression(&data, sampling, 1.0, 1).unwrap();
    let lw = local_weighted_regression(&data, sampling, 1.0, 1).unwrap();

    assert_eq!(kr.dim(), (bounds.height, bounds.width));
    assert_eq!(lw.dim(), (bounds.height, bounds.width));
    assert_eq!(kr.bounds(), bounds);
    assert_eq!(kr.n0, lw.n0);
    assert_eq!(kr.m0, lw.m0);
}

// ---------------------------------------------------------------------------
// Kernel regression
// ---------------------------------------------------------------------------

#[test]
fn test_kernel_regression_reproduces_still_pattern() {
    let pattern = ramp(5, 5);
    let (frames, wf, map, d) = still_scan(&pattern);
    let data =
        SpeckleData::new(frames.view(), wf.view(), map.view(), d.view(), d.view()).unwrap();

    let reference = kernel_regression(&data, Sampling::default(), 1.0, 1).unwrap();
    assert_eq!(reference.dim(), (5, 5));
    assert_eq!((reference.n0, reference.m0), (0, 0));

    for ((j, k), &v) in reference.image.indexed_iter() {
        assert!(
            (v - pattern[[j, k]]).abs() < 0.05,
            "cell ({j}, {k}): expected {}, got {v}",
            pattern[[j, k]]
        );
    }
    assert_abs_diff_eq!(reference.image[[2, 2]], pattern[[2, 2]], epsilon = 1e-12);
}

#[test]
fn test_kernel_regression_divides_out_whitefield() {
    let pattern = ramp(4, 6);
    let (h, w) = pattern.dim();
    let wf = Array2::from_shape_fn((h, w), |(j, k)| 0.5 + 0.25 * ((j + 2 * k) % 3) as f64);
    let frames = Array3::from_shape_fn((2, h, w), |(_, j, k)| wf[[j, k]] * 1.7);
    let map = identity_map(h, w);
    let d = Array1::zeros(2);
    let data =
        SpeckleData::new(frames.view(), wf.view(), map.view(), d.view(), d.view()).unwrap();

    let reference = kernel_regression(&data, Sampling::default(), 1.0, 1).unwrap();
    for &v in reference.image.iter() {
        assert_abs_diff_eq!(v, 1.7, epsilon = 1e-12);
    }
}

#[test]
fn test_unreached_cells_default_to_one() {
    let (h, w) = (5, 5);
    let mut wf = Array2::<f64>::zeros((h, w));
    wf[[0, 0]] = 2.0;
    let frames = Array3::from_shape_fn((2, h, w), |(_, j, k)| wf[[j, k]] * 1.3);
    let map = identity_map(h, w);
    let d = Array1::zeros(2);
    let data =
        SpeckleData::new(frames.view(), wf.view(), map.view(), d.view(), d.view()).unwrap();

    let reference = kernel_regression(&data, Sampling::default(), 0.5, 1).unwrap();
    assert_abs_diff_eq!(reference.image[[0, 0]], 1.3, epsilon = 1e-12);
    assert_eq!(reference.image[[4, 4]], 1.0);

    let lowess = local_weighted_regression(&data, Sampling::default(), 0.5, 1).unwrap();
    assert_eq!(lowess.image[[4, 4]], 1.0);
}

#[test]
fn test_kernel_regression_single_row() {
    let pattern = Array2::from_shape_fn((1, 12), |(_, k)| 1.0 + 0.05 * k as f64);
    let (frames, wf, map, d) = still_scan(&pattern);
    let data =
        SpeckleData::new(frames.view(), wf.view(), map.view(), d.view(), d.view()).unwrap();
    assert!(data.is_one_dimensional());

    let reference = kernel_regression(&data, Sampling::default(), 1.0, 1).unwrap();
    assert_eq!(reference.dim(), (1, 12));
    assert_abs_diff_eq!(reference.image[[0, 6]], pattern[[0, 6]], epsilon = 1e-3);

    let lowess = local_weighted_regression(&data, Sampling::default(), 1.0, 1).unwrap();
    for k in 0..12 {
        assert_abs_diff_eq!(lowess.image[[0, k]], pattern[[0, k]], epsilon = 1e-9);
    }
}

#[test]
fn test_kernel_regression_thread_count_does_not_change_result() {
    let scene = common::Scene::distorted(8, 10);
    let data = scene.data();
    let single = kernel_regression(&data, Sampling::default(), 1.0, 1).unwrap();
    for threads in [2, 3, 4] {
        let multi = kernel_regression(&data, Sampling::default(), 1.0, threads).unwrap();
        assert_eq!(multi.dim(), single.dim());
        for (a, b) in single.image.iter().zip(multi.image.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
        }
    }
}

#[test]
fn test_reference_repeats_exactly_at_fixed_thread_count() {
    let scene = common::Scene::scan(20, 30, 64);
    let data = scene.data();

    let kr = kernel_regression(&data, Sampling::default(), 1.3, 4).unwrap();
    let lw = local_weighted_regression(&data, Sampling::default(), 1.3, 4).unwrap();
    for _ in 0..10 {
        let kr_again = kernel_regression(&data, Sampling::default(), 1.3, 4).unwrap();
        let lw_again = local_weighted_regression(&data, Sampling::default(), 1.3, 4).unwrap();
        assert_eq!(kr_again.image, kr.image);
        assert_eq!(lw_again.image, lw.image);
    }
}

// ---------------------------------------------------------------------------
// LOWESS
// ---------------------------------------------------------------------------

#[test]
fn test_lowess_is_exact_on_linear_pattern() {
    let pattern = ramp(5, 5);
    let (frames, wf, map, d) = still_scan(&pattern);
    let data =
        SpeckleData::new(frames.view(), wf.view(), map.view(), d.view(), d.view()).unwrap();

    let reference = local_weighted_regression(&data, Sampling::default(), 1.0, 1).unwrap();
    for ((j, k), &v) in reference.image.indexed_iter() {
        assert!(
            (v - pattern[[j, k]]).abs() < 1e-9,
            "cell ({j}, {k}): expected {}, got {v}",
            pattern[[j, k]]
        );
    }
}

#[test]
fn test_lowess_beats_kernel_regression_at_edges() {
    let pattern = ramp(6, 6);
    let (frames, wf, map, d) = still_scan(&pattern);
    let data =
        SpeckleData::new(frames.view(), wf.view(), map.view(), d.view(), d.view()).unwrap();

    let kr = kernel_regression(&data, Sampling::default(), 1.5, 1).unwrap();
    let lw = local_weighted_regression(&data, Sampling::default(), 1.5, 1).unwrap();
    let kr_err = (kr.image[[0, 0]] - pattern[[0, 0]]).abs();
    let lw_err = (lw.image[[0, 0]] - pattern[[0, 0]]).abs();
    assert!(
        lw_err < kr_err,
        "LOWESS corner error {lw_err} should be below kernel regression {kr_err}"
    );
}

#[test]
fn test_lowess_thread_count_does_not_change_result() {
    let scene = common::Scene::distorted(8, 10);
    let data = scene.data();
    let single = local_weighted_regression(&data, Sampling::default(), 1.0, 1).unwrap();
    let multi = local_weighted_regression(&data, Sampling::default(), 1.0, 4).unwrap();
    for (a, b) in single.image.iter().zip(multi.image.iter()) {
        assert_abs_diff_eq!(*a, *b, epsilon = 1e-9);
    }
}

// ---------------------------------------------------------------------------
// Dispatch and validation
// ---------------------------------------------------------------------------

#[test]
fn test_update_reference_dispatches_on_method() {
    let scene = common::Scene::distorted(6, 7);
    let data = scene.data();
    let mut config = ReferenceConfig::default();

    let kr = update_reference(&data, &config, 1).unwrap();
    let direct = kernel_regression(&data, config.sampling, config.bandwidth, 1).unwrap();
    assert_eq!(kr.image, direct.image);

    config.method = ReferenceMethod::Lowess;
    let lw = update_reference(&data, &config, 1).unwrap();
    let direct = local_weighted_regression(&data, config.sampling, config.bandwidth, 1).unwrap();
    assert_eq!(lw.image, direct.image);
}

#[test]
fn test_data_rebinds_to_shorter_lived_arrays() {
    let scene = common::Scene::distorted(6, 7);
    let data = scene.data();
    let config = ReferenceConfig::default();
    let base = update_reference(&data, &config, 1).unwrap();

    let shifted = {
        let di = scene.di.mapv(|v| v + 1.0);
        let dj = scene.dj.clone();
        let moved = data.with_translations(di.view(), dj.view()).unwrap();
        update_reference(&moved, &config, 1).unwrap()
    };
    assert_eq!(shifted.n0, base.n0 + 1);
    assert_eq!(shifted.m0, base.m0);
    assert_eq!(shifted.dim(), base.dim());
    for (a, b) in shifted.image.iter().zip(base.image.iter()) {
        assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
    }

    let remapped = {
        let map = scene.true_map.clone();
        let moved = data.with_pixel_map(map.view()).unwrap();
        assert_eq!(moved.pixel_map(), scene.true_map.view());
        update_reference(&moved, &config, 1).unwrap()
    };
    assert!(remapped.image.iter().all(|v| v.is_finite()));
}

#[test]
fn test_reference_rejects_invalid_arguments() {
    let scene = common::Scene::distorted(4, 4);
    let data = scene.data();

    let bad_sampling = Sampling {
        ds_y: 0.0,
        ds_x: 1.0,
    };
    assert!(matches!(
        kernel_regression(&data, bad_sampling, 1.0, 1),
        Err(RstError::InvalidArgument(_))
    ));
    assert!(matches!(
        local_weighted_regression(&data, Sampling::default(), -1.0, 1),
        Err(RstError::InvalidArgument(_))
    ));
    assert!(matches!(
        kernel_regression(&data, Sampling::default(), 1.0, 0),
        Err(RstError::InvalidArgument(_))
    ));
}

#[test]
fn test_speckle_data_rejects_shape_mismatch() {
    let frames = Array3::<f64>::ones((2, 4, 4));
    let wf = Array2::<f64>::ones((4, 5));
    let map = identity_map(4, 4);
    let d = Array1::<f64>::zeros(2);
    let result = SpeckleData::new(frames.view(), wf.view(), map.view(), d.view(), d.view());
    assert!(matches!(result, Err(RstError::ShapeMismatch(_))));

    let wf = Array2::<f64>::ones((4, 4));
    let short = Array1::<f64>::zeros(1);
    let result = SpeckleData::new(frames.view(), wf.view(), map.view(), short.view(), d.view());
    assert!(matches!(result, Err(RstError::ShapeMismatch(_))));

    let empty = Array3::<f64>::ones((0, 4, 4));
    let none = Array1::<f64>::zeros(0);
    let result = SpeckleData::new(empty.view(), wf.view(), map.view(), none.view(), none.view());
    assert!(matches!(result, Err(RstError::EmptySequence)));
}

#[test]
fn test_integer_frames_are_accepted() {
    let frames = Array3::<u16>::from_elem((2, 4, 4), 3);
    let wf = Array2::<f32>::from_elem((4, 4), 1.5);
    let map = identity_map(4, 4).mapv(|v| v as f32);
    let d = Array1::<f32>::zeros(2);
    let data =
        SpeckleData::new(frames.view(), wf.view(), map.view(), d.view(), d.view()).unwrap();

    let reference = kernel_regression(&data, Sampling::default(), 1.0, 2).unwrap();
    for &v in reference.image.iter() {
        assert!((v - 2.0).abs() < 1e-5, "expected 3 / 1.5 = 2, got {v}");
    }
}
