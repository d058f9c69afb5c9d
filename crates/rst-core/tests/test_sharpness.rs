mod common;

use approx::assert_abs_diff_eq;
use ndarray::Array2;
use rst_core::config::ReferenceConfig;
use rst_core::error::RstError;
use rst_core::sharpness::{defocus_sweep, local_variance, r_characteristic};

use common::Scene;

#[test]
fn test_flat_image_has_zero_contrast() {
    let image = Array2::<f64>::from_elem((8, 9), 2.0);
    assert_abs_diff_eq!(r_characteristic(image.view(), 3).unwrap(), 0.0, epsilon = 1e-12);
}

#[test]
fn test_local_variance_crops_filtered_axes() {
    let image = Array2::<f64>::ones((10, 12));
    assert_eq!(local_variance(image.view(), 3).unwrap().dim(), (7, 9));

    let strip = Array2::<f64>::ones((2, 20));
    assert_eq!(local_variance(strip.view(), 3).unwrap().dim(), (2, 17));
}

#[test]
fn test_alternating_pattern_contrast() {
    let image = Array2::from_shape_fn((1, 10), |(_, k)| if k % 2 == 0 { 1.0 } else { 3.0 });
    let r = local_variance(image.view(), 2).unwrap();
    assert_eq!(r.dim(), (1, 8));
    for &v in r.iter() {
        assert_abs_diff_eq!(v, 0.25, epsilon = 1e-12);
    }
}

#[test]
fn test_sharper_image_scores_higher() {
    let sharp = Array2::from_shape_fn((12, 12), |(j, k)| if (j + k) % 2 == 0 { 0.5 } else { 1.5 });
    let soft = sharp.mapv(|v| 1.0 + 0.2 * (v - 1.0));
    let r_sharp = r_characteristic(sharp.view(), 3).unwrap();
    let r_soft = r_characteristic(soft.view(), 3).unwrap();
    assert!(r_sharp > r_soft, "{r_sharp} should exceed {r_soft}");
}

#[test]
fn test_zero_window_is_rejected() {
    let image = Array2::<f64>::ones((4, 4));
    assert!(matches!(
        local_variance(image.view(), 0),
        Err(RstError::InvalidArgument(_))
    ));
}

#[test]
fn test_defocus_sweep_scores_every_trial() {
    let scene = Scene::distorted(6, 8);
    let data = scene.data();
    let defoci = [(1e-3, 1e-3), (2e-3, 2e-3), (-1e-3, 5e-4)];

    let samples = defocus_sweep(&data, &defoci, &ReferenceConfig::default(), 3, 2).unwrap();
    assert_eq!(samples.len(), 3);
    for (sample, &(fy, fx)) in samples.iter().zip(defoci.iter()) {
        assert_eq!(sample.defocus_y, fy);
        assert_eq!(sample.defocus_x, fx);
        assert!(sample.r_value.is_finite());
        assert!(sample.r_value >= 0.0);
    }
}

#[test]
fn test_defocus_sweep_first_trial_matches_direct_estimate() {
    let scene = Scene::distorted(6, 8);
    let data = scene.data();
    let config = ReferenceConfig::default();

    let samples = defocus_sweep(&data, &[(1e-3, 1e-3)], &config, 3, 1).unwrap();
    let reference = rst_core::reference::update_reference(&data, &config, 1).unwrap();
    let direct = r_characteristic(reference.image.view(), 3).unwrap();
    assert_abs_diff_eq!(samples[0].r_value, direct, epsilon = 1e-12);
}

#[test]
fn test_defocus_sweep_scales_input_translations_once() {
    let scene = Scene::distorted(6, 8);
    let data = scene.data();
    let config = ReferenceConfig::default();
    let defoci = [(1e-3, 2e-3), (2e-3, 1e-3), (4e-3, 4e-3)];

    let samples = defocus_sweep(&data, &defoci, &config, 3, 1).unwrap();
    for (sample, &(fy, fx)) in samples.iter().zip(defoci.iter()).skip(1) {
        let di = scene.di.mapv(|v| v * (defoci[0].0 / fy).abs());
        let dj = scene.dj.mapv(|v| v * (defoci[0].1 / fx).abs());
        let trial = data.with_translations(di.view(), dj.view()).unwrap();
        let reference = rst_core::reference::update_reference(&trial, &config, 1).unwrap();
        let direct = r_characteristic(reference.image.view(), 3).unwrap();
        assert_abs_diff_eq!(sample.r_value, direct, epsilon = 1e-12);
    }
}

#[test]
fn test_defocus_sweep_rejects_invalid_trials() {
    let scene = Scene::distorted(4, 4);
    let data = scene.data();
    let config = ReferenceConfig::default();

    assert!(matches!(
        defocus_sweep(&data, &[], &config, 3, 1),
        Err(RstError::EmptySequence)
    ));
    assert!(matches!(
        defocus_sweep(&data, &[(1e-3, 1e-3), (0.0, 1e-3)], &config, 3, 1),
        Err(RstError::InvalidArgument(_))
    ));
}
