use ndarray::{Array2, Array3};
use rst_core::error::RstError;
use rst_core::whitefield::median_whitefield;

fn stack(values: &[f64]) -> Array3<f64> {
    Array3::from_shape_fn((values.len(), 2, 3), |(i, j, k)| values[i] + (j * 3 + k) as f64)
}

#[test]
fn test_odd_frame_count_takes_middle_value() {
    let frames = stack(&[5.0, 1.0, 3.0]);
    let white: Array2<f64> = median_whitefield(frames.view(), None, 1).unwrap();
    assert_eq!(white.dim(), (2, 3));
    for ((j, k), &v) in white.indexed_iter() {
        assert_eq!(v, 3.0 + (j * 3 + k) as f64);
    }
}

#[test]
fn test_even_frame_count_averages_middle_pair() {
    let frames = stack(&[1.0, 4.0, 2.0, 3.0]);
    let white: Array2<f64> = median_whitefield(frames.view(), None, 2).unwrap();
    assert_eq!(white[[0, 0]], 2.5);
    assert_eq!(white[[1, 2]], 7.5);
}

#[test]
fn test_mask_excludes_frames() {
    let frames = stack(&[1.0, 10.0, 2.0, 100.0, 3.0]);
    let mask = Array3::from_shape_fn(frames.dim(), |(i, _, _)| i % 2 == 0);
    let white: Array2<f64> = median_whitefield(frames.view(), Some(mask.view()), 1).unwrap();
    assert_eq!(white[[0, 0]], 2.0);
    assert_eq!(white[[1, 1]], 6.0);
}

#[test]
fn test_fully_masked_pixel_reads_zero() {
    let frames = stack(&[4.0, 6.0]);
    let mut mask = Array3::from_elem(frames.dim(), true);
    mask[[0, 1, 2]] = false;
    mask[[1, 1, 2]] = false;
    let white: Array2<f64> = median_whitefield(frames.view(), Some(mask.view()), 1).unwrap();
    assert_eq!(white[[1, 2]], 0.0);
    assert_eq!(white[[0, 0]], 5.0);
}

#[test]
fn test_integer_frames_and_thread_counts_agree() {
    let frames = Array3::from_shape_fn((5, 7, 6), |(i, j, k)| ((i * 7 + j * 3 + k) % 11) as u16);
    let one: Array2<f32> = median_whitefield(frames.view(), None, 1).unwrap();
    let four: Array2<f32> = median_whitefield(frames.view(), None, 4).unwrap();
    assert_eq!(one, four);
}

#[test]
fn test_whitefield_rejects_bad_input() {
    let frames = stack(&[1.0, 2.0]);
    let mask = Array3::from_elem((3, 2, 3), true);
    assert!(matches!(
        median_whitefield::<f64, f64>(frames.view(), Some(mask.view()), 1),
        Err(RstError::ShapeMismatch(_))
    ));

    let empty = Array3::<f64>::zeros((0, 2, 3));
    assert!(matches!(
        median_whitefield::<f64, f64>(empty.view(), None, 1),
        Err(RstError::EmptySequence)
    ));
}
