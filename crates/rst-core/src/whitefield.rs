use ndarray::{Array2, ArrayView3};
use num_traits::AsPrimitive;
use rayon::prelude::*;
use tracing::info;

use crate::data::Real;
use crate::error::{Result, RstError};
use crate::parallel::build_pool;

/// Per-pixel median of the frame stack.
///
/// With a `mask` of the same shape as `frames`, only the frames where the
/// mask is set take part at each pixel; pixels with no such frame read 0,
/// which marks them invalid for every later step. Rows are processed in
/// parallel.
pub fn median_whitefield<I, T>(
    frames: ArrayView3<'_, I>,
    mask: Option<ArrayView3<'_, bool>>,
    threads: usize,
) -> Result<Array2<T>>
where
    I: AsPrimitive<f64> + Send + Sync,
    T: Real,
{
    let (n, h, w) = frames.dim();
    if n == 0 || h == 0 || w == 0 {
        return Err(RstError::EmptySequence);
    }
    if let Some(mask) = &mask {
        if mask.dim() != frames.dim() {
            return Err(RstError::ShapeMismatch(format!(
                "mask is {:?}, frames are {:?}",
                mask.dim(),
                frames.dim()
            )));
        }
    }
    let pool = build_pool(threads)?;

    let rows: Vec<Vec<f64>> = pool.install(|| {
        (0..h)
            .into_par_iter()
            .map(|row| {
                let mut pixel_values = Vec::with_capacity(n);
                let mut row_result = vec![0.0f64; w];
                for (col, result) in row_result.iter_mut().enumerate() {
                    pixel_values.clear();
                    for i in 0..n {
                        if mask.as_ref().map_or(true, |m| m[[i, row, col]]) {
                            pixel_values.push(frames[[i, row, col]].as_());
                        }
                    }
                    *result = compute_median(&mut pixel_values);
                }
                row_result
            })
            .collect()
    });

    let mut result = Array2::<T>::from_elem((h, w), T::from_f64(0.0));
    let mut empty = 0usize;
    for (row, row_data) in rows.into_iter().enumerate() {
        for (col, val) in row_data.into_iter().enumerate() {
            if val == 0.0 {
                empty += 1;
            }
            result[[row, col]] = T::from_f64(val);
        }
    }
    info!(frames = n, height = h, width = w, empty, "Whitefield estimated");
    Ok(result)
}

pub(crate) fn compute_median(values: &mut [f64]) -> f64 {
    let n = values.len();
    if n == 0 {
        0.0
    } else if n % 2 == 1 {
        *values.select_nth_unstable_by(n / 2, |a, b| a.total_cmp(b)).1
    } else {
        let mid = n / 2;
        values.select_nth_unstable_by(mid, |a, b| a.total_cmp(b));
        let upper = values[mid];
        let lower = values[..mid]
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        (lower + upper) / 2.0
    }
}
