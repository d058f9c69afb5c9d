use std::f64::consts::TAU;
use std::sync::Arc;

use ndarray::{Array2, ArrayView2, Axis};
use num_complex::Complex;
use rayon::prelude::*;
use rustfft::{Fft, FftPlanner};
use tracing::debug;

use crate::data::Real;
use crate::error::{Result, RstError};
use crate::parallel::build_pool;

/// Reconstruct a scalar field from its vertical and horizontal gradients.
///
/// Both gradients are extended antisymmetrically to a `2Y x 2X` grid so the
/// field they describe is even about the array edges, then the Poisson
/// problem is solved in Fourier space:
/// `S = (fy * Sy + fx * Sx) / (2 pi i (fx^2 + fy^2))`. The mean of the field
/// cannot be recovered and is fixed at zero.
pub fn integrate_gradients<T: Real>(
    sy: ArrayView2<'_, T>,
    sx: ArrayView2<'_, T>,
    threads: usize,
) -> Result<Array2<T>> {
    if sy.dim() != sx.dim() {
        return Err(RstError::ShapeMismatch(format!(
            "gradient shapes differ: {:?} vs {:?}",
            sy.dim(),
            sx.dim()
        )));
    }
    let (a, b) = sy.dim();
    if a == 0 || b == 0 {
        return Err(RstError::EmptySequence);
    }
    let pool = build_pool(threads)?;
    debug!(height = a, width = b, threads, "Integrating gradients");

    let (ny, nx) = (2 * a, 2 * b);
    let mut planner = FftPlanner::<f64>::new();
    let forward = (planner.plan_fft_forward(nx), planner.plan_fft_forward(ny));
    let inverse = (planner.plan_fft_inverse(nx), planner.plan_fft_inverse(ny));

    let result = pool.install(|| {
        let mut spec_y = antisymmetric_extension(&sy, Parity::Vertical);
        let mut spec_x = antisymmetric_extension(&sx, Parity::Horizontal);
        fft2d_in_place(&mut spec_y, &forward.0, &forward.1);
        fft2d_in_place(&mut spec_x, &forward.0, &forward.1);

        let mut field = Array2::<Complex<f64>>::zeros((ny, nx));
        field
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(row, mut line)| {
                let fy = fft_frequency(row, ny);
                for (col, value) in line.iter_mut().enumerate() {
                    let fx = fft_frequency(col, nx);
                    let norm = fx * fx + fy * fy;
                    if norm == 0.0 {
                        continue;
                    }
                    let numerator = spec_y[[row, col]] * fy + spec_x[[row, col]] * fx;
                    *value = numerator / Complex::new(0.0, TAU * norm);
                }
            });

        fft2d_in_place(&mut field, &inverse.0, &inverse.1);

        let scale = 1.0 / (ny * nx) as f64;
        let mut out = Array2::<T>::from_elem((a, b), T::from_f64(0.0));
        for ((i, j), v) in out.indexed_iter_mut() {
            *v = T::from_f64(field[[a + i, b + j]].re * scale);
        }
        out
    });

    Ok(result)
}

/// Which gradient component is being extended.
#[derive(Clone, Copy)]
enum Parity {
    Vertical,
    Horizontal,
}

/// Place `g` in the lower-right quadrant of a doubled grid and fill the
/// other quadrants with mirror images, flipping the sign of the component
/// along each mirrored axis.
fn antisymmetric_extension<T: Real>(g: &ArrayView2<'_, T>, parity: Parity) -> Array2<Complex<f64>> {
    let (a, b) = g.dim();
    let mut ext = Array2::<Complex<f64>>::zeros((2 * a, 2 * b));
    let (flip_y, flip_x) = match parity {
        Parity::Vertical => (-1.0, 1.0),
        Parity::Horizontal => (1.0, -1.0),
    };

    for i in 0..a {
        for j in 0..b {
            let mirrored = g[[a - i - 1, b - j - 1]].as_f64();
            ext[[i, j]] = Complex::new(flip_y * flip_x * mirrored, 0.0);
            ext[[a + i, j]] = Complex::new(flip_x * g[[i, b - j - 1]].as_f64(), 0.0);
            ext[[i, b + j]] = Complex::new(flip_y * g[[a - i - 1, j]].as_f64(), 0.0);
            ext[[a + i, b + j]] = Complex::new(g[[i, j]].as_f64(), 0.0);
        }
    }
    ext
}

/// Sample frequency of bin `k` of an `n`-point transform, in cycles per
/// sample.
fn fft_frequency(k: usize, n: usize) -> f64 {
    if k < n.div_ceil(2) {
        k as f64 / n as f64
    } else {
        (k as f64 - n as f64) / n as f64
    }
}

/// Unnormalized 2D transform: rows then columns, each in parallel.
fn fft2d_in_place(
    data: &mut Array2<Complex<f64>>,
    row_plan: &Arc<dyn Fft<f64>>,
    col_plan: &Arc<dyn Fft<f64>>,
) {
    transform_lanes(data, Axis(0), row_plan);
    transform_lanes(data, Axis(1), col_plan);
}

fn transform_lanes(data: &mut Array2<Complex<f64>>, axis: Axis, plan: &Arc<dyn Fft<f64>>) {
    data.axis_iter_mut(axis).into_par_iter().for_each(|mut lane| {
        let mut buffer: Vec<Complex<f64>> = lane.to_vec();
        plan.process(&mut buffer);
        for (dst, src) in lane.iter_mut().zip(buffer) {
            *dst = src;
        }
    });
}
