use std::f64::consts::TAU;

use crate::consts::KERNEL_TRUNCATION;

/// Gaussian radial basis weight of a squared distance `dsq` for bandwidth `h`.
///
/// `exp(-0.5 * dsq / h^2) / sqrt(2 * pi)`. The normalization is the 1D one on
/// purpose: the weight only ever appears in ratios.
#[inline]
pub fn rbf(dsq: f64, h: f64) -> f64 {
    (-0.5 * dsq / (h * h)).exp() / TAU.sqrt()
}

/// Number of grid cells on each side of a sample that the kernel reaches.
#[inline]
pub fn kernel_radius(h: f64, ds: f64) -> usize {
    (KERNEL_TRUNCATION * h / ds).ceil() as usize
}
