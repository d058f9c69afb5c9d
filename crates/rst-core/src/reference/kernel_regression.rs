use ndarray::{Array2, Zip};
use num_traits::AsPrimitive;
use tracing::{debug, info, warn};

use crate::data::{ensure_positive, Real, Sampling, SpeckleData};
use crate::error::Result;
use crate::parallel::{accumulate_frames, build_pool};

use super::{Footprint, ReferenceBounds, ReferenceImage};

/// Weighted-average accumulation buffer for one worker.
struct KernelAccumulator {
    /// Sum of `I * W * rbf` per reference cell.
    numerator: Array2<f64>,
    /// Sum of `W^2 * rbf` per reference cell.
    denominator: Array2<f64>,
}

impl KernelAccumulator {
    fn new(height: usize, width: usize) -> Self {
        Self {
            numerator: Array2::zeros((height, width)),
            denominator: Array2::zeros((height, width)),
        }
    }

    fn merge(&mut self, other: &KernelAccumulator) {
        self.numerator += &other.numerator;
        self.denominator += &other.denominator;
    }

    /// Divide numerator by denominator; cells without weight read 1.0.
    fn finalize<T: Real>(self) -> (Array2<T>, usize) {
        let empty = self.denominator.iter().filter(|&&d| d <= 0.0).count();
        let image = Zip::from(&self.numerator)
            .and(&self.denominator)
            .map_collect(|&num, &den| {
                if den > 0.0 {
                    T::from_f64(num / den)
                } else {
                    T::from_f64(1.0)
                }
            });
        (image, empty)
    }
}

/// Estimate the reference image by kernel regression.
///
/// Every valid detector pixel of every frame is projected onto the reference
/// grid through the pixel map and the frame translation, and spread over the
/// cells within `ceil(4h / ds)` with Gaussian weights. Each cell is the ratio
/// of the `I * W` and `W^2` weighted sums, i.e. the least-squares estimate of
/// the transmission given the whitefield model `I = W * I0`.
///
/// Frames are distributed over `threads` workers with private accumulators
/// that are merged sequentially at the end.
pub fn kernel_regression<I, T>(
    data: &SpeckleData<'_, I, T>,
    sampling: Sampling,
    bandwidth: f64,
    threads: usize,
) -> Result<ReferenceImage<T>>
where
    I: AsPrimitive<f64> + Send + Sync,
    T: Real,
{
    sampling.validate()?;
    ensure_positive("bandwidth", bandwidth)?;
    let pool = build_pool(threads)?;

    let bounds = ReferenceBounds::from_data(data, &sampling);
    let footprint = Footprint::new(&bounds, &sampling, bandwidth);
    debug!(
        frames = data.n_frames(),
        height = bounds.height,
        width = bounds.width,
        bandwidth,
        threads,
        "Kernel regression reference"
    );

    let buffers = pool.install(|| {
        accumulate_frames(
            data.n_frames(),
            threads,
            || KernelAccumulator::new(bounds.height, bounds.width),
            |acc, i| deposit_frame(acc, data, i, &bounds, &footprint),
        )
    });

    let mut buffers = buffers.into_iter();
    let mut total = buffers
        .next()
        .unwrap_or_else(|| KernelAccumulator::new(bounds.height, bounds.width));
    for acc in buffers {
        total.merge(&acc);
    }

    let (image, empty) = total.finalize::<T>();
    if empty > 0 {
        warn!(
            "Kernel regression: {} reference cells received no contributions",
            empty
        );
    }
    info!(
        height = bounds.height,
        width = bounds.width,
        n0 = bounds.n0,
        m0 = bounds.m0,
        "Reference image estimated"
    );

    ReferenceImage::new(image, bounds.n0, bounds.m0, sampling)
}

/// Spread one frame over the reference grid.
fn deposit_frame<I, T>(
    acc: &mut KernelAccumulator,
    data: &SpeckleData<'_, I, T>,
    i: usize,
    bounds: &ReferenceBounds,
    footprint: &Footprint,
) where
    I: AsPrimitive<f64> + Send + Sync,
    T: Real,
{
    let n0 = bounds.n0 as f64 - data.shift_y(i);
    let m0 = bounds.m0 as f64 - data.shift_x(i);

    for j in 0..data.height() {
        for k in 0..data.width() {
            let white = data.white(j, k);
            if white <= 0.0 {
                continue;
            }
            let value = data.intensity(i, j, k) * white;
            let weight = white * white;
            let ss = data.map_y(j, k) + n0;
            let fs = data.map_x(j, k) + m0;

            footprint.visit(ss, fs, |jj, kk, _, _, r| {
                acc.numerator[[jj, kk]] += value * r;
                acc.denominator[[jj, kk]] += weight * r;
            });
        }
    }
}
