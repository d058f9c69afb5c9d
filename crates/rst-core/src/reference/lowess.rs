use ndarray::{Array2, Zip};
use num_traits::AsPrimitive;
use tracing::{debug, info, warn};

use crate::data::{ensure_positive, Real, Sampling, SpeckleData};
use crate::error::Result;
use crate::parallel::{accumulate_frames, build_pool};

use super::{Footprint, ReferenceBounds, ReferenceImage};

/// Weighted running moments of the samples deposited into one reference cell.
///
/// Each sample carries its offset from the cell centre `(y, x)`, the
/// whitefield-scaled intensity `a = I * W`, the whitefield power `b = W^2`
/// and a kernel weight. Means and co-moments are updated incrementally so a
/// cell never stores its samples.
#[derive(Clone, Copy, Debug, Default)]
struct Moments {
    weight: f64,
    mean_y: f64,
    mean_x: f64,
    mean_a: f64,
    mean_b: f64,
    s_yy: f64,
    s_xx: f64,
    s_yx: f64,
    s_ya: f64,
    s_xa: f64,
    s_yb: f64,
    s_xb: f64,
}

impl Moments {
    #[inline]
    fn update(&mut self, y: f64, x: f64, a: f64, b: f64, r: f64) {
        if r <= 0.0 {
            return;
        }
        self.weight += r;
        let frac = r / self.weight;

        let dy = y - self.mean_y;
        let dx = x - self.mean_x;
        let da = a - self.mean_a;
        let db = b - self.mean_b;
        self.mean_y += dy * frac;
        self.mean_x += dx * frac;
        self.mean_a += da * frac;
        self.mean_b += db * frac;

        let ey = y - self.mean_y;
        let ex = x - self.mean_x;
        self.s_yy += r * dy * ey;
        self.s_xx += r * dx * ex;
        self.s_yx += r * dy * ex;
        self.s_ya += r * dy * (a - self.mean_a);
        self.s_xa += r * dx * (a - self.mean_a);
        self.s_yb += r * dy * (b - self.mean_b);
        self.s_xb += r * dx * (b - self.mean_b);
    }

    /// Pairwise combination of two partial moment sets.
    fn merge(&mut self, other: &Moments) {
        if other.weight <= 0.0 {
            return;
        }
        if self.weight <= 0.0 {
            *self = *other;
            return;
        }
        let weight = self.weight + other.weight;
        let f = self.weight * other.weight / weight;
        let frac = other.weight / weight;

        let dy = other.mean_y - self.mean_y;
        let dx = other.mean_x - self.mean_x;
        let da = other.mean_a - self.mean_a;
        let db = other.mean_b - self.mean_b;

        self.s_yy += other.s_yy + dy * dy * f;
        self.s_xx += other.s_xx + dx * dx * f;
        self.s_yx += other.s_yx + dy * dx * f;
        self.s_ya += other.s_ya + dy * da * f;
        self.s_xa += other.s_xa + dx * da * f;
        self.s_yb += other.s_yb + dy * db * f;
        self.s_xb += other.s_xb + dx * db * f;

        self.mean_y += dy * frac;
        self.mean_x += dx * frac;
        self.mean_a += da * frac;
        self.mean_b += db * frac;
        self.weight = weight;
    }

    /// Slopes of a response against the two offsets, given its co-moments.
    fn slopes(&self, s_ya: f64, s_xa: f64) -> (f64, f64) {
        let det = self.s_yy * self.s_xx - self.s_yx * self.s_yx;
        if det > 0.0 {
            (
                (self.s_xx * s_ya - self.s_yx * s_xa) / det,
                (self.s_yy * s_xa - self.s_yx * s_ya) / det,
            )
        } else {
            let by = if self.s_yy > 0.0 { s_ya / self.s_yy } else { 0.0 };
            let bx = if self.s_xx > 0.0 { s_xa / self.s_xx } else { 0.0 };
            (by, bx)
        }
    }

    /// Ratio of the two local linear fits evaluated at the cell centre.
    /// `None` when the cell received no usable weight.
    fn predict(&self) -> Option<f64> {
        if self.weight <= 0.0 {
            return None;
        }
        let (ay, ax) = self.slopes(self.s_ya, self.s_xa);
        let (by, bx) = self.slopes(self.s_yb, self.s_xb);
        let a = self.mean_a - ay * self.mean_y - ax * self.mean_x;
        let b = self.mean_b - by * self.mean_y - bx * self.mean_x;
        if b > 0.0 {
            Some(a / b)
        } else {
            None
        }
    }
}

/// Estimate the reference image by locally weighted linear regression.
///
/// Uses the same projection and kernel footprint as
/// [`kernel_regression`](super::kernel_regression), but every cell fits a
/// first-order model of `I * W` and `W^2` in the sample offset and evaluates
/// both at zero offset. This removes the first-order bias of the plain
/// weighted average near intensity gradients and at the grid edges.
pub fn local_weighted_regression<I, T>(
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
        "LOWESS reference"
    );

    let buffers = pool.install(|| {
        accumulate_frames(
            data.n_frames(),
            threads,
            || Array2::<Moments>::default((bounds.height, bounds.width)),
            |acc, i| deposit_frame(acc, data, i, &bounds, &footprint),
        )
    });

    let mut total = Array2::<Moments>::default((bounds.height, bounds.width));
    for acc in &buffers {
        Zip::from(&mut total)
            .and(acc)
            .for_each(|dst, src| dst.merge(src));
    }

    let empty = total.iter().filter(|m| m.predict().is_none()).count();
    let image = total.map(|m| T::from_f64(m.predict().unwrap_or(1.0)));
    if empty > 0 {
        warn!(
            "LOWESS: {} reference cells have no usable weight, set to 1.0",
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

fn deposit_frame<I, T>(
    acc: &mut Array2<Moments>,
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
            let a = data.intensity(i, j, k) * white;
            let b = white * white;
            let ss = data.map_y(j, k) + n0;
            let fs = data.map_x(j, k) + m0;

            footprint.visit(ss, fs, |jj, kk, dy, dx, r| {
                acc[[jj, kk]].update(dy, dx, a, b, r);
            });
        }
    }
}
