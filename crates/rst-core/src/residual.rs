use ndarray::{Array2, ArrayView2, Zip};
use num_traits::AsPrimitive;
use rayon::prelude::*;
use tracing::debug;

use crate::data::{ensure_positive, Real, SpeckleData};
use crate::error::{Result, RstError};
use crate::loss::Loss;
use crate::parallel::{accumulate_frames, build_pool};
use crate::reference::{Footprint, ReferenceImage};

/// Bilinear interpolation of `image` at continuous grid coordinates.
///
/// Coordinates are clamped to the image extent, so samples outside the grid
/// read the nearest edge value.
pub fn bilinear<T: Real>(image: ArrayView2<'_, T>, y: f64, x: f64) -> f64 {
    let (h, w) = image.dim();
    if h == 0 || w == 0 {
        return 0.0;
    }
    let y = y.clamp(0.0, (h - 1) as f64);
    let x = x.clamp(0.0, (w - 1) as f64);

    let y0 = y.floor() as usize;
    let x0 = x.floor() as usize;
    let y1 = (y0 + 1).min(h - 1);
    let x1 = (x0 + 1).min(w - 1);
    let fy = y - y0 as f64;
    let fx = x - x0 as f64;

    let top = image[[y0, x0]].as_f64() * (1.0 - fx) + image[[y0, x1]].as_f64() * fx;
    let bottom = image[[y1, x0]].as_f64() * (1.0 - fx) + image[[y1, x1]].as_f64() * fx;
    top * (1.0 - fy) + bottom * fy
}

/// Robust residual of the frame stack against a reference image.
///
/// Binds the data, the reference, the noise scale and the resolved loss once
/// so the per-pixel evaluations in the refiners carry no validation.
pub struct ResidualModel<'a, 'd, I, T> {
    data: &'a SpeckleData<'d, I, T>,
    reference: &'a ReferenceImage<T>,
    inv_sigma: f64,
    loss: fn(f64) -> f64,
}

impl<'a, 'd, I, T> ResidualModel<'a, 'd, I, T>
where
    I: AsPrimitive<f64> + Send + Sync,
    T: Real,
{
    pub fn new(
        data: &'a SpeckleData<'d, I, T>,
        reference: &'a ReferenceImage<T>,
        sigma: f64,
        loss: Loss,
    ) -> Result<Self> {
        ensure_positive("sigma", sigma)?;
        Ok(Self {
            data,
            reference,
            inv_sigma: 1.0 / sigma,
            loss: loss.function(),
        })
    }

    pub fn data(&self) -> &'a SpeckleData<'d, I, T> {
        self.data
    }

    /// Loss of frame `i` at pixel `(j, k)` if the pixel mapped to `(y, x)`
    /// and the frame were translated by `(di, dj)`.
    #[inline]
    #[allow(clippy::too_many_arguments)]
    fn sample_loss_at(&self, i: usize, j: usize, k: usize, y: f64, x: f64, di: f64, dj: f64) -> f64 {
        let reference = self.reference;
        let i0 = bilinear(
            reference.image.view(),
            reference.grid_y(y - di),
            reference.grid_x(x - dj),
        );
        let residual = self.data.intensity(i, j, k) - self.data.white(j, k) * i0;
        (self.loss)(residual * self.inv_sigma)
    }

    /// Loss of frame `i` at pixel `(j, k)` with the pixel mapped to `(y, x)`.
    #[inline]
    pub fn sample_loss(&self, i: usize, j: usize, k: usize, y: f64, x: f64) -> f64 {
        self.sample_loss_at(i, j, k, y, x, self.data.shift_y(i), self.data.shift_x(i))
    }

    /// Mean loss over all frames at pixel `(j, k)` mapped to `(y, x)`.
    pub fn fvu(&self, j: usize, k: usize, y: f64, x: f64) -> f64 {
        let n = self.data.n_frames();
        let total: f64 = (0..n).map(|i| self.sample_loss(i, j, k, y, x)).sum();
        total / n as f64
    }

    /// Mean loss and the variance of that mean.
    pub(crate) fn fvu_with_variance(&self, j: usize, k: usize, y: f64, x: f64) -> (f64, f64) {
        let n = self.data.n_frames();
        let mut mean = 0.0;
        let mut m2 = 0.0;
        for i in 0..n {
            let value = self.sample_loss(i, j, k, y, x);
            let delta = value - mean;
            mean += delta / (i + 1) as f64;
            m2 += delta * (value - mean);
        }
        (mean, m2 / (n * n) as f64)
    }

    /// Per-pixel sum of the loss over frames at the current pixel map and
    /// translations. Masked pixels read 0.
    pub fn baseline(&self, threads: usize) -> Result<Array2<f64>> {
        let pool = build_pool(threads)?;
        let (h, w) = (self.data.height(), self.data.width());
        let n = self.data.n_frames();

        let rows: Vec<Vec<f64>> = pool.install(|| {
            (0..h)
                .into_par_iter()
                .map(|j| {
                    (0..w)
                        .map(|k| {
                            if !self.data.is_valid(j, k) {
                                return 0.0;
                            }
                            let (y, x) = (self.data.map_y(j, k), self.data.map_x(j, k));
                            (0..n).map(|i| self.sample_loss(i, j, k, y, x)).sum()
                        })
                        .collect()
                })
                .collect()
        });

        rows_to_array(rows, w)
    }

    /// Mean loss at pixel `(j, k)` with frame `i` moved to `(di, dj)` and all
    /// other frames left where `baseline` was computed.
    pub fn fvu_translation(
        &self,
        baseline: &Array2<f64>,
        i: usize,
        j: usize,
        k: usize,
        di: f64,
        dj: f64,
    ) -> f64 {
        let (y, x) = (self.data.map_y(j, k), self.data.map_x(j, k));
        let old = self.sample_loss(i, j, k, y, x);
        let new = self.sample_loss_at(i, j, k, y, x, di, dj);
        (baseline[[j, k]] - old + new) / self.data.n_frames() as f64
    }
}

/// Mean robust residual of pixel `(j, k)` over all frames, with the pixel
/// mapped to reference-plane position `(y, x)`.
#[allow(clippy::too_many_arguments)]
pub fn fvu_interp<I, T>(
    data: &SpeckleData<'_, I, T>,
    reference: &ReferenceImage<T>,
    j: usize,
    k: usize,
    y: f64,
    x: f64,
    sigma: f64,
    loss: Loss,
) -> Result<f64>
where
    I: AsPrimitive<f64> + Send + Sync,
    T: Real,
{
    check_pixel(data, j, k)?;
    let model = ResidualModel::new(data, reference, sigma, loss)?;
    Ok(model.fvu(j, k, y, x))
}

/// Mean robust residual of pixel `(j, k)` after moving frame `i` to
/// `(di, dj)`, computed incrementally from a baseline table produced by
/// [`ResidualModel::baseline`].
#[allow(clippy::too_many_arguments)]
pub fn fvu_translation<I, T>(
    data: &SpeckleData<'_, I, T>,
    reference: &ReferenceImage<T>,
    baseline: &Array2<f64>,
    frame: usize,
    j: usize,
    k: usize,
    shift: (f64, f64),
    sigma: f64,
    loss: Loss,
) -> Result<f64>
where
    I: AsPrimitive<f64> + Send + Sync,
    T: Real,
{
    check_pixel(data, j, k)?;
    if frame >= data.n_frames() {
        return Err(RstError::InvalidArgument(format!(
            "frame index {} out of range for {} frames",
            frame,
            data.n_frames()
        )));
    }
    if baseline.dim() != (data.height(), data.width()) {
        return Err(RstError::ShapeMismatch(format!(
            "baseline is {:?}, detector is {}x{}",
            baseline.dim(),
            data.height(),
            data.width()
        )));
    }
    let model = ResidualModel::new(data, reference, sigma, loss)?;
    Ok(model.fvu_translation(baseline, frame, j, k, shift.0, shift.1))
}

/// Per-pixel mean residual at the current pixel map. Masked pixels read 0.
pub fn pixel_errors<I, T>(
    data: &SpeckleData<'_, I, T>,
    reference: &ReferenceImage<T>,
    sigma: f64,
    loss: Loss,
    threads: usize,
) -> Result<Array2<T>>
where
    I: AsPrimitive<f64> + Send + Sync,
    T: Real,
{
    let model = ResidualModel::new(data, reference, sigma, loss)?;
    let n = data.n_frames() as f64;
    let baseline = model.baseline(threads)?;
    Ok(baseline.mapv(|v| T::from_f64(v / n)))
}

/// Mean of [`pixel_errors`] over valid pixels.
pub fn total_error<I, T>(
    data: &SpeckleData<'_, I, T>,
    reference: &ReferenceImage<T>,
    sigma: f64,
    loss: Loss,
    threads: usize,
) -> Result<f64>
where
    I: AsPrimitive<f64> + Send + Sync,
    T: Real,
{
    let errors = pixel_errors(data, reference, sigma, loss, threads)?;
    let valid = data.valid_count();
    if valid == 0 {
        return Ok(0.0);
    }
    let sum: f64 = errors
        .indexed_iter()
        .filter(|((j, k), _)| data.is_valid(*j, *k))
        .map(|(_, v)| v.as_f64())
        .sum();
    let mean = sum / valid as f64;
    debug!(valid, mean, "Total residual");
    Ok(mean)
}

/// Loss sum and kernel weight deposited into every reference cell.
struct ErrorAccumulator {
    sum: Array2<f64>,
    weight: Array2<f64>,
}

impl ErrorAccumulator {
    fn new(height: usize, width: usize) -> Self {
        Self {
            sum: Array2::zeros((height, width)),
            weight: Array2::zeros((height, width)),
        }
    }
}

fn reference_error_sums<I, T>(
    data: &SpeckleData<'_, I, T>,
    reference: &ReferenceImage<T>,
    bandwidth: f64,
    sigma: f64,
    loss: Loss,
    threads: usize,
) -> Result<ErrorAccumulator>
where
    I: AsPrimitive<f64> + Send + Sync,
    T: Real,
{
    ensure_positive("bandwidth", bandwidth)?;
    let model = ResidualModel::new(data, reference, sigma, loss)?;
    let pool = build_pool(threads)?;
    let bounds = reference.bounds();
    let footprint = Footprint::new(&bounds, &reference.sampling, bandwidth);

    let buffers = pool.install(|| {
        accumulate_frames(
            data.n_frames(),
            threads,
            || ErrorAccumulator::new(bounds.height, bounds.width),
            |acc, i| {
                let n0 = bounds.n0 as f64 - data.shift_y(i);
                let m0 = bounds.m0 as f64 - data.shift_x(i);
                for j in 0..data.height() {
                    for k in 0..data.width() {
                        if !data.is_valid(j, k) {
                            continue;
                        }
                        let (y, x) = (data.map_y(j, k), data.map_x(j, k));
                        let value = model.sample_loss(i, j, k, y, x);
                        footprint.visit(y + n0, x + m0, |jj, kk, _, _, r| {
                            acc.sum[[jj, kk]] += value * r;
                            acc.weight[[jj, kk]] += r;
                        });
                    }
                }
            },
        )
    });

    let mut total = ErrorAccumulator::new(bounds.height, bounds.width);
    for acc in &buffers {
        total.sum += &acc.sum;
        total.weight += &acc.weight;
    }
    Ok(total)
}

/// Kernel-weighted mean residual of every reference cell. Cells no sample
/// reaches read 0.
pub fn reference_errors<I, T>(
    data: &SpeckleData<'_, I, T>,
    reference: &ReferenceImage<T>,
    bandwidth: f64,
    sigma: f64,
    loss: Loss,
    threads: usize,
) -> Result<Array2<T>>
where
    I: AsPrimitive<f64> + Send + Sync,
    T: Real,
{
    let acc = reference_error_sums(data, reference, bandwidth, sigma, loss, threads)?;
    let mut errors = Array2::from_elem(acc.sum.dim(), T::from_f64(0.0));
    Zip::from(&mut errors)
        .and(&acc.sum)
        .and(&acc.weight)
        .for_each(|e, &s, &w| {
            if w > 0.0 {
                *e = T::from_f64(s / w);
            }
        });
    Ok(errors)
}

/// Mean and population standard deviation of [`reference_errors`] over the
/// cells that received weight.
pub fn reference_total_error<I, T>(
    data: &SpeckleData<'_, I, T>,
    reference: &ReferenceImage<T>,
    bandwidth: f64,
    sigma: f64,
    loss: Loss,
    threads: usize,
) -> Result<(f64, f64)>
where
    I: AsPrimitive<f64> + Send + Sync,
    T: Real,
{
    let acc = reference_error_sums(data, reference, bandwidth, sigma, loss, threads)?;
    let values: Vec<f64> = acc
        .sum
        .iter()
        .zip(acc.weight.iter())
        .filter(|(_, w)| **w > 0.0)
        .map(|(&s, &w)| s / w)
        .collect();
    if values.is_empty() {
        return Ok((0.0, 0.0));
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    Ok((mean, var.sqrt()))
}

fn check_pixel<I, T>(data: &SpeckleData<'_, I, T>, j: usize, k: usize) -> Result<()>
where
    I: AsPrimitive<f64> + Send + Sync,
    T: Real,
{
    if j >= data.height() || k >= data.width() {
        return Err(RstError::InvalidArgument(format!(
            "pixel ({}, {}) outside the {}x{} detector",
            j,
            k,
            data.height(),
            data.width()
        )));
    }
    Ok(())
}

/// Assemble row vectors produced by a row-parallel pass.
pub(crate) fn rows_to_array(rows: Vec<Vec<f64>>, width: usize) -> Result<Array2<f64>> {
    let height = rows.len();
    if let Some((j, row)) = rows.iter().enumerate().find(|(_, row)| row.len() != width) {
        return Err(RstError::ShapeMismatch(format!(
            "row {} has {} values, expected {}",
            j,
            row.len(),
            width
        )));
    }
    let flat: Vec<f64> = rows.into_iter().flatten().collect();
    Array2::from_shape_vec((height, width), flat)
        .map_err(|err| RstError::ShapeMismatch(err.to_string()))
}
