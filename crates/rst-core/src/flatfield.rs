use std::fmt;

use nalgebra::{DMatrix, SymmetricEigen};
use ndarray::{s, Array1, Array2, Array3, ArrayView2, ArrayView3, Axis, Zip};
use num_traits::AsPrimitive;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::consts::{DEFAULT_FLATFIELD_WINDOW, FLATFIELD_OUTLIER_SIGMAS};
use crate::data::Real;
use crate::error::{Result, RstError};
use crate::parallel::build_pool;
use crate::whitefield::compute_median;

/// Bad-pixel detection rule applied to every sample of the frame stack.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MaskMethod {
    /// Every sample is good.
    NoBad,
    /// Good samples lie in `[vmin, vmax)`.
    Range { vmin: f64, vmax: f64 },
    /// Good samples lie between the `pmin` and `pmax` percentiles of the
    /// whole stack, both inclusive.
    Percentile { pmin: f64, pmax: f64 },
}

impl Default for MaskMethod {
    fn default() -> Self {
        MaskMethod::Percentile {
            pmin: 0.0,
            pmax: 99.99,
        }
    }
}

impl MaskMethod {
    pub fn validate(&self) -> Result<()> {
        match *self {
            MaskMethod::NoBad => Ok(()),
            MaskMethod::Range { vmin, vmax } => {
                if vmin.is_nan() || vmax.is_nan() || vmin >= vmax {
                    return Err(RstError::InvalidArgument(format!(
                        "intensity range must satisfy vmin < vmax, got [{vmin}, {vmax})"
                    )));
                }
                Ok(())
            }
            MaskMethod::Percentile { pmin, pmax } => {
                if !(0.0..=100.0).contains(&pmin) || !(0.0..=100.0).contains(&pmax) || pmin > pmax
                {
                    return Err(RstError::InvalidArgument(format!(
                        "percentiles must satisfy 0 <= pmin <= pmax <= 100, got {pmin} and {pmax}"
                    )));
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for MaskMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaskMethod::NoBad => write!(f, "No bad pixels"),
            MaskMethod::Range { vmin, vmax } => write!(f, "Intensity range [{vmin}, {vmax})"),
            MaskMethod::Percentile { pmin, pmax } => {
                write!(f, "Percentile range [{pmin}%, {pmax}%]")
            }
        }
    }
}

/// How a freshly computed mask combines with the existing one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskUpdate {
    /// Replace the existing mask.
    #[default]
    Reset,
    /// Keep a sample only when both masks keep it.
    Multiply,
}

/// Flag bad samples of the frame stack.
///
/// Returns a mask of the same shape as `frames` where `true` marks a good
/// sample, combined with `mask` according to `update`.
pub fn update_mask<I>(
    frames: ArrayView3<'_, I>,
    mask: ArrayView3<'_, bool>,
    method: MaskMethod,
    update: MaskUpdate,
) -> Result<Array3<bool>>
where
    I: AsPrimitive<f64> + Send + Sync,
{
    check_stack(frames.dim())?;
    if mask.dim() != frames.dim() {
        return Err(RstError::ShapeMismatch(format!(
            "mask is {:?}, frames are {:?}",
            mask.dim(),
            frames.dim()
        )));
    }
    method.validate()?;

    let mut good = match method {
        MaskMethod::NoBad => Array3::from_elem(frames.dim(), true),
        MaskMethod::Range { vmin, vmax } => frames.mapv(|v| {
            let v: f64 = v.as_();
            v >= vmin && v < vmax
        }),
        MaskMethod::Percentile { pmin, pmax } => {
            let mut values: Vec<f64> = frames.iter().map(|v| v.as_()).collect();
            values.sort_unstable_by(f64::total_cmp);
            let lo = percentile(&values, pmin);
            let hi = percentile(&values, pmax);
            debug!(lo, hi, "Percentile mask bounds");
            frames.mapv(|v| {
                let v: f64 = v.as_();
                v >= lo && v <= hi
            })
        }
    };

    if update == MaskUpdate::Multiply {
        Zip::from(&mut good).and(&mask).for_each(|g, &m| *g &= m);
    }

    let bad = good.iter().filter(|g| !**g).count();
    info!(method = %method, ?update, bad, "Bad-pixel mask updated");
    Ok(good)
}

/// Linearly interpolated percentile of sorted, non-empty `values`.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    let last = sorted.len() - 1;
    let pos = q / 100.0 * last as f64;
    let lo = (pos.floor() as usize).min(last);
    let hi = (lo + 1).min(last);
    sorted[lo] + (pos - lo as f64) * (sorted[hi] - sorted[lo])
}

/// Principal components of the whitefield-subtracted frame stack.
#[derive(Clone, Debug)]
pub struct EigenFlatfields {
    /// `I - W` on good samples and 0 elsewhere, shape `(N, Y, X)`.
    pub corrected: Array3<f64>,
    /// Eigen flat fields ordered by decreasing eigenvalue, shape `(N, Y, X)`.
    pub fields: Array3<f64>,
    /// Share of the total variance described by each field.
    pub variance_ratio: Array1<f64>,
}

impl EigenFlatfields {
    /// Smallest number of leading fields that describe at least `fraction`
    /// of the variance.
    pub fn components_for(&self, fraction: f64) -> usize {
        let mut cumulative = 0.0;
        for (m, &ratio) in self.variance_ratio.iter().enumerate() {
            cumulative += ratio;
            if cumulative >= fraction {
                return m + 1;
            }
        }
        self.variance_ratio.len()
    }

    /// The `count` leading fields.
    pub fn leading(&self, count: usize) -> ArrayView3<'_, f64> {
        let count = count.min(self.fields.len_of(Axis(0)));
        self.fields.slice(s![..count, .., ..])
    }
}

/// Eigen flat fields of a frame stack.
///
/// The frames minus the whitefield (0 where `mask` is unset) form the
/// corrected stack; the eigenvectors of its `N x N` Gram matrix, applied to
/// the corrected frames, give one field per frame.
pub fn eigen_flatfields<I, T>(
    frames: ArrayView3<'_, I>,
    mask: Option<ArrayView3<'_, bool>>,
    whitefield: ArrayView2<'_, T>,
    threads: usize,
) -> Result<EigenFlatfields>
where
    I: AsPrimitive<f64> + Send + Sync,
    T: Real,
{
    let (n, h, w) = frames.dim();
    check_stack((n, h, w))?;
    check_whitefield(whitefield.dim(), (h, w))?;
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

    let corrected = Array3::from_shape_fn((n, h, w), |(i, j, k)| {
        if mask.as_ref().map_or(true, |m| m[[i, j, k]]) {
            let v: f64 = frames[[i, j, k]].as_();
            v - whitefield[[j, k]].as_f64()
        } else {
            0.0
        }
    });

    let gram_rows: Vec<Vec<f64>> = pool.install(|| {
        (0..n)
            .into_par_iter()
            .map(|a| {
                let frame_a = corrected.index_axis(Axis(0), a);
                (a..n)
                    .map(|b| {
                        Zip::from(&frame_a)
                            .and(&corrected.index_axis(Axis(0), b))
                            .fold(0.0, |acc, &x, &y| acc + x * y)
                    })
                    .collect()
            })
            .collect()
    });
    let gram = DMatrix::from_fn(n, n, |a, b| {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        gram_rows[lo][hi - lo]
    });

    let eigen = SymmetricEigen::new(gram);
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| eigen.eigenvalues[b].total_cmp(&eigen.eigenvalues[a]));

    let mut fields = Array3::<f64>::zeros((n, h, w));
    pool.install(|| {
        fields
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(m, mut field)| {
                let col = order[m];
                for (i, frame) in corrected.outer_iter().enumerate() {
                    field.scaled_add(eigen.eigenvectors[(i, col)], &frame);
                }
            });
    });

    let values: Vec<f64> = order.iter().map(|&m| eigen.eigenvalues[m].max(0.0)).collect();
    let total: f64 = values.iter().sum();
    let variance_ratio = if total > 0.0 {
        Array1::from_iter(values.iter().map(|v| v / total))
    } else {
        Array1::zeros(n)
    };
    info!(
        frames = n,
        leading = variance_ratio[0],
        "Eigen flat fields computed"
    );

    Ok(EigenFlatfields {
        corrected,
        fields,
        variance_ratio,
    })
}

/// Per-frame flat fields from a set of eigen flat fields.
///
/// Each corrected frame is projected onto every field and the projections
/// are added to the whitefield. Fields with zero norm are skipped. Pass only
/// the leading fields; the full set reproduces the corrected frames.
pub fn pca_flatfields<T>(
    corrected: ArrayView3<'_, f64>,
    fields: ArrayView3<'_, f64>,
    whitefield: ArrayView2<'_, T>,
    threads: usize,
) -> Result<Array3<T>>
where
    T: Real,
{
    let (n, h, w) = corrected.dim();
    check_stack((n, h, w))?;
    check_whitefield(whitefield.dim(), (h, w))?;
    if fields.dim().1 != h || fields.dim().2 != w {
        return Err(RstError::ShapeMismatch(format!(
            "eigen flat fields are {:?}, frames are {}x{}",
            fields.dim(),
            h,
            w
        )));
    }
    let pool = build_pool(threads)?;

    let norms: Vec<f64> = fields.outer_iter().map(|f| f.iter().map(|v| v * v).sum()).collect();
    let mut flats = Array3::<T>::from_elem((n, h, w), T::default());
    pool.install(|| {
        flats
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(i, mut flat)| {
                let frame = corrected.index_axis(Axis(0), i);
                let mut model: Array2<f64> = whitefield.mapv(|v| v.as_f64());
                for (field, &norm) in fields.outer_iter().zip(norms.iter()) {
                    if norm <= 0.0 {
                        continue;
                    }
                    let weight = Zip::from(&frame)
                        .and(&field)
                        .fold(0.0, |acc, &x, &y| acc + x * y)
                        / norm;
                    model.scaled_add(weight, &field);
                }
                Zip::from(&mut flat)
                    .and(&model)
                    .for_each(|dst, &v| *dst = T::from_f64(v));
            });
    });

    debug!(frames = n, fields = fields.len_of(Axis(0)), "PCA flat fields");
    Ok(flats)
}

/// Per-frame flat fields as a running median over neighbouring frames.
///
/// At every pixel the window spans `size` frames centred on the current one,
/// reflected at the ends of the stack. Samples further than
/// `3 * sqrt(W)` from the whitefield are left out; a window with no sample
/// left reads the whitefield.
pub fn median_flatfields<I, T>(
    frames: ArrayView3<'_, I>,
    whitefield: ArrayView2<'_, T>,
    size: usize,
    threads: usize,
) -> Result<Array3<T>>
where
    I: AsPrimitive<f64> + Send + Sync,
    T: Real,
{
    let (n, h, w) = frames.dim();
    check_stack((n, h, w))?;
    check_whitefield(whitefield.dim(), (h, w))?;
    if size == 0 {
        return Err(RstError::InvalidArgument(
            "median window must span at least one frame".into(),
        ));
    }
    let pool = build_pool(threads)?;
    let before = (size / 2) as isize;

    let rows: Vec<Array2<f64>> = pool.install(|| {
        (0..h)
            .into_par_iter()
            .map(|j| {
                let mut row = Array2::<f64>::zeros((n, w));
                let mut column = Vec::with_capacity(n);
                let mut keep = Vec::with_capacity(n);
                let mut window = Vec::with_capacity(size);
                for k in 0..w {
                    let white = whitefield[[j, k]].as_f64();
                    let limit = FLATFIELD_OUTLIER_SIGMAS * white.sqrt();
                    column.clear();
                    keep.clear();
                    for i in 0..n {
                        let v: f64 = frames[[i, j, k]].as_();
                        column.push(v);
                        keep.push((v - white).abs() < limit);
                    }
                    for i in 0..n {
                        window.clear();
                        for offset in 0..size as isize {
                            let idx = reflect(i as isize - before + offset, n);
                            if keep[idx] {
                                window.push(column[idx]);
                            }
                        }
                        row[[i, k]] = if window.is_empty() {
                            white
                        } else {
                            compute_median(&mut window)
                        };
                    }
                }
                row
            })
            .collect()
    });

    let flats = Array3::from_shape_fn((n, h, w), |(i, j, k)| T::from_f64(rows[j][[i, k]]));
    info!(frames = n, height = h, width = w, size, "Median flat fields estimated");
    Ok(flats)
}

/// Half-sample symmetric reflection of `idx` into `0..n`.
fn reflect(idx: isize, n: usize) -> usize {
    let n = n as isize;
    let period = 2 * n;
    let r = idx.rem_euclid(period);
    (if r >= n { period - 1 - r } else { r }) as usize
}

/// Flat-field generation method.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FlatfieldMethod {
    /// Running median over `size` neighbouring frames.
    Median { size: usize },
    /// Projection on the `components` leading eigen flat fields.
    Pca { components: usize },
}

impl Default for FlatfieldMethod {
    fn default() -> Self {
        FlatfieldMethod::Median {
            size: DEFAULT_FLATFIELD_WINDOW,
        }
    }
}

impl fmt::Display for FlatfieldMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlatfieldMethod::Median { size } => write!(f, "Median ({size} frames)"),
            FlatfieldMethod::Pca { components } => write!(f, "PCA ({components} components)"),
        }
    }
}

/// Per-frame flat fields with the chosen method.
pub fn update_flatfields<I, T>(
    frames: ArrayView3<'_, I>,
    mask: Option<ArrayView3<'_, bool>>,
    whitefield: ArrayView2<'_, T>,
    method: FlatfieldMethod,
    threads: usize,
) -> Result<Array3<T>>
where
    I: AsPrimitive<f64> + Send + Sync,
    T: Real,
{
    debug!(method = %method, threads, "Updating flat fields");
    match method {
        FlatfieldMethod::Median { size } => median_flatfields(frames, whitefield, size, threads),
        FlatfieldMethod::Pca { components } => {
            if components == 0 {
                return Err(RstError::InvalidArgument(
                    "PCA flat fields need at least one component".into(),
                ));
            }
            let eigen = eigen_flatfields(frames, mask, whitefield, threads)?;
            pca_flatfields(
                eigen.corrected.view(),
                eigen.leading(components),
                whitefield,
                threads,
            )
        }
    }
}

/// Rescale every frame by `W / F` with its flat field `F`, rounding to the
/// nearest count (ties to even). Samples with `F <= 0` keep their value.
pub fn flatfield_correction<I, T>(
    frames: ArrayView3<'_, I>,
    whitefield: ArrayView2<'_, T>,
    flatfields: ArrayView3<'_, T>,
) -> Result<Array3<T>>
where
    I: AsPrimitive<f64> + Send + Sync,
    T: Real,
{
    let (n, h, w) = frames.dim();
    check_stack((n, h, w))?;
    check_whitefield(whitefield.dim(), (h, w))?;
    if flatfields.dim() != frames.dim() {
        return Err(RstError::ShapeMismatch(format!(
            "flat fields are {:?}, frames are {:?}",
            flatfields.dim(),
            frames.dim()
        )));
    }

    Ok(Array3::from_shape_fn((n, h, w), |(i, j, k)| {
        let flat = flatfields[[i, j, k]].as_f64();
        let scale = if flat > 0.0 {
            whitefield[[j, k]].as_f64() / flat
        } else {
            1.0
        };
        let v: f64 = frames[[i, j, k]].as_();
        T::from_f64((v * scale).round_ties_even())
    }))
}

/// Indices of the frames with a positive total intensity.
pub fn non_empty_frames<I>(frames: ArrayView3<'_, I>) -> Vec<usize>
where
    I: AsPrimitive<f64> + Send + Sync,
{
    let good: Vec<usize> = frames
        .outer_iter()
        .enumerate()
        .filter(|(_, frame)| frame.iter().map(|v| v.as_()).sum::<f64>() > 0.0)
        .map(|(i, _)| i)
        .collect();
    debug!(
        frames = frames.len_of(Axis(0)),
        kept = good.len(),
        "Empty frames filtered"
    );
    good
}

fn check_stack(dim: (usize, usize, usize)) -> Result<()> {
    if dim.0 == 0 || dim.1 == 0 || dim.2 == 0 {
        return Err(RstError::EmptySequence);
    }
    Ok(())
}

fn check_whitefield(dim: (usize, usize), expected: (usize, usize)) -> Result<()> {
    if dim != expected {
        return Err(RstError::ShapeMismatch(format!(
            "whitefield is {:?}, frames are {}x{}",
            dim, expected.0, expected.1
        )));
    }
    Ok(())
}
