use ndarray::{Array1, Array2, ArrayView2, Axis, Zip};
use num_traits::AsPrimitive;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::ReferenceConfig;
use crate::data::{Real, SpeckleData};
use crate::error::{Result, RstError};
use crate::reference::update_reference;

/// Local variance contrast `(<I^2> - <I>^2) / <I>^2` of an image.
///
/// Local means use a `size`-wide box along every axis longer than `size`;
/// the filtered axes are cropped to the `n - size` fully supported windows
/// (`size / 2` samples in front, `ceil(size / 2)` behind). Points with zero
/// local mean read 0.
pub fn local_variance<T: Real>(image: ArrayView2<'_, T>, size: usize) -> Result<Array2<f64>> {
    if size == 0 {
        return Err(RstError::InvalidArgument(
            "local variance window must be at least 1".into(),
        ));
    }
    if image.is_empty() {
        return Err(RstError::EmptySequence);
    }

    let mut mean = image.mapv(|v| v.as_f64());
    let mut mean_sq = image.mapv(|v| v.as_f64() * v.as_f64());
    for axis in [Axis(0), Axis(1)] {
        if mean.len_of(axis) > size {
            mean = box_filter(&mean, axis, size);
            mean_sq = box_filter(&mean_sq, axis, size);
        }
    }

    let mut r = Array2::<f64>::zeros(mean.dim());
    Zip::from(&mut r)
        .and(&mean)
        .and(&mean_sq)
        .for_each(|r, &m, &m2| {
            if m != 0.0 {
                *r = (m2 - m * m) / (m * m);
            }
        });
    Ok(r)
}

/// Mean of [`local_variance`]; larger values mean a sharper reference.
pub fn r_characteristic<T: Real>(image: ArrayView2<'_, T>, size: usize) -> Result<f64> {
    let r = local_variance(image, size)?;
    Ok(r.mean().unwrap_or(0.0))
}

/// One point of a defocus sweep.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DefocusSample {
    pub defocus_y: f64,
    pub defocus_x: f64,
    /// R-characteristic of the reference estimated at this defocus.
    pub r_value: f64,
}

/// Estimate the reference at a series of trial defocus distances and score
/// each by its R-characteristic.
///
/// The translations in `data` must correspond to the first trial. For every
/// trial `(f_y, f_x)` they are rescaled by `|f_y0 / f_y|` and `|f_x0 / f_x|`
/// before the reference is re-estimated. The sharpest reference marks the
/// best defocus estimate.
///
/// Every trial rescales the input translations directly. Scores therefore
/// differ from a sweep that rescales one shared set of translations in
/// place, where the factors of earlier trials compound.
pub fn defocus_sweep<I, T>(
    data: &SpeckleData<'_, I, T>,
    defoci: &[(f64, f64)],
    config: &ReferenceConfig,
    size: usize,
    threads: usize,
) -> Result<Vec<DefocusSample>>
where
    I: AsPrimitive<f64> + Send + Sync,
    T: Real,
{
    let Some(&(base_y, base_x)) = defoci.first() else {
        return Err(RstError::EmptySequence);
    };
    if let Some(&(fy, fx)) = defoci
        .iter()
        .find(|(fy, fx)| *fy == 0.0 || *fx == 0.0 || !fy.is_finite() || !fx.is_finite())
    {
        return Err(RstError::InvalidArgument(format!(
            "defocus must be finite and non-zero, got ({fy}, {fx})"
        )));
    }
    config.validate()?;
    debug!(trials = defoci.len(), size, threads, "Defocus sweep");

    let mut samples = Vec::with_capacity(defoci.len());
    for &(defocus_y, defocus_x) in defoci {
        let scale_y = (base_y / defocus_y).abs();
        let scale_x = (base_x / defocus_x).abs();
        let di: Array1<T> = data.di().mapv(|v| T::from_f64(v.as_f64() * scale_y));
        let dj: Array1<T> = data.dj().mapv(|v| T::from_f64(v.as_f64() * scale_x));
        let trial = data.with_translations(di.view(), dj.view())?;

        let reference = update_reference(&trial, config, threads)?;
        let r_value = r_characteristic(reference.image.view(), size)?;
        debug!(defocus_y, defocus_x, r_value, "Defocus trial");
        samples.push(DefocusSample {
            defocus_y,
            defocus_x,
            r_value,
        });
    }

    if let Some(best) = samples
        .iter()
        .max_by(|a, b| a.r_value.total_cmp(&b.r_value))
    {
        info!(
            defocus_y = best.defocus_y,
            defocus_x = best.defocus_x,
            r_value = best.r_value,
            "Defocus sweep complete"
        );
    }
    Ok(samples)
}

/// Box mean of width `size` along `axis`, keeping the `n - size` windows
/// that never touch the border.
fn box_filter(input: &Array2<f64>, axis: Axis, size: usize) -> Array2<f64> {
    let out_len = input.len_of(axis) - size;
    let inv = 1.0 / size as f64;

    let mut shape = [input.nrows(), input.ncols()];
    shape[axis.index()] = out_len;
    let mut out = Array2::<f64>::zeros((shape[0], shape[1]));

    for (src, mut dst) in input
        .lanes(axis)
        .into_iter()
        .zip(out.lanes_mut(axis).into_iter())
    {
        let mut sum: f64 = (0..size).map(|t| src[t]).sum();
        for (o, value) in dst.iter_mut().enumerate() {
            *value = sum * inv;
            sum += src[o + size] - src[o];
        }
    }
    out
}
