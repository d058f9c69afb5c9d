use std::f64::consts::TAU;

use ndarray::{s, Array1, Array2, Array3, ArrayView2, ArrayView3, Axis, Zip};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::data::{ensure_positive, Real};
use crate::error::{Result, RstError};

use super::integrate::integrate_gradients;

/// Experimental geometry needed to turn pixel displacements into phase.
///
/// All lengths in metres. Defocus values are signed distances from the
/// focus to the sample.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PhaseGeometry {
    /// Sample-to-detector distance `z`.
    pub distance: f64,
    pub defocus_y: f64,
    pub defocus_x: f64,
    pub y_pixel_size: f64,
    pub x_pixel_size: f64,
    pub wavelength: f64,
}

impl PhaseGeometry {
    pub fn validate(&self) -> Result<()> {
        ensure_positive("distance", self.distance)?;
        ensure_positive("y_pixel_size", self.y_pixel_size)?;
        ensure_positive("x_pixel_size", self.x_pixel_size)?;
        ensure_positive("wavelength", self.wavelength)?;
        for (name, f) in [("defocus_y", self.defocus_y), ("defocus_x", self.defocus_x)] {
            if f == 0.0 || !f.is_finite() {
                return Err(RstError::InvalidArgument(format!(
                    "{name} must be finite and non-zero, got {f}"
                )));
            }
        }
        Ok(())
    }

    /// Geometric magnification `|(z + f) / f|` along one axis.
    pub fn magnification(&self, defocus: f64) -> f64 {
        ((self.distance + defocus) / defocus).abs()
    }

    /// Scale turning a pixel displacement into a wavefront gradient along
    /// one axis: `p^2 / (z_eff * M)` with `z_eff = z * (1 - 1/M)`.
    fn gradient_scale(&self, defocus: f64, pixel_size: f64) -> Result<f64> {
        let mag = self.magnification(defocus);
        let z_eff = self.distance * (1.0 - 1.0 / mag);
        let scale = pixel_size * pixel_size / (z_eff * mag);
        if !scale.is_finite() {
            return Err(RstError::InvalidArgument(format!(
                "degenerate geometry: magnification {mag} gives no propagation distance"
            )));
        }
        Ok(scale)
    }
}

/// Displacement of the refined pixel map from the initial one, with the mean
/// of each component removed. Shape `(2, Y, X)`.
pub fn pixel_aberrations<T: Real>(
    initial: ArrayView3<'_, T>,
    refined: ArrayView3<'_, T>,
) -> Result<Array3<T>> {
    if initial.dim() != refined.dim() {
        return Err(RstError::ShapeMismatch(format!(
            "pixel maps differ in shape: {:?} vs {:?}",
            initial.dim(),
            refined.dim()
        )));
    }
    if initial.len_of(Axis(0)) != 2 {
        return Err(RstError::ShapeMismatch(format!(
            "pixel map must have 2 components, got {}",
            initial.len_of(Axis(0))
        )));
    }
    if initial.is_empty() {
        return Err(RstError::EmptySequence);
    }

    let mut out = Array3::<T>::from_elem(initial.dim(), T::from_f64(0.0));
    for c in 0..2 {
        let diff: Array2<f64> = Zip::from(refined.index_axis(Axis(0), c))
            .and(initial.index_axis(Axis(0), c))
            .map_collect(|r, i| r.as_f64() - i.as_f64());
        let mean = diff.mean().unwrap_or(0.0);
        out.slice_mut(s![c, .., ..])
            .zip_mut_with(&diff, |o, &d| *o = T::from_f64(d - mean));
    }
    Ok(out)
}

/// Wavefront phase (radians) from pixel aberrations.
///
/// Each displacement component is converted to a wavefront gradient with
/// the magnification of its axis, integrated with
/// [`integrate_gradients`] and scaled by `2 pi / wavelength`.
pub fn phase_from_aberrations<T: Real>(
    aberrations: ArrayView3<'_, T>,
    geometry: &PhaseGeometry,
    threads: usize,
) -> Result<Array2<T>> {
    geometry.validate()?;
    if aberrations.len_of(Axis(0)) != 2 {
        return Err(RstError::ShapeMismatch(format!(
            "aberrations must have 2 components, got {}",
            aberrations.len_of(Axis(0))
        )));
    }

    let scale_y = geometry.gradient_scale(geometry.defocus_y, geometry.y_pixel_size)?;
    let scale_x = geometry.gradient_scale(geometry.defocus_x, geometry.x_pixel_size)?;
    let sy = aberrations.index_axis(Axis(0), 0).mapv(|v| v.as_f64() * scale_y);
    let sx = aberrations.index_axis(Axis(0), 1).mapv(|v| v.as_f64() * scale_x);

    let phase = integrate_gradients(sy.view(), sx.view(), threads)?;
    let k = TAU / geometry.wavelength;
    info!(
        mag_y = geometry.magnification(geometry.defocus_y),
        mag_x = geometry.magnification(geometry.defocus_x),
        "Phase reconstructed"
    );
    Ok(phase.mapv(|v| T::from_f64(v * k)))
}

/// Sample translations in detector pixels from stage positions.
///
/// `translations` is `(N, 3)` in metres and `basis_vectors` `(N, 2, 3)` maps
/// the detector axes to the lab frame. Each frame's stage position is
/// projected on both basis vectors and magnified by `|z / f|`; the result is
/// referenced to the first frame and centred on zero mean. Returns `(di, dj)`.
pub fn pixel_translations<T: Real>(
    translations: ArrayView2<'_, T>,
    basis_vectors: ArrayView3<'_, T>,
    distance: f64,
    defocus_y: f64,
    defocus_x: f64,
) -> Result<(Array1<T>, Array1<T>)> {
    let n = translations.nrows();
    if n == 0 {
        return Err(RstError::EmptySequence);
    }
    if translations.ncols() != 3 || basis_vectors.dim() != (n, 2, 3) {
        return Err(RstError::ShapeMismatch(format!(
            "translations {:?} and basis vectors {:?} must be (N, 3) and (N, 2, 3)",
            translations.dim(),
            basis_vectors.dim()
        )));
    }
    ensure_positive("distance", distance)?;
    for (name, f) in [("defocus_y", defocus_y), ("defocus_x", defocus_x)] {
        if f == 0.0 || !f.is_finite() {
            return Err(RstError::InvalidArgument(format!(
                "{name} must be finite and non-zero, got {f}"
            )));
        }
    }

    let mag = [(distance / defocus_y).abs(), (distance / defocus_x).abs()];
    let mut shifts = Array2::<f64>::zeros((n, 2));
    for i in 0..n {
        for axis in 0..2 {
            let mut dot = 0.0;
            let mut norm = 0.0;
            for c in 0..3 {
                let basis = basis_vectors[[i, axis, c]].as_f64();
                dot += translations[[i, c]].as_f64() * basis;
                norm += basis * basis;
            }
            if norm <= 0.0 {
                return Err(RstError::InvalidArgument(format!(
                    "basis vector {axis} of frame {i} is zero"
                )));
            }
            shifts[[i, axis]] = dot * mag[axis] / norm;
        }
    }

    let first = shifts.row(0).to_owned();
    shifts -= &first;
    if let Some(mean) = shifts.mean_axis(Axis(0)) {
        shifts -= &mean;
    }

    let di = shifts.column(0).iter().map(|&v| T::from_f64(v)).collect();
    let dj = shifts.column(1).iter().map(|&v| T::from_f64(v)).collect();
    Ok((di, dj))
}
