pub mod kernel_regression;
pub mod lowess;

use std::fmt;

use ndarray::{Array2, Axis};
use num_traits::AsPrimitive;
use serde::{Deserialize, Serialize};

use crate::config::ReferenceConfig;
use crate::data::{Real, Sampling, SpeckleData};
use crate::error::{Result, RstError};
use crate::kernel::{kernel_radius, rbf};

pub use kernel_regression::kernel_regression;
pub use lowess::local_weighted_regression;

/// Reference image estimation algorithm.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReferenceMethod {
    /// Kernel-weighted average (Nadaraya-Watson).
    #[default]
    KernelRegression,
    /// Locally weighted first-order regression.
    Lowess,
}

impl fmt::Display for ReferenceMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReferenceMethod::KernelRegression => write!(f, "Kernel Regression"),
            ReferenceMethod::Lowess => write!(f, "LOWESS"),
        }
    }
}

/// Placement of the reference grid relative to the pixel-map coordinates.
///
/// A detector pixel `(j, k)` of frame `i` lands at reference position
/// `(u[0] - di[i] + n0, u[1] - dj[i] + m0)` pixels, i.e. at grid cell
/// coordinates obtained by dividing by the sampling interval.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReferenceBounds {
    pub n0: i64,
    pub m0: i64,
    pub height: usize,
    pub width: usize,
}

impl ReferenceBounds {
    pub fn from_data<I, T>(data: &SpeckleData<'_, I, T>, sampling: &Sampling) -> Self
    where
        I: AsPrimitive<f64> + Send + Sync,
        T: Real,
    {
        let map = data.pixel_map();
        let (u0_min, u0_max) = min_max(map.index_axis(Axis(0), 0).iter().map(|v| v.as_f64()));
        let (u1_min, u1_max) = min_max(map.index_axis(Axis(0), 1).iter().map(|v| v.as_f64()));
        let (di_min, di_max) = min_max(data.di().iter().map(|v| v.as_f64()));
        let (dj_min, dj_max) = min_max(data.dj().iter().map(|v| v.as_f64()));

        let n0 = (di_max - u0_min).ceil();
        let m0 = (dj_max - u1_min).ceil();
        let height = if data.is_one_dimensional() {
            1
        } else {
            ((u0_max - di_min + n0) / sampling.ds_y).floor() as usize + 1
        };
        let width = ((u1_max - dj_min + m0) / sampling.ds_x).floor() as usize + 1;

        Self {
            n0: n0 as i64,
            m0: m0 as i64,
            height,
            width,
        }
    }
}

fn min_max(values: impl Iterator<Item = f64>) -> (f64, f64) {
    values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    })
}

/// Estimated reference image together with its anchoring in the pixel-map
/// coordinate frame.
#[derive(Clone, Debug)]
pub struct ReferenceImage<T> {
    pub image: Array2<T>,
    pub n0: i64,
    pub m0: i64,
    pub sampling: Sampling,
}

impl<T: Real> ReferenceImage<T> {
    pub fn new(image: Array2<T>, n0: i64, m0: i64, sampling: Sampling) -> Result<Self> {
        sampling.validate()?;
        if image.is_empty() {
            return Err(RstError::EmptySequence);
        }
        Ok(Self {
            image,
            n0,
            m0,
            sampling,
        })
    }

    pub fn dim(&self) -> (usize, usize) {
        self.image.dim()
    }

    pub fn bounds(&self) -> ReferenceBounds {
        let (height, width) = self.image.dim();
        ReferenceBounds {
            n0: self.n0,
            m0: self.m0,
            height,
            width,
        }
    }

    /// Continuous row coordinate of a reference-plane position.
    #[inline]
    pub(crate) fn grid_y(&self, y: f64) -> f64 {
        (y + self.n0 as f64) / self.sampling.ds_y
    }

    /// Continuous column coordinate of a reference-plane position.
    #[inline]
    pub(crate) fn grid_x(&self, x: f64) -> f64 {
        (x + self.m0 as f64) / self.sampling.ds_x
    }
}

/// Estimate the reference image with the configured method.
pub fn update_reference<I, T>(
    data: &SpeckleData<'_, I, T>,
    config: &ReferenceConfig,
    threads: usize,
) -> Result<ReferenceImage<T>>
where
    I: AsPrimitive<f64> + Send + Sync,
    T: Real,
{
    match config.method {
        ReferenceMethod::KernelRegression => {
            kernel_regression(data, config.sampling, config.bandwidth, threads)
        }
        ReferenceMethod::Lowess => {
            local_weighted_regression(data, config.sampling, config.bandwidth, threads)
        }
    }
}

/// Set of reference cells a single sample reaches, with their kernel weights.
pub(crate) struct Footprint {
    height: usize,
    width: usize,
    ds_y: f64,
    ds_x: f64,
    bandwidth: f64,
    dn: i64,
    dm: i64,
    one_dimensional: bool,
}

impl Footprint {
    pub(crate) fn new(bounds: &ReferenceBounds, sampling: &Sampling, bandwidth: f64) -> Self {
        let one_dimensional = bounds.height == 1;
        Self {
            height: bounds.height,
            width: bounds.width,
            ds_y: sampling.ds_y,
            ds_x: sampling.ds_x,
            bandwidth,
            dn: if one_dimensional {
                0
            } else {
                kernel_radius(bandwidth, sampling.ds_y) as i64
            },
            dm: kernel_radius(bandwidth, sampling.ds_x) as i64,
            one_dimensional,
        }
    }

    /// Visit every cell within the kernel radius of the sample at reference
    /// position `(ss, fs)` (pixels). The callback receives the cell indices,
    /// the sample offset from the cell `(dy, dx)` and the kernel weight.
    #[inline]
    pub(crate) fn visit(&self, ss: f64, fs: f64, mut f: impl FnMut(usize, usize, f64, f64, f64)) {
        let jc = if self.one_dimensional {
            0
        } else {
            (ss / self.ds_y).round() as i64
        };
        let kc = (fs / self.ds_x).round() as i64;
        let j0 = (jc - self.dn).max(0);
        let j1 = (jc + self.dn).min(self.height as i64 - 1);
        let k0 = (kc - self.dm).max(0);
        let k1 = (kc + self.dm).min(self.width as i64 - 1);

        for jj in j0..=j1 {
            let dy = if self.one_dimensional {
                0.0
            } else {
                ss - jj as f64 * self.ds_y
            };
            for kk in k0..=k1 {
                let dx = fs - kk as f64 * self.ds_x;
                let r = rbf(dy * dy + dx * dx, self.bandwidth);
                f(jj as usize, kk as usize, dy, dx, r);
            }
        }
    }
}
