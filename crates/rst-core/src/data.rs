use std::fmt;

use ndarray::{ArrayView1, ArrayView2, ArrayView3};
use num_traits::AsPrimitive;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RstError};

/// Floating-point element type of pixel maps, whitefields, translations,
/// reference images and gradients. Arithmetic always runs in `f64`; this
/// trait only converts at the array boundary.
pub trait Real: Copy + Default + PartialOrd + Send + Sync + fmt::Debug + 'static {
    fn as_f64(self) -> f64;
    fn from_f64(value: f64) -> Self;
}

impl Real for f32 {
    #[inline]
    fn as_f64(self) -> f64 {
        self as f64
    }

    #[inline]
    fn from_f64(value: f64) -> Self {
        value as f32
    }
}

impl Real for f64 {
    #[inline]
    fn as_f64(self) -> f64 {
        self
    }

    #[inline]
    fn from_f64(value: f64) -> Self {
        value
    }
}

/// Read-only bundle of everything a speckle-tracking step consumes.
///
/// - `frames`: measured intensities, shape `(N, Y, X)`
/// - `whitefield`: detector flat field, shape `(Y, X)`; pixels `<= 0` are masked
/// - `pixel_map`: reference-plane coordinate of each pixel, shape `(2, Y, X)`
/// - `di`, `dj`: per-frame sample translation in pixels, length `N`
#[derive(Clone, Copy, Debug)]
pub struct SpeckleData<'a, I, T> {
    frames: ArrayView3<'a, I>,
    whitefield: ArrayView2<'a, T>,
    pixel_map: ArrayView3<'a, T>,
    di: ArrayView1<'a, T>,
    dj: ArrayView1<'a, T>,
}

impl<'a, I, T> SpeckleData<'a, I, T>
where
    I: AsPrimitive<f64> + Send + Sync,
    T: Real,
{
    pub fn new(
        frames: ArrayView3<'a, I>,
        whitefield: ArrayView2<'a, T>,
        pixel_map: ArrayView3<'a, T>,
        di: ArrayView1<'a, T>,
        dj: ArrayView1<'a, T>,
    ) -> Result<Self> {
        let (n, h, w) = frames.dim();
        if n == 0 || h == 0 || w == 0 {
            return Err(RstError::EmptySequence);
        }
        if whitefield.dim() != (h, w) {
            return Err(RstError::ShapeMismatch(format!(
                "whitefield is {:?}, frames are {}x{}",
                whitefield.dim(),
                h,
                w
            )));
        }
        if pixel_map.dim() != (2, h, w) {
            return Err(RstError::ShapeMismatch(format!(
                "pixel map is {:?}, expected (2, {}, {})",
                pixel_map.dim(),
                h,
                w
            )));
        }
        if di.len() != n || dj.len() != n {
            return Err(RstError::ShapeMismatch(format!(
                "translations have {} and {} entries for {} frames",
                di.len(),
                dj.len(),
                n
            )));
        }

        Ok(Self {
            frames,
            whitefield,
            pixel_map,
            di,
            dj,
        })
    }

    /// Same data with a different pixel map. The result borrows for the
    /// shorter of the two lifetimes.
    pub fn with_pixel_map<'b>(
        &self,
        pixel_map: ArrayView3<'b, T>,
    ) -> Result<SpeckleData<'b, I, T>>
    where
        'a: 'b,
    {
        SpeckleData::new(self.frames, self.whitefield, pixel_map, self.di, self.dj)
    }

    /// Same data with different sample translations.
    pub fn with_translations<'b>(
        &self,
        di: ArrayView1<'b, T>,
        dj: ArrayView1<'b, T>,
    ) -> Result<SpeckleData<'b, I, T>>
    where
        'a: 'b,
    {
        SpeckleData::new(self.frames, self.whitefield, self.pixel_map, di, dj)
    }

    pub fn frames(&self) -> ArrayView3<'a, I> {
        self.frames
    }

    pub fn whitefield(&self) -> ArrayView2<'a, T> {
        self.whitefield
    }

    pub fn pixel_map(&self) -> ArrayView3<'a, T> {
        self.pixel_map
    }

    pub fn di(&self) -> ArrayView1<'a, T> {
        self.di
    }

    pub fn dj(&self) -> ArrayView1<'a, T> {
        self.dj
    }

    pub fn n_frames(&self) -> usize {
        self.frames.dim().0
    }

    pub fn height(&self) -> usize {
        self.frames.dim().1
    }

    pub fn width(&self) -> usize {
        self.frames.dim().2
    }

    /// A single detector row: the reference is estimated along `x` only.
    pub fn is_one_dimensional(&self) -> bool {
        self.height() == 1
    }

    /// Whether the detector pixel carries data (positive whitefield).
    #[inline]
    pub fn is_valid(&self, j: usize, k: usize) -> bool {
        self.whitefield[[j, k]].as_f64() > 0.0
    }

    /// Number of pixels with a positive whitefield.
    pub fn valid_count(&self) -> usize {
        self.whitefield.iter().filter(|w| w.as_f64() > 0.0).count()
    }

    #[inline]
    pub(crate) fn intensity(&self, i: usize, j: usize, k: usize) -> f64 {
        self.frames[[i, j, k]].as_()
    }

    #[inline]
    pub(crate) fn white(&self, j: usize, k: usize) -> f64 {
        self.whitefield[[j, k]].as_f64()
    }

    #[inline]
    pub(crate) fn map_y(&self, j: usize, k: usize) -> f64 {
        self.pixel_map[[0, j, k]].as_f64()
    }

    #[inline]
    pub(crate) fn map_x(&self, j: usize, k: usize) -> f64 {
        self.pixel_map[[1, j, k]].as_f64()
    }

    #[inline]
    pub(crate) fn shift_y(&self, i: usize) -> f64 {
        self.di[i].as_f64()
    }

    #[inline]
    pub(crate) fn shift_x(&self, i: usize) -> f64 {
        self.dj[i].as_f64()
    }
}

/// Reference-plane sampling interval, in detector pixels.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sampling {
    pub ds_y: f64,
    pub ds_x: f64,
}

impl Sampling {
    pub fn new(ds_y: f64, ds_x: f64) -> Result<Self> {
        let sampling = Self { ds_y, ds_x };
        sampling.validate()?;
        Ok(sampling)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.ds_y > 0.0 && self.ds_y.is_finite() && self.ds_x > 0.0 && self.ds_x.is_finite()) {
            return Err(RstError::InvalidArgument(format!(
                "sampling intervals must be positive, got ds_y={}, ds_x={}",
                self.ds_y, self.ds_x
            )));
        }
        Ok(())
    }
}

impl Default for Sampling {
    fn default() -> Self {
        Self { ds_y: 1.0, ds_x: 1.0 }
    }
}

/// Half-widths of a search window, in pixels. A zero extent disables the
/// search along that axis.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchWindow {
    pub sw_y: f64,
    pub sw_x: f64,
}

impl SearchWindow {
    pub fn new(sw_y: f64, sw_x: f64) -> Result<Self> {
        let window = Self { sw_y, sw_x };
        window.validate()?;
        Ok(window)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.sw_y >= 0.0 && self.sw_y.is_finite() && self.sw_x >= 0.0 && self.sw_x.is_finite()) {
            return Err(RstError::InvalidArgument(format!(
                "search window must be non-negative, got sw_y={}, sw_x={}",
                self.sw_y, self.sw_x
            )));
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.sw_y == 0.0 && self.sw_x == 0.0
    }

    /// Clamp an offset into the window.
    #[inline]
    pub fn clamp(&self, dy: f64, dx: f64) -> (f64, f64) {
        (dy.clamp(-self.sw_y, self.sw_y), dx.clamp(-self.sw_x, self.sw_x))
    }
}

impl Default for SearchWindow {
    fn default() -> Self {
        Self {
            sw_y: 10.0,
            sw_x: 10.0,
        }
    }
}

/// Validate a strictly positive scalar parameter.
pub(crate) fn ensure_positive(name: &str, value: f64) -> Result<()> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(RstError::InvalidArgument(format!(
            "{name} must be positive, got {value}"
        )))
    }
}
