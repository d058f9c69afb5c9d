#![allow(dead_code)]

use ndarray::{Array1, Array2, Array3};
use rst_core::data::{Sampling, SpeckleData};
use rst_core::reference::ReferenceImage;

/// Margin, in pixels, between the detector footprint and the edge of the
/// analytic reference grid.
pub const MARGIN: i64 = 8;

/// Smooth speckle-like transmission profile.
pub fn profile(y: f64, x: f64) -> f64 {
    1.0 + 0.3 * (y / 1.7).sin() * (x / 2.3).cos()
}

/// Linear ramp used by the reference round-trip scenario.
pub fn ramp(h: usize, w: usize) -> Array2<f64> {
    let span = (h + w - 2).max(1) as f64;
    Array2::from_shape_fn((h, w), |(j, k)| 1.0 + 0.1 * (j + k) as f64 / span)
}

/// Pixel map sending every detector pixel to its own coordinates.
pub fn identity_map(h: usize, w: usize) -> Array3<f64> {
    Array3::from_shape_fn((2, h, w), |(c, j, k)| if c == 0 { j as f64 } else { k as f64 })
}

/// Identity map plus a smooth sub-pixel distortion.
pub fn distorted_map(h: usize, w: usize) -> Array3<f64> {
    Array3::from_shape_fn((2, h, w), |(c, j, k)| {
        if c == 0 {
            j as f64 + 0.6 * (k as f64 / 3.0).sin()
        } else {
            k as f64 - 0.5 * (j as f64 / 4.0).cos()
        }
    })
}

/// Frames and geometry of a synthetic speckle-tracking scan.
pub struct Scene {
    pub frames: Array3<f64>,
    pub whitefield: Array2<f64>,
    pub true_map: Array3<f64>,
    pub pixel_map: Array3<f64>,
    pub di: Array1<f64>,
    pub dj: Array1<f64>,
}

impl Scene {
    /// Noise-free scan of [`profile`] through the distorted map. The working
    /// pixel map starts at identity.
    pub fn distorted(h: usize, w: usize) -> Self {
        let di = Array1::from(vec![0.0, 1.5, 3.0, 4.5]);
        let dj = Array1::from(vec![0.0, 2.0, 4.0, 1.0]);
        let true_map = distorted_map(h, w);
        let whitefield = Array2::from_elem((h, w), 1.0);
        let frames = render(&true_map, &whitefield, &di, &dj);
        Self {
            frames,
            whitefield,
            pixel_map: identity_map(h, w),
            true_map,
            di,
            dj,
        }
    }

    /// Like [`Scene::distorted`] but with `n` frames on an irregular
    /// translation path, enough to spread over many worker chunks.
    pub fn scan(h: usize, w: usize, n: usize) -> Self {
        let di = Array1::from_shape_fn(n, |i| (i as f64 * 0.61) % 5.0);
        let dj = Array1::from_shape_fn(n, |i| (i as f64 * 1.37) % 7.0);
        let true_map = distorted_map(h, w);
        let whitefield = Array2::from_shape_fn((h, w), |(j, k)| 0.8 + 0.05 * ((j + k) % 5) as f64);
        let frames = render(&true_map, &whitefield, &di, &dj);
        Self {
            frames,
            whitefield,
            pixel_map: identity_map(h, w),
            true_map,
            di,
            dj,
        }
    }

    pub fn data(&self) -> SpeckleData<'_, f64, f64> {
        SpeckleData::new(
            self.frames.view(),
            self.whitefield.view(),
            self.pixel_map.view(),
            self.di.view(),
            self.dj.view(),
        )
        .unwrap()
    }
}

/// Render `W * profile(u - d)` for every frame.
pub fn render(
    map: &Array3<f64>,
    whitefield: &Array2<f64>,
    di: &Array1<f64>,
    dj: &Array1<f64>,
) -> Array3<f64> {
    let (_, h, w) = map.dim();
    Array3::from_shape_fn((di.len(), h, w), |(i, j, k)| {
        whitefield[[j, k]] * profile(map[[0, j, k]] - di[i], map[[1, j, k]] - dj[i])
    })
}

/// [`profile`] sampled on a unit grid offset by [`MARGIN`], large enough to
/// cover a `h x w` detector scanned over a few pixels.
pub fn analytic_reference(h: usize, w: usize) -> ReferenceImage<f64> {
    let size = (h + 2 * MARGIN as usize, w + 2 * MARGIN as usize);
    let image = Array2::from_shape_fn(size, |(jj, kk)| {
        profile(jj as f64 - MARGIN as f64, kk as f64 - MARGIN as f64)
    });
    ReferenceImage::new(image, MARGIN, MARGIN, Sampling::default()).unwrap()
}

/// Mean of `values` over the positions where `mask` is true.
pub fn masked_mean(values: &Array2<f64>, mask: &Array2<bool>) -> f64 {
    let (sum, n) = values
        .iter()
        .zip(mask.iter())
        .filter(|(_, m)| **m)
        .fold((0.0, 0usize), |(s, n), (&v, _)| (s + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}
