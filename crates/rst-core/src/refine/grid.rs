use num_traits::AsPrimitive;
use serde::{Deserialize, Serialize};

use crate::consts::{DEFAULT_GRID_SIZE, DEFAULT_NEWTON_ITERATIONS};
use crate::data::{Real, SearchWindow, SpeckleData};
use crate::error::{Result, RstError};
use crate::loss::Loss;
use crate::reference::ReferenceImage;
use crate::residual::ResidualModel;

use super::newton::polish;
use super::{effective_window, log_start, refine_pixels, Candidate, PixelMapRefinement};

/// Parameters of the exhaustive grid search.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridSearchParams {
    /// Number of grid points along each active axis.
    pub grid_size: usize,
}

impl Default for GridSearchParams {
    fn default() -> Self {
        Self {
            grid_size: DEFAULT_GRID_SIZE,
        }
    }
}

impl GridSearchParams {
    pub fn validate(&self) -> Result<()> {
        if self.grid_size == 0 {
            return Err(RstError::InvalidArgument(
                "grid size must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Evenly spaced offsets spanning `[-sw, sw]`; a single 0 when the axis is
/// inactive or the grid has one point.
pub(crate) fn grid_offsets(sw: f64, n: usize) -> Vec<f64> {
    if sw <= 0.0 || n <= 1 {
        return vec![0.0];
    }
    let step = 2.0 * sw / (n - 1) as f64;
    (0..n).map(|t| -sw + step * t as f64).collect()
}

/// Exhaustive search over a `grid_size x grid_size` lattice of
/// displacements spanning the window, followed by a Newton polish.
///
/// The polish derives its curvature scale from the spread of residuals over
/// the whole lattice, `l1 = 2 * (max - min) / (sw_y^2 + sw_x^2)`.
pub fn grid_search<I, T>(
    data: &SpeckleData<'_, I, T>,
    reference: &ReferenceImage<T>,
    window: SearchWindow,
    params: &GridSearchParams,
    loss: Loss,
    sigma: f64,
    threads: usize,
) -> Result<PixelMapRefinement<T>>
where
    I: AsPrimitive<f64> + Send + Sync,
    T: Real,
{
    params.validate()?;
    let (window, axes) = effective_window(data, window)?;
    let model = ResidualModel::new(data, reference, sigma, loss)?;
    log_start("grid", &window, threads);

    let offsets_y = grid_offsets(window.sw_y, params.grid_size);
    let offsets_x = grid_offsets(window.sw_x, params.grid_size);
    let extent = window.sw_y * window.sw_y + window.sw_x * window.sw_x;

    refine_pixels(
        &model,
        threads,
        |_| (),
        |_, j, k, y, x| {
            let start = Candidate::origin(model.fvu(j, k, y, x));
            let mut best = start;
            let (mut lo, mut hi) = (f64::INFINITY, f64::NEG_INFINITY);

            for &dy in &offsets_y {
                for &dx in &offsets_x {
                    let error = model.fvu(j, k, y + dy, x + dx);
                    lo = lo.min(error);
                    hi = hi.max(error);
                    if error < best.error {
                        best = Candidate { dy, dx, error };
                    }
                }
            }

            if extent > 0.0 {
                let l1 = 2.0 * (hi - lo) / extent;
                best = polish(
                    &model,
                    &window,
                    axes,
                    j,
                    k,
                    (y, x),
                    best,
                    l1,
                    DEFAULT_NEWTON_ITERATIONS,
                );
            }
            (start.error, best)
        },
    )
}
