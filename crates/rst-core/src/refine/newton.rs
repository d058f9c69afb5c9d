use num_traits::AsPrimitive;
use serde::{Deserialize, Serialize};

use crate::consts::{
    DEFAULT_NEWTON_ITERATIONS, MIN_NEWTON_STEP, NEWTON_STEP_SCALE, NEWTON_TRUST_RADIUS,
    SINGULAR_DETERMINANT,
};
use crate::data::{ensure_positive, Real, SearchWindow, SpeckleData};
use crate::error::{Result, RstError};
use crate::loss::Loss;
use crate::reference::ReferenceImage;
use crate::residual::ResidualModel;

use super::{effective_window, log_start, refine_pixels, ActiveAxes, Candidate, PixelMapRefinement};

/// Parameters of the standalone Newton refinement.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewtonParams {
    /// Curvature scale of the residual surface, used to size the
    /// finite-difference step.
    pub l1: f64,
    /// Maximum number of accepted steps per pixel.
    pub max_iter: usize,
}

impl Default for NewtonParams {
    fn default() -> Self {
        Self {
            l1: 1.0,
            max_iter: DEFAULT_NEWTON_ITERATIONS,
        }
    }
}

impl NewtonParams {
    pub fn validate(&self) -> Result<()> {
        ensure_positive("l1", self.l1)?;
        if self.max_iter == 0 {
            return Err(RstError::InvalidArgument(
                "Newton refinement needs at least one iteration".into(),
            ));
        }
        Ok(())
    }
}

/// Refine every pixel with damped Newton steps on a quadratic model of the
/// residual surface.
///
/// The gradient and diagonal curvature are estimated from a cross of
/// residual samples (5 points, or 3 along a single active axis) spaced
/// `mu = max(2^(3/4) * var^(1/4) / sqrt(l1), 2)` apart, where `var` is the
/// variance of the mean residual at the current point. Steps longer than one
/// pixel are shortened, kept inside the window and only taken when they
/// lower the residual.
pub fn newton_refine<I, T>(
    data: &SpeckleData<'_, I, T>,
    reference: &ReferenceImage<T>,
    window: SearchWindow,
    params: &NewtonParams,
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
    log_start("newton", &window, threads);

    refine_pixels(
        &model,
        threads,
        |_| (),
        |_, j, k, y, x| {
            let start = Candidate::origin(model.fvu(j, k, y, x));
            let best = polish(&model, &window, axes, j, k, (y, x), start, params.l1, params.max_iter);
            (start.error, best)
        },
    )
}

/// Newton iterations starting from `start`, a displacement relative to the
/// pixel position `origin`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn polish<I, T>(
    model: &ResidualModel<'_, '_, I, T>,
    window: &SearchWindow,
    axes: ActiveAxes,
    j: usize,
    k: usize,
    origin: (f64, f64),
    start: Candidate,
    l1: f64,
    max_iter: usize,
) -> Candidate
where
    I: AsPrimitive<f64> + Send + Sync,
    T: Real,
{
    if !axes.any() || l1 <= 0.0 {
        return start;
    }
    let (y0, x0) = origin;
    let fvu = |dy: f64, dx: f64| model.fvu(j, k, y0 + dy, x0 + dx);

    let mut best = start;
    for _ in 0..max_iter {
        let (f0, var) = model.fvu_with_variance(j, k, y0 + best.dy, x0 + best.dx);
        let mu = (NEWTON_STEP_SCALE * var.powf(0.25) / l1.sqrt()).max(MIN_NEWTON_STEP);

        let (mut gy, mut hyy) = (0.0, 0.0);
        if axes.y {
            let fp = fvu(best.dy + mu, best.dx);
            let fm = fvu(best.dy - mu, best.dx);
            gy = (fp - fm) / (2.0 * mu);
            hyy = (fp - 2.0 * f0 + fm) / (mu * mu);
        }
        let (mut gx, mut hxx) = (0.0, 0.0);
        if axes.x {
            let fp = fvu(best.dy, best.dx + mu);
            let fm = fvu(best.dy, best.dx - mu);
            gx = (fp - fm) / (2.0 * mu);
            hxx = (fp - 2.0 * f0 + fm) / (mu * mu);
        }

        let (mut sy, mut sx) = match (axes.y, axes.x) {
            (true, true) => {
                let det = hyy * hxx;
                if det.abs() <= SINGULAR_DETERMINANT {
                    break;
                }
                (-gy * hxx / det, -gx * hyy / det)
            }
            (true, false) => {
                if hyy.abs() <= SINGULAR_DETERMINANT {
                    break;
                }
                (-gy / hyy, 0.0)
            }
            (false, true) => {
                if hxx.abs() <= SINGULAR_DETERMINANT {
                    break;
                }
                (0.0, -gx / hxx)
            }
            (false, false) => break,
        };

        let length = sy.hypot(sx);
        if length > NEWTON_TRUST_RADIUS {
            sy *= NEWTON_TRUST_RADIUS / length;
            sx *= NEWTON_TRUST_RADIUS / length;
        }

        let (dy, dx) = window.clamp(best.dy + sy, best.dx + sx);
        let error = fvu(dy, dx);
        if error < best.error {
            best = Candidate { dy, dx, error };
        } else {
            break;
        }
    }
    best
}
