use ndarray::Array1;
use num_traits::AsPrimitive;
use rayon::prelude::*;
use tracing::{debug, info};

use crate::data::{Real, SearchWindow, SpeckleData};
use crate::error::{Result, RstError};
use crate::loss::Loss;
use crate::parallel::build_pool;
use crate::reference::ReferenceImage;
use crate::residual::ResidualModel;

use super::effective_window;
use super::grid::grid_offsets;

/// Result of a sample-translation refinement step.
#[derive(Clone, Debug)]
pub struct TranslationRefinement<T> {
    pub di: Array1<T>,
    pub dj: Array1<T>,
    /// Mean residual decrease over valid pixels for every frame, `>= 0`.
    pub error_decrease: Array1<T>,
}

/// Grid search over the global translation of every frame.
///
/// The per-pixel loss sums at the current translations are computed once;
/// each candidate translation of frame `i` then only re-evaluates frame `i`
/// and patches the sums. Frames are refined independently and in parallel,
/// each against the baseline of the input translations.
#[allow(clippy::too_many_arguments)]
pub fn update_translations<I, T>(
    data: &SpeckleData<'_, I, T>,
    reference: &ReferenceImage<T>,
    window: SearchWindow,
    grid_size: usize,
    loss: Loss,
    sigma: f64,
    threads: usize,
) -> Result<TranslationRefinement<T>>
where
    I: AsPrimitive<f64> + Send + Sync,
    T: Real,
{
    if grid_size == 0 {
        return Err(RstError::InvalidArgument(
            "grid size must be at least 1".into(),
        ));
    }
    let (window, _) = effective_window(data, window)?;
    let model = ResidualModel::new(data, reference, sigma, loss)?;
    let pool = build_pool(threads)?;
    debug!(
        frames = data.n_frames(),
        sw_y = window.sw_y,
        sw_x = window.sw_x,
        grid_size,
        threads,
        "Refining sample translations"
    );

    let baseline = model.baseline(threads)?;
    let valid: Vec<(usize, usize)> = (0..data.height())
        .flat_map(|j| (0..data.width()).map(move |k| (j, k)))
        .filter(|&(j, k)| data.is_valid(j, k))
        .collect();

    let offsets_y = grid_offsets(window.sw_y, grid_size);
    let offsets_x = grid_offsets(window.sw_x, grid_size);

    let frames: Vec<(f64, f64, f64)> = pool.install(|| {
        (0..data.n_frames())
            .into_par_iter()
            .map(|i| {
                let (di0, dj0) = (data.shift_y(i), data.shift_x(i));
                if valid.is_empty() {
                    return (di0, dj0, 0.0);
                }
                let objective = |di: f64, dj: f64| {
                    let sum: f64 = valid
                        .iter()
                        .map(|&(j, k)| model.fvu_translation(&baseline, i, j, k, di, dj))
                        .sum();
                    sum / valid.len() as f64
                };

                let start = objective(di0, dj0);
                let mut best = (di0, dj0, start);
                for &oy in &offsets_y {
                    for &ox in &offsets_x {
                        let error = objective(di0 + oy, dj0 + ox);
                        if error < best.2 {
                            best = (di0 + oy, dj0 + ox, error);
                        }
                    }
                }
                (best.0, best.1, start - best.2)
            })
            .collect()
    });

    let moved = frames.iter().filter(|f| f.2 > 0.0).count();
    info!(moved, frames = frames.len(), "Sample translations refined");

    Ok(TranslationRefinement {
        di: frames.iter().map(|f| T::from_f64(f.0)).collect(),
        dj: frames.iter().map(|f| T::from_f64(f.1)).collect(),
        error_decrease: frames.iter().map(|f| T::from_f64(f.2)).collect(),
    })
}
