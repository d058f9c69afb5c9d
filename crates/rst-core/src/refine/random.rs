use num_traits::AsPrimitive;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::consts::DEFAULT_RANDOM_TRIALS;
use crate::data::{Real, SearchWindow, SpeckleData};
use crate::error::{Result, RstError};
use crate::loss::Loss;
use crate::parallel::row_seeds;
use crate::reference::ReferenceImage;
use crate::residual::ResidualModel;

use super::{effective_window, log_start, refine_pixels, Candidate, PixelMapRefinement};

/// Parameters of the uniform random search.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RandomSearchParams {
    /// Candidates drawn per pixel.
    pub n_trials: usize,
    /// Master seed.
    pub seed: u64,
}

impl Default for RandomSearchParams {
    fn default() -> Self {
        Self {
            n_trials: DEFAULT_RANDOM_TRIALS,
            seed: 0,
        }
    }
}

impl RandomSearchParams {
    pub fn validate(&self) -> Result<()> {
        if self.n_trials == 0 {
            return Err(RstError::InvalidArgument(
                "random search needs at least one trial".into(),
            ));
        }
        Ok(())
    }
}

/// Evaluate `n_trials` displacements drawn uniformly from the window at
/// every pixel and keep the best.
///
/// Each detector row draws from its own stream, seeded from the master seed
/// before the parallel pass, so results do not depend on `threads`.
pub fn random_search<I, T>(
    data: &SpeckleData<'_, I, T>,
    reference: &ReferenceImage<T>,
    window: SearchWindow,
    params: &RandomSearchParams,
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
    log_start("random", &window, threads);

    let seeds = row_seeds(params.seed, data.height());

    refine_pixels(
        &model,
        threads,
        |j| StdRng::seed_from_u64(seeds[j]),
        |rng, j, k, y, x| {
            let start = Candidate::origin(model.fvu(j, k, y, x));
            let mut best = start;
            if !axes.any() {
                return (start.error, best);
            }

            for _ in 0..params.n_trials {
                let dy = if axes.y {
                    (2.0 * rng.random::<f64>() - 1.0) * window.sw_y
                } else {
                    0.0
                };
                let dx = if axes.x {
                    (2.0 * rng.random::<f64>() - 1.0) * window.sw_x
                } else {
                    0.0
                };
                let error = model.fvu(j, k, y + dy, x + dx);
                if error < best.error {
                    best = Candidate { dy, dx, error };
                }
            }
            (start.error, best)
        },
    )
}
