pub mod evolution;
pub mod grid;
pub mod newton;
pub mod random;
pub mod translation;

use std::fmt;

use ndarray::{Array2, Array3};
use num_traits::AsPrimitive;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::PixelMapConfig;
use crate::data::{Real, SearchWindow, SpeckleData};
use crate::error::Result;
use crate::parallel::build_pool;
use crate::reference::ReferenceImage;
use crate::residual::ResidualModel;

pub use evolution::{differential_evolution, DifferentialEvolutionParams};
pub use grid::{grid_search, GridSearchParams};
pub use newton::{newton_refine, NewtonParams};
pub use random::{random_search, RandomSearchParams};
pub use translation::{update_translations, TranslationRefinement};

/// Result of a pixel-map refinement step.
#[derive(Clone, Debug)]
pub struct PixelMapRefinement<T> {
    /// Updated map, shape `(2, Y, X)`.
    pub pixel_map: Array3<T>,
    /// Residual decrease achieved at every pixel, `>= 0`.
    pub error_decrease: Array2<T>,
}

impl<T: Real> PixelMapRefinement<T> {
    /// Number of pixels whose mapping moved.
    pub fn improved_count(&self) -> usize {
        self.error_decrease
            .iter()
            .filter(|d| d.as_f64() > 0.0)
            .count()
    }
}

/// Pixel-map search algorithm and its parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SearchStrategy {
    Grid(GridSearchParams),
    Random(RandomSearchParams),
    Evolution(DifferentialEvolutionParams),
    Newton(NewtonParams),
}

impl Default for SearchStrategy {
    fn default() -> Self {
        SearchStrategy::Grid(GridSearchParams::default())
    }
}

impl SearchStrategy {
    pub fn validate(&self) -> Result<()> {
        match self {
            SearchStrategy::Grid(p) => p.validate(),
            SearchStrategy::Random(p) => p.validate(),
            SearchStrategy::Evolution(p) => p.validate(),
            SearchStrategy::Newton(p) => p.validate(),
        }
    }
}

impl fmt::Display for SearchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchStrategy::Grid(p) => write!(f, "Grid search ({0}x{0})", p.grid_size),
            SearchStrategy::Random(p) => write!(f, "Random search ({} trials)", p.n_trials),
            SearchStrategy::Evolution(p) => write!(
                f,
                "Differential evolution (NP={}, {} generations)",
                p.pop_size, p.n_iter
            ),
            SearchStrategy::Newton(p) => write!(f, "Newton ({} steps)", p.max_iter),
        }
    }
}

/// Refine the pixel map with the configured strategy.
pub fn update_pixel_map<I, T>(
    data: &SpeckleData<'_, I, T>,
    reference: &ReferenceImage<T>,
    config: &PixelMapConfig,
    sigma: f64,
    threads: usize,
) -> Result<PixelMapRefinement<T>>
where
    I: AsPrimitive<f64> + Send + Sync,
    T: Real,
{
    let (window, loss) = (config.window, config.loss);
    match &config.strategy {
        SearchStrategy::Grid(p) => grid_search(data, reference, window, p, loss, sigma, threads),
        SearchStrategy::Random(p) => random_search(data, reference, window, p, loss, sigma, threads),
        SearchStrategy::Evolution(p) => {
            differential_evolution(data, reference, window, p, loss, sigma, threads)
        }
        SearchStrategy::Newton(p) => newton_refine(data, reference, window, p, loss, sigma, threads),
    }
}

/// A displacement from a pixel's starting position and its residual.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Candidate {
    pub dy: f64,
    pub dx: f64,
    pub error: f64,
}

impl Candidate {
    pub(crate) fn origin(error: f64) -> Self {
        Self {
            dy: 0.0,
            dx: 0.0,
            error,
        }
    }
}

/// Which displacement axes a search may move along.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ActiveAxes {
    pub y: bool,
    pub x: bool,
}

impl ActiveAxes {
    pub(crate) fn any(&self) -> bool {
        self.y || self.x
    }

    pub(crate) fn count(&self) -> usize {
        self.y as usize + self.x as usize
    }
}

/// Search window restricted to the axes the data can resolve: a single
/// detector row carries no vertical information.
pub(crate) fn effective_window<I, T>(
    data: &SpeckleData<'_, I, T>,
    window: SearchWindow,
) -> Result<(SearchWindow, ActiveAxes)>
where
    I: AsPrimitive<f64> + Send + Sync,
    T: Real,
{
    window.validate()?;
    let sw_y = if data.is_one_dimensional() { 0.0 } else { window.sw_y };
    let window = SearchWindow {
        sw_y,
        sw_x: window.sw_x,
    };
    let axes = ActiveAxes {
        y: window.sw_y > 0.0,
        x: window.sw_x > 0.0,
    };
    Ok((window, axes))
}

/// Run a per-pixel search over every valid detector pixel, one detector row
/// per parallel work item.
///
/// `init_row` builds the per-row state (e.g. the row's RNG stream) and
/// `search` returns the starting residual and the best candidate found. A
/// pixel moves only when the candidate is strictly better than its start;
/// masked and unimproved pixels keep their input mapping exactly.
pub(crate) fn refine_pixels<I, T, S, R, F>(
    model: &ResidualModel<'_, '_, I, T>,
    threads: usize,
    init_row: R,
    search: F,
) -> Result<PixelMapRefinement<T>>
where
    I: AsPrimitive<f64> + Send + Sync,
    T: Real,
    R: Fn(usize) -> S + Sync,
    F: Fn(&mut S, usize, usize, f64, f64) -> (f64, Candidate) + Sync,
{
    let data = model.data();
    let pool = build_pool(threads)?;
    let (h, w) = (data.height(), data.width());

    let rows: Vec<Vec<Option<(f64, f64, f64)>>> = pool.install(|| {
        (0..h)
            .into_par_iter()
            .map(|j| {
                let mut state = init_row(j);
                (0..w)
                    .map(|k| {
                        if !data.is_valid(j, k) {
                            return None;
                        }
                        let (start, best) =
                            search(&mut state, j, k, data.map_y(j, k), data.map_x(j, k));
                        let decrease = start - best.error;
                        (decrease > 0.0).then_some((best.dy, best.dx, decrease))
                    })
                    .collect()
            })
            .collect()
    });

    let mut pixel_map = data.pixel_map().to_owned();
    let mut error_decrease = Array2::from_elem((h, w), T::from_f64(0.0));
    let mut improved = 0usize;
    let mut total_decrease = 0.0;

    for (j, row) in rows.into_iter().enumerate() {
        for (k, step) in row.into_iter().enumerate() {
            if let Some((dy, dx, decrease)) = step {
                pixel_map[[0, j, k]] = T::from_f64(data.map_y(j, k) + dy);
                pixel_map[[1, j, k]] = T::from_f64(data.map_x(j, k) + dx);
                error_decrease[[j, k]] = T::from_f64(decrease);
                improved += 1;
                total_decrease += decrease;
            }
        }
    }

    let mean_decrease = if improved > 0 {
        total_decrease / improved as f64
    } else {
        0.0
    };
    info!(
        improved,
        pixels = h * w,
        mean_decrease,
        "Pixel map refined"
    );

    Ok(PixelMapRefinement {
        pixel_map,
        error_decrease,
    })
}

/// Log the parameters of a refinement call.
pub(crate) fn log_start(strategy: &str, window: &SearchWindow, threads: usize) {
    debug!(
        strategy,
        sw_y = window.sw_y,
        sw_x = window.sw_x,
        threads,
        "Refining pixel map"
    );
}
