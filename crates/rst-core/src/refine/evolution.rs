use num_traits::AsPrimitive;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::consts::{
    DEFAULT_CROSSOVER, DEFAULT_GENERATIONS, DEFAULT_MUTATION, DEFAULT_POPULATION, MIN_POPULATION,
};
use crate::data::{Real, SearchWindow, SpeckleData};
use crate::error::{Result, RstError};
use crate::loss::Loss;
use crate::parallel::row_seeds;
use crate::reference::ReferenceImage;
use crate::residual::ResidualModel;

use super::{effective_window, log_start, refine_pixels, ActiveAxes, Candidate, PixelMapRefinement};

/// Parameters of the per-pixel differential evolution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DifferentialEvolutionParams {
    /// Population size `NP`, at least 4.
    pub pop_size: usize,
    /// Number of generations.
    pub n_iter: usize,
    /// Mutation factor `F` in `[0, 2]`.
    pub mutation: f64,
    /// Crossover probability `CR` in `[0, 1]`.
    pub crossover: f64,
    /// Master seed.
    pub seed: u64,
}

impl Default for DifferentialEvolutionParams {
    fn default() -> Self {
        Self {
            pop_size: DEFAULT_POPULATION,
            n_iter: DEFAULT_GENERATIONS,
            mutation: DEFAULT_MUTATION,
            crossover: DEFAULT_CROSSOVER,
            seed: 0,
        }
    }
}

impl DifferentialEvolutionParams {
    pub fn validate(&self) -> Result<()> {
        if self.pop_size < MIN_POPULATION {
            return Err(RstError::InvalidArgument(format!(
                "population size must be at least {}, got {}",
                MIN_POPULATION, self.pop_size
            )));
        }
        if !(0.0..=2.0).contains(&self.mutation) {
            return Err(RstError::InvalidArgument(format!(
                "mutation factor must lie in [0, 2], got {}",
                self.mutation
            )));
        }
        if !(0.0..=1.0).contains(&self.crossover) {
            return Err(RstError::InvalidArgument(format!(
                "crossover probability must lie in [0, 1], got {}",
                self.crossover
            )));
        }
        Ok(())
    }
}

/// Evolve a population of displacements at every pixel with the
/// `best/1/bin` scheme: trial = best + F * (a - b), binomial crossover with
/// probability `CR`, greedy replacement.
///
/// Member 0 starts at the current mapping so the result can never be worse
/// than the input. Streams are seeded per detector row as in
/// [`random_search`](super::random_search).
pub fn differential_evolution<I, T>(
    data: &SpeckleData<'_, I, T>,
    reference: &ReferenceImage<T>,
    window: SearchWindow,
    params: &DifferentialEvolutionParams,
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
    log_start("evolution", &window, threads);

    let seeds = row_seeds(params.seed, data.height());

    refine_pixels(
        &model,
        threads,
        |j| StdRng::seed_from_u64(seeds[j]),
        |rng, j, k, y, x| {
            let start = Candidate::origin(model.fvu(j, k, y, x));
            if !axes.any() {
                return (start.error, start);
            }
            let best = evolve(rng, params, &window, axes, start, |dy, dx| {
                model.fvu(j, k, y + dy, x + dx)
            });
            (start.error, best)
        },
    )
}

fn evolve(
    rng: &mut StdRng,
    params: &DifferentialEvolutionParams,
    window: &SearchWindow,
    axes: ActiveAxes,
    start: Candidate,
    objective: impl Fn(f64, f64) -> f64,
) -> Candidate {
    let np = params.pop_size;
    let bounds = [window.sw_y, window.sw_x];
    let active: Vec<usize> = [axes.y, axes.x]
        .iter()
        .enumerate()
        .filter_map(|(axis, &on)| on.then_some(axis))
        .collect();

    let mut population = vec![[0.0f64; 2]; np];
    let mut fitness = vec![start.error; np];
    for i in 1..np {
        for &axis in &active {
            population[i][axis] = (2.0 * rng.random::<f64>() - 1.0) * bounds[axis];
        }
        fitness[i] = objective(population[i][0], population[i][1]);
    }
    let mut best = argmin(&fitness);

    for _ in 0..params.n_iter {
        for i in 0..np {
            let a = pick_distinct(rng, np, &[i]);
            let b = pick_distinct(rng, np, &[i, a]);
            let forced = active[rng.random_range(0..axes.count())];

            let mut trial = population[i];
            for &axis in &active {
                if axis == forced || rng.random::<f64>() < params.crossover {
                    let mutant = population[best][axis]
                        + params.mutation * (population[a][axis] - population[b][axis]);
                    trial[axis] = mutant.clamp(-bounds[axis], bounds[axis]);
                }
            }

            let error = objective(trial[0], trial[1]);
            if error < fitness[i] {
                population[i] = trial;
                fitness[i] = error;
                if error < fitness[best] {
                    best = i;
                }
            }
        }
    }

    Candidate {
        dy: population[best][0],
        dx: population[best][1],
        error: fitness[best],
    }
}

fn argmin(values: &[f64]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate() {
        if v < values[best] {
            best = i;
        }
    }
    best
}

/// Uniform index in `0..n` not contained in `exclude`.
fn pick_distinct(rng: &mut StdRng, n: usize, exclude: &[usize]) -> usize {
    loop {
        let idx = rng.random_range(0..n);
        if !exclude.contains(&idx) {
            return idx;
        }
    }
}
