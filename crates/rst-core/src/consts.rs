/// Kernel footprint radius in units of the bandwidth `h`.
pub const KERNEL_TRUNCATION: f64 = 4.0;

/// Normalized residual beyond which every robust loss saturates.
pub const LOSS_CUTOFF: f64 = 3.0;

/// Huber transition point between the quadratic and linear branches.
pub const HUBER_DELTA: f64 = 1.345;

/// Half-width of the dead zone of the epsilon-insensitive loss.
pub const EPSILON_INSENSITIVITY: f64 = 0.25;

/// Finite-difference step constant for the Newton refinement, 2^(3/4).
pub const NEWTON_STEP_SCALE: f64 = 1.681_792_830_507_429;

/// Lower bound of the Newton finite-difference step, in pixels.
pub const MIN_NEWTON_STEP: f64 = 2.0;

/// Maximum length of a single Newton displacement, in pixels.
pub const NEWTON_TRUST_RADIUS: f64 = 1.0;

/// Determinants with a smaller magnitude are treated as singular.
pub const SINGULAR_DETERMINANT: f64 = 1e-12;

/// Minimum number of frames handed to a worker at once during reference
/// accumulation.
pub const MIN_GUIDED_CHUNK: usize = 1;

/// Minimum population size for differential evolution.
pub const MIN_POPULATION: usize = 4;

/// Default grid resolution per axis for pixel-map grid search.
pub const DEFAULT_GRID_SIZE: usize = 25;

/// Default grid resolution per axis for sample-translation search.
pub const DEFAULT_TRANSLATION_GRID_SIZE: usize = 10;

/// Default number of candidates per pixel for random search.
pub const DEFAULT_RANDOM_TRIALS: usize = 50;

/// Default differential evolution population size.
pub const DEFAULT_POPULATION: usize = 10;

/// Default number of differential evolution generations.
pub const DEFAULT_GENERATIONS: usize = 20;

/// Default differential evolution mutation factor `F`.
pub const DEFAULT_MUTATION: f64 = 0.75;

/// Default differential evolution crossover probability `CR`.
pub const DEFAULT_CROSSOVER: f64 = 0.7;

/// Default number of Newton steps per pixel.
pub const DEFAULT_NEWTON_ITERATIONS: usize = 5;

/// Multiple of the photon-noise level `sqrt(W)` beyond which a sample is left
/// out of the median flat fields.
pub const FLATFIELD_OUTLIER_SIGMAS: f64 = 3.0;

/// Default number of neighbouring frames in a median flat-field window.
pub const DEFAULT_FLATFIELD_WINDOW: usize = 11;
