pub mod integrate;
pub mod phase;

pub use integrate::integrate_gradients;
pub use phase::{phase_from_aberrations, pixel_aberrations, pixel_translations, PhaseGeometry};
