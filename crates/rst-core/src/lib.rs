pub mod config;
pub mod consts;
pub mod data;
pub mod error;
pub mod flatfield;
pub mod kernel;
pub mod loss;
pub mod parallel;
pub mod reference;
pub mod refine;
pub mod residual;
pub mod sharpness;
pub mod wavefront;
pub mod whitefield;
