//! Diversification-rate estimation and branching-time sampling for
//! time-calibrated clades under Yule and birth-death-sampling models.

pub mod estimator;
pub mod likelihood;
pub mod optim;
pub mod sampler;

pub use estimator::{fit_clade, FitConfig, RateFit, RateFitError};
pub use likelihood::crown_capture_probability;
pub use sampler::sample_branching_times;
