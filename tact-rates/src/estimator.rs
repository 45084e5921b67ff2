//! Per-clade maximum-likelihood fits of Yule and birth-death-sampling
//! models, with a simulated-annealing fallback for surfaces where the
//! simplex stalls.

use crate::likelihood::{bd_neg_log_likelihood, crown_capture_probability};
use crate::optim::{minimize_scalar_bounded, nelder_mead, simulated_annealing};
use rand::Rng;
use tact_common::Time;
use thiserror::Error;

pub const MIN_BIRTH: f64 = 1e-6;
pub const MAX_BIRTH: f64 = 1e5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateFit {
    pub birth: f64,
    pub death: f64,
    pub neg_log_likelihood: f64,
}

#[derive(Debug, Error, PartialEq)]
pub enum RateFitError {
    #[error("crown capture probability {ccp:.4} is below the cutoff {cutoff}")]
    BelowCutoff { ccp: f64, cutoff: f64 },
    #[error("fewer than two sampled lineages")]
    TooFewSamples,
    #[error("crown age must be positive, got {age}")]
    BadCrownAge { age: Time },
    #[error("no finite likelihood found")]
    NonFinite,
}

#[derive(Debug, Clone, Copy)]
pub struct FitConfig {
    /// Crown capture probability required to admit the fit.
    pub min_ccp: f64,
    /// Force death to zero everywhere.
    pub yule_only: bool,
    /// Fit even below the cutoff. Used for the taxonomy root so the
    /// ancestor-fallback chain always terminates.
    pub force: bool,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            min_ccp: tact_common::DEFAULT_MIN_CCP,
            yule_only: false,
            force: false,
        }
    }
}

/// Fit diversification rates for one clade.
///
/// `times` are the clade's branching times, oldest first, with the crown age
/// in front; `n` is the known diversity and `k` the number of sampled
/// lineages. The RNG only feeds the annealing fallback, so a fit is
/// deterministic under a fixed substream.
pub fn fit_clade<R: Rng>(
    times: &[Time],
    n: usize,
    k: usize,
    cfg: &FitConfig,
    rng: &mut R,
) -> Result<RateFit, RateFitError> {
    if k < 2 {
        return Err(RateFitError::TooFewSamples);
    }
    assert!(k <= n);
    let ccp = crown_capture_probability(k, n);
    if !cfg.force && ccp < cfg.min_ccp {
        return Err(RateFitError::BelowCutoff {
            ccp,
            cutoff: cfg.min_ccp,
        });
    }

    assert!(!times.is_empty());
    let sorted = times.windows(2).all(|w| w[0] >= w[1]);
    assert!(sorted, "branching times must be sorted oldest first");
    let crown = times[0];
    if !(crown > 0.0) {
        return Err(RateFitError::BadCrownAge { age: crown });
    }
    let rho = k as f64 / n as f64;

    // A cherry carries no information beyond its depth; use the analytic
    // Yule estimate instead of optimizing.
    if k == 2 {
        let birth = ((n as f64).ln() / crown).max(MIN_BIRTH);
        return Ok(RateFit {
            birth,
            death: 0.0,
            neg_log_likelihood: bd_neg_log_likelihood(birth, 0.0, rho, times),
        });
    }

    let yule = fit_yule(times, rho);
    if cfg.yule_only {
        return finite_or_err(yule);
    }

    let objective = |v: &[f64]| {
        let (birth, death) = (v[0], v[1]);
        if !(MIN_BIRTH..=MAX_BIRTH).contains(&birth) || death < 0.0 || death >= birth {
            f64::INFINITY
        } else {
            bd_neg_log_likelihood(birth, death, rho, times)
        }
    };

    let start = [yule.birth, 0.5 * yule.birth];
    let simplex = nelder_mead(&objective, &start, 1000, 1e-10);

    let stalled = !simplex.fx.is_finite()
        || simplex.fx > yule.neg_log_likelihood - 1e-12
        || simplex.x[0] >= 0.99 * MAX_BIRTH
        || simplex.x[0] - simplex.x[1] <= 1e-9 * simplex.x[0];

    let mut best = RateFit {
        birth: simplex.x[0],
        death: simplex.x[1],
        neg_log_likelihood: simplex.fx,
    };
    if stalled {
        let hi_birth = (100.0 * yule.birth).clamp(1.0, MAX_BIRTH);
        let annealed = simulated_annealing(
            &objective,
            &start,
            &[MIN_BIRTH, 0.0],
            &[hi_birth, hi_birth],
            300,
            rng,
        );
        if annealed.fx < best.neg_log_likelihood {
            best = RateFit {
                birth: annealed.x[0],
                death: annealed.x[1],
                neg_log_likelihood: annealed.fx,
            };
        }
    }

    if !best.neg_log_likelihood.is_finite()
        || best.neg_log_likelihood >= yule.neg_log_likelihood
    {
        return finite_or_err(yule);
    }
    finite_or_err(best)
}

fn fit_yule(times: &[Time], rho: f64) -> RateFit {
    let fit = minimize_scalar_bounded(
        |b| bd_neg_log_likelihood(b, 0.0, rho, times),
        MIN_BIRTH,
        MAX_BIRTH,
        1e-10,
        500,
    );
    RateFit {
        birth: fit.x,
        death: 0.0,
        neg_log_likelihood: fit.fx,
    }
}

fn finite_or_err(fit: RateFit) -> Result<RateFit, RateFitError> {
    if fit.neg_log_likelihood.is_finite() && fit.birth.is_finite() && fit.birth > 0.0 {
        Ok(fit)
    } else {
        Err(RateFitError::NonFinite)
    }
}
