//! Inverse-CDF sampling of divergence times from a conditioned birth-death
//! process restricted to a closed time window.

use rand::Rng;
use tact_common::{Interval, Time};

/// Relative rate difference below which the critical-branching quantile is
/// used.
const CRITICAL_EPS: f64 = 1e-9;

/// Integral of the reconstructed-process density up to `t`; monotone in `t`,
/// so quantiles invert in closed form.
fn intp1(t: Time, birth: f64, death: f64) -> f64 {
    let r = birth - death;
    if r.abs() < CRITICAL_EPS * birth.max(1.0) {
        t / (1.0 + birth * t)
    } else {
        let x = (-r * t).exp();
        (1.0 - x) / (birth - death * x)
    }
}

fn quantile(q: f64, birth: f64, death: f64) -> Time {
    let r = birth - death;
    if r.abs() < CRITICAL_EPS * birth.max(1.0) {
        return q / (1.0 - birth * q);
    }
    let x = (1.0 - q * birth) / (1.0 - q * death);
    -x.ln() / r
}

/// Draw `m` divergence times on `window` from the process with the given
/// rates, sorted oldest first. A window narrower than `precision` yields `m`
/// copies of its upper bound; the caller is expected to warn about the
/// near-zero branches that follow.
pub fn sample_branching_times<R: Rng>(
    m: usize,
    birth: f64,
    death: f64,
    window: Interval,
    precision: Time,
    rng: &mut R,
) -> Vec<Time> {
    assert!(birth > 0.0, "birth rate must be positive");
    assert!((0.0..birth).contains(&death) || death == 0.0);

    if m == 0 {
        return vec![];
    }
    if window.width() <= precision {
        return vec![window.hi; m];
    }

    let q_lo = intp1(window.lo, birth, death);
    let q_hi = intp1(window.hi, birth, death);
    let mut times: Vec<Time> = (0..m)
        .map(|_| {
            let u: f64 = rng.gen();
            let t = quantile(q_lo + u * (q_hi - q_lo), birth, death);
            t.clamp(window.lo, window.hi)
        })
        .collect();
    times.sort_by(|a, b| b.partial_cmp(a).unwrap());
    times
}


#[cfg(test)]
mod properties {
    use super::*;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand_pcg::Pcg64;

    proptest! {
        #[test]
        fn draws_stay_inside_the_window_and_sort_oldest_first(
            m in 1usize..50,
            birth in 0.01f64..5.0,
            death_frac in 0.0f64..0.95,
            lo in 0.0f64..10.0,
            width in 0.01f64..10.0,
            seed in any::<u64>(),
        ) {
            let death = birth * death_frac;
            let window = Interval::new(lo, lo + width).unwrap();
            let mut rng = Pcg64::seed_from_u64(seed);
            let times = sample_branching_times(m, birth, death, window, 1e-6, &mut rng);
            prop_assert_eq!(times.len(), m);
            prop_assert!(times.windows(2).all(|w| w[0] >= w[1]));
            prop_assert!(times.iter().all(|&t| window.contains(t)));
        }
    }
}
