//! Log-space likelihoods for reconstructed birth-death processes under
//! incomplete sampling, after Stadler's constant-rate formulation.

use tact_common::Time;

/// Relative rate difference below which the critical-branching limit is used
/// instead of the general expressions.
const CRITICAL_EPS: f64 = 1e-9;

/// Probability that `k` of `n` species sampled under a Yule process include
/// the crown node of the full clade. Zero when fewer than two are sampled.
pub fn crown_capture_probability(k: usize, n: usize) -> f64 {
    assert!(k <= n, "sampled {} exceeds diversity {}", k, n);
    if k < 2 {
        return 0.0;
    }
    1.0 - 2.0 * (n - k) as f64 / ((n - 1) as f64 * (k + 1) as f64)
}

fn log_den(t: Time, birth: f64, death: f64, rho: f64) -> f64 {
    let r = birth - death;
    (rho * birth + (birth * (1.0 - rho) - death) * (-r * t).exp()).ln()
}

/// `ln p1(t)`: probability density that a lineage alive at time `t` leaves
/// exactly one sampled descendant lineage at the present.
pub fn log_p1(t: Time, birth: f64, death: f64, rho: f64) -> f64 {
    let r = birth - death;
    if r <= 0.0 {
        return f64::NEG_INFINITY;
    }
    if r < CRITICAL_EPS * birth.max(1.0) {
        return rho.ln() - 2.0 * (1.0 + rho * birth * t).ln();
    }
    rho.ln() + 2.0 * r.ln() - r * t - 2.0 * log_den(t, birth, death, rho)
}

/// `ln (1 - p0(t))`: probability that a lineage alive at time `t` has any
/// sampled descendant at the present.
pub fn log_one_minus_p0(t: Time, birth: f64, death: f64, rho: f64) -> f64 {
    let r = birth - death;
    if r <= 0.0 {
        return f64::NEG_INFINITY;
    }
    if r < CRITICAL_EPS * birth.max(1.0) {
        return rho.ln() - (1.0 + rho * birth * t).ln();
    }
    rho.ln() + r.ln() - log_den(t, birth, death, rho)
}

/// Negative log-likelihood of the branching times of a reconstructed clade,
/// conditioned on the survival of both crown lineages. `times` must be
/// sorted oldest first; the first entry is the crown age.
pub fn bd_neg_log_likelihood(birth: f64, death: f64, rho: f64, times: &[Time]) -> f64 {
    assert!(!times.is_empty());
    assert!(rho > 0.0 && rho <= 1.0);
    if !(birth.is_finite() && death.is_finite()) || birth <= 0.0 || death < 0.0 || birth <= death
    {
        return f64::INFINITY;
    }
    let crown = times[0];
    let mut lik = 2.0 * log_p1(crown, birth, death, rho)
        - 2.0 * log_one_minus_p0(crown, birth, death, rho);
    for &t in &times[1..] {
        lik += birth.ln() + log_p1(t, birth, death, rho);
    }
    if lik.is_nan() {
        return f64::INFINITY;
    }
    -lik
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn ccp_basics() {
        assert_eq!(crown_capture_probability(0, 10), 0.0);
        assert_eq!(crown_capture_probability(1, 10), 0.0);
        assert_relative_eq!(crown_capture_probability(10, 10), 1.0);
        assert_relative_eq!(
            crown_capture_probability(2, 3),
            1.0 - 2.0 / 6.0,
            epsilon = 1e-12
        );
    }

    #[test]
    fn ccp_complete_sampling_is_certain() {
        for n in [2usize, 3, 17, 400] {
            assert_relative_eq!(crown_capture_probability(n, n), 1.0);
        }
    }

    #[test]
    fn yule_case_matches_closed_form() {
        // With death = 0 and rho = 1: p1(t) = e^{-bt} and survival is
        // certain, so the conditioned log-likelihood collapses to
        // -2 b t_crown + sum(ln b - b t_i) over the younger times.
        let b = 0.7;
        let times = [3.0, 2.0, 1.0];
        let nll = bd_neg_log_likelihood(b, 0.0, 1.0, &times);
        let mut expect = -2.0 * b * times[0];
        for &t in &times[1..] {
            expect += b.ln() - b * t;
        }
        assert_relative_eq!(nll, -expect, epsilon = 1e-10);
    }

    #[test]
    fn infeasible_rates_are_infinite() {
        let times = [2.0, 1.0];
        assert_eq!(bd_neg_log_likelihood(0.0, 0.0, 0.5, &times), f64::INFINITY);
        assert_eq!(bd_neg_log_likelihood(1.0, 1.5, 0.5, &times), f64::INFINITY);
        assert_eq!(bd_neg_log_likelihood(-1.0, 0.0, 0.5, &times), f64::INFINITY);
    }

    #[test]
    fn critical_limit_is_continuous() {
        let times = [4.0, 2.5, 1.0];
        let near = bd_neg_log_likelihood(1.0, 1.0 - 1e-12, 0.6, &times);
        let close = bd_neg_log_likelihood(1.0, 1.0 - 1e-6, 0.6, &times);
        assert!(near.is_finite());
        assert!((near - close).abs() < 1e-3);
    }

    #[test]
    fn likelihood_prefers_truthier_rates() {
        // Times drawn in spirit from a Yule process with b near 0.5; the
        // likelihood at b = 0.5 should beat wildly wrong rates.
        let times = [6.0, 3.1, 2.2, 1.4, 0.9, 0.4];
        let good = bd_neg_log_likelihood(0.5, 0.0, 1.0, &times);
        let slow = bd_neg_log_likelihood(0.01, 0.0, 1.0, &times);
        let fast = bd_neg_log_likelihood(50.0, 0.0, 1.0, &times);
        assert!(good < slow);
        assert!(good < fast);
    }
}

#[cfg(test)]
mod properties {
    use super::*;
    use proptest::prelude::*;

    fn sampled_of_known() -> impl Strategy<Value = (usize, usize)> {
        (2usize..400).prop_flat_map(|n| (2..=n, Just(n)))
    }

    proptest! {
        #[test]
        fn ccp_is_a_probability_monotone_in_k((k, n) in sampled_of_known()) {
            let ccp = crown_capture_probability(k, n);
            prop_assert!((0.0..=1.0).contains(&ccp), "ccp({}, {}) = {}", k, n, ccp);
            if k < n {
                prop_assert!(crown_capture_probability(k + 1, n) >= ccp);
            }
            prop_assert_eq!(crown_capture_probability(n, n), 1.0);
        }
    }
}
