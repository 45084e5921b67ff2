//! Derivative-free minimizers used by the rate estimator: a bounded scalar
//! search (golden section with successive parabolic interpolation), a
//! Nelder-Mead simplex for the two-parameter fits, and a simulated-annealing
//! sweep used when the simplex stalls on flat or pathological surfaces.

use rand::Rng;
use rand_distr::{Distribution, Normal};

#[derive(Debug, Clone, Copy)]
pub struct ScalarFit {
    pub x: f64,
    pub fx: f64,
    pub iters: usize,
}

/// Clamp non-finite objective values so a stray NaN cannot poison a
/// comparison chain.
fn guard<F: Fn(f64) -> f64>(f: &F, x: f64) -> f64 {
    let v = f(x);
    if v.is_finite() {
        v
    } else {
        f64::INFINITY
    }
}

fn guard_n<F: Fn(&[f64]) -> f64>(f: &F, x: &[f64]) -> f64 {
    let v = f(x);
    if v.is_nan() {
        f64::INFINITY
    } else {
        v
    }
}

/// Minimize `f` on `[lo, hi]` by golden-section search with parabolic
/// interpolation steps where the surface supports them.
pub fn minimize_scalar_bounded<F: Fn(f64) -> f64>(
    f: F,
    lo: f64,
    hi: f64,
    xatol: f64,
    max_iter: usize,
) -> ScalarFit {
    assert!(lo < hi);
    let golden = 0.5 * (3.0 - 5.0f64.sqrt());
    let sqrt_eps = f64::EPSILON.sqrt();

    let (mut a, mut b) = (lo, hi);
    let mut xf = a + golden * (b - a);
    let (mut x1, mut x2) = (xf, xf);
    let mut fx = guard(&f, xf);
    let (mut f1, mut f2) = (fx, fx);
    let (mut d, mut e) = (0.0f64, 0.0f64);
    let mut iters = 1usize;

    let mut xm = 0.5 * (a + b);
    let mut tol1 = sqrt_eps * xf.abs() + xatol / 3.0;
    let mut tol2 = 2.0 * tol1;

    while (xf - xm).abs() > tol2 - 0.5 * (b - a) && iters < max_iter {
        let mut use_golden = true;
        if e.abs() > tol1 {
            // Try a parabola through (x1, f1), (x2, f2), (xf, fx).
            let r = (xf - x1) * (fx - f2);
            let mut q = (xf - x2) * (fx - f1);
            let mut p = (xf - x2) * q - (xf - x1) * r;
            q = 2.0 * (q - r);
            if q > 0.0 {
                p = -p;
            }
            q = q.abs();
            let r_prev = e;
            e = d;
            if p.abs() < (0.5 * q * r_prev).abs() && p > q * (a - xf) && p < q * (b - xf) {
                d = p / q;
                let x = xf + d;
                use_golden = false;
                if (x - a) < tol2 || (b - x) < tol2 {
                    d = if xm >= xf { tol1 } else { -tol1 };
                }
            }
        }
        if use_golden {
            e = if xf >= xm { a - xf } else { b - xf };
            d = golden * e;
        }
        let step = if d >= 0.0 { d.abs().max(tol1) } else { -d.abs().max(tol1) };
        let x = xf + step;
        let fu = guard(&f, x);
        iters += 1;

        if fu <= fx {
            if x >= xf {
                a = xf;
            } else {
                b = xf;
            }
            x1 = x2;
            f1 = f2;
            x2 = xf;
            f2 = fx;
            xf = x;
            fx = fu;
        } else {
            if x < xf {
                a = x;
            } else {
                b = x;
            }
            if fu <= f2 || x2 == xf {
                x1 = x2;
                f1 = f2;
                x2 = x;
                f2 = fu;
            } else if fu <= f1 || x1 == xf || x1 == x2 {
                x1 = x;
                f1 = fu;
            }
        }
        xm = 0.5 * (a + b);
        tol1 = sqrt_eps * xf.abs() + xatol / 3.0;
        tol2 = 2.0 * tol1;
    }

    ScalarFit { x: xf, fx, iters }
}

#[derive(Debug, Clone)]
pub struct SimplexFit {
    pub x: Vec<f64>,
    pub fx: f64,
    pub iters: usize,
    pub converged: bool,
}

/// Nelder-Mead with the standard reflection, expansion, contraction, and
/// shrink coefficients. Feasibility is the objective's business: returning
/// infinity for an infeasible point keeps the simplex inside the region,
/// provided the start is feasible.
pub fn nelder_mead<F: Fn(&[f64]) -> f64>(
    f: F,
    x0: &[f64],
    max_iter: usize,
    ftol: f64,
) -> SimplexFit {
    let n = x0.len();
    assert!(n >= 1);
    let (alpha, gamma, rho, sigma) = (1.0, 2.0, 0.5, 0.5);

    let mut simplex: Vec<Vec<f64>> = vec![x0.to_vec()];
    for i in 0..n {
        let mut v = x0.to_vec();
        if v[i] != 0.0 {
            v[i] *= 1.05;
        } else {
            v[i] = 0.00025;
        }
        simplex.push(v);
    }
    let mut values: Vec<f64> = simplex.iter().map(|v| guard_n(&f, v)).collect();
    let mut iters = 0usize;

    loop {
        // Order the simplex, best vertex first.
        let mut order: Vec<usize> = (0..=n).collect();
        order.sort_by(|&i, &j| values[i].partial_cmp(&values[j]).unwrap());
        let reordered: Vec<Vec<f64>> = order.iter().map(|&i| simplex[i].clone()).collect();
        let revalued: Vec<f64> = order.iter().map(|&i| values[i]).collect();
        simplex = reordered;
        values = revalued;

        let spread = (values[n] - values[0]).abs();
        if spread <= ftol || iters >= max_iter {
            return SimplexFit {
                x: simplex[0].clone(),
                fx: values[0],
                iters,
                converged: spread <= ftol,
            };
        }
        iters += 1;

        let mut centroid = vec![0.0; n];
        for v in &simplex[..n] {
            for (c, x) in centroid.iter_mut().zip(v) {
                *c += x / n as f64;
            }
        }

        let at = |base: &[f64], coef: f64, away: &[f64]| -> Vec<f64> {
            base.iter()
                .zip(away)
                .map(|(c, w)| c + coef * (c - w))
                .collect()
        };

        let reflected = at(&centroid, alpha, &simplex[n]);
        let f_reflected = guard_n(&f, &reflected);
        if f_reflected < values[0] {
            let expanded = at(&centroid, gamma, &simplex[n]);
            let f_expanded = guard_n(&f, &expanded);
            if f_expanded < f_reflected {
                simplex[n] = expanded;
                values[n] = f_expanded;
            } else {
                simplex[n] = reflected;
                values[n] = f_reflected;
            }
            continue;
        }
        if f_reflected < values[n - 1] {
            simplex[n] = reflected;
            values[n] = f_reflected;
            continue;
        }
        let contracted: Vec<f64> = centroid
            .iter()
            .zip(&simplex[n])
            .map(|(c, w)| c + rho * (w - c))
            .collect();
        let f_contracted = guard_n(&f, &contracted);
        if f_contracted < values[n] {
            simplex[n] = contracted;
            values[n] = f_contracted;
            continue;
        }
        // Shrink towards the best vertex.
        for i in 1..=n {
            let shrunk: Vec<f64> = simplex[0]
                .iter()
                .zip(&simplex[i])
                .map(|(b, v)| b + sigma * (v - b))
                .collect();
            values[i] = guard_n(&f, &shrunk);
            simplex[i] = shrunk;
        }
    }
}

/// Simulated annealing over a box, with Gaussian proposals whose scale
/// cools geometrically. The objective may return infinity to veto a point.
pub fn simulated_annealing<F: Fn(&[f64]) -> f64, R: Rng>(
    f: F,
    x0: &[f64],
    lo: &[f64],
    hi: &[f64],
    sweeps: usize,
    rng: &mut R,
) -> SimplexFit {
    let n = x0.len();
    assert_eq!(lo.len(), n);
    assert_eq!(hi.len(), n);

    let mut current = x0.to_vec();
    let mut f_current = guard_n(&f, &current);
    let mut best = current.clone();
    let mut f_best = f_current;

    let mut temp = 1.0f64;
    let cooling = 0.95f64;
    let mut iters = 0usize;

    for _ in 0..sweeps {
        for i in 0..n {
            iters += 1;
            let scale = 0.1 * (hi[i] - lo[i]) * temp.max(1e-3);
            let normal = Normal::new(0.0, scale).expect("positive proposal scale");
            let mut candidate = current.clone();
            candidate[i] = (candidate[i] + normal.sample(rng)).clamp(lo[i], hi[i]);
            let f_candidate = guard_n(&f, &candidate);
            let accept = if f_candidate <= f_current {
                true
            } else {
                let delta = f_candidate - f_current;
                delta.is_finite() && rng.gen::<f64>() < (-delta / temp.max(1e-12)).exp()
            };
            if accept {
                current = candidate;
                f_current = f_candidate;
                if f_current < f_best {
                    best = current.clone();
                    f_best = f_current;
                }
            }
        }
        temp *= cooling;
    }

    SimplexFit {
        x: best,
        fx: f_best,
        iters,
        converged: f_best.is_finite(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand_pcg::Pcg64;

    #[test]
    fn scalar_finds_parabola_minimum() {
        let fit = minimize_scalar_bounded(|x| (x - 1.3).powi(2), 0.0, 10.0, 1e-8, 200);
        assert_relative_eq!(fit.x, 1.3, epsilon = 1e-5);
    }

    #[test]
    fn scalar_respects_bounds() {
        let fit = minimize_scalar_bounded(|x| -x, 0.0, 2.0, 1e-8, 200);
        assert!(fit.x <= 2.0 && fit.x > 1.9);
    }

    #[test]
    fn scalar_survives_infinite_plateaus() {
        let fit = minimize_scalar_bounded(
            |x| if x < 0.5 { f64::INFINITY } else { (x - 0.7).powi(2) },
            0.0,
            1.0,
            1e-8,
            200,
        );
        assert_relative_eq!(fit.x, 0.7, epsilon = 1e-4);
    }

    #[test]
    fn simplex_minimizes_rosenbrock() {
        let rosen =
            |v: &[f64]| 100.0 * (v[1] - v[0] * v[0]).powi(2) + (1.0 - v[0]).powi(2);
        let fit = nelder_mead(rosen, &[-1.2, 1.0], 2000, 1e-12);
        assert_relative_eq!(fit.x[0], 1.0, epsilon = 1e-3);
        assert_relative_eq!(fit.x[1], 1.0, epsilon = 1e-3);
    }

    #[test]
    fn simplex_stays_out_of_vetoed_region() {
        let f = |v: &[f64]| {
            if v[0] < 0.0 {
                f64::INFINITY
            } else {
                (v[0] - 0.2).powi(2) + v[1] * v[1]
            }
        };
        let fit = nelder_mead(f, &[1.0, 1.0], 2000, 1e-12);
        assert!(fit.x[0] >= 0.0);
        assert_relative_eq!(fit.x[0], 0.2, epsilon = 1e-3);
    }

    #[test]
    fn annealing_improves_on_a_flat_start() {
        // Shallow two-well surface whose global minimum sits at x = 2,
        // far from the start.
        let f = |v: &[f64]| {
            let x = v[0];
            (x * x - 4.0).powi(2) / 64.0 + (x - 2.0).powi(2) / 16.0
        };
        let mut rng = Pcg64::seed_from_u64(7);
        let fit = simulated_annealing(f, &[-2.0], &[-4.0], &[4.0], 400, &mut rng);
        assert!(fit.fx < f(&[-2.0]));
        assert!(fit.fx < 0.5);
    }

    #[test]
    fn annealing_is_deterministic_under_a_seed() {
        let f = |v: &[f64]| (v[0] - 0.3).powi(2) + (v[1] + 0.4).powi(2);
        let run = |seed: u64| {
            let mut rng = Pcg64::seed_from_u64(seed);
            simulated_annealing(&f, &[1.0, 1.0], &[-2.0, -2.0], &[2.0, 2.0], 100, &mut rng)
        };
        let a = run(11);
        let b = run(11);
        assert_eq!(a.x, b.x);
        assert_eq!(a.fx, b.fx);
    }
}
