//! GarchT(omega, alpha, beta, df): a GARCH(1,1) variance recursion with
//! standardized Student-t innovations.
//!
//! `sigma2_t = omega + alpha * eps_{t-1}^2 + beta * sigma2_{t-1}`, with
//! `eps_t = sigma_t * z_t` and `z_t` drawn from a Student-t standardized to
//! unit variance. Fitting is a small grid search over `(alpha, beta, df)`
//! with `omega` pinned to the implied unconditional variance at each grid
//! point (`omega = var * (1 - alpha - beta)`), which keeps every candidate
//! stationary by construction and collapses the search to the admissible
//! region instead of rejecting most of a free 4-D grid.

use rand::Rng;
use statrs::distribution::{Continuous, StudentsT};

use super::ReturnDistribution;
use crate::distributions::FitOptions;
use crate::error::FitError;

const ALPHA_GRID: &[f64] = &[0.02, 0.05, 0.08, 0.12, 0.18];
const BETA_GRID: &[f64] = &[0.70, 0.78, 0.85, 0.90, 0.94];
const DF_GRID: &[f64] = &[4.0, 6.0, 8.0, 12.0, 20.0, 40.0];

/// Unit-variance scale factor so that `Var(scale * T_df) == 1`.
fn unit_variance_scale(df: f64) -> f64 {
    ((df - 2.0) / df).sqrt()
}

/// Run the variance recursion, returning `sigma2` for every return in `xs`
/// (seeded with the sample variance for `sigma2[0]`).
fn variance_path(xs: &[f64], omega: f64, alpha: f64, beta: f64) -> Vec<f64> {
    let n = xs.len();
    let mut sigma2 = vec![0.0; n];
    let unconditional = xs.iter().map(|x| x * x).sum::<f64>() / n as f64;
    sigma2[0] = unconditional.max(1e-12);
    for t in 1..n {
        sigma2[t] = omega + alpha * xs[t - 1].powi(2) + beta * sigma2[t - 1];
        sigma2[t] = sigma2[t].max(1e-12);
    }
    sigma2
}

fn log_likelihood(xs: &[f64], sigma2: &[f64], df: f64) -> f64 {
    let scale_factor = unit_variance_scale(df);
    let mut ll = 0.0;
    for (x, s2) in xs.iter().zip(sigma2) {
        let sigma = s2.sqrt();
        let scale = (sigma * scale_factor).max(1e-12);
        let Ok(t) = StudentsT::new(0.0, scale, df) else {
            return f64::NEG_INFINITY;
        };
        ll += t.pdf(*x).ln();
    }
    ll
}

pub fn fit(
    returns: &[f64],
    options: &FitOptions,
) -> Result<(ReturnDistribution, f64, usize), FitError> {
    let sample_var = {
        let mean = returns.iter().sum::<f64>() / returns.len() as f64;
        returns.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / returns.len() as f64
    };
    if sample_var <= 0.0 {
        return Err(FitError::ImplausibleParams(
            "GARCH sample variance degenerate".into(),
        ));
    }

    let mut best: Option<(f64, f64, f64, f64, f64)> = None; // (ll, omega, alpha, beta, df)
    let mut visited = 0usize;

    'grid: for &alpha in ALPHA_GRID {
        for &beta in BETA_GRID {
            if alpha + beta >= 0.999 {
                continue;
            }
            let omega = sample_var * (1.0 - alpha - beta);
            let sigma2 = variance_path(returns, omega, alpha, beta);
            for &df in DF_GRID {
                if visited >= options.max_iterations {
                    break 'grid;
                }
                visited += 1;
                let ll = log_likelihood(returns, &sigma2, df);
                let better = match &best {
                    Some((best_ll, ..)) => ll > *best_ll,
                    None => true,
                };
                if better {
                    best = Some((ll, omega, alpha, beta, df));
                }
            }
        }
    }

    let Some((ll, omega, alpha, beta, df)) = best else {
        return Err(FitError::NonConvergence {
            iterations: visited,
            tolerance: options.tolerance,
        });
    };

    if !ll.is_finite() {
        return Err(FitError::NonConvergence {
            iterations: visited,
            tolerance: options.tolerance,
        });
    }

    Ok((
        ReturnDistribution::GarchT {
            omega,
            alpha,
            beta,
            df,
        },
        ll,
        visited,
    ))
}

/// Sample a single recursive path of length `n`. The recursion's internal
/// seed is derived deterministically from the caller's `rng` state by
/// drawing the seeding innovation from the same stream (design note:
/// "Deterministic seed derivation").
pub fn sample(rng: &mut impl Rng, n: usize, omega: f64, alpha: f64, beta: f64, df: f64) -> Vec<f64> {
    let scale_factor = unit_variance_scale(df);
    let unconditional = if (1.0 - alpha - beta).abs() > 1e-9 {
        (omega / (1.0 - alpha - beta)).max(1e-12)
    } else {
        omega.max(1e-12)
    };
    let mut sigma2 = unconditional;
    let mut eps_prev = 0.0;
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        if i > 0 {
            sigma2 = omega + alpha * eps_prev * eps_prev + beta * sigma2;
        }
        sigma2 = sigma2.max(1e-12);
        let sigma = sigma2.sqrt();
        let scale = (sigma * scale_factor).max(1e-12);
        let t = StudentsT::new(0.0, scale, df).expect("valid StudentT params");
        let u: f64 = rng.random_range(1e-12..1.0 - 1e-12);
        use statrs::distribution::ContinuousCDF;
        let eps = t.inverse_cdf(u);
        out.push(eps);
        eps_prev = eps;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn synthetic_returns(n: usize, seed: u64) -> Vec<f64> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        sample(&mut rng, n, 1e-6, 0.08, 0.85, 8.0)
    }

    #[test]
    fn fit_returns_stationary_params() {
        let returns = synthetic_returns(400, 5);
        let (dist, ll, iters) = fit(&returns, &FitOptions::default()).unwrap();
        if let ReturnDistribution::GarchT { alpha, beta, .. } = dist {
            assert!(alpha + beta < 0.999);
        } else {
            panic!("expected GarchT");
        }
        assert!(ll.is_finite());
        assert!(iters > 0);
    }

    #[test]
    fn sample_is_deterministic() {
        let mut r1 = ChaCha8Rng::seed_from_u64(9);
        let mut r2 = ChaCha8Rng::seed_from_u64(9);
        let a = sample(&mut r1, 300, 1e-6, 0.08, 0.85, 8.0);
        let b = sample(&mut r2, 300, 1e-6, 0.08, 0.85, 8.0);
        assert_eq!(a, b);
    }
}
