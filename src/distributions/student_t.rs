//! StudentT(loc, scale, df) fit and sample.
//!
//! MLE has no closed form once `df` floats, so we grid-search `df` over the
//! admissible range and, for each candidate, refine `(loc, scale)` with a
//! handful of EM-style reweighting iterations (the textbook fixed-point
//! update for the multivariate-t / location-scale-t family). The grid point
//! with the best log-likelihood wins; `iterations` records grid points
//! visited times EM steps per point, which doubles as the optimizer's
//! iteration cap for the fit record.

use rand::Rng;
use statrs::distribution::{Continuous, ContinuousCDF, StudentsT};

use super::{laplace, ReturnDistribution};
use crate::distributions::FitOptions;
use crate::error::FitError;

const DF_GRID: &[f64] = &[2.5, 3.0, 4.0, 5.0, 6.0, 8.0, 10.0, 15.0, 20.0, 30.0, 50.0, 100.0];
const EM_STEPS: usize = 15;

fn em_refine(xs: &[f64], df: f64) -> (f64, f64) {
    let mut loc = laplace::median(xs);
    let mut scale = {
        let mad = xs.iter().map(|x| (x - loc).abs()).sum::<f64>() / xs.len() as f64;
        (mad * 1.4826).max(1e-8)
    };
    let n = xs.len() as f64;
    for _ in 0..EM_STEPS {
        let weights: Vec<f64> = xs
            .iter()
            .map(|x| {
                let z = (x - loc) / scale;
                (df + 1.0) / (df + z * z)
            })
            .collect();
        let w_sum: f64 = weights.iter().sum();
        let new_loc = xs
            .iter()
            .zip(&weights)
            .map(|(x, w)| x * w)
            .sum::<f64>()
            / w_sum;
        let new_var = xs
            .iter()
            .zip(&weights)
            .map(|(x, w)| w * (x - new_loc).powi(2))
            .sum::<f64>()
            / n;
        loc = new_loc;
        scale = new_var.sqrt().max(1e-8);
    }
    (loc, scale)
}

fn log_likelihood(xs: &[f64], loc: f64, scale: f64, df: f64) -> f64 {
    let Ok(t) = StudentsT::new(loc, scale, df) else {
        return f64::NEG_INFINITY;
    };
    xs.iter().map(|x| t.pdf(*x).ln()).sum()
}

pub fn fit(
    returns: &[f64],
    options: &FitOptions,
) -> Result<(ReturnDistribution, f64, usize), FitError> {
    let mut best: Option<(f64, f64, f64, f64)> = None; // (ll, loc, scale, df)
    let mut grid_points = 0usize;

    for &df in DF_GRID {
        if grid_points >= options.max_iterations {
            break;
        }
        let (loc, scale) = em_refine(returns, df);
        let ll = log_likelihood(returns, loc, scale, df);
        grid_points += 1;
        let better = match &best {
            Some((best_ll, ..)) => ll > *best_ll,
            None => true,
        };
        if better {
            best = Some((ll, loc, scale, df));
        }
    }

    let Some((ll, loc, scale, df)) = best else {
        return Err(FitError::NonConvergence {
            iterations: grid_points,
            tolerance: options.tolerance,
        });
    };

    if !ll.is_finite() {
        return Err(FitError::NonConvergence {
            iterations: grid_points * EM_STEPS,
            tolerance: options.tolerance,
        });
    }

    Ok((
        ReturnDistribution::StudentT { loc, scale, df },
        ll,
        grid_points * EM_STEPS,
    ))
}

pub fn sample(rng: &mut impl Rng, n: usize, loc: f64, scale: f64, df: f64) -> Vec<f64> {
    let t = StudentsT::new(loc, scale, df).expect("valid StudentT params");
    (0..n)
        .map(|_| {
            let u: f64 = rng.random_range(1e-12..1.0 - 1e-12);
            t.inverse_cdf(u)
        })
        .collect()
}
