//! Laplace(loc, scale) fit and sample. Closed-form MLE: `loc` is the sample
//! median, `scale` is the mean absolute deviation from the median.

use rand::Rng;

use super::ReturnDistribution;
use crate::error::FitError;

pub fn median(xs: &[f64]) -> f64 {
    let mut sorted = xs.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let n = sorted.len();
    if n % 2 == 0 {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    } else {
        sorted[n / 2]
    }
}

fn log_likelihood(xs: &[f64], loc: f64, scale: f64) -> f64 {
    let n = xs.len() as f64;
    let sum_abs_dev: f64 = xs.iter().map(|x| (x - loc).abs()).sum();
    -n * (2.0 * scale).ln() - sum_abs_dev / scale
}

pub fn fit(returns: &[f64]) -> Result<(ReturnDistribution, f64, usize), FitError> {
    let loc = median(returns);
    let scale = returns.iter().map(|x| (x - loc).abs()).sum::<f64>() / returns.len() as f64;
    if scale <= 0.0 {
        return Err(FitError::ImplausibleParams(
            "Laplace scale degenerate (all-identical returns)".into(),
        ));
    }
    let ll = log_likelihood(returns, loc, scale);
    Ok((ReturnDistribution::Laplace { loc, scale }, ll, 1))
}

/// Method-of-moments fallback used by the orchestrator-level `fallback_to_default`.
pub fn method_of_moments(returns: &[f64]) -> (ReturnDistribution, f64) {
    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let scale = (returns.iter().map(|x| (x - mean).abs()).sum::<f64>() / n).max(1e-8);
    let ll = log_likelihood(returns, mean, scale);
    (ReturnDistribution::Laplace { loc: mean, scale }, ll)
}

/// Inverse-CDF sampling: `loc - scale * sign(u) * ln(1 - 2|u|)` for `u ~
/// Uniform(-0.5, 0.5)`.
pub fn sample(rng: &mut impl Rng, n: usize, loc: f64, scale: f64) -> Vec<f64> {
    (0..n)
        .map(|_| {
            let u: f64 = rng.random_range(-0.5..0.5);
            loc - scale * u.signum() * (1.0 - 2.0 * u.abs()).ln()
        })
        .collect()
}
