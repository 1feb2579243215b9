//! Normal(mean, std) fit and sample — closed-form MLE.

use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use super::ReturnDistribution;
use crate::error::FitError;

fn log_likelihood(xs: &[f64], mean: f64, std: f64) -> f64 {
    let n = xs.len() as f64;
    let sum_sq: f64 = xs.iter().map(|x| (x - mean).powi(2)).sum();
    -0.5 * n * (2.0 * std::f64::consts::PI * std * std).ln() - sum_sq / (2.0 * std * std)
}

pub fn fit(returns: &[f64]) -> Result<(ReturnDistribution, f64, usize), FitError> {
    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let var = returns.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    let std = var.sqrt();
    if std <= 0.0 {
        return Err(FitError::ImplausibleParams(
            "Normal std degenerate (all-identical returns)".into(),
        ));
    }
    let ll = log_likelihood(returns, mean, std);
    Ok((ReturnDistribution::Normal { mean, std }, ll, 1))
}

pub fn sample(rng: &mut impl Rng, n: usize, mean: f64, std: f64) -> Vec<f64> {
    (0..n)
        .map(|_| mean + std * rng.sample::<f64, _>(StandardNormal))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn fit_recovers_approximate_params() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let samples = sample(&mut rng, 50_000, 0.0, 0.015);
        let (dist, ll, _) = fit(&samples).unwrap();
        if let ReturnDistribution::Normal { mean, std } = dist {
            assert!(mean.abs() < 0.005);
            assert!((std - 0.015).abs() < 0.002);
        } else {
            panic!("expected Normal");
        }
        assert!(ll.is_finite());
    }
}
