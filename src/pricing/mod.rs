//! Option Pricer (C3): closed-form European Black-Scholes with a pluggable
//! `Pricer` seam so a different backend can be swapped in without touching
//! callers (registry-driven polymorphism design note).
//!
//! Grounded on the teacher's `engine/pricing.rs` for the fill/slippage idiom
//! and on the corpus's own Black-Scholes implementation for the closed-form
//! formula and its `statrs::distribution::Normal` CDF usage.

use garde::Validate;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

use crate::error::NumericError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum OptionType {
    Call,
    Put,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum IvSource {
    /// Contract-chain-quoted IV (tried first).
    Provider,
    /// Realized 30-day historical volatility, used when the chain has no quote.
    Realized30d,
    /// Configured fallback constant.
    #[default]
    Default,
}

/// Specification for a single option contract. `iv_source` is written by the
/// pricer the first time IV is resolved and carried forward from there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Validate)]
pub struct OptionSpec {
    #[garde(skip)]
    pub option_type: OptionType,
    #[garde(range(min = 0.000001))]
    pub strike: f64,
    #[garde(range(min = 1))]
    pub maturity_days: u32,
    #[garde(range(min = 0.000001, max = 5.0))]
    pub iv: f64,
    #[garde(skip)]
    pub risk_free_rate: f64,
    #[garde(skip)]
    pub contracts: i32,
    #[garde(skip)]
    #[serde(default)]
    pub iv_source: IvSource,
    /// Price-grid tick size, used for banker's-rounding the strike on lookup.
    #[garde(range(min = 0.0001))]
    #[serde(default = "default_tick_size")]
    pub tick_size: f64,
}

fn default_tick_size() -> f64 {
    0.01
}

/// Round `value` to the nearest multiple of `tick_size` using banker's
/// rounding (round-half-to-even) so repeated repricing near a half-tick
/// boundary doesn't drift upward.
pub fn round_to_tick(value: f64, tick_size: f64) -> f64 {
    if tick_size <= 0.0 {
        return value;
    }
    let units = value / tick_size;
    let rounded = round_half_even(units);
    rounded * tick_size
}

fn round_half_even(x: f64) -> f64 {
    let floor = x.floor();
    let diff = x - floor;
    if (diff - 0.5).abs() < f64::EPSILON {
        if (floor as i64) % 2 == 0 {
            floor
        } else {
            floor + 1.0
        }
    } else {
        x.round()
    }
}

/// Resolve which IV source to use, trying {provider, realized_30d, default}
/// in order and returning the first that offers a usable (finite, positive)
/// quote.
///
/// Open question (unresolved by the design): exact handling when the
/// contract chain returns a technically-valid but stale quote is left to
/// the caller; this resolver treats `provider_iv = Some(x)` as authoritative
/// whenever `x` is finite and positive, staleness detection is out of scope.
pub fn resolve_iv(
    provider_iv: Option<f64>,
    realized_30d_iv: Option<f64>,
    default_iv: f64,
) -> (f64, IvSource) {
    if let Some(iv) = provider_iv.filter(|v| v.is_finite() && *v > 0.0) {
        return (iv, IvSource::Provider);
    }
    if let Some(iv) = realized_30d_iv.filter(|v| v.is_finite() && *v > 0.0) {
        return (iv, IvSource::Realized30d);
    }
    (default_iv, IvSource::Default)
}

/// The six outputs of a European option valuation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Greeks {
    pub premium: f64,
    pub delta: f64,
    pub gamma: f64,
    pub vega: f64,
    pub theta: f64,
    pub rho: f64,
}

impl Greeks {
    fn intrinsic(underlying: f64, strike: f64, option_type: OptionType) -> Self {
        let premium = match option_type {
            OptionType::Call => (underlying - strike).max(0.0),
            OptionType::Put => (strike - underlying).max(0.0),
        };
        Self {
            premium,
            delta: 0.0,
            gamma: 0.0,
            vega: 0.0,
            theta: 0.0,
            rho: 0.0,
        }
    }
}

pub trait Pricer {
    fn price(
        &self,
        underlying: f64,
        strike: f64,
        maturity_years: f64,
        rate: f64,
        iv: f64,
        option_type: OptionType,
    ) -> Result<Greeks, NumericError>;

    /// Vectorized convenience; the default implementation just loops, which
    /// is fine since the kernel itself is the cheap part per the design's
    /// concurrency model (section 5: single-threaded cooperative over
    /// vectorized numerical kernels).
    fn price_vec(
        &self,
        underlying: &[f64],
        strike: f64,
        maturity_years: f64,
        rate: f64,
        iv: f64,
        option_type: OptionType,
    ) -> Result<Vec<Greeks>, NumericError> {
        underlying
            .iter()
            .map(|&s| self.price(s, strike, maturity_years, rate, iv, option_type))
            .collect()
    }
}

/// Closed-form European Black-Scholes pricer.
pub struct BlackScholes;

impl Pricer for BlackScholes {
    fn price(
        &self,
        underlying: f64,
        strike: f64,
        maturity_years: f64,
        rate: f64,
        iv: f64,
        option_type: OptionType,
    ) -> Result<Greeks, NumericError> {
        if iv <= 0.0 {
            return Err(NumericError::InvalidIv(iv));
        }
        if maturity_years <= 0.0 {
            return Ok(Greeks::intrinsic(underlying, strike, option_type));
        }

        let sqrt_t = maturity_years.sqrt();
        let d1 = ((underlying / strike).ln() + (rate + 0.5 * iv * iv) * maturity_years)
            / (iv * sqrt_t);
        let d2 = d1 - iv * sqrt_t;

        let std_normal = Normal::new(0.0, 1.0).expect("standard normal is always valid");
        let n_d1 = std_normal.cdf(d1);
        let n_d2 = std_normal.cdf(d2);
        let pdf_d1 = std_normal_pdf(d1);
        let discount = (-rate * maturity_years).exp();

        let (premium, delta, rho_sign_n) = match option_type {
            OptionType::Call => (
                underlying * n_d1 - strike * discount * n_d2,
                n_d1,
                n_d2,
            ),
            OptionType::Put => (
                strike * discount * (1.0 - n_d2) - underlying * (1.0 - n_d1),
                n_d1 - 1.0,
                -(1.0 - n_d2),
            ),
        };

        let gamma = pdf_d1 / (underlying * iv * sqrt_t);
        let vega = underlying * pdf_d1 * sqrt_t;
        let theta = match option_type {
            OptionType::Call => {
                -(underlying * pdf_d1 * iv) / (2.0 * sqrt_t) - rate * strike * discount * n_d2
            }
            OptionType::Put => {
                -(underlying * pdf_d1 * iv) / (2.0 * sqrt_t) + rate * strike * discount * (1.0 - n_d2)
            }
        };
        let rho = strike * maturity_years * discount * rho_sign_n;

        if !premium.is_finite() {
            return Err(NumericError::InvalidIv(iv));
        }

        Ok(Greeks {
            premium,
            delta,
            gamma,
            vega,
            theta,
            rho,
        })
    }
}

fn std_normal_pdf(x: f64) -> f64 {
    (-0.5 * x * x).exp() / (2.0 * std::f64::consts::PI).sqrt()
}

/// Reprice `spec` at every step along `underlying_path`, shrinking
/// time-to-maturity by one bar per step. `exercise_at` marks a step (if any)
/// where the strategy asserts early exercise; from that step on the position
/// realizes intrinsic value and flattens (never automatic — section 4.3).
pub fn price_along_path(
    pricer: &dyn Pricer,
    underlying_path: &[f64],
    spec: &OptionSpec,
    bars_per_year: f64,
    exercise_at: Option<usize>,
) -> Result<Vec<Greeks>, NumericError> {
    let maturity_bars = f64::from(spec.maturity_days);
    let mut out = Vec::with_capacity(underlying_path.len());
    let mut flattened_value: Option<f64> = None;

    for (step, &s) in underlying_path.iter().enumerate() {
        if let Some(ex_step) = exercise_at {
            if step >= ex_step {
                let value = *flattened_value.get_or_insert_with(|| {
                    Greeks::intrinsic(underlying_path[ex_step], spec.strike, spec.option_type)
                        .premium
                });
                out.push(Greeks {
                    premium: value,
                    delta: 0.0,
                    gamma: 0.0,
                    vega: 0.0,
                    theta: 0.0,
                    rho: 0.0,
                });
                continue;
            }
        }
        let remaining_bars = (maturity_bars - step as f64).max(0.0);
        let maturity_years = remaining_bars / bars_per_year;
        let g = pricer.price(
            s,
            spec.strike,
            maturity_years,
            spec.risk_free_rate,
            spec.iv,
            spec.option_type,
        )?;
        out.push(g);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atm_call_has_roughly_half_delta() {
        let g = BlackScholes
            .price(100.0, 100.0, 1.0, 0.02, 0.2, OptionType::Call)
            .unwrap();
        assert!(g.delta > 0.5 && g.delta < 0.65);
        assert!(g.premium > 0.0);
    }

    #[test]
    fn zero_maturity_is_intrinsic_with_zero_greeks() {
        let g = BlackScholes
            .price(110.0, 100.0, 0.0, 0.02, 0.2, OptionType::Call)
            .unwrap();
        assert!((g.premium - 10.0).abs() < 1e-10);
        assert_eq!(g.delta, 0.0);
        assert_eq!(g.gamma, 0.0);
    }

    #[test]
    fn non_positive_iv_is_rejected() {
        let err = BlackScholes
            .price(100.0, 100.0, 1.0, 0.02, 0.0, OptionType::Call)
            .unwrap_err();
        assert!(matches!(err, NumericError::InvalidIv(_)));
    }

    #[test]
    fn put_call_parity_holds() {
        let call = BlackScholes
            .price(100.0, 95.0, 0.5, 0.03, 0.25, OptionType::Call)
            .unwrap();
        let put = BlackScholes
            .price(100.0, 95.0, 0.5, 0.03, 0.25, OptionType::Put)
            .unwrap();
        let lhs = call.premium - put.premium;
        let rhs = 100.0 - 95.0 * (-0.03_f64 * 0.5).exp();
        assert!((lhs - rhs).abs() < 1e-8);
    }

    #[test]
    fn round_to_tick_half_even() {
        assert!((round_to_tick(1.025, 0.05) - 1.00).abs() < 1e-10);
        assert!((round_to_tick(1.075, 0.05) - 1.10).abs() < 1e-10);
    }

    #[test]
    fn resolve_iv_prefers_provider() {
        let (iv, source) = resolve_iv(Some(0.22), Some(0.3), 0.25);
        assert!((iv - 0.22).abs() < 1e-12);
        assert_eq!(source, IvSource::Provider);
    }

    #[test]
    fn resolve_iv_falls_back_to_realized_then_default() {
        let (iv, source) = resolve_iv(None, Some(0.3), 0.25);
        assert_eq!(source, IvSource::Realized30d);
        assert!((iv - 0.3).abs() < 1e-12);

        let (iv, source) = resolve_iv(None, None, 0.25);
        assert_eq!(source, IvSource::Default);
        assert!((iv - 0.25).abs() < 1e-12);
    }

    #[test]
    fn price_along_path_shrinks_maturity_and_honors_exercise() {
        let spec = OptionSpec {
            option_type: OptionType::Call,
            strike: 100.0,
            maturity_days: 10,
            iv: 0.2,
            risk_free_rate: 0.01,
            contracts: 1,
            iv_source: IvSource::Default,
            tick_size: 0.01,
        };
        let path = vec![100.0, 101.0, 102.0, 103.0, 104.0];
        let out = price_along_path(&BlackScholes, &path, &spec, 252.0, Some(2)).unwrap();
        assert_eq!(out.len(), 5);
        // from step 2 onward the position is flattened at intrinsic value
        assert!((out[2].premium - 2.0).abs() < 1e-10);
        assert_eq!(out[2].delta, 0.0);
        assert_eq!(out[3].premium, out[2].premium);
    }
}
