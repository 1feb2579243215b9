//! Strategy Engine (C4): the signal contract, a name-keyed registry, and the
//! built-in stock/option strategies.
//!
//! Mirrors the teacher's registry shape (`strategies::all_strategies` /
//! `strategies::find_strategy` in `strategies/mod.rs`) generalized from
//! options-leg definitions to `Strategy` trait objects, and the signal-array
//! idiom of `signals/helpers.rs`'s `SignalFn` generalized from a polars
//! `Series` to the flat path-shaped arrays C2 produces.

pub mod option;
pub mod stock;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::MissingFeatureError;
use crate::paths::PricePaths;
use crate::pricing::OptionSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Stock,
    Option,
}

/// Per-step, per-path state features a strategy may read. Each value series
/// is aligned to the price-path step axis (length `n_steps + 1`, matching
/// `PricePaths` columns) for one representative path, or provided as a
/// single scalar broadcast across all paths (e.g. a realized-vol estimate
/// computed once from historical bars). Strategies declare which of these
/// they read via `declared_features`; absent required features are a hard
/// error, absent optional ones a warning with a caller-supplied default.
pub type FeatureMap = BTreeMap<String, Vec<f64>>;

/// Two int8-shaped arrays of the signal contract (section 3): `positions`
/// carries the directional signal in {-1, 0, +1}; `sizes` carries the
/// integer position-size multiplier for sized variants (1 for unsized
/// strategies). Both have shape `(n_paths, n_steps)` — one column shorter
/// than `PricePaths`, since the signal at step `t` drives the transition
/// from step `t` to `t+1`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StrategySignals {
    pub n_paths: usize,
    pub n_steps: usize,
    pub positions: Vec<i8>,
    pub sizes: Vec<i32>,
    pub features_used: BTreeSet<String>,
    pub option_spec: Option<OptionSpec>,
}

impl StrategySignals {
    pub fn position(&self, path: usize, step: usize) -> i8 {
        self.positions[path * self.n_steps + step]
    }

    pub fn size(&self, path: usize, step: usize) -> i32 {
        self.sizes[path * self.n_steps + step]
    }

    fn validate_shape(&self, paths: &PricePaths) -> Result<(), MissingFeatureError> {
        let (n_paths, n_cols) = paths.shape();
        if self.n_paths != n_paths || self.n_steps != n_cols - 1 {
            return Err(MissingFeatureError(format!(
                "signal shape ({}, {}) does not match paths shape minus one column ({}, {})",
                self.n_paths,
                self.n_steps,
                n_paths,
                n_cols - 1
            )));
        }
        Ok(())
    }
}

/// State carried across steps for a single path's position-sizing and
/// early-exercise decisions.
#[derive(Debug, Clone, Copy, Default)]
pub struct PositionState {
    pub step: usize,
    pub position: i8,
    pub entry_price: f64,
    pub current_price: f64,
}

pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn kind(&self) -> StrategyKind;

    /// Feature keys this strategy *may* read. A required subset is declared
    /// via [`Strategy::required_features`]; anything else is optional.
    fn declared_features(&self) -> &'static [&'static str] {
        &[]
    }

    fn required_features(&self) -> &'static [&'static str] {
        &[]
    }

    /// Emit `StrategySignals` for every path in `paths`. `params` carries
    /// the strategy-specific parameter set (e.g. `fast`/`slow` for a dual
    /// moving-average crossover). `option_spec` is required when
    /// `kind() == StrategyKind::Option` (validated by [`generate`]).
    fn generate_signals(
        &self,
        paths: &PricePaths,
        features: &FeatureMap,
        params: &BTreeMap<String, f64>,
        option_spec: Option<&OptionSpec>,
    ) -> Result<StrategySignals, MissingFeatureError>;

    /// Whether the position should be exercised early at the given state.
    /// Never automatic; strategies that never exercise early simply keep
    /// the default `false`.
    fn check_early_exercise(&self, _position_state: &PositionState) -> bool {
        false
    }
}

/// Validate the feature contract, dispatch to the strategy, and validate the
/// resulting shape — the entry point orchestrator callers should use instead
/// of calling `Strategy::generate_signals` directly.
pub fn generate(
    strategy: &dyn Strategy,
    paths: &PricePaths,
    features: &FeatureMap,
    params: &BTreeMap<String, f64>,
    option_spec: Option<&OptionSpec>,
) -> Result<StrategySignals, MissingFeatureError> {
    for required in strategy.required_features() {
        if !features.contains_key(*required) {
            return Err(MissingFeatureError((*required).to_string()));
        }
    }
    if strategy.kind() == StrategyKind::Option && option_spec.is_none() {
        return Err(MissingFeatureError(
            "option strategy requires an option_spec".to_string(),
        ));
    }
    let signals = strategy.generate_signals(paths, features, params, option_spec)?;
    signals.validate_shape(paths)?;
    Ok(signals)
}

/// Position sizing: invert a linear price-change expectation to target a
/// configured daily-P&L band, clamped to a per-strategy notional cap
/// (section 4.4). `expected_move` is the per-step expected absolute price
/// change (e.g. `s0 * daily_vol`); `target_band` is the desired P&L per
/// position per step; `cap` is the maximum absolute size.
pub fn size_for_target_band(expected_move: f64, target_band: f64, cap: i32) -> i32 {
    if expected_move <= 0.0 || !expected_move.is_finite() {
        return 0;
    }
    let raw = (target_band / expected_move).round();
    let clamped = raw.clamp(-f64::from(cap), f64::from(cap));
    clamped as i32
}

/// All built-in strategies of `kind`, rebuilt fresh on each call (design
/// note: registries are the only frozen process-wide state, but the
/// strategy *objects* themselves are cheap value types, mirroring the
/// teacher's `all_strategies()` that rebuilds its `Vec<StrategyDef>` rather
/// than caching it).
pub fn all_strategies(kind: StrategyKind) -> Vec<Box<dyn Strategy>> {
    match kind {
        StrategyKind::Stock => vec![
            Box::new(stock::DualSma::default()),
            Box::new(stock::BuyAndHold),
        ],
        StrategyKind::Option => vec![
            Box::new(option::LongCall::default()),
            Box::new(option::CoveredCall::default()),
        ],
    }
}

/// Look up a strategy by `(name, kind)`.
pub fn find_strategy(name: &str, kind: StrategyKind) -> Option<Box<dyn Strategy>> {
    all_strategies(kind).into_iter().find(|s| s.name() == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dist() -> crate::distributions::ReturnDistribution {
        crate::distributions::ReturnDistribution::Laplace {
            loc: 0.0,
            scale: 0.02,
        }
    }

    fn sample_paths() -> PricePaths {
        let t = crate::config::thresholds::Thresholds::default();
        let (paths, _) = crate::paths::generate(100.0, &dist(), 20, 40, 7, &t, 1.0, false, None).unwrap();
        paths
    }

    #[test]
    fn registry_finds_dual_sma() {
        let s = find_strategy("dual_sma", StrategyKind::Stock);
        assert!(s.is_some());
    }

    #[test]
    fn registry_unknown_name_is_none() {
        assert!(find_strategy("nonexistent", StrategyKind::Stock).is_none());
    }

    #[test]
    fn generate_validates_signal_shape() {
        let paths = sample_paths();
        let strategy = stock::BuyAndHold;
        let signals = generate(&strategy, &paths, &FeatureMap::new(), &BTreeMap::new(), None).unwrap();
        assert_eq!(signals.n_paths, 20);
        assert_eq!(signals.n_steps, 40);
    }

    #[test]
    fn option_strategy_without_spec_is_rejected() {
        let paths = sample_paths();
        let strategy = option::LongCall::default();
        let err = generate(&strategy, &paths, &FeatureMap::new(), &BTreeMap::new(), None).unwrap_err();
        assert!(err.0.contains("option_spec"));
    }

    #[test]
    fn size_for_target_band_clamps_to_cap() {
        assert_eq!(size_for_target_band(0.1, 1000.0, 50), 50);
        assert_eq!(size_for_target_band(0.1, -1000.0, 50), -50);
        assert_eq!(size_for_target_band(0.0, 100.0, 50), 0);
    }
}
