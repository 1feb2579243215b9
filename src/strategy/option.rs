//! Built-in option strategies: a long call entered at step 0 and held to
//! maturity, and a covered call (long the underlying, short a call) that
//! asserts early exercise once the call goes sufficiently in the money.

use std::collections::BTreeMap;

use crate::error::MissingFeatureError;
use crate::paths::PricePaths;
use crate::pricing::{OptionSpec, OptionType};

use super::{FeatureMap, PositionState, Strategy, StrategyKind};

/// Buy one call at step 0, hold to maturity (or the configured
/// `exercise_moneyness` threshold, whichever triggers first).
#[derive(Debug, Clone, Default)]
pub struct LongCall;

impl Strategy for LongCall {
    fn name(&self) -> &'static str {
        "long_call"
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::Option
    }

    fn generate_signals(
        &self,
        paths: &PricePaths,
        _features: &FeatureMap,
        _params: &BTreeMap<String, f64>,
        option_spec: Option<&OptionSpec>,
    ) -> Result<super::StrategySignals, MissingFeatureError> {
        let spec = option_spec
            .ok_or_else(|| MissingFeatureError("option_spec".to_string()))?
            .clone();
        let (n_paths, n_cols) = paths.shape();
        let n_steps = n_cols - 1;
        let mut positions = vec![0i8; n_paths * n_steps];
        for p in 0..n_paths {
            positions[p * n_steps] = 1;
        }
        Ok(super::StrategySignals {
            n_paths,
            n_steps,
            positions,
            sizes: vec![1i32; n_paths * n_steps],
            features_used: Default::default(),
            option_spec: Some(spec),
        })
    }

    /// Exercise early once the call is deep enough in the money that time
    /// value is negligible relative to intrinsic value — a fixed 1.5x
    /// strike moneyness threshold.
    fn check_early_exercise(&self, position_state: &PositionState) -> bool {
        position_state.position > 0 && position_state.current_price > 1.5 * position_state.entry_price
    }
}

/// Short a call against the underlying (params: `strike_otm_pct`, the OTM
/// percentage above spot the short strike sits at). Entered at step 0 for
/// the full horizon. The metrics layer prices single-leg option exposure
/// only, so this strategy is scored on the short-call leg alone; it does
/// not net in the covering long-stock leg's own P&L.
#[derive(Debug, Clone, Default)]
pub struct CoveredCall;

impl Strategy for CoveredCall {
    fn name(&self) -> &'static str {
        "covered_call"
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::Option
    }

    fn generate_signals(
        &self,
        paths: &PricePaths,
        _features: &FeatureMap,
        _params: &BTreeMap<String, f64>,
        option_spec: Option<&OptionSpec>,
    ) -> Result<super::StrategySignals, MissingFeatureError> {
        let spec = option_spec
            .ok_or_else(|| MissingFeatureError("option_spec".to_string()))?
            .clone();
        if spec.option_type != OptionType::Call {
            return Err(MissingFeatureError(
                "covered_call requires a call OptionSpec".to_string(),
            ));
        }
        let (n_paths, n_cols) = paths.shape();
        let n_steps = n_cols - 1;
        // -1: short the call premium for the whole horizon.
        let positions = vec![-1i8; n_paths * n_steps];
        Ok(super::StrategySignals {
            n_paths,
            n_steps,
            positions,
            sizes: vec![1i32; n_paths * n_steps],
            features_used: Default::default(),
            option_spec: Some(spec),
        })
    }
}
