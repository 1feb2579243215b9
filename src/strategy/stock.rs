//! Built-in stock strategies: a dual simple-moving-average crossover and a
//! buy-and-hold baseline, used by `compare` (section 4.7) to contrast a
//! signal-driven strategy against a passive one.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::MissingFeatureError;
use crate::paths::PricePaths;
use crate::pricing::OptionSpec;

use super::{size_for_target_band, FeatureMap, PositionState, Strategy, StrategyKind};

/// Simple moving average over `period` trailing values (inclusive of the
/// current one); `f64::NAN` before the window fills.
fn sma(series: &[f64], period: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; series.len()];
    if period == 0 {
        return out;
    }
    let mut window_sum = 0.0;
    for (i, &v) in series.iter().enumerate() {
        window_sum += v;
        if i >= period {
            window_sum -= series[i - period];
        }
        if i + 1 >= period {
            out[i] = window_sum / period as f64;
        }
    }
    out
}

/// Long when the fast SMA is above the slow SMA, short otherwise; flat
/// while either average is still warming up. Params: `fast`, `slow` (bar
/// counts), optional `sized` (1.0 enables position sizing against
/// `target_band`/`cap`, default unsized i.e. size 1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DualSma {
    pub default_fast: usize,
    pub default_slow: usize,
}

impl Default for DualSma {
    fn default() -> Self {
        Self {
            default_fast: 10,
            default_slow: 30,
        }
    }
}

impl Strategy for DualSma {
    fn name(&self) -> &'static str {
        "dual_sma"
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::Stock
    }

    fn generate_signals(
        &self,
        paths: &PricePaths,
        _features: &FeatureMap,
        params: &BTreeMap<String, f64>,
        _option_spec: Option<&OptionSpec>,
    ) -> Result<super::StrategySignals, MissingFeatureError> {
        let fast = params.get("fast").copied().unwrap_or(self.default_fast as f64) as usize;
        let slow = params.get("slow").copied().unwrap_or(self.default_slow as f64) as usize;
        let sized = params.get("sized").copied().unwrap_or(0.0) > 0.5;
        let target_band = params.get("target_band").copied().unwrap_or(50.0);
        let cap = params.get("cap").copied().unwrap_or(100.0) as i32;

        let (n_paths, n_cols) = paths.shape();
        let n_steps = n_cols - 1;
        let mut positions = vec![0i8; n_paths * n_steps];
        let mut sizes = vec![1i32; n_paths * n_steps];

        for p in 0..n_paths {
            let row = paths.row(p);
            let fast_sma = sma(row, fast);
            let slow_sma = sma(row, slow);
            for step in 0..n_steps {
                let signal = if fast_sma[step].is_nan() || slow_sma[step].is_nan() {
                    0
                } else if fast_sma[step] > slow_sma[step] {
                    1
                } else {
                    -1
                };
                positions[p * n_steps + step] = signal;
                if sized {
                    let expected_move = if step > 0 {
                        (row[step] - row[step - 1]).abs()
                    } else {
                        0.0
                    };
                    sizes[p * n_steps + step] =
                        size_for_target_band(expected_move, target_band, cap).max(1);
                }
            }
        }

        Ok(super::StrategySignals {
            n_paths,
            n_steps,
            positions,
            sizes,
            features_used: Default::default(),
            option_spec: None,
        })
    }
}

/// Always long one unit — the passive baseline `compare` contrasts against.
pub struct BuyAndHold;

impl Strategy for BuyAndHold {
    fn name(&self) -> &'static str {
        "buy_and_hold"
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::Stock
    }

    fn generate_signals(
        &self,
        paths: &PricePaths,
        _features: &FeatureMap,
        _params: &BTreeMap<String, f64>,
        _option_spec: Option<&OptionSpec>,
    ) -> Result<super::StrategySignals, MissingFeatureError> {
        let (n_paths, n_cols) = paths.shape();
        let n_steps = n_cols - 1;
        Ok(super::StrategySignals {
            n_paths,
            n_steps,
            positions: vec![1i8; n_paths * n_steps],
            sizes: vec![1i32; n_paths * n_steps],
            features_used: Default::default(),
            option_spec: None,
        })
    }

    fn check_early_exercise(&self, _position_state: &PositionState) -> bool {
        false
    }
}
