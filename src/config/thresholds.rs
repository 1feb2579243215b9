//! Externalized numeric thresholds (design note: "Numerical thresholds
//! externalized"). One struct, captured verbatim into `RunMetadata` so a
//! replay can see exactly which constants governed the original run.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Thresholds {
    /// Excess-kurtosis cutoffs for `FitStatus`: >= success, >= warn, else fail.
    pub kurtosis_success: f64,
    pub kurtosis_warn: f64,

    /// Bootstrap conditioning: z-space distance to retain an episode, and
    /// the minimum match count before falling back to unconditional.
    pub distance_threshold: f64,
    pub min_match: usize,
    pub min_episodes: usize,

    /// Per-trade slippage as a fraction of notional, and flat fees.
    pub slippage_bps: f64,
    pub fee_per_share: f64,
    pub fee_per_contract: f64,

    /// Storage-policy RAM fractions (C2).
    pub ram_fraction_memory: f64,
    pub ram_fraction_memmap: f64,
    /// Footprint inflation factor applied to raw `n_paths * n_steps * 8`.
    pub footprint_overhead: f64,

    /// Bankruptcy-rate thresholds (C2).
    pub bankruptcy_warn_rate: f64,
    pub bankruptcy_fail_rate: f64,

    /// Wall-clock budget tiers (section 5): info/warn/error multipliers.
    pub budget_info_multiplier: f64,
    pub budget_warn_multiplier: f64,
    pub budget_error_multiplier: f64,

    /// Drift thresholds (C7 replay).
    pub count_drift_pct: f64,
    pub distribution_drift_pct: f64,

    /// Grid composite-objective weights (C8), and the division-by-zero guard.
    pub weight_pnl: f64,
    pub weight_sharpe: f64,
    pub weight_drawdown: f64,
    pub weight_cvar: f64,
    pub zscore_epsilon: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            kurtosis_success: 1.0,
            kurtosis_warn: 0.5,
            distance_threshold: 2.0,
            min_match: 10,
            min_episodes: 30,
            slippage_bps: 5.0,
            fee_per_share: 0.005,
            fee_per_contract: 0.65,
            ram_fraction_memory: 0.25,
            ram_fraction_memmap: 0.50,
            footprint_overhead: 1.1,
            bankruptcy_warn_rate: 0.05,
            bankruptcy_fail_rate: 0.50,
            budget_info_multiplier: 1.5,
            budget_warn_multiplier: 2.0,
            budget_error_multiplier: 3.0,
            count_drift_pct: 10.0,
            distribution_drift_pct: 20.0,
            weight_pnl: 0.30,
            weight_sharpe: 0.30,
            weight_drawdown: 0.20,
            weight_cvar: 0.20,
            zscore_epsilon: 1e-8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let t = Thresholds::default();
        assert_eq!(t.min_match, 10);
        assert_eq!(t.min_episodes, 30);
        assert!((t.distance_threshold - 2.0).abs() < f64::EPSILON);
        assert!((t.weight_pnl + t.weight_sharpe + t.weight_drawdown + t.weight_cvar - 1.0).abs() < 1e-9);
    }
}
