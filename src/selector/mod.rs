//! Candidate Selector & Episode Builder (C5).
//!
//! A selector is a named rule set over strictly-past information that
//! filters historical bars into `CandidateEpisode`s for C6 conditioning.
//! Grounded on the teacher's DTE/delta filter idiom (`engine/filters.rs`)
//! generalized from options-chain rows to bar-indexed state features.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::data::DataBars;
use crate::error::DataError;

/// Declarative selector configuration bound at config-resolution time
/// (design note: registry-driven polymorphism — selectors are named and
/// validated before instantiation).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SelectorSpec {
    pub name: String,
    pub horizon: usize,
    /// Rolling window (in bars) used to compute volume z-scores; also the
    /// selector's declared `min_lookback`.
    pub volume_lookback: usize,
}

impl Default for SelectorSpec {
    fn default() -> Self {
        Self {
            name: "gap_volume_zscore".to_string(),
            horizon: 10,
            volume_lookback: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CandidateEpisode {
    pub symbol: String,
    pub t0: usize,
    pub horizon: usize,
    pub state_features: BTreeMap<String, f64>,
    pub selector_name: String,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionReport {
    pub episodes: Vec<CandidateEpisode>,
    pub sparsity_warning: bool,
}

pub trait Selector: Send + Sync {
    fn name(&self) -> &str;
    fn feature_requirements(&self) -> &[&'static str];
    fn min_lookback(&self) -> usize;

    /// Filter `bars` into candidate episodes, sorted by score descending,
    /// then optionally clipped by the caller to `top_n`. Emits a sparsity
    /// warning when fewer than `min_episodes` pass.
    fn select(&self, bars: &DataBars, min_episodes: usize) -> Result<SelectionReport, DataError>;
}

/// Default selector: rolling volume z-score plus absolute overnight gap,
/// scored by `|gap| + max(volume_z, 0)`. Every feature at row `t` is
/// computed only from bars strictly before `t` (no look-ahead).
pub struct DefaultSelector {
    spec: SelectorSpec,
}

impl DefaultSelector {
    pub fn new(spec: SelectorSpec) -> Self {
        Self { spec }
    }
}

const FEATURES: &[&str] = &["overnight_gap", "volume_zscore"];

impl Selector for DefaultSelector {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn feature_requirements(&self) -> &[&'static str] {
        FEATURES
    }

    fn min_lookback(&self) -> usize {
        self.spec.volume_lookback
    }

    fn select(&self, bars: &DataBars, min_episodes: usize) -> Result<SelectionReport, DataError> {
        let frame = bars.frame();
        let opens = col_f64(frame, "open")?;
        let closes = col_f64(frame, "close")?;
        let volumes = col_f64(frame, "volume")?;
        let n = opens.len();
        let lookback = self.spec.volume_lookback;

        let mut episodes = Vec::new();
        for t in lookback..n.saturating_sub(self.spec.horizon) {
            // all window statistics use bars strictly before t
            let window = &volumes[t - lookback..t];
            let mean = window.iter().sum::<f64>() / lookback as f64;
            let var = window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / lookback as f64;
            let std = var.sqrt();
            let volume_z = if std > 0.0 {
                (volumes[t - 1] - mean) / std
            } else {
                0.0
            };

            let overnight_gap = (opens[t] - closes[t - 1]) / closes[t - 1];
            let score = overnight_gap.abs() + volume_z.max(0.0);

            let mut state_features = BTreeMap::new();
            state_features.insert("overnight_gap".to_string(), overnight_gap);
            state_features.insert("volume_zscore".to_string(), volume_z);

            episodes.push(CandidateEpisode {
                symbol: bars.symbol.clone(),
                t0: t,
                horizon: self.spec.horizon,
                state_features,
                selector_name: self.spec.name.clone(),
                score,
            });
        }

        episodes.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        let sparsity_warning = episodes.len() < min_episodes;

        Ok(SelectionReport {
            episodes,
            sparsity_warning,
        })
    }
}

fn col_f64(frame: &polars::prelude::DataFrame, name: &str) -> Result<Vec<f64>, DataError> {
    let col = frame.column(name).map_err(|_| DataError::SchemaMismatch {
        expected: name.to_string(),
        found: "<missing>".to_string(),
    })?;
    let ca = col
        .cast(&polars::prelude::DataType::Float64)
        .map_err(|_| DataError::SchemaMismatch {
            expected: format!("{name}: f64-castable"),
            found: format!("{:?}", col.dtype()),
        })?;
    Ok(ca
        .f64()
        .map_err(|_| DataError::SchemaMismatch {
            expected: format!("{name}: f64"),
            found: "non-numeric".into(),
        })?
        .into_no_null_iter()
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeDelta};
    use polars::prelude::*;

    fn make_bars(n: usize) -> DataBars {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let timestamps: Vec<_> = (0..n).map(|i| start + TimeDelta::days(i as i64)).collect();
        let closes: Vec<f64> = (0..n).map(|i| 100.0 + (i as f64 * 0.3).sin() * 5.0).collect();
        let opens: Vec<f64> = closes
            .iter()
            .enumerate()
            .map(|(i, c)| if i % 7 == 0 { c * 1.05 } else { *c })
            .collect();
        let volumes: Vec<i64> = (0..n)
            .map(|i| if i % 10 == 0 { 5000 } else { 1000 })
            .collect();
        let frame = df! {
            crate::data::TIMESTAMP_COL => timestamps,
            "open" => opens,
            "high" => closes.iter().map(|c| c + 1.0).collect::<Vec<f64>>(),
            "low" => closes.iter().map(|c| c - 1.0).collect::<Vec<f64>>(),
            "close" => closes,
            "volume" => volumes,
        }
        .unwrap();
        DataBars::from_frame("TEST", TimeDelta::days(1), frame).unwrap()
    }

    #[test]
    fn select_emits_sorted_episodes() {
        let bars = make_bars(100);
        let selector = DefaultSelector::new(SelectorSpec::default());
        let report = selector.select(&bars, 30).unwrap();
        assert!(!report.episodes.is_empty());
        for pair in report.episodes.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[test]
    fn sparsity_warning_below_min_episodes() {
        let bars = make_bars(40);
        let selector = DefaultSelector::new(SelectorSpec::default());
        let report = selector.select(&bars, 1000).unwrap();
        assert!(report.sparsity_warning);
    }

    #[test]
    fn episodes_respect_horizon_bound() {
        let bars = make_bars(60);
        let selector = DefaultSelector::new(SelectorSpec::default());
        let report = selector.select(&bars, 30).unwrap();
        for ep in &report.episodes {
            assert!(ep.t0 + ep.horizon <= 60);
        }
    }
}
