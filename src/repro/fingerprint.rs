//! Data fingerprints (section 4.9c): a stable hash of
//! `{schema, row_count, first_ts, last_ts, content_hash}` per symbol+interval,
//! sufficient for the replay drift detector (section 4.7) to classify schema
//! / count / distribution drift between the fingerprinted version and the
//! current data.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::data::DataBars;
use crate::error::DriftError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataFingerprint {
    pub symbol: String,
    pub schema_hash: String,
    pub row_count: usize,
    pub first_ts: NaiveDateTime,
    pub last_ts: NaiveDateTime,
    pub content_hash: String,
    /// Summary statistics over the close-series log-returns, captured so a
    /// `distribution` drift class can be scored on replay without
    /// re-reading the original data.
    pub return_mean: f64,
    pub return_std: f64,
}

fn schema_hash(columns: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for c in columns {
        hasher.update(c.as_bytes());
        hasher.update(b"\0");
    }
    hex::encode(hasher.finalize())
}

fn content_hash(closes: &[f64], timestamps: &[NaiveDateTime]) -> String {
    let mut hasher = Sha256::new();
    for ts in timestamps {
        hasher.update(ts.and_utc().timestamp().to_le_bytes());
    }
    for c in closes {
        hasher.update(c.to_le_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Compute the fingerprint of `bars`. Re-hashing an unchanged dataset
/// always yields the same fingerprint; any row or column change yields a
/// different one (section 8's fingerprint-stability property).
pub fn fingerprint(bars: &DataBars) -> Result<DataFingerprint, crate::error::DataError> {
    let timestamps = bars.timestamps()?;
    let closes = bars.closes()?;
    let returns = bars.log_returns()?;
    let mean = if returns.is_empty() {
        0.0
    } else {
        returns.iter().sum::<f64>() / returns.len() as f64
    };
    let variance = if returns.len() < 2 {
        0.0
    } else {
        returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (returns.len() - 1) as f64
    };

    Ok(DataFingerprint {
        symbol: bars.symbol.clone(),
        schema_hash: schema_hash(crate::data::REQUIRED_COLUMNS),
        row_count: bars.len(),
        first_ts: *timestamps.first().ok_or_else(|| crate::error::DataError::InsufficientSamples {
            required: 1,
            actual: 0,
        })?,
        last_ts: *timestamps.last().expect("checked non-empty above"),
        content_hash: content_hash(&closes, &timestamps),
        return_mean: mean,
        return_std: variance.sqrt(),
    })
}

/// Detected drift classes between a replay's recorded fingerprint and the
/// current dataset's fingerprint (section 4.7).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DriftReport {
    pub schema_drift: bool,
    pub count_drift_pct: f64,
    pub mean_drift_pct: f64,
    pub std_drift_pct: f64,
    pub overridden: bool,
}

impl DriftReport {
    pub fn has_drift(&self, thresholds: &crate::config::thresholds::Thresholds) -> bool {
        self.schema_drift
            || self.count_drift_pct.abs() > thresholds.count_drift_pct
            || self.mean_drift_pct.abs() > thresholds.distribution_drift_pct
            || self.std_drift_pct.abs() > thresholds.distribution_drift_pct
    }
}

fn pct_change(old: f64, new: f64) -> f64 {
    if old.abs() < f64::EPSILON {
        if new.abs() < f64::EPSILON {
            0.0
        } else {
            100.0
        }
    } else {
        (new - old) / old.abs() * 100.0
    }
}

/// Compare `original` against `current`, returning the populated
/// [`DriftReport`]. Does not itself decide pass/fail — callers apply
/// `has_drift` and the `override_to_warning` flag per section 4.7.
pub fn detect_drift(original: &DataFingerprint, current: &DataFingerprint) -> DriftReport {
    DriftReport {
        schema_drift: original.schema_hash != current.schema_hash,
        count_drift_pct: pct_change(original.row_count as f64, current.row_count as f64),
        mean_drift_pct: pct_change(original.return_mean, current.return_mean),
        std_drift_pct: pct_change(original.return_std, current.return_std),
        overridden: false,
    }
}

/// Validate a replay's drift report against thresholds, honoring the
/// caller-supplied downgrade-to-warning override (section 4.7: "schema
/// drift is always fatal to replay" unless overridden).
pub fn validate_replay(
    report: &DriftReport,
    thresholds: &crate::config::thresholds::Thresholds,
    override_to_warning: bool,
) -> Result<(), DriftError> {
    if !report.has_drift(thresholds) {
        return Ok(());
    }
    if override_to_warning {
        tracing::warn!(
            schema_drift = report.schema_drift,
            count_drift_pct = report.count_drift_pct,
            mean_drift_pct = report.mean_drift_pct,
            std_drift_pct = report.std_drift_pct,
            "drift detected but downgraded to warning by override flag"
        );
        return Ok(());
    }
    if report.schema_drift {
        return Err(DriftError::SchemaDrift(
            "required-column schema hash changed since original run".to_string(),
        ));
    }
    if report.count_drift_pct.abs() > thresholds.count_drift_pct {
        return Err(DriftError::CountDrift {
            old: 0,
            new: 0,
            pct: report.count_drift_pct,
        });
    }
    Err(DriftError::DistributionDrift {
        field: if report.mean_drift_pct.abs() > thresholds.distribution_drift_pct {
            "mean".to_string()
        } else {
            "std".to_string()
        },
        pct: report.mean_drift_pct.abs().max(report.std_drift_pct.abs()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeDelta};
    use polars::prelude::*;

    fn make_bars(n: usize, offset: f64) -> DataBars {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let timestamps: Vec<_> = (0..n).map(|i| start + TimeDelta::days(i as i64)).collect();
        let closes: Vec<f64> = (0..n).map(|i| 100.0 + offset + i as f64).collect();
        let frame = df! {
            crate::data::TIMESTAMP_COL => timestamps,
            "open" => closes.clone(),
            "high" => closes.iter().map(|c| c + 1.0).collect::<Vec<f64>>(),
            "low" => closes.iter().map(|c| c - 1.0).collect::<Vec<f64>>(),
            "close" => closes,
            "volume" => vec![1000i64; n],
        }
        .unwrap();
        DataBars::from_frame("TEST", TimeDelta::days(1), frame).unwrap()
    }

    #[test]
    fn fingerprint_is_stable_for_unchanged_data() {
        let bars = make_bars(20, 0.0);
        let a = fingerprint(&bars).unwrap();
        let b = fingerprint(&bars).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_changes_with_content() {
        let a = fingerprint(&make_bars(20, 0.0)).unwrap();
        let b = fingerprint(&make_bars(20, 5.0)).unwrap();
        assert_ne!(a.content_hash, b.content_hash);
    }

    #[test]
    fn count_drift_detected_and_scored() {
        let original = fingerprint(&make_bars(1000, 0.0)).unwrap();
        let current = fingerprint(&make_bars(1200, 0.0)).unwrap();
        let report = detect_drift(&original, &current);
        assert!((report.count_drift_pct - 20.0).abs() < 1e-9);
        let t = crate::config::thresholds::Thresholds::default();
        let err = validate_replay(&report, &t, false).unwrap_err();
        assert!(matches!(err, DriftError::CountDrift { .. }));
    }

    #[test]
    fn override_downgrades_drift_to_warning() {
        let original = fingerprint(&make_bars(1000, 0.0)).unwrap();
        let current = fingerprint(&make_bars(1200, 0.0)).unwrap();
        let report = detect_drift(&original, &current);
        let t = crate::config::thresholds::Thresholds::default();
        assert!(validate_replay(&report, &t, true).is_ok());
    }

    #[test]
    fn no_drift_when_data_unchanged() {
        let bars = make_bars(500, 0.0);
        let fp = fingerprint(&bars).unwrap();
        let report = detect_drift(&fp, &fp);
        let t = crate::config::thresholds::Thresholds::default();
        assert!(validate_replay(&report, &t, false).is_ok());
    }
}
