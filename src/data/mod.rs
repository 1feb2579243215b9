//! Historical bars model and schema/gap validation.
//!
//! Out of scope per the design: the columnar-ingestion collaborator that
//! actually talks to a market-data provider. This module fixes the
//! semantics a `BarsProvider` must honor (required schema, strictly
//! monotonic timestamps, gap tolerance) and ships one file-backed default
//! implementation, following the teacher's `DataStore` trait (`data/mod.rs`)
//! and its `normalize_quote_datetime` column-normalization idiom
//! (`data/parquet.rs`).

use std::path::{Path, PathBuf};

use chrono::{NaiveDateTime, TimeDelta};
use polars::prelude::*;

use crate::error::DataError;

pub const TIMESTAMP_COL: &str = "timestamp";
pub const REQUIRED_COLUMNS: &[&str] = &["timestamp", "open", "high", "low", "close", "volume"];

/// Ordered, immutable bar series for one (symbol, interval).
#[derive(Debug, Clone)]
pub struct DataBars {
    pub symbol: String,
    pub interval: TimeDelta,
    frame: DataFrame,
}

impl DataBars {
    /// Build from a raw frame, validating schema and ordering invariants.
    pub fn from_frame(symbol: &str, interval: TimeDelta, frame: DataFrame) -> Result<Self, DataError> {
        validate_schema(&frame)?;
        let timestamps = extract_timestamps(&frame)?;
        check_monotonic_and_gaps(&timestamps, interval)?;
        Ok(Self {
            symbol: symbol.to_string(),
            interval,
            frame,
        })
    }

    pub fn len(&self) -> usize {
        self.frame.height()
    }

    pub fn is_empty(&self) -> bool {
        self.frame.height() == 0
    }

    pub fn frame(&self) -> &DataFrame {
        &self.frame
    }

    pub fn closes(&self) -> Result<Vec<f64>, DataError> {
        column_as_f64(&self.frame, "close")
    }

    /// Log-returns of the close series: `ln(close_t / close_{t-1})`.
    pub fn log_returns(&self) -> Result<Vec<f64>, DataError> {
        let closes = self.closes()?;
        Ok(closes
            .windows(2)
            .map(|w| (w[1] / w[0]).ln())
            .collect())
    }

    pub fn timestamps(&self) -> Result<Vec<NaiveDateTime>, DataError> {
        extract_timestamps(&self.frame)
    }
}

fn column_as_f64(frame: &DataFrame, name: &str) -> Result<Vec<f64>, DataError> {
    let col = frame
        .column(name)
        .map_err(|_| DataError::SchemaMismatch {
            expected: name.to_string(),
            found: "<missing>".to_string(),
        })?;
    let ca = col
        .cast(&DataType::Float64)
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

fn extract_timestamps(frame: &DataFrame) -> Result<Vec<NaiveDateTime>, DataError> {
    let col = frame
        .column(TIMESTAMP_COL)
        .map_err(|_| DataError::SchemaMismatch {
            expected: TIMESTAMP_COL.to_string(),
            found: "<missing>".to_string(),
        })?;
    let ca = col
        .datetime()
        .map_err(|_| DataError::SchemaMismatch {
            expected: format!("{TIMESTAMP_COL}: datetime"),
            found: format!("{:?}", col.dtype()),
        })?;
    ca.as_datetime_iter()
        .map(|opt| {
            opt.ok_or_else(|| DataError::TimestampAnomaly {
                index: 0,
                detail: "null timestamp".into(),
            })
        })
        .collect()
}

fn validate_schema(frame: &DataFrame) -> Result<(), DataError> {
    for required in REQUIRED_COLUMNS {
        if frame.column(required).is_err() {
            return Err(DataError::SchemaMismatch {
                expected: required.to_string(),
                found: format!("{:?}", frame.get_column_names()),
            });
        }
    }
    Ok(())
}

/// Timestamps must be strictly monotonic; gaps beyond 3x the nominal
/// interval fail the run (section 3).
fn check_monotonic_and_gaps(timestamps: &[NaiveDateTime], interval: TimeDelta) -> Result<(), DataError> {
    for (i, pair) in timestamps.windows(2).enumerate() {
        let [a, b] = pair else { unreachable!() };
        if b <= a {
            return Err(DataError::TimestampAnomaly {
                index: i + 1,
                detail: format!("timestamp {b} does not strictly follow {a}"),
            });
        }
        let gap = *b - *a;
        let max_gap = interval * 3;
        if gap > max_gap {
            let gap_intervals = gap.num_seconds() as f64 / interval.num_seconds().max(1) as f64;
            return Err(DataError::GapBeyondTolerance {
                index: i + 1,
                gap_intervals,
                max_intervals: 3.0,
            });
        }
    }
    Ok(())
}

pub trait BarsProvider: Send + Sync {
    fn load(&self, symbol: &str, interval: TimeDelta) -> Result<DataBars, DataError>;
    fn list_symbols(&self) -> Result<Vec<String>, DataError>;
}

/// Default file-backed provider: one CSV per symbol under `root/<symbol>.csv`
/// with the required schema. Out-of-scope collaborators (a real market-data
/// ingestion pipeline) can implement `BarsProvider` directly instead.
pub struct CsvBarsProvider {
    root: PathBuf,
}

impl CsvBarsProvider {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }
}

impl BarsProvider for CsvBarsProvider {
    fn load(&self, symbol: &str, interval: TimeDelta) -> Result<DataBars, DataError> {
        let path = self.root.join(format!("{symbol}.csv"));
        let frame = CsvReadOptions::default()
            .try_into_reader_with_file_path(Some(path.clone()))
            .map_err(|e| DataError::SchemaMismatch {
                expected: "readable csv".into(),
                found: e.to_string(),
            })?
            .finish()
            .map_err(|e| DataError::SchemaMismatch {
                expected: "parseable csv".into(),
                found: e.to_string(),
            })?;
        DataBars::from_frame(symbol, interval, frame)
    }

    fn list_symbols(&self) -> Result<Vec<String>, DataError> {
        let entries = std::fs::read_dir(&self.root).map_err(|e| DataError::SchemaMismatch {
            expected: "readable data directory".into(),
            found: e.to_string(),
        })?;
        let mut symbols = Vec::new();
        for entry in entries.flatten() {
            if let Some(stem) = entry.path().file_stem().and_then(|s| s.to_str()) {
                if entry.path().extension().and_then(|e| e.to_str()) == Some("csv") {
                    symbols.push(stem.to_string());
                }
            }
        }
        symbols.sort();
        Ok(symbols)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn make_frame(timestamps: Vec<NaiveDateTime>) -> DataFrame {
        let n = timestamps.len();
        df! {
            TIMESTAMP_COL => timestamps,
            "open" => vec![100.0; n],
            "high" => vec![101.0; n],
            "low" => vec![99.0; n],
            "close" => (0..n).map(|i| 100.0 + i as f64).collect::<Vec<f64>>(),
            "volume" => vec![1000i64; n],
        }
        .unwrap()
    }

    fn daily_timestamps(n: usize) -> Vec<NaiveDateTime> {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        (0..n).map(|i| start + TimeDelta::days(i as i64)).collect()
    }

    #[test]
    fn valid_bars_construct_and_compute_returns() {
        let frame = make_frame(daily_timestamps(5));
        let bars = DataBars::from_frame("TEST", TimeDelta::days(1), frame).unwrap();
        assert_eq!(bars.len(), 5);
        let returns = bars.log_returns().unwrap();
        assert_eq!(returns.len(), 4);
        assert!(returns.iter().all(|r| r.is_finite() && *r > 0.0));
    }

    #[test]
    fn missing_column_is_schema_mismatch() {
        let frame = df! { TIMESTAMP_COL => daily_timestamps(3), "close" => [1.0, 2.0, 3.0] }.unwrap();
        let err = DataBars::from_frame("TEST", TimeDelta::days(1), frame).unwrap_err();
        assert!(matches!(err, DataError::SchemaMismatch { .. }));
    }

    #[test]
    fn non_monotonic_timestamps_are_anomalous() {
        let mut ts = daily_timestamps(4);
        ts.swap(1, 2);
        let frame = make_frame(ts);
        let err = DataBars::from_frame("TEST", TimeDelta::days(1), frame).unwrap_err();
        assert!(matches!(err, DataError::TimestampAnomaly { .. }));
    }

    #[test]
    fn gap_beyond_tolerance_fails() {
        let mut ts = daily_timestamps(3);
        ts[2] = ts[1] + TimeDelta::days(10);
        let frame = make_frame(ts);
        let err = DataBars::from_frame("TEST", TimeDelta::days(1), frame).unwrap_err();
        assert!(matches!(err, DataError::GapBeyondTolerance { .. }));
    }

    #[test]
    fn gap_within_tolerance_succeeds() {
        let mut ts = daily_timestamps(3);
        ts[2] = ts[1] + TimeDelta::days(3);
        let frame = make_frame(ts);
        assert!(DataBars::from_frame("TEST", TimeDelta::days(1), frame).is_ok());
    }
}
