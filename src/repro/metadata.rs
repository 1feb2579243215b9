//! `RunMetadata` (section 4.9): the record persisted next to every run's
//! artifacts so a later `replay` can reconstruct the same config, verify
//! the data hasn't drifted, and attribute the environment it ran under.
//!
//! Writes are atomic: the record is serialized to a sibling temp file in
//! the same directory, then renamed into place, so a crash mid-write never
//! leaves a partially-written metadata file for `replay` to trip over.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{PrecedenceSource, RunConfig};
use crate::distributions::FitRecord;
use crate::error::ConfigError;
use crate::paths::StorageTag;
use crate::repro::environment::Environment;
use crate::repro::fingerprint::{DataFingerprint, DriftReport};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub paths_file: Option<String>,
    pub metrics_file: String,
    pub ranking_file: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Complete,
    Partial,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: Uuid,
    pub config: RunConfig,
    pub precedence: std::collections::BTreeMap<String, PrecedenceSource>,
    pub distribution_fit_record: FitRecord,
    pub path_storage: StorageTag,
    /// SHA-256 hex digest of the generated path matrix (`PricePaths::content_hash`),
    /// recorded so `replay` can tell a legitimate hash change (data drift) from
    /// silent corruption when no persisted `paths_file` survives to load bit-wise.
    pub paths_content_hash: String,
    pub data_fingerprint: DataFingerprint,
    pub code_version: String,
    pub environment: Environment,
    pub drift_report: Option<DriftReport>,
    pub artifact_paths: ArtifactPaths,
    pub completion_status: CompletionStatus,
}

impl RunMetadata {
    /// Atomically write this record as pretty-printed JSON to `path`: write
    /// to `path.tmp` in the same directory, then rename over `path`.
    pub fn write_atomic(&self, path: &Path) -> Result<(), ConfigError> {
        let tmp_path = path.with_extension("tmp");
        let json = serde_json::to_string_pretty(self).map_err(|e| {
            ConfigError::InvalidValue(crate::error::Violation {
                field: "run_metadata".into(),
                value: String::new(),
                constraint: "must serialize to JSON".into(),
                remediation: format!("internal error: {e}"),
            })
        })?;
        std::fs::write(&tmp_path, json).map_err(|e| write_error(path, e))?;
        std::fs::rename(&tmp_path, path).map_err(|e| write_error(path, e))?;
        Ok(())
    }

    /// Read back a previously-written record, used by `replay`.
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| write_error(path, e))?;
        serde_json::from_str(&text).map_err(|e| {
            ConfigError::InvalidValue(crate::error::Violation {
                field: "run_metadata".into(),
                value: path.display().to_string(),
                constraint: "must deserialize as RunMetadata".into(),
                remediation: format!("file is corrupt or from an incompatible version: {e}"),
            })
        })
    }
}

fn write_error(path: &Path, e: std::io::Error) -> ConfigError {
    ConfigError::InvalidValue(crate::error::Violation {
        field: "run_metadata_path".into(),
        value: path.display().to_string(),
        constraint: "must be a writable/readable path".into(),
        remediation: format!("check directory permissions: {e}"),
    })
}

pub fn artifact_dir_paths(dir: &Path, run_id: Uuid, grid: bool) -> ArtifactPaths {
    ArtifactPaths {
        paths_file: Some(
            dir.join(format!("{run_id}.paths.bin"))
                .to_string_lossy()
                .to_string(),
        ),
        metrics_file: dir
            .join(format!("{run_id}.metrics.json"))
            .to_string_lossy()
            .to_string(),
        ranking_file: grid.then(|| {
            dir.join(format!("{run_id}.ranking.json"))
                .to_string_lossy()
                .to_string()
        }),
    }
}

pub fn metadata_path(dir: &Path, run_id: Uuid) -> PathBuf {
    dir.join(format!("{run_id}.metadata.json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::thresholds::Thresholds;
    use crate::config::{ResourceLimits, StrategyParams};
    use crate::distributions::{DistributionKind, FitRecord, FitStatus, ReturnDistribution};
    use chrono::NaiveDate;
    use std::collections::BTreeMap;

    fn sample_metadata() -> RunMetadata {
        let ts = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        RunMetadata {
            run_id: Uuid::nil(),
            config: RunConfig {
                symbol: "AAPL".into(),
                n_paths: 100,
                n_steps: 20,
                seed: 42,
                distribution_model: DistributionKind::Laplace,
                data_source: "local".into(),
                selector: None,
                grid: None,
                resource_limits: ResourceLimits::default(),
                strategy_params: StrategyParams {
                    name: "dual_sma".into(),
                    params: BTreeMap::new(),
                },
                option_spec: None,
                thresholds: Thresholds::default(),
                allow_transform: false,
                fallback_to_default: false,
            },
            precedence: BTreeMap::new(),
            distribution_fit_record: FitRecord {
                distribution: ReturnDistribution::Laplace {
                    loc: 0.0,
                    scale: 0.01,
                },
                fit_window: 500,
                seed: 42,
                log_likelihood: -100.0,
                aic: 204.0,
                bic: 210.0,
                fit_status: FitStatus::Success,
                iterations: 0,
                tolerance: 1e-8,
                transformed: false,
                fallback_used: false,
            },
            path_storage: StorageTag::Memory,
            paths_content_hash: "0".repeat(64),
            data_fingerprint: DataFingerprint {
                symbol: "AAPL".into(),
                schema_hash: "abc".into(),
                row_count: 500,
                first_ts: ts,
                last_ts: ts,
                content_hash: "def".into(),
                return_mean: 0.0,
                return_std: 0.01,
            },
            code_version: "git_0.1.0_2026-07-28_abc1234".into(),
            environment: crate::repro::environment::capture(),
            drift_report: None,
            artifact_paths: ArtifactPaths {
                paths_file: Some("x.paths.bin".into()),
                metrics_file: "x.metrics.json".into(),
                ranking_file: None,
            },
            completion_status: CompletionStatus::Complete,
        }
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.metadata.json");
        let meta = sample_metadata();
        meta.write_atomic(&path).unwrap();
        let reloaded = RunMetadata::read(&path).unwrap();
        assert_eq!(reloaded.run_id, meta.run_id);
        assert_eq!(reloaded.completion_status, CompletionStatus::Complete);
    }

    #[test]
    fn write_leaves_no_tmp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.metadata.json");
        sample_metadata().write_atomic(&path).unwrap();
        assert!(!path.with_extension("tmp").exists());
        assert!(path.exists());
    }

    #[test]
    fn artifact_dir_paths_omits_ranking_when_not_grid() {
        let dir = PathBuf::from("/tmp/out");
        let paths = artifact_dir_paths(&dir, Uuid::nil(), false);
        assert!(paths.ranking_file.is_none());
    }

    #[test]
    fn artifact_dir_paths_includes_ranking_for_grid() {
        let dir = PathBuf::from("/tmp/out");
        let paths = artifact_dir_paths(&dir, Uuid::nil(), true);
        assert!(paths.ranking_file.is_some());
    }
}
