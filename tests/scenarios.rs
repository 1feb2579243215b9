//! Integration tests for the literal section 8 scenarios that don't require
//! multi-gigabyte allocations: baseline compare, bankruptcy cascade,
//! drift-blocked replay, grid partial failure, and conditional fallback.

use std::collections::{BTreeMap, HashSet};

use chrono::{NaiveDate, TimeDelta};
use polars::prelude::*;

use qse::config::thresholds::Thresholds;
use qse::config::{PrecedenceSource, ResolvedConfig, ResourceLimits, RunConfig, StrategyParams};
use qse::conditional::ConditionalMethod;
use qse::data::{BarsProvider, DataBars};
use qse::distributions::DistributionKind;
use qse::error::{DataError, EngineError, NumericError};
use qse::orchestrator;
use qse::repro::metadata::CompletionStatus;
use qse::paths::{self, StorageTag};

/// A fixed in-memory bars provider, standing in for the out-of-scope
/// columnar-ingestion collaborator (section 1). Every test supplies its own
/// close-price series so each scenario gets the distributional shape it needs.
struct FixedProvider {
    closes: Vec<f64>,
}

impl FixedProvider {
    fn new(closes: Vec<f64>) -> Self {
        Self { closes }
    }

    fn bars(&self) -> DataBars {
        let start = NaiveDate::from_ymd_opt(2023, 1, 2).unwrap().and_hms_opt(0, 0, 0).unwrap();
        let n = self.closes.len();
        let timestamps: Vec<_> = (0..n).map(|i| start + TimeDelta::days(i as i64)).collect();
        let frame = df! {
            qse::data::TIMESTAMP_COL => timestamps,
            "open" => self.closes.clone(),
            "high" => self.closes.iter().map(|c| c.max(1e-6) + 0.5).collect::<Vec<f64>>(),
            "low" => self.closes.iter().map(|c| (c - 0.5).max(1e-9)).collect::<Vec<f64>>(),
            "close" => self.closes.clone(),
            "volume" => (0..n).map(|i| if i % 13 == 0 { 8000i64 } else { 1200i64 }).collect::<Vec<i64>>(),
        }
        .unwrap();
        DataBars::from_frame("SYN", TimeDelta::days(1), frame).unwrap()
    }
}

impl BarsProvider for FixedProvider {
    fn load(&self, _symbol: &str, _interval: TimeDelta) -> Result<DataBars, DataError> {
        Ok(self.bars())
    }
    fn list_symbols(&self) -> Result<Vec<String>, DataError> {
        Ok(vec!["SYN".to_string()])
    }
}

/// A gently drifting, mildly noisy close series — enough samples and
/// variance for every model (`GarchT` needs >= 252) to fit without warning.
fn benign_closes(n: usize) -> Vec<f64> {
    let mut price = 100.0_f64;
    (0..n)
        .map(|i| {
            let wiggle = (i as f64 * 0.37).sin() * 0.4 + (i as f64 * 0.11).cos() * 0.2;
            price *= 1.0 + 0.0002 + wiggle * 0.002;
            price
        })
        .collect()
}

fn base_config() -> ResolvedConfig {
    ResolvedConfig {
        config: RunConfig {
            symbol: "SYN".into(),
            n_paths: 1000,
            n_steps: 60,
            seed: 42,
            distribution_model: DistributionKind::Laplace,
            data_source: "fixed".into(),
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
        precedence: BTreeMap::from([("symbol".to_string(), PrecedenceSource::File)]),
    }
}

/// Scenario 1 (section 8): s0 = 100.0, Laplace(loc=0, scale=0.02) fit over
/// 500 samples, n_paths=1000, n_steps=60, seed=42, dual-SMA(10,30), no
/// options. Run completes; metrics present with non-null Sharpe;
/// `run_meta.json` (via `RunMetadata`) records seed=42 and the fit's AIC.
#[test]
fn baseline_compare_completes_with_metrics_and_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let provider = FixedProvider::new(benign_closes(500));
    let mut config = base_config();
    config.config.strategy_params.params = BTreeMap::from([("fast".into(), 10.0), ("slow".into(), 30.0)]);

    let (metadata, report) = orchestrator::compare(&provider, &config, dir.path()).unwrap();

    assert_eq!(metadata.completion_status, CompletionStatus::Complete);
    assert_eq!(metadata.config.seed, 42);
    assert!(metadata.distribution_fit_record.aic.is_finite());
    assert!(report.unconditional.sharpe.is_finite());
    assert!(std::path::Path::new(&metadata.artifact_paths.metrics_file).exists());
    assert!(qse::repro::metadata::metadata_path(dir.path(), metadata.run_id).exists());
}

/// Scenario 2 (section 8): a footprint that clears the memory-tier RAM
/// cutoff but stays under the memmap cutoff must dispatch to the Memmap
/// tier instead of collecting the whole matrix in one parallel `collect`,
/// and the spilled result must still agree bit-for-bit with an equivalent
/// Memory-tier generation (the storage-invariance determinism property
/// applies across tiers, not just within one). `mem_threshold_fraction` is
/// computed from this host's live available RAM so the test doesn't depend
/// on a literal 1 GB ceiling to reproduce on any machine.
#[test]
fn memory_spill_dispatches_to_memmap_tier() {
    use sysinfo::System;

    let thresholds = Thresholds::default();
    let distribution = qse::distributions::ReturnDistribution::Laplace {
        loc: 0.0001,
        scale: 0.01,
    };
    let n_paths = 500;
    let n_steps = 50;
    let footprint_bytes =
        (n_paths as f64 * (n_steps + 1) as f64 * 8.0 * thresholds.footprint_overhead) as u64;

    let mut sys = System::new_all();
    sys.refresh_memory();
    let available_ram_bytes = sys.available_memory();

    // Target a budget that puts `footprint_bytes` strictly between the
    // memory cutoff (25% of budget) and the memmap cutoff (50% of budget),
    // regardless of how much RAM this host actually has free.
    let target_budget = (footprint_bytes as f64 / 0.35) as u64;
    let mem_threshold_fraction = target_budget as f64 / available_ram_bytes as f64;

    let (spilled, _) = paths::generate(
        100.0,
        &distribution,
        n_paths,
        n_steps,
        42,
        &thresholds,
        mem_threshold_fraction,
        false,
        None,
    )
    .unwrap();
    assert_eq!(spilled.storage, StorageTag::Memmap);

    let (in_memory, _) = paths::generate(
        100.0,
        &distribution,
        n_paths,
        n_steps,
        42,
        &thresholds,
        1.0,
        false,
        None,
    )
    .unwrap();
    assert_eq!(in_memory.storage, StorageTag::Memory);

    assert_eq!(spilled.values().len(), in_memory.values().len());
    for (a, b) in spilled.values().iter().zip(in_memory.values()) {
        assert!((a - b).abs() < 1e-10, "memmap-tier generation diverged from memory-tier: {a} vs {b}");
    }
}

/// Scenario 3: Laplace(loc=-0.5, scale=0.3), s0=100, n_paths=1000,
/// n_steps=100 — a strongly negative-drift, high-scale distribution drives
/// most paths to zero well before the fail threshold kicks in. Expect
/// `NumericError:Bankruptcy` once the rate exceeds 50%.
#[test]
fn bankruptcy_cascade_fails_numeric_error() {
    let mut config = base_config();
    config.config.n_paths = 1000;
    config.config.n_steps = 100;
    // Fitting a distribution from a crafted series to land exactly on these
    // parameters is awkward; exercise the path generator directly with the
    // scenario's literal Laplace(loc=-0.5, scale=0.3), the way the
    // orchestrator would after a fit produced it.
    let distribution = qse::distributions::ReturnDistribution::Laplace {
        loc: -0.5,
        scale: 0.3,
    };
    let thresholds = Thresholds::default();
    let err = qse::paths::generate(
        100.0,
        &distribution,
        config.config.n_paths,
        config.config.n_steps,
        config.config.seed,
        &thresholds,
        config.config.resource_limits.mem_threshold,
        false,
        None,
    )
    .unwrap_err();

    match err {
        EngineError::Numeric(NumericError::Bankruptcy { rate, .. }) => {
            assert!(rate > 0.50);
        }
        other => panic!("expected NumericError::Bankruptcy, got {other:?}"),
    }
}

/// Scenario 4: original run has row_count 1000; replay against a dataset
/// with row_count 1200 (20% change) aborts with `DriftError:CountDrift`
/// unless the override flag is set, in which case it proceeds and records
/// the drift.
#[test]
fn drift_blocked_replay_requires_override() {
    let dir = tempfile::tempdir().unwrap();
    let original_provider = FixedProvider::new(benign_closes(1000));
    let config = base_config();

    let (original_meta, _) = orchestrator::compare(&original_provider, &config, dir.path()).unwrap();

    let drifted_provider = FixedProvider::new(benign_closes(1200));

    let blocked = orchestrator::replay(&drifted_provider, &original_meta, dir.path(), false);
    match blocked {
        Err(EngineError::Drift(qse::error::DriftError::CountDrift { old, new, .. })) => {
            assert_eq!(old, 1000);
            assert_eq!(new, 1200);
        }
        other => panic!("expected DriftError::CountDrift, got {other:?}"),
    }

    let (replayed, _) = orchestrator::replay(&drifted_provider, &original_meta, dir.path(), true).unwrap();
    let drift = replayed.drift_report.expect("replay records drift report");
    assert!((drift.count_drift_pct - 20.0).abs() < 1.0);
}

/// Scenario 5: a grid of configs where some entries have implausible
/// parameters still completes, tagging the bad entries as failed while
/// ranking the rest — a per-config error never stops the grid.
#[test]
fn grid_partial_failure_still_ranks_remaining_configs() {
    let dir = tempfile::tempdir().unwrap();
    let provider = FixedProvider::new(benign_closes(500));
    let mut config = base_config();
    config.config.grid = Some(vec![
        StrategyParams {
            name: "dual_sma".into(),
            params: BTreeMap::from([("fast".into(), 10.0), ("slow".into(), 30.0)]),
        },
        StrategyParams {
            name: "buy_and_hold".into(),
            params: BTreeMap::new(),
        },
        StrategyParams {
            name: "does_not_exist".into(),
            params: BTreeMap::new(),
        },
    ]);

    let (metadata, report) = orchestrator::run_grid(
        &provider,
        &config,
        dir.path(),
        uuid::Uuid::new_v4(),
        &HashSet::new(),
        4,
        &qse::grid::CancellationFlag::new(),
    )
    .unwrap();

    assert_eq!(report.entries.len(), 3);
    let failed: Vec<_> = report
        .entries
        .iter()
        .filter(|e| matches!(e.status, qse::grid::GridEntryStatus::Failed(_)))
        .collect();
    assert_eq!(failed.len(), 1);
    match &failed[0].status {
        qse::grid::GridEntryStatus::Failed(msg) => assert!(msg.contains("registered strategy")),
        other => unreachable!("expected Failed, got {other:?}"),
    }
    let succeeded = report.entries.len() - failed.len();
    assert_eq!(succeeded, 2);
    // A per-config failure marks the grid partial (section 4.8) but never
    // aborts it — the remaining configs still rank. It is not an
    // interruption, so the CLI still exits 0 (scenario 5).
    assert!(report.partial);
    assert!(!report.interrupted);
    assert_eq!(metadata.completion_status, CompletionStatus::Partial);
}

/// A grid resumed under the same `run_id` skips configs whose per-config
/// `metrics.json` was already written by the interrupted run (section 4.8).
#[test]
fn grid_resume_skips_previously_completed_configs() {
    let dir = tempfile::tempdir().unwrap();
    let provider = FixedProvider::new(benign_closes(500));
    let mut config = base_config();
    config.config.grid = Some(vec![
        StrategyParams {
            name: "dual_sma".into(),
            params: BTreeMap::from([("fast".into(), 10.0), ("slow".into(), 30.0)]),
        },
        StrategyParams {
            name: "buy_and_hold".into(),
            params: BTreeMap::new(),
        },
    ]);
    let run_id = uuid::Uuid::new_v4();

    let (_, first_pass) = orchestrator::run_grid(
        &provider,
        &config,
        dir.path(),
        run_id,
        &HashSet::new(),
        4,
        &qse::grid::CancellationFlag::new(),
    )
    .unwrap();
    assert_eq!(first_pass.entries.len(), 2);

    let configs_dir = dir.path().join(run_id.to_string()).join("configs");
    let completed = qse::grid::completed_config_ids(&configs_dir);
    assert_eq!(completed.len(), 2);

    let (_, second_pass) = orchestrator::run_grid(
        &provider,
        &config,
        dir.path(),
        run_id,
        &completed,
        4,
        &qse::grid::CancellationFlag::new(),
    )
    .unwrap();
    assert!(second_pass.entries.is_empty(), "resumed grid should skip every already-completed config");
}

/// Scenario 6: the screener yields fewer than `min_match` matching episodes,
/// so conditional MC falls back to unconditional sampling and records the
/// fallback on the conditioning report.
#[test]
fn conditional_run_falls_back_when_matches_are_sparse() {
    let dir = tempfile::tempdir().unwrap();
    let provider = FixedProvider::new(benign_closes(400));
    let mut config = base_config();
    config.config.n_paths = 200;
    config.config.n_steps = 20;

    // An extreme, unreachable target state guarantees zero matched episodes
    // regardless of which episodes the default selector finds.
    let target_state = BTreeMap::from([
        ("overnight_gap".to_string(), 999.0),
        ("volume_zscore".to_string(), 999.0),
    ]);

    let (metadata, report, conditioning) = orchestrator::conditional_run(
        &provider,
        &config,
        &target_state,
        ConditionalMethod::Bootstrap,
        dir.path(),
    )
    .unwrap();

    assert!(conditioning.fallback_used);
    assert_eq!(metadata.completion_status, CompletionStatus::Complete);
    assert!(report.unconditional.mean_pnl.is_finite());
}
