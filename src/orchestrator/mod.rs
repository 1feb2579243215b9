//! Run Orchestrator (C7): wires the data, distribution, path, strategy,
//! selector, conditional and metrics collaborators together into the five
//! CLI commands (section 6) and emits the `RunMetadata` record every run
//! produces.
//!
//! Grounded on the teacher's `engine/core.rs` run loop (load -> fit ->
//! simulate -> score -> persist) generalized from a single backtest to the
//! five-command surface this design adds, with the grid command delegating
//! to [`crate::grid`].

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use chrono::TimeDelta;
use uuid::Uuid;

use crate::config::thresholds::Thresholds;
use crate::config::{ResolvedConfig, RunConfig};
use crate::conditional::{self, ConditionalMethod, ConditioningReport};
use crate::data::BarsProvider;
use crate::distributions::{self, FitOptions};
use crate::error::{DriftError, EngineError, NumericError};
use crate::grid::{self, GridReport};
use crate::metrics::{self, MetricsReport};
use crate::paths::{self, PricePaths};
use crate::pricing::OptionSpec;
use crate::repro::environment;
use crate::repro::fingerprint::{self, DataFingerprint, DriftReport};
use crate::repro::metadata::{artifact_dir_paths, metadata_path, ArtifactPaths, CompletionStatus, RunMetadata};
use crate::selector::{DefaultSelector, SelectionReport, Selector};
use crate::strategy::{self, FeatureMap, StrategyKind, StrategySignals};

/// Fixed daily-bar interval every command assumes: the spec's `RunConfig`
/// carries no explicit bar cadence, so this is the one resolved value a
/// later config revision could promote to a field.
const BAR_INTERVAL: TimeDelta = TimeDelta::days(1);

fn strategy_kind(option_spec: &Option<OptionSpec>) -> StrategyKind {
    if option_spec.is_some() {
        StrategyKind::Option
    } else {
        StrategyKind::Stock
    }
}

/// Everything the orchestrator needs once per symbol: validated bars, its
/// fingerprint, the fitted distribution, and the generated price paths.
/// Shared across a grid's configs so the expensive fit/generate steps run
/// once, not once per config.
struct RunContext {
    bars: crate::data::DataBars,
    fingerprint: DataFingerprint,
    fit_record: distributions::FitRecord,
    paths: PricePaths,
    gen_report: paths::PathGenerationReport,
}

fn build_context(
    provider: &dyn BarsProvider,
    config: &RunConfig,
    persist_path: Option<&Path>,
) -> Result<RunContext, EngineError> {
    let bars = provider.load(&config.symbol, BAR_INTERVAL)?;
    let fp = fingerprint::fingerprint(&bars)?;
    let returns = bars.log_returns()?;

    let fit_options = FitOptions {
        allow_transform: config.allow_transform,
        fallback_to_default: config.fallback_to_default,
        ..FitOptions::default()
    };
    let fit_record = distributions::fit(config.distribution_model, &returns, config.seed, &fit_options)?;

    let closes = bars.closes()?;
    let s0 = *closes.last().ok_or(crate::error::DataError::InsufficientSamples {
        required: 1,
        actual: 0,
    })?;

    let (paths, gen_report) = paths::generate(
        s0,
        &fit_record.distribution,
        config.n_paths,
        config.n_steps,
        config.seed,
        &config.thresholds,
        config.resource_limits.mem_threshold,
        config.resource_limits.persistent,
        persist_path,
    )?;

    Ok(RunContext {
        bars,
        fingerprint: fp,
        fit_record,
        paths,
        gen_report,
    })
}

fn run_one_strategy(
    ctx: &RunContext,
    strategy_name: &str,
    params: &BTreeMap<String, f64>,
    option_spec: Option<&OptionSpec>,
    thresholds: &Thresholds,
) -> Result<(StrategySignals, MetricsReport), EngineError> {
    let kind = if option_spec.is_some() {
        StrategyKind::Option
    } else {
        StrategyKind::Stock
    };
    let strategy = strategy::find_strategy(strategy_name, kind).ok_or_else(|| {
        EngineError::Config(crate::error::ConfigError::InvalidValue(crate::error::Violation {
            field: "strategy_params.name".into(),
            value: strategy_name.to_string(),
            constraint: "must name a registered strategy".into(),
            remediation: "choose one of the names returned by the strategy registry".into(),
        }))
    })?;

    let signals = strategy::generate(&*strategy, &ctx.paths, &FeatureMap::new(), params, option_spec)?;
    let report = metrics::evaluate(&ctx.paths, &signals, thresholds, Some(&*strategy))?;
    Ok((signals, report))
}

fn assemble_metadata(
    run_id: Uuid,
    config: &ResolvedConfig,
    ctx: &RunContext,
    artifact_paths: ArtifactPaths,
    drift_report: Option<DriftReport>,
    completion_status: CompletionStatus,
) -> RunMetadata {
    let env = environment::capture();
    let code_version = environment::source_version_identifier(
        env!("CARGO_PKG_VERSION"),
        "unknown-date",
        &env.code_version,
    );
    RunMetadata {
        run_id,
        config: config.config.clone(),
        precedence: config.precedence.clone(),
        distribution_fit_record: ctx.fit_record.clone(),
        path_storage: ctx.paths.storage,
        paths_content_hash: ctx.paths.content_hash(),
        data_fingerprint: ctx.fingerprint.clone(),
        code_version,
        environment: env,
        drift_report,
        artifact_paths,
        completion_status,
    }
}

/// `compare` (section 6): fit + simulate + score the single configured
/// strategy, write the metrics and metadata artifacts, and return the
/// metadata record.
pub fn compare(
    provider: &dyn BarsProvider,
    config: &ResolvedConfig,
    artifact_dir: &Path,
) -> Result<(RunMetadata, MetricsReport), EngineError> {
    let run_id = Uuid::new_v4();
    let artifact_paths = artifact_dir_paths(artifact_dir, run_id, false);
    let persist_path = artifact_paths.paths_file.as_deref().map(Path::new);

    let ctx = build_context(provider, &config.config, persist_path)?;
    if ctx.gen_report.warn {
        tracing::warn!(
            rate = ctx.gen_report.bankruptcy_rate,
            "bankruptcy rate above warn threshold"
        );
    }

    let (_, report) = run_one_strategy(
        &ctx,
        &config.config.strategy_params.name,
        &config.config.strategy_params.params,
        config.config.option_spec.as_ref(),
        &config.config.thresholds,
    )?;

    std::fs::write(&artifact_paths.metrics_file, serde_json::to_vec_pretty(&report).unwrap_or_default())
        .map_err(|e| EngineError::Config(crate::error::ConfigError::InvalidValue(crate::error::Violation {
            field: "artifact_paths.metrics_file".into(),
            value: artifact_paths.metrics_file.clone(),
            constraint: "must be writable".into(),
            remediation: format!("check directory permissions: {e}"),
        })))?;

    let metadata = assemble_metadata(run_id, config, &ctx, artifact_paths, None, CompletionStatus::Complete);
    metadata.write_atomic(&metadata_path(artifact_dir, run_id))?;

    Ok((metadata, report))
}

/// `grid` (section 6): run every `config.grid` entry in parallel over the
/// same fitted distribution and generated paths, rank them, and persist
/// `ranking.json`.
pub fn run_grid(
    provider: &dyn BarsProvider,
    config: &ResolvedConfig,
    artifact_dir: &Path,
    run_id: Uuid,
    already_completed: &HashSet<String>,
    detected_cpus: usize,
    cancellation: &grid::CancellationFlag,
) -> Result<(RunMetadata, GridReport), EngineError> {
    let grid_configs = config.config.grid.clone().unwrap_or_default();
    if grid_configs.is_empty() {
        return Err(EngineError::Config(crate::error::ConfigError::MissingField(
            "grid".to_string(),
        )));
    }

    let artifact_paths = artifact_dir_paths(artifact_dir, run_id, true);
    let persist_path = artifact_paths.paths_file.as_deref().map(Path::new);
    let ctx = build_context(provider, &config.config, persist_path)?;
    let max_workers = grid::worker_count(config.config.resource_limits.max_workers, detected_cpus);
    let option_spec = config.config.option_spec.clone();
    let thresholds = config.config.thresholds.clone();

    // Each worker-exclusive `config_id` subdirectory (section 5) gets its
    // metrics written immediately on success, not batched at the end, so a
    // resumed grid (section 4.8) can tell which configs already finished by
    // scanning the filesystem rather than trusting in-memory state that a
    // crashed process never had the chance to persist.
    let configs_dir = artifact_dir.join(run_id.to_string()).join("configs");

    let mut report = grid::run_grid(&grid_configs, max_workers, already_completed, cancellation, |params| {
        let (_, metrics_report) =
            run_one_strategy(&ctx, &params.name, &params.params, option_spec.as_ref(), &thresholds)?;
        let config_dir = configs_dir.join(grid::config_id(params));
        if let Err(e) = std::fs::create_dir_all(&config_dir)
            .and_then(|()| std::fs::write(config_dir.join("metrics.json"), serde_json::to_vec_pretty(&metrics_report).unwrap_or_default()))
        {
            tracing::warn!(config_id = %grid::config_id(params), error = %e, "failed to persist per-config artifact");
        }
        Ok(metrics_report)
    });
    grid::rank(&mut report, &thresholds);

    if let Some(ranking_file) = &artifact_paths.ranking_file {
        std::fs::write(ranking_file, serde_json::to_vec_pretty(&report).unwrap_or_default()).map_err(|e| {
            EngineError::Config(crate::error::ConfigError::InvalidValue(crate::error::Violation {
                field: "artifact_paths.ranking_file".into(),
                value: ranking_file.clone(),
                constraint: "must be writable".into(),
                remediation: format!("check directory permissions: {e}"),
            }))
        })?;
    }

    // A per-config failure alone marks the metadata `partial` (some
    // `config_id`s have no report) without affecting the CLI exit code,
    // which only reacts to `report.interrupted` (section 6's dedicated
    // "grid interrupted" code vs. scenario 5's grid-level success).
    let status = if report.partial {
        CompletionStatus::Partial
    } else {
        CompletionStatus::Complete
    };
    let metadata = assemble_metadata(run_id, config, &ctx, artifact_paths, None, status);
    metadata.write_atomic(&metadata_path(artifact_dir, run_id))?;

    Ok((metadata, report))
}

/// `screen` (section 6): run the candidate selector alone, without fitting
/// a distribution or simulating paths.
pub fn screen(
    provider: &dyn BarsProvider,
    config: &RunConfig,
) -> Result<SelectionReport, EngineError> {
    let bars = provider.load(&config.symbol, BAR_INTERVAL)?;
    let spec = config.selector.clone().unwrap_or_default();
    let selector = DefaultSelector::new(spec);
    Ok(selector.select(&bars, config.thresholds.min_episodes)?)
}

/// `conditional` (section 6): select candidate episodes, then condition
/// path generation on `target_state` instead of drawing unconditionally.
pub fn conditional_run(
    provider: &dyn BarsProvider,
    config: &ResolvedConfig,
    target_state: &BTreeMap<String, f64>,
    method: ConditionalMethod,
    artifact_dir: &Path,
) -> Result<(RunMetadata, MetricsReport, ConditioningReport), EngineError> {
    let bars = provider.load(&config.config.symbol, BAR_INTERVAL)?;
    let fp = fingerprint::fingerprint(&bars)?;
    let returns = bars.log_returns()?;

    let spec = config.config.selector.clone().unwrap_or_default();
    let selector = DefaultSelector::new(spec);
    let selection = selector.select(&bars, config.config.thresholds.min_episodes)?;
    if selection.sparsity_warning {
        tracing::warn!("selector returned fewer episodes than min_episodes");
    }

    let closes = bars.closes()?;
    let s0 = *closes.last().ok_or(crate::error::DataError::InsufficientSamples {
        required: 1,
        actual: 0,
    })?;

    let (price_paths, gen_report, conditioning, fit_record) = conditional::conditional_sample(
        &returns,
        &selection.episodes,
        target_state,
        method,
        config.config.distribution_model,
        s0,
        config.config.n_paths,
        config.config.n_steps,
        config.config.seed,
        &config.config.thresholds,
        config.config.resource_limits.mem_threshold,
        config.config.resource_limits.persistent,
    )?;
    if gen_report.warn {
        tracing::warn!(
            rate = gen_report.bankruptcy_rate,
            "bankruptcy rate above warn threshold"
        );
    }

    let kind = strategy_kind(&config.config.option_spec);
    let strategy = strategy::find_strategy(&config.config.strategy_params.name, kind).ok_or_else(|| {
        EngineError::Config(crate::error::ConfigError::InvalidValue(crate::error::Violation {
            field: "strategy_params.name".into(),
            value: config.config.strategy_params.name.clone(),
            constraint: "must name a registered strategy".into(),
            remediation: "choose one of the names returned by the strategy registry".into(),
        }))
    })?;
    let signals = strategy::generate(
        &*strategy,
        &price_paths,
        &FeatureMap::new(),
        &config.config.strategy_params.params,
        config.config.option_spec.as_ref(),
    )?;
    let report = metrics::evaluate(
        &price_paths,
        &signals,
        &config.config.thresholds,
        Some(&*strategy),
    )?;

    let run_id = Uuid::new_v4();
    let artifact_paths = artifact_dir_paths(artifact_dir, run_id, false);
    std::fs::write(&artifact_paths.metrics_file, serde_json::to_vec_pretty(&report).unwrap_or_default())
        .map_err(|e| EngineError::Config(crate::error::ConfigError::InvalidValue(crate::error::Violation {
            field: "artifact_paths.metrics_file".into(),
            value: artifact_paths.metrics_file.clone(),
            constraint: "must be writable".into(),
            remediation: format!("check directory permissions: {e}"),
        })))?;

    let env = environment::capture();
    let code_version =
        environment::source_version_identifier(env!("CARGO_PKG_VERSION"), "unknown-date", &env.code_version);
    let metadata = RunMetadata {
        run_id,
        config: config.config.clone(),
        precedence: config.precedence.clone(),
        distribution_fit_record: fit_record,
        path_storage: price_paths.storage,
        paths_content_hash: price_paths.content_hash(),
        data_fingerprint: fp,
        code_version,
        environment: env,
        drift_report: None,
        artifact_paths,
        completion_status: CompletionStatus::Complete,
    };
    metadata.write_atomic(&metadata_path(artifact_dir, run_id))?;

    Ok((metadata, report, conditioning))
}

fn paths_io_err(path: &Path, e: std::io::Error) -> EngineError {
    EngineError::Config(crate::error::ConfigError::InvalidValue(crate::error::Violation {
        field: "artifact_paths.paths_file".into(),
        value: path.display().to_string(),
        constraint: "must be a readable persisted path matrix".into(),
        remediation: format!("file is missing or corrupt: {e}"),
    }))
}

/// `replay` (section 6): re-fingerprint the current data, compare it against
/// the prior run's recorded fingerprint, and (absent blocking drift) redo
/// the strategy/metrics computation with the prior run's exact config and
/// seed.
///
/// When the prior run persisted its path matrix (`path_storage` is
/// `Memmap`/`Npz` and the file still exists), that matrix is loaded bit-wise
/// instead of regenerated — the cheapest and most literal notion of
/// "replay". Otherwise the paths are regenerated from the recorded seed and
/// the freshly computed content hash is checked against
/// `prior.paths_content_hash`: a mismatch with no detected drift means the
/// generator or its inputs changed unrecorded, which is corruption
/// (`NumericError::ReplayDivergence`), not data drift — a mismatch
/// *alongside* detected (and accepted) drift is expected and not an error.
pub fn replay(
    provider: &dyn BarsProvider,
    prior: &RunMetadata,
    artifact_dir: &Path,
    override_to_warning: bool,
) -> Result<(RunMetadata, MetricsReport), EngineError> {
    let bars = provider.load(&prior.config.symbol, BAR_INTERVAL)?;
    let current_fp = fingerprint::fingerprint(&bars)?;
    let drift = fingerprint::detect_drift(&prior.data_fingerprint, &current_fp);
    fingerprint::validate_replay(&drift, &prior.config.thresholds, override_to_warning)
        .map_err(EngineError::Drift)?;

    let resolved = ResolvedConfig {
        config: prior.config.clone(),
        precedence: prior.precedence.clone(),
    };

    let persisted_path = prior
        .artifact_paths
        .paths_file
        .as_deref()
        .filter(|p| Path::new(p).exists())
        .filter(|_| matches!(prior.path_storage, paths::StorageTag::Memmap | paths::StorageTag::Npz));

    let run_id = Uuid::new_v4();

    let ctx = if let Some(persisted_path) = persisted_path {
        let path = Path::new(persisted_path);
        let closes = bars.closes()?;
        let s0 = *closes.last().ok_or(crate::error::DataError::InsufficientSamples {
            required: 1,
            actual: 0,
        })?;
        let mut loaded = match prior.path_storage {
            paths::StorageTag::Memmap => PricePaths::load_from_memmap(
                path,
                s0,
                prior.config.n_paths,
                prior.config.n_steps,
                prior.config.seed,
                vec![],
            ),
            paths::StorageTag::Npz => PricePaths::load_compressed(
                path,
                s0,
                prior.config.n_paths,
                prior.config.n_steps,
                prior.config.seed,
                vec![],
            ),
            paths::StorageTag::Memory => unreachable!("filtered to Memmap/Npz above"),
        }
        .map_err(|e| paths_io_err(path, e))?;

        let bankruptcies = paths::infer_bankruptcies(loaded.n_paths, loaded.n_steps, loaded.values());
        let bankruptcy_rate = bankruptcies.len() as f64 / loaded.n_paths as f64;
        if bankruptcy_rate > prior.config.thresholds.bankruptcy_fail_rate {
            return Err(EngineError::Numeric(NumericError::Bankruptcy {
                rate: bankruptcy_rate,
                bankrupt: bankruptcies.len(),
                total: loaded.n_paths,
            }));
        }
        let warn = bankruptcy_rate > prior.config.thresholds.bankruptcy_warn_rate;
        loaded.bankruptcies = bankruptcies.clone();

        RunContext {
            bars,
            fingerprint: current_fp.clone(),
            fit_record: prior.distribution_fit_record.clone(),
            paths: loaded,
            gen_report: paths::PathGenerationReport {
                bankruptcy_rate,
                bankruptcies,
                warn,
            },
        }
    } else {
        let ctx = build_context(provider, &resolved.config, None)?;
        let new_hash = ctx.paths.content_hash();
        if new_hash != prior.paths_content_hash && !drift.has_drift(&prior.config.thresholds) {
            return Err(EngineError::Numeric(NumericError::ReplayDivergence {
                old_hash: prior.paths_content_hash.clone(),
                new_hash,
            }));
        }
        ctx
    };

    if ctx.gen_report.warn {
        tracing::warn!(
            rate = ctx.gen_report.bankruptcy_rate,
            "bankruptcy rate above warn threshold"
        );
    }

    let (_, report) = run_one_strategy(
        &ctx,
        &resolved.config.strategy_params.name,
        &resolved.config.strategy_params.params,
        resolved.config.option_spec.as_ref(),
        &resolved.config.thresholds,
    )?;

    let mut artifact_paths = artifact_dir_paths(artifact_dir, run_id, false);
    if let Some(persisted_path) = &prior.artifact_paths.paths_file {
        if Path::new(persisted_path).exists() {
            artifact_paths.paths_file = Some(persisted_path.clone());
        }
    }
    std::fs::write(&artifact_paths.metrics_file, serde_json::to_vec_pretty(&report).unwrap_or_default())
        .map_err(|e| {
            EngineError::Config(crate::error::ConfigError::InvalidValue(crate::error::Violation {
                field: "artifact_paths.metrics_file".into(),
                value: artifact_paths.metrics_file.clone(),
                constraint: "must be writable".into(),
                remediation: format!("check directory permissions: {e}"),
            }))
        })?;

    let metadata = assemble_metadata(run_id, &resolved, &ctx, artifact_paths, Some(drift), CompletionStatus::Complete);
    metadata.write_atomic(&metadata_path(artifact_dir, run_id))?;
    Ok((metadata, report))
}
