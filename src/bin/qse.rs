//! `qse` — the CLI front end for the five orchestrator commands.
//!
//! Out of scope per the design: this binary is the one named external
//! collaborator the core fixes semantics for but not surface syntax.
//! Mirrors the teacher's `main.rs` tracing-subscriber bootstrap
//! (`tracing_subscriber::fmt().with_env_filter(...)`) with `clap` derive
//! parsing in place of the teacher's MCP stdio/HTTP dispatch.

use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use qse::config::{self, Overrides};
use qse::conditional::ConditionalMethod;
use qse::data::CsvBarsProvider;
use qse::error::EngineError;
use qse::orchestrator;
use qse::repro::metadata::RunMetadata;

#[derive(Parser)]
#[command(name = "qse", version, about = "CPU-only quantitative scenario engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fit + simulate + score a single strategy against its historical baseline.
    Compare(RunArgs),
    /// Fan the configured strategy out over `config.grid`'s parameter sets.
    Grid(RunArgs),
    /// Run the candidate selector alone; no fit, no simulation.
    Screen(ScreenArgs),
    /// Select episodes and condition path generation on a target state.
    Conditional(ConditionalArgs),
    /// Regenerate a prior run's outputs from its `run_meta.json` and current data.
    Replay(ReplayArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Path to the TOML config file.
    #[arg(long)]
    config: PathBuf,
    /// Root directory of per-symbol CSV bars.
    #[arg(long, default_value = "data")]
    data_root: PathBuf,
    /// Directory runs are persisted under.
    #[arg(long, default_value = "runs")]
    runs_root: PathBuf,
    /// Override seed.
    #[arg(long)]
    seed: Option<u64>,
    /// `field=value` override, repeatable, highest precedence.
    #[arg(long = "set", value_parser = parse_kv)]
    overrides: Vec<(String, String)>,
    /// Resume a prior `grid` run by its `run_id` instead of starting fresh:
    /// `config_id`s that already have a `configs/<config_id>/metrics.json`
    /// under `runs_root/<run_id>/` are skipped (section 4.8). Ignored by
    /// `compare` and `conditional`.
    #[arg(long)]
    resume: Option<uuid::Uuid>,
}

#[derive(Args)]
struct ScreenArgs {
    #[arg(long)]
    config: PathBuf,
    #[arg(long, default_value = "data")]
    data_root: PathBuf,
    #[arg(long = "set", value_parser = parse_kv)]
    overrides: Vec<(String, String)>,
}

#[derive(Args)]
struct ConditionalArgs {
    #[command(flatten)]
    run: RunArgs,
    /// `feature=value` pair describing the "now" state to condition on, repeatable.
    #[arg(long = "state", value_parser = parse_kv)]
    target_state: Vec<(String, String)>,
    /// Use parametric refit instead of the default bootstrap.
    #[arg(long)]
    parametric: bool,
}

#[derive(Args)]
struct ReplayArgs {
    /// Path to the prior run's `run_meta.json`.
    #[arg(long)]
    metadata: PathBuf,
    #[arg(long, default_value = "data")]
    data_root: PathBuf,
    #[arg(long, default_value = "runs")]
    runs_root: PathBuf,
    /// Downgrade any drift class to a warning instead of aborting.
    #[arg(long)]
    override_drift: bool,
}

fn parse_kv(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected `field=value`, got `{s}`"))
}

fn env_overrides() -> Overrides {
    let mut env = Overrides::new();
    for (key, var) in [
        ("seed", "QSE_SEED"),
        ("n_paths", "QSE_N_PATHS"),
        ("n_steps", "QSE_N_STEPS"),
        ("resource_limits.max_workers", "QSE_MAX_WORKERS"),
        ("resource_limits.mem_threshold", "QSE_MEM_THRESHOLD"),
    ] {
        if let Ok(value) = std::env::var(var) {
            env.insert(key.to_string(), value);
        }
    }
    env
}

fn cli_overrides(extra: &[(String, String)], seed: Option<u64>) -> Overrides {
    let mut cli: Overrides = extra.iter().cloned().collect();
    if let Some(seed) = seed {
        cli.insert("seed".to_string(), seed.to_string());
    }
    cli
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = match run(cli.command) {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!(tag = %e.tag(), "run failed");
            eprintln!("error [{}]: {e}", e.tag());
            e.exit_code()
        }
    };
    std::process::exit(code);
}

fn run(command: Command) -> Result<(), EngineError> {
    match command {
        Command::Compare(args) => run_compare(args),
        Command::Grid(args) => run_grid_cmd(args),
        Command::Screen(args) => run_screen(args),
        Command::Conditional(args) => run_conditional(args),
        Command::Replay(args) => run_replay(args),
    }
}

fn resolve(config_path: &std::path::Path, overrides: &[(String, String)], seed: Option<u64>) -> Result<config::ResolvedConfig, EngineError> {
    let env = env_overrides();
    let cli = cli_overrides(overrides, seed);
    config::resolve(Some(config_path), &env, &cli).map_err(EngineError::from)
}

fn run_compare(args: RunArgs) -> Result<(), EngineError> {
    let resolved = resolve(&args.config, &args.overrides, args.seed)?;
    let provider = CsvBarsProvider::new(&args.data_root);
    std::fs::create_dir_all(&args.runs_root).ok();
    let (metadata, report) = orchestrator::compare(&provider, &resolved, &args.runs_root)?;
    println!(
        "run {} complete: sharpe={:.4} mean_pnl={:.4}",
        metadata.run_id, report.unconditional.sharpe, report.unconditional.mean_pnl
    );
    Ok(())
}

fn run_grid_cmd(args: RunArgs) -> Result<(), EngineError> {
    let resolved = resolve(&args.config, &args.overrides, args.seed)?;
    let provider = CsvBarsProvider::new(&args.data_root);
    std::fs::create_dir_all(&args.runs_root).ok();
    let detected_cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);

    let run_id = args.resume.unwrap_or_else(uuid::Uuid::new_v4);
    let already_completed = if args.resume.is_some() {
        let configs_dir = args.runs_root.join(run_id.to_string()).join("configs");
        let completed = qse::grid::completed_config_ids(&configs_dir);
        tracing::info!(run_id = %run_id, completed = completed.len(), "resuming grid");
        completed
    } else {
        std::collections::HashSet::new()
    };

    // The cancellation flag is single-writer/many-reader core state (design
    // note section 9); wiring its writer to an actual SIGINT/SIGTERM handler
    // is this CLI collaborator's job (section 1 fixes semantics, not the
    // front-end's surface), so it starts unset here and only ever flips if a
    // future front-end revision installs a signal handler that calls
    // `cancellation.request()`.
    let cancellation = qse::grid::CancellationFlag::new();

    let (metadata, report) = orchestrator::run_grid(
        &provider,
        &resolved,
        &args.runs_root,
        run_id,
        &already_completed,
        detected_cpus,
        &cancellation,
    )?;
    println!(
        "run {} grid complete: {} configs, partial={}, interrupted={}",
        metadata.run_id,
        report.entries.len(),
        report.partial,
        report.interrupted
    );
    if report.interrupted {
        // Section 6: exit code 6 is reserved for a grid interrupted before
        // every config was dispatched. Per-config failures alone (scenario
        // 5) are grid-level success and exit 0 with warnings.
        std::process::exit(6);
    }
    Ok(())
}

fn run_screen(args: ScreenArgs) -> Result<(), EngineError> {
    let env = env_overrides();
    let cli: Overrides = args.overrides.into_iter().collect();
    let resolved = config::resolve(Some(&args.config), &env, &cli)?;
    let provider = CsvBarsProvider::new(&args.data_root);
    let report = orchestrator::screen(&provider, &resolved.config)?;
    println!(
        "{} episodes selected (sparsity_warning={})",
        report.episodes.len(),
        report.sparsity_warning
    );
    Ok(())
}

fn run_conditional(args: ConditionalArgs) -> Result<(), EngineError> {
    let resolved = resolve(&args.run.config, &args.run.overrides, args.run.seed)?;
    let provider = CsvBarsProvider::new(&args.run.data_root);
    std::fs::create_dir_all(&args.run.runs_root).ok();

    let mut target_state = BTreeMap::new();
    for (key, value) in &args.target_state {
        let parsed: f64 = value.parse().map_err(|_| {
            qse::error::ConfigError::InvalidValue(qse::error::Violation {
                field: key.clone(),
                value: value.clone(),
                constraint: "must parse as f64".to_string(),
                remediation: "supply a numeric value for the state feature".to_string(),
            })
        })?;
        target_state.insert(key.clone(), parsed);
    }
    let method = if args.parametric {
        ConditionalMethod::ParametricRefit
    } else {
        ConditionalMethod::Bootstrap
    };

    let (metadata, report, conditioning) =
        orchestrator::conditional_run(&provider, &resolved, &target_state, method, &args.run.runs_root)?;
    println!(
        "run {} conditional complete: matches={} fallback={} sharpe={:.4}",
        metadata.run_id, conditioning.matches, conditioning.fallback_used, report.unconditional.sharpe
    );
    Ok(())
}

fn run_replay(args: ReplayArgs) -> Result<(), EngineError> {
    let prior = RunMetadata::read(&args.metadata)?;
    let provider = CsvBarsProvider::new(&args.data_root);
    std::fs::create_dir_all(&args.runs_root).ok();
    let (metadata, report) = orchestrator::replay(&provider, &prior, &args.runs_root, args.override_drift)?;
    println!(
        "run {} replay complete: drift={:?} sharpe={:.4}",
        metadata.run_id,
        metadata
            .drift_report
            .as_ref()
            .map(|d| (d.schema_drift, d.count_drift_pct, d.std_drift_pct)),
        report.unconditional.sharpe
    );
    Ok(())
}
