//! `RunConfig` and layered configuration resolution.
//!
//! Precedence, fixed by the orchestrator design: command-line overrides >
//! environment > file > built-in defaults. [`resolve`] merges the layers and
//! records, per field, which layer won — the teacher validates config
//! structs with `garde` (`engine/types.rs`); this module follows the same
//! pattern for `RunConfig`.

pub mod thresholds;

use std::collections::BTreeMap;
use std::path::Path;

use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::distributions::DistributionKind;
use crate::error::{ConfigError, Violation};
use crate::pricing::OptionSpec;
use crate::selector::SelectorSpec;
use thresholds::Thresholds;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ResourceLimits {
    #[garde(range(min = 1))]
    pub max_workers: usize,
    /// Fraction of detected RAM the run is permitted to use, in (0, 1].
    #[garde(range(min = 0.01, max = 1.0))]
    pub mem_threshold: f64,
    /// Allow spilling to a compressed container when footprint exceeds
    /// the memmap threshold (section 4.2, rule 3).
    #[garde(skip)]
    pub persistent: bool,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_workers: 6,
            mem_threshold: 1.0,
            persistent: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct StrategyParams {
    #[garde(length(min = 1))]
    pub name: String,
    #[garde(skip)]
    pub params: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RunConfig {
    #[garde(length(min = 1))]
    pub symbol: String,
    #[garde(range(min = 1))]
    pub n_paths: usize,
    #[garde(range(min = 1))]
    pub n_steps: usize,
    #[garde(skip)]
    pub seed: u64,
    #[garde(skip)]
    pub distribution_model: DistributionKind,
    #[garde(length(min = 1))]
    pub data_source: String,
    #[garde(skip)]
    pub selector: Option<SelectorSpec>,
    #[garde(skip)]
    pub grid: Option<Vec<StrategyParams>>,
    #[garde(dive)]
    pub resource_limits: ResourceLimits,
    #[garde(dive)]
    pub strategy_params: StrategyParams,
    #[garde(skip)]
    pub option_spec: Option<OptionSpec>,
    #[garde(skip)]
    #[serde(default)]
    pub thresholds: Thresholds,
    #[garde(skip)]
    #[serde(default)]
    pub allow_transform: bool,
    #[garde(skip)]
    #[serde(default)]
    pub fallback_to_default: bool,
}

/// Which configuration layer ultimately supplied a field's value.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PrecedenceSource {
    CommandLine,
    Environment,
    File,
    BuiltinDefault,
}

/// The resolved config plus a per-field provenance record, persisted into
/// `RunMetadata` (section 4.7 / 4.9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedConfig {
    pub config: RunConfig,
    pub precedence: BTreeMap<String, PrecedenceSource>,
}

/// One configuration layer: a partial, field-named map of raw string
/// overrides (as they'd arrive from the CLI or environment).
pub type Overrides = BTreeMap<String, String>;

/// Merge file config with environment and CLI overrides per the fixed
/// precedence (CLI > env > file > default), then validate.
pub fn resolve(
    file_path: Option<&Path>,
    env: &Overrides,
    cli: &Overrides,
) -> Result<ResolvedConfig, ConfigError> {
    let mut precedence = BTreeMap::new();

    let mut config: RunConfig = match file_path {
        Some(p) => {
            let text = std::fs::read_to_string(p)
                .map_err(|e| ConfigError::InvalidValue(Violation {
                    field: "config_path".into(),
                    value: p.display().to_string(),
                    constraint: "must be a readable file".into(),
                    remediation: format!("check the path exists and is readable: {e}"),
                }))?;
            let cfg: RunConfig = toml::from_str(&text).map_err(|e| {
                ConfigError::InvalidValue(Violation {
                    field: "config_file".into(),
                    value: p.display().to_string(),
                    constraint: "must deserialize into RunConfig".into(),
                    remediation: format!("fix the TOML: {e}"),
                })
            })?;
            for key in field_names() {
                precedence.insert(key.to_string(), PrecedenceSource::File);
            }
            cfg
        }
        None => {
            return Err(ConfigError::MissingField("config_path".into()));
        }
    };

    apply_overrides(&mut config, env, &mut precedence, PrecedenceSource::Environment)?;
    apply_overrides(&mut config, cli, &mut precedence, PrecedenceSource::CommandLine)?;

    config.validate().map_err(|report| {
        ConfigError::InvalidValue(Violation {
            field: "run_config".into(),
            value: String::new(),
            constraint: report.to_string(),
            remediation: "fix the reported fields and re-run".into(),
        })
    })?;

    Ok(ResolvedConfig { config, precedence })
}

fn field_names() -> &'static [&'static str] {
    &[
        "symbol",
        "n_paths",
        "n_steps",
        "seed",
        "distribution_model",
        "data_source",
        "resource_limits.max_workers",
        "resource_limits.mem_threshold",
    ]
}

fn apply_overrides(
    config: &mut RunConfig,
    overrides: &Overrides,
    precedence: &mut BTreeMap<String, PrecedenceSource>,
    source: PrecedenceSource,
) -> Result<(), ConfigError> {
    for (key, value) in overrides {
        match key.as_str() {
            "symbol" => config.symbol = value.clone(),
            "data_source" => config.data_source = value.clone(),
            "n_paths" => {
                config.n_paths = value.parse().map_err(|_| invalid(key, value, "integer"))?;
            }
            "n_steps" => {
                config.n_steps = value.parse().map_err(|_| invalid(key, value, "integer"))?;
            }
            "seed" => {
                config.seed = value.parse().map_err(|_| invalid(key, value, "u64"))?;
            }
            "resource_limits.max_workers" => {
                config.resource_limits.max_workers =
                    value.parse().map_err(|_| invalid(key, value, "integer"))?;
            }
            "resource_limits.mem_threshold" => {
                config.resource_limits.mem_threshold =
                    value.parse().map_err(|_| invalid(key, value, "float"))?;
            }
            other => {
                return Err(ConfigError::InvalidValue(Violation {
                    field: other.into(),
                    value: value.clone(),
                    constraint: "known config field".into(),
                    remediation: "remove or correct the override key".into(),
                }))
            }
        }
        precedence.insert(key.clone(), source);
    }
    Ok(())
}

fn invalid(field: &str, value: &str, kind: &str) -> ConfigError {
    ConfigError::InvalidValue(Violation {
        field: field.into(),
        value: value.into(),
        constraint: format!("must parse as {kind}"),
        remediation: format!("supply a valid {kind} for `{field}`"),
    })
}
