//! The closed error taxonomy. Each variant carries a stable machine-readable
//! tag and maps to one of the process exit codes in the CLI surface.

use thiserror::Error;

/// One offending field/value/constraint/remediation bundle, attached to
/// every user-visible failure per the error-handling design.
#[derive(Debug, Clone)]
pub struct Violation {
    pub field: String,
    pub value: String,
    pub constraint: String,
    pub remediation: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "field `{}` = `{}` violates `{}` — {}",
            self.field, self.value, self.constraint, self.remediation
        )
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required field: {0}")]
    MissingField(String),
    #[error("invalid value: {0}")]
    InvalidValue(Violation),
    #[error("contradictory settings: {0}")]
    Contradictory(String),
}

#[derive(Debug, Error)]
pub enum DataError {
    #[error("schema mismatch: expected {expected}, found {found}")]
    SchemaMismatch { expected: String, found: String },
    #[error("insufficient samples: need at least {required}, have {actual}")]
    InsufficientSamples { required: usize, actual: usize },
    #[error("gap beyond tolerance at index {index}: {gap_intervals}x interval (max {max_intervals}x)")]
    GapBeyondTolerance {
        index: usize,
        gap_intervals: f64,
        max_intervals: f64,
    },
    #[error("timestamp anomaly at index {index}: {detail}")]
    TimestampAnomaly { index: usize, detail: String },
}

#[derive(Debug, Error)]
pub enum FitError {
    #[error("insufficient data: need at least {required} samples, have {actual}")]
    InsufficientData { required: usize, actual: usize },
    #[error("optimizer did not converge after {iterations} iterations (tolerance {tolerance})")]
    NonConvergence { iterations: usize, tolerance: f64 },
    #[error("series is non-stationary (unit-root test failed) and allow_transform is false")]
    NonStationary,
    #[error("implausible fitted parameters: {0}")]
    ImplausibleParams(String),
}

#[derive(Debug, Error)]
pub enum ResourceLimitError {
    #[error("memory ceiling crossed: footprint {footprint_bytes} bytes exceeds limit {limit_bytes} bytes")]
    Memory {
        footprint_bytes: u64,
        limit_bytes: u64,
    },
    #[error("cpu ceiling crossed: requested {requested} workers, ceiling {ceiling}")]
    Cpu { requested: usize, ceiling: usize },
}

#[derive(Debug, Error)]
pub enum NumericError {
    #[error("bankruptcy rate {rate:.4} exceeds 50% of paths ({bankrupt}/{total})")]
    Bankruptcy {
        rate: f64,
        bankrupt: usize,
        total: usize,
    },
    #[error("non-finite value encountered at path {path}, step {step}")]
    Overflow { path: usize, step: usize },
    #[error("invalid implied volatility: {0} (must be > 0)")]
    InvalidIv(f64),
    #[error("replay diverged from recorded hash with no detected drift: {old_hash} -> {new_hash}")]
    ReplayDivergence { old_hash: String, new_hash: String },
}

#[derive(Debug, Error)]
pub enum DriftError {
    #[error("schema drift: {0}")]
    SchemaDrift(String),
    #[error("count drift: {old} -> {new} ({pct:.2}% change, threshold 10%)")]
    CountDrift { old: usize, new: usize, pct: f64 },
    #[error("distribution drift: {field} changed by {pct:.2}% (threshold 20%)")]
    DistributionDrift { field: String, pct: f64 },
}

#[derive(Debug, Error)]
#[error("missing required feature: {0}")]
pub struct MissingFeatureError(pub String);

/// Top-level error enum binding the taxonomy together. Every run-ending
/// failure is one of these.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Fit(#[from] FitError),
    #[error(transparent)]
    ResourceLimit(#[from] ResourceLimitError),
    #[error(transparent)]
    Numeric(#[from] NumericError),
    #[error(transparent)]
    Drift(#[from] DriftError),
    #[error(transparent)]
    MissingFeature(#[from] MissingFeatureError),
}

impl EngineError {
    /// Stable machine-readable tag, e.g. `FitError:NonStationary`.
    pub fn tag(&self) -> String {
        match self {
            EngineError::Config(ConfigError::MissingField(_)) => "ConfigError:MissingField".into(),
            EngineError::Config(ConfigError::InvalidValue(_)) => "ConfigError:InvalidValue".into(),
            EngineError::Config(ConfigError::Contradictory(_)) => "ConfigError:Contradictory".into(),
            EngineError::Data(DataError::SchemaMismatch { .. }) => "DataError:SchemaMismatch".into(),
            EngineError::Data(DataError::InsufficientSamples { .. }) => {
                "DataError:InsufficientSamples".into()
            }
            EngineError::Data(DataError::GapBeyondTolerance { .. }) => {
                "DataError:GapBeyondTolerance".into()
            }
            EngineError::Data(DataError::TimestampAnomaly { .. }) => {
                "DataError:TimestampAnomaly".into()
            }
            EngineError::Fit(FitError::InsufficientData { .. }) => "FitError:InsufficientData".into(),
            EngineError::Fit(FitError::NonConvergence { .. }) => "FitError:NonConvergence".into(),
            EngineError::Fit(FitError::NonStationary) => "FitError:NonStationary".into(),
            EngineError::Fit(FitError::ImplausibleParams(_)) => "FitError:ImplausibleParams".into(),
            EngineError::ResourceLimit(_) => "ResourceLimitError".into(),
            EngineError::Numeric(NumericError::Bankruptcy { .. }) => "NumericError:Bankruptcy".into(),
            EngineError::Numeric(NumericError::Overflow { .. }) => "NumericError:Overflow".into(),
            EngineError::Numeric(NumericError::InvalidIv(_)) => "NumericError:InvalidIV".into(),
            EngineError::Numeric(NumericError::ReplayDivergence { .. }) => {
                "NumericError:ReplayDivergence".into()
            }
            EngineError::Drift(DriftError::SchemaDrift(_)) => "DriftError:SchemaDrift".into(),
            EngineError::Drift(DriftError::CountDrift { .. }) => "DriftError:CountDrift".into(),
            EngineError::Drift(DriftError::DistributionDrift { .. }) => {
                "DriftError:DistributionDrift".into()
            }
            EngineError::MissingFeature(_) => "MissingFeatureError".into(),
        }
    }

    /// Process exit code per the CLI surface (section 6).
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::Config(_) => 2,
            EngineError::Data(_) => 3,
            EngineError::Drift(_) => 3,
            EngineError::ResourceLimit(_) => 4,
            EngineError::Fit(_) | EngineError::Numeric(_) => 5,
            EngineError::MissingFeature(_) => 2,
        }
    }
}
