//! Environment capture (section 4.9d): OS, architecture, CPU count, RAM,
//! code version, and pinned dependency versions of the numeric stack.
//!
//! Grounded on the CLI teacher's `get_git_hash`/`host_fingerprint`
//! (`mqk-cli/src/main.rs` in the wider examples pack) generalized into a
//! structured, serializable record instead of ad hoc println fields.

use serde::{Deserialize, Serialize};
use sysinfo::System;

/// Best-effort source-control revision. `dirty` and `modified_files` are
/// populated only when `git status --porcelain` reports uncommitted
/// changes; absent entirely (both `None`) when no `.git` directory is
/// found, which the caller logs as a warning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CodeVersion {
    pub revision: Option<String>,
    pub dirty: bool,
    pub modified_files: Vec<String>,
}

/// `{provider}_{semver}_{iso8601_date}_{abbreviated_revision}` (section
/// 4.9). `provider` is fixed to `git` since that's the only source-control
/// backend this crate introspects.
pub fn source_version_identifier(
    semver: &str,
    iso8601_date: &str,
    code_version: &CodeVersion,
) -> String {
    let revision = code_version.revision.as_deref().unwrap_or("unknown");
    format!("git_{semver}_{iso8601_date}_{revision}")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Environment {
    pub os_name: String,
    pub os_version: String,
    pub architecture: String,
    pub rustc_version: String,
    pub cpu_count: usize,
    pub total_ram_bytes: u64,
    pub code_version: CodeVersion,
    /// Pinned versions of the numeric stack this crate's determinism
    /// guarantees depend on — statrs, rand, rayon.
    pub dependency_versions: Vec<(String, String)>,
}

fn git_revision() -> Option<String> {
    let out = std::process::Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()?;
    if !out.status.success() {
        return None;
    }
    String::from_utf8(out.stdout).ok().map(|s| s.trim().to_string())
}

fn git_dirty_files() -> Vec<String> {
    std::process::Command::new("git")
        .args(["status", "--porcelain"])
        .output()
        .ok()
        .filter(|out| out.status.success())
        .map(|out| {
            String::from_utf8_lossy(&out.stdout)
                .lines()
                .map(|line| line.trim_start_matches(['M', 'A', 'D', 'R', '?', ' ']).trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

pub fn capture_code_version() -> CodeVersion {
    let revision = git_revision();
    if revision.is_none() {
        tracing::warn!("no git revision detected; code_version.revision will be null");
    }
    let modified_files = git_dirty_files();
    CodeVersion {
        revision,
        dirty: !modified_files.is_empty(),
        modified_files,
    }
}

/// Dependency versions baked in at compile time via `option_env!` lookups
/// against the workspace's own resolved `Cargo.lock` metadata — kept
/// deliberately simple per the supplemented-features design note (no
/// proc-macro version scraping). When a version isn't known at build time
/// the entry is recorded as `"unknown"` rather than omitted, so the key set
/// stays stable across builds.
fn dependency_versions() -> Vec<(String, String)> {
    [
        ("statrs", option_env!("DEP_STATRS_VERSION")),
        ("rand", option_env!("DEP_RAND_VERSION")),
        ("rayon", option_env!("DEP_RAYON_VERSION")),
    ]
    .into_iter()
    .map(|(name, v)| (name.to_string(), v.unwrap_or("unknown").to_string()))
    .collect()
}

pub fn capture() -> Environment {
    let mut sys = System::new_all();
    sys.refresh_all();
    Environment {
        os_name: System::name().unwrap_or_else(|| "unknown".to_string()),
        os_version: System::os_version().unwrap_or_else(|| "unknown".to_string()),
        architecture: std::env::consts::ARCH.to_string(),
        rustc_version: option_env!("RUSTC_VERSION").unwrap_or("unknown").to_string(),
        cpu_count: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
        total_ram_bytes: sys.total_memory(),
        code_version: capture_code_version(),
        dependency_versions: dependency_versions(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_populates_cpu_count() {
        let env = capture();
        assert!(env.cpu_count >= 1);
    }

    #[test]
    fn source_version_identifier_format() {
        let cv = CodeVersion {
            revision: Some("abc1234".to_string()),
            dirty: false,
            modified_files: vec![],
        };
        let id = source_version_identifier("1.2.3", "2026-07-28", &cv);
        assert_eq!(id, "git_1.2.3_2026-07-28_abc1234");
    }

    #[test]
    fn source_version_identifier_handles_missing_revision() {
        let cv = CodeVersion {
            revision: None,
            dirty: false,
            modified_files: vec![],
        };
        let id = source_version_identifier("1.0.0", "2026-01-01", &cv);
        assert!(id.contains("unknown"));
    }

    #[test]
    fn dependency_versions_has_stable_key_set() {
        let deps = dependency_versions();
        let names: Vec<&str> = deps.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["statrs", "rand", "rayon"]);
    }
}
