//! Conditional Monte Carlo (C6): bootstrap or parametric-refit sampling
//! conditioned on candidate episodes, used by the `conditional` command in
//! place of the unconditional generator (C2) when a "now" state vector is
//! supplied.
//!
//! Grounded on the teacher's nearest-neighbor delta-matching idiom in
//! `engine/filters.rs` (`select_closest_delta`) generalized from a single
//! scalar distance to a standardized Euclidean distance over the
//! selector's declared feature vector, and on C1/C2 for the parametric
//! refit + delegate path.

use std::collections::BTreeMap;

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::config::thresholds::Thresholds;
use crate::distributions::{self, DistributionKind, FitOptions};
use crate::error::FitError;
use crate::paths::{self, PathGenerationReport, PricePaths};
use crate::repro::seed::derive_seed;
use crate::selector::CandidateEpisode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConditionalMethod {
    #[default]
    Bootstrap,
    ParametricRefit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditioningReport {
    pub method: ConditionalMethod,
    pub matches: usize,
    pub fallback_used: bool,
}

/// Standardize each episode's declared feature vector by the historical
/// population mean/std (one mean/std per feature key across all episodes),
/// then return the Euclidean distance of each episode from `target_state`
/// in that standardized space.
fn standardized_distances(
    episodes: &[CandidateEpisode],
    target_state: &BTreeMap<String, f64>,
) -> Vec<f64> {
    let keys: Vec<&String> = target_state.keys().collect();
    let mut mean = BTreeMap::new();
    let mut std = BTreeMap::new();
    for key in &keys {
        let values: Vec<f64> = episodes
            .iter()
            .filter_map(|e| e.state_features.get(*key).copied())
            .collect();
        if values.is_empty() {
            mean.insert((*key).clone(), 0.0);
            std.insert((*key).clone(), 1.0);
            continue;
        }
        let m = values.iter().sum::<f64>() / values.len() as f64;
        let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
        mean.insert((*key).clone(), m);
        std.insert((*key).clone(), var.sqrt().max(1e-12));
    }

    episodes
        .iter()
        .map(|episode| {
            keys.iter()
                .map(|key| {
                    let value = episode.state_features.get(*key).copied().unwrap_or(0.0);
                    let target = target_state.get(*key).copied().unwrap_or(0.0);
                    let z_value = (value - mean[*key]) / std[*key];
                    let z_target = (target - mean[*key]) / std[*key];
                    (z_value - z_target).powi(2)
                })
                .sum::<f64>()
                .sqrt()
        })
        .collect()
}

/// Filter `episodes` down to those within `distance_threshold` (z-space) of
/// `target_state`, sorted by ascending distance.
pub fn match_episodes<'a>(
    episodes: &'a [CandidateEpisode],
    target_state: &BTreeMap<String, f64>,
    distance_threshold: f64,
) -> Vec<&'a CandidateEpisode> {
    let distances = standardized_distances(episodes, target_state);
    let mut paired: Vec<(&CandidateEpisode, f64)> = episodes.iter().zip(distances).collect();
    paired.retain(|(_, d)| *d <= distance_threshold);
    paired.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
    paired.into_iter().map(|(e, _)| e).collect()
}

/// Bootstrap sampling: resample-with-replacement from the matched episodes'
/// historical return windows to fill `(n_paths, n_steps)`. `historical_returns`
/// is indexed by the same offsets as the episodes' `t0`.
fn bootstrap_sample(
    matched: &[&CandidateEpisode],
    historical_returns: &[f64],
    n_paths: usize,
    n_steps: usize,
    seed: u64,
) -> Vec<f64> {
    let bootstrap_seed = derive_seed(seed, "conditional-bootstrap");
    let mut rng = ChaCha8Rng::seed_from_u64(bootstrap_seed);
    let mut out = vec![0.0; n_paths * n_steps];
    for p in 0..n_paths {
        let episode = matched.choose(&mut rng).expect("matched is non-empty");
        let start = episode.t0;
        for step in 0..n_steps {
            let idx = (start + step).min(historical_returns.len().saturating_sub(1));
            out[p * n_steps + step] = historical_returns[idx];
        }
    }
    out
}

/// Condition path generation on episodes matching `target_state`. Falls
/// back to the unconditional generator (with a warning recorded on the
/// report) when fewer than `min_match` episodes match. Every branch returns
/// the real `FitRecord` computed for that branch's return series — the
/// fallback and parametric-refit branches' own fit, the bootstrap branch's
/// descriptive fit over the matched episodes' union returns — rather than a
/// placeholder, so the caller can record an accurate
/// `distribution_fit_record` in `RunMetadata`.
#[allow(clippy::too_many_arguments)]
pub fn conditional_sample(
    historical_returns: &[f64],
    episodes: &[CandidateEpisode],
    target_state: &BTreeMap<String, f64>,
    method: ConditionalMethod,
    distribution_kind: DistributionKind,
    s0: f64,
    n_paths: usize,
    n_steps: usize,
    seed: u64,
    thresholds: &Thresholds,
    mem_threshold_fraction: f64,
    persistent: bool,
) -> Result<(PricePaths, PathGenerationReport, ConditioningReport, distributions::FitRecord), FitError> {
    // `fallback_to_default` lets a degenerate/near-constant matched-episode
    // window (scale collapsing to ~0 under MLE) still produce a usable
    // descriptive fit via `laplace::method_of_moments` instead of failing
    // the whole conditional run; `allow_transform` tolerates a non-stationary
    // matched window the same way the unconditional `build_context` does.
    let fit_options = FitOptions {
        allow_transform: true,
        fallback_to_default: true,
        ..FitOptions::default()
    };

    let matched = match_episodes(episodes, target_state, thresholds.distance_threshold);

    if matched.len() < thresholds.min_match {
        tracing::warn!(
            matches = matched.len(),
            min_match = thresholds.min_match,
            "conditional MC: too few episode matches, falling back to unconditional sampling"
        );
        let fit_record = distributions::fit(distribution_kind, historical_returns, seed, &fit_options)?;
        let (paths, gen_report) = paths::generate(
            s0,
            &fit_record.distribution,
            n_paths,
            n_steps,
            seed,
            thresholds,
            mem_threshold_fraction,
            persistent,
            None,
        )
        .map_err(|_| FitError::NonConvergence {
            iterations: 0,
            tolerance: 0.0,
        })?;
        return Ok((
            paths,
            gen_report,
            ConditioningReport {
                method,
                matches: matched.len(),
                fallback_used: true,
            },
            fit_record,
        ));
    }

    match method {
        ConditionalMethod::Bootstrap => {
            let union_returns: Vec<f64> = matched
                .iter()
                .flat_map(|episode| {
                    let start = episode.t0;
                    let end = (start + episode.horizon).min(historical_returns.len());
                    historical_returns[start..end].to_vec()
                })
                .collect();
            // Bootstrap resamples raw historical windows rather than a
            // fitted distribution, but `RunMetadata` still needs a record of
            // what the matched episodes' return distribution looked like;
            // this is a descriptive fit, not the generator it feeds.
            let fit_record = distributions::fit(distribution_kind, &union_returns, seed, &fit_options)?;

            let log_returns = bootstrap_sample(&matched, historical_returns, n_paths, n_steps, seed);
            let (values, bankruptcies) = accumulate(log_returns, s0, n_paths, n_steps, thresholds);
            let bankruptcy_rate = bankruptcies.len() as f64 / n_paths as f64;
            let warn = bankruptcy_rate > thresholds.bankruptcy_warn_rate;
            Ok((
                PricePaths::from_values(s0, n_paths, n_steps, seed, values, bankruptcies),
                PathGenerationReport {
                    bankruptcy_rate,
                    bankruptcies: vec![],
                    warn,
                },
                ConditioningReport {
                    method,
                    matches: matched.len(),
                    fallback_used: false,
                },
                fit_record,
            ))
        }
        ConditionalMethod::ParametricRefit => {
            let union_returns: Vec<f64> = matched
                .iter()
                .flat_map(|episode| {
                    let start = episode.t0;
                    let end = (start + episode.horizon).min(historical_returns.len());
                    historical_returns[start..end].to_vec()
                })
                .collect();
            let fit_record = distributions::fit(distribution_kind, &union_returns, seed, &fit_options)?;
            let (paths, gen_report) = paths::generate(
                s0,
                &fit_record.distribution,
                n_paths,
                n_steps,
                seed,
                thresholds,
                mem_threshold_fraction,
                persistent,
                None,
            )
            .map_err(|_| FitError::NonConvergence {
                iterations: 0,
                tolerance: 0.0,
            })?;
            Ok((
                paths,
                gen_report,
                ConditioningReport {
                    method,
                    matches: matched.len(),
                    fallback_used: false,
                },
                fit_record,
            ))
        }
    }
}

fn accumulate(
    log_returns: Vec<f64>,
    s0: f64,
    n_paths: usize,
    n_steps: usize,
    thresholds: &Thresholds,
) -> (Vec<f64>, Vec<crate::paths::BankruptcyEvent>) {
    let width = n_steps + 1;
    let mut values = vec![0.0; n_paths * width];
    let mut bankruptcies = Vec::new();
    for p in 0..n_paths {
        values[p * width] = s0;
        let mut cumsum = 0.0;
        let mut bankrupt = false;
        for step in 0..n_steps {
            if bankrupt {
                values[p * width + step + 1] = 0.0;
                continue;
            }
            cumsum += log_returns[p * n_steps + step];
            let mut value = s0 * cumsum.exp();
            if !value.is_finite() || value > 1e18 || value <= 0.0 {
                bankrupt = true;
                value = 0.0;
                bankruptcies.push(crate::paths::BankruptcyEvent {
                    path: p,
                    step: step + 1,
                });
            }
            values[p * width + step + 1] = value;
        }
    }
    let _ = thresholds;
    (values, bankruptcies)
}
