//! Path Generator & Storage Policy (C2).
//!
//! Draws an (n_paths x n_steps) matrix of log-returns from a fitted
//! distribution, cumulative-sums it across the step axis, exponentiates and
//! scales by `s0`. Each row (path) derives its own seed from the run seed
//! via [`crate::repro::seed::derive_seed`], so the result is identical
//! regardless of how rows are batched for I/O — this is what makes the
//! memory/memmap storage tiers byte-identical (section 4.2's determinism
//! invariant) while still following the design note's "per-path-chunk"
//! seed-derivation guidance: the chunk granularity for seeding is one row,
//! and I/O chunking (how many rows are held in the working set at once) is
//! a free variable that cannot perturb the result.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use memmap2::{Mmap, MmapMut};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sysinfo::System;
use uuid::Uuid;

use crate::config::thresholds::Thresholds;
use crate::distributions::ReturnDistribution;
use crate::error::{ConfigError, EngineError, NumericError, ResourceLimitError, Violation};
use crate::repro::seed::derive_seed;

const OVERFLOW_CEILING: f64 = 1e18;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageTag {
    Memory,
    Memmap,
    Npz,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BankruptcyEvent {
    pub path: usize,
    pub step: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathGenerationReport {
    pub bankruptcy_rate: f64,
    pub bankruptcies: Vec<BankruptcyEvent>,
    pub warn: bool,
}

/// Rectangular (n_paths, n_steps+1) array of positive floats, first column
/// `s0`. Stored flat, row-major (one path per row).
#[derive(Debug, Clone)]
pub struct PricePaths {
    pub s0: f64,
    pub n_paths: usize,
    pub n_steps: usize,
    pub seed: u64,
    pub storage: StorageTag,
    values: Vec<f64>,
    pub bankruptcies: Vec<BankruptcyEvent>,
}

impl PricePaths {
    /// Build directly from already-accumulated flat row-major values —
    /// used by the conditional sampler (C6), which walks its own
    /// bootstrap/refit accumulation loop instead of calling [`generate`].
    pub fn from_values(
        s0: f64,
        n_paths: usize,
        n_steps: usize,
        seed: u64,
        values: Vec<f64>,
        bankruptcies: Vec<BankruptcyEvent>,
    ) -> Self {
        Self {
            s0,
            n_paths,
            n_steps,
            seed,
            storage: StorageTag::Memory,
            values,
            bankruptcies,
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.n_paths, self.n_steps + 1)
    }

    pub fn row(&self, path: usize) -> &[f64] {
        let width = self.n_steps + 1;
        &self.values[path * width..(path + 1) * width]
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// SHA-256 hex digest of the flat row-major values, used by `replay` to
    /// verify a regenerated matrix against the hash recorded at the
    /// original run (section 4.2's determinism invariant, applied across
    /// runs rather than across storage tiers).
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for v in &self.values {
            hasher.update(v.to_le_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Write the flat row-major values to a memory-mapped file.
    pub fn persist_to_memmap(&self, path: &Path) -> std::io::Result<()> {
        let byte_len = self.values.len() * std::mem::size_of::<f64>();
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(byte_len as u64)?;
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        for (chunk, value) in mmap.chunks_mut(8).zip(&self.values) {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        mmap.flush()?;
        Ok(())
    }

    /// Load previously-persisted values back from a memmap file.
    pub fn load_from_memmap(
        path: &Path,
        s0: f64,
        n_paths: usize,
        n_steps: usize,
        seed: u64,
        bankruptcies: Vec<BankruptcyEvent>,
    ) -> std::io::Result<Self> {
        let file = std::fs::File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        let values: Vec<f64> = mmap
            .chunks(8)
            .map(|c| f64::from_le_bytes(c.try_into().expect("8-byte chunk")))
            .collect();
        Ok(Self {
            s0,
            n_paths,
            n_steps,
            seed,
            storage: StorageTag::Memmap,
            values,
            bankruptcies,
        })
    }

    /// Write the flat values to a gzip-compressed container (the
    /// `persistent=true` tier for footprints at or above the memmap
    /// threshold; section 4.2 rule 3).
    pub fn persist_compressed(&self, path: &Path) -> std::io::Result<()> {
        let file = std::fs::File::create(path)?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        for value in &self.values {
            encoder.write_all(&value.to_le_bytes())?;
        }
        encoder.finish()?;
        Ok(())
    }

    pub fn load_compressed(
        path: &Path,
        s0: f64,
        n_paths: usize,
        n_steps: usize,
        seed: u64,
        bankruptcies: Vec<BankruptcyEvent>,
    ) -> std::io::Result<Self> {
        let file = std::fs::File::open(path)?;
        let mut decoder = GzDecoder::new(file);
        let mut buf = Vec::new();
        decoder.read_to_end(&mut buf)?;
        let values: Vec<f64> = buf
            .chunks(8)
            .map(|c| f64::from_le_bytes(c.try_into().expect("8-byte chunk")))
            .collect();
        Ok(Self {
            s0,
            n_paths,
            n_steps,
            seed,
            storage: StorageTag::Npz,
            values,
            bankruptcies,
        })
    }
}

/// Reconstruct bankruptcy events from values alone, for a `PricePaths`
/// loaded from a byte-for-byte persisted artifact that carries no
/// bankruptcy sidecar: a path is bankrupt from the first step its value is
/// exactly zero while the previous step was nonzero, the same
/// forced-to-zero invariant `generate_row` enforces going forward.
pub fn infer_bankruptcies(n_paths: usize, n_steps: usize, values: &[f64]) -> Vec<BankruptcyEvent> {
    let width = n_steps + 1;
    let mut out = Vec::new();
    for p in 0..n_paths {
        let row = &values[p * width..(p + 1) * width];
        for step in 1..width {
            if row[step] == 0.0 && row[step - 1] != 0.0 {
                out.push(BankruptcyEvent { path: p, step });
                break;
            }
        }
    }
    out
}

fn choose_storage(
    footprint_bytes: u64,
    available_ram_bytes: u64,
    mem_threshold_fraction: f64,
    thresholds: &Thresholds,
    persistent: bool,
) -> Result<StorageTag, ResourceLimitError> {
    let budget = (available_ram_bytes as f64 * mem_threshold_fraction) as u64;
    let memory_cutoff = (budget as f64 * thresholds.ram_fraction_memory) as u64;
    let memmap_cutoff = (budget as f64 * thresholds.ram_fraction_memmap) as u64;

    if footprint_bytes < memory_cutoff {
        Ok(StorageTag::Memory)
    } else if footprint_bytes < memmap_cutoff {
        Ok(StorageTag::Memmap)
    } else if persistent {
        Ok(StorageTag::Npz)
    } else {
        Err(ResourceLimitError::Memory {
            footprint_bytes,
            limit_bytes: memmap_cutoff,
        })
    }
}

/// One row's log-return path, cumulative-summed, exponentiated, and scaled
/// by `s0`, with the overflow/bankruptcy policy applied in place.
fn generate_row(
    distribution: &ReturnDistribution,
    n_steps: usize,
    row_seed: u64,
    s0: f64,
    path_index: usize,
) -> Result<(Vec<f64>, Option<usize>), NumericError> {
    let log_returns = distribution.sample(n_steps, row_seed);
    let mut row = Vec::with_capacity(n_steps + 1);
    row.push(s0);
    let mut cumsum = 0.0;
    let mut bankrupt_step = None;

    for (i, r) in log_returns.iter().enumerate() {
        if bankrupt_step.is_some() {
            row.push(0.0);
            continue;
        }
        if !r.is_finite() {
            return Err(NumericError::Overflow {
                path: path_index,
                step: i + 1,
            });
        }
        cumsum += r;
        let mut value = s0 * cumsum.exp();
        if !value.is_finite() {
            return Err(NumericError::Overflow {
                path: path_index,
                step: i + 1,
            });
        }
        if value > OVERFLOW_CEILING || value <= 0.0 {
            bankrupt_step = Some(i + 1);
            value = 0.0;
        }
        row.push(value);
    }

    Ok((row, bankrupt_step))
}

fn io_err(field: &str, path: &Path, e: std::io::Error) -> EngineError {
    EngineError::Config(ConfigError::InvalidValue(Violation {
        field: field.to_string(),
        value: path.display().to_string(),
        constraint: "must be writable".into(),
        remediation: format!("check directory permissions: {e}"),
    }))
}

/// Either the caller-supplied persist location, or a process-scratch file
/// under the system temp directory that's removed once the generated
/// matrix has been read back into memory. The `bool` is `true` when the
/// path is scratch (caller didn't ask for persistence).
fn resolve_persist_path(persist_path: Option<&Path>, suffix: &str) -> (PathBuf, bool) {
    match persist_path {
        Some(p) => (p.to_path_buf(), false),
        None => (
            std::env::temp_dir().join(format!("qse-paths-{}.{suffix}.bin", Uuid::new_v4())),
            true,
        ),
    }
}

/// Row count whose flat-array footprint stays under `working_set_cutoff_bytes`
/// — the chunked Memmap/Npz generators never hold more than this many rows
/// in memory at once, bounding the working set to the same budget that
/// would have put the whole matrix in the Memory tier (section 4.2's
/// chunked-generation requirement).
fn chunk_row_count(n_paths: usize, width: usize, working_set_cutoff_bytes: u64) -> usize {
    let row_bytes = (width as u64) * 8;
    let rows = (working_set_cutoff_bytes / row_bytes.max(1)).max(1);
    (rows as usize).clamp(1, n_paths.max(1))
}

type ChunkRow = (usize, Vec<f64>, Option<usize>);

fn generate_chunk(
    distribution: &ReturnDistribution,
    n_steps: usize,
    paths_seed: u64,
    s0: f64,
    start: usize,
    end: usize,
) -> Result<Vec<ChunkRow>, NumericError> {
    (start..end)
        .into_par_iter()
        .map(|p| {
            let row_seed = derive_seed(paths_seed, &format!("path-{p}"));
            generate_row(distribution, n_steps, row_seed, s0, p).map(|(row, b)| (p, row, b))
        })
        .collect::<Result<Vec<_>, NumericError>>()
}

fn generate_in_memory(
    distribution: &ReturnDistribution,
    n_paths: usize,
    n_steps: usize,
    paths_seed: u64,
    s0: f64,
) -> Result<(Vec<f64>, Vec<BankruptcyEvent>), NumericError> {
    let rows = generate_chunk(distribution, n_steps, paths_seed, s0, 0, n_paths)?;

    let width = n_steps + 1;
    let mut values = vec![0.0; n_paths * width];
    let mut bankruptcies = Vec::new();
    for (p, row, bankrupt_step) in rows {
        values[p * width..(p + 1) * width].copy_from_slice(&row);
        if let Some(step) = bankrupt_step {
            bankruptcies.push(BankruptcyEvent { path: p, step });
        }
    }
    Ok((values, bankruptcies))
}

/// Chunked generation straight to a memory-mapped file: only one
/// `chunk_row_count`-sized batch of rows is ever held in RAM while writing,
/// then the whole file is mapped back in to populate `values` (the final
/// in-RAM footprint is the one already budgeted for by the Memmap tier's
/// cutoff, section 4.2 rule 2).
fn generate_chunked_to_memmap(
    path: &Path,
    distribution: &ReturnDistribution,
    n_paths: usize,
    n_steps: usize,
    paths_seed: u64,
    s0: f64,
    working_set_cutoff_bytes: u64,
) -> Result<(Vec<f64>, Vec<BankruptcyEvent>), EngineError> {
    let width = n_steps + 1;
    let byte_len = (n_paths * width * 8) as u64;
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|e| io_err("paths_file", path, e))?;
    file.set_len(byte_len).map_err(|e| io_err("paths_file", path, e))?;
    let mut mmap = unsafe { MmapMut::map_mut(&file).map_err(|e| io_err("paths_file", path, e))? };

    let chunk_rows = chunk_row_count(n_paths, width, working_set_cutoff_bytes);
    let mut bankruptcies = Vec::new();
    let mut start = 0;
    while start < n_paths {
        let end = (start + chunk_rows).min(n_paths);
        let chunk = generate_chunk(distribution, n_steps, paths_seed, s0, start, end)
            .map_err(EngineError::Numeric)?;
        for (p, row, bankrupt_step) in chunk {
            let byte_start = p * width * 8;
            for (i, value) in row.iter().enumerate() {
                let offset = byte_start + i * 8;
                mmap[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
            }
            if let Some(step) = bankrupt_step {
                bankruptcies.push(BankruptcyEvent { path: p, step });
            }
        }
        start = end;
    }
    mmap.flush().map_err(|e| io_err("paths_file", path, e))?;
    drop(mmap);

    let readback = std::fs::File::open(path).map_err(|e| io_err("paths_file", path, e))?;
    let reload = unsafe { Mmap::map(&readback).map_err(|e| io_err("paths_file", path, e))? };
    let values: Vec<f64> = reload
        .chunks(8)
        .map(|c| f64::from_le_bytes(c.try_into().expect("8-byte chunk")))
        .collect();
    drop(reload);

    Ok((values, bankruptcies))
}

/// Chunked generation streamed straight into a gzip container: rows are
/// produced in ascending order, chunk by chunk, so the compressed stream
/// never needs random access. Mirrors [`generate_chunked_to_memmap`]'s
/// working-set bound for the `Npz` tier (section 4.2 rule 3).
fn generate_chunked_to_compressed(
    path: &Path,
    distribution: &ReturnDistribution,
    n_paths: usize,
    n_steps: usize,
    paths_seed: u64,
    s0: f64,
    working_set_cutoff_bytes: u64,
) -> Result<(Vec<f64>, Vec<BankruptcyEvent>), EngineError> {
    let width = n_steps + 1;
    let file = std::fs::File::create(path).map_err(|e| io_err("paths_file", path, e))?;
    let mut encoder = GzEncoder::new(file, Compression::default());

    let chunk_rows = chunk_row_count(n_paths, width, working_set_cutoff_bytes);
    let mut bankruptcies = Vec::new();
    let mut start = 0;
    while start < n_paths {
        let end = (start + chunk_rows).min(n_paths);
        let chunk = generate_chunk(distribution, n_steps, paths_seed, s0, start, end)
            .map_err(EngineError::Numeric)?;
        for (p, row, bankrupt_step) in chunk {
            for value in &row {
                encoder
                    .write_all(&value.to_le_bytes())
                    .map_err(|e| io_err("paths_file", path, e))?;
            }
            if let Some(step) = bankrupt_step {
                bankruptcies.push(BankruptcyEvent { path: p, step });
            }
        }
        start = end;
    }
    encoder.finish().map_err(|e| io_err("paths_file", path, e))?;

    let readback = std::fs::File::open(path).map_err(|e| io_err("paths_file", path, e))?;
    let mut decoder = GzDecoder::new(readback);
    let mut buf = Vec::new();
    decoder
        .read_to_end(&mut buf)
        .map_err(|e| io_err("paths_file", path, e))?;
    let values: Vec<f64> = buf
        .chunks(8)
        .map(|c| f64::from_le_bytes(c.try_into().expect("8-byte chunk")))
        .collect();

    Ok((values, bankruptcies))
}

/// Generate `n_paths` independent price paths of `n_steps` steps from
/// `distribution`, applying the storage policy and bankruptcy gates of
/// section 4.2. `mem_threshold_fraction` is `RunConfig.resource_limits.mem_threshold`.
///
/// `persist_path` names where the Memmap/Npz tiers should write their
/// on-disk artifact; `None` uses a scratch file under the system temp
/// directory that's deleted once the matrix is read back in. The Memory
/// tier never touches disk regardless of `persist_path`. Whichever tier is
/// chosen, only a working set bounded by the Memory tier's own cutoff is
/// ever held in RAM while rows are produced — a Memmap/Npz-tier run spills
/// to disk chunk by chunk instead of collecting the whole matrix at once.
#[allow(clippy::too_many_arguments)]
pub fn generate(
    s0: f64,
    distribution: &ReturnDistribution,
    n_paths: usize,
    n_steps: usize,
    seed: u64,
    thresholds: &Thresholds,
    mem_threshold_fraction: f64,
    persistent: bool,
    persist_path: Option<&Path>,
) -> Result<(PricePaths, PathGenerationReport), EngineError> {
    let paths_seed = derive_seed(seed, "paths");
    let width = n_steps + 1;

    let footprint_bytes =
        ((n_paths as u64) * (width as u64) * 8) as f64 * thresholds.footprint_overhead;
    let footprint_bytes = footprint_bytes as u64;

    let mut sys = System::new_all();
    sys.refresh_memory();
    let available_ram_bytes = sys.available_memory();

    let storage = choose_storage(
        footprint_bytes,
        available_ram_bytes,
        mem_threshold_fraction,
        thresholds,
        persistent,
    )?;

    let budget = (available_ram_bytes as f64 * mem_threshold_fraction) as u64;
    let working_set_cutoff_bytes =
        ((budget as f64 * thresholds.ram_fraction_memory) as u64).max(width as u64 * 8);

    let (values, bankruptcies) = match storage {
        StorageTag::Memory => {
            generate_in_memory(distribution, n_paths, n_steps, paths_seed, s0).map_err(EngineError::Numeric)?
        }
        StorageTag::Memmap => {
            let (path, scratch) = resolve_persist_path(persist_path, "memmap");
            let outcome = generate_chunked_to_memmap(
                &path,
                distribution,
                n_paths,
                n_steps,
                paths_seed,
                s0,
                working_set_cutoff_bytes,
            );
            if scratch {
                let _ = std::fs::remove_file(&path);
            }
            outcome?
        }
        StorageTag::Npz => {
            let (path, scratch) = resolve_persist_path(persist_path, "npz");
            let outcome = generate_chunked_to_compressed(
                &path,
                distribution,
                n_paths,
                n_steps,
                paths_seed,
                s0,
                working_set_cutoff_bytes,
            );
            if scratch {
                let _ = std::fs::remove_file(&path);
            }
            outcome?
        }
    };

    let bankruptcy_rate = bankruptcies.len() as f64 / n_paths as f64;
    if bankruptcy_rate > thresholds.bankruptcy_fail_rate {
        return Err(EngineError::Numeric(NumericError::Bankruptcy {
            rate: bankruptcy_rate,
            bankrupt: bankruptcies.len(),
            total: n_paths,
        }));
    }
    let warn = bankruptcy_rate > thresholds.bankruptcy_warn_rate;

    let report = PathGenerationReport {
        bankruptcy_rate,
        bankruptcies: bankruptcies.clone(),
        warn,
    };

    Ok((
        PricePaths {
            s0,
            n_paths,
            n_steps,
            seed,
            storage,
            values,
            bankruptcies,
        },
        report,
    ))
}
