//! Deterministic seed derivation (design note: "Deterministic seed
//! derivation"). Every child stream — per-config in a grid, per-path-chunk
//! in memmap generation, per-episode in bootstrap — derives its seed from
//! `(parent_seed, stable_name)` via this fixed hash, never from a
//! process-local counter, so results are invariant to worker count and
//! chunk size.

use sha2::{Digest, Sha256};

/// `seed_i = hash(parent_seed, stable_name)`, truncated to a `u64`.
pub fn derive_seed(parent_seed: u64, stable_name: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(parent_seed.to_le_bytes());
    hasher.update(stable_name.as_bytes());
    let digest = hasher.finalize();
    u64::from_le_bytes(digest[0..8].try_into().expect("digest has at least 8 bytes"))
}
