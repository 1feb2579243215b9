//! Reproducibility Envelope (C9): deterministic seed derivation, dataset
//! fingerprints, environment capture, and the atomically-written
//! `RunMetadata` record.

pub mod environment;
pub mod fingerprint;
pub mod metadata;
pub mod seed;

pub use environment::Environment;
pub use fingerprint::DataFingerprint;
pub use metadata::{ArtifactPaths, CompletionStatus, RunMetadata};
