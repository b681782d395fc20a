//! Tripwire: run event log, BLAKE3 checksums, drift detection.

pub mod drift;
pub mod eventlog;
pub mod hasher;
