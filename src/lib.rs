//! Terrane: reconciliation engine for declarative cloud topologies.
//!
//! Declared resources become a dependency graph, the graph and recorded
//! state become a minimal change set, and the change set becomes a batched
//! plan executed concurrently against a pluggable provider.

pub mod cli;
pub mod core;
pub mod provider;
pub mod tripwire;
