//! Pairdrive Engine - The synchronization pipeline
//!
//! One supervisor per sync root drives the pass through its stages:
//!
//! 1. Two-sided change detection (observers + frozen snapshots + op computer)
//! 2. Update-tree construction
//! 3. Platform-consistency checking
//! 4. Conflict detection and resolution
//! 5. Operation generation and sorting
//! 6. Execution against both replicas with database commits
//!
//! Stages communicate through pass-scoped structures owned by the supervisor;
//! the sync database is the only durable state.

pub mod blacklist;
pub mod compute_ops;
pub mod conflict;
pub mod conflict_finder;
pub mod conflict_resolver;
pub mod executor;
pub mod filesystem;
pub mod observer;
pub mod op;
pub mod op_generator;
pub mod op_sorter;
pub mod platform;
pub mod progress;
pub mod supervisor;
pub mod tree;
pub mod tree_builder;

pub use supervisor::{PassOutcome, Supervisor, SyncState};
