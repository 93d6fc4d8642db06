//! Pairdrive Core - Domain types and ports
//!
//! This crate contains the shared vocabulary of the sync engine:
//! - Identifiers, replica sides and node types
//! - Exit codes and causes carried through every pipeline stage
//! - Filesystem operations and operation sets
//! - Replica snapshots
//! - Conflict naming rules
//! - Port definitions (virtual-file capability, local filesystem)
//! - Configuration

pub mod config;
pub mod domain;
pub mod ports;
