//! Pairdrive Jobs - Network job layer
//!
//! The executor talks to the remote replica exclusively through [`JobSpec`]
//! values handed to a [`JobRunner`]. Every job reports a `(ExitCode,
//! ExitCause)` pair; the classification module decides which failures retry.
//!
//! Provides:
//! - The job sum type and typed payloads
//! - An HTTP implementation over a drive-style REST API
//! - The chunked upload session as an explicit state machine
//! - A bounded worker pool with priorities and abort handles
//! - Process-wide request-duration telemetry for timeout detection

pub mod classify;
pub mod client;
pub mod pool;
pub mod runner;
pub mod session;
pub mod spec;
pub mod timeout;

pub use classify::{backoff_delay, classify, grants_extra_attempt, ErrorClass};
pub use client::DriveClient;
pub use pool::{JobHandle, JobPool, JobPriority};
pub use runner::{HttpJobRunner, JobRunner};
pub use session::{SessionState, UploadSession};
pub use spec::{FileListPage, JobOutcome, JobPayload, JobSpec, RemoteItem};
