//! Local filesystem capability
//!
//! The executor applies local-side operations through this port so tests can
//! substitute it and so trash/rename semantics stay in one place.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::NodeId;

/// Local filesystem operations used by the executor and observers
#[async_trait]
pub trait LocalFs: Send + Sync {
    async fn create_dir(&self, path: &Path) -> anyhow::Result<()>;

    /// Stable identifier of the object at `path` (device+inode derived).
    async fn node_id(&self, path: &Path) -> anyhow::Result<Option<NodeId>>;

    /// Renames `from` to `to`, falling back to copy+delete across devices.
    async fn rename(&self, from: &Path, to: &Path) -> anyhow::Result<()>;

    /// Removes a file or directory tree outright.
    async fn delete(&self, path: &Path) -> anyhow::Result<()>;

    /// Moves a file or directory tree to the trash.
    async fn move_to_trash(&self, path: &Path) -> anyhow::Result<()>;

    /// Returns a fresh temporary download target near `final_path` so the
    /// final rename stays on one filesystem.
    async fn temp_download_path(&self, final_path: &Path) -> anyhow::Result<PathBuf>;

    /// Atomically replaces `to` with `from` (same filesystem).
    async fn promote_temp(&self, from: &Path, to: &Path) -> anyhow::Result<()>;

    async fn exists(&self, path: &Path) -> bool;

    async fn file_size(&self, path: &Path) -> anyhow::Result<u64>;

    /// Hex-encoded SHA-256 of the file content.
    async fn content_hash(&self, path: &Path) -> anyhow::Result<String>;

    /// Sets the modification time on a path.
    async fn set_modified(&self, path: &Path, modified_at: DateTime<Utc>) -> anyhow::Result<()>;

    /// Free bytes available on the filesystem holding `path`.
    async fn free_space(&self, path: &Path) -> anyhow::Result<u64>;
}
