//! Virtual-file placeholder capability
//!
//! The executor and observers use placeholders as an opaque capability set;
//! implementations are platform-specific and live outside the engine. The
//! [`VfsOff`] variant returns trivial success for every operation and is used
//! for non-virtual syncs.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::NodeId;

/// User-visible placeholder policy attached to a path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinState {
    AlwaysLocal,
    OnlineOnly,
    Inherited,
}

/// Placeholder status of a path
#[derive(Debug, Clone, Copy, Default)]
pub struct VfsStatus {
    pub is_placeholder: bool,
    pub is_hydrated: bool,
    pub is_syncing: bool,
    pub progress: u8,
}

/// Metadata handed to placeholder operations
#[derive(Debug, Clone)]
pub struct ItemMetadata {
    pub remote_id: NodeId,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// Placeholder capability set
#[async_trait]
pub trait Vfs: Send + Sync {
    /// Creates a dehydrated placeholder at `relative_path`.
    async fn create_placeholder(&self, relative_path: &Path, item: &ItemMetadata)
        -> anyhow::Result<()>;

    /// Converts an existing regular file into a placeholder.
    ///
    /// Returns `true` when the platform requires a sync restart to finish the
    /// conversion.
    async fn convert_to_placeholder(&self, path: &Path, item: &ItemMetadata)
        -> anyhow::Result<bool>;

    /// Drops the local bytes of a hydrated placeholder.
    async fn dehydrate(&self, path: &Path) -> anyhow::Result<()>;

    async fn is_dehydrated(&self, path: &Path) -> anyhow::Result<bool>;

    async fn status(&self, path: &Path) -> anyhow::Result<VfsStatus>;

    async fn set_pin_state(&self, relative_path: &Path, state: PinState) -> anyhow::Result<()>;

    async fn pin_state(&self, relative_path: &Path) -> anyhow::Result<PinState>;

    /// Forces the platform-visible status of a path (spinner, progress).
    async fn force_status(
        &self,
        path: &Path,
        syncing: bool,
        progress: u8,
        hydrated: bool,
    ) -> anyhow::Result<()>;

    async fn update_metadata(&self, path: &Path, item: &ItemMetadata) -> anyhow::Result<()>;
}

/// No-op implementation used when virtual files are disabled
#[derive(Debug, Default, Clone, Copy)]
pub struct VfsOff;

#[async_trait]
impl Vfs for VfsOff {
    async fn create_placeholder(
        &self,
        _relative_path: &Path,
        _item: &ItemMetadata,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn convert_to_placeholder(
        &self,
        _path: &Path,
        _item: &ItemMetadata,
    ) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn dehydrate(&self, _path: &Path) -> anyhow::Result<()> {
        Ok(())
    }

    async fn is_dehydrated(&self, _path: &Path) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn status(&self, _path: &Path) -> anyhow::Result<VfsStatus> {
        Ok(VfsStatus {
            is_placeholder: false,
            is_hydrated: true,
            is_syncing: false,
            progress: 100,
        })
    }

    async fn set_pin_state(&self, _relative_path: &Path, _state: PinState) -> anyhow::Result<()> {
        Ok(())
    }

    async fn pin_state(&self, _relative_path: &Path) -> anyhow::Result<PinState> {
        Ok(PinState::AlwaysLocal)
    }

    async fn force_status(
        &self,
        _path: &Path,
        _syncing: bool,
        _progress: u8,
        _hydrated: bool,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn update_metadata(&self, _path: &Path, _item: &ItemMetadata) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_vfs_off_is_trivially_successful() {
        let vfs = VfsOff;
        let item = ItemMetadata {
            remote_id: NodeId::new("r1"),
            size: 10,
            created_at: Utc::now(),
            modified_at: Utc::now(),
        };

        vfs.create_placeholder(Path::new("a/b.txt"), &item)
            .await
            .unwrap();
        assert!(!vfs
            .convert_to_placeholder(Path::new("a/b.txt"), &item)
            .await
            .unwrap());
        assert!(!vfs.is_dehydrated(Path::new("a/b.txt")).await.unwrap());

        let status = vfs.status(Path::new("a/b.txt")).await.unwrap();
        assert!(status.is_hydrated);
        assert!(!status.is_placeholder);
    }
}
