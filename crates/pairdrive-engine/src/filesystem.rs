//! Local filesystem adapter
//!
//! Tokio-based implementation of the [`LocalFs`] port. Renames fall back to
//! copy+delete across devices, deletions can go through a trash directory
//! next to the sync root, and downloads land in hidden temp files that are
//! atomically promoted into place.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use pairdrive_core::domain::ExitCause;
use pairdrive_core::ports::LocalFs;

/// Name of the trash directory kept beside the synchronized tree.
const TRASH_DIR: &str = ".pairdrive-trash";

/// Standard-filesystem implementation of the local port
pub struct StdLocalFs {
    root: PathBuf,
}

impl StdLocalFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn trash_dir(&self) -> PathBuf {
        self.root.join(TRASH_DIR)
    }
}

/// Identifier scheme shared by the executor and the local observer.
pub fn node_id_for(metadata: &std::fs::Metadata) -> pairdrive_core::domain::NodeId {
    use std::os::unix::fs::MetadataExt;
    pairdrive_core::domain::NodeId::new(format!("{}-{}", metadata.dev(), metadata.ino()))
}

#[async_trait]
impl LocalFs for StdLocalFs {
    async fn create_dir(&self, path: &Path) -> Result<()> {
        tokio::fs::create_dir_all(path)
            .await
            .with_context(|| format!("Failed to create directory {}", path.display()))
    }

    async fn node_id(&self, path: &Path) -> Result<Option<pairdrive_core::domain::NodeId>> {
        match tokio::fs::metadata(path).await {
            Ok(metadata) => Ok(Some(node_id_for(&metadata))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => {
                Err(err).with_context(|| format!("Failed to stat {}", path.display()))
            }
        }
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        match tokio::fs::rename(from, to).await {
            Ok(()) => Ok(()),
            Err(err) if err.raw_os_error() == Some(libc::EXDEV) => {
                debug!(from = %from.display(), to = %to.display(), "Cross-device rename, copying");
                copy_recursive(from, to).await?;
                remove_any(from).await?;
                Ok(())
            }
            Err(err) => Err(err).with_context(|| {
                format!("Failed to rename {} to {}", from.display(), to.display())
            }),
        }
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        remove_any(path).await
    }

    async fn move_to_trash(&self, path: &Path) -> Result<()> {
        let trash = self.trash_dir();
        tokio::fs::create_dir_all(&trash).await.with_context(|| {
            format!("{:?}: cannot prepare trash directory", ExitCause::MoveToTrashFailed)
        })?;

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "item".to_string());
        let stamp = Utc::now().format("%Y%m%d-%H%M%S%.3f");
        let target = trash.join(format!("{name}.{stamp}"));

        match tokio::fs::rename(path, &target).await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Trash move failed");
                Err(err).with_context(|| format!("{:?}", ExitCause::MoveToTrashFailed))
            }
        }
    }

    async fn temp_download_path(&self, final_path: &Path) -> Result<PathBuf> {
        let parent = final_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        tokio::fs::create_dir_all(&parent).await.ok();
        let name = final_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "download".to_string());
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        Ok(parent.join(format!(".{name}.pairdrive-part-{nanos}")))
    }

    async fn promote_temp(&self, from: &Path, to: &Path) -> Result<()> {
        tokio::fs::rename(from, to).await.with_context(|| {
            format!(
                "Failed to promote {} into {}",
                from.display(),
                to.display()
            )
        })
    }

    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    async fn file_size(&self, path: &Path) -> Result<u64> {
        let metadata = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("Failed to stat {}", path.display()))?;
        Ok(metadata.len())
    }

    async fn content_hash(&self, path: &Path) -> Result<String> {
        let mut file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("Failed to open {} for hashing", path.display()))?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; 64 * 1024];
        loop {
            let read = file.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
        Ok(format!("{:x}", hasher.finalize()))
    }

    async fn set_modified(&self, path: &Path, modified_at: DateTime<Utc>) -> Result<()> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let file = std::fs::File::options().write(true).open(&path)?;
            let time = std::time::UNIX_EPOCH
                + std::time::Duration::from_secs(modified_at.timestamp().max(0) as u64);
            file.set_modified(time)?;
            Ok(())
        })
        .await
        .context("set_modified task failed")?
    }

    async fn free_space(&self, path: &Path) -> Result<u64> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<u64> {
            use std::ffi::CString;
            use std::os::unix::ffi::OsStrExt;

            let c_path = CString::new(path.as_os_str().as_bytes())
                .context("path contains a NUL byte")?;
            let mut stats: libc::statvfs = unsafe { std::mem::zeroed() };
            let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stats) };
            if rc != 0 {
                anyhow::bail!("statvfs failed for {}", path.display());
            }
            Ok(stats.f_bavail as u64 * stats.f_frsize as u64)
        })
        .await
        .context("free_space task failed")?
    }
}

async fn copy_recursive(from: &Path, to: &Path) -> Result<()> {
    let metadata = tokio::fs::metadata(from).await?;
    if metadata.is_dir() {
        tokio::fs::create_dir_all(to).await?;
        let mut entries = tokio::fs::read_dir(from).await?;
        while let Some(entry) = entries.next_entry().await? {
            let target = to.join(entry.file_name());
            Box::pin(copy_recursive(&entry.path(), &target)).await?;
        }
    } else {
        tokio::fs::copy(from, to).await?;
    }
    Ok(())
}

async fn remove_any(path: &Path) -> Result<()> {
    let metadata = match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        // already gone
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => {
            return Err(err).with_context(|| format!("Failed to stat {}", path.display()))
        }
    };
    if metadata.is_dir() {
        tokio::fs::remove_dir_all(path)
            .await
            .with_context(|| format!("Failed to remove directory {}", path.display()))
    } else {
        tokio::fs::remove_file(path)
            .await
            .with_context(|| format!("Failed to remove file {}", path.display()))
    }
}
