//! Local filesystem observer
//!
//! Maintains the live local snapshot: a full scan at startup, then OS events
//! through `notify`. Inodes keep their identity across renames, so an event
//! only ever re-stats the path and updates the one entry. An event the
//! snapshot cannot reconcile invalidates it; the supervisor rescans.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use pairdrive_core::domain::{NodeId, NodeType, SnapshotItem};
use pairdrive_core::ports::LocalFs;

use super::SharedSnapshot;
use crate::filesystem::node_id_for;

/// Internal change representation, decoupled from the notify event types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    Created(PathBuf),
    Modified(PathBuf),
    Deleted(PathBuf),
    Renamed { old: PathBuf, new: PathBuf },
}

/// Observer of the local replica
pub struct LocalObserver {
    root: PathBuf,
    root_id: NodeId,
    snapshot: SharedSnapshot,
    local_fs: std::sync::Arc<dyn LocalFs>,
}

impl LocalObserver {
    pub fn new(
        root: impl Into<PathBuf>,
        root_id: NodeId,
        snapshot: SharedSnapshot,
        local_fs: std::sync::Arc<dyn LocalFs>,
    ) -> Self {
        Self {
            root: root.into(),
            root_id,
            snapshot,
            local_fs,
        }
    }

    /// Full scan of the sync root into the live snapshot.
    pub async fn initial_scan(&self) -> Result<()> {
        let mut items = Vec::new();
        self.scan_dir(&self.root, &self.root_id, &mut items).await?;

        self.snapshot.update(|snapshot| {
            snapshot.clear();
            for item in items {
                snapshot.upsert(item);
            }
            snapshot.restore_validity();
        });

        info!(
            root = %self.root.display(),
            entries = self.snapshot.freeze().len(),
            "Local snapshot built"
        );
        Ok(())
    }

    fn scan_dir<'a>(
        &'a self,
        dir: &'a Path,
        parent_id: &'a NodeId,
        items: &'a mut Vec<SnapshotItem>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let mut entries = tokio::fs::read_dir(dir)
                .await
                .with_context(|| format!("Failed to read {}", dir.display()))?;

            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().to_string();
                if is_internal_name(&name) {
                    continue;
                }
                let path = entry.path();
                let metadata = match entry.metadata().await {
                    Ok(metadata) => metadata,
                    Err(err) => {
                        warn!(path = %path.display(), error = %err, "Skipping unreadable entry");
                        continue;
                    }
                };
                if !metadata.is_dir() && !metadata.is_file() {
                    continue; // symlinks and specials stay out of the sync
                }

                let node_id = node_id_for(&metadata);
                let node_type = if metadata.is_dir() {
                    NodeType::Directory
                } else {
                    NodeType::File
                };
                let mut item = SnapshotItem::new(node_id.clone(), parent_id.clone(), &name, node_type)
                    .with_size(if metadata.is_file() { metadata.len() } else { 0 });
                if let (Ok(created), Ok(modified)) = (metadata.created(), metadata.modified()) {
                    item = item.with_times(created.into(), modified.into());
                }
                item.can_write = !metadata.permissions().readonly();
                if metadata.is_file() {
                    if let Ok(hash) = self.local_fs.content_hash(&path).await {
                        item = item.with_hash(hash);
                    }
                }
                items.push(item);

                if metadata.is_dir() {
                    self.scan_dir(&path, &node_id, items).await?;
                }
            }
            Ok(())
        })
    }

    /// Applies one change event to the live snapshot.
    pub async fn apply_event(&self, event: ChangeEvent) {
        debug!(event = ?event, "Local change");
        match event {
            ChangeEvent::Created(path) | ChangeEvent::Modified(path) => {
                self.refresh_path(&path).await;
            }
            ChangeEvent::Deleted(path) => {
                let Some(relative) = self.relative(&path) else {
                    return;
                };
                let removed = self.snapshot.update(|snapshot| {
                    match id_for_path(snapshot, &relative) {
                        Some(id) => {
                            snapshot.remove(&id);
                            true
                        }
                        None => false,
                    }
                });
                if !removed {
                    // delete for a path the snapshot never knew
                    warn!(path = %path.display(), "Unexpected delete event, snapshot invalidated");
                    self.snapshot.invalidate();
                }
            }
            ChangeEvent::Renamed { old, new } => {
                // the inode is stable: re-stat under the new path updates the
                // entry in place, then drop whatever is left at the old path
                self.refresh_path(&new).await;
                if let Some(old_relative) = self.relative(&old) {
                    self.snapshot.update(|snapshot| {
                        if let Some(new_relative) = self.relative(&new) {
                            if let (Some(old_id), Some(new_id)) = (
                                id_for_path(snapshot, &old_relative),
                                id_for_path(snapshot, &new_relative),
                            ) {
                                if old_id != new_id {
                                    snapshot.remove(&old_id);
                                }
                            }
                        }
                    });
                }
            }
        }
    }

    /// Re-stats a path and upserts its entry (children untouched).
    async fn refresh_path(&self, path: &Path) {
        let Some(relative) = self.relative(path) else {
            return;
        };
        if relative
            .file_name()
            .map(|n| is_internal_name(&n.to_string_lossy()))
            .unwrap_or(false)
        {
            return;
        }

        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata,
            // created-then-removed races are normal; the delete event follows
            Err(_) => return,
        };
        if !metadata.is_dir() && !metadata.is_file() {
            return;
        }

        let parent_relative = relative.parent().map(Path::to_path_buf).unwrap_or_default();
        let name = match relative.file_name() {
            Some(name) => name.to_string_lossy().to_string(),
            None => return,
        };

        let hash = if metadata.is_file() {
            self.local_fs.content_hash(path).await.ok()
        } else {
            None
        };

        let node_id = node_id_for(&metadata);
        let root_id = self.root_id.clone();
        let applied = self.snapshot.update(|snapshot| {
            let parent_id = if parent_relative.as_os_str().is_empty() {
                Some(root_id.clone())
            } else {
                id_for_path(snapshot, &parent_relative)
            };
            let Some(parent_id) = parent_id else {
                return false;
            };
            let node_type = if metadata.is_dir() {
                NodeType::Directory
            } else {
                NodeType::File
            };
            let mut item = SnapshotItem::new(node_id.clone(), parent_id, &name, node_type)
                .with_size(if metadata.is_file() { metadata.len() } else { 0 });
            if let (Ok(created), Ok(modified)) = (metadata.created(), metadata.modified()) {
                item = item.with_times(created.into(), modified.into());
            }
            item.can_write = !metadata.permissions().readonly();
            if let Some(hash) = hash {
                item = item.with_hash(hash);
            }
            snapshot.upsert(item);
            true
        });

        if !applied {
            // an event under a directory the snapshot has not seen
            warn!(path = %path.display(), "Event under unknown parent, snapshot invalidated");
            self.snapshot.invalidate();
        }
    }

    fn relative(&self, path: &Path) -> Option<PathBuf> {
        path.strip_prefix(&self.root).ok().map(Path::to_path_buf)
    }

    /// Starts the OS watcher and spawns the event-apply loop.
    ///
    /// The returned watcher must stay alive for events to flow.
    pub fn spawn_watcher(
        self: std::sync::Arc<Self>,
        cancel: CancellationToken,
    ) -> Result<RecommendedWatcher> {
        let (tx, mut rx) = mpsc::channel::<ChangeEvent>(1024);

        let mut watcher = RecommendedWatcher::new(
            move |result: std::result::Result<notify::Event, notify::Error>| match result {
                Ok(event) => {
                    if let Some(change) = map_notify_event(&event) {
                        if tx.blocking_send(change).is_err() {
                            warn!("Change receiver dropped");
                        }
                    }
                }
                Err(err) => error!(error = %err, "File watcher error"),
            },
            notify::Config::default(),
        )
        .context("Failed to create file watcher")?;

        watcher
            .watch(&self.root, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch {}", self.root.display()))?;

        let observer = self;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => observer.apply_event(event).await,
                        None => break,
                    },
                }
            }
            debug!("Local observer loop stopped");
        });

        Ok(watcher)
    }
}

/// Engine-internal artifacts that never enter the snapshot.
fn is_internal_name(name: &str) -> bool {
    name == ".pairdrive-trash" || name.contains(".pairdrive-part-")
}

/// Converts a raw notify event into the internal representation.
fn map_notify_event(event: &notify::Event) -> Option<ChangeEvent> {
    let first = event.paths.first()?.clone();
    match event.kind {
        EventKind::Create(_) => Some(ChangeEvent::Created(first)),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() >= 2 => {
            Some(ChangeEvent::Renamed {
                old: first,
                new: event.paths[1].clone(),
            })
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            Some(ChangeEvent::Deleted(first))
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => Some(ChangeEvent::Created(first)),
        EventKind::Modify(_) => Some(ChangeEvent::Modified(first)),
        EventKind::Remove(_) => Some(ChangeEvent::Deleted(first)),
        _ => None,
    }
}

/// Resolves a relative path to the id the snapshot knows it under.
fn id_for_path(
    snapshot: &pairdrive_core::domain::Snapshot,
    relative: &Path,
) -> Option<NodeId> {
    let mut current = snapshot.root_id().clone();
    for component in relative.components() {
        let name = component.as_os_str().to_string_lossy();
        current = snapshot.child_by_name(&current, &name)?.node_id.clone();
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pairdrive_core::domain::ReplicaSide;
    use std::sync::Arc;
    use tempfile::TempDir;

    use crate::filesystem::StdLocalFs;

    async fn observer_over(dir: &TempDir) -> (LocalObserver, SharedSnapshot) {
        let root_id = NodeId::new("local-root");
        let snapshot = SharedSnapshot::new(ReplicaSide::Local, root_id.clone());
        let observer = LocalObserver::new(
            dir.path(),
            root_id,
            snapshot.clone(),
            Arc::new(StdLocalFs::new(dir.path())),
        );
        (observer, snapshot)
    }

    #[tokio::test]
    async fn test_initial_scan_builds_tree() {
        let dir = TempDir::new().unwrap();
        tokio::fs::create_dir_all(dir.path().join("A/B")).await.unwrap();
        tokio::fs::write(dir.path().join("A/B/c.txt"), b"hello").await.unwrap();
        tokio::fs::write(dir.path().join("top.txt"), b"x").await.unwrap();

        let (observer, shared) = observer_over(&dir).await;
        observer.initial_scan().await.unwrap();

        let snapshot = shared.freeze();
        assert_eq!(snapshot.len(), 4);
        let c = snapshot
            .path(&id_for_path(&snapshot, Path::new("A/B/c.txt")).unwrap())
            .unwrap();
        assert_eq!(c, Path::new("A/B/c.txt"));

        let c_id = id_for_path(&snapshot, Path::new("A/B/c.txt")).unwrap();
        let item = snapshot.item(&c_id).unwrap();
        assert_eq!(item.size, 5);
        assert!(item.content_hash.is_some());
    }

    #[tokio::test]
    async fn test_trash_and_partials_excluded() {
        let dir = TempDir::new().unwrap();
        tokio::fs::create_dir_all(dir.path().join(".pairdrive-trash")).await.unwrap();
        tokio::fs::write(dir.path().join(".pairdrive-trash/old"), b"x")
            .await
            .unwrap();
        tokio::fs::write(dir.path().join(".f.pairdrive-part-1"), b"x")
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("real.txt"), b"x").await.unwrap();

        let (observer, shared) = observer_over(&dir).await;
        observer.initial_scan().await.unwrap();

        assert_eq!(shared.freeze().len(), 1);
    }

    #[tokio::test]
    async fn test_created_event_inserts_entry() {
        let dir = TempDir::new().unwrap();
        let (observer, shared) = observer_over(&dir).await;
        observer.initial_scan().await.unwrap();

        let path = dir.path().join("fresh.txt");
        tokio::fs::write(&path, b"new").await.unwrap();
        observer.apply_event(ChangeEvent::Created(path)).await;

        let snapshot = shared.freeze();
        assert!(id_for_path(&snapshot, Path::new("fresh.txt")).is_some());
    }

    #[tokio::test]
    async fn test_rename_keeps_identity() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("before.txt"), b"x").await.unwrap();

        let (observer, shared) = observer_over(&dir).await;
        observer.initial_scan().await.unwrap();
        let old_id = id_for_path(&shared.freeze(), Path::new("before.txt")).unwrap();

        tokio::fs::rename(dir.path().join("before.txt"), dir.path().join("after.txt"))
            .await
            .unwrap();
        observer
            .apply_event(ChangeEvent::Renamed {
                old: dir.path().join("before.txt"),
                new: dir.path().join("after.txt"),
            })
            .await;

        let snapshot = shared.freeze();
        let new_id = id_for_path(&snapshot, Path::new("after.txt")).unwrap();
        assert_eq!(old_id, new_id);
        assert!(id_for_path(&snapshot, Path::new("before.txt")).is_none());
    }

    #[tokio::test]
    async fn test_delete_event_removes_subtree() {
        let dir = TempDir::new().unwrap();
        tokio::fs::create_dir_all(dir.path().join("A")).await.unwrap();
        tokio::fs::write(dir.path().join("A/f.txt"), b"x").await.unwrap();

        let (observer, shared) = observer_over(&dir).await;
        observer.initial_scan().await.unwrap();

        tokio::fs::remove_dir_all(dir.path().join("A")).await.unwrap();
        observer
            .apply_event(ChangeEvent::Deleted(dir.path().join("A")))
            .await;

        let snapshot = shared.freeze();
        assert_eq!(snapshot.len(), 0);
    }

    #[tokio::test]
    async fn test_unknown_delete_invalidates() {
        let dir = TempDir::new().unwrap();
        let (observer, shared) = observer_over(&dir).await;
        observer.initial_scan().await.unwrap();

        observer
            .apply_event(ChangeEvent::Deleted(dir.path().join("phantom.txt")))
            .await;

        assert!(!shared.is_valid());
    }

    #[tokio::test]
    async fn test_rescan_restores_validity() {
        let dir = TempDir::new().unwrap();
        let (observer, shared) = observer_over(&dir).await;
        observer.initial_scan().await.unwrap();
        shared.invalidate();

        observer.initial_scan().await.unwrap();
        assert!(shared.is_valid());
    }
}
