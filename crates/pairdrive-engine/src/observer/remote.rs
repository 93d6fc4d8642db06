//! Remote filesystem observer
//!
//! Maintains the live remote snapshot from the drive change feed: a paged
//! full listing at startup, then long-polls gated on the listing cursor. The
//! cursor is persisted in the sync database so a process restart resumes the
//! feed instead of re-listing the world.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pairdrive_core::domain::{
    ExitCause, NodeId, NodeType, SnapshotItem, StepError, StepResult,
};
use pairdrive_jobs::{JobPayload, JobPool, JobPriority, JobSpec, RemoteItem};
use pairdrive_store::SyncDb;

use super::SharedSnapshot;

/// Key of the persisted feed cursor in the meta table.
const CURSOR_META_KEY: &str = "remote_listing_cursor";

/// Observer of the remote replica
pub struct RemoteObserver {
    jobs: Arc<JobPool>,
    snapshot: SharedSnapshot,
    root_id: NodeId,
    cursor: Option<String>,
}

impl RemoteObserver {
    pub fn new(jobs: Arc<JobPool>, snapshot: SharedSnapshot, root_id: NodeId) -> Self {
        Self {
            jobs,
            snapshot,
            root_id,
            cursor: None,
        }
    }

    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    /// Builds the snapshot from the feed, resuming from the persisted cursor
    /// when one exists.
    pub async fn bootstrap(&mut self, db: &SyncDb) -> StepResult<()> {
        self.cursor = db
            .meta(CURSOR_META_KEY)
            .await
            .map_err(|e| StepError::data(ExitCause::Unknown, e.to_string()))?;

        if self.cursor.is_none() {
            self.snapshot.update(|snapshot| snapshot.clear());
        }

        self.pull_pages(db).await?;
        self.snapshot.update(|snapshot| snapshot.restore_validity());
        info!(
            entries = self.snapshot.freeze().len(),
            "Remote snapshot built"
        );
        Ok(())
    }

    /// Drains every pending page of the feed and persists the new cursor.
    pub async fn pull_pages(&mut self, db: &SyncDb) -> StepResult<()> {
        loop {
            let outcome = self
                .jobs
                .run(
                    JobSpec::GetFileList {
                        cursor: self.cursor.clone(),
                    },
                    JobPriority::High,
                )
                .await;
            if !outcome.is_ok() {
                return Err(StepError::new(
                    outcome.code,
                    outcome.cause,
                    "change feed page failed",
                ));
            }
            let JobPayload::List(page) = outcome.payload else {
                return Err(StepError::data(
                    ExitCause::ApiErr,
                    "change feed returned no list",
                ));
            };

            debug!(items = page.items.len(), has_more = page.has_more, "Feed page");
            for item in &page.items {
                self.apply_item(item);
            }
            if let Some(cursor) = page.cursor {
                db.set_meta(CURSOR_META_KEY, &cursor)
                    .await
                    .map_err(|e| StepError::data(ExitCause::Unknown, e.to_string()))?;
                self.cursor = Some(cursor);
            }
            if !page.has_more {
                return Ok(());
            }
        }
    }

    /// One long-poll cycle: waits for feed activity, then pulls the pages.
    ///
    /// Returns `true` when the snapshot changed.
    pub async fn poll_once(&mut self, db: &SyncDb) -> StepResult<bool> {
        let Some(cursor) = self.cursor.clone() else {
            // no cursor yet means bootstrap has not run
            self.bootstrap(db).await?;
            return Ok(true);
        };

        let outcome = self
            .jobs
            .run(JobSpec::LongPoll { cursor }, JobPriority::Low)
            .await;
        if !outcome.is_ok() {
            return Err(StepError::new(
                outcome.code,
                outcome.cause,
                "long poll failed",
            ));
        }
        match outcome.payload {
            JobPayload::Changed(true) => {
                self.pull_pages(db).await?;
                Ok(true)
            }
            JobPayload::Changed(false) => Ok(false),
            _ => Err(StepError::data(
                ExitCause::ApiErr,
                "long poll returned no change flag",
            )),
        }
    }

    /// Folds one feed entry into the live snapshot.
    fn apply_item(&self, item: &RemoteItem) {
        let node_id = NodeId::new(item.id.clone());
        if node_id == self.root_id {
            return;
        }

        if item.is_deleted {
            self.snapshot.update(|snapshot| snapshot.remove(&node_id));
            return;
        }

        let parent_id = item
            .parent_id
            .as_deref()
            .map(NodeId::new)
            .unwrap_or_else(|| self.root_id.clone());
        let node_type = if item.is_directory {
            NodeType::Directory
        } else {
            NodeType::File
        };

        let mut entry = SnapshotItem::new(node_id, parent_id, &item.name, node_type)
            .with_size(item.size.unwrap_or(0));
        if let Some(modified) = item.modified {
            entry = entry.with_times(item.created.unwrap_or(modified), modified);
        }
        if let Some(ref hash) = item.hash {
            entry = entry.with_hash(hash.clone());
        }
        entry.can_write = item.can_write.unwrap_or(true);

        self.snapshot.update(|snapshot| snapshot.upsert(entry));
    }

    /// Long-poll loop for the idle periods between passes.
    pub fn spawn_poll_loop(
        mut self,
        db: Arc<SyncDb>,
        cancel: CancellationToken,
        changed_tx: tokio::sync::mpsc::Sender<()>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = self.poll_once(&db) => match result {
                        Ok(true) => {
                            let _ = changed_tx.send(()).await;
                        }
                        Ok(false) => {}
                        Err(err) => {
                            warn!(error = %err, "Remote poll failed, backing off");
                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                _ = tokio::time::sleep(Duration::from_secs(10)) => {}
                            }
                        }
                    },
                }
            }
            debug!("Remote observer loop stopped");
        })
    }
}
