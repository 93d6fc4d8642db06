//! Executor
//!
//! Consumes the sorted operation list, applies each operation to its target
//! replica through the job layer, the local filesystem and the placeholder
//! capability, and commits the database after every success. Operations run
//! strictly in order; a failed operation aborts the remainder and the
//! supervisor restarts the pass — there is no rollback, the database is
//! authoritative and the next pass converges.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pairdrive_core::domain::{
    DbNodeId, ExitCause, ExitCode, FsOpType, NodeId, ReplicaSide, StepError, StepResult,
};
use pairdrive_core::ports::{ItemMetadata, LocalFs, Vfs};
use pairdrive_jobs::{
    backoff_delay, classify, grants_extra_attempt, ErrorClass, JobOutcome, JobPayload, JobPool,
    JobPriority, JobSpec, SessionState, UploadSession,
};
use pairdrive_store::{NewNode, SyncDb};

use crate::op::{SyncOperation, SyncOperationList};
use crate::supervisor::PauseGate;

/// Why the executor stopped before the end of the list
#[derive(Debug)]
pub struct ExecutionFailure {
    pub error: StepError,
    /// Node to charge with the failure, for temporary blacklisting.
    pub node: Option<(ReplicaSide, NodeId)>,
}

/// Outcome of one execution run
#[derive(Debug, Default)]
pub struct ExecutionReport {
    pub completed: usize,
    pub aborted: bool,
    pub failure: Option<ExecutionFailure>,
}

/// Applies sorted operations to both replicas
pub struct Executor {
    jobs: Arc<JobPool>,
    vfs: Arc<dyn Vfs>,
    local_fs: Arc<dyn LocalFs>,
    local_root: PathBuf,
    move_to_trash: bool,
    virtual_files: bool,
    session_threshold: u64,
    chunk_size: u64,
    max_attempts: u32,
}

impl Executor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        jobs: Arc<JobPool>,
        vfs: Arc<dyn Vfs>,
        local_fs: Arc<dyn LocalFs>,
        local_root: PathBuf,
        move_to_trash: bool,
        virtual_files: bool,
        session_threshold: u64,
        chunk_size: u64,
        max_attempts: u32,
    ) -> Self {
        Self {
            jobs,
            vfs,
            local_fs,
            local_root,
            move_to_trash,
            virtual_files,
            session_threshold,
            chunk_size: chunk_size.max(1),
            max_attempts: max_attempts.max(1),
        }
    }

    pub async fn execute(
        &self,
        list: &SyncOperationList,
        db: &SyncDb,
        cancel: &CancellationToken,
        pause: &PauseGate,
        progress: &crate::progress::ProgressInfo,
    ) -> ExecutionReport {
        progress.begin_pass(list.len());
        let mut report = ExecutionReport::default();

        for op in list.iter() {
            if cancel.is_cancelled() {
                info!("Execution aborted, pass discarded");
                report.aborted = true;
                return report;
            }
            pause.wait_if_paused().await;

            debug!(
                id = op.id,
                kind = op.kind.as_str(),
                target = %op.target_side,
                omit = op.omit,
                dest = %op.dest_path.display(),
                "Applying operation"
            );

            match self.apply(op, db, cancel).await {
                Ok(()) => {
                    report.completed += 1;
                    progress.op_done();
                    if !op.omit && matches!(op.kind, FsOpType::Create | FsOpType::Edit) {
                        progress.add_bytes(op.size);
                    }
                }
                Err(error) => {
                    if error.code == ExitCode::OperationCanceled {
                        report.aborted = true;
                        return report;
                    }
                    warn!(
                        id = op.id,
                        kind = op.kind.as_str(),
                        error = %error,
                        "Operation failed, aborting the pass"
                    );
                    report.failure = Some(ExecutionFailure {
                        error,
                        node: blame(op),
                    });
                    return report;
                }
            }
        }

        info!(completed = report.completed, "Operation list executed");
        report
    }

    async fn apply(
        &self,
        op: &SyncOperation,
        db: &SyncDb,
        cancel: &CancellationToken,
    ) -> StepResult<()> {
        if op.omit {
            return self.commit_db(op, db, None, None).await;
        }

        match (op.target_side, op.kind) {
            (ReplicaSide::Remote, FsOpType::Create) => self.remote_create(op, db, cancel).await,
            (ReplicaSide::Remote, FsOpType::Edit) => self.remote_edit(op, db, cancel).await,
            (ReplicaSide::Remote, FsOpType::Move) => self.remote_move(op, db, cancel).await,
            (ReplicaSide::Remote, FsOpType::Delete) => self.remote_delete(op, db, cancel).await,
            (ReplicaSide::Local, FsOpType::Create) => self.local_create(op, db, cancel).await,
            (ReplicaSide::Local, FsOpType::Edit) => self.local_edit(op, db, cancel).await,
            (ReplicaSide::Local, FsOpType::Move) => self.local_move(op, db).await,
            (ReplicaSide::Local, FsOpType::Delete) => self.local_delete(op, db).await,
        }
    }

    // ------------------------------------------------------------------
    // Remote-side operations
    // ------------------------------------------------------------------

    async fn remote_create(
        &self,
        op: &SyncOperation,
        db: &SyncDb,
        cancel: &CancellationToken,
    ) -> StepResult<()> {
        let parent_id = self.remote_parent_id(op, db).await?;
        let name = leaf_name(&op.dest_path)?;

        let item_id = if op.node_type == pairdrive_core::domain::NodeType::Directory {
            let outcome = self
                .run_job(
                    || JobSpec::CreateDir {
                        parent_id: parent_id.clone(),
                        name: name.to_string(),
                    },
                    cancel,
                )
                .await;
            let item = expect_item(outcome, "create remote directory")?;
            item.id
        } else {
            let item = self.upload(op, &parent_id, name, cancel).await?;
            item.id
        };

        self.commit_db(op, db, Some(NodeId::new(item_id)), None).await
    }

    async fn remote_edit(
        &self,
        op: &SyncOperation,
        db: &SyncDb,
        cancel: &CancellationToken,
    ) -> StepResult<()> {
        let parent_id = self.remote_parent_id(op, db).await?;
        let name = leaf_name(&op.dest_path)?;
        let item = self.upload(op, &parent_id, name, cancel).await?;
        self.commit_db(op, db, Some(NodeId::new(item.id)), None).await
    }

    async fn remote_move(
        &self,
        op: &SyncOperation,
        db: &SyncDb,
        cancel: &CancellationToken,
    ) -> StepResult<()> {
        let remote_id = op
            .target_id
            .clone()
            .ok_or_else(|| StepError::data(ExitCause::Unknown, "remote move without an id"))?;
        let new_name = leaf_name(&op.dest_path)?.to_string();

        let same_parent = op.origin_path.as_deref().and_then(Path::parent)
            == op.dest_path.parent();
        let outcome = if same_parent {
            self.run_job(
                || JobSpec::Rename {
                    remote_id: remote_id.clone(),
                    new_name: new_name.clone(),
                },
                cancel,
            )
            .await
        } else {
            let new_parent_id = self.remote_parent_id(op, db).await?;
            self.run_job(
                || JobSpec::Move {
                    remote_id: remote_id.clone(),
                    new_parent_id: new_parent_id.clone(),
                    new_name: new_name.clone(),
                },
                cancel,
            )
            .await
        };
        if !outcome.is_ok() {
            return Err(outcome_error(outcome, "remote move"));
        }
        self.commit_db(op, db, None, None).await
    }

    async fn remote_delete(
        &self,
        op: &SyncOperation,
        db: &SyncDb,
        cancel: &CancellationToken,
    ) -> StepResult<()> {
        let remote_id = op
            .target_id
            .clone()
            .ok_or_else(|| StepError::data(ExitCause::Unknown, "remote delete without an id"))?;
        let outcome = self
            .run_job(
                || JobSpec::Delete {
                    remote_id: remote_id.clone(),
                },
                cancel,
            )
            .await;
        // already gone is as good as deleted
        if !outcome.is_ok() && outcome.cause != ExitCause::NotFound {
            return Err(outcome_error(outcome, "remote delete"));
        }
        self.commit_db(op, db, None, None).await
    }

    /// Simple upload below the threshold, chunked session above it.
    async fn upload(
        &self,
        op: &SyncOperation,
        parent_id: &NodeId,
        name: &str,
        cancel: &CancellationToken,
    ) -> StepResult<pairdrive_jobs::RemoteItem> {
        let local_path = self.local_root.join(&op.source_path);

        if op.size <= self.session_threshold {
            let outcome = self
                .run_job(
                    || JobSpec::Upload {
                        parent_id: parent_id.clone(),
                        name: name.to_string(),
                        local_path: local_path.clone(),
                        size: op.size,
                    },
                    cancel,
                )
                .await;
            return expect_item(outcome, "upload");
        }

        self.upload_session(op, parent_id, name, &local_path, cancel)
            .await
    }

    /// Drives the chunked upload state machine; a failure after the start
    /// cancels the session on the server.
    async fn upload_session(
        &self,
        op: &SyncOperation,
        parent_id: &NodeId,
        name: &str,
        local_path: &Path,
        cancel: &CancellationToken,
    ) -> StepResult<pairdrive_jobs::RemoteItem> {
        let mut session =
            UploadSession::new(parent_id.clone(), name, op.size, self.chunk_size);

        let start_spec = session
            .start_spec()
            .map_err(|e| StepError::data(ExitCause::Unknown, e.to_string()))?;
        let outcome = self.run_job(|| start_spec.clone(), cancel).await;
        let session_url = match outcome.payload {
            JobPayload::SessionUrl(ref url) if outcome.is_ok() => url.clone(),
            _ => return Err(outcome_error(outcome, "upload session start")),
        };
        session
            .mark_started(session_url)
            .map_err(|e| StepError::data(ExitCause::Unknown, e.to_string()))?;

        let mut file = tokio::fs::File::open(local_path).await.map_err(|e| {
            StepError::system(
                ExitCause::FileAccessError,
                format!("cannot open {}: {e}", local_path.display()),
            )
        })?;

        while let Some((offset, len)) = session.next_chunk_range() {
            if cancel.is_cancelled() {
                self.cancel_session(&mut session, cancel).await;
                return Err(StepError::canceled());
            }

            let mut buffer = vec![0u8; len as usize];
            let read_result = async {
                file.seek(std::io::SeekFrom::Start(offset)).await?;
                file.read_exact(&mut buffer).await
            }
            .await;
            if let Err(e) = read_result {
                self.cancel_session(&mut session, cancel).await;
                return Err(StepError::system(
                    ExitCause::FileAccessError,
                    format!("cannot read chunk at {offset}: {e}"),
                ));
            }

            let chunk_spec = session
                .chunk_spec(buffer)
                .map_err(|e| StepError::data(ExitCause::Unknown, e.to_string()))?;
            let outcome = self.run_job(|| chunk_spec.clone(), cancel).await;
            if !outcome.is_ok() {
                self.cancel_session(&mut session, cancel).await;
                return Err(outcome_error(outcome, "upload session chunk"));
            }
            session
                .mark_chunk_done(len)
                .map_err(|e| StepError::data(ExitCause::Unknown, e.to_string()))?;
        }

        let finish_spec = session
            .finish_spec()
            .map_err(|e| StepError::data(ExitCause::Unknown, e.to_string()))?;
        let outcome = self.run_job(|| finish_spec.clone(), cancel).await;
        let item = expect_item(outcome, "upload session finish")?;
        session
            .mark_finished(item.clone())
            .map_err(|e| StepError::data(ExitCause::Unknown, e.to_string()))?;
        debug_assert!(matches!(session.state(), SessionState::Finished(_)));
        Ok(item)
    }

    async fn cancel_session(&self, session: &mut UploadSession, cancel: &CancellationToken) {
        if let Some(cancel_spec) = session.cancel_spec() {
            let outcome = self.run_single_job(cancel_spec, cancel).await;
            if !outcome.is_ok() {
                warn!("Upload session cancel was not acknowledged");
            }
        }
        session.mark_cancelled();
    }

    // ------------------------------------------------------------------
    // Local-side operations
    // ------------------------------------------------------------------

    async fn local_create(
        &self,
        op: &SyncOperation,
        db: &SyncDb,
        cancel: &CancellationToken,
    ) -> StepResult<()> {
        let abs_dest = self.local_root.join(&op.dest_path);

        if op.node_type == pairdrive_core::domain::NodeType::Directory {
            self.local_fs
                .create_dir(&abs_dest)
                .await
                .map_err(|e| StepError::system(ExitCause::FileAccessError, e.to_string()))?;
            let local_id = self.local_fs.node_id(&abs_dest).await.ok().flatten();
            return self.commit_db(op, db, local_id, None).await;
        }

        if self.virtual_files {
            let metadata = item_metadata(op)?;
            self.vfs
                .create_placeholder(&op.dest_path, &metadata)
                .await
                .map_err(|e| StepError::system(ExitCause::FileAccessError, e.to_string()))?;
            let local_id = self.local_fs.node_id(&abs_dest).await.ok().flatten();
            return self.commit_db(op, db, local_id, None).await;
        }

        let hash = self.download_into(op, &abs_dest, cancel).await?;
        let local_id = self.local_fs.node_id(&abs_dest).await.ok().flatten();
        self.commit_db(op, db, local_id, Some(hash)).await
    }

    async fn local_edit(
        &self,
        op: &SyncOperation,
        db: &SyncDb,
        cancel: &CancellationToken,
    ) -> StepResult<()> {
        let abs_dest = self.local_root.join(&op.dest_path);

        if self.virtual_files {
            let dehydrated = self
                .vfs
                .is_dehydrated(&abs_dest)
                .await
                .unwrap_or(false);
            if dehydrated {
                // content stays remote; only the placeholder metadata moves
                let metadata = item_metadata(op)?;
                self.vfs
                    .update_metadata(&abs_dest, &metadata)
                    .await
                    .map_err(|e| StepError::system(ExitCause::FileAccessError, e.to_string()))?;
                return self.commit_db(op, db, None, None).await;
            }
        }

        let hash = self.download_into(op, &abs_dest, cancel).await?;
        self.commit_db(op, db, None, Some(hash)).await
    }

    async fn local_move(&self, op: &SyncOperation, db: &SyncDb) -> StepResult<()> {
        let origin = op
            .origin_path
            .as_ref()
            .ok_or_else(|| StepError::data(ExitCause::Unknown, "local move without origin"))?;
        let from = self.local_root.join(origin);
        let to = self.local_root.join(&op.dest_path);

        self.local_fs
            .rename(&from, &to)
            .await
            .map_err(|e| StepError::system(ExitCause::FileAccessError, e.to_string()))?;

        self.commit_db(op, db, None, None).await
    }

    async fn local_delete(&self, op: &SyncOperation, db: &SyncDb) -> StepResult<()> {
        let abs = self.local_root.join(&op.dest_path);

        if self.local_fs.exists(&abs).await {
            let dehydrated = self.vfs.is_dehydrated(&abs).await.unwrap_or(false);
            if dehydrated || !self.move_to_trash {
                // dehydrated placeholders hold no user bytes
                self.local_fs
                    .delete(&abs)
                    .await
                    .map_err(|e| StepError::system(ExitCause::FileAccessError, e.to_string()))?;
            } else if let Err(e) = self.local_fs.move_to_trash(&abs).await {
                warn!(path = %abs.display(), error = %e, "Trash failed, deleting outright");
                self.local_fs
                    .delete(&abs)
                    .await
                    .map_err(|e| StepError::system(ExitCause::FileAccessError, e.to_string()))?;
            }
        }

        self.commit_db(op, db, None, None).await
    }

    /// Downloads to a temp file, verifies size and hash, promotes atomically.
    async fn download_into(
        &self,
        op: &SyncOperation,
        abs_dest: &Path,
        cancel: &CancellationToken,
    ) -> StepResult<String> {
        let remote_id = op
            .source_id
            .clone()
            .ok_or_else(|| StepError::data(ExitCause::Unknown, "download without a remote id"))?;
        let temp = self
            .local_fs
            .temp_download_path(abs_dest)
            .await
            .map_err(|e| StepError::system(ExitCause::FileAccessError, e.to_string()))?;

        let outcome = self
            .run_job(
                || JobSpec::Download {
                    remote_id: remote_id.clone(),
                    to: temp.clone(),
                },
                cancel,
            )
            .await;
        let (size, hash) = match outcome.payload {
            JobPayload::Downloaded { size, ref hash, .. } if outcome.is_ok() => {
                (size, hash.clone())
            }
            _ => {
                self.local_fs.delete(&temp).await.ok();
                return Err(outcome_error(outcome, "download"));
            }
        };

        if size != op.size
            || op
                .content_hash
                .as_deref()
                .map(|expected| expected != hash)
                .unwrap_or(false)
        {
            self.local_fs.delete(&temp).await.ok();
            return Err(StepError::need_restart(format!(
                "downloaded content for {} does not match the snapshot",
                op.dest_path.display()
            )));
        }

        self.local_fs
            .promote_temp(&temp, abs_dest)
            .await
            .map_err(|e| StepError::system(ExitCause::FileAccessError, e.to_string()))?;
        if let Some(modified_at) = op.modified_at {
            self.local_fs.set_modified(abs_dest, modified_at).await.ok();
        }
        Ok(hash)
    }

    // ------------------------------------------------------------------
    // Database commit
    // ------------------------------------------------------------------

    /// Applies the operation's database effect inside one transaction.
    async fn commit_db(
        &self,
        op: &SyncOperation,
        db: &SyncDb,
        created_target_id: Option<NodeId>,
        verified_hash: Option<String>,
    ) -> StepResult<()> {
        let mut tx = db.begin().await.map_err(db_error)?;

        match op.kind {
            FsOpType::Create => {
                let parent_path = op.dest_path.parent().map(Path::to_path_buf).unwrap_or_default();
                let parent_row = db
                    .node_by_path(&parent_path)
                    .await
                    .map_err(db_error)?
                    .map(|r| r.db_id)
                    .unwrap_or(db.root_db_id());
                let target_id = created_target_id.or_else(|| op.target_id.clone());
                let (local_id, remote_id) = match op.target_side {
                    ReplicaSide::Remote => (op.source_id.clone(), target_id),
                    ReplicaSide::Local => (target_id, op.source_id.clone()),
                };

                let mut node = NewNode::new(parent_row, row_name(op)?, op.node_type)
                    .with_ids(local_id, remote_id)
                    .with_size(op.size);
                node.created_at = op.created_at.or_else(|| Some(Utc::now()));
                node.local_modified_at = op.modified_at;
                node.remote_modified_at = op.modified_at;
                node.content_hash = verified_hash.or_else(|| op.content_hash.clone());
                SyncDb::insert_node_in(&mut *tx, &node).await.map_err(db_error)?;
            }
            FsOpType::Edit => {
                let db_id = require_db_id(op)?;
                SyncDb::update_content_in(
                    &mut *tx,
                    db_id,
                    op.size,
                    verified_hash.as_deref().or(op.content_hash.as_deref()),
                    op.modified_at,
                    op.modified_at,
                )
                .await
                .map_err(db_error)?;
                // content-replace collapse: the side's id may have changed
                if let Some(ref source_id) = op.source_id {
                    SyncDb::update_node_id_in(
                        &mut *tx,
                        db_id,
                        op.target_side.opposite(),
                        source_id,
                    )
                    .await
                    .map_err(db_error)?;
                }
            }
            FsOpType::Move => {
                if op
                    .conflict
                    .map(|kind| kind.renames_local_aside())
                    .unwrap_or(false)
                {
                    // the renamed-aside copy must be re-detected as new; a
                    // fresh create has no row to drop
                    if let Some(db_id) = op.db_id {
                        SyncDb::delete_node_in(&mut *tx, db_id).await.map_err(db_error)?;
                    }
                } else {
                    let db_id = require_db_id(op)?;
                    let parent_path =
                        op.dest_path.parent().map(Path::to_path_buf).unwrap_or_default();
                    let parent_row = db
                        .node_by_path(&parent_path)
                        .await
                        .map_err(db_error)?
                        .map(|r| r.db_id)
                        .unwrap_or(db.root_db_id());
                    SyncDb::update_parent_and_name_in(&mut *tx, db_id, parent_row, &row_name(op)?)
                        .await
                        .map_err(db_error)?;
                }
            }
            FsOpType::Delete => {
                let db_id = require_db_id(op)?;
                SyncDb::delete_node_in(&mut *tx, db_id).await.map_err(db_error)?;
            }
        }

        tx.commit().await.map_err(db_error)?;
        Ok(())
    }

    async fn remote_parent_id(&self, op: &SyncOperation, db: &SyncDb) -> StepResult<NodeId> {
        let parent_path = op.dest_path.parent().map(Path::to_path_buf).unwrap_or_default();
        if parent_path.as_os_str().is_empty() {
            let root = db
                .node_by_db_id(db.root_db_id())
                .await
                .map_err(db_error)?
                .ok_or_else(|| StepError::data(ExitCause::Unknown, "root row missing"))?;
            return root
                .remote_id
                .ok_or_else(|| StepError::data(ExitCause::Unknown, "root has no remote id"));
        }
        let row = db
            .node_by_path(&parent_path)
            .await
            .map_err(db_error)?
            .ok_or_else(|| {
                StepError::data(
                    ExitCause::Unknown,
                    format!("no row for parent {}", parent_path.display()),
                )
            })?;
        row.remote_id.ok_or_else(|| {
            StepError::data(
                ExitCause::Unknown,
                format!("parent {} has no remote id yet", parent_path.display()),
            )
        })
    }

    // ------------------------------------------------------------------
    // Retry
    // ------------------------------------------------------------------

    /// Runs a job with per-operation retry. Retryable failures back off and
    /// try again; a refreshed token or an explicit throttle grants an extra
    /// attempt on top of the configured budget.
    async fn run_job<F>(&self, make_spec: F, cancel: &CancellationToken) -> JobOutcome
    where
        F: Fn() -> JobSpec,
    {
        let mut attempt = 0u32;
        let mut budget = self.max_attempts;
        loop {
            let outcome = self.run_single_job(make_spec(), cancel).await;
            match classify(outcome.code, outcome.cause) {
                ErrorClass::Retryable if attempt + 1 < budget => {
                    if grants_extra_attempt(outcome.code) {
                        // bounded: a permanently throttled endpoint must
                        // still exhaust eventually
                        budget = (budget + 1).min(self.max_attempts * 2);
                    }
                    let delay = outcome.retry_after.unwrap_or_else(|| backoff_delay(attempt));
                    debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        code = ?outcome.code,
                        "Transient failure, backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            return JobOutcome::failed(
                                ExitCode::OperationCanceled,
                                ExitCause::Unknown,
                            )
                        }
                    }
                    attempt += 1;
                }
                _ => return outcome,
            }
        }
    }

    async fn run_single_job(&self, spec: JobSpec, cancel: &CancellationToken) -> JobOutcome {
        let handle = self.jobs.submit(spec, JobPriority::Normal);
        let aborter = handle.abort_handle();
        tokio::select! {
            outcome = handle.outcome() => outcome,
            _ = cancel.cancelled() => {
                aborter.cancel();
                JobOutcome::failed(ExitCode::OperationCanceled, ExitCause::Unknown)
            }
        }
    }
}

fn row_name(op: &SyncOperation) -> StepResult<String> {
    if let Some(ref name) = op.db_name {
        return Ok(name.clone());
    }
    leaf_name(&op.dest_path).map(str::to_string)
}

fn leaf_name(path: &Path) -> StepResult<&str> {
    path.file_name().and_then(|n| n.to_str()).ok_or_else(|| {
        StepError::data(
            ExitCause::Unknown,
            format!("operation path has no file name: {}", path.display()),
        )
    })
}

fn require_db_id(op: &SyncOperation) -> StepResult<DbNodeId> {
    op.db_id
        .ok_or_else(|| StepError::data(ExitCause::Unknown, "operation lacks a database id"))
}

fn item_metadata(op: &SyncOperation) -> StepResult<ItemMetadata> {
    let remote_id = op
        .source_id
        .clone()
        .ok_or_else(|| StepError::data(ExitCause::Unknown, "placeholder without a remote id"))?;
    let now: DateTime<Utc> = Utc::now();
    Ok(ItemMetadata {
        remote_id,
        size: op.size,
        created_at: op.created_at.unwrap_or(now),
        modified_at: op.modified_at.unwrap_or(now),
    })
}

fn expect_item(outcome: JobOutcome, what: &str) -> StepResult<pairdrive_jobs::RemoteItem> {
    if outcome.is_ok() {
        if let JobPayload::Item(ref item) = outcome.payload {
            return Ok(item.clone());
        }
    }
    Err(outcome_error(outcome, what))
}

fn outcome_error(outcome: JobOutcome, what: &str) -> StepError {
    let code = if outcome.code == ExitCode::Ok {
        ExitCode::BackError
    } else {
        outcome.code
    };
    StepError::new(code, outcome.cause, format!("{what} failed"))
}

fn db_error(e: impl std::fmt::Display) -> StepError {
    StepError::new(ExitCode::SystemError, ExitCause::Unknown, e.to_string())
}

/// Which node to charge when an operation fails.
fn blame(op: &SyncOperation) -> Option<(ReplicaSide, NodeId)> {
    if let Some(ref id) = op.source_id {
        return Some((op.target_side.opposite(), id.clone()));
    }
    op.target_id
        .clone()
        .map(|id| (op.target_side, id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use sha2::{Digest, Sha256};
    use tempfile::TempDir;

    use pairdrive_core::domain::NodeType;
    use pairdrive_core::ports::VfsOff;
    use pairdrive_jobs::{FileListPage, JobRunner, RemoteItem};
    use pairdrive_store::DbPool;

    use crate::filesystem::StdLocalFs;
    use crate::conflict::ConflictKind;

    /// Scripted runner: canned outcomes per job label, sensible defaults
    /// otherwise, full call log.
    struct MockRunner {
        log: Mutex<Vec<String>>,
        scripted: Mutex<HashMap<&'static str, VecDeque<JobOutcome>>>,
        download_body: Vec<u8>,
    }

    impl MockRunner {
        fn new() -> Self {
            Self {
                log: Mutex::new(Vec::new()),
                scripted: Mutex::new(HashMap::new()),
                download_body: b"data".to_vec(),
            }
        }

        fn with_download_body(body: &[u8]) -> Self {
            Self {
                download_body: body.to_vec(),
                ..Self::new()
            }
        }

        fn script(&self, label: &'static str, outcome: JobOutcome) {
            self.scripted
                .lock()
                .unwrap()
                .entry(label)
                .or_default()
                .push_back(outcome);
        }

        fn calls(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        fn item(id: &str) -> RemoteItem {
            serde_json::from_value(serde_json::json!({ "id": id, "name": "n" })).unwrap()
        }
    }

    #[async_trait]
    impl JobRunner for MockRunner {
        async fn run(&self, spec: JobSpec, _cancel: &CancellationToken) -> JobOutcome {
            self.log.lock().unwrap().push(spec.label().to_string());

            if let Some(outcome) = self
                .scripted
                .lock()
                .unwrap()
                .get_mut(spec.label())
                .and_then(VecDeque::pop_front)
            {
                return outcome;
            }

            match spec {
                JobSpec::CreateDir { .. }
                | JobSpec::Upload { .. }
                | JobSpec::UploadSessionFinish { .. }
                | JobSpec::Move { .. }
                | JobSpec::Rename { .. }
                | JobSpec::GetFileInfo { .. } => {
                    JobOutcome::ok(JobPayload::Item(Self::item("new-remote")))
                }
                JobSpec::UploadSessionStart { .. } => {
                    JobOutcome::ok(JobPayload::SessionUrl("mock://session".to_string()))
                }
                JobSpec::UploadSessionChunk { .. }
                | JobSpec::UploadSessionCancel { .. }
                | JobSpec::Delete { .. } => JobOutcome::ok(JobPayload::None),
                JobSpec::Download { to, .. } => {
                    std::fs::write(&to, &self.download_body).unwrap();
                    let mut hasher = Sha256::new();
                    hasher.update(&self.download_body);
                    JobOutcome::ok(JobPayload::Downloaded {
                        path: to,
                        size: self.download_body.len() as u64,
                        hash: format!("{:x}", hasher.finalize()),
                    })
                }
                JobSpec::GetFileList { .. } => JobOutcome::ok(JobPayload::List(FileListPage {
                    items: Vec::new(),
                    cursor: None,
                    has_more: false,
                })),
                JobSpec::LongPoll { .. } => JobOutcome::ok(JobPayload::Changed(false)),
            }
        }
    }

    struct Rig {
        runner: Arc<MockRunner>,
        executor: Executor,
        db: SyncDb,
        root: TempDir,
    }

    async fn rig_with(runner: MockRunner, session_threshold: u64, move_to_trash: bool) -> Rig {
        let root = TempDir::new().unwrap();
        let runner = Arc::new(runner);
        let pool = JobPool::new(runner.clone(), 4);
        let executor = Executor::new(
            pool,
            Arc::new(VfsOff),
            Arc::new(StdLocalFs::new(root.path())),
            root.path().to_path_buf(),
            move_to_trash,
            false,
            session_threshold,
            10,
            3,
        );
        let db_pool = DbPool::in_memory().await.unwrap();
        let db = SyncDb::open(&db_pool, &NodeId::new("lroot"), &NodeId::new("rroot"))
            .await
            .unwrap();
        Rig {
            runner,
            executor,
            db,
            root,
        }
    }

    async fn run_ops(rig: &Rig, ops: Vec<SyncOperation>) -> ExecutionReport {
        let mut list = SyncOperationList::new();
        for op in ops {
            list.push(op);
        }
        rig.executor
            .execute(
                &list,
                &rig.db,
                &CancellationToken::new(),
                &PauseGate::new(),
                &crate::progress::ProgressInfo::new(),
            )
            .await
    }

    fn rate_limited() -> JobOutcome {
        JobOutcome::failed(ExitCode::RateLimited, ExitCause::ApiErr)
            .with_retry_after(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_chunked_upload_retries_throttled_chunk() {
        let runner = MockRunner::new();
        // chunk 1 ok, chunk 2 throttled once, then everything succeeds
        runner.script("upload_session_chunk", JobOutcome::ok(JobPayload::None));
        runner.script("upload_session_chunk", rate_limited());

        let rig = rig_with(runner, 10, true).await;
        // 25-byte file, 10-byte chunks: 3 chunks
        tokio::fs::write(rig.root.path().join("big.bin"), vec![7u8; 25])
            .await
            .unwrap();

        let mut op = SyncOperation::new(FsOpType::Create, ReplicaSide::Remote, NodeType::File);
        op.source_id = Some(NodeId::new("l-big"));
        op.source_path = "big.bin".into();
        op.dest_path = "big.bin".into();
        op.size = 25;

        let report = run_ops(&rig, vec![op]).await;
        assert!(report.failure.is_none(), "{:?}", report.failure);
        assert_eq!(report.completed, 1);

        let calls = rig.runner.calls();
        let chunks = calls.iter().filter(|c| *c == "upload_session_chunk").count();
        assert_eq!(chunks, 4, "three chunks plus one retry: {calls:?}");
        assert!(calls.contains(&"upload_session_start".to_string()));
        assert!(calls.contains(&"upload_session_finish".to_string()));
        assert!(!calls.contains(&"upload_session_cancel".to_string()));

        // the row landed with both identifiers
        let row = rig
            .db
            .node_by_id(ReplicaSide::Local, &NodeId::new("l-big"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.remote_id, Some(NodeId::new("new-remote")));
    }

    #[tokio::test]
    async fn test_chunked_upload_exhaustion_cancels_session() {
        let runner = MockRunner::new();
        for _ in 0..8 {
            runner.script("upload_session_chunk", rate_limited());
        }

        let rig = rig_with(runner, 10, true).await;
        tokio::fs::write(rig.root.path().join("big.bin"), vec![7u8; 25])
            .await
            .unwrap();

        let mut op = SyncOperation::new(FsOpType::Create, ReplicaSide::Remote, NodeType::File);
        op.source_id = Some(NodeId::new("l-big"));
        op.source_path = "big.bin".into();
        op.dest_path = "big.bin".into();
        op.size = 25;

        let report = run_ops(&rig, vec![op]).await;
        let failure = report.failure.expect("upload should fail");
        assert_eq!(failure.error.code, ExitCode::RateLimited);

        let calls = rig.runner.calls();
        assert!(calls.contains(&"upload_session_cancel".to_string()), "{calls:?}");
    }

    #[tokio::test]
    async fn test_omitted_op_is_db_only() {
        let rig = rig_with(MockRunner::new(), 1 << 20, true).await;
        let f_db = rig
            .db
            .insert_node(
                &NewNode::new(rig.db.root_db_id(), "f.txt", NodeType::File)
                    .with_ids(Some(NodeId::new("lf")), Some(NodeId::new("rf"))),
            )
            .await
            .unwrap();

        let mut op = SyncOperation::new(FsOpType::Edit, ReplicaSide::Remote, NodeType::File);
        op.omit = true;
        op.db_id = Some(f_db);
        op.source_id = Some(NodeId::new("lf"));
        op.size = 77;
        op.content_hash = Some("h-new".to_string());
        op.modified_at = Some(Utc::now());
        op.dest_path = "f.txt".into();

        let report = run_ops(&rig, vec![op]).await;
        assert!(report.failure.is_none());
        // no network traffic, no local filesystem change
        assert!(rig.runner.calls().is_empty());

        let row = rig.db.node_by_db_id(f_db).await.unwrap().unwrap();
        assert_eq!(row.size, 77);
        assert_eq!(row.content_hash.as_deref(), Some("h-new"));
    }

    #[tokio::test]
    async fn test_download_verifies_and_promotes() {
        let body = b"remote-bytes";
        let mut hasher = Sha256::new();
        hasher.update(body);
        let hash = format!("{:x}", hasher.finalize());

        let rig = rig_with(MockRunner::with_download_body(body), 1 << 20, true).await;

        let mut op = SyncOperation::new(FsOpType::Create, ReplicaSide::Local, NodeType::File);
        op.source_id = Some(NodeId::new("r-new"));
        op.source_path = "doc.txt".into();
        op.dest_path = "doc.txt".into();
        op.size = body.len() as u64;
        op.content_hash = Some(hash);

        let report = run_ops(&rig, vec![op]).await;
        assert!(report.failure.is_none(), "{:?}", report.failure);

        let final_path = rig.root.path().join("doc.txt");
        assert_eq!(tokio::fs::read(&final_path).await.unwrap(), body);

        let row = rig
            .db
            .node_by_id(ReplicaSide::Remote, &NodeId::new("r-new"))
            .await
            .unwrap()
            .unwrap();
        // the local identifier was captured after the promote
        assert!(row.local_id.is_some());
    }

    #[tokio::test]
    async fn test_download_size_mismatch_restarts() {
        let rig = rig_with(MockRunner::with_download_body(b"short"), 1 << 20, true).await;

        let mut op = SyncOperation::new(FsOpType::Create, ReplicaSide::Local, NodeType::File);
        op.source_id = Some(NodeId::new("r-new"));
        op.source_path = "doc.txt".into();
        op.dest_path = "doc.txt".into();
        op.size = 999;

        let report = run_ops(&rig, vec![op]).await;
        let failure = report.failure.expect("mismatch should fail the op");
        assert_eq!(failure.error.code, ExitCode::NeedRestart);
        assert!(!rig.root.path().join("doc.txt").exists());
    }

    #[tokio::test]
    async fn test_rename_aside_drops_row() {
        let rig = rig_with(MockRunner::new(), 1 << 20, true).await;
        let f_db = rig
            .db
            .insert_node(
                &NewNode::new(rig.db.root_db_id(), "f.txt", NodeType::File)
                    .with_ids(Some(NodeId::new("lf")), Some(NodeId::new("rf"))),
            )
            .await
            .unwrap();
        tokio::fs::write(rig.root.path().join("f.txt"), b"mine")
            .await
            .unwrap();

        let mut op = SyncOperation::new(FsOpType::Move, ReplicaSide::Local, NodeType::File);
        op.db_id = Some(f_db);
        op.target_id = Some(NodeId::new("lf"));
        op.origin_path = Some("f.txt".into());
        op.dest_path = "f (conflicting copy).txt".into();
        op.conflict = Some(ConflictKind::EditEdit);

        let report = run_ops(&rig, vec![op]).await;
        assert!(report.failure.is_none());

        assert!(!rig.root.path().join("f.txt").exists());
        assert!(rig.root.path().join("f (conflicting copy).txt").exists());
        // next pass re-detects both versions from scratch
        assert!(rig.db.node_by_db_id(f_db).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_local_delete_goes_to_trash() {
        let rig = rig_with(MockRunner::new(), 1 << 20, true).await;
        let f_db = rig
            .db
            .insert_node(
                &NewNode::new(rig.db.root_db_id(), "old.txt", NodeType::File)
                    .with_ids(Some(NodeId::new("lf")), Some(NodeId::new("rf"))),
            )
            .await
            .unwrap();
        tokio::fs::write(rig.root.path().join("old.txt"), b"bytes")
            .await
            .unwrap();

        let mut op = SyncOperation::new(FsOpType::Delete, ReplicaSide::Local, NodeType::File);
        op.db_id = Some(f_db);
        op.target_id = Some(NodeId::new("lf"));
        op.dest_path = "old.txt".into();

        let report = run_ops(&rig, vec![op]).await;
        assert!(report.failure.is_none());
        assert!(!rig.root.path().join("old.txt").exists());
        assert!(rig.root.path().join(".pairdrive-trash").exists());
        assert!(rig.db.node_by_db_id(f_db).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remote_delete_tolerates_not_found() {
        let runner = MockRunner::new();
        runner.script(
            "delete",
            JobOutcome::failed(ExitCode::BackError, ExitCause::NotFound),
        );
        let rig = rig_with(runner, 1 << 20, true).await;
        let f_db = rig
            .db
            .insert_node(
                &NewNode::new(rig.db.root_db_id(), "gone.txt", NodeType::File)
                    .with_ids(Some(NodeId::new("lf")), Some(NodeId::new("rf"))),
            )
            .await
            .unwrap();

        let mut op = SyncOperation::new(FsOpType::Delete, ReplicaSide::Remote, NodeType::File);
        op.db_id = Some(f_db);
        op.target_id = Some(NodeId::new("rf"));
        op.dest_path = "gone.txt".into();

        let report = run_ops(&rig, vec![op]).await;
        assert!(report.failure.is_none());
        assert!(rig.db.node_by_db_id(f_db).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failure_aborts_remaining_ops() {
        let runner = MockRunner::new();
        runner.script(
            "create_dir",
            JobOutcome::failed(ExitCode::BackError, ExitCause::QuotaExceeded),
        );
        let rig = rig_with(runner, 1 << 20, true).await;

        let mut first = SyncOperation::new(FsOpType::Create, ReplicaSide::Remote, NodeType::Directory);
        first.source_id = Some(NodeId::new("l-dir"));
        first.source_path = "Dir".into();
        first.dest_path = "Dir".into();

        let mut second = SyncOperation::new(FsOpType::Create, ReplicaSide::Remote, NodeType::Directory);
        second.source_id = Some(NodeId::new("l-dir2"));
        second.source_path = "Dir2".into();
        second.dest_path = "Dir2".into();

        let report = run_ops(&rig, vec![first, second]).await;
        assert_eq!(report.completed, 0);
        let failure = report.failure.unwrap();
        assert_eq!(failure.error.cause, ExitCause::QuotaExceeded);
        assert_eq!(
            failure.node,
            Some((ReplicaSide::Local, NodeId::new("l-dir")))
        );
        // the second operation never ran
        assert_eq!(
            rig.runner
                .calls()
                .iter()
                .filter(|c| *c == "create_dir")
                .count(),
            1
        );
    }
}
