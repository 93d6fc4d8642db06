//! Supervisor
//!
//! One supervisor drives the state machine of one sync root:
//!
//! ```text
//! Idle -> ChangeDetection -> TreeBuild -> Reconcile -> Execute -> CommitOrRestart
//! ```
//!
//! Any stage reporting `NeedRestart` or `DataError` aborts the remaining
//! stages and re-enters change detection with fresh snapshots; the restart
//! counter is bounded and overflowing it surfaces as
//! `DataError/InvalidSnapshot`. External pause requests are honored at stage
//! boundaries and inside the executor's loop.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pairdrive_core::config::Config;
use pairdrive_core::domain::{
    ConflictSuffix, ExitCause, ExitCode, ReplicaSide, StepError, StepResult,
};
use pairdrive_core::ports::{LocalFs, Vfs};
use pairdrive_jobs::JobPool;
use pairdrive_store::SyncDb;

use crate::blacklist::TmpBlacklist;
use crate::compute_ops::OpComputer;
use crate::conflict_finder::ConflictFinder;
use crate::conflict_resolver::ConflictResolver;
use crate::executor::Executor;
use crate::observer::SharedSnapshot;
use crate::op::SyncOperationList;
use crate::op_generator::OpGenerator;
use crate::op_sorter::OpSorter;
use crate::platform::{NamingRules, PlatformChecker};
use crate::progress::ProgressInfo;
use crate::tree_builder::TreeBuilder;

/// Cooperative pause switch shared with long-running stages
#[derive(Debug, Default)]
pub struct PauseGate {
    paused: AtomicBool,
    notify: Notify,
}

impl PauseGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Blocks while paused; wakes on resume.
    pub async fn wait_if_paused(&self) {
        while self.is_paused() {
            let notified = self.notify.notified();
            if !self.is_paused() {
                break;
            }
            notified.await;
        }
    }
}

/// Stages of one pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    ChangeDetection,
    TreeBuild,
    Reconcile,
    Execute,
    CommitOrRestart,
}

/// How a pass ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// Nothing to do; the replicas agree with the database.
    Converged,
    /// Operations were applied and committed.
    Applied { operations: usize },
    /// The pass must run again (conflict resolved, world changed, ...).
    Restarted,
    /// Cancellation was requested; the pass was discarded.
    Aborted,
}

/// Coordinator of one sync root
pub struct Supervisor {
    config: Config,
    db: Arc<SyncDb>,
    jobs: Arc<JobPool>,
    vfs: Arc<dyn Vfs>,
    local_fs: Arc<dyn LocalFs>,
    local_snapshot: SharedSnapshot,
    remote_snapshot: SharedSnapshot,
    blacklist: TmpBlacklist,
    namer: ConflictSuffix,
    checker: PlatformChecker,
    progress: Arc<ProgressInfo>,
    pause: Arc<PauseGate>,
    cancel: CancellationToken,
    state: SyncState,
    restart_count: u32,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        config: Config,
        db: Arc<SyncDb>,
        jobs: Arc<JobPool>,
        vfs: Arc<dyn Vfs>,
        local_fs: Arc<dyn LocalFs>,
        local_snapshot: SharedSnapshot,
        remote_snapshot: SharedSnapshot,
    ) -> anyhow::Result<Self> {
        let mut blacklist = TmpBlacklist::new(
            config.behavior.blacklist_after_errors,
            config.behavior.blacklist_pass_count,
        );
        blacklist.load(&db).await?;

        let namer = ConflictSuffix::new(config.sync.device_name.clone());

        Ok(Self {
            config,
            db,
            jobs,
            vfs,
            local_fs,
            local_snapshot,
            remote_snapshot,
            blacklist,
            namer,
            checker: PlatformChecker::new(NamingRules::native()),
            progress: Arc::new(ProgressInfo::new()),
            pause: Arc::new(PauseGate::new()),
            cancel: CancellationToken::new(),
            state: SyncState::Idle,
            restart_count: 0,
        })
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn pause_gate(&self) -> Arc<PauseGate> {
        self.pause.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn progress(&self) -> Arc<ProgressInfo> {
        self.progress.clone()
    }

    /// Runs passes until the root converges, surfaces an error, or is
    /// canceled. Restarts are bounded.
    pub async fn run_until_settled(&mut self) -> StepResult<PassOutcome> {
        loop {
            match self.run_pass().await {
                Ok(PassOutcome::Restarted) => continue,
                Ok(outcome) => {
                    self.state = SyncState::Idle;
                    return Ok(outcome);
                }
                Err(error) if error.wants_restart() => {
                    warn!(error = %error, "Pass discarded, restarting");
                    self.register_restart()?;
                    continue;
                }
                Err(error) => {
                    self.state = SyncState::Idle;
                    return Err(error);
                }
            }
        }
    }

    /// One full pass of the pipeline.
    pub async fn run_pass(&mut self) -> StepResult<PassOutcome> {
        if self.cancel.is_cancelled() {
            return Ok(PassOutcome::Aborted);
        }
        self.pause.wait_if_paused().await;

        // ---- change detection ------------------------------------------
        self.state = SyncState::ChangeDetection;
        self.blacklist
            .start_pass(&self.db)
            .await
            .map_err(store_error)?;

        if !self.local_snapshot.is_valid() || !self.remote_snapshot.is_valid() {
            return Err(StepError::data(
                ExitCause::InvalidSnapshot,
                "a live snapshot is invalid; observers must rebuild",
            ));
        }

        let local_frozen = self.local_snapshot.freeze();
        let remote_frozen = self.remote_snapshot.freeze();
        let frozen_revisions = (local_frozen.revision(), remote_frozen.revision());

        let excluded_local = self.blacklist.excluded(ReplicaSide::Local);
        let excluded_remote = self.blacklist.excluded(ReplicaSide::Remote);

        let local_ops = OpComputer::new(&self.db, ReplicaSide::Local, &excluded_local)
            .compute(&local_frozen)
            .await?;
        let remote_ops = OpComputer::new(&self.db, ReplicaSide::Remote, &excluded_remote)
            .compute(&remote_frozen)
            .await?;

        if local_ops.is_empty() && remote_ops.is_empty() {
            debug!("No deviation on either side");
            self.restart_count = 0;
            return Ok(PassOutcome::Converged);
        }
        info!(
            local_ops = local_ops.len(),
            remote_ops = remote_ops.len(),
            "Deviations detected"
        );

        self.pause.wait_if_paused().await;

        // ---- tree build ------------------------------------------------
        self.state = SyncState::TreeBuild;
        let mut local_tree = TreeBuilder::new(&self.db, &local_ops, ReplicaSide::Local)
            .build()
            .await?;
        let mut remote_tree = TreeBuilder::new(&self.db, &remote_ops, ReplicaSide::Remote)
            .build()
            .await?;

        if self.config.logging.extended {
            debug!(tree = %local_tree.render(), "Local update tree");
            debug!(tree = %remote_tree.render(), "Remote update tree");
        }

        let unfixable = self.checker.check_tree(&mut remote_tree);
        if !unfixable.is_empty() {
            for node_id in &unfixable {
                self.blacklist
                    .force_exclude(&self.db, ReplicaSide::Remote, node_id)
                    .await
                    .map_err(store_error)?;
            }
            return Err(StepError::need_restart(format!(
                "{} nodes with unrepresentable names excluded",
                unfixable.len()
            )));
        }

        self.pause.wait_if_paused().await;

        // ---- reconcile -------------------------------------------------
        self.state = SyncState::Reconcile;
        let mut ops = SyncOperationList::new();
        let mut restart_after_execute;

        let mut conflicts = ConflictFinder::new(&local_tree, &remote_tree).find();
        if conflicts.is_empty() {
            let free_space = self
                .local_fs
                .free_space(&self.config.sync.root)
                .await
                .ok();
            let generator = OpGenerator::new(
                self.config.behavior.virtual_files,
                self.config.transfers.free_space_floor,
            );
            let output =
                generator.generate(&mut local_tree, &mut remote_tree, free_space, &mut ops)?;
            restart_after_execute = output.restart;
        } else {
            let mut resolver = ConflictResolver::new(
                &local_tree,
                &remote_tree,
                &self.db,
                &self.namer,
                &self.config.sync.root,
            );
            let resolved = resolver.resolve(&mut conflicts, &mut ops).await?;
            // conflict resolution mutates the semantics the trees were built
            // under; the next pass re-reads the world
            restart_after_execute = resolved;
        }

        OpSorter::sort(&mut ops)?;

        if ops.is_empty() && !restart_after_execute {
            self.restart_count = 0;
            return Ok(PassOutcome::Converged);
        }

        // the world must not have moved between freeze and execution
        if (self.local_snapshot.revision(), self.remote_snapshot.revision()) != frozen_revisions {
            return Err(StepError::need_restart(
                "replica changed while the pass was being planned",
            ));
        }

        self.pause.wait_if_paused().await;

        // ---- execute ---------------------------------------------------
        self.state = SyncState::Execute;
        let executor = Executor::new(
            self.jobs.clone(),
            self.vfs.clone(),
            self.local_fs.clone(),
            self.config.sync.root.clone(),
            self.config.behavior.move_to_trash,
            self.config.behavior.virtual_files,
            self.config.transfers.session_threshold,
            self.config.transfers.chunk_size,
            self.config.transfers.max_attempts,
        );
        let report = executor
            .execute(&ops, &self.db, &self.cancel, &self.pause, &self.progress)
            .await;

        // ---- commit or restart -----------------------------------------
        self.state = SyncState::CommitOrRestart;

        if report.aborted {
            return Ok(PassOutcome::Aborted);
        }

        if let Some(failure) = report.failure {
            if let Some((side, node_id)) = failure.node {
                let excluded = self
                    .blacklist
                    .record_failure(&self.db, side, &node_id)
                    .await
                    .map_err(store_error)?;
                if excluded {
                    info!(side = %side, node = %node_id, "Node excluded from the next passes");
                }
            }
            if failure.error.code == ExitCode::SystemError {
                return Err(failure.error);
            }
            warn!(error = %failure.error, "Execution failed, pass restarts");
            restart_after_execute = true;
        }

        if restart_after_execute {
            self.register_restart()?;
            return Ok(PassOutcome::Restarted);
        }

        self.restart_count = 0;
        info!(operations = report.completed, "Pass committed");
        Ok(PassOutcome::Applied {
            operations: report.completed,
        })
    }

    fn register_restart(&mut self) -> StepResult<()> {
        self.restart_count += 1;
        if self.restart_count > self.config.sync.max_restarts {
            return Err(StepError::data(
                ExitCause::InvalidSnapshot,
                format!(
                    "pass restarted {} times without converging",
                    self.restart_count
                ),
            ));
        }
        debug!(count = self.restart_count, "Pass restart registered");
        Ok(())
    }

    /// Root path of the local replica.
    pub fn local_root(&self) -> PathBuf {
        self.config.sync.root.clone()
    }
}

fn store_error(e: pairdrive_store::StoreError) -> StepError {
    StepError::new(ExitCode::SystemError, ExitCause::Unknown, e.to_string())
}
