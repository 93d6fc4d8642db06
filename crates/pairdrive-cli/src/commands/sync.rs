//! `pairdrive sync` - run the synchronization pipeline

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use pairdrive_core::config::Config;
use pairdrive_core::domain::NodeId;
use pairdrive_core::ports::VfsOff;
use pairdrive_engine::observer::local::LocalObserver;
use pairdrive_engine::observer::remote::RemoteObserver;
use pairdrive_engine::observer::SharedSnapshot;
use pairdrive_engine::filesystem::StdLocalFs;
use pairdrive_engine::{PassOutcome, Supervisor};
use pairdrive_jobs::{timeout, DriveClient, HttpJobRunner, JobPool};
use pairdrive_store::{DbPool, SyncDb};

#[derive(Debug, Args)]
pub struct SyncCommand {
    /// Run a single pass and exit instead of watching for changes
    #[arg(long)]
    once: bool,
}

impl SyncCommand {
    pub async fn run(&self, config: Config) -> Result<()> {
        timeout::init(timeout::TimeoutConfig::default());
        let result = self.run_inner(config).await;
        timeout::teardown();
        result
    }

    async fn run_inner(&self, config: Config) -> Result<()> {
        let root = config.sync.root.clone();
        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("Cannot create sync root {}", root.display()))?;

        let local_fs = Arc::new(StdLocalFs::new(&root));
        let local_root_id = local_fs_root_id(&root).await?;
        let remote_root_id = NodeId::new(config.sync.remote_root_id.clone());

        // durable state
        let pool = DbPool::open(&config.sync.db_path).await?;
        let db = Arc::new(SyncDb::open(&pool, &local_root_id, &remote_root_id).await?);

        // network
        let client = DriveClient::new(
            &config.network.base_url,
            config.network.token.clone(),
            Duration::from_secs(config.network.timeout),
        )?;
        let jobs = JobPool::new(Arc::new(HttpJobRunner::new(client)), 8);

        // observers
        let local_snapshot = SharedSnapshot::new(
            pairdrive_core::domain::ReplicaSide::Local,
            local_root_id.clone(),
        );
        let remote_snapshot = SharedSnapshot::new(
            pairdrive_core::domain::ReplicaSide::Remote,
            remote_root_id.clone(),
        );

        let local_observer = Arc::new(LocalObserver::new(
            &root,
            local_root_id,
            local_snapshot.clone(),
            local_fs.clone(),
        ));
        local_observer.initial_scan().await?;

        let mut remote_observer =
            RemoteObserver::new(jobs.clone(), remote_snapshot.clone(), remote_root_id);
        remote_observer
            .bootstrap(&db)
            .await
            .map_err(|e| anyhow::anyhow!("remote bootstrap failed: {e}"))?;

        let cancel = CancellationToken::new();
        let mut supervisor = Supervisor::new(
            config.clone(),
            db.clone(),
            jobs,
            Arc::new(VfsOff),
            local_fs,
            local_snapshot.clone(),
            remote_snapshot,
        )
        .await?;

        if self.once {
            let outcome = supervisor
                .run_until_settled()
                .await
                .map_err(|e| anyhow::anyhow!("sync failed: {e}"))?;
            report(outcome);
            return Ok(());
        }

        // continuous mode: watch both replicas between passes
        let _watcher = local_observer
            .clone()
            .spawn_watcher(cancel.child_token())?;
        let (changed_tx, mut changed_rx) = tokio::sync::mpsc::channel::<()>(8);
        remote_observer.spawn_poll_loop(db.clone(), cancel.child_token(), changed_tx);

        let mut ticker = tokio::time::interval(Duration::from_secs(config.sync.poll_interval));
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted, stopping");
                    cancel.cancel();
                    return Ok(());
                }
                _ = changed_rx.recv() => {}
                _ = ticker.tick() => {}
            }

            match supervisor.run_until_settled().await {
                Ok(outcome) => report(outcome),
                Err(e) if e.wants_restart() => {
                    // the local snapshot went stale; rebuild and go around
                    warn!(error = %e, "Rebuilding local snapshot");
                    if let Err(err) = local_observer.initial_scan().await {
                        error!(error = %err, "Local rescan failed");
                    }
                }
                Err(e) => {
                    error!(error = %e, "Sync error, pausing this root");
                    return Err(anyhow::anyhow!("sync failed: {e}"));
                }
            }
        }
    }
}

fn report(outcome: PassOutcome) {
    match outcome {
        PassOutcome::Converged => info!("Replicas are in sync"),
        PassOutcome::Applied { operations } => info!(operations, "Sync pass applied"),
        PassOutcome::Restarted => {}
        PassOutcome::Aborted => info!("Sync pass aborted"),
    }
}

async fn local_fs_root_id(root: &std::path::Path) -> Result<NodeId> {
    let metadata = tokio::fs::metadata(root)
        .await
        .with_context(|| format!("Cannot stat sync root {}", root.display()))?;
    Ok(pairdrive_engine::filesystem::node_id_for(&metadata))
}
