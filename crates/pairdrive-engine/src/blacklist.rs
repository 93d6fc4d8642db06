//! Temporary blacklist
//!
//! Nodes that keep failing are excluded from the next passes instead of
//! wedging the sync. Consecutive failure counts are durable (they survive a
//! process restart through the store); the in-memory pass countdown is not,
//! by design: a fresh process re-earns trust faster.

use std::collections::{HashMap, HashSet};

use tracing::{info, warn};

use pairdrive_core::domain::{NodeId, ReplicaSide};
use pairdrive_store::{StoreError, SyncDb, SyncNodeSet};

/// Tracks failing nodes and their exclusion windows
pub struct TmpBlacklist {
    /// Failures before a node is excluded.
    error_threshold: u32,
    /// Passes an excluded node stays excluded.
    pass_count: u32,
    /// Remaining exclusion passes per node.
    countdown: HashMap<(ReplicaSide, NodeId), u32>,
}

impl TmpBlacklist {
    pub fn new(error_threshold: u32, pass_count: u32) -> Self {
        Self {
            error_threshold: error_threshold.max(1),
            pass_count: pass_count.max(1),
            countdown: HashMap::new(),
        }
    }

    /// Loads the persisted blacklist sets into the in-memory countdowns.
    pub async fn load(&mut self, db: &SyncDb) -> Result<(), StoreError> {
        for (side, set) in [
            (ReplicaSide::Local, SyncNodeSet::TmpLocalBlacklist),
            (ReplicaSide::Remote, SyncNodeSet::TmpRemoteBlacklist),
        ] {
            for node_id in db.select_all_sync_nodes(set).await? {
                self.countdown.insert((side, node_id), self.pass_count);
            }
        }
        Ok(())
    }

    /// Records one failure on a node; returns `true` when the node just
    /// crossed the threshold and is now excluded.
    pub async fn record_failure(
        &mut self,
        db: &SyncDb,
        side: ReplicaSide,
        node_id: &NodeId,
    ) -> Result<bool, StoreError> {
        let count = db.error_count(side, node_id).await? + 1;
        db.set_error_count(side, node_id, count).await?;

        if count < self.error_threshold {
            return Ok(false);
        }

        warn!(
            side = %side,
            node = %node_id,
            failures = count,
            passes = self.pass_count,
            "Node excluded after repeated failures"
        );
        self.countdown
            .insert((side, node_id.clone()), self.pass_count);
        db.insert_sync_node(set_for(side), node_id).await?;
        Ok(true)
    }

    /// Excludes a node immediately, regardless of its failure count
    /// (unrepresentable names).
    pub async fn force_exclude(
        &mut self,
        db: &SyncDb,
        side: ReplicaSide,
        node_id: &NodeId,
    ) -> Result<(), StoreError> {
        self.countdown
            .insert((side, node_id.clone()), self.pass_count);
        db.insert_sync_node(set_for(side), node_id).await
    }

    /// Clears the failure record of a node that worked.
    pub async fn record_success(
        &mut self,
        db: &SyncDb,
        side: ReplicaSide,
        node_id: &NodeId,
    ) -> Result<(), StoreError> {
        db.clear_error_count(side, node_id).await?;
        if self.countdown.remove(&(side, node_id.clone())).is_some() {
            db.delete_sync_node(set_for(side), node_id).await?;
        }
        Ok(())
    }

    /// Ticks the exclusion windows at the start of a pass; expired nodes
    /// rejoin the sync.
    pub async fn start_pass(&mut self, db: &SyncDb) -> Result<(), StoreError> {
        let mut expired = Vec::new();
        for (key, remaining) in self.countdown.iter_mut() {
            if *remaining <= 1 {
                expired.push(key.clone());
            } else {
                *remaining -= 1;
            }
        }
        for (side, node_id) in expired {
            info!(side = %side, node = %node_id, "Exclusion window over");
            self.countdown.remove(&(side, node_id.clone()));
            db.delete_sync_node(set_for(side), &node_id).await?;
        }
        Ok(())
    }

    /// Currently excluded nodes of one side.
    pub fn excluded(&self, side: ReplicaSide) -> HashSet<NodeId> {
        self.countdown
            .keys()
            .filter(|(s, _)| *s == side)
            .map(|(_, id)| id.clone())
            .collect()
    }

    pub fn is_excluded(&self, side: ReplicaSide, node_id: &NodeId) -> bool {
        self.countdown.contains_key(&(side, node_id.clone()))
    }
}

fn set_for(side: ReplicaSide) -> SyncNodeSet {
    match side {
        ReplicaSide::Local => SyncNodeSet::TmpLocalBlacklist,
        ReplicaSide::Remote => SyncNodeSet::TmpRemoteBlacklist,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pairdrive_store::DbPool;

    async fn setup_db() -> SyncDb {
        let pool = DbPool::in_memory().await.unwrap();
        SyncDb::open(&pool, &NodeId::new("lroot"), &NodeId::new("rroot"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_excluded_after_threshold() {
        let db = setup_db().await;
        let mut blacklist = TmpBlacklist::new(3, 5);
        let node = NodeId::new("flaky");

        assert!(!blacklist
            .record_failure(&db, ReplicaSide::Local, &node)
            .await
            .unwrap());
        assert!(!blacklist
            .record_failure(&db, ReplicaSide::Local, &node)
            .await
            .unwrap());
        assert!(blacklist
            .record_failure(&db, ReplicaSide::Local, &node)
            .await
            .unwrap());

        assert!(blacklist.is_excluded(ReplicaSide::Local, &node));
        assert!(!blacklist.is_excluded(ReplicaSide::Remote, &node));
        assert!(blacklist.excluded(ReplicaSide::Local).contains(&node));
    }

    #[tokio::test]
    async fn test_exclusion_expires_after_passes() {
        let db = setup_db().await;
        let mut blacklist = TmpBlacklist::new(1, 2);
        let node = NodeId::new("flaky");

        blacklist
            .record_failure(&db, ReplicaSide::Remote, &node)
            .await
            .unwrap();
        assert!(blacklist.is_excluded(ReplicaSide::Remote, &node));

        blacklist.start_pass(&db).await.unwrap();
        assert!(blacklist.is_excluded(ReplicaSide::Remote, &node));
        blacklist.start_pass(&db).await.unwrap();
        assert!(!blacklist.is_excluded(ReplicaSide::Remote, &node));
    }

    #[tokio::test]
    async fn test_success_clears_failures() {
        let db = setup_db().await;
        let mut blacklist = TmpBlacklist::new(2, 5);
        let node = NodeId::new("flaky");

        blacklist
            .record_failure(&db, ReplicaSide::Local, &node)
            .await
            .unwrap();
        blacklist
            .record_success(&db, ReplicaSide::Local, &node)
            .await
            .unwrap();
        // the counter restarted from zero
        assert!(!blacklist
            .record_failure(&db, ReplicaSide::Local, &node)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_counts_survive_reload() {
        let db = setup_db().await;
        let node = NodeId::new("flaky");

        {
            let mut blacklist = TmpBlacklist::new(1, 5);
            blacklist
                .record_failure(&db, ReplicaSide::Local, &node)
                .await
                .unwrap();
        }

        // a fresh manager (new process) sees the persisted exclusion
        let mut fresh = TmpBlacklist::new(1, 5);
        fresh.load(&db).await.unwrap();
        assert!(fresh.is_excluded(ReplicaSide::Local, &node));
    }
}
