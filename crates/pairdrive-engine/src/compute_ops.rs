//! FS-operation computer
//!
//! Diffs a frozen snapshot against the database baseline and produces the set
//! of operations describing how the replica deviated since the last committed
//! pass. Node ids are the identity: a new id at the path of a deleted id is a
//! delete plus a create, never a move.

use std::collections::HashSet;

use tracing::{debug, trace};

use pairdrive_core::domain::{
    ExitCause, FsOpType, FsOperation, FsOperationSet, NodeId, NodeType, ReplicaSide, Snapshot,
    StepError, StepResult,
};
use pairdrive_store::SyncDb;

/// Computes one side's operation set for a pass
pub struct OpComputer<'a> {
    db: &'a SyncDb,
    side: ReplicaSide,
    /// Nodes excluded from this pass (temporary blacklist).
    excluded: &'a HashSet<NodeId>,
}

impl<'a> OpComputer<'a> {
    pub fn new(db: &'a SyncDb, side: ReplicaSide, excluded: &'a HashSet<NodeId>) -> Self {
        Self { db, side, excluded }
    }

    pub async fn compute(&self, snapshot: &Snapshot) -> StepResult<FsOperationSet> {
        if !snapshot.is_valid() {
            return Err(StepError::data(
                ExitCause::InvalidSnapshot,
                format!("{} snapshot is invalid", self.side),
            ));
        }

        let mut ops = FsOperationSet::new();

        // deterministic iteration keeps the op order stable across passes
        let mut snapshot_ids: Vec<&NodeId> = snapshot.ids().collect();
        snapshot_ids.sort();

        for node_id in snapshot_ids {
            if self.excluded.contains(node_id) || node_id == snapshot.root_id() {
                continue;
            }
            let item = snapshot
                .item(node_id)
                .expect("iterated id is present in snapshot");
            let snapshot_path = snapshot.path(node_id).ok_or_else(|| {
                StepError::data(
                    ExitCause::InvalidSnapshot,
                    format!("no path for {node_id} in {} snapshot", self.side),
                )
            })?;

            let row = self
                .db
                .node_by_id(self.side, node_id)
                .await
                .map_err(|e| StepError::data(ExitCause::Unknown, e.to_string()))?;

            match row {
                None => {
                    trace!(side = %self.side, id = %node_id, path = %snapshot_path.display(), "create detected");
                    let mut op = FsOperation::new(
                        FsOpType::Create,
                        node_id.clone(),
                        item.node_type,
                        snapshot_path,
                    )
                    .with_size(item.size)
                    .with_times(item.created_at, item.modified_at);
                    op.content_hash = item.content_hash.clone();
                    ops.insert(op);
                }
                Some(row) => {
                    let db_path = self
                        .db
                        .path(row.db_id)
                        .await
                        .map_err(|e| StepError::data(ExitCause::Unknown, e.to_string()))?
                        .ok_or_else(|| {
                            StepError::data(
                                ExitCause::Unknown,
                                format!("no database path for db_id {}", row.db_id),
                            )
                        })?;

                    if db_path != snapshot_path {
                        trace!(
                            side = %self.side,
                            id = %node_id,
                            from = %db_path.display(),
                            to = %snapshot_path.display(),
                            "move detected"
                        );
                        ops.insert(
                            FsOperation::new(
                                FsOpType::Move,
                                node_id.clone(),
                                item.node_type,
                                db_path,
                            )
                            .with_destination(snapshot_path.clone())
                            .with_size(item.size)
                            .with_times(item.created_at, item.modified_at),
                        );
                    }

                    // directory edits carry no meaning
                    if item.node_type == NodeType::File && self.content_changed(item, &row) {
                        trace!(side = %self.side, id = %node_id, path = %snapshot_path.display(), "edit detected");
                        let mut op = FsOperation::new(
                            FsOpType::Edit,
                            node_id.clone(),
                            item.node_type,
                            snapshot_path,
                        )
                        .with_size(item.size)
                        .with_times(item.created_at, item.modified_at);
                        op.content_hash = item.content_hash.clone();
                        ops.insert(op);
                    }
                }
            }
        }

        // anything in the database that the snapshot no longer has was deleted
        let db_ids = self
            .db
            .ids(self.side)
            .await
            .map_err(|e| StepError::data(ExitCause::Unknown, e.to_string()))?;
        for node_id in db_ids {
            if self.excluded.contains(&node_id) || snapshot.contains(&node_id) {
                continue;
            }
            let Some(row) = self
                .db
                .node_by_id(self.side, &node_id)
                .await
                .map_err(|e| StepError::data(ExitCause::Unknown, e.to_string()))?
            else {
                continue;
            };
            let Some(db_path) = self
                .db
                .path(row.db_id)
                .await
                .map_err(|e| StepError::data(ExitCause::Unknown, e.to_string()))?
            else {
                continue;
            };
            trace!(side = %self.side, id = %node_id, path = %db_path.display(), "delete detected");
            ops.insert(
                FsOperation::new(FsOpType::Delete, node_id, row.node_type, db_path)
                    .with_size(row.size),
            );
        }

        debug!(side = %self.side, ops = ops.len(), "Operation set computed");
        Ok(ops)
    }

    fn content_changed(
        &self,
        item: &pairdrive_core::domain::SnapshotItem,
        row: &pairdrive_store::NodeRecord,
    ) -> bool {
        if item.size != row.size {
            return true;
        }
        if let (Some(snapshot_hash), Some(db_hash)) = (&item.content_hash, &row.content_hash) {
            return snapshot_hash != db_hash;
        }
        match row.modified_at(self.side) {
            Some(db_modified) => item.modified_at != db_modified,
            None => false,
        }
    }
}
