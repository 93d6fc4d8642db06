//! Sync operations
//!
//! The reconciliation stages emit [`SyncOperation`]s: self-contained
//! descriptions of one change to propagate to one replica (or, with
//! `omit`, to the database only). The executor consumes them in the order
//! the sorter establishes.

use std::path::PathBuf;

use chrono::{DateTime, Utc};

use pairdrive_core::domain::{DbNodeId, FsOpType, NodeId, NodeType, ReplicaSide};

use crate::conflict::ConflictKind;

/// One operation to apply
#[derive(Debug, Clone)]
pub struct SyncOperation {
    pub id: u64,
    pub kind: FsOpType,
    /// Replica the operation is applied to.
    pub target_side: ReplicaSide,
    /// Database-only update; no replica is touched.
    pub omit: bool,
    pub node_type: NodeType,
    pub db_id: Option<DbNodeId>,
    /// Identifier of the node on the side where the change was observed.
    pub source_id: Option<NodeId>,
    /// Identifier of the counterpart on the target side, when it exists.
    pub target_id: Option<NodeId>,
    /// Final path of the node on the source replica (content source).
    pub source_path: PathBuf,
    /// Path the operation produces on the target replica.
    pub dest_path: PathBuf,
    /// Path vacated on the target replica (moves only).
    pub origin_path: Option<PathBuf>,
    /// Canonical name for the database row when it differs from the applied
    /// leaf name (platform substitutions).
    pub db_name: Option<String>,
    pub size: u64,
    pub content_hash: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
    /// The conflict this operation resolves, if any.
    pub conflict: Option<ConflictKind>,
}

impl SyncOperation {
    pub fn new(kind: FsOpType, target_side: ReplicaSide, node_type: NodeType) -> Self {
        Self {
            id: 0,
            kind,
            target_side,
            omit: false,
            node_type,
            db_id: None,
            source_id: None,
            target_id: None,
            source_path: PathBuf::new(),
            dest_path: PathBuf::new(),
            origin_path: None,
            db_name: None,
            size: 0,
            content_hash: None,
            created_at: None,
            modified_at: None,
            conflict: None,
        }
    }
}

/// Pass-scoped, append-only list of operations
#[derive(Debug, Default)]
pub struct SyncOperationList {
    ops: Vec<SyncOperation>,
    next_id: u64,
}

impl SyncOperationList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, mut op: SyncOperation) -> u64 {
        self.next_id += 1;
        op.id = self.next_id;
        let id = op.id;
        self.ops.push(op);
        id
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SyncOperation> {
        self.ops.iter()
    }

    pub fn clear(&mut self) {
        self.ops.clear();
    }

    pub fn into_vec(self) -> Vec<SyncOperation> {
        self.ops
    }

    /// Replaces the list content with a sorted permutation of itself.
    pub fn replace(&mut self, ops: Vec<SyncOperation>) {
        self.ops = ops;
    }

    pub fn as_slice(&self) -> &[SyncOperation] {
        &self.ops
    }
}
