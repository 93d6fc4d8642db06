//! Filesystem operations
//!
//! A [`FsOperation`] describes one deviation of a frozen snapshot from the
//! database baseline: something was created, edited, moved or deleted on one
//! replica since the last committed pass. The per-side [`FsOperationSet`]
//! indexes the operations for the update-tree builder.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use super::ids::{NodeId, NodeType};

/// Kind of a change observed on a replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FsOpType {
    Create,
    Edit,
    Move,
    Delete,
}

impl FsOpType {
    pub fn as_str(self) -> &'static str {
        match self {
            FsOpType::Create => "create",
            FsOpType::Edit => "edit",
            FsOpType::Move => "move",
            FsOpType::Delete => "delete",
        }
    }
}

/// Set of change events attached to an update-tree node
///
/// A node may accumulate several events in one pass (a directory moved then
/// deleted carries both). Backed by a small bit mask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeEvents(u8);

impl ChangeEvents {
    const fn bit(op: FsOpType) -> u8 {
        match op {
            FsOpType::Create => 1,
            FsOpType::Edit => 2,
            FsOpType::Move => 4,
            FsOpType::Delete => 8,
        }
    }

    pub fn none() -> Self {
        Self(0)
    }

    pub fn only(op: FsOpType) -> Self {
        Self(Self::bit(op))
    }

    pub fn insert(&mut self, op: FsOpType) {
        self.0 |= Self::bit(op);
    }

    pub fn remove(&mut self, op: FsOpType) {
        self.0 &= !Self::bit(op);
    }

    pub fn contains(&self, op: FsOpType) -> bool {
        self.0 & Self::bit(op) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// One observed deviation of a snapshot from the database baseline
///
/// `path` is the operative path: for moves it is the origin (the database
/// path), with `destination` carrying the snapshot path; for every other kind
/// it is the only path involved.
#[derive(Debug, Clone)]
pub struct FsOperation {
    pub kind: FsOpType,
    pub node_id: NodeId,
    pub node_type: NodeType,
    pub path: PathBuf,
    pub destination: Option<PathBuf>,
    pub size: u64,
    pub content_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl FsOperation {
    pub fn new(
        kind: FsOpType,
        node_id: NodeId,
        node_type: NodeType,
        path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            kind,
            node_id,
            node_type,
            path: path.into(),
            destination: None,
            size: 0,
            content_hash: None,
            created_at: Utc::now(),
            modified_at: Utc::now(),
        }
    }

    pub fn with_destination(mut self, destination: impl Into<PathBuf>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn with_times(mut self, created_at: DateTime<Utc>, modified_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self.modified_at = modified_at;
        self
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.content_hash = Some(hash.into());
        self
    }

    /// The path the operation leaves the node at, if any
    pub fn effective_path(&self) -> &Path {
        self.destination.as_deref().unwrap_or(&self.path)
    }
}

/// Per-side collection of [`FsOperation`]s for one pass
///
/// Indexed by kind and by node id so that the tree-builder steps and the
/// delete+create collapse can query it without scanning.
#[derive(Debug, Default, Clone)]
pub struct FsOperationSet {
    ops: Vec<FsOperation>,
    by_kind: HashMap<FsOpType, Vec<usize>>,
    by_id: HashMap<NodeId, Vec<usize>>,
}

impl FsOperationSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, op: FsOperation) {
        let index = self.ops.len();
        self.by_kind.entry(op.kind).or_default().push(index);
        self.by_id.entry(op.node_id.clone()).or_default().push(index);
        self.ops.push(op);
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FsOperation> {
        self.ops.iter()
    }

    /// Operations of one kind restricted to one node type, in insertion order
    pub fn of_kind(
        &self,
        kind: FsOpType,
        node_type: NodeType,
    ) -> impl Iterator<Item = &FsOperation> {
        self.by_kind
            .get(&kind)
            .into_iter()
            .flatten()
            .map(|&i| &self.ops[i])
            .filter(move |op| op.node_type == node_type)
    }

    /// All operations recorded for a node id
    pub fn for_node(&self, node_id: &NodeId) -> impl Iterator<Item = &FsOperation> {
        self.by_id
            .get(node_id)
            .into_iter()
            .flatten()
            .map(|&i| &self.ops[i])
    }

    pub fn op(&self, node_id: &NodeId, kind: FsOpType) -> Option<&FsOperation> {
        self.for_node(node_id).find(|op| op.kind == kind)
    }

    /// Create operation whose destination is `path`, if any
    ///
    /// Used by the tree builder to collapse delete+create at the same path
    /// into an edit (content-replace semantics).
    pub fn create_at_path(&self, path: &Path) -> Option<&FsOperation> {
        self.by_kind
            .get(&FsOpType::Create)
            .into_iter()
            .flatten()
            .map(|&i| &self.ops[i])
            .find(|op| op.path == path)
    }

    pub fn clear(&mut self) {
        self.ops.clear();
        self.by_kind.clear();
        self.by_id.clear();
    }
}
