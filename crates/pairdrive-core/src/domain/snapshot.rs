//! Replica snapshots
//!
//! A [`Snapshot`] is the in-memory image of one replica, keyed by node id and
//! rooted at a designated root id. Observers maintain it incrementally from
//! filesystem events or the remote change feed; each sync pass works on a
//! frozen copy taken under the observer's lock.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};

use super::ids::{NodeId, NodeType, ReplicaSide};

/// One entry of a replica snapshot
#[derive(Debug, Clone)]
pub struct SnapshotItem {
    pub node_id: NodeId,
    pub parent_id: NodeId,
    pub name: String,
    pub node_type: NodeType,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub content_hash: Option<String>,
    pub can_write: bool,
}

impl SnapshotItem {
    pub fn new(
        node_id: NodeId,
        parent_id: NodeId,
        name: impl Into<String>,
        node_type: NodeType,
    ) -> Self {
        Self {
            node_id,
            parent_id,
            name: name.into(),
            node_type,
            size: 0,
            created_at: Utc::now(),
            modified_at: Utc::now(),
            content_hash: None,
            can_write: true,
        }
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
}

/// In-memory image of one replica
///
/// Cloning produces the frozen copy handed to the pipeline; the live value
/// stays with its observer.
#[derive(Debug, Clone)]
pub struct Snapshot {
    side: ReplicaSide,
    root_id: NodeId,
    items: HashMap<NodeId, SnapshotItem>,
    revision: u64,
    valid: bool,
}

impl Snapshot {
    pub fn new(side: ReplicaSide, root_id: NodeId) -> Self {
        Self {
            side,
            root_id,
            items: HashMap::new(),
            revision: 0,
            valid: true,
        }
    }

    pub fn side(&self) -> ReplicaSide {
        self.side
    }

    pub fn root_id(&self) -> &NodeId {
        &self.root_id
    }

    /// Monotonic counter bumped on every mutation; lets the supervisor detect
    /// that the world changed since a freeze without diffing.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Marks the snapshot untrustworthy (observer lost track of events).
    pub fn invalidate(&mut self) {
        self.valid = false;
        self.revision += 1;
    }

    pub fn restore_validity(&mut self) {
        self.valid = true;
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.items.contains_key(id)
    }

    pub fn item(&self, id: &NodeId) -> Option<&SnapshotItem> {
        self.items.get(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &NodeId> {
        self.items.keys()
    }

    /// Inserts or replaces an item. The root id itself cannot be inserted.
    pub fn upsert(&mut self, item: SnapshotItem) {
        if item.node_id == self.root_id {
            return;
        }
        self.revision += 1;
        self.items.insert(item.node_id.clone(), item);
    }

    /// Removes an item and, recursively, everything below it.
    pub fn remove(&mut self, id: &NodeId) {
        let children: Vec<NodeId> = self
            .items
            .values()
            .filter(|item| &item.parent_id == id)
            .map(|item| item.node_id.clone())
            .collect();
        for child in children {
            self.remove(&child);
        }
        if self.items.remove(id).is_some() {
            self.revision += 1;
        }
    }

    pub fn children_of(&self, id: &NodeId) -> impl Iterator<Item = &SnapshotItem> {
        let id = id.clone();
        self.items.values().filter(move |item| item.parent_id == id)
    }

    pub fn child_by_name(&self, parent: &NodeId, name: &str) -> Option<&SnapshotItem> {
        self.children_of(parent).find(|item| item.name == name)
    }

    /// Reconstructs the relative path of a node by walking parent links.
    ///
    /// Returns `None` for unknown ids, broken parent chains and cycles; the
    /// caller treats that as an invalid snapshot.
    pub fn path(&self, id: &NodeId) -> Option<PathBuf> {
        if id == &self.root_id {
            return Some(PathBuf::new());
        }
        let mut names: Vec<&str> = Vec::new();
        let mut current = self.items.get(id)?;
        let mut hops = 0usize;
        loop {
            names.push(&current.name);
            if current.parent_id == self.root_id {
                break;
            }
            current = self.items.get(&current.parent_id)?;
            hops += 1;
            if hops > self.items.len() {
                // parent links form a cycle
                return None;
            }
        }
        let mut path = PathBuf::new();
        for name in names.iter().rev() {
            path.push(name);
        }
        Some(path)
    }

    /// True when `ancestor` lies on the parent chain of `id`.
    pub fn is_ancestor(&self, ancestor: &NodeId, id: &NodeId) -> bool {
        let mut current = match self.items.get(id) {
            Some(item) => item,
            None => return false,
        };
        let mut hops = 0usize;
        loop {
            if &current.parent_id == ancestor {
                return true;
            }
            if current.parent_id == self.root_id {
                return false;
            }
            current = match self.items.get(&current.parent_id) {
                Some(item) => item,
                None => return false,
            };
            hops += 1;
            if hops > self.items.len() {
                return false;
            }
        }
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.revision += 1;
    }
}
