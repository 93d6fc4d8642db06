//! Conflict taxonomy and queue
//!
//! A conflict pairs two nodes, one per update tree, whose change events touch
//! the same logical entity. The taxonomy is closed; every pair the finder can
//! produce is one of these ten codes.

use pairdrive_core::domain::ReplicaSide;

use crate::tree::NodeRef;

/// Closed set of conflict codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConflictKind {
    /// Same relative path created on both sides with different ids.
    CreateCreate,
    /// Same id edited on both sides.
    EditEdit,
    /// One side moves a node onto a path the other side just created.
    MoveCreate,
    /// Both sides move different nodes to the same destination path.
    MoveMoveDest,
    /// One side edits, the other deletes.
    EditDelete,
    /// One side moves, the other deletes.
    MoveDelete,
    /// Move target parent was deleted on the other side.
    MoveParentDelete,
    /// Create under a parent the other side deleted.
    CreateParentDelete,
    /// Same id moved on both sides.
    MoveMoveSource,
    /// Two moves that would create a cycle.
    MoveMoveCycle,
}

impl ConflictKind {
    /// Resolution order: higher solves first.
    ///
    /// Delete-involving conflicts go first so their DB-only operations land
    /// before anything touches the same subtrees; the local-rename family
    /// batches at the end of the queue.
    pub fn priority(self) -> u8 {
        match self {
            ConflictKind::MoveDelete => 9,
            ConflictKind::MoveParentDelete => 8,
            ConflictKind::CreateParentDelete => 7,
            ConflictKind::EditDelete => 6,
            ConflictKind::MoveMoveSource => 5,
            ConflictKind::MoveMoveDest => 4,
            ConflictKind::MoveCreate => 3,
            ConflictKind::CreateCreate => 2,
            ConflictKind::EditEdit => 1,
            ConflictKind::MoveMoveCycle => 0,
        }
    }

    /// The conflicts resolved by renaming the local node aside; several of
    /// them can be solved within one pass.
    pub fn renames_local_aside(self) -> bool {
        matches!(
            self,
            ConflictKind::CreateCreate
                | ConflictKind::EditEdit
                | ConflictKind::MoveCreate
                | ConflictKind::MoveMoveDest
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConflictKind::CreateCreate => "Create-Create",
            ConflictKind::EditEdit => "Edit-Edit",
            ConflictKind::MoveCreate => "Move-Create",
            ConflictKind::MoveMoveDest => "Move-Move (Dest)",
            ConflictKind::EditDelete => "Edit-Delete",
            ConflictKind::MoveDelete => "Move-Delete",
            ConflictKind::MoveParentDelete => "Move-ParentDelete",
            ConflictKind::CreateParentDelete => "Create-ParentDelete",
            ConflictKind::MoveMoveSource => "Move-Move (Source)",
            ConflictKind::MoveMoveCycle => "Move-Move (Cycle)",
        }
    }
}

/// One detected conflict: a node in each tree
#[derive(Debug, Clone, Copy)]
pub struct Conflict {
    pub kind: ConflictKind,
    /// Participant in the local update tree.
    pub local: NodeRef,
    /// Participant in the remote update tree.
    pub remote: NodeRef,
}

impl Conflict {
    pub fn node_on(&self, side: ReplicaSide) -> NodeRef {
        match side {
            ReplicaSide::Local => self.local,
            ReplicaSide::Remote => self.remote,
        }
    }
}

/// Pass-scoped queue ordered by resolution priority
#[derive(Debug, Default)]
pub struct ConflictQueue {
    items: Vec<Conflict>,
    seq: u64,
    order: Vec<u64>,
}

impl ConflictQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, conflict: Conflict) {
        self.items.push(conflict);
        self.order.push(self.seq);
        self.seq += 1;
    }

    /// Highest-priority conflict, FIFO within one code.
    pub fn pop(&mut self) -> Option<Conflict> {
        if self.items.is_empty() {
            return None;
        }
        let mut best = 0usize;
        for i in 1..self.items.len() {
            let (bp, bo) = (self.items[best].kind.priority(), self.order[best]);
            let (ip, io) = (self.items[i].kind.priority(), self.order[i]);
            if ip > bp || (ip == bp && io < bo) {
                best = i;
            }
        }
        self.order.remove(best);
        Some(self.items.remove(best))
    }

    pub fn has_kind(&self, kind: ConflictKind) -> bool {
        self.items.iter().any(|c| c.kind == kind)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.order.clear();
    }
}
