//! Conflict resolver
//!
//! Pops conflicts off the queue in priority order and emits the sync
//! operations that resolve each one. Conflicts of the local-rename family are
//! batched within one pass; every other code solves once, drains the queue
//! and leaves the rest to the restarted pass. After any resolution the
//! supervisor restarts the pipeline: resolving mutates the semantics the
//! trees were built under.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info, warn};

use pairdrive_core::domain::{
    ConflictSuffix, DbNodeId, ExitCause, ExitCode, FsOpType, NodeType, ReplicaSide, StepError,
    StepResult, SuffixKind,
};
use pairdrive_store::SyncDb;

use crate::conflict::{Conflict, ConflictKind, ConflictQueue};
use crate::op::{SyncOperation, SyncOperationList};
use crate::platform::MAX_PATH_LENGTH;
use crate::tree::{corresponding_node, NodeRef, UpdateTree};

/// Resolves queued conflicts into sync operations
pub struct ConflictResolver<'a> {
    local: &'a UpdateTree,
    remote: &'a UpdateTree,
    db: &'a SyncDb,
    namer: &'a ConflictSuffix,
    /// Absolute path of the local sync root, for path-length checks.
    local_root: &'a Path,
    /// Orphans registered while solving this pass: `(db id, delete side)`.
    orphans: HashMap<DbNodeId, ReplicaSide>,
}

impl<'a> ConflictResolver<'a> {
    pub fn new(
        local: &'a UpdateTree,
        remote: &'a UpdateTree,
        db: &'a SyncDb,
        namer: &'a ConflictSuffix,
        local_root: &'a Path,
    ) -> Self {
        Self {
            local,
            remote,
            db,
            namer,
            local_root,
            orphans: HashMap::new(),
        }
    }

    pub fn orphans(&self) -> &HashMap<DbNodeId, ReplicaSide> {
        &self.orphans
    }

    /// Solves conflicts until one requires a restart; returns whether any
    /// operations were emitted (and therefore a restart is due).
    pub async fn resolve(
        &mut self,
        queue: &mut ConflictQueue,
        ops: &mut SyncOperationList,
    ) -> StepResult<bool> {
        let mut resolved_any = false;
        while let Some(conflict) = queue.pop() {
            info!(
                kind = conflict.kind.as_str(),
                local = %self.local.node(conflict.local).name,
                remote = %self.remote.node(conflict.remote).name,
                "Solving conflict"
            );
            let continue_solving = self.generate(&conflict, queue, ops).await?;
            resolved_any = true;
            if !continue_solving {
                queue.clear();
                break;
            }
        }
        Ok(resolved_any)
    }

    fn tree(&self, side: ReplicaSide) -> &'a UpdateTree {
        match side {
            ReplicaSide::Local => self.local,
            ReplicaSide::Remote => self.remote,
        }
    }

    /// Side of a conflict participant carrying `event`, with its node.
    fn participant(&self, conflict: &Conflict, event: FsOpType) -> Option<(ReplicaSide, NodeRef)> {
        if self.local.node(conflict.local).has_event(event) {
            Some((ReplicaSide::Local, conflict.local))
        } else if self.remote.node(conflict.remote).has_event(event) {
            Some((ReplicaSide::Remote, conflict.remote))
        } else {
            None
        }
    }

    async fn generate(
        &mut self,
        conflict: &Conflict,
        queue: &ConflictQueue,
        ops: &mut SyncOperationList,
    ) -> StepResult<bool> {
        match conflict.kind {
            ConflictKind::CreateCreate
            | ConflictKind::EditEdit
            | ConflictKind::MoveCreate
            | ConflictKind::MoveMoveDest => self.rename_local_aside(conflict, ops),
            ConflictKind::EditDelete => self.solve_edit_delete(conflict, ops),
            ConflictKind::MoveDelete => self.solve_move_delete(conflict, queue, ops).await,
            ConflictKind::MoveParentDelete => {
                let (side, node) = self
                    .participant(conflict, FsOpType::Move)
                    .ok_or_else(|| data_error("Move-ParentDelete without a move participant"))?;
                let op = self.undo_move(side, node, Some(conflict.kind))?;
                ops.push(op);
                Ok(false)
            }
            ConflictKind::CreateParentDelete => self.solve_create_parent_delete(conflict, ops),
            ConflictKind::MoveMoveSource => self.solve_move_move_source(conflict, ops),
            ConflictKind::MoveMoveCycle => {
                // break the cycle by undoing the local move
                let op = self.undo_move(ReplicaSide::Local, conflict.local, Some(conflict.kind))?;
                ops.push(op);
                Ok(false)
            }
        }
    }

    // ------------------------------------------------------------------
    // Local rename family
    // ------------------------------------------------------------------

    /// The remote version keeps its place; the local node is renamed aside
    /// and its row dropped so the next pass re-detects both versions.
    fn rename_local_aside(
        &mut self,
        conflict: &Conflict,
        ops: &mut SyncOperationList,
    ) -> StepResult<bool> {
        let local_node = self.local.node(conflict.local);
        let current_path = self.local.path_of(conflict.local);
        let parent = self
            .local
            .node(conflict.local)
            .parent()
            .unwrap_or(self.local.root());

        let (dest_parent, new_name) = self.conflicted_placement(
            self.local,
            parent,
            &local_node.name.clone(),
            SuffixKind::Conflict,
        )?;

        let mut op = SyncOperation::new(FsOpType::Move, ReplicaSide::Local, local_node.node_type);
        op.db_id = local_node.db_id;
        op.target_id = local_node.node_id.clone();
        op.source_id = self.remote.node(conflict.remote).node_id.clone();
        op.origin_path = Some(current_path);
        op.dest_path = dest_parent.join(&new_name);
        op.source_path = self.remote.path_of(conflict.remote);
        op.conflict = Some(conflict.kind);
        debug!(op = ?op.kind, dest = %op.dest_path.display(), "Local version renamed aside");
        ops.push(op);

        // same-family conflicts batch within this pass
        Ok(conflict.kind.renames_local_aside())
    }

    // ------------------------------------------------------------------
    // Edit-Delete
    // ------------------------------------------------------------------

    fn solve_edit_delete(
        &mut self,
        conflict: &Conflict,
        ops: &mut SyncOperationList,
    ) -> StepResult<bool> {
        let (delete_side, delete_node) = self
            .participant(conflict, FsOpType::Delete)
            .ok_or_else(|| data_error("Edit-Delete without a delete participant"))?;
        let (edit_side, edit_node) = self
            .participant(conflict, FsOpType::Edit)
            .ok_or_else(|| data_error("Edit-Delete without an edit participant"))?;
        let delete_tree = self.tree(delete_side);
        let edit_tree = self.tree(edit_side);

        let parent_also_deleted = delete_tree
            .node(delete_node)
            .parent()
            .map(|p| delete_tree.node(p).has_event(FsOpType::Delete))
            .unwrap_or(false);

        if parent_also_deleted {
            // the whole subtree is going away: park the edited file at the
            // root under a conflict name, then drop the subtree from the DB
            let edited_name = edit_tree.node(edit_node).name.clone();
            let (dest_parent, new_name) = self.conflicted_placement(
                edit_tree,
                edit_tree.root(),
                &edited_name,
                SuffixKind::Conflict,
            )?;
            let edited = edit_tree.node(edit_node);

            let mut move_op = SyncOperation::new(FsOpType::Move, edit_side, edited.node_type);
            move_op.db_id = edited.db_id;
            move_op.target_id = edited.node_id.clone();
            move_op.origin_path = Some(edit_tree.path_of(edit_node));
            move_op.dest_path = dest_parent.join(&new_name);
            move_op.source_path = edit_tree.path_of(edit_node);
            move_op.conflict = Some(conflict.kind);
            ops.push(move_op);

            let mut delete_op = SyncOperation::new(
                FsOpType::Delete,
                edit_side,
                delete_tree.node(delete_node).node_type,
            );
            delete_op.omit = true; // DB only; the replicas are not touched
            delete_op.db_id = delete_tree.node(delete_node).db_id;
            delete_op.dest_path = delete_tree.path_of(delete_node);
            delete_op.conflict = Some(conflict.kind);
            ops.push(delete_op);
        } else {
            // drop the edited row from the DB only; the next pass re-detects
            // the file as a create and restores it on the deleting side
            let edited = edit_tree.node(edit_node);
            let mut delete_op = SyncOperation::new(FsOpType::Delete, delete_side, edited.node_type);
            delete_op.omit = true;
            delete_op.db_id = edited.db_id;
            delete_op.dest_path = edit_tree.path_of(edit_node);
            delete_op.conflict = Some(conflict.kind);
            ops.push(delete_op);
        }

        Ok(false)
    }

    // ------------------------------------------------------------------
    // Move-Delete
    // ------------------------------------------------------------------

    async fn solve_move_delete(
        &mut self,
        conflict: &Conflict,
        queue: &ConflictQueue,
        ops: &mut SyncOperationList,
    ) -> StepResult<bool> {
        let (delete_side, delete_node) = self
            .participant(conflict, FsOpType::Delete)
            .ok_or_else(|| data_error("Move-Delete without a delete participant"))?;
        let (move_side, move_node) = self
            .participant(conflict, FsOpType::Move)
            .ok_or_else(|| data_error("Move-Delete without a move participant"))?;
        let delete_tree = self.tree(delete_side);
        let move_tree = self.tree(move_side);

        // a move into a directory deleted on the other side is the
        // Move-ParentDelete conflict's business; skip this one
        if let Some(parent) = move_tree.node(move_node).parent() {
            let reparented = move_tree
                .node(move_node)
                .move_origin
                .as_deref()
                .and_then(Path::parent)
                .map(|origin_parent| origin_parent != move_tree.path_of(parent))
                .unwrap_or(false);
            if reparented
                && corresponding_node(move_tree, parent, delete_tree)
                    .map(|p| delete_tree.node(p).has_event(FsOpType::Delete))
                    .unwrap_or(false)
                && queue.has_kind(ConflictKind::MoveParentDelete)
            {
                info!("Move-Delete deferred to the Move-ParentDelete conflict");
                return Ok(true);
            }
        }

        // preserve every descendant the other side moved: park it at the
        // root in the DB; the next passes surface it as Move-Move (Source)
        let delete_db_id = delete_tree
            .node(delete_node)
            .db_id
            .ok_or_else(|| data_error("deleted node has no db id"))?;
        if delete_tree.node(delete_node).node_type == NodeType::Directory {
            let subtree = self.collect_db_subtree(delete_db_id).await?;
            for row in subtree {
                let Some(moved) = move_tree.by_db_id(row.db_id) else {
                    continue;
                };
                if !move_tree.node(moved).has_event(FsOpType::Move) {
                    continue;
                }

                // the orphan keeps its pre-pass name as the suffix base
                let (_, orphan_name) = self.conflicted_placement(
                    move_tree,
                    move_tree.root(),
                    &row.name,
                    SuffixKind::Orphan,
                )?;

                let mut orphan_op =
                    SyncOperation::new(FsOpType::Move, delete_side, row.node_type);
                orphan_op.omit = true; // DB placement only
                orphan_op.db_id = Some(row.db_id);
                orphan_op.dest_path = PathBuf::from(&orphan_name);
                orphan_op.source_path = move_tree.path_of(moved);
                orphan_op.conflict = Some(conflict.kind);
                info!(
                    db_id = row.db_id,
                    name = %orphan_name,
                    "Orphan preserved at the root"
                );
                ops.push(orphan_op);

                self.orphans.insert(row.db_id, delete_side);
            }
        }

        // the deletion itself lands in the DB only; the moved-out content
        // survives and the next pass converges the replicas
        let mut delete_op = SyncOperation::new(
            FsOpType::Delete,
            move_side,
            delete_tree.node(delete_node).node_type,
        );
        delete_op.omit = true;
        delete_op.db_id = Some(delete_db_id);
        delete_op.dest_path = delete_tree.path_of(delete_node);
        delete_op.conflict = Some(conflict.kind);
        ops.push(delete_op);

        Ok(false)
    }

    // ------------------------------------------------------------------
    // Create-ParentDelete
    // ------------------------------------------------------------------

    fn solve_create_parent_delete(
        &mut self,
        conflict: &Conflict,
        ops: &mut SyncOperationList,
    ) -> StepResult<bool> {
        let (delete_side, delete_node) = self
            .participant(conflict, FsOpType::Delete)
            .ok_or_else(|| data_error("Create-ParentDelete without a delete participant"))?;
        let delete_tree = self.tree(delete_side);
        let create_side = delete_side.opposite();
        let create_tree = self.tree(create_side);

        let corr = corresponding_node(delete_tree, delete_node, create_tree)
            .ok_or_else(|| data_error("deleted parent has no counterpart on the create side"))?;

        // the delete wins: propagate it to the side that created underneath
        let mut op = SyncOperation::new(
            FsOpType::Delete,
            create_side,
            delete_tree.node(delete_node).node_type,
        );
        op.db_id = delete_tree.node(delete_node).db_id;
        op.target_id = create_tree.node(corr).node_id.clone();
        op.dest_path = create_tree.path_of(corr);
        op.conflict = Some(conflict.kind);
        ops.push(op);

        Ok(false)
    }

    // ------------------------------------------------------------------
    // Move-Move (Source)
    // ------------------------------------------------------------------

    fn solve_move_move_source(
        &mut self,
        conflict: &Conflict,
        ops: &mut SyncOperationList,
    ) -> StepResult<bool> {
        // the local move loses, unless the node is a registered orphan: then
        // the orphan's own side keeps the parked placement
        let mut loser_side = ReplicaSide::Local;
        if let Some(db_id) = self.local.node(conflict.local).db_id {
            if let Some(registered_side) = self.orphans.get(&db_id) {
                loser_side = registered_side.opposite();
            }
        }
        let loser_node = conflict.node_on(loser_side);
        let op = self.undo_move(loser_side, loser_node, Some(conflict.kind))?;
        ops.push(op);
        Ok(false)
    }

    // ------------------------------------------------------------------
    // Undo move
    // ------------------------------------------------------------------

    /// Builds the operation returning a moved node to its origin; when the
    /// origin is gone or occupied, the node goes to the root under a conflict
    /// name instead.
    fn undo_move(
        &mut self,
        side: ReplicaSide,
        node: NodeRef,
        conflict: Option<ConflictKind>,
    ) -> StepResult<SyncOperation> {
        let tree = self.tree(side);
        let origin = tree
            .node(node)
            .move_origin
            .clone()
            .ok_or_else(|| data_error("move undo without an origin path"))?;
        let origin_parent_path = origin.parent().map(Path::to_path_buf).unwrap_or_default();
        let origin_name = origin
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| data_error("move origin has no file name"))?;

        let origin_parent = tree.by_path(&origin_parent_path);

        let mut undo_possible = true;
        match origin_parent {
            None => undo_possible = false,
            Some(parent) => {
                if tree.is_ancestor(node, parent)
                    || tree.node(parent).has_event(FsOpType::Delete)
                {
                    undo_possible = false;
                } else if let Some(occupant) =
                    tree.child_by_name_except(parent, origin_name, FsOpType::Delete)
                {
                    if occupant != node
                        && (tree.node(occupant).has_event(FsOpType::Create)
                            || tree.node(occupant).has_event(FsOpType::Move))
                    {
                        undo_possible = false;
                    }
                }
            }
        }

        let dest_path = if undo_possible {
            origin.clone()
        } else {
            warn!(origin = %origin.display(), "Origin unavailable, parking at the root");
            let base_name = tree.node(node).name.clone();
            let (dest_parent, name) =
                self.conflicted_placement(tree, tree.root(), &base_name, SuffixKind::Conflict)?;
            dest_parent.join(name)
        };

        let n = tree.node(node);
        let mut op = SyncOperation::new(FsOpType::Move, side, n.node_type);
        op.db_id = n.db_id;
        op.target_id = n.node_id.clone();
        op.origin_path = Some(tree.path_of(node));
        op.dest_path = dest_path;
        op.source_path = tree.path_of(node);
        op.conflict = conflict;
        Ok(op)
    }

    // ------------------------------------------------------------------
    // Naming
    // ------------------------------------------------------------------

    /// Chooses the parent and suffixed name for a renamed-aside node.
    ///
    /// The name stays unique among the parent's children; when the absolute
    /// local path would overflow the platform maximum, the node is reparented
    /// to the sync root. A node already at the root that still overflows is
    /// an `InvalidName` failure, not a truncation.
    fn conflicted_placement(
        &self,
        tree: &UpdateTree,
        parent: NodeRef,
        base_name: &str,
        kind: SuffixKind,
    ) -> StepResult<(PathBuf, String)> {
        let now = Utc::now();

        let name_for = |parent: NodeRef| {
            self.namer.apply_unique(base_name, kind, now, |candidate| {
                tree.child_by_name(parent, candidate).is_some()
            })
        };

        let name = name_for(parent);
        let parent_path = tree.path_of(parent);
        let abs_len = self
            .local_root
            .join(&parent_path)
            .join(&name)
            .as_os_str()
            .len();
        if abs_len <= MAX_PATH_LENGTH {
            return Ok((parent_path, name));
        }

        if parent == tree.root() {
            return Err(StepError::system(
                ExitCause::InvalidName,
                format!("conflict name for {base_name:?} overflows the platform path maximum"),
            ));
        }

        let name = name_for(tree.root());
        let abs_len = self.local_root.join(&name).as_os_str().len();
        if abs_len > MAX_PATH_LENGTH {
            return Err(StepError::system(
                ExitCause::InvalidName,
                format!("conflict name for {base_name:?} overflows the platform path maximum"),
            ));
        }
        Ok((PathBuf::new(), name))
    }

    async fn collect_db_subtree(
        &self,
        root: DbNodeId,
    ) -> StepResult<Vec<pairdrive_store::NodeRecord>> {
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(current) = stack.pop() {
            let children = self
                .db
                .children(current)
                .await
                .map_err(|e| StepError::data(ExitCause::Unknown, e.to_string()))?;
            for child in children {
                stack.push(child.db_id);
                out.push(child);
            }
        }
        Ok(out)
    }
}

fn data_error(message: &str) -> StepError {
    StepError::new(ExitCode::DataError, ExitCause::Unknown, message)
}
