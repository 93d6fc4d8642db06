//! Operation generator
//!
//! Breadth-first walk of both update trees emitting one [`SyncOperation`]
//! per change event. Same-intent changes on both sides collapse into
//! database-only updates (`omit`); a parent's delete subsumes its subtree;
//! a node carrying both an edit and a move stays partially processed until
//! both are emitted.

use std::collections::{HashSet, VecDeque};

use tracing::{debug, info};

use pairdrive_core::domain::{
    DbNodeId, ExitCause, FsOpType, NodeType, ReplicaSide, StepError, StepResult,
};

use crate::op::{SyncOperation, SyncOperationList};
use crate::tree::{corresponding_node, NodeRef, NodeStatus, UpdateTree};

/// Result of a generation run
#[derive(Debug, Default)]
pub struct GeneratorOutput {
    /// The pass must restart after execution (a both-sided delete collapsed).
    pub restart: bool,
    /// Bytes the executor will download to the local replica.
    pub bytes_to_download: i64,
}

/// Emits operations for the non-conflicting changes of both trees
pub struct OpGenerator {
    virtual_files: bool,
    free_space_floor: u64,
}

impl OpGenerator {
    pub fn new(virtual_files: bool, free_space_floor: u64) -> Self {
        Self {
            virtual_files,
            free_space_floor,
        }
    }

    /// Walks both trees and fills `ops`.
    ///
    /// `local_free_space` is the currently available byte count on the local
    /// filesystem; on a non-virtual sync the generator refuses to plan more
    /// downloads than the disk can take.
    pub fn generate(
        &self,
        local: &mut UpdateTree,
        remote: &mut UpdateTree,
        local_free_space: Option<u64>,
        ops: &mut SyncOperationList,
    ) -> StepResult<GeneratorOutput> {
        local.mark_all_unprocessed();
        remote.mark_all_unprocessed();

        let mut output = GeneratorOutput::default();
        let mut deleted: HashSet<DbNodeId> = HashSet::new();

        self.walk(local, remote, &mut deleted, &mut output, ops)?;
        self.walk(remote, local, &mut deleted, &mut output, ops)?;

        if !self.virtual_files && output.bytes_to_download > 0 {
            if let Some(free) = local_free_space {
                let needed = output.bytes_to_download as u64 + self.free_space_floor;
                if free < needed {
                    return Err(StepError::system(
                        ExitCause::NotEnoughDiskSpace,
                        format!(
                            "{} B free, {} B needed for planned downloads",
                            free, needed
                        ),
                    ));
                }
            }
        }

        info!(
            ops = ops.len(),
            bytes_to_download = output.bytes_to_download,
            "Operations generated"
        );
        Ok(output)
    }

    fn walk(
        &self,
        tree: &mut UpdateTree,
        other: &mut UpdateTree,
        deleted: &mut HashSet<DbNodeId>,
        output: &mut GeneratorOutput,
        ops: &mut SyncOperationList,
    ) -> StepResult<()> {
        let mut queue: VecDeque<NodeRef> = VecDeque::new();
        queue.push_back(tree.root());

        while let Some(current) = queue.pop_front() {
            // children are explored even when the node itself is done
            for &child in tree.node(current).children() {
                if !tree.node(child).dead {
                    queue.push_back(child);
                }
            }

            if current == tree.root() || tree.node(current).status == NodeStatus::Processed {
                continue;
            }
            if tree.node(current).events.is_empty() {
                tree.node_mut(current).status = NodeStatus::Processed;
                continue;
            }

            let corresponding = corresponding_node(tree, current, other);
            let node = tree.node(current);
            if corresponding.is_none()
                && !node.has_event(FsOpType::Create)
                && (node.has_event(FsOpType::Delete)
                    || node.has_event(FsOpType::Edit)
                    || node.has_event(FsOpType::Move))
            {
                return Err(StepError::data(
                    ExitCause::Unknown,
                    format!("no corresponding node for {:?}", node.name),
                ));
            }

            if tree.node(current).has_event(FsOpType::Create) {
                self.generate_create(tree, current, other, corresponding, output, ops);
            }
            if tree.node(current).has_event(FsOpType::Delete)
                && tree.node(current).status != NodeStatus::Processed
            {
                self.generate_delete(tree, current, other, corresponding, deleted, output, ops);
            }
            if tree.node(current).has_event(FsOpType::Edit)
                && tree.node(current).status != NodeStatus::Processed
            {
                self.generate_edit(tree, current, other, corresponding, output, ops);
            }
            if tree.node(current).has_event(FsOpType::Move)
                && tree.node(current).status != NodeStatus::Processed
            {
                self.generate_move(tree, current, other, corresponding, ops);
            }
        }
        Ok(())
    }

    fn generate_create(
        &self,
        tree: &mut UpdateTree,
        current: NodeRef,
        other: &mut UpdateTree,
        corresponding: Option<NodeRef>,
        output: &mut GeneratorOutput,
        ops: &mut SyncOperationList,
    ) {
        let target_side = tree.side().opposite();
        let node = tree.node(current);

        let mut op = SyncOperation::new(FsOpType::Create, target_side, node.node_type);
        op.source_id = node.node_id.clone();
        op.source_path = tree.path_of(current);
        op.dest_path = self.target_path(tree, current, target_side);
        op.size = node.size;
        op.content_hash = node.content_hash.clone();
        op.created_at = node.created_at;
        op.modified_at = node.modified_at;
        if target_side == ReplicaSide::Local && node.valid_local_name.is_some() {
            op.db_name = Some(node.name.clone());
        }

        // identical create on the other side collapses to a DB write
        if let Some(corr) = corresponding {
            if other.node(corr).has_event(FsOpType::Create)
                && identical_nodes(tree, current, other, corr)
            {
                op.omit = true;
                op.target_id = other.node(corr).node_id.clone();
                other.node_mut(corr).status = NodeStatus::Processed;
                debug!(path = %op.source_path.display(), "Create-Create pseudo-conflict, DB only");
            }
        }

        if !op.omit
            && target_side == ReplicaSide::Local
            && tree.node(current).node_type == NodeType::File
            && !self.virtual_files
        {
            output.bytes_to_download += tree.node(current).size as i64;
        }

        tree.node_mut(current).status = NodeStatus::Processed;
        ops.push(op);
    }

    #[allow(clippy::too_many_arguments)]
    fn generate_delete(
        &self,
        tree: &mut UpdateTree,
        current: NodeRef,
        other: &mut UpdateTree,
        corresponding: Option<NodeRef>,
        deleted: &mut HashSet<DbNodeId>,
        output: &mut GeneratorOutput,
        ops: &mut SyncOperationList,
    ) {
        // the parent's delete already subsumes this subtree
        if let Some(parent) = tree.node(current).parent() {
            if let Some(parent_db) = tree.node(parent).db_id {
                if deleted.contains(&parent_db) {
                    tree.node_mut(current).status = NodeStatus::Processed;
                    return;
                }
            }
        }

        let Some(corr) = corresponding else {
            return;
        };

        let mut op = SyncOperation::new(
            FsOpType::Delete,
            other.side(),
            tree.node(current).node_type,
        );
        op.db_id = tree.node(current).db_id;
        op.source_id = tree.node(current).node_id.clone();
        op.target_id = other.node(corr).node_id.clone();
        op.source_path = tree.path_of(current);
        op.dest_path = other.path_of(corr);

        // both sides deleted it: nothing to do on either replica, but the
        // next pass must run to pick up whatever replaced it
        if other.node(corr).has_event(FsOpType::Delete) {
            op.omit = true;
            output.restart = true;
            debug!(path = %op.source_path.display(), "Delete-Delete collapse, DB only");
        }

        // the subtree is covered by this one operation
        for descendant in tree.descendants(current) {
            tree.node_mut(descendant).status = NodeStatus::Processed;
        }
        for descendant in other.descendants(corr) {
            other.node_mut(descendant).status = NodeStatus::Processed;
        }
        tree.node_mut(current).status = NodeStatus::Processed;
        other.node_mut(corr).status = NodeStatus::Processed;

        if let Some(db_id) = tree.node(current).db_id {
            deleted.insert(db_id);
        }
        ops.push(op);
    }

    fn generate_edit(
        &self,
        tree: &mut UpdateTree,
        current: NodeRef,
        other: &mut UpdateTree,
        corresponding: Option<NodeRef>,
        output: &mut GeneratorOutput,
        ops: &mut SyncOperationList,
    ) {
        let Some(corr) = corresponding else {
            return;
        };
        let target_side = other.side();

        let mut op = SyncOperation::new(FsOpType::Edit, target_side, tree.node(current).node_type);
        op.db_id = tree.node(current).db_id;
        op.source_id = tree.node(current).node_id.clone();
        op.target_id = other.node(corr).node_id.clone();
        op.source_path = tree.path_of(current);
        op.dest_path = self.target_path(tree, current, target_side);
        op.size = tree.node(current).size;
        op.content_hash = tree.node(current).content_hash.clone();
        op.modified_at = tree.node(current).modified_at;

        // same content reached on both sides: DB reconciliation only
        if other.node(corr).has_event(FsOpType::Edit)
            && identical_nodes(tree, current, other, corr)
        {
            op.omit = true;
            other.node_mut(corr).status = NodeStatus::Processed;
            debug!(path = %op.source_path.display(), "Edit-Edit pseudo-conflict, DB only");
        }

        if !op.omit
            && target_side == ReplicaSide::Local
            && tree.node(current).node_type == NodeType::File
            && !self.virtual_files
        {
            let diff = tree.node(current).size as i64 - other.node(corr).size as i64;
            output.bytes_to_download += diff;
        }

        let status = if tree.node(current).has_event(FsOpType::Move)
            && tree.node(current).status == NodeStatus::Unprocessed
        {
            NodeStatus::PartiallyProcessed
        } else {
            NodeStatus::Processed
        };
        tree.node_mut(current).status = status;
        ops.push(op);
    }

    fn generate_move(
        &self,
        tree: &mut UpdateTree,
        current: NodeRef,
        other: &mut UpdateTree,
        corresponding: Option<NodeRef>,
        ops: &mut SyncOperationList,
    ) {
        let Some(corr) = corresponding else {
            return;
        };
        let target_side = other.side();

        let mut op = SyncOperation::new(FsOpType::Move, target_side, tree.node(current).node_type);
        op.db_id = tree.node(current).db_id;
        op.source_id = tree.node(current).node_id.clone();
        op.target_id = other.node(corr).node_id.clone();
        op.source_path = tree.path_of(current);
        op.origin_path = Some(other.path_of(corr));
        op.dest_path = self.target_path(tree, current, target_side);
        op.size = tree.node(current).size;
        op.modified_at = tree.node(current).modified_at;
        if target_side == ReplicaSide::Local && tree.node(current).valid_local_name.is_some() {
            op.db_name = Some(tree.node(current).name.clone());
        }

        // identical move on both sides: DB reconciliation only
        if other.node(corr).has_event(FsOpType::Move)
            && tree.path_of(current) == other.path_of(corr)
        {
            op.omit = true;
            other.node_mut(corr).status = NodeStatus::Processed;
            debug!(path = %op.source_path.display(), "Move-Move pseudo-conflict, DB only");
        }

        let status = if tree.node(current).has_event(FsOpType::Edit)
            && tree.node(current).status == NodeStatus::Unprocessed
        {
            NodeStatus::PartiallyProcessed
        } else {
            NodeStatus::Processed
        };
        tree.node_mut(current).status = status;
        ops.push(op);
    }

    /// Path the operation produces on the target side; the substitute name
    /// applies only when the target is the local replica.
    fn target_path(
        &self,
        tree: &UpdateTree,
        current: NodeRef,
        target_side: ReplicaSide,
    ) -> std::path::PathBuf {
        let parent_path = tree
            .node(current)
            .parent()
            .map(|p| tree.path_of(p))
            .unwrap_or_default();
        let name = match target_side {
            ReplicaSide::Local => tree.node(current).final_local_name(),
            ReplicaSide::Remote => &tree.node(current).name,
        };
        parent_path.join(name)
    }
}

/// Same type, and for files the same content fingerprint.
fn identical_nodes(a: &UpdateTree, l: NodeRef, b: &UpdateTree, r: NodeRef) -> bool {
    let (ln, rn) = (a.node(l), b.node(r));
    if ln.node_type != rn.node_type {
        return false;
    }
    if ln.node_type == NodeType::Directory {
        return a.path_of(l) == b.path_of(r);
    }
    match (&ln.content_hash, &rn.content_hash) {
        (Some(lh), Some(rh)) => lh == rh && ln.size == rn.size,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pairdrive_core::domain::NodeId;
    use std::path::Path;

    use crate::tree::make_node;

    fn trees() -> (UpdateTree, UpdateTree) {
        (
            UpdateTree::new(ReplicaSide::Local, 1, NodeId::new("lroot")),
            UpdateTree::new(ReplicaSide::Remote, 1, NodeId::new("rroot")),
        )
    }

    fn generate(local: &mut UpdateTree, remote: &mut UpdateTree) -> (Vec<SyncOperation>, GeneratorOutput) {
        let mut ops = SyncOperationList::new();
        let output = OpGenerator::new(false, 0)
            .generate(local, remote, None, &mut ops)
            .unwrap();
        (ops.into_vec(), output)
    }

    #[test]
    fn test_local_create_targets_remote() {
        let (mut local, mut remote) = trees();
        let root = local.root();
        let f = local.insert(
            root,
            make_node(None, Some(NodeId::new("lf")), "new.txt", NodeType::File),
        );
        local.node_mut(f).events.insert(FsOpType::Create);
        local.node_mut(f).size = 42;

        let (ops, output) = generate(&mut local, &mut remote);

        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].kind, FsOpType::Create);
        assert_eq!(ops[0].target_side, ReplicaSide::Remote);
        assert!(!ops[0].omit);
        assert_eq!(ops[0].dest_path, Path::new("new.txt"));
        // uploads don't consume local disk
        assert_eq!(output.bytes_to_download, 0);
    }

    #[test]
    fn test_remote_create_accumulates_download_budget() {
        let (mut local, mut remote) = trees();
        let root = remote.root();
        let f = remote.insert(
            root,
            make_node(None, Some(NodeId::new("rf")), "big.bin", NodeType::File),
        );
        remote.node_mut(f).events.insert(FsOpType::Create);
        remote.node_mut(f).size = 1000;

        let (ops, output) = generate(&mut local, &mut remote);

        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].target_side, ReplicaSide::Local);
        assert_eq!(output.bytes_to_download, 1000);
    }

    #[test]
    fn test_identical_create_collapses_to_db_write() {
        let (mut local, mut remote) = trees();
        let root_l = local.root();
        let root_r = remote.root();

        let l = local.insert(
            root_l,
            make_node(None, Some(NodeId::new("lf")), "same.txt", NodeType::File),
        );
        local.node_mut(l).events.insert(FsOpType::Create);
        local.node_mut(l).content_hash = Some("h".to_string());
        local.node_mut(l).size = 5;

        let r = remote.insert(
            root_r,
            make_node(None, Some(NodeId::new("rf")), "same.txt", NodeType::File),
        );
        remote.node_mut(r).events.insert(FsOpType::Create);
        remote.node_mut(r).content_hash = Some("h".to_string());
        remote.node_mut(r).size = 5;

        let (ops, output) = generate(&mut local, &mut remote);

        assert_eq!(ops.len(), 1);
        assert!(ops[0].omit);
        assert_eq!(ops[0].target_id, Some(NodeId::new("rf")));
        assert_eq!(output.bytes_to_download, 0);
    }

    #[test]
    fn test_identical_edit_is_db_only() {
        let (mut local, mut remote) = trees();
        let root_l = local.root();
        let root_r = remote.root();

        let l = local.insert(
            root_l,
            make_node(Some(7), Some(NodeId::new("lf")), "f.txt", NodeType::File),
        );
        local.node_mut(l).events.insert(FsOpType::Edit);
        local.node_mut(l).content_hash = Some("h2".to_string());
        local.node_mut(l).size = 10;

        let r = remote.insert(
            root_r,
            make_node(Some(7), Some(NodeId::new("rf")), "f.txt", NodeType::File),
        );
        remote.node_mut(r).events.insert(FsOpType::Edit);
        remote.node_mut(r).content_hash = Some("h2".to_string());
        remote.node_mut(r).size = 10;

        let (ops, _) = generate(&mut local, &mut remote);

        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].kind, FsOpType::Edit);
        assert!(ops[0].omit);
    }

    #[test]
    fn test_parent_delete_subsumes_children() {
        let (mut local, mut remote) = trees();
        let root_l = local.root();
        let root_r = remote.root();

        let a_l = local.insert(
            root_l,
            make_node(Some(2), Some(NodeId::new("la")), "A", NodeType::Directory),
        );
        local.node_mut(a_l).events.insert(FsOpType::Delete);
        let f_l = local.insert(
            a_l,
            make_node(Some(3), Some(NodeId::new("lf")), "f.txt", NodeType::File),
        );
        local.node_mut(f_l).events.insert(FsOpType::Delete);

        let a_r = remote.insert(
            root_r,
            make_node(Some(2), Some(NodeId::new("ra")), "A", NodeType::Directory),
        );
        remote.insert(
            a_r,
            make_node(Some(3), Some(NodeId::new("rf")), "f.txt", NodeType::File),
        );

        let (ops, _) = generate(&mut local, &mut remote);

        // one delete for the subtree root only
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].kind, FsOpType::Delete);
        assert_eq!(ops[0].db_id, Some(2));
        assert_eq!(ops[0].target_side, ReplicaSide::Remote);
    }

    #[test]
    fn test_move_and_edit_both_emitted() {
        let (mut local, mut remote) = trees();
        let root_l = local.root();
        let root_r = remote.root();

        let l = local.insert(
            root_l,
            make_node(Some(5), Some(NodeId::new("lf")), "renamed.txt", NodeType::File),
        );
        local.node_mut(l).events.insert(FsOpType::Move);
        local.node_mut(l).events.insert(FsOpType::Edit);
        local.node_mut(l).move_origin = Some("f.txt".into());
        local.node_mut(l).content_hash = Some("h2".to_string());

        remote.insert(
            root_r,
            make_node(Some(5), Some(NodeId::new("rf")), "f.txt", NodeType::File),
        );

        let (ops, _) = generate(&mut local, &mut remote);

        assert_eq!(ops.len(), 2);
        // fixed per-node order: edit before move
        assert_eq!(ops[0].kind, FsOpType::Edit);
        assert_eq!(ops[1].kind, FsOpType::Move);
        assert_eq!(ops[1].origin_path.as_deref(), Some(Path::new("f.txt")));
        assert_eq!(ops[1].dest_path, Path::new("renamed.txt"));
        assert_eq!(local.node(l).status, NodeStatus::Processed);
    }

    #[test]
    fn test_delete_delete_collapse_requests_restart() {
        let (mut local, mut remote) = trees();
        let root_l = local.root();
        let root_r = remote.root();

        let l = local.insert(
            root_l,
            make_node(Some(4), Some(NodeId::new("lf")), "f.txt", NodeType::File),
        );
        local.node_mut(l).events.insert(FsOpType::Delete);
        let r = remote.insert(
            root_r,
            make_node(Some(4), Some(NodeId::new("rf")), "f.txt", NodeType::File),
        );
        remote.node_mut(r).events.insert(FsOpType::Delete);

        let (ops, output) = generate(&mut local, &mut remote);

        assert_eq!(ops.len(), 1);
        assert!(ops[0].omit);
        assert!(output.restart);
    }

    #[test]
    fn test_substitute_name_used_for_local_target() {
        let (mut local, mut remote) = trees();
        let root_r = remote.root();
        let _ = local;

        let r = remote.insert(
            root_r,
            make_node(None, Some(NodeId::new("rf")), "bad:name.txt", NodeType::File),
        );
        remote.node_mut(r).events.insert(FsOpType::Create);
        remote.node_mut(r).valid_local_name = Some("bad_name.txt".to_string());

        let mut ops = SyncOperationList::new();
        OpGenerator::new(false, 0)
            .generate(&mut local, &mut remote, None, &mut ops)
            .unwrap();
        let ops = ops.into_vec();

        assert_eq!(ops[0].dest_path, Path::new("bad_name.txt"));
        assert_eq!(ops[0].source_path, Path::new("bad:name.txt"));
    }

    #[test]
    fn test_disk_space_floor_enforced() {
        let (mut local, mut remote) = trees();
        let root_r = remote.root();

        let r = remote.insert(
            root_r,
            make_node(None, Some(NodeId::new("rf")), "big.bin", NodeType::File),
        );
        remote.node_mut(r).events.insert(FsOpType::Create);
        remote.node_mut(r).size = 10_000;

        let mut ops = SyncOperationList::new();
        let err = OpGenerator::new(false, 1_000_000)
            .generate(&mut local, &mut remote, Some(500_000), &mut ops)
            .unwrap_err();
        assert_eq!(err.cause, ExitCause::NotEnoughDiskSpace);
    }

    #[test]
    fn test_virtual_mode_skips_disk_budget() {
        let (mut local, mut remote) = trees();
        let root_r = remote.root();

        let r = remote.insert(
            root_r,
            make_node(None, Some(NodeId::new("rf")), "big.bin", NodeType::File),
        );
        remote.node_mut(r).events.insert(FsOpType::Create);
        remote.node_mut(r).size = 10_000;

        let mut ops = SyncOperationList::new();
        let output = OpGenerator::new(true, 1_000_000)
            .generate(&mut local, &mut remote, Some(500_000), &mut ops)
            .unwrap();
        assert_eq!(output.bytes_to_download, 0);
    }

    #[test]
    fn test_convergent_trees_emit_nothing() {
        let (mut local, mut remote) = trees();
        let root_l = local.root();
        let root_r = remote.root();

        local.insert(
            root_l,
            make_node(Some(2), Some(NodeId::new("la")), "A", NodeType::Directory),
        );
        remote.insert(
            root_r,
            make_node(Some(2), Some(NodeId::new("ra")), "A", NodeType::Directory),
        );

        let (ops, output) = generate(&mut local, &mut remote);
        assert!(ops.is_empty());
        assert!(!output.restart);
    }
}
