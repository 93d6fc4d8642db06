//! Conflict finder
//!
//! Walks the paired update trees and enumerates every conflict from the
//! closed taxonomy. Same-intent changes on both sides (identical create,
//! identical edit, identical move) are not conflicts; the operation generator
//! collapses them to database-only updates.

use tracing::{debug, info};

use pairdrive_core::domain::{FsOpType, NodeType, ReplicaSide};

use crate::conflict::{Conflict, ConflictKind, ConflictQueue};
use crate::tree::{corresponding_node, NodeRef, UpdateTree};

/// Enumerates conflicts between the two update trees
pub struct ConflictFinder<'a> {
    local: &'a UpdateTree,
    remote: &'a UpdateTree,
}

impl<'a> ConflictFinder<'a> {
    pub fn new(local: &'a UpdateTree, remote: &'a UpdateTree) -> Self {
        Self { local, remote }
    }

    pub fn find(&self) -> ConflictQueue {
        let mut queue = ConflictQueue::new();

        self.find_create_create(&mut queue);
        self.find_edit_edit(&mut queue);
        self.find_move_create(&mut queue);
        self.find_move_move_dest(&mut queue);
        self.find_edit_delete(&mut queue);
        self.find_move_delete(&mut queue);
        self.find_parent_delete(&mut queue);
        self.find_move_move_source(&mut queue);
        self.find_move_move_cycle(&mut queue);

        if !queue.is_empty() {
            info!(conflicts = queue.len(), "Conflicts detected");
        }
        queue
    }

    fn tree(&self, side: ReplicaSide) -> &UpdateTree {
        match side {
            ReplicaSide::Local => self.local,
            ReplicaSide::Remote => self.remote,
        }
    }

    fn push(&self, queue: &mut ConflictQueue, kind: ConflictKind, local: NodeRef, remote: NodeRef) {
        debug!(
            kind = kind.as_str(),
            local_name = %self.local.node(local).name,
            remote_name = %self.remote.node(remote).name,
            "Conflict found"
        );
        queue.push(Conflict {
            kind,
            local,
            remote,
        });
    }

    /// Same path, both created, not the same content.
    fn find_create_create(&self, queue: &mut ConflictQueue) {
        for l in self.nodes_with(self.local, FsOpType::Create) {
            let path = self.local.path_of(l);
            let Some(r) = self.remote.by_path(&path) else {
                continue;
            };
            if !self.remote.node(r).has_event(FsOpType::Create) {
                continue;
            }
            if identical_create(self.local, l, self.remote, r) {
                continue; // pseudo-conflict
            }
            self.push(queue, ConflictKind::CreateCreate, l, r);
        }
    }

    /// Same id edited on both sides with diverging content.
    fn find_edit_edit(&self, queue: &mut ConflictQueue) {
        for l in self.nodes_with(self.local, FsOpType::Edit) {
            let Some(r) = corresponding_node(self.local, l, self.remote) else {
                continue;
            };
            if !self.remote.node(r).has_event(FsOpType::Edit) {
                continue;
            }
            if same_content(self.local, l, self.remote, r) {
                continue; // pseudo-conflict
            }
            self.push(queue, ConflictKind::EditEdit, l, r);
        }
    }

    /// A move lands on a path the other side created.
    fn find_move_create(&self, queue: &mut ConflictQueue) {
        for side in [ReplicaSide::Local, ReplicaSide::Remote] {
            let tree = self.tree(side);
            let other = self.tree(side.opposite());
            for m in self.nodes_with(tree, FsOpType::Move) {
                let dest = tree.path_of(m);
                let Some(c) = other.by_path(&dest) else {
                    continue;
                };
                if !other.node(c).has_event(FsOpType::Create) {
                    continue;
                }
                let (local, remote) = match side {
                    ReplicaSide::Local => (m, c),
                    ReplicaSide::Remote => (c, m),
                };
                self.push(queue, ConflictKind::MoveCreate, local, remote);
            }
        }
    }

    /// Two different nodes moved to the same destination path.
    fn find_move_move_dest(&self, queue: &mut ConflictQueue) {
        for l in self.nodes_with(self.local, FsOpType::Move) {
            for r in self.nodes_with(self.remote, FsOpType::Move) {
                if self.local.node(l).db_id == self.remote.node(r).db_id {
                    continue;
                }
                if self.local.path_of(l) == self.remote.path_of(r) {
                    self.push(queue, ConflictKind::MoveMoveDest, l, r);
                }
            }
        }
    }

    /// Edit on one side, the entity (or its subtree) deleted on the other.
    fn find_edit_delete(&self, queue: &mut ConflictQueue) {
        for side in [ReplicaSide::Local, ReplicaSide::Remote] {
            let tree = self.tree(side);
            let other = self.tree(side.opposite());
            for e in self.nodes_with(tree, FsOpType::Edit) {
                if tree.node(e).has_event(FsOpType::Delete) {
                    continue;
                }
                let Some(corr) = corresponding_node(tree, e, other) else {
                    continue;
                };
                // pair with the nearest deleted node so the resolver can ask
                // whether its parent is deleted too
                let Some(d) = nearest_deleted(other, corr) else {
                    continue;
                };
                let (local, remote) = match side {
                    ReplicaSide::Local => (e, d),
                    ReplicaSide::Remote => (d, e),
                };
                self.push(queue, ConflictKind::EditDelete, local, remote);
            }
        }
    }

    /// Move on one side, the entity (or its subtree) deleted on the other.
    fn find_move_delete(&self, queue: &mut ConflictQueue) {
        for side in [ReplicaSide::Local, ReplicaSide::Remote] {
            let tree = self.tree(side);
            let other = self.tree(side.opposite());
            for m in self.nodes_with(tree, FsOpType::Move) {
                if tree.node(m).has_event(FsOpType::Delete) {
                    continue;
                }
                let Some(corr) = corresponding_node(tree, m, other) else {
                    continue;
                };
                let Some(d) = topmost_deleted(other, corr) else {
                    continue;
                };
                let (local, remote) = match side {
                    ReplicaSide::Local => (m, d),
                    ReplicaSide::Remote => (d, m),
                };
                self.push(queue, ConflictKind::MoveDelete, local, remote);
            }
        }
    }

    /// Move or create whose target parent was deleted on the other side.
    fn find_parent_delete(&self, queue: &mut ConflictQueue) {
        for side in [ReplicaSide::Local, ReplicaSide::Remote] {
            let tree = self.tree(side);
            let other = self.tree(side.opposite());
            for (kind, event) in [
                (ConflictKind::MoveParentDelete, FsOpType::Move),
                (ConflictKind::CreateParentDelete, FsOpType::Create),
            ] {
                for n in self.nodes_with(tree, event) {
                    let Some(parent) = tree.node(n).parent() else {
                        continue;
                    };
                    // a rename in place is not a move into a parent
                    if event == FsOpType::Move {
                        let origin_parent = tree
                            .node(n)
                            .move_origin
                            .as_deref()
                            .and_then(|o| o.parent())
                            .map(|p| p.to_path_buf())
                            .unwrap_or_default();
                        if origin_parent == tree.path_of(parent) {
                            continue;
                        }
                    }
                    let Some(corr_parent) = corresponding_node(tree, parent, other) else {
                        continue;
                    };
                    if !other.node(corr_parent).has_event(FsOpType::Delete) {
                        continue;
                    }
                    let (local, remote) = match side {
                        ReplicaSide::Local => (n, corr_parent),
                        ReplicaSide::Remote => (corr_parent, n),
                    };
                    self.push(queue, kind, local, remote);
                }
            }
        }
    }

    /// Same id moved on both sides to different places.
    fn find_move_move_source(&self, queue: &mut ConflictQueue) {
        for l in self.nodes_with(self.local, FsOpType::Move) {
            let Some(r) = corresponding_node(self.local, l, self.remote) else {
                continue;
            };
            if !self.remote.node(r).has_event(FsOpType::Move) {
                continue;
            }
            if self.local.path_of(l) == self.remote.path_of(r) {
                continue; // identical move, pseudo-conflict
            }
            self.push(queue, ConflictKind::MoveMoveSource, l, r);
        }
    }

    /// Local moved X below Y while remote moved Y below X.
    fn find_move_move_cycle(&self, queue: &mut ConflictQueue) {
        for l in self.nodes_with(self.local, FsOpType::Move) {
            let Some(l_db) = self.local.node(l).db_id else {
                continue;
            };
            for r in self.nodes_with(self.remote, FsOpType::Move) {
                let Some(r_db) = self.remote.node(r).db_id else {
                    continue;
                };
                if l_db == r_db {
                    continue;
                }
                let Some(other_in_local) = self.local.by_db_id(r_db) else {
                    continue;
                };
                let Some(other_in_remote) = self.remote.by_db_id(l_db) else {
                    continue;
                };
                if self.local.is_ancestor(other_in_local, l)
                    && self.remote.is_ancestor(other_in_remote, r)
                {
                    self.push(queue, ConflictKind::MoveMoveCycle, l, r);
                }
            }
        }
    }

    fn nodes_with<'t>(
        &self,
        tree: &'t UpdateTree,
        event: FsOpType,
    ) -> impl Iterator<Item = NodeRef> + 't {
        tree.refs().filter(move |&r| tree.node(r).has_event(event))
    }
}

/// The highest ancestor of `r` (itself included) carrying a delete event.
///
/// Move-Delete pairs with the root of the deleted subtree so the resolver
/// can scan the whole subtree for orphans.
fn topmost_deleted(tree: &UpdateTree, r: NodeRef) -> Option<NodeRef> {
    let mut found = None;
    let mut current = Some(r);
    while let Some(c) = current {
        if tree.node(c).has_event(FsOpType::Delete) {
            found = Some(c);
        }
        current = tree.node(c).parent();
    }
    found
}

/// The closest node on the parent chain of `r` (itself included) carrying a
/// delete event.
fn nearest_deleted(tree: &UpdateTree, r: NodeRef) -> Option<NodeRef> {
    let mut current = Some(r);
    while let Some(c) = current {
        if tree.node(c).has_event(FsOpType::Delete) {
            return Some(c);
        }
        current = tree.node(c).parent();
    }
    None
}

fn identical_create(a: &UpdateTree, l: NodeRef, b: &UpdateTree, r: NodeRef) -> bool {
    let (ln, rn) = (a.node(l), b.node(r));
    if ln.node_type != rn.node_type {
        return false;
    }
    if ln.node_type == NodeType::Directory {
        return true;
    }
    same_content(a, l, b, r)
}

fn same_content(a: &UpdateTree, l: NodeRef, b: &UpdateTree, r: NodeRef) -> bool {
    let (ln, rn) = (a.node(l), b.node(r));
    match (&ln.content_hash, &rn.content_hash) {
        (Some(lh), Some(rh)) => lh == rh && ln.size == rn.size,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pairdrive_core::domain::NodeId;
    use std::path::PathBuf;

    use crate::tree::make_node;

    fn trees() -> (UpdateTree, UpdateTree) {
        (
            UpdateTree::new(ReplicaSide::Local, 1, NodeId::new("lroot")),
            UpdateTree::new(ReplicaSide::Remote, 1, NodeId::new("rroot")),
        )
    }

    fn add_file(
        tree: &mut UpdateTree,
        parent: NodeRef,
        db_id: Option<i64>,
        id: &str,
        name: &str,
        event: Option<FsOpType>,
    ) -> NodeRef {
        let r = tree.insert(
            parent,
            make_node(db_id, Some(NodeId::new(id)), name, NodeType::File),
        );
        if let Some(event) = event {
            tree.node_mut(r).events.insert(event);
        }
        r
    }

    fn add_dir(
        tree: &mut UpdateTree,
        parent: NodeRef,
        db_id: Option<i64>,
        id: &str,
        name: &str,
        event: Option<FsOpType>,
    ) -> NodeRef {
        let r = tree.insert(
            parent,
            make_node(db_id, Some(NodeId::new(id)), name, NodeType::Directory),
        );
        if let Some(event) = event {
            tree.node_mut(r).events.insert(event);
        }
        r
    }

    #[test]
    fn test_create_create_same_name_different_content() {
        let (mut local, mut remote) = trees();
        let root_l = local.root();
        let root_r = remote.root();
        let l = add_file(&mut local, root_l, None, "l1", "report.pdf", Some(FsOpType::Create));
        local.node_mut(l).content_hash = Some("ha".to_string());
        let r = add_file(&mut remote, root_r, None, "r1", "report.pdf", Some(FsOpType::Create));
        remote.node_mut(r).content_hash = Some("hb".to_string());

        let queue = ConflictFinder::new(&local, &remote).find();
        let mut queue = queue;
        let conflict = queue.pop().unwrap();
        assert_eq!(conflict.kind, ConflictKind::CreateCreate);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_identical_create_is_not_a_conflict() {
        let (mut local, mut remote) = trees();
        let root_l = local.root();
        let root_r = remote.root();
        let l = add_file(&mut local, root_l, None, "l1", "report.pdf", Some(FsOpType::Create));
        local.node_mut(l).content_hash = Some("same".to_string());
        local.node_mut(l).size = 10;
        let r = add_file(&mut remote, root_r, None, "r1", "report.pdf", Some(FsOpType::Create));
        remote.node_mut(r).content_hash = Some("same".to_string());
        remote.node_mut(r).size = 10;

        let queue = ConflictFinder::new(&local, &remote).find();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_edit_edit_diverging() {
        let (mut local, mut remote) = trees();
        let root_l = local.root();
        let root_r = remote.root();
        let l = add_file(&mut local, root_l, Some(7), "lf", "f.txt", Some(FsOpType::Edit));
        local.node_mut(l).content_hash = Some("ha".to_string());
        let r = add_file(&mut remote, root_r, Some(7), "rf", "f.txt", Some(FsOpType::Edit));
        remote.node_mut(r).content_hash = Some("hb".to_string());

        let mut queue = ConflictFinder::new(&local, &remote).find();
        assert_eq!(queue.pop().unwrap().kind, ConflictKind::EditEdit);
    }

    #[test]
    fn test_identical_edit_is_pseudo() {
        let (mut local, mut remote) = trees();
        let root_l = local.root();
        let root_r = remote.root();
        let l = add_file(&mut local, root_l, Some(7), "lf", "f.txt", Some(FsOpType::Edit));
        local.node_mut(l).content_hash = Some("same".to_string());
        let r = add_file(&mut remote, root_r, Some(7), "rf", "f.txt", Some(FsOpType::Edit));
        remote.node_mut(r).content_hash = Some("same".to_string());

        let queue = ConflictFinder::new(&local, &remote).find();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_edit_delete_pairs_nearest_deleted_node() {
        let (mut local, mut remote) = trees();
        let root_l = local.root();
        let root_r = remote.root();

        // local: /A/f.txt edited
        let a_l = add_dir(&mut local, root_l, Some(2), "la", "A", None);
        add_file(&mut local, a_l, Some(3), "lf", "f.txt", Some(FsOpType::Edit));

        // remote: A and everything below deleted
        let _a_r = add_dir(&mut remote, root_r, Some(2), "ra", "A", Some(FsOpType::Delete));
        let f_r = add_file(&mut remote, _a_r, Some(3), "rf", "f.txt", Some(FsOpType::Delete));

        let mut queue = ConflictFinder::new(&local, &remote).find();
        let conflict = queue.pop().unwrap();
        assert_eq!(conflict.kind, ConflictKind::EditDelete);
        // the remote participant is the file itself; the resolver inspects
        // its parent to see the whole subtree is going away
        assert_eq!(conflict.remote, f_r);
    }

    #[test]
    fn test_move_delete() {
        let (mut local, mut remote) = trees();
        let root_l = local.root();
        let root_r = remote.root();

        // local: /A (and c inside) deleted
        let a_l = add_dir(&mut local, root_l, Some(2), "la", "A", Some(FsOpType::Delete));
        add_file(&mut local, a_l, Some(3), "lc", "c.txt", Some(FsOpType::Delete));

        // remote: c renamed inside A
        let a_r = add_dir(&mut remote, root_r, Some(2), "ra", "A", None);
        let c_r = add_file(&mut remote, a_r, Some(3), "rc", "d.txt", Some(FsOpType::Move));
        remote.node_mut(c_r).move_origin = Some(PathBuf::from("A/c.txt"));

        let mut queue = ConflictFinder::new(&local, &remote).find();
        let conflict = queue.pop().unwrap();
        assert_eq!(conflict.kind, ConflictKind::MoveDelete);
        assert_eq!(conflict.local, a_l);
        assert_eq!(conflict.remote, c_r);
    }

    #[test]
    fn test_move_parent_delete() {
        let (mut local, mut remote) = trees();
        let root_l = local.root();
        let root_r = remote.root();

        // local: /D deleted
        add_dir(&mut local, root_l, Some(2), "ld", "D", Some(FsOpType::Delete));
        // plus X present under root, untouched
        add_file(&mut local, root_l, Some(3), "lx", "X", None);

        // remote: X moved into D
        let d_r = add_dir(&mut remote, root_r, Some(2), "rd", "D", None);
        let x_r = add_file(&mut remote, d_r, Some(3), "rx", "X", Some(FsOpType::Move));
        remote.node_mut(x_r).move_origin = Some(PathBuf::from("X"));

        let mut queue = ConflictFinder::new(&local, &remote).find();
        let conflict = queue.pop().unwrap();
        assert_eq!(conflict.kind, ConflictKind::MoveParentDelete);
        assert_eq!(conflict.remote, x_r);
    }

    #[test]
    fn test_create_parent_delete() {
        let (mut local, mut remote) = trees();
        let root_l = local.root();
        let root_r = remote.root();

        add_dir(&mut local, root_l, Some(2), "ld", "D", Some(FsOpType::Delete));

        let d_r = add_dir(&mut remote, root_r, Some(2), "rd", "D", None);
        add_file(&mut remote, d_r, None, "rn", "new.txt", Some(FsOpType::Create));

        let mut queue = ConflictFinder::new(&local, &remote).find();
        let conflict = queue.pop().unwrap();
        assert_eq!(conflict.kind, ConflictKind::CreateParentDelete);
    }

    #[test]
    fn test_move_move_source() {
        let (mut local, mut remote) = trees();
        let root_l = local.root();
        let root_r = remote.root();

        let l = add_file(&mut local, root_l, Some(5), "lf", "a.txt", Some(FsOpType::Move));
        local.node_mut(l).move_origin = Some(PathBuf::from("f.txt"));
        let r = add_file(&mut remote, root_r, Some(5), "rf", "b.txt", Some(FsOpType::Move));
        remote.node_mut(r).move_origin = Some(PathBuf::from("f.txt"));

        let mut queue = ConflictFinder::new(&local, &remote).find();
        assert_eq!(queue.pop().unwrap().kind, ConflictKind::MoveMoveSource);
    }

    #[test]
    fn test_identical_move_is_pseudo() {
        let (mut local, mut remote) = trees();
        let root_l = local.root();
        let root_r = remote.root();

        let l = add_file(&mut local, root_l, Some(5), "lf", "same.txt", Some(FsOpType::Move));
        local.node_mut(l).move_origin = Some(PathBuf::from("f.txt"));
        let r = add_file(&mut remote, root_r, Some(5), "rf", "same.txt", Some(FsOpType::Move));
        remote.node_mut(r).move_origin = Some(PathBuf::from("f.txt"));

        let queue = ConflictFinder::new(&local, &remote).find();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_move_move_cycle() {
        let (mut local, mut remote) = trees();
        let root_l = local.root();
        let root_r = remote.root();

        // local: X moved under Y
        let y_l = add_dir(&mut local, root_l, Some(2), "ly", "Y", None);
        let x_l = add_dir(&mut local, y_l, Some(3), "lx", "X", Some(FsOpType::Move));
        local.node_mut(x_l).move_origin = Some(PathBuf::from("X"));

        // remote: Y moved under X
        let x_r = add_dir(&mut remote, root_r, Some(3), "rx", "X", None);
        let y_r = add_dir(&mut remote, x_r, Some(2), "ry", "Y", Some(FsOpType::Move));
        remote.node_mut(y_r).move_origin = Some(PathBuf::from("Y"));

        let queue = ConflictFinder::new(&local, &remote).find();
        let mut kinds = Vec::new();
        let mut queue = queue;
        while let Some(c) = queue.pop() {
            kinds.push(c.kind);
        }
        assert!(kinds.contains(&ConflictKind::MoveMoveCycle));
    }

    #[test]
    fn test_move_create() {
        let (mut local, mut remote) = trees();
        let root_l = local.root();
        let root_r = remote.root();

        let l = add_file(&mut local, root_l, Some(4), "lf", "taken.txt", Some(FsOpType::Move));
        local.node_mut(l).move_origin = Some(PathBuf::from("old.txt"));
        add_file(&mut remote, root_r, None, "rn", "taken.txt", Some(FsOpType::Create));

        let mut queue = ConflictFinder::new(&local, &remote).find();
        assert_eq!(queue.pop().unwrap().kind, ConflictKind::MoveCreate);
    }

    #[test]
    fn test_move_move_dest() {
        let (mut local, mut remote) = trees();
        let root_l = local.root();
        let root_r = remote.root();

        let l = add_file(&mut local, root_l, Some(4), "lf", "dest.txt", Some(FsOpType::Move));
        local.node_mut(l).move_origin = Some(PathBuf::from("a.txt"));
        let r = add_file(&mut remote, root_r, Some(5), "rg", "dest.txt", Some(FsOpType::Move));
        remote.node_mut(r).move_origin = Some(PathBuf::from("b.txt"));

        let mut queue = ConflictFinder::new(&local, &remote).find();
        assert_eq!(queue.pop().unwrap().kind, ConflictKind::MoveMoveDest);
    }
}
