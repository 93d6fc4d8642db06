//! Operation sorter
//!
//! Establishes an execution order satisfying the cross-operation
//! dependencies, as a stable topological sort:
//!
//! 1. A create on a parent precedes any operation inside it.
//! 2. A delete on a child precedes the delete on its parent.
//! 3. An operation landing on a path runs after the operation that vacates
//!    that path (move away or delete).
//! 4. An edit on a node follows a same-pass move of that node.
//!
//! Cycles among moves must have been broken by the conflict stage; a cycle
//! here is a data error.

use std::collections::HashSet;
use std::path::Path;

use tracing::debug;

use pairdrive_core::domain::{ExitCause, FsOpType, NodeType, StepError, StepResult};

use crate::op::{SyncOperation, SyncOperationList};

pub struct OpSorter;

impl OpSorter {
    /// Reorders the list in place.
    pub fn sort(list: &mut SyncOperationList) -> StepResult<()> {
        let ops: Vec<SyncOperation> = list.as_slice().to_vec();
        let n = ops.len();
        if n < 2 {
            return Ok(());
        }

        let mut edges: HashSet<(usize, usize)> = HashSet::new();
        for i in 0..n {
            for j in 0..n {
                if i == j || ops[i].target_side != ops[j].target_side {
                    continue;
                }
                let (a, b) = (&ops[i], &ops[j]);

                // 1. parent create before anything inside the new directory
                if a.kind == FsOpType::Create
                    && a.node_type == NodeType::Directory
                    && is_strict_prefix(&a.dest_path, &b.dest_path)
                {
                    edges.insert((i, j));
                }

                // 2. child delete before parent delete
                if a.kind == FsOpType::Delete
                    && b.kind == FsOpType::Delete
                    && is_strict_prefix(&a.dest_path, &b.dest_path)
                {
                    edges.insert((j, i));
                }

                // 3. vacate a path before something else lands on it
                let a_lands = matches!(a.kind, FsOpType::Create | FsOpType::Move);
                let b_vacates = match b.kind {
                    FsOpType::Move => b.origin_path.as_deref() == Some(a.dest_path.as_path()),
                    FsOpType::Delete => b.dest_path == a.dest_path,
                    _ => false,
                };
                if a_lands && b_vacates {
                    edges.insert((j, i));
                }

                // 4. move before edit of the same node
                if a.kind == FsOpType::Move && b.kind == FsOpType::Edit && same_node(a, b) {
                    edges.insert((i, j));
                }
            }
        }

        // stable Kahn: among ready operations, lowest original index first
        let mut indegree = vec![0usize; n];
        let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); n];
        for &(from, to) in &edges {
            adjacency[from].push(to);
            indegree[to] += 1;
        }

        let mut ready: std::collections::BinaryHeap<std::cmp::Reverse<usize>> = (0..n)
            .filter(|&i| indegree[i] == 0)
            .map(std::cmp::Reverse)
            .collect();
        let mut order = Vec::with_capacity(n);
        while let Some(std::cmp::Reverse(i)) = ready.pop() {
            order.push(i);
            for &next in &adjacency[i] {
                indegree[next] -= 1;
                if indegree[next] == 0 {
                    ready.push(std::cmp::Reverse(next));
                }
            }
        }

        if order.len() != n {
            return Err(StepError::data(
                ExitCause::Unknown,
                "cycle in operation ordering; the conflict stage should have broken it",
            ));
        }

        debug!(ops = n, "Operations sorted");
        let sorted: Vec<SyncOperation> = order.into_iter().map(|i| ops[i].clone()).collect();
        list.replace(sorted);
        Ok(())
    }
}

fn is_strict_prefix(parent: &Path, child: &Path) -> bool {
    !parent.as_os_str().is_empty() && child != parent && child.starts_with(parent)
}

fn same_node(a: &SyncOperation, b: &SyncOperation) -> bool {
    match (a.db_id, b.db_id) {
        (Some(x), Some(y)) => x == y,
        _ => match (&a.source_id, &b.source_id) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pairdrive_core::domain::{NodeId, ReplicaSide};

    fn op(kind: FsOpType, node_type: NodeType, dest: &str) -> SyncOperation {
        let mut op = SyncOperation::new(kind, ReplicaSide::Local, node_type);
        op.dest_path = dest.into();
        op
    }

    fn sort(ops: Vec<SyncOperation>) -> Vec<SyncOperation> {
        let mut list = SyncOperationList::new();
        for o in ops {
            list.push(o);
        }
        OpSorter::sort(&mut list).unwrap();
        list.into_vec()
    }

    #[test]
    fn test_parent_create_before_child_ops() {
        let child = op(FsOpType::Create, NodeType::File, "A/f.txt");
        let parent = op(FsOpType::Create, NodeType::Directory, "A");
        let sorted = sort(vec![child, parent]);

        assert_eq!(sorted[0].dest_path, Path::new("A"));
        assert_eq!(sorted[1].dest_path, Path::new("A/f.txt"));
    }

    #[test]
    fn test_child_delete_before_parent_delete() {
        let parent = op(FsOpType::Delete, NodeType::Directory, "A");
        let child = op(FsOpType::Delete, NodeType::File, "A/f.txt");
        let sorted = sort(vec![parent, child]);

        assert_eq!(sorted[0].dest_path, Path::new("A/f.txt"));
        assert_eq!(sorted[1].dest_path, Path::new("A"));
    }

    #[test]
    fn test_move_chain_respects_vacancy() {
        // f1: a -> b must wait until f2: b -> c has vacated b
        let mut m1 = op(FsOpType::Move, NodeType::File, "b");
        m1.origin_path = Some("a".into());
        m1.db_id = Some(1);
        let mut m2 = op(FsOpType::Move, NodeType::File, "c");
        m2.origin_path = Some("b".into());
        m2.db_id = Some(2);

        let sorted = sort(vec![m1, m2]);
        assert_eq!(sorted[0].dest_path, Path::new("c"));
        assert_eq!(sorted[1].dest_path, Path::new("b"));
    }

    #[test]
    fn test_edit_after_move_of_same_node() {
        let mut edit = op(FsOpType::Edit, NodeType::File, "new.txt");
        edit.db_id = Some(9);
        let mut mv = op(FsOpType::Move, NodeType::File, "new.txt");
        mv.origin_path = Some("old.txt".into());
        mv.db_id = Some(9);

        let sorted = sort(vec![edit, mv]);
        assert_eq!(sorted[0].kind, FsOpType::Move);
        assert_eq!(sorted[1].kind, FsOpType::Edit);
    }

    #[test]
    fn test_delete_rename_create_collision_order() {
        // delete File 6a; rename File 6 -> File 6a; create a new File 6
        let mut create = op(FsOpType::Create, NodeType::File, "File 6");
        create.source_id = Some(NodeId::new("id6b"));
        let mut mv = op(FsOpType::Move, NodeType::File, "File 6a");
        mv.origin_path = Some("File 6".into());
        mv.db_id = Some(6);
        let mut delete = op(FsOpType::Delete, NodeType::File, "File 6a");
        delete.db_id = Some(7);

        let sorted = sort(vec![create, mv, delete]);
        assert_eq!(sorted[0].kind, FsOpType::Delete);
        assert_eq!(sorted[1].kind, FsOpType::Move);
        assert_eq!(sorted[2].kind, FsOpType::Create);
    }

    #[test]
    fn test_stable_for_unrelated_ops() {
        let a = op(FsOpType::Create, NodeType::File, "one.txt");
        let b = op(FsOpType::Create, NodeType::File, "two.txt");
        let c = op(FsOpType::Create, NodeType::File, "three.txt");
        let sorted = sort(vec![a, b, c]);

        assert_eq!(sorted[0].dest_path, Path::new("one.txt"));
        assert_eq!(sorted[1].dest_path, Path::new("two.txt"));
        assert_eq!(sorted[2].dest_path, Path::new("three.txt"));
    }

    #[test]
    fn test_unbroken_move_cycle_is_detected() {
        let mut m1 = op(FsOpType::Move, NodeType::File, "b");
        m1.origin_path = Some("a".into());
        m1.db_id = Some(1);
        let mut m2 = op(FsOpType::Move, NodeType::File, "a");
        m2.origin_path = Some("b".into());
        m2.db_id = Some(2);

        let mut list = SyncOperationList::new();
        list.push(m1);
        list.push(m2);
        let err = OpSorter::sort(&mut list).unwrap_err();
        assert_eq!(err.code, pairdrive_core::domain::ExitCode::DataError);
    }

    #[test]
    fn test_ancestor_ordering_invariant() {
        // for any ancestor/descendant pair: parent-first for creates,
        // child-first for deletes
        let ops = vec![
            op(FsOpType::Delete, NodeType::Directory, "X"),
            op(FsOpType::Delete, NodeType::Directory, "X/Y"),
            op(FsOpType::Delete, NodeType::File, "X/Y/z.txt"),
            op(FsOpType::Create, NodeType::Directory, "N"),
            op(FsOpType::Create, NodeType::Directory, "N/M"),
            op(FsOpType::Create, NodeType::File, "N/M/f.txt"),
        ];
        let sorted = sort(ops);

        let pos = |path: &str| {
            sorted
                .iter()
                .position(|o| o.dest_path == Path::new(path))
                .unwrap()
        };
        assert!(pos("N") < pos("N/M"));
        assert!(pos("N/M") < pos("N/M/f.txt"));
        assert!(pos("X/Y/z.txt") < pos("X/Y"));
        assert!(pos("X/Y") < pos("X"));
    }
}
