//! Update-tree builder
//!
//! Folds one side's operation set into an annotated [`UpdateTree`] in eight
//! ordered steps. The order is load-bearing: directory moves run before file
//! moves so file destinations resolve against post-move parents, deletes run
//! before creates so a delete+create at one path collapses into an edit, and
//! edits run last so they observe the identity chosen by the earlier steps.
//!
//! Parents that are not known yet are materialized as temporary placeholder
//! nodes; step 8 merges every placeholder with its database backing and the
//! final integrity check refuses to hand over a tree with a placeholder left.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::{debug, trace, warn};

use pairdrive_core::domain::{
    ExitCause, FsOpType, FsOperation, FsOperationSet, NodeType, ReplicaSide, StepError, StepResult,
};
use pairdrive_store::{NodeRecord, SyncDb};

use crate::tree::{make_node, NodeRef, UpdateTree};

/// Builds one side's update tree for a pass
pub struct TreeBuilder<'a> {
    db: &'a SyncDb,
    ops: &'a FsOperationSet,
    side: ReplicaSide,
    /// Create operations consumed by the delete+create collapse of step 4.
    consumed_creates: HashSet<PathBuf>,
}

impl<'a> TreeBuilder<'a> {
    pub fn new(db: &'a SyncDb, ops: &'a FsOperationSet, side: ReplicaSide) -> Self {
        Self {
            db,
            ops,
            side,
            consumed_creates: HashSet::new(),
        }
    }

    pub async fn build(&mut self) -> StepResult<UpdateTree> {
        let root_row = self
            .db
            .node_by_db_id(self.db.root_db_id())
            .await
            .map_err(db_error)?
            .ok_or_else(|| StepError::data(ExitCause::Unknown, "sync root row missing"))?;
        let root_id = root_row.node_id(self.side).cloned().ok_or_else(|| {
            StepError::data(
                ExitCause::Unknown,
                format!("sync root has no {} id", self.side),
            )
        })?;

        let mut tree = UpdateTree::new(self.side, self.db.root_db_id(), root_id);

        self.reject_duplicate_create_paths()?;

        self.step_move(&mut tree, NodeType::Directory).await?; // 1
        self.step_move(&mut tree, NodeType::File).await?; // 2
        self.step_delete(&mut tree, NodeType::Directory).await?; // 3
        self.step_delete(&mut tree, NodeType::File).await?; // 4
        self.step_create(&mut tree, NodeType::Directory)?; // 5
        self.step_create(&mut tree, NodeType::File)?; // 6
        self.step_edit(&mut tree).await?; // 7
        self.step_complete(&mut tree).await?; // 8

        if !tree.integrity_check() {
            warn!(side = %self.side, "Temporary node left after tree construction");
            return Err(StepError::data(
                ExitCause::InvalidSnapshot,
                format!("temporary node left in {} update tree", self.side),
            ));
        }

        trace!(side = %self.side, tree = %tree.render(), "Update tree built");
        Ok(tree)
    }

    /// Two create operations on one path mean the observer missed a deletion
    /// or the platform produced colliding normalizations; the snapshot cannot
    /// be trusted.
    fn reject_duplicate_create_paths(&self) -> StepResult<()> {
        let mut seen: HashSet<&Path> = HashSet::new();
        for op in self.ops.iter().filter(|op| op.kind == FsOpType::Create) {
            if !seen.insert(op.path.as_path()) {
                return Err(StepError::data(
                    ExitCause::UnexpectedFileSystemEvent,
                    format!("duplicate create at {}", op.path.display()),
                ));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Steps 1+2: moves
    // ------------------------------------------------------------------

    async fn step_move(&mut self, tree: &mut UpdateTree, node_type: NodeType) -> StepResult<()> {
        let ops: Vec<FsOperation> = self.ops.of_kind(FsOpType::Move, node_type).cloned().collect();
        for op in ops {
            let destination = op.destination.clone().ok_or_else(|| {
                StepError::data(
                    ExitCause::UnexpectedFileSystemEvent,
                    format!("move of {} carries no destination", op.node_id),
                )
            })?;
            let dest_name = file_name(&destination)?;
            let dest_parent = parent_path(&destination);

            if let Some(existing) = tree.by_node_id(&op.node_id) {
                // node already materialized by an earlier operation
                let parent = self.get_or_create(tree, &dest_parent);
                tree.reparent(existing, parent);
                let node = tree.node_mut(existing);
                node.name = dest_name.to_string();
                node.events.insert(FsOpType::Move);
                if node.move_origin.is_none() {
                    node.move_origin = Some(op.path.clone());
                }
                continue;
            }

            let row = self
                .db
                .node_by_id(self.side, &op.node_id)
                .await
                .map_err(db_error)?
                .ok_or_else(|| {
                    StepError::data(
                        ExitCause::UnexpectedFileSystemEvent,
                        format!("move of unknown node {}", op.node_id),
                    )
                })?;

            let parent = self.get_or_create(tree, &dest_parent);
            let node_ref = match tree.child_by_name(parent, dest_name) {
                // a placeholder already stands at the destination: take it over
                Some(placeholder) if tree.node(placeholder).tmp => {
                    tree.realize_tmp(
                        placeholder,
                        Some(row.db_id),
                        Some(op.node_id.clone()),
                        node_type,
                    );
                    placeholder
                }
                _ => {
                    let node = make_node(
                        Some(row.db_id),
                        Some(op.node_id.clone()),
                        dest_name,
                        node_type,
                    );
                    tree.insert(parent, node)
                }
            };

            let node = tree.node_mut(node_ref);
            node.events.insert(FsOpType::Move);
            node.move_origin = Some(op.path.clone());
            node.size = op.size;
            node.created_at = Some(op.created_at);
            node.modified_at = Some(op.modified_at);
            node.content_hash = row.content_hash.clone();

            trace!(side = %self.side, id = %op.node_id,
                   from = %op.path.display(), to = %destination.display(), "move folded");
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Steps 3+4: deletes
    // ------------------------------------------------------------------

    async fn step_delete(&mut self, tree: &mut UpdateTree, node_type: NodeType) -> StepResult<()> {
        let ops: Vec<FsOperation> =
            self.ops.of_kind(FsOpType::Delete, node_type).cloned().collect();
        for op in ops {
            // delete+create at one path by distinct ids is a content replace:
            // the creating node takes the database identity and an edit event
            if node_type == NodeType::File {
                let replacement = self
                    .ops
                    .create_at_path(&op.path)
                    .filter(|c| c.node_id != op.node_id && c.node_type == NodeType::File)
                    .cloned();
                if let Some(create_op) = replacement {
                    self.collapse_delete_create(tree, &op, &create_op).await?;
                    continue;
                }
            }

            if let Some(existing) = tree.by_node_id(&op.node_id) {
                // moved then deleted: both events stay recorded
                tree.node_mut(existing).events.insert(FsOpType::Delete);
                tree.node_mut(existing).modified_at = Some(op.modified_at);
                continue;
            }

            let row = self
                .db
                .node_by_id(self.side, &op.node_id)
                .await
                .map_err(db_error)?
                .ok_or_else(|| {
                    StepError::data(
                        ExitCause::UnexpectedFileSystemEvent,
                        format!("delete of unknown node {}", op.node_id),
                    )
                })?;

            let current_path = self.path_after_moves(&op.path);
            let parent = self.get_or_create(tree, &parent_path(&current_path));
            let name = file_name(&current_path)?;

            let node_ref = match tree.child_by_name(parent, name) {
                Some(placeholder) if tree.node(placeholder).tmp => {
                    tree.realize_tmp(
                        placeholder,
                        Some(row.db_id),
                        Some(op.node_id.clone()),
                        node_type,
                    );
                    placeholder
                }
                _ => {
                    let node = make_node(
                        Some(row.db_id),
                        Some(op.node_id.clone()),
                        name,
                        node_type,
                    );
                    tree.insert(parent, node)
                }
            };
            let node = tree.node_mut(node_ref);
            node.events.insert(FsOpType::Delete);
            node.size = row.size;
            node.modified_at = Some(op.modified_at);
            node.content_hash = row.content_hash.clone();

            trace!(side = %self.side, id = %op.node_id, path = %current_path.display(), "delete folded");
        }
        Ok(())
    }

    /// Content-replace semantics: the surviving node keeps the old row's
    /// database identity, carries the creating node's id and an edit event.
    async fn collapse_delete_create(
        &mut self,
        tree: &mut UpdateTree,
        delete_op: &FsOperation,
        create_op: &FsOperation,
    ) -> StepResult<()> {
        let row = self
            .db
            .node_by_id(self.side, &delete_op.node_id)
            .await
            .map_err(db_error)?
            .ok_or_else(|| {
                StepError::data(
                    ExitCause::UnexpectedFileSystemEvent,
                    format!("delete of unknown node {}", delete_op.node_id),
                )
            })?;

        let current_path = self.path_after_moves(&delete_op.path);
        let parent = self.get_or_create(tree, &parent_path(&current_path));
        let name = file_name(&current_path)?;

        let node_ref = match tree.child_by_name(parent, name) {
            Some(existing) if tree.node(existing).tmp => {
                tree.realize_tmp(
                    existing,
                    Some(row.db_id),
                    Some(create_op.node_id.clone()),
                    NodeType::File,
                );
                existing
            }
            Some(existing) => existing,
            None => {
                let node = make_node(
                    Some(row.db_id),
                    Some(create_op.node_id.clone()),
                    name,
                    NodeType::File,
                );
                tree.insert(parent, node)
            }
        };

        tree.set_node_id(node_ref, create_op.node_id.clone());
        tree.set_db_id(node_ref, row.db_id);
        let node = tree.node_mut(node_ref);
        node.events.insert(FsOpType::Edit);
        node.size = create_op.size;
        node.created_at = Some(create_op.created_at);
        node.modified_at = Some(create_op.modified_at);
        node.content_hash = create_op.content_hash.clone();

        self.consumed_creates.insert(delete_op.path.clone());

        debug!(side = %self.side, path = %delete_op.path.display(),
               old = %delete_op.node_id, new = %create_op.node_id,
               "delete+create collapsed into edit");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Steps 5+6: creates
    // ------------------------------------------------------------------

    fn step_create(&mut self, tree: &mut UpdateTree, node_type: NodeType) -> StepResult<()> {
        let ops: Vec<FsOperation> =
            self.ops.of_kind(FsOpType::Create, node_type).cloned().collect();
        for op in ops {
            if self.consumed_creates.contains(&op.path) {
                continue;
            }

            let parent = self.get_or_create(tree, &parent_path(&op.path));
            let name = file_name(&op.path)?;

            let node_ref = match tree.child_by_name(parent, name) {
                Some(placeholder) if tree.node(placeholder).tmp => {
                    tree.realize_tmp(placeholder, None, Some(op.node_id.clone()), node_type);
                    placeholder
                }
                _ => {
                    let node = make_node(None, Some(op.node_id.clone()), name, node_type);
                    tree.insert(parent, node)
                }
            };

            let node = tree.node_mut(node_ref);
            node.events.insert(FsOpType::Create);
            node.size = op.size;
            node.created_at = Some(op.created_at);
            node.modified_at = Some(op.modified_at);
            node.content_hash = op.content_hash.clone();

            trace!(side = %self.side, id = %op.node_id, path = %op.path.display(), "create folded");
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Step 7: edits
    // ------------------------------------------------------------------

    async fn step_edit(&mut self, tree: &mut UpdateTree) -> StepResult<()> {
        let ops: Vec<FsOperation> =
            self.ops.of_kind(FsOpType::Edit, NodeType::File).cloned().collect();
        for op in ops {
            if let Some(existing) = tree.by_node_id(&op.node_id) {
                let node = tree.node_mut(existing);
                node.events.insert(FsOpType::Edit);
                node.size = op.size;
                node.modified_at = Some(op.modified_at);
                if op.content_hash.is_some() {
                    node.content_hash = op.content_hash.clone();
                }
                continue;
            }

            let row = self
                .db
                .node_by_id(self.side, &op.node_id)
                .await
                .map_err(db_error)?
                .ok_or_else(|| {
                    StepError::data(
                        ExitCause::UnexpectedFileSystemEvent,
                        format!("edit of unknown node {}", op.node_id),
                    )
                })?;

            let current_path = self.path_after_moves(&op.path);
            let parent = self.get_or_create(tree, &parent_path(&current_path));
            let name = file_name(&current_path)?;

            let node_ref = match tree.child_by_name(parent, name) {
                Some(placeholder) if tree.node(placeholder).tmp => {
                    tree.realize_tmp(
                        placeholder,
                        Some(row.db_id),
                        Some(op.node_id.clone()),
                        NodeType::File,
                    );
                    placeholder
                }
                _ => {
                    let node = make_node(
                        Some(row.db_id),
                        Some(op.node_id.clone()),
                        name,
                        NodeType::File,
                    );
                    tree.insert(parent, node)
                }
            };

            let node = tree.node_mut(node_ref);
            node.events.insert(FsOpType::Edit);
            node.size = op.size;
            node.modified_at = Some(op.modified_at);
            node.content_hash = op.content_hash.clone().or(row.content_hash.clone());

            trace!(side = %self.side, id = %op.node_id, path = %current_path.display(), "edit folded");
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Step 8: completion
    // ------------------------------------------------------------------

    async fn step_complete(&mut self, tree: &mut UpdateTree) -> StepResult<()> {
        self.merge_placeholders(tree).await?;
        self.insert_missing_db_nodes(tree).await?;
        Ok(())
    }

    /// Matches surviving placeholders with their `(parent, name)` database
    /// backing, top-down so parents resolve before their children.
    async fn merge_placeholders(&mut self, tree: &mut UpdateTree) -> StepResult<()> {
        let mut queue: Vec<NodeRef> = vec![tree.root()];
        while let Some(current) = queue.pop() {
            let children: Vec<NodeRef> = tree.node(current).children().to_vec();
            for child in children {
                if tree.node(child).dead {
                    continue;
                }
                if tree.node(child).tmp {
                    let Some(parent_db_id) = tree.node(current).db_id else {
                        // unresolved parent placeholder: integrity check will fail
                        continue;
                    };
                    let name = tree.node(child).name.clone();
                    if let Some(row) = self
                        .db
                        .child_by_name(parent_db_id, &name)
                        .await
                        .map_err(db_error)?
                    {
                        match tree.by_db_id(row.db_id) {
                            Some(real) if real != child => {
                                tree.merge_tmp_into(child, real);
                                // children moved under the real node; revisit it
                                queue.push(real);
                                continue;
                            }
                            _ => {
                                let node_id = row.node_id(self.side).cloned();
                                tree.realize_tmp(
                                    child,
                                    Some(row.db_id),
                                    node_id,
                                    row.node_type,
                                );
                                let node = tree.node_mut(child);
                                node.size = row.size;
                                node.content_hash = row.content_hash.clone();
                            }
                        }
                    }
                }
                queue.push(child);
            }
        }
        Ok(())
    }

    /// Every database node not yet in the tree is inserted without change
    /// events, parents before children.
    async fn insert_missing_db_nodes(&mut self, tree: &mut UpdateTree) -> StepResult<()> {
        let mut pending: Vec<NodeRecord> = self
            .db
            .all_nodes()
            .await
            .map_err(db_error)?
            .into_iter()
            .filter(|row| row.node_id(self.side).is_some())
            .collect();

        loop {
            let mut progressed = false;
            let mut rest = Vec::new();
            for row in pending {
                if tree.by_db_id(row.db_id).is_some() {
                    progressed = true;
                    continue;
                }
                let Some(parent_db_id) = row.parent_db_id else {
                    continue;
                };
                let Some(parent_ref) = tree.by_db_id(parent_db_id) else {
                    rest.push(row);
                    continue;
                };
                let mut node = make_node(
                    Some(row.db_id),
                    row.node_id(self.side).cloned(),
                    row.name.clone(),
                    row.node_type,
                );
                node.size = row.size;
                node.content_hash = row.content_hash.clone();
                node.modified_at = row.modified_at(self.side);
                tree.insert(parent_ref, node);
                progressed = true;
            }
            if rest.is_empty() {
                break;
            }
            if !progressed {
                return Err(StepError::data(
                    ExitCause::Unknown,
                    "database parent chain cannot be resolved into the tree",
                ));
            }
            pending = rest;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    /// Resolves a path in the tree, materializing placeholders for missing
    /// components.
    fn get_or_create(&mut self, tree: &mut UpdateTree, path: &Path) -> NodeRef {
        let mut current = tree.root();
        for component in path.components() {
            let name = component.as_os_str().to_string_lossy().to_string();
            current = match tree.child_by_name(current, &name) {
                Some(child) => child,
                None => tree.insert_tmp(current, &name),
            };
        }
        current
    }

    /// Rewrites a database path so directory moves of this pass are applied:
    /// the longest moved prefix is replaced by its destination.
    fn path_after_moves(&self, path: &Path) -> PathBuf {
        let mut best: Option<(&Path, &Path)> = None;
        for op in self.ops.of_kind(FsOpType::Move, NodeType::Directory) {
            let Some(destination) = op.destination.as_deref() else {
                continue;
            };
            if path.starts_with(&op.path)
                && best.map_or(true, |(prefix, _)| {
                    op.path.components().count() > prefix.components().count()
                })
            {
                best = Some((op.path.as_path(), destination));
            }
        }
        match best {
            Some((prefix, destination)) => {
                let remainder = path.strip_prefix(prefix).expect("checked prefix");
                destination.join(remainder)
            }
            None => path.to_path_buf(),
        }
    }
}

fn parent_path(path: &Path) -> PathBuf {
    path.parent().map(Path::to_path_buf).unwrap_or_default()
}

fn file_name(path: &Path) -> StepResult<&str> {
    path.file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            StepError::data(
                ExitCause::UnexpectedFileSystemEvent,
                format!("operation path has no file name: {}", path.display()),
            )
        })
}

fn db_error(e: pairdrive_store::StoreError) -> StepError {
    StepError::data(ExitCause::Unknown, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pairdrive_core::domain::NodeId;
    use pairdrive_store::{DbPool, NewNode};

    /// Database baseline used by most tests:
    ///
    /// ```text
    /// Root
    /// ├── Dir 1
    /// │   └── Dir 1.1
    /// │       ├── Dir 1.1.1
    /// │       │   └── File 1.1.1.1
    /// │       └── File 1.1.2
    /// ├── Dir 2
    /// ├── Dir 3
    /// │   └── Dir 3.1
    /// ├── Dir 4
    /// │   └── Dir 4.1
    /// │       └── Dir 4.1.1
    /// │           ├── File 4.1.1.1
    /// │           └── File 4.1.1.2
    /// ├── Dir 5
    /// │   └── File 5.1
    /// ├── File 6
    /// └── File 6a
    /// ```
    async fn setup_db() -> SyncDb {
        let pool = DbPool::in_memory().await.unwrap();
        let db = SyncDb::open(&pool, &NodeId::new("lroot"), &NodeId::new("rroot"))
            .await
            .unwrap();

        let root = db.root_db_id();
        let d1 = dir(&db, root, "Dir 1", "id1").await;
        let d11 = dir(&db, d1, "Dir 1.1", "id11").await;
        let d111 = dir(&db, d11, "Dir 1.1.1", "id111").await;
        file(&db, d111, "File 1.1.1.1", "id1111").await;
        file(&db, d11, "File 1.1.2", "id112").await;
        dir(&db, root, "Dir 2", "id2").await;
        let d3 = dir(&db, root, "Dir 3", "id3").await;
        dir(&db, d3, "Dir 3.1", "id31").await;
        let d4 = dir(&db, root, "Dir 4", "id4").await;
        let d41 = dir(&db, d4, "Dir 4.1", "id41").await;
        let d411 = dir(&db, d41, "Dir 4.1.1", "id411").await;
        file(&db, d411, "File 4.1.1.1", "id4111").await;
        file(&db, d411, "File 4.1.1.2", "id4112").await;
        let d5 = dir(&db, root, "Dir 5", "id5").await;
        file(&db, d5, "File 5.1", "id51").await;
        file(&db, root, "File 6", "id6").await;
        file(&db, root, "File 6a", "id6a").await;
        db
    }

    async fn dir(db: &SyncDb, parent: i64, name: &str, id: &str) -> i64 {
        db.insert_node(
            &NewNode::new(parent, name, NodeType::Directory)
                .with_ids(Some(NodeId::new(id)), Some(NodeId::new(format!("r-{id}")))),
        )
        .await
        .unwrap()
    }

    async fn file(db: &SyncDb, parent: i64, name: &str, id: &str) -> i64 {
        db.insert_node(
            &NewNode::new(parent, name, NodeType::File)
                .with_ids(Some(NodeId::new(id)), Some(NodeId::new(format!("r-{id}"))))
                .with_size(12345),
        )
        .await
        .unwrap()
    }

    fn op(kind: FsOpType, id: &str, node_type: NodeType, path: &str) -> FsOperation {
        FsOperation::new(kind, NodeId::new(id), node_type, path).with_size(12345)
    }

    fn move_op(id: &str, node_type: NodeType, from: &str, to: &str) -> FsOperation {
        op(FsOpType::Move, id, node_type, from).with_destination(to)
    }

    async fn build(db: &SyncDb, ops: &FsOperationSet) -> UpdateTree {
        TreeBuilder::new(db, ops, ReplicaSide::Local)
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_directory_moves_into_new_and_existing_folders() {
        let db = setup_db().await;
        let mut ops = FsOperationSet::new();
        ops.insert(move_op(
            "id111",
            NodeType::Directory,
            "Dir 1/Dir 1.1/Dir 1.1.1",
            "Dir 1/Dir 1.2/Dir 1.2.1/Dir 1.1.1",
        ));
        ops.insert(move_op("id3", NodeType::Directory, "Dir 3", "Dir 1/Dir 1.2/Dir 3"));
        // rename of Dir 1.1 into Dir 1.2
        ops.insert(move_op("id11", NodeType::Directory, "Dir 1/Dir 1.1", "Dir 1/Dir 1.2"));

        let tree = build(&db, &ops).await;

        let d111 = tree
            .by_path(Path::new("Dir 1/Dir 1.2/Dir 1.2.1/Dir 1.1.1"))
            .unwrap();
        assert_eq!(tree.node(d111).node_id, Some(NodeId::new("id111")));

        let d3 = tree.by_path(Path::new("Dir 1/Dir 1.2/Dir 3")).unwrap();
        assert_eq!(tree.node(d3).node_id, Some(NodeId::new("id3")));

        let d12 = tree.by_path(Path::new("Dir 1/Dir 1.2")).unwrap();
        assert_eq!(tree.node(d12).node_id, Some(NodeId::new("id11")));
        assert!(tree.node(d12).has_event(FsOpType::Move));

        assert!(tree.by_path(Path::new("Dir 1/Dir 1.1")).is_none());
    }

    #[tokio::test]
    async fn test_file_move_records_origin() {
        let db = setup_db().await;
        let mut ops = FsOperationSet::new();
        ops.insert(move_op(
            "id1111",
            NodeType::File,
            "Dir 1/Dir 1.1/Dir 1.1.1/File 1.1.1.1",
            "Dir 1/File 1.1",
        ));

        let tree = build(&db, &ops).await;

        let node = tree.by_path(Path::new("Dir 1/File 1.1")).unwrap();
        assert!(tree.node(node).has_event(FsOpType::Move));
        assert_eq!(tree.node(node).node_id, Some(NodeId::new("id1111")));
        assert_eq!(
            tree.node(node).move_origin.as_deref(),
            Some(Path::new("Dir 1/Dir 1.1/Dir 1.1.1/File 1.1.1.1"))
        );
        let parent = tree.node(node).parent().unwrap();
        assert_eq!(tree.node(parent).node_id, Some(NodeId::new("id1")));
    }

    #[tokio::test]
    async fn test_moved_then_deleted_directory_carries_both_events() {
        let db = setup_db().await;
        let mut ops = FsOperationSet::new();
        ops.insert(move_op("id3", NodeType::Directory, "Dir 3", "Dir 1/Dir 1.2/Dir 3"));
        ops.insert(move_op("id11", NodeType::Directory, "Dir 1/Dir 1.1", "Dir 1/Dir 1.2"));
        ops.insert(op(
            FsOpType::Delete,
            "id3",
            NodeType::Directory,
            "Dir 1/Dir 1.2/Dir 3",
        ));
        ops.insert(op(FsOpType::Delete, "id2", NodeType::Directory, "Dir 2"));

        let tree = build(&db, &ops).await;

        let d3 = tree.by_path(Path::new("Dir 1/Dir 1.2/Dir 3")).unwrap();
        assert!(tree.node(d3).has_event(FsOpType::Move));
        assert!(tree.node(d3).has_event(FsOpType::Delete));
        let parent = tree.node(d3).parent().unwrap();
        assert_eq!(tree.node(parent).node_id, Some(NodeId::new("id11")));

        let d2 = tree.by_path(Path::new("Dir 2")).unwrap();
        assert!(tree.node(d2).has_event(FsOpType::Delete));
        assert_eq!(tree.node(d2).parent(), Some(tree.root()));
    }

    #[tokio::test]
    async fn test_delete_create_collapses_to_edit() {
        let db = setup_db().await;
        let mut ops = FsOperationSet::new();
        ops.insert(op(
            FsOpType::Delete,
            "id4111",
            NodeType::File,
            "Dir 4/Dir 4.1/Dir 4.1.1/File 4.1.1.1",
        ));
        ops.insert(op(FsOpType::Delete, "id51", NodeType::File, "Dir 5/File 5.1"));
        ops.insert(op(FsOpType::Create, "id511", NodeType::File, "Dir 5/File 5.1"));

        let tree = build(&db, &ops).await;

        let gone = tree
            .by_path(Path::new("Dir 4/Dir 4.1/Dir 4.1.1/File 4.1.1.1"))
            .unwrap();
        assert!(tree.node(gone).has_event(FsOpType::Delete));

        // the creating node took over the path with an edit event
        let replaced = tree.by_path(Path::new("Dir 5/File 5.1")).unwrap();
        assert!(tree.node(replaced).has_event(FsOpType::Edit));
        assert!(!tree.node(replaced).has_event(FsOpType::Create));
        assert!(!tree.node(replaced).has_event(FsOpType::Delete));
        assert_eq!(tree.node(replaced).node_id, Some(NodeId::new("id511")));
        // database identity of the replaced row is preserved
        let old_row = db
            .node_by_id(ReplicaSide::Local, &NodeId::new("id51"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tree.node(replaced).db_id, Some(old_row.db_id));
    }

    #[tokio::test]
    async fn test_creates_attach_under_new_directories() {
        let db = setup_db().await;
        let mut ops = FsOperationSet::new();
        ops.insert(op(FsOpType::Create, "id7", NodeType::Directory, "Dir 7"));
        ops.insert(op(FsOpType::Create, "id15", NodeType::File, "Dir 7/File 1.5"));
        ops.insert(op(FsOpType::Create, "id52", NodeType::File, "Dir 5/File 5.2"));

        let tree = build(&db, &ops).await;

        let d7 = tree.by_path(Path::new("Dir 7")).unwrap();
        assert!(tree.node(d7).has_event(FsOpType::Create));
        assert!(tree.node(d7).db_id.is_none());

        let f15 = tree.by_path(Path::new("Dir 7/File 1.5")).unwrap();
        assert!(tree.node(f15).has_event(FsOpType::Create));
        assert_eq!(tree.node(f15).parent(), Some(d7));

        // parent existed only in the database; step 8 resolved it
        let f52 = tree.by_path(Path::new("Dir 5/File 5.2")).unwrap();
        let d5 = tree.node(f52).parent().unwrap();
        assert_eq!(tree.node(d5).node_id, Some(NodeId::new("id5")));
        assert!(!tree.node(d5).tmp);
    }

    #[tokio::test]
    async fn test_edit_stamps_event_and_metadata() {
        let db = setup_db().await;
        let mut ops = FsOperationSet::new();
        let mut edit = op(
            FsOpType::Edit,
            "id4112",
            NodeType::File,
            "Dir 4/Dir 4.1/Dir 4.1.1/File 4.1.1.2",
        );
        edit.size = 999;
        edit.content_hash = Some("h9".to_string());
        ops.insert(edit);

        let tree = build(&db, &ops).await;

        let node = tree
            .by_path(Path::new("Dir 4/Dir 4.1/Dir 4.1.1/File 4.1.1.2"))
            .unwrap();
        assert!(tree.node(node).has_event(FsOpType::Edit));
        assert_eq!(tree.node(node).size, 999);
        assert_eq!(tree.node(node).content_hash.as_deref(), Some("h9"));
        let parent = tree.node(node).parent().unwrap();
        assert_eq!(tree.node(parent).node_id, Some(NodeId::new("id411")));
    }

    #[tokio::test]
    async fn test_completion_inserts_every_db_node() {
        let db = setup_db().await;
        let ops = FsOperationSet::new();

        let tree = build(&db, &ops).await;

        // 17 database rows + root
        assert_eq!(tree.len(), 18);
        for path in [
            "Dir 5",
            "Dir 5/File 5.1",
            "Dir 1/Dir 1.1/File 1.1.2",
            "Dir 4/Dir 4.1/Dir 4.1.1/File 4.1.1.2",
        ] {
            let node = tree.by_path(Path::new(path)).unwrap();
            assert!(tree.node(node).events.is_empty());
            assert!(!tree.node(node).tmp);
        }
    }

    #[tokio::test]
    async fn test_delete_rename_create_chain() {
        // Delete File 6a; rename File 6 -> File 6a; create a new File 6.
        let db = setup_db().await;
        let mut ops = FsOperationSet::new();
        ops.insert(op(FsOpType::Delete, "id6a", NodeType::File, "File 6a"));
        ops.insert(move_op("id6", NodeType::File, "File 6", "File 6a"));
        ops.insert(op(FsOpType::Create, "id6b", NodeType::File, "File 6"));

        let tree = build(&db, &ops).await;

        let n6 = tree.by_node_id(&NodeId::new("id6")).unwrap();
        assert_eq!(tree.node(n6).parent(), Some(tree.root()));
        assert_eq!(tree.node(n6).name, "File 6a");
        assert!(tree.node(n6).has_event(FsOpType::Move));

        let n6a = tree.by_node_id(&NodeId::new("id6a")).unwrap();
        assert_eq!(tree.node(n6a).parent(), Some(tree.root()));
        assert_eq!(tree.node(n6a).name, "File 6a");
        assert!(tree.node(n6a).has_event(FsOpType::Delete));

        let n6b = tree.by_node_id(&NodeId::new("id6b")).unwrap();
        assert_eq!(tree.node(n6b).parent(), Some(tree.root()));
        assert_eq!(tree.node(n6b).name, "File 6");
        assert!(tree.node(n6b).has_event(FsOpType::Create));
    }

    #[tokio::test]
    async fn test_origin_path_composed_across_ancestor_moves() {
        // Dir 4.1.1 moved under Dir 4 and renamed; File 4.1.1.1 also renamed.
        let db = setup_db().await;
        let mut ops = FsOperationSet::new();
        ops.insert(move_op(
            "id411",
            NodeType::Directory,
            "Dir 4/Dir 4.1/Dir 4.1.1",
            "Dir 4/Dir 4.1.1 renamed",
        ));
        ops.insert(move_op(
            "id4111",
            NodeType::File,
            "Dir 4/Dir 4.1/Dir 4.1.1/File 4.1.1.1",
            "Dir 4/Dir 4.1.1 renamed/File 4.1.1.1 renamed",
        ));

        let tree = build(&db, &ops).await;

        let file = tree.by_node_id(&NodeId::new("id4111")).unwrap();
        assert_eq!(
            tree.path_of(file),
            Path::new("Dir 4/Dir 4.1.1 renamed/File 4.1.1.1 renamed")
        );
        assert_eq!(
            tree.origin_path_of(file),
            Path::new("Dir 4/Dir 4.1/Dir 4.1.1/File 4.1.1.1")
        );

        // a sibling that did not move composes its origin from the ancestor
        let sibling = tree.by_node_id(&NodeId::new("id4112")).unwrap();
        assert_eq!(
            tree.origin_path_of(sibling),
            Path::new("Dir 4/Dir 4.1/Dir 4.1.1/File 4.1.1.2")
        );
    }

    #[tokio::test]
    async fn test_delete_under_moved_parent_resolves_new_location() {
        // Dir 4.1 moved to the root; File 4.1.1.1 deleted (database path).
        let db = setup_db().await;
        let mut ops = FsOperationSet::new();
        ops.insert(move_op("id41", NodeType::Directory, "Dir 4/Dir 4.1", "Dir 4.1"));
        ops.insert(op(
            FsOpType::Delete,
            "id4111",
            NodeType::File,
            "Dir 4/Dir 4.1/Dir 4.1.1/File 4.1.1.1",
        ));

        let tree = build(&db, &ops).await;

        let node = tree.by_node_id(&NodeId::new("id4111")).unwrap();
        assert!(tree.node(node).has_event(FsOpType::Delete));
        assert_eq!(
            tree.path_of(node),
            Path::new("Dir 4.1/Dir 4.1.1/File 4.1.1.1")
        );
    }

    #[tokio::test]
    async fn test_duplicate_create_paths_rejected() {
        let db = setup_db().await;
        let mut ops = FsOperationSet::new();
        ops.insert(op(FsOpType::Create, "idx", NodeType::File, "Dir 5/clash.txt"));
        ops.insert(op(FsOpType::Create, "idy", NodeType::File, "Dir 5/clash.txt"));

        let err = TreeBuilder::new(&db, &ops, ReplicaSide::Local)
            .build()
            .await
            .unwrap_err();
        assert_eq!(err.cause, ExitCause::UnexpectedFileSystemEvent);
    }

    #[tokio::test]
    async fn test_no_temporary_nodes_survive() {
        let db = setup_db().await;
        let mut ops = FsOperationSet::new();
        ops.insert(move_op(
            "id111",
            NodeType::Directory,
            "Dir 1/Dir 1.1/Dir 1.1.1",
            "Dir 1/Dir 1.2/Dir 1.2.1/Dir 1.1.1",
        ));
        ops.insert(op(
            FsOpType::Create,
            "id12",
            NodeType::Directory,
            "Dir 1/Dir 1.2",
        ));
        ops.insert(op(
            FsOpType::Create,
            "id121",
            NodeType::Directory,
            "Dir 1/Dir 1.2/Dir 1.2.1",
        ));

        let tree = build(&db, &ops).await;
        assert!(tree.integrity_check());

        let moved = tree.by_node_id(&NodeId::new("id111")).unwrap();
        assert_eq!(
            tree.path_of(moved),
            Path::new("Dir 1/Dir 1.2/Dir 1.2.1/Dir 1.1.1")
        );
        let parent = tree.node(moved).parent().unwrap();
        assert_eq!(tree.node(parent).node_id, Some(NodeId::new("id121")));
        assert!(tree.node(parent).has_event(FsOpType::Create));
    }
}
