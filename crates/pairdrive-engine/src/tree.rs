//! Update tree
//!
//! The annotated per-side tree built from one pass's operations. Nodes live
//! in an arena owned by the tree; parent/child edges are indices, children
//! are looked up through the owning container, so no reference cycles exist.
//!
//! A *temporary* node is a placeholder materialized bottom-up from a path
//! before its database backing is known; the builder must merge every
//! temporary node with its real node before the tree is consumed downstream.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use pairdrive_core::domain::{
    ChangeEvents, DbNodeId, FsOpType, NodeId, NodeType, ReplicaSide,
};

/// Index of a node in its tree's arena
pub type NodeRef = usize;

/// Processing state used by the operation generator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeStatus {
    #[default]
    Unprocessed,
    /// One of two pending events emitted (move+edit pairs).
    PartiallyProcessed,
    Processed,
}

/// One node of an update tree
#[derive(Debug, Clone)]
pub struct Node {
    pub db_id: Option<DbNodeId>,
    pub node_id: Option<NodeId>,
    pub name: String,
    pub node_type: NodeType,
    pub events: ChangeEvents,
    /// Path before any move of this pass (self or ancestor composition).
    pub move_origin: Option<PathBuf>,
    pub size: u64,
    pub created_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
    pub content_hash: Option<String>,
    /// Substitute name when the original is illegal on the local platform.
    pub valid_local_name: Option<String>,
    pub tmp: bool,
    pub status: NodeStatus,
    pub(crate) parent: Option<NodeRef>,
    pub(crate) children: Vec<NodeRef>,
    pub(crate) dead: bool,
}

impl Node {
    pub fn has_event(&self, op: FsOpType) -> bool {
        self.events.contains(op)
    }

    /// Name to use on the local replica.
    pub fn final_local_name(&self) -> &str {
        self.valid_local_name.as_deref().unwrap_or(&self.name)
    }

    pub fn parent(&self) -> Option<NodeRef> {
        self.parent
    }

    pub fn children(&self) -> &[NodeRef] {
        &self.children
    }

    pub fn is_directory(&self) -> bool {
        self.node_type == NodeType::Directory
    }
}

/// Arena-backed tree for one replica side
#[derive(Debug, Clone)]
pub struct UpdateTree {
    side: ReplicaSide,
    nodes: Vec<Node>,
    by_node_id: HashMap<NodeId, NodeRef>,
    by_db_id: HashMap<DbNodeId, NodeRef>,
    root: NodeRef,
}

impl UpdateTree {
    pub fn new(side: ReplicaSide, root_db_id: DbNodeId, root_node_id: NodeId) -> Self {
        let root_node = Node {
            db_id: Some(root_db_id),
            node_id: Some(root_node_id.clone()),
            name: String::new(),
            node_type: NodeType::Directory,
            events: ChangeEvents::none(),
            move_origin: None,
            size: 0,
            created_at: None,
            modified_at: None,
            content_hash: None,
            valid_local_name: None,
            tmp: false,
            status: NodeStatus::Unprocessed,
            parent: None,
            children: Vec::new(),
            dead: false,
        };
        let mut by_node_id = HashMap::new();
        by_node_id.insert(root_node_id, 0);
        let mut by_db_id = HashMap::new();
        by_db_id.insert(root_db_id, 0);
        Self {
            side,
            nodes: vec![root_node],
            by_node_id,
            by_db_id,
            root: 0,
        }
    }

    pub fn side(&self) -> ReplicaSide {
        self.side
    }

    pub fn root(&self) -> NodeRef {
        self.root
    }

    pub fn node(&self, r: NodeRef) -> &Node {
        &self.nodes[r]
    }

    pub fn node_mut(&mut self, r: NodeRef) -> &mut Node {
        &mut self.nodes[r]
    }

    /// Live node count, root included.
    pub fn len(&self) -> usize {
        self.nodes.iter().filter(|n| !n.dead).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }

    /// All live node refs, root included, in arena order.
    pub fn refs(&self) -> impl Iterator<Item = NodeRef> + '_ {
        (0..self.nodes.len()).filter(|&r| !self.nodes[r].dead)
    }

    // ------------------------------------------------------------------
    // Construction
    // ------------------------------------------------------------------

    /// Inserts a node under `parent` and indexes its identifiers.
    pub fn insert(&mut self, parent: NodeRef, node: Node) -> NodeRef {
        let r = self.nodes.len();
        if let Some(ref id) = node.node_id {
            self.by_node_id.insert(id.clone(), r);
        }
        if let Some(db_id) = node.db_id {
            self.by_db_id.insert(db_id, r);
        }
        let mut node = node;
        node.parent = Some(parent);
        self.nodes.push(node);
        self.nodes[parent].children.push(r);
        r
    }

    /// Creates a temporary placeholder named `name` under `parent`.
    pub fn insert_tmp(&mut self, parent: NodeRef, name: &str) -> NodeRef {
        self.insert(
            parent,
            Node {
                db_id: None,
                node_id: None,
                name: name.to_string(),
                node_type: NodeType::Directory,
                events: ChangeEvents::none(),
                move_origin: None,
                size: 0,
                created_at: None,
                modified_at: None,
                content_hash: None,
                valid_local_name: None,
                tmp: true,
                status: NodeStatus::Unprocessed,
                parent: None,
                children: Vec::new(),
                dead: false,
            },
        )
    }

    pub fn reparent(&mut self, r: NodeRef, new_parent: NodeRef) {
        if let Some(old_parent) = self.nodes[r].parent {
            self.nodes[old_parent].children.retain(|&c| c != r);
        }
        self.nodes[r].parent = Some(new_parent);
        self.nodes[new_parent].children.push(r);
    }

    /// Merges a temporary placeholder into the real node standing at the same
    /// path: the real node adopts the placeholder's children and the
    /// placeholder disappears.
    pub fn merge_tmp_into(&mut self, tmp: NodeRef, real: NodeRef) {
        debug_assert!(self.nodes[tmp].tmp);
        let children = std::mem::take(&mut self.nodes[tmp].children);
        for child in &children {
            self.nodes[*child].parent = Some(real);
        }
        self.nodes[real].children.extend(children);
        if let Some(parent) = self.nodes[tmp].parent {
            self.nodes[parent].children.retain(|&c| c != tmp);
        }
        self.nodes[tmp].parent = None;
        self.nodes[tmp].dead = true;
    }

    /// Turns a temporary node into a real one in place.
    pub fn realize_tmp(
        &mut self,
        r: NodeRef,
        db_id: Option<DbNodeId>,
        node_id: Option<NodeId>,
        node_type: NodeType,
    ) {
        let node = &mut self.nodes[r];
        node.tmp = false;
        node.db_id = db_id;
        node.node_type = node_type;
        node.node_id = node_id.clone();
        if let Some(db_id) = db_id {
            self.by_db_id.insert(db_id, r);
        }
        if let Some(id) = node_id {
            self.by_node_id.insert(id, r);
        }
    }

    /// Replaces a node's per-side identifier (delete+create collapse).
    pub fn set_node_id(&mut self, r: NodeRef, node_id: NodeId) {
        if let Some(old) = self.nodes[r].node_id.take() {
            self.by_node_id.remove(&old);
        }
        self.by_node_id.insert(node_id.clone(), r);
        self.nodes[r].node_id = Some(node_id);
    }

    pub fn set_db_id(&mut self, r: NodeRef, db_id: DbNodeId) {
        if let Some(old) = self.nodes[r].db_id.take() {
            self.by_db_id.remove(&old);
        }
        self.by_db_id.insert(db_id, r);
        self.nodes[r].db_id = Some(db_id);
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    pub fn by_node_id(&self, id: &NodeId) -> Option<NodeRef> {
        self.by_node_id.get(id).copied().filter(|&r| !self.nodes[r].dead)
    }

    pub fn by_db_id(&self, db_id: DbNodeId) -> Option<NodeRef> {
        self.by_db_id.get(&db_id).copied().filter(|&r| !self.nodes[r].dead)
    }

    /// First live child of `parent` with the given name.
    pub fn child_by_name(&self, parent: NodeRef, name: &str) -> Option<NodeRef> {
        self.nodes[parent]
            .children
            .iter()
            .copied()
            .find(|&c| !self.nodes[c].dead && self.nodes[c].name == name)
    }

    /// Child by name, skipping nodes that carry the excluded event.
    pub fn child_by_name_except(
        &self,
        parent: NodeRef,
        name: &str,
        excluded: FsOpType,
    ) -> Option<NodeRef> {
        self.nodes[parent].children.iter().copied().find(|&c| {
            !self.nodes[c].dead
                && self.nodes[c].name == name
                && !self.nodes[c].has_event(excluded)
        })
    }

    /// Resolves a relative path from the root. Empty path is the root.
    pub fn by_path(&self, path: &Path) -> Option<NodeRef> {
        let mut current = self.root;
        for component in path.components() {
            let name = component.as_os_str().to_string_lossy();
            current = self.child_by_name(current, &name)?;
        }
        Some(current)
    }

    /// Current path of a node in the tree.
    pub fn path_of(&self, r: NodeRef) -> PathBuf {
        let mut names: Vec<&str> = Vec::new();
        let mut current = r;
        while let Some(parent) = self.nodes[current].parent {
            names.push(&self.nodes[current].name);
            current = parent;
        }
        let mut path = PathBuf::new();
        for name in names.iter().rev() {
            path.push(name);
        }
        path
    }

    /// Path of the node before any move of this pass.
    ///
    /// A moved node stores its own origin; for everything else the origin is
    /// the nearest moved ancestor's origin composed with the unmoved names
    /// below it.
    pub fn origin_path_of(&self, r: NodeRef) -> PathBuf {
        if self.nodes[r].has_event(FsOpType::Move) {
            if let Some(ref origin) = self.nodes[r].move_origin {
                return origin.clone();
            }
        }
        match self.nodes[r].parent {
            None => PathBuf::new(),
            Some(parent) => {
                let mut path = self.origin_path_of(parent);
                path.push(&self.nodes[r].name);
                path
            }
        }
    }

    /// True when `ancestor` lies on the parent chain of `r`.
    pub fn is_ancestor(&self, ancestor: NodeRef, r: NodeRef) -> bool {
        let mut current = self.nodes[r].parent;
        while let Some(p) = current {
            if p == ancestor {
                return true;
            }
            current = self.nodes[p].parent;
        }
        false
    }

    /// All live descendants of `r` (not including `r`).
    pub fn descendants(&self, r: NodeRef) -> Vec<NodeRef> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeRef> = self.nodes[r]
            .children
            .iter()
            .copied()
            .filter(|&c| !self.nodes[c].dead)
            .collect();
        while let Some(current) = stack.pop() {
            out.push(current);
            stack.extend(
                self.nodes[current]
                    .children
                    .iter()
                    .copied()
                    .filter(|&c| !self.nodes[c].dead),
            );
        }
        out
    }

    pub fn mark_all_unprocessed(&mut self) {
        for node in &mut self.nodes {
            node.status = NodeStatus::Unprocessed;
        }
    }

    /// No temporary node may survive tree construction.
    pub fn integrity_check(&self) -> bool {
        self.refs().all(|r| !self.nodes[r].tmp)
    }

    /// Multi-line rendering of the tree for trace logs.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_node(self.root, 0, &mut out);
        out
    }

    fn render_node(&self, r: NodeRef, depth: usize, out: &mut String) {
        let node = &self.nodes[r];
        let name = if node.name.is_empty() { "<root>" } else { &node.name };
        out.push_str(&"  ".repeat(depth));
        out.push_str(name);
        if node.tmp {
            out.push_str(" [tmp]");
        }
        for op in [FsOpType::Create, FsOpType::Edit, FsOpType::Move, FsOpType::Delete] {
            if node.has_event(op) {
                out.push_str(&format!(" +{}", op.as_str()));
            }
        }
        out.push('\n');
        for &child in &node.children {
            if !self.nodes[child].dead {
                self.render_node(child, depth + 1, out);
            }
        }
    }
}

/// Finds the node in `other` standing for the same logical entity as `r` in
/// `tree`.
///
/// Nodes with database backing correspond through their db id; fresh creates
/// correspond through their relative path.
pub fn corresponding_node(tree: &UpdateTree, r: NodeRef, other: &UpdateTree) -> Option<NodeRef> {
    if let Some(db_id) = tree.node(r).db_id {
        return other.by_db_id(db_id);
    }
    other.by_path(&tree.path_of(r))
}

/// Builder for real (non-temporary) nodes
pub fn make_node(
    db_id: Option<DbNodeId>,
    node_id: Option<NodeId>,
    name: impl Into<String>,
    node_type: NodeType,
) -> Node {
    Node {
        db_id,
        node_id,
        name: name.into(),
        node_type,
        events: ChangeEvents::none(),
        move_origin: None,
        size: 0,
        created_at: None,
        modified_at: None,
        content_hash: None,
        valid_local_name: None,
        tmp: false,
        status: NodeStatus::Unprocessed,
        parent: None,
        children: Vec::new(),
        dead: false,
    }
}
