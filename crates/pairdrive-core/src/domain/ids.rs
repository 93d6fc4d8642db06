//! Identifiers and sides
//!
//! Every synchronized object carries one opaque identifier per replica
//! (inode-derived locally, server-assigned remotely) and one dense database
//! id once it is known to the sync database. Identifiers survive renames and
//! moves; they are the invariant identity of a node.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Which replica a value belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicaSide {
    Local,
    Remote,
}

impl ReplicaSide {
    /// The other replica
    pub fn opposite(self) -> Self {
        match self {
            ReplicaSide::Local => ReplicaSide::Remote,
            ReplicaSide::Remote => ReplicaSide::Local,
        }
    }

    /// Lowercase name used in logs and in the database
    pub fn as_str(self) -> &'static str {
        match self {
            ReplicaSide::Local => "local",
            ReplicaSide::Remote => "remote",
        }
    }
}

impl fmt::Display for ReplicaSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque per-replica node identifier
///
/// Locally this is derived from `(device, inode)`; remotely it is the
/// server-assigned item id. The engine never interprets the content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Dense identifier assigned by the sync database (SQLite rowid)
pub type DbNodeId = i64;

/// Kind of filesystem object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    File,
    Directory,
}

impl NodeType {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeType::File => "file",
            NodeType::Directory => "directory",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_opposite() {
        assert_eq!(ReplicaSide::Local.opposite(), ReplicaSide::Remote);
        assert_eq!(ReplicaSide::Remote.opposite(), ReplicaSide::Local);
    }

    #[test]
    fn test_node_id_display() {
        let id = NodeId::new("dev1-ino42");
        assert_eq!(id.to_string(), "dev1-ino42");
        assert_eq!(id.as_str(), "dev1-ino42");
    }

    #[test]
    fn test_node_type_str() {
        assert_eq!(NodeType::File.as_str(), "file");
        assert_eq!(NodeType::Directory.as_str(), "directory");
    }
}
