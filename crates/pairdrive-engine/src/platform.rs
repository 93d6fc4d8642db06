//! Platform-consistency checker
//!
//! Names arriving from the remote replica are not necessarily legal on the
//! local filesystem. This stage walks the remote update tree before
//! reconciliation and either records a substitute local name on the node or
//! reports the node for temporary blacklisting when no substitute exists.

use tracing::{debug, warn};

use pairdrive_core::domain::{FsOpType, NodeId};

use crate::tree::UpdateTree;

/// Longest absolute path the local platform accepts.
pub const MAX_PATH_LENGTH: usize = 4096;

/// Longest single name component.
pub const MAX_NAME_LENGTH: usize = 255;

/// Naming rules of the platform the local replica lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamingRules {
    Unix,
    Windows,
}

impl NamingRules {
    /// Rules of the platform this binary runs on.
    pub fn native() -> Self {
        if cfg!(windows) {
            NamingRules::Windows
        } else {
            NamingRules::Unix
        }
    }

    fn is_reserved_char(self, c: char) -> bool {
        match self {
            NamingRules::Unix => c == '/' || c == '\0',
            NamingRules::Windows => {
                matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*') || (c as u32) < 32
            }
        }
    }

    fn is_reserved_name(self, name: &str) -> bool {
        if self == NamingRules::Unix {
            return false;
        }
        let stem = name.split('.').next().unwrap_or(name).to_ascii_uppercase();
        matches!(stem.as_str(), "CON" | "PRN" | "AUX" | "NUL")
            || (stem.len() == 4
                && (stem.starts_with("COM") || stem.starts_with("LPT"))
                && stem.ends_with(|c: char| c.is_ascii_digit()))
    }
}

/// Verdict on one name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameVerdict {
    Ok,
    /// Illegal, but a substitute works.
    Fixable(String),
    /// No legal substitute; the node must be set aside.
    Unfixable,
}

/// Checks and fixes names against the local platform rules
pub struct PlatformChecker {
    rules: NamingRules,
}

impl PlatformChecker {
    pub fn new(rules: NamingRules) -> Self {
        Self { rules }
    }

    pub fn check_name(&self, name: &str) -> NameVerdict {
        if name.is_empty() || name == "." || name == ".." {
            return NameVerdict::Unfixable;
        }

        let mut fixed: String = name
            .chars()
            .map(|c| if self.rules.is_reserved_char(c) { '_' } else { c })
            .collect();

        if self.rules == NamingRules::Windows {
            while fixed.ends_with('.') || fixed.ends_with(' ') {
                fixed.pop();
            }
        }

        if fixed.len() > MAX_NAME_LENGTH {
            // cut on a char boundary
            let mut end = MAX_NAME_LENGTH;
            while !fixed.is_char_boundary(end) {
                end -= 1;
            }
            fixed.truncate(end);
        }

        if fixed.is_empty() || self.rules.is_reserved_name(&fixed) {
            return NameVerdict::Unfixable;
        }

        if fixed == name {
            NameVerdict::Ok
        } else {
            NameVerdict::Fixable(fixed)
        }
    }

    /// Checks incoming names on the remote tree and records substitutes.
    ///
    /// Returns the ids of nodes whose names cannot be fixed; the caller puts
    /// them on the temporary blacklist and restarts detection without them.
    pub fn check_tree(&self, remote: &mut UpdateTree) -> Vec<NodeId> {
        let mut unfixable = Vec::new();
        let refs: Vec<_> = remote.refs().collect();
        for r in refs {
            let node = remote.node(r);
            // only names that will be applied locally matter
            if !(node.has_event(FsOpType::Create) || node.has_event(FsOpType::Move)) {
                continue;
            }
            match self.check_name(&node.name) {
                NameVerdict::Ok => {}
                NameVerdict::Fixable(fixed) => {
                    debug!(name = %node.name, substitute = %fixed, "Illegal local name fixed");
                    remote.node_mut(r).valid_local_name = Some(fixed);
                }
                NameVerdict::Unfixable => {
                    warn!(name = %remote.node(r).name, "Name cannot be represented locally");
                    if let Some(id) = remote.node(r).node_id.clone() {
                        unfixable.push(id);
                    }
                }
            }
        }
        unfixable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pairdrive_core::domain::{NodeType, ReplicaSide};

    use crate::tree::make_node;

    #[test]
    fn test_unix_allows_windows_specials() {
        let checker = PlatformChecker::new(NamingRules::Unix);
        assert_eq!(checker.check_name("report: final?.txt"), NameVerdict::Ok);
        assert_eq!(checker.check_name("trailing dot."), NameVerdict::Ok);
    }

    #[test]
    fn test_windows_reserved_chars_fixed() {
        let checker = PlatformChecker::new(NamingRules::Windows);
        assert_eq!(
            checker.check_name("a:b?.txt"),
            NameVerdict::Fixable("a_b_.txt".to_string())
        );
    }

    #[test]
    fn test_windows_trailing_dot_trimmed() {
        let checker = PlatformChecker::new(NamingRules::Windows);
        assert_eq!(
            checker.check_name("notes. "),
            NameVerdict::Fixable("notes".to_string())
        );
    }

    #[test]
    fn test_windows_device_names_unfixable() {
        let checker = PlatformChecker::new(NamingRules::Windows);
        assert_eq!(checker.check_name("CON"), NameVerdict::Unfixable);
        assert_eq!(checker.check_name("com1.txt"), NameVerdict::Unfixable);
        assert_eq!(checker.check_name("LPT9"), NameVerdict::Unfixable);
    }

    #[test]
    fn test_dot_names_unfixable() {
        let checker = PlatformChecker::new(NamingRules::Unix);
        assert_eq!(checker.check_name("."), NameVerdict::Unfixable);
        assert_eq!(checker.check_name(".."), NameVerdict::Unfixable);
        assert_eq!(checker.check_name(""), NameVerdict::Unfixable);
    }

    #[test]
    fn test_overlong_name_truncated() {
        let checker = PlatformChecker::new(NamingRules::Unix);
        let long = "x".repeat(300);
        match checker.check_name(&long) {
            NameVerdict::Fixable(fixed) => assert_eq!(fixed.len(), MAX_NAME_LENGTH),
            other => panic!("expected fix, got {other:?}"),
        }
    }

    #[test]
    fn test_check_tree_records_substitute() {
        let mut tree = UpdateTree::new(ReplicaSide::Remote, 1, NodeId::new("rroot"));
        let r = tree.insert(
            tree.root(),
            make_node(None, Some(NodeId::new("r1")), "bad\0name", NodeType::File),
        );
        tree.node_mut(r).events.insert(FsOpType::Create);

        let checker = PlatformChecker::new(NamingRules::Unix);
        let unfixable = checker.check_tree(&mut tree);

        assert!(unfixable.is_empty());
        assert_eq!(tree.node(r).final_local_name(), "bad_name");
    }

    #[test]
    fn test_check_tree_ignores_untouched_nodes() {
        let mut tree = UpdateTree::new(ReplicaSide::Remote, 1, NodeId::new("rroot"));
        tree.insert(
            tree.root(),
            make_node(Some(2), Some(NodeId::new("r1")), "bad\0name", NodeType::File),
        );

        let checker = PlatformChecker::new(NamingRules::Unix);
        checker.check_tree(&mut tree);

        let r = tree.by_node_id(&NodeId::new("r1")).unwrap();
        assert!(tree.node(r).valid_local_name.is_none());
    }
}
