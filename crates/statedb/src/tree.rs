//! Immutable path tree with structural sharing.
//!
//! The tree maps slash-separated paths to JSON values. Nodes are reference
//! counted and never mutated: a write clones the nodes along the written
//! path and points the copies at the untouched siblings, so forking a tree
//! is an `Arc` clone and divergent branches share their common structure.
//!
//! Writing `null` deletes the subtree at the path; empty interior nodes are
//! pruned on the way back up.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use triad_types::H256;

/// Splits a slash-separated path into segments, dropping empties.
///
/// `"/consensus/number/4/propose"` becomes
/// `["consensus", "number", "4", "propose"]`.
pub fn split_path(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

/// Size and shape information about a subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateInfo {
    /// Total number of nodes in the subtree, including the root
    pub tree_size: usize,
    /// Number of direct children of the subtree root
    pub child_count: usize,
    /// Whether the subtree root carries a value of its own
    pub has_value: bool,
}

#[derive(Debug, Default)]
struct Node {
    value: Option<Value>,
    children: BTreeMap<String, Arc<Node>>,
}

impl Node {
    fn is_empty(&self) -> bool {
        self.value.is_none() && self.children.is_empty()
    }

    fn size(&self) -> usize {
        1 + self.children.values().map(|c| c.size()).sum::<usize>()
    }

    /// Deterministic structural digest: the node's own value bytes (if any)
    /// followed by each child's label and digest in label order.
    fn digest(&self) -> [u8; 32] {
        let mut preimage: Vec<u8> = Vec::new();
        match &self.value {
            Some(v) => {
                preimage.push(1);
                // serde_json maps serialize in sorted key order, so the
                // encoding is canonical.
                preimage.extend(serde_json::to_vec(v).unwrap_or_default());
            }
            None => preimage.push(0),
        }
        for (label, child) in &self.children {
            preimage.extend((label.len() as u32).to_le_bytes());
            preimage.extend(label.as_bytes());
            preimage.extend(child.digest());
        }
        triad_crypto::keccak256(&preimage)
    }
}

/// An immutable state tree handle. Cloning is cheap (one `Arc`).
#[derive(Debug, Clone, Default)]
pub struct StateTree {
    root: Arc<Node>,
}

impl StateTree {
    /// An empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the value at a path, if any.
    pub fn get(&self, path: &[String]) -> Option<Value> {
        let mut node = &self.root;
        for segment in path {
            node = node.children.get(segment)?;
        }
        node.value.clone()
    }

    /// Whether any node (value-bearing or interior) exists at the path.
    pub fn contains(&self, path: &[String]) -> bool {
        let mut node = &self.root;
        for segment in path {
            match node.children.get(segment) {
                Some(child) => node = child,
                None => return false,
            }
        }
        true
    }

    /// Lists the child labels at a path.
    pub fn children(&self, path: &[String]) -> Vec<String> {
        let mut node = &self.root;
        for segment in path {
            match node.children.get(segment) {
                Some(child) => node = child,
                None => return Vec::new(),
            }
        }
        node.children.keys().cloned().collect()
    }

    /// Size and shape of the subtree at a path.
    pub fn info(&self, path: &[String]) -> Option<StateInfo> {
        let mut node = &self.root;
        for segment in path {
            node = node.children.get(segment)?;
        }
        Some(StateInfo {
            tree_size: node.size(),
            child_count: node.children.len(),
            has_value: node.value.is_some(),
        })
    }

    /// Returns a new tree with `value` written at `path`, sharing all
    /// unwritten structure with `self`. Writing `Value::Null` deletes the
    /// subtree at the path.
    pub fn set(&self, path: &[String], value: Value) -> Self {
        let new_root = if value.is_null() {
            Self::delete_at(&self.root, path).unwrap_or_default()
        } else {
            Self::set_at(&self.root, path, value)
        };
        Self { root: new_root }
    }

    fn set_at(node: &Arc<Node>, path: &[String], value: Value) -> Arc<Node> {
        if path.is_empty() {
            return Arc::new(Node {
                value: Some(value),
                children: node.children.clone(),
            });
        }
        let (head, rest) = (&path[0], &path[1..]);
        let child = match node.children.get(head) {
            Some(existing) => Self::set_at(existing, rest, value),
            None => Self::set_at(&Arc::new(Node::default()), rest, value),
        };
        let mut children = node.children.clone();
        children.insert(head.clone(), child);
        Arc::new(Node {
            value: node.value.clone(),
            children,
        })
    }

    /// Deletes the subtree at `path`; returns `None` when the resulting node
    /// is empty so parents can prune it.
    fn delete_at(node: &Arc<Node>, path: &[String]) -> Option<Arc<Node>> {
        if path.is_empty() {
            return None;
        }
        let (head, rest) = (&path[0], &path[1..]);
        let mut children = node.children.clone();
        match node.children.get(head) {
            Some(existing) => match Self::delete_at(existing, rest) {
                Some(replacement) => {
                    children.insert(head.clone(), replacement);
                }
                None => {
                    children.remove(head);
                }
            },
            // Deleting a missing path is a no-op.
            None => return Some(Arc::clone(node)),
        }
        let replacement = Node {
            value: node.value.clone(),
            children,
        };
        if replacement.is_empty() {
            None
        } else {
            Some(Arc::new(replacement))
        }
    }

    /// Deterministic Merkle-style digest of the whole tree.
    pub fn proof_hash(&self) -> H256 {
        H256::new(self.root.digest())
    }

    /// Digest of the subtree at a path; the digest of an empty tree for a
    /// missing path.
    pub fn proof_hash_at(&self, path: &[String]) -> H256 {
        let mut node = &self.root;
        for segment in path {
            match node.children.get(segment) {
                Some(child) => node = child,
                None => return StateTree::new().proof_hash(),
            }
        }
        H256::new(node.digest())
    }

    /// A handle onto the subtree at `path`; an empty tree for a missing
    /// path. Cheap: shares the physical nodes.
    pub fn subtree(&self, path: &[String]) -> Self {
        let mut node = &self.root;
        for segment in path {
            match node.children.get(segment) {
                Some(child) => node = child,
                None => return Self::new(),
            }
        }
        Self {
            root: Arc::clone(node),
        }
    }

    /// Whether the tree holds nothing.
    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Total node count.
    pub fn size(&self) -> usize {
        self.root.size()
    }

    /// Whether two handles share the same physical root.
    pub fn same_root(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.root, &other.root)
    }
}
