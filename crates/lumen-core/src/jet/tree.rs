//! The versioned jet tree (C4).
//!
//! One binary trie per pulse. A pulse's tree is immutable once the pulse
//! closes; the next pulse starts from a clone. Leaves carry an `actual`
//! flag: a cloned tree keeps the structure but drops actuality, and leaves
//! become actual again as the node confirms them (hot handoff or fetch).
//!
//! Invariants: leaves always form a complete, non-overlapping prefix cover;
//! depth never exceeds [`super::MAX_JET_DEPTH`]; `find` is a pure function
//! of the tree at the queried pulse.

use std::collections::HashMap;
use std::sync::RwLock;

use thiserror::Error;

use crate::error::CoreError;
use crate::id::{OBJECT_ID_SIZE, ObjectId};
use crate::pulse::PulseNumber;

use super::JetId;

/// Errors from tree mutations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
    /// The mutation would give the tree two leaves in a prefix relation.
    #[error("jet {jet} would overlap an actual leaf")]
    Overlap {
        /// The offending jet.
        jet: JetId,
    },

    /// Split of a jet that already has children.
    #[error("jet {jet} is already split")]
    AlreadySplit {
        /// The jet that was split before.
        jet: JetId,
    },

    /// The jet is not a node of the tree.
    #[error("jet {jet} is unknown to the tree")]
    UnknownJet {
        /// The jet that was looked up.
        jet: JetId,
    },

    /// The mutation would push a leaf past the maximum depth.
    #[error("jet {jet} is at maximum depth")]
    DepthExceeded {
        /// The jet at the depth limit.
        jet: JetId,
    },
}

impl From<TreeError> for CoreError {
    fn from(err: TreeError) -> Self {
        match err {
            TreeError::UnknownJet { .. } => Self::not_found("jet"),
            other => Self::InvalidState {
                details: other.to_string(),
            },
        }
    }
}

#[derive(Clone, Debug)]
enum Node {
    Leaf { actual: bool },
    Branch { left: Box<Node>, right: Box<Node> },
}

impl Node {
    const fn leaf(actual: bool) -> Self {
        Self::Leaf { actual }
    }
}

#[derive(Clone, Debug)]
struct Tree {
    root: Node,
}

impl Default for Tree {
    fn default() -> Self {
        Self {
            root: Node::leaf(false),
        }
    }
}

/// A cursor that grows a [`JetId`] while descending.
struct Path {
    depth: u8,
    prefix: [u8; OBJECT_ID_SIZE],
}

impl Path {
    const fn root() -> Self {
        Self {
            depth: 0,
            prefix: [0u8; OBJECT_ID_SIZE],
        }
    }

    fn push(&mut self, bit: bool) {
        if bit {
            self.prefix[usize::from(self.depth / 8)] |= 0x80 >> (self.depth % 8);
        }
        self.depth += 1;
    }

    fn jet(&self) -> JetId {
        JetId::new(self.depth, self.prefix)
    }
}

impl Tree {
    fn find(&self, id: &ObjectId) -> (JetId, bool) {
        let mut node = &self.root;
        let mut path = Path::root();
        loop {
            match node {
                Node::Leaf { actual } => return (path.jet(), *actual),
                Node::Branch { left, right } => {
                    let bit = id.bit(path.depth);
                    node = if bit { right.as_ref() } else { left.as_ref() };
                    path.push(bit);
                }
            }
        }
    }

    /// Inserts or marks the leaf for `jet`.
    ///
    /// Descending through a non-actual leaf grows it into a branch of two
    /// non-actual leaves, which preserves the complete cover. An actual leaf
    /// on the way down is authoritative, so the insert is an overlap; so is
    /// marking a node that already has children.
    fn update(&mut self, jet: JetId, actual: bool) -> Result<(), TreeError> {
        let mut node = &mut self.root;
        for depth in 0..jet.depth() {
            match node {
                Node::Leaf { actual: true } => {
                    return Err(TreeError::Overlap { jet });
                }
                Node::Leaf { actual: false } => {
                    *node = Node::Branch {
                        left: Box::new(Node::leaf(false)),
                        right: Box::new(Node::leaf(false)),
                    };
                }
                Node::Branch { .. } => {}
            }
            let Node::Branch { left, right } = node else {
                unreachable!("leaf was just grown into a branch");
            };
            node = if jet.bit(depth) {
                right.as_mut()
            } else {
                left.as_mut()
            };
        }
        match node {
            Node::Leaf { actual: slot } => {
                *slot = actual;
                Ok(())
            }
            Node::Branch { .. } => Err(TreeError::Overlap { jet }),
        }
    }

    fn split(&mut self, jet: JetId) -> Result<(JetId, JetId), TreeError> {
        let (left_jet, right_jet) = jet
            .children()
            .ok_or(TreeError::DepthExceeded { jet })?;
        let mut node = &mut self.root;
        for depth in 0..jet.depth() {
            match node {
                Node::Leaf { .. } => return Err(TreeError::UnknownJet { jet }),
                Node::Branch { left, right } => {
                    node = if jet.bit(depth) {
                        right.as_mut()
                    } else {
                        left.as_mut()
                    };
                }
            }
        }
        match node {
            Node::Leaf { actual } => {
                let actual = *actual;
                *node = Node::Branch {
                    left: Box::new(Node::leaf(actual)),
                    right: Box::new(Node::leaf(actual)),
                };
                Ok((left_jet, right_jet))
            }
            Node::Branch { .. } => Err(TreeError::AlreadySplit { jet }),
        }
    }

    fn all(&self) -> Vec<JetId> {
        fn walk(node: &Node, path: &mut Path, out: &mut Vec<JetId>) {
            match node {
                Node::Leaf { .. } => out.push(path.jet()),
                Node::Branch { left, right } => {
                    let saved = (path.depth, path.prefix);
                    path.push(false);
                    walk(left, path, out);
                    (path.depth, path.prefix) = saved;
                    path.push(true);
                    walk(right, path, out);
                    (path.depth, path.prefix) = saved;
                }
            }
        }
        let mut out = Vec::new();
        walk(&self.root, &mut Path::root(), &mut out);
        out
    }

    fn with_actuality(&self, actual: bool) -> Self {
        fn copy(node: &Node, actual: bool) -> Node {
            match node {
                Node::Leaf { .. } => Node::leaf(actual),
                Node::Branch { left, right } => Node::Branch {
                    left: Box::new(copy(left, actual)),
                    right: Box::new(copy(right, actual)),
                },
            }
        }
        Self {
            root: copy(&self.root, actual),
        }
    }
}

/// Owner of the per-pulse jet trees.
///
/// All other components hold read-only handles; mutation goes through this
/// type only.
#[derive(Default)]
pub struct TreeStore {
    trees: RwLock<HashMap<u32, Tree>>,
}

impl TreeStore {
    /// Creates an empty store. A pulse with no tree behaves as a single
    /// non-actual root leaf.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves the leaf covering `id` in the tree for `pulse`.
    #[must_use]
    pub fn find(&self, pulse: PulseNumber, id: &ObjectId) -> (JetId, bool) {
        let trees = self.trees.read().expect("jet tree lock poisoned");
        trees
            .get(&pulse.get())
            .map_or((JetId::ROOT, false), |tree| tree.find(id))
    }

    /// Inserts or marks a leaf in the tree for `pulse`.
    pub fn update(
        &self,
        pulse: PulseNumber,
        jet: JetId,
        actual: bool,
    ) -> Result<(), TreeError> {
        let mut trees = self.trees.write().expect("jet tree lock poisoned");
        trees.entry(pulse.get()).or_default().update(jet, actual)
    }

    /// Splits the leaf `jet` into its two children.
    pub fn split(
        &self,
        pulse: PulseNumber,
        jet: JetId,
    ) -> Result<(JetId, JetId), TreeError> {
        let mut trees = self.trees.write().expect("jet tree lock poisoned");
        trees.entry(pulse.get()).or_default().split(jet)
    }

    /// Deep-copies the tree of `src` into `dst`, setting every leaf's
    /// `actual` flag to the given value.
    pub fn clone_tree(&self, src: PulseNumber, dst: PulseNumber, actual: bool) {
        let mut trees = self.trees.write().expect("jet tree lock poisoned");
        let copy = trees
            .get(&src.get())
            .map_or_else(|| Tree::default().with_actuality(actual), |tree| {
                tree.with_actuality(actual)
            });
        trees.insert(dst.get(), copy);
    }

    /// Enumerates the leaves of the tree for `pulse`, in order by prefix.
    #[must_use]
    pub fn all(&self, pulse: PulseNumber) -> Vec<JetId> {
        let trees = self.trees.read().expect("jet tree lock poisoned");
        trees
            .get(&pulse.get())
            .map_or_else(|| vec![JetId::ROOT], Tree::all)
    }

    /// Drops the tree for `pulse`. Used by light eviction once the pulse is
    /// synced.
    pub fn remove(&self, pulse: PulseNumber) {
        let mut trees = self.trees.write().expect("jet tree lock poisoned");
        trees.remove(&pulse.get());
    }
}
