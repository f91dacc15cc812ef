//! Next-hop plan for a multicast path

use crate::routing::PeerId;

/// Rooted multi-way tree of peers describing where a multicast travels next.
///
/// The root is the peer holding the tree; each child subtree is handed to the
/// corresponding next hop in a `MulticastHandshake`. A leaf is a terminal
/// destination (or the local peer, at the root of a degenerate tree).
/// Children are kept sorted by id so serialization is deterministic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HopTree {
    /// Peer this subtree is rooted at
    pub id: PeerId,
    /// Subtrees for each next hop, ordered by id
    pub children: Vec<HopTree>,
}

impl HopTree {
    /// A tree consisting of just one peer
    pub fn leaf(id: PeerId) -> Self {
        Self {
            id,
            children: Vec::new(),
        }
    }

    /// Whether this node has no descendants
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Graft a root-to-destination path into the tree, merging the longest
    /// common prefix with branches already present.
    ///
    /// `path` must start at this tree's root.
    pub fn merge_path(&mut self, path: &[PeerId]) {
        debug_assert_eq!(path.first(), Some(&self.id));
        let mut node = self;
        for hop in &path[1..] {
            let pos = match node.children.binary_search_by(|c| c.id.cmp(hop)) {
                Ok(pos) => pos,
                Err(pos) => {
                    node.children.insert(pos, HopTree::leaf(*hop));
                    pos
                }
            };
            node = &mut node.children[pos];
        }
    }

    /// All peers in this subtree, root included, preorder.
    pub fn peers(&self) -> Vec<PeerId> {
        let mut out = Vec::new();
        self.collect(&mut out);
        out
    }

    fn collect(&self, out: &mut Vec<PeerId>) {
        out.push(self.id);
        for child in &self.children {
            child.collect(out);
        }
    }

    /// Count of peers in this subtree that appear in `set`.
    pub fn count_in(&self, set: &std::collections::BTreeSet<PeerId>) -> usize {
        self.peers().iter().filter(|p| set.contains(p)).count()
    }
}
