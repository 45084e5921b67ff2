//! Bitset-indexed MRCA and monophyly queries over a fixed tip set.
//!
//! Each leaf gets a stable bit index; each node carries the bitset of its
//! descendant leaves. Queries walk up from one query leaf until the node's
//! bitset covers the whole query. Shared references are safe for concurrent
//! readers; mutation requires exclusive access and must be mirrored here
//! through the `on_*` hooks.

use crate::tree::{NodeId, Tree};
use fixedbitset::FixedBitSet;
use nohash_hasher::IntMap;

pub struct MrcaIndex {
    /// Descendant-leaf bits, indexed by arena slot.
    sets: Vec<FixedBitSet>,
    leaf_bit: IntMap<usize, usize>,
    nbits: usize,
}

impl MrcaIndex {
    pub fn build(tree: &Tree) -> Self {
        let mut sets: Vec<FixedBitSet> = (0..tree.node_count())
            .map(|_| FixedBitSet::new())
            .collect();
        let mut leaf_bit = IntMap::default();
        let mut nbits = 0;
        for n in tree.postorder() {
            if tree.is_leaf(n) {
                let bit = nbits;
                nbits += 1;
                leaf_bit.insert(n.0, bit);
                sets[n.0].grow(bit + 1);
                sets[n.0].insert(bit);
            } else {
                let mut acc = FixedBitSet::new();
                for &c in tree.children(n) {
                    union_into(&mut acc, &sets[c.0]);
                }
                sets[n.0] = acc;
            }
        }
        Self {
            sets,
            leaf_bit,
            nbits,
        }
    }

    pub fn num_leaves(&self) -> usize {
        self.nbits
    }

    pub fn descendant_leaf_count(&self, n: NodeId) -> usize {
        self.sets[n.0].count_ones(..)
    }

    pub fn contains_leaf(&self, n: NodeId, leaf: NodeId) -> bool {
        match self.leaf_bit.get(&leaf.0) {
            Some(&bit) => self.sets[n.0].contains(bit),
            None => false,
        }
    }

    /// MRCA of the given leaves, walking up from the first one.
    pub fn mrca(&self, tree: &Tree, leaves: &[NodeId]) -> Option<NodeId> {
        let (&first, rest) = leaves.split_first()?;
        if rest.is_empty() {
            return Some(first);
        }
        let mut query = FixedBitSet::with_capacity(self.nbits);
        for leaf in leaves {
            let bit = *self.leaf_bit.get(&leaf.0).expect("unindexed leaf");
            query.insert(bit);
        }
        let mut cur = first;
        loop {
            if query.is_subset(&self.sets[cur.0]) {
                return Some(cur);
            }
            cur = tree.parent(cur)?;
        }
    }

    /// True when the leaves are exactly the tips of one clade.
    pub fn is_monophyletic(&self, tree: &Tree, leaves: &[NodeId]) -> bool {
        match self.mrca(tree, leaves) {
            Some(m) => self.descendant_leaf_count(m) == leaves.len(),
            None => false,
        }
    }

    /// Mirror `Tree::insert_on_edge` or `Tree::group_children`: the new
    /// node's set is the union of its current children.
    pub fn on_internal_added(&mut self, tree: &Tree, node: NodeId) {
        assert_eq!(node.0, self.sets.len(), "index out of step with the tree");
        let mut acc = FixedBitSet::new();
        for &c in tree.children(node) {
            union_into(&mut acc, &self.sets[c.0]);
        }
        self.sets.push(acc);
    }

    /// Mirror `Tree::graft_leaf`: assign a fresh bit and flip it along the
    /// ancestor chain only.
    pub fn on_leaf_grafted(&mut self, tree: &Tree, leaf: NodeId) {
        assert_eq!(leaf.0, self.sets.len(), "index out of step with the tree");
        let bit = self.nbits;
        self.nbits += 1;
        self.leaf_bit.insert(leaf.0, bit);
        let mut set = FixedBitSet::with_capacity(bit + 1);
        set.insert(bit);
        self.sets.push(set);
        for anc in tree.ancestors(leaf) {
            self.sets[anc.0].grow(bit + 1);
            self.sets[anc.0].insert(bit);
        }
    }
}

fn union_into(dst: &mut FixedBitSet, src: &FixedBitSet) {
    if dst.len() < src.len() {
        dst.grow(src.len());
    }
    dst.union_with(src);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::newick;

    fn setup() -> (Tree, MrcaIndex) {
        let tree = newick::parse("((a:1.0,b:1.0):1.0,(c:1.5,d:1.5):0.5);").unwrap();
        let index = MrcaIndex::build(&tree);
        (tree, index)
    }

    #[test]
    fn agrees_with_naive_mrca() {
        let (tree, index) = setup();
        let a = tree.leaf_id("a").unwrap();
        let b = tree.leaf_id("b").unwrap();
        let d = tree.leaf_id("d").unwrap();
        assert_eq!(index.mrca(&tree, &[a, b]), tree.mrca(&[a, b]));
        assert_eq!(index.mrca(&tree, &[a, d]), Some(tree.root()));
        assert_eq!(index.mrca(&tree, &[a]), Some(a));
    }

    #[test]
    fn monophyly() {
        let (tree, index) = setup();
        let a = tree.leaf_id("a").unwrap();
        let b = tree.leaf_id("b").unwrap();
        let c = tree.leaf_id("c").unwrap();
        assert!(index.is_monophyletic(&tree, &[a, b]));
        assert!(!index.is_monophyletic(&tree, &[a, c]));
        assert!(index.is_monophyletic(&tree, &[a]));
    }

    #[test]
    fn incremental_updates_track_mutations() {
        let (mut tree, mut index) = setup();
        let a = tree.leaf_id("a").unwrap();
        let mid = tree.insert_on_edge(a, 0.5).unwrap();
        index.on_internal_added(&tree, mid);
        let e = tree.graft_leaf(mid, "e").unwrap();
        index.on_leaf_grafted(&tree, e);

        let b = tree.leaf_id("b").unwrap();
        assert!(index.is_monophyletic(&tree, &[a, e]));
        assert_eq!(index.mrca(&tree, &[a, e]), Some(mid));
        assert_eq!(index.mrca(&tree, &[e, b]), tree.mrca(&[e, b]));
        assert_eq!(index.descendant_leaf_count(tree.root()), 5);
    }

    #[test]
    fn grouping_updates_sets() {
        let mut tree = newick::parse("(a:2.0,b:2.0,c:2.0);").unwrap();
        let mut index = MrcaIndex::build(&tree);
        let a = tree.leaf_id("a").unwrap();
        let b = tree.leaf_id("b").unwrap();
        let n = tree.group_children(tree.root(), a, b, 1.0).unwrap();
        index.on_internal_added(&tree, n);
        assert!(index.is_monophyletic(&tree, &[a, b]));
        assert_eq!(index.mrca(&tree, &[a, b]), Some(n));
    }
}
