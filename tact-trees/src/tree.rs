use crate::TreeError;
use bitflags::bitflags;
use hashbrown::HashMap;
use tact_common::Time;

/// Index of a node in the tree arena. Nodes are append-only, so ids handed
/// out before a mutation remain valid afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

bitflags! {
    pub struct NodeFlags: u8 {
        /// Present in the tree before any placement mutation.
        const ORIGINAL = 0b0001;
        /// Added by the placement engine.
        const GRAFTED = 0b0010;
        /// Detached by pruning; unreachable from the root.
        const REMOVED = 0b0100;
    }
}

#[derive(Debug, Clone)]
pub struct TreeNode {
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    /// Branch length to the parent; meaningless for the root.
    pub length: Time,
    pub label: Option<String>,
    /// Distance to any descendant leaf. Maintained by every mutation.
    pub age: Time,
    pub flags: NodeFlags,
}

/// A rooted tree with branch lengths and a precomputed age per node.
#[derive(Debug, Clone)]
pub struct Tree {
    nodes: Vec<TreeNode>,
    root: NodeId,
    leaves: HashMap<String, NodeId>,
}

impl Tree {
    /// Assemble a tree from parallel per-node arrays. Exactly one node must
    /// be parentless; every leaf must carry a label, unique across the tree.
    pub fn from_parts(
        parents: Vec<Option<usize>>,
        lengths: Vec<Time>,
        labels: Vec<Option<String>>,
    ) -> Result<Self, TreeError> {
        assert_eq!(parents.len(), lengths.len());
        assert_eq!(parents.len(), labels.len());
        if parents.is_empty() {
            return Err(TreeError::EmptyTree);
        }

        let n = parents.len();
        let mut nodes: Vec<TreeNode> = (0..n)
            .map(|i| TreeNode {
                parent: parents[i].map(NodeId),
                children: vec![],
                length: lengths[i],
                label: labels[i].clone(),
                age: 0.0,
                flags: NodeFlags::ORIGINAL,
            })
            .collect();

        let mut root = None;
        for i in 0..n {
            match parents[i] {
                Some(p) => nodes[p].children.push(NodeId(i)),
                None => {
                    assert!(root.is_none(), "more than one parentless node");
                    root = Some(NodeId(i));
                }
            }
        }
        let root = root.expect("no parentless node");

        let mut tree = Self {
            nodes,
            root,
            leaves: HashMap::new(),
        };
        for i in 0..n {
            let id = NodeId(i);
            if tree.nodes[i].children.is_empty() {
                let label = match &tree.nodes[i].label {
                    Some(l) => l.clone(),
                    None => return Err(TreeError::UnlabeledLeaf { index: i }),
                };
                if tree.leaves.insert(label.clone(), id).is_some() {
                    return Err(TreeError::NameConflict { name: label });
                }
            }
        }
        if tree.leaves.is_empty() {
            return Err(TreeError::EmptyTree);
        }
        tree.recompute_ages();
        Ok(tree)
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn parent(&self, n: NodeId) -> Option<NodeId> {
        self.nodes[n.0].parent
    }

    pub fn children(&self, n: NodeId) -> &[NodeId] {
        &self.nodes[n.0].children
    }

    pub fn label(&self, n: NodeId) -> Option<&str> {
        self.nodes[n.0].label.as_deref()
    }

    pub fn length(&self, n: NodeId) -> Time {
        self.nodes[n.0].length
    }

    pub fn age(&self, n: NodeId) -> Time {
        self.nodes[n.0].age
    }

    pub fn flags(&self, n: NodeId) -> NodeFlags {
        self.nodes[n.0].flags
    }

    pub fn is_leaf(&self, n: NodeId) -> bool {
        self.nodes[n.0].children.is_empty()
    }

    pub fn leaf_id(&self, name: &str) -> Option<NodeId> {
        self.leaves.get(name).copied()
    }

    pub fn leaf_names(&self) -> impl Iterator<Item = &str> {
        self.leaves.keys().map(|s| s.as_str())
    }

    pub fn num_leaves(&self) -> usize {
        self.leaves.len()
    }

    /// Walk from `n` to the root, excluding `n` itself.
    pub fn ancestors(&self, n: NodeId) -> Ancestors<'_> {
        Ancestors {
            tree: self,
            cursor: self.nodes[n.0].parent,
        }
    }

    pub fn is_ancestor_of(&self, anc: NodeId, n: NodeId) -> bool {
        self.ancestors(n).any(|a| a == anc)
    }

    pub fn postorder(&self) -> Vec<NodeId> {
        self.postorder_from(self.root)
    }

    pub fn postorder_from(&self, start: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![(start, false)];
        while let Some((n, expanded)) = stack.pop() {
            if expanded {
                out.push(n);
            } else {
                stack.push((n, true));
                for &c in self.nodes[n.0].children.iter().rev() {
                    stack.push((c, false));
                }
            }
        }
        out
    }

    pub fn leaves_under(&self, n: NodeId) -> Vec<NodeId> {
        self.postorder_from(n)
            .into_iter()
            .filter(|&m| self.is_leaf(m))
            .collect()
    }

    /// Most recent common ancestor by ancestor-chain marking. The fast path
    /// for repeated queries is `MrcaIndex`.
    pub fn mrca(&self, leaves: &[NodeId]) -> Option<NodeId> {
        let (&first, rest) = leaves.split_first()?;
        if rest.is_empty() {
            return Some(first);
        }
        let chain: Vec<NodeId> = std::iter::once(first).chain(self.ancestors(first)).collect();
        let on_chain: HashMap<NodeId, usize> =
            chain.iter().enumerate().map(|(i, &n)| (n, i)).collect();
        let mut deepest = 0usize;
        for &leaf in rest {
            let mut cur = leaf;
            loop {
                if let Some(&i) = on_chain.get(&cur) {
                    deepest = deepest.max(i);
                    break;
                }
                cur = self.nodes[cur.0].parent?;
            }
        }
        Some(chain[deepest])
    }

    /// Ages of every internal node in the subtree rooted at `n`, oldest
    /// first. The subtree root itself is included.
    pub fn branching_times(&self, n: NodeId) -> Vec<Time> {
        let mut times: Vec<Time> = self
            .postorder_from(n)
            .into_iter()
            .filter(|&m| self.nodes[m.0].children.len() >= 2)
            .map(|m| self.nodes[m.0].age)
            .collect();
        times.sort_by(|a, b| b.partial_cmp(a).unwrap());
        times
    }

    /// Internal nodes with more than two children in the subtree at `n`.
    pub fn polytomies_under(&self, n: NodeId) -> Vec<NodeId> {
        self.postorder_from(n)
            .into_iter()
            .filter(|&m| self.nodes[m.0].children.len() > 2)
            .collect()
    }

    /// Split the edge above `child` at age `at`, returning the new node.
    /// Ages of existing nodes are untouched.
    pub fn insert_on_edge(&mut self, child: NodeId, at: Time) -> Result<NodeId, TreeError> {
        let parent = self.nodes[child.0].parent.ok_or(TreeError::NoParentEdge)?;
        let young = self.nodes[child.0].age;
        let old = self.nodes[parent.0].age;
        if !(young < at && at < old) {
            return Err(TreeError::BadInsertionAge { at, young, old });
        }
        let id = NodeId(self.nodes.len());
        self.nodes.push(TreeNode {
            parent: Some(parent),
            children: vec![child],
            length: old - at,
            label: None,
            age: at,
            flags: NodeFlags::GRAFTED,
        });
        let slot = self.nodes[parent.0]
            .children
            .iter()
            .position(|&c| c == child)
            .expect("child not attached to its parent");
        self.nodes[parent.0].children[slot] = id;
        self.nodes[child.0].parent = Some(id);
        self.nodes[child.0].length = at - young;
        Ok(id)
    }

    /// Attach a new leaf below `parent` with a branch reaching the present.
    pub fn graft_leaf(&mut self, parent: NodeId, name: &str) -> Result<NodeId, TreeError> {
        if self.leaves.contains_key(name) {
            return Err(TreeError::NameConflict {
                name: name.to_string(),
            });
        }
        let length = self.nodes[parent.0].age;
        let id = NodeId(self.nodes.len());
        self.nodes.push(TreeNode {
            parent: Some(parent),
            children: vec![],
            length,
            label: Some(name.to_string()),
            age: 0.0,
            flags: NodeFlags::GRAFTED,
        });
        self.nodes[parent.0].children.push(id);
        self.leaves.insert(name.to_string(), id);
        Ok(id)
    }

    /// Gather two children of `parent` under a new node at age `at`,
    /// reducing the degree of `parent` by one.
    pub fn group_children(
        &mut self,
        parent: NodeId,
        a: NodeId,
        b: NodeId,
        at: Time,
    ) -> Result<NodeId, TreeError> {
        assert_ne!(a, b);
        if self.nodes[parent.0].children.len() < 3 {
            return Err(TreeError::BadGrouping {
                requested: 2,
                available: self.nodes[parent.0].children.len(),
            });
        }
        let young = self.nodes[a.0].age.max(self.nodes[b.0].age);
        let old = self.nodes[parent.0].age;
        if !(young < at && at < old) {
            return Err(TreeError::BadInsertionAge { at, young, old });
        }
        assert!(self.nodes[parent.0].children.contains(&a));
        assert!(self.nodes[parent.0].children.contains(&b));
        let id = NodeId(self.nodes.len());
        self.nodes.push(TreeNode {
            parent: Some(parent),
            children: vec![a, b],
            length: old - at,
            label: None,
            age: at,
            flags: NodeFlags::GRAFTED,
        });
        self.nodes[parent.0].children.retain(|&c| c != a && c != b);
        self.nodes[parent.0].children.push(id);
        for moved in [a, b] {
            self.nodes[moved.0].parent = Some(id);
            self.nodes[moved.0].length = at - self.nodes[moved.0].age;
        }
        Ok(id)
    }

    /// Remove the named leaves, suppressing any unifurcation left behind.
    /// A root reduced to a single child is replaced by that child.
    pub fn prune_leaves(&mut self, names: &[String]) -> usize {
        let mut pruned = 0;
        for name in names {
            let leaf = match self.leaves.remove(name) {
                Some(id) => id,
                None => continue,
            };
            pruned += 1;
            self.detach(leaf);
            let mut cur = self.nodes[leaf.0].parent;
            self.nodes[leaf.0].parent = None;
            while let Some(p) = cur {
                match self.nodes[p.0].children.len() {
                    0 => {
                        // Interior node left childless; keep unwinding.
                        cur = self.nodes[p.0].parent;
                        self.detach(p);
                        self.nodes[p.0].parent = None;
                    }
                    1 => {
                        let only = self.nodes[p.0].children[0];
                        match self.nodes[p.0].parent {
                            Some(gp) => {
                                let slot = self.nodes[gp.0]
                                    .children
                                    .iter()
                                    .position(|&c| c == p)
                                    .expect("node not attached to its parent");
                                self.nodes[gp.0].children[slot] = only;
                                self.nodes[only.0].parent = Some(gp);
                                self.nodes[only.0].length += self.nodes[p.0].length;
                            }
                            None => {
                                self.nodes[only.0].parent = None;
                                self.root = only;
                            }
                        }
                        self.nodes[p.0].children.clear();
                        self.nodes[p.0].parent = None;
                        self.nodes[p.0].flags |= NodeFlags::REMOVED;
                        break;
                    }
                    _ => break,
                }
            }
        }
        pruned
    }

    fn detach(&mut self, n: NodeId) {
        if let Some(p) = self.nodes[n.0].parent {
            self.nodes[p.0].children.retain(|&c| c != n);
        }
        self.nodes[n.0].flags |= NodeFlags::REMOVED;
    }

    /// Root-to-leaf path length disagreement, recomputed from branch lengths.
    /// Returns the worst leaf and its absolute deviation.
    pub fn ultrametric_deviation(&self) -> (String, Time) {
        let depths = self.depths_from_lengths();
        let height = self
            .leaves
            .values()
            .map(|&l| depths[l.0])
            .fold(0.0f64, f64::max);
        let mut worst = (String::new(), 0.0f64);
        for (name, &leaf) in &self.leaves {
            let dev = (height - depths[leaf.0]).abs();
            if dev > worst.1 {
                worst = (name.clone(), dev);
            }
        }
        worst
    }

    /// Check the per-leaf depth discrepancy and absorb it into terminal
    /// branches when it is within `precision`, then rebuild the age index.
    /// Returns the largest correction applied.
    pub fn repair_ultrametric(&mut self, precision: Time) -> Result<Time, TreeError> {
        let depths = self.depths_from_lengths();
        let height = self
            .leaves
            .values()
            .map(|&l| depths[l.0])
            .fold(0.0f64, f64::max);
        let mut max_delta = 0.0f64;
        for &leaf in self.leaves.values() {
            let delta = height - depths[leaf.0];
            if delta.abs() > precision {
                let label = self.nodes[leaf.0]
                    .label
                    .clone()
                    .unwrap_or_else(|| format!("#{}", leaf.0));
                return Err(TreeError::NonUltrametric {
                    label,
                    delta: delta.abs(),
                });
            }
            max_delta = max_delta.max(delta.abs());
        }
        let leaf_ids: Vec<NodeId> = self.leaves.values().copied().collect();
        for leaf in leaf_ids {
            self.nodes[leaf.0].length += height - depths[leaf.0];
        }
        self.recompute_ages();
        Ok(max_delta)
    }

    /// Structural checks performed before any placement: internal
    /// unifurcations are rejected (a single-child root is the root stem).
    pub fn validate(&self, precision: Time) -> Result<(), TreeError> {
        for n in self.postorder() {
            if n != self.root && self.nodes[n.0].children.len() == 1 {
                let label = self.nodes[n.0]
                    .label
                    .clone()
                    .unwrap_or_else(|| format!("#{}", n.0));
                return Err(TreeError::NotBinary { label });
            }
        }
        let (label, dev) = self.ultrametric_deviation();
        if dev > precision {
            return Err(TreeError::NonUltrametric { label, delta: dev });
        }
        Ok(())
    }

    /// True when every reachable internal node has exactly two children,
    /// the root alone being allowed a single child (its stem edge).
    pub fn is_binary(&self) -> bool {
        self.postorder().into_iter().all(|n| {
            let deg = self.nodes[n.0].children.len();
            deg == 0 || deg == 2 || (n == self.root && deg == 1)
        })
    }

    fn depths_from_lengths(&self) -> Vec<Time> {
        let mut depths = vec![0.0; self.nodes.len()];
        let mut stack = vec![self.root];
        while let Some(n) = stack.pop() {
            for &c in &self.nodes[n.0].children {
                depths[c.0] = depths[n.0] + self.nodes[c.0].length;
                stack.push(c);
            }
        }
        depths
    }

    fn recompute_ages(&mut self) {
        let depths = self.depths_from_lengths();
        let height = self
            .leaves
            .values()
            .map(|&l| depths[l.0])
            .fold(0.0f64, f64::max);
        for n in self.postorder() {
            self.nodes[n.0].age = if self.nodes[n.0].children.is_empty() {
                0.0
            } else {
                height - depths[n.0]
            };
        }
    }
}

pub struct Ancestors<'a> {
    tree: &'a Tree,
    cursor: Option<NodeId>,
}

impl Iterator for Ancestors<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let n = self.cursor?;
        self.cursor = self.tree.nodes[n.0].parent;
        Some(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::newick;

    fn balanced() -> Tree {
        newick::parse("((a:1.0,b:1.0):1.0,(c:1.5,d:1.5):0.5);").unwrap()
    }

    #[test]
    fn ages_from_lengths() {
        let t = balanced();
        let root = t.root();
        assert!((t.age(root) - 2.0).abs() < 1e-12);
        let a = t.leaf_id("a").unwrap();
        assert_eq!(t.age(a), 0.0);
        let ab = t.parent(a).unwrap();
        assert!((t.age(ab) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn mrca_and_leaves_under() {
        let t = balanced();
        let a = t.leaf_id("a").unwrap();
        let b = t.leaf_id("b").unwrap();
        let c = t.leaf_id("c").unwrap();
        let ab = t.mrca(&[a, b]).unwrap();
        assert_eq!(t.leaves_under(ab).len(), 2);
        assert_eq!(t.mrca(&[a, c]).unwrap(), t.root());
    }

    #[test]
    fn insert_and_graft_preserve_existing_ages() {
        let mut t = balanced();
        let a = t.leaf_id("a").unwrap();
        let ab = t.parent(a).unwrap();
        let before: Vec<Time> = (0..t.node_count()).map(|i| t.age(NodeId(i))).collect();
        let mid = t.insert_on_edge(a, 0.4).unwrap();
        assert!((t.age(mid) - 0.4).abs() < 1e-12);
        assert!((t.length(mid) - 0.6).abs() < 1e-12);
        assert!((t.length(a) - 0.4).abs() < 1e-12);
        let leaf = t.graft_leaf(mid, "e").unwrap();
        assert!((t.length(leaf) - 0.4).abs() < 1e-12);
        assert_eq!(t.age(ab), 1.0);
        for (i, &age) in before.iter().enumerate() {
            assert!((t.age(NodeId(i)) - age).abs() < 1e-12);
        }
        assert!(t.is_binary());
        assert!(t.validate(1e-6).is_ok());
    }

    #[test]
    fn insert_rejects_out_of_range_age() {
        let mut t = balanced();
        let a = t.leaf_id("a").unwrap();
        assert!(matches!(
            t.insert_on_edge(a, 1.5),
            Err(TreeError::BadInsertionAge { .. })
        ));
    }

    #[test]
    fn graft_rejects_duplicate_name() {
        let mut t = balanced();
        let root = t.root();
        assert!(matches!(
            t.graft_leaf(root, "a"),
            Err(TreeError::NameConflict { .. })
        ));
    }

    #[test]
    fn group_children_resolves_polytomy() {
        let mut t = newick::parse("(a:2.0,b:2.0,c:2.0);").unwrap();
        let root = t.root();
        assert_eq!(t.children(root).len(), 3);
        let a = t.leaf_id("a").unwrap();
        let b = t.leaf_id("b").unwrap();
        let n = t.group_children(root, a, b, 1.0).unwrap();
        assert_eq!(t.children(root).len(), 2);
        assert_eq!(t.children(n), &[a, b]);
        assert!((t.length(a) - 1.0).abs() < 1e-12);
        assert!(t.is_binary());
    }

    #[test]
    fn repair_absorbs_small_discrepancies() {
        let mut t = newick::parse("((a:1.0000004,b:1.0):1.0,c:2.0);").unwrap();
        let delta = t.repair_ultrametric(1e-6).unwrap();
        assert!(delta > 0.0 && delta < 1e-6);
        let (_, dev) = t.ultrametric_deviation();
        assert!(dev < 1e-12);
    }

    #[test]
    fn repair_rejects_large_discrepancies() {
        let mut t = newick::parse("((a:1.5,b:1.0):1.0,c:2.0);").unwrap();
        assert!(matches!(
            t.repair_ultrametric(1e-6),
            Err(TreeError::NonUltrametric { .. })
        ));
    }

    #[test]
    fn prune_suppresses_unifurcations() {
        let mut t = balanced();
        let removed = t.prune_leaves(&["c".to_string(), "x".to_string()]);
        assert_eq!(removed, 1);
        assert!(t.leaf_id("c").is_none());
        let d = t.leaf_id("d").unwrap();
        // c's parent collapsed away, d hangs off the root directly.
        assert_eq!(t.parent(d).unwrap(), t.root());
        assert!((t.length(d) - 2.0).abs() < 1e-12);
        assert!(t.validate(1e-6).is_ok());
    }

    #[test]
    fn prune_promotes_single_child_root() {
        let mut t = balanced();
        t.prune_leaves(&["c".to_string(), "d".to_string()]);
        let a = t.leaf_id("a").unwrap();
        let ab = t.parent(a).unwrap();
        assert_eq!(t.root(), ab);
        assert_eq!(t.parent(ab), None);
    }

    #[test]
    fn branching_times_sorted_oldest_first() {
        let t = balanced();
        let times = t.branching_times(t.root());
        assert_eq!(times.len(), 3);
        assert!(times.windows(2).all(|w| w[0] >= w[1]));
        assert!((times[0] - 2.0).abs() < 1e-12);
    }
}
