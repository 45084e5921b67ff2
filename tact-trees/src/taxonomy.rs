//! Taxonomy construction from CSV rows of ranks, most inclusive first,
//! species name last. Branch lengths carry no meaning here; only the
//! topology and the label-to-node map do.

use crate::tree::{NodeId, Tree};
use crate::TaxonomyError;
use hashbrown::{HashMap, HashSet};
use std::io::Read;

pub struct Taxonomy {
    tree: Tree,
    /// Every label in the taxonomy, rank or species, to its node.
    labels: HashMap<String, NodeId>,
}

impl Taxonomy {
    /// Read rows of `rank,...,rank,species` without a header line.
    pub fn from_csv<R: Read>(reader: R) -> Result<Self, TaxonomyError> {
        let mut csv = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(reader);

        // Arena under construction; slot 0 becomes the root once known.
        let mut parents: Vec<Option<usize>> = vec![];
        let mut labels: Vec<Option<String>> = vec![];
        let mut slot_of: HashMap<String, usize> = HashMap::new();
        let mut species: HashSet<String> = HashSet::new();
        let mut ranks: HashSet<String> = HashSet::new();
        let mut root_label: Option<String> = None;

        for (row, record) in csv.records().enumerate() {
            let record = record?;
            let cells: Vec<&str> = record.iter().map(|c| c.trim()).collect();
            if cells.iter().all(|c| c.is_empty()) {
                continue;
            }
            for (col, cell) in cells.iter().enumerate() {
                if cell.is_empty() {
                    return Err(TaxonomyError::EmptyCell { row, col });
                }
            }
            let (species_name, rank_cells) =
                cells.split_last().expect("non-empty record");

            match &root_label {
                None => match rank_cells.first() {
                    Some(first) => root_label = Some(first.to_string()),
                    None => return Err(TaxonomyError::EmptyCell { row, col: 0 }),
                },
                Some(root) => {
                    if rank_cells.first().map(|s| *s) != Some(root.as_str()) {
                        return Err(TaxonomyError::MultipleRoots {
                            first: root.clone(),
                            second: rank_cells
                                .first()
                                .map(|s| s.to_string())
                                .unwrap_or_default(),
                        });
                    }
                }
            }

            let mut parent: Option<usize> = None;
            for cell in rank_cells {
                let cell = cell.to_string();
                if species.contains(&cell) {
                    return Err(TaxonomyError::RankSpeciesClash { label: cell });
                }
                let slot = match slot_of.get(&cell) {
                    Some(&slot) => {
                        if parents[slot] != parent {
                            return Err(TaxonomyError::DuplicateLabel { label: cell });
                        }
                        slot
                    }
                    None => {
                        parents.push(parent);
                        labels.push(Some(cell.clone()));
                        slot_of.insert(cell, parents.len() - 1);
                        parents.len() - 1
                    }
                };
                ranks.insert(labels[slot].clone().expect("rank label"));
                parent = Some(slot);
            }

            let species_name = species_name.to_string();
            if ranks.contains(&species_name) {
                return Err(TaxonomyError::RankSpeciesClash {
                    label: species_name,
                });
            }
            if !species.insert(species_name.clone()) {
                return Err(TaxonomyError::DuplicateSpecies { name: species_name });
            }
            parents.push(parent);
            labels.push(Some(species_name));
        }

        if parents.is_empty() {
            return Err(TaxonomyError::Empty);
        }

        let lengths = vec![0.0; parents.len()];
        let tree = Tree::from_parts(parents, lengths, labels)
            .expect("taxonomy arena is a labelled tree");
        let label_map = tree
            .postorder()
            .into_iter()
            .map(|n| (tree.label(n).expect("labelled node").to_string(), n))
            .collect();
        Ok(Self {
            tree,
            labels: label_map,
        })
    }

    pub fn root(&self) -> NodeId {
        self.tree.root()
    }

    pub fn node(&self, label: &str) -> Option<NodeId> {
        self.labels.get(label).copied()
    }

    pub fn label(&self, n: NodeId) -> &str {
        self.tree.label(n).expect("labelled node")
    }

    pub fn parent(&self, n: NodeId) -> Option<NodeId> {
        self.tree.parent(n)
    }

    pub fn children(&self, n: NodeId) -> &[NodeId] {
        self.tree.children(n)
    }

    pub fn is_species(&self, n: NodeId) -> bool {
        self.tree.is_leaf(n)
    }

    pub fn num_species(&self) -> usize {
        self.tree.num_leaves()
    }

    pub fn species_names(&self) -> impl Iterator<Item = &str> {
        self.tree.leaf_names()
    }

    pub fn contains_species(&self, name: &str) -> bool {
        self.tree.leaf_id(name).is_some()
    }

    /// Known diversity of the taxon at `n`: every species name below it.
    pub fn species_under(&self, n: NodeId) -> Vec<&str> {
        self.tree
            .leaves_under(n)
            .into_iter()
            .map(|l| self.tree.label(l).expect("species label"))
            .collect()
    }

    /// Internal taxa, deepest first. Children are visited in label order so
    /// the sequence is reproducible across runs and platforms.
    pub fn internal_postorder(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![(self.tree.root(), false)];
        while let Some((n, expanded)) = stack.pop() {
            if expanded {
                out.push(n);
                continue;
            }
            if self.tree.is_leaf(n) {
                continue;
            }
            stack.push((n, true));
            let mut kids: Vec<NodeId> = self.tree.children(n).to_vec();
            kids.sort_by(|&a, &b| self.label(b).cmp(self.label(a)));
            for k in kids {
                stack.push((k, false));
            }
        }
        out
    }

    /// Slash-separated labels from the root down to `n`.
    pub fn path(&self, n: NodeId) -> String {
        let mut parts: Vec<&str> = std::iter::once(n)
            .chain(self.tree.ancestors(n))
            .map(|m| self.label(m))
            .collect();
        parts.reverse();
        parts.join("/")
    }

    /// The child of `g` whose subtree holds `species`, if any.
    pub fn child_containing(&self, g: NodeId, species: &str) -> Option<NodeId> {
        let leaf = self.tree.leaf_id(species)?;
        let mut prev = leaf;
        for anc in self.tree.ancestors(leaf) {
            if anc == g {
                return Some(prev);
            }
            prev = anc;
        }
        None
    }

    /// Number of ancestors above `n`; the root has depth zero.
    pub fn depth(&self, n: NodeId) -> usize {
        self.tree.ancestors(n).count()
    }

    /// Internal taxa strictly below `g`, in no particular order.
    pub fn internal_descendants(&self, g: NodeId) -> Vec<NodeId> {
        self.tree
            .postorder_from(g)
            .into_iter()
            .filter(|&n| n != g && !self.tree.is_leaf(n))
            .collect()
    }
}
