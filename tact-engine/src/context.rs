//! Per-taxon placement context: which backbone edges may legally receive a
//! new divergence, and the admissible age window for any new time.

use crate::EngineError;
use hashbrown::HashSet;
use tact_common::{Interval, IntervalError, IntervalUnion, Time};
use tact_rates::crown_capture_probability;
use tact_trees::{MrcaIndex, NodeId, Taxonomy, Tree};

/// The single admissible interval for new divergence times, or the pinched
/// fallback when the constraints cannot all be met.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Window {
    Open(Interval),
    /// A minimum-age requirement exceeds the oldest reachable attachment
    /// age, or the constraint union fell apart into distant pieces; place a
    /// tight ladder just below `feasible_hi` instead.
    Pinched { feasible_hi: Time, required_lo: Time },
}

#[derive(Debug)]
pub struct PlacementContext {
    pub taxon: NodeId,
    pub label: String,
    pub path: String,
    pub sampled: Vec<NodeId>,
    pub missing: Vec<String>,
    /// MRCA of the sampled species; the species itself when only one is
    /// sampled.
    pub mrca: NodeId,
    pub crown_age: Time,
    pub stem_age: Time,
    /// Sampled species do not form a clade; restrictions below this taxon
    /// are waived on purpose.
    pub rogue: bool,
    /// Every crown edge sits inside a monophyletic proper sub-taxon.
    pub fully_locked: bool,
    /// The stem edge is part of the valid set.
    pub stem_in_play: bool,
    /// Children of the valid edges, crown side first, stem last.
    pub edges: Vec<NodeId>,
    pub polytomies: Vec<NodeId>,
    pub window: Window,
    pub ccp: f64,
}

impl PlacementContext {
    /// Total number of new divergences this taxon requires.
    pub fn work(&self, tree: &Tree) -> usize {
        let extra: usize = self
            .polytomies
            .iter()
            .map(|&p| tree.children(p).len() - 2)
            .sum();
        self.missing.len() + extra
    }
}

/// Build the context for taxon `g` against the current backbone, or `None`
/// when the taxon needs no work here (fully sampled and binary, fully
/// unsampled, or leafless).
pub fn build_context(
    taxonomy: &Taxonomy,
    g: NodeId,
    tree: &Tree,
    index: &MrcaIndex,
    min_ccp: f64,
    min_age: Option<Time>,
    precision: Time,
) -> Result<Option<PlacementContext>, EngineError> {
    let label = taxonomy.label(g).to_string();
    let path = taxonomy.path(g);
    let species = taxonomy.species_under(g);
    let mut sampled = Vec::new();
    let mut missing = Vec::new();
    for name in &species {
        match tree.leaf_id(name) {
            Some(id) => sampled.push(id),
            None => missing.push(name.to_string()),
        }
    }
    if sampled.is_empty() {
        return Ok(None);
    }
    let (k, n) = (sampled.len(), species.len());
    let ccp = crown_capture_probability(k, n);

    if k == 1 {
        // A single tip: the taxon grows along its own terminal edge.
        if missing.is_empty() {
            return Ok(None);
        }
        let tip = sampled[0];
        let parent = match tree.parent(tip) {
            Some(p) => p,
            None => return Ok(None),
        };
        let stem_age = tree.age(parent);
        return Ok(Some(PlacementContext {
            taxon: g,
            label,
            path,
            sampled,
            missing,
            mrca: tip,
            crown_age: 0.0,
            stem_age,
            rogue: false,
            fully_locked: false,
            stem_in_play: true,
            edges: vec![tip],
            polytomies: vec![],
            window: apply_min_age(
                Interval::new(0.0, stem_age).expect("stem above present"),
                min_age,
                precision,
            ),
            ccp,
        }));
    }

    let mrca = index.mrca(tree, &sampled).expect("sampled leaves share a root");
    let crown_age = tree.age(mrca);
    let rogue = index.descendant_leaf_count(mrca) != k;

    // Edges strictly inside a smaller monophyletic taxon are off limits;
    // a non-monophyletic sub-taxon restricts nothing.
    let mut blocked: HashSet<usize> = HashSet::new();
    for h in taxonomy.internal_descendants(g) {
        let sub: Vec<NodeId> = taxonomy
            .species_under(h)
            .iter()
            .filter_map(|s| tree.leaf_id(s))
            .collect();
        if sub.len() < 2 {
            continue;
        }
        let mh = match index.mrca(tree, &sub) {
            Some(m) => m,
            None => continue,
        };
        if index.descendant_leaf_count(mh) != sub.len() {
            continue;
        }
        for d in tree.postorder_from(mh) {
            if d != mh {
                blocked.insert(d.0);
            }
        }
    }

    let mut edges: Vec<NodeId> = tree
        .postorder_from(mrca)
        .into_iter()
        .filter(|&d| d != mrca && !blocked.contains(&d.0))
        .collect();
    let fully_locked = edges.is_empty();
    let polytomies: Vec<NodeId> = tree
        .postorder_from(mrca)
        .into_iter()
        .filter(|&p| tree.children(p).len() > 2)
        .filter(|&p| !tree.children(p).iter().any(|c| blocked.contains(&c.0)))
        .collect();

    let missing_work = !missing.is_empty() || !polytomies.is_empty();
    if !missing_work {
        return Ok(None);
    }

    let stem_permitted = ccp < min_ccp;
    let parent = tree.parent(mrca);
    let stem_age = parent.map(|p| tree.age(p)).unwrap_or(crown_age);
    let stem_in_play = (stem_permitted || fully_locked) && parent.is_some();
    if fully_locked && parent.is_none() {
        return Err(EngineError::RootLocked { taxon: path });
    }
    if stem_in_play {
        edges.push(mrca);
    }

    let mut union = IntervalUnion::new();
    for &c in &edges {
        let top = tree.age(tree.parent(c).expect("valid edges have parents"));
        let bottom = tree.age(c);
        if top > bottom {
            union.insert(Interval::new(bottom, top).expect("edge spans are ordered"));
        }
    }
    let window = match union.atomic_hull(precision) {
        Ok(hull) => apply_min_age(hull, min_age, precision),
        Err(IntervalError::DisjointConstraints { hi, .. }) => Window::Pinched {
            feasible_hi: hi,
            required_lo: min_age.unwrap_or(hi),
        },
        Err(_) => Window::Pinched {
            feasible_hi: crown_age,
            required_lo: min_age.unwrap_or(crown_age),
        },
    };

    Ok(Some(PlacementContext {
        taxon: g,
        label,
        path,
        sampled,
        missing,
        mrca,
        crown_age,
        stem_age,
        rogue,
        fully_locked,
        stem_in_play,
        edges,
        polytomies,
        window,
        ccp,
    }))
}

fn apply_min_age(hull: Interval, min_age: Option<Time>, precision: Time) -> Window {
    match min_age {
        Some(lo) if lo > hull.hi - precision => Window::Pinched {
            feasible_hi: hull.hi,
            required_lo: lo,
        },
        Some(lo) => Window::Open(Interval::new(lo.max(hull.lo), hull.hi).expect("floored window")),
        None => Window::Open(hull),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tact_trees::newick;
    use tact_trees::Taxonomy;

    fn fixtures() -> (Taxonomy, Tree, MrcaIndex) {
        let csv = "\
R,A,a1
R,A,a2
R,A,a3
R,B,b1
R,B,b2
R,B,b3
";
        let taxonomy = Taxonomy::from_csv(csv.as_bytes()).unwrap();
        let tree = newick::parse("((a1:2.0,(a2:1.0,a3:1.0):1.0):2.0);").unwrap();
        let index = MrcaIndex::build(&tree);
        (taxonomy, tree, index)
    }

    #[test]
    fn locked_family_offers_only_the_stem() {
        let (taxonomy, tree, index) = fixtures();
        let r = taxonomy.root();
        let ctx = build_context(&taxonomy, r, &tree, &index, 0.8, None, 1e-6)
            .unwrap()
            .unwrap();
        assert!(ctx.fully_locked);
        assert!(ctx.stem_in_play);
        assert_eq!(ctx.edges, vec![ctx.mrca]);
        assert_eq!(ctx.missing.len(), 3);
        match ctx.window {
            Window::Open(iv) => {
                assert!((iv.lo - 2.0).abs() < 1e-12);
                assert!((iv.hi - 4.0).abs() < 1e-12);
            }
            other => panic!("expected open window, got {:?}", other),
        }
    }

    #[test]
    fn complete_taxa_are_skipped() {
        let (taxonomy, tree, index) = fixtures();
        let a = taxonomy.node("A").unwrap();
        let ctx = build_context(&taxonomy, a, &tree, &index, 0.8, None, 1e-6).unwrap();
        assert!(ctx.is_none());
    }

    #[test]
    fn unsampled_taxa_are_left_to_their_parent() {
        let (taxonomy, tree, index) = fixtures();
        let b = taxonomy.node("B").unwrap();
        let ctx = build_context(&taxonomy, b, &tree, &index, 0.8, None, 1e-6).unwrap();
        assert!(ctx.is_none());
    }

    #[test]
    fn single_tip_context_uses_the_terminal_edge() {
        let csv = "R,G,g1\nR,G,g2\nR,H,h1\n";
        let taxonomy = Taxonomy::from_csv(csv.as_bytes()).unwrap();
        let tree = newick::parse("((g1:1.0,h1:1.0):2.0);").unwrap();
        let index = MrcaIndex::build(&tree);
        let g = taxonomy.node("G").unwrap();
        let ctx = build_context(&taxonomy, g, &tree, &index, 0.8, None, 1e-6)
            .unwrap()
            .unwrap();
        let tip = tree.leaf_id("g1").unwrap();
        assert_eq!(ctx.mrca, tip);
        assert_eq!(ctx.edges, vec![tip]);
        assert_eq!(ctx.crown_age, 0.0);
        assert!((ctx.stem_age - 1.0).abs() < 1e-12);
    }

    #[test]
    fn min_age_beyond_reach_pinches_the_window() {
        let csv = "R,G,g1\nR,G,g2\nR,H,h1\n";
        let taxonomy = Taxonomy::from_csv(csv.as_bytes()).unwrap();
        let tree = newick::parse("((g1:1.0,h1:1.0):2.0);").unwrap();
        let index = MrcaIndex::build(&tree);
        let g = taxonomy.node("G").unwrap();
        let ctx = build_context(&taxonomy, g, &tree, &index, 0.8, Some(5.0), 1e-6)
            .unwrap()
            .unwrap();
        match ctx.window {
            Window::Pinched {
                feasible_hi,
                required_lo,
            } => {
                assert!((feasible_hi - 1.0).abs() < 1e-12);
                assert_eq!(required_lo, 5.0);
            }
            other => panic!("expected pinched window, got {:?}", other),
        }
    }

    #[test]
    fn rogue_subtaxon_restricts_nothing() {
        let csv = "F,A,a1\nF,A,a2\nF,A,a3\nF,B,b1\nF,B,b2\n";
        let taxonomy = Taxonomy::from_csv(csv.as_bytes()).unwrap();
        // b1 sits inside the sampled span of A, so A is not monophyletic.
        let tree = newick::parse("((a1:1.0,b1:1.0):1.0,a2:2.0);").unwrap();
        let index = MrcaIndex::build(&tree);
        let a = taxonomy.node("A").unwrap();
        let ctx = build_context(&taxonomy, a, &tree, &index, 0.8, None, 1e-6)
            .unwrap()
            .unwrap();
        assert!(ctx.rogue);
        assert_eq!(ctx.mrca, tree.root());
        // Every edge under the root is fair game, b1's included.
        assert_eq!(ctx.edges.len(), 4);
    }
}
