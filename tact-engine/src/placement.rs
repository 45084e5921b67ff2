//! Grafting transactions: realize a set of divergence times on the valid
//! edges of one taxon, founding unsampled subclades, resolving polytomies,
//! and keeping the MRCA index in step with every mutation.

use crate::context::{PlacementContext, Window};
use crate::EngineError;
use hashbrown::HashMap;
use rand::Rng;
use tact_common::Time;
use tact_rates::sample_branching_times;
use tact_trees::{MrcaIndex, NodeId, Taxonomy, Tree};

/// Mutable access to the backbone plus its clade index. Every mutation goes
/// through here so the two cannot drift apart.
pub struct Grafter<'a> {
    pub tree: &'a mut Tree,
    pub index: &'a mut MrcaIndex,
}

impl Grafter<'_> {
    fn split_edge(&mut self, child: NodeId, at: Time) -> Result<NodeId, EngineError> {
        let id = self.tree.insert_on_edge(child, at)?;
        self.index.on_internal_added(self.tree, id);
        Ok(id)
    }

    fn graft(&mut self, edge: NodeId, at: Time, name: &str) -> Result<(NodeId, NodeId), EngineError> {
        let joint = self.split_edge(edge, at)?;
        let leaf = self.tree.graft_leaf(joint, name)?;
        self.index.on_leaf_grafted(self.tree, leaf);
        Ok((joint, leaf))
    }

    fn group(
        &mut self,
        poly: NodeId,
        a: NodeId,
        b: NodeId,
        at: Time,
    ) -> Result<NodeId, EngineError> {
        let id = self.tree.group_children(poly, a, b, at)?;
        self.index.on_internal_added(self.tree, id);
        Ok(id)
    }
}

#[derive(Debug, Default)]
pub struct TaxonOutcome {
    pub grafted: usize,
    pub groupings: usize,
    pub min_age_violation: bool,
    pub near_zero_branches: bool,
}

/// One missing species together with the chain of fully-unsampled taxa it
/// belongs to, deepest first, all strictly below the taxon being resolved.
struct Pending {
    name: String,
    chain: Vec<NodeId>,
}

struct Pools {
    species: Vec<Pending>,
    /// One entry per grouping still owed, keyed by the polytomy node.
    tasks: Vec<NodeId>,
}

/// Membership bookkeeping for subclades founded during this transaction.
struct Founded {
    /// Taxonomy group to the backbone root of its growing clade.
    roots: HashMap<NodeId, NodeId>,
    /// Backbone node to the deepest group rooted there.
    by_node: HashMap<usize, NodeId>,
}

impl Founded {
    fn new() -> Self {
        Self {
            roots: HashMap::new(),
            by_node: HashMap::new(),
        }
    }

    /// The deepest already-founded group on a pending species' chain.
    fn deepest_on(&self, chain: &[NodeId]) -> Option<NodeId> {
        chain.iter().copied().find(|b| self.roots.contains_key(b))
    }

    /// The innermost founded clade the edge above `child` lies strictly
    /// inside, if any.
    fn innermost_around(&self, tree: &Tree, child: NodeId) -> Option<NodeId> {
        for anc in tree.ancestors(child) {
            if let Some(&group) = self.by_node.get(&anc.0) {
                return Some(group);
            }
        }
        None
    }

    /// Whether a species with this unsampled-group chain may receive a new
    /// divergence on the edge above `edge`. Members of a founded group are
    /// confined to its clade (interior edges or the clade's own stem);
    /// everyone else is confined to edges outside every foreign clade.
    fn edge_allows(&self, tree: &Tree, edge: NodeId, chain: &[NodeId]) -> bool {
        match self.deepest_on(chain) {
            Some(d) => {
                self.roots.get(&d) == Some(&edge)
                    || self.innermost_around(tree, edge) == Some(d)
            }
            None => self.innermost_around(tree, edge).is_none(),
        }
    }

    fn rebuild_node_map(&mut self, taxonomy: &Taxonomy) {
        self.by_node.clear();
        for (&group, &root) in &self.roots {
            let entry = self.by_node.entry(root.0).or_insert(group);
            if taxonomy.depth(group) > taxonomy.depth(*entry) {
                *entry = group;
            }
        }
    }
}

/// Apply one taxon's transaction: draw the divergence times, then realize
/// them oldest first on uniformly chosen valid edges.
pub fn resolve_taxon<R: Rng>(
    ctx: &PlacementContext,
    taxonomy: &Taxonomy,
    grafter: &mut Grafter,
    birth: f64,
    death: f64,
    min_ages: &mut HashMap<String, Time>,
    precision: Time,
    rng: &mut R,
) -> Result<TaxonOutcome, EngineError> {
    let mut outcome = TaxonOutcome::default();
    let work = ctx.work(grafter.tree);
    if work == 0 {
        return Ok(outcome);
    }

    let mut pools = Pools {
        species: ctx
            .missing
            .iter()
            .map(|name| Pending {
                name: name.clone(),
                chain: unsampled_chain(taxonomy, ctx.taxon, name, grafter.tree),
            })
            .collect(),
        tasks: ctx
            .polytomies
            .iter()
            .flat_map(|&p| {
                let extra = grafter.tree.children(p).len() - 2;
                std::iter::repeat(p).take(extra)
            })
            .collect(),
    };

    let times = match ctx.window {
        Window::Open(w) if w.width() > precision => {
            sample_branching_times(work, birth, death, w, precision, rng)
        }
        Window::Open(w) => {
            outcome.near_zero_branches = true;
            ladder(grafter.tree, &ctx.edges, w.hi, work, precision)?
        }
        Window::Pinched { feasible_hi, .. } => {
            outcome.min_age_violation = true;
            outcome.near_zero_branches = work > 1;
            ladder(grafter.tree, &ctx.edges, feasible_hi, work, precision)?
        }
    };

    let mut live: Vec<NodeId> = ctx.edges.clone();
    let mut founded = Founded::new();

    for &t in &times {
        let target = choose_target(grafter.tree, &live, &pools, &founded, t, rng);
        match target {
            Some(Target::Edge(edge, eligible)) => {
                let pick = eligible[rng.gen_range(0..eligible.len())];
                realize_species(
                    grafter, taxonomy, &mut pools, &mut founded, &mut live, min_ages, edge, t,
                    pick,
                )?;
                outcome.grafted += 1;
            }
            Some(Target::Polytomy(p)) => {
                realize_grouping(grafter, &mut pools, &mut live, p, t, rng)?;
                outcome.groupings += 1;
            }
            None => {
                // The drawn age straddles nothing usable; clamp it onto the
                // best remaining slot for some pending unit.
                if !pools.species.is_empty() {
                    let i = rng.gen_range(0..pools.species.len());
                    let chain = pools.species[i].chain.clone();
                    let (edge, t_adj) =
                        clamp_onto_edges(grafter.tree, &live, &founded, &chain, t)?;
                    realize_species(
                        grafter, taxonomy, &mut pools, &mut founded, &mut live, min_ages, edge,
                        t_adj, i,
                    )?;
                    outcome.grafted += 1;
                } else {
                    let task = pools.tasks.first().copied();
                    if let Some(p) = task {
                        let t_adj = grouping_age(grafter.tree, p);
                        realize_grouping(grafter, &mut pools, &mut live, p, t_adj, rng)?;
                        outcome.groupings += 1;
                    }
                }
            }
        }
    }

    assert!(pools.species.is_empty(), "species left unplaced");
    assert!(pools.tasks.is_empty(), "polytomies left unresolved");
    Ok(outcome)
}

/// Taxa strictly between the species and `g` that have no sampled
/// representative; members of such a group must come out monophyletic.
fn unsampled_chain(taxonomy: &Taxonomy, g: NodeId, species: &str, tree: &Tree) -> Vec<NodeId> {
    let mut chain = Vec::new();
    let leaf = match taxonomy.node(species) {
        Some(l) => l,
        None => return chain,
    };
    let mut cur = taxonomy.parent(leaf);
    while let Some(node) = cur {
        if node == g {
            break;
        }
        let any_sampled = taxonomy
            .species_under(node)
            .iter()
            .any(|s| tree.leaf_id(s).is_some());
        if !any_sampled {
            chain.push(node);
        }
        cur = taxonomy.parent(node);
    }
    chain
}

enum Target {
    /// An edge with the indices of the pending species allowed on it.
    Edge(NodeId, Vec<usize>),
    Polytomy(NodeId),
}

fn straddles(tree: &Tree, child: NodeId, t: Time) -> bool {
    match tree.parent(child) {
        Some(p) => tree.age(child) < t && t < tree.age(p),
        None => false,
    }
}

fn choose_target<R: Rng>(
    tree: &Tree,
    live: &[NodeId],
    pools: &Pools,
    founded: &Founded,
    t: Time,
    rng: &mut R,
) -> Option<Target> {
    let mut targets: Vec<Target> = Vec::new();
    for &edge in live {
        if !straddles(tree, edge, t) {
            continue;
        }
        let eligible: Vec<usize> = pools
            .species
            .iter()
            .enumerate()
            .filter(|(_, s)| founded.edge_allows(tree, edge, &s.chain))
            .map(|(i, _)| i)
            .collect();
        if !eligible.is_empty() {
            targets.push(Target::Edge(edge, eligible));
        }
    }
    let mut seen = Vec::new();
    for &p in &pools.tasks {
        if seen.contains(&p) {
            continue;
        }
        seen.push(p);
        let under = tree
            .children(p)
            .iter()
            .filter(|&&c| tree.age(c) < t)
            .count();
        if t < tree.age(p) && under >= 2 {
            targets.push(Target::Polytomy(p));
        }
    }
    if targets.is_empty() {
        return None;
    }
    let at = rng.gen_range(0..targets.len());
    Some(targets.swap_remove(at))
}

#[allow(clippy::too_many_arguments)]
fn realize_species(
    grafter: &mut Grafter,
    taxonomy: &Taxonomy,
    pools: &mut Pools,
    founded: &mut Founded,
    live: &mut Vec<NodeId>,
    min_ages: &mut HashMap<String, Time>,
    edge: NodeId,
    t: Time,
    which: usize,
) -> Result<(), EngineError> {
    let pending = pools.species.swap_remove(which);
    let (joint, leaf) = grafter.graft(edge, t, &pending.name)?;
    live.push(joint);
    live.push(leaf);

    let mut dirty = false;
    for &group in &pending.chain {
        match founded.roots.get(&group).copied() {
            None => {
                founded.roots.insert(group, leaf);
                min_ages
                    .entry(taxonomy.label(group).to_string())
                    .or_insert(t);
                dirty = true;
            }
            Some(root) if root == edge => {
                // Attached on the clade's stem; the joint is the new root.
                founded.roots.insert(group, joint);
                dirty = true;
            }
            Some(_) => {}
        }
    }
    if dirty {
        founded.rebuild_node_map(taxonomy);
    }
    Ok(())
}

fn realize_grouping<R: Rng>(
    grafter: &mut Grafter,
    pools: &mut Pools,
    live: &mut Vec<NodeId>,
    p: NodeId,
    t: Time,
    rng: &mut R,
) -> Result<(), EngineError> {
    let mut eligible: Vec<NodeId> = grafter
        .tree
        .children(p)
        .iter()
        .copied()
        .filter(|&c| grafter.tree.age(c) < t)
        .collect();
    assert!(eligible.len() >= 2);
    let a = eligible.swap_remove(rng.gen_range(0..eligible.len()));
    let b = eligible.swap_remove(rng.gen_range(0..eligible.len()));
    let id = grafter.group(p, a, b, t)?;
    live.push(id);
    let slot = pools
        .tasks
        .iter()
        .position(|&q| q == p)
        .expect("task accounted for");
    pools.tasks.swap_remove(slot);
    Ok(())
}

/// Evenly spaced descending ages packed just under `top` on whichever valid
/// edge reaches highest. Used when the admissible window has collapsed.
fn ladder(
    tree: &Tree,
    edges: &[NodeId],
    top: Time,
    count: usize,
    precision: Time,
) -> Result<Vec<Time>, EngineError> {
    let mut best: Option<(Time, Time)> = None;
    for &c in edges {
        if let Some(p) = tree.parent(c) {
            let (bottom, t) = (tree.age(c), tree.age(p).min(top));
            if t > bottom {
                let better = match best {
                    Some((_, bt)) => t > bt,
                    None => true,
                };
                if better {
                    best = Some((bottom, t));
                }
            }
        }
    }
    let (bottom, t) = best.ok_or_else(|| {
        EngineError::Invariant("no positive-span edge to place constrained divergences".into())
    })?;
    let step = precision.min((t - bottom) / (count as Time + 1.0));
    Ok((1..=count).map(|i| t - step * i as Time).collect())
}

/// A feasible age on the best matching live edge when a drawn time fits
/// nowhere, preferring the slot closest to the drawn age.
fn clamp_onto_edges(
    tree: &Tree,
    live: &[NodeId],
    founded: &Founded,
    chain: &[NodeId],
    t: Time,
) -> Result<(NodeId, Time), EngineError> {
    let mut best: Option<(NodeId, Time, Time)> = None;
    for &edge in live {
        if !founded.edge_allows(tree, edge, chain) {
            continue;
        }
        let parent = match tree.parent(edge) {
            Some(p) => p,
            None => continue,
        };
        let (bottom, top) = (tree.age(edge), tree.age(parent));
        if top <= bottom {
            continue;
        }
        let margin = (top - bottom) * 1e-3;
        let t_adj = t.clamp(bottom + margin, top - margin);
        let miss = (t_adj - t).abs();
        let better = match best {
            Some((_, _, m)) => miss < m,
            None => true,
        };
        if better {
            best = Some((edge, t_adj, miss));
        }
    }
    best.map(|(e, t_adj, _)| (e, t_adj))
        .ok_or_else(|| EngineError::Invariant("no edge admits a pending species".into()))
}

fn grouping_age(tree: &Tree, p: NodeId) -> Time {
    let mut ages: Vec<Time> = tree.children(p).iter().map(|&c| tree.age(c)).collect();
    ages.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let floor = ages[1];
    0.5 * (floor + tree.age(p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::build_context;
    use rand::SeedableRng;
    use rand_pcg::Pcg64;
    use tact_trees::newick;
    use tact_trees::Taxonomy;

    fn run_taxon(
        csv: &str,
        newick_text: &str,
        taxon: &str,
        min_age: Option<Time>,
    ) -> (Tree, TaxonOutcome) {
        let taxonomy = Taxonomy::from_csv(csv.as_bytes()).unwrap();
        let mut tree = newick::parse(newick_text).unwrap();
        let mut index = MrcaIndex::build(&tree);
        let g = taxonomy.node(taxon).unwrap();
        let ctx = build_context(&taxonomy, g, &tree, &index, 0.8, min_age, 1e-6)
            .unwrap()
            .expect("taxon has work");
        let mut grafter = Grafter {
            tree: &mut tree,
            index: &mut index,
        };
        let mut min_ages = HashMap::new();
        let mut rng = Pcg64::seed_from_u64(0x5AC7);
        let outcome = resolve_taxon(
            &ctx,
            &taxonomy,
            &mut grafter,
            1.0,
            0.0,
            &mut min_ages,
            1e-6,
            &mut rng,
        )
        .unwrap();
        (tree, outcome)
    }

    #[test]
    fn grafts_a_missing_cherry_member() {
        let (tree, outcome) = run_taxon(
            "F,G,a\nF,G,b\nF,G,c\n",
            "((a:1.0,b:1.0):0.0);",
            "G",
            None,
        );
        assert_eq!(outcome.grafted, 1);
        let c = tree.leaf_id("c").unwrap();
        assert!(tree.age(tree.parent(c).unwrap()) < 1.0 + 1e-12);
        assert!(tree.is_binary());
        assert!(tree.validate(1e-6).is_ok());
    }

    #[test]
    fn founds_an_unsampled_sister_clade() {
        let (tree, outcome) = run_taxon(
            "R,A,a1\nR,A,a2\nR,A,a3\nR,B,b1\nR,B,b2\nR,B,b3\n",
            "((a1:2.0,(a2:1.0,a3:1.0):1.0):2.0);",
            "R",
            None,
        );
        assert_eq!(outcome.grafted, 3);
        let index = MrcaIndex::build(&tree);
        let bs: Vec<NodeId> = ["b1", "b2", "b3"]
            .iter()
            .map(|n| tree.leaf_id(n).unwrap())
            .collect();
        assert!(index.is_monophyletic(&tree, &bs));
        let b_root = index.mrca(&tree, &bs).unwrap();
        let stem = tree.age(tree.parent(b_root).unwrap());
        assert!(stem > 2.0 && stem < 4.0, "stem at {}", stem);
        // A keeps its clade.
        let as_: Vec<NodeId> = ["a1", "a2", "a3"]
            .iter()
            .map(|n| tree.leaf_id(n).unwrap())
            .collect();
        assert!(index.is_monophyletic(&tree, &as_));
        assert!(tree.is_binary());
        assert!(tree.validate(1e-6).is_ok());
    }

    #[test]
    fn resolves_polytomies_owned_by_the_taxon() {
        let (tree, outcome) = run_taxon(
            "F,G,a\nF,G,b\nF,G,c\nF,G,d\n",
            "(a:2.0,b:2.0,c:2.0,d:2.0);",
            "G",
            None,
        );
        assert_eq!(outcome.grafted, 0);
        assert_eq!(outcome.groupings, 2);
        assert!(tree.is_binary());
        assert!(tree.validate(1e-6).is_ok());
    }

    #[test]
    fn pinched_window_emits_a_tight_ladder() {
        let (tree, outcome) = run_taxon(
            "R,G,g1\nR,G,g2\nR,H,h1\n",
            "((g1:3.0,h1:3.0):1.0);",
            "G",
            Some(5.0),
        );
        assert!(outcome.min_age_violation);
        assert_eq!(outcome.grafted, 1);
        let g2 = tree.leaf_id("g2").unwrap();
        let joint = tree.parent(g2).unwrap();
        assert!(tree.age(joint) > 3.0 - 1e-3 && tree.age(joint) < 3.0);
        assert!(tree.is_binary());
        assert!(tree.validate(1e-6).is_ok());
    }

    #[test]
    fn nested_unsampled_groups_come_out_monophyletic() {
        let csv = "\
R,A,a1
R,A,a2
R,B,C,c1
R,B,C,c2
R,B,D,d1
";
        let (tree, outcome) = run_taxon(csv, "((a1:1.0,a2:1.0):1.0);", "R", None);
        assert_eq!(outcome.grafted, 3);
        let index = MrcaIndex::build(&tree);
        let cs: Vec<NodeId> = ["c1", "c2"]
            .iter()
            .map(|n| tree.leaf_id(n).unwrap())
            .collect();
        let bs: Vec<NodeId> = ["c1", "c2", "d1"]
            .iter()
            .map(|n| tree.leaf_id(n).unwrap())
            .collect();
        assert!(index.is_monophyletic(&tree, &cs));
        assert!(index.is_monophyletic(&tree, &bs));
        assert!(tree.is_binary());
    }
}
