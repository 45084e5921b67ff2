//! Two-phase driver: fit rates for every taxon against the immutable
//! backbone, then resolve taxa bottom-up, mutating the backbone in a fixed
//! deterministic order.

use crate::context::{build_context, Window};
use crate::placement::{resolve_taxon, Grafter};
use crate::EngineError;
use hashbrown::HashMap;
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use tact_common::{substream, Time};
use tact_rates::{crown_capture_probability, fit_clade, FitConfig, RateFit, RateFitError};
use tact_trees::{MrcaIndex, NodeId, Taxonomy, Tree};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct Config {
    pub min_ccp: f64,
    pub yule: bool,
    pub precision: Time,
    pub seed: u64,
    /// Externally imposed minimum stem ages by taxon label. The engine adds
    /// entries of its own as it founds unsampled subclades.
    pub min_ages: HashMap<String, Time>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            min_ccp: tact_common::DEFAULT_MIN_CCP,
            yule: false,
            precision: tact_common::DEFAULT_PRECISION,
            seed: 0,
            min_ages: HashMap::new(),
        }
    }
}

/// One row of the rates table.
#[derive(Debug, Clone, PartialEq)]
pub struct RateRecord {
    pub taxon: String,
    pub birth: f64,
    pub death: f64,
    pub ccp: f64,
    /// Label of the taxon whose fit supplied the rates; an ancestor when
    /// this taxon's own fit was refused or failed.
    pub source: String,
}

pub struct RunResult {
    pub tree: Tree,
    pub rates: Vec<RateRecord>,
}

struct Attempt {
    taxon: NodeId,
    label: String,
    path: String,
    ccp: f64,
    own: Option<RateFit>,
}

/// Augment `backbone` with every missing species in `taxonomy`.
pub fn run(
    taxonomy: &Taxonomy,
    mut backbone: Tree,
    config: &Config,
    cancel: &AtomicBool,
) -> Result<RunResult, EngineError> {
    let mut unknown: Vec<String> = backbone
        .leaf_names()
        .filter(|n| !taxonomy.contains_species(n))
        .map(String::from)
        .collect();
    if !unknown.is_empty() {
        unknown.sort();
        return Err(EngineError::UnknownLeaves { missing: unknown });
    }
    backbone.validate(config.precision)?;

    let index = MrcaIndex::build(&backbone);
    let order = taxonomy.internal_postorder();

    // Phase 1: every fit reads the same immutable backbone, so the taxa can
    // fan out across threads; the per-taxon substreams keep results
    // independent of scheduling.
    let attempts: Vec<Attempt> = order
        .par_iter()
        .map(|&g| fit_taxon(taxonomy, g, &backbone, &index, config))
        .collect();

    let own_fits: HashMap<NodeId, RateFit> = attempts
        .iter()
        .filter_map(|a| a.own.map(|fit| (a.taxon, fit)))
        .collect();

    let mut rates = Vec::with_capacity(attempts.len());
    let mut effective: HashMap<String, (f64, f64)> = HashMap::new();
    for a in &attempts {
        let mut cur = Some(a.taxon);
        let resolved = loop {
            match cur {
                Some(node) => match own_fits.get(&node) {
                    Some(fit) => break Some((fit, node)),
                    None => cur = taxonomy.parent(node),
                },
                None => break None,
            }
        };
        if let Some((fit, source)) = resolved {
            effective.insert(a.label.clone(), (fit.birth, fit.death));
            rates.push(RateRecord {
                taxon: a.label.clone(),
                birth: fit.birth,
                death: fit.death,
                ccp: a.ccp,
                source: taxonomy.label(source).to_string(),
            });
        }
    }

    // Snapshots for the final audit.
    let original_ages: Vec<Time> = (0..backbone.node_count())
        .map(|i| backbone.age(NodeId(i)))
        .collect();
    let was_monophyletic: Vec<(NodeId, bool)> = order
        .iter()
        .map(|&g| {
            let sampled: Vec<NodeId> = taxonomy
                .species_under(g)
                .iter()
                .filter_map(|s| backbone.leaf_id(s))
                .collect();
            let mono = match sampled.len() {
                0 => false,
                1 => true,
                _ => index.is_monophyletic(&backbone, &sampled),
            };
            (g, mono)
        })
        .collect();

    // Phase 2: sequential, exclusive ownership of tree and index.
    let mut index = index;
    let mut min_ages = config.min_ages.clone();
    for a in &attempts {
        if cancel.load(Ordering::Relaxed) {
            return Err(EngineError::Cancelled);
        }
        let min_age = min_ages.get(&a.label).copied();
        let ctx = match build_context(
            taxonomy,
            a.taxon,
            &backbone,
            &index,
            config.min_ccp,
            min_age,
            config.precision,
        )? {
            Some(ctx) => ctx,
            None => {
                debug!(taxon = %a.path, "nothing to place");
                continue;
            }
        };
        if ctx.rogue {
            warn!(
                taxon = %a.path,
                "sampled species are not monophyletic; placements inside the clade are unrestricted"
            );
        }
        if ctx.fully_locked {
            warn!(taxon = %a.path, "FullyLocked");
        }
        if let Window::Pinched {
            feasible_hi,
            required_lo,
        } = ctx.window
        {
            warn!(
                taxon = %a.path,
                required = required_lo,
                feasible = feasible_hi,
                "MinAgeViolation"
            );
        }
        let &(birth, death) = effective.get(&a.label).ok_or_else(|| EngineError::NoRate {
            taxon: a.path.clone(),
        })?;
        let mut rng = substream(config.seed, "place", &a.path);
        let mut grafter = Grafter {
            tree: &mut backbone,
            index: &mut index,
        };
        let outcome = resolve_taxon(
            &ctx,
            taxonomy,
            &mut grafter,
            birth,
            death,
            &mut min_ages,
            config.precision,
            &mut rng,
        )?;
        if outcome.near_zero_branches {
            warn!(taxon = %a.path, "emitted near-zero branches to honour a collapsed age window");
        }
        info!(
            taxon = %a.path,
            grafted = outcome.grafted,
            groupings = outcome.groupings,
            "taxon resolved"
        );
        #[cfg(debug_assertions)]
        {
            backbone
                .validate(config.precision * 10.0)
                .map_err(|e| EngineError::Invariant(format!("after '{}': {}", a.path, e)))?;
        }
    }

    if let Err(e) = audit(
        taxonomy,
        &backbone,
        &original_ages,
        &was_monophyletic,
        config.precision,
    ) {
        // Leave the offending tree in the log stream for post-mortems.
        tracing::error!(partial = %tact_trees::newick::write(&backbone), "invariant audit failed");
        return Err(e);
    }

    Ok(RunResult {
        tree: backbone,
        rates,
    })
}

fn fit_taxon(
    taxonomy: &Taxonomy,
    g: NodeId,
    backbone: &Tree,
    index: &MrcaIndex,
    config: &Config,
) -> Attempt {
    let label = taxonomy.label(g).to_string();
    let path = taxonomy.path(g);
    let species = taxonomy.species_under(g);
    let sampled: Vec<NodeId> = species
        .iter()
        .filter_map(|s| backbone.leaf_id(s))
        .collect();
    let (k, n) = (sampled.len(), species.len());
    let ccp = crown_capture_probability(k, n);

    let own = if k >= 2 {
        let mrca = index
            .mrca(backbone, &sampled)
            .expect("sampled leaves share a root");
        let times = backbone.branching_times(mrca);
        let cfg = FitConfig {
            min_ccp: config.min_ccp,
            yule_only: config.yule,
            force: g == taxonomy.root(),
        };
        let mut rng = substream(config.seed, "rates", &path);
        match fit_clade(&times, n, k, &cfg, &mut rng) {
            Ok(fit) => {
                debug!(taxon = %path, birth = fit.birth, death = fit.death, "rates fit");
                Some(fit)
            }
            Err(RateFitError::BelowCutoff { ccp, cutoff }) => {
                info!(taxon = %path, ccp, cutoff, "CCPBelowCutoff");
                None
            }
            Err(e) => {
                warn!(taxon = %path, error = %e, "RateFitFailed");
                None
            }
        }
    } else {
        debug!(taxon = %path, sampled = k, "too few sampled lineages for a fit");
        None
    };

    Attempt {
        taxon: g,
        label,
        path,
        ccp,
        own,
    }
}

fn audit(
    taxonomy: &Taxonomy,
    tree: &Tree,
    original_ages: &[Time],
    was_monophyletic: &[(NodeId, bool)],
    precision: Time,
) -> Result<(), EngineError> {
    let slop = 10.0 * precision;

    if tree.num_leaves() != taxonomy.num_species() {
        return Err(EngineError::Invariant(format!(
            "output has {} leaves for {} known species",
            tree.num_leaves(),
            taxonomy.num_species()
        )));
    }
    for name in taxonomy.species_names() {
        if tree.leaf_id(name).is_none() {
            return Err(EngineError::Invariant(format!(
                "species '{}' missing from the output",
                name
            )));
        }
    }

    if !tree.is_binary() {
        return Err(EngineError::Invariant(
            "output tree is not binary".to_string(),
        ));
    }
    let (worst, dev) = tree.ultrametric_deviation();
    if dev > slop {
        return Err(EngineError::Invariant(format!(
            "output is not ultrametric: leaf '{}' deviates by {}",
            worst, dev
        )));
    }

    for (i, &age) in original_ages.iter().enumerate() {
        let id = NodeId(i);
        if tree.flags(id).contains(tact_trees::NodeFlags::REMOVED) {
            continue;
        }
        if (tree.age(id) - age).abs() > slop {
            return Err(EngineError::Invariant(format!(
                "age of pre-existing node {} drifted from {} to {}",
                i,
                age,
                tree.age(id)
            )));
        }
    }

    let final_index = MrcaIndex::build(tree);
    for &(g, was) in was_monophyletic {
        if !was {
            continue;
        }
        let leaves: Vec<NodeId> = taxonomy
            .species_under(g)
            .iter()
            .filter_map(|s| tree.leaf_id(s))
            .collect();
        if !final_index.is_monophyletic(tree, &leaves) {
            return Err(EngineError::Invariant(format!(
                "taxon '{}' lost its monophyly",
                taxonomy.label(g)
            )));
        }
    }

    Ok(())
}
