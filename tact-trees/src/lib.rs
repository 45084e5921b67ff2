//! Rooted ultrametric trees, taxonomy construction, and fast clade queries.

pub mod mrca;
pub mod newick;
pub mod nexus;
pub mod taxonomy;
pub mod tree;

use thiserror::Error;

pub use mrca::MrcaIndex;
pub use taxonomy::Taxonomy;
pub use tree::{NodeFlags, NodeId, Tree};

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("tree is not ultrametric: leaf '{label}' deviates from the tree height by {delta}")]
    NonUltrametric { label: String, delta: f64 },
    #[error("tree is not binary: internal node '{label}' has a single child")]
    NotBinary { label: String },
    #[error("duplicate leaf name '{name}'")]
    NameConflict { name: String },
    #[error("node has no parent edge to bisect")]
    NoParentEdge,
    #[error("insertion age {at} lies outside the open range ({young}, {old})")]
    BadInsertionAge { at: f64, young: f64, old: f64 },
    #[error("cannot group {requested} children under a node with {available}")]
    BadGrouping { requested: usize, available: usize },
    #[error("parse error at byte {pos}: {msg}")]
    Parse { pos: usize, msg: String },
    #[error("no tree found in NEXUS input")]
    NoNexusTree,
    #[error("tree has no leaves")]
    EmptyTree,
    #[error("leaf at arena slot {index} has no label")]
    UnlabeledLeaf { index: usize },
}

#[derive(Debug, Error)]
pub enum TaxonomyError {
    #[error("row {row}: empty cell in column {col}")]
    EmptyCell { row: usize, col: usize },
    #[error("rank label '{label}' appears under two different parents")]
    DuplicateLabel { label: String },
    #[error("species '{name}' listed twice")]
    DuplicateSpecies { name: String },
    #[error("rows disagree on the root rank: '{first}' vs '{second}'")]
    MultipleRoots { first: String, second: String },
    #[error("taxonomy has no rows")]
    Empty,
    #[error("label '{label}' used both as a rank and as a species")]
    RankSpeciesClash { label: String },
    #[error(transparent)]
    Csv(#[from] csv::Error),
}
