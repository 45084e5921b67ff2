//! The placement engine: per-taxon attachment contexts, grafting
//! transactions, and the two-phase driver that augments a backbone
//! phylogeny with every species known to the taxonomy.

pub mod context;
pub mod driver;
pub mod placement;

use thiserror::Error;

pub use driver::{run, Config, RateRecord, RunResult};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Tree(#[from] tact_trees::TreeError),
    #[error("backbone leaves missing from the taxonomy: {}", missing.join(", "))]
    UnknownLeaves { missing: Vec<String> },
    #[error("no usable diversification rate for '{taxon}'")]
    NoRate { taxon: String },
    #[error("'{taxon}' needs a stem attachment but the backbone root has no stem edge")]
    RootLocked { taxon: String },
    #[error("invariant violation after placement: {0}")]
    Invariant(String),
    #[error("run cancelled")]
    Cancelled,
}
