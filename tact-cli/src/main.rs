use clap::Parser;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use tact_engine::{Config, EngineError};
use tact_trees::{newick, nexus, Taxonomy, TaxonomyError, TreeError};
use thiserror::Error;
use tracing::{error, info};

/// Add every unsampled species of a taxonomy to a time-calibrated backbone
/// phylogeny, with branching times drawn from per-clade birth-death fits.
#[derive(Parser)]
#[clap(name = "tact", version)]
struct Opts {
    /// Taxonomy CSV: ranks from most to least inclusive, species name last
    #[clap(long, value_name = "FILE")]
    taxonomy: PathBuf,

    /// Backbone phylogeny, Newick or NEXUS
    #[clap(long, value_name = "FILE")]
    backbone: PathBuf,

    /// Output stem; writes <stem>.newick.tre, <stem>.nexus.tre and
    /// <stem>.rates.csv
    #[clap(long, value_name = "STEM")]
    output: PathBuf,

    /// Crown capture probability required to fit rates on a taxon
    #[clap(long, default_value_t = 0.8)]
    min_ccp: f64,

    /// Force pure-birth fits (death = 0)
    #[clap(long)]
    yule: bool,

    /// Tolerance for the ultrametricity check
    #[clap(long, default_value_t = 1e-6)]
    ultrametricity_precision: f64,

    /// Seed for all randomness
    #[clap(long, default_value_t = 0)]
    seed: u64,

    /// Comma-separated leaf names pruned from the backbone before fitting
    #[clap(long, use_value_delimiter = true)]
    outgroups: Vec<String>,

    /// More logging; repeat for debug output
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Tree(#[from] TreeError),
    #[error(transparent)]
    Taxonomy(#[from] TaxonomyError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Csv(#[from] csv::Error),
}

impl CliError {
    fn exit_code(&self) -> i32 {
        match self {
            CliError::Engine(EngineError::Invariant(_)) => 2,
            // These tree errors only arise when the placement engine hands
            // the store an age or grouping it computed itself; input
            // validation never produces them.
            CliError::Engine(EngineError::Tree(e)) | CliError::Tree(e) => match e {
                TreeError::NoParentEdge
                | TreeError::BadInsertionAge { .. }
                | TreeError::BadGrouping { .. } => 2,
                _ => 1,
            },
            _ => 1,
        }
    }
}

fn main() {
    let opts = Opts::parse();
    let level = match opts.verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    if let Err(e) = run(&opts) {
        error!("{}", e);
        std::process::exit(e.exit_code());
    }
}

fn run(opts: &Opts) -> Result<(), CliError> {
    let taxonomy = Taxonomy::from_csv(fs::File::open(&opts.taxonomy)?)?;
    info!(
        species = taxonomy.num_species(),
        "taxonomy loaded"
    );

    let text = fs::read_to_string(&opts.backbone)?;
    let mut backbone = if text.trim_start().to_ascii_lowercase().starts_with("#nexus") {
        nexus::parse(&text)?
    } else {
        newick::parse(&text)?
    };
    if !opts.outgroups.is_empty() {
        let pruned = backbone.prune_leaves(&opts.outgroups);
        info!(pruned, "outgroups pruned");
    }
    let correction = backbone.repair_ultrametric(opts.ultrametricity_precision)?;
    if correction > 0.0 {
        info!(max_correction = correction, "UltrametricRepaired");
    }
    info!(leaves = backbone.num_leaves(), "backbone loaded");

    let config = Config {
        min_ccp: opts.min_ccp,
        yule: opts.yule,
        precision: opts.ultrametricity_precision,
        seed: opts.seed,
        ..Config::default()
    };
    let cancel = AtomicBool::new(false);
    let result = tact_engine::run(&taxonomy, backbone, &config, &cancel)?;

    let stem = opts.output.as_os_str().to_string_lossy();
    let mut newick_out = newick::write(&result.tree);
    newick_out.push('\n');
    fs::write(format!("{}.newick.tre", stem), newick_out)?;
    fs::write(
        format!("{}.nexus.tre", stem),
        nexus::write(&result.tree, "tact_augmented"),
    )?;

    let mut rates = csv::Writer::from_path(format!("{}.rates.csv", stem))?;
    rates.write_record(["taxon", "birth", "death", "ccp", "source"])?;
    for row in &result.rates {
        rates.write_record(&[
            row.taxon.clone(),
            row.birth.to_string(),
            row.death.to_string(),
            row.ccp.to_string(),
            row.source.clone(),
        ])?;
    }
    rates.flush()?;

    info!(
        leaves = result.tree.num_leaves(),
        rates = result.rates.len(),
        "augmented tree written"
    );
    Ok(())
}
