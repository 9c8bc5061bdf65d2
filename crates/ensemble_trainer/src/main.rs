//! Boat race ensemble trainer CLI
//!
//! Trains every configured family on a CSV race history (or on synthetic
//! races) and writes the ensemble directory.

use anyhow::{bail, Context, Result};
use boatrace_ensemble_core::config::parse_families;
use boatrace_ensemble_core::{persistence, Ensemble, EnsembleConfig, SyntheticRaces};
use boatrace_ensemble_trainer::{train_dataset, Dataset, LabelSource};
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ensemble-train")]
#[command(author = "Boatrace Ensemble Contributors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Train the weighted boat race ensemble", long_about = None)]
struct Args {
    /// Input CSV with a header row, one entrant per line
    #[arg(short, long, required_unless_present = "synthetic_races")]
    input: Option<PathBuf>,

    /// Output directory for the ensemble
    #[arg(short, long, default_value = "models/ensemble")]
    output: PathBuf,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 0/1 label column
    #[arg(long, default_value = "target")]
    label: String,

    /// Derive labels from a finishing-rank column instead (rank 1 wins)
    #[arg(long, conflicts_with = "label")]
    rank_column: Option<String>,

    /// Seed for the holdout split
    #[arg(long)]
    seed: Option<u64>,

    /// Share of races held out for weighting
    #[arg(long)]
    validation_fraction: Option<f64>,

    /// Comma-separated families, e.g. boosted_tree_a,random_forest
    #[arg(long)]
    families: Option<String>,

    /// Use small training budgets
    #[arg(long)]
    quick: bool,

    /// Train on this many generated races instead of a CSV file
    #[arg(long, conflicts_with = "input")]
    synthetic_races: Option<usize>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set tracing subscriber")?;

    info!("Boatrace Ensemble Trainer v{}", env!("CARGO_PKG_VERSION"));

    let config = build_config(&args)?;
    for warning in config.validate().context("Invalid configuration")? {
        warn!("{}", warning);
    }

    let dataset = match (&args.input, args.synthetic_races) {
        (_, Some(n_races)) => {
            info!("Generating {} synthetic races (seed {})", n_races, config.split.seed);
            let (frame, labels) = SyntheticRaces::new(n_races, config.split.seed).generate();
            Dataset { frame, labels }
        }
        (Some(input), None) => {
            let label = match &args.rank_column {
                Some(column) => LabelSource::Rank(column.clone()),
                None => LabelSource::Column(args.label.clone()),
            };
            info!("Loading dataset from: {}", input.display());
            Dataset::from_csv(input, &config.features, &label).context("Failed to load dataset")?
        }
        (None, None) => bail!("either --input or --synthetic-races is required"),
    };

    info!("Loaded {} entrants ({} winners)", dataset.len(), dataset.positives());
    for stats in dataset.feature_stats() {
        info!(
            "  {}: min={:.3}, max={:.3}, missing={}",
            stats.name, stats.min, stats.max, stats.missing
        );
    }

    info!("Families: {:?}", config.families);
    let (ensemble, report) = train_dataset(&dataset, &config)?;

    for (family, reason) in &report.failures {
        warn!("{} failed: {}", family, reason);
    }
    for (family, auc) in report.training_stats.iter() {
        info!(
            "  {}: AUC {:.4}, weight {:.4}",
            family,
            auc,
            report.weights.get(family)
        );
    }

    ensemble
        .save(&args.output)
        .with_context(|| format!("Failed to save ensemble to {}", args.output.display()))?;

    // read back to catch a directory the serving side could not load
    let restored = Ensemble::load(&args.output).context("Saved ensemble failed to load")?;
    let metadata = persistence::read_metadata(&args.output)?;
    info!(
        "Training completed: {} families saved to {}",
        restored.families().count(),
        args.output.display()
    );
    for (family, entry) in &metadata.artifacts {
        info!("  {} -> {} ({})", family, entry.file, entry.blake3);
    }

    Ok(())
}

fn build_config(args: &Args) -> Result<EnsembleConfig> {
    let mut config = match &args.config {
        Some(path) => EnsembleConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None if args.quick => EnsembleConfig::lightweight(),
        None => EnsembleConfig::default(),
    };
    config.apply_env().context("Invalid ENSEMBLE_* override")?;

    if let Some(seed) = args.seed {
        config.split.seed = seed;
    }
    if let Some(fraction) = args.validation_fraction {
        config.split.validation_fraction = fraction;
    }
    if let Some(families) = &args.families {
        config.families = parse_families(families)?;
    }
    Ok(config)
}
