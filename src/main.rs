//! Command-line driver for collrank.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use clap::{CommandFactory, Parser};
use mimalloc::MiMalloc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use collrank::{BinaryEvaluator, ComparisonStore, Evaluator, Method, Sampling, TrainConfig, Trainer};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "collrank")]
#[command(about = "Parallel collaborative ranking from pairwise comparisons")]
#[command(version)]
struct Cli {
    /// Training comparisons, one `user winner loser` per line
    training_file: Option<PathBuf>,
    /// Held-out comparisons in the same format
    testing_file: Option<PathBuf>,
    /// Worker threads
    num_threads: Option<usize>,

    #[arg(long, value_enum)]
    method: Option<Method>,
    /// Latent dimension
    #[arg(long)]
    rank: Option<usize>,
    /// Run seed; drawn from the clock when neither this nor the config sets one
    #[arg(long)]
    seed: Option<u64>,
    /// Conflict partitions (default: threads + 1)
    #[arg(long)]
    partitions: Option<usize>,
    #[arg(long, value_enum)]
    sampling: Option<Sampling>,
    /// TOML run configuration
    #[arg(long)]
    config: Option<PathBuf>,
    /// Implicit `user item` training pairs for precision@k
    #[arg(long, requires = "implicit_test")]
    implicit_train: Option<PathBuf>,
    /// Implicit `user item` held-out pairs for precision@k
    #[arg(long, requires = "implicit_train")]
    implicit_test: Option<PathBuf>,
    /// Print the run summary as JSON
    #[arg(long)]
    json: bool,
    /// Debug logging for this crate
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "info,collrank=debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn clock_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let (Some(training_file), Some(testing_file), Some(num_threads)) =
        (cli.training_file.clone(), cli.testing_file.clone(), cli.num_threads)
    else {
        Cli::command().print_help()?;
        println!();
        return Ok(());
    };

    init_logging(cli.verbose);

    let mut config = match &cli.config {
        Some(path) => TrainConfig::load(path)?,
        None => TrainConfig::default(),
    };
    if let Some(method) = cli.method {
        config.method = method;
    }
    if let Some(rank) = cli.rank {
        config.rank = rank;
    }
    if let Some(partitions) = cli.partitions {
        config.partitions = Some(partitions);
    }
    if let Some(sampling) = cli.sampling {
        config.sgd.sampling = sampling;
    }
    if cli.seed.is_some() {
        config.seed = cli.seed;
    }
    if config.seed.is_none() {
        let seed = clock_seed();
        tracing::info!(seed, "no seed configured, using clock");
        config.seed = Some(seed);
    }

    let store = ComparisonStore::load(&training_file, &testing_file)?;
    let precision_k = config.evaluation.precision_k.clone();
    let mut trainer = Trainer::new(store, config, num_threads)?;
    if let (Some(train), Some(test)) = (&cli.implicit_train, &cli.implicit_test) {
        let evaluator = BinaryEvaluator::load(train, test, precision_k)?;
        trainer = trainer.with_evaluator(Evaluator::Binary(evaluator))?;
    }

    let outcome = trainer.train()?;

    if cli.json {
        let summary = serde_json::to_string_pretty(&outcome).context("serializing run summary")?;
        println!("{summary}");
    } else {
        for (k, p) in &outcome.final_metrics.precision_at_k {
            println!("precision@{k}: {p}");
        }
        println!(
            "{} threads, {} error, takes {} seconds",
            outcome.threads,
            outcome.test_error(),
            outcome.elapsed_secs
        );
    }
    Ok(())
}
