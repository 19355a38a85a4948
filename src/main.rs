use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::info;

use ncf::{
    benchmark_context, benchmark_logger, evaluate, expand_path, load_ratings, load_scores,
    ratings_path, BenchmarkLoggerType, Dataset, EvalResults, TOP_K,
};

#[derive(Parser)]
#[command(name = "ncf", version, about = "MovieLens data and HR/NDCG evaluation for NCF runs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download and extract a MovieLens dataset.
    Download(DataArgs),
    /// Load a dataset's ratings and report its size.
    Inspect(DataArgs),
    /// Compute HR and NDCG for scores written by an external predictor.
    Evaluate(EvaluateArgs),
}

#[derive(Args)]
struct DataArgs {
    #[arg(long, value_enum, ignore_case = true, default_value = "ml-1m")]
    dataset: Dataset,

    #[arg(long, default_value = "/tmp/movielens-data/")]
    data_dir: PathBuf,

    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    download_if_missing: bool,
}

#[derive(Args)]
struct EvaluateArgs {
    /// One score per line; user rows laid end to end, held-out item first.
    #[arg(long)]
    scores: PathBuf,

    #[arg(long)]
    num_users: usize,

    #[arg(long, default_value_t = TOP_K)]
    top_k: usize,

    /// Training step the scores were produced at.
    #[arg(long, default_value_t = 0)]
    global_step: u64,

    #[arg(long, value_enum, default_value_t = BenchmarkLoggerType::Base)]
    benchmark_logger_type: BenchmarkLoggerType,

    #[arg(long)]
    benchmark_log_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(tracing::Level::INFO)
        .init();

    match Cli::parse().command {
        Command::Download(args) => {
            let data_dir = expand_path(&args.data_dir)?;
            let path = ncf::download(args.dataset, &data_dir)
                .with_context(|| format!("failed to fetch {}", args.dataset))?;
            println!("{}", path.display());
        }
        Command::Inspect(args) => {
            let data_dir = expand_path(&args.data_dir)?;
            let path = ratings_path(args.dataset, &data_dir, args.download_if_missing)?;
            let ratings = load_ratings(args.dataset, &path)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            println!(
                "{}: users={} items={} ratings={}",
                args.dataset,
                ratings.num_users(),
                ratings.num_items(),
                ratings.num_ratings()
            );
        }
        Command::Evaluate(args) => {
            let log_dir = args.benchmark_log_dir.as_deref().map(expand_path).transpose()?;
            let mut logger = benchmark_logger(args.benchmark_logger_type, log_dir.as_deref())?;
            let eval_results = benchmark_context(logger.as_mut(), |logger| {
                let scores = load_scores(&args.scores)?;
                let metrics = evaluate(&scores, args.num_users, args.top_k)?;
                let eval_results = EvalResults::new(metrics, args.global_step);
                logger.log_evaluation_result(&eval_results)?;
                Ok(eval_results)
            })?;
            info!(top_k = args.top_k, "evaluation finished");
            println!("HR = {:.4}, NDCG = {:.4}", eval_results.hr, eval_results.ndcg);
        }
    }
    Ok(())
}
