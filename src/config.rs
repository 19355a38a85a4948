use std::ffi::OsString;
use std::path::{Path, PathBuf};

use clap::{ArgAction, Args, Parser, ValueEnum};
use serde::Serialize;
use tracing::info;

use crate::datasets::{ratings_path, Dataset};
use crate::error::{NcfError, Result};
use crate::evaluation::TOP_K;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Default, ValueEnum)]
pub enum BenchmarkLoggerType {
    /// Log through `tracing` only.
    #[default]
    Base,
    /// Append JSON lines under `--benchmark-log-dir`.
    File,
}

/// Options for one NCF training and evaluation run.
#[derive(Args, Debug, Clone)]
pub struct NcfConfig {
    /// Dataset to be trained and evaluated.
    #[arg(long, value_enum, ignore_case = true, default_value = "ml-1m")]
    pub dataset: Dataset,

    /// Download data to data_dir if it is not already present.
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub download_if_missing: bool,

    #[arg(long, default_value = "/tmp/movielens-data/")]
    pub data_dir: PathBuf,

    /// Directory for model checkpoints.
    #[arg(long, default_value = "/tmp/ncf/")]
    pub model_dir: PathBuf,

    /// Remove model_dir before training.
    #[arg(long)]
    pub clean: bool,

    #[arg(long, default_value_t = 2)]
    pub train_epochs: usize,

    #[arg(long, default_value_t = 1)]
    pub epochs_between_evals: usize,

    #[arg(long, default_value_t = 256)]
    pub batch_size: usize,

    /// Number of GPUs the trainer spreads each batch over; 0 runs on CPU.
    #[arg(long, default_value_t = 0)]
    pub num_gpus: usize,

    /// The embedding size of the MF model.
    #[arg(long, default_value_t = 8)]
    pub num_factors: usize,

    /// The sizes of hidden layers for the MLP, e.g. --layers=32,16,8,4
    #[arg(long, value_delimiter = ',', default_value = "64,32,16,8")]
    pub layers: Vec<usize>,

    /// The regularization factor for MF embeddings.
    #[arg(long, default_value_t = 0.0)]
    pub mf_regularization: f64,

    /// The regularization factor for each MLP layer.
    #[arg(long, value_delimiter = ',', default_value = "0,0,0,0")]
    pub mlp_regularization: Vec<f64>,

    /// The number of negative instances to pair with a positive instance.
    #[arg(long, default_value_t = 4)]
    pub num_neg: usize,

    #[arg(long, default_value_t = 0.001)]
    pub learning_rate: f64,

    /// Stop training once the evaluation HR is greater than or equal to this
    /// value. 0.68 matches the paper on ml-1m; 0.95 is reachable on ml-20m.
    #[arg(long)]
    pub hr_threshold: Option<f64>,

    /// Length of the ranked list HR and NDCG are computed over.
    #[arg(long, default_value_t = TOP_K)]
    pub top_k: usize,

    #[arg(long, value_enum, default_value_t = BenchmarkLoggerType::Base)]
    pub benchmark_logger_type: BenchmarkLoggerType,

    #[arg(long)]
    pub benchmark_log_dir: Option<PathBuf>,

    /// Identifier attached to the logged run info.
    #[arg(long)]
    pub benchmark_test_id: Option<String>,

    /// Show a progress bar over training cycles.
    #[arg(long)]
    pub progress: bool,
}

#[derive(Parser)]
#[command(name = "ncf")]
struct Standalone {
    #[command(flatten)]
    config: NcfConfig,
}

/// Parameters recorded with the run info.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunParams {
    pub batch_size: usize,
    pub number_factors: usize,
    pub hr_threshold: Option<f64>,
    pub train_epochs: usize,
}

impl NcfConfig {
    /// Parses run options from an argv-style list whose first element is the
    /// program name.
    pub fn try_parse_from<I, T>(args: I) -> std::result::Result<NcfConfig, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        Standalone::try_parse_from(args).map(|s| s.config)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("train_epochs", self.train_epochs),
            ("epochs_between_evals", self.epochs_between_evals),
            ("batch_size", self.batch_size),
            ("num_factors", self.num_factors),
            ("num_neg", self.num_neg),
            ("top_k", self.top_k),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(NcfError::invalid(format!("{} must be positive", name)));
        }
        if self.epochs_between_evals > self.train_epochs {
            return Err(NcfError::invalid(format!(
                "epochs_between_evals ({}) exceeds train_epochs ({})",
                self.epochs_between_evals, self.train_epochs
            )));
        }
        if self.layers.is_empty() || self.layers.contains(&0) {
            return Err(NcfError::invalid("layers must be non-empty positive sizes"));
        }
        if self.layers.len() != self.mlp_regularization.len() {
            return Err(NcfError::invalid(format!(
                "{} layers but {} mlp_regularization factors",
                self.layers.len(),
                self.mlp_regularization.len()
            )));
        }
        if !(self.mf_regularization >= 0.0)
            || self.mlp_regularization.iter().any(|r| !(*r >= 0.0))
        {
            return Err(NcfError::invalid("regularization factors must be non-negative"));
        }
        if !(self.learning_rate > 0.0) || !self.learning_rate.is_finite() {
            return Err(NcfError::invalid("learning_rate must be positive"));
        }
        if let Some(threshold) = self.hr_threshold {
            if !threshold.is_finite() {
                return Err(NcfError::invalid("hr_threshold must be a finite number"));
            }
        }
        if self.benchmark_logger_type == BenchmarkLoggerType::File
            && self.benchmark_log_dir.is_none()
        {
            return Err(NcfError::invalid(
                "the file benchmark logger needs --benchmark-log-dir",
            ));
        }
        Ok(())
    }

    /// Resolves the ratings file of `dataset` under the expanded `data_dir`,
    /// downloading it first when `download_if_missing` is set.
    pub fn ratings_path(&self) -> Result<PathBuf> {
        let data_dir = expand_path(&self.data_dir)?;
        ratings_path(self.dataset, &data_dir, self.download_if_missing)
    }

    pub fn total_training_cycles(&self) -> usize {
        self.train_epochs / self.epochs_between_evals
    }

    pub fn run_params(&self) -> RunParams {
        RunParams {
            batch_size: self.batch_size,
            number_factors: self.num_factors,
            hr_threshold: self.hr_threshold,
            train_epochs: self.train_epochs,
        }
    }
}

/// Whether `eval_metric` has reached `stop_threshold`. No threshold never stops.
pub fn past_stop_threshold(stop_threshold: Option<f64>, eval_metric: f64) -> Result<bool> {
    let threshold = match stop_threshold {
        None => return Ok(false),
        Some(t) => t,
    };
    if !threshold.is_finite() {
        return Err(NcfError::invalid(format!(
            "stop threshold must be a finite number, got {}",
            threshold
        )));
    }
    if eval_metric >= threshold {
        info!(
            "Stop threshold of {} was passed with metric value {}.",
            threshold, eval_metric
        );
        return Ok(true);
    }
    Ok(false)
}

/// Splits a global batch evenly across GPUs.
pub fn per_device_batch_size(batch_size: usize, num_gpus: usize) -> Result<usize> {
    if num_gpus <= 1 {
        return Ok(batch_size);
    }
    let remainder = batch_size % num_gpus;
    if remainder != 0 {
        return Err(NcfError::IndivisibleBatch {
            batch_size,
            num_gpus,
            suggested: batch_size - remainder,
        });
    }
    Ok(batch_size / num_gpus)
}

/// Deletes the model directory when `--clean` was given.
pub fn apply_clean(config: &NcfConfig) -> Result<()> {
    if config.clean && config.model_dir.exists() {
        info!(model_dir = %config.model_dir.display(), "--clean given, removing model directory");
        std::fs::remove_dir_all(&config.model_dir)?;
    }
    Ok(())
}

/// Expands a leading `~` and environment variables in a user-supplied path.
pub fn expand_path(path: &Path) -> Result<PathBuf> {
    let raw = path.to_string_lossy();
    let expanded = shellexpand::full(&raw)
        .map_err(|e| NcfError::invalid(format!("cannot expand {}: {}", raw, e)))?;
    Ok(PathBuf::from(expanded.into_owned()))
}
