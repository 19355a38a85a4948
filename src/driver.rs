//! The train/evaluate loop.
//!
//! Model definition, input pipelines and negative sampling belong to the
//! caller, reached through [`NcfDataset`] and [`Estimator`]. The loop only
//! sequences them: each cycle trains for `epochs_between_evals` epochs, then
//! scores the evaluation input, ranks it and logs HR and NDCG.
use std::path::{Path, PathBuf};

use tqdm::Iter;
use tracing::info;

use crate::config::{apply_clean, past_stop_threshold, per_device_batch_size, NcfConfig};
use crate::error::{NcfError, Result};
use crate::evaluation::{evaluate, EvalResults, Flt};
use crate::logger::{BenchmarkLogger, RunInfo};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct InputSpec {
    pub training: bool,
    pub batch_size: usize,
    pub num_epochs: usize,
}

/// Source of training and evaluation input.
///
/// The evaluation input must yield one row per user, in user order, with the
/// held-out item first and the sampled negatives after it.
pub trait NcfDataset {
    type Input;

    fn num_users(&self) -> usize;

    fn num_items(&self) -> usize;

    fn input_fn(&self, spec: InputSpec) -> Self::Input;
}

impl<D: NcfDataset + ?Sized> NcfDataset for &D {
    type Input = D::Input;

    fn num_users(&self) -> usize {
        (**self).num_users()
    }

    fn num_items(&self) -> usize {
        (**self).num_items()
    }

    fn input_fn(&self, spec: InputSpec) -> Self::Input {
        (**self).input_fn(spec)
    }
}

pub trait Estimator {
    type Input;
    type Error: std::error::Error + Send + Sync + 'static;

    fn train(&mut self, input: Self::Input) -> std::result::Result<(), Self::Error>;

    /// Scores for every example of `input`, in batches, in input order.
    fn predict(&self, input: Self::Input) -> std::result::Result<Vec<Vec<Flt>>, Self::Error>;

    fn global_step(&self) -> u64;
}

/// Everything the model-construction function gets to build the NeuMF model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelParams {
    pub num_users: usize,
    pub num_items: usize,
    pub num_factors: usize,
    pub layers: Vec<usize>,
    pub batch_size: usize,
    pub mf_regularization: f64,
    pub mlp_regularization: Vec<f64>,
    pub learning_rate: f64,
    pub num_gpus: usize,
    pub model_dir: PathBuf,
}

impl ModelParams {
    pub fn new<D: NcfDataset + ?Sized>(config: &NcfConfig, dataset: &D) -> ModelParams {
        ModelParams {
            num_users: dataset.num_users(),
            num_items: dataset.num_items(),
            num_factors: config.num_factors,
            layers: config.layers.clone(),
            batch_size: config.batch_size,
            mf_regularization: config.mf_regularization,
            mlp_regularization: config.mlp_regularization.clone(),
            learning_rate: config.learning_rate,
            num_gpus: config.num_gpus,
            model_dir: config.model_dir.clone(),
        }
    }
}

#[derive(Debug)]
pub struct NcfRun<E> {
    pub estimator: E,
    /// One entry per completed cycle.
    pub history: Vec<EvalResults>,
}

/// Scores `pred_input` and computes HR and NDCG at `top_k`.
pub fn evaluate_model<E: Estimator>(
    estimator: &E,
    num_users: usize,
    pred_input: E::Input,
    top_k: usize,
) -> Result<EvalResults> {
    info!("Computing predictions for eval set...");
    let prediction_batches = estimator.predict(pred_input).map_err(estimator_error)?;
    let predicted_scores = prediction_batches.concat();

    info!("Computing metrics...");
    let metrics = evaluate(&predicted_scores, num_users, top_k)?;
    Ok(EvalResults::new(metrics, estimator.global_step()))
}

/// Loads the dataset from its ratings file, builds the model and alternates
/// training and evaluation until the configured epochs are spent or HR
/// reaches `hr_threshold`.
///
/// The ratings file is resolved with [`NcfConfig::ratings_path`], so it is
/// downloaded first when missing and `download_if_missing` is set.
/// Errors from the estimator end the run and are returned as the source of
/// [`NcfError::Estimator`].
pub fn run_ncf<D, E, F, B, L>(
    config: &NcfConfig,
    load_dataset: F,
    build_model: B,
    logger: &mut L,
) -> Result<NcfRun<E>>
where
    D: NcfDataset,
    E: Estimator<Input = D::Input>,
    F: FnOnce(&Path) -> Result<D>,
    B: FnOnce(&ModelParams) -> std::result::Result<E, E::Error>,
    L: BenchmarkLogger + ?Sized,
{
    config.validate()?;
    let ratings = config.ratings_path()?;
    info!(dataset = %config.dataset, path = %ratings.display(), "Loading dataset...");
    let dataset = load_dataset(&ratings)?;
    apply_clean(config)?;

    info!("Creating model...");
    let params = ModelParams::new(config, &dataset);
    let mut estimator = build_model(&params).map_err(estimator_error)?;

    logger.log_run_info(&RunInfo::new(config))?;

    let batch_size = per_device_batch_size(config.batch_size, config.num_gpus)?;
    let total_training_cycle = config.total_training_cycles();
    let mut history = Vec::with_capacity(total_training_cycle);

    for cycle_index in cycles(total_training_cycle, config.progress) {
        info!(
            "Starting a training cycle: {}/{}",
            cycle_index + 1,
            total_training_cycle
        );

        let train_input = dataset.input_fn(InputSpec {
            training: true,
            batch_size,
            num_epochs: config.epochs_between_evals,
        });
        estimator.train(train_input).map_err(estimator_error)?;

        let pred_input = dataset.input_fn(InputSpec {
            training: false,
            batch_size,
            num_epochs: 1,
        });
        let eval_results = evaluate_model(&estimator, dataset.num_users(), pred_input, config.top_k)?;

        logger.log_evaluation_result(&eval_results)?;
        info!(
            "Iteration {}: HR = {:.4}, NDCG = {:.4}",
            cycle_index + 1,
            eval_results.hr,
            eval_results.ndcg
        );
        history.push(eval_results);

        if past_stop_threshold(config.hr_threshold, eval_results.hr)? {
            break;
        }
    }

    Ok(NcfRun { estimator, history })
}

fn cycles(n: usize, progress: bool) -> Box<dyn Iterator<Item = usize>> {
    if progress {
        Box::new((0..n).tqdm())
    } else {
        Box::new(0..n)
    }
}

fn estimator_error<E: std::error::Error + Send + Sync + 'static>(e: E) -> NcfError {
    NcfError::Estimator(Box::new(e))
}
