//! Sinks for run information and per-cycle evaluation metrics.
use std::collections::BTreeMap;
use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::{BenchmarkLoggerType, NcfConfig, RunParams};
use crate::error::{NcfError, Result};
use crate::evaluation::{EvalResults, GLOBAL_STEP_KEY};

pub const MODEL_NAME: &str = "recommendation";

pub const BENCHMARK_RUN_LOG: &str = "benchmark_run.log";
pub const METRIC_LOG: &str = "metric.log";

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunInfo {
    pub model_name: String,
    pub dataset_name: String,
    pub run_params: RunParams,
    pub test_id: Option<String>,
    pub run_date: DateTime<Utc>,
}

impl RunInfo {
    pub fn new(config: &NcfConfig) -> RunInfo {
        RunInfo {
            model_name: MODEL_NAME.to_string(),
            dataset_name: config.dataset.to_string(),
            run_params: config.run_params(),
            test_id: config.benchmark_test_id.clone(),
            run_date: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricRecord {
    pub name: String,
    pub value: f64,
    pub unit: Option<String>,
    pub global_step: u64,
    pub timestamp: DateTime<Utc>,
    /// Free-form tags attached to the metric.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extras: BTreeMap<String, String>,
}

impl MetricRecord {
    pub fn new(name: &str, value: f64, global_step: u64) -> MetricRecord {
        MetricRecord {
            name: name.to_string(),
            value,
            unit: None,
            global_step,
            timestamp: Utc::now(),
            extras: BTreeMap::new(),
        }
    }

    pub fn with_extra(mut self, name: &str, value: &str) -> MetricRecord {
        self.extras.insert(name.to_string(), value.to_string());
        self
    }
}

pub trait BenchmarkLogger {
    fn log_run_info(&mut self, run_info: &RunInfo) -> Result<()>;

    fn log_metric(&mut self, metric: &MetricRecord) -> Result<()>;

    /// Logs every evaluation value except the global step, tagged with that step.
    fn log_evaluation_result(&mut self, eval_results: &EvalResults) -> Result<()> {
        for (name, value) in eval_results.to_map() {
            if name != GLOBAL_STEP_KEY {
                self.log_metric(&MetricRecord::new(name, value, eval_results.global_step))?;
            }
        }
        Ok(())
    }

    fn on_finish(&mut self, status: RunStatus) -> Result<()>;
}

/// Writes everything to the `tracing` subscriber.
#[derive(Debug, Default)]
pub struct BaseBenchmarkLogger;

impl BenchmarkLogger for BaseBenchmarkLogger {
    fn log_run_info(&mut self, run_info: &RunInfo) -> Result<()> {
        info!(
            model = %run_info.model_name,
            dataset = %run_info.dataset_name,
            params = %serde_json::to_string(&run_info.run_params)?,
            "benchmark run info"
        );
        Ok(())
    }

    fn log_metric(&mut self, metric: &MetricRecord) -> Result<()> {
        info!(
            name = %metric.name,
            value = metric.value,
            global_step = metric.global_step,
            "benchmark metric"
        );
        Ok(())
    }

    fn on_finish(&mut self, status: RunStatus) -> Result<()> {
        info!(?status, "benchmark run finished");
        Ok(())
    }
}

/// Writes the run info to `benchmark_run.log` and appends one JSON line per
/// metric to `metric.log`.
#[derive(Debug)]
pub struct FileBenchmarkLogger {
    log_dir: PathBuf,
    run: Option<serde_json::Value>,
}

impl FileBenchmarkLogger {
    pub fn new(log_dir: &Path) -> Result<FileBenchmarkLogger> {
        create_dir_all(log_dir)?;
        Ok(FileBenchmarkLogger {
            log_dir: log_dir.to_path_buf(),
            run: None,
        })
    }

    fn write_run(&self) -> Result<()> {
        if let Some(run) = &self.run {
            let mut writer = BufWriter::new(File::create(self.log_dir.join(BENCHMARK_RUN_LOG))?);
            serde_json::to_writer(&mut writer, run)?;
            writeln!(writer)?;
            writer.flush()?;
        }
        Ok(())
    }
}

impl BenchmarkLogger for FileBenchmarkLogger {
    fn log_run_info(&mut self, run_info: &RunInfo) -> Result<()> {
        let mut run = serde_json::to_value(run_info)?;
        run["status"] = serde_json::to_value(RunStatus::Running)?;
        self.run = Some(run);
        self.write_run()
    }

    fn log_metric(&mut self, metric: &MetricRecord) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_dir.join(METRIC_LOG))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, metric)?;
        writeln!(writer)?;
        writer.flush()?;
        Ok(())
    }

    fn on_finish(&mut self, status: RunStatus) -> Result<()> {
        if let Some(run) = self.run.as_mut() {
            run["status"] = serde_json::to_value(status)?;
        }
        self.write_run()
    }
}

/// The sink selected by `--benchmark-logger-type`.
pub fn benchmark_logger(
    logger_type: BenchmarkLoggerType,
    log_dir: Option<&Path>,
) -> Result<Box<dyn BenchmarkLogger>> {
    match logger_type {
        BenchmarkLoggerType::Base => Ok(Box::new(BaseBenchmarkLogger)),
        BenchmarkLoggerType::File => {
            let dir = log_dir.ok_or_else(|| {
                NcfError::invalid("the file benchmark logger needs --benchmark-log-dir")
            })?;
            Ok(Box::new(FileBenchmarkLogger::new(dir)?))
        }
    }
}

/// Runs `f`, then records whether it succeeded. The error from `f` wins over
/// an error raised while recording the failure.
pub fn benchmark_context<L, T, F>(logger: &mut L, f: F) -> Result<T>
where
    L: BenchmarkLogger + ?Sized,
    F: FnOnce(&mut L) -> Result<T>,
{
    match f(logger) {
        Ok(value) => {
            logger.on_finish(RunStatus::Success)?;
            Ok(value)
        }
        Err(e) => {
            error!(error = %e, "benchmark run failed");
            if let Err(finish) = logger.on_finish(RunStatus::Failure) {
                warn!(error = %finish, "could not record failed run");
            }
            Err(e)
        }
    }
}
