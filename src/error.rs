use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, NcfError>;

#[derive(Debug, Error)]
pub enum NcfError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("score vector of length {len} cannot be reshaped into {num_users} user rows")]
    ShapeMismatch { len: usize, num_users: usize },

    #[error("top_k ({top_k}) exceeds the per-user row width ({width})")]
    TopKExceedsWidth { top_k: usize, width: usize },

    #[error("score at user {user}, column {column} is NaN")]
    NanScore { user: usize, column: usize },

    #[error("batch size {batch_size} must be a multiple of the number of GPUs ({num_gpus}); try {suggested}")]
    IndivisibleBatch {
        batch_size: usize,
        num_gpus: usize,
        suggested: usize,
    },

    #[error("dataset {dataset} missing from {}; enable download_if_missing to fetch it", .path.display())]
    DatasetMissing { dataset: String, path: PathBuf },

    #[error("estimator failed")]
    Estimator(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),

    #[error(transparent)]
    Polars(#[from] polars::prelude::PolarsError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl NcfError {
    pub(crate) fn invalid(msg: impl Into<String>) -> NcfError {
        NcfError::InvalidArgument(msg.into())
    }
}
