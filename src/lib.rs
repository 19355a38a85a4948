//! Training/evaluation orchestration for neural collaborative filtering.
//!
//! The ranking metrics live in [`evaluation`]: given one flat vector of
//! predicted scores and the number of users, [`evaluate`] reshapes it into
//! per-user rows, ranks each row and reports Hit Ratio and NDCG at `top_k`.
//! [`run_ncf`] drives an external [`Estimator`] through train/evaluate cycles
//! over an [`NcfDataset`], handing each result to a [`BenchmarkLogger`].
//!
//! ```
//! let scores: [f32; 6] = [0.9, 0.1, 0.05, 0.1, 0.9, 0.05];
//! let metrics = ncf::evaluate(&scores, 2, 2).unwrap();
//! assert_eq!(metrics.hit_ratio, 1.0);
//! assert!((metrics.ndcg - 0.8155).abs() < 1e-4);
//! ```
mod config;
mod datasets;
mod driver;
mod error;
pub mod evaluation;
mod logger;

pub use config::*;
pub use datasets::*;
pub use driver::*;
pub use error::*;
pub use evaluation::*;
pub use logger::*;
