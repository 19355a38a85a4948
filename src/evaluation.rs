//! Hit Ratio and NDCG over per-user score rows.
//!
//! The evaluation protocol ranks each user's held-out item among a set of
//! sampled items the user never interacted with. Scores arrive as one flat
//! vector, `num_users` rows of equal width laid end to end, and the held-out
//! item always occupies [`TRUE_ITEM_COLUMN`] of its row.
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::f64::consts::LN_2;
use std::path::Path;

use ndarray::{ArrayView1, ArrayView2, Axis};
use polars::prelude::{CsvReader, DataType, SerReader};
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{NcfError, Result};

pub type Flt = f32;

/// Length of the ranked list both metrics are truncated at.
pub const TOP_K: usize = 10;

pub const HR_KEY: &str = "HR";
pub const NDCG_KEY: &str = "NDCG";
pub const GLOBAL_STEP_KEY: &str = "global_step";

/// Column of the held-out positive item in every user row. The evaluation
/// input places it ahead of the sampled negatives.
pub const TRUE_ITEM_COLUMN: usize = 0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankingMetrics {
    pub hit_ratio: f64,
    pub ndcg: f64,
}

/// One evaluation cycle as handed to the benchmark logger.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvalResults {
    #[serde(rename = "HR")]
    pub hr: f64,
    #[serde(rename = "NDCG")]
    pub ndcg: f64,
    pub global_step: u64,
}

impl EvalResults {
    pub fn new(metrics: RankingMetrics, global_step: u64) -> EvalResults {
        EvalResults {
            hr: metrics.hit_ratio,
            ndcg: metrics.ndcg,
            global_step,
        }
    }

    /// The results keyed by their logged names.
    ///
    /// The global step is widened to `f64` here and is exact only up to
    /// 2^53; read [`EvalResults::global_step`] when the exact value matters.
    pub fn to_map(&self) -> BTreeMap<&'static str, f64> {
        BTreeMap::from([
            (HR_KEY, self.hr),
            (NDCG_KEY, self.ndcg),
            (GLOBAL_STEP_KEY, self.global_step as f64),
        ])
    }
}

/// Column indices of the `top_k` highest scores in `row`, best first.
///
/// Equal scores keep ascending column order, so the result does not depend
/// on the sort routine. `-0.0` and `0.0` are equal, and NaN ranks below
/// every other score.
pub fn top_k_indices(row: ArrayView1<Flt>, top_k: usize) -> Vec<usize> {
    let mut indices = (0..row.len()).collect::<Vec<usize>>();
    // sort_by is stable
    indices.sort_by(|&a, &b| descending(row[a], row[b]));
    indices.truncate(top_k);
    indices
}

fn descending(a: Flt, b: Flt) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => b.partial_cmp(&a).unwrap_or(Ordering::Equal),
    }
}

/// Computes Hit Ratio and NDCG at `top_k` for a flat score vector.
///
/// Fails without computing anything when `scores` cannot be reshaped into
/// `num_users` rows, when a row is narrower than `top_k`, or when any score
/// is NaN.
pub fn evaluate(scores: &[Flt], num_users: usize, top_k: usize) -> Result<RankingMetrics> {
    let predicted_scores_by_user = score_matrix(scores, num_users, top_k)?;
    debug!(
        num_users,
        width = predicted_scores_by_user.ncols(),
        top_k,
        "computing ranking metrics"
    );

    let hit_positions = predicted_scores_by_user
        .axis_iter(Axis(0))
        .into_par_iter()
        .map(|row| hit_position(row, top_k))
        .collect::<Vec<Option<usize>>>();

    let hits = hit_positions.iter().flatten().count();
    let dcg: f64 = hit_positions.iter().flatten().map(|&rank| discount(rank)).sum();

    Ok(RankingMetrics {
        hit_ratio: hits as f64 / num_users as f64,
        ndcg: dcg / num_users as f64,
    })
}

/// Reads a header-less file with one predicted score per line.
pub fn load_scores<P: AsRef<Path>>(path: P) -> Result<Vec<Flt>> {
    let path = path.as_ref();
    let dtypes = [DataType::Float32];
    let df = CsvReader::from_path(path)?
        .has_header(false)
        .with_projection(Some(vec![0]))
        .with_dtypes_slice(Some(&dtypes[..]))
        .finish()?;
    let column = df
        .get_columns()
        .first()
        .ok_or_else(|| NcfError::invalid(format!("no scores in {}", path.display())))?
        .cast(&DataType::Float32)?;
    let scores = column
        .f32()?
        .into_iter()
        .enumerate()
        .map(|(line, score)| {
            score.ok_or_else(|| NcfError::invalid(format!("missing score on line {}", line + 1)))
        })
        .collect::<Result<Vec<Flt>>>()?;
    info!(path = %path.display(), count = scores.len(), "loaded predicted scores");
    Ok(scores)
}

fn score_matrix(scores: &[Flt], num_users: usize, top_k: usize) -> Result<ArrayView2<Flt>> {
    if num_users == 0 {
        return Err(NcfError::invalid("num_users must be positive"));
    }
    if top_k == 0 {
        return Err(NcfError::invalid("top_k must be positive"));
    }
    if scores.is_empty() || scores.len() % num_users != 0 {
        return Err(NcfError::ShapeMismatch {
            len: scores.len(),
            num_users,
        });
    }
    let width = scores.len() / num_users;
    if width < top_k {
        return Err(NcfError::TopKExceedsWidth { top_k, width });
    }
    if let Some(pos) = scores.iter().position(|s| s.is_nan()) {
        return Err(NcfError::NanScore {
            user: pos / width,
            column: pos % width,
        });
    }
    ArrayView2::from_shape((num_users, width), scores).map_err(|_| NcfError::ShapeMismatch {
        len: scores.len(),
        num_users,
    })
}

fn hit_position(row: ArrayView1<Flt>, top_k: usize) -> Option<usize> {
    top_k_indices(row, top_k)
        .iter()
        .position(|&column| column == TRUE_ITEM_COLUMN)
}

/// `ln 2 / ln(rank + 2)`, i.e. `1 / log2(rank + 2)`.
#[inline(always)]
fn discount(rank: usize) -> f64 {
    LN_2 / ((rank + 2) as f64).ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_ok::assert_ok;
    use ndarray::{array, Array2};
    use ndarray_rand::rand::SeedableRng;
    use ndarray_rand::RandomExt;
    use rand::distributions::Uniform;
    use rand::prelude::StdRng;
    use shuffle::fy::FisherYates;
    use shuffle::shuffler::Shuffler;
    use std::io::Write;

    fn random_scores(num_users: usize, width: usize) -> Array2<Flt> {
        Array2::random((num_users, width), Uniform::new(0.0 as Flt, 1.0 as Flt))
    }

    fn flat(matrix: &Array2<Flt>) -> Vec<Flt> {
        matrix.iter().cloned().collect()
    }

    #[test]
    fn test_hits_at_first_and_second_rank() {
        let scores: Vec<Flt> = vec![0.9, 0.1, 0.05, 0.1, 0.9, 0.05];
        let metrics = evaluate(&scores, 2, 2).unwrap();
        assert_eq!(metrics.hit_ratio, 1.0);
        let expected = (1.0 + LN_2 / 3f64.ln()) / 2.0;
        assert!((metrics.ndcg - expected).abs() < 1e-12);
        assert!((metrics.ndcg - 0.8155).abs() < 1e-4);
    }

    #[test]
    fn test_miss_outside_top_k() {
        let scores: Vec<Flt> = vec![0.9, 0.1, 0.05, 0.1, 0.2, 0.9];
        let metrics = evaluate(&scores, 2, 2).unwrap();
        assert_eq!(metrics.hit_ratio, 0.5);
        assert!((metrics.ndcg - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_true_item_always_best() {
        let mut scores = random_scores(50, 100);
        scores.column_mut(TRUE_ITEM_COLUMN).fill(2.0);
        let metrics = evaluate(&flat(&scores), 50, TOP_K).unwrap();
        assert_eq!(metrics.hit_ratio, 1.0);
        assert!((metrics.ndcg - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_true_item_never_in_top_k() {
        let mut scores = random_scores(50, 100);
        scores.column_mut(TRUE_ITEM_COLUMN).fill(-1.0);
        let metrics = evaluate(&flat(&scores), 50, TOP_K).unwrap();
        assert_eq!(metrics.hit_ratio, 0.0);
        assert_eq!(metrics.ndcg, 0.0);
    }

    #[test]
    fn test_metrics_bounded() {
        for &(num_users, width, top_k) in &[(1, 1, 1), (7, 20, 5), (100, 1000, 10), (3, 4, 4)] {
            let scores = random_scores(num_users, width);
            let metrics = evaluate(&flat(&scores), num_users, top_k).unwrap();
            assert!((0.0..=1.0).contains(&metrics.hit_ratio));
            assert!((0.0..=1.0).contains(&metrics.ndcg));
            assert!(metrics.ndcg <= metrics.hit_ratio);
        }
    }

    #[test]
    fn test_negative_order_does_not_matter() {
        let mut rng = StdRng::seed_from_u64(42);
        let scores = random_scores(40, 30);
        let mut shuffled = scores.clone();
        for mut row in shuffled.rows_mut() {
            let mut negatives = row.iter().skip(1).cloned().collect::<Vec<Flt>>();
            assert_ok!(FisherYates::default().shuffle(&mut negatives, &mut rng));
            row.iter_mut().skip(1).zip(negatives).for_each(|(s, n)| *s = n);
        }
        assert_eq!(
            evaluate(&flat(&scores), 40, 5).unwrap(),
            evaluate(&flat(&shuffled), 40, 5).unwrap()
        );
    }

    #[test]
    fn test_positive_scaling_does_not_matter() {
        let scores = random_scores(40, 30);
        let mut scaled = scores.clone();
        scaled.row_mut(3).mapv_inplace(|s| s * 2.0);
        scaled.row_mut(17).mapv_inplace(|s| s * 0.5);
        assert_eq!(
            evaluate(&flat(&scores), 40, 5).unwrap(),
            evaluate(&flat(&scaled), 40, 5).unwrap()
        );
    }

    #[test]
    fn test_top_k_ties_break_by_column() {
        let row = array![0.5, 0.7, 0.5, 0.7];
        assert_eq!(top_k_indices(row.view(), 4), vec![1, 3, 0, 2]);
        assert_eq!(top_k_indices(row.view(), 2), vec![1, 3]);

        let metrics = evaluate(&[0.3, 0.3, 0.1], 1, 1).unwrap();
        assert_eq!(metrics.hit_ratio, 1.0);
        assert!((metrics.ndcg - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_rejects_indivisible_scores() {
        let err = evaluate(&[0.1, 0.2, 0.3, 0.4, 0.5], 2, 1).unwrap_err();
        assert!(matches!(err, NcfError::ShapeMismatch { len: 5, num_users: 2 }));
        assert!(matches!(
            evaluate(&[], 2, 1).unwrap_err(),
            NcfError::ShapeMismatch { len: 0, num_users: 2 }
        ));
    }

    #[test]
    fn test_rejects_bad_arguments() {
        let scores: Vec<Flt> = vec![0.1; 6];
        assert!(matches!(
            evaluate(&scores, 2, 4).unwrap_err(),
            NcfError::TopKExceedsWidth { top_k: 4, width: 3 }
        ));
        assert!(matches!(evaluate(&scores, 0, 1).unwrap_err(), NcfError::InvalidArgument(_)));
        assert!(matches!(evaluate(&scores, 2, 0).unwrap_err(), NcfError::InvalidArgument(_)));

        let mut scores = scores;
        scores[5] = Flt::NAN;
        assert!(matches!(
            evaluate(&scores, 2, 1).unwrap_err(),
            NcfError::NanScore { user: 1, column: 2 }
        ));
    }

    #[test]
    fn test_eval_results_keys() {
        let results = EvalResults::new(
            RankingMetrics {
                hit_ratio: 0.5,
                ndcg: 0.25,
            },
            1200,
        );
        let json = serde_json::to_value(results).unwrap();
        assert_eq!(json[HR_KEY], 0.5);
        assert_eq!(json[NDCG_KEY], 0.25);
        assert_eq!(json[GLOBAL_STEP_KEY], 1200);
        assert_eq!(results.to_map()[GLOBAL_STEP_KEY], 1200.0);
    }

    #[test]
    fn test_global_step_beyond_f64_precision() {
        let step = (1u64 << 53) + 1;
        let results = EvalResults::new(
            RankingMetrics {
                hit_ratio: 0.5,
                ndcg: 0.25,
            },
            step,
        );
        assert_eq!(results.global_step, step);
        assert_eq!(serde_json::to_value(results).unwrap()[GLOBAL_STEP_KEY], step);
        assert_eq!(results.to_map().len(), 3);
    }

    #[test]
    fn test_load_scores() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "0.9\n0.1\n0.05\n0.1\n0.9\n0.05").unwrap();
        let scores = load_scores(file.path()).unwrap();
        assert_eq!(scores.len(), 6);
        assert!((scores[0] - 0.9).abs() < 1e-6);
        let metrics = evaluate(&scores, 2, 2).unwrap();
        assert_eq!(metrics.hit_ratio, 1.0);
    }

    #[test]
    fn test_load_scores_late_fraction() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for _ in 0..200 {
            writeln!(file, "1").unwrap();
        }
        writeln!(file, "0.5").unwrap();
        let scores = load_scores(file.path()).unwrap();
        assert_eq!(scores.len(), 201);
        assert_eq!(scores[0], 1.0);
        assert_eq!(scores[200], 0.5);
    }

    #[test]
    fn test_top_k_with_nan() {
        let row = (0..64)
            .map(|i| if i % 3 == 0 { Flt::NAN } else { i as Flt })
            .collect::<Vec<Flt>>();
        let top = top_k_indices(ArrayView1::from(&row), 64);
        assert_eq!(top.len(), 64);
        assert_eq!(&top[..3], &[62, 61, 59]);
        assert!(top[42..].iter().all(|&i| i % 3 == 0));
        assert!(top[42..].windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_top_k_signed_zeros_tie() {
        let row = array![-0.0, 0.0, -1.0, 0.0];
        assert_eq!(top_k_indices(row.view(), 4), vec![0, 1, 3, 2]);
    }
}
