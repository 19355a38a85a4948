//! MovieLens datasets: download, extraction and ratings parsing.
use std::fmt;
use std::fs::{create_dir_all, rename, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use clap::ValueEnum;
use nalgebra_sparse::CooMatrix;
use polars::prelude::{CsvReader, DataFrame, DataType, SerReader};
use tracing::{debug, info};

use crate::error::{NcfError, Result};
use crate::evaluation::Flt;

const GROUPLENS_URL: &str = "https://files.grouplens.org/datasets/movielens";

#[derive(Debug, Clone, Copy, Eq, PartialEq, ValueEnum)]
pub enum Dataset {
    #[value(name = "ml-1m")]
    Ml1m,
    #[value(name = "ml-20m")]
    Ml20m,
}

impl Dataset {
    pub fn name(&self) -> &'static str {
        match self {
            Dataset::Ml1m => "ml-1m",
            Dataset::Ml20m => "ml-20m",
        }
    }

    pub fn url(&self) -> String {
        format!("{}/{}.zip", GROUPLENS_URL, self.name())
    }

    fn ratings_file(&self) -> &'static str {
        match self {
            Dataset::Ml1m => "ratings.dat",
            Dataset::Ml20m => "ratings.csv",
        }
    }

    /// Where the ratings file lands once the archive is extracted into `data_dir`.
    pub fn ratings_path(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(self.name()).join(self.ratings_file())
    }
}

impl FromStr for Dataset {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ml-1m" => Ok(Dataset::Ml1m),
            "ml-20m" => Ok(Dataset::Ml20m),
            _ => Err(format!("Invalid dataset: {}", s)),
        }
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Explicit ratings with users and items remapped to contiguous indices.
///
/// Index `i` corresponds to the `i`-th smallest raw id.
#[derive(Debug)]
pub struct Ratings {
    pub interactions: CooMatrix<Flt>,
    user_ids: Vec<u32>,
    item_ids: Vec<u32>,
}

impl Ratings {
    pub fn num_users(&self) -> usize {
        self.user_ids.len()
    }

    pub fn num_items(&self) -> usize {
        self.item_ids.len()
    }

    pub fn num_ratings(&self) -> usize {
        self.interactions.nnz()
    }

    pub fn raw_user_id(&self, user: usize) -> Option<u32> {
        self.user_ids.get(user).copied()
    }

    pub fn raw_item_id(&self, item: usize) -> Option<u32> {
        self.item_ids.get(item).copied()
    }
}

/// Fetches and extracts `dataset` under `data_dir`, returning the ratings path.
///
/// Nothing is fetched when the ratings file is already in place, and an
/// archive left by an earlier run is extracted without downloading it again.
pub fn download(dataset: Dataset, data_dir: &Path) -> Result<PathBuf> {
    let ratings = dataset.ratings_path(data_dir);
    if ratings.is_file() {
        debug!(path = %ratings.display(), "ratings already present");
        return Ok(ratings);
    }
    create_dir_all(data_dir)?;
    let archive = data_dir.join(format!("{}.zip", dataset.name()));
    if !archive.is_file() {
        info!(url = %dataset.url(), "downloading {}", dataset);
        fetch(&dataset.url(), &archive)?;
    }
    extract_zip(&archive, data_dir)?;
    if !ratings.is_file() {
        return Err(NcfError::DatasetMissing {
            dataset: dataset.to_string(),
            path: ratings,
        });
    }
    info!(path = %ratings.display(), "{} ready", dataset);
    Ok(ratings)
}

/// Resolves the ratings file, downloading it only when allowed.
pub fn ratings_path(dataset: Dataset, data_dir: &Path, download_if_missing: bool) -> Result<PathBuf> {
    let path = dataset.ratings_path(data_dir);
    if path.is_file() {
        Ok(path)
    } else if download_if_missing {
        download(dataset, data_dir)
    } else {
        Err(NcfError::DatasetMissing {
            dataset: dataset.to_string(),
            path,
        })
    }
}

pub fn load_ratings(dataset: Dataset, path: &Path) -> Result<Ratings> {
    // ml-1m separates fields with "::", so every other column is empty
    let df = match dataset {
        Dataset::Ml1m => CsvReader::from_path(path)?
            .with_separator(b':')
            .has_header(false)
            .with_projection(Some(vec![0, 2, 4]))
            .finish()?,
        Dataset::Ml20m => CsvReader::from_path(path)?
            .with_separator(b',')
            .has_header(true)
            .with_projection(Some(vec![0, 1, 2]))
            .finish()?,
    };
    let ratings = ratings_from_frame(&df)?;
    info!(
        dataset = %dataset,
        users = ratings.num_users(),
        items = ratings.num_items(),
        ratings = ratings.num_ratings(),
        "loaded ratings"
    );
    Ok(ratings)
}

fn ratings_from_frame(df: &DataFrame) -> Result<Ratings> {
    let columns = df.get_columns();
    if columns.len() < 3 {
        return Err(NcfError::invalid(format!(
            "expected user, item and rating columns, found {}",
            columns.len()
        )));
    }
    let users = ids(&columns[0].cast(&DataType::UInt32)?, "user")?;
    let items = ids(&columns[1].cast(&DataType::UInt32)?, "item")?;
    let values = columns[2]
        .cast(&DataType::Float32)?
        .f32()?
        .into_iter()
        .map(|v| v.ok_or_else(|| NcfError::invalid("missing rating")))
        .collect::<Result<Vec<Flt>>>()?;

    let user_ids = sorted_unique(&users);
    let item_ids = sorted_unique(&items);
    let mut interactions = CooMatrix::new(user_ids.len(), item_ids.len());
    for ((user, item), value) in users.iter().zip(items.iter()).zip(values) {
        // both ids come from the tables being searched
        if let (Ok(u), Ok(i)) = (user_ids.binary_search(user), item_ids.binary_search(item)) {
            interactions.push(u, i, value);
        }
    }
    Ok(Ratings {
        interactions,
        user_ids,
        item_ids,
    })
}

fn ids(series: &polars::prelude::Series, what: &str) -> Result<Vec<u32>> {
    series
        .u32()?
        .into_iter()
        .map(|id| id.ok_or_else(|| NcfError::invalid(format!("missing {} id", what))))
        .collect()
}

fn sorted_unique(ids: &[u32]) -> Vec<u32> {
    let mut unique = ids.to_vec();
    unique.sort_unstable();
    unique.dedup();
    unique
}

fn fetch(url: &str, dest_path: &Path) -> Result<()> {
    let partial = dest_path.with_extension("part");
    let mut response = reqwest::blocking::get(url)?.error_for_status()?;
    let mut writer = BufWriter::new(File::create(&partial)?);
    std::io::copy(&mut response, &mut writer)?;
    writer.flush()?;
    rename(&partial, dest_path)?;
    Ok(())
}

fn extract_zip(archive: &Path, data_dir: &Path) -> Result<()> {
    let mut zip = zip::ZipArchive::new(File::open(archive)?)?;
    zip.extract(data_dir)?;
    debug!(archive = %archive.display(), files = zip.len(), "extracted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const ML_1M_RATINGS: &str = "1::1193::5::978300760\n\
                                 1::661::3::978302109\n\
                                 2::1193::4::978298413\n\
                                 6040::3408::2::956715518\n";

    const ML_20M_RATINGS: &str = "userId,movieId,rating,timestamp\n\
                                  1,2,3.5,1112486027\n\
                                  1,29,3.5,1112484676\n\
                                  7,2,4.0,1112484819\n";

    #[test]
    fn test_dataset_names() {
        assert_eq!("ML-1M".parse::<Dataset>().unwrap(), Dataset::Ml1m);
        assert_eq!("ml-20m".parse::<Dataset>().unwrap(), Dataset::Ml20m);
        assert!("ml-100k".parse::<Dataset>().is_err());
        assert_eq!(Dataset::Ml20m.to_string(), "ml-20m");
        assert_eq!(
            Dataset::Ml1m.url(),
            "https://files.grouplens.org/datasets/movielens/ml-1m.zip"
        );
    }

    #[test]
    fn test_load_ml_1m() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ratings.dat");
        fs::write(&path, ML_1M_RATINGS).unwrap();

        let ratings = load_ratings(Dataset::Ml1m, &path).unwrap();
        assert_eq!(ratings.num_users(), 3);
        assert_eq!(ratings.num_items(), 3);
        assert_eq!(ratings.num_ratings(), 4);
        assert_eq!(ratings.raw_user_id(2), Some(6040));
        assert_eq!(ratings.raw_item_id(0), Some(661));
        assert_eq!(ratings.raw_item_id(3), None);

        let triplets = ratings.interactions.triplet_iter().collect::<Vec<_>>();
        assert_eq!(triplets[0], (0, 1, &5.0));
        assert_eq!(triplets[3], (2, 2, &2.0));
    }

    #[test]
    fn test_load_ml_20m() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ratings.csv");
        fs::write(&path, ML_20M_RATINGS).unwrap();

        let ratings = load_ratings(Dataset::Ml20m, &path).unwrap();
        assert_eq!(ratings.num_users(), 2);
        assert_eq!(ratings.num_items(), 2);
        assert_eq!(ratings.num_ratings(), 3);
        assert_eq!(ratings.interactions.nrows(), 2);
        assert_eq!(ratings.interactions.ncols(), 2);
        assert_eq!(ratings.raw_item_id(1), Some(29));
    }

    #[test]
    fn test_missing_dataset_without_download() {
        let dir = TempDir::new().unwrap();
        let err = ratings_path(Dataset::Ml1m, dir.path(), false).unwrap_err();
        assert!(matches!(err, NcfError::DatasetMissing { .. }));
    }

    #[test]
    fn test_extracts_cached_archive() {
        let dir = TempDir::new().unwrap();
        let archive = File::create(dir.path().join("ml-1m.zip")).unwrap();
        let mut zip = zip::ZipWriter::new(archive);
        zip.start_file("ml-1m/ratings.dat", zip::write::FileOptions::default())
            .unwrap();
        zip.write_all(ML_1M_RATINGS.as_bytes()).unwrap();
        zip.finish().unwrap();

        let path = ratings_path(Dataset::Ml1m, dir.path(), true).unwrap();
        assert_eq!(path, dir.path().join("ml-1m").join("ratings.dat"));
        assert_eq!(fs::read_to_string(&path).unwrap(), ML_1M_RATINGS);
        assert_eq!(download(Dataset::Ml1m, dir.path()).unwrap(), path);
    }
}
