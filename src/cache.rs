//! Vertically-sharded dataset cache.
//!
//! The cache is a directory with a `metadata.json` descriptor and one binary
//! file per column. Workers load only the columns they own plus the label
//! column; the manager reads nothing but the descriptor. The format is
//! internal to this crate: the training driver treats the cache as an opaque
//! path plus [`CacheMetadata`].
//!
//! Column payloads are postcard-encoded. The descriptor is JSON so a run can
//! be inspected by eye.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrainError};

const METADATA_FILE: &str = "metadata.json";

/// Semantic type and per-column statistics of one cached column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ColumnMeta {
    Boolean,
    Categorical {
        num_values: u32,
    },
    Numerical {
        num_unique_values: u64,
    },
    /// Numerical column pre-bucketized at cache-build time. `boundaries` are
    /// sorted; value `v` falls in bucket `|{b : b <= v}|`.
    DiscretizedNumerical {
        boundaries: Vec<f32>,
    },
}

/// Descriptor of a dataset cache. Read once at training start; immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub num_examples: u64,
    pub columns: Vec<ColumnMeta>,
}

impl CacheMetadata {
    pub fn load(cache_dir: &Path) -> Result<Self> {
        let path = cache_dir.join(METADATA_FILE);
        let raw = fs::read_to_string(&path).map_err(|e| TrainError::io(&path, e))?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn save(&self, cache_dir: &Path) -> Result<()> {
        let path = cache_dir.join(METADATA_FILE);
        let raw = serde_json::to_string_pretty(self)?;
        fs::write(&path, raw).map_err(|e| TrainError::io(&path, e))
    }

    pub fn column(&self, idx: usize) -> Result<&ColumnMeta> {
        self.columns.get(idx).ok_or_else(|| {
            TrainError::config(format!(
                "column {idx} is out of range, the cache has {} columns",
                self.columns.len()
            ))
        })
    }
}

/// Materialized values of one column, as stored in its cache file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ColumnData {
    /// 0 or 1 per example.
    Boolean(Vec<u8>),
    /// Category index per example.
    Categorical(Vec<u16>),
    /// Raw value per example.
    Numerical(Vec<f32>),
    /// Bucket index per example; boundaries live in [`ColumnMeta`].
    Discretized(Vec<u16>),
}

impl ColumnData {
    pub fn len(&self) -> usize {
        match self {
            Self::Boolean(v) => v.len(),
            Self::Categorical(v) => v.len(),
            Self::Numerical(v) => v.len(),
            Self::Discretized(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn load(cache_dir: &Path, column_idx: usize) -> Result<Self> {
        let path = column_path(cache_dir, column_idx);
        let raw = fs::read(&path).map_err(|e| TrainError::io(&path, e))?;
        Ok(postcard::from_bytes(&raw)?)
    }

    pub fn save(&self, cache_dir: &Path, column_idx: usize) -> Result<()> {
        let path = column_path(cache_dir, column_idx);
        let raw = postcard::to_allocvec(self)?;
        fs::write(&path, raw).map_err(|e| TrainError::io(&path, e))
    }

    /// Read the column as label values: class indices for categorical and
    /// boolean columns, raw values for numerical ones.
    pub fn label_values(&self) -> Result<Vec<f32>> {
        match self {
            Self::Numerical(v) => Ok(v.clone()),
            Self::Categorical(v) => Ok(v.iter().map(|&c| c as f32).collect()),
            Self::Boolean(v) => Ok(v.iter().map(|&b| b as f32).collect()),
            Self::Discretized(_) => Err(TrainError::config(
                "a discretized column cannot be used as the label",
            )),
        }
    }
}

fn column_path(cache_dir: &Path, column_idx: usize) -> PathBuf {
    cache_dir.join(format!("column-{column_idx}"))
}

/// Bucket of `value` given sorted discretization boundaries.
pub fn bucket_index(boundaries: &[f32], value: f32) -> u16 {
    boundaries.partition_point(|b| *b <= value) as u16
}

// =============================================================================
// In-memory datasets and the cache builder
// =============================================================================

/// One column of an in-memory tabular dataset, before caching.
#[derive(Debug, Clone)]
pub enum RawColumn {
    Boolean(Vec<bool>),
    Categorical { values: Vec<u16>, num_values: u32 },
    Numerical(Vec<f32>),
    /// Numerical values to be bucketized into at most `max_buckets` buckets
    /// when the cache is built.
    DiscretizedNumerical { values: Vec<f32>, max_buckets: usize },
}

impl RawColumn {
    fn len(&self) -> usize {
        match self {
            Self::Boolean(v) => v.len(),
            Self::Categorical { values, .. } => values.len(),
            Self::Numerical(v) => v.len(),
            Self::DiscretizedNumerical { values, .. } => values.len(),
        }
    }
}

/// An in-memory tabular dataset. The distributed learner does not train from
/// it directly; it is the input of [`build_cache`].
#[derive(Debug, Clone, Default)]
pub struct RawDataset {
    pub columns: Vec<RawColumn>,
}

impl RawDataset {
    pub fn num_examples(&self) -> usize {
        self.columns.first().map_or(0, RawColumn::len)
    }
}

/// Where the training data comes from.
#[derive(Debug, Clone)]
pub enum DatasetSource {
    /// Path of a dataset cache built with [`build_cache`] (or an external
    /// builder producing the same layout).
    Cache(PathBuf),
    /// In-memory dataset. Rejected by the distributed learner.
    InMemory(RawDataset),
}

/// Vertically partition an in-memory dataset into a cache directory: one file
/// per column plus the metadata descriptor.
pub fn build_cache(dataset: &RawDataset, cache_dir: &Path) -> Result<CacheMetadata> {
    if dataset.columns.is_empty() {
        return Err(TrainError::config("cannot build a cache from zero columns"));
    }
    let num_examples = dataset.num_examples();
    for (idx, column) in dataset.columns.iter().enumerate() {
        if column.len() != num_examples {
            return Err(TrainError::config(format!(
                "column {idx} has {} values, expected {num_examples}",
                column.len()
            )));
        }
    }

    fs::create_dir_all(cache_dir).map_err(|e| TrainError::io(cache_dir, e))?;

    let mut columns = Vec::with_capacity(dataset.columns.len());
    for (idx, column) in dataset.columns.iter().enumerate() {
        let (meta, data) = match column {
            RawColumn::Boolean(values) => (
                ColumnMeta::Boolean,
                ColumnData::Boolean(values.iter().map(|&b| b as u8).collect()),
            ),
            RawColumn::Categorical { values, num_values } => (
                ColumnMeta::Categorical {
                    num_values: *num_values,
                },
                ColumnData::Categorical(values.clone()),
            ),
            RawColumn::Numerical(values) => (
                ColumnMeta::Numerical {
                    num_unique_values: count_unique(values),
                },
                ColumnData::Numerical(values.clone()),
            ),
            RawColumn::DiscretizedNumerical {
                values,
                max_buckets,
            } => {
                let boundaries = discretization_boundaries(values, *max_buckets);
                let buckets = values
                    .iter()
                    .map(|&v| bucket_index(&boundaries, v))
                    .collect();
                (
                    ColumnMeta::DiscretizedNumerical { boundaries },
                    ColumnData::Discretized(buckets),
                )
            }
        };
        data.save(cache_dir, idx)?;
        columns.push(meta);
    }

    let metadata = CacheMetadata {
        num_examples: num_examples as u64,
        columns,
    };
    metadata.save(cache_dir)?;
    Ok(metadata)
}

fn count_unique(values: &[f32]) -> u64 {
    let mut sorted: Vec<f32> = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    sorted.dedup();
    sorted.len() as u64
}

/// Midpoints between consecutive unique values, thinned down to at most
/// `max_buckets - 1` boundaries.
fn discretization_boundaries(values: &[f32], max_buckets: usize) -> Vec<f32> {
    let mut unique: Vec<f32> = values.to_vec();
    unique.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    unique.dedup();

    let mut boundaries: Vec<f32> = unique
        .windows(2)
        .map(|pair| (pair[0] + pair[1]) / 2.0)
        .collect();

    let max_boundaries = max_buckets.saturating_sub(1).max(1);
    if boundaries.len() > max_boundaries {
        let stride = boundaries.len() as f64 / max_boundaries as f64;
        boundaries = (0..max_boundaries)
            .map(|i| boundaries[(i as f64 * stride) as usize])
            .collect();
    }
    boundaries
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn build_and_reload_cache() {
        let dir = TempDir::new().unwrap();
        let dataset = RawDataset {
            columns: vec![
                RawColumn::Numerical(vec![1.0, 2.0, 3.0, 4.0]),
                RawColumn::Boolean(vec![true, false, true, false]),
                RawColumn::Categorical {
                    values: vec![0, 1, 2, 1],
                    num_values: 3,
                },
            ],
        };

        let metadata = build_cache(&dataset, dir.path()).unwrap();
        assert_eq!(metadata.num_examples, 4);
        assert_eq!(metadata.columns.len(), 3);

        let reloaded = CacheMetadata::load(dir.path()).unwrap();
        assert_eq!(reloaded.num_examples, 4);
        assert_eq!(
            reloaded.column(2).unwrap(),
            &ColumnMeta::Categorical { num_values: 3 }
        );

        let column = ColumnData::load(dir.path(), 0).unwrap();
        match column {
            ColumnData::Numerical(values) => assert_eq!(values, vec![1.0, 2.0, 3.0, 4.0]),
            other => panic!("unexpected column payload: {other:?}"),
        }
    }

    #[test]
    fn ragged_columns_are_rejected() {
        let dir = TempDir::new().unwrap();
        let dataset = RawDataset {
            columns: vec![
                RawColumn::Numerical(vec![1.0, 2.0]),
                RawColumn::Numerical(vec![1.0]),
            ],
        };
        assert!(build_cache(&dataset, dir.path()).is_err());
    }

    #[test]
    fn discretization_buckets_are_ordered() {
        let values = vec![5.0, 1.0, 3.0, 2.0, 4.0];
        let boundaries = discretization_boundaries(&values, 16);
        assert_eq!(boundaries.len(), 4);
        assert!(boundaries.windows(2).all(|p| p[0] < p[1]));

        assert_eq!(bucket_index(&boundaries, 0.5), 0);
        assert_eq!(bucket_index(&boundaries, 3.0), 2);
        assert_eq!(bucket_index(&boundaries, 99.0), 4);
    }

    #[test]
    fn discretization_respects_max_buckets() {
        let values: Vec<f32> = (0..100).map(|i| i as f32).collect();
        let boundaries = discretization_boundaries(&values, 8);
        assert!(boundaries.len() <= 7);
    }

    #[test]
    fn label_values_from_categorical() {
        let column = ColumnData::Categorical(vec![0, 2, 1]);
        assert_eq!(column.label_values().unwrap(), vec![0.0, 2.0, 1.0]);
    }
}
