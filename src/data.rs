//! # Data Loading, Validation and Splitting
//!
//! Exclusive entry point for user-provided tabular data. Responsibilities:
//! reading a delimited file (or an in-memory `polars` DataFrame) into clean
//! `ndarray` structures, validating it against the requirements of the
//! decomposition core (numeric, complete, finite), and producing the
//! row-disjoint train/evaluation split that every fitted model and cached
//! decomposition depends on.
//!
//! - User-Centric Errors: failures are assumed to be user-input errors; the
//!   `DataError` enum gives actionable feedback naming the offending column.
//! - The split is seeded so experiments are reproducible; re-splitting is the
//!   responsibility of the engine, which must invalidate its caches when it
//!   happens.

use ndarray::{Array1, Array2, ArrayView1, s};
use polars::prelude::*;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// A feature is identified by its column name.
pub type Feature = String;

/// A comprehensive error type for all data loading and validation failures.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("The target column '{0}' was not found in the input data.")]
    TargetNotFound(String),
    #[error(
        "The column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error("Missing or null values were found in column '{0}'. Complete data is required.")]
    MissingValuesFound(String),
    #[error("Non-finite values (NaN or Infinity) were found in column '{0}'.")]
    NonFiniteValuesFound(String),
    #[error("Input data contains {found} rows, but at least {required} are required.")]
    InsufficientRows { found: usize, required: usize },
    #[error("The column '{0}' was requested but is not present in this matrix.")]
    ColumnNotFound(String),
    #[error("Feature matrix has {names} column names but {cols} data columns.")]
    ShapeMismatch { names: usize, cols: usize },
    #[error("Feature matrix has {rows} rows but the target has {target}.")]
    TargetLengthMismatch { rows: usize, target: usize },
    #[error("test_size must lie strictly between 0 and 1, got {0}.")]
    InvalidTestSize(f64),
    #[error("Splitting {rows} rows with test_size {test_size} leaves an empty partition.")]
    EmptyPartition { rows: usize, test_size: f64 },
}

/// A dense matrix of named feature columns. Shape: [n_rows, n_features].
///
/// Column lookup is by name; the column order of a selection follows the
/// order the names were requested in, which keeps learner inputs aligned
/// with the term definitions built from those same name lists.
#[derive(Debug, Clone)]
pub struct FeatureMatrix {
    names: Vec<Feature>,
    values: Array2<f64>,
}

impl FeatureMatrix {
    pub fn new(names: Vec<Feature>, values: Array2<f64>) -> Result<Self, DataError> {
        if names.len() != values.ncols() {
            return Err(DataError::ShapeMismatch {
                names: names.len(),
                cols: values.ncols(),
            });
        }
        Ok(Self { names, values })
    }

    pub fn names(&self) -> &[Feature] {
        &self.names
    }

    pub fn n_rows(&self) -> usize {
        self.values.nrows()
    }

    pub fn n_cols(&self) -> usize {
        self.values.ncols()
    }

    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    /// View of a single column by name.
    pub fn column(&self, name: &str) -> Result<ArrayView1<'_, f64>, DataError> {
        let idx = self
            .names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| DataError::ColumnNotFound(name.to_string()))?;
        Ok(self.values.slice(s![.., idx]))
    }

    /// New matrix containing exactly the requested columns, in request order.
    pub fn select(&self, names: &[Feature]) -> Result<FeatureMatrix, DataError> {
        let mut out = Array2::zeros((self.n_rows(), names.len()));
        for (j, name) in names.iter().enumerate() {
            out.column_mut(j).assign(&self.column(name)?);
        }
        Ok(FeatureMatrix {
            names: names.to_vec(),
            values: out,
        })
    }

    /// New matrix containing the given rows, in the given order.
    fn take_rows(&self, rows: &[usize]) -> FeatureMatrix {
        let mut out = Array2::zeros((rows.len(), self.n_cols()));
        for (i, &r) in rows.iter().enumerate() {
            out.row_mut(i).assign(&self.values.row(r));
        }
        FeatureMatrix {
            names: self.names.clone(),
            values: out,
        }
    }
}

/// A validated dataset: named numeric feature columns plus one target vector.
#[derive(Debug, Clone)]
pub struct Dataset {
    features: FeatureMatrix,
    target: Array1<f64>,
    target_name: Feature,
}

/// One train/evaluation partition of a [`Dataset`]. Row-disjoint,
/// column-identical.
#[derive(Debug, Clone)]
pub struct Split {
    pub x_train: FeatureMatrix,
    pub x_test: FeatureMatrix,
    pub y_train: Array1<f64>,
    pub y_test: Array1<f64>,
}

const MINIMUM_ROWS: usize = 4;

impl Dataset {
    /// Builds a dataset from a feature matrix and a target vector.
    pub fn new(
        features: FeatureMatrix,
        target_name: &str,
        target: Array1<f64>,
    ) -> Result<Self, DataError> {
        if features.n_rows() != target.len() {
            return Err(DataError::TargetLengthMismatch {
                rows: features.n_rows(),
                target: target.len(),
            });
        }
        if features.n_rows() < MINIMUM_ROWS {
            return Err(DataError::InsufficientRows {
                found: features.n_rows(),
                required: MINIMUM_ROWS,
            });
        }
        for name in features.names() {
            if features.column(name)?.iter().any(|v| !v.is_finite()) {
                return Err(DataError::NonFiniteValuesFound(name.clone()));
            }
        }
        if target.iter().any(|v| !v.is_finite()) {
            return Err(DataError::NonFiniteValuesFound(target_name.to_string()));
        }
        Ok(Self {
            features,
            target,
            target_name: target_name.to_string(),
        })
    }

    /// Builds a dataset from a Polars DataFrame; every non-target column
    /// becomes a feature.
    pub fn from_dataframe(df: &DataFrame, target: &str) -> Result<Self, DataError> {
        let column_names: Vec<String> = df
            .get_column_names()
            .into_iter()
            .map(|s| s.to_string())
            .collect();
        if !column_names.iter().any(|c| c == target) {
            return Err(DataError::TargetNotFound(target.to_string()));
        }

        let feature_names: Vec<Feature> = column_names
            .iter()
            .filter(|c| c.as_str() != target)
            .cloned()
            .collect();

        let n = df.height();
        let mut values = Array2::zeros((n, feature_names.len()));
        for (j, name) in feature_names.iter().enumerate() {
            let col = extract_numeric_column(df, name)?;
            values.column_mut(j).assign(&Array1::from(col));
        }
        let y = Array1::from(extract_numeric_column(df, target)?);

        Dataset::new(FeatureMatrix::new(feature_names, values)?, target, y)
    }

    /// Reads a delimited file (default comma separator) into a dataset.
    pub fn from_csv(path: &Path, target: &str, separator: u8) -> Result<Self, DataError> {
        log::info!("Loading data from '{}'", path.display());
        let df = CsvReader::new(File::open(path)?)
            .with_options(
                CsvReadOptions::default()
                    .with_has_header(true)
                    .with_parse_options(CsvParseOptions::default().with_separator(separator)),
            )
            .finish()?;
        Self::from_dataframe(&df, target)
    }

    pub fn feature_names(&self) -> &[Feature] {
        self.features.names()
    }

    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    pub fn n_rows(&self) -> usize {
        self.features.n_rows()
    }

    /// Shuffles the row indices with `rng` and partitions them so that
    /// `test_size` (a fraction in (0, 1)) of the rows land in the evaluation
    /// side. Both partitions are guaranteed non-empty.
    pub fn split(&self, test_size: f64, rng: &mut StdRng) -> Result<Split, DataError> {
        if !(test_size > 0.0 && test_size < 1.0) {
            return Err(DataError::InvalidTestSize(test_size));
        }
        let n = self.n_rows();
        let n_test = ((n as f64) * test_size).round() as usize;
        if n_test == 0 || n_test == n {
            return Err(DataError::EmptyPartition {
                rows: n,
                test_size,
            });
        }

        let mut indices: Vec<usize> = (0..n).collect();
        indices.shuffle(rng);
        let (test_idx, train_idx) = indices.split_at(n_test);

        let take_y = |rows: &[usize]| Array1::from_iter(rows.iter().map(|&r| self.target[r]));
        Ok(Split {
            x_train: self.features.take_rows(train_idx),
            x_test: self.features.take_rows(test_idx),
            y_train: take_y(train_idx),
            y_test: take_y(test_idx),
        })
    }
}

/// Deterministic rng for a given seed; entropy-seeded when `None`.
pub fn split_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    }
}

fn validate_is_finite(values: &[f64], column_name: &str) -> Result<(), DataError> {
    if values.iter().any(|&v| !v.is_finite()) {
        return Err(DataError::NonFiniteValuesFound(column_name.to_string()));
    }
    Ok(())
}

fn extract_numeric_column(df: &DataFrame, column_name: &str) -> Result<Vec<f64>, DataError> {
    let series = df.column(column_name)?;
    if series.null_count() > 0 {
        return Err(DataError::MissingValuesFound(column_name.to_string()));
    }

    let casted = match series.cast(&DataType::Float64) {
        Ok(casted) => casted,
        Err(_) => {
            return Err(DataError::ColumnWrongType {
                column_name: column_name.to_string(),
                expected_type: "f64 (numeric)",
                found_type: format!("{:?}", series.dtype()),
            });
        }
    };
    if casted.null_count() > 0 {
        return Err(DataError::ColumnWrongType {
            column_name: column_name.to_string(),
            expected_type: "f64 (numeric)",
            found_type: format!("{:?}", series.dtype()),
        });
    }

    let chunked = casted.f64()?.rechunk();
    let values: Vec<f64> = chunked.into_no_null_iter().collect();
    validate_is_finite(&values, column_name)?;
    Ok(values)
}
