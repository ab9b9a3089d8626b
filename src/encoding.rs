//! Mean-target encoding of categorical columns, fitted on training data and
//! replayed from disk at inference time.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;
use tracing::{info, warn};

use crate::cache::{write_atomic, CacheError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncodingMode {
    Train,
    Test,
}

impl EncodingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Test => "test",
        }
    }

    pub fn resolve(
        self,
        column: &str,
        observations: &[(String, f64)],
        store: &TargetEncodingStore,
        allow_missing: bool,
    ) -> Result<TargetEncoding, EncodingError> {
        match self {
            Self::Train => {
                let encoding = fit_target_encoding(column, observations);
                store.save(&encoding)?;
                Ok(encoding)
            }
            Self::Test => load_target_encoding(store, column, allow_missing),
        }
    }
}

impl FromStr for EncodingMode {
    type Err = EncodingError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "train" => Ok(Self::Train),
            "test" => Ok(Self::Test),
            other => Err(EncodingError::InvalidMode(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum EncodingError {
    #[error("invalid mode '{0}': expected 'train' or 'test'")]
    InvalidMode(String),
    #[error("no persisted target encoding for {column} at {path}")]
    MissingEncoding { column: String, path: PathBuf },
    #[error("target encoding file {path} has no column {column}")]
    MissingColumn { path: PathBuf, column: String },
    #[error("target encoding file {path} has unparseable value '{value}'")]
    InvalidValue { path: PathBuf, value: String },
    #[error("CSV error in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TargetEncoding {
    column: String,
    means: BTreeMap<String, f64>,
}

impl TargetEncoding {
    pub fn new(column: impl Into<String>, means: BTreeMap<String, f64>) -> Self {
        Self {
            column: column.into(),
            means,
        }
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    pub fn encoded_column(&self) -> String {
        encoded_column_name(&self.column)
    }

    pub fn means(&self) -> &BTreeMap<String, f64> {
        &self.means
    }

    pub fn encode(&self, category: &str) -> f64 {
        self.means.get(category).copied().unwrap_or(0.0)
    }
}

pub fn encoded_column_name(column: &str) -> String {
    format!("{column}_target_encoded")
}

pub fn fit_target_encoding(column: &str, observations: &[(String, f64)]) -> TargetEncoding {
    let mut sums: BTreeMap<&str, (f64, usize)> = BTreeMap::new();
    for (category, target) in observations {
        if target.is_nan() {
            continue;
        }
        let entry = sums.entry(category.as_str()).or_insert((0.0, 0));
        entry.0 += target;
        entry.1 += 1;
    }

    let mut means: BTreeMap<String, f64> = sums
        .into_iter()
        .map(|(category, (sum, count))| (category.to_string(), sum / count as f64))
        .collect();
    for (category, _) in observations {
        means.entry(category.clone()).or_insert(0.0);
    }

    TargetEncoding::new(column, means)
}

pub fn load_target_encoding(
    store: &TargetEncodingStore,
    column: &str,
    allow_missing: bool,
) -> Result<TargetEncoding, EncodingError> {
    match store.load(column)? {
        Some(encoding) => Ok(encoding),
        None if allow_missing => {
            warn!(
                component = "encoding",
                event = "encoding.missing.zero_filled",
                column,
                path = %store.path_for(column).display()
            );
            Ok(TargetEncoding::new(column, BTreeMap::new()))
        }
        None => Err(EncodingError::MissingEncoding {
            column: column.to_string(),
            path: store.path_for(column),
        }),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetEncodingStore {
    dir: PathBuf,
}

impl TargetEncodingStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, column: &str) -> PathBuf {
        self.dir.join(format!("{}.csv", encoded_column_name(column)))
    }

    pub fn save(&self, encoding: &TargetEncoding) -> Result<(), EncodingError> {
        let path = self.path_for(encoding.column());
        let csv_err = |source| EncodingError::Csv {
            path: path.clone(),
            source,
        };

        let mut writer = csv::Writer::from_writer(Vec::new());
        writer
            .write_record([encoding.column().to_string(), encoding.encoded_column()])
            .map_err(csv_err)?;
        for (category, mean) in encoding.means() {
            writer
                .write_record([category.clone(), mean.to_string()])
                .map_err(csv_err)?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|err| CacheError::Io(err.into_error()))?;
        write_atomic(&path, &bytes)?;

        info!(
            component = "encoding",
            event = "encoding.saved",
            column = encoding.column(),
            categories = encoding.means().len(),
            path = %path.display()
        );
        Ok(())
    }

    pub fn load(&self, column: &str) -> Result<Option<TargetEncoding>, EncodingError> {
        let path = self.path_for(column);
        if !path.exists() {
            return Ok(None);
        }
        read_encoding_file(&path, column).map(Some)
    }
}

fn read_encoding_file(path: &Path, column: &str) -> Result<TargetEncoding, EncodingError> {
    let csv_err = |source| EncodingError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(csv_err)?;

    let headers = reader.headers().map_err(csv_err)?.clone();
    let encoded = encoded_column_name(column);
    let position = |name: &str| {
        headers
            .iter()
            .position(|header| header.trim() == name)
            .ok_or_else(|| EncodingError::MissingColumn {
                path: path.to_path_buf(),
                column: name.to_string(),
            })
    };
    let category_idx = position(column)?;
    let value_idx = position(&encoded)?;

    let mut means = BTreeMap::new();
    for record in reader.records() {
        let record = record.map_err(csv_err)?;
        let category = record.get(category_idx).unwrap_or_default().to_string();
        let raw = record.get(value_idx).unwrap_or_default().trim();
        let value = if raw.is_empty() {
            0.0
        } else {
            raw.parse::<f64>().map_err(|_| EncodingError::InvalidValue {
                path: path.to_path_buf(),
                value: raw.to_string(),
            })?
        };
        means.entry(category).or_insert(value);
    }

    Ok(TargetEncoding::new(column, means))
}
