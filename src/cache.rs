//! CSV-backed table cache keyed by run identity and table name.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use csv::StringRecord;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunIdentity(String);

impl RunIdentity {
    pub fn new(name: &str, start: &str, end: &str) -> Self {
        Self(format!("{name}_{start}_{end}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("invalid cache path: {0}")]
    InvalidPath(PathBuf),
}

#[derive(Debug, Clone)]
pub struct TableCache {
    root: PathBuf,
    run_id: RunIdentity,
}

impl TableCache {
    pub fn new(root: impl Into<PathBuf>, run_id: RunIdentity) -> Self {
        Self {
            root: root.into(),
            run_id,
        }
    }

    pub fn run_id(&self) -> &RunIdentity {
        &self.run_id
    }

    pub fn key(&self, table_name: &str) -> String {
        format!("{}_{table_name}", self.run_id.as_str())
    }

    pub fn path_for(&self, table_name: &str) -> PathBuf {
        self.root.join(format!("{}.csv", self.key(table_name)))
    }

    // An existing but unreadable file is an error, not a miss.
    pub fn read<T: DeserializeOwned>(&self, table_name: &str) -> Result<Option<Vec<T>>, CacheError> {
        let path = self.path_for(table_name);
        if !path.exists() {
            debug!(
                component = "cache",
                event = "cache.miss",
                table = table_name,
                path = %path.display()
            );
            return Ok(None);
        }

        let rows = read_csv_rows(&path)?;
        debug!(
            component = "cache",
            event = "cache.hit",
            table = table_name,
            rows = rows.len()
        );
        Ok(Some(rows))
    }

    pub fn write<T: Serialize>(&self, table_name: &str, rows: &[T]) -> Result<(), CacheError> {
        let path = self.path_for(table_name);
        write_csv_rows(&path, rows)?;
        debug!(
            component = "cache",
            event = "cache.write",
            table = table_name,
            rows = rows.len(),
            path = %path.display()
        );
        Ok(())
    }
}

pub(crate) fn read_csv_rows<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, CacheError> {
    let csv_err = |source| CacheError::Csv {
        path: path.to_path_buf(),
        source,
    };

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(csv_err)?;

    let headers = reader.headers().map_err(csv_err)?.clone();
    let keep: Vec<usize> = headers
        .iter()
        .enumerate()
        .filter(|(_, name)| !is_index_column(name))
        .map(|(idx, _)| idx)
        .collect();
    let kept_headers: StringRecord = keep.iter().filter_map(|idx| headers.get(*idx)).collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(csv_err)?;
        let kept: StringRecord = keep.iter().filter_map(|idx| record.get(*idx)).collect();
        rows.push(kept.deserialize(Some(&kept_headers)).map_err(csv_err)?);
    }

    Ok(rows)
}

pub(crate) fn write_csv_rows<T: Serialize>(path: &Path, rows: &[T]) -> Result<(), CacheError> {
    let csv_err = |source| CacheError::Csv {
        path: path.to_path_buf(),
        source,
    };

    let mut writer = csv::Writer::from_writer(Vec::new());
    for row in rows {
        writer.serialize(row).map_err(csv_err)?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|err| CacheError::Io(err.into_error()))?;

    write_atomic(path, &bytes)
}

fn is_index_column(name: &str) -> bool {
    let trimmed = name.trim();
    trimmed.is_empty() || trimmed.starts_with("Unnamed")
}

pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| CacheError::InvalidPath(path.to_path_buf()))?;
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));

    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    fs::rename(tmp_path, path)?;
    Ok(())
}
