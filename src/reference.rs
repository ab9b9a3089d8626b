//! Read-only reference tables: rainfall readings by date and population by city.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, info};

const HEBREW_STRIP_PATTERN: &str = "[^א-ת]";

#[derive(Debug, Error)]
pub enum ReferenceError {
    #[error("reference file not found: {0}")]
    MissingFile(PathBuf),
    #[error("CSV error in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("reference file {path} has no column {column}")]
    MissingColumn { path: PathBuf, column: String },
    #[error("reference file {path} has unparseable date '{value}'")]
    InvalidDate { path: PathBuf, value: String },
    #[error("invalid city normalization pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

#[derive(Debug, Clone)]
pub struct CityNameNormalizer {
    strip: Option<Regex>,
}

impl CityNameNormalizer {
    pub fn strip_matching(pattern: &str) -> Result<Self, ReferenceError> {
        Ok(Self {
            strip: Some(Regex::new(pattern)?),
        })
    }

    pub fn hebrew() -> Self {
        Self {
            strip: Some(Regex::new(HEBREW_STRIP_PATTERN).expect("valid Hebrew strip pattern")),
        }
    }

    pub fn identity() -> Self {
        Self { strip: None }
    }

    pub fn normalize(&self, raw: &str) -> String {
        match &self.strip {
            Some(pattern) => pattern.replace_all(raw, "").into_owned(),
            None => raw.to_string(),
        }
    }
}

impl Default for CityNameNormalizer {
    fn default() -> Self {
        Self::hebrew()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RainTableConfig {
    pub date_column: String,
    pub date_format: String,
}

impl Default for RainTableConfig {
    fn default() -> Self {
        Self {
            date_column: "תאריך".to_string(),
            date_format: "%d/%m/%Y".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PopulationTableConfig {
    pub city_column: usize,
    pub population_column: usize,
}

impl Default for PopulationTableConfig {
    fn default() -> Self {
        Self {
            city_column: 1,
            population_column: 7,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceConfig {
    pub rain_path: PathBuf,
    pub population_path: PathBuf,
    pub rain: RainTableConfig,
    pub population: PopulationTableConfig,
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        Self {
            rain_path: PathBuf::from("one_file_rain.csv"),
            population_path: PathBuf::from("population.csv"),
            rain: RainTableConfig::default(),
            population: PopulationTableConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RainTable {
    readings_per_day: HashMap<NaiveDate, usize>,
}

impl RainTable {
    pub fn from_dates(dates: impl IntoIterator<Item = NaiveDate>) -> Self {
        let mut readings_per_day = HashMap::new();
        for date in dates {
            *readings_per_day.entry(date).or_insert(0) += 1;
        }
        Self { readings_per_day }
    }

    pub fn readings_on(&self, date: NaiveDate) -> usize {
        self.readings_per_day.get(&date).copied().unwrap_or(0)
    }

    pub fn rain_exists(&self, date: NaiveDate) -> bool {
        self.readings_on(date) > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PopulationLookup {
    Found(u64),
    Unmatched,
    Unparseable(String),
}

// Keyed by normalized city name; the first row for a name wins.
#[derive(Debug, Clone, Default)]
pub struct PopulationTable {
    raw_by_city: HashMap<String, String>,
    normalizer: CityNameNormalizer,
}

impl PopulationTable {
    pub fn from_rows<'a>(
        rows: impl IntoIterator<Item = (&'a str, &'a str)>,
        normalizer: CityNameNormalizer,
    ) -> Self {
        let mut raw_by_city = HashMap::new();
        for (city, population) in rows {
            raw_by_city
                .entry(normalizer.normalize(city))
                .or_insert_with(|| population.to_string());
        }
        Self {
            raw_by_city,
            normalizer,
        }
    }

    pub fn normalize(&self, city: &str) -> String {
        self.normalizer.normalize(city)
    }

    pub fn lookup(&self, city: &str) -> PopulationLookup {
        let Some(raw) = self.raw_by_city.get(&self.normalize(city)) else {
            return PopulationLookup::Unmatched;
        };
        match raw.trim().replace(',', "").parse::<u64>() {
            Ok(value) => PopulationLookup::Found(value),
            Err(_) => PopulationLookup::Unparseable(raw.clone()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReferenceData {
    pub rain: RainTable,
    pub population: PopulationTable,
}

pub fn load_reference_data(
    cfg: &ReferenceConfig,
    normalizer: CityNameNormalizer,
) -> Result<ReferenceData, ReferenceError> {
    let rain = load_rain_table(&cfg.rain_path, &cfg.rain)?;
    let population = load_population_table(&cfg.population_path, cfg.population, normalizer)?;
    Ok(ReferenceData { rain, population })
}

pub fn load_rain_table(path: &Path, cfg: &RainTableConfig) -> Result<RainTable, ReferenceError> {
    let mut reader = open_reader(path)?;
    let csv_err = |source| ReferenceError::Csv {
        path: path.to_path_buf(),
        source,
    };

    let headers = reader.headers().map_err(csv_err)?.clone();
    let date_idx = headers
        .iter()
        .position(|name| name.trim() == cfg.date_column)
        .ok_or_else(|| ReferenceError::MissingColumn {
            path: path.to_path_buf(),
            column: cfg.date_column.clone(),
        })?;

    let mut dates = Vec::new();
    for record in reader.records() {
        let record = record.map_err(csv_err)?;
        let raw = record.get(date_idx).unwrap_or_default().trim();
        if raw.is_empty() {
            continue;
        }
        let date = NaiveDate::parse_from_str(raw, &cfg.date_format).map_err(|_| {
            ReferenceError::InvalidDate {
                path: path.to_path_buf(),
                value: raw.to_string(),
            }
        })?;
        dates.push(date);
    }

    info!(
        component = "reference",
        event = "reference.rain.loaded",
        path = %path.display(),
        readings = dates.len()
    );
    Ok(RainTable::from_dates(dates))
}

pub fn load_population_table(
    path: &Path,
    cfg: PopulationTableConfig,
    normalizer: CityNameNormalizer,
) -> Result<PopulationTable, ReferenceError> {
    let mut reader = open_reader(path)?;
    let csv_err = |source| ReferenceError::Csv {
        path: path.to_path_buf(),
        source,
    };

    let headers = reader.headers().map_err(csv_err)?.clone();
    for idx in [cfg.city_column, cfg.population_column] {
        if idx >= headers.len() {
            return Err(ReferenceError::MissingColumn {
                path: path.to_path_buf(),
                column: format!("#{idx}"),
            });
        }
    }

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(csv_err)?;
        match (record.get(cfg.city_column), record.get(cfg.population_column)) {
            (Some(city), Some(population)) => rows.push((city.to_string(), population.to_string())),
            _ => debug!(
                component = "reference",
                event = "reference.population.short_row",
                fields = record.len()
            ),
        }
    }

    info!(
        component = "reference",
        event = "reference.population.loaded",
        path = %path.display(),
        rows = rows.len()
    );
    Ok(PopulationTable::from_rows(
        rows.iter().map(|(city, population)| (city.as_str(), population.as_str())),
        normalizer,
    ))
}

fn open_reader(path: &Path) -> Result<csv::Reader<std::fs::File>, ReferenceError> {
    if !path.exists() {
        return Err(ReferenceError::MissingFile(path.to_path_buf()));
    }
    csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .map_err(|source| ReferenceError::Csv {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn hebrew_normalizer_strips_everything_else() {
        let normalizer = CityNameNormalizer::hebrew();
        assert_eq!(normalizer.normalize("תל אביב - יפו"), "תלאביביפו");
        assert_eq!(normalizer.normalize("Haifa 2"), "");
        assert_eq!(CityNameNormalizer::identity().normalize("a b"), "a b");
    }

    #[test]
    fn custom_pattern_normalizer() {
        let normalizer = CityNameNormalizer::strip_matching("[^a-z]").unwrap();
        assert_eq!(normalizer.normalize("New-York 1"), "ework");
        assert!(CityNameNormalizer::strip_matching("[").is_err());
    }

    #[test]
    fn rain_table_counts_readings_per_day() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("rain.csv");
        fs::write(
            &path,
            "station,תאריך,mm\nA,01/08/2023,1.2\nB,01/08/2023,0.4\nA,03/08/2023,2\n,,\n",
        )
        .unwrap();

        let table = load_rain_table(&path, &RainTableConfig::default()).unwrap();
        let day = |d| NaiveDate::from_ymd_opt(2023, 8, d).unwrap();
        assert_eq!(table.readings_on(day(1)), 2);
        assert!(table.rain_exists(day(3)));
        assert!(!table.rain_exists(day(2)));
    }

    #[test]
    fn rain_table_requires_date_column() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("rain.csv");
        fs::write(&path, "station,date\nA,01/08/2023\n").unwrap();

        let err = load_rain_table(&path, &RainTableConfig::default()).unwrap_err();
        assert!(matches!(err, ReferenceError::MissingColumn { .. }));
    }

    #[test]
    fn missing_reference_file_is_fatal() {
        let temp = tempdir().unwrap();
        let err = load_population_table(
            &temp.path().join("population.csv"),
            PopulationTableConfig::default(),
            CityNameNormalizer::hebrew(),
        )
        .unwrap_err();
        assert!(matches!(err, ReferenceError::MissingFile(_)));
    }

    #[test]
    fn population_lookup_handles_commas_and_bad_values() {
        let table = PopulationTable::from_rows(
            [
                ("חיפה ", "285,316"),
                ("נצרת", "n/a"),
                ("חיפה", "1"),
            ],
            CityNameNormalizer::hebrew(),
        );

        assert_eq!(table.lookup("חיפה"), PopulationLookup::Found(285_316));
        assert_eq!(
            table.lookup("נצרת"),
            PopulationLookup::Unparseable("n/a".to_string())
        );
        assert_eq!(table.lookup("אילת"), PopulationLookup::Unmatched);
    }

    #[test]
    fn population_table_reads_positional_columns() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("population.csv");
        fs::write(
            &path,
            "code,name,a,b,c,d,e,total\n4000,חיפה,,,,,,\"285,316\"\n70,אשדוד,,,,,,225939\nshort,row\n",
        )
        .unwrap();

        let table = load_population_table(
            &path,
            PopulationTableConfig::default(),
            CityNameNormalizer::hebrew(),
        )
        .unwrap();
        assert_eq!(table.lookup("חיפה"), PopulationLookup::Found(285_316));
        assert_eq!(table.lookup("אשדוד"), PopulationLookup::Found(225_939));
    }
}
