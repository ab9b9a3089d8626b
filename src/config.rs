//! Environment-driven configuration for the `transit_features` binary.

use std::env;
use std::path::PathBuf;

use chrono_tz::Tz;
use thiserror::Error;

use crate::features::FeatureConfig;
use crate::fetcher::FetchConfig;
use crate::observability::parse_bool;
use crate::query::HttpQueryConfig;
use crate::reference::ReferenceConfig;
use crate::windows::parse_window_bound;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value '{value}' for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub fetch: FetchConfig,
    pub http: HttpQueryConfig,
    pub reference: ReferenceConfig,
    pub features: FeatureConfig,
    pub mode: String,
    pub output_path: PathBuf,
}

pub fn pipeline_config_from_env() -> Result<PipelineConfig, ConfigError> {
    let name = required("TRANSIT_DATASET_NAME")?;
    let lines: Vec<String> = required("TRANSIT_LINES")?
        .split(',')
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();
    let start = parse_bound("TRANSIT_START")?;
    let end = parse_bound("TRANSIT_END")?;
    let mode = required("TRANSIT_MODE")?;

    let mut fetch = FetchConfig::new(name, lines, start, end);
    if let Some(cache_dir) = optional("TRANSIT_CACHE_DIR") {
        fetch.cache_dir = PathBuf::from(cache_dir);
    }
    if let Some(hop_days) = parsed::<u32>("TRANSIT_HOP_DAYS")? {
        fetch.hop_days = hop_days;
    }
    fetch.seed = parsed::<u64>("TRANSIT_SEED")?;

    let mut http = HttpQueryConfig::default();
    if let Some(base_url) = optional("TRANSIT_API_BASE_URL") {
        http.base_url = base_url;
    }

    let mut reference = ReferenceConfig::default();
    if let Some(path) = optional("TRANSIT_RAIN_PATH") {
        reference.rain_path = PathBuf::from(path);
    }
    if let Some(path) = optional("TRANSIT_POPULATION_PATH") {
        reference.population_path = PathBuf::from(path);
    }

    let features = FeatureConfig {
        encodings_dir: fetch.cache_dir.clone(),
        local_timezone: parse_timezone("TRANSIT_LOCAL_TZ")?,
        lag_window: parsed::<usize>("TRANSIT_LAG_WINDOW")?,
        allow_missing_encoding: parse_flag("TRANSIT_ALLOW_MISSING_ENCODING")?.unwrap_or(false),
    };

    let output_path = match optional("TRANSIT_OUTPUT_PATH") {
        Some(path) => PathBuf::from(path),
        None => fetch
            .cache_dir
            .join(format!("{}_{mode}_features.csv", fetch.run_id().as_str())),
    };

    Ok(PipelineConfig {
        fetch,
        http,
        reference,
        features,
        mode,
        output_path,
    })
}

fn optional(var: &'static str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}

fn required(var: &'static str) -> Result<String, ConfigError> {
    optional(var).ok_or(ConfigError::Missing(var))
}

fn parsed<T>(var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    optional(var)
        .map(|raw| {
            raw.parse::<T>().map_err(|err| ConfigError::Invalid {
                var,
                value: raw.clone(),
                reason: err.to_string(),
            })
        })
        .transpose()
}

fn parse_bound(var: &'static str) -> Result<chrono::DateTime<chrono::FixedOffset>, ConfigError> {
    let raw = required(var)?;
    parse_window_bound(&raw).map_err(|err| ConfigError::Invalid {
        var,
        value: raw.clone(),
        reason: err.to_string(),
    })
}

fn parse_timezone(var: &'static str) -> Result<Option<Tz>, ConfigError> {
    optional(var)
        .map(|raw| {
            raw.parse::<Tz>().map_err(|err| ConfigError::Invalid {
                var,
                value: raw.clone(),
                reason: err.to_string(),
            })
        })
        .transpose()
}

fn parse_flag(var: &'static str) -> Result<Option<bool>, ConfigError> {
    optional(var)
        .map(|raw| {
            parse_bool(&raw).ok_or_else(|| ConfigError::Invalid {
                var,
                value: raw.clone(),
                reason: "expected a boolean".to_string(),
            })
        })
        .transpose()
}
