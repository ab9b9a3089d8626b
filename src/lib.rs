//! Transit delay training-set pipeline.
//!
//! Current implemented scope:
//! - windowed, sampled, cache-aware fetch of SIRI ride-stop observations
//! - feature construction with persisted train/test target encodings
//! - environment-driven configuration and structured logging

mod cache;
mod config;
mod encoding;
mod features;
mod fetcher;
mod holidays;
mod observability;
mod query;
mod reference;
mod windows;

pub use cache::{CacheError, RunIdentity, TableCache};
pub use config::{pipeline_config_from_env, ConfigError, PipelineConfig};
pub use encoding::{
    encoded_column_name, fit_target_encoding, load_target_encoding, EncodingError, EncodingMode,
    TargetEncoding, TargetEncodingStore,
};
pub use features::{
    write_feature_table, CategoricalColumn, FeatureBuilder, FeatureConfig, FeatureError,
    FeatureRow, ENCODED_COLUMNS, TARGET_COLUMN,
};
pub use fetcher::{sample_without_replacement, DataFetcher, FetchConfig, FetchError};
pub use holidays::{Holiday, HolidayCalendar, DEFAULT_HOLIDAY_PADDING_DAYS};
pub use observability::{
    init_logging, log_pipeline_finish, log_pipeline_start, logging_config_from_env, LogFormat,
    LoggingConfig, LoggingInitError,
};
pub use query::{
    GtfsRoute, HttpQueryClient, HttpQueryConfig, QueryError, RideQuery, RideStop, RideStopQuery,
    RouteQuery, SiriRide, TransitQueryClient,
};
pub use reference::{
    load_population_table, load_rain_table, load_reference_data, CityNameNormalizer,
    PopulationLookup, PopulationTable, PopulationTableConfig, RainTable, RainTableConfig,
    ReferenceConfig, ReferenceData, ReferenceError,
};
pub use windows::{
    format_window_bound, parse_window_bound, plan_time_windows, TimeWindow, TimestampError,
};
