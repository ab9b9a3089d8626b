//! Ride-stop observations to model features.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, FixedOffset, NaiveDateTime, Timelike};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::cache::{write_csv_rows, CacheError};
use crate::encoding::{EncodingError, EncodingMode, TargetEncoding, TargetEncodingStore};
use crate::holidays::HolidayCalendar;
use crate::query::RideStop;
use crate::reference::{PopulationLookup, ReferenceData};

pub const TARGET_COLUMN: &str = "scheduled_vs_real_time_difference_seconds";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CategoricalColumn {
    City,
    OperatorRef,
}

impl CategoricalColumn {
    pub fn name(self) -> &'static str {
        match self {
            Self::City => "gtfs_stop__city",
            Self::OperatorRef => "gtfs_route__operator_ref",
        }
    }

    fn category_of(self, stop: &RideStop) -> String {
        match self {
            Self::City => stop.city.clone(),
            Self::OperatorRef => stop
                .operator_ref
                .map(|operator| operator.to_string())
                .unwrap_or_default(),
        }
    }
}

pub const ENCODED_COLUMNS: [CategoricalColumn; 2] =
    [CategoricalColumn::City, CategoricalColumn::OperatorRef];

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureConfig {
    pub encodings_dir: PathBuf,
    // None keeps each timestamp's own offset.
    pub local_timezone: Option<Tz>,
    pub lag_window: Option<usize>,
    pub allow_missing_encoding: bool,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            encodings_dir: PathBuf::from("data"),
            local_timezone: None,
            lag_window: None,
            allow_missing_encoding: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub siri_ride_id: i64,
    #[serde(rename = "gtfs_ride__gtfs_route_id")]
    pub route_id: Option<i64>,
    #[serde(rename = "gtfs_stop__city")]
    pub city: String,
    #[serde(rename = "gtfs_route__operator_ref")]
    pub operator_ref: Option<i64>,
    #[serde(rename = "gtfs_ride_stop__arrival_time")]
    pub scheduled_arrival: DateTime<FixedOffset>,
    #[serde(rename = "nearest_siri_vehicle_location__recorded_at_time")]
    pub observed_at: DateTime<FixedOffset>,
    #[serde(rename = "scheduled_vs_real_time_difference_seconds")]
    pub delay_seconds: f64,
    pub is_holiday: bool,
    pub city_population: u64,
    pub rain_exists: bool,
    pub weekday: u32,
    pub hour_of_day: u32,
    pub max_stop_sequence: u32,
    pub stop_sequence_ratio: f64,
    pub stop_sequence: u32,
    #[serde(rename = "gtfs_stop__city_target_encoded")]
    pub city_target_encoded: f64,
    #[serde(rename = "gtfs_route__operator_ref_target_encoded")]
    pub operator_target_encoded: f64,
    pub amount_cities_in_route: usize,
    pub past_target_mean: Option<f64>,
}

#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("invalid mode '{0}': expected 'train' or 'test'")]
    InvalidMode(String),
    #[error("invalid feature config: {0}")]
    InvalidConfig(String),
    #[error("target encoding error: {0}")]
    Encoding(#[from] EncodingError),
    #[error("feature table write error: {0}")]
    Cache(#[from] CacheError),
}

#[derive(Debug, Clone)]
struct Observation<'r> {
    stop: &'r RideStop,
    scheduled: DateTime<FixedOffset>,
    observed: DateTime<FixedOffset>,
    local: NaiveDateTime,
    target: f64,
}

pub struct FeatureBuilder<'a> {
    mode: EncodingMode,
    cfg: FeatureConfig,
    reference: &'a ReferenceData,
    calendar: &'a HolidayCalendar,
    store: TargetEncodingStore,
}

impl<'a> FeatureBuilder<'a> {
    pub fn new(
        mode: &str,
        cfg: FeatureConfig,
        reference: &'a ReferenceData,
    ) -> Result<Self, FeatureError> {
        let mode = mode
            .parse::<EncodingMode>()
            .map_err(|_| FeatureError::InvalidMode(mode.to_string()))?;
        if cfg.lag_window == Some(0) {
            return Err(FeatureError::InvalidConfig(
                "lag_window must be >= 1 when enabled".to_string(),
            ));
        }

        let store = TargetEncodingStore::new(cfg.encodings_dir.clone());
        Ok(Self {
            mode,
            cfg,
            reference,
            calendar: HolidayCalendar::jewish_holidays(),
            store,
        })
    }

    pub fn with_calendar(mut self, calendar: &'a HolidayCalendar) -> Self {
        self.calendar = calendar;
        self
    }

    pub fn mode(&self) -> EncodingMode {
        self.mode
    }

    pub fn create_features(&self, rows: &[RideStop]) -> Result<Vec<FeatureRow>, FeatureError> {
        info!(
            component = "features",
            event = "features.start",
            mode = self.mode.as_str(),
            rows = rows.len(),
            lag_window = ?self.cfg.lag_window
        );

        // Route and ride aggregates see every stop, including ones dropped below.
        let max_sequences = max_stop_sequence_per_route(rows);
        let cities_per_ride = distinct_cities_per_ride(rows);

        let observations = self.observations(rows);
        let holidays = holiday_flags(&observations, self.calendar);
        let populations = self.city_populations(&observations);
        let rain = rain_flags(&observations, self.reference);
        let city_encoding = self.encoding_for(CategoricalColumn::City, &observations)?;
        let operator_encoding = self.encoding_for(CategoricalColumn::OperatorRef, &observations)?;
        let lagged = self
            .cfg
            .lag_window
            .map(|window| lagged_target_means(&observations, window));

        let mut out = Vec::with_capacity(observations.len());
        for (idx, obs) in observations.iter().enumerate() {
            let stop = obs.stop;
            let max_stop_sequence = max_sequences[&stop.route_id];

            out.push(FeatureRow {
                siri_ride_id: stop.siri_ride_id,
                route_id: stop.route_id,
                city: stop.city.clone(),
                operator_ref: stop.operator_ref,
                scheduled_arrival: obs.scheduled,
                observed_at: obs.observed,
                delay_seconds: obs.target,
                is_holiday: holidays[idx],
                city_population: populations[&stop.city],
                rain_exists: rain[idx],
                weekday: obs.local.weekday().num_days_from_monday(),
                hour_of_day: obs.local.hour(),
                max_stop_sequence,
                stop_sequence_ratio: stop_sequence_ratio(stop.stop_sequence, max_stop_sequence),
                stop_sequence: stop.stop_sequence,
                city_target_encoded: city_encoding.encode(&stop.city),
                operator_target_encoded: operator_encoding
                    .encode(&CategoricalColumn::OperatorRef.category_of(stop)),
                amount_cities_in_route: cities_per_ride[&stop.siri_ride_id],
                past_target_mean: lagged.as_ref().map(|values| values[idx]),
            });
        }

        info!(
            component = "features",
            event = "features.finish",
            mode = self.mode.as_str(),
            rows = out.len()
        );
        Ok(out)
    }

    fn observations<'r>(&self, rows: &'r [RideStop]) -> Vec<Observation<'r>> {
        let observations: Vec<Observation<'r>> = rows
            .iter()
            .filter_map(|stop| {
                let scheduled = stop.scheduled_arrival?;
                let observed = stop.observed_at?;
                let local = match self.cfg.local_timezone {
                    Some(tz) => observed.with_timezone(&tz).naive_local(),
                    None => observed.naive_local(),
                };
                let target = (observed - scheduled).num_milliseconds() as f64 / 1_000.0;
                Some(Observation {
                    stop,
                    scheduled,
                    observed,
                    local,
                    target,
                })
            })
            .collect();

        let dropped = rows.len() - observations.len();
        if dropped > 0 {
            warn!(
                component = "features",
                event = "features.rows_dropped",
                reason = "missing_timestamp",
                dropped
            );
        }
        observations
    }

    fn city_populations(&self, observations: &[Observation<'_>]) -> HashMap<String, u64> {
        let mut out = HashMap::new();
        for obs in observations {
            let city = &obs.stop.city;
            if out.contains_key(city) {
                continue;
            }
            let population = match self.reference.population.lookup(city) {
                PopulationLookup::Found(value) => value,
                PopulationLookup::Unmatched => {
                    warn!(
                        component = "features",
                        event = "features.population.unmatched",
                        city = city.as_str(),
                        normalized = %self.reference.population.normalize(city)
                    );
                    0
                }
                PopulationLookup::Unparseable(raw) => {
                    warn!(
                        component = "features",
                        event = "features.population.unparseable",
                        city = city.as_str(),
                        value = raw.as_str()
                    );
                    0
                }
            };
            out.insert(city.clone(), population);
        }
        out
    }

    fn encoding_for(
        &self,
        column: CategoricalColumn,
        observations: &[Observation<'_>],
    ) -> Result<TargetEncoding, FeatureError> {
        let pairs: Vec<(String, f64)> = match self.mode {
            EncodingMode::Train => observations
                .iter()
                .map(|obs| (column.category_of(obs.stop), obs.target))
                .collect(),
            EncodingMode::Test => Vec::new(),
        };
        Ok(self.mode.resolve(
            column.name(),
            &pairs,
            &self.store,
            self.cfg.allow_missing_encoding,
        )?)
    }
}

pub fn write_feature_table(path: &Path, rows: &[FeatureRow]) -> Result<(), FeatureError> {
    write_csv_rows(path, rows)?;
    info!(
        component = "features",
        event = "features.table.written",
        path = %path.display(),
        rows = rows.len()
    );
    Ok(())
}

fn holiday_flags(observations: &[Observation<'_>], calendar: &HolidayCalendar) -> Vec<bool> {
    observations
        .iter()
        .map(|obs| calendar.is_holiday(obs.local))
        .collect()
}

fn rain_flags(observations: &[Observation<'_>], reference: &ReferenceData) -> Vec<bool> {
    observations
        .iter()
        .map(|obs| reference.rain.rain_exists(obs.local.date()))
        .collect()
}

// Stops with no GTFS route share the `None` key.
fn max_stop_sequence_per_route(rows: &[RideStop]) -> HashMap<Option<i64>, u32> {
    let mut out: HashMap<Option<i64>, u32> = HashMap::new();
    for stop in rows {
        let entry = out.entry(stop.route_id).or_insert(0);
        *entry = (*entry).max(stop.stop_sequence);
    }
    out
}

fn stop_sequence_ratio(stop_sequence: u32, max_stop_sequence: u32) -> f64 {
    if max_stop_sequence == 0 {
        return 0.0;
    }
    let ratio = f64::from(stop_sequence) / f64::from(max_stop_sequence);
    (ratio * 100.0).round() / 100.0
}

fn distinct_cities_per_ride(rows: &[RideStop]) -> HashMap<i64, usize> {
    let mut cities: HashMap<i64, HashSet<&str>> = HashMap::new();
    for stop in rows {
        let entry = cities.entry(stop.siri_ride_id).or_default();
        if !stop.city.is_empty() {
            entry.insert(stop.city.as_str());
        }
    }
    cities
        .into_iter()
        .map(|(ride, set)| (ride, set.len()))
        .collect()
}

// Mean target of up to `window` earlier stops of the same ride, current stop
// excluded; 0 for a ride's first stop.
fn lagged_target_means(observations: &[Observation<'_>], window: usize) -> Vec<f64> {
    let mut by_ride: HashMap<i64, Vec<usize>> = HashMap::new();
    for (idx, obs) in observations.iter().enumerate() {
        by_ride.entry(obs.stop.siri_ride_id).or_default().push(idx);
    }

    let mut out = vec![0.0; observations.len()];
    for indices in by_ride.values_mut() {
        indices.sort_by_key(|idx| observations[*idx].stop.stop_sequence);
        for (pos, idx) in indices.iter().enumerate() {
            let previous = &indices[pos.saturating_sub(window)..pos];
            if previous.is_empty() {
                continue;
            }
            let sum: f64 = previous.iter().map(|prev| observations[*prev].target).sum();
            out[*idx] = sum / previous.len() as f64;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::{CityNameNormalizer, PopulationTable, RainTable};
    use chrono::NaiveDate;
    use tempfile::tempdir;

    fn stop(ride: i64, seq: u32, city: &str, operator: i64, route: i64, observed: &str) -> RideStop {
        let observed = DateTime::parse_from_rfc3339(observed).unwrap();
        RideStop {
            id: ride * 100 + i64::from(seq),
            siri_ride_id: ride,
            siri_stop_id: None,
            stop_sequence: seq,
            city: city.to_string(),
            stop_code: None,
            operator_ref: Some(operator),
            line_ref: None,
            route_short_name: None,
            route_id: Some(route),
            scheduled_arrival: Some(observed - chrono::Duration::seconds(i64::from(seq) * 10)),
            observed_at: Some(observed),
        }
    }

    fn reference() -> ReferenceData {
        ReferenceData {
            rain: RainTable::from_dates([NaiveDate::from_ymd_opt(2023, 8, 1).unwrap()]),
            population: PopulationTable::from_rows(
                [("חיפה", "285,316"), ("עכו", "???")],
                CityNameNormalizer::hebrew(),
            ),
        }
    }

    #[test]
    fn invalid_mode_fails_before_any_work() {
        let reference = reference();
        let err = FeatureBuilder::new("validation", FeatureConfig::default(), &reference)
            .err()
            .unwrap();
        assert!(matches!(err, FeatureError::InvalidMode(mode) if mode == "validation"));
    }

    #[test]
    fn zero_lag_window_is_rejected() {
        let reference = reference();
        let cfg = FeatureConfig {
            lag_window: Some(0),
            ..FeatureConfig::default()
        };
        assert!(matches!(
            FeatureBuilder::new("train", cfg, &reference),
            Err(FeatureError::InvalidConfig(_))
        ));
    }

    #[test]
    fn sequence_ratio_rounds_to_two_decimals() {
        assert_eq!(stop_sequence_ratio(1, 3), 0.33);
        assert_eq!(stop_sequence_ratio(2, 3), 0.67);
        assert_eq!(stop_sequence_ratio(3, 3), 1.0);
        assert_eq!(stop_sequence_ratio(0, 0), 0.0);
    }

    #[test]
    fn lag_excludes_current_stop_and_uses_stop_order() {
        let rows = vec![
            stop(1, 3, "חיפה", 3, 10, "2023-08-01T08:00:00+03:00"),
            stop(1, 1, "חיפה", 3, 10, "2023-08-01T08:00:00+03:00"),
            stop(1, 2, "חיפה", 3, 10, "2023-08-01T08:00:00+03:00"),
            stop(1, 4, "חיפה", 3, 10, "2023-08-01T08:00:00+03:00"),
        ];
        let reference = reference();
        let builder = FeatureBuilder::new("train", FeatureConfig::default(), &reference).unwrap();
        let observations = builder.observations(&rows);

        // targets are 10 * stop_sequence seconds
        let lagged = lagged_target_means(&observations, 2);
        assert_eq!(lagged[1], 0.0);
        assert_eq!(lagged[2], 10.0);
        assert_eq!(lagged[0], 15.0);
        assert_eq!(lagged[3], 25.0);
    }

    #[test]
    fn builds_every_feature_in_train_mode() {
        let temp = tempdir().unwrap();
        let reference = reference();
        let cfg = FeatureConfig {
            encodings_dir: temp.path().to_path_buf(),
            lag_window: Some(3),
            ..FeatureConfig::default()
        };
        let builder = FeatureBuilder::new("train", cfg, &reference).unwrap();

        let rows = vec![
            stop(1, 1, "חיפה", 3, 10, "2023-08-01T08:15:00+03:00"),
            stop(1, 2, "עכו", 3, 10, "2023-08-01T08:45:00+03:00"),
            stop(2, 4, "נהריה", 5, 10, "2023-08-02T23:10:00+03:00"),
        ];
        let features = builder.create_features(&rows).unwrap();

        assert_eq!(features.len(), 3);
        let first = &features[0];
        assert_eq!(first.delay_seconds, 10.0);
        assert!(!first.is_holiday);
        assert_eq!(first.city_population, 285_316);
        assert!(first.rain_exists);
        assert_eq!(first.weekday, 1);
        assert_eq!(first.hour_of_day, 8);
        assert_eq!(first.max_stop_sequence, 4);
        assert_eq!(first.stop_sequence_ratio, 0.25);
        assert_eq!(first.amount_cities_in_route, 2);
        assert_eq!(first.past_target_mean, Some(0.0));
        assert_eq!(first.city_target_encoded, 10.0);
        assert_eq!(first.operator_target_encoded, 15.0);

        assert_eq!(features[1].city_population, 0);
        assert_eq!(features[1].past_target_mean, Some(10.0));
        assert_eq!(features[2].city_population, 0);
        assert!(!features[2].rain_exists);
        assert_eq!(features[2].hour_of_day, 23);
        assert_eq!(features[2].operator_target_encoded, 40.0);
        assert_eq!(features[2].amount_cities_in_route, 1);

        assert!(temp.path().join("gtfs_stop__city_target_encoded.csv").exists());
        assert!(temp
            .path()
            .join("gtfs_route__operator_ref_target_encoded.csv")
            .exists());
    }

    #[test]
    fn local_timezone_shifts_calendar_features() {
        let reference = reference();
        let temp = tempdir().unwrap();
        let cfg = FeatureConfig {
            encodings_dir: temp.path().to_path_buf(),
            local_timezone: Some(chrono_tz::Asia::Jerusalem),
            ..FeatureConfig::default()
        };
        let builder = FeatureBuilder::new("train", cfg, &reference).unwrap();
        let rows = vec![stop(1, 1, "חיפה", 3, 10, "2023-08-01T22:30:00+00:00")];

        let features = builder.create_features(&rows).unwrap();
        // 22:30 UTC is 01:30 the next day in Israel summer time.
        assert_eq!(features[0].hour_of_day, 1);
        assert_eq!(features[0].weekday, 2);
        assert!(!features[0].rain_exists);
    }

    #[test]
    fn rows_without_timestamps_are_dropped() {
        let reference = reference();
        let temp = tempdir().unwrap();
        let cfg = FeatureConfig {
            encodings_dir: temp.path().to_path_buf(),
            ..FeatureConfig::default()
        };
        let builder = FeatureBuilder::new("train", cfg, &reference).unwrap();
        let mut missing = stop(1, 2, "חיפה", 3, 10, "2023-08-01T08:00:00+03:00");
        missing.observed_at = None;
        let rows = vec![stop(1, 1, "חיפה", 3, 10, "2023-08-01T08:00:00+03:00"), missing];

        let features = builder.create_features(&rows).unwrap();
        assert_eq!(features.len(), 1);
        assert_eq!(features[0].stop_sequence, 1);
        assert_eq!(features[0].past_target_mean, None);
    }

    #[test]
    fn route_and_ride_aggregates_include_unobserved_stops() {
        let reference = reference();
        let temp = tempdir().unwrap();
        let cfg = FeatureConfig {
            encodings_dir: temp.path().to_path_buf(),
            ..FeatureConfig::default()
        };
        let builder = FeatureBuilder::new("train", cfg, &reference).unwrap();
        let mut last = stop(1, 3, "עכו", 3, 10, "2023-08-01T08:20:00+03:00");
        last.observed_at = None;
        let rows = vec![
            stop(1, 1, "חיפה", 3, 10, "2023-08-01T08:00:00+03:00"),
            stop(1, 2, "חיפה", 3, 10, "2023-08-01T08:10:00+03:00"),
            last,
        ];

        let features = builder.create_features(&rows).unwrap();
        assert_eq!(features.len(), 2);
        assert!(features.iter().all(|row| row.max_stop_sequence == 3));
        assert_eq!(features[1].stop_sequence_ratio, 0.67);
        assert!(features.iter().all(|row| row.amount_cities_in_route == 2));
    }

    #[test]
    fn stops_without_gtfs_route_form_their_own_group() {
        let reference = reference();
        let temp = tempdir().unwrap();
        let cfg = FeatureConfig {
            encodings_dir: temp.path().to_path_buf(),
            ..FeatureConfig::default()
        };
        let builder = FeatureBuilder::new("train", cfg, &reference).unwrap();
        let mut unmatched = stop(2, 2, "", 0, 0, "2023-08-01T09:00:00+03:00");
        unmatched.operator_ref = None;
        unmatched.route_id = None;
        let rows = vec![
            stop(1, 5, "חיפה", 3, 10, "2023-08-01T08:00:00+03:00"),
            unmatched,
        ];

        let features = builder.create_features(&rows).unwrap();
        assert_eq!(features[0].max_stop_sequence, 5);
        assert_eq!(features[1].max_stop_sequence, 2);
        assert_eq!(features[1].stop_sequence_ratio, 1.0);
        assert_eq!(features[1].operator_ref, None);
        assert_eq!(features[1].operator_target_encoded, 20.0);
        assert_eq!(features[0].operator_target_encoded, 50.0);
        assert_eq!(features[1].amount_cities_in_route, 0);
    }
}
