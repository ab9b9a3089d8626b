//! Windowed, sampled, cache-aware fetch of SIRI ride-stop observations.

use std::collections::HashSet;
use std::hash::Hash;
use std::path::PathBuf;

use chrono::{DateTime, FixedOffset};
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tracing::{info, warn};

use crate::cache::{CacheError, RunIdentity, TableCache};
use crate::query::{
    GtfsRoute, QueryError, RideQuery, RideStop, RideStopQuery, RouteQuery, SiriRide,
    TransitQueryClient,
};
use crate::windows::{format_window_bound, plan_time_windows, TimeWindow};

const FINAL_TABLE: &str = "final_data";
const LINES_TABLE: &str = "lines_data";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchConfig {
    pub name: String,
    pub lines: Vec<String>,
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
    pub cache_dir: PathBuf,
    pub hop_days: u32,
    pub lines_sampled_per_hop: usize,
    pub routes_per_line_limit: usize,
    pub rides_sampled_per_hop: usize,
    pub max_rides_per_window: usize,
    pub max_ride_stops_per_window: usize,
    pub seed: Option<u64>,
}

impl FetchConfig {
    pub fn new(
        name: impl Into<String>,
        lines: Vec<String>,
        start: DateTime<FixedOffset>,
        end: DateTime<FixedOffset>,
    ) -> Self {
        Self {
            name: name.into(),
            lines,
            start,
            end,
            cache_dir: PathBuf::from("data"),
            hop_days: 1,
            lines_sampled_per_hop: 5,
            routes_per_line_limit: 5,
            rides_sampled_per_hop: 100,
            max_rides_per_window: 10_000,
            max_ride_stops_per_window: 100_000,
            seed: None,
        }
    }

    pub fn run_id(&self) -> RunIdentity {
        RunIdentity::new(
            &self.name,
            &format_window_bound(&self.start),
            &format_window_bound(&self.end),
        )
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid fetch config: {0}")]
    InvalidConfig(String),
    #[error("cannot sample {requested} distinct items from a population of {available}")]
    InsufficientPopulation { requested: usize, available: usize },
    #[error("no routes found for any of the configured lines: {0:?}")]
    UnresolvedLines(Vec<String>),
    #[error("remote query failed: {0}")]
    Query(#[from] QueryError),
    #[error("table cache error: {0}")]
    Cache(#[from] CacheError),
}

pub struct DataFetcher<C> {
    client: C,
    cache: TableCache,
    cfg: FetchConfig,
    rng: StdRng,
}

impl<C: TransitQueryClient> DataFetcher<C> {
    pub fn new(client: C, cfg: FetchConfig) -> Result<Self, FetchError> {
        validate_config(&cfg)?;
        let cache = TableCache::new(cfg.cache_dir.clone(), cfg.run_id());
        let rng = match cfg.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        Ok(Self {
            client,
            cache,
            cfg,
            rng,
        })
    }

    pub fn run_id(&self) -> &RunIdentity {
        self.cache.run_id()
    }

    pub fn cache(&self) -> &TableCache {
        &self.cache
    }

    pub fn fetch(&mut self) -> Result<Vec<RideStop>, FetchError> {
        if let Some(cached) = self.cache.read::<RideStop>(FINAL_TABLE)? {
            info!(
                component = "fetcher",
                event = "fetch.cache.hit",
                run_id = self.run_id().as_str(),
                rows = cached.len()
            );
            return Ok(cached);
        }

        let windows = plan_time_windows(self.cfg.start, self.cfg.end, self.cfg.hop_days);
        info!(
            component = "fetcher",
            event = "fetch.start",
            run_id = self.run_id().as_str(),
            lines = ?self.cfg.lines,
            window_count = windows.len(),
            hop_days = self.cfg.hop_days
        );

        let routes = self.resolve_routes()?;
        let line_refs = ordered_unique(routes.iter().map(|route| route.line_ref));

        let mut per_window = Vec::with_capacity(windows.len());
        for window in &windows {
            per_window.push(self.fetch_window(window, &line_refs)?);
        }
        let rows: Vec<RideStop> = per_window.into_iter().flatten().collect();

        self.cache.write(FINAL_TABLE, &rows)?;
        info!(
            component = "fetcher",
            event = "fetch.finish",
            run_id = self.run_id().as_str(),
            rows = rows.len()
        );

        Ok(rows)
    }

    fn resolve_routes(&self) -> Result<Vec<GtfsRoute>, FetchError> {
        if let Some(cached) = self.cache.read::<GtfsRoute>(LINES_TABLE)? {
            return Ok(cached);
        }

        let mut routes = Vec::new();
        let mut unresolved = Vec::new();
        for line in &self.cfg.lines {
            let query = RouteQuery {
                route_short_name: line.clone(),
            };
            let mut found = self
                .client
                .list_routes(&query, self.cfg.routes_per_line_limit)?;
            if found.is_empty() {
                warn!(
                    component = "fetcher",
                    event = "fetch.lines.unresolved",
                    line = line.as_str()
                );
                unresolved.push(line.clone());
            }
            routes.append(&mut found);
        }

        if routes.is_empty() {
            return Err(FetchError::UnresolvedLines(unresolved));
        }

        info!(
            component = "fetcher",
            event = "fetch.lines.resolved",
            lines = self.cfg.lines.len(),
            routes = routes.len(),
            unresolved = unresolved.len()
        );
        self.cache.write(LINES_TABLE, &routes)?;
        Ok(routes)
    }

    fn fetch_window(
        &mut self,
        window: &TimeWindow,
        line_refs: &[i64],
    ) -> Result<Vec<RideStop>, FetchError> {
        let sampled_line_refs =
            sample_without_replacement(line_refs, self.cfg.lines_sampled_per_hop, &mut self.rng)?;
        info!(
            component = "fetcher",
            event = "fetch.window.start",
            window_start = %format_window_bound(&window.start),
            window_end = %format_window_bound(&window.end),
            sampled_line_refs = ?sampled_line_refs
        );

        let rides = self.read_rides(window, sampled_line_refs)?;
        if rides.is_empty() {
            info!(
                component = "fetcher",
                event = "fetch.window.empty",
                window_start = %format_window_bound(&window.start)
            );
            return Ok(Vec::new());
        }

        let ride_ids = ordered_unique(rides.iter().map(|ride| ride.id));
        let stops = self.read_ride_stops(window, ride_ids)?;
        info!(
            component = "fetcher",
            event = "fetch.window.finish",
            window_start = %format_window_bound(&window.start),
            rides = rides.len(),
            ride_stops = stops.len()
        );

        Ok(stops)
    }

    fn read_rides(
        &self,
        window: &TimeWindow,
        line_refs: Vec<i64>,
    ) -> Result<Vec<SiriRide>, FetchError> {
        let table = format!("siri_rides_{}", window.key_suffix());
        if let Some(cached) = self.cache.read::<SiriRide>(&table)? {
            return Ok(cached);
        }

        let query = RideQuery {
            start_time_from: window.start,
            start_time_to: window.end,
            line_refs,
        };
        let rides = self
            .client
            .list_rides(&query, self.cfg.max_rides_per_window)?;
        self.cache.write(&table, &rides)?;
        Ok(rides)
    }

    fn read_ride_stops(
        &mut self,
        window: &TimeWindow,
        ride_ids: Vec<i64>,
    ) -> Result<Vec<RideStop>, FetchError> {
        let table = format!("siri_ride_stops_{}", window.key_suffix());
        if let Some(cached) = self.cache.read::<RideStop>(&table)? {
            return Ok(cached);
        }

        let cap = self.cfg.rides_sampled_per_hop;
        let ride_ids = if ride_ids.len() > cap {
            info!(
                component = "fetcher",
                event = "fetch.window.rides_sampled",
                sampled = cap,
                available = ride_ids.len()
            );
            sample_without_replacement(&ride_ids, cap, &mut self.rng)?
        } else {
            ride_ids
        };

        let query = RideStopQuery {
            ride_ids,
            scheduled_start_time_from: window.start,
            scheduled_start_time_to: window.end,
        };
        let stops = self
            .client
            .list_ride_stops(&query, self.cfg.max_ride_stops_per_window)?;
        self.cache.write(&table, &stops)?;
        Ok(stops)
    }
}

pub fn sample_without_replacement<T, R>(
    population: &[T],
    amount: usize,
    rng: &mut R,
) -> Result<Vec<T>, FetchError>
where
    T: Clone,
    R: Rng + ?Sized,
{
    if amount > population.len() {
        return Err(FetchError::InsufficientPopulation {
            requested: amount,
            available: population.len(),
        });
    }

    Ok(population.choose_multiple(rng, amount).cloned().collect())
}

fn ordered_unique<T: Copy + Eq + Hash>(items: impl Iterator<Item = T>) -> Vec<T> {
    let mut seen = HashSet::new();
    items.filter(|item| seen.insert(*item)).collect()
}

fn validate_config(cfg: &FetchConfig) -> Result<(), FetchError> {
    if cfg.name.trim().is_empty() {
        return Err(FetchError::InvalidConfig(
            "dataset name must not be empty".to_string(),
        ));
    }
    if cfg.lines.is_empty() {
        return Err(FetchError::InvalidConfig(
            "at least one line name is required".to_string(),
        ));
    }
    if cfg.hop_days == 0 {
        return Err(FetchError::InvalidConfig(
            "hop_days must be >= 1".to_string(),
        ));
    }
    if cfg.lines_sampled_per_hop == 0 || cfg.rides_sampled_per_hop == 0 {
        return Err(FetchError::InvalidConfig(
            "sample sizes must be >= 1".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::windows::parse_window_bound;

    fn cfg() -> FetchConfig {
        FetchConfig::new(
            "dev",
            vec!["1".to_string()],
            parse_window_bound("2023-08-01T00:00:00+03:00").unwrap(),
            parse_window_bound("2023-08-03T00:00:00+03:00").unwrap(),
        )
    }

    #[test]
    fn sample_returns_exactly_requested_distinct_members() {
        let population: Vec<i64> = (0..20).collect();
        let mut rng = StdRng::seed_from_u64(7);

        for amount in [0, 1, 5, 20] {
            let sampled = sample_without_replacement(&population, amount, &mut rng).unwrap();
            assert_eq!(sampled.len(), amount);
            let distinct: HashSet<i64> = sampled.iter().copied().collect();
            assert_eq!(distinct.len(), amount);
            assert!(sampled.iter().all(|item| population.contains(item)));
        }
    }

    #[test]
    fn sample_larger_than_population_fails() {
        let mut rng = StdRng::seed_from_u64(7);
        let err = sample_without_replacement(&[1, 2, 3], 4, &mut rng).unwrap_err();
        assert!(matches!(
            err,
            FetchError::InsufficientPopulation {
                requested: 4,
                available: 3
            }
        ));
    }

    #[test]
    fn seeded_sampling_is_reproducible() {
        let population: Vec<i64> = (0..50).collect();
        let a = sample_without_replacement(&population, 5, &mut StdRng::seed_from_u64(1)).unwrap();
        let b = sample_without_replacement(&population, 5, &mut StdRng::seed_from_u64(1)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn ordered_unique_keeps_first_occurrence_order() {
        let out = ordered_unique([3, 1, 3, 2, 1].into_iter());
        assert_eq!(out, vec![3, 1, 2]);
    }

    #[test]
    fn run_id_uses_name_and_formatted_bounds() {
        assert_eq!(
            cfg().run_id().as_str(),
            "dev_2023-08-01T00:00:00+03:00_2023-08-03T00:00:00+03:00"
        );
    }

    #[test]
    fn config_validation_rejects_zero_hop_and_empty_lines() {
        let mut bad = cfg();
        bad.hop_days = 0;
        assert!(matches!(
            validate_config(&bad),
            Err(FetchError::InvalidConfig(_))
        ));

        let mut bad = cfg();
        bad.lines.clear();
        assert!(matches!(
            validate_config(&bad),
            Err(FetchError::InvalidConfig(_))
        ));

        assert!(validate_config(&cfg()).is_ok());
    }
}
