//! Remote transit-data queries: route catalog, SIRI rides and SIRI ride stops.

use chrono::{DateTime, FixedOffset};
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::windows::format_window_bound;

const STRIDE_API_BASE_URL: &str = "https://open-bus-stride-api.hasadna.org.il";
const ROUTES_ENDPOINT: &str = "/gtfs_routes/list";
const RIDES_ENDPOINT: &str = "/siri_rides/list";
const RIDE_STOPS_ENDPOINT: &str = "/siri_ride_stops/list";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GtfsRoute {
    pub id: i64,
    #[serde(default)]
    pub date: Option<String>,
    pub line_ref: i64,
    #[serde(default)]
    pub operator_ref: Option<i64>,
    #[serde(default)]
    pub route_short_name: Option<String>,
    #[serde(default)]
    pub route_long_name: Option<String>,
    #[serde(default)]
    pub agency_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiriRide {
    pub id: i64,
    #[serde(default)]
    pub siri_route_id: Option<i64>,
    #[serde(default)]
    pub journey_ref: Option<String>,
    #[serde(default)]
    pub scheduled_start_time: Option<DateTime<FixedOffset>>,
    #[serde(default)]
    pub gtfs_ride_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RideStop {
    pub id: i64,
    pub siri_ride_id: i64,
    #[serde(default)]
    pub siri_stop_id: Option<i64>,
    #[serde(rename = "gtfs_ride_stop__stop_sequence")]
    pub stop_sequence: u32,
    #[serde(rename = "gtfs_stop__city", default, deserialize_with = "null_as_empty")]
    pub city: String,
    #[serde(rename = "gtfs_stop__code", default)]
    pub stop_code: Option<i64>,
    #[serde(rename = "gtfs_route__operator_ref", default)]
    pub operator_ref: Option<i64>,
    #[serde(rename = "gtfs_route__line_ref", default)]
    pub line_ref: Option<i64>,
    #[serde(rename = "gtfs_route__route_short_name", default)]
    pub route_short_name: Option<String>,
    #[serde(rename = "gtfs_ride__gtfs_route_id", default)]
    pub route_id: Option<i64>,
    #[serde(rename = "gtfs_ride_stop__arrival_time", default)]
    pub scheduled_arrival: Option<DateTime<FixedOffset>>,
    #[serde(rename = "nearest_siri_vehicle_location__recorded_at_time", default)]
    pub observed_at: Option<DateTime<FixedOffset>>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(Option::unwrap_or_default)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteQuery {
    pub route_short_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RideQuery {
    pub start_time_from: DateTime<FixedOffset>,
    pub start_time_to: DateTime<FixedOffset>,
    pub line_refs: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RideStopQuery {
    pub ride_ids: Vec<i64>,
    pub scheduled_start_time_from: DateTime<FixedOffset>,
    pub scheduled_start_time_to: DateTime<FixedOffset>,
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("HTTP client build error: {0}")]
    HttpClientBuild(String),
    #[error("HTTP request failed for {url}: {message}")]
    HttpRequest { url: String, message: String },
    #[error("invalid URL for endpoint {endpoint}: {message}")]
    InvalidUrl { endpoint: String, message: String },
    #[error("failed to decode response from {url}: {message}")]
    Decode { url: String, message: String },
    #[error("remote query failed: {0}")]
    Remote(String),
}

pub trait TransitQueryClient {
    fn list_routes(&self, query: &RouteQuery, limit: usize) -> Result<Vec<GtfsRoute>, QueryError>;

    fn list_rides(&self, query: &RideQuery, limit: usize) -> Result<Vec<SiriRide>, QueryError>;

    fn list_ride_stops(
        &self,
        query: &RideStopQuery,
        limit: usize,
    ) -> Result<Vec<RideStop>, QueryError>;
}

impl<T: TransitQueryClient + ?Sized> TransitQueryClient for &T {
    fn list_routes(&self, query: &RouteQuery, limit: usize) -> Result<Vec<GtfsRoute>, QueryError> {
        (**self).list_routes(query, limit)
    }

    fn list_rides(&self, query: &RideQuery, limit: usize) -> Result<Vec<SiriRide>, QueryError> {
        (**self).list_rides(query, limit)
    }

    fn list_ride_stops(
        &self,
        query: &RideStopQuery,
        limit: usize,
    ) -> Result<Vec<RideStop>, QueryError> {
        (**self).list_ride_stops(query, limit)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpQueryConfig {
    pub base_url: String,
    pub page_size: usize,
    pub http_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for HttpQueryConfig {
    fn default() -> Self {
        Self {
            base_url: STRIDE_API_BASE_URL.to_string(),
            page_size: 1_000,
            http_timeout_ms: 15_000,
            max_retries: 2,
            retry_backoff_ms: 200,
        }
    }
}

pub struct HttpQueryClient {
    client: reqwest::blocking::Client,
    cfg: HttpQueryConfig,
}

impl HttpQueryClient {
    pub fn new(cfg: HttpQueryConfig) -> Result<Self, QueryError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_millis(cfg.http_timeout_ms))
            .build()
            .map_err(|err| QueryError::HttpClientBuild(err.to_string()))?;
        Ok(Self { client, cfg })
    }

    fn iterate<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        params: &[(&str, String)],
        limit: usize,
    ) -> Result<Vec<T>, QueryError> {
        let page_size = self.cfg.page_size.max(1);
        let mut out: Vec<T> = Vec::new();

        while out.len() < limit {
            let this_page = page_size.min(limit - out.len());
            let url = page_url(&self.cfg.base_url, endpoint, params, this_page, out.len())?;
            let mut page: Vec<T> = retry(&self.cfg, || self.get_json(&url))?;
            let short_page = page.len() < this_page;
            page.truncate(this_page);
            out.append(&mut page);
            debug!(
                component = "query",
                event = "query.page",
                endpoint,
                offset = out.len(),
                short_page
            );
            if short_page {
                break;
            }
        }

        Ok(out)
    }

    fn get_json<T: DeserializeOwned>(&self, url: &Url) -> Result<Vec<T>, QueryError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .map_err(|err| QueryError::HttpRequest {
                url: url.to_string(),
                message: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(QueryError::HttpRequest {
                url: url.to_string(),
                message: format!("unexpected HTTP status {status}"),
            });
        }

        let bytes = response.bytes().map_err(|err| QueryError::HttpRequest {
            url: url.to_string(),
            message: err.to_string(),
        })?;
        serde_json::from_slice(&bytes).map_err(|err| QueryError::Decode {
            url: url.to_string(),
            message: err.to_string(),
        })
    }
}

impl TransitQueryClient for HttpQueryClient {
    fn list_routes(&self, query: &RouteQuery, limit: usize) -> Result<Vec<GtfsRoute>, QueryError> {
        self.iterate(ROUTES_ENDPOINT, &route_params(query), limit)
    }

    fn list_rides(&self, query: &RideQuery, limit: usize) -> Result<Vec<SiriRide>, QueryError> {
        self.iterate(RIDES_ENDPOINT, &ride_params(query), limit)
    }

    fn list_ride_stops(
        &self,
        query: &RideStopQuery,
        limit: usize,
    ) -> Result<Vec<RideStop>, QueryError> {
        self.iterate(RIDE_STOPS_ENDPOINT, &ride_stop_params(query), limit)
    }
}

fn route_params(query: &RouteQuery) -> Vec<(&'static str, String)> {
    vec![("route_short_name", query.route_short_name.clone())]
}

fn ride_params(query: &RideQuery) -> Vec<(&'static str, String)> {
    let from = format_window_bound(&query.start_time_from);
    let to = format_window_bound(&query.start_time_to);
    vec![
        ("gtfs_ride__start_time_from", from.clone()),
        ("scheduled_start_time_from", from),
        ("gtfs_ride__start_time_to", to.clone()),
        ("scheduled_start_time_to", to),
        ("gtfs_route__line_refs", join_ids(&query.line_refs)),
    ]
}

fn ride_stop_params(query: &RideStopQuery) -> Vec<(&'static str, String)> {
    vec![
        ("siri_ride_ids", join_ids(&query.ride_ids)),
        (
            "siri_ride__scheduled_start_time_from",
            format_window_bound(&query.scheduled_start_time_from),
        ),
        (
            "siri_ride__scheduled_start_time_to",
            format_window_bound(&query.scheduled_start_time_to),
        ),
    ]
}

fn join_ids(ids: &[i64]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn page_url(
    base_url: &str,
    endpoint: &str,
    params: &[(&str, String)],
    limit: usize,
    offset: usize,
) -> Result<Url, QueryError> {
    let mut all: Vec<(&str, String)> = params.to_vec();
    all.push(("limit", limit.to_string()));
    all.push(("offset", offset.to_string()));

    let raw = format!("{}{endpoint}", base_url.trim_end_matches('/'));
    Url::parse_with_params(&raw, &all).map_err(|err| QueryError::InvalidUrl {
        endpoint: endpoint.to_string(),
        message: err.to_string(),
    })
}

fn retry<T>(
    cfg: &HttpQueryConfig,
    mut f: impl FnMut() -> Result<T, QueryError>,
) -> Result<T, QueryError> {
    let mut attempt: u32 = 0;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= cfg.max_retries => return Err(err),
            Err(err) => {
                attempt = attempt.saturating_add(1);
                let shift = attempt.saturating_sub(1).min(10);
                let factor = 1u64 << shift;
                let sleep_ms = cfg.retry_backoff_ms.saturating_mul(factor);
                warn!(
                    component = "query",
                    event = "query.retry",
                    attempt,
                    sleep_ms,
                    error = %err
                );
                std::thread::sleep(std::time::Duration::from_millis(sleep_ms));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::windows::parse_window_bound;

    #[test]
    fn ride_params_repeat_window_for_gtfs_and_scheduled_start() {
        let query = RideQuery {
            start_time_from: parse_window_bound("2023-08-01T00:00:00+03:00").unwrap(),
            start_time_to: parse_window_bound("2023-08-02T00:00:00+03:00").unwrap(),
            line_refs: vec![7020, 7021],
        };

        let params = ride_params(&query);
        assert_eq!(
            params[0],
            (
                "gtfs_ride__start_time_from",
                "2023-08-01T00:00:00+03:00".to_string()
            )
        );
        assert_eq!(params[1].1, params[0].1);
        assert_eq!(params[2].1, "2023-08-02T00:00:00+03:00");
        assert_eq!(params[4], ("gtfs_route__line_refs", "7020,7021".to_string()));
    }

    #[test]
    fn page_url_appends_limit_and_offset() {
        let url = page_url(
            "https://example.org/",
            RIDE_STOPS_ENDPOINT,
            &[("siri_ride_ids", "1,2".to_string())],
            500,
            1_000,
        )
        .unwrap();

        assert_eq!(url.path(), "/siri_ride_stops/list");
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert!(pairs.contains(&("siri_ride_ids".to_string(), "1,2".to_string())));
        assert!(pairs.contains(&("limit".to_string(), "500".to_string())));
        assert!(pairs.contains(&("offset".to_string(), "1000".to_string())));
    }

    #[test]
    fn ride_stop_decodes_api_column_names() {
        let payload = r#"[{
            "id": 11,
            "siri_ride_id": 5,
            "siri_stop_id": 99,
            "gtfs_ride_stop__stop_sequence": 3,
            "gtfs_stop__city": "חיפה",
            "gtfs_route__operator_ref": 3,
            "gtfs_ride__gtfs_route_id": 42,
            "gtfs_ride_stop__arrival_time": "2023-08-01T05:00:00+00:00",
            "nearest_siri_vehicle_location__recorded_at_time": "2023-08-01T05:02:30+00:00",
            "unused_field": true
        }]"#;

        let rows: Vec<RideStop> = serde_json::from_str(payload).unwrap();
        assert_eq!(rows[0].stop_sequence, 3);
        assert_eq!(rows[0].city, "חיפה");
        assert_eq!(rows[0].route_id, Some(42));
        assert!(rows[0].line_ref.is_none());
        assert!(rows[0].observed_at.unwrap() > rows[0].scheduled_arrival.unwrap());
    }

    #[test]
    fn ride_stop_without_gtfs_match_still_decodes() {
        let payload = r#"[
            {"id": 1, "siri_ride_id": 5, "gtfs_ride_stop__stop_sequence": 1,
             "gtfs_stop__city": "חיפה", "gtfs_route__operator_ref": 3,
             "gtfs_ride__gtfs_route_id": 42},
            {"id": 2, "siri_ride_id": 6, "gtfs_ride_stop__stop_sequence": 2,
             "gtfs_stop__city": null, "gtfs_route__operator_ref": null,
             "gtfs_ride__gtfs_route_id": null,
             "gtfs_ride_stop__arrival_time": null}
        ]"#;

        let rows: Vec<RideStop> = serde_json::from_str(payload).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].operator_ref, Some(3));
        assert_eq!(rows[1].operator_ref, None);
        assert_eq!(rows[1].route_id, None);
        assert_eq!(rows[1].city, "");
        assert!(rows[1].scheduled_arrival.is_none());
    }

    #[test]
    fn retry_stops_after_max_retries() {
        let cfg = HttpQueryConfig {
            max_retries: 2,
            retry_backoff_ms: 0,
            ..HttpQueryConfig::default()
        };
        let mut calls = 0;
        let result: Result<(), QueryError> = retry(&cfg, || {
            calls += 1;
            Err(QueryError::Remote("down".to_string()))
        });

        assert!(result.is_err());
        assert_eq!(calls, 3);
    }
}
