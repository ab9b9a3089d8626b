//! Fixed-hop time window planning for fetch runs.

use chrono::{DateTime, Duration as ChronoDuration, FixedOffset};
use thiserror::Error;

const WINDOW_BOUND_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%:z";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeWindow {
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
}

impl TimeWindow {
    pub fn key_suffix(&self) -> String {
        format!(
            "{}_{}",
            format_window_bound(&self.start),
            format_window_bound(&self.end)
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimestampError {
    #[error("invalid timestamp '{value}': expected YYYY-MM-DDTHH:MM:SS+HH:MM")]
    Invalid { value: String },
}

pub fn parse_window_bound(raw: &str) -> Result<DateTime<FixedOffset>, TimestampError> {
    let trimmed = raw.trim();
    DateTime::parse_from_rfc3339(trimmed)
        .or_else(|_| DateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%z"))
        .map_err(|_| TimestampError::Invalid {
            value: raw.to_string(),
        })
}

pub fn format_window_bound(ts: &DateTime<FixedOffset>) -> String {
    ts.format(WINDOW_BOUND_FORMAT).to_string()
}

// The last window may end after `end`.
pub fn plan_time_windows(
    start: DateTime<FixedOffset>,
    end: DateTime<FixedOffset>,
    hop_days: u32,
) -> Vec<TimeWindow> {
    if hop_days == 0 {
        return Vec::new();
    }

    let hop = ChronoDuration::days(i64::from(hop_days));
    let mut out = Vec::new();
    let mut current = start;

    while current < end {
        let Some(next) = current.checked_add_signed(hop) else {
            break;
        };
        out.push(TimeWindow {
            start: current,
            end: next,
        });
        current = next;
    }

    out
}
