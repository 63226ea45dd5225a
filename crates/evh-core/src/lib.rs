//! Canonical event model and timestamp normalization for the event harvester.

use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "evh-core";

/// Placeholder stored in `calendar_url` for any webcast that is not upcoming.
/// The listing API never exposes a calendar link for those.
pub const RECORDED_EVENT_CALENDAR_URL: &str = "Recorded Event";

/// The only accepted wire format for source timestamps (UTC, second precision).
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebcastType {
    Recorded,
    Upcoming,
}

impl WebcastType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebcastType::Recorded => "recorded",
            WebcastType::Upcoming => "upcoming",
        }
    }
}

impl FromStr for WebcastType {
    type Err = UnknownEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "recorded" => Ok(WebcastType::Recorded),
            "upcoming" => Ok(WebcastType::Upcoming),
            other => Err(UnknownEventType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummitOrSeriesType {
    Summit,
    Series,
}

impl SummitOrSeriesType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SummitOrSeriesType::Summit => "summit",
            SummitOrSeriesType::Series => "series",
        }
    }
}

impl FromStr for SummitOrSeriesType {
    type Err = UnknownEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "summit" => Ok(SummitOrSeriesType::Summit),
            "series" => Ok(SummitOrSeriesType::Series),
            other => Err(UnknownEventType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown event type {0:?}")]
pub struct UnknownEventType(pub String);

/// Extracted webcast whose temporal fields are still source text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebcastDraft {
    pub event_id: Option<i64>,
    pub event_type: WebcastType,
    pub title: Option<String>,
    pub description: Option<String>,
    pub presenter: Option<String>,
    pub status: Option<String>,
    pub calendar_url: Option<String>,
    pub scheduled: Option<String>,
    pub entry_time: Option<String>,
    pub close_time: Option<String>,
    pub created: Option<String>,
    pub last_updated: Option<String>,
    pub url: Option<String>,
}

/// Extracted summit or series whose temporal fields are still source text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummitOrSeriesDraft {
    pub event_id: Option<i64>,
    pub event_type: SummitOrSeriesType,
    pub title: Option<String>,
    pub description: Option<String>,
    pub scheduled_start: Option<String>,
    pub scheduled_end: Option<String>,
    pub url: Option<String>,
}

/// Handoff contract from extraction into normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HarvestDraft {
    Webcast(WebcastDraft),
    SummitOrSeries(SummitOrSeriesDraft),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebcastRecord {
    pub event_id: Option<i64>,
    pub event_type: WebcastType,
    pub title: Option<String>,
    pub description: Option<String>,
    pub presenter: Option<String>,
    pub status: Option<String>,
    pub scheduled: Option<DateTime<Utc>>,
    pub entry_time: Option<DateTime<Utc>>,
    pub close_time: Option<DateTime<Utc>>,
    pub created: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
    pub calendar_url: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummitOrSeriesRecord {
    pub event_id: Option<i64>,
    pub event_type: SummitOrSeriesType,
    pub title: Option<String>,
    pub description: Option<String>,
    pub scheduled_start: Option<DateTime<Utc>>,
    pub scheduled_end: Option<DateTime<Utc>>,
    pub url: Option<String>,
}

/// Canonical record ready for persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HarvestRecord {
    Webcast(WebcastRecord),
    SummitOrSeries(SummitOrSeriesRecord),
}

impl HarvestRecord {
    pub fn kind(&self) -> &'static str {
        match self {
            HarvestRecord::Webcast(_) => "webcast",
            HarvestRecord::SummitOrSeries(_) => "summit_or_series",
        }
    }

    pub fn event_id(&self) -> Option<i64> {
        match self {
            HarvestRecord::Webcast(r) => r.event_id,
            HarvestRecord::SummitOrSeries(r) => r.event_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("timestamp {text:?} does not match YYYY-MM-DDTHH:MM:SSZ")]
pub struct MalformedTimestamp {
    pub text: String,
}

/// Strict parse: absent or empty text is `Ok(None)`, anything else must match
/// [`TIMESTAMP_FORMAT`] exactly.
pub fn try_parse_timestamp(text: Option<&str>) -> Result<Option<DateTime<Utc>>, MalformedTimestamp> {
    let Some(text) = text.filter(|t| !t.is_empty()) else {
        return Ok(None);
    };
    let malformed = || MalformedTimestamp {
        text: text.to_string(),
    };
    if !has_canonical_shape(text) {
        return Err(malformed());
    }
    NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT)
        .map(|naive| Some(naive.and_utc()))
        .map_err(|_| malformed())
}

/// Exactly `DDDD-DD-DDTDD:DD:DDZ` with seconds below 60. chrono alone would
/// also take padding, signed years and leap seconds.
fn has_canonical_shape(text: &str) -> bool {
    let bytes = text.as_bytes();
    bytes.len() == 20
        && bytes.iter().enumerate().all(|(i, b)| match i {
            4 | 7 => *b == b'-',
            10 => *b == b'T',
            13 | 16 => *b == b':',
            19 => *b == b'Z',
            _ => b.is_ascii_digit(),
        })
        && bytes[17] < b'6'
}

/// Lenient parse: malformed text is logged and yields `None`. Callers wrap it
/// in a span naming the field.
pub fn parse_timestamp(text: Option<&str>) -> Option<DateTime<Utc>> {
    match try_parse_timestamp(text) {
        Ok(instant) => instant,
        Err(err) => {
            warn!(text = %err.text, "malformed timestamp; field left unset");
            None
        }
    }
}

pub fn format_timestamp(instant: &DateTime<Utc>) -> String {
    instant.format(TIMESTAMP_FORMAT).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_canonical_utc_timestamp() {
        let parsed = parse_timestamp(Some("2024-03-05T14:30:09Z"));
        assert_eq!(
            parsed,
            Some(Utc.with_ymd_and_hms(2024, 3, 5, 14, 30, 9).single().unwrap())
        );
    }

    #[test]
    fn absent_and_empty_text_are_absent_without_error() {
        assert_eq!(try_parse_timestamp(None), Ok(None));
        assert_eq!(try_parse_timestamp(Some("")), Ok(None));
        assert_eq!(parse_timestamp(None), None);
    }

    #[test]
    fn malformed_text_is_absent() {
        assert_eq!(parse_timestamp(Some("not-a-date")), None);
        assert_eq!(parse_timestamp(Some("2024-13-99")), None);
        assert!(try_parse_timestamp(Some("2024-13-99")).is_err());
    }

    #[test]
    fn offset_and_fractional_variants_are_rejected() {
        assert!(try_parse_timestamp(Some("2024-03-05T14:30:09+00:00")).is_err());
        assert!(try_parse_timestamp(Some("2024-03-05T14:30:09.250Z")).is_err());
        assert!(try_parse_timestamp(Some("2024-03-05 14:30:09")).is_err());
        assert!(try_parse_timestamp(Some(" 2024-03-05T14:30:09Z")).is_err());
        assert!(try_parse_timestamp(Some("+2024-03-05T14:30:09Z")).is_err());
        assert!(try_parse_timestamp(Some("2016-12-31T23:59:60Z")).is_err());
        assert!(try_parse_timestamp(Some("2024-03-05T14:30:09Z ")).is_err());
    }

    #[test]
    fn reparsing_formatted_output_is_idempotent() {
        for input in ["2024-03-05T14:30:09Z", "1999-12-31T23:59:59Z", "2030-01-01T00:00:00Z"] {
            let first = parse_timestamp(Some(input)).unwrap();
            let formatted = format_timestamp(&first);
            assert_eq!(formatted, input);
            assert_eq!(parse_timestamp(Some(&formatted)), Some(first));
        }
    }

    #[test]
    fn event_types_round_trip_through_their_labels() {
        for t in [WebcastType::Recorded, WebcastType::Upcoming] {
            assert_eq!(t.as_str().parse::<WebcastType>(), Ok(t));
        }
        for t in [SummitOrSeriesType::Summit, SummitOrSeriesType::Series] {
            assert_eq!(t.as_str().parse::<SummitOrSeriesType>(), Ok(t));
        }
        assert_eq!(
            "webinar".parse::<WebcastType>(),
            Err(UnknownEventType("webinar".to_string()))
        );
    }

    #[test]
    fn record_kind_follows_variant() {
        let record = HarvestRecord::SummitOrSeries(SummitOrSeriesRecord {
            event_id: Some(7),
            event_type: SummitOrSeriesType::Series,
            title: None,
            description: None,
            scheduled_start: None,
            scheduled_end: None,
            url: None,
        });
        assert_eq!(record.kind(), "summit_or_series");
        assert_eq!(record.event_id(), Some(7));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["kind"], "summit_or_series");
        assert_eq!(json["event_type"], "series");
    }
}
