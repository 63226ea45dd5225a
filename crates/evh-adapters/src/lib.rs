//! Listing query construction and record extraction for the events listing API.

use evh_core::{
    HarvestDraft, SummitOrSeriesDraft, SummitOrSeriesType, WebcastDraft, WebcastType,
    RECORDED_EVENT_CALENDAR_URL,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;
use url::Url;

pub const CRATE_NAME: &str = "evh-adapters";

pub const WEBCAST_PAGE_SIZE: u64 = 8;
pub const SUMMIT_OR_SERIES_PAGE_SIZE: u64 = 6;

/// Position of the calendar link inside an upcoming webcast's `links` array.
pub const CALENDAR_LINK_INDEX: usize = 2;

const UPCOMING_STATUS: &str = "upcoming";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("malformed listing payload: {0}")]
    MalformedPayload(String),
    #[error("invalid listing url: {0}")]
    Url(#[from] url::ParseError),
}

/// Independently terminating harvest target; each is backed by two query variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalStream {
    Webcast,
    SummitOrSeries,
}

impl LogicalStream {
    pub fn page_size(&self) -> u64 {
        match self {
            LogicalStream::Webcast => WEBCAST_PAGE_SIZE,
            LogicalStream::SummitOrSeries => SUMMIT_OR_SERIES_PAGE_SIZE,
        }
    }

    /// Key of the record array inside a listing payload.
    pub fn items_key(&self) -> &'static str {
        match self {
            LogicalStream::Webcast => "communications",
            LogicalStream::SummitOrSeries => "summits",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogicalStream::Webcast => "webcast",
            LogicalStream::SummitOrSeries => "summit_or_series",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryVariant {
    RecordedWebcasts,
    UpcomingWebcasts,
    Summits,
    Series,
}

impl QueryVariant {
    pub const ALL: [QueryVariant; 4] = [
        QueryVariant::RecordedWebcasts,
        QueryVariant::UpcomingWebcasts,
        QueryVariant::Summits,
        QueryVariant::Series,
    ];

    pub fn stream(&self) -> LogicalStream {
        match self {
            QueryVariant::RecordedWebcasts | QueryVariant::UpcomingWebcasts => LogicalStream::Webcast,
            QueryVariant::Summits | QueryVariant::Series => LogicalStream::SummitOrSeries,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueryVariant::RecordedWebcasts => "recorded_webcasts",
            QueryVariant::UpcomingWebcasts => "upcoming_webcasts",
            QueryVariant::Summits => "summits",
            QueryVariant::Series => "series",
        }
    }

    /// Builds the listing request for the page beginning at record offset `start`.
    pub fn listing_url(&self, base: &Url, topic: &str, start: u64) -> Result<Url, AdapterError> {
        let topic = topic.replace('\'', "\\'");
        let size = self.stream().page_size().to_string();
        let start = start.to_string();

        let url = match self {
            QueryVariant::RecordedWebcasts | QueryVariant::UpcomingWebcasts => {
                let (rank, status) = match self {
                    QueryVariant::RecordedWebcasts => ("-webcast_relevance", "recorded"),
                    _ => ("webcast_relevance", "upcoming"),
                };
                let mut url = base.join("/api/webcasts")?;
                url.query_pairs_mut()
                    .append_pair("start", &start)
                    .append_pair("size", &size)
                    .append_pair("rank", rank)
                    .append_pair(
                        "bq",
                        &format!("(and type:'webcast' status:'{status}' '{topic}')"),
                    )
                    .append_pair("rankClosest", "")
                    .append_pair("paidSearch", "true")
                    .append_pair("returnFields", "")
                    .append_pair("q", "");
                url
            }
            QueryVariant::Summits | QueryVariant::Series => {
                let kind = if *self == QueryVariant::Summits { "summit" } else { "series" };
                let path = if *self == QueryVariant::Summits {
                    "/api/summits"
                } else {
                    "/api/series"
                };
                let mut url = base.join(path)?;
                url.query_pairs_mut()
                    .append_pair("start", &start)
                    .append_pair("size", &size)
                    .append_pair("rank", "-custom_relevance,datetime")
                    .append_pair("bq", &format!("(and type:'{kind}' '{topic}')"))
                    .append_pair("rankClosest", "");
                url
            }
        };
        Ok(url)
    }
}

/// Envelope of one listing response: the `found` counter plus the raw items.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingPage {
    pub found: Option<u64>,
    pub items: Vec<JsonValue>,
}

impl ListingPage {
    /// A page signals exhaustion only when it explicitly reports `found == 0`.
    pub fn is_exhausted(&self) -> bool {
        self.found == Some(0)
    }
}

pub fn parse_listing_page(stream: LogicalStream, body: &[u8]) -> Result<ListingPage, AdapterError> {
    let value: JsonValue = serde_json::from_slice(body)
        .map_err(|e| AdapterError::MalformedPayload(format!("invalid JSON: {e}")))?;
    let Some(object) = value.as_object() else {
        return Err(AdapterError::MalformedPayload(
            "listing payload is not a JSON object".to_string(),
        ));
    };

    let found = object.get("found").and_then(json_count);
    let items = object
        .get(stream.items_key())
        .and_then(JsonValue::as_array)
        .cloned()
        .unwrap_or_default();
    Ok(ListingPage { found, items })
}

/// Whole-valued counts, whether the source encodes them as integers or floats.
fn json_count(value: &JsonValue) -> Option<u64> {
    value.as_u64().or_else(|| {
        value
            .as_f64()
            .filter(|f| f.fract() == 0.0 && *f >= 0.0 && *f <= u64::MAX as f64)
            .map(|f| f as u64)
    })
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str()
}

fn json_string(value: &JsonValue, key: &str) -> Option<String> {
    json_str(value, &[key]).map(ToString::to_string)
}

/// Source ids arrive as numbers, occasionally as numeric strings.
fn json_event_id(value: &JsonValue) -> Option<i64> {
    let id = value.get("id")?;
    id.as_i64()
        .or_else(|| id.as_str().and_then(|s| s.trim().parse().ok()))
}

fn calendar_url(event: &JsonValue, event_id: Option<i64>) -> Option<String> {
    if json_str(event, &["status"]) != Some(UPCOMING_STATUS) {
        return Some(RECORDED_EVENT_CALENDAR_URL.to_string());
    }

    let links = event.get("links").and_then(JsonValue::as_array);
    let href = links
        .and_then(|links| links.get(CALENDAR_LINK_INDEX))
        .and_then(|link| json_str(link, &["href"]));
    if href.is_none() {
        warn!(
            field = "calendar_url",
            ?event_id,
            links = links.map(Vec::len).unwrap_or(0),
            "upcoming webcast has no calendar link at the expected position"
        );
    }
    href.map(ToString::to_string)
}

pub fn extract_webcasts(raw_events: &[JsonValue], event_type: WebcastType) -> Vec<WebcastDraft> {
    raw_events
        .iter()
        .enumerate()
        .filter_map(|(position, event)| {
            if !event.is_object() {
                warn!(position, kind = "webcast", "skipping listing item that is not an object");
                return None;
            }
            let event_id = json_event_id(event);
            Some(WebcastDraft {
                event_id,
                event_type,
                title: json_string(event, "title"),
                description: json_string(event, "description"),
                presenter: json_string(event, "presenter"),
                status: json_string(event, "status"),
                calendar_url: calendar_url(event, event_id),
                scheduled: json_string(event, "scheduled"),
                entry_time: json_string(event, "entryTime"),
                close_time: json_string(event, "closeTime"),
                created: json_string(event, "created"),
                last_updated: json_string(event, "lastUpdated"),
                url: json_string(event, "url"),
            })
        })
        .collect()
}

pub fn extract_summits_or_series(
    raw_events: &[JsonValue],
    event_type: SummitOrSeriesType,
) -> Vec<SummitOrSeriesDraft> {
    raw_events
        .iter()
        .enumerate()
        .filter_map(|(position, event)| {
            if !event.is_object() {
                warn!(position, kind = event_type.as_str(), "skipping listing item that is not an object");
                return None;
            }
            Some(SummitOrSeriesDraft {
                event_id: json_event_id(event),
                event_type,
                title: json_string(event, "title"),
                description: json_string(event, "description"),
                scheduled_start: json_string(event, "scheduledStartDate"),
                scheduled_end: json_string(event, "scheduledEndDate"),
                // The listing API calls the canonical link `wordPressLink`.
                url: json_string(event, "wordPressLink"),
            })
        })
        .collect()
}

/// Extracts every record of a page, preserving the source order.
pub fn extract_page(variant: QueryVariant, page: &ListingPage) -> Vec<HarvestDraft> {
    match variant {
        QueryVariant::RecordedWebcasts => extract_webcasts(&page.items, WebcastType::Recorded)
            .into_iter()
            .map(HarvestDraft::Webcast)
            .collect(),
        QueryVariant::UpcomingWebcasts => extract_webcasts(&page.items, WebcastType::Upcoming)
            .into_iter()
            .map(HarvestDraft::Webcast)
            .collect(),
        QueryVariant::Summits => extract_summits_or_series(&page.items, SummitOrSeriesType::Summit)
            .into_iter()
            .map(HarvestDraft::SummitOrSeries)
            .collect(),
        QueryVariant::Series => extract_summits_or_series(&page.items, SummitOrSeriesType::Series)
            .into_iter()
            .map(HarvestDraft::SummitOrSeries)
            .collect(),
    }
}
