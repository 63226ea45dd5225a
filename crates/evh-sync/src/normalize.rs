//! Draft to canonical record conversion: every temporal field goes through the
//! strict timestamp parser, malformed text leaves that one field unset.

use chrono::{DateTime, Utc};
use evh_core::{
    parse_timestamp, HarvestDraft, HarvestRecord, SummitOrSeriesDraft, SummitOrSeriesRecord,
    WebcastDraft, WebcastRecord,
};
use tracing::info_span;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalized {
    pub record: HarvestRecord,
    /// Names of fields whose source text could not be parsed.
    pub malformed_fields: Vec<&'static str>,
}

pub fn normalize(draft: HarvestDraft) -> Normalized {
    let mut malformed_fields = Vec::new();
    let record = match draft {
        HarvestDraft::Webcast(draft) => {
            HarvestRecord::Webcast(normalize_webcast(draft, &mut malformed_fields))
        }
        HarvestDraft::SummitOrSeries(draft) => {
            HarvestRecord::SummitOrSeries(normalize_summit_or_series(draft, &mut malformed_fields))
        }
    };
    Normalized {
        record,
        malformed_fields,
    }
}

fn instant(
    field: &'static str,
    event_id: Option<i64>,
    text: Option<String>,
    malformed: &mut Vec<&'static str>,
) -> Option<DateTime<Utc>> {
    let _field = info_span!("timestamp_field", field, ?event_id).entered();
    let value = parse_timestamp(text.as_deref());
    if value.is_none() && text.is_some_and(|t| !t.is_empty()) {
        malformed.push(field);
    }
    value
}

fn normalize_webcast(draft: WebcastDraft, malformed: &mut Vec<&'static str>) -> WebcastRecord {
    let id = draft.event_id;
    WebcastRecord {
        event_id: id,
        event_type: draft.event_type,
        title: draft.title,
        description: draft.description,
        presenter: draft.presenter,
        status: draft.status,
        scheduled: instant("scheduled", id, draft.scheduled, malformed),
        entry_time: instant("entry_time", id, draft.entry_time, malformed),
        close_time: instant("close_time", id, draft.close_time, malformed),
        created: instant("created", id, draft.created, malformed),
        last_updated: instant("last_updated", id, draft.last_updated, malformed),
        calendar_url: draft.calendar_url,
        url: draft.url,
    }
}

fn normalize_summit_or_series(
    draft: SummitOrSeriesDraft,
    malformed: &mut Vec<&'static str>,
) -> SummitOrSeriesRecord {
    let id = draft.event_id;
    SummitOrSeriesRecord {
        event_id: id,
        event_type: draft.event_type,
        title: draft.title,
        description: draft.description,
        scheduled_start: instant("scheduled_start", id, draft.scheduled_start, malformed),
        scheduled_end: instant("scheduled_end", id, draft.scheduled_end, malformed),
        url: draft.url,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use evh_core::{SummitOrSeriesType, WebcastType, RECORDED_EVENT_CALENDAR_URL};

    fn webcast_draft() -> WebcastDraft {
        WebcastDraft {
            event_id: Some(12),
            event_type: WebcastType::Recorded,
            title: Some("Kubernetes Hardening".to_string()),
            description: Some("Runtime controls".to_string()),
            presenter: Some("Sam Ortiz".to_string()),
            status: Some("recorded".to_string()),
            calendar_url: Some(RECORDED_EVENT_CALENDAR_URL.to_string()),
            scheduled: Some("2024-13-99".to_string()),
            entry_time: Some("2024-05-01T09:45:00Z".to_string()),
            close_time: None,
            created: Some(String::new()),
            last_updated: Some("2024-05-02T10:00:00Z".to_string()),
            url: Some("https://events.example/12".to_string()),
        }
    }

    #[test]
    fn malformed_date_blanks_only_that_field() {
        let normalized = normalize(HarvestDraft::Webcast(webcast_draft()));
        assert_eq!(normalized.malformed_fields, vec!["scheduled"]);

        let HarvestRecord::Webcast(record) = normalized.record else {
            panic!("expected webcast record");
        };
        assert_eq!(record.scheduled, None);
        assert_eq!(
            record.entry_time,
            Utc.with_ymd_and_hms(2024, 5, 1, 9, 45, 0).single()
        );
        assert_eq!(record.close_time, None);
        assert_eq!(record.created, None);
        assert_eq!(record.title.as_deref(), Some("Kubernetes Hardening"));
        assert_eq!(record.presenter.as_deref(), Some("Sam Ortiz"));
        assert_eq!(record.calendar_url.as_deref(), Some(RECORDED_EVENT_CALENDAR_URL));
        assert_eq!(record.url.as_deref(), Some("https://events.example/12"));
    }

    #[test]
    fn summit_dates_are_parsed_as_utc() {
        let normalized = normalize(HarvestDraft::SummitOrSeries(SummitOrSeriesDraft {
            event_id: Some(3),
            event_type: SummitOrSeriesType::Summit,
            title: None,
            description: None,
            scheduled_start: Some("2025-04-01T08:00:00Z".to_string()),
            scheduled_end: Some("soon".to_string()),
            url: Some("https://summit.example".to_string()),
        }));
        assert_eq!(normalized.malformed_fields, vec!["scheduled_end"]);
        let HarvestRecord::SummitOrSeries(record) = normalized.record else {
            panic!("expected summit record");
        };
        assert_eq!(
            record.scheduled_start,
            Utc.with_ymd_and_hms(2025, 4, 1, 8, 0, 0).single()
        );
        assert_eq!(record.scheduled_end, None);
    }
}
