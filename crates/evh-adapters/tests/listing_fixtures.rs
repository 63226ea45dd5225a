use std::path::{Path, PathBuf};

use evh_adapters::{extract_page, parse_listing_page, LogicalStream, QueryVariant};
use evh_core::{HarvestDraft, SummitOrSeriesType, WebcastType};

fn fixture_path(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/listing")
        .join(name)
}

fn read_fixture(name: &str) -> Vec<u8> {
    std::fs::read(fixture_path(name)).expect("read fixture")
}

#[test]
fn upcoming_webcast_fixture_extracts_in_source_order() {
    let page = parse_listing_page(LogicalStream::Webcast, &read_fixture("webcasts_upcoming.json"))
        .expect("parse page");
    assert_eq!(page.found, Some(2));

    let drafts = extract_page(QueryVariant::UpcomingWebcasts, &page);
    let webcasts = drafts
        .into_iter()
        .map(|d| match d {
            HarvestDraft::Webcast(w) => w,
            other => panic!("unexpected draft {other:?}"),
        })
        .collect::<Vec<_>>();

    assert_eq!(webcasts.len(), 2);
    assert_eq!(webcasts[0].event_id, Some(640021));
    assert_eq!(webcasts[0].event_type, WebcastType::Upcoming);
    assert_eq!(
        webcasts[0].calendar_url.as_deref(),
        Some("https://www.brighttalk.com/webcast/1/640021/calendar")
    );
    assert_eq!(webcasts[1].event_id, Some(640022));
    assert_eq!(webcasts[1].calendar_url, None);
    assert_eq!(webcasts[1].description, None);
    assert_eq!(webcasts[1].scheduled.as_deref(), Some("2025-13-99"));
}

#[test]
fn summit_fixture_keeps_word_press_link_as_url() {
    let page = parse_listing_page(LogicalStream::SummitOrSeries, &read_fixture("summits.json"))
        .expect("parse page");
    let drafts = extract_page(QueryVariant::Summits, &page);
    let HarvestDraft::SummitOrSeries(summit) = &drafts[0] else {
        panic!("expected summit draft");
    };
    assert_eq!(summit.event_type, SummitOrSeriesType::Summit);
    assert_eq!(
        summit.url.as_deref(),
        Some("https://www.brighttalk.com/summits/cloud-security-summit")
    );
}

#[test]
fn exhausted_fixture_reports_zero_found() {
    let body = read_fixture("exhausted.json");
    for stream in [LogicalStream::Webcast, LogicalStream::SummitOrSeries] {
        let page = parse_listing_page(stream, &body).expect("parse page");
        assert!(page.is_exhausted());
        assert!(page.items.is_empty());
    }
}
