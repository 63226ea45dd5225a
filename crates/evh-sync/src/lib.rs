//! Harvest orchestration: multi-stream pagination, extraction, normalization and persistence.

mod cursor;
mod normalize;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use evh_adapters::{extract_page, parse_listing_page, AdapterError, LogicalStream, QueryVariant};
use evh_core::HarvestRecord;
use evh_storage::{
    BackoffPolicy, FetchError, FetchedResponse, HttpClientConfig, HttpFetcher, PageTransport,
    RecordSink, SinkError, SqliteSink,
};
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use url::Url;
use uuid::Uuid;

pub use cursor::StreamCursor;
pub use normalize::{normalize, Normalized};

pub const CRATE_NAME: &str = "evh-sync";

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub database_url: String,
    pub base_url: String,
    pub topic: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_max_retries: usize,
    pub max_cycles: Option<u64>,
    /// Consecutive failures of one query before an alert is raised; 0 disables alerts.
    pub failure_alert_threshold: u32,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl HarvestConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            database_url: lookup("DATABASE_URL")
                .unwrap_or_else(|| "sqlite://./harvest.db".to_string()),
            base_url: lookup("EVH_BASE_URL")
                .unwrap_or_else(|| "https://www.brighttalk.com".to_string()),
            topic: lookup("EVH_TOPIC").unwrap_or_else(|| "Cloud Security".to_string()),
            user_agent: lookup("EVH_USER_AGENT").unwrap_or_else(|| "evh-bot/0.1".to_string()),
            http_timeout_secs: lookup("EVH_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            http_max_retries: lookup("EVH_HTTP_MAX_RETRIES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            max_cycles: lookup("EVH_MAX_CYCLES").and_then(|v| v.parse().ok()),
            failure_alert_threshold: lookup("EVH_FAILURE_ALERT_THRESHOLD")
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy {
                max_retries: self.http_max_retries,
                ..Default::default()
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("transport failure: {0}")]
    Transport(#[from] FetchError),
    #[error(transparent)]
    Payload(#[from] AdapterError),
    #[error("record sink failure: {0}")]
    Sink(#[from] SinkError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HarvestOutcome {
    /// Both logical streams reported exhaustion.
    Completed,
    CycleLimit,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct HarvestSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cycles: u64,
    pub outcome: HarvestOutcome,
    pub webcasts_stored: u64,
    pub summits_or_series_stored: u64,
    pub records_dropped: u64,
    pub malformed_fields: u64,
    pub transport_failures: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct HarvestStats {
    webcasts_stored: u64,
    summits_or_series_stored: u64,
    records_dropped: u64,
    malformed_fields: u64,
    transport_failures: u64,
}

/// Owns both stream cursors and the record sink for the lifetime of one job.
pub struct HarvestJob {
    run_id: Uuid,
    base_url: Url,
    topic: String,
    max_cycles: Option<u64>,
    failure_alert_threshold: u32,
    transport: Arc<dyn PageTransport>,
    sink: Box<dyn RecordSink>,
    webcast: StreamCursor,
    summit_or_series: StreamCursor,
    failure_streaks: HashMap<QueryVariant, u32>,
    cycles: u64,
    stats: HarvestStats,
}

impl HarvestJob {
    pub fn new(
        config: &HarvestConfig,
        transport: Arc<dyn PageTransport>,
        sink: Box<dyn RecordSink>,
    ) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .with_context(|| format!("parsing base url {}", config.base_url))?;
        Ok(Self {
            run_id: Uuid::new_v4(),
            base_url,
            topic: config.topic.clone(),
            max_cycles: config.max_cycles,
            failure_alert_threshold: config.failure_alert_threshold,
            transport,
            sink,
            webcast: StreamCursor::new(LogicalStream::Webcast.page_size()),
            summit_or_series: StreamCursor::new(LogicalStream::SummitOrSeries.page_size()),
            failure_streaks: HashMap::new(),
            cycles: 0,
            stats: HarvestStats::default(),
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn cursor(&self, stream: LogicalStream) -> &StreamCursor {
        match stream {
            LogicalStream::Webcast => &self.webcast,
            LogicalStream::SummitOrSeries => &self.summit_or_series,
        }
    }

    fn cursor_mut(&mut self, stream: LogicalStream) -> &mut StreamCursor {
        match stream {
            LogicalStream::Webcast => &mut self.webcast,
            LogicalStream::SummitOrSeries => &mut self.summit_or_series,
        }
    }

    pub fn is_done(&self) -> bool {
        self.webcast.exhausted() && self.summit_or_series.exhausted()
    }

    pub fn failure_streak(&self, variant: QueryVariant) -> u32 {
        self.failure_streaks.get(&variant).copied().unwrap_or(0)
    }

    /// Runs cycles until both streams are exhausted, the cycle cap is hit or
    /// `shutdown` resolves. The sink is closed on every exit path.
    pub async fn run<F>(mut self, shutdown: F) -> Result<HarvestSummary>
    where
        F: Future<Output = ()> + Send,
    {
        let started_at = Utc::now();
        let span = info_span!("harvest_job", run_id = %self.run_id);
        let driven = self.drive(shutdown).instrument(span.clone()).await;
        let closed = self.sink.close().instrument(span.clone()).await;

        let outcome = match driven {
            Ok(outcome) => outcome,
            Err(err) => {
                if let Err(close_err) = closed {
                    error!(parent: &span, error = %close_err, "failed to close record sink after fatal error");
                }
                error!(parent: &span, error = %err, cycles = self.cycles, "harvest aborted");
                return Err(err).context("harvest aborted");
            }
        };
        closed.context("closing record sink")?;

        let summary = HarvestSummary {
            run_id: self.run_id,
            started_at,
            finished_at: Utc::now(),
            cycles: self.cycles,
            outcome,
            webcasts_stored: self.stats.webcasts_stored,
            summits_or_series_stored: self.stats.summits_or_series_stored,
            records_dropped: self.stats.records_dropped,
            malformed_fields: self.stats.malformed_fields,
            transport_failures: self.stats.transport_failures,
        };
        info!(
            parent: &span,
            ?outcome,
            cycles = summary.cycles,
            webcasts = summary.webcasts_stored,
            summits_or_series = summary.summits_or_series_stored,
            dropped = summary.records_dropped,
            "harvest finished"
        );
        Ok(summary)
    }

    async fn drive<F>(&mut self, shutdown: F) -> Result<HarvestOutcome, HarvestError>
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);
        loop {
            if self.is_done() {
                return Ok(HarvestOutcome::Completed);
            }
            if self.max_cycles.is_some_and(|max| self.cycles >= max) {
                info!(cycles = self.cycles, "cycle limit reached");
                return Ok(HarvestOutcome::CycleLimit);
            }

            let completed = self.cycles;
            let cycle = completed + 1;
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!(cycles = completed, "shutdown requested; stopping harvest");
                    return Ok(HarvestOutcome::Cancelled);
                }
                result = self.run_cycle().instrument(info_span!("harvest_cycle", cycle)) => {
                    result?;
                }
            }
        }
    }

    /// One poll cycle: request every non-exhausted query variant concurrently,
    /// process responses as they arrive, then advance both cursors.
    pub async fn run_cycle(&mut self) -> Result<(), HarvestError> {
        let mut requests = Vec::new();
        for variant in QueryVariant::ALL {
            let cursor = self.cursor(variant.stream());
            if cursor.exhausted() {
                continue;
            }
            let url = variant.listing_url(&self.base_url, &self.topic, cursor.start())?;
            requests.push((variant, url));
        }

        let mut in_flight = requests
            .into_iter()
            .map(|(variant, url)| {
                let transport = Arc::clone(&self.transport);
                async move {
                    let result = transport.fetch_page(url.as_str()).await;
                    (variant, url, result)
                }
            })
            .collect::<FuturesUnordered<_>>();

        while let Some((variant, url, result)) = in_flight.next().await {
            self.handle_response(variant, &url, result).await?;
        }

        self.webcast.advance();
        self.summit_or_series.advance();
        self.cycles += 1;
        info!(
            webcasts_stored = self.stats.webcasts_stored,
            summits_or_series_stored = self.stats.summits_or_series_stored,
            webcast_exhausted = self.webcast.exhausted(),
            summit_or_series_exhausted = self.summit_or_series.exhausted(),
            "cycle complete"
        );
        Ok(())
    }

    async fn handle_response(
        &mut self,
        variant: QueryVariant,
        url: &Url,
        result: Result<FetchedResponse, FetchError>,
    ) -> Result<(), HarvestError> {
        let page = result.map_err(HarvestError::from).and_then(|resp| {
            parse_listing_page(variant.stream(), &resp.body).map_err(HarvestError::from)
        });
        let page = match page {
            Ok(page) => {
                self.failure_streaks.remove(&variant);
                page
            }
            Err(err) => {
                self.note_transport_failure(variant, url, &err);
                return Ok(());
            }
        };

        let stream = variant.stream();
        if page.is_exhausted() {
            let cursor = self.cursor_mut(stream);
            if !cursor.exhausted() {
                info!(
                    stream = stream.as_str(),
                    variant = variant.as_str(),
                    start = cursor.start(),
                    "stream exhausted"
                );
            }
            cursor.mark_exhausted();
            return Ok(());
        }

        for draft in extract_page(variant, &page) {
            let Normalized {
                record,
                malformed_fields,
            } = normalize(draft);
            self.stats.malformed_fields += malformed_fields.len() as u64;
            self.store(record).await?;
        }
        Ok(())
    }

    async fn store(&mut self, record: HarvestRecord) -> Result<(), HarvestError> {
        let kind = record.kind();
        let event_id = record.event_id();
        let is_webcast = matches!(record, HarvestRecord::Webcast(_));

        match self.sink.store(record).await {
            Ok(()) => {
                if is_webcast {
                    self.stats.webcasts_stored += 1;
                } else {
                    self.stats.summits_or_series_stored += 1;
                }
                Ok(())
            }
            Err(err) if err.is_fatal() => Err(err.into()),
            Err(err) => {
                self.stats.records_dropped += 1;
                error!(kind, ?event_id, error = %err, "failed to store record; dropped");
                Ok(())
            }
        }
    }

    fn note_transport_failure(&mut self, variant: QueryVariant, url: &Url, err: &HarvestError) {
        self.stats.transport_failures += 1;
        let streak = self.failure_streaks.entry(variant).or_insert(0);
        *streak += 1;
        let streak = *streak;

        warn!(
            variant = variant.as_str(),
            %url,
            error = %err,
            streak,
            "listing request failed; skipped for this cycle"
        );
        if streak == self.failure_alert_threshold {
            error!(
                variant = variant.as_str(),
                streak,
                "listing query keeps failing; its pages are being skipped"
            );
        }
    }
}

/// Opens the SQLite sink and HTTP transport described by `config` and runs one job.
/// Everything that can be rejected up front is checked before the store is opened.
pub async fn run_harvest<F>(config: &HarvestConfig, shutdown: F) -> Result<HarvestSummary>
where
    F: Future<Output = ()> + Send,
{
    Url::parse(&config.base_url)
        .with_context(|| format!("parsing base url {}", config.base_url))?;
    let transport =
        HttpFetcher::new(config.http_client_config()).context("building http transport")?;
    let sink = SqliteSink::open(&config.database_url)
        .await
        .with_context(|| format!("opening record store {}", config.database_url))?;
    let job = HarvestJob::new(config, Arc::new(transport), Box::new(sink))?;
    job.run(shutdown).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_match_listing_api() {
        let config = HarvestConfig::default();
        assert_eq!(config.database_url, "sqlite://./harvest.db");
        assert_eq!(config.base_url, "https://www.brighttalk.com");
        assert_eq!(config.topic, "Cloud Security");
        assert_eq!(config.http_max_retries, 0);
        assert_eq!(config.max_cycles, None);
        assert_eq!(config.failure_alert_threshold, 5);
    }

    #[test]
    fn config_reads_overrides_and_ignores_garbage_numbers() {
        let config = HarvestConfig::from_lookup(|key| match key {
            "EVH_TOPIC" => Some("Zero Trust".to_string()),
            "EVH_MAX_CYCLES" => Some("12".to_string()),
            "EVH_HTTP_TIMEOUT_SECS" => Some("soon".to_string()),
            "EVH_HTTP_MAX_RETRIES" => Some("2".to_string()),
            _ => None,
        });
        assert_eq!(config.topic, "Zero Trust");
        assert_eq!(config.max_cycles, Some(12));
        assert_eq!(config.http_timeout_secs, 20);

        let http = config.http_client_config();
        assert_eq!(http.backoff.max_retries, 2);
        assert_eq!(http.timeout, Duration::from_secs(20));
        assert_eq!(http.user_agent.as_deref(), Some("evh-bot/0.1"));
    }

    #[tokio::test]
    async fn invalid_base_url_fails_before_store_is_opened() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("harvest.db");
        let config = HarvestConfig {
            base_url: "not a url".to_string(),
            database_url: format!("sqlite://{}", db_path.display()),
            ..HarvestConfig::default()
        };

        let err = run_harvest(&config, std::future::pending::<()>())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("parsing base url"));
        assert!(!db_path.exists());
    }
}
