//! HTTP page transport + SQLite record sink for the event harvester.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use evh_core::{
    format_timestamp, try_parse_timestamp, HarvestRecord, SummitOrSeriesRecord, SummitOrSeriesType,
    WebcastRecord, WebcastType,
};
pub use reqwest::StatusCode;
use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{Connection, Row, SqliteConnection};
use thiserror::Error;
use tracing::{error, info_span, Instrument};

pub const CRATE_NAME: &str = "evh-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    /// No retries: a failed page is skipped for the cycle and the controller moves on.
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Request/response primitive consumed by the harvest controller.
#[async_trait]
pub trait PageTransport: Send + Sync {
    async fn fetch_page(&self, url: &str) -> Result<FetchedResponse, FetchError>;
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
            backoff: config.backoff,
        })
    }

    async fn fetch_with_backoff(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
            let outcome = match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    (
                        classify_status(status),
                        FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        },
                    )
                }
                Err(err) => (classify_reqwest_error(&err), FetchError::Request(err)),
            };

            let (disposition, err) = outcome;
            if disposition == RetryDisposition::NonRetryable || attempt >= self.backoff.max_retries {
                return Err(err);
            }
            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl PageTransport for HttpFetcher {
    async fn fetch_page(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        self.fetch_with_backoff(url)
            .instrument(info_span!("http_fetch", url))
            .await
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("record sink is closed")]
    Closed,
    #[error("store connection failure: {0}")]
    Connection(#[source] sqlx::Error),
    #[error("store rejected write: {0}")]
    Write(#[source] sqlx::Error),
}

impl SinkError {
    /// Whether the sink can no longer accept writes for the rest of the job.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SinkError::Closed | SinkError::Connection(_))
    }

    fn classify(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => SinkError::Connection(err),
            other => SinkError::Write(other),
        }
    }
}

/// Durable destination for canonical records; one call to `store` is one commit.
#[async_trait]
pub trait RecordSink: Send {
    async fn store(&mut self, record: HarvestRecord) -> Result<(), SinkError>;

    /// Releases the underlying connection. Calling it again is a no-op.
    async fn close(&mut self) -> Result<(), SinkError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecordCounts {
    pub webcasts: u64,
    pub summits_and_series: u64,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS webcasts (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  event_id INTEGER NULL,
  event_type TEXT NOT NULL,
  title TEXT NULL,
  description TEXT NULL,
  presenter TEXT NULL,
  status TEXT NULL,
  scheduled TEXT NULL,
  entry_time TEXT NULL,
  close_time TEXT NULL,
  created TEXT NULL,
  last_updated TEXT NULL,
  calendar_url TEXT NULL,
  url TEXT NULL
);
CREATE INDEX IF NOT EXISTS webcasts_event_id_idx ON webcasts(event_id);

CREATE TABLE IF NOT EXISTS summits_and_series (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  event_id INTEGER NULL,
  event_type TEXT NOT NULL,
  title TEXT NULL,
  description TEXT NULL,
  scheduled_start TEXT NULL,
  scheduled_end TEXT NULL,
  url TEXT NULL
);
CREATE INDEX IF NOT EXISTS summits_and_series_event_id_idx ON summits_and_series(event_id);
"#;

/// SQLite-backed sink holding a single exclusively-owned connection.
#[derive(Debug)]
pub struct SqliteSink {
    conn: Option<SqliteConnection>,
}

impl SqliteSink {
    /// Connects (creating the database file if needed) and ensures the schema exists.
    pub async fn open(database_url: &str) -> Result<Self, SinkError> {
        let opts = SqliteConnectOptions::from_str(database_url)
            .map_err(SinkError::Connection)?
            .create_if_missing(true);
        let mut conn = SqliteConnection::connect_with(&opts)
            .await
            .map_err(SinkError::Connection)?;
        sqlx::raw_sql(SCHEMA)
            .execute(&mut conn)
            .await
            .map_err(SinkError::Connection)?;
        Ok(Self { conn: Some(conn) })
    }

    fn conn(&mut self) -> Result<&mut SqliteConnection, SinkError> {
        self.conn.as_mut().ok_or(SinkError::Closed)
    }

    pub async fn record_counts(&mut self) -> Result<RecordCounts, SinkError> {
        let conn = self.conn()?;
        let webcasts: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM webcasts")
            .fetch_one(&mut *conn)
            .await
            .map_err(SinkError::classify)?;
        let summits_and_series: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM summits_and_series")
            .fetch_one(&mut *conn)
            .await
            .map_err(SinkError::classify)?;
        Ok(RecordCounts {
            webcasts: webcasts.max(0) as u64,
            summits_and_series: summits_and_series.max(0) as u64,
        })
    }

    /// Loads stored webcasts in insertion order. Rows whose `event_type` is not
    /// a known webcast type are reported and skipped.
    pub async fn load_webcasts(&mut self) -> Result<Vec<WebcastRecord>, SinkError> {
        let rows = sqlx::query(
            r#"
SELECT event_id, event_type, title, description, presenter, status,
       scheduled, entry_time, close_time, created, last_updated, calendar_url, url
  FROM webcasts
 ORDER BY id
"#,
        )
        .fetch_all(self.conn()?)
        .await
        .map_err(SinkError::classify)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let raw_type: String = row.try_get("event_type").map_err(SinkError::Write)?;
            let event_type = match raw_type.parse::<WebcastType>() {
                Ok(t) => t,
                Err(err) => {
                    error!(error = %err, table = "webcasts", "unknown record variant in store; row skipped");
                    continue;
                }
            };
            out.push(WebcastRecord {
                event_id: row.try_get("event_id").map_err(SinkError::Write)?,
                event_type,
                title: row.try_get("title").map_err(SinkError::Write)?,
                description: row.try_get("description").map_err(SinkError::Write)?,
                presenter: row.try_get("presenter").map_err(SinkError::Write)?,
                status: row.try_get("status").map_err(SinkError::Write)?,
                scheduled: stored_instant(&row, "scheduled")?,
                entry_time: stored_instant(&row, "entry_time")?,
                close_time: stored_instant(&row, "close_time")?,
                created: stored_instant(&row, "created")?,
                last_updated: stored_instant(&row, "last_updated")?,
                calendar_url: row.try_get("calendar_url").map_err(SinkError::Write)?,
                url: row.try_get("url").map_err(SinkError::Write)?,
            });
        }
        Ok(out)
    }

    pub async fn load_summits_or_series(&mut self) -> Result<Vec<SummitOrSeriesRecord>, SinkError> {
        let rows = sqlx::query(
            r#"
SELECT event_id, event_type, title, description, scheduled_start, scheduled_end, url
  FROM summits_and_series
 ORDER BY id
"#,
        )
        .fetch_all(self.conn()?)
        .await
        .map_err(SinkError::classify)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let raw_type: String = row.try_get("event_type").map_err(SinkError::Write)?;
            let event_type = match raw_type.parse::<SummitOrSeriesType>() {
                Ok(t) => t,
                Err(err) => {
                    error!(error = %err, table = "summits_and_series", "unknown record variant in store; row skipped");
                    continue;
                }
            };
            out.push(SummitOrSeriesRecord {
                event_id: row.try_get("event_id").map_err(SinkError::Write)?,
                event_type,
                title: row.try_get("title").map_err(SinkError::Write)?,
                description: row.try_get("description").map_err(SinkError::Write)?,
                scheduled_start: stored_instant(&row, "scheduled_start")?,
                scheduled_end: stored_instant(&row, "scheduled_end")?,
                url: row.try_get("url").map_err(SinkError::Write)?,
            });
        }
        Ok(out)
    }
}

fn stored_instant(
    row: &SqliteRow,
    column: &str,
) -> Result<Option<chrono::DateTime<chrono::Utc>>, SinkError> {
    let text: Option<String> = row.try_get(column).map_err(SinkError::Write)?;
    try_parse_timestamp(text.as_deref())
        .map_err(|e| SinkError::Write(sqlx::Error::Decode(Box::new(e))))
}

async fn insert_webcast(conn: &mut SqliteConnection, record: &WebcastRecord) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
INSERT INTO webcasts
  (event_id, event_type, title, description, presenter, status,
   scheduled, entry_time, close_time, created, last_updated, calendar_url, url)
VALUES
  (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
"#,
    )
    .bind(record.event_id)
    .bind(record.event_type.as_str())
    .bind(&record.title)
    .bind(&record.description)
    .bind(&record.presenter)
    .bind(&record.status)
    .bind(record.scheduled.as_ref().map(format_timestamp))
    .bind(record.entry_time.as_ref().map(format_timestamp))
    .bind(record.close_time.as_ref().map(format_timestamp))
    .bind(record.created.as_ref().map(format_timestamp))
    .bind(record.last_updated.as_ref().map(format_timestamp))
    .bind(&record.calendar_url)
    .bind(&record.url)
    .execute(conn)
    .await?;
    Ok(())
}

async fn insert_summit_or_series(
    conn: &mut SqliteConnection,
    record: &SummitOrSeriesRecord,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
INSERT INTO summits_and_series
  (event_id, event_type, title, description, scheduled_start, scheduled_end, url)
VALUES
  (?1, ?2, ?3, ?4, ?5, ?6, ?7)
"#,
    )
    .bind(record.event_id)
    .bind(record.event_type.as_str())
    .bind(&record.title)
    .bind(&record.description)
    .bind(record.scheduled_start.as_ref().map(format_timestamp))
    .bind(record.scheduled_end.as_ref().map(format_timestamp))
    .bind(&record.url)
    .execute(conn)
    .await?;
    Ok(())
}

#[async_trait]
impl RecordSink for SqliteSink {
    async fn store(&mut self, record: HarvestRecord) -> Result<(), SinkError> {
        let conn = self.conn()?;
        let mut tx = conn.begin().await.map_err(SinkError::classify)?;
        let inserted = match &record {
            HarvestRecord::Webcast(webcast) => insert_webcast(&mut tx, webcast).await,
            HarvestRecord::SummitOrSeries(event) => insert_summit_or_series(&mut tx, event).await,
        };
        inserted.map_err(SinkError::classify)?;
        tx.commit().await.map_err(SinkError::classify)
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        match self.conn.take() {
            Some(conn) => conn.close().await.map_err(SinkError::Connection),
            None => Ok(()),
        }
    }
}
