//! HTTP transport, raw CSV archive and the row-store collaborator.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use biomass_core::{RawPayload, StorageRow};
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "biomass-storage";

#[derive(Debug, Clone)]
pub struct ArchivedCsv {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    /// The sheet content was already on disk from an earlier fetch.
    pub deduplicated: bool,
}

/// Raw sheet exports keyed by source and content hash.
///
/// Layout is `<source-slug>/<sha256>.csv`, so an unchanged sheet is stored once no
/// matter how many refresh runs fetch it. Every fetch appends
/// `<rfc3339 timestamp> <sha256>` to `<source-slug>/fetches.log`.
#[derive(Debug, Clone)]
pub struct CsvArchive {
    root: PathBuf,
}

impl CsvArchive {
    pub const FETCH_LOG: &'static str = "fetches.log";

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    pub fn relative_path_for(&self, source_id: &str, content_hash: &str) -> PathBuf {
        PathBuf::from(source_slug(source_id)).join(format!("{content_hash}.csv"))
    }

    pub async fn archive(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        csv_text: &str,
    ) -> anyhow::Result<ArchivedCsv> {
        let bytes = csv_text.as_bytes();
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.relative_path_for(source_id, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let source_dir = self.root.join(source_slug(source_id));

        fs::create_dir_all(&source_dir)
            .await
            .with_context(|| format!("creating archive directory {}", source_dir.display()))?;

        let deduplicated = !write_new_file(&source_dir, &absolute_path, bytes).await?;
        append_fetch_log(&source_dir, fetched_at, &content_hash).await?;

        Ok(ArchivedCsv {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated,
        })
    }

    /// Fetch log lines for a source, oldest first. Missing log means no fetches.
    pub async fn fetch_history(&self, source_id: &str) -> anyhow::Result<Vec<(String, String)>> {
        let log = self.root.join(source_slug(source_id)).join(Self::FETCH_LOG);
        let text = match fs::read_to_string(&log).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err).with_context(|| format!("reading {}", log.display())),
        };
        Ok(text
            .lines()
            .filter_map(|line| line.split_once(' '))
            .map(|(at, hash)| (at.to_string(), hash.to_string()))
            .collect())
    }
}

/// Returns `false` when `target` already exists. Content lands via a sibling temp file and rename.
async fn write_new_file(dir: &Path, target: &Path, bytes: &[u8]) -> anyhow::Result<bool> {
    if fs::try_exists(target)
        .await
        .with_context(|| format!("checking archive path {}", target.display()))?
    {
        return Ok(false);
    }

    let temp_path = dir.join(format!(".incoming-{}.csv", Uuid::new_v4()));
    fs::write(&temp_path, bytes)
        .await
        .with_context(|| format!("writing {}", temp_path.display()))?;

    let renamed = fs::rename(&temp_path, target).await;
    if renamed.is_err() {
        let _ = fs::remove_file(&temp_path).await;
    }
    match renamed {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(err).with_context(|| format!("moving archive into {}", target.display())),
    }
}

async fn append_fetch_log(
    dir: &Path,
    fetched_at: DateTime<Utc>,
    content_hash: &str,
) -> anyhow::Result<()> {
    let log = dir.join(CsvArchive::FETCH_LOG);
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log)
        .await
        .with_context(|| format!("opening {}", log.display()))?;
    let line = format!("{} {content_hash}\n", fetched_at.to_rfc3339());
    file.write_all(line.as_bytes())
        .await
        .with_context(|| format!("appending to {}", log.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing {}", log.display()))?;
    Ok(())
}

fn source_slug(source_id: &str) -> String {
    let slug = source_id
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>();
    let slug = slug
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.is_empty() {
        "unnamed".to_string()
    } else {
        slug
    }
}

/// Why a failed sheet export request is worth repeating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryCause {
    /// 429: the export endpoint is rate limiting this client.
    Throttled,
    /// 408 or a transient 5xx.
    Unavailable,
    /// Connect failure or client-side timeout.
    Network,
}

/// `None` means the status is final. 501 and 505 never change on repeat.
pub fn retry_cause_for_status(status: StatusCode) -> Option<RetryCause> {
    match status.as_u16() {
        429 => Some(RetryCause::Throttled),
        408 => Some(RetryCause::Unavailable),
        501 | 505 => None,
        500..=599 => Some(RetryCause::Unavailable),
        _ => None,
    }
}

pub fn retry_cause_for_error(err: &reqwest::Error) -> Option<RetryCause> {
    (err.is_timeout() || err.is_connect()).then_some(RetryCause::Network)
}

/// Seconds form of `Retry-After`; the HTTP-date form is ignored.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Doubling delays between repeated export requests, never above `ceiling`.
#[derive(Debug, Clone, Copy)]
pub struct RetrySchedule {
    pub max_retries: usize,
    pub first_delay: Duration,
    pub ceiling: Duration,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self {
            max_retries: 1,
            first_delay: Duration::from_millis(250),
            ceiling: Duration::from_secs(2),
        }
    }
}

impl RetrySchedule {
    /// Delay before retry number `retry` (0-based). A throttled response's
    /// `Retry-After` replaces the doubling delay but still respects the ceiling.
    pub fn delay_before(
        &self,
        retry: usize,
        cause: RetryCause,
        retry_after: Option<Duration>,
    ) -> Duration {
        let doubled = u32::try_from(retry)
            .ok()
            .and_then(|shift| 1u32.checked_shl(shift))
            .map_or(self.ceiling, |factor| self.first_delay.saturating_mul(factor));
        let delay = match (cause, retry_after) {
            (RetryCause::Throttled, Some(hint)) => hint,
            _ => doubled,
        };
        delay.min(self.ceiling)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub retry: RetrySchedule,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 8,
            retry: RetrySchedule::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedResponse {
    pub status: u16,
    pub final_url: String,
    pub body: String,
}

impl FetchedResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}")]
    Other(String),
}

/// Text retrieval seam used by the source fetcher.
#[async_trait]
pub trait TextTransport: Send + Sync {
    async fn get_text(&self, source_id: &str, url: &str) -> Result<FetchedResponse, FetchError>;
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    retry: RetrySchedule,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            retry: config.retry,
        })
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .map_err(|e| FetchError::Other(e.to_string()))?;

        let mut retries = 0usize;
        loop {
            let result = self
                .client
                .get(url)
                .header(reqwest::header::ACCEPT, "text/csv")
                .send()
                .await;

            let (cause, retry_after, failure) = match result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        let body = resp.text().await?;
                        return Ok(FetchedResponse {
                            status: status.as_u16(),
                            final_url,
                            body,
                        });
                    }
                    let retry_after = resp
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(parse_retry_after);
                    let failure = FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    };
                    (retry_cause_for_status(status), retry_after, failure)
                }
                Err(err) => (retry_cause_for_error(&err), None, FetchError::Request(err)),
            };

            let Some(cause) = cause.filter(|_| retries < self.retry.max_retries) else {
                return Err(failure);
            };
            let delay = self.retry.delay_before(retries, cause, retry_after);
            debug!(
                ?cause,
                retries,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "retrying sheet export"
            );
            tokio::time::sleep(delay).await;
            retries += 1;
        }
    }
}

#[async_trait]
impl TextTransport for HttpFetcher {
    async fn get_text(&self, source_id: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", source_id, url);
        self.fetch_with_retries(url).instrument(span).await
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid table name `{0}`")]
    InvalidTable(String),
    #[error("row rejected: {0}")]
    Rejected(String),
    #[error("decoding stored row: {0}")]
    Decode(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Opaque remote table store: single-row appends and whole-table reads.
#[async_trait]
pub trait RowStore: Send + Sync {
    async fn insert_row(&self, table: &str, row: &StorageRow) -> Result<(), StoreError>;
    async fn query_all(&self, table: &str) -> Result<Vec<StorageRow>, StoreError>;
}

pub fn validate_table_name(table: &str) -> Result<(), StoreError> {
    let valid = !table.is_empty()
        && table.len() <= 63
        && table
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidTable(table.to_string()))
    }
}

/// In-process store used when no database is configured.
#[derive(Debug, Default)]
pub struct MemoryRowStore {
    tables: Mutex<HashMap<String, Vec<StorageRow>>>,
}

impl MemoryRowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self, table: &str) -> usize {
        self.tables.lock().await.get(table).map_or(0, Vec::len)
    }
}

#[async_trait]
impl RowStore for MemoryRowStore {
    async fn insert_row(&self, table: &str, row: &StorageRow) -> Result<(), StoreError> {
        validate_table_name(table)?;
        let mut tables = self.tables.lock().await;
        let rows = tables.entry(table.to_string()).or_default();
        if rows.iter().any(|r| r.id == row.id) {
            return Err(StoreError::Rejected(format!("duplicate id {}", row.id)));
        }
        rows.push(row.clone());
        Ok(())
    }

    async fn query_all(&self, table: &str) -> Result<Vec<StorageRow>, StoreError> {
        validate_table_name(table)?;
        Ok(self
            .tables
            .lock()
            .await
            .get(table)
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Debug, Clone)]
pub struct PgRowStore {
    pool: PgPool,
}

impl PgRowStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl RowStore for PgRowStore {
    async fn insert_row(&self, table: &str, row: &StorageRow) -> Result<(), StoreError> {
        validate_table_name(table)?;
        let payload = serde_json::to_value(&row.raw_payload)
            .map_err(|e| StoreError::Rejected(format!("raw payload: {e}")))?;
        let sql = format!(
            r#"
            INSERT INTO {table}
                (id, filename, uploaded_at, survey_date, survey_time, coordinates,
                 district, state, taluka, village, grid_id, gcp_id,
                 juliflora_count, other_species, juliflora_density, photos, raw_payload)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#
        );
        sqlx::query(&sql)
            .bind(row.id)
            .bind(&row.filename)
            .bind(row.uploaded_at)
            .bind(&row.survey_date)
            .bind(&row.survey_time)
            .bind(&row.coordinates)
            .bind(&row.district)
            .bind(&row.state)
            .bind(&row.taluka)
            .bind(&row.village)
            .bind(&row.grid_id)
            .bind(&row.gcp_id)
            .bind(row.juliflora_count)
            .bind(&row.other_species)
            .bind(row.juliflora_density)
            .bind(&row.photos)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn query_all(&self, table: &str) -> Result<Vec<StorageRow>, StoreError> {
        validate_table_name(table)?;
        let sql = format!(
            r#"
            SELECT id, filename, uploaded_at, survey_date, survey_time, coordinates,
                   district, state, taluka, village, grid_id, gcp_id,
                   juliflora_count, other_species, juliflora_density, photos, raw_payload
              FROM {table}
             ORDER BY seq
            "#
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let payload: serde_json::Value = row.try_get("raw_payload")?;
            let raw_payload: RawPayload =
                serde_json::from_value(payload).map_err(|e| StoreError::Decode(e.to_string()))?;
            out.push(StorageRow {
                id: row.try_get("id")?,
                filename: row.try_get("filename")?,
                uploaded_at: row.try_get("uploaded_at")?,
                survey_date: row.try_get("survey_date")?,
                survey_time: row.try_get("survey_time")?,
                coordinates: row.try_get("coordinates")?,
                district: row.try_get("district")?,
                state: row.try_get("state")?,
                taluka: row.try_get("taluka")?,
                village: row.try_get("village")?,
                grid_id: row.try_get("grid_id")?,
                gcp_id: row.try_get("gcp_id")?,
                juliflora_count: row.try_get("juliflora_count")?,
                other_species: row.try_get("other_species")?,
                juliflora_density: row.try_get("juliflora_density")?,
                photos: row.try_get("photos")?,
                raw_payload,
            });
        }
        Ok(out)
    }
}
