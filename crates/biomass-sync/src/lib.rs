//! Source registry, fan-out loading, CSV ingestion and refresh runs.

use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, Float64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use biomass_adapters::{
    decode_csv_bytes, known_aliases, load_source, map_display_row, map_storage_row,
    sheet_candidates, CsvParseError, CsvParser, ParseWarning, SourceFetcher, SOURCE_REGION_KEY,
};
use biomass_core::{
    CandidateKind, CanonicalRow, RegionHierarchy, RetrievalCandidate, SourceDescriptor,
};
use biomass_query::RegionScope;
use biomass_storage::{CsvArchive, HttpClientConfig, HttpFetcher, RowStore, StoreError};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strsim::jaro_winkler;
use thiserror::Error;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "biomass-sync";

/// Unmapped headers at or above this similarity get a "did you mean" hint.
pub const ALIAS_SIMILARITY_THRESHOLD: f64 = 0.9;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub archive_dir: PathBuf,
    pub scheduler_enabled: bool,
    pub refresh_cron: String,
    pub user_agent: String,
    pub fetch_timeout_secs: u64,
    pub upload_table: String,
    pub web_port: u16,
    pub workspace_root: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            archive_dir: PathBuf::from("./archive"),
            scheduler_enabled: false,
            refresh_cron: "0 0 6 * * *".to_string(),
            user_agent: "biomass-dashboard/0.1".to_string(),
            fetch_timeout_secs: 20,
            upload_table: "uploaded_csv".to_string(),
            web_port: 8000,
            workspace_root: PathBuf::from("."),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            archive_dir: std::env::var("BIOMASS_ARCHIVE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.archive_dir),
            scheduler_enabled: std::env::var("BIOMASS_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.scheduler_enabled),
            refresh_cron: std::env::var("BIOMASS_REFRESH_CRON").unwrap_or(defaults.refresh_cron),
            user_agent: std::env::var("BIOMASS_USER_AGENT").unwrap_or(defaults.user_agent),
            fetch_timeout_secs: std::env::var("BIOMASS_FETCH_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.fetch_timeout_secs),
            upload_table: std::env::var("BIOMASS_UPLOAD_TABLE").unwrap_or(defaults.upload_table),
            web_port: std::env::var("BIOMASS_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.web_port),
            workspace_root: defaults.workspace_root,
        }
    }

    pub fn sources_path(&self) -> PathBuf {
        self.workspace_root.join("sources.yaml")
    }

    pub fn strategy_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs.max(1))
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.strategy_timeout(),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }

    /// Source fetcher over the shared HTTP client.
    pub fn build_fetcher(&self) -> Result<SourceFetcher> {
        let http = HttpFetcher::new(self.http_client_config())?;
        Ok(SourceFetcher::new(Arc::new(http), self.strategy_timeout()))
    }
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Spreadsheet export link; expands to export, alternate-format and relay candidates.
    #[serde(default)]
    pub sheet_export_url: Option<String>,
    #[serde(default)]
    pub urls: Vec<String>,
    /// Local CSV, relative to the workspace root.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SourceConfig {
    pub fn display_name(&self) -> &str {
        if self.display_name.trim().is_empty() {
            &self.source_id
        } else {
            &self.display_name
        }
    }

    /// Candidates in priority order: sheet-derived, explicit URLs, then the local file.
    pub fn descriptor(&self, workspace_root: &Path) -> SourceDescriptor {
        let mut candidates = Vec::new();
        if let Some(url) = &self.sheet_export_url {
            candidates.extend(sheet_candidates(url));
        }
        candidates.extend(
            self.urls
                .iter()
                .map(|u| RetrievalCandidate::new(CandidateKind::Explicit, u.clone())),
        );
        if let Some(path) = &self.path {
            candidates.push(RetrievalCandidate::new(
                CandidateKind::LocalFile,
                workspace_root.join(path).display().to_string(),
            ));
        }
        SourceDescriptor {
            source_id: self.source_id.clone(),
            display_name: self.display_name().to_string(),
            candidates,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub regions: RegionHierarchy,
}

impl SourceRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing source registry")
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    pub fn find(&self, source_id: &str) -> Option<&SourceConfig> {
        self.enabled()
            .find(|s| s.source_id.eq_ignore_ascii_case(source_id.trim()))
    }

    /// No district: every source. District: its talukas. Taluka: that source.
    pub fn resolve(&self, scope: &RegionScope) -> Vec<&SourceConfig> {
        match scope {
            RegionScope::All => self.enabled().collect(),
            RegionScope::District(district) => self
                .regions
                .talukas_of(district)
                .iter()
                .filter_map(|taluka| self.find(taluka))
                .collect(),
            RegionScope::Taluka(taluka) => self.find(taluka).into_iter().collect(),
        }
    }
}

fn describe_scope(scope: &RegionScope) -> String {
    match scope {
        RegionScope::All => "all regions".to_string(),
        RegionScope::District(d) => format!("district {d}"),
        RegionScope::Taluka(t) => format!("taluka {t}"),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeaderDiagnostic {
    pub header: String,
    pub closest_alias: Option<String>,
    pub similarity: f64,
}

/// Headers no alias table knows about, with the nearest alias when it is close.
pub fn unmapped_headers(headers: &[String]) -> Vec<HeaderDiagnostic> {
    headers
        .iter()
        .filter(|h| h.as_str() != SOURCE_REGION_KEY && !known_aliases().any(|a| a == h.as_str()))
        .map(|header| {
            let lowered = header.to_lowercase();
            let best = known_aliases()
                .map(|alias| (alias, jaro_winkler(&lowered, &alias.to_lowercase())))
                .max_by(|a, b| a.1.total_cmp(&b.1));
            let (closest_alias, similarity) = match best {
                Some((alias, score)) if score >= ALIAS_SIMILARITY_THRESHOLD => {
                    (Some(alias.to_string()), score)
                }
                Some((_, score)) => (None, score),
                None => (None, 0.0),
            };
            HeaderDiagnostic {
                header: header.clone(),
                closest_alias,
                similarity,
            }
        })
        .collect()
}

fn log_unmapped(origin: &str, diagnostics: &[HeaderDiagnostic]) {
    for diag in diagnostics {
        match &diag.closest_alias {
            Some(alias) => warn!(
                origin,
                header = %diag.header,
                closest = %alias,
                similarity = diag.similarity,
                "unmapped header looks like a known column"
            ),
            None => debug!(origin, header = %diag.header, "header kept in raw payload only"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceFailure {
    pub source_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureList(pub Vec<SourceFailure>);

impl fmt::Display for FailureList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}: {}", failure.source_id, failure.reason)?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ScopeError {
    #[error("no sources registered for {scope}")]
    NoSources { scope: String },
    #[error("every source failed ({failures}); upload a local CSV file instead")]
    AllSourcesFailed { failures: FailureList },
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadedSource {
    pub source_id: String,
    pub strategy: CandidateKind,
    pub location: String,
    pub fetched_at: DateTime<Utc>,
    pub row_count: usize,
    pub warnings: Vec<ParseWarning>,
    pub unmapped_headers: Vec<HeaderDiagnostic>,
    #[serde(skip)]
    pub csv_text: String,
}

/// Union of whatever sources in a scope loaded.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScopeOutcome {
    pub rows: Vec<CanonicalRow>,
    pub loaded: Vec<LoadedSource>,
    pub empty: Vec<String>,
    pub failed: Vec<SourceFailure>,
}

/// Fetches every source in scope concurrently. Fails only when nothing in scope succeeded.
pub async fn load_scope(
    fetcher: &SourceFetcher,
    parser: &CsvParser,
    registry: &SourceRegistry,
    scope: &RegionScope,
    workspace_root: &Path,
) -> Result<ScopeOutcome, ScopeError> {
    let descriptors: Vec<SourceDescriptor> = registry
        .resolve(scope)
        .into_iter()
        .map(|s| s.descriptor(workspace_root))
        .collect();
    if descriptors.is_empty() {
        return Err(ScopeError::NoSources {
            scope: describe_scope(scope),
        });
    }

    let results = join_all(descriptors.iter().map(|d| load_source(fetcher, parser, d))).await;

    let mut outcome = ScopeOutcome::default();
    for (descriptor, result) in descriptors.iter().zip(results) {
        match result {
            Ok(load) => {
                let diagnostics = unmapped_headers(&load.headers);
                log_unmapped(&load.source_id, &diagnostics);
                outcome.loaded.push(LoadedSource {
                    source_id: load.source_id,
                    strategy: load.candidate.kind,
                    location: load.candidate.location,
                    fetched_at: load.fetched_at,
                    row_count: load.rows.len(),
                    warnings: load.warnings,
                    unmapped_headers: diagnostics,
                    csv_text: load.csv_text,
                });
                outcome.rows.extend(load.rows);
            }
            Err(err) if !err.is_fatal() => {
                info!(source_id = %descriptor.source_id, "source returned no rows");
                outcome.empty.push(descriptor.source_id.clone());
            }
            Err(err) => {
                warn!(source_id = %descriptor.source_id, error = %err, "source failed; continuing with the rest");
                outcome.failed.push(SourceFailure {
                    source_id: descriptor.source_id.clone(),
                    reason: err.to_string(),
                });
            }
        }
    }

    if outcome.loaded.is_empty() && outcome.empty.is_empty() {
        return Err(ScopeError::AllSourcesFailed {
            failures: FailureList(outcome.failed),
        });
    }

    info!(
        scope = %describe_scope(scope),
        rows = outcome.rows.len(),
        loaded = outcome.loaded.len(),
        failed = outcome.failed.len(),
        "scope loaded"
    );
    Ok(outcome)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeTicket(u64);

/// Generation counter; only the most recently issued ticket may apply its result.
#[derive(Debug, Default)]
pub struct ScopeTracker {
    generation: AtomicU64,
}

impl ScopeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) -> ScopeTicket {
        ScopeTicket(self.generation.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn is_current(&self, ticket: ScopeTicket) -> bool {
        self.generation.load(Ordering::SeqCst) == ticket.0
    }

    /// Hands the value back only if no newer scope request began since `ticket`.
    pub fn accept<T>(&self, ticket: ScopeTicket, value: T) -> Option<T> {
        if self.is_current(ticket) {
            Some(value)
        } else {
            debug!(ticket = ticket.0, "discarding stale scope result");
            None
        }
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("{filename} is not a .csv file")]
    UnsupportedFormat { filename: String },
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{filename}: {source}")]
    Parse {
        filename: String,
        #[source]
        source: CsvParseError,
    },
    #[error("{filename} contains no data rows")]
    EmptyResult { filename: String },
}

impl IngestError {
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::EmptyResult { .. })
    }
}

pub fn ensure_csv_filename(filename: &str) -> Result<(), IngestError> {
    let is_csv = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("csv"));
    if is_csv {
        Ok(())
    } else {
        Err(IngestError::UnsupportedFormat {
            filename: filename.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowFailure {
    /// 0-based data row.
    pub row_index: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub filename: String,
    pub table: String,
    pub inserted_count: usize,
    pub failures: Vec<RowFailure>,
    pub warnings: Vec<ParseWarning>,
    pub unmapped_headers: Vec<HeaderDiagnostic>,
}

/// Parses uploaded CSV files and appends each row to the store independently.
#[derive(Clone)]
pub struct IngestionPipeline {
    store: Arc<dyn RowStore>,
    parser: CsvParser,
    table: String,
}

impl IngestionPipeline {
    pub fn new(store: Arc<dyn RowStore>, table: impl Into<String>) -> Self {
        Self {
            store,
            parser: CsvParser::default(),
            table: table.into(),
        }
    }

    pub fn with_parser(mut self, parser: CsvParser) -> Self {
        self.parser = parser;
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub async fn ingest_file(&self, path: &Path) -> Result<IngestReport, IngestError> {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        ensure_csv_filename(&filename)?;
        let bytes = fs::read(path).await.map_err(|source| IngestError::Io {
            path: path.display().to_string(),
            source,
        })?;
        self.ingest_bytes(&filename, &bytes).await
    }

    /// Non-UTF-8 uploads are decoded as Windows-1252 and flagged in the report warnings.
    pub async fn ingest_bytes(&self, filename: &str, bytes: &[u8]) -> Result<IngestReport, IngestError> {
        ensure_csv_filename(filename)?;
        let (text, encoding_warning) = decode_csv_bytes(bytes);
        if let Some(warning) = &encoding_warning {
            warn!(filename, message = %warning.message, "upload is not UTF-8");
        }
        self.ingest_text(filename, &text, encoding_warning).await
    }

    /// Row insert failures are collected, never raised; the batch is not atomic.
    pub async fn ingest_csv(&self, filename: &str, text: &str) -> Result<IngestReport, IngestError> {
        ensure_csv_filename(filename)?;
        self.ingest_text(filename, text, None).await
    }

    async fn ingest_text(
        &self,
        filename: &str,
        text: &str,
        encoding_warning: Option<ParseWarning>,
    ) -> Result<IngestReport, IngestError> {
        let parsed = self.parser.parse(text).map_err(|source| IngestError::Parse {
            filename: filename.to_string(),
            source,
        })?;
        if parsed.records.is_empty() {
            return Err(IngestError::EmptyResult {
                filename: filename.to_string(),
            });
        }

        let diagnostics = unmapped_headers(&parsed.headers);
        log_unmapped(filename, &diagnostics);

        let uploaded_at = Utc::now();
        let mut report = IngestReport {
            filename: filename.to_string(),
            table: self.table.clone(),
            inserted_count: 0,
            failures: Vec::new(),
            warnings: encoding_warning.into_iter().chain(parsed.warnings).collect(),
            unmapped_headers: diagnostics,
        };

        for (row_index, raw) in parsed.records.iter().enumerate() {
            let row = map_storage_row(raw, filename, uploaded_at);
            match self.store.insert_row(&self.table, &row).await {
                Ok(()) => report.inserted_count += 1,
                Err(err) => {
                    warn!(filename, row_index, error = %err, "row insert failed; continuing");
                    report.failures.push(RowFailure {
                        row_index,
                        reason: err.to_string(),
                    });
                }
            }
        }

        info!(
            filename,
            table = %self.table,
            inserted = report.inserted_count,
            failed = report.failures.len(),
            "ingestion finished"
        );
        Ok(report)
    }

    /// One outcome per input, in order. A bad file never stops the others.
    pub async fn ingest_many<P: AsRef<Path>>(
        &self,
        paths: &[P],
    ) -> Vec<Result<IngestReport, IngestError>> {
        let mut out = Vec::with_capacity(paths.len());
        for path in paths {
            let result = self.ingest_file(path.as_ref()).await;
            if let Err(err) = &result {
                warn!(path = %path.as_ref().display(), error = %err, "file skipped");
            }
            out.push(result);
        }
        out
    }

    pub async fn working_set(&self) -> Result<Vec<CanonicalRow>, StoreError> {
        working_set_from_store(self.store.as_ref(), &self.table).await
    }
}

/// Stored rows re-mapped to display rows, tagged with the file they came from.
pub async fn working_set_from_store(
    store: &dyn RowStore,
    table: &str,
) -> Result<Vec<CanonicalRow>, StoreError> {
    let rows = store.query_all(table).await?;
    Ok(rows
        .iter()
        .map(|row| map_display_row(&row.raw_record(), &row.filename))
        .collect())
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub enabled_sources: usize,
    pub loaded_sources: Vec<LoadedSource>,
    pub empty_sources: Vec<String>,
    pub failed_sources: Vec<SourceFailure>,
    pub rows: usize,
    pub archived_csv: Vec<String>,
    pub reports_dir: String,
    pub parquet_manifest: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Fetches every enabled source, archives the raw CSV and writes a run report.
pub struct RefreshPipeline {
    config: SyncConfig,
    registry: SourceRegistry,
    fetcher: SourceFetcher,
    parser: CsvParser,
    archive: CsvArchive,
}

impl RefreshPipeline {
    pub fn new(config: SyncConfig, registry: SourceRegistry) -> Result<Self> {
        let fetcher = config.build_fetcher()?;
        Ok(Self::with_fetcher(config, registry, fetcher))
    }

    pub fn with_fetcher(config: SyncConfig, registry: SourceRegistry, fetcher: SourceFetcher) -> Self {
        let archive = CsvArchive::new(config.archive_dir.clone());
        Self {
            config,
            registry,
            fetcher,
            parser: CsvParser::default(),
            archive,
        }
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub async fn run_once(&self) -> Result<RefreshSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        let outcome = load_scope(
            &self.fetcher,
            &self.parser,
            &self.registry,
            &RegionScope::All,
            &self.config.workspace_root,
        )
        .await
        .context("loading enabled sources")?;

        let mut archived_csv = Vec::new();
        for loaded in &outcome.loaded {
            let stored = self
                .archive
                .archive(loaded.fetched_at, &loaded.source_id, &loaded.csv_text)
                .await?;
            archived_csv.push(stored.relative_path.display().to_string());
        }

        let reports_dir = self
            .config
            .workspace_root
            .join("reports")
            .join(run_id.to_string());
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;
        let manifest_path = self.export_parquet_snapshots(&reports_dir, &outcome).await?;

        let summary = RefreshSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            enabled_sources: self.registry.enabled().count(),
            rows: outcome.rows.len(),
            loaded_sources: outcome.loaded,
            empty_sources: outcome.empty,
            failed_sources: outcome.failed,
            archived_csv,
            reports_dir: reports_dir.display().to_string(),
            parquet_manifest: manifest_path.display().to_string(),
        };

        let bytes = serde_json::to_vec_pretty(&summary).context("serializing run summary")?;
        fs::write(reports_dir.join("summary.json"), bytes)
            .await
            .context("writing summary.json")?;

        info!(run_id = %summary.run_id, rows = summary.rows, "refresh run finished");
        Ok(summary)
    }

    async fn export_parquet_snapshots(
        &self,
        reports_dir: &Path,
        outcome: &ScopeOutcome,
    ) -> Result<PathBuf> {
        let snapshot_dir = reports_dir.join("snapshots");
        fs::create_dir_all(&snapshot_dir)
            .await
            .with_context(|| format!("creating {}", snapshot_dir.display()))?;

        let rows_path = snapshot_dir.join("rows.parquet");
        let sources_path = snapshot_dir.join("sources.parquet");
        write_rows_parquet(&rows_path, &outcome.rows)?;
        write_sources_parquet(&sources_path, &self.registry, outcome)?;

        let manifest = ParquetManifest {
            schema_version: 1,
            files: vec![
                manifest_entry("rows", reports_dir, &rows_path)?,
                manifest_entry("sources", reports_dir, &sources_path)?,
            ],
        };

        let manifest_path = snapshot_dir.join("manifest.json");
        let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
        fs::write(&manifest_path, bytes)
            .await
            .with_context(|| format!("writing {}", manifest_path.display()))?;
        Ok(manifest_path)
    }
}

/// Cron job running [`RefreshPipeline::run_once`]; `None` when scheduling is off.
pub async fn build_refresh_scheduler(pipeline: Arc<RefreshPipeline>) -> Result<Option<JobScheduler>> {
    if !pipeline.config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = pipeline.config.refresh_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            match pipeline.run_once().await {
                Ok(summary) => info!(run_id = %summary.run_id, rows = summary.rows, "scheduled refresh finished"),
                Err(err) => warn!(error = %err, "scheduled refresh failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

pub async fn run_refresh_from_env() -> Result<RefreshSummary> {
    let config = SyncConfig::from_env();
    let registry = SourceRegistry::load(&config.sources_path()).await?;
    RefreshPipeline::new(config, registry)?.run_once().await
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_rows_parquet(path: &Path, rows: &[CanonicalRow]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("source_id", DataType::Utf8, false),
        ArrowField::new("village", DataType::Utf8, true),
        ArrowField::new("taluka", DataType::Utf8, true),
        ArrowField::new("district", DataType::Utf8, true),
        ArrowField::new("state", DataType::Utf8, true),
        ArrowField::new("density_category", DataType::Utf8, true),
        ArrowField::new("quantity_per_hectare", DataType::Float64, true),
        ArrowField::new("biomass_range", DataType::Utf8, true),
    ]));

    let text_column = |get: fn(&CanonicalRow) -> Option<&str>| {
        StringArray::from(rows.iter().map(get).collect::<Vec<_>>())
    };

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(text_column(|r| Some(r.source_id()))),
            Arc::new(text_column(|r| r.village.as_deref())),
            Arc::new(text_column(|r| r.taluka.as_deref())),
            Arc::new(text_column(|r| r.district.as_deref())),
            Arc::new(text_column(|r| r.state.as_deref())),
            Arc::new(text_column(|r| r.density_category.as_deref())),
            Arc::new(Float64Array::from(
                rows.iter().map(|r| r.quantity_per_hectare).collect::<Vec<_>>(),
            )),
            Arc::new(text_column(|r| r.biomass_range.as_deref())),
        ],
    )
    .context("building rows record batch")?;
    write_parquet(path, batch)
}

fn write_sources_parquet(path: &Path, registry: &SourceRegistry, outcome: &ScopeOutcome) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("source_id", DataType::Utf8, false),
        ArrowField::new("display_name", DataType::Utf8, false),
        ArrowField::new("enabled", DataType::Boolean, false),
        ArrowField::new("status", DataType::Utf8, false),
        ArrowField::new("row_count", DataType::UInt32, false),
    ]));

    let status_of = |source: &SourceConfig| -> (&'static str, u32) {
        if !source.enabled {
            return ("disabled", 0);
        }
        if let Some(loaded) = outcome.loaded.iter().find(|l| l.source_id == source.source_id) {
            return ("loaded", u32::try_from(loaded.row_count).unwrap_or(u32::MAX));
        }
        if outcome.empty.iter().any(|s| *s == source.source_id) {
            return ("empty", 0);
        }
        ("failed", 0)
    };
    let statuses: Vec<(&str, u32)> = registry.sources.iter().map(status_of).collect();

    let source_ids = StringArray::from(
        registry
            .sources
            .iter()
            .map(|s| Some(s.source_id.as_str()))
            .collect::<Vec<_>>(),
    );
    let display_names = StringArray::from(
        registry
            .sources
            .iter()
            .map(|s| Some(s.display_name()))
            .collect::<Vec<_>>(),
    );
    let enabled = BooleanArray::from(registry.sources.iter().map(|s| s.enabled).collect::<Vec<_>>());
    let status = StringArray::from(statuses.iter().map(|(s, _)| Some(*s)).collect::<Vec<_>>());
    let row_counts = UInt32Array::from(statuses.iter().map(|(_, n)| *n).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(source_ids),
            Arc::new(display_names),
            Arc::new(enabled),
            Arc::new(status),
            Arc::new(row_counts),
        ],
    )
    .context("building sources record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}
