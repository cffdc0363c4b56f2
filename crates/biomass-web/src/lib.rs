//! Axum JSON API and Askama table partial over the query engine.

use std::sync::Arc;

use anyhow::Context;
use askama::Template;
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use biomass_adapters::{CsvParser, SourceFetcher};
use biomass_core::{CanonicalField, CanonicalRow, RegionHierarchy, RetrievalCandidate};
use biomass_query::{
    export_csv, facets, select, FilterState, RegionScope, SortDirection, ViewSummary,
};
use biomass_storage::{MemoryRowStore, PgRowStore, RowStore};
use biomass_sync::{
    load_scope, working_set_from_store, IngestError, IngestReport, IngestionPipeline,
    ScopeError, ScopeOutcome, ScopeTracker, SourceFailure, SourceRegistry, SyncConfig,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "biomass-web";

struct CachedScope {
    scope: RegionScope,
    outcome: ScopeOutcome,
}

pub struct AppState {
    config: SyncConfig,
    registry: SourceRegistry,
    fetcher: SourceFetcher,
    parser: CsvParser,
    store: Arc<dyn RowStore>,
    ingest: IngestionPipeline,
    tracker: ScopeTracker,
    cache: Mutex<Option<CachedScope>>,
}

impl AppState {
    pub fn new(
        config: SyncConfig,
        registry: SourceRegistry,
        fetcher: SourceFetcher,
        store: Arc<dyn RowStore>,
    ) -> Self {
        let ingest = IngestionPipeline::new(store.clone(), config.upload_table.clone());
        Self {
            config,
            registry,
            fetcher,
            parser: CsvParser::default(),
            store,
            ingest,
            tracker: ScopeTracker::new(),
            cache: Mutex::new(None),
        }
    }

    /// Registry from `sources.yaml`, Postgres when `DATABASE_URL` is set, memory otherwise.
    pub async fn from_config(config: SyncConfig) -> anyhow::Result<Self> {
        let registry = SourceRegistry::load(&config.sources_path()).await?;
        let fetcher = config.build_fetcher()?;
        let store: Arc<dyn RowStore> = match &config.database_url {
            Some(url) => Arc::new(
                PgRowStore::connect(url)
                    .await
                    .context("connecting to database")?,
            ),
            None => {
                info!("DATABASE_URL not set; uploads are kept in memory");
                Arc::new(MemoryRowStore::new())
            }
        };
        Ok(Self::new(config, registry, fetcher, store))
    }

    fn regions(&self) -> &RegionHierarchy {
        &self.registry.regions
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RowsQuery {
    pub district: Option<String>,
    pub taluka: Option<String>,
    pub search: Option<String>,
    pub village: Option<String>,
    pub density_category: Option<String>,
    pub biomass_range: Option<String>,
    pub quantity_range: Option<String>,
    pub sort: Option<String>,
    pub direction: Option<String>,
    #[serde(default)]
    pub refresh: bool,
}

impl RowsQuery {
    pub fn filter_state(&self, regions: &RegionHierarchy) -> FilterState {
        let mut state = FilterState::default()
            .with_district(self.district.clone(), regions)
            .with_taluka(self.taluka.clone(), regions)
            .with_search(self.search.clone())
            .with_village(self.village.clone())
            .with_density_category(self.density_category.clone())
            .with_biomass_range(self.biomass_range.clone())
            .with_quantity_range(self.quantity_range.clone());

        if let Some(field) = self
            .sort
            .as_deref()
            .and_then(|s| s.parse::<CanonicalField>().ok())
        {
            state = state.toggle_sort(field);
            if self
                .direction
                .as_deref()
                .is_some_and(|d| d.eq_ignore_ascii_case("desc"))
            {
                state = state.toggle_sort(field);
            }
        }
        state
    }
}

#[derive(Debug, Deserialize)]
struct UploadQuery {
    filename: String,
}

#[derive(Debug, Serialize)]
struct RowsResponse {
    filter: FilterState,
    summary: ViewSummary,
    failed_sources: Vec<SourceFailure>,
    empty_sources: Vec<String>,
    rows: Vec<CanonicalRow>,
}

#[derive(Debug, Serialize)]
struct SourceSummary {
    source_id: String,
    display_name: String,
    enabled: bool,
    candidates: Vec<RetrievalCandidate>,
}

#[derive(Debug, Serialize)]
struct SourcesResponse {
    sources: Vec<SourceSummary>,
    regions: RegionHierarchy,
}

struct ColumnHeader {
    key: &'static str,
    label: &'static str,
    indicator: &'static str,
}

#[derive(Template)]
#[template(path = "rows_table.html")]
struct RowsTableTemplate {
    columns: Vec<ColumnHeader>,
    rows: Vec<Vec<String>>,
    shown: usize,
    total: usize,
    failed: Vec<SourceFailure>,
}

struct WorkingSet {
    rows: Vec<CanonicalRow>,
    failed: Vec<SourceFailure>,
    empty: Vec<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/rows", get(rows_handler))
        .route("/rows/table", get(rows_table_handler))
        .route("/api/facets", get(facets_handler))
        .route("/api/sources", get(sources_handler))
        .route("/export.csv", get(export_handler))
        .route("/upload", post(upload_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "serving biomass dashboard");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let port = config.web_port;
    serve(AppState::from_config(config).await?, port).await
}

/// Rows for a region scope. Only the newest request may replace the cache.
async fn scope_rows(
    app: &AppState,
    scope: RegionScope,
    refresh: bool,
) -> Result<ScopeOutcome, ScopeError> {
    if !refresh {
        if let Some(cached) = app.cache.lock().await.as_ref().filter(|c| c.scope == scope) {
            return Ok(cached.outcome.clone());
        }
    }

    let ticket = app.tracker.begin();
    let outcome = match load_scope(
        &app.fetcher,
        &app.parser,
        &app.registry,
        &scope,
        &app.config.workspace_root,
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(ScopeError::NoSources { .. }) => ScopeOutcome::default(),
        Err(err) => return Err(err),
    };

    if let Some(fresh) = app.tracker.accept(ticket, outcome.clone()) {
        *app.cache.lock().await = Some(CachedScope {
            scope,
            outcome: fresh,
        });
    }
    Ok(outcome)
}

async fn working_set(app: &AppState, filter: &FilterState, refresh: bool) -> Result<WorkingSet, ScopeError> {
    let outcome = scope_rows(app, filter.scope(), refresh).await?;
    let mut set = WorkingSet {
        rows: outcome.rows,
        failed: outcome.failed,
        empty: outcome.empty,
    };

    match working_set_from_store(app.store.as_ref(), &app.config.upload_table).await {
        Ok(uploaded) => set.rows.extend(uploaded),
        Err(err) => {
            warn!(error = %err, "uploaded rows unavailable");
            set.failed.push(SourceFailure {
                source_id: "uploads".to_string(),
                reason: err.to_string(),
            });
        }
    }
    Ok(set)
}

async fn rows_handler(State(app): State<Arc<AppState>>, Query(query): Query<RowsQuery>) -> Response {
    let filter = query.filter_state(app.regions());
    match working_set(&app, &filter, query.refresh).await {
        Ok(set) => {
            let selected: Vec<CanonicalRow> = select(&set.rows, &filter, app.regions())
                .into_iter()
                .cloned()
                .collect();
            Json(RowsResponse {
                summary: ViewSummary::new(selected.len(), set.rows.len()),
                filter,
                failed_sources: set.failed,
                empty_sources: set.empty,
                rows: selected,
            })
            .into_response()
        }
        Err(err) => scope_error(err),
    }
}

async fn rows_table_handler(
    State(app): State<Arc<AppState>>,
    Query(query): Query<RowsQuery>,
) -> Response {
    let filter = query.filter_state(app.regions());
    let set = match working_set(&app, &filter, query.refresh).await {
        Ok(set) => set,
        Err(err) => {
            return (StatusCode::BAD_GATEWAY, Html(format!("<p class=\"error\">{err}</p>")))
                .into_response()
        }
    };
    let selected = select(&set.rows, &filter, app.regions());

    let columns = CanonicalField::ALL
        .iter()
        .map(|field| ColumnHeader {
            key: field.as_str(),
            label: field.label(),
            indicator: match filter.sort {
                Some(s) if s.field == *field && s.direction == SortDirection::Asc => " ▲",
                Some(s) if s.field == *field => " ▼",
                _ => "",
            },
        })
        .collect();
    let rows = selected
        .iter()
        .map(|row| {
            CanonicalField::ALL
                .iter()
                .map(|f| row.value(*f).unwrap_or_default())
                .collect()
        })
        .collect();

    let mut resp = render_html(RowsTableTemplate {
        columns,
        rows,
        shown: selected.len(),
        total: set.rows.len(),
        failed: set.failed,
    });
    resp.headers_mut().insert(
        header::HeaderName::from_static("hx-trigger"),
        header::HeaderValue::from_static("rowsTableLoaded"),
    );
    resp
}

async fn facets_handler(State(app): State<Arc<AppState>>, Query(query): Query<RowsQuery>) -> Response {
    let filter = query.filter_state(app.regions());
    match working_set(&app, &filter, query.refresh).await {
        Ok(set) => Json(facets(&set.rows, &filter, app.regions())).into_response(),
        Err(err) => scope_error(err),
    }
}

async fn sources_handler(State(app): State<Arc<AppState>>) -> Response {
    let sources = app
        .registry
        .sources
        .iter()
        .map(|s| SourceSummary {
            source_id: s.source_id.clone(),
            display_name: s.display_name().to_string(),
            enabled: s.enabled,
            candidates: s.descriptor(&app.config.workspace_root).candidates,
        })
        .collect();
    Json(SourcesResponse {
        sources,
        regions: app.regions().clone(),
    })
    .into_response()
}

async fn export_handler(State(app): State<Arc<AppState>>, Query(query): Query<RowsQuery>) -> Response {
    let filter = query.filter_state(app.regions());
    let set = match working_set(&app, &filter, query.refresh).await {
        Ok(set) => set,
        Err(err) => return scope_error(err),
    };
    match export_csv(select(&set.rows, &filter, app.regions())) {
        Ok(csv) => (
            [
                (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
                (
                    header::CONTENT_DISPOSITION,
                    "attachment; filename=\"biomass_export.csv\"",
                ),
            ],
            csv,
        )
            .into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn upload_handler(
    State(app): State<Arc<AppState>>,
    Query(query): Query<UploadQuery>,
    body: Bytes,
) -> Response {
    let result: Result<IngestReport, IngestError> =
        app.ingest.ingest_bytes(&query.filename, &body).await;
    match result {
        Ok(report) => Json(report).into_response(),
        Err(err) => {
            let status = match &err {
                IngestError::UnsupportedFormat { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE,
                IngestError::EmptyResult { .. } => StatusCode::OK,
                IngestError::Parse { .. } | IngestError::Io { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            };
            (
                status,
                Json(serde_json::json!({
                    "error": err.to_string(),
                    "fatal": err.is_fatal(),
                })),
            )
                .into_response()
        }
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}

fn scope_error(err: ScopeError) -> Response {
    (
        StatusCode::BAD_GATEWAY,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body;
    use biomass_storage::{FetchError, FetchedResponse, TextTransport};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    const BHUJ_CSV: &str = include_str!("../../../fixtures/bhuj.csv");
    const SURVEY_CSV: &str = include_str!("../../../fixtures/survey_upload.csv");
    const LATIN1_CSV: &[u8] = include_bytes!("../../../fixtures/latin1_upload.csv");

    /// Serves the Bhuj fixture; the Nakhatrana sheet is always down.
    #[derive(Default)]
    struct SheetTransport {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TextTransport for SheetTransport {
        async fn get_text(&self, _source_id: &str, url: &str) -> Result<FetchedResponse, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if url.ends_with("bhuj.csv") {
                Ok(FetchedResponse {
                    status: 200,
                    final_url: url.to_string(),
                    body: BHUJ_CSV.to_string(),
                })
            } else {
                Err(FetchError::HttpStatus {
                    status: 500,
                    url: url.to_string(),
                })
            }
        }
    }

    const REGISTRY: &str = r#"
sources:
  - source_id: Bhuj
    urls: [https://sheets.test/bhuj.csv]
  - source_id: Nakhatrana
    urls: [https://sheets.test/nakhatrana.csv]
regions:
  Kutch: [Bhuj, Nakhatrana]
"#;

    fn test_app() -> (Router, Arc<SheetTransport>) {
        let transport = Arc::new(SheetTransport::default());
        let fetcher = SourceFetcher::new(transport.clone(), Duration::from_secs(1));
        let state = AppState::new(
            SyncConfig::default(),
            SourceRegistry::from_yaml_str(REGISTRY).unwrap(),
            fetcher,
            Arc::new(MemoryRowStore::new()),
        );
        (app(state), transport)
    }

    async fn get(app: &Router, uri: &str) -> (StatusCode, String) {
        let resp = app
            .clone()
            .oneshot(axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    async fn get_json(app: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let (status, text) = get(app, uri).await;
        (status, serde_json::from_str(&text).unwrap())
    }

    #[tokio::test]
    async fn rows_from_surviving_source_with_failure_listed() {
        let (app, _) = test_app();
        let (status, json) = get_json(&app, "/api/rows?district=Kutch").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["summary"]["shown"], 4);
        assert_eq!(json["failed_sources"][0]["source_id"], "Nakhatrana");
        let rows = json["rows"].as_array().unwrap();
        assert!(rows.iter().all(|r| r["source_id"] == "Bhuj"));
    }

    #[tokio::test]
    async fn search_and_range_filters_apply() {
        let (app, _) = test_app();
        let (_, json) = get_json(&app, "/api/rows?search=KUKMA").await;
        assert_eq!(json["rows"].as_array().unwrap().len(), 1);
        assert_eq!(json["rows"][0]["village"], "Kukma");

        let (_, json) = get_json(&app, "/api/rows?quantity_range=100-200&sort=quantity_per_hectare&direction=desc").await;
        let villages: Vec<&str> = json["rows"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["village"].as_str().unwrap())
            .collect();
        assert_eq!(villages, vec!["Kukma", "Lakhond"]);
        assert_eq!(json["filter"]["sort"]["direction"], "desc");
    }

    #[tokio::test]
    async fn unreachable_scope_is_a_bad_gateway() {
        let (app, _) = test_app();
        let (status, json) = get_json(&app, "/api/rows?taluka=Nakhatrana").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(json["error"].as_str().unwrap().contains("upload a local CSV"));
    }

    #[tokio::test]
    async fn same_scope_is_served_from_cache_until_refresh() {
        let (app, transport) = test_app();
        get(&app, "/api/rows?taluka=Bhuj").await;
        get(&app, "/api/rows?taluka=Bhuj&search=kukma").await;
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        get(&app, "/api/rows?taluka=Bhuj&refresh=true").await;
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn table_partial_renders_rows_and_sort_marker() {
        let (app, _) = test_app();
        let (status, html) = get(&app, "/rows/table?district=Kutch&sort=village").await;
        assert_eq!(status, StatusCode::OK);
        assert!(html.contains("Showing 4 of 4 rows"));
        assert!(html.contains("Village ▲"));
        assert!(html.contains("Nakhatrana"));
        let kukma = html.find("Kukma").unwrap();
        let sukhpar = html.find("Sukhpar").unwrap();
        assert!(kukma < sukhpar);
    }

    #[tokio::test]
    async fn facets_and_sources_endpoints() {
        let (app, _) = test_app();
        let (_, json) = get_json(&app, "/api/facets?district=Kutch&taluka=Bhuj").await;
        assert_eq!(json["talukas"], serde_json::json!(["Bhuj", "Nakhatrana"]));
        assert_eq!(
            json["villages"],
            serde_json::json!(["Kukma", "Lakhond", "Madhapar", "Sukhpar"])
        );

        let (_, json) = get_json(&app, "/api/sources").await;
        assert_eq!(json["sources"].as_array().unwrap().len(), 2);
        assert_eq!(json["regions"]["Kutch"][1], "Nakhatrana");
    }

    #[tokio::test]
    async fn export_is_csv_with_canonical_header() {
        let (app, _) = test_app();
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/export.csv?village=madhapar")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE].to_str().unwrap(),
            "text/csv; charset=utf-8"
        );
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "Village,Taluka,District,State,Density Category,Quantity per Hectare,Biomass Range",
                "Madhapar,Bhuj,Kutch,Gujarat,Low,45,0-50",
            ]
        );
    }

    #[tokio::test]
    async fn upload_rejects_non_csv_and_ingests_csv() {
        let (app, _) = test_app();
        let post = |uri: &str, body: &str| {
            axum::http::Request::builder()
                .method("POST")
                .uri(uri)
                .body(Body::from(body.to_string()))
                .unwrap()
        };

        let resp = app
            .clone()
            .oneshot(post("/upload?filename=survey.xlsx", SURVEY_CSV))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

        let resp = app
            .clone()
            .oneshot(post("/upload?filename=survey_upload.csv", SURVEY_CSV))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let report: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(report["inserted_count"], 3);

        let (_, json) = get_json(&app, "/api/rows?taluka=Bhuj&village=Lakhond").await;
        let sources: Vec<&str> = json["rows"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["source_id"].as_str().unwrap())
            .collect();
        assert_eq!(sources, vec!["Bhuj", "survey_upload.csv"]);
    }

    #[tokio::test]
    async fn latin1_upload_is_accepted_with_encoding_warning() {
        let (app, _) = test_app();
        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/upload?filename=latin1_upload.csv")
            .body(Body::from(LATIN1_CSV))
            .unwrap();
        let resp = app.clone().oneshot(request).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let report: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(report["inserted_count"], 2);
        assert_eq!(report["warnings"][0]["kind"], "Encoding");

        let (_, json) = get_json(&app, "/api/rows?search=caf").await;
        let villages: Vec<&str> = json["rows"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["village"].as_str().unwrap())
            .collect();
        assert_eq!(villages, vec!["Caf\u{e9}"]);
    }
}
