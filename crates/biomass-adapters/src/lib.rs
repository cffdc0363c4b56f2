//! CSV parsing, header reconciliation and multi-strategy source retrieval.

use std::sync::Arc;
use std::time::Duration;

use biomass_core::{
    clean, to_number, to_photo_list, CandidateKind, CanonicalRow, CellValue, RawRecord,
    RetrievalCandidate, SourceDescriptor, StorageRow,
};
use biomass_storage::{FetchError, FetchedResponse, TextTransport};
use chrono::{DateTime, Utc};
use csv::ReaderBuilder;
use encoding_rs::WINDOWS_1252;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "biomass-adapters";

/// Raw-record key the loader uses to tag rows with the region they were fetched for.
pub const SOURCE_REGION_KEY: &str = "_source_region";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseOptions {
    /// First row names the fields.
    pub header: bool,
    /// Drop rows whose cells are all blank.
    pub skip_empty_lines: bool,
    /// Coerce numeric and boolean looking cells.
    pub dynamic_typing: bool,
    /// Overrides delimiter detection.
    pub delimiter: Option<u8>,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            header: true,
            skip_empty_lines: true,
            dynamic_typing: true,
            delimiter: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParseWarningKind {
    DuplicateHeader,
    TooFewFields,
    TooManyFields,
    Encoding,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseWarning {
    /// 0-based data row, `None` for header-level warnings.
    pub row: Option<usize>,
    pub kind: ParseWarningKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParsedCsv {
    pub headers: Vec<String>,
    pub records: Vec<RawRecord>,
    pub warnings: Vec<ParseWarning>,
    pub delimiter: u8,
}

#[derive(Debug, Clone, Error)]
#[error("CSV parse error: {message}")]
pub struct CsvParseError {
    pub message: String,
}

/// Thin adapter over the `csv` reader with header, blank-row and typing options.
#[derive(Debug, Clone, Default)]
pub struct CsvParser {
    options: ParseOptions,
}

impl CsvParser {
    pub fn new(options: ParseOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ParseOptions {
        &self.options
    }

    pub fn parse(&self, text: &str) -> Result<ParsedCsv, CsvParseError> {
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        let delimiter = self
            .options
            .delimiter
            .unwrap_or_else(|| detect_delimiter(text));

        let mut reader = ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(false)
            .flexible(true)
            .from_reader(text.as_bytes());

        let mut out = ParsedCsv {
            delimiter,
            ..ParsedCsv::default()
        };
        let mut header_pending = self.options.header;
        let mut data_row = 0usize;

        for result in reader.records() {
            let record = result.map_err(|e| CsvParseError {
                message: e.to_string(),
            })?;

            let blank = record.iter().all(|cell| cell.trim().is_empty());
            if blank && (self.options.skip_empty_lines || header_pending) {
                continue;
            }

            if header_pending {
                out.headers = dedupe_headers(record.iter(), &mut out.warnings);
                header_pending = false;
                continue;
            }

            let mut raw = RawRecord::new();
            if self.options.header {
                let expected = out.headers.len();
                if record.len() < expected {
                    out.warnings.push(ParseWarning {
                        row: Some(data_row),
                        kind: ParseWarningKind::TooFewFields,
                        message: format!("expected {expected} fields, found {}", record.len()),
                    });
                } else if record.len() > expected {
                    out.warnings.push(ParseWarning {
                        row: Some(data_row),
                        kind: ParseWarningKind::TooManyFields,
                        message: format!(
                            "expected {expected} fields, found {}; extra fields dropped",
                            record.len()
                        ),
                    });
                }
                for (idx, header) in out.headers.iter().enumerate() {
                    let cell = record
                        .get(idx)
                        .map(|v| self.cell(v))
                        .unwrap_or(CellValue::Null);
                    raw.push(header.clone(), cell);
                }
            } else {
                for (idx, value) in record.iter().enumerate() {
                    raw.push(idx.to_string(), self.cell(value));
                }
            }

            out.records.push(raw);
            data_row += 1;
        }

        if !out.warnings.is_empty() {
            warn!(warnings = out.warnings.len(), "CSV parsed with warnings");
        }
        Ok(out)
    }

    fn cell(&self, value: &str) -> CellValue {
        if self.options.dynamic_typing {
            coerce_cell(value)
        } else {
            CellValue::Text(value.to_string())
        }
    }
}

fn dedupe_headers<'a>(
    names: impl Iterator<Item = &'a str>,
    warnings: &mut Vec<ParseWarning>,
) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for name in names {
        let base = name.trim().to_string();
        let mut candidate = base.clone();
        let mut n = 0;
        while out.contains(&candidate) {
            n += 1;
            candidate = format!("{base}_{n}");
        }
        if n > 0 {
            warnings.push(ParseWarning {
                row: None,
                kind: ParseWarningKind::DuplicateHeader,
                message: format!("duplicate header `{base}` renamed to `{candidate}`"),
            });
        }
        out.push(candidate);
    }
    out
}

/// Decodes CSV bytes as UTF-8, falling back to Windows-1252 for legacy spreadsheet exports.
pub fn decode_csv_bytes(bytes: &[u8]) -> (String, Option<ParseWarning>) {
    match std::str::from_utf8(bytes) {
        Ok(text) => (text.to_string(), None),
        Err(err) => {
            let (text, encoding, _) = WINDOWS_1252.decode(bytes);
            let warning = ParseWarning {
                row: None,
                kind: ParseWarningKind::Encoding,
                message: format!(
                    "input is not UTF-8 (invalid byte at offset {}); decoded as {}",
                    err.valid_up_to(),
                    encoding.name()
                ),
            };
            (text.into_owned(), Some(warning))
        }
    }
}

/// Numeric/boolean coercion. Zero-padded identifiers stay text.
pub fn coerce_cell(value: &str) -> CellValue {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return CellValue::Null;
    }
    match trimmed {
        "true" | "TRUE" | "True" => return CellValue::Bool(true),
        "false" | "FALSE" | "False" => return CellValue::Bool(false),
        _ => {}
    }

    let numeric_chars = trimmed
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E'));
    let digits = trimmed.trim_start_matches(['-', '+']);
    let zero_padded = digits.len() > 1 && digits.starts_with('0') && !digits.starts_with("0.");
    if !numeric_chars || zero_padded || !trimmed.chars().any(|c| c.is_ascii_digit()) {
        return CellValue::Text(value.to_string());
    }

    if let Ok(i) = trimmed.parse::<i64>() {
        return CellValue::Int(i);
    }
    match trimmed.parse::<f64>() {
        Ok(f) if f.is_finite() => CellValue::Float(f),
        _ => CellValue::Text(value.to_string()),
    }
}

/// Picks the separator whose per-line count is highest and most consistent.
pub fn detect_delimiter(text: &str) -> u8 {
    let sample: Vec<&str> = text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .take(10)
        .collect();
    if sample.is_empty() {
        return b',';
    }

    let mut best = b',';
    let mut best_score = 0.0f32;
    for candidate in [b',', b';', b'\t', b'|'] {
        let counts: Vec<f32> = sample
            .iter()
            .map(|line| line.bytes().filter(|&b| b == candidate).count() as f32)
            .collect();
        let avg = counts.iter().sum::<f32>() / counts.len() as f32;
        if avg == 0.0 {
            continue;
        }
        let variance = counts.iter().map(|c| (c - avg).powi(2)).sum::<f32>() / counts.len() as f32;
        let score = avg / (1.0 + variance.sqrt());
        if score > best_score {
            best_score = score;
            best = candidate;
        }
    }
    best
}

pub const VILLAGE_ALIASES: &[&str] = &[
    "Village",
    "village",
    "VILLAGE",
    "Village Name",
    "village name",
    "village_name",
    "Village_Name",
    "Villages",
];

pub const TALUKA_ALIASES: &[&str] = &[
    SOURCE_REGION_KEY,
    "Taluka",
    "taluka",
    "TALUKA",
    "Taluka Name",
    "taluka name",
    "taluka_name",
    "Taluka_Name",
    "Talukas",
];

pub const DISTRICT_ALIASES: &[&str] = &[
    "District",
    "district",
    "DISTRICT",
    "District Name",
    "district name",
    "district_name",
    "District_Name",
    "Districts",
    "districts",
];

pub const STATE_ALIASES: &[&str] = &["State", "state", "STATE", "State Name", "state_name"];

pub const DENSITY_CATEGORY_ALIASES: &[&str] = &[
    "Density_Category",
    "density_category",
    "DENSITY_CATEGORY",
    "Density Category",
    "density category",
    "Density Categories",
];

pub const QUANTITY_ALIASES: &[&str] = &[
    "Quantity_per_Hectare",
    "quantity_per_hectare",
    "Quantity per Hectare",
    "Quantity",
    "quantity",
    "Qty",
    "qty",
    "Biomass_Tons",
    "biomass_tons",
    "Biomass Tons",
    "Prosopis_Biomass_Tons",
    "prosopis_biomass_tons",
    "Prosopis_Biomass",
    "Prosopis Biomass",
];

pub const BIOMASS_RANGE_ALIASES: &[&str] = &[
    "Biomass_Range",
    "biomass_range",
    "BIOMASS_RANGE",
    "Biomass Range",
    "Fixed_Density_tons_per_ha",
    "fixed_density_tons_per_ha",
    "Fixed Density tons per ha",
];

pub const SURVEY_DATE_ALIASES: &[&str] = &["Date", "date", "DATE", "Survey Date", "survey_date"];
pub const SURVEY_TIME_ALIASES: &[&str] = &["Time", "time", "TIME", "Survey Time", "survey_time"];
pub const COORDINATES_ALIASES: &[&str] =
    &["Coordinates", "coordinates", "COORDINATES", "GPS", "gps", "Location"];
pub const GRID_ID_ALIASES: &[&str] = &["Grid-id", "Grid-ID", "Grid ID", "grid_id", "Grid_id", "GridId"];
pub const GCP_ID_ALIASES: &[&str] = &["GCP-id", "GCP-ID", "GCP ID", "gcp_id", "GCP_id"];
pub const JULIFLORA_COUNT_ALIASES: &[&str] = &[
    "Juliflora(count)",
    "Juliflora (count)",
    "Juliflora Count",
    "Juliflora_Count",
    "juliflora_count",
];
pub const OTHER_SPECIES_ALIASES: &[&str] =
    &["Other Species", "other_species", "Other_Species", "OTHER SPECIES"];
pub const JULIFLORA_DENSITY_ALIASES: &[&str] = &[
    "Juliflora Density(%)",
    "Juliflora Density (%)",
    "Juliflora Density",
    "Juliflora_Density",
    "juliflora_density",
];
pub const PHOTO_ALIASES: &[&str] = &[
    "Image", "image", "Images", "images", "Photo", "photo", "Photos", "photos",
];

/// Every header spelling the mapper understands, across both schemas.
pub fn known_aliases() -> impl Iterator<Item = &'static str> {
    [
        VILLAGE_ALIASES,
        TALUKA_ALIASES,
        DISTRICT_ALIASES,
        STATE_ALIASES,
        DENSITY_CATEGORY_ALIASES,
        QUANTITY_ALIASES,
        BIOMASS_RANGE_ALIASES,
        SURVEY_DATE_ALIASES,
        SURVEY_TIME_ALIASES,
        COORDINATES_ALIASES,
        GRID_ID_ALIASES,
        GCP_ID_ALIASES,
        JULIFLORA_COUNT_ALIASES,
        OTHER_SPECIES_ALIASES,
        JULIFLORA_DENSITY_ALIASES,
        PHOTO_ALIASES,
    ]
    .into_iter()
    .flatten()
    .copied()
}

/// First alias present in the record whose cleaned value is non-empty.
pub fn resolve<'a>(raw: &'a RawRecord, aliases: &[&str]) -> Option<&'a CellValue> {
    aliases
        .iter()
        .filter_map(|alias| raw.get(alias))
        .find(|value| clean(value).is_some())
}

fn resolve_text(raw: &RawRecord, aliases: &[&str]) -> Option<String> {
    resolve(raw, aliases).and_then(clean)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetSchema {
    Display,
    Storage,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MappedRow {
    Display(CanonicalRow),
    Storage(StorageRow),
}

/// Provenance inputs the mapper stamps onto rows.
#[derive(Debug, Clone)]
pub struct MapContext<'a> {
    pub source_id: &'a str,
    pub filename: &'a str,
    pub uploaded_at: DateTime<Utc>,
}

/// Never fails: fields that no alias resolves become null (0 for storage numerics).
pub fn map_row(raw: &RawRecord, target: TargetSchema, ctx: &MapContext<'_>) -> MappedRow {
    match target {
        TargetSchema::Display => MappedRow::Display(map_display_row(raw, ctx.source_id)),
        TargetSchema::Storage => {
            MappedRow::Storage(map_storage_row(raw, ctx.filename, ctx.uploaded_at))
        }
    }
}

pub fn map_display_row(raw: &RawRecord, source_id: &str) -> CanonicalRow {
    let mut row = CanonicalRow::new(source_id);
    row.village = resolve_text(raw, VILLAGE_ALIASES);
    row.taluka = resolve_text(raw, TALUKA_ALIASES);
    row.district = resolve_text(raw, DISTRICT_ALIASES);
    row.state = resolve_text(raw, STATE_ALIASES);
    row.density_category = resolve_text(raw, DENSITY_CATEGORY_ALIASES);
    row.quantity_per_hectare = resolve(raw, QUANTITY_ALIASES).map(to_number);
    row.biomass_range = resolve_text(raw, BIOMASS_RANGE_ALIASES);
    row.raw = raw.cleaned_payload();
    row.raw.remove(SOURCE_REGION_KEY);
    row
}

pub fn map_storage_row(raw: &RawRecord, filename: &str, uploaded_at: DateTime<Utc>) -> StorageRow {
    let mut row = StorageRow::new(filename, uploaded_at);
    row.survey_date = resolve_text(raw, SURVEY_DATE_ALIASES);
    row.survey_time = resolve_text(raw, SURVEY_TIME_ALIASES);
    row.coordinates = resolve_text(raw, COORDINATES_ALIASES);
    row.district = resolve_text(raw, DISTRICT_ALIASES);
    row.state = resolve_text(raw, STATE_ALIASES);
    row.taluka = resolve_text(raw, TALUKA_ALIASES);
    row.village = resolve_text(raw, VILLAGE_ALIASES);
    row.grid_id = resolve_text(raw, GRID_ID_ALIASES);
    row.gcp_id = resolve_text(raw, GCP_ID_ALIASES);
    row.juliflora_count = resolve(raw, JULIFLORA_COUNT_ALIASES).map_or(0.0, to_number);
    row.other_species = resolve_text(raw, OTHER_SPECIES_ALIASES);
    row.juliflora_density = resolve(raw, JULIFLORA_DENSITY_ALIASES).map_or(0.0, to_number);
    row.photos = resolve(raw, PHOTO_ALIASES)
        .map(to_photo_list)
        .unwrap_or_default();
    row.raw_payload = raw.cleaned_payload();
    row
}

/// Export link, its alternate-format twin, then the same link through a CORS relay.
pub fn sheet_candidates(export_url: &str) -> Vec<RetrievalCandidate> {
    let mut out = vec![RetrievalCandidate::new(CandidateKind::DirectExport, export_url)];
    let alternate = export_url.replace("/export?format=csv", "/gviz/tq?tqx=out:csv");
    if alternate != export_url {
        out.push(RetrievalCandidate::new(CandidateKind::AlternateExport, alternate));
    }
    let encoded: String = url::form_urlencoded::byte_serialize(export_url.as_bytes()).collect();
    out.push(RetrievalCandidate::new(
        CandidateKind::CorsRelay,
        format!("https://corsproxy.io/?{encoded}"),
    ));
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceptance {
    Accepted,
    TransportFailure(u16),
    EmptyBody,
    MarkupPage,
}

/// Accepts a response only on transport success with a body that is not an HTML page.
pub fn accept_response(resp: &FetchedResponse) -> Acceptance {
    if !resp.is_success() {
        return Acceptance::TransportFailure(resp.status);
    }
    let body = resp.body.trim();
    if body.is_empty() {
        Acceptance::EmptyBody
    } else if body.starts_with("<!") {
        Acceptance::MarkupPage
    } else {
        Acceptance::Accepted
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptFailure {
    pub candidate: RetrievalCandidate,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("all {} retrieval strategies failed for {source_id}: {last_error}", .attempts.len())]
    FetchExhausted {
        source_id: String,
        attempts: Vec<AttemptFailure>,
        last_error: String,
    },
    #[error("CSV from {source_id} could not be parsed: {error}")]
    Parse {
        source_id: String,
        #[source]
        error: CsvParseError,
    },
    #[error("{source_id} yielded no usable rows")]
    EmptyResult { source_id: String },
}

impl SourceError {
    pub fn source_id(&self) -> &str {
        match self {
            Self::FetchExhausted { source_id, .. }
            | Self::Parse { source_id, .. }
            | Self::EmptyResult { source_id } => source_id,
        }
    }

    /// Empty sources are a valid state, not a failure of the retrieval chain.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::EmptyResult { .. })
    }
}

#[derive(Debug, Clone)]
pub struct FetchedCsv {
    pub source_id: String,
    pub candidate: RetrievalCandidate,
    pub text: String,
    pub fetched_at: DateTime<Utc>,
}

/// Walks a source's candidates in order and stops at the first acceptable response.
#[derive(Clone)]
pub struct SourceFetcher {
    transport: Arc<dyn TextTransport>,
    strategy_timeout: Duration,
}

impl SourceFetcher {
    pub fn new(transport: Arc<dyn TextTransport>, strategy_timeout: Duration) -> Self {
        Self {
            transport,
            strategy_timeout,
        }
    }

    pub async fn fetch(&self, descriptor: &SourceDescriptor) -> Result<FetchedCsv, SourceError> {
        let source_id = descriptor.source_id.as_str();
        let mut attempts = Vec::new();

        for candidate in &descriptor.candidates {
            let reason = match self.attempt(source_id, candidate).await {
                Ok(resp) => match accept_response(&resp) {
                    Acceptance::Accepted => {
                        info!(source_id, strategy = ?candidate.kind, "fetched CSV");
                        return Ok(FetchedCsv {
                            source_id: source_id.to_string(),
                            candidate: candidate.clone(),
                            text: resp.body,
                            fetched_at: Utc::now(),
                        });
                    }
                    Acceptance::TransportFailure(status) => format!("HTTP {status}"),
                    Acceptance::EmptyBody => "received empty body".to_string(),
                    Acceptance::MarkupPage => "received an HTML page instead of CSV".to_string(),
                },
                Err(err) => err.to_string(),
            };
            warn!(source_id, strategy = ?candidate.kind, url = %candidate.location, %reason, "retrieval strategy failed");
            attempts.push(AttemptFailure {
                candidate: candidate.clone(),
                reason,
            });
        }

        let last_error = attempts
            .last()
            .map(|a| a.reason.clone())
            .unwrap_or_else(|| "no retrieval candidates configured".to_string());
        Err(SourceError::FetchExhausted {
            source_id: source_id.to_string(),
            attempts,
            last_error,
        })
    }

    async fn attempt(
        &self,
        source_id: &str,
        candidate: &RetrievalCandidate,
    ) -> Result<FetchedResponse, FetchError> {
        debug!(source_id, location = %candidate.location, "trying retrieval strategy");
        tokio::time::timeout(self.strategy_timeout, self.retrieve(source_id, candidate))
            .await
            .map_err(|_| {
                FetchError::Other(format!("timed out after {:?}", self.strategy_timeout))
            })?
    }

    async fn retrieve(
        &self,
        source_id: &str,
        candidate: &RetrievalCandidate,
    ) -> Result<FetchedResponse, FetchError> {
        if candidate.kind != CandidateKind::LocalFile {
            return self.transport.get_text(source_id, &candidate.location).await;
        }

        let bytes = tokio::fs::read(&candidate.location)
            .await
            .map_err(|source| FetchError::Io {
                path: candidate.location.clone(),
                source,
            })?;
        let (body, warning) = decode_csv_bytes(&bytes);
        if let Some(warning) = warning {
            warn!(source_id, path = %candidate.location, "{}", warning.message);
        }
        Ok(FetchedResponse {
            status: 200,
            final_url: candidate.location.clone(),
            body,
        })
    }
}

/// Rows of one logical source after fetch, parse and display mapping.
#[derive(Debug, Clone)]
pub struct SourceLoad {
    pub source_id: String,
    pub candidate: RetrievalCandidate,
    pub fetched_at: DateTime<Utc>,
    pub headers: Vec<String>,
    pub rows: Vec<CanonicalRow>,
    pub warnings: Vec<ParseWarning>,
    pub csv_text: String,
}

pub async fn load_source(
    fetcher: &SourceFetcher,
    parser: &CsvParser,
    descriptor: &SourceDescriptor,
) -> Result<SourceLoad, SourceError> {
    let fetched = fetcher.fetch(descriptor).await?;
    let parsed = parser.parse(&fetched.text).map_err(|error| SourceError::Parse {
        source_id: descriptor.source_id.clone(),
        error,
    })?;

    let rows: Vec<CanonicalRow> = parsed
        .records
        .into_iter()
        .map(|mut raw| {
            raw.push(SOURCE_REGION_KEY, CellValue::text(descriptor.source_id.clone()));
            map_display_row(&raw, &descriptor.source_id)
        })
        .collect();

    if rows.is_empty() {
        return Err(SourceError::EmptyResult {
            source_id: descriptor.source_id.clone(),
        });
    }

    Ok(SourceLoad {
        source_id: fetched.source_id,
        candidate: fetched.candidate,
        fetched_at: fetched.fetched_at,
        headers: parsed.headers,
        rows,
        warnings: parsed.warnings,
        csv_text: fetched.text,
    })
}
