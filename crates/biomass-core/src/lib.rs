//! Core data model and cell normalization for the biomass survey dashboard.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "biomass-core";

/// Scalar cell as produced by the CSV parser (optionally type-coerced).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum CellValue {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl CellValue {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// String form of the cell, `None` for null.
    pub fn stringify(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Bool(b) => Some(b.to_string()),
            Self::Int(i) => Some(i.to_string()),
            Self::Float(f) => Some(f.to_string()),
            Self::Text(s) => Some(s.clone()),
        }
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// One parsed CSV row keyed by whatever header spelling the source used.
///
/// Field order follows the header row.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawRecord {
    fields: Vec<(String, CellValue)>,
}

impl RawRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: impl Into<String>, value: CellValue) {
        let key = key.into();
        if let Some(slot) = self.fields.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            self.fields.push((key, value));
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<CellValue>) -> Self {
        self.push(key, value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&CellValue> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &CellValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Every cell passed through [`clean`]; retained on mapped rows for audit.
    pub fn cleaned_payload(&self) -> RawPayload {
        self.fields
            .iter()
            .map(|(k, v)| (k.clone(), clean(v)))
            .collect()
    }
}

impl From<Vec<(String, CellValue)>> for RawRecord {
    fn from(fields: Vec<(String, CellValue)>) -> Self {
        let mut record = Self::new();
        for (k, v) in fields {
            record.push(k, v);
        }
        record
    }
}

/// Cleaned copy of the original row, keyed by original header.
pub type RawPayload = BTreeMap<String, Option<String>>;

/// Logical columns of the display schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalField {
    Village,
    Taluka,
    District,
    State,
    DensityCategory,
    QuantityPerHectare,
    BiomassRange,
}

impl CanonicalField {
    pub const ALL: [CanonicalField; 7] = [
        CanonicalField::Village,
        CanonicalField::Taluka,
        CanonicalField::District,
        CanonicalField::State,
        CanonicalField::DensityCategory,
        CanonicalField::QuantityPerHectare,
        CanonicalField::BiomassRange,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Village => "village",
            Self::Taluka => "taluka",
            Self::District => "district",
            Self::State => "state",
            Self::DensityCategory => "density_category",
            Self::QuantityPerHectare => "quantity_per_hectare",
            Self::BiomassRange => "biomass_range",
        }
    }

    /// Column label used for CSV export and table headers.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Village => "Village",
            Self::Taluka => "Taluka",
            Self::District => "District",
            Self::State => "State",
            Self::DensityCategory => "Density Category",
            Self::QuantityPerHectare => "Quantity per Hectare",
            Self::BiomassRange => "Biomass Range",
        }
    }
}

impl fmt::Display for CanonicalField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CanonicalField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Self::ALL
            .into_iter()
            .find(|f| f.as_str().eq_ignore_ascii_case(wanted) || f.label().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| format!("unknown column `{wanted}`"))
    }
}

/// Normalized display-schema row tagged with the logical source it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRow {
    source_id: String,
    pub village: Option<String>,
    pub taluka: Option<String>,
    pub district: Option<String>,
    pub state: Option<String>,
    pub density_category: Option<String>,
    pub quantity_per_hectare: Option<f64>,
    pub biomass_range: Option<String>,
    pub raw: RawPayload,
}

impl CanonicalRow {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            village: None,
            taluka: None,
            district: None,
            state: None,
            density_category: None,
            quantity_per_hectare: None,
            biomass_range: None,
            raw: RawPayload::new(),
        }
    }

    /// Provenance tag; fixed at construction.
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn value(&self, field: CanonicalField) -> Option<String> {
        match field {
            CanonicalField::Village => self.village.clone(),
            CanonicalField::Taluka => self.taluka.clone(),
            CanonicalField::District => self.district.clone(),
            CanonicalField::State => self.state.clone(),
            CanonicalField::DensityCategory => self.density_category.clone(),
            CanonicalField::QuantityPerHectare => self.quantity_per_hectare.map(|q| q.to_string()),
            CanonicalField::BiomassRange => self.biomass_range.clone(),
        }
    }
}

/// Persisted-schema row; written once per ingested CSV row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageRow {
    pub id: Uuid,
    pub filename: String,
    pub uploaded_at: DateTime<Utc>,
    pub survey_date: Option<String>,
    pub survey_time: Option<String>,
    pub coordinates: Option<String>,
    pub district: Option<String>,
    pub state: Option<String>,
    pub taluka: Option<String>,
    pub village: Option<String>,
    pub grid_id: Option<String>,
    pub gcp_id: Option<String>,
    pub juliflora_count: f64,
    pub other_species: Option<String>,
    pub juliflora_density: f64,
    pub photos: Vec<String>,
    pub raw_payload: RawPayload,
}

impl StorageRow {
    pub fn new(filename: impl Into<String>, uploaded_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            filename: filename.into(),
            uploaded_at,
            survey_date: None,
            survey_time: None,
            coordinates: None,
            district: None,
            state: None,
            taluka: None,
            village: None,
            grid_id: None,
            gcp_id: None,
            juliflora_count: 0.0,
            other_species: None,
            juliflora_density: 0.0,
            photos: Vec::new(),
            raw_payload: RawPayload::new(),
        }
    }

    /// Reconstructs the original row from the audit payload.
    pub fn raw_record(&self) -> RawRecord {
        let mut record = RawRecord::new();
        for (k, v) in &self.raw_payload {
            let cell = v.clone().map(CellValue::Text).unwrap_or_default();
            record.push(k.clone(), cell);
        }
        record
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateKind {
    DirectExport,
    AlternateExport,
    CorsRelay,
    Explicit,
    LocalFile,
}

/// One way of retrieving a source's CSV text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalCandidate {
    pub kind: CandidateKind,
    pub location: String,
}

impl RetrievalCandidate {
    pub fn new(kind: CandidateKind, location: impl Into<String>) -> Self {
        Self {
            kind,
            location: location.into(),
        }
    }
}

/// Logical CSV origin with its retrieval candidates in priority order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub source_id: String,
    pub display_name: String,
    pub candidates: Vec<RetrievalCandidate>,
}

impl SourceDescriptor {
    pub fn new(source_id: impl Into<String>, candidates: Vec<RetrievalCandidate>) -> Self {
        let source_id = source_id.into();
        Self {
            display_name: source_id.clone(),
            source_id,
            candidates,
        }
    }
}

/// Static district -> taluka containment table.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegionHierarchy {
    districts: BTreeMap<String, Vec<String>>,
}

impl RegionHierarchy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_district<I, S>(mut self, district: impl Into<String>, talukas: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.districts
            .insert(district.into(), talukas.into_iter().map(Into::into).collect());
        self
    }

    pub fn districts(&self) -> impl Iterator<Item = &str> {
        self.districts.keys().map(String::as_str)
    }

    pub fn talukas_of(&self, district: &str) -> &[String] {
        self.districts
            .iter()
            .find(|(d, _)| d.eq_ignore_ascii_case(district))
            .map(|(_, t)| t.as_slice())
            .unwrap_or(&[])
    }

    pub fn district_of(&self, taluka: &str) -> Option<&str> {
        self.districts
            .iter()
            .find(|(_, talukas)| talukas.iter().any(|t| t.eq_ignore_ascii_case(taluka)))
            .map(|(d, _)| d.as_str())
    }

    pub fn contains(&self, district: &str, taluka: &str) -> bool {
        self.talukas_of(district)
            .iter()
            .any(|t| t.eq_ignore_ascii_case(taluka))
    }

    pub fn all_talukas(&self) -> Vec<&str> {
        self.districts
            .values()
            .flatten()
            .map(String::as_str)
            .collect()
    }
}

/// Cleans a single cell. Empty after cleaning means null.
pub fn clean(value: &CellValue) -> Option<String> {
    value.stringify().and_then(|s| clean_str(&s))
}

/// Cleaning rules for text cells, repeated until the text stops changing so
/// that `clean_str(clean_str(x)) == clean_str(x)`.
pub fn clean_str(value: &str) -> Option<String> {
    let mut current = clean_pass(value);
    loop {
        let next = clean_pass(&current);
        if next == current {
            break;
        }
        current = next;
    }
    if current.is_empty() {
        None
    } else {
        Some(current)
    }
}

fn clean_pass(value: &str) -> String {
    let unwrapped = value
        .trim()
        .trim_start_matches('{')
        .trim_end_matches('}');

    let mut out = String::with_capacity(unwrapped.len());
    let mut prev_comma = false;
    let mut prev_space = false;
    for ch in unwrapped.chars() {
        if ch == '"' {
            continue;
        }
        // tab/newline/CR fold into whitespace; the rest of C0 is dropped
        if (ch as u32) < 0x20 && !matches!(ch, '\t' | '\n' | '\r') {
            continue;
        }
        if ch == ',' {
            if prev_comma {
                continue;
            }
            prev_comma = true;
            prev_space = false;
            out.push(ch);
            continue;
        }
        if ch.is_whitespace() {
            if !prev_space {
                out.push(' ');
            }
            prev_space = true;
            continue;
        }
        prev_comma = false;
        prev_space = false;
        out.push(ch);
    }

    out.replace(".csv", "").trim().to_string()
}

/// Lossy numeric coercion: null, empty, invalid and non-finite input all map to 0.
pub fn to_number(value: &CellValue) -> f64 {
    match value {
        CellValue::Null => 0.0,
        CellValue::Bool(b) => f64::from(u8::from(*b)),
        CellValue::Int(i) => *i as f64,
        CellValue::Float(f) if f.is_finite() => *f,
        CellValue::Float(_) => 0.0,
        CellValue::Text(s) => to_number_str(s),
    }
}

pub fn to_number_str(value: &str) -> f64 {
    clean_str(value)
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|f| f.is_finite())
        .unwrap_or(0.0)
}

/// Splits a space-joined list of photo identifiers.
pub fn to_photo_list(value: &CellValue) -> Vec<String> {
    clean(value)
        .map(|s| s.split_whitespace().map(ToString::to_string).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_strips_json_debris_and_collapses_noise() {
        assert_eq!(clean_str("  {\"Bhuj\"}  ").as_deref(), Some("Bhuj"));
        assert_eq!(clean_str("a,,,b").as_deref(), Some("a,b"));
        assert_eq!(clean_str("Lower   Dense\tPatch").as_deref(), Some("Lower Dense Patch"));
        assert_eq!(clean_str("survey_export.csv").as_deref(), Some("survey_export"));
        assert_eq!(clean_str("ab\u{0007}c").as_deref(), Some("abc"));
        assert_eq!(clean_str("   "), None);
        assert_eq!(clean_str("{}"), None);
        assert_eq!(clean(&CellValue::Null), None);
        assert_eq!(clean(&CellValue::Int(42)).as_deref(), Some("42"));
        assert_eq!(clean(&CellValue::Float(12.5)).as_deref(), Some("12.5"));
    }

    #[test]
    fn clean_is_idempotent() {
        let inputs = [
            "{{a}}",
            "{ {a} }",
            "a..csvcsv",
            ", ,,, x",
            "\"{\"nested\": \"value\"}\"",
            "one\n\n two\r\nthree",
            "  plain text  ",
            ".csv.csv",
            "a , , b",
            "",
        ];
        for input in inputs {
            let once = clean_str(input);
            let twice = once.as_deref().and_then(clean_str);
            assert_eq!(once, twice, "input {input:?}");
        }
    }

    #[test]
    fn to_number_coerces_lossily() {
        assert_eq!(to_number(&CellValue::text("")), 0.0);
        assert_eq!(to_number(&CellValue::Null), 0.0);
        assert_eq!(to_number(&CellValue::text("12.5")), 12.5);
        assert_eq!(to_number(&CellValue::text("abc")), 0.0);
        assert_eq!(to_number(&CellValue::text("NaN")), 0.0);
        assert_eq!(to_number(&CellValue::Int(7)), 7.0);
        assert_eq!(to_number(&CellValue::text(" 3 ")), 3.0);
    }

    #[test]
    fn photo_list_splits_on_whitespace() {
        assert_eq!(
            to_photo_list(&CellValue::text("img_01.jpg  img_02.jpg img_03.jpg")),
            vec!["img_01.jpg", "img_02.jpg", "img_03.jpg"]
        );
        assert!(to_photo_list(&CellValue::Null).is_empty());
        assert!(to_photo_list(&CellValue::text("  ")).is_empty());
    }

    #[test]
    fn region_hierarchy_lookups_ignore_case() {
        let regions = RegionHierarchy::new()
            .with_district("Kutch", ["Bhuj", "Nakhatrana"])
            .with_district("Banaskantha", ["Palanpur"]);
        assert!(regions.contains("kutch", "BHUJ"));
        assert!(!regions.contains("Banaskantha", "Bhuj"));
        assert_eq!(regions.district_of("nakhatrana"), Some("Kutch"));
        assert_eq!(regions.talukas_of("Nowhere"), &[] as &[String]);
        assert_eq!(regions.all_talukas().len(), 3);
    }

    #[test]
    fn raw_record_push_overwrites_duplicate_key() {
        let mut record = RawRecord::new().with("Village", "Kukma");
        record.push("Village", CellValue::text("Lakhond"));
        assert_eq!(record.len(), 1);
        assert_eq!(record.get("Village"), Some(&CellValue::text("Lakhond")));
    }

    #[test]
    fn canonical_field_parses_label_or_key() {
        assert_eq!("density_category".parse::<CanonicalField>(), Ok(CanonicalField::DensityCategory));
        assert_eq!("Quantity per Hectare".parse::<CanonicalField>(), Ok(CanonicalField::QuantityPerHectare));
        assert!("nope".parse::<CanonicalField>().is_err());
    }
}
