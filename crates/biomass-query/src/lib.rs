//! In-memory selection over a working set of canonical rows.
//!
//! Filter state is an immutable value; every transition returns a new state.
//! `select` recomputes the whole view on each call.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use biomass_core::{CanonicalField, CanonicalRow, RegionHierarchy};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

pub const CRATE_NAME: &str = "biomass-query";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortState {
    pub field: CanonicalField,
    pub direction: SortDirection,
}

/// Which sources a filter state needs loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegionScope {
    All,
    District(String),
    Taluka(String),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FilterState {
    pub district: Option<String>,
    pub taluka: Option<String>,
    pub search: Option<String>,
    pub village: Option<String>,
    pub density_category: Option<String>,
    pub biomass_range: Option<String>,
    pub quantity_range: Option<String>,
    pub sort: Option<SortState>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl FilterState {
    /// Selecting a district that does not contain the current taluka resets the taluka.
    pub fn with_district(mut self, district: Option<String>, regions: &RegionHierarchy) -> Self {
        self.district = non_blank(district);
        let stale = match (self.district.as_deref(), self.taluka.as_deref()) {
            (Some(d), Some(t)) => !regions.contains(d, t),
            _ => false,
        };
        if stale {
            debug!(district = ?self.district, taluka = ?self.taluka, "taluka reset by district change");
            self.taluka = None;
        }
        self
    }

    /// A taluka outside the selected district is rejected and clears the selection.
    pub fn with_taluka(mut self, taluka: Option<String>, regions: &RegionHierarchy) -> Self {
        self.taluka = non_blank(taluka).filter(|t| match &self.district {
            Some(d) => regions.contains(d, t),
            None => true,
        });
        self
    }

    pub fn with_search(mut self, search: Option<String>) -> Self {
        self.search = non_blank(search);
        self
    }

    pub fn with_village(mut self, village: Option<String>) -> Self {
        self.village = non_blank(village);
        self
    }

    pub fn with_density_category(mut self, category: Option<String>) -> Self {
        self.density_category = non_blank(category);
        self
    }

    pub fn with_biomass_range(mut self, range: Option<String>) -> Self {
        self.biomass_range = non_blank(range);
        self
    }

    pub fn with_quantity_range(mut self, range: Option<String>) -> Self {
        self.quantity_range = non_blank(range);
        self
    }

    /// Same column flips direction; a new column starts ascending.
    pub fn toggle_sort(mut self, field: CanonicalField) -> Self {
        let direction = match self.sort {
            Some(SortState {
                field: current,
                direction: SortDirection::Asc,
            }) if current == field => SortDirection::Desc,
            _ => SortDirection::Asc,
        };
        self.sort = Some(SortState { field, direction });
        self
    }

    pub fn cleared(self) -> Self {
        Self::default()
    }

    pub fn scope(&self) -> RegionScope {
        match (&self.district, &self.taluka) {
            (_, Some(t)) => RegionScope::Taluka(t.clone()),
            (Some(d), None) => RegionScope::District(d.clone()),
            (None, None) => RegionScope::All,
        }
    }

    /// Taluka selection that is consistent with the district, if any.
    fn effective_taluka(&self, regions: &RegionHierarchy) -> Option<&str> {
        let taluka = self.taluka.as_deref()?;
        match self.district.as_deref() {
            Some(d) if !regions.contains(d, taluka) => None,
            _ => Some(taluka),
        }
    }
}

/// Inclusive `min-max` bounds; either side may be open.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantityRange {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl QuantityRange {
    pub fn parse(token: &str) -> Option<Self> {
        let token = token.trim();
        if token.is_empty() {
            return None;
        }
        let (lo, hi) = token.split_once('-').unwrap_or((token, ""));
        let bound = |s: &str| s.trim().parse::<f64>().ok().filter(|f| f.is_finite());
        Some(Self {
            min: bound(lo),
            max: bound(hi),
        })
    }

    pub fn contains(&self, value: f64) -> bool {
        self.min.map_or(true, |min| value >= min) && self.max.map_or(true, |max| value <= max)
    }
}

fn eq_ci(a: Option<&str>, b: &str) -> bool {
    a.is_some_and(|a| a.trim().eq_ignore_ascii_case(b.trim()))
}

fn row_district<'a>(row: &'a CanonicalRow, regions: &'a RegionHierarchy) -> Option<&'a str> {
    row.district
        .as_deref()
        .or_else(|| row.taluka.as_deref().and_then(|t| regions.district_of(t)))
}

fn row_taluka(row: &CanonicalRow) -> &str {
    row.taluka.as_deref().unwrap_or_else(|| row.source_id())
}

fn matches_search(row: &CanonicalRow, needle: &str) -> bool {
    CanonicalField::ALL
        .iter()
        .filter_map(|f| row.value(*f))
        .chain(row.raw.values().flatten().cloned())
        .any(|v| v.to_lowercase().contains(needle))
}

fn matches(row: &CanonicalRow, state: &FilterState, regions: &RegionHierarchy) -> bool {
    if let Some(d) = state.district.as_deref() {
        if !eq_ci(row_district(row, regions), d) {
            return false;
        }
    }
    if let Some(t) = state.effective_taluka(regions) {
        if !eq_ci(Some(row_taluka(row)), t) {
            return false;
        }
    }
    if let Some(v) = state.village.as_deref() {
        if !eq_ci(row.village.as_deref(), v) {
            return false;
        }
    }
    if let Some(c) = state.density_category.as_deref() {
        if !eq_ci(row.density_category.as_deref(), c) {
            return false;
        }
    }
    if let Some(r) = state.biomass_range.as_deref() {
        if !eq_ci(row.biomass_range.as_deref(), r) {
            return false;
        }
    }
    if let Some(range) = state.quantity_range.as_deref().and_then(QuantityRange::parse) {
        if !range.contains(row.quantity_per_hectare.unwrap_or(0.0)) {
            return false;
        }
    }
    if let Some(term) = state.search.as_deref() {
        let needle = term.trim().to_lowercase();
        if !needle.is_empty() && !matches_search(row, &needle) {
            return false;
        }
    }
    true
}

/// Ordering key for a cell: blanks, then numbers, then text.
#[derive(Debug, Clone, PartialEq)]
enum SortKey {
    Blank,
    Number(f64),
    /// Accent-folded lowercase first, plain lowercase as the tie-break.
    Text { folded: String, lowered: String },
}

impl SortKey {
    fn of(value: Option<String>) -> Self {
        match value {
            None => Self::Blank,
            Some(v) if v.trim().is_empty() => Self::Blank,
            Some(v) => match v.trim().parse::<f64>() {
                Ok(n) if n.is_finite() => Self::Number(n),
                _ => Self::Text {
                    folded: fold_accents(&v).to_lowercase(),
                    lowered: v.to_lowercase(),
                },
            },
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Blank => 0,
            Self::Number(_) => 1,
            Self::Text { .. } => 2,
        }
    }

    fn compare(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Number(a), Self::Number(b)) => a.total_cmp(b),
            (
                Self::Text { folded: fa, lowered: la },
                Self::Text { folded: fb, lowered: lb },
            ) => fa.cmp(fb).then_with(|| la.cmp(lb)),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

/// Strips combining marks after canonical decomposition, so `É` collates with `E`.
fn fold_accents(value: &str) -> String {
    value.nfd().filter(|c| !is_combining_mark(*c)).collect()
}

/// Filters then sorts. Descending is the exact reverse of the stable ascending order.
pub fn select<'a>(
    rows: &'a [CanonicalRow],
    state: &FilterState,
    regions: &RegionHierarchy,
) -> Vec<&'a CanonicalRow> {
    let mut out: Vec<&CanonicalRow> = rows
        .iter()
        .filter(|row| matches(row, state, regions))
        .collect();

    if let Some(sort) = state.sort {
        let mut keyed: Vec<(SortKey, &CanonicalRow)> = out
            .into_iter()
            .map(|row| (SortKey::of(row.value(sort.field)), row))
            .collect();
        keyed.sort_by(|(a, _), (b, _)| a.compare(b));
        out = keyed.into_iter().map(|(_, row)| row).collect();
        if sort.direction == SortDirection::Desc {
            out.reverse();
        }
    }

    debug!(total = rows.len(), shown = out.len(), "selection recomputed");
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Facets {
    pub talukas: Vec<String>,
    pub villages: Vec<String>,
    pub density_categories: Vec<String>,
    pub biomass_ranges: Vec<String>,
}

/// Option lists for the categorical filters. Villages narrow to the selected taluka.
pub fn facets(rows: &[CanonicalRow], state: &FilterState, regions: &RegionHierarchy) -> Facets {
    let talukas = match state.district.as_deref() {
        Some(d) => regions.talukas_of(d).to_vec(),
        None => regions.all_talukas().into_iter().map(str::to_string).collect(),
    };

    let taluka = state.effective_taluka(regions);
    let villages: BTreeSet<String> = rows
        .iter()
        .filter(|row| taluka.map_or(true, |t| eq_ci(Some(row_taluka(row)), t)))
        .filter_map(|row| row.village.clone())
        .collect();
    let density_categories: BTreeSet<String> =
        rows.iter().filter_map(|r| r.density_category.clone()).collect();
    let biomass_ranges: BTreeSet<String> =
        rows.iter().filter_map(|r| r.biomass_range.clone()).collect();

    Facets {
        talukas,
        villages: villages.into_iter().collect(),
        density_categories: density_categories.into_iter().collect(),
        biomass_ranges: biomass_ranges.into_iter().collect(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ViewSummary {
    pub shown: usize,
    pub total: usize,
}

impl ViewSummary {
    pub fn new(shown: usize, total: usize) -> Self {
        Self { shown, total }
    }
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("csv write failed: {0}")]
    Csv(#[from] csv::Error),
    #[error("csv buffer flush failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("exported csv is not utf-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Serializes rows in canonical column order; null cells become empty.
pub fn export_csv<'a>(rows: impl IntoIterator<Item = &'a CanonicalRow>) -> Result<String, ExportError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(CanonicalField::ALL.iter().map(|f| f.label()))?;
    for row in rows {
        writer.write_record(
            CanonicalField::ALL
                .iter()
                .map(|f| row.value(*f).unwrap_or_default()),
        )?;
    }
    let bytes = writer.into_inner().map_err(|e| e.into_error())?;
    Ok(String::from_utf8(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kutch() -> RegionHierarchy {
        RegionHierarchy::new()
            .with_district("Kutch", ["Bhuj", "Nakhatrana"])
            .with_district("Banaskantha", ["Palanpur"])
    }

    fn row(source: &str, village: &str, density: &str, qty: Option<f64>, range: &str) -> CanonicalRow {
        let mut r = CanonicalRow::new(source);
        r.village = Some(village.to_string());
        r.taluka = Some(source.to_string());
        r.district = Some("Kutch".to_string());
        r.state = Some("Gujarat".to_string());
        r.density_category = Some(density.to_string());
        r.quantity_per_hectare = qty;
        r.biomass_range = Some(range.to_string());
        r
    }

    fn working_set() -> Vec<CanonicalRow> {
        vec![
            row("Bhuj", "Kukma", "High", Some(180.5), "150-200"),
            row("Bhuj", "Lakhond", "Medium", Some(120.0), "100-150"),
            row("Bhuj", "Madhapar", "Low", Some(45.0), "0-50"),
            row("Nakhatrana", "Vithon", "HIGH", Some(160.0), "150-200"),
            row("Nakhatrana", "Devisar", "Low", None, "0-50"),
        ]
    }

    fn villages(rows: &[&CanonicalRow]) -> Vec<String> {
        rows.iter().filter_map(|r| r.village.clone()).collect()
    }

    #[test]
    fn cascading_district_keeps_or_resets_taluka() {
        let regions = kutch();
        let state = FilterState::default()
            .with_district(Some("Kutch".into()), &regions)
            .with_taluka(Some("Bhuj".into()), &regions);
        let kept = state.clone().with_district(Some("Kutch".into()), &regions);
        assert_eq!(kept.taluka.as_deref(), Some("Bhuj"));

        let reset = state.with_district(Some("Banaskantha".into()), &regions);
        assert_eq!(reset.district.as_deref(), Some("Banaskantha"));
        assert_eq!(reset.taluka, None);
    }

    #[test]
    fn taluka_outside_district_is_rejected() {
        let regions = kutch();
        let state = FilterState::default()
            .with_district(Some("Banaskantha".into()), &regions)
            .with_taluka(Some("Bhuj".into()), &regions);
        assert_eq!(state.taluka, None);
        assert_eq!(state.scope(), RegionScope::District("Banaskantha".into()));
    }

    #[test]
    fn clearing_district_keeps_taluka_valid() {
        let regions = kutch();
        let state = FilterState::default()
            .with_taluka(Some("Bhuj".into()), &regions)
            .with_district(None, &regions);
        assert_eq!(state.scope(), RegionScope::Taluka("Bhuj".into()));
    }

    #[test]
    fn second_toggle_reverses_first() {
        let rows = working_set();
        let regions = kutch();
        let asc_state = FilterState::default().toggle_sort(CanonicalField::DensityCategory);
        let desc_state = asc_state.clone().toggle_sort(CanonicalField::DensityCategory);
        assert_eq!(desc_state.sort.map(|s| s.direction), Some(SortDirection::Desc));

        let asc = select(&rows, &asc_state, &regions);
        let mut desc = select(&rows, &desc_state, &regions);
        desc.reverse();
        assert_eq!(asc, desc);
        assert_eq!(villages(&asc), vec!["Kukma", "Vithon", "Madhapar", "Devisar", "Lakhond"]);
    }

    #[test]
    fn new_column_resets_to_ascending() {
        let state = FilterState::default()
            .toggle_sort(CanonicalField::Village)
            .toggle_sort(CanonicalField::Village)
            .toggle_sort(CanonicalField::QuantityPerHectare);
        assert_eq!(
            state.sort,
            Some(SortState {
                field: CanonicalField::QuantityPerHectare,
                direction: SortDirection::Asc
            })
        );
    }

    #[test]
    fn numeric_columns_sort_numerically() {
        let rows = working_set();
        let state = FilterState::default().toggle_sort(CanonicalField::QuantityPerHectare);
        let sorted = select(&rows, &state, &kutch());
        assert_eq!(
            villages(&sorted),
            vec!["Devisar", "Madhapar", "Lakhond", "Vithon", "Kukma"]
        );
    }

    #[test]
    fn accented_villages_collate_with_their_base_letters() {
        let rows = vec![
            row("Bhuj", "zebra", "Low", None, "0-50"),
            row("Bhuj", "\u{c1}baco", "Low", None, "0-50"),
            row("Bhuj", "apple", "Low", None, "0-50"),
            row("Bhuj", "\u{c9}clair", "Low", None, "0-50"),
        ];
        let asc = FilterState::default().toggle_sort(CanonicalField::Village);
        assert_eq!(
            villages(&select(&rows, &asc, &kutch())),
            vec!["\u{c1}baco", "apple", "\u{c9}clair", "zebra"]
        );

        let desc = asc.toggle_sort(CanonicalField::Village);
        assert_eq!(
            villages(&select(&rows, &desc, &kutch())),
            vec!["zebra", "\u{c9}clair", "apple", "\u{c1}baco"]
        );
    }

    #[test]
    fn accent_only_differences_break_ties_deterministically() {
        let rows = vec![
            row("Bhuj", "Cafe\u{301}", "Low", None, "0-50"),
            row("Bhuj", "cafe", "Low", None, "0-50"),
        ];
        let state = FilterState::default().toggle_sort(CanonicalField::Village);
        assert_eq!(
            villages(&select(&rows, &state, &kutch())),
            vec!["cafe", "Cafe\u{301}"]
        );
    }

    #[test]
    fn search_ignores_case_on_both_sides() {
        let rows = working_set();
        let regions = kutch();
        for term in ["lakhond", "LAKHOND", "aKhO"] {
            let state = FilterState::default().with_search(Some(term.into()));
            let found = select(&rows, &state, &regions);
            assert_eq!(villages(&found), vec!["Lakhond"], "term {term}");
        }
    }

    #[test]
    fn search_reaches_raw_payload() {
        let mut rows = working_set();
        rows[2].raw.insert("Surveyor".into(), Some("R. Patel".into()));
        let state = FilterState::default().with_search(Some("patel".into()));
        assert_eq!(villages(&select(&rows, &state, &kutch())), vec!["Madhapar"]);
    }

    #[test]
    fn quantity_range_bounds_are_inclusive() {
        let range = QuantityRange::parse("100-200").unwrap();
        assert!(range.contains(100.0));
        assert!(range.contains(200.0));
        assert!(!range.contains(99.0));
        assert!(!range.contains(201.0));

        let open = QuantityRange::parse("150-").unwrap();
        assert!(open.contains(10_000.0));
        assert!(!open.contains(149.9));
        let abc = QuantityRange::parse("abc-50").unwrap();
        assert!(abc.contains(-5.0));
        assert!(!abc.contains(51.0));
    }

    #[test]
    fn range_filter_treats_missing_quantity_as_zero() {
        let rows = working_set();
        let state = FilterState::default().with_quantity_range(Some("0-50".into()));
        assert_eq!(villages(&select(&rows, &state, &kutch())), vec!["Madhapar", "Devisar"]);
    }

    #[test]
    fn predicates_compose_with_and() {
        let rows = working_set();
        let regions = kutch();
        let state = FilterState::default()
            .with_district(Some("kutch".into()), &regions)
            .with_taluka(Some("nakhatrana".into()), &regions)
            .with_density_category(Some("high".into()));
        assert_eq!(villages(&select(&rows, &state, &regions)), vec!["Vithon"]);

        let by_range = FilterState::default()
            .with_biomass_range(Some("150-200".into()))
            .with_village(Some("KUKMA".into()));
        assert_eq!(villages(&select(&rows, &by_range, &regions)), vec!["Kukma"]);

        let nothing = FilterState::default().with_district(Some("Banaskantha".into()), &regions);
        assert!(select(&rows, &nothing, &regions).is_empty());
    }

    #[test]
    fn district_falls_back_to_hierarchy_when_row_lacks_it() {
        let mut rows = working_set();
        rows.iter_mut().for_each(|r| r.district = None);
        let regions = kutch();
        let state = FilterState::default().with_district(Some("Kutch".into()), &regions);
        assert_eq!(select(&rows, &state, &regions).len(), 5);
    }

    #[test]
    fn cleared_state_returns_everything_in_input_order() {
        let rows = working_set();
        let regions = kutch();
        let state = FilterState::default()
            .with_search(Some("x".into()))
            .toggle_sort(CanonicalField::Village)
            .cleared();
        assert_eq!(state, FilterState::default());
        let all = select(&rows, &state, &regions);
        assert_eq!(all.len(), rows.len());
        assert_eq!(all[0].village.as_deref(), Some("Kukma"));
    }

    #[test]
    fn facets_follow_selection() {
        let rows = working_set();
        let regions = kutch();
        let state = FilterState::default()
            .with_district(Some("Kutch".into()), &regions)
            .with_taluka(Some("Bhuj".into()), &regions);
        let f = facets(&rows, &state, &regions);
        assert_eq!(f.talukas, vec!["Bhuj", "Nakhatrana"]);
        assert_eq!(f.villages, vec!["Kukma", "Lakhond", "Madhapar"]);
        assert_eq!(f.biomass_ranges, vec!["0-50", "100-150", "150-200"]);

        let everywhere = facets(&rows, &FilterState::default(), &regions);
        assert_eq!(everywhere.talukas.len(), 3);
        assert_eq!(everywhere.villages.len(), 5);
    }

    #[test]
    fn export_uses_labels_and_blank_nulls() {
        let rows = working_set();
        let csv = export_csv(rows.iter().skip(3)).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(
            lines[0],
            "Village,Taluka,District,State,Density Category,Quantity per Hectare,Biomass Range"
        );
        assert_eq!(lines[1], "Vithon,Nakhatrana,Kutch,Gujarat,HIGH,160,150-200");
        assert_eq!(lines[2], "Devisar,Nakhatrana,Kutch,Gujarat,Low,,0-50");
    }
}
