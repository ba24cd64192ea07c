//! Core data types: query keys, canonical records, and the run dataset.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AcquireError;

/// Region value substituted for aggregate ("total") rows.
pub const AGGREGATE_REGION: &str = "全國";

/// Canonical field names shared by every response encoding.
pub mod fields {
    pub const REGION: &str = "region";
    pub const REGISTRATION_UNITS: &str = "registration_units";
    pub const REGISTERED: &str = "registered";
    pub const REMOVED: &str = "removed";
    pub const TRANSFERRED: &str = "transferred";
    pub const CHANGED: &str = "changed";
    pub const STERILIZED: &str = "sterilized";
    pub const STERILIZED_REMOVED: &str = "sterilized_removed";
    pub const STERILIZATION_RATE: &str = "sterilization_rate";
    pub const EXEMPTED: &str = "exempted";

    /// Every canonical name, in display order.
    pub const ALL: [&str; 10] = [
        REGION,
        REGISTRATION_UNITS,
        REGISTERED,
        REMOVED,
        TRANSFERRED,
        CHANGED,
        STERILIZED,
        STERILIZED_REMOVED,
        STERILIZATION_RATE,
        EXEMPTED,
    ];
}

/// A raw field-keyed record as produced by the decoder.
pub type RawRecord = BTreeMap<String, String>;

/// Animal category accepted by the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Dog,
    Cat,
}

impl Category {
    /// Declared order of all categories.
    pub const ALL: [Category; 2] = [Category::Dog, Category::Cat];

    /// Canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Dog => "dog",
            Category::Cat => "cat",
        }
    }

    /// Value the source expects in its animal selector.
    pub fn source_code(&self) -> &'static str {
        match self {
            Category::Dog => "0",
            Category::Cat => "1",
        }
    }

    /// Label the source uses in its own pages.
    pub fn label(&self) -> &'static str {
        match self {
            Category::Dog => "狗",
            Category::Cat => "貓",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = AcquireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dog" | "dogs" | "0" | "狗" => Ok(Category::Dog),
            "cat" | "cats" | "1" | "貓" => Ok(Category::Cat),
            other => Err(AcquireError::Config(format!(
                "unknown category '{other}' (expected dog or cat)"
            ))),
        }
    }
}

/// One unit of acquisition work: a date range and a category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryKey {
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub category: Category,
}

impl QueryKey {
    /// Key covering the whole calendar year.
    ///
    /// Years outside chrono's range collapse to the minimum date; the
    /// dispatcher never produces such years from a validated config.
    pub fn for_year(year: i32, category: Category) -> Self {
        let period_start = NaiveDate::from_ymd_opt(year, 1, 1).unwrap_or(NaiveDate::MIN);
        let period_end = NaiveDate::from_ymd_opt(year, 12, 31).unwrap_or(NaiveDate::MIN);
        Self {
            period_start,
            period_end,
            category,
        }
    }

    /// Period label stamped on records (the start year).
    pub fn period_label(&self) -> String {
        self.period_start.format("%Y").to_string()
    }

    /// Start date in the source's `yyyy/MM/dd` format.
    pub fn start_param(&self) -> String {
        self.period_start.format("%Y/%m/%d").to_string()
    }

    /// End date in the source's `yyyy/MM/dd` format.
    pub fn end_param(&self) -> String {
        self.period_end.format("%Y/%m/%d").to_string()
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}/{}",
            self.start_param(),
            self.end_param(),
            self.category
        )
    }
}

/// A normalized observation for one region, period and category.
///
/// Records are never mutated once appended to a dataset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanonicalRecord {
    pub period: String,
    pub period_start: String,
    pub period_end: String,
    pub category: Category,
    /// True when the record was fabricated by the fallback synthesizer.
    pub synthetic: bool,
    #[serde(flatten)]
    pub fields: BTreeMap<String, String>,
}

impl CanonicalRecord {
    /// Region identifier. Always present for records built by the decoder.
    pub fn region(&self) -> &str {
        self.fields
            .get(fields::REGION)
            .map(String::as_str)
            .unwrap_or(AGGREGATE_REGION)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// Parse a field as a number, tolerating thousands separators and `%`.
    pub fn number(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(parse_number)
    }

    pub fn is_aggregate(&self) -> bool {
        self.region() == AGGREGATE_REGION
    }
}

/// Parse a source-formatted number (`"1,234"`, `" 56.7 % "`).
pub fn parse_number(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .trim()
        .trim_end_matches('%')
        .chars()
        .filter(|c| *c != ',' && !c.is_whitespace())
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// The result of one run: records plus provenance metadata.
///
/// Serializes to the canonical dictionary form consumed by formatters.
#[derive(Debug, Clone, Serialize)]
pub struct Dataset {
    last_updated: DateTime<Utc>,
    source_url: String,
    run_id: Uuid,
    error: Option<String>,
    synthetic: bool,
    #[serde(rename = "items")]
    records: Vec<CanonicalRecord>,
}

impl Dataset {
    pub(crate) fn new(
        source_url: String,
        run_id: Uuid,
        records: Vec<CanonicalRecord>,
        error: Option<String>,
        synthetic: bool,
    ) -> Self {
        Self {
            last_updated: Utc::now(),
            source_url,
            run_id,
            error,
            synthetic,
            records,
        }
    }

    pub fn records(&self) -> &[CanonicalRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn last_updated(&self) -> DateTime<Utc> {
        self.last_updated
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// True when the dataset was produced by fallback synthesis.
    pub fn is_synthetic(&self) -> bool {
        self.synthetic
    }

    /// Copy of this dataset carrying a run-level error.
    pub(crate) fn with_error(mut self, error: Option<String>) -> Self {
        if error.is_some() {
            self.error = error;
        }
        self
    }

    /// Canonical dictionary form as a JSON value.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Owns the growing record list for a run. Append-only.
#[derive(Debug)]
pub struct Aggregator {
    source_url: String,
    run_id: Uuid,
    records: Vec<CanonicalRecord>,
    error: Option<String>,
}

impl Aggregator {
    pub fn new(source_url: impl Into<String>, run_id: Uuid) -> Self {
        Self {
            source_url: source_url.into(),
            run_id,
            records: Vec::new(),
            error: None,
        }
    }

    pub fn append(&mut self, records: Vec<CanonicalRecord>) {
        self.records.extend(records);
    }

    pub fn record_error(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn finish(self) -> Dataset {
        Dataset::new(self.source_url, self.run_id, self.records, self.error, false)
    }
}
