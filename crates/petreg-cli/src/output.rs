//! Output collaborators: JSON document, script-variable document, text report.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde_json::Value;

use petreg::{fields, Dataset, AGGREGATE_REGION};

/// Default script variable name.
pub const DEFAULT_JS_VAR: &str = "scrapedData";

/// Where the three documents are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPaths {
    pub json: PathBuf,
    pub js: PathBuf,
    pub report: PathBuf,
}

impl OutputPaths {
    /// `data/scraped_data.json`, `public/js/data.js` and `data/report.txt` under `root`.
    pub fn under(root: &Path) -> Self {
        Self {
            json: root.join("data").join("scraped_data.json"),
            js: root.join("public").join("js").join("data.js"),
            report: root.join("data").join("report.txt"),
        }
    }
}

/// Pretty JSON of the canonical dictionary form. Non-ASCII is kept as-is.
pub fn format_as_json(dataset: &Dataset) -> Result<String> {
    serde_json::to_string_pretty(dataset).context("failed to serialize dataset")
}

/// Dictionary form plus the lookup lists the dashboard expects.
///
/// `cities` excludes the aggregate sentinel, `years` is descending.
pub fn script_object(dataset: &Dataset) -> Value {
    let mut cities = BTreeSet::new();
    let mut years = BTreeSet::new();
    let mut animal_types = BTreeSet::new();

    for record in dataset.records() {
        if let Some(region) = record.get(fields::REGION) {
            if region != AGGREGATE_REGION {
                cities.insert(region.to_string());
            }
        }
        years.insert(record.period.clone());
        animal_types.insert(record.category.as_str().to_string());
    }

    let mut value = dataset.to_value();
    if let Value::Object(map) = &mut value {
        map.insert("cities".into(), cities.into_iter().collect());
        map.insert("years".into(), years.into_iter().rev().collect());
        map.insert("animalTypes".into(), animal_types.into_iter().collect());
    }
    value
}

/// `const <name> = <json>;` followed by a newline.
pub fn format_as_js(dataset: &Dataset, variable_name: &str) -> Result<String> {
    validate_js_identifier(variable_name)?;
    let body = serde_json::to_string_pretty(&script_object(dataset))
        .context("failed to serialize script object")?;
    Ok(format!("const {variable_name} = {body};\n"))
}

/// Reject names that would not parse as a JavaScript identifier.
pub fn validate_js_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_' || c == '$');
    if !valid_start || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$') {
        bail!("'{name}' is not a valid JavaScript identifier");
    }
    Ok(())
}

/// Human-readable summary, one entry per record.
pub fn format_report(dataset: &Dataset) -> String {
    let mut report = Vec::new();
    report.push(format!(
        "Harvest report - {}",
        dataset.last_updated().format("%Y-%m-%d %H:%M:%S UTC")
    ));
    report.push(format!("Source: {}", dataset.source_url()));
    report.push(format!("Run: {}", dataset.run_id()));
    report.push(format!("Items: {}", dataset.len()));
    if dataset.is_synthetic() {
        report.push("WARNING: synthetic data, not sourced from the registry".to_string());
    }
    report.push("-".repeat(50));

    for (i, record) in dataset.records().iter().enumerate() {
        report.push(format!(
            "{}. {} {} {}",
            i + 1,
            record.period,
            record.region(),
            record.category.label()
        ));
        if let Some(registered) = record.get(fields::REGISTERED) {
            report.push(format!("   registered: {registered}"));
        }
        if let Some(rate) = record.get(fields::STERILIZATION_RATE) {
            report.push(format!("   sterilization rate: {rate}"));
        }
        report.push(String::new());
    }

    if let Some(error) = dataset.error() {
        report.push(format!("Error: {error}"));
    }
    report.join("\n")
}

/// Write all three documents, creating directories as needed.
pub fn write_all(dataset: &Dataset, paths: &OutputPaths, variable_name: &str) -> Result<()> {
    write_file(&paths.json, &format_as_json(dataset)?)?;
    write_file(&paths.js, &format_as_js(dataset, variable_name)?)?;
    write_file(&paths.report, &format_report(dataset))?;
    Ok(())
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(path, contents).with_context(|| format!("failed to write {}", path.display()))?;
    tracing::info!("Wrote {}", path.display());
    Ok(())
}
