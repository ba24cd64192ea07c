//! Output documents built from live and synthetic datasets.

use std::sync::Arc;

use serde_json::Value;

use petreg::transport::{HttpResponse, Scripted};
use petreg::{
    Category, Dataset, FallbackSynthesizer, HarvestConfig, Harvester, RecordingSleeper,
    ReplayTransport,
};
use petreg_cli::output::{
    format_as_js, format_as_json, format_report, script_object, write_all, OutputPaths,
};

// ─────────────────────── helpers ───────────────────────

const TABLE: &str = r#"<table class="table">
    <tr><th>縣市</th><th>登記數(A)</th><th>除戶數(B)</th><th>絕育數(E)</th><th>絕育除戶數(F)</th></tr>
    <tr><td>合計</td><td>1,000</td><td>0</td><td>500</td><td>0</td></tr>
    <tr><td>臺南市</td><td>600</td><td>0</td><td>300</td><td>0</td></tr>
    <tr><td>宜蘭縣</td><td>400</td><td>0</td><td>200</td><td>0</td></tr>
</table>"#;

async fn live_dataset() -> Dataset {
    let transport = Arc::new(
        ReplayTransport::new("<form></form>")
            .with_fallback(Scripted::Respond(HttpResponse::ok(TABLE))),
    );
    let mut config = HarvestConfig {
        start_year: 2021,
        end_year: Some(2022),
        ..HarvestConfig::default()
    };
    config.pacing.min_ms = 0;
    config.pacing.max_ms = 0;
    Harvester::new(config, transport)
        .with_sleeper(Arc::new(RecordingSleeper::new()))
        .run()
        .await
}

fn synthetic_dataset() -> Dataset {
    FallbackSynthesizer::new(Some(8)).generate(
        2020,
        2020,
        &["花蓮縣".to_string()],
        &[Category::Dog],
    )
}

// ─────────────────────── documents ───────────────────────

#[tokio::test]
async fn test_json_document_keeps_unicode() {
    let dataset = live_dataset().await;
    let json = format_as_json(&dataset).unwrap();

    assert!(json.contains("臺南市"));
    assert!(!json.contains("\\u"));
    let parsed: Value = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed["items"].as_array().unwrap().len(), 12);
    assert_eq!(parsed["synthetic"], false);
}

#[tokio::test]
async fn test_script_object_lookup_lists() {
    let dataset = live_dataset().await;
    let object = script_object(&dataset);

    assert_eq!(object["cities"], serde_json::json!(["宜蘭縣", "臺南市"]));
    assert_eq!(object["years"], serde_json::json!(["2022", "2021"]));
    assert_eq!(object["animalTypes"], serde_json::json!(["cat", "dog"]));

    let js = format_as_js(&dataset, "petData").unwrap();
    assert!(js.starts_with("const petData = {"));
    assert!(js.ends_with("};\n"));
    assert!(format_as_js(&dataset, "1bad-name").is_err());
}

#[test]
fn test_report_flags_synthetic_data() {
    let report = format_report(&synthetic_dataset());
    assert!(report.contains("Source: synthetic"));
    assert!(report.contains("Items: 1"));
    assert!(report.contains("WARNING: synthetic"));
    assert!(report.contains("1. 2020 花蓮縣 狗"));
    assert!(report.contains("sterilization rate:"));
}

#[tokio::test]
async fn test_live_report_has_no_warning() {
    let report = format_report(&live_dataset().await);
    assert!(!report.contains("WARNING"));
    assert!(report.contains("registered: 1,000"));
    assert!(report.contains("sterilization rate: 50.00"));
    assert!(!report.contains("Error:"));
}

#[test]
fn test_write_all_creates_layout() {
    let dir = tempfile::tempdir().unwrap();
    let paths = OutputPaths::under(dir.path());
    write_all(&synthetic_dataset(), &paths, "scrapedData").unwrap();

    assert_eq!(paths.json, dir.path().join("data").join("scraped_data.json"));
    assert!(paths.json.exists());
    assert!(paths.report.exists());
    let js = std::fs::read_to_string(&paths.js).unwrap();
    assert!(js.starts_with("const scrapedData = "));
    assert!(dir.path().join("public").join("js").join("data.js").exists());
}
