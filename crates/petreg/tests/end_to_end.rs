//! Offline end-to-end runs against a replayed source.

use std::sync::Arc;

use serde_json::json;

use petreg::transport::{HttpResponse, Scripted};
use petreg::*;

// ─────────────────────── helpers ───────────────────────

const ENTRY: &str = r#"<html><body><form id="form1">
    <input type="hidden" name="__VIEWSTATE" value="dDwtMTA4NzI0NTE7Oz4=" />
    <input type="hidden" name="__EVENTVALIDATION" value="ev" />
    </form></body></html>"#;

/// Result table for one year: a totals row and two regions.
fn table(total: u32, taipei: u32, keelung: u32) -> String {
    format!(
        r#"<div id="result"><table class="table table-bordered">
        <thead><tr>
          <th>縣市</th><th>登記數<br/>(A)</th><th>除戶數<br/>(B)</th>
          <th>絕育數<br/>(E)</th><th>絕育除戶數<br/>(F)</th>
        </tr></thead>
        <tbody>
          <tr><td>合計</td><td>{total}</td><td>0</td><td>{total}</td><td>0</td></tr>
          <tr><td>臺北市</td><td>{taipei}</td><td>0</td><td>0</td><td>0</td></tr>
          <tr><td>基隆市</td><td>{keelung}</td><td>0</td><td>0</td><td>0</td></tr>
        </tbody></table></div>"#
    )
}

fn quiet_config(start_year: i32, end_year: i32) -> HarvestConfig {
    let mut config = HarvestConfig {
        start_year,
        end_year: Some(end_year),
        ..HarvestConfig::default()
    };
    config.retry.base_delay_ms = 10;
    config.pacing.min_ms = 1;
    config.pacing.max_ms = 3;
    config
}

fn harvester(
    config: HarvestConfig,
    transport: Arc<ReplayTransport>,
) -> (Harvester<ReplayTransport>, Arc<RecordingSleeper>, Arc<MemorySink>) {
    let sleeper = Arc::new(RecordingSleeper::new());
    let sink = Arc::new(MemorySink::new());
    let harvester = Harvester::new(config, transport)
        .with_sleeper(sleeper.clone())
        .with_sink(sink.clone())
        .with_seed(99);
    (harvester, sleeper, sink)
}

// ─────────────────────── decode + normalize ───────────────────────

#[test]
fn test_html_year_decodes_to_stamped_records() {
    let html = r#"<table class="table">
        <tr><th>縣市</th><th>登記數(A)</th><th>除戶數(B)</th></tr>
        <tr><td>合計</td><td>1,500</td><td>100</td></tr>
        <tr><td>臺中市</td><td>900</td><td>40</td></tr>
    </table>"#;
    let key = QueryKey::for_year(2019, Category::Dog);
    assert_eq!(key.start_param(), "2019/01/01");
    assert_eq!(key.end_param(), "2019/12/31");

    let raw = RawResponse::sniff(html).unwrap();
    let records: Vec<CanonicalRecord> = ResponseDecoder::default()
        .decode(&raw)
        .unwrap()
        .into_iter()
        .map(|r| normalize(r, &key))
        .collect();

    assert_eq!(records.len(), 2);
    for record in &records {
        assert_eq!(record.period, "2019");
        assert_eq!(record.category, Category::Dog);
        assert!(!record.synthetic);
    }
    assert_eq!(records[0].region(), AGGREGATE_REGION);
    assert_ne!(records[0].region(), "合計");
    assert_eq!(records[1].region(), "臺中市");
}

// ─────────────────────── full runs ───────────────────────

#[tokio::test]
async fn test_live_run_collects_every_key() {
    let transport = Arc::new(ReplayTransport::new(ENTRY));
    // Descending order: 2020 dog, 2020 cat, 2019 dog, 2019 cat.
    transport.push_response(200, table(30, 20, 10));
    transport.push_response(200, table(3, 2, 1));
    transport.push_response(200, table(300, 200, 100));
    transport.push_response(200, table(6, 4, 2));

    let (harvester, sleeper, sink) = harvester(quiet_config(2019, 2020), transport.clone());
    let dataset = harvester.run().await;

    assert_eq!(dataset.len(), 12);
    assert!(!dataset.is_synthetic());
    assert!(dataset.error().is_none());
    assert_eq!(dataset.source_url(), "https://www.pet.gov.tw/Web/O302.aspx");

    let first = &dataset.records()[0];
    assert_eq!(first.period, "2020");
    assert_eq!(first.category, Category::Dog);
    assert_eq!(first.get("registered"), Some("30"));
    assert_eq!(first.get("sterilization_rate"), Some("100.00"));

    let last = &dataset.records()[11];
    assert_eq!(last.period, "2019");
    assert_eq!(last.category, Category::Cat);
    assert_eq!(last.region(), "基隆市");

    // Three pacing delays between four keys, no retries.
    assert_eq!(sleeper.slept().len(), 3);
    assert_eq!(transport.count("POST_FORM"), 4);
    assert_eq!(
        sink.count(|e| matches!(e, HarvestEvent::RunFinished { records: 12, .. })),
        1
    );
}

#[tokio::test]
async fn test_unreachable_source_yields_synthetic_dataset() {
    let transport = Arc::new(ReplayTransport::unreachable());
    let mut config = quiet_config(2020, 2021);
    config.synthesis.regions = vec!["臺北市".into(), "花蓮縣".into()];

    let (harvester, _, sink) = harvester(config, transport.clone());
    let dataset = harvester.run().await;

    assert!(dataset.is_synthetic());
    assert_eq!(dataset.len(), 2 * 2 * 2);
    assert!(dataset.records().iter().all(|r| r.synthetic));
    assert!(dataset.error().unwrap().contains("session bootstrap failed"));
    assert_eq!(transport.count("POST_FORM"), 0);

    let value = dataset.to_value();
    assert_eq!(value["synthetic"], true);
    assert_eq!(value["items"][0]["synthetic"], true);
    assert_eq!(
        sink.count(|e| matches!(e, HarvestEvent::SynthesisUsed { records: 8, .. })),
        1
    );
}

#[tokio::test]
async fn test_synthesis_disabled_returns_empty_dataset_with_error() {
    let transport = Arc::new(ReplayTransport::unreachable());
    let mut config = quiet_config(2020, 2020);
    config.synthesis.enabled = false;

    let (harvester, _, _) = harvester(config, transport);
    let dataset = harvester.run().await;

    assert!(dataset.is_empty());
    assert!(!dataset.is_synthetic());
    assert!(dataset.error().is_some());
}

#[tokio::test]
async fn test_every_key_failing_falls_back_after_full_enumeration() {
    // Entry page works, every query comes back empty.
    let transport = Arc::new(ReplayTransport::new(ENTRY));
    let mut config = quiet_config(2020, 2020);
    config.retry.max_attempts = 2;

    let (harvester, sleeper, sink) = harvester(config, transport.clone());
    let dataset = harvester.run().await;

    assert!(dataset.is_synthetic());
    assert_eq!(transport.count("POST_FORM"), 4);
    assert_eq!(
        sink.count(|e| matches!(e, HarvestEvent::KeyAbandoned { .. })),
        2
    );
    // One fixed backoff per key plus one pacing delay between keys.
    assert_eq!(sleeper.slept().len(), 3);
}

#[tokio::test]
async fn test_service_shape_decodes_double_encoded_envelope() {
    let payload = json!({
        "Success": true,
        "Message": json!([
            {"CountyName": "全國合計", "RegCnt": "2,000", "DelCnt": "500", "NeuterCnt": 900, "NeuterDelCnt": 150},
            {"CountyName": "高雄市", "RegCnt": 700, "DelCnt": 100, "NeuterCnt": 330, "NeuterDelCnt": 30, "Extra": "x"}
        ]).to_string()
    });
    let envelope = json!({ "d": payload.to_string() }).to_string();
    let transport = Arc::new(ReplayTransport::new(ENTRY).with_fallback(Scripted::Respond(
        HttpResponse::ok(envelope).with_header("content-type", "application/json; charset=utf-8"),
    )));

    let mut config = quiet_config(2021, 2021);
    config.categories = vec![Category::Cat];
    config.source.query_shape = QueryShape::Service;

    let (harvester, _, _) = harvester(config, transport.clone());
    let dataset = harvester.run().await;

    assert_eq!(dataset.len(), 2);
    assert_eq!(dataset.records()[0].region(), AGGREGATE_REGION);
    assert_eq!(dataset.records()[0].get("sterilization_rate"), Some("50.00"));
    assert_eq!(dataset.records()[1].get("sterilization_rate"), Some("50.00"));
    assert!(dataset.records()[1].get("Extra").is_none());

    let requests = transport.requests();
    let query = requests.iter().find(|r| r.method == "POST_JSON").unwrap();
    let body = query.json.as_ref().unwrap();
    assert_eq!(body["SDATE"], "2021/01/01");
    assert_eq!(body["Animal"], "1");
}

#[tokio::test]
async fn test_invalid_config_skips_network() {
    let transport = Arc::new(ReplayTransport::new(ENTRY));
    let mut config = quiet_config(2020, 2020);
    config.pacing.min_ms = 10;
    config.pacing.max_ms = 1;
    config.synthesis.enabled = false;

    let (harvester, _, _) = harvester(config, transport.clone());
    let dataset = harvester.run().await;

    assert!(dataset.is_empty());
    assert!(dataset.error().unwrap().contains("pacing"));
    assert!(transport.requests().is_empty());
}

#[tokio::test]
async fn test_rejected_config_is_never_synthesized() {
    let transport = Arc::new(ReplayTransport::new(ENTRY));
    let mut config = quiet_config(2000, 12_000);
    config.synthesis.enabled = true;
    config.synthesis.regions = vec!["臺北市".into()];

    let (harvester, _, sink) = harvester(config, transport.clone());
    let dataset = harvester.run().await;

    assert!(dataset.is_empty());
    assert!(!dataset.is_synthetic());
    assert!(dataset.error().unwrap().contains("1..=9999"));
    assert!(transport.requests().is_empty());
    assert_eq!(
        sink.count(|e| matches!(e, HarvestEvent::SynthesisUsed { .. })),
        0
    );
    assert_eq!(
        sink.count(|e| matches!(e, HarvestEvent::RunStarted { total_keys: 0, .. })),
        1
    );
}

#[tokio::test]
async fn test_extreme_year_range_is_reported_not_raised() {
    let transport = Arc::new(ReplayTransport::new(ENTRY));
    let config = quiet_config(-2_000_000_000, 2_000_000_000);

    let (harvester, _, _) = harvester(config, transport.clone());
    let dataset = harvester.run().await;

    assert!(dataset.is_empty());
    assert!(!dataset.is_synthetic());
    assert!(dataset.error().is_some());
    assert!(transport.requests().is_empty());
}
