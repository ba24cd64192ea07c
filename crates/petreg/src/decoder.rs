//! Response decoding: HTML result tables and JSON envelopes.
//!
//! The source has answered with two encodings over its history. Which one a
//! response uses is decided by sniffing the body, never by the caller. Both
//! paths end in the same field-keyed [`RawRecord`] shape, with field names
//! translated through a versioned [`FieldCodeTable`].

use std::collections::HashMap;

use scraper::{ElementRef, Html, Selector};
use serde_json::{Map, Value};

use crate::error::{AcquireError, AcquireResult};
use crate::types::{fields, RawRecord, AGGREGATE_REGION};

/// Cell texts that mark a cross-region totals row.
const AGGREGATE_MARKERS: &[&str] = &["合計", "總計", "全國合計", "total"];

/// Keys that may carry a success flag in an envelope.
const SUCCESS_KEYS: &[&str] = &["Success", "success", "IsSuccess"];

/// Keys that may carry the payload in an envelope, in lookup order.
const PAYLOAD_KEYS: &[&str] = &["d", "Message", "Data", "data", "Result", "Rows"];

/// Envelope layers (objects and encoded strings) peeled before giving up.
const MAX_ENVELOPE_DEPTH: usize = 6;

/// One undecoded response body, tagged by encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum RawResponse {
    Html(String),
    Envelope(Value),
}

impl RawResponse {
    /// Classify a response body by content alone.
    ///
    /// Anything that parses as JSON (including a bare encoded string or
    /// `null`) is an envelope; otherwise anything with markup is HTML.
    pub fn sniff(body: &str) -> AcquireResult<Self> {
        let trimmed = body.trim_start_matches('\u{feff}').trim();

        if !trimmed.starts_with('<') {
            match serde_json::from_str::<Value>(trimmed) {
                Ok(value) => return Ok(RawResponse::Envelope(value)),
                Err(e) if !trimmed.contains('<') && looks_json(trimmed) => {
                    return Err(AcquireError::Decode(format!("malformed JSON payload: {e}")));
                }
                Err(_) => {}
            }
        }

        if trimmed.contains('<') {
            Ok(RawResponse::Html(trimmed.to_string()))
        } else {
            Err(AcquireError::Decode(
                "payload is neither HTML nor JSON".to_string(),
            ))
        }
    }
}

fn looks_json(body: &str) -> bool {
    matches!(body.chars().next(), Some('{' | '[' | '"'))
}

/// Source field code → canonical field name.
///
/// Canonical names always map to themselves, so already-canonical payloads
/// pass through unchanged.
#[derive(Debug, Clone)]
pub struct FieldCodeTable {
    version: u32,
    codes: HashMap<String, String>,
}

impl FieldCodeTable {
    /// The mapping observed on the source as of the first release.
    pub fn v1() -> Self {
        let mut table = Self {
            version: 1,
            codes: HashMap::new(),
        };
        for name in fields::ALL {
            table = table.with_code(name, name);
        }

        // Structured-envelope codes.
        let envelope = [
            ("CountyName", fields::REGION),
            ("Area", fields::REGION),
            ("OrgCnt", fields::REGISTRATION_UNITS),
            ("RegCnt", fields::REGISTERED),
            ("DelCnt", fields::REMOVED),
            ("TransferCnt", fields::TRANSFERRED),
            ("ChangeCnt", fields::CHANGED),
            ("NeuterCnt", fields::STERILIZED),
            ("NeuterDelCnt", fields::STERILIZED_REMOVED),
            ("NeuterRate", fields::STERILIZATION_RATE),
            ("ExemptCnt", fields::EXEMPTED),
        ];
        // Cleaned HTML header tokens.
        let headers = [
            ("縣市", fields::REGION),
            ("縣市別", fields::REGION),
            ("登記單位數", fields::REGISTRATION_UNITS),
            ("登記數", fields::REGISTERED),
            ("除戶數", fields::REMOVED),
            ("轉讓數", fields::TRANSFERRED),
            ("變更數", fields::CHANGED),
            ("絕育數", fields::STERILIZED),
            ("絕育除戶數", fields::STERILIZED_REMOVED),
            ("絕育率", fields::STERILIZATION_RATE),
            ("免絕育數", fields::EXEMPTED),
        ];
        for (code, name) in envelope.into_iter().chain(headers) {
            table = table.with_code(code, name);
        }
        table
    }

    /// Add or override one mapping.
    pub fn with_code(mut self, code: impl Into<String>, canonical: impl Into<String>) -> Self {
        self.codes.insert(code.into(), canonical.into());
        self
    }

    /// Bump the version after extending the table.
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn canonical(&self, code: &str) -> Option<&str> {
        self.codes.get(code).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

impl Default for FieldCodeTable {
    fn default() -> Self {
        Self::v1()
    }
}

/// Decodes raw responses into field-keyed records.
#[derive(Debug, Clone, Default)]
pub struct ResponseDecoder {
    table: FieldCodeTable,
}

impl ResponseDecoder {
    pub fn new(table: FieldCodeTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &FieldCodeTable {
        &self.table
    }

    /// Decode one response.
    ///
    /// Malformed rows are skipped individually. Fails only when nothing at
    /// all could be decoded.
    pub fn decode(&self, raw: &RawResponse) -> AcquireResult<Vec<RawRecord>> {
        let records = match raw {
            RawResponse::Html(html) => self.decode_table(html)?,
            RawResponse::Envelope(value) => self.decode_envelope(value)?,
        };
        if records.is_empty() {
            return Err(AcquireError::Decode(
                "payload yielded no records".to_string(),
            ));
        }
        Ok(records)
    }

    fn decode_table(&self, html: &str) -> AcquireResult<Vec<RawRecord>> {
        let document = Html::parse_document(html);
        let table_sel = selector("table.table")?;
        let any_table_sel = selector("table")?;
        let row_sel = selector("tr")?;
        let th_sel = selector("th")?;
        let td_sel = selector("td")?;

        let Some(table) = document
            .select(&table_sel)
            .next()
            .or_else(|| document.select(&any_table_sel).next())
        else {
            return Err(AcquireError::Decode("no result table in HTML".to_string()));
        };

        let mut headers: Vec<String> = Vec::new();
        let mut records = Vec::new();

        for row in table.select(&row_sel) {
            let header_cells: Vec<ElementRef> = row.select(&th_sel).collect();
            if headers.is_empty() {
                if !header_cells.is_empty() {
                    headers = header_cells.iter().map(|c| self.header_name(c)).collect();
                    continue;
                }
                // Header-less tables use their first row as headers.
                let first: Vec<ElementRef> = row.select(&td_sel).collect();
                if !first.is_empty() {
                    headers = first.iter().map(|c| self.header_name(c)).collect();
                }
                continue;
            }

            let cells: Vec<String> = row.select(&td_sel).map(|c| cell_text(&c)).collect();
            if cells.is_empty() {
                continue;
            }
            if cells.len() < headers.len() {
                tracing::debug!(
                    cells = cells.len(),
                    headers = headers.len(),
                    "skipping short table row"
                );
                continue;
            }
            if let Some(record) = zip_row(&headers, &cells) {
                records.push(record);
            }
        }

        Ok(records)
    }

    /// Cleaned header token, translated when the table knows it.
    fn header_name(&self, cell: &ElementRef) -> String {
        let token = clean_header(&cell.text().collect::<String>());
        self.table
            .canonical(&token)
            .map(str::to_string)
            .unwrap_or(token)
    }

    fn decode_envelope(&self, value: &Value) -> AcquireResult<Vec<RawRecord>> {
        let items = unwrap_envelope(value, 0)?;
        let records = items
            .iter()
            .filter_map(|item| self.translate_item(item))
            .collect();
        Ok(records)
    }

    fn translate_item(&self, item: &Map<String, Value>) -> Option<RawRecord> {
        let mut record = RawRecord::new();
        for (code, value) in item {
            let Some(name) = self.table.canonical(code) else {
                continue;
            };
            let text = match value {
                Value::String(s) => s.trim().to_string(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => continue,
            };
            if !text.is_empty() {
                record.insert(name.to_string(), text);
            }
        }

        let region = record.get(fields::REGION)?;
        if is_aggregate_marker(region) {
            record.insert(fields::REGION.to_string(), AGGREGATE_REGION.to_string());
        }
        Some(record)
    }
}

fn selector(css: &str) -> AcquireResult<Selector> {
    Selector::parse(css).map_err(|e| AcquireError::Decode(format!("bad selector {css}: {e}")))
}

/// Strip embedded whitespace and any parenthetical suffix.
///
/// `"登記數\n(A)"` becomes `"登記數"`, `"絕育率（E-F）/（A-B）"` becomes `"絕育率"`.
pub fn clean_header(raw: &str) -> String {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    match compact.find(|c: char| c == '(' || c == '（') {
        Some(idx) => compact[..idx].to_string(),
        None => compact,
    }
}

pub fn is_aggregate_marker(text: &str) -> bool {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    AGGREGATE_MARKERS
        .iter()
        .any(|m| compact.eq_ignore_ascii_case(m))
}

fn cell_text(cell: &ElementRef) -> String {
    cell.text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Zip one body row onto the headers. Rows without a region are dropped.
fn zip_row(headers: &[String], cells: &[String]) -> Option<RawRecord> {
    let mut record = RawRecord::new();
    for (header, value) in headers.iter().zip(cells) {
        if header.is_empty() || value.is_empty() {
            continue;
        }
        record.insert(header.clone(), value.clone());
    }

    let first = cells.first()?;
    if is_aggregate_marker(first) {
        record.insert(fields::REGION.to_string(), AGGREGATE_REGION.to_string());
    } else if !record.contains_key(fields::REGION) {
        if first.is_empty() {
            return None;
        }
        record.insert(fields::REGION.to_string(), first.clone());
    }
    Some(record)
}

/// Peel envelope layers until a list of item objects is reached.
fn unwrap_envelope(value: &Value, depth: usize) -> AcquireResult<Vec<Map<String, Value>>> {
    if depth > MAX_ENVELOPE_DEPTH {
        return Err(AcquireError::Decode("envelope nested too deeply".to_string()));
    }

    match value {
        Value::String(inner) => {
            let parsed: Value = serde_json::from_str(inner.trim()).map_err(|e| {
                AcquireError::Decode(format!("double-encoded payload is not JSON: {e}"))
            })?;
            unwrap_envelope(&parsed, depth + 1)
        }
        Value::Array(items) => Ok(items
            .iter()
            .filter_map(|item| item.as_object().cloned())
            .collect()),
        Value::Object(map) => {
            if let Some(flag) = SUCCESS_KEYS.iter().find_map(|k| map.get(*k)) {
                if flag.as_bool() == Some(false) {
                    let detail = PAYLOAD_KEYS
                        .iter()
                        .find_map(|k| map.get(*k))
                        .and_then(Value::as_str)
                        .unwrap_or("no detail");
                    return Err(AcquireError::Decode(format!(
                        "source reported failure: {detail}"
                    )));
                }
            }
            match PAYLOAD_KEYS.iter().find_map(|k| map.get(*k)) {
                Some(payload) => unwrap_envelope(payload, depth + 1),
                // A bare object is a single item.
                None => Ok(vec![map.clone()]),
            }
        }
        Value::Null => Err(AcquireError::EmptyPayload),
        other => Err(AcquireError::Decode(format!(
            "unexpected envelope value: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TABLE: &str = r#"
        <table class="table">
          <thead><tr>
            <th>縣市</th><th>登記單位數</th><th>登記數<br/>(A)</th><th>除戶數<br>(B)</th>
            <th>絕育數(E)</th><th>絕育除戶數(F)</th><th>絕育率<br/>(E-F)/(A-B)</th><th>備註</th>
          </tr></thead>
          <tbody>
            <tr><td>合計</td><td>1,200</td><td>150,000</td><td>20,000</td><td>90,000</td><td>5,000</td><td>65.38%</td><td></td></tr>
            <tr><td>臺北市</td><td>120</td><td>12,000</td><td>2,000</td><td>6,000</td><td>500</td><td>55.00%</td><td>x</td></tr>
            <tr><td>broken</td><td>1</td></tr>
          </tbody>
        </table>"#;

    fn decoder() -> ResponseDecoder {
        ResponseDecoder::default()
    }

    #[test]
    fn test_clean_header() {
        assert_eq!(clean_header("登記數\n(A)"), "登記數");
        assert_eq!(clean_header(" 絕育率（E-F）/（A-B）"), "絕育率");
        assert_eq!(clean_header("縣 市"), "縣市");
    }

    #[test]
    fn test_sniff() {
        assert!(matches!(
            RawResponse::sniff("<table></table>"),
            Ok(RawResponse::Html(_))
        ));
        assert!(matches!(
            RawResponse::sniff(r#"{"d": "[]"}"#),
            Ok(RawResponse::Envelope(_))
        ));
        assert!(RawResponse::sniff("plain words").is_err());
        assert!(RawResponse::sniff("{ broken").is_err());
    }

    #[test]
    fn test_sniff_encoded_string_body() {
        let body = r#""[{\"Area\":\"澎湖縣\",\"RegCnt\":\"12\"}]""#;
        let raw = RawResponse::sniff(body).unwrap();
        assert!(matches!(raw, RawResponse::Envelope(Value::String(_))));

        let records = decoder().decode(&raw).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get(fields::REGION).map(String::as_str), Some("澎湖縣"));
    }

    #[test]
    fn test_null_envelope_is_empty_payload() {
        let raw = RawResponse::sniff("null").unwrap();
        let err = decoder().decode(&raw).unwrap_err();
        assert_eq!(err.classify(), crate::error::FailureClass::EmptyPayload);

        let err = decoder()
            .decode(&RawResponse::Envelope(json!({"Success": true, "d": null})))
            .unwrap_err();
        assert!(matches!(err, AcquireError::EmptyPayload));
    }

    #[test]
    fn test_html_table_decodes_and_relabels_aggregate() {
        let raw = RawResponse::sniff(TABLE).unwrap();
        let records = decoder().decode(&raw).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["region"], AGGREGATE_REGION);
        assert_eq!(records[0]["registered"], "150,000");
        assert_eq!(records[0]["sterilization_rate"], "65.38%");
        assert_eq!(records[1]["region"], "臺北市");
        assert_eq!(records[1]["備註"], "x");
        assert!(!records[0].contains_key("備註"));
    }

    #[test]
    fn test_double_encoded_envelope() {
        let inner = json!([
            {"CountyName": "臺中市", "RegCnt": 500, "DelCnt": "20", "Mystery": 9},
            {"CountyName": "總計", "RegCnt": 900},
            {"RegCnt": 1}
        ])
        .to_string();
        let value = json!({"d": json!({"Success": true, "Message": inner}).to_string()});
        let records = decoder().decode(&RawResponse::Envelope(value)).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["region"], "臺中市");
        assert_eq!(records[0]["registered"], "500");
        assert_eq!(records[0]["removed"], "20");
        assert!(!records[0].contains_key("Mystery"));
        assert_eq!(records[1]["region"], AGGREGATE_REGION);
    }

    #[test]
    fn test_canonical_payload_is_unchanged() {
        let value = json!({"Success": true, "Data": [
            {"region": "嘉義市", "registered": "10", "removed": "2", "sterilization_rate": "40.00"}
        ]});
        let records = decoder().decode(&RawResponse::Envelope(value)).unwrap();
        let keys: Vec<&str> = records[0].keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            vec!["region", "registered", "removed", "sterilization_rate"]
        );
        assert_eq!(records[0]["registered"], "10");
    }

    #[test]
    fn test_failure_flag_and_empty_payloads() {
        let failed = json!({"Success": false, "Message": "查無資料"});
        assert!(matches!(
            decoder().decode(&RawResponse::Envelope(failed)),
            Err(AcquireError::Decode(_))
        ));

        let empty = json!({"d": "[]"});
        assert!(matches!(
            decoder().decode(&RawResponse::Envelope(empty)),
            Err(AcquireError::Decode(_))
        ));

        let no_table = RawResponse::Html("<div>maintenance</div>".to_string());
        assert!(decoder().decode(&no_table).is_err());
    }

    #[test]
    fn test_extended_table() {
        let table = FieldCodeTable::v1()
            .with_code("AdoptCnt", "adopted")
            .with_version(2);
        assert_eq!(table.version(), 2);
        let value = json!([{"Area": "宜蘭縣", "AdoptCnt": 3}]);
        let records = ResponseDecoder::new(table)
            .decode(&RawResponse::Envelope(value))
            .unwrap();
        assert_eq!(records[0]["adopted"], "3");
    }
}
