//! Field normalization: period stamping and derived rates.

use std::collections::BTreeMap;

use crate::types::{fields, parse_number, CanonicalRecord, QueryKey, RawRecord};

/// Turn a decoded record into a canonical one for `key`.
///
/// The sterilization rate is filled in when the source omitted it and all of
/// its inputs are numeric. It is never defaulted.
pub fn normalize(raw: RawRecord, key: &QueryKey) -> CanonicalRecord {
    let mut record_fields = raw;
    if !record_fields.contains_key(fields::STERILIZATION_RATE) {
        if let Some(rate) = sterilization_rate(&record_fields) {
            record_fields.insert(
                fields::STERILIZATION_RATE.to_string(),
                format_rate(rate),
            );
        }
    }

    CanonicalRecord {
        period: key.period_label(),
        period_start: key.start_param(),
        period_end: key.end_param(),
        category: key.category,
        synthetic: false,
        fields: record_fields,
    }
}

/// `(sterilized − sterilized_removed) / (registered − removed) × 100`.
///
/// `None` when an input is missing or non-numeric, or the denominator is zero.
pub fn sterilization_rate(record: &BTreeMap<String, String>) -> Option<f64> {
    let num = |name: &str| record.get(name).and_then(|v| parse_number(v));

    let sterilized = num(fields::STERILIZED)?;
    let sterilized_removed = num(fields::STERILIZED_REMOVED)?;
    let registered = num(fields::REGISTERED)?;
    let removed = num(fields::REMOVED)?;

    let denominator = registered - removed;
    if denominator == 0.0 {
        return None;
    }
    let rate = (sterilized - sterilized_removed) / denominator * 100.0;
    rate.is_finite().then_some(rate)
}

/// Two-decimal rendering used for every rate value.
pub fn format_rate(rate: f64) -> String {
    format!("{rate:.2}")
}
