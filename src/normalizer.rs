//! Flattens a raw status record into publishable strings.

use crate::appliance::{ApplianceStatus, StatusValue};
use std::collections::BTreeMap;

/// Sanitized field name → published value
pub type NormalizedStatus = BTreeMap<String, String>;

/// Normalizes one status record.
///
/// Booleans become `"1"`/`"0"`, null and nested values are dropped, and every run of
/// characters outside `[A-Za-z0-9_]` in a field name becomes a single `_`. When two raw
/// names sanitize to the same key, the later one wins.
pub fn normalize_status(status: &ApplianceStatus) -> NormalizedStatus {
    let mut normalized = NormalizedStatus::new();

    for (key, value) in status.iter() {
        let rendered = match value {
            StatusValue::Bool(true) => "1".to_string(),
            StatusValue::Bool(false) => "0".to_string(),
            StatusValue::Number(n) => format_number(*n),
            StatusValue::Text(s) => s.clone(),
            StatusValue::Null | StatusValue::Nested(_) => continue,
        };
        normalized.insert(sanitize_key(key), rendered);
    }

    normalized
}

pub fn sanitize_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut in_run = false;

    for c in key.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            out.push(c);
            in_run = false;
        } else if !in_run {
            out.push('_');
            in_run = true;
        }
    }

    out
}

/// Shortest decimal rendering; integral values carry no fractional part.
pub fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}
