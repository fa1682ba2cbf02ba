//! Shared parsing helpers for venue payloads.
//!
//! Exchange APIs disagree on number encoding (strings vs numbers),
//! timestamp units and symbol separators; everything is funneled through
//! these helpers before it reaches a `FundingSnapshot`.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

/// Lenient float extraction: accepts JSON numbers and numeric strings,
/// treats empty strings and nulls as absent.
pub fn safe_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                None
            } else {
                trimmed.parse::<f64>().ok()
            }
        }
        _ => None,
    }
}

/// Extract a non-empty string field.
pub fn value_str(value: &Value) -> Option<&str> {
    match value {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim()),
        _ => None,
    }
}

/// Millisecond timestamp (number or numeric string) to UTC.
pub fn ms_to_utc(value: &Value) -> Option<DateTime<Utc>> {
    let millis = safe_f64(value)? as i64;
    Utc.timestamp_millis_opt(millis).single()
}

/// Second timestamp to UTC.
pub fn sec_to_utc(value: &Value) -> Option<DateTime<Utc>> {
    let seconds = safe_f64(value)? as i64;
    Utc.timestamp_opt(seconds, 0).single()
}

/// Normalize an exchange symbol to canonical `BASEUSDT` form.
///
/// Handles `BTC/USDT:USDT`, `BTC-USDT-SWAP`, `BTC_USDT` and plain
/// `BTCUSDT`. Returns `None` for anything that is not a USDT pair.
pub fn normalize_usdt_symbol(raw_symbol: &str) -> Option<String> {
    let symbol = raw_symbol.trim().to_ascii_uppercase().replace(' ', "");
    if symbol.is_empty() {
        return None;
    }

    let base = if let Some(idx) = symbol.find("/USDT") {
        &symbol[..idx]
    } else if let Some(idx) = symbol.find("-USDT") {
        &symbol[..idx]
    } else if let Some(idx) = symbol.find("_USDT") {
        &symbol[..idx]
    } else if let Some(stripped) = symbol.strip_suffix("USDT") {
        stripped
    } else {
        return None;
    };

    let base: String = base
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    if base.is_empty() {
        return None;
    }

    Some(format!("{base}USDT"))
}

/// Interval normalization: venues report hours, minutes or seconds and
/// sometimes suffix an `h`. Anything above 24 is treated as minutes,
/// above 2400 as seconds.
pub fn parse_interval_hours(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::String(text) => {
            let lowered = text.trim().to_ascii_lowercase();
            if lowered.is_empty() {
                return None;
            }
            if let Some(stripped) = lowered.strip_suffix('h') {
                stripped.parse::<f64>().ok()?
            } else {
                lowered.parse::<f64>().ok()?
            }
        }
        _ => safe_f64(value)?,
    };

    if parsed <= 0.0 {
        return None;
    }
    if parsed > 2400.0 {
        return Some(parsed / 3600.0);
    }
    if parsed > 24.0 {
        return Some(parsed / 60.0);
    }
    Some(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_safe_f64_variants() {
        assert_eq!(safe_f64(&json!(1.5)), Some(1.5));
        assert_eq!(safe_f64(&json!("0.0001")), Some(0.0001));
        assert_eq!(safe_f64(&json!("")), None);
        assert_eq!(safe_f64(&json!(null)), None);
        assert_eq!(safe_f64(&json!("abc")), None);
    }

    #[test]
    fn test_normalize_usdt_symbol_forms() {
        assert_eq!(normalize_usdt_symbol("BTCUSDT").as_deref(), Some("BTCUSDT"));
        assert_eq!(
            normalize_usdt_symbol("BTC-USDT-SWAP").as_deref(),
            Some("BTCUSDT")
        );
        assert_eq!(normalize_usdt_symbol("BTC_USDT").as_deref(), Some("BTCUSDT"));
        assert_eq!(
            normalize_usdt_symbol("btc/usdt:usdt").as_deref(),
            Some("BTCUSDT")
        );
        assert_eq!(normalize_usdt_symbol("BTCUSD_PERP"), None);
        assert_eq!(normalize_usdt_symbol(""), None);
        assert_eq!(normalize_usdt_symbol("USDT"), None);
    }

    #[test]
    fn test_parse_interval_hours_units() {
        assert_eq!(parse_interval_hours(&json!(8)), Some(8.0));
        assert_eq!(parse_interval_hours(&json!("4h")), Some(4.0));
        // 480 minutes = 8 hours
        assert_eq!(parse_interval_hours(&json!(480)), Some(8.0));
        // 28800 seconds = 8 hours
        assert_eq!(parse_interval_hours(&json!(28800)), Some(8.0));
        assert_eq!(parse_interval_hours(&json!(0)), None);
    }

    #[test]
    fn test_ms_to_utc() {
        let ts = ms_to_utc(&json!(1_700_000_000_000i64)).unwrap();
        assert_eq!(ts.timestamp_millis(), 1_700_000_000_000);
        assert!(ms_to_utc(&json!("")).is_none());
    }
}
