//! FHIR primitive formats.
//!
//! - `date`: ISO-8601 calendar date without time (`2024-03-01`)
//! - `dateTime`: ISO-8601 date and time with a UTC offset (`2024-03-01T10:15:00+01:00`)
//! - `instant`: UTC timestamp used for `meta.lastUpdated` (`2024-03-01T09:15:00Z`)
//! - `decimal`: JSON number whose written scale is preserved (`1.50` stays `1.50`)

use crate::{FhirError, FhirResult};
use chrono::{DateTime, FixedOffset, NaiveDate, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;

/// Format a calendar date.
pub fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Parse a calendar date. Partial dates and times are rejected.
pub fn parse_date(text: &str) -> FhirResult<NaiveDate> {
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .map_err(|e| FhirError::InvalidInput(format!("invalid date '{text}': {e}")))
}

/// Format a datetime, keeping its offset.
pub fn format_datetime(value: &DateTime<FixedOffset>) -> String {
    value.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Parse a datetime. The offset (or `Z`) is mandatory.
pub fn parse_datetime(text: &str) -> FhirResult<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(text)
        .map_err(|e| FhirError::InvalidInput(format!("invalid dateTime '{text}': {e}")))
}

/// Format a UTC instant with second precision, as written to `meta.lastUpdated`.
pub fn format_instant(value: &DateTime<Utc>) -> String {
    value.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Render a decimal as a JSON number with its scale intact.
pub fn decimal_to_json(value: &Decimal) -> FhirResult<Value> {
    let text = value.to_string();
    serde_json::from_str::<Value>(&text)
        .map_err(|e| FhirError::Translation(format!("cannot render decimal '{text}': {e}")))
}

/// Read a decimal from a JSON number without going through floating point.
///
/// Scientific notation is accepted; strings are not.
pub fn decimal_from_json(value: &Value) -> FhirResult<Decimal> {
    let Value::Number(number) = value else {
        return Err(FhirError::InvalidInput(format!(
            "expected a decimal number, got {value}"
        )));
    };
    let text = number.to_string();
    Decimal::from_str_exact(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .or_else(|_| Decimal::from_str(&text))
        .map_err(|e| FhirError::InvalidInput(format!("invalid decimal '{text}': {e}")))
}

/// Read an integer from a JSON number.
pub fn integer_from_json(value: &Value) -> FhirResult<i64> {
    value
        .as_i64()
        .ok_or_else(|| FhirError::InvalidInput(format!("expected an integer, got {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_date_round_trip() {
        let date = parse_date("2024-02-29").expect("leap day should parse");
        assert_eq!(format_date(date), "2024-02-29");
    }

    #[test]
    fn test_date_rejects_time_component() {
        assert!(parse_date("2024-02-29T10:00:00Z").is_err());
        assert!(parse_date("2024-02").is_err());
    }

    #[test]
    fn test_datetime_requires_offset() {
        assert!(parse_datetime("2024-03-01T10:15:00").is_err());

        let parsed = parse_datetime("2024-03-01T10:15:00+01:00").expect("should parse");
        assert_eq!(format_datetime(&parsed), "2024-03-01T10:15:00+01:00");
    }

    #[test]
    fn test_instant_format() {
        let instant = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(format_instant(&instant), "2025-01-02T03:04:05Z");
    }

    #[test]
    fn test_decimal_keeps_trailing_zeros() {
        let value = Decimal::from_str("151.170").unwrap();
        let json = decimal_to_json(&value).expect("should render");
        assert_eq!(json.to_string(), "151.170");

        let back = decimal_from_json(&json).expect("should parse");
        assert_eq!(back, value);
        assert_eq!(back.scale(), 3);
    }

    #[test]
    fn test_decimal_from_json_parses_source_text() {
        let json: Value = serde_json::from_str("0.1").unwrap();
        let parsed = decimal_from_json(&json).unwrap();
        assert_eq!(parsed, Decimal::from_str("0.1").unwrap());
    }

    #[test]
    fn test_decimal_from_json_rejects_strings() {
        let err = decimal_from_json(&Value::String("1.5".into())).expect_err("string should fail");
        match err {
            FhirError::InvalidInput(msg) => assert!(msg.contains("expected a decimal")),
            other => panic!("expected InvalidInput, got {other:?}"),
        }
    }
}
