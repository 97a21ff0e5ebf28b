//! Coercion of raw query-string tokens into strictly-typed filter operands.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;
use serde::Serialize;

use crate::error::SyntaxError;
use crate::schema::ValueType;
use crate::Result;

/// A strictly-typed filter operand, ready for parameter binding.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CoercedValue {
    String(String),
    Number(f64),
    Boolean(bool),
    Datetime(DateTime<Utc>),
    /// Regular-expression source text. The pattern is compiled once here for
    /// validation; downstream consumers receive the source, not the compiled
    /// object.
    Pattern(String),
}

/// Convert a raw token into a [`CoercedValue`] of the declared type.
///
/// `ref_prefix` is the `"<Target>#"` prefix recorded for reference
/// properties; when the literal carries it, it is stripped before coercion so
/// ids may be supplied bare or fully qualified.
pub fn coerce(raw: &str, declared: ValueType, ref_prefix: Option<&str>) -> Result<CoercedValue> {
    let stripped = match ref_prefix {
        Some(prefix) => raw.strip_prefix(prefix).unwrap_or(raw),
        None => raw,
    };

    match declared {
        ValueType::String => Ok(CoercedValue::String(stripped.to_string())),
        ValueType::Number => {
            let num: f64 = stripped.parse().map_err(|_| invalid(raw, "a number"))?;
            if !num.is_finite() {
                return Err(invalid(raw, "a finite number").into());
            }
            Ok(CoercedValue::Number(num))
        }
        ValueType::Boolean => match stripped {
            "true" => Ok(CoercedValue::Boolean(true)),
            "false" => Ok(CoercedValue::Boolean(false)),
            _ => Err(invalid(raw, "'true' or 'false'").into()),
        },
        ValueType::Datetime => parse_datetime(stripped)
            .map(CoercedValue::Datetime)
            .ok_or_else(|| invalid(raw, "a date-time").into()),
        ValueType::Pattern => {
            Regex::new(stripped)
                .map_err(|_| invalid(raw, "a valid regular expression"))?;
            Ok(CoercedValue::Pattern(stripped.to_string()))
        }
    }
}

fn invalid(raw: &str, expected: &str) -> SyntaxError {
    SyntaxError::InvalidValue {
        raw: raw.to_string(),
        expected: expected.to_string(),
    }
}

/// Parse a calendar date-time, normalizing to UTC.
///
/// Accepts RFC 3339, a naive date-time (taken as UTC), and a bare date
/// (taken as UTC midnight).
fn parse_datetime(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Some(naive.and_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(date.and_hms_opt(0, 0, 0)?.and_utc());
    }
    None
}
