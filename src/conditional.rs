//! Conditional-request evaluation.
//!
//! Evaluates `If-Match` / `If-Unmodified-Since` / `If-None-Match` /
//! `If-Modified-Since` against a computed [`VersionDescriptor`], in the
//! precedence order of RFC 7232 §6. The outcome is a designed short-circuit
//! (`304` / `412`), never an error: callers splice it into their phase chain
//! and commit, not roll back, when it fires.

use axum::http::{HeaderMap, Method};
use chrono::{DateTime, Utc};

/// The (etag, last-modified) pair a record or collection currently carries.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionDescriptor {
    /// Quoted entity tag, e.g. `"v2:actor7:13"`.
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

impl VersionDescriptor {
    pub fn new(etag: Option<String>, last_modified: Option<DateTime<Utc>>) -> Self {
        Self {
            etag,
            last_modified,
        }
    }

    /// Descriptor for one record. The etag is namespaced by API version and
    /// actor id so caches never confuse entities across API revisions or
    /// actors sharing a URL space.
    pub fn for_record(
        api_version: &str,
        actor_id: &str,
        version: &str,
        last_modified: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            etag: Some(format!("\"{api_version}:{actor_id}:{version}\"")),
            last_modified,
        }
    }
}

/// A precondition outcome that ends the call early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShortCircuit {
    /// 304, for safe methods whose cached representation is still valid.
    /// Carries the validator headers to send.
    NotModified,
    /// 412, a failed writer precondition.
    PreconditionFailed,
}

/// Result of precondition evaluation. Even without a short-circuit the
/// caller must persist `etag`/`last_modified` for the eventual response.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub short_circuit: Option<ShortCircuit>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

/// Format a timestamp as an HTTP validator date (RFC 2822 with the `GMT`
/// zone designator).
pub fn format_last_modified(last_modified: &DateTime<Utc>) -> String {
    last_modified.to_rfc2822().replace("+0000", "GMT")
}

/// Evaluate the request's preconditions against `current`.
pub fn evaluate(headers: &HeaderMap, method: &Method, current: &VersionDescriptor) -> Evaluation {
    let outcome = Evaluation {
        short_circuit: precondition(headers, method, current),
        etag: current.etag.clone(),
        last_modified: current.last_modified.as_ref().map(format_last_modified),
    };
    if let Some(short_circuit) = outcome.short_circuit {
        tracing::debug!(?short_circuit, %method, "conditional request short-circuited");
    }
    outcome
}

fn precondition(
    headers: &HeaderMap,
    method: &Method,
    current: &VersionDescriptor,
) -> Option<ShortCircuit> {
    let safe = method == Method::GET || method == Method::HEAD;

    if let Some(if_match) = header_str(headers, "if-match") {
        if !etag_list_matches(if_match, current.etag.as_deref()) {
            return Some(ShortCircuit::PreconditionFailed);
        }
    } else if let Some(date) = header_date(headers, "if-unmodified-since") {
        if let Some(last_modified) = current.last_modified {
            if last_modified.timestamp() > date.timestamp() {
                return Some(ShortCircuit::PreconditionFailed);
            }
        }
    }

    if let Some(if_none_match) = header_str(headers, "if-none-match") {
        if etag_list_matches(if_none_match, current.etag.as_deref()) {
            return Some(if safe {
                ShortCircuit::NotModified
            } else {
                ShortCircuit::PreconditionFailed
            });
        }
    } else if safe {
        if let (Some(date), Some(last_modified)) =
            (header_date(headers, "if-modified-since"), current.last_modified)
        {
            if last_modified.timestamp() <= date.timestamp() {
                return Some(ShortCircuit::NotModified);
            }
        }
    }

    None
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// An unparseable validator date is treated as an absent header, never as a
/// client-visible error.
fn header_date(headers: &HeaderMap, name: &str) -> Option<DateTime<Utc>> {
    header_str(headers, name).and_then(parse_http_date)
}

fn parse_http_date(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    // Obsolete RFC 850 and asctime forms, still required of recipients.
    for format in ["%A, %d-%b-%y %H:%M:%S GMT", "%a %b %e %H:%M:%S %Y"] {
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    None
}

/// Match a comma-separated entity-tag list against the current etag, using
/// weak comparison (a `W/` prefix on either side is ignored). `*` matches
/// any current etag.
fn etag_list_matches(list: &str, current: Option<&str>) -> bool {
    if list.trim() == "*" {
        return true;
    }
    let Some(current) = current else {
        return false;
    };
    let current = current.trim_start_matches("W/");
    list.split(',')
        .map(|tag| tag.trim().trim_start_matches("W/"))
        .any(|tag| tag == current)
}
