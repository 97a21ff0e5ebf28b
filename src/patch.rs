//! Record patch application.
//!
//! Update handlers accept two patch media types: RFC 6902 JSON Patch and
//! RFC 7386 JSON Merge Patch. Both are applied in place against the fetched
//! record before it is written back.

use json_patch::Patch;
use serde_json::Value;

use crate::{Error, Result};

pub const JSON_PATCH_CONTENT_TYPE: &str = "application/json-patch+json";
pub const MERGE_PATCH_CONTENT_TYPE: &str = "application/merge-patch+json";

/// A parsed patch document.
#[derive(Debug, Clone)]
pub enum PatchSpec {
    /// RFC 6902 operation list (`application/json-patch+json`).
    Json(Patch),
    /// RFC 7386 merge document (`application/merge-patch+json`).
    Merge(Value),
}

impl PatchSpec {
    /// Interpret a request body according to its `Content-Type`. Media-type
    /// parameters (`; charset=...`) are ignored.
    pub fn from_content_type(content_type: &str, body: Value) -> Result<Self> {
        let media = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match media.as_str() {
            JSON_PATCH_CONTENT_TYPE => {
                let ops: Patch = serde_json::from_value(body)
                    .map_err(|e| Error::Patch(format!("invalid JSON Patch document: {e}")))?;
                Ok(Self::Json(ops))
            }
            MERGE_PATCH_CONTENT_TYPE => Ok(Self::Merge(body)),
            other => Err(Error::Patch(format!(
                "unsupported patch content type '{other}'"
            ))),
        }
    }

    /// Apply the patch to `record` in place.
    ///
    /// A failed JSON Patch operation (missing path, failed `test`) surfaces
    /// as [`Error::Patch`]; merge patches cannot fail.
    pub fn apply(&self, record: &mut Value) -> Result<()> {
        match self {
            Self::Json(ops) => json_patch::patch(record, ops).map_err(|e| Error::Patch(e.to_string())),
            Self::Merge(delta) => {
                json_patch::merge(record, delta);
                Ok(())
            }
        }
    }
}
