//! Interfaces to the external data-access layer.
//!
//! The engine never builds SQL or touches the wire format of results; it
//! hands a compiled [`QuerySpec`] plus bound parameters to these traits and
//! consumes the opaque shapes they return.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::query::params::ParamCollector;
use crate::query::QuerySpec;
use crate::Result;

/// Result shape of a fetch executed by the external query engine.
#[derive(Debug, Clone, Default)]
pub struct FetchResult {
    pub records: Vec<Value>,
    /// Records pulled in through reference projection.
    pub referred: Vec<Value>,
    /// Total match count, when the query asked for one.
    pub count: Option<u64>,
}

/// Result shape of a bulk or single-record update.
#[derive(Debug, Clone, Default)]
pub struct UpdateResult {
    pub records: Vec<Value>,
    pub affected: u64,
}

/// Lock strength requested from the collection version monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Version of a whole record collection, for collection-level conditional
/// requests.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionVersion {
    pub version: String,
    pub modified_on: DateTime<Utc>,
}

/// Record persistence operations, executed against an open transaction
/// handle `H`.
#[async_trait]
pub trait RecordStore<H>: Send + Sync
where
    H: Send,
{
    async fn fetch(
        &self,
        handle: &mut H,
        query: &QuerySpec,
        params: &ParamCollector,
    ) -> Result<FetchResult>;

    async fn insert(&self, handle: &mut H, record_type: &str, payload: &Value) -> Result<Value>;

    async fn update(
        &self,
        handle: &mut H,
        query: &QuerySpec,
        params: &ParamCollector,
        payload: &Value,
    ) -> Result<UpdateResult>;

    /// Delete every record matched by `query`, returning the removed count.
    async fn remove(
        &self,
        handle: &mut H,
        query: &QuerySpec,
        params: &ParamCollector,
    ) -> Result<u64>;
}

/// Optional collection-version monitor.
///
/// Lock sequencing matters to callers: a version probe with
/// [`LockMode::Exclusive`] must be scheduled as a phase before any phase that
/// reads or writes the guarded collections.
#[async_trait]
pub trait VersionMonitor<H>: Send + Sync
where
    H: Send,
{
    async fn collection_version(
        &self,
        handle: &mut H,
        record_types: &[String],
        lock: LockMode,
    ) -> Result<CollectionVersion>;
}
