//! REST-resource request-processing engine.
//!
//! Turns HTTP verbs on collection and individual resources into database
//! work, with:
//! - Query-string compilation into a typed filter/sort/projection tree
//! - Transaction-phase orchestration with commit/rollback semantics
//! - Conditional-request (ETag / Last-Modified) evaluation
//! - JSON Patch / Merge Patch application
//! - An extensible hook pipeline
//!
//! The engine is storage-agnostic: SQL generation, connection pooling and
//! the schema source are supplied by the embedder through the traits in
//! [`store`], [`tx`] and [`schema`].

pub mod conditional;
pub mod error;
pub mod hooks;
pub mod patch;
pub mod query;
pub mod schema;
pub mod store;
pub mod tx;

pub use error::{Error, Result, SyntaxError};
pub use query::{CompilerOptions, QueryCompiler, QueryParts, QuerySpec};
