//! Query-string compilation.
//!
//! Turns the URL query-parameter surface (`p` projection, `f$...` filters,
//! `o` ordering, `r` range) into a [`QuerySpec`] ready for the DBO builder,
//! with every operand bound through a [`ParamCollector`].

pub mod expression;
pub mod filter;
pub mod params;
pub mod value;

use crate::error::SyntaxError;
use crate::schema::Schema;
use crate::Result;

use expression::{parse_expression, sort_operators, PathExpr, SortDirection};
use filter::{parse_group, FilterNode, Junction};
use params::ParamCollector;

/// Root filter-group id: the `f$` parameter prefix.
const ROOT_GROUP: &str = "f";

/// Capability mask selecting which query parts a caller accepts. Bulk-update
/// and delete paths reuse the compiler filter-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryParts {
    pub projection: bool,
    pub filter: bool,
    pub ordering: bool,
    pub range: bool,
}

impl QueryParts {
    pub const ALL: Self = Self {
        projection: true,
        filter: true,
        ordering: true,
        range: true,
    };

    pub const FILTER_ONLY: Self = Self {
        projection: false,
        filter: true,
        ordering: false,
        range: false,
    };
}

/// One order-by element.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderSpec {
    pub expr: PathExpr,
    pub direction: SortDirection,
}

/// Result range: zero-based offset and maximum record count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub offset: u64,
    pub limit: u64,
}

/// Compiled query specification, handed to the external DBO builder together
/// with the bound parameters.
#[derive(Debug, Clone)]
pub struct QuerySpec {
    pub record_type: String,
    pub projection: Vec<String>,
    pub filter: Option<FilterNode>,
    pub ordering: Vec<OrderSpec>,
    pub range: Option<Range>,
}

/// Compiler tunables.
#[derive(Debug, Clone, Copy)]
pub struct CompilerOptions {
    /// Maximum filter-group nesting depth (guards against pathological input
    /// independently of cycle detection).
    pub max_group_depth: usize,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self { max_group_depth: 16 }
    }
}

/// Top-level query-string compiler.
#[derive(Debug, Clone, Default)]
pub struct QueryCompiler {
    options: CompilerOptions,
}

impl QueryCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: CompilerOptions) -> Self {
        Self { options }
    }

    /// Compile ordered `(name, value)` query items into a [`QuerySpec`],
    /// binding filter operands into `collector`.
    pub fn compile(
        &self,
        schema: &dyn Schema,
        record_type: &str,
        items: &[(String, String)],
        parts: QueryParts,
        collector: &mut ParamCollector,
    ) -> Result<QuerySpec> {
        tracing::debug!(record_type, items = items.len(), "compiling query");

        let projection = if parts.projection {
            comma_list(items, "p")
        } else {
            Vec::new()
        };

        let filter = if parts.filter {
            parse_group(
                schema,
                record_type,
                ROOT_GROUP,
                Junction::And,
                false,
                items,
                collector,
                self.options.max_group_depth,
            )?
        } else {
            None
        };

        let ordering = if parts.ordering {
            let mut ordering = Vec::new();
            for element in comma_list(items, "o") {
                let parsed =
                    parse_expression(schema, record_type, &element, sort_operators(), false)?;
                ordering.push(OrderSpec {
                    expr: parsed.expr,
                    direction: parsed.operator,
                });
            }
            ordering
        } else {
            Vec::new()
        };

        let range = if parts.range {
            parse_range(items)?
        } else {
            None
        };

        Ok(QuerySpec {
            record_type: record_type.to_string(),
            projection,
            filter,
            ordering,
            range,
        })
    }
}

/// Collect a multi-occurrence comma-list parameter: occurrences are joined
/// with commas first, then split.
fn comma_list(items: &[(String, String)], name: &str) -> Vec<String> {
    items
        .iter()
        .filter(|(k, _)| k == name)
        .flat_map(|(_, v)| v.split(','))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse the `r=<offset>,<limit>` parameter. A repeated occurrence is a hard
/// error, not last-wins.
fn parse_range(items: &[(String, String)]) -> Result<Option<Range>> {
    let mut occurrences = items.iter().filter(|(k, _)| k == "r").map(|(_, v)| v);
    let Some(raw) = occurrences.next() else {
        return Ok(None);
    };
    if occurrences.next().is_some() {
        return Err(SyntaxError::DuplicateRange.into());
    }

    let invalid = || SyntaxError::InvalidRange {
        raw: raw.to_string(),
    };
    let Some((offset, limit)) = raw.split_once(',') else {
        return Err(invalid().into());
    };
    let offset: u64 = offset.trim().parse().map_err(|_| invalid())?;
    let limit: u64 = limit.trim().parse().map_err(|_| invalid())?;
    Ok(Some(Range { offset, limit }))
}

/// Parse a raw (still percent-encoded) query string into ordered items.
pub fn parse_query_string(query: &str) -> Vec<(String, String)> {
    url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect()
}
