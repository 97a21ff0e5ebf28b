//! Filter/ordering expression parsing.
//!
//! One expression has the shape `path[.path]*[:transform[:arg]*]*[:operator][!]`.
//! The same parser serves filter predicates and order-by elements; only the
//! operator table differs, so everything here is generic over the operator
//! type carried by the table.

use std::collections::HashMap;
use std::fmt;

use lazy_static::lazy_static;

use crate::error::SyntaxError;
use crate::schema::{resolve_path, Schema, ValueType};
use crate::Result;

/// Structured property-path expression: the property itself, optionally
/// wrapped in value transforms. Downstream query builders consume this tree
/// programmatically; [`fmt::Display`] exists for logging only.
#[derive(Debug, Clone, PartialEq)]
pub enum PathExpr {
    Property(String),
    /// String length; `string -> number`.
    Length(Box<PathExpr>),
    /// Lowercase; `string -> string`.
    Lowercase(Box<PathExpr>),
    /// Substring from `start`, optionally `length` characters.
    Substring {
        expr: Box<PathExpr>,
        start: u32,
        length: Option<u32>,
    },
    /// Left-pad to `width` with `pad`.
    LeftPad {
        expr: Box<PathExpr>,
        width: u32,
        pad: char,
    },
    /// Element count of a collection property.
    Count(String),
}

impl fmt::Display for PathExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Property(path) => write!(f, "{}", path),
            Self::Length(inner) => write!(f, "length({})", inner),
            Self::Lowercase(inner) => write!(f, "lower({})", inner),
            Self::Substring {
                expr,
                start,
                length: Some(len),
            } => write!(f, "substring({},{},{})", expr, start, len),
            Self::Substring {
                expr,
                start,
                length: None,
            } => write!(f, "substring({},{})", expr, start),
            Self::LeftPad { expr, width, pad } => {
                write!(f, "lpad({},{},'{}')", expr, width, pad)
            }
            Self::Count(path) => write!(f, "count({})", path),
        }
    }
}

/// Filter predicate operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterOp {
    Equals,
    NotEquals,
    Empty,
    NotEmpty,
    Ge,
    Le,
    MatchesRegexCi,
    NotMatchesRegexCi,
    ContainsCi,
    NotContainsCi,
    StartsWithCi,
    NotStartsWithCi,
    In,
    NotIn,
    Count,
    NotCount,
}

impl FilterOp {
    /// Grammar token for this operator, with the table's negation folded in.
    /// `None` for the implicit presence-test family, which has no token.
    fn token(self, negated: bool) -> Option<String> {
        let base = match self {
            Self::Equals => "eq",
            Self::NotEquals => "eq!",
            Self::Ge => "min",
            Self::Le => "max",
            Self::MatchesRegexCi => "pat",
            Self::NotMatchesRegexCi => "pat!",
            Self::ContainsCi => "mid",
            Self::NotContainsCi => "mid!",
            Self::StartsWithCi => "pre",
            Self::NotStartsWithCi => "pre!",
            Self::In => "alt",
            Self::NotIn => "alt!",
            Self::Count => "cnt",
            Self::NotCount => "cnt!",
            Self::Empty | Self::NotEmpty => return None,
        };
        if negated {
            Some(format!("{}!", base))
        } else {
            Some(base.to_string())
        }
    }
}

/// Order-by directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

/// One operator-table entry: the operator it maps to plus its declared arity
/// and legality.
#[derive(Debug, Clone)]
pub struct OperatorDef<O> {
    pub op: O,
    /// Whether this entry wraps its operator in a negation (used for inverted
    /// tokens with no dedicated inverse operator, e.g. `min!`).
    pub negated: bool,
    pub requires_value: bool,
    /// `in`/`notIn`: the single operand is a `|`-separated value list.
    pub multi_valued: bool,
    /// Legal operand value types; empty means any.
    pub legal_types: &'static [ValueType],
    /// Regex family: the operand coerces as a pattern regardless of the
    /// property's declared type.
    pub forces_pattern: bool,
    /// Only legal on collection-valued paths (`cnt`).
    pub collection_only: bool,
}

impl<O> OperatorDef<O> {
    fn new(op: O) -> Self {
        Self {
            op,
            negated: false,
            requires_value: true,
            multi_valued: false,
            legal_types: &[],
            forces_pattern: false,
            collection_only: false,
        }
    }

    fn negated(mut self) -> Self {
        self.negated = true;
        self
    }

    fn no_value(mut self) -> Self {
        self.requires_value = false;
        self
    }

    fn multi(mut self) -> Self {
        self.multi_valued = true;
        self
    }

    fn types(mut self, types: &'static [ValueType]) -> Self {
        self.legal_types = types;
        self
    }

    fn pattern(mut self) -> Self {
        self.forces_pattern = true;
        self
    }

    fn collection_only(mut self) -> Self {
        self.collection_only = true;
        self
    }
}

/// Token-to-operator lookup table, including the synthesized default keys.
#[derive(Debug, Default)]
pub struct OperatorTable<O> {
    entries: HashMap<&'static str, OperatorDef<O>>,
}

impl<O> OperatorTable<O> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    fn insert(&mut self, token: &'static str, def: OperatorDef<O>) {
        self.entries.insert(token, def);
    }

    pub fn lookup(&self, key: &str) -> Option<&OperatorDef<O>> {
        self.entries.get(key)
    }
}

/// Key for the implicit operator, synthesized from the expression's context
/// markers: collection-valued path, operand supplied, trailing `!`.
fn default_key(collection: bool, has_value: bool, negated: bool) -> String {
    let mut key = String::from("def");
    if collection {
        key.push_str(":col");
    }
    if has_value {
        key.push_str(":val");
    }
    if negated {
        key.push('!');
    }
    key
}

const COMPARABLE: &[ValueType] = &[
    ValueType::String,
    ValueType::Number,
    ValueType::Boolean,
    ValueType::Datetime,
];
const ORDERED: &[ValueType] = &[ValueType::String, ValueType::Number, ValueType::Datetime];
const TEXT: &[ValueType] = &[ValueType::String];
const NUMERIC: &[ValueType] = &[ValueType::Number];

lazy_static! {
    static ref FILTER_OPERATORS: OperatorTable<FilterOp> = {
        let mut t = OperatorTable::new();

        t.insert("eq", OperatorDef::new(FilterOp::Equals).types(COMPARABLE));
        t.insert("eq!", OperatorDef::new(FilterOp::NotEquals).types(COMPARABLE));
        t.insert("min", OperatorDef::new(FilterOp::Ge).types(ORDERED));
        t.insert("min!", OperatorDef::new(FilterOp::Ge).types(ORDERED).negated());
        t.insert("max", OperatorDef::new(FilterOp::Le).types(ORDERED));
        t.insert("max!", OperatorDef::new(FilterOp::Le).types(ORDERED).negated());
        t.insert("pat", OperatorDef::new(FilterOp::MatchesRegexCi).types(TEXT).pattern());
        t.insert("pat!", OperatorDef::new(FilterOp::NotMatchesRegexCi).types(TEXT).pattern());
        t.insert("mid", OperatorDef::new(FilterOp::ContainsCi).types(TEXT));
        t.insert("mid!", OperatorDef::new(FilterOp::NotContainsCi).types(TEXT));
        t.insert("pre", OperatorDef::new(FilterOp::StartsWithCi).types(TEXT));
        t.insert("pre!", OperatorDef::new(FilterOp::NotStartsWithCi).types(TEXT));
        t.insert("alt", OperatorDef::new(FilterOp::In).types(COMPARABLE).multi());
        t.insert("alt!", OperatorDef::new(FilterOp::NotIn).types(COMPARABLE).multi());
        t.insert("cnt", OperatorDef::new(FilterOp::Count).types(NUMERIC).collection_only());
        t.insert("cnt!", OperatorDef::new(FilterOp::NotCount).types(NUMERIC).collection_only());

        // Implicit operators, keyed by context markers.
        t.insert("def", OperatorDef::new(FilterOp::NotEmpty).no_value());
        t.insert("def!", OperatorDef::new(FilterOp::Empty).no_value());
        t.insert("def:val", OperatorDef::new(FilterOp::Equals).types(COMPARABLE));
        t.insert("def:val!", OperatorDef::new(FilterOp::NotEquals).types(COMPARABLE));
        // Collection paths never get implicit equality; a supplied operand is
        // a nested group id, not a comparison value.
        t.insert("def:col", OperatorDef::new(FilterOp::NotEmpty).no_value());
        t.insert("def:col!", OperatorDef::new(FilterOp::Empty).no_value());
        t.insert("def:col:val", OperatorDef::new(FilterOp::NotEmpty).no_value());
        t.insert("def:col:val!", OperatorDef::new(FilterOp::Empty).no_value());

        t
    };

    static ref SORT_OPERATORS: OperatorTable<SortDirection> = {
        let mut t = OperatorTable::new();
        t.insert("asc", OperatorDef::new(SortDirection::Asc).no_value());
        t.insert("desc", OperatorDef::new(SortDirection::Desc).no_value());
        t.insert("def", OperatorDef::new(SortDirection::Asc).no_value());
        t
    };
}

pub fn filter_operators() -> &'static OperatorTable<FilterOp> {
    &FILTER_OPERATORS
}

pub fn sort_operators() -> &'static OperatorTable<SortDirection> {
    &SORT_OPERATORS
}

/// Parsed expression descriptor, generic over the operator table's operator
/// type.
#[derive(Debug, Clone)]
pub struct ParsedExpression<O> {
    /// Normalized dotted property path.
    pub path: String,
    /// Structured path expression with transforms applied.
    pub expr: PathExpr,
    /// Operand value type after transforms (and pattern forcing).
    pub value_type: ValueType,
    /// Reference-id prefix; cleared by any transform.
    pub ref_prefix: Option<String>,
    pub operator: O,
    pub negated: bool,
    pub multi_valued: bool,
    pub requires_value: bool,
    pub is_collection: bool,
    /// Element container name for nested collection filters.
    pub element_type: Option<String>,
}

/// Parse one filter/ordering expression against `base_type`.
///
/// `value_provided` selects among the implicit-operator defaults when the
/// expression carries no explicit operator token.
pub fn parse_expression<O: Copy>(
    schema: &dyn Schema,
    base_type: &str,
    raw: &str,
    table: &OperatorTable<O>,
    value_provided: bool,
) -> Result<ParsedExpression<O>> {
    let (body, negated) = match raw.strip_suffix('!') {
        Some(rest) => (rest, true),
        None => (raw, false),
    };

    let segments: Vec<&str> = body.split(':').collect();
    let resolved = resolve_path(schema, base_type, segments[0])?;

    tracing::debug!(expression = raw, path = %resolved.path, "parsing filter expression");

    let mut expr = PathExpr::Property(resolved.path.clone());
    let mut value_type = resolved.value_type;
    let mut ref_prefix = resolved.ref_prefix.clone();
    let mut op_token: Option<&str> = None;

    if resolved.is_collection {
        // Transforms are illegal on collection paths; `cnt` is the only legal
        // trailing segment and must stand alone.
        match segments.len() {
            1 => {}
            2 if segments[1] == "cnt" => {
                expr = PathExpr::Count(resolved.path.clone());
                value_type = ValueType::Number;
                op_token = Some("cnt");
            }
            _ => {
                return Err(SyntaxError::IllegalCollectionOperation {
                    path: resolved.path,
                    token: segments[1..].join(":"),
                }
                .into());
            }
        }
    } else {
        let mut transformed = false;
        let mut i = 1;
        while i < segments.len() {
            let seg = segments[i];
            let last = i == segments.len() - 1;
            match seg {
                "len" => {
                    require_text(seg, value_type)?;
                    expr = PathExpr::Length(Box::new(expr));
                    value_type = ValueType::Number;
                    transformed = true;
                    i += 1;
                }
                "lc" => {
                    require_text(seg, value_type)?;
                    expr = PathExpr::Lowercase(Box::new(expr));
                    transformed = true;
                    i += 1;
                }
                "sub" => {
                    require_text(seg, value_type)?;
                    let start = numeric_arg(&segments, i + 1).ok_or_else(|| {
                        SyntaxError::TransformArity {
                            token: "sub".to_string(),
                            expected: "one or two numeric".to_string(),
                        }
                    })?;
                    let length = numeric_arg(&segments, i + 2);
                    i += if length.is_some() { 3 } else { 2 };
                    expr = PathExpr::Substring {
                        expr: Box::new(expr),
                        start,
                        length,
                    };
                    transformed = true;
                }
                "lpad" => {
                    require_text(seg, value_type)?;
                    let width = numeric_arg(&segments, i + 1).ok_or_else(|| {
                        SyntaxError::TransformArity {
                            token: "lpad".to_string(),
                            expected: "a numeric width and optional pad character".to_string(),
                        }
                    })?;
                    let pad = char_arg(&segments, i + 2);
                    i += if pad.is_some() { 3 } else { 2 };
                    expr = PathExpr::LeftPad {
                        expr: Box::new(expr),
                        width,
                        pad: pad.unwrap_or(' '),
                    };
                    transformed = true;
                }
                _ if last => {
                    op_token = Some(seg);
                    i += 1;
                }
                _ => {
                    return Err(SyntaxError::UnknownTransformation {
                        token: seg.to_string(),
                    }
                    .into());
                }
            }
        }

        // A transformed value no longer carries the raw reference-id format.
        if transformed {
            ref_prefix = None;
        }
    }

    let key = match op_token {
        Some(token) => {
            if negated {
                format!("{}!", token)
            } else {
                token.to_string()
            }
        }
        None => default_key(resolved.is_collection, value_provided, negated),
    };

    let def = table.lookup(&key).ok_or_else(|| match op_token {
        Some(token) => SyntaxError::UnknownOperator {
            token: if negated {
                format!("{}!", token)
            } else {
                token.to_string()
            },
        },
        None => SyntaxError::ExpressionNotAllowed,
    })?;

    if def.collection_only && !resolved.is_collection {
        return Err(SyntaxError::OperatorNotApplicable {
            token: key,
            value_type: "scalar".to_string(),
        }
        .into());
    }

    if !def.legal_types.is_empty() && !def.legal_types.contains(&value_type) {
        return Err(SyntaxError::OperatorNotApplicable {
            token: key,
            value_type: value_type.to_string(),
        }
        .into());
    }

    if def.forces_pattern {
        value_type = ValueType::Pattern;
    }

    Ok(ParsedExpression {
        path: resolved.path,
        expr,
        value_type,
        ref_prefix,
        operator: def.op,
        negated: def.negated,
        multi_valued: def.multi_valued,
        requires_value: def.requires_value,
        is_collection: resolved.is_collection,
        element_type: resolved.element_type,
    })
}

impl ParsedExpression<FilterOp> {
    /// Reconstruct the grammar form of this expression. Parsing the result
    /// yields an equivalent descriptor; used for logging and round-trip
    /// checks, never as the primary representation.
    pub fn to_source(&self) -> String {
        let mut out = transform_source(&self.expr);
        match self.operator.token(self.negated) {
            Some(token) => {
                out.push(':');
                out.push_str(&token);
            }
            // Presence-test defaults: negation is the bare `!` suffix.
            None => {
                if self.operator == FilterOp::Empty {
                    out.push('!');
                }
            }
        }
        out
    }
}

/// Grammar (colon-segment) form of a path expression, inverse of the
/// transform pipeline walk.
fn transform_source(expr: &PathExpr) -> String {
    match expr {
        PathExpr::Property(path) => path.clone(),
        PathExpr::Length(inner) => format!("{}:len", transform_source(inner)),
        PathExpr::Lowercase(inner) => format!("{}:lc", transform_source(inner)),
        PathExpr::Substring {
            expr,
            start,
            length: Some(len),
        } => format!("{}:sub:{}:{}", transform_source(expr), start, len),
        PathExpr::Substring {
            expr,
            start,
            length: None,
        } => format!("{}:sub:{}", transform_source(expr), start),
        PathExpr::LeftPad { expr, width, pad } => {
            format!("{}:lpad:{}:{}", transform_source(expr), width, pad)
        }
        // `cnt` doubles as the operator token, appended by the caller.
        PathExpr::Count(path) => path.clone(),
    }
}

fn require_text(token: &str, value_type: ValueType) -> Result<()> {
    if value_type != ValueType::String {
        return Err(SyntaxError::TransformNotApplicable {
            token: token.to_string(),
            value_type: value_type.to_string(),
        }
        .into());
    }
    Ok(())
}

fn numeric_arg(segments: &[&str], index: usize) -> Option<u32> {
    segments.get(index).and_then(|s| s.parse().ok())
}

fn char_arg(segments: &[&str], index: usize) -> Option<char> {
    segments.get(index).and_then(|s| {
        let mut chars = s.chars();
        let c = chars.next()?;
        chars.next().is_none().then_some(c)
    })
}
