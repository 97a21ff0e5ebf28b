//! Filter-group parsing: the `f$...` query-parameter family.
//!
//! A group is the set of parameters sharing one id prefix (`f$` for the root,
//! `<groupId>$` for nested groups). Each parameter is either a leaf predicate
//! or a junction directive naming another group; groups nest arbitrarily, with
//! cycle detection over the chain of ancestor group ids.

use crate::error::SyntaxError;
use crate::query::expression::{
    filter_operators, parse_expression, FilterOp, PathExpr,
};
use crate::query::params::{BoundValue, ParamCollector};
use crate::query::value::{coerce, CoercedValue};
use crate::schema::Schema;
use crate::Result;

/// Boolean combinator for a filter group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Junction {
    And,
    Or,
}

/// Compiled filter tree node.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterNode {
    Group {
        junction: Junction,
        negated: bool,
        members: Vec<FilterNode>,
    },
    Predicate(Predicate),
}

/// One leaf test of the filter tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub expr: PathExpr,
    pub op: FilterOp,
    pub negated: bool,
    pub operand: Operand,
}

/// Right-hand side of a predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// Presence tests carry no operand.
    None,
    /// Generated parameter name holding the coerced value (or value list).
    Param(String),
    /// Collection test: optional count threshold parameter and optional
    /// nested filter over the collection's element container.
    CollectionTest {
        count_param: Option<String>,
        nested: Option<Box<FilterNode>>,
    },
}

/// Immutable chain of ancestor group ids, passed by value down the recursion
/// so no exit path can leave a stale entry behind.
#[derive(Debug, Clone, Copy)]
struct Ancestors<'a> {
    id: &'a str,
    parent: Option<&'a Ancestors<'a>>,
}

impl Ancestors<'_> {
    fn contains(mut this: Option<&Ancestors<'_>>, id: &str) -> bool {
        while let Some(node) = this {
            if node.id == id {
                return true;
            }
            this = node.parent;
        }
        false
    }

    fn depth(mut this: Option<&Ancestors<'_>>) -> usize {
        let mut n = 0;
        while let Some(node) = this {
            n += 1;
            this = node.parent;
        }
        n
    }
}

/// Parse the group named `group_id` out of the full parameter list.
///
/// Returns `None` when the group contributes no members; callers must treat
/// that as "no filter", never as an always-true or always-false node.
pub fn parse_group(
    schema: &dyn Schema,
    base_type: &str,
    group_id: &str,
    junction: Junction,
    negated: bool,
    items: &[(String, String)],
    collector: &mut ParamCollector,
    max_depth: usize,
) -> Result<Option<FilterNode>> {
    parse_group_inner(
        schema, base_type, group_id, junction, negated, items, collector, None, max_depth,
    )
}

#[allow(clippy::too_many_arguments)]
fn parse_group_inner(
    schema: &dyn Schema,
    base_type: &str,
    group_id: &str,
    junction: Junction,
    negated: bool,
    items: &[(String, String)],
    collector: &mut ParamCollector,
    ancestors: Option<&Ancestors<'_>>,
    max_depth: usize,
) -> Result<Option<FilterNode>> {
    if group_id.is_empty() {
        return Err(SyntaxError::EmptyGroupId.into());
    }
    if Ancestors::contains(ancestors, group_id) {
        return Err(SyntaxError::CircularGroupReference {
            group_id: group_id.to_string(),
        }
        .into());
    }
    if Ancestors::depth(ancestors) >= max_depth {
        return Err(SyntaxError::NestingTooDeep { max: max_depth }.into());
    }

    let here = Ancestors {
        id: group_id,
        parent: ancestors,
    };
    let prefix = format!("{}$", group_id);
    let mut members = Vec::new();

    for (name, value) in items {
        let Some(reference) = name.strip_prefix(&prefix) else {
            continue;
        };

        if let Some(directive) = reference.strip_prefix(':') {
            let (nested_junction, nested_negated) = match directive {
                "and" => (Junction::And, false),
                "and!" => (Junction::And, true),
                "or" => (Junction::Or, false),
                "or!" => (Junction::Or, true),
                _ => {
                    return Err(SyntaxError::InvalidGroupDirective {
                        token: reference.to_string(),
                    }
                    .into());
                }
            };
            let node = parse_group_inner(
                schema,
                base_type,
                value,
                nested_junction,
                nested_negated,
                items,
                collector,
                Some(&here),
                max_depth,
            )?;
            if let Some(node) = node {
                members.push(node);
            }
            continue;
        }

        if let Some(member) = parse_leaf(
            schema, base_type, group_id, reference, value, items, collector, &here, max_depth,
        )? {
            members.push(member);
        }
    }

    if members.is_empty() {
        return Ok(None);
    }

    Ok(Some(FilterNode::Group {
        junction,
        negated,
        members,
    }))
}

#[allow(clippy::too_many_arguments)]
fn parse_leaf(
    schema: &dyn Schema,
    base_type: &str,
    group_id: &str,
    reference: &str,
    value: &str,
    items: &[(String, String)],
    collector: &mut ParamCollector,
    here: &Ancestors<'_>,
    max_depth: usize,
) -> Result<Option<FilterNode>> {
    let value_provided = !value.is_empty();
    let parsed = parse_expression(
        schema,
        base_type,
        reference,
        filter_operators(),
        value_provided,
    )?;

    if parsed.requires_value && !value_provided {
        return Err(SyntaxError::MissingOperand {
            path: parsed.path,
        }
        .into());
    }

    let operand = if parsed.is_collection {
        match parsed.operator {
            FilterOp::Count | FilterOp::NotCount => {
                let (count_raw, nested_id) = match value.split_once(':') {
                    Some((count, nested)) => (count, Some(nested)),
                    None => (value, None),
                };
                let count: u32 = count_raw.parse().map_err(|_| SyntaxError::InvalidValue {
                    raw: count_raw.to_string(),
                    expected: "an integer count".to_string(),
                })?;
                let count_param = collector.bind(
                    group_id,
                    BoundValue::One(CoercedValue::Number(f64::from(count))),
                );
                let nested = match nested_id.filter(|id| !id.is_empty()) {
                    Some(id) => nested_collection_filter(
                        schema, &parsed.path, parsed.element_type.as_deref(), id, items,
                        collector, here, max_depth,
                    )?,
                    None => None,
                };
                Operand::CollectionTest {
                    count_param: Some(count_param),
                    nested,
                }
            }
            // Presence test; an operand, when given, names a nested group
            // over the collection's element container.
            _ => {
                let nested = if value_provided {
                    nested_collection_filter(
                        schema, &parsed.path, parsed.element_type.as_deref(), value, items,
                        collector, here, max_depth,
                    )?
                } else {
                    None
                };
                Operand::CollectionTest {
                    count_param: None,
                    nested,
                }
            }
        }
    } else if value_provided {
        let bound = if parsed.multi_valued {
            let mut values = Vec::new();
            for part in value.split('|') {
                values.push(coerce(
                    part,
                    parsed.value_type,
                    parsed.ref_prefix.as_deref(),
                )?);
            }
            BoundValue::Many(values)
        } else {
            BoundValue::One(coerce(
                value,
                parsed.value_type,
                parsed.ref_prefix.as_deref(),
            )?)
        };
        Operand::Param(collector.bind(group_id, bound))
    } else {
        Operand::None
    };

    Ok(Some(FilterNode::Predicate(Predicate {
        expr: parsed.expr,
        op: parsed.operator,
        negated: parsed.negated,
        operand,
    })))
}

#[allow(clippy::too_many_arguments)]
fn nested_collection_filter(
    schema: &dyn Schema,
    path: &str,
    element_type: Option<&str>,
    nested_group_id: &str,
    items: &[(String, String)],
    collector: &mut ParamCollector,
    here: &Ancestors<'_>,
    max_depth: usize,
) -> Result<Option<Box<FilterNode>>> {
    let Some(element_type) = element_type else {
        return Err(SyntaxError::InvalidCollectionFilter {
            path: path.to_string(),
        }
        .into());
    };
    let node = parse_group_inner(
        schema,
        element_type,
        nested_group_id,
        Junction::And,
        false,
        items,
        collector,
        Some(here),
        max_depth,
    )?;
    Ok(node.map(Box::new))
}
