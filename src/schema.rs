//! Record-type schema access and dotted property-path resolution.
//!
//! The engine never owns the record-type definitions; it consumes them through
//! the [`Schema`] trait, keyed by record-type name the same way chained search
//! parameters are resolved against resource types. A small in-crate
//! [`Registry`] implementation is provided for embedders and tests.

use std::collections::HashMap;
use std::fmt;

use crate::error::SyntaxError;
use crate::Result;

/// Strict value type of a scalar property or a coerced filter operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    String,
    Number,
    Boolean,
    Datetime,
    /// Regular-expression source text; only produced by the regex operator
    /// family, never declared on a schema property.
    Pattern,
}

impl ValueType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Datetime => "datetime",
            Self::Pattern => "pattern",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a single named property is, structurally.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyKind {
    Scalar(ValueType),
    /// Unstructured nested object; only meaningful as a collection (to count
    /// or test non-emptiness), addressed by its own container name.
    Object { type_name: String },
    /// Reference to another record type. Filter literals compare against the
    /// referenced type's id, optionally prefixed with `"<Target>#"`.
    Reference { target: String, id_type: ValueType },
}

/// Descriptor for one property of a record-type container.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyDesc {
    pub kind: PropertyKind,
    pub is_collection: bool,
}

/// Schema/property resolution, consumed from the embedding application.
pub trait Schema: Send + Sync {
    /// Look up a property descriptor on the named container. Containers are
    /// record types and (synthesized) nested-object types.
    fn property(&self, container: &str, name: &str) -> Option<PropertyDesc>;
}

/// Result of walking a dotted property path against a schema.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPath {
    /// Normalized dotted path as resolved.
    pub path: String,
    /// Value type of the terminal property. For reference terminals this is
    /// the referenced type's id value type. For object-collection terminals
    /// the only typed operand they can ever take is a count threshold, so
    /// this is `Number`.
    pub value_type: ValueType,
    pub is_collection: bool,
    /// `"<Target>#"` when the terminal is a reference property, so literal
    /// ids may be supplied bare or fully qualified.
    pub ref_prefix: Option<String>,
    /// Container name of the collection's element type, when a nested filter
    /// over the elements is possible.
    pub element_type: Option<String>,
}

/// Resolve a dot-separated property path against `base_type`.
///
/// Fails with `InvalidPath` on an unknown segment, `NonScalarIntermediate`
/// when a non-terminal segment is collection-valued, and `InvalidObjectUsage`
/// when the terminal is a nested object used as a scalar.
pub fn resolve_path(schema: &dyn Schema, base_type: &str, path: &str) -> Result<ResolvedPath> {
    let segments: Vec<&str> = path.split('.').collect();
    if path.is_empty() || segments.iter().any(|s| s.is_empty()) {
        return Err(SyntaxError::InvalidPath {
            path: path.to_string(),
            segment: String::new(),
        }
        .into());
    }

    let mut container = base_type.to_string();
    for (i, segment) in segments.iter().enumerate() {
        let desc = schema.property(&container, segment).ok_or_else(|| {
            SyntaxError::InvalidPath {
                path: path.to_string(),
                segment: segment.to_string(),
            }
        })?;

        let terminal = i == segments.len() - 1;
        if !terminal {
            if desc.is_collection {
                return Err(SyntaxError::NonScalarIntermediate {
                    path: path.to_string(),
                    segment: segment.to_string(),
                }
                .into());
            }
            container = match desc.kind {
                PropertyKind::Object { type_name } => type_name,
                PropertyKind::Reference { target, .. } => target,
                // Scalars have no properties to dot through.
                PropertyKind::Scalar(_) => {
                    return Err(SyntaxError::InvalidPath {
                        path: path.to_string(),
                        segment: segments[i + 1].to_string(),
                    }
                    .into());
                }
            };
            continue;
        }

        return Ok(match desc.kind {
            PropertyKind::Scalar(value_type) => ResolvedPath {
                path: path.to_string(),
                value_type,
                is_collection: desc.is_collection,
                ref_prefix: None,
                element_type: None,
            },
            PropertyKind::Reference { target, id_type } => ResolvedPath {
                path: path.to_string(),
                value_type: id_type,
                is_collection: desc.is_collection,
                ref_prefix: Some(format!("{}#", target)),
                element_type: desc.is_collection.then(|| target.clone()),
            },
            PropertyKind::Object { type_name } => {
                if !desc.is_collection {
                    return Err(SyntaxError::InvalidObjectUsage {
                        path: path.to_string(),
                    }
                    .into());
                }
                ResolvedPath {
                    path: path.to_string(),
                    value_type: ValueType::Number,
                    is_collection: true,
                    ref_prefix: None,
                    element_type: Some(type_name),
                }
            }
        });
    }

    unreachable!("path has at least one segment");
}

/// Simple map-backed [`Schema`] implementation with a builder API.
#[derive(Debug, Default)]
pub struct Registry {
    containers: HashMap<String, HashMap<String, PropertyDesc>>,
    id_types: HashMap<String, ValueType>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or continue) defining a container.
    pub fn container(&mut self, name: &str) -> ContainerBuilder<'_> {
        self.containers.entry(name.to_string()).or_default();
        ContainerBuilder {
            registry: self,
            name: name.to_string(),
        }
    }

    /// Declare the id value type of a record type (default: `Number`).
    pub fn set_id_type(&mut self, record_type: &str, id_type: ValueType) {
        self.id_types.insert(record_type.to_string(), id_type);
    }

    fn id_type(&self, record_type: &str) -> ValueType {
        self.id_types
            .get(record_type)
            .copied()
            .unwrap_or(ValueType::Number)
    }
}

impl Schema for Registry {
    fn property(&self, container: &str, name: &str) -> Option<PropertyDesc> {
        let desc = self.containers.get(container)?.get(name)?.clone();
        // Reference descriptors pick up the target's declared id type here so
        // builders may define types in any order.
        if let PropertyKind::Reference { target, .. } = &desc.kind {
            let id_type = self.id_type(target);
            return Some(PropertyDesc {
                kind: PropertyKind::Reference {
                    target: target.clone(),
                    id_type,
                },
                is_collection: desc.is_collection,
            });
        }
        Some(desc)
    }
}

/// Builder for one container's properties.
pub struct ContainerBuilder<'a> {
    registry: &'a mut Registry,
    name: String,
}

impl ContainerBuilder<'_> {
    fn add(self, prop: &str, kind: PropertyKind, is_collection: bool) -> Self {
        self.registry
            .containers
            .get_mut(&self.name)
            .expect("container exists")
            .insert(
                prop.to_string(),
                PropertyDesc {
                    kind,
                    is_collection,
                },
            );
        self
    }

    pub fn scalar(self, prop: &str, value_type: ValueType) -> Self {
        self.add(prop, PropertyKind::Scalar(value_type), false)
    }

    pub fn string(self, prop: &str) -> Self {
        self.scalar(prop, ValueType::String)
    }

    pub fn number(self, prop: &str) -> Self {
        self.scalar(prop, ValueType::Number)
    }

    pub fn boolean(self, prop: &str) -> Self {
        self.scalar(prop, ValueType::Boolean)
    }

    pub fn datetime(self, prop: &str) -> Self {
        self.scalar(prop, ValueType::Datetime)
    }

    pub fn scalar_collection(self, prop: &str, value_type: ValueType) -> Self {
        self.add(prop, PropertyKind::Scalar(value_type), true)
    }

    pub fn object(self, prop: &str, type_name: &str) -> Self {
        self.add(
            prop,
            PropertyKind::Object {
                type_name: type_name.to_string(),
            },
            false,
        )
    }

    pub fn object_collection(self, prop: &str, type_name: &str) -> Self {
        self.add(
            prop,
            PropertyKind::Object {
                type_name: type_name.to_string(),
            },
            true,
        )
    }

    pub fn reference(self, prop: &str, target: &str) -> Self {
        let kind = PropertyKind::Reference {
            target: target.to_string(),
            // Placeholder; the registry substitutes the target's declared id
            // type on lookup.
            id_type: ValueType::Number,
        };
        self.add(prop, kind, false)
    }

    pub fn reference_collection(self, prop: &str, target: &str) -> Self {
        let kind = PropertyKind::Reference {
            target: target.to_string(),
            id_type: ValueType::Number,
        };
        self.add(prop, kind, true)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::Error;

    pub(crate) fn order_schema() -> Registry {
        let mut reg = Registry::new();
        reg.container("Order")
            .string("status")
            .number("price")
            .boolean("rush")
            .datetime("placedOn")
            .reference("accountRef", "Account")
            .object_collection("items", "Order.items")
            .scalar_collection("tags", ValueType::String);
        reg.container("Order.items")
            .string("sku")
            .number("quantity");
        reg.container("Account")
            .string("lastName")
            .string("email")
            .object("settings", "Account.settings");
        reg.container("Account.settings").boolean("newsletter");
        reg
    }

    fn unwrap_syntax(err: Error) -> SyntaxError {
        match err {
            Error::Syntax(e) => e,
            other => panic!("expected syntax error, got {other}"),
        }
    }

    #[test]
    fn resolves_scalar_property() {
        let reg = order_schema();
        let resolved = resolve_path(&reg, "Order", "status").unwrap();
        assert_eq!(resolved.value_type, ValueType::String);
        assert!(!resolved.is_collection);
        assert!(resolved.ref_prefix.is_none());
    }

    #[test]
    fn resolves_dotted_path_through_reference() {
        let reg = order_schema();
        let resolved = resolve_path(&reg, "Order", "accountRef.lastName").unwrap();
        assert_eq!(resolved.value_type, ValueType::String);
        assert_eq!(resolved.path, "accountRef.lastName");
    }

    #[test]
    fn reference_terminal_uses_target_id_type_and_prefix() {
        let mut reg = order_schema();
        reg.set_id_type("Account", ValueType::String);
        let resolved = resolve_path(&reg, "Order", "accountRef").unwrap();
        assert_eq!(resolved.value_type, ValueType::String);
        assert_eq!(resolved.ref_prefix.as_deref(), Some("Account#"));
    }

    #[test]
    fn unknown_segment_is_invalid_path() {
        let reg = order_schema();
        let err = unwrap_syntax(resolve_path(&reg, "Order", "accountRef.nope").unwrap_err());
        assert_eq!(
            err,
            SyntaxError::InvalidPath {
                path: "accountRef.nope".to_string(),
                segment: "nope".to_string(),
            }
        );
    }

    #[test]
    fn collection_intermediate_is_rejected() {
        let reg = order_schema();
        let err = unwrap_syntax(resolve_path(&reg, "Order", "items.sku").unwrap_err());
        assert!(matches!(err, SyntaxError::NonScalarIntermediate { .. }));
    }

    #[test]
    fn scalar_intermediate_is_rejected() {
        let reg = order_schema();
        let err = unwrap_syntax(resolve_path(&reg, "Order", "status.foo").unwrap_err());
        assert!(matches!(err, SyntaxError::InvalidPath { .. }));
    }

    #[test]
    fn object_collection_terminal_resolves_with_element_type() {
        let reg = order_schema();
        let resolved = resolve_path(&reg, "Order", "items").unwrap();
        assert!(resolved.is_collection);
        assert_eq!(resolved.element_type.as_deref(), Some("Order.items"));
    }

    #[test]
    fn bare_nested_object_is_rejected() {
        let reg = order_schema();
        let err =
            unwrap_syntax(resolve_path(&reg, "Order", "accountRef.settings").unwrap_err());
        assert!(matches!(err, SyntaxError::InvalidObjectUsage { .. }));
    }

    #[test]
    fn empty_path_is_rejected() {
        let reg = order_schema();
        assert!(resolve_path(&reg, "Order", "").is_err());
        assert!(resolve_path(&reg, "Order", "a..b").is_err());
    }
}
