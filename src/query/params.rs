//! Namespaced query-parameter accumulation.
//!
//! The filter parser never embeds literal operand values in the compiled
//! tree; it binds each coerced value under a generated, group-namespaced
//! parameter name (`p<groupId><seq>`) so the same compiled query can be
//! re-executed with different bound values.

use std::collections::{BTreeMap, HashMap};

use super::value::CoercedValue;

/// A bound operand: single value, or a value list for `in`/`notIn`.
#[derive(Debug, Clone, PartialEq)]
pub enum BoundValue {
    One(CoercedValue),
    Many(Vec<CoercedValue>),
}

/// Accumulator for generated parameter bindings across one compiled query.
#[derive(Debug, Clone, Default)]
pub struct ParamCollector {
    values: BTreeMap<String, BoundValue>,
    counters: HashMap<String, u32>,
}

impl ParamCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a value under the next free name in `group_id`'s namespace and
    /// return the generated name.
    pub fn bind(&mut self, group_id: &str, value: BoundValue) -> String {
        let counter = self.counters.entry(group_id.to_string()).or_insert(0);
        let name = format!("p{}{}", group_id, counter);
        *counter += 1;
        self.values.insert(name.clone(), value);
        name
    }

    pub fn get(&self, name: &str) -> Option<&BoundValue> {
        self.values.get(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// All bindings, ordered by parameter name.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &BoundValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_namespaced_and_sequential() {
        let mut params = ParamCollector::new();
        let a = params.bind("f", BoundValue::One(CoercedValue::Number(1.0)));
        let b = params.bind("f", BoundValue::One(CoercedValue::Number(2.0)));
        let c = params.bind("g", BoundValue::One(CoercedValue::Number(3.0)));
        assert_eq!(a, "pf0");
        assert_eq!(b, "pf1");
        assert_eq!(c, "pg0");
        assert_eq!(
            params.get("pf1"),
            Some(&BoundValue::One(CoercedValue::Number(2.0)))
        );
        assert_eq!(params.len(), 3);
    }
}
