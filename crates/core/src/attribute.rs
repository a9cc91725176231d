use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::language::normalize_key;
use crate::value::{AttributeType, EntityRef, Value};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub attr_type: AttributeType,
    pub values: Vec<Value>,
}

impl Attribute {
    pub fn new(name: &str, attr_type: AttributeType) -> Self {
        Self {
            name: name.to_string(),
            attr_type,
            values: Vec::new(),
        }
    }

    pub fn with_values(name: &str, attr_type: AttributeType, values: Vec<Value>) -> Self {
        Self {
            name: name.to_string(),
            attr_type,
            values,
        }
    }

    pub fn push(mut self, value: Value) -> Self {
        self.values.push(value);
        self
    }

    /// The value for the first matching language in `priority`, falling back
    /// to the unconditional value and then to the first value.
    pub fn value_for(&self, priority: &[&str]) -> Option<&Value> {
        priority
            .iter()
            .find_map(|key| self.values.iter().find(|v| v.has_language(key)))
            .or_else(|| self.values.iter().find(|v| v.languages.is_empty()))
            .or_else(|| self.values.first())
    }

    /// Ordered children of an entity-typed attribute; empty for scalars.
    pub fn children(&self) -> Vec<Option<EntityRef>> {
        self.values
            .iter()
            .filter_map(|v| v.as_entity_refs())
            .flat_map(|refs| refs.iter().copied())
            .collect()
    }

    /// Restore the one-value-per-dimension rule.
    ///
    /// With more than one value, unconditional values are dropped; a key
    /// already claimed by an earlier value is removed from later ones, and a
    /// value stripped of all its keys is dropped.
    pub fn repair_faulty_dimensions(mut self) -> Self {
        if self.values.len() > 1 && self.values.iter().any(|v| !v.languages.is_empty()) {
            self.values.retain(|v| !v.languages.is_empty());
        }
        let mut claimed: HashSet<String> = HashSet::new();
        self.values.retain_mut(|value| {
            if value.languages.is_empty() {
                return true;
            }
            value
                .languages
                .retain(|l| claimed.insert(normalize_key(&l.key)));
            !value.languages.is_empty()
        });
        self
    }
}
