use serde::{Deserialize, Serialize};

use crate::ids::{AttributeId, ContentTypeId};
use crate::value::AttributeType;

pub const SYSTEM_SCOPE: &str = "System";
pub const APP_SCOPE: &str = "App";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeDefinition {
    pub id: Option<AttributeId>,
    pub static_name: String,
    pub attr_type: AttributeType,
    pub is_title: bool,
    pub sort_order: i32,
}

impl AttributeDefinition {
    pub fn new(static_name: &str, attr_type: AttributeType) -> Self {
        Self {
            id: None,
            static_name: static_name.to_string(),
            attr_type,
            is_title: false,
            sort_order: 0,
        }
    }

    pub fn title(mut self) -> Self {
        self.is_title = true;
        self
    }
}

/// The attribute schema entities of one type are validated and filtered
/// against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentType {
    pub id: Option<ContentTypeId>,
    pub name: String,
    pub static_name: String,
    pub scope: String,
    pub description: String,
    pub attributes: Vec<AttributeDefinition>,
    /// Ghost link: this type borrows the attribute schema of another type.
    pub uses_configuration_of: Option<String>,
    pub always_share_configuration: bool,
}

impl ContentType {
    pub fn new(name: &str, static_name: &str, scope: &str) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            static_name: static_name.to_string(),
            scope: scope.to_string(),
            description: String::new(),
            attributes: Vec::new(),
            uses_configuration_of: None,
            always_share_configuration: false,
        }
    }

    /// Append a definition, numbering its sort order by position.
    pub fn with_attribute(mut self, mut def: AttributeDefinition) -> Self {
        def.sort_order = self.attributes.len() as i32;
        self.attributes.push(def);
        self
    }

    pub fn is_system(&self) -> bool {
        self.scope.eq_ignore_ascii_case(SYSTEM_SCOPE)
    }

    pub fn is_ghost(&self) -> bool {
        self.uses_configuration_of.is_some()
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeDefinition> {
        self.attributes
            .iter()
            .find(|a| a.static_name.eq_ignore_ascii_case(name))
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attribute(name).is_some()
    }

    pub fn title_attribute(&self) -> Option<&AttributeDefinition> {
        self.attributes.iter().find(|a| a.is_title)
    }

    pub fn matches(&self, static_name: &str) -> bool {
        self.static_name.eq_ignore_ascii_case(static_name) || self.name.eq_ignore_ascii_case(static_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person() -> ContentType {
        ContentType::new("Person", "Person", APP_SCOPE)
            .with_attribute(AttributeDefinition::new("FullName", AttributeType::String).title())
            .with_attribute(AttributeDefinition::new("Birthday", AttributeType::DateTime))
    }

    #[test]
    fn attribute_lookup_ignores_case() {
        let ct = person();
        assert!(ct.has_attribute("fullname"));
        assert_eq!(ct.attribute("BIRTHDAY").map(|a| a.sort_order), Some(1));
        assert!(!ct.has_attribute("Husband"));
    }

    #[test]
    fn title_and_scope() {
        let ct = person();
        assert_eq!(ct.title_attribute().map(|a| a.static_name.as_str()), Some("FullName"));
        assert!(!ct.is_system());
        assert!(ContentType::new("Cfg", "Cfg", "system").is_system());
    }
}
