use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::attribute::Attribute;
use crate::ids::{EntityGuid, EntityId};
use crate::value::{AttributeType, Value};

/// Metadata target type for "this entity describes another entity".
pub const TARGET_TYPE_ENTITY: i32 = 4;
/// Metadata target type used for entities that describe nothing.
pub const TARGET_TYPE_NONE: i32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetadataKey {
    Guid(EntityGuid),
    Number(i64),
    String(String),
}

/// Marks an entity as metadata for some other object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetadataFor {
    pub target_type: i32,
    pub key: MetadataKey,
}

impl MetadataFor {
    pub fn entity(id: EntityId) -> Self {
        Self {
            target_type: TARGET_TYPE_ENTITY,
            key: MetadataKey::Number(id.get()),
        }
    }
}

/// An immutable entity state. Build one with [`EntityBuilder`]; the `with_*`
/// methods return changed copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    id: Option<EntityId>,
    repository_id: Option<EntityId>,
    guid: EntityGuid,
    content_type: Option<String>,
    title_field: Option<String>,
    is_published: bool,
    published_entity_id: Option<EntityId>,
    draft_entity_id: Option<EntityId>,
    version: i32,
    owner: String,
    modified: Option<DateTime<Utc>>,
    metadata: Option<MetadataFor>,
    attributes: IndexMap<String, Attribute>,
}

impl Entity {
    pub fn builder(guid: EntityGuid) -> EntityBuilder {
        EntityBuilder::new(guid)
    }

    pub fn id(&self) -> Option<EntityId> {
        self.id
    }

    /// The row this state was read from. Differs from `id` when a draft is
    /// presented under its published id.
    pub fn repository_id(&self) -> Option<EntityId> {
        self.repository_id.or(self.id)
    }

    pub fn guid(&self) -> EntityGuid {
        self.guid
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn title_field(&self) -> Option<&str> {
        self.title_field.as_deref()
    }

    pub fn is_published(&self) -> bool {
        self.is_published
    }

    pub fn published_entity_id(&self) -> Option<EntityId> {
        self.published_entity_id
    }

    pub fn draft_entity_id(&self) -> Option<EntityId> {
        self.draft_entity_id
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn modified(&self) -> Option<DateTime<Utc>> {
        self.modified
    }

    pub fn metadata(&self) -> Option<&MetadataFor> {
        self.metadata.as_ref()
    }

    pub fn attributes(&self) -> &IndexMap<String, Attribute> {
        &self.attributes
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        find_attribute(&self.attributes, name).map(|(_, a)| a)
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attribute(name).is_some()
    }

    pub fn attribute_names(&self) -> Vec<&str> {
        self.attributes.values().map(|a| a.name.as_str()).collect()
    }

    /// The title value for the given language priority.
    pub fn title(&self, languages: &[&str]) -> Option<&Value> {
        self.title_field
            .as_deref()
            .and_then(|name| self.attribute(name))
            .and_then(|a| a.value_for(languages))
    }

    pub fn with_id(&self, id: EntityId) -> Self {
        let mut next = self.clone();
        next.id = Some(id);
        next.repository_id = Some(id);
        next
    }

    pub fn with_repository_id(&self, id: EntityId) -> Self {
        let mut next = self.clone();
        next.repository_id = Some(id);
        next
    }

    pub fn with_published(&self, is_published: bool) -> Self {
        let mut next = self.clone();
        next.is_published = is_published;
        next
    }

    pub fn with_published_entity_id(&self, id: Option<EntityId>) -> Self {
        let mut next = self.clone();
        next.published_entity_id = id;
        next
    }

    pub fn with_draft_entity_id(&self, id: Option<EntityId>) -> Self {
        let mut next = self.clone();
        next.draft_entity_id = id;
        next
    }

    pub fn with_version(&self, version: i32) -> Self {
        let mut next = self.clone();
        next.version = version;
        next
    }

    pub fn with_content_type(&self, static_name: &str) -> Self {
        let mut next = self.clone();
        next.content_type = Some(static_name.to_string());
        next
    }

    pub fn with_attributes(&self, attributes: Vec<Attribute>) -> Self {
        let mut next = self.clone();
        next.attributes = attributes.into_iter().map(|a| (a.name.clone(), a)).collect();
        if let Some(title) = &next.title_field {
            if find_attribute(&next.attributes, title).is_none() {
                next.title_field = None;
            }
        }
        next
    }

    pub fn to_builder(&self) -> EntityBuilder {
        EntityBuilder {
            inner: self.clone(),
        }
    }
}

fn find_attribute<'a>(
    attributes: &'a IndexMap<String, Attribute>,
    name: &str,
) -> Option<(usize, &'a Attribute)> {
    attributes
        .values()
        .enumerate()
        .find(|(_, a)| a.name.eq_ignore_ascii_case(name))
}

pub struct EntityBuilder {
    inner: Entity,
}

impl EntityBuilder {
    pub fn new(guid: EntityGuid) -> Self {
        Self {
            inner: Entity {
                id: None,
                repository_id: None,
                guid,
                content_type: None,
                title_field: None,
                is_published: true,
                published_entity_id: None,
                draft_entity_id: None,
                version: 1,
                owner: String::new(),
                modified: None,
                metadata: None,
                attributes: IndexMap::new(),
            },
        }
    }

    pub fn id(mut self, id: EntityId) -> Self {
        self.inner.id = Some(id);
        self
    }

    pub fn repository_id(mut self, id: EntityId) -> Self {
        self.inner.repository_id = Some(id);
        self
    }

    pub fn content_type(mut self, static_name: &str) -> Self {
        self.inner.content_type = Some(static_name.to_string());
        self
    }

    pub fn title_field(mut self, name: &str) -> Self {
        self.inner.title_field = Some(name.to_string());
        self
    }

    pub fn published(mut self, is_published: bool) -> Self {
        self.inner.is_published = is_published;
        self
    }

    pub fn published_entity_id(mut self, id: EntityId) -> Self {
        self.inner.published_entity_id = Some(id);
        self
    }

    pub fn draft_entity_id(mut self, id: EntityId) -> Self {
        self.inner.draft_entity_id = Some(id);
        self
    }

    pub fn version(mut self, version: i32) -> Self {
        self.inner.version = version;
        self
    }

    pub fn owner(mut self, owner: &str) -> Self {
        self.inner.owner = owner.to_string();
        self
    }

    pub fn modified(mut self, at: DateTime<Utc>) -> Self {
        self.inner.modified = Some(at);
        self
    }

    pub fn metadata(mut self, metadata: MetadataFor) -> Self {
        self.inner.metadata = Some(metadata);
        self
    }

    /// Add or replace an attribute. Names collide case-insensitively.
    pub fn attribute(mut self, attribute: Attribute) -> Self {
        match find_attribute(&self.inner.attributes, &attribute.name).map(|(i, _)| i) {
            Some(index) => {
                if let Some((_, slot)) = self.inner.attributes.get_index_mut(index) {
                    *slot = attribute;
                }
            }
            None => {
                self.inner.attributes.insert(attribute.name.clone(), attribute);
            }
        }
        self
    }

    /// Shorthand for a single unconditional string value.
    pub fn text(self, name: &str, value: &str) -> Self {
        self.attribute(Attribute::new(name, AttributeType::String).push(Value::text(value)))
    }

    pub fn build(self) -> Entity {
        self.inner
    }
}
