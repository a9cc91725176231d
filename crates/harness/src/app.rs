use eavstore_core::{
    AttributeDefinition, AttributeType, ContentType, Entity, EntityGuid, EntityId, EntityRef, SaveOptions, Value,
    content_type::APP_SCOPE,
};
use eavstore_engine::{Engine, EngineConfig, EngineError};
use eavstore_storage::SqliteStorage;

pub const LANGUAGES: [(&str, &str); 3] = [("en-us", "English"), ("de-de", "Deutsch"), ("de-ch", "Schweizerdeutsch")];

pub fn person_type() -> ContentType {
    ContentType::new("Person", "Person", APP_SCOPE)
        .with_attribute(AttributeDefinition::new("FullName", AttributeType::String).title())
        .with_attribute(AttributeDefinition::new("FirstName", AttributeType::String))
        .with_attribute(AttributeDefinition::new("LastName", AttributeType::String))
        .with_attribute(AttributeDefinition::new("Birthday", AttributeType::DateTime))
        .with_attribute(AttributeDefinition::new("Husband", AttributeType::Entity))
        .with_attribute(AttributeDefinition::new("Friends", AttributeType::Entity))
}

pub fn product_type() -> ContentType {
    ContentType::new("Product", "Product", APP_SCOPE)
        .with_attribute(AttributeDefinition::new("Title", AttributeType::String).title())
        .with_attribute(AttributeDefinition::new("Teaser", AttributeType::String))
        .with_attribute(AttributeDefinition::new("Price", AttributeType::Number))
        .with_attribute(AttributeDefinition::new("Related", AttributeType::Entity))
}

/// An engine over an in-memory database with three languages and the
/// Person and Product types installed.
pub struct TestApp {
    pub engine: Engine,
}

impl TestApp {
    pub fn new() -> Result<Self, EngineError> {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Result<Self, EngineError> {
        Self::with_storage(config, SqliteStorage::open_in_memory()?)
    }

    pub fn with_storage(config: EngineConfig, storage: SqliteStorage) -> Result<Self, EngineError> {
        let mut engine = Engine::new(config, storage)?;
        for (key, name) in LANGUAGES {
            engine.add_language(key, name)?;
        }
        engine.save_content_type(&person_type())?;
        engine.save_content_type(&product_type())?;
        Ok(Self { engine })
    }

    /// Save options with en-us as primary and every zone language known.
    pub fn options(&self) -> Result<SaveOptions, EngineError> {
        self.engine.save_options("en-us")
    }

    /// A published person with untranslated names.
    pub fn person(&self, first: &str, last: &str) -> Entity {
        Entity::builder(EntityGuid::new())
            .content_type("Person")
            .title_field("FullName")
            .text("FullName", &format!("{first} {last}"))
            .text("FirstName", first)
            .text("LastName", last)
            .build()
    }

    pub fn save_person(&mut self, first: &str, last: &str) -> Result<EntityId, EngineError> {
        let entity = self.person(first, last);
        let options = self.options()?;
        self.engine.save_entity(&entity, &options)
    }

    pub fn text(&self, id: EntityId, attribute: &str) -> Result<Option<String>, EngineError> {
        Ok(self
            .engine
            .get_entity(id)?
            .and_then(|e| e.attribute(attribute).and_then(|a| a.values.first().cloned()))
            .and_then(|v: Value| v.as_text().map(str::to_string)))
    }
}

/// References by id, in order.
pub fn refs(ids: &[EntityId]) -> Vec<Option<EntityRef>> {
    ids.iter().map(|id| Some(EntityRef::Id(*id))).collect()
}
