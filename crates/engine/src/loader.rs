use eavstore_core::{
    Attribute, AttributeType, ContentType, Entity, EntityRef, Value,
};
use eavstore_storage::{EntityRecord, Storage, ValueRecord};

use crate::error::{EngineError, ReferenceError, ValidationError};

/// The attribute schema entities of `content_type` use. Ghost types borrow
/// the attributes of their master, looked up in the app first and then in
/// any app.
pub fn resolve_schema(
    storage: &impl Storage,
    types: &[ContentType],
    content_type: &ContentType,
) -> Result<ContentType, EngineError> {
    let Some(master_name) = content_type.uses_configuration_of.as_deref() else {
        return Ok(content_type.clone());
    };
    let local = types
        .iter()
        .find(|t| !t.is_ghost() && t.static_name.eq_ignore_ascii_case(master_name))
        .cloned();
    let master = match local {
        Some(master) => master,
        None => storage
            .find_content_types_any_app(master_name)?
            .into_iter()
            .find(|t| !t.is_ghost())
            .ok_or_else(|| ReferenceError::MissingMasterContentType {
                content_type: content_type.static_name.clone(),
                master: master_name.to_string(),
            })?,
    };
    Ok(ContentType {
        attributes: master.attributes,
        ..content_type.clone()
    })
}

/// Rebuild the entity state of one stored row.
///
/// A draft is presented under its published id, with the draft row as its
/// repository id. A published row reports its draft when one exists.
pub fn load_entity(
    storage: &impl Storage,
    types: &[ContentType],
    row: &EntityRecord,
) -> Result<Entity, EngineError> {
    let content_type = types
        .iter()
        .find(|t| t.id == Some(row.content_type_id))
        .ok_or_else(|| ValidationError::UnknownContentType {
            entity: row.guid.to_string(),
            content_type: row.content_type.clone(),
        })?;
    let schema = resolve_schema(storage, types, content_type)?;

    let values = storage.get_values(row.entity_id)?;
    let relationships = storage.get_relationships(row.entity_id)?;

    let mut attributes = Vec::new();
    for def in &schema.attributes {
        if def.attr_type.is_entity() {
            let children: Vec<Option<EntityRef>> = relationships
                .iter()
                .filter(|r| Some(r.attribute_id) == def.id)
                .map(|r| r.child_id.map(EntityRef::Id))
                .collect();
            if !children.is_empty() {
                attributes.push(Attribute::with_values(
                    &def.static_name,
                    AttributeType::Entity,
                    vec![Value::entities(children)],
                ));
            }
            continue;
        }
        let own: Vec<&ValueRecord> = values.iter().filter(|v| Some(v.attribute_id) == def.id).collect();
        if let Some(attr) = build_attribute(&def.static_name, def.attr_type, &own)? {
            attributes.push(attr);
        }
    }

    // values of attributes the schema no longer declares
    let mut orphans: Vec<(&str, AttributeType)> = Vec::new();
    for v in &values {
        let declared = schema.attributes.iter().any(|d| d.id == Some(v.attribute_id));
        if !declared && !orphans.iter().any(|(name, _)| *name == v.attribute) {
            orphans.push((v.attribute.as_str(), v.attr_type));
        }
    }
    for (name, attr_type) in orphans {
        let own: Vec<&ValueRecord> = values.iter().filter(|v| v.attribute == name).collect();
        if let Some(attr) = build_attribute(name, attr_type, &own)? {
            attributes.push(attr);
        }
    }

    let mut builder = Entity::builder(row.guid)
        .content_type(&content_type.static_name)
        .published(row.is_published)
        .version(row.version)
        .owner(&row.owner)
        .modified(row.modified);
    if let Some(title) = schema.title_attribute() {
        builder = builder.title_field(&title.static_name);
    }
    if let Some(metadata) = &row.metadata {
        builder = builder.metadata(metadata.clone());
    }
    match row.published_entity_id {
        Some(published) => {
            builder = builder
                .id(published)
                .repository_id(row.entity_id)
                .published_entity_id(published);
        }
        None => {
            builder = builder.id(row.entity_id).repository_id(row.entity_id);
            if row.is_published {
                if let Some(draft) = storage.get_draft_of(row.entity_id)? {
                    builder = builder.draft_entity_id(draft.entity_id);
                }
            }
        }
    }
    Ok(attributes
        .into_iter()
        .fold(builder, |b, attr| b.attribute(attr))
        .build())
}

fn build_attribute(
    name: &str,
    attr_type: AttributeType,
    values: &[&ValueRecord],
) -> Result<Option<Attribute>, EngineError> {
    if values.is_empty() {
        return Ok(None);
    }
    let built = values
        .iter()
        .map(|v| Value::build(attr_type, &v.value, v.languages.clone()))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Some(
        Attribute::with_values(name, attr_type, built).repair_faulty_dimensions(),
    ))
}
