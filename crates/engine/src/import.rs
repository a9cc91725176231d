//! Batch import of content types and entities

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use eavstore_core::{
    Attribute, AttributeDefinition, AttributeType, ContentType, Entity, EntityGuid, EntityId, Language,
    MetadataFor, MetadataKey, SaveOptions, Value, create_merged_for_saving,
};
use eavstore_storage::{Storage, StorageTx, TimelineOperation};

use crate::Engine;
use crate::cache::find_content_type;
use crate::error::EngineError;
use crate::loader::{load_entity, resolve_schema};
use crate::persist::{SaveBatch, TxContext, save_in_tx};

/// Import behavior
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImportOptions {
    /// Attributes that already hold a value keep it
    pub dont_update_existing_attribute_values: bool,

    /// Attributes missing from the import survive on existing entities
    pub keep_attributes_missing_in_import: bool,

    /// Entities that currently have a draft are skipped
    pub prevent_update_on_draft_entities: bool,

    /// Entity count above which the busy timeout is raised for the import
    pub large_import_threshold: usize,

    /// Primary language of the merge
    pub primary_language: String,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            dont_update_existing_attribute_values: false,
            keep_attributes_missing_in_import: true,
            prevent_update_on_draft_entities: false,
            large_import_threshold: 500,
            primary_language: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportLanguage {
    pub key: String,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportValue {
    pub value: String,
    #[serde(default)]
    pub languages: Vec<ImportLanguage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportAttribute {
    #[serde(rename = "type")]
    pub attr_type: String,
    #[serde(default)]
    pub values: Vec<ImportValue>,
}

/// One entity as delivered by an import source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportEntity {
    pub content_type_static_name: String,
    #[serde(default)]
    pub entity_guid: Option<EntityGuid>,
    #[serde(default)]
    pub key_target_type: Option<i32>,
    #[serde(default)]
    pub key_number: Option<i64>,
    #[serde(default)]
    pub key_guid: Option<EntityGuid>,
    #[serde(default)]
    pub key_string: Option<String>,
    #[serde(default = "default_published")]
    pub is_published: bool,
    #[serde(default)]
    pub force_no_branch: bool,
    #[serde(default)]
    pub attributes: BTreeMap<String, ImportAttribute>,
}

fn default_published() -> bool {
    true
}

impl ImportEntity {
    fn metadata(&self) -> Option<MetadataFor> {
        let target_type = self.key_target_type?;
        let key = if let Some(number) = self.key_number {
            MetadataKey::Number(number)
        } else if let Some(guid) = self.key_guid {
            MetadataKey::Guid(guid)
        } else {
            MetadataKey::String(self.key_string.clone()?)
        };
        Some(MetadataFor { target_type, key })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportAttributeDefinition {
    pub static_name: String,
    #[serde(rename = "type")]
    pub attr_type: String,
    #[serde(default)]
    pub is_title: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportContentType {
    pub name: String,
    pub static_name: String,
    pub scope: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub uses_configuration_of: Option<String>,
    #[serde(default)]
    pub always_share_configuration: bool,
    #[serde(default)]
    pub attributes: Vec<ImportAttributeDefinition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImportSeverity {
    Information,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportLogItem {
    pub severity: ImportSeverity,
    pub message: String,
    pub entity_guid: Option<EntityGuid>,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub log: Vec<ImportLogItem>,
    pub content_types_created: usize,
    /// Row ids written, in import order
    pub saved: Vec<EntityId>,
    pub skipped: usize,
}

impl ImportReport {
    pub fn has_errors(&self) -> bool {
        self.log.iter().any(|item| item.severity == ImportSeverity::Error)
    }

    pub fn errors(&self) -> impl Iterator<Item = &ImportLogItem> {
        self.log.iter().filter(|item| item.severity == ImportSeverity::Error)
    }

    fn push(
        &mut self,
        severity: ImportSeverity,
        message: String,
        entity_guid: Option<EntityGuid>,
        content_type: Option<&str>,
    ) {
        let guid = entity_guid.map(|g| g.to_string()).unwrap_or_default();
        let ct = content_type.unwrap_or_default();
        match severity {
            ImportSeverity::Information => info!(guid = %guid, content_type = %ct, "{message}"),
            ImportSeverity::Warning => warn!(guid = %guid, content_type = %ct, "{message}"),
            ImportSeverity::Error => error!(guid = %guid, content_type = %ct, "{message}"),
        }
        self.log.push(ImportLogItem {
            severity,
            message,
            entity_guid,
            content_type: content_type.map(str::to_string),
        });
    }
}

pub struct Importer {
    options: ImportOptions,
}

impl Importer {
    pub fn new(options: ImportOptions) -> Self {
        Self { options }
    }

    /// Import content types, then entities. Each part runs in its own
    /// transaction; a storage failure rolls back the part it happened in.
    pub fn import(
        &self,
        engine: &mut Engine,
        content_types: &[ImportContentType],
        entities: &[ImportEntity],
    ) -> Result<ImportReport, EngineError> {
        let mut report = ImportReport::default();
        if !content_types.is_empty() {
            self.import_content_types(engine, content_types, &mut report)?;
        }
        if entities.is_empty() {
            return Ok(report);
        }

        let large = entities.len() > self.options.large_import_threshold;
        if large {
            engine.storage().set_busy_timeout(engine.config().import_timeout())?;
            debug!(entities = entities.len(), "large import, busy timeout raised");
        }
        let result = self.import_entities(engine, entities, &mut report);
        if large {
            engine.storage().set_busy_timeout(engine.config().default_busy_timeout())?;
        }
        result?;

        info!(
            saved = report.saved.len(),
            skipped = report.skipped,
            "import finished"
        );
        Ok(report)
    }

    fn import_content_types(
        &self,
        engine: &mut Engine,
        content_types: &[ImportContentType],
        report: &mut ImportReport,
    ) -> Result<(), EngineError> {
        let mut ordered: Vec<&ImportContentType> = content_types.iter().collect();
        ordered.sort_by_key(|ct| !ct.scope.eq_ignore_ascii_case(eavstore_core::content_type::SYSTEM_SCOPE));

        engine.in_transaction(|tx, ctx| {
            let change = tx.next_change_id(ctx.user_name)?;
            for import in ordered {
                let name = import.static_name.as_str();
                if let Some(existing) = tx.get_content_type(ctx.app_id, name)? {
                    if existing.is_ghost() {
                        report.push(
                            ImportSeverity::Error,
                            format!("content type {name} uses a shared configuration and cannot be changed"),
                            None,
                            Some(name),
                        );
                        continue;
                    }
                    report.push(
                        ImportSeverity::Information,
                        format!("content type {name} already exists"),
                        None,
                        Some(name),
                    );
                    let Some(id) = existing.id else { continue };
                    let mut next_order = existing.attributes.len() as i32;
                    for def in &import.attributes {
                        if existing.has_attribute(&def.static_name) {
                            report.push(
                                ImportSeverity::Warning,
                                format!("attribute {} already exists on {name}", def.static_name),
                                None,
                                Some(name),
                            );
                            continue;
                        }
                        let mut definition = attribute_definition(def)?;
                        definition.sort_order = next_order;
                        next_order += 1;
                        tx.insert_attribute(id, &definition, change)?;
                    }
                    continue;
                }

                let mut content_type = ContentType::new(&import.name, name, &import.scope);
                content_type.description = import.description.clone();
                content_type.always_share_configuration = import.always_share_configuration;
                if let Some(master) = &import.uses_configuration_of {
                    let masters: Vec<ContentType> = tx
                        .find_content_types_any_app(master)?
                        .into_iter()
                        .filter(|t| !t.is_ghost())
                        .collect();
                    match masters.len() {
                        0 => {
                            report.push(
                                ImportSeverity::Warning,
                                format!("shared configuration {master} of {name} not found, skipped"),
                                None,
                                Some(name),
                            );
                            continue;
                        }
                        1 => {}
                        n => report.push(
                            ImportSeverity::Warning,
                            format!("{n} content types named {master} found, using the first"),
                            None,
                            Some(name),
                        ),
                    }
                    content_type.uses_configuration_of = Some(masters[0].static_name.clone());
                } else {
                    for def in &import.attributes {
                        content_type = content_type.with_attribute(attribute_definition(def)?);
                    }
                }
                tx.insert_content_type(ctx.app_id, &content_type, change)?;
                report.content_types_created += 1;
            }
            Ok(())
        })
    }

    fn import_entities(
        &self,
        engine: &mut Engine,
        entities: &[ImportEntity],
        report: &mut ImportReport,
    ) -> Result<(), EngineError> {
        engine.in_transaction(|tx, ctx| {
            let mut base = SaveOptions::new(&self.options.primary_language, tx.get_dimensions(ctx.zone_id)?);
            base.preserve_existing_attributes = self.options.keep_attributes_missing_in_import;
            base.preserve_unknown_attributes = false;
            base.preserve_unknown_languages = true;

            let mut batch = SaveBatch::new();
            for import in entities {
                match self.prepare_entity(tx, ctx, import, &base, report)? {
                    Some((entity, options)) => {
                        let id = save_in_tx(tx, ctx, &entity, &options, &mut batch, TimelineOperation::Save)?;
                        report.saved.push(id);
                    }
                    None => report.skipped += 1,
                }
            }
            batch.flush(tx, ctx)
        })
    }

    /// Turn one import entity into the merged entity to save. `None` means
    /// it was skipped and the reason logged.
    fn prepare_entity(
        &self,
        tx: &StorageTx<'_>,
        ctx: &TxContext<'_>,
        import: &ImportEntity,
        base: &SaveOptions,
        report: &mut ImportReport,
    ) -> Result<Option<(Entity, SaveOptions)>, EngineError> {
        let guid = import.entity_guid.unwrap_or_default();
        let type_name = import.content_type_static_name.as_str();
        let Some(content_type) = find_content_type(ctx.types, type_name) else {
            report.push(
                ImportSeverity::Error,
                format!("content type {type_name} not found"),
                Some(guid),
                Some(type_name),
            );
            return Ok(None);
        };
        let schema = resolve_schema(tx, ctx.types, content_type)?;

        // drafts come first
        let existing_rows = tx.find_by_guid(ctx.app_id, guid)?;
        if let Some(row) = existing_rows.first() {
            if Some(row.content_type_id) != content_type.id {
                report.push(
                    ImportSeverity::Error,
                    format!("entity exists with content type {}", row.content_type),
                    Some(guid),
                    Some(type_name),
                );
                return Ok(None);
            }
            if self.options.prevent_update_on_draft_entities && existing_rows.iter().any(|r| !r.is_published) {
                report.push(
                    ImportSeverity::Error,
                    "entity has a draft and drafts may not be updated".to_string(),
                    Some(guid),
                    Some(type_name),
                );
                return Ok(None);
            }
        }
        let existing = match existing_rows.first() {
            Some(row) => Some(load_entity(tx, ctx.types, row)?),
            None => None,
        };

        let mut builder = Entity::builder(guid)
            .content_type(&content_type.static_name)
            .published(import.is_published);
        if let Some(title) = schema.title_attribute() {
            builder = builder.title_field(&title.static_name);
        }
        if let Some(metadata) = import.metadata() {
            builder = builder.metadata(metadata);
        }
        for (name, attribute) in &import.attributes {
            let Some(def) = schema.attribute(name) else {
                report.push(
                    ImportSeverity::Warning,
                    format!("attribute {name} is not part of {type_name}, ignored"),
                    Some(guid),
                    Some(type_name),
                );
                continue;
            };
            let unknown = attribute
                .values
                .iter()
                .flat_map(|v| &v.languages)
                .find(|l| !base.is_known_language(&l.key));
            if let Some(unknown) = unknown {
                report.push(
                    ImportSeverity::Error,
                    format!("attribute {name}: language {} is not a language of this zone", unknown.key),
                    Some(guid),
                    Some(type_name),
                );
                return Ok(None);
            }
            if self.options.dont_update_existing_attribute_values {
                let current = existing
                    .as_ref()
                    .and_then(|e| e.attribute(name))
                    .filter(|a| !a.values.is_empty());
                if let Some(current) = current {
                    builder = builder.attribute(current.clone());
                    continue;
                }
            }
            match build_attribute(def, attribute) {
                Ok(attr) => builder = builder.attribute(attr),
                Err(err) => {
                    report.push(
                        ImportSeverity::Error,
                        format!("attribute {name}: {err}"),
                        Some(guid),
                        Some(type_name),
                    );
                    return Ok(None);
                }
            }
        }
        let incoming = builder.build();

        let mut options = base.clone();
        options.force_no_branch = import.force_no_branch;
        let merged = create_merged_for_saving(existing.as_ref(), &incoming, Some(&schema), &options)
            .with_published(import.is_published);
        Ok(Some((merged, options)))
    }
}

fn attribute_definition(def: &ImportAttributeDefinition) -> Result<AttributeDefinition, EngineError> {
    let definition = AttributeDefinition::new(&def.static_name, AttributeType::parse(&def.attr_type)?);
    Ok(if def.is_title { definition.title() } else { definition })
}

/// Values are typed by the schema, not by the type the source declared.
fn build_attribute(
    def: &AttributeDefinition,
    attribute: &ImportAttribute,
) -> Result<Attribute, eavstore_core::CoreError> {
    let values = attribute
        .values
        .iter()
        .map(|v| {
            let languages = v
                .languages
                .iter()
                .map(|l| Language::new(&l.key).read_only(l.read_only))
                .collect();
            Value::build(def.attr_type, &v.value, languages)
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Attribute::with_values(&def.static_name, def.attr_type, values))
}
