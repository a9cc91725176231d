use tracing::{debug, info};

use eavstore_core::{
    AppId, AttributeDefinition, ChangeId, ContentType, Entity, EntityGuid, EntityId, EntityRef, Language,
    SaveOptions, TypedValue, Value, ZoneId,
};
use eavstore_storage::{EntityRecord, NewEntityRow, Storage, StorageError, StorageTx, TimelineOperation};

use crate::cache::find_content_type;
use crate::error::{EngineError, StateConflictError, ValidationError};
use crate::loader::resolve_schema;
use crate::publishing::{self, BranchPlan, BranchState, plan_branch};
use crate::relationships::RelationshipQueue;
use crate::versioning::{SnapshotQueue, SnapshotRequest};

/// What every write in one transaction needs to know about its scope.
pub struct TxContext<'a> {
    pub app_id: AppId,
    pub zone_id: ZoneId,
    pub user_name: &'a str,
    pub types: &'a [ContentType],
}

/// Queues shared by every save of one transaction.
#[derive(Debug, Default)]
pub struct SaveBatch {
    pub relationships: RelationshipQueue,
    pub snapshots: SnapshotQueue,
}

impl SaveBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write queued edges, then the snapshots that waited for them.
    pub fn flush(self, tx: &StorageTx<'_>, ctx: &TxContext<'_>) -> Result<(), EngineError> {
        self.relationships.flush(tx, ctx.app_id)?;
        self.snapshots.flush(tx, ctx)?;
        Ok(())
    }
}

pub(crate) fn entity_label(entity: &Entity) -> String {
    match entity.id() {
        Some(id) => format!("{} (id {id})", entity.guid()),
        None => entity.guid().to_string(),
    }
}

struct Prepared {
    content_type: ContentType,
    schema: ContentType,
}

fn prepare(
    tx: &StorageTx<'_>,
    ctx: &TxContext<'_>,
    entity: &Entity,
    options: &SaveOptions,
) -> Result<Prepared, EngineError> {
    let label = entity_label(entity);
    let name = entity
        .content_type()
        .ok_or_else(|| ValidationError::MissingContentType { entity: label.clone() })?;
    let content_type = find_content_type(ctx.types, name)
        .cloned()
        .ok_or_else(|| ValidationError::UnknownContentType {
            entity: label.clone(),
            content_type: name.to_string(),
        })?;
    let schema = resolve_schema(tx, ctx.types, &content_type)?;

    for attr in entity.attributes().values() {
        for value in &attr.values {
            if let Some(unknown) = value.languages.iter().find(|l| !options.is_known_language(&l.key)) {
                return Err(ValidationError::UnknownLanguage {
                    entity: label,
                    attribute: attr.name.clone(),
                    key: unknown.key.clone(),
                }
                .into());
            }
        }
        if !schema.has_attribute(&attr.name) && !options.discard_attributes_missing_in_schema {
            return Err(ValidationError::AttributeNotInSchema {
                entity: label,
                attribute: attr.name.clone(),
                content_type: schema.static_name.clone(),
            }
            .into());
        }
    }
    Ok(Prepared { content_type, schema })
}

/// The live row a save targets: by id when the entity has one, else the
/// published row carrying its GUID.
fn find_target(
    tx: &StorageTx<'_>,
    ctx: &TxContext<'_>,
    entity: &Entity,
) -> Result<Option<EntityRecord>, EngineError> {
    if let Some(id) = entity.id() {
        return match tx.get_entity(id)? {
            Some(row) if row.app_id == ctx.app_id && !row.is_deleted() => Ok(Some(row)),
            _ => Err(EngineError::EntityNotFound(entity_label(entity))),
        };
    }
    let rows = tx.find_by_guid(ctx.app_id, entity.guid())?;
    let published = rows.iter().position(|r| r.is_published);
    Ok(match published {
        Some(i) => rows.into_iter().nth(i),
        None => rows.into_iter().next(),
    })
}

fn new_row(
    ctx: &TxContext<'_>,
    entity: &Entity,
    guid: EntityGuid,
    content_type: &ContentType,
    is_published: bool,
    published_entity_id: Option<EntityId>,
    version: i32,
) -> Result<NewEntityRow, EngineError> {
    let content_type_id = content_type
        .id
        .ok_or_else(|| StorageError::NotFound(format!("id of content type {}", content_type.static_name)))?;
    Ok(NewEntityRow {
        app_id: ctx.app_id,
        guid,
        content_type_id,
        is_published,
        published_entity_id,
        version,
        owner: if entity.owner().is_empty() {
            ctx.user_name.to_string()
        } else {
            entity.owner().to_string()
        },
        metadata: entity.metadata().cloned(),
    })
}

/// Validate, branch, and write one entity inside an open transaction.
/// Edges and deferred snapshots go to `batch`; the caller flushes it.
pub(crate) fn save_in_tx(
    tx: &StorageTx<'_>,
    ctx: &TxContext<'_>,
    entity: &Entity,
    options: &SaveOptions,
    batch: &mut SaveBatch,
    operation: TimelineOperation,
) -> Result<EntityId, EngineError> {
    let prepared = prepare(tx, ctx, entity, options)?;
    let target = find_target(tx, ctx, entity)?;
    if let Some(row) = &target {
        if Some(row.content_type_id) != prepared.content_type.id {
            return Err(ValidationError::ContentTypeMismatch {
                entity: entity_label(entity),
                stored: row.content_type.clone(),
                incoming: prepared.content_type.static_name.clone(),
            }
            .into());
        }
    }

    let state = BranchState::detect(tx, target.as_ref())?;
    let plan = plan_branch(state, entity.is_published(), options.force_no_branch);
    let change = tx.next_change_id(ctx.user_name)?;
    let guid = match &target {
        Some(row) => row.guid,
        None if entity.guid().is_nil() => EntityGuid::new(),
        None => entity.guid(),
    };

    let row_id = match plan {
        BranchPlan::Insert { is_published } => {
            let row = new_row(ctx, entity, guid, &prepared.content_type, is_published, None, 1)?;
            tx.insert_entity(&row, change)?
        }
        BranchPlan::CreateDraft { published } => {
            let version = target.as_ref().map_or(0, |r| r.version) + 1;
            let row = new_row(ctx, entity, guid, &prepared.content_type, false, Some(published), version)?;
            publishing::insert_draft(tx, &row, published, change)?
        }
        BranchPlan::UpdateInPlace {
            row,
            is_published,
            published_entity_id,
        } => {
            let current = tx
                .get_entity(row)?
                .ok_or_else(|| EngineError::EntityNotFound(row.to_string()))?;
            tx.update_entity_header(row, is_published, published_entity_id, current.version + 1, change)?;
            tx.set_metadata(row, entity.metadata())?;
            tx.clear_values(row)?;
            row
        }
        BranchPlan::Promote { draft, published } => {
            promote(tx, draft, published, change, batch)?;
            tx.set_metadata(published, entity.metadata())?;
            tx.clear_values(published)?;
            published
        }
    };

    write_attributes(tx, entity, &prepared.schema, options, row_id, change, batch)?;
    let request = SnapshotRequest {
        entity_id: row_id,
        guid,
        change,
        operation,
    };
    let deferred = batch.relationships.has_edges_for(row_id);
    batch.snapshots.record(tx, ctx, request, !deferred)?;

    info!(
        entity_id = %row_id,
        guid = %guid,
        change_id = %change,
        plan = ?plan,
        "entity saved"
    );
    Ok(row_id)
}

/// Fold a draft into its published row. Work the batch still holds for the
/// draft moves to the published row.
fn promote(
    tx: &StorageTx<'_>,
    draft: EntityId,
    published: EntityId,
    change: ChangeId,
    batch: &mut SaveBatch,
) -> Result<(), EngineError> {
    publishing::promote_draft(tx, draft, published, change)?;
    batch.relationships.retarget(draft, published);
    batch.snapshots.discard(draft);
    Ok(())
}

/// Write scalar values and queue edge-sets.
fn write_attributes(
    tx: &StorageTx<'_>,
    entity: &Entity,
    schema: &ContentType,
    options: &SaveOptions,
    row_id: EntityId,
    change: ChangeId,
    batch: &mut SaveBatch,
) -> Result<(), EngineError> {
    let label = entity_label(entity);
    for attr in entity.attributes().values() {
        let Some(def) = schema.attribute(&attr.name) else {
            debug!(attribute = %attr.name, "attribute not in schema, skipped");
            continue;
        };
        let attribute_id = def
            .id
            .ok_or_else(|| StorageError::NotFound(format!("id of attribute {}", def.static_name)))?;

        if def.attr_type.is_entity() {
            let children = collect_children(&label, def, &attr.values)?;
            batch
                .relationships
                .queue(row_id, attribute_id, &def.static_name, children);
            continue;
        }

        for value in &attr.values {
            let typed = coerce(&label, def, value)?;
            let Some(serialized) = typed.serialized() else {
                continue;
            };
            let languages = resolve_languages(&label, &attr.name, &value.languages, options)?;
            tx.insert_value(row_id, attribute_id, &serialized, &languages, change)?;
        }
    }
    Ok(())
}

fn collect_children(
    label: &str,
    def: &AttributeDefinition,
    values: &[Value],
) -> Result<Vec<Option<EntityRef>>, EngineError> {
    let mut children = Vec::new();
    for value in values {
        match &value.value {
            TypedValue::EntityRefs(refs) => children.extend(refs.iter().copied()),
            TypedValue::String(raw) => match TypedValue::parse(def.attr_type, raw) {
                Ok(TypedValue::EntityRefs(refs)) => children.extend(refs),
                Ok(_) => {}
                Err(source) => {
                    return Err(ValidationError::MalformedValue {
                        entity: label.to_string(),
                        attribute: def.static_name.clone(),
                        source,
                    }
                    .into());
                }
            },
            other => {
                return Err(ValidationError::TypeMismatch {
                    entity: label.to_string(),
                    attribute: def.static_name.clone(),
                    expected: def.attr_type.to_string(),
                    actual: other.attr_type().to_string(),
                }
                .into());
            }
        }
    }
    Ok(children)
}

/// Bring a value to the declared type. Text converts by parsing; anything
/// else must already match.
fn coerce(label: &str, def: &AttributeDefinition, value: &Value) -> Result<TypedValue, EngineError> {
    if value.value.attr_type() == def.attr_type {
        return Ok(value.value.clone());
    }
    match &value.value {
        TypedValue::String(raw) | TypedValue::Custom(raw) | TypedValue::Hyperlink(raw) => {
            TypedValue::parse(def.attr_type, raw).map_err(|source| {
                ValidationError::MalformedValue {
                    entity: label.to_string(),
                    attribute: def.static_name.clone(),
                    source,
                }
                .into()
            })
        }
        other => Err(ValidationError::TypeMismatch {
            entity: label.to_string(),
            attribute: def.static_name.clone(),
            expected: def.attr_type.to_string(),
            actual: other.attr_type().to_string(),
        }
        .into()),
    }
}

fn resolve_languages(
    label: &str,
    attribute: &str,
    languages: &[Language],
    options: &SaveOptions,
) -> Result<Vec<Language>, EngineError> {
    languages
        .iter()
        .map(|l| match options.language(&l.key) {
            Some(zone) => Ok(Language {
                dimension_id: zone.dimension_id.or(l.dimension_id),
                key: zone.key.clone(),
                read_only: l.read_only,
            }),
            None => Err(ValidationError::UnknownLanguage {
                entity: label.to_string(),
                attribute: attribute.to_string(),
                key: l.key.clone(),
            }
            .into()),
        })
        .collect()
}

/// Publish the draft branch of an entity, or flip a draft-only entity.
pub(crate) fn publish_in_tx(
    tx: &StorageTx<'_>,
    ctx: &TxContext<'_>,
    entity_id: EntityId,
    batch: &mut SaveBatch,
) -> Result<EntityId, EngineError> {
    let row = tx
        .get_entity(entity_id)?
        .filter(|r| r.app_id == ctx.app_id && !r.is_deleted())
        .ok_or_else(|| EngineError::EntityNotFound(entity_id.to_string()))?;
    let state = BranchState::detect(tx, Some(&row))?;
    let change = tx.next_change_id(ctx.user_name)?;
    let published = match state {
        BranchState::Published(id) => {
            return Err(StateConflictError::AlreadyPublished { entity: id }.into());
        }
        BranchState::PublishedWithDraft { published, draft }
        | BranchState::DraftOfPublished { draft, published } => {
            promote(tx, draft, published, change, batch)?;
            published
        }
        BranchState::DraftOnly(id) => {
            tx.update_entity_header(id, true, None, row.version + 1, change)?;
            id
        }
        BranchState::New => return Err(EngineError::EntityNotFound(entity_id.to_string())),
    };
    let request = SnapshotRequest {
        entity_id: published,
        guid: row.guid,
        change,
        operation: TimelineOperation::Save,
    };
    let deferred = batch.relationships.has_edges_for(published);
    batch.snapshots.record(tx, ctx, request, !deferred)?;
    info!(entity_id = %published, guid = %row.guid, change_id = %change, "draft published");
    Ok(published)
}
