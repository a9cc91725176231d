pub mod cache;
pub mod config;
pub mod delete;
pub mod error;
pub mod import;
pub mod loader;
pub mod persist;
pub mod publishing;
pub mod relationships;
pub mod versioning;

pub use cache::{CacheListener, ContentTypeCache};
pub use config::EngineConfig;
pub use delete::DeleteCheck;
pub use error::{EngineError, ReferenceError, StateConflictError, ValidationError};
pub use import::{
    ImportContentType, ImportEntity, ImportLogItem, ImportOptions, ImportReport, ImportSeverity, Importer,
};
pub use versioning::VersionInfo;

use std::sync::Arc;

use tracing::{info, warn};

use eavstore_core::{
    Attribute, ChangeId, ContentType, ContentTypeId, DimensionId, Entity, EntityGuid, EntityId, Language,
    SaveOptions, Value, create_merged_for_saving,
};
use eavstore_storage::{EntityRecord, SqliteStorage, Storage, StorageTx, TimelineOperation};

use crate::cache::find_content_type;
use crate::loader::{load_entity, resolve_schema};
use crate::persist::{SaveBatch, TxContext, publish_in_tx, save_in_tx};
use crate::relationships::resolve;

/// Entry point for saving, publishing, deleting, and versioning entities of
/// one app.
pub struct Engine {
    config: EngineConfig,
    storage: SqliteStorage,
    cache: Arc<ContentTypeCache>,
    listener: Option<Arc<dyn CacheListener>>,
}

impl Engine {
    pub fn new(config: EngineConfig, storage: SqliteStorage) -> Result<Self, EngineError> {
        storage.set_busy_timeout(config.default_busy_timeout())?;
        Ok(Self {
            config,
            storage,
            cache: Arc::new(ContentTypeCache::new()),
            listener: None,
        })
    }

    /// Share a content-type cache with other engines of the same database.
    pub fn with_cache(mut self, cache: Arc<ContentTypeCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn CacheListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn storage(&self) -> &SqliteStorage {
        &self.storage
    }

    pub fn cache(&self) -> &Arc<ContentTypeCache> {
        &self.cache
    }

    fn load_types(&self) -> Result<Arc<Vec<ContentType>>, EngineError> {
        let app_id = self.config.app();
        Ok(self
            .cache
            .get_or_load(app_id, || self.storage.get_content_types(app_id))?)
    }

    /// Run `work` in one immediate transaction. Commits on `Ok`, rolls back
    /// on `Err`, and signals cache listeners after a commit.
    pub(crate) fn in_transaction<T>(
        &mut self,
        work: impl FnOnce(&StorageTx<'_>, &TxContext<'_>) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let types = self.load_types()?;
        let ctx = TxContext {
            app_id: self.config.app(),
            zone_id: self.config.zone(),
            user_name: &self.config.user_name,
            types: &types,
        };
        let tx = self.storage.begin()?;
        match work(&tx, &ctx) {
            Ok(value) => {
                tx.commit()?;
                self.cache.invalidate(ctx.app_id);
                if let Some(listener) = &self.listener {
                    listener.purge_cache(ctx.zone_id, ctx.app_id);
                }
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = tx.rollback() {
                    warn!(error = %rollback, "rollback failed");
                }
                Err(err)
            }
        }
    }

    // ========================================================================
    // Languages and content types
    // ========================================================================

    pub fn languages(&self) -> Result<Vec<Language>, EngineError> {
        Ok(self.storage.get_dimensions(self.config.zone())?)
    }

    pub fn add_language(&mut self, key: &str, name: &str) -> Result<DimensionId, EngineError> {
        let zone_id = self.config.zone();
        self.in_transaction(|tx, _| Ok(tx.insert_dimension(zone_id, key, name)?))
    }

    /// Save options for this zone with `primary` as the primary language.
    pub fn save_options(&self, primary: &str) -> Result<SaveOptions, EngineError> {
        Ok(SaveOptions::new(primary, self.languages()?))
    }

    pub fn content_types(&self) -> Result<Arc<Vec<ContentType>>, EngineError> {
        self.load_types()
    }

    pub fn content_type(&self, name: &str) -> Result<Option<ContentType>, EngineError> {
        Ok(find_content_type(&self.load_types()?, name).cloned())
    }

    pub fn save_content_type(&mut self, content_type: &ContentType) -> Result<ContentTypeId, EngineError> {
        self.in_transaction(|tx, ctx| {
            let change = tx.next_change_id(ctx.user_name)?;
            let id = tx.insert_content_type(ctx.app_id, content_type, change)?;
            info!(content_type = %content_type.static_name, %id, "content type saved");
            Ok(id)
        })
    }

    // ========================================================================
    // Saving
    // ========================================================================

    /// Persist one entity as given. Returns the id of the row written.
    pub fn save_entity(&mut self, entity: &Entity, options: &SaveOptions) -> Result<EntityId, EngineError> {
        self.in_transaction(|tx, ctx| {
            let mut batch = SaveBatch::new();
            let id = save_in_tx(tx, ctx, entity, options, &mut batch, TimelineOperation::Save)?;
            batch.flush(tx, ctx)?;
            Ok(id)
        })
    }

    /// Persist several entities atomically. References between them resolve
    /// regardless of order.
    pub fn save_entities(
        &mut self,
        entities: &[Entity],
        options: &SaveOptions,
    ) -> Result<Vec<EntityId>, EngineError> {
        self.in_transaction(|tx, ctx| {
            let mut batch = SaveBatch::new();
            let ids = entities
                .iter()
                .map(|e| save_in_tx(tx, ctx, e, options, &mut batch, TimelineOperation::Save))
                .collect::<Result<Vec<_>, _>>()?;
            batch.flush(tx, ctx)?;
            Ok(ids)
        })
    }

    /// Merge `incoming` into the stored state (the draft when there is one)
    /// and save the result.
    pub fn merge_and_save(&mut self, incoming: &Entity, options: &SaveOptions) -> Result<EntityId, EngineError> {
        self.in_transaction(|tx, ctx| {
            let merged = merge_with_stored(tx, ctx, incoming, options)?;
            let mut batch = SaveBatch::new();
            let id = save_in_tx(tx, ctx, &merged, options, &mut batch, TimelineOperation::Save)?;
            batch.flush(tx, ctx)?;
            Ok(id)
        })
    }

    // ========================================================================
    // Publishing and deletion
    // ========================================================================

    /// Make the draft of an entity the published state. Returns the
    /// published row id.
    pub fn publish_draft_in_branch(&mut self, entity_id: EntityId) -> Result<EntityId, EngineError> {
        self.in_transaction(|tx, ctx| {
            let mut batch = SaveBatch::new();
            let id = publish_in_tx(tx, ctx, entity_id, &mut batch)?;
            batch.flush(tx, ctx)?;
            Ok(id)
        })
    }

    pub fn can_delete(&self, entity_id: EntityId) -> Result<DeleteCheck, EngineError> {
        let row = self.live_row(entity_id)?;
        delete::check_row(&self.storage, &row)
    }

    /// Delete an entity. With `force`, edges pointing at it are removed
    /// instead of blocking the delete.
    pub fn delete_entity(&mut self, entity_id: EntityId, force: bool) -> Result<(), EngineError> {
        self.in_transaction(|tx, ctx| {
            let mut batch = SaveBatch::new();
            delete::delete_in_tx(tx, ctx, entity_id, force, &mut batch)?;
            batch.flush(tx, ctx)
        })
    }

    /// The live entity with this GUID; a soft-deleted one is brought back,
    /// and a missing one is created from `attributes`.
    pub fn get_or_create(
        &mut self,
        guid: EntityGuid,
        content_type: &str,
        attributes: Vec<Attribute>,
        options: &SaveOptions,
    ) -> Result<EntityId, EngineError> {
        self.in_transaction(|tx, ctx| {
            if let Some(row) = pick_primary(tx.find_by_guid(ctx.app_id, guid)?) {
                return Ok(row.entity_id);
            }
            let mut batch = SaveBatch::new();
            if let Some(row) = tx.find_deleted_by_guid(ctx.app_id, guid)? {
                let change = tx.next_change_id(ctx.user_name)?;
                tx.undelete_entity(row.entity_id, change)?;
                let request = versioning::SnapshotRequest {
                    entity_id: row.entity_id,
                    guid,
                    change,
                    operation: TimelineOperation::Restore,
                };
                batch.snapshots.record(tx, ctx, request, true)?;
                info!(entity_id = %row.entity_id, %guid, change_id = %change, "entity resurrected");
                return Ok(row.entity_id);
            }
            let entity = attributes
                .into_iter()
                .fold(Entity::builder(guid).content_type(content_type), |b, a| b.attribute(a))
                .build();
            let id = save_in_tx(tx, ctx, &entity, options, &mut batch, TimelineOperation::Save)?;
            batch.flush(tx, ctx)?;
            Ok(id)
        })
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// A row of this app that is not deleted.
    fn find_live(&self, entity_id: EntityId) -> Result<Option<EntityRecord>, EngineError> {
        let app_id = self.config.app();
        Ok(self
            .storage
            .get_entity(entity_id)?
            .filter(|r| r.app_id == app_id && !r.is_deleted()))
    }

    fn live_row(&self, entity_id: EntityId) -> Result<EntityRecord, EngineError> {
        self.find_live(entity_id)?
            .ok_or_else(|| EngineError::EntityNotFound(entity_id.to_string()))
    }

    /// The stored state of one row; `None` when missing, deleted, or owned by
    /// another app.
    pub fn get_entity(&self, entity_id: EntityId) -> Result<Option<Entity>, EngineError> {
        let Some(row) = self.find_live(entity_id)? else {
            return Ok(None);
        };
        let types = self.load_types()?;
        Ok(Some(load_entity(&self.storage, &types, &row)?))
    }

    /// The published state for a GUID, or its only draft.
    pub fn get_entity_by_guid(&self, guid: EntityGuid) -> Result<Option<Entity>, EngineError> {
        let Some(row) = pick_primary(self.storage.find_by_guid(self.config.app(), guid)?) else {
            return Ok(None);
        };
        let types = self.load_types()?;
        Ok(Some(load_entity(&self.storage, &types, &row)?))
    }

    pub fn get_draft(&self, published_id: EntityId) -> Result<Option<Entity>, EngineError> {
        let app_id = self.config.app();
        let Some(row) = self.storage.get_draft_of(published_id)?.filter(|r| r.app_id == app_id) else {
            return Ok(None);
        };
        let types = self.load_types()?;
        Ok(Some(load_entity(&self.storage, &types, &row)?))
    }

    /// Ordered children of an entity attribute. Empty slots stay `None`.
    pub fn get_children(&self, parent: EntityId, attribute: &str) -> Result<Vec<Option<Entity>>, EngineError> {
        let row = self.live_row(parent)?;
        let types = self.load_types()?;
        let Some(content_type) = types.iter().find(|t| t.id == Some(row.content_type_id)) else {
            return Ok(Vec::new());
        };
        let schema = resolve_schema(&self.storage, &types, content_type)?;
        let Some(attribute_id) = schema.attribute(attribute).and_then(|d| d.id) else {
            return Ok(Vec::new());
        };
        let mut children = Vec::new();
        for child in self.storage.get_children(parent, attribute_id)? {
            let loaded = match child {
                Some(id) => match self.storage.get_entity(id)? {
                    Some(child_row) => Some(load_entity(&self.storage, &types, &child_row)?),
                    None => None,
                },
                None => None,
            };
            children.push(loaded);
        }
        Ok(children)
    }

    // ========================================================================
    // Versioning
    // ========================================================================

    pub fn history(&self, entity_id: EntityId) -> Result<Vec<VersionInfo>, EngineError> {
        versioning::history(&self.storage, entity_id)
    }

    pub fn get_version(&self, entity_id: EntityId, change_id: ChangeId) -> Result<Entity, EngineError> {
        versioning::get_version(&self.storage, entity_id, change_id)
    }

    /// Save the snapshot taken at `change_id` as the new published state.
    /// Languages the zone no longer has and references that no longer
    /// resolve are dropped.
    pub fn restore_version(&mut self, entity_id: EntityId, change_id: ChangeId) -> Result<EntityId, EngineError> {
        self.in_transaction(|tx, ctx| {
            let snapshot = versioning::get_version(tx, entity_id, change_id)?;
            let row = tx
                .get_entity(entity_id)?
                .filter(|r| r.app_id == ctx.app_id && !r.is_deleted())
                .ok_or_else(|| EngineError::EntityNotFound(entity_id.to_string()))?;
            let target = row.published_entity_id.unwrap_or(row.entity_id);

            let mut options = SaveOptions::new("", tx.get_dimensions(ctx.zone_id)?);
            options.discard_attributes_missing_in_schema = true;
            let cleaned = create_merged_for_saving(None, &snapshot, None, &options);

            let mut attributes = Vec::new();
            for attr in cleaned.attributes().values() {
                if !attr.attr_type.is_entity() {
                    attributes.push(attr.clone());
                    continue;
                }
                let mut kept = Vec::new();
                for child in attr.children() {
                    match child {
                        Some(reference) if resolve(tx, ctx.app_id, &reference)?.is_none() => {}
                        other => kept.push(other),
                    }
                }
                attributes.push(Attribute::with_values(
                    &attr.name,
                    attr.attr_type,
                    vec![Value::entities(kept)],
                ));
            }
            let restored = cleaned
                .with_attributes(attributes)
                .with_id(target)
                .with_published(true);

            let mut batch = SaveBatch::new();
            let id = save_in_tx(tx, ctx, &restored, &options, &mut batch, TimelineOperation::Restore)?;
            batch.flush(tx, ctx)?;
            info!(entity_id = %id, change_id = %change_id, "version restored");
            Ok(id)
        })
    }
}

/// The row readers see for a GUID: published first, else the first draft.
fn pick_primary(rows: Vec<EntityRecord>) -> Option<EntityRecord> {
    match rows.iter().position(|r| r.is_published) {
        Some(i) => rows.into_iter().nth(i),
        None => rows.into_iter().next(),
    }
}

/// Merge `incoming` into whatever is stored for it. The draft is the base
/// when the entity has one.
fn merge_with_stored(
    tx: &StorageTx<'_>,
    ctx: &TxContext<'_>,
    incoming: &Entity,
    options: &SaveOptions,
) -> Result<Entity, EngineError> {
    let row = match incoming.id() {
        Some(id) => tx.get_entity(id)?.filter(|r| r.app_id == ctx.app_id && !r.is_deleted()),
        None => pick_primary(tx.find_by_guid(ctx.app_id, incoming.guid())?),
    };
    let base = match &row {
        Some(row) if row.is_published => tx.get_draft_of(row.entity_id)?.or_else(|| Some(row.clone())),
        other => other.clone(),
    };
    let existing = match &base {
        Some(base) => Some(load_entity(tx, ctx.types, base)?),
        None => None,
    };

    let type_name = incoming
        .content_type()
        .or_else(|| existing.as_ref().and_then(|e| e.content_type()));
    let filter = match type_name.and_then(|name| find_content_type(ctx.types, name)) {
        Some(content_type) => Some(resolve_schema(tx, ctx.types, content_type)?),
        None => None,
    };

    let merged = create_merged_for_saving(existing.as_ref(), incoming, filter.as_ref(), options);
    Ok(merged.with_published(incoming.is_published()))
}
