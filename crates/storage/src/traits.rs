use chrono::{DateTime, Utc};
use rusqlite::Connection;

use eavstore_core::{
    AppId, AttributeId, AttributeType, ChangeId, ContentType, ContentTypeId, EntityGuid, EntityId,
    Language, MetadataFor, ZoneId,
};

use crate::error::StorageError;
use crate::sqlite::queries;

/// One stored entity row. Soft-deleted rows carry `deleted_change`.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRecord {
    pub entity_id: EntityId,
    pub app_id: AppId,
    pub guid: EntityGuid,
    pub content_type_id: ContentTypeId,
    pub content_type: String,
    pub is_published: bool,
    pub published_entity_id: Option<EntityId>,
    pub version: i32,
    pub owner: String,
    pub metadata: Option<MetadataFor>,
    pub modified: DateTime<Utc>,
    pub created_change: ChangeId,
    pub modified_change: ChangeId,
    pub deleted_change: Option<ChangeId>,
}

impl EntityRecord {
    pub fn is_deleted(&self) -> bool {
        self.deleted_change.is_some()
    }

    pub fn is_draft(&self) -> bool {
        !self.is_published
    }
}

/// Header fields written with an entity row.
#[derive(Debug, Clone)]
pub struct NewEntityRow {
    pub app_id: AppId,
    pub guid: EntityGuid,
    pub content_type_id: ContentTypeId,
    pub is_published: bool,
    pub published_entity_id: Option<EntityId>,
    pub version: i32,
    pub owner: String,
    pub metadata: Option<MetadataFor>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValueRecord {
    pub value_id: i64,
    pub attribute_id: AttributeId,
    pub attribute: String,
    pub attr_type: AttributeType,
    pub value: String,
    pub languages: Vec<Language>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelationshipRecord {
    pub parent_id: EntityId,
    pub attribute_id: AttributeId,
    pub attribute: String,
    pub sort_order: i32,
    pub child_id: Option<EntityId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimelineOperation {
    Save,
    Delete,
    Restore,
}

impl TimelineOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Save => "save",
            Self::Delete => "delete",
            Self::Restore => "restore",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StorageError> {
        match s {
            "save" => Ok(Self::Save),
            "delete" => Ok(Self::Delete),
            "restore" => Ok(Self::Restore),
            _ => Err(StorageError::Serialization(format!(
                "unknown timeline operation: {s}"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TimelineRecord {
    pub timeline_id: i64,
    pub entity_id: EntityId,
    pub entity_guid: EntityGuid,
    pub change_id: ChangeId,
    pub operation: TimelineOperation,
    pub payload: Vec<u8>,
    pub user_name: String,
    pub created_at: DateTime<Utc>,
}

/// Raw row totals, mostly for asserting that nothing leaked out of a
/// rolled-back transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RowCounts {
    pub entities: u64,
    pub values: u64,
    pub value_dimensions: u64,
    pub relationships: u64,
    pub timeline: u64,
}

/// Read access shared by the storage handle and an open write transaction.
///
/// Implementors only hand out their connection; every query is provided.
pub trait Storage {
    #[doc(hidden)]
    fn connection(&self) -> &Connection;

    fn get_entity(&self, entity_id: EntityId) -> Result<Option<EntityRecord>, StorageError> {
        queries::get_entity(self.connection(), entity_id)
    }

    /// Live rows carrying this GUID, drafts first.
    fn find_by_guid(&self, app_id: AppId, guid: EntityGuid) -> Result<Vec<EntityRecord>, StorageError> {
        queries::find_by_guid(self.connection(), app_id, guid)
    }

    /// The most recent soft-deleted row for a GUID.
    fn find_deleted_by_guid(
        &self,
        app_id: AppId,
        guid: EntityGuid,
    ) -> Result<Option<EntityRecord>, StorageError> {
        queries::find_deleted_by_guid(self.connection(), app_id, guid)
    }

    fn get_draft_of(&self, published_id: EntityId) -> Result<Option<EntityRecord>, StorageError> {
        queries::get_draft_of(self.connection(), published_id)
    }

    /// Every draft row pointing at this published row. More than one is a
    /// broken invariant.
    fn count_drafts_of(&self, published_id: EntityId) -> Result<u64, StorageError> {
        queries::count_drafts_of(self.connection(), published_id)
    }

    /// Scalar values in creation order, each with its dimensions.
    fn get_values(&self, entity_id: EntityId) -> Result<Vec<ValueRecord>, StorageError> {
        queries::get_values(self.connection(), entity_id)
    }

    /// Outgoing edges grouped by attribute and ordered by sort index.
    fn get_relationships(&self, parent_id: EntityId) -> Result<Vec<RelationshipRecord>, StorageError> {
        queries::get_relationships(self.connection(), parent_id)
    }

    fn get_children(
        &self,
        parent_id: EntityId,
        attribute_id: AttributeId,
    ) -> Result<Vec<Option<EntityId>>, StorageError> {
        queries::get_children(self.connection(), parent_id, attribute_id)
    }

    /// Edges from live parents pointing at this child.
    fn get_parents(&self, child_id: EntityId) -> Result<Vec<RelationshipRecord>, StorageError> {
        queries::get_parents(self.connection(), child_id)
    }

    /// Live entities declared as metadata for the given numeric key.
    fn get_metadata_for(
        &self,
        target_type: i32,
        key_number: i64,
    ) -> Result<Vec<EntityRecord>, StorageError> {
        queries::get_metadata_for(self.connection(), target_type, key_number)
    }

    fn get_content_types(&self, app_id: AppId) -> Result<Vec<ContentType>, StorageError> {
        queries::get_content_types(self.connection(), app_id)
    }

    /// Look up a live content type by static name, falling back to its name.
    fn get_content_type(
        &self,
        app_id: AppId,
        static_name: &str,
    ) -> Result<Option<ContentType>, StorageError> {
        queries::get_content_type(self.connection(), app_id, static_name)
    }

    /// Live content types with this static name in any app.
    fn find_content_types_any_app(&self, static_name: &str) -> Result<Vec<ContentType>, StorageError> {
        queries::find_content_types_any_app(self.connection(), static_name)
    }

    fn get_dimensions(&self, zone_id: ZoneId) -> Result<Vec<Language>, StorageError> {
        queries::get_dimensions(self.connection(), zone_id)
    }

    /// Snapshots for an entity, newest first. Checksums are verified.
    fn get_timeline(&self, entity_id: EntityId) -> Result<Vec<TimelineRecord>, StorageError> {
        queries::get_timeline(self.connection(), entity_id)
    }

    fn get_timeline_entry(
        &self,
        entity_id: EntityId,
        change_id: ChangeId,
    ) -> Result<Option<TimelineRecord>, StorageError> {
        queries::get_timeline_entry(self.connection(), entity_id, change_id)
    }

    /// Rows of any state (live or deleted) carrying this GUID.
    fn count_rows_by_guid(&self, guid: EntityGuid) -> Result<u64, StorageError> {
        queries::count_rows_by_guid(self.connection(), guid)
    }

    fn row_counts(&self) -> Result<RowCounts, StorageError> {
        queries::row_counts(self.connection())
    }
}
