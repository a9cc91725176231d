use std::time::Duration;

use chrono::Utc;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::debug;

use eavstore_core::{
    AppId, AttributeDefinition, AttributeId, ChangeId, ContentType, ContentTypeId, DimensionId,
    EntityGuid, EntityId, Language, MetadataFor, MetadataKey, ZoneId,
};

use crate::error::StorageError;
use crate::traits::{NewEntityRow, Storage, TimelineOperation};

pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    pub fn open(path: &str) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        crate::schema::init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        crate::schema::init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn set_busy_timeout(&self, timeout: Duration) -> Result<(), StorageError> {
        self.conn.busy_timeout(timeout)?;
        Ok(())
    }

    /// Start the single write transaction. Nothing is visible to other
    /// connections until [`StorageTx::commit`].
    pub fn begin(&mut self) -> Result<StorageTx<'_>, StorageError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        Ok(StorageTx { tx })
    }
}

impl Storage for SqliteStorage {
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// An open write transaction. Dropping it without `commit` rolls back.
pub struct StorageTx<'conn> {
    tx: Transaction<'conn>,
}

impl Storage for StorageTx<'_> {
    fn connection(&self) -> &Connection {
        &self.tx
    }
}

fn constraint_or(err: rusqlite::Error, what: impl FnOnce() -> String) -> StorageError {
    match err {
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation => {
            StorageError::ConstraintViolation(what())
        }
        other => StorageError::Sqlite(other),
    }
}

fn metadata_columns(
    metadata: Option<&MetadataFor>,
) -> (i32, Option<Vec<u8>>, Option<i64>, Option<String>) {
    match metadata {
        None => (eavstore_core::entity::TARGET_TYPE_NONE, None, None, None),
        Some(m) => match &m.key {
            MetadataKey::Guid(g) => (m.target_type, Some(g.as_uuid().as_bytes().to_vec()), None, None),
            MetadataKey::Number(n) => (m.target_type, None, Some(*n), None),
            MetadataKey::String(s) => (m.target_type, None, None, Some(s.clone())),
        },
    }
}

impl StorageTx<'_> {
    /// Open a change-log entry. Every write in the transaction is stamped
    /// with it.
    pub fn next_change_id(&self, user_name: &str) -> Result<ChangeId, StorageError> {
        self.tx.execute(
            "INSERT INTO change_log (user_name, timestamp) VALUES (?1, ?2)",
            rusqlite::params![user_name, Utc::now().to_rfc3339()],
        )?;
        Ok(ChangeId::new(self.tx.last_insert_rowid()))
    }

    pub fn insert_dimension(&self, zone_id: ZoneId, key: &str, name: &str) -> Result<DimensionId, StorageError> {
        self.tx
            .execute(
                "INSERT INTO dimensions (zone_id, key, name) VALUES (?1, ?2, ?3)",
                rusqlite::params![zone_id.get(), eavstore_core::language::normalize_key(key), name],
            )
            .map_err(|e| constraint_or(e, || format!("dimension {key} already exists")))?;
        Ok(DimensionId::new(self.tx.last_insert_rowid()))
    }

    pub fn insert_content_type(
        &self,
        app_id: AppId,
        content_type: &ContentType,
        change: ChangeId,
    ) -> Result<ContentTypeId, StorageError> {
        self.tx.execute(
            "INSERT INTO content_types (app_id, name, static_name, scope, description, uses_configuration_of, always_share_configuration, change_log_created) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                app_id.get(),
                content_type.name,
                content_type.static_name,
                content_type.scope,
                content_type.description,
                content_type.uses_configuration_of,
                content_type.always_share_configuration,
                change.get(),
            ],
        )?;
        let id = ContentTypeId::new(self.tx.last_insert_rowid());
        for def in &content_type.attributes {
            self.insert_attribute(id, def, change)?;
        }
        debug!(content_type = %content_type.static_name, %id, "content type inserted");
        Ok(id)
    }

    pub fn insert_attribute(
        &self,
        content_type_id: ContentTypeId,
        def: &AttributeDefinition,
        change: ChangeId,
    ) -> Result<AttributeId, StorageError> {
        self.tx.execute(
            "INSERT INTO attributes (content_type_id, static_name, attr_type, is_title, sort_order, change_log_created) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                content_type_id.get(),
                def.static_name,
                def.attr_type.as_str(),
                def.is_title,
                def.sort_order,
                change.get(),
            ],
        )?;
        Ok(AttributeId::new(self.tx.last_insert_rowid()))
    }

    pub fn insert_entity(&self, row: &NewEntityRow, change: ChangeId) -> Result<EntityId, StorageError> {
        let (target_type, key_guid, key_number, key_string) = metadata_columns(row.metadata.as_ref());
        self.tx
            .execute(
                "INSERT INTO entities (app_id, guid, content_type_id, is_published, published_entity_id, version, owner, key_target_type, key_guid, key_number, key_string, modified, change_log_created, change_log_modified) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)",
                rusqlite::params![
                    row.app_id.get(),
                    row.guid.as_uuid().as_bytes().as_slice(),
                    row.content_type_id.get(),
                    row.is_published,
                    row.published_entity_id.map(|id| id.get()),
                    row.version,
                    row.owner,
                    target_type,
                    key_guid,
                    key_number,
                    key_string,
                    Utc::now().to_rfc3339(),
                    change.get(),
                ],
            )
            .map_err(|e| {
                constraint_or(e, || match row.published_entity_id {
                    Some(published) => format!("entity {published} already has a draft"),
                    None => format!("entity {} could not be inserted", row.guid),
                })
            })?;
        Ok(EntityId::new(self.tx.last_insert_rowid()))
    }

    /// Rewrite the branch/version header of an existing row.
    pub fn update_entity_header(
        &self,
        entity_id: EntityId,
        is_published: bool,
        published_entity_id: Option<EntityId>,
        version: i32,
        change: ChangeId,
    ) -> Result<(), StorageError> {
        let updated = self
            .tx
            .execute(
                "UPDATE entities SET is_published = ?1, published_entity_id = ?2, version = ?3, modified = ?4, change_log_modified = ?5 WHERE entity_id = ?6",
                rusqlite::params![
                    is_published,
                    published_entity_id.map(|id| id.get()),
                    version,
                    Utc::now().to_rfc3339(),
                    change.get(),
                    entity_id.get(),
                ],
            )
            .map_err(|e| constraint_or(e, || format!("entity {entity_id} header violates a constraint")))?;
        if updated == 0 {
            return Err(StorageError::NotFound(format!("entity {entity_id}")));
        }
        Ok(())
    }

    pub fn set_metadata(&self, entity_id: EntityId, metadata: Option<&MetadataFor>) -> Result<(), StorageError> {
        let (target_type, key_guid, key_number, key_string) = metadata_columns(metadata);
        self.tx.execute(
            "UPDATE entities SET key_target_type = ?1, key_guid = ?2, key_number = ?3, key_string = ?4 WHERE entity_id = ?5",
            rusqlite::params![target_type, key_guid, key_number, key_string, entity_id.get()],
        )?;
        Ok(())
    }

    /// Remove every scalar value of a row; dimensions cascade.
    pub fn clear_values(&self, entity_id: EntityId) -> Result<usize, StorageError> {
        Ok(self.tx.execute(
            "DELETE FROM entity_values WHERE entity_id = ?1",
            rusqlite::params![entity_id.get()],
        )?)
    }

    /// Write one scalar value. Every language must already carry its
    /// dimension id.
    pub fn insert_value(
        &self,
        entity_id: EntityId,
        attribute_id: AttributeId,
        value: &str,
        languages: &[Language],
        change: ChangeId,
    ) -> Result<i64, StorageError> {
        self.tx.execute(
            "INSERT INTO entity_values (entity_id, attribute_id, value, change_log_created) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![entity_id.get(), attribute_id.get(), value, change.get()],
        )?;
        let value_id = self.tx.last_insert_rowid();
        for language in languages {
            let dimension_id = language
                .dimension_id
                .ok_or_else(|| StorageError::NotFound(format!("dimension for language {}", language.key)))?;
            self.tx
                .execute(
                    "INSERT INTO value_dimensions (value_id, dimension_id, read_only) VALUES (?1, ?2, ?3)",
                    rusqlite::params![value_id, dimension_id.get(), language.read_only],
                )
                .map_err(|e| {
                    constraint_or(e, || {
                        format!("language {} assigned twice on value {value_id}", language.key)
                    })
                })?;
        }
        Ok(value_id)
    }

    /// Replace the edge-set of one attribute, keeping the given order.
    pub fn replace_relationships(
        &self,
        parent_id: EntityId,
        attribute_id: AttributeId,
        children: &[Option<EntityId>],
    ) -> Result<(), StorageError> {
        self.tx.execute(
            "DELETE FROM entity_relationships WHERE parent_entity_id = ?1 AND attribute_id = ?2",
            rusqlite::params![parent_id.get(), attribute_id.get()],
        )?;
        let mut stmt = self.tx.prepare_cached(
            "INSERT INTO entity_relationships (parent_entity_id, attribute_id, sort_order, child_entity_id) VALUES (?1, ?2, ?3, ?4)",
        )?;
        for (index, child) in children.iter().enumerate() {
            stmt.execute(rusqlite::params![
                parent_id.get(),
                attribute_id.get(),
                index as i64,
                child.map(|c| c.get()),
            ])?;
        }
        Ok(())
    }

    pub fn delete_relationships_from(&self, parent_id: EntityId) -> Result<usize, StorageError> {
        Ok(self.tx.execute(
            "DELETE FROM entity_relationships WHERE parent_entity_id = ?1",
            rusqlite::params![parent_id.get()],
        )?)
    }

    pub fn delete_relationships_to(&self, child_id: EntityId) -> Result<usize, StorageError> {
        Ok(self.tx.execute(
            "DELETE FROM entity_relationships WHERE child_entity_id = ?1",
            rusqlite::params![child_id.get()],
        )?)
    }

    /// Point every edge aimed at `from` at `to` instead.
    pub fn retarget_relationships(&self, from: EntityId, to: EntityId) -> Result<usize, StorageError> {
        Ok(self.tx.execute(
            "UPDATE entity_relationships SET child_entity_id = ?1 WHERE child_entity_id = ?2",
            rusqlite::params![to.get(), from.get()],
        )?)
    }

    /// Replace `target`'s values, dimensions and outgoing edges with copies
    /// of `source`'s.
    pub fn clone_entity_data(&self, source: EntityId, target: EntityId, change: ChangeId) -> Result<(), StorageError> {
        self.clear_values(target)?;
        self.delete_relationships_from(target)?;

        let mut stmt = self.tx.prepare(
            "SELECT value_id, attribute_id, value FROM entity_values WHERE entity_id = ?1 ORDER BY value_id",
        )?;
        let rows = stmt
            .query_map(rusqlite::params![source.get()], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, String>(2)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        for (old_value_id, attribute_id, value) in rows {
            self.tx.execute(
                "INSERT INTO entity_values (entity_id, attribute_id, value, change_log_created) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![target.get(), attribute_id, value, change.get()],
            )?;
            let new_value_id = self.tx.last_insert_rowid();
            self.tx.execute(
                "INSERT INTO value_dimensions (value_id, dimension_id, read_only) SELECT ?1, dimension_id, read_only FROM value_dimensions WHERE value_id = ?2 ORDER BY rowid",
                rusqlite::params![new_value_id, old_value_id],
            )?;
        }

        self.tx.execute(
            "INSERT INTO entity_relationships (parent_entity_id, attribute_id, sort_order, child_entity_id) SELECT ?1, attribute_id, sort_order, child_entity_id FROM entity_relationships WHERE parent_entity_id = ?2",
            rusqlite::params![target.get(), source.get()],
        )?;
        Ok(())
    }

    /// Mark a row deleted and drop its outgoing edges.
    pub fn soft_delete_entity(&self, entity_id: EntityId, change: ChangeId) -> Result<(), StorageError> {
        self.delete_relationships_from(entity_id)?;
        let updated = self.tx.execute(
            "UPDATE entities SET change_log_deleted = ?1 WHERE entity_id = ?2 AND change_log_deleted IS NULL",
            rusqlite::params![change.get(), entity_id.get()],
        )?;
        if updated == 0 {
            return Err(StorageError::NotFound(format!("live entity {entity_id}")));
        }
        Ok(())
    }

    /// Remove a row with its values, dimensions and every edge touching it.
    pub fn hard_delete_entity(&self, entity_id: EntityId) -> Result<(), StorageError> {
        self.delete_relationships_to(entity_id)?;
        let deleted = self.tx.execute(
            "DELETE FROM entities WHERE entity_id = ?1",
            rusqlite::params![entity_id.get()],
        )?;
        if deleted == 0 {
            return Err(StorageError::NotFound(format!("entity {entity_id}")));
        }
        Ok(())
    }

    pub fn undelete_entity(&self, entity_id: EntityId, change: ChangeId) -> Result<(), StorageError> {
        self.tx.execute(
            "UPDATE entities SET change_log_deleted = NULL, change_log_modified = ?1 WHERE entity_id = ?2",
            rusqlite::params![change.get(), entity_id.get()],
        )?;
        Ok(())
    }

    /// Append a snapshot. The checksum is computed here.
    pub fn insert_timeline(
        &self,
        entity_id: EntityId,
        guid: EntityGuid,
        change: ChangeId,
        operation: TimelineOperation,
        payload: &[u8],
        user_name: &str,
    ) -> Result<i64, StorageError> {
        let checksum = blake3::hash(payload);
        self.tx.execute(
            "INSERT INTO data_timeline (entity_id, entity_guid, change_id, operation, payload, checksum, user_name, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                entity_id.get(),
                guid.as_uuid().as_bytes().as_slice(),
                change.get(),
                operation.as_str(),
                payload,
                checksum.as_bytes().as_slice(),
                user_name,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(self.tx.last_insert_rowid())
    }

    pub fn commit(self) -> Result<(), StorageError> {
        self.tx.commit()?;
        Ok(())
    }

    pub fn rollback(self) -> Result<(), StorageError> {
        self.tx.rollback()?;
        Ok(())
    }
}

pub(crate) mod queries {
    use std::collections::HashMap;

    use chrono::{DateTime, Utc};
    use rusqlite::{Connection, Row};
    use uuid::Uuid;

    use eavstore_core::{
        AppId, AttributeDefinition, AttributeId, AttributeType, ChangeId, ContentType, ContentTypeId,
        DimensionId, EntityGuid, EntityId, Language, MetadataFor, MetadataKey, ZoneId,
        entity::TARGET_TYPE_NONE,
    };

    use crate::error::StorageError;
    use crate::traits::{
        EntityRecord, RelationshipRecord, RowCounts, TimelineOperation, TimelineRecord,
        ValueRecord,
    };

    const ENTITY_SELECT: &str = "SELECT e.entity_id, e.app_id, e.guid, e.content_type_id, ct.static_name, e.is_published, e.published_entity_id, e.version, e.owner, e.key_target_type, e.key_guid, e.key_number, e.key_string, e.modified, e.change_log_created, e.change_log_modified, e.change_log_deleted FROM entities e JOIN content_types ct ON ct.content_type_id = e.content_type_id";

    /// Convert Vec<u8> to fixed-size array with proper error handling.
    fn to_array<const N: usize>(v: Vec<u8>, label: &str) -> Result<[u8; N], StorageError> {
        v.try_into()
            .map_err(|_| StorageError::Serialization(format!("invalid {label} length")))
    }

    fn guid_from(bytes: Vec<u8>, label: &str) -> Result<EntityGuid, StorageError> {
        Ok(EntityGuid::from_uuid(Uuid::from_bytes(to_array::<16>(bytes, label)?)))
    }

    fn timestamp_from(s: &str) -> Result<DateTime<Utc>, StorageError> {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| StorageError::Serialization(format!("bad timestamp {s:?}: {e}")))
    }

    fn read_entity(row: &Row) -> Result<EntityRecord, StorageError> {
        let target_type: i32 = row.get(9)?;
        let key_guid: Option<Vec<u8>> = row.get(10)?;
        let key_number: Option<i64> = row.get(11)?;
        let key_string: Option<String> = row.get(12)?;
        let key = match (key_guid, key_number, key_string) {
            (Some(g), _, _) => Some(MetadataKey::Guid(guid_from(g, "key_guid")?)),
            (None, Some(n), _) => Some(MetadataKey::Number(n)),
            (None, None, Some(s)) => Some(MetadataKey::String(s)),
            (None, None, None) => None,
        };
        let metadata = match key {
            Some(key) => Some(MetadataFor { target_type, key }),
            None if target_type == TARGET_TYPE_NONE => None,
            None => {
                return Err(StorageError::Serialization(format!(
                    "metadata target {target_type} without key"
                )));
            }
        };
        let modified: String = row.get(13)?;

        Ok(EntityRecord {
            entity_id: EntityId::new(row.get(0)?),
            app_id: AppId::new(row.get(1)?),
            guid: guid_from(row.get(2)?, "guid")?,
            content_type_id: ContentTypeId::new(row.get(3)?),
            content_type: row.get(4)?,
            is_published: row.get(5)?,
            published_entity_id: row.get::<_, Option<i64>>(6)?.map(EntityId::new),
            version: row.get(7)?,
            owner: row.get(8)?,
            metadata,
            modified: timestamp_from(&modified)?,
            created_change: ChangeId::new(row.get(14)?),
            modified_change: ChangeId::new(row.get(15)?),
            deleted_change: row.get::<_, Option<i64>>(16)?.map(ChangeId::new),
        })
    }

    fn query_entities(
        conn: &Connection,
        filter: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<EntityRecord>, StorageError> {
        let mut stmt = conn.prepare(&format!("{ENTITY_SELECT} {filter}"))?;
        let mut rows = stmt.query(params)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(read_entity(row)?);
        }
        Ok(out)
    }

    pub fn get_entity(conn: &Connection, entity_id: EntityId) -> Result<Option<EntityRecord>, StorageError> {
        Ok(query_entities(conn, "WHERE e.entity_id = ?1", rusqlite::params![entity_id.get()])?
            .into_iter()
            .next())
    }

    pub fn find_by_guid(conn: &Connection, app_id: AppId, guid: EntityGuid) -> Result<Vec<EntityRecord>, StorageError> {
        query_entities(
            conn,
            "WHERE e.app_id = ?1 AND e.guid = ?2 AND e.change_log_deleted IS NULL ORDER BY e.is_published ASC, e.entity_id DESC",
            rusqlite::params![app_id.get(), guid.as_uuid().as_bytes().as_slice()],
        )
    }

    pub fn find_deleted_by_guid(
        conn: &Connection,
        app_id: AppId,
        guid: EntityGuid,
    ) -> Result<Option<EntityRecord>, StorageError> {
        Ok(query_entities(
            conn,
            "WHERE e.app_id = ?1 AND e.guid = ?2 AND e.change_log_deleted IS NOT NULL AND e.is_published = 1 ORDER BY e.change_log_deleted DESC LIMIT 1",
            rusqlite::params![app_id.get(), guid.as_uuid().as_bytes().as_slice()],
        )?
        .into_iter()
        .next())
    }

    pub fn get_draft_of(conn: &Connection, published_id: EntityId) -> Result<Option<EntityRecord>, StorageError> {
        Ok(query_entities(
            conn,
            "WHERE e.published_entity_id = ?1 AND e.change_log_deleted IS NULL",
            rusqlite::params![published_id.get()],
        )?
        .into_iter()
        .next())
    }

    pub fn count_drafts_of(conn: &Connection, published_id: EntityId) -> Result<u64, StorageError> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM entities WHERE published_entity_id = ?1 AND change_log_deleted IS NULL",
            rusqlite::params![published_id.get()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn get_values(conn: &Connection, entity_id: EntityId) -> Result<Vec<ValueRecord>, StorageError> {
        let mut dims: HashMap<i64, Vec<Language>> = HashMap::new();
        {
            let mut stmt = conn.prepare(
                "SELECT vd.value_id, d.dimension_id, d.key, vd.read_only FROM value_dimensions vd JOIN dimensions d ON d.dimension_id = vd.dimension_id JOIN entity_values v ON v.value_id = vd.value_id WHERE v.entity_id = ?1 ORDER BY vd.value_id, vd.rowid",
            )?;
            let rows = stmt.query_map(rusqlite::params![entity_id.get()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, bool>(3)?,
                ))
            })?;
            for row in rows {
                let (value_id, dimension_id, key, read_only) = row?;
                dims.entry(value_id).or_default().push(
                    Language::with_dimension(DimensionId::new(dimension_id), &key).read_only(read_only),
                );
            }
        }

        let mut stmt = conn.prepare(
            "SELECT v.value_id, v.attribute_id, a.static_name, a.attr_type, v.value FROM entity_values v JOIN attributes a ON a.attribute_id = v.attribute_id WHERE v.entity_id = ?1 ORDER BY v.value_id",
        )?;
        let mut rows = stmt.query(rusqlite::params![entity_id.get()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let value_id: i64 = row.get(0)?;
            let attr_type: String = row.get(3)?;
            out.push(ValueRecord {
                value_id,
                attribute_id: AttributeId::new(row.get(1)?),
                attribute: row.get(2)?,
                attr_type: AttributeType::parse(&attr_type)?,
                value: row.get(4)?,
                languages: dims.remove(&value_id).unwrap_or_default(),
            });
        }
        Ok(out)
    }

    fn query_relationships(
        conn: &Connection,
        filter: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<RelationshipRecord>, StorageError> {
        let mut stmt = conn.prepare(&format!(
            "SELECT r.parent_entity_id, r.attribute_id, a.static_name, r.sort_order, r.child_entity_id FROM entity_relationships r JOIN attributes a ON a.attribute_id = r.attribute_id JOIN entities p ON p.entity_id = r.parent_entity_id {filter}"
        ))?;
        let rows = stmt.query_map(params, |row| {
            Ok(RelationshipRecord {
                parent_id: EntityId::new(row.get(0)?),
                attribute_id: AttributeId::new(row.get(1)?),
                attribute: row.get(2)?,
                sort_order: row.get(3)?,
                child_id: row.get::<_, Option<i64>>(4)?.map(EntityId::new),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn get_relationships(conn: &Connection, parent_id: EntityId) -> Result<Vec<RelationshipRecord>, StorageError> {
        query_relationships(
            conn,
            "WHERE r.parent_entity_id = ?1 ORDER BY a.sort_order, r.attribute_id, r.sort_order",
            rusqlite::params![parent_id.get()],
        )
    }

    pub fn get_children(
        conn: &Connection,
        parent_id: EntityId,
        attribute_id: AttributeId,
    ) -> Result<Vec<Option<EntityId>>, StorageError> {
        let mut stmt = conn.prepare(
            "SELECT child_entity_id FROM entity_relationships WHERE parent_entity_id = ?1 AND attribute_id = ?2 ORDER BY sort_order",
        )?;
        let rows = stmt.query_map(rusqlite::params![parent_id.get(), attribute_id.get()], |row| {
            row.get::<_, Option<i64>>(0)
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.map(EntityId::new));
        }
        Ok(out)
    }

    pub fn get_parents(conn: &Connection, child_id: EntityId) -> Result<Vec<RelationshipRecord>, StorageError> {
        query_relationships(
            conn,
            "WHERE r.child_entity_id = ?1 AND p.change_log_deleted IS NULL ORDER BY r.parent_entity_id, r.attribute_id, r.sort_order",
            rusqlite::params![child_id.get()],
        )
    }

    pub fn get_metadata_for(
        conn: &Connection,
        target_type: i32,
        key_number: i64,
    ) -> Result<Vec<EntityRecord>, StorageError> {
        query_entities(
            conn,
            "WHERE e.key_target_type = ?1 AND e.key_number = ?2 AND e.change_log_deleted IS NULL ORDER BY e.entity_id",
            rusqlite::params![target_type, key_number],
        )
    }

    fn load_attributes(conn: &Connection, content_type_id: i64) -> Result<Vec<AttributeDefinition>, StorageError> {
        let mut stmt = conn.prepare(
            "SELECT attribute_id, static_name, attr_type, is_title, sort_order FROM attributes WHERE content_type_id = ?1 AND change_log_deleted IS NULL ORDER BY sort_order, attribute_id",
        )?;
        let mut rows = stmt.query(rusqlite::params![content_type_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let attr_type: String = row.get(2)?;
            out.push(AttributeDefinition {
                id: Some(AttributeId::new(row.get(0)?)),
                static_name: row.get(1)?,
                attr_type: AttributeType::parse(&attr_type)?,
                is_title: row.get(3)?,
                sort_order: row.get(4)?,
            });
        }
        Ok(out)
    }

    fn query_content_types(
        conn: &Connection,
        filter: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<ContentType>, StorageError> {
        let mut stmt = conn.prepare(&format!(
            "SELECT content_type_id, name, static_name, scope, description, uses_configuration_of, always_share_configuration FROM content_types WHERE change_log_deleted IS NULL {filter} ORDER BY content_type_id"
        ))?;
        let rows = stmt
            .query_map(params, |row| {
                Ok(ContentType {
                    id: Some(ContentTypeId::new(row.get(0)?)),
                    name: row.get(1)?,
                    static_name: row.get(2)?,
                    scope: row.get(3)?,
                    description: row.get(4)?,
                    attributes: Vec::new(),
                    uses_configuration_of: row.get(5)?,
                    always_share_configuration: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut out = Vec::with_capacity(rows.len());
        for mut ct in rows {
            if let Some(id) = ct.id {
                ct.attributes = load_attributes(conn, id.get())?;
            }
            out.push(ct);
        }
        Ok(out)
    }

    pub fn get_content_types(conn: &Connection, app_id: AppId) -> Result<Vec<ContentType>, StorageError> {
        query_content_types(conn, "AND app_id = ?1", rusqlite::params![app_id.get()])
    }

    pub fn get_content_type(
        conn: &Connection,
        app_id: AppId,
        static_name: &str,
    ) -> Result<Option<ContentType>, StorageError> {
        let all = get_content_types(conn, app_id)?;
        let by_static = all
            .iter()
            .position(|ct| ct.static_name.eq_ignore_ascii_case(static_name))
            .or_else(|| all.iter().position(|ct| ct.matches(static_name)));
        Ok(by_static.and_then(|i| all.into_iter().nth(i)))
    }

    pub fn find_content_types_any_app(conn: &Connection, static_name: &str) -> Result<Vec<ContentType>, StorageError> {
        query_content_types(
            conn,
            "AND static_name = ?1 COLLATE NOCASE",
            rusqlite::params![static_name],
        )
    }

    pub fn get_dimensions(conn: &Connection, zone_id: ZoneId) -> Result<Vec<Language>, StorageError> {
        let mut stmt = conn.prepare(
            "SELECT dimension_id, key FROM dimensions WHERE zone_id = ?1 AND active = 1 ORDER BY dimension_id",
        )?;
        let rows = stmt.query_map(rusqlite::params![zone_id.get()], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, key) = row?;
            out.push(Language::with_dimension(DimensionId::new(id), &key));
        }
        Ok(out)
    }

    fn query_timeline(
        conn: &Connection,
        filter: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<TimelineRecord>, StorageError> {
        let mut stmt = conn.prepare(&format!(
            "SELECT timeline_id, entity_id, entity_guid, change_id, operation, payload, checksum, user_name, created_at FROM data_timeline {filter}"
        ))?;
        let mut rows = stmt.query(params)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let timeline_id: i64 = row.get(0)?;
            let payload: Vec<u8> = row.get(5)?;
            let checksum = to_array::<32>(row.get(6)?, "checksum")?;
            if blake3::hash(&payload).as_bytes() != &checksum {
                return Err(StorageError::ChecksumMismatch { timeline_id });
            }
            let operation: String = row.get(4)?;
            let created_at: String = row.get(8)?;
            out.push(TimelineRecord {
                timeline_id,
                entity_id: EntityId::new(row.get(1)?),
                entity_guid: guid_from(row.get(2)?, "entity_guid")?,
                change_id: ChangeId::new(row.get(3)?),
                operation: TimelineOperation::parse(&operation)?,
                payload,
                user_name: row.get(7)?,
                created_at: timestamp_from(&created_at)?,
            });
        }
        Ok(out)
    }

    pub fn get_timeline(conn: &Connection, entity_id: EntityId) -> Result<Vec<TimelineRecord>, StorageError> {
        query_timeline(
            conn,
            "WHERE entity_id = ?1 ORDER BY timeline_id DESC",
            rusqlite::params![entity_id.get()],
        )
    }

    pub fn get_timeline_entry(
        conn: &Connection,
        entity_id: EntityId,
        change_id: ChangeId,
    ) -> Result<Option<TimelineRecord>, StorageError> {
        Ok(query_timeline(
            conn,
            "WHERE entity_id = ?1 AND change_id = ?2 ORDER BY timeline_id DESC LIMIT 1",
            rusqlite::params![entity_id.get(), change_id.get()],
        )?
        .into_iter()
        .next())
    }

    pub fn count_rows_by_guid(conn: &Connection, guid: EntityGuid) -> Result<u64, StorageError> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM entities WHERE guid = ?1",
            rusqlite::params![guid.as_uuid().as_bytes().as_slice()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn row_counts(conn: &Connection) -> Result<RowCounts, StorageError> {
        let count = |table: &str| -> Result<u64, StorageError> {
            let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
            Ok(n as u64)
        };
        Ok(RowCounts {
            entities: count("entities")?,
            values: count("entity_values")?,
            value_dimensions: count("value_dimensions")?,
            relationships: count("entity_relationships")?,
            timeline: count("data_timeline")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use eavstore_core::{AttributeType, entity::TARGET_TYPE_ENTITY};

    use super::*;

    const APP: AppId = AppId::new(1);
    const ZONE: ZoneId = ZoneId::new(1);

    struct Fixture {
        storage: SqliteStorage,
        person: ContentType,
        en: Language,
        de: Language,
    }

    fn fixture() -> Fixture {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        let tx = storage.begin().unwrap();
        let change = tx.next_change_id("setup").unwrap();
        let en = tx.insert_dimension(ZONE, "en-US", "English").unwrap();
        let de = tx.insert_dimension(ZONE, "de-DE", "Deutsch").unwrap();
        let ct = ContentType::new("Person", "Person", "App")
            .with_attribute(AttributeDefinition::new("Name", AttributeType::String).title())
            .with_attribute(AttributeDefinition::new("Friends", AttributeType::Entity));
        tx.insert_content_type(APP, &ct, change).unwrap();
        tx.commit().unwrap();
        let person = storage.get_content_type(APP, "person").unwrap().unwrap();
        Fixture {
            storage,
            person,
            en: Language::with_dimension(en, "en-us"),
            de: Language::with_dimension(de, "de-de"),
        }
    }

    fn row(ct: &ContentType, guid: EntityGuid) -> NewEntityRow {
        NewEntityRow {
            app_id: APP,
            guid,
            content_type_id: ct.id.unwrap(),
            is_published: true,
            published_entity_id: None,
            version: 1,
            owner: "tester".into(),
            metadata: None,
        }
    }

    fn attr_id(ct: &ContentType, name: &str) -> AttributeId {
        ct.attribute(name).and_then(|a| a.id).unwrap()
    }

    #[test]
    fn content_type_roundtrip_keeps_attribute_order() {
        let f = fixture();
        assert_eq!(f.person.static_name, "Person");
        let names: Vec<_> = f.person.attributes.iter().map(|a| a.static_name.as_str()).collect();
        assert_eq!(names, vec!["Name", "Friends"]);
        assert!(f.person.attributes[0].is_title);
        assert_eq!(f.storage.get_dimensions(ZONE).unwrap().len(), 2);
    }

    #[test]
    fn values_keep_their_dimensions() {
        let mut f = fixture();
        let tx = f.storage.begin().unwrap();
        let change = tx.next_change_id("tester").unwrap();
        let id = tx.insert_entity(&row(&f.person, EntityGuid::new()), change).unwrap();
        let name = attr_id(&f.person, "Name");
        tx.insert_value(id, name, "Hello", &[f.en.clone()], change).unwrap();
        tx.insert_value(id, name, "Hallo", &[f.de.clone().read_only(true)], change).unwrap();
        tx.commit().unwrap();

        let values = f.storage.get_values(id).unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values[0].value, "Hello");
        assert_eq!(values[0].languages[0].key, "en-us");
        assert!(values[1].languages[0].read_only);
        assert_eq!(values[1].attribute, "Name");
    }

    #[test]
    fn relationships_keep_explicit_order() {
        let mut f = fixture();
        let tx = f.storage.begin().unwrap();
        let change = tx.next_change_id("tester").unwrap();
        let ids: Vec<EntityId> = (0..4)
            .map(|_| tx.insert_entity(&row(&f.person, EntityGuid::new()), change).unwrap())
            .collect();
        let friends = attr_id(&f.person, "Friends");
        tx.replace_relationships(ids[0], friends, &[Some(ids[3]), None, Some(ids[1])])
            .unwrap();
        tx.replace_relationships(ids[0], friends, &[Some(ids[3]), Some(ids[2]), Some(ids[1])])
            .unwrap();
        tx.commit().unwrap();

        assert_eq!(
            f.storage.get_children(ids[0], friends).unwrap(),
            vec![Some(ids[3]), Some(ids[2]), Some(ids[1])]
        );
        assert_eq!(f.storage.get_parents(ids[2]).unwrap().len(), 1);
    }

    #[test]
    fn second_draft_violates_constraint() {
        let mut f = fixture();
        let tx = f.storage.begin().unwrap();
        let change = tx.next_change_id("tester").unwrap();
        let guid = EntityGuid::new();
        let published = tx.insert_entity(&row(&f.person, guid), change).unwrap();
        let mut draft = row(&f.person, guid);
        draft.is_published = false;
        draft.published_entity_id = Some(published);
        tx.insert_entity(&draft, change).unwrap();
        let err = tx.insert_entity(&draft, change).unwrap_err();
        assert!(matches!(err, StorageError::ConstraintViolation(_)));
    }

    #[test]
    fn dropped_transaction_rolls_back() {
        let mut f = fixture();
        let guid = EntityGuid::new();
        {
            let tx = f.storage.begin().unwrap();
            let change = tx.next_change_id("tester").unwrap();
            tx.insert_entity(&row(&f.person, guid), change).unwrap();
        }
        assert_eq!(f.storage.count_rows_by_guid(guid).unwrap(), 0);
    }

    #[test]
    fn clone_copies_values_dimensions_and_edges() {
        let mut f = fixture();
        let tx = f.storage.begin().unwrap();
        let change = tx.next_change_id("tester").unwrap();
        let a = tx.insert_entity(&row(&f.person, EntityGuid::new()), change).unwrap();
        let b = tx.insert_entity(&row(&f.person, EntityGuid::new()), change).unwrap();
        let c = tx.insert_entity(&row(&f.person, EntityGuid::new()), change).unwrap();
        let name = attr_id(&f.person, "Name");
        let friends = attr_id(&f.person, "Friends");
        tx.insert_value(a, name, "Hallo", &[f.de.clone()], change).unwrap();
        tx.replace_relationships(a, friends, &[Some(c)]).unwrap();
        tx.insert_value(b, name, "stale", &[], change).unwrap();
        tx.clone_entity_data(a, b, change).unwrap();
        tx.commit().unwrap();

        let values = f.storage.get_values(b).unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].value, "Hallo");
        assert_eq!(values[0].languages[0].key, "de-de");
        assert_eq!(f.storage.get_children(b, friends).unwrap(), vec![Some(c)]);
    }

    #[test]
    fn soft_and_hard_delete() {
        let mut f = fixture();
        let tx = f.storage.begin().unwrap();
        let change = tx.next_change_id("tester").unwrap();
        let guid = EntityGuid::new();
        let a = tx.insert_entity(&row(&f.person, guid), change).unwrap();
        let b = tx.insert_entity(&row(&f.person, EntityGuid::new()), change).unwrap();
        let friends = attr_id(&f.person, "Friends");
        tx.replace_relationships(b, friends, &[Some(a)]).unwrap();
        tx.soft_delete_entity(a, change).unwrap();
        assert!(tx.find_by_guid(APP, guid).unwrap().is_empty());
        assert!(tx.find_deleted_by_guid(APP, guid).unwrap().is_some());
        tx.hard_delete_entity(a).unwrap();
        assert!(tx.get_children(b, friends).unwrap().is_empty());
        tx.commit().unwrap();
        assert!(f.storage.get_entity(a).unwrap().is_none());
    }

    #[test]
    fn metadata_lookup_by_target() {
        let mut f = fixture();
        let tx = f.storage.begin().unwrap();
        let change = tx.next_change_id("tester").unwrap();
        let target = tx.insert_entity(&row(&f.person, EntityGuid::new()), change).unwrap();
        let mut meta = row(&f.person, EntityGuid::new());
        meta.metadata = Some(MetadataFor::entity(target));
        let meta_id = tx.insert_entity(&meta, change).unwrap();
        tx.commit().unwrap();

        let found = f.storage.get_metadata_for(TARGET_TYPE_ENTITY, target.get()).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].entity_id, meta_id);
        assert_eq!(found[0].metadata, Some(MetadataFor::entity(target)));
    }

    #[test]
    fn timeline_checksums_are_verified() {
        let mut f = fixture();
        let tx = f.storage.begin().unwrap();
        let change = tx.next_change_id("tester").unwrap();
        let guid = EntityGuid::new();
        let id = tx.insert_entity(&row(&f.person, guid), change).unwrap();
        tx.insert_timeline(id, guid, change, TimelineOperation::Save, b"snapshot", "tester")
            .unwrap();
        tx.commit().unwrap();

        let entry = f.storage.get_timeline_entry(id, change).unwrap().unwrap();
        assert_eq!(entry.payload, b"snapshot");
        assert_eq!(entry.operation, TimelineOperation::Save);

        f.storage
            .conn
            .execute("UPDATE data_timeline SET payload = x'00'", [])
            .unwrap();
        assert!(matches!(
            f.storage.get_timeline(id),
            Err(StorageError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn reopen_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("eav.db");
        let path = path.to_str().unwrap();
        let guid = EntityGuid::new();
        {
            let mut storage = SqliteStorage::open(path).unwrap();
            let tx = storage.begin().unwrap();
            let change = tx.next_change_id("tester").unwrap();
            let ct = ContentType::new("Note", "Note", "App");
            let ct_id = tx.insert_content_type(APP, &ct, change).unwrap();
            let mut new_row = row(&ContentType { id: Some(ct_id), ..ct }, guid);
            new_row.owner = "someone".into();
            tx.insert_entity(&new_row, change).unwrap();
            tx.commit().unwrap();
        }
        let storage = SqliteStorage::open(path).unwrap();
        let rows = storage.find_by_guid(APP, guid).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].owner, "someone");
        assert_eq!(rows[0].content_type, "Note");
    }
}
