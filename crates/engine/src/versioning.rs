use chrono::{DateTime, Utc};
use tracing::debug;

use eavstore_core::{ChangeId, Entity, EntityGuid, EntityId};
use eavstore_storage::{Storage, StorageTx, TimelineOperation, TimelineRecord};

use crate::error::EngineError;
use crate::loader::load_entity;
use crate::persist::TxContext;

/// A request to snapshot one row under one change.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotRequest {
    pub entity_id: EntityId,
    pub guid: EntityGuid,
    pub change: ChangeId,
    pub operation: TimelineOperation,
}

/// Snapshot requests of one transaction. Deferred ones are written by
/// [`flush`](Self::flush), after relationships so they include final edges.
#[derive(Debug, Default)]
pub struct SnapshotQueue {
    pending: Vec<SnapshotRequest>,
    written: usize,
}

impl SnapshotQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &mut self,
        tx: &StorageTx<'_>,
        ctx: &TxContext<'_>,
        snapshot: SnapshotRequest,
        serialize_now: bool,
    ) -> Result<(), EngineError> {
        if serialize_now {
            write_snapshot(tx, ctx, snapshot)?;
            self.written += 1;
        } else {
            self.pending.push(snapshot);
        }
        Ok(())
    }

    /// Drop deferred snapshots of a row that no longer exists.
    pub fn discard(&mut self, entity_id: EntityId) {
        self.pending.retain(|s| s.entity_id != entity_id);
    }

    /// Write every deferred snapshot. Returns the total written by this queue.
    pub fn flush(self, tx: &StorageTx<'_>, ctx: &TxContext<'_>) -> Result<usize, EngineError> {
        let mut written = self.written;
        for snapshot in self.pending {
            write_snapshot(tx, ctx, snapshot)?;
            written += 1;
        }
        Ok(written)
    }
}

fn write_snapshot(
    tx: &StorageTx<'_>,
    ctx: &TxContext<'_>,
    snapshot: SnapshotRequest,
) -> Result<(), EngineError> {
    let row = tx
        .get_entity(snapshot.entity_id)?
        .ok_or_else(|| EngineError::EntityNotFound(snapshot.entity_id.to_string()))?;
    let entity = load_entity(tx, ctx.types, &row)?;
    let payload = encode(&entity)?;
    tx.insert_timeline(
        snapshot.entity_id,
        snapshot.guid,
        snapshot.change,
        snapshot.operation,
        &payload,
        ctx.user_name,
    )?;
    debug!(
        entity_id = %snapshot.entity_id,
        change_id = %snapshot.change,
        bytes = payload.len(),
        "snapshot written"
    );
    Ok(())
}

pub fn encode(entity: &Entity) -> Result<Vec<u8>, EngineError> {
    rmp_serde::to_vec_named(entity).map_err(|e| EngineError::Serialization(e.to_string()))
}

pub fn decode(payload: &[u8]) -> Result<Entity, EngineError> {
    rmp_serde::from_slice(payload).map_err(|e| EngineError::Serialization(e.to_string()))
}

/// One entry of an entity's history.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionInfo {
    /// 1 for the oldest snapshot.
    pub number: usize,
    pub change_id: ChangeId,
    pub operation: TimelineOperation,
    pub user_name: String,
    pub created_at: DateTime<Utc>,
}

/// History newest first, numbered from the oldest.
pub fn history(storage: &impl Storage, entity_id: EntityId) -> Result<Vec<VersionInfo>, EngineError> {
    let timeline: Vec<TimelineRecord> = storage.get_timeline(entity_id)?;
    let total = timeline.len();
    Ok(timeline
        .into_iter()
        .enumerate()
        .map(|(i, record)| VersionInfo {
            number: total - i,
            change_id: record.change_id,
            operation: record.operation,
            user_name: record.user_name,
            created_at: record.created_at,
        })
        .collect())
}

pub fn get_version(
    storage: &impl Storage,
    entity_id: EntityId,
    change_id: ChangeId,
) -> Result<Entity, EngineError> {
    let record = storage
        .get_timeline_entry(entity_id, change_id)?
        .ok_or(EngineError::VersionNotFound {
            entity: entity_id,
            change: change_id.get(),
        })?;
    decode(&record.payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use eavstore_core::{Attribute, AttributeType, Language, TypedValue, Value};
    use rust_decimal::Decimal;

    #[test]
    fn snapshot_encoding_keeps_typed_values() {
        let entity = Entity::builder(EntityGuid::new())
            .id(EntityId::new(4))
            .content_type("Product")
            .title_field("Title")
            .text("Title", "Chair")
            .attribute(
                Attribute::new("Price", AttributeType::Number).push(
                    Value::new(TypedValue::Number(Some(Decimal::new(1999, 2))), vec![Language::new("en-us")]),
                ),
            )
            .build();
        let decoded = decode(&encode(&entity).unwrap()).unwrap();
        assert_eq!(decoded, entity);
    }

    #[test]
    fn discard_drops_only_that_row() {
        let request = |id: i64| SnapshotRequest {
            entity_id: EntityId::new(id),
            guid: EntityGuid::new(),
            change: ChangeId::new(1),
            operation: TimelineOperation::Save,
        };
        let mut queue = SnapshotQueue::new();
        queue.pending.extend([request(1), request(2), request(2)]);
        queue.discard(EntityId::new(2));
        assert_eq!(queue.pending.len(), 1);
        assert_eq!(queue.pending[0].entity_id, EntityId::new(1));
    }

    #[test]
    fn garbage_payload_is_a_serialization_error() {
        assert!(matches!(decode(&[0xc1]), Err(EngineError::Serialization(_))));
    }
}
