use std::collections::BTreeSet;

use tracing::info;

use eavstore_core::EntityId;
use eavstore_core::entity::TARGET_TYPE_ENTITY;
use eavstore_storage::{EntityRecord, Storage, StorageTx, TimelineOperation};

use crate::error::{EngineError, StateConflictError};
use crate::persist::{SaveBatch, TxContext};
use crate::versioning::SnapshotRequest;

/// Whether an entity may be removed without breaking references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteCheck {
    pub can_delete: bool,
    /// Empty when `can_delete` is true.
    pub reason: String,
}

impl DeleteCheck {
    fn allowed() -> Self {
        Self {
            can_delete: true,
            reason: String::new(),
        }
    }
}

fn is_branch_draft(row: &EntityRecord) -> bool {
    !row.is_published && row.published_entity_id.is_some()
}

pub fn check_row(storage: &impl Storage, row: &EntityRecord) -> Result<DeleteCheck, EngineError> {
    if is_branch_draft(row) {
        return Ok(DeleteCheck::allowed());
    }
    let mut reasons = Vec::new();

    let parents: BTreeSet<EntityId> = storage
        .get_parents(row.entity_id)?
        .iter()
        .map(|r| r.parent_id)
        .collect();
    if !parents.is_empty() {
        let ids: Vec<String> = parents.iter().map(EntityId::to_string).collect();
        reasons.push(format!("referenced by entities {}", ids.join(", ")));
    }

    let metadata: Vec<String> = storage
        .get_metadata_for(TARGET_TYPE_ENTITY, row.entity_id.get())?
        .iter()
        .map(|r| r.entity_id.to_string())
        .collect();
    if !metadata.is_empty() {
        reasons.push(format!("described by metadata entities {}", metadata.join(", ")));
    }

    Ok(if reasons.is_empty() {
        DeleteCheck::allowed()
    } else {
        DeleteCheck {
            can_delete: false,
            reason: reasons.join("; "),
        }
    })
}

/// Remove an entity. Branch drafts are removed for good; everything else is
/// soft-deleted together with its draft, after a final snapshot.
pub(crate) fn delete_in_tx(
    tx: &StorageTx<'_>,
    ctx: &TxContext<'_>,
    entity_id: EntityId,
    force: bool,
    batch: &mut SaveBatch,
) -> Result<(), EngineError> {
    let row = tx
        .get_entity(entity_id)?
        .filter(|r| r.app_id == ctx.app_id && !r.is_deleted())
        .ok_or_else(|| EngineError::EntityNotFound(entity_id.to_string()))?;
    let change = tx.next_change_id(ctx.user_name)?;

    if is_branch_draft(&row) {
        tx.hard_delete_entity(entity_id)?;
        info!(entity_id = %entity_id, change_id = %change, "draft deleted");
        return Ok(());
    }

    let check = check_row(tx, &row)?;
    if !check.can_delete {
        if !force {
            return Err(StateConflictError::StillReferenced {
                entity: entity_id,
                reason: check.reason,
            }
            .into());
        }
        tx.delete_relationships_to(entity_id)?;
    }

    if let Some(draft) = tx.get_draft_of(entity_id)? {
        tx.hard_delete_entity(draft.entity_id)?;
    }
    let request = SnapshotRequest {
        entity_id,
        guid: row.guid,
        change,
        operation: TimelineOperation::Delete,
    };
    batch.snapshots.record(tx, ctx, request, true)?;
    tx.soft_delete_entity(entity_id, change)?;
    info!(entity_id = %entity_id, guid = %row.guid, change_id = %change, force, "entity deleted");
    Ok(())
}
