use tracing::debug;

use eavstore_core::{AppId, AttributeId, EntityGuid, EntityId, EntityRef};
use eavstore_storage::{Storage, StorageTx};

use crate::error::{EngineError, ReferenceError};

#[derive(Debug, Clone)]
struct PendingEdges {
    parent: EntityId,
    attribute_id: AttributeId,
    attribute: String,
    children: Vec<Option<EntityRef>>,
}

/// Edge-sets waiting for the end of a transaction, when every entity they
/// may point at has been written.
#[derive(Debug, Default)]
pub struct RelationshipQueue {
    pending: Vec<PendingEdges>,
}

impl RelationshipQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer the ordered children of one attribute. A later call for the
    /// same parent and attribute replaces the earlier one.
    pub fn queue(
        &mut self,
        parent: EntityId,
        attribute_id: AttributeId,
        attribute: &str,
        children: Vec<Option<EntityRef>>,
    ) {
        let edges = PendingEdges {
            parent,
            attribute_id,
            attribute: attribute.to_string(),
            children,
        };
        match self
            .pending
            .iter_mut()
            .find(|p| p.parent == parent && p.attribute_id == attribute_id)
        {
            Some(slot) => *slot = edges,
            None => self.pending.push(edges),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Whether any edge-set waits for `parent`.
    pub fn has_edges_for(&self, parent: EntityId) -> bool {
        self.pending.iter().any(|p| p.parent == parent)
    }

    /// Move everything queued for or pointing at `from` over to `to`. Used
    /// when a draft folds into its published row before the flush. Edge-sets
    /// moved from `from` replace those already queued on `to`.
    pub fn retarget(&mut self, from: EntityId, to: EntityId) {
        let moved: Vec<AttributeId> = self
            .pending
            .iter()
            .filter(|p| p.parent == from)
            .map(|p| p.attribute_id)
            .collect();
        self.pending
            .retain(|p| !(p.parent == to && moved.contains(&p.attribute_id)));
        for edges in &mut self.pending {
            if edges.parent == from {
                edges.parent = to;
            }
            for child in edges.children.iter_mut().flatten() {
                if *child == EntityRef::Id(from) {
                    *child = EntityRef::Id(to);
                }
            }
        }
    }

    /// Resolve every reference and write the edge-sets. Consumes the queue.
    pub fn flush(self, tx: &StorageTx<'_>, app_id: AppId) -> Result<usize, EngineError> {
        if self.is_empty() {
            return Ok(0);
        }
        let count = self.len();
        for edges in self.pending {
            let mut resolved = Vec::with_capacity(edges.children.len());
            for child in &edges.children {
                match child {
                    None => resolved.push(None),
                    Some(reference) => {
                        let id = resolve(tx, app_id, reference)?.ok_or_else(|| {
                            ReferenceError::UnresolvedReference {
                                parent: edges.parent,
                                attribute: edges.attribute.clone(),
                                reference: *reference,
                            }
                        })?;
                        resolved.push(Some(id));
                    }
                }
            }
            tx.replace_relationships(edges.parent, edges.attribute_id, &resolved)?;
        }
        debug!(edge_sets = count, "relationship queue flushed");
        Ok(count)
    }
}

/// Map a reference onto a live row. A GUID resolves to its published row
/// when there is one.
pub fn resolve(
    storage: &impl Storage,
    app_id: AppId,
    reference: &EntityRef,
) -> Result<Option<EntityId>, EngineError> {
    match reference {
        EntityRef::Id(id) => Ok(storage
            .get_entity(*id)?
            .filter(|row| row.app_id == app_id && !row.is_deleted())
            .map(|row| row.entity_id)),
        EntityRef::Guid(guid) => resolve_guid(storage, app_id, *guid),
    }
}

fn resolve_guid(
    storage: &impl Storage,
    app_id: AppId,
    guid: EntityGuid,
) -> Result<Option<EntityId>, EngineError> {
    let rows = storage.find_by_guid(app_id, guid)?;
    Ok(rows
        .iter()
        .find(|row| row.is_published)
        .or(rows.first())
        .map(|row| row.entity_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_entry_supersedes_earlier() {
        let mut queue = RelationshipQueue::new();
        let parent = EntityId::new(1);
        let attr = AttributeId::new(10);
        queue.queue(parent, attr, "Friends", vec![Some(EntityRef::Id(EntityId::new(5)))]);
        queue.queue(parent, AttributeId::new(11), "Boss", vec![None]);
        queue.queue(parent, attr, "Friends", vec![]);
        assert_eq!(queue.len(), 2);
        assert!(queue.pending[0].children.is_empty());
    }

    #[test]
    fn retarget_moves_parents_and_children() {
        let draft = EntityId::new(2);
        let published = EntityId::new(1);
        let friends = AttributeId::new(10);
        let mut queue = RelationshipQueue::new();
        queue.queue(published, friends, "Friends", vec![]);
        queue.queue(draft, friends, "Friends", vec![Some(EntityRef::Id(EntityId::new(7)))]);
        queue.queue(EntityId::new(3), friends, "Friends", vec![Some(EntityRef::Id(draft)), None]);

        queue.retarget(draft, published);
        assert_eq!(queue.len(), 2);
        assert!(!queue.has_edges_for(draft));
        assert!(queue.has_edges_for(published));
        assert_eq!(queue.pending[0].children, vec![Some(EntityRef::Id(EntityId::new(7)))]);
        assert_eq!(queue.pending[1].children, vec![Some(EntityRef::Id(published)), None]);
    }
}
