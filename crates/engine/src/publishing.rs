use tracing::debug;

use eavstore_core::{ChangeId, EntityId};
use eavstore_storage::{EntityRecord, Storage, StorageError, StorageTx};

use crate::error::{EngineError, StateConflictError};

/// Branch situation of the row a save or publish targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchState {
    /// Nothing stored yet.
    New,
    Published(EntityId),
    PublishedWithDraft { published: EntityId, draft: EntityId },
    /// An unpublished row with no published counterpart.
    DraftOnly(EntityId),
    /// The targeted row is itself the draft of a published row.
    DraftOfPublished { draft: EntityId, published: EntityId },
}

impl BranchState {
    pub fn detect(storage: &impl Storage, target: Option<&EntityRecord>) -> Result<Self, EngineError> {
        let Some(row) = target else {
            return Ok(Self::New);
        };
        if row.is_published {
            return Ok(match storage.get_draft_of(row.entity_id)? {
                Some(draft) => Self::PublishedWithDraft {
                    published: row.entity_id,
                    draft: draft.entity_id,
                },
                None => Self::Published(row.entity_id),
            });
        }
        Ok(match row.published_entity_id {
            Some(published) => Self::DraftOfPublished {
                draft: row.entity_id,
                published,
            },
            None => Self::DraftOnly(row.entity_id),
        })
    }
}

/// What a save does to the stored rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchPlan {
    Insert { is_published: bool },
    /// Insert a draft row shadowing `published`; the published row is left
    /// alone.
    CreateDraft { published: EntityId },
    UpdateInPlace {
        row: EntityId,
        is_published: bool,
        published_entity_id: Option<EntityId>,
    },
    /// Fold the draft into the published row and drop the draft.
    Promote { draft: EntityId, published: EntityId },
}

pub fn plan_branch(state: BranchState, publish: bool, force_no_branch: bool) -> BranchPlan {
    match state {
        BranchState::New => BranchPlan::Insert { is_published: publish },
        BranchState::Published(id) if publish => BranchPlan::UpdateInPlace {
            row: id,
            is_published: true,
            published_entity_id: None,
        },
        BranchState::Published(id) if force_no_branch => BranchPlan::UpdateInPlace {
            row: id,
            is_published: false,
            published_entity_id: None,
        },
        BranchState::Published(id) => BranchPlan::CreateDraft { published: id },
        BranchState::PublishedWithDraft { published, draft }
        | BranchState::DraftOfPublished { draft, published } => {
            if publish {
                BranchPlan::Promote { draft, published }
            } else {
                BranchPlan::UpdateInPlace {
                    row: draft,
                    is_published: false,
                    published_entity_id: Some(published),
                }
            }
        }
        BranchState::DraftOnly(id) => BranchPlan::UpdateInPlace {
            row: id,
            is_published: publish,
            published_entity_id: None,
        },
    }
}

/// Insert the draft row for `published`. A second draft is refused by the
/// storage layer and reported as a conflict.
pub(crate) fn insert_draft(
    tx: &StorageTx<'_>,
    row: &eavstore_storage::NewEntityRow,
    published: EntityId,
    change: ChangeId,
) -> Result<EntityId, EngineError> {
    match tx.insert_entity(row, change) {
        Ok(id) => Ok(id),
        Err(StorageError::ConstraintViolation(_)) => {
            Err(StateConflictError::DuplicateDraft { published }.into())
        }
        Err(e) => Err(e.into()),
    }
}

/// Copy the draft's data into the published row, point edges at the
/// published row, then remove the draft.
pub(crate) fn promote_draft(
    tx: &StorageTx<'_>,
    draft: EntityId,
    published: EntityId,
    change: ChangeId,
) -> Result<i32, EngineError> {
    let draft_row = tx
        .get_entity(draft)?
        .ok_or_else(|| EngineError::EntityNotFound(format!("draft {draft}")))?;
    let published_row = tx
        .get_entity(published)?
        .ok_or_else(|| EngineError::EntityNotFound(format!("entity {published}")))?;

    tx.clone_entity_data(draft, published, change)?;
    tx.retarget_relationships(draft, published)?;
    tx.hard_delete_entity(draft)?;

    let version = draft_row.version.max(published_row.version) + 1;
    tx.update_entity_header(published, true, None, version, change)?;
    debug!(%draft, %published, version, "draft promoted");
    Ok(version)
}
