use eavstore_core::{CoreError, EntityId, EntityRef};
use eavstore_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("entity {entity}: language {key:?} on attribute {attribute} is not a language of this zone")]
    UnknownLanguage {
        entity: String,
        attribute: String,
        key: String,
    },

    #[error("entity {entity}: content type {content_type:?} not found")]
    UnknownContentType { entity: String, content_type: String },

    #[error("entity {entity}: stored as {stored}, saved as {incoming}")]
    ContentTypeMismatch {
        entity: String,
        stored: String,
        incoming: String,
    },

    #[error("entity {entity}: no content type given")]
    MissingContentType { entity: String },

    #[error("entity {entity}: attribute {attribute} is not declared on {content_type}")]
    AttributeNotInSchema {
        entity: String,
        attribute: String,
        content_type: String,
    },

    #[error("entity {entity}: attribute {attribute} is {actual}, schema declares {expected}")]
    TypeMismatch {
        entity: String,
        attribute: String,
        expected: String,
        actual: String,
    },

    #[error("entity {entity}: bad value for attribute {attribute}: {source}")]
    MalformedValue {
        entity: String,
        attribute: String,
        #[source]
        source: CoreError,
    },
}

#[derive(Debug, Error)]
pub enum ReferenceError {
    #[error("entity {parent}: attribute {attribute} references {reference}, which does not exist")]
    UnresolvedReference {
        parent: EntityId,
        attribute: String,
        reference: EntityRef,
    },

    #[error("content type {content_type} uses the configuration of {master}, which was not found")]
    MissingMasterContentType { content_type: String, master: String },
}

#[derive(Debug, Error)]
pub enum StateConflictError {
    #[error("entity {published} already has a draft")]
    DuplicateDraft { published: EntityId },

    #[error("entity {entity} cannot be deleted: {reason}")]
    StillReferenced { entity: EntityId, reason: String },

    #[error("entity {entity} is already published and has no draft")]
    AlreadyPublished { entity: EntityId },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("reference error: {0}")]
    Reference(#[from] ReferenceError),

    #[error("state conflict: {0}")]
    StateConflict(#[from] StateConflictError),

    #[error("entity not found: {0}")]
    EntityNotFound(String),

    #[error("version not found: entity {entity}, change {change}")]
    VersionNotFound { entity: EntityId, change: i64 },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),
}
