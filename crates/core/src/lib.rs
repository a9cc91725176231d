pub mod attribute;
pub mod content_type;
pub mod entity;
pub mod error;
pub mod ids;
pub mod language;
pub mod merge;
pub mod options;
pub mod value;

pub use attribute::Attribute;
pub use content_type::{AttributeDefinition, ContentType};
pub use entity::{Entity, EntityBuilder, MetadataFor, MetadataKey};
pub use error::CoreError;
pub use ids::*;
pub use language::Language;
pub use merge::create_merged_for_saving;
pub use options::SaveOptions;
pub use value::{AttributeType, EntityRef, TypedValue, Value};
