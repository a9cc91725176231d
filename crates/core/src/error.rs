use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("unsupported attribute type: {0}")]
    UnsupportedType(String),

    #[error("invalid {attr_type} value {raw:?}: {reason}")]
    InvalidValue {
        attr_type: String,
        raw: String,
        reason: String,
    },

    #[error("invalid data: {0}")]
    InvalidData(String),
}
