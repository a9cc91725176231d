use serde::{Deserialize, Serialize};

use crate::ids::DimensionId;

/// One language/locale variant a value applies to.
///
/// Keys are normalized to lowercase so `de-CH` and `de-ch` name the same
/// dimension. The dimension id is only known once the key has been resolved
/// against the zone's languages; incoming data may carry keys alone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Language {
    pub dimension_id: Option<DimensionId>,
    pub key: String,
    pub read_only: bool,
}

impl Language {
    pub fn new(key: &str) -> Self {
        Self {
            dimension_id: None,
            key: normalize_key(key),
            read_only: false,
        }
    }

    pub fn with_dimension(dimension_id: DimensionId, key: &str) -> Self {
        Self {
            dimension_id: Some(dimension_id),
            key: normalize_key(key),
            read_only: false,
        }
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn matches(&self, key: &str) -> bool {
        self.key.eq_ignore_ascii_case(key.trim())
    }
}

pub fn normalize_key(key: &str) -> String {
    key.trim().to_ascii_lowercase()
}

/// Find the zone language for a key.
pub fn find_language<'a>(languages: &'a [Language], key: &str) -> Option<&'a Language> {
    languages.iter().find(|l| l.matches(key))
}
