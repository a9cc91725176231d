use serde::{Deserialize, Serialize};

use crate::language::{Language, find_language};

/// Policies for merging and persisting one save.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SaveOptions {
    pub primary_language: String,
    /// Every language of the zone. Keys outside this list are "unknown".
    pub languages: Vec<Language>,
    pub preserve_existing_attributes: bool,
    pub preserve_unknown_attributes: bool,
    pub preserve_unknown_languages: bool,
    pub discard_attributes_missing_in_schema: bool,
    pub force_no_branch: bool,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            primary_language: String::new(),
            languages: Vec::new(),
            preserve_existing_attributes: false,
            preserve_unknown_attributes: true,
            preserve_unknown_languages: false,
            discard_attributes_missing_in_schema: false,
            force_no_branch: false,
        }
    }
}

impl SaveOptions {
    pub fn new(primary_language: &str, languages: Vec<Language>) -> Self {
        Self {
            primary_language: primary_language.to_ascii_lowercase(),
            languages,
            ..Self::default()
        }
    }

    pub fn is_known_language(&self, key: &str) -> bool {
        find_language(&self.languages, key).is_some()
    }

    pub fn language(&self, key: &str) -> Option<&Language> {
        find_language(&self.languages, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::DimensionId;

    #[test]
    fn defaults_preserve_unknown_attributes_only() {
        let opts = SaveOptions::default();
        assert!(opts.preserve_unknown_attributes);
        assert!(!opts.preserve_existing_attributes);
        assert!(!opts.preserve_unknown_languages);
        assert!(!opts.discard_attributes_missing_in_schema);
        assert!(!opts.force_no_branch);
    }

    #[test]
    fn known_languages_ignore_case() {
        let opts = SaveOptions::new(
            "en-US",
            vec![Language::with_dimension(DimensionId::new(1), "en-us")],
        );
        assert_eq!(opts.primary_language, "en-us");
        assert!(opts.is_known_language("EN-us"));
        assert!(!opts.is_known_language("de-de"));
    }
}
