use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::ids::{EntityGuid, EntityId};
use crate::language::Language;

const DATE_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
const DATE_TIME_FRACTION_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttributeType {
    String,
    Number,
    Boolean,
    DateTime,
    Hyperlink,
    Entity,
    Custom,
}

impl AttributeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "String",
            Self::Number => "Number",
            Self::Boolean => "Boolean",
            Self::DateTime => "DateTime",
            Self::Hyperlink => "Hyperlink",
            Self::Entity => "Entity",
            Self::Custom => "Custom",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        const ALL: [AttributeType; 7] = [
            AttributeType::String,
            AttributeType::Number,
            AttributeType::Boolean,
            AttributeType::DateTime,
            AttributeType::Hyperlink,
            AttributeType::Entity,
            AttributeType::Custom,
        ];
        ALL.into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| CoreError::UnsupportedType(s.to_string()))
    }

    pub fn is_entity(&self) -> bool {
        matches!(self, Self::Entity)
    }
}

impl fmt::Display for AttributeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reference from an entity-typed attribute to another entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityRef {
    Id(EntityId),
    Guid(EntityGuid),
}

impl EntityRef {
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let s = s.trim();
        if let Ok(id) = s.parse::<i64>() {
            return Ok(Self::Id(EntityId::new(id)));
        }
        EntityGuid::from_str(s)
            .map(Self::Guid)
            .map_err(|e| CoreError::InvalidValue {
                attr_type: AttributeType::Entity.to_string(),
                raw: s.to_string(),
                reason: e.to_string(),
            })
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{id}"),
            Self::Guid(guid) => write!(f, "{guid}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypedValue {
    String(String),
    Number(Option<Decimal>),
    Boolean(Option<bool>),
    DateTime(Option<NaiveDateTime>),
    Hyperlink(String),
    Custom(String),
    /// Ordered children; `None` is a placeholder slot pointing nowhere.
    EntityRefs(Vec<Option<EntityRef>>),
}

impl TypedValue {
    pub fn attr_type(&self) -> AttributeType {
        match self {
            Self::String(_) => AttributeType::String,
            Self::Number(_) => AttributeType::Number,
            Self::Boolean(_) => AttributeType::Boolean,
            Self::DateTime(_) => AttributeType::DateTime,
            Self::Hyperlink(_) => AttributeType::Hyperlink,
            Self::Custom(_) => AttributeType::Custom,
            Self::EntityRefs(_) => AttributeType::Entity,
        }
    }

    /// Parse the storage-neutral string form of a value.
    pub fn parse(attr_type: AttributeType, raw: &str) -> Result<Self, CoreError> {
        let invalid = |reason: String| CoreError::InvalidValue {
            attr_type: attr_type.to_string(),
            raw: raw.to_string(),
            reason,
        };
        let trimmed = raw.trim();
        match attr_type {
            AttributeType::String => Ok(Self::String(raw.to_string())),
            AttributeType::Hyperlink => Ok(Self::Hyperlink(raw.to_string())),
            AttributeType::Custom => Ok(Self::Custom(raw.to_string())),
            AttributeType::Number => {
                if trimmed.is_empty() {
                    return Ok(Self::Number(None));
                }
                Decimal::from_str(trimmed)
                    .or_else(|_| Decimal::from_scientific(trimmed))
                    .map(|d| Self::Number(Some(d)))
                    .map_err(|e| invalid(e.to_string()))
            }
            AttributeType::Boolean => match trimmed.to_ascii_lowercase().as_str() {
                "" => Ok(Self::Boolean(None)),
                "true" | "1" => Ok(Self::Boolean(Some(true))),
                "false" | "0" => Ok(Self::Boolean(Some(false))),
                _ => Err(invalid("expected true or false".into())),
            },
            AttributeType::DateTime => {
                if trimmed.is_empty() {
                    return Ok(Self::DateTime(None));
                }
                parse_date_time(trimmed)
                    .map(|dt| Self::DateTime(Some(dt)))
                    .ok_or_else(|| invalid("not an ISO-8601 date".into()))
            }
            AttributeType::Entity => {
                if trimmed.is_empty() {
                    return Ok(Self::EntityRefs(Vec::new()));
                }
                let refs = trimmed
                    .split(',')
                    .map(|part| match part.trim() {
                        "" | "null" => Ok(None),
                        other => EntityRef::parse(other).map(Some),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Self::EntityRefs(refs))
            }
        }
    }

    /// The storage-neutral string form. Entity references have none: they
    /// live in the relationship graph only.
    pub fn serialized(&self) -> Option<String> {
        match self {
            Self::String(s) | Self::Hyperlink(s) | Self::Custom(s) => Some(s.clone()),
            Self::Number(n) => Some(n.map(|d| d.normalize().to_string()).unwrap_or_default()),
            Self::Boolean(b) => Some(b.map(|b| b.to_string()).unwrap_or_default()),
            Self::DateTime(dt) => Some(dt.map(format_date_time).unwrap_or_default()),
            Self::EntityRefs(_) => None,
        }
    }
}

fn parse_date_time(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, DATE_TIME_FRACTION_FORMAT)
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.naive_utc()))
        .or_else(|| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f").ok())
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

fn format_date_time(dt: NaiveDateTime) -> String {
    use chrono::Timelike;
    if dt.nanosecond() == 0 {
        dt.format(DATE_TIME_FORMAT).to_string()
    } else {
        dt.format(DATE_TIME_FRACTION_FORMAT).to_string()
    }
}

/// A typed payload and the languages it applies to. No languages means the
/// value is the unconditional default for its attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value {
    pub value: TypedValue,
    pub languages: Vec<Language>,
}

impl Value {
    pub fn new(value: TypedValue, languages: Vec<Language>) -> Self {
        Self { value, languages }
    }

    pub fn build(
        attr_type: AttributeType,
        raw: &str,
        languages: Vec<Language>,
    ) -> Result<Self, CoreError> {
        Ok(Self::new(TypedValue::parse(attr_type, raw)?, languages))
    }

    pub fn text(s: &str) -> Self {
        Self::new(TypedValue::String(s.to_string()), Vec::new())
    }

    pub fn entities(refs: Vec<Option<EntityRef>>) -> Self {
        Self::new(TypedValue::EntityRefs(refs), Vec::new())
    }

    pub fn with_languages(mut self, languages: Vec<Language>) -> Self {
        self.languages = languages;
        self
    }

    pub fn serialized(&self) -> Option<String> {
        self.value.serialized()
    }

    pub fn has_language(&self, key: &str) -> bool {
        self.languages.iter().any(|l| l.matches(key))
    }

    /// Whether this value claims any of the other value's language keys.
    pub fn shares_language_with(&self, other: &Value) -> bool {
        self.languages.iter().any(|l| other.has_language(&l.key))
    }

    pub fn as_text(&self) -> Option<&str> {
        match &self.value {
            TypedValue::String(s) | TypedValue::Hyperlink(s) | TypedValue::Custom(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<Decimal> {
        match &self.value {
            TypedValue::Number(n) => *n,
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match &self.value {
            TypedValue::Boolean(b) => *b,
            _ => None,
        }
    }

    pub fn as_date_time(&self) -> Option<NaiveDateTime> {
        match &self.value {
            TypedValue::DateTime(dt) => *dt,
            _ => None,
        }
    }

    pub fn as_entity_refs(&self) -> Option<&[Option<EntityRef>]> {
        match &self.value {
            TypedValue::EntityRefs(refs) => Some(refs),
            _ => None,
        }
    }
}
