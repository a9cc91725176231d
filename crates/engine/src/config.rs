//! Engine configuration

use std::time::Duration;

use serde::Deserialize;

use eavstore_core::{AppId, ZoneId};

use crate::error::EngineError;

/// Engine configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Zone whose languages (dimensions) the engine works with
    #[serde(default = "default_zone")]
    pub zone_id: i32,

    /// App whose content types and entities the engine works with
    #[serde(default = "default_app")]
    pub app_id: i32,

    /// Name written to the change log
    #[serde(default = "default_user_name")]
    pub user_name: String,

    /// Busy timeout applied while a large import runs (seconds)
    #[serde(default = "default_import_timeout_secs")]
    pub import_timeout_secs: u64,

    /// Busy timeout restored after an import (milliseconds)
    #[serde(default = "default_busy_timeout_ms")]
    pub default_busy_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            zone_id: default_zone(),
            app_id: default_app(),
            user_name: default_user_name(),
            import_timeout_secs: default_import_timeout_secs(),
            default_busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        serde_json::from_str(json).map_err(|e| EngineError::Config(e.to_string()))
    }

    pub fn zone(&self) -> ZoneId {
        ZoneId::new(self.zone_id)
    }

    pub fn app(&self) -> AppId {
        AppId::new(self.app_id)
    }

    pub fn import_timeout(&self) -> Duration {
        Duration::from_secs(self.import_timeout_secs)
    }

    pub fn default_busy_timeout(&self) -> Duration {
        Duration::from_millis(self.default_busy_timeout_ms)
    }
}

fn default_zone() -> i32 {
    1
}

fn default_app() -> i32 {
    1
}

fn default_user_name() -> String {
    "system".to_string()
}

fn default_import_timeout_secs() -> u64 {
    3600
}

fn default_busy_timeout_ms() -> u64 {
    eavstore_storage::schema::DEFAULT_BUSY_TIMEOUT_MS
}
