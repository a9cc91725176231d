use rusqlite::Connection;

use crate::error::StorageError;

pub const SCHEMA_VERSION: i32 = 1;

pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;

pub fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA cache_size = -32000;
        PRAGMA mmap_size = 268435456;
        PRAGMA busy_timeout = 5000;
    ",
    )?;
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at INTEGER NOT NULL
);
INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, unixepoch());

CREATE TABLE IF NOT EXISTS change_log (
    change_id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_name TEXT NOT NULL,
    timestamp TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS dimensions (
    dimension_id INTEGER PRIMARY KEY,
    zone_id INTEGER NOT NULL,
    key TEXT NOT NULL,
    name TEXT NOT NULL DEFAULT '',
    active INTEGER NOT NULL DEFAULT 1
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_dimensions_key ON dimensions (zone_id, key);

CREATE TABLE IF NOT EXISTS content_types (
    content_type_id INTEGER PRIMARY KEY,
    app_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    static_name TEXT NOT NULL,
    scope TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    uses_configuration_of TEXT,
    always_share_configuration INTEGER NOT NULL DEFAULT 0,
    change_log_created INTEGER NOT NULL REFERENCES change_log (change_id),
    change_log_deleted INTEGER REFERENCES change_log (change_id)
);
CREATE INDEX IF NOT EXISTS idx_content_types_static ON content_types (app_id, static_name)
    WHERE change_log_deleted IS NULL;

CREATE TABLE IF NOT EXISTS attributes (
    attribute_id INTEGER PRIMARY KEY,
    content_type_id INTEGER NOT NULL REFERENCES content_types (content_type_id),
    static_name TEXT NOT NULL,
    attr_type TEXT NOT NULL,
    is_title INTEGER NOT NULL DEFAULT 0,
    sort_order INTEGER NOT NULL,
    change_log_created INTEGER NOT NULL REFERENCES change_log (change_id),
    change_log_deleted INTEGER REFERENCES change_log (change_id)
);
CREATE INDEX IF NOT EXISTS idx_attributes_type ON attributes (content_type_id, sort_order);

CREATE TABLE IF NOT EXISTS entities (
    entity_id INTEGER PRIMARY KEY,
    app_id INTEGER NOT NULL,
    guid BLOB NOT NULL CHECK (length(guid) = 16),
    content_type_id INTEGER NOT NULL REFERENCES content_types (content_type_id),
    is_published INTEGER NOT NULL,
    published_entity_id INTEGER REFERENCES entities (entity_id),
    version INTEGER NOT NULL DEFAULT 1,
    owner TEXT NOT NULL DEFAULT '',
    key_target_type INTEGER NOT NULL DEFAULT 1,
    key_guid BLOB CHECK (key_guid IS NULL OR length(key_guid) = 16),
    key_number INTEGER,
    key_string TEXT,
    modified TEXT NOT NULL,
    change_log_created INTEGER NOT NULL REFERENCES change_log (change_id),
    change_log_modified INTEGER NOT NULL REFERENCES change_log (change_id),
    change_log_deleted INTEGER REFERENCES change_log (change_id),
    CHECK (published_entity_id IS NULL OR is_published = 0)
);
CREATE INDEX IF NOT EXISTS idx_entities_guid ON entities (app_id, guid);
CREATE INDEX IF NOT EXISTS idx_entities_metadata ON entities (key_target_type, key_number)
    WHERE change_log_deleted IS NULL;
CREATE UNIQUE INDEX IF NOT EXISTS idx_entities_single_draft ON entities (published_entity_id)
    WHERE published_entity_id IS NOT NULL AND change_log_deleted IS NULL;

CREATE TABLE IF NOT EXISTS entity_values (
    value_id INTEGER PRIMARY KEY,
    entity_id INTEGER NOT NULL REFERENCES entities (entity_id) ON DELETE CASCADE,
    attribute_id INTEGER NOT NULL REFERENCES attributes (attribute_id),
    value TEXT NOT NULL,
    change_log_created INTEGER NOT NULL REFERENCES change_log (change_id)
);
CREATE INDEX IF NOT EXISTS idx_values_entity ON entity_values (entity_id, attribute_id);

CREATE TABLE IF NOT EXISTS value_dimensions (
    value_id INTEGER NOT NULL REFERENCES entity_values (value_id) ON DELETE CASCADE,
    dimension_id INTEGER NOT NULL REFERENCES dimensions (dimension_id),
    read_only INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (value_id, dimension_id)
);

CREATE TABLE IF NOT EXISTS entity_relationships (
    parent_entity_id INTEGER NOT NULL REFERENCES entities (entity_id) ON DELETE CASCADE,
    attribute_id INTEGER NOT NULL REFERENCES attributes (attribute_id),
    sort_order INTEGER NOT NULL,
    child_entity_id INTEGER REFERENCES entities (entity_id),
    PRIMARY KEY (parent_entity_id, attribute_id, sort_order)
);
CREATE INDEX IF NOT EXISTS idx_relationships_child ON entity_relationships (child_entity_id);

CREATE TABLE IF NOT EXISTS data_timeline (
    timeline_id INTEGER PRIMARY KEY,
    entity_id INTEGER NOT NULL,
    entity_guid BLOB NOT NULL CHECK (length(entity_guid) = 16),
    change_id INTEGER NOT NULL REFERENCES change_log (change_id),
    operation TEXT NOT NULL,
    payload BLOB NOT NULL,
    checksum BLOB NOT NULL CHECK (length(checksum) = 32),
    user_name TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_timeline_entity ON data_timeline (entity_id, change_id);
";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();
        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }
}
