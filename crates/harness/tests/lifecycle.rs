use std::sync::Arc;

use eavstore_core::{
    AppId, Attribute, AttributeType, ContentType, Entity, EntityGuid, EntityRef, MetadataFor, Value, ZoneId,
    content_type::APP_SCOPE,
};
use eavstore_engine::{EngineConfig, EngineError, ReferenceError, StateConflictError};
use eavstore_harness::{RecordingListener, TestApp, refs};
use eavstore_storage::{SqliteStorage, Storage, TimelineOperation};

fn husband_of(app: &TestApp, wife: &str, husband: eavstore_core::EntityId) -> Entity {
    app.person(wife, "W")
        .to_builder()
        .attribute(Attribute::with_values(
            "Husband",
            AttributeType::Entity,
            vec![Value::entities(refs(&[husband]))],
        ))
        .build()
}

// ============================================================================
// Deletion
// ============================================================================

#[test]
fn referenced_entity_is_protected() -> Result<(), Box<dyn std::error::Error>> {
    let mut app = TestApp::new()?;
    let options = app.options()?;
    let fred = app.save_person("Fred", "F")?;
    let wilma = app.engine.save_entity(&husband_of(&app, "Wilma", fred), &options)?;

    let check = app.engine.can_delete(fred)?;
    assert!(!check.can_delete);
    assert!(check.reason.contains(&wilma.to_string()), "{}", check.reason);

    assert!(matches!(
        app.engine.delete_entity(fred, false),
        Err(EngineError::StateConflict(StateConflictError::StillReferenced { .. }))
    ));
    assert!(app.engine.get_entity(fred)?.is_some());

    assert!(app.engine.can_delete(wilma)?.can_delete);
    Ok(())
}

#[test]
fn forced_delete_removes_incoming_edges() -> Result<(), Box<dyn std::error::Error>> {
    let mut app = TestApp::new()?;
    let options = app.options()?;
    let fred = app.save_person("Fred", "F")?;
    let wilma = app.engine.save_entity(&husband_of(&app, "Wilma", fred), &options)?;

    app.engine.delete_entity(fred, true)?;
    assert!(app.engine.get_entity(fred)?.is_none());
    assert!(app.engine.get_children(wilma, "Husband")?.is_empty());
    Ok(())
}

#[test]
fn deleting_the_parent_frees_the_child() -> Result<(), Box<dyn std::error::Error>> {
    let mut app = TestApp::new()?;
    let options = app.options()?;
    let fred = app.save_person("Fred", "F")?;
    let wilma = app.engine.save_entity(&husband_of(&app, "Wilma", fred), &options)?;

    app.engine.delete_entity(wilma, false)?;
    assert!(app.engine.can_delete(fred)?.can_delete);

    let history = app.engine.history(wilma)?;
    assert_eq!(history[0].operation, TimelineOperation::Delete);
    Ok(())
}

#[test]
fn metadata_blocks_delete() -> Result<(), Box<dyn std::error::Error>> {
    let mut app = TestApp::new()?;
    let options = app.options()?;
    let target = app.save_person("Fred", "F")?;
    let note = app
        .person("Note", "N")
        .to_builder()
        .metadata(MetadataFor::entity(target))
        .build();
    let note_id = app.engine.save_entity(&note, &options)?;

    let check = app.engine.can_delete(target)?;
    assert!(!check.can_delete);
    assert!(check.reason.contains("metadata"));
    assert!(check.reason.contains(&note_id.to_string()));
    Ok(())
}

#[test]
fn delete_reason_names_each_parent_once() -> Result<(), Box<dyn std::error::Error>> {
    let mut app = TestApp::new()?;
    let options = app.options()?;
    let fred = app.save_person("Fred", "F")?;
    let wilma = husband_of(&app, "Wilma", fred)
        .to_builder()
        .attribute(Attribute::with_values(
            "Friends",
            AttributeType::Entity,
            vec![Value::entities(refs(&[fred, fred]))],
        ))
        .build();
    let wilma = app.engine.save_entity(&wilma, &options)?;
    let betty = app.engine.save_entity(&husband_of(&app, "Betty", fred), &options)?;

    let check = app.engine.can_delete(fred)?;
    assert_eq!(check.reason, format!("referenced by entities {wilma}, {betty}"));
    Ok(())
}

#[test]
fn metadata_key_changes_are_saved() -> Result<(), Box<dyn std::error::Error>> {
    let mut app = TestApp::new()?;
    let options = app.options()?;
    let target = app.save_person("Fred", "F")?;
    let id = app.save_person("Note", "N")?;

    let stored = app.engine.get_entity(id)?.expect("note");
    let described = stored.to_builder().metadata(MetadataFor::entity(target)).build();
    app.engine.save_entity(&described, &options)?;
    assert_eq!(
        app.engine.get_entity(id)?.expect("note").metadata(),
        Some(&MetadataFor::entity(target))
    );
    assert!(!app.engine.can_delete(target)?.can_delete);

    let plain = app.person("Note", "N").with_id(id);
    app.engine.save_entity(&plain, &options)?;
    assert_eq!(app.engine.get_entity(id)?.expect("note").metadata(), None);
    assert!(app.engine.can_delete(target)?.can_delete);
    Ok(())
}

#[test]
fn deleting_a_draft_keeps_the_published_entity() -> Result<(), Box<dyn std::error::Error>> {
    let mut app = TestApp::new()?;
    let options = app.options()?;
    let fred = app.save_person("Fred", "F")?;
    let stored = app.engine.get_entity(fred)?.expect("fred");
    let draft = app.engine.save_entity(&stored.with_published(false), &options)?;

    assert!(app.engine.can_delete(draft)?.can_delete);
    app.engine.delete_entity(draft, false)?;
    assert_eq!(app.engine.storage().count_drafts_of(fred)?, 0);
    assert!(app.engine.storage().get_entity(draft)?.is_none());
    assert!(app.engine.get_entity(fred)?.is_some());
    Ok(())
}

#[test]
fn deleting_a_published_entity_drops_its_draft() -> Result<(), Box<dyn std::error::Error>> {
    let mut app = TestApp::new()?;
    let options = app.options()?;
    let fred = app.save_person("Fred", "F")?;
    let stored = app.engine.get_entity(fred)?.expect("fred");
    let draft = app.engine.save_entity(&stored.with_published(false), &options)?;

    app.engine.delete_entity(fred, false)?;
    assert!(app.engine.storage().get_entity(draft)?.is_none());
    assert!(app.engine.get_entity(fred)?.is_none());
    assert!(app.engine.get_entity_by_guid(stored.guid())?.is_none());
    assert!(matches!(app.engine.delete_entity(fred, false), Err(EngineError::EntityNotFound(_))));
    Ok(())
}

// ============================================================================
// Get or create
// ============================================================================

#[test]
fn get_or_create_is_stable() -> Result<(), Box<dyn std::error::Error>> {
    let mut app = TestApp::new()?;
    let options = app.options()?;
    let guid = EntityGuid::new();
    let title = Attribute::with_values("FullName", AttributeType::String, vec![Value::text("Config")]);

    let first = app.engine.get_or_create(guid, "Person", vec![title.clone()], &options)?;
    let second = app.engine.get_or_create(guid, "Person", vec![title], &options)?;
    assert_eq!(first, second);
    assert_eq!(app.engine.storage().count_rows_by_guid(guid)?, 1);
    assert_eq!(app.text(first, "FullName")?.as_deref(), Some("Config"));
    Ok(())
}

#[test]
fn get_or_create_resurrects_deleted_entities() -> Result<(), Box<dyn std::error::Error>> {
    let mut app = TestApp::new()?;
    let options = app.options()?;
    let id = app.save_person("Fred", "F")?;
    let guid = app.engine.get_entity(id)?.expect("fred").guid();
    app.engine.delete_entity(id, false)?;

    let back = app.engine.get_or_create(guid, "Person", vec![], &options)?;
    assert_eq!(back, id);
    assert_eq!(app.text(id, "FirstName")?.as_deref(), Some("Fred"));
    assert_eq!(app.engine.history(id)?[0].operation, TimelineOperation::Restore);
    Ok(())
}

// ============================================================================
// Versioning
// ============================================================================

#[test]
fn history_lists_versions_newest_first() -> Result<(), Box<dyn std::error::Error>> {
    let mut app = TestApp::new()?;
    let mut options = app.options()?;
    options.preserve_existing_attributes = true;
    let id = app.save_person("Fred", "F")?;
    let guid = app.engine.get_entity(id)?.expect("fred").guid();
    app.engine
        .merge_and_save(&Entity::builder(guid).text("FirstName", "Frederick").build(), &options)?;

    let history = app.engine.history(id)?;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].number, 2);
    assert_eq!(history[1].number, 1);
    assert!(history[0].change_id > history[1].change_id);
    assert_eq!(history[0].user_name, "system");

    let old = app.engine.get_version(id, history[1].change_id)?;
    assert_eq!(old.attribute("FirstName").and_then(|a| a.values[0].as_text()), Some("Fred"));
    Ok(())
}

#[test]
fn snapshots_include_edges_written_at_flush() -> Result<(), Box<dyn std::error::Error>> {
    let mut app = TestApp::new()?;
    let options = app.options()?;
    let fred = app.save_person("Fred", "F")?;
    let wilma = app.engine.save_entity(&husband_of(&app, "Wilma", fred), &options)?;

    let history = app.engine.history(wilma)?;
    let snapshot = app.engine.get_version(wilma, history[0].change_id)?;
    assert_eq!(
        snapshot.attribute("Husband").map(Attribute::children),
        Some(vec![Some(EntityRef::Id(fred))])
    );
    Ok(())
}

#[test]
fn restore_brings_back_old_values() -> Result<(), Box<dyn std::error::Error>> {
    let mut app = TestApp::new()?;
    let mut options = app.options()?;
    options.preserve_existing_attributes = true;
    let id = app.save_person("Fred", "F")?;
    let guid = app.engine.get_entity(id)?.expect("fred").guid();
    let first_change = app.engine.history(id)?[0].change_id;

    app.engine
        .merge_and_save(&Entity::builder(guid).text("FirstName", "Frederick").build(), &options)?;
    let draft = Entity::builder(guid).published(false).text("LastName", "Feuerstein").build();
    app.engine.merge_and_save(&draft, &options)?;
    assert_eq!(app.engine.storage().count_drafts_of(id)?, 1);

    let restored = app.engine.restore_version(id, first_change)?;
    assert_eq!(restored, id);
    assert_eq!(app.text(id, "FirstName")?.as_deref(), Some("Fred"));
    assert_eq!(app.engine.storage().count_drafts_of(id)?, 0);
    assert_eq!(app.engine.history(id)?[0].operation, TimelineOperation::Restore);
    Ok(())
}

#[test]
fn restore_drops_references_that_no_longer_resolve() -> Result<(), Box<dyn std::error::Error>> {
    let mut app = TestApp::new()?;
    let options = app.options()?;
    let fred = app.save_person("Fred", "F")?;
    let wilma = app.engine.save_entity(&husband_of(&app, "Wilma", fred), &options)?;
    let with_husband = app.engine.history(wilma)?[0].change_id;

    app.engine.delete_entity(fred, true)?;
    app.engine.restore_version(wilma, with_husband)?;
    assert!(app.engine.get_children(wilma, "Husband")?.is_empty());
    Ok(())
}

#[test]
fn unknown_version_is_reported() -> Result<(), Box<dyn std::error::Error>> {
    let mut app = TestApp::new()?;
    let id = app.save_person("Fred", "F")?;
    assert!(matches!(
        app.engine.get_version(id, eavstore_core::ChangeId::new(9_999)),
        Err(EngineError::VersionNotFound { .. })
    ));
    Ok(())
}

// ============================================================================
// Cache and listeners
// ============================================================================

#[test]
fn listener_hears_every_commit_and_nothing_else() -> Result<(), Box<dyn std::error::Error>> {
    let TestApp { engine } = TestApp::new()?;
    let listener = Arc::new(RecordingListener::new());
    let mut app = TestApp {
        engine: engine.with_listener(listener.clone()),
    };
    let options = app.options()?;

    app.save_person("Fred", "F")?;
    assert_eq!(listener.purges(), vec![(ZoneId::new(1), AppId::new(1))]);

    let bad = Entity::builder(EntityGuid::new()).content_type("Car").build();
    assert!(app.engine.save_entity(&bad, &options).is_err());
    assert_eq!(listener.count(), 1);
    Ok(())
}

#[test]
fn writes_invalidate_the_content_type_cache() -> Result<(), Box<dyn std::error::Error>> {
    let mut app = TestApp::new()?;
    let app_id = app.engine.config().app();

    assert_eq!(app.engine.content_types()?.len(), 2);
    assert!(app.engine.cache().is_cached(app_id));
    let generation = app.engine.cache().generation();

    app.engine
        .save_content_type(&ContentType::new("Event", "Event", APP_SCOPE))?;
    assert!(!app.engine.cache().is_cached(app_id));
    assert!(app.engine.cache().generation() > generation);
    assert!(app.engine.content_type("event")?.is_some());
    Ok(())
}

// ============================================================================
// Shared configuration (ghost types)
// ============================================================================

#[test]
fn ghost_type_uses_the_master_schema() -> Result<(), Box<dyn std::error::Error>> {
    let mut app = TestApp::new()?;
    let options = app.options()?;
    let mut ghost = ContentType::new("Contact", "Contact", APP_SCOPE);
    ghost.uses_configuration_of = Some("Person".into());
    app.engine.save_content_type(&ghost)?;

    let entity = Entity::builder(EntityGuid::new())
        .content_type("Contact")
        .text("FirstName", "Gina")
        .build();
    let id = app.engine.save_entity(&entity, &options)?;
    let loaded = app.engine.get_entity(id)?.expect("contact");
    assert_eq!(loaded.content_type(), Some("Contact"));
    assert_eq!(loaded.title_field(), Some("FullName"));
    assert_eq!(app.text(id, "FirstName")?.as_deref(), Some("Gina"));
    Ok(())
}

#[test]
fn ghost_type_without_master_fails() -> Result<(), Box<dyn std::error::Error>> {
    let mut app = TestApp::new()?;
    let options = app.options()?;
    let mut ghost = ContentType::new("Orphan", "Orphan", APP_SCOPE);
    ghost.uses_configuration_of = Some("Missing".into());
    app.engine.save_content_type(&ghost)?;

    let entity = Entity::builder(EntityGuid::new()).content_type("Orphan").build();
    assert!(matches!(
        app.engine.save_entity(&entity, &options),
        Err(EngineError::Reference(ReferenceError::MissingMasterContentType { .. }))
    ));
    Ok(())
}

// ============================================================================
// Configuration and persistence
// ============================================================================

#[test]
fn data_survives_reopening_the_database() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("eav.db");
    let path = path.to_str().ok_or("non-utf8 temp path")?;
    let config = EngineConfig::from_json(r#"{ "user_name": "importer" }"#)?;

    let id = {
        let mut app = TestApp::with_storage(config.clone(), SqliteStorage::open(path)?)?;
        app.save_person("Fred", "F")?
    };

    let engine = eavstore_engine::Engine::new(config, SqliteStorage::open(path)?)?;
    let loaded = engine.get_entity(id)?.expect("persisted entity");
    assert_eq!(loaded.owner(), "importer");
    assert_eq!(engine.history(id)?[0].user_name, "importer");
    Ok(())
}

#[test]
fn entities_of_another_app_are_out_of_reach() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("eav.db");
    let path = path.to_str().ok_or("non-utf8 temp path")?;

    let other_config = EngineConfig::from_json(r#"{ "zone_id": 2, "app_id": 2 }"#)?;
    let foreign = {
        let mut other = TestApp::with_storage(other_config, SqliteStorage::open(path)?)?;
        other.save_person("Fred", "F")?
    };

    let mut app = TestApp::with_storage(EngineConfig::default(), SqliteStorage::open(path)?)?;
    let options = app.options()?;
    assert!(app.engine.get_entity(foreign)?.is_none());

    let wife = husband_of(&app, "Wilma", foreign);
    assert!(matches!(
        app.engine.save_entity(&wife, &options),
        Err(EngineError::Reference(ReferenceError::UnresolvedReference { .. }))
    ));
    assert!(matches!(
        app.engine.save_entity(&app.person("Fred", "F").with_id(foreign), &options),
        Err(EngineError::EntityNotFound(_))
    ));
    assert!(matches!(
        app.engine.delete_entity(foreign, false),
        Err(EngineError::EntityNotFound(_))
    ));
    Ok(())
}
