use eavstore_core::{Attribute, AttributeType, Entity, EntityGuid, EntityId, EntityRef, Value};
use eavstore_engine::{EngineError, ReferenceError};
use eavstore_harness::{TestApp, refs};
use eavstore_storage::Storage;

fn with_edges(entity: Entity, attribute: &str, children: Vec<Option<EntityRef>>) -> Entity {
    entity
        .to_builder()
        .attribute(Attribute::with_values(
            attribute,
            AttributeType::Entity,
            vec![Value::entities(children)],
        ))
        .build()
}

fn child_ids(children: &[Option<Entity>]) -> Vec<Option<EntityId>> {
    children.iter().map(|c| c.as_ref().and_then(Entity::id)).collect()
}

// ============================================================================
// Ordering and resolution
// ============================================================================

#[test]
fn children_keep_their_order() -> Result<(), Box<dyn std::error::Error>> {
    let mut app = TestApp::new()?;
    let options = app.options()?;
    let a = app.save_person("Ada", "A")?;
    let b = app.save_person("Ben", "B")?;
    let c = app.save_person("Cleo", "C")?;

    let parent = with_edges(app.person("Pia", "P"), "Friends", refs(&[c, a, b]));
    let parent_id = app.engine.save_entity(&parent, &options)?;

    let children = app.engine.get_children(parent_id, "Friends")?;
    assert_eq!(child_ids(&children), vec![Some(c), Some(a), Some(b)]);

    let loaded = app.engine.get_entity(parent_id)?.expect("parent");
    let stored = loaded.attribute("Friends").expect("friends").children();
    assert_eq!(stored, refs(&[c, a, b]));
    Ok(())
}

#[test]
fn empty_slots_are_kept() -> Result<(), Box<dyn std::error::Error>> {
    let mut app = TestApp::new()?;
    let options = app.options()?;
    let a = app.save_person("Ada", "A")?;
    let b = app.save_person("Ben", "B")?;

    let children = vec![Some(EntityRef::Id(a)), None, Some(EntityRef::Id(b))];
    let parent_id = app
        .engine
        .save_entity(&with_edges(app.person("Pia", "P"), "Friends", children), &options)?;

    let loaded = app.engine.get_children(parent_id, "Friends")?;
    assert_eq!(child_ids(&loaded), vec![Some(a), None, Some(b)]);
    Ok(())
}

#[test]
fn resaving_replaces_the_edge_set() -> Result<(), Box<dyn std::error::Error>> {
    let mut app = TestApp::new()?;
    let options = app.options()?;
    let a = app.save_person("Ada", "A")?;
    let b = app.save_person("Ben", "B")?;
    let parent = with_edges(app.person("Pia", "P"), "Friends", refs(&[a, b]));
    let parent_id = app.engine.save_entity(&parent, &options)?;

    let stored = app.engine.get_entity(parent_id)?.expect("parent");
    let updated = with_edges(stored, "Friends", refs(&[b]));
    app.engine.save_entity(&updated, &options)?;

    assert_eq!(child_ids(&app.engine.get_children(parent_id, "Friends")?), vec![Some(b)]);
    assert_eq!(app.engine.storage().get_parents(a)?.len(), 0);
    Ok(())
}

#[test]
fn forward_guid_references_resolve_within_a_batch() -> Result<(), Box<dyn std::error::Error>> {
    let mut app = TestApp::new()?;
    let options = app.options()?;
    let wife = app.person("Wilma", "W");
    let husband = app.person("Fred", "F");
    let wife = with_edges(wife, "Husband", vec![Some(EntityRef::Guid(husband.guid()))]);

    // the wife is saved before the husband exists
    let ids = app.engine.save_entities(&[wife, husband], &options)?;
    let children = app.engine.get_children(ids[0], "Husband")?;
    assert_eq!(child_ids(&children), vec![Some(ids[1])]);
    Ok(())
}

#[test]
fn guid_reference_prefers_the_published_row() -> Result<(), Box<dyn std::error::Error>> {
    let mut app = TestApp::new()?;
    let options = app.options()?;
    let target = app.save_person("Ada", "A")?;
    let target_entity = app.engine.get_entity(target)?.expect("target");
    app.engine.save_entity(&target_entity.with_published(false), &options)?;
    assert_eq!(app.engine.storage().count_drafts_of(target)?, 1);

    let parent = with_edges(
        app.person("Pia", "P"),
        "Husband",
        vec![Some(EntityRef::Guid(target_entity.guid()))],
    );
    let parent_id = app.engine.save_entity(&parent, &options)?;
    assert_eq!(
        child_ids(&app.engine.get_children(parent_id, "Husband")?),
        vec![Some(target)]
    );
    Ok(())
}

#[test]
fn references_given_as_text_are_parsed() -> Result<(), Box<dyn std::error::Error>> {
    let mut app = TestApp::new()?;
    let options = app.options()?;
    let a = app.save_person("Ada", "A")?;
    let a_guid = app.engine.get_entity(a)?.expect("a").guid();
    let b = app.save_person("Ben", "B")?;

    let parent = app
        .person("Pia", "P")
        .to_builder()
        .text("Friends", &format!("{b},{a_guid}"))
        .build();
    let parent_id = app.engine.save_entity(&parent, &options)?;
    assert_eq!(
        child_ids(&app.engine.get_children(parent_id, "Friends")?),
        vec![Some(b), Some(a)]
    );
    Ok(())
}

// ============================================================================
// Atomicity
// ============================================================================

#[test]
fn unresolved_reference_rolls_back_everything() -> Result<(), Box<dyn std::error::Error>> {
    let mut app = TestApp::new()?;
    let options = app.options()?;
    let before = app.engine.storage().row_counts()?;

    let plain = app.person("Ada", "A");
    let dangling = with_edges(
        app.person("Pia", "P"),
        "Husband",
        vec![Some(EntityRef::Guid(EntityGuid::new()))],
    );
    let result = app.engine.save_entities(&[plain.clone(), dangling.clone()], &options);
    match result {
        Err(EngineError::Reference(ReferenceError::UnresolvedReference { attribute, .. })) => {
            assert_eq!(attribute, "Husband");
        }
        other => panic!("expected unresolved reference, got {other:?}"),
    }

    assert_eq!(app.engine.storage().count_rows_by_guid(plain.guid())?, 0);
    assert_eq!(app.engine.storage().count_rows_by_guid(dangling.guid())?, 0);
    assert_eq!(app.engine.storage().row_counts()?, before);
    Ok(())
}

#[test]
fn reference_to_a_deleted_entity_does_not_resolve() -> Result<(), Box<dyn std::error::Error>> {
    let mut app = TestApp::new()?;
    let options = app.options()?;
    let gone = app.save_person("Ada", "A")?;
    app.engine.delete_entity(gone, false)?;

    let parent = with_edges(app.person("Pia", "P"), "Husband", refs(&[gone]));
    assert!(matches!(
        app.engine.save_entity(&parent, &options),
        Err(EngineError::Reference(ReferenceError::UnresolvedReference { .. }))
    ));
    Ok(())
}

#[test]
fn promoting_a_draft_keeps_incoming_edges() -> Result<(), Box<dyn std::error::Error>> {
    let mut app = TestApp::new()?;
    let options = app.options()?;
    let target = app.save_person("Ada", "A")?;
    let stored = app.engine.get_entity(target)?.expect("target");
    let draft_id = app.engine.save_entity(&stored.with_published(false), &options)?;

    // an edge pointing straight at the draft row
    let parent = with_edges(app.person("Pia", "P"), "Husband", refs(&[draft_id]));
    let parent_id = app.engine.save_entity(&parent, &options)?;

    app.engine.publish_draft_in_branch(target)?;
    assert_eq!(
        child_ids(&app.engine.get_children(parent_id, "Husband")?),
        vec![Some(target)]
    );
    Ok(())
}
