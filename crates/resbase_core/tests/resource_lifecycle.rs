use resbase_core::db::open_db_in_memory;
use resbase_core::handler::{AttributeHandlerRegistry, HandlerContext};
use resbase_core::model::value::date_from_millis;
use resbase_core::{
    AttributeSpec, AttributeValue, DateRange, NewResource, ParameterBag, RawValue, RepoError,
    ResourceId, ResourceRepository, ResourceService, SchemaService, StorageKind, SubjectId,
};
use rusqlite::Connection;
use std::sync::Arc;

fn registry() -> AttributeHandlerRegistry {
    AttributeHandlerRegistry::builtin(HandlerContext::default())
}

fn setup() -> (Connection, ResourceRepository) {
    let conn = open_db_in_memory().unwrap();
    let repository = ResourceRepository::open(&conn, &registry(), false).unwrap();
    (conn, repository)
}

/// `task` (table storage): title (required string), done, notes (text),
/// estimate (integer in 1..100).
fn define_task(conn: &Connection, repository: &ResourceRepository) {
    let schema = SchemaService::new(conn, repository);
    schema
        .define_class("task", &[], StorageKind::Table, false)
        .unwrap();
    schema
        .add_attribute("task", AttributeSpec::new("title", "string").required(), RawValue::Null)
        .unwrap();
    schema
        .add_attribute("task", AttributeSpec::new("done", "boolean"), RawValue::Null)
        .unwrap();
    schema
        .add_attribute("task", AttributeSpec::new("notes", "text"), RawValue::Null)
        .unwrap();
    schema
        .add_attribute(
            "task",
            AttributeSpec::new("estimate", "integer").domain("1..100"),
            RawValue::Null,
        )
        .unwrap();
}

fn count(conn: &Connection, table: &str) -> i64 {
    conn.query_row(&format!("SELECT COUNT(*) FROM {table};"), [], |row| row.get(0))
        .unwrap()
}

fn string(value: &str) -> Option<AttributeValue> {
    Some(AttributeValue::String(value.to_string()))
}

#[test]
fn create_stores_values_and_leaves_nothing_modified() {
    let (conn, repository) = setup();
    define_task(&conn, &repository);
    let service = ResourceService::new(&conn, &repository);

    let task = service
        .create(
            NewResource::new("task", "first")
                .value("title", "write tests")
                .value("done", false)
                .value("notes", "long form\nnotes")
                .value("estimate", 8),
        )
        .unwrap();

    assert!(!task.is_modified());
    assert_eq!(task.get(&conn, "title").unwrap(), string("write tests"));
    assert_eq!(
        task.get(&conn, "done").unwrap(),
        Some(AttributeValue::Boolean(false))
    );
    assert_eq!(
        task.get(&conn, "estimate").unwrap(),
        Some(AttributeValue::Integer(8))
    );
    assert_eq!(task.get(&conn, "name").unwrap(), string("first"));
    assert_eq!(count(&conn, "rc_task"), 1);
    assert_eq!(count(&conn, "av_text"), 1);
}

#[test]
fn retrieve_returns_the_live_instance_while_it_is_held() {
    let (conn, repository) = setup();
    define_task(&conn, &repository);
    let service = ResourceService::new(&conn, &repository);

    let task = service
        .create(NewResource::new("task", "held").value("title", "a"))
        .unwrap();
    let again = service.retrieve(task.id()).unwrap();

    assert!(Arc::ptr_eq(&task, &again));
}

#[test]
fn retrieve_loads_from_storage_once_the_instance_is_dropped() {
    let (conn, repository) = setup();
    define_task(&conn, &repository);
    let service = ResourceService::new(&conn, &repository);

    let id = service
        .create(
            NewResource::new("task", "dropped")
                .value("title", "persisted")
                .value("notes", "off-row"),
        )
        .unwrap()
        .id();
    assert!(repository.find(id).is_none());

    let loaded = service.retrieve(id).unwrap();
    assert_eq!(loaded.get(&conn, "title").unwrap(), string("persisted"));
    assert_eq!(
        loaded.get(&conn, "notes").unwrap(),
        Some(AttributeValue::Text("off-row".to_string()))
    );
    assert_eq!(loaded.get(&conn, "done").unwrap(), None);
}

#[test]
fn update_persists_changes_and_clears_modification() {
    let (conn, repository) = setup();
    define_task(&conn, &repository);
    let service = ResourceService::new(&conn, &repository);
    let task = service
        .create(NewResource::new("task", "to update").value("title", "before"))
        .unwrap();

    task.set(&conn, "title", "after").unwrap();
    task.set(&conn, "notes", "added later").unwrap();
    task.set(&conn, "name", "renamed").unwrap();
    assert!(task.is_modified());
    service.update(&task).unwrap();
    assert!(!task.is_modified());

    let fresh = ResourceRepository::open(&conn, &registry(), false).unwrap();
    let stored = fresh.retrieve(&conn, task.id()).unwrap();
    assert_eq!(stored.get(&conn, "title").unwrap(), string("after"));
    assert_eq!(
        stored.get(&conn, "notes").unwrap(),
        Some(AttributeValue::Text("added later".to_string()))
    );
    assert_eq!(stored.name(), "renamed");
}

#[test]
fn writing_an_equal_value_does_not_mark_modified() {
    let (conn, repository) = setup();
    define_task(&conn, &repository);
    let service = ResourceService::new(&conn, &repository);
    let task = service
        .create(NewResource::new("task", "same").value("title", "x"))
        .unwrap();

    task.set(&conn, "title", "x").unwrap();
    assert!(!task.is_modified());

    task.unset("done").unwrap();
    assert!(task.is_modified());
}

#[test]
fn revert_discards_unsaved_changes_and_is_repeatable() {
    let (conn, repository) = setup();
    define_task(&conn, &repository);
    let service = ResourceService::new(&conn, &repository);
    let task = service
        .create(
            NewResource::new("task", "revertible")
                .value("title", "original")
                .value("estimate", 3),
        )
        .unwrap();

    task.set(&conn, "title", "scratch").unwrap();
    task.unset("estimate").unwrap();
    service.revert(&task).unwrap();
    let first = (
        task.get(&conn, "title").unwrap(),
        task.get(&conn, "estimate").unwrap(),
    );
    service.revert(&task).unwrap();
    let second = (
        task.get(&conn, "title").unwrap(),
        task.get(&conn, "estimate").unwrap(),
    );

    assert!(!task.is_modified());
    assert_eq!(first, (string("original"), Some(AttributeValue::Integer(3))));
    assert_eq!(first, second);
}

#[test]
fn create_without_required_value_fails_and_stores_nothing() {
    let (conn, repository) = setup();
    define_task(&conn, &repository);
    let service = ResourceService::new(&conn, &repository);

    let err = service
        .create(NewResource::new("task", "incomplete").value("done", true))
        .unwrap_err();

    match err {
        RepoError::ValueRequired { class, attribute } => {
            assert_eq!(class, "task");
            assert_eq!(attribute, "title");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(count(&conn, "resources"), 0);
    assert_eq!(count(&conn, "rc_task"), 0);
}

#[test]
fn empty_name_is_rejected() {
    let (conn, repository) = setup();
    define_task(&conn, &repository);
    let service = ResourceService::new(&conn, &repository);

    assert!(matches!(
        service.create(NewResource::new("task", "").value("title", "t")),
        Err(RepoError::ValueRequired { .. })
    ));

    let task = service
        .create(NewResource::new("task", "named").value("title", "t"))
        .unwrap();
    assert!(matches!(
        task.set(&conn, "name", ""),
        Err(RepoError::ValueRequired { .. })
    ));
}

#[test]
fn unsetting_a_required_value_fails_on_update() {
    let (conn, repository) = setup();
    define_task(&conn, &repository);
    let service = ResourceService::new(&conn, &repository);
    let task = service
        .create(NewResource::new("task", "required").value("title", "keep"))
        .unwrap();

    task.unset("title").unwrap();
    assert!(matches!(
        service.update(&task),
        Err(RepoError::ValueRequired { .. })
    ));
    service.revert(&task).unwrap();
    assert_eq!(task.get(&conn, "title").unwrap(), string("keep"));
}

#[test]
fn domain_violations_name_the_attribute() {
    let (conn, repository) = setup();
    define_task(&conn, &repository);
    let service = ResourceService::new(&conn, &repository);

    let err = service
        .create(
            NewResource::new("task", "too big")
                .value("title", "t")
                .value("estimate", 500),
        )
        .unwrap_err();
    match err {
        RepoError::ConstraintViolation { attribute, .. } => assert_eq!(attribute, "estimate"),
        other => panic!("unexpected error: {other}"),
    }

    let task = service
        .create(NewResource::new("task", "fine").value("title", "t"))
        .unwrap();
    task.set(&conn, "estimate", 101).unwrap();
    assert!(matches!(
        service.update(&task),
        Err(RepoError::ConstraintViolation { .. })
    ));
    assert!(task.is_modified());
}

#[test]
fn read_only_and_unknown_attributes_are_rejected() {
    let (conn, repository) = setup();
    define_task(&conn, &repository);
    let service = ResourceService::new(&conn, &repository);
    let task = service
        .create(NewResource::new("task", "guarded").value("title", "t"))
        .unwrap();

    assert!(matches!(
        task.set(&conn, "created", RawValue::Null),
        Err(RepoError::UnsupportedOperation(_))
    ));
    assert!(matches!(
        task.set(&conn, "missing", "x"),
        Err(RepoError::InvalidArgument(_))
    ));
    assert!(matches!(
        service.create(NewResource::new("task", "bad").value("missing", 1)),
        Err(RepoError::InvalidArgument(_))
    ));
}

#[test]
fn abstract_classes_have_no_direct_instances() {
    let (conn, repository) = setup();
    let schema = SchemaService::new(&conn, &repository);
    schema
        .define_class("shape", &[], StorageKind::Dynamic, true)
        .unwrap();
    let service = ResourceService::new(&conn, &repository);

    assert!(matches!(
        service.create(NewResource::new("shape", "abstract")),
        Err(RepoError::InvalidArgument(_))
    ));
}

#[test]
fn delete_removes_rows_and_off_row_values() {
    let (conn, repository) = setup();
    define_task(&conn, &repository);
    let service = ResourceService::new(&conn, &repository);
    let task = service
        .create(
            NewResource::new("task", "doomed")
                .value("title", "t")
                .value("notes", "gone soon"),
        )
        .unwrap();
    let id = task.id();

    service.delete(&task).unwrap();

    assert!(task.is_deleted());
    assert_eq!(count(&conn, "resources"), 0);
    assert_eq!(count(&conn, "rc_task"), 0);
    assert_eq!(count(&conn, "av_text"), 0);
    assert!(repository.find(id).is_none());
    assert!(service.retrieve(id).unwrap_err().is_not_found());
    assert!(service.delete(&task).unwrap_err().is_not_found());
}

#[test]
fn retrieve_of_unknown_id_is_not_found() {
    let (conn, repository) = setup();
    let err = repository.retrieve(&conn, ResourceId(77)).unwrap_err();
    assert!(matches!(
        err,
        RepoError::EntityNotFound {
            entity: "resources",
            id: 77
        }
    ));
}

#[test]
fn dynamic_and_table_classes_share_one_instance() {
    let (conn, repository) = setup();
    let schema = SchemaService::new(&conn, &repository);
    schema
        .define_class("document", &[], StorageKind::Table, false)
        .unwrap();
    schema
        .add_attribute("document", AttributeSpec::new("title", "string"), RawValue::Null)
        .unwrap();
    schema
        .define_class("report", &["document"], StorageKind::Dynamic, false)
        .unwrap();
    schema
        .add_attribute("report", AttributeSpec::new("pages", "integer"), RawValue::Null)
        .unwrap();
    let service = ResourceService::new(&conn, &repository);

    let id = service
        .create(
            NewResource::new("report", "q3")
                .value("title", "Quarterly")
                .value("pages", 12),
        )
        .unwrap()
        .id();

    assert_eq!(count(&conn, "rc_document"), 1);
    assert_eq!(count(&conn, "resource_attributes"), 1);
    let report = service.retrieve(id).unwrap();
    assert_eq!(report.get(&conn, "title").unwrap(), string("Quarterly"));
    assert_eq!(
        report.get(&conn, "pages").unwrap(),
        Some(AttributeValue::Integer(12))
    );

    report.unset("pages").unwrap();
    service.update(&report).unwrap();
    assert_eq!(count(&conn, "resource_attributes"), 0);
    assert_eq!(count(&conn, "av_integer"), 0);
}

#[test]
fn builtin_metadata_is_set_at_creation() {
    let (conn, repository) = setup();
    define_task(&conn, &repository);
    let service = ResourceService::new(&conn, &repository);
    let parent = service
        .create(NewResource::new("task", "parent").value("title", "p"))
        .unwrap();

    let child = service
        .create(
            NewResource::new("task", "child")
                .owner(SubjectId(5))
                .parent(parent.id())
                .value("title", "c"),
        )
        .unwrap();

    let meta = child.meta();
    assert_eq!(meta.owner, Some(SubjectId(5)));
    assert_eq!(meta.parent, Some(parent.id()));
    assert_eq!(
        child.get(&conn, "parent").unwrap(),
        Some(AttributeValue::Resource(parent.id()))
    );
    assert!(child.get(&conn, "created").unwrap().is_some());
}

#[test]
fn in_place_changes_to_composite_values_are_persisted() {
    let (conn, repository) = setup();
    let schema = SchemaService::new(&conn, &repository);
    schema
        .define_class("event", &[], StorageKind::Table, false)
        .unwrap();
    let window = schema
        .add_attribute("event", AttributeSpec::new("window", "date_range"), RawValue::Null)
        .unwrap();
    let service = ResourceService::new(&conn, &repository);
    let start = date_from_millis(1_000).unwrap();
    let end = date_from_millis(5_000).unwrap();

    let event = service
        .create(
            NewResource::new("event", "launch").value(
                "window",
                AttributeValue::DateRange(DateRange::new(Some(start), None).unwrap()),
            ),
        )
        .unwrap();
    assert!(!event.is_modified());

    event
        .modify_value(&conn, &window, |value| {
            if let AttributeValue::DateRange(range) = value {
                range.set_end(Some(end)).unwrap();
            }
        })
        .unwrap();
    assert!(event.is_value_modified(&window).unwrap());
    service.update(&event).unwrap();
    assert!(!event.is_modified());

    let fresh = ResourceRepository::open(&conn, &registry(), false).unwrap();
    let stored = fresh.retrieve(&conn, event.id()).unwrap();
    assert_eq!(
        stored.get(&conn, "window").unwrap(),
        Some(AttributeValue::DateRange(
            DateRange::new(Some(start), Some(end)).unwrap()
        ))
    );
}

#[test]
fn in_place_list_edits_are_persisted() {
    let (conn, repository) = setup();
    define_task(&conn, &repository);
    let schema = SchemaService::new(&conn, &repository);
    let watchers = schema
        .add_attribute("task", AttributeSpec::new("watchers", "resource_list"), RawValue::Null)
        .unwrap();
    let service = ResourceService::new(&conn, &repository);
    let alice = service
        .create(NewResource::new("task", "alice").value("title", "a"))
        .unwrap();
    let bob = service
        .create(NewResource::new("task", "bob").value("title", "b"))
        .unwrap();
    let task = service
        .create(
            NewResource::new("task", "watched")
                .value("title", "w")
                .value("watchers", AttributeValue::ResourceList(vec![alice.id()])),
        )
        .unwrap();

    task.modify_value(&conn, &watchers, |value| {
        if let AttributeValue::ResourceList(ids) = value {
            ids.push(bob.id());
        }
    })
    .unwrap();
    assert!(task.is_value_modified(&watchers).unwrap());
    service.update(&task).unwrap();
    assert!(!task.is_modified());

    let fresh = ResourceRepository::open(&conn, &registry(), false).unwrap();
    let stored = fresh.retrieve(&conn, task.id()).unwrap();
    assert_eq!(
        stored.get(&conn, "watchers").unwrap(),
        Some(AttributeValue::ResourceList(vec![alice.id(), bob.id()]))
    );
}

#[test]
fn in_place_parameter_edits_are_persisted() {
    let (conn, repository) = setup();
    let schema = SchemaService::new(&conn, &repository);
    schema
        .define_class("profile", &[], StorageKind::Dynamic, false)
        .unwrap();
    let settings = schema
        .add_attribute("profile", AttributeSpec::new("settings", "parameters"), RawValue::Null)
        .unwrap();
    let service = ResourceService::new(&conn, &repository);
    let initial: ParameterBag = [("color", "red")].into_iter().collect();
    let profile = service
        .create(
            NewResource::new("profile", "me")
                .value("settings", AttributeValue::Parameters(initial)),
        )
        .unwrap();

    profile
        .modify_value(&conn, &settings, |value| {
            if let AttributeValue::Parameters(bag) = value {
                bag.set("size", "xl");
            }
        })
        .unwrap();
    assert!(profile.is_value_modified(&settings).unwrap());
    service.update(&profile).unwrap();
    assert!(!profile.is_modified());

    let fresh = ResourceRepository::open(&conn, &registry(), false).unwrap();
    let stored = fresh.retrieve(&conn, profile.id()).unwrap();
    let expected: ParameterBag = [("color", "red"), ("size", "xl")].into_iter().collect();
    assert_eq!(
        stored.get(&conn, "settings").unwrap(),
        Some(AttributeValue::Parameters(expected))
    );
}

#[test]
fn in_place_edit_that_changes_nothing_stays_unmodified() {
    let (conn, repository) = setup();
    define_task(&conn, &repository);
    let service = ResourceService::new(&conn, &repository);
    let task = service
        .create(NewResource::new("task", "steady").value("title", "same"))
        .unwrap();
    let title = task.attribute("title").unwrap();

    task.modify_value(&conn, &title, |_| ()).unwrap();

    assert!(!task.is_modified());
}

#[test]
fn reference_domains_name_a_resource_class() {
    let (conn, repository) = setup();
    define_task(&conn, &repository);
    let schema = SchemaService::new(&conn, &repository);
    schema
        .define_class("person", &[], StorageKind::Dynamic, false)
        .unwrap();
    assert!(matches!(
        schema.add_attribute(
            "task",
            AttributeSpec::new("reviewer", "resource").domain("nobody"),
            RawValue::Null,
        ),
        Err(RepoError::InvalidArgument(_))
    ));
    schema
        .add_attribute(
            "task",
            AttributeSpec::new("reviewer", "resource").domain(" person "),
            RawValue::Null,
        )
        .unwrap();
    let service = ResourceService::new(&conn, &repository);
    let person = service.create(NewResource::new("person", "pat")).unwrap();
    let other = service
        .create(NewResource::new("task", "other").value("title", "o"))
        .unwrap();

    let err = service
        .create(
            NewResource::new("task", "reviewed")
                .value("title", "r")
                .value("reviewer", other.id()),
        )
        .unwrap_err();
    assert!(matches!(err, RepoError::ConstraintViolation { .. }));
    service
        .create(
            NewResource::new("task", "reviewed")
                .value("title", "r")
                .value("reviewer", person.id()),
        )
        .unwrap();
}

#[test]
fn resource_references_are_listed_and_cleared() {
    let (conn, repository) = setup();
    define_task(&conn, &repository);
    let schema = SchemaService::new(&conn, &repository);
    schema
        .add_attribute("task", AttributeSpec::new("assignee", "resource"), RawValue::Null)
        .unwrap();
    schema
        .add_attribute("task", AttributeSpec::new("watchers", "resource_list"), RawValue::Null)
        .unwrap();
    let service = ResourceService::new(&conn, &repository);
    let alice = service
        .create(NewResource::new("task", "alice").value("title", "a"))
        .unwrap();
    let bob = service
        .create(NewResource::new("task", "bob").value("title", "b"))
        .unwrap();

    let task = service
        .create(
            NewResource::new("task", "shared")
                .value("title", "s")
                .value("assignee", alice.id())
                .value(
                    "watchers",
                    AttributeValue::ResourceList(vec![alice.id(), bob.id()]),
                ),
        )
        .unwrap();

    let mut references = service.resource_references(&task).unwrap();
    references.sort();
    assert_eq!(references, vec![alice.id(), alice.id(), bob.id()]);

    assert!(service.clear_resource_references(&task, &[alice.id()]).unwrap());
    assert!(!task.is_modified());
    assert_eq!(task.get(&conn, "assignee").unwrap(), None);
    assert_eq!(
        task.get(&conn, "watchers").unwrap(),
        Some(AttributeValue::ResourceList(vec![bob.id()]))
    );
    assert!(!service.clear_resource_references(&task, &[alice.id()]).unwrap());

    let fresh = ResourceRepository::open(&conn, &registry(), false).unwrap();
    let stored = fresh.retrieve(&conn, task.id()).unwrap();
    assert_eq!(
        fresh.resource_references(&conn, &stored).unwrap(),
        vec![bob.id()]
    );
}

#[test]
fn deleting_a_referenced_resource_nulls_the_reference_column() {
    let (conn, repository) = setup();
    define_task(&conn, &repository);
    let schema = SchemaService::new(&conn, &repository);
    schema
        .add_attribute("task", AttributeSpec::new("assignee", "resource"), RawValue::Null)
        .unwrap();
    let service = ResourceService::new(&conn, &repository);
    let alice = service
        .create(NewResource::new("task", "alice").value("title", "a"))
        .unwrap();
    let task = service
        .create(
            NewResource::new("task", "assigned")
                .value("title", "t")
                .value("assignee", alice.id()),
        )
        .unwrap();

    service.delete(&alice).unwrap();
    service.revert(&task).unwrap();

    assert_eq!(task.get(&conn, "assignee").unwrap(), None);
}

#[test]
fn retrieve_many_loads_in_input_order() {
    let (conn, repository) = setup();
    define_task(&conn, &repository);
    let service = ResourceService::new(&conn, &repository);
    let ids: Vec<ResourceId> = (0..3)
        .map(|n| {
            service
                .create(NewResource::new("task", format!("t{n}")).value("title", format!("#{n}")))
                .unwrap()
                .id()
        })
        .collect();
    let kept = service.retrieve(ids[1]).unwrap();

    let wanted = vec![ids[2], ids[1], ids[0]];
    let loaded = service.retrieve_many(&wanted).unwrap();

    assert_eq!(
        loaded.iter().map(|task| task.id()).collect::<Vec<_>>(),
        wanted
    );
    assert!(Arc::ptr_eq(&loaded[1], &kept));
    assert_eq!(loaded[0].get(&conn, "title").unwrap(), string("#2"));
}
