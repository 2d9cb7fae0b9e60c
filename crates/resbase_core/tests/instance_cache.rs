use resbase_core::db::{open_db, open_db_in_memory};
use resbase_core::handler::{AttributeHandlerRegistry, HandlerContext};
use resbase_core::repo::cache::PRUNE_INTERVAL;
use resbase_core::{
    AttributeSpec, AttributeValue, CacheStats, NewResource, RawValue, ResourceRepository,
    ResourceService, SchemaService, StorageKind,
};
use rusqlite::Connection;
use std::sync::Arc;
use std::thread;

fn setup() -> (Connection, ResourceRepository) {
    let conn = open_db_in_memory().unwrap();
    let repository = define_classes(&conn);
    (conn, repository)
}

fn define_classes(conn: &Connection) -> ResourceRepository {
    let registry = AttributeHandlerRegistry::builtin(HandlerContext::default());
    let repository = ResourceRepository::open(conn, &registry, false).unwrap();
    let schema = SchemaService::new(conn, &repository);
    schema
        .define_class("note", &[], StorageKind::Table, false)
        .unwrap();
    schema
        .add_attribute("note", AttributeSpec::new("title", "string"), RawValue::Null)
        .unwrap();
    schema
        .define_class("memo", &["note"], StorageKind::Dynamic, false)
        .unwrap();
    schema
        .add_attribute("memo", AttributeSpec::new("urgent", "boolean"), RawValue::Null)
        .unwrap();
    repository
}

fn title(value: &str) -> Option<AttributeValue> {
    Some(AttributeValue::String(value.to_string()))
}

#[test]
fn bulk_revert_reads_do_not_grow_with_instance_count() {
    let (conn, repository) = setup();
    let service = ResourceService::new(&conn, &repository);
    let first = service
        .create(NewResource::new("note", "one").value("title", "1"))
        .unwrap();

    let single = service.revert_class("note").unwrap();

    let second = service
        .create(NewResource::new("note", "two").value("title", "2"))
        .unwrap();
    let double = service.revert_class("note").unwrap();

    assert_eq!(single.reverted, 1);
    assert_eq!(double.reverted, 2);
    assert_eq!(single.reads, double.reads);
    assert_eq!(first.get(&conn, "title").unwrap(), title("1"));
    assert_eq!(second.get(&conn, "title").unwrap(), title("2"));
}

#[test]
fn bulk_revert_covers_descendant_classes() {
    let (conn, repository) = setup();
    let service = ResourceService::new(&conn, &repository);
    let note = service
        .create(NewResource::new("note", "plain").value("title", "kept"))
        .unwrap();
    let memo = service
        .create(
            NewResource::new("memo", "urgent")
                .value("title", "also kept")
                .value("urgent", true),
        )
        .unwrap();
    note.set(&conn, "title", "scratch").unwrap();
    memo.set(&conn, "urgent", false).unwrap();

    let report = service.revert_class("note").unwrap();

    assert_eq!(report.reverted, 2);
    assert_eq!(report.evicted, 0);
    assert!(!note.is_modified());
    assert!(!memo.is_modified());
    assert_eq!(note.get(&conn, "title").unwrap(), title("kept"));
    assert_eq!(
        memo.get(&conn, "urgent").unwrap(),
        Some(AttributeValue::Boolean(true))
    );

    let memo_only = service.revert_class("memo").unwrap();
    assert_eq!(memo_only.reverted, 1);
}

#[test]
fn bulk_revert_evicts_instances_deleted_underneath() {
    let (conn, repository) = setup();
    let service = ResourceService::new(&conn, &repository);
    let doomed = service
        .create(NewResource::new("note", "doomed").value("title", "x"))
        .unwrap();
    let survivor = service
        .create(NewResource::new("note", "survivor").value("title", "y"))
        .unwrap();
    conn.execute("DELETE FROM resources WHERE id = ?1;", [doomed.id().get()])
        .unwrap();

    let report = service.revert_class("note").unwrap();

    assert_eq!(report.reverted, 1);
    assert_eq!(report.evicted, 1);
    assert!(doomed.is_deleted());
    assert!(!survivor.is_deleted());
    assert!(repository.find(doomed.id()).is_none());
    assert!(service.revert(&doomed).unwrap_err().is_not_found());
}

#[test]
fn dropped_instances_leave_dead_entries_until_pruned() {
    let (conn, repository) = setup();
    let service = ResourceService::new(&conn, &repository);
    let kept = service
        .create(NewResource::new("note", "kept").value("title", "k"))
        .unwrap();
    for n in 0..2 {
        service
            .create(NewResource::new("memo", format!("gone {n}")).value("title", "g"))
            .unwrap();
    }

    assert_eq!(
        repository.cache().stats(),
        CacheStats {
            classes: 2,
            live: 1,
            dead: 2
        }
    );
    assert_eq!(repository.cache().prune(), 2);
    assert_eq!(
        repository.cache().stats(),
        CacheStats {
            classes: 2,
            live: 1,
            dead: 0
        }
    );
    assert!(repository.find(kept.id()).is_some());
}

#[test]
fn reloaded_instance_replaces_a_dropped_one() {
    let (conn, repository) = setup();
    let service = ResourceService::new(&conn, &repository);
    let id = service
        .create(NewResource::new("note", "transient").value("title", "t"))
        .unwrap()
        .id();
    assert!(repository.find(id).is_none());

    let reloaded = service.retrieve(id).unwrap();

    assert!(repository.find(id).is_some());
    assert_eq!(repository.cache().stats().live, 1);
    assert_eq!(reloaded.get(&conn, "title").unwrap(), title("t"));
}

#[test]
fn concurrent_loads_of_one_id_share_a_single_instance() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.db");
    let conn = open_db(&path).unwrap();
    let repository = define_classes(&conn);
    let id = ResourceService::new(&conn, &repository)
        .create(NewResource::new("note", "contended").value("title", "c"))
        .unwrap()
        .id();
    assert!(repository.find(id).is_none());

    let loaded: Vec<_> = thread::scope(|scope| {
        let workers: Vec<_> = (0..8)
            .map(|_| {
                scope.spawn(|| {
                    let conn = open_db(&path).unwrap();
                    repository.retrieve(&conn, id).unwrap()
                })
            })
            .collect();
        workers.into_iter().map(|worker| worker.join().unwrap()).collect()
    });

    assert!(loaded.iter().all(|resource| Arc::ptr_eq(resource, &loaded[0])));
    assert_eq!(repository.cache().stats().live, 1);
    assert!(Arc::ptr_eq(&repository.find(id).unwrap(), &loaded[0]));
}

#[test]
fn looking_up_a_dropped_instance_forgets_it() {
    let (conn, repository) = setup();
    let service = ResourceService::new(&conn, &repository);
    let id = service
        .create(NewResource::new("note", "fleeting").value("title", "f"))
        .unwrap()
        .id();
    assert_eq!(repository.cache().tracked(), 1);

    assert!(repository.find(id).is_none());

    assert_eq!(repository.cache().tracked(), 0);
    assert_eq!(repository.cache().stats().dead, 0);
}

#[test]
fn churn_does_not_grow_the_cache_without_bound() {
    let (conn, repository) = setup();
    let service = ResourceService::new(&conn, &repository);
    let kept = service
        .create(NewResource::new("note", "kept").value("title", "k"))
        .unwrap();

    for n in 0..PRUNE_INTERVAL * 3 {
        service
            .create(NewResource::new("note", format!("churn {n}")).value("title", "x"))
            .unwrap();
    }

    let stats = repository.cache().stats();
    assert_eq!(stats.live, 1);
    assert!(stats.dead < PRUNE_INTERVAL, "dead entries: {}", stats.dead);
    assert!(repository.cache().tracked() <= PRUNE_INTERVAL);
    assert!(Arc::ptr_eq(&repository.find(kept.id()).unwrap(), &kept));
}
