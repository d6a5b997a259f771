//! Integration tests for the identity-map session.

mod common;

use std::rc::Rc;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::{prepare, zoo_registry, TestBackend};
use mnemo_core::error::Error;
use mnemo_core::expr::{field, Expression, Row, Value};
use mnemo_core::session::{Related, Sandbox};
use mnemo_core::storage::{DiskBackend, MemoryBackend, Options, StorageBackend};

fn memory_sandbox() -> Sandbox {
    let registry = zoo_registry();
    let store = Arc::new(MemoryBackend::new(&Options::new()));
    prepare(store.as_ref(), &registry);
    Sandbox::new(store, registry)
}

fn add_zoo(sandbox: &Sandbox, name: &str) -> mnemo_core::session::SharedUnit {
    let mut zoo = sandbox.new_unit("Zoo").unwrap();
    zoo.set("name", name).unwrap();
    sandbox.memorize(zoo).unwrap()
}

fn add_animal(sandbox: &Sandbox, zoo_id: i64, name: &str, legs: i64) {
    let mut animal = sandbox.new_unit("Animal").unwrap();
    animal.set("zoo_id", zoo_id).unwrap();
    animal.set("name", name).unwrap();
    animal.set("legs", legs).unwrap();
    sandbox.memorize(animal).unwrap();
}

#[test]
fn test_identity_map_uniqueness() {
    let sandbox = memory_sandbox();
    add_zoo(&sandbox, "Wild Animal Park");

    let first = sandbox
        .unit("Zoo", &[("id", Value::Int(1))])
        .unwrap()
        .unwrap();
    let second = sandbox
        .unit("Zoo", &[("id", Value::Int(1))])
        .unwrap()
        .unwrap();
    assert!(Rc::ptr_eq(&first, &second));

    // A full recall hands back the very same instance, not an equal copy.
    let all = sandbox.recall_all("Zoo", None).unwrap();
    assert_eq!(all.len(), 1);
    assert!(Rc::ptr_eq(&first, &all[0]));
}

#[test]
fn test_resident_state_wins_over_stored_rows() {
    let sandbox = memory_sandbox();
    let zoo = add_zoo(&sandbox, "Old Name");

    // Mutate in memory without saving; the stored row still has the old
    // name, but recall must prefer the resident instance.
    zoo.borrow_mut().set("name", "New Name").unwrap();
    let all = sandbox.recall_all("Zoo", None).unwrap();
    assert_eq!(all[0].borrow().get_str("name").unwrap().unwrap(), "New Name");
}

#[test]
fn test_two_sandboxes_do_not_share_instances() {
    let registry = zoo_registry();
    let store: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new(&Options::new()));
    prepare(store.as_ref(), &registry);

    let one = Sandbox::new(store.clone(), registry.clone());
    add_zoo(&one, "Shared");
    one.flush_all().unwrap();

    let two = Sandbox::new(store, registry);
    let theirs = two.unit("Zoo", &[("id", Value::Int(1))]).unwrap().unwrap();
    let ours = one.unit("Zoo", &[("id", Value::Int(1))]).unwrap().unwrap();
    assert!(!Rc::ptr_eq(&ours, &theirs));
}

#[test]
fn test_round_trip_through_durable_store() {
    let dir = tempfile::tempdir().unwrap();
    let options = Options::new().with("path", dir.path().to_string_lossy());
    let registry = zoo_registry();

    {
        let store = Arc::new(DiskBackend::open(&options).unwrap());
        prepare(store.as_ref(), &registry);
        let sandbox = Sandbox::new(store, registry.clone());
        let mut zoo = sandbox.new_unit("Zoo").unwrap();
        zoo.set("name", "Roundtrip").unwrap();
        zoo.set("founded", chrono::NaiveDate::from_ymd_opt(1899, 3, 1).unwrap())
            .unwrap();
        sandbox.memorize(zoo).unwrap();
        sandbox.flush_all().unwrap();
        sandbox.store().shutdown().unwrap();
    }

    let store = Arc::new(DiskBackend::open(&options).unwrap());
    prepare(store.as_ref(), &registry);
    let sandbox = Sandbox::new(store, registry);
    let zoo = sandbox.unit("Zoo", &[("id", Value::Int(1))]).unwrap().unwrap();
    let unit = zoo.borrow();
    assert_eq!(unit.get_str("name").unwrap().unwrap(), "Roundtrip");
    assert_eq!(
        unit.get("founded").unwrap().as_date().unwrap(),
        chrono::NaiveDate::from_ymd_opt(1899, 3, 1).unwrap()
    );
    assert!(!unit.dirty());
}

#[test]
fn test_predicate_recall_matches_native_filtering() {
    let sandbox = memory_sandbox();
    add_zoo(&sandbox, "Park");
    add_animal(&sandbox, 1, "emu", 2);
    add_animal(&sandbox, 1, "spider", 8);
    add_animal(&sandbox, 1, "snake", 0);

    let expr = field("legs").gt(1).and_with(field("name").like("s%")).expr();
    let matched = sandbox.recall_all("Animal", Some(&expr)).unwrap();
    assert_eq!(matched.len(), 1);
    assert_eq!(
        matched[0].borrow().get_str("name").unwrap().unwrap(),
        "spider"
    );
}

#[test]
fn test_imperfect_expression_discards_overmatches() {
    let registry = zoo_registry();
    let terminal = Arc::new(MemoryBackend::new(&Options::new()));
    let store = Arc::new(TestBackend::approximate(terminal));
    prepare(store.as_ref(), &registry);
    let sandbox = Sandbox::new(store.clone(), registry);

    add_animal(&sandbox, 1, "emu", 2);
    add_animal(&sandbox, 1, "cat", 4);
    add_animal(&sandbox, 1, "dog", 4);
    // Drop residents so rows flow back through the raw-recall path.
    sandbox.purge("Animal");

    let divisible_by_four = Expression::opaque("legs % 4 == 0", |rows: &[&Row]| {
        mnemo_core::expr::get_field(rows[0], "legs")
            .and_then(Value::as_int)
            .map(|legs| legs % 4 == 0)
            .unwrap_or(false)
    });
    let expr = field("name").ne("dog").expr().and(divisible_by_four);
    assert!(!expr.is_perfect());

    // The backend's native filter only understands the perfect part: it
    // drops "dog" but over-matches "emu" (2 legs). The session re-applies
    // the original predicate and discards the over-match.
    let matched = sandbox.recall_all("Animal", Some(&expr)).unwrap();
    let names: Vec<String> = matched
        .iter()
        .map(|u| u.borrow().get_str("name").unwrap().unwrap())
        .collect();
    assert_eq!(names, ["cat"]);
}

#[test]
fn test_ambiguous_identity_is_a_backend_invariant_violation() {
    let registry = zoo_registry();
    let terminal = Arc::new(MemoryBackend::new(&Options::new()));
    let store = Arc::new(TestBackend::new(terminal));
    prepare(store.as_ref(), &registry);
    let sandbox = Sandbox::new(store.clone(), registry);

    add_zoo(&sandbox, "Park");
    sandbox.purge("Zoo");
    store.duplicate_rows.store(true, Ordering::SeqCst);

    let err = sandbox.unit("Zoo", &[("id", Value::Int(1))]).unwrap_err();
    assert!(matches!(err, Error::AmbiguousIdentity { .. }));
}

#[test]
fn test_relation_accessors() {
    let sandbox = memory_sandbox();
    let zoo = add_zoo(&sandbox, "Park");
    add_animal(&sandbox, 1, "emu", 2);
    add_animal(&sandbox, 1, "cat", 4);
    add_animal(&sandbox, 99, "stray", 4);

    // To-many side, unfiltered and filtered.
    let Related::Many(animals) = sandbox.related(&zoo, "animals", None).unwrap() else {
        panic!("expected a to-many accessor");
    };
    assert_eq!(animals.len(), 2);

    let Related::Many(bipeds) = sandbox
        .related(&zoo, "animals", Some(&field("legs").eq(2).expr()))
        .unwrap()
    else {
        panic!("expected a to-many accessor");
    };
    assert_eq!(bipeds.len(), 1);

    // To-one side from an animal back to its zoo: the resident instance.
    let emu = sandbox
        .unit("Animal", &[("name", Value::Str("emu".into()))])
        .unwrap()
        .unwrap();
    let Related::One(Some(home)) = sandbox.related(&emu, "animals", None).unwrap() else {
        panic!("expected the to-one side to resolve");
    };
    assert!(Rc::ptr_eq(&home, &zoo));

    // An animal pointing at a nonexistent zoo resolves to none.
    let stray = sandbox
        .unit("Animal", &[("name", Value::Str("stray".into()))])
        .unwrap()
        .unwrap();
    let Related::One(home) = sandbox.related(&stray, "animals", None).unwrap() else {
        panic!("expected the to-one side");
    };
    assert!(home.is_none());
}

#[test]
fn test_multirecall_prefers_resident_instances() {
    let sandbox = memory_sandbox();
    let zoo = add_zoo(&sandbox, "Park");
    add_animal(&sandbox, 1, "emu", 2);
    add_animal(&sandbox, 1, "cat", 4);

    let legs_filter = mnemo_core::expr::field_of(1, "legs")
        .lt(3)
        .expr_over(["zoo", "animal"]);
    let tuples = sandbox
        .multirecall(&["Zoo", "Animal"], Some(&legs_filter))
        .unwrap();
    assert_eq!(tuples.len(), 1);
    assert!(Rc::ptr_eq(&tuples[0][0], &zoo));
    assert_eq!(
        tuples[0][1].borrow().get_str("name").unwrap().unwrap(),
        "emu"
    );
}

#[test]
fn test_multirecall_needs_a_direct_association() {
    let sandbox = memory_sandbox();
    // Animal -> Animal is not associated.
    let err = sandbox.multirecall(&["Animal", "Animal"], None).unwrap_err();
    assert!(matches!(err, Error::NoPath { .. }));
}

#[test]
fn test_flush_all_aggregates_failures() {
    let registry = zoo_registry();
    let terminal = Arc::new(MemoryBackend::new(&Options::new()));
    let store = Arc::new(TestBackend::new(terminal));
    prepare(store.as_ref(), &registry);
    let sandbox = Sandbox::new(store.clone(), registry);

    let a = add_zoo(&sandbox, "One");
    let b = add_zoo(&sandbox, "Two");
    a.borrow_mut().set("name", "One!").unwrap();
    b.borrow_mut().set("name", "Two!").unwrap();

    store.fail_saves.store(true, Ordering::SeqCst);
    let err = sandbox.flush_all().unwrap_err();
    let Error::Flush(report) = err else {
        panic!("expected an aggregated flush error");
    };
    assert_eq!(report.failures.len(), 2);

    // Both units stay dirty so the flush can be retried.
    assert!(a.borrow().dirty());
    assert!(b.borrow().dirty());

    store.fail_saves.store(false, Ordering::SeqCst);
    sandbox.flush_all().unwrap();
    assert!(!a.borrow().dirty());
    assert!(!b.borrow().dirty());
}

#[test]
fn test_distinct_and_count_bypass_the_map() {
    let sandbox = memory_sandbox();
    add_zoo(&sandbox, "Park");
    add_animal(&sandbox, 1, "emu", 2);
    add_animal(&sandbox, 1, "cat", 4);
    add_animal(&sandbox, 1, "dog", 4);

    let legs = sandbox.distinct("Animal", &["legs"], None).unwrap();
    assert_eq!(legs.len(), 2);

    assert_eq!(sandbox.count("Animal", None).unwrap(), 3);
    assert_eq!(
        sandbox
            .count("Animal", Some(&field("legs").eq(4).expr()))
            .unwrap(),
        2
    );
}

#[test]
fn test_recall_restarts_on_reinvocation() {
    let sandbox = memory_sandbox();
    add_zoo(&sandbox, "Park");
    add_animal(&sandbox, 1, "emu", 2);

    let first: Vec<_> = sandbox.recall("Animal", None).unwrap().collect();
    add_animal(&sandbox, 1, "cat", 4);
    let second: Vec<_> = sandbox.recall("Animal", None).unwrap().collect();
    assert_eq!(first.len(), 1);
    assert_eq!(second.len(), 2);
}
