//! Flush ordering constraints, with and without unrelated dirty objects.

mod common;

use common::{Person, store};
use proptest::prelude::*;
use tessera::{Handle, Store, StoreErrorKind, Value};

fn new_person(store: &mut Store, id: i64) -> Handle {
    let handle = store.create::<Person>().unwrap();
    store.set_value(handle, "id", id).unwrap();
    store.set_value(handle, "name", format!("p{id}")).unwrap();
    store.set_value(handle, "age", id).unwrap();
    handle
}

/// Ids of inserted rows, in execution order.
fn inserted_ids(executed: &[(String, Vec<Value>)]) -> Vec<i64> {
    executed
        .iter()
        .filter(|(sql, _)| sql.starts_with("INSERT INTO person"))
        .filter_map(|(_, params)| params[1].as_i64())
        .collect()
}

#[test]
fn declared_order_wins_over_insertion_order() {
    let (mut store, db) = store();
    let first = new_person(&mut store, 1);
    let noise = new_person(&mut store, 2);
    let last = new_person(&mut store, 3);
    for handle in [first, noise, last] {
        store.add(handle).unwrap();
    }
    store.add_flush_order(last, first).unwrap();
    store.flush().unwrap();

    let ids = inserted_ids(&db.executed());
    assert_eq!(ids.len(), 3);
    let pos = |id| ids.iter().position(|&i| i == id).unwrap();
    assert!(pos(3) < pos(1));
}

#[test]
fn cycles_raise_order_loop() {
    let (mut store, db) = store();
    let a = new_person(&mut store, 1);
    let b = new_person(&mut store, 2);
    let c = new_person(&mut store, 3);
    for handle in [a, b, c] {
        store.add(handle).unwrap();
    }
    store.add_flush_order(a, b).unwrap();
    store.add_flush_order(b, c).unwrap();
    store.add_flush_order(c, a).unwrap();

    let err = store.flush().unwrap_err();
    assert_eq!(err.store_kind(), Some(StoreErrorKind::OrderLoop));
    assert!(db.statements().is_empty());

    store.remove_flush_order(c, a);
    store.flush().unwrap();
    assert_eq!(inserted_ids(&db.executed()), vec![1, 2, 3]);
}

#[test]
fn order_between_clean_objects_is_ignored() {
    let (mut store, db) = store();
    let a = new_person(&mut store, 1);
    let b = new_person(&mut store, 2);
    store.add(a).unwrap();
    store.add(b).unwrap();
    store.flush().unwrap();

    store.add_flush_order(b, a).unwrap();
    store.add_flush_order(a, b).unwrap();
    db.clear();
    store.flush().unwrap();
    assert!(db.statements().is_empty());
}

/// A permutation of `0..n` plus edges that respect it, so the constraint
/// graph is acyclic.
fn dag() -> impl Strategy<Value = (Vec<usize>, Vec<(usize, usize)>)> {
    (2usize..8).prop_flat_map(|n| {
        let permutation = Just((0..n).collect::<Vec<_>>()).prop_shuffle();
        let edges = prop::collection::vec((0..n, 0..n), 0..12);
        (permutation, edges).prop_map(|(permutation, edges)| {
            let edges = edges
                .into_iter()
                .filter(|(a, b)| a != b)
                .map(|(a, b)| {
                    let (pa, pb) = (permutation[a], permutation[b]);
                    if pa < pb { (a, b) } else { (b, a) }
                })
                .collect();
            (permutation, edges)
        })
    })
}

proptest! {
    #[test]
    fn every_declared_order_is_honored((permutation, edges) in dag()) {
        let (mut store, db) = store();
        let handles: Vec<Handle> = (0..permutation.len())
            .map(|i| new_person(&mut store, i as i64 + 1))
            .collect();
        for &handle in &handles {
            store.add(handle).unwrap();
        }
        for &(before, after) in &edges {
            store.add_flush_order(handles[before], handles[after]).unwrap();
        }
        store.flush().unwrap();

        let ids = inserted_ids(&db.executed());
        prop_assert_eq!(ids.len(), handles.len());
        let pos = |index: usize| ids.iter().position(|&id| id == index as i64 + 1);
        for &(before, after) in &edges {
            prop_assert!(pos(before) < pos(after));
        }
    }
}
