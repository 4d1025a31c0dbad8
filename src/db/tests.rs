use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::posting::DirectedEdge;
use crate::schema::SchemaDescriptor;
use crate::storage::{keys, KvStore, MemKvStore};
use crate::types::{Attr, Uid, UmbraError, Value, ValueType};

fn engine_with(kv: &Arc<MemKvStore>) -> Engine {
    Engine::open(Arc::clone(kv) as Arc<dyn KvStore>, EngineConfig::testing()).expect("open engine")
}

fn name() -> Attr {
    Attr::root("name")
}

#[test]
fn committed_values_survive_reopen() {
    let kv = Arc::new(MemKvStore::new());
    let commit_ts = {
        let engine = engine_with(&kv);
        engine
            .alter(&name(), SchemaDescriptor::new(ValueType::String).indexed(["exact"]))
            .expect("alter");
        let txn = engine.begin_txn();
        engine
            .mutate(txn, DirectedEdge::set(Uid(1), name(), "alice"))
            .expect("mutate");
        let commit_ts = engine.commit(txn).expect("commit");
        engine.close().expect("close");
        commit_ts
    };

    let engine = engine_with(&kv);
    assert!(engine.oracle().max_assigned() >= commit_ts);
    assert!(engine.schema_of(&name()).expect("schema").index);
    let reader = engine.begin_txn();
    let postings = engine.read_attr(&name(), Uid(1), reader).expect("read");
    assert_eq!(postings.len(), 1);
    assert_eq!(postings[0].value, Value::String("alice".into()));
    assert_eq!(engine.eq(&name(), "alice", reader).expect("eq"), vec![Uid(1)]);
}

#[test]
fn abort_discards_staged_writes() {
    let kv = Arc::new(MemKvStore::new());
    let engine = engine_with(&kv);
    engine
        .alter(&name(), SchemaDescriptor::new(ValueType::String))
        .expect("alter");
    let txn = engine.begin_txn();
    engine
        .mutate(txn, DirectedEdge::set(Uid(1), name(), "bob"))
        .expect("mutate");
    assert_eq!(engine.read_attr(&name(), Uid(1), txn).expect("own read").len(), 1);
    engine.abort(txn).expect("abort");
    assert!(matches!(engine.commit(txn), Err(UmbraError::TxnNotActive(_))));
    let reader = engine.begin_txn();
    assert!(engine.read_attr(&name(), Uid(1), reader).expect("read").is_empty());
}

#[test]
fn undeclared_predicate_is_rejected() {
    let kv = Arc::new(MemKvStore::new());
    let engine = engine_with(&kv);
    let txn = engine.begin_txn();
    let err = engine
        .mutate(txn, DirectedEdge::set(Uid(1), Attr::root("ghost"), "x"))
        .unwrap_err();
    assert!(matches!(err, UmbraError::SchemaViolation(_)));
}

#[test]
fn gc_folds_history_into_one_version() {
    let kv = Arc::new(MemKvStore::new());
    let engine = engine_with(&kv);
    engine
        .alter(&name(), SchemaDescriptor::new(ValueType::String))
        .expect("alter");
    for value in ["a", "b", "c"] {
        let txn = engine.begin_txn();
        engine
            .mutate(txn, DirectedEdge::set(Uid(1), name(), value))
            .expect("mutate");
        engine.commit(txn).expect("commit");
    }
    let key = keys::data_key(&name(), Uid(1));
    assert_eq!(kv.version_count(&key), 3);

    let stats = engine.run_gc().expect("gc");
    assert!(stats.lists_rolled_up >= 1);
    assert_eq!(kv.version_count(&key), 1);
    let reader = engine.begin_txn();
    let postings = engine.read(&key, reader).expect("read");
    assert_eq!(postings[0].value, Value::String("c".into()));
}

#[test]
fn stale_transactions_are_reclaimed() {
    let kv = Arc::new(MemKvStore::new());
    let engine = engine_with(&kv);
    let txn = engine.begin_txn();
    assert!(engine.abort_stale(Duration::from_secs(60)).is_empty());
    assert_eq!(engine.abort_stale(Duration::ZERO), vec![txn]);
    assert!(engine.abort_expired().is_empty());
    assert_eq!(engine.oracle().active_count(), 0);
}

#[test]
fn schema_text_declares_predicates() {
    let kv = Arc::new(MemKvStore::new());
    let engine = engine_with(&kv);
    engine
        .alter_schema_text("name: string @index(exact) .\nfriend: [uid] @reverse .")
        .expect("schema");
    assert!(engine.schema_of(&Attr::root("friend")).expect("friend").reverse);
    assert!(engine
        .alter_schema_text("age: int @index(exact) .")
        .is_err());
}
