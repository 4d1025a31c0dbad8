#![allow(dead_code)]

use std::ops::ControlFlow;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;
use umbra::storage::{KvStore, MemKvStore};
use umbra::{Attr, DirectedEdge, Engine, EngineConfig, Result, SchemaDescriptor, Ts};

/// Installs a test subscriber honouring `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn open() -> (Arc<MemKvStore>, Engine) {
    init_tracing();
    let kv = Arc::new(MemKvStore::new());
    let engine = Engine::open(Arc::clone(&kv) as Arc<dyn KvStore>, EngineConfig::testing())
        .expect("open engine");
    (kv, engine)
}

pub fn open_with_schema(attr: &Attr, schema: SchemaDescriptor) -> (Arc<MemKvStore>, Engine) {
    let (kv, engine) = open();
    engine.alter(attr, schema).expect("declare schema");
    (kv, engine)
}

/// Runs `edges` in one transaction.
pub fn commit_edges(engine: &Engine, edges: Vec<DirectedEdge>) -> Result<Ts> {
    let txn = engine.begin_txn();
    for edge in edges {
        if let Err(err) = engine.mutate(txn, edge) {
            engine.abort(txn)?;
            return Err(err);
        }
    }
    engine.commit(txn)
}

/// Live keys and record bytes under `prefix` at the newest version.
pub fn live_entries(kv: &MemKvStore, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut out = Vec::new();
    kv.scan(prefix, Ts::MAX, &mut |key, _, record| {
        if !record.is_empty_marker() {
            out.push((key.to_vec(), record.value.clone()));
        }
        Ok(ControlFlow::Continue(()))
    })
    .expect("scan");
    out
}

/// Keys under `prefix` whose posting list is non-empty at `read_ts`.
pub fn nonempty_keys(engine: &Engine, kv: &MemKvStore, prefix: &[u8], read_ts: Ts) -> Vec<Vec<u8>> {
    let mut keys = Vec::new();
    kv.scan(prefix, read_ts, &mut |key, _, _| {
        keys.push(key.to_vec());
        Ok(ControlFlow::Continue(()))
    })
    .expect("scan");
    keys.into_iter()
        .filter(|key| !engine.read(key, read_ts).expect("read").is_empty())
        .collect()
}
