#![forbid(unsafe_code)]

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use umbra::storage::{KvStore, MemKvStore};
use umbra::tok::TokenizerRegistry;
use umbra::{Attr, DirectedEdge, Engine, EngineConfig, SchemaDescriptor, Uid, Value, ValueType};

const ENTITY_COUNT: u64 = 4_096;
const VALUE_DOMAIN: i64 = 1_000;
const SENTENCE: &str = "The quick brown foxes were jumping over the lazy dogs by the river";

fn tokenizers(c: &mut Criterion) {
    let mut group = c.benchmark_group("tok");
    let registry = TokenizerRegistry::with_builtins();
    let text = Value::Default(SENTENCE.to_owned());

    group.throughput(Throughput::Elements(1));
    for name in ["exact", "term", "fulltext", "trigram", "hash"] {
        group.bench_function(name, |b| {
            b.iter(|| black_box(registry.tokenize(&text, "en", name).expect("tokenize")));
        });
    }
    group.bench_function("int", |b| {
        let mut n = 0i64;
        b.iter(|| {
            n = n.wrapping_add(7919);
            black_box(registry.tokenize(&Value::Int(n), "", "int").expect("tokenize"))
        });
    });
    group.finish();
}

fn commit_path(c: &mut Criterion) {
    let mut group = c.benchmark_group("commit");
    group.sample_size(40);
    let mut harness = CommitHarness::new(ENTITY_COUNT, VALUE_DOMAIN);

    group.throughput(Throughput::Elements(1));
    group.bench_function("scalar_overwrite", |b| {
        b.iter(|| black_box(harness.overwrite_one()));
    });

    group.throughput(Throughput::Elements(16));
    group.bench_function("batch_of_16", |b| {
        b.iter(|| black_box(harness.overwrite_batch(16)));
    });

    group.throughput(Throughput::Elements(1));
    group.bench_function("eq_lookup", |b| {
        b.iter(|| black_box(harness.eq_lookup()));
    });

    group.finish();
}

struct CommitHarness {
    engine: Engine,
    attr: Attr,
    entities: u64,
    domain: i64,
    rng: ChaCha8Rng,
}

impl CommitHarness {
    fn new(entities: u64, domain: i64) -> Self {
        let kv: Arc<dyn KvStore> = Arc::new(MemKvStore::new());
        let engine = Engine::open(kv, EngineConfig::default()).expect("engine");
        let attr = Attr::root("score");
        engine
            .alter(
                &attr,
                SchemaDescriptor::new(ValueType::Int).indexed(["int"]),
            )
            .expect("schema");
        let mut rng = ChaCha8Rng::seed_from_u64(0xC0FFEE);
        for chunk in (1..=entities).collect::<Vec<_>>().chunks(256) {
            let txn = engine.begin_txn();
            for &entity in chunk {
                let score = rng.gen_range(0..domain);
                engine
                    .mutate(txn, DirectedEdge::set(Uid(entity), attr.clone(), score))
                    .expect("mutate");
            }
            engine.commit(txn).expect("commit");
        }
        Self {
            engine,
            attr,
            entities,
            domain,
            rng,
        }
    }

    fn overwrite_one(&mut self) -> u64 {
        self.overwrite_batch(1)
    }

    fn overwrite_batch(&mut self, size: usize) -> u64 {
        let txn = self.engine.begin_txn();
        for _ in 0..size {
            let entity = Uid(self.rng.gen_range(1..=self.entities));
            let score = self.rng.gen_range(0..self.domain);
            self.engine
                .mutate(txn, DirectedEdge::set(entity, self.attr.clone(), score))
                .expect("mutate");
        }
        self.engine.commit(txn).expect("commit")
    }

    fn eq_lookup(&mut self) -> usize {
        let target = self.rng.gen_range(0..self.domain);
        let read = self.engine.begin_txn();
        let rows = self.engine.eq(&self.attr, target, read).expect("eq");
        self.engine.abort(read).expect("abort");
        rows.len()
    }
}

criterion_group!(benches, tokenizers, commit_path);
criterion_main!(benches);
