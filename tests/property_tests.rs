mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use proptest::prelude::*;
use umbra::storage::KvStore;
use umbra::tok::TokenizerRegistry;
use umbra::{
    Attr, DirectedEdge, Engine, EngineConfig, SchemaDescriptor, Ts, Uid, Value, ValueType,
};

use common::{commit_edges, open_with_schema};

const VALUES: [&str; 4] = ["red", "green", "blue", "Red"];

#[derive(Debug, Clone)]
enum Operation {
    Set { entity: u64, value: usize },
    Del { entity: u64, value: usize },
    DelAll { entity: u64 },
}

fn arb_operation() -> impl Strategy<Value = Operation> {
    prop_oneof![
        4 => (1u64..=4, 0..VALUES.len()).prop_map(|(entity, value)| Operation::Set { entity, value }),
        2 => (1u64..=4, 0..VALUES.len()).prop_map(|(entity, value)| Operation::Del { entity, value }),
        1 => (1u64..=4).prop_map(|entity| Operation::DelAll { entity }),
    ]
}

fn colour() -> Attr {
    Attr::root("colour")
}

fn token(registry: &TokenizerRegistry, value: Value, tokenizer: &str) -> Vec<u8> {
    let tokens = registry.tokenize(&value, "", tokenizer).expect("tokenize");
    assert_eq!(tokens.len(), 1);
    tokens[0].clone()
}

/// Checks every entity and every value against the model at `read_ts`.
fn assert_matches_model(
    engine: &Engine,
    model: &BTreeMap<u64, &'static str>,
    read_ts: Ts,
) -> Result<(), TestCaseError> {
    for entity in 1..=4u64 {
        let postings = engine
            .read_attr(&colour(), Uid(entity), read_ts)
            .expect("read");
        prop_assert!(postings.len() <= 1, "scalar entity {} holds {:?}", entity, postings);
        let stored = postings.first().map(|p| p.value.clone());
        let expected = model.get(&entity).map(|v| Value::String((*v).to_owned()));
        prop_assert_eq!(stored, expected);
    }
    for value in VALUES {
        let mut found = engine.eq(&colour(), value, read_ts).expect("eq");
        found.sort();
        let expected: Vec<Uid> = model
            .iter()
            .filter(|(_, v)| **v == value)
            .map(|(e, _)| Uid(*e))
            .collect();
        prop_assert_eq!(found, expected);
    }
    Ok(())
}

proptest! {
    #[test]
    fn prop_int_tokens_preserve_order(a in any::<i64>(), b in any::<i64>()) {
        let registry = TokenizerRegistry::with_builtins();
        let ta = token(&registry, Value::Int(a), "int");
        let tb = token(&registry, Value::Int(b), "int");
        prop_assert_eq!(a.cmp(&b), ta.cmp(&tb));
    }

    #[test]
    fn prop_int_tokens_order_across_zero(a in i64::MIN..0, b in 0..i64::MAX) {
        let registry = TokenizerRegistry::with_builtins();
        prop_assert!(token(&registry, Value::Int(a), "int") < token(&registry, Value::Int(b), "int"));
    }

    #[test]
    fn prop_float_tokens_are_monotone(a in -1.0e15f64..1.0e15, b in -1.0e15f64..1.0e15) {
        let registry = TokenizerRegistry::with_builtins();
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(token(&registry, Value::Float(lo), "float") <= token(&registry, Value::Float(hi), "float"));
    }

    #[test]
    fn prop_exact_tokens_are_lossless(a in "[a-zA-Z ]{0,12}", b in "[a-zA-Z ]{0,12}") {
        let registry = TokenizerRegistry::with_builtins();
        let ta = token(&registry, Value::Default(a.clone()), "exact");
        let tb = token(&registry, Value::Default(b.clone()), "exact");
        prop_assert_eq!(a == b, ta == tb);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_any_sequence_matches_the_model(ops in prop::collection::vec(arb_operation(), 1..40)) {
        let (kv, engine) = open_with_schema(
            &colour(),
            SchemaDescriptor::new(ValueType::String).indexed(["exact"]),
        );
        let mut model: BTreeMap<u64, &'static str> = BTreeMap::new();

        for op in &ops {
            let edge = match *op {
                Operation::Set { entity, value } => {
                    model.insert(entity, VALUES[value]);
                    DirectedEdge::set(Uid(entity), colour(), VALUES[value])
                }
                Operation::Del { entity, value } => {
                    if model.get(&entity) == Some(&VALUES[value]) {
                        model.remove(&entity);
                    }
                    DirectedEdge::del(Uid(entity), colour(), VALUES[value])
                }
                Operation::DelAll { entity } => {
                    model.remove(&entity);
                    DirectedEdge::del_all(Uid(entity), colour())
                }
            };
            commit_edges(&engine, vec![edge]).expect("sequential commit");
        }

        let reader = engine.begin_txn();
        assert_matches_model(&engine, &model, reader)?;
        engine.abort(reader).expect("abort reader");
        engine.close().expect("close");

        let reopened = Engine::open(Arc::clone(&kv) as Arc<dyn KvStore>, EngineConfig::testing())
            .expect("reopen");
        let reader = reopened.begin_txn();
        assert_matches_model(&reopened, &model, reader)?;
    }
}
