//! Property-based tests of sharded writes against a model of the data.

mod common;

use common::{leaf, path};
use mdsal_dom_inmemory::{InMemoryDataStore, StoreConfig};
use proptest::prelude::*;
use std::collections::BTreeMap;

/// Leaves on both sides of the /top/inner shard boundary.
const LEAVES: [(&str, &str); 4] = [
    ("/top/a", "a"),
    ("/top/b", "b"),
    ("/top/inner/x", "x"),
    ("/top/inner/y", "y"),
];

#[derive(Clone, Debug)]
enum Op {
    Write(usize, i64),
    Delete(usize),
}

fn any_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..LEAVES.len(), any::<i64>()).prop_map(|(leaf, value)| Op::Write(leaf, value)),
        1 => (0..LEAVES.len()).prop_map(Op::Delete),
    ]
}

fn transactions() -> impl Strategy<Value = Vec<Vec<Op>>> {
    proptest::collection::vec(proptest::collection::vec(any_op(), 1..5), 1..12)
}

fn sharded_store() -> InMemoryDataStore {
    let config = StoreConfig {
        shards: vec!["/top/inner".to_string()],
        ..StoreConfig::default()
    };
    InMemoryDataStore::from_config(&config).unwrap()
}

proptest! {
    #[test]
    fn prop_reads_match_model(transactions in transactions()) {
        let store = sharded_store();
        let mut model: BTreeMap<usize, i64> = BTreeMap::new();

        for ops in &transactions {
            let mut tx = store.root_shard().create_transaction(None).unwrap();
            for op in ops {
                match *op {
                    Op::Write(index, value) => {
                        let (at, name) = LEAVES[index];
                        tx.write(&path(at), leaf(name, value)).unwrap();
                        model.insert(index, value);
                    }
                    Op::Delete(index) => {
                        tx.delete(&path(LEAVES[index].0)).unwrap();
                        model.remove(&index);
                    }
                }
            }
            tx.submit().unwrap();

            for (index, (at, name)) in LEAVES.iter().enumerate() {
                let expected = model.get(&index).map(|value| leaf(name, *value));
                prop_assert_eq!(store.read(&path(at)).unwrap(), expected);
            }
        }

        // Data below the child prefix lives only in the child shard.
        prop_assert!(store.root_shard().tree().read(&path("/top/inner")).is_none());
    }
}
