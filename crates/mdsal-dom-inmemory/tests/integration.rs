//! End-to-end tests of ping-pong chains and sharded writes over the
//! in-memory store.

mod common;

use common::{container, leaf, path, ChainRecorder, ChangeRecorder};
use futures::executor::block_on;
use mdsal_dom_inmemory::{CommitMode, InMemoryDataStore, StoreConfig};
use mdsal_dom_spi::{
    DataTreeCandidate, DataTreeListener, DomError, ModificationType, NormalizedNode, PathArgument, SubtreeData, Value,
};
use parking_lot::Mutex;
use std::sync::Arc;

fn store(shards: &[&str]) -> InMemoryDataStore {
    let config = StoreConfig {
        shards: shards.iter().map(|s| s.to_string()).collect(),
        ..StoreConfig::default()
    };
    InMemoryDataStore::from_config(&config).unwrap()
}

#[test]
fn test_ping_pong_commits_in_order() {
    let store = store(&[]);
    let recorder = Arc::new(ChainRecorder::default());
    let chain = store.create_ping_pong_chain(recorder.clone());

    for value in 0..4 {
        let tx = chain.new_read_write_transaction().unwrap();
        tx.put(&path("/counter"), leaf("counter", value)).unwrap();
        assert_eq!(tx.read(&path("/counter")).unwrap(), Some(leaf("counter", value)));
        block_on(tx.commit()).unwrap();
    }
    assert_eq!(store.read(&path("/counter")).unwrap(), Some(leaf("counter", 3)));

    chain.close().unwrap();
    assert_eq!(recorder.successes(), 1);
    assert!(recorder.failures.lock().is_empty());
    assert!(matches!(
        chain.new_read_write_transaction(),
        Err(DomError::ChainShutdown { .. })
    ));
}

#[test]
fn test_ping_pong_cancel_keeps_chain_usable() {
    let store = store(&[]);
    let recorder = Arc::new(ChainRecorder::default());
    let chain = store.create_ping_pong_chain(recorder.clone());

    let mut tx = chain.new_read_write_transaction().unwrap();
    tx.put(&path("/a"), leaf("a", 1)).unwrap();
    assert!(tx.cancel());

    let tx = chain.new_read_write_transaction().unwrap();
    tx.put(&path("/b"), leaf("b", 2)).unwrap();
    block_on(tx.commit()).unwrap();

    assert!(store.read(&path("/a")).unwrap().is_none());
    assert_eq!(store.read(&path("/b")).unwrap(), Some(leaf("b", 2)));
    chain.close().unwrap();
    assert_eq!(recorder.successes(), 1);
}

#[tokio::test]
async fn test_ping_pong_batches_while_commit_in_flight() {
    let config = StoreConfig {
        commit_mode: CommitMode::Spawned,
        ..StoreConfig::default()
    };
    let store = InMemoryDataStore::from_config(&config).unwrap();
    let recorder = Arc::new(ChainRecorder::default());
    let chain = store.create_ping_pong_chain(recorder.clone());

    let first = chain.new_read_write_transaction().unwrap();
    first.put(&path("/a"), leaf("a", 1)).unwrap();
    let first = first.commit();

    // The worker has not run yet, so the first commit stays in flight and the
    // next two frontends share one backend transaction.
    let second = chain.new_read_write_transaction().unwrap();
    let batch = second.backend_identifier();
    second.put(&path("/a"), leaf("a", 2)).unwrap();
    let second = second.commit();

    let third = chain.new_read_write_transaction().unwrap();
    assert_eq!(third.backend_identifier(), batch);
    third.merge(&path("/b"), leaf("b", 3)).unwrap();
    let third = third.commit();

    first.await.unwrap();
    second.await.unwrap();
    third.await.unwrap();

    assert_eq!(store.read(&path("/a")).unwrap(), Some(leaf("a", 2)));
    assert_eq!(store.read(&path("/b")).unwrap(), Some(leaf("b", 3)));
    chain.close().unwrap();
    tokio::task::yield_now().await;
    assert!(recorder.failures.lock().is_empty());
}

#[test]
fn test_conflicting_writer_fails_ping_pong_chain() {
    let store = store(&[]);
    let recorder = Arc::new(ChainRecorder::default());
    let chain = store.create_ping_pong_chain(recorder.clone());

    let tx = chain.new_read_write_transaction().unwrap();
    tx.put(&path("/a"), leaf("a", 1)).unwrap();

    let mut other = store.root_shard().create_transaction(None).unwrap();
    other.write(&path("/a"), leaf("a", 9)).unwrap();
    other.submit().unwrap();

    let frontend = tx.identifier();
    assert!(matches!(
        block_on(tx.commit()),
        Err(DomError::OptimisticLockFailed { .. })
    ));
    let failures = recorder.failures.lock();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, Some(frontend));
    drop(failures);
    assert_eq!(store.read(&path("/a")).unwrap(), Some(leaf("a", 9)));
}

#[test]
fn test_sharded_write_notifies_child_listener() {
    let store = store(&["/network", "/network/topology"]);
    let listener = Arc::new(ChangeRecorder::default());
    let _registration = store
        .register_tree_change_listener(&path("/network/topology/nodes"), listener.clone())
        .unwrap();

    let chain = store.create_transaction_chain(Arc::new(ChainRecorder::default()));
    let tx = chain.new_read_write_transaction().unwrap();
    let topology = container("topology", vec![leaf("nodes", 3)]);
    tx.put(
        &path("/network"),
        container("network", vec![leaf("name", 1), topology]),
    )
    .unwrap();
    let outcome = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&outcome);
    tx.commit(Box::new(move |result| *sink.lock() = Some(result)));
    assert!(outcome.lock().take().unwrap().is_ok());

    let changes = listener.changes.lock();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].0, "/network/topology/nodes");
    assert_eq!(changes[0].1, ModificationType::Write);
    assert_eq!(changes[0].2, Some(leaf("nodes", 3)));
    drop(changes);

    let root = store.root_shard();
    let network = root.owning_child(&path("/network")).unwrap();
    let leaf_shard = network.owning_child(&path("/network/topology")).unwrap();
    assert_eq!(network.tree().read(&path("/name")), Some(leaf("name", 1)));
    assert!(network.tree().read(&path("/topology")).is_none());
    assert_eq!(leaf_shard.tree().read(&path("/nodes")), Some(leaf("nodes", 3)));
    assert_eq!(store.read(&path("/network/topology/nodes")).unwrap(), Some(leaf("nodes", 3)));
    chain.close();
}

#[derive(Default)]
struct SubtreeRecorder {
    batches: Mutex<Vec<(Vec<DataTreeCandidate>, SubtreeData)>>,
    failures: Mutex<Vec<DomError>>,
}

impl DataTreeListener for SubtreeRecorder {
    fn on_data_tree_changed(&self, changes: Vec<DataTreeCandidate>, subtrees: SubtreeData) {
        self.batches.lock().push((changes, subtrees));
    }

    fn on_data_tree_failed(&self, causes: Vec<DomError>) {
        self.failures.lock().extend(causes);
    }
}

#[test]
fn test_aggregated_listener_sees_initial_and_later_data() {
    let store = store(&["/b"]);
    let mut seed = store.root_shard().create_transaction(None).unwrap();
    seed.write(&path("/a"), leaf("a", 1)).unwrap();
    seed.submit().unwrap();

    let listener = Arc::new(SubtreeRecorder::default());
    let registration = store
        .register_listener(vec![path("/a"), path("/b/x")], listener.clone())
        .unwrap();
    {
        let batches = listener.batches.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].0.len(), 1);
        assert_eq!(batches[0].1.get(&path("/a")), Some(&leaf("a", 1)));
        assert!(!batches[0].1.contains_key(&path("/b/x")));
    }

    let mut tx = store.root_shard().create_transaction(None).unwrap();
    tx.write(&path("/b/x"), leaf("x", 5)).unwrap();
    tx.submit().unwrap();

    {
        let batches = listener.batches.lock();
        let (changes, subtrees) = batches.last().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(subtrees.get(&path("/a")), Some(&leaf("a", 1)));
        assert_eq!(subtrees.get(&path("/b/x")), Some(&leaf("x", 5)));
    }

    assert!(registration.close());
    let delivered = listener.batches.lock().len();
    let mut tx = store.root_shard().create_transaction(None).unwrap();
    tx.write(&path("/a"), leaf("a", 2)).unwrap();
    tx.submit().unwrap();
    assert_eq!(listener.batches.lock().len(), delivered);
    assert!(listener.failures.lock().is_empty());
}

#[test]
fn test_aggregated_listener_spanning_child_shard_fails() {
    let store = store(&["/b/c"]);
    let listener = Arc::new(SubtreeRecorder::default());
    let result = store.register_listener(vec![path("/a"), path("/b")], listener.clone());
    assert!(matches!(result, Err(DomError::Unsupported(_))));
    assert_eq!(listener.failures.lock().len(), 1);
    assert!(listener.batches.lock().is_empty());
}

fn counter(root: &NormalizedNode, name: &str) -> i64 {
    match root.find(&[PathArgument::node(name)]) {
        Some(NormalizedNode::Leaf {
            value: Value::Int(value),
            ..
        }) => *value,
        _ => -1,
    }
}

#[test]
fn test_concurrent_commits_reach_listener_in_commit_order() {
    const COMMITS: i64 = 500;
    let store = Arc::new(store(&[]));
    let recorder = Arc::new(ChangeRecorder::default());
    let registration = store
        .register_tree_change_listener(&path("/"), recorder.clone())
        .unwrap();

    let writers: Vec<_> = ["a", "b"]
        .into_iter()
        .map(|name| {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                let target = path(&format!("/{}", name));
                for value in 0..COMMITS {
                    let mut tx = store.root_shard().create_transaction(None).unwrap();
                    tx.write(&target, leaf(name, value)).unwrap();
                    tx.submit().unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    // The initial empty root, then one change per commit.
    let changes = recorder.changes.lock();
    assert_eq!(changes.len(), 2 * COMMITS as usize + 1);
    let mut last = (-1, -1);
    for (_, _, after) in changes.iter() {
        let after = after.as_ref().unwrap();
        let seen = (counter(after, "a"), counter(after, "b"));
        assert!(
            seen.0 >= last.0 && seen.1 >= last.1,
            "change {:?} delivered after {:?}",
            seen,
            last
        );
        last = seen;
    }
    assert_eq!(last, (COMMITS - 1, COMMITS - 1));
    drop(changes);
    registration.close();
}
