//! Shared fixtures for the in-memory store integration tests.

#![allow(dead_code)]

use mdsal_dom_spi::{
    ChainId, DataTreeCandidate, DataTreeChangeListener, DomError, InstanceIdentifier, ModificationType,
    NormalizedNode, PathArgument, TransactionChainListener, TransactionId,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

pub fn path(text: &str) -> InstanceIdentifier {
    text.parse().unwrap()
}

pub fn leaf(name: &str, value: i64) -> NormalizedNode {
    NormalizedNode::leaf(PathArgument::node(name), value)
}

pub fn container(name: &str, children: Vec<NormalizedNode>) -> NormalizedNode {
    NormalizedNode::container(PathArgument::node(name), children)
}

/// Records what a chain reports.
#[derive(Default)]
pub struct ChainRecorder {
    pub failures: Mutex<Vec<(Option<TransactionId>, DomError)>>,
    successes: AtomicUsize,
}

impl ChainRecorder {
    pub fn successes(&self) -> usize {
        self.successes.load(Ordering::SeqCst)
    }
}

impl TransactionChainListener for ChainRecorder {
    fn on_transaction_chain_failed(&self, _chain: ChainId, transaction: Option<TransactionId>, cause: &DomError) {
        self.failures.lock().push((transaction, cause.clone()));
    }

    fn on_transaction_chain_successful(&self, _chain: ChainId) {
        self.successes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Records every change delivered, with the data after it.
#[derive(Default)]
pub struct ChangeRecorder {
    pub changes: Mutex<Vec<(String, ModificationType, Option<NormalizedNode>)>>,
}

impl DataTreeChangeListener for ChangeRecorder {
    fn on_data_tree_changed(&self, changes: Vec<DataTreeCandidate>) {
        let mut recorded = self.changes.lock();
        for change in changes {
            let node = change.root_node();
            recorded.push((
                change.root_path().to_string(),
                node.modification_type(),
                node.data_after().cloned(),
            ));
        }
    }
}
