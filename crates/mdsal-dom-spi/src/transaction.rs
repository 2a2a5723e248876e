//! Backend transaction contracts and commit completion plumbing.
//!
//! A backend chain hands out [`ReadWriteTransaction`]s and reports its own
//! fate through a [`TransactionChainListener`]. Commit completion is delivered
//! through a one-shot [`CommitCallback`]; frontends turn it into a shareable
//! [`CommitFuture`] with [`commit_promise`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::channel::oneshot;
use futures::future::{self, BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{DomError, DomResult};
use crate::types::{InstanceIdentifier, NormalizedNode};

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_CHAIN_ID: AtomicU64 = AtomicU64::new(1);

/// Transaction identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(u64);

impl TransactionId {
    /// Create a transaction ID from a raw value.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Allocate a process-unique transaction ID.
    pub fn next() -> Self {
        Self(NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw u64 value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn-{}", self.0)
    }
}

/// Transaction chain identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChainId(u64);

impl ChainId {
    /// Create a chain ID from a raw value.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Allocate a process-unique chain ID.
    pub fn next() -> Self {
        Self(NEXT_CHAIN_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw u64 value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chain-{}", self.0)
    }
}

/// Information about a successful commit.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommitInfo;

impl CommitInfo {
    /// Commit info carrying no details.
    pub fn empty() -> Self {
        Self
    }
}

/// Outcome of a commit.
pub type CommitResult = Result<CommitInfo, DomError>;

/// One-shot completion callback handed to a backend commit.
pub type CommitCallback = Box<dyn FnOnce(CommitResult) + Send + 'static>;

/// Shareable future resolving to a commit outcome.
pub type CommitFuture = Shared<BoxFuture<'static, CommitResult>>;

/// Completing side of a [`CommitFuture`].
pub struct CommitPromise {
    sender: Mutex<Option<oneshot::Sender<CommitResult>>>,
}

impl CommitPromise {
    /// Complete the future. Returns false if it was already completed.
    pub fn complete(&self, result: CommitResult) -> bool {
        match self.sender.lock().take() {
            Some(sender) => {
                // The receiving side may already be gone; nobody to tell then.
                let _ = sender.send(result);
                true
            }
            None => false,
        }
    }

    /// Whether the promise has been completed.
    pub fn is_completed(&self) -> bool {
        self.sender.lock().is_none()
    }
}

/// Create a linked promise/future pair.
pub fn commit_promise() -> (CommitPromise, CommitFuture) {
    let (sender, receiver) = oneshot::channel();
    let future = receiver
        .map(|outcome| {
            outcome.unwrap_or_else(|_| {
                Err(DomError::IllegalState(
                    "commit promise dropped without completion".to_string(),
                ))
            })
        })
        .boxed()
        .shared();
    (
        CommitPromise {
            sender: Mutex::new(Some(sender)),
        },
        future,
    )
}

/// A commit future that has already failed.
pub fn failed_commit(cause: DomError) -> CommitFuture {
    future::ready(Err(cause)).boxed().shared()
}

/// Read-write transaction provided by a backend store.
pub trait ReadWriteTransaction: Send + Sync {
    /// Backend transaction identifier.
    fn identifier(&self) -> TransactionId;

    /// Read the data at `path`, including this transaction's own writes.
    fn read(&self, path: &InstanceIdentifier) -> DomResult<Option<NormalizedNode>>;

    /// Whether data exists at `path`.
    fn exists(&self, path: &InstanceIdentifier) -> DomResult<bool> {
        Ok(self.read(path)?.is_some())
    }

    /// Replace the data at `path`.
    fn put(&self, path: &InstanceIdentifier, data: NormalizedNode) -> DomResult<()>;

    /// Merge `data` into whatever is at `path`.
    fn merge(&self, path: &InstanceIdentifier, data: NormalizedNode) -> DomResult<()>;

    /// Remove the data at `path`.
    fn delete(&self, path: &InstanceIdentifier) -> DomResult<()>;

    /// Cancel the transaction. Returns false if it can no longer be cancelled.
    fn cancel(&self) -> bool;

    /// Submit the transaction; `callback` runs exactly once with the outcome.
    fn commit(&self, callback: CommitCallback);
}

/// Backend transaction chain.
pub trait TransactionChain: Send + Sync {
    /// Chain identifier.
    fn identifier(&self) -> ChainId;

    /// Allocate the next transaction in the chain.
    fn new_read_write_transaction(&self) -> DomResult<Arc<dyn ReadWriteTransaction>>;

    /// Close the chain. Outstanding commits still complete; the chain listener
    /// is told about success once they have.
    fn close(&self);
}

/// Observer of a transaction chain's fate.
pub trait TransactionChainListener: Send + Sync {
    /// The chain failed; `transaction` is the implicated transaction, if known.
    fn on_transaction_chain_failed(
        &self,
        chain: ChainId,
        transaction: Option<TransactionId>,
        cause: &DomError,
    );

    /// The chain was closed and all of its transactions completed.
    fn on_transaction_chain_successful(&self, chain: ChainId);
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    #[test]
    fn test_identifier_display() {
        assert_eq!(TransactionId::new(5).to_string(), "txn-5");
        assert_eq!(ChainId::new(2).to_string(), "chain-2");
        assert_ne!(TransactionId::next(), TransactionId::next());
    }

    #[test]
    fn test_promise_completes_all_clones() {
        let (promise, future) = commit_promise();
        let other = future.clone();
        assert!(!promise.is_completed());
        assert!(promise.complete(Ok(CommitInfo::empty())));
        assert!(!promise.complete(Err(DomError::Unsupported("late".into()))));
        assert_eq!(block_on(future), Ok(CommitInfo::empty()));
        assert_eq!(block_on(other), Ok(CommitInfo::empty()));
    }

    #[test]
    fn test_dropped_promise_fails_future() {
        let (promise, future) = commit_promise();
        drop(promise);
        assert!(matches!(block_on(future), Err(DomError::IllegalState(_))));
    }

    #[test]
    fn test_failed_commit() {
        let cause = DomError::Cancelled(TransactionId::new(1));
        assert_eq!(block_on(failed_commit(cause.clone())), Err(cause));
    }
}
