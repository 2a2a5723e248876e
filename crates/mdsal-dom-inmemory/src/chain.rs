//! Backend transaction chain over an in-memory shard.
//!
//! Transactions of one chain are based on the committed state and never
//! conflict with each other; their writes are replayed in commit order.
//! Commits run either on the submitting thread or, one at a time and in
//! submission order, on a tokio worker owned by the chain.

use std::fmt;
use std::sync::{Arc, Weak};

use mdsal_dom_spi::{
    ChainId, CommitCallback, CommitInfo, DomError, DomResult, InstanceIdentifier, NormalizedNode, ReadWriteTransaction,
    ShardWriteTransaction, TransactionChain, TransactionChainListener, TransactionId,
};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::shard::InMemoryDataTreeShard;
use crate::write_transaction::InMemoryShardWriteTransaction;

/// Where chain commits run.
#[derive(Clone, Debug, Default)]
pub enum CommitExecutor {
    /// On the thread calling `commit`, completing before it returns.
    #[default]
    Inline,
    /// On a worker task spawned on this runtime.
    Spawned(Handle),
}

struct CommitJob {
    tx: InMemoryShardWriteTransaction,
    callback: CommitCallback,
}

enum Submitter {
    Inline,
    Queue(mpsc::UnboundedSender<CommitJob>),
}

#[derive(Default)]
struct ChainState {
    closed: bool,
    failed: bool,
    reported: bool,
    outstanding: usize,
}

struct ChainInner {
    id: ChainId,
    shard: Arc<InMemoryDataTreeShard>,
    listener: Arc<dyn TransactionChainListener>,
    submitter: Submitter,
    state: Mutex<ChainState>,
}

impl ChainInner {
    fn allocate(self: &Arc<Self>) -> DomResult<Arc<dyn ReadWriteTransaction>> {
        {
            let mut state = self.state.lock();
            if state.failed {
                return Err(DomError::ChainFailed {
                    chain: self.id,
                    reason: "an earlier transaction failed".to_string(),
                });
            }
            if state.closed {
                return Err(DomError::ChainShutdown { chain: self.id });
            }
            state.outstanding += 1;
        }

        match self.shard.create_transaction(Some(self.id)) {
            Ok(tx) => {
                debug!("Chain {} allocated transaction {}", self.id, tx.identifier());
                Ok(Arc::new(InMemoryReadWriteTransaction {
                    id: tx.identifier(),
                    chain: Arc::clone(self),
                    tx: Mutex::new(TxSlot::Open(tx)),
                }))
            }
            Err(e) => {
                self.finished();
                Err(e)
            }
        }
    }

    fn submit(self: &Arc<Self>, tx: InMemoryShardWriteTransaction, callback: CommitCallback) {
        match &self.submitter {
            Submitter::Inline => self.execute(CommitJob { tx, callback }),
            Submitter::Queue(queue) => {
                if let Err(mpsc::error::SendError(job)) = queue.send(CommitJob { tx, callback }) {
                    warn!("Commit worker of chain {} is gone, committing inline", self.id);
                    self.execute(job);
                }
            }
        }
    }

    fn execute(&self, job: CommitJob) {
        let CommitJob { mut tx, callback } = job;
        let id = tx.identifier();
        match tx.submit() {
            Ok(()) => {
                callback(Ok(CommitInfo::empty()));
                self.finished();
            }
            Err(e) => {
                error!("Chain {} failed committing transaction {}: {}", self.id, id, e);
                // The listener hears of the failure while the transaction is
                // still the one in flight.
                self.failed(Some(id), &e);
                callback(Err(e));
            }
        }
    }

    /// A transaction was committed or cancelled.
    fn finished(&self) {
        let report = {
            let mut state = self.state.lock();
            state.outstanding = state.outstanding.saturating_sub(1);
            self.take_success_report(&mut state)
        };
        if report {
            info!("Chain {} completed successfully", self.id);
            self.listener.on_transaction_chain_successful(self.id);
        }
    }

    fn failed(&self, transaction: Option<TransactionId>, cause: &DomError) {
        {
            let mut state = self.state.lock();
            state.outstanding = state.outstanding.saturating_sub(1);
            if state.failed || state.reported {
                return;
            }
            state.failed = true;
            state.reported = true;
        }
        self.listener.on_transaction_chain_failed(self.id, transaction, cause);
    }

    fn close(&self) {
        let report = {
            let mut state = self.state.lock();
            if state.closed {
                debug!("Chain {} already closed", self.id);
                return;
            }
            state.closed = true;
            self.take_success_report(&mut state)
        };
        debug!("Chain {} closed", self.id);
        if report {
            info!("Chain {} completed successfully", self.id);
            self.listener.on_transaction_chain_successful(self.id);
        }
    }

    fn take_success_report(&self, state: &mut ChainState) -> bool {
        if state.closed && state.outstanding == 0 && !state.failed && !state.reported {
            state.reported = true;
            return true;
        }
        false
    }
}

async fn run_commits(chain: Weak<ChainInner>, mut queue: mpsc::UnboundedReceiver<CommitJob>) {
    while let Some(job) = queue.recv().await {
        match chain.upgrade() {
            Some(chain) => chain.execute(job),
            None => {
                let id = job.tx.identifier();
                (job.callback)(Err(DomError::Cancelled(id)));
            }
        }
    }
}

/// [`TransactionChain`] over an in-memory shard.
pub struct InMemoryTransactionChain {
    inner: Arc<ChainInner>,
}

impl InMemoryTransactionChain {
    /// Chain writing to `shard` and reporting to `listener`.
    pub fn new(
        shard: Arc<InMemoryDataTreeShard>,
        listener: Arc<dyn TransactionChainListener>,
        executor: CommitExecutor,
    ) -> Self {
        let id = ChainId::next();
        let inner = match executor {
            CommitExecutor::Inline => Arc::new(ChainInner {
                id,
                shard,
                listener,
                submitter: Submitter::Inline,
                state: Mutex::new(ChainState::default()),
            }),
            CommitExecutor::Spawned(handle) => {
                let (sender, receiver) = mpsc::unbounded_channel();
                let inner = Arc::new(ChainInner {
                    id,
                    shard,
                    listener,
                    submitter: Submitter::Queue(sender),
                    state: Mutex::new(ChainState::default()),
                });
                handle.spawn(run_commits(Arc::downgrade(&inner), receiver));
                inner
            }
        };
        debug!("Created in-memory chain {} on shard {}", id, inner.shard.prefix());
        Self { inner }
    }
}

impl TransactionChain for InMemoryTransactionChain {
    fn identifier(&self) -> ChainId {
        self.inner.id
    }

    fn new_read_write_transaction(&self) -> DomResult<Arc<dyn ReadWriteTransaction>> {
        self.inner.allocate()
    }

    fn close(&self) {
        self.inner.close();
    }
}

impl fmt::Debug for InMemoryTransactionChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryTransactionChain")
            .field("id", &self.inner.id)
            .field("shard", self.inner.shard.prefix())
            .finish()
    }
}

enum TxSlot {
    Open(InMemoryShardWriteTransaction),
    Submitted,
    Cancelled,
}

/// Read-write transaction allocated by an [`InMemoryTransactionChain`].
pub struct InMemoryReadWriteTransaction {
    id: TransactionId,
    chain: Arc<ChainInner>,
    tx: Mutex<TxSlot>,
}

impl InMemoryReadWriteTransaction {
    fn with_open<R, F>(&self, apply: F) -> DomResult<R>
    where
        F: FnOnce(&mut InMemoryShardWriteTransaction) -> DomResult<R>,
    {
        match &mut *self.tx.lock() {
            TxSlot::Open(tx) => apply(tx),
            TxSlot::Submitted => Err(DomError::IllegalState(format!("transaction {} was submitted", self.id))),
            TxSlot::Cancelled => Err(DomError::Cancelled(self.id)),
        }
    }
}

impl ReadWriteTransaction for InMemoryReadWriteTransaction {
    fn identifier(&self) -> TransactionId {
        self.id
    }

    fn read(&self, path: &InstanceIdentifier) -> DomResult<Option<NormalizedNode>> {
        self.with_open(|tx| tx.read(path))
    }

    fn put(&self, path: &InstanceIdentifier, data: NormalizedNode) -> DomResult<()> {
        self.with_open(|tx| tx.write(path, data))
    }

    fn merge(&self, path: &InstanceIdentifier, data: NormalizedNode) -> DomResult<()> {
        self.with_open(|tx| tx.merge(path, data))
    }

    fn delete(&self, path: &InstanceIdentifier) -> DomResult<()> {
        self.with_open(|tx| tx.delete(path))
    }

    fn cancel(&self) -> bool {
        let mut tx = {
            let mut slot = self.tx.lock();
            match std::mem::replace(&mut *slot, TxSlot::Cancelled) {
                TxSlot::Open(tx) => tx,
                other => {
                    *slot = other;
                    return false;
                }
            }
        };
        debug!("Cancelling transaction {}", self.id);
        if let Err(e) = tx.abort().and_then(|()| tx.close()) {
            warn!("Cleanup of cancelled transaction {} failed: {}", self.id, e);
        }
        self.chain.finished();
        true
    }

    fn commit(&self, callback: CommitCallback) {
        let slot = std::mem::replace(&mut *self.tx.lock(), TxSlot::Submitted);
        match slot {
            TxSlot::Open(tx) => self.chain.submit(tx, callback),
            TxSlot::Submitted => {
                *self.tx.lock() = TxSlot::Submitted;
                callback(Err(DomError::IllegalState(format!("transaction {} already submitted", self.id))));
            }
            TxSlot::Cancelled => {
                *self.tx.lock() = TxSlot::Cancelled;
                callback(Err(DomError::Cancelled(self.id)));
            }
        }
    }
}

impl fmt::Debug for InMemoryReadWriteTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryReadWriteTransaction")
            .field("id", &self.id)
            .field("chain", &self.chain.id)
            .finish()
    }
}
