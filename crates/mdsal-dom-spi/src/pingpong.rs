//! Ping-pong transaction chain.
//!
//! A chain of frontend transactions is pipelined onto at most two backend
//! transactions: one being committed by the backend (`inflight`) and one
//! collecting writes (`locked` while a user holds it, `ready` once the user
//! has submitted it). A frontend transaction allocated while another one is
//! ready simply continues on the ready backend transaction, so an arbitrarily
//! long sequence of small frontend transactions turns into a few large backend
//! commits.
//!
//! The three slots are atomic references manipulated by compare-and-swap.
//! Every exchange has exactly one legal witness; anything else is a usage
//! error and is reported, never retried. Submission to the backend happens
//! under a short critical section so transactions reach the backend in the
//! order they were readied. Backend calls themselves are made after the
//! critical section is left.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use arc_swap::{ArcSwapOption, Guard};
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::error::{DomError, DomResult};
use crate::transaction::{
    commit_promise, failed_commit, ChainId, CommitFuture, CommitInfo, CommitPromise, CommitResult,
    ReadWriteTransaction, TransactionChain, TransactionChainListener, TransactionId,
};
use crate::types::{InstanceIdentifier, NormalizedNode};

/// One backend transaction shared by a batch of frontend transactions.
pub(crate) struct PingPongTransaction {
    delegate: Arc<dyn ReadWriteTransaction>,
    frontend: OnceLock<TransactionId>,
    promise: CommitPromise,
    future: CommitFuture,
}

impl PingPongTransaction {
    fn new(delegate: Arc<dyn ReadWriteTransaction>) -> Self {
        let (promise, future) = commit_promise();
        Self {
            delegate,
            frontend: OnceLock::new(),
            promise,
            future,
        }
    }

    /// Remember the first read-write frontend using this transaction.
    fn record_frontend(&self, frontend: TransactionId) {
        // Only the head of the batch is recorded.
        let _ = self.frontend.set(frontend);
    }

    fn frontend(&self) -> Option<TransactionId> {
        self.frontend.get().copied()
    }

    fn on_success(&self, info: CommitInfo) {
        self.promise.complete(Ok(info));
    }

    fn on_failure(&self, cause: DomError) {
        self.promise.complete(Err(cause));
    }
}

impl fmt::Display for PingPongTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.frontend() {
            Some(frontend) => write!(f, "PingPong{{delegate={}, frontend={}}}", self.delegate.identifier(), frontend),
            None => write!(f, "PingPong{{delegate={}}}", self.delegate.identifier()),
        }
    }
}

type TxRef = Arc<PingPongTransaction>;
type TxSlot = ArcSwapOption<PingPongTransaction>;

/// Compare-and-exchange on a slot. Returns the value witnessed in the slot;
/// the exchange happened if and only if it is the expected one.
fn compare_and_exchange(slot: &TxSlot, expected: Option<&TxRef>, new: Option<TxRef>) -> Option<TxRef> {
    let current = expected.cloned();
    Guard::into_inner(slot.compare_and_swap(&current, new))
}

fn is_same(witness: Option<&TxRef>, expected: Option<&TxRef>) -> bool {
    match (witness, expected) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

fn describe(tx: Option<&TxRef>) -> String {
    tx.map(|tx| tx.to_string()).unwrap_or_else(|| "nothing".to_string())
}

/// Backend work decided inside the critical section and run after it.
enum Deferred {
    Commit(TxRef),
    Cancel(TxRef, DomError),
    CloseDelegate,
}

#[derive(Default)]
struct ChainState {
    failed: bool,
    closed: bool,
    shutdown_tx: Option<TxRef>,
    dead_tx: Option<(TxRef, DomError)>,
}

/// Relays backend chain events to the frontend chain.
struct DelegateListener {
    chain: Weak<PingPongTransactionChain>,
}

impl TransactionChainListener for DelegateListener {
    fn on_transaction_chain_failed(&self, _chain: ChainId, _transaction: Option<TransactionId>, cause: &DomError) {
        if let Some(chain) = self.chain.upgrade() {
            chain.delegate_failed(cause);
        }
    }

    fn on_transaction_chain_successful(&self, _chain: ChainId) {
        if let Some(chain) = self.chain.upgrade() {
            chain.delegate_successful();
        }
    }
}

/// Transaction chain pipelining frontend transactions onto at most two
/// backend transactions.
pub struct PingPongTransactionChain {
    id: ChainId,
    listener: Arc<dyn TransactionChainListener>,
    delegate: Arc<dyn TransactionChain>,
    locked_tx: TxSlot,
    ready_tx: TxSlot,
    inflight_tx: TxSlot,
    state: Mutex<ChainState>,
    next_frontend: AtomicU64,
}

impl PingPongTransactionChain {
    /// Create a chain. `create_delegate` receives the listener the backend
    /// chain must report to and returns the backend chain.
    pub fn new<F>(create_delegate: F, listener: Arc<dyn TransactionChainListener>) -> Arc<Self>
    where
        F: FnOnce(Arc<dyn TransactionChainListener>) -> Arc<dyn TransactionChain>,
    {
        Arc::new_cyclic(|weak| {
            let relay: Arc<dyn TransactionChainListener> = Arc::new(DelegateListener { chain: weak.clone() });
            let delegate = create_delegate(relay);
            debug!("Created ping-pong chain over backend {}", delegate.identifier());
            Self {
                id: ChainId::next(),
                listener,
                delegate,
                locked_tx: TxSlot::empty(),
                ready_tx: TxSlot::empty(),
                inflight_tx: TxSlot::empty(),
                state: Mutex::new(ChainState::default()),
                next_frontend: AtomicU64::new(1),
            }
        })
    }

    /// Chain identifier.
    pub fn identifier(&self) -> ChainId {
        self.id
    }

    /// Allocate a read-only frontend transaction.
    pub fn new_read_only_transaction(self: &Arc<Self>) -> DomResult<PingPongReadTransaction> {
        let tx = self.allocate_transaction()?;
        Ok(PingPongReadTransaction {
            chain: Arc::clone(self),
            tx,
            id: self.next_frontend_id(),
            open: true,
        })
    }

    /// Allocate a read-write frontend transaction.
    pub fn new_read_write_transaction(self: &Arc<Self>) -> DomResult<PingPongReadWriteTransaction> {
        let tx = self.allocate_transaction()?;
        let id = self.next_frontend_id();
        tx.record_frontend(id);
        Ok(PingPongReadWriteTransaction {
            chain: Arc::clone(self),
            tx,
            id,
            open: true,
        })
    }

    /// Allocate a write-only frontend transaction.
    pub fn new_write_only_transaction(self: &Arc<Self>) -> DomResult<PingPongReadWriteTransaction> {
        self.new_read_write_transaction()
    }

    /// Close the chain.
    ///
    /// Fails while a frontend transaction is checked out. A ready transaction
    /// is still committed before the backend chain is closed. Closing twice
    /// is a no-op.
    pub fn close(self: &Arc<Self>) -> DomResult<()> {
        let mut work = Vec::new();
        {
            let mut state = self.state.lock();
            if let Some(locked) = self.locked_tx.load_full() {
                return Err(DomError::OutstandingTransaction {
                    chain: self.id,
                    transaction: locked.delegate.identifier(),
                });
            }
            if state.closed {
                debug!("Chain {} already closed", self.id);
                return Ok(());
            }
            state.closed = true;

            if let Some((dead, cause)) = &state.dead_tx {
                debug!("Delegate of chain {} already closed due to {} failing: {}", self.id, dead, cause);
                return Ok(());
            }

            match self.ready_tx.swap(None) {
                Some(tx) => {
                    if self.inflight_tx.load().is_none() {
                        self.process_transaction(&mut state, tx, &mut work);
                        work.push(Deferred::CloseDelegate);
                    } else {
                        debug!("Chain {} deferring shutdown until {} commits", self.id, tx);
                        state.shutdown_tx = Some(tx);
                    }
                }
                None => work.push(Deferred::CloseDelegate),
            }
        }
        self.run(work);
        Ok(())
    }

    fn next_frontend_id(&self) -> TransactionId {
        TransactionId::new(self.next_frontend.fetch_add(1, Ordering::Relaxed))
    }

    fn allocate_transaction(self: &Arc<Self>) -> DomResult<TxRef> {
        let Some(ready) = self.ready_tx.swap(None) else {
            return self.slow_allocate_transaction();
        };

        // Continue on the backend transaction which is not yet submitted.
        let witness = compare_and_exchange(&self.locked_tx, None, Some(Arc::clone(&ready)));
        if let Some(existing) = witness {
            ready.delegate.cancel();
            return Err(DomError::ConcurrentAllocation {
                new: ready.delegate.identifier(),
                existing: existing.delegate.identifier(),
            });
        }
        debug!("Chain {} reusing {}", self.id, ready);
        Ok(ready)
    }

    fn slow_allocate_transaction(self: &Arc<Self>) -> DomResult<TxRef> {
        let state = self.state.lock();
        if state.closed || state.shutdown_tx.is_some() {
            return Err(DomError::ChainShutdown { chain: self.id });
        }
        if let Some((dead, cause)) = &state.dead_tx {
            return Err(DomError::ChainPoisoned {
                chain: self.id,
                transaction: dead.frontend().unwrap_or_else(|| dead.delegate.identifier()),
                cause: Box::new(cause.clone()),
            });
        }

        let delegate = self.delegate.new_read_write_transaction()?;
        let tx = Arc::new(PingPongTransaction::new(delegate));
        let witness = compare_and_exchange(&self.locked_tx, None, Some(Arc::clone(&tx)));
        if let Some(existing) = witness {
            tx.delegate.cancel();
            return Err(DomError::ConcurrentAllocation {
                new: tx.delegate.identifier(),
                existing: existing.delegate.identifier(),
            });
        }
        debug!("Chain {} allocated {}", self.id, tx);
        Ok(tx)
    }

    /// Move a transaction from locked to ready and kick off dispatch if the
    /// backend is idle.
    fn ready_transaction(self: &Arc<Self>, tx: &TxRef) -> DomResult<()> {
        let witness = compare_and_exchange(&self.locked_tx, Some(tx), None);
        if !is_same(witness.as_ref(), Some(tx)) {
            return Err(DomError::IllegalState(format!(
                "attempted to submit transaction {} while {} is locked",
                tx,
                describe(witness.as_ref())
            )));
        }
        debug!("Transaction {} unlocked", tx);

        let witness = compare_and_exchange(&self.ready_tx, None, Some(Arc::clone(tx)));
        if let Some(existing) = witness {
            return Err(DomError::IllegalState(format!(
                "transaction {} collided on ready state with {}",
                tx, existing
            )));
        }
        debug!("Transaction {} readied", tx);

        if self.inflight_tx.load().is_none() {
            let mut work = Vec::new();
            {
                let mut state = self.state.lock();
                self.process_if_ready(&mut state, &mut work);
            }
            self.run(work);
        }
        Ok(())
    }

    /// Dispatch the ready transaction if nothing is in flight. Called with the
    /// state lock held.
    fn process_if_ready(&self, state: &mut ChainState, work: &mut Vec<Deferred>) {
        if self.inflight_tx.load().is_none() {
            if let Some(tx) = self.ready_tx.swap(None) {
                self.process_transaction(state, tx, work);
            }
        }
    }

    /// Make `tx` the in-flight transaction. Called with the state lock held.
    fn process_transaction(&self, state: &mut ChainState, tx: TxRef, work: &mut Vec<Deferred>) {
        if state.failed {
            debug!("Cancelling transaction {} on failed chain {}", tx, self.id);
            let cause = DomError::Cancelled(tx.delegate.identifier());
            work.push(Deferred::Cancel(tx, cause));
            return;
        }

        debug!("Submitting transaction {}", tx);
        let witness = compare_and_exchange(&self.inflight_tx, None, Some(Arc::clone(&tx)));
        if let Some(running) = witness {
            warn!("Submitting transaction {} while {} is still running", tx, running);
        }
        work.push(Deferred::Commit(tx));
    }

    fn run(self: &Arc<Self>, work: Vec<Deferred>) {
        for item in work {
            match item {
                Deferred::Commit(tx) => {
                    let chain = Arc::clone(self);
                    let completed = Arc::clone(&tx);
                    tx.delegate.commit(Box::new(move |result| {
                        chain.transaction_completed(completed, result);
                    }));
                }
                Deferred::Cancel(tx, cause) => {
                    tx.delegate.cancel();
                    tx.on_failure(cause);
                }
                Deferred::CloseDelegate => {
                    debug!("Closing backend of chain {}", self.id);
                    self.delegate.close();
                }
            }
        }
    }

    fn transaction_completed(self: &Arc<Self>, tx: TxRef, result: CommitResult) {
        match result {
            Ok(info) => {
                debug!("Transaction {} completed successfully", tx);
                tx.on_success(info);
            }
            Err(cause) => {
                debug!("Transaction {} failed: {}", tx, cause);
                tx.on_failure(cause);
            }
        }
        self.process_next_transaction(&tx);
    }

    fn process_next_transaction(self: &Arc<Self>, tx: &TxRef) {
        let mut work = Vec::new();
        {
            let mut state = self.state.lock();
            let witness = compare_and_exchange(&self.inflight_tx, Some(tx), None);
            if !is_same(witness.as_ref(), Some(tx)) {
                error!(
                    "Completed transaction {} while {} was submitted",
                    tx,
                    describe(witness.as_ref())
                );
                return;
            }

            match self.ready_tx.swap(None) {
                Some(next) => self.process_transaction(&mut state, next, &mut work),
                None => {
                    if let Some(shutdown) = state.shutdown_tx.take() {
                        self.process_transaction(&mut state, shutdown, &mut work);
                        work.push(Deferred::CloseDelegate);
                    }
                }
            }
        }
        self.run(work);
    }

    fn cancel_transaction(self: &Arc<Self>, tx: &TxRef, frontend: TransactionId) -> bool {
        let mut work = Vec::new();
        let cancelled = {
            let mut state = self.state.lock();
            let witness = compare_and_exchange(&self.locked_tx, Some(tx), None);
            if !is_same(witness.as_ref(), Some(tx)) {
                error!(
                    "Cancelling transaction {} collided with locked transaction {}",
                    tx,
                    describe(witness.as_ref())
                );
                return false;
            }

            let backend_cancelled = tx.delegate.cancel();
            if state.failed {
                // The backend is dead anyway.
                tx.on_failure(DomError::Cancelled(frontend));
                return true;
            }

            if tx.frontend() == Some(frontend) {
                if backend_cancelled {
                    debug!("Cancelled transaction {} was head of the batch, resuming processing", tx);
                    tx.on_failure(DomError::Cancelled(frontend));
                    return true;
                }

                // Backend refused: the transaction stays checked out.
                let witness = compare_and_exchange(&self.locked_tx, None, Some(Arc::clone(tx)));
                if let Some(other) = witness {
                    error!("Reinstating transaction {} collided with {}", tx, other);
                }
                return false;
            }

            if !backend_cancelled {
                warn!(
                    "Backend transaction cannot be cancelled during cancellation of {}, attempting to continue",
                    tx
                );
            }

            // Writes of already-submitted frontends sharing this backend
            // transaction are lost, so the chain cannot continue.
            warn!("Cancelling {} poisoned chain {}", tx, self.id);
            state.dead_tx = Some((Arc::clone(tx), DomError::Cancelled(frontend)));
            work.push(Deferred::CloseDelegate);
            true
        };
        self.run(work);
        cancelled
    }

    fn delegate_failed(self: &Arc<Self>, cause: &DomError) {
        let frontend = match self.inflight_tx.load_full() {
            Some(tx) => tx.frontend(),
            None => {
                warn!("Chain {} failed with no transaction in flight", self.id);
                None
            }
        };
        self.listener.on_transaction_chain_failed(self.id, frontend, cause);

        let mut work = Vec::new();
        {
            let mut state = self.state.lock();
            state.failed = true;

            // Without a checked-out transaction there is nobody left to flush
            // the ready transaction.
            if self.locked_tx.load().is_none() {
                self.process_if_ready(&mut state, &mut work);
            }
        }
        self.run(work);
    }

    fn delegate_successful(&self) {
        let dead = self.state.lock().dead_tx.clone();
        match dead {
            None => {
                debug!("Chain {} completed successfully", self.id);
                self.listener.on_transaction_chain_successful(self.id);
            }
            Some((tx, cause)) => {
                debug!("Reporting chain {} as failed due to cancellation of {}", self.id, tx);
                self.listener.on_transaction_chain_failed(self.id, tx.frontend(), &cause);
                tx.on_failure(cause);
            }
        }
    }

    #[cfg(test)]
    fn slots(&self) -> (bool, bool, bool) {
        (
            self.locked_tx.load().is_some(),
            self.ready_tx.load().is_some(),
            self.inflight_tx.load().is_some(),
        )
    }
}

/// Read-only frontend transaction. Closing (or dropping) it hands the backend
/// transaction back to the chain.
pub struct PingPongReadTransaction {
    chain: Arc<PingPongTransactionChain>,
    tx: TxRef,
    id: TransactionId,
    open: bool,
}

impl PingPongReadTransaction {
    /// Frontend transaction identifier.
    pub fn identifier(&self) -> TransactionId {
        self.id
    }

    /// Identifier of the backend transaction this frontend runs on.
    pub fn backend_identifier(&self) -> TransactionId {
        self.tx.delegate.identifier()
    }

    /// Read the data at `path`.
    pub fn read(&self, path: &InstanceIdentifier) -> DomResult<Option<NormalizedNode>> {
        self.tx.delegate.read(path)
    }

    /// Whether data exists at `path`.
    pub fn exists(&self, path: &InstanceIdentifier) -> DomResult<bool> {
        self.tx.delegate.exists(path)
    }

    /// Release the transaction.
    pub fn close(mut self) -> DomResult<()> {
        self.open = false;
        self.chain.ready_transaction(&self.tx)
    }
}

impl Drop for PingPongReadTransaction {
    fn drop(&mut self) {
        if self.open {
            self.open = false;
            if let Err(e) = self.chain.ready_transaction(&self.tx) {
                error!("Failed to release read transaction {}: {}", self.id, e);
            }
        }
    }
}

/// Read-write frontend transaction.
///
/// Dropping a transaction that was neither committed nor cancelled cancels it.
pub struct PingPongReadWriteTransaction {
    chain: Arc<PingPongTransactionChain>,
    tx: TxRef,
    id: TransactionId,
    open: bool,
}

impl PingPongReadWriteTransaction {
    /// Frontend transaction identifier.
    pub fn identifier(&self) -> TransactionId {
        self.id
    }

    /// Identifier of the backend transaction this frontend runs on.
    pub fn backend_identifier(&self) -> TransactionId {
        self.tx.delegate.identifier()
    }

    fn check_open(&self) -> DomResult<()> {
        if self.open {
            Ok(())
        } else {
            Err(DomError::IllegalState(format!("transaction {} is no longer open", self.id)))
        }
    }

    /// Read the data at `path`, including writes made so far.
    pub fn read(&self, path: &InstanceIdentifier) -> DomResult<Option<NormalizedNode>> {
        self.check_open()?;
        self.tx.delegate.read(path)
    }

    /// Whether data exists at `path`.
    pub fn exists(&self, path: &InstanceIdentifier) -> DomResult<bool> {
        self.check_open()?;
        self.tx.delegate.exists(path)
    }

    /// Replace the data at `path`.
    pub fn put(&self, path: &InstanceIdentifier, data: NormalizedNode) -> DomResult<()> {
        self.check_open()?;
        self.tx.delegate.put(path, data)
    }

    /// Merge `data` into the data at `path`.
    pub fn merge(&self, path: &InstanceIdentifier, data: NormalizedNode) -> DomResult<()> {
        self.check_open()?;
        self.tx.delegate.merge(path, data)
    }

    /// Remove the data at `path`.
    pub fn delete(&self, path: &InstanceIdentifier) -> DomResult<()> {
        self.check_open()?;
        self.tx.delegate.delete(path)
    }

    /// Submit the transaction. The returned future is shared by every
    /// frontend transaction batched onto the same backend transaction.
    pub fn commit(mut self) -> CommitFuture {
        self.open = false;
        match self.chain.ready_transaction(&self.tx) {
            Ok(()) => self.tx.future.clone(),
            Err(e) => failed_commit(e),
        }
    }

    /// Cancel the transaction. Returns false if the backend refused, in which
    /// case the transaction stays usable.
    pub fn cancel(&mut self) -> bool {
        if !self.open {
            return false;
        }
        let cancelled = self.chain.cancel_transaction(&self.tx, self.id);
        if cancelled {
            self.open = false;
        }
        cancelled
    }
}

impl Drop for PingPongReadWriteTransaction {
    fn drop(&mut self) {
        if self.open {
            warn!("Transaction {} dropped without commit, cancelling it", self.id);
            self.open = false;
            self.chain.cancel_transaction(&self.tx, self.id);
        }
    }
}
