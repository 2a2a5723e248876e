//! Error types for the DOM broker SPI.

use thiserror::Error;

use crate::transaction::{ChainId, TransactionId};
use crate::types::InstanceIdentifier;

/// Errors raised by transaction chains, shard transactions and listener plumbing.
///
/// The type is `Clone` so a single failure can complete every commit future
/// batched onto one backend transaction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomError {
    /// The chain was closed and accepts no new transactions.
    #[error("transaction chain {chain} has been shut down")]
    ChainShutdown {
        /// Chain that was closed.
        chain: ChainId,
    },

    /// A cancellation could not be isolated and doomed the chain.
    #[error("transaction chain {chain} has failed due to transaction {transaction} being cancelled: {cause}")]
    ChainPoisoned {
        /// Poisoned chain.
        chain: ChainId,
        /// Frontend transaction whose cancellation poisoned the chain.
        transaction: TransactionId,
        /// Original cancellation cause.
        cause: Box<DomError>,
    },

    /// Two transactions were allocated concurrently on one chain.
    #[error("new transaction {new} raced with transaction {existing}")]
    ConcurrentAllocation {
        /// Backend transaction of the new allocation.
        new: TransactionId,
        /// Backend transaction already locked.
        existing: TransactionId,
    },

    /// An operation needs the chain to have no checked-out transaction.
    #[error("transaction chain {chain} has outstanding transaction {transaction}")]
    OutstandingTransaction {
        /// Chain being operated on.
        chain: ChainId,
        /// Backend transaction currently locked.
        transaction: TransactionId,
    },

    /// The transaction was cancelled.
    #[error("transaction {0} was cancelled")]
    Cancelled(TransactionId),

    /// The backend rejected or failed a commit.
    #[error("commit of transaction {transaction} failed: {reason}")]
    CommitFailed {
        /// Backend transaction.
        transaction: TransactionId,
        /// Failure description.
        reason: String,
    },

    /// The backend chain failed.
    #[error("transaction chain {chain} failed: {reason}")]
    ChainFailed {
        /// Failed chain.
        chain: ChainId,
        /// Failure description.
        reason: String,
    },

    /// Data could not be applied to the tree.
    #[error("data validation failed at {path}: {reason}")]
    DataValidationFailed {
        /// Offending path.
        path: InstanceIdentifier,
        /// Failure description.
        reason: String,
    },

    /// A modification conflicts with a concurrently committed one.
    #[error("optimistic lock failed at {path}: {reason}")]
    OptimisticLockFailed {
        /// Conflicting path.
        path: InstanceIdentifier,
        /// Failure description.
        reason: String,
    },

    /// A textual path could not be parsed.
    #[error("invalid path '{input}': {reason}")]
    InvalidPath {
        /// Input text.
        input: String,
        /// Parse failure description.
        reason: String,
    },

    /// The object is not in a state that permits the operation.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// An argument violates the operation's contract.
    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    /// The operation is not implemented for this input.
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

/// Result type for DOM operations.
pub type DomResult<T> = Result<T, DomError>;
