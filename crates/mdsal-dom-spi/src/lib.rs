#![warn(missing_docs)]

//! MD-SAL DOM subsystem: transaction chaining, listener dispatch and sharded writes
//!
//! This crate holds the broker-side machinery that sits between data tree
//! users and the stores holding the data: ping-pong transaction chains over a
//! backend chain, the registration tree and candidate publisher used to
//! dispatch committed changes, state aggregation for multi-subtree listeners,
//! and write cursors composed across shard boundaries with a three-phase
//! commit over every shard touched.

pub mod aggregator;
pub mod candidate;
pub mod candidate_publisher;
pub mod error;
pub mod listener;
pub mod listener_aggregator;
pub mod pingpong;
pub mod registration_tree;
pub mod routing;
pub mod shard;
pub mod transaction;
pub mod types;

pub use aggregator::{BuilderRef, Operational, StateAggregator, StateBuilder, StateSink, Started};
pub use candidate::{compress_candidates, DataTreeCandidate, DataTreeCandidateNode, ModificationType};
pub use candidate_publisher::{CandidateDispatch, DataTreeCandidatePublisher};
pub use error::{DomError, DomResult};
pub use listener::{DataTreeChangeListener, ListenerRegistration, RegistrationId};
pub use listener_aggregator::{DataTreeChangeListenerAggregator, DataTreeListener, SubtreeChanges, SubtreeData};
pub use pingpong::{PingPongReadTransaction, PingPongReadWriteTransaction, PingPongTransactionChain};
pub use registration_tree::{
    NodeId, RegistrationTree, RegistrationTreeLock, RegistrationTreeNode, RegistrationTreeSnapshot,
};
pub use routing::{LeafDefinition, RpcDefinition, RpcRoutingStrategy};
pub use shard::{
    AggregateCommitCohort, ForeignShardModificationContext, ShardDataModification, ShardProducer,
    ShardWriteTransaction, ThreePhaseCommitCohort, WriteCursor,
};
pub use transaction::{
    ChainId, CommitCallback, CommitFuture, CommitInfo, CommitResult, ReadWriteTransaction, TransactionChain,
    TransactionChainListener, TransactionId,
};
pub use types::{InstanceIdentifier, NormalizedNode, PathArgument, QName, Value};
