#![warn(missing_docs)]

//! In-memory backend for the MD-SAL DOM subsystem
//!
//! Data trees with optimistic conflict detection, shards composed of a local
//! tree and attached child shards, change publishing to tree-change and
//! multi-subtree listeners, and backend transaction chains that the
//! ping-pong chain can run on.

pub mod chain;
pub mod change_publisher;
pub mod cli;
pub mod cohort;
pub mod config;
pub mod data_tree;
pub mod logging;
pub mod shard;
pub mod store;
pub mod write_transaction;

pub use chain::{CommitExecutor, InMemoryReadWriteTransaction, InMemoryTransactionChain};
pub use change_publisher::{ShardChangePublisher, TreeChangeRegistration};
pub use cohort::LocalShardCohort;
pub use config::{CommitMode, ConfigError, LoggingConfig, StoreConfig};
pub use data_tree::{DataTreeModification, DataTreeModificationCursor, DataTreeSnapshot, InMemoryDataTree, PreparedCommit};
pub use logging::init_tracing;
pub use shard::InMemoryDataTreeShard;
pub use store::InMemoryDataStore;
pub use write_transaction::InMemoryShardWriteTransaction;
