//! Data store assembled from a [`StoreConfig`]: a root shard with child
//! shards attached at the configured prefixes.

use std::fmt;
use std::sync::Arc;

use mdsal_dom_spi::{
    DataTreeChangeListener, DataTreeListener, DomResult, InstanceIdentifier, ListenerRegistration, NormalizedNode,
    PingPongTransactionChain, TransactionChain, TransactionChainListener,
};
use tokio::runtime::Handle;
use tracing::{debug, info};

use crate::chain::{CommitExecutor, InMemoryTransactionChain};
use crate::config::{CommitMode, ConfigError, StoreConfig};
use crate::shard::InMemoryDataTreeShard;

/// In-memory data store.
pub struct InMemoryDataStore {
    name: String,
    root: Arc<InMemoryDataTreeShard>,
    executor: CommitExecutor,
}

impl InMemoryDataStore {
    /// Build a store from `config`.
    ///
    /// `CommitMode::Spawned` must be requested from within a tokio runtime.
    pub fn from_config(config: &StoreConfig) -> Result<Self, ConfigError> {
        let prefixes = config.validate()?;
        let executor = match config.commit_mode {
            CommitMode::Inline => CommitExecutor::Inline,
            CommitMode::Spawned => CommitExecutor::Spawned(Handle::try_current().map_err(|e| {
                ConfigError::Invalid(format!("spawned commit mode needs a tokio runtime: {}", e))
            })?),
        };

        let root = InMemoryDataTreeShard::new(InstanceIdentifier::empty(), config.history_depth);
        // Shortest first, so every parent exists before its children.
        for prefix in prefixes {
            let parent = root
                .find_shard(&prefix)
                .ok_or_else(|| ConfigError::Invalid(format!("no shard contains {}", prefix)))?;
            let child = InMemoryDataTreeShard::new(prefix.clone(), config.history_depth);
            parent
                .attach_child(child)
                .map_err(|e| ConfigError::Invalid(format!("cannot attach shard {}: {}", prefix, e)))?;
            debug!("Store {} attached shard {} below {}", config.name, prefix, parent.prefix());
        }

        info!("Created in-memory store {} ({:?} commits)", config.name, config.commit_mode);
        Ok(Self {
            name: config.name.clone(),
            root,
            executor,
        })
    }

    /// Store name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The shard at the root of the store.
    pub fn root_shard(&self) -> &Arc<InMemoryDataTreeShard> {
        &self.root
    }

    /// Backend chain writing through the root shard.
    pub fn create_transaction_chain(&self, listener: Arc<dyn TransactionChainListener>) -> Arc<dyn TransactionChain> {
        Arc::new(InMemoryTransactionChain::new(
            Arc::clone(&self.root),
            listener,
            self.executor.clone(),
        ))
    }

    /// Ping-pong chain over a fresh backend chain of this store.
    pub fn create_ping_pong_chain(
        &self,
        listener: Arc<dyn TransactionChainListener>,
    ) -> Arc<PingPongTransactionChain> {
        let root = Arc::clone(&self.root);
        let executor = self.executor.clone();
        PingPongTransactionChain::new(
            move |relay| Arc::new(InMemoryTransactionChain::new(root, relay, executor)) as Arc<dyn TransactionChain>,
            listener,
        )
    }

    /// Committed data at `path`.
    pub fn read(&self, path: &InstanceIdentifier) -> DomResult<Option<NormalizedNode>> {
        self.root.read(path)
    }

    /// Listen for changes at `path`.
    pub fn register_tree_change_listener(
        &self,
        path: &InstanceIdentifier,
        listener: Arc<dyn DataTreeChangeListener>,
    ) -> DomResult<ListenerRegistration> {
        self.root.register_tree_change_listener(path, listener)
    }

    /// Listen for changes of several subtrees at once.
    pub fn register_listener(
        &self,
        subtrees: Vec<InstanceIdentifier>,
        listener: Arc<dyn DataTreeListener>,
    ) -> DomResult<ListenerRegistration> {
        self.root.register_listener(subtrees, listener)
    }
}

impl fmt::Debug for InMemoryDataStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryDataStore")
            .field("name", &self.name)
            .field("executor", &self.executor)
            .finish()
    }
}
