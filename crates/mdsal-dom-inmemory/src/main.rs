#![warn(missing_docs)]

//! Demo of the in-memory data store: commits a series of ping-pong
//! transactions while a listener reports the changes.

use anyhow::{Context, Result};
use clap::Parser;
use mdsal_dom_inmemory::cli::Cli;
use mdsal_dom_inmemory::{init_tracing, InMemoryDataStore, StoreConfig};
use mdsal_dom_spi::{
    ChainId, DataTreeCandidate, DataTreeChangeListener, DataTreeListener, DomError, InstanceIdentifier,
    NormalizedNode, PathArgument, SubtreeData, TransactionChainListener, TransactionId,
};
use std::sync::Arc;
use tracing::{error, info, warn};

struct LoggingChainListener;

impl TransactionChainListener for LoggingChainListener {
    fn on_transaction_chain_failed(&self, chain: ChainId, transaction: Option<TransactionId>, cause: &DomError) {
        error!("Chain {} failed in {:?}: {}", chain, transaction, cause);
    }

    fn on_transaction_chain_successful(&self, chain: ChainId) {
        info!("Chain {} closed", chain);
    }
}

struct LoggingChangeListener;

impl DataTreeChangeListener for LoggingChangeListener {
    fn on_data_tree_changed(&self, changes: Vec<DataTreeCandidate>) {
        for change in changes {
            info!(
                "Change at {}: {:?}",
                change.root_path(),
                change.root_node().modification_type()
            );
        }
    }
}

struct LoggingSubtreeListener;

impl DataTreeListener for LoggingSubtreeListener {
    fn on_data_tree_changed(&self, changes: Vec<DataTreeCandidate>, subtrees: SubtreeData) {
        info!("{} aggregated changes over {} subtrees", changes.len(), subtrees.len());
    }

    fn on_data_tree_failed(&self, causes: Vec<DomError>) {
        for cause in causes {
            warn!("Subtree listener failed: {}", cause);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loaded = if cli.config.exists() {
        Some(StoreConfig::from_file(&cli.config).with_context(|| format!("loading {}", cli.config.display()))?)
    } else {
        None
    };
    let config = loaded.clone().unwrap_or_default();
    init_tracing(&config.logging, cli.log_filter.as_deref())?;
    if loaded.is_none() {
        warn!("Config file not found, using defaults: {}", cli.config.display());
    }

    info!("In-memory store {} starting...", config.name);
    let store = InMemoryDataStore::from_config(&config)?;

    let demo: InstanceIdentifier = "/demo".parse()?;
    let counter: InstanceIdentifier = "/demo/counter".parse()?;
    let changes = store.register_tree_change_listener(&demo, Arc::new(LoggingChangeListener))?;
    let aggregated = store.register_listener(vec![demo.clone()], Arc::new(LoggingSubtreeListener))?;

    let chain = store.create_ping_pong_chain(Arc::new(LoggingChainListener));
    for value in 0..i64::from(cli.transactions) {
        let tx = chain.new_read_write_transaction()?;
        let data = NormalizedNode::container(
            PathArgument::node("demo"),
            [NormalizedNode::leaf(PathArgument::node("counter"), value)],
        );
        tx.put(&demo, data)?;
        tx.commit().await?;
    }
    chain.close()?;

    match store.read(&counter)? {
        Some(node) => info!("Final value at {}: {:?}", counter, node),
        None => warn!("Nothing stored at {}", counter),
    }

    changes.close();
    aggregated.close();
    info!("In-memory store {} stopped", store.name());
    Ok(())
}
