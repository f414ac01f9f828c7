// src/registry.rs
use alloy::primitives::Address;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::info;

use crate::aggregator::{AggregatorOptions, TransferAggregator};
use crate::source::TransferSource;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Unknown network: {0}")]
    UnknownNetwork(String),

    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },
}

/// One aggregator per (network, address)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FeedKey {
    pub network: String,
    /// Lowercase 0x-prefixed address
    pub address: String,
}

/// Live aggregators kept before the least recently used one is dropped
pub const DEFAULT_MAX_FEEDS: usize = 1000;

struct Entry<S> {
    aggregator: Arc<TransferAggregator<S>>,
    last_used: u64,
}

struct Feeds<S> {
    entries: HashMap<FeedKey, Entry<S>>,
    tick: u64,
}

/// Owns the live aggregators, one per `FeedKey`, each fed by its
/// network's `TransferSource`.
///
/// `get_or_create` is idempotent: callers racing on one key all get the
/// same instance, and different keys never wait on each other beyond the
/// map lookup. At most `max_feeds` aggregators are kept; creating one more
/// evicts the least recently used, preferring idle ones.
pub struct AggregatorRegistry<S> {
    sources: HashMap<String, Arc<S>>,
    options: AggregatorOptions,
    max_feeds: usize,
    feeds: Mutex<Feeds<S>>,
}

impl<S: TransferSource> AggregatorRegistry<S> {
    pub fn new(options: AggregatorOptions) -> Self {
        Self {
            sources: HashMap::new(),
            options,
            max_feeds: DEFAULT_MAX_FEEDS,
            feeds: Mutex::new(Feeds {
                entries: HashMap::new(),
                tick: 0,
            }),
        }
    }

    pub fn with_source(mut self, network: impl Into<String>, source: Arc<S>) -> Self {
        self.sources.insert(network.into(), source);
        self
    }

    pub fn with_max_feeds(mut self, max_feeds: usize) -> Self {
        self.max_feeds = max_feeds.max(1);
        self
    }

    pub fn networks(&self) -> Vec<&str> {
        let mut networks: Vec<&str> = self.sources.keys().map(String::as_str).collect();
        networks.sort_unstable();
        networks
    }

    fn feeds(&self) -> MutexGuard<'_, Feeds<S>> {
        self.feeds.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Validates the pair and normalizes the address.
    pub fn key(&self, network: &str, address: &str) -> Result<FeedKey, RegistryError> {
        if !self.sources.contains_key(network) {
            return Err(RegistryError::UnknownNetwork(network.to_string()));
        }
        let parsed = address.trim().parse::<Address>().map_err(|e| RegistryError::InvalidAddress {
            address: address.to_string(),
            reason: format!("{e}"),
        })?;
        Ok(FeedKey {
            network: network.to_string(),
            address: parsed.to_string().to_lowercase(),
        })
    }

    /// Tells the network's source it can drop paging state for the address.
    fn release(&self, key: &FeedKey) {
        if let Some(source) = self.sources.get(&key.network) {
            source.forget(&key.address);
        }
    }

    pub fn get_or_create(&self, network: &str, address: &str) -> Result<Arc<TransferAggregator<S>>, RegistryError> {
        let key = self.key(network, address)?;
        let source = self
            .sources
            .get(&key.network)
            .ok_or_else(|| RegistryError::UnknownNetwork(key.network.clone()))?;

        let mut feeds = self.feeds();
        feeds.tick += 1;
        let tick = feeds.tick;

        if let Some(entry) = feeds.entries.get_mut(&key) {
            entry.last_used = tick;
            return Ok(Arc::clone(&entry.aggregator));
        }

        if feeds.entries.len() >= self.max_feeds {
            let evict = feeds
                .entries
                .iter()
                .min_by_key(|(_, e)| (e.aggregator.is_processing(), e.last_used))
                .map(|(k, _)| k.clone());
            if let Some(evict) = evict {
                feeds.entries.remove(&evict);
                self.release(&evict);
                info!(
                    "Evicted transfer aggregator for {} on {} (limit {})",
                    evict.address, evict.network, self.max_feeds
                );
            }
        }

        info!("Creating transfer aggregator for {} on {}", key.address, key.network);
        let aggregator = Arc::new(TransferAggregator::new(
            Arc::clone(source),
            key.address.clone(),
            self.options,
        ));
        feeds.entries.insert(
            key,
            Entry {
                aggregator: Arc::clone(&aggregator),
                last_used: tick,
            },
        );
        Ok(aggregator)
    }

    pub fn get(&self, network: &str, address: &str) -> Result<Option<Arc<TransferAggregator<S>>>, RegistryError> {
        let key = self.key(network, address)?;
        Ok(self.feeds().entries.get(&key).map(|e| Arc::clone(&e.aggregator)))
    }

    /// Forgets the aggregator for a pair and the source's paging state for
    /// it; returns whether one existed. Holders of the old `Arc` keep an
    /// orphaned instance that can no longer page past what it has fetched.
    pub fn discard(&self, network: &str, address: &str) -> Result<bool, RegistryError> {
        let key = self.key(network, address)?;
        let removed = self.feeds().entries.remove(&key).is_some();
        if removed {
            self.release(&key);
            info!("Discarded transfer aggregator for {} on {}", key.address, key.network);
        }
        Ok(removed)
    }

    pub fn len(&self) -> usize {
        self.feeds().entries.len()
    }
}
