use crate::metrics;
use crate::rpc::{ChainClient, RpcResult};
use dashmap::DashMap;
use ethers::types::{Block, H256};
use log::debug;
use std::sync::Arc;

/// Block headers keyed by block number, fetched at most once.
///
/// Handlers use this to look up timestamps of the block an event was emitted in
/// without refetching the same header for every log.
///
/// ## Memory
///
/// With `max_size == 0` the cache is unbounded and entries are never evicted,
/// which grows with every distinct block touched. A non-zero capacity enables
/// manual eviction once the cache exceeds it.
pub struct HeaderCache {
    client: Arc<dyn ChainClient>,
    headers: DashMap<u64, Arc<Block<H256>>>,
    max_size: usize,
}

impl HeaderCache {
    pub fn new(client: Arc<dyn ChainClient>, max_size: usize) -> Self {
        Self {
            client,
            headers: DashMap::new(),
            max_size,
        }
    }

    /// Cached header for `number`, fetching it on first use.
    ///
    /// Returns `Ok(None)` when the provider does not know the block.
    pub async fn header(&self, number: u64) -> RpcResult<Option<Arc<Block<H256>>>> {
        if let Some(entry) = self.headers.get(&number) {
            metrics::increment_cache_hit("headers");
            return Ok(Some(Arc::clone(entry.value())));
        }
        metrics::increment_cache_miss("headers");

        let Some(header) = self.client.header_by_number(number).await? else {
            return Ok(None);
        };
        let header = Arc::new(header);
        // A concurrent fetch of the same number may have won; keep the first copy.
        let cached = Arc::clone(
            self.headers
                .entry(number)
                .or_insert_with(|| Arc::clone(&header))
                .value(),
        );
        self.maybe_evict();
        metrics::set_cache_size("headers", self.headers.len() as f64);
        Ok(Some(cached))
    }

    /// Cached header without triggering a fetch.
    pub fn get_cached(&self, number: u64) -> Option<Arc<Block<H256>>> {
        self.headers.get(&number).map(|e| Arc::clone(e.value()))
    }

    /// Block timestamp (unix seconds) for `number`.
    pub async fn timestamp(&self, number: u64) -> RpcResult<Option<u64>> {
        Ok(self.header(number).await?.map(|h| h.timestamp.as_u64()))
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    fn maybe_evict(&self) {
        if self.max_size == 0 || self.headers.len() <= self.max_size {
            return;
        }
        // Oldest blocks are the least likely to be asked for again.
        let to_remove = self.headers.len() - self.max_size;
        let mut numbers: Vec<u64> = self.headers.iter().map(|e| *e.key()).collect();
        numbers.sort_unstable();
        for number in numbers.into_iter().take(to_remove) {
            self.headers.remove(&number);
        }
        debug!(
            "HeaderCache: evicted {} entries (size: {})",
            to_remove,
            self.headers.len()
        );
    }
}
