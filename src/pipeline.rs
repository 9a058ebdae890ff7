//! # Processing Pipeline
//!
//! The per-log and per-block path shared by the realtime listener, the pending
//! poller and the backfill engine:
//!
//! - logs: drop reorged (`removed`) logs, consult the dedup ledger during the
//!   historical→realtime handoff, then dispatch;
//! - headers: dedup by hash/number, fetch the full block (hash first, number as
//!   fallback), then process it;
//! - blocks: block handlers, one log query for the block when event handlers
//!   exist, transaction matching when tx handlers exist, and finally a wait on
//!   the shared block completion group.

use crate::dedup::{Admission, DedupLedger};
use crate::dispatch::Dispatcher;
use crate::metrics;
use crate::rpc::ChainClient;
use anyhow::{anyhow, Context, Result};
use ethers::types::{Block, BlockNumber, Log, Transaction, H256};
use log::{debug, warn};
use std::sync::Arc;

/// What happened to one log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutcome {
    /// Marked removed by a reorg and dropped.
    Removed,
    /// Already delivered during the handoff window and dropped.
    Duplicate,
    /// Dispatched to this many handler invocations.
    Dispatched(usize),
}

/// What happened to one realtime header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderOutcome {
    Processed(u64),
    Duplicate(u64),
    /// The full block could not be obtained by hash nor by number.
    Skipped,
}

#[derive(Clone)]
pub struct Pipeline {
    dispatcher: Dispatcher,
    ledger: Arc<DedupLedger>,
}

impl Pipeline {
    pub fn new(dispatcher: Dispatcher, ledger: Arc<DedupLedger>) -> Self {
        Self { dispatcher, ledger }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn ledger(&self) -> &Arc<DedupLedger> {
        &self.ledger
    }

    pub fn client(&self) -> &Arc<dyn ChainClient> {
        &self.dispatcher.context().client
    }

    pub fn handle_log(&self, log: Log) -> LogOutcome {
        if log.removed == Some(true) {
            warn!(
                "Log removed due to chain reorg (tx {:?}, block {:?}), skipping",
                log.transaction_hash, log.block_number
            );
            metrics::increment_removed_logs();
            return LogOutcome::Removed;
        }

        if self.ledger.is_switching() {
            let block_number = log.block_number.map(|n| n.as_u64()).unwrap_or_default();
            self.ledger.observe_block(block_number);
            if let (Some(tx_hash), Some(log_index)) = (log.transaction_hash, log.log_index) {
                let admission =
                    self.ledger
                        .admit_event(tx_hash, log_index.as_u64(), block_number);
                if admission == Admission::Duplicate {
                    return LogOutcome::Duplicate;
                }
            }
        }

        LogOutcome::Dispatched(self.dispatcher.dispatch_log(log))
    }

    /// Handle a realtime header: dedup, fetch the full block, process it.
    pub async fn handle_header(&self, header: &Block<H256>) -> Result<HeaderOutcome> {
        let (Some(hash), Some(number)) = (header.hash, header.number) else {
            warn!("Received header without hash or number, skipping");
            return Ok(HeaderOutcome::Skipped);
        };
        let number = number.as_u64();

        self.ledger.observe_block(number);
        if self.ledger.admit_block(hash, number) == Admission::Duplicate {
            return Ok(HeaderOutcome::Duplicate(number));
        }

        let Some(block) = self.fetch_block(hash, number).await else {
            warn!(
                "Failed to get block {} ({:?}) by hash and by number, skipping",
                number, hash
            );
            return Ok(HeaderOutcome::Skipped);
        };
        self.process_block(Arc::new(block)).await?;
        Ok(HeaderOutcome::Processed(number))
    }

    async fn fetch_block(&self, hash: H256, number: u64) -> Option<Block<Transaction>> {
        match self.client().block_by_hash(hash).await {
            Ok(Some(block)) => return Some(block),
            Ok(None) => debug!("Block {:?} not found by hash, retrying by number", hash),
            Err(e) => debug!("Failed to get block {:?} by hash ({}), retrying by number", hash, e),
        }
        match self
            .client()
            .block_by_number(BlockNumber::Number(number.into()))
            .await
        {
            Ok(block) => block,
            Err(e) => {
                debug!("Failed to get block {} by number: {}", number, e);
                None
            }
        }
    }

    /// Run every handler family for a full block, then wait for the block's
    /// completion group.
    pub async fn process_block(&self, block: Arc<Block<Transaction>>) -> Result<()> {
        let number = block
            .number
            .map(|n| n.as_u64())
            .ok_or_else(|| anyhow!("Block {:?} has no number", block.hash))?;
        let registry = self.dispatcher.registry();

        self.dispatcher.dispatch_block(&block);

        if registry.has_event_handlers() {
            let filter = registry.filter_state().range_filter(number, number);
            let logs = self
                .client()
                .logs(&filter)
                .await
                .with_context(|| format!("Failed to query logs for block {}", number))?;
            for log in logs {
                self.handle_log(log);
            }
        }

        if registry.has_tx_handlers() {
            self.dispatcher.dispatch_transactions(&block);
        }

        self.dispatcher.context().block_group.wait().await;
        metrics::increment_blocks_processed();
        Ok(())
    }
}
