//! # Pending-Block Poller
//!
//! Polls the provider's `pending` block on a fixed tick and runs every block
//! number it has not seen before through the block pipeline. The dedup ledger is
//! not involved; a simple seen-set keyed by block number is enough.

use crate::pipeline::Pipeline;
use anyhow::{Context, Result};
use ethers::types::BlockNumber;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, info_span, warn, Instrument};

pub const DEFAULT_PENDING_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Processed(u64),
    AlreadySeen(u64),
    /// The provider returned no pending block (or one without a number).
    Unavailable,
}

pub struct PendingPoller {
    pipeline: Pipeline,
    interval: Duration,
    seen: HashSet<u64>,
}

impl PendingPoller {
    pub fn new(pipeline: Pipeline, interval: Duration) -> Self {
        Self {
            pipeline,
            interval,
            seen: HashSet::new(),
        }
    }

    /// Poll forever. A failed pending-block fetch is fatal.
    pub async fn run(&mut self) -> Result<()> {
        let interval = self.interval;
        async move {
            warn!("Listening to pending blocks, data may never be confirmed");
            let chain_id = self
                .pipeline
                .client()
                .chain_id()
                .await
                .context("Failed to get chain id")?;
            info!("Polling pending blocks on chain {} every {:?}", chain_id, interval);

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                self.poll_once().await?;
            }
        }
        .instrument(info_span!("pending"))
        .await
    }

    /// Fetch the pending block once and process it if its number is new.
    pub async fn poll_once(&mut self) -> Result<PollOutcome> {
        let block = self
            .pipeline
            .client()
            .block_by_number(BlockNumber::Pending)
            .await
            .context("Failed to get pending block")?;
        let Some(block) = block else {
            debug!("Provider returned no pending block");
            return Ok(PollOutcome::Unavailable);
        };
        let Some(number) = block.number.map(|n| n.as_u64()) else {
            debug!("Pending block has no number yet");
            return Ok(PollOutcome::Unavailable);
        };

        if !self.seen.insert(number) {
            return Ok(PollOutcome::AlreadySeen(number));
        }
        self.pipeline.process_block(Arc::new(block)).await?;
        Ok(PollOutcome::Processed(number))
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }
}
