//! # Historical Backfill Engine
//!
//! Replays a bounded block range through the same pipeline as the realtime
//! listener.
//!
//! - **events**: one log query per `step_blocks`-wide inclusive sub-range.
//!   After every dispatched log the admission throttle applies backpressure.
//! - **blocks, sequential**: one block at a time, ascending or descending; the
//!   next block is fetched only after the previous block's completion group
//!   drained.
//! - **blocks, batched**: ascending only. Fetch-and-process tasks are spawned
//!   without waiting; whenever the block number is a multiple of the batch size
//!   every outstanding task is awaited.
//!
//! Any RPC failure during a backfill is fatal.

use crate::pipeline::Pipeline;
use crate::rpc::ChainClient;
use crate::utils::{block_chunks, describe_filter};
use anyhow::{Context, Result};
use ethers::providers::ProviderError;
use ethers::types::{Block, BlockNumber, Transaction};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, Instrument};

pub const DEFAULT_STEP_BLOCKS: u64 = 10_000;
pub const DEFAULT_BLOCK_BATCH_SIZE: u64 = 100;

/// Blocks between progress lines in block mode.
const PROGRESS_EVERY: u64 = 100;

#[derive(Debug, thiserror::Error)]
pub enum BackfillError {
    #[error("from-block not set")]
    MissingFromBlock,
    #[error("Batched block fetching cannot loop backwards ({from_block} -> {to_block})")]
    BackwardBatch { from_block: u64, to_block: u64 },
    #[error("Could not retrieve block {block}: {source}")]
    BlockFetch {
        block: u64,
        #[source]
        source: ProviderError,
    },
    #[error("Block {0} not found")]
    MissingBlock(u64),
    #[error("Could not query logs for blocks {from_block}-{to_block}: {source}")]
    LogQuery {
        from_block: u64,
        to_block: u64,
        #[source]
        source: ProviderError,
    },
    #[error("Could not get latest block number: {0}")]
    LatestBlock(#[source] ProviderError),
}

/// Resolved backfill parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackfillPlan {
    pub from_block: u64,
    pub to_block: u64,
    pub step_blocks: u64,
    pub batch_fetch_blocks: bool,
    pub block_batch_size: u64,
}

impl BackfillPlan {
    pub fn new(from_block: u64, to_block: u64) -> Self {
        Self {
            from_block,
            to_block,
            step_blocks: DEFAULT_STEP_BLOCKS,
            batch_fetch_blocks: false,
            block_batch_size: DEFAULT_BLOCK_BATCH_SIZE,
        }
    }

    /// Build a plan from optional bounds. `from_block` is required; a missing
    /// `to_block` resolves to the latest block.
    pub async fn resolve(
        from_block: Option<u64>,
        to_block: Option<u64>,
        client: &dyn ChainClient,
    ) -> Result<Self, BackfillError> {
        let from_block = from_block.ok_or(BackfillError::MissingFromBlock)?;
        let to_block = match to_block {
            Some(n) => n,
            None => client
                .block_number()
                .await
                .map_err(BackfillError::LatestBlock)?,
        };
        Ok(Self::new(from_block, to_block))
    }

    pub fn with_step_blocks(mut self, step_blocks: u64) -> Self {
        self.step_blocks = step_blocks.max(1);
        self
    }

    pub fn with_batch_fetch(mut self, enabled: bool, batch_size: u64) -> Self {
        self.batch_fetch_blocks = enabled;
        self.block_batch_size = batch_size.max(1);
        self
    }

    pub fn loop_backwards(&self) -> bool {
        self.from_block > self.to_block
    }

    /// Highest block the plan touches.
    pub fn last_block(&self) -> u64 {
        self.from_block.max(self.to_block)
    }

    /// Reject combinations that cannot run, before anything is fetched.
    pub fn validate_blocks(&self) -> Result<(), BackfillError> {
        if self.batch_fetch_blocks && self.loop_backwards() {
            return Err(BackfillError::BackwardBatch {
                from_block: self.from_block,
                to_block: self.to_block,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillReport {
    pub queries: usize,
    pub logs: usize,
    pub blocks: u64,
}

pub struct BackfillEngine {
    pipeline: Pipeline,
}

impl BackfillEngine {
    pub fn new(pipeline: Pipeline) -> Self {
        Self { pipeline }
    }

    /// Replay every log matching the global filter in the plan's range.
    ///
    /// Event mode always walks ascending; a reversed range is normalised.
    pub async fn backfill_events(&self, plan: &BackfillPlan) -> Result<BackfillReport> {
        let (low, high) = if plan.loop_backwards() {
            (plan.to_block, plan.from_block)
        } else {
            (plan.from_block, plan.to_block)
        };
        self.run_events(low, high, plan.step_blocks)
            .instrument(info_span!("historical", mode = "events"))
            .await
    }

    async fn run_events(&self, low: u64, high: u64, step_blocks: u64) -> Result<BackfillReport> {
        let registry = self.pipeline.dispatcher().registry();
        let filter_state = registry.filter_state();
        let throttle = &self.pipeline.dispatcher().context().throttle;
        let ledger = self.pipeline.ledger();
        let chunks = block_chunks(low, high, step_blocks);
        let total = chunks.remaining();
        info!(
            "Processing historical events from block {} to {} in {} steps of {} blocks ({})",
            low,
            high,
            total,
            step_blocks,
            describe_filter(&filter_state)
        );

        let started = Instant::now();
        let mut report = BackfillReport::default();
        for (index, (from_block, to_block)) in chunks.enumerate() {
            let filter = filter_state.range_filter(from_block, to_block);
            let logs = self
                .pipeline
                .client()
                .logs(&filter)
                .await
                .map_err(|source| BackfillError::LogQuery {
                    from_block,
                    to_block,
                    source,
                })?;
            report.queries += 1;
            info!(
                "[{}/{}] {} events from blocks {}-{}",
                index + 1,
                total,
                logs.len(),
                from_block,
                to_block
            );

            for log in logs {
                let replay_key = (
                    log.transaction_hash,
                    log.log_index,
                    log.block_number.map(|n| n.as_u64()),
                );
                self.pipeline.handle_log(log);
                if let (Some(tx_hash), Some(log_index), Some(block_number)) = replay_key {
                    ledger.record_replayed_event(tx_hash, log_index.as_u64(), block_number);
                }
                report.logs += 1;
                throttle.backpressure().await;
            }
            report.blocks += to_block - from_block + 1;
        }
        info!(
            "Historical events done: {} logs in {} queries ({:?})",
            report.logs,
            report.queries,
            started.elapsed()
        );
        Ok(report)
    }

    /// Replay every block in the plan's range through the block pipeline.
    pub async fn backfill_blocks(&self, plan: &BackfillPlan) -> Result<BackfillReport> {
        plan.validate_blocks()?;
        let span = info_span!(
            "historical",
            mode = "blocks",
            batched = plan.batch_fetch_blocks
        );
        if plan.batch_fetch_blocks {
            self.run_blocks_batched(plan).instrument(span).await
        } else {
            self.run_blocks_sequential(plan).instrument(span).await
        }
    }

    async fn run_blocks_sequential(&self, plan: &BackfillPlan) -> Result<BackfillReport> {
        let numbers: Box<dyn Iterator<Item = u64> + Send> = if plan.loop_backwards() {
            info!(
                "Looping backwards from block {} to {}",
                plan.from_block, plan.to_block
            );
            Box::new((plan.to_block..=plan.from_block).rev())
        } else {
            info!(
                "Processing historical blocks from {} to {}",
                plan.from_block, plan.to_block
            );
            Box::new(plan.from_block..=plan.to_block)
        };

        let mut report = BackfillReport::default();
        for number in numbers {
            let block = fetch_block(self.pipeline.client().as_ref(), number).await?;
            replay_block(&self.pipeline, block, number).await?;
            report.blocks += 1;
            if report.blocks % PROGRESS_EVERY == 0 {
                info!("Processed {} blocks (at block {})", report.blocks, number);
            }
        }
        info!("Historical blocks done: {} blocks", report.blocks);
        Ok(report)
    }

    async fn run_blocks_batched(&self, plan: &BackfillPlan) -> Result<BackfillReport> {
        info!(
            "Batch fetching historical blocks from {} to {} (batches of {})",
            plan.from_block, plan.to_block, plan.block_batch_size
        );
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();
        let mut report = BackfillReport::default();
        for number in plan.from_block..=plan.to_block {
            let pipeline = self.pipeline.clone();
            tasks.spawn(async move {
                let block = fetch_block(pipeline.client().as_ref(), number).await?;
                replay_block(&pipeline, block, number).await
            });
            report.blocks += 1;

            if number % plan.block_batch_size == 0 {
                debug!("Block {}: waiting for {} block tasks", number, tasks.len());
                drain(&mut tasks).await?;
                info!("Processed {} blocks (at block {})", report.blocks, number);
            }
        }
        drain(&mut tasks).await?;
        info!("Historical blocks done: {} blocks", report.blocks);
        Ok(report)
    }
}

async fn fetch_block(
    client: &dyn ChainClient,
    number: u64,
) -> Result<Block<Transaction>, BackfillError> {
    match client
        .block_by_number(BlockNumber::Number(number.into()))
        .await
    {
        Ok(Some(block)) => Ok(block),
        Ok(None) => Err(BackfillError::MissingBlock(number)),
        Err(source) => Err(BackfillError::BlockFetch {
            block: number,
            source,
        }),
    }
}

async fn replay_block(pipeline: &Pipeline, block: Block<Transaction>, number: u64) -> Result<()> {
    if let Some(hash) = block.hash {
        pipeline.ledger().record_replayed_block(hash, number);
    }
    pipeline.process_block(Arc::new(block)).await
}

async fn drain(tasks: &mut JoinSet<Result<()>>) -> Result<()> {
    while let Some(joined) = tasks.join_next().await {
        joined.context("Block task panicked")??;
    }
    Ok(())
}
