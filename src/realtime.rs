//! # Realtime Listener
//!
//! Two subscription-driven modes:
//!
//! - **events**: one aggregated log subscription built from the frozen
//!   [`FilterState`](crate::registry::FilterState); every log goes through
//!   [`Pipeline::handle_log`].
//! - **blocks**: a `newHeads` subscription; every header goes through
//!   [`Pipeline::handle_header`], which waits on the block completion group
//!   before the next header is read.
//!
//! Opening a subscription is retried at a fixed interval. When an open stream
//! ends the listener waits the same interval and resubscribes. Only running out
//! of retries (when a limit is configured) or a fatal block-processing error
//! ends the listener.

use crate::pipeline::Pipeline;
use crate::rpc::RpcResult;
use crate::utils::describe_filter;
use anyhow::{Context, Result};
use futures::stream::BoxStream;
use futures_util::StreamExt;
use std::future::Future;
use std::time::Duration;
use tokio_retry::strategy::FixedInterval;
use tokio_retry::Retry;
use tracing::{debug, info, info_span, warn, Instrument};

pub const DEFAULT_RESUBSCRIBE_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy)]
pub struct ResubscribePolicy {
    pub backoff: Duration,
    /// Retries per subscription attempt; 0 retries forever.
    pub attempts: usize,
}

impl Default for ResubscribePolicy {
    fn default() -> Self {
        Self {
            backoff: DEFAULT_RESUBSCRIBE_BACKOFF,
            attempts: 0,
        }
    }
}

pub struct RealtimeListener {
    pipeline: Pipeline,
    policy: ResubscribePolicy,
}

impl RealtimeListener {
    pub fn new(pipeline: Pipeline, policy: ResubscribePolicy) -> Self {
        Self { pipeline, policy }
    }

    /// Listen for logs matching the global filter. Returns only on a fatal error.
    pub async fn listen_events(&self) -> Result<()> {
        self.run_events()
            .instrument(info_span!("realtime", mode = "events"))
            .await
    }

    /// Listen for new heads and process each full block. Returns only on a fatal error.
    pub async fn listen_blocks(&self) -> Result<()> {
        self.run_blocks()
            .instrument(info_span!("realtime", mode = "blocks"))
            .await
    }

    async fn run_events(&self) -> Result<()> {
        let client = self.pipeline.client();
        let filter_state = self.pipeline.dispatcher().registry().filter_state();
        let filter = filter_state.to_filter();
        let chain_id = client.chain_id().await.context("Failed to get chain id")?;
        info!(
            "Listening for events on chain {} ({})",
            chain_id,
            describe_filter(&filter_state)
        );

        loop {
            let mut stream = self
                .subscribe("logs", || client.subscribe_logs(&filter))
                .await
                .context("Failed to subscribe to logs")?;
            info!("Subscribed to logs");

            let mut received = 0u64;
            while let Some(log) = stream.next().await {
                received += 1;
                self.pipeline.handle_log(log);
            }
            drop(stream);
            warn!(
                "Log subscription ended after {} logs, resubscribing in {:?}",
                received, self.policy.backoff
            );
            tokio::time::sleep(self.policy.backoff).await;
        }
    }

    async fn run_blocks(&self) -> Result<()> {
        let client = self.pipeline.client();
        let chain_id = client.chain_id().await.context("Failed to get chain id")?;
        info!(
            "Listening for blocks on chain {} ({})",
            chain_id,
            describe_filter(&self.pipeline.dispatcher().registry().filter_state())
        );

        loop {
            let mut stream = self
                .subscribe("new heads", || client.subscribe_new_heads())
                .await
                .context("Failed to subscribe to new heads")?;
            info!("Subscribed to new heads");

            while let Some(header) = stream.next().await {
                let outcome = self.pipeline.handle_header(&header).await?;
                debug!("Header {:?}: {:?}", header.number, outcome);
            }
            drop(stream);
            warn!(
                "Header subscription ended, resubscribing in {:?}",
                self.policy.backoff
            );
            tokio::time::sleep(self.policy.backoff).await;
        }
    }

    async fn subscribe<'a, T, F, Fut>(&self, what: &str, mut open: F) -> RpcResult<BoxStream<'a, T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RpcResult<BoxStream<'a, T>>>,
    {
        let attempts = match self.policy.attempts {
            0 => usize::MAX,
            n => n,
        };
        let backoff = self.policy.backoff;
        let strategy = FixedInterval::new(backoff).take(attempts);
        Retry::start(strategy, || {
            let attempt = open();
            async move {
                let result = attempt.await;
                if let Err(e) = &result {
                    warn!("Failed to subscribe to {}: {}, retrying in {:?}", what, e, backoff);
                }
                result
            }
        })
        .await
    }
}
