//! # Chain RPC Client
//!
//! The tracker talks to the chain through [`ChainClient`], a narrow trait over the
//! primitives the ingestion engine needs: header and log subscriptions, block
//! lookups by hash/number (including `pending`), log filter queries and headers.
//!
//! [`WsChainClient`] implements it on top of an `ethers` websocket provider and
//! records every call (method, latency, outcome) the same way the rest of the SDK
//! accounts for RPC usage.

use crate::metrics;
use anyhow::{Context, Result};
use async_trait::async_trait;
use ethers::prelude::{Middleware, Provider, Ws};
use ethers::providers::ProviderError;
use ethers::types::{Block, BlockId, BlockNumber, Filter, Log, Transaction, H256, U256};
use futures::stream::BoxStream;
use futures_util::StreamExt;
use log::{debug, info};
use std::time::Instant;
use url::Url;

pub type RpcResult<T> = std::result::Result<T, ProviderError>;

/// Chain access used by listeners, the backfill engine and handlers.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn chain_id(&self) -> RpcResult<U256>;

    /// Latest block number.
    async fn block_number(&self) -> RpcResult<u64>;

    async fn block_by_hash(&self, hash: H256) -> RpcResult<Option<Block<Transaction>>>;

    /// Full block (with transactions) by number or tag, e.g. `BlockNumber::Pending`.
    async fn block_by_number(&self, number: BlockNumber)
        -> RpcResult<Option<Block<Transaction>>>;

    /// Header-only block lookup.
    async fn header_by_number(&self, number: u64) -> RpcResult<Option<Block<H256>>>;

    async fn logs(&self, filter: &Filter) -> RpcResult<Vec<Log>>;

    /// Open a log subscription. The stream ends when the subscription drops.
    async fn subscribe_logs<'a>(&'a self, filter: &Filter) -> RpcResult<BoxStream<'a, Log>>;

    /// Open a `newHeads` subscription. The stream ends when the subscription drops.
    async fn subscribe_new_heads<'a>(&'a self) -> RpcResult<BoxStream<'a, Block<H256>>>;
}

/// Convert any RPC URL to its websocket form (`http` → `ws`, `https` → `wss`).
pub fn to_ws_url(provider_url: &str) -> Result<String> {
    let ws_url = if provider_url.starts_with("http://") {
        provider_url.replacen("http://", "ws://", 1)
    } else if provider_url.starts_with("https://") {
        provider_url.replacen("https://", "wss://", 1)
    } else if provider_url.starts_with("ws://") || provider_url.starts_with("wss://") {
        provider_url.to_string()
    } else {
        format!("ws://{}", provider_url)
    };
    Url::parse(&ws_url).with_context(|| format!("Invalid RPC URL: {}", provider_url))?;
    Ok(ws_url)
}

/// `ethers` websocket provider with per-call accounting.
pub struct WsChainClient {
    provider: Provider<Ws>,
    endpoint: String,
}

impl WsChainClient {
    /// Connect to a websocket endpoint (http URLs are rewritten to ws).
    pub async fn connect(provider_url: &str) -> Result<Self> {
        let ws_url = to_ws_url(provider_url)?;
        info!("[RPC] Connecting to {}", ws_url);
        let provider = Provider::<Ws>::connect(ws_url.as_str())
            .await
            .context("Failed to connect to WebSocket provider")?;
        info!("[RPC] Connected");
        Ok(Self {
            provider,
            endpoint: ws_url,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn record<T>(&self, method: &'static str, start: Instant, result: &RpcResult<T>) {
        let duration = start.elapsed();
        metrics::record_rpc_call(method, duration, result.is_ok());
        debug!(
            "[RPC_TRACE] {} -> {}: duration={:?}, ok={}",
            self.endpoint,
            method,
            duration,
            result.is_ok()
        );
    }
}

#[async_trait]
impl ChainClient for WsChainClient {
    async fn chain_id(&self) -> RpcResult<U256> {
        let start = Instant::now();
        let result = self.provider.get_chainid().await;
        self.record("eth_chainId", start, &result);
        result
    }

    async fn block_number(&self) -> RpcResult<u64> {
        let start = Instant::now();
        let result = self.provider.get_block_number().await.map(|n| n.as_u64());
        self.record("eth_blockNumber", start, &result);
        result
    }

    async fn block_by_hash(&self, hash: H256) -> RpcResult<Option<Block<Transaction>>> {
        let start = Instant::now();
        let result = self.provider.get_block_with_txs(BlockId::Hash(hash)).await;
        self.record("eth_getBlockByHash", start, &result);
        result
    }

    async fn block_by_number(
        &self,
        number: BlockNumber,
    ) -> RpcResult<Option<Block<Transaction>>> {
        let start = Instant::now();
        let result = self.provider.get_block_with_txs(BlockId::Number(number)).await;
        self.record("eth_getBlockByNumber", start, &result);
        result
    }

    async fn header_by_number(&self, number: u64) -> RpcResult<Option<Block<H256>>> {
        let start = Instant::now();
        let result = self
            .provider
            .get_block(BlockId::Number(BlockNumber::Number(number.into())))
            .await;
        self.record("eth_getBlockByNumber", start, &result);
        result
    }

    async fn logs(&self, filter: &Filter) -> RpcResult<Vec<Log>> {
        let start = Instant::now();
        let result = self.provider.get_logs(filter).await;
        self.record("eth_getLogs", start, &result);
        result
    }

    async fn subscribe_logs<'a>(&'a self, filter: &Filter) -> RpcResult<BoxStream<'a, Log>> {
        let start = Instant::now();
        let result = self.provider.subscribe_logs(filter).await;
        self.record("eth_subscribe", start, &result);
        Ok(result?.boxed())
    }

    async fn subscribe_new_heads<'a>(&'a self) -> RpcResult<BoxStream<'a, Block<H256>>> {
        let start = Instant::now();
        let result = self.provider.subscribe_blocks().await;
        self.record("eth_subscribe", start, &result);
        Ok(result?.boxed())
    }
}
