// Shared fixtures for integration tests: an in-memory chain client that records
// every call, and recording handlers.
#![allow(dead_code)]

use async_trait::async_trait;
use ethers::providers::ProviderError;
use ethers::types::{
    Address, Block, BlockNumber, Bytes, Filter, Log, Transaction, H256, U256, U64,
};
use futures::stream::{self, BoxStream};
use futures_util::StreamExt;
use mig_chain_tracker::abi::{event_signature_hash, SignatureBook};
use mig_chain_tracker::dedup::DedupLedger;
use mig_chain_tracker::dispatch::Dispatcher;
use mig_chain_tracker::handler::{
    BlockEnvelope, BlockHandler, Completion, EventEnvelope, EventHandler, HandlerContext,
    TxEnvelope, TxHandler,
};
use mig_chain_tracker::pipeline::Pipeline;
use mig_chain_tracker::registry::HandlerRegistry;
use mig_chain_tracker::rpc::{ChainClient, RpcResult};
use mig_chain_tracker::throttle::AdmissionThrottle;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const TRANSFER: &str = "Transfer(address,address,uint256)";
pub const TRANSFER_DECL: &str =
    "event Transfer(address indexed from, address indexed to, uint256 value)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    ChainId,
    BlockNumber,
    BlockByHash(H256),
    BlockByNumber(Option<u64>),
    Pending,
    Header(u64),
    Logs { from: u64, to: u64 },
    SubscribeLogs,
    SubscribeHeads,
}

#[derive(Default)]
struct MockState {
    blocks: HashMap<u64, Block<Transaction>>,
    logs: Vec<Log>,
    pending: VecDeque<Block<Transaction>>,
    log_streams: VecDeque<Vec<Log>>,
    head_streams: VecDeque<Vec<Block<H256>>>,
    calls: Vec<(Call, tokio::time::Instant)>,
    latest: u64,
    fail_by_hash: bool,
    fail_logs: bool,
}

/// In-memory [`ChainClient`]. Subscriptions replay scripted streams in order
/// and fail once the script is exhausted.
#[derive(Default)]
pub struct MockChain {
    state: Mutex<MockState>,
}

impl MockChain {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record(&self, call: Call) {
        self.state
            .lock()
            .unwrap()
            .calls
            .push((call, tokio::time::Instant::now()));
    }

    pub fn add_block(&self, block: Block<Transaction>) {
        let mut state = self.state.lock().unwrap();
        let number = block.number.unwrap().as_u64();
        state.latest = state.latest.max(number);
        state.blocks.insert(number, block);
    }

    pub fn add_log(&self, log: Log) {
        self.state.lock().unwrap().logs.push(log);
    }

    pub fn push_pending(&self, block: Block<Transaction>) {
        self.state.lock().unwrap().pending.push_back(block);
    }

    pub fn script_log_stream(&self, logs: Vec<Log>) {
        self.state.lock().unwrap().log_streams.push_back(logs);
    }

    pub fn script_head_stream(&self, heads: Vec<Block<H256>>) {
        self.state.lock().unwrap().head_streams.push_back(heads);
    }

    pub fn set_latest(&self, latest: u64) {
        self.state.lock().unwrap().latest = latest;
    }

    pub fn fail_by_hash(&self) {
        self.state.lock().unwrap().fail_by_hash = true;
    }

    pub fn fail_logs(&self) {
        self.state.lock().unwrap().fail_logs = true;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .map(|(c, _)| c.clone())
            .collect()
    }

    pub fn timed_calls(&self) -> Vec<(Call, tokio::time::Instant)> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn log_queries(&self) -> Vec<(u64, u64)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Logs { from, to } => Some((from, to)),
                _ => None,
            })
            .collect()
    }

    pub fn blocks_fetched_by_number(&self) -> Vec<u64> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::BlockByNumber(Some(n)) => Some(n),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn chain_id(&self) -> RpcResult<U256> {
        self.record(Call::ChainId);
        Ok(U256::from(1))
    }

    async fn block_number(&self) -> RpcResult<u64> {
        self.record(Call::BlockNumber);
        Ok(self.state.lock().unwrap().latest)
    }

    async fn block_by_hash(&self, hash: H256) -> RpcResult<Option<Block<Transaction>>> {
        self.record(Call::BlockByHash(hash));
        let state = self.state.lock().unwrap();
        if state.fail_by_hash {
            return Err(ProviderError::CustomError("by-hash unavailable".into()));
        }
        Ok(state.blocks.values().find(|b| b.hash == Some(hash)).cloned())
    }

    async fn block_by_number(&self, number: BlockNumber) -> RpcResult<Option<Block<Transaction>>> {
        match number {
            BlockNumber::Number(n) => {
                let n = n.as_u64();
                self.record(Call::BlockByNumber(Some(n)));
                Ok(self.state.lock().unwrap().blocks.get(&n).cloned())
            }
            BlockNumber::Pending => {
                self.record(Call::Pending);
                let mut state = self.state.lock().unwrap();
                // keep returning the last pending block once the script runs out
                let block = if state.pending.len() > 1 {
                    state.pending.pop_front()
                } else {
                    state.pending.front().cloned()
                };
                Ok(block)
            }
            _ => {
                self.record(Call::BlockByNumber(None));
                let state = self.state.lock().unwrap();
                Ok(state.blocks.get(&state.latest).cloned())
            }
        }
    }

    async fn header_by_number(&self, number: u64) -> RpcResult<Option<Block<H256>>> {
        self.record(Call::Header(number));
        Ok(self
            .state
            .lock()
            .unwrap()
            .blocks
            .get(&number)
            .map(|b| header_of(b)))
    }

    async fn logs(&self, filter: &Filter) -> RpcResult<Vec<Log>> {
        let from = filter.get_from_block().map(|n| n.as_u64()).unwrap_or_default();
        let to = filter.get_to_block().map(|n| n.as_u64()).unwrap_or(u64::MAX);
        self.record(Call::Logs { from, to });
        let state = self.state.lock().unwrap();
        if state.fail_logs {
            return Err(ProviderError::CustomError("logs unavailable".into()));
        }
        Ok(state
            .logs
            .iter()
            .filter(|l| {
                let n = l.block_number.map(|n| n.as_u64()).unwrap_or_default();
                n >= from && n <= to
            })
            .cloned()
            .collect())
    }

    async fn subscribe_logs<'a>(&'a self, _filter: &Filter) -> RpcResult<BoxStream<'a, Log>> {
        self.record(Call::SubscribeLogs);
        match self.state.lock().unwrap().log_streams.pop_front() {
            Some(logs) => Ok(stream::iter(logs).boxed()),
            None => Err(ProviderError::CustomError("subscription refused".into())),
        }
    }

    async fn subscribe_new_heads<'a>(&'a self) -> RpcResult<BoxStream<'a, Block<H256>>> {
        self.record(Call::SubscribeHeads);
        match self.state.lock().unwrap().head_streams.pop_front() {
            Some(heads) => Ok(stream::iter(heads).boxed()),
            None => Err(ProviderError::CustomError("subscription refused".into())),
        }
    }
}

// ---- chain data builders ----

pub fn addr(n: u64) -> Address {
    Address::from_low_u64_be(n)
}

pub fn block_hash(number: u64) -> H256 {
    H256::from_low_u64_be(0xb10c_0000 + number)
}

pub fn tx_hash(n: u64) -> H256 {
    H256::from_low_u64_be(0x7000_0000 + n)
}

pub fn block(number: u64, transactions: Vec<Transaction>) -> Block<Transaction> {
    Block {
        hash: Some(block_hash(number)),
        number: Some(U64::from(number)),
        timestamp: U256::from(1_700_000_000u64 + number * 12),
        transactions,
        ..Default::default()
    }
}

pub fn header_of(block: &Block<Transaction>) -> Block<H256> {
    Block {
        hash: block.hash,
        number: block.number,
        timestamp: block.timestamp,
        transactions: block.transactions.iter().map(|t| t.hash).collect(),
        ..Default::default()
    }
}

pub fn header(number: u64) -> Block<H256> {
    header_of(&block(number, vec![]))
}

pub fn transaction(n: u64, from: Address, to: Option<Address>, value: u64) -> Transaction {
    Transaction {
        hash: tx_hash(n),
        from,
        to,
        value: U256::from(value),
        ..Default::default()
    }
}

/// A Transfer log from `token` at (`block`, `tx`, `index`).
pub fn transfer_log(token: Address, block: u64, tx: u64, index: u64, from: Address, to: Address, value: u64) -> Log {
    let mut data = [0u8; 32];
    U256::from(value).to_big_endian(&mut data);
    Log {
        address: token,
        topics: vec![event_signature_hash(TRANSFER), H256::from(from), H256::from(to)],
        data: Bytes::from(data.to_vec()),
        block_hash: Some(block_hash(block)),
        block_number: Some(U64::from(block)),
        transaction_hash: Some(tx_hash(tx)),
        log_index: Some(U256::from(index)),
        removed: Some(false),
        ..Default::default()
    }
}

pub fn transfer_book() -> SignatureBook {
    let mut book = SignatureBook::new();
    book.add_human_readable(TRANSFER_DECL).unwrap();
    book
}

pub fn transfer_registry() -> Arc<HandlerRegistry> {
    Arc::new(HandlerRegistry::new(Arc::new(transfer_book())))
}

/// Pipeline over `chain` with the given registry and throttle ceiling.
pub fn pipeline(chain: &Arc<MockChain>, registry: Arc<HandlerRegistry>, max_rps: usize) -> Pipeline {
    let client: Arc<dyn ChainClient> = chain.clone();
    let ctx = HandlerContext::new(client, AdmissionThrottle::new(max_rps), 0);
    Pipeline::new(Dispatcher::new(registry, ctx), Arc::new(DedupLedger::default()))
}

/// Yield until spawned handler tasks have had a chance to run.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

// ---- recording handlers ----

#[derive(Default)]
pub struct Recorder {
    pub events: Mutex<Vec<Arc<EventEnvelope>>>,
    pub transactions: Mutex<Vec<Arc<TxEnvelope>>>,
    pub blocks: Mutex<Vec<u64>>,
    pub completion: Completion,
    /// Hold an admission permit for this long inside every event invocation.
    pub hold_permit: Option<Duration>,
    /// Sleep this long inside every block invocation.
    pub block_delay: Option<Duration>,
    pub fail: bool,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn event_keys(&self) -> Vec<(H256, u64)> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| {
                (
                    e.log.transaction_hash.unwrap_or_default(),
                    e.log.log_index.unwrap_or_default().as_u64(),
                )
            })
            .collect()
    }

    pub fn tx_count(&self) -> usize {
        self.transactions.lock().unwrap().len()
    }

    pub fn block_numbers(&self) -> Vec<u64> {
        self.blocks.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventHandler for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn completion(&self) -> Completion {
        self.completion
    }

    async fn on_event(&self, event: Arc<EventEnvelope>, ctx: HandlerContext) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(event);
        if let Some(hold) = self.hold_permit {
            let _permit = ctx.throttle.admit();
            tokio::time::sleep(hold).await;
        }
        if self.fail {
            anyhow::bail!("recorder asked to fail");
        }
        Ok(())
    }
}

#[async_trait]
impl TxHandler for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn completion(&self) -> Completion {
        self.completion
    }

    async fn on_transaction(&self, tx: Arc<TxEnvelope>, _ctx: HandlerContext) -> anyhow::Result<()> {
        self.transactions.lock().unwrap().push(tx);
        Ok(())
    }
}

#[async_trait]
impl BlockHandler for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn completion(&self) -> Completion {
        self.completion
    }

    async fn on_block(&self, block: Arc<BlockEnvelope>, _ctx: HandlerContext) -> anyhow::Result<()> {
        if let Some(delay) = self.block_delay {
            tokio::time::sleep(delay).await;
        }
        self.blocks
            .lock()
            .unwrap()
            .push(block.number().unwrap_or_default());
        Ok(())
    }
}
