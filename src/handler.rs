//! # Handler Contract
//!
//! Handlers are independently-authored callbacks that receive read-only
//! envelopes. Each invocation runs as its own task and returns an
//! `anyhow::Result<()>`; failures are reported centrally by the dispatcher.
//!
//! A handler that must finish before the driver moves to the next block returns
//! [`Completion::JoinBlock`] from [`EventHandler::completion`] (and friends).
//! Subtasks spawned from inside a handler can join the same group through
//! [`HandlerContext::block_group`], and RPC-bound subtasks should hold an
//! [`AdmissionPermit`](crate::throttle::AdmissionPermit) from
//! [`HandlerContext::throttle`] for their whole lifetime.

use crate::abi::{DecodedEvent, EventField};
use crate::header_cache::HeaderCache;
use crate::rpc::ChainClient;
use crate::task_group::TaskGroup;
use crate::throttle::AdmissionThrottle;
use async_trait::async_trait;
use ethers::abi::Token;
use ethers::types::{Address, Block, Log, Transaction, H256};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Whether the driver waits for a handler before advancing to the next block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Completion {
    /// Fire-and-forget.
    #[default]
    Detached,
    /// Tracked in the shared per-block completion group.
    JoinBlock,
}

/// A log plus whatever the schema book could decode from it.
///
/// `topics` and `data` are empty when no schema is known or decoding failed.
/// Check for the keys you need instead of relying on an error.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub log: Log,
    pub event_name: Option<String>,
    pub fields: Vec<EventField>,
    pub topics: BTreeMap<String, Token>,
    pub data: BTreeMap<String, Token>,
}

impl EventEnvelope {
    pub fn raw(log: Log) -> Self {
        Self {
            log,
            event_name: None,
            fields: Vec::new(),
            topics: BTreeMap::new(),
            data: BTreeMap::new(),
        }
    }

    pub fn decoded(log: Log, decoded: DecodedEvent) -> Self {
        Self {
            log,
            event_name: Some(decoded.name),
            fields: decoded.fields,
            topics: decoded.topics,
            data: decoded.data,
        }
    }

    pub fn signature(&self) -> Option<H256> {
        self.log.topics.first().copied()
    }

    pub fn contract(&self) -> Address {
        self.log.address
    }

    pub fn block_number(&self) -> Option<u64> {
        self.log.block_number.map(|n| n.as_u64())
    }

    pub fn is_decoded(&self) -> bool {
        self.event_name.is_some()
    }

    /// Decoded field by name, looking in indexed topics first.
    pub fn field(&self, name: &str) -> Option<&Token> {
        self.topics.get(name).or_else(|| self.data.get(name))
    }

    pub fn address_field(&self, name: &str) -> Option<Address> {
        match self.field(name)? {
            Token::Address(a) => Some(*a),
            _ => None,
        }
    }
}

/// A transaction matched by sender or recipient.
#[derive(Debug, Clone)]
pub struct TxEnvelope {
    pub transaction: Transaction,
    pub from: Address,
    pub to: Option<Address>,
    pub block: Arc<Block<Transaction>>,
}

impl TxEnvelope {
    pub fn block_number(&self) -> Option<u64> {
        self.block.number.map(|n| n.as_u64())
    }
}

#[derive(Debug, Clone)]
pub struct BlockEnvelope {
    pub block: Arc<Block<Transaction>>,
}

impl BlockEnvelope {
    pub fn number(&self) -> Option<u64> {
        self.block.number.map(|n| n.as_u64())
    }
}

/// Shared services handed to every handler invocation.
#[derive(Clone)]
pub struct HandlerContext {
    pub client: Arc<dyn ChainClient>,
    pub throttle: AdmissionThrottle,
    pub block_group: TaskGroup,
    pub headers: Arc<HeaderCache>,
}

impl HandlerContext {
    pub fn new(client: Arc<dyn ChainClient>, throttle: AdmissionThrottle, header_capacity: usize) -> Self {
        let headers = Arc::new(HeaderCache::new(Arc::clone(&client), header_capacity));
        Self {
            client,
            throttle,
            block_group: TaskGroup::new(),
            headers,
        }
    }
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;

    fn completion(&self) -> Completion {
        Completion::Detached
    }

    async fn on_event(&self, event: Arc<EventEnvelope>, ctx: HandlerContext) -> anyhow::Result<()>;
}

#[async_trait]
pub trait TxHandler: Send + Sync {
    fn name(&self) -> &str;

    fn completion(&self) -> Completion {
        Completion::Detached
    }

    async fn on_transaction(&self, tx: Arc<TxEnvelope>, ctx: HandlerContext) -> anyhow::Result<()>;
}

#[async_trait]
pub trait BlockHandler: Send + Sync {
    fn name(&self) -> &str;

    fn completion(&self) -> Completion {
        Completion::Detached
    }

    async fn on_block(&self, block: Arc<BlockEnvelope>, ctx: HandlerContext) -> anyhow::Result<()>;
}
