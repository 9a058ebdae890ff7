use crate::behavior::{Behavior, BehaviorInfo, BehaviorOptions};
use crate::handler::{
    BlockEnvelope, BlockHandler, EventEnvelope, EventHandler, HandlerContext, TxEnvelope,
    TxHandler,
};
use crate::registry::HandlerRegistry;
use anyhow::Result;
use async_trait::async_trait;
use ethers::utils::format_ether;
use log::info;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub const NAME: &str = "logging";

pub fn build() -> Arc<dyn Behavior> {
    Arc::new(Logging::default())
}

#[derive(Debug, Default)]
struct LogCounters {
    events: AtomicU64,
    transactions: AtomicU64,
    blocks: AtomicU64,
}

/// Logs events of configured contracts, transactions touching configured
/// addresses and, optionally, every processed block.
#[derive(Default)]
pub struct Logging {
    counters: Arc<LogCounters>,
}

#[async_trait]
impl Behavior for Logging {
    fn info(&self) -> BehaviorInfo {
        BehaviorInfo {
            name: "Logging",
            overview: "Logs events and transactions of the configured addresses, and optionally every block.",
            description: "Useful for following what specific contracts or accounts do. Events are \
                decoded when their signature is in the event signatures file, otherwise the raw \
                topics and data are logged.",
            options: "\"log-events\" - bool, log every event emitted by the addresses (default true)\n\
                \"log-transactions\" - bool, log transactions sent from or to the addresses (default true)\n\
                \"log-blocks\" - bool, log every processed block (default false)",
            example: "[behaviors.logging]\n\
                enabled = true\n\
                [behaviors.logging.addresses.\"0xdAC17F958D2ee523a2206206994597C13D831ec7\"]\n\
                [behaviors.logging.options]\n\
                log-events = true\n\
                log-transactions = true\n\
                log-blocks = false",
        }
    }

    fn init(&self, options: &BehaviorOptions, registry: &HandlerRegistry) -> Result<()> {
        let log_events = options.bool_option("log-events", true)?;
        let log_transactions = options.bool_option("log-transactions", true)?;
        let log_blocks = options.bool_option("log-blocks", false)?;

        if log_events {
            let handler = Arc::new(EventLogger {
                counters: Arc::clone(&self.counters),
            });
            for address in &options.addresses {
                registry.register_contract_any_event(*address, handler.clone())?;
            }
        }
        if log_transactions {
            let handler = Arc::new(TxLogger {
                counters: Arc::clone(&self.counters),
            });
            for address in &options.addresses {
                registry.register_tx_address(*address, handler.clone())?;
            }
        }
        if log_blocks {
            registry.register_block_handler(Arc::new(BlockLogger {
                counters: Arc::clone(&self.counters),
            }))?;
        }
        Ok(())
    }

    async fn finished(&self, _ctx: &HandlerContext) -> Result<()> {
        info!(
            "[Logging] Logged {} events, {} transactions, {} blocks",
            self.counters.events.load(Ordering::Relaxed),
            self.counters.transactions.load(Ordering::Relaxed),
            self.counters.blocks.load(Ordering::Relaxed)
        );
        Ok(())
    }
}

struct EventLogger {
    counters: Arc<LogCounters>,
}

#[async_trait]
impl EventHandler for EventLogger {
    fn name(&self) -> &str {
        "logging::events"
    }

    async fn on_event(&self, event: Arc<EventEnvelope>, _ctx: HandlerContext) -> Result<()> {
        self.counters.events.fetch_add(1, Ordering::Relaxed);
        let log = &event.log;
        match &event.event_name {
            Some(name) => {
                let fields: Vec<String> = event
                    .fields
                    .iter()
                    .filter_map(|f| event.field(&f.name).map(|v| format!("{}={}", f.name, v)))
                    .collect();
                info!(
                    "[Logging] {:?} emitted {}({}) in tx {:?} (block {:?})",
                    log.address,
                    name,
                    fields.join(", "),
                    log.transaction_hash,
                    log.block_number
                );
            }
            None => info!(
                "[Logging] {:?} emitted unknown event, topics {:?}, data {} in tx {:?} (block {:?})",
                log.address, log.topics, log.data, log.transaction_hash, log.block_number
            ),
        }
        Ok(())
    }
}

struct TxLogger {
    counters: Arc<LogCounters>,
}

#[async_trait]
impl TxHandler for TxLogger {
    fn name(&self) -> &str {
        "logging::transactions"
    }

    async fn on_transaction(&self, tx: Arc<TxEnvelope>, _ctx: HandlerContext) -> Result<()> {
        self.counters.transactions.fetch_add(1, Ordering::Relaxed);
        match tx.to {
            Some(to) => info!(
                "[Logging] Tx {:?} {:?} -> {:?} value {} ETH (block {:?})",
                tx.transaction.hash,
                tx.from,
                to,
                format_ether(tx.transaction.value),
                tx.block_number()
            ),
            None => info!(
                "[Logging] Deployment tx {:?} by {:?} (block {:?})",
                tx.transaction.hash,
                tx.from,
                tx.block_number()
            ),
        }
        Ok(())
    }
}

struct BlockLogger {
    counters: Arc<LogCounters>,
}

#[async_trait]
impl BlockHandler for BlockLogger {
    fn name(&self) -> &str {
        "logging::blocks"
    }

    async fn on_block(&self, block: Arc<BlockEnvelope>, _ctx: HandlerContext) -> Result<()> {
        self.counters.blocks.fetch_add(1, Ordering::Relaxed);
        info!(
            "[Logging] Block {:?} mined ({:?}) with {} transactions",
            block.number(),
            block.block.hash,
            block.block.transactions.len()
        );
        Ok(())
    }
}
