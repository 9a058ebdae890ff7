use crate::behavior::{Behavior, BehaviorInfo, BehaviorOptions};
use crate::handler::{EventEnvelope, EventHandler, HandlerContext, TxEnvelope, TxHandler};
use crate::registry::HandlerRegistry;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use ethers::abi::Token;
use ethers::types::Address;
use ethers::utils::format_ether;
use log::{info, warn};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub const NAME: &str = "transfer_monitor";

pub const ERC20_TRANSFER: &str = "Transfer(address,address,uint256)";

pub fn build() -> Arc<dyn Behavior> {
    Arc::new(TransferMonitor::default())
}

#[derive(Debug, Default)]
struct TransferCounters {
    native: AtomicU64,
    erc20: AtomicU64,
}

/// Alerts on native value transfers sent by monitored addresses and on ERC20
/// `Transfer` events of configured tokens sent by monitored addresses.
#[derive(Default)]
pub struct TransferMonitor {
    counters: Arc<TransferCounters>,
}

#[async_trait]
impl Behavior for TransferMonitor {
    fn info(&self) -> BehaviorInfo {
        BehaviorInfo {
            name: "Transfer Monitor",
            overview: "Alerts when monitored addresses send native currency or configured ERC20 tokens.",
            description: "Transactions from the monitored addresses with a non-zero value are \
                reported, as are Transfer events of the listed ERC20 tokens whose sender is \
                monitored. Requires the Transfer(address,address,uint256) ABI in the event \
                signatures file.",
            options: "\"erc20-tokens\" - list of ERC20 token addresses whose transfers are checked",
            example: "[behaviors.transfer_monitor]\n\
                enabled = true\n\
                [behaviors.transfer_monitor.addresses.\"0x28C6c06298d514Db089934071355E5743bf21d60\"]\n\
                [behaviors.transfer_monitor.options]\n\
                erc20-tokens = [\"0xdAC17F958D2ee523a2206206994597C13D831ec7\"]",
        }
    }

    fn init(&self, options: &BehaviorOptions, registry: &HandlerRegistry) -> Result<()> {
        let monitored: Arc<HashSet<Address>> = Arc::new(options.addresses.iter().copied().collect());

        let native = Arc::new(NativeTransferAlert {
            monitored: Arc::clone(&monitored),
            counters: Arc::clone(&self.counters),
        });
        for address in monitored.iter() {
            registry.register_tx_address(*address, native.clone())?;
        }

        let tokens = options.address_list_option("erc20-tokens")?;
        let erc20 = Arc::new(TokenTransferAlert {
            monitored,
            counters: Arc::clone(&self.counters),
        });
        for token in tokens {
            registry
                .register_contract_event_sig(token, ERC20_TRANSFER, erc20.clone())
                .with_context(|| format!("Cannot monitor token {:?}", token))?;
        }
        Ok(())
    }

    async fn finished(&self, _ctx: &HandlerContext) -> Result<()> {
        info!(
            "[TransferMonitor] {} native transfers, {} ERC20 transfers by monitored addresses",
            self.counters.native.load(Ordering::Relaxed),
            self.counters.erc20.load(Ordering::Relaxed)
        );
        Ok(())
    }
}

struct NativeTransferAlert {
    monitored: Arc<HashSet<Address>>,
    counters: Arc<TransferCounters>,
}

#[async_trait]
impl TxHandler for NativeTransferAlert {
    fn name(&self) -> &str {
        "transfer_monitor::native"
    }

    async fn on_transaction(&self, tx: Arc<TxEnvelope>, _ctx: HandlerContext) -> Result<()> {
        // Also invoked for transfers into a monitored address; only outgoing ones alert.
        if !self.monitored.contains(&tx.from) || tx.transaction.value.is_zero() {
            return Ok(());
        }
        self.counters.native.fetch_add(1, Ordering::Relaxed);
        info!(
            "[TransferMonitor] Native transfer by {:?} with value {} ETH (tx {:?})",
            tx.from,
            format_ether(tx.transaction.value),
            tx.transaction.hash
        );
        Ok(())
    }
}

struct TokenTransferAlert {
    monitored: Arc<HashSet<Address>>,
    counters: Arc<TransferCounters>,
}

#[async_trait]
impl EventHandler for TokenTransferAlert {
    fn name(&self) -> &str {
        "transfer_monitor::erc20"
    }

    async fn on_event(&self, event: Arc<EventEnvelope>, ctx: HandlerContext) -> Result<()> {
        let (Some(from), Some(Token::Uint(value))) = (event.address_field("from"), event.field("value")) else {
            warn!(
                "[TransferMonitor] Could not decode Transfer from {:?} (tx {:?})",
                event.contract(),
                event.log.transaction_hash
            );
            return Ok(());
        };
        if !self.monitored.contains(&from) {
            return Ok(());
        }
        self.counters.erc20.fetch_add(1, Ordering::Relaxed);

        let when = match event.block_number() {
            Some(number) => {
                let _permit = ctx.throttle.admit();
                ctx.headers
                    .timestamp(number)
                    .await
                    .with_context(|| format!("Failed to get header of block {}", number))?
            }
            None => None,
        };
        info!(
            "[TransferMonitor] ERC20 transfer by {:?} of {} units of token {:?}{}",
            from,
            value,
            event.contract(),
            when.and_then(|ts| Utc.timestamp_opt(ts as i64, 0).single())
                .map(|t| format!(" at {}", t.to_rfc3339()))
                .unwrap_or_default()
        );
        Ok(())
    }
}
