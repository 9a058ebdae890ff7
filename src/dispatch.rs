//! # Dispatcher
//!
//! Fans envelopes out to the handlers the registry returns. Every invocation is
//! its own tokio task; the dispatcher never waits for a handler. Handlers that
//! opt into [`Completion::JoinBlock`] hold a guard on the shared block group
//! until they finish.
//!
//! Failed and panicking invocations are sent to a single reporter task that logs
//! them and counts them.

use crate::abi::AbiError;
use crate::handler::{
    BlockEnvelope, Completion, EventEnvelope, HandlerContext, TxEnvelope,
};
use crate::metrics;
use crate::registry::HandlerRegistry;
use ethers::types::{Block, Log, Transaction};
use futures::FutureExt;
use log::{debug, error, warn};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// A handler invocation that returned an error or panicked.
#[derive(Debug, Clone)]
pub struct HandlerFailure {
    pub handler: String,
    pub kind: &'static str,
    pub error: String,
}

#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    ctx: HandlerContext,
    failures: mpsc::UnboundedSender<HandlerFailure>,
    failure_count: Arc<AtomicUsize>,
}

impl Dispatcher {
    /// Create a dispatcher and spawn its failure reporter. Must be called
    /// inside a tokio runtime.
    pub fn new(registry: Arc<HandlerRegistry>, ctx: HandlerContext) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let failure_count = Arc::new(AtomicUsize::new(0));
        tokio::spawn(report_failures(rx, Arc::clone(&failure_count)));
        Self {
            registry,
            ctx,
            failures: tx,
            failure_count,
        }
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn context(&self) -> &HandlerContext {
        &self.ctx
    }

    /// Number of failures the reporter has processed so far.
    pub fn failure_count(&self) -> usize {
        self.failure_count.load(Ordering::SeqCst)
    }

    /// Decode `log` and invoke every handler registered by signature,
    /// by contract and signature, and by contract. Returns the number of
    /// invocations spawned.
    pub fn dispatch_log(&self, log: Log) -> usize {
        let envelope = match self.registry.schemas().decode(&log) {
            Ok(Some(decoded)) => EventEnvelope::decoded(log, decoded),
            Ok(None) | Err(AbiError::NoTopics) => EventEnvelope::raw(log),
            Err(e) => {
                warn!(
                    "[Dispatch] {} in tx {:?}, delivering raw log",
                    e, log.transaction_hash
                );
                EventEnvelope::raw(log)
            }
        };

        let contract = envelope.contract();
        let mut handlers = Vec::new();
        if let Some(signature) = envelope.signature() {
            handlers.extend(self.registry.handlers_for_sig(&signature));
            handlers.extend(self.registry.handlers_for_contract_sig(&contract, &signature));
        }
        handlers.extend(self.registry.handlers_for_contract(&contract));
        if handlers.is_empty() {
            return 0;
        }

        let envelope = Arc::new(envelope);
        for handler in &handlers {
            let handler = Arc::clone(handler);
            let event = Arc::clone(&envelope);
            let ctx = self.ctx.clone();
            self.spawn_invocation(
                handler.name().to_string(),
                "event",
                handler.completion(),
                async move { handler.on_event(event, ctx).await },
            );
        }
        metrics::increment_events_dispatched();
        handlers.len()
    }

    /// Invoke every block handler. Returns the number of invocations spawned.
    pub fn dispatch_block(&self, block: &Arc<Block<Transaction>>) -> usize {
        let handlers = self.registry.block_handlers();
        if handlers.is_empty() {
            return 0;
        }
        let envelope = Arc::new(BlockEnvelope {
            block: Arc::clone(block),
        });
        for handler in &handlers {
            let handler = Arc::clone(handler);
            let envelope = Arc::clone(&envelope);
            let ctx = self.ctx.clone();
            self.spawn_invocation(
                handler.name().to_string(),
                "block",
                handler.completion(),
                async move { handler.on_block(envelope, ctx).await },
            );
        }
        handlers.len()
    }

    /// Match every transaction of `block` by sender, or by recipient when the
    /// sender has no handlers. Unmatched transactions are skipped.
    pub fn dispatch_transactions(&self, block: &Arc<Block<Transaction>>) -> usize {
        let mut spawned = 0;
        for tx in &block.transactions {
            let mut handlers = self.registry.handlers_for_tx_address(&tx.from);
            if handlers.is_empty() {
                if let Some(to) = tx.to {
                    handlers = self.registry.handlers_for_tx_address(&to);
                }
            }
            if handlers.is_empty() {
                continue;
            }

            metrics::increment_transactions_matched();
            let envelope = Arc::new(TxEnvelope {
                transaction: tx.clone(),
                from: tx.from,
                to: tx.to,
                block: Arc::clone(block),
            });
            for handler in handlers {
                let envelope = Arc::clone(&envelope);
                let ctx = self.ctx.clone();
                let name = handler.name().to_string();
                let completion = handler.completion();
                self.spawn_invocation(name, "transaction", completion, async move {
                    handler.on_transaction(envelope, ctx).await
                });
                spawned += 1;
            }
        }
        spawned
    }

    fn spawn_invocation<F>(
        &self,
        handler: String,
        kind: &'static str,
        completion: Completion,
        invocation: F,
    ) where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let guard = match completion {
            Completion::JoinBlock => Some(self.ctx.block_group.enter()),
            Completion::Detached => None,
        };
        let failures = self.failures.clone();
        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(invocation).catch_unwind().await;
            let error = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(format!("{:#}", e)),
                Err(panic) => Some(format!("panicked: {}", panic_message(panic.as_ref()))),
            };
            if let Some(error) = error {
                // The reporter only stops when every dispatcher is gone.
                let _ = failures.send(HandlerFailure {
                    handler,
                    kind,
                    error,
                });
            }
            drop(guard);
        });
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic payload"
    }
}

async fn report_failures(
    mut rx: mpsc::UnboundedReceiver<HandlerFailure>,
    failure_count: Arc<AtomicUsize>,
) {
    while let Some(failure) = rx.recv().await {
        metrics::increment_handler_failures(failure.kind);
        failure_count.fetch_add(1, Ordering::SeqCst);
        error!(
            "[Dispatch] {} handler '{}' failed: {}",
            failure.kind, failure.handler, failure.error
        );
    }
    debug!("[Dispatch] Failure reporter stopped");
}
