//! # Tracker
//!
//! Top-level driver. [`Tracker::setup`] builds the registry from configuration,
//! lets every enabled behavior register its handlers and freezes the registry.
//! Exactly one run method then drives the process:
//!
//! - [`Tracker::run_realtime`]: events, blocks or pending-block polling;
//! - [`Tracker::run_historical`]: a bounded backfill, followed either by the
//!   behaviors' finished hooks or by a handoff into realtime listening.
//!
//! Errors returned by the run methods are fatal by contract; the binary exits
//! non-zero with the error chain.

use crate::abi::{SchemaBook, SignatureBook};
use crate::behavior::BehaviorSet;
use crate::dedup::DedupLedger;
use crate::dispatch::Dispatcher;
use crate::handler::HandlerContext;
use crate::historical::{BackfillEngine, BackfillPlan, BackfillReport};
use crate::pending::PendingPoller;
use crate::pipeline::Pipeline;
use crate::realtime::{RealtimeListener, ResubscribePolicy};
use crate::registry::HandlerRegistry;
use crate::rpc::{ChainClient, WsChainClient};
use crate::settings::Settings;
use crate::throttle::AdmissionThrottle;
use anyhow::{bail, Context, Result};
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeState {
    Setup,
    HistoricalBackfill,
    RealtimeListening,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RealtimeMode {
    /// Blocks if any transaction or block handler is registered, events otherwise.
    Auto,
    Events,
    Blocks,
    PendingBlocks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoricalMode {
    Auto,
    Events,
    Blocks,
}

pub struct Tracker {
    settings: Settings,
    behaviors: BehaviorSet,
    pipeline: Pipeline,
    state: ModeState,
}

impl Tracker {
    /// Connect to the configured endpoint, load the signature book and run setup.
    pub async fn connect(settings: Settings) -> Result<Self> {
        let client = WsChainClient::connect(&settings.rpc.url).await?;
        let schemas = SignatureBook::load(&settings.abi.event_signatures_path)
            .context("Failed to load event signatures")?;
        Self::setup(settings, Arc::new(client), Arc::new(schemas))
    }

    /// Seed the registry from configuration, initialise behaviors and freeze.
    /// Must be called inside a tokio runtime.
    pub fn setup(
        settings: Settings,
        client: Arc<dyn ChainClient>,
        schemas: Arc<dyn SchemaBook>,
    ) -> Result<Self> {
        let registry = Arc::new(HandlerRegistry::new(schemas));

        registry.add_filter_addresses(settings.filter_addresses()?)?;
        for signature in &settings.filter.event_signatures {
            registry.add_filter_signature(signature)?;
        }
        for (slot, topics) in settings.filter_topics()?.into_iter().enumerate() {
            registry.add_filter_topics(slot, topics)?;
        }

        let configs = settings.behavior_configs()?;
        if configs.is_empty() {
            warn!("No behaviors configured, nothing will be dispatched");
        }
        for (_, enabled, options) in &configs {
            if *enabled {
                registry.add_filter_addresses(options.addresses.iter().copied())?;
            }
        }
        let behaviors = BehaviorSet::from_config(configs)?;
        behaviors.init_all(&registry)?;
        registry.freeze();
        info!(
            "Setup complete with {} behaviors: {:?}",
            behaviors.len(),
            behaviors.names()
        );

        let ctx = HandlerContext::new(
            client,
            AdmissionThrottle::new(settings.limits.max_requests_per_second),
            settings.limits.header_cache_capacity,
        );
        let dispatcher = Dispatcher::new(registry, ctx);
        let ledger = Arc::new(DedupLedger::new(settings.limits.handoff_window));
        Ok(Self {
            settings,
            behaviors,
            pipeline: Pipeline::new(dispatcher, ledger),
            state: ModeState::Setup,
        })
    }

    pub fn state(&self) -> ModeState {
        self.state
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        self.pipeline.dispatcher().registry()
    }

    pub fn context(&self) -> &HandlerContext {
        self.pipeline.dispatcher().context()
    }

    pub fn ledger(&self) -> &Arc<DedupLedger> {
        self.pipeline.ledger()
    }

    fn blocks_required(&self) -> bool {
        let registry = self.registry();
        registry.has_tx_handlers() || registry.has_block_handlers()
    }

    fn resubscribe_policy(&self) -> ResubscribePolicy {
        ResubscribePolicy {
            backoff: Duration::from_millis(self.settings.rpc.resubscribe_backoff_ms),
            attempts: self.settings.rpc.resubscribe_attempts,
        }
    }

    pub fn resolve_realtime_mode(&self, mode: RealtimeMode) -> RealtimeMode {
        if mode != RealtimeMode::Auto {
            return mode;
        }
        if self.blocks_required() {
            info!("Auto determined to track blocks");
            RealtimeMode::Blocks
        } else {
            info!("Auto determined to only track events");
            RealtimeMode::Events
        }
    }

    pub fn resolve_historical_mode(&self, mode: HistoricalMode) -> HistoricalMode {
        if mode != HistoricalMode::Auto {
            return mode;
        }
        if self.blocks_required() {
            HistoricalMode::Blocks
        } else {
            HistoricalMode::Events
        }
    }

    /// Listen until a fatal error.
    pub async fn run_realtime(&mut self, mode: RealtimeMode) -> Result<()> {
        let mode = self.resolve_realtime_mode(mode);
        self.state = ModeState::RealtimeListening;
        let result = match mode {
            RealtimeMode::Events | RealtimeMode::Auto => {
                RealtimeListener::new(self.pipeline.clone(), self.resubscribe_policy())
                    .listen_events()
                    .await
            }
            RealtimeMode::Blocks => {
                RealtimeListener::new(self.pipeline.clone(), self.resubscribe_policy())
                    .listen_blocks()
                    .await
            }
            RealtimeMode::PendingBlocks => {
                let interval = Duration::from_millis(self.settings.listener.pending_poll_interval_ms);
                PendingPoller::new(self.pipeline.clone(), interval).run().await
            }
        };
        self.state = ModeState::Terminated;
        result
    }

    /// Backfill the configured range. Without `continue_to_realtime` the
    /// behaviors' finished hooks run afterwards; with it the tracker switches to
    /// realtime listening of the same kind and only returns on a fatal error.
    pub async fn run_historical(&mut self, mode: HistoricalMode) -> Result<BackfillReport> {
        let historical = self.settings.historical.clone();
        let plan = BackfillPlan::resolve(
            historical.from_block,
            historical.to_block,
            self.pipeline.client().as_ref(),
        )
        .await?
        .with_step_blocks(historical.step_blocks)
        .with_batch_fetch(historical.batch_fetch_blocks, self.settings.limits.block_batch_size);

        let mode = self.resolve_historical_mode(mode);
        if historical.continue_to_realtime {
            if plan.loop_backwards() {
                bail!(
                    "Cannot continue to realtime after looping backwards ({} -> {})",
                    plan.from_block,
                    plan.to_block
                );
            }
            self.ledger().retain_for_handoff();
        }

        self.state = ModeState::HistoricalBackfill;
        let engine = BackfillEngine::new(self.pipeline.clone());
        let report = match mode {
            HistoricalMode::Blocks => engine.backfill_blocks(&plan).await,
            HistoricalMode::Events | HistoricalMode::Auto => engine.backfill_events(&plan).await,
        };
        let report = match report {
            Ok(report) => report,
            Err(e) => {
                self.state = ModeState::Terminated;
                return Err(e);
            }
        };

        let ctx = self.context().clone();
        ctx.block_group.wait().await;
        ctx.throttle.drain().await;

        if historical.continue_to_realtime {
            info!(
                "Backfill done at block {}, switching to realtime",
                plan.last_block()
            );
            self.ledger().begin_handoff(plan.last_block());
            let realtime = match mode {
                HistoricalMode::Blocks => RealtimeMode::Blocks,
                HistoricalMode::Events | HistoricalMode::Auto => RealtimeMode::Events,
            };
            self.run_realtime(realtime).await?;
            return Ok(report);
        }

        info!("Running post processing finished functions");
        let finished = self.behaviors.finish_all(&ctx).await;
        self.state = ModeState::Terminated;
        finished?;
        Ok(report)
    }
}
