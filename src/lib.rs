//! # MIG Chain Tracker
//!
//! One ingestion pipeline for EVM chain activity (blocks, transactions and log
//! events) shared by any number of independently registered handlers, in live
//! ("realtime") mode or as a bounded historical replay.
//!
//! ## Overview
//!
//! - **Registration**: behaviors register handlers by event signature, by
//!   (contract, signature), by contract, by transaction address or for every
//!   block. Registration also accumulates the global log filter.
//! - **Realtime**: a single aggregated log subscription, a `newHeads`
//!   subscription, or a pending-block poller feeds the dispatcher.
//! - **Historical**: a block range is replayed as log queries or block by
//!   block (sequential or batched), bounded by the admission throttle.
//! - **Handoff**: a backfill may continue into realtime; blocks and events the
//!   provider redelivers at subscription start are dropped once.
//!
//! ## Architecture
//!
//! ### Registry Layer
//! [`registry::HandlerRegistry`] and [`registry::FilterState`], written during
//! setup and frozen before listening.
//!
//! ### Ingestion Layer
//! [`realtime`], [`pending`] and [`historical`] drive [`pipeline::Pipeline`],
//! which fans out through [`dispatch::Dispatcher`].
//!
//! ### Concurrency Primitives
//! [`task_group::TaskGroup`] (per-block completion), [`throttle::AdmissionThrottle`]
//! and [`dedup::DedupLedger`].

// Handler Contract
/// Envelopes, handler traits and the handler context
pub mod handler;
/// Handler tables and the accumulated log filter
pub mod registry;
/// Static behavior table and lifecycle
pub mod behavior;
/// Built-in behaviors
pub mod behaviors;

// Ingestion
/// Envelope fan-out and central failure reporting
pub mod dispatch;
/// Shared per-log and per-block processing path
pub mod pipeline;
/// Realtime log and block subscriptions
pub mod realtime;
/// Pending-block poller
pub mod pending;
/// Historical backfill engine
pub mod historical;
/// Top-level driver
pub mod tracker;

// Concurrency Primitives
/// Counted completion group
pub mod task_group;
/// RPC admission throttle
pub mod throttle;
/// Historical to realtime dedup ledger
pub mod dedup;

// Collaborators
/// Event signature book and decoding
pub mod abi;
/// Chain RPC client
pub mod rpc;
/// Block header cache
pub mod header_cache;
/// Configuration
pub mod settings;

// Infrastructure
/// Metrics (no-ops without the `observability` feature)
pub mod metrics;
/// Block range and formatting helpers
pub mod utils;
