// src/metrics.rs

#[cfg(feature = "observability")]
pub use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};

// NOTE: When observability feature is disabled, provide stub implementations
#[cfg(not(feature = "observability"))]
pub enum Unit {}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! counter {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! gauge {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! histogram {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_counter {
    ($name:expr, $unit:expr, $desc:expr) => {};
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_gauge {
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_histogram {
    ($name:expr, $unit:expr, $desc:expr) => {};
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
use crate::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

use once_cell::sync::OnceCell;
use std::time::Duration;

static DESCRIBED: OnceCell<()> = OnceCell::new();

/// Registers descriptions for every tracker metric. Later calls are no-ops.
pub fn describe_metrics() {
    DESCRIBED.get_or_init(describe_all);
}

fn describe_all() {
    describe_counter!(
        "tracker_events_dispatched_total",
        Unit::Count,
        "Logs delivered to at least one event handler."
    );
    describe_counter!(
        "tracker_blocks_processed_total",
        Unit::Count,
        "Blocks that went through the block pipeline."
    );
    describe_counter!(
        "tracker_transactions_matched_total",
        Unit::Count,
        "Transactions matched by sender or recipient address."
    );
    describe_counter!(
        "tracker_duplicates_dropped_total",
        Unit::Count,
        "Blocks and events dropped during the historical to realtime handoff."
    );
    describe_counter!(
        "tracker_removed_logs_total",
        Unit::Count,
        "Logs dropped because the provider marked them removed (reorg)."
    );
    describe_counter!(
        "tracker_handler_failures_total",
        Unit::Count,
        "Handler invocations that returned an error or panicked, by handler kind."
    );
    describe_counter!(
        "tracker_rpc_calls_total",
        Unit::Count,
        "RPC calls by method and outcome."
    );
    describe_gauge!(
        "tracker_admission_in_flight",
        "Handler RPC subtasks currently holding an admission permit."
    );
    describe_gauge!("tracker_header_cache_size", "Cached block headers.");
    describe_histogram!(
        "tracker_rpc_call_latency_ms",
        Unit::Milliseconds,
        "RPC call latency in milliseconds, by method."
    );
}

/// Installs the Prometheus exporter on `addr` (`/metrics`).
#[cfg(feature = "observability")]
pub fn init_prometheus_exporter(addr: std::net::SocketAddr) -> anyhow::Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;
    describe_metrics();
    Ok(())
}

pub fn increment_events_dispatched() {
    counter!("tracker_events_dispatched_total", 1);
}

pub fn increment_blocks_processed() {
    counter!("tracker_blocks_processed_total", 1);
}

pub fn increment_transactions_matched() {
    counter!("tracker_transactions_matched_total", 1);
}

pub fn increment_duplicates_dropped() {
    counter!("tracker_duplicates_dropped_total", 1);
}

pub fn increment_removed_logs() {
    counter!("tracker_removed_logs_total", 1);
}

pub fn increment_handler_failures(kind: &str) {
    counter!("tracker_handler_failures_total", 1, "kind" => kind.to_string());
}

pub fn record_rpc_call(method: &str, duration: Duration, ok: bool) {
    counter!(
        "tracker_rpc_calls_total",
        1,
        "method" => method.to_string(),
        "ok" => ok.to_string()
    );
    histogram!(
        "tracker_rpc_call_latency_ms",
        duration.as_secs_f64() * 1000.0,
        "method" => method.to_string()
    );
}

pub fn set_admission_in_flight(count: usize) {
    gauge!("tracker_admission_in_flight", count as f64);
}

pub fn increment_cache_hit(cache_name: &str) {
    counter!("tracker_cache_hits_total", 1, "cache" => cache_name.to_string());
}

pub fn increment_cache_miss(cache_name: &str) {
    counter!("tracker_cache_miss_total", 1, "cache" => cache_name.to_string());
}

pub fn set_cache_size(cache_name: &str, size: f64) {
    gauge!("tracker_header_cache_size", size, "cache" => cache_name.to_string());
}
