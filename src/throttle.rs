//! # Admission Throttle
//!
//! Bounds the amount of RPC-bound work that handlers spawn while the historical
//! backfill replays logs. Handlers take an [`AdmissionPermit`] for every
//! asynchronous subtask that issues RPC calls; the backfill loop calls
//! [`AdmissionThrottle::backpressure`] after each dispatched log.
//!
//! When the number of in-flight permits is at or above `max_requests_per_second`,
//! the loop sleeps one second and then waits until every permit is released.
//! This is the only backpressure between the replay loop and handler work.

use crate::metrics;
use crate::task_group::{GroupGuard, TaskGroup};
use log::debug;
use std::time::Duration;

/// Default ceiling on in-flight handler RPC subtasks.
pub const DEFAULT_MAX_REQUESTS_PER_SECOND: usize = 30;

/// Counted admission control for handler-spawned RPC work.
#[derive(Debug, Clone)]
pub struct AdmissionThrottle {
    in_flight: TaskGroup,
    max_requests_per_second: usize,
    pause: Duration,
}

/// One counted RPC-bound subtask. Released on drop.
#[derive(Debug)]
pub struct AdmissionPermit {
    _guard: GroupGuard,
}

impl AdmissionThrottle {
    pub fn new(max_requests_per_second: usize) -> Self {
        Self {
            in_flight: TaskGroup::new(),
            max_requests_per_second: max_requests_per_second.max(1),
            pause: Duration::from_secs(1),
        }
    }

    /// Count one RPC-bound subtask until the returned permit is dropped.
    pub fn admit(&self) -> AdmissionPermit {
        let guard = self.in_flight.enter();
        metrics::set_admission_in_flight(self.in_flight.count());
        AdmissionPermit { _guard: guard }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.count()
    }

    pub fn max_requests_per_second(&self) -> usize {
        self.max_requests_per_second
    }

    /// True when the in-flight count has reached the configured ceiling.
    pub fn is_saturated(&self) -> bool {
        self.in_flight() >= self.max_requests_per_second
    }

    /// Wait until all outstanding permits have been released.
    pub async fn drain(&self) {
        self.in_flight.wait().await;
        metrics::set_admission_in_flight(0);
    }

    /// Apply backpressure if saturated: sleep one second, then drain.
    ///
    /// Returns `true` when the caller was held back.
    pub async fn backpressure(&self) -> bool {
        // Handlers spawned for the last log claim their permits on first poll.
        tokio::task::yield_now().await;
        if !self.is_saturated() {
            return false;
        }
        debug!(
            "[Throttle] {} RPC subtasks in flight (max {}), pausing",
            self.in_flight(),
            self.max_requests_per_second
        );
        tokio::time::sleep(self.pause).await;
        self.drain().await;
        true
    }
}

impl Default for AdmissionThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_REQUESTS_PER_SECOND)
    }
}
