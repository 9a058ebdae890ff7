//! # Dedup Ledger
//!
//! Short-lived record of delivered blocks and events, consulted only while the
//! tracker hands off from historical backfill to the realtime stream. A provider
//! commonly redelivers the latest block (and its logs) right after a subscription
//! opens; anything already replayed by the backfill is dropped once.
//!
//! Blocks are keyed by hash and must match on block number. Events are keyed by
//! the composite `(transaction hash, log index)` so that two logs from the same
//! transaction never shadow each other.

use crate::metrics;
use ethers::types::H256;
use log::{debug, info};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Number of trailing backfill blocks kept for the handoff.
pub const DEFAULT_HANDOFF_WINDOW: u64 = 64;

/// What the ledger knows about one delivered item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessedRecord {
    pub block_number: u64,
    pub tx_hash: Option<H256>,
    pub log_index: Option<u64>,
}

/// Outcome of a ledger check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Deliver the item.
    Fresh,
    /// Already delivered during the handoff window; drop it.
    Duplicate,
}

#[derive(Debug, Default)]
struct LedgerState {
    blocks: HashMap<H256, ProcessedRecord>,
    events: HashMap<(H256, u64), ProcessedRecord>,
    /// Last block covered by the backfill when the handoff began.
    replay_high_water: Option<u64>,
    /// Newest block seen by the ledger, the anchor for window pruning.
    newest: u64,
}

impl LedgerState {
    fn high_water(&self) -> Option<u64> {
        self.blocks
            .values()
            .chain(self.events.values())
            .map(|r| r.block_number)
            .max()
    }

    fn len(&self) -> usize {
        self.blocks.len() + self.events.len()
    }

    // Keep only records within `window` blocks of the newest one.
    fn prune(&mut self, block_number: u64, window: u64) {
        self.newest = self.newest.max(block_number);
        let floor = self.newest.saturating_sub(window);
        self.blocks.retain(|_, r| r.block_number >= floor);
        self.events.retain(|_, r| r.block_number >= floor);
    }
}

/// Records already-processed blocks and events across the historical→realtime switch.
#[derive(Debug)]
pub struct DedupLedger {
    state: Mutex<LedgerState>,
    retaining: AtomicBool,
    switching_to_realtime: AtomicBool,
    duplicate_detected: AtomicBool,
    window: u64,
}

impl DedupLedger {
    pub fn new(window: u64) -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
            retaining: AtomicBool::new(false),
            switching_to_realtime: AtomicBool::new(false),
            duplicate_detected: AtomicBool::new(false),
            window: window.max(1),
        }
    }

    fn state(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start keeping backfill records so a later handoff can use them.
    pub fn retain_for_handoff(&self) {
        self.retaining.store(true, Ordering::SeqCst);
    }

    pub fn is_retaining(&self) -> bool {
        self.retaining.load(Ordering::SeqCst)
    }

    pub fn is_switching(&self) -> bool {
        self.switching_to_realtime.load(Ordering::SeqCst)
    }

    pub fn duplicate_detected(&self) -> bool {
        self.duplicate_detected.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.state().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record a block replayed by the backfill. No-op unless retaining.
    pub fn record_replayed_block(&self, hash: H256, block_number: u64) {
        if !self.is_retaining() {
            return;
        }
        let mut state = self.state();
        state.blocks.insert(
            hash,
            ProcessedRecord {
                block_number,
                tx_hash: None,
                log_index: None,
            },
        );
        state.prune(block_number, self.window);
    }

    /// Record an event replayed by the backfill. No-op unless retaining.
    pub fn record_replayed_event(&self, tx_hash: H256, log_index: u64, block_number: u64) {
        if !self.is_retaining() {
            return;
        }
        let mut state = self.state();
        state.events.insert(
            (tx_hash, log_index),
            ProcessedRecord {
                block_number,
                tx_hash: Some(tx_hash),
                log_index: Some(log_index),
            },
        );
        state.prune(block_number, self.window);
    }

    /// Enter the handoff window: realtime items are now checked against the ledger.
    ///
    /// `replayed_through` is the last block the backfill covered. The window
    /// closes once the stream delivers a block past it, even when the backfill
    /// recorded nothing.
    pub fn begin_handoff(&self, replayed_through: u64) {
        self.retaining.store(false, Ordering::SeqCst);
        let mut state = self.state();
        let high_water = state
            .high_water()
            .map_or(replayed_through, |hw| hw.max(replayed_through));
        state.replay_high_water = Some(high_water);
        info!(
            "[Dedup] Switching to realtime with {} replayed records (high-water block {:?})",
            state.len(),
            state.replay_high_water
        );
        self.switching_to_realtime.store(true, Ordering::SeqCst);
    }

    /// Leave the handoff window and forget every record.
    pub fn finish_handoff(&self) {
        self.switching_to_realtime.store(false, Ordering::SeqCst);
        let mut state = self.state();
        state.blocks.clear();
        state.events.clear();
        state.replay_high_water = None;
        state.newest = 0;
    }

    /// Called for every realtime item before it is checked. Once the stream
    /// delivers a block past the replayed range, redelivery is over and the
    /// ledger is released.
    pub fn observe_block(&self, block_number: u64) {
        if !self.is_switching() {
            return;
        }
        let past_replay = matches!(self.state().replay_high_water, Some(hw) if block_number > hw);
        if past_replay {
            info!(
                "[Dedup] Block {} is past the replayed range, handoff complete",
                block_number
            );
            self.finish_handoff();
        }
    }

    /// Check-and-record a realtime block header.
    pub fn admit_block(&self, hash: H256, block_number: u64) -> Admission {
        if !self.is_switching() {
            return Admission::Fresh;
        }
        let mut state = self.state();
        if let Some(existing) = state.blocks.get(&hash) {
            if existing.block_number == block_number {
                self.mark_duplicate();
                debug!("[Dedup] Duplicate block {} ({:?}) ignored", block_number, hash);
                return Admission::Duplicate;
            }
        }
        state.blocks.insert(
            hash,
            ProcessedRecord {
                block_number,
                tx_hash: None,
                log_index: None,
            },
        );
        state.prune(block_number, self.window);
        Admission::Fresh
    }

    /// Check-and-record a realtime event.
    pub fn admit_event(&self, tx_hash: H256, log_index: u64, block_number: u64) -> Admission {
        if !self.is_switching() {
            return Admission::Fresh;
        }
        let mut state = self.state();
        if state.events.contains_key(&(tx_hash, log_index)) {
            self.mark_duplicate();
            debug!(
                "[Dedup] Duplicate event {:?}#{} ignored",
                tx_hash, log_index
            );
            return Admission::Duplicate;
        }
        state.events.insert(
            (tx_hash, log_index),
            ProcessedRecord {
                block_number,
                tx_hash: Some(tx_hash),
                log_index: Some(log_index),
            },
        );
        state.prune(block_number, self.window);
        Admission::Fresh
    }

    fn mark_duplicate(&self) {
        self.duplicate_detected.store(true, Ordering::SeqCst);
        metrics::increment_duplicates_dropped();
    }
}

impl Default for DedupLedger {
    fn default() -> Self {
        Self::new(DEFAULT_HANDOFF_WINDOW)
    }
}
