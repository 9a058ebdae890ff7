//! # Handler Registry
//!
//! Five lookup tables from event signature, (contract, event signature),
//! contract, transaction address and "any block" to handler lists, plus the
//! [`FilterState`] that scopes every RPC log query.
//!
//! The registry is written during setup and read concurrently while listening.
//! All tables and the filter share one reader/writer lock. After
//! [`HandlerRegistry::freeze`] every registration fails with
//! [`RegistryError::Frozen`].

use crate::abi::{event_signature_hash, SchemaBook};
use crate::handler::{BlockHandler, EventHandler, TxHandler};
use ethers::types::{Address, Filter, ValueOrArray, H256};
use log::{debug, info};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Topic positions a log filter can constrain.
pub const MAX_TOPIC_SLOTS: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Event ABI for '{signature}' does not exist, add it to the event signatures file")]
    UnknownSchema { signature: String, hash: H256 },
    #[error("Registry is frozen, handlers must be registered during setup")]
    Frozen,
    #[error("Topic slot {slot} is out of range, logs carry at most 4 topics")]
    TopicSlot { slot: usize },
}

/// Contract addresses and topic slots accumulated during registration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterState {
    addresses: Vec<Address>,
    topics: Vec<Vec<H256>>,
}

impl FilterState {
    /// Add an address. Returns `false` if it was already present.
    pub fn add_address(&mut self, address: Address) -> bool {
        if self.addresses.contains(&address) {
            return false;
        }
        self.addresses.push(address);
        true
    }

    /// Add a topic hash to slot `slot`, creating empty slots up to it.
    /// Slots past [`MAX_TOPIC_SLOTS`] are refused.
    pub fn add_topic(&mut self, slot: usize, topic: H256) -> bool {
        if slot >= MAX_TOPIC_SLOTS {
            return false;
        }
        if self.topics.len() <= slot {
            self.topics.resize_with(slot + 1, Vec::new);
        }
        let entries = &mut self.topics[slot];
        if entries.contains(&topic) {
            return false;
        }
        entries.push(topic);
        true
    }

    pub fn addresses(&self) -> &[Address] {
        &self.addresses
    }

    pub fn topics(&self) -> &[Vec<H256>] {
        &self.topics
    }

    /// Distinct addresses plus distinct topics across all slots.
    pub fn len(&self) -> usize {
        self.addresses.len() + self.topics.iter().map(Vec::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Log filter over every address and topic slot. An empty slot matches anything.
    pub fn to_filter(&self) -> Filter {
        let mut filter = Filter::new();
        if !self.addresses.is_empty() {
            filter = filter.address(ValueOrArray::Array(self.addresses.clone()));
        }
        for (slot, hashes) in self.topics.iter().enumerate() {
            if hashes.is_empty() {
                continue;
            }
            let value = Some(ValueOrArray::Array(hashes.iter().copied().map(Some).collect()));
            filter.topics[slot] = value;
        }
        filter
    }

    /// [`to_filter`](Self::to_filter) restricted to the inclusive block range.
    pub fn range_filter(&self, from_block: u64, to_block: u64) -> Filter {
        self.to_filter().from_block(from_block).to_block(to_block)
    }
}

type EventHandlers = Vec<Arc<dyn EventHandler>>;

#[derive(Default)]
struct Tables {
    by_event_sig: HashMap<H256, EventHandlers>,
    by_contract_event_sig: HashMap<Address, HashMap<H256, EventHandlers>>,
    by_contract_any_event: HashMap<Address, EventHandlers>,
    by_tx_address: HashMap<Address, Vec<Arc<dyn TxHandler>>>,
    any_block: Vec<Arc<dyn BlockHandler>>,
    filter: FilterState,
}

fn push_unique<T: ?Sized>(list: &mut Vec<Arc<T>>, handler: Arc<T>) -> bool {
    if list.iter().any(|h| Arc::ptr_eq(h, &handler)) {
        return false;
    }
    list.push(handler);
    true
}

/// Handler tables and derived filter, shared by every ingestion mode.
pub struct HandlerRegistry {
    schemas: Arc<dyn SchemaBook>,
    tables: RwLock<Tables>,
    frozen: AtomicBool,
}

impl HandlerRegistry {
    pub fn new(schemas: Arc<dyn SchemaBook>) -> Self {
        Self {
            schemas,
            tables: RwLock::new(Tables::default()),
            frozen: AtomicBool::new(false),
        }
    }

    pub fn schemas(&self) -> &Arc<dyn SchemaBook> {
        &self.schemas
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, RegistryError> {
        if self.is_frozen() {
            return Err(RegistryError::Frozen);
        }
        Ok(self.tables.write().unwrap_or_else(PoisonError::into_inner))
    }

    fn known_signature(&self, signature: &str) -> Result<H256, RegistryError> {
        let hash = event_signature_hash(signature);
        if !self.schemas.has_schema(&hash) {
            return Err(RegistryError::UnknownSchema {
                signature: signature.to_string(),
                hash,
            });
        }
        Ok(hash)
    }

    /// Stop accepting registrations. Called once listening starts.
    pub fn freeze(&self) {
        if !self.frozen.swap(true, Ordering::SeqCst) {
            let tables = self.read();
            info!(
                "[Registry] Frozen with {} filter addresses and {} topic slots",
                tables.filter.addresses.len(),
                tables.filter.topics.len()
            );
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    // ---- registration ----

    /// Handle every log whose first topic is `signature`, from any contract.
    pub fn register_event_sig(
        &self,
        signature: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<H256, RegistryError> {
        let hash = self.known_signature(signature)?;
        let mut tables = self.write()?;
        if !push_unique(tables.by_event_sig.entry(hash).or_default(), handler) {
            debug!("[Registry] {} already registered for {:?}", signature, hash);
        }
        tables.filter.add_topic(0, hash);
        Ok(hash)
    }

    /// Handle logs with first topic `signature` emitted by `contract`.
    pub fn register_contract_event_sig(
        &self,
        contract: Address,
        signature: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<H256, RegistryError> {
        let hash = self.known_signature(signature)?;
        let mut tables = self.write()?;
        let list = tables
            .by_contract_event_sig
            .entry(contract)
            .or_default()
            .entry(hash)
            .or_default();
        if !push_unique(list, handler) {
            debug!("[Registry] {:?}/{} already registered", contract, signature);
        }
        tables.filter.add_address(contract);
        tables.filter.add_topic(0, hash);
        Ok(hash)
    }

    /// Handle every log emitted by `contract`, whatever its signature.
    pub fn register_contract_any_event(
        &self,
        contract: Address,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), RegistryError> {
        let mut tables = self.write()?;
        if !push_unique(tables.by_contract_any_event.entry(contract).or_default(), handler) {
            debug!("[Registry] {:?} any-event handler already registered", contract);
        }
        tables.filter.add_address(contract);
        Ok(())
    }

    /// Handle transactions sent from, or else sent to, `address`.
    pub fn register_tx_address(
        &self,
        address: Address,
        handler: Arc<dyn TxHandler>,
    ) -> Result<(), RegistryError> {
        let mut tables = self.write()?;
        if !push_unique(tables.by_tx_address.entry(address).or_default(), handler) {
            debug!("[Registry] {:?} tx handler already registered", address);
        }
        Ok(())
    }

    pub fn register_block_handler(&self, handler: Arc<dyn BlockHandler>) -> Result<(), RegistryError> {
        let mut tables = self.write()?;
        if !push_unique(&mut tables.any_block, handler) {
            debug!("[Registry] block handler already registered");
        }
        Ok(())
    }

    /// Add configured addresses to the global filter.
    pub fn add_filter_addresses(
        &self,
        addresses: impl IntoIterator<Item = Address>,
    ) -> Result<(), RegistryError> {
        let mut tables = self.write()?;
        for address in addresses {
            tables.filter.add_address(address);
        }
        Ok(())
    }

    /// Add a configured event signature to topic slot 0. Its schema must be known.
    pub fn add_filter_signature(&self, signature: &str) -> Result<H256, RegistryError> {
        let hash = self.known_signature(signature)?;
        self.write()?.filter.add_topic(0, hash);
        Ok(hash)
    }

    /// Add raw topic hashes to `slot`.
    pub fn add_filter_topics(
        &self,
        slot: usize,
        topics: impl IntoIterator<Item = H256>,
    ) -> Result<(), RegistryError> {
        if slot >= MAX_TOPIC_SLOTS {
            return Err(RegistryError::TopicSlot { slot });
        }
        let mut tables = self.write()?;
        for topic in topics {
            tables.filter.add_topic(slot, topic);
        }
        Ok(())
    }

    // ---- lookup ----

    pub fn handlers_for_sig(&self, signature: &H256) -> EventHandlers {
        self.read()
            .by_event_sig
            .get(signature)
            .cloned()
            .unwrap_or_default()
    }

    pub fn handlers_for_contract_sig(&self, contract: &Address, signature: &H256) -> EventHandlers {
        self.read()
            .by_contract_event_sig
            .get(contract)
            .and_then(|m| m.get(signature))
            .cloned()
            .unwrap_or_default()
    }

    pub fn handlers_for_contract(&self, contract: &Address) -> EventHandlers {
        self.read()
            .by_contract_any_event
            .get(contract)
            .cloned()
            .unwrap_or_default()
    }

    pub fn handlers_for_tx_address(&self, address: &Address) -> Vec<Arc<dyn TxHandler>> {
        self.read()
            .by_tx_address
            .get(address)
            .cloned()
            .unwrap_or_default()
    }

    pub fn block_handlers(&self) -> Vec<Arc<dyn BlockHandler>> {
        self.read().any_block.clone()
    }

    /// True when any event-keyed table has entries.
    pub fn has_event_handlers(&self) -> bool {
        let tables = self.read();
        !tables.by_event_sig.is_empty()
            || !tables.by_contract_event_sig.is_empty()
            || !tables.by_contract_any_event.is_empty()
    }

    pub fn has_tx_handlers(&self) -> bool {
        !self.read().by_tx_address.is_empty()
    }

    pub fn has_block_handlers(&self) -> bool {
        !self.read().any_block.is_empty()
    }

    /// Snapshot of the accumulated filter.
    pub fn filter_state(&self) -> FilterState {
        self.read().filter.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::SignatureBook;
    use crate::handler::{BlockEnvelope, EventEnvelope, HandlerContext, TxEnvelope};
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl EventHandler for Noop {
        fn name(&self) -> &str {
            "noop"
        }
        async fn on_event(&self, _: Arc<EventEnvelope>, _: HandlerContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl TxHandler for Noop {
        fn name(&self) -> &str {
            "noop"
        }
        async fn on_transaction(&self, _: Arc<TxEnvelope>, _: HandlerContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl BlockHandler for Noop {
        fn name(&self) -> &str {
            "noop"
        }
        async fn on_block(&self, _: Arc<BlockEnvelope>, _: HandlerContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    const TRANSFER: &str = "Transfer(address,address,uint256)";

    fn registry() -> HandlerRegistry {
        let mut book = SignatureBook::new();
        book.add_human_readable(
            "event Transfer(address indexed from, address indexed to, uint256 value)",
        )
        .unwrap();
        HandlerRegistry::new(Arc::new(book))
    }

    fn addr(n: u64) -> Address {
        Address::from_low_u64_be(n)
    }

    #[test]
    fn test_registration_is_idempotent_by_identity() {
        let reg = registry();
        let h: Arc<Noop> = Arc::new(Noop);
        let sig = event_signature_hash(TRANSFER);

        for _ in 0..2 {
            reg.register_event_sig(TRANSFER, h.clone()).unwrap();
            reg.register_contract_event_sig(addr(1), TRANSFER, h.clone()).unwrap();
            reg.register_contract_any_event(addr(1), h.clone()).unwrap();
            reg.register_tx_address(addr(2), h.clone()).unwrap();
            reg.register_block_handler(h.clone()).unwrap();
        }

        assert_eq!(reg.handlers_for_sig(&sig).len(), 1);
        assert_eq!(reg.handlers_for_contract_sig(&addr(1), &sig).len(), 1);
        assert_eq!(reg.handlers_for_contract(&addr(1)).len(), 1);
        assert_eq!(reg.handlers_for_tx_address(&addr(2)).len(), 1);
        assert_eq!(reg.block_handlers().len(), 1);

        // a different instance is a different handler
        reg.register_block_handler(Arc::new(Noop)).unwrap();
        assert_eq!(reg.block_handlers().len(), 2);
    }

    #[test]
    fn test_unknown_schema_is_rejected() {
        let reg = registry();
        let err = reg
            .register_event_sig("Approval(address,address,uint256)", Arc::new(Noop))
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownSchema { .. }));
        assert!(!reg.has_event_handlers());
        assert!(reg.filter_state().is_empty());
    }

    #[test]
    fn test_filter_accumulates_distinct_entries() {
        let reg = registry();
        let h: Arc<Noop> = Arc::new(Noop);
        reg.register_contract_event_sig(addr(2), TRANSFER, h.clone()).unwrap();
        reg.register_contract_any_event(addr(1), h.clone()).unwrap();
        reg.register_contract_event_sig(addr(1), TRANSFER, Arc::new(Noop)).unwrap();
        reg.register_event_sig(TRANSFER, h.clone()).unwrap();
        reg.register_tx_address(addr(9), h).unwrap();

        let filter = reg.filter_state();
        assert_eq!(filter.addresses(), &[addr(2), addr(1)]);
        assert_eq!(filter.topics(), &[vec![event_signature_hash(TRANSFER)]]);
        assert_eq!(filter.len(), 3);
    }

    #[test]
    fn test_topic_slots_are_created_on_demand() {
        let mut filter = FilterState::default();
        filter.add_topic(2, H256::from_low_u64_be(5));
        assert_eq!(filter.topics().len(), 3);
        assert!(filter.topics()[0].is_empty());

        let query = filter.range_filter(10, 20);
        assert!(query.topics[0].is_none());
        assert!(query.topics[2].is_some());
        assert_eq!(query.get_from_block(), Some(10u64.into()));
        assert_eq!(query.get_to_block(), Some(20u64.into()));
    }

    #[test]
    fn test_frozen_registry_rejects_registration() {
        let reg = registry();
        reg.freeze();
        assert!(matches!(
            reg.register_block_handler(Arc::new(Noop)),
            Err(RegistryError::Frozen)
        ));
        assert!(matches!(
            reg.add_filter_addresses([addr(1)]),
            Err(RegistryError::Frozen)
        ));
    }

    #[test]
    fn test_topic_slot_past_four_is_rejected() {
        let reg = registry();
        reg.add_filter_topics(3, [H256::from_low_u64_be(1)]).unwrap();
        assert!(matches!(
            reg.add_filter_topics(4, [H256::from_low_u64_be(2)]),
            Err(RegistryError::TopicSlot { slot: 4 })
        ));
        assert_eq!(reg.filter_state().topics().len(), 4);

        let mut filter = FilterState::default();
        assert!(!filter.add_topic(5, H256::from_low_u64_be(3)));
        assert!(filter.is_empty());
    }
}
