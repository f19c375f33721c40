//! Contactless-card processors.
//!
//! Each operation detects the card, obtains the sector keys through the
//! input channel, then drives the storage protocol. All card faults are
//! folded into `ProcessingErrorEvent` at this boundary - the engine never
//! sees a raw hardware error.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use ulid::Ulid;

use tapcart_card::{
    conditions, CardStorage, KeyMap, KeyRecovery, RecoveryMode, RecoveryOptions, SectorKeys,
    TagAccess, Uid,
};
use tapcart_card::storage::{DATA_BLOCKS_PER_SECTOR, SECTOR_COUNT};
use tapcart_common::{cart, CartOp};

use crate::error::ProcessingErrorEvent;
use crate::input::{InputKind, InputRequest, InputResponse, InputValue};
use crate::item::WorkItem;
use crate::processor::{Processor, ProcessorChannels, ProcessorEvent};
use crate::processors::{relay_events, relay_input_requests};
use crate::state::{Outcome, ProcessingResult};

/// How long the operator has to supply sector keys.
const KEYS_TIMEOUT: Duration = Duration::from_secs(30);
/// Detection window for operations without their own timeout.
const DEFAULT_DETECT_TIMEOUT_MS: u64 = 10_000;

/// Balance mutation carried by a balance-update item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BalanceOp {
    Credit { amount: u32 },
    Debit { amount: u32 },
}

/// Closed union of card operations; the composite dispatches on this
/// exhaustively, so there is no unknown-kind fallback at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NfcOperation {
    CartRead {
        timeout_ms: u64,
    },
    CartUpdate {
        timeout_ms: u64,
        product_id: u16,
        quantity: u8,
        price: u32,
        op: CartOp,
    },
    TagFormat {
        mode: RecoveryMode,
        owned_keys: Vec<String>,
    },
    BalanceRead {
        timeout_ms: u64,
    },
    BalanceUpdate {
        timeout_ms: u64,
        op: BalanceOp,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NfcItem {
    pub id: String,
    pub priority: i32,
    pub op: NfcOperation,
}

impl NfcItem {
    pub fn new(op: NfcOperation) -> Self {
        Self {
            id: Ulid::new().to_string(),
            priority: 0,
            op,
        }
    }

    pub fn cart_read() -> Self {
        Self::new(NfcOperation::CartRead {
            timeout_ms: 15_000,
        })
    }

    pub fn cart_update(product_id: u16, quantity: u8, price: u32, op: CartOp) -> Self {
        Self::new(NfcOperation::CartUpdate {
            timeout_ms: 20_000,
            product_id,
            quantity,
            price,
            op,
        })
    }

    pub fn tag_format(mode: RecoveryMode, owned_keys: Vec<String>) -> Self {
        Self::new(NfcOperation::TagFormat { mode, owned_keys })
    }

    pub fn balance_read() -> Self {
        Self::new(NfcOperation::BalanceRead {
            timeout_ms: 15_000,
        })
    }

    pub fn balance_update(op: BalanceOp) -> Self {
        Self::new(NfcOperation::BalanceUpdate {
            timeout_ms: 20_000,
            op,
        })
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

impl WorkItem for NfcItem {
    fn id(&self) -> &str {
        &self.id
    }

    fn priority(&self) -> i32 {
        self.priority
    }
}

/// Wait for a card and announce it.
async fn detect(
    channels: &ProcessorChannels,
    access: &TagAccess,
    timeout_ms: u64,
) -> Result<Uid, ProcessingErrorEvent> {
    channels.emit(ProcessorEvent::ReachTag { timeout_ms });
    match access.detect_tag(Duration::from_millis(timeout_ms)).await {
        Ok(Some(uid)) => {
            channels.emit(ProcessorEvent::CardDetected {
                uid: hex::encode_upper(uid),
            });
            Ok(uid)
        }
        Ok(None) => Err(ProcessingErrorEvent::TagReachTimeout),
        Err(err) => Err(err.into()),
    }
}

/// Ask the UI for the card's sector keys.
async fn request_keys(channels: &ProcessorChannels) -> Result<KeyMap, ProcessingErrorEvent> {
    channels.emit(ProcessorEvent::ValidatingKeys);
    let response = channels
        .request_input(InputRequest::new(InputKind::SectorKeys, Some(KEYS_TIMEOUT)))
        .await;

    if response.canceled {
        return Err(ProcessingErrorEvent::Canceled);
    }
    if response.timed_out {
        return Err(ProcessingErrorEvent::MissingKeys);
    }
    let InputValue::Keys { key_a, key_b } = response.value else {
        return Err(ProcessingErrorEvent::InvalidInput);
    };
    let keys = SectorKeys::from_hex(key_a.as_deref(), key_b.as_deref())
        .ok_or(ProcessingErrorEvent::InvalidKeys)?;
    if !keys.has_any() {
        return Err(ProcessingErrorEvent::MissingKeys);
    }
    Ok(KeyMap::uniform(keys))
}

/// Reads the cart currently on the card.
pub struct CartReadProcessor {
    access: Arc<TagAccess>,
    storage: CardStorage,
    channels: ProcessorChannels,
}

impl CartReadProcessor {
    pub fn new(access: Arc<TagAccess>) -> Self {
        Self {
            storage: CardStorage::new(access.clone()),
            access,
            channels: ProcessorChannels::new(),
        }
    }

    async fn run(&self, timeout_ms: u64) -> Result<Outcome, ProcessingErrorEvent> {
        detect(&self.channels, &self.access, timeout_ms).await?;
        let keys = request_keys(&self.channels).await?;

        self.channels.emit(ProcessorEvent::ReadingCartData);
        let items = match self.storage.read_cart_header(&keys).await? {
            Some(header) => self.storage.read_cart(&header, &keys).await?,
            // No cart header yet: an empty cart, not a fault.
            None => Vec::new(),
        };
        info!(items = items.len(), "cart read from card");
        Ok(Outcome::CartRead { items })
    }
}

#[async_trait]
impl Processor<NfcItem> for CartReadProcessor {
    async fn process(&self, item: &NfcItem) -> ProcessingResult {
        self.channels.emit(ProcessorEvent::Started);
        let NfcOperation::CartRead { timeout_ms } = item.op else {
            return ProcessingResult::Error(ProcessingErrorEvent::InvalidInput);
        };
        match self.run(timeout_ms).await {
            Ok(outcome) => ProcessingResult::Success(outcome),
            Err(event) => ProcessingResult::Error(event),
        }
    }

    async fn abort(&self, _item: Option<&NfcItem>) -> bool {
        self.access.abort();
        self.channels.cancel_pending_input();
        self.channels.emit(ProcessorEvent::Cancelled);
        true
    }

    fn events(&self) -> broadcast::Receiver<ProcessorEvent> {
        self.channels.events()
    }

    fn input_requests(&self) -> broadcast::Receiver<InputRequest> {
        self.channels.input_requests()
    }

    async fn provide_input(&self, response: InputResponse) -> bool {
        self.channels.provide_input(response).await
    }
}

/// Applies one cart mutation and rewrites the cart region.
pub struct CartUpdateProcessor {
    access: Arc<TagAccess>,
    storage: CardStorage,
    channels: ProcessorChannels,
}

impl CartUpdateProcessor {
    pub fn new(access: Arc<TagAccess>) -> Self {
        Self {
            storage: CardStorage::new(access.clone()),
            access,
            channels: ProcessorChannels::new(),
        }
    }

    async fn run(
        &self,
        timeout_ms: u64,
        product_id: u16,
        quantity: u8,
        price: u32,
        op: CartOp,
    ) -> Result<Outcome, ProcessingErrorEvent> {
        detect(&self.channels, &self.access, timeout_ms).await?;
        let keys = request_keys(&self.channels).await?;

        // The card must be provisioned before it can carry a cart.
        let Some(customer) = self.storage.read_customer_header(&keys).await? else {
            warn!("customer header missing, card not set up");
            return Err(ProcessingErrorEvent::InvalidHeader);
        };

        self.channels.emit(ProcessorEvent::ReadingCartData);
        let existing = match self.storage.read_cart_header(&keys).await? {
            Some(header) if header.item_count > 0 => {
                self.storage.read_cart(&header, &keys).await?
            }
            _ => Vec::new(),
        };

        self.channels.emit(ProcessorEvent::ProcessingCartData);
        let updated = cart::apply(&existing, product_id, quantity, price, op)?;
        debug!(
            before = existing.len(),
            after = updated.len(),
            "cart mutation applied"
        );

        let (start_sector, start_block) = CardStorage::cart_start(&customer);
        self.channels.emit(ProcessorEvent::WritingCartData);
        let header = self
            .storage
            .write_cart(&updated, start_sector, start_block, &keys)
            .await?;
        self.storage.write_cart_header(&header, &keys).await?;

        info!(items = updated.len(), "cart updated on card");
        Ok(Outcome::CartUpdated { items: updated })
    }
}

#[async_trait]
impl Processor<NfcItem> for CartUpdateProcessor {
    async fn process(&self, item: &NfcItem) -> ProcessingResult {
        self.channels.emit(ProcessorEvent::Started);
        let NfcOperation::CartUpdate {
            timeout_ms,
            product_id,
            quantity,
            price,
            op,
        } = item.op
        else {
            return ProcessingResult::Error(ProcessingErrorEvent::InvalidInput);
        };
        match self.run(timeout_ms, product_id, quantity, price, op).await {
            Ok(outcome) => ProcessingResult::Success(outcome),
            Err(event) => ProcessingResult::Error(event),
        }
    }

    async fn abort(&self, _item: Option<&NfcItem>) -> bool {
        self.access.abort();
        self.channels.cancel_pending_input();
        self.channels.emit(ProcessorEvent::Cancelled);
        true
    }

    fn events(&self) -> broadcast::Receiver<ProcessorEvent> {
        self.channels.events()
    }

    fn input_requests(&self) -> broadcast::Receiver<InputRequest> {
        self.channels.input_requests()
    }

    async fn provide_input(&self, response: InputResponse) -> bool {
        self.channels.provide_input(response).await
    }
}

/// Recovers whatever keys it can, then resets the tag to transport
/// configuration: data blocks zeroed, trailers rewritten.
pub struct TagFormatProcessor {
    access: Arc<TagAccess>,
    recovery: Arc<KeyRecovery>,
    channels: ProcessorChannels,
}

impl TagFormatProcessor {
    pub fn new(access: Arc<TagAccess>) -> Self {
        Self {
            recovery: Arc::new(KeyRecovery::new(access.clone())),
            access,
            channels: ProcessorChannels::new(),
        }
    }

    async fn run(
        &self,
        mode: RecoveryMode,
        owned_keys: &[String],
    ) -> Result<Outcome, ProcessingErrorEvent> {
        detect(&self.channels, &self.access, DEFAULT_DETECT_TIMEOUT_MS).await?;

        let mut parsed = Vec::with_capacity(owned_keys.len());
        for key in owned_keys {
            parsed.push(
                tapcart_card::keys::parse_key(key).ok_or(ProcessingErrorEvent::InvalidKeys)?,
            );
        }

        self.channels.emit(ProcessorEvent::RecoveringKeys);
        let report = self
            .recovery
            .run(&RecoveryOptions {
                owned_keys: parsed,
                mode,
                ..RecoveryOptions::default()
            })
            .await?;
        if report.aborted {
            return Err(ProcessingErrorEvent::TagNotFound);
        }

        let transport = conditions::transport_trailer();
        let mut formatted = 0usize;
        for sector in 0..SECTOR_COUNT {
            let keys = report.keys[sector as usize];
            if !keys.has_any() {
                debug!(sector, "no keys recovered, sector left as-is");
                continue;
            }
            self.channels.emit(ProcessorEvent::FormattingSector { sector });

            // Data blocks first: the old keys stay valid until the
            // trailer is replaced.
            let first_block = if sector == 0 { 1 } else { 0 };
            for block in first_block..DATA_BLOCKS_PER_SECTOR {
                if !self.access.clear_data_block(sector, block, &keys).await? {
                    return Err(ProcessingErrorEvent::WriteError);
                }
            }
            if !self
                .access
                .write_sector_trailer(sector, &transport, &keys)
                .await?
            {
                return Err(ProcessingErrorEvent::WriteError);
            }
            formatted += 1;
        }

        if formatted == 0 {
            return Err(ProcessingErrorEvent::InvalidKeys);
        }
        info!(sectors = formatted, "tag formatted to transport configuration");
        Ok(Outcome::Formatted { sectors: formatted })
    }
}

#[async_trait]
impl Processor<NfcItem> for TagFormatProcessor {
    async fn process(&self, item: &NfcItem) -> ProcessingResult {
        self.channels.emit(ProcessorEvent::Started);
        let NfcOperation::TagFormat { mode, ref owned_keys } = item.op else {
            return ProcessingResult::Error(ProcessingErrorEvent::InvalidInput);
        };
        match self.run(mode, owned_keys).await {
            Ok(outcome) => ProcessingResult::Success(outcome),
            Err(event) => ProcessingResult::Error(event),
        }
    }

    async fn abort(&self, _item: Option<&NfcItem>) -> bool {
        self.recovery.request_abort();
        self.access.abort();
        self.channels.cancel_pending_input();
        self.channels.emit(ProcessorEvent::Cancelled);
        true
    }

    fn events(&self) -> broadcast::Receiver<ProcessorEvent> {
        self.channels.events()
    }

    fn input_requests(&self) -> broadcast::Receiver<InputRequest> {
        self.channels.input_requests()
    }

    async fn provide_input(&self, response: InputResponse) -> bool {
        self.channels.provide_input(response).await
    }
}

/// Reads the stored-value balance block.
pub struct BalanceReadProcessor {
    access: Arc<TagAccess>,
    storage: CardStorage,
    channels: ProcessorChannels,
}

impl BalanceReadProcessor {
    pub fn new(access: Arc<TagAccess>) -> Self {
        Self {
            storage: CardStorage::new(access.clone()),
            access,
            channels: ProcessorChannels::new(),
        }
    }

    async fn run(&self, timeout_ms: u64) -> Result<Outcome, ProcessingErrorEvent> {
        detect(&self.channels, &self.access, timeout_ms).await?;
        let keys = request_keys(&self.channels).await?;

        self.channels.emit(ProcessorEvent::ReadingBalance);
        let Some(header) = self.storage.read_balance(&keys).await? else {
            return Err(ProcessingErrorEvent::InvalidHeader);
        };
        info!(balance = header.balance, "balance read from card");
        Ok(Outcome::BalanceRead {
            balance: header.balance,
            timestamp_ms: header.timestamp_ms,
        })
    }
}

#[async_trait]
impl Processor<NfcItem> for BalanceReadProcessor {
    async fn process(&self, item: &NfcItem) -> ProcessingResult {
        self.channels.emit(ProcessorEvent::Started);
        let NfcOperation::BalanceRead { timeout_ms } = item.op else {
            return ProcessingResult::Error(ProcessingErrorEvent::InvalidInput);
        };
        match self.run(timeout_ms).await {
            Ok(outcome) => ProcessingResult::Success(outcome),
            Err(event) => ProcessingResult::Error(event),
        }
    }

    async fn abort(&self, _item: Option<&NfcItem>) -> bool {
        self.access.abort();
        self.channels.cancel_pending_input();
        self.channels.emit(ProcessorEvent::Cancelled);
        true
    }

    fn events(&self) -> broadcast::Receiver<ProcessorEvent> {
        self.channels.events()
    }

    fn input_requests(&self) -> broadcast::Receiver<InputRequest> {
        self.channels.input_requests()
    }

    async fn provide_input(&self, response: InputResponse) -> bool {
        self.channels.provide_input(response).await
    }
}

/// Credits or debits the stored-value balance.
pub struct BalanceUpdateProcessor {
    access: Arc<TagAccess>,
    storage: CardStorage,
    channels: ProcessorChannels,
}

impl BalanceUpdateProcessor {
    pub fn new(access: Arc<TagAccess>) -> Self {
        Self {
            storage: CardStorage::new(access.clone()),
            access,
            channels: ProcessorChannels::new(),
        }
    }

    async fn run(&self, timeout_ms: u64, op: &BalanceOp) -> Result<Outcome, ProcessingErrorEvent> {
        detect(&self.channels, &self.access, timeout_ms).await?;
        let keys = request_keys(&self.channels).await?;

        self.channels.emit(ProcessorEvent::ReadingBalance);
        let current = self.storage.read_balance(&keys).await?;

        let balance = match op {
            BalanceOp::Credit { amount } => {
                // A fresh card starts from zero.
                let current = current.map(|header| header.balance).unwrap_or(0);
                current
                    .checked_add(*amount)
                    .ok_or(ProcessingErrorEvent::BalanceOverflow)?
            }
            BalanceOp::Debit { amount } => {
                let current = current
                    .map(|header| header.balance)
                    .ok_or(ProcessingErrorEvent::InsufficientBalance)?;
                current
                    .checked_sub(*amount)
                    .ok_or(ProcessingErrorEvent::InsufficientBalance)?
            }
        };

        self.channels.emit(ProcessorEvent::WritingBalance);
        let header = self.storage.write_balance(balance, &keys).await?;
        info!(balance = header.balance, "balance updated on card");
        Ok(Outcome::BalanceUpdated {
            balance: header.balance,
        })
    }
}

#[async_trait]
impl Processor<NfcItem> for BalanceUpdateProcessor {
    async fn process(&self, item: &NfcItem) -> ProcessingResult {
        self.channels.emit(ProcessorEvent::Started);
        let NfcOperation::BalanceUpdate { timeout_ms, ref op } = item.op else {
            return ProcessingResult::Error(ProcessingErrorEvent::InvalidInput);
        };
        match self.run(timeout_ms, op).await {
            Ok(outcome) => ProcessingResult::Success(outcome),
            Err(event) => ProcessingResult::Error(event),
        }
    }

    async fn abort(&self, _item: Option<&NfcItem>) -> bool {
        self.access.abort();
        self.channels.cancel_pending_input();
        self.channels.emit(ProcessorEvent::Cancelled);
        true
    }

    fn events(&self) -> broadcast::Receiver<ProcessorEvent> {
        self.channels.events()
    }

    fn input_requests(&self) -> broadcast::Receiver<InputRequest> {
        self.channels.input_requests()
    }

    async fn provide_input(&self, response: InputResponse) -> bool {
        self.channels.provide_input(response).await
    }
}

/// Explicit registry of card-operation delegates, built once at startup
/// and shared by reference.
pub struct NfcProcessorRegistry {
    pub cart_read: Arc<CartReadProcessor>,
    pub cart_update: Arc<CartUpdateProcessor>,
    pub tag_format: Arc<TagFormatProcessor>,
    pub balance_read: Arc<BalanceReadProcessor>,
    pub balance_update: Arc<BalanceUpdateProcessor>,
}

impl NfcProcessorRegistry {
    pub fn new(access: Arc<TagAccess>) -> Self {
        Self {
            cart_read: Arc::new(CartReadProcessor::new(access.clone())),
            cart_update: Arc::new(CartUpdateProcessor::new(access.clone())),
            tag_format: Arc::new(TagFormatProcessor::new(access.clone())),
            balance_read: Arc::new(BalanceReadProcessor::new(access.clone())),
            balance_update: Arc::new(BalanceUpdateProcessor::new(access)),
        }
    }
}

/// Composite processor: one queue for every card operation. Dispatch is
/// an exhaustive match over [`NfcOperation`].
pub struct DynamicNfcProcessor {
    registry: NfcProcessorRegistry,
    channels: ProcessorChannels,
    current: Mutex<Option<Arc<dyn Processor<NfcItem>>>>,
}

impl DynamicNfcProcessor {
    pub fn new(registry: NfcProcessorRegistry) -> Self {
        Self {
            registry,
            channels: ProcessorChannels::new(),
            current: Mutex::new(None),
        }
    }

    fn delegate_for(&self, op: &NfcOperation) -> Arc<dyn Processor<NfcItem>> {
        match op {
            NfcOperation::CartRead { .. } => self.registry.cart_read.clone(),
            NfcOperation::CartUpdate { .. } => self.registry.cart_update.clone(),
            NfcOperation::TagFormat { .. } => self.registry.tag_format.clone(),
            NfcOperation::BalanceRead { .. } => self.registry.balance_read.clone(),
            NfcOperation::BalanceUpdate { .. } => self.registry.balance_update.clone(),
        }
    }
}

#[async_trait]
impl Processor<NfcItem> for DynamicNfcProcessor {
    async fn process(&self, item: &NfcItem) -> ProcessingResult {
        let delegate = self.delegate_for(&item.op);
        *self.current.lock().unwrap() = Some(delegate.clone());

        self.channels.emit(ProcessorEvent::Started);
        let events = relay_events(delegate.events(), self.channels.events_sender());
        let requests =
            relay_input_requests(delegate.input_requests(), self.channels.input_requests_sender());

        let result = delegate.process(item).await;

        events.shutdown().await;
        requests.shutdown().await;
        *self.current.lock().unwrap() = None;
        result
    }

    async fn abort(&self, item: Option<&NfcItem>) -> bool {
        self.channels.emit(ProcessorEvent::Cancelled);
        self.channels.cancel_pending_input();
        let current = self.current.lock().unwrap().clone();
        match (current, item) {
            (Some(delegate), _) => delegate.abort(item).await,
            (None, Some(item)) => self.delegate_for(&item.op).abort(Some(item)).await,
            (None, None) => {
                // Nothing in flight; quiesce the shared radio once.
                self.registry.cart_read.abort(None).await
            }
        }
    }

    fn events(&self) -> broadcast::Receiver<ProcessorEvent> {
        self.channels.events()
    }

    fn input_requests(&self) -> broadcast::Receiver<InputRequest> {
        self.channels.input_requests()
    }

    async fn provide_input(&self, response: InputResponse) -> bool {
        let current = self.current.lock().unwrap().clone();
        match current {
            Some(delegate) => delegate.provide_input(response).await,
            None => self.channels.provide_input(response).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tapcart_card::MemoryCard;
    use tapcart_common::{CartItem, DataHeader, DataType};

    const FF: &str = "FFFFFFFFFFFF";

    fn setup() -> (Arc<MemoryCard>, Arc<TagAccess>) {
        let card = Arc::new(MemoryCard::transport([9, 9, 9, 9]));
        let access = Arc::new(TagAccess::new(card.clone()));
        (card, access)
    }

    /// Answer every SectorKeys request with the transport keys.
    fn answer_keys<P>(processor: Arc<P>)
    where
        P: Processor<NfcItem> + Send + Sync + 'static,
    {
        let mut requests = processor.input_requests();
        tokio::spawn(async move {
            while let Ok(request) = requests.recv().await {
                if matches!(request.kind, InputKind::SectorKeys) {
                    processor
                        .provide_input(InputResponse::answer(
                            request.id,
                            InputValue::Keys {
                                key_a: Some(FF.into()),
                                key_b: Some(FF.into()),
                            },
                        ))
                        .await;
                }
            }
        });
    }

    async fn provision_customer(access: &Arc<TagAccess>) {
        let storage = CardStorage::new(access.clone());
        let keys = KeyMap::uniform(SectorKeys::from_hex(Some(FF), Some(FF)).unwrap());
        let customer = DataHeader {
            data_type: DataType::Customer,
            start_sector: 0,
            start_block: 1,
            end_sector: 1,
            end_block: 2,
            item_count: 1,
            total_bytes: 48,
            timestamp_ms: 1,
        };
        storage.write_customer_header(&customer, &keys).await.unwrap();
    }

    #[tokio::test]
    async fn cart_update_then_read_round_trips() {
        let (_card, access) = setup();
        provision_customer(&access).await;

        let update = Arc::new(CartUpdateProcessor::new(access.clone()));
        answer_keys(update.clone());

        let result = update
            .process(&NfcItem::cart_update(7, 2, 1_200, CartOp::Increment))
            .await;
        assert!(
            matches!(
                &result,
                ProcessingResult::Success(Outcome::CartUpdated { items })
                    if items == &vec![CartItem { product_id: 7, count: 2, price: 1_200 }]
            ),
            "unexpected: {result:?}"
        );

        let read = Arc::new(CartReadProcessor::new(access));
        answer_keys(read.clone());
        let result = read.process(&NfcItem::cart_read()).await;
        assert!(
            matches!(
                &result,
                ProcessingResult::Success(Outcome::CartRead { items }) if items.len() == 1
            ),
            "unexpected: {result:?}"
        );
    }

    #[tokio::test]
    async fn cart_update_without_customer_header_fails() {
        let (_card, access) = setup();
        let update = Arc::new(CartUpdateProcessor::new(access));
        answer_keys(update.clone());

        let result = update
            .process(&NfcItem::cart_update(7, 1, 500, CartOp::Set))
            .await;
        assert_eq!(
            result,
            ProcessingResult::Error(ProcessingErrorEvent::InvalidHeader)
        );
    }

    #[tokio::test]
    async fn increment_overflow_leaves_the_card_cart_intact() {
        let (_card, access) = setup();
        provision_customer(&access).await;

        let update = Arc::new(CartUpdateProcessor::new(access.clone()));
        answer_keys(update.clone());

        let seeded = update
            .process(&NfcItem::cart_update(7, 250, 100, CartOp::Set))
            .await;
        assert!(matches!(seeded, ProcessingResult::Success(_)));

        let result = update
            .process(&NfcItem::cart_update(7, 10, 100, CartOp::Increment))
            .await;
        assert_eq!(
            result,
            ProcessingResult::Error(ProcessingErrorEvent::QuantityOverflow)
        );

        // The stored cart still shows 250.
        let read = Arc::new(CartReadProcessor::new(access));
        answer_keys(read.clone());
        match read.process(&NfcItem::cart_read()).await {
            ProcessingResult::Success(Outcome::CartRead { items }) => {
                assert_eq!(items, vec![CartItem { product_id: 7, count: 250, price: 100 }]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_card_times_out() {
        let (card, access) = setup();
        card.remove_card();
        let read = Arc::new(CartReadProcessor::new(access));

        let result = read
            .process(&NfcItem::new(NfcOperation::CartRead { timeout_ms: 30 }))
            .await;
        assert_eq!(
            result,
            ProcessingResult::Error(ProcessingErrorEvent::TagReachTimeout)
        );
    }

    #[tokio::test]
    async fn abort_cancels_a_pending_key_request() {
        let (_card, access) = setup();
        let read = Arc::new(CartReadProcessor::new(access));
        // Nobody answers the request; abort instead of waiting out the
        // full key window.
        let runner = {
            let read = read.clone();
            tokio::spawn(async move { read.process(&NfcItem::cart_read()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        read.abort(None).await;

        assert_eq!(
            runner.await.unwrap(),
            ProcessingResult::Error(ProcessingErrorEvent::Canceled)
        );
    }

    #[tokio::test]
    async fn balance_cycle_credit_debit() {
        let (_card, access) = setup();
        let update = Arc::new(BalanceUpdateProcessor::new(access.clone()));
        answer_keys(update.clone());

        let result = update
            .process(&NfcItem::balance_update(BalanceOp::Credit { amount: 5_000 }))
            .await;
        assert_eq!(
            result,
            ProcessingResult::Success(Outcome::BalanceUpdated { balance: 5_000 })
        );

        let result = update
            .process(&NfcItem::balance_update(BalanceOp::Debit { amount: 1_500 }))
            .await;
        assert_eq!(
            result,
            ProcessingResult::Success(Outcome::BalanceUpdated { balance: 3_500 })
        );

        let read = Arc::new(BalanceReadProcessor::new(access));
        answer_keys(read.clone());
        match read.process(&NfcItem::balance_read()).await {
            ProcessingResult::Success(Outcome::BalanceRead { balance, .. }) => {
                assert_eq!(balance, 3_500);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn overdraft_is_rejected() {
        let (_card, access) = setup();
        let update = Arc::new(BalanceUpdateProcessor::new(access));
        answer_keys(update.clone());

        let result = update
            .process(&NfcItem::balance_update(BalanceOp::Debit { amount: 100 }))
            .await;
        assert_eq!(
            result,
            ProcessingResult::Error(ProcessingErrorEvent::InsufficientBalance)
        );
    }

    #[tokio::test]
    async fn format_resets_provisioned_sectors() {
        let (card, access) = setup();
        // Provision with production keys drawn from the standard set.
        let key_a = tapcart_card::keys::parse_key("A0A1A2A3A4A5").unwrap();
        let key_b = tapcart_card::keys::parse_key(FF).unwrap();
        for sector in 0..16 {
            card.seed_trailer(sector, conditions::production_trailer(&key_a, &key_b));
        }

        let format = Arc::new(TagFormatProcessor::new(access));
        let result = format
            .process(&NfcItem::tag_format(RecoveryMode::MostLikely, vec![]))
            .await;
        assert_eq!(
            result,
            ProcessingResult::Success(Outcome::Formatted { sectors: 16 })
        );

        // Trailer is back to transport config; data blocks zeroed.
        assert_eq!(card.raw_block(1, 3), conditions::transport_trailer());
        assert_eq!(card.raw_block(1, 0), [0u8; 16]);
        // Manufacturer block untouched.
        assert_ne!(card.raw_block(0, 0), [0u8; 16]);
    }

    #[tokio::test]
    async fn dynamic_nfc_routes_by_operation_kind() {
        let (_card, access) = setup();
        provision_customer(&access).await;

        let dynamic = Arc::new(DynamicNfcProcessor::new(NfcProcessorRegistry::new(access)));
        answer_keys(dynamic.clone());
        let mut events = dynamic.events();

        let result = dynamic
            .process(&NfcItem::cart_update(3, 1, 900, CartOp::Set))
            .await;
        assert!(matches!(result, ProcessingResult::Success(_)));

        let result = dynamic.process(&NfcItem::cart_read()).await;
        assert!(matches!(
            result,
            ProcessingResult::Success(Outcome::CartRead { .. })
        ));

        tokio::time::sleep(Duration::from_millis(10)).await;
        let mut started = 0;
        while let Ok(event) = events.try_recv() {
            if event == ProcessorEvent::Started {
                started += 1;
            }
        }
        // One Started per item, none duplicated from the delegates.
        assert_eq!(started, 2);
    }
}
