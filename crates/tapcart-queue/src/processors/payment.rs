//! Payment processors.
//!
//! Cash settles locally after a simulated acquirer round trip; PIX
//! suspends on the input channel until the operator confirms the code was
//! scanned and settled. `DynamicPaymentProcessor` lets one queue mix
//! methods by dispatching each item to its delegate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::error::ProcessingErrorEvent;
use crate::input::{InputKind, InputRequest, InputResponse, InputValue};
use crate::item::WorkItem;
use crate::processor::{Processor, ProcessorChannels, ProcessorEvent};
use crate::processors::{relay_events, relay_input_requests};
use crate::state::{Outcome, ProcessingResult};

/// Smallest charge the terminal accepts, in cents.
const MIN_AMOUNT_CENTS: u32 = 100;
/// How long the operator has to confirm a PIX scan.
const SCAN_CONFIRM_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentMethod {
    Cash,
    Pix { code: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentItem {
    pub id: String,
    pub priority: i32,
    pub amount_cents: u32,
    pub method: PaymentMethod,
}

impl PaymentItem {
    pub fn cash(amount_cents: u32) -> Self {
        Self {
            id: Ulid::new().to_string(),
            priority: 0,
            amount_cents,
            method: PaymentMethod::Cash,
        }
    }

    pub fn pix(amount_cents: u32, code: impl Into<String>) -> Self {
        Self {
            id: Ulid::new().to_string(),
            priority: 0,
            amount_cents,
            method: PaymentMethod::Pix { code: code.into() },
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

impl WorkItem for PaymentItem {
    fn id(&self) -> &str {
        &self.id
    }

    fn priority(&self) -> i32 {
        self.priority
    }
}

/// Cash payments: no acquirer involved beyond the drawer.
pub struct CashPaymentProcessor {
    channels: ProcessorChannels,
    /// Simulated acquirer latency; shortened in tests.
    latency: Duration,
    aborting: AtomicBool,
}

impl Default for CashPaymentProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl CashPaymentProcessor {
    pub fn new() -> Self {
        Self {
            channels: ProcessorChannels::new(),
            latency: Duration::from_millis(800),
            aborting: AtomicBool::new(false),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

#[async_trait]
impl Processor<PaymentItem> for CashPaymentProcessor {
    async fn process(&self, item: &PaymentItem) -> ProcessingResult {
        self.aborting.store(false, Ordering::SeqCst);
        self.channels.emit(ProcessorEvent::Started);

        if item.amount_cents < MIN_AMOUNT_CENTS {
            warn!(amount = item.amount_cents, "cash amount below minimum");
            return ProcessingResult::Error(ProcessingErrorEvent::InvalidAmount);
        }

        tokio::time::sleep(self.latency).await;
        if self.aborting.load(Ordering::SeqCst) {
            return ProcessingResult::Error(ProcessingErrorEvent::Canceled);
        }

        let transaction_id = format!("CASH-{}", Ulid::new());
        info!(%transaction_id, amount = item.amount_cents, "cash payment settled");
        self.channels.emit(ProcessorEvent::TransactionDone);
        ProcessingResult::Success(Outcome::Payment { transaction_id })
    }

    async fn abort(&self, item: Option<&PaymentItem>) -> bool {
        debug!(id = item.map(|i| i.id()), "aborting cash payment");
        self.aborting.store(true, Ordering::SeqCst);
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

/// PIX payments: show the code, wait for the operator to confirm the
/// customer scanned and settled it.
pub struct PixPaymentProcessor {
    channels: ProcessorChannels,
    confirm_timeout: Duration,
}

impl Default for PixPaymentProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl PixPaymentProcessor {
    pub fn new() -> Self {
        Self {
            channels: ProcessorChannels::new(),
            confirm_timeout: SCAN_CONFIRM_TIMEOUT,
        }
    }

    pub fn with_confirm_timeout(mut self, timeout: Duration) -> Self {
        self.confirm_timeout = timeout;
        self
    }
}

#[async_trait]
impl Processor<PaymentItem> for PixPaymentProcessor {
    async fn process(&self, item: &PaymentItem) -> ProcessingResult {
        self.channels.emit(ProcessorEvent::Started);

        let PaymentMethod::Pix { code } = &item.method else {
            return ProcessingResult::Error(ProcessingErrorEvent::InvalidInput);
        };
        if item.amount_cents < MIN_AMOUNT_CENTS {
            return ProcessingResult::Error(ProcessingErrorEvent::InvalidAmount);
        }

        self.channels.emit(ProcessorEvent::AwaitingConfirmation);
        let response = self
            .channels
            .request_input(InputRequest::new(
                InputKind::ConfirmScan { code: code.clone() },
                Some(self.confirm_timeout),
            ))
            .await;

        // A decline, a cancel, or an expired window all mean the charge
        // did not settle.
        if response.canceled || response.timed_out {
            return ProcessingResult::Error(ProcessingErrorEvent::Canceled);
        }
        match response.value {
            InputValue::Confirm(true) => {
                let transaction_id = format!("PIX-{}", Ulid::new());
                info!(%transaction_id, amount = item.amount_cents, "pix payment confirmed");
                self.channels.emit(ProcessorEvent::TransactionDone);
                ProcessingResult::Success(Outcome::Payment { transaction_id })
            }
            InputValue::Confirm(false) => {
                ProcessingResult::Error(ProcessingErrorEvent::Canceled)
            }
            _ => ProcessingResult::Error(ProcessingErrorEvent::InvalidInput),
        }
    }

    async fn abort(&self, item: Option<&PaymentItem>) -> bool {
        debug!(id = item.map(|i| i.id()), "aborting pix payment");
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

/// Explicit registry of payment delegates, built once at startup.
pub struct PaymentProcessorRegistry {
    pub cash: Arc<CashPaymentProcessor>,
    pub pix: Arc<PixPaymentProcessor>,
}

impl Default for PaymentProcessorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PaymentProcessorRegistry {
    pub fn new() -> Self {
        Self {
            cash: Arc::new(CashPaymentProcessor::new()),
            pix: Arc::new(PixPaymentProcessor::new()),
        }
    }
}

/// Composite processor: one queue, mixed payment methods. Dispatch is an
/// exhaustive match on the item's method; there is no unknown-tag path.
pub struct DynamicPaymentProcessor {
    registry: PaymentProcessorRegistry,
    channels: ProcessorChannels,
    current: Mutex<Option<Arc<dyn Processor<PaymentItem>>>>,
}

impl DynamicPaymentProcessor {
    pub fn new(registry: PaymentProcessorRegistry) -> Self {
        Self {
            registry,
            channels: ProcessorChannels::new(),
            current: Mutex::new(None),
        }
    }

    fn delegate_for(&self, method: &PaymentMethod) -> Arc<dyn Processor<PaymentItem>> {
        match method {
            PaymentMethod::Cash => self.registry.cash.clone(),
            PaymentMethod::Pix { .. } => self.registry.pix.clone(),
        }
    }
}

#[async_trait]
impl Processor<PaymentItem> for DynamicPaymentProcessor {
    async fn process(&self, item: &PaymentItem) -> ProcessingResult {
        let delegate = self.delegate_for(&item.method);
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

    async fn abort(&self, item: Option<&PaymentItem>) -> bool {
        self.channels.emit(ProcessorEvent::Cancelled);
        self.channels.cancel_pending_input();
        let current = self.current.lock().unwrap().clone();
        match (current, item) {
            (Some(delegate), _) => delegate.abort(item).await,
            (None, Some(item)) => self.delegate_for(&item.method).abort(Some(item)).await,
            // Nothing in flight: quiesce both delegates, both hooks are
            // idempotent.
            (None, None) => {
                let cash = self.registry.cash.abort(None).await;
                let pix = self.registry.pix.abort(None).await;
                cash && pix
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
