//! Processor contract.
//!
//! A processor is the pluggable strategy that executes one queue item. It
//! returns a tagged [`ProcessingResult`](crate::state::ProcessingResult),
//! exposes an outbound event stream for UI progress, and may suspend on
//! the interactive input channel. Shared plumbing lives in
//! [`ProcessorChannels`], a value each processor composes - there is no
//! base-class state to inherit.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::input::{InputChannel, InputRequest, InputResponse};
use crate::state::ProcessingResult;

const EVENT_STREAM_CAPACITY: usize = 32;

/// Domain-level progress notifications for presentation.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessorEvent {
    Started,
    Cancelled,
    /// Ask the customer to hold the card against the reader.
    ReachTag { timeout_ms: u64 },
    CardDetected { uid: String },
    ValidatingKeys,
    RecoveringKeys,
    ReadingCartData,
    ProcessingCartData,
    WritingCartData,
    ReadingBalance,
    WritingBalance,
    FormattingSector { sector: u8 },
    AwaitingConfirmation,
    TransactionDone,
}

/// Capability interface for one unit of work.
#[async_trait]
pub trait Processor<T>: Send + Sync {
    /// Run the item to completion. All faults come back as a tagged
    /// error result; this never panics the worker.
    async fn process(&self, item: &T) -> ProcessingResult;

    /// Abort hook. Must be idempotent, must release any exclusive
    /// hardware resource even if no operation was in flight, and reports
    /// whether the abort took effect cleanly.
    async fn abort(&self, item: Option<&T>) -> bool;

    fn events(&self) -> broadcast::Receiver<ProcessorEvent>;

    fn input_requests(&self) -> broadcast::Receiver<InputRequest>;

    /// Deliver a UI response to the processor's outstanding input
    /// request. Returns false when nothing was waiting for it.
    async fn provide_input(&self, response: InputResponse) -> bool;
}

/// Event and input plumbing shared by every processor.
pub struct ProcessorChannels {
    events: broadcast::Sender<ProcessorEvent>,
    input: InputChannel,
}

impl Default for ProcessorChannels {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessorChannels {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_STREAM_CAPACITY);
        Self {
            events,
            input: InputChannel::new(),
        }
    }

    /// Emit a progress event. Fine to call with no subscribers.
    pub fn emit(&self, event: ProcessorEvent) {
        let _ = self.events.send(event);
    }

    pub fn events(&self) -> broadcast::Receiver<ProcessorEvent> {
        self.events.subscribe()
    }

    pub(crate) fn events_sender(&self) -> broadcast::Sender<ProcessorEvent> {
        self.events.clone()
    }

    pub fn input_requests(&self) -> broadcast::Receiver<InputRequest> {
        self.input.subscribe()
    }

    pub(crate) fn input_requests_sender(&self) -> broadcast::Sender<InputRequest> {
        self.input.requests_sender()
    }

    /// Publish a request and suspend until response, cancel, or timeout.
    pub async fn request_input(&self, request: InputRequest) -> InputResponse {
        self.input.request(request).await
    }

    pub async fn provide_input(&self, response: InputResponse) -> bool {
        self.input.provide(response).await
    }

    /// Cancel whatever input request is outstanding. Part of every abort
    /// path so a suspended processor is never left hanging.
    pub fn cancel_pending_input(&self) {
        self.input.cancel_all();
    }
}
