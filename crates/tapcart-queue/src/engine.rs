//! The queue engine.
//!
//! One cooperative worker drains the queue: highest priority first, FIFO
//! within equal priority, exactly one item in flight at any instant. A
//! failed item is never dropped silently - the engine parks in a failed
//! state and asks for one of three decisions: retry (re-run `process`
//! from scratch), skip (mark canceled, advance), or abort (run the
//! processor's abort hook, then stop the worker).
//!
//! `enqueue`, `remove`, `abort` and `provide_input` are safe from any
//! task: they only append to the queue or signal channels, never touch
//! processing state directly.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::error::ProcessingErrorEvent;
use crate::input::{ErrorDecision, InputChannel, InputKind, InputRequest, InputValue};
use crate::item::{ItemStatus, WorkItem};
use crate::processor::{Processor, ProcessorEvent};
use crate::state::{ProcessingResult, ProcessingState};
use crate::store::QueueStore;

/// When item-state transitions are durably written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistenceStrategy {
    /// Write through on every transition. Anything where losing in-flight
    /// state is unacceptable (payments) runs with this.
    Immediate,
    /// Batch writes; `force_persist` is the only guaranteed synchronous
    /// checkpoint. An optional interval drains the batch opportunistically.
    OnFlush { flush_interval: Option<Duration> },
    /// Memory only.
    Never,
}

/// Whether the worker advances on its own or asks first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationMode {
    Auto,
    /// Issue a confirm-next input request before each item is dequeued.
    /// Declining moves the item to the back of the queue.
    Manual,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub persistence: PersistenceStrategy,
    pub confirmation: ConfirmationMode,
    /// Timeout for the error-decision request; `None` waits forever.
    pub decision_timeout: Option<Duration>,
    /// Timeout for manual confirm-next requests; expiry auto-confirms.
    pub confirm_timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            persistence: PersistenceStrategy::Immediate,
            confirmation: ConfirmationMode::Auto,
            decision_timeout: None,
            confirm_timeout: None,
        }
    }
}

struct Entry<T> {
    item: T,
    status: ItemStatus,
    seq: u64,
    enqueued_at: DateTime<Utc>,
    attempts: u32,
}

struct Shared<T> {
    /// Sorted by priority descending; stable sort keeps enqueue order
    /// within equal priority.
    queue: Vec<Entry<T>>,
    next_seq: u64,
    /// Ids awaiting persistence under `OnFlush`.
    dirty: HashSet<String>,
    /// Id of the in-flight item, if any.
    current: Option<String>,
}

struct Inner<T: WorkItem> {
    shared: Mutex<Shared<T>>,
    store: Arc<dyn QueueStore<T>>,
    processor: Arc<dyn Processor<T>>,
    config: EngineConfig,
    queue_state: watch::Sender<Vec<T>>,
    processing_state: watch::Sender<ProcessingState<T>>,
    inputs: InputChannel,
    worker_running: AtomicBool,
    flusher_running: AtomicBool,
    abort_requested: AtomicBool,
}

/// Persistent, single-flight work queue over a pluggable processor.
pub struct QueueEngine<T: WorkItem> {
    inner: Arc<Inner<T>>,
}

impl<T: WorkItem> Clone for QueueEngine<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: WorkItem> QueueEngine<T> {
    pub fn new(
        store: Arc<dyn QueueStore<T>>,
        processor: Arc<dyn Processor<T>>,
        config: EngineConfig,
    ) -> Self {
        let (queue_state, _) = watch::channel(Vec::new());
        let (processing_state, _) = watch::channel(ProcessingState::Idle);
        Self {
            inner: Arc::new(Inner {
                shared: Mutex::new(Shared {
                    queue: Vec::new(),
                    next_seq: 0,
                    dirty: HashSet::new(),
                    current: None,
                }),
                store,
                processor,
                config,
                queue_state,
                processing_state,
                inputs: InputChannel::new(),
                worker_running: AtomicBool::new(false),
                flusher_running: AtomicBool::new(false),
                abort_requested: AtomicBool::new(false),
            }),
        }
    }

    /// Reload pending items left over from a previous run.
    pub async fn restore(&self) -> Result<usize, crate::store::StoreError> {
        let pending = self.inner.store.get_all_by_status(ItemStatus::Pending).await?;
        let count = pending.len();
        {
            let mut shared = self.inner.shared.lock().await;
            for item in pending {
                if shared.queue.iter().any(|e| e.item.id() == item.id()) {
                    continue;
                }
                push_entry(&mut shared, item);
            }
            publish_queue(&self.inner, &shared);
        }
        if count > 0 {
            info!(count, "restored persisted queue items");
        }
        Ok(count)
    }

    pub async fn enqueue(&self, item: T) {
        {
            let mut shared = self.inner.shared.lock().await;
            push_entry(&mut shared, item.clone());
            publish_queue(&self.inner, &shared);
            if let PersistenceStrategy::OnFlush { .. } = self.inner.config.persistence {
                shared.dirty.insert(item.id().to_string());
            }
        }
        if let PersistenceStrategy::Immediate = self.inner.config.persistence {
            if let Err(err) = self.inner.store.insert(&item, ItemStatus::Pending).await {
                error!(error = %err, id = item.id(), "failed to persist enqueued item");
            }
        }
        debug!(id = item.id(), priority = item.priority(), "item enqueued");
    }

    /// Remove an item. Removing the in-flight item aborts the processor
    /// and stops the worker.
    pub async fn remove(&self, id: &str) {
        let was_current = {
            let mut shared = self.inner.shared.lock().await;
            shared.queue.retain(|entry| entry.item.id() != id);
            shared.dirty.remove(id);
            publish_queue(&self.inner, &shared);
            shared.current.as_deref() == Some(id)
        };
        if was_current {
            self.abort().await;
        }
        if self.inner.config.persistence != PersistenceStrategy::Never {
            if let Err(err) = self.inner.store.delete(id).await {
                error!(error = %err, id, "failed to delete item from store");
            }
        }
    }

    /// Drain the whole queue, aborting any in-flight work.
    pub async fn remove_all(&self) {
        self.abort().await;
        let ids: Vec<String> = {
            let mut shared = self.inner.shared.lock().await;
            let ids = shared
                .queue
                .iter()
                .map(|entry| entry.item.id().to_string())
                .collect();
            shared.queue.clear();
            shared.dirty.clear();
            publish_queue(&self.inner, &shared);
            ids
        };
        if self.inner.config.persistence != PersistenceStrategy::Never {
            for id in ids {
                if let Err(err) = self.inner.store.delete(&id).await {
                    error!(error = %err, id, "failed to delete item from store");
                }
            }
        }
        let _ = self.inner.processing_state.send(ProcessingState::Idle);
    }

    /// Forward an abort to the active processor and stop the worker once
    /// control returns. Idempotent.
    pub async fn abort(&self) {
        self.inner.abort_requested.store(true, Ordering::SeqCst);
        self.inner.inputs.cancel_all();
        let aborted = self.inner.processor.abort(None).await;
        debug!(aborted, "abort forwarded to processor");
    }

    /// Spawn the worker if it is not already running.
    pub fn start_processing(&self) {
        self.maybe_spawn_flusher();
        if self
            .inner
            .worker_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        self.inner.abort_requested.store(false, Ordering::SeqCst);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                let halted = worker_loop(&inner).await;
                inner.worker_running.store(false, Ordering::SeqCst);
                if halted || inner.abort_requested.load(Ordering::SeqCst) {
                    break;
                }
                // An enqueue may have raced the shutdown; if something is
                // pending, take the slot back instead of stranding it.
                let has_pending = {
                    let shared = inner.shared.lock().await;
                    shared
                        .queue
                        .iter()
                        .any(|entry| entry.status == ItemStatus::Pending)
                };
                if !has_pending
                    || inner
                        .worker_running
                        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                        .is_err()
                {
                    break;
                }
            }
        });
    }

    fn maybe_spawn_flusher(&self) {
        let PersistenceStrategy::OnFlush {
            flush_interval: Some(interval),
        } = self.inner.config.persistence
        else {
            return;
        };
        if self
            .inner
            .flusher_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let engine = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                engine.force_persist().await;
            }
        });
    }

    /// Synchronously flush everything awaiting persistence. The only
    /// guaranteed checkpoint under `OnFlush`.
    pub async fn force_persist(&self) {
        if self.inner.config.persistence == PersistenceStrategy::Never {
            return;
        }
        let batch: Vec<(T, ItemStatus)> = {
            let mut shared = self.inner.shared.lock().await;
            let dirty = std::mem::take(&mut shared.dirty);
            shared
                .queue
                .iter()
                .filter(|entry| dirty.contains(entry.item.id()))
                .map(|entry| (entry.item.clone(), entry.status))
                .collect()
        };
        for (item, status) in batch {
            if let Err(err) = self.inner.store.insert(&item, status).await {
                error!(error = %err, id = item.id(), "failed to flush item");
            }
        }
    }

    /// Delete completed rows from the store.
    pub async fn clear_completed(&self) {
        match self.inner.store.get_all_by_status(ItemStatus::Completed).await {
            Ok(items) => {
                for item in items {
                    if let Err(err) = self.inner.store.delete(item.id()).await {
                        error!(error = %err, id = item.id(), "failed to clear completed item");
                    }
                }
            }
            Err(err) => error!(error = %err, "failed to list completed items"),
        }
    }

    /// Route a UI response to whoever is waiting: the engine's own
    /// confirm/decision request first, the processor otherwise.
    pub async fn provide_input(&self, response: crate::input::InputResponse) -> bool {
        if self.inner.inputs.provide(response.clone()).await {
            return true;
        }
        self.inner.processor.provide_input(response).await
    }

    /// Pending/processing contents, priority order.
    pub fn queue_state(&self) -> watch::Receiver<Vec<T>> {
        self.inner.queue_state.subscribe()
    }

    pub fn processing_state(&self) -> watch::Receiver<ProcessingState<T>> {
        self.inner.processing_state.subscribe()
    }

    /// Engine-level input requests (confirm-next, error decisions).
    pub fn input_requests(&self) -> broadcast::Receiver<InputRequest> {
        self.inner.inputs.subscribe()
    }

    /// The processor's domain-event stream, re-exposed for the UI.
    pub fn processor_events(&self) -> broadcast::Receiver<ProcessorEvent> {
        self.inner.processor.events()
    }

    /// The processor's input-request stream, re-exposed for the UI.
    pub fn processor_input_requests(&self) -> broadcast::Receiver<InputRequest> {
        self.inner.processor.input_requests()
    }
}

fn push_entry<T: WorkItem>(shared: &mut Shared<T>, item: T) {
    let seq = shared.next_seq;
    shared.next_seq += 1;
    let entry = Entry {
        item,
        status: ItemStatus::Pending,
        seq,
        enqueued_at: Utc::now(),
        attempts: 0,
    };
    debug!(id = entry.item.id(), seq, enqueued_at = %entry.enqueued_at, "queue entry created");
    shared.queue.push(entry);
    // Stable: equal priorities keep their seq (enqueue) order.
    shared.queue.sort_by_key(|entry| std::cmp::Reverse(entry.item.priority()));
}

fn publish_queue<T: WorkItem>(inner: &Inner<T>, shared: &Shared<T>) {
    let items = shared.queue.iter().map(|entry| entry.item.clone()).collect();
    let _ = inner.queue_state.send(items);
}

async fn persist_status<T: WorkItem>(inner: &Inner<T>, item: &T, status: ItemStatus) {
    match &inner.config.persistence {
        PersistenceStrategy::Immediate => {
            if let Err(err) = inner.store.update_status(item.id(), status).await {
                error!(error = %err, id = item.id(), "failed to persist status");
            }
        }
        PersistenceStrategy::OnFlush { .. } => {
            let mut shared = inner.shared.lock().await;
            shared.dirty.insert(item.id().to_string());
        }
        PersistenceStrategy::Never => {}
    }
}

/// Mark an entry's in-memory status, if it is still queued.
async fn mark_status<T: WorkItem>(inner: &Inner<T>, id: &str, status: ItemStatus) {
    let mut shared = inner.shared.lock().await;
    if let Some(entry) = shared.queue.iter_mut().find(|e| e.item.id() == id) {
        entry.status = status;
    }
}

async fn take_out<T: WorkItem>(inner: &Inner<T>, id: &str) {
    let mut shared = inner.shared.lock().await;
    shared.queue.retain(|entry| entry.item.id() != id);
    shared.dirty.remove(id);
    shared.current = None;
    publish_queue(inner, &shared);
}

/// Returns true when the worker halted on an abort rather than draining.
async fn worker_loop<T: WorkItem>(inner: &Arc<Inner<T>>) -> bool {
    info!("queue worker started");
    let mut halted = false;

    'queue: loop {
        if inner.abort_requested.load(Ordering::SeqCst) {
            halted = true;
            break;
        }

        // Select the next pending item: priority descending, enqueue
        // order within equal priority (the queue is kept sorted).
        let Some((item, total, position)) = ({
            let shared = inner.shared.lock().await;
            shared
                .queue
                .iter()
                .enumerate()
                .find(|(_, entry)| entry.status == ItemStatus::Pending)
                .map(|(index, entry)| (entry.item.clone(), shared.queue.len(), index))
        }) else {
            break;
        };

        if inner.config.confirmation == ConfirmationMode::Manual {
            let request = InputRequest::new(
                InputKind::ConfirmNext {
                    item_id: item.id().to_string(),
                    position,
                    total,
                },
                inner.config.confirm_timeout,
            );
            let response = inner.inputs.request(request).await;
            // Expiry auto-confirms; an explicit decline or cancel sends
            // the item to the back of the queue.
            let declined =
                response.canceled || response.value == InputValue::Confirm(false);
            if declined {
                let mut shared = inner.shared.lock().await;
                if let Some(index) = shared
                    .queue
                    .iter()
                    .position(|entry| entry.item.id() == item.id())
                {
                    let mut entry = shared.queue.remove(index);
                    entry.seq = shared.next_seq;
                    shared.next_seq += 1;
                    shared.queue.push(entry);
                    shared
                        .queue
                        .sort_by_key(|entry| std::cmp::Reverse(entry.item.priority()));
                    publish_queue(inner, &shared);
                }
                continue 'queue;
            }
        }

        {
            let mut shared = inner.shared.lock().await;
            shared.current = Some(item.id().to_string());
        }

        'attempt: loop {
            mark_status(inner, item.id(), ItemStatus::Processing).await;
            persist_status(inner, &item, ItemStatus::Processing).await;
            let _ = inner
                .processing_state
                .send(ProcessingState::Processing(item.clone()));

            let result = inner.processor.process(&item).await;

            if inner.abort_requested.load(Ordering::SeqCst) {
                warn!(id = item.id(), "worker aborted mid-item");
                persist_status(inner, &item, ItemStatus::Failed).await;
                mark_status(inner, item.id(), ItemStatus::Failed).await;
                halted = true;
                break 'queue;
            }

            match result {
                ProcessingResult::Success(outcome) => {
                    debug!(id = item.id(), outcome = ?outcome, "item completed");
                    persist_status(inner, &item, ItemStatus::Completed).await;
                    take_out(inner, item.id()).await;
                    break 'attempt;
                }
                ProcessingResult::Error(error) => {
                    warn!(id = item.id(), error = %error, "item failed, awaiting decision");
                    let _ = inner.processing_state.send(ProcessingState::Failed {
                        item: item.clone(),
                        error: error.clone(),
                    });

                    let request = InputRequest::new(
                        InputKind::ErrorDecision {
                            item_id: item.id().to_string(),
                            error,
                        },
                        inner.config.decision_timeout,
                    );
                    let response = inner.inputs.request(request).await;
                    let decision = match response.value {
                        InputValue::Decision(decision)
                            if !response.canceled && !response.timed_out =>
                        {
                            decision
                        }
                        // Canceled, timed out, or unintelligible: skip,
                        // never silently retry.
                        _ => ErrorDecision::Skip,
                    };

                    match decision {
                        ErrorDecision::Retry => {
                            let attempt = {
                                let mut shared = inner.shared.lock().await;
                                match shared
                                    .queue
                                    .iter_mut()
                                    .find(|entry| entry.item.id() == item.id())
                                {
                                    Some(entry) => {
                                        entry.attempts += 1;
                                        entry.attempts
                                    }
                                    None => break 'attempt, // removed under us
                                }
                            };
                            info!(id = item.id(), attempt, "retrying item from scratch");
                            let _ = inner.processing_state.send(ProcessingState::Retrying {
                                item: item.clone(),
                                attempt,
                            });
                            continue 'attempt;
                        }
                        ErrorDecision::Skip => {
                            info!(id = item.id(), "item skipped, marked canceled");
                            persist_status(inner, &item, ItemStatus::Canceled).await;
                            take_out(inner, item.id()).await;
                            break 'attempt;
                        }
                        ErrorDecision::Abort => {
                            info!(id = item.id(), "abort decision, stopping worker");
                            let aborted = inner.processor.abort(Some(&item)).await;
                            debug!(aborted, "processor abort hook finished");
                            persist_status(inner, &item, ItemStatus::Failed).await;
                            mark_status(inner, item.id(), ItemStatus::Failed).await;
                            halted = true;
                            break 'queue;
                        }
                    }
                }
            }
        }

        let mut shared = inner.shared.lock().await;
        shared.current = None;
    }

    {
        let mut shared = inner.shared.lock().await;
        shared.current = None;
    }
    if !halted {
        let _ = inner.processing_state.send(ProcessingState::Idle);
    }
    info!(halted, "queue worker stopped");
    halted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::ProcessorChannels;
    use crate::store::MemoryStore;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicU32, AtomicUsize};
    use std::sync::Mutex as StdMutex;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TestItem {
        id: String,
        priority: i32,
    }

    impl TestItem {
        fn new(id: &str, priority: i32) -> Self {
            Self {
                id: id.into(),
                priority,
            }
        }
    }

    impl WorkItem for TestItem {
        fn id(&self) -> &str {
            &self.id
        }
        fn priority(&self) -> i32 {
            self.priority
        }
    }

    /// Scripted processor: fails the first `fail_times` attempts of each
    /// item, records processing order, tracks concurrency.
    struct TestProcessor {
        channels: ProcessorChannels,
        processed: StdMutex<Vec<String>>,
        fail_times: AtomicU32,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        abort_calls: AtomicU32,
        delay: Duration,
    }

    impl TestProcessor {
        fn new(delay: Duration) -> Self {
            Self {
                channels: ProcessorChannels::new(),
                processed: StdMutex::new(Vec::new()),
                fail_times: AtomicU32::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                abort_calls: AtomicU32::new(0),
                delay,
            }
        }

        fn failing(times: u32) -> Self {
            let processor = Self::new(Duration::from_millis(1));
            processor.fail_times.store(times, Ordering::SeqCst);
            processor
        }

        fn order(&self) -> Vec<String> {
            self.processed.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl Processor<TestItem> for TestProcessor {
        async fn process(&self, item: &TestItem) -> ProcessingResult {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            tokio::time::sleep(self.delay).await;
            self.processed.lock().unwrap().push(item.id.clone());
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let failures_left = self.fail_times.load(Ordering::SeqCst);
            if failures_left > 0 {
                self.fail_times.store(failures_left - 1, Ordering::SeqCst);
                return ProcessingResult::Error(ProcessingErrorEvent::Generic);
            }
            ProcessingResult::Success(crate::state::Outcome::Payment {
                transaction_id: item.id.clone(),
            })
        }

        async fn abort(&self, _item: Option<&TestItem>) -> bool {
            self.abort_calls.fetch_add(1, Ordering::SeqCst);
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

        async fn provide_input(&self, response: crate::input::InputResponse) -> bool {
            self.channels.provide_input(response).await
        }
    }

    fn engine_with(
        processor: Arc<TestProcessor>,
        config: EngineConfig,
    ) -> (QueueEngine<TestItem>, Arc<MemoryStore<TestItem>>) {
        let store = Arc::new(MemoryStore::new());
        let engine = QueueEngine::new(store.clone(), processor, config);
        (engine, store)
    }

    async fn drain(engine: &QueueEngine<TestItem>) {
        let state = engine.queue_state();
        engine.start_processing();
        loop {
            if state.borrow().is_empty() && !engine.inner.worker_running.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Answer every error-decision request with a fixed decision.
    fn auto_decide(engine: &QueueEngine<TestItem>, decision: ErrorDecision) {
        let mut requests = engine.input_requests();
        let engine = engine.clone();
        tokio::spawn(async move {
            while let Ok(request) = requests.recv().await {
                if matches!(request.kind, InputKind::ErrorDecision { .. }) {
                    engine
                        .provide_input(crate::input::InputResponse::answer(
                            request.id,
                            InputValue::Decision(decision),
                        ))
                        .await;
                }
            }
        });
    }

    #[tokio::test]
    async fn priorities_order_processing() {
        let processor = Arc::new(TestProcessor::new(Duration::from_millis(1)));
        let (engine, _) = engine_with(processor.clone(), EngineConfig::default());

        engine.enqueue(TestItem::new("five", 5)).await;
        engine.enqueue(TestItem::new("ten", 10)).await;
        engine.enqueue(TestItem::new("one", 1)).await;
        drain(&engine).await;

        assert_eq!(processor.order(), vec!["ten", "five", "one"]);
    }

    #[tokio::test]
    async fn equal_priority_is_fifo() {
        let processor = Arc::new(TestProcessor::new(Duration::from_millis(1)));
        let (engine, _) = engine_with(processor.clone(), EngineConfig::default());

        for id in ["a", "b", "c", "d"] {
            engine.enqueue(TestItem::new(id, 3)).await;
        }
        drain(&engine).await;

        assert_eq!(processor.order(), vec!["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn single_flight_under_concurrent_enqueues() {
        let processor = Arc::new(TestProcessor::new(Duration::from_millis(5)));
        let (engine, _) = engine_with(processor.clone(), EngineConfig::default());

        engine.enqueue(TestItem::new("seed", 0)).await;
        engine.start_processing();

        let mut joins = Vec::new();
        for i in 0..10 {
            let engine = engine.clone();
            joins.push(tokio::spawn(async move {
                engine.enqueue(TestItem::new(&format!("item-{i}"), i)).await;
                engine.start_processing();
            }));
        }
        for join in joins {
            join.await.unwrap();
        }
        drain(&engine).await;

        assert_eq!(processor.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(processor.order().len(), 11);
    }

    #[tokio::test]
    async fn retry_reruns_the_same_item_from_scratch() {
        let processor = Arc::new(TestProcessor::failing(1));
        let (engine, store) = engine_with(processor.clone(), EngineConfig::default());
        auto_decide(&engine, ErrorDecision::Retry);

        engine.enqueue(TestItem::new("flaky", 0)).await;
        drain(&engine).await;

        // Processed twice: the failed attempt plus the retry.
        assert_eq!(processor.order(), vec!["flaky", "flaky"]);
        assert_eq!(
            store
                .get_all_by_status(ItemStatus::Completed)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn skip_marks_canceled_and_advances() {
        let processor = Arc::new(TestProcessor::failing(1));
        let (engine, store) = engine_with(processor.clone(), EngineConfig::default());
        auto_decide(&engine, ErrorDecision::Skip);

        engine.enqueue(TestItem::new("bad", 5)).await;
        engine.enqueue(TestItem::new("good", 0)).await;
        drain(&engine).await;

        assert_eq!(processor.order(), vec!["bad", "good"]);
        assert_eq!(
            store.get_all_by_status(ItemStatus::Canceled).await.unwrap(),
            vec![TestItem::new("bad", 5)]
        );
        assert_eq!(
            store.get_all_by_status(ItemStatus::Completed).await.unwrap(),
            vec![TestItem::new("good", 0)]
        );
    }

    #[tokio::test]
    async fn abort_runs_the_hook_and_stops_the_worker() {
        let processor = Arc::new(TestProcessor::failing(1));
        let (engine, store) = engine_with(processor.clone(), EngineConfig::default());
        auto_decide(&engine, ErrorDecision::Abort);

        engine.enqueue(TestItem::new("bad", 5)).await;
        engine.enqueue(TestItem::new("never-runs", 0)).await;
        engine.start_processing();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!engine.inner.worker_running.load(Ordering::SeqCst));
        assert_eq!(processor.abort_calls.load(Ordering::SeqCst), 1);
        assert_eq!(processor.order(), vec!["bad"]);
        assert_eq!(
            store.get_all_by_status(ItemStatus::Failed).await.unwrap(),
            vec![TestItem::new("bad", 5)]
        );
        // The untouched item is still pending for a later restart.
        assert_eq!(engine.queue_state().borrow().len(), 2);
    }

    #[tokio::test]
    async fn immediate_persistence_writes_through() {
        let processor = Arc::new(TestProcessor::new(Duration::from_millis(1)));
        let (engine, store) = engine_with(processor, EngineConfig::default());

        engine.enqueue(TestItem::new("a", 0)).await;
        assert_eq!(
            store.get_all_by_status(ItemStatus::Pending).await.unwrap(),
            vec![TestItem::new("a", 0)]
        );

        drain(&engine).await;
        assert_eq!(
            store.get_all_by_status(ItemStatus::Completed).await.unwrap(),
            vec![TestItem::new("a", 0)]
        );
    }

    #[tokio::test]
    async fn on_flush_batches_until_force_persist() {
        let processor = Arc::new(TestProcessor::new(Duration::from_millis(1)));
        let config = EngineConfig {
            persistence: PersistenceStrategy::OnFlush {
                flush_interval: None,
            },
            ..EngineConfig::default()
        };
        let (engine, store) = engine_with(processor, config);

        engine.enqueue(TestItem::new("a", 0)).await;
        assert!(store
            .get_all_by_status(ItemStatus::Pending)
            .await
            .unwrap()
            .is_empty());

        engine.force_persist().await;
        assert_eq!(
            store.get_all_by_status(ItemStatus::Pending).await.unwrap(),
            vec![TestItem::new("a", 0)]
        );
    }

    #[tokio::test]
    async fn manual_confirmation_decline_moves_item_back() {
        let processor = Arc::new(TestProcessor::new(Duration::from_millis(1)));
        let config = EngineConfig {
            confirmation: ConfirmationMode::Manual,
            ..EngineConfig::default()
        };
        let (engine, _) = engine_with(processor.clone(), config);

        // Decline the first confirm request, accept the rest.
        {
            let mut requests = engine.input_requests();
            let engine = engine.clone();
            tokio::spawn(async move {
                let mut first = true;
                while let Ok(request) = requests.recv().await {
                    if matches!(request.kind, InputKind::ConfirmNext { .. }) {
                        let confirm = !std::mem::take(&mut first);
                        engine
                            .provide_input(crate::input::InputResponse::answer(
                                request.id,
                                InputValue::Confirm(confirm),
                            ))
                            .await;
                    }
                }
            });
        }

        engine.enqueue(TestItem::new("first", 0)).await;
        engine.enqueue(TestItem::new("second", 0)).await;
        drain(&engine).await;

        // "first" was declined once, so "second" overtook it.
        assert_eq!(processor.order(), vec!["second", "first"]);
    }

    #[tokio::test]
    async fn restore_reloads_pending_items() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert(&TestItem::new("left-over", 0), ItemStatus::Pending)
            .await
            .unwrap();
        let processor = Arc::new(TestProcessor::new(Duration::from_millis(1)));
        let engine = QueueEngine::new(store.clone(), processor.clone(), EngineConfig::default());

        assert_eq!(engine.restore().await.unwrap(), 1);
        drain(&engine).await;
        assert_eq!(processor.order(), vec!["left-over"]);
    }

    #[tokio::test]
    async fn remove_and_clear_completed() {
        let processor = Arc::new(TestProcessor::new(Duration::from_millis(1)));
        let (engine, store) = engine_with(processor, EngineConfig::default());

        engine.enqueue(TestItem::new("a", 0)).await;
        engine.enqueue(TestItem::new("b", 0)).await;
        engine.remove("b").await;
        assert_eq!(engine.queue_state().borrow().len(), 1);

        drain(&engine).await;
        assert_eq!(
            store
                .get_all_by_status(ItemStatus::Completed)
                .await
                .unwrap()
                .len(),
            1
        );
        engine.clear_completed().await;
        assert!(store
            .get_all_by_status(ItemStatus::Completed)
            .await
            .unwrap()
            .is_empty());
    }
}
