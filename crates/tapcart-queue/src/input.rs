//! Interactive input channel.
//!
//! A processor (or the engine itself) publishes an [`InputRequest`] and
//! suspends on a per-request oneshot until the UI answers, the request is
//! canceled, or the timeout fires. Timeouts resolve to a synthetic
//! timed-out response rather than an error, so every caller decides its
//! own fallback. A response is matched by request id and consumed at most
//! once.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::error::ProcessingErrorEvent;

const REQUEST_STREAM_CAPACITY: usize = 16;

/// What the caller is being asked.
#[derive(Debug, Clone, PartialEq)]
pub enum InputKind {
    /// Confirm (or skip) the next queued item before it is dequeued.
    ConfirmNext {
        item_id: String,
        position: usize,
        total: usize,
    },
    /// A processor failed; pick one of the three decisions.
    ErrorDecision {
        item_id: String,
        error: ProcessingErrorEvent,
    },
    /// Supply the sector keys for the presented card.
    SectorKeys,
    /// Confirm that a payment code was scanned and settled.
    ConfirmScan { code: String },
}

#[derive(Debug, Clone)]
pub struct InputRequest {
    pub id: String,
    pub kind: InputKind,
    pub timeout: Option<Duration>,
}

impl InputRequest {
    pub fn new(kind: InputKind, timeout: Option<Duration>) -> Self {
        Self {
            id: Ulid::new().to_string(),
            kind,
            timeout,
        }
    }
}

/// The three decisions offered when an item fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDecision {
    /// Re-run `process` from scratch on the same item.
    Retry,
    /// Mark the item canceled and advance.
    Skip,
    /// Run the processor's abort hook and stop the worker.
    Abort,
}

/// Typed response payloads; a closed union instead of an any-typed bag.
#[derive(Debug, Clone, PartialEq)]
pub enum InputValue {
    Confirm(bool),
    Decision(ErrorDecision),
    Keys {
        key_a: Option<String>,
        key_b: Option<String>,
    },
    None,
}

#[derive(Debug, Clone)]
pub struct InputResponse {
    pub request_id: String,
    pub value: InputValue,
    pub canceled: bool,
    pub timed_out: bool,
}

impl InputResponse {
    pub fn answer(request_id: impl Into<String>, value: InputValue) -> Self {
        Self {
            request_id: request_id.into(),
            value,
            canceled: false,
            timed_out: false,
        }
    }

    pub fn canceled(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            value: InputValue::None,
            canceled: true,
            timed_out: false,
        }
    }

    pub fn timed_out(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            value: InputValue::None,
            canceled: false,
            timed_out: true,
        }
    }
}

/// Request/response correlation: a broadcast stream of requests out, one
/// oneshot per request back in.
pub struct InputChannel {
    requests: broadcast::Sender<InputRequest>,
    pending: Mutex<HashMap<String, oneshot::Sender<InputResponse>>>,
}

impl Default for InputChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl InputChannel {
    pub fn new() -> Self {
        let (requests, _) = broadcast::channel(REQUEST_STREAM_CAPACITY);
        Self {
            requests,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InputRequest> {
        self.requests.subscribe()
    }

    pub(crate) fn requests_sender(&self) -> broadcast::Sender<InputRequest> {
        self.requests.clone()
    }

    /// Publish a request and suspend until it is resolved.
    pub async fn request(&self, request: InputRequest) -> InputResponse {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().unwrap();
            pending.insert(request.id.clone(), tx);
        }

        let id = request.id.clone();
        let timeout = request.timeout;
        debug!(request_id = %id, kind = ?request.kind, "input requested");
        // No subscriber yet just means nobody is listening; the request
        // still times out or gets canceled normally.
        let _ = self.requests.send(request);

        let response = match timeout {
            Some(duration) => match tokio::time::timeout(duration, rx).await {
                Ok(Ok(response)) => response,
                Ok(Err(_)) => InputResponse::canceled(id.clone()),
                Err(_) => {
                    self.pending.lock().unwrap().remove(&id);
                    InputResponse::timed_out(id.clone())
                }
            },
            None => rx.await.unwrap_or_else(|_| InputResponse::canceled(id.clone())),
        };

        debug!(
            request_id = %id,
            canceled = response.canceled,
            timed_out = response.timed_out,
            "input resolved"
        );
        response
    }

    /// Deliver a response to the awaiting request. Returns false when no
    /// request with that id is outstanding (already resolved, timed out,
    /// or never issued).
    pub async fn provide(&self, response: InputResponse) -> bool {
        let sender = {
            let mut pending = self.pending.lock().unwrap();
            pending.remove(&response.request_id)
        };
        match sender {
            Some(sender) => sender.send(response).is_ok(),
            None => {
                warn!(request_id = %response.request_id, "no outstanding input request");
                false
            }
        }
    }

    /// Resolve every outstanding request as canceled.
    pub fn cancel_all(&self) {
        let drained: Vec<_> = {
            let mut pending = self.pending.lock().unwrap();
            pending.drain().collect()
        };
        for (id, sender) in drained {
            let _ = sender.send(InputResponse::canceled(id));
        }
    }
}
