//! Concrete processors: payment variants and contactless-card variants,
//! plus the composite processors that dispatch on an item's operation
//! kind.

pub mod nfc;
pub mod payment;

use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

use crate::input::InputRequest;
use crate::processor::ProcessorEvent;

/// A forwarding task that can be stopped without losing anything already
/// buffered: shutdown drains the source before exiting.
pub(crate) struct Relay {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl Relay {
    pub(crate) async fn shutdown(self) {
        let _ = self.stop.send(());
        let _ = self.handle.await;
    }
}

/// Relay a delegate's events onto a composite's stream, suppressing the
/// duplicate `Started` the composite already emitted itself.
pub(crate) fn relay_events(
    mut from: broadcast::Receiver<ProcessorEvent>,
    to: broadcast::Sender<ProcessorEvent>,
) -> Relay {
    let (stop, mut stopped) = oneshot::channel();
    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                result = from.recv() => match result {
                    Ok(ProcessorEvent::Started) => {}
                    Ok(event) => {
                        let _ = to.send(event);
                    }
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                },
                _ = &mut stopped => {
                    // Anything the delegate emitted before returning is
                    // already buffered; flush it before stopping.
                    loop {
                        match from.try_recv() {
                            Ok(ProcessorEvent::Started) => {}
                            Ok(event) => {
                                let _ = to.send(event);
                            }
                            Err(TryRecvError::Lagged(_)) => {}
                            Err(_) => break,
                        }
                    }
                    break;
                }
            }
        }
    });
    Relay { stop, handle }
}

/// Relay a delegate's input requests onto a composite's stream so UI
/// subscribers of the composite see them.
pub(crate) fn relay_input_requests(
    mut from: broadcast::Receiver<InputRequest>,
    to: broadcast::Sender<InputRequest>,
) -> Relay {
    let (stop, mut stopped) = oneshot::channel();
    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                result = from.recv() => match result {
                    Ok(request) => {
                        let _ = to.send(request);
                    }
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                },
                _ = &mut stopped => {
                    loop {
                        match from.try_recv() {
                            Ok(request) => {
                                let _ = to.send(request);
                            }
                            Err(TryRecvError::Lagged(_)) => {}
                            Err(_) => break,
                        }
                    }
                    break;
                }
            }
        }
    });
    Relay { stop, handle }
}
