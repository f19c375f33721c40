//! Tapcart Queue - Persistent interactive work queue
//!
//! A single-flight queue engine that drives long-running, possibly
//! human-in-the-loop operations (payments, contactless-card reads and
//! writes) to completion with retry/abort semantics. Work is described by
//! items, executed by pluggable processors, and every failure surfaces a
//! retry / skip / abort decision instead of being silently dropped.

pub mod engine;
pub mod error;
pub mod input;
pub mod item;
pub mod processor;
pub mod processors;
pub mod state;
pub mod store;

pub use engine::{ConfirmationMode, EngineConfig, PersistenceStrategy, QueueEngine};
pub use error::ProcessingErrorEvent;
pub use input::{ErrorDecision, InputChannel, InputKind, InputRequest, InputResponse, InputValue};
pub use item::{ItemStatus, WorkItem};
pub use processor::{Processor, ProcessorChannels, ProcessorEvent};
pub use state::{Outcome, ProcessingResult, ProcessingState};
pub use store::{JsonFileStore, MemoryStore, QueueStore, StoreError};
