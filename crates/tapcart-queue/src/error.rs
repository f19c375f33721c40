//! Processing error taxonomy.
//!
//! Every fault a processor can hit is folded into one of these events at
//! the processor boundary; raw hardware or storage errors never cross
//! into the engine.

use thiserror::Error;

use tapcart_card::{HalError, StorageError};
use tapcart_common::CartError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessingErrorEvent {
    // Hardware / timeout faults
    #[error("no card was found")]
    TagNotFound,
    #[error("timed out waiting for a card")]
    TagReachTimeout,
    #[error("card block read failed")]
    ReadError,
    #[error("card block write failed")]
    WriteError,
    #[error("contactless radio fault: {0}")]
    RadioFault(String),

    // Protocol faults
    #[error("sector keys were not supplied")]
    MissingKeys,
    #[error("supplied sector keys are invalid")]
    InvalidKeys,
    #[error("card header is missing or invalid")]
    InvalidHeader,
    #[error("not enough space left on the card")]
    InsufficientSpace,
    #[error("cart item not found")]
    CartItemNotFound,
    #[error("item quantity would overflow")]
    QuantityOverflow,
    #[error("stored balance would overflow")]
    BalanceOverflow,
    #[error("insufficient stored balance")]
    InsufficientBalance,

    // User-driven outcomes
    #[error("canceled by the operator")]
    Canceled,
    #[error("invalid input supplied")]
    InvalidInput,
    #[error("invalid transaction amount")]
    InvalidAmount,

    // Everything else
    #[error("unclassified processing failure")]
    Generic,
}

impl From<HalError> for ProcessingErrorEvent {
    fn from(err: HalError) -> Self {
        match err {
            HalError::CardRemoved => ProcessingErrorEvent::TagNotFound,
            HalError::Radio(message) => ProcessingErrorEvent::RadioFault(message),
            HalError::AntennaOff => ProcessingErrorEvent::RadioFault("antenna off".into()),
            HalError::OutOfRange { .. } => ProcessingErrorEvent::Generic,
        }
    }
}

impl From<StorageError> for ProcessingErrorEvent {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Hal(hal) => hal.into(),
            StorageError::ReadFailed { .. } => ProcessingErrorEvent::ReadError,
            StorageError::WriteFailed { .. } => ProcessingErrorEvent::WriteError,
            StorageError::InsufficientSpace { .. } => ProcessingErrorEvent::InsufficientSpace,
            StorageError::InvalidHeader => ProcessingErrorEvent::InvalidHeader,
        }
    }
}

impl From<CartError> for ProcessingErrorEvent {
    fn from(err: CartError) -> Self {
        match err {
            CartError::QuantityOverflow { .. } => ProcessingErrorEvent::QuantityOverflow,
            CartError::ItemNotFound { .. } => ProcessingErrorEvent::CartItemNotFound,
        }
    }
}
