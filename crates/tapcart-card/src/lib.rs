//! Tapcart Card - Contactless card access for offline cart storage
//!
//! MIFARE-Classic-style sector authentication with key fallback, access-bit
//! interpretation, brute-force key recovery, and the sequential storage
//! protocol that persists a shopping cart across card sectors.

pub mod access;
pub mod conditions;
pub mod hal;
pub mod keys;
pub mod recovery;
pub mod storage;

// Re-export the working surface
pub use access::{KeyMap, SectorKeys, TagAccess};
pub use conditions::{decode, AccessConditions, BlockAccess, KeyRule, TrailerAccess};
pub use hal::{Block, HalError, Key, KeySlot, MemoryCard, NfcHal, Uid};
pub use recovery::{KeyRecovery, RecoveryMode, RecoveryOptions, RecoveryReport};
pub use storage::{CardStorage, StorageError};
