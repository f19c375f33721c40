//! Card Access Layer.
//!
//! Every block operation tries key A first and falls back to key B; a key
//! that does not work is an expected outcome (`Ok(None)` / `Ok(false)`),
//! never a fault. The antenna is powered only for the duration of a single
//! attempt and is switched off on every exit path, so a failed operation
//! can never leave the radio stuck on.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::hal::{Block, HalError, Key, KeySlot, NfcHal, Uid, SECTOR_COUNT};
use crate::keys;

/// The keys known for one sector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SectorKeys {
    pub key_a: Option<Key>,
    pub key_b: Option<Key>,
}

impl SectorKeys {
    pub fn complete(key_a: Key, key_b: Key) -> Self {
        Self {
            key_a: Some(key_a),
            key_b: Some(key_b),
        }
    }

    /// Parse hex-encoded keys; `None` if either present string is not a
    /// valid 6-byte key.
    pub fn from_hex(key_a: Option<&str>, key_b: Option<&str>) -> Option<Self> {
        let parse = |s: Option<&str>| match s {
            Some(s) => keys::parse_key(s).map(Some),
            None => Some(None),
        };
        Some(Self {
            key_a: parse(key_a)?,
            key_b: parse(key_b)?,
        })
    }

    pub fn slot(&self, slot: KeySlot) -> Option<&Key> {
        match slot {
            KeySlot::A => self.key_a.as_ref(),
            KeySlot::B => self.key_b.as_ref(),
        }
    }

    pub fn set_slot(&mut self, slot: KeySlot, key: Key) {
        match slot {
            KeySlot::A => self.key_a = Some(key),
            KeySlot::B => self.key_b = Some(key),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.key_a.is_some() && self.key_b.is_some()
    }

    pub fn has_any(&self) -> bool {
        self.key_a.is_some() || self.key_b.is_some()
    }
}

/// Per-sector key map used by multi-sector operations.
#[derive(Debug, Clone, Default)]
pub struct KeyMap {
    sectors: Vec<SectorKeys>,
}

impl KeyMap {
    /// The same key pair for every sector, the common production layout.
    pub fn uniform(keys: SectorKeys) -> Self {
        Self {
            sectors: vec![keys; SECTOR_COUNT as usize],
        }
    }

    pub fn from_sectors(sectors: Vec<SectorKeys>) -> Self {
        Self { sectors }
    }

    pub fn for_sector(&self, sector: u8) -> SectorKeys {
        self.sectors
            .get(sector as usize)
            .copied()
            .unwrap_or_default()
    }
}

/// High-level tag operations over a vendor HAL.
pub struct TagAccess {
    hal: Arc<dyn NfcHal>,
}

impl TagAccess {
    pub fn new(hal: Arc<dyn NfcHal>) -> Self {
        Self { hal }
    }

    /// Trailer block index for a sector (3 on 1K layouts, 15 on the large
    /// 4K sectors).
    pub fn trailer_block(sector: u8) -> u8 {
        if sector < 32 {
            3
        } else {
            15
        }
    }

    /// Wait for a card to enter the field.
    pub async fn detect_tag(&self, timeout: Duration) -> Result<Option<Uid>, HalError> {
        self.hal.antenna_on()?;
        let result = self.hal.detect_card(timeout).await;
        self.hal.antenna_off();
        match &result {
            Ok(Some(uid)) => debug!(uid = %hex::encode_upper(uid), "card detected"),
            Ok(None) => debug!("no card in detection window"),
            Err(err) => warn!(error = %err, "card detection failed"),
        }
        result
    }

    /// Authenticate one sector with a single key. `Ok(false)` means the
    /// key was rejected.
    pub async fn authenticate(
        &self,
        sector: u8,
        slot: KeySlot,
        key: &Key,
    ) -> Result<bool, HalError> {
        self.hal.antenna_on()?;
        let result = self.hal.authenticate(sector, slot, key).await;
        self.hal.antenna_off();
        result
    }

    /// Read a block, trying key A then key B. `Ok(None)` when no available
    /// key grants the read.
    pub async fn read_block(
        &self,
        sector: u8,
        block: u8,
        keys: &SectorKeys,
    ) -> Result<Option<Block>, HalError> {
        self.hal.antenna_on()?;
        let result = self.read_with_fallback(sector, block, keys).await;
        self.hal.antenna_off();
        result
    }

    async fn read_with_fallback(
        &self,
        sector: u8,
        block: u8,
        keys: &SectorKeys,
    ) -> Result<Option<Block>, HalError> {
        for slot in [KeySlot::A, KeySlot::B] {
            let Some(key) = keys.slot(slot) else {
                continue;
            };
            if !self.hal.authenticate(sector, slot, key).await? {
                debug!(sector, block, %slot, "authentication rejected");
                continue;
            }
            if let Some(data) = self.hal.read_block(sector, block).await? {
                debug!(sector, block, %slot, "read ok");
                return Ok(Some(data));
            }
            debug!(sector, block, %slot, "read not permitted");
        }
        warn!(sector, block, "read failed with every available key");
        Ok(None)
    }

    /// Write a block, trying key A then key B. `Ok(false)` when no
    /// available key grants the write.
    pub async fn write_block(
        &self,
        sector: u8,
        block: u8,
        data: &Block,
        keys: &SectorKeys,
    ) -> Result<bool, HalError> {
        self.hal.antenna_on()?;
        let result = self.write_with_fallback(sector, block, data, keys).await;
        self.hal.antenna_off();
        result
    }

    async fn write_with_fallback(
        &self,
        sector: u8,
        block: u8,
        data: &Block,
        keys: &SectorKeys,
    ) -> Result<bool, HalError> {
        for slot in [KeySlot::A, KeySlot::B] {
            let Some(key) = keys.slot(slot) else {
                continue;
            };
            if !self.hal.authenticate(sector, slot, key).await? {
                debug!(sector, block, %slot, "authentication rejected");
                continue;
            }
            if self.hal.write_block(sector, block, data).await? {
                debug!(sector, block, %slot, "write ok");
                return Ok(true);
            }
            debug!(sector, block, %slot, "write not permitted");
        }
        warn!(sector, block, "write failed with every available key");
        Ok(false)
    }

    pub async fn read_sector_trailer(
        &self,
        sector: u8,
        keys: &SectorKeys,
    ) -> Result<Option<Block>, HalError> {
        self.read_block(sector, Self::trailer_block(sector), keys).await
    }

    pub async fn write_sector_trailer(
        &self,
        sector: u8,
        trailer: &Block,
        keys: &SectorKeys,
    ) -> Result<bool, HalError> {
        self.write_block(sector, Self::trailer_block(sector), trailer, keys)
            .await
    }

    /// Zero a data block. Refuses to target a sector trailer.
    pub async fn clear_data_block(
        &self,
        sector: u8,
        block: u8,
        keys: &SectorKeys,
    ) -> Result<bool, HalError> {
        if block >= Self::trailer_block(sector) {
            warn!(sector, block, "refusing to clear a sector trailer");
            return Ok(false);
        }
        self.write_block(sector, block, &[0u8; 16], keys).await
    }

    /// Cancel any in-flight detection and power the radio down.
    /// Safe to call repeatedly and while idle.
    pub fn abort(&self) {
        self.hal.cancel_detect();
        self.hal.antenna_off();
    }
}
