//! Vendor hardware seam and the in-memory reference card.
//!
//! Production terminals ship one of two acquirer SDKs exposing the same
//! four primitives (detect, authenticate, read, write); [`NfcHal`] is the
//! uniform wrapper over whichever one is installed. [`MemoryCard`] is a
//! full software card behind the same trait, used by tests and the CLI.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::sleep;

use crate::conditions;

/// A 6-byte sector key.
pub type Key = [u8; 6];
/// One 16-byte card block.
pub type Block = [u8; 16];
/// 4-byte card UID.
pub type Uid = [u8; 4];

/// Hardware fault channel, distinct from expected "key didn't work"
/// outcomes (those are ordinary `Ok(false)` / `Ok(None)` results).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HalError {
    #[error("contactless radio fault: {0}")]
    Radio(String),
    #[error("card left the field mid-operation")]
    CardRemoved,
    #[error("antenna is not powered")]
    AntennaOff,
    #[error("sector {sector} block {block} is out of range")]
    OutOfRange { sector: u8, block: u8 },
}

/// Which of a sector's two keys an operation authenticates with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySlot {
    A,
    B,
}

impl std::fmt::Display for KeySlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeySlot::A => write!(f, "A"),
            KeySlot::B => write!(f, "B"),
        }
    }
}

/// Uniform wrapper over the vendor NFC SDK primitives.
#[async_trait]
pub trait NfcHal: Send + Sync {
    /// Poll for a card in the field. `Ok(None)` when nothing shows up
    /// inside the window or detection was cancelled.
    async fn detect_card(&self, timeout: Duration) -> Result<Option<Uid>, HalError>;

    /// Cancel an in-flight detection.
    fn cancel_detect(&self);

    /// Authenticate one sector. `Ok(false)` means the key was rejected.
    async fn authenticate(&self, sector: u8, slot: KeySlot, key: &Key) -> Result<bool, HalError>;

    /// Read a block under the current authentication. `Ok(None)` when the
    /// session does not permit the read.
    async fn read_block(&self, sector: u8, block: u8) -> Result<Option<Block>, HalError>;

    /// Write a block under the current authentication. `Ok(false)` when
    /// the session does not permit the write.
    async fn write_block(&self, sector: u8, block: u8, data: &Block) -> Result<bool, HalError>;

    fn antenna_on(&self) -> Result<(), HalError>;

    /// Power the antenna down. Must be idempotent.
    fn antenna_off(&self);

    fn antenna_is_on(&self) -> bool;
}

/// Number of sectors on a 1K tag.
pub const SECTOR_COUNT: u8 = 16;
/// Blocks per sector, trailer included.
pub const BLOCKS_PER_SECTOR: u8 = 4;
/// Trailer block index within a sector.
pub const TRAILER_BLOCK: u8 = 3;

const DETECT_POLL: Duration = Duration::from_millis(10);

struct CardState {
    blocks: [[Block; BLOCKS_PER_SECTOR as usize]; SECTOR_COUNT as usize],
    present: bool,
    antenna_on: bool,
    /// Currently authenticated (sector, slot), if any.
    auth: Option<(u8, KeySlot)>,
}

/// In-memory 1K card.
///
/// Honors the same contract a physical tag does: authentication against the
/// trailer keys, per-block permissions from the decoded access bits, a
/// read-only manufacturer block, and key A reading back as zeros.
pub struct MemoryCard {
    state: Mutex<CardState>,
    cancel: AtomicBool,
}

impl MemoryCard {
    /// A card in transport configuration: every sector keyed with
    /// `FF FF FF FF FF FF` and transport access bits.
    pub fn transport(uid: Uid) -> Self {
        let mut blocks = [[[0u8; 16]; BLOCKS_PER_SECTOR as usize]; SECTOR_COUNT as usize];
        for sector in blocks.iter_mut() {
            sector[TRAILER_BLOCK as usize] = conditions::transport_trailer();
        }
        // Manufacturer block: UID + BCC, rest vendor filler.
        let bcc = uid[0] ^ uid[1] ^ uid[2] ^ uid[3];
        blocks[0][0][0..4].copy_from_slice(&uid);
        blocks[0][0][4] = bcc;
        blocks[0][0][5..].copy_from_slice(&[0x88, 0x04, 0x00, 0xC8, 0x11, 0x00, 0x20, 0x00, 0x00, 0x00, 0x18]);

        Self {
            state: Mutex::new(CardState {
                blocks,
                present: true,
                antenna_on: false,
                auth: None,
            }),
            cancel: AtomicBool::new(false),
        }
    }

    /// Simulate the card being pulled from the field.
    pub fn remove_card(&self) {
        let mut state = self.state.lock().unwrap();
        state.present = false;
        state.auth = None;
    }

    /// Simulate the card being presented again.
    pub fn present_card(&self) {
        self.state.lock().unwrap().present = true;
    }

    /// Overwrite a sector trailer directly, bypassing permissions.
    /// Seeding helper for tests and demos.
    pub fn seed_trailer(&self, sector: u8, trailer: Block) {
        let mut state = self.state.lock().unwrap();
        state.blocks[sector as usize][TRAILER_BLOCK as usize] = trailer;
    }

    /// Raw block contents, bypassing permissions. Inspection helper.
    pub fn raw_block(&self, sector: u8, block: u8) -> Block {
        self.state.lock().unwrap().blocks[sector as usize][block as usize]
    }

    fn check_session(state: &CardState, sector: u8, block: u8) -> Result<KeySlot, HalError> {
        if !state.antenna_on {
            return Err(HalError::AntennaOff);
        }
        if !state.present {
            return Err(HalError::CardRemoved);
        }
        if sector >= SECTOR_COUNT || block >= BLOCKS_PER_SECTOR {
            return Err(HalError::OutOfRange { sector, block });
        }
        match state.auth {
            Some((authed, slot)) if authed == sector => Ok(slot),
            // No session for this sector: vendor firmware rejects the command.
            _ => Err(HalError::Radio("no authenticated session".into())),
        }
    }

    fn access_bits(state: &CardState, sector: u8) -> [u8; 3] {
        let trailer = state.blocks[sector as usize][TRAILER_BLOCK as usize];
        [trailer[6], trailer[7], trailer[8]]
    }
}

#[async_trait]
impl NfcHal for MemoryCard {
    async fn detect_card(&self, timeout: Duration) -> Result<Option<Uid>, HalError> {
        self.cancel.store(false, Ordering::SeqCst);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let state = self.state.lock().unwrap();
                if !state.antenna_on {
                    return Err(HalError::AntennaOff);
                }
                if state.present {
                    let block0 = state.blocks[0][0];
                    return Ok(Some([block0[0], block0[1], block0[2], block0[3]]));
                }
            }
            if self.cancel.load(Ordering::SeqCst) || tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            sleep(DETECT_POLL).await;
        }
    }

    fn cancel_detect(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    async fn authenticate(&self, sector: u8, slot: KeySlot, key: &Key) -> Result<bool, HalError> {
        let mut state = self.state.lock().unwrap();
        if !state.antenna_on {
            return Err(HalError::AntennaOff);
        }
        if !state.present {
            return Err(HalError::CardRemoved);
        }
        if sector >= SECTOR_COUNT {
            return Err(HalError::OutOfRange { sector, block: 0 });
        }

        let trailer = state.blocks[sector as usize][TRAILER_BLOCK as usize];
        let mut stored: Key = [0u8; 6];
        match slot {
            KeySlot::A => stored.copy_from_slice(&trailer[0..6]),
            KeySlot::B => stored.copy_from_slice(&trailer[10..16]),
        }
        if &stored == key {
            state.auth = Some((sector, slot));
            Ok(true)
        } else {
            // A failed authentication tears down any existing session,
            // same as the real tag.
            state.auth = None;
            Ok(false)
        }
    }

    async fn read_block(&self, sector: u8, block: u8) -> Result<Option<Block>, HalError> {
        let state = self.state.lock().unwrap();
        let slot = Self::check_session(&state, sector, block)?;
        let access = conditions::decode(Self::access_bits(&state, sector));

        if block < TRAILER_BLOCK {
            if !access.blocks[block as usize].read.permits(slot) {
                return Ok(None);
            }
            return Ok(Some(state.blocks[sector as usize][block as usize]));
        }

        // Trailer reads: access bits per their own rule, key A always as
        // zeros, key B masked unless readable.
        if !access.trailer.access_bits_read.permits(slot) {
            return Ok(None);
        }
        let mut trailer = state.blocks[sector as usize][TRAILER_BLOCK as usize];
        trailer[0..6].fill(0);
        if !access.trailer.key_b_read.permits(slot) {
            trailer[10..16].fill(0);
        }
        Ok(Some(trailer))
    }

    async fn write_block(&self, sector: u8, block: u8, data: &Block) -> Result<bool, HalError> {
        let mut state = self.state.lock().unwrap();
        let slot = Self::check_session(&state, sector, block)?;
        let access = conditions::decode(Self::access_bits(&state, sector));

        if sector == 0 && block == 0 {
            // Manufacturer block is burned at the factory.
            return Ok(false);
        }

        let permitted = if block < TRAILER_BLOCK {
            access.blocks[block as usize].write.permits(slot)
        } else {
            access.trailer.key_a_write.permits(slot)
                && access.trailer.access_bits_write.permits(slot)
                && access.trailer.key_b_write.permits(slot)
        };
        if !permitted {
            return Ok(false);
        }

        state.blocks[sector as usize][block as usize] = *data;
        Ok(true)
    }

    fn antenna_on(&self) -> Result<(), HalError> {
        self.state.lock().unwrap().antenna_on = true;
        Ok(())
    }

    fn antenna_off(&self) {
        let mut state = self.state.lock().unwrap();
        state.antenna_on = false;
        state.auth = None;
    }

    fn antenna_is_on(&self) -> bool {
        self.state.lock().unwrap().antenna_on
    }
}
