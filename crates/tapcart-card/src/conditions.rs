//! MIFARE Classic access-condition decoding.
//!
//! A sector trailer carries three access-control bytes (bytes 6-8) encoding
//! one (C1, C2, C3) bit triple per block. The triples map through two fixed
//! tables - one for data blocks, one for the trailer - to the key required
//! for each operation. Undefined triples decode to [`KeyRule::Never`] for
//! every operation; the decoder fails closed rather than guessing.

use crate::hal::{Block, Key, KeySlot};

/// Which key a given operation requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRule {
    /// Only key A.
    A,
    /// Only key B.
    B,
    /// Either key.
    Both,
    /// The operation is never allowed.
    Never,
}

impl KeyRule {
    /// Whether a session authenticated with `slot` satisfies this rule.
    pub fn permits(self, slot: KeySlot) -> bool {
        match self {
            KeyRule::A => slot == KeySlot::A,
            KeyRule::B => slot == KeySlot::B,
            KeyRule::Both => true,
            KeyRule::Never => false,
        }
    }
}

/// Permissions for one data block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockAccess {
    pub read: KeyRule,
    pub write: KeyRule,
    pub increment: KeyRule,
    pub decrement: KeyRule,
}

/// Permissions for the sector trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrailerAccess {
    pub key_a_read: KeyRule,
    pub key_a_write: KeyRule,
    pub access_bits_read: KeyRule,
    pub access_bits_write: KeyRule,
    pub key_b_read: KeyRule,
    pub key_b_write: KeyRule,
}

/// Decoded access conditions for a whole sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessConditions {
    /// Data blocks 0-2.
    pub blocks: [BlockAccess; 3],
    pub trailer: TrailerAccess,
}

/// Decode a sector's three access-control bytes.
pub fn decode(access_bytes: [u8; 3]) -> AccessConditions {
    let c1 = extract_nibble(access_bytes[1] >> 4);
    let c2 = extract_nibble(access_bytes[2]);
    let c3 = extract_nibble(access_bytes[2] >> 4);

    AccessConditions {
        blocks: [
            data_block_access(c1[0], c2[0], c3[0]),
            data_block_access(c1[1], c2[1], c3[1]),
            data_block_access(c1[2], c2[2], c3[2]),
        ],
        trailer: trailer_access(c1[3], c2[3], c3[3]),
    }
}

/// Low nibble of `byte` as per-block bits (bit i belongs to block i).
fn extract_nibble(byte: u8) -> [bool; 4] {
    [
        byte & 0x01 != 0,
        byte & 0x02 != 0,
        byte & 0x04 != 0,
        byte & 0x08 != 0,
    ]
}

fn data_block_access(c1: bool, c2: bool, c3: bool) -> BlockAccess {
    use KeyRule::*;
    let (read, write, increment, decrement) = match (c1, c2, c3) {
        (false, false, false) => (Both, Both, Both, Both),
        (false, true, false) => (Both, Never, Never, Never),
        (true, false, false) => (Both, B, Never, Never),
        (true, true, false) => (Both, B, B, Both),
        (false, false, true) => (Both, Never, Never, Both),
        (false, true, true) => (B, Never, Never, Never),
        (true, false, true) => (B, Never, Never, Never),
        // (1,1,1) and anything unparseable: fail closed.
        _ => (Never, Never, Never, Never),
    };
    BlockAccess {
        read,
        write,
        increment,
        decrement,
    }
}

fn trailer_access(c1: bool, c2: bool, c3: bool) -> TrailerAccess {
    use KeyRule::*;
    let (key_a_read, key_a_write, access_bits_read, access_bits_write, key_b_read, key_b_write) =
        match (c1, c2, c3) {
            (false, false, false) => (Never, A, A, Never, A, A),
            (false, true, false) => (Never, Never, A, A, A, Never),
            (true, false, false) => (Never, B, A, B, Never, B),
            (true, true, false) => (Never, Never, A, A, Never, Never),
            (false, false, true) => (Never, A, A, A, A, A),
            (false, true, true) => (Never, B, A, B, Never, B),
            (true, false, true) => (Never, Never, A, B, Never, Never),
            // (1,1,1): fail closed.
            _ => (Never, Never, Never, Never, Never, Never),
        };
    TrailerAccess {
        key_a_read,
        key_a_write,
        access_bits_read,
        access_bits_write,
        key_b_read,
        key_b_write,
    }
}

/// Transport-configuration trailer: both keys `FF..FF`, access bytes
/// `FF 07 80`, general-purpose byte `69`. Every data block is open to
/// either key and key A retains full control of the trailer.
pub fn transport_trailer() -> Block {
    let mut trailer = [0u8; 16];
    trailer[0..6].fill(0xFF);
    trailer[6] = 0xFF;
    trailer[7] = 0x07;
    trailer[8] = 0x80;
    trailer[9] = 0x69;
    trailer[10..16].fill(0xFF);
    trailer
}

/// Production trailer: access bytes `78 77 88 6B`. Data blocks read with
/// either key, write only with key B; key A becomes read-only over the
/// trailer while key B keeps full control.
pub fn production_trailer(key_a: &Key, key_b: &Key) -> Block {
    let mut trailer = [0u8; 16];
    trailer[0..6].copy_from_slice(key_a);
    trailer[6] = 0x78;
    trailer[7] = 0x77;
    trailer[8] = 0x88;
    trailer[9] = 0x6B;
    trailer[10..16].copy_from_slice(key_b);
    trailer
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use KeyRule::*;

    #[rstest]
    #[case((false, false, false), Both, Both, Both, Both)]
    #[case((false, true, false), Both, Never, Never, Never)]
    #[case((true, false, false), Both, B, Never, Never)]
    #[case((true, true, false), Both, B, B, Both)]
    #[case((false, false, true), Both, Never, Never, Both)]
    #[case((false, true, true), B, Never, Never, Never)]
    #[case((true, false, true), B, Never, Never, Never)]
    #[case((true, true, true), Never, Never, Never, Never)]
    fn data_block_table(
        #[case] bits: (bool, bool, bool),
        #[case] read: KeyRule,
        #[case] write: KeyRule,
        #[case] increment: KeyRule,
        #[case] decrement: KeyRule,
    ) {
        let access = data_block_access(bits.0, bits.1, bits.2);
        assert_eq!(access.read, read);
        assert_eq!(access.write, write);
        assert_eq!(access.increment, increment);
        assert_eq!(access.decrement, decrement);
    }

    #[rstest]
    #[case((false, false, false), (Never, A, A, Never, A, A))]
    #[case((false, true, false), (Never, Never, A, A, A, Never))]
    #[case((true, false, false), (Never, B, A, B, Never, B))]
    #[case((true, true, false), (Never, Never, A, A, Never, Never))]
    #[case((false, false, true), (Never, A, A, A, A, A))]
    #[case((false, true, true), (Never, B, A, B, Never, B))]
    #[case((true, false, true), (Never, Never, A, B, Never, Never))]
    #[case((true, true, true), (Never, Never, Never, Never, Never, Never))]
    fn trailer_table(
        #[case] bits: (bool, bool, bool),
        #[case] expected: (KeyRule, KeyRule, KeyRule, KeyRule, KeyRule, KeyRule),
    ) {
        let access = trailer_access(bits.0, bits.1, bits.2);
        assert_eq!(access.key_a_read, expected.0);
        assert_eq!(access.key_a_write, expected.1);
        assert_eq!(access.access_bits_read, expected.2);
        assert_eq!(access.access_bits_write, expected.3);
        assert_eq!(access.key_b_read, expected.4);
        assert_eq!(access.key_b_write, expected.5);
    }

    #[test]
    fn transport_bytes_open_every_data_block() {
        let trailer = transport_trailer();
        let access = decode([trailer[6], trailer[7], trailer[8]]);
        for block in &access.blocks {
            assert_eq!(block.read, Both);
            assert_eq!(block.write, Both);
            assert_eq!(block.increment, Both);
            assert_eq!(block.decrement, Both);
        }
        // Trailer triple is (0,0,1): key A may rewrite both keys.
        assert_eq!(access.trailer.key_a_write, A);
        assert_eq!(access.trailer.key_b_write, A);
    }

    #[test]
    fn production_bytes_lock_writes_to_key_b() {
        let trailer = production_trailer(&[0x11; 6], &[0x22; 6]);
        let access = decode([trailer[6], trailer[7], trailer[8]]);
        // Data blocks decode as (1,0,0): read with either key, write with B.
        for block in &access.blocks {
            assert_eq!(block.read, Both);
            assert_eq!(block.write, B);
        }
        // Trailer decodes as (0,1,1): key B full control, key A read-only.
        assert_eq!(access.trailer.key_a_write, B);
        assert_eq!(access.trailer.access_bits_write, B);
        assert_eq!(access.trailer.key_b_write, B);
    }

    #[test]
    fn permits_matches_slots() {
        assert!(Both.permits(KeySlot::A) && Both.permits(KeySlot::B));
        assert!(A.permits(KeySlot::A) && !A.permits(KeySlot::B));
        assert!(!B.permits(KeySlot::A) && B.permits(KeySlot::B));
        assert!(!Never.permits(KeySlot::A) && !Never.permits(KeySlot::B));
    }
}
