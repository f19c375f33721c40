//! Candidate key dictionary for key recovery.
//!
//! Grouped by how likely a group is to open a card found in the wild; the
//! recovery search walks groups in the order they appear here.

use crate::hal::Key;

/// Keys that open the overwhelming majority of unprovisioned or
/// factory-defaulted cards. Tried before everything else.
pub const STANDARD_SET: &[&str] = &[
    "FFFFFFFFFFFF",
    "A0A1A2A3A4A5",
    "D3F7D3F7D3F7",
    "000000000000",
    "B0B1B2B3B4B5",
    "4D3A99C351DD",
    "1A982C7E459A",
    "AABBCCDDEEFF",
    "714C5C886E97",
];

/// MIFARE application directory defaults.
const DIRECTORY: &[&str] = &["A0B0C0D0E0F0", "A1B1C1D1E1F1", "587EE5F9350F"];

/// Defaults observed on transit and access-control deployments.
const TRANSIT: &[&str] = &[
    "FC00018778F7",
    "0297927C0F77",
    "EE0042F88840",
    "26940B21FF5D",
    "A64598A77478",
];

/// Assorted vendor-programmed defaults.
const VENDOR: &[&str] = &[
    "484558414354",
    "A22AE129C013",
    "49FAE4E3849F",
    "38FCF33072E0",
    "8FD0A4F256E9",
];

/// All candidate groups, in search priority order. The first group is the
/// "most likely" set used on its own by the faster recovery mode.
pub const KEY_GROUPS: &[(&str, &[&str])] = &[
    ("standard set", STANDARD_SET),
    ("directory", DIRECTORY),
    ("transit", TRANSIT),
    ("vendor", VENDOR),
];

/// Parse a 12-hex-digit key. `None` for anything else.
pub fn parse_key(s: &str) -> Option<Key> {
    let bytes = hex::decode(s).ok()?;
    bytes.try_into().ok()
}
