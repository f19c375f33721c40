//! Cart line-item records as stored on the card.

use serde::{Deserialize, Serialize};

/// A single cart line item in the price-aware on-card format.
///
/// The price is locked per entry, so the same product sold at two prices
/// occupies two records. Serialized as 7 bytes with no padding between
/// consecutive records:
///
/// `[id_lo, id_hi, count, price_b0, price_b1, price_b2, price_b3]`
///
/// All multi-byte fields are little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartItem {
    /// Product identifier (0-65535).
    pub product_id: u16,
    /// Quantity (0-255).
    pub count: u8,
    /// Price per unit in cents.
    pub price: u32,
}

impl CartItem {
    /// Serialized record size in bytes.
    pub const SIZE: usize = 7;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..2].copy_from_slice(&self.product_id.to_le_bytes());
        buf[2] = self.count;
        buf[3..7].copy_from_slice(&self.price.to_le_bytes());
        buf
    }

    /// Decode one record starting at `offset`.
    ///
    /// Returns `None` when fewer than [`CartItem::SIZE`] bytes remain.
    pub fn from_bytes(data: &[u8], offset: usize) -> Option<Self> {
        let rec = data.get(offset..offset.checked_add(Self::SIZE)?)?;
        Some(Self {
            product_id: u16::from_le_bytes([rec[0], rec[1]]),
            count: rec[2],
            price: u32::from_le_bytes([rec[3], rec[4], rec[5], rec[6]]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let item = CartItem {
            product_id: 0x1234,
            count: 7,
            price: 125_000,
        };
        let bytes = item.to_bytes();
        assert_eq!(bytes[0], 0x34);
        assert_eq!(bytes[1], 0x12);
        assert_eq!(bytes[2], 7);
        assert_eq!(CartItem::from_bytes(&bytes, 0), Some(item));
    }

    #[test]
    fn decode_at_offset() {
        let a = CartItem {
            product_id: 1,
            count: 1,
            price: 100,
        };
        let b = CartItem {
            product_id: 2,
            count: 2,
            price: 200,
        };
        let mut buf = Vec::new();
        buf.extend_from_slice(&a.to_bytes());
        buf.extend_from_slice(&b.to_bytes());

        assert_eq!(CartItem::from_bytes(&buf, 0), Some(a));
        assert_eq!(CartItem::from_bytes(&buf, CartItem::SIZE), Some(b));
    }

    #[test]
    fn short_buffer_is_rejected() {
        let item = CartItem {
            product_id: 9,
            count: 1,
            price: 50,
        };
        let bytes = item.to_bytes();
        assert_eq!(CartItem::from_bytes(&bytes[..6], 0), None);
        assert_eq!(CartItem::from_bytes(&bytes, 1), None);
    }
}
