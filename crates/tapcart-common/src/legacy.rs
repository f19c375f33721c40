//! Legacy price-naive cart format.
//!
//! Older terminals wrote 3-byte records keyed by product id alone, with no
//! per-price tiers. The current price-aware policy in [`crate::cart`] is
//! authoritative; this module only keeps cards written by those terminals
//! readable and mergeable.

use crate::cart::{CartError, CartOp};

/// A legacy cart record: `[id_lo, id_hi, count]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record {
    pub product_id: u16,
    pub count: u8,
}

impl Record {
    pub const SIZE: usize = 3;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let id = self.product_id.to_le_bytes();
        [id[0], id[1], self.count]
    }

    pub fn from_bytes(data: &[u8], offset: usize) -> Option<Self> {
        let rec = data.get(offset..offset.checked_add(Self::SIZE)?)?;
        Some(Self {
            product_id: u16::from_le_bytes([rec[0], rec[1]]),
            count: rec[2],
        })
    }
}

/// Decode consecutive legacy records from `data`, up to `total_bytes`.
pub fn decode_records(data: &[u8], total_bytes: usize) -> Vec<Record> {
    let mut records = Vec::new();
    let mut offset = 0;
    while offset + Record::SIZE <= total_bytes.min(data.len()) {
        if let Some(record) = Record::from_bytes(data, offset) {
            records.push(record);
        }
        offset += Record::SIZE;
    }
    records
}

/// Apply one mutation under the legacy policy: a single entry per product,
/// no price tiers, no LIFO.
pub fn apply(
    records: &[Record],
    product_id: u16,
    quantity: u8,
    op: CartOp,
) -> Result<Vec<Record>, CartError> {
    let mut records = records.to_vec();
    let matching = records.iter().position(|r| r.product_id == product_id);

    match op {
        CartOp::Set => {
            if quantity == 0 {
                if let Some(index) = matching {
                    records.remove(index);
                }
            } else if let Some(index) = matching {
                records[index].count = quantity;
            } else {
                records.push(Record {
                    product_id,
                    count: quantity,
                });
            }
        }
        CartOp::Increment => {
            if let Some(index) = matching {
                let sum = records[index].count as u16 + quantity as u16;
                if sum > u8::MAX as u16 {
                    return Err(CartError::QuantityOverflow { product_id });
                }
                records[index].count = sum as u8;
            } else {
                records.push(Record {
                    product_id,
                    count: quantity,
                });
            }
        }
        CartOp::Decrement => {
            let Some(index) = matching else {
                return Err(CartError::ItemNotFound { product_id });
            };
            let left = records[index].count.saturating_sub(quantity);
            if left == 0 {
                records.remove(index);
            } else {
                records[index].count = left;
            }
        }
        CartOp::Remove => {
            let Some(index) = matching else {
                return Err(CartError::ItemNotFound { product_id });
            };
            records.remove(index);
        }
        CartOp::Clear => records.clear(),
    }

    Ok(records)
}
