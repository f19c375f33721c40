//! Price-aware cart mutation policy.
//!
//! Entries are keyed by `(product_id, price)`, so the same product sold at
//! two prices coexists as two entries. The list keeps insertion order;
//! decrements walk it from the newest entry backwards.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::item::CartItem;

/// Mutation applied to a cart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CartOp {
    /// Replace the quantity of the matching entry (0 removes it).
    Set,
    /// Add to the matching entry, or insert a new one.
    Increment,
    /// Take from the newest matching entries first.
    Decrement,
    /// Drop every entry for the product, regardless of price.
    Remove,
    /// Empty the cart.
    Clear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CartError {
    #[error("quantity for product {product_id} would exceed 255")]
    QuantityOverflow { product_id: u16 },
    #[error("product {product_id} is not in the cart")]
    ItemNotFound { product_id: u16 },
}

/// Apply one mutation and return the resulting cart.
///
/// The input is never modified, so a failed operation leaves the caller's
/// cart exactly as it was.
pub fn apply(
    items: &[CartItem],
    product_id: u16,
    quantity: u8,
    price: u32,
    op: CartOp,
) -> Result<Vec<CartItem>, CartError> {
    let mut items = items.to_vec();
    let matching = items
        .iter()
        .position(|it| it.product_id == product_id && it.price == price);

    match op {
        CartOp::Set => {
            if quantity == 0 {
                if let Some(index) = matching {
                    items.remove(index);
                }
            } else if let Some(index) = matching {
                items[index].count = quantity;
            } else {
                items.push(CartItem {
                    product_id,
                    count: quantity,
                    price,
                });
            }
        }

        CartOp::Increment => {
            if let Some(index) = matching {
                let sum = items[index].count as u16 + quantity as u16;
                if sum > u8::MAX as u16 {
                    return Err(CartError::QuantityOverflow { product_id });
                }
                items[index].count = sum as u8;
            } else {
                items.push(CartItem {
                    product_id,
                    count: quantity,
                    price,
                });
            }
        }

        CartOp::Decrement => {
            if !items.iter().any(|it| it.product_id == product_id) {
                return Err(CartError::ItemNotFound { product_id });
            }
            let mut remaining = quantity as u16;
            // Newest entries first, across price tiers.
            for index in (0..items.len()).rev() {
                if remaining == 0 {
                    break;
                }
                if items[index].product_id != product_id {
                    continue;
                }
                let take = remaining.min(items[index].count as u16);
                let left = items[index].count as u16 - take;
                if left == 0 {
                    items.remove(index);
                } else {
                    items[index].count = left as u8;
                }
                remaining -= take;
            }
        }

        CartOp::Remove => {
            let before = items.len();
            items.retain(|it| it.product_id != product_id);
            if items.len() == before {
                return Err(CartError::ItemNotFound { product_id });
            }
        }

        CartOp::Clear => items.clear(),
    }

    Ok(items)
}
