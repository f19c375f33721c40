//! Tapcart Common - Shared byte formats for offline cart storage
//!
//! Everything a contactless card and the terminal agree on byte-for-byte
//! lives here: the cart line-item records (current 7-byte and legacy 3-byte
//! layouts), the 16-byte header blocks that describe where a payload starts
//! and ends on the card, and the cart mutation policies that operate on
//! decoded item lists.

pub mod cart;
pub mod header;
pub mod item;
pub mod legacy;

pub use cart::{CartError, CartOp};
pub use header::{BalanceHeader, DataHeader, DataType, BLOCK_SIZE};
pub use item::CartItem;
