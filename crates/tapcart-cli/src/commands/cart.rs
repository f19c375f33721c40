//! Walk the cart storage protocol on the demo card.

use std::sync::Arc;

use tapcart_card::{CardStorage, KeyMap, MemoryCard, SectorKeys, TagAccess};
use tapcart_common::{cart, legacy, CartItem, CartOp, DataHeader, DataType};

use super::CommandResult;

fn print_items(items: &[CartItem]) {
    if items.is_empty() {
        println!("  (empty)");
        return;
    }
    for item in items {
        println!(
            "  product {:>5}  x{:<3}  @ {:>8} cents",
            item.product_id, item.count, item.price
        );
    }
}

pub async fn run(legacy_mode: bool) -> CommandResult {
    if legacy_mode {
        return run_legacy();
    }

    let card = Arc::new(MemoryCard::transport([0x04, 0x11, 0x22, 0x33]));
    let access = Arc::new(TagAccess::new(card));
    let storage = CardStorage::new(access);
    let keys = KeyMap::uniform(
        SectorKeys::from_hex(Some("FFFFFFFFFFFF"), Some("FFFFFFFFFFFF"))
            .ok_or("bad transport key")?,
    );

    // Provision the customer boundary, as setup would.
    let customer = DataHeader {
        data_type: DataType::Customer,
        start_sector: 0,
        start_block: 1,
        end_sector: 1,
        end_block: 2,
        item_count: 1,
        total_bytes: 48,
        timestamp_ms: 0,
    };
    storage.write_customer_header(&customer, &keys).await?;
    let (start_sector, start_block) = CardStorage::cart_start(&customer);
    println!(
        "Customer data ends at {}/{}; cart starts at {}/{} ({} bytes free)\n",
        customer.end_sector,
        customer.end_block,
        start_sector,
        start_block,
        CardStorage::available_space(start_sector, start_block)
    );

    // Build a cart through the mutation policy, then persist it.
    let mut items = Vec::new();
    for (product_id, quantity, price, op) in [
        (101u16, 2u8, 1_200u32, CartOp::Increment),
        (205, 1, 850, CartOp::Increment),
        (101, 1, 1_500, CartOp::Increment), // same product, new price tier
        (205, 3, 850, CartOp::Set),
    ] {
        items = cart::apply(&items, product_id, quantity, price, op)?;
    }

    println!("Cart after mutations:");
    print_items(&items);

    let header = storage
        .write_cart(&items, start_sector, start_block, &keys)
        .await?;
    storage.write_cart_header(&header, &keys).await?;
    println!(
        "\nWritten: {} items, {} bytes, blocks {}/{}..{}/{}",
        header.item_count,
        header.total_bytes,
        header.start_sector,
        header.start_block,
        header.end_sector,
        header.end_block
    );

    let header = storage
        .read_cart_header(&keys)
        .await?
        .ok_or("cart header vanished")?;
    let read_back = storage.read_cart(&header, &keys).await?;
    println!("\nRead back from card:");
    print_items(&read_back);

    Ok(())
}

/// The legacy 3-byte format: single entry per product, no price tiers.
fn run_legacy() -> CommandResult {
    let mut records = Vec::new();
    for (product_id, quantity, op) in [
        (101u16, 2u8, CartOp::Increment),
        (205, 1, CartOp::Increment),
        (101, 1, CartOp::Increment), // merges, no price tier
        (205, 1, CartOp::Decrement),
    ] {
        records = legacy::apply(&records, product_id, quantity, op)?;
    }

    println!("Legacy cart after mutations:");
    for record in &records {
        println!("  product {:>5}  x{}", record.product_id, record.count);
    }

    let mut payload = Vec::new();
    for record in &records {
        payload.extend_from_slice(&record.to_bytes());
    }
    println!("\nEncoded ({} bytes): {}", payload.len(), hex::encode_upper(&payload));

    let decoded = legacy::decode_records(&payload, payload.len());
    println!("Decoded {} records back", decoded.len());

    Ok(())
}
