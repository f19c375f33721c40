//! Decode and pretty-print a sector's access-control bytes.

use tapcart_card::{decode, KeyRule};

use super::CommandResult;

fn rule(rule: KeyRule) -> &'static str {
    match rule {
        KeyRule::A => "key A",
        KeyRule::B => "key B",
        KeyRule::Both => "A or B",
        KeyRule::Never => "never",
    }
}

pub fn run(bits: &str) -> CommandResult {
    let bytes = hex::decode(bits)?;
    let bytes: [u8; 3] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| "access bits must be exactly 3 bytes")?;

    let access = decode(bytes);

    println!("Access conditions for {}\n", hex::encode_upper(bytes));
    for (index, block) in access.blocks.iter().enumerate() {
        println!("Data block {index}:");
        println!("  read      : {}", rule(block.read));
        println!("  write     : {}", rule(block.write));
        println!("  increment : {}", rule(block.increment));
        println!("  decrement : {}", rule(block.decrement));
    }

    let trailer = &access.trailer;
    println!("Sector trailer:");
    println!("  key A read        : {}", rule(trailer.key_a_read));
    println!("  key A write       : {}", rule(trailer.key_a_write));
    println!("  access bits read  : {}", rule(trailer.access_bits_read));
    println!("  access bits write : {}", rule(trailer.access_bits_write));
    println!("  key B read        : {}", rule(trailer.key_b_read));
    println!("  key B write       : {}", rule(trailer.key_b_write));

    Ok(())
}
