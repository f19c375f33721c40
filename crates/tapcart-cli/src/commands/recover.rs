//! Brute-force key recovery against the built-in demo card.
//!
//! The demo card is provisioned with a production trailer whose key A is
//! drawn from the standard dictionary and whose key B is the transport
//! default, so the search has something to find.

use std::sync::Arc;
use std::time::Duration;

use tapcart_card::{
    conditions, keys, KeyRecovery, MemoryCard, RecoveryMode, RecoveryOptions, TagAccess,
};

use super::CommandResult;

pub async fn run(mode: RecoveryMode, owned: &[String]) -> CommandResult {
    let mut owned_keys = Vec::with_capacity(owned.len());
    for key in owned {
        owned_keys.push(keys::parse_key(key).ok_or_else(|| format!("invalid key: {key}"))?);
    }

    let key_a = keys::parse_key("A0A1A2A3A4A5").ok_or("bad dictionary key")?;
    let key_b = keys::parse_key("FFFFFFFFFFFF").ok_or("bad dictionary key")?;

    let card = Arc::new(MemoryCard::transport([0x04, 0x88, 0x21, 0x47]));
    for sector in 0..16 {
        card.seed_trailer(sector, conditions::production_trailer(&key_a, &key_b));
    }

    println!("Demo card provisioned; searching with mode {mode:?}\n");

    let recovery = KeyRecovery::new(Arc::new(TagAccess::new(card)));
    let report = recovery
        .run(&RecoveryOptions {
            attempt_timeout: Duration::from_millis(100),
            owned_keys,
            mode,
            ..RecoveryOptions::default()
        })
        .await?;

    println!("Recovery finished:");
    println!("  complete sectors : {}", report.complete_sectors);
    println!("  partial sectors  : {}", report.partial_sectors);
    println!("  empty sectors    : {}", report.empty_sectors);
    println!("  total attempts   : {}", report.total_attempts);
    println!("  aborted          : {}\n", report.aborted);

    for (sector, sector_keys) in report.keys.iter().enumerate() {
        let fmt = |key: Option<[u8; 6]>| {
            key.map(|k| hex::encode_upper(k))
                .unwrap_or_else(|| "------------".into())
        };
        println!(
            "  sector {sector:>2}: A={} B={}",
            fmt(sector_keys.key_a),
            fmt(sector_keys.key_b)
        );
    }

    Ok(())
}
