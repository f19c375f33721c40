//! Run the demo processing queue: a mixed payment batch followed by card
//! operations, with a scripted operator answering input requests.

use std::sync::Arc;
use std::time::Duration;

use tapcart_card::{CardStorage, KeyMap, MemoryCard, SectorKeys, TagAccess};
use tapcart_common::{CartOp, DataHeader, DataType};
use tapcart_queue::processors::nfc::{DynamicNfcProcessor, NfcItem, NfcProcessorRegistry};
use tapcart_queue::processors::payment::{
    CashPaymentProcessor, DynamicPaymentProcessor, PaymentItem, PaymentProcessorRegistry,
    PixPaymentProcessor,
};
use tapcart_queue::{
    EngineConfig, InputKind, InputResponse, InputValue, ItemStatus, MemoryStore, QueueEngine,
    QueueStore, WorkItem,
};

use super::CommandResult;

const FF: &str = "FFFFFFFFFFFF";

/// Scripted operator: supplies keys and confirms PIX scans.
fn spawn_operator<T: WorkItem>(engine: &QueueEngine<T>) {
    let mut requests = engine.processor_input_requests();
    let engine = engine.clone();
    tokio::spawn(async move {
        while let Ok(request) = requests.recv().await {
            let value = match request.kind {
                InputKind::SectorKeys => InputValue::Keys {
                    key_a: Some(FF.into()),
                    key_b: Some(FF.into()),
                },
                InputKind::ConfirmScan { ref code } => {
                    println!("  [operator] confirming scan of {code}");
                    InputValue::Confirm(true)
                }
                _ => continue,
            };
            engine
                .provide_input(InputResponse::answer(request.id, value))
                .await;
        }
    });
}

fn spawn_event_printer<T: WorkItem>(label: &'static str, engine: &QueueEngine<T>) {
    let mut events = engine.processor_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            println!("  [{label}] {event:?}");
        }
    });
}

async fn drain<T: WorkItem>(engine: &QueueEngine<T>) {
    let state = engine.queue_state();
    engine.start_processing();
    while !state.borrow().is_empty() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn run() -> CommandResult {
    // --- Payments: priorities 5, 10, 1 settle as 10, 5, 1 ---
    println!("== Payment queue ==");
    let registry = PaymentProcessorRegistry {
        cash: Arc::new(CashPaymentProcessor::new().with_latency(Duration::from_millis(200))),
        pix: Arc::new(PixPaymentProcessor::new()),
    };
    let processor = Arc::new(DynamicPaymentProcessor::new(registry));
    let store = Arc::new(MemoryStore::new());
    let payments = QueueEngine::new(store.clone(), processor, EngineConfig::default());
    spawn_operator(&payments);
    spawn_event_printer("payment", &payments);

    payments
        .enqueue(PaymentItem::cash(2_500).with_priority(5))
        .await;
    payments
        .enqueue(PaymentItem::pix(12_000, "PIX-COPY-PASTE-47").with_priority(10))
        .await;
    payments
        .enqueue(PaymentItem::cash(900).with_priority(1))
        .await;
    drain(&payments).await;

    let settled = store.get_all_by_status(ItemStatus::Completed).await?;
    let rejected = store.get_all_by_status(ItemStatus::Canceled).await?;
    println!(
        "payments settled: {}, rejected: {}\n",
        settled.len(),
        rejected.len()
    );

    // --- Card operations against the demo card ---
    println!("== Card queue ==");
    let card = Arc::new(MemoryCard::transport([0x04, 0x5C, 0x9A, 0x3D]));
    let access = Arc::new(TagAccess::new(card.clone()));

    // Provision the customer boundary first.
    let storage = CardStorage::new(access.clone());
    let keys = KeyMap::uniform(SectorKeys::from_hex(Some(FF), Some(FF)).ok_or("bad key")?);
    storage
        .write_customer_header(
            &DataHeader {
                data_type: DataType::Customer,
                start_sector: 0,
                start_block: 1,
                end_sector: 1,
                end_block: 2,
                item_count: 1,
                total_bytes: 48,
                timestamp_ms: 0,
            },
            &keys,
        )
        .await?;

    let processor = Arc::new(DynamicNfcProcessor::new(NfcProcessorRegistry::new(access)));
    let nfc_store = Arc::new(MemoryStore::new());
    let cards = QueueEngine::new(nfc_store.clone(), processor, EngineConfig::default());
    spawn_operator(&cards);
    spawn_event_printer("card", &cards);

    cards
        .enqueue(NfcItem::cart_update(101, 2, 1_200, CartOp::Increment))
        .await;
    cards
        .enqueue(NfcItem::cart_update(205, 1, 850, CartOp::Increment))
        .await;
    cards.enqueue(NfcItem::cart_read()).await;
    drain(&cards).await;

    let done = nfc_store.get_all_by_status(ItemStatus::Completed).await?;
    println!("card operations completed: {}", done.len());

    let header = card.raw_block(0, 2);
    println!(
        "cart header on card: magic={}{} items={} bytes={}",
        header[0] as char, header[1] as char, header[7],
        u16::from_le_bytes([header[8], header[9]])
    );

    Ok(())
}
