//! Example: the whole pipeline against the in-process simulated ledger.
//!
//! Buys a few coffees, drops the connection, reorganizes the chain, and prints
//! what a live observer sees plus the final memo listing. No node required.
//!
//! Usage:
//!
//!   cargo run -p coffee --example simulate

use coffee::{
    recent_memos, Broadcaster, Delivery, Indexer, IndexerConfig, IndexerState, Ledger,
    MemoryCheckpoint, MemoryLedger, MemoryMirror, MirrorStore,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const OWNER: [u8; 20] = [0xaa; 20];
const ALICE: [u8; 20] = [0x01; 20];
const BOB: [u8; 20] = [0x02; 20];

async fn settle(mirror: &MemoryMirror, len: usize) {
    for _ in 0..200 {
        if mirror.len().unwrap_or(0) == len {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tracing::warn!(expected = len, "mirror did not settle");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("coffee=info")))
        .init();

    let ledger = MemoryLedger::new(OWNER);
    ledger.append(ALICE, "alice", "nice work", 1_000).await?;

    let mirror = Arc::new(MemoryMirror::new());
    let broadcaster = Broadcaster::new(16);
    let mut observer = broadcaster.register();
    let mut config = IndexerConfig::default();
    config.reconnection.initial_backoff_ms = 50;
    config.reconnection.jitter_ms = 20;
    let handle = Indexer::new(
        ledger.clone(),
        Arc::clone(&mirror),
        MemoryCheckpoint::new(),
        broadcaster,
        config,
    )
    .spawn();
    handle.wait_for(IndexerState::Live).await;

    ledger.append(BOB, "bob", "cheers", 2_000).await?;
    ledger.append(ALICE, "alice", "another one", 500).await?;
    settle(&mirror, 3).await;

    ledger.disconnect().await;
    ledger.append(BOB, "bob", "while you were away", 750).await?;
    settle(&mirror, 4).await;

    let orphaned = ledger.reorg(2).await;
    println!("reorg orphaned {} block(s); head is now block {}", orphaned, ledger.head().await);
    ledger.append(ALICE, "carol", "on the new fork", 3_000).await?;
    settle(&mirror, 3).await;
    handle.wait_for(IndexerState::Live).await;

    if let Err(e) = ledger.withdraw(ALICE).await {
        println!("withdraw by alice: {}", e);
    }
    ledger.withdraw(OWNER).await?;
    println!("balance after owner withdraw: {}", ledger.balance().await?);

    handle.shutdown().await?;
    while let Some(delivery) = observer.recv().await {
        match &delivery {
            Delivery::Event(ev) => println!("live #{}: {}", ev.broadcast_sequence, delivery.to_live_message().message),
            _ => println!("{}", serde_json::to_string(&delivery.to_live_message())?),
        }
    }
    println!("memo count on ledger: {}", ledger.count().await?);
    for memo in recent_memos(mirror.as_ref(), 10)? {
        println!("{}", serde_json::to_string(&memo)?);
    }
    Ok(())
}
