//! Reorg rollback: the mirror after rollback and re-application must equal a
//! mirror that never saw the orphaned entries.

mod common;

use common::{eventually, fast_config, init_tracing, mirrored_entries, wait_live};
use coffee::{
    Broadcaster, CheckpointStore, Delivery, FileCheckpoint, FileMirror, Indexer, Ledger, LiveKind,
    MemoryCheckpoint, MemoryLedger, MemoryMirror, MirrorStore,
};
use std::sync::Arc;

const OWNER: [u8; 20] = [0xaa; 20];
const ALICE: [u8; 20] = [0x01; 20];
const BOB: [u8; 20] = [0x02; 20];

async fn index_to_completion(ledger: &MemoryLedger) -> Arc<MemoryMirror> {
    let mirror = Arc::new(MemoryMirror::new());
    let handle = Indexer::new(
        ledger.clone(),
        Arc::clone(&mirror),
        MemoryCheckpoint::new(),
        Broadcaster::default(),
        fast_config(),
    )
    .spawn();
    wait_live(&handle).await;
    handle.shutdown().await.unwrap();
    mirror
}

#[tokio::test]
async fn rollback_then_reapply_equals_never_reorged_store() {
    init_tracing();
    let ledger = MemoryLedger::new(OWNER);
    let mirror = Arc::new(MemoryMirror::new());
    let hub = Broadcaster::new(32);
    let mut observer = hub.register();
    let handle = Indexer::new(
        ledger.clone(),
        Arc::clone(&mirror),
        MemoryCheckpoint::new(),
        hub.clone(),
        fast_config(),
    )
    .spawn();
    wait_live(&handle).await;

    for i in 0..5 {
        ledger.append(ALICE, "alice", &format!("orphan-prone {}", i), 10).await.unwrap();
    }
    eventually("five memos mirrored", 5, || mirror.len().unwrap() == 5).await;

    assert_eq!(ledger.reorg(2).await, 3);
    ledger.append(BOB, "bob", "fork a", 20).await.unwrap();
    ledger.append(BOB, "bob", "fork b", 30).await.unwrap();
    eventually("fork re-applied", 5, || {
        mirror
            .get(4)
            .ok()
            .flatten()
            .map(|r| r.entry.message == "fork b")
            .unwrap_or(false)
    })
    .await;
    wait_live(&handle).await;

    let reference = MemoryLedger::new(OWNER);
    for entry in ledger.entries().await {
        reference
            .append(entry.sender, &entry.author, &entry.message, entry.amount)
            .await
            .unwrap();
    }
    let never_reorged = index_to_completion(&reference).await;

    assert_eq!(mirror.len().unwrap(), 4);
    assert_eq!(mirrored_entries(mirror.as_ref()), ledger.entries().await);
    assert_eq!(
        mirrored_entries(mirror.as_ref()),
        mirrored_entries(never_reorged.as_ref())
    );

    let mut saw_notice = false;
    while let Some(delivery) = observer.try_recv() {
        if let Delivery::Notice(msg) = delivery {
            assert_eq!(msg.kind, LiveKind::Info);
            saw_notice = true;
        }
    }
    assert!(saw_notice, "observers must be told about the rollback");
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn reorg_while_disconnected_is_detected_on_resubscribe() {
    init_tracing();
    let ledger = MemoryLedger::new(OWNER);
    for i in 0..4 {
        ledger.append(ALICE, "alice", &format!("m{}", i), 1).await.unwrap();
    }
    let mirror = Arc::new(MemoryMirror::new());
    let handle = Indexer::new(
        ledger.clone(),
        Arc::clone(&mirror),
        MemoryCheckpoint::new(),
        Broadcaster::default(),
        fast_config(),
    )
    .spawn();
    wait_live(&handle).await;
    assert_eq!(mirror.len().unwrap(), 4);

    // Keep the indexer away while the chain reorganizes underneath it.
    ledger.refuse_subscriptions(2).await;
    ledger.disconnect().await;
    ledger.reorg(1).await;
    ledger.append(BOB, "bob", "replacement", 7).await.unwrap();

    eventually("rolled back to the new fork", 5, || {
        mirror.len().unwrap() == 2
            && mirror
                .get(2)
                .ok()
                .flatten()
                .map(|r| r.entry.author == "bob")
                .unwrap_or(false)
    })
    .await;
    wait_live(&handle).await;
    assert_eq!(mirrored_entries(mirror.as_ref()), ledger.entries().await);
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn file_backed_rollback_survives_restart() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let store_path = dir.path().join("mirror.jsonl");
    let checkpoint_path = dir.path().join("checkpoint.json");
    let ledger = MemoryLedger::new(OWNER);
    for i in 0..3 {
        ledger.append(ALICE, "alice", &format!("m{}", i), 1).await.unwrap();
    }

    {
        let mirror = Arc::new(FileMirror::open(&store_path).unwrap());
        let handle = Indexer::new(
            ledger.clone(),
            Arc::clone(&mirror),
            FileCheckpoint::new(&checkpoint_path),
            Broadcaster::default(),
            fast_config(),
        )
        .spawn();
        wait_live(&handle).await;
        ledger.reorg(1).await;
        ledger.append(BOB, "bob", "new second", 2).await.unwrap();
        eventually("fork applied", 5, || {
            mirror.len().unwrap() == 2
                && mirror.get(2).ok().flatten().map(|r| r.entry.author == "bob").unwrap_or(false)
        })
        .await;
        handle.shutdown().await.unwrap();
    }

    let reopened = FileMirror::open(&store_path).unwrap();
    assert_eq!(mirrored_entries(&reopened), ledger.entries().await);
    let saved = FileCheckpoint::new(&checkpoint_path).load().unwrap().unwrap();
    assert_eq!(saved.last_applied_sequence, Some(2));
    assert_eq!(saved.last_applied_position, ledger.position_of(2).await);
}
