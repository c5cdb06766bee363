//! Integration test: Anvil → Coffee contract → RpcEventSource → indexer → mirror → live channel.
//!
//! Reorgs are produced with `evm_snapshot`/`evm_revert`: the reverted block is
//! mined again at the same height with a different hash.

mod common;

use async_trait::async_trait;
use common::{
    address, deploy_coffee, eventually, evm_revert, evm_snapshot, fast_config, init_tracing,
    mirrored_entries, spawn_anvil, wait_live,
};
use coffee::{
    recent_memos, Address, Broadcaster, Delivery, EventSource, Indexer, LedgerEntry, Ledger,
    LedgerError, LiveKind, MemoryCheckpoint, MemoryMirror, MirrorStore, RpcConfig, RpcEventSource,
    RpcLedger, SourceError, SourcePosition, Subscription,
};
use std::path::Path;
use std::process::Child;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// Anvil with a freshly deployed Coffee contract; killed on drop.
struct Node {
    anvil: Child,
    rpc_url: String,
    contract: Address,
    ledger: RpcLedger,
}

impl Node {
    async fn start(test: &str) -> Option<Self> {
        if !common::foundry_available() {
            eprintln!("skipping {}: anvil/forge/cast not in PATH", test);
            return None;
        }
        init_tracing();
        let repo_root = Path::new(env!("CARGO_MANIFEST_DIR")).ancestors().nth(2).unwrap();
        let (anvil, rpc_url) = spawn_anvil().await.expect("spawn anvil");
        let contract = address(&deploy_coffee(repo_root, &rpc_url).expect("deploy Coffee"));
        let ledger = RpcLedger::new(rpc_url.clone(), contract).expect("ledger");
        Some(Self {
            anvil,
            rpc_url,
            contract,
            ledger,
        })
    }

    fn source(&self) -> RpcEventSource {
        RpcEventSource::new(RpcConfig::new(self.rpc_url.clone(), self.contract)).expect("source")
    }

    /// Index the current chain from scratch into a new store.
    async fn index_fresh(&self) -> Vec<LedgerEntry> {
        let mirror = Arc::new(MemoryMirror::new());
        let handle = Indexer::new(
            self.source(),
            Arc::clone(&mirror),
            MemoryCheckpoint::new(),
            Broadcaster::default(),
            fast_config(),
        )
        .spawn();
        wait_live(&handle).await;
        handle.shutdown().await.unwrap();
        mirrored_entries(mirror.as_ref())
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        let _ = self.anvil.kill();
    }
}

/// Several indexer runs over one source, so they share its block window.
struct Shared(Arc<RpcEventSource>);

#[async_trait]
impl EventSource for Shared {
    async fn subscribe(
        &self,
        from: Option<SourcePosition>,
    ) -> Result<Box<dyn Subscription>, SourceError> {
        self.0.subscribe(from).await
    }
}

fn authors<M: MirrorStore + ?Sized>(store: &M) -> Vec<String> {
    mirrored_entries(store).into_iter().map(|e| e.author).collect()
}

#[tokio::test]
async fn test_memos_flow_from_anvil_to_observers() {
    let Some(node) = Node::start("test_memos_flow_from_anvil_to_observers").await else {
        return;
    };
    let ledger = &node.ledger;
    let alice = address(common::ACCOUNT_1);
    let bob = address(common::ACCOUNT_2);
    let owner = address(common::DEPLOYER);

    ledger.append(alice, "alice", "nice work", 1000).await.expect("alice buys");
    ledger.append(bob, "bob", "cheers", 2000).await.expect("bob buys");
    assert_eq!(ledger.count().await.unwrap(), 2);
    assert_eq!(ledger.balance().await.unwrap(), 3000);
    assert_eq!(ledger.owner().await.unwrap(), owner);

    let mirror = Arc::new(MemoryMirror::new());
    let hub = Broadcaster::new(16);
    let mut observer = hub.register();
    let handle = Indexer::new(
        node.source(),
        Arc::clone(&mirror),
        MemoryCheckpoint::new(),
        hub.clone(),
        fast_config(),
    )
    .spawn();
    wait_live(&handle).await;

    let listing = recent_memos(mirror.as_ref(), 10).unwrap();
    assert_eq!(listing.len(), 2);
    assert_eq!((listing[0].author.as_str(), listing[0].sequence_number), ("bob", 2));
    assert_eq!((listing[1].author.as_str(), listing[1].sequence_number), ("alice", 1));
    assert_eq!(mirror.get(1).unwrap().unwrap().entry.sender, alice);
    assert_eq!(listing[0].amount, 2000);

    ledger.append(alice, "alice", "one more", 500).await.expect("live buy");
    let delivery = timeout(Duration::from_secs(10), observer.recv())
        .await
        .expect("live memo in time");
    match delivery {
        Some(Delivery::Event(ev)) => {
            assert_eq!(ev.record.sequence(), 3);
            assert_eq!(ev.record.entry.message, "one more");
        }
        other => panic!("expected live memo, got {:?}", other),
    }
    eventually("third memo mirrored", 10, || mirror.len().unwrap() == 3).await;

    let denied = ledger.withdraw(bob).await.unwrap_err();
    assert!(matches!(denied, LedgerError::AccessDenied { .. }));
    ledger.withdraw(owner).await.expect("owner withdraws");
    assert_eq!(ledger.balance().await.unwrap(), 0);
    assert_eq!(ledger.count().await.unwrap(), 3);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reverted_block_is_rolled_back_while_live() {
    let Some(node) = Node::start("test_reverted_block_is_rolled_back_while_live").await else {
        return;
    };
    let alice = address(common::ACCOUNT_1);
    let bob = address(common::ACCOUNT_2);
    node.ledger.append(alice, "alice", "before the fork", 1000).await.expect("alice buys");
    let snapshot = evm_snapshot(&node.rpc_url).await.expect("snapshot");

    let mirror = Arc::new(MemoryMirror::new());
    let hub = Broadcaster::new(16);
    let mut observer = hub.register();
    let handle = Indexer::new(
        node.source(),
        Arc::clone(&mirror),
        MemoryCheckpoint::new(),
        hub.clone(),
        fast_config(),
    )
    .spawn();
    wait_live(&handle).await;

    node.ledger.append(bob, "bob", "soon orphaned", 2000).await.expect("bob buys");
    eventually("bob mirrored", 10, || authors(mirror.as_ref()) == ["alice", "bob"]).await;

    assert!(evm_revert(&node.rpc_url, &snapshot).await.expect("revert"));
    node.ledger.append(alice, "carol", "on the new fork", 3000).await.expect("carol buys");
    eventually("fork applied", 15, || authors(mirror.as_ref()) == ["alice", "carol"]).await;
    wait_live(&handle).await;

    assert_eq!(node.ledger.count().await.unwrap(), 2);
    assert_eq!(mirrored_entries(mirror.as_ref()), node.index_fresh().await);

    let mut saw_notice = false;
    while let Some(delivery) = observer.try_recv() {
        if let Delivery::Notice(msg) = delivery {
            assert_eq!(msg.kind, LiveKind::Info);
            saw_notice |= msg.message.contains("reorganized");
        }
    }
    assert!(saw_notice, "observers must be told about the rollback");
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reorg_while_stopped_is_found_from_the_resume_block() {
    let Some(node) = Node::start("test_reorg_while_stopped_is_found_from_the_resume_block").await
    else {
        return;
    };
    let alice = address(common::ACCOUNT_1);
    let bob = address(common::ACCOUNT_2);
    node.ledger.append(alice, "alice", "before the fork", 1000).await.expect("alice buys");
    let snapshot = evm_snapshot(&node.rpc_url).await.expect("snapshot");
    node.ledger.append(bob, "bob", "soon orphaned", 2000).await.expect("bob buys");

    let source = Arc::new(node.source());
    let mirror = Arc::new(MemoryMirror::new());
    let handle = Indexer::new(
        Shared(Arc::clone(&source)),
        Arc::clone(&mirror),
        MemoryCheckpoint::new(),
        Broadcaster::default(),
        fast_config(),
    )
    .spawn();
    wait_live(&handle).await;
    assert_eq!(authors(mirror.as_ref()), ["alice", "bob"]);
    handle.shutdown().await.unwrap();

    // The resume block (bob's) is replaced while nothing is listening.
    assert!(evm_revert(&node.rpc_url, &snapshot).await.expect("revert"));
    node.ledger.append(alice, "carol", "on the new fork", 3000).await.expect("carol buys");
    node.ledger.append(bob, "dave", "also new", 4000).await.expect("dave buys");

    let handle = Indexer::new(
        Shared(Arc::clone(&source)),
        Arc::clone(&mirror),
        MemoryCheckpoint::new(),
        Broadcaster::default(),
        fast_config(),
    )
    .spawn();
    wait_live(&handle).await;
    eventually("new fork mirrored", 15, || {
        authors(mirror.as_ref()) == ["alice", "carol", "dave"]
    })
    .await;
    assert_eq!(mirrored_entries(mirror.as_ref()), node.index_fresh().await);
    handle.shutdown().await.unwrap();
}
