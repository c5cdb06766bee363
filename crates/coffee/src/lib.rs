//! Off-chain Coffee runtime: memo indexing, mirroring, and live fan-out for the Coffee contract.
//!
//! - **EventSource**: pull-based subscription to `NewMemo` events ([RpcEventSource] over
//!   JSON-RPC/WebSocket, [MemoryLedger] in-process), with reorg signalling.
//! - **Indexer**: the single writer; applies entries to a [MirrorStore] idempotently,
//!   checkpoints progress, reconnects with backoff, rolls back on reorg.
//! - **Broadcaster**: bounded, drop-oldest fan-out of applied memos to live observers,
//!   served over WebSocket by [live::serve].
//! - **Ledger**: the contract's write surface (`buyCoffee`, `withdrawTips`) and counters.

pub mod abi;
pub mod broadcast;
pub mod checkpoint;
pub mod config;
pub mod entry;
pub mod indexer;
pub mod ledger;
pub mod live;
pub mod mirror;
pub mod rpc;
pub mod simulated;
pub mod source;

pub use broadcast::{BroadcastEvent, Broadcaster, Delivery, Observer};
pub use checkpoint::{Checkpoint, CheckpointError, CheckpointStore, FileCheckpoint, MemoryCheckpoint};
pub use config::{IndexerConfig, ReconnectionConfig, RpcConfig};
pub use entry::{Address, LedgerEntry, MirrorRecord, SourcePosition};
pub use indexer::{Indexer, IndexerError, IndexerHandle, IndexerState};
pub use ledger::{Ledger, LedgerError, RpcLedger, Submission};
pub use live::{LiveKind, LiveMessage};
pub use mirror::{recent_memos, FileMirror, MemoView, MemoryMirror, MirrorStore, StoreError, Upsert};
pub use simulated::MemoryLedger;
pub use source::{EventSource, RpcEventSource, SourceError, SourceEvent, Subscription};
