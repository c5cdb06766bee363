//! Event sources: pull-based, resumable subscriptions to NewMemo events.
//!
//! A [Subscription] yields entries strictly after the position it was opened at,
//! in ledger order. Disconnection is an error value ([SourceError::Transport]);
//! the caller re-subscribes from its last checkpoint and may see entries again.
//! A source that notices previously delivered data is no longer canonical yields
//! [SourceEvent::Reorg] instead of conflicting entries.
//!
//! [RpcEventSource] opens a WebSocket `eth_subscribe("logs")` stream, backfills
//! over HTTP `eth_getLogs` up to the tip, then tails the socket.

use crate::abi::{decode_memo_log, log_matches_new_memo, new_memo_topic0, parse_hex_bytes_20, MemoLog};
use crate::config::RpcConfig;
use crate::entry::{Address, LedgerEntry, SourcePosition};
use crate::rpc::{build_logs_filter, RpcClient};
use anyhow::Context;
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

/// One item from a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    Entry(LedgerEntry, SourcePosition),
    /// Backlog exhausted; everything up to the current head has been delivered.
    CaughtUp,
    /// Entries delivered at positions after this one are no longer canonical.
    Reorg(SourcePosition),
}

#[derive(Debug, Error)]
pub enum SourceError {
    /// The underlying transport dropped; re-subscribe from the last checkpoint.
    #[error("transport error: {0:#}")]
    Transport(#[source] anyhow::Error),
    /// A payload that claims to be a NewMemo log failed ingress validation.
    #[error("malformed event: {0:#}")]
    Malformed(#[source] anyhow::Error),
}

impl SourceError {
    pub fn transport(msg: impl std::fmt::Display) -> Self {
        SourceError::Transport(anyhow::anyhow!("{}", msg))
    }
}

#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next event. Blocks until data arrives or the transport drops.
    async fn next(&mut self) -> Result<SourceEvent, SourceError>;
}

#[async_trait]
pub trait EventSource: Send + Sync {
    /// Open a subscription delivering entries strictly after `from`
    /// (`None`: from the source's origin).
    async fn subscribe(
        &self,
        from: Option<SourcePosition>,
    ) -> Result<Box<dyn Subscription>, SourceError>;
}

/// Decode and validate a NewMemo log at the ingress boundary.
pub fn accept_log(log: &Value) -> Result<MemoLog, SourceError> {
    let decoded = decode_memo_log(log).map_err(SourceError::Malformed)?;
    decoded
        .entry
        .validate()
        .with_context(|| format!("memo {}", decoded.entry.sequence))
        .map_err(SourceError::Malformed)?;
    Ok(decoded)
}

/// Ring of recently delivered (block_number, block_hash), newest last.
#[derive(Debug)]
struct BlockWindow {
    blocks: VecDeque<(u64, [u8; 32])>,
    capacity: usize,
}

impl BlockWindow {
    fn new(capacity: usize) -> Self {
        Self {
            blocks: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn record(&mut self, number: u64, hash: [u8; 32]) {
        match self.blocks.back() {
            Some((n, h)) if *n == number && *h == hash => return,
            Some((n, _)) if *n >= number => self.forget_from(number),
            _ => {}
        }
        self.blocks.push_back((number, hash));
        while self.blocks.len() > self.capacity {
            self.blocks.pop_front();
        }
    }

    fn forget_from(&mut self, number: u64) {
        while matches!(self.blocks.back(), Some((n, _)) if *n >= number) {
            self.blocks.pop_back();
        }
    }

    fn hash_of(&self, number: u64) -> Option<[u8; 32]> {
        self.blocks.iter().find(|(n, _)| *n == number).map(|(_, h)| *h)
    }

    fn newest_first(&self) -> Vec<(u64, [u8; 32])> {
        self.blocks.iter().rev().copied().collect()
    }
}

/// Event source over Ethereum JSON-RPC (HTTP backfill + WebSocket tail).
///
/// The block window is shared by every subscription of one source, so a
/// re-subscription after a disconnect can locate the fork point of a reorg
/// that happened while it was away.
pub struct RpcEventSource {
    config: RpcConfig,
    rpc: Arc<RpcClient>,
    topic0: [u8; 32],
    window: Arc<Mutex<BlockWindow>>,
}

impl RpcEventSource {
    pub fn new(config: RpcConfig) -> anyhow::Result<Self> {
        let rpc = Arc::new(RpcClient::new(config.http_url.clone())?);
        let window = Arc::new(Mutex::new(BlockWindow::new(config.reorg_depth as usize)));
        Ok(Self {
            config,
            rpc,
            topic0: new_memo_topic0(),
            window,
        })
    }
}

#[async_trait]
impl EventSource for RpcEventSource {
    async fn subscribe(
        &self,
        from: Option<SourcePosition>,
    ) -> Result<Box<dyn Subscription>, SourceError> {
        Ok(Box::new(RpcSubscription {
            config: self.config.clone(),
            rpc: Arc::clone(&self.rpc),
            topic0: self.topic0,
            window: Arc::clone(&self.window),
            from,
            last: None,
            phase: Phase::Verify,
            pending: VecDeque::new(),
            tail: None,
        }))
    }
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

#[derive(Debug, Clone, Copy)]
enum Phase {
    /// Check that the resume position is still canonical.
    Verify,
    /// Open the WebSocket subscription before backfilling so nothing mined
    /// during backfill is missed; overlap is dropped by position.
    Connect,
    Backfill { next_block: u64, tip: u64 },
    Live,
}

struct LiveTail {
    _sink: WsSink,
    stream: WsStream,
    needs_client_filter: bool,
}

struct RpcSubscription {
    config: RpcConfig,
    rpc: Arc<RpcClient>,
    topic0: [u8; 32],
    window: Arc<Mutex<BlockWindow>>,
    from: Option<SourcePosition>,
    /// Last position queued (or rewound to); anything at or before is skipped.
    last: Option<SourcePosition>,
    phase: Phase,
    pending: VecDeque<SourceEvent>,
    tail: Option<LiveTail>,
}

#[async_trait]
impl Subscription for RpcSubscription {
    async fn next(&mut self) -> Result<SourceEvent, SourceError> {
        loop {
            if let Some(ev) = self.pending.pop_front() {
                return Ok(ev);
            }
            match self.phase {
                Phase::Verify => {
                    self.last = self.from.clone();
                    if let Some(from) = self.from.clone() {
                        if let Some(reorg) = self.verify(&from).await? {
                            self.rewind(reorg).await;
                        }
                    }
                    self.phase = Phase::Connect;
                }
                Phase::Connect => {
                    self.tail = Some(self.connect().await.map_err(SourceError::Transport)?);
                    let tip = self.rpc.block_number().await.map_err(SourceError::Transport)?;
                    let next_block = match &self.last {
                        Some(p) if p.log_index == u64::MAX => p.block_number + 1,
                        Some(p) => p.block_number,
                        None => self.config.start_block,
                    };
                    tracing::debug!(next_block, tip, "backfill starting");
                    self.phase = Phase::Backfill { next_block, tip };
                }
                Phase::Backfill { next_block, tip } => {
                    if next_block > tip {
                        tracing::info!(tip, "backfill complete");
                        self.phase = Phase::Live;
                        self.pending.push_back(SourceEvent::CaughtUp);
                        continue;
                    }
                    let to = (next_block + self.config.getlogs_max_range.max(1) - 1).min(tip);
                    let mut logs = Vec::new();
                    for raw in self.fetch_range(next_block, to).await? {
                        logs.push(accept_log(&raw)?);
                    }
                    if !logs.is_empty() {
                        tracing::debug!(count = logs.len(), from = next_block, to, "backfill: decoded events");
                    }
                    logs.sort_by_key(|l| l.position.ordinal());
                    for log in logs {
                        self.queue(log).await;
                    }
                    self.phase = Phase::Backfill {
                        next_block: to + 1,
                        tip,
                    };
                }
                Phase::Live => {
                    let (msg, needs_client_filter) = {
                        let tail = self
                            .tail
                            .as_mut()
                            .ok_or_else(|| SourceError::transport("live tail not connected"))?;
                        (tail.stream.next().await, tail.needs_client_filter)
                    };
                    let text = match msg {
                        Some(Ok(Message::Text(t))) => t,
                        Some(Ok(Message::Close(_))) | None => {
                            return Err(SourceError::transport("ws closed"))
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return Err(SourceError::transport(format!("ws: {}", e))),
                    };
                    let v: Value = serde_json::from_str(&text)
                        .context("parse ws message")
                        .map_err(SourceError::Transport)?;
                    if v.get("method").and_then(|m| m.as_str()) != Some("eth_subscription") {
                        continue;
                    }
                    let result = v
                        .get("params")
                        .and_then(|p| p.get("result"))
                        .ok_or_else(|| SourceError::transport("no params.result"))?;
                    if needs_client_filter
                        && !log_from_contract(result, &self.config.contract_address, &self.topic0)
                    {
                        continue;
                    }
                    let log = accept_log(result)?;
                    self.on_live_log(log).await?;
                }
            }
        }
    }
}

impl RpcSubscription {
    /// Queue an entry unless it is at or before what this subscription already covered.
    async fn queue(&mut self, log: MemoLog) {
        if let Some(last) = &self.last {
            if !log.position.is_after(last) {
                return;
            }
        }
        self.window
            .lock()
            .await
            .record(log.position.block_number, log.position.block_hash);
        self.last = Some(log.position.clone());
        self.pending
            .push_back(SourceEvent::Entry(log.entry, log.position));
    }

    /// Forget everything after `to` and tell the consumer.
    async fn rewind(&mut self, to: SourcePosition) {
        tracing::warn!(block = to.block_number, "reorg detected, rewinding");
        self.window.lock().await.forget_from(to.block_number + 1);
        self.last = Some(to.clone());
        self.pending.push_back(SourceEvent::Reorg(to));
    }

    /// Nodes that drop a block without `removed: true` logs (Anvil `evm_revert`)
    /// still show the fork: a log arrives for a delivered block under a new hash.
    async fn on_live_log(&mut self, log: MemoLog) -> Result<(), SourceError> {
        if log.removed {
            return self.handle_removed(&log).await;
        }
        let known = self.window.lock().await.hash_of(log.position.block_number);
        if matches!(known, Some(hash) if hash != log.position.block_hash) {
            tracing::debug!(block = log.position.block_number, "delivered block replaced");
            self.handle_removed(&log).await?;
        }
        self.queue(log).await;
        Ok(())
    }

    /// A log we may have delivered was dropped from the canonical chain.
    async fn handle_removed(&mut self, log: &MemoLog) -> Result<(), SourceError> {
        let block = log.position.block_number;
        match &self.last {
            Some(last) if last.block_number >= block => {}
            // Never delivered (or already rewound below it).
            _ => return Ok(()),
        }
        let parent = block.saturating_sub(1);
        let known = self.window.lock().await.hash_of(parent);
        let hash = match known {
            Some(h) => h,
            None => self
                .rpc
                .block_hash(parent)
                .await
                .map_err(SourceError::Transport)?
                .unwrap_or([0u8; 32]),
        };
        self.rewind(SourcePosition::end_of_block(parent, hash)).await;
        Ok(())
    }

    /// None if `from` is still canonical; otherwise the newest position known to be.
    async fn verify(&self, from: &SourcePosition) -> Result<Option<SourcePosition>, SourceError> {
        let canonical = self
            .rpc
            .block_hash(from.block_number)
            .await
            .map_err(SourceError::Transport)?;
        if canonical == Some(from.block_hash) {
            return Ok(None);
        }
        let window = self.window.lock().await.newest_first();
        for (number, hash) in window.into_iter().filter(|(n, _)| *n < from.block_number) {
            let current = self.rpc.block_hash(number).await.map_err(SourceError::Transport)?;
            if current == Some(hash) {
                return Ok(Some(SourcePosition::end_of_block(number, hash)));
            }
        }
        let fallback = from.block_number.saturating_sub(self.config.reorg_depth.max(1));
        tracing::warn!(
            from = from.block_number,
            fallback,
            "resume block no longer canonical and fork point unknown; rewinding by reorg depth"
        );
        let hash = self
            .rpc
            .block_hash(fallback)
            .await
            .map_err(SourceError::Transport)?
            .unwrap_or([0u8; 32]);
        Ok(Some(SourcePosition::end_of_block(fallback, hash)))
    }

    async fn fetch_range(&self, from: u64, to: u64) -> Result<Vec<Value>, SourceError> {
        let address = &self.config.contract_address;
        let filter = build_logs_filter(address, Some(&self.topic0), Some(from), Some(to));
        match self.rpc.get_logs(filter).await {
            Ok(logs) => Ok(logs),
            Err(e) => {
                tracing::debug!(reason = %e, "eth_getLogs with topic filter failed, trying address-only");
                let fallback = build_logs_filter(address, None, Some(from), Some(to));
                let raw = self.rpc.get_logs(fallback).await.map_err(SourceError::Transport)?;
                Ok(raw
                    .into_iter()
                    .filter(|log| log_matches_new_memo(log, &self.topic0))
                    .collect())
            }
        }
    }

    async fn connect(&self) -> anyhow::Result<LiveTail> {
        let (ws_stream, _) = connect_async(&self.config.ws_url).await.context("WS connect")?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let filter = build_logs_filter(&self.config.contract_address, Some(&self.topic0), None, None);
        let sub_req = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_subscribe",
            "params": ["logs", filter]
        });
        ws_sender
            .send(Message::Text(serde_json::to_string(&sub_req)?))
            .await
            .context("send subscribe")?;

        let v = read_reply(&mut ws_receiver).await?;
        let needs_client_filter = match v.get("error") {
            None => {
                v["result"].as_str().ok_or_else(|| anyhow::anyhow!("no result"))?;
                false
            }
            Some(err) => {
                let msg = err.get("message").and_then(|m| m.as_str()).unwrap_or("");
                if !(msg.contains("data did not match") || msg.contains("variant")) {
                    anyhow::bail!("subscribe error: {}", msg);
                }
                tracing::warn!("RPC does not support logs filter (Anvil?), using client-side filter");
                let sub_req_no_filter = json!({
                    "jsonrpc": "2.0",
                    "id": 2,
                    "method": "eth_subscribe",
                    "params": ["logs"]
                });
                ws_sender
                    .send(Message::Text(serde_json::to_string(&sub_req_no_filter)?))
                    .await
                    .context("send subscribe")?;
                let v2 = read_reply(&mut ws_receiver).await?;
                v2["result"].as_str().ok_or_else(|| anyhow::anyhow!("no sub id"))?;
                true
            }
        };
        tracing::info!(url = %self.config.ws_url, "log subscription established");
        Ok(LiveTail {
            _sink: ws_sender,
            stream: ws_receiver,
            needs_client_filter,
        })
    }
}

async fn read_reply(ws_receiver: &mut WsStream) -> anyhow::Result<Value> {
    let msg = timeout(Duration::from_secs(10), ws_receiver.next())
        .await
        .map_err(|_| anyhow::anyhow!("subscribe timeout"))?
        .ok_or_else(|| anyhow::anyhow!("ws closed"))?
        .context("ws")?;
    match msg {
        Message::Text(t) => serde_json::from_str(&t).context("parse sub response"),
        _ => anyhow::bail!("expected text"),
    }
}

/// Client-side filter for nodes that only support unfiltered log subscriptions.
fn log_from_contract(log: &Value, contract: &Address, topic0: &[u8; 32]) -> bool {
    let addr = match log.get("address").and_then(|a| a.as_str()) {
        Some(a) => a,
        None => return false,
    };
    match parse_hex_bytes_20(addr) {
        Ok(a) if a == *contract => log_matches_new_memo(log, topic0),
        _ => false,
    }
}
