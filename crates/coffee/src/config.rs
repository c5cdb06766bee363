//! Indexer, source, and reconnection configuration.

use crate::entry::Address;
use serde::Deserialize;
use std::time::Duration;

/// Where and how the RPC event source reads the Coffee contract.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcConfig {
    /// WebSocket RPC URL for live log subscription.
    pub ws_url: String,
    /// HTTP RPC URL for backfill (eth_getLogs, eth_blockNumber, eth_getBlockByNumber).
    pub http_url: String,
    /// Coffee contract address (20 bytes).
    #[serde(with = "crate::entry::hex_array")]
    pub contract_address: Address,
    /// First block to backfill from when there is no checkpoint.
    #[serde(default)]
    pub start_block: u64,
    /// Max block range per eth_getLogs request.
    #[serde(default = "default_getlogs_max_range")]
    pub getlogs_max_range: u64,
    /// Recently delivered block hashes kept for reorg detection; also how far
    /// back to rewind when a reorg reaches past that window.
    #[serde(default = "default_reorg_depth")]
    pub reorg_depth: u64,
}

impl RpcConfig {
    /// Config with defaults; the WebSocket URL is derived from the HTTP URL
    /// (http -> ws, https -> wss).
    pub fn new(http_url: impl Into<String>, contract_address: Address) -> Self {
        let http_url = http_url.into();
        let ws_url = http_url
            .replace("https://", "wss://")
            .replace("http://", "ws://");
        Self {
            ws_url,
            http_url,
            contract_address,
            start_block: 0,
            getlogs_max_range: default_getlogs_max_range(),
            reorg_depth: default_reorg_depth(),
        }
    }
}

fn default_getlogs_max_range() -> u64 {
    1000
}

fn default_reorg_depth() -> u64 {
    64
}

/// Indexer loop configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Sequence number of the ledger's first entry (Coffee counts from 1).
    pub first_sequence: u64,
    /// Reconnection backoff.
    pub reconnection: ReconnectionConfig,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            first_sequence: 1,
            reconnection: ReconnectionConfig::default(),
        }
    }
}

/// Reconnection backoff: doubles from `initial` up to `max`, plus up to
/// `jitter` of random delay.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectionConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter_ms: u64,
}

impl ReconnectionConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms.max(self.initial_backoff_ms))
    }

    pub fn jitter(&self) -> Duration {
        Duration::from_millis(self.jitter_ms)
    }
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            jitter_ms: 500,
        }
    }
}
