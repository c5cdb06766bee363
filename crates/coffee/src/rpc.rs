//! Minimal Ethereum JSON-RPC client over HTTP (reqwest).

use crate::abi::{parse_hex_bytes, parse_hex_bytes_32, parse_hex_u128, parse_hex_u64};
use crate::entry::Address;
use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};

/// Build an eth_getLogs / eth_subscribe filter for one contract.
pub fn build_logs_filter(
    address: &Address,
    topic0: Option<&[u8; 32]>,
    from_block: Option<u64>,
    to_block: Option<u64>,
) -> Value {
    let mut filter = json!({
        "address": format!("0x{}", hex::encode(address)),
    });
    // Single-topic filter: [topic0] only (some nodes reject [topic0, null, null]).
    if let Some(t0) = topic0 {
        filter["topics"] = json!([format!("0x{}", hex::encode(t0))]);
    }
    if let Some(from) = from_block {
        filter["fromBlock"] = Value::String(format!("0x{:x}", from));
    }
    if let Some(to) = to_block {
        filter["toBlock"] = Value::String(format!("0x{:x}", to));
    }
    filter
}

/// HTTP JSON-RPC client bound to one endpoint.
#[derive(Debug)]
pub struct RpcClient {
    http: reqwest::Client,
    url: String,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        // no_proxy: system proxy discovery panics in some sandboxes.
        let http = reqwest::Client::builder()
            .no_proxy()
            .build()
            .context("build HTTP client")?;
        Ok(Self {
            http,
            url: url.into(),
            next_id: AtomicU64::new(1),
        })
    }

    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
            "method": method,
            "params": params
        });
        let resp = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("{} request failed", method))?;
        let json: Value = resp.json().await.context("parse response")?;
        if let Some(err) = json.get("error") {
            anyhow::bail!("RPC error from {}: {}", method, err);
        }
        json.get("result")
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Missing result"))
    }

    pub async fn block_number(&self) -> Result<u64> {
        let result = self.call("eth_blockNumber", json!([])).await?;
        let s = result.as_str().ok_or_else(|| anyhow::anyhow!("blockNumber not string"))?;
        parse_hex_u64(s).context("parse block number")
    }

    /// Hash of the canonical block at `number`, or None if the node has no such block yet.
    pub async fn block_hash(&self, number: u64) -> Result<Option<[u8; 32]>> {
        let result = self
            .call("eth_getBlockByNumber", json!([format!("0x{:x}", number), false]))
            .await?;
        if result.is_null() {
            return Ok(None);
        }
        let s = result
            .get("hash")
            .and_then(|h| h.as_str())
            .ok_or_else(|| anyhow::anyhow!("block without hash"))?;
        parse_hex_bytes_32(s).map(Some)
    }

    pub async fn get_logs(&self, filter: Value) -> Result<Vec<Value>> {
        let result = self.call("eth_getLogs", json!([filter])).await?;
        let arr = result.as_array().ok_or_else(|| anyhow::anyhow!("getLogs not array"))?;
        Ok(arr.clone())
    }

    pub async fn eth_call(&self, to: &Address, calldata: &[u8]) -> Result<Vec<u8>> {
        let params = json!([{
            "to": format!("0x{}", hex::encode(to)),
            "data": format!("0x{}", hex::encode(calldata)),
        }, "latest"]);
        let result = self.call("eth_call", params).await?;
        let s = result.as_str().ok_or_else(|| anyhow::anyhow!("eth_call result not string"))?;
        parse_hex_bytes(s).context("decode eth_call result")
    }

    pub async fn get_balance(&self, address: &Address) -> Result<u128> {
        let result = self
            .call(
                "eth_getBalance",
                json!([format!("0x{}", hex::encode(address)), "latest"]),
            )
            .await?;
        let s = result.as_str().ok_or_else(|| anyhow::anyhow!("balance not string"))?;
        parse_hex_u128(s)
    }

    /// eth_sendTransaction from an account the node holds keys for. Returns the tx hash.
    pub async fn send_transaction(
        &self,
        from: &Address,
        to: &Address,
        value: u128,
        data: &[u8],
    ) -> Result<[u8; 32]> {
        let params = json!([{
            "from": format!("0x{}", hex::encode(from)),
            "to": format!("0x{}", hex::encode(to)),
            "value": format!("0x{:x}", value),
            "data": format!("0x{}", hex::encode(data)),
        }]);
        let result = self.call("eth_sendTransaction", params).await?;
        let s = result.as_str().ok_or_else(|| anyhow::anyhow!("tx hash not string"))?;
        parse_hex_bytes_32(s)
    }
}
