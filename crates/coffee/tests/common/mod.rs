//! Common helpers for integration tests.
#![allow(dead_code)]

use anyhow::{Context, Result};
use coffee::rpc::RpcClient;
use coffee::{IndexerConfig, IndexerHandle, IndexerState, LedgerEntry, MirrorStore, ReconnectionConfig};
use serde_json::json;
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use tokio::time::{sleep, timeout};

/// Anvil dev account 0 (deployer, contract owner).
pub const DEPLOYER: &str = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266";
pub const DEPLOYER_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
/// Anvil dev accounts 1 and 2.
pub const ACCOUNT_1: &str = "0x70997970C51812dc3A010C7d01b50e0d17dc79C8";
pub const ACCOUNT_2: &str = "0x3C44CdDdB6a900fa2b585dd299e03d12FA4293BC";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("coffee=debug".parse().expect("directive")),
        )
        .with_test_writer()
        .try_init();
}

/// Millisecond backoff, no jitter.
pub fn fast_config() -> IndexerConfig {
    IndexerConfig {
        first_sequence: 1,
        reconnection: ReconnectionConfig {
            initial_backoff_ms: 2,
            max_backoff_ms: 20,
            jitter_ms: 0,
        },
    }
}

pub fn address(s: &str) -> [u8; 20] {
    let bytes = hex::decode(s.strip_prefix("0x").unwrap_or(s)).expect("hex address");
    let mut out = [0u8; 20];
    out.copy_from_slice(&bytes);
    out
}

/// Poll `cond` every few milliseconds; panic with `what` after `secs`.
pub async fn eventually(what: &str, secs: u64, mut cond: impl FnMut() -> bool) {
    let polled = timeout(Duration::from_secs(secs), async {
        while !cond() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {}", what);
}

pub async fn wait_live(handle: &IndexerHandle) {
    let reached = timeout(Duration::from_secs(10), handle.wait_for(IndexerState::Live))
        .await
        .expect("timed out waiting for Live");
    assert!(reached, "indexer stopped before going live");
}

/// Mirrored entries, oldest first.
pub fn mirrored_entries<M: MirrorStore + ?Sized>(store: &M) -> Vec<LedgerEntry> {
    let mut records = store.list_recent(usize::MAX, 0).expect("list_recent");
    records.reverse();
    records.into_iter().map(|r| r.entry).collect()
}

/// True if `anvil`, `forge`, and `cast` are in PATH (Foundry toolchain available).
pub fn foundry_available() -> bool {
    fn in_path(cmd: &str, args: &[&str]) -> bool {
        Command::new(cmd)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }
    in_path("anvil", &["--help"]) && in_path("forge", &["--help"]) && in_path("cast", &["--help"])
}

/// Spawn Anvil on a dynamic port and wait until ready.
pub async fn spawn_anvil() -> Result<(Child, String)> {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").context("bind for port")?;
        listener.local_addr()?.port()
    };
    let rpc_url = format!("http://127.0.0.1:{}", port);
    let mut cmd = Command::new("anvil");
    cmd.arg("--port").arg(port.to_string()).arg("--host").arg("127.0.0.1");
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    let process = cmd.spawn().context("spawn anvil")?;
    wait_for_rpc(&rpc_url).await?;
    Ok((process, rpc_url))
}

async fn wait_for_rpc(url: &str) -> Result<()> {
    let client = reqwest::Client::builder().no_proxy().build()?;
    for _ in 0..30 {
        let ok = client
            .post(url)
            .json(&json!({"jsonrpc":"2.0","method":"eth_blockNumber","params":[],"id":1}))
            .send()
            .await
            .is_ok();
        if ok {
            return Ok(());
        }
        sleep(Duration::from_millis(100)).await;
    }
    anyhow::bail!("RPC not ready");
}

/// Snapshot the chain state (Anvil). Returns the id for [evm_revert].
pub async fn evm_snapshot(rpc_url: &str) -> Result<String> {
    let result = RpcClient::new(rpc_url)?.call("evm_snapshot", json!([])).await?;
    result
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("evm_snapshot result not string"))
}

/// Revert to a snapshot (Anvil). Blocks mined after it are dropped.
pub async fn evm_revert(rpc_url: &str, snapshot: &str) -> Result<bool> {
    let result = RpcClient::new(rpc_url)?.call("evm_revert", json!([snapshot])).await?;
    result.as_bool().ok_or_else(|| anyhow::anyhow!("evm_revert result not bool"))
}

/// Deploy the Coffee contract from `contracts/Coffee.sol` (run from repo root).
pub fn deploy_coffee(repo_root: &std::path::Path, rpc_url: &str) -> Result<String> {
    let out = Command::new("forge")
        .current_dir(repo_root)
        .args([
            "create",
            "--rpc-url",
            rpc_url,
            "--private-key",
            DEPLOYER_KEY,
            "--broadcast",
            "contracts/Coffee.sol:Coffee",
        ])
        .output()
        .context("forge create")?;
    if !out.status.success() {
        anyhow::bail!("forge create failed: {}", String::from_utf8_lossy(&out.stderr));
    }
    let s = String::from_utf8_lossy(&out.stdout);
    for line in s.lines() {
        if line.contains("Deployed to:") {
            let addr = line.split_whitespace().last().unwrap_or("").trim();
            if addr.starts_with("0x") {
                return Ok(addr.to_string());
            }
        }
    }
    anyhow::bail!("could not parse deployed address from: {}", s);
}
