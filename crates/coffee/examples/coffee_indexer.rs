//! Example: mirror a deployed Coffee contract and serve the live channel.
//!
//! Backfills `NewMemo` events into a JSONL mirror, follows new ones over WebSocket,
//! and pushes each applied memo to WebSocket clients on `--listen`. Prints the
//! most recent memos once caught up, then one JSON line per live memo.
//!
//! Usage:
//!
//!   cargo run -p coffee --example coffee_indexer -- --http-url <HTTP_URL> --contract <COFFEE_ADDRESS>
//!
//! Options:
//!   --ws-url <URL>       WebSocket RPC URL. Default: derived from --http-url.
//!   --config <path>      JSON RpcConfig; flags given on the command line override it.
//!   --store <path>       Mirror journal. Default: coffee-mirror.jsonl
//!   --checkpoint <path>  Checkpoint file. Default: coffee-checkpoint.json
//!   --listen <addr>      Live channel address. Default: 127.0.0.1:8546
//!   --start-block <N>    First block to backfill when there is no checkpoint. Default: 0.

use coffee::{
    recent_memos, Broadcaster, Delivery, FileCheckpoint, FileMirror, Indexer, IndexerConfig,
    IndexerState, RpcConfig, RpcEventSource,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

fn parse_contract_address(s: &str) -> Result<[u8; 20], String> {
    let addr_hex = s.strip_prefix("0x").unwrap_or(s);
    let addr_bytes = hex::decode(addr_hex).map_err(|e| e.to_string())?;
    if addr_bytes.len() != 20 {
        return Err("contract must be 20 bytes (40 hex chars)".into());
    }
    let mut out = [0u8; 20];
    out.copy_from_slice(&addr_bytes);
    Ok(out)
}

const USAGE: &str = "Usage: coffee_indexer --http-url <HTTP_URL> --contract <COFFEE_ADDRESS> \
    [--ws-url URL] [--config path] [--store path] [--checkpoint path] [--listen addr] [--start-block N]";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("coffee=info")))
        .init();
    let args: Vec<String> = std::env::args().collect();
    let mut http_url = String::new();
    let mut ws_url = String::new();
    let mut contract = String::new();
    let mut config_path = String::new();
    let mut store_path = "coffee-mirror.jsonl".to_string();
    let mut checkpoint_path = "coffee-checkpoint.json".to_string();
    let mut listen = "127.0.0.1:8546".to_string();
    let mut start_block: Option<u64> = None;
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--http-url" => {
                i += 1;
                http_url = args.get(i).cloned().unwrap_or_default();
            }
            "--ws-url" => {
                i += 1;
                ws_url = args.get(i).cloned().unwrap_or_default();
            }
            "--contract" => {
                i += 1;
                contract = args.get(i).cloned().unwrap_or_default();
            }
            "--config" => {
                i += 1;
                config_path = args.get(i).cloned().unwrap_or_default();
            }
            "--store" => {
                i += 1;
                store_path = args.get(i).cloned().unwrap_or(store_path);
            }
            "--checkpoint" => {
                i += 1;
                checkpoint_path = args.get(i).cloned().unwrap_or(checkpoint_path);
            }
            "--listen" => {
                i += 1;
                listen = args.get(i).cloned().unwrap_or(listen);
            }
            "--start-block" => {
                i += 1;
                start_block = args.get(i).and_then(|s| s.parse().ok());
            }
            "--help" | "-h" => {
                eprintln!("{}", USAGE);
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    let mut config = if config_path.is_empty() {
        if http_url.is_empty() || contract.is_empty() {
            eprintln!("{}", USAGE);
            std::process::exit(1);
        }
        let contract_address = match parse_contract_address(&contract) {
            Ok(addr) => addr,
            Err(e) => {
                eprintln!("{}", e);
                std::process::exit(1);
            }
        };
        RpcConfig::new(http_url.clone(), contract_address)
    } else {
        let raw = std::fs::read_to_string(&config_path)?;
        serde_json::from_str::<RpcConfig>(&raw)?
    };
    if !http_url.is_empty() && !config_path.is_empty() {
        config.http_url = http_url;
    }
    if !ws_url.is_empty() {
        config.ws_url = ws_url;
    }
    if let Some(block) = start_block {
        config.start_block = block;
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let mirror = Arc::new(FileMirror::open(&store_path)?);
        let source = RpcEventSource::new(config)?;
        let broadcaster = Broadcaster::default();
        let mut printer = broadcaster.register();

        let listener = TcpListener::bind(&listen).await?;
        let (stop_live, live_shutdown) = watch::channel(false);
        let live = tokio::spawn(coffee::live::serve(listener, broadcaster.clone(), live_shutdown));

        let handle = Indexer::new(
            source,
            Arc::clone(&mirror),
            FileCheckpoint::new(&checkpoint_path),
            broadcaster,
            IndexerConfig::default(),
        )
        .spawn();

        let mut state = handle.watch_state();
        loop {
            tokio::select! {
                delivery = printer.recv() => match delivery {
                    Some(Delivery::Event(ev)) => println!("{}", serde_json::to_string(&ev)?),
                    Some(other) => println!("{}", serde_json::to_string(&other.to_live_message())?),
                    None => break,
                },
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if *state.borrow_and_update() == IndexerState::Live {
                        for memo in recent_memos(mirror.as_ref(), 10)? {
                            println!("{}", serde_json::to_string(&memo)?);
                        }
                    }
                }
                _ = tokio::signal::ctrl_c() => break,
            }
        }

        let result = handle.shutdown().await;
        let _ = stop_live.send(true);
        live.await??;
        result?;
        Ok::<(), Box<dyn std::error::Error>>(())
    })
}
