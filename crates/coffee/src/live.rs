//! Live channel: WebSocket push of broadcaster deliveries as JSON envelopes.
//!
//! Wire format is `{"type": "info" | "error" | "success", "message": ..., "time": <unix secs>}`.
//! Clients treat a closed connection as "re-read the memo listing, then reconnect".

use crate::broadcast::{Broadcaster, Delivery};
use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::{accept_async, tungstenite::Message};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LiveKind {
    Info,
    Error,
    Success,
}

/// One live-channel payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveMessage {
    #[serde(rename = "type")]
    pub kind: LiveKind,
    pub message: String,
    pub time: u64,
}

impl LiveMessage {
    pub fn new(kind: LiveKind, message: impl Into<String>, time: u64) -> Self {
        Self {
            kind,
            message: message.into(),
            time,
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(LiveKind::Info, message, unix_now())
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(LiveKind::Error, message, unix_now())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Delivery {
    /// Render for the wire.
    pub fn to_live_message(&self) -> LiveMessage {
        match self {
            Delivery::Event(ev) => {
                let entry = &ev.record.entry;
                LiveMessage::new(
                    LiveKind::Success,
                    format!(
                        "#{} {} sent {}: {}",
                        entry.sequence, entry.author, entry.amount, entry.message
                    ),
                    entry.timestamp,
                )
            }
            Delivery::Dropped(n) => {
                LiveMessage::info(format!("{} updates dropped; re-sync the memo list", n))
            }
            Delivery::Notice(msg) => msg.clone(),
        }
    }
}

/// Accept live-channel connections until `shutdown` flips to true (or its sender is dropped).
pub async fn serve(
    listener: TcpListener,
    broadcaster: Broadcaster,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    tracing::info!(addr = ?listener.local_addr().ok(), "live channel listening");
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted.context("accept")?;
                let broadcaster = broadcaster.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, peer, broadcaster, shutdown).await {
                        tracing::debug!(%peer, reason = %e, "live connection ended with error");
                    }
                });
            }
            _ = shutdown.changed() => break,
        }
    }
    tracing::info!("live channel stopped");
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    broadcaster: Broadcaster,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let ws = accept_async(stream).await.context("ws handshake")?;
    let (mut tx, mut rx) = ws.split();
    let mut observer = broadcaster.register();
    tracing::debug!(%peer, observer = observer.id(), "live client connected");
    loop {
        tokio::select! {
            delivery = observer.recv() => match delivery {
                Some(d) => {
                    let text = serde_json::to_string(&d.to_live_message())?;
                    tx.send(Message::Text(text)).await.context("ws send")?;
                }
                None => break,
            },
            incoming = rx.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(anyhow::anyhow!("ws: {}", e)),
            },
            _ = shutdown.changed() => break,
        }
    }
    let _ = tx.send(Message::Close(None)).await;
    Ok(())
}
