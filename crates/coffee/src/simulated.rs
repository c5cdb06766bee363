//! In-process simulated Coffee chain.
//!
//! One block per memo, keccak-chained block hashes, and knobs for the failure
//! modes the indexer has to survive: dropped connections, refused
//! subscriptions, and reorgs. [MemoryLedger] is both the [Ledger] and its
//! [EventSource]; clones share the same chain.

use crate::abi::keccak256;
use crate::entry::{validate_memo, Address, LedgerEntry, SourcePosition};
use crate::ledger::{Ledger, LedgerError, Submission};
use crate::source::{EventSource, SourceError, SourceEvent, Subscription};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

const GENESIS_TIME: u64 = 1_700_000_000;
const BLOCK_TIME: u64 = 12;

#[derive(Debug, Clone)]
struct Block {
    number: u64,
    hash: [u8; 32],
    entry: LedgerEntry,
}

impl Block {
    fn position(&self) -> SourcePosition {
        SourcePosition::new(self.number, 0, self.hash)
    }
}

#[derive(Debug)]
struct Chain {
    owner: Address,
    genesis: [u8; 32],
    /// Canonical blocks; block `n` is at index `n - 1`.
    blocks: Vec<Block>,
    /// Every block ever mined (canonical or orphaned): hash -> (number, parent).
    known: HashMap<[u8; 32], (u64, [u8; 32])>,
    balance: u128,
    /// Bumped on reorg so re-mined blocks get fresh hashes.
    fork: u64,
    /// Bumped on simulated disconnect; subscriptions from an older epoch fail.
    disconnects: u64,
    refuse_subscriptions: u32,
}

impl Chain {
    fn canonical_hash(&self, number: u64) -> Option<[u8; 32]> {
        if number == 0 {
            return Some(self.genesis);
        }
        self.blocks.get(number as usize - 1).map(|b| b.hash)
    }

    fn tip_hash(&self) -> [u8; 32] {
        self.blocks.last().map(|b| b.hash).unwrap_or(self.genesis)
    }

    fn is_canonical(&self, position: &SourcePosition) -> bool {
        self.canonical_hash(position.block_number) == Some(position.block_hash)
    }

    /// Newest canonical ancestor of the block `position` was observed on.
    fn fork_point(&self, position: &SourcePosition) -> SourcePosition {
        let mut hash = position.block_hash;
        while let Some(&(number, parent)) = self.known.get(&hash) {
            if self.canonical_hash(number) == Some(hash) {
                return SourcePosition::end_of_block(number, hash);
            }
            hash = parent;
        }
        SourcePosition::end_of_block(0, self.genesis)
    }

    fn mine(&mut self, sender: Address, author: &str, message: &str, amount: u128) -> &Block {
        let number = self.blocks.len() as u64 + 1;
        let parent = self.tip_hash();
        let mut preimage = Vec::with_capacity(128 + author.len() + message.len());
        preimage.extend_from_slice(&parent);
        preimage.extend_from_slice(&number.to_be_bytes());
        preimage.extend_from_slice(&self.fork.to_be_bytes());
        preimage.extend_from_slice(&sender);
        preimage.extend_from_slice(&amount.to_be_bytes());
        preimage.extend_from_slice(author.as_bytes());
        preimage.push(0);
        preimage.extend_from_slice(message.as_bytes());
        let hash = keccak256(&preimage);
        self.known.insert(hash, (number, parent));
        self.balance += amount;
        self.blocks.push(Block {
            number,
            hash,
            entry: LedgerEntry {
                sequence: number,
                author: author.to_string(),
                message: message.to_string(),
                amount,
                timestamp: GENESIS_TIME + number * BLOCK_TIME,
                sender,
            },
        });
        &self.blocks[self.blocks.len() - 1]
    }
}

#[derive(Debug)]
struct Shared {
    chain: Mutex<Chain>,
    changed: watch::Sender<u64>,
}

/// Simulated Coffee contract and its event stream.
#[derive(Debug, Clone)]
pub struct MemoryLedger {
    shared: Arc<Shared>,
}

impl MemoryLedger {
    pub fn new(owner: Address) -> Self {
        let genesis = keccak256(b"coffee genesis");
        let (changed, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                chain: Mutex::new(Chain {
                    owner,
                    genesis,
                    blocks: Vec::new(),
                    known: HashMap::new(),
                    balance: 0,
                    fork: 0,
                    disconnects: 0,
                    refuse_subscriptions: 0,
                }),
                changed,
            }),
        }
    }

    fn bump(&self) {
        self.shared.changed.send_modify(|v| *v += 1);
    }

    /// Current head block number.
    pub async fn head(&self) -> u64 {
        self.shared.chain.lock().await.blocks.len() as u64
    }

    /// Canonical entries, oldest first.
    pub async fn entries(&self) -> Vec<LedgerEntry> {
        let chain = self.shared.chain.lock().await;
        chain.blocks.iter().map(|b| b.entry.clone()).collect()
    }

    /// Position of the canonical entry with this sequence.
    pub async fn position_of(&self, sequence: u64) -> Option<SourcePosition> {
        let chain = self.shared.chain.lock().await;
        chain
            .blocks
            .get(sequence.checked_sub(1)? as usize)
            .map(Block::position)
    }

    /// Drop every open subscription with a transport error.
    pub async fn disconnect(&self) {
        self.shared.chain.lock().await.disconnects += 1;
        self.bump();
        tracing::debug!("simulated disconnect");
    }

    /// Make the next `n` subscribe calls fail with a transport error.
    pub async fn refuse_subscriptions(&self, n: u32) {
        self.shared.chain.lock().await.refuse_subscriptions = n;
    }

    /// Orphan every block after `keep_through`. Returns how many were dropped.
    /// Memos appended afterwards are mined on the new fork.
    pub async fn reorg(&self, keep_through: u64) -> usize {
        let dropped = {
            let mut chain = self.shared.chain.lock().await;
            let keep = (keep_through as usize).min(chain.blocks.len());
            let orphaned = chain.blocks.split_off(keep);
            let refunded: u128 = orphaned.iter().map(|b| b.entry.amount).sum();
            chain.balance = chain.balance.saturating_sub(refunded);
            chain.fork += 1;
            orphaned.len()
        };
        self.bump();
        tracing::debug!(keep_through, dropped, "simulated reorg");
        dropped
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn append(
        &self,
        caller: Address,
        author: &str,
        message: &str,
        amount: u128,
    ) -> Result<Submission, LedgerError> {
        validate_memo(author, message)?;
        let submission = {
            let mut chain = self.shared.chain.lock().await;
            let block = chain.mine(caller, author, message, amount);
            Submission {
                tx_hash: block.hash,
                sequence: Some(block.entry.sequence),
            }
        };
        self.bump();
        Ok(submission)
    }

    async fn withdraw(&self, caller: Address) -> Result<Submission, LedgerError> {
        let mut chain = self.shared.chain.lock().await;
        if caller != chain.owner {
            return Err(LedgerError::AccessDenied { caller });
        }
        let amount = std::mem::take(&mut chain.balance);
        let mut preimage = b"withdrawTips".to_vec();
        preimage.extend_from_slice(&chain.tip_hash());
        preimage.extend_from_slice(&amount.to_be_bytes());
        tracing::debug!(amount = %amount, "simulated withdraw");
        Ok(Submission {
            tx_hash: keccak256(&preimage),
            sequence: None,
        })
    }

    async fn count(&self) -> Result<u64, LedgerError> {
        Ok(self.shared.chain.lock().await.blocks.len() as u64)
    }

    async fn balance(&self) -> Result<u128, LedgerError> {
        Ok(self.shared.chain.lock().await.balance)
    }
}

#[async_trait]
impl EventSource for MemoryLedger {
    async fn subscribe(
        &self,
        from: Option<SourcePosition>,
    ) -> Result<Box<dyn Subscription>, SourceError> {
        let mut chain = self.shared.chain.lock().await;
        if chain.refuse_subscriptions > 0 {
            chain.refuse_subscriptions -= 1;
            return Err(SourceError::transport("simulated: connection refused"));
        }
        Ok(Box::new(MemorySubscription {
            shared: Arc::clone(&self.shared),
            changed: self.shared.changed.subscribe(),
            epoch: chain.disconnects,
            last: from,
            caught_up: false,
        }))
    }
}

struct MemorySubscription {
    shared: Arc<Shared>,
    changed: watch::Receiver<u64>,
    epoch: u64,
    last: Option<SourcePosition>,
    caught_up: bool,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Result<SourceEvent, SourceError> {
        loop {
            self.changed.borrow_and_update();
            {
                let chain = self.shared.chain.lock().await;
                if chain.disconnects != self.epoch {
                    return Err(SourceError::transport("simulated: connection dropped"));
                }
                if let Some(last) = &self.last {
                    if !chain.is_canonical(last) {
                        let point = chain.fork_point(last);
                        self.last = Some(point.clone());
                        return Ok(SourceEvent::Reorg(point));
                    }
                }
                let next_index = self.last.as_ref().map(|p| p.block_number).unwrap_or(0) as usize;
                if let Some(block) = chain.blocks.get(next_index) {
                    let position = block.position();
                    self.last = Some(position.clone());
                    return Ok(SourceEvent::Entry(block.entry.clone(), position));
                }
                if !self.caught_up {
                    self.caught_up = true;
                    return Ok(SourceEvent::CaughtUp);
                }
            }
            if self.changed.changed().await.is_err() {
                return Err(SourceError::transport("simulated: ledger dropped"));
            }
        }
    }
}
