//! Indexer: the single writer that turns ledger events into mirror records.
//!
//! Follows an [EventSource] from the last checkpoint, applies entries to the
//! [MirrorStore] idempotently and in sequence order, saves a checkpoint after
//! every apply, and publishes live entries to the [Broadcaster]. Transport
//! failures reconnect with backoff; reorgs roll the mirror back; conflicts and
//! malformed payloads halt the loop.

use crate::broadcast::Broadcaster;
use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointStore};
use crate::config::{IndexerConfig, ReconnectionConfig};
use crate::entry::{LedgerEntry, MirrorRecord, SourcePosition};
use crate::live::LiveMessage;
use crate::mirror::{MirrorStore, StoreError, Upsert};
use crate::source::{EventSource, SourceError, SourceEvent, Subscription};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexerState {
    Starting,
    CatchingUp,
    Live,
    Reconnecting,
    Stopped,
}

/// Conditions that halt the indexer. Transport failures and reorgs never surface here.
#[derive(Debug, Error)]
pub enum IndexerError {
    /// The mirror holds a different entry at this sequence.
    #[error("mirror conflict at sequence {sequence}")]
    Conflict {
        sequence: u64,
        existing: Box<MirrorRecord>,
        incoming: Box<MirrorRecord>,
    },

    #[error("malformed ledger payload: {0:#}")]
    Malformed(anyhow::Error),

    /// An entry below the expected sequence that was never mirrored.
    #[error("unexpected sequence {got}, expected {expected}")]
    Sequence { expected: u64, got: u64 },

    #[error("mirror store: {0}")]
    Store(StoreError),

    #[error("checkpoint: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("indexer task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl From<StoreError> for IndexerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict {
                sequence,
                existing,
                incoming,
            } => IndexerError::Conflict {
                sequence,
                existing,
                incoming,
            },
            other => IndexerError::Store(other),
        }
    }
}

/// Exponential reconnect delay: doubles up to the max, plus random jitter.
#[derive(Debug, Clone)]
struct Backoff {
    initial: Duration,
    max: Duration,
    jitter: Duration,
    current: Duration,
}

impl Backoff {
    fn new(config: &ReconnectionConfig) -> Self {
        let initial = config.initial_backoff();
        Self {
            initial,
            max: config.max_backoff(),
            jitter: config.jitter(),
            current: initial,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);
        let jitter = if self.jitter.is_zero() {
            Duration::ZERO
        } else {
            rand::thread_rng().gen_range(Duration::ZERO..=self.jitter)
        };
        base + jitter
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// How a subscription ended without a fatal error.
enum Outcome {
    Shutdown,
    /// Transport dropped or the stream skipped a sequence; back off and resubscribe.
    Broken(String),
    /// Mirror rolled back; resubscribe from the new checkpoint at once.
    RolledBack,
}

enum Step {
    Applied,
    AlreadyMirrored,
    Gap { expected: u64, got: u64 },
}

/// Resolves once shutdown is requested or the requesting side is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Owned indexer instance; one per ledger.
pub struct Indexer<S, M, C> {
    source: S,
    mirror: Arc<M>,
    checkpoints: C,
    broadcaster: Broadcaster,
    config: IndexerConfig,
    state: watch::Sender<IndexerState>,
}

impl<S, M, C> Indexer<S, M, C>
where
    S: EventSource,
    M: MirrorStore,
    C: CheckpointStore,
{
    pub fn new(
        source: S,
        mirror: Arc<M>,
        checkpoints: C,
        broadcaster: Broadcaster,
        config: IndexerConfig,
    ) -> Self {
        let (state, _) = watch::channel(IndexerState::Starting);
        Self {
            source,
            mirror,
            checkpoints,
            broadcaster,
            config,
            state,
        }
    }

    pub fn state(&self) -> watch::Receiver<IndexerState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: IndexerState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            tracing::debug!(from = ?prev, to = ?next, "indexer state");
        }
    }

    /// Run until shutdown (Ok) or a fatal error (Err). Either way the state ends
    /// at Stopped and every observer is closed.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), IndexerError> {
        let result = self.drive(&mut shutdown).await;
        match &result {
            Ok(()) => tracing::info!("indexer stopped"),
            Err(e) => {
                tracing::error!(reason = %e, "indexer halted");
                self.broadcaster
                    .notify(LiveMessage::error(format!("indexer halted: {}", e)));
            }
        }
        self.set_state(IndexerState::Stopped);
        self.broadcaster.close_all();
        result
    }

    async fn drive(&self, shutdown: &mut watch::Receiver<bool>) -> Result<(), IndexerError> {
        self.set_state(IndexerState::Starting);
        let stored = self.checkpoints.load()?;
        let tip = self.mirror.tip()?;
        let mut checkpoint = Checkpoint::reconcile(stored.clone(), tip.as_ref());
        if stored.as_ref() != Some(&checkpoint) {
            self.checkpoints.save(&checkpoint)?;
        }
        tracing::info!(
            resume_after = ?checkpoint.last_applied_sequence,
            mirrored = self.mirror.len()?,
            "indexer starting"
        );

        let mut backoff = Backoff::new(&self.config.reconnection);
        loop {
            self.set_state(IndexerState::CatchingUp);
            let from = checkpoint.last_applied_position.clone();
            let subscribed = tokio::select! {
                biased;
                _ = shutdown_requested(shutdown) => return Ok(()),
                res = self.source.subscribe(from) => res,
            };
            let outcome = match subscribed {
                Ok(subscription) => {
                    self.follow(subscription, &mut checkpoint, &mut backoff, shutdown)
                        .await?
                }
                Err(SourceError::Transport(e)) => Outcome::Broken(format!("{:#}", e)),
                Err(SourceError::Malformed(e)) => return Err(IndexerError::Malformed(e)),
            };
            match outcome {
                Outcome::Shutdown => return Ok(()),
                Outcome::RolledBack => continue,
                Outcome::Broken(reason) => {
                    self.set_state(IndexerState::Reconnecting);
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        %reason,
                        delay_ms = delay.as_millis() as u64,
                        "event source lost, reconnecting"
                    );
                    tokio::select! {
                        biased;
                        _ = shutdown_requested(shutdown) => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn follow(
        &self,
        mut subscription: Box<dyn Subscription>,
        checkpoint: &mut Checkpoint,
        backoff: &mut Backoff,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Outcome, IndexerError> {
        let mut live = false;
        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown_requested(shutdown) => return Ok(Outcome::Shutdown),
                ev = subscription.next() => ev,
            };
            match event {
                Ok(SourceEvent::Entry(entry, position)) => {
                    match self.apply(entry, position, checkpoint, live)? {
                        Step::Applied => backoff.reset(),
                        Step::AlreadyMirrored => {}
                        Step::Gap { expected, got } => {
                            return Ok(Outcome::Broken(format!(
                                "sequence gap: expected {}, got {}",
                                expected, got
                            )));
                        }
                    }
                }
                Ok(SourceEvent::CaughtUp) => {
                    if !live {
                        live = true;
                        self.set_state(IndexerState::Live);
                        tracing::info!(tip = ?checkpoint.last_applied_sequence, "caught up, live");
                    }
                }
                Ok(SourceEvent::Reorg(point)) => {
                    self.roll_back(&point, checkpoint)?;
                    return Ok(Outcome::RolledBack);
                }
                Err(SourceError::Transport(e)) => return Ok(Outcome::Broken(format!("{:#}", e))),
                Err(SourceError::Malformed(e)) => return Err(IndexerError::Malformed(e)),
            }
        }
    }

    fn apply(
        &self,
        entry: LedgerEntry,
        position: SourcePosition,
        checkpoint: &mut Checkpoint,
        live: bool,
    ) -> Result<Step, IndexerError> {
        entry
            .validate()
            .map_err(|e| IndexerError::Malformed(anyhow::Error::new(e)))?;
        let expected = checkpoint.next_sequence(self.config.first_sequence);
        let sequence = entry.sequence;
        if sequence > expected {
            return Ok(Step::Gap {
                expected,
                got: sequence,
            });
        }
        let record = MirrorRecord::new(entry, position);
        if sequence < expected {
            return match self.mirror.get(sequence)? {
                Some(existing) if existing.entry == record.entry => {
                    tracing::debug!(seq = sequence, "redelivered, already mirrored");
                    Ok(Step::AlreadyMirrored)
                }
                Some(existing) => Err(IndexerError::Conflict {
                    sequence,
                    existing: Box::new(existing),
                    incoming: Box::new(record),
                }),
                None => Err(IndexerError::Sequence {
                    expected,
                    got: sequence,
                }),
            };
        }

        let upsert = self.mirror.upsert(&record)?;
        *checkpoint = Checkpoint::at(&record);
        self.checkpoints.save(checkpoint)?;
        tracing::debug!(
            seq = sequence,
            block = record.position.block_number,
            ?upsert,
            "applied"
        );
        if live && upsert == Upsert::Inserted {
            self.broadcaster.publish(record);
        }
        Ok(Step::Applied)
    }

    fn roll_back(
        &self,
        point: &SourcePosition,
        checkpoint: &mut Checkpoint,
    ) -> Result<(), IndexerError> {
        let removed = self.mirror.truncate_after(point)?;
        *checkpoint = Checkpoint::from_tip(self.mirror.tip()?.as_ref());
        self.checkpoints.save(checkpoint)?;
        tracing::warn!(
            block = point.block_number,
            removed,
            tip = ?checkpoint.last_applied_sequence,
            "reorg: mirror rolled back"
        );
        self.broadcaster.notify(LiveMessage::info(format!(
            "chain reorganized at block {}; {} memo(s) rolled back",
            point.block_number, removed
        )));
        Ok(())
    }
}

impl<S, M, C> Indexer<S, M, C>
where
    S: EventSource + 'static,
    M: MirrorStore + 'static,
    C: CheckpointStore + 'static,
{
    /// Run on a tokio task.
    pub fn spawn(self) -> IndexerHandle {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let state = self.state();
        let task = tokio::spawn(self.run(shutdown_rx));
        IndexerHandle {
            state,
            shutdown,
            task,
        }
    }
}

/// Control side of a spawned indexer. Dropping it requests shutdown.
#[derive(Debug)]
pub struct IndexerHandle {
    state: watch::Receiver<IndexerState>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<(), IndexerError>>,
}

impl IndexerHandle {
    pub fn state(&self) -> IndexerState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<IndexerState> {
        self.state.clone()
    }

    /// Wait until the indexer reaches `target`. False if it stopped first.
    pub async fn wait_for(&self, target: IndexerState) -> bool {
        let mut rx = self.state.clone();
        loop {
            let current = *rx.borrow_and_update();
            if current == target {
                return true;
            }
            if current == IndexerState::Stopped || rx.changed().await.is_err() {
                return false;
            }
        }
    }

    /// Request shutdown and wait for the loop to exit.
    pub async fn shutdown(self) -> Result<(), IndexerError> {
        let _ = self.shutdown.send(true);
        self.task.await?
    }

    /// Wait for the loop to exit on its own (fatal error).
    pub async fn join(self) -> Result<(), IndexerError> {
        let IndexerHandle { shutdown, task, .. } = self;
        let result = task.await;
        drop(shutdown);
        result?
    }
}
