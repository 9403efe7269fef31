//! Filtered replication: replays a source shard's change log onto a
//! destination, keeping only changes whose keyspace id the destination owns.
//!
//! One player runs per (destination shard, source reference). Each source
//! transaction is applied as one destination batch together with the
//! checkpoint, so a restart resumes exactly after the last applied position.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::config::ReshardConfig;
use crate::error::{ReshardError, Result};
use crate::keyrange::KeyRange;
use crate::row::{now_unix_ms, BinlogTransaction, Position, RowChange};
use crate::tablet::TabletConn;
use crate::topology::SourceShard;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PlayerKey {
    pub keyspace: String,
    pub shard: String,
    pub uid: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerState {
    /// Spawned, checkpoint not read yet.
    Starting,
    Running,
    Retrying,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerStatus {
    pub key: PlayerKey,
    pub source_shard: String,
    pub state: PlayerState,
    /// Last source position applied (or skipped) on the destination.
    pub position: Position,
    pub transactions_applied: u64,
    pub statements_applied: u64,
    /// Source transactions with no change for this destination.
    pub transactions_filtered: u64,
    pub retries: u64,
    /// True once a poll found nothing newer than `position`.
    pub caught_up: bool,
    pub last_lag_ms: u64,
    pub max_lag_ms: u64,
    pub avg_lag_ms: f64,
    pub error: Option<String>,
    #[serde(skip)]
    lag_window: VecDeque<u64>,
}

impl PlayerStatus {
    fn new(key: PlayerKey, source_shard: String) -> Self {
        Self {
            key,
            source_shard,
            state: PlayerState::Starting,
            position: 0,
            transactions_applied: 0,
            statements_applied: 0,
            transactions_filtered: 0,
            retries: 0,
            caught_up: false,
            last_lag_ms: 0,
            max_lag_ms: 0,
            avg_lag_ms: 0.0,
            error: None,
            lag_window: VecDeque::new(),
        }
    }

    fn record_lag(&mut self, lag_ms: u64, window: usize) {
        self.last_lag_ms = lag_ms;
        self.lag_window.push_back(lag_ms);
        while self.lag_window.len() > window.max(1) {
            self.lag_window.pop_front();
        }
        self.max_lag_ms = self.lag_window.iter().copied().max().unwrap_or(0);
        self.avg_lag_ms =
            self.lag_window.iter().sum::<u64>() as f64 / self.lag_window.len() as f64;
    }
}

#[derive(Debug, Clone)]
pub struct PlayerOptions {
    pub batch_size: usize,
    pub poll_interval: std::time::Duration,
    pub lag_window: usize,
    pub backoff: Backoff,
}

impl PlayerOptions {
    pub fn from_config(config: &ReshardConfig) -> Self {
        Self {
            batch_size: config.player_batch_size.max(1),
            poll_interval: config.player_poll_interval(),
            lag_window: config.player_lag_window,
            backoff: config.backoff(),
        }
    }
}

/// Everything needed to run one player.
#[derive(Clone)]
pub struct PlayerSpec {
    pub key: PlayerKey,
    pub reference: SourceShard,
    pub destination_range: KeyRange,
    pub source: Arc<dyn TabletConn>,
    pub destination: Arc<dyn TabletConn>,
}

/// Keep only the changes of `txn` the destination owns.
///
/// A change without a keyspace id cannot be routed and fails the whole
/// transaction rather than being dropped.
pub fn filter_transaction(
    txn: &BinlogTransaction,
    destination_range: &KeyRange,
    reference: &SourceShard,
) -> Result<Vec<RowChange>> {
    let mut kept = Vec::new();
    for change in &txn.changes {
        let keyspace_id = change.keyspace_id();
        if keyspace_id.is_empty() {
            return Err(ReshardError::Corruption(format!(
                "change at {}:{} on table {} has no keyspace id",
                reference.shard,
                txn.position,
                change.table()
            )));
        }
        if !reference.tables.is_empty() && !reference.tables.iter().any(|t| t == change.table()) {
            continue;
        }
        if destination_range.contains(keyspace_id) && reference.key_range.contains(keyspace_id) {
            kept.push(change.clone());
        }
    }
    Ok(kept)
}

pub struct BinlogPlayer {
    spec: PlayerSpec,
    options: PlayerOptions,
    status: Arc<Mutex<PlayerStatus>>,
}

impl BinlogPlayer {
    pub fn new(spec: PlayerSpec, options: PlayerOptions) -> Self {
        let status = PlayerStatus::new(spec.key.clone(), spec.reference.shard.clone());
        Self {
            spec,
            options,
            status: Arc::new(Mutex::new(status)),
        }
    }

    pub fn status(&self) -> PlayerStatus {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn with_status(&self, f: impl FnOnce(&mut PlayerStatus)) {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut status);
    }

    /// Replay until `until` has been applied, or until `stop` flips when `until` is `None`.
    ///
    /// Returns the final state; a `Failed` state carries its error in the status.
    pub async fn play(&self, until: Option<Position>, mut stop: watch::Receiver<bool>) -> PlayerState {
        let state = match self.play_inner(until, &mut stop).await {
            Ok(()) => PlayerState::Stopped,
            Err(err) => {
                error!(player = ?self.spec.key, error = %err, "filtered replication failed");
                self.with_status(|status| status.error = Some(err.to_string()));
                PlayerState::Failed
            }
        };
        self.with_status(|status| status.state = state);
        state
    }

    /// Replay synchronously up to and including `position`.
    pub async fn play_until(&self, position: Position) -> Result<Position> {
        let (_stop_tx, mut stop_rx) = watch::channel(false);
        let result = self.play_inner(Some(position), &mut stop_rx).await;
        self.with_status(|status| {
            status.state = if result.is_ok() {
                PlayerState::Stopped
            } else {
                PlayerState::Failed
            };
            if let Err(err) = &result {
                status.error = Some(err.to_string());
            }
        });
        result.map(|_| self.status().position)
    }

    async fn play_inner(&self, until: Option<Position>, stop: &mut watch::Receiver<bool>) -> Result<()> {
        let key = &self.spec.key;
        let mut position = match self.retry_transient(stop, || {
            self.spec.destination.filtered_checkpoint(key.uid)
        })
        .await?
        {
            Some(Some(position)) => position,
            Some(None) => {
                warn!(player = ?key, "no checkpoint recorded; replaying the source log from the start");
                0
            }
            None => return Ok(()),
        };
        self.with_status(|status| {
            status.position = position;
            status.state = PlayerState::Running;
            status.error = None;
        });
        info!(player = ?key, source = %self.spec.reference.shard, position, "filtered replication started");

        loop {
            if until.is_some_and(|until| position >= until) || *stop.borrow() {
                break;
            }
            let Some(txns) = self
                .retry_transient(stop, || {
                    self.spec.source.binlog_after(position, self.options.batch_size)
                })
                .await?
            else {
                break;
            };
            if txns.is_empty() {
                self.with_status(|status| {
                    status.caught_up = true;
                    status.last_lag_ms = 0;
                });
                if until.is_some() {
                    // The source has not reached `until` yet.
                    tokio::time::sleep(self.options.poll_interval).await;
                    continue;
                }
                let stop_requested = tokio::select! {
                    _ = tokio::time::sleep(self.options.poll_interval) => false,
                    changed = stop.changed() => changed.is_err() || *stop.borrow(),
                };
                if stop_requested {
                    break;
                }
                continue;
            }
            for txn in txns {
                if until.is_some_and(|until| txn.position > until) {
                    break;
                }
                if txn.position <= position {
                    continue;
                }
                if txn.position != position + 1 {
                    debug!(player = ?key, expected = position + 1, got = txn.position, "source log has a hole");
                }
                let changes = filter_transaction(&txn, &self.spec.destination_range, &self.spec.reference)?;
                let statements = changes.len() as u64;
                let applied = self
                    .retry_transient(stop, || {
                        self.spec
                            .destination
                            .apply_filtered(key.uid, txn.position, changes.clone())
                    })
                    .await?;
                let Some(applied) = applied else {
                    return Ok(());
                };
                position = txn.position;
                let lag_ms = now_unix_ms().saturating_sub(txn.timestamp_ms);
                let window = self.options.lag_window;
                self.with_status(|status| {
                    status.position = position;
                    status.caught_up = false;
                    status.state = PlayerState::Running;
                    if applied && statements > 0 {
                        status.transactions_applied += 1;
                        status.statements_applied += statements;
                    } else if applied {
                        status.transactions_filtered += 1;
                    }
                    status.record_lag(lag_ms, window);
                });
                if *stop.borrow() {
                    break;
                }
            }
        }
        info!(player = ?key, position, "filtered replication stopped");
        Ok(())
    }

    /// Run `op`, retrying transient failures with backoff.
    ///
    /// Returns `Ok(None)` if a stop request arrived while waiting to retry.
    async fn retry_transient<T, F, Fut>(&self, stop: &mut watch::Receiver<bool>, mut op: F) -> Result<Option<T>>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut failures = 0u32;
        loop {
            match op().await {
                Ok(value) => {
                    if failures > 0 {
                        self.with_status(|status| {
                            status.state = PlayerState::Running;
                            status.error = None;
                        });
                    }
                    return Ok(Some(value));
                }
                Err(err) if err.is_retryable() => {
                    failures = failures.saturating_add(1);
                    let delay = self.options.backoff.delay(&self.spec.key, failures);
                    warn!(player = ?self.spec.key, error = %err, failures, ?delay, "filtered replication retrying");
                    self.with_status(|status| {
                        status.state = PlayerState::Retrying;
                        status.retries += 1;
                        status.error = Some(err.to_string());
                    });
                    if *stop.borrow() {
                        return Ok(None);
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = stop.changed() => return Ok(None),
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}

struct PlayerHandle {
    player: Arc<BinlogPlayer>,
    stop: watch::Sender<bool>,
    task: JoinHandle<PlayerState>,
}

/// Running players, reconciled against the source references in topology.
#[derive(Clone, Default)]
pub struct PlayerMap {
    inner: Arc<tokio::sync::Mutex<PlayerMapInner>>,
}

#[derive(Default)]
struct PlayerMapInner {
    players: BTreeMap<PlayerKey, PlayerHandle>,
    paused: BTreeSet<(String, String)>,
}

impl PlayerMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start players in `desired` that are not running and stop the ones not listed.
    ///
    /// Players of paused shards are left alone. A failed player stays in the
    /// map so its error remains visible.
    pub async fn reconcile(&self, desired: Vec<PlayerSpec>, options: &PlayerOptions) {
        let mut inner = self.inner.lock().await;
        let wanted = desired
            .iter()
            .map(|spec| spec.key.clone())
            .collect::<BTreeSet<_>>();
        let stale = inner
            .players
            .keys()
            .filter(|key| !wanted.contains(*key))
            .cloned()
            .collect::<Vec<_>>();
        for key in stale {
            if let Some(handle) = inner.players.remove(&key) {
                stop_handle(&key, handle).await;
            }
        }
        for spec in desired {
            let shard_key = (spec.key.keyspace.clone(), spec.key.shard.clone());
            if inner.paused.contains(&shard_key) || inner.players.contains_key(&spec.key) {
                continue;
            }
            let key = spec.key.clone();
            let handle = spawn_player(spec, options.clone());
            inner.players.insert(key, handle);
        }
    }

    /// Gracefully stop every player of a destination shard and keep it stopped
    /// until `resume_shard`.
    pub async fn pause_shard(&self, keyspace: &str, shard: &str) -> Vec<PlayerStatus> {
        let mut inner = self.inner.lock().await;
        inner
            .paused
            .insert((keyspace.to_string(), shard.to_string()));
        let keys = inner
            .players
            .keys()
            .filter(|k| k.keyspace == keyspace && k.shard == shard)
            .cloned()
            .collect::<Vec<_>>();
        let mut stopped = Vec::new();
        for key in keys {
            if let Some(handle) = inner.players.remove(&key) {
                stopped.push(stop_handle(&key, handle).await);
            }
        }
        stopped
    }

    pub async fn resume_shard(&self, keyspace: &str, shard: &str) {
        self.inner
            .lock()
            .await
            .paused
            .remove(&(keyspace.to_string(), shard.to_string()));
    }

    pub async fn statuses(&self, keyspace: &str, shard: &str) -> Vec<PlayerStatus> {
        let inner = self.inner.lock().await;
        inner
            .players
            .iter()
            .filter(|(k, _)| k.keyspace == keyspace && k.shard == shard)
            .map(|(_, handle)| handle.player.status())
            .collect()
    }

    pub async fn all_statuses(&self) -> Vec<PlayerStatus> {
        let inner = self.inner.lock().await;
        inner
            .players
            .values()
            .map(|handle| handle.player.status())
            .collect()
    }

    pub async fn stop_all(&self) {
        let mut inner = self.inner.lock().await;
        let players = std::mem::take(&mut inner.players);
        for (key, handle) in players {
            stop_handle(&key, handle).await;
        }
    }
}

fn spawn_player(spec: PlayerSpec, options: PlayerOptions) -> PlayerHandle {
    let player = Arc::new(BinlogPlayer::new(spec, options));
    let (stop_tx, stop_rx) = watch::channel(false);
    let task_player = player.clone();
    let task = tokio::spawn(async move { task_player.play(None, stop_rx).await });
    PlayerHandle {
        player,
        stop: stop_tx,
        task,
    }
}

async fn stop_handle(key: &PlayerKey, handle: PlayerHandle) -> PlayerStatus {
    let _ = handle.stop.send(true);
    if let Err(err) = handle.task.await {
        warn!(player = ?key, error = ?err, "player task ended abnormally");
    }
    handle.player.status()
}
