//! Initial bulk copy of source rows into destination shards.
//!
//! The copy captures each source's change-log position before it scans, so
//! filtered replication started from that position converges on top of the
//! copied rows. Destination tables are emptied first, so a whole job can be
//! re-run, and rows are written as upserts, which makes a retried table copy
//! harmless.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::config::ReshardConfig;
use crate::error::{ReshardError, Result};
use crate::keyrange::{check_tiling_of, KeyRange};
use crate::row::{now_unix_ms, Position, Row};
use crate::tablet::TabletConn;

/// One side of a copy: a shard and the tablet used to reach it.
#[derive(Clone)]
pub struct CopyEndpoint {
    pub shard: String,
    pub key_range: KeyRange,
    pub tablet: Arc<dyn TabletConn>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyOptions {
    pub reader_parallelism: usize,
    pub min_table_size_for_split: u64,
    pub batch_rows: usize,
    pub max_table_retries: u32,
    pub backoff: Backoff,
    pub exclude_tables: Vec<String>,
}

impl CopyOptions {
    pub fn from_config(config: &ReshardConfig, exclude_tables: Vec<String>) -> Self {
        Self {
            reader_parallelism: config.copy_reader_parallelism.max(1),
            min_table_size_for_split: config.copy_min_table_size_for_split,
            batch_rows: config.copy_batch_rows.max(1),
            max_table_retries: config.copy_max_table_retries,
            backoff: config.backoff(),
            exclude_tables,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        self != JobState::Running
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableProgress {
    pub source_shard: String,
    pub table: String,
    pub rows_copied: u64,
    pub attempts: u32,
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyStatus {
    pub state: JobState,
    pub started_unix_ms: u64,
    pub finished_unix_ms: Option<u64>,
    pub rows_copied: u64,
    pub tables: Vec<TableProgress>,
    /// Source change-log position captured before scanning, by source shard.
    pub start_positions: BTreeMap<String, Position>,
    pub error: Option<String>,
}

/// Hook run after every row landed, before the job reports success.
#[async_trait]
pub trait CopyCompletion: Send + Sync {
    async fn copy_completed(&self, start_positions: &BTreeMap<String, Position>) -> Result<()>;
}

/// Check the shape of a copy before any data moves.
///
/// Sources must be contiguous and destinations must tile exactly the range
/// the sources cover, so every copied row has exactly one home.
pub fn validate_plan(sources: &[CopyEndpoint], destinations: &[CopyEndpoint]) -> Result<()> {
    if sources.is_empty() || destinations.is_empty() {
        return Err(ReshardError::Precondition(
            "a copy needs at least one source and one destination".into(),
        ));
    }
    let mut source_ranges = sources.iter().map(|s| s.key_range.clone()).collect::<Vec<_>>();
    source_ranges.sort();
    let covered = KeyRange {
        start: source_ranges[0].start.clone(),
        end: source_ranges[source_ranges.len() - 1].end.clone(),
    };
    check_tiling_of(&covered, &source_ranges).map_err(|err| {
        ReshardError::Precondition(format!("source shards are not contiguous: {err}"))
    })?;
    let dest_ranges = destinations
        .iter()
        .map(|d| d.key_range.clone())
        .collect::<Vec<_>>();
    check_tiling_of(&covered, &dest_ranges).map_err(|err| {
        ReshardError::Precondition(format!(
            "destination shards do not tile source range {covered}: {err}"
        ))
    })?;
    Ok(())
}

/// Handle to a running copy.
pub struct CopyJob {
    status: Arc<Mutex<CopyStatus>>,
    cancel: watch::Sender<bool>,
    done: watch::Receiver<bool>,
}

impl CopyJob {
    /// Validate the plan and start copying in the background.
    pub fn spawn(
        sources: Vec<CopyEndpoint>,
        destinations: Vec<CopyEndpoint>,
        options: CopyOptions,
        completion: Option<Arc<dyn CopyCompletion>>,
    ) -> Result<Self> {
        validate_plan(&sources, &destinations)?;
        let status = Arc::new(Mutex::new(CopyStatus {
            state: JobState::Running,
            started_unix_ms: now_unix_ms(),
            finished_unix_ms: None,
            rows_copied: 0,
            tables: Vec::new(),
            start_positions: BTreeMap::new(),
            error: None,
        }));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);

        let run = CopyRun {
            sources,
            destinations,
            options,
            status: status.clone(),
            cancel: cancel_rx,
        };
        tokio::spawn(async move {
            let outcome = match run.execute().await {
                Ok(JobState::Succeeded) => match completion {
                    Some(hook) => {
                        let positions = run.status().start_positions;
                        hook.copy_completed(&positions)
                            .await
                            .map(|_| JobState::Succeeded)
                    }
                    None => Ok(JobState::Succeeded),
                },
                other => other,
            };
            run.finish(outcome);
            let _ = done_tx.send(true);
        });

        Ok(Self {
            status,
            cancel: cancel_tx,
            done: done_rx,
        })
    }

    pub fn status(&self) -> CopyStatus {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Ask the job to stop at the next table boundary.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// Wait for a terminal state. Times out with a transient error.
    pub async fn wait(&self, timeout: Duration) -> Result<CopyStatus> {
        let mut done = self.done.clone();
        let waited = tokio::time::timeout(timeout, done.wait_for(|done| *done))
            .await
            .map(|r| r.map(|_| ()));
        match waited {
            Ok(Ok(())) => Ok(self.status()),
            Ok(Err(_)) => {
                let status = self.status();
                if status.state.is_terminal() {
                    Ok(status)
                } else {
                    Err(ReshardError::Transient("copy job task exited without a result".into()))
                }
            }
            Err(_) => Err(ReshardError::Transient(format!(
                "copy job still running after {timeout:?} ({} rows copied)",
                self.status().rows_copied
            ))),
        }
    }
}

struct CopyRun {
    sources: Vec<CopyEndpoint>,
    destinations: Vec<CopyEndpoint>,
    options: CopyOptions,
    status: Arc<Mutex<CopyStatus>>,
    cancel: watch::Receiver<bool>,
}

impl CopyRun {
    fn status(&self) -> CopyStatus {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn with_status(&self, f: impl FnOnce(&mut CopyStatus)) {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut status);
    }

    fn finish(&self, outcome: Result<JobState>) {
        let (state, message) = match outcome {
            Ok(state) => (state, None),
            Err(err) => (JobState::Failed, Some(err.to_string())),
        };
        match state {
            JobState::Succeeded => info!(rows = self.status().rows_copied, "data copy finished"),
            JobState::Cancelled => info!("data copy cancelled"),
            _ => error!(error = ?message, "data copy failed"),
        }
        self.with_status(|status| {
            status.state = state;
            status.error = message;
            status.finished_unix_ms = Some(now_unix_ms());
        });
    }

    async fn retry<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut failures = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && failures < self.options.max_table_retries => {
                    failures += 1;
                    let delay = self.options.backoff.delay(label, failures);
                    warn!(error = %err, op = label, failures, ?delay, "copy step failed; retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn execute(&self) -> Result<JobState> {
        debug!(
            sources = ?self.sources.iter().map(|s| s.shard.as_str()).collect::<Vec<_>>(),
            destinations = ?self.destinations.iter().map(|d| d.shard.as_str()).collect::<Vec<_>>(),
            batch_rows = self.options.batch_rows,
            "copy plan"
        );
        let excluded = self
            .options
            .exclude_tables
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>();

        // Rows left by an earlier attempt may since have been deleted at the
        // source, and nothing would replay those deletes.
        for dest in &self.destinations {
            let tables = self
                .retry("list_tables", || dest.tablet.list_tables())
                .await?
                .into_iter()
                .filter(|t| !excluded.contains(t))
                .collect::<Vec<_>>();
            for table in tables {
                let cleared = self
                    .retry("clear_copied_rows", || dest.tablet.clear_copied_rows(&table))
                    .await?;
                if cleared > 0 {
                    info!(
                        destination = %dest.shard,
                        table = %table,
                        rows = cleared,
                        "cleared rows of an earlier copy"
                    );
                }
            }
        }

        for source in &self.sources {
            let position = self
                .retry("current_position", || source.tablet.current_position())
                .await?;
            self.with_status(|status| {
                status.start_positions.insert(source.shard.clone(), position);
            });
        }

        for source in &self.sources {
            let tables = self
                .retry("list_tables", || source.tablet.list_tables())
                .await?
                .into_iter()
                .filter(|t| !excluded.contains(t))
                .collect::<Vec<_>>();
            for table in tables {
                if *self.cancel.borrow() {
                    return Ok(JobState::Cancelled);
                }
                self.copy_table_with_retries(source, &table).await?;
            }
        }
        Ok(JobState::Succeeded)
    }

    async fn copy_table_with_retries(&self, source: &CopyEndpoint, table: &str) -> Result<()> {
        let idx = {
            let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
            status.tables.push(TableProgress {
                source_shard: source.shard.clone(),
                table: table.to_string(),
                rows_copied: 0,
                attempts: 0,
                done: false,
            });
            status.tables.len() - 1
        };
        let mut failures = 0u32;
        loop {
            self.with_status(|status| status.tables[idx].attempts += 1);
            match self.copy_table(source, table, idx).await {
                Ok(rows) => {
                    debug!(table, source = %source.shard, rows, "table copied");
                    self.with_status(|status| status.tables[idx].done = true);
                    return Ok(());
                }
                Err(err) if err.is_retryable() && failures < self.options.max_table_retries => {
                    failures += 1;
                    let delay = self.options.backoff.delay((source.shard.as_str(), table), failures);
                    warn!(
                        error = %err,
                        table,
                        source = %source.shard,
                        failures,
                        ?delay,
                        "table copy failed; retrying"
                    );
                    // Rows of the failed attempt are rewritten, not double counted.
                    self.with_status(|status| {
                        status.rows_copied -= status.tables[idx].rows_copied;
                        status.tables[idx].rows_copied = 0;
                    });
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    return Err(match err {
                        ReshardError::Transient(msg) => ReshardError::Transient(format!(
                            "table {table} from {} failed after {} attempts: {msg}",
                            source.shard,
                            failures + 1
                        )),
                        other => other,
                    })
                }
            }
        }
    }

    async fn copy_table(&self, source: &CopyEndpoint, table: &str, idx: usize) -> Result<u64> {
        for dest in &self.destinations {
            dest.tablet.create_table(table).await?;
        }
        let row_count = source.tablet.row_count(table).await?;
        let mut bounds = Vec::new();
        if self.options.reader_parallelism > 1 && row_count >= self.options.min_table_size_for_split {
            let points = source
                .tablet
                .pk_split_points(table, self.options.reader_parallelism)
                .await?;
            let mut lower = None;
            for point in points {
                bounds.push((lower.take(), Some(point.clone())));
                lower = Some(point);
            }
            bounds.push((lower, None));
        } else {
            bounds.push((None, None));
        }

        let mut chunks = FuturesUnordered::new();
        for (from, end) in bounds {
            chunks.push(self.copy_chunk(source, table, idx, from, end));
        }
        let mut total = 0u64;
        while let Some(result) = chunks.next().await {
            total += result?;
        }
        Ok(total)
    }

    async fn copy_chunk(
        &self,
        source: &CopyEndpoint,
        table: &str,
        idx: usize,
        mut from: Option<Vec<u8>>,
        end: Option<Vec<u8>>,
    ) -> Result<u64> {
        let mut copied = 0u64;
        loop {
            let rows = source
                .tablet
                .scan_rows(table, from.clone(), end.clone(), self.options.batch_rows)
                .await?;
            let Some(last) = rows.last() else {
                break;
            };
            // Smallest key strictly after the last one seen.
            let mut next = last.pk.clone();
            next.push(0);
            let page_len = rows.len();

            for (dest_idx, batch) in self.route(table, rows)? {
                self.destinations[dest_idx]
                    .tablet
                    .apply_copied_rows(table, batch)
                    .await?;
            }
            copied += page_len as u64;
            self.with_status(|status| {
                status.rows_copied += page_len as u64;
                status.tables[idx].rows_copied += page_len as u64;
            });
            if page_len < self.options.batch_rows {
                break;
            }
            from = Some(next);
        }
        Ok(copied)
    }

    fn route(&self, table: &str, rows: Vec<Row>) -> Result<BTreeMap<usize, Vec<Row>>> {
        let mut out: BTreeMap<usize, Vec<Row>> = BTreeMap::new();
        for row in rows {
            let mut owners = self
                .destinations
                .iter()
                .enumerate()
                .filter(|(_, d)| d.key_range.contains(&row.keyspace_id))
                .map(|(i, _)| i);
            let (Some(owner), None) = (owners.next(), owners.next()) else {
                return Err(ReshardError::Corruption(format!(
                    "row {} of {table} with keyspace id {} does not route to exactly one destination",
                    hex::encode(&row.pk),
                    hex::encode(&row.keyspace_id)
                )));
            };
            out.entry(owner).or_default().push(row);
        }
        Ok(out)
    }
}
