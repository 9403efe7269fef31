//! Runtime knobs for copy, filtered replication and migration gating.

use std::time::Duration;

use clap::Args;

use crate::backoff::Backoff;

pub const DEFAULT_COPY_READER_PARALLELISM: usize = 4;
pub const DEFAULT_COPY_MIN_TABLE_SIZE_FOR_SPLIT: u64 = 1_000;
pub const DEFAULT_COPY_BATCH_ROWS: usize = 500;
pub const DEFAULT_COPY_MAX_TABLE_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF_BASE_MS: u64 = 50;
pub const DEFAULT_RETRY_BACKOFF_MAX_MS: u64 = 2_000;
pub const DEFAULT_PLAYER_POLL_INTERVAL_MS: u64 = 20;
pub const DEFAULT_PLAYER_BATCH_SIZE: usize = 64;
pub const DEFAULT_PLAYER_LAG_WINDOW: usize = 100;
pub const DEFAULT_WAIT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MIN_HEALTHY_DESTINATION_TABLETS: usize = 1;
pub const DEFAULT_MAX_MIGRATION_LAG_MS: u64 = 0;
pub const DEFAULT_VERIFY_MAX_REPORTED_DIFFS: usize = 10;

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct ReshardConfig {
    /// Concurrent primary-key chunk readers per large table during copy.
    #[arg(long, env = "HOLO_RESHARD_COPY_READER_PARALLELISM", default_value_t = DEFAULT_COPY_READER_PARALLELISM)]
    pub copy_reader_parallelism: usize,

    /// Tables with fewer rows are copied by a single reader.
    #[arg(long, env = "HOLO_RESHARD_COPY_MIN_TABLE_SIZE_FOR_SPLIT", default_value_t = DEFAULT_COPY_MIN_TABLE_SIZE_FOR_SPLIT)]
    pub copy_min_table_size_for_split: u64,

    /// Rows per destination write batch.
    #[arg(long, env = "HOLO_RESHARD_COPY_BATCH_ROWS", default_value_t = DEFAULT_COPY_BATCH_ROWS)]
    pub copy_batch_rows: usize,

    /// Extra attempts for a table copy that hit a transient failure.
    #[arg(long, env = "HOLO_RESHARD_COPY_MAX_TABLE_RETRIES", default_value_t = DEFAULT_COPY_MAX_TABLE_RETRIES)]
    pub copy_max_table_retries: u32,

    #[arg(long, env = "HOLO_RESHARD_RETRY_BACKOFF_BASE_MS", default_value_t = DEFAULT_RETRY_BACKOFF_BASE_MS)]
    pub retry_backoff_base_ms: u64,

    #[arg(long, env = "HOLO_RESHARD_RETRY_BACKOFF_MAX_MS", default_value_t = DEFAULT_RETRY_BACKOFF_MAX_MS)]
    pub retry_backoff_max_ms: u64,

    /// Idle delay between change-log polls once a player has caught up (ms).
    #[arg(long, env = "HOLO_RESHARD_PLAYER_POLL_INTERVAL_MS", default_value_t = DEFAULT_PLAYER_POLL_INTERVAL_MS)]
    pub player_poll_interval_ms: u64,

    /// Source transactions fetched per poll.
    #[arg(long, env = "HOLO_RESHARD_PLAYER_BATCH_SIZE", default_value_t = DEFAULT_PLAYER_BATCH_SIZE)]
    pub player_batch_size: usize,

    /// Number of recent lag samples behind the max/avg lag figures.
    #[arg(long, env = "HOLO_RESHARD_PLAYER_LAG_WINDOW", default_value_t = DEFAULT_PLAYER_LAG_WINDOW)]
    pub player_lag_window: usize,

    /// Upper bound for every wait loop (copy, catch-up, lag) (ms).
    #[arg(long, env = "HOLO_RESHARD_WAIT_TIMEOUT_MS", default_value_t = DEFAULT_WAIT_TIMEOUT_MS)]
    pub wait_timeout_ms: u64,

    /// Healthy tablets of the migrated role each newly serving shard needs across the migrated cells.
    #[arg(long, env = "HOLO_RESHARD_MIN_HEALTHY_DESTINATION_TABLETS", default_value_t = DEFAULT_MIN_HEALTHY_DESTINATION_TABLETS)]
    pub min_healthy_destination_tablets: usize,

    /// Refuse migration while filtered replication lags more than this; `0` disables the check.
    #[arg(long, env = "HOLO_RESHARD_MAX_MIGRATION_LAG_MS", default_value_t = DEFAULT_MAX_MIGRATION_LAG_MS)]
    pub max_migration_lag_ms: u64,

    /// Primary keys listed per table and per kind in a mismatch report.
    #[arg(long, env = "HOLO_RESHARD_VERIFY_MAX_REPORTED_DIFFS", default_value_t = DEFAULT_VERIFY_MAX_REPORTED_DIFFS)]
    pub verify_max_reported_diffs: usize,
}

impl Default for ReshardConfig {
    fn default() -> Self {
        Self {
            copy_reader_parallelism: DEFAULT_COPY_READER_PARALLELISM,
            copy_min_table_size_for_split: DEFAULT_COPY_MIN_TABLE_SIZE_FOR_SPLIT,
            copy_batch_rows: DEFAULT_COPY_BATCH_ROWS,
            copy_max_table_retries: DEFAULT_COPY_MAX_TABLE_RETRIES,
            retry_backoff_base_ms: DEFAULT_RETRY_BACKOFF_BASE_MS,
            retry_backoff_max_ms: DEFAULT_RETRY_BACKOFF_MAX_MS,
            player_poll_interval_ms: DEFAULT_PLAYER_POLL_INTERVAL_MS,
            player_batch_size: DEFAULT_PLAYER_BATCH_SIZE,
            player_lag_window: DEFAULT_PLAYER_LAG_WINDOW,
            wait_timeout_ms: DEFAULT_WAIT_TIMEOUT_MS,
            min_healthy_destination_tablets: DEFAULT_MIN_HEALTHY_DESTINATION_TABLETS,
            max_migration_lag_ms: DEFAULT_MAX_MIGRATION_LAG_MS,
            verify_max_reported_diffs: DEFAULT_VERIFY_MAX_REPORTED_DIFFS,
        }
    }
}

impl ReshardConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.retry_backoff_base_ms),
            Duration::from_millis(self.retry_backoff_max_ms),
        )
    }

    pub fn player_poll_interval(&self) -> Duration {
        Duration::from_millis(self.player_poll_interval_ms.max(1))
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn max_migration_lag(&self) -> Option<Duration> {
        (self.max_migration_lag_ms > 0).then(|| Duration::from_millis(self.max_migration_lag_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        config: ReshardConfig,
    }

    #[test]
    fn parsed_defaults_match_default_impl() {
        let cli = Cli::parse_from(["reshardctl"]);
        assert_eq!(cli.config, ReshardConfig::default());
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::parse_from([
            "reshardctl",
            "--copy-reader-parallelism",
            "8",
            "--max-migration-lag-ms",
            "250",
        ]);
        assert_eq!(cli.config.copy_reader_parallelism, 8);
        assert_eq!(cli.config.max_migration_lag(), Some(Duration::from_millis(250)));
    }
}
