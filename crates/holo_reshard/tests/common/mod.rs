//! Shared helpers for integration tests.
//!
//! Builds a two-cell `test_keyspace` whose shards are fjall-backed local
//! tablets in a temp dir: per shard a primary and replica and rdonly in
//! `test_nj`, plus a replica and rdonly in `test_ny`.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use holo_reshard::binlog_player::PlayerStatus;
use holo_reshard::coordinator::{CreateKeyspace, DataCopyRequest};
use holo_reshard::copier::{CopyStatus, JobState};
use holo_reshard::keyrange::{keyspace_id_from_u64, KeyRange};
use holo_reshard::local_tablet::{LocalShard, LocalTablet};
use holo_reshard::row::{Position, Row, RowChange};
use holo_reshard::topology::ServingRole;
use holo_reshard::{
    Coordinator, KeyspaceIdType, MigrationOutcome, MigrationRequest, ReshardConfig, Result,
    TabletAlias, TabletConn, TabletRegistry, TabletType, TopoStore,
};
use tempfile::TempDir;

pub const KEYSPACE: &str = "test_keyspace";
pub const CELLS: [&str; 2] = ["test_nj", "test_ny"];
pub const TABLES: [&str; 2] = ["resharding1", "resharding2"];
pub const WAIT: Duration = Duration::from_secs(20);

/// Tablet layout of every shard: (cell, type).
const LAYOUT: [(&str, TabletType); 5] = [
    ("test_nj", TabletType::Primary),
    ("test_nj", TabletType::Replica),
    ("test_nj", TabletType::Rdonly),
    ("test_ny", TabletType::Replica),
    ("test_ny", TabletType::Rdonly),
];

/// Fast timings so streaming tests finish quickly.
pub fn test_config() -> ReshardConfig {
    ReshardConfig {
        retry_backoff_base_ms: 5,
        retry_backoff_max_ms: 50,
        player_poll_interval_ms: 5,
        wait_timeout_ms: 20_000,
        copy_batch_rows: 64,
        ..ReshardConfig::default()
    }
}

pub struct Cluster {
    pub dir: TempDir,
    pub coordinator: Coordinator,
    tablets: BTreeMap<TabletAlias, Arc<LocalTablet>>,
    shards: BTreeMap<String, Vec<TabletAlias>>,
    next_uid: u32,
}

impl Cluster {
    pub async fn new(config: ReshardConfig) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let topo = TopoStore::load_or_init(dir.path().join("topo").join("topology.json"))
            .expect("topology store");
        let coordinator = Coordinator::new(topo, TabletRegistry::new(), config);
        coordinator
            .create_keyspace(&CreateKeyspace {
                name: KEYSPACE.into(),
                sharding_column_name: "custom_sharding_key".into(),
                sharding_column_type: KeyspaceIdType::Uint64,
                split_shard_count: 0,
                cells: CELLS.iter().map(|c| c.to_string()).collect(),
            })
            .expect("create keyspace");
        Self {
            dir,
            coordinator,
            tablets: BTreeMap::new(),
            shards: BTreeMap::new(),
            next_uid: 100,
        }
    }

    /// Create `shard` with its five tablets and the test tables.
    pub async fn add_shard(&mut self, shard: &str) {
        let key_range = KeyRange::parse(shard).expect("keyrange");
        let storage = LocalShard::open(self.dir.path().join("data").join(shard), key_range)
            .expect("open shard storage");
        let mut aliases = Vec::new();
        for (cell, tablet_type) in LAYOUT {
            let alias = TabletAlias::new(cell, self.next_uid);
            self.next_uid += 1;
            self.coordinator
                .init_tablet(alias.clone(), KEYSPACE, shard, tablet_type)
                .await
                .expect("init tablet");
            let tablet = storage.tablet(alias.clone(), tablet_type);
            self.coordinator
                .register_tablet_conn(tablet.clone() as Arc<dyn TabletConn>)
                .await;
            self.tablets.insert(alias.clone(), tablet);
            aliases.push(alias);
        }
        self.shards.insert(shard.to_string(), aliases);
    }

    /// Create the test tables on a shard (shared by all its tablets).
    pub async fn create_tables(&self, shard: &str) {
        for table in TABLES {
            self.primary(shard).create_table(table).await.expect("create table");
        }
    }

    /// `-80` and `80-` serving with tables and a published graph.
    pub async fn with_initial_shards(config: ReshardConfig) -> Self {
        let mut cluster = Self::new(config).await;
        for shard in ["-80", "80-"] {
            cluster.add_shard(shard).await;
            cluster.create_tables(shard).await;
        }
        cluster
            .coordinator
            .rebuild_keyspace_graph(KEYSPACE, &[])
            .await
            .expect("rebuild graph");
        cluster
    }

    pub fn tablet(&self, shard: &str, cell: &str, tablet_type: TabletType) -> Arc<LocalTablet> {
        let alias = self.shards[shard]
            .iter()
            .find(|alias| alias.cell == cell && self.tablets[*alias].tablet_type() == tablet_type)
            .unwrap_or_else(|| panic!("no {tablet_type} tablet of {shard} in {cell}"));
        self.tablets[alias].clone()
    }

    pub fn alias(&self, shard: &str, cell: &str, tablet_type: TabletType) -> TabletAlias {
        self.tablet(shard, cell, tablet_type).alias().clone()
    }

    pub fn primary(&self, shard: &str) -> Arc<LocalTablet> {
        self.tablet(shard, "test_nj", TabletType::Primary)
    }

    pub fn shard_tablets(&self, shard: &str) -> Vec<Arc<LocalTablet>> {
        self.shards[shard]
            .iter()
            .map(|alias| self.tablets[alias].clone())
            .collect()
    }

    /// Client write of one row through the shard primary.
    pub async fn insert(
        &self,
        shard: &str,
        table: &str,
        id: u64,
        ksid: u64,
        msg: &str,
    ) -> Result<Position> {
        self.primary(shard)
            .execute(vec![RowChange::Upsert {
                table: table.into(),
                row: row(id, ksid, msg),
            }])
            .await
    }

    pub async fn delete(&self, shard: &str, table: &str, id: u64, ksid: u64) -> Result<Position> {
        self.primary(shard)
            .execute(vec![RowChange::Delete {
                table: table.into(),
                pk: id.to_be_bytes().to_vec(),
                keyspace_id: keyspace_id_from_u64(ksid),
            }])
            .await
    }

    /// Copy the schema and data of `source` into `destinations`, enabling
    /// filtered replication.
    pub async fn split_clone(&self, source: &str, destinations: &[&str]) -> CopyStatus {
        let source_rdonly = self.alias(source, "test_nj", TabletType::Rdonly);
        for dest in destinations {
            self.coordinator
                .copy_schema_shard(&source_rdonly, KEYSPACE, dest, &[])
                .await
                .expect("copy schema");
        }
        let job = self
            .coordinator
            .start_data_copy(&DataCopyRequest {
                keyspace: KEYSPACE.into(),
                destination_shards: destinations.iter().map(|d| d.to_string()).collect(),
                source_tablets: vec![source_rdonly],
                ..DataCopyRequest::default()
            })
            .await
            .expect("start copy");
        let status = job.wait(WAIT).await.expect("copy finished");
        assert_eq!(status.state, JobState::Succeeded, "copy failed: {:?}", status.error);
        status
    }

    pub async fn wait_for_replication(&self, shard: &str) {
        self.coordinator
            .wait_for_filtered_replication(KEYSPACE, shard, Duration::ZERO, WAIT)
            .await
            .expect("filtered replication caught up");
    }

    pub async fn migrate(
        &self,
        source: &str,
        role: ServingRole,
        cells: &[&str],
        reverse: bool,
    ) -> Result<MigrationOutcome> {
        self.coordinator
            .migrate_served_type(&MigrationRequest {
                keyspace: KEYSPACE.into(),
                source_shard: source.into(),
                role,
                cells: cells.iter().map(|c| c.to_string()).collect(),
                reverse,
            })
            .await
    }

    /// Poll player statuses until `check` holds. Returns false on timeout.
    pub async fn wait_for_players(&self, check: impl Fn(&[PlayerStatus]) -> bool) -> bool {
        let deadline = Instant::now() + WAIT;
        loop {
            if check(&self.coordinator.player_statuses().await) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wait until every running player has applied the source log up to the
    /// current position of `source`.
    pub async fn wait_for_players_at_source(&self, source: &str) {
        let position = self
            .primary(source)
            .current_position()
            .await
            .expect("source position");
        let reached = self
            .wait_for_players(|statuses| {
                !statuses.is_empty() && statuses.iter().all(|s| s.position >= position)
            })
            .await;
        assert!(reached, "players did not reach position {position} of {source}");
    }

    /// Shard names of the published partition for `role` in `cell`.
    pub fn partition(&self, cell: &str, role: ServingRole) -> String {
        self.coordinator
            .get_srv_keyspace(cell, KEYSPACE)
            .expect("srv keyspace")
            .partition(role)
            .iter()
            .map(|s| s.name.clone())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Rows of `table` on `shard`, keyed by id.
    pub fn rows(&self, shard: &str, table: &str) -> BTreeMap<u64, Row> {
        self.primary(shard)
            .rows(table)
            .expect("read rows")
            .into_iter()
            .map(|row| (id_of(&row), row))
            .collect()
    }
}

pub fn row(id: u64, ksid: u64, msg: &str) -> Row {
    Row::new(id.to_be_bytes(), keyspace_id_from_u64(ksid))
        .with("id", id)
        .with("msg", msg)
        .with("custom_sharding_key", ksid)
}

pub fn id_of(row: &Row) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&row.pk[..8]);
    u64::from_be_bytes(bytes)
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
