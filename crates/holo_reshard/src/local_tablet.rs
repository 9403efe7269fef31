//! fjall-backed tablets.
//!
//! All tablets of one shard share a `LocalShard` (one fjall keyspace), which
//! stands in for intra-shard replication: a write committed through the
//! primary is immediately visible on the replica and rdonly tablets. Each
//! `LocalTablet` keeps its own type, query-service flag and fault knobs.
//!
//! Layout per shard keyspace:
//! - `tbl_<table>`: pk -> encoded row
//! - `binlog`: big-endian position -> encoded `BinlogTransaction`
//! - `meta`: `position`, `tables`, `blp_checkpoint/<uid>`

use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle};
use tracing::debug;

use crate::error::{ReshardError, Result};
use crate::keyrange::KeyRange;
use crate::row::{now_unix_ms, BinlogTransaction, JsonRowCodec, Position, Row, RowChange, RowCodec};
use crate::tablet::{TabletConn, TabletHealth, TabletSnapshot};
use crate::topology::{TabletAlias, TabletType};

const META_POSITION: &[u8] = b"position";
const META_TABLES: &[u8] = b"tables";
const CHECKPOINT_PREFIX: &str = "blp_checkpoint/";
const MAX_TABLE_NAME: usize = 64;

fn checkpoint_key(uid: u32) -> Vec<u8> {
    format!("{CHECKPOINT_PREFIX}{uid}").into_bytes()
}

fn decode_position(bytes: &[u8]) -> Result<Position> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| ReshardError::Corruption(format!("bad position length {}", bytes.len())))?;
    Ok(u64::from_be_bytes(raw))
}

fn validate_table_name(table: &str) -> Result<()> {
    let ok = !table.is_empty()
        && table.len() <= MAX_TABLE_NAME
        && table
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if ok {
        Ok(())
    } else {
        Err(ReshardError::InvalidArgument(format!(
            "table name {table:?} must be 1-{MAX_TABLE_NAME} ascii alphanumerics or '_'"
        )))
    }
}

/// Storage shared by every tablet of one shard.
pub struct LocalShard {
    key_range: KeyRange,
    keyspace: Keyspace,
    meta: PartitionHandle,
    binlog: PartitionHandle,
    tables: RwLock<BTreeMap<String, PartitionHandle>>,
    position: AtomicU64,
    // Serializes commits and snapshots so a snapshot matches its position.
    write_lock: tokio::sync::Mutex<()>,
    codec: JsonRowCodec,
}

impl LocalShard {
    pub fn open(path: impl AsRef<Path>, key_range: KeyRange) -> Result<Arc<Self>> {
        std::fs::create_dir_all(path.as_ref())?;
        let keyspace = fjall::Config::new(path.as_ref()).open()?;
        let meta = keyspace.open_partition("meta", PartitionCreateOptions::default())?;
        let binlog = keyspace.open_partition("binlog", PartitionCreateOptions::default())?;

        let position = match meta.get(META_POSITION)? {
            Some(bytes) => decode_position(&bytes)?,
            None => 0,
        };
        let table_names: Vec<String> = match meta.get(META_TABLES)? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => Vec::new(),
        };
        let mut tables = BTreeMap::new();
        for name in table_names {
            let partition =
                keyspace.open_partition(&format!("tbl_{name}"), PartitionCreateOptions::default())?;
            tables.insert(name, partition);
        }

        Ok(Arc::new(Self {
            key_range,
            keyspace,
            meta,
            binlog,
            tables: RwLock::new(tables),
            position: AtomicU64::new(position),
            write_lock: tokio::sync::Mutex::new(()),
            codec: JsonRowCodec,
        }))
    }

    pub fn key_range(&self) -> &KeyRange {
        &self.key_range
    }

    /// New tablet handle over this shard's storage.
    pub fn tablet(self: &Arc<Self>, alias: TabletAlias, tablet_type: TabletType) -> Arc<LocalTablet> {
        Arc::new(LocalTablet {
            alias,
            shard: Arc::clone(self),
            runtime: Mutex::new(TabletRuntime {
                tablet_type,
                query_service: false,
                healthy: true,
                available: true,
                fail_next: 0,
            }),
        })
    }

    fn table(&self, table: &str) -> Option<PartitionHandle> {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(table)
            .cloned()
    }

    fn table_names(&self) -> Vec<String> {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    async fn create_table(&self, table: &str) -> Result<()> {
        validate_table_name(table)?;
        let _guard = self.write_lock.lock().await;
        if self.table(table).is_some() {
            return Ok(());
        }
        let partition = self
            .keyspace
            .open_partition(&format!("tbl_{table}"), PartitionCreateOptions::default())?;
        let mut names = self.table_names();
        names.push(table.to_string());
        names.sort();
        self.meta.insert(META_TABLES, serde_json::to_vec(&names)?)?;
        self.tables
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(table.to_string(), partition);
        Ok(())
    }

    fn scan(&self, table: &str, from: Option<Vec<u8>>, end: Option<Vec<u8>>, limit: usize) -> Result<Vec<Row>> {
        let partition = self
            .table(table)
            .ok_or_else(|| ReshardError::NotFound(format!("table {table}")))?;
        if let (Some(from), Some(end)) = (from.as_ref(), end.as_ref()) {
            if from >= end {
                return Ok(Vec::new());
            }
        }
        let lower = from.map_or(Bound::Unbounded, Bound::Included);
        let upper = end.map_or(Bound::Unbounded, Bound::Excluded);
        let mut rows = Vec::new();
        for item in partition.range((lower, upper)).take(limit) {
            let (_, value) = item?;
            rows.push(self.codec.decode_row(&value)?);
        }
        Ok(rows)
    }

    fn read_all(&self, table: &str) -> Result<Vec<Row>> {
        self.scan(table, None, None, usize::MAX)
    }

    /// Stage `changes` into `batch`. Unknown tables are reported with `missing`.
    fn stage_changes(
        &self,
        batch: &mut fjall::Batch,
        changes: &[RowChange],
        missing: impl Fn(&str) -> ReshardError,
    ) -> Result<()> {
        for change in changes {
            let partition = self
                .table(change.table())
                .ok_or_else(|| missing(change.table()))?;
            match change {
                RowChange::Upsert { row, .. } => {
                    batch.insert(&partition, row.pk.clone(), self.codec.encode_row(row)?);
                }
                RowChange::Delete { pk, .. } => {
                    batch.remove(&partition, pk.clone());
                }
            }
        }
        Ok(())
    }

    /// Stage a change-log entry for `changes` and return its position.
    fn stage_log_entry(&self, batch: &mut fjall::Batch, changes: Vec<RowChange>) -> Result<Position> {
        let position = self.position.load(Ordering::SeqCst) + 1;
        let txn = BinlogTransaction {
            position,
            timestamp_ms: now_unix_ms(),
            changes,
        };
        batch.insert(
            &self.binlog,
            position.to_be_bytes().to_vec(),
            self.codec.encode_transaction(&txn)?,
        );
        batch.insert(&self.meta, META_POSITION.to_vec(), position.to_be_bytes().to_vec());
        Ok(position)
    }

    fn checkpoint(&self, uid: u32) -> Result<Option<Position>> {
        match self.meta.get(checkpoint_key(uid))? {
            Some(bytes) => Ok(Some(decode_position(&bytes)?)),
            None => Ok(None),
        }
    }
}

struct TabletRuntime {
    tablet_type: TabletType,
    query_service: bool,
    healthy: bool,
    available: bool,
    fail_next: u32,
}

pub struct LocalTablet {
    alias: TabletAlias,
    shard: Arc<LocalShard>,
    runtime: Mutex<TabletRuntime>,
}

impl LocalTablet {
    pub fn shard(&self) -> &Arc<LocalShard> {
        &self.shard
    }

    /// Health reported to the migration gate.
    pub fn set_healthy(&self, healthy: bool) {
        self.runtime().healthy = healthy;
    }

    /// When unavailable every call fails with a transient error.
    pub fn set_available(&self, available: bool) {
        self.runtime().available = available;
    }

    /// Fail the next `calls` data operations with a transient error.
    pub fn fail_next(&self, calls: u32) {
        self.runtime().fail_next = calls;
    }

    pub fn tablet_type(&self) -> TabletType {
        self.runtime().tablet_type
    }

    pub fn query_service_enabled(&self) -> bool {
        self.runtime().query_service
    }

    /// Every row of `table`, in pk order, bypassing fault injection.
    pub fn rows(&self, table: &str) -> Result<Vec<Row>> {
        self.shard.read_all(table)
    }

    /// Write a row directly into storage without logging it.
    ///
    /// Only meant for seeding drift in tests and repair tooling.
    pub fn write_unlogged(&self, table: &str, row: &Row) -> Result<()> {
        let partition = self
            .shard
            .table(table)
            .ok_or_else(|| ReshardError::NotFound(format!("table {table}")))?;
        partition.insert(row.pk.clone(), self.shard.codec.encode_row(row)?)?;
        Ok(())
    }

    fn runtime(&self) -> std::sync::MutexGuard<'_, TabletRuntime> {
        self.runtime.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_reachable(&self) -> Result<()> {
        if self.runtime().available {
            Ok(())
        } else {
            Err(ReshardError::Transient(format!("tablet {} unavailable", self.alias)))
        }
    }

    fn check_data_call(&self, op: &str) -> Result<()> {
        let mut runtime = self.runtime();
        if !runtime.available {
            return Err(ReshardError::Transient(format!("tablet {} unavailable", self.alias)));
        }
        if runtime.fail_next > 0 {
            runtime.fail_next -= 1;
            return Err(ReshardError::Transient(format!(
                "tablet {} injected failure during {op}",
                self.alias
            )));
        }
        Ok(())
    }

    fn check_client_write(&self, changes: &[RowChange]) -> Result<()> {
        {
            let runtime = self.runtime();
            if runtime.tablet_type != TabletType::Primary {
                return Err(ReshardError::Precondition(format!(
                    "tablet {} is {}, writes need a primary",
                    self.alias, runtime.tablet_type
                )));
            }
            if !runtime.query_service {
                return Err(ReshardError::Precondition(format!(
                    "query service disabled on tablet {}",
                    self.alias
                )));
            }
        }
        for change in changes {
            validate_table_name(change.table())?;
            let keyspace_id = change.keyspace_id();
            if keyspace_id.is_empty() {
                return Err(ReshardError::InvalidArgument(format!(
                    "write to {} has no keyspace id",
                    change.table()
                )));
            }
            if !self.shard.key_range.contains(keyspace_id) {
                return Err(ReshardError::Precondition(format!(
                    "keyspace id {} is outside the keyrange {} of tablet {}",
                    hex::encode(keyspace_id),
                    self.shard.key_range,
                    self.alias
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TabletConn for LocalTablet {
    fn alias(&self) -> &TabletAlias {
        &self.alias
    }

    async fn health(&self) -> Result<TabletHealth> {
        self.check_reachable()?;
        let runtime = self.runtime();
        Ok(TabletHealth {
            healthy: runtime.healthy,
            tablet_type: runtime.tablet_type,
            query_service: runtime.query_service,
            position: self.shard.position.load(Ordering::SeqCst),
        })
    }

    async fn set_tablet_type(&self, tablet_type: TabletType) -> Result<()> {
        self.check_reachable()?;
        self.runtime().tablet_type = tablet_type;
        Ok(())
    }

    async fn set_query_service(&self, enabled: bool) -> Result<()> {
        self.check_reachable()?;
        // Writes check the flag under the commit lock, so once this returns
        // every accepted write is committed and reflected in the position.
        let _guard = self.shard.write_lock.lock().await;
        self.runtime().query_service = enabled;
        debug!(tablet = %self.alias, enabled, "query service toggled");
        Ok(())
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        self.check_data_call("list_tables")?;
        Ok(self.shard.table_names())
    }

    async fn create_table(&self, table: &str) -> Result<()> {
        self.check_data_call("create_table")?;
        self.shard.create_table(table).await
    }

    async fn row_count(&self, table: &str) -> Result<u64> {
        self.check_data_call("row_count")?;
        let partition = self
            .shard
            .table(table)
            .ok_or_else(|| ReshardError::NotFound(format!("table {table}")))?;
        Ok(partition.len()? as u64)
    }

    async fn scan_rows(
        &self,
        table: &str,
        from: Option<Vec<u8>>,
        end: Option<Vec<u8>>,
        limit: usize,
    ) -> Result<Vec<Row>> {
        self.check_data_call("scan_rows")?;
        self.shard.scan(table, from, end, limit)
    }

    async fn pk_split_points(&self, table: &str, parts: usize) -> Result<Vec<Vec<u8>>> {
        self.check_data_call("pk_split_points")?;
        let partition = self
            .shard
            .table(table)
            .ok_or_else(|| ReshardError::NotFound(format!("table {table}")))?;
        let mut keys = Vec::new();
        for item in partition.iter() {
            let (key, _) = item?;
            keys.push(key.to_vec());
        }
        if parts < 2 || keys.len() < parts {
            return Ok(Vec::new());
        }
        let mut points = (1..parts)
            .map(|i| keys[i * keys.len() / parts].clone())
            .collect::<Vec<_>>();
        points.dedup();
        Ok(points)
    }

    async fn snapshot(&self, tables: &[String]) -> Result<TabletSnapshot> {
        self.check_data_call("snapshot")?;
        let _guard = self.shard.write_lock.lock().await;
        let names = if tables.is_empty() {
            self.shard.table_names()
        } else {
            tables.to_vec()
        };
        let mut snapshot = TabletSnapshot {
            position: self.shard.position.load(Ordering::SeqCst),
            tables: BTreeMap::new(),
        };
        for name in names {
            let rows = self.shard.read_all(&name)?;
            snapshot.tables.insert(name, rows);
        }
        Ok(snapshot)
    }

    async fn current_position(&self) -> Result<Position> {
        self.check_data_call("current_position")?;
        Ok(self.shard.position.load(Ordering::SeqCst))
    }

    async fn binlog_after(&self, position: Position, limit: usize) -> Result<Vec<BinlogTransaction>> {
        self.check_data_call("binlog_after")?;
        let lower = Bound::Excluded(position.to_be_bytes().to_vec());
        let mut out = Vec::new();
        for item in self
            .shard
            .binlog
            .range((lower, Bound::Unbounded))
            .take(limit)
        {
            let (_, value) = item?;
            out.push(self.shard.codec.decode_transaction(&value)?);
        }
        Ok(out)
    }

    async fn execute(&self, changes: Vec<RowChange>) -> Result<Position> {
        self.check_data_call("execute")?;
        let _guard = self.shard.write_lock.lock().await;
        self.check_client_write(&changes)?;
        let mut batch = self.shard.keyspace.batch();
        self.shard.stage_changes(&mut batch, &changes, |table| {
            ReshardError::InvalidArgument(format!("table {table} does not exist"))
        })?;
        let position = self.shard.stage_log_entry(&mut batch, changes)?;
        batch.commit()?;
        self.shard.position.store(position, Ordering::SeqCst);
        Ok(position)
    }

    async fn apply_copied_rows(&self, table: &str, rows: Vec<Row>) -> Result<()> {
        self.check_data_call("apply_copied_rows")?;
        let partition = self
            .shard
            .table(table)
            .ok_or_else(|| ReshardError::NotFound(format!("table {table}")))?;
        let _guard = self.shard.write_lock.lock().await;
        let mut batch = self.shard.keyspace.batch();
        for row in &rows {
            batch.insert(&partition, row.pk.clone(), self.shard.codec.encode_row(row)?);
        }
        batch.commit()?;
        Ok(())
    }

    async fn clear_copied_rows(&self, table: &str) -> Result<u64> {
        self.check_data_call("clear_copied_rows")?;
        let Some(partition) = self.shard.table(table) else {
            return Ok(0);
        };
        let _guard = self.shard.write_lock.lock().await;
        let mut batch = self.shard.keyspace.batch();
        let mut cleared = 0u64;
        for item in partition.iter() {
            let (key, _) = item?;
            batch.remove(&partition, key.to_vec());
            cleared += 1;
        }
        batch.commit()?;
        Ok(cleared)
    }

    async fn apply_filtered(&self, uid: u32, position: Position, changes: Vec<RowChange>) -> Result<bool> {
        self.check_data_call("apply_filtered")?;
        let _guard = self.shard.write_lock.lock().await;
        if let Some(checkpoint) = self.shard.checkpoint(uid)? {
            if position <= checkpoint {
                return Ok(false);
            }
        }
        let mut batch = self.shard.keyspace.batch();
        self.shard.stage_changes(&mut batch, &changes, |table| {
            ReshardError::Corruption(format!(
                "filtered change for table {table} which does not exist on {}",
                self.alias
            ))
        })?;
        let logged = if changes.is_empty() {
            None
        } else {
            Some(self.shard.stage_log_entry(&mut batch, changes)?)
        };
        batch.insert(&self.shard.meta, checkpoint_key(uid), position.to_be_bytes().to_vec());
        batch.commit()?;
        if let Some(logged) = logged {
            self.shard.position.store(logged, Ordering::SeqCst);
        }
        Ok(true)
    }

    async fn filtered_checkpoint(&self, uid: u32) -> Result<Option<Position>> {
        self.check_data_call("filtered_checkpoint")?;
        self.shard.checkpoint(uid)
    }

    async fn set_filtered_checkpoint(&self, uid: u32, position: Position) -> Result<()> {
        self.check_data_call("set_filtered_checkpoint")?;
        let _guard = self.shard.write_lock.lock().await;
        self.shard
            .meta
            .insert(checkpoint_key(uid), position.to_be_bytes().to_vec())?;
        Ok(())
    }

    async fn clear_filtered_checkpoint(&self, uid: u32) -> Result<()> {
        self.check_data_call("clear_filtered_checkpoint")?;
        let _guard = self.shard.write_lock.lock().await;
        self.shard.meta.remove(checkpoint_key(uid))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyrange::keyspace_id_from_u64;

    fn open_tablet(dir: &Path, shard: &str, tablet_type: TabletType) -> Arc<LocalTablet> {
        let shard = LocalShard::open(dir, KeyRange::parse(shard).expect("keyrange")).expect("open shard");
        shard.tablet(TabletAlias::new("test_nj", 100), tablet_type)
    }

    fn upsert(id: u64, ksid: u64) -> RowChange {
        RowChange::Upsert {
            table: "resharding1".into(),
            row: Row::new(id.to_be_bytes(), keyspace_id_from_u64(ksid)).with("msg", "msg"),
        }
    }

    #[tokio::test]
    async fn primary_rejects_keys_outside_its_range() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tablet = open_tablet(dir.path(), "80-c0", TabletType::Primary);
        tablet.create_table("resharding1").await.expect("create");

        let err = tablet
            .execute(vec![upsert(1, 0x9000_0000_0000_0000)])
            .await
            .expect_err("query service off");
        assert!(matches!(err, ReshardError::Precondition(_)));

        tablet.set_query_service(true).await.expect("enable");
        assert_eq!(
            tablet
                .execute(vec![upsert(1, 0x9000_0000_0000_0000)])
                .await
                .expect("in range"),
            1
        );
        let err = tablet
            .execute(vec![upsert(2, 0xD000_0000_0000_0000)])
            .await
            .expect_err("out of range");
        assert!(err.to_string().contains("outside the keyrange"), "{err}");
        assert_eq!(tablet.rows("resharding1").expect("rows").len(), 1);
    }

    #[tokio::test]
    async fn filtered_apply_is_idempotent_per_checkpoint() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tablet = open_tablet(dir.path(), "c0-", TabletType::Primary);
        tablet.create_table("resharding1").await.expect("create");

        let changes = vec![upsert(7, 0xD000_0000_0000_0000)];
        assert!(tablet.apply_filtered(0, 5, changes.clone()).await.expect("apply"));
        assert!(!tablet.apply_filtered(0, 5, changes.clone()).await.expect("replay"));
        assert!(!tablet.apply_filtered(0, 3, changes).await.expect("older"));
        assert!(tablet.apply_filtered(0, 6, Vec::new()).await.expect("empty"));
        assert_eq!(tablet.filtered_checkpoint(0).await.expect("checkpoint"), Some(6));
        assert_eq!(tablet.filtered_checkpoint(1).await.expect("checkpoint"), None);

        let err = tablet
            .apply_filtered(
                0,
                7,
                vec![RowChange::Delete {
                    table: "missing".into(),
                    pk: vec![1],
                    keyspace_id: vec![0xd0],
                }],
            )
            .await
            .expect_err("unknown table");
        assert!(matches!(err, ReshardError::Corruption(_)));
        assert_eq!(tablet.filtered_checkpoint(0).await.expect("checkpoint"), Some(6));
    }

    #[tokio::test]
    async fn storage_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let tablet = open_tablet(dir.path(), "-", TabletType::Primary);
            tablet.create_table("resharding1").await.expect("create");
            tablet.set_query_service(true).await.expect("enable");
            tablet.execute(vec![upsert(1, 1)]).await.expect("write");
            tablet.execute(vec![upsert(2, 2)]).await.expect("write");
        }
        let tablet = open_tablet(dir.path(), "-", TabletType::Replica);
        assert_eq!(tablet.current_position().await.expect("position"), 2);
        let log = tablet.binlog_after(1, 10).await.expect("binlog");
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].position, 2);
        assert_eq!(tablet.row_count("resharding1").await.expect("count"), 2);
    }

    #[tokio::test]
    async fn disabling_query_service_waits_for_inflight_writes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tablet = open_tablet(dir.path(), "-", TabletType::Primary);
        tablet.create_table("resharding1").await.expect("create");
        tablet.set_query_service(true).await.expect("enable");

        // Stands in for a write between its query-service check and its commit.
        let commit = tablet.shard.write_lock.lock().await;
        let disable = tokio::spawn({
            let tablet = tablet.clone();
            async move { tablet.set_query_service(false).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!disable.is_finished());
        assert!(tablet.query_service_enabled());

        drop(commit);
        disable.await.expect("join").expect("disable");
        assert!(!tablet.query_service_enabled());
        let err = tablet.execute(vec![upsert(1, 1)]).await.expect_err("disabled");
        assert!(matches!(err, ReshardError::Precondition(_)));
    }

    #[tokio::test]
    async fn injected_failures_are_transient() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tablet = open_tablet(dir.path(), "-", TabletType::Replica);
        tablet.fail_next(1);
        let err = tablet.list_tables().await.expect_err("injected");
        assert!(err.is_retryable());
        assert!(tablet.list_tables().await.expect("second call").is_empty());
    }
}
