//! Resharding control plane.
//!
//! Topology changes go through `TopoStore::update`. Afterwards the coordinator
//! pushes changed query-service flags to reachable tablets and reconciles
//! filtered replication against the source references now in topology.
//!
//! A split runs as:
//! 1. `copy_schema_shard` onto every destination
//! 2. `start_data_copy`; on success each destination gets its references and
//!    checkpoints, and players start
//! 3. `wait_for_filtered_replication` and `verify_consistency`
//! 4. `migrate_served_type` for rdonly, replica, then primary

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::binlog_player::{PlayerKey, PlayerMap, PlayerOptions, PlayerSpec, PlayerState, PlayerStatus};
use crate::config::ReshardConfig;
use crate::copier::{CopyCompletion, CopyEndpoint, CopyJob, CopyOptions};
use crate::error::{ReshardError, Result};
use crate::keyrange::{KeyRange, KeyspaceIdType};
use crate::migration::{apply_migration, resolve_shard_name, MigrationOutcome, MigrationRequest};
use crate::precondition;
use crate::row::{now_unix_ms, Position};
use crate::source_shards::{add_source_shard, check_source_coverage, delete_source_shard, AddSourceShard};
use crate::tablet::{TabletConn, TabletRegistry};
use crate::topo_store::TopoStore;
use crate::topology::{
    KeyspaceRecord, ServingRole, ShardRecord, SourceShard, SrvKeyspace, TabletAlias, TabletRecord,
    TabletType, TopologyState, VerificationRecord,
};
use crate::verifier::{verify_destination, VerifyOptions, VerifyReport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateKeyspace {
    pub name: String,
    pub sharding_column_name: String,
    pub sharding_column_type: KeyspaceIdType,
    pub split_shard_count: u32,
    pub cells: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataCopyRequest {
    pub keyspace: String,
    /// Destination shards, by name or keyrange.
    pub destination_shards: Vec<String>,
    /// Tablets to read from; the first one listed per source shard is used.
    pub source_tablets: Vec<TabletAlias>,
    pub reader_parallelism: Option<usize>,
    pub min_table_size_for_split: Option<u64>,
    pub exclude_tables: Vec<String>,
}

type LockKey = (String, ServingRole, String);

/// Per `(keyspace, role, cell)` mutexes serializing migrations.
#[derive(Clone, Default)]
struct MigrationLocks {
    locks: Arc<Mutex<BTreeMap<LockKey, Arc<tokio::sync::Mutex<()>>>>>,
}

impl MigrationLocks {
    /// Lock every cell in sorted order.
    async fn acquire(
        &self,
        keyspace: &str,
        role: ServingRole,
        cells: &BTreeSet<String>,
    ) -> Vec<OwnedMutexGuard<()>> {
        let mutexes = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            cells
                .iter()
                .map(|cell| {
                    locks
                        .entry((keyspace.to_string(), role, cell.clone()))
                        .or_default()
                        .clone()
                })
                .collect::<Vec<_>>()
        };
        let mut guards = Vec::with_capacity(mutexes.len());
        for mutex in mutexes {
            guards.push(mutex.lock_owned().await);
        }
        guards
    }
}

#[derive(Clone)]
pub struct Coordinator {
    topo: TopoStore,
    tablets: TabletRegistry,
    players: PlayerMap,
    config: Arc<ReshardConfig>,
    migration_locks: MigrationLocks,
}

impl Coordinator {
    pub fn new(topo: TopoStore, tablets: TabletRegistry, config: ReshardConfig) -> Self {
        Self {
            topo,
            tablets,
            players: PlayerMap::new(),
            config: Arc::new(config),
            migration_locks: MigrationLocks::default(),
        }
    }

    pub fn topo(&self) -> &TopoStore {
        &self.topo
    }

    pub fn tablets(&self) -> &TabletRegistry {
        &self.tablets
    }

    pub fn config(&self) -> &ReshardConfig {
        &self.config
    }

    pub fn state(&self) -> TopologyState {
        self.topo.state()
    }

    fn player_options(&self) -> PlayerOptions {
        PlayerOptions::from_config(&self.config)
    }

    pub fn create_keyspace(&self, req: &CreateKeyspace) -> Result<()> {
        if req.name.is_empty() {
            return Err(ReshardError::InvalidArgument("keyspace name is empty".into()));
        }
        if req.cells.is_empty() {
            return Err(ReshardError::InvalidArgument(format!(
                "keyspace {} needs at least one cell",
                req.name
            )));
        }
        self.topo.update(|state| {
            if state.keyspaces.contains_key(&req.name) {
                precondition!("keyspace {} already exists", req.name);
            }
            state.keyspaces.insert(
                req.name.clone(),
                KeyspaceRecord {
                    name: req.name.clone(),
                    sharding_column_name: req.sharding_column_name.clone(),
                    sharding_column_type: req.sharding_column_type,
                    split_shard_count: req.split_shard_count,
                    cells: req.cells.iter().cloned().collect(),
                    shards: BTreeMap::new(),
                    srv: BTreeMap::new(),
                },
            );
            Ok(())
        })?;
        info!(keyspace = %req.name, cells = ?req.cells, "keyspace created");
        Ok(())
    }

    /// Set the sharding column. Changing an already set column or type needs `force`.
    pub fn set_keyspace_sharding_info(
        &self,
        keyspace: &str,
        column_name: &str,
        column_type: KeyspaceIdType,
        split_shard_count: Option<u32>,
        force: bool,
    ) -> Result<()> {
        self.topo.update(|state| {
            let ks = state.keyspace_mut(keyspace)?;
            if !force {
                if !ks.sharding_column_name.is_empty() && ks.sharding_column_name != column_name {
                    precondition!(
                        "keyspace {keyspace} is sharded by {}, not {column_name}; use force to change it",
                        ks.sharding_column_name
                    );
                }
                if ks.sharding_column_type != KeyspaceIdType::Unset
                    && ks.sharding_column_type != column_type
                {
                    precondition!(
                        "keyspace {keyspace} sharding column type is {}, not {column_type}; use force to change it",
                        ks.sharding_column_type
                    );
                }
            }
            ks.sharding_column_name = column_name.to_string();
            ks.sharding_column_type = column_type;
            if let Some(count) = split_shard_count {
                ks.split_shard_count = count;
            }
            for srv in ks.srv.values_mut() {
                srv.sharding_column_name = column_name.to_string();
                srv.sharding_column_type = column_type;
            }
            Ok(())
        })
    }

    /// Create a shard for `key_range`, or return it if it exists.
    ///
    /// Without explicit `served_roles` a shard serves every role in every
    /// cell unless it overlaps an existing shard, in which case it starts
    /// out serving nothing. Partitions are published by
    /// `rebuild_keyspace_graph`.
    pub fn init_shard(
        &self,
        keyspace: &str,
        key_range: &str,
        served_roles: Option<&[ServingRole]>,
    ) -> Result<ShardRecord> {
        let range = KeyRange::parse(key_range)?;
        let shard = self.topo.update(|state| {
            let ks = state.keyspace_mut(keyspace)?;
            insert_shard(ks, range.clone(), served_roles)
        })?;
        info!(keyspace, shard = %shard.name, serving = shard.serves_anything(), "shard initialized");
        Ok(shard)
    }

    /// Record a tablet, creating its shard if needed, and push its desired
    /// state if a connection is registered.
    pub async fn init_tablet(
        &self,
        alias: TabletAlias,
        keyspace: &str,
        shard: &str,
        tablet_type: TabletType,
    ) -> Result<TabletRecord> {
        let record = self.topo.update(|state| {
            let ks = state.keyspace_mut(keyspace)?;
            if !ks.cells.contains(&alias.cell) {
                return Err(ReshardError::InvalidArgument(format!(
                    "cell {} is not a cell of keyspace {keyspace}",
                    alias.cell
                )));
            }
            let shard_name = match resolve_shard_name(ks, shard) {
                Ok(name) => name,
                Err(ReshardError::NotFound(_)) => insert_shard(ks, KeyRange::parse(shard)?, None)?.name,
                Err(err) => return Err(err),
            };
            let key = alias.to_string();
            if let Some(existing) = state.tablets.get(&key) {
                if existing.keyspace != keyspace || existing.shard != shard_name {
                    precondition!(
                        "tablet {alias} already belongs to {}/{}",
                        existing.keyspace,
                        existing.shard
                    );
                }
                if existing.tablet_type != tablet_type {
                    precondition!(
                        "tablet {alias} already exists as {}; use change_tablet_type",
                        existing.tablet_type
                    );
                }
            }
            let record = state.keyspace_mut(keyspace)?.shard_mut(&shard_name)?;
            if tablet_type == TabletType::Primary {
                match record.primary.as_ref() {
                    Some(primary) if *primary != alias => precondition!(
                        "shard {keyspace}/{shard_name} already has primary {primary}"
                    ),
                    _ => record.primary = Some(alias.clone()),
                }
            }
            record.cells.insert(alias.cell.clone());
            state.tablets.insert(
                key,
                TabletRecord {
                    alias: alias.clone(),
                    keyspace: keyspace.to_string(),
                    shard: shard_name,
                    tablet_type,
                    query_service_enabled: false,
                },
            );
            state.refresh_query_service(keyspace);
            state.tablet(&alias).cloned()
        })?;
        info!(tablet = %alias, keyspace, shard = %record.shard, tablet_type = %tablet_type, "tablet initialized");
        if let Some(conn) = self.tablets.get(&alias) {
            push_tablet_state(conn.as_ref(), &record).await;
        }
        self.refresh_players().await;
        Ok(record)
    }

    /// Make a tablet reachable and bring it in line with its topology record.
    pub async fn register_tablet_conn(&self, conn: Arc<dyn TabletConn>) {
        let alias = conn.alias().clone();
        self.tablets.register(conn.clone());
        if let Ok(record) = self.topo.state().tablet(&alias) {
            push_tablet_state(conn.as_ref(), record).await;
        } else {
            debug!(tablet = %alias, "registered connection for a tablet not yet in topology");
        }
        self.refresh_players().await;
    }

    /// Move a tablet between non-primary types.
    pub async fn change_tablet_type(&self, alias: &TabletAlias, tablet_type: TabletType) -> Result<TabletRecord> {
        let record = self.topo.update(|state| {
            let current = state.tablet(alias)?.clone();
            if current.tablet_type == tablet_type {
                return Ok(current);
            }
            if current.tablet_type == TabletType::Primary || tablet_type == TabletType::Primary {
                precondition!(
                    "tablet {alias} cannot change from {} to {tablet_type}: primary changes need a reparent",
                    current.tablet_type
                );
            }
            if let Some(tablet) = state.tablets.get_mut(&alias.to_string()) {
                tablet.tablet_type = tablet_type;
            }
            state.refresh_query_service(&current.keyspace);
            state.tablet(alias).cloned()
        })?;
        if let Some(conn) = self.tablets.get(alias) {
            push_tablet_state(conn.as_ref(), &record).await;
        }
        Ok(record)
    }

    /// Republish partitions for `cells` (every cell when empty).
    pub async fn rebuild_keyspace_graph(
        &self,
        keyspace: &str,
        cells: &[String],
    ) -> Result<BTreeMap<String, SrvKeyspace>> {
        let (srv, changes) = self.topo.update(|state| {
            let ks = state.keyspace_mut(keyspace)?;
            if let Some(unknown) = cells.iter().find(|c| !ks.cells.contains(*c)) {
                return Err(ReshardError::InvalidArgument(format!(
                    "cell {unknown} is not a cell of keyspace {keyspace}"
                )));
            }
            ks.rebuild_srv((!cells.is_empty()).then_some(cells))?;
            let srv = ks.srv.clone();
            Ok((srv, state.refresh_query_service(keyspace)))
        })?;
        self.push_query_service(&changes).await;
        info!(keyspace, cells = srv.len(), "keyspace graph rebuilt");
        Ok(srv)
    }

    pub fn get_srv_keyspace(&self, cell: &str, keyspace: &str) -> Result<SrvKeyspace> {
        self.topo
            .state()
            .keyspace(keyspace)?
            .srv
            .get(cell)
            .cloned()
            .ok_or_else(|| {
                ReshardError::NotFound(format!("serving keyspace {keyspace} in cell {cell}"))
            })
    }

    /// Create every table of `source` on each reachable tablet of the destination shard.
    pub async fn copy_schema_shard(
        &self,
        source: &TabletAlias,
        keyspace: &str,
        destination_shard: &str,
        exclude_tables: &[String],
    ) -> Result<Vec<String>> {
        let state = self.topo.state();
        let shard = resolve_shard_name(state.keyspace(keyspace)?, destination_shard)?;
        let tables = self
            .tablets
            .require(source)?
            .list_tables()
            .await?
            .into_iter()
            .filter(|t| !exclude_tables.contains(t))
            .collect::<Vec<_>>();
        let targets = state
            .tablets_in_shard(keyspace, &shard)
            .filter_map(|t| self.tablets.get(&t.alias))
            .collect::<Vec<_>>();
        if targets.is_empty() {
            precondition!("shard {keyspace}/{shard} has no reachable tablets to copy the schema to");
        }
        for target in &targets {
            for table in &tables {
                target.create_table(table).await?;
            }
        }
        info!(source = %source, keyspace, shard = %shard, tables = ?tables, "schema copied");
        Ok(tables)
    }

    /// Start the bulk copy from the listed source tablets into the destinations.
    ///
    /// When the copy finishes, each destination's checkpoints are set to the
    /// positions captured before scanning and its source references are
    /// recorded, which starts filtered replication.
    pub async fn start_data_copy(&self, req: &DataCopyRequest) -> Result<Arc<CopyJob>> {
        let state = self.topo.state();
        let ks = state.keyspace(&req.keyspace)?;

        let mut by_shard: BTreeMap<String, CopyEndpoint> = BTreeMap::new();
        for alias in &req.source_tablets {
            let tablet = state.tablet(alias)?;
            if tablet.keyspace != req.keyspace {
                return Err(ReshardError::InvalidArgument(format!(
                    "source tablet {alias} belongs to keyspace {}, not {}",
                    tablet.keyspace, req.keyspace
                )));
            }
            if by_shard.contains_key(&tablet.shard) {
                continue;
            }
            let shard = ks.shard(&tablet.shard)?;
            by_shard.insert(
                shard.name.clone(),
                CopyEndpoint {
                    shard: shard.name.clone(),
                    key_range: shard.key_range.clone(),
                    tablet: self.tablets.require(alias)?,
                },
            );
        }
        let mut sources = by_shard.into_values().collect::<Vec<_>>();
        sources.sort_by(|a, b| a.key_range.cmp(&b.key_range));

        let mut destinations = Vec::with_capacity(req.destination_shards.len());
        for name in &req.destination_shards {
            let name = resolve_shard_name(ks, name)?;
            let shard = ks.shard(&name)?;
            if sources.iter().any(|s| s.shard == name) {
                precondition!("shard {}/{name} cannot be both source and destination", req.keyspace);
            }
            if !shard.source_shards.is_empty() {
                precondition!(
                    "destination shard {}/{name} already has source shard references",
                    req.keyspace
                );
            }
            // The copy empties destination tables before writing.
            if shard.serves_anything() {
                precondition!("destination shard {}/{name} is serving traffic", req.keyspace);
            }
            let Some(primary) = shard.primary.as_ref() else {
                precondition!("destination shard {}/{name} has no primary tablet", req.keyspace);
            };
            destinations.push(CopyEndpoint {
                shard: name.clone(),
                key_range: shard.key_range.clone(),
                tablet: self.tablets.require(primary)?,
            });
        }

        let mut options = CopyOptions::from_config(&self.config, req.exclude_tables.clone());
        if let Some(parallelism) = req.reader_parallelism {
            options.reader_parallelism = parallelism.max(1);
        }
        if let Some(min_size) = req.min_table_size_for_split {
            options.min_table_size_for_split = min_size;
        }
        let finalizer = CopyFinalizer {
            coordinator: self.clone(),
            keyspace: req.keyspace.clone(),
            sources: sources
                .iter()
                .enumerate()
                .map(|(uid, s)| (uid as u32, s.shard.clone(), s.key_range.clone()))
                .collect(),
            destinations: destinations
                .iter()
                .map(|d| (d.shard.clone(), d.key_range.clone(), d.tablet.clone()))
                .collect(),
        };
        let source_names = sources.iter().map(|s| s.shard.clone()).collect::<Vec<_>>();
        let dest_names = destinations.iter().map(|d| d.shard.clone()).collect::<Vec<_>>();
        let job = CopyJob::spawn(sources, destinations, options, Some(Arc::new(finalizer)))?;
        info!(
            keyspace = %req.keyspace,
            sources = ?source_names,
            destinations = ?dest_names,
            "data copy started"
        );
        Ok(Arc::new(job))
    }

    /// Wait until every reference of `shard` has a running player within `max_lag`.
    pub async fn wait_for_filtered_replication(
        &self,
        keyspace: &str,
        shard: &str,
        max_lag: Duration,
        timeout: Duration,
    ) -> Result<Vec<PlayerStatus>> {
        let deadline = Instant::now() + timeout;
        let max_lag_ms = max_lag.as_millis().min(u128::from(u64::MAX)) as u64;
        loop {
            let state = self.topo.state();
            let record = state.shard(keyspace, shard)?;
            if record.source_shards.is_empty() {
                precondition!("shard {keyspace}/{shard} has no filtered replication");
            }
            let statuses = self.players.statuses(keyspace, &record.name).await;
            if let Some(failed) = statuses.iter().find(|s| s.state == PlayerState::Failed) {
                return Err(ReshardError::Corruption(format!(
                    "filtered replication from {} into {keyspace}/{shard} failed: {}",
                    failed.source_shard,
                    failed.error.as_deref().unwrap_or("unknown error")
                )));
            }
            let pending = record
                .source_shards
                .iter()
                .filter(|reference| {
                    !statuses.iter().any(|s| {
                        s.key.uid == reference.uid
                            && s.state == PlayerState::Running
                            && (s.caught_up || s.last_lag_ms <= max_lag_ms)
                    })
                })
                .map(|reference| reference.uid)
                .collect::<Vec<_>>();
            if pending.is_empty() {
                return Ok(statuses);
            }
            if Instant::now() >= deadline {
                return Err(ReshardError::Transient(format!(
                    "filtered replication into {keyspace}/{shard} not within {max_lag:?} after {timeout:?} (pending uids {pending:?})"
                )));
            }
            tokio::time::sleep(self.config.player_poll_interval()).await;
        }
    }

    pub async fn filtered_replication_status(&self, keyspace: &str, shard: &str) -> Result<Vec<PlayerStatus>> {
        let shard = resolve_shard_name(self.topo.state().keyspace(keyspace)?, shard)?;
        Ok(self.players.statuses(keyspace, &shard).await)
    }

    pub async fn player_statuses(&self) -> Vec<PlayerStatus> {
        self.players.all_statuses().await
    }

    /// Compare a destination against its sources and record the outcome.
    ///
    /// The destination's players are paused for the duration and restarted
    /// afterwards whatever the result. A mismatch is returned as a report;
    /// see `VerifyReport::into_result`.
    pub async fn verify_consistency(
        &self,
        keyspace: &str,
        shard: &str,
        exclude_tables: Vec<String>,
    ) -> Result<VerifyReport> {
        let state = self.topo.state();
        let shard = resolve_shard_name(state.keyspace(keyspace)?, shard)?;
        let record = state.shard(keyspace, &shard)?;
        check_source_coverage(record)?;
        let specs = self.shard_player_specs(&state, keyspace, record)?;
        let Some(destination) = specs.first().map(|spec| spec.destination.clone()) else {
            precondition!("shard {keyspace}/{shard} has no source shard references");
        };

        let options = VerifyOptions {
            exclude_tables,
            max_reported_diffs: self.config.verify_max_reported_diffs,
            timeout: self.config.wait_timeout(),
        };
        let paused = self.players.pause_shard(keyspace, &shard).await;
        debug!(keyspace, shard = %shard, players = paused.len(), "players paused for consistency check");
        let result = verify_destination(
            keyspace,
            &shard,
            destination,
            &record.key_range,
            specs,
            &options,
            &self.player_options(),
        )
        .await;
        self.players.resume_shard(keyspace, &shard).await;

        let outcome = match result {
            Ok(report) => {
                let verification = VerificationRecord {
                    matched: report.matched,
                    summary: report.summary(),
                    verified_unix_ms: now_unix_ms(),
                };
                self.topo
                    .update(|state| {
                        state.keyspace_mut(keyspace)?.shard_mut(&shard)?.verification =
                            Some(verification.clone());
                        Ok(())
                    })
                    .map(|_| report)
            }
            Err(err) => Err(err),
        };
        self.refresh_players().await;
        outcome
    }

    /// Move serving of one role from a source shard to its destinations, or back.
    pub async fn migrate_served_type(&self, req: &MigrationRequest) -> Result<MigrationOutcome> {
        let lock_cells = {
            let state = self.topo.state();
            let ks = state.keyspace(&req.keyspace)?;
            if req.cells.is_empty() || req.role == ServingRole::Primary {
                ks.cells.clone()
            } else {
                req.cells.iter().cloned().collect()
            }
        };
        let _guards = self
            .migration_locks
            .acquire(&req.keyspace, req.role, &lock_cells)
            .await;

        let snapshot = self.topo.state();
        let mut preview = snapshot.clone();
        let planned = apply_migration(&mut preview, req)?;
        if planned.noop {
            info!(keyspace = %req.keyspace, source = %req.source_shard, role = %req.role, reverse = req.reverse, "served type already in place");
            return Ok(planned);
        }

        self.check_serving_health(&snapshot, req, &planned).await?;
        if !req.reverse {
            self.check_replication_lag(&snapshot, req, &planned).await?;
        }

        let cutover = req.role == ServingRole::Primary;
        if cutover {
            if let Err(err) = self.drain_sources(&snapshot, req, &planned).await {
                self.restore_query_service(&req.keyspace, &planned.sources).await;
                return Err(err);
            }
        }

        let outcome = match self.topo.update(|state| apply_migration(state, req)) {
            Ok(outcome) => outcome,
            Err(err) => {
                if cutover {
                    self.restore_query_service(&req.keyspace, &planned.sources).await;
                }
                return Err(err);
            }
        };
        info!(
            keyspace = %req.keyspace,
            source = %req.source_shard,
            role = %req.role,
            reverse = req.reverse,
            cells = ?outcome.cells,
            destinations = ?outcome.destinations,
            "served type migrated"
        );
        self.push_query_service(&outcome.query_service).await;
        // Players of torn-down references stop here, before their checkpoints go.
        self.refresh_players().await;
        if !outcome.torn_down.is_empty() {
            let state = self.topo.state();
            for (dest, uid) in &outcome.torn_down {
                self.clear_checkpoint(&state, &req.keyspace, dest, *uid).await;
            }
        }
        Ok(outcome)
    }

    pub async fn add_source_shard_reference(&self, req: &AddSourceShard) -> Result<SourceShard> {
        let (reference, changes) = self.topo.update(|state| {
            let reference = add_source_shard(state, req)?;
            Ok((reference, state.refresh_query_service(&req.keyspace)))
        })?;
        info!(keyspace = %req.keyspace, shard = %req.shard, uid = req.uid, source = %reference.shard, "source shard reference added");
        self.push_query_service(&changes).await;
        self.refresh_players().await;
        Ok(reference)
    }

    pub async fn delete_source_shard_reference(
        &self,
        keyspace: &str,
        shard: &str,
        uid: u32,
        force: bool,
    ) -> Result<SourceShard> {
        let (reference, changes) = self.topo.update(|state| {
            let reference = delete_source_shard(state, keyspace, shard, uid, force)?;
            Ok((reference, state.refresh_query_service(keyspace)))
        })?;
        info!(keyspace, shard, uid, source = %reference.shard, "source shard reference deleted");
        self.push_query_service(&changes).await;
        self.refresh_players().await;
        self.clear_checkpoint(&self.topo.state(), keyspace, shard, uid).await;
        Ok(reference)
    }

    /// Drop `cell` from a shard that neither serves nor has tablets there.
    pub fn remove_shard_cell(&self, keyspace: &str, shard: &str, cell: &str) -> Result<()> {
        self.topo.update(|state| {
            let has_tablets = state
                .tablets_in_shard(keyspace, shard)
                .any(|t| t.alias.cell == cell);
            let record = state.keyspace_mut(keyspace)?.shard_mut(shard)?;
            if record.serves_in_cell(cell) {
                precondition!("shard {keyspace}/{shard} still serves in cell {cell}");
            }
            if has_tablets {
                precondition!("shard {keyspace}/{shard} still has tablets in cell {cell}");
            }
            if !record.cells.remove(cell) {
                return Err(ReshardError::NotFound(format!(
                    "cell {cell} of shard {keyspace}/{shard}"
                )));
            }
            Ok(())
        })?;
        info!(keyspace, shard, cell, "shard cell removed");
        Ok(())
    }

    /// Delete a shard that serves nothing, has no tablets and feeds no other shard.
    pub async fn delete_shard(&self, keyspace: &str, shard: &str) -> Result<()> {
        self.topo.update(|state| {
            if let Some(tablet) = state.tablets_in_shard(keyspace, shard).next() {
                precondition!("shard {keyspace}/{shard} still has tablet {}", tablet.alias);
            }
            let record = state.shard(keyspace, shard)?;
            if record.serves_anything() {
                precondition!("shard {keyspace}/{shard} still serves traffic");
            }
            for ks in state.keyspaces.values() {
                if let Some(dependent) = ks.shards.values().find(|s| {
                    s.source_shards
                        .iter()
                        .any(|r| r.keyspace == keyspace && r.shard == shard)
                }) {
                    precondition!(
                        "shard {}/{} still replicates from {keyspace}/{shard}",
                        ks.name,
                        dependent.name
                    );
                }
            }
            state.keyspace_mut(keyspace)?.shards.remove(shard);
            Ok(())
        })?;
        info!(keyspace, shard, "shard deleted");
        self.refresh_players().await;
        Ok(())
    }

    /// Remove a tablet record and forget its connection.
    pub async fn delete_tablet(&self, alias: &TabletAlias, allow_primary: bool) -> Result<TabletRecord> {
        let record = self.topo.update(|state| {
            let tablet = state.tablet(alias)?.clone();
            if tablet.tablet_type == TabletType::Primary && !allow_primary {
                precondition!(
                    "tablet {alias} is the primary of {}/{}; deleting it needs allow_primary",
                    tablet.keyspace,
                    tablet.shard
                );
            }
            state.tablets.remove(&alias.to_string());
            if let Ok(shard) = state
                .keyspace_mut(&tablet.keyspace)
                .and_then(|ks| ks.shard_mut(&tablet.shard))
            {
                if shard.primary.as_ref() == Some(alias) {
                    shard.primary = None;
                }
            }
            Ok(tablet)
        })?;
        if let Some(conn) = self.tablets.unregister(alias) {
            if let Err(err) = conn.set_query_service(false).await {
                debug!(tablet = %alias, error = %err, "could not stop query service on deleted tablet");
            }
        }
        info!(tablet = %alias, keyspace = %record.keyspace, shard = %record.shard, "tablet deleted");
        self.refresh_players().await;
        Ok(record)
    }

    /// Reconcile running players with the source references in topology.
    pub async fn refresh_players(&self) {
        let state = self.topo.state();
        let mut desired = Vec::new();
        for ks in state.keyspaces.values() {
            for shard in ks.shards.values().filter(|s| !s.source_shards.is_empty()) {
                match self.shard_player_specs(&state, &ks.name, shard) {
                    Ok(specs) => desired.extend(specs),
                    Err(err) => {
                        debug!(keyspace = %ks.name, shard = %shard.name, error = %err, "filtered replication cannot start yet")
                    }
                }
            }
        }
        self.players.reconcile(desired, &self.player_options()).await;
    }

    pub async fn shutdown(&self) {
        self.players.stop_all().await;
        info!("coordinator stopped");
    }

    fn shard_player_specs(
        &self,
        state: &TopologyState,
        keyspace: &str,
        shard: &ShardRecord,
    ) -> Result<Vec<PlayerSpec>> {
        let Some(primary) = shard.primary.as_ref() else {
            precondition!("shard {keyspace}/{} has no primary tablet", shard.name);
        };
        let destination = self.tablets.require(primary)?;
        shard
            .source_shards
            .iter()
            .map(|reference| {
                let source = state.shard(&reference.keyspace, &reference.shard)?;
                let Some(source_primary) = source.primary.as_ref() else {
                    precondition!(
                        "source shard {}/{} has no primary tablet",
                        reference.keyspace,
                        reference.shard
                    );
                };
                Ok(PlayerSpec {
                    key: PlayerKey {
                        keyspace: keyspace.to_string(),
                        shard: shard.name.clone(),
                        uid: reference.uid,
                    },
                    reference: reference.clone(),
                    destination_range: shard.key_range.clone(),
                    source: self.tablets.require(source_primary)?,
                    destination: destination.clone(),
                })
            })
            .collect()
    }

    /// Shards about to serve must have enough healthy tablets of the role.
    async fn check_serving_health(
        &self,
        snapshot: &TopologyState,
        req: &MigrationRequest,
        planned: &MigrationOutcome,
    ) -> Result<()> {
        let incoming = if req.reverse {
            &planned.sources
        } else {
            &planned.destinations
        };
        for shard in incoming {
            let record = snapshot.shard(&req.keyspace, shard)?;
            if req.role == ServingRole::Primary {
                let Some(primary) = record.primary.as_ref() else {
                    precondition!("shard {}/{shard} has no primary tablet", req.keyspace);
                };
                let health = self.tablets.require(primary)?.health().await?;
                if !health.healthy {
                    precondition!("primary {primary} of {}/{shard} is not healthy", req.keyspace);
                }
                continue;
            }
            let candidates = snapshot
                .tablets_in_shard(&req.keyspace, shard)
                .filter(|t| {
                    t.tablet_type == req.role.tablet_type() && planned.cells.contains(&t.alias.cell)
                })
                .map(|t| t.alias.clone())
                .collect::<Vec<_>>();
            let mut healthy = 0;
            for alias in candidates {
                let Some(conn) = self.tablets.get(&alias) else {
                    debug!(tablet = %alias, "tablet not reachable; not counted");
                    continue;
                };
                if !conn.health().await?.healthy {
                    precondition!("{} tablet {alias} of {}/{shard} is not healthy", req.role, req.keyspace);
                }
                healthy += 1;
            }
            if healthy < self.config.min_healthy_destination_tablets {
                precondition!(
                    "shard {}/{shard} has {healthy} healthy {} tablets in cells {}, need {}",
                    req.keyspace,
                    req.role,
                    planned.cells.join(","),
                    self.config.min_healthy_destination_tablets
                );
            }
        }
        Ok(())
    }

    async fn check_replication_lag(
        &self,
        snapshot: &TopologyState,
        req: &MigrationRequest,
        planned: &MigrationOutcome,
    ) -> Result<()> {
        let Some(max_lag) = self.config.max_migration_lag() else {
            return Ok(());
        };
        for dest in &planned.destinations {
            let record = snapshot.shard(&req.keyspace, dest)?;
            let statuses = self.players.statuses(&req.keyspace, dest).await;
            for reference in &record.source_shards {
                let Some(status) = statuses
                    .iter()
                    .find(|s| s.key.uid == reference.uid && s.state != PlayerState::Starting)
                else {
                    precondition!(
                        "filtered replication {} into {}/{dest} is not running",
                        reference.uid,
                        req.keyspace
                    );
                };
                if !status.caught_up && Duration::from_millis(status.last_lag_ms) > max_lag {
                    precondition!(
                        "filtered replication {} into {}/{dest} lags {}ms, limit {max_lag:?}",
                        reference.uid,
                        req.keyspace,
                        status.last_lag_ms
                    );
                }
            }
        }
        Ok(())
    }

    /// Stop client writes on the source primaries and wait for every
    /// destination player to apply the sources' final positions.
    async fn drain_sources(
        &self,
        snapshot: &TopologyState,
        req: &MigrationRequest,
        planned: &MigrationOutcome,
    ) -> Result<()> {
        let ks = snapshot.keyspace(&req.keyspace)?;
        let mut targets = BTreeMap::new();
        for source in &planned.sources {
            let Some(primary) = ks.shard(source)?.primary.as_ref() else {
                precondition!("source shard {}/{source} has no primary tablet", req.keyspace);
            };
            let conn = self.tablets.require(primary)?;
            conn.set_query_service(false).await?;
            targets.insert(source.clone(), conn.current_position().await?);
        }
        info!(keyspace = %req.keyspace, positions = ?targets, "source primaries stopped; draining filtered replication");

        let deadline = Instant::now() + self.config.wait_timeout();
        loop {
            let pending = self
                .pending_catch_up(ks, &planned.destinations, &targets)
                .await?;
            if pending.is_empty() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ReshardError::Transient(format!(
                    "filtered replication did not drain within {:?}: {}",
                    self.config.wait_timeout(),
                    pending.join(", ")
                )));
            }
            tokio::time::sleep(self.config.player_poll_interval()).await;
        }
    }

    async fn pending_catch_up(
        &self,
        ks: &KeyspaceRecord,
        destinations: &[String],
        targets: &BTreeMap<String, Position>,
    ) -> Result<Vec<String>> {
        let mut pending = Vec::new();
        for dest in destinations {
            let record = ks.shard(dest)?;
            let statuses = self.players.statuses(&ks.name, dest).await;
            for reference in record.source_shards.iter().filter(|r| r.keyspace == ks.name) {
                let Some(target) = targets.get(&reference.shard) else {
                    continue;
                };
                match statuses.iter().find(|s| s.key.uid == reference.uid) {
                    Some(status) if status.state == PlayerState::Failed => {
                        return Err(ReshardError::Corruption(format!(
                            "filtered replication {} into {}/{dest} failed: {}",
                            reference.uid,
                            ks.name,
                            status.error.as_deref().unwrap_or("unknown error")
                        )))
                    }
                    Some(status) if status.position >= *target => {}
                    Some(status) => pending.push(format!(
                        "{dest} uid {} at {} of {target}",
                        reference.uid, status.position
                    )),
                    None => pending.push(format!("{dest} uid {} not running", reference.uid)),
                }
            }
        }
        Ok(pending)
    }

    async fn push_query_service(&self, changes: &[(TabletAlias, bool)]) {
        for (alias, enabled) in changes {
            let Some(conn) = self.tablets.get(alias) else {
                debug!(tablet = %alias, enabled, "tablet not reachable; query service change deferred");
                continue;
            };
            if let Err(err) = conn.set_query_service(*enabled).await {
                warn!(tablet = %alias, enabled, error = %err, "failed to update query service");
            }
        }
    }

    /// Push recorded query-service flags to every tablet of `shards`.
    async fn restore_query_service(&self, keyspace: &str, shards: &[String]) {
        let state = self.topo.state();
        let tablets = state
            .tablets
            .values()
            .filter(|t| t.keyspace == keyspace && shards.contains(&t.shard))
            .map(|t| (t.alias.clone(), t.query_service_enabled))
            .collect::<Vec<_>>();
        warn!(keyspace, shards = ?shards, "restoring source query service after failed cutover");
        self.push_query_service(&tablets).await;
    }

    async fn clear_checkpoint(&self, state: &TopologyState, keyspace: &str, shard: &str, uid: u32) {
        let Some(primary) = state
            .shard(keyspace, shard)
            .ok()
            .and_then(|s| s.primary.clone())
        else {
            return;
        };
        let Some(conn) = self.tablets.get(&primary) else {
            return;
        };
        if let Err(err) = conn.clear_filtered_checkpoint(uid).await {
            warn!(keyspace, shard, uid, error = %err, "failed to clear filtered replication checkpoint");
        }
    }
}

/// Insert a shard for `range`, or return the existing one.
fn insert_shard(
    ks: &mut KeyspaceRecord,
    range: KeyRange,
    served_roles: Option<&[ServingRole]>,
) -> Result<ShardRecord> {
    let name = range.shard_name();
    if let Some(existing) = ks.shards.get(&name) {
        return Ok(existing.clone());
    }
    let mut shard = ShardRecord::new(range);
    let roles = match served_roles {
        Some(roles) => {
            for role in roles {
                if let Some(other) = ks.shards.values().find(|s| {
                    s.key_range.intersects(&shard.key_range)
                        && ks.cells.iter().any(|cell| s.serves(*role, cell))
                }) {
                    precondition!(
                        "shard {}/{name} cannot serve {role}: overlapping shard {} already does",
                        ks.name,
                        other.name
                    );
                }
            }
            roles.to_vec()
        }
        None if ks.shards.values().any(|s| s.key_range.intersects(&shard.key_range)) => Vec::new(),
        None => ServingRole::ALL.to_vec(),
    };
    for role in roles {
        for cell in &ks.cells {
            shard.set_serving(role, cell, true);
        }
    }
    ks.shards.insert(name, shard.clone());
    Ok(shard)
}

async fn push_tablet_state(conn: &dyn TabletConn, record: &TabletRecord) {
    if let Err(err) = conn.set_tablet_type(record.tablet_type).await {
        warn!(tablet = %record.alias, error = %err, "failed to push tablet type");
    }
    if let Err(err) = conn.set_query_service(record.query_service_enabled).await {
        warn!(tablet = %record.alias, error = %err, "failed to push query service flag");
    }
}

/// Records references and checkpoints once a copy has landed.
struct CopyFinalizer {
    coordinator: Coordinator,
    keyspace: String,
    /// `(uid, shard, keyrange)`, uids by keyrange order.
    sources: Vec<(u32, String, KeyRange)>,
    destinations: Vec<(String, KeyRange, Arc<dyn TabletConn>)>,
}

#[async_trait]
impl CopyCompletion for CopyFinalizer {
    async fn copy_completed(&self, start_positions: &BTreeMap<String, Position>) -> Result<()> {
        let mut references = Vec::new();
        for (dest, dest_range, tablet) in &self.destinations {
            for (uid, source, source_range) in &self.sources {
                if !source_range.intersects(dest_range) {
                    continue;
                }
                let position = start_positions.get(source).copied().ok_or_else(|| {
                    ReshardError::Corruption(format!(
                        "copy finished without a start position for source {source}"
                    ))
                })?;
                tablet.set_filtered_checkpoint(*uid, position).await?;
                references.push(AddSourceShard {
                    keyspace: self.keyspace.clone(),
                    shard: dest.clone(),
                    uid: *uid,
                    source_keyspace: None,
                    source_shard: source.clone(),
                    key_range: None,
                    tables: Vec::new(),
                });
            }
        }
        let changes = self.coordinator.topo.update(|state| {
            for reference in &references {
                add_source_shard(state, reference)?;
            }
            Ok(state.refresh_query_service(&self.keyspace))
        })?;
        info!(keyspace = %self.keyspace, references = references.len(), "copy landed; filtered replication enabled");
        self.coordinator.push_query_service(&changes).await;
        self.coordinator.refresh_players().await;
        Ok(())
    }
}
