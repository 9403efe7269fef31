//! Admin client for resharding over a JSON topology file and local tablets.

use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;

use holo_reshard::copier::JobState;
use holo_reshard::local_tablet::LocalShard;
use holo_reshard::topology::TopologyState;
use holo_reshard::{
    AddSourceShard, Coordinator, CreateKeyspace, DataCopyRequest, KeyRange, KeyspaceIdType,
    MigrationRequest, ReshardConfig, ReshardError, ServingRole, TabletAlias, TabletConn,
    TabletRegistry, TabletType, TopoStore,
};

#[derive(Parser)]
#[command(name = "reshardctl")]
#[command(about = "Online resharding control for keyrange-sharded keyspaces", long_about = None)]
struct Args {
    /// Topology JSON file; created on first use.
    #[arg(long, env = "HOLO_RESHARD_TOPO_FILE", default_value = "topology.json")]
    topo_file: PathBuf,
    /// Root of tablet storage, one directory per `<keyspace>/<shard>`.
    #[arg(long, env = "HOLO_RESHARD_DATA_DIR")]
    data_dir: Option<PathBuf>,
    #[command(flatten)]
    config: ReshardConfig,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the topology JSON.
    State,
    CreateKeyspace {
        keyspace: String,
        #[arg(long, value_delimiter = ',', required = true)]
        cells: Vec<String>,
        #[arg(long, default_value = "")]
        sharding_column_name: String,
        #[arg(long, default_value = "unset")]
        sharding_column_type: KeyspaceIdType,
        #[arg(long, default_value_t = 0)]
        split_shard_count: u32,
    },
    SetKeyspaceShardingInfo {
        keyspace: String,
        column_name: String,
        column_type: KeyspaceIdType,
        #[arg(long)]
        split_shard_count: Option<u32>,
        /// Overwrite an existing, different column name or type.
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Create a shard by keyrange (`-80`, `80-c0`, `-`).
    InitShard {
        keyspace: String,
        shard: String,
        /// Roles the shard serves from the start; default depends on overlap.
        #[arg(long, value_delimiter = ',')]
        served_types: Option<Vec<ServingRole>>,
    },
    InitTablet {
        /// Tablet alias, e.g. `test_nj-0000062344`.
        alias: TabletAlias,
        keyspace: String,
        shard: String,
        tablet_type: TabletType,
    },
    ChangeTabletType {
        alias: TabletAlias,
        tablet_type: TabletType,
    },
    RebuildKeyspaceGraph {
        keyspace: String,
        #[arg(long, value_delimiter = ',')]
        cells: Vec<String>,
    },
    GetSrvKeyspace {
        cell: String,
        keyspace: String,
    },
    CopySchemaShard {
        source_tablet: TabletAlias,
        keyspace: String,
        shard: String,
        #[arg(long, value_delimiter = ',')]
        exclude_tables: Vec<String>,
    },
    /// Copy source rows into the destinations and enable filtered replication.
    SplitClone {
        keyspace: String,
        /// Destination shards.
        #[arg(required = true)]
        destinations: Vec<String>,
        #[arg(long = "source-tablet", required = true)]
        source_tablets: Vec<TabletAlias>,
        #[arg(long, value_delimiter = ',')]
        exclude_tables: Vec<String>,
        #[arg(long)]
        reader_parallelism: Option<usize>,
        #[arg(long)]
        min_table_size_for_split: Option<u64>,
    },
    /// Compare a destination shard against its sources.
    SplitDiff {
        keyspace: String,
        shard: String,
        #[arg(long, value_delimiter = ',')]
        exclude_tables: Vec<String>,
        /// Wait until filtered replication lags at most this much before comparing (ms).
        #[arg(long)]
        wait_max_lag_ms: Option<u64>,
    },
    /// Run every filtered replication stream until ctrl-c.
    RunFilteredReplication {
        /// Seconds between status reports.
        #[arg(long, default_value_t = 10)]
        report_interval_secs: u64,
    },
    /// Show filtered replication status of a destination shard.
    FilteredReplicationStatus {
        keyspace: String,
        shard: String,
    },
    MigrateServedTypes {
        keyspace: String,
        /// Source shard.
        shard: String,
        served_type: ServingRole,
        #[arg(long, value_delimiter = ',')]
        cells: Vec<String>,
        #[arg(long, default_value_t = false)]
        reverse: bool,
    },
    SourceShardAdd {
        keyspace: String,
        shard: String,
        uid: u32,
        source_shard: String,
        #[arg(long)]
        source_keyspace: Option<String>,
        #[arg(long)]
        key_range: Option<KeyRange>,
        #[arg(long, value_delimiter = ',')]
        tables: Vec<String>,
    },
    SourceShardDelete {
        keyspace: String,
        shard: String,
        uid: u32,
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    RemoveShardCell {
        keyspace: String,
        shard: String,
        cell: String,
    },
    DeleteShard {
        keyspace: String,
        shard: String,
    },
    DeleteTablet {
        alias: TabletAlias,
        #[arg(long, default_value_t = false)]
        allow_primary: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let ansi = std::io::stderr().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = err
                .downcast_ref::<ReshardError>()
                .map(|err| err.kind().exit_code())
                .unwrap_or(1);
            eprintln!("error: {err:#}");
            ExitCode::from(code)
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let topo = TopoStore::load_or_init(&args.topo_file)
        .with_context(|| format!("open topology {}", args.topo_file.display()))?;
    let registry = TabletRegistry::new();
    let mut storage = TabletStorage::new(args.data_dir.clone());
    storage.open_all(&topo.state(), &registry).await?;
    let coordinator = Coordinator::new(topo, registry.clone(), args.config.clone());

    let result = dispatch(&coordinator, &mut storage, &registry, args).await;
    coordinator.shutdown().await;
    result
}

async fn dispatch(
    coordinator: &Coordinator,
    storage: &mut TabletStorage,
    registry: &TabletRegistry,
    args: Args,
) -> anyhow::Result<()> {
    match args.command {
        Command::State => print_json(&coordinator.state())?,
        Command::CreateKeyspace {
            keyspace,
            cells,
            sharding_column_name,
            sharding_column_type,
            split_shard_count,
        } => coordinator.create_keyspace(&CreateKeyspace {
            name: keyspace,
            sharding_column_name,
            sharding_column_type,
            split_shard_count,
            cells,
        })?,
        Command::SetKeyspaceShardingInfo {
            keyspace,
            column_name,
            column_type,
            split_shard_count,
            force,
        } => coordinator.set_keyspace_sharding_info(
            &keyspace,
            &column_name,
            column_type,
            split_shard_count,
            force,
        )?,
        Command::InitShard {
            keyspace,
            shard,
            served_types,
        } => {
            let record = coordinator.init_shard(&keyspace, &shard, served_types.as_deref())?;
            print_json(&record)?;
        }
        Command::InitTablet {
            alias,
            keyspace,
            shard,
            tablet_type,
        } => {
            let record = coordinator
                .init_tablet(alias, &keyspace, &shard, tablet_type)
                .await?;
            let state = coordinator.state();
            if let Some(conn) = storage.open_tablet(&state, &record.alias)? {
                registry.register(conn.clone());
                push_recorded_state(&state, conn.as_ref()).await?;
            }
            print_json(&record)?;
        }
        Command::ChangeTabletType { alias, tablet_type } => {
            print_json(&coordinator.change_tablet_type(&alias, tablet_type).await?)?;
        }
        Command::RebuildKeyspaceGraph { keyspace, cells } => {
            for (cell, srv) in coordinator.rebuild_keyspace_graph(&keyspace, &cells).await? {
                println!("{cell}:\n{srv}");
            }
        }
        Command::GetSrvKeyspace { cell, keyspace } => {
            print!("{}", coordinator.get_srv_keyspace(&cell, &keyspace)?);
        }
        Command::CopySchemaShard {
            source_tablet,
            keyspace,
            shard,
            exclude_tables,
        } => {
            let tables = coordinator
                .copy_schema_shard(&source_tablet, &keyspace, &shard, &exclude_tables)
                .await?;
            print_json(&tables)?;
        }
        Command::SplitClone {
            keyspace,
            destinations,
            source_tablets,
            exclude_tables,
            reader_parallelism,
            min_table_size_for_split,
        } => {
            let job = coordinator
                .start_data_copy(&DataCopyRequest {
                    keyspace,
                    destination_shards: destinations,
                    source_tablets,
                    reader_parallelism,
                    min_table_size_for_split,
                    exclude_tables,
                })
                .await?;
            let status = loop {
                match job.wait(Duration::from_secs(10)).await {
                    Ok(status) => break status,
                    Err(err) if err.is_retryable() => {
                        let status = job.status();
                        info!(rows_copied = status.rows_copied, tables = status.tables.len(), "split clone in progress");
                    }
                    Err(err) => return Err(err.into()),
                }
            };
            print_json(&status)?;
            if status.state != JobState::Succeeded {
                return Err(anyhow!(
                    "split clone ended {:?}: {}",
                    status.state,
                    status.error.as_deref().unwrap_or("no error recorded")
                ));
            }
        }
        Command::SplitDiff {
            keyspace,
            shard,
            exclude_tables,
            wait_max_lag_ms,
        } => {
            if let Some(max_lag_ms) = wait_max_lag_ms {
                coordinator.refresh_players().await;
                coordinator
                    .wait_for_filtered_replication(
                        &keyspace,
                        &shard,
                        Duration::from_millis(max_lag_ms),
                        coordinator.config().wait_timeout(),
                    )
                    .await
                    .context("waiting for filtered replication before split diff")?;
            }
            let report = coordinator
                .verify_consistency(&keyspace, &shard, exclude_tables)
                .await?;
            print_json(&report)?;
            report.into_result()?;
        }
        Command::RunFilteredReplication {
            report_interval_secs,
        } => {
            coordinator.refresh_players().await;
            let mut ticker = tokio::time::interval(Duration::from_secs(report_interval_secs.max(1)));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for status in coordinator.player_statuses().await {
                            info!(
                                player = ?status.key,
                                source = %status.source_shard,
                                state = ?status.state,
                                position = status.position,
                                lag_ms = status.last_lag_ms,
                                "filtered replication status"
                            );
                        }
                    }
                    res = tokio::signal::ctrl_c() => {
                        res.context("wait for ctrl-c")?;
                        break;
                    }
                }
            }
        }
        Command::FilteredReplicationStatus { keyspace, shard } => {
            print_json(&coordinator.filtered_replication_status(&keyspace, &shard).await?)?;
        }
        Command::MigrateServedTypes {
            keyspace,
            shard,
            served_type,
            cells,
            reverse,
        } => {
            // Primary cutover drains running players, so start them first.
            coordinator.refresh_players().await;
            let outcome = coordinator
                .migrate_served_type(&MigrationRequest {
                    keyspace,
                    source_shard: shard,
                    role: served_type,
                    cells,
                    reverse,
                })
                .await?;
            print_json(&outcome)?;
        }
        Command::SourceShardAdd {
            keyspace,
            shard,
            uid,
            source_shard,
            source_keyspace,
            key_range,
            tables,
        } => {
            let reference = coordinator
                .add_source_shard_reference(&AddSourceShard {
                    keyspace,
                    shard,
                    uid,
                    source_keyspace,
                    source_shard,
                    key_range,
                    tables,
                })
                .await?;
            print_json(&reference)?;
        }
        Command::SourceShardDelete {
            keyspace,
            shard,
            uid,
            force,
        } => {
            let reference = coordinator
                .delete_source_shard_reference(&keyspace, &shard, uid, force)
                .await?;
            print_json(&reference)?;
        }
        Command::RemoveShardCell {
            keyspace,
            shard,
            cell,
        } => coordinator.remove_shard_cell(&keyspace, &shard, &cell)?,
        Command::DeleteShard { keyspace, shard } => coordinator.delete_shard(&keyspace, &shard).await?,
        Command::DeleteTablet {
            alias,
            allow_primary,
        } => {
            print_json(&coordinator.delete_tablet(&alias, allow_primary).await?)?;
        }
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Tablet storage under `--data-dir`, opened on demand.
struct TabletStorage {
    data_dir: Option<PathBuf>,
    shards: BTreeMap<(String, String), Arc<LocalShard>>,
}

impl TabletStorage {
    fn new(data_dir: Option<PathBuf>) -> Self {
        Self {
            data_dir,
            shards: BTreeMap::new(),
        }
    }

    fn shard_dir(root: &Path, keyspace: &str, shard: &str) -> PathBuf {
        root.join(keyspace).join(shard)
    }

    /// Open every tablet in `state` and bring its runtime flags in line.
    async fn open_all(&mut self, state: &TopologyState, registry: &TabletRegistry) -> anyhow::Result<()> {
        let aliases = state
            .tablets
            .values()
            .map(|t| t.alias.clone())
            .collect::<Vec<_>>();
        for alias in aliases {
            if let Some(conn) = self.open_tablet(state, &alias)? {
                push_recorded_state(state, conn.as_ref()).await?;
                registry.register(conn);
            }
        }
        Ok(())
    }

    fn open_tablet(
        &mut self,
        state: &TopologyState,
        alias: &TabletAlias,
    ) -> anyhow::Result<Option<Arc<dyn TabletConn>>> {
        let Some(root) = self.data_dir.as_ref() else {
            return Ok(None);
        };
        let tablet = state.tablet(alias)?;
        let key = (tablet.keyspace.clone(), tablet.shard.clone());
        let shard = match self.shards.get(&key) {
            Some(shard) => shard.clone(),
            None => {
                let record = state.shard(&tablet.keyspace, &tablet.shard)?;
                let path = Self::shard_dir(root, &tablet.keyspace, &tablet.shard);
                let shard = LocalShard::open(&path, record.key_range.clone())
                    .with_context(|| format!("open tablet storage {}", path.display()))?;
                self.shards.insert(key, shard.clone());
                shard
            }
        };
        let conn: Arc<dyn TabletConn> = shard.tablet(alias.clone(), tablet.tablet_type);
        Ok(Some(conn))
    }
}

async fn push_recorded_state(state: &TopologyState, conn: &dyn TabletConn) -> anyhow::Result<()> {
    let record = state.tablet(conn.alias())?;
    conn.set_tablet_type(record.tablet_type).await?;
    conn.set_query_service(record.query_service_enabled).await?;
    Ok(())
}
