//! Online horizontal resharding for a keyrange-sharded keyspace.
//!
//! Data moves from source shards into destination shards while the sources
//! keep serving: a bulk copy, then filtered replication of the source change
//! log, then an optional consistency check, then per-role serving cutover
//! (rdonly, replica, primary). `Coordinator` exposes the whole workflow.

pub mod backoff;
pub mod binlog_player;
pub mod config;
pub mod coordinator;
pub mod copier;
pub mod error;
pub mod keyrange;
pub mod local_tablet;
pub mod migration;
pub mod row;
pub mod source_shards;
pub mod tablet;
pub mod topo_store;
pub mod topology;
pub mod verifier;

pub use config::ReshardConfig;
pub use coordinator::{Coordinator, CreateKeyspace, DataCopyRequest};
pub use error::{ErrorKind, ReshardError, Result};
pub use keyrange::{KeyRange, KeyspaceIdType};
pub use migration::{MigrationOutcome, MigrationRequest};
pub use source_shards::AddSourceShard;
pub use tablet::{TabletConn, TabletRegistry};
pub use topo_store::TopoStore;
pub use topology::{ServingRole, TabletAlias, TabletType};
