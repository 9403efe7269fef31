//! Keyspace, shard and tablet records plus the serving partitions routing reads.
//!
//! `TopologyState` is the unit stored by `TopoStore`: every transition works
//! on a clone and is published as a whole, so readers never observe a
//! half-migrated partition set.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ReshardError, Result};
use crate::keyrange::{check_tiling, KeyRange, KeyspaceIdType};

/// Role a tablet currently plays inside its shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TabletType {
    Primary,
    Replica,
    Rdonly,
    Spare,
}

impl TabletType {
    pub fn serving_role(self) -> Option<ServingRole> {
        match self {
            TabletType::Primary => Some(ServingRole::Primary),
            TabletType::Replica => Some(ServingRole::Replica),
            TabletType::Rdonly => Some(ServingRole::Rdonly),
            TabletType::Spare => None,
        }
    }
}

impl FromStr for TabletType {
    type Err = ReshardError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "primary" | "master" => Ok(TabletType::Primary),
            "replica" => Ok(TabletType::Replica),
            "rdonly" | "batch" => Ok(TabletType::Rdonly),
            "spare" => Ok(TabletType::Spare),
            other => Err(ReshardError::InvalidArgument(format!(
                "unknown tablet type {other:?}"
            ))),
        }
    }
}

impl fmt::Display for TabletType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TabletType::Primary => "primary",
            TabletType::Replica => "replica",
            TabletType::Rdonly => "rdonly",
            TabletType::Spare => "spare",
        };
        f.write_str(name)
    }
}

/// Independently migratable traffic class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServingRole {
    Primary,
    Replica,
    Rdonly,
}

impl ServingRole {
    pub const ALL: [ServingRole; 3] = [ServingRole::Primary, ServingRole::Replica, ServingRole::Rdonly];

    pub fn tablet_type(self) -> TabletType {
        match self {
            ServingRole::Primary => TabletType::Primary,
            ServingRole::Replica => TabletType::Replica,
            ServingRole::Rdonly => TabletType::Rdonly,
        }
    }
}

impl FromStr for ServingRole {
    type Err = ReshardError;

    fn from_str(s: &str) -> Result<Self> {
        TabletType::from_str(s)?.serving_role().ok_or_else(|| {
            ReshardError::InvalidArgument(format!("{s:?} is not a serving role"))
        })
    }
}

impl fmt::Display for ServingRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.tablet_type().fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TabletAlias {
    pub cell: String,
    pub uid: u32,
}

impl TabletAlias {
    pub fn new(cell: impl Into<String>, uid: u32) -> Self {
        Self {
            cell: cell.into(),
            uid,
        }
    }
}

impl fmt::Display for TabletAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:010}", self.cell, self.uid)
    }
}

impl FromStr for TabletAlias {
    type Err = ReshardError;

    fn from_str(s: &str) -> Result<Self> {
        let (cell, uid) = s.rsplit_once('-').ok_or_else(|| {
            ReshardError::InvalidArgument(format!("tablet alias {s:?} must be <cell>-<uid>"))
        })?;
        let uid = uid.parse::<u32>().map_err(|err| {
            ReshardError::InvalidArgument(format!("tablet alias {s:?} uid: {err}"))
        })?;
        if cell.is_empty() {
            return Err(ReshardError::InvalidArgument(format!(
                "tablet alias {s:?} has an empty cell"
            )));
        }
        Ok(Self::new(cell, uid))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletRecord {
    pub alias: TabletAlias,
    pub keyspace: String,
    pub shard: String,
    pub tablet_type: TabletType,
    /// Desired query-service state derived from shard serving flags.
    #[serde(default)]
    pub query_service_enabled: bool,
}

/// Dependency of a destination shard on a source shard for filtered replication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceShard {
    pub uid: u32,
    pub keyspace: String,
    pub shard: String,
    pub key_range: KeyRange,
    /// Restrict replay to these tables; empty means all tables.
    #[serde(default)]
    pub tables: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub matched: bool,
    pub summary: String,
    pub verified_unix_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRecord {
    pub name: String,
    pub key_range: KeyRange,
    #[serde(default)]
    pub primary: Option<TabletAlias>,
    /// Cells holding tablets of this shard.
    #[serde(default)]
    pub cells: BTreeSet<String>,
    /// Cells in which this shard is authoritative, per role.
    #[serde(default)]
    pub served_types: BTreeMap<ServingRole, BTreeSet<String>>,
    #[serde(default)]
    pub source_shards: Vec<SourceShard>,
    #[serde(default)]
    pub verification: Option<VerificationRecord>,
}

impl ShardRecord {
    pub fn new(key_range: KeyRange) -> Self {
        Self {
            name: key_range.shard_name(),
            key_range,
            primary: None,
            cells: BTreeSet::new(),
            served_types: BTreeMap::new(),
            source_shards: Vec::new(),
            verification: None,
        }
    }

    pub fn serves(&self, role: ServingRole, cell: &str) -> bool {
        self.served_types
            .get(&role)
            .map(|cells| cells.contains(cell))
            .unwrap_or(false)
    }

    pub fn serves_anything(&self) -> bool {
        self.served_types.values().any(|cells| !cells.is_empty())
    }

    pub fn serves_in_cell(&self, cell: &str) -> bool {
        self.served_types.values().any(|cells| cells.contains(cell))
    }

    pub fn set_serving(&mut self, role: ServingRole, cell: &str, serving: bool) {
        if serving {
            self.served_types
                .entry(role)
                .or_default()
                .insert(cell.to_string());
        } else if let Some(cells) = self.served_types.get_mut(&role) {
            cells.remove(cell);
            if cells.is_empty() {
                self.served_types.remove(&role);
            }
        }
    }
}

/// One entry of a serving partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardReference {
    pub name: String,
    pub key_range: KeyRange,
}

/// Per-cell routing view of a keyspace: the partition table clients consult.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SrvKeyspace {
    pub sharding_column_name: String,
    pub sharding_column_type: KeyspaceIdType,
    pub partitions: BTreeMap<ServingRole, Vec<ShardReference>>,
}

impl SrvKeyspace {
    pub fn partition(&self, role: ServingRole) -> &[ShardReference] {
        self.partitions
            .get(&role)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Shard serving `keyspace_id` for `role`, if any.
    pub fn shard_for(&self, role: ServingRole, keyspace_id: &[u8]) -> Option<&ShardReference> {
        self.partition(role)
            .iter()
            .find(|shard| shard.key_range.contains(keyspace_id))
    }
}

impl fmt::Display for SrvKeyspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Alphabetical by role name.
        for role in [ServingRole::Primary, ServingRole::Rdonly, ServingRole::Replica] {
            let Some(shards) = self.partitions.get(&role) else {
                continue;
            };
            let names = shards
                .iter()
                .map(|s| s.name.as_str())
                .collect::<Vec<_>>()
                .join(" ");
            writeln!(f, "Partitions({role}): {names}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyspaceRecord {
    pub name: String,
    #[serde(default)]
    pub sharding_column_name: String,
    #[serde(default)]
    pub sharding_column_type: KeyspaceIdType,
    #[serde(default)]
    pub split_shard_count: u32,
    pub cells: BTreeSet<String>,
    #[serde(default)]
    pub shards: BTreeMap<String, ShardRecord>,
    /// Published partitions, per cell.
    #[serde(default)]
    pub srv: BTreeMap<String, SrvKeyspace>,
}

impl KeyspaceRecord {
    pub fn shard(&self, name: &str) -> Result<&ShardRecord> {
        self.shards
            .get(name)
            .ok_or_else(|| ReshardError::NotFound(format!("shard {}/{name}", self.name)))
    }

    pub fn shard_mut(&mut self, name: &str) -> Result<&mut ShardRecord> {
        let keyspace = self.name.clone();
        self.shards
            .get_mut(name)
            .ok_or_else(|| ReshardError::NotFound(format!("shard {keyspace}/{name}")))
    }

    /// Recompute the published partitions for `cells` (all keyspace cells when `None`).
    ///
    /// Fails without touching `self.srv` when any non-empty partition does not
    /// tile the key space.
    pub fn rebuild_srv(&mut self, cells: Option<&[String]>) -> Result<()> {
        let cells = match cells {
            Some(cells) => cells.to_vec(),
            None => self.cells.iter().cloned().collect(),
        };
        let mut rebuilt = Vec::with_capacity(cells.len());
        for cell in &cells {
            let mut srv = SrvKeyspace {
                sharding_column_name: self.sharding_column_name.clone(),
                sharding_column_type: self.sharding_column_type,
                partitions: BTreeMap::new(),
            };
            for role in ServingRole::ALL {
                let mut shards = self
                    .shards
                    .values()
                    .filter(|shard| shard.serves(role, cell))
                    .map(|shard| ShardReference {
                        name: shard.name.clone(),
                        key_range: shard.key_range.clone(),
                    })
                    .collect::<Vec<_>>();
                if shards.is_empty() {
                    continue;
                }
                shards.sort_by(|a, b| a.key_range.cmp(&b.key_range));
                let ranges = shards
                    .iter()
                    .map(|s| s.key_range.clone())
                    .collect::<Vec<_>>();
                if let Err(err) = check_tiling(&ranges) {
                    return Err(ReshardError::Precondition(format!(
                        "partition for {role} in cell {cell} of keyspace {} does not tile the key space: {err}",
                        self.name
                    )));
                }
                srv.partitions.insert(role, shards);
            }
            rebuilt.push((cell.clone(), srv));
        }
        for (cell, srv) in rebuilt {
            if srv.partitions.is_empty() {
                self.srv.remove(&cell);
            } else {
                self.srv.insert(cell, srv);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyState {
    pub version: u64,
    #[serde(default)]
    pub keyspaces: BTreeMap<String, KeyspaceRecord>,
    /// Tablets keyed by `TabletAlias` display form.
    #[serde(default)]
    pub tablets: BTreeMap<String, TabletRecord>,
}

impl TopologyState {
    pub fn keyspace(&self, name: &str) -> Result<&KeyspaceRecord> {
        self.keyspaces
            .get(name)
            .ok_or_else(|| ReshardError::NotFound(format!("keyspace {name}")))
    }

    pub fn keyspace_mut(&mut self, name: &str) -> Result<&mut KeyspaceRecord> {
        self.keyspaces
            .get_mut(name)
            .ok_or_else(|| ReshardError::NotFound(format!("keyspace {name}")))
    }

    pub fn shard(&self, keyspace: &str, shard: &str) -> Result<&ShardRecord> {
        self.keyspace(keyspace)?.shard(shard)
    }

    pub fn tablet(&self, alias: &TabletAlias) -> Result<&TabletRecord> {
        self.tablets
            .get(&alias.to_string())
            .ok_or_else(|| ReshardError::NotFound(format!("tablet {alias}")))
    }

    pub fn tablets_in_shard<'a>(
        &'a self,
        keyspace: &'a str,
        shard: &'a str,
    ) -> impl Iterator<Item = &'a TabletRecord> + 'a {
        self.tablets
            .values()
            .filter(move |t| t.keyspace == keyspace && t.shard == shard)
    }

    /// Whether query service should run on `tablet` given current serving flags.
    ///
    /// A primary whose shard still receives filtered replication stays
    /// disabled even if a serving flag says otherwise.
    pub fn desired_query_service(&self, tablet: &TabletRecord) -> bool {
        let Some(role) = tablet.tablet_type.serving_role() else {
            return false;
        };
        let Ok(shard) = self.shard(&tablet.keyspace, &tablet.shard) else {
            return false;
        };
        if role == ServingRole::Primary && !shard.source_shards.is_empty() {
            return false;
        }
        shard.serves(role, &tablet.alias.cell)
    }

    /// Recompute desired query-service flags for tablets of `keyspace`.
    ///
    /// Returns the tablets whose flag changed, with the new value.
    pub fn refresh_query_service(&mut self, keyspace: &str) -> Vec<(TabletAlias, bool)> {
        let desired = self
            .tablets
            .iter()
            .filter(|(_, t)| t.keyspace == keyspace)
            .map(|(key, t)| (key.clone(), self.desired_query_service(t)))
            .collect::<Vec<_>>();
        let mut changed = Vec::new();
        for (key, enabled) in desired {
            if let Some(tablet) = self.tablets.get_mut(&key) {
                if tablet.query_service_enabled != enabled {
                    tablet.query_service_enabled = enabled;
                    changed.push((tablet.alias.clone(), enabled));
                }
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serving_shard(name: &str, cells: &[&str]) -> ShardRecord {
        let mut shard = ShardRecord::new(KeyRange::parse(name).expect("keyrange"));
        for role in ServingRole::ALL {
            for cell in cells {
                shard.set_serving(role, cell, true);
            }
        }
        shard
    }

    fn keyspace(shards: Vec<ShardRecord>) -> KeyspaceRecord {
        KeyspaceRecord {
            name: "test_keyspace".into(),
            sharding_column_name: "custom_sharding_key".into(),
            sharding_column_type: KeyspaceIdType::Uint64,
            split_shard_count: 4,
            cells: ["test_nj".to_string(), "test_ny".to_string()].into(),
            shards: shards.into_iter().map(|s| (s.name.clone(), s)).collect(),
            srv: BTreeMap::new(),
        }
    }

    #[test]
    fn alias_round_trips_through_display() {
        let alias = TabletAlias::new("test_nj", 62344);
        assert_eq!(alias.to_string(), "test_nj-0000062344");
        assert_eq!("test_nj-0000062344".parse::<TabletAlias>().expect("alias"), alias);
        assert!("62344".parse::<TabletAlias>().is_err());
    }

    #[test]
    fn rebuild_publishes_sorted_partitions() {
        let mut ks = keyspace(vec![
            serving_shard("80-", &["test_nj", "test_ny"]),
            serving_shard("-80", &["test_nj", "test_ny"]),
            ShardRecord::new(KeyRange::parse("80-c0").expect("keyrange")),
        ]);
        ks.rebuild_srv(None).expect("rebuild");
        let srv = ks.srv.get("test_nj").expect("srv keyspace");
        assert_eq!(
            srv.to_string(),
            "Partitions(primary): -80 80-\nPartitions(rdonly): -80 80-\nPartitions(replica): -80 80-\n"
        );
        let routed = srv
            .shard_for(ServingRole::Replica, &[0x90, 0, 0, 0])
            .expect("routed");
        assert_eq!(routed.name, "80-");
    }

    #[test]
    fn rebuild_rejects_overlapping_partitions_without_publishing() {
        let mut ks = keyspace(vec![
            serving_shard("-80", &["test_nj"]),
            serving_shard("80-", &["test_nj"]),
        ]);
        ks.rebuild_srv(None).expect("rebuild");
        let before = ks.srv.clone();

        let mut overlapping = serving_shard("80-c0", &["test_nj"]);
        overlapping.served_types.remove(&ServingRole::Primary);
        ks.shards.insert(overlapping.name.clone(), overlapping);
        let err = ks.rebuild_srv(None).expect_err("overlap must fail");
        assert!(err.to_string().contains("does not tile"), "unexpected: {err}");
        assert_eq!(ks.srv, before);
    }

    #[test]
    fn query_service_follows_serving_flags() {
        let mut state = TopologyState::default();
        let mut dest = ShardRecord::new(KeyRange::parse("80-c0").expect("keyrange"));
        dest.source_shards.push(SourceShard {
            uid: 0,
            keyspace: "test_keyspace".into(),
            shard: "80-".into(),
            key_range: KeyRange::parse("80-").expect("keyrange"),
            tables: Vec::new(),
        });
        dest.set_serving(ServingRole::Primary, "test_nj", true);
        dest.set_serving(ServingRole::Replica, "test_nj", true);
        state
            .keyspaces
            .insert("test_keyspace".into(), keyspace(vec![dest]));
        for (uid, tablet_type) in [(1, TabletType::Primary), (2, TabletType::Replica), (3, TabletType::Spare)] {
            let alias = TabletAlias::new("test_nj", uid);
            state.tablets.insert(
                alias.to_string(),
                TabletRecord {
                    alias,
                    keyspace: "test_keyspace".into(),
                    shard: "80-c0".into(),
                    tablet_type,
                    query_service_enabled: false,
                },
            );
        }

        let changed = state.refresh_query_service("test_keyspace");
        // Primary stays off while filtered replication is still attached.
        assert_eq!(changed, vec![(TabletAlias::new("test_nj", 2), true)]);
    }
}
