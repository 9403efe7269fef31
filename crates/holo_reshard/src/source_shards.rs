//! Source-shard references: which source slices a destination replicates from.

use crate::error::{ReshardError, Result};
use crate::keyrange::{ranges_cover, KeyRange};
use crate::precondition;
use crate::topology::{ShardRecord, SourceShard, TopologyState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddSourceShard {
    pub keyspace: String,
    pub shard: String,
    pub uid: u32,
    /// Defaults to the destination keyspace.
    pub source_keyspace: Option<String>,
    pub source_shard: String,
    /// Defaults to the source shard keyrange.
    pub key_range: Option<KeyRange>,
    pub tables: Vec<String>,
}

/// Fails unless the references of `shard` jointly cover its keyrange.
pub fn check_source_coverage(shard: &ShardRecord) -> Result<()> {
    if shard.source_shards.is_empty() {
        precondition!("shard {} has no source shard references", shard.name);
    }
    let ranges = shard
        .source_shards
        .iter()
        .map(|s| s.key_range.clone())
        .collect::<Vec<_>>();
    if !ranges_cover(&shard.key_range, &ranges) {
        precondition!(
            "source shard references of {} ({}) do not cover its keyrange",
            shard.name,
            ranges
                .iter()
                .map(KeyRange::shard_name)
                .collect::<Vec<_>>()
                .join(" ")
        );
    }
    Ok(())
}

pub fn add_source_shard(state: &mut TopologyState, req: &AddSourceShard) -> Result<SourceShard> {
    let source_keyspace = req.source_keyspace.clone().unwrap_or_else(|| req.keyspace.clone());
    let source_range = state.shard(&source_keyspace, &req.source_shard)?.key_range.clone();
    if source_keyspace == req.keyspace && req.source_shard == req.shard {
        precondition!("shard {}/{} cannot replicate from itself", req.keyspace, req.shard);
    }
    let key_range = req.key_range.clone().unwrap_or(source_range);

    let dest = state.keyspace_mut(&req.keyspace)?.shard_mut(&req.shard)?;
    if dest.source_shards.iter().any(|s| s.uid == req.uid) {
        precondition!(
            "shard {}/{} already has a source shard reference with uid {}",
            req.keyspace,
            req.shard,
            req.uid
        );
    }
    let Some(slice) = key_range.intersection(&dest.key_range) else {
        precondition!(
            "source keyrange {key_range} does not intersect destination {}",
            dest.key_range
        );
    };
    for existing in &dest.source_shards {
        let overlaps = existing
            .key_range
            .intersection(&dest.key_range)
            .is_some_and(|other| other.intersects(&slice));
        if overlaps {
            precondition!(
                "source keyrange {key_range} overlaps reference {} ({}/{} {}) of {}/{}",
                existing.uid,
                existing.keyspace,
                existing.shard,
                existing.key_range,
                req.keyspace,
                req.shard
            );
        }
    }
    let reference = SourceShard {
        uid: req.uid,
        keyspace: source_keyspace,
        shard: req.source_shard.clone(),
        key_range,
        tables: req.tables.clone(),
    };
    dest.source_shards.push(reference.clone());
    dest.source_shards.sort_by_key(|s| s.uid);
    Ok(reference)
}

/// Remove reference `uid` from a destination.
///
/// Removing the last reference is always allowed; leaving a partial set
/// that no longer covers the destination needs `force`.
pub fn delete_source_shard(
    state: &mut TopologyState,
    keyspace: &str,
    shard: &str,
    uid: u32,
    force: bool,
) -> Result<SourceShard> {
    let dest = state.keyspace_mut(keyspace)?.shard_mut(shard)?;
    let idx = dest
        .source_shards
        .iter()
        .position(|s| s.uid == uid)
        .ok_or_else(|| {
            ReshardError::NotFound(format!("source shard reference {uid} on {keyspace}/{shard}"))
        })?;
    let remaining = dest
        .source_shards
        .iter()
        .filter(|s| s.uid != uid)
        .map(|s| s.key_range.clone())
        .collect::<Vec<_>>();
    if !remaining.is_empty() && !force && !ranges_cover(&dest.key_range, &remaining) {
        precondition!(
            "deleting source shard reference {uid} would leave {keyspace}/{shard} without a source for part of {}",
            dest.key_range
        );
    }
    Ok(dest.source_shards.remove(idx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyrange::KeyspaceIdType;
    use crate::topology::KeyspaceRecord;
    use std::collections::BTreeMap;

    fn state_with(shards: &[&str]) -> TopologyState {
        let mut state = TopologyState::default();
        let shards = shards
            .iter()
            .map(|name| {
                let shard = ShardRecord::new(KeyRange::parse(name).expect("keyrange"));
                (shard.name.clone(), shard)
            })
            .collect();
        state.keyspaces.insert(
            "test_keyspace".into(),
            KeyspaceRecord {
                name: "test_keyspace".into(),
                sharding_column_name: "custom_sharding_key".into(),
                sharding_column_type: KeyspaceIdType::Uint64,
                split_shard_count: 0,
                cells: ["test_nj".to_string()].into(),
                shards,
                srv: BTreeMap::new(),
            },
        );
        state
    }

    fn add(uid: u32, dest: &str, source: &str, range: Option<&str>) -> AddSourceShard {
        AddSourceShard {
            keyspace: "test_keyspace".into(),
            shard: dest.into(),
            uid,
            source_keyspace: None,
            source_shard: source.into(),
            key_range: range.map(|r| KeyRange::parse(r).expect("keyrange")),
            tables: Vec::new(),
        }
    }

    #[test]
    fn add_defaults_range_and_rejects_overlap() {
        let mut state = state_with(&["-80", "80-", "80-c0", "c0-", "-"]);
        let reference = add_source_shard(&mut state, &add(0, "80-c0", "80-", None)).expect("add");
        assert_eq!(reference.key_range, KeyRange::parse("80-").expect("keyrange"));

        let err = add_source_shard(&mut state, &add(0, "80-c0", "-", None)).expect_err("dup uid");
        assert!(err.to_string().contains("uid 0"), "{err}");
        let err = add_source_shard(&mut state, &add(1, "80-c0", "-", None)).expect_err("overlap");
        assert!(err.to_string().contains("overlaps"), "{err}");
        let err = add_source_shard(&mut state, &add(1, "80-c0", "-80", None)).expect_err("disjoint");
        assert!(err.to_string().contains("does not intersect"), "{err}");
        check_source_coverage(state.shard("test_keyspace", "80-c0").expect("shard")).expect("covered");
    }

    #[test]
    fn delete_guards_coverage_unless_forced() {
        let mut state = state_with(&["80-", "80-c0", "c0-", "-"]);
        add_source_shard(&mut state, &add(0, "80-", "80-c0", None)).expect("add first");
        add_source_shard(&mut state, &add(1, "80-", "c0-", None)).expect("add second");
        check_source_coverage(state.shard("test_keyspace", "80-").expect("shard")).expect("covered");

        let err = delete_source_shard(&mut state, "test_keyspace", "80-", 1, false).expect_err("gap");
        assert!(matches!(err, ReshardError::Precondition(_)));
        delete_source_shard(&mut state, "test_keyspace", "80-", 1, true).expect("forced");
        assert!(check_source_coverage(state.shard("test_keyspace", "80-").expect("shard")).is_err());
        delete_source_shard(&mut state, "test_keyspace", "80-", 0, false).expect("last one");
        assert!(state.shard("test_keyspace", "80-").expect("shard").source_shards.is_empty());
        assert!(matches!(
            delete_source_shard(&mut state, "test_keyspace", "80-", 0, false),
            Err(ReshardError::NotFound(_))
        ));
    }
}
