//! Serving-type migration: flips which shards serve a role in a set of cells.
//!
//! `apply_migration` is a pure transition over a `TopologyState` copy. Every
//! precondition is checked before anything is flipped, and the partitions of
//! the touched cells are rebuilt (and must tile) as part of the same
//! transition, so a failed migration leaves nothing behind.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{ReshardError, Result};
use crate::keyrange::{check_tiling_of, KeyRange};
use crate::precondition;
use crate::source_shards::check_source_coverage;
use crate::topology::{KeyspaceRecord, ServingRole, TabletAlias, TopologyState};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRequest {
    pub keyspace: String,
    /// Source shard, by name or keyrange (`80-`).
    pub source_shard: String,
    pub role: ServingRole,
    /// Cells to migrate; empty means every cell of the keyspace.
    #[serde(default)]
    pub cells: Vec<String>,
    #[serde(default)]
    pub reverse: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServingState {
    SourceServing,
    DestinationServing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationOutcome {
    /// True when every requested cell was already in the target state.
    pub noop: bool,
    /// Cells whose serving flags flipped.
    pub cells: Vec<String>,
    pub sources: Vec<String>,
    pub destinations: Vec<String>,
    /// `(destination shard, uid)` references removed by a primary cutover.
    pub torn_down: Vec<(String, u32)>,
    /// Tablets whose desired query-service flag changed.
    pub query_service: Vec<(TabletAlias, bool)>,
}

/// Shards on both sides of a migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationShards {
    pub sources: Vec<String>,
    pub destinations: Vec<String>,
    pub key_range: KeyRange,
}

/// Resolve a shard name or keyrange to the shard's canonical name.
pub fn resolve_shard_name(ks: &KeyspaceRecord, name: &str) -> Result<String> {
    if ks.shards.contains_key(name) {
        return Ok(name.to_string());
    }
    let canonical = KeyRange::parse(name)?.shard_name();
    ks.shard(&canonical)?;
    Ok(canonical)
}

/// Find the shards a migration of `source` moves traffic between.
///
/// Destinations are the shards replicating from `source`; once their
/// references are gone (after a primary cutover) they are the shards lying
/// inside the source keyrange. When a destination replicates from several
/// sources (a merge), all of them migrate together.
pub fn resolve_shards(ks: &KeyspaceRecord, source: &str) -> Result<MigrationShards> {
    let source_record = ks.shard(source)?;
    let mut destinations = ks
        .shards
        .values()
        .filter(|s| {
            s.source_shards
                .iter()
                .any(|r| r.keyspace == ks.name && r.shard == source)
        })
        .map(|s| s.name.clone())
        .collect::<Vec<_>>();
    let mut sources = BTreeSet::from([source.to_string()]);
    if destinations.is_empty() {
        destinations = ks
            .shards
            .values()
            .filter(|s| s.name != source && source_record.key_range.covers(&s.key_range))
            .map(|s| s.name.clone())
            .collect();
    } else {
        for dest in &destinations {
            for reference in &ks.shard(dest)?.source_shards {
                if reference.keyspace == ks.name && ks.shards.contains_key(&reference.shard) {
                    sources.insert(reference.shard.clone());
                }
            }
        }
    }
    if destinations.is_empty() {
        precondition!("no destination shards found for source shard {}/{source}", ks.name);
    }

    let source_ranges = sources
        .iter()
        .map(|s| ks.shard(s).map(|r| r.key_range.clone()))
        .collect::<Result<Vec<_>>>()?;
    let dest_ranges = destinations
        .iter()
        .map(|s| ks.shard(s).map(|r| r.key_range.clone()))
        .collect::<Result<Vec<_>>>()?;
    let mut sorted = source_ranges.clone();
    sorted.sort();
    let key_range = KeyRange {
        start: sorted[0].start.clone(),
        end: sorted[sorted.len() - 1].end.clone(),
    };
    check_tiling_of(&key_range, &source_ranges).map_err(|err| {
        ReshardError::Precondition(format!("source shards of {}/{source} do not tile {key_range}: {err}", ks.name))
    })?;
    check_tiling_of(&key_range, &dest_ranges).map_err(|err| {
        ReshardError::Precondition(format!(
            "destination shards {} do not tile {key_range}: {err}",
            destinations.join(" ")
        ))
    })?;
    destinations.sort_by(|a, b| {
        let ra = ks.shards.get(a).map(|s| &s.key_range);
        let rb = ks.shards.get(b).map(|s| &s.key_range);
        ra.cmp(&rb)
    });
    Ok(MigrationShards {
        sources: sources.into_iter().collect(),
        destinations,
        key_range,
    })
}

/// Which side serves `role` in `cell`. Mixed or empty serving is an error.
pub fn serving_state(
    ks: &KeyspaceRecord,
    shards: &MigrationShards,
    role: ServingRole,
    cell: &str,
) -> Result<ServingState> {
    let side = |names: &[String]| -> Result<(bool, bool)> {
        let mut all = true;
        let mut any = false;
        for name in names {
            let serves = ks.shard(name)?.serves(role, cell);
            all &= serves;
            any |= serves;
        }
        Ok((all, any))
    };
    let (src_all, src_any) = side(&shards.sources)?;
    let (dst_all, dst_any) = side(&shards.destinations)?;
    match (src_all, src_any, dst_all, dst_any) {
        (true, _, false, false) => Ok(ServingState::SourceServing),
        (false, false, true, _) => Ok(ServingState::DestinationServing),
        _ => precondition!(
            "inconsistent {role} serving state in cell {cell}: sources {} serve={src_any}, destinations {} serve={dst_any}",
            shards.sources.join(" "),
            shards.destinations.join(" ")
        ),
    }
}

/// Apply one serving-type transition to `state`.
pub fn apply_migration(state: &mut TopologyState, req: &MigrationRequest) -> Result<MigrationOutcome> {
    let ks = state.keyspace(&req.keyspace)?;
    let source = resolve_shard_name(ks, &req.source_shard)?;
    let shards = resolve_shards(ks, &source)?;

    let all_cells = ks.cells.iter().cloned().collect::<Vec<_>>();
    let cells = if req.cells.is_empty() {
        all_cells.clone()
    } else {
        let requested = req.cells.iter().cloned().collect::<BTreeSet<_>>();
        if let Some(unknown) = requested.iter().find(|c| !ks.cells.contains(*c)) {
            return Err(ReshardError::InvalidArgument(format!(
                "cell {unknown} is not a cell of keyspace {}",
                req.keyspace
            )));
        }
        requested.into_iter().collect()
    };

    if req.role == ServingRole::Primary {
        if cells.len() != all_cells.len() {
            precondition!(
                "primary migration of {}/{source} must cover every cell ({}), got {}",
                req.keyspace,
                all_cells.join(","),
                cells.join(",")
            );
        }
        if req.reverse {
            precondition!(
                "primary migration of {}/{source} cannot be reversed",
                req.keyspace
            );
        }
    }

    let mut flips = Vec::new();
    for cell in &cells {
        match (serving_state(ks, &shards, req.role, cell)?, req.reverse) {
            (ServingState::SourceServing, false) | (ServingState::DestinationServing, true) => {
                flips.push(cell.clone())
            }
            (ServingState::DestinationServing, false) => {}
            (ServingState::SourceServing, true) => precondition!(
                "cannot reverse {} in cell {cell}: {}/{source} still serves it",
                req.role,
                req.keyspace
            ),
        }
    }

    let mut outcome = MigrationOutcome {
        noop: flips.is_empty(),
        cells: flips.clone(),
        sources: shards.sources.clone(),
        destinations: shards.destinations.clone(),
        torn_down: Vec::new(),
        query_service: Vec::new(),
    };
    if flips.is_empty() {
        return Ok(outcome);
    }

    if req.reverse && req.role != ServingRole::Primary {
        for cell in &all_cells {
            if serving_state(ks, &shards, ServingRole::Primary, cell)? == ServingState::DestinationServing {
                precondition!(
                    "cannot reverse {}: primary of {}/{source} already migrated",
                    req.role,
                    req.keyspace
                );
            }
        }
    }

    if req.role == ServingRole::Primary {
        for cell in &all_cells {
            for role in [ServingRole::Rdonly, ServingRole::Replica] {
                if serving_state(ks, &shards, role, cell)? != ServingState::DestinationServing {
                    precondition!(
                        "cannot migrate primary of {}/{source}: {role} is not yet migrated in cell {cell}",
                        req.keyspace
                    );
                }
            }
        }
        for dest in &shards.destinations {
            let record = ks.shard(dest)?;
            if let Some(verification) = record.verification.as_ref().filter(|v| !v.matched) {
                return Err(ReshardError::ConsistencyMismatch {
                    shard: format!("{}/{dest}", req.keyspace),
                    details: format!(
                        "primary migration blocked by unresolved verification mismatch: {}",
                        verification.summary
                    ),
                });
            }
            if record.primary.is_none() {
                precondition!("destination shard {}/{dest} has no primary tablet", req.keyspace);
            }
            check_source_coverage(record)?;
        }
    }

    let ks = state.keyspace_mut(&req.keyspace)?;
    for cell in &flips {
        for name in &shards.sources {
            ks.shard_mut(name)?.set_serving(req.role, cell, req.reverse);
        }
        for name in &shards.destinations {
            ks.shard_mut(name)?.set_serving(req.role, cell, !req.reverse);
        }
    }
    if req.role == ServingRole::Primary {
        for name in &shards.destinations {
            let dest = ks.shard_mut(name)?;
            let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut dest.source_shards)
                .into_iter()
                .partition(|r| r.keyspace == req.keyspace && shards.sources.contains(&r.shard));
            dest.source_shards = kept;
            outcome
                .torn_down
                .extend(gone.into_iter().map(|r| (name.clone(), r.uid)));
        }
    }
    ks.rebuild_srv(Some(flips.as_slice()))?;
    outcome.query_service = state.refresh_query_service(&req.keyspace);
    Ok(outcome)
}
