//! Consistency check between a destination shard and its source slices.
//!
//! The caller pauses the destination's players first. Each source is then
//! snapshotted, the destination is replayed to exactly the snapshot position,
//! and both sides are compared table by table. Nothing is repaired here.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::binlog_player::{BinlogPlayer, PlayerOptions, PlayerSpec};
use crate::error::{ReshardError, Result};
use crate::keyrange::KeyRange;
use crate::row::{Position, Row, TableDigest};
use crate::tablet::TabletConn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyOptions {
    pub exclude_tables: Vec<String>,
    pub max_reported_diffs: usize,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDiff {
    pub table: String,
    pub source_rows: u64,
    pub destination_rows: u64,
    pub source_checksum: u32,
    pub destination_checksum: u32,
    /// Hex primary keys present in the sources only.
    pub missing: Vec<String>,
    /// Hex primary keys present in the destination only.
    pub extra: Vec<String>,
    /// Hex primary keys whose row images differ.
    pub different: Vec<String>,
}

impl TableDiff {
    pub fn matched(&self) -> bool {
        self.source_rows == self.destination_rows
            && self.source_checksum == self.destination_checksum
            && self.missing.is_empty()
            && self.extra.is_empty()
            && self.different.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyReport {
    pub keyspace: String,
    pub shard: String,
    pub matched: bool,
    pub tables: Vec<TableDiff>,
    /// Source snapshot positions the destination was caught up to.
    pub source_positions: BTreeMap<String, Position>,
}

impl VerifyReport {
    /// One line per mismatching table, or a short confirmation.
    pub fn summary(&self) -> String {
        if self.matched {
            return format!("{} tables match", self.tables.len());
        }
        self.tables
            .iter()
            .filter(|t| !t.matched())
            .map(|t| {
                format!(
                    "table {}: {} source rows vs {} destination rows, {} missing {:?}, {} extra {:?}, {} different {:?}",
                    t.table,
                    t.source_rows,
                    t.destination_rows,
                    t.missing.len(),
                    t.missing,
                    t.extra.len(),
                    t.extra,
                    t.different.len(),
                    t.different
                )
            })
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Turn a mismatch into `ReshardError::ConsistencyMismatch`.
    pub fn into_result(self) -> Result<Self> {
        if self.matched {
            return Ok(self);
        }
        Err(ReshardError::ConsistencyMismatch {
            shard: format!("{}/{}", self.keyspace, self.shard),
            details: self.summary(),
        })
    }
}

fn push_limited(list: &mut Vec<String>, pk: &[u8], limit: usize) {
    if list.len() < limit {
        list.push(hex::encode(pk));
    }
}

/// Compare expected (source-derived) rows against destination rows, per table.
pub fn compare_tables(
    expected: &BTreeMap<String, BTreeMap<Vec<u8>, Row>>,
    actual: &BTreeMap<String, BTreeMap<Vec<u8>, Row>>,
    max_reported_diffs: usize,
) -> Vec<TableDiff> {
    let empty = BTreeMap::new();
    let tables = expected
        .keys()
        .chain(actual.keys())
        .cloned()
        .collect::<BTreeSet<_>>();
    let mut diffs = Vec::with_capacity(tables.len());
    for table in tables {
        let source = expected.get(&table).unwrap_or(&empty);
        let dest = actual.get(&table).unwrap_or(&empty);
        let mut source_digest = TableDigest::default();
        source.values().for_each(|row| source_digest.update(row));
        let mut dest_digest = TableDigest::default();
        dest.values().for_each(|row| dest_digest.update(row));

        let mut diff = TableDiff {
            table,
            source_rows: source_digest.rows(),
            destination_rows: dest_digest.rows(),
            source_checksum: source_digest.checksum(),
            destination_checksum: dest_digest.checksum(),
            missing: Vec::new(),
            extra: Vec::new(),
            different: Vec::new(),
        };
        if diff.source_checksum != diff.destination_checksum || diff.source_rows != diff.destination_rows {
            for (pk, row) in source {
                match dest.get(pk) {
                    None => push_limited(&mut diff.missing, pk, max_reported_diffs),
                    Some(other) if other != row => {
                        push_limited(&mut diff.different, pk, max_reported_diffs)
                    }
                    Some(_) => {}
                }
            }
            for pk in dest.keys().filter(|pk| !source.contains_key(*pk)) {
                push_limited(&mut diff.extra, pk, max_reported_diffs);
            }
        }
        diffs.push(diff);
    }
    diffs
}

/// Snapshot sources, catch the destination up, and compare.
///
/// `specs` are the destination's source references; its players must
/// already be stopped.
pub async fn verify_destination(
    keyspace: &str,
    shard: &str,
    destination: Arc<dyn TabletConn>,
    destination_range: &KeyRange,
    specs: Vec<PlayerSpec>,
    options: &VerifyOptions,
    player_options: &PlayerOptions,
) -> Result<VerifyReport> {
    if specs.is_empty() {
        return Err(ReshardError::Precondition(format!(
            "shard {keyspace}/{shard} has no source shard references to verify against"
        )));
    }
    let excluded = options.exclude_tables.iter().cloned().collect::<BTreeSet<_>>();
    let mut expected: BTreeMap<String, BTreeMap<Vec<u8>, Row>> = BTreeMap::new();
    let mut source_positions = BTreeMap::new();

    for spec in specs {
        let snapshot = spec.source.snapshot(&[]).await?;
        let reference = &spec.reference;
        for (table, rows) in snapshot.tables {
            if excluded.contains(&table)
                || (!reference.tables.is_empty() && !reference.tables.contains(&table))
            {
                continue;
            }
            let slice = expected.entry(table).or_default();
            for row in rows {
                if destination_range.contains(&row.keyspace_id)
                    && reference.key_range.contains(&row.keyspace_id)
                {
                    slice.insert(row.pk.clone(), row);
                }
            }
        }

        let source_shard = reference.shard.clone();
        let player = BinlogPlayer::new(spec, player_options.clone());
        let caught_up = tokio::time::timeout(options.timeout, player.play_until(snapshot.position))
            .await
            .map_err(|_| {
                ReshardError::Transient(format!(
                    "destination {keyspace}/{shard} did not reach {source_shard} position {} within {:?}",
                    snapshot.position, options.timeout
                ))
            })??;
        info!(keyspace, shard, source = %source_shard, position = caught_up, "destination caught up to source snapshot");
        source_positions.insert(source_shard, snapshot.position);
    }

    let dest_snapshot = destination.snapshot(&[]).await?;
    let mut actual: BTreeMap<String, BTreeMap<Vec<u8>, Row>> = BTreeMap::new();
    for (table, rows) in dest_snapshot.tables {
        if excluded.contains(&table) {
            continue;
        }
        // Tables only present on the destination count as extra rows.
        let slice = actual.entry(table).or_default();
        for row in rows {
            slice.insert(row.pk.clone(), row);
        }
    }

    let tables = compare_tables(&expected, &actual, options.max_reported_diffs);
    let matched = tables.iter().all(TableDiff::matched);
    let report = VerifyReport {
        keyspace: keyspace.to_string(),
        shard: shard.to_string(),
        matched,
        tables,
        source_positions,
    };
    if matched {
        info!(keyspace, shard, tables = report.tables.len(), "consistency check matched");
    } else {
        warn!(keyspace, shard, summary = %report.summary(), "consistency check found differences");
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(rows: &[(u8, &str)]) -> BTreeMap<Vec<u8>, Row> {
        rows.iter()
            .map(|(pk, msg)| (vec![*pk], Row::new(vec![*pk], vec![0x90, *pk]).with("msg", *msg)))
            .collect()
    }

    #[test]
    fn identical_tables_match() {
        let expected = BTreeMap::from([("resharding1".to_string(), table(&[(1, "a"), (2, "b")]))]);
        let diffs = compare_tables(&expected, &expected.clone(), 10);
        assert_eq!(diffs.len(), 1);
        assert!(diffs[0].matched());
    }

    #[test]
    fn differences_are_classified_and_capped() {
        let expected = BTreeMap::from([(
            "resharding1".to_string(),
            table(&[(1, "a"), (2, "b"), (3, "c"), (4, "d")]),
        )]);
        let actual = BTreeMap::from([
            ("resharding1".to_string(), table(&[(1, "a"), (2, "changed"), (9, "z")])),
            ("stray".to_string(), table(&[(5, "e")])),
        ]);
        let diffs = compare_tables(&expected, &actual, 1);
        let main = diffs.iter().find(|d| d.table == "resharding1").expect("table diff");
        assert!(!main.matched());
        assert_eq!(main.source_rows, 4);
        assert_eq!(main.destination_rows, 3);
        assert_eq!(main.missing, vec!["03".to_string()]);
        assert_eq!(main.different, vec!["02".to_string()]);
        assert_eq!(main.extra, vec!["09".to_string()]);
        let stray = diffs.iter().find(|d| d.table == "stray").expect("stray diff");
        assert_eq!(stray.extra.len(), 1);
        assert_eq!(stray.source_rows, 0);
    }
}
