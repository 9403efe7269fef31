//! Keyranges over the sharding key and partition tiling checks.
//!
//! Keyranges are lexicographic and end-exclusive. An empty `start` is the
//! lowest key, an empty `end` is past the highest key.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{ReshardError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    pub start: Vec<u8>,
    pub end: Vec<u8>,
}

impl KeyRange {
    pub fn full() -> Self {
        Self::default()
    }

    pub fn new(start: Vec<u8>, end: Vec<u8>) -> Result<Self> {
        if !start.is_empty() && !end.is_empty() && start >= end {
            return Err(ReshardError::InvalidArgument(format!(
                "keyrange start {} must be below end {}",
                hex::encode(&start),
                hex::encode(&end)
            )));
        }
        Ok(Self { start, end })
    }

    /// Parse a shard name such as `-80`, `80-c0`, `c0-` or `-`.
    pub fn parse(name: &str) -> Result<Self> {
        let name = name.trim();
        if name.is_empty() || name == "-" || name == "0" {
            return Ok(Self::full());
        }
        let (start, end) = name.split_once('-').ok_or_else(|| {
            ReshardError::InvalidArgument(format!("keyrange {name:?} is missing '-'"))
        })?;
        let decode = |part: &str| {
            hex::decode(part).map_err(|err| {
                ReshardError::InvalidArgument(format!("keyrange {name:?} bound {part:?}: {err}"))
            })
        };
        Self::new(decode(start)?, decode(end)?)
    }

    pub fn is_full(&self) -> bool {
        self.start.is_empty() && self.end.is_empty()
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        key_in_range(key, &self.start, &self.end)
    }

    pub fn intersects(&self, other: &KeyRange) -> bool {
        self.intersection(other).is_some()
    }

    pub fn intersection(&self, other: &KeyRange) -> Option<KeyRange> {
        let start = if cmp_start(&self.start, &other.start) == Ordering::Less {
            other.start.clone()
        } else {
            self.start.clone()
        };
        let end = if cmp_end(&self.end, &other.end) == Ordering::Less {
            self.end.clone()
        } else {
            other.end.clone()
        };
        if !start.is_empty() && !end.is_empty() && start >= end {
            return None;
        }
        Some(KeyRange { start, end })
    }

    /// True when `other` lies entirely inside `self`.
    pub fn covers(&self, other: &KeyRange) -> bool {
        cmp_start(&self.start, &other.start) != Ordering::Greater
            && cmp_end(&self.end, &other.end) != Ordering::Less
    }

    /// Canonical shard name (`80-c0`).
    pub fn shard_name(&self) -> String {
        if self.is_full() {
            return "-".to_string();
        }
        format!("{}-{}", hex::encode(&self.start), hex::encode(&self.end))
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.shard_name())
    }
}

impl FromStr for KeyRange {
    type Err = ReshardError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Ord for KeyRange {
    fn cmp(&self, other: &Self) -> Ordering {
        cmp_start(&self.start, &other.start).then_with(|| cmp_end(&self.end, &other.end))
    }
}

impl PartialOrd for KeyRange {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn cmp_start(a: &[u8], b: &[u8]) -> Ordering {
    // Empty start sorts first, which is also plain lexicographic order.
    a.cmp(b)
}

fn cmp_end(a: &[u8], b: &[u8]) -> Ordering {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.cmp(b),
    }
}

pub fn key_in_range(key: &[u8], start: &[u8], end: &[u8]) -> bool {
    let lower_ok = start.is_empty() || key >= start;
    let upper_ok = end.is_empty() || key < end;
    lower_ok && upper_ok
}

/// Big-endian keyspace id for a `uint64` sharding key.
pub fn keyspace_id_from_u64(value: u64) -> Vec<u8> {
    value.to_be_bytes().to_vec()
}

/// How the sharding column is interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyspaceIdType {
    #[default]
    Unset,
    Uint64,
    Bytes,
}

impl FromStr for KeyspaceIdType {
    type Err = ReshardError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "unset" => Ok(KeyspaceIdType::Unset),
            "uint64" => Ok(KeyspaceIdType::Uint64),
            "bytes" => Ok(KeyspaceIdType::Bytes),
            other => Err(ReshardError::InvalidArgument(format!(
                "unknown keyspace id type {other:?}"
            ))),
        }
    }
}

impl fmt::Display for KeyspaceIdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KeyspaceIdType::Unset => "unset",
            KeyspaceIdType::Uint64 => "uint64",
            KeyspaceIdType::Bytes => "bytes",
        };
        f.write_str(name)
    }
}

/// Why a set of keyranges fails to tile a target range.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TilingError {
    #[error("no keyranges")]
    Empty,
    #[error("nothing covers keys below {first}")]
    MissingLowerBound { first: String },
    #[error("gap between {left} and {right}")]
    Gap { left: String, right: String },
    #[error("{left} overlaps {right}")]
    Overlap { left: String, right: String },
    #[error("nothing covers keys from the end of {last}")]
    MissingUpperBound { last: String },
}

/// Check that `ranges` cover `target` exactly once, with no gap or overlap.
pub fn check_tiling_of(target: &KeyRange, ranges: &[KeyRange]) -> Result<(), TilingError> {
    if ranges.is_empty() {
        return Err(TilingError::Empty);
    }
    let mut sorted = ranges.to_vec();
    sorted.sort();

    let first = &sorted[0];
    if first.start != target.start {
        if cmp_start(&first.start, &target.start) == Ordering::Less {
            return Err(TilingError::Overlap {
                left: target.shard_name(),
                right: first.shard_name(),
            });
        }
        return Err(TilingError::MissingLowerBound {
            first: first.shard_name(),
        });
    }
    for pair in sorted.windows(2) {
        let (left, right) = (&pair[0], &pair[1]);
        if left.end.is_empty() {
            return Err(TilingError::Overlap {
                left: left.shard_name(),
                right: right.shard_name(),
            });
        }
        match left.end.as_slice().cmp(right.start.as_slice()) {
            Ordering::Equal => {}
            Ordering::Less => {
                return Err(TilingError::Gap {
                    left: left.shard_name(),
                    right: right.shard_name(),
                })
            }
            Ordering::Greater => {
                return Err(TilingError::Overlap {
                    left: left.shard_name(),
                    right: right.shard_name(),
                })
            }
        }
    }
    let last = &sorted[sorted.len() - 1];
    if last.end != target.end {
        if cmp_end(&last.end, &target.end) == Ordering::Greater {
            return Err(TilingError::Overlap {
                left: last.shard_name(),
                right: target.shard_name(),
            });
        }
        return Err(TilingError::MissingUpperBound {
            last: last.shard_name(),
        });
    }
    Ok(())
}

/// Check that `ranges` tile the full key space.
pub fn check_tiling(ranges: &[KeyRange]) -> Result<(), TilingError> {
    check_tiling_of(&KeyRange::full(), ranges)
}

/// True when the union of `ranges` covers `target` (overlaps allowed).
pub fn ranges_cover(target: &KeyRange, ranges: &[KeyRange]) -> bool {
    let mut slices = ranges
        .iter()
        .filter_map(|r| r.intersection(target))
        .collect::<Vec<_>>();
    slices.sort();
    let mut cursor = target.start.clone();
    for slice in slices {
        if cmp_start(&slice.start, &cursor) == Ordering::Greater {
            return false;
        }
        if slice.end.is_empty() {
            return true;
        }
        if cursor.is_empty() || slice.end > cursor {
            cursor = slice.end.clone();
        }
        if !target.end.is_empty() && cursor >= target.end {
            return true;
        }
    }
    false
}
