//! Rows, row changes and change-log transactions.
//!
//! Rows carry their routing key (`keyspace_id`) next to the primary key so
//! filtering never needs to understand the table schema.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{ReshardError, Result};

/// Position in a tablet change log. Positions are dense and start at 1.
pub type Position = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Value {
    Null,
    Int(i64),
    UInt(u64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    fn write_canonical(&self, out: &mut Vec<u8>) {
        match self {
            Value::Null => out.push(0),
            Value::Int(v) => {
                out.push(1);
                out.extend_from_slice(&v.to_be_bytes());
            }
            Value::UInt(v) => {
                out.push(2);
                out.extend_from_slice(&v.to_be_bytes());
            }
            Value::Text(v) => {
                out.push(3);
                write_len_prefixed(out, v.as_bytes());
            }
            Value::Bytes(v) => {
                out.push(4);
                write_len_prefixed(out, v);
            }
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Value::UInt(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub pk: Vec<u8>,
    pub keyspace_id: Vec<u8>,
    #[serde(default)]
    pub values: BTreeMap<String, Value>,
}

impl Row {
    pub fn new(pk: impl Into<Vec<u8>>, keyspace_id: impl Into<Vec<u8>>) -> Self {
        Self {
            pk: pk.into(),
            keyspace_id: keyspace_id.into(),
            values: BTreeMap::new(),
        }
    }

    pub fn with(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.values.insert(column.to_string(), value.into());
        self
    }

    /// Checksum of the full row image, stable across codecs.
    pub fn fingerprint(&self) -> u32 {
        let mut buf = Vec::with_capacity(64);
        write_len_prefixed(&mut buf, &self.pk);
        write_len_prefixed(&mut buf, &self.keyspace_id);
        for (column, value) in &self.values {
            write_len_prefixed(&mut buf, column.as_bytes());
            value.write_canonical(&mut buf);
        }
        crc32fast::hash(&buf)
    }
}

fn write_len_prefixed(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

/// One row-level effect. Changes carry full row images, so replaying them
/// over rows that already reflect them is harmless.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum RowChange {
    Upsert {
        table: String,
        row: Row,
    },
    Delete {
        table: String,
        pk: Vec<u8>,
        keyspace_id: Vec<u8>,
    },
}

impl RowChange {
    pub fn table(&self) -> &str {
        match self {
            RowChange::Upsert { table, .. } | RowChange::Delete { table, .. } => table,
        }
    }

    pub fn keyspace_id(&self) -> &[u8] {
        match self {
            RowChange::Upsert { row, .. } => &row.keyspace_id,
            RowChange::Delete { keyspace_id, .. } => keyspace_id,
        }
    }
}

/// A committed source transaction as recorded in the change log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinlogTransaction {
    pub position: Position,
    pub timestamp_ms: u64,
    pub changes: Vec<RowChange>,
}

/// Encoding of rows and log entries at rest.
pub trait RowCodec: Send + Sync {
    fn encode_row(&self, row: &Row) -> Result<Vec<u8>>;
    fn decode_row(&self, bytes: &[u8]) -> Result<Row>;
    fn encode_transaction(&self, txn: &BinlogTransaction) -> Result<Vec<u8>>;
    fn decode_transaction(&self, bytes: &[u8]) -> Result<BinlogTransaction>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonRowCodec;

impl RowCodec for JsonRowCodec {
    fn encode_row(&self, row: &Row) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(row)?)
    }

    fn decode_row(&self, bytes: &[u8]) -> Result<Row> {
        serde_json::from_slice(bytes)
            .map_err(|err| ReshardError::Corruption(format!("decode row: {err}")))
    }

    fn encode_transaction(&self, txn: &BinlogTransaction) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(txn)?)
    }

    fn decode_transaction(&self, bytes: &[u8]) -> Result<BinlogTransaction> {
        serde_json::from_slice(bytes)
            .map_err(|err| ReshardError::Corruption(format!("decode change log entry: {err}")))
    }
}

/// Order-sensitive digest of a table scan: row count plus crc32 of row fingerprints.
#[derive(Debug, Clone, Default)]
pub struct TableDigest {
    rows: u64,
    hasher: crc32fast::Hasher,
}

impl TableDigest {
    pub fn update(&mut self, row: &Row) {
        self.rows += 1;
        self.hasher.update(&row.fingerprint().to_be_bytes());
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn checksum(&self) -> u32 {
        self.hasher.clone().finalize()
    }
}

pub fn now_unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
