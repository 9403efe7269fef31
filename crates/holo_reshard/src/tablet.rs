//! Server control surface consumed by the resharding workflow.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ReshardError, Result};
use crate::row::{BinlogTransaction, Position, Row, RowChange};
use crate::topology::{TabletAlias, TabletType};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletHealth {
    pub healthy: bool,
    pub tablet_type: TabletType,
    pub query_service: bool,
    pub position: Position,
}

/// Consistent read of a set of tables together with the log position it reflects.
#[derive(Debug, Clone, Default)]
pub struct TabletSnapshot {
    pub position: Position,
    pub tables: BTreeMap<String, Vec<Row>>,
}

/// Control and data operations on one tablet.
///
/// Rows are returned in primary-key order. `apply_filtered` must commit the
/// changes and the checkpoint for `uid` atomically, and must skip (returning
/// `false`) a position at or below the stored checkpoint.
#[async_trait]
pub trait TabletConn: Send + Sync {
    fn alias(&self) -> &TabletAlias;

    async fn health(&self) -> Result<TabletHealth>;
    async fn set_tablet_type(&self, tablet_type: TabletType) -> Result<()>;
    async fn set_query_service(&self, enabled: bool) -> Result<()>;

    async fn list_tables(&self) -> Result<Vec<String>>;
    async fn create_table(&self, table: &str) -> Result<()>;
    async fn row_count(&self, table: &str) -> Result<u64>;

    /// Up to `limit` rows with `from <= pk < end` (open bounds when `None`).
    async fn scan_rows(
        &self,
        table: &str,
        from: Option<Vec<u8>>,
        end: Option<Vec<u8>>,
        limit: usize,
    ) -> Result<Vec<Row>>;

    /// Primary keys splitting `table` into roughly `parts` equal chunks.
    async fn pk_split_points(&self, table: &str, parts: usize) -> Result<Vec<Vec<u8>>>;

    async fn snapshot(&self, tables: &[String]) -> Result<TabletSnapshot>;
    async fn current_position(&self) -> Result<Position>;
    async fn binlog_after(&self, position: Position, limit: usize) -> Result<Vec<BinlogTransaction>>;

    /// Client write. Only a serving primary accepts it, and only for keys it owns.
    async fn execute(&self, changes: Vec<RowChange>) -> Result<Position>;

    async fn apply_copied_rows(&self, table: &str, rows: Vec<Row>) -> Result<()>;
    /// Drop every row of `table` without logging it. Used before a bulk copy.
    async fn clear_copied_rows(&self, table: &str) -> Result<u64>;
    async fn apply_filtered(&self, uid: u32, position: Position, changes: Vec<RowChange>) -> Result<bool>;
    async fn filtered_checkpoint(&self, uid: u32) -> Result<Option<Position>>;
    async fn set_filtered_checkpoint(&self, uid: u32, position: Position) -> Result<()>;
    async fn clear_filtered_checkpoint(&self, uid: u32) -> Result<()>;
}

/// Connections to the tablets the coordinator can reach, by alias.
#[derive(Clone, Default)]
pub struct TabletRegistry {
    conns: Arc<RwLock<BTreeMap<TabletAlias, Arc<dyn TabletConn>>>>,
}

impl TabletRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, conn: Arc<dyn TabletConn>) {
        let alias = conn.alias().clone();
        self.conns
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(alias, conn);
    }

    pub fn unregister(&self, alias: &TabletAlias) -> Option<Arc<dyn TabletConn>> {
        self.conns
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(alias)
    }

    pub fn get(&self, alias: &TabletAlias) -> Option<Arc<dyn TabletConn>> {
        self.conns
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(alias)
            .cloned()
    }

    pub fn require(&self, alias: &TabletAlias) -> Result<Arc<dyn TabletConn>> {
        self.get(alias)
            .ok_or_else(|| ReshardError::Transient(format!("no connection to tablet {alias}")))
    }
}
