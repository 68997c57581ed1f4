//! Persistence
//!
//! Transactions over a [`DbEngine`](crate::domain::DbEngine), the entity to
//! row mapping, the two database engines and the startup loader.

pub mod kv;
pub mod loader;
pub mod memory;
pub mod rows;

pub use kv::KvDbEngine;
pub use loader::{DatabaseLoader, LoadSummary};
pub use memory::MemoryDbEngine;
pub use rows::DbRow;

use crate::domain::{DatabaseType, DbEngineRef, DbOp, DbTable};
use crate::error::Result;
use std::sync::Arc;
use tracing::debug;

/// Create the engine for a configured database type
pub fn create_engine(db_type: DatabaseType) -> DbEngineRef {
    match db_type {
        DatabaseType::Memory => Arc::new(MemoryDbEngine::new()),
        DatabaseType::Kv => Arc::new(KvDbEngine::new()),
    }
}

/// Buffered batch of persistence operations.
///
/// Nothing reaches the engine before [`Transaction::commit`]. Dropping an
/// uncommitted transaction discards its operations.
pub struct Transaction {
    engine: DbEngineRef,
    ops: Vec<DbOp>,
}

impl Transaction {
    pub fn new(engine: DbEngineRef) -> Self {
        Self {
            engine,
            ops: Vec::new(),
        }
    }

    pub fn create<T: DbRow>(&mut self, obj: &T) -> Result<()> {
        self.ops.push(DbOp::Create {
            table: T::TABLE,
            pk: obj.primary_key(),
            row: obj.to_row()?,
        });
        Ok(())
    }

    pub fn delete<T: DbRow>(&mut self, obj: &T) {
        self.ops.push(DbOp::Delete {
            table: T::TABLE,
            pk: obj.primary_key(),
        });
    }

    pub fn update_column<T: DbRow>(&mut self, obj: &T, column: &str, value: impl Into<String>) {
        self.ops.push(DbOp::UpdateColumn {
            table: T::TABLE,
            pk: obj.primary_key(),
            column: column.to_string(),
            value: value.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Tables touched by the pending operations
    pub fn tables(&self) -> Vec<DbTable> {
        let mut tables: Vec<DbTable> = self
            .ops
            .iter()
            .map(|op| match op {
                DbOp::Create { table, .. }
                | DbOp::Delete { table, .. }
                | DbOp::UpdateColumn { table, .. } => *table,
            })
            .collect();
        tables.sort();
        tables.dedup();
        tables
    }

    /// Apply all buffered operations. The transaction stays usable and
    /// empty afterwards.
    pub async fn commit(&mut self) -> Result<()> {
        if self.ops.is_empty() {
            return Ok(());
        }
        let ops = std::mem::take(&mut self.ops);
        debug!(ops = ops.len(), db = %self.engine.db_type(), "Committing transaction");
        self.engine.commit(ops).await
    }

    pub fn rollback(&mut self) {
        if !self.ops.is_empty() {
            debug!(ops = self.ops.len(), "Rolling back transaction");
            self.ops.clear();
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.rollback();
    }
}

/// Composite primary key of several name parts
pub(crate) fn composite_key(parts: &[&str]) -> String {
    parts.join(":")
}
