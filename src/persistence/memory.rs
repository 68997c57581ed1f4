//! Relational in-memory database engine

use crate::domain::{DatabaseType, DbEngine, DbOp, DbTable, Row};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;

type Tables = BTreeMap<DbTable, BTreeMap<String, Row>>;

/// Table -> primary key -> row
#[derive(Debug, Default)]
pub struct MemoryDbEngine {
    tables: RwLock<Tables>,
}

impl MemoryDbEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn apply(tables: &mut Tables, op: DbOp) -> Result<()> {
        match op {
            DbOp::Create { table, pk, row } => {
                let rows = tables.entry(table).or_default();
                if rows.contains_key(&pk) {
                    return Err(Error::Database(format!(
                        "duplicate primary key '{}' in table {}",
                        pk, table
                    )));
                }
                rows.insert(pk, row);
            }
            DbOp::Delete { table, pk } => {
                let removed = tables.get_mut(&table).and_then(|rows| rows.remove(&pk));
                if removed.is_none() {
                    return Err(Error::Database(format!(
                        "cannot delete unknown row '{}' from table {}",
                        pk, table
                    )));
                }
            }
            DbOp::UpdateColumn {
                table,
                pk,
                column,
                value,
            } => {
                let row = tables
                    .get_mut(&table)
                    .and_then(|rows| rows.get_mut(&pk))
                    .ok_or_else(|| {
                        Error::Database(format!(
                            "cannot update unknown row '{}' in table {}",
                            pk, table
                        ))
                    })?;
                row.insert(column, value);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DbEngine for MemoryDbEngine {
    fn db_type(&self) -> DatabaseType {
        DatabaseType::Memory
    }

    async fn commit(&self, ops: Vec<DbOp>) -> Result<()> {
        let mut tables = self.tables.write();
        let mut staged = tables.clone();
        for op in ops {
            Self::apply(&mut staged, op)?;
        }
        *tables = staged;
        Ok(())
    }

    async fn load_all(&self, table: DbTable) -> Result<BTreeMap<String, Row>> {
        Ok(self.tables.read().get(&table).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create(pk: &str) -> DbOp {
        DbOp::Create {
            table: DbTable::Nodes,
            pk: pk.to_string(),
            row: Row::from([("NODE_NAME".to_string(), pk.to_lowercase())]),
        }
    }

    #[tokio::test]
    async fn test_commit_is_atomic() {
        let engine = MemoryDbEngine::new();
        engine.commit(vec![create("ALPHA")]).await.unwrap();

        let result = engine
            .commit(vec![
                create("BRAVO"),
                DbOp::Delete {
                    table: DbTable::Nodes,
                    pk: "MISSING".into(),
                },
            ])
            .await;
        assert!(matches!(result, Err(Error::Database(_))));

        let rows = engine.load_all(DbTable::Nodes).await.unwrap();
        assert_eq!(rows.keys().collect::<Vec<_>>(), vec!["ALPHA"]);
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let engine = MemoryDbEngine::new();
        engine.commit(vec![create("ALPHA")]).await.unwrap();
        engine
            .commit(vec![DbOp::UpdateColumn {
                table: DbTable::Nodes,
                pk: "ALPHA".into(),
                column: "FLAGS".into(),
                value: "2".into(),
            }])
            .await
            .unwrap();
        let rows = engine.load_all(DbTable::Nodes).await.unwrap();
        assert_eq!(rows["ALPHA"]["FLAGS"], "2");

        assert!(engine.commit(vec![create("ALPHA")]).await.is_err());
        engine
            .commit(vec![DbOp::Delete {
                table: DbTable::Nodes,
                pk: "ALPHA".into(),
            }])
            .await
            .unwrap();
        assert!(engine.load_all(DbTable::Nodes).await.unwrap().is_empty());
    }
}
