//! Flat key/value database engine
//!
//! Every column is stored under its own key
//! `LINSTOR/<TABLE>/<primary key>/<COLUMN>`.

use crate::domain::{DatabaseType, DbEngine, DbOp, DbTable, Row};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;

const KEY_ROOT: &str = "LINSTOR";

fn table_prefix(table: DbTable) -> String {
    format!("{}/{}/", KEY_ROOT, table.name())
}

fn row_prefix(table: DbTable, pk: &str) -> String {
    format!("{}{}/", table_prefix(table), pk)
}

#[derive(Debug, Default)]
pub struct KvDbEngine {
    store: RwLock<BTreeMap<String, String>>,
}

impl KvDbEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn row_exists(store: &BTreeMap<String, String>, prefix: &str) -> bool {
        store
            .range(prefix.to_string()..)
            .next()
            .is_some_and(|(key, _)| key.starts_with(prefix))
    }

    fn apply(store: &mut BTreeMap<String, String>, op: DbOp) -> Result<()> {
        match op {
            DbOp::Create { table, pk, row } => {
                let prefix = row_prefix(table, &pk);
                if Self::row_exists(store, &prefix) {
                    return Err(Error::Database(format!(
                        "duplicate primary key '{}' in table {}",
                        pk, table
                    )));
                }
                for (column, value) in row {
                    store.insert(format!("{}{}", prefix, column), value);
                }
            }
            DbOp::Delete { table, pk } => {
                let prefix = row_prefix(table, &pk);
                let keys: Vec<String> = store
                    .range(prefix.clone()..)
                    .take_while(|(key, _)| key.starts_with(&prefix))
                    .map(|(key, _)| key.clone())
                    .collect();
                if keys.is_empty() {
                    return Err(Error::Database(format!(
                        "cannot delete unknown row '{}' from table {}",
                        pk, table
                    )));
                }
                for key in keys {
                    store.remove(&key);
                }
            }
            DbOp::UpdateColumn {
                table,
                pk,
                column,
                value,
            } => {
                let prefix = row_prefix(table, &pk);
                if !Self::row_exists(store, &prefix) {
                    return Err(Error::Database(format!(
                        "cannot update unknown row '{}' in table {}",
                        pk, table
                    )));
                }
                store.insert(format!("{}{}", prefix, column), value);
            }
        }
        Ok(())
    }

    /// Raw view of the store
    pub fn dump(&self) -> BTreeMap<String, String> {
        self.store.read().clone()
    }
}

#[async_trait]
impl DbEngine for KvDbEngine {
    fn db_type(&self) -> DatabaseType {
        DatabaseType::Kv
    }

    async fn commit(&self, ops: Vec<DbOp>) -> Result<()> {
        let mut store = self.store.write();
        let mut staged = store.clone();
        for op in ops {
            Self::apply(&mut staged, op)?;
        }
        *store = staged;
        Ok(())
    }

    async fn load_all(&self, table: DbTable) -> Result<BTreeMap<String, Row>> {
        let prefix = table_prefix(table);
        let store = self.store.read();
        let mut rows: BTreeMap<String, Row> = BTreeMap::new();

        for (key, value) in store
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
        {
            let (pk, column) = key[prefix.len()..].rsplit_once('/').ok_or_else(|| {
                Error::DatabaseLoad {
                    table: table.to_string(),
                    reason: format!("malformed key '{}'", key),
                }
            })?;
            rows.entry(pk.to_string())
                .or_default()
                .insert(column.to_string(), value.clone());
        }
        Ok(rows)
    }
}
