//! Entity <-> row mapping

use super::composite_key;
use crate::domain::{
    DbTable, Node, NodeConnection, Resource, ResourceDefinition, ResourceGroup, ResourceName, Row,
    Snapshot, StorPool, Volume, VolumeDefinition,
};
use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::str::FromStr;

/// Column names shared by all tables
pub mod columns {
    pub const UUID: &str = "UUID";
    pub const NODE_NAME: &str = "NODE_NAME";
    pub const NODE_NAME_SRC: &str = "NODE_NAME_SRC";
    pub const NODE_NAME_DST: &str = "NODE_NAME_DST";
    pub const RSC_NAME: &str = "RESOURCE_NAME";
    pub const RSC_GRP_NAME: &str = "RESOURCE_GROUP_NAME";
    pub const POOL_NAME: &str = "POOL_NAME";
    pub const SNAPSHOT_NAME: &str = "SNAPSHOT_NAME";
    pub const VLM_NR: &str = "VLM_NR";
    pub const VLM_SIZE: &str = "VLM_SIZE";
    pub const FLAGS: &str = "FLAGS";
    pub const PROPS: &str = "PROPS";
    pub const LAYER_STACK: &str = "LAYER_STACK";
    pub const NET_INTERFACES: &str = "NET_INTERFACES";
    pub const DESCRIPTION: &str = "DESCRIPTION";
    pub const AUTO_PLACE: &str = "AUTO_PLACE";
    pub const PROVIDER: &str = "DRIVER_NAME";
    pub const FREE_CAPACITY: &str = "FREE_CAPACITY";
    pub const TOTAL_CAPACITY: &str = "TOTAL_CAPACITY";
}

use columns::*;

/// An object stored as one row of a table
pub trait DbRow {
    const TABLE: DbTable;

    fn primary_key(&self) -> String;

    fn to_row(&self) -> Result<Row>;
}

fn json<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn row<const N: usize>(entries: [(&str, String); N]) -> Row {
    entries
        .into_iter()
        .map(|(col, value)| (col.to_string(), value))
        .collect()
}

impl DbRow for Node {
    const TABLE: DbTable = DbTable::Nodes;

    fn primary_key(&self) -> String {
        self.name.value().to_string()
    }

    fn to_row(&self) -> Result<Row> {
        Ok(row([
            (UUID, self.uuid.to_string()),
            (NODE_NAME, self.name.to_string()),
            (FLAGS, self.flags.bits().to_string()),
            (PROPS, json(&self.props)?),
            (NET_INTERFACES, json(&self.net_interfaces.values().collect::<Vec<_>>())?),
        ]))
    }
}

impl DbRow for NodeConnection {
    const TABLE: DbTable = DbTable::NodeConnections;

    fn primary_key(&self) -> String {
        composite_key(&[self.source().value(), self.target().value()])
    }

    fn to_row(&self) -> Result<Row> {
        Ok(row([
            (UUID, self.uuid.to_string()),
            (NODE_NAME_SRC, self.source().to_string()),
            (NODE_NAME_DST, self.target().to_string()),
            (PROPS, json(&self.props)?),
        ]))
    }
}

impl DbRow for ResourceGroup {
    const TABLE: DbTable = DbTable::ResourceGroups;

    fn primary_key(&self) -> String {
        self.name.value().to_string()
    }

    fn to_row(&self) -> Result<Row> {
        let mut row = row([
            (UUID, self.uuid.to_string()),
            (RSC_GRP_NAME, self.name.to_string()),
            (PROPS, json(&self.props)?),
            (AUTO_PLACE, json(&self.auto_place)?),
        ]);
        if let Some(description) = &self.description {
            row.insert(DESCRIPTION.to_string(), description.clone());
        }
        Ok(row)
    }
}

impl DbRow for ResourceDefinition {
    const TABLE: DbTable = DbTable::ResourceDefinitions;

    fn primary_key(&self) -> String {
        self.name.value().to_string()
    }

    fn to_row(&self) -> Result<Row> {
        Ok(row([
            (UUID, self.uuid.to_string()),
            (RSC_NAME, self.name.to_string()),
            (RSC_GRP_NAME, self.rsc_grp.to_string()),
            (FLAGS, self.flags.bits().to_string()),
            (PROPS, json(&self.props)?),
            (LAYER_STACK, json(&self.layer_stack)?),
        ]))
    }
}

/// A volume definition together with its owning resource name
pub struct VolumeDefinitionRow<'a> {
    pub rsc_name: &'a ResourceName,
    pub vlm_dfn: &'a VolumeDefinition,
}

impl DbRow for VolumeDefinitionRow<'_> {
    const TABLE: DbTable = DbTable::VolumeDefinitions;

    fn primary_key(&self) -> String {
        composite_key(&[self.rsc_name.value(), &self.vlm_dfn.vlm_nr.to_string()])
    }

    fn to_row(&self) -> Result<Row> {
        Ok(row([
            (UUID, self.vlm_dfn.uuid.to_string()),
            (RSC_NAME, self.rsc_name.to_string()),
            (VLM_NR, self.vlm_dfn.vlm_nr.to_string()),
            (VLM_SIZE, self.vlm_dfn.size_bytes.to_string()),
            (PROPS, json(&self.vlm_dfn.props)?),
        ]))
    }
}

impl DbRow for StorPool {
    const TABLE: DbTable = DbTable::StorPools;

    fn primary_key(&self) -> String {
        composite_key(&[self.node_name.value(), self.name.value()])
    }

    fn to_row(&self) -> Result<Row> {
        Ok(row([
            (UUID, self.uuid.to_string()),
            (NODE_NAME, self.node_name.to_string()),
            (POOL_NAME, self.name.to_string()),
            (PROVIDER, json(&self.provider)?),
            (FREE_CAPACITY, self.free_capacity_bytes.to_string()),
            (TOTAL_CAPACITY, self.total_capacity_bytes.to_string()),
            (PROPS, json(&self.props)?),
        ]))
    }
}

impl DbRow for Resource {
    const TABLE: DbTable = DbTable::Resources;

    fn primary_key(&self) -> String {
        composite_key(&[self.node_name.value(), self.rsc_name.value()])
    }

    fn to_row(&self) -> Result<Row> {
        Ok(row([
            (UUID, self.uuid.to_string()),
            (NODE_NAME, self.node_name.to_string()),
            (RSC_NAME, self.rsc_name.to_string()),
            (FLAGS, self.flags.bits().to_string()),
            (LAYER_STACK, json(&self.layer_stack)?),
            (PROPS, json(&self.props)?),
        ]))
    }
}

/// A volume together with its owning resource
pub struct VolumeRow<'a> {
    pub rsc: &'a Resource,
    pub vlm: &'a Volume,
}

impl DbRow for VolumeRow<'_> {
    const TABLE: DbTable = DbTable::Volumes;

    fn primary_key(&self) -> String {
        composite_key(&[
            self.rsc.node_name.value(),
            self.rsc.rsc_name.value(),
            &self.vlm.vlm_nr.to_string(),
        ])
    }

    fn to_row(&self) -> Result<Row> {
        Ok(row([
            (UUID, self.vlm.uuid.to_string()),
            (NODE_NAME, self.rsc.node_name.to_string()),
            (RSC_NAME, self.rsc.rsc_name.to_string()),
            (VLM_NR, self.vlm.vlm_nr.to_string()),
            (POOL_NAME, self.vlm.stor_pool.to_string()),
            (VLM_SIZE, self.vlm.size_bytes.to_string()),
            (PROPS, json(&self.vlm.props)?),
        ]))
    }
}

impl DbRow for Snapshot {
    const TABLE: DbTable = DbTable::Snapshots;

    fn primary_key(&self) -> String {
        composite_key(&[
            self.node_name.value(),
            self.rsc_name.value(),
            self.name.value(),
        ])
    }

    fn to_row(&self) -> Result<Row> {
        Ok(row([
            (UUID, self.uuid.to_string()),
            (NODE_NAME, self.node_name.to_string()),
            (RSC_NAME, self.rsc_name.to_string()),
            (SNAPSHOT_NAME, self.name.to_string()),
            (FLAGS, self.flags.bits().to_string()),
            (LAYER_STACK, json(&self.layer_stack)?),
        ]))
    }
}

// =============================================================================
// Row Reader
// =============================================================================

/// Typed access to the columns of a loaded row. Every failure is reported
/// as a load error of the row's table.
pub(crate) struct RowReader<'a> {
    table: DbTable,
    pk: &'a str,
    row: &'a Row,
}

impl<'a> RowReader<'a> {
    pub(crate) fn new(table: DbTable, pk: &'a str, row: &'a Row) -> Self {
        Self { table, pk, row }
    }

    pub(crate) fn error(&self, reason: impl std::fmt::Display) -> Error {
        Error::DatabaseLoad {
            table: self.table.to_string(),
            reason: format!("row '{}': {}", self.pk, reason),
        }
    }

    pub(crate) fn str(&self, column: &str) -> Result<&'a str> {
        self.row
            .get(column)
            .map(String::as_str)
            .ok_or_else(|| self.error(format!("missing column {}", column)))
    }

    pub(crate) fn opt_str(&self, column: &str) -> Option<&'a str> {
        self.row.get(column).map(String::as_str)
    }

    pub(crate) fn parse<T>(&self, column: &str) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.str(column)?
            .parse()
            .map_err(|err| self.error(format!("column {}: {}", column, err)))
    }

    pub(crate) fn json<T: DeserializeOwned>(&self, column: &str) -> Result<T> {
        serde_json::from_str(self.str(column)?)
            .map_err(|err| self.error(format!("column {}: {}", column, err)))
    }

    pub(crate) fn name<N>(&self, column: &str) -> Result<N>
    where
        N: TryFrom<String, Error = Error>,
    {
        N::try_from(self.str(column)?.to_string())
            .map_err(|err| self.error(format!("column {}: {}", column, err)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NodeName, ResourceGroupName, ResourceFlags, DeviceLayerKind};

    #[test]
    fn test_resource_row() {
        let mut rsc = Resource::new(
            ResourceName::new("r0").unwrap(),
            NodeName::new("alpha").unwrap(),
            vec![DeviceLayerKind::Drbd, DeviceLayerKind::Storage],
        );
        rsc.flags.insert(ResourceFlags::DRBD_DISKLESS);

        assert_eq!(rsc.primary_key(), "ALPHA:R0");
        let row = rsc.to_row().unwrap();
        assert_eq!(row[FLAGS], ResourceFlags::DRBD_DISKLESS.bits().to_string());
        assert_eq!(row[LAYER_STACK], r#"["DRBD","STORAGE"]"#);
        assert_eq!(row[NODE_NAME], "alpha");
    }

    #[test]
    fn test_row_reader_errors() {
        let dfn = ResourceDefinition::new(
            ResourceName::new("r0").unwrap(),
            ResourceGroupName::new("dflt").unwrap(),
        );
        let mut row = dfn.to_row().unwrap();
        row.insert(FLAGS.to_string(), "not-a-number".to_string());
        let reader = RowReader::new(DbTable::ResourceDefinitions, "R0", &row);

        let name: ResourceName = reader.name(RSC_NAME).unwrap();
        assert_eq!(name.display_value(), "r0");
        assert!(matches!(
            reader.parse::<u64>(FLAGS),
            Err(Error::DatabaseLoad { .. })
        ));
        assert!(reader.str(VLM_NR).is_err());
    }
}
