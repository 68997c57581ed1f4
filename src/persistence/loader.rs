//! Startup loading of the controller object graph
//!
//! Tables are read in [`DbTable::LOAD_ORDER`]; every row must find its
//! parent objects among the rows loaded before it.

use super::rows::{columns::*, RowReader};
use crate::controller::core_objects::{
    CoreObjects, NodeConnMap, NodeMap, RscDfnMap, RscGrpMap, StorPoolMap,
};
use crate::domain::{
    AutoSelectFilter, DbEngineRef, DbTable, DeviceLayerKind, NetInterface, Node, NodeConnection,
    NodeFlags, NodeName, Props, ProviderKind, Resource, ResourceDefinition, ResourceFlags,
    ResourceGroup, ResourceGroupName, ResourceName, RscDfnFlags, Snapshot, SnapshotFlags,
    SnapshotName, StorPool, StorPoolName, Volume, VolumeDefinition, ConnectionStatus,
};
use crate::error::Result;
use tracing::info;
use uuid::Uuid;

/// Number of objects restored per table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub nodes: usize,
    pub resource_groups: usize,
    pub resource_definitions: usize,
    pub volume_definitions: usize,
    pub stor_pools: usize,
    pub resources: usize,
    pub volumes: usize,
    pub snapshots: usize,
    pub node_connections: usize,
}

#[derive(Default)]
struct Loaded {
    nodes: NodeMap,
    rsc_grps: RscGrpMap,
    rsc_dfns: RscDfnMap,
    stor_pools: StorPoolMap,
    node_conns: NodeConnMap,
}

pub struct DatabaseLoader {
    engine: DbEngineRef,
}

impl DatabaseLoader {
    pub fn new(engine: DbEngineRef) -> Self {
        Self { engine }
    }

    /// Restore all persisted objects into `core`, replacing its content.
    /// Nothing is replaced if any table fails to load.
    pub async fn load_all(&self, core: &CoreObjects) -> Result<LoadSummary> {
        let mut loaded = Loaded::default();
        let mut summary = LoadSummary::default();

        for table in DbTable::LOAD_ORDER {
            let rows = self.engine.load_all(table).await?;
            for (pk, row) in &rows {
                let reader = RowReader::new(table, pk, row);
                match table {
                    DbTable::Nodes => load_node(&reader, &mut loaded)?,
                    DbTable::ResourceGroups => load_rsc_grp(&reader, &mut loaded)?,
                    DbTable::ResourceDefinitions => load_rsc_dfn(&reader, &mut loaded)?,
                    DbTable::VolumeDefinitions => load_vlm_dfn(&reader, &mut loaded)?,
                    DbTable::StorPools => load_stor_pool(&reader, &mut loaded)?,
                    DbTable::Resources => load_resource(&reader, &mut loaded)?,
                    DbTable::Volumes => load_volume(&reader, &mut loaded)?,
                    DbTable::Snapshots => load_snapshot(&reader, &mut loaded)?,
                    DbTable::NodeConnections => load_node_conn(&reader, &mut loaded)?,
                }
            }
            let count = rows.len();
            match table {
                DbTable::Nodes => summary.nodes = count,
                DbTable::ResourceGroups => summary.resource_groups = count,
                DbTable::ResourceDefinitions => summary.resource_definitions = count,
                DbTable::VolumeDefinitions => summary.volume_definitions = count,
                DbTable::StorPools => summary.stor_pools = count,
                DbTable::Resources => summary.resources = count,
                DbTable::Volumes => summary.volumes = count,
                DbTable::Snapshots => summary.snapshots = count,
                DbTable::NodeConnections => summary.node_connections = count,
            }
        }

        *core.write_rsc_dfns("database load").await = loaded.rsc_dfns;
        *core.rsc_grp_map.write().await = loaded.rsc_grps;
        *core.node_map.write().await = loaded.nodes;
        *core.node_conn_map.write().await = loaded.node_conns;
        *core.stor_pool_map.write().await = loaded.stor_pools;

        info!(
            db = %self.engine.db_type(),
            nodes = summary.nodes,
            rsc_dfns = summary.resource_definitions,
            resources = summary.resources,
            "Loaded objects from database"
        );
        Ok(summary)
    }
}

fn uuid(reader: &RowReader<'_>) -> Result<Uuid> {
    reader.parse(UUID)
}

fn props(reader: &RowReader<'_>) -> Result<Props> {
    reader.json(PROPS)
}

fn load_node(reader: &RowReader<'_>, loaded: &mut Loaded) -> Result<()> {
    let name: NodeName = reader.name(NODE_NAME)?;
    let flags = NodeFlags::from_bits(reader.parse(FLAGS)?)
        .ok_or_else(|| reader.error("unknown node flags"))?;
    let net_interfaces: Vec<NetInterface> = reader.json(NET_INTERFACES)?;

    let node = Node {
        uuid: uuid(reader)?,
        name: name.clone(),
        flags,
        props: props(reader)?,
        net_interfaces: net_interfaces
            .into_iter()
            .map(|ni| (ni.name.clone(), ni))
            .collect(),
        connection_status: ConnectionStatus::Offline,
    };
    loaded.nodes.insert(name, node);
    Ok(())
}

fn load_rsc_grp(reader: &RowReader<'_>, loaded: &mut Loaded) -> Result<()> {
    let name: ResourceGroupName = reader.name(RSC_GRP_NAME)?;
    let auto_place: AutoSelectFilter = reader.json(AUTO_PLACE)?;
    let rsc_grp = ResourceGroup {
        uuid: uuid(reader)?,
        name: name.clone(),
        description: reader.opt_str(DESCRIPTION).map(str::to_string),
        props: props(reader)?,
        auto_place,
    };
    loaded.rsc_grps.insert(name, rsc_grp);
    Ok(())
}

fn load_rsc_dfn(reader: &RowReader<'_>, loaded: &mut Loaded) -> Result<()> {
    let name: ResourceName = reader.name(RSC_NAME)?;
    let rsc_grp: ResourceGroupName = reader.name(RSC_GRP_NAME)?;
    if !loaded.rsc_grps.contains_key(&rsc_grp) {
        return Err(reader.error(format!("unknown resource group '{}'", rsc_grp)));
    }
    let flags = RscDfnFlags::from_bits(reader.parse(FLAGS)?)
        .ok_or_else(|| reader.error("unknown resource definition flags"))?;
    let layer_stack: Vec<DeviceLayerKind> = reader.json(LAYER_STACK)?;

    let mut rsc_dfn = ResourceDefinition::new(name.clone(), rsc_grp);
    rsc_dfn.uuid = uuid(reader)?;
    rsc_dfn.flags = flags;
    rsc_dfn.props = props(reader)?;
    rsc_dfn.layer_stack = layer_stack;
    loaded.rsc_dfns.insert(name, rsc_dfn);
    Ok(())
}

fn load_vlm_dfn(reader: &RowReader<'_>, loaded: &mut Loaded) -> Result<()> {
    let rsc_name: ResourceName = reader.name(RSC_NAME)?;
    let rsc_dfn = loaded
        .rsc_dfns
        .get_mut(&rsc_name)
        .ok_or_else(|| reader.error(format!("unknown resource definition '{}'", rsc_name)))?;

    let mut vlm_dfn = VolumeDefinition::new(reader.parse(VLM_NR)?, reader.parse(VLM_SIZE)?);
    vlm_dfn.uuid = uuid(reader)?;
    vlm_dfn.props = props(reader)?;
    rsc_dfn.add_volume_definition(vlm_dfn);
    Ok(())
}

fn load_stor_pool(reader: &RowReader<'_>, loaded: &mut Loaded) -> Result<()> {
    let node_name: NodeName = reader.name(NODE_NAME)?;
    if !loaded.nodes.contains_key(&node_name) {
        return Err(reader.error(format!("unknown node '{}'", node_name)));
    }
    let name: StorPoolName = reader.name(POOL_NAME)?;
    let provider: ProviderKind = reader.json(PROVIDER)?;

    let mut pool = StorPool::new(name.clone(), node_name.clone(), provider, reader.parse(TOTAL_CAPACITY)?);
    pool.uuid = uuid(reader)?;
    pool.free_capacity_bytes = reader.parse(FREE_CAPACITY)?;
    pool.props = props(reader)?;
    loaded.stor_pools.insert((node_name, name), pool);
    Ok(())
}

fn load_resource(reader: &RowReader<'_>, loaded: &mut Loaded) -> Result<()> {
    let node_name: NodeName = reader.name(NODE_NAME)?;
    let rsc_name: ResourceName = reader.name(RSC_NAME)?;
    if !loaded.nodes.contains_key(&node_name) {
        return Err(reader.error(format!("unknown node '{}'", node_name)));
    }
    let rsc_dfn = loaded
        .rsc_dfns
        .get_mut(&rsc_name)
        .ok_or_else(|| reader.error(format!("unknown resource definition '{}'", rsc_name)))?;

    let mut rsc = Resource::new(rsc_name, node_name, reader.json(LAYER_STACK)?);
    rsc.uuid = uuid(reader)?;
    rsc.flags = ResourceFlags::from_bits(reader.parse(FLAGS)?)
        .ok_or_else(|| reader.error("unknown resource flags"))?;
    rsc.props = props(reader)?;
    rsc_dfn
        .add_resource(rsc)
        .map_err(|err| reader.error(err))?;
    Ok(())
}

fn load_volume(reader: &RowReader<'_>, loaded: &mut Loaded) -> Result<()> {
    let node_name: NodeName = reader.name(NODE_NAME)?;
    let rsc_name: ResourceName = reader.name(RSC_NAME)?;
    let pool_name: StorPoolName = reader.name(POOL_NAME)?;
    if !loaded
        .stor_pools
        .contains_key(&(node_name.clone(), pool_name.clone()))
    {
        return Err(reader.error(format!(
            "unknown storage pool '{}' on node '{}'",
            pool_name, node_name
        )));
    }
    let rsc = loaded
        .rsc_dfns
        .get_mut(&rsc_name)
        .and_then(|dfn| dfn.resources.get_mut(&node_name))
        .ok_or_else(|| {
            reader.error(format!(
                "unknown resource '{}' on node '{}'",
                rsc_name, node_name
            ))
        })?;

    let mut vlm = Volume::new(reader.parse(VLM_NR)?, pool_name, reader.parse(VLM_SIZE)?);
    vlm.uuid = uuid(reader)?;
    vlm.props = props(reader)?;
    rsc.volumes.insert(vlm.vlm_nr, vlm);
    Ok(())
}

fn load_snapshot(reader: &RowReader<'_>, loaded: &mut Loaded) -> Result<()> {
    let node_name: NodeName = reader.name(NODE_NAME)?;
    let rsc_name: ResourceName = reader.name(RSC_NAME)?;
    let name: SnapshotName = reader.name(SNAPSHOT_NAME)?;
    if !loaded.nodes.contains_key(&node_name) {
        return Err(reader.error(format!("unknown node '{}'", node_name)));
    }
    let rsc_dfn = loaded
        .rsc_dfns
        .get_mut(&rsc_name)
        .ok_or_else(|| reader.error(format!("unknown resource definition '{}'", rsc_name)))?;

    let mut snapshot = Snapshot::new(name, rsc_name, node_name);
    snapshot.uuid = uuid(reader)?;
    snapshot.flags = SnapshotFlags::from_bits(reader.parse(FLAGS)?)
        .ok_or_else(|| reader.error("unknown snapshot flags"))?;
    snapshot.layer_stack = reader.json(LAYER_STACK)?;
    rsc_dfn.add_snapshot(snapshot);
    Ok(())
}

fn load_node_conn(reader: &RowReader<'_>, loaded: &mut Loaded) -> Result<()> {
    let src: NodeName = reader.name(NODE_NAME_SRC)?;
    let dst: NodeName = reader.name(NODE_NAME_DST)?;
    for node in [&src, &dst] {
        if !loaded.nodes.contains_key(node) {
            return Err(reader.error(format!("unknown node '{}'", node)));
        }
    }
    let mut con = NodeConnection::new(src, dst).map_err(|err| reader.error(err))?;
    con.uuid = uuid(reader)?;
    con.props = props(reader)?;
    loaded
        .node_conns
        .insert((con.source().clone(), con.target().clone()), con);
    Ok(())
}
