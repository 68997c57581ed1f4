//! Controller object graph
//!
//! All controller state lives in [`CoreObjects`], one async `RwLock` per
//! namespace. Locks are always taken in [`LockObj`] declaration order.

use crate::domain::{
    ConnectionStatus, DbEngineRef, Node, NodeConnection, NodeFlags, NodeName, Props, Resource,
    ResourceDefinition, ResourceGroup, ResourceGroupName, ResourceName, StorPool, StorPoolName,
};
use crate::error::{Error, Result};
use crate::persistence::rows::{columns, VolumeDefinitionRow, VolumeRow};
use crate::persistence::Transaction;
use std::collections::BTreeMap;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

pub type NodeMap = BTreeMap<NodeName, Node>;
pub type NodeConnMap = BTreeMap<(NodeName, NodeName), NodeConnection>;
pub type RscGrpMap = BTreeMap<ResourceGroupName, ResourceGroup>;
pub type RscDfnMap = BTreeMap<ResourceName, ResourceDefinition>;
pub type StorPoolMap = BTreeMap<(NodeName, StorPoolName), StorPool>;

/// Lockable namespaces, in acquisition order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockObj {
    RscDfnMap,
    RscGrpMap,
    NodesMap,
    StorPoolMap,
    CtrlConfig,
}

impl std::fmt::Display for LockObj {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockObj::RscDfnMap => write!(f, "RSC_DFN_MAP"),
            LockObj::RscGrpMap => write!(f, "RSC_GRP_MAP"),
            LockObj::NodesMap => write!(f, "NODES_MAP"),
            LockObj::StorPoolMap => write!(f, "STOR_POOL_DFN_MAP"),
            LockObj::CtrlConfig => write!(f, "CTRL_CONFIG"),
        }
    }
}

/// The controller's entity graph plus its database engine
pub struct CoreObjects {
    pub node_map: RwLock<NodeMap>,
    pub node_conn_map: RwLock<NodeConnMap>,
    pub rsc_grp_map: RwLock<RscGrpMap>,
    pub rsc_dfn_map: RwLock<RscDfnMap>,
    pub stor_pool_map: RwLock<StorPoolMap>,
    /// System wide properties
    pub ctrl_props: RwLock<Props>,
    db: DbEngineRef,
}

impl CoreObjects {
    pub fn new(db: DbEngineRef) -> Self {
        Self {
            node_map: RwLock::new(BTreeMap::new()),
            node_conn_map: RwLock::new(BTreeMap::new()),
            rsc_grp_map: RwLock::new(BTreeMap::new()),
            rsc_dfn_map: RwLock::new(BTreeMap::new()),
            stor_pool_map: RwLock::new(BTreeMap::new()),
            ctrl_props: RwLock::new(Props::new()),
            db,
        }
    }

    pub fn db(&self) -> &DbEngineRef {
        &self.db
    }

    pub fn begin_transaction(&self) -> Transaction {
        Transaction::new(self.db.clone())
    }

    /// Exclusive lock over the resource definition namespace
    pub async fn write_rsc_dfns(&self, scope: &str) -> RwLockWriteGuard<'_, RscDfnMap> {
        debug!(lock = %LockObj::RscDfnMap, scope, "Acquiring write lock");
        self.rsc_dfn_map.write().await
    }

    pub async fn read_rsc_dfns(&self) -> RwLockReadGuard<'_, RscDfnMap> {
        self.rsc_dfn_map.read().await
    }

    // =========================================================================
    // Creation
    // =========================================================================

    pub async fn create_node(&self, node: Node) -> Result<()> {
        let mut nodes = self.node_map.write().await;
        if nodes.contains_key(&node.name) {
            return Err(Error::Configuration(format!("node '{}' already exists", node.name)));
        }
        let mut tx = self.begin_transaction();
        tx.create(&node)?;
        tx.commit().await?;

        info!(node = %node.name, "Created node");
        nodes.insert(node.name.clone(), node);
        Ok(())
    }

    pub async fn create_node_connection(&self, con: NodeConnection) -> Result<()> {
        {
            let nodes = self.node_map.read().await;
            for name in [con.source(), con.target()] {
                if !nodes.contains_key(name) {
                    return Err(Error::NodeNotFound {
                        name: name.to_string(),
                    });
                }
            }
        }
        let mut cons = self.node_conn_map.write().await;
        let mut tx = self.begin_transaction();
        tx.create(&con)?;
        tx.commit().await?;
        cons.insert((con.source().clone(), con.target().clone()), con);
        Ok(())
    }

    pub async fn create_resource_group(&self, rsc_grp: ResourceGroup) -> Result<()> {
        let mut grps = self.rsc_grp_map.write().await;
        if grps.contains_key(&rsc_grp.name) {
            return Err(Error::Configuration(format!(
                "resource group '{}' already exists",
                rsc_grp.name
            )));
        }
        let mut tx = self.begin_transaction();
        tx.create(&rsc_grp)?;
        tx.commit().await?;
        grps.insert(rsc_grp.name.clone(), rsc_grp);
        Ok(())
    }

    /// Create a resource definition together with its volume definitions,
    /// resources and volumes.
    pub async fn create_resource_definition(&self, rsc_dfn: ResourceDefinition) -> Result<()> {
        let mut dfns = self.write_rsc_dfns("create resource definition").await;
        if dfns.contains_key(&rsc_dfn.name) {
            return Err(Error::Configuration(format!(
                "resource definition '{}' already exists",
                rsc_dfn.name
            )));
        }
        if !self.rsc_grp_map.read().await.contains_key(&rsc_dfn.rsc_grp) {
            return Err(Error::ResourceGroupNotFound {
                name: rsc_dfn.rsc_grp.to_string(),
            });
        }
        {
            let nodes = self.node_map.read().await;
            if let Some(rsc) = rsc_dfn.resources().find(|rsc| !nodes.contains_key(&rsc.node_name)) {
                return Err(Error::NodeNotFound {
                    name: rsc.node_name.to_string(),
                });
            }
        }

        let mut tx = self.begin_transaction();
        tx.create(&rsc_dfn)?;
        for vlm_dfn in rsc_dfn.volume_definitions.values() {
            tx.create(&VolumeDefinitionRow {
                rsc_name: &rsc_dfn.name,
                vlm_dfn,
            })?;
        }
        for rsc in rsc_dfn.resources() {
            persist_resource(&mut tx, rsc)?;
        }
        for snapshot in rsc_dfn.snapshots.values() {
            tx.create(snapshot)?;
        }
        tx.commit().await?;

        info!(rsc = %rsc_dfn.name, resources = rsc_dfn.resources.len(), "Created resource definition");
        dfns.insert(rsc_dfn.name.clone(), rsc_dfn);
        Ok(())
    }

    pub async fn create_stor_pool(&self, pool: StorPool) -> Result<()> {
        if !self.node_map.read().await.contains_key(&pool.node_name) {
            return Err(Error::NodeNotFound {
                name: pool.node_name.to_string(),
            });
        }
        let mut pools = self.stor_pool_map.write().await;
        let mut tx = self.begin_transaction();
        tx.create(&pool)?;
        tx.commit().await?;
        pools.insert((pool.node_name.clone(), pool.name.clone()), pool);
        Ok(())
    }

    // =========================================================================
    // Node State
    // =========================================================================

    /// Set or clear node flags, persisting the change
    pub async fn update_node_flags(
        &self,
        name: &NodeName,
        set: NodeFlags,
        clear: NodeFlags,
    ) -> Result<NodeFlags> {
        let mut nodes = self.node_map.write().await;
        let node = nodes.get_mut(name).ok_or_else(|| Error::NodeNotFound {
            name: name.to_string(),
        })?;
        let mut flags = node.flags;
        flags.remove(clear);
        flags.insert(set);

        let mut tx = self.begin_transaction();
        tx.update_column(&*node, columns::FLAGS, flags.bits().to_string());
        tx.commit().await?;
        node.flags = flags;
        Ok(flags)
    }

    /// Runtime connectivity; not persisted
    pub async fn set_connection_status(&self, name: &NodeName, status: ConnectionStatus) -> Result<()> {
        let mut nodes = self.node_map.write().await;
        let node = nodes.get_mut(name).ok_or_else(|| Error::NodeNotFound {
            name: name.to_string(),
        })?;
        debug!(node = %name, ?status, "Connection status changed");
        node.connection_status = status;
        Ok(())
    }

    /// Names of the resource definitions with a resource on `node`
    pub async fn resources_on_node(&self, node: &NodeName) -> Vec<ResourceName> {
        self.rsc_dfn_map
            .read()
            .await
            .values()
            .filter(|dfn| dfn.resources.contains_key(node))
            .map(|dfn| dfn.name.clone())
            .collect()
    }
}

/// Record the creation of a resource and its volumes
pub fn persist_resource(tx: &mut Transaction, rsc: &Resource) -> Result<()> {
    tx.create(rsc)?;
    for vlm in rsc.volumes.values() {
        tx.create(&VolumeRow { rsc, vlm })?;
    }
    Ok(())
}
