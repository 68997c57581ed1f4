//! Domain Ports - Core trait definitions for the orchestrator
//!
//! These traits define the boundaries between the reconciliation/dispatch
//! logic and its collaborators (persistence, placement, satellite
//! communication). Adapters implement these traits to provide concrete
//! functionality.

use super::api_rc::{ApiCallRc, ResponseContext};
use super::model::{
    DeviceLayerKind, NodeName, ResourceDefinition, ResourceName, Resource, Snapshot, StorPool,
};
use super::select_filter::AutoSelectFilter;
use crate::error::Result;
use crate::persistence::Transaction;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Deferred side effect producing a structured result once driven.
/// Nothing happens until the future is polled.
pub type Pipeline = BoxFuture<'static, Result<ApiCallRc>>;

// =============================================================================
// Persistence Port
// =============================================================================

/// Supported database backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    /// Table -> primary key -> row
    Memory,
    /// Flat key/value store
    Kv,
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatabaseType::Memory => write!(f, "memory"),
            DatabaseType::Kv => write!(f, "kv"),
        }
    }
}

/// Persisted tables, in load order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DbTable {
    Nodes,
    ResourceGroups,
    ResourceDefinitions,
    VolumeDefinitions,
    StorPools,
    Resources,
    Volumes,
    Snapshots,
    NodeConnections,
}

impl DbTable {
    pub const LOAD_ORDER: [DbTable; 9] = [
        DbTable::Nodes,
        DbTable::ResourceGroups,
        DbTable::ResourceDefinitions,
        DbTable::VolumeDefinitions,
        DbTable::StorPools,
        DbTable::Resources,
        DbTable::Volumes,
        DbTable::Snapshots,
        DbTable::NodeConnections,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            DbTable::Nodes => "NODES",
            DbTable::ResourceGroups => "RESOURCE_GROUPS",
            DbTable::ResourceDefinitions => "RESOURCE_DEFINITIONS",
            DbTable::VolumeDefinitions => "VOLUME_DEFINITIONS",
            DbTable::StorPools => "NODE_STOR_POOL",
            DbTable::Resources => "RESOURCES",
            DbTable::Volumes => "VOLUMES",
            DbTable::Snapshots => "SNAPSHOTS",
            DbTable::NodeConnections => "NODE_CONNECTIONS",
        }
    }
}

impl std::fmt::Display for DbTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Column name -> serialized value
pub type Row = BTreeMap<String, String>;

/// A single persistence operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbOp {
    Create {
        table: DbTable,
        pk: String,
        row: Row,
    },
    Delete {
        table: DbTable,
        pk: String,
    },
    UpdateColumn {
        table: DbTable,
        pk: String,
        column: String,
        value: String,
    },
}

/// Port for the backing database
#[async_trait]
pub trait DbEngine: Send + Sync {
    fn db_type(&self) -> DatabaseType;

    /// Apply a batch of operations atomically: either all of them are
    /// visible afterwards or none.
    async fn commit(&self, ops: Vec<DbOp>) -> Result<()>;

    /// Load every row of a table, keyed by primary key
    async fn load_all(&self, table: DbTable) -> Result<BTreeMap<String, Row>>;
}

// =============================================================================
// Placement Port
// =============================================================================

/// Port selecting storage pools for new replicas
#[async_trait]
pub trait Autoplacer: Send + Sync {
    /// Select `filter.place_count` pools able to hold `required_size_bytes`.
    ///
    /// Runs inside the caller's lock scope over the resource definition
    /// namespace; `rsc_dfns` is that locked namespace, used to evaluate
    /// do-not-place-with constraints. `None` means no viable selection.
    async fn select_placement(
        &self,
        filter: &AutoSelectFilter,
        rsc_dfn: &ResourceDefinition,
        rsc_dfns: &BTreeMap<ResourceName, ResourceDefinition>,
        required_size_bytes: u64,
    ) -> Result<Option<Vec<StorPool>>>;
}

// =============================================================================
// Satellite Sync Port
// =============================================================================

/// Decides which hosting nodes receive an update
pub type NodeFilter = Arc<dyn Fn(&NodeName) -> bool + Send + Sync>;

/// Acknowledgement of one satellite
#[derive(Debug)]
pub struct NodeResponse {
    pub node_name: NodeName,
    pub result: Result<ApiCallRc>,
}

/// Port pushing resource state to the satellites hosting it
#[async_trait]
pub trait SatelliteUpdater: Send + Sync {
    /// Push the state of `rsc_dfn` to every hosting node accepted by
    /// `node_filter`. The returned stream yields one response per node.
    async fn update_satellites(
        &self,
        rsc_dfn: &ResourceDefinition,
        node_filter: NodeFilter,
    ) -> Result<BoxStream<'static, NodeResponse>>;
}

/// Filter accepting every node
pub fn all_nodes() -> NodeFilter {
    Arc::new(|_| true)
}

// =============================================================================
// Resource Creation Port
// =============================================================================

/// Input of an autoplace driven resource creation
pub struct AutoplaceRequest<'a> {
    pub context: &'a ResponseContext,
    pub rsc_dfn: &'a mut ResourceDefinition,
    pub candidate_pools: &'a [StorPool],
    pub diskless_on_remaining: bool,
    /// Overrides the definition's layer stack when non-empty
    pub layer_stack: &'a [DeviceLayerKind],
}

/// Result of a resource creation
pub struct CreatedResources {
    /// Activation side effects, to be driven after commit
    pub pipelines: Vec<Pipeline>,
    /// Nodes a new resource was created on
    pub created_on: Vec<NodeName>,
}

/// Port creating resources on selected storage pools
#[async_trait]
pub trait ResourceCreator: Send + Sync {
    /// Create resources in `request.rsc_dfn`, record their persistence
    /// operations in `tx` and result entries in `responses`.
    async fn create_resources(
        &self,
        request: AutoplaceRequest<'_>,
        tx: &mut Transaction,
        responses: &mut ApiCallRc,
    ) -> Result<CreatedResources>;
}

// =============================================================================
// Satellite Channel
// =============================================================================

/// Message from the controller to one satellite
#[derive(Debug)]
pub enum SatelliteMessage {
    /// Complete state of the node; completes the full sync handshake
    FullSync {
        resources: Vec<Resource>,
        snapshots: Vec<Snapshot>,
        reply: oneshot::Sender<ApiCallRc>,
    },
    /// Changed resources assigned to the node
    ApplyResources {
        resources: Vec<Resource>,
        snapshots: Vec<Snapshot>,
        reply: oneshot::Sender<ApiCallRc>,
    },
}

/// Per-resource outcome channel of a satellite
pub trait ResponseSink: Send + Sync {
    fn notify_resource_applied(&self, rsc_name: &ResourceName, responses: ApiCallRc);
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type DbEngineRef = Arc<dyn DbEngine>;
pub type AutoplacerRef = Arc<dyn Autoplacer>;
pub type SatelliteUpdaterRef = Arc<dyn SatelliteUpdater>;
pub type ResourceCreatorRef = Arc<dyn ResourceCreator>;
