//! Entity Model
//!
//! The shared domain graph both the controller and the satellites operate on:
//! nodes, resource groups, resource definitions, resources, volume
//! definitions, volumes, snapshots and storage pools.
//!
//! Ownership follows the cluster model: a [`ResourceDefinition`] owns its
//! [`Resource`]s, volume definitions and snapshots. A resource refers to its
//! node by name only.

use crate::error::{Error, Result};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use uuid::Uuid;

// =============================================================================
// Names
// =============================================================================

const NAME_MIN_LEN: usize = 2;
const NAME_MAX_LEN: usize = 48;

fn validate_name(kind: &str, value: &str) -> Result<()> {
    let len = value.chars().count();
    if !(NAME_MIN_LEN..=NAME_MAX_LEN).contains(&len) {
        return Err(Error::InvalidName(format!(
            "{} '{}' must be between {} and {} characters long",
            kind, value, NAME_MIN_LEN, NAME_MAX_LEN
        )));
    }

    let mut chars = value.chars();
    if !chars.next().is_some_and(|c| c.is_ascii_alphabetic()) {
        return Err(Error::InvalidName(format!(
            "{} '{}' must start with a letter",
            kind, value
        )));
    }

    if let Some(invalid) = chars.find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-')) {
        return Err(Error::InvalidName(format!(
            "{} '{}' contains invalid character '{}'",
            kind, value, invalid
        )));
    }

    Ok(())
}

/// Defines a validated, case-insensitive name type that keeps its
/// display spelling.
macro_rules! name_type {
    ($(#[$meta:meta])* $name:ident, $kind:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name {
            display: String,
            value: String,
        }

        impl $name {
            pub fn new(name: impl Into<String>) -> Result<Self> {
                let display = name.into();
                validate_name($kind, &display)?;
                let value = display.to_uppercase();
                Ok(Self { display, value })
            }

            /// Name as it was spelled on creation
            pub fn display_value(&self) -> &str {
                &self.display
            }

            /// Normalized (upper case) name used for comparisons
            pub fn value(&self) -> &str {
                &self.value
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                self.value == other.value
            }
        }

        impl Eq for $name {}

        impl Hash for $name {
            fn hash<H: Hasher>(&self, state: &mut H) {
                self.value.hash(state);
            }
        }

        impl PartialOrd for $name {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }

        impl Ord for $name {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                self.value.cmp(&other.value)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.display)
            }
        }

        impl TryFrom<String> for $name {
            type Error = Error;

            fn try_from(value: String) -> Result<Self> {
                Self::new(value)
            }
        }

        impl TryFrom<&str> for $name {
            type Error = Error;

            fn try_from(value: &str) -> Result<Self> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(name: $name) -> String {
                name.display
            }
        }
    };
}

name_type!(
    /// Name of a cluster node
    NodeName,
    "Node name"
);
name_type!(
    /// Name of a resource definition (and of all its resources)
    ResourceName,
    "Resource name"
);
name_type!(
    /// Name of a resource group
    ResourceGroupName,
    "Resource group name"
);
name_type!(
    /// Name of a storage pool
    StorPoolName,
    "Storage pool name"
);
name_type!(
    /// Name of a snapshot
    SnapshotName,
    "Snapshot name"
);
name_type!(
    /// Name of a node's network interface
    NetInterfaceName,
    "Network interface name"
);

// =============================================================================
// State Flags
// =============================================================================

bitflags! {
    /// Node state flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct NodeFlags: u64 {
        const DELETE = 1 << 0;
        /// Node is no longer trusted to host data
        const EVICTED = 1 << 1;
        const EVACUATE = 1 << 2;
    }
}

bitflags! {
    /// Resource state flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct ResourceFlags: u64 {
        const DELETE = 1 << 0;
        const DRBD_DISKLESS = 1 << 2;
        const NVME_INITIATOR = 1 << 3;
        const TIE_BREAKER = 1 << 4;
        const INACTIVE = 1 << 5;

        const DISKLESS = Self::DRBD_DISKLESS.bits() | Self::NVME_INITIATOR.bits();
    }
}

bitflags! {
    /// Resource definition state flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct RscDfnFlags: u64 {
        const DELETE = 1 << 0;
    }
}

bitflags! {
    /// Snapshot state flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct SnapshotFlags: u64 {
        const SUCCESSFUL = 1 << 0;
        const DELETE = 1 << 1;
    }
}

// =============================================================================
// Properties
// =============================================================================

/// Well-known property namespaces and keys
pub mod keys {
    pub const NAMESPC_DRBD_OPTIONS: &str = "DrbdOptions";
    pub const KEY_AUTO_EVICT_MIN_REPLICA_COUNT: &str = "AutoEvictMinReplicaCount";
    pub const KEY_DRBD_PRIMARY_SET_ON: &str = "DrbdPrimarySetOn";
    pub const KEY_SITE: &str = "Site";
    pub const NAMESPC_AUX: &str = "Aux";
}

/// Namespaced key/value property container.
///
/// Keys are stored as `Namespace/Key`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Props {
    map: BTreeMap<String, String>,
}

fn full_key(key: &str, namespace: Option<&str>) -> String {
    match namespace {
        Some(ns) if !ns.is_empty() => format!("{}/{}", ns.trim_end_matches('/'), key),
        _ => key.to_string(),
    }
}

impl Props {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str, namespace: Option<&str>) -> Option<&str> {
        self.map.get(&full_key(key, namespace)).map(String::as_str)
    }

    pub fn set(
        &mut self,
        key: &str,
        namespace: Option<&str>,
        value: impl Into<String>,
    ) -> Option<String> {
        self.map.insert(full_key(key, namespace), value.into())
    }

    pub fn remove(&mut self, key: &str, namespace: Option<&str>) -> Option<String> {
        self.map.remove(&full_key(key, namespace))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.map.iter()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl FromIterator<(String, String)> for Props {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self {
            map: iter.into_iter().collect(),
        }
    }
}

/// Ordered lookup over several property containers; the first container
/// holding the key wins.
#[derive(Debug, Clone)]
pub struct PriorityProps<'a> {
    containers: Vec<&'a Props>,
}

impl<'a> PriorityProps<'a> {
    pub fn new(containers: impl IntoIterator<Item = &'a Props>) -> Self {
        Self {
            containers: containers.into_iter().collect(),
        }
    }

    pub fn get_prop(&self, key: &str, namespace: Option<&str>) -> Option<&'a str> {
        self.containers
            .iter()
            .find_map(|props| props.get(key, namespace))
    }
}

// =============================================================================
// Device Layers
// =============================================================================

/// Kinds of device layers a resource can be stacked from
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeviceLayerKind {
    /// Replication
    Drbd,
    /// Encryption
    Luks,
    /// NVMe-oF target/initiator
    Nvme,
    /// Backing storage
    Storage,
}

impl DeviceLayerKind {
    pub const ALL: [DeviceLayerKind; 4] = [
        DeviceLayerKind::Drbd,
        DeviceLayerKind::Luks,
        DeviceLayerKind::Nvme,
        DeviceLayerKind::Storage,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            DeviceLayerKind::Drbd => "DRBD",
            DeviceLayerKind::Luks => "LUKS",
            DeviceLayerKind::Nvme => "NVME",
            DeviceLayerKind::Storage => "STORAGE",
        }
    }
}

impl std::fmt::Display for DeviceLayerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for DeviceLayerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        DeviceLayerKind::ALL
            .into_iter()
            .find(|kind| kind.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::LayerStack(format!("unknown device layer '{}'", s)))
    }
}

/// Backing provider of a storage pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderKind {
    Diskless,
    Lvm,
    LvmThin,
    Zfs,
    ZfsThin,
    File,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Diskless => write!(f, "DISKLESS"),
            ProviderKind::Lvm => write!(f, "LVM"),
            ProviderKind::LvmThin => write!(f, "LVM_THIN"),
            ProviderKind::Zfs => write!(f, "ZFS"),
            ProviderKind::ZfsThin => write!(f, "ZFS_THIN"),
            ProviderKind::File => write!(f, "FILE"),
        }
    }
}

// =============================================================================
// Node
// =============================================================================

/// Connectivity of a satellite as seen by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionStatus {
    #[default]
    Offline,
    Connecting,
    Connected,
    Authenticated,
}

/// Transport security of a satellite connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionType {
    Plain,
    Ssl,
}

/// A network interface of a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetInterface {
    pub uuid: Uuid,
    pub name: NetInterfaceName,
    pub address: IpAddr,
    /// Set when the controller reaches the satellite through this interface
    pub stlt_port: Option<u16>,
    pub stlt_encryption: Option<EncryptionType>,
}

impl NetInterface {
    pub fn new(name: NetInterfaceName, address: &str) -> Result<Self> {
        Ok(Self {
            uuid: Uuid::new_v4(),
            name,
            address: address.parse()?,
            stlt_port: None,
            stlt_encryption: None,
        })
    }

    pub fn with_satellite_port(mut self, port: u16, encryption: EncryptionType) -> Self {
        self.stlt_port = Some(port);
        self.stlt_encryption = Some(encryption);
        self
    }
}

/// A cluster member
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub uuid: Uuid,
    pub name: NodeName,
    pub flags: NodeFlags,
    pub props: Props,
    pub net_interfaces: BTreeMap<NetInterfaceName, NetInterface>,
    /// Runtime state, never persisted
    #[serde(skip)]
    pub connection_status: ConnectionStatus,
}

impl Node {
    pub fn new(name: NodeName) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name,
            flags: NodeFlags::empty(),
            props: Props::new(),
            net_interfaces: BTreeMap::new(),
            connection_status: ConnectionStatus::Offline,
        }
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        matches!(
            self.connection_status,
            ConnectionStatus::Connected | ConnectionStatus::Authenticated
        )
    }

    #[inline]
    pub fn is_evicted(&self) -> bool {
        self.flags.contains(NodeFlags::EVICTED)
    }

    pub fn add_net_interface(&mut self, net_if: NetInterface) -> Result<()> {
        if self.net_interfaces.contains_key(&net_if.name) {
            return Err(Error::Configuration(format!(
                "network interface '{}' already exists on node '{}'",
                net_if.name, self.name
            )));
        }
        self.net_interfaces.insert(net_if.name.clone(), net_if);
        Ok(())
    }

    pub fn remove_net_interface(&mut self, name: &NetInterfaceName) -> Option<NetInterface> {
        self.net_interfaces.remove(name)
    }

    /// The interface the controller uses to reach this node's satellite
    pub fn satellite_interface(&self) -> Option<&NetInterface> {
        self.net_interfaces.values().find(|ni| ni.stlt_port.is_some())
    }
}

/// Connection between two nodes, endpoints kept in name order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConnection {
    pub uuid: Uuid,
    source: NodeName,
    target: NodeName,
    pub props: Props,
}

impl NodeConnection {
    pub fn new(node_a: NodeName, node_b: NodeName) -> Result<Self> {
        if node_a == node_b {
            return Err(Error::Configuration(format!(
                "node connection requires two distinct nodes, got '{}' twice",
                node_a
            )));
        }
        let (source, target) = if node_a < node_b {
            (node_a, node_b)
        } else {
            (node_b, node_a)
        };
        Ok(Self {
            uuid: Uuid::new_v4(),
            source,
            target,
            props: Props::new(),
        })
    }

    pub fn source(&self) -> &NodeName {
        &self.source
    }

    pub fn target(&self) -> &NodeName {
        &self.target
    }

    pub fn involves(&self, node: &NodeName) -> bool {
        &self.source == node || &self.target == node
    }

    /// The opposite endpoint, if `node` is one of the endpoints
    pub fn other_end(&self, node: &NodeName) -> Option<&NodeName> {
        if &self.source == node {
            Some(&self.target)
        } else if &self.target == node {
            Some(&self.source)
        } else {
            None
        }
    }
}

// =============================================================================
// Storage Pool
// =============================================================================

/// A capacity pool offered by a node. Consumed by placement, never mutated
/// by the reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorPool {
    pub uuid: Uuid,
    pub name: StorPoolName,
    pub node_name: NodeName,
    pub provider: ProviderKind,
    pub free_capacity_bytes: u64,
    pub total_capacity_bytes: u64,
    pub props: Props,
}

impl StorPool {
    pub fn new(
        name: StorPoolName,
        node_name: NodeName,
        provider: ProviderKind,
        total_capacity_bytes: u64,
    ) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name,
            node_name,
            provider,
            free_capacity_bytes: total_capacity_bytes,
            total_capacity_bytes,
            props: Props::new(),
        }
    }

    #[inline]
    pub fn is_diskless(&self) -> bool {
        self.provider == ProviderKind::Diskless
    }
}

// =============================================================================
// Resource Group
// =============================================================================

/// Replica count used when a resource group does not configure one
pub const DEFAULT_REPLICA_COUNT: u32 = 2;

/// Placement policy template inherited by resource definitions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceGroup {
    pub uuid: Uuid,
    pub name: ResourceGroupName,
    pub description: Option<String>,
    pub props: Props,
    pub auto_place: super::select_filter::AutoSelectFilter,
}

impl ResourceGroup {
    pub fn new(name: ResourceGroupName) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name,
            description: None,
            props: Props::new(),
            auto_place: Default::default(),
        }
    }

    /// Target replica count of the auto-place configuration
    pub fn replica_count(&self) -> u32 {
        self.auto_place.place_count.unwrap_or(DEFAULT_REPLICA_COUNT)
    }
}

// =============================================================================
// Volumes
// =============================================================================

/// Per-resource-definition block volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeDefinition {
    pub uuid: Uuid,
    pub vlm_nr: u32,
    pub size_bytes: u64,
    pub props: Props,
}

impl VolumeDefinition {
    pub fn new(vlm_nr: u32, size_bytes: u64) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            vlm_nr,
            size_bytes,
            props: Props::new(),
        }
    }
}

/// Instance of a volume definition on one resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub uuid: Uuid,
    pub vlm_nr: u32,
    pub stor_pool: StorPoolName,
    pub size_bytes: u64,
    pub props: Props,
}

impl Volume {
    pub fn new(vlm_nr: u32, stor_pool: StorPoolName, size_bytes: u64) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            vlm_nr,
            stor_pool,
            size_bytes,
            props: Props::new(),
        }
    }
}

// =============================================================================
// Resource
// =============================================================================

/// Instantiation of a resource definition on one node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub uuid: Uuid,
    pub rsc_name: ResourceName,
    pub node_name: NodeName,
    pub flags: ResourceFlags,
    /// Device layers, top to bottom. Empty for legacy resources.
    pub layer_stack: Vec<DeviceLayerKind>,
    pub volumes: BTreeMap<u32, Volume>,
    pub props: Props,
}

impl Resource {
    pub fn new(rsc_name: ResourceName, node_name: NodeName, layer_stack: Vec<DeviceLayerKind>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            rsc_name,
            node_name,
            flags: ResourceFlags::empty(),
            layer_stack,
            volumes: BTreeMap::new(),
            props: Props::new(),
        }
    }

    #[inline]
    pub fn is_deleted(&self) -> bool {
        self.flags.contains(ResourceFlags::DELETE)
    }

    #[inline]
    pub fn is_diskless(&self) -> bool {
        self.flags.intersects(ResourceFlags::DISKLESS)
    }

    #[inline]
    pub fn is_tie_breaker(&self) -> bool {
        self.flags.contains(ResourceFlags::TIE_BREAKER)
    }

    pub fn has_layer(&self, kind: DeviceLayerKind) -> bool {
        self.layer_stack.contains(&kind)
    }

    /// Logical tombstone; physical removal happens once all satellites
    /// have torn the resource down.
    pub fn mark_deleted(&mut self) {
        self.flags.insert(ResourceFlags::DELETE);
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// Point-in-time marker of a resource on one node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub uuid: Uuid,
    pub name: SnapshotName,
    pub rsc_name: ResourceName,
    pub node_name: NodeName,
    pub flags: SnapshotFlags,
    /// Layer metadata copied from the owning resource on the satellite
    pub layer_stack: Vec<DeviceLayerKind>,
}

impl Snapshot {
    pub fn new(name: SnapshotName, rsc_name: ResourceName, node_name: NodeName) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name,
            rsc_name,
            node_name,
            flags: SnapshotFlags::empty(),
            layer_stack: Vec::new(),
        }
    }
}

// =============================================================================
// Resource Definition
// =============================================================================

/// Logical identity of a replicated resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDefinition {
    pub uuid: Uuid,
    pub name: ResourceName,
    pub rsc_grp: ResourceGroupName,
    pub flags: RscDfnFlags,
    pub props: Props,
    /// Layer stack new resources are created with
    pub layer_stack: Vec<DeviceLayerKind>,
    pub volume_definitions: BTreeMap<u32, VolumeDefinition>,
    pub resources: BTreeMap<NodeName, Resource>,
    pub snapshots: BTreeMap<(SnapshotName, NodeName), Snapshot>,
}

impl ResourceDefinition {
    pub fn new(name: ResourceName, rsc_grp: ResourceGroupName) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name,
            rsc_grp,
            flags: RscDfnFlags::empty(),
            props: Props::new(),
            layer_stack: vec![DeviceLayerKind::Drbd, DeviceLayerKind::Storage],
            volume_definitions: BTreeMap::new(),
            resources: BTreeMap::new(),
            snapshots: BTreeMap::new(),
        }
    }

    pub fn add_volume_definition(&mut self, vlm_dfn: VolumeDefinition) {
        self.volume_definitions.insert(vlm_dfn.vlm_nr, vlm_dfn);
    }

    pub fn add_resource(&mut self, rsc: Resource) -> Result<()> {
        if rsc.rsc_name != self.name {
            return Err(Error::Internal(format!(
                "resource '{}' does not belong to definition '{}'",
                rsc.rsc_name, self.name
            )));
        }
        if self.resources.contains_key(&rsc.node_name) {
            return Err(Error::api_rc(
                crate::domain::api_rc::RcEntry::new(
                    crate::domain::api_rc::codes::FAIL_EXISTS_RSC,
                    format!("Resource '{}' already exists on node '{}'", self.name, rsc.node_name),
                ),
            ));
        }
        self.resources.insert(rsc.node_name.clone(), rsc);
        Ok(())
    }

    pub fn add_snapshot(&mut self, snapshot: Snapshot) {
        self.snapshots
            .insert((snapshot.name.clone(), snapshot.node_name.clone()), snapshot);
    }

    pub fn resource(&self, node: &NodeName) -> Option<&Resource> {
        self.resources.get(node)
    }

    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.resources.values()
    }

    /// Sum of all volume definition sizes
    pub fn total_volume_size(&self) -> u64 {
        self.volume_definitions.values().map(|v| v.size_bytes).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_validation() {
        assert!(NodeName::new("alpha").is_ok());
        assert!(NodeName::new("node-01_a").is_ok());
        assert!(NodeName::new("a").is_err());
        assert!(NodeName::new("1node").is_err());
        assert!(NodeName::new("no.dots").is_err());
        assert!(ResourceName::new("r".repeat(49)).is_err());
    }

    #[test]
    fn test_name_case_insensitive() {
        let a = ResourceName::new("Data0").unwrap();
        let b = ResourceName::new("DATA0").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.display_value(), "Data0");
        assert_eq!(a.value(), "DATA0");

        let json = serde_json::to_string(&a).unwrap();
        assert_eq!(json, "\"Data0\"");
        let back: ResourceName = serde_json::from_str(&json).unwrap();
        assert_eq!(back.display_value(), "Data0");
        assert!(serde_json::from_str::<ResourceName>("\"9bad\"").is_err());
    }

    #[test]
    fn test_resource_flags() {
        let mut rsc = Resource::new(
            ResourceName::new("r0").unwrap(),
            NodeName::new("alpha").unwrap(),
            vec![DeviceLayerKind::Drbd, DeviceLayerKind::Storage],
        );
        assert!(!rsc.is_diskless());
        rsc.flags.insert(ResourceFlags::NVME_INITIATOR);
        assert!(rsc.is_diskless());
        rsc.mark_deleted();
        assert!(rsc.is_deleted());
        assert!(rsc.has_layer(DeviceLayerKind::Drbd));
        assert!(!rsc.has_layer(DeviceLayerKind::Luks));
    }

    #[test]
    fn test_priority_props() {
        let mut rsc_dfn = Props::new();
        let mut rsc_grp = Props::new();
        let mut ctrl = Props::new();
        ctrl.set("Key", Some("Ns"), "ctrl");
        rsc_grp.set("Key", Some("Ns"), "grp");
        ctrl.set("Other", Some("Ns"), "ctrl-other");

        let prio = PriorityProps::new([&rsc_dfn, &rsc_grp, &ctrl]);
        assert_eq!(prio.get_prop("Key", Some("Ns")), Some("grp"));
        assert_eq!(prio.get_prop("Other", Some("Ns")), Some("ctrl-other"));
        assert_eq!(prio.get_prop("Missing", Some("Ns")), None);

        rsc_dfn.set("Key", Some("Ns"), "dfn");
        let prio = PriorityProps::new([&rsc_dfn, &rsc_grp, &ctrl]);
        assert_eq!(prio.get_prop("Key", Some("Ns")), Some("dfn"));
    }

    #[test]
    fn test_node_connection_ordering() {
        let a = NodeName::new("bravo").unwrap();
        let b = NodeName::new("alpha").unwrap();
        let con = NodeConnection::new(a.clone(), b.clone()).unwrap();
        assert_eq!(con.source(), &b);
        assert_eq!(con.target(), &a);
        assert_eq!(con.other_end(&a), Some(&b));
        assert!(con.involves(&b));
        assert!(NodeConnection::new(a.clone(), a).is_err());
    }

    #[test]
    fn test_net_interface() {
        let mut node = Node::new(NodeName::new("alpha").unwrap());
        let ni = NetInterface::new(NetInterfaceName::new("default").unwrap(), "10.0.0.1")
            .unwrap()
            .with_satellite_port(3366, EncryptionType::Plain);
        node.add_net_interface(ni.clone()).unwrap();
        assert!(node.add_net_interface(ni).is_err());
        assert_eq!(node.satellite_interface().and_then(|ni| ni.stlt_port), Some(3366));

        assert!(NetInterface::new(NetInterfaceName::new("bad").unwrap(), "10.0.0.300").is_err());
    }

    #[test]
    fn test_layer_kind_parse() {
        assert_eq!("drbd".parse::<DeviceLayerKind>().unwrap(), DeviceLayerKind::Drbd);
        assert_eq!("STORAGE".parse::<DeviceLayerKind>().unwrap(), DeviceLayerKind::Storage);
        assert!("cache".parse::<DeviceLayerKind>().is_err());
    }

    #[test]
    fn test_total_volume_size() {
        let mut dfn = ResourceDefinition::new(
            ResourceName::new("r0").unwrap(),
            ResourceGroupName::new("dflt").unwrap(),
        );
        dfn.add_volume_definition(VolumeDefinition::new(0, 1 << 30));
        dfn.add_volume_definition(VolumeDefinition::new(1, 2 << 30));
        assert_eq!(dfn.total_volume_size(), 3 << 30);
    }
}
