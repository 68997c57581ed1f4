//! Configuration
//!
//! Both processes read an optional YAML file; command line flags override
//! the values loaded from it.

use crate::domain::{DatabaseType, DeviceLayerKind, NodeName, ProviderKind, StorPoolName};
use crate::error::{Error, Result};
use crate::satellite::{validate_layer_stack, LEGACY_LAYER_STACK};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

fn load_yaml<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Configuration(format!("Cannot read {}: {}", path.display(), e))
    })?;
    Ok(serde_yaml::from_str(&content)?)
}

// =============================================================================
// Controller
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ControllerConfig {
    /// Seconds between two reconcile cycles
    pub reconcile_interval_secs: u64,
    pub database: DatabaseType,
    /// Seconds to wait for a satellite acknowledgement
    pub satellite_timeout_secs: u64,
    /// Capacity of the topology event channel
    pub event_capacity: usize,
    /// Satellites hosted inside the controller process
    pub satellites: Vec<SatelliteConfig>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: 30,
            database: DatabaseType::Memory,
            satellite_timeout_secs: 10,
            event_capacity: 256,
            satellites: Vec::new(),
        }
    }
}

impl ControllerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let config: Self = load_yaml(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.reconcile_interval_secs == 0 {
            return Err(Error::Configuration(
                "reconcileIntervalSecs must be greater than zero".to_string(),
            ));
        }
        if self.satellite_timeout_secs == 0 {
            return Err(Error::Configuration(
                "satelliteTimeoutSecs must be greater than zero".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(Error::Configuration("eventCapacity must be greater than zero".to_string()));
        }
        let mut names = std::collections::HashSet::new();
        for satellite in &self.satellites {
            satellite.validate()?;
            if !names.insert(satellite.node_name()?) {
                return Err(Error::Configuration(format!(
                    "satellite '{}' configured twice",
                    satellite.node_name
                )));
            }
        }
        Ok(())
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn satellite_timeout(&self) -> Duration {
        Duration::from_secs(self.satellite_timeout_secs)
    }
}

// =============================================================================
// Satellite
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorPoolConfig {
    pub name: String,
    #[serde(default = "default_provider")]
    pub provider: ProviderKind,
    pub capacity_bytes: u64,
}

fn default_provider() -> ProviderKind {
    ProviderKind::Lvm
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SatelliteConfig {
    pub node_name: String,
    /// Stack used for resources without layer data until the first full sync
    pub default_layer_stack: Vec<DeviceLayerKind>,
    pub storage_pools: Vec<StorPoolConfig>,
}

impl Default for SatelliteConfig {
    fn default() -> Self {
        Self {
            node_name: "satellite-1".to_string(),
            default_layer_stack: LEGACY_LAYER_STACK.to_vec(),
            storage_pools: vec![StorPoolConfig {
                name: "DfltStorPool".to_string(),
                provider: ProviderKind::Lvm,
                capacity_bytes: 100 << 30,
            }],
        }
    }
}

impl SatelliteConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let config: Self = load_yaml(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.node_name()?;
        validate_layer_stack(&self.default_layer_stack).map_err(|e| {
            Error::Configuration(format!("defaultLayerStack of '{}': {}", self.node_name, e))
        })?;
        self.storage_pools()?;
        Ok(())
    }

    pub fn node_name(&self) -> Result<NodeName> {
        NodeName::new(self.node_name.as_str())
            .map_err(|e| Error::Configuration(format!("invalid node name: {}", e)))
    }

    /// Storage pools with validated names
    pub fn storage_pools(&self) -> Result<Vec<(StorPoolName, ProviderKind, u64)>> {
        let mut pools = Vec::with_capacity(self.storage_pools.len());
        for pool in &self.storage_pools {
            let name = StorPoolName::new(pool.name.as_str()).map_err(|e| {
                Error::Configuration(format!("invalid storage pool on '{}': {}", self.node_name, e))
            })?;
            if pools.iter().any(|(existing, _, _)| *existing == name) {
                return Err(Error::Configuration(format!(
                    "storage pool '{}' configured twice on '{}'",
                    pool.name, self.node_name
                )));
            }
            pools.push((name, pool.provider, pool.capacity_bytes));
        }
        Ok(pools)
    }
}
