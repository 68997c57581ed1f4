//! In-memory device layers
//!
//! Replication, encryption and storage handlers that keep their device
//! state in memory. They follow the same prepare / process / clear cache
//! protocol a kernel backed implementation would.

use super::layer::{DeviceLayer, LayerResource, LayerRscId, ProcessContext};
use crate::domain::api_rc::codes;
use crate::domain::{DeviceLayerKind, RcEntry, ResourceName, Snapshot, StorPoolName};
use crate::error::{Error, LayerFailure, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info};

/// First minor number handed out
pub const DRBD_MINOR_START: u32 = 1000;

// =============================================================================
// DRBD
// =============================================================================

/// Replication layer; owns the minor numbers
#[derive(Debug)]
pub struct DrbdLayer {
    minors: Mutex<BTreeMap<ResourceName, u32>>,
    /// Resources of the current batch
    batch: Mutex<HashSet<ResourceName>>,
}

impl Default for DrbdLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl DrbdLayer {
    pub fn new() -> Self {
        Self {
            minors: Mutex::new(BTreeMap::new()),
            batch: Mutex::new(HashSet::new()),
        }
    }

    pub fn minor(&self, rsc_name: &ResourceName) -> Option<u32> {
        self.minors.lock().get(rsc_name).copied()
    }

    fn allocate_minor(&self, rsc_name: &ResourceName) -> u32 {
        let mut minors = self.minors.lock();
        if let Some(minor) = minors.get(rsc_name) {
            return *minor;
        }
        let taken: HashSet<u32> = minors.values().copied().collect();
        let minor = (DRBD_MINOR_START..)
            .find(|minor| !taken.contains(minor))
            .unwrap_or(DRBD_MINOR_START);
        minors.insert(rsc_name.clone(), minor);
        minor
    }

    pub fn batch_size(&self) -> usize {
        self.batch.lock().len()
    }
}

#[async_trait]
impl DeviceLayer for DrbdLayer {
    fn kind(&self) -> DeviceLayerKind {
        DeviceLayerKind::Drbd
    }

    async fn prepare(&self, resources: &[&LayerResource], _snapshots: &[Snapshot]) -> Result<()> {
        let mut batch = self.batch.lock();
        batch.extend(resources.iter().map(|lrsc| lrsc.rsc_name().clone()));
        Ok(())
    }

    async fn process(&self, ctx: &mut ProcessContext<'_>, id: LayerRscId) -> Result<()> {
        let lrsc = ctx.resource(id)?;
        let rsc_name = lrsc.rsc_name();

        if lrsc.resource.is_deleted() {
            if !lrsc.resource.is_diskless() {
                ctx.process_children(id).await?;
            }
            if let Some(minor) = self.minors.lock().remove(rsc_name) {
                debug!(rsc = %rsc_name, minor, "Released DRBD minor");
            }
            ctx.add_entry(RcEntry::new(
                codes::MASK_RSC | codes::DELETED,
                format!("DRBD resource '{}' shut down", rsc_name),
            ));
            return Ok(());
        }

        let minor = self.allocate_minor(rsc_name);
        if lrsc.resource.is_diskless() {
            debug!(rsc = %rsc_name, minor, "Diskless DRBD resource, skipping lower layers");
        } else {
            ctx.process_children(id).await?;
        }
        ctx.add_entry(RcEntry::new(
            codes::MASK_RSC | codes::MODIFIED,
            format!("DRBD resource '{}' adjusted (minor {})", rsc_name, minor),
        ));
        Ok(())
    }

    async fn clear_cache(&self) -> Result<()> {
        self.batch.lock().clear();
        Ok(())
    }
}

// =============================================================================
// LUKS
// =============================================================================

/// Encryption layer; needs the master key before any device can be opened
#[derive(Debug, Default)]
pub struct LuksLayer {
    master_key: RwLock<Option<Vec<u8>>>,
    open: Mutex<HashSet<ResourceName>>,
}

impl LuksLayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_master_key(&self, key: Vec<u8>) {
        *self.master_key.write() = Some(key);
    }

    pub fn is_open(&self, rsc_name: &ResourceName) -> bool {
        self.open.lock().contains(rsc_name)
    }
}

#[async_trait]
impl DeviceLayer for LuksLayer {
    fn kind(&self) -> DeviceLayerKind {
        DeviceLayerKind::Luks
    }

    async fn prepare(&self, _resources: &[&LayerResource], _snapshots: &[Snapshot]) -> Result<()> {
        Ok(())
    }

    async fn process(&self, ctx: &mut ProcessContext<'_>, id: LayerRscId) -> Result<()> {
        let lrsc = ctx.resource(id)?;
        let rsc_name = lrsc.rsc_name();

        if lrsc.resource.is_deleted() {
            self.open.lock().remove(rsc_name);
            return ctx.process_children(id).await;
        }

        if self.master_key.read().is_none() {
            return Err(Error::ResourceLayer(
                LayerFailure::new(format!("Failed to open encrypted device of '{}'", rsc_name))
                    .with_cause("The master key has not been set")
                    .with_correction("Enter the master passphrase on the controller"),
            ));
        }
        ctx.process_children(id).await?;
        self.open.lock().insert(rsc_name.clone());
        ctx.add_entry(RcEntry::new(
            codes::MASK_RSC | codes::MODIFIED,
            format!("Encrypted device of '{}' opened", rsc_name),
        ));
        Ok(())
    }

    async fn clear_cache(&self) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Storage
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PoolState {
    total_bytes: u64,
    free_bytes: u64,
}

/// Backing storage layer allocating volumes from local pools
#[derive(Debug)]
pub struct StorageLayer {
    pools: Mutex<BTreeMap<StorPoolName, PoolState>>,
    /// (resource, volume number) to (pool, size)
    volumes: Mutex<BTreeMap<(ResourceName, u32), (StorPoolName, u64)>>,
    /// Pools referenced by the current batch
    prepared_pools: Mutex<HashSet<StorPoolName>>,
}

impl StorageLayer {
    pub fn new(capacities: impl IntoIterator<Item = (StorPoolName, u64)>) -> Self {
        let pools = capacities
            .into_iter()
            .map(|(name, total_bytes)| {
                (
                    name,
                    PoolState {
                        total_bytes,
                        free_bytes: total_bytes,
                    },
                )
            })
            .collect();
        Self {
            pools: Mutex::new(pools),
            volumes: Mutex::new(BTreeMap::new()),
            prepared_pools: Mutex::new(HashSet::new()),
        }
    }

    pub fn free_bytes(&self, pool: &StorPoolName) -> Option<u64> {
        self.pools.lock().get(pool).map(|state| state.free_bytes)
    }

    pub fn total_bytes(&self, pool: &StorPoolName) -> Option<u64> {
        self.pools.lock().get(pool).map(|state| state.total_bytes)
    }

    pub fn volume_count(&self) -> usize {
        self.volumes.lock().len()
    }

    pub fn prepared_pool_count(&self) -> usize {
        self.prepared_pools.lock().len()
    }

    fn release_volumes(&self, rsc_name: &ResourceName) -> usize {
        let mut volumes = self.volumes.lock();
        let mut pools = self.pools.lock();
        let keys: Vec<(ResourceName, u32)> = volumes
            .keys()
            .filter(|(name, _)| name == rsc_name)
            .cloned()
            .collect();
        for key in &keys {
            if let Some((pool, size)) = volumes.remove(key) {
                if let Some(state) = pools.get_mut(&pool) {
                    state.free_bytes = (state.free_bytes + size).min(state.total_bytes);
                }
            }
        }
        keys.len()
    }
}

#[async_trait]
impl DeviceLayer for StorageLayer {
    fn kind(&self) -> DeviceLayerKind {
        DeviceLayerKind::Storage
    }

    async fn prepare(&self, resources: &[&LayerResource], _snapshots: &[Snapshot]) -> Result<()> {
        let pools = self.pools.lock();
        let mut prepared = self.prepared_pools.lock();
        for lrsc in resources {
            for vlm in lrsc.resource.volumes.values() {
                if !pools.contains_key(&vlm.stor_pool) {
                    return Err(Error::Storage(
                        LayerFailure::new(format!(
                            "Storage pool '{}' not found on this node",
                            vlm.stor_pool
                        ))
                        .with_correction("Create the storage pool or move the volume to an existing pool"),
                    ));
                }
                prepared.insert(vlm.stor_pool.clone());
            }
        }
        Ok(())
    }

    async fn process(&self, ctx: &mut ProcessContext<'_>, id: LayerRscId) -> Result<()> {
        let lrsc = ctx.resource(id)?;
        let rsc_name = lrsc.rsc_name();

        if lrsc.resource.is_deleted() {
            let released = self.release_volumes(rsc_name);
            ctx.add_entry(RcEntry::new(
                codes::MASK_RSC | codes::DELETED,
                format!("Deleted {} volume(s) of '{}'", released, rsc_name),
            ));
            return Ok(());
        }
        if lrsc.resource.is_diskless() {
            return Ok(());
        }

        for vlm in lrsc.resource.volumes.values() {
            let key = (rsc_name.clone(), vlm.vlm_nr);
            let mut volumes = self.volumes.lock();
            if volumes.contains_key(&key) {
                continue;
            }
            let mut pools = self.pools.lock();
            let state = pools.get_mut(&vlm.stor_pool).ok_or_else(|| {
                Error::VolumeLayer(LayerFailure::new(format!(
                    "Storage pool '{}' disappeared",
                    vlm.stor_pool
                )))
            })?;
            if state.free_bytes < vlm.size_bytes {
                return Err(Error::Storage(
                    LayerFailure::new(format!(
                        "Not enough free space in storage pool '{}' for volume {} of '{}'",
                        vlm.stor_pool, vlm.vlm_nr, rsc_name
                    ))
                    .with_cause(format!(
                        "{} bytes requested, {} bytes free",
                        vlm.size_bytes, state.free_bytes
                    ))
                    .with_details(format!("Pool capacity: {} bytes", state.total_bytes)),
                ));
            }
            state.free_bytes -= vlm.size_bytes;
            volumes.insert(key, (vlm.stor_pool.clone(), vlm.size_bytes));
            info!(rsc = %rsc_name, vlm_nr = vlm.vlm_nr, pool = %vlm.stor_pool, "Volume created");
        }
        ctx.add_entry(RcEntry::new(
            codes::MASK_RSC | codes::MODIFIED,
            format!("Volumes of '{}' ready", rsc_name),
        ));
        Ok(())
    }

    async fn clear_cache(&self) -> Result<()> {
        self.prepared_pools.lock().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::satellite::{LayerArena, LayerRegistry};
    use crate::domain::{NodeName, Resource, Volume};
    use std::sync::Arc;

    fn pool() -> StorPoolName {
        StorPoolName::new("pool1").unwrap()
    }

    fn resource(name: &str, stack: Vec<DeviceLayerKind>, size: u64) -> Resource {
        let mut rsc = Resource::new(
            ResourceName::new(name).unwrap(),
            NodeName::new("alpha").unwrap(),
            stack,
        );
        rsc.volumes.insert(0, Volume::new(0, pool(), size));
        rsc
    }

    fn registry(storage: Arc<StorageLayer>, luks: Arc<LuksLayer>) -> LayerRegistry {
        LayerRegistry::new()
            .with(Arc::new(DrbdLayer::new()))
            .with(luks)
            .with(storage)
    }

    fn arena_of(rsc: &Resource) -> (LayerArena, LayerRscId) {
        let mut arena = LayerArena::new();
        let mut parent = None;
        for kind in &rsc.layer_stack {
            parent = Some(arena.insert(*kind, rsc, parent).unwrap());
        }
        let root = arena.roots().next().unwrap().id;
        (arena, root)
    }

    #[tokio::test]
    async fn test_storage_allocates_and_releases() {
        let storage = Arc::new(StorageLayer::new([(pool(), 100)]));
        let reg = registry(storage.clone(), Arc::new(LuksLayer::new()));
        let mut rsc = resource("r0", vec![DeviceLayerKind::Drbd, DeviceLayerKind::Storage], 60);

        let (arena, root) = arena_of(&rsc);
        let mut ctx = ProcessContext::new(&arena, &reg);
        reg.get(DeviceLayerKind::Drbd).unwrap().process(&mut ctx, root).await.unwrap();
        assert_eq!(storage.free_bytes(&pool()), Some(40));
        assert_eq!(ctx.into_responses().len(), 2);

        rsc.mark_deleted();
        let (arena, root) = arena_of(&rsc);
        let mut ctx = ProcessContext::new(&arena, &reg);
        reg.get(DeviceLayerKind::Drbd).unwrap().process(&mut ctx, root).await.unwrap();
        assert_eq!(storage.free_bytes(&pool()), Some(100));
        assert_eq!(storage.volume_count(), 0);
    }

    #[tokio::test]
    async fn test_storage_out_of_space() {
        let storage = Arc::new(StorageLayer::new([(pool(), 10)]));
        let reg = registry(storage.clone(), Arc::new(LuksLayer::new()));
        let rsc = resource("r0", vec![DeviceLayerKind::Storage], 60);

        let (arena, root) = arena_of(&rsc);
        let mut ctx = ProcessContext::new(&arena, &reg);
        let err = storage.process(&mut ctx, root).await.unwrap_err();
        assert!(matches!(err, Error::Storage(ref f) if f.cause.is_some()));
        assert_eq!(err.to_rc_entry().return_code, codes::FAIL_STOR_LAYER);
    }

    #[tokio::test]
    async fn test_storage_prepare_unknown_pool() {
        let storage = StorageLayer::new([(StorPoolName::new("other").unwrap(), 10)]);
        let rsc = resource("r0", vec![DeviceLayerKind::Storage], 1);
        let (arena, root) = arena_of(&rsc);
        let lrsc = arena.get(root).unwrap();
        assert!(storage.prepare(&[lrsc], &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_luks_requires_master_key() {
        let storage = Arc::new(StorageLayer::new([(pool(), 100)]));
        let luks = Arc::new(LuksLayer::new());
        let reg = registry(storage, luks.clone());
        let rsc = resource("r0", vec![DeviceLayerKind::Luks, DeviceLayerKind::Storage], 1);
        let (arena, root) = arena_of(&rsc);

        let mut ctx = ProcessContext::new(&arena, &reg);
        let err = luks.process(&mut ctx, root).await.unwrap_err();
        assert_eq!(err.to_rc_entry().return_code, codes::FAIL_RSC_LAYER);

        luks.set_master_key(b"secret".to_vec());
        let mut ctx = ProcessContext::new(&arena, &reg);
        luks.process(&mut ctx, root).await.unwrap();
        assert!(luks.is_open(&rsc.rsc_name));
    }

    #[tokio::test]
    async fn test_drbd_minors_and_diskless() {
        let storage = Arc::new(StorageLayer::new([(pool(), 100)]));
        let drbd = Arc::new(DrbdLayer::new());
        let reg = LayerRegistry::new().with(drbd.clone()).with(storage.clone());

        let r0 = resource("r0", vec![DeviceLayerKind::Drbd, DeviceLayerKind::Storage], 10);
        let mut r1 = resource("r1", vec![DeviceLayerKind::Drbd, DeviceLayerKind::Storage], 10);
        r1.flags.insert(crate::domain::ResourceFlags::DRBD_DISKLESS);

        for rsc in [&r0, &r1] {
            let (arena, root) = arena_of(rsc);
            let mut ctx = ProcessContext::new(&arena, &reg);
            drbd.process(&mut ctx, root).await.unwrap();
        }
        assert_eq!(drbd.minor(&r0.rsc_name), Some(DRBD_MINOR_START));
        assert_eq!(drbd.minor(&r1.rsc_name), Some(DRBD_MINOR_START + 1));
        // diskless resources never reach the storage layer
        assert_eq!(storage.free_bytes(&pool()), Some(90));
    }
}
