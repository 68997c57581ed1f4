//! Layer resources and the device layer port
//!
//! A resource is expanded into one [`LayerResource`] per layer of its
//! stack. Layer resources live in a [`LayerArena`] and point to their
//! parent by id; a parent must exist before its children are inserted,
//! so every parent chain ends at a root.

use super::registry::LayerRegistry;
use crate::domain::{ApiCallRc, DeviceLayerKind, RcEntry, Resource, ResourceName, Snapshot};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// Index of a layer resource inside its arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LayerRscId(usize);

impl LayerRscId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for LayerRscId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One layer of one resource
#[derive(Debug, Clone)]
pub struct LayerResource {
    pub id: LayerRscId,
    pub kind: DeviceLayerKind,
    pub resource: Resource,
    pub parent: Option<LayerRscId>,
    pub children: Vec<LayerRscId>,
    /// Snapshots of the owning resource
    pub snapshots: Vec<Snapshot>,
}

impl LayerResource {
    pub fn rsc_name(&self) -> &ResourceName {
        &self.resource.rsc_name
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

#[derive(Debug, Default)]
pub struct LayerArena {
    entries: Vec<LayerResource>,
}

impl LayerArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a layer resource below `parent`
    pub fn insert(
        &mut self,
        kind: DeviceLayerKind,
        resource: &Resource,
        parent: Option<LayerRscId>,
    ) -> Result<LayerRscId> {
        let id = LayerRscId(self.entries.len());
        if let Some(parent_id) = parent {
            let parent = self.entries.get_mut(parent_id.0).ok_or_else(|| {
                Error::ImplementationError(format!(
                    "Parent layer resource {} of {} does not exist",
                    parent_id, resource.rsc_name
                ))
            })?;
            parent.children.push(id);
        }
        self.entries.push(LayerResource {
            id,
            kind,
            resource: resource.clone(),
            parent,
            children: Vec::new(),
            snapshots: Vec::new(),
        });
        Ok(id)
    }

    pub fn get(&self, id: LayerRscId) -> Option<&LayerResource> {
        self.entries.get(id.0)
    }

    pub fn get_mut(&mut self, id: LayerRscId) -> Option<&mut LayerResource> {
        self.entries.get_mut(id.0)
    }

    /// Follow the parent chain to its root
    pub fn root_of(&self, id: LayerRscId) -> Result<LayerRscId> {
        let mut current = id;
        for _ in 0..=self.entries.len() {
            let entry = self.get(current).ok_or_else(|| {
                Error::ImplementationError(format!("Unknown layer resource {}", current))
            })?;
            match entry.parent {
                Some(parent) => current = parent,
                None => return Ok(current),
            }
        }
        Err(Error::ImplementationError(format!(
            "Parent chain of layer resource {} does not terminate",
            id
        )))
    }

    pub fn roots(&self) -> impl Iterator<Item = &LayerResource> {
        self.entries.iter().filter(|entry| entry.is_root())
    }

    pub fn iter(&self) -> impl Iterator<Item = &LayerResource> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Per root state handed through a process call chain
pub struct ProcessContext<'a> {
    arena: &'a LayerArena,
    registry: &'a LayerRegistry,
    responses: ApiCallRc,
}

impl<'a> ProcessContext<'a> {
    pub fn new(arena: &'a LayerArena, registry: &'a LayerRegistry) -> Self {
        Self {
            arena,
            registry,
            responses: ApiCallRc::new(),
        }
    }

    pub fn resource(&self, id: LayerRscId) -> Result<&'a LayerResource> {
        self.arena
            .get(id)
            .ok_or_else(|| Error::ImplementationError(format!("Unknown layer resource {}", id)))
    }

    pub fn add_entry(&mut self, entry: RcEntry) {
        self.responses.add_entry(entry);
    }

    /// Process one child with the handler of its own layer kind
    pub async fn process_child(&mut self, child: LayerRscId) -> Result<()> {
        let kind = self.resource(child)?.kind;
        let handler = self.registry.get(kind).ok_or_else(|| {
            Error::LayerStack(format!("No device layer registered for {}", kind))
        })?;
        handler.process(self, child).await
    }

    /// Process every child of `id`
    pub async fn process_children(&mut self, id: LayerRscId) -> Result<()> {
        let children = self.resource(id)?.children.clone();
        for child in children {
            self.process_child(child).await?;
        }
        Ok(())
    }

    pub fn into_responses(self) -> ApiCallRc {
        self.responses
    }
}

/// Handler of one device layer kind
#[async_trait]
pub trait DeviceLayer: Send + Sync {
    fn kind(&self) -> DeviceLayerKind;

    /// Load whatever the layer needs before any resource is processed
    async fn prepare(&self, resources: &[&LayerResource], snapshots: &[Snapshot]) -> Result<()>;

    /// Bring one layer resource to its target state. Handlers decide when
    /// and whether to descend via [`ProcessContext::process_child`].
    async fn process(&self, ctx: &mut ProcessContext<'_>, rsc: LayerRscId) -> Result<()>;

    /// Drop the state loaded by `prepare`
    async fn clear_cache(&self) -> Result<()>;
}

pub type DeviceLayerRef = Arc<dyn DeviceLayer>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NodeName;

    fn resource() -> Resource {
        Resource::new(
            ResourceName::new("r0").unwrap(),
            NodeName::new("alpha").unwrap(),
            vec![DeviceLayerKind::Drbd, DeviceLayerKind::Storage],
        )
    }

    #[test]
    fn test_parent_chain() {
        let rsc = resource();
        let mut arena = LayerArena::new();
        let drbd = arena.insert(DeviceLayerKind::Drbd, &rsc, None).unwrap();
        let luks = arena.insert(DeviceLayerKind::Luks, &rsc, Some(drbd)).unwrap();
        let storage = arena.insert(DeviceLayerKind::Storage, &rsc, Some(luks)).unwrap();

        assert_eq!(arena.root_of(storage).unwrap(), drbd);
        assert_eq!(arena.root_of(drbd).unwrap(), drbd);
        assert_eq!(arena.get(drbd).unwrap().children, vec![luks]);
        assert_eq!(arena.roots().count(), 1);
        assert_eq!(arena.len(), 3);
    }

    #[test]
    fn test_missing_parent_rejected() {
        let mut arena = LayerArena::new();
        let err = arena
            .insert(DeviceLayerKind::Storage, &resource(), Some(LayerRscId(7)))
            .unwrap_err();
        assert!(err.is_implementation_error());
        assert!(arena.is_empty());
    }
}
