//! Device layer registry

use super::layer::DeviceLayerRef;
use crate::domain::DeviceLayerKind;
use std::collections::BTreeMap;

/// Maps each layer kind to its handler
#[derive(Default, Clone)]
pub struct LayerRegistry {
    layers: BTreeMap<DeviceLayerKind, DeviceLayerRef>,
}

impl LayerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `layer`, replacing any handler of the same kind
    pub fn register(&mut self, layer: DeviceLayerRef) -> Option<DeviceLayerRef> {
        self.layers.insert(layer.kind(), layer)
    }

    pub fn with(mut self, layer: DeviceLayerRef) -> Self {
        self.register(layer);
        self
    }

    pub fn get(&self, kind: DeviceLayerKind) -> Option<DeviceLayerRef> {
        self.layers.get(&kind).cloned()
    }

    pub fn contains(&self, kind: DeviceLayerKind) -> bool {
        self.layers.contains_key(&kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = DeviceLayerKind> + '_ {
        self.layers.keys().copied()
    }
}

impl std::fmt::Debug for LayerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerRegistry")
            .field("layers", &self.layers.keys().collect::<Vec<_>>())
            .finish()
    }
}
