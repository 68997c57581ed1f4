//! Satellite side: layer expansion, device layers and the dispatcher

pub mod dispatcher;
pub mod expander;
pub mod layer;
pub mod layers;
pub mod registry;
pub mod service;

pub use dispatcher::{CollectingSink, DeviceDispatcher, DispatchReport};
pub use expander::{validate_layer_stack, Expansion, LayerExpander, StackExpander, LEGACY_LAYER_STACK};
pub use layer::{DeviceLayer, DeviceLayerRef, LayerArena, LayerResource, LayerRscId, ProcessContext};
pub use layers::{DrbdLayer, LuksLayer, StorageLayer};
pub use registry::LayerRegistry;
pub use service::SatelliteService;
