//! Layer stack expansion
//!
//! Turns the resources of a dispatch batch into layer resources. Resources
//! without an explicit layer stack are legacy data; they are only accepted
//! until the first full sync with the controller has been applied.

use super::layer::{LayerArena, LayerRscId};
use crate::domain::{DeviceLayerKind, RcEntry, Resource, ResourceName, Snapshot};
use crate::error::{Error, Result};
use dashmap::DashMap;
use std::collections::HashSet;
use tracing::{debug, warn};

/// Default stack of legacy resources
pub const LEGACY_LAYER_STACK: [DeviceLayerKind; 2] = [DeviceLayerKind::Drbd, DeviceLayerKind::Storage];

/// Layer resources of one dispatch batch
#[derive(Debug, Default)]
pub struct Expansion {
    pub arena: LayerArena,
    /// Resources that could not be expanded
    pub failures: Vec<(ResourceName, RcEntry)>,
}

impl Expansion {
    pub fn root_ids(&self) -> Vec<LayerRscId> {
        self.arena.roots().map(|rsc| rsc.id).collect()
    }
}

pub trait LayerExpander: Send + Sync {
    fn expand(&self, resources: &[Resource], snapshots: &[Snapshot], full_sync_applied: bool) -> Expansion;

    /// Release bookkeeping of the batch once its results were delivered
    fn release(&self, expansion: &Expansion);
}

/// Validate a layer stack: non-empty, no duplicates, storage last only
pub fn validate_layer_stack(stack: &[DeviceLayerKind]) -> Result<()> {
    let Some(last) = stack.last() else {
        return Err(Error::LayerStack("empty layer stack".to_string()));
    };
    if *last != DeviceLayerKind::Storage {
        return Err(Error::LayerStack(format!(
            "layer stack must end with {}, found {}",
            DeviceLayerKind::Storage,
            last
        )));
    }
    let mut seen = HashSet::new();
    for kind in stack {
        if !seen.insert(*kind) {
            return Err(Error::LayerStack(format!("layer {} used twice", kind)));
        }
    }
    Ok(())
}

/// Expander building one parent chain per resource from its layer stack
#[derive(Debug)]
pub struct StackExpander {
    /// Last stack materialized per resource
    known_stacks: DashMap<ResourceName, Vec<DeviceLayerKind>>,
    legacy_stack: Vec<DeviceLayerKind>,
}

impl Default for StackExpander {
    fn default() -> Self {
        Self::new()
    }
}

impl StackExpander {
    pub fn new() -> Self {
        Self {
            known_stacks: DashMap::new(),
            legacy_stack: LEGACY_LAYER_STACK.to_vec(),
        }
    }

    /// Use `stack` for resources without layer data
    pub fn with_legacy_stack(mut self, stack: Vec<DeviceLayerKind>) -> Self {
        self.legacy_stack = stack;
        self
    }

    pub fn known_stack(&self, rsc_name: &ResourceName) -> Option<Vec<DeviceLayerKind>> {
        self.known_stacks.get(rsc_name).map(|entry| entry.value().clone())
    }

    fn stack_of(&self, rsc: &Resource, full_sync_applied: bool) -> Result<Vec<DeviceLayerKind>> {
        if !rsc.layer_stack.is_empty() {
            return Ok(rsc.layer_stack.clone());
        }
        if let Some(known) = self.known_stack(&rsc.rsc_name) {
            return Ok(known);
        }
        if full_sync_applied {
            return Err(Error::LayerStack(format!(
                "resource '{}' has no layer data",
                rsc.rsc_name
            )));
        }
        debug!(rsc = %rsc.rsc_name, "Using legacy layer stack");
        Ok(self.legacy_stack.clone())
    }

    fn expand_one(&self, arena: &mut LayerArena, rsc: &Resource, stack: &[DeviceLayerKind]) -> Result<()> {
        validate_layer_stack(stack)?;
        let mut parent = None;
        for kind in stack {
            parent = Some(arena.insert(*kind, rsc, parent)?);
        }
        Ok(())
    }
}

impl LayerExpander for StackExpander {
    fn expand(&self, resources: &[Resource], snapshots: &[Snapshot], full_sync_applied: bool) -> Expansion {
        let mut expansion = Expansion::default();

        for rsc in resources {
            let result = self
                .stack_of(rsc, full_sync_applied)
                .and_then(|stack| {
                    self.expand_one(&mut expansion.arena, rsc, &stack)?;
                    Ok(stack)
                });
            match result {
                Ok(stack) => {
                    self.known_stacks.insert(rsc.rsc_name.clone(), stack);
                }
                Err(err) => {
                    warn!(rsc = %rsc.rsc_name, error = %err, "Failed to expand resource");
                    let entry = err
                        .to_rc_entry()
                        .with_obj_ref("RscDfn", rsc.rsc_name.display_value());
                    expansion.failures.push((rsc.rsc_name.clone(), entry));
                }
            }
        }

        let ids: Vec<LayerRscId> = expansion.arena.iter().map(|lrsc| lrsc.id).collect();
        for id in ids {
            if let Some(lrsc) = expansion.arena.get_mut(id) {
                lrsc.snapshots = snapshots
                    .iter()
                    .filter(|snap| snap.rsc_name == lrsc.resource.rsc_name)
                    .cloned()
                    .collect();
            }
        }
        expansion
    }

    fn release(&self, expansion: &Expansion) {
        for root in expansion.arena.roots() {
            if root.resource.is_deleted() {
                self.known_stacks.remove(root.rsc_name());
            }
        }
        for (rsc_name, _) in &expansion.failures {
            self.known_stacks.remove(rsc_name);
        }
    }
}
