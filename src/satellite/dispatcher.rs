//! Device Layer Dispatcher
//!
//! Realizes a batch of resources on this node. The batch is expanded into
//! layer resources and grouped by layer kind. Every layer is prepared
//! before any root resource is processed. Cleanup runs for every prepared
//! layer, and each root resource's outcome is delivered exactly once.
//!
//! Failures stay as local as possible:
//! - a failed prepare only blocks the roots containing that layer
//! - a failed process call only affects its own root
//! - a failed cleanup is reported for that layer's resources
//!
//! Access control and persistence errors are defects at this point and
//! abort the whole dispatch.

use super::expander::LayerExpander;
use super::layer::{LayerArena, LayerResource, LayerRscId, ProcessContext};
use super::registry::LayerRegistry;
use crate::domain::api_rc::codes;
use crate::domain::{
    ApiCallRc, DeviceLayerKind, RcEntry, Resource, ResourceName, ResponseSink, Snapshot,
};
use crate::error::{Error, Result};
use crate::metrics::DispatchMetrics;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Summary of one dispatch
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// Outcome per resource, as delivered to the sink
    pub results: BTreeMap<ResourceName, ApiCallRc>,
    /// Root resources that received a process call
    pub processed: Vec<ResourceName>,
    pub failed_prepare: Vec<DeviceLayerKind>,
    pub failed_cleanup: Vec<DeviceLayerKind>,
}

impl DispatchReport {
    pub fn has_failures(&self, rsc_name: &ResourceName) -> bool {
        self.results
            .get(rsc_name)
            .is_some_and(|rc| rc.has_errors())
    }
}

/// Layer resource ids grouped by kind, in a stable order
type LayerGroups = BTreeMap<DeviceLayerKind, Vec<LayerRscId>>;

fn group_by_kind(arena: &LayerArena) -> LayerGroups {
    let mut groups = LayerGroups::new();
    for lrsc in arena.iter() {
        groups.entry(lrsc.kind).or_default().push(lrsc.id);
    }
    groups
}

fn group_resources<'a>(arena: &'a LayerArena, ids: &[LayerRscId]) -> Vec<&'a LayerResource> {
    ids.iter().filter_map(|id| arena.get(*id)).collect()
}

fn group_snapshots(resources: &[&LayerResource]) -> Vec<Snapshot> {
    let mut seen = BTreeSet::new();
    resources
        .iter()
        .flat_map(|lrsc| lrsc.snapshots.iter())
        .filter(|snap| seen.insert((snap.rsc_name.clone(), snap.name.clone())))
        .cloned()
        .collect()
}

fn layer_entry(code: u64, message: String, rsc_name: &ResourceName, err: &Error) -> RcEntry {
    RcEntry::new(code, message)
        .with_cause(Some(err.to_string()))
        .with_obj_ref("RscDfn", rsc_name.display_value())
}

pub struct DeviceDispatcher {
    registry: Arc<LayerRegistry>,
    expander: Arc<dyn LayerExpander>,
    full_sync_applied: AtomicBool,
    metrics: Arc<DispatchMetrics>,
}

impl DeviceDispatcher {
    pub fn new(
        registry: Arc<LayerRegistry>,
        expander: Arc<dyn LayerExpander>,
        metrics: Arc<DispatchMetrics>,
    ) -> Self {
        Self {
            registry,
            expander,
            full_sync_applied: AtomicBool::new(false),
            metrics,
        }
    }

    pub fn registry(&self) -> &LayerRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<DispatchMetrics> {
        &self.metrics
    }

    pub fn set_full_sync_applied(&self) {
        if !self.full_sync_applied.swap(true, Ordering::AcqRel) {
            info!("Full sync applied");
        }
    }

    pub fn is_full_sync_applied(&self) -> bool {
        self.full_sync_applied.load(Ordering::Acquire)
    }

    /// Realize `resources` and `snapshots` and notify `sink` once per
    /// resource.
    pub async fn dispatch(
        &self,
        resources: &[Resource],
        snapshots: &[Snapshot],
        sink: &dyn ResponseSink,
    ) -> Result<DispatchReport> {
        self.metrics.record_batch();
        let expansion = self
            .expander
            .expand(resources, snapshots, self.is_full_sync_applied());
        let arena = &expansion.arena;
        let groups = group_by_kind(arena);
        let mut report = DispatchReport::default();

        let mut results: BTreeMap<ResourceName, ApiCallRc> = BTreeMap::new();
        for (rsc_name, entry) in &expansion.failures {
            results.entry(rsc_name.clone()).or_default().add_entry(entry.clone());
        }

        // Prepare every layer before anything is processed
        let mut prepared: Vec<DeviceLayerKind> = Vec::new();
        let mut fatal: Option<Error> = None;
        let mut blocked: BTreeSet<LayerRscId> = BTreeSet::new();
        for (kind, ids) in &groups {
            let members = group_resources(arena, ids);
            let outcome = match self.registry.get(*kind) {
                Some(layer) => layer.prepare(&members, &group_snapshots(&members)).await,
                None => Err(Error::LayerStack(format!(
                    "no device layer registered for {}",
                    kind
                ))),
            };
            match outcome {
                Ok(()) => prepared.push(*kind),
                Err(err) if err.is_implementation_error() => {
                    fatal = Some(err);
                    break;
                }
                Err(err) => {
                    warn!(layer = %kind, error = %err, "Layer prepare failed");
                    self.metrics.record_prepare_failure();
                    report.failed_prepare.push(*kind);
                    let code = if matches!(err, Error::LayerStack(_)) {
                        codes::FAIL_INVLD_LAYER_STACK
                    } else {
                        codes::FAIL_LAYER_PREPARE
                    };
                    for lrsc in &members {
                        results.entry(lrsc.rsc_name().clone()).or_default().add_entry(layer_entry(
                            code,
                            format!("Preparing layer {} failed for resource '{}'", kind, lrsc.rsc_name()),
                            lrsc.rsc_name(),
                            &err,
                        ));
                        blocked.insert(arena.root_of(lrsc.id)?);
                    }
                }
            }
        }

        // Process every root whose layers all prepared
        let roots: Vec<LayerRscId> = expansion.root_ids();
        let runnable: Vec<&LayerResource> = if fatal.is_some() {
            Vec::new()
        } else {
            roots
                .iter()
                .filter(|id| !blocked.contains(id))
                .filter_map(|id| arena.get(*id))
                .collect()
        };
        debug!(
            roots = roots.len(),
            runnable = runnable.len(),
            layers = groups.len(),
            "Processing resources"
        );

        let registry = &*self.registry;
        let outcomes = join_all(runnable.iter().map(|root| async move {
            let mut ctx = ProcessContext::new(arena, registry);
            let outcome = match registry.get(root.kind) {
                Some(layer) => layer.process(&mut ctx, root.id).await,
                None => Err(Error::LayerStack(format!(
                    "no device layer registered for {}",
                    root.kind
                ))),
            };
            (*root, outcome, ctx.into_responses())
        }))
        .await;

        for (root, outcome, responses) in outcomes {
            let rsc_name = root.rsc_name().clone();
            report.processed.push(rsc_name.clone());
            let rc = results.entry(rsc_name.clone()).or_default();
            rc.add_entries(responses);
            match outcome {
                Ok(()) => {
                    self.metrics.record_processed(false);
                    rc.add_entry(
                        RcEntry::new(
                            codes::MASK_RSC | codes::MODIFIED,
                            format!("Resource '{}' applied", rsc_name),
                        )
                        .with_obj_ref("RscDfn", rsc_name.display_value()),
                    );
                }
                Err(err) if err.is_implementation_error() => {
                    error!(rsc = %rsc_name, error = %err, "Implementation error while processing resource");
                    fatal.get_or_insert(err);
                }
                Err(err) => {
                    warn!(rsc = %rsc_name, error = %err, "Processing resource failed");
                    self.metrics.record_processed(true);
                    rc.add_entry(
                        err.to_rc_entry()
                            .with_obj_ref("RscDfn", rsc_name.display_value()),
                    );
                }
            }
        }

        // Clear the cache of every prepared layer exactly once
        for kind in &prepared {
            let Some(layer) = self.registry.get(*kind) else {
                continue;
            };
            match layer.clear_cache().await {
                Ok(()) => {}
                Err(err) if err.is_implementation_error() => {
                    fatal.get_or_insert(err);
                }
                Err(err) => {
                    warn!(layer = %kind, error = %err, "Layer cleanup failed");
                    self.metrics.record_cleanup_failure();
                    report.failed_cleanup.push(*kind);
                    let ids = groups.get(kind).map(Vec::as_slice).unwrap_or_default();
                    for lrsc in group_resources(arena, ids) {
                        results.entry(lrsc.rsc_name().clone()).or_default().add_entry(layer_entry(
                            codes::FAIL_LAYER_CLEANUP,
                            format!("Cleaning up layer {} failed for resource '{}'", kind, lrsc.rsc_name()),
                            lrsc.rsc_name(),
                            &err,
                        ));
                    }
                }
            }
        }

        self.expander.release(&expansion);
        if let Some(err) = fatal {
            return Err(self.fatal(err));
        }

        for (rsc_name, rc) in &results {
            sink.notify_resource_applied(rsc_name, rc.clone());
        }

        report.results = results;
        info!(
            resources = report.results.len(),
            processed = report.processed.len(),
            failed_layers = report.failed_prepare.len(),
            "Dispatch finished"
        );
        Ok(report)
    }

    fn fatal(&self, err: Error) -> Error {
        error!(error = %err, "Dispatch aborted by an implementation error");
        self.metrics.record_fatal();
        err
    }
}

/// Sink collecting the per-resource responses of a dispatch
#[derive(Debug, Default)]
pub struct CollectingSink {
    responses: Mutex<BTreeMap<ResourceName, ApiCallRc>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, rsc_name: &ResourceName) -> Option<ApiCallRc> {
        self.responses.lock().get(rsc_name).cloned()
    }

    pub fn len(&self) -> usize {
        self.responses.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.responses.lock().is_empty()
    }

    /// All responses, ordered by resource name
    pub fn into_combined(self) -> ApiCallRc {
        let mut combined = ApiCallRc::new();
        for (_, rc) in self.responses.into_inner() {
            combined.add_entries(rc);
        }
        combined
    }
}

impl ResponseSink for CollectingSink {
    fn notify_resource_applied(&self, rsc_name: &ResourceName, responses: ApiCallRc) {
        self.responses
            .lock()
            .entry(rsc_name.clone())
            .or_default()
            .add_entries(responses);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NodeName, ResourceFlags, SnapshotName, StorPoolName, Volume};
    use crate::error::LayerFailure;
    use crate::satellite::expander::StackExpander;
    use crate::satellite::layer::DeviceLayer;
    use crate::satellite::layers::StorageLayer;
    use async_trait::async_trait;
    use assert_matches::assert_matches;

    /// Records calls and fails on demand
    #[derive(Default)]
    struct ScriptedLayer {
        kind: Option<DeviceLayerKind>,
        fail_prepare: bool,
        fail_cleanup: bool,
        fatal_prepare: bool,
        fatal_process: bool,
        /// Resources whose process call raises a storage failure
        fail_process: Vec<String>,
        prepared: Mutex<Vec<(usize, usize)>>,
        processed: Mutex<Vec<String>>,
        cleared: Mutex<usize>,
    }

    impl ScriptedLayer {
        fn new(kind: DeviceLayerKind) -> Self {
            Self {
                kind: Some(kind),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl DeviceLayer for ScriptedLayer {
        fn kind(&self) -> DeviceLayerKind {
            self.kind.unwrap_or(DeviceLayerKind::Storage)
        }

        async fn prepare(&self, resources: &[&LayerResource], snapshots: &[Snapshot]) -> Result<()> {
            self.prepared.lock().push((resources.len(), snapshots.len()));
            if self.fatal_prepare {
                return Err(Error::Database("connection lost".to_string()));
            }
            if self.fail_prepare {
                return Err(Error::Storage(LayerFailure::new("volume group missing")));
            }
            Ok(())
        }

        async fn process(&self, ctx: &mut ProcessContext<'_>, id: LayerRscId) -> Result<()> {
            let name = ctx.resource(id)?.rsc_name().display_value().to_string();
            self.processed.lock().push(name.clone());
            if self.fatal_process {
                return Err(Error::access_denied("reading resource", codes::FAIL_ACC_DENIED_RSC));
            }
            if self.fail_process.contains(&name) {
                return Err(Error::Storage(
                    LayerFailure::new("lvcreate failed")
                        .with_cause("device busy")
                        .with_correction("retry later"),
                ));
            }
            ctx.process_children(id).await
        }

        async fn clear_cache(&self) -> Result<()> {
            *self.cleared.lock() += 1;
            if self.fail_cleanup {
                return Err(Error::Storage(LayerFailure::new("cache flush failed")));
            }
            Ok(())
        }
    }

    fn rsc(name: &str, stack: Vec<DeviceLayerKind>) -> Resource {
        Resource::new(
            ResourceName::new(name).unwrap(),
            NodeName::new("alpha").unwrap(),
            stack,
        )
    }

    fn rsc_name(name: &str) -> ResourceName {
        ResourceName::new(name).unwrap()
    }

    fn dispatcher(layers: Vec<Arc<ScriptedLayer>>) -> DeviceDispatcher {
        let mut registry = LayerRegistry::new();
        for layer in layers {
            registry.register(layer);
        }
        DeviceDispatcher::new(
            Arc::new(registry),
            Arc::new(StackExpander::new()),
            Arc::new(DispatchMetrics::new()),
        )
    }

    #[tokio::test]
    async fn test_all_layers_succeed() {
        let drbd = Arc::new(ScriptedLayer::new(DeviceLayerKind::Drbd));
        let storage = Arc::new(ScriptedLayer::new(DeviceLayerKind::Storage));
        let dispatcher = dispatcher(vec![drbd.clone(), storage.clone()]);
        let sink = CollectingSink::new();

        let r0 = rsc("r0", vec![DeviceLayerKind::Drbd, DeviceLayerKind::Storage]);
        let snap = Snapshot::new(SnapshotName::new("snap1").unwrap(), r0.rsc_name.clone(), r0.node_name.clone());
        let report = dispatcher
            .dispatch(&[r0, rsc("r1", vec![DeviceLayerKind::Storage])], &[snap], &sink)
            .await
            .unwrap();

        assert_eq!(report.processed.len(), 2);
        assert_eq!(*drbd.prepared.lock(), vec![(1, 1)]);
        assert_eq!(*storage.prepared.lock(), vec![(2, 1)]);
        // r0 reaches storage through drbd, r1 is a storage root
        assert_eq!(storage.processed.lock().len(), 2);
        assert_eq!(*drbd.cleared.lock(), 1);
        assert_eq!(*storage.cleared.lock(), 1);
        assert_eq!(sink.len(), 2);
        assert!(!sink.get(&rsc_name("r0")).unwrap().has_errors());
    }

    #[tokio::test]
    async fn test_prepare_failure_isolated_to_layer() {
        let drbd = Arc::new(ScriptedLayer::new(DeviceLayerKind::Drbd));
        let luks = Arc::new(ScriptedLayer {
            fail_prepare: true,
            ..ScriptedLayer::new(DeviceLayerKind::Luks)
        });
        let storage = Arc::new(ScriptedLayer::new(DeviceLayerKind::Storage));
        let dispatcher = dispatcher(vec![drbd.clone(), luks.clone(), storage.clone()]);
        let sink = CollectingSink::new();

        let encrypted = rsc("enc", vec![DeviceLayerKind::Drbd, DeviceLayerKind::Luks, DeviceLayerKind::Storage]);
        let plain = rsc("plain", vec![DeviceLayerKind::Drbd, DeviceLayerKind::Storage]);
        let report = dispatcher.dispatch(&[encrypted, plain], &[], &sink).await.unwrap();

        assert_eq!(report.failed_prepare, vec![DeviceLayerKind::Luks]);
        assert_eq!(report.processed, vec![rsc_name("plain")]);
        assert_eq!(*drbd.processed.lock(), vec!["plain".to_string()]);
        assert!(luks.processed.lock().is_empty());

        let failed = sink.get(&rsc_name("enc")).unwrap();
        assert!(failed.iter().any(|e| e.return_code == codes::FAIL_LAYER_PREPARE));
        assert!(!sink.get(&rsc_name("plain")).unwrap().has_errors());

        // only prepared layers are cleaned up
        assert_eq!(*drbd.cleared.lock(), 1);
        assert_eq!(*luks.cleared.lock(), 0);
        assert_eq!(*storage.cleared.lock(), 1);
        assert_eq!(dispatcher.metrics().snapshot().prepare_failures, 1);
    }

    #[tokio::test]
    async fn test_process_failure_isolated_to_resource() {
        let storage = Arc::new(ScriptedLayer {
            fail_process: vec!["bad".to_string()],
            ..ScriptedLayer::new(DeviceLayerKind::Storage)
        });
        let dispatcher = dispatcher(vec![storage.clone()]);
        let sink = CollectingSink::new();

        let report = dispatcher
            .dispatch(
                &[
                    rsc("bad", vec![DeviceLayerKind::Storage]),
                    rsc("good", vec![DeviceLayerKind::Storage]),
                ],
                &[],
                &sink,
            )
            .await
            .unwrap();

        assert_eq!(report.processed.len(), 2);
        let bad = sink.get(&rsc_name("bad")).unwrap();
        let entry = bad.iter().find(|e| e.is_error()).unwrap();
        assert_eq!(entry.return_code, codes::FAIL_STOR_LAYER);
        assert_eq!(entry.cause.as_deref(), Some("device busy"));
        assert_eq!(entry.correction.as_deref(), Some("retry later"));
        assert!(!sink.get(&rsc_name("good")).unwrap().has_errors());
        assert_eq!(*storage.cleared.lock(), 1);

        let snap = dispatcher.metrics().snapshot();
        assert_eq!(snap.resources_processed, 2);
        assert_eq!(snap.resource_failures, 1);
    }

    #[tokio::test]
    async fn test_cleanup_failure_reported() {
        let drbd = Arc::new(ScriptedLayer {
            fail_cleanup: true,
            ..ScriptedLayer::new(DeviceLayerKind::Drbd)
        });
        let storage = Arc::new(ScriptedLayer::new(DeviceLayerKind::Storage));
        let dispatcher = dispatcher(vec![drbd, storage.clone()]);
        let sink = CollectingSink::new();

        let report = dispatcher
            .dispatch(
                &[
                    rsc("r0", vec![DeviceLayerKind::Drbd, DeviceLayerKind::Storage]),
                    rsc("r1", vec![DeviceLayerKind::Storage]),
                ],
                &[],
                &sink,
            )
            .await
            .unwrap();

        assert_eq!(report.failed_cleanup, vec![DeviceLayerKind::Drbd]);
        assert!(report.has_failures(&rsc_name("r0")));
        assert!(!report.has_failures(&rsc_name("r1")));
        assert_eq!(*storage.cleared.lock(), 1);
    }

    #[tokio::test]
    async fn test_access_denied_is_fatal() {
        let storage = Arc::new(ScriptedLayer {
            fatal_process: true,
            ..ScriptedLayer::new(DeviceLayerKind::Storage)
        });
        let dispatcher = dispatcher(vec![storage.clone()]);
        let sink = CollectingSink::new();

        let result = dispatcher
            .dispatch(&[rsc("r0", vec![DeviceLayerKind::Storage])], &[], &sink)
            .await;
        assert_matches!(result, Err(Error::AccessDenied { .. }));
        assert!(sink.is_empty());
        assert_eq!(*storage.cleared.lock(), 1);
        assert_eq!(dispatcher.metrics().snapshot().fatal_errors, 1);
    }

    #[tokio::test]
    async fn test_fatal_prepare_still_cleans_up() {
        let drbd = Arc::new(ScriptedLayer::new(DeviceLayerKind::Drbd));
        let storage = Arc::new(ScriptedLayer {
            fatal_prepare: true,
            ..ScriptedLayer::new(DeviceLayerKind::Storage)
        });
        let dispatcher = dispatcher(vec![drbd.clone(), storage.clone()]);
        let sink = CollectingSink::new();

        let result = dispatcher
            .dispatch(
                &[rsc("r0", vec![DeviceLayerKind::Drbd, DeviceLayerKind::Storage])],
                &[],
                &sink,
            )
            .await;
        assert_matches!(result, Err(Error::Database(_)));
        assert!(drbd.processed.lock().is_empty());
        assert_eq!(*drbd.cleared.lock(), 1);
        assert_eq!(*storage.cleared.lock(), 0);
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_fatal_dispatch_releases_deleted_stacks() {
        let storage = Arc::new(ScriptedLayer {
            fatal_process: true,
            ..ScriptedLayer::new(DeviceLayerKind::Storage)
        });
        let mut registry = LayerRegistry::new();
        registry.register(storage);
        let expander = Arc::new(StackExpander::new());
        let dispatcher = DeviceDispatcher::new(
            Arc::new(registry),
            expander.clone(),
            Arc::new(DispatchMetrics::new()),
        );

        let mut r0 = rsc("r0", vec![DeviceLayerKind::Storage]);
        r0.mark_deleted();
        let result = dispatcher.dispatch(&[r0], &[], &CollectingSink::new()).await;

        assert_matches!(result, Err(Error::AccessDenied { .. }));
        assert_eq!(expander.known_stack(&rsc_name("r0")), None);
    }

    #[tokio::test]
    async fn test_unregistered_layer_and_invalid_stack() {
        let storage = Arc::new(ScriptedLayer::new(DeviceLayerKind::Storage));
        let dispatcher = dispatcher(vec![storage]);
        let sink = CollectingSink::new();

        dispatcher
            .dispatch(
                &[
                    rsc("nvme", vec![DeviceLayerKind::Nvme, DeviceLayerKind::Storage]),
                    rsc("broken", vec![DeviceLayerKind::Drbd]),
                    rsc("fine", vec![DeviceLayerKind::Storage]),
                ],
                &[],
                &sink,
            )
            .await
            .unwrap();

        let nvme = sink.get(&rsc_name("nvme")).unwrap();
        assert!(nvme.iter().any(|e| e.return_code == codes::FAIL_INVLD_LAYER_STACK));
        let broken = sink.get(&rsc_name("broken")).unwrap();
        assert!(broken.iter().any(|e| e.return_code == codes::FAIL_INVLD_LAYER_STACK));
        assert!(!sink.get(&rsc_name("fine")).unwrap().has_errors());
    }

    #[tokio::test]
    async fn test_full_sync_gates_legacy_resources() {
        let storage = Arc::new(ScriptedLayer::new(DeviceLayerKind::Storage));
        let drbd = Arc::new(ScriptedLayer::new(DeviceLayerKind::Drbd));
        let dispatcher = dispatcher(vec![drbd, storage]);

        let sink = CollectingSink::new();
        dispatcher.dispatch(&[rsc("old", vec![])], &[], &sink).await.unwrap();
        assert!(!sink.get(&rsc_name("old")).unwrap().has_errors());

        dispatcher.set_full_sync_applied();
        assert!(dispatcher.is_full_sync_applied());
        let sink = CollectingSink::new();
        dispatcher.dispatch(&[rsc("new", vec![])], &[], &sink).await.unwrap();
        assert!(sink.get(&rsc_name("new")).unwrap().has_errors());
    }

    #[tokio::test]
    async fn test_with_storage_layer() {
        let pool = StorPoolName::new("pool1").unwrap();
        let storage = Arc::new(StorageLayer::new([(pool.clone(), 100)]));
        let registry = LayerRegistry::new().with(storage.clone());
        let dispatcher = DeviceDispatcher::new(
            Arc::new(registry),
            Arc::new(StackExpander::new()),
            Arc::new(DispatchMetrics::new()),
        );

        let mut r0 = rsc("r0", vec![DeviceLayerKind::Storage]);
        r0.volumes.insert(0, Volume::new(0, pool.clone(), 30));
        let mut r1 = rsc("r1", vec![DeviceLayerKind::Storage]);
        r1.volumes.insert(0, Volume::new(0, pool.clone(), 90));

        let sink = CollectingSink::new();
        dispatcher.dispatch(&[r0.clone(), r1], &[], &sink).await.unwrap();
        assert_eq!(sink.len(), 2);
        // roots are processed in batch order
        assert!(!sink.get(&rsc_name("r0")).unwrap().has_errors());
        assert!(sink.get(&rsc_name("r1")).unwrap().has_errors());
        assert_eq!(storage.free_bytes(&pool), Some(70));
        assert_eq!(storage.prepared_pool_count(), 0);

        r0.flags.insert(ResourceFlags::DELETE);
        let sink = CollectingSink::new();
        dispatcher.dispatch(&[r0], &[], &sink).await.unwrap();
        assert_eq!(storage.free_bytes(&pool), Some(100));
    }
}
