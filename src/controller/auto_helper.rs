//! Reconcile Scheduler
//!
//! Runs every registered [`AutoHelper`] once per resource definition and
//! cycle. Helpers append their side effects to an [`AutoHelperContext`];
//! the scheduler drives the collected pipelines after all helpers ran.
//!
//! All helper invocations and tracking updates happen under one
//! process-wide mutex, so helpers may keep plain mutable state.

use super::auto_replace::ReplicaReconciler;
use super::core_objects::CoreObjects;
use crate::domain::{
    ApiCallRc, ConnectionStatus, NodeFlags, NodeName, Pipeline, ResourceName,
};
use crate::error::Result;
use crate::metrics::ReconcileMetrics;
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Result of one helper invocation on one resource definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManageOutcome {
    /// The definition is not queued for this helper
    NotTracked,
    /// No connected diskful replica exists; waits for operator action
    NeedsDiskful,
    /// Target reached, tracking released
    Converged,
    /// No progress this cycle, stays queued
    RetryLater(String),
    /// Replacement pipelines were appended to the context
    Scheduled,
}

/// Per definition state shared by all helpers of one cycle
pub struct AutoHelperContext {
    pub rsc_name: ResourceName,
    pub responses: ApiCallRc,
    /// Side effects to run once all helpers are done
    pub additional_pipelines: Vec<Pipeline>,
}

impl AutoHelperContext {
    pub fn new(rsc_name: ResourceName) -> Self {
        Self {
            rsc_name,
            responses: ApiCallRc::new(),
            additional_pipelines: Vec::new(),
        }
    }
}

#[async_trait]
pub trait AutoHelper: Send + Sync {
    fn name(&self) -> &'static str;

    async fn manage(&self, ctx: &mut AutoHelperContext) -> Result<ManageOutcome>;
}

pub type AutoHelperRef = Arc<dyn AutoHelper>;

/// Cluster topology changes the scheduler reacts to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TopologyEvent {
    NodeEvicted { node: NodeName },
    NodeRestored { node: NodeName },
    NodeConnectionChanged { node: NodeName, status: ConnectionStatus },
}

impl TopologyEvent {
    pub fn node(&self) -> &NodeName {
        match self {
            TopologyEvent::NodeEvicted { node }
            | TopologyEvent::NodeRestored { node }
            | TopologyEvent::NodeConnectionChanged { node, .. } => node,
        }
    }
}

/// Outcome of one scheduler cycle
#[derive(Debug, Default)]
pub struct CycleReport {
    pub outcomes: BTreeMap<ResourceName, Vec<ManageOutcome>>,
    pub responses: ApiCallRc,
    pub pipelines_run: usize,
    pub pipeline_failures: usize,
}

impl CycleReport {
    pub fn outcome(&self, rsc_name: &ResourceName) -> Option<&ManageOutcome> {
        self.outcomes.get(rsc_name).and_then(|outcomes| outcomes.first())
    }
}

/// Periodic and event driven runner of the auto helpers
pub struct ReconcileScheduler {
    core: Arc<CoreObjects>,
    reconciler: Arc<ReplicaReconciler>,
    helpers: Vec<AutoHelperRef>,
    run_lock: Mutex<()>,
    events: broadcast::Sender<TopologyEvent>,
    interval: Duration,
    metrics: Arc<ReconcileMetrics>,
}

impl ReconcileScheduler {
    pub fn new(
        core: Arc<CoreObjects>,
        reconciler: Arc<ReplicaReconciler>,
        interval: Duration,
        event_capacity: usize,
        metrics: Arc<ReconcileMetrics>,
    ) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        let helpers: Vec<AutoHelperRef> = vec![reconciler.clone()];
        Self {
            core,
            reconciler,
            helpers,
            run_lock: Mutex::new(()),
            events,
            interval,
            metrics,
        }
    }

    pub fn with_helper(mut self, helper: AutoHelperRef) -> Self {
        self.helpers.push(helper);
        self
    }

    pub fn reconciler(&self) -> &Arc<ReplicaReconciler> {
        &self.reconciler
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TopologyEvent> {
        self.events.subscribe()
    }

    /// Publish a topology event; returns the number of receivers
    pub fn publish(&self, event: TopologyEvent) -> usize {
        debug!(?event, "Publishing topology event");
        self.events.send(event).unwrap_or(0)
    }

    // =========================================================================
    // Topology Operations
    // =========================================================================

    /// Flag a node EVICTED and announce it
    pub async fn evict_node(&self, node: &NodeName) -> Result<()> {
        self.core
            .update_node_flags(node, NodeFlags::EVICTED, NodeFlags::empty())
            .await?;
        info!(node = %node, "Node evicted");
        self.publish(TopologyEvent::NodeEvicted { node: node.clone() });
        Ok(())
    }

    pub async fn restore_node(&self, node: &NodeName) -> Result<()> {
        self.core
            .update_node_flags(node, NodeFlags::empty(), NodeFlags::EVICTED)
            .await?;
        info!(node = %node, "Node restored");
        self.publish(TopologyEvent::NodeRestored { node: node.clone() });
        Ok(())
    }

    pub async fn set_connection_status(&self, node: &NodeName, status: ConnectionStatus) -> Result<()> {
        self.core.set_connection_status(node, status).await?;
        self.publish(TopologyEvent::NodeConnectionChanged {
            node: node.clone(),
            status,
        });
        Ok(())
    }

    /// Queue every resource definition with a resource on the event's node
    pub async fn handle_event(&self, event: &TopologyEvent) -> usize {
        let _guard = self.run_lock.lock().await;
        let node = event.node();
        let dfns = self.core.read_rsc_dfns().await;
        let mut marked = 0;
        for rsc in dfns.values().filter_map(|dfn| dfn.resource(node)) {
            self.reconciler.mark_needs_reconciliation(rsc);
            marked += 1;
        }
        debug!(node = %node, marked, "Handled topology event");
        marked
    }

    // =========================================================================
    // Cycle
    // =========================================================================

    /// Run all helpers on every resource definition, then drive the
    /// collected pipelines.
    pub async fn run_cycle(&self) -> CycleReport {
        let _guard = self.run_lock.lock().await;
        let mut report = CycleReport::default();

        let names: Vec<ResourceName> = self.core.read_rsc_dfns().await.keys().cloned().collect();
        let mut pipelines: Vec<(ResourceName, Pipeline)> = Vec::new();

        for rsc_name in names {
            let mut ctx = AutoHelperContext::new(rsc_name.clone());
            let mut outcomes = Vec::with_capacity(self.helpers.len());
            for helper in &self.helpers {
                match helper.manage(&mut ctx).await {
                    Ok(outcome) => outcomes.push(outcome),
                    Err(err) if err.is_retryable() => {
                        warn!(
                            helper = helper.name(),
                            rsc = %rsc_name,
                            error = %err,
                            action = ?err.action(),
                            "Auto helper failed, retrying next cycle"
                        );
                        report.responses.add_entry(
                            err.to_rc_entry().with_obj_ref("RscDfn", rsc_name.display_value()),
                        );
                    }
                    Err(err) => {
                        error!(helper = helper.name(), rsc = %rsc_name, error = %err, "Auto helper failed");
                        report.responses.add_entry(
                            err.to_rc_entry().with_obj_ref("RscDfn", rsc_name.display_value()),
                        );
                    }
                }
            }
            report.responses.add_entries(ctx.responses);
            pipelines.extend(
                ctx.additional_pipelines
                    .into_iter()
                    .map(|pipeline| (rsc_name.clone(), pipeline)),
            );
            report.outcomes.insert(rsc_name, outcomes);
        }

        report.pipelines_run = pipelines.len();
        let (names, futures): (Vec<_>, Vec<_>) = pipelines.into_iter().unzip();
        for (rsc_name, result) in names.into_iter().zip(join_all(futures).await) {
            match result {
                Ok(rc) => report.responses.add_entries(rc),
                Err(err) => {
                    warn!(
                        rsc = %rsc_name,
                        error = %err,
                        action = ?err.action(),
                        "Reconcile pipeline failed, retrying next cycle"
                    );
                    report.pipeline_failures += 1;
                    report.responses.add_entry(
                        err.to_rc_entry().with_obj_ref("RscDfn", rsc_name.display_value()),
                    );
                }
            }
        }

        self.metrics.record_cycle();
        report
    }

    async fn run_cycle_logged(&self) {
        let report = self.run_cycle().await;
        if report.pipelines_run > 0 || report.responses.has_errors() {
            info!(
                definitions = report.outcomes.len(),
                pipelines = report.pipelines_run,
                failures = report.pipeline_failures,
                "Reconcile cycle finished"
            );
        }
    }

    /// Run cycles on the interval and on topology events until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut events = self.subscribe();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval = ?self.interval, "Reconcile scheduler started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Reconcile scheduler stopping");
                    break;
                }
                _ = ticker.tick() => {
                    self.run_cycle_logged().await;
                }
                event = events.recv() => match event {
                    Ok(event) => {
                        self.handle_event(&event).await;
                        self.run_cycle_logged().await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Topology events lagged, requeueing all nodes");
                        let nodes: Vec<NodeName> =
                            self.core.node_map.read().await.keys().cloned().collect();
                        for node in nodes {
                            self.handle_event(&TopologyEvent::NodeRestored { node }).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::autoplacer::CapacityAutoplacer;
    use crate::controller::resource_creator::CtrlResourceCreator;
    use crate::domain::{
        DeviceLayerKind, Node, NodeFilter, NodeResponse, PermissiveAccessControl, ProviderKind,
        Resource, ResourceDefinition, ResourceGroup, ResourceGroupName, SatelliteUpdater,
        StorPool, StorPoolName,
    };
    use crate::persistence::MemoryDbEngine;
    use futures::stream::{self, BoxStream, StreamExt};

    struct AckUpdater;

    #[async_trait]
    impl SatelliteUpdater for AckUpdater {
        async fn update_satellites(
            &self,
            rsc_dfn: &ResourceDefinition,
            node_filter: NodeFilter,
        ) -> Result<BoxStream<'static, NodeResponse>> {
            let responses: Vec<NodeResponse> = rsc_dfn
                .resources
                .keys()
                .filter(|node| node_filter(node))
                .map(|node| NodeResponse {
                    node_name: node.clone(),
                    result: Ok(ApiCallRc::new()),
                })
                .collect();
            Ok(stream::iter(responses).boxed())
        }
    }

    fn node(s: &str) -> NodeName {
        NodeName::new(s).unwrap()
    }

    async fn scheduler() -> Arc<ReconcileScheduler> {
        let core = Arc::new(CoreObjects::new(Arc::new(MemoryDbEngine::new())));
        for name in ["alpha", "bravo", "charlie"] {
            let mut n = Node::new(node(name));
            n.connection_status = ConnectionStatus::Connected;
            core.create_node(n).await.unwrap();
            core.create_stor_pool(StorPool::new(
                StorPoolName::new("pool1").unwrap(),
                node(name),
                ProviderKind::Lvm,
                1 << 30,
            ))
            .await
            .unwrap();
        }
        let grp_name = ResourceGroupName::new("dflt").unwrap();
        core.create_resource_group(ResourceGroup::new(grp_name.clone()))
            .await
            .unwrap();
        let rsc_name = ResourceName::new("r0").unwrap();
        let mut dfn = ResourceDefinition::new(rsc_name.clone(), grp_name);
        for name in ["alpha", "bravo"] {
            dfn.add_resource(Resource::new(
                rsc_name.clone(),
                node(name),
                vec![DeviceLayerKind::Drbd, DeviceLayerKind::Storage],
            ))
            .unwrap();
        }
        core.create_resource_definition(dfn).await.unwrap();

        let updater = Arc::new(AckUpdater);
        let metrics = Arc::new(ReconcileMetrics::new());
        let reconciler = Arc::new(ReplicaReconciler::new(
            core.clone(),
            Arc::new(PermissiveAccessControl),
            Arc::new(CapacityAutoplacer::new(core.clone())),
            Arc::new(CtrlResourceCreator::new(core.clone(), updater.clone())),
            updater,
            metrics.clone(),
        ));
        Arc::new(ReconcileScheduler::new(
            core,
            reconciler,
            Duration::from_secs(3600),
            16,
            metrics,
        ))
    }

    #[tokio::test]
    async fn test_event_marks_hosted_definitions() {
        let scheduler = scheduler().await;
        let rsc_name = ResourceName::new("r0").unwrap();

        let marked = scheduler
            .handle_event(&TopologyEvent::NodeRestored { node: node("charlie") })
            .await;
        assert_eq!(marked, 0);
        assert!(!scheduler.reconciler().is_tracked(&rsc_name));

        let marked = scheduler
            .handle_event(&TopologyEvent::NodeEvicted { node: node("bravo") })
            .await;
        assert_eq!(marked, 1);
        assert!(scheduler.reconciler().is_tracked(&rsc_name));
    }

    #[tokio::test]
    async fn test_cycle_replaces_evicted_replica() {
        let scheduler = scheduler().await;
        let rsc_name = ResourceName::new("r0").unwrap();
        let mut events = scheduler.subscribe();

        scheduler.evict_node(&node("bravo")).await.unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event, TopologyEvent::NodeEvicted { node: node("bravo") });
        scheduler.handle_event(&event).await;

        let report = scheduler.run_cycle().await;
        assert_eq!(report.outcome(&rsc_name), Some(&ManageOutcome::Scheduled));
        assert_eq!(report.pipelines_run, 1);
        assert_eq!(report.pipeline_failures, 0);
        assert!(report
            .responses
            .iter()
            .any(|e| e.message == "Resource r0 was evicted from bravo"));
        assert!(!scheduler.reconciler().is_tracked(&rsc_name));

        let report = scheduler.run_cycle().await;
        assert_eq!(report.outcome(&rsc_name), Some(&ManageOutcome::NotTracked));
        assert_eq!(report.pipelines_run, 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let scheduler = scheduler().await;
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(scheduler.clone().run(cancel.clone()));
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_event_serialization() {
        let event = TopologyEvent::NodeConnectionChanged {
            node: node("alpha"),
            status: ConnectionStatus::Connected,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"nodeConnectionChanged\""));
        let back: TopologyEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
