//! Replica Reconciler
//!
//! Keeps the number of healthy diskful replicas of a resource definition at
//! its configured minimum. Resources on evicted nodes are tombstoned and
//! replaced on freshly autoplaced storage pools.
//!
//! Two tracking sets act as the work queue: a definition leaves them only
//! once its replacement pipeline completed, so any failed attempt is simply
//! retried on the next cycle.

use super::auto_helper::{AutoHelper, AutoHelperContext, ManageOutcome};
use super::core_objects::CoreObjects;
use super::satellite_sync::combine_responses;
use crate::domain::api_rc::codes;
use crate::domain::model::keys;
use crate::domain::{
    all_nodes, AccessContext, AccessControlRef, AccessType, ApiCallRc, ApiOperation,
    AutoSelectFilter, AutoplaceRequest, AutoplacerRef, DeviceLayerKind, Node, NodeName, ObjectKind,
    Pipeline, PriorityProps, Props, Resource, ResourceCreatorRef, ResourceDefinition,
    ResourceFlags, ResourceGroup, ResourceName, ResponseContext, SatelliteUpdaterRef,
};
use crate::error::{Error, Result};
use crate::metrics::ReconcileMetrics;
use crate::persistence::rows::columns;
use crate::persistence::Transaction;
use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct TrackingSets {
    needs_reconciliation: HashSet<ResourceName>,
    needs_diskful: HashSet<ResourceName>,
}

impl TrackingSets {
    fn release(&mut self, rsc_name: &ResourceName) {
        self.needs_reconciliation.remove(rsc_name);
        self.needs_diskful.remove(rsc_name);
    }
}

/// Replica counts of one resource definition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaCounts {
    /// Resources on connected nodes that store data locally
    pub diskful_connected: usize,
    pub place_count: u32,
    pub min_replica_count: u32,
    /// Active replicated diskful resources on non-evicted nodes
    pub cur_replica_count: u32,
}

impl ReplicaCounts {
    pub fn deficit(&self) -> u32 {
        self.min_replica_count.saturating_sub(self.cur_replica_count)
    }
}

/// Minimum replica count from the property chain, never above `place_count`
pub fn min_replica_count(props: &PriorityProps<'_>, place_count: u32) -> u32 {
    let configured = match props.get_prop(
        keys::KEY_AUTO_EVICT_MIN_REPLICA_COUNT,
        Some(keys::NAMESPC_DRBD_OPTIONS),
    ) {
        Some(value) => value.trim().parse::<u32>().unwrap_or_else(|_| {
            warn!(value, "Invalid minimum replica count, using the place count");
            place_count
        }),
        None => place_count,
    };
    configured.min(place_count)
}

fn counts_replica(rsc: &Resource, nodes: &BTreeMap<NodeName, Node>) -> bool {
    !rsc.flags.intersects(ResourceFlags::DELETE | ResourceFlags::TIE_BREAKER)
        && !rsc.is_diskless()
        && rsc.has_layer(DeviceLayerKind::Drbd)
        && nodes.get(&rsc.node_name).is_some_and(|node| !node.is_evicted())
}

/// Count the replicas of `rsc_dfn`
pub fn count_replicas(
    rsc_dfn: &ResourceDefinition,
    rsc_grp: &ResourceGroup,
    nodes: &BTreeMap<NodeName, Node>,
    ctrl_props: &Props,
) -> ReplicaCounts {
    let diskful_connected = rsc_dfn
        .resources()
        .filter(|rsc| !rsc.is_diskless())
        .filter(|rsc| nodes.get(&rsc.node_name).is_some_and(Node::is_connected))
        .count();

    let place_count = rsc_grp.replica_count();
    let prio = PriorityProps::new([&rsc_dfn.props, &rsc_grp.props, ctrl_props]);
    let min_replica_count = min_replica_count(&prio, place_count);

    let cur_replica_count = rsc_dfn
        .resources()
        .filter(|rsc| counts_replica(rsc, nodes))
        .count() as u32;

    ReplicaCounts {
        diskful_connected,
        place_count,
        min_replica_count,
        cur_replica_count,
    }
}

enum PlacementStep {
    Satisfied,
    NoCandidate,
    Created(Vec<Pipeline>, Vec<NodeName>),
}

/// Auto helper replacing replicas lost to node eviction
pub struct ReplicaReconciler {
    core: Arc<CoreObjects>,
    access: AccessControlRef,
    sys_ctx: AccessContext,
    autoplacer: AutoplacerRef,
    creator: ResourceCreatorRef,
    updater: SatelliteUpdaterRef,
    tracking: Arc<Mutex<TrackingSets>>,
    metrics: Arc<ReconcileMetrics>,
}

impl ReplicaReconciler {
    pub fn new(
        core: Arc<CoreObjects>,
        access: AccessControlRef,
        autoplacer: AutoplacerRef,
        creator: ResourceCreatorRef,
        updater: SatelliteUpdaterRef,
        metrics: Arc<ReconcileMetrics>,
    ) -> Self {
        Self {
            core,
            access,
            sys_ctx: AccessContext::system(),
            autoplacer,
            creator,
            updater,
            tracking: Arc::new(Mutex::new(TrackingSets::default())),
            metrics,
        }
    }

    /// Queue the definition owning `rsc`
    pub fn mark_needs_reconciliation(&self, rsc: &Resource) {
        if self.tracking.lock().needs_reconciliation.insert(rsc.rsc_name.clone()) {
            debug!(rsc = %rsc.rsc_name, node = %rsc.node_name, "Resource definition needs reconciliation");
        }
    }

    pub fn is_tracked(&self, rsc_name: &ResourceName) -> bool {
        self.tracking.lock().needs_reconciliation.contains(rsc_name)
    }

    pub fn needs_diskful(&self, rsc_name: &ResourceName) -> bool {
        self.tracking.lock().needs_diskful.contains(rsc_name)
    }

    pub fn tracked_count(&self) -> usize {
        self.tracking.lock().needs_reconciliation.len()
    }

    fn require_access(&self, rsc_name: &ResourceName, access: AccessType) -> Result<()> {
        self.access
            .require_access(
                &self.sys_ctx,
                ObjectKind::ResourceDefinition,
                rsc_name.display_value(),
                access,
            )
            .map_err(|_| {
                Error::access_denied(
                    format!("accessing flags or properties of resource definition '{}'", rsc_name),
                    codes::FAIL_ACC_DENIED_RSC_DFN,
                )
            })
    }

    /// Replica counts plus the placement policy of the definition's group
    async fn assess(&self, rsc_dfn: &ResourceDefinition) -> Result<(ReplicaCounts, AutoSelectFilter)> {
        self.require_access(&rsc_dfn.name, AccessType::View)?;

        let rsc_grps = self.core.rsc_grp_map.read().await;
        let rsc_grp = rsc_grps
            .get(&rsc_dfn.rsc_grp)
            .ok_or_else(|| Error::ResourceGroupNotFound {
                name: rsc_dfn.rsc_grp.to_string(),
            })?;
        let nodes = self.core.node_map.read().await;
        let ctrl_props = self.core.ctrl_props.read().await;

        let counts = count_replicas(rsc_dfn, rsc_grp, &nodes, &ctrl_props);
        Ok((counts, rsc_grp.auto_place.clone()))
    }

    fn converge(&self, rsc_name: &ResourceName) -> ManageOutcome {
        self.tracking.lock().release(rsc_name);
        self.metrics.record_converged();
        debug!(rsc = %rsc_name, "Replica count satisfied");
        ManageOutcome::Converged
    }

    /// Tombstone, select and create under the resource definition lock.
    ///
    /// All graph changes go through one transaction on a working copy of the
    /// definition; neither the tombstones nor the new resources are visible
    /// unless the creation succeeded and the transaction committed.
    async fn place_replacements(
        &self,
        rsc_name: &ResourceName,
        ctx: &mut AutoHelperContext,
    ) -> Result<(PlacementStep, Vec<NodeName>)> {
        let mut dfns = self.core.write_rsc_dfns("auto-evict resources").await;

        let Some(rsc_dfn) = dfns.get(rsc_name) else {
            return Ok((PlacementStep::Satisfied, Vec::new()));
        };
        let (counts, policy) = self.assess(rsc_dfn).await?;
        if counts.deficit() == 0 {
            return Ok((PlacementStep::Satisfied, Vec::new()));
        }
        self.require_access(rsc_name, AccessType::Change)?;

        let mut working = rsc_dfn.clone();
        let mut tx = self.core.begin_transaction();
        let evicted = self.tombstone_evicted(&mut working, &mut tx).await;

        let filter = AutoSelectFilter::default()
            .with_place_count(counts.deficit())
            .with_do_not_place_with(vec![rsc_name.clone()])
            .with_layer_stack(vec![DeviceLayerKind::Drbd])
            .merge(&policy);

        let required_size = working.total_volume_size();
        let selection = self
            .autoplacer
            .select_placement(&filter, &working, &dfns, required_size)
            .await?;
        let Some(pools) = selection else {
            return Ok((PlacementStep::NoCandidate, evicted));
        };

        let response_ctx = ResponseContext::new(
            ApiOperation::Delete,
            format!("Auto-evicting resource: {}", rsc_name),
            format!("auto-evicting resource: {}", rsc_name),
            codes::MASK_RSC,
        );
        let created = self
            .creator
            .create_resources(
                AutoplaceRequest {
                    context: &response_ctx,
                    rsc_dfn: &mut working,
                    candidate_pools: &pools,
                    diskless_on_remaining: filter.diskless_on_remaining(),
                    layer_stack: &filter.layer_stack,
                },
                &mut tx,
                &mut ctx.responses,
            )
            .await?;
        tx.commit().await?;
        dfns.insert(rsc_name.clone(), working);

        info!(rsc = %rsc_name, nodes = ?created.created_on, evicted = ?evicted, "Replaced evicted replicas");
        Ok((PlacementStep::Created(created.pipelines, created.created_on), evicted))
    }

    /// Mark every resource on an evicted node deleted in `rsc_dfn` and queue
    /// the flag updates on `tx`; returns the evicted nodes
    async fn tombstone_evicted(&self, rsc_dfn: &mut ResourceDefinition, tx: &mut Transaction) -> Vec<NodeName> {
        let evicted: Vec<NodeName> = {
            let nodes = self.core.node_map.read().await;
            rsc_dfn
                .resources()
                .filter(|rsc| nodes.get(&rsc.node_name).is_some_and(Node::is_evicted))
                .map(|rsc| rsc.node_name.clone())
                .collect()
        };

        for node in &evicted {
            if let Some(rsc) = rsc_dfn.resources.get_mut(node).filter(|rsc| !rsc.is_deleted()) {
                let flags = rsc.flags | ResourceFlags::DELETE;
                tx.update_column(&*rsc, columns::FLAGS, flags.bits().to_string());
                rsc.mark_deleted();
                debug!(rsc = %rsc.rsc_name, node = %node, "Tombstoning resource on evicted node");
            }
        }
        evicted
    }

    /// Push the tombstones to all satellites of the definition
    fn eviction_sync(&self, rsc_name: ResourceName, evicted: Vec<NodeName>) -> Pipeline {
        let core = self.core.clone();
        let updater = self.updater.clone();
        async move {
            let rsc_dfn = match core.read_rsc_dfns().await.get(&rsc_name) {
                Some(rsc_dfn) => rsc_dfn.clone(),
                None => return Ok(ApiCallRc::new()),
            };
            let evicted_list = evicted
                .iter()
                .map(|node| node.display_value())
                .collect::<Vec<_>>()
                .join(", ");
            let other_format = format!(
                "Notified {{0}} about evicting resource {{1}} from node(s) [{}]",
                evicted_list
            );
            let stream = updater.update_satellites(&rsc_dfn, all_nodes()).await?;
            Ok(combine_responses(
                stream,
                &rsc_name,
                &evicted,
                "Resource {1} was evicted from {0}",
                &other_format,
            )
            .await)
        }
        .boxed()
    }

    /// Activation first, then tombstone sync, then release the tracking
    fn chain(
        &self,
        rsc_name: ResourceName,
        activation: Vec<Pipeline>,
        eviction: Pipeline,
    ) -> Pipeline {
        let tracking = self.tracking.clone();
        async move {
            let mut combined = ApiCallRc::new();
            for result in join_all(activation).await {
                combined.add_entries(result?);
            }
            combined.add_entries(eviction.await?);
            tracking.lock().release(&rsc_name);
            debug!(rsc = %rsc_name, "Replacement pipeline completed");
            Ok(combined)
        }
        .boxed()
    }
}

#[async_trait]
impl AutoHelper for ReplicaReconciler {
    fn name(&self) -> &'static str {
        "auto-evict"
    }

    async fn manage(&self, ctx: &mut AutoHelperContext) -> Result<ManageOutcome> {
        let rsc_name = ctx.rsc_name.clone();
        if !self.is_tracked(&rsc_name) {
            return Ok(ManageOutcome::NotTracked);
        }
        self.metrics.record_manage();

        let counts = {
            let dfns = self.core.read_rsc_dfns().await;
            match dfns.get(&rsc_name) {
                Some(rsc_dfn) => self.assess(rsc_dfn).await?.0,
                None => {
                    debug!(rsc = %rsc_name, "Tracked resource definition vanished");
                    self.tracking.lock().release(&rsc_name);
                    return Ok(ManageOutcome::NotTracked);
                }
            }
        };

        if counts.diskful_connected == 0 {
            if self.tracking.lock().needs_diskful.insert(rsc_name.clone()) {
                warn!(
                    rsc = %rsc_name,
                    "Resource has no connected diskful replica, a diskful replica must be restored manually"
                );
                self.metrics.record_needs_diskful();
            }
            return Ok(ManageOutcome::NeedsDiskful);
        }
        self.tracking.lock().needs_diskful.remove(&rsc_name);

        if counts.cur_replica_count >= counts.min_replica_count {
            return Ok(self.converge(&rsc_name));
        }

        debug!(
            rsc = %rsc_name,
            place_count = counts.place_count,
            min = counts.min_replica_count,
            current = counts.cur_replica_count,
            "Replacing missing replicas"
        );

        match self.place_replacements(&rsc_name, ctx).await {
            Ok((PlacementStep::Satisfied, _)) => Ok(self.converge(&rsc_name)),
            Ok((PlacementStep::NoCandidate, _)) => {
                warn!(rsc = %rsc_name, "Not enough space on nodes to replace evicted resource");
                self.metrics.record_placement_failure();
                self.metrics.record_retry_later();
                Ok(ManageOutcome::RetryLater("no placement candidate".to_string()))
            }
            Ok((PlacementStep::Created(pipelines, _), evicted)) => {
                let eviction = self.eviction_sync(rsc_name.clone(), evicted);
                ctx.additional_pipelines
                    .push(self.chain(rsc_name, pipelines, eviction));
                self.metrics.record_scheduled();
                Ok(ManageOutcome::Scheduled)
            }
            Err(Error::ApiRc(entry)) => {
                debug!(rsc = %rsc_name, code = entry.return_code, message = %entry.message, "Placement rejected, retrying later");
                self.metrics.record_retry_later();
                Ok(ManageOutcome::RetryLater(entry.message.clone()))
            }
            Err(err) => Err(err),
        }
    }
}
