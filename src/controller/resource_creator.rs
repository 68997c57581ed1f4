//! Resource creation on autoplaced storage pools

use super::core_objects::{persist_resource, CoreObjects};
use super::satellite_sync::combine_responses;
use crate::domain::api_rc::codes;
use crate::domain::{
    all_nodes, ApiCallRc, AutoplaceRequest, CreatedResources, DeviceLayerKind, NodeName, Pipeline,
    RcEntry, Resource, ResourceCreator, ResourceFlags, SatelliteUpdaterRef, Volume,
};
use crate::error::{Error, Result};
use crate::persistence::Transaction;
use async_trait::async_trait;
use futures::FutureExt;
use std::sync::Arc;
use tracing::info;

/// Every stack ends with the storage layer
fn complete_layer_stack(requested: &[DeviceLayerKind]) -> Vec<DeviceLayerKind> {
    let mut stack: Vec<DeviceLayerKind> = requested
        .iter()
        .copied()
        .filter(|kind| *kind != DeviceLayerKind::Storage)
        .collect();
    stack.push(DeviceLayerKind::Storage);
    stack
}

pub struct CtrlResourceCreator {
    core: Arc<CoreObjects>,
    updater: SatelliteUpdaterRef,
}

impl CtrlResourceCreator {
    pub fn new(core: Arc<CoreObjects>, updater: SatelliteUpdaterRef) -> Self {
        Self { core, updater }
    }
}

#[async_trait]
impl ResourceCreator for CtrlResourceCreator {
    async fn create_resources(
        &self,
        request: AutoplaceRequest<'_>,
        tx: &mut Transaction,
        responses: &mut ApiCallRc,
    ) -> Result<CreatedResources> {
        let AutoplaceRequest {
            context,
            rsc_dfn,
            candidate_pools,
            diskless_on_remaining,
            layer_stack,
        } = request;

        let layer_stack = complete_layer_stack(if layer_stack.is_empty() {
            &rsc_dfn.layer_stack
        } else {
            layer_stack
        });
        let nodes = self.core.node_map.read().await;
        let mut created_on: Vec<NodeName> = Vec::new();

        for pool in candidate_pools {
            let node = nodes.get(&pool.node_name).ok_or_else(|| {
                Error::api_rc(RcEntry::new(
                    codes::FAIL_NOT_FOUND_NODE,
                    format!("Node '{}' not found", pool.node_name),
                ))
            })?;
            if node.is_evicted() {
                return Err(Error::api_rc(
                    RcEntry::new(
                        codes::FAIL_NOT_ENOUGH_NODES,
                        format!("Node '{}' is evicted", node.name),
                    )
                    .with_correction(Some("Restore the node before placing resources on it")),
                ));
            }

            let mut rsc = Resource::new(rsc_dfn.name.clone(), node.name.clone(), layer_stack.clone());
            for vlm_dfn in rsc_dfn.volume_definitions.values() {
                rsc.volumes.insert(
                    vlm_dfn.vlm_nr,
                    Volume::new(vlm_dfn.vlm_nr, pool.name.clone(), vlm_dfn.size_bytes),
                );
            }
            persist_resource(tx, &rsc)?;
            rsc_dfn.add_resource(rsc)?;

            responses.add_entry(context.success(
                codes::CREATED,
                format!(
                    "Resource '{}' successfully autoplaced on node '{}'",
                    rsc_dfn.name, node.name
                ),
            ));
            created_on.push(node.name.clone());
        }

        if diskless_on_remaining {
            for node in nodes.values() {
                if rsc_dfn.resources.contains_key(&node.name) || !node.is_connected() || node.is_evicted() {
                    continue;
                }
                let mut rsc = Resource::new(rsc_dfn.name.clone(), node.name.clone(), layer_stack.clone());
                rsc.flags.insert(ResourceFlags::DRBD_DISKLESS);
                persist_resource(tx, &rsc)?;
                rsc_dfn.add_resource(rsc)?;

                responses.add_entry(context.success(
                    codes::CREATED,
                    format!("Diskless resource '{}' created on node '{}'", rsc_dfn.name, node.name),
                ));
                created_on.push(node.name.clone());
            }
        }

        info!(rsc = %rsc_dfn.name, nodes = ?created_on, "Created resources");

        let updater = self.updater.clone();
        let snapshot = rsc_dfn.clone();
        let created = created_on.clone();
        let activation: Pipeline = async move {
            let stream = updater.update_satellites(&snapshot, all_nodes()).await?;
            Ok(combine_responses(
                stream,
                &snapshot.name,
                &created,
                "Created resource {1} on {0}",
                "Added peer(s) to resource {1} on {0}",
            )
            .await)
        }
        .boxed();

        Ok(CreatedResources {
            pipelines: vec![activation],
            created_on,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        ApiOperation, ConnectionStatus, Node, NodeFilter, NodeResponse,
        ProviderKind, ResourceDefinition, ResourceGroupName, ResourceName, ResponseContext,
        SatelliteUpdater, StorPool, StorPoolName, VolumeDefinition, DbEngine, DbTable,
    };
    use crate::persistence::MemoryDbEngine;
    use futures::stream::{self, BoxStream, StreamExt};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingUpdater {
        pushed: Mutex<Vec<Vec<NodeName>>>,
    }

    #[async_trait]
    impl SatelliteUpdater for RecordingUpdater {
        async fn update_satellites(
            &self,
            rsc_dfn: &ResourceDefinition,
            node_filter: NodeFilter,
        ) -> Result<BoxStream<'static, NodeResponse>> {
            let nodes: Vec<NodeName> = rsc_dfn
                .resources
                .keys()
                .filter(|n| node_filter(n))
                .cloned()
                .collect();
            self.pushed.lock().push(nodes.clone());
            let responses: Vec<NodeResponse> = nodes
                .into_iter()
                .map(|node_name| NodeResponse {
                    node_name,
                    result: Ok(ApiCallRc::new()),
                })
                .collect();
            Ok(stream::iter(responses).boxed())
        }
    }

    fn name(s: &str) -> NodeName {
        NodeName::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_create_on_pools_and_diskless_remaining() {
        let db = Arc::new(MemoryDbEngine::new());
        let core = Arc::new(CoreObjects::new(db.clone()));
        for node in ["alpha", "bravo", "charlie"] {
            let mut n = Node::new(name(node));
            n.connection_status = ConnectionStatus::Connected;
            core.create_node(n).await.unwrap();
        }
        let updater = Arc::new(RecordingUpdater::default());
        let creator = CtrlResourceCreator::new(core.clone(), updater.clone());

        let rsc_name = ResourceName::new("r0").unwrap();
        let mut dfn = ResourceDefinition::new(rsc_name.clone(), ResourceGroupName::new("dflt").unwrap());
        dfn.add_volume_definition(VolumeDefinition::new(0, 1 << 20));
        let pool = StorPool::new(StorPoolName::new("pool1").unwrap(), name("alpha"), ProviderKind::Lvm, 1 << 30);
        let ctx = ResponseContext::new(
            ApiOperation::Create,
            "Auto-placing resource: r0",
            "auto-placing resource: r0",
            codes::MASK_RSC,
        );

        let mut tx = core.begin_transaction();
        let mut responses = ApiCallRc::new();
        let created = creator
            .create_resources(
                AutoplaceRequest {
                    context: &ctx,
                    rsc_dfn: &mut dfn,
                    candidate_pools: std::slice::from_ref(&pool),
                    diskless_on_remaining: true,
                    layer_stack: &[DeviceLayerKind::Drbd],
                },
                &mut tx,
                &mut responses,
            )
            .await
            .unwrap();

        assert_eq!(created.created_on, vec![name("alpha"), name("bravo"), name("charlie")]);
        assert_eq!(responses.len(), 3);
        let alpha = dfn.resource(&name("alpha")).unwrap();
        assert!(!alpha.is_diskless());
        assert_eq!(alpha.layer_stack, vec![DeviceLayerKind::Drbd, DeviceLayerKind::Storage]);
        assert_eq!(alpha.volumes[&0].stor_pool, pool.name);
        assert!(dfn.resource(&name("bravo")).unwrap().is_diskless());

        // nothing is pushed before the pipeline runs
        assert!(updater.pushed.lock().is_empty());
        tx.commit().await.unwrap();
        assert_eq!(db.load_all(DbTable::Resources).await.unwrap().len(), 3);

        for pipeline in created.pipelines {
            let rc = pipeline.await.unwrap();
            assert!(rc.iter().any(|e| e.message == "Created resource r0 on alpha"));
        }
        assert_eq!(updater.pushed.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_existing_resource_rejected() {
        let core = Arc::new(CoreObjects::new(Arc::new(MemoryDbEngine::new())));
        let mut n = Node::new(name("alpha"));
        n.connection_status = ConnectionStatus::Connected;
        core.create_node(n).await.unwrap();
        let creator = CtrlResourceCreator::new(core.clone(), Arc::new(RecordingUpdater::default()));

        let rsc_name = ResourceName::new("r0").unwrap();
        let mut dfn = ResourceDefinition::new(rsc_name.clone(), ResourceGroupName::new("dflt").unwrap());
        dfn.add_resource(Resource::new(rsc_name, name("alpha"), vec![])).unwrap();
        let pool = StorPool::new(StorPoolName::new("pool1").unwrap(), name("alpha"), ProviderKind::Lvm, 1 << 30);
        let ctx = ResponseContext::new(ApiOperation::Create, "x", "x", codes::MASK_RSC);

        let mut tx = core.begin_transaction();
        let result = creator
            .create_resources(
                AutoplaceRequest {
                    context: &ctx,
                    rsc_dfn: &mut dfn,
                    candidate_pools: std::slice::from_ref(&pool),
                    diskless_on_remaining: false,
                    layer_stack: &[],
                },
                &mut tx,
                &mut ApiCallRc::new(),
            )
            .await;
        match result {
            Err(Error::ApiRc(entry)) => assert_eq!(entry.return_code, codes::FAIL_EXISTS_RSC),
            _ => panic!("expected an api rejection"),
        }
    }
}
