//! Capacity Autoplacer
//!
//! Default placement: filter storage pools by node eligibility and the
//! selection filter, then spread the requested replicas across distinct
//! nodes, preferring the pools with the most free space.

use super::core_objects::CoreObjects;
use crate::domain::{
    AutoSelectFilter, Autoplacer, Node, NodeFlags, NodeName, Props, ResourceDefinition,
    ResourceName, StorPool, DEFAULT_REPLICA_COUNT,
};
use crate::error::Result;
use async_trait::async_trait;
use regex::Regex;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::debug;

// =============================================================================
// Placement Candidate
// =============================================================================

/// A storage pool eligible for a new replica
#[derive(Debug, Clone)]
pub struct PlacementCandidate {
    pub pool: StorPool,
    /// Properties of the pool's node
    pub node_props: Props,
}

impl PlacementCandidate {
    fn node_name(&self) -> &NodeName {
        &self.pool.node_name
    }

    fn node_prop(&self, key: &str) -> Option<&str> {
        self.node_props.get(key, None)
    }
}

// =============================================================================
// Placement Engine
// =============================================================================

/// Selection over prepared candidates
pub struct PlacementEngine;

impl PlacementEngine {
    /// Select `count` candidates on distinct nodes.
    ///
    /// `same_values` fixes node property values every selected node must
    /// share; `taken_values` holds values already used for the keys that
    /// must differ. Returns `None` if fewer than `count` candidates fit.
    pub fn select(
        candidates: &[PlacementCandidate],
        count: usize,
        replicas_on_same: &[String],
        replicas_on_different: &[String],
        mut same_values: BTreeMap<String, String>,
        mut taken_values: BTreeMap<String, HashSet<String>>,
    ) -> Option<Vec<PlacementCandidate>> {
        if count == 0 {
            return Some(Vec::new());
        }

        // Best pool per node
        let mut best_per_node: BTreeMap<&NodeName, &PlacementCandidate> = BTreeMap::new();
        for candidate in candidates {
            best_per_node
                .entry(candidate.node_name())
                .and_modify(|best| {
                    if candidate.pool.free_capacity_bytes > best.pool.free_capacity_bytes {
                        *best = candidate;
                    }
                })
                .or_insert(candidate);
        }

        // Most free space first, node name breaks ties
        let mut sorted: Vec<&PlacementCandidate> = best_per_node.into_values().collect();
        sorted.sort_by(|a, b| {
            b.pool
                .free_capacity_bytes
                .cmp(&a.pool.free_capacity_bytes)
                .then_with(|| a.node_name().cmp(b.node_name()))
        });

        let mut selected = Vec::with_capacity(count);
        for candidate in sorted {
            if selected.len() >= count {
                break;
            }

            let same_ok = replicas_on_same.iter().all(|key| {
                match (same_values.get(key), candidate.node_prop(key)) {
                    (Some(expected), Some(actual)) => expected == actual,
                    (Some(_), None) => false,
                    (None, _) => true,
                }
            });
            let different_ok = replicas_on_different.iter().all(|key| {
                candidate
                    .node_prop(key)
                    .map_or(true, |value| !taken_values.get(key).is_some_and(|t| t.contains(value)))
            });
            if !(same_ok && different_ok) {
                continue;
            }

            for key in replicas_on_same {
                if let Some(value) = candidate.node_prop(key) {
                    same_values.entry(key.clone()).or_insert_with(|| value.to_string());
                }
            }
            for key in replicas_on_different {
                if let Some(value) = candidate.node_prop(key) {
                    taken_values.entry(key.clone()).or_default().insert(value.to_string());
                }
            }
            selected.push(candidate.clone());
        }

        (selected.len() >= count).then_some(selected)
    }
}

// =============================================================================
// Capacity Autoplacer
// =============================================================================

pub struct CapacityAutoplacer {
    core: Arc<CoreObjects>,
}

impl CapacityAutoplacer {
    pub fn new(core: Arc<CoreObjects>) -> Self {
        Self { core }
    }

    fn node_eligible(node: &Node, filter: &AutoSelectFilter) -> bool {
        node.is_connected()
            && !node.flags.intersects(NodeFlags::EVICTED | NodeFlags::DELETE | NodeFlags::EVACUATE)
            && (filter.node_name_list.is_empty() || filter.node_name_list.contains(&node.name))
    }

    fn pool_eligible(pool: &StorPool, filter: &AutoSelectFilter, required_size_bytes: u64) -> bool {
        !pool.is_diskless()
            && pool.free_capacity_bytes >= required_size_bytes
            && (filter.stor_pool_name_list.is_empty()
                || filter.stor_pool_name_list.contains(&pool.name))
            && (filter.provider_list.is_empty() || filter.provider_list.contains(&pool.provider))
    }

    /// Nodes excluded by the definition itself and by do-not-place-with
    fn excluded_nodes(
        filter: &AutoSelectFilter,
        rsc_dfn: &ResourceDefinition,
        rsc_dfns: &BTreeMap<ResourceName, ResourceDefinition>,
    ) -> Result<HashSet<NodeName>> {
        let mut excluded: HashSet<NodeName> = rsc_dfn.resources.keys().cloned().collect();

        let regex = filter
            .do_not_place_with_rsc_regex
            .as_deref()
            .map(Regex::new)
            .transpose()?;

        for other in rsc_dfns.values() {
            let listed = filter.do_not_place_with_rsc_list.contains(&other.name);
            let matched = regex
                .as_ref()
                .is_some_and(|re| re.is_match(other.name.display_value()));
            if listed || matched {
                excluded.extend(
                    other
                        .resources()
                        .filter(|rsc| !rsc.is_deleted())
                        .map(|rsc| rsc.node_name.clone()),
                );
            }
        }
        Ok(excluded)
    }
}

#[async_trait]
impl Autoplacer for CapacityAutoplacer {
    async fn select_placement(
        &self,
        filter: &AutoSelectFilter,
        rsc_dfn: &ResourceDefinition,
        rsc_dfns: &BTreeMap<ResourceName, ResourceDefinition>,
        required_size_bytes: u64,
    ) -> Result<Option<Vec<StorPool>>> {
        let count = filter.place_count.unwrap_or(DEFAULT_REPLICA_COUNT) as usize;
        let excluded = Self::excluded_nodes(filter, rsc_dfn, rsc_dfns)?;

        let nodes = self.core.node_map.read().await;
        let pools = self.core.stor_pool_map.read().await;

        let candidates: Vec<PlacementCandidate> = pools
            .values()
            .filter(|pool| !excluded.contains(&pool.node_name))
            .filter(|pool| Self::pool_eligible(pool, filter, required_size_bytes))
            .filter_map(|pool| {
                let node = nodes.get(&pool.node_name)?;
                Self::node_eligible(node, filter).then(|| PlacementCandidate {
                    pool: pool.clone(),
                    node_props: node.props.clone(),
                })
            })
            .collect();

        // Values fixed or taken by the replicas that stay
        let mut same_values = BTreeMap::new();
        let mut taken_values: BTreeMap<String, HashSet<String>> = BTreeMap::new();
        for rsc in rsc_dfn.resources().filter(|rsc| !rsc.is_deleted() && !rsc.is_diskless()) {
            let Some(node) = nodes.get(&rsc.node_name) else {
                continue;
            };
            if node.is_evicted() {
                continue;
            }
            for key in &filter.replicas_on_same_list {
                if let Some(value) = node.props.get(key, None) {
                    same_values.entry(key.clone()).or_insert_with(|| value.to_string());
                }
            }
            for key in &filter.replicas_on_different_list {
                if let Some(value) = node.props.get(key, None) {
                    taken_values.entry(key.clone()).or_default().insert(value.to_string());
                }
            }
        }

        debug!(
            rsc = %rsc_dfn.name,
            count,
            required_size_bytes,
            candidates = candidates.len(),
            "Selecting storage pools"
        );

        let selection = PlacementEngine::select(
            &candidates,
            count,
            &filter.replicas_on_same_list,
            &filter.replicas_on_different_list,
            same_values,
            taken_values,
        );
        Ok(selection.map(|selected| selected.into_iter().map(|c| c.pool).collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        ConnectionStatus, DeviceLayerKind, ProviderKind, Resource, ResourceGroupName, StorPoolName,
    };
    use crate::persistence::MemoryDbEngine;

    fn name(s: &str) -> NodeName {
        NodeName::new(s).unwrap()
    }

    fn candidate(node: &str, pool: &str, free: u64, site: Option<&str>) -> PlacementCandidate {
        let mut sp = StorPool::new(StorPoolName::new(pool).unwrap(), name(node), ProviderKind::Lvm, free);
        sp.free_capacity_bytes = free;
        let mut node_props = Props::new();
        if let Some(site) = site {
            node_props.set("Site", Some("Aux"), site);
        }
        PlacementCandidate { pool: sp, node_props }
    }

    #[test]
    fn test_select_spreads_by_free_space() {
        let candidates = vec![
            candidate("alpha", "p1", 100, None),
            candidate("alpha", "p2", 500, None),
            candidate("bravo", "p1", 300, None),
            candidate("charlie", "p1", 200, None),
        ];
        let selected =
            PlacementEngine::select(&candidates, 2, &[], &[], BTreeMap::new(), BTreeMap::new())
                .unwrap();
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].pool.node_name, name("alpha"));
        assert_eq!(selected[0].pool.name, StorPoolName::new("p2").unwrap());
        assert_eq!(selected[1].pool.node_name, name("bravo"));

        assert!(
            PlacementEngine::select(&candidates, 4, &[], &[], BTreeMap::new(), BTreeMap::new())
                .is_none()
        );
    }

    #[test]
    fn test_select_replicas_on_different() {
        let candidates = vec![
            candidate("alpha", "p1", 500, Some("a")),
            candidate("bravo", "p1", 400, Some("a")),
            candidate("charlie", "p1", 300, Some("b")),
        ];
        let key = vec!["Aux/Site".to_string()];
        let selected =
            PlacementEngine::select(&candidates, 2, &[], &key, BTreeMap::new(), BTreeMap::new())
                .unwrap();
        let nodes: Vec<_> = selected.iter().map(|c| c.pool.node_name.clone()).collect();
        assert_eq!(nodes, vec![name("alpha"), name("charlie")]);

        let selected =
            PlacementEngine::select(&candidates, 2, &key, &[], BTreeMap::new(), BTreeMap::new())
                .unwrap();
        let nodes: Vec<_> = selected.iter().map(|c| c.pool.node_name.clone()).collect();
        assert_eq!(nodes, vec![name("alpha"), name("bravo")]);
    }

    async fn core_with_nodes(nodes: &[(&str, bool, u64)]) -> Arc<CoreObjects> {
        let core = Arc::new(CoreObjects::new(Arc::new(MemoryDbEngine::new())));
        for (node, connected, free) in nodes {
            let mut n = Node::new(name(node));
            if *connected {
                n.connection_status = ConnectionStatus::Authenticated;
            }
            core.create_node(n).await.unwrap();
            core.create_stor_pool(StorPool::new(
                StorPoolName::new("pool1").unwrap(),
                name(node),
                ProviderKind::LvmThin,
                *free,
            ))
            .await
            .unwrap();
        }
        core
    }

    fn dfn(rsc: &str, nodes: &[&str]) -> ResourceDefinition {
        let rsc_name = ResourceName::new(rsc).unwrap();
        let mut dfn = ResourceDefinition::new(rsc_name.clone(), ResourceGroupName::new("dflt").unwrap());
        for node in nodes {
            dfn.add_resource(Resource::new(rsc_name.clone(), name(node), vec![DeviceLayerKind::Drbd]))
                .unwrap();
        }
        dfn
    }

    #[tokio::test]
    async fn test_autoplace_excludes_hosting_and_disconnected() {
        let core = core_with_nodes(&[
            ("alpha", true, 1000),
            ("bravo", true, 900),
            ("charlie", false, 800),
            ("delta", true, 50),
            ("echo", true, 700),
        ])
        .await;
        let r0 = dfn("r0", &["alpha"]);
        let dfns = BTreeMap::from([(r0.name.clone(), r0.clone())]);

        let placer = CapacityAutoplacer::new(core);
        let filter = AutoSelectFilter::default().with_place_count(2);
        let pools = placer
            .select_placement(&filter, &r0, &dfns, 100)
            .await
            .unwrap()
            .unwrap();
        let nodes: Vec<_> = pools.iter().map(|p| p.node_name.clone()).collect();
        assert_eq!(nodes, vec![name("bravo"), name("echo")]);

        let filter = AutoSelectFilter::default().with_place_count(3);
        assert!(placer
            .select_placement(&filter, &r0, &dfns, 100)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_autoplace_do_not_place_with() {
        let core = core_with_nodes(&[("alpha", true, 1000), ("bravo", true, 900), ("charlie", true, 800)])
            .await;
        let r0 = dfn("r0", &[]);
        let other = dfn("backup0", &["alpha"]);
        let dfns = BTreeMap::from([
            (r0.name.clone(), r0.clone()),
            (other.name.clone(), other.clone()),
        ]);

        let placer = CapacityAutoplacer::new(core);
        let filter = AutoSelectFilter {
            place_count: Some(2),
            do_not_place_with_rsc_regex: Some("^backup.*".into()),
            ..Default::default()
        };
        let pools = placer
            .select_placement(&filter, &r0, &dfns, 100)
            .await
            .unwrap()
            .unwrap();
        assert!(pools.iter().all(|p| p.node_name != name("alpha")));

        let bad = AutoSelectFilter {
            do_not_place_with_rsc_regex: Some("([".into()),
            ..Default::default()
        };
        assert!(placer.select_placement(&bad, &r0, &dfns, 100).await.is_err());
    }
}
