//! Auto-place selection filter
//!
//! Constraints handed to the autoplacer. A resource group carries one as its
//! placement policy; callers build their own request and merge the group's
//! policy underneath it.

use super::model::{DeviceLayerKind, NodeName, ProviderKind, ResourceName, StorPoolName};
use serde::{Deserialize, Serialize};

/// Placement constraints. Unset fields impose no restriction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AutoSelectFilter {
    /// Number of diskful replicas to place
    pub place_count: Option<u32>,
    /// Only place on these nodes
    pub node_name_list: Vec<NodeName>,
    /// Only place in storage pools with these names
    pub stor_pool_name_list: Vec<StorPoolName>,
    /// Avoid nodes already hosting any of these resources
    pub do_not_place_with_rsc_list: Vec<ResourceName>,
    /// Avoid nodes hosting a resource whose name matches this pattern
    pub do_not_place_with_rsc_regex: Option<String>,
    /// Node property keys whose values must be equal across replicas
    pub replicas_on_same_list: Vec<String>,
    /// Node property keys whose values must differ across replicas
    pub replicas_on_different_list: Vec<String>,
    pub layer_stack: Vec<DeviceLayerKind>,
    pub provider_list: Vec<ProviderKind>,
    /// Create diskless resources on every remaining eligible node
    pub diskless_on_remaining: Option<bool>,
}

impl AutoSelectFilter {
    pub fn with_place_count(mut self, count: u32) -> Self {
        self.place_count = Some(count);
        self
    }

    pub fn with_do_not_place_with(mut self, rsc_names: Vec<ResourceName>) -> Self {
        self.do_not_place_with_rsc_list = rsc_names;
        self
    }

    pub fn with_layer_stack(mut self, layer_stack: Vec<DeviceLayerKind>) -> Self {
        self.layer_stack = layer_stack;
        self
    }

    /// Fill every field left unset in `self` from `fallback`.
    pub fn merge(mut self, fallback: &AutoSelectFilter) -> Self {
        fn fill<T: Clone>(target: &mut Vec<T>, fallback: &[T]) {
            if target.is_empty() {
                target.extend_from_slice(fallback);
            }
        }

        if self.place_count.is_none() {
            self.place_count = fallback.place_count;
        }
        fill(&mut self.node_name_list, &fallback.node_name_list);
        fill(&mut self.stor_pool_name_list, &fallback.stor_pool_name_list);
        fill(
            &mut self.do_not_place_with_rsc_list,
            &fallback.do_not_place_with_rsc_list,
        );
        if self.do_not_place_with_rsc_regex.is_none() {
            self.do_not_place_with_rsc_regex = fallback.do_not_place_with_rsc_regex.clone();
        }
        fill(&mut self.replicas_on_same_list, &fallback.replicas_on_same_list);
        fill(
            &mut self.replicas_on_different_list,
            &fallback.replicas_on_different_list,
        );
        fill(&mut self.layer_stack, &fallback.layer_stack);
        fill(&mut self.provider_list, &fallback.provider_list);
        if self.diskless_on_remaining.is_none() {
            self.diskless_on_remaining = fallback.diskless_on_remaining;
        }
        self
    }

    pub fn diskless_on_remaining(&self) -> bool {
        self.diskless_on_remaining.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_request_wins() {
        let rsc = ResourceName::new("r0").unwrap();
        let request = AutoSelectFilter::default()
            .with_place_count(1)
            .with_do_not_place_with(vec![rsc.clone()])
            .with_layer_stack(vec![DeviceLayerKind::Drbd]);

        let policy = AutoSelectFilter {
            place_count: Some(3),
            stor_pool_name_list: vec![StorPoolName::new("fast").unwrap()],
            layer_stack: vec![DeviceLayerKind::Luks, DeviceLayerKind::Storage],
            diskless_on_remaining: Some(true),
            ..Default::default()
        };

        let merged = request.merge(&policy);
        assert_eq!(merged.place_count, Some(1));
        assert_eq!(merged.do_not_place_with_rsc_list, vec![rsc]);
        assert_eq!(merged.layer_stack, vec![DeviceLayerKind::Drbd]);
        assert_eq!(merged.stor_pool_name_list.len(), 1);
        assert!(merged.diskless_on_remaining());
    }

    #[test]
    fn test_yaml_policy() {
        let yaml = r#"
placeCount: 3
replicasOnDifferentList: ["Aux/site"]
providerList: [LVM_THIN, ZFS]
"#;
        let filter: AutoSelectFilter = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(filter.place_count, Some(3));
        assert_eq!(filter.provider_list, vec![ProviderKind::LvmThin, ProviderKind::Zfs]);
        assert!(!filter.diskless_on_remaining());
    }
}
