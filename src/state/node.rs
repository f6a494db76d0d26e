//! The unified node view used by scheduling.
//!
//! A [`StateNode`] is either an observed Node (with or without an owning
//! NodeClaim) or an in-flight NodeClaim whose Node has not appeared yet.
//! It carries the bookkeeping scheduling needs: allocatable, bound pod
//! requests, daemonset overhead, host-port usage, and per-driver volume
//! usage.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, Taint};
use kube::ResourceExt;

use crate::cloud::InstanceType;
use crate::crd::NodeClaim;
use crate::resources::Resources;

/// Taints the orchestrator adds transiently; scheduling looks through them.
const EPHEMERAL_TAINT_KEYS: [&str; 3] = [
    "node.kubernetes.io/not-ready",
    "node.kubernetes.io/unreachable",
    "node.kubernetes.io/unschedulable",
];

/// A host port reservation: (ip, port, protocol).
pub type HostPort = (String, i32, String);

/// Union of an existing Node and/or an in-flight NodeClaim.
#[derive(Clone, Debug, Default)]
pub struct StateNode {
    /// Observed Node object, absent while in flight.
    pub node: Option<Node>,
    /// Owning NodeClaim, absent for nodes gantry did not create.
    pub claim: Option<NodeClaim>,
    /// Remaining instance-type options for an in-flight claim; used to
    /// estimate allocatable before the Node reports status.
    pub instance_type_options: Vec<Arc<InstanceType>>,
    /// Requests of every bound pod (daemonset pods included), by pod key.
    pub pod_requests: HashMap<String, Resources>,
    /// The subset of bound pods that belong to daemonsets.
    pub daemonset_pod_keys: BTreeSet<String>,
    /// Host ports reserved by bound pods.
    pub host_ports: BTreeSet<HostPort>,
    /// Unique mounted volumes per CSI driver.
    pub volume_usage: HashMap<String, BTreeSet<String>>,
    /// Set when a disruption command selected this node for removal.
    pub marked_for_deletion: bool,
}

impl StateNode {
    /// A state node for an in-flight claim.
    pub fn from_claim(claim: NodeClaim, options: Vec<Arc<InstanceType>>) -> Self {
        Self { claim: Some(claim), instance_type_options: options, ..Default::default() }
    }

    /// A state node for an observed node.
    pub fn from_node(node: Node) -> Self {
        Self { node: Some(node), ..Default::default() }
    }

    /// The stable key for this node in cluster state: the provider ID when
    /// known, otherwise the claim name.
    pub fn key(&self) -> String {
        self.provider_id().map(str::to_string).unwrap_or_else(|| {
            self.claim.as_ref().map(|c| format!("claim/{}", c.name_any())).unwrap_or_default()
        })
    }

    /// Cloud provider ID, from the node spec or the claim status.
    pub fn provider_id(&self) -> Option<&str> {
        if let Some(id) =
            self.node.as_ref().and_then(|n| n.spec.as_ref()).and_then(|s| s.provider_id.as_deref())
        {
            return Some(id);
        }
        self.claim.as_ref().and_then(|c| c.status.as_ref()).and_then(|s| s.provider_id.as_deref())
    }

    /// The node name: real once registered, provisional (the claim name)
    /// while in flight. Used as the hostname topology domain.
    pub fn hostname(&self) -> String {
        if let Some(node) = self.node.as_ref() {
            return node.name_any();
        }
        if let Some(name) =
            self.claim.as_ref().and_then(|c| c.status.as_ref()).and_then(|s| s.node_name.clone())
        {
            return name;
        }
        self.claim.as_ref().map(|c| c.name_any()).unwrap_or_default()
    }

    /// True while the claim exists but its Node has not registered.
    pub fn is_in_flight(&self) -> bool {
        self.node.is_none()
    }

    /// True once the node is ready for ordinary scheduling: startup taints
    /// gone and allocatable published. Nodes gantry did not create count as
    /// initialized as soon as they report allocatable.
    pub fn is_initialized(&self) -> bool {
        match (&self.node, &self.claim) {
            (Some(_), Some(claim)) => claim.is_initialized(),
            (Some(node), None) => node
                .status
                .as_ref()
                .and_then(|s| s.allocatable.as_ref())
                .is_some_and(|a| !a.is_empty()),
            _ => false,
        }
    }

    /// True once the node or its claim is being torn down.
    pub fn is_terminating(&self) -> bool {
        if self.claim.as_ref().is_some_and(NodeClaim::is_terminating) {
            return true;
        }
        self.node.as_ref().is_some_and(|n| n.metadata.deletion_timestamp.is_some())
    }

    /// The owning pool name, from the claim or the node's ownership label.
    pub fn pool_name(&self) -> Option<String> {
        if let Some(claim) = self.claim.as_ref() {
            return Some(claim.spec.node_pool.clone());
        }
        self.labels().get(crate::labels::LABEL_NODEPOOL).cloned()
    }

    /// Effective labels: claim labels overlaid by node labels once the node
    /// reports its own.
    pub fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = self
            .claim
            .as_ref()
            .and_then(|c| c.status.as_ref())
            .map(|s| s.labels.clone())
            .unwrap_or_default();
        if let Some(claim) = self.claim.as_ref() {
            if labels.is_empty() {
                // Before launch, the single-valued requirements are the best
                // guess at the labels the node will carry.
                labels = claim.requirements().single_valued_labels();
            }
        }
        if let Some(node) = self.node.as_ref() {
            if let Some(node_labels) = node.metadata.labels.as_ref() {
                for (k, v) in node_labels {
                    labels.insert(k.clone(), v.clone());
                }
            }
        }
        labels
    }

    /// Scheduling-relevant taints: the node's (or, in flight, the claim's)
    /// taints minus startup taints and the orchestrator's ephemeral taints.
    pub fn taints(&self) -> Vec<Taint> {
        let raw: Vec<Taint> = if let Some(node) = self.node.as_ref() {
            node.spec.as_ref().and_then(|s| s.taints.clone()).unwrap_or_default()
        } else {
            self.claim.as_ref().map(|c| c.spec.taints.clone()).unwrap_or_default()
        };
        let startup: Vec<Taint> =
            self.claim.as_ref().map(|c| c.spec.startup_taints.clone()).unwrap_or_default();
        raw.into_iter()
            .filter(|t| !EPHEMERAL_TAINT_KEYS.contains(&t.key.as_str()))
            .filter(|t| {
                !startup.iter().any(|s| {
                    s.key == t.key && s.value == t.value && s.effect == t.effect
                })
            })
            .collect()
    }

    /// Allocatable resources. Once a Node reports status that is
    /// authoritative (after initialization even a kubelet-zeroed extended
    /// resource overrides the claim's estimate); before that the claim
    /// status is used, and failing that the per-dimension minimum across
    /// the remaining instance-type options.
    pub fn allocatable(&self) -> Resources {
        if let Some(reported) = self
            .node
            .as_ref()
            .and_then(|n| n.status.as_ref())
            .and_then(|s| s.allocatable.as_ref())
            .filter(|a| !a.is_empty())
        {
            if let Ok(parsed) = Resources::from_quantities(reported) {
                return parsed;
            }
        }
        if let Some(from_claim) = self
            .claim
            .as_ref()
            .and_then(|c| c.status.as_ref())
            .map(|s| &s.allocatable)
            .filter(|a| !a.is_empty())
        {
            if let Ok(parsed) = Resources::from_quantities(from_claim) {
                return parsed;
            }
        }
        self.instance_type_options
            .iter()
            .map(|it| it.allocatable())
            .reduce(|acc, next| acc.component_min(&next))
            .unwrap_or_default()
    }

    /// Sum of all bound pod requests.
    pub fn pod_requests_total(&self) -> Resources {
        let mut total = Resources::new();
        for requests in self.pod_requests.values() {
            total.add(requests);
        }
        total
    }

    /// Sum of bound daemonset pod requests.
    pub fn daemonset_requests(&self) -> Resources {
        let mut total = Resources::new();
        for key in &self.daemonset_pod_keys {
            if let Some(requests) = self.pod_requests.get(key) {
                total.add(requests);
            }
        }
        total
    }

    /// Resources still free for new pods: allocatable minus everything
    /// bound (daemonsets included).
    pub fn available(&self) -> Resources {
        self.allocatable().saturating_sub(&self.pod_requests_total())
    }

    /// Number of volumes currently mounted through a CSI driver.
    pub fn volume_count(&self, driver: &str) -> usize {
        self.volume_usage.get(driver).map_or(0, BTreeSet::len)
    }

    /// True if reserving `(ip, port, protocol)` would clash with a bound
    /// pod. A wildcard IP clashes with every IP on the same port/protocol.
    pub fn host_port_conflicts(&self, wanted: &HostPort) -> bool {
        let (ip, port, protocol) = wanted;
        self.host_ports.iter().any(|(used_ip, used_port, used_protocol)| {
            used_port == port
                && used_protocol == protocol
                && (used_ip == ip || used_ip == "0.0.0.0" || ip == "0.0.0.0")
        })
    }

    /// Record a pod binding.
    pub fn add_pod(
        &mut self,
        key: String,
        requests: Resources,
        daemonset: bool,
        ports: Vec<HostPort>,
        volumes: Vec<(String, String)>,
    ) {
        if daemonset {
            self.daemonset_pod_keys.insert(key.clone());
        }
        self.pod_requests.insert(key, requests);
        self.host_ports.extend(ports);
        for (driver, volume) in volumes {
            self.volume_usage.entry(driver).or_default().insert(volume);
        }
    }

    /// Remove a pod binding. Volume and port bookkeeping is rebuilt by the
    /// owner because this node cannot know which reservations were shared.
    pub fn remove_pod(&mut self, key: &str) {
        self.pod_requests.remove(key);
        self.daemonset_pod_keys.remove(key);
    }

    /// Creation time of the claim (preferred) or node, for stable ordering.
    pub fn created(&self) -> Option<DateTime<Utc>> {
        let claim_time = self
            .claim
            .as_ref()
            .and_then(|c| c.metadata.creation_timestamp.as_ref())
            .map(|t| t.0);
        let node_time =
            self.node.as_ref().and_then(|n| n.metadata.creation_timestamp.as_ref()).map(|t| t.0);
        claim_time.or(node_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::Offering;
    use crate::labels::CAPACITY_TYPE_ON_DEMAND;
    use crate::requirements::Requirements;
    use crate::resources::{RESOURCE_CPU, RESOURCE_MEMORY};
    use k8s_openapi::api::core::v1::{NodeSpec, NodeStatus};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    fn option(name: &str, cpu: i64, memory: i64) -> Arc<InstanceType> {
        let mut capacity = Resources::new();
        capacity.set(RESOURCE_CPU, cpu);
        capacity.set(RESOURCE_MEMORY, memory);
        InstanceType::new(
            name,
            capacity,
            Resources::new(),
            Requirements::new(),
            vec![Offering {
                zone: "zone-1".to_string(),
                capacity_type: CAPACITY_TYPE_ON_DEMAND.to_string(),
                price: 1.0,
                available: true,
            }],
        )
    }

    fn in_flight(options: Vec<Arc<InstanceType>>) -> StateNode {
        let claim = NodeClaim::new("claim-1", Default::default());
        StateNode::from_claim(claim, options)
    }

    #[test]
    fn in_flight_allocatable_is_minimum_across_options() {
        let node = in_flight(vec![option("a", 4000, 16 << 30), option("b", 2000, 32 << 30)]);
        let allocatable = node.allocatable();
        assert_eq!(allocatable.get(RESOURCE_CPU), 2000);
        assert_eq!(allocatable.get(RESOURCE_MEMORY), 16 << 30);
    }

    #[test]
    fn node_status_overrides_option_estimate() {
        let mut state_node = in_flight(vec![option("a", 4000, 16 << 30)]);
        state_node.node = Some(Node {
            status: Some(NodeStatus {
                allocatable: Some(std::collections::BTreeMap::from([(
                    RESOURCE_CPU.to_string(),
                    Quantity("3".to_string()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        });
        assert_eq!(state_node.allocatable().get(RESOURCE_CPU), 3000);
        // The kubelet did not report memory; the estimate no longer applies.
        assert_eq!(state_node.allocatable().get(RESOURCE_MEMORY), 0);
    }

    #[test]
    fn available_subtracts_bound_pods() {
        let mut node = in_flight(vec![option("a", 4000, 16 << 30)]);
        let mut requests = Resources::new();
        requests.set(RESOURCE_CPU, 1500);
        node.add_pod("p1".to_string(), requests, false, vec![], vec![]);

        assert_eq!(node.available().get(RESOURCE_CPU), 2500);
    }

    #[test]
    fn daemonset_requests_are_tracked_separately() {
        let mut node = in_flight(vec![option("a", 4000, 16 << 30)]);
        let mut ds = Resources::new();
        ds.set(RESOURCE_CPU, 100);
        node.add_pod("ds1".to_string(), ds, true, vec![], vec![]);
        let mut app = Resources::new();
        app.set(RESOURCE_CPU, 1000);
        node.add_pod("app1".to_string(), app, false, vec![], vec![]);

        assert_eq!(node.daemonset_requests().get(RESOURCE_CPU), 100);
        assert_eq!(node.pod_requests_total().get(RESOURCE_CPU), 1100);
    }

    #[test]
    fn startup_taints_are_invisible_to_scheduling() {
        let mut claim = NodeClaim::new("claim-1", Default::default());
        claim.spec.taints = vec![Taint {
            key: "dedicated".to_string(),
            value: Some("infra".to_string()),
            effect: "NoSchedule".to_string(),
            ..Default::default()
        }];
        claim.spec.startup_taints = vec![Taint {
            key: "gantry.dev/initializing".to_string(),
            effect: "NoSchedule".to_string(),
            ..Default::default()
        }];
        let mut node = StateNode::from_claim(claim, vec![]);
        node.node = Some(Node {
            spec: Some(NodeSpec {
                taints: Some(vec![
                    Taint {
                        key: "dedicated".to_string(),
                        value: Some("infra".to_string()),
                        effect: "NoSchedule".to_string(),
                        ..Default::default()
                    },
                    Taint {
                        key: "gantry.dev/initializing".to_string(),
                        effect: "NoSchedule".to_string(),
                        ..Default::default()
                    },
                    Taint {
                        key: "node.kubernetes.io/not-ready".to_string(),
                        effect: "NoSchedule".to_string(),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        });

        let taints = node.taints();
        assert_eq!(taints.len(), 1);
        assert_eq!(taints[0].key, "dedicated");
    }

    #[test]
    fn wildcard_host_port_conflicts_with_specific_ip() {
        let mut node = in_flight(vec![]);
        node.add_pod(
            "p1".to_string(),
            Resources::new(),
            false,
            vec![("0.0.0.0".to_string(), 8080, "TCP".to_string())],
            vec![],
        );

        assert!(node.host_port_conflicts(&("10.0.0.1".to_string(), 8080, "TCP".to_string())));
        assert!(!node.host_port_conflicts(&("10.0.0.1".to_string(), 9090, "TCP".to_string())));
        assert!(!node.host_port_conflicts(&("10.0.0.1".to_string(), 8080, "UDP".to_string())));
    }

    #[test]
    fn hostname_falls_back_to_claim_name_in_flight() {
        let node = in_flight(vec![]);
        assert_eq!(node.hostname(), "claim-1");
    }
}
