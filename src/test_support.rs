//! Shared fixtures for unit tests.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{OwnerReference, Time};

use crate::cloud::{InstanceType, Offering};
use crate::crd::{NodeClaimTemplateSpec, NodePool, NodePoolSpec, RequirementSpec};
use crate::labels::{CAPACITY_TYPE_ON_DEMAND, LABEL_ARCH, LABEL_OS};
use crate::requirements::{Operator, Requirements};
use crate::resources::{Resources, RESOURCE_CPU, RESOURCE_MEMORY, RESOURCE_PODS};

/// Build an instance type with one on-demand offering per zone.
pub fn instance_type(
    name: &str,
    cpu_millis: i64,
    memory_bytes: i64,
    price: f64,
    zones: &[&str],
) -> Arc<InstanceType> {
    instance_type_arch(name, cpu_millis, memory_bytes, price, zones, "amd64")
}

/// Build an instance type with an explicit architecture.
pub fn instance_type_arch(
    name: &str,
    cpu_millis: i64,
    memory_bytes: i64,
    price: f64,
    zones: &[&str],
    arch: &str,
) -> Arc<InstanceType> {
    let mut capacity = Resources::new();
    capacity.set(RESOURCE_CPU, cpu_millis);
    capacity.set(RESOURCE_MEMORY, memory_bytes);
    capacity.set(RESOURCE_PODS, 110);

    let mut requirements = Requirements::new();
    requirements.add(crate::requirements::Requirement::in_values(LABEL_ARCH, [arch]));
    requirements.add(crate::requirements::Requirement::in_values(LABEL_OS, ["linux"]));

    InstanceType::new(
        name,
        capacity,
        Resources::new(),
        requirements,
        zones
            .iter()
            .map(|zone| Offering {
                zone: zone.to_string(),
                capacity_type: CAPACITY_TYPE_ON_DEMAND.to_string(),
                price,
                available: true,
            })
            .collect(),
    )
}

/// A default pool with no constraints.
pub fn pool(name: &str) -> NodePool {
    pool_weighted(name, 0)
}

/// A pool with the given weight.
pub fn pool_weighted(name: &str, weight: i32) -> NodePool {
    let mut pool = NodePool::new(
        name,
        NodePoolSpec {
            weight,
            template: NodeClaimTemplateSpec::default(),
            disruption: Default::default(),
        },
    );
    pool.metadata.name = Some(name.to_string());
    pool
}

/// Fluent pending-pod builder.
#[derive(Clone)]
pub struct PodFixture {
    pod: Pod,
}

impl PodFixture {
    /// A pending pod named `name` in the default namespace.
    pub fn new(name: &str) -> Self {
        let mut pod = Pod {
            spec: Some(PodSpec {
                containers: vec![Container { name: "app".to_string(), ..Default::default() }],
                ..Default::default()
            }),
            ..Default::default()
        };
        pod.metadata.name = Some(name.to_string());
        pod.metadata.namespace = Some("default".to_string());
        pod.metadata.uid = Some(format!("uid-{name}"));
        pod.metadata.creation_timestamp =
            Some(Time(chrono::TimeZone::timestamp_opt(&chrono::Utc, 1_700_000_000, 0).unwrap()));
        Self { pod }
    }

    /// Set cpu/memory requests (e.g. `"500m"`, `"1.8G"`).
    pub fn requests(mut self, cpu: &str, memory: &str) -> Self {
        let mut requests = BTreeMap::new();
        if !cpu.is_empty() {
            requests.insert(RESOURCE_CPU.to_string(), Quantity(cpu.to_string()));
        }
        if !memory.is_empty() {
            requests.insert(RESOURCE_MEMORY.to_string(), Quantity(memory.to_string()));
        }
        self.pod.spec.as_mut().unwrap().containers[0].resources =
            Some(ResourceRequirements { requests: Some(requests), ..Default::default() });
        self
    }

    /// Add a node selector entry.
    pub fn node_selector(mut self, key: &str, value: &str) -> Self {
        self.pod
            .spec
            .as_mut()
            .unwrap()
            .node_selector
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
        self
    }

    /// Add a required node-affinity `In` expression as its own term.
    pub fn required_affinity(mut self, key: &str, values: &[&str]) -> Self {
        use k8s_openapi::api::core::v1::{
            Affinity, NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm,
        };
        let term = NodeSelectorTerm {
            match_expressions: Some(vec![NodeSelectorRequirement {
                key: key.to_string(),
                operator: "In".to_string(),
                values: Some(values.iter().map(|v| v.to_string()).collect()),
            }]),
            ..Default::default()
        };
        let spec = self.pod.spec.as_mut().unwrap();
        let affinity = spec.affinity.get_or_insert_with(Affinity::default);
        let node_affinity = affinity.node_affinity.get_or_insert_with(NodeAffinity::default);
        match node_affinity.required_during_scheduling_ignored_during_execution.as_mut() {
            Some(selector) => selector.node_selector_terms[0]
                .match_expressions
                .get_or_insert_with(Vec::new)
                .extend(term.match_expressions.clone().unwrap()),
            None => {
                node_affinity.required_during_scheduling_ignored_during_execution =
                    Some(NodeSelector { node_selector_terms: vec![term] });
            }
        }
        self
    }

    /// Add a pod label.
    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.pod
            .metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
        self
    }

    /// Add a zone topology-spread constraint over pods matching `app`.
    pub fn zone_spread(mut self, app: &str, max_skew: i32) -> Self {
        use k8s_openapi::api::core::v1::TopologySpreadConstraint;
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
        let constraint = TopologySpreadConstraint {
            max_skew,
            topology_key: crate::labels::LABEL_ZONE.to_string(),
            when_unsatisfiable: "DoNotSchedule".to_string(),
            label_selector: Some(LabelSelector {
                match_labels: Some(BTreeMap::from([("app".to_string(), app.to_string())])),
                ..Default::default()
            }),
            ..Default::default()
        };
        self.pod
            .spec
            .as_mut()
            .unwrap()
            .topology_spread_constraints
            .get_or_insert_with(Vec::new)
            .push(constraint);
        self
    }

    /// Give the pod a controlling ReplicaSet owner, making it
    /// reschedulable during consolidation.
    pub fn owned_by_replicaset(mut self) -> Self {
        self.pod.metadata.owner_references = Some(vec![OwnerReference {
            controller: Some(true),
            kind: "ReplicaSet".to_string(),
            api_version: "apps/v1".to_string(),
            name: format!("{}-rs", self.pod.metadata.name.clone().unwrap_or_default()),
            uid: "rs-uid".to_string(),
            ..Default::default()
        }]);
        self
    }

    /// Bind the pod to a node.
    pub fn bound_to(mut self, node_name: &str) -> Self {
        self.pod.spec.as_mut().unwrap().node_name = Some(node_name.to_string());
        self
    }

    /// Finish building.
    pub fn build(self) -> Pod {
        self.pod
    }
}

/// Shorthand for a pool requirement spec.
pub fn requirement_spec(key: &str, values: &[&str]) -> RequirementSpec {
    RequirementSpec {
        key: key.to_string(),
        operator: Operator::In,
        values: values.iter().map(|v| v.to_string()).collect(),
    }
}

/// An initialized node owned by the `default` pool, labeled with its
/// instance type, zone, and capacity type.
pub fn ready_node(
    name: &str,
    instance: &str,
    zone: &str,
    capacity_type: &str,
    cpu: &str,
    memory: &str,
) -> k8s_openapi::api::core::v1::Node {
    use k8s_openapi::api::core::v1::{Node, NodeSpec, NodeStatus};

    let mut node = Node {
        spec: Some(NodeSpec {
            provider_id: Some(format!("provider://{name}")),
            ..Default::default()
        }),
        status: Some(NodeStatus {
            allocatable: Some(BTreeMap::from([
                (RESOURCE_CPU.to_string(), Quantity(cpu.to_string())),
                (RESOURCE_MEMORY.to_string(), Quantity(memory.to_string())),
                (RESOURCE_PODS.to_string(), Quantity("110".to_string())),
            ])),
            ..Default::default()
        }),
        ..Default::default()
    };
    node.metadata.name = Some(name.to_string());
    node.metadata.labels = Some(BTreeMap::from([
        (crate::labels::LABEL_INSTANCE_TYPE.to_string(), instance.to_string()),
        (crate::labels::LABEL_ZONE.to_string(), zone.to_string()),
        (crate::labels::LABEL_CAPACITY_TYPE.to_string(), capacity_type.to_string()),
        (crate::labels::LABEL_NODEPOOL.to_string(), "default".to_string()),
        (LABEL_ARCH.to_string(), "amd64".to_string()),
        (LABEL_OS.to_string(), "linux".to_string()),
    ]));
    node
}
