//! Pod inspection helpers shared by cluster state and scheduling.
//!
//! Everything scheduling needs to know about a pod is derived here:
//! tolerations against taints, node selector and affinity as requirement
//! bags, host ports, ownership, and reschedulability.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{NodeSelectorTerm, Pod, Taint, Toleration};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::ResourceExt;

use crate::requirements::{Operator, Requirement, Requirements};

/// A stable identity for a pod within a pass. Falls back to namespace/name
/// when the API server has not assigned a UID (fixtures, tests).
pub fn pod_key(pod: &Pod) -> String {
    pod.metadata
        .uid
        .clone()
        .unwrap_or_else(|| format!("{}/{}", pod.namespace().unwrap_or_default(), pod.name_any()))
}

/// The pod's namespace, defaulting to `default`.
pub fn pod_namespace(pod: &Pod) -> String {
    pod.namespace().unwrap_or_else(|| "default".to_string())
}

/// The pod's scheduling priority, zero if unset.
pub fn priority(pod: &Pod) -> i32 {
    pod.spec.as_ref().and_then(|s| s.priority).unwrap_or(0)
}

fn toleration_matches(toleration: &Toleration, taint: &Taint) -> bool {
    let key_matches = match toleration.key.as_deref() {
        // An empty key with Exists tolerates everything.
        None | Some("") => toleration.operator.as_deref() == Some("Exists"),
        Some(key) => key == taint.key,
    };
    if !key_matches {
        return false;
    }
    let value_matches = match toleration.operator.as_deref() {
        Some("Exists") => true,
        // Equal is the default operator.
        _ => toleration.value.as_deref().unwrap_or("") == taint.value.as_deref().unwrap_or(""),
    };
    let effect_matches = match toleration.effect.as_deref() {
        None | Some("") => true,
        Some(effect) => effect == taint.effect,
    };
    value_matches && effect_matches
}

/// True iff the pod tolerates every scheduling-relevant taint.
/// `PreferNoSchedule` taints never block placement.
pub fn tolerates(pod: &Pod, taints: &[Taint]) -> bool {
    let tolerations = pod
        .spec
        .as_ref()
        .and_then(|s| s.tolerations.as_deref())
        .unwrap_or_default();
    taints
        .iter()
        .filter(|taint| taint.effect == "NoSchedule" || taint.effect == "NoExecute")
        .all(|taint| tolerations.iter().any(|t| toleration_matches(t, taint)))
}

fn term_requirements(term: &NodeSelectorTerm) -> Requirements {
    let mut reqs = Requirements::new();
    for expr in term.match_expressions.iter().flatten() {
        if let Some(req) = Requirement::from_node_selector_requirement(expr) {
            reqs.add(req);
        }
    }
    // matchFields only supports metadata.name; expressed as the hostname label.
    for field in term.match_fields.iter().flatten() {
        if field.key == "metadata.name" {
            if let Some(op) = crate::requirements::Operator::parse(&field.operator) {
                reqs.add(Requirement::new(
                    crate::labels::LABEL_HOSTNAME,
                    op,
                    field.values.clone().unwrap_or_default(),
                ));
            }
        }
    }
    reqs
}

/// The pod's unconditional node requirements: its `nodeSelector` plus an
/// explicit `nodeName` pin when set.
pub fn base_requirements(pod: &Pod) -> Requirements {
    let mut reqs = Requirements::new();
    let Some(spec) = pod.spec.as_ref() else {
        return reqs;
    };
    if let Some(selector) = spec.node_selector.as_ref() {
        for (key, value) in selector {
            reqs.add(Requirement::in_values(key.clone(), [value.clone()]));
        }
    }
    if let Some(node_name) = spec.node_name.as_ref() {
        reqs.add(Requirement::in_values(crate::labels::LABEL_HOSTNAME, [node_name.clone()]));
    }
    reqs
}

/// The required node-affinity terms, one requirement bag per
/// `NodeSelectorTerm`. The terms are an OR; an empty list means
/// unconstrained.
pub fn required_affinity_terms(pod: &Pod) -> Vec<Requirements> {
    pod.spec
        .as_ref()
        .and_then(|s| s.affinity.as_ref())
        .and_then(|a| a.node_affinity.as_ref())
        .and_then(|na| na.required_during_scheduling_ignored_during_execution.as_ref())
        .map(|selector| selector.node_selector_terms.iter().map(term_requirements).collect())
        .unwrap_or_default()
}

/// The preferred node-affinity terms as `(weight, requirements)` pairs in
/// spec order.
pub fn preferred_affinity_terms(pod: &Pod) -> Vec<(i32, Requirements)> {
    pod.spec
        .as_ref()
        .and_then(|s| s.affinity.as_ref())
        .and_then(|a| a.node_affinity.as_ref())
        .and_then(|na| na.preferred_during_scheduling_ignored_during_execution.as_ref())
        .map(|terms| {
            terms
                .iter()
                .map(|t| (t.weight, term_requirements(&t.preference)))
                .collect()
        })
        .unwrap_or_default()
}

/// Evaluate a pod label selector against a label map. An empty selector
/// matches everything, per the Kubernetes convention.
pub fn label_selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    for (key, value) in selector.match_labels.iter().flatten() {
        if labels.get(key) != Some(value) {
            return false;
        }
    }
    for expr in selector.match_expressions.iter().flatten() {
        let Some(op) = Operator::parse(&expr.operator) else {
            return false;
        };
        let values = expr.values.clone().unwrap_or_default();
        let matched = match op {
            Operator::In => labels.get(&expr.key).is_some_and(|v| values.contains(v)),
            Operator::NotIn => labels.get(&expr.key).map_or(true, |v| !values.contains(v)),
            Operator::Exists => labels.contains_key(&expr.key),
            Operator::DoesNotExist => !labels.contains_key(&expr.key),
            // Gt/Lt are node-selector operators; they do not appear in pod
            // label selectors.
            Operator::Gt | Operator::Lt => false,
        };
        if !matched {
            return false;
        }
    }
    true
}

/// True iff a node carrying these labels satisfies the pod's node selector
/// and required node affinity (any term may match).
pub fn matches_node_labels(pod: &Pod, labels: &BTreeMap<String, String>) -> bool {
    if !base_requirements(pod).matches_labels(labels) {
        return false;
    }
    let terms = required_affinity_terms(pod);
    terms.is_empty() || terms.iter().any(|term| term.matches_labels(labels))
}

/// Host ports requested by the pod, as (ip, port, protocol) tuples.
pub fn host_ports(pod: &Pod) -> Vec<(String, i32, String)> {
    let Some(spec) = pod.spec.as_ref() else {
        return Vec::new();
    };
    let mut out = Vec::new();
    let containers = spec.containers.iter().chain(spec.init_containers.iter().flatten());
    for container in containers {
        for port in container.ports.iter().flatten() {
            if let Some(host_port) = port.host_port {
                out.push((
                    port.host_ip.clone().unwrap_or_else(|| "0.0.0.0".to_string()),
                    host_port,
                    port.protocol.clone().unwrap_or_else(|| "TCP".to_string()),
                ));
            }
        }
    }
    out
}

/// The kind of the pod's controller owner, if any.
pub fn controller_owner_kind(pod: &Pod) -> Option<String> {
    pod.metadata
        .owner_references
        .iter()
        .flatten()
        .find(|owner| owner.controller == Some(true))
        .map(|owner| owner.kind.clone())
}

/// True for pods managed by a DaemonSet.
pub fn is_daemonset_pod(pod: &Pod) -> bool {
    controller_owner_kind(pod).as_deref() == Some("DaemonSet")
}

/// True for static (mirror) pods, which the kubelet owns directly.
pub fn is_static_pod(pod: &Pod) -> bool {
    pod.metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key("kubernetes.io/config.mirror"))
        || controller_owner_kind(pod).as_deref() == Some("Node")
}

/// True if evicting the pod is safe because a controller will recreate it
/// elsewhere. DaemonSet pods stay with their node and bare pods have no
/// controller to bring them back, so neither is reschedulable.
pub fn is_reschedulable(pod: &Pod) -> bool {
    if is_static_pod(pod) || is_daemonset_pod(pod) {
        return false;
    }
    matches!(
        controller_owner_kind(pod).as_deref(),
        Some("ReplicaSet" | "StatefulSet" | "ReplicationController" | "Job")
    )
}

/// True if the pod is in a terminal or terminating state and no longer
/// consumes scheduling capacity.
pub fn is_terminal(pod: &Pod) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return true;
    }
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded" | "Failed")
    )
}

/// True if the pod is waiting for a node: unbound and pending.
pub fn is_pending_unscheduled(pod: &Pod) -> bool {
    pod.spec.as_ref().map_or(true, |s| s.node_name.is_none())
        && !is_terminal(pod)
        && pod.status.as_ref().and_then(|s| s.phase.as_deref()).unwrap_or("Pending") == "Pending"
}

/// Labels of the pod, empty map if unset.
pub fn pod_labels(pod: &Pod) -> BTreeMap<String, String> {
    pod.metadata.labels.clone().unwrap_or_default()
}
