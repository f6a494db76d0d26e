//! In-memory mirror of cluster state.
//!
//! [`ClusterState`] is written by the informer reconcilers (one entry point
//! per resource kind) and read by scheduling through [`Snapshot`], an
//! immutable deep copy taken at the start of a pass. In-flight NodeClaims
//! are tracked as state nodes before their Node object appears, so the
//! scheduler can pack pods onto capacity that is still being created.

mod node;
pub mod storage;

pub use node::{HostPort, StateNode};

use std::collections::{BTreeMap, HashMap, HashSet};

use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{Node, PersistentVolumeClaim, Pod, Taint};
use k8s_openapi::api::storage::v1::{CSINode, StorageClass};
use kube::ResourceExt;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::cloud::InstanceType;
use crate::crd::NodeClaim;
use crate::error::Error;
use crate::pods;
use crate::resources::{pod_requests, Resources};
use std::sync::Arc;

/// The canonical pod a daemonset would run, derived from its template.
pub fn daemonset_pod(daemonset: &DaemonSet) -> Pod {
    let template = daemonset.spec.as_ref().map(|s| s.template.clone()).unwrap_or_default();
    let mut pod = Pod { spec: template.spec, ..Default::default() };
    if let Some(metadata) = template.metadata {
        pod.metadata.labels = metadata.labels;
        pod.metadata.annotations = metadata.annotations;
    }
    pod.metadata.name = Some(format!("{}-daemon", daemonset.name_any()));
    pod.metadata.namespace = daemonset.metadata.namespace.clone();
    pod
}

/// Aggregate requests of the daemonset pods that would land on a node with
/// the given labels and taints.
pub fn daemonset_overhead(
    daemonset_pods: &[Pod],
    labels: &BTreeMap<String, String>,
    taints: &[Taint],
) -> Resources {
    let mut total = Resources::new();
    for pod in daemonset_pods {
        if !pods::tolerates(pod, taints) {
            continue;
        }
        if !pods::matches_node_labels(pod, labels) {
            continue;
        }
        if let Ok(requests) = pod_requests(pod) {
            total.add(&requests);
        }
    }
    total
}

/// An immutable view of cluster state for one scheduling or consolidation
/// pass.
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    /// All tracked state nodes, existing and in flight.
    pub nodes: Vec<StateNode>,
    /// All non-terminal pods by pod key.
    pub pods: HashMap<String, Pod>,
    /// Canonical pods of every known daemonset.
    pub daemonset_pods: Vec<Pod>,
    /// Storage classes by name.
    pub storage_classes: HashMap<String, StorageClass>,
    /// Persistent volume claims by namespace/name.
    pub pvcs: HashMap<String, PersistentVolumeClaim>,
    /// Per-node CSI driver volume limits: node name -> driver -> allocatable.
    pub csi_limits: HashMap<String, HashMap<String, i64>>,
}

impl Snapshot {
    /// Look up a node by hostname.
    pub fn node_by_hostname(&self, hostname: &str) -> Option<&StateNode> {
        self.nodes.iter().find(|n| n.hostname() == hostname)
    }

    /// A copy of this snapshot with the given nodes removed, used to
    /// simulate the cluster after a disruption.
    pub fn without_nodes(&self, keys: &HashSet<String>) -> Snapshot {
        let mut out = self.clone();
        out.nodes.retain(|n| !keys.contains(&n.key()));
        out
    }

    /// Daemonset overhead for a hypothetical node with these labels and
    /// taints.
    pub fn daemonset_overhead(&self, labels: &BTreeMap<String, String>, taints: &[Taint]) -> Resources {
        daemonset_overhead(&self.daemonset_pods, labels, taints)
    }

    /// The CSI volume limit for a driver on a node, if the CSINode object
    /// reported one.
    pub fn csi_limit(&self, node_name: &str, driver: &str) -> Option<i64> {
        self.csi_limits.get(node_name).and_then(|drivers| drivers.get(driver)).copied()
    }

    /// The pods bound to a node that a controller would recreate elsewhere
    /// if the node were removed.
    pub fn reschedulable_pods_on(&self, node_key: &str) -> Vec<Pod> {
        let Some(node) = self.nodes.iter().find(|n| n.key() == node_key) else {
            return Vec::new();
        };
        node.pod_requests
            .keys()
            .filter_map(|pod_key| self.pods.get(pod_key))
            .filter(|pod| pods::is_reschedulable(pod) && !pods::is_terminal(pod))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Default)]
struct Inner {
    /// State nodes by key (provider ID, or claim/<name> while pending).
    nodes: HashMap<String, StateNode>,
    /// Pod key -> owning node key.
    bindings: HashMap<String, String>,
    /// All non-terminal pods by pod key.
    pods: HashMap<String, Pod>,
    /// Daemonsets by namespace/name.
    daemonsets: HashMap<String, DaemonSet>,
    /// Storage classes by name.
    storage_classes: HashMap<String, StorageClass>,
    /// PVCs by namespace/name.
    pvcs: HashMap<String, PersistentVolumeClaim>,
    /// CSI limits per node name.
    csi_limits: HashMap<String, HashMap<String, i64>>,
}

impl Inner {
    fn node_key_for_name(&self, node_name: &str) -> Option<String> {
        self.nodes
            .iter()
            .find(|(_, n)| n.hostname() == node_name)
            .map(|(key, _)| key.clone())
    }

    fn bind_pod(&mut self, pod: &Pod) -> Result<(), Error> {
        let pod_key = pods::pod_key(pod);
        let node_name = pod
            .spec
            .as_ref()
            .and_then(|s| s.node_name.clone())
            .ok_or_else(|| Error::state(format!("pod {pod_key} has no node assignment")))?;
        let node_key = self.node_key_for_name(&node_name).ok_or_else(|| {
            Error::state(format!("pod {pod_key} references unknown node {node_name}"))
        })?;

        // Re-bind cleanly if the pod moved.
        if let Some(previous) = self.bindings.get(&pod_key).cloned() {
            if previous != node_key {
                self.unbind_pod(&pod_key);
            }
        }

        let requests = pod_requests(pod)?;
        let ports = pods::host_ports(pod);
        let volumes = storage::pod_volumes(pod, &self.pvcs, &self.storage_classes);
        if let Some(node) = self.nodes.get_mut(&node_key) {
            node.add_pod(pod_key.clone(), requests, pods::is_daemonset_pod(pod), ports, volumes);
        }
        self.bindings.insert(pod_key, node_key);
        Ok(())
    }

    fn unbind_pod(&mut self, pod_key: &str) {
        if let Some(node_key) = self.bindings.remove(pod_key) {
            if let Some(node) = self.nodes.get_mut(&node_key) {
                node.remove_pod(pod_key);
            }
            self.rebuild_node_usage(&node_key);
        }
    }

    /// Recompute port and volume reservations for a node from its remaining
    /// pods; removal cannot tell which reservations were shared.
    fn rebuild_node_usage(&mut self, node_key: &str) {
        let Some(node) = self.nodes.get(node_key) else {
            return;
        };
        let bound: Vec<Pod> = node
            .pod_requests
            .keys()
            .filter_map(|key| self.pods.get(key))
            .cloned()
            .collect();
        let mut ports = std::collections::BTreeSet::new();
        let mut volumes: HashMap<String, std::collections::BTreeSet<String>> = HashMap::new();
        for pod in &bound {
            ports.extend(pods::host_ports(pod));
            for (driver, volume) in storage::pod_volumes(pod, &self.pvcs, &self.storage_classes) {
                volumes.entry(driver).or_default().insert(volume);
            }
        }
        if let Some(node) = self.nodes.get_mut(node_key) {
            node.host_ports = ports;
            node.volume_usage = volumes;
        }
    }
}

/// The concurrent cluster-state store.
///
/// Writers are the per-kind reconcilers; readers take a [`Snapshot`].
#[derive(Debug, Default)]
pub struct ClusterState {
    inner: RwLock<Inner>,
}

impl ClusterState {
    /// Create an empty cluster state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Observe a Node, linking it to its claim when one is in flight.
    pub async fn update_node(&self, node: Node) {
        let mut inner = self.inner.write().await;
        let node_name = node.name_any();
        let provider_id =
            node.spec.as_ref().and_then(|s| s.provider_id.clone()).unwrap_or_default();

        // An in-flight claim waiting for this node adopts it, migrating the
        // entry to its provider-ID key.
        let claim_key = inner
            .nodes
            .iter()
            .find(|(_, state)| {
                state.node.is_none()
                    && state.claim.as_ref().is_some_and(|c| {
                        c.status.as_ref().is_some_and(|s| {
                            s.node_name.as_deref() == Some(node_name.as_str())
                                || (!provider_id.is_empty()
                                    && s.provider_id.as_deref() == Some(provider_id.as_str()))
                        })
                    })
            })
            .map(|(key, _)| key.clone());

        match claim_key {
            Some(key) => {
                let mut state = inner.nodes.remove(&key).unwrap_or_default();
                state.node = Some(node);
                let new_key = state.key();
                debug!(node = %node_name, key = %new_key, "node registered for in-flight claim");
                inner.nodes.insert(new_key, state);
            }
            None => {
                let existing_key = inner.node_key_for_name(&node_name);
                match existing_key {
                    Some(key) => {
                        if let Some(state) = inner.nodes.get_mut(&key) {
                            state.node = Some(node);
                        }
                    }
                    None => {
                        let state = StateNode::from_node(node);
                        inner.nodes.insert(state.key(), state);
                    }
                }
            }
        }
    }

    /// Forget a Node. Its claim (if still present) keeps the entry alive.
    pub async fn delete_node(&self, node_name: &str) {
        let mut inner = self.inner.write().await;
        let Some(key) = inner.node_key_for_name(node_name) else {
            return;
        };
        let mut orphaned = Vec::new();
        let mut drop_entry = false;
        if let Some(state) = inner.nodes.get_mut(&key) {
            state.node = None;
            orphaned = state.pod_requests.keys().cloned().collect();
            drop_entry = state.claim.is_none();
        }
        if drop_entry {
            inner.nodes.remove(&key);
        }
        for pod_key in orphaned {
            inner.bindings.remove(&pod_key);
        }
        inner.csi_limits.remove(node_name);
    }

    /// Observe a NodeClaim, with the instance-type options it may still
    /// resolve to (used to estimate allocatable before the node reports).
    pub async fn update_node_claim(&self, claim: NodeClaim, options: Vec<Arc<InstanceType>>) {
        let mut inner = self.inner.write().await;
        let pending_key = format!("claim/{}", claim.name_any());
        let provider_key = claim
            .status
            .as_ref()
            .and_then(|s| s.provider_id.clone())
            .filter(|id| !id.is_empty());

        // Launching migrates the entry from the pending key to the provider
        // ID; an already-registered node may also own the provider key.
        let existing = if inner.nodes.contains_key(&pending_key) {
            Some(pending_key.clone())
        } else {
            provider_key.as_ref().filter(|key| inner.nodes.contains_key(*key)).cloned()
        };

        let mut state = existing
            .and_then(|key| inner.nodes.remove(&key))
            .unwrap_or_default();
        state.claim = Some(claim);
        if !options.is_empty() {
            state.instance_type_options = options;
        }
        inner.nodes.insert(state.key(), state);
    }

    /// Forget a NodeClaim.
    pub async fn delete_node_claim(&self, claim_name: &str) {
        let mut inner = self.inner.write().await;
        let key = inner
            .nodes
            .iter()
            .find(|(_, state)| {
                state.claim.as_ref().is_some_and(|c| c.name_any() == claim_name)
            })
            .map(|(key, _)| key.clone());
        let Some(key) = key else {
            return;
        };
        let remove_entirely = inner.nodes.get(&key).is_some_and(|s| s.node.is_none());
        if remove_entirely {
            inner.nodes.remove(&key);
        } else if let Some(state) = inner.nodes.get_mut(&key) {
            state.claim = None;
            state.instance_type_options.clear();
        }
    }

    /// Observe a pod. Terminal pods are dropped; bound pods are charged to
    /// their node. A pod referencing an unknown node is an error the caller
    /// logs and skips for this pass.
    pub async fn update_pod(&self, pod: Pod) -> Result<(), Error> {
        let mut inner = self.inner.write().await;
        let pod_key = pods::pod_key(&pod);

        if pods::is_terminal(&pod) {
            inner.unbind_pod(&pod_key);
            inner.pods.remove(&pod_key);
            return Ok(());
        }

        inner.pods.insert(pod_key.clone(), pod.clone());
        if pod.spec.as_ref().and_then(|s| s.node_name.as_ref()).is_some() {
            inner.bind_pod(&pod)?;
        }
        Ok(())
    }

    /// Reserve capacity for a pod the scheduler assigned to a node that may
    /// not have registered yet. The reservation holds until the real
    /// binding (or the pod's deletion) is observed.
    pub async fn nominate_pod(&self, pod: Pod, node_hostname: &str) -> Result<(), Error> {
        let mut inner = self.inner.write().await;
        let pod_key = pods::pod_key(&pod);
        let node_key = inner.node_key_for_name(node_hostname).ok_or_else(|| {
            Error::state(format!("pod {pod_key} nominated to unknown node {node_hostname}"))
        })?;

        let requests = pod_requests(&pod)?;
        let ports = pods::host_ports(&pod);
        let volumes = storage::pod_volumes(&pod, &inner.pvcs, &inner.storage_classes);
        if let Some(node) = inner.nodes.get_mut(&node_key) {
            node.add_pod(pod_key.clone(), requests, pods::is_daemonset_pod(&pod), ports, volumes);
        }
        inner.bindings.insert(pod_key.clone(), node_key);
        inner.pods.insert(pod_key, pod);
        Ok(())
    }

    /// Forget a pod.
    pub async fn delete_pod(&self, pod_key: &str) {
        let mut inner = self.inner.write().await;
        inner.unbind_pod(pod_key);
        inner.pods.remove(pod_key);
    }

    /// Observe a daemonset.
    pub async fn update_daemonset(&self, daemonset: DaemonSet) {
        let mut inner = self.inner.write().await;
        let key = format!(
            "{}/{}",
            daemonset.namespace().unwrap_or_default(),
            daemonset.name_any()
        );
        inner.daemonsets.insert(key, daemonset);
    }

    /// Forget a daemonset.
    pub async fn delete_daemonset(&self, namespace: &str, name: &str) {
        let mut inner = self.inner.write().await;
        inner.daemonsets.remove(&format!("{namespace}/{name}"));
    }

    /// Observe a CSINode's per-driver volume limits.
    pub async fn update_csi_node(&self, csi_node: CSINode) {
        let mut inner = self.inner.write().await;
        let mut drivers = HashMap::new();
        for driver in &csi_node.spec.drivers {
            if let Some(count) = driver.allocatable.as_ref().and_then(|a| a.count) {
                drivers.insert(driver.name.clone(), i64::from(count));
            }
        }
        inner.csi_limits.insert(csi_node.name_any(), drivers);
    }

    /// Observe a storage class.
    pub async fn update_storage_class(&self, class: StorageClass) {
        let mut inner = self.inner.write().await;
        inner.storage_classes.insert(class.name_any(), class);
    }

    /// Forget a storage class.
    pub async fn delete_storage_class(&self, name: &str) {
        let mut inner = self.inner.write().await;
        inner.storage_classes.remove(name);
    }

    /// Observe a persistent volume claim.
    pub async fn update_pvc(&self, pvc: PersistentVolumeClaim) {
        let mut inner = self.inner.write().await;
        let key = format!("{}/{}", pvc.namespace().unwrap_or_default(), pvc.name_any());
        inner.pvcs.insert(key, pvc);
    }

    /// Forget a persistent volume claim.
    pub async fn delete_pvc(&self, namespace: &str, name: &str) {
        let mut inner = self.inner.write().await;
        inner.pvcs.remove(&format!("{namespace}/{name}"));
    }

    /// Flag nodes selected by a disruption command. Their pods become
    /// candidates for rescheduling in the next pass.
    pub async fn mark_for_deletion(&self, keys: &[String]) {
        let mut inner = self.inner.write().await;
        for key in keys {
            match inner.nodes.get_mut(key) {
                Some(node) => node.marked_for_deletion = true,
                None => warn!(key = %key, "cannot mark unknown node for deletion"),
            }
        }
    }

    /// Clear the deletion flag, e.g. after a command was abandoned.
    pub async fn unmark_for_deletion(&self, keys: &[String]) {
        let mut inner = self.inner.write().await;
        for key in keys {
            if let Some(node) = inner.nodes.get_mut(key) {
                node.marked_for_deletion = false;
            }
        }
    }

    /// Take an immutable snapshot for a scheduling or consolidation pass.
    pub async fn snapshot(&self) -> Snapshot {
        let inner = self.inner.read().await;
        Snapshot {
            nodes: inner.nodes.values().cloned().collect(),
            pods: inner.pods.clone(),
            daemonset_pods: inner.daemonsets.values().map(daemonset_pod).collect(),
            storage_classes: inner.storage_classes.clone(),
            pvcs: inner.pvcs.clone(),
            csi_limits: inner.csi_limits.clone(),
        }
    }
}
