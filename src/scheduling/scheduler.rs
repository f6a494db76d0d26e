//! The scheduling pass: fit a batch of pending pods onto existing capacity,
//! then onto node templates, creating templates from pools as needed.
//!
//! The pass is single-threaded over an immutable snapshot. Pods are
//! processed in a deterministic order; each pod tries existing nodes first
//! (initialized before in-flight), then templates opened earlier in the
//! pass, then a fresh template from the best pool. When nothing fits, the
//! pod's soft constraints are relaxed one at a time and the whole chain is
//! retried.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Pod, Taint};
use kube::ResourceExt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cloud::{self, InstanceType};
use crate::crd::NodePool;
use crate::labels::{self, LABEL_CAPACITY_TYPE, LABEL_HOSTNAME, LABEL_ZONE};
use crate::pods;
use crate::requirements::{Requirement, Requirements};
use crate::resources::Resources;
use crate::state::{Snapshot, StateNode};

use super::preferences::SchedulablePod;
use super::template::{NodeClaimProposal, NodeTemplate};
use super::topology::{DomainView, Topology};
use super::volumes;

/// A pod assigned to a node that already exists or is in flight.
#[derive(Clone, Debug)]
pub struct Binding {
    /// The pod being bound.
    pub pod: Pod,
    /// Hostname of the chosen node (provisional for in-flight nodes).
    pub node_name: String,
}

/// A pod the pass could not place, with the last failed predicate.
#[derive(Clone, Debug)]
pub struct Unschedulable {
    /// The pod.
    pub pod: Pod,
    /// Why the final attempt failed.
    pub reason: String,
}

impl std::fmt::Display for Unschedulable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pod {} unschedulable: {}", self.pod.name_any(), self.reason)
    }
}

/// The outcome of one scheduling pass.
#[derive(Clone, Debug, Default)]
pub struct Results {
    /// Pods assigned to existing or in-flight nodes.
    pub bindings: Vec<Binding>,
    /// New nodes to create.
    pub new_claims: Vec<NodeClaimProposal>,
    /// Pods that could not be placed.
    pub unschedulable: Vec<Unschedulable>,
}

impl Results {
    /// True when every pod in the batch found a home.
    pub fn all_pods_scheduled(&self) -> bool {
        self.unschedulable.is_empty()
    }
}

/// The pass was abandoned via its cancellation token.
#[derive(Debug, Error)]
#[error("scheduling pass cancelled")]
pub struct Cancelled;

/// A working copy of an existing or in-flight node during the pass.
struct ExistingNode {
    state: StateNode,
    labels: BTreeMap<String, String>,
    taints: Vec<Taint>,
    /// Daemonset overhead expected but not yet bound on this node.
    ds_gap: Resources,
}

impl ExistingNode {
    fn new(state: StateNode, snapshot: &Snapshot) -> Self {
        let mut labels = state.labels();
        labels.entry(LABEL_HOSTNAME.to_string()).or_insert_with(|| state.hostname());
        let taints = state.taints();
        let expected = snapshot.daemonset_overhead(&labels, &taints);
        let ds_gap = expected.saturating_sub(&state.daemonset_requests());
        Self { state, labels, taints, ds_gap }
    }

    /// Capacity remaining for new pods once pending daemonsets land.
    fn available(&self) -> Resources {
        self.state.available().saturating_sub(&self.ds_gap)
    }
}

/// The scheduler for one pass.
pub struct Scheduler<'a> {
    snapshot: &'a Snapshot,
    /// Pools with their instance types, ordered by weight descending then
    /// name for determinism.
    pools: Vec<(NodePool, Vec<Arc<InstanceType>>)>,
    existing: Vec<ExistingNode>,
    templates: Vec<NodeTemplate>,
    topology: Topology,
    batch_by_key: HashMap<String, Pod>,
    allowed_label_domains: Vec<String>,
    cancel: CancellationToken,
    sequence: usize,
}

impl<'a> Scheduler<'a> {
    /// Prepare a pass over the snapshot with the given pools and their
    /// instance types.
    pub fn new(
        snapshot: &'a Snapshot,
        mut pools: Vec<(NodePool, Vec<Arc<InstanceType>>)>,
        allowed_label_domains: Vec<String>,
        cancel: CancellationToken,
    ) -> Self {
        pools.sort_by(|(a, _), (b, _)| {
            b.spec.weight.cmp(&a.spec.weight).then_with(|| a.name_any().cmp(&b.name_any()))
        });

        let mut existing: Vec<ExistingNode> = snapshot
            .nodes
            .iter()
            .filter(|n| !n.marked_for_deletion && !n.is_terminating())
            .cloned()
            .map(|state| ExistingNode::new(state, snapshot))
            .collect();
        // Initialized nodes are known-good and come first; in-flight nodes
        // follow by creation time.
        existing.sort_by(|a, b| {
            b.state
                .is_initialized()
                .cmp(&a.state.is_initialized())
                .then_with(|| a.state.created().cmp(&b.state.created()))
                .then_with(|| a.state.hostname().cmp(&b.state.hostname()))
        });

        Self {
            snapshot,
            pools,
            existing,
            templates: Vec::new(),
            topology: Topology::default(),
            batch_by_key: HashMap::new(),
            allowed_label_domains,
            cancel,
            sequence: 0,
        }
    }

    /// Run the pass for a batch of pending pods.
    pub fn schedule(mut self, mut batch: Vec<Pod>) -> Result<Results, Cancelled> {
        sort_pods(&mut batch);
        self.topology = Topology::build(&batch, self.snapshot);
        self.register_catalog_domains();
        for pod in &batch {
            self.batch_by_key.insert(pods::pod_key(pod), pod.clone());
        }

        let mut results = Results::default();
        for pod in batch {
            if self.cancel.is_cancelled() {
                return Err(Cancelled);
            }
            if let Err(reason) = self.validate_labels(&pod) {
                results.unschedulable.push(Unschedulable { pod, reason });
                continue;
            }

            let extra = volumes::zone_requirements(&pod, self.snapshot);
            let mut sp = match SchedulablePod::new(pod.clone(), extra) {
                Ok(sp) => sp,
                Err(err) => {
                    results.unschedulable.push(Unschedulable { pod, reason: err.to_string() });
                    continue;
                }
            };

            loop {
                match self.try_place(&mut sp, &mut results) {
                    Ok(()) => break,
                    Err(reason) => match sp.relax() {
                        Some(dropped) => {
                            debug!(pod = %sp.pod.name_any(), %dropped, "relaxed preference and retrying");
                        }
                        None => {
                            results.unschedulable.push(Unschedulable { pod: sp.pod, reason });
                            break;
                        }
                    },
                }
            }
        }

        self.finalize(&mut results);
        info!(
            bindings = results.bindings.len(),
            new_nodes = results.new_claims.len(),
            unschedulable = results.unschedulable.len(),
            "scheduling pass complete"
        );
        Ok(results)
    }

    fn validate_labels(&self, pod: &Pod) -> Result<(), String> {
        let mut keys: BTreeSet<String> = pods::base_requirements(pod).keys().map(str::to_string).collect();
        for term in pods::required_affinity_terms(pod) {
            keys.extend(term.keys().map(str::to_string));
        }
        for (_, term) in pods::preferred_affinity_terms(pod) {
            keys.extend(term.keys().map(str::to_string));
        }
        for key in keys {
            // A pin to a concrete existing hostname is a normal scheduling
            // request, not a restricted-label violation.
            if key == LABEL_HOSTNAME {
                continue;
            }
            labels::validate_requirement_key(&key, &self.allowed_label_domains)
                .map_err(|e| e.to_string())?;
        }
        Ok(())
    }

    fn register_catalog_domains(&mut self) {
        let mut zones = BTreeSet::new();
        let mut capacity_types = BTreeSet::new();
        for (pool, instance_types) in &self.pools {
            for instance_type in instance_types {
                for offering in &instance_type.offerings {
                    zones.insert(offering.zone.clone());
                    capacity_types.insert(offering.capacity_type.clone());
                }
            }
            for (key, value) in pool.requirements().single_valued_labels() {
                self.topology.register_domain(&key, &value);
            }
        }
        for zone in zones {
            self.topology.register_domain(LABEL_ZONE, &zone);
        }
        for capacity_type in capacity_types {
            self.topology.register_domain(LABEL_CAPACITY_TYPE, &capacity_type);
        }
    }

    fn try_place(&mut self, sp: &mut SchedulablePod, results: &mut Results) -> Result<(), String> {
        let mut last_reason = "no node pool is compatible".to_string();

        match self.try_existing(sp, results) {
            Ok(()) => return Ok(()),
            Err(Some(reason)) => last_reason = reason,
            Err(None) => {}
        }
        match self.try_templates(sp) {
            Ok(()) => return Ok(()),
            Err(Some(reason)) => last_reason = reason,
            Err(None) => {}
        }
        match self.try_new_template(sp) {
            Ok(()) => Ok(()),
            Err(Some(reason)) => Err(reason),
            Err(None) => Err(last_reason),
        }
    }

    /// Try every existing node in order. `Err(None)` means "no candidate at
    /// all", `Err(Some)` carries the most recent failure reason.
    fn try_existing(
        &mut self,
        sp: &SchedulablePod,
        results: &mut Results,
    ) -> Result<(), Option<String>> {
        let reqs = sp.requirements();
        let mut last = None;

        for index in 0..self.existing.len() {
            let node = &self.existing[index];

            if !pods::tolerates(&sp.pod, &node.taints) {
                last = Some(format!("node {} has untolerated taints", node.state.hostname()));
                continue;
            }
            if !reqs.matches_labels(&node.labels) {
                last = Some(format!("node {} does not match requirements", node.state.hostname()));
                continue;
            }
            let available = node.available();
            if !sp.requests.fits(&available) {
                last = Some(format!(
                    "insufficient {} on node {}",
                    sp.requests.exceeding(&available).join(", "),
                    node.state.hostname()
                ));
                continue;
            }
            let ports = pods::host_ports(&sp.pod);
            if ports.iter().any(|p| node.state.host_port_conflicts(p)) {
                last = Some(format!("host port in use on node {}", node.state.hostname()));
                continue;
            }
            if let Some(driver) = volumes::exceeds_limits(&sp.pod, &node.state, self.snapshot) {
                last = Some(format!(
                    "volume limit for {driver} exceeded on node {}",
                    node.state.hostname()
                ));
                continue;
            }

            let labels = node.labels.clone();
            let hostname = node.state.hostname();
            let view = |key: &str| -> DomainView {
                if key == LABEL_HOSTNAME {
                    DomainView::Fixed(Some(hostname.clone()))
                } else {
                    DomainView::Fixed(labels.get(key).cloned())
                }
            };
            if let Err(conflict) = self.topology.check(&sp.pod, &view) {
                last = Some(conflict.to_string());
                continue;
            }

            // Commit.
            let pod_key = pods::pod_key(&sp.pod);
            let volumes = crate::state::storage::pod_volumes(
                &sp.pod,
                &self.snapshot.pvcs,
                &self.snapshot.storage_classes,
            );
            self.topology.record_with(&sp.pod, &pod_key, &mut |key| {
                if key == LABEL_HOSTNAME {
                    Some(hostname.clone())
                } else {
                    labels.get(key).cloned()
                }
            });
            let node = &mut self.existing[index];
            node.state.add_pod(
                pod_key,
                sp.requests.clone(),
                pods::is_daemonset_pod(&sp.pod),
                ports,
                volumes,
            );
            results.bindings.push(Binding { pod: sp.pod.clone(), node_name: hostname });
            return Ok(());
        }
        Err(last)
    }

    fn try_templates(&mut self, sp: &SchedulablePod) -> Result<(), Option<String>> {
        let mut last = None;
        for index in 0..self.templates.len() {
            match self.try_one_template(index, sp) {
                Ok(()) => return Ok(()),
                Err(reason) => last = Some(reason),
            }
        }
        Err(last)
    }

    fn try_one_template(&mut self, index: usize, sp: &SchedulablePod) -> Result<(), String> {
        let template = &self.templates[index];
        if !pods::tolerates(&sp.pod, &template.taints) {
            return Err(format!("template {} has untolerated taints", template.hostname));
        }

        let (merged, options) = template.fit(&sp.requirements(), &sp.requests)?;

        let ports = pods::host_ports(&sp.pod);
        if ports.iter().any(|p| template.host_port_conflicts(p)) {
            return Err(format!("host port in use on template {}", template.hostname));
        }

        let (merged, options, domains) =
            self.check_template_topology(&sp.pod, template, merged, options)?;

        let pod_key = pods::pod_key(&sp.pod);
        self.topology.record_with(&sp.pod, &pod_key, &mut |key| domains.get(key).cloned());
        let template = &mut self.templates[index];
        template.place(pod_key, &sp.requests, merged, options, ports);
        Ok(())
    }

    /// Topology check for a template: compute viable domains from the
    /// merged requirements, narrow each constrained key to the preferred
    /// domain, and re-filter the options against the narrowed zone.
    #[allow(clippy::type_complexity)]
    fn check_template_topology(
        &self,
        pod: &Pod,
        template: &NodeTemplate,
        mut merged: Requirements,
        options: Vec<Arc<InstanceType>>,
    ) -> Result<(Requirements, Vec<Arc<InstanceType>>, BTreeMap<String, String>), String> {
        let hostname = template.hostname.clone();
        let merged_view = merged.clone();
        let view = |key: &str| -> DomainView {
            if key == LABEL_HOSTNAME {
                DomainView::Choices(Some(BTreeSet::from([hostname.clone()])))
            } else {
                match merged_view.get(key).map(|r| r.values()) {
                    Some(crate::requirements::Values::Of(set)) => DomainView::Choices(Some(set)),
                    _ => DomainView::Choices(None),
                }
            }
        };
        let decision = self.topology.check(pod, &view).map_err(|c| c.to_string())?;

        let mut domains: BTreeMap<String, String> = BTreeMap::new();
        for (key, preferred) in &decision.preferred {
            merged.add(Requirement::in_values(key.clone(), [preferred.clone()]));
            domains.insert(key.clone(), preferred.clone());
        }
        if !merged.is_satisfiable() {
            return Err("topology narrowed the template into a conflict".to_string());
        }
        let options = if domains.is_empty() {
            options
        } else {
            let narrowed = cloud::compatible(&options, &merged);
            if narrowed.is_empty() {
                return Err("no instance type serves the required topology domain".to_string());
            }
            narrowed
        };
        // The hostname domain is always the template itself.
        domains.insert(LABEL_HOSTNAME.to_string(), template.hostname.clone());
        Ok((merged, options, domains))
    }

    /// The next template sequence number whose hostname does not collide
    /// with a node already in the cluster.
    fn next_sequence(&mut self) -> usize {
        loop {
            let sequence = self.sequence;
            let collides = self.snapshot.nodes.iter().any(|node| {
                let hostname = node.hostname();
                self.pools
                    .iter()
                    .any(|(pool, _)| hostname == format!("{}-{}", pool.name_any(), sequence))
            });
            if !collides {
                return sequence;
            }
            self.sequence += 1;
        }
    }

    /// Open a new template for the pod: highest-weight pool first, then the
    /// cheapest feasible option among pools of equal weight.
    fn try_new_template(&mut self, sp: &SchedulablePod) -> Result<(), Option<String>> {
        let sequence = self.next_sequence();
        let mut last = None;
        let mut index = 0;
        while index < self.pools.len() {
            let weight = self.pools[index].0.spec.weight;
            let group_end = self.pools[index..]
                .iter()
                .position(|(p, _)| p.spec.weight != weight)
                .map(|offset| index + offset)
                .unwrap_or(self.pools.len());

            let mut best: Option<(f64, NodeTemplate, Requirements, Vec<Arc<InstanceType>>, BTreeMap<String, String>)> =
                None;
            for (pool, instance_types) in &self.pools[index..group_end] {
                let pool_name = pool.name_any();
                let Some(template) = NodeTemplate::new(
                    pool,
                    &pool_name,
                    sequence,
                    instance_types,
                    self.snapshot,
                ) else {
                    last = Some(format!("pool {pool_name} has no compatible instance types"));
                    continue;
                };
                if !pods::tolerates(&sp.pod, &template.taints) {
                    last = Some(format!("pool {pool_name} taints are not tolerated"));
                    continue;
                }
                let (merged, options) = match template.fit(&sp.requirements(), &sp.requests) {
                    Ok(fit) => fit,
                    Err(reason) => {
                        last = Some(format!("pool {pool_name}: {reason}"));
                        continue;
                    }
                };
                let (merged, options, domains) =
                    match self.check_template_topology(&sp.pod, &template, merged, options) {
                        Ok(ok) => ok,
                        Err(reason) => {
                            last = Some(format!("pool {pool_name}: {reason}"));
                            continue;
                        }
                    };
                let price = cloud::cheapest_price(&options, &merged).unwrap_or(f64::MAX);
                let better = best.as_ref().map_or(true, |(best_price, ..)| price < *best_price);
                if better {
                    best = Some((price, template, merged, options, domains));
                }
            }

            if let Some((_, mut template, merged, options, domains)) = best {
                let pod_key = pods::pod_key(&sp.pod);
                self.topology.register_domain(LABEL_HOSTNAME, &template.hostname);
                self.topology.record_with(&sp.pod, &pod_key, &mut |key| domains.get(key).cloned());
                let ports = pods::host_ports(&sp.pod);
                template.place(pod_key, &sp.requests, merged, options, ports);
                debug!(
                    template = %template.hostname,
                    pool = %template.pool_name,
                    "opened new node template"
                );
                self.sequence = sequence + 1;
                self.templates.push(template);
                return Ok(());
            }
            index = group_end;
        }
        Err(last)
    }

    fn finalize(&mut self, results: &mut Results) {
        for template in std::mem::take(&mut self.templates) {
            match template.finalize(self.snapshot) {
                Ok(proposal) => results.new_claims.push(proposal),
                Err(pod_keys) => {
                    for key in pod_keys {
                        if let Some(pod) = self.batch_by_key.get(&key) {
                            results.unschedulable.push(Unschedulable {
                                pod: pod.clone(),
                                reason: "instance type options emptied at finalization"
                                    .to_string(),
                            });
                        }
                    }
                }
            }
        }
    }
}

/// Deterministic pod order: higher priority first, then more restrictive
/// (more constrained keys, larger requests), then oldest, then name.
pub fn sort_pods(batch: &mut [Pod]) {
    batch.sort_by(|a, b| {
        pods::priority(b)
            .cmp(&pods::priority(a))
            .then_with(|| restrictiveness(b).cmp(&restrictiveness(a)))
            .then_with(|| {
                a.metadata
                    .creation_timestamp
                    .as_ref()
                    .map(|t| t.0)
                    .cmp(&b.metadata.creation_timestamp.as_ref().map(|t| t.0))
            })
            .then_with(|| a.name_any().cmp(&b.name_any()))
    });
}

fn restrictiveness(pod: &Pod) -> (usize, i64) {
    let key_count = pods::base_requirements(pod).keys().count()
        + pods::required_affinity_terms(pod)
            .first()
            .map(|t| t.keys().count())
            .unwrap_or(0);
    let requests = crate::resources::pod_requests(pod)
        .map(|r| {
            r.get(crate::resources::RESOURCE_CPU)
                + r.get(crate::resources::RESOURCE_MEMORY) / (1 << 20)
        })
        .unwrap_or(0);
    (key_count, requests)
}
