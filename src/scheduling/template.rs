//! Node templates: candidate future nodes assembled during a pass.
//!
//! A template starts from a pool's requirements and the full set of
//! instance types the pool may launch. Each placed pod tightens the
//! requirements and narrows the viable options; the pod fits as long as at
//! least one option can still host everything placed.

use std::collections::BTreeSet;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Taint;

use crate::cloud::{self, InstanceType};
use crate::crd::{NodeClaim, NodeClaimSpec, NodePool, RequirementSpec, ResourceRequestsSpec};
use crate::labels::LABEL_HOSTNAME;
use crate::requirements::{Requirement, Requirements, Values};
use crate::resources::Resources;
use crate::state::{HostPort, Snapshot};

/// A candidate future node accumulating pods during a scheduling pass.
#[derive(Clone, Debug)]
pub struct NodeTemplate {
    /// The pool the node would be created against.
    pub pool_name: String,
    /// The pool's weight, for reporting.
    pub pool_weight: i32,
    /// Taints the node will carry. Startup taints are tracked separately:
    /// they are gone before the pods gantry placed here start, so they do
    /// not gate placement.
    pub taints: Vec<Taint>,
    /// Startup taints from the pool template, carried onto the claim.
    pub startup_taints: Vec<Taint>,
    /// Conjunction of the pool's and every placed pod's requirements.
    pub requirements: Requirements,
    /// Instance types that can still host everything placed.
    pub options: Vec<Arc<InstanceType>>,
    /// Keys of the pods placed here.
    pub pod_keys: Vec<String>,
    /// Total requests: placed pods plus daemonset overhead.
    pub requests: Resources,
    /// Daemonset overhead under the template's labels and taints.
    pub daemonset_overhead: Resources,
    /// Synthetic hostname; its own domain for hostname topology.
    pub hostname: String,
    /// Host ports reserved by placed pods.
    pub host_ports: BTreeSet<HostPort>,
}

impl NodeTemplate {
    /// Start a template for a pool. `sequence` disambiguates hostnames
    /// within a pass. Returns `None` when no instance type is compatible
    /// with the pool's own requirements.
    pub fn new(
        pool: &NodePool,
        pool_name: &str,
        sequence: usize,
        instance_types: &[Arc<InstanceType>],
        snapshot: &Snapshot,
    ) -> Option<Self> {
        let hostname = format!("{pool_name}-{sequence}");
        let mut requirements = pool.requirements();
        requirements.add(Requirement::in_values(LABEL_HOSTNAME, [hostname.clone()]));
        if !requirements.is_satisfiable() {
            return None;
        }

        let options = cloud::compatible(instance_types, &requirements);
        if options.is_empty() {
            return None;
        }

        let taints = pool.spec.template.taints.clone();
        let daemonset_overhead =
            snapshot.daemonset_overhead(&requirements.single_valued_labels(), &taints);

        Some(Self {
            pool_name: pool_name.to_string(),
            pool_weight: pool.spec.weight,
            taints,
            startup_taints: pool.spec.template.startup_taints.clone(),
            requirements,
            options,
            pod_keys: Vec::new(),
            requests: daemonset_overhead.clone(),
            daemonset_overhead,
            hostname,
            host_ports: BTreeSet::new(),
        })
    }

    /// Whether placing a pod with these requirements and requests would
    /// leave the template viable; on success returns the merged
    /// requirements and the narrowed options without committing them.
    pub fn fit(
        &self,
        pod_requirements: &Requirements,
        pod_requests: &Resources,
    ) -> Result<(Requirements, Vec<Arc<InstanceType>>), String> {
        let mut merged = self.requirements.clone();
        merged.merge(pod_requirements);
        if !merged.is_satisfiable() {
            return Err(merged
                .conflicts()
                .last()
                .cloned()
                .unwrap_or_else(|| "incompatible requirements".to_string()));
        }

        let mut total = self.requests.clone();
        total.add(pod_requests);

        let options = cloud::compatible(&self.options, &merged);
        let options = cloud::filter_by_resources(&options, &total);
        if options.is_empty() {
            return Err(format!(
                "no instance type can satisfy requests {total} with requirements {merged}"
            ));
        }
        Ok((merged, options))
    }

    /// Commit a previously computed fit.
    pub fn place(
        &mut self,
        pod_key: String,
        pod_requests: &Resources,
        merged: Requirements,
        options: Vec<Arc<InstanceType>>,
        ports: Vec<HostPort>,
    ) {
        self.requirements = merged;
        self.options = options;
        self.requests.add(pod_requests);
        self.pod_keys.push(pod_key);
        self.host_ports.extend(ports);
    }

    /// True if reserving the port would clash with a pod already placed.
    pub fn host_port_conflicts(&self, wanted: &HostPort) -> bool {
        let (ip, port, protocol) = wanted;
        self.host_ports.iter().any(|(used_ip, used_port, used_protocol)| {
            used_port == port
                && used_protocol == protocol
                && (used_ip == ip || used_ip == "0.0.0.0" || ip == "0.0.0.0")
        })
    }

    /// Finalize into a claim proposal: recompute daemonset overhead under
    /// the final labels, re-filter options, and order them cheapest first.
    /// Returns `Err` with the placed pod keys if the final filter empties
    /// the options.
    pub fn finalize(mut self, snapshot: &Snapshot) -> Result<NodeClaimProposal, Vec<String>> {
        let final_overhead =
            snapshot.daemonset_overhead(&self.requirements.single_valued_labels(), &self.taints);
        let mut requests = self.requests.clone();
        requests = requests.saturating_sub(&self.daemonset_overhead);
        requests.add(&final_overhead);

        let options = cloud::compatible(&self.options, &self.requirements);
        let mut options = cloud::filter_by_resources(&options, &requests);
        if options.is_empty() {
            return Err(self.pod_keys);
        }
        cloud::sort_by_price(&mut options, &self.requirements);

        self.daemonset_overhead = final_overhead;
        Ok(NodeClaimProposal {
            pool_name: self.pool_name,
            requirements: self.requirements,
            options,
            requests,
            pod_keys: self.pod_keys,
            provisional_hostname: self.hostname,
            taints: self.taints,
            startup_taints: self.startup_taints,
        })
    }
}

/// A finalized request for one new node, ready to become a NodeClaim.
#[derive(Clone, Debug)]
pub struct NodeClaimProposal {
    /// The pool the claim is created against.
    pub pool_name: String,
    /// Conjunction of pool and pod requirements.
    pub requirements: Requirements,
    /// Viable instance types, cheapest first; never empty.
    pub options: Vec<Arc<InstanceType>>,
    /// Total requests the node must satisfy.
    pub requests: Resources,
    /// The pods this node was sized for.
    pub pod_keys: Vec<String>,
    /// The hostname used during the pass for topology accounting.
    pub provisional_hostname: String,
    /// Taints for the created node.
    pub taints: Vec<Taint>,
    /// Startup taints for the created node.
    pub startup_taints: Vec<Taint>,
}

impl NodeClaimProposal {
    /// The price of the claim: the minimum price among offerings satisfying
    /// its requirements.
    pub fn price(&self) -> Option<f64> {
        cloud::cheapest_price(&self.options, &self.requirements)
    }

    /// Render the proposal as a NodeClaim object named `name`.
    pub fn to_node_claim(&self, name: &str) -> NodeClaim {
        let mut requirements: Vec<RequirementSpec> = Vec::new();
        for key in self.requirements.keys() {
            if key == LABEL_HOSTNAME {
                // The provisional hostname is a pass-internal artifact.
                continue;
            }
            if let Some(req) = self.requirements.get(key) {
                if let Values::Of(values) = req.values() {
                    requirements.push(RequirementSpec {
                        key: key.to_string(),
                        operator: crate::requirements::Operator::In,
                        values: values.into_iter().collect(),
                    });
                }
            }
        }
        // The option list is authoritative over any instance-type
        // requirement accumulated during the pass.
        requirements.retain(|r| r.key != crate::labels::LABEL_INSTANCE_TYPE);
        requirements.push(RequirementSpec {
            key: crate::labels::LABEL_INSTANCE_TYPE.to_string(),
            operator: crate::requirements::Operator::In,
            values: self.options.iter().map(|it| it.name.clone()).collect(),
        });

        let requests = self
            .requests
            .iter()
            .map(|(resource, amount)| {
                let quantity = match resource {
                    crate::resources::RESOURCE_CPU => format!("{amount}m"),
                    _ => amount.to_string(),
                };
                (
                    resource.to_string(),
                    k8s_openapi::apimachinery::pkg::api::resource::Quantity(quantity),
                )
            })
            .collect();

        NodeClaim::new(
            name,
            NodeClaimSpec {
                node_pool: self.pool_name.clone(),
                requirements,
                resources: ResourceRequestsSpec { requests },
                taints: self.taints.clone(),
                startup_taints: self.startup_taints.clone(),
            },
        )
    }
}
