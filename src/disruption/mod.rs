//! Disruption planning: removing or replacing nodes that have become
//! redundant or inefficient, while proving the cluster stays feasible.
//!
//! - [`consolidation`] - the shared simulate-and-price engine
//! - [`multinode`] - binary search over a candidate prefix
//! - [`singlenode`] - the simpler one-candidate sibling solver
//! - [`validation`] - re-checking a command against a fresh snapshot

pub mod consolidation;
pub mod multinode;
pub mod singlenode;
pub mod validation;

pub use consolidation::ConsolidationEngine;
pub use multinode::MultiNodeConsolidation;
pub use singlenode::SingleNodeConsolidation;
pub use validation::Validator;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

use crate::cloud::InstanceType;
use crate::crd::NodePool;
use crate::labels::{LABEL_CAPACITY_TYPE, LABEL_INSTANCE_TYPE, LABEL_ZONE};
use crate::pods;
use crate::resources::{RESOURCE_CPU, RESOURCE_MEMORY};
use crate::scheduling::NodeClaimProposal;
use crate::state::{Snapshot, StateNode};

/// A node eligible for disruption.
#[derive(Clone, Debug)]
pub struct Candidate {
    /// The node as captured in the snapshot.
    pub node: StateNode,
    /// Its owning pool.
    pub pool_name: String,
    /// The resolved instance type, when the catalog still carries it.
    pub instance_type: Option<Arc<InstanceType>>,
    /// The node's capacity type label value.
    pub capacity_type: String,
    /// The node's zone label value.
    pub zone: String,
    /// The reschedulable pods bound to the node.
    pub pods: Vec<Pod>,
    /// Ordering key: average utilization across cpu and memory.
    pub utilization: f64,
}

impl Candidate {
    /// Build a candidate from a state node. Returns `None` when the node is
    /// not disruptable: not initialized yet, already going away, unowned, or
    /// holding pods nothing would recreate.
    pub fn build(
        node: &StateNode,
        snapshot: &Snapshot,
        catalog: &HashMap<String, Arc<InstanceType>>,
    ) -> Option<Self> {
        if !node.is_initialized() || node.is_terminating() || node.marked_for_deletion {
            return None;
        }
        let pool_name = node.pool_name()?;
        let labels = node.labels();

        // A bare or static pod pins its node: nothing will recreate it.
        for pod_key in node.pod_requests.keys() {
            let pod = snapshot.pods.get(pod_key)?;
            if pods::is_terminal(pod) || pods::is_daemonset_pod(pod) {
                continue;
            }
            if !pods::is_reschedulable(pod) {
                return None;
            }
        }

        let allocatable = node.allocatable();
        let requested = node.pod_requests_total();
        let ratio = |resource: &str| -> f64 {
            let capacity = allocatable.get(resource);
            if capacity <= 0 {
                return 0.0;
            }
            requested.get(resource) as f64 / capacity as f64
        };
        let utilization = (ratio(RESOURCE_CPU) + ratio(RESOURCE_MEMORY)) / 2.0;

        Some(Self {
            node: node.clone(),
            pool_name,
            instance_type: labels
                .get(LABEL_INSTANCE_TYPE)
                .and_then(|name| catalog.get(name))
                .cloned(),
            capacity_type: labels.get(LABEL_CAPACITY_TYPE).cloned().unwrap_or_default(),
            zone: labels.get(LABEL_ZONE).cloned().unwrap_or_default(),
            pods: snapshot.reschedulable_pods_on(&node.key()),
            utilization,
        })
    }

    /// The hourly price of the candidate's current offering, if resolvable.
    pub fn price(&self) -> Option<f64> {
        self.instance_type
            .as_ref()
            .and_then(|it| it.offering(&self.capacity_type, &self.zone))
            .map(|o| o.price)
    }

    /// True if the node runs on spot capacity.
    pub fn is_spot(&self) -> bool {
        self.capacity_type == crate::labels::CAPACITY_TYPE_SPOT
    }
}

/// What a disruption command does.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Nothing worth doing.
    NoOp,
    /// Remove the candidates outright.
    Delete,
    /// Remove the candidates and create one replacement.
    Replace,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::NoOp => write!(f, "no-op"),
            Action::Delete => write!(f, "delete"),
            Action::Replace => write!(f, "replace"),
        }
    }
}

/// The output of disruption planning.
#[derive(Clone, Debug, Default)]
pub struct Command {
    /// Nodes to remove.
    pub candidates: Vec<Candidate>,
    /// Replacement claims; at most one from the consolidation solvers.
    pub replacements: Vec<NodeClaimProposal>,
}

impl Command {
    /// The command's action.
    pub fn action(&self) -> Action {
        if self.candidates.is_empty() {
            Action::NoOp
        } else if self.replacements.is_empty() {
            Action::Delete
        } else {
            Action::Replace
        }
    }

    /// An empty, do-nothing command.
    pub fn no_op() -> Self {
        Self::default()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} node(s)", self.action(), self.candidates.len())?;
        if let Some(replacement) = self.replacements.first() {
            let options: Vec<&str> =
                replacement.options.iter().take(5).map(|it| it.name.as_str()).collect();
            write!(f, " with 1 node from [{}]", options.join(", "))?;
        }
        Ok(())
    }
}

/// Remaining allowed disruptions per pool, from each pool's budget and its
/// current node count (nodes already being deleted count against it).
pub fn build_budgets(pools: &[NodePool], snapshot: &Snapshot) -> HashMap<String, usize> {
    let mut budgets = HashMap::new();
    for pool in pools {
        let name = pool.name_any();
        let owned: Vec<&StateNode> =
            snapshot.nodes.iter().filter(|n| n.pool_name().as_deref() == Some(&name)).collect();
        let deleting = owned.iter().filter(|n| n.marked_for_deletion || n.is_terminating()).count();
        let allowed = pool.spec.disruption.allowed_disruptions(owned.len());
        budgets.insert(name, allowed.saturating_sub(deleting));
    }
    budgets
}

/// Build and order the disruption candidates: least utilized first, older
/// nodes first on ties.
pub fn build_candidates(
    snapshot: &Snapshot,
    pools: &[(NodePool, Vec<Arc<InstanceType>>)],
) -> Vec<Candidate> {
    let catalog: HashMap<String, Arc<InstanceType>> = pools
        .iter()
        .flat_map(|(_, types)| types.iter())
        .map(|it| (it.name.clone(), it.clone()))
        .collect();

    let mut candidates: Vec<Candidate> = snapshot
        .nodes
        .iter()
        .filter_map(|node| Candidate::build(node, snapshot, &catalog))
        .collect();
    candidates.sort_by(|a, b| {
        a.utilization
            .total_cmp(&b.utilization)
            .then_with(|| a.node.created().cmp(&b.node.created()))
            .then_with(|| a.node.hostname().cmp(&b.node.hostname()))
    });
    candidates
}
