//! The shared consolidation engine: simulate the cluster without a set of
//! candidates and decide whether deleting (or replacing) them keeps every
//! workload schedulable at a lower price.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cloud::{self, InstanceType};
use crate::config::Settings;
use crate::crd::NodePool;
use crate::labels::{CAPACITY_TYPE_ON_DEMAND, LABEL_CAPACITY_TYPE};
use crate::requirements::Requirement;
use crate::scheduling::{Cancelled, Results, Scheduler};
use crate::state::Snapshot;

use super::{Candidate, Command};

/// Shared state for the consolidation solvers.
#[derive(Clone)]
pub struct ConsolidationEngine {
    /// Pools with their instance types, as the scheduler wants them.
    pub pools: Vec<(NodePool, Vec<Arc<InstanceType>>)>,
    /// Runtime settings.
    pub settings: Settings,
}

impl ConsolidationEngine {
    /// Create an engine over the given pools.
    pub fn new(pools: Vec<(NodePool, Vec<Arc<InstanceType>>)>, settings: Settings) -> Self {
        Self { pools, settings }
    }

    /// Simulate scheduling the candidates' pods against the cluster without
    /// the candidates.
    pub fn simulate(
        &self,
        snapshot: &Snapshot,
        candidates: &[Candidate],
        cancel: &CancellationToken,
    ) -> Result<Results, Cancelled> {
        let removed = candidates.iter().map(|c| c.node.key()).collect();
        let reduced = snapshot.without_nodes(&removed);

        let mut batch: Vec<_> = candidates.iter().flat_map(|c| c.pods.iter().cloned()).collect();
        for pod in &mut batch {
            // The pods are pending again in the simulated world.
            if let Some(spec) = pod.spec.as_mut() {
                spec.node_name = None;
            }
        }

        Scheduler::new(
            &reduced,
            self.pools.clone(),
            self.settings.allowed_label_domains.clone(),
            cancel.clone(),
        )
        .schedule(batch)
    }

    /// Compute the consolidation command for a candidate set: `Delete` when
    /// the pods fit on the remaining cluster, `Replace` when exactly one new
    /// node is needed and it is strictly cheaper than what it replaces, and
    /// `NoOp` otherwise.
    pub fn compute(
        &self,
        snapshot: &Snapshot,
        candidates: &[Candidate],
        cancel: &CancellationToken,
    ) -> Result<Command, Cancelled> {
        if candidates.is_empty() {
            return Ok(Command::no_op());
        }
        let results = self.simulate(snapshot, candidates, cancel)?;
        if !results.all_pods_scheduled() {
            debug!(
                candidates = candidates.len(),
                stranded = results.unschedulable.len(),
                "consolidation would strand pods"
            );
            return Ok(Command::no_op());
        }

        let mut new_claims = results.new_claims;
        match new_claims.len() {
            0 => Ok(Command { candidates: candidates.to_vec(), replacements: Vec::new() }),
            1 => {
                let mut replacement = new_claims.remove(0);

                // The replacement must undercut the combined price of what
                // it replaces; unknown candidate prices cannot prove savings.
                let mut total_price = 0.0;
                for candidate in candidates {
                    match candidate.price() {
                        Some(price) => total_price += price,
                        None => return Ok(Command::no_op()),
                    }
                }

                // Replacing spot capacity with more spot capacity is gated.
                if candidates.iter().all(Candidate::is_spot)
                    && !self.settings.feature_gates.spot_to_spot_consolidation
                {
                    replacement.requirements.add(Requirement::in_values(
                        LABEL_CAPACITY_TYPE,
                        [CAPACITY_TYPE_ON_DEMAND],
                    ));
                    replacement.options =
                        cloud::compatible(&replacement.options, &replacement.requirements);
                }

                replacement.options = cloud::filter_by_price(
                    &replacement.options,
                    &replacement.requirements,
                    total_price,
                );
                if replacement.options.is_empty() {
                    return Ok(Command::no_op());
                }
                cloud::sort_by_price(&mut replacement.options, &replacement.requirements);

                Ok(Command {
                    candidates: candidates.to_vec(),
                    replacements: vec![replacement],
                })
            }
            // Needing several new nodes is not a consolidation.
            _ => Ok(Command::no_op()),
        }
    }
}
