//! Multi-node consolidation: binary-search the largest candidate prefix
//! that can be removed (with at most one replacement) while keeping every
//! workload schedulable.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cloud::{self, InstanceType};
use crate::scheduling::NodeClaimProposal;
use crate::state::ClusterState;

use super::{Action, Candidate, Command, ConsolidationEngine, Validator};

/// The multi-node consolidation solver.
pub struct MultiNodeConsolidation {
    engine: ConsolidationEngine,
    /// Set after a no-op attempt so repeated work is skipped until the
    /// cluster changes.
    consolidated: AtomicBool,
    /// Number of attempts that hit the wall-clock timeout.
    timeouts: AtomicU64,
}

impl MultiNodeConsolidation {
    /// Create a solver over the engine.
    pub fn new(engine: ConsolidationEngine) -> Self {
        Self { engine, consolidated: AtomicBool::new(false), timeouts: AtomicU64::new(0) }
    }

    /// True while the last attempt concluded there is nothing to do.
    pub fn is_consolidated(&self) -> bool {
        self.consolidated.load(Ordering::Relaxed)
    }

    /// Clear the consolidated marker, e.g. after cluster state changed.
    pub fn reset(&self) {
        self.consolidated.store(false, Ordering::Relaxed);
    }

    /// How many attempts timed out so far.
    pub fn timeout_count(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    /// Plan a multi-node consolidation. `budgets` maps pool name to its
    /// remaining allowed disruptions and is decremented for the candidates
    /// taken.
    pub async fn compute_command(
        &self,
        cluster: &ClusterState,
        budgets: &mut HashMap<String, usize>,
        candidates: Vec<Candidate>,
        cancel: &CancellationToken,
    ) -> Command {
        if self.is_consolidated() {
            return Command::no_op();
        }

        // Walk candidates in order, keeping those whose pool still has
        // budget. The ordering must be preserved for the prefix search.
        let mut constrained_by_budgets = false;
        let mut disruptable = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            match budgets.get_mut(&candidate.pool_name) {
                Some(budget) if *budget > 0 => {
                    *budget -= 1;
                    disruptable.push(candidate);
                }
                _ => constrained_by_budgets = true,
            }
        }

        let snapshot = cluster.snapshot().await;
        let max_batch = self.engine.settings.multi_node_consolidation_batch_max;
        let cmd = self.first_n_consolidation_option(&snapshot, &disruptable, max_batch, cancel);

        if cmd.action() == Action::NoOp {
            // Candidates dropped for budget reasons may be consolidatable
            // next time, so the no-op is not cached in that case.
            if !constrained_by_budgets {
                self.consolidated.store(true, Ordering::Relaxed);
            }
            return cmd;
        }

        let fresh = cluster.snapshot().await;
        let validator = Validator::new(&self.engine, self.engine.settings.consolidation_ttl);
        if !validator.is_valid(&cmd, &fresh, cancel) {
            debug!(command = %cmd, "abandoning multi-node consolidation attempt due to pod churn, command is no longer valid");
            return Command::no_op();
        }
        cmd
    }

    /// Binary-search the largest prefix length `k` such that removing
    /// `candidates[..k]` yields a valid command. Bounded by the configured
    /// timeout; on expiry the last valid command is returned.
    fn first_n_consolidation_option(
        &self,
        snapshot: &crate::state::Snapshot,
        candidates: &[Candidate],
        max_batch: usize,
        cancel: &CancellationToken,
    ) -> Command {
        // A single candidate is the single-node solver's job.
        if candidates.len() < 2 {
            return Command::no_op();
        }
        let mut lo = 2usize;
        let mut hi = candidates.len().min(max_batch);

        let deadline = Instant::now() + self.engine.settings.multi_node_consolidation_timeout;
        let mut last_saved = Command::no_op();

        while lo <= hi {
            if cancel.is_cancelled() {
                return last_saved;
            }
            if Instant::now() >= deadline {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                if last_saved.action() == Action::NoOp {
                    debug!(
                        batch = (lo + hi) / 2,
                        "failed to find a multi-node consolidation before timeout"
                    );
                } else {
                    debug!(command = %last_saved, "stopping multi-node consolidation at timeout, returning last valid command");
                }
                return last_saved;
            }

            let mid = (lo + hi) / 2;
            let prefix = &candidates[..mid];

            let mut cmd = match self.engine.compute(snapshot, prefix, cancel) {
                Ok(cmd) => cmd,
                // A cancelled simulation ends the search with the best
                // command found so far.
                Err(_) => return last_saved,
            };

            let valid = match cmd.action() {
                Action::Delete => true,
                Action::Replace => {
                    let filtered = filter_out_same_type(&cmd.replacements[0], prefix);
                    let has_options = !filtered.is_empty();
                    cmd.replacements[0].options = filtered;
                    has_options
                }
                Action::NoOp => false,
            };

            if valid {
                last_saved = cmd;
                lo = mid + 1;
            } else {
                hi = mid - 1;
            }
        }
        last_saved
    }
}

/// Drop replacement options that cost the same or more than the cheapest
/// candidate sharing an instance type with the replacement.
///
/// Replacing `[t3a.2xlarge, t3a.2xlarge, t3a.small]` with one of
/// `{t3a.small, t3a.xlarge, t3a.2xlarge}` is really just deleting two nodes
/// and keeping the third; deletes cause less churn, so the replacement must
/// be strictly cheaper than that `t3a.small`. With no shared type the price
/// bound stays unbounded and every option is kept.
pub fn filter_out_same_type(
    replacement: &NodeClaimProposal,
    candidates: &[Candidate],
) -> Vec<Arc<InstanceType>> {
    let mut existing_types: HashSet<&str> = HashSet::new();
    let mut price_by_type: HashMap<&str, f64> = HashMap::new();

    for candidate in candidates {
        let Some(instance_type) = candidate.instance_type.as_ref() else {
            continue;
        };
        existing_types.insert(instance_type.name.as_str());
        if let Some(offering) =
            instance_type.offering(&candidate.capacity_type, &candidate.zone)
        {
            let entry = price_by_type.entry(instance_type.name.as_str()).or_insert(f64::MAX);
            if offering.price < *entry {
                *entry = offering.price;
            }
        }
    }

    let mut max_price = f64::MAX;
    for option in &replacement.options {
        if existing_types.contains(option.name.as_str()) {
            if let Some(price) = price_by_type.get(option.name.as_str()) {
                if *price < max_price {
                    max_price = *price;
                }
            }
        }
    }

    cloud::filter_by_price(&replacement.options, &replacement.requirements, max_price)
}
