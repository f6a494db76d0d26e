//! Single-node consolidation: the simpler sibling solver that considers
//! candidates one at a time and takes the first valid command.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::state::ClusterState;

use super::multinode::filter_out_same_type;
use super::{Action, Candidate, Command, ConsolidationEngine, Validator};

/// The single-node consolidation solver.
pub struct SingleNodeConsolidation {
    engine: ConsolidationEngine,
    consolidated: AtomicBool,
}

impl SingleNodeConsolidation {
    /// Create a solver over the engine.
    pub fn new(engine: ConsolidationEngine) -> Self {
        Self { engine, consolidated: AtomicBool::new(false) }
    }

    /// True while the last attempt found nothing to do.
    pub fn is_consolidated(&self) -> bool {
        self.consolidated.load(Ordering::Relaxed)
    }

    /// Clear the consolidated marker.
    pub fn reset(&self) {
        self.consolidated.store(false, Ordering::Relaxed);
    }

    /// Plan a single-node consolidation: the first candidate (in order)
    /// whose removal-or-replacement survives validation wins.
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
        for candidate in disruptable {
            if cancel.is_cancelled() {
                return Command::no_op();
            }
            let prefix = std::slice::from_ref(&candidate);
            let mut cmd = match self.engine.compute(&snapshot, prefix, cancel) {
                Ok(cmd) => cmd,
                Err(_) => return Command::no_op(),
            };
            if cmd.action() == Action::NoOp {
                continue;
            }
            if cmd.action() == Action::Replace {
                let filtered = filter_out_same_type(&cmd.replacements[0], prefix);
                if filtered.is_empty() {
                    continue;
                }
                cmd.replacements[0].options = filtered;
            }

            let fresh = cluster.snapshot().await;
            let validator = Validator::new(&self.engine, self.engine.settings.consolidation_ttl);
            if !validator.is_valid(&cmd, &fresh, cancel) {
                debug!(node = %candidate.node.hostname(), "abandoning single-node consolidation due to churn");
                continue;
            }
            return cmd;
        }

        if !constrained_by_budgets {
            self.consolidated.store(true, Ordering::Relaxed);
        }
        Command::no_op()
    }
}
