//! Command validation: re-check a consolidation command against a fresh
//! snapshot before emitting it, abandoning on pod churn.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cloud::InstanceType;
use crate::pods;
use crate::state::Snapshot;

use super::{Action, Candidate, Command, ConsolidationEngine};

/// Validates commands within a short freshness window.
pub struct Validator<'a> {
    engine: &'a ConsolidationEngine,
    ttl: Duration,
    started: Instant,
}

impl<'a> Validator<'a> {
    /// Create a validator; the freshness window starts now.
    pub fn new(engine: &'a ConsolidationEngine, ttl: Duration) -> Self {
        Self { engine, ttl, started: Instant::now() }
    }

    /// True iff the command still holds against the fresh snapshot:
    /// every victim still exists with exactly the pods that were accounted
    /// for, and the simulation still schedules everything within the
    /// command's replacements. Churn is not an error; it just invalidates.
    pub fn is_valid(&self, command: &Command, fresh: &Snapshot, cancel: &CancellationToken) -> bool {
        if self.started.elapsed() > self.ttl {
            debug!("validation window expired");
            return false;
        }

        let catalog: HashMap<String, Arc<InstanceType>> = self
            .engine
            .pools
            .iter()
            .flat_map(|(_, types)| types.iter())
            .map(|it| (it.name.clone(), it.clone()))
            .collect();

        let mut fresh_candidates = Vec::with_capacity(command.candidates.len());
        for victim in &command.candidates {
            let key = victim.node.key();
            let Some(node) = fresh.nodes.iter().find(|n| n.key() == key) else {
                debug!(node = %victim.node.hostname(), "victim disappeared");
                return false;
            };
            let Some(candidate) = Candidate::build(node, fresh, &catalog) else {
                debug!(node = %victim.node.hostname(), "victim is no longer disruptable");
                return false;
            };

            // A pod that landed on a victim after planning was not part of
            // the simulation.
            let planned: BTreeSet<String> =
                victim.pods.iter().map(pods::pod_key).collect();
            let current: BTreeSet<String> =
                candidate.pods.iter().map(pods::pod_key).collect();
            if !current.is_subset(&planned) {
                debug!(node = %victim.node.hostname(), "victim gained unaccounted pods");
                return false;
            }
            fresh_candidates.push(candidate);
        }

        let Ok(results) = self.engine.simulate(fresh, &fresh_candidates, cancel) else {
            return false;
        };
        if !results.all_pods_scheduled() {
            debug!("fresh simulation strands pods");
            return false;
        }
        // The cluster must not need more new capacity than the command
        // provides.
        if results.new_claims.len() > command.replacements.len() {
            debug!(
                needed = results.new_claims.len(),
                provided = command.replacements.len(),
                "fresh simulation needs more replacements"
            );
            return false;
        }
        match command.action() {
            Action::NoOp => true,
            Action::Delete | Action::Replace => {
                !command.candidates.is_empty()
                    && command.replacements.iter().all(|r| !r.options.is_empty())
            }
        }
    }
}
