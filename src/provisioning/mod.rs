//! Provisioning orchestration: batch pending pods, run a scheduling pass,
//! and create the resulting NodeClaims through the cloud provider.

mod batcher;

pub use batcher::Batcher;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cloud::{CloudProvider, CloudProviderError};
use crate::config::Settings;
use crate::crd::{NodeClaimPhase, NodeClaimStatus, NodePool};
use crate::error::Error;
use crate::pods;
use crate::scheduling::{Scheduler, Unschedulable};
use crate::state::ClusterState;

/// What one provisioning pass did.
#[derive(Clone, Debug, Default)]
pub struct ProvisionReport {
    /// Names of the NodeClaims created.
    pub created: Vec<String>,
    /// Claims that failed fatally, with the reason.
    pub failed: Vec<(String, String)>,
    /// Pods bound to existing or in-flight capacity.
    pub bound: usize,
    /// Pods that could not be placed.
    pub unschedulable: Vec<Unschedulable>,
    /// True when the pass was abandoned via cancellation.
    pub cancelled: bool,
}

/// Runs scheduling passes and materializes their claims.
pub struct Provisioner<C: CloudProvider> {
    cloud: Arc<C>,
    cluster: Arc<ClusterState>,
    settings: Settings,
    sequence: AtomicU64,
}

impl<C: CloudProvider> Provisioner<C> {
    /// Create a provisioner.
    pub fn new(cloud: Arc<C>, cluster: Arc<ClusterState>, settings: Settings) -> Self {
        Self { cloud, cluster, settings, sequence: AtomicU64::new(0) }
    }

    /// Schedule the pending pods and create the nodes they need.
    pub async fn provision(
        &self,
        pools: Vec<NodePool>,
        mut pending: Vec<Pod>,
        cancel: &CancellationToken,
    ) -> Result<ProvisionReport, Error> {
        let mut report = ProvisionReport::default();
        pending.retain(pods::is_pending_unscheduled);
        if pending.is_empty() {
            return Ok(report);
        }

        let valid_pools: Vec<NodePool> = pools
            .into_iter()
            .filter(|pool| match pool.validate(&self.settings.allowed_label_domains) {
                Ok(()) => true,
                Err(err) => {
                    warn!(pool = %pool.name_any(), error = %err, "skipping invalid node pool");
                    false
                }
            })
            .collect();
        let fetched = futures::future::join_all(
            valid_pools.iter().map(|pool| self.cloud.get_instance_types(pool)),
        )
        .await;
        let mut pool_types = Vec::with_capacity(valid_pools.len());
        for (pool, types) in valid_pools.into_iter().zip(fetched) {
            pool_types.push((pool, types?));
        }

        let batch_by_key: HashMap<String, Pod> =
            pending.iter().map(|p| (pods::pod_key(p), p.clone())).collect();

        let snapshot = self.cluster.snapshot().await;
        let results = match Scheduler::new(
            &snapshot,
            pool_types,
            self.settings.allowed_label_domains.clone(),
            cancel.clone(),
        )
        .schedule(pending)
        {
            Ok(results) => results,
            Err(_) => {
                report.cancelled = true;
                return Ok(report);
            }
        };

        for unschedulable in &results.unschedulable {
            warn!(
                pod = %unschedulable.pod.name_any(),
                reason = %unschedulable.reason,
                "pod cannot be scheduled"
            );
        }
        report.unschedulable = results.unschedulable;

        for proposal in results.new_claims {
            let mut proposal = proposal;
            loop {
                if proposal.options.is_empty() {
                    report.failed.push((
                        proposal.pool_name.clone(),
                        "no instance type option could be launched".to_string(),
                    ));
                    break;
                }
                let name = format!(
                    "{}-{}",
                    proposal.pool_name,
                    self.sequence.fetch_add(1, Ordering::Relaxed)
                );
                let claim = proposal.to_node_claim(&name);
                match self.cloud.create(&claim).await {
                    Ok(machine) => {
                        let mut launched = claim;
                        let mut labels = proposal.requirements.single_valued_labels();
                        labels.insert(
                            crate::labels::LABEL_INSTANCE_TYPE.to_string(),
                            machine.instance_type.clone(),
                        );
                        labels.insert(crate::labels::LABEL_ZONE.to_string(), machine.zone.clone());
                        labels.insert(
                            crate::labels::LABEL_CAPACITY_TYPE.to_string(),
                            machine.capacity_type.clone(),
                        );
                        labels.remove(crate::labels::LABEL_HOSTNAME);
                        launched.status = Some(NodeClaimStatus {
                            phase: NodeClaimPhase::Launched,
                            provider_id: Some(machine.provider_id.clone()),
                            node_name: Some(machine.node_name.clone()),
                            instance_type: Some(machine.instance_type.clone()),
                            labels,
                            ..Default::default()
                        });
                        self.cluster
                            .update_node_claim(launched, proposal.options.clone())
                            .await;
                        for key in &proposal.pod_keys {
                            if let Some(pod) = batch_by_key.get(key) {
                                if let Err(err) = self
                                    .cluster
                                    .nominate_pod(pod.clone(), &machine.node_name)
                                    .await
                                {
                                    debug!(pod = %key, error = %err, "could not reserve pod on new node");
                                }
                            }
                        }
                        info!(
                            claim = %name,
                            instance_type = %machine.instance_type,
                            zone = %machine.zone,
                            pods = proposal.pod_keys.len(),
                            "launched node claim"
                        );
                        report.created.push(name);
                        break;
                    }
                    Err(CloudProviderError::InsufficientCapacity(exhausted)) => {
                        warn!(
                            claim = %name,
                            exhausted = ?exhausted,
                            "insufficient capacity, retrying with remaining options"
                        );
                        proposal.options.retain(|it| !exhausted.contains(&it.name));
                    }
                    Err(err @ CloudProviderError::InvalidConfig(_)) => {
                        warn!(claim = %name, error = %err, "node claim failed fatally");
                        report.failed.push((name, err.to_string()));
                        break;
                    }
                    Err(err) => {
                        // Transient failures re-enter on the next pass via
                        // controller-level backoff.
                        warn!(claim = %name, error = %err, "node claim creation failed");
                        report.failed.push((name, err.to_string()));
                        break;
                    }
                }
            }
        }

        for binding in &results.bindings {
            match self.cluster.nominate_pod(binding.pod.clone(), &binding.node_name).await {
                Ok(()) => report.bound += 1,
                Err(err) => {
                    debug!(
                        pod = %binding.pod.name_any(),
                        node = %binding.node_name,
                        error = %err,
                        "binding target vanished, pod re-enters next pass"
                    );
                }
            }
        }

        Ok(report)
    }
}
