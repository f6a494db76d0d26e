//! NodePool Custom Resource Definition
//!
//! A NodePool is a template for the nodes gantry may create: base
//! requirements, taints, startup taints, labels, a disruption budget, and a
//! weight used to break ties between pools.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Taint;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::RequirementSpec;
use crate::labels::{self, LABEL_NODEPOOL};
use crate::requirements::{Requirement, Requirements};
use crate::Error;

/// Specification for a NodePool.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "gantry.dev",
    version = "v1alpha1",
    kind = "NodePool",
    plural = "nodepools",
    shortname = "np",
    status = "NodePoolStatus",
    namespaced = false,
    printcolumn = r#"{"name":"Weight","type":"integer","jsonPath":".spec.weight"}"#,
    printcolumn = r#"{"name":"Nodes","type":"integer","jsonPath":".status.nodeCount"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolSpec {
    /// Tiebreak among pools that can all satisfy a pod; higher wins.
    #[serde(default)]
    pub weight: i32,

    /// Template applied to every node created from this pool.
    pub template: NodeClaimTemplateSpec,

    /// Disruption policy for nodes owned by this pool.
    #[serde(default)]
    pub disruption: DisruptionSpec,
}

/// The node template embedded in a NodePool.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeClaimTemplateSpec {
    /// Static labels stamped onto created nodes.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Base requirements constraining which instance types and offerings
    /// the pool may use.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requirements: Vec<RequirementSpec>,

    /// Taints applied to created nodes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<Taint>,

    /// Taints present only until the node initializes; pods scheduled by
    /// gantry need not tolerate them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub startup_taints: Vec<Taint>,
}

/// Disruption policy for a NodePool.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DisruptionSpec {
    /// Budgets capping concurrent disruptions. The effective cap is the
    /// minimum across budgets; absent budgets default to 10%.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub budgets: Vec<Budget>,
}

/// A cap on concurrent disruptions, as a node count or percentage.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Budget {
    /// Either an absolute count ("5") or a percentage ("20%") of the pool's
    /// current nodes.
    pub nodes: String,
}

impl DisruptionSpec {
    /// Resolve the number of nodes that may be disrupted concurrently, given
    /// the pool's current node count. Unparsable budgets count as zero.
    pub fn allowed_disruptions(&self, pool_nodes: usize) -> usize {
        if self.budgets.is_empty() {
            // Default budget: 10% of the pool, at least one node.
            return ((pool_nodes as f64 * 0.10).floor() as usize).max(1).min(pool_nodes.max(1));
        }
        self.budgets
            .iter()
            .map(|budget| budget.allowed(pool_nodes))
            .min()
            .unwrap_or(0)
    }
}

impl Budget {
    fn allowed(&self, pool_nodes: usize) -> usize {
        if let Some(percent) = self.nodes.strip_suffix('%') {
            match percent.trim().parse::<f64>() {
                Ok(pct) if pct >= 0.0 => (pool_nodes as f64 * pct / 100.0).floor() as usize,
                _ => 0,
            }
        } else {
            self.nodes.trim().parse::<usize>().unwrap_or(0)
        }
    }
}

/// Status for a NodePool.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolStatus {
    /// Number of nodes currently owned by this pool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_count: Option<u32>,
}

impl NodePool {
    /// The pool's scheduling requirements: its template labels, its explicit
    /// requirements, and the ownership label pinning nodes to this pool.
    pub fn requirements(&self) -> Requirements {
        let mut reqs = Requirements::from_labels(&self.spec.template.labels);
        for spec in &self.spec.template.requirements {
            reqs.add(spec.into());
        }
        reqs.add(Requirement::in_values(LABEL_NODEPOOL, [self.name_any()]));
        reqs
    }

    /// Validate the pool spec: requirement keys must not touch restricted
    /// domains and the requirements must be satisfiable on their own.
    pub fn validate(&self, extra_allowed_domains: &[String]) -> Result<(), Error> {
        for spec in &self.spec.template.requirements {
            // The pool may pin its own well-known labels, but not invent
            // keys inside orchestrator domains.
            labels::validate_requirement_key(&spec.key, extra_allowed_domains)?;
        }
        for key in self.spec.template.labels.keys() {
            labels::validate_requirement_key(key, extra_allowed_domains)?;
        }
        let reqs = self.requirements();
        if !reqs.is_satisfiable() {
            return Err(Error::validation(format!(
                "node pool {} has conflicting requirements: {}",
                self.name_any(),
                reqs.conflicts().join("; ")
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::LABEL_ZONE;
    use crate::requirements::Operator;

    fn sample_pool(name: &str) -> NodePool {
        let mut pool = NodePool::new(
            name,
            NodePoolSpec {
                weight: 10,
                template: NodeClaimTemplateSpec {
                    labels: BTreeMap::from([("team".to_string(), "platform".to_string())]),
                    requirements: vec![RequirementSpec {
                        key: LABEL_ZONE.to_string(),
                        operator: Operator::In,
                        values: vec!["zone-1".to_string(), "zone-2".to_string()],
                    }],
                    ..Default::default()
                },
                disruption: DisruptionSpec::default(),
            },
        );
        pool.metadata.name = Some(name.to_string());
        pool
    }

    #[test]
    fn pool_requirements_include_ownership_label() {
        let pool = sample_pool("default");
        let reqs = pool.requirements();

        assert_eq!(reqs.get(LABEL_NODEPOOL).unwrap().single_value(), Some("default"));
        assert_eq!(reqs.get("team").unwrap().single_value(), Some("platform"));
        assert!(reqs.intersects(LABEL_ZONE, "zone-1"));
        assert!(!reqs.intersects(LABEL_ZONE, "zone-9"));
    }

    #[test]
    fn validate_rejects_restricted_template_keys() {
        let mut pool = sample_pool("default");
        pool.spec.template.requirements.push(RequirementSpec {
            key: "kubernetes.io/private".to_string(),
            operator: Operator::Exists,
            values: vec![],
        });
        assert!(pool.validate(&[]).is_err());
    }

    #[test]
    fn validate_rejects_conflicting_requirements() {
        let mut pool = sample_pool("default");
        pool.spec.template.requirements.push(RequirementSpec {
            key: LABEL_ZONE.to_string(),
            operator: Operator::In,
            values: vec!["zone-9".to_string()],
        });
        let err = pool.validate(&[]).unwrap_err();
        assert!(err.to_string().contains("conflicting requirements"));
    }

    #[test]
    fn absolute_budget_caps_disruptions() {
        let disruption = DisruptionSpec { budgets: vec![Budget { nodes: "3".to_string() }] };
        assert_eq!(disruption.allowed_disruptions(10), 3);
        assert_eq!(disruption.allowed_disruptions(0), 3);
    }

    #[test]
    fn percentage_budget_scales_with_pool_size() {
        let disruption = DisruptionSpec { budgets: vec![Budget { nodes: "20%".to_string() }] };
        assert_eq!(disruption.allowed_disruptions(10), 2);
        assert_eq!(disruption.allowed_disruptions(4), 0);
    }

    #[test]
    fn minimum_budget_wins() {
        let disruption = DisruptionSpec {
            budgets: vec![
                Budget { nodes: "50%".to_string() },
                Budget { nodes: "2".to_string() },
            ],
        };
        assert_eq!(disruption.allowed_disruptions(10), 2);
    }

    #[test]
    fn default_budget_is_ten_percent_with_floor_of_one() {
        let disruption = DisruptionSpec::default();
        assert_eq!(disruption.allowed_disruptions(30), 3);
        assert_eq!(disruption.allowed_disruptions(5), 1);
    }
}
