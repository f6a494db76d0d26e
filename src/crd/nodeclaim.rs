//! NodeClaim Custom Resource Definition
//!
//! A NodeClaim is a request for one new node against a pool. The scheduler
//! emits claims with the requirements it accumulated for a node template;
//! the cloud driver resolves them into a concrete machine, and the claim's
//! status walks Pending -> Launched -> Registered -> Initialized. The only
//! non-monotonic transition allowed is into Terminating.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Taint;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::RequirementSpec;
use crate::requirements::Requirements;

/// Specification for a NodeClaim.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "gantry.dev",
    version = "v1alpha1",
    kind = "NodeClaim",
    plural = "nodeclaims",
    shortname = "nc",
    status = "NodeClaimStatus",
    namespaced = false,
    printcolumn = r#"{"name":"Pool","type":"string","jsonPath":".spec.nodePool"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Node","type":"string","jsonPath":".status.nodeName"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NodeClaimSpec {
    /// The pool this claim was created against.
    pub node_pool: String,

    /// Accumulated requirements, including the chosen zone, capacity-type
    /// and instance-type subsets.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requirements: Vec<RequirementSpec>,

    /// Resource requests from the pods the scheduler intends to place here.
    #[serde(default)]
    pub resources: ResourceRequestsSpec,

    /// Taints copied from the pool template.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<Taint>,

    /// Startup taints copied from the pool template.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub startup_taints: Vec<Taint>,
}

/// Resource requests carried on a NodeClaim spec.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequestsSpec {
    /// Requested amounts per resource name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, Quantity>,
}

/// Lifecycle phase of a NodeClaim.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum NodeClaimPhase {
    /// Created, machine not yet requested from the cloud provider.
    #[default]
    Pending,
    /// The cloud provider accepted the request and returned a provider ID.
    Launched,
    /// The corresponding Node object has appeared in the cluster.
    Registered,
    /// Startup taints are gone and allocatable has been published.
    Initialized,
    /// The claim is being torn down.
    Terminating,
}

impl NodeClaimPhase {
    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Launched => 1,
            Self::Registered => 2,
            Self::Initialized => 3,
            Self::Terminating => 4,
        }
    }

    /// Transitions are monotonic except that Terminating is reachable from
    /// any phase.
    pub fn can_transition_to(self, next: NodeClaimPhase) -> bool {
        next == Self::Terminating || next.rank() == self.rank() + 1
    }
}

/// Status for a NodeClaim.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeClaimStatus {
    /// Current lifecycle phase.
    #[serde(default)]
    pub phase: NodeClaimPhase,

    /// Provider ID of the backing machine, once launched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,

    /// Name of the Node object, once registered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,

    /// The instance type the cloud provider resolved the claim to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,

    /// Raw machine capacity, once known.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub capacity: BTreeMap<String, Quantity>,

    /// Allocatable resources, once known.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub allocatable: BTreeMap<String, Quantity>,

    /// Labels the node will carry, resolved at launch.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl NodeClaim {
    /// The claim's requirement bag.
    pub fn requirements(&self) -> Requirements {
        self.spec.requirements.iter().map(Into::into).collect()
    }

    /// True once the claim reached Initialized.
    pub fn is_initialized(&self) -> bool {
        self.status.as_ref().map_or(false, |s| s.phase == NodeClaimPhase::Initialized)
    }

    /// True once the claim entered Terminating.
    pub fn is_terminating(&self) -> bool {
        self.status.as_ref().map_or(false, |s| s.phase == NodeClaimPhase::Terminating)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_advance_monotonically() {
        use NodeClaimPhase::*;
        assert!(Pending.can_transition_to(Launched));
        assert!(Launched.can_transition_to(Registered));
        assert!(Registered.can_transition_to(Initialized));

        assert!(!Pending.can_transition_to(Registered));
        assert!(!Initialized.can_transition_to(Pending));
        assert!(!Registered.can_transition_to(Launched));
    }

    #[test]
    fn terminating_is_reachable_from_anywhere() {
        use NodeClaimPhase::*;
        for phase in [Pending, Launched, Registered, Initialized] {
            assert!(phase.can_transition_to(Terminating));
        }
        assert!(!Terminating.can_transition_to(Initialized));
    }

    #[test]
    fn requirements_round_trip_through_spec() {
        use crate::labels::LABEL_ZONE;
        use crate::requirements::Operator;

        let claim = NodeClaim::new(
            "claim-1",
            NodeClaimSpec {
                node_pool: "default".to_string(),
                requirements: vec![super::super::RequirementSpec {
                    key: LABEL_ZONE.to_string(),
                    operator: Operator::In,
                    values: vec!["zone-2".to_string()],
                }],
                ..Default::default()
            },
        );

        let reqs = claim.requirements();
        assert_eq!(reqs.get(LABEL_ZONE).unwrap().single_value(), Some("zone-2"));
    }
}
