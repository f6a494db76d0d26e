//! Custom Resource Definitions for gantry.
//!
//! - [`NodePool`] - a template for the nodes gantry may create
//! - [`NodeClaim`] - a request for one new node against a pool

mod nodeclaim;
mod nodepool;

pub use nodeclaim::{NodeClaim, NodeClaimPhase, NodeClaimSpec, NodeClaimStatus, ResourceRequestsSpec};
pub use nodepool::{Budget, DisruptionSpec, NodeClaimTemplateSpec, NodePool, NodePoolSpec, NodePoolStatus};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::requirements::{Operator, Requirement};

/// A single label-selector requirement as it appears in CRD specs.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RequirementSpec {
    /// The label key.
    pub key: String,
    /// The operator.
    pub operator: Operator,
    /// Operand values; omitted for Exists/DoesNotExist.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

impl From<&RequirementSpec> for Requirement {
    fn from(spec: &RequirementSpec) -> Self {
        Requirement::new(spec.key.clone(), spec.operator, spec.values.clone())
    }
}

impl From<&Requirement> for RequirementSpec {
    fn from(req: &Requirement) -> Self {
        RequirementSpec {
            key: req.key.clone(),
            operator: req.operator,
            values: req.values.clone(),
        }
    }
}
