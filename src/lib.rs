//! Gantry - workload-aware node autoscaler core for Kubernetes
//!
//! Gantry watches pending pods that cannot fit on existing cluster nodes,
//! decides what new nodes to create so those pods can run, and later
//! removes or replaces nodes that have become redundant or inefficient.
//!
//! # Architecture
//!
//! A scheduling pass operates on an immutable snapshot of cluster state:
//! pods are fitted onto existing capacity first (initialized nodes, then
//! in-flight NodeClaims), then onto node templates assembled from NodePool
//! definitions and the cloud provider's instance-type catalog. Disruption
//! runs the same scheduler in reverse: it simulates the cluster without a
//! set of candidate nodes and only emits a command when everything still
//! schedules at a lower price.
//!
//! # Modules
//!
//! - [`crd`] - NodePool and NodeClaim custom resources
//! - [`requirements`] - label-selector requirement algebra
//! - [`resources`] - resource vectors and quantity parsing
//! - [`labels`] - well-known labels and the restricted-label policy
//! - [`pods`] - pod inspection helpers (tolerations, affinity, ownership)
//! - [`cloud`] - instance-type catalog and the cloud-provider seam
//! - [`state`] - the in-memory cluster mirror and its snapshots
//! - [`scheduling`] - the scheduling pass (topology, volumes, templates)
//! - [`provisioning`] - pod batching and NodeClaim creation
//! - [`disruption`] - consolidation planning and validation
//! - [`config`] - runtime settings and feature gates
//! - [`error`] - error types

#![deny(missing_docs)]

pub mod cloud;
pub mod config;
pub mod crd;
pub mod disruption;
pub mod error;
pub mod labels;
pub mod pods;
pub mod provisioning;
pub mod requirements;
pub mod resources;
pub mod scheduling;
pub mod state;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::Error;

/// Result type alias using the crate error type.
pub type Result<T> = std::result::Result<T, Error>;

/// The API group of the gantry CRDs.
pub const API_GROUP: &str = "gantry.dev";

/// The API version of the gantry CRDs.
pub const API_VERSION: &str = "v1alpha1";
