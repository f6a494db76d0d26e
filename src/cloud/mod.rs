//! Instance-type catalog and the cloud-provider interface.
//!
//! An [`InstanceType`] is the typed description of an instance family:
//! resources, requirements, and the purchasable offerings (zone x
//! capacity-type x price x availability). The catalog is immutable after
//! load; refreshes swap in a new snapshot. The [`CloudProvider`] trait is
//! the thin seam to the driver that actually instantiates machines.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

use crate::crd::{NodeClaim, NodePool};
use crate::labels::{LABEL_CAPACITY_TYPE, LABEL_INSTANCE_TYPE, LABEL_ZONE};
use crate::requirements::{Requirement, Requirements};
use crate::resources::Resources;

/// A purchasable (zone, capacity-type, price, availability) tuple.
#[derive(Clone, Debug, PartialEq)]
pub struct Offering {
    /// Availability zone.
    pub zone: String,
    /// Purchase option, e.g. `on-demand` or `spot`.
    pub capacity_type: String,
    /// Hourly price; non-negative.
    pub price: f64,
    /// Whether capacity is currently purchasable.
    pub available: bool,
}

/// An instance family the cloud can provide.
///
/// Immutable after load; shared via `Arc` between the catalog, node
/// templates, and in-flight claims.
#[derive(Clone, Debug)]
pub struct InstanceType {
    /// Instance type name, e.g. `m5.large`.
    pub name: String,
    /// Raw machine capacity.
    pub capacity: Resources,
    /// System-reserved plus kubelet overhead, subtracted from capacity.
    pub overhead: Resources,
    /// Requirements this type satisfies (architecture, OS, its own name,
    /// and the zones and capacity types of its offerings).
    pub requirements: Requirements,
    /// Ordered offerings.
    pub offerings: Vec<Offering>,
}

impl InstanceType {
    /// Assemble an instance type, deriving the zone, capacity-type and
    /// instance-type requirements from the offerings so the catalog and the
    /// requirement algebra can never disagree.
    pub fn new(
        name: impl Into<String>,
        capacity: Resources,
        overhead: Resources,
        mut requirements: Requirements,
        offerings: Vec<Offering>,
    ) -> Arc<Self> {
        let name = name.into();
        requirements.add(Requirement::in_values(LABEL_INSTANCE_TYPE, [name.clone()]));
        let zones: BTreeSet<&str> = offerings.iter().map(|o| o.zone.as_str()).collect();
        requirements.add(Requirement::in_values(LABEL_ZONE, zones));
        let capacity_types: BTreeSet<&str> =
            offerings.iter().map(|o| o.capacity_type.as_str()).collect();
        requirements.add(Requirement::in_values(LABEL_CAPACITY_TYPE, capacity_types));
        Arc::new(Self { name, capacity, overhead, requirements, offerings })
    }

    /// Allocatable resources: capacity minus overhead, floored at zero.
    pub fn allocatable(&self) -> Resources {
        self.capacity.saturating_sub(&self.overhead)
    }

    /// Look up the offering for an exact (capacity-type, zone) pair.
    pub fn offering(&self, capacity_type: &str, zone: &str) -> Option<&Offering> {
        self.offerings
            .iter()
            .find(|o| o.capacity_type == capacity_type && o.zone == zone)
    }

    /// The cheapest available offering satisfying the zone and
    /// capacity-type requirements, if any.
    pub fn cheapest_offering(&self, requirements: &Requirements) -> Option<&Offering> {
        self.offerings
            .iter()
            .filter(|o| {
                o.available
                    && requirements.intersects(LABEL_ZONE, &o.zone)
                    && requirements.intersects(LABEL_CAPACITY_TYPE, &o.capacity_type)
            })
            .min_by(|a, b| a.price.total_cmp(&b.price))
    }

    /// True iff this type's requirements intersect the claim's on every key
    /// and at least one available offering satisfies the zone and
    /// capacity-type requirements.
    pub fn compatible_with(&self, requirements: &Requirements) -> bool {
        self.requirements.compatible(requirements).is_ok()
            && self.cheapest_offering(requirements).is_some()
    }
}

/// Retain the options compatible with the requirements.
pub fn compatible(
    options: &[Arc<InstanceType>],
    requirements: &Requirements,
) -> Vec<Arc<InstanceType>> {
    options.iter().filter(|it| it.compatible_with(requirements)).cloned().collect()
}

/// Retain the options whose minimum satisfying offering price is strictly
/// less than `max_price`.
pub fn filter_by_price(
    options: &[Arc<InstanceType>],
    requirements: &Requirements,
    max_price: f64,
) -> Vec<Arc<InstanceType>> {
    options
        .iter()
        .filter(|it| {
            it.cheapest_offering(requirements).is_some_and(|o| o.price < max_price)
        })
        .cloned()
        .collect()
}

/// Retain the options whose allocatable satisfies the requests on every
/// dimension.
pub fn filter_by_resources(
    options: &[Arc<InstanceType>],
    requests: &Resources,
) -> Vec<Arc<InstanceType>> {
    options.iter().filter(|it| requests.fits(&it.allocatable())).cloned().collect()
}

/// The lowest price any option can satisfy the requirements at.
pub fn cheapest_price(options: &[Arc<InstanceType>], requirements: &Requirements) -> Option<f64> {
    options
        .iter()
        .filter_map(|it| it.cheapest_offering(requirements).map(|o| o.price))
        .min_by(f64::total_cmp)
}

/// Sort options by their cheapest satisfying offering, unsatisfiable last.
pub fn sort_by_price(options: &mut [Arc<InstanceType>], requirements: &Requirements) {
    options.sort_by(|a, b| {
        let pa = a.cheapest_offering(requirements).map(|o| o.price).unwrap_or(f64::MAX);
        let pb = b.cheapest_offering(requirements).map(|o| o.price).unwrap_or(f64::MAX);
        pa.total_cmp(&pb)
    });
}

/// A machine the provider has created for a claim.
#[derive(Clone, Debug, PartialEq)]
pub struct CreatedMachine {
    /// Cloud provider ID, unique per machine.
    pub provider_id: String,
    /// The node name the machine will register as.
    pub node_name: String,
    /// The instance type the provider resolved the claim to.
    pub instance_type: String,
    /// The zone the machine landed in.
    pub zone: String,
    /// The capacity type purchased.
    pub capacity_type: String,
}

/// An existing machine reported by the provider, for reconciliation.
#[derive(Clone, Debug, PartialEq)]
pub struct Machine {
    /// Cloud provider ID.
    pub provider_id: String,
    /// Instance type name, when the provider reports it.
    pub instance_type: Option<String>,
}

/// Cloud provider failures.
#[derive(Debug, Error)]
pub enum CloudProviderError {
    /// The provider had no capacity for the listed instance types; retriable
    /// against the claim's remaining options.
    #[error("insufficient capacity for instance types {0:?}")]
    InsufficientCapacity(Vec<String>),

    /// The claim can never be satisfied as configured; fatal for the claim.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Any other provider failure; retried at the controller level.
    #[error("provider error: {0}")]
    Provider(String),
}

impl CloudProviderError {
    /// True if the operation may succeed against other instance-type options.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::InsufficientCapacity(_) | Self::Provider(_))
    }
}

/// The seam to the driver that actually instantiates machines.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// The instance types a pool may launch, with current offerings.
    async fn get_instance_types(
        &self,
        pool: &NodePool,
    ) -> Result<Vec<Arc<InstanceType>>, CloudProviderError>;

    /// Create a machine for the claim, choosing among its instance-type
    /// options.
    async fn create(&self, claim: &NodeClaim) -> Result<CreatedMachine, CloudProviderError>;

    /// Delete the machine with the given provider ID; idempotent.
    async fn delete(&self, provider_id: &str) -> Result<(), CloudProviderError>;

    /// List existing machines, for reconciliation.
    async fn list(&self) -> Result<Vec<Machine>, CloudProviderError>;
}
