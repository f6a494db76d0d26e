//! Resource accounting for pods, nodes, and instance types.
//!
//! Kubernetes expresses resources as string `Quantity` values. Scheduling
//! needs fast per-dimension arithmetic, so everything is converted once into
//! integer canonical units: cpu in millicores, memory and ephemeral-storage
//! in bytes, pods and extended resources in whole units.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use thiserror::Error;

/// The cpu resource name.
pub const RESOURCE_CPU: &str = "cpu";
/// The memory resource name.
pub const RESOURCE_MEMORY: &str = "memory";
/// The pods resource name (max pod count per node).
pub const RESOURCE_PODS: &str = "pods";
/// The ephemeral-storage resource name.
pub const RESOURCE_EPHEMERAL_STORAGE: &str = "ephemeral-storage";

/// Errors produced while parsing resource quantities.
#[derive(Debug, Error)]
pub enum ResourceError {
    /// A quantity string could not be parsed.
    #[error("invalid quantity for {0}: {1}")]
    InvalidQuantity(String, String),
}

/// A resource vector in canonical integer units.
///
/// Missing dimensions are treated as zero. Values are never negative;
/// subtraction saturates at zero.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Resources(BTreeMap<String, i64>);

impl Resources {
    /// Create an empty resource vector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a Kubernetes resource list (name -> Quantity) into canonical units.
    pub fn from_quantities(list: &BTreeMap<String, Quantity>) -> Result<Self, ResourceError> {
        let mut out = Self::new();
        for (name, quantity) in list {
            out.add_amount(name, parse_quantity(name, quantity)?);
        }
        Ok(out)
    }

    /// Get the amount for a resource, zero if absent.
    pub fn get(&self, name: &str) -> i64 {
        self.0.get(name).copied().unwrap_or(0)
    }

    /// Set the amount for a resource. Zero amounts are kept so that a
    /// kubelet-reported zero (e.g. an extended resource drained to zero)
    /// stays authoritative over "unknown".
    pub fn set(&mut self, name: impl Into<String>, amount: i64) {
        self.0.insert(name.into(), amount);
    }

    /// True if the resource name is present, even with a zero amount.
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Iterate over (name, amount) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// True if no dimensions are tracked.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Add an amount to a single dimension.
    pub fn add_amount(&mut self, name: &str, amount: i64) {
        *self.0.entry(name.to_string()).or_insert(0) += amount;
    }

    /// Component-wise addition.
    pub fn add(&mut self, other: &Resources) {
        for (name, amount) in other.iter() {
            self.add_amount(name, amount);
        }
    }

    /// Component-wise maximum, used to fold init-container requests into
    /// the pod total.
    pub fn component_max(&mut self, other: &Resources) {
        for (name, amount) in other.iter() {
            let entry = self.0.entry(name.to_string()).or_insert(0);
            *entry = (*entry).max(amount);
        }
    }

    /// Component-wise subtraction, saturating at zero.
    pub fn saturating_sub(&self, other: &Resources) -> Resources {
        let mut out = self.clone();
        for (name, amount) in other.iter() {
            let entry = out.0.entry(name.to_string()).or_insert(0);
            *entry = (*entry - amount).max(0);
        }
        out
    }

    /// Component-wise minimum across two vectors. Dimensions present in only
    /// one vector are treated as zero in the other, so the result only keeps
    /// what both can provide.
    pub fn component_min(&self, other: &Resources) -> Resources {
        let mut out = Resources::new();
        for (name, amount) in self.iter() {
            out.set(name, amount.min(other.get(name)));
        }
        // Dimensions only in `other` are implicitly zero in `self`.
        for (name, _) in other.iter() {
            if !self.contains(name) {
                out.set(name, 0);
            }
        }
        out
    }

    /// True iff every positive dimension of `self` is satisfied by
    /// `available`. Zero-quantity requests always fit, even for resources
    /// the other side does not provide at all.
    pub fn fits(&self, available: &Resources) -> bool {
        self.iter().all(|(name, amount)| amount <= 0 || amount <= available.get(name))
    }

    /// The dimensions of `self` that do not fit in `available`, for
    /// diagnostics on unschedulable pods.
    pub fn exceeding(&self, available: &Resources) -> Vec<String> {
        self.iter()
            .filter(|(name, amount)| *amount > 0 && *amount > available.get(name))
            .map(|(name, _)| name.to_string())
            .collect()
    }
}

impl fmt::Display for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, amount) in self.iter() {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{name}={amount}")?;
            first = false;
        }
        Ok(())
    }
}

impl FromIterator<(String, i64)> for Resources {
    fn from_iter<T: IntoIterator<Item = (String, i64)>>(iter: T) -> Self {
        Resources(iter.into_iter().collect())
    }
}

/// Parse a quantity into the canonical unit for its resource: millicores for
/// cpu, raw units (bytes for memory-like resources) for everything else.
///
/// Handles plain decimals, the `m` milli suffix, decimal suffixes
/// (`K`/`M`/`G`/`T`/`P`/`E`) and binary suffixes (`Ki`/`Mi`/`Gi`/`Ti`/`Pi`/`Ei`).
pub fn parse_quantity(resource: &str, quantity: &Quantity) -> Result<i64, ResourceError> {
    let raw = quantity.0.trim();
    let invalid = || ResourceError::InvalidQuantity(resource.to_string(), quantity.0.clone());

    let (number, multiplier) = split_suffix(raw);
    let value: f64 = number.parse().map_err(|_| invalid())?;
    if !value.is_finite() || value < 0.0 {
        return Err(invalid());
    }

    let scaled = match multiplier {
        Multiplier::Milli => {
            if resource == RESOURCE_CPU {
                value
            } else {
                // Non-cpu milli quantities (kubelet sometimes reports memory
                // this way) round up to whole canonical units.
                (value / 1000.0).ceil()
            }
        }
        Multiplier::Unit(m) => {
            let scale = if resource == RESOURCE_CPU { 1000.0 } else { 1.0 };
            value * m * scale
        }
    };

    Ok(scaled.round() as i64)
}

enum Multiplier {
    /// The `m` suffix: one-thousandth of the base unit.
    Milli,
    /// A whole-unit multiplier (1 for no suffix).
    Unit(f64),
}

fn split_suffix(raw: &str) -> (&str, Multiplier) {
    const BINARY: [(&str, f64); 6] = [
        ("Ki", 1024.0),
        ("Mi", 1024.0 * 1024.0),
        ("Gi", 1024.0 * 1024.0 * 1024.0),
        ("Ti", 1024.0 * 1024.0 * 1024.0 * 1024.0),
        ("Pi", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
        ("Ei", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ];
    const DECIMAL: [(&str, f64); 6] = [
        ("k", 1e3),
        ("K", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
        ("P", 1e15),
    ];

    for (suffix, multiplier) in BINARY {
        if let Some(number) = raw.strip_suffix(suffix) {
            return (number, Multiplier::Unit(multiplier));
        }
    }
    if let Some(number) = raw.strip_suffix('E') {
        return (number, Multiplier::Unit(1e18));
    }
    for (suffix, multiplier) in DECIMAL {
        if let Some(number) = raw.strip_suffix(suffix) {
            return (number, Multiplier::Unit(multiplier));
        }
    }
    if let Some(number) = raw.strip_suffix('m') {
        return (number, Multiplier::Milli);
    }
    (raw, Multiplier::Unit(1.0))
}

/// Total scheduling requests for a pod: the sum of container requests,
/// component-max'd with the largest init container, plus runtime-class
/// overhead, plus one `pods` slot.
pub fn pod_requests(pod: &Pod) -> Result<Resources, ResourceError> {
    let mut total = Resources::new();
    let Some(spec) = pod.spec.as_ref() else {
        total.set(RESOURCE_PODS, 1);
        return Ok(total);
    };

    for container in &spec.containers {
        if let Some(requests) = container.resources.as_ref().and_then(|r| r.requests.as_ref()) {
            total.add(&Resources::from_quantities(requests)?);
        }
    }

    let mut init_max = Resources::new();
    for container in spec.init_containers.iter().flatten() {
        if let Some(requests) = container.resources.as_ref().and_then(|r| r.requests.as_ref()) {
            init_max.component_max(&Resources::from_quantities(requests)?);
        }
    }
    total.component_max(&init_max);

    if let Some(overhead) = spec.overhead.as_ref() {
        total.add(&Resources::from_quantities(overhead)?);
    }

    total.add_amount(RESOURCE_PODS, 1);
    Ok(total)
}
