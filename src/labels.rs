//! Well-known node label keys and the restricted-label policy.
//!
//! Gantry reserves its own domain for labels it injects, and refuses pod
//! requirements on orchestrator-owned domains except for a fixed set of
//! well-known keys and sub-domains that kubelets and admission controllers
//! legitimately populate.

use std::collections::BTreeSet;

use crate::error::Error;

/// The hostname topology label.
pub const LABEL_HOSTNAME: &str = "kubernetes.io/hostname";
/// The CPU architecture label.
pub const LABEL_ARCH: &str = "kubernetes.io/arch";
/// The operating system label.
pub const LABEL_OS: &str = "kubernetes.io/os";
/// The instance type label.
pub const LABEL_INSTANCE_TYPE: &str = "node.kubernetes.io/instance-type";
/// The zone topology label.
pub const LABEL_ZONE: &str = "topology.kubernetes.io/zone";
/// The region topology label.
pub const LABEL_REGION: &str = "topology.kubernetes.io/region";

/// The label carrying the owning node pool name on nodes gantry creates.
pub const LABEL_NODEPOOL: &str = "gantry.dev/nodepool";
/// The label carrying the purchase option of the node's offering.
pub const LABEL_CAPACITY_TYPE: &str = "gantry.dev/capacity-type";

/// The on-demand capacity type value.
pub const CAPACITY_TYPE_ON_DEMAND: &str = "on-demand";
/// The spot capacity type value.
pub const CAPACITY_TYPE_SPOT: &str = "spot";

/// Domains reserved for the orchestrator and for gantry itself.
pub const RESTRICTED_DOMAINS: [&str; 3] = ["kubernetes.io", "k8s.io", "gantry.dev"];

/// Sub-domains of restricted domains that pods may constrain anyway.
pub const ALLOWED_SUBDOMAINS: [&str; 2] = ["node.kubernetes.io", "node-restriction.kubernetes.io"];

/// Well-known keys inside restricted domains that scheduling understands.
pub fn well_known() -> BTreeSet<&'static str> {
    BTreeSet::from([
        LABEL_HOSTNAME,
        LABEL_ARCH,
        LABEL_OS,
        LABEL_INSTANCE_TYPE,
        LABEL_ZONE,
        LABEL_REGION,
        LABEL_NODEPOOL,
        LABEL_CAPACITY_TYPE,
    ])
}

fn domain_of(key: &str) -> &str {
    key.split('/').next().unwrap_or(key)
}

fn in_domain(domain: &str, restricted: &str) -> bool {
    domain == restricted || domain.ends_with(&format!(".{restricted}"))
}

/// Validate a requirement key against the restricted-label policy.
///
/// `extra_allowed` extends the sub-domain allow-list from configuration.
pub fn validate_requirement_key(key: &str, extra_allowed: &[String]) -> Result<(), Error> {
    if well_known().contains(key) {
        return Ok(());
    }
    let domain = domain_of(key);
    if ALLOWED_SUBDOMAINS.iter().any(|allowed| in_domain(domain, allowed))
        || extra_allowed.iter().any(|allowed| in_domain(domain, allowed))
    {
        return Ok(());
    }
    if RESTRICTED_DOMAINS.iter().any(|restricted| in_domain(domain, restricted)) {
        return Err(Error::restricted_label(key));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_known_keys_are_allowed() {
        assert!(validate_requirement_key(LABEL_ZONE, &[]).is_ok());
        assert!(validate_requirement_key(LABEL_CAPACITY_TYPE, &[]).is_ok());
    }

    #[test]
    fn arbitrary_user_keys_are_allowed() {
        assert!(validate_requirement_key("team", &[]).is_ok());
        assert!(validate_requirement_key("example.com/accelerator", &[]).is_ok());
    }

    #[test]
    fn restricted_domains_are_rejected() {
        assert!(validate_requirement_key("kubernetes.io/custom", &[]).is_err());
        assert!(validate_requirement_key("internal.k8s.io/role", &[]).is_err());
        assert!(validate_requirement_key("gantry.dev/internal", &[]).is_err());
    }

    #[test]
    fn allowed_subdomains_bypass_restriction() {
        assert!(validate_requirement_key("node-restriction.kubernetes.io/team", &[]).is_ok());
        assert!(validate_requirement_key("node.kubernetes.io/windows-build", &[]).is_ok());
    }

    #[test]
    fn configured_subdomains_bypass_restriction() {
        let extra = vec!["accelerators.kubernetes.io".to_string()];
        assert!(validate_requirement_key("accelerators.kubernetes.io/gpu", &extra).is_ok());
        assert!(validate_requirement_key("accelerators.kubernetes.io/gpu", &[]).is_err());
    }
}
