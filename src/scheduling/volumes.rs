//! Volume feasibility: per-driver CSI volume limits and storage topology.

use std::collections::{BTreeSet, HashMap};

use k8s_openapi::api::core::v1::Pod;

use crate::requirements::{Requirement, Requirements};
use crate::state::{storage, Snapshot, StateNode};

/// Check whether adding the pod's persistent volumes would exceed a CSI
/// driver limit on the node. Returns the offending driver, or `None` when
/// the pod fits. Nodes whose CSINode has not reported a limit for a driver
/// are unconstrained for that driver.
pub fn exceeds_limits(pod: &Pod, node: &StateNode, snapshot: &Snapshot) -> Option<String> {
    let volumes = storage::pod_volumes(pod, &snapshot.pvcs, &snapshot.storage_classes);
    if volumes.is_empty() {
        return None;
    }

    let mut new_per_driver: HashMap<&str, BTreeSet<&str>> = HashMap::new();
    for (driver, volume) in &volumes {
        // Volumes already mounted on the node share their slot.
        let mounted = node
            .volume_usage
            .get(driver.as_str())
            .is_some_and(|set| set.contains(volume.as_str()));
        if !mounted {
            new_per_driver.entry(driver.as_str()).or_default().insert(volume.as_str());
        }
    }

    for (driver, new_volumes) in new_per_driver {
        let Some(limit) = snapshot.csi_limit(&node.hostname(), driver) else {
            continue;
        };
        let used = node.volume_count(driver);
        if (used + new_volumes.len()) as i64 > limit {
            return Some(driver.to_string());
        }
    }
    None
}

/// Zone requirements implied by the pod's storage classes: a class with
/// `allowedTopologies` pins its volumes, and therefore the pod, to those
/// zones.
pub fn zone_requirements(pod: &Pod, snapshot: &Snapshot) -> Requirements {
    let mut reqs = Requirements::new();
    for class in storage::pod_storage_classes(pod, &snapshot.pvcs, &snapshot.storage_classes) {
        let zones = storage::allowed_zones(class);
        if !zones.is_empty() {
            reqs.add(Requirement::in_values(crate::labels::LABEL_ZONE, zones));
        }
    }
    reqs
}
