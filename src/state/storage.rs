//! Storage-class resolution for volume accounting.
//!
//! Maps pod volumes to the CSI driver that will mount them, resolving the
//! default storage class and translating in-tree provisioners to their CSI
//! successors.

use std::collections::{BTreeSet, HashMap};

use k8s_openapi::api::core::v1::{Pod, PersistentVolumeClaim};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::ResourceExt;

use crate::pods::pod_namespace;

/// The annotation marking a storage class as the cluster default.
pub const DEFAULT_CLASS_ANNOTATION: &str = "storageclass.kubernetes.io/is-default-class";

/// In-tree provisioners migrated to CSI drivers.
const IN_TREE_MIGRATIONS: [(&str, &str); 3] = [
    ("kubernetes.io/aws-ebs", "ebs.csi.aws.com"),
    ("kubernetes.io/gce-pd", "pd.csi.storage.gke.io"),
    ("kubernetes.io/azure-disk", "disk.csi.azure.com"),
];

/// Translate a provisioner name to the CSI driver that enforces its limits.
pub fn provisioner_to_driver(provisioner: &str) -> String {
    IN_TREE_MIGRATIONS
        .iter()
        .find(|(in_tree, _)| *in_tree == provisioner)
        .map(|(_, csi)| csi.to_string())
        .unwrap_or_else(|| provisioner.to_string())
}

/// Select the default storage class: the unique class annotated default, or
/// among several the newest by creation timestamp, ties broken by the
/// lexicographically smallest name.
pub fn default_storage_class(classes: &HashMap<String, StorageClass>) -> Option<&StorageClass> {
    classes
        .values()
        .filter(|class| {
            class
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(DEFAULT_CLASS_ANNOTATION))
                .map(String::as_str)
                == Some("true")
        })
        .max_by(|a, b| {
            let at = a.metadata.creation_timestamp.as_ref().map(|t| t.0);
            let bt = b.metadata.creation_timestamp.as_ref().map(|t| t.0);
            // Newest wins; on equal timestamps the smaller name wins, so it
            // must compare as the maximum here.
            at.cmp(&bt).then_with(|| b.name_any().cmp(&a.name_any()))
        })
}

/// Resolve a pod's persistent volumes to `(driver, volume_key)` pairs.
///
/// Volumes whose claim or class cannot be resolved yet are skipped; the
/// volume limit check treats them as not consuming a slot until the claim
/// binds.
pub fn pod_volumes(
    pod: &Pod,
    pvcs: &HashMap<String, PersistentVolumeClaim>,
    classes: &HashMap<String, StorageClass>,
) -> Vec<(String, String)> {
    let namespace = pod_namespace(pod);
    let mut out = Vec::new();
    for volume in pod.spec.as_ref().and_then(|s| s.volumes.as_ref()).into_iter().flatten() {
        let Some(claim_source) = volume.persistent_volume_claim.as_ref() else {
            continue;
        };
        let claim_key = format!("{}/{}", namespace, claim_source.claim_name);
        let Some(pvc) = pvcs.get(&claim_key) else {
            continue;
        };
        let class_name = pvc
            .spec
            .as_ref()
            .and_then(|s| s.storage_class_name.clone())
            .or_else(|| default_storage_class(classes).map(|c| c.name_any()));
        let Some(class_name) = class_name else {
            continue;
        };
        let Some(class) = classes.get(&class_name) else {
            continue;
        };
        out.push((provisioner_to_driver(&class.provisioner), claim_key));
    }
    out
}

/// The allowed zones of a storage class, from its `allowedTopologies`.
/// Empty means unrestricted.
pub fn allowed_zones(class: &StorageClass) -> Vec<String> {
    let mut zones = Vec::new();
    for selector in class.allowed_topologies.iter().flatten() {
        for expr in selector.match_label_expressions.iter().flatten() {
            if expr.key == crate::labels::LABEL_ZONE {
                zones.extend(expr.values.clone());
            }
        }
    }
    zones
}

/// The storage classes referenced by a pod's claims (default class included
/// for claims that do not name one).
pub fn pod_storage_classes<'a>(
    pod: &Pod,
    pvcs: &HashMap<String, PersistentVolumeClaim>,
    classes: &'a HashMap<String, StorageClass>,
) -> Vec<&'a StorageClass> {
    let namespace = pod_namespace(pod);
    let mut out: Vec<&StorageClass> = Vec::new();
    let mut seen: BTreeSet<String> = BTreeSet::new();
    for volume in pod.spec.as_ref().and_then(|s| s.volumes.as_ref()).into_iter().flatten() {
        let Some(claim_source) = volume.persistent_volume_claim.as_ref() else {
            continue;
        };
        let claim_key = format!("{}/{}", namespace, claim_source.claim_name);
        let Some(pvc) = pvcs.get(&claim_key) else {
            continue;
        };
        let class = match pvc.spec.as_ref().and_then(|s| s.storage_class_name.as_ref()) {
            Some(name) => classes.get(name),
            None => default_storage_class(classes),
        };
        if let Some(class) = class {
            if seen.insert(class.name_any()) {
                out.push(class);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use chrono::{TimeZone, Utc};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn class(name: &str, default: bool, created: i64) -> StorageClass {
        let mut sc = StorageClass {
            provisioner: "ebs.csi.aws.com".to_string(),
            ..Default::default()
        };
        sc.metadata.name = Some(name.to_string());
        sc.metadata.creation_timestamp = Some(Time(Utc.timestamp_opt(created, 0).unwrap()));
        if default {
            sc.metadata.annotations = Some(BTreeMap::from([(
                DEFAULT_CLASS_ANNOTATION.to_string(),
                "true".to_string(),
            )]));
        }
        sc
    }

    fn classes(list: Vec<StorageClass>) -> HashMap<String, StorageClass> {
        list.into_iter().map(|c| (c.name_any(), c)).collect()
    }

    #[test]
    fn unique_default_class_is_selected() {
        let all = classes(vec![class("standard", false, 100), class("fast", true, 50)]);
        assert_eq!(default_storage_class(&all).unwrap().name_any(), "fast");
    }

    #[test]
    fn newest_default_class_wins() {
        let all = classes(vec![class("old-default", true, 100), class("new-default", true, 200)]);
        assert_eq!(default_storage_class(&all).unwrap().name_any(), "new-default");
    }

    #[test]
    fn equal_timestamps_pick_smallest_name() {
        let all = classes(vec![class("zeta", true, 100), class("alpha", true, 100)]);
        assert_eq!(default_storage_class(&all).unwrap().name_any(), "alpha");
    }

    #[test]
    fn no_default_class_yields_none() {
        let all = classes(vec![class("standard", false, 100)]);
        assert!(default_storage_class(&all).is_none());
    }

    #[test]
    fn in_tree_provisioners_map_to_csi_drivers() {
        assert_eq!(provisioner_to_driver("kubernetes.io/aws-ebs"), "ebs.csi.aws.com");
        assert_eq!(provisioner_to_driver("ebs.csi.aws.com"), "ebs.csi.aws.com");
        assert_eq!(provisioner_to_driver("rook-ceph.rbd.csi.ceph.com"), "rook-ceph.rbd.csi.ceph.com");
    }
}
