//! Scheduling: fitting pending pods onto existing and hypothetical nodes.
//!
//! - [`topology`] - spread / affinity / anti-affinity domain tracking
//! - [`volumes`] - CSI volume limits and storage topology
//! - [`preferences`] - the relaxable constraint stack per pod
//! - [`template`] - candidate future nodes and claim proposals
//! - [`scheduler`] - the pass itself

pub mod preferences;
pub mod scheduler;
pub mod template;
pub mod topology;
pub mod volumes;

pub use preferences::SchedulablePod;
pub use scheduler::{sort_pods, Binding, Cancelled, Results, Scheduler, Unschedulable};
pub use template::{NodeClaimProposal, NodeTemplate};
pub use topology::{DomainView, Topology, TopologyConflict};

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::cloud::InstanceType;
    use crate::crd::NodePool;
    use crate::labels::{LABEL_ARCH, LABEL_INSTANCE_TYPE, LABEL_ZONE};
    use crate::state::{ClusterState, Snapshot};
    use crate::test_support::{instance_type, instance_type_arch, pool, pool_weighted, PodFixture};

    fn run(
        snapshot: &Snapshot,
        pools: Vec<(NodePool, Vec<Arc<InstanceType>>)>,
        batch: Vec<k8s_openapi::api::core::v1::Pod>,
    ) -> Results {
        Scheduler::new(snapshot, pools, Vec::new(), CancellationToken::new())
            .schedule(batch)
            .expect("pass not cancelled")
    }

    fn default_catalog() -> Vec<Arc<InstanceType>> {
        vec![
            // Two 1.8G pods fit; a third does not.
            instance_type("default-instance-type", 16_000, 4 << 30, 1.0, &["zone-1", "zone-2", "zone-3"]),
            instance_type("small-instance-type", 2_000, 2 << 30, 0.5, &["zone-1", "zone-2", "zone-3"]),
            instance_type_arch("arm-instance-type", 16_000, 8 << 30, 1.2, &["zone-1"], "arm64"),
        ]
    }

    #[test]
    fn bin_packing_forty_large_pods_need_twenty_nodes() {
        let snapshot = Snapshot::default();
        let batch: Vec<_> = (0..40)
            .map(|i| {
                PodFixture::new(&format!("large-{i}"))
                    .requests("", "1.8G")
                    .node_selector(LABEL_ARCH, "amd64")
                    .build()
            })
            .collect();

        let results = run(&snapshot, vec![(pool("default"), default_catalog())], batch);

        assert!(results.all_pods_scheduled());
        assert_eq!(results.new_claims.len(), 20);
        for claim in &results.new_claims {
            assert_eq!(claim.pod_keys.len(), 2);
            assert_eq!(claim.options[0].name, "default-instance-type");
        }
    }

    #[test]
    fn small_pods_co_pack_with_large_ones() {
        let snapshot = Snapshot::default();
        let mut batch: Vec<_> = (0..40)
            .map(|i| {
                PodFixture::new(&format!("large-{i}"))
                    .requests("", "1.8G")
                    .node_selector(LABEL_ARCH, "amd64")
                    .build()
            })
            .collect();
        batch.extend((0..20).map(|i| {
            PodFixture::new(&format!("small-{i}"))
                .requests("", "400M")
                .node_selector(LABEL_ARCH, "amd64")
                .build()
        }));

        let results = run(&snapshot, vec![(pool("default"), default_catalog())], batch);

        assert!(results.all_pods_scheduled());
        // 20 nodes, each 2 large + 1 small: 2*1.8G + 400M = 4.0G < 4Gi.
        assert_eq!(results.new_claims.len(), 20);
        for claim in &results.new_claims {
            assert_eq!(claim.pod_keys.len(), 3);
        }
    }

    #[test]
    fn cheapest_instance_is_chosen_but_all_remain_options() {
        let snapshot = Snapshot::default();
        let catalog = vec![
            instance_type("small", 4_000, 8 << 30, 2.0, &["zone-1"]),
            instance_type("medium", 4_000, 8 << 30, 3.0, &["zone-1"]),
            instance_type("large", 4_000, 8 << 30, 1.0, &["zone-1"]),
        ];
        let batch = vec![PodFixture::new("web").requests("500m", "1G").build()];

        let results = run(&snapshot, vec![(pool("default"), catalog)], batch);

        assert_eq!(results.new_claims.len(), 1);
        let claim = &results.new_claims[0];
        // Cheapest first, but every viable type is passed along.
        assert_eq!(claim.options[0].name, "large");
        assert_eq!(claim.options.len(), 3);
        assert!((claim.price().unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn pod_larger_than_any_instance_is_unschedulable() {
        let snapshot = Snapshot::default();
        let batch = vec![PodFixture::new("huge").requests("64", "1G").build()];

        let results = run(&snapshot, vec![(pool("default"), default_catalog())], batch);

        assert!(results.new_claims.is_empty());
        assert_eq!(results.unschedulable.len(), 1);
        assert!(results.unschedulable[0].reason.contains("no instance type"));
    }

    #[test]
    fn pod_requesting_exact_allocatable_schedules() {
        let snapshot = Snapshot::default();
        let catalog = vec![instance_type("exact", 4_000, 8 << 30, 1.0, &["zone-1"])];
        let batch = vec![PodFixture::new("fits").requests("4", "").build()];

        let results = run(&snapshot, vec![(pool("default"), catalog)], batch);
        assert!(results.all_pods_scheduled());
        assert_eq!(results.new_claims.len(), 1);
    }

    #[test]
    fn zero_quantity_extended_resource_schedules_anywhere() {
        let snapshot = Snapshot::default();
        let mut pod = PodFixture::new("web").requests("100m", "").build();
        pod.spec.as_mut().unwrap().containers[0]
            .resources
            .as_mut()
            .unwrap()
            .requests
            .as_mut()
            .unwrap()
            .insert(
                "example.com/gpu".to_string(),
                k8s_openapi::apimachinery::pkg::api::resource::Quantity("0".to_string()),
            );

        let results = run(&snapshot, vec![(pool("default"), default_catalog())], vec![pod]);
        assert!(results.all_pods_scheduled());
    }

    #[test]
    fn restricted_label_requirements_fail_the_pod() {
        let snapshot = Snapshot::default();
        let batch = vec![PodFixture::new("sneaky")
            .node_selector("kubernetes.io/internal", "true")
            .build()];

        let results = run(&snapshot, vec![(pool("default"), default_catalog())], batch);
        assert_eq!(results.unschedulable.len(), 1);
        assert!(results.unschedulable[0].reason.contains("restricted"));
    }

    #[tokio::test]
    async fn pods_pack_onto_in_flight_nodes_when_zones_agree() {
        // Pod A created node N1 in zone-2 in an earlier pass.
        let cluster = ClusterState::new();
        let mut claim = crate::crd::NodeClaim::new("n1", Default::default());
        claim.metadata.name = Some("n1".to_string());
        claim.spec.requirements = vec![crate::test_support::requirement_spec(LABEL_ZONE, &["zone-2"])];
        cluster
            .update_node_claim(
                claim,
                vec![instance_type("default-instance-type", 16_000, 4 << 30, 1.0, &["zone-2"])],
            )
            .await;
        let snapshot = cluster.snapshot().await;

        // Pod B can run in zone-1 or zone-2: the in-flight node absorbs it.
        let pod_b = PodFixture::new("pod-b")
            .requests("", "1G")
            .required_affinity(LABEL_ZONE, &["zone-1", "zone-2"])
            .build();
        let results = run(
            &snapshot,
            vec![(pool("default"), default_catalog())],
            vec![pod_b],
        );
        assert!(results.new_claims.is_empty());
        assert_eq!(results.bindings.len(), 1);
        assert_eq!(results.bindings[0].node_name, "n1");

        // Pod C must run in zone-1 or zone-3: a new node is needed.
        let pod_c = PodFixture::new("pod-c")
            .requests("", "1G")
            .required_affinity(LABEL_ZONE, &["zone-1", "zone-3"])
            .build();
        let results = run(
            &snapshot,
            vec![(pool("default"), default_catalog())],
            vec![pod_c],
        );
        assert_eq!(results.bindings.len(), 0);
        assert_eq!(results.new_claims.len(), 1);
    }

    #[tokio::test]
    async fn topology_spread_lands_one_one_two_then_three_three_three() {
        let spread_pod = |name: &str| {
            PodFixture::new(name)
                .label("app", "web")
                .requests("", "100M")
                .zone_spread("web", 1)
                .build()
        };

        let snapshot = Snapshot::default();
        let batch: Vec<_> = (0..4).map(|i| spread_pod(&format!("web-{i}"))).collect();
        let results = run(&snapshot, vec![(pool("default"), default_catalog())], batch.clone());
        assert!(results.all_pods_scheduled());

        let mut zone_counts: std::collections::BTreeMap<String, usize> = Default::default();
        for claim in &results.new_claims {
            let zone = claim
                .requirements
                .get(LABEL_ZONE)
                .and_then(|r| r.single_value().map(str::to_string))
                .expect("zone pinned");
            *zone_counts.entry(zone).or_insert(0) += claim.pod_keys.len();
        }
        let mut distribution: Vec<usize> = zone_counts.values().copied().collect();
        distribution.sort_unstable();
        assert_eq!(distribution, vec![1, 1, 2]);

        // Apply the pass: the claims go in flight, their pods reserved.
        let cluster = ClusterState::new();
        for claim in &results.new_claims {
            cluster
                .update_node_claim(
                    claim.to_node_claim(&claim.provisional_hostname),
                    claim.options.clone(),
                )
                .await;
            for key in &claim.pod_keys {
                let pod = batch
                    .iter()
                    .find(|p| crate::pods::pod_key(p) == *key)
                    .expect("placed pod is in the batch")
                    .clone();
                cluster.nominate_pod(pod, &claim.provisional_hostname).await.unwrap();
            }
        }

        // Five more pods fill the same nodes to 3/3/3 without new claims.
        let snapshot = cluster.snapshot().await;
        let more: Vec<_> = (4..9).map(|i| spread_pod(&format!("web-{i}"))).collect();
        let results = run(&snapshot, vec![(pool("default"), default_catalog())], more);

        assert!(results.all_pods_scheduled());
        assert!(results.new_claims.is_empty());
        assert_eq!(results.bindings.len(), 5);

        let mut final_counts: std::collections::BTreeMap<String, usize> = Default::default();
        for node in &snapshot.nodes {
            let zone = node.labels().get(LABEL_ZONE).cloned().unwrap();
            *final_counts.entry(zone.clone()).or_insert(0) += node.pod_requests.len();
        }
        for binding in &results.bindings {
            let node = snapshot.node_by_hostname(&binding.node_name).unwrap();
            let zone = node.labels().get(LABEL_ZONE).cloned().unwrap();
            *final_counts.entry(zone).or_insert(0) += 1;
        }
        let distribution: Vec<usize> = final_counts.values().copied().collect();
        assert_eq!(distribution, vec![3, 3, 3]);
    }

    #[test]
    fn higher_weight_pool_wins_when_feasible() {
        let snapshot = Snapshot::default();
        let heavy = pool_weighted("heavy", 100);
        let light = pool_weighted("light", 1);
        // The light pool is cheaper, but weight decides first.
        let heavy_types = vec![instance_type("heavy-type", 4_000, 8 << 30, 5.0, &["zone-1"])];
        let light_types = vec![instance_type("light-type", 4_000, 8 << 30, 1.0, &["zone-1"])];

        let results = run(
            &snapshot,
            vec![(light, light_types), (heavy, heavy_types)],
            vec![PodFixture::new("web").requests("1", "1G").build()],
        );
        assert_eq!(results.new_claims.len(), 1);
        assert_eq!(results.new_claims[0].pool_name, "heavy");
    }

    #[test]
    fn equal_weight_pools_pick_cheapest_option() {
        let snapshot = Snapshot::default();
        let a = pool("pool-a");
        let b = pool("pool-b");
        let a_types = vec![instance_type("a-type", 4_000, 8 << 30, 3.0, &["zone-1"])];
        let b_types = vec![instance_type("b-type", 4_000, 8 << 30, 1.0, &["zone-1"])];

        let results = run(
            &snapshot,
            vec![(a, a_types), (b, b_types)],
            vec![PodFixture::new("web").requests("1", "1G").build()],
        );
        assert_eq!(results.new_claims.len(), 1);
        assert_eq!(results.new_claims[0].pool_name, "pool-b");
    }

    #[test]
    fn scheduling_is_idempotent_on_a_snapshot() {
        let snapshot = Snapshot::default();
        let batch: Vec<_> = (0..7)
            .map(|i| PodFixture::new(&format!("web-{i}")).requests("", "1.8G").build())
            .collect();

        let first = run(&snapshot, vec![(pool("default"), default_catalog())], batch.clone());
        let second = run(&snapshot, vec![(pool("default"), default_catalog())], batch);

        assert_eq!(first.new_claims.len(), second.new_claims.len());
        let keys = |r: &Results| -> Vec<Vec<String>> {
            r.new_claims.iter().map(|c| c.pod_keys.clone()).collect()
        };
        assert_eq!(keys(&first), keys(&second));
    }

    #[test]
    fn every_claim_carries_nonempty_options() {
        let snapshot = Snapshot::default();
        let batch: Vec<_> = (0..5)
            .map(|i| PodFixture::new(&format!("web-{i}")).requests("1", "1G").build())
            .collect();
        let results = run(&snapshot, vec![(pool("default"), default_catalog())], batch);

        for claim in &results.new_claims {
            assert!(!claim.options.is_empty());
            for option in &claim.options {
                assert!(claim.requirements.intersects(LABEL_INSTANCE_TYPE, &option.name));
            }
        }
    }

    #[test]
    fn bound_requests_never_exceed_allocatable() {
        let snapshot = Snapshot::default();
        let batch: Vec<_> = (0..30)
            .map(|i| {
                PodFixture::new(&format!("web-{i}"))
                    .requests("250m", &format!("{}M", 200 + (i % 5) * 300))
                    .build()
            })
            .collect();
        let results = run(&snapshot, vec![(pool("default"), default_catalog())], batch);

        assert!(results.all_pods_scheduled());
        for claim in &results.new_claims {
            for option in &claim.options {
                assert!(claim.requests.fits(&option.allocatable()));
            }
        }
        // No pod is counted twice.
        let mut seen = HashSet::new();
        for claim in &results.new_claims {
            for key in &claim.pod_keys {
                assert!(seen.insert(key.clone()), "pod {key} placed twice");
            }
        }
        for binding in &results.bindings {
            let key = crate::pods::pod_key(&binding.pod);
            assert!(seen.insert(key), "bound pod also placed on a template");
        }
    }
}
