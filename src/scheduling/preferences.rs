//! Preferential relaxation: a pod's soft constraints as a droppable stack.
//!
//! A pod enters the pass with every preference treated as required, which
//! lets preferences shape new nodes. When no placement exists the scheduler
//! relaxes one constraint and retries: preferred node-affinity terms go
//! first in ascending weight (later terms first on ties), then the leading
//! term of a multi-term required node affinity (an OR) is dropped. The final
//! required term is never dropped.

use k8s_openapi::api::core::v1::Pod;

use crate::pods;
use crate::requirements::Requirements;
use crate::resources::{pod_requests, Resources};

/// A pod being scheduled, with its constraint stack.
#[derive(Clone, Debug)]
pub struct SchedulablePod {
    /// The pod as observed.
    pub pod: Pod,
    /// Total scheduling requests, including init containers and overhead.
    pub requests: Resources,
    /// Unconditional requirements (node selector, node name, volume zones).
    base: Requirements,
    /// Required node-affinity terms; an OR evaluated front-first.
    required_terms: Vec<Requirements>,
    /// Preferred terms still treated as required: (weight, original index).
    preferred: Vec<(i32, usize, Requirements)>,
}

impl SchedulablePod {
    /// Build the constraint stack for a pod. `extra_base` carries
    /// requirements the pod implies indirectly, e.g. storage-class zones.
    pub fn new(pod: Pod, extra_base: Requirements) -> Result<Self, crate::resources::ResourceError> {
        let requests = pod_requests(&pod)?;
        let mut base = pods::base_requirements(&pod);
        base.merge(&extra_base);
        let required_terms = pods::required_affinity_terms(&pod);
        let preferred = pods::preferred_affinity_terms(&pod)
            .into_iter()
            .enumerate()
            .map(|(index, (weight, reqs))| (weight, index, reqs))
            .collect();
        Ok(Self { pod, requests, base, required_terms, preferred })
    }

    /// The effective requirements at the current relaxation level: base,
    /// intersected with the leading required term and every surviving
    /// preferred term.
    pub fn requirements(&self) -> Requirements {
        let mut reqs = self.base.clone();
        if let Some(term) = self.required_terms.first() {
            reqs.merge(term);
        }
        for (_, _, term) in &self.preferred {
            reqs.merge(term);
        }
        reqs
    }

    /// Drop the weakest remaining soft constraint. Returns a description of
    /// what was dropped, or `None` when only hard constraints remain.
    pub fn relax(&mut self) -> Option<String> {
        // Lowest weight first; among equal weights the later term yields,
        // so earlier terms win ties.
        if let Some(position) = self
            .preferred
            .iter()
            .enumerate()
            .min_by_key(|(_, (weight, index, _))| (*weight, std::cmp::Reverse(*index)))
            .map(|(position, _)| position)
        {
            let (weight, index, _) = self.preferred.remove(position);
            return Some(format!("preferred node affinity term {index} (weight {weight})"));
        }
        if self.required_terms.len() > 1 {
            self.required_terms.remove(0);
            return Some("leading required node selector term".to_string());
        }
        None
    }

    /// True once every soft constraint has been dropped.
    pub fn fully_relaxed(&self) -> bool {
        self.preferred.is_empty() && self.required_terms.len() <= 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::{
        Affinity, NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm, PodSpec,
        PreferredSchedulingTerm,
    };

    fn term(key: &str, values: &[&str]) -> NodeSelectorTerm {
        NodeSelectorTerm {
            match_expressions: Some(vec![NodeSelectorRequirement {
                key: key.to_string(),
                operator: "In".to_string(),
                values: Some(values.iter().map(|v| v.to_string()).collect()),
            }]),
            ..Default::default()
        }
    }

    fn pod_with_affinity(
        required: Vec<NodeSelectorTerm>,
        preferred: Vec<(i32, NodeSelectorTerm)>,
    ) -> Pod {
        Pod {
            spec: Some(PodSpec {
                affinity: Some(Affinity {
                    node_affinity: Some(NodeAffinity {
                        required_during_scheduling_ignored_during_execution: (!required
                            .is_empty())
                        .then(|| NodeSelector { node_selector_terms: required }),
                        preferred_during_scheduling_ignored_during_execution: (!preferred
                            .is_empty())
                        .then(|| {
                            preferred
                                .into_iter()
                                .map(|(weight, preference)| PreferredSchedulingTerm {
                                    weight,
                                    preference,
                                })
                                .collect()
                        }),
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn preferences_start_as_requirements() {
        let pod = pod_with_affinity(vec![], vec![(10, term("zone", &["a"]))]);
        let sp = SchedulablePod::new(pod, Requirements::new()).unwrap();
        assert!(sp.requirements().intersects("zone", "a"));
        assert!(!sp.requirements().intersects("zone", "b"));
    }

    #[test]
    fn relax_drops_lowest_weight_first() {
        let pod = pod_with_affinity(
            vec![],
            vec![(50, term("zone", &["a"])), (10, term("disk", &["ssd"]))],
        );
        let mut sp = SchedulablePod::new(pod, Requirements::new()).unwrap();

        let dropped = sp.relax().unwrap();
        assert!(dropped.contains("weight 10"));
        // The heavier preference survives.
        assert!(!sp.requirements().has("disk"));
        assert!(sp.requirements().has("zone"));
    }

    #[test]
    fn equal_weights_drop_later_terms_first() {
        let pod = pod_with_affinity(
            vec![],
            vec![(10, term("zone", &["a"])), (10, term("disk", &["ssd"]))],
        );
        let mut sp = SchedulablePod::new(pod, Requirements::new()).unwrap();

        let dropped = sp.relax().unwrap();
        assert!(dropped.contains("term 1"));
        assert!(sp.requirements().has("zone"));
    }

    #[test]
    fn required_or_terms_drop_left_to_right_but_never_the_last() {
        let pod = pod_with_affinity(
            vec![term("zone", &["a"]), term("zone", &["b"])],
            vec![],
        );
        let mut sp = SchedulablePod::new(pod, Requirements::new()).unwrap();
        assert!(sp.requirements().intersects("zone", "a"));

        assert!(sp.relax().is_some());
        assert!(sp.requirements().intersects("zone", "b"));
        assert!(!sp.requirements().intersects("zone", "a"));

        // The final term is a hard constraint.
        assert!(sp.relax().is_none());
        assert!(sp.fully_relaxed());
    }

    #[test]
    fn base_requirements_are_never_relaxed() {
        let mut pod = pod_with_affinity(vec![], vec![(10, term("zone", &["a"]))]);
        pod.spec.as_mut().unwrap().node_selector =
            Some(BTreeMap::from([("disk".to_string(), "ssd".to_string())]));
        let mut sp = SchedulablePod::new(pod, Requirements::new()).unwrap();

        while sp.relax().is_some() {}
        assert!(sp.requirements().has("disk"));
        assert!(!sp.requirements().has("zone"));
    }
}
