//! Topology tracking for spread, pod affinity, and pod anti-affinity.
//!
//! The tracker maintains, per `(selector, topologyKey)` group, the count of
//! matching pods in each domain value. Placement queries return the domain
//! values that keep every constraint satisfiable:
//!
//! - topology spread keeps `count - min <= maxSkew` for `DoNotSchedule`
//! - pod affinity requires a domain that already holds a matching pod
//!   (`min >= 1`), with self-affinity seeded on the first placement
//! - pod anti-affinity requires a domain with zero matching pods, in both
//!   directions: the holder avoids matchers, and matchers avoid the holder
//!
//! Hostname topology is special: every hypothetical node is its own domain,
//! registered as templates are created.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use k8s_openapi::api::core::v1::{Pod, PodAffinityTerm};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use tracing::trace;

use crate::labels::LABEL_HOSTNAME;
use crate::pods::{label_selector_matches, pod_key, pod_labels, pod_namespace};
use crate::state::Snapshot;

/// What a constraint does with placements that would violate it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WhenUnsatisfiable {
    DoNotSchedule,
    ScheduleAnyway,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum GroupKind {
    Spread { max_skew: i32, when: WhenUnsatisfiable },
    Affinity,
    /// `inverse` groups count the constraint holders and restrict the pods
    /// matching the selector; direct groups do the opposite.
    AntiAffinity { inverse: bool },
}

/// One `(selector, topologyKey)` counting group.
#[derive(Clone, Debug)]
struct TopologyGroup {
    kind: GroupKind,
    key: String,
    namespaces: BTreeSet<String>,
    selector: LabelSelector,
    /// Pods that carry this constraint.
    owner_keys: HashSet<String>,
    /// Domain value -> count of relevant pods.
    domains: BTreeMap<String, usize>,
}

impl TopologyGroup {
    fn identity(&self) -> String {
        format!(
            "{:?}|{}|{:?}|{}",
            self.kind,
            self.key,
            self.namespaces,
            serde_json::to_string(&self.selector).unwrap_or_default()
        )
    }

    /// Does placing this pod change the group's counts?
    fn counts_pod(&self, pod: &Pod, key: &str) -> bool {
        match &self.kind {
            GroupKind::AntiAffinity { inverse: true } => self.owner_keys.contains(key),
            _ => {
                self.namespaces.contains(&pod_namespace(pod))
                    && label_selector_matches(&self.selector, &pod_labels(pod))
            }
        }
    }

    /// Does this group restrict where the pod may go?
    fn constrains_pod(&self, pod: &Pod, key: &str) -> bool {
        match &self.kind {
            GroupKind::AntiAffinity { inverse: true } => {
                self.namespaces.contains(&pod_namespace(pod))
                    && label_selector_matches(&self.selector, &pod_labels(pod))
            }
            _ => self.owner_keys.contains(key),
        }
    }

    fn register_domain(&mut self, domain: &str) {
        self.domains.entry(domain.to_string()).or_insert(0);
    }

    fn record(&mut self, domain: &str) {
        *self.domains.entry(domain.to_string()).or_insert(0) += 1;
    }

    fn remove(&mut self, domain: &str) {
        if let Some(count) = self.domains.get_mut(domain) {
            *count = count.saturating_sub(1);
        }
    }

    /// The domains, among `eligible`, where the constrained pod may be
    /// placed. For `ScheduleAnyway` spread every eligible domain qualifies.
    fn viable_domains(&self, pod: &Pod, eligible: &BTreeSet<String>) -> BTreeSet<String> {
        match &self.kind {
            GroupKind::Spread { max_skew, when } => {
                if *when == WhenUnsatisfiable::ScheduleAnyway {
                    return eligible.clone();
                }
                // Skew is measured against the least-loaded domain anywhere,
                // not just the ones this node can provide.
                let global_min = self.domains.values().copied().min().unwrap_or(0);
                eligible
                    .iter()
                    .filter(|d| {
                        let count = self.domains.get(*d).copied().unwrap_or(0);
                        (count + 1).saturating_sub(global_min) as i32 <= *max_skew
                    })
                    .cloned()
                    .collect()
            }
            GroupKind::Affinity => {
                let occupied: BTreeSet<String> = eligible
                    .iter()
                    .filter(|d| self.domains.get(*d).copied().unwrap_or(0) >= 1)
                    .cloned()
                    .collect();
                if !occupied.is_empty() {
                    return occupied;
                }
                // Self-affinity seeds on the first placement; any domain is
                // acceptable and later pods will follow it.
                if label_selector_matches(&self.selector, &pod_labels(pod)) {
                    return eligible.clone();
                }
                BTreeSet::new()
            }
            GroupKind::AntiAffinity { .. } => eligible
                .iter()
                .filter(|d| self.domains.get(*d).copied().unwrap_or(0) == 0)
                .cloned()
                .collect(),
        }
    }

    /// The domain this group would prefer next: the least-loaded eligible
    /// one, ties broken lexicographically.
    fn preferred_domain(&self, eligible: &BTreeSet<String>) -> Option<String> {
        eligible
            .iter()
            .min_by_key(|d| (self.domains.get(*d).copied().unwrap_or(0), (*d).clone()))
            .cloned()
    }
}

/// How a candidate node exposes its value(s) for a topology key.
#[derive(Clone, Debug)]
pub enum DomainView {
    /// An existing node: the label value, or absent.
    Fixed(Option<String>),
    /// A node template: the still-allowed values, `None` meaning any known
    /// domain.
    Choices(Option<BTreeSet<String>>),
}

/// The outcome of a topology feasibility query for one pod on one node.
#[derive(Clone, Debug, Default)]
pub struct TopologyDecision {
    /// Per topology key: the values the node may take. Empty map when the
    /// pod has no applicable constraint.
    pub allowed: BTreeMap<String, BTreeSet<String>>,
    /// Per topology key: the domain the tracker would prefer, used to
    /// narrow templates deterministically.
    pub preferred: BTreeMap<String, String>,
}

/// Why a pod cannot satisfy its topology constraints on a node.
#[derive(Clone, Debug, thiserror::Error)]
#[error("no {key} domain satisfies {constraint}")]
pub struct TopologyConflict {
    /// The topology key with no viable domain.
    pub key: String,
    /// Human-readable constraint description.
    pub constraint: String,
}

/// The per-pass topology tracker.
#[derive(Clone, Debug, Default)]
pub struct Topology {
    groups: Vec<TopologyGroup>,
    /// Universe of domain values per topology key.
    universe: HashMap<String, BTreeSet<String>>,
    /// pod key -> (group index, domain) for deregistration.
    assignments: HashMap<String, Vec<(usize, String)>>,
}

impl Topology {
    /// Build the tracker for a pass: groups from the batch pods'
    /// constraints, inverse anti-affinity from existing pods, and counts
    /// seeded from current placements.
    pub fn build(batch: &[Pod], snapshot: &Snapshot) -> Self {
        let mut topology = Topology::default();

        // Domain universe from existing nodes' labels.
        for node in &snapshot.nodes {
            for (key, value) in node.labels() {
                topology.register_domain(&key, &value);
            }
            topology.register_domain(LABEL_HOSTNAME, &node.hostname());
        }

        for pod in batch {
            topology.add_pod_constraints(pod);
        }
        // Anti-affinity of already-running pods constrains new placements.
        for pod in snapshot.pods.values() {
            if has_anti_affinity(pod) {
                topology.add_anti_affinity_groups(pod);
            }
        }

        // Seed counts from pods already bound to nodes.
        for node in &snapshot.nodes {
            let labels = node.labels();
            for bound_key in node.pod_requests.keys() {
                let Some(pod) = snapshot.pods.get(bound_key) else {
                    continue;
                };
                let mut domain_for = |key: &str| -> Option<String> {
                    if key == LABEL_HOSTNAME {
                        Some(node.hostname())
                    } else {
                        labels.get(key).cloned()
                    }
                };
                topology.record_with(pod, bound_key, &mut domain_for);
            }
        }
        topology
    }

    /// Register a known domain value for a key, e.g. every zone the catalog
    /// offers, or a new template's hostname.
    pub fn register_domain(&mut self, key: &str, value: &str) {
        self.universe.entry(key.to_string()).or_default().insert(value.to_string());
        for group in self.groups.iter_mut().filter(|g| g.key == key) {
            group.register_domain(value);
        }
    }

    fn upsert_group(&mut self, mut group: TopologyGroup, owner: &str) {
        group.owner_keys.insert(owner.to_string());
        let identity = group.identity();
        if let Some(existing) = self.groups.iter_mut().find(|g| g.identity() == identity) {
            existing.owner_keys.insert(owner.to_string());
            return;
        }
        if let Some(values) = self.universe.get(&group.key) {
            for value in values {
                group.register_domain(value);
            }
        }
        self.groups.push(group);
    }

    fn add_pod_constraints(&mut self, pod: &Pod) {
        let key = pod_key(pod);
        let namespace = pod_namespace(pod);
        let Some(spec) = pod.spec.as_ref() else {
            return;
        };

        for constraint in spec.topology_spread_constraints.iter().flatten() {
            let when = match constraint.when_unsatisfiable.as_str() {
                "ScheduleAnyway" => WhenUnsatisfiable::ScheduleAnyway,
                _ => WhenUnsatisfiable::DoNotSchedule,
            };
            self.upsert_group(
                TopologyGroup {
                    kind: GroupKind::Spread { max_skew: constraint.max_skew, when },
                    key: constraint.topology_key.clone(),
                    namespaces: BTreeSet::from([namespace.clone()]),
                    selector: constraint.label_selector.clone().unwrap_or_default(),
                    owner_keys: HashSet::new(),
                    domains: BTreeMap::new(),
                },
                &key,
            );
        }

        let affinity = spec.affinity.as_ref();
        for term in affinity
            .and_then(|a| a.pod_affinity.as_ref())
            .and_then(|pa| pa.required_during_scheduling_ignored_during_execution.as_ref())
            .into_iter()
            .flatten()
        {
            self.upsert_group(affinity_group(term, &namespace, GroupKind::Affinity), &key);
        }
        if has_anti_affinity(pod) {
            self.add_anti_affinity_groups(pod);
        }
    }

    fn add_anti_affinity_groups(&mut self, pod: &Pod) {
        let key = pod_key(pod);
        let namespace = pod_namespace(pod);
        let terms = pod
            .spec
            .as_ref()
            .and_then(|s| s.affinity.as_ref())
            .and_then(|a| a.pod_anti_affinity.as_ref())
            .and_then(|pa| pa.required_during_scheduling_ignored_during_execution.clone())
            .unwrap_or_default();
        for term in &terms {
            self.upsert_group(
                affinity_group(term, &namespace, GroupKind::AntiAffinity { inverse: false }),
                &key,
            );
            self.upsert_group(
                affinity_group(term, &namespace, GroupKind::AntiAffinity { inverse: true }),
                &key,
            );
        }
    }

    /// Compute the viable domains for the pod on a candidate node. The
    /// `view` closure reports the node's value(s) for a topology key.
    pub fn check(
        &self,
        pod: &Pod,
        view: &dyn Fn(&str) -> DomainView,
    ) -> Result<TopologyDecision, TopologyConflict> {
        let key = pod_key(pod);
        let mut decision = TopologyDecision::default();

        for group in self.groups.iter().filter(|g| g.constrains_pod(pod, &key)) {
            let eligible: BTreeSet<String> = match view(&group.key) {
                DomainView::Fixed(Some(value)) => BTreeSet::from([value]),
                // A node without the topology label cannot satisfy the
                // constraint at all.
                DomainView::Fixed(None) => BTreeSet::new(),
                // A template knows its own values; a fresh hostname is a
                // valid domain before it is registered.
                DomainView::Choices(Some(choices)) => choices,
                DomainView::Choices(None) => {
                    self.universe.get(&group.key).cloned().unwrap_or_default()
                }
            };
            // Narrow by what earlier groups on the same key already allowed.
            let eligible: BTreeSet<String> = match decision.allowed.get(&group.key) {
                Some(previous) => eligible.intersection(previous).cloned().collect(),
                None => eligible,
            };
            let viable = group.viable_domains(pod, &eligible);
            if viable.is_empty() {
                return Err(TopologyConflict {
                    key: group.key.clone(),
                    constraint: format!("{:?}", group.kind),
                });
            }
            if let Some(preferred) = group.preferred_domain(&viable) {
                decision.preferred.insert(group.key.clone(), preferred);
            }
            decision.allowed.insert(group.key.clone(), viable);
        }
        trace!(pod = %key, groups = self.groups.len(), "topology check passed");
        Ok(decision)
    }

    /// Record a placed pod into every group it affects. The `domain_for`
    /// closure resolves the concrete domain value per topology key.
    pub fn record_with(
        &mut self,
        pod: &Pod,
        key: &str,
        domain_for: &mut dyn FnMut(&str) -> Option<String>,
    ) {
        let mut placed = Vec::new();
        for (index, group) in self.groups.iter_mut().enumerate() {
            if !group.counts_pod(pod, key) {
                continue;
            }
            if let Some(domain) = domain_for(&group.key) {
                group.record(&domain);
                placed.push((index, domain));
            }
        }
        if !placed.is_empty() {
            self.assignments.insert(key.to_string(), placed);
        }
    }

    /// Remove a previously recorded pod from all counts.
    pub fn deregister(&mut self, key: &str) {
        if let Some(placed) = self.assignments.remove(key) {
            for (index, domain) in placed {
                if let Some(group) = self.groups.get_mut(index) {
                    group.remove(&domain);
                }
            }
        }
    }

    /// True if the pod carries or is affected by any tracked constraint.
    pub fn constrains(&self, pod: &Pod) -> bool {
        let key = pod_key(pod);
        self.groups.iter().any(|g| g.constrains_pod(pod, &key))
    }
}

fn has_anti_affinity(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|s| s.affinity.as_ref())
        .and_then(|a| a.pod_anti_affinity.as_ref())
        .and_then(|pa| pa.required_during_scheduling_ignored_during_execution.as_ref())
        .is_some_and(|terms| !terms.is_empty())
}

fn affinity_group(term: &PodAffinityTerm, namespace: &str, kind: GroupKind) -> TopologyGroup {
    let mut namespaces = BTreeSet::from([namespace.to_string()]);
    namespaces.extend(term.namespaces.clone().unwrap_or_default());
    TopologyGroup {
        kind,
        key: term.topology_key.clone(),
        namespaces,
        selector: term.label_selector.clone().unwrap_or_default(),
        owner_keys: HashSet::new(),
        domains: BTreeMap::new(),
    }
}
