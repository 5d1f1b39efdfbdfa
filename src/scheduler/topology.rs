//! Topology bookkeeping engine
//!
//! Indexes every topology-relevant constraint of a workload batch into flat
//! hash-keyed groups: one per distinct (kind, topology key, selector,
//! namespaces) tuple. Each group counts matching workloads per domain value;
//! the counter view is the union of the cluster snapshot and the placements
//! the solver has made this round. Groups are shared between workloads with
//! identical constraints, which keeps mutually-referential affinity cheap.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::{Hash, Hasher};

use tracing::debug;

use crate::error::{Result, SkyliftError};
use crate::requirements::{Requirement, Requirements};
use crate::scheduler::template::labels;
use crate::scheduler::workload::{
    LabelSelector, TopologySpreadConstraint, UnsatisfiablePolicy, Workload, WorkloadAffinityTerm,
};

/// A workload from the cluster snapshot, with the labels of the node it runs on
#[derive(Debug, Clone)]
pub struct ScheduledWorkload {
    /// The running workload
    pub workload: Workload,
    /// Labels of the node hosting it
    pub node_labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TopologyKind {
    Spread,
    Affinity,
    AntiAffinity,
}

#[derive(Hash)]
struct GroupSpec {
    kind: TopologyKind,
    topology_key: String,
    selector: LabelSelector,
    namespaces: BTreeSet<String>,
    max_skew: u32,
    policy: UnsatisfiablePolicy,
}

impl GroupSpec {
    fn from_spread(constraint: &TopologySpreadConstraint, namespace: &str) -> Self {
        Self {
            kind: TopologyKind::Spread,
            topology_key: constraint.topology_key.clone(),
            selector: constraint.label_selector.clone(),
            namespaces: BTreeSet::from([namespace.to_string()]),
            max_skew: constraint.max_skew,
            policy: constraint.when_unsatisfiable,
        }
    }

    fn from_term(kind: TopologyKind, term: &WorkloadAffinityTerm, namespace: &str) -> Self {
        let namespaces = match &term.namespaces {
            Some(list) => list.iter().cloned().collect(),
            None => BTreeSet::from([namespace.to_string()]),
        };
        Self {
            kind,
            topology_key: term.topology_key.clone(),
            selector: term.label_selector.clone(),
            namespaces,
            max_skew: 0,
            policy: UnsatisfiablePolicy::DoNotSchedule,
        }
    }

    fn key(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

#[derive(Debug)]
struct TopologyGroup {
    kind: TopologyKind,
    topology_key: String,
    selector: LabelSelector,
    namespaces: BTreeSet<String>,
    max_skew: u32,
    policy: UnsatisfiablePolicy,
    owners: BTreeSet<String>,
    counts: BTreeMap<String, u32>,
}

impl TopologyGroup {
    /// Whether a workload counts toward this group's domains
    fn counts_workload(&self, workload: &Workload) -> bool {
        self.namespaces.contains(&workload.namespace) && self.selector.matches(&workload.labels)
    }

    fn increment(&mut self, domain: &str) {
        *self.counts.entry(domain.to_string()).or_insert(0) += 1;
    }

    fn decrement(&mut self, domain: &str) {
        if let Some(count) = self.counts.get_mut(domain) {
            *count = count.saturating_sub(1);
        }
    }

    /// Project the admissible domain values for a candidate workload
    ///
    /// `Ok(None)` means the group imposes no restriction on this attempt.
    fn admissible(
        &self,
        workload: &Workload,
        pod_domains: Option<&Requirement>,
    ) -> Result<Option<Requirement>> {
        let allows = |domain: &str| pod_domains.map(|r| r.has(domain)).unwrap_or(true);

        match self.kind {
            TopologyKind::Spread => {
                // hostname spreads bottom out at zero: a fresh node (and so an
                // empty domain) can always be created
                let min = if self.topology_key == labels::HOSTNAME {
                    if self.counts.is_empty() { None } else { Some(0) }
                } else {
                    self.counts
                        .iter()
                        .filter(|(domain, _)| allows(domain))
                        .map(|(_, count)| *count)
                        .min()
                };
                // the candidate itself counts toward the spread only if the
                // selector matches it
                let own = u32::from(self.counts_workload(workload));
                let admissible: BTreeSet<String> = match min {
                    Some(min) => self
                        .counts
                        .iter()
                        .filter(|(domain, count)| {
                            allows(domain) && **count + own <= min + self.max_skew
                        })
                        .map(|(domain, _)| domain.clone())
                        .collect(),
                    None => BTreeSet::new(),
                };
                if admissible.is_empty() {
                    return match self.policy {
                        UnsatisfiablePolicy::DoNotSchedule => Err(SkyliftError::topology(
                            &self.topology_key,
                            format!("placement in any domain would exceed max skew {}", self.max_skew),
                        )),
                        UnsatisfiablePolicy::ScheduleAnyway => Ok(None),
                    };
                }
                Ok(Some(Requirement::within(&self.topology_key, admissible)))
            }
            TopologyKind::Affinity => {
                let occupied: BTreeSet<String> = self
                    .counts
                    .iter()
                    .filter(|(domain, count)| **count > 0 && allows(domain))
                    .map(|(domain, _)| domain.clone())
                    .collect();
                if !occupied.is_empty() {
                    return Ok(Some(Requirement::within(&self.topology_key, occupied)));
                }
                // a workload matching its own affinity selector may seed the
                // group in any known domain
                if self.counts_workload(workload) {
                    let seedable: BTreeSet<String> = self
                        .counts
                        .keys()
                        .filter(|domain| allows(domain))
                        .cloned()
                        .collect();
                    if !seedable.is_empty() {
                        return Ok(Some(Requirement::within(&self.topology_key, seedable)));
                    }
                    return Err(SkyliftError::topology(
                        &self.topology_key,
                        "no domains registered for self-selecting affinity",
                    ));
                }
                Err(SkyliftError::topology(
                    &self.topology_key,
                    "no domain contains a workload matching the affinity selector",
                ))
            }
            TopologyKind::AntiAffinity => {
                let occupied: Vec<String> = self
                    .counts
                    .iter()
                    .filter(|(_, count)| **count > 0)
                    .map(|(domain, _)| domain.clone())
                    .collect();
                Ok(Some(Requirement::without(&self.topology_key, occupied)))
            }
        }
    }
}

/// Topology bookkeeping for one solve
#[derive(Debug, Default)]
pub struct Topology {
    groups: BTreeMap<u64, TopologyGroup>,
    domains: HashMap<String, BTreeSet<String>>,
    scheduled: Vec<ScheduledWorkload>,
    /// What record() wrote per workload, so a re-record can subtract it first
    placements: HashMap<String, Vec<(u64, String)>>,
}

impl Topology {
    /// Index every topology-relevant constraint of the batch
    ///
    /// `domains` is the known universe of values per topology key;
    /// `scheduled` is the cluster snapshot of running workloads.
    pub fn new(
        domains: HashMap<String, BTreeSet<String>>,
        scheduled: Vec<ScheduledWorkload>,
        batch: &[Workload],
    ) -> Self {
        let mut topology = Self {
            groups: BTreeMap::new(),
            domains,
            scheduled,
            placements: HashMap::new(),
        };
        for workload in batch {
            topology.index_workload(workload);
        }
        topology
    }

    /// Record that a domain value exists so spread math sees empty domains
    pub fn register(&mut self, key: &str, domain: &str) {
        self.domains
            .entry(key.to_string())
            .or_default()
            .insert(domain.to_string());
        for group in self.groups.values_mut() {
            if group.topology_key == key {
                group.counts.entry(domain.to_string()).or_insert(0);
            }
        }
    }

    /// Derive admissible topology requirements for a workload and intersect
    /// them with the node's accumulated requirements
    pub fn add_requirements(
        &self,
        workload_requirements: &Requirements,
        node_requirements: &Requirements,
        workload: &Workload,
    ) -> Result<Requirements> {
        let mut combined = node_requirements.clone();
        for group in self.groups.values() {
            if !group.owners.contains(&workload.id) {
                continue;
            }
            let pod_domains = workload_requirements.get(&group.topology_key);
            if let Some(domains) = group.admissible(workload, pod_domains)? {
                combined.add(domains).map_err(|err| match err {
                    SkyliftError::IncompatibleRequirements(key) => SkyliftError::topology(
                        key,
                        "admissible domains conflict with node requirements",
                    ),
                    other => other,
                })?;
            }
        }
        Ok(combined)
    }

    /// Record a successful placement using the domains pinned by the node
    ///
    /// Must run atomically with the placement decision. Any prior recording
    /// for the same workload is subtracted first, so a recompute never
    /// double-counts.
    pub fn record(&mut self, workload: &Workload, node_requirements: &Requirements) {
        self.subtract(&workload.id);
        let mut ledger = Vec::new();
        for (group_key, group) in self.groups.iter_mut() {
            if !group.counts_workload(workload) {
                continue;
            }
            let Some(requirement) = node_requirements.get(&group.topology_key) else {
                continue;
            };
            let Some(values) = requirement.values() else {
                // an unpinned cofinite domain set cannot be counted
                debug!(key = %group.topology_key, workload = %workload.name, "skipping topology record for unpinned domain");
                continue;
            };
            match group.kind {
                // anti-affinity blocks out every domain the node could land in
                TopologyKind::AntiAffinity => {
                    for value in values {
                        group.increment(value);
                        ledger.push((*group_key, value.clone()));
                    }
                }
                // spread and affinity count only a single committed domain
                _ => {
                    if values.len() == 1 {
                        if let Some(value) = values.iter().next() {
                            group.increment(value);
                            ledger.push((*group_key, value.clone()));
                        }
                    }
                }
            }
        }
        if !ledger.is_empty() {
            self.placements.insert(workload.id.clone(), ledger);
        }
    }

    /// Recompute a workload's group memberships after its soft constraints
    /// were relaxed
    pub fn update(&mut self, workload: &Workload) {
        for group in self.groups.values_mut() {
            group.owners.remove(&workload.id);
        }
        self.index_workload(workload);
    }

    /// Number of topology groups currently tracked
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    fn index_workload(&mut self, workload: &Workload) {
        for constraint in &workload.topology_spread {
            self.own_group(GroupSpec::from_spread(constraint, &workload.namespace), &workload.id);
        }
        let Some(affinity) = &workload.affinity else {
            return;
        };
        if let Some(terms) = &affinity.workload_affinity {
            for term in terms.terms() {
                self.own_group(
                    GroupSpec::from_term(TopologyKind::Affinity, term, &workload.namespace),
                    &workload.id,
                );
            }
        }
        if let Some(terms) = &affinity.workload_anti_affinity {
            for term in terms.terms() {
                self.own_group(
                    GroupSpec::from_term(TopologyKind::AntiAffinity, term, &workload.namespace),
                    &workload.id,
                );
            }
        }
    }

    fn own_group(&mut self, spec: GroupSpec, owner: &str) {
        let key = spec.key();
        if !self.groups.contains_key(&key) {
            let group = build_group(spec, &self.domains, &self.scheduled);
            self.groups.insert(key, group);
        }
        if let Some(group) = self.groups.get_mut(&key) {
            group.owners.insert(owner.to_string());
        }
    }

    fn subtract(&mut self, workload_id: &str) {
        if let Some(entries) = self.placements.remove(workload_id) {
            for (group_key, domain) in entries {
                if let Some(group) = self.groups.get_mut(&group_key) {
                    group.decrement(&domain);
                }
            }
        }
    }
}

fn build_group(
    spec: GroupSpec,
    domains: &HashMap<String, BTreeSet<String>>,
    scheduled: &[ScheduledWorkload],
) -> TopologyGroup {
    let mut group = TopologyGroup {
        kind: spec.kind,
        topology_key: spec.topology_key,
        selector: spec.selector,
        namespaces: spec.namespaces,
        max_skew: spec.max_skew,
        policy: spec.policy,
        owners: BTreeSet::new(),
        counts: BTreeMap::new(),
    };
    if let Some(universe) = domains.get(&group.topology_key) {
        for domain in universe {
            group.counts.insert(domain.clone(), 0);
        }
    }
    for entry in scheduled {
        if group.counts_workload(&entry.workload) {
            if let Some(domain) = entry.node_labels.get(&group.topology_key) {
                *group.counts.entry(domain.clone()).or_insert(0) += 1;
            }
        }
    }
    group
}
