//! Scheduling solver for Skylift
//!
//! Given a batch of unschedulable workloads, the solver either nominates each
//! workload to an in-flight node or synthesizes prospective nodes constrained
//! by the surviving instance-type candidates, honoring:
//! - Taints/tolerations and host-port uniqueness
//! - Node affinity and workload affinity/anti-affinity
//! - Topology spread constraints
//! - Per-provisioner resource limits (pessimistically reserved)
//!
//! The loop is greedy with fixed tie-breaks, relaxes soft constraints on
//! failure, and runs single-threaded for the duration of a solve.

pub mod existing;
pub mod hostports;
pub mod node;
pub mod preferences;
pub mod queue;
pub mod template;
pub mod topology;
pub mod workload;

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use crate::error::{Result, SkyliftError};
use crate::events::{Event, Recorder};
use crate::metrics::SchedulingMetrics;
use crate::resources::Resources;
use crate::state::{ClusterState, StateNode};

pub use existing::ExistingNode;
pub use node::ProspectiveNode;
pub use preferences::Preferences;
pub use queue::WorkQueue;
pub use template::{labels, InstanceType, MachineTemplate, Offering, Provisioner};
pub use topology::{ScheduledWorkload, Topology};
pub use workload::{
    Affinity, AffinityRule, HostPort, LabelSelector, NodeAffinity, Protocol, Taint, TaintEffect,
    Toleration, TolerationOperator, TopologySpreadConstraint, UnsatisfiablePolicy,
    WeightedAffinityRule, WeightedWorkloadAffinityTerm, Workload, WorkloadAffinity,
    WorkloadAffinityTerm,
};

/// Cooperative cancellation handle threaded through every solver operation
///
/// Cancelling aborts the current placement attempt with
/// [`SkyliftError::Cancelled`], which propagates fatally out of the solve.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    /// Create a live handle
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation was signalled
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Options controlling a solve
#[derive(Debug, Clone, Default)]
pub struct SchedulerOptions {
    /// Suppress event emission and metrics; used by consolidation to
    /// evaluate hypothetical solves
    pub simulation_mode: bool,
}

impl SchedulerOptions {
    /// Create default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable simulation mode
    pub fn simulation(mut self, enabled: bool) -> Self {
        self.simulation_mode = enabled;
        self
    }
}

/// Result of a completed solve
#[derive(Debug)]
pub struct Solution {
    /// Prospective nodes to launch, each with its committed workloads and
    /// narrowed instance-type options
    pub new_nodes: Vec<ProspectiveNode>,
    /// In-flight nodes, some with newly nominated workloads
    pub existing_nodes: Vec<ExistingNode>,
    /// Workload id to the last error for everything that did not schedule
    pub unschedulable: HashMap<String, SkyliftError>,
}

/// The scheduling solver
pub struct Scheduler {
    templates: Vec<MachineTemplate>,
    new_nodes: Vec<ProspectiveNode>,
    existing_nodes: Vec<ExistingNode>,
    /// Provisioner name to remaining resources under its declared limits
    remaining: HashMap<String, Resources>,
    instance_types: HashMap<String, Vec<InstanceType>>,
    daemon_overhead: HashMap<String, Resources>,
    preferences: Preferences,
    topology: Topology,
    cluster: Arc<ClusterState>,
    recorder: Arc<dyn Recorder>,
    metrics: Option<Arc<SchedulingMetrics>>,
    options: SchedulerOptions,
}

impl Scheduler {
    /// Construct a solver over a captured snapshot
    ///
    /// `state_nodes` are the committed nodes to bin-pack against; nodes not
    /// launched by a recognized provisioner are ignored. Declared provisioner
    /// limits are reduced by the capacities of those live nodes.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        templates: Vec<MachineTemplate>,
        provisioners: &[Provisioner],
        cluster: Arc<ClusterState>,
        state_nodes: &[StateNode],
        mut topology: Topology,
        instance_types: HashMap<String, Vec<InstanceType>>,
        daemon_overhead: HashMap<String, Resources>,
        recorder: Arc<dyn Recorder>,
        options: SchedulerOptions,
    ) -> Self {
        // if any provisioner taints nodes with PreferNoSchedule, relaxation
        // may add a matching universal toleration
        let tolerate_prefer_no_schedule = provisioners.iter().any(|p| {
            p.taints
                .iter()
                .any(|t| t.effect == TaintEffect::PreferNoSchedule)
        });

        let mut remaining = HashMap::new();
        for provisioner in provisioners {
            if let Some(limits) = &provisioner.limits {
                remaining.insert(provisioner.name.clone(), limits.clone());
            }
        }

        let mut scheduler = Self {
            templates,
            new_nodes: Vec::new(),
            existing_nodes: Vec::new(),
            remaining,
            instance_types,
            daemon_overhead,
            preferences: Preferences::new(tolerate_prefer_no_schedule),
            topology: Topology::default(),
            cluster,
            recorder,
            metrics: None,
            options,
        };
        scheduler.calculate_existing_nodes(state_nodes, &mut topology);
        scheduler.topology = topology;
        scheduler
    }

    /// Attach a metrics registry
    pub fn with_metrics(mut self, metrics: Arc<SchedulingMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn calculate_existing_nodes(&mut self, state_nodes: &[StateNode], topology: &mut Topology) {
        for node in state_nodes {
            let Some(name) = node.provisioner_name() else {
                // not launched by us
                continue;
            };
            let Some(template) = self
                .templates
                .iter()
                .find(|t| t.provisioner_name == name)
            else {
                // launched by a provisioner we no longer recognize
                continue;
            };
            let overhead = self
                .daemon_overhead
                .get(name)
                .cloned()
                .unwrap_or_default();
            self.existing_nodes.push(ExistingNode::new(
                node,
                topology,
                &template.startup_taints,
                &overhead,
            ));
            // recompute remaining limits from actual capacities rather than
            // trusting any cached usage
            if let Some(budget) = self.remaining.get_mut(name) {
                *budget = subtract_from_budget(budget, &node.capacity);
            }
        }
    }

    /// Schedule a batch of workloads
    ///
    /// Keeps attempting workloads while progress is being made; a failed
    /// workload is relaxed and retried until nothing is left to relax. The
    /// returned solution owns the prospective nodes (finalized, with the
    /// synthetic hostname stripped), the in-flight nominations, and the error
    /// per workload that did not schedule.
    pub fn solve(mut self, cancel: &Cancellation, workloads: &[Workload]) -> Result<Solution> {
        let start = Instant::now();
        let mut errors: HashMap<String, SkyliftError> = HashMap::new();
        let mut queue = WorkQueue::new(workloads.to_vec());

        while let Some(mut workload) = queue.pop() {
            match self.add(cancel, &workload) {
                Ok(()) => {
                    errors.remove(&workload.id);
                }
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => {
                    // keep the latest attempt's error and relax one soft
                    // constraint before the next pass
                    errors.insert(workload.id.clone(), err);
                    let relaxed = self.preferences.relax(&mut workload);
                    if relaxed {
                        self.topology.update(&workload);
                    }
                    queue.push(workload, relaxed);
                }
            }
        }

        for node in &mut self.new_nodes {
            node.finalize_scheduling();
        }

        let failed = queue.into_remaining();
        if !self.options.simulation_mode {
            self.record_results(workloads, &failed, &errors, start.elapsed());
        }

        let unschedulable = failed
            .iter()
            .filter_map(|w| errors.get(&w.id).map(|e| (w.id.clone(), e.clone())))
            .collect();
        Ok(Solution {
            new_nodes: self.new_nodes,
            existing_nodes: self.existing_nodes,
            unschedulable,
        })
    }

    fn add(&mut self, cancel: &Cancellation, workload: &Workload) -> Result<()> {
        let Self {
            templates,
            new_nodes,
            existing_nodes,
            remaining,
            instance_types,
            daemon_overhead,
            topology,
            options,
            ..
        } = self;

        // first try to nominate against an in-flight real node
        for existing in existing_nodes.iter_mut() {
            match existing.add(cancel, workload, topology) {
                Ok(()) => return Ok(()),
                Err(err) if err.is_cancelled() => return Err(err),
                Err(_) => {}
            }
        }

        // emptier prospective nodes first to spread load
        new_nodes.sort_by_key(|n| n.workloads.len());
        for node in new_nodes.iter_mut() {
            match node.add(cancel, workload, topology) {
                Ok(()) => return Ok(()),
                Err(err) if err.is_cancelled() => return Err(err),
                Err(_) => {}
            }
        }

        // synthesize a new node from the first template that accepts
        let mut rejections = Vec::new();
        for template in templates.iter() {
            let mut candidates = instance_types
                .get(&template.provisioner_name)
                .cloned()
                .unwrap_or_default();
            if let Some(budget) = remaining.get(&template.provisioner_name) {
                let filtered = filter_by_remaining(&candidates, budget);
                if filtered.is_empty() {
                    rejections.push(SkyliftError::ProvisionerIncompatible {
                        provisioner: template.provisioner_name.clone(),
                        reason: Box::new(SkyliftError::ProvisionerLimitExceeded),
                    });
                    continue;
                }
                if filtered.len() != candidates.len() && !options.simulation_mode {
                    debug!(
                        provisioner = %template.provisioner_name,
                        excluded = candidates.len() - filtered.len(),
                        total = candidates.len(),
                        "instance types excluded to stay within provisioner limits"
                    );
                }
                candidates = filtered;
            }

            let overhead = daemon_overhead
                .get(&template.provisioner_name)
                .cloned()
                .unwrap_or_default();
            let mut node = ProspectiveNode::new(template, topology, overhead, candidates);
            match node.add(cancel, workload, topology) {
                Ok(()) => {
                    // reserve the pessimistic maximum so the provisioner
                    // limit can never be overcommitted
                    if let Some(budget) = remaining.get_mut(&template.provisioner_name) {
                        *budget = subtract_max(budget, &node.instance_type_options);
                    }
                    new_nodes.push(node);
                    return Ok(());
                }
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => rejections.push(SkyliftError::ProvisionerIncompatible {
                    provisioner: template.provisioner_name.clone(),
                    reason: Box::new(err),
                }),
            }
        }
        if rejections.is_empty() {
            return Err(SkyliftError::internal("no machine templates configured"));
        }
        Err(SkyliftError::combine(rejections))
    }

    fn record_results(
        &self,
        batch: &[Workload],
        failed: &[Workload],
        errors: &HashMap<String, SkyliftError>,
        elapsed: Duration,
    ) {
        for workload in failed {
            let reason = errors
                .get(&workload.id)
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown scheduling failure".to_string());
            error!(workload = %workload.name, %reason, "could not schedule workload");
            self.recorder.publish(Event::WorkloadFailedToSchedule {
                workload_id: workload.id.clone(),
                workload_name: workload.name.clone(),
                reason,
            });
        }

        let mut nominated = 0usize;
        let mut nominated_nodes = 0usize;
        for node in &self.existing_nodes {
            if node.workloads.is_empty() {
                continue;
            }
            nominated_nodes += 1;
            nominated += node.workloads.len();
            self.cluster.nominate_node(&node.name);
            for workload in &node.workloads {
                self.recorder.publish(Event::NominateWorkload {
                    workload_id: workload.id.clone(),
                    workload_name: workload.name.clone(),
                    node: node.name.clone(),
                });
            }
        }

        let new_count: usize = self.new_nodes.iter().map(|n| n.workloads.len()).sum();
        if let Some(metrics) = &self.metrics {
            metrics.solve_duration.observe(elapsed.as_secs_f64());
            metrics.workloads_scheduled.inc_by((new_count + nominated) as f64);
            metrics.workloads_unschedulable.inc_by(failed.len() as f64);
            metrics.nodes_created.inc_by(self.new_nodes.len() as f64);
            metrics.workloads_nominated.inc_by(nominated as f64);
        }

        if new_count == 0 {
            return;
        }
        info!(workloads = batch.len(), "found provisionable workload(s)");
        info!(
            new_nodes = self.new_nodes.len(),
            workloads = new_count,
            "computed new node(s) to fit workload(s)"
        );
        if nominated == 0 {
            return;
        }
        info!(
            nodes = nominated_nodes,
            workloads = nominated,
            "in-flight node(s) will fit workload(s)"
        );
    }
}

/// Collect the known topology domain universe from templates, instance
/// types, and live nodes
pub fn discover_domains(
    templates: &[MachineTemplate],
    instance_types: &HashMap<String, Vec<InstanceType>>,
    nodes: &[StateNode],
) -> HashMap<String, BTreeSet<String>> {
    let mut domains: HashMap<String, BTreeSet<String>> = HashMap::new();
    let mut collect = |requirements: &crate::requirements::Requirements| {
        for requirement in requirements.iter() {
            if let Some(values) = requirement.values() {
                domains
                    .entry(requirement.key().to_string())
                    .or_default()
                    .extend(values.iter().cloned());
            }
        }
    };
    for template in templates {
        collect(&template.requirements);
    }
    for candidates in instance_types.values() {
        for instance_type in candidates {
            collect(&instance_type.requirements);
        }
    }
    for candidates in instance_types.values() {
        for instance_type in candidates {
            for offering in instance_type.available_offerings() {
                domains
                    .entry(labels::ZONE.to_string())
                    .or_default()
                    .insert(offering.zone.clone());
                domains
                    .entry(labels::CAPACITY_TYPE.to_string())
                    .or_default()
                    .insert(offering.capacity_type.clone());
            }
        }
    }
    for node in nodes {
        for (key, value) in &node.labels {
            domains.entry(key.clone()).or_default().insert(value.clone());
        }
    }
    domains
}

/// Remaining resources after pessimistically reserving a new node
///
/// Subtracts the elementwise maximum capacity across the node's surviving
/// instance-type candidates. This overestimates consumption and may reject a
/// later workload that would in fact have fit, in exchange for never
/// overcommitting a provisioner limit.
fn subtract_max(remaining: &Resources, instance_types: &[InstanceType]) -> Resources {
    if instance_types.is_empty() {
        return remaining.clone();
    }
    let mut max = Resources::new();
    for instance_type in instance_types {
        max = max.max(&instance_type.capacity);
    }
    subtract_from_budget(remaining, &max)
}

/// Subtract usage from a budget, tracking only the resources the budget
/// already names
fn subtract_from_budget(budget: &Resources, usage: &Resources) -> Resources {
    budget
        .iter()
        .map(|(name, quantity)| (name.to_string(), quantity - usage.get(name)))
        .collect()
}

/// Drop instance types whose capacity exceeds the remaining budget on any
/// resource the budget tracks
fn filter_by_remaining(instance_types: &[InstanceType], remaining: &Resources) -> Vec<InstanceType> {
    instance_types
        .iter()
        .filter(|it| !it.capacity.exceeds_any(remaining))
        .cloned()
        .collect()
}
