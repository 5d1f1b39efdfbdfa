//! Prospective nodes
//!
//! A prospective node is a set of accumulated constraints, compatible
//! workloads, and surviving instance types that could satisfy them. It is
//! turned into a real machine after the solve; until then every `add`
//! narrows its instance-type options monotonically.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Result, SkyliftError};
use crate::requirements::{Requirement, Requirements};
use crate::resources::Resources;
use crate::scheduler::hostports::HostPortUsage;
use crate::scheduler::template::{labels, InstanceType, MachineTemplate};
use crate::scheduler::topology::Topology;
use crate::scheduler::workload::{ensure_tolerates, Taint, Workload};
use crate::scheduler::Cancellation;

/// Process-wide counter behind synthetic hostnames; solves running
/// concurrently in simulation must not collide.
static NODE_ID: AtomicU64 = AtomicU64::new(0);

/// An under-construction node the solver may commit for launch
#[derive(Debug, Clone)]
pub struct ProspectiveNode {
    /// Name of the provisioner whose template spawned this node
    pub provisioner_name: String,
    /// Synthetic hostname; stripped again by `finalize_scheduling`
    pub hostname: String,
    /// Accumulated requirements of the node and every workload on it
    pub requirements: Requirements,
    /// Taints every workload must tolerate
    pub taints: Vec<Taint>,
    /// Accumulated requests including daemon overhead
    pub requests: Resources,
    /// Surviving instance-type candidates, narrowed by every placement
    pub instance_type_options: Vec<InstanceType>,
    /// Workloads committed to this node
    pub workloads: Vec<Workload>,
    host_ports: HostPortUsage,
}

impl ProspectiveNode {
    /// Create a node from a template and register its synthetic hostname
    pub(crate) fn new(
        template: &MachineTemplate,
        topology: &mut Topology,
        daemon_overhead: Resources,
        instance_types: Vec<InstanceType>,
    ) -> Self {
        let hostname = format!(
            "hostname-placeholder-{:04}",
            NODE_ID.fetch_add(1, Ordering::Relaxed) + 1
        );
        topology.register(labels::HOSTNAME, &hostname);

        let mut requirements = template.requirements.clone();
        requirements.set(Requirement::within(labels::HOSTNAME, [hostname.clone()]));

        Self {
            provisioner_name: template.provisioner_name.clone(),
            hostname,
            requirements,
            taints: template.taints.clone(),
            requests: daemon_overhead,
            instance_type_options: instance_types,
            workloads: Vec::new(),
            host_ports: HostPortUsage::new(),
        }
    }

    /// Try to place a workload on this node
    ///
    /// Checks run in order and short-circuit: taints, host ports, requirement
    /// compatibility, topology, request accumulation, instance-type survival.
    /// On failure the node is left unchanged.
    pub(crate) fn add(
        &mut self,
        cancel: &Cancellation,
        workload: &Workload,
        topology: &mut Topology,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(SkyliftError::Cancelled);
        }

        ensure_tolerates(&self.taints, workload)?;
        self.host_ports.validate(workload)?;

        let workload_requirements = workload.requirements()?;
        let mut node_requirements = self.requirements.clone();
        node_requirements.compatible(&workload_requirements)?;
        node_requirements.add_all(&workload_requirements)?;

        let topology_requirements =
            topology.add_requirements(&workload_requirements, &node_requirements, workload)?;
        node_requirements.compatible(&topology_requirements)?;
        node_requirements.add_all(&topology_requirements)?;

        let requests = self.requests.add(&workload.requests);
        let instance_types =
            filter_instance_types(&self.instance_type_options, &node_requirements, &requests);
        if instance_types.is_empty() {
            return Err(SkyliftError::NoInstanceTypeFits {
                requests: workload.requests.to_string(),
                requirements: node_requirements.to_string(),
            });
        }

        self.workloads.push(workload.clone());
        self.instance_type_options = instance_types;
        self.requests = requests;
        self.requirements = node_requirements;
        topology.record(workload, &self.requirements);
        self.host_ports.add(workload);
        Ok(())
    }

    /// Strip the synthetic hostname once all scheduling has completed
    ///
    /// Downstream consumers must neither see the placeholder nor surface it
    /// in error messages.
    pub fn finalize_scheduling(&mut self) {
        self.requirements.remove(labels::HOSTNAME);
    }
}

impl fmt::Display for ProspectiveNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "node with {} workloads requesting {} from types {}",
            self.workloads.len(),
            self.requests,
            instance_type_list(&self.instance_type_options)
        )
    }
}

/// Render at most five instance type names, then a remainder count
pub(crate) fn instance_type_list(options: &[InstanceType]) -> String {
    let mut out = String::new();
    for (i, it) in options.iter().enumerate() {
        if i > 4 {
            out.push_str(&format!(" and {} other(s)", options.len() - i));
            break;
        }
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(&it.name);
    }
    out
}

pub(crate) fn filter_instance_types(
    options: &[InstanceType],
    requirements: &Requirements,
    requests: &Resources,
) -> Vec<InstanceType> {
    options
        .iter()
        .filter(|it| compatible(it, requirements) && fits(it, requests) && has_offering(it, requirements))
        .cloned()
        .collect()
}

fn compatible(instance_type: &InstanceType, requirements: &Requirements) -> bool {
    instance_type.requirements.compatible(requirements).is_ok()
}

fn fits(instance_type: &InstanceType, requests: &Resources) -> bool {
    requests
        .add(&instance_type.overhead)
        .fits(&instance_type.capacity)
}

fn has_offering(instance_type: &InstanceType, requirements: &Requirements) -> bool {
    instance_type.available_offerings().any(|offering| {
        requirements
            .get(labels::ZONE)
            .map(|r| r.has(&offering.zone))
            .unwrap_or(true)
            && requirements
                .get(labels::CAPACITY_TYPE)
                .map(|r| r.has(&offering.capacity_type))
                .unwrap_or(true)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::requirements::ConstraintExpression;
    use crate::scheduler::template::Offering;
    use crate::scheduler::workload::{Affinity, AffinityRule, NodeAffinity, TaintEffect};
    use std::collections::HashMap;

    fn instance(name: &str, cpu: i64, zone: &str) -> InstanceType {
        let mut requirements = Requirements::new();
        requirements.set(Requirement::within(labels::ZONE, [zone]));
        InstanceType::new(name, Resources::new().cpu(cpu).memory(8 << 30))
            .with_requirements(requirements)
            .with_offering(Offering::new(zone, "on-demand"))
    }

    fn empty_topology() -> Topology {
        Topology::new(HashMap::new(), Vec::new(), &[])
    }

    #[test]
    fn test_add_narrows_instance_types() {
        let template = MachineTemplate::new("default");
        let mut topology = empty_topology();
        let mut node = ProspectiveNode::new(
            &template,
            &mut topology,
            Resources::new(),
            vec![instance("small", 1000, "z1"), instance("large", 8000, "z1")],
        );

        let cancel = Cancellation::new();
        let workload = Workload::new("api").with_requests(Resources::new().cpu(4000));
        node.add(&cancel, &workload, &mut topology).unwrap();

        assert_eq!(node.workloads.len(), 1);
        assert_eq!(node.instance_type_options.len(), 1);
        assert_eq!(node.instance_type_options[0].name, "large");
    }

    #[test]
    fn test_failed_add_leaves_node_unchanged() {
        let template = MachineTemplate::new("default");
        let mut topology = empty_topology();
        let mut node = ProspectiveNode::new(
            &template,
            &mut topology,
            Resources::new(),
            vec![instance("small", 1000, "z1")],
        );

        let cancel = Cancellation::new();
        let fits = Workload::new("a").with_requests(Resources::new().cpu(500));
        node.add(&cancel, &fits, &mut topology).unwrap();
        let snapshot = (node.requests.clone(), node.instance_type_options.len());

        let too_big = Workload::new("b").with_requests(Resources::new().cpu(5000));
        assert!(matches!(
            node.add(&cancel, &too_big, &mut topology),
            Err(SkyliftError::NoInstanceTypeFits { .. })
        ));
        assert_eq!(node.workloads.len(), 1);
        assert_eq!((node.requests.clone(), node.instance_type_options.len()), snapshot);
    }

    #[test]
    fn test_taints_must_be_tolerated() {
        let template = MachineTemplate::new("gpu")
            .with_taint(Taint::new("gpu", "true", TaintEffect::NoSchedule));
        let mut topology = empty_topology();
        let mut node = ProspectiveNode::new(
            &template,
            &mut topology,
            Resources::new(),
            vec![instance("small", 1000, "z1")],
        );

        let cancel = Cancellation::new();
        let workload = Workload::new("api");
        assert!(matches!(
            node.add(&cancel, &workload, &mut topology),
            Err(SkyliftError::TaintNotTolerated(_))
        ));
    }

    #[test]
    fn test_zone_requirement_rejects_wrong_offering() {
        let template = MachineTemplate::new("default");
        let mut topology = empty_topology();
        let mut node = ProspectiveNode::new(
            &template,
            &mut topology,
            Resources::new(),
            vec![instance("small", 4000, "z2")],
        );

        let cancel = Cancellation::new();
        let workload = Workload::new("api").with_affinity(Affinity::new().with_node_affinity(
            NodeAffinity::new().require(
                AffinityRule::new().with_expression(ConstraintExpression::within(labels::ZONE, ["z1"])),
            ),
        ));
        assert!(matches!(
            node.add(&cancel, &workload, &mut topology),
            Err(SkyliftError::NoInstanceTypeFits { .. })
        ));
    }

    #[test]
    fn test_hostnames_are_unique_and_stripped() {
        let template = MachineTemplate::new("default");
        let mut topology = empty_topology();
        let a = ProspectiveNode::new(&template, &mut topology, Resources::new(), vec![]);
        let b = ProspectiveNode::new(&template, &mut topology, Resources::new(), vec![]);
        assert_ne!(a.hostname, b.hostname);
        assert!(a.requirements.has(labels::HOSTNAME));

        let mut a = a;
        a.finalize_scheduling();
        assert!(!a.requirements.has(labels::HOSTNAME));
    }

    #[test]
    fn test_cancellation_aborts_add() {
        let template = MachineTemplate::new("default");
        let mut topology = empty_topology();
        let mut node = ProspectiveNode::new(
            &template,
            &mut topology,
            Resources::new(),
            vec![instance("small", 1000, "z1")],
        );

        let cancel = Cancellation::new();
        cancel.cancel();
        assert!(matches!(
            node.add(&cancel, &Workload::new("api"), &mut topology),
            Err(SkyliftError::Cancelled)
        ));
    }

    #[test]
    fn test_instance_type_list_truncates() {
        let options: Vec<InstanceType> = (0..8)
            .map(|i| InstanceType::new(format!("t{}", i), Resources::new()))
            .collect();
        let rendered = instance_type_list(&options);
        assert!(rendered.starts_with("t0, t1, t2, t3, t4"));
        assert!(rendered.ends_with("and 3 other(s)"));
    }
}
