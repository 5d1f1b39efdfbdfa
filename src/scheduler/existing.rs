//! In-flight node wrapper
//!
//! A bin-packable view of a real node that is already committed for launch
//! but not yet ready. Its labels are fixed, its capacity is known, and only
//! startup taints apply: workloads that tolerate just those may still be
//! nominated to it.

use std::fmt;

use crate::error::{Result, SkyliftError};
use crate::requirements::{Requirement, Requirements};
use crate::resources::Resources;
use crate::scheduler::hostports::HostPortUsage;
use crate::scheduler::template::labels;
use crate::scheduler::topology::Topology;
use crate::scheduler::workload::{ensure_tolerates, Taint, Workload};
use crate::scheduler::Cancellation;
use crate::state::StateNode;

/// A bin-packable view of an already-committed node
#[derive(Debug, Clone)]
pub struct ExistingNode {
    /// Node name
    pub name: String,
    /// Requirements formed from the node's concrete labels
    pub requirements: Requirements,
    /// Startup taints still present while the node boots
    pub taints: Vec<Taint>,
    /// Capacity not yet claimed by running workloads
    pub available: Resources,
    /// Requests accumulated during this solve, seeded with the daemon
    /// overhead that has not yet landed on the node
    pub requests: Resources,
    /// Workloads nominated to this node during the solve
    pub workloads: Vec<Workload>,
    host_ports: HostPortUsage,
}

impl ExistingNode {
    /// Wrap a state node for one solve
    pub(crate) fn new(
        node: &StateNode,
        topology: &mut Topology,
        startup_taints: &[Taint],
        daemon_overhead: &Resources,
    ) -> Self {
        topology.register(labels::HOSTNAME, &node.name);

        let mut requirements = Requirements::from_labels(&node.labels);
        requirements.set(Requirement::within(labels::HOSTNAME, [node.name.clone()]));

        let mut host_ports = HostPortUsage::new();
        for workload in &node.workloads {
            host_ports.add(workload);
        }

        Self {
            name: node.name.clone(),
            requirements,
            taints: startup_taints.to_vec(),
            available: node.capacity.subtract(&node.allocated),
            requests: daemon_overhead.saturating_subtract(&node.daemon_requests),
            workloads: Vec::new(),
            host_ports,
        }
    }

    /// Try to nominate a workload to this node
    ///
    /// Same check order as a prospective node, with a plain capacity fit in
    /// place of instance-type survival. On failure the node is unchanged.
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
        if !requests.fits(&self.available) {
            return Err(SkyliftError::InsufficientCapacity {
                available: self.available.to_string(),
            });
        }

        self.workloads.push(workload.clone());
        self.requests = requests;
        self.requirements = node_requirements;
        topology.record(workload, &self.requirements);
        self.host_ports.add(workload);
        Ok(())
    }
}

impl fmt::Display for ExistingNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "in-flight node {} with {} nominated workloads requesting {}",
            self.name,
            self.workloads.len(),
            self.requests
        )
    }
}
