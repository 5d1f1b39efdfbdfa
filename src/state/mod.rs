//! Cluster state snapshot
//!
//! The state store is populated concurrently by the node and workload
//! reconcilers and read as a consistent snapshot when a solve starts. The
//! maps are concurrent because up to ten reconciliations run in parallel;
//! the solver itself only ever takes cloned snapshots.

pub mod node;
pub mod workload;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::resources::Resources;
use crate::scheduler::template::labels;
use crate::scheduler::topology::ScheduledWorkload;
use crate::scheduler::workload::Workload;

pub use node::{NodeSource, NodeStateController};
pub use workload::{WorkloadSource, WorkloadStateController};

/// A real cluster node as tracked by the state store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateNode {
    /// Node name
    pub name: String,
    /// Node labels
    pub labels: BTreeMap<String, String>,
    /// Total capacity
    pub capacity: Resources,
    /// Resources claimed by everything currently on the node
    pub allocated: Resources,
    /// The share of `allocated` belonging to daemon workloads
    pub daemon_requests: Resources,
    /// Whether the node has become ready; in-flight nodes have not
    pub initialized: bool,
    /// Workloads currently running on the node
    pub workloads: Vec<Workload>,
    /// Last reconcile timestamp
    pub updated_at: DateTime<Utc>,
}

impl StateNode {
    /// Create a node record; nodes start uninitialized (in-flight)
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            labels: BTreeMap::new(),
            capacity: Resources::new(),
            allocated: Resources::new(),
            daemon_requests: Resources::new(),
            initialized: false,
            workloads: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    /// Add a label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Set total capacity
    pub fn with_capacity(mut self, capacity: Resources) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set currently claimed resources
    pub fn with_allocated(mut self, allocated: Resources) -> Self {
        self.allocated = allocated;
        self
    }

    /// Set the daemon share of claimed resources
    pub fn with_daemon_requests(mut self, daemon_requests: Resources) -> Self {
        self.daemon_requests = daemon_requests;
        self
    }

    /// Mark the node ready
    pub fn initialized(mut self) -> Self {
        self.initialized = true;
        self
    }

    /// Add a running workload
    pub fn with_workload(mut self, workload: Workload) -> Self {
        self.workloads.push(workload);
        self
    }

    /// Name of the provisioner that launched this node, if any
    pub fn provisioner_name(&self) -> Option<&str> {
        self.labels.get(labels::PROVISIONER_NAME).map(String::as_str)
    }
}

/// A workload together with its binding, as tracked by the state store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundWorkload {
    /// The workload
    pub workload: Workload,
    /// Node the workload is bound to, if any
    pub node_name: Option<String>,
    /// Last reconcile timestamp
    pub updated_at: DateTime<Utc>,
}

impl BoundWorkload {
    /// Create an unbound record
    pub fn new(workload: Workload) -> Self {
        Self {
            workload,
            node_name: None,
            updated_at: Utc::now(),
        }
    }

    /// Bind the workload to a node
    pub fn bound_to(mut self, node_name: impl Into<String>) -> Self {
        self.node_name = Some(node_name.into());
        self
    }
}

/// Concurrent store of nodes, workloads, and nominations
#[derive(Debug, Default)]
pub struct ClusterState {
    nodes: DashMap<String, StateNode>,
    workloads: DashMap<String, BoundWorkload>,
    nominated: DashMap<String, DateTime<Utc>>,
}

impl ClusterState {
    /// Create an empty state store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a node record
    pub fn update_node(&self, node: StateNode) {
        debug!(node = %node.name, "updating node state");
        self.nodes.insert(node.name.clone(), node);
    }

    /// Remove a node record
    pub fn delete_node(&self, name: &str) {
        debug!(node = %name, "deleting node state");
        self.nodes.remove(name);
        self.nominated.remove(name);
    }

    /// Insert or replace a workload record
    pub fn update_workload(&self, workload: BoundWorkload) {
        self.workloads.insert(workload.workload.id.clone(), workload);
    }

    /// Remove a workload record
    pub fn delete_workload(&self, id: &str) {
        self.workloads.remove(id);
    }

    /// Snapshot of all nodes, ordered by name
    pub fn nodes(&self) -> Vec<StateNode> {
        let mut nodes: Vec<StateNode> = self.nodes.iter().map(|e| e.value().clone()).collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        nodes
    }

    /// Snapshot of nodes that are committed but not yet ready
    pub fn in_flight_nodes(&self) -> Vec<StateNode> {
        self.nodes().into_iter().filter(|n| !n.initialized).collect()
    }

    /// Snapshot of all workload records
    pub fn workloads(&self) -> Vec<BoundWorkload> {
        let mut workloads: Vec<BoundWorkload> =
            self.workloads.iter().map(|e| e.value().clone()).collect();
        workloads.sort_by(|a, b| a.workload.id.cmp(&b.workload.id));
        workloads
    }

    /// Bound workloads joined with the labels of their node, for topology
    /// seeding
    pub fn scheduled_workloads(&self) -> Vec<ScheduledWorkload> {
        self.workloads()
            .into_iter()
            .filter_map(|bound| {
                let node_name = bound.node_name?;
                let node_labels = self.nodes.get(&node_name).map(|n| n.labels.clone())?;
                Some(ScheduledWorkload {
                    workload: bound.workload,
                    node_labels,
                })
            })
            .collect()
    }

    /// Mark a node as nominated to receive pending workloads
    pub fn nominate_node(&self, name: &str) {
        self.nominated.insert(name.to_string(), Utc::now());
    }

    /// Whether a node currently holds a nomination
    pub fn nominated(&self, name: &str) -> bool {
        self.nominated.contains_key(name)
    }

    /// Number of tracked nodes
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of tracked workloads
    pub fn workload_count(&self) -> usize {
        self.workloads.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_lifecycle() {
        let state = ClusterState::new();
        state.update_node(StateNode::new("n1").with_label(labels::ZONE, "z1"));
        assert_eq!(state.node_count(), 1);

        state.nominate_node("n1");
        assert!(state.nominated("n1"));

        state.delete_node("n1");
        assert_eq!(state.node_count(), 0);
        assert!(!state.nominated("n1"));
    }

    #[test]
    fn test_in_flight_excludes_initialized() {
        let state = ClusterState::new();
        state.update_node(StateNode::new("ready").initialized());
        state.update_node(StateNode::new("booting"));

        let in_flight = state.in_flight_nodes();
        assert_eq!(in_flight.len(), 1);
        assert_eq!(in_flight[0].name, "booting");
    }

    #[test]
    fn test_scheduled_workloads_join_node_labels() {
        let state = ClusterState::new();
        state.update_node(StateNode::new("n1").with_label(labels::ZONE, "z1"));

        let bound = BoundWorkload::new(Workload::new("api")).bound_to("n1");
        state.update_workload(bound);
        state.update_workload(BoundWorkload::new(Workload::new("pending")));

        let scheduled = state.scheduled_workloads();
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].node_labels.get(labels::ZONE).map(String::as_str), Some("z1"));
    }
}
