//! Node stream reconciler
//!
//! Keeps the cluster state's node records in sync with the node source. A
//! lookup miss is a deletion; successful reconciles requeue after the resync
//! period so drift self-heals.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::controller::{ControllerOptions, ReconcileOutcome, ReconcileRequest, Reconciler};
use crate::error::Result;
use crate::state::{ClusterState, StateNode};

/// Source of truth for node records
#[async_trait]
pub trait NodeSource: Send + Sync {
    /// Fetch a node by name; `None` when the node no longer exists
    async fn get(&self, name: &str) -> Result<Option<StateNode>>;
}

/// Reconciles nodes into the cluster state
pub struct NodeStateController {
    source: Arc<dyn NodeSource>,
    cluster: Arc<ClusterState>,
    options: ControllerOptions,
}

impl NodeStateController {
    /// Create a controller over a node source
    pub fn new(source: Arc<dyn NodeSource>, cluster: Arc<ClusterState>) -> Self {
        Self {
            source,
            cluster,
            options: ControllerOptions::default(),
        }
    }

    /// Override run-loop options
    pub fn with_options(mut self, options: ControllerOptions) -> Self {
        self.options = options;
        self
    }

    /// The controller's run-loop options
    pub fn options(&self) -> &ControllerOptions {
        &self.options
    }
}

#[async_trait]
impl Reconciler for NodeStateController {
    fn name(&self) -> &str {
        "node-state"
    }

    async fn reconcile(&self, request: ReconcileRequest) -> Result<ReconcileOutcome> {
        match self.source.get(&request.key).await? {
            None => {
                // a lookup miss means the node is gone
                self.cluster.delete_node(&request.key);
                Ok(ReconcileOutcome::done())
            }
            Some(node) => {
                debug!(node = %node.name, "resyncing node");
                self.cluster.update_node(node);
                Ok(ReconcileOutcome::requeue_after(self.options.resync_period))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
    struct FakeNodes {
        nodes: Mutex<HashMap<String, StateNode>>,
    }

    #[async_trait]
    impl NodeSource for FakeNodes {
        async fn get(&self, name: &str) -> Result<Option<StateNode>> {
            Ok(self.nodes.lock().get(name).cloned())
        }
    }

    #[tokio::test]
    async fn test_update_then_delete() {
        let source = Arc::new(FakeNodes::default());
        let cluster = Arc::new(ClusterState::new());
        let controller = NodeStateController::new(source.clone(), cluster.clone());

        source
            .nodes
            .lock()
            .insert("n1".to_string(), StateNode::new("n1"));

        let outcome = controller
            .reconcile(ReconcileRequest::new("n1"))
            .await
            .unwrap();
        assert!(outcome.requeue_after.is_some());
        assert_eq!(cluster.node_count(), 1);

        source.nodes.lock().remove("n1");
        let outcome = controller
            .reconcile(ReconcileRequest::new("n1"))
            .await
            .unwrap();
        assert!(outcome.requeue_after.is_none());
        assert_eq!(cluster.node_count(), 0);
    }
}
