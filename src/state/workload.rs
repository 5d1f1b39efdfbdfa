//! Workload stream reconciler
//!
//! Mirror of the node reconciler for workload records: a lookup miss deletes
//! the record, successful reconciles requeue after the resync period.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::controller::{ControllerOptions, ReconcileOutcome, ReconcileRequest, Reconciler};
use crate::error::Result;
use crate::state::{BoundWorkload, ClusterState};

/// Source of truth for workload records
#[async_trait]
pub trait WorkloadSource: Send + Sync {
    /// Fetch a workload by id; `None` when the workload no longer exists
    async fn get(&self, id: &str) -> Result<Option<BoundWorkload>>;
}

/// Reconciles workloads into the cluster state
pub struct WorkloadStateController {
    source: Arc<dyn WorkloadSource>,
    cluster: Arc<ClusterState>,
    options: ControllerOptions,
}

impl WorkloadStateController {
    /// Create a controller over a workload source
    pub fn new(source: Arc<dyn WorkloadSource>, cluster: Arc<ClusterState>) -> Self {
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
impl Reconciler for WorkloadStateController {
    fn name(&self) -> &str {
        "workload-state"
    }

    async fn reconcile(&self, request: ReconcileRequest) -> Result<ReconcileOutcome> {
        match self.source.get(&request.key).await? {
            None => {
                self.cluster.delete_workload(&request.key);
                Ok(ReconcileOutcome::done())
            }
            Some(workload) => {
                debug!(workload = %workload.workload.name, "resyncing workload");
                self.cluster.update_workload(workload);
                Ok(ReconcileOutcome::requeue_after(self.options.resync_period))
            }
        }
    }
}
