//! Metrics for the scheduling solver
//!
//! ## Table of Contents
//! - **SchedulingMetrics**: Prometheus registry covering the solve loop

use prometheus::{Counter, Histogram, HistogramOpts, Registry};

use crate::error::Result;

/// Core metrics for solve execution
pub struct SchedulingMetrics {
    registry: Registry,

    /// Wall time of each solve
    pub solve_duration: Histogram,
    /// Workloads successfully placed on new or in-flight nodes
    pub workloads_scheduled: Counter,
    /// Workloads that remained unschedulable after relaxation
    pub workloads_unschedulable: Counter,
    /// Prospective nodes created
    pub nodes_created: Counter,
    /// Workloads nominated to in-flight nodes
    pub workloads_nominated: Counter,
}

impl SchedulingMetrics {
    /// Create and register all metrics
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let solve_duration = Histogram::with_opts(
            HistogramOpts::new("skylift_solve_duration_seconds", "Solve wall time")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        let workloads_scheduled = Counter::new(
            "skylift_workloads_scheduled_total",
            "Workloads placed on new or in-flight nodes",
        )?;
        let workloads_unschedulable = Counter::new(
            "skylift_workloads_unschedulable_total",
            "Workloads that remained unschedulable",
        )?;
        let nodes_created = Counter::new(
            "skylift_nodes_created_total",
            "Prospective nodes created by the solver",
        )?;
        let workloads_nominated = Counter::new(
            "skylift_workloads_nominated_total",
            "Workloads nominated to in-flight nodes",
        )?;

        registry.register(Box::new(solve_duration.clone()))?;
        registry.register(Box::new(workloads_scheduled.clone()))?;
        registry.register(Box::new(workloads_unschedulable.clone()))?;
        registry.register(Box::new(nodes_created.clone()))?;
        registry.register(Box::new(workloads_nominated.clone()))?;

        Ok(Self {
            registry,
            solve_duration,
            workloads_scheduled,
            workloads_unschedulable,
            nodes_created,
            workloads_nominated,
        })
    }

    /// The backing registry, for export
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_and_count() {
        let metrics = SchedulingMetrics::new().unwrap();
        metrics.workloads_scheduled.inc();
        metrics.nodes_created.inc();

        let families = metrics.registry().gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "skylift_workloads_scheduled_total"));
    }
}
