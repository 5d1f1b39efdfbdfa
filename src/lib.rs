//! # Skylift
//!
//! The core of a cluster-autoscaling scheduler: given a batch of currently
//! unschedulable workloads, decide whether each one fits on an existing
//! in-flight node or requires a prospective new node, constrained by a
//! narrowing set of candidate instance types.
//!
//! ## Features
//!
//! - **Requirement algebra**: intersectable finite/cofinite label constraints
//!   with In, NotIn, Exists, DoesNotExist, Gt, Lt operators
//! - **Topology awareness**: spread constraints, workload affinity and
//!   anti-affinity over arbitrary topology keys
//! - **Preference relaxation**: soft constraints are removed stepwise until
//!   a workload becomes schedulable
//! - **Provisioner limits**: pessimistic reservation that never overcommits
//! - **State reconcilers**: node/workload streams kept in sync with
//!   deletion-on-miss semantics
//! - **Metrics**: Prometheus-compatible solve metrics
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use skylift::prelude::*;
//! use skylift::{discover_domains, InstanceType, Offering, Topology};
//! use skylift::events::LogRecorder;
//! use skylift::resources::Resources;
//! use skylift::state::ClusterState;
//!
//! fn main() -> skylift::Result<()> {
//!     let templates = vec![MachineTemplate::new("default")];
//!     let provisioners = vec![Provisioner::new("default")];
//!     let mut instance_types = HashMap::new();
//!     instance_types.insert(
//!         "default".to_string(),
//!         vec![InstanceType::new("m.large", Resources::new().cpu(4000).memory(16 << 30))
//!             .with_offering(Offering::new("z1", "on-demand"))],
//!     );
//!
//!     let cluster = Arc::new(ClusterState::new());
//!     let batch = vec![Workload::new("api").with_requests(Resources::new().cpu(500))];
//!     let domains = discover_domains(&templates, &instance_types, &[]);
//!     let topology = Topology::new(domains, cluster.scheduled_workloads(), &batch);
//!
//!     let scheduler = Scheduler::new(
//!         templates,
//!         &provisioners,
//!         cluster,
//!         &[],
//!         topology,
//!         instance_types,
//!         HashMap::new(),
//!         Arc::new(LogRecorder),
//!         SchedulerOptions::new(),
//!     );
//!     let solution = scheduler.solve(&Cancellation::new(), &batch)?;
//!     println!("computed {} new node(s)", solution.new_nodes.len());
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod controller;
pub mod error;
pub mod events;
pub mod metrics;
pub mod requirements;
pub mod resources;
pub mod scheduler;
pub mod state;

// Re-exports for ergonomic API
pub use error::{Result, SkyliftError};
pub use requirements::{ConstraintExpression, ExpressionOperator, Requirement, Requirements};
pub use resources::Resources;
pub use scheduler::{
    discover_domains, Cancellation, ExistingNode, InstanceType, MachineTemplate, Offering,
    ProspectiveNode, Provisioner, Scheduler, SchedulerOptions, Solution, Topology, Workload,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::error::Result;
    pub use crate::requirements::{ConstraintExpression, Requirement, Requirements};
    pub use crate::resources::Resources;
    pub use crate::scheduler::{
        Affinity, Cancellation, HostPort, LabelSelector, MachineTemplate, NodeAffinity,
        Provisioner, Scheduler, SchedulerOptions, Taint, TaintEffect, Toleration,
        TopologySpreadConstraint, UnsatisfiablePolicy, Workload, WorkloadAffinity,
        WorkloadAffinityTerm,
    };
}
