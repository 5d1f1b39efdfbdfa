//! Scheduling event publication
//!
//! The solver publishes one event per unschedulable workload and one per
//! nomination against an in-flight node. In simulation mode nothing is
//! published at all.

use parking_lot::Mutex;
use tracing::{info, warn};

/// A scheduling decision worth surfacing to operators
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A workload remained unschedulable after relaxation
    WorkloadFailedToSchedule {
        /// Workload id
        workload_id: String,
        /// Workload name
        workload_name: String,
        /// The last error the solver saw for this workload
        reason: String,
    },
    /// A workload was nominated to an in-flight node
    NominateWorkload {
        /// Workload id
        workload_id: String,
        /// Workload name
        workload_name: String,
        /// Target node name
        node: String,
    },
}

/// Sink for scheduling events
pub trait Recorder: Send + Sync {
    /// Publish one event
    fn publish(&self, event: Event);
}

/// Recorder that surfaces events through tracing
#[derive(Debug, Default)]
pub struct LogRecorder;

impl Recorder for LogRecorder {
    fn publish(&self, event: Event) {
        match event {
            Event::WorkloadFailedToSchedule {
                workload_name,
                reason,
                ..
            } => {
                warn!(workload = %workload_name, %reason, "workload failed to schedule");
            }
            Event::NominateWorkload {
                workload_name,
                node,
                ..
            } => {
                info!(workload = %workload_name, %node, "workload nominated to in-flight node");
            }
        }
    }
}

/// Recorder that retains events in memory, for tests and simulations
#[derive(Debug, Default)]
pub struct InMemoryRecorder {
    events: Mutex<Vec<Event>>,
}

impl InMemoryRecorder {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// All events published so far
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Number of published events
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Whether nothing was published
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl Recorder for InMemoryRecorder {
    fn publish(&self, event: Event) {
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_recorder_retains_events() {
        let recorder = InMemoryRecorder::new();
        assert!(recorder.is_empty());

        recorder.publish(Event::NominateWorkload {
            workload_id: "id".to_string(),
            workload_name: "api".to_string(),
            node: "n1".to_string(),
        });

        assert_eq!(recorder.len(), 1);
        assert!(matches!(
            recorder.events()[0],
            Event::NominateWorkload { .. }
        ));
    }
}
