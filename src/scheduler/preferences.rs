//! Preference relaxation
//!
//! When a workload fails to schedule, its soft constraints are removed one
//! step at a time until it fits or nothing is left to relax. The order is
//! fixed: preferred workload affinity, preferred workload anti-affinity,
//! preferred node affinity (one weighted group per call, heaviest first),
//! a universal PreferNoSchedule toleration, then ScheduleAnyway spread
//! constraints. Only the solver's cloned scheduling view is mutated.

use tracing::debug;

use crate::scheduler::workload::{TaintEffect, Toleration, UnsatisfiablePolicy, Workload};

/// Stepwise removal of soft constraints from a workload
#[derive(Debug, Clone, Default)]
pub struct Preferences {
    /// Whether relaxation may add a universal PreferNoSchedule toleration
    ///
    /// Set when any provisioner declares a PreferNoSchedule taint.
    pub tolerate_prefer_no_schedule: bool,
}

impl Preferences {
    /// Create a relaxer
    pub fn new(tolerate_prefer_no_schedule: bool) -> Self {
        Self {
            tolerate_prefer_no_schedule,
        }
    }

    /// Remove one soft constraint from the workload
    ///
    /// Returns whether a change was made; `false` means nothing is left to
    /// relax and the workload is terminally unschedulable this round.
    pub fn relax(&self, workload: &mut Workload) -> bool {
        self.remove_preferred_affinity(workload)
            || self.remove_preferred_anti_affinity(workload)
            || self.remove_preferred_node_affinity(workload)
            || self.tolerate_prefer_no_schedule_taints(workload)
            || self.remove_schedule_anyway_spread(workload)
    }

    fn remove_preferred_affinity(&self, workload: &mut Workload) -> bool {
        let Some(terms) = workload
            .affinity
            .as_mut()
            .and_then(|a| a.workload_affinity.as_mut())
        else {
            return false;
        };
        if terms.preferred.is_empty() {
            return false;
        }
        debug!(workload = %workload.name, count = terms.preferred.len(), "relaxing preferred workload affinity");
        terms.preferred.clear();
        true
    }

    fn remove_preferred_anti_affinity(&self, workload: &mut Workload) -> bool {
        let Some(terms) = workload
            .affinity
            .as_mut()
            .and_then(|a| a.workload_anti_affinity.as_mut())
        else {
            return false;
        };
        if terms.preferred.is_empty() {
            return false;
        }
        debug!(workload = %workload.name, count = terms.preferred.len(), "relaxing preferred workload anti-affinity");
        terms.preferred.clear();
        true
    }

    fn remove_preferred_node_affinity(&self, workload: &mut Workload) -> bool {
        let Some(node_affinity) = workload
            .affinity
            .as_mut()
            .and_then(|a| a.node_affinity.as_mut())
        else {
            return false;
        };
        // drop the heaviest group so the next-heaviest becomes the active
        // requirement on the following attempt
        let Some(heaviest) = node_affinity
            .preferred
            .iter()
            .enumerate()
            .max_by_key(|(_, w)| w.weight)
            .map(|(index, _)| index)
        else {
            return false;
        };
        let removed = node_affinity.preferred.remove(heaviest);
        debug!(workload = %workload.name, weight = removed.weight, "relaxing preferred node affinity group");
        true
    }

    fn tolerate_prefer_no_schedule_taints(&self, workload: &mut Workload) -> bool {
        if !self.tolerate_prefer_no_schedule {
            return false;
        }
        let universal = Toleration::any_with_effect(TaintEffect::PreferNoSchedule);
        if workload.tolerations.contains(&universal) {
            return false;
        }
        debug!(workload = %workload.name, "adding universal PreferNoSchedule toleration");
        workload.tolerations.push(universal);
        true
    }

    fn remove_schedule_anyway_spread(&self, workload: &mut Workload) -> bool {
        let before = workload.topology_spread.len();
        workload
            .topology_spread
            .retain(|c| c.when_unsatisfiable == UnsatisfiablePolicy::DoNotSchedule);
        let removed = before - workload.topology_spread.len();
        if removed == 0 {
            return false;
        }
        debug!(workload = %workload.name, count = removed, "relaxing ScheduleAnyway topology spread");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::requirements::ConstraintExpression;
    use crate::scheduler::template::labels;
    use crate::scheduler::workload::{
        Affinity, AffinityRule, LabelSelector, NodeAffinity, TopologySpreadConstraint,
        WorkloadAffinity, WorkloadAffinityTerm,
    };

    fn relaxable_workload() -> Workload {
        let term = WorkloadAffinityTerm::new(labels::ZONE, LabelSelector::new());
        Workload::new("api")
            .with_affinity(
                Affinity::new()
                    .with_node_affinity(
                        NodeAffinity::new()
                            .prefer(
                                10,
                                AffinityRule::new()
                                    .with_expression(ConstraintExpression::within("zone", ["z1"])),
                            )
                            .prefer(
                                50,
                                AffinityRule::new()
                                    .with_expression(ConstraintExpression::within("zone", ["z2"])),
                            ),
                    )
                    .with_workload_affinity(WorkloadAffinity::new().prefer(1, term.clone()))
                    .with_workload_anti_affinity(WorkloadAffinity::new().prefer(1, term)),
            )
            .with_spread(TopologySpreadConstraint::new(
                labels::ZONE,
                1,
                UnsatisfiablePolicy::ScheduleAnyway,
            ))
    }

    #[test]
    fn test_relaxation_order() {
        let preferences = Preferences::new(true);
        let mut workload = relaxable_workload();

        // 1: preferred workload affinity
        assert!(preferences.relax(&mut workload));
        let affinity = workload.affinity.as_ref().unwrap();
        assert!(affinity.workload_affinity.as_ref().unwrap().preferred.is_empty());

        // 2: preferred workload anti-affinity
        assert!(preferences.relax(&mut workload));
        let affinity = workload.affinity.as_ref().unwrap();
        assert!(affinity.workload_anti_affinity.as_ref().unwrap().preferred.is_empty());

        // 3: heaviest preferred node-affinity group first, one per call
        assert!(preferences.relax(&mut workload));
        let node = workload.affinity.as_ref().unwrap().node_affinity.as_ref().unwrap();
        assert_eq!(node.preferred.len(), 1);
        assert_eq!(node.preferred[0].weight, 10);
        assert!(preferences.relax(&mut workload));

        // 4: universal PreferNoSchedule toleration, added once
        assert!(preferences.relax(&mut workload));
        assert_eq!(workload.tolerations.len(), 1);

        // 5: ScheduleAnyway spread constraints
        assert!(preferences.relax(&mut workload));
        assert!(workload.topology_spread.is_empty());

        // nothing left
        assert!(!preferences.relax(&mut workload));
    }

    #[test]
    fn test_relaxation_terminates() {
        let preferences = Preferences::new(true);
        let mut workload = relaxable_workload();
        let preferred_terms = 2; // node-affinity groups relax one per call
        let mut steps = 0;
        while preferences.relax(&mut workload) {
            steps += 1;
            assert!(steps <= 5 + preferred_terms, "relaxation did not terminate");
        }
        assert_eq!(steps, 6);
    }

    #[test]
    fn test_prefer_no_schedule_disabled() {
        let preferences = Preferences::new(false);
        let mut workload = Workload::new("api");
        assert!(!preferences.relax(&mut workload));
        assert!(workload.tolerations.is_empty());
    }

    #[test]
    fn test_do_not_schedule_spread_is_kept() {
        let preferences = Preferences::new(false);
        let mut workload = Workload::new("api")
            .with_spread(TopologySpreadConstraint::new(
                labels::ZONE,
                1,
                UnsatisfiablePolicy::DoNotSchedule,
            ))
            .with_spread(TopologySpreadConstraint::new(
                labels::HOSTNAME,
                1,
                UnsatisfiablePolicy::ScheduleAnyway,
            ));

        assert!(preferences.relax(&mut workload));
        assert_eq!(workload.topology_spread.len(), 1);
        assert!(!preferences.relax(&mut workload));
    }
}
