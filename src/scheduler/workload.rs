//! Workload model and scheduling constraints
//!
//! The unit of scheduling. A workload carries resource requests, node
//! affinity, workload affinity/anti-affinity, topology spread constraints,
//! tolerations and host-port declarations; the solver consumes all of them.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SkyliftError};
use crate::requirements::{ConstraintExpression, Requirement, Requirements};
use crate::resources::Resources;

/// Node taint for scheduling constraints
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Taint {
    /// Taint key
    pub key: String,
    /// Taint value
    pub value: String,
    /// Taint effect
    pub effect: TaintEffect,
}

impl Taint {
    /// Create a new taint
    pub fn new(key: impl Into<String>, value: impl Into<String>, effect: TaintEffect) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            effect,
        }
    }
}

impl fmt::Display for Taint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}:{:?}", self.key, self.value, self.effect)
    }
}

/// Taint effect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaintEffect {
    /// Do not schedule new workloads
    NoSchedule,
    /// Prefer not to schedule
    PreferNoSchedule,
    /// Evict existing workloads
    NoExecute,
}

/// Toleration for node taints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Toleration {
    /// Key to match; `None` matches every key
    pub key: Option<String>,
    /// Operator for matching
    pub operator: TolerationOperator,
    /// Value to match
    pub value: Option<String>,
    /// Effect to tolerate; `None` tolerates every effect
    pub effect: Option<TaintEffect>,
}

impl Toleration {
    /// Tolerate a specific key/value pair
    pub fn equal(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            operator: TolerationOperator::Equal,
            value: Some(value.into()),
            effect: None,
        }
    }

    /// Tolerate any value of a key
    pub fn exists(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            operator: TolerationOperator::Exists,
            value: None,
            effect: None,
        }
    }

    /// Tolerate every taint with the given effect
    pub fn any_with_effect(effect: TaintEffect) -> Self {
        Self {
            key: None,
            operator: TolerationOperator::Exists,
            value: None,
            effect: Some(effect),
        }
    }

    /// Restrict the toleration to a taint effect
    pub fn with_effect(mut self, effect: TaintEffect) -> Self {
        self.effect = Some(effect);
        self
    }

    /// Whether this toleration covers the given taint
    pub fn tolerates(&self, taint: &Taint) -> bool {
        let key_matches = self.key.as_ref().map(|k| k == &taint.key).unwrap_or(true);
        let value_matches = match self.operator {
            TolerationOperator::Exists => true,
            TolerationOperator::Equal => {
                self.value.as_ref().map(|v| v == &taint.value).unwrap_or(false)
            }
        };
        let effect_matches = self.effect.map(|e| e == taint.effect).unwrap_or(true);
        key_matches && value_matches && effect_matches
    }
}

/// Toleration operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TolerationOperator {
    /// Key must equal value
    Equal,
    /// Key must exist
    Exists,
}

/// Label selector for matching workloads
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LabelSelector {
    /// Match labels exactly
    pub match_labels: BTreeMap<String, String>,
    /// Match expressions
    pub match_expressions: Vec<ConstraintExpression>,
}

impl LabelSelector {
    /// Create an empty selector (matches everything)
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a label match
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.match_labels.insert(key.into(), value.into());
        self
    }

    /// Add an expression match
    pub fn with_expression(mut self, expr: ConstraintExpression) -> Self {
        self.match_expressions.push(expr);
        self
    }

    /// Whether a label map satisfies every label and expression
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
            && self.match_expressions.iter().all(|expr| expr.evaluate(labels))
    }
}

/// Affinity rule over node labels
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffinityRule {
    /// Match expressions, all of which must hold
    pub match_expressions: Vec<ConstraintExpression>,
}

impl AffinityRule {
    /// Create an empty rule
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an expression
    pub fn with_expression(mut self, expr: ConstraintExpression) -> Self {
        self.match_expressions.push(expr);
        self
    }
}

/// Weighted affinity rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightedAffinityRule {
    /// Weight (1-100)
    pub weight: i32,
    /// Rule
    pub rule: AffinityRule,
}

/// Node affinity rules
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAffinity {
    /// Required rules (must match)
    pub required: Vec<AffinityRule>,
    /// Preferred rules (soft preference)
    pub preferred: Vec<WeightedAffinityRule>,
}

impl NodeAffinity {
    /// Create new node affinity
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a required rule
    pub fn require(mut self, rule: AffinityRule) -> Self {
        self.required.push(rule);
        self
    }

    /// Add a preferred rule
    pub fn prefer(mut self, weight: i32, rule: AffinityRule) -> Self {
        self.preferred.push(WeightedAffinityRule { weight, rule });
        self
    }
}

/// Workload affinity term
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkloadAffinityTerm {
    /// Label selector for matching workloads
    pub label_selector: LabelSelector,
    /// Topology key whose domains co-locate or separate workloads
    pub topology_key: String,
    /// Namespaces to consider; `None` means the workload's own namespace
    pub namespaces: Option<Vec<String>>,
}

impl WorkloadAffinityTerm {
    /// Create a term over a topology key
    pub fn new(topology_key: impl Into<String>, label_selector: LabelSelector) -> Self {
        Self {
            label_selector,
            topology_key: topology_key.into(),
            namespaces: None,
        }
    }
}

/// Weighted workload affinity term
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightedWorkloadAffinityTerm {
    /// Weight (1-100)
    pub weight: i32,
    /// Affinity term
    pub term: WorkloadAffinityTerm,
}

/// Workload affinity/anti-affinity rules
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadAffinity {
    /// Required terms
    pub required: Vec<WorkloadAffinityTerm>,
    /// Preferred terms
    pub preferred: Vec<WeightedWorkloadAffinityTerm>,
}

impl WorkloadAffinity {
    /// Create empty workload affinity
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a required term
    pub fn require(mut self, term: WorkloadAffinityTerm) -> Self {
        self.required.push(term);
        self
    }

    /// Add a preferred term
    pub fn prefer(mut self, weight: i32, term: WorkloadAffinityTerm) -> Self {
        self.preferred.push(WeightedWorkloadAffinityTerm { weight, term });
        self
    }

    /// All terms currently in force (required plus preferred)
    pub fn terms(&self) -> impl Iterator<Item = &WorkloadAffinityTerm> {
        self.required
            .iter()
            .chain(self.preferred.iter().map(|w| &w.term))
    }
}

/// Affinity configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Affinity {
    /// Node affinity rules
    pub node_affinity: Option<NodeAffinity>,
    /// Workload affinity rules
    pub workload_affinity: Option<WorkloadAffinity>,
    /// Workload anti-affinity rules
    pub workload_anti_affinity: Option<WorkloadAffinity>,
}

impl Affinity {
    /// Create empty affinity
    pub fn new() -> Self {
        Self::default()
    }

    /// Set node affinity
    pub fn with_node_affinity(mut self, affinity: NodeAffinity) -> Self {
        self.node_affinity = Some(affinity);
        self
    }

    /// Set workload affinity
    pub fn with_workload_affinity(mut self, affinity: WorkloadAffinity) -> Self {
        self.workload_affinity = Some(affinity);
        self
    }

    /// Set workload anti-affinity
    pub fn with_workload_anti_affinity(mut self, affinity: WorkloadAffinity) -> Self {
        self.workload_anti_affinity = Some(affinity);
        self
    }
}

/// Policy applied when a topology spread constraint cannot be satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnsatisfiablePolicy {
    /// The constraint is hard; infeasible domains are excluded
    DoNotSchedule,
    /// The constraint is a preference and may be relaxed away
    ScheduleAnyway,
}

/// Topology spread constraint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopologySpreadConstraint {
    /// Maximum allowed difference between domain counts
    pub max_skew: u32,
    /// Topology key whose domains the spread is computed over
    pub topology_key: String,
    /// Policy when no domain satisfies the skew
    pub when_unsatisfiable: UnsatisfiablePolicy,
    /// Which workloads count toward the spread
    pub label_selector: LabelSelector,
}

impl TopologySpreadConstraint {
    /// Create a spread constraint
    pub fn new(
        topology_key: impl Into<String>,
        max_skew: u32,
        when_unsatisfiable: UnsatisfiablePolicy,
    ) -> Self {
        Self {
            max_skew,
            topology_key: topology_key.into(),
            when_unsatisfiable,
            label_selector: LabelSelector::new(),
        }
    }

    /// Set the selector counting workloads toward the spread
    pub fn with_selector(mut self, selector: LabelSelector) -> Self {
        self.label_selector = selector;
        self
    }
}

/// Network protocol of a host port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    /// TCP
    Tcp,
    /// UDP
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
        }
    }
}

/// A host port exposed by a workload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostPort {
    /// Host IP the port binds; `0.0.0.0` collides with every IP
    pub ip: String,
    /// Port number
    pub port: u16,
    /// Protocol
    pub protocol: Protocol,
}

impl HostPort {
    /// Declare a TCP port bound on all interfaces
    pub fn new(port: u16) -> Self {
        Self {
            ip: "0.0.0.0".to_string(),
            port,
            protocol: Protocol::Tcp,
        }
    }

    /// Bind to a specific IP
    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = ip.into();
        self
    }

    /// Set the protocol
    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }
}

/// Workload to be scheduled
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workload {
    /// Unique workload ID
    pub id: String,
    /// Workload name
    pub name: String,
    /// Namespace
    pub namespace: String,
    /// Labels
    pub labels: BTreeMap<String, String>,
    /// Node labels the workload must land on
    pub node_selector: BTreeMap<String, String>,
    /// Resource requests
    pub requests: Resources,
    /// Affinity rules
    pub affinity: Option<Affinity>,
    /// Topology spread constraints
    pub topology_spread: Vec<TopologySpreadConstraint>,
    /// Tolerations for taints
    pub tolerations: Vec<Toleration>,
    /// Declared host ports
    pub host_ports: Vec<HostPort>,
    /// Creation timestamp
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Workload {
    /// Create a new workload with a generated ID
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            namespace: "default".to_string(),
            labels: BTreeMap::new(),
            node_selector: BTreeMap::new(),
            requests: Resources::new(),
            affinity: None,
            topology_spread: Vec::new(),
            tolerations: Vec::new(),
            host_ports: Vec::new(),
            created_at: chrono::Utc::now(),
        }
    }

    /// Set the namespace
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Add a label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Require a node label
    pub fn with_node_selector(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.node_selector.insert(key.into(), value.into());
        self
    }

    /// Set resource requests
    pub fn with_requests(mut self, requests: Resources) -> Self {
        self.requests = requests;
        self
    }

    /// Set affinity
    pub fn with_affinity(mut self, affinity: Affinity) -> Self {
        self.affinity = Some(affinity);
        self
    }

    /// Add a topology spread constraint
    pub fn with_spread(mut self, constraint: TopologySpreadConstraint) -> Self {
        self.topology_spread.push(constraint);
        self
    }

    /// Add a toleration
    pub fn with_toleration(mut self, toleration: Toleration) -> Self {
        self.tolerations.push(toleration);
        self
    }

    /// Declare a host port
    pub fn with_host_port(mut self, host_port: HostPort) -> Self {
        self.host_ports.push(host_port);
        self
    }

    /// Node requirements this workload posts
    ///
    /// The heaviest preferred node-affinity group is treated as a requirement;
    /// the relaxer strips preferred groups one at a time when the workload
    /// fails to schedule.
    pub fn requirements(&self) -> Result<Requirements> {
        let mut requirements = Requirements::from_labels(&self.node_selector);
        let Some(node_affinity) = self.affinity.as_ref().and_then(|a| a.node_affinity.as_ref())
        else {
            return Ok(requirements);
        };
        if let Some(heaviest) = node_affinity.preferred.iter().max_by_key(|w| w.weight) {
            for expr in &heaviest.rule.match_expressions {
                requirements.add(Requirement::from_expression(expr)?)?;
            }
        }
        for rule in &node_affinity.required {
            for expr in &rule.match_expressions {
                requirements.add(Requirement::from_expression(expr)?)?;
            }
        }
        Ok(requirements)
    }

    /// Whether the workload tolerates a taint
    pub fn tolerates(&self, taint: &Taint) -> bool {
        self.tolerations.iter().any(|t| t.tolerates(taint))
    }
}

/// Check that a workload tolerates every taint in a list
pub(crate) fn ensure_tolerates(taints: &[Taint], workload: &Workload) -> Result<()> {
    for taint in taints {
        if !workload.tolerates(taint) {
            return Err(SkyliftError::TaintNotTolerated(taint.to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::requirements::ExpressionOperator;

    #[test]
    fn test_toleration_matching() {
        let taint = Taint::new("dedicated", "gpu", TaintEffect::NoSchedule);

        assert!(Toleration::equal("dedicated", "gpu").tolerates(&taint));
        assert!(!Toleration::equal("dedicated", "batch").tolerates(&taint));
        assert!(Toleration::exists("dedicated").tolerates(&taint));
        assert!(!Toleration::exists("other").tolerates(&taint));

        let effect_only = Toleration::any_with_effect(TaintEffect::PreferNoSchedule);
        assert!(!effect_only.tolerates(&taint));
        assert!(effect_only.tolerates(&Taint::new("x", "y", TaintEffect::PreferNoSchedule)));
    }

    #[test]
    fn test_ensure_tolerates_reports_taint() {
        let taints = vec![Taint::new("dedicated", "gpu", TaintEffect::NoSchedule)];
        let workload = Workload::new("api");
        let err = ensure_tolerates(&taints, &workload).unwrap_err();
        assert!(err.to_string().contains("dedicated=gpu"));

        let tolerant = Workload::new("api").with_toleration(Toleration::exists("dedicated"));
        assert!(ensure_tolerates(&taints, &tolerant).is_ok());
    }

    #[test]
    fn test_label_selector() {
        let selector = LabelSelector::new()
            .with_label("app", "web")
            .with_expression(ConstraintExpression::without("tier", ["canary"]));

        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "web".to_string());
        labels.insert("tier".to_string(), "stable".to_string());
        assert!(selector.matches(&labels));

        labels.insert("tier".to_string(), "canary".to_string());
        assert!(!selector.matches(&labels));
    }

    #[test]
    fn test_workload_requirements_use_heaviest_preference() {
        let affinity = Affinity::new().with_node_affinity(
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
        );
        let workload = Workload::new("api").with_affinity(affinity);
        let requirements = workload.requirements().unwrap();
        assert!(requirements.get("zone").unwrap().has("z2"));
        assert!(!requirements.get("zone").unwrap().has("z1"));
    }

    #[test]
    fn test_workload_requirements_combine_selector_and_required() {
        let affinity = Affinity::new().with_node_affinity(NodeAffinity::new().require(
            AffinityRule::new().with_expression(ConstraintExpression::new(
                "arch",
                ExpressionOperator::In,
                vec!["arm64".to_string(), "amd64".to_string()],
            )),
        ));
        let workload = Workload::new("api")
            .with_node_selector("arch", "arm64")
            .with_affinity(affinity);

        let requirements = workload.requirements().unwrap();
        assert!(requirements.get("arch").unwrap().has("arm64"));
        assert!(!requirements.get("arch").unwrap().has("amd64"));
    }

    #[test]
    fn test_host_port_defaults() {
        let port = HostPort::new(8080);
        assert_eq!(port.ip, "0.0.0.0");
        assert_eq!(port.protocol, Protocol::Tcp);
    }
}
