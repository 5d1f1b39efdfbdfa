//! Machine templates and instance types
//!
//! ## Table of Contents
//! - **labels**: well-known node label keys
//! - **Offering**: a (zone, capacity-type, availability) tuple
//! - **InstanceType**: a concrete machine shape offered by the cloud provider
//! - **MachineTemplate**: the per-provisioner prototype for a future node
//! - **Provisioner**: the user-supplied launch specification

use serde::{Deserialize, Serialize};

use crate::requirements::{Requirement, Requirements};
use crate::resources::Resources;
use crate::scheduler::workload::Taint;

/// Well-known node label keys
pub mod labels {
    /// Hostname label; every node carries exactly one value
    pub const HOSTNAME: &str = "skylift.io/hostname";
    /// Availability-zone label
    pub const ZONE: &str = "topology.skylift.io/zone";
    /// Capacity-type label (e.g. `on-demand`, `spot`)
    pub const CAPACITY_TYPE: &str = "skylift.io/capacity-type";
    /// Name of the provisioner that launched the node
    pub const PROVISIONER_NAME: &str = "skylift.io/provisioner-name";
}

/// A purchasable variant of an instance type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offering {
    /// Availability zone
    pub zone: String,
    /// Capacity type (e.g. `on-demand`, `spot`)
    pub capacity_type: String,
    /// Whether the offering can currently be launched
    pub available: bool,
}

impl Offering {
    /// Create an available offering
    pub fn new(zone: impl Into<String>, capacity_type: impl Into<String>) -> Self {
        Self {
            zone: zone.into(),
            capacity_type: capacity_type.into(),
            available: true,
        }
    }

    /// Mark the offering unavailable
    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }
}

/// A concrete machine shape offered by the cloud provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceType {
    /// Instance type name
    pub name: String,
    /// Advertised capacity per resource
    pub capacity: Resources,
    /// System-reserved overhead subtracted from capacity
    pub overhead: Resources,
    /// Labels a node of this type would carry
    pub requirements: Requirements,
    /// Purchasable variants
    pub offerings: Vec<Offering>,
}

impl InstanceType {
    /// Create an instance type with the given capacity
    pub fn new(name: impl Into<String>, capacity: Resources) -> Self {
        Self {
            name: name.into(),
            capacity,
            overhead: Resources::new(),
            requirements: Requirements::new(),
            offerings: Vec::new(),
        }
    }

    /// Set the system-reserved overhead
    pub fn with_overhead(mut self, overhead: Resources) -> Self {
        self.overhead = overhead;
        self
    }

    /// Set the labels a node of this type would carry
    pub fn with_requirements(mut self, requirements: Requirements) -> Self {
        self.requirements = requirements;
        self
    }

    /// Add an offering
    pub fn with_offering(mut self, offering: Offering) -> Self {
        self.offerings.push(offering);
        self
    }

    /// Iterate over offerings that can currently be launched
    pub fn available_offerings(&self) -> impl Iterator<Item = &Offering> {
        self.offerings.iter().filter(|o| o.available)
    }
}

/// The scheduling prototype for nodes a provisioner may launch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineTemplate {
    /// Name of the owning provisioner
    pub provisioner_name: String,
    /// Base requirements every derived node carries
    pub requirements: Requirements,
    /// Taints present only while the node boots
    pub startup_taints: Vec<Taint>,
    /// Taints present for the node's lifetime
    pub taints: Vec<Taint>,
}

impl MachineTemplate {
    /// Create a template for a provisioner
    ///
    /// The provisioner-name label is always part of the base requirements.
    pub fn new(provisioner_name: impl Into<String>) -> Self {
        let provisioner_name = provisioner_name.into();
        let mut requirements = Requirements::new();
        requirements.set(Requirement::within(
            labels::PROVISIONER_NAME,
            [provisioner_name.clone()],
        ));
        Self {
            provisioner_name,
            requirements,
            startup_taints: Vec::new(),
            taints: Vec::new(),
        }
    }

    /// Add a base requirement
    pub fn with_requirement(mut self, requirement: Requirement) -> Self {
        self.requirements.set(requirement);
        self
    }

    /// Add a startup taint
    pub fn with_startup_taint(mut self, taint: Taint) -> Self {
        self.startup_taints.push(taint);
        self
    }

    /// Add a lifetime taint
    pub fn with_taint(mut self, taint: Taint) -> Self {
        self.taints.push(taint);
        self
    }
}

/// User-supplied specification of what the autoscaler may launch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provisioner {
    /// Provisioner name
    pub name: String,
    /// Taints applied to launched nodes
    pub taints: Vec<Taint>,
    /// Total resource limits across all nodes of this provisioner
    pub limits: Option<Resources>,
}

impl Provisioner {
    /// Create a provisioner without limits
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            taints: Vec::new(),
            limits: None,
        }
    }

    /// Add a taint
    pub fn with_taint(mut self, taint: Taint) -> Self {
        self.taints.push(taint);
        self
    }

    /// Set resource limits
    pub fn with_limits(mut self, limits: Resources) -> Self {
        self.limits = Some(limits);
        self
    }
}
