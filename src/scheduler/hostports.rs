//! Host-port conflict tracking
//!
//! One tracker per node. A reservation is an (IP, port, protocol) tuple; the
//! wildcard IP `0.0.0.0` collides with every other IP on the same
//! port/protocol.

use crate::error::{Result, SkyliftError};
use crate::scheduler::workload::{HostPort, Protocol, Workload};

const WILDCARD_IP: &str = "0.0.0.0";

#[derive(Debug, Clone)]
struct Reservation {
    ip: String,
    port: u16,
    protocol: Protocol,
    workload_id: String,
}

impl Reservation {
    fn conflicts_with(&self, port: &HostPort) -> bool {
        self.port == port.port
            && self.protocol == port.protocol
            && (self.ip == port.ip || self.ip == WILDCARD_IP || port.ip == WILDCARD_IP)
    }
}

/// Tracks host ports reserved by workloads on a single node
#[derive(Debug, Clone, Default)]
pub struct HostPortUsage {
    reserved: Vec<Reservation>,
}

impl HostPortUsage {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Check that none of the workload's host ports collide
    pub fn validate(&self, workload: &Workload) -> Result<()> {
        for port in &workload.host_ports {
            if self.reserved.iter().any(|r| r.conflicts_with(port)) {
                return Err(SkyliftError::HostPortConflict {
                    port: port.port,
                    protocol: port.protocol.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Reserve the workload's host ports; call only after a successful validate
    pub fn add(&mut self, workload: &Workload) {
        for port in &workload.host_ports {
            self.reserved.push(Reservation {
                ip: port.ip.clone(),
                port: port.port,
                protocol: port.protocol,
                workload_id: workload.id.clone(),
            });
        }
    }

    /// Number of reserved ports
    pub fn len(&self) -> usize {
        self.reserved.len()
    }

    /// Whether no port is reserved
    pub fn is_empty(&self) -> bool {
        self.reserved.is_empty()
    }

    /// IDs of workloads holding reservations
    pub fn holders(&self) -> impl Iterator<Item = &str> {
        self.reserved.iter().map(|r| r.workload_id.as_str())
    }
}
