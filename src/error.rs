//! Error types for Skylift
//!
//! ## Table of Contents
//! - **SkyliftError**: Main error enum covering all failure modes
//! - **Result**: Type alias for `Result<T, SkyliftError>`

use thiserror::Error;

/// Result type alias for Skylift operations
pub type Result<T> = std::result::Result<T, SkyliftError>;

/// Main error type for Skylift operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SkyliftError {
    /// Requirement intersection drove a key to an empty value set
    #[error("incompatible requirements, key {0} has no feasible values")]
    IncompatibleRequirements(String),

    /// A declared host port collides with one already reserved on the node
    #[error("host port {port}/{protocol} conflicts with an existing reservation")]
    HostPortConflict {
        /// Colliding port number
        port: u16,
        /// Protocol of the colliding reservation
        protocol: String,
    },

    /// A node taint is not tolerated by the workload
    #[error("taint {0} is not tolerated")]
    TaintNotTolerated(String),

    /// No candidate instance type satisfies the accumulated requests and requirements
    #[error("no instance type satisfied resources {requests} and requirements {requirements}")]
    NoInstanceTypeFits {
        /// Requests that could not be satisfied
        requests: String,
        /// Requirements that could not be satisfied
        requirements: String,
    },

    /// An in-flight node cannot absorb the workload's requests
    #[error("exceeds remaining node resources {available}")]
    InsufficientCapacity {
        /// Resources still available on the node
        available: String,
    },

    /// Every candidate instance type would breach the provisioner's limits
    #[error("all available instance types exceed provisioner limits")]
    ProvisionerLimitExceeded,

    /// A topology constraint cannot be satisfied in any domain
    #[error("unsatisfiable topology constraint on {key}, {reason}")]
    TopologyInfeasible {
        /// Topology key of the failed constraint
        key: String,
        /// Why no domain is admissible
        reason: String,
    },

    /// A machine template rejected the workload
    #[error("incompatible with provisioner {provisioner:?}, {reason}")]
    ProvisionerIncompatible {
        /// Name of the rejecting provisioner
        provisioner: String,
        /// The underlying rejection
        reason: Box<SkyliftError>,
    },

    /// Collected rejections from every machine template
    #[error("{}", .0.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))]
    Multiple(Vec<SkyliftError>),

    /// The solve was cancelled via its cancellation handle
    #[error("scheduling cancelled")]
    Cancelled,

    /// Configuration error during setup
    #[error("configuration error: {0}")]
    Config(String),

    /// Metrics collection or registration failure
    #[error("metrics error: {0}")]
    Metrics(String),

    /// Internal error (should not occur in normal operation)
    #[error("internal error: {0}")]
    Internal(String),
}

impl SkyliftError {
    /// Create an incompatible-requirements error for a key
    pub fn incompatible(key: impl Into<String>) -> Self {
        Self::IncompatibleRequirements(key.into())
    }

    /// Create a topology infeasibility error
    pub fn topology(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TopologyInfeasible {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Collapse a list of rejections into a single error
    pub fn combine(mut errors: Vec<SkyliftError>) -> Self {
        if errors.len() == 1 {
            errors.remove(0)
        } else {
            Self::Multiple(errors)
        }
    }

    /// Whether this error is the cancellation signal
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<prometheus::Error> for SkyliftError {
    fn from(err: prometheus::Error) -> Self {
        Self::Metrics(err.to_string())
    }
}
